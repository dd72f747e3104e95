//! OCR：图片预处理 + Ollama 视觉模型识别
//!
//! 预处理 (解码、统一转换为 RGB、重新编码) 在有界 rayon 线程池里并发执行，
//! 识别请求通过 HTTP 发给 Ollama，识别结果再做一次质量过滤。
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, ImageFormat};
use rayon::prelude::*;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

const OCR_PROMPT: &str = "Transcribe all legible text in this image exactly as written. \
Reply with the text only. If the image contains no text, reply with an empty message.";

/// OCR 错误
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Ollama API error: {0}")]
    Service(String),

    #[error("thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("preprocessing task failed: {0}")]
    Join(String),
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Ollama OCR 客户端
pub struct OcrClient {
    client: Client,
    base_url: String,
    model: String,
    pool: Arc<rayon::ThreadPool>,
}

impl OcrClient {
    /// 创建客户端
    ///
    /// # 参数
    /// - `base_url`: Ollama 服务地址
    /// - `model`: 视觉模型名称
    /// - `threads`: 预处理线程数
    pub fn new(base_url: &str, model: &str, threads: usize) -> Result<Self, OcrError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ocr-prep-{}", i))
            .build()?;

        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            pool: Arc::new(pool),
        })
    }

    /// 并发预处理一批图片，结果与输入一一对应
    pub async fn prepare_batch(
        &self,
        paths: &[String],
    ) -> Result<Vec<Result<String, OcrError>>, OcrError> {
        let pool = Arc::clone(&self.pool);
        let paths = paths.to_vec();

        tokio::task::spawn_blocking(move || {
            pool.install(|| {
                paths
                    .par_iter()
                    .map(|p| prepare_image(Path::new(p)))
                    .collect::<Vec<_>>()
            })
        })
        .await
        .map_err(|e| OcrError::Join(e.to_string()))
    }

    /// 识别单张已编码的图片
    pub async fn recognize(&self, image_b64: String) -> Result<Option<String>, OcrError> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: &self.model,
            prompt: OCR_PROMPT,
            images: vec![image_b64],
            stream: false,
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(OcrError::Service(error_text));
        }

        let body: GenerateResponse = response.json().await?;
        debug!(raw = %body.response, "ocr response");

        Ok(clean_ocr_text(&body.response))
    }

    /// 检查 Ollama 服务是否可用
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);

        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// 图片文字识别能力
pub trait TextRecognizer: Send + Sync + 'static {
    /// 识别模型名称，随记录一起存储，用来判断记录是否经过这个模型的 OCR
    fn model_name(&self) -> &str;

    /// 提取一批图片中的文字
    ///
    /// 返回值与 `paths` 按位置对应；`Ok(None)` 表示图片里没有可用文字
    fn extract_texts(
        &self,
        paths: &[String],
    ) -> impl Future<Output = Vec<Result<Option<String>, OcrError>>> + Send;
}

impl TextRecognizer for OcrClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn extract_texts(&self, paths: &[String]) -> Vec<Result<Option<String>, OcrError>> {
        let prepared = match self.prepare_batch(paths).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("OCR preprocessing failed for whole batch: {}", e);
                let msg = e.to_string();
                return paths.iter().map(|_| Err(OcrError::Join(msg.clone()))).collect();
            }
        };

        let mut texts = Vec::with_capacity(prepared.len());
        for item in prepared {
            let text = match item {
                Ok(image_b64) => self.recognize(image_b64).await,
                Err(e) => Err(e),
            };
            texts.push(text);
        }

        texts
    }
}

/// 解码图片并统一转换为 RGB (去掉 alpha 通道、灰度扩展为三通道)，输出 base64 PNG
pub fn prepare_image(path: &Path) -> Result<String, OcrError> {
    let img = image::open(path)?;
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());

    let mut buf = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;

    Ok(STANDARD.encode(&buf))
}

fn code_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*```[a-zA-Z]*\s*$").unwrap())
}

fn no_text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\W*(there is )?no (legible |visible |readable )?text( (found|detected|in (this|the) image))?\W*$")
            .unwrap()
    })
}

/// 过滤 OCR 结果
///
/// 以下情况视为没有文字：
/// - 空文本，或模型回复"没有文字"
/// - 不含任何字母，或长度不足 3 个字符
/// - 没有任何长度大于 1 的纯字母单词 (识别噪声通常是零散的单个字母)
pub fn clean_ocr_text(raw: &str) -> Option<String> {
    let stripped = code_fence_re().replace_all(raw, "");
    let text = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    if text.is_empty() || no_text_re().is_match(&text) {
        return None;
    }

    if !text.chars().any(char::is_alphabetic) || text.chars().count() < 3 {
        return None;
    }

    let has_word = text.split(' ').any(|w| {
        let w = w.trim_matches(|c: char| !c.is_alphanumeric());
        w.chars().count() > 1 && w.chars().all(char::is_alphabetic)
    });

    if !has_word {
        return None;
    }

    Some(text)
}
