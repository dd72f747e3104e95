//! 配置模块：统一管理模型、向量库和检索相关的参数
//!
//! 常量为默认值，运行时可通过环境变量 (或 `.env` 文件) 覆盖
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Qdrant 服务地址
pub const QDRANT_URL: &str = "http://localhost:6334";

/// 图片集合名称
pub const COLLECTION_NAME: &str = "image_data";

/// HTTP 端口
pub const PORT: u16 = 37338;

/// 模型缓存目录
pub const MODEL_CACHE_DIR: &str = "data/models";

/// Ollama 服务地址 (OCR 视觉模型)
pub const OLLAMA_URL: &str = "http://localhost:11434";

/// OCR 视觉模型名称
pub const OCR_MODEL: &str = "minicpm-v";

/// 每批 OCR 的图片数量
pub const OCR_BATCH_SIZE: usize = 10;

/// CLIP 向量检索返回数量
pub const SEARCH_TOP_K: usize = 10;

/// CLIP 结果的余弦距离上限 (严格小于)
pub const MAX_DISTANCE: f32 = 0.75;

/// 全文检索返回数量上限
pub const OCR_LIMIT: usize = 50;

/// 支持的 embedding 模型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// CLIP ViT-B/32, 512 维
    ClipVitB32,
    /// Nomic embed vision/text v1.5, 768 维
    NomicV15,
}

impl ModelKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "clip-vit-b32" | "clip" | "vit-b/32" => Some(ModelKind::ClipVitB32),
            "nomic-embed-v1.5" | "nomic" => Some(ModelKind::NomicV15),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::ClipVitB32 => "clip-vit-b32",
            ModelKind::NomicV15 => "nomic-embed-v1.5",
        }
    }

    /// 向量维度
    pub fn dimensions(&self) -> usize {
        match self {
            ModelKind::ClipVitB32 => 512,
            ModelKind::NomicV15 => 768,
        }
    }
}

/// 检索参数
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub top_k: usize,
    pub max_distance: f32,
    pub ocr_limit: usize,
    pub ocr_batch_size: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            top_k: SEARCH_TOP_K,
            max_distance: MAX_DISTANCE,
            ocr_limit: OCR_LIMIT,
            ocr_batch_size: OCR_BATCH_SIZE,
        }
    }
}

/// 运行时配置
#[derive(Debug, Clone)]
pub struct Config {
    pub qdrant_url: String,
    pub collection_name: String,
    pub port: u16,
    pub model: ModelKind,
    pub model_cache_dir: PathBuf,
    pub ollama_url: String,
    pub ocr_model: String,
    /// 关闭后退化为纯 CLIP 检索
    pub ocr_enabled: bool,
    pub ocr_threads: usize,
    pub search: SearchSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            qdrant_url: QDRANT_URL.to_string(),
            collection_name: COLLECTION_NAME.to_string(),
            port: PORT,
            model: ModelKind::ClipVitB32,
            model_cache_dir: PathBuf::from(MODEL_CACHE_DIR),
            ollama_url: OLLAMA_URL.to_string(),
            ocr_model: OCR_MODEL.to_string(),
            ocr_enabled: true,
            ocr_threads: default_ocr_threads(),
            search: SearchSettings::default(),
        }
    }
}

fn default_ocr_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Config {
    /// 读取 `.env` 与环境变量
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意 key-value 来源构建配置，未设置的项使用默认值
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(v) = lookup("QDRANT_URL") {
            config.qdrant_url = v;
        }
        if let Some(v) = lookup("COLLECTION_NAME") {
            config.collection_name = v;
        }
        if let Some(v) = lookup("PORT") {
            config.port = v.parse().with_context(|| format!("invalid PORT: {}", v))?;
        }
        if let Some(v) = lookup("EMBEDDING_MODEL") {
            config.model = ModelKind::parse(&v).with_context(|| {
                format!(
                    "unknown EMBEDDING_MODEL: {} (supported: clip-vit-b32, nomic-embed-v1.5)",
                    v
                )
            })?;
        }
        if let Some(v) = lookup("MODEL_CACHE_DIR") {
            config.model_cache_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("OLLAMA_URL") {
            config.ollama_url = v;
        }
        if let Some(v) = lookup("OCR_MODEL") {
            config.ocr_model = v;
        }
        if let Some(v) = lookup("OCR_ENABLED") {
            config.ocr_enabled = parse_bool(&v)
                .with_context(|| format!("invalid OCR_ENABLED: {}", v))?;
        }
        if let Some(v) = lookup("OCR_THREADS") {
            config.ocr_threads = parse_positive(&v, "OCR_THREADS")?;
        }
        if let Some(v) = lookup("OCR_BATCH_SIZE") {
            config.search.ocr_batch_size = parse_positive(&v, "OCR_BATCH_SIZE")?;
        }
        if let Some(v) = lookup("SEARCH_TOP_K") {
            config.search.top_k = parse_positive(&v, "SEARCH_TOP_K")?;
        }
        if let Some(v) = lookup("OCR_LIMIT") {
            config.search.ocr_limit = parse_positive(&v, "OCR_LIMIT")?;
        }
        if let Some(v) = lookup("MAX_DISTANCE") {
            let d: f32 = v
                .parse()
                .with_context(|| format!("invalid MAX_DISTANCE: {}", v))?;
            if !(0.0..=2.0).contains(&d) {
                anyhow::bail!("MAX_DISTANCE must be within [0, 2], got {}", d);
            }
            config.search.max_distance = d;
        }

        Ok(config)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_positive(s: &str, key: &str) -> Result<usize> {
    let n: usize = s
        .trim()
        .parse()
        .with_context(|| format!("invalid {}: {}", key, s))?;
    if n == 0 {
        anyhow::bail!("{} must be greater than 0", key);
    }
    Ok(n)
}
