use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    TextEmbedding,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use crate::config::ModelKind;

/// Embedding 错误
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// CLIP 图文联合编码器 (fastembed / ONNX)
///
/// 图片和文本模型必须成对使用，才能落在同一个向量空间。
/// fastembed 的 `embed()` 需要 `&mut self`，所以各自包一层 Mutex。
pub struct ClipEmbedder {
    image_model: Mutex<ImageEmbedding>,
    text_model: Mutex<TextEmbedding>,
    kind: ModelKind,
}

impl ClipEmbedder {
    /// 加载模型，首次使用时会下载到 `cache_dir`
    pub fn new(kind: ModelKind, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create model cache dir: {}", e))
        })?;

        let (image_enum, text_enum) = match kind {
            ModelKind::ClipVitB32 => (ImageEmbeddingModel::ClipVitB32, EmbeddingModel::ClipVitB32),
            ModelKind::NomicV15 => (
                ImageEmbeddingModel::NomicEmbedVisionV15,
                EmbeddingModel::NomicEmbedTextV15,
            ),
        };

        info!(model = kind.as_str(), cache_dir = %cache_dir.display(), "loading embedding models");

        let image_model = ImageEmbedding::try_new(
            ImageInitOptions::new(image_enum)
                .with_cache_dir(cache_dir.clone())
                .with_show_download_progress(true),
        )
        .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let text_model = TextEmbedding::try_new(
            InitOptions::new(text_enum)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(true),
        )
        .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        Ok(Self {
            image_model: Mutex::new(image_model),
            text_model: Mutex::new(text_model),
            kind,
        })
    }
}

/// 图文联合编码能力
///
/// 调用是阻塞的，服务层在 `spawn_blocking` 中使用
pub trait Embedder: Send + Sync + 'static {
    /// 向量维度
    fn dimensions(&self) -> usize;

    /// 将图片编码为向量
    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError>;

    /// 将查询文本编码为向量
    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

impl Embedder for ClipEmbedder {
    fn dimensions(&self) -> usize {
        self.kind.dimensions()
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.image_model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![path], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        let embedding = embeddings.into_iter().next().ok_or_else(|| {
            EmbeddingError::EmbeddingFailed("No embedding returned".to_string())
        })?;

        check_dimensions(embedding, self.dimensions())
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.text_model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        let embedding = embeddings.into_iter().next().ok_or_else(|| {
            EmbeddingError::EmbeddingFailed("No embedding returned".to_string())
        })?;

        check_dimensions(embedding, self.dimensions())
    }
}

fn check_dimensions(embedding: Vec<f32>, expected: usize) -> Result<Vec<f32>, EmbeddingError> {
    if embedding.len() != expected {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: embedding.len(),
        });
    }
    Ok(embedding)
}
