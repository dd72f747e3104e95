use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use crate::config::{Config, SearchSettings};
use crate::db::{
    file_stem, CollectionStats, FilenameHit, ImageRecord, ImageStore, VectorDB, VectorHit,
};
use crate::embedding::{ClipEmbedder, Embedder};
use crate::ocr::{OcrClient, OcrError, TextRecognizer};

/// 命中来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchMode {
    /// OCR 全文检索命中
    Ocr,
    /// CLIP 向量检索命中
    Clip,
}

/// 合并后的检索结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: String,
    pub mode: MatchMode,
    /// 余弦距离，OCR 命中固定为 0
    pub distance: f32,
}

/// 单个文件的索引失败
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFailure {
    pub path: String,
    pub error: String,
}

/// 一次索引请求的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexReport {
    /// 新增或更新的记录数
    pub indexed: usize,
    /// 未修改而跳过的文件数
    pub skipped: usize,
    pub failed: Vec<IndexFailure>,
}

impl IndexReport {
    fn fail(&mut self, path: &str, error: impl std::fmt::Display) {
        warn!("Failed to process {}: {}", path, error);
        self.failed.push(IndexFailure {
            path: path.to_string(),
            error: error.to_string(),
        });
    }
}

/// 合并 OCR 与 CLIP 检索结果
///
/// OCR 命中优先 (距离记为 0)；CLIP 命中只保留距离严格小于 `max_distance` 的。
/// 同一路径只保留第一次出现的结果。
pub fn merge_results(
    ocr_paths: &[String],
    clip_hits: &[VectorHit],
    max_distance: f32,
) -> Vec<SearchHit> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut merged = Vec::new();

    for path in ocr_paths {
        if path.is_empty() || !seen.insert(path.as_str()) {
            continue;
        }
        debug!("[OCR] {}", path);
        merged.push(SearchHit {
            path: path.clone(),
            mode: MatchMode::Ocr,
            distance: 0.0,
        });
    }

    for hit in clip_hits {
        if hit.path.is_empty() || hit.distance >= max_distance || seen.contains(hit.path.as_str()) {
            continue;
        }
        seen.insert(hit.path.as_str());
        debug!("[CLIP] {} ({:.3})", hit.path, hit.distance);
        merged.push(SearchHit {
            path: hit.path.clone(),
            mode: MatchMode::Clip,
            distance: hit.distance,
        });
    }

    merged
}

/// HTTP 层依赖的检索能力
pub trait ImageSearch: Send + Sync + 'static {
    /// 以 `paths` 为完整列表重建索引
    fn index(&self, paths: Vec<String>) -> impl Future<Output = Result<IndexReport>> + Send;

    fn search(&self, query: &str) -> impl Future<Output = Result<Vec<SearchHit>>> + Send;

    fn search_filename(
        &self,
        query: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<FilenameHit>>> + Send;

    fn clear(&self) -> impl Future<Output = Result<()>> + Send;

    fn stats(&self) -> impl Future<Output = Result<CollectionStats>> + Send;
}

/// 文件修改时间 (毫秒)
async fn file_mtime(path: &str) -> Result<i64> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot stat {}", path))?;
    let modified = metadata.modified()?;
    Ok(modified.duration_since(UNIX_EPOCH)?.as_millis() as i64)
}

/// 文件内容的 SHA-256 (十六进制)
async fn file_hash(path: &str) -> Result<String> {
    let path = PathBuf::from(path);
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .context("hashing task panicked")?
}

/// 单个文件在本次索引中的处理方式
enum Plan {
    /// 修改时间和 OCR 状态都没变
    Skip,
    /// 已有相同内容的记录 (文件被移动或复制)，沿用其向量和 OCR 结果
    Reuse(ImageRecord),
    /// 需要重新 OCR 和编码
    Process { mtime: i64, hash: String },
}

/// 搜索服务 - 整合 CLIP embedding + OCR + 向量库
pub struct SearchService<S = VectorDB, E = ClipEmbedder, R = OcrClient> {
    store: S,
    embedder: Arc<E>,
    /// None 时为纯 CLIP 模式
    ocr: Option<R>,
    settings: SearchSettings,
}

impl SearchService {
    /// 创建新的搜索服务
    pub async fn new(config: &Config) -> Result<Self> {
        let db = VectorDB::new(&config.qdrant_url, &config.collection_name).await?;

        let kind = config.model;
        let cache_dir = config.model_cache_dir.clone();
        let embedder = tokio::task::spawn_blocking(move || ClipEmbedder::new(kind, cache_dir))
            .await
            .context("model loading task panicked")??;

        db.init_collection(embedder.dimensions()).await?;

        let ocr = if config.ocr_enabled {
            let client = OcrClient::new(&config.ollama_url, &config.ocr_model, config.ocr_threads)?;
            if !client.health_check().await {
                warn!(
                    "Ollama is not reachable at {}, OCR will fail until it is up",
                    config.ollama_url
                );
            }
            Some(client)
        } else {
            info!("OCR disabled, running in CLIP-only mode");
            None
        };

        Ok(Self::from_parts(db, Arc::new(embedder), ocr, config.search.clone()))
    }
}

impl<S: ImageStore, E: Embedder, R: TextRecognizer> SearchService<S, E, R> {
    pub fn from_parts(
        store: S,
        embedder: Arc<E>,
        ocr: Option<R>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            ocr,
            settings,
        }
    }

    /// 索引图片
    ///
    /// 1. 逐个检查文件：修改时间和 OCR 状态都没变的跳过；内容哈希已存在的沿用旧记录
    /// 2. 删除不在 `paths` 中的记录
    /// 3. 写入沿用的记录，其余文件分批 OCR，逐个计算 CLIP 向量并 upsert
    ///
    /// 所有读取都在删除之前完成，被移动的文件在删除前还能按哈希找到旧记录。
    /// 单个文件失败只记录在报告中，不会中断整批
    pub async fn index_paths(&self, paths: &[String]) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        let mut reused: Vec<ImageRecord> = Vec::new();
        let mut pending: Vec<(String, i64, String)> = Vec::new();

        for path in paths {
            match self.plan(path).await {
                Ok(Plan::Skip) => {
                    debug!("No change for {}", path);
                    report.skipped += 1;
                }
                Ok(Plan::Reuse(record)) => reused.push(record),
                Ok(Plan::Process { mtime, hash }) => pending.push((path.clone(), mtime, hash)),
                Err(e) => report.fail(path, format!("{:#}", e)),
            }
        }

        self.store
            .delete_except(paths)
            .await
            .context("failed to delete stale records")?;

        for record in reused {
            let path = record.path.clone();
            match self.store.upsert(record).await {
                Ok(()) => {
                    report.indexed += 1;
                    info!("Same content already indexed, path updated for {}", path);
                }
                Err(e) => report.fail(&path, format!("{:#}", e)),
            }
        }

        for chunk in pending.chunks(self.settings.ocr_batch_size.max(1)) {
            let chunk_paths: Vec<String> = chunk.iter().map(|(p, _, _)| p.clone()).collect();
            let texts = self.extract_texts(&chunk_paths).await;

            for ((path, mtime, hash), text) in chunk.iter().zip(texts) {
                let ocr_content = match text {
                    Ok(text) => text.unwrap_or_default(),
                    Err(e) => {
                        report.fail(path, format!("ocr: {}", e));
                        continue;
                    }
                };

                match self.index_one(path, *mtime, hash, ocr_content).await {
                    Ok(()) => {
                        report.indexed += 1;
                        info!("Upserted data for {}", file_stem(path));
                    }
                    Err(e) => report.fail(path, format!("{:#}", e)),
                }
            }
        }

        info!(
            indexed = report.indexed,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Indexing completed"
        );
        Ok(report)
    }

    async fn plan(&self, path: &str) -> Result<Plan> {
        let mtime = file_mtime(path).await?;

        if let Some(state) = self.store.get_state(path).await? {
            if state.mtime == mtime && self.ocr_is_current(&state.ocr_model) {
                return Ok(Plan::Skip);
            }
        }

        let hash = file_hash(path).await?;

        match self.store.find_by_hash(&hash).await? {
            Some(found) if self.ocr_is_current(&found.ocr_model) => {
                Ok(Plan::Reuse(ImageRecord {
                    path: path.to_string(),
                    filename: file_stem(path),
                    hash,
                    mtime,
                    ..found
                }))
            }
            _ => Ok(Plan::Process { mtime, hash }),
        }
    }

    /// 记录里的 OCR 结果在当前配置下是否可用
    ///
    /// 纯 CLIP 模式不读 OCR 文本，总是可用；否则必须由当前 OCR 模型生成
    fn ocr_is_current(&self, ocr_model: &str) -> bool {
        match &self.ocr {
            Some(ocr) => ocr.model_name() == ocr_model,
            None => true,
        }
    }

    async fn extract_texts(&self, paths: &[String]) -> Vec<Result<Option<String>, OcrError>> {
        match &self.ocr {
            Some(ocr) => ocr.extract_texts(paths).await,
            None => paths.iter().map(|_| Ok(None)).collect(),
        }
    }

    async fn index_one(
        &self,
        path: &str,
        mtime: i64,
        hash: &str,
        ocr_content: String,
    ) -> Result<()> {
        let embedder = Arc::clone(&self.embedder);
        let image_path = PathBuf::from(path);
        let embedding = tokio::task::spawn_blocking(move || embedder.embed_image(&image_path))
            .await
            .context("embedding task panicked")??;

        let ocr_model = self
            .ocr
            .as_ref()
            .map(|ocr| ocr.model_name().to_string())
            .unwrap_or_default();

        self.store
            .upsert(ImageRecord {
                path: path.to_string(),
                filename: file_stem(path),
                ocr_content,
                ocr_model,
                hash: hash.to_string(),
                embedding,
                mtime,
            })
            .await
    }

    /// 语义搜索：CLIP 向量检索 + (可选) OCR 全文检索，合并结果
    pub async fn search_images(&self, query: &str) -> Result<Vec<SearchHit>> {
        let embedder = Arc::clone(&self.embedder);
        let text = query.to_string();
        let query_vector = tokio::task::spawn_blocking(move || embedder.embed_text(&text))
            .await
            .context("embedding task panicked")??;

        let clip_hits = self
            .store
            .search_embedding(query_vector, self.settings.top_k)
            .await?;

        let ocr_paths = if self.ocr.is_some() {
            self.store
                .search_ocr_text(query, self.settings.ocr_limit)
                .await?
        } else {
            Vec::new()
        };

        Ok(merge_results(
            &ocr_paths,
            &clip_hits,
            self.settings.max_distance,
        ))
    }
}

impl<S: ImageStore, E: Embedder, R: TextRecognizer> ImageSearch for SearchService<S, E, R> {
    async fn index(&self, paths: Vec<String>) -> Result<IndexReport> {
        self.index_paths(&paths).await
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        self.search_images(query).await
    }

    async fn search_filename(&self, query: &str, limit: usize) -> Result<Vec<FilenameHit>> {
        self.store.search_filename(query, limit).await
    }

    async fn clear(&self) -> Result<()> {
        self.store.clear(self.embedder.dimensions()).await
    }

    async fn stats(&self) -> Result<CollectionStats> {
        self.store.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, distance: f32) -> VectorHit {
        VectorHit {
            path: path.to_string(),
            distance,
        }
    }

    fn paths(ps: &[&str]) -> Vec<String> {
        ps.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_ocr_hits_come_first() {
        let merged = merge_results(
            &paths(&["/b.png", "/a.png"]),
            &[hit("/c.png", 0.2), hit("/d.png", 0.3)],
            0.75,
        );

        let order: Vec<&str> = merged.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(order, vec!["/b.png", "/a.png", "/c.png", "/d.png"]);
        assert_eq!(merged[0].mode, MatchMode::Ocr);
        assert_eq!(merged[0].distance, 0.0);
        assert_eq!(merged[2].mode, MatchMode::Clip);
        assert!((merged[2].distance - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_ocr_takes_priority_for_same_path() {
        let merged = merge_results(&paths(&["/a.png"]), &[hit("/a.png", 0.1)], 0.75);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].mode, MatchMode::Ocr);
    }

    #[test]
    fn test_distance_cutoff_is_strict() {
        let merged = merge_results(
            &[],
            &[hit("/near.png", 0.5), hit("/edge.png", 0.75), hit("/far.png", 0.9)],
            0.75,
        );

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].path, "/near.png");
    }

    #[test]
    fn test_cutoff_does_not_apply_to_ocr() {
        let merged = merge_results(&paths(&["/text.png"]), &[hit("/text.png", 1.5)], 0.75);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].mode, MatchMode::Ocr);
    }

    #[test]
    fn test_duplicates_and_empty_paths_skipped() {
        let merged = merge_results(
            &paths(&["", "/a.png", "/a.png"]),
            &[hit("", 0.1), hit("/b.png", 0.2), hit("/b.png", 0.1)],
            0.75,
        );

        let order: Vec<&str> = merged.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(order, vec!["/a.png", "/b.png"]);
        assert!((merged[1].distance - 0.2).abs() < f32::EPSILON, "保留第一次出现的距离");
    }

    #[test]
    fn test_match_mode_serialization() {
        let json = serde_json::to_string(&SearchHit {
            path: "/a.png".to_string(),
            mode: MatchMode::Clip,
            distance: 0.5,
        })
        .unwrap();

        assert_eq!(json, r#"{"path":"/a.png","mode":"CLIP","distance":0.5}"#);
        assert_eq!(serde_json::to_string(&MatchMode::Ocr).unwrap(), r#""OCR""#);
    }

    #[tokio::test]
    async fn test_file_mtime_missing_file() {
        assert!(file_mtime("/nonexistent/image.png").await.is_err());
    }

    #[tokio::test]
    async fn test_file_hash_follows_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();

        let hash_a = file_hash(&a.to_string_lossy()).await.unwrap();
        let hash_b = file_hash(&b.to_string_lossy()).await.unwrap();
        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a.len(), 64);

        std::fs::write(&b, b"other bytes").unwrap();
        assert_ne!(file_hash(&b.to_string_lossy()).await.unwrap(), hash_a);
        assert!(file_hash("/nonexistent/image.png").await.is_err());
    }

    // 集成测试需要 Qdrant、Ollama 和模型文件
    #[tokio::test]
    #[ignore] // 默认忽略，需要手动运行
    async fn test_index_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("red.png");
        image::RgbImage::from_pixel(64, 64, image::Rgb([255, 0, 0]))
            .save(&img)
            .unwrap();
        let img = img.to_string_lossy().to_string();

        let mut config = Config::default();
        config.collection_name = "test_index_and_search".to_string();
        config.ocr_enabled = false;
        config.search.max_distance = 2.0;
        let service = SearchService::new(&config).await.unwrap();
        service.clear().await.unwrap();

        let report = service.index_paths(&[img.clone()]).await.unwrap();
        assert_eq!(report.indexed, 1);

        let again = service.index_paths(&[img.clone()]).await.unwrap();
        assert_eq!(again.skipped, 1, "未修改的文件应被跳过");

        let results = service.search_images("a red square").await.unwrap();
        assert_eq!(results[0].path, img);

        service.index_paths(&[]).await.unwrap();
        assert_eq!(service.stats().await.unwrap().total_points, 0);
    }
}
