//! 集成测试共用的内存实现
//!
//! - `MemoryStore`: 内存版 ImageStore，全文检索和文件名检索复用 db 模块的排序/匹配函数
//! - `KeywordEmbedder`: 按关键词生成向量，文件名含 "corrupt" 时编码失败
//! - `ScriptedOcr`: 按文件名返回预设文字，文件名含 "unreadable" 时识别失败
#![allow(dead_code)]

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use image_search_sidecar::config::SearchSettings;
use image_search_sidecar::db::{
    file_stem, filename_matches, query_tokens, rank_text_hits, CollectionStats, FilenameHit,
    ImageRecord, ImageStore, IndexState, VectorHit,
};
use image_search_sidecar::embedding::{Embedder, EmbeddingError};
use image_search_sidecar::ocr::{OcrError, TextRecognizer};
use image_search_sidecar::search::SearchService;

pub type TestService = SearchService<MemoryStore, KeywordEmbedder, ScriptedOcr>;

pub const OCR_MODEL: &str = "fake-ocr";

/// 内存版向量库，clone 后共享同一份数据
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<String, ImageRecord>>>,
    fail_search: bool,
}

impl MemoryStore {
    pub fn failing_search() -> Self {
        Self {
            fail_search: true,
            ..Default::default()
        }
    }

    pub fn record(&self, path: &str) -> Option<ImageRecord> {
        self.records.lock().unwrap().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
    1.0 - dot / (norm(a) * norm(b))
}

impl ImageStore for MemoryStore {
    async fn delete_except(&self, keep: &[String]) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .retain(|path, _| keep.contains(path));
        Ok(())
    }

    async fn upsert(&self, record: ImageRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.path.clone(), record);
        Ok(())
    }

    async fn get_state(&self, path: &str) -> Result<Option<IndexState>> {
        Ok(self.record(path).map(|r| IndexState {
            mtime: r.mtime,
            ocr_model: r.ocr_model,
        }))
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<ImageRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .find(|r| r.hash == hash)
            .cloned())
    }

    async fn search_embedding(
        &self,
        query_vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        if self.fail_search {
            anyhow::bail!("vector database unavailable");
        }

        let mut hits: Vec<VectorHit> = self
            .records
            .lock()
            .unwrap()
            .values()
            .map(|r| VectorHit {
                path: r.path.clone(),
                distance: cosine_distance(&query_vector, &r.embedding),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn search_ocr_text(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let tokens = query_tokens(query);
        let hits: Vec<(String, String)> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                let words = query_tokens(&r.ocr_content);
                tokens.iter().any(|t| words.contains(t))
            })
            .map(|r| (r.path.clone(), r.ocr_content.clone()))
            .collect();
        Ok(rank_text_hits(&tokens, hits, limit))
    }

    async fn search_filename(&self, query: &str, limit: usize) -> Result<Vec<FilenameHit>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| filename_matches(&r.filename, query))
            .take(limit)
            .map(|r| FilenameHit {
                path: r.path.clone(),
                filename: r.filename.clone(),
            })
            .collect())
    }

    async fn clear(&self, _dimensions: usize) -> Result<()> {
        self.records.lock().unwrap().clear();
        Ok(())
    }

    async fn stats(&self) -> Result<CollectionStats> {
        Ok(CollectionStats {
            total_points: self.records.lock().unwrap().len() as u64,
            collection_name: "memory".to_string(),
        })
    }
}

const VOCABULARY: [&str; 4] = ["cat", "dog", "sunset", "receipt"];

/// 每个关键词占一维，最后一维是常数，避免零向量
fn keyword_vector(text: &str) -> Vec<f32> {
    let text = text.to_lowercase();
    let mut vector: Vec<f32> = VOCABULARY
        .iter()
        .map(|w| if text.contains(w) { 1.0 } else { 0.0 })
        .collect();
    vector.push(0.1);
    vector
}

/// 图片向量由文件名决定：`cat.png` 与查询 "cat" 距离为 0，与其他查询距离约 0.9
#[derive(Default)]
pub struct KeywordEmbedder {
    image_calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }
}

impl Embedder for KeywordEmbedder {
    fn dimensions(&self) -> usize {
        VOCABULARY.len() + 1
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        let stem = file_stem(&path.to_string_lossy());
        if stem.contains("corrupt") {
            return Err(EmbeddingError::EmbeddingFailed(
                "cannot decode image".to_string(),
            ));
        }
        Ok(keyword_vector(&stem))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(keyword_vector(text))
    }
}

/// 按文件名 (不含扩展名) 返回预设文字，没有预设的视为图片里没有文字
pub struct ScriptedOcr {
    texts: BTreeMap<String, String>,
}

impl ScriptedOcr {
    pub fn new(texts: &[(&str, &str)]) -> Self {
        Self {
            texts: texts
                .iter()
                .map(|(stem, text)| (stem.to_string(), text.to_string()))
                .collect(),
        }
    }
}

impl TextRecognizer for ScriptedOcr {
    fn model_name(&self) -> &str {
        OCR_MODEL
    }

    async fn extract_texts(&self, paths: &[String]) -> Vec<Result<Option<String>, OcrError>> {
        paths
            .iter()
            .map(|path| {
                let stem = file_stem(path);
                if stem.contains("unreadable") {
                    return Err(OcrError::Service("model returned 500".to_string()));
                }
                Ok(self.texts.get(&stem).cloned())
            })
            .collect()
    }
}

/// 写入一个内容唯一的文件 (内容取自文件名)，返回路径
pub fn write_image(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("image bytes of {}", name)).unwrap();
    path.to_string_lossy().to_string()
}

pub fn service(
    store: MemoryStore,
    embedder: Arc<KeywordEmbedder>,
    ocr: Option<ScriptedOcr>,
) -> TestService {
    let settings = SearchSettings {
        ocr_batch_size: 2,
        ..Default::default()
    };
    SearchService::from_parts(store, embedder, ocr, settings)
}
