use anyhow::Result;
use qdrant_client::qdrant::vectors_output::VectorsOptions;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, DeletePointsBuilder,
    Distance, FieldType, Filter, GetPointsBuilder, PointId, PointStruct, RetrievedPoint,
    ScrollPointsBuilder, SearchPointsBuilder, TextIndexParamsBuilder, TokenizerType,
    UpsertPointsBuilder, Value, VectorParamsBuilder, VectorsOutput,
};
use qdrant_client::Qdrant;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};
use uuid::Uuid;

/// scroll 每页的点数
const SCROLL_PAGE_SIZE: u32 = 256;

/// 集合统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub total_points: u64,
    pub collection_name: String,
}

/// 一张已索引的图片
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    /// 文件路径 (唯一键)
    pub path: String,
    /// 不含扩展名的文件名
    pub filename: String,
    /// OCR 文本，可能为空
    pub ocr_content: String,
    /// 生成 `ocr_content` 的 OCR 模型，未做 OCR 时为空
    pub ocr_model: String,
    /// 文件内容的 SHA-256 (十六进制)
    pub hash: String,
    pub embedding: Vec<f32>,
    /// 文件修改时间 (毫秒)
    pub mtime: i64,
}

/// 已存储记录的索引状态，用于判断文件是否需要重新处理
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexState {
    pub mtime: i64,
    pub ocr_model: String,
}

/// 向量检索命中
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub path: String,
    /// 余弦距离 (0 表示完全相同)
    pub distance: f32,
}

/// 文件名检索命中
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilenameHit {
    pub path: String,
    pub filename: String,
}

/// 路径 -> Point ID
///
/// 对路径做 UUIDv5，同一路径总是落在同一个点上，upsert 即按路径去重
pub fn point_id(path: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, path.as_bytes()).to_string()
}

/// 不含扩展名的文件名
pub fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Qdrant 余弦相似度 -> 余弦距离
pub fn distance_from_score(score: f32) -> f32 {
    1.0 - score
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\p{L}\p{N}]+").unwrap())
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    token_re().find_iter(text).map(|m| m.as_str().to_lowercase())
}

/// 将查询切分为小写词条 (去重，保持顺序)
pub fn query_tokens(query: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in words(query) {
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

/// 对全部全文检索命中排序并截断到 `limit`
///
/// 先比较命中的不同词条数，再比较词条出现的总次数；都相同时保持原顺序
pub fn rank_text_hits(
    tokens: &[String],
    hits: Vec<(String, String)>,
    limit: usize,
) -> Vec<String> {
    let mut scored: Vec<((usize, usize), String)> = hits
        .into_iter()
        .map(|(path, content)| {
            let content_words: Vec<String> = words(&content).collect();
            let matched = tokens.iter().filter(|t| content_words.contains(t)).count();
            let occurrences = content_words.iter().filter(|w| tokens.contains(w)).count();
            ((matched, occurrences), path)
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored
        .into_iter()
        .take(limit)
        .map(|(_, path)| path)
        .collect()
}

/// 文件名是否包含查询串 (不区分大小写的子串匹配，空查询匹配全部)
pub fn filename_matches(filename: &str, query: &str) -> bool {
    filename.to_lowercase().contains(&query.to_lowercase())
}

/// 按游标逐页拉取，直到没有下一页
pub async fn collect_pages<C, T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<C>) -> Fut,
    Fut: Future<Output = Result<(Vec<T>, Option<C>)>>,
{
    let mut items = Vec::new();
    let mut cursor = None;

    loop {
        let (page, next) = fetch(cursor.take()).await?;
        items.extend(page);
        match next {
            Some(next) => cursor = Some(next),
            None => return Ok(items),
        }
    }
}

fn payload_str(payload: &HashMap<String, Value>, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .unwrap_or_default()
}

fn payload_int(payload: &HashMap<String, Value>, key: &str) -> Option<i64> {
    payload.get(key).and_then(|v| v.as_integer())
}

#[allow(deprecated)]
fn dense_vector(vectors: Option<VectorsOutput>) -> Option<Vec<f32>> {
    match vectors?.vectors_options? {
        VectorsOptions::Vector(vector) => Some(vector.data),
        _ => None,
    }
}

/// 图片记录的存储
///
/// 服务层只通过这个 trait 访问向量库
pub trait ImageStore: Send + Sync + 'static {
    /// 删除所有不在 `keep` 中的记录；`keep` 为空时清空全部记录
    fn delete_except(&self, keep: &[String]) -> impl Future<Output = Result<()>> + Send;

    /// 按路径 upsert
    fn upsert(&self, record: ImageRecord) -> impl Future<Output = Result<()>> + Send;

    /// 已存储记录的索引状态，记录不存在时返回 None
    fn get_state(&self, path: &str) -> impl Future<Output = Result<Option<IndexState>>> + Send;

    /// 任意一条内容哈希相同的记录 (带向量)
    fn find_by_hash(
        &self,
        hash: &str,
    ) -> impl Future<Output = Result<Option<ImageRecord>>> + Send;

    /// 向量检索，按距离从近到远排序
    fn search_embedding(
        &self,
        query_vector: Vec<f32>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<VectorHit>>> + Send;

    /// 在 OCR 文本上做全文检索，返回路径列表
    ///
    /// 任一词条命中即可，在全部命中上排序后取前 `limit` 个
    fn search_ocr_text(
        &self,
        query: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// 按文件名子串检索
    fn search_filename(
        &self,
        query: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<FilenameHit>>> + Send;

    /// 清空并按 `dimensions` 重建集合
    fn clear(&self, dimensions: usize) -> impl Future<Output = Result<()>> + Send;

    fn stats(&self) -> impl Future<Output = Result<CollectionStats>> + Send;
}

pub struct VectorDB {
    client: Qdrant,
    collection_name: String,
}

impl VectorDB {
    /// 连接到 Qdrant (默认为 localhost:6334)
    pub async fn new(uri: &str, collection_name: &str) -> Result<Self> {
        let client = Qdrant::from_url(uri).build()?;
        Ok(Self {
            client,
            collection_name: collection_name.to_string(),
        })
    }

    /// 初始化集合 Schema
    ///
    /// 向量使用余弦距离；`path` / `hash` 建关键字索引，`ocr_content` 建全文索引
    pub async fn init_collection(&self, dimensions: usize) -> Result<()> {
        if self.client.collection_exists(&self.collection_name).await? {
            info!("Collection '{}' already exists.", self.collection_name);
            return Ok(());
        }

        info!("Creating collection '{}'...", self.collection_name);

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection_name)
                    .vectors_config(VectorParamsBuilder::new(dimensions as u64, Distance::Cosine)),
            )
            .await?;

        for field in ["path", "hash"] {
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    &self.collection_name,
                    field,
                    FieldType::Keyword,
                ))
                .await?;
        }

        self.client
            .create_field_index(
                CreateFieldIndexCollectionBuilder::new(
                    &self.collection_name,
                    "ocr_content",
                    FieldType::Text,
                )
                .field_index_params(
                    TextIndexParamsBuilder::new(TokenizerType::Word).lowercase(true),
                ),
            )
            .await?;

        info!("Collection created successfully.");
        Ok(())
    }

    /// 逐页 scroll 整个集合 (或 `filter` 选中的部分)，`map` 返回 None 的点被丢弃
    async fn scroll_all<T, M>(&self, filter: Option<Filter>, map: M) -> Result<Vec<T>>
    where
        T: Send,
        M: Fn(RetrievedPoint) -> Option<T> + Sync,
    {
        let filter = filter.as_ref();
        let map = &map;

        collect_pages(move |offset: Option<PointId>| {
            let mut builder = ScrollPointsBuilder::new(&self.collection_name)
                .limit(SCROLL_PAGE_SIZE)
                .with_payload(true);
            if let Some(filter) = filter {
                builder = builder.filter(filter.clone());
            }
            if let Some(offset) = offset {
                builder = builder.offset(offset);
            }

            async move {
                let response = self.client.scroll(builder).await?;
                let page = response.result.into_iter().filter_map(map).collect();
                Ok((page, response.next_page_offset))
            }
        })
        .await
    }
}

impl ImageStore for VectorDB {
    async fn delete_except(&self, keep: &[String]) -> Result<()> {
        let filter = if keep.is_empty() {
            Filter::default()
        } else {
            Filter::must_not([Condition::matches("path", keep.to_vec())])
        };

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(filter)
                    .wait(true),
            )
            .await?;

        info!(kept = keep.len(), "deleted records not in the index list");
        Ok(())
    }

    async fn upsert(&self, record: ImageRecord) -> Result<()> {
        let points = vec![PointStruct::new(
            point_id(&record.path),
            record.embedding,
            [
                ("path", record.path.into()),
                ("filename", record.filename.into()),
                ("ocr_content", record.ocr_content.into()),
                ("ocr_model", record.ocr_model.into()),
                ("hash", record.hash.into()),
                ("mtime", record.mtime.into()),
            ],
        )];

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await?;

        Ok(())
    }

    async fn get_state(&self, path: &str) -> Result<Option<IndexState>> {
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(&self.collection_name, vec![PointId::from(point_id(path))])
                    .with_payload(true),
            )
            .await?;

        Ok(response.result.into_iter().next().and_then(|p| {
            Some(IndexState {
                mtime: payload_int(&p.payload, "mtime")?,
                ocr_model: payload_str(&p.payload, "ocr_model"),
            })
        }))
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<ImageRecord>> {
        let response = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&self.collection_name)
                    .filter(Filter::must([Condition::matches("hash", hash.to_string())]))
                    .limit(1)
                    .with_payload(true)
                    .with_vectors(true),
            )
            .await?;

        Ok(response.result.into_iter().next().and_then(|p| {
            Some(ImageRecord {
                path: payload_str(&p.payload, "path"),
                filename: payload_str(&p.payload, "filename"),
                ocr_content: payload_str(&p.payload, "ocr_content"),
                ocr_model: payload_str(&p.payload, "ocr_model"),
                hash: payload_str(&p.payload, "hash"),
                mtime: payload_int(&p.payload, "mtime").unwrap_or_default(),
                embedding: dense_vector(p.vectors)?,
            })
        }))
    }

    async fn search_embedding(
        &self,
        query_vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection_name, query_vector, limit as u64)
                    .with_payload(true),
            )
            .await?;

        Ok(search_result
            .result
            .into_iter()
            .map(|point| VectorHit {
                path: payload_str(&point.payload, "path"),
                distance: distance_from_score(point.score),
            })
            .collect())
    }

    async fn search_ocr_text(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let tokens = query_tokens(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let conditions: Vec<Condition> = tokens
            .iter()
            .map(|t| Condition::matches_text("ocr_content", t.clone()))
            .collect();

        let hits = self
            .scroll_all(Some(Filter::should(conditions)), |p| {
                Some((
                    payload_str(&p.payload, "path"),
                    payload_str(&p.payload, "ocr_content"),
                ))
            })
            .await?;

        debug!(query, hits = hits.len(), "full-text search");
        Ok(rank_text_hits(&tokens, hits, limit))
    }

    async fn search_filename(&self, query: &str, limit: usize) -> Result<Vec<FilenameHit>> {
        let mut hits = self
            .scroll_all(None, |p| {
                let filename = payload_str(&p.payload, "filename");
                filename_matches(&filename, query).then(|| FilenameHit {
                    path: payload_str(&p.payload, "path"),
                    filename,
                })
            })
            .await?;

        hits.truncate(limit);
        Ok(hits)
    }

    async fn clear(&self, dimensions: usize) -> Result<()> {
        // 删除集合
        self.client.delete_collection(&self.collection_name).await?;

        // 重新创建集合
        self.init_collection(dimensions).await?;

        info!(
            "Collection '{}' cleared successfully.",
            self.collection_name
        );
        Ok(())
    }

    async fn stats(&self) -> Result<CollectionStats> {
        let collection_info = self.client.collection_info(&self.collection_name).await?;

        let points_count = collection_info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0);

        Ok(CollectionStats {
            total_points: points_count,
            collection_name: self.collection_name.clone(),
        })
    }
}
