use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info};

use crate::db::FilenameHit;
use crate::scan::expand_request;
use crate::search::{ImageSearch, IndexFailure, SearchHit};

/// 健康检查响应
#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

/// 索引请求
#[derive(Deserialize)]
pub struct IndexRequest {
    /// 需要保留在索引中的全部图片路径
    #[serde(default)]
    paths: Vec<String>,
    /// 额外递归扫描的目录
    #[serde(default)]
    directories: Vec<String>,
}

/// 索引响应
#[derive(Serialize)]
pub struct IndexResponse {
    message: String,
    indexed: usize,
    skipped: usize,
    failed: Vec<IndexFailure>,
}

/// 搜索请求
#[derive(Deserialize)]
pub struct SearchRequest {
    query: String,
}

/// 搜索响应
#[derive(Serialize)]
pub struct SearchResponse {
    results: Vec<SearchHit>,
}

/// 文件名搜索请求
#[derive(Deserialize)]
pub struct FilenameSearchRequest {
    query: String,
    #[serde(default = "default_filename_limit")]
    limit: usize,
}

fn default_filename_limit() -> usize {
    50
}

/// 文件名搜索响应
#[derive(Serialize)]
pub struct FilenameSearchResponse {
    results: Vec<FilenameHit>,
}

/// 清空数据库响应
#[derive(Serialize)]
pub struct ClearResponse {
    message: String,
}

/// 统计信息响应
#[derive(Serialize)]
pub struct StatsResponse {
    total_points: u64,
    collection_name: String,
}

/// API 错误响应
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// 自定义错误类型，统一返回 500
pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("request failed: {:#}", self.0);

        let error_response = ErrorResponse {
            error: format!("{:#}", self.0),
        };

        (StatusCode::INTERNAL_SERVER_ERROR, Json(error_response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// 健康检查端点
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// 索引端点
async fn index<S: ImageSearch>(
    State(service): State<Arc<S>>,
    Json(req): Json<IndexRequest>,
) -> Result<Json<IndexResponse>, ApiError> {
    let paths = if req.directories.is_empty() {
        req.paths
    } else {
        let (paths, directories) = (req.paths, req.directories);
        tokio::task::spawn_blocking(move || expand_request(&paths, &directories)).await?
    };

    info!("Indexing {} paths", paths.len());
    let report = service.index(paths).await?;

    Ok(Json(IndexResponse {
        message: "Indexing completed".to_string(),
        indexed: report.indexed,
        skipped: report.skipped,
        failed: report.failed,
    }))
}

/// 搜索端点
async fn search<S: ImageSearch>(
    State(service): State<Arc<S>>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let results = service
        .search(&req.query)
        .await
        .map_err(|e| e.context("Search failed"))?;

    Ok(Json(SearchResponse { results }))
}

/// 文件名搜索端点
async fn search_filename<S: ImageSearch>(
    State(service): State<Arc<S>>,
    Json(req): Json<FilenameSearchRequest>,
) -> Result<Json<FilenameSearchResponse>, ApiError> {
    let results = service.search_filename(&req.query, req.limit).await?;

    Ok(Json(FilenameSearchResponse { results }))
}

/// 清空数据库端点
async fn clear_database<S: ImageSearch>(
    State(service): State<Arc<S>>,
) -> Result<Json<ClearResponse>, ApiError> {
    service.clear().await?;

    Ok(Json(ClearResponse {
        message: "Database cleared successfully".to_string(),
    }))
}

/// 获取统计信息端点
async fn get_stats<S: ImageSearch>(
    State(service): State<Arc<S>>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = service.stats().await?;

    Ok(Json(StatsResponse {
        total_points: stats.total_points,
        collection_name: stats.collection_name,
    }))
}

/// 创建 API 路由
pub fn create_router<S: ImageSearch>(service: S) -> Router {
    let state = Arc::new(service);

    Router::new()
        .route("/health", get(health_check))
        .route("/index", post(index::<S>))
        .route("/search", post(search::<S>))
        .route("/search/filename", post(search_filename::<S>))
        .route("/clear", post(clear_database::<S>))
        .route("/stats", get(get_stats::<S>))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(state)
}

/// 启动 API 服务器
pub async fn start_server<S: ImageSearch>(service: S, port: u16) -> Result<()> {
    let app = create_router(service);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("API server listening on http://{}", addr);
    info!("Endpoints:");
    info!("   GET  /health           - Health check");
    info!("   POST /index            - Index image paths");
    info!("   POST /search           - Semantic search (CLIP + OCR)");
    info!("   POST /search/filename  - Search by file name");
    info!("   POST /clear            - Clear database");
    info!("   GET  /stats            - Get statistics");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
