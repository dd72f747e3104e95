// 使用库 crate
use image_search_sidecar::api::start_server;
use image_search_sidecar::config::Config;
use image_search_sidecar::search::SearchService;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("image search sidecar starting...");

    // 读取 .env 与环境变量配置
    let config = Config::from_env()?;
    info!(
        qdrant = %config.qdrant_url,
        collection = %config.collection_name,
        model = config.model.as_str(),
        ocr = config.ocr_enabled,
        "configuration loaded"
    );

    // 创建搜索服务 (连接 Qdrant、加载模型)
    let search_service = SearchService::new(&config).await?;
    info!("search service ready");

    // 启动 HTTP API 服务器
    start_server(search_service, config.port).await?;

    Ok(())
}
