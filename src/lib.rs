// 导出模块供测试和外部使用
pub mod api;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ocr;
pub mod scan;
pub mod search;
