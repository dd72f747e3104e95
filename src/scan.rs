use std::collections::HashSet;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

/// 支持的图片扩展名 (svg 无法解码，不在其中)
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp"];

/// 是否为支持的图片文件 (按扩展名，不区分大小写)
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// 递归扫描目录下的所有图片，按路径排序
pub fn find_image_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("skipping unreadable entry under {}: {}", dir.display(), e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_image_file(entry.path()))
        .map(|entry| entry.path().to_string_lossy().to_string())
        .collect();

    files.sort();
    files
}

/// 合并显式路径与目录扫描结果，去重并保持首次出现的顺序
pub fn expand_request(paths: &[String], directories: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();

    let scanned = directories
        .iter()
        .flat_map(|dir| find_image_files(Path::new(dir)));

    for path in paths.iter().cloned().chain(scanned) {
        if seen.insert(path.clone()) {
            result.push(path);
        }
    }

    result
}
