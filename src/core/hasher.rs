//! 内容哈希（BLAKE3）
//!
//! 文件按固定大小的块流式读取，树摘要按路径排序后折叠，
//! 因此结果与读取块大小和目录遍历顺序无关。

use crate::error::{FreezeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

/// 读取文件时的块大小
pub const READ_BLOCK_SIZE: usize = 4096;

/// 单个文件的校验信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub checksum: String,
    pub size: u64,
}

/// 工作区完整摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceChecksum {
    /// slug 的摘要
    pub slug: String,
    pub files: BTreeMap<String, FileEntry>,
    pub total: String,
}

/// 计算文件内容的哈希
pub fn file_digest(path: &Path) -> Result<String> {
    digest_reader(File::open(path)?, READ_BLOCK_SIZE)
}

fn digest_reader<R: Read>(mut reader: R, block_size: usize) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; block_size];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// slug 的摘要
pub fn slug_digest(slug: &str) -> String {
    blake3::hash(slug.as_bytes()).to_hex().to_string()
}

/// 计算树摘要：先折叠 slug 摘要，再按路径顺序折叠每个 (path, checksum)
pub fn tree_digest<'a, I>(slug: &str, files: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut pairs: Vec<_> = files.into_iter().collect();
    pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut hasher = blake3::Hasher::new();
    hasher.update(slug_digest(slug).as_bytes());
    for (path, checksum) in pairs {
        hasher.update(path.as_bytes());
        hasher.update(checksum.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// 按 tag 的文件表计算总摘要
pub fn files_total(slug: &str, files: &BTreeMap<String, FileEntry>) -> String {
    tree_digest(
        slug,
        files.iter().map(|(p, e)| (p.as_str(), e.checksum.as_str())),
    )
}

/// 相对路径转为清单键：按路径分量以 `/` 连接，非 UTF-8 名称报错
fn relative_key(relative: &Path) -> Result<String> {
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| FreezeError::PathInvalid(relative.to_string_lossy().to_string()))?;
    Ok(parts.join("/"))
}

/// 扫描目录，计算所有文件的摘要。路径统一使用 `/` 分隔
pub fn workspace_checksum(slug: &str, dir: &Path) -> Result<WorkspaceChecksum> {
    let mut files = BTreeMap::new();

    if dir.exists() {
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let rel_path = relative_key(relative)?;
            let size = entry.metadata()?.len();
            let checksum = file_digest(entry.path())?;
            files.insert(rel_path, FileEntry { checksum, size });
        }
    }

    let total = files_total(slug, &files);
    Ok(WorkspaceChecksum {
        slug: slug_digest(slug),
        files,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_digest_independent_of_block_size() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let a = digest_reader(Cursor::new(&data), 7).unwrap();
        let b = digest_reader(Cursor::new(&data), READ_BLOCK_SIZE).unwrap();
        let c = digest_reader(Cursor::new(&data), 1 << 16).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a, blake3::hash(&data).to_hex().to_string());
    }

    #[test]
    fn test_tree_digest_ignores_order() {
        let forward = tree_digest("Cohort.x", [("a", "h1"), ("b/c", "h2"), ("d", "h3")]);
        let shuffled = tree_digest("Cohort.x", [("d", "h3"), ("a", "h1"), ("b/c", "h2")]);
        assert_eq!(forward, shuffled);

        let other_slug = tree_digest("Cohort.y", [("a", "h1"), ("b/c", "h2"), ("d", "h3")]);
        assert_ne!(forward, other_slug);
    }

    #[test]
    fn test_workspace_checksum() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();

        let sum = workspace_checksum("T.n", dir.path()).unwrap();
        assert_eq!(sum.files.len(), 2);
        assert_eq!(sum.files["sub/b.txt"].size, 5);
        assert_eq!(
            sum.files["a.txt"].checksum,
            blake3::hash(b"hello").to_hex().to_string()
        );
        assert_eq!(sum.total, files_total("T.n", &sum.files));
    }
}
