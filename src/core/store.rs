//! 内容寻址的 blob 仓库（`frozen/` 目录）
//!
//! 文件名即内容哈希，只追加不删除。

use crate::error::{FreezeError, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, checksum: &str) -> PathBuf {
        self.dir.join(checksum)
    }

    pub fn contains(&self, checksum: &str) -> bool {
        self.blob_path(checksum).is_file()
    }

    /// 复制文件进仓库；已存在时不做任何事。返回是否写入了新 blob
    pub fn put(&self, checksum: &str, source: &Path) -> Result<bool> {
        let target = self.blob_path(checksum);
        if target.exists() {
            return Ok(false);
        }

        // 先写临时文件再重命名，避免留下半个 blob
        let temp = self.dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        fs::copy(source, &temp)?;
        fs::rename(&temp, &target)?;
        debug!("写入 blob: {}", checksum);
        Ok(true)
    }

    /// 把已校验过的临时文件移动进仓库
    pub fn adopt(&self, checksum: &str, temp: &Path) -> Result<bool> {
        let target = self.blob_path(checksum);
        if target.exists() {
            fs::remove_file(temp)?;
            return Ok(false);
        }
        if fs::rename(temp, &target).is_err() {
            // 跨文件系统时回退为复制
            fs::copy(temp, &target)?;
            fs::remove_file(temp)?;
        }
        Ok(true)
    }

    /// 删除 blob，只用于撤回未被任何 tag 引用的新 blob
    pub(crate) fn remove(&self, checksum: &str) -> Result<()> {
        fs::remove_file(self.blob_path(checksum))?;
        Ok(())
    }

    /// 获取 blob 路径
    pub fn get(&self, checksum: &str) -> Result<PathBuf> {
        let path = self.blob_path(checksum);
        if path.is_file() {
            Ok(path)
        } else {
            Err(FreezeError::BlobMissing(checksum.to_string()))
        }
    }

    /// 仓库中所有 blob 的哈希
    pub fn checksums(&self) -> Result<BTreeSet<String>> {
        let mut sums = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                sums.insert(name);
            }
        }
        Ok(sums)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("frozen")).unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"payload").unwrap();

        assert!(store.put("abc", &src).unwrap());
        assert!(!store.put("abc", &src).unwrap());
        assert_eq!(store.checksums().unwrap().len(), 1);
        assert_eq!(fs::read(store.get("abc").unwrap()).unwrap(), b"payload");
    }

    #[test]
    fn test_get_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("frozen")).unwrap();
        assert!(matches!(store.get("nope"), Err(FreezeError::BlobMissing(_))));
    }
}
