use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub mod cloud;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;

pub use cloud::{PullReport, PushReport, SyncClient};
pub use config::AppConfig;
pub use crate::core::{Dataset, DatasetId, FileChanges, Tag};
pub use error::{FreezeError, Result, TransferFailure};

/// 磁盘布局版本，数据集位于 `<root>/datasets/<API_VERSION>/`
pub const API_VERSION: &str = "v1";

/// 运行上下文：配置、数据集根目录和每个数据集的写锁。
/// 启动时构建一次，传给各个操作
pub struct Context {
    config: AppConfig,
    datasets_dir: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Context {
    pub fn new(config: AppConfig) -> Result<Self> {
        let datasets_dir = config.datasets_dir();
        fs::create_dir_all(&datasets_dir)?;
        tracing::debug!("数据集目录: {:?}", datasets_dir);
        Ok(Self {
            config,
            datasets_dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn datasets_dir(&self) -> &PathBuf {
        &self.datasets_dir
    }

    /// 同一数据集的所有句柄共享一把写锁
    fn lock_for(&self, id: &DatasetId) -> Arc<Mutex<()>> {
        self.lock_for_path(self.datasets_dir.join(id.slug()))
    }

    fn lock_for_path(&self, path: PathBuf) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(path)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 打开（必要时创建）数据集
    pub fn dataset(&self, dtype: &str, name: &str) -> Result<Dataset> {
        let id = DatasetId::new(dtype, name)?;
        let lock = self.lock_for(&id);
        Dataset::open(&self.datasets_dir, id, lock)
    }

    /// 列出本地数据集的 slug，dtype 和 name 支持 `*` 通配
    pub fn datasets(&self, dtype: &str, name: &str) -> Result<Vec<String>> {
        let pattern = format!("^{}\\.{}$", glob_to_regex(dtype), glob_to_regex(name));
        let re = regex::Regex::new(&pattern)
            .map_err(|e| FreezeError::Config(format!("bad pattern {}: {}", pattern, e)))?;

        let mut slugs = Vec::new();
        for entry in fs::read_dir(&self.datasets_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let slug = entry.file_name().to_string_lossy().to_string();
            if re.is_match(&slug) {
                slugs.push(slug);
            }
        }
        slugs.sort();
        Ok(slugs)
    }

    pub fn exists(&self, dtype: &str, name: &str) -> Result<bool> {
        let id = DatasetId::new(dtype, name)?;
        Ok(self.datasets_dir.join(id.slug()).is_dir())
    }

    /// 删除匹配的整个数据集，返回删除数量。不可恢复
    pub fn delete(&self, dtype: &str, name: &str) -> Result<usize> {
        let mut deleted = 0;
        for slug in self.datasets(dtype, name)? {
            let path = self.datasets_dir.join(&slug);
            let lock = self.lock_for_path(path.clone());
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            fs::remove_dir_all(&path)?;
            tracing::info!("已删除数据集 {}", slug);
            deleted += 1;
        }
        Ok(deleted)
    }

    pub fn sync_client(&self) -> Result<SyncClient> {
        SyncClient::new(&self.config.remote, self.config.transfer.clone())
    }
}

/// `*` 通配符转正则，其余字符按字面匹配
fn glob_to_regex(glob: &str) -> String {
    glob.split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^.]*")
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("USERPROFILE").ok().map(PathBuf::from)
        } else {
            std::env::var("HOME").ok().map(PathBuf::from)
        }
    }

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            home_dir().map(|h| h.join("Library").join("Application Support"))
        } else {
            home_dir().map(|h| h.join(".config"))
        }
    }
}
