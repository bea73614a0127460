//! 应用配置模块

use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// 远端服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    /// 服务根地址，端点名直接拼接在后面
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token
    #[serde(default)]
    pub token: Option<String>,
    /// 单次请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:50000/".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// 最大并发传输数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transfers: usize,
    /// 分块大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 单个文件的最大尝试次数
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    /// 重试基础延迟（毫秒），第 n 次重试等待 base * 2^n
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_chunk_size() -> usize {
    512 * 1024
}

fn default_max_tries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: default_max_concurrent(),
            chunk_size: default_chunk_size(),
            max_tries: default_max_tries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// 完整应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// 数据根目录，数据集位于 `<root>/datasets/<api_version>/`
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_root_dir() -> PathBuf {
    crate::dirs::home_dir()
        .map(|h| h.join(".datafreeze"))
        .unwrap_or_else(|| PathBuf::from(".datafreeze"))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            remote: RemoteConfig::default(),
            transfer: TransferConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从配置目录加载，文件缺失或损坏时使用默认值，然后应用环境变量覆盖
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        let mut config = fs::read_to_string(&config_file)
            .ok()
            .and_then(|content| serde_json::from_str::<AppConfig>(&content).ok())
            .unwrap_or_default();
        config.apply_env();
        config
    }

    /// 环境变量覆盖配置文件
    pub fn apply_env(&mut self) {
        if let Ok(root) = std::env::var("DATAFREEZE_ROOT") {
            self.root_dir = PathBuf::from(root);
        }
        if let Ok(url) = std::env::var("DATAFREEZE_REMOTE_URL") {
            self.remote.base_url = url;
        }
        if let Ok(token) = std::env::var("DATAFREEZE_TOKEN") {
            self.remote.token = Some(token);
        }
    }

    /// 保存配置（保留文件中的其他字段）
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        fs::create_dir_all(config_dir)?;
        let config_file = config_dir.join("config.json");

        let mut config: serde_json::Value = fs::read_to_string(&config_file)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        let ours = serde_json::to_value(self).map_err(io::Error::other)?;
        if let (Some(target), serde_json::Value::Object(fields)) = (config.as_object_mut(), ours) {
            target.extend(fields);
        }

        let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
        fs::write(&config_file, content)
    }

    /// 数据集所在目录
    pub fn datasets_dir(&self) -> PathBuf {
        self.root_dir.join("datasets").join(crate::API_VERSION)
    }
}
