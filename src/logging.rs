//! 日志模块 - 文件日志（按大小轮转）与控制台输出

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

struct LogFile {
    path: PathBuf,
    max_size: u64,
    file: Option<File>,
    written: u64,
}

impl LogFile {
    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// 当前文件重命名为 `.log.old`，再打开新文件
    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;
        let backup = self.path.with_extension("log.old");
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        fs::rename(&self.path, &backup)?;
        self.file = Some(Self::open(&self.path)?);
        self.written = 0;
        Ok(())
    }
}

/// 带大小限制的日志写入器
#[derive(Clone)]
pub struct SizeRotatingWriter {
    inner: Arc<Mutex<LogFile>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join("datafreeze.log");
        let max_size = u64::from(max_size_mb) * 1024 * 1024;

        let mut log = LogFile {
            file: Some(LogFile::open(&path)?),
            written: fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
            path,
            max_size,
        };
        if log.written > max_size {
            log.rotate()?;
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(log)),
        })
    }
}

/// 单次写入句柄
pub struct LogWriter {
    inner: Arc<Mutex<LogFile>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut log = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let n = match log.file.as_mut() {
            Some(file) => file.write(buf)?,
            None => return Err(io::Error::other("log file not available")),
        };
        log.written += n as u64;
        if log.written > log.max_size {
            let _ = log.rotate();
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut log = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match log.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.inner.clone(),
        }
    }
}

/// 日志目录：`<root>/logs`
pub fn log_dir(root_dir: &Path) -> PathBuf {
    root_dir.join("logs")
}

/// 初始化日志系统
pub fn init_logging(config: &LogConfig, log_dir: &Path) {
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let mut env_filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(config.tracing_level().into());
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false);

            // 调试构建同时输出到控制台
            let console_layer = cfg!(debug_assertions).then(|| {
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(false)
            });
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer);
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        Err(_) => {
            // 文件日志创建失败，回退到控制台
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_target(false),
                );
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotates_when_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SizeRotatingWriter::new(dir.path(), 0).unwrap();
        let mut w = writer.make_writer();
        w.write_all(b"first line\n").unwrap();
        w.write_all(b"second line\n").unwrap();
        w.flush().unwrap();

        assert!(dir.path().join("datafreeze.log.old").exists());
        assert!(dir.path().join("datafreeze.log").exists());
    }

    #[test]
    fn test_level_parsing() {
        let config = LogConfig {
            level: "DEBUG".to_string(),
            ..Default::default()
        };
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        assert_eq!(LogConfig::default().tracing_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_init_with_and_without_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::default();

        // 日志目录建在普通文件下面，文件日志无法创建，走控制台分支
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"x").unwrap();
        assert!(SizeRotatingWriter::new(&blocker.join("logs"), 1).is_err());
        init_logging(&config, &blocker.join("logs"));

        // 全局订阅者只会设置一次，后续调用不报错
        init_logging(&config, &dir.path().join("logs"));
        tracing::info!("日志初始化完成");
    }
}
