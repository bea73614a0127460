//! 错误类型
//!
//! 校验错误、状态冲突、未保存修改、传输失败和远端缺失分别对应独立的变体，
//! 调用方可以直接根据携带的数据决定下一步操作。

use crate::core::FileChanges;
use std::path::PathBuf;

/// 单个文件传输失败的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub checksum: String,
    pub reason: String,
}

impl std::fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.checksum, self.reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FreezeError {
    #[error("Invalid Tag Name: \"{0}\"")]
    TagInvalid(String),

    #[error("Invalid Freezable Name: \"{0}\"")]
    FreezableNameInvalid(String),

    /// 工作区中无法作为 tag 路径记录的文件名
    #[error("Invalid file path in workspace: {0}")]
    PathInvalid(String),

    #[error("Tag already exists: {0}")]
    TagExists(String),

    #[error("Tag does not exist: {0}")]
    TagDoesNotExist(String),

    /// 同名 tag 在远端对应不同内容
    #[error("Tag {tag} conflicts with remote copy (local total {local_total}, remote total {remote_total})")]
    TagConflict {
        tag: String,
        local_total: String,
        remote_total: String,
    },

    #[error(
        "freeze your current changes or use force to dispose of unsaved changes \
         ({} new, {} changed, {} deleted)",
        .0.new.len(), .0.changed.len(), .0.deleted.len()
    )]
    UnsavedChangesInThawed(FileChanges),

    /// manifest 引用了内容仓库中不存在的 blob
    #[error("Blob missing from content store: {0}")]
    BlobMissing(String),

    #[error("Corrupt manifest {path:?}: {reason}")]
    ManifestCorrupt { path: PathBuf, reason: String },

    #[error("Push of {tag} failed: {} file(s) did not transfer", failed.len())]
    PushFailed {
        tag: String,
        failed: Vec<TransferFailure>,
    },

    #[error("Pull of {tag} failed: {reason}")]
    CloudPullFailed {
        tag: String,
        reason: String,
        failed: Vec<TransferFailure>,
    },

    #[error("Dataset does not exist in the cloud: {0}")]
    CloudDatasetDoesNotExist(String),

    #[error("Tag does not exist in the cloud: {0}")]
    CloudTagDoesNotExist(String),

    #[error("Remote {endpoint} returned {status}: {message}")]
    Remote {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

pub type Result<T> = std::result::Result<T, FreezeError>;

