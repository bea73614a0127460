//! 云同步客户端 - push / pull / list
//!
//! push：暂存 -> 并发上传（每个文件上传后立即 commit_file）-> 全部成功才 commit_tag。
//! pull：暂存 -> 并发下载到临时目录并校验 -> 全部成功才移入仓库并写入 tag。
//! 两者都在所有传输结束（成功和失败都收集完）后才做最终提交。

use super::remote::{RemoteClient, RemoteListing, StageOutcome};
use super::transfer::{download_file, upload_file, TransferStats};
use crate::config::{RemoteConfig, TransferConfig};
use crate::core::{files_total, validate_tagname, Dataset};
use crate::error::{FreezeError, Result, TransferFailure};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// push 结果
#[derive(Debug, Clone, Serialize)]
pub struct PushReport {
    pub tag: String,
    pub stage_uuid: String,
    pub files_uploaded: usize,
    pub files_already_remote: usize,
    pub bytes_transferred: u64,
    pub peak_active_transfers: usize,
}

/// pull 结果
#[derive(Debug, Clone, Serialize)]
pub struct PullReport {
    pub tag: String,
    pub files_downloaded: usize,
    pub files_reused: usize,
    pub bytes_transferred: u64,
    pub peak_active_transfers: usize,
}

type TransferHandle = (String, JoinHandle<std::result::Result<u64, String>>);

pub struct SyncClient {
    remote: Arc<RemoteClient>,
    config: TransferConfig,
}

impl SyncClient {
    pub fn new(remote: &RemoteConfig, config: TransferConfig) -> Result<Self> {
        Ok(Self {
            remote: Arc::new(RemoteClient::new(remote)?),
            config,
        })
    }

    pub fn remote(&self) -> &RemoteClient {
        &self.remote
    }

    /// 等待一个并发名额；取消时返回 None
    async fn acquire(
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = semaphore.clone().acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        }
    }

    /// 等待所有传输任务结束，收集成功的字节数和失败列表
    async fn join_all(
        handles: Vec<TransferHandle>,
        mut failed: Vec<TransferFailure>,
    ) -> (BTreeMap<String, u64>, Vec<TransferFailure>) {
        let mut succeeded = BTreeMap::new();
        for (checksum, handle) in handles {
            match handle.await {
                Ok(Ok(bytes)) => {
                    succeeded.insert(checksum, bytes);
                }
                Ok(Err(reason)) => failed.push(TransferFailure { checksum, reason }),
                Err(e) => failed.push(TransferFailure {
                    checksum,
                    reason: format!("task failed: {}", e),
                }),
            }
        }
        (succeeded, failed)
    }

    pub async fn push(&self, dataset: &Dataset, tagname: &str) -> Result<PushReport> {
        self.push_with_cancel(dataset, tagname, &CancellationToken::new())
            .await
    }

    /// 推送一个本地 tag 到远端
    pub async fn push_with_cancel(
        &self,
        dataset: &Dataset,
        tagname: &str,
        cancel: &CancellationToken,
    ) -> Result<PushReport> {
        let tag = dataset.get_tag(validate_tagname(tagname)?)?;
        info!("开始推送 {}:{} ({} 个文件)", dataset.id(), tagname, tag.files.len());

        let staged = match self.remote.stage_files(dataset.id(), &tag).await? {
            StageOutcome::Staged(staged) => staged,
            StageOutcome::Conflict { remote_total } if remote_total == tag.total => {
                info!("远端已有相同内容的 {}:{}", dataset.id(), tagname);
                return Err(FreezeError::TagExists(tagname.to_string()));
            }
            StageOutcome::Conflict { remote_total } => {
                return Err(FreezeError::TagConflict {
                    tag: tagname.to_string(),
                    local_total: tag.total.clone(),
                    remote_total,
                });
            }
        };
        debug!(
            "暂存 {}: {} 个待上传, {} 个已存在",
            staged.stage_uuid,
            staged.missing_files.len(),
            staged.uploaded_files.len()
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_transfers.max(1)));
        let stats = Arc::new(TransferStats::default());
        let stage_uuid: Arc<str> = Arc::from(staged.stage_uuid.as_str());
        let mut handles: Vec<TransferHandle> = Vec::new();
        let mut failed = Vec::new();

        for file in staged.missing_files {
            if cancel.is_cancelled() {
                failed.push(TransferFailure {
                    checksum: file.checksum,
                    reason: "cancelled before start".to_string(),
                });
                continue;
            }

            let blob = match dataset.store().get(&file.checksum) {
                Ok(path) => path,
                Err(e) => {
                    failed.push(TransferFailure {
                        checksum: file.checksum,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let Some(permit) = Self::acquire(&semaphore, cancel).await else {
                failed.push(TransferFailure {
                    checksum: file.checksum,
                    reason: "cancelled before start".to_string(),
                });
                continue;
            };

            let remote = self.remote.clone();
            let config = self.config.clone();
            let stats = stats.clone();
            let cancel = cancel.clone();
            let stage_uuid = stage_uuid.clone();
            let id = dataset.id().clone();
            let checksum = file.checksum.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = {
                    let _active = stats.enter();
                    upload_file(remote.http(), &config, &blob, file.size, &file.upload_url, &cancel)
                        .await
                };
                let result = match result {
                    Ok(bytes) => remote
                        .commit_file(&stage_uuid, &id, &file.checksum)
                        .await
                        .map(|_| bytes)
                        .map_err(|e| format!("commit failed: {}", e)),
                    Err(e) => Err(e),
                };
                stats.record(&result);
                result
            });
            handles.push((checksum, handle));
        }

        let (succeeded, failed) = Self::join_all(handles, failed).await;

        if !failed.is_empty() {
            for f in &failed {
                error!("上传失败 {}", f);
            }
            return Err(FreezeError::PushFailed {
                tag: tagname.to_string(),
                failed,
            });
        }

        self.remote.commit_tag(dataset.id(), &tag).await?;

        let report = PushReport {
            tag: tagname.to_string(),
            stage_uuid: staged.stage_uuid,
            files_uploaded: succeeded.len(),
            files_already_remote: staged.uploaded_files.len(),
            bytes_transferred: stats.bytes_transferred.load(Ordering::Relaxed),
            peak_active_transfers: stats.peak_active(),
        };
        info!(
            "推送完成 {}:{} - 上传 {}, 已存在 {}",
            dataset.id(),
            tagname,
            report.files_uploaded,
            report.files_already_remote
        );
        Ok(report)
    }

    pub async fn pull(&self, dataset: &Dataset, tagname: &str) -> Result<PullReport> {
        self.pull_with_cancel(dataset, tagname, &CancellationToken::new())
            .await
    }

    /// 从远端拉取一个 tag。失败时本地数据集保持原样
    pub async fn pull_with_cancel(
        &self,
        dataset: &Dataset,
        tagname: &str,
        cancel: &CancellationToken,
    ) -> Result<PullReport> {
        let tagname = validate_tagname(tagname)?;
        if dataset.tags()?.contains(tagname) {
            return Err(FreezeError::TagExists(tagname.to_string()));
        }

        let local = dataset.frozen_checksums()?;
        let staged = self.remote.stage_pull(dataset.id(), tagname, &local).await?;
        let tag = staged.tag_data;

        let pull_failed = |reason: String| FreezeError::CloudPullFailed {
            tag: tagname.to_string(),
            reason,
            failed: Vec::new(),
        };
        if tag.tag != tagname {
            return Err(pull_failed(format!("remote returned tag {}", tag.tag)));
        }
        tag.check().map_err(pull_failed)?;
        if files_total(&dataset.slug(), &tag.files) != tag.total {
            return Err(pull_failed("remote tag total does not match its files".to_string()));
        }

        // 需要下载的文件：按 checksum 去重
        let mut needed = BTreeMap::new();
        for entry in tag.files.values() {
            if local.contains(&entry.checksum) || needed.contains_key(&entry.checksum) {
                continue;
            }
            match staged.files_to_download.get(&entry.checksum) {
                Some(url) => {
                    needed.insert(entry.checksum.clone(), url.clone());
                }
                None => {
                    return Err(pull_failed(format!("no download url for {}", entry.checksum)));
                }
            }
        }
        let files_reused = tag
            .files
            .values()
            .filter(|e| local.contains(&e.checksum))
            .count();
        info!(
            "开始拉取 {}:{} - 下载 {}, 复用 {}",
            dataset.id(),
            tagname,
            needed.len(),
            files_reused
        );

        // 每次拉取使用独立的临时目录，退出时清理
        let staging_dir = dataset.tmp_dir().join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&staging_dir)?;
        let _cleanup = scopeguard::guard(staging_dir.clone(), |dir| {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!("清理临时目录失败 {:?}: {}", dir, e);
            }
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_transfers.max(1)));
        let stats = Arc::new(TransferStats::default());
        let mut handles: Vec<TransferHandle> = Vec::new();
        let mut failed = Vec::new();
        let mut temp_paths: Vec<(String, PathBuf)> = Vec::new();

        for (checksum, url) in needed {
            let permit = if cancel.is_cancelled() {
                None
            } else {
                Self::acquire(&semaphore, cancel).await
            };
            let Some(permit) = permit else {
                failed.push(TransferFailure {
                    checksum,
                    reason: "cancelled before start".to_string(),
                });
                continue;
            };

            let dest = staging_dir.join(&checksum);
            temp_paths.push((checksum.clone(), dest.clone()));

            let remote = self.remote.clone();
            let config = self.config.clone();
            let stats = stats.clone();
            let cancel = cancel.clone();
            let expected = checksum.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = {
                    let _active = stats.enter();
                    download_file(remote.http(), &config, &url, &expected, &dest, &cancel).await
                };
                stats.record(&result);
                result
            });
            handles.push((checksum, handle));
        }

        let (succeeded, failed) = Self::join_all(handles, failed).await;

        if !failed.is_empty() {
            for f in &failed {
                error!("下载失败 {}", f);
            }
            return Err(FreezeError::CloudPullFailed {
                tag: tagname.to_string(),
                reason: format!("{} file(s) failed to download", failed.len()),
                failed,
            });
        }

        let commit_dataset = dataset.clone();
        match tokio::task::spawn_blocking(move || commit_dataset.commit_pulled(tag, temp_paths)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(pull_failed(format!("commit failed: {}", e))),
            Err(e) => return Err(pull_failed(format!("commit task failed: {}", e))),
        }

        let report = PullReport {
            tag: tagname.to_string(),
            files_downloaded: succeeded.len(),
            files_reused,
            bytes_transferred: stats.bytes_transferred.load(Ordering::Relaxed),
            peak_active_transfers: stats.peak_active(),
        };
        info!("拉取完成 {}:{}", dataset.id(), tagname);
        Ok(report)
    }

    /// 列出远端数据集，可按 dtype / name 过滤
    pub async fn list(&self, dtype: Option<&str>, name: Option<&str>) -> Result<RemoteListing> {
        let mut listing = self.remote.list_datasets().await?;
        if let Some(dtype) = dtype {
            listing.retain(|d, _| d == dtype);
        }
        if let Some(name) = name {
            for names in listing.values_mut() {
                names.retain(|n, _| n == name);
            }
            listing.retain(|_, names| !names.is_empty());
        }
        Ok(listing)
    }
}
