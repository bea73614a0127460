//! 冻结/解冻引擎
//!
//! 每个数据集目录结构：
//!
//! ```text
//! <root>/datasets/<API_VERSION>/<dtype>.<name>/
//!     MANIFEST.json
//!     thawed/            当前可变工作区
//!     frozen/<checksum>  去重后的 blob
//!     tmp/               下载中的临时文件
//! ```
//!
//! 工作区的总摘要与父 tag 相同则为“干净”状态，否则为“脏”状态。
//! 所有写操作都持有同一数据集的写锁。

use super::hasher::{workspace_checksum, FileEntry, WorkspaceChecksum};
use super::manifest::{Manifest, Tag, ThawedPointer};
use super::slug::{validate_tagname, DatasetId};
use super::store::ContentStore;
use crate::error::{FreezeError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// 工作区相对父 tag 的文件变化
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileChanges {
    pub new: Vec<String>,
    pub changed: Vec<String>,
    pub deleted: Vec<String>,
}

impl FileChanges {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    /// 比较两个 path -> checksum 表
    pub fn between(
        current: &BTreeMap<String, FileEntry>,
        parent: &BTreeMap<String, FileEntry>,
    ) -> Self {
        let mut changes = FileChanges::default();
        for (path, entry) in current {
            match parent.get(path) {
                None => changes.new.push(path.clone()),
                Some(p) if p.checksum != entry.checksum => changes.changed.push(path.clone()),
                Some(_) => {}
            }
        }
        changes.deleted = parent
            .keys()
            .filter(|p| !current.contains_key(*p))
            .cloned()
            .collect();
        changes
    }
}

/// 单个数据集的句柄，克隆开销很小
#[derive(Clone)]
pub struct Dataset {
    id: DatasetId,
    basedir: PathBuf,
    store: Arc<ContentStore>,
    manifest: Arc<Manifest>,
    lock: Arc<Mutex<()>>,
}

impl Dataset {
    /// 打开（必要时创建）数据集目录
    pub fn open(datasets_root: &Path, id: DatasetId, lock: Arc<Mutex<()>>) -> Result<Self> {
        let basedir = datasets_root.join(id.slug());
        fs::create_dir_all(basedir.join("thawed"))?;
        let store = ContentStore::new(basedir.join("frozen"))?;
        let manifest = Manifest::new(basedir.join("MANIFEST.json"));

        Ok(Self {
            id,
            basedir,
            store: Arc::new(store),
            manifest: Arc::new(manifest),
            lock,
        })
    }

    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    pub fn slug(&self) -> String {
        self.id.slug()
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    pub fn thawed_dir(&self) -> PathBuf {
        self.basedir.join("thawed")
    }

    pub fn frozen_dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.basedir.join("tmp")
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tags(&self) -> Result<BTreeSet<String>> {
        self.manifest.tags()
    }

    pub fn tag_data(&self) -> Result<Vec<Tag>> {
        self.manifest.tag_data()
    }

    pub fn get_tag(&self, name: &str) -> Result<Tag> {
        self.manifest.get_tag(name)
    }

    pub fn thawed_pointer(&self) -> Result<ThawedPointer> {
        self.manifest.thawed_pointer()
    }

    /// 当前工作区的父 tag；从未冻结或解冻过时为 None
    pub fn parent_tag(&self) -> Result<Option<Tag>> {
        match self.manifest.thawed_pointer()?.parent {
            Some(parent) => self.manifest.get_tag(&parent).map(Some),
            None => Ok(None),
        }
    }

    /// 计算当前工作区的摘要
    pub fn checksum(&self) -> Result<WorkspaceChecksum> {
        workspace_checksum(&self.slug(), &self.thawed_dir())
    }

    /// 已有 blob 的哈希集合
    pub fn frozen_checksums(&self) -> Result<BTreeSet<String>> {
        self.store.checksums()
    }

    /// 工作区相对父 tag 的变化（只读）
    pub fn file_changes(&self) -> Result<FileChanges> {
        let current = self.checksum()?;
        let parent = self.parent_tag()?;
        Ok(Self::changes_against(&current, parent.as_ref()))
    }

    fn changes_against(current: &WorkspaceChecksum, parent: Option<&Tag>) -> FileChanges {
        match parent {
            Some(parent) => FileChanges::between(&current.files, &parent.files),
            None => FileChanges::between(&current.files, &BTreeMap::new()),
        }
    }

    fn is_dirty(current: &WorkspaceChecksum, parent: Option<&Tag>) -> bool {
        match parent {
            Some(parent) => current.total != parent.total,
            None => !current.files.is_empty(),
        }
    }

    /// 冻结当前工作区为新 tag
    pub fn freeze(&self, tagname: &str) -> Result<Tag> {
        let tagname = validate_tagname(tagname)?;
        let _guard = self.write_guard();

        if self.manifest.tags()?.contains(tagname) {
            return Err(FreezeError::TagExists(tagname.to_string()));
        }

        let current = self.checksum()?;
        let tag = Tag {
            tag: tagname.to_string(),
            parent: self.manifest.thawed_pointer()?.parent,
            files: current.files,
            total: current.total,
            timestamp: chrono::Utc::now().timestamp(),
        };
        // 写 blob 之前先确认记录能写入清单
        tag.check().map_err(FreezeError::PathInvalid)?;

        let thawed_dir = self.thawed_dir();
        let mut new_blobs = 0usize;
        for (rel_path, entry) in &tag.files {
            if self.store.put(&entry.checksum, &thawed_dir.join(rel_path))? {
                debug!("新文件: {}", rel_path);
                new_blobs += 1;
            } else {
                debug!("复用已有 blob: {}", rel_path);
            }
        }

        self.manifest.insert_tag(tag.clone())?;
        self.manifest.update_thawed_pointer(Some(tagname.to_string()))?;

        info!(
            "已冻结 {}:{} ({} 个文件, {} 个新 blob)",
            self.id,
            tagname,
            tag.files.len(),
            new_blobs
        );
        Ok(tag)
    }

    /// 把工作区还原为指定 tag 的内容
    pub fn thaw(&self, tagname: &str, force: bool) -> Result<()> {
        let tagname = validate_tagname(tagname)?;
        let _guard = self.write_guard();

        let target = self.manifest.get_tag(tagname)?;

        if !force {
            let current = self.checksum()?;
            let parent = self.parent_tag()?;
            if Self::is_dirty(&current, parent.as_ref()) {
                return Err(FreezeError::UnsavedChangesInThawed(Self::changes_against(
                    &current,
                    parent.as_ref(),
                )));
            }
        }

        // 先确认所有 blob 都在，再动工作区
        let mut sources = Vec::with_capacity(target.files.len());
        for (rel_path, entry) in &target.files {
            sources.push((rel_path, self.store.get(&entry.checksum)?));
        }

        let thawed_dir = self.thawed_dir();
        clear_dir(&thawed_dir)?;
        for (rel_path, blob) in sources {
            let dest = thawed_dir.join(rel_path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&blob, &dest)?;
        }

        self.manifest.update_thawed_pointer(Some(tagname.to_string()))?;
        info!("已解冻 {}:{} ({} 个文件)", self.id, tagname, target.files.len());
        Ok(())
    }

    /// 提交拉取结果：移动已校验的临时文件并写入 tag。
    /// 任何检查失败都不会改动仓库和清单
    pub fn commit_pulled(&self, tag: Tag, downloaded: Vec<(String, PathBuf)>) -> Result<()> {
        let _guard = self.write_guard();

        if self.manifest.tags()?.contains(&tag.tag) {
            return Err(FreezeError::TagExists(tag.tag));
        }

        let incoming: BTreeSet<&str> = downloaded.iter().map(|(c, _)| c.as_str()).collect();
        if let Some(entry) = tag
            .files
            .values()
            .find(|e| !incoming.contains(e.checksum.as_str()) && !self.store.contains(&e.checksum))
        {
            return Err(FreezeError::BlobMissing(entry.checksum.clone()));
        }

        let mut adopted = Vec::new();
        let result = self.adopt_and_insert(tag, &downloaded, &mut adopted);
        if result.is_err() {
            // 撤回本次新移入的 blob，它们此前不在仓库中，也没有 tag 引用
            for checksum in &adopted {
                if let Err(e) = self.store.remove(checksum) {
                    warn!("回滚 blob {} 失败: {}", checksum, e);
                }
            }
        }
        result
    }

    fn adopt_and_insert(
        &self,
        tag: Tag,
        downloaded: &[(String, PathBuf)],
        adopted: &mut Vec<String>,
    ) -> Result<()> {
        for (checksum, temp) in downloaded {
            if self.store.adopt(checksum, temp)? {
                adopted.push(checksum.clone());
            }
        }
        let name = tag.tag.clone();
        self.manifest.insert_tag(tag)?;
        info!("已写入拉取的 tag {}:{}", self.id, name);
        Ok(())
    }
}

/// 清空目录内容，保留目录本身
fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
