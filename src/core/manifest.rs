//! 数据集清单（MANIFEST.json）
//!
//! 保存所有已冻结的 tag 以及一个可变的 `thawed` 指针。
//! 读取时逐条校验，写入时先写临时文件再原子重命名。

use super::hasher::FileEntry;
use super::slug::{validate_tagname, THAWED_TAG};
use crate::error::{FreezeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// 不可变的快照记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub tag: String,
    pub parent: Option<String>,
    pub files: BTreeMap<String, FileEntry>,
    pub total: String,
    pub timestamp: i64,
}

impl Tag {
    /// 检查 tag 记录本身是否合法：名称、总摘要、哈希格式，以及路径不能逃出工作区
    pub fn check(&self) -> std::result::Result<(), String> {
        validate_tagname(&self.tag).map_err(|e| e.to_string())?;
        if self.total.is_empty() {
            return Err(format!("tag {} has no total", self.tag));
        }
        for (path, entry) in &self.files {
            if !is_checksum(&entry.checksum) {
                return Err(format!("tag {} has bad checksum for {}", self.tag, path));
            }
            if !is_relative_path(path) {
                return Err(format!("tag {} has unsafe path {}", self.tag, path));
            }
        }
        Ok(())
    }
}

/// 当前工作区指针
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThawedPointer {
    pub tag: String,
    pub parent: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Default for ThawedPointer {
    fn default() -> Self {
        Self {
            tag: THAWED_TAG.to_string(),
            parent: None,
            timestamp: 0,
        }
    }
}

/// 文件中的完整结构
#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestDoc {
    #[serde(default)]
    thawed: Option<ThawedPointer>,
    #[serde(default)]
    tags: Vec<Tag>,
}

pub struct Manifest {
    path: PathBuf,
}

impl Manifest {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: impl Into<String>) -> FreezeError {
        FreezeError::ManifestCorrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn load(&self) -> Result<ManifestDoc> {
        if !self.path.exists() {
            return Ok(ManifestDoc::default());
        }
        let data = fs::read(&self.path)?;
        let doc: ManifestDoc =
            serde_json::from_slice(&data).map_err(|e| self.corrupt(e.to_string()))?;
        self.validate(&doc)?;
        Ok(doc)
    }

    fn validate(&self, doc: &ManifestDoc) -> Result<()> {
        if let Some(thawed) = &doc.thawed {
            if thawed.tag != THAWED_TAG {
                return Err(self.corrupt(format!("thawed pointer named {}", thawed.tag)));
            }
        }

        let mut seen = BTreeSet::new();
        for tag in &doc.tags {
            tag.check().map_err(|reason| self.corrupt(reason))?;
            if !seen.insert(tag.tag.as_str()) {
                return Err(self.corrupt(format!("duplicate tag {}", tag.tag)));
            }
        }
        Ok(())
    }

    fn save(&self, doc: &ManifestDoc) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, serde_json::to_vec_pretty(doc)?)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    /// 所有已提交的 tag 名（不含 thawed）
    pub fn tags(&self) -> Result<BTreeSet<String>> {
        Ok(self.load()?.tags.into_iter().map(|t| t.tag).collect())
    }

    /// 所有 tag 记录
    pub fn tag_data(&self) -> Result<Vec<Tag>> {
        Ok(self.load()?.tags)
    }

    pub fn get_tag(&self, name: &str) -> Result<Tag> {
        self.load()?
            .tags
            .into_iter()
            .find(|t| t.tag == name)
            .ok_or_else(|| FreezeError::TagDoesNotExist(name.to_string()))
    }

    pub fn insert_tag(&self, tag: Tag) -> Result<()> {
        validate_tagname(&tag.tag)?;
        tag.check().map_err(|reason| self.corrupt(reason))?;
        let mut doc = self.load()?;
        if doc.tags.iter().any(|t| t.tag == tag.tag) {
            return Err(FreezeError::TagExists(tag.tag));
        }
        doc.tags.push(tag);
        self.save(&doc)
    }

    pub fn thawed_pointer(&self) -> Result<ThawedPointer> {
        Ok(self.load()?.thawed.unwrap_or_default())
    }

    /// 更新 thawed 指针的父 tag
    pub fn update_thawed_pointer(&self, parent: Option<String>) -> Result<()> {
        let mut doc = self.load()?;
        let mut pointer = doc.thawed.take().unwrap_or_default();
        pointer.parent = parent;
        pointer.timestamp = chrono::Utc::now().timestamp();
        doc.thawed = Some(pointer);
        self.save(&doc)
    }
}

fn is_checksum(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_relative_path(path: &str) -> bool {
    !path.is_empty()
        && path.split('/').all(|part| !part.is_empty() && part != "." && part != "..")
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}
