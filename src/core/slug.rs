//! 数据集标识（slug）
//!
//! 格式：`<dtype>.<name>[:<tag>]`。dtype/name 不能包含 `.`、`/`、`:`，
//! tag 不能包含 `:`，且 `thawed` 是保留名。

use crate::error::{FreezeError, Result};

/// 当前工作区指针使用的保留 tag 名
pub const THAWED_TAG: &str = "thawed";

/// 校验 dtype 或 name
pub fn validate_freezable_name(name: &str) -> Result<&str> {
    if name.is_empty() || name.contains(['.', '/', '\\', ':']) {
        return Err(FreezeError::FreezableNameInvalid(name.to_string()));
    }
    Ok(name)
}

/// 校验 tag 名
pub fn validate_tagname(tag: &str) -> Result<&str> {
    if tag.is_empty() || tag.contains(':') || tag == THAWED_TAG {
        return Err(FreezeError::TagInvalid(tag.to_string()));
    }
    Ok(tag)
}

/// 数据集身份：(dtype, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId {
    dtype: String,
    name: String,
}

impl DatasetId {
    pub fn new(dtype: &str, name: &str) -> Result<Self> {
        Ok(Self {
            dtype: validate_freezable_name(dtype)?.to_string(),
            name: validate_freezable_name(name)?.to_string(),
        })
    }

    pub fn dtype(&self) -> &str {
        &self.dtype
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 规范 slug，同时也是本地数据集目录名
    pub fn slug(&self) -> String {
        format!("{}.{}", self.dtype, self.name)
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.dtype, self.name)
    }
}

/// 生成 slug
pub fn to_slug(dtype: &str, name: &str, tag: Option<&str>) -> Result<String> {
    let id = DatasetId::new(dtype, name)?;
    match tag {
        Some(tag) => Ok(format!("{}:{}", id.slug(), validate_tagname(tag)?)),
        None => Ok(id.slug()),
    }
}

/// 解析 slug，返回 (dtype, name, tag)
pub fn parse_slug(slug: &str) -> Result<(String, String, Option<String>)> {
    let (rest, tag) = match slug.split_once(':') {
        Some((rest, tag)) => (rest, Some(validate_tagname(tag)?.to_string())),
        None => (slug, None),
    };
    let (dtype, name) = rest
        .split_once('.')
        .ok_or_else(|| FreezeError::FreezableNameInvalid(rest.to_string()))?;
    let id = DatasetId::new(dtype, name)?;
    Ok((id.dtype, id.name, tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_round_trip() {
        let slug = to_slug("Cohort", "experiment1", Some("v1")).unwrap();
        assert_eq!(slug, "Cohort.experiment1:v1");
        assert_eq!(
            parse_slug(&slug).unwrap(),
            ("Cohort".to_string(), "experiment1".to_string(), Some("v1".to_string()))
        );

        let bare = to_slug("Cohort", "experiment1", None).unwrap();
        assert_eq!(
            parse_slug(&bare).unwrap(),
            ("Cohort".to_string(), "experiment1".to_string(), None)
        );
    }

    #[test]
    fn test_invalid_names() {
        for bad in ["", "a.b", "a/b", "a:b"] {
            assert!(matches!(
                validate_freezable_name(bad),
                Err(FreezeError::FreezableNameInvalid(_))
            ));
        }
        for bad in ["", "v:1", "thawed"] {
            assert!(matches!(validate_tagname(bad), Err(FreezeError::TagInvalid(_))));
        }
        assert!(parse_slug("nodot").is_err());
        assert!(parse_slug("a.b.c").is_err());
        assert!(parse_slug("a.b:x:y").is_err());
    }
}
