//! 远端服务 HTTP 接口
//!
//! 所有请求体和响应体都是 JSON，使用 Bearer token 认证。

use crate::config::RemoteConfig;
use crate::core::{DatasetId, Tag};
use crate::error::{FreezeError, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

/// 远端缺少、需要上传的文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingFile {
    pub checksum: String,
    pub size: u64,
    pub upload_url: String,
}

/// stage_files 成功响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedFiles {
    pub stage_uuid: String,
    #[serde(default)]
    pub missing_files: Vec<MissingFile>,
    /// 远端已有的文件哈希
    #[serde(default)]
    pub uploaded_files: Vec<String>,
}

/// stage_files 的结果
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Staged(StagedFiles),
    /// 远端已有同名 tag，附带其总摘要
    Conflict { remote_total: String },
}

#[derive(Debug, Deserialize)]
struct ConflictBody {
    tag_checksum: String,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(default)]
    message: String,
}

/// stage_pull 成功响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedPull {
    pub tag_data: Tag,
    /// checksum -> 下载地址
    #[serde(default)]
    pub files_to_download: BTreeMap<String, String>,
}

/// list_datasets 中单个 tag 的信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTagInfo {
    pub checksum: String,
    pub created: i64,
}

/// dtype -> name -> tag -> 信息
pub type RemoteListing = BTreeMap<String, BTreeMap<String, BTreeMap<String, RemoteTagInfo>>>;

pub const DATASET_DOES_NOT_EXIST: &str = "DATASET_DOES_NOT_EXIST";
pub const TAG_DOES_NOT_EXIST: &str = "TAG_DOES_NOT_EXIST";

#[derive(Serialize)]
struct TagRequest<'a> {
    api_version: &'a str,
    dtype: &'a str,
    name: &'a str,
    tag: &'a str,
    tag_data: &'a Tag,
}

#[derive(Serialize)]
struct CommitFileRequest<'a> {
    stage_uuid: &'a str,
    dtype: &'a str,
    name: &'a str,
    checksum: &'a str,
}

#[derive(Serialize)]
struct StagePullRequest<'a> {
    api_version: &'a str,
    dtype: &'a str,
    name: &'a str,
    tag: &'a str,
    frozen_files: &'a BTreeSet<String>,
}

pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RemoteClient {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    /// 供传输任务共用的 HTTP 客户端
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn post<B: Serialize>(&self, endpoint: &str, body: &B) -> Result<reqwest::Response> {
        debug!("POST {}", endpoint);
        let request = self.authorize(self.http.post(self.url(endpoint))).json(body);
        Ok(request.send().await?)
    }

    async fn remote_error(endpoint: &str, response: reqwest::Response) -> FreezeError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        FreezeError::Remote {
            endpoint: endpoint.to_string(),
            status,
            message,
        }
    }

    /// 暂存一个 tag 的文件，得到需要上传的文件列表
    pub async fn stage_files(&self, id: &DatasetId, tag: &Tag) -> Result<StageOutcome> {
        let body = TagRequest {
            api_version: crate::API_VERSION,
            dtype: id.dtype(),
            name: id.name(),
            tag: &tag.tag,
            tag_data: tag,
        };
        let response = self.post("stage_files", &body).await?;
        match response.status() {
            StatusCode::OK => Ok(StageOutcome::Staged(response.json().await?)),
            StatusCode::CONFLICT => {
                let conflict: ConflictBody = response.json().await?;
                Ok(StageOutcome::Conflict {
                    remote_total: conflict.tag_checksum,
                })
            }
            _ => Err(Self::remote_error("stage_files", response).await),
        }
    }

    /// 通知远端校验并确认一个已上传的文件
    pub async fn commit_file(&self, stage_uuid: &str, id: &DatasetId, checksum: &str) -> Result<()> {
        let body = CommitFileRequest {
            stage_uuid,
            dtype: id.dtype(),
            name: id.name(),
            checksum,
        };
        let response = self.post("commit_file", &body).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::remote_error("commit_file", response).await)
        }
    }

    /// 所有文件确认后提交 tag
    pub async fn commit_tag(&self, id: &DatasetId, tag: &Tag) -> Result<()> {
        let body = TagRequest {
            api_version: crate::API_VERSION,
            dtype: id.dtype(),
            name: id.name(),
            tag: &tag.tag,
            tag_data: tag,
        };
        let response = self.post("commit_tag", &body).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::remote_error("commit_tag", response).await)
        }
    }

    /// 请求拉取一个 tag；只返回本地缺少的文件的下载地址
    pub async fn stage_pull(
        &self,
        id: &DatasetId,
        tag: &str,
        frozen_files: &BTreeSet<String>,
    ) -> Result<StagedPull> {
        let body = StagePullRequest {
            api_version: crate::API_VERSION,
            dtype: id.dtype(),
            name: id.name(),
            tag,
            frozen_files,
        };
        let response = self.post("stage_pull", &body).await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::CONFLICT => {
                let text = response.text().await.unwrap_or_default();
                let body: MessageBody =
                    serde_json::from_str(&text).unwrap_or(MessageBody { message: text });
                match body.message.as_str() {
                    DATASET_DOES_NOT_EXIST => Err(FreezeError::CloudDatasetDoesNotExist(id.slug())),
                    TAG_DOES_NOT_EXIST => {
                        Err(FreezeError::CloudTagDoesNotExist(format!("{}:{}", id.slug(), tag)))
                    }
                    _ => Err(FreezeError::Remote {
                        endpoint: "stage_pull".to_string(),
                        status: 409,
                        message: body.message,
                    }),
                }
            }
            _ => Err(Self::remote_error("stage_pull", response).await),
        }
    }

    /// 列出远端所有数据集
    pub async fn list_datasets(&self) -> Result<RemoteListing> {
        let response = self
            .authorize(self.http.get(self.url("list_datasets")))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(Self::remote_error("list_datasets", response).await)
        }
    }
}
