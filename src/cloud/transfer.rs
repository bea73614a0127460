//! 单文件传输 - 断点续传上传与校验下载
//!
//! 上传状态机：`cursor` 为下一个要发送的字节偏移，`None` 表示位置未知，
//! 需要先发送零长度探测请求。服务器返回 308 + `Range` 表示已收到的范围，
//! 此时直接从断点继续并清零重试计数；其他失败按指数退避重试。

use crate::config::TransferConfig;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 每个分块的内容哈希头
pub const CHUNK_CHECKSUM_HEADER: &str = "x-chunk-checksum";

/// 传输统计
#[derive(Debug, Default)]
pub struct TransferStats {
    active: AtomicUsize,
    peak_active: AtomicUsize,
    pub files_completed: AtomicU64,
    pub files_failed: AtomicU64,
    pub bytes_transferred: AtomicU64,
}

impl TransferStats {
    /// 标记一个传输开始，返回的守卫在析构时标记结束
    pub fn enter(&self) -> ActiveTransfer<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        ActiveTransfer { stats: self }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// 同时运行的传输数的最大值
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn record(&self, result: &Result<u64, String>) {
        match result {
            Ok(bytes) => {
                self.files_completed.fetch_add(1, Ordering::Relaxed);
                self.bytes_transferred.fetch_add(*bytes, Ordering::Relaxed);
            }
            Err(_) => {
                self.files_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct ActiveTransfer<'a> {
    stats: &'a TransferStats,
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 一次上传请求的结果
#[derive(Debug, PartialEq, Eq)]
enum UploadStep {
    Done,
    /// 服务器确认的下一个偏移
    Resume(u64),
    Retry(String),
}

/// 上传状态
struct UploadState {
    cursor: Option<u64>,
    tries: u32,
    bytes_sent: u64,
}

/// 解析 `Range: bytes=0-N`，返回下一个偏移 N+1
fn parse_range(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes=")?;
    let (_, last) = range.split_once('-')?;
    last.trim().parse::<u64>().ok().map(|n| n + 1)
}

fn classify(response: &reqwest::Response) -> UploadStep {
    let status = response.status();
    if status.is_success() {
        return UploadStep::Done;
    }
    if status == StatusCode::PERMANENT_REDIRECT {
        return match response.headers().get(RANGE) {
            // 没有 Range 表示服务器尚未收到任何字节
            None => UploadStep::Resume(0),
            Some(value) => match value.to_str().ok().and_then(parse_range) {
                Some(next) => UploadStep::Resume(next),
                None => UploadStep::Retry(format!("malformed Range header: {:?}", value)),
            },
        };
    }
    UploadStep::Retry(format!("unexpected status {}", status))
}

/// 退避等待；被取消时返回 false
async fn backoff(config: &TransferConfig, tries: u32, cancel: &CancellationToken) -> bool {
    let delay = config
        .retry_base_delay_ms
        .saturating_mul(2_u64.saturating_pow(tries));
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(delay)) => true,
        _ = cancel.cancelled() => false,
    }
}

async fn read_chunk(file: &mut File, offset: u64, chunk_size: usize) -> std::io::Result<Vec<u8>> {
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(chunk_size);
    (&mut *file).take(chunk_size as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// 断点续传上传单个文件，返回实际发送的字节数
pub async fn upload_file(
    http: &reqwest::Client,
    config: &TransferConfig,
    path: &Path,
    size: u64,
    url: &str,
    cancel: &CancellationToken,
) -> Result<u64, String> {
    let mut file = File::open(path)
        .await
        .map_err(|e| format!("open {:?}: {}", path, e))?;
    let chunk_size = config.chunk_size.max(1);
    let mut state = UploadState {
        cursor: Some(0),
        tries: 0,
        bytes_sent: 0,
    };

    loop {
        if cancel.is_cancelled() {
            return Err("cancelled".to_string());
        }

        let (step, sent, start) = match state.cursor {
            None => {
                // 位置未知，发送零长度探测
                let request = http
                    .put(url)
                    .header(CONTENT_RANGE, format!("bytes */{}", size))
                    .body(Vec::new());
                let step = match request.send().await {
                    Ok(resp) => classify(&resp),
                    Err(e) => UploadStep::Retry(e.to_string()),
                };
                (step, 0, None)
            }
            Some(start) => {
                let chunk = read_chunk(&mut file, start, chunk_size)
                    .await
                    .map_err(|e| format!("read {:?}: {}", path, e))?;
                let len = chunk.len() as u64;
                let content_range = if len == 0 {
                    format!("bytes */{}", size)
                } else {
                    format!("bytes {}-{}/{}", start, start + len - 1, size)
                };
                debug!("上传分块 {} ({} 字节)", content_range, len);

                let chunk_checksum = blake3::hash(&chunk).to_hex().to_string();
                let request = http
                    .put(url)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_RANGE, content_range)
                    .header(CHUNK_CHECKSUM_HEADER, chunk_checksum)
                    .body(Bytes::from(chunk));
                let step = match request.send().await {
                    Ok(resp) => classify(&resp),
                    Err(e) => UploadStep::Retry(e.to_string()),
                };
                (step, len, Some(start))
            }
        };

        match step {
            UploadStep::Done => {
                state.bytes_sent += sent;
                return Ok(state.bytes_sent);
            }
            UploadStep::Resume(next) if start.map_or(true, |s| next > s) => {
                // 只有分块确实推进了才清零重试计数
                if let Some(s) = start {
                    state.bytes_sent += (next - s).min(sent);
                    state.tries = 0;
                }
                state.cursor = Some(next.min(size));
            }
            other => {
                let reason = match other {
                    UploadStep::Retry(reason) => reason,
                    _ => "server made no progress".to_string(),
                };
                if state.tries + 1 >= config.max_tries {
                    return Err(format!("gave up after {} tries: {}", state.tries + 1, reason));
                }
                warn!(
                    "上传失败，{}ms 后重试 ({}/{}): {}",
                    config.retry_base_delay_ms.saturating_mul(2_u64.saturating_pow(state.tries)),
                    state.tries + 1,
                    config.max_tries,
                    reason
                );
                state.cursor = None;
                if !backoff(config, state.tries, cancel).await {
                    return Err("cancelled".to_string());
                }
                state.tries += 1;
            }
        }
    }
}

/// 下载单个文件到 `dest`，边写边哈希；完成后与期望哈希比对。
/// 网络错误会重试（服务器支持时从断点继续），哈希不符直接失败
pub async fn download_file(
    http: &reqwest::Client,
    config: &TransferConfig,
    url: &str,
    checksum: &str,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<u64, String> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dest)
        .await
        .map_err(|e| format!("create {:?}: {}", dest, e))?;
    let mut hasher = blake3::Hasher::new();
    let mut received = 0u64;
    let mut tries = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err("cancelled".to_string());
        }

        let mut request = http.get(url);
        if received > 0 {
            request = request.header(RANGE, format!("bytes={}-", received));
        }

        let failure = match request.send().await {
            Err(e) => e.to_string(),
            Ok(resp) => {
                let status = resp.status();
                let resumable = status == StatusCode::PARTIAL_CONTENT && received > 0;
                if status.is_success() && !resumable {
                    // 从头开始
                    file.flush().await.map_err(|e| e.to_string())?;
                    file.set_len(0).await.map_err(|e| e.to_string())?;
                    file.seek(std::io::SeekFrom::Start(0))
                        .await
                        .map_err(|e| e.to_string())?;
                    hasher = blake3::Hasher::new();
                    received = 0;
                }

                if status.is_success() {
                    let mut stream = resp.bytes_stream();
                    let mut stream_error = None;
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(chunk) => {
                                file.write_all(&chunk).await.map_err(|e| e.to_string())?;
                                hasher.update(&chunk);
                                received += chunk.len() as u64;
                            }
                            Err(e) => {
                                stream_error = Some(e.to_string());
                                break;
                            }
                        }
                    }
                    match stream_error {
                        None => {
                            file.flush().await.map_err(|e| e.to_string())?;
                            let actual = hasher.finalize().to_hex().to_string();
                            if actual != checksum {
                                return Err(format!(
                                    "checksum mismatch: expected {}, got {}",
                                    checksum, actual
                                ));
                            }
                            return Ok(received);
                        }
                        Some(e) => e,
                    }
                } else {
                    format!("unexpected status {}", status)
                }
            }
        };

        tries += 1;
        if tries >= config.max_tries {
            return Err(format!("gave up after {} tries: {}", tries, failure));
        }
        warn!("下载失败，重试 ({}/{}): {}", tries, config.max_tries, failure);
        if !backoff(config, tries - 1, cancel).await {
            return Err("cancelled".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(max_tries: u32) -> TransferConfig {
        TransferConfig {
            max_concurrent_transfers: 1,
            chunk_size: 16,
            max_tries,
            retry_base_delay_ms: 1,
        }
    }

    fn raw_response(status: &str, declared_len: usize, body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status, declared_len
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }

    /// 按顺序对每个连接返回一段原始响应，然后关闭连接；记录收到的请求头
    async fn serve_raw(responses: Vec<Vec<u8>>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                seen.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&head).to_lowercase());
                socket.write_all(&response).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        (format!("http://{}/blob", addr), requests)
    }

    fn sample() -> (Vec<u8>, String) {
        let content: Vec<u8> = (0..100u8).collect();
        let checksum = blake3::hash(&content).to_hex().to_string();
        (content, checksum)
    }

    #[tokio::test]
    async fn test_download_resumes_with_range_after_cut() {
        let (content, checksum) = sample();
        let (url, requests) = serve_raw(vec![
            raw_response("200 OK", 100, &content[..40]),
            raw_response("206 Partial Content", 60, &content[40..]),
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("blob");

        let received = download_file(
            &reqwest::Client::new(),
            &test_config(3),
            &url,
            &checksum,
            &dest,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(received, 100);
        assert_eq!(std::fs::read(&dest).unwrap(), content);
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].contains("range:"));
        assert!(requests[1].contains("range: bytes=40-"));
    }

    #[tokio::test]
    async fn test_download_restarts_when_server_ignores_range() {
        let (content, checksum) = sample();
        let (url, requests) = serve_raw(vec![
            raw_response("200 OK", 100, &content[..40]),
            raw_response("200 OK", 100, &content),
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("blob");

        let received = download_file(
            &reqwest::Client::new(),
            &test_config(3),
            &url,
            &checksum,
            &dest,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // 整个文件重新写入，而不是追加在前 40 字节之后
        assert_eq!(received, 100);
        assert_eq!(std::fs::read(&dest).unwrap(), content);
        assert!(requests.lock().unwrap()[1].contains("range: bytes=40-"));
    }

    #[tokio::test]
    async fn test_download_retries_server_errors() {
        let (content, checksum) = sample();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("blob");

        let received = download_file(
            &reqwest::Client::new(),
            &test_config(3),
            &format!("{}/blob", server.uri()),
            &checksum,
            &dest,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(received, 100);
        assert_eq!(std::fs::read(&dest).unwrap(), content);
    }

    #[tokio::test]
    async fn test_download_gives_up_after_max_tries() {
        let (_, checksum) = sample();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let err = download_file(
            &reqwest::Client::new(),
            &test_config(3),
            &format!("{}/blob", server.uri()),
            &checksum,
            &dir.path().join("blob"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.contains("gave up after 3 tries"), "{}", err);
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-1023"), Some(1024));
        assert_eq!(parse_range(" bytes=0-0 "), Some(1));
        assert_eq!(parse_range("bytes=0-"), None);
        assert_eq!(parse_range("0-10"), None);
        assert_eq!(parse_range("bytes=0-abc"), None);
    }

    #[test]
    fn test_stats_track_peak() {
        let stats = TransferStats::default();
        {
            let _a = stats.enter();
            let _b = stats.enter();
            assert_eq!(stats.active(), 2);
        }
        let _c = stats.enter();
        assert_eq!(stats.active(), 1);
        assert_eq!(stats.peak_active(), 2);
    }
}
