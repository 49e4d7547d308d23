use std::time::Duration;

use reqwest::{Client, Response};
use tracing::warn;

use crate::error::{Error, Result};

/**
 * \brief 构建共享 HTTP 客户端；连接池在同一后端的多次调用间复用。
 */
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("build http client failed: {}", e)))
}

pub(crate) fn timeout_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

/**
 * \brief 非 2xx 时读取响应体并转换为 `Error::Status`。
 */
pub(crate) async fn ensure_success(resp: Response, backend: &'static str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    warn!(backend, status = status.as_u16(), "upstream returned non-success status");
    Err(Error::Status {
        backend,
        status: status.as_u16(),
        body,
    })
}

/**
 * \brief 去掉末尾斜杠；为空时使用默认地址。
 */
pub(crate) fn normalize_base(configured: &str, fallback: &str) -> String {
    let trimmed = configured.trim();
    let base = if trimmed.is_empty() { fallback } else { trimmed };
    base.trim_end_matches('/').to_string()
}
