use axum::http::StatusCode;
use thiserror::Error;

/**
 * \brief SDK 统一错误类型：配置、传输、解码、回调载荷四类。
 */
#[derive(Debug, Error)]
pub enum Error {
    /** \brief 未识别的后端类型，工厂拒绝构建客户端。 */
    #[error("unsupported {kind} type: {name}")]
    UnsupportedBackend { kind: &'static str, name: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /** \brief 网络失败或超时。 */
    #[error("request failed: {0}")]
    Transport(String),

    /** \brief 上游返回非成功状态码，携带响应体。 */
    #[error("{backend} request failed: {status} -> {body}")]
    Status {
        backend: &'static str,
        status: u16,
        body: String,
    },

    /** \brief 上游返回业务错误码（HTTP 200 但 code != 0）。 */
    #[error("{backend} api error: code={code} msg={msg}")]
    Api {
        backend: &'static str,
        code: i64,
        msg: String,
    },

    /** \brief NDJSON 中某一行无法解析，整批结果作废。 */
    #[error("decode line failed: {source}, content: {line}")]
    DecodeLine {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("decode failed: {0}")]
    Decode(String),

    /** \brief 回调请求体不合法。 */
    #[error("invalid webhook payload: {0}")]
    Payload(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /**
     * \brief HTTP 边界上的状态码映射。
     */
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::UnsupportedBackend { .. } | Error::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::Transport(_)
            | Error::Status { .. }
            | Error::Api { .. }
            | Error::DecodeLine { .. }
            | Error::Decode(_) => StatusCode::BAD_GATEWAY,
            Error::Payload(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Transport("operation timed out".to_string())
    }
}
