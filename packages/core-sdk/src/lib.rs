pub mod config;
pub mod error;
pub mod feishu;
mod http;
pub mod llm;
pub mod logs;
pub mod models;
pub mod server;
pub mod silence;
pub mod telemetry;
pub mod webhook;

pub use error::{Error, Result};

/**
 * \brief SDK 预导入集合，方便外部引用常用类型。
 */
pub mod prelude {
    pub use crate::config::{self, AppConfig};
    pub use crate::error::{Error, Result};
    pub use crate::llm::{new_ai_client, AiBackendKind, AiClient, CompletionStream};
    pub use crate::logs::{new_logs_provider, LogsBackendKind, LogsProvider};
    pub use crate::models::{BackendConfig, LogQueryOptions, LogQueryResult};
    pub use crate::server;
    pub use crate::telemetry;
    pub use crate::webhook::{Outcome, SilenceCollector, UserDirectory, WebhookPipeline};
}
