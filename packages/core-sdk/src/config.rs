use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::feishu::FeishuConfig;
use crate::models::{AlertDataSource, BackendConfig};
use crate::silence::AlertmanagerConfig;
use crate::webhook::WebhookSettings;

pub const CONFIG_ENV: &str = "ALERTPILOT_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "alertpilot.toml";

fn default_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /** \brief EnvFilter 指令，`RUST_LOG` 优先 */
    #[serde(default = "default_level")]
    pub level: String,
    /** \brief 是否输出 JSON 格式 */
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/**
 * \brief 进程级配置。未配置的后端对应的路由返回 503。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub ai: Option<BackendConfig>,
    #[serde(default)]
    pub datasource: Option<AlertDataSource>,
    #[serde(default)]
    pub feishu: Option<FeishuConfig>,
    #[serde(default)]
    pub alertmanager: Option<AlertmanagerConfig>,
    #[serde(default)]
    pub webhook: WebhookSettings,
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("parse config failed: {}", e)))
    }
}

/**
 * \brief 加载 TOML 配置文件，路径由 `resolve_path` 决定。
 *
 * 在日志初始化之前调用，不输出日志。
 */
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let path = resolve_path(path);
    let text = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("read {} failed: {}", path.display(), e)))?;
    AppConfig::from_toml(&text)
}

/**
 * \brief 配置文件查找顺序：显式路径 > `$ALERTPILOT_CONFIG` > `./alertpilot.toml`。
 */
pub fn resolve_path(path: Option<&Path>) -> PathBuf {
    if let Some(p) = path {
        return p.to_path_buf();
    }
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
