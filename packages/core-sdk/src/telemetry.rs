use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;
use crate::error::{Error, Result};

/**
 * \brief 初始化全局 tracing 订阅者；`RUST_LOG` 优先于配置中的级别。
 */
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Config(format!("invalid log level {}: {}", config.level, e)))?;
    let builder = fmt().with_env_filter(filter).with_target(false);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| Error::Config(format!("install log subscriber failed: {}", e)))
}
