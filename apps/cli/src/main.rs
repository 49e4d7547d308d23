use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use alertpilot_core_sdk::prelude::*;

/**
 * \brief CLI 程序入口：启动服务，或直接调用已配置的后端。
 */
#[derive(Parser, Debug)]
#[command(name = "alertpilot", version, about = "Alert management backend")]
struct Cli {
    /** \brief 配置文件路径，缺省读取 $ALERTPILOT_CONFIG 或 ./alertpilot.toml */
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务（AI、日志查询与飞书回调）。
     */
    Serve {
        /** \brief 覆盖配置中的监听地址 */
        #[arg(long)]
        addr: Option<String>,
    },

    /**
     * \brief 向 AI 后端发送一条消息；默认流式输出，Ctrl-C 中止。
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = false)]
        no_stream: bool,
    },

    /**
     * \brief 查询日志数据源并以 JSON 输出。
     */
    Query {
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = 0)]
        limit: u32,
        /** \brief 起始时间（Unix 秒） */
        #[arg(long)]
        start: Option<i64>,
        /** \brief 结束时间（Unix 秒） */
        #[arg(long)]
        end: Option<i64>,
    },

    /**
     * \brief 探测所有已配置后端的健康状态。
     */
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load(cli.config.as_deref()).context("load config failed")?;
    telemetry::init(&config.log).context("init logging failed")?;
    info!(
        path = %config::resolve_path(cli.config.as_deref()).display(),
        "configuration loaded"
    );

    match cli.command {
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                config.server.addr = addr;
            }
            server::run(&config).await?;
        }
        Commands::Chat { prompt, no_stream } => {
            let backend = config.ai.as_ref().context("no [ai] section in config")?;
            let client = new_ai_client(backend).context("create ai client failed")?;

            if no_stream {
                let content = client
                    .chat_completion(&prompt)
                    .await
                    .context("chat completion failed")?;
                println!("{}", content);
                return Ok(());
            }

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling stream");
                    on_interrupt.cancel();
                }
            });

            let mut stream = client
                .stream_completion(&prompt, cancel)
                .await
                .context("create stream failed")?;
            while let Some(delta) = stream.next().await.transpose().context("stream error")? {
                print!("{}", delta);
                std::io::stdout().flush().ok();
            }
            println!();
        }
        Commands::Query {
            query,
            limit,
            start,
            end,
        } => {
            let datasource = config
                .datasource
                .as_ref()
                .context("no [datasource] section in config")?;
            let provider = new_logs_provider(datasource).context("create logs provider failed")?;
            let mut options = LogQueryOptions {
                query,
                start_at: start,
                end_at: end,
                limit,
                ..Default::default()
            };
            let (results, count) = provider
                .query(&mut options)
                .await
                .context("query logs failed")?;
            for result in &results {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            eprintln!(
                "{} entries from {} ({} .. {})",
                count,
                provider.name(),
                options.start_at.unwrap_or_default(),
                options.end_at.unwrap_or_default()
            );
        }
        Commands::Health => {
            let mut healthy = true;
            if let Some(backend) = &config.ai {
                let client = new_ai_client(backend).context("create ai client failed")?;
                healthy &= report(client.kind().as_str(), client.health_check().await);
            }
            if let Some(datasource) = &config.datasource {
                let provider =
                    new_logs_provider(datasource).context("create logs provider failed")?;
                healthy &= report(provider.name(), provider.health_check().await);
            }
            if !healthy {
                anyhow::bail!("one or more backends are unhealthy");
            }
        }
    }

    Ok(())
}

fn report(name: &str, result: alertpilot_core_sdk::Result<()>) -> bool {
    match result {
        Ok(()) => {
            println!("{:<14} ok", name);
            true
        }
        Err(e) => {
            println!("{:<14} FAIL {}", name, e);
            false
        }
    }
}
