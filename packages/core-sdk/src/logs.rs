use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::http::{build_client, ensure_success, normalize_base, timeout_secs};
use crate::models::{AlertDataSource, Labels, LogQueryOptions, LogQueryResult};

pub const VICTORIA_LOGS_PROVIDER_NAME: &str = "VictoriaLogs";
pub const LOKI_PROVIDER_NAME: &str = "Loki";

/** \brief limit 为 0 时使用的默认条数上限。 */
pub const DEFAULT_QUERY_LIMIT: u32 = 500;
/** \brief 未指定起始时间时回看的分钟数。 */
pub const DEFAULT_WINDOW_MINUTES: i64 = 30;

/// Backend bookkeeping keys that never belong in a metric label set.
const BOOKKEEPING_KEYS: [&str; 3] = ["_stream", "_stream_id", "log.file.path"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogsBackendKind {
    VictoriaLogs,
    Loki,
}

impl LogsBackendKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "victorialogs" => Ok(LogsBackendKind::VictoriaLogs),
            "loki" => Ok(LogsBackendKind::Loki),
            _ => Err(Error::UnsupportedBackend {
                kind: "datasource",
                name: name.to_string(),
            }),
        }
    }
}

/**
 * \brief 日志查询后端统一接口。
 */
#[async_trait]
pub trait LogsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /**
     * \brief 执行一次查询，返回聚合结果与命中条数。
     *
     * 会就地补齐 `options` 的时间窗口与 limit。
     */
    async fn query(&self, options: &mut LogQueryOptions) -> Result<(Vec<LogQueryResult>, usize)>;

    /**
     * \brief 健康检查；仅当探测返回 200 时视为健康。
     */
    async fn health_check(&self) -> Result<()>;

    /**
     * \brief 数据源上静态配置的标签。
     */
    fn external_labels(&self) -> &Labels;
}

/**
 * \brief 根据数据源描述构建日志查询后端。
 */
pub fn new_logs_provider(datasource: &AlertDataSource) -> Result<Arc<dyn LogsProvider>> {
    let kind = LogsBackendKind::parse(&datasource.datasource_type)?;
    if datasource.http.url.trim().is_empty() {
        return Err(Error::Config(format!(
            "{} datasource requires http.url",
            datasource.datasource_type
        )));
    }
    let conn = Connection::new(datasource)?;
    let provider: Arc<dyn LogsProvider> = match kind {
        LogsBackendKind::VictoriaLogs => Arc::new(VictoriaLogsProvider { conn }),
        LogsBackendKind::Loki => Arc::new(LokiProvider { conn }),
    };
    Ok(provider)
}

struct Connection {
    url: String,
    timeout: Duration,
    external_labels: Labels,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl Connection {
    fn new(datasource: &AlertDataSource) -> Result<Self> {
        let timeout = timeout_secs(datasource.http.timeout);
        Ok(Self {
            url: normalize_base(&datasource.http.url, ""),
            timeout,
            external_labels: datasource.labels.clone(),
            username: datasource.auth.user.clone(),
            password: datasource.auth.pass.clone(),
            http: build_client(timeout)?,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let req = self
            .http
            .get(format!("{}{}", self.url, path))
            .timeout(self.timeout);
        if self.username.is_empty() {
            req
        } else {
            req.basic_auth(&self.username, Some(&self.password))
        }
    }

    async fn probe(&self, path: &str, backend: &'static str) -> Result<()> {
        let resp = self.get(path).send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            error!(backend, status = status.as_u16(), "unhealthy status");
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Status {
                backend,
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/**
 * \brief 补齐默认时间窗口（now-30m ~ now）与条数上限，返回最终窗口。
 */
fn normalize_options(options: &mut LogQueryOptions) -> (i64, i64) {
    let now = OffsetDateTime::now_utc();
    let start = *options.start_at.get_or_insert_with(|| {
        (now - time::Duration::minutes(DEFAULT_WINDOW_MINUTES)).unix_timestamp()
    });
    let end = *options.end_at.get_or_insert_with(|| now.unix_timestamp());
    if options.limit == 0 {
        options.limit = DEFAULT_QUERY_LIMIT;
    }
    (start, end)
}

/**
 * \brief VictoriaLogs（LogsQL）查询。
 */
pub struct VictoriaLogsProvider {
    conn: Connection,
}

#[async_trait]
impl LogsProvider for VictoriaLogsProvider {
    fn name(&self) -> &'static str {
        VICTORIA_LOGS_PROVIDER_NAME
    }

    async fn query(&self, options: &mut LogQueryOptions) -> Result<(Vec<LogQueryResult>, usize)> {
        let (start, end) = normalize_options(options);
        let params = [
            ("query", options.query.clone()),
            ("limit", options.limit.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
        ];
        let resp = self
            .conn
            .get("/select/logsql/query")
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "query victorialogs failed");
                Error::from(e)
            })?;
        let body = ensure_success(resp, "victorialogs").await?.text().await?;

        let entries = decode_ndjson(&body)?;
        let messages = entries
            .iter()
            .map(|entry| entry.get("_msg").cloned().unwrap_or(Value::Null))
            .collect();
        let count = entries.len();
        debug!(count, start, end, "victorialogs query decoded");

        Ok((
            vec![LogQueryResult {
                provider_name: VICTORIA_LOGS_PROVIDER_NAME.to_string(),
                metric: metric_labels(common_key_value_pairs(&entries)),
                messages,
            }],
            count,
        ))
    }

    async fn health_check(&self) -> Result<()> {
        self.conn.probe("/health", "victorialogs").await
    }

    fn external_labels(&self) -> &Labels {
        &self.conn.external_labels
    }
}

/**
 * \brief Loki（LogQL）查询，每个 stream 聚合为一条结果。
 */
pub struct LokiProvider {
    conn: Connection,
}

#[derive(Deserialize)]
struct LokiResponse {
    data: LokiData,
}

#[derive(Deserialize)]
struct LokiData {
    #[serde(default)]
    result: Vec<LokiStream>,
}

#[derive(Deserialize)]
struct LokiStream {
    #[serde(default)]
    stream: Labels,
    #[serde(default)]
    values: Vec<(String, String)>,
}

#[async_trait]
impl LogsProvider for LokiProvider {
    fn name(&self) -> &'static str {
        LOKI_PROVIDER_NAME
    }

    async fn query(&self, options: &mut LogQueryOptions) -> Result<(Vec<LogQueryResult>, usize)> {
        let (start, end) = normalize_options(options);
        let to_nanos = |secs: i64| (i128::from(secs) * 1_000_000_000).to_string();
        let params = [
            ("query", options.query.clone()),
            ("limit", options.limit.to_string()),
            ("start", to_nanos(start)),
            ("end", to_nanos(end)),
            ("direction", options.loki.direction.as_str().to_string()),
        ];
        let resp = self
            .conn
            .get("/loki/api/v1/query_range")
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "query loki failed");
                Error::from(e)
            })?;
        let body = ensure_success(resp, "loki").await?.text().await?;
        let parsed: LokiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Decode(format!("loki response: {}, content: {}", e, body)))?;

        let mut count = 0;
        let results = parsed
            .data
            .result
            .into_iter()
            .map(|stream| {
                count += stream.values.len();
                LogQueryResult {
                    provider_name: LOKI_PROVIDER_NAME.to_string(),
                    metric: metric_labels(stream.stream),
                    messages: stream
                        .values
                        .into_iter()
                        .map(|(_, line)| Value::String(line))
                        .collect(),
                }
            })
            .collect();
        debug!(count, start, end, "loki query decoded");
        Ok((results, count))
    }

    async fn health_check(&self) -> Result<()> {
        self.conn.probe("/ready", "loki").await
    }

    fn external_labels(&self) -> &Labels {
        &self.conn.external_labels
    }
}

/**
 * \brief 逐行解析 NDJSON；任意一行失败即整体失败，不返回部分结果。
 */
fn decode_ndjson(body: &str) -> Result<Vec<Labels>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<Labels>(line).map_err(|source| {
                error!(line, "decode log line failed");
                Error::DecodeLine {
                    line: line.to_string(),
                    source,
                }
            })
        })
        .collect()
}

/**
 * \brief 取所有条目中取值完全相同的键值对（交集）。
 */
pub fn common_key_value_pairs(entries: &[Labels]) -> Labels {
    let Some((first, rest)) = entries.split_first() else {
        return Labels::new();
    };
    let mut common = first.clone();
    common.retain(|key, value| rest.iter().all(|entry| entry.get(key) == Some(&*value)));
    common
}

fn metric_labels(mut labels: Labels) -> Labels {
    for key in BOOKKEEPING_KEYS {
        labels.remove(key);
    }
    labels
}
