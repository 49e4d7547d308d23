use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::info;

use crate::error::{Error, Result};
use crate::http::{build_client, ensure_success, normalize_base, timeout_secs};
use crate::models::{lookup_path, AlertSilence};
use crate::webhook::SilenceCollector;

/** \brief 静默时长上限：一年。 */
pub const MAX_SILENCE_MINUTES: i64 = 366 * 24 * 60;

fn default_timeout() -> u64 {
    10
}

fn default_silence_minutes() -> i64 {
    120
}

fn default_labels_path() -> String {
    "action.value.labels".to_string()
}

/**
 * \brief Alertmanager 静默收集器配置。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertmanagerConfig {
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /** \brief 静默时长（分钟） */
    #[serde(default = "default_silence_minutes")]
    pub silence_minutes: i64,
    /** \brief 回调载荷中告警标签对象所在的点分路径 */
    #[serde(default = "default_labels_path")]
    pub labels_path: String,
}

/**
 * \brief 通过 Alertmanager v2 API 创建静默；持久化与抑制由 Alertmanager 负责。
 */
pub struct AlertmanagerCollector {
    url: String,
    timeout: Duration,
    window: time::Duration,
    labels_path: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct SilenceCreated {
    #[serde(rename = "silenceID", default)]
    silence_id: String,
}

impl AlertmanagerCollector {
    pub fn new(config: &AlertmanagerConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(Error::Config("alertmanager url required".into()));
        }
        if !(1..=MAX_SILENCE_MINUTES).contains(&config.silence_minutes) {
            return Err(Error::Config(format!(
                "alertmanager silence_minutes must be within 1..={}, got {}",
                MAX_SILENCE_MINUTES, config.silence_minutes
            )));
        }
        let timeout = timeout_secs(config.timeout_seconds);
        Ok(Self {
            url: normalize_base(&config.url, ""),
            timeout,
            window: time::Duration::minutes(config.silence_minutes),
            labels_path: config.labels_path.clone(),
            http: build_client(timeout)?,
        })
    }

    /**
     * \brief 由载荷中的标签对象生成精确匹配的 matchers。
     */
    fn matchers(&self, silence: &AlertSilence) -> Result<Vec<Value>> {
        let labels = lookup_path(&silence.source, &self.labels_path)
            .and_then(Value::as_object)
            .filter(|labels| !labels.is_empty())
            .ok_or_else(|| {
                Error::Payload(format!("no alert labels at `{}`", self.labels_path))
            })?;
        Ok(labels
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                json!({"name": name, "value": value, "isRegex": false, "isEqual": true})
            })
            .collect())
    }
}

#[async_trait]
impl SilenceCollector for AlertmanagerCollector {
    async fn create_silence(&self, silence: AlertSilence) -> Result<()> {
        let matchers = self.matchers(&silence)?;
        let now = OffsetDateTime::now_utc();
        let rfc3339 = |t: OffsetDateTime| {
            t.format(&Rfc3339)
                .map_err(|e| Error::Decode(format!("format silence time: {}", e)))
        };
        let ends_at = now
            .checked_add(self.window)
            .ok_or_else(|| Error::Config("alertmanager silence window out of range".into()))?;
        let body = json!({
            "matchers": matchers,
            "startsAt": rfc3339(now)?,
            "endsAt": rfc3339(ends_at)?,
            "createdBy": silence.created_by,
            "comment": format!("silenced from chat-ops by {}", silence.created_by),
        });
        let resp = self
            .http
            .post(format!("{}/api/v2/silences", self.url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        let created: SilenceCreated = ensure_success(resp, "alertmanager")
            .await?
            .json()
            .await
            .map_err(|e| Error::Decode(format!("alertmanager silence response: {}", e)))?;
        info!(silence_id = %created.silence_id, created_by = %silence.created_by, "alert silence created");
        Ok(())
    }
}
