use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/**
 * \brief 标签集合，键为字符串、值为任意 JSON。
 */
pub type Labels = Map<String, Value>;

fn default_ai_timeout() -> u64 {
    30
}

fn default_ds_timeout() -> u64 {
    10
}

/**
 * \brief AI 后端配置，构建后不可变。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /** \brief 后端类型：OpenAi / DeepSeek / Claude */
    #[serde(rename = "type")]
    pub backend_type: String,
    /** \brief API 基地址，为空时使用后端默认地址 */
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    /** \brief 单次调用超时（秒） */
    #[serde(default = "default_ai_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/**
 * \brief 流式回复中的一个增量。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub delta_content: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LokiDirection {
    #[default]
    Backward,
    Forward,
}

impl LokiDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LokiDirection::Backward => "backward",
            LokiDirection::Forward => "forward",
        }
    }
}

/**
 * \brief Loki 专属查询参数。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LokiQueryKnobs {
    #[serde(default)]
    pub direction: LokiDirection,
}

/**
 * \brief 日志查询参数。
 *
 * 查询方法以 `&mut` 接收，并就地补齐缺省的时间窗口与条数上限。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQueryOptions {
    /** \brief 原始查询语句（LogsQL / LogQL） */
    pub query: String,
    /** \brief 起始时间（Unix 秒），缺省为 now-30m */
    #[serde(default)]
    pub start_at: Option<i64>,
    /** \brief 结束时间（Unix 秒），缺省为 now */
    #[serde(default)]
    pub end_at: Option<i64>,
    /** \brief 条数上限，0 表示使用默认值 */
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub loki: LokiQueryKnobs,
}

/**
 * \brief 一批日志的聚合结果。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogQueryResult {
    pub provider_name: String,
    pub metric: Labels,
    pub messages: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpSettings {
    pub url: String,
    /** \brief 超时（秒） */
    #[serde(default = "default_ds_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasicAuth {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

/**
 * \brief 告警数据源描述，由外部配置加载。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDataSource {
    /** \brief 数据源类型：VictoriaLogs / Loki */
    #[serde(rename = "type")]
    pub datasource_type: String,
    pub http: HttpSettings,
    #[serde(default)]
    pub auth: BasicAuth,
    #[serde(default)]
    pub labels: Labels,
}

/**
 * \brief 已校验的回调事件。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub challenge: Option<String>,
    pub user_id: Option<String>,
    pub raw_payload: Labels,
}

/**
 * \brief 交给外部收集器的静默请求。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertSilence {
    /** \brief 创建人显示名 */
    pub created_by: String,
    /** \brief 原始回调载荷 */
    pub source: Labels,
}

/**
 * \brief 按点分路径在 JSON 对象中取值，如 `event.operator.user_id`。
 */
pub fn lookup_path<'a>(root: &'a Labels, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels(v: Value) -> Labels {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn lookup_path_walks_nested_objects() {
        let root = labels(json!({"event": {"operator": {"user_id": "U1"}}}));
        assert_eq!(
            lookup_path(&root, "event.operator.user_id"),
            Some(&json!("U1"))
        );
        assert_eq!(lookup_path(&root, "event.missing"), None);
        assert_eq!(lookup_path(&root, "event.operator.user_id.deeper"), None);
    }

    #[test]
    fn lookup_path_top_level_key() {
        let root = labels(json!({"user_id": "U2"}));
        assert_eq!(lookup_path(&root, "user_id"), Some(&json!("U2")));
    }

    #[test]
    fn query_options_default_from_partial_json() {
        let opts: LogQueryOptions = serde_json::from_value(json!({"query": "error"})).unwrap();
        assert_eq!(opts.limit, 0);
        assert!(opts.start_at.is_none());
        assert_eq!(opts.loki.direction, LokiDirection::Backward);
    }

    #[test]
    fn chat_message_serializes_lowercase_role() {
        let v = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(v, json!({"role": "user", "content": "hi"}));
    }
}
