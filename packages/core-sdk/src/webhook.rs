use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::{lookup_path, AlertSilence, Labels, WebhookEvent};

fn default_actor_field() -> String {
    "user_id".to_string()
}

/**
 * \brief 回调解析设置。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /** \brief 操作人 ID 所在的点分路径，默认 `user_id` */
    #[serde(default = "default_actor_field")]
    pub actor_field: String,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            actor_field: default_actor_field(),
        }
    }
}

/**
 * \brief 聊天平台用户信息查询。
 */
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_name(&self, user_id: &str) -> Result<String>;
}

/**
 * \brief 外部告警静默收集器，负责持久化与后续抑制。
 */
#[async_trait]
pub trait SilenceCollector: Send + Sync {
    async fn create_silence(&self, silence: AlertSilence) -> Result<()>;
}

/**
 * \brief 一次回调处理的终态。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    SilenceCreated { created_by: String },
    Dropped { reason: String },
}

/**
 * \brief 回调事件处理流水线：握手应答 -> 解析操作人 -> 创建静默。
 *
 * 依赖在进程启动时构建一次后注入，测试可替换为假实现。
 */
pub struct WebhookPipeline {
    directory: Arc<dyn UserDirectory>,
    collector: Arc<dyn SilenceCollector>,
    actor_field: String,
}

impl WebhookPipeline {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        collector: Arc<dyn SilenceCollector>,
        settings: &WebhookSettings,
    ) -> Self {
        Self {
            directory,
            collector,
            actor_field: settings.actor_field.clone(),
        }
    }

    /**
     * \brief 解析并校验回调请求体。
     */
    pub fn receive(&self, body: &[u8]) -> Result<WebhookEvent> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| Error::Payload(format!("parse body failed: {}", e)))?;
        let Value::Object(raw_payload) = payload else {
            return Err(Error::Payload("body must be a JSON object".into()));
        };
        let challenge = text_field(&raw_payload, "challenge")?;
        // 操作人问题留给 enrich 处理，不能阻塞握手。
        let user_id = text_field(&raw_payload, &self.actor_field).ok().flatten();
        Ok(WebhookEvent {
            challenge,
            user_id,
            raw_payload,
        })
    }

    /**
     * \brief 握手应答体；无 challenge 时返回 None。
     */
    pub fn acknowledgement(event: &WebhookEvent) -> Option<Value> {
        event
            .challenge
            .as_ref()
            .map(|challenge| json!({ "challenge": challenge }))
    }

    /**
     * \brief 解析操作人并创建静默；任一步失败即丢弃，不会以空名字创建静默。
     */
    pub async fn enrich(&self, event: WebhookEvent) -> Outcome {
        let Some(user_id) = event.user_id.as_deref() else {
            let reason = match text_field(&event.raw_payload, &self.actor_field) {
                Err(err) => err.to_string(),
                Ok(_) => format!("payload has no `{}`", self.actor_field),
            };
            return dropped(reason);
        };

        let created_by = match self.directory.display_name(user_id).await {
            Ok(name) if !name.trim().is_empty() => name,
            Ok(_) => return dropped(format!("user {} has no display name", user_id)),
            Err(err) => return dropped(format!("resolve user {} failed: {}", user_id, err)),
        };

        let silence = AlertSilence {
            created_by: created_by.clone(),
            source: event.raw_payload,
        };
        match self.collector.create_silence(silence).await {
            Ok(()) => {
                info!(user_id, created_by = %created_by, "webhook silence created");
                Outcome::SilenceCreated { created_by }
            }
            Err(err) => dropped(format!("create silence failed: {}", err)),
        }
    }
}

fn dropped(reason: String) -> Outcome {
    warn!(reason = %reason, "webhook event dropped");
    Outcome::Dropped { reason }
}

fn text_field(raw: &Labels, path: &str) -> Result<Option<String>> {
    match lookup_path(raw, path) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(Error::Payload(format!(
            "`{}` must be a string, got {}",
            path, other
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeDirectory {
        pub lookups: Mutex<Vec<String>>,
        pub fail: bool,
    }

    #[async_trait]
    impl UserDirectory for FakeDirectory {
        async fn display_name(&self, user_id: &str) -> Result<String> {
            self.lookups.lock().unwrap().push(user_id.to_string());
            if self.fail {
                return Err(Error::Api {
                    backend: "feishu",
                    code: 99991663,
                    msg: "tenant token invalid".into(),
                });
            }
            Ok(format!("name-of-{}", user_id))
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeCollector {
        pub silences: Mutex<Vec<AlertSilence>>,
    }

    #[async_trait]
    impl SilenceCollector for FakeCollector {
        async fn create_silence(&self, silence: AlertSilence) -> Result<()> {
            self.silences.lock().unwrap().push(silence);
            Ok(())
        }
    }

    fn pipeline(
        directory: Arc<FakeDirectory>,
        collector: Arc<FakeCollector>,
        actor_field: &str,
    ) -> WebhookPipeline {
        WebhookPipeline::new(
            directory,
            collector,
            &WebhookSettings {
                actor_field: actor_field.to_string(),
            },
        )
    }

    #[test]
    fn receive_extracts_challenge_and_actor() {
        let p = pipeline(Default::default(), Default::default(), "user_id");
        let event = p
            .receive(br#"{"challenge":"abc123","user_id":"U1","extra":1}"#)
            .unwrap();
        assert_eq!(event.challenge.as_deref(), Some("abc123"));
        assert_eq!(event.user_id.as_deref(), Some("U1"));
        assert_eq!(event.raw_payload.get("extra"), Some(&json!(1)));
        assert_eq!(
            WebhookPipeline::acknowledgement(&event),
            Some(json!({"challenge": "abc123"}))
        );
    }

    #[test]
    fn receive_supports_nested_actor_field() {
        let p = pipeline(Default::default(), Default::default(), "event.operator.user_id");
        let event = p
            .receive(br#"{"event":{"operator":{"user_id":"U9"}}}"#)
            .unwrap();
        assert_eq!(event.user_id.as_deref(), Some("U9"));
        assert!(WebhookPipeline::acknowledgement(&event).is_none());
    }

    #[test]
    fn receive_rejects_invalid_payloads() {
        let p = pipeline(Default::default(), Default::default(), "user_id");
        assert!(matches!(p.receive(b"{not json"), Err(Error::Payload(_))));
        assert!(matches!(p.receive(b"[1,2]"), Err(Error::Payload(_))));
        assert!(matches!(
            p.receive(br#"{"challenge":42}"#),
            Err(Error::Payload(_))
        ));
    }

    #[test]
    fn mistyped_actor_does_not_block_the_handshake() {
        let p = pipeline(Default::default(), Default::default(), "user_id");
        let event = p
            .receive(br#"{"challenge":"abc123","user_id":12345}"#)
            .unwrap();
        assert_eq!(event.user_id, None);
        assert_eq!(
            WebhookPipeline::acknowledgement(&event),
            Some(json!({"challenge": "abc123"}))
        );
    }

    #[tokio::test]
    async fn enrich_creates_one_silence_attributed_to_display_name() {
        let directory = Arc::new(FakeDirectory::default());
        let collector = Arc::new(FakeCollector::default());
        let p = pipeline(directory.clone(), collector.clone(), "user_id");

        let event = p.receive(br#"{"user_id":"U1","alert":"HighCPU"}"#).unwrap();
        let outcome = p.enrich(event).await;

        assert_eq!(
            outcome,
            Outcome::SilenceCreated {
                created_by: "name-of-U1".into()
            }
        );
        assert_eq!(*directory.lookups.lock().unwrap(), vec!["U1".to_string()]);
        let silences = collector.silences.lock().unwrap();
        assert_eq!(silences.len(), 1);
        assert_eq!(silences[0].created_by, "name-of-U1");
        assert_eq!(silences[0].source.get("alert"), Some(&json!("HighCPU")));
    }

    #[tokio::test]
    async fn enrich_drops_when_lookup_fails() {
        let directory = Arc::new(FakeDirectory {
            fail: true,
            ..Default::default()
        });
        let collector = Arc::new(FakeCollector::default());
        let p = pipeline(directory.clone(), collector.clone(), "user_id");

        let event = p.receive(br#"{"user_id":"U1"}"#).unwrap();
        let outcome = p.enrich(event).await;

        assert!(matches!(outcome, Outcome::Dropped { .. }));
        assert_eq!(directory.lookups.lock().unwrap().len(), 1);
        assert!(collector.silences.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enrich_drops_without_actor() {
        let directory = Arc::new(FakeDirectory::default());
        let collector = Arc::new(FakeCollector::default());
        let p = pipeline(directory.clone(), collector.clone(), "user_id");

        let event = p.receive(br#"{"challenge":"abc"}"#).unwrap();
        let outcome = p.enrich(event).await;

        assert!(matches!(outcome, Outcome::Dropped { .. }));
        assert!(directory.lookups.lock().unwrap().is_empty());
        assert!(collector.silences.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enrich_drops_mistyped_actor_without_lookup() {
        let directory = Arc::new(FakeDirectory::default());
        let collector = Arc::new(FakeCollector::default());
        let p = pipeline(directory.clone(), collector.clone(), "user_id");

        let event = p.receive(br#"{"user_id":{"id":"U1"}}"#).unwrap();
        let Outcome::Dropped { reason } = p.enrich(event).await else {
            panic!("mistyped actor must be dropped");
        };

        assert!(reason.contains("must be a string"));
        assert!(directory.lookups.lock().unwrap().is_empty());
        assert!(collector.silences.lock().unwrap().is_empty());
    }
}
