use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::error::Error;
use crate::feishu::FeishuDirectory;
use crate::llm::{new_ai_client, AiClient};
use crate::logs::{new_logs_provider, LogsProvider};
use crate::models::{Labels, LogQueryOptions, LogQueryResult};
use crate::silence::AlertmanagerCollector;
use crate::webhook::WebhookPipeline;

/**
 * \brief 路由共享状态；客户端在启动时构建一次，由各请求任务并发复用。
 */
#[derive(Clone, Default)]
pub struct AppState {
    pub ai: Option<Arc<dyn AiClient>>,
    pub logs: Option<Arc<dyn LogsProvider>>,
    pub webhook: Option<Arc<WebhookPipeline>>,
}

impl AppState {
    /**
     * \brief 按配置构建各后端；任一配置非法则启动失败。
     */
    pub fn from_config(config: &AppConfig) -> crate::error::Result<Self> {
        let ai = config.ai.as_ref().map(new_ai_client).transpose()?;
        let logs = config
            .datasource
            .as_ref()
            .map(new_logs_provider)
            .transpose()?;
        let webhook = match (&config.feishu, &config.alertmanager) {
            (Some(feishu), Some(alertmanager)) => Some(Arc::new(WebhookPipeline::new(
                Arc::new(FeishuDirectory::new(feishu)?),
                Arc::new(AlertmanagerCollector::new(alertmanager)?),
                &config.webhook,
            ))),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "webhook requires both [feishu] and [alertmanager]".into(),
                ))
            }
        };
        Ok(Self { ai, logs, webhook })
    }
}

/**
 * \brief 启动 HTTP 服务。
 */
pub async fn run(config: &AppConfig) -> Result<()> {
    let state = AppState::from_config(config)?;
    let listener = tokio::net::TcpListener::bind(&config.server.addr).await?;
    info!(
        addr = %config.server.addr,
        ai = state.ai.is_some(),
        logs = state.logs.is_some(),
        webhook = state.webhook.is_some(),
        "server listening"
    );
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/v1/ai/chat", post(ai_chat))
        .route("/api/v1/ai/sse", get(ai_sse))
        .route("/api/v1/ai/health", get(ai_health))
        .route("/api/v1/logs/query", post(logs_query))
        .route("/api/v1/logs/health", get(logs_health))
        .route("/api/v1/event/feishu", post(feishu_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type HandlerError = (StatusCode, String);

fn upstream_err(e: Error) -> HandlerError {
    (e.status_code(), e.to_string())
}

fn require<'a, T: ?Sized>(slot: &'a Option<Arc<T>>, what: &str) -> Result<&'a Arc<T>, HandlerError> {
    slot.as_ref().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("{} backend not configured", what),
        )
    })
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

#[derive(Deserialize, Debug)]
struct PromptRequest {
    /** \brief 用户输入 */
    prompt: String,
}

/**
 * \brief 非流式对话：POST /api/v1/ai/chat
 */
async fn ai_chat(
    State(state): State<AppState>,
    Json(req): Json<PromptRequest>,
) -> Result<Json<Value>, HandlerError> {
    let client = require(&state.ai, "ai")?;
    let content = client
        .chat_completion(&req.prompt)
        .await
        .map_err(upstream_err)?;
    Ok(Json(json!({ "content": content })))
}

/**
 * \brief 流式对话：GET /api/v1/ai/sse?prompt=...；客户端断开即取消上游流。
 */
async fn ai_sse(
    State(state): State<AppState>,
    Query(q): Query<PromptRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, HandlerError> {
    let client = require(&state.ai, "ai")?;
    let cancel = CancellationToken::new();
    let mut deltas = client
        .stream_completion(&q.prompt, cancel.clone())
        .await
        .map_err(upstream_err)?;
    let guard = cancel.drop_guard();

    let events = async_stream::stream! {
        let _guard = guard;
        while let Some(item) = deltas.next().await {
            match item {
                Ok(delta) => yield Ok::<Event, Infallible>(Event::default().data(delta)),
                Err(e) => {
                    error!(error = %e, "ai stream failed");
                    yield Ok(Event::default().event("error").data(e.to_string()));
                    return;
                }
            }
        }
        yield Ok(Event::default().event("done").data(""));
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::new()))
}

/**
 * \brief 健康检查：探测 AI 后端模型列表接口。
 */
async fn ai_health(State(state): State<AppState>) -> Result<Json<Value>, HandlerError> {
    let client = require(&state.ai, "ai")?;
    let provider = client.kind().as_str();
    Ok(Json(match client.health_check().await {
        Ok(()) => json!({ "ok": true, "provider": provider }),
        Err(e) => json!({ "ok": false, "provider": provider, "error": e.to_string() }),
    }))
}

#[derive(Serialize, Debug)]
struct LogQueryResponse {
    results: Vec<LogQueryResult>,
    count: usize,
    external_labels: Labels,
    /** \brief 补齐默认值后实际下发的查询参数 */
    options: LogQueryOptions,
}

/**
 * \brief 日志查询：POST /api/v1/logs/query
 */
async fn logs_query(
    State(state): State<AppState>,
    Json(mut options): Json<LogQueryOptions>,
) -> Result<Json<LogQueryResponse>, HandlerError> {
    let provider = require(&state.logs, "datasource")?;
    let (results, count) = provider.query(&mut options).await.map_err(upstream_err)?;
    Ok(Json(LogQueryResponse {
        results,
        count,
        external_labels: provider.external_labels().clone(),
        options,
    }))
}

async fn logs_health(State(state): State<AppState>) -> Result<Json<Value>, HandlerError> {
    let provider = require(&state.logs, "datasource")?;
    Ok(Json(match provider.health_check().await {
        Ok(()) => json!({ "ok": true, "provider": provider.name() }),
        Err(e) => json!({ "ok": false, "provider": provider.name(), "error": e.to_string() }),
    }))
}

/**
 * \brief 飞书事件回调：先应答握手，再异步解析操作人并创建静默。
 */
async fn feishu_event(State(state): State<AppState>, body: Bytes) -> Response {
    let pipeline = match require(&state.webhook, "webhook") {
        Ok(p) => p.clone(),
        Err(e) => return e.into_response(),
    };
    let event = match pipeline.receive(&body) {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "feishu callback payload rejected");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let ack = match WebhookPipeline::acknowledgement(&event) {
        Some(body) => Json(body).into_response(),
        None => StatusCode::OK.into_response(),
    };
    tokio::spawn(async move {
        let outcome = pipeline.enrich(event).await;
        debug!(?outcome, "feishu callback processed");
    });
    ack
}
