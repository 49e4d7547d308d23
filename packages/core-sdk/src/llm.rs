use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    RequestBuilder, Response,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::http::{build_client, ensure_success, normalize_base, timeout_secs};
use crate::models::{BackendConfig, ChatMessage, Role, StreamChunk};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_CLAUDE_MAX_TOKENS: u32 = 1024;
const STREAM_BUFFER: usize = 64;

/**
 * \brief 已支持的 AI 后端集合。新增后端只需增加一个枚举值与一个工厂分支。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiBackendKind {
    OpenAi,
    DeepSeek,
    Claude,
}

impl AiBackendKind {
    /**
     * \brief 解析配置中的类型字符串；未知类型直接报错，不做默认回退。
     */
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(AiBackendKind::OpenAi),
            "deepseek" => Ok(AiBackendKind::DeepSeek),
            "claude" | "anthropic" => Ok(AiBackendKind::Claude),
            _ => Err(Error::UnsupportedBackend {
                kind: "ai",
                name: name.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AiBackendKind::OpenAi => "openai",
            AiBackendKind::DeepSeek => "deepseek",
            AiBackendKind::Claude => "claude",
        }
    }

    fn default_base(&self) -> &'static str {
        match self {
            AiBackendKind::OpenAi => "https://api.openai.com",
            AiBackendKind::DeepSeek => "https://api.deepseek.com",
            AiBackendKind::Claude => "https://api.anthropic.com",
        }
    }
}

/**
 * \brief AI 聊天后端统一接口。
 *
 * 实现只持有配置与连接池，可被多个请求任务并发共享。
 */
#[async_trait]
pub trait AiClient: Send + Sync {
    fn kind(&self) -> AiBackendKind;

    /**
     * \brief 非流式调用，返回完整回复。
     */
    async fn chat_completion(&self, prompt: &str) -> Result<String>;

    /**
     * \brief 流式调用；取消 `cancel` 后输出流会在有限时间内结束。
     */
    async fn stream_completion(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<CompletionStream>;

    /**
     * \brief 健康检查：请求模型列表接口。
     */
    async fn health_check(&self) -> Result<()>;
}

/**
 * \brief 根据配置构建对应的 AI 客户端。
 */
pub fn new_ai_client(config: &BackendConfig) -> Result<Arc<dyn AiClient>> {
    let kind = AiBackendKind::parse(&config.backend_type)?;
    let client: Arc<dyn AiClient> = match kind {
        AiBackendKind::OpenAi | AiBackendKind::DeepSeek => {
            Arc::new(OpenAiClient::new(kind, config)?)
        }
        AiBackendKind::Claude => Arc::new(ClaudeClient::new(config)?),
    };
    debug!(backend = kind.as_str(), model = %config.model, "ai client created");
    Ok(client)
}

/**
 * \brief 流式增量输出。
 *
 * 由后台任务通过有界 channel 推送；令牌取消后不再交付任何增量。
 * 以 `Err` 结尾表示上游出错，直接结束表示正常完成。
 */
pub struct CompletionStream {
    inner: ReceiverStream<Result<String>>,
    cancel: CancellationToken,
}

impl Stream for CompletionStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.inner.poll_next_unpin(cx)
    }
}

/// Per-backend connection settings shared by every variant.
struct Endpoint {
    base: String,
    api_key: String,
    model: String,
    max_tokens: Option<u32>,
    timeout: Duration,
    http: reqwest::Client,
}

impl Endpoint {
    fn new(kind: AiBackendKind, config: &BackendConfig) -> Result<Self> {
        let timeout = timeout_secs(config.timeout_seconds);
        Ok(Self {
            base: normalize_base(&config.endpoint, kind.default_base()),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout,
            http: build_client(timeout)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send_unary(&self, req: RequestBuilder, backend: &'static str) -> Result<Response> {
        let resp = req.timeout(self.timeout).send().await?;
        ensure_success(resp, backend).await
    }

    // The body of a stream outlives any sane request timeout, so only the
    // wait for response headers is bounded.
    async fn send_streaming(&self, req: RequestBuilder, backend: &'static str) -> Result<Response> {
        let resp = tokio::time::timeout(self.timeout, req.send()).await??;
        ensure_success(resp, backend).await
    }
}

/**
 * \brief OpenAI 兼容协议客户端（OpenAI、DeepSeek）。
 */
pub struct OpenAiClient {
    kind: AiBackendKind,
    endpoint: Endpoint,
    chat_path: &'static str,
    models_path: &'static str,
}

impl OpenAiClient {
    pub fn new(kind: AiBackendKind, config: &BackendConfig) -> Result<Self> {
        let (chat_path, models_path) = match kind {
            AiBackendKind::DeepSeek => ("/chat/completions", "/models"),
            _ => ("/v1/chat/completions", "/v1/models"),
        };
        Ok(Self {
            kind,
            endpoint: Endpoint::new(kind, config)?,
            chat_path,
            models_path,
        })
    }

    fn request(&self, prompt: &str, stream: bool) -> RequestBuilder {
        let mut body = json!({
            "model": self.endpoint.model,
            "messages": [ChatMessage::user(prompt)],
            "stream": stream,
        });
        if let Some(max) = self.endpoint.max_tokens {
            body["max_tokens"] = json!(max);
        }
        self.endpoint
            .http
            .post(self.endpoint.url(self.chat_path))
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(&self.endpoint.api_key)
            .json(&body)
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamFrame {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
}

#[derive(Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl AiClient for OpenAiClient {
    fn kind(&self) -> AiBackendKind {
        self.kind
    }

    async fn chat_completion(&self, prompt: &str) -> Result<String> {
        let backend = self.kind.as_str();
        let resp = self
            .endpoint
            .send_unary(self.request(prompt, false), backend)
            .await?;
        let parsed: OpenAiResponse = decode_body(resp).await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Decode(format!("{} response contained no content", backend)))
    }

    async fn stream_completion(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<CompletionStream> {
        let resp = self
            .endpoint
            .send_streaming(self.request(prompt, true), self.kind.as_str())
            .await?;
        Ok(spawn_stream_pump(resp, cancel, self.kind, decode_openai_frame))
    }

    async fn health_check(&self) -> Result<()> {
        let req = self
            .endpoint
            .http
            .get(self.endpoint.url(self.models_path))
            .bearer_auth(&self.endpoint.api_key);
        self.endpoint.send_unary(req, self.kind.as_str()).await?;
        Ok(())
    }
}

/**
 * \brief Anthropic Messages API 客户端。
 */
pub struct ClaudeClient {
    endpoint: Endpoint,
}

impl ClaudeClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new(AiBackendKind::Claude, config)?,
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.endpoint.api_key)
                .map_err(|e| Error::Config(format!("invalid claude api key: {}", e)))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        Ok(headers)
    }

    fn request(&self, prompt: &str, stream: bool) -> Result<RequestBuilder> {
        let (system_prompt, payload_messages) = anthropic_payload(&[ChatMessage::user(prompt)]);
        let mut body = json!({
            "model": self.endpoint.model,
            "max_tokens": self.endpoint.max_tokens.unwrap_or(DEFAULT_CLAUDE_MAX_TOKENS),
            "messages": payload_messages,
            "stream": stream,
        });
        if let Some(sys) = system_prompt {
            body["system"] = json!(sys);
        }
        Ok(self
            .endpoint
            .http
            .post(self.endpoint.url("/v1/messages"))
            .headers(self.headers()?)
            .json(&body))
    }
}

#[derive(Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeBlock>,
}

#[derive(Deserialize)]
struct ClaudeBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeEvent {
    ContentBlockDelta { delta: ClaudeBlock },
    MessageStop,
    Error { error: ClaudeErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ClaudeErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[async_trait]
impl AiClient for ClaudeClient {
    fn kind(&self) -> AiBackendKind {
        AiBackendKind::Claude
    }

    async fn chat_completion(&self, prompt: &str) -> Result<String> {
        let resp = self
            .endpoint
            .send_unary(self.request(prompt, false)?, "claude")
            .await?;
        let parsed: ClaudeResponse = decode_body(resp).await?;
        if parsed.content.is_empty() {
            return Err(Error::Decode("claude response contained no content".into()));
        }
        Ok(parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join(""))
    }

    async fn stream_completion(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<CompletionStream> {
        let resp = self
            .endpoint
            .send_streaming(self.request(prompt, true)?, "claude")
            .await?;
        Ok(spawn_stream_pump(
            resp,
            cancel,
            AiBackendKind::Claude,
            decode_claude_frame,
        ))
    }

    async fn health_check(&self) -> Result<()> {
        let req = self
            .endpoint
            .http
            .get(self.endpoint.url("/v1/models"))
            .headers(self.headers()?);
        self.endpoint.send_unary(req, "claude").await?;
        Ok(())
    }
}

async fn decode_body<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T> {
    let text = resp.text().await?;
    serde_json::from_str(&text).map_err(|e| Error::Decode(format!("{}, content: {}", e, text)))
}

fn anthropic_payload(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut items = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.clone()),
            Role::Assistant => items.push(json!({
                "role": "assistant",
                "content": [{"type": "text", "text": msg.content}]
            })),
            Role::User => items.push(json!({
                "role": "user",
                "content": [{"type": "text", "text": msg.content}]
            })),
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_prompt, items)
}

/// One decoded SSE `data:` payload.
#[derive(Debug, PartialEq)]
enum Frame {
    Delta(StreamChunk),
    Skip,
    Done,
}

fn decode_openai_frame(data: &str) -> Result<Frame> {
    if data == "[DONE]" {
        return Ok(Frame::Done);
    }
    let frame: OpenAiStreamFrame = serde_json::from_str(data)
        .map_err(|e| Error::Decode(format!("stream frame: {}, content: {}", e, data)))?;
    let delta_content: String = frame
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    if delta_content.is_empty() {
        Ok(Frame::Skip)
    } else {
        Ok(Frame::Delta(StreamChunk { delta_content }))
    }
}

fn decode_claude_frame(data: &str) -> Result<Frame> {
    let event: ClaudeEvent = serde_json::from_str(data)
        .map_err(|e| Error::Decode(format!("stream frame: {}, content: {}", e, data)))?;
    match event {
        ClaudeEvent::ContentBlockDelta { delta } => match delta.text {
            Some(text) if !text.is_empty() => Ok(Frame::Delta(StreamChunk {
                delta_content: text,
            })),
            _ => Ok(Frame::Skip),
        },
        ClaudeEvent::MessageStop => Ok(Frame::Done),
        ClaudeEvent::Error { error } => Err(Error::Transport(format!(
            "claude stream error: {}: {}",
            error.kind, error.message
        ))),
        ClaudeEvent::Other => Ok(Frame::Skip),
    }
}

/**
 * \brief SSE 分帧：按空行切分事件，提取 `data:` 行。
 */
#[derive(Default)]
struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(end) = find_event_end(&self.buf) {
            let block = self.buf.drain(..end).collect::<Vec<u8>>();
            if let Some(data) = extract_data(&block) {
                out.push(data);
            }
        }
        out
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        extract_data(&rest)
    }
}

fn find_event_end(buf: &[u8]) -> Option<usize> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn extract_data(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|line| line.strip_prefix(' ').unwrap_or(line))
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(lines.join("\n").trim_end().to_string())
}

#[derive(Debug)]
enum PumpExit {
    Finished,
    Cancelled,
    ConsumerGone,
    Failed,
}

/**
 * \brief 启动后台任务读取上游 SSE 并推送增量。
 *
 * 任务只有一个出口：返回时丢弃 sender，channel 随之关闭且只关闭一次。
 */
fn spawn_stream_pump(
    resp: Response,
    cancel: CancellationToken,
    kind: AiBackendKind,
    decode: fn(&str) -> Result<Frame>,
) -> CompletionStream {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let exit = pump_frames(resp, &tx, &task_cancel, decode).await;
        debug!(backend = kind.as_str(), ?exit, "completion stream closed");
    });
    CompletionStream {
        inner: ReceiverStream::new(rx),
        cancel,
    }
}

async fn pump_frames(
    resp: Response,
    tx: &mpsc::Sender<Result<String>>,
    cancel: &CancellationToken,
    decode: fn(&str) -> Result<Frame>,
) -> PumpExit {
    let mut body = resp.bytes_stream();
    let mut decoder = SseDecoder::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpExit::Cancelled,
            _ = tx.closed() => return PumpExit::ConsumerGone,
            next = body.next() => next,
        };
        let at_end = next.is_none();
        let payloads = match next {
            Some(Ok(bytes)) => decoder.push(&bytes),
            Some(Err(err)) => {
                warn!(error = %err, "completion stream read failed");
                forward(tx, cancel, Err(err.into())).await;
                return PumpExit::Failed;
            }
            None => decoder.finish().into_iter().collect(),
        };
        for data in payloads {
            match decode(&data) {
                Ok(Frame::Delta(chunk)) => {
                    if !forward(tx, cancel, Ok(chunk.delta_content)).await {
                        return PumpExit::Cancelled;
                    }
                }
                Ok(Frame::Skip) => {}
                Ok(Frame::Done) => return PumpExit::Finished,
                Err(err) => {
                    warn!(error = %err, "completion stream frame rejected");
                    forward(tx, cancel, Err(err)).await;
                    return PumpExit::Failed;
                }
            }
        }
        if at_end {
            return PumpExit::Finished;
        }
    }
}

async fn forward(
    tx: &mpsc::Sender<Result<String>>,
    cancel: &CancellationToken,
    item: Result<String>,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}
