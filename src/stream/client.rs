//! 远程执行客户端
//!
//! POST JSON 请求体，响应为分块事件流：log 事件转发到本地日志，system:error 原样作为失败返回，
//! system:finished 携带最终结果并结束调用。流在 finished 之前结束视为协议错误。

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentResult;
use crate::config::RemoteSettings;
use crate::core::AgentError;
use crate::stream::{
    resolve_cache_status, CacheStatus, CallOptions, EventStreamParser, LogEvent, RemoteOperation,
    RemoteResult, StreamError, StreamEvent, SystemEvent, SystemStatus,
};

/// 远端内部噪音日志，不转发
const NOISE_PATTERNS: &[&str] = &["heartbeat", "keepalive", "websocket ping"];

/// 事件分类为 internal 的日志同样不转发
const INTERNAL_CATEGORY: &str = "internal";

/// 显式 base_url 优先，其次按 region 查表
pub fn resolve_base_url(settings: &RemoteSettings) -> Result<String, AgentError> {
    if let Some(url) = settings
        .base_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
    {
        return Ok(url.trim_end_matches('/').to_string());
    }
    let region = settings
        .region
        .as_deref()
        .ok_or_else(|| AgentError::Config("remote.base_url or remote.region is required".to_string()))?;
    settings
        .regions
        .get(region)
        .map(|url| url.trim_end_matches('/').to_string())
        .ok_or_else(|| AgentError::Config(format!("No base URL configured for region '{}'", region)))
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, AgentError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AgentError::Config(format!("remote.{} is required", name)))
}

fn is_noise(log: &LogEvent) -> bool {
    if log.message.category() == Some(INTERNAL_CATEGORY) {
        return true;
    }
    let text = log.message.text().to_lowercase();
    NOISE_PATTERNS.iter().any(|p| text.contains(p))
}

/// 远端日志级别：0 / 1 → info，2 → debug
fn forward_log(log: &LogEvent) {
    if is_noise(log) {
        return;
    }
    let category = log.message.category().unwrap_or("remote");
    match log.message.level() {
        2 => tracing::debug!(target: "pilot::remote", category, "{}", log.message.text()),
        _ => tracing::info!(target: "pilot::remote", category, "{}", log.message.text()),
    }
}

fn remote_failure(system: SystemEvent) -> AgentError {
    AgentError::Remote(
        system
            .error
            .unwrap_or_else(|| "Remote execution failed".to_string()),
    )
}

/// 处理一个事件；finished 时返回其内容
fn handle_event(event: StreamEvent) -> Result<Option<SystemEvent>, AgentError> {
    match event {
        StreamEvent::Log(log) => {
            forward_log(&log);
            Ok(None)
        }
        StreamEvent::System(system) => match system.status {
            SystemStatus::Error => Err(remote_failure(system)),
            SystemStatus::Finished => Ok(Some(system)),
            SystemStatus::Other => Ok(None),
        },
        StreamEvent::Unknown { kind, .. } => {
            tracing::debug!(kind = %kind, "Ignoring unknown stream event");
            Ok(None)
        }
    }
}

/// 消费整条事件流，直到 finished 事件
async fn read_events<S, B, E>(stream: S, cancel: &CancellationToken) -> Result<SystemEvent, AgentError>
where
    S: futures_util::Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    StreamError: From<E>,
{
    let mut stream = std::pin::pin!(stream);
    let mut parser = EventStreamParser::new();
    loop {
        // 已就绪的数据优先于取消：手里的 finished 事件胜出
        let next = tokio::select! {
            biased;
            next = stream.next() => next,
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(StreamError::from)?;
        for event in parser.feed(chunk.as_ref())? {
            // 已收到终止事件时不再理会取消
            if let Some(finished) = handle_event(event)? {
                return Ok(finished);
            }
        }
    }

    // 残留缓冲即便能解析出 finished 也不算成功结束
    for event in parser.finish()? {
        match event {
            StreamEvent::System(system) if system.status == SystemStatus::Error => {
                return Err(remote_failure(system));
            }
            StreamEvent::System(system) if system.status == SystemStatus::Finished => {
                tracing::warn!("Finished event arrived without a terminating delimiter");
            }
            StreamEvent::Log(log) => forward_log(&log),
            _ => {}
        }
    }
    Err(StreamError::MissingFinishedEvent.into())
}

pub struct StreamProtocolClient {
    http: Client,
    base_url: String,
    api_key: String,
    project_id: String,
    model_api_key: Option<String>,
    model: Option<String>,
}

impl StreamProtocolClient {
    /// 校验配置；缺少凭证或地址时在任何网络调用前返回配置错误
    pub fn new(settings: &RemoteSettings) -> Result<Self, AgentError> {
        let base_url = resolve_base_url(settings)?;
        let api_key = required(settings.api_key.as_deref(), "api_key")?.to_string();
        let project_id = required(settings.project_id.as_deref(), "project_id")?.to_string();

        let mut builder = Client::builder();
        if let Some(secs) = settings.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let http = builder
            .build()
            .map_err(|e| AgentError::Config(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            api_key,
            project_id,
            model_api_key: settings
                .model_api_key
                .clone()
                .filter(|k| !k.trim().is_empty()),
            model: settings.model.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self, session_id: Option<&str>, options: CallOptions) -> Result<HeaderMap, AgentError> {
        let mut pairs: Vec<(&'static str, String)> = vec![
            ("x-api-key", self.api_key.clone()),
            ("x-project-id", self.project_id.clone()),
            ("x-stream-response", "true".to_string()),
        ];
        if let Some(id) = session_id {
            pairs.push(("x-session-id", id.to_string()));
        }
        if let Some(key) = &self.model_api_key {
            pairs.push(("x-model-api-key", key.clone()));
        }
        if options.bypass_cache {
            pairs.push(("x-cache-bypass", "true".to_string()));
        }

        let mut headers = HeaderMap::new();
        for (key, value) in pairs {
            headers.insert(
                HeaderName::from_static(key),
                HeaderValue::from_str(&value)
                    .map_err(|_| AgentError::Config(format!("Invalid header value for {}", key)))?,
            );
        }
        Ok(headers)
    }

    /// 执行一次流式操作
    pub async fn execute(
        &self,
        op: RemoteOperation,
        session_id: &str,
        body: &Value,
        options: CallOptions,
        cancel: &CancellationToken,
    ) -> Result<RemoteResult, AgentError> {
        if session_id.trim().is_empty() {
            return Err(AgentError::Config("session id is required".to_string()));
        }
        if op.requires_model_key() && self.model_api_key.is_none() {
            return Err(AgentError::Config(format!(
                "A model API key is required for {}",
                op.path()
            )));
        }
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let url = format!("{}/sessions/{}/{}", self.base_url, session_id, op.path());
        let request = self
            .http
            .post(&url)
            .headers(self.headers(Some(session_id), options)?)
            .json(body);
        tracing::debug!(url = %url, op = op.path(), "Sending remote request");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            response = request.send() => response.map_err(StreamError::from)?,
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Http {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        let header_status = response
            .headers()
            .get("cache-status")
            .and_then(|v| v.to_str().ok())
            .and_then(CacheStatus::parse);

        let finished = read_events(response.bytes_stream(), cancel).await?;
        let cache_status = if op.reports_cache_status() {
            resolve_cache_status(header_status, finished.cache_hit)
        } else {
            None
        };
        tracing::info!(op = op.path(), ?cache_status, "Remote operation finished");
        Ok(RemoteResult {
            result: finished.result.unwrap_or(Value::Null),
            cache_status,
        })
    }

    pub async fn act(
        &self,
        session_id: &str,
        input: &str,
        options: CallOptions,
        cancel: &CancellationToken,
    ) -> Result<RemoteResult, AgentError> {
        let body = json!({ "input": input, "modelName": self.model });
        self.execute(RemoteOperation::Act, session_id, &body, options, cancel)
            .await
    }

    pub async fn extract(
        &self,
        session_id: &str,
        instruction: Option<&str>,
        schema: Option<&Value>,
        options: CallOptions,
        cancel: &CancellationToken,
    ) -> Result<RemoteResult, AgentError> {
        let body = json!({
            "instruction": instruction,
            "schema": schema,
            "modelName": self.model,
        });
        self.execute(RemoteOperation::Extract, session_id, &body, options, cancel)
            .await
    }

    pub async fn observe(
        &self,
        session_id: &str,
        instruction: Option<&str>,
        options: CallOptions,
        cancel: &CancellationToken,
    ) -> Result<RemoteResult, AgentError> {
        let body = json!({ "instruction": instruction, "modelName": self.model });
        self.execute(RemoteOperation::Observe, session_id, &body, options, cancel)
            .await
    }

    /// 导航结果不带缓存状态
    pub async fn navigate(
        &self,
        session_id: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, AgentError> {
        let body = json!({ "url": url });
        let outcome = self
            .execute(
                RemoteOperation::Navigate,
                session_id,
                &body,
                CallOptions::default(),
                cancel,
            )
            .await?;
        Ok(outcome.result)
    }

    /// 远端执行完整的智能体运行
    pub async fn execute_agent(
        &self,
        session_id: &str,
        instruction: &str,
        max_steps: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<AgentResult, AgentError> {
        let body = json!({
            "agentConfig": { "model": self.model },
            "executeOptions": { "instruction": instruction, "maxSteps": max_steps },
        });
        let outcome = self
            .execute(
                RemoteOperation::AgentExecute,
                session_id,
                &body,
                CallOptions::default(),
                cancel,
            )
            .await?;
        serde_json::from_value(outcome.result).map_err(|e| StreamError::Parse(e).into())
    }

    /// 创建远程浏览器会话，返回会话 id
    pub async fn start_session(&self, cancel: &CancellationToken) -> Result<String, AgentError> {
        let url = format!("{}/sessions/start", self.base_url);
        let mut headers = self.headers(None, CallOptions::default())?;
        headers.remove("x-stream-response");
        let request = self
            .http
            .post(&url)
            .headers(headers)
            .json(&json!({ "modelName": self.model }));
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            response = request.send() => response.map_err(StreamError::from)?,
        };
        let status = response.status();
        let text = response.text().await.map_err(StreamError::from)?;
        if !status.is_success() {
            return Err(StreamError::Http {
                status: status.as_u16(),
                body: text,
            }
            .into());
        }
        let value: Value = serde_json::from_str(&text).map_err(StreamError::from)?;
        if value.get("success").and_then(Value::as_bool) == Some(false) {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Session start rejected");
            return Err(AgentError::Remote(message.to_string()));
        }
        let session_id = value
            .pointer("/data/sessionId")
            .or_else(|| value.get("sessionId"))
            .and_then(Value::as_str)
            .ok_or_else(|| StreamError::Framing("session start response has no sessionId".to_string()))?;
        tracing::info!(session_id, "Remote session started");
        Ok(session_id.to_string())
    }

    pub async fn end_session(&self, session_id: &str) -> Result<(), AgentError> {
        if session_id.trim().is_empty() {
            return Err(AgentError::Config("session id is required".to_string()));
        }
        let url = format!("{}/sessions/{}/end", self.base_url, session_id);
        let mut headers = self.headers(Some(session_id), CallOptions::default())?;
        headers.remove("x-stream-response");
        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(&json!({}))
            .send()
            .await
            .map_err(StreamError::from)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Http {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        tracing::info!(session_id, "Remote session ended");
        Ok(())
    }
}
