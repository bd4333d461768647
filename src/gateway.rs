//! Execution gateway
//!
//! The single sanctioned egress to the remote action endpoint. Shadow mode
//! short-circuits before any network traffic, the bot connection is
//! pre-flighted, responses are normalized, and every attempt lands in the
//! audit ring regardless of outcome.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::{ExecutorConfig, ExecutorMode};
use crate::integration::collaborators::BotContextProvider;
use crate::response::{normalize_action_response, NormalizedResponse};

/// Who is asking for the dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOrigin {
    Executor,
    Reactive,
    Cognition,
    Manual,
    Safety,
}

/// Priority of the dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    Normal,
    High,
    Emergency,
}

/// Action payload sent to the endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAction {
    #[serde(rename = "type")]
    pub action_type: String,
    pub parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Dispatch request
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub origin: RequestOrigin,
    pub priority: RequestPriority,
    pub action: GatewayAction,
    pub context: Option<Value>,
}

/// Gateway outcome: the normalized response plus dispatch bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_diagnostics: Option<Value>,
    #[serde(default)]
    pub shadow_blocked: bool,
    pub duration_ms: u64,
}

impl GatewayResponse {
    fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            failure_code: None,
            data: Value::Null,
            tool_diagnostics: None,
            shadow_blocked: false,
            duration_ms,
        }
    }

    fn from_normalized(normalized: NormalizedResponse, duration_ms: u64) -> Self {
        Self {
            ok: normalized.ok,
            error: normalized.error,
            failure_code: normalized.failure_code,
            data: normalized.data,
            tool_diagnostics: normalized.tool_diagnostics,
            shadow_blocked: false,
            duration_ms,
        }
    }
}

/// Audit record emitted for every dispatch attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub origin: RequestOrigin,
    pub priority: RequestPriority,
    pub action_type: String,
    pub mode: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

type AuditListener = Box<dyn Fn(&AuditEntry) + Send + Sync>;

/// Abort handle for in-flight egress
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Receiver half wired into `execute`
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a linked cancel handle/signal pair
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    /// Abort any in-flight egress; remote effects already dispatched are
    /// not undone
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the handle aborts; never resolves if the handle lives
    /// un-aborted for the whole dispatch
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without aborting
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Single egress to the remote action endpoint
pub struct ExecutionGateway {
    client: reqwest::Client,
    config: ExecutorConfig,
    bot_context: Option<Arc<dyn BotContextProvider>>,
    audit: RwLock<VecDeque<AuditEntry>>,
    listeners: RwLock<Vec<AuditListener>>,
    /// Transport hold-off after a connection failure
    breaker_until: Mutex<Option<Instant>>,
}

impl ExecutionGateway {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            bot_context: None,
            audit: RwLock::new(VecDeque::new()),
            listeners: RwLock::new(Vec::new()),
            breaker_until: Mutex::new(None),
        }
    }

    pub fn with_bot_context(mut self, context: Arc<dyn BotContextProvider>) -> Self {
        self.bot_context = Some(context);
        self
    }

    /// Register an audit listener; listener panics never break the gateway
    pub fn add_audit_listener(&self, listener: AuditListener) {
        self.listeners.write().push(listener);
    }

    /// Recent audit entries, oldest first
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.read().iter().cloned().collect()
    }

    /// Dispatch an action through mode gating, pre-flight, and the remote
    /// endpoint; the response is always normalized and audited
    pub async fn execute(
        &self,
        request: ActionRequest,
        cancel: Option<CancelSignal>,
    ) -> GatewayResponse {
        let mode = self.config.mode;

        if mode == ExecutorMode::Shadow {
            let response = GatewayResponse {
                ok: false,
                error: Some("Blocked by shadow mode".to_string()),
                failure_code: None,
                data: Value::Null,
                tool_diagnostics: None,
                shadow_blocked: true,
                duration_ms: 0,
            };
            self.audit(&request, mode, &response);
            return response;
        }

        let started = Instant::now();

        if let Some(context) = &self.bot_context {
            if !context.is_connected() {
                let response = GatewayResponse::failure(
                    "Bot not connected",
                    started.elapsed().as_millis() as u64,
                );
                self.audit(&request, mode, &response);
                return response;
            }
        }

        if let Some(until) = *self.breaker_until.lock() {
            if Instant::now() < until {
                let response = GatewayResponse::failure(
                    "Transport breaker open",
                    started.elapsed().as_millis() as u64,
                );
                self.audit(&request, mode, &response);
                return response;
            }
        }

        let timeout_ms = request
            .action
            .timeout_ms
            .unwrap_or(self.config.action_timeout_ms);
        let url = format!(
            "{}/action",
            self.config.bot_endpoint_url.trim_end_matches('/')
        );
        let body = json!({
            "type": request.action.action_type,
            "parameters": request.action.parameters,
        });

        let send = self
            .client
            .post(&url)
            .timeout(Duration::from_millis(timeout_ms))
            .json(&body)
            .send();

        let transport_result = match cancel {
            Some(mut signal) => {
                tokio::select! {
                    _ = signal.cancelled() => {
                        let response = GatewayResponse::failure(
                            "Dispatch cancelled",
                            started.elapsed().as_millis() as u64,
                        );
                        self.audit(&request, mode, &response);
                        return response;
                    }
                    result = send => result,
                }
            }
            None => send.await,
        };

        let response = match transport_result {
            Ok(http_response) => match http_response.json::<Value>().await {
                Ok(payload) => {
                    *self.breaker_until.lock() = None;
                    let normalized = normalize_action_response(&payload);
                    GatewayResponse::from_normalized(
                        normalized,
                        started.elapsed().as_millis() as u64,
                    )
                }
                Err(err) => {
                    warn!(error = %err, "action endpoint returned unparseable payload");
                    GatewayResponse::failure(
                        format!("Unparseable response: {}", err),
                        started.elapsed().as_millis() as u64,
                    )
                }
            },
            Err(err) => {
                *self.breaker_until.lock() =
                    Some(Instant::now() + Duration::from_millis(self.config.breaker_open_ms));
                debug!(error = %err, "action endpoint unreachable; transport hold-off engaged");
                GatewayResponse::failure(
                    format!("Dispatch failed: {}", err),
                    started.elapsed().as_millis() as u64,
                )
            }
        };

        self.audit(&request, mode, &response);
        response
    }

    fn audit(&self, request: &ActionRequest, mode: ExecutorMode, response: &GatewayResponse) {
        let entry = AuditEntry {
            ts: Utc::now(),
            origin: request.origin,
            priority: request.priority,
            action_type: request.action.action_type.clone(),
            mode: mode.as_str().to_string(),
            ok: response.ok,
            error: response.error.clone(),
            failure_code: response.failure_code.clone(),
            duration_ms: response.duration_ms,
            context: request.context.clone(),
        };

        {
            let mut ring = self.audit.write();
            ring.push_back(entry.clone());
            while ring.len() > self.config.audit_limit {
                ring.pop_front();
            }
        }

        for listener in self.listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(&entry))).is_err() {
                warn!("audit listener panicked; ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ActionRequest {
        ActionRequest {
            origin: RequestOrigin::Executor,
            priority: RequestPriority::Normal,
            action: GatewayAction {
                action_type: "craft_item".to_string(),
                parameters: json!({"item": "stick"}),
                timeout_ms: None,
            },
            context: None,
        }
    }

    #[tokio::test]
    async fn shadow_mode_blocks_without_dispatching() {
        let gateway = ExecutionGateway::new(ExecutorConfig::default());
        let response = gateway.execute(request(), None).await;
        assert!(!response.ok);
        assert!(response.shadow_blocked);
        assert_eq!(response.duration_ms, 0);
        assert_eq!(response.error.as_deref(), Some("Blocked by shadow mode"));

        let audit = gateway.audit_entries();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].mode, "shadow");
    }

    #[tokio::test]
    async fn panicking_listener_does_not_break_the_gateway() {
        let gateway = ExecutionGateway::new(ExecutorConfig::default());
        gateway.add_audit_listener(Box::new(|_| panic!("listener bug")));
        let response = gateway.execute(request(), None).await;
        assert!(response.shadow_blocked);
        assert_eq!(gateway.audit_entries().len(), 1);
    }

    #[tokio::test]
    async fn cancel_signal_aborts_dispatch() {
        let (handle, signal) = cancel_pair();
        handle.abort();
        assert!(signal.is_cancelled());
    }
}
