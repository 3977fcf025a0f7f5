//! Correlation client over the transport event stream

use crate::ClientError;
use faultline_protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, GetPromptResult, Implementation,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
    is_protocol_version_supported, Message, Notification, ReadResourceResult, Request,
    MCP_PROTOCOL_VERSION,
};
use faultline_transport::{Transport, TransportError, TransportEvent};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default per-call response window
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// One in-flight correlated call
struct PendingCall {
    responder: oneshot::Sender<Result<Value, ClientError>>,
    method: String,
}

type PendingMap = Arc<Mutex<HashMap<i64, PendingCall>>>;

/// Client tuning knobs
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-call response window; a call unanswered past this is evicted
    pub request_timeout: Duration,
    /// Identity advertised during the initialize handshake
    pub client_info: Implementation,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            client_info: Implementation {
                name: "faultline".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// MCP client correlating requests with asynchronous responses
///
/// One client owns one transport pairing. Ids are unique for the session's
/// lifetime; a pending entry is registered before the underlying write so a
/// synchronously failing write evicts immediately instead of hanging. No
/// pending call outlives its transport: error and close events reject every
/// outstanding call at once.
pub struct McpClient {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    next_id: AtomicI64,
    pending: PendingMap,
    handlers: Arc<Mutex<Vec<NotificationHandler>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl McpClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let handlers: Arc<Mutex<Vec<NotificationHandler>>> = Arc::new(Mutex::new(Vec::new()));
        let dispatch_task = Self::spawn_dispatch(
            transport.subscribe(),
            pending.clone(),
            handlers.clone(),
        );
        Self {
            transport,
            config,
            next_id: AtomicI64::new(1),
            pending,
            handlers,
            dispatch_task: Mutex::new(Some(dispatch_task)),
        }
    }

    /// The wrapped transport
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Number of calls currently awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    /// Register a handler for peer notifications
    ///
    /// Handler panics are caught and logged, never propagated.
    pub fn on_notification<F>(&self, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .expect("handler lock poisoned")
            .push(Arc::new(handler));
    }

    fn spawn_dispatch(
        mut events: broadcast::Receiver<TransportEvent>,
        pending: PendingMap,
        handlers: Arc<Mutex<Vec<NotificationHandler>>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Message(value)) => {
                        Self::dispatch_message(value, &pending, &handlers);
                    }
                    Ok(TransportEvent::Error(message)) => {
                        Self::cancel_all(&pending, format!("transport error: {message}"));
                    }
                    Ok(TransportEvent::Closed { code, reason }) => {
                        let detail = match code {
                            Some(code) => format!("transport closed ({code}): {reason}"),
                            None => format!("transport closed: {reason}"),
                        };
                        Self::cancel_all(&pending, detail);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "client dispatch lagged behind transport events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn dispatch_message(
        value: Value,
        pending: &PendingMap,
        handlers: &Arc<Mutex<Vec<NotificationHandler>>>,
    ) {
        match Message::from_value(value) {
            Message::Response(response) => {
                let Some(id) = response.id.as_i64() else {
                    warn!(id = %response.id, "response with non-numeric id, ignoring");
                    return;
                };
                let entry = pending.lock().expect("pending lock poisoned").remove(&id);
                let Some(call) = entry else {
                    warn!(id, "unrecognized response id");
                    return;
                };
                let outcome = match response.error {
                    Some(error) => Err(ClientError::Protocol {
                        method: call.method.clone(),
                        error,
                    }),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                // The caller may have timed out and dropped its receiver.
                let _ = call.responder.send(outcome);
            }
            Message::Notification(notification) => {
                let snapshot: Vec<NotificationHandler> = handlers
                    .lock()
                    .expect("handler lock poisoned")
                    .clone();
                for handler in snapshot {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        handler(&notification)
                    }));
                    if result.is_err() {
                        warn!(method = %notification.method, "notification handler panicked");
                    }
                }
            }
            Message::Request(request) => {
                debug!(method = %request.method, "unsolicited peer request, ignoring");
            }
            Message::Other(value) => {
                warn!(%value, "unrecognized message");
            }
        }
    }

    fn cancel_all(pending: &PendingMap, reason: String) {
        let drained: Vec<(i64, PendingCall)> = pending
            .lock()
            .expect("pending lock poisoned")
            .drain()
            .collect();
        if drained.is_empty() {
            return;
        }
        warn!(count = drained.len(), %reason, "cancelling all pending calls");
        for (_, call) in drained {
            let _ = call
                .responder
                .send(Err(ClientError::ConnectionLost(reason.clone())));
        }
    }

    fn evict(&self, id: i64) {
        self.pending.lock().expect("pending lock poisoned").remove(&id);
    }

    /// Issue one correlated request and await its response
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (responder, receiver) = oneshot::channel();
        self.pending.lock().expect("pending lock poisoned").insert(
            id,
            PendingCall {
                responder,
                method: method.to_string(),
            },
        );

        let envelope = Request::new(id, method, params);
        let payload = match serde_json::to_value(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                self.evict(id);
                return Err(TransportError::Write(format!("serialization failed: {e}")).into());
            }
        };

        debug!(id, method, "sending request");
        let started = tokio::time::Instant::now();
        if let Err(e) = self.transport.send(payload.into()).await {
            self.evict(id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.config.request_timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::ConnectionLost(
                "responder dropped without an answer".to_string(),
            )),
            Err(_) => {
                self.evict(id);
                Err(ClientError::RequestTimeout {
                    method: method.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Send a fire-and-forget notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let envelope = Notification::new(method, params);
        let payload = serde_json::to_value(&envelope)
            .map_err(|e| TransportError::Write(format!("serialization failed: {e}")))?;
        self.transport.send(payload.into()).await?;
        Ok(())
    }

    fn parse<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, ClientError> {
        serde_json::from_value(value).map_err(|e| ClientError::InvalidResponse {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }

    /// Run the initialize handshake
    ///
    /// Sends `initialize` with the configured client identity, verifies the
    /// peer settled on a protocol revision the harness can drive, then sends
    /// the `notifications/initialized` acknowledgement.
    pub async fn initialize(&self) -> Result<InitializeResult, ClientError> {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: self.config.client_info.clone(),
        };
        let params = serde_json::to_value(&params)
            .map_err(|e| TransportError::Write(format!("serialization failed: {e}")))?;
        let value = self.request("initialize", Some(params)).await?;
        let result: InitializeResult = Self::parse("initialize", value)?;
        if !is_protocol_version_supported(&result.protocol_version) {
            return Err(ClientError::InvalidResponse {
                method: "initialize".to_string(),
                reason: format!(
                    "unsupported protocol version {:?}",
                    result.protocol_version
                ),
            });
        }
        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    pub async fn list_tools(
        &self,
        cursor: Option<String>,
    ) -> Result<ListToolsResult, ClientError> {
        let params = cursor.map(|cursor| json!({ "cursor": cursor }));
        let value = self.request("tools/list", params).await?;
        Self::parse("tools/list", value)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, ClientError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let params = serde_json::to_value(&params)
            .map_err(|e| TransportError::Write(format!("serialization failed: {e}")))?;
        let value = self.request("tools/call", Some(params)).await?;
        Self::parse("tools/call", value)
    }

    pub async fn list_resources(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourcesResult, ClientError> {
        let params = cursor.map(|cursor| json!({ "cursor": cursor }));
        let value = self.request("resources/list", params).await?;
        Self::parse("resources/list", value)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, ClientError> {
        let value = self
            .request("resources/read", Some(json!({ "uri": uri })))
            .await?;
        Self::parse("resources/read", value)
    }

    pub async fn list_prompts(
        &self,
        cursor: Option<String>,
    ) -> Result<ListPromptsResult, ClientError> {
        let params = cursor.map(|cursor| json!({ "cursor": cursor }));
        let value = self.request("prompts/list", params).await?;
        Self::parse("prompts/list", value)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<GetPromptResult, ClientError> {
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let value = self.request("prompts/get", Some(params)).await?;
        Self::parse("prompts/get", value)
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request("ping", None).await.map(|_| ())
    }

    /// Cancel every pending call, then close the transport
    pub async fn close(&self) -> Result<(), ClientError> {
        Self::cancel_all(&self.pending, "client closed".to_string());
        if let Some(task) = self
            .dispatch_task
            .lock()
            .expect("dispatch lock poisoned")
            .take()
        {
            task.abort();
        }
        self.transport.close().await?;
        Ok(())
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.dispatch_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}
