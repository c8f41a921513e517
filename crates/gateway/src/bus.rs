//! Transport to the backend.
//!
//! The gateway publishes node inputs, makes request/response calls for the
//! assist endpoints, and consumes a stream of backend messages addressed to
//! it. [`InMemoryBus`] keeps all of this in process; the NATS bus lives in
//! [`crate::nats`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::stream::{self, BoxStream, StreamExt},
    hana_protocol::Message,
    serde_json::Value,
    tokio::sync::mpsc,
    tracing::debug,
};

use crate::error::GatewayError;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget delivery of a node input.
    async fn publish(&self, message: &Message) -> Result<(), GatewayError>;

    /// Request/response call. Fails with [`GatewayError::BackendTimeout`] when
    /// no answer arrives within `timeout`.
    async fn call(&self, topic: &str, payload: Value, timeout: Duration)
    -> Result<Value, GatewayError>;

    /// Backend messages for this gateway. Can only be taken once.
    async fn responses(&self) -> Result<BoxStream<'static, Message>, GatewayError>;
}

// ── In-memory bus ────────────────────────────────────────────────────────────

type CallHandler = Arc<dyn Fn(Value) -> Option<Value> + Send + Sync>;
type PublishHandler = Arc<dyn Fn(&Message) -> Vec<Message> + Send + Sync>;

/// Process-local bus. Published messages are recorded and may be answered by
/// a publish handler; calls are answered by per-topic handlers.
pub struct InMemoryBus {
    published: Mutex<Vec<Message>>,
    call_handlers: Mutex<HashMap<String, CallHandler>>,
    publish_handler: Mutex<Option<PublishHandler>>,
    responses_tx: mpsc::UnboundedSender<Message>,
    responses_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        Self {
            published: Mutex::new(Vec::new()),
            call_handlers: Mutex::new(HashMap::new()),
            publish_handler: Mutex::new(None),
            responses_tx,
            responses_rx: Mutex::new(Some(responses_rx)),
        }
    }

    /// Answer calls on `topic`. Returning `None` leaves the call unanswered.
    pub fn on_call<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.call_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.into(), Arc::new(handler));
    }

    /// Produce backend responses for each published message.
    pub fn on_publish<F>(&self, handler: F)
    where
        F: Fn(&Message) -> Vec<Message> + Send + Sync + 'static,
    {
        *self
            .publish_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    /// Inject a backend message as if it arrived from the backend.
    pub fn respond(&self, message: Message) {
        let _ = self.responses_tx.send(message);
    }

    /// Messages published so far.
    pub fn published(&self) -> Vec<Message> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, message: &Message) -> Result<(), GatewayError> {
        debug!(msg_type = %message.msg_type, "publishing to in-memory bus");
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        let handler = self
            .publish_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            for response in handler(message) {
                self.respond(response);
            }
        }
        Ok(())
    }

    async fn call(
        &self,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let handler = self
            .call_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .cloned();
        if let Some(answer) = handler.and_then(|h| h(payload)) {
            return Ok(answer);
        }
        tokio::time::sleep(timeout).await;
        Err(GatewayError::BackendTimeout {
            topic: topic.to_string(),
            timeout,
        })
    }

    async fn responses(&self) -> Result<BoxStream<'static, Message>, GatewayError> {
        let rx = self
            .responses_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| GatewayError::Backend("response stream already taken".into()))?;
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) }).boxed())
    }
}
