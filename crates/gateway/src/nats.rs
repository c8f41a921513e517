//! NATS-backed [`MessageBus`].

use std::{fmt::Display, time::Duration};

use {
    async_nats::RequestErrorKind,
    async_trait::async_trait,
    bytes::Bytes,
    futures::stream::{BoxStream, StreamExt},
    hana_protocol::Message,
    serde_json::Value,
    tracing::{debug, info, warn},
};

use crate::{bus::MessageBus, error::GatewayError};

pub struct NatsBus {
    client: async_nats::Client,
    request_subject: String,
    response_subject: String,
}

impl NatsBus {
    pub async fn connect(
        url: &str,
        request_subject: impl Into<String>,
        response_subject: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| GatewayError::Backend(format!("connect to {url}: {e}")))?;
        info!(url, "connected to NATS");
        Ok(Self {
            client,
            request_subject: request_subject.into(),
            response_subject: response_subject.into(),
        })
    }
}

/// The client's own request timeout counts as a backend timeout too.
fn request_failure(
    topic: &str,
    timeout: Duration,
    kind: RequestErrorKind,
    err: &dyn Display,
) -> GatewayError {
    match kind {
        RequestErrorKind::TimedOut => GatewayError::BackendTimeout {
            topic: topic.to_string(),
            timeout,
        },
        _ => GatewayError::Backend(format!("request {topic}: {err}")),
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, message: &Message) -> Result<(), GatewayError> {
        let payload = Bytes::from(message.to_json());
        self.client
            .publish(self.request_subject.clone(), payload)
            .await
            .map_err(|e| GatewayError::Backend(format!("publish: {e}")))
    }

    async fn call(
        &self,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let body = serde_json::to_vec(&payload)
            .map_err(|e| GatewayError::Backend(format!("encode request: {e}")))?;
        let response = tokio::time::timeout(
            timeout,
            self.client.request(topic.to_string(), body.into()),
        )
        .await
        .map_err(|_| GatewayError::BackendTimeout {
            topic: topic.to_string(),
            timeout,
        })?
        .map_err(|e| request_failure(topic, timeout, e.kind(), &e))?;

        debug!(topic, bytes = response.payload.len(), "received NATS response");
        serde_json::from_slice(&response.payload)
            .map_err(|e| GatewayError::Backend(format!("decode response: {e}")))
    }

    async fn responses(&self) -> Result<BoxStream<'static, Message>, GatewayError> {
        let subscriber = self
            .client
            .subscribe(self.response_subject.clone())
            .await
            .map_err(|e| GatewayError::Backend(format!("subscribe: {e}")))?;
        Ok(subscriber
            .filter_map(|msg| async move {
                match serde_json::from_slice::<Message>(&msg.payload) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!(subject = %msg.subject, error = %e, "dropping malformed backend message");
                        None
                    },
                }
            })
            .boxed())
    }
}
