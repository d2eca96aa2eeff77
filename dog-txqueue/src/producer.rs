use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::{
    backend::TransportAdapter,
    codec::CodecRegistry,
    types::{headers::standard, Headers, OutboundMessage, SendOptions, SendResult},
    QueueResult,
};

/// Enqueues messages onto one queue
#[derive(Clone)]
pub struct QueueProducer {
    transport: Arc<dyn TransportAdapter>,
    codecs: Arc<CodecRegistry>,
}

impl QueueProducer {
    pub fn new(transport: Arc<dyn TransportAdapter>) -> Self {
        Self {
            transport,
            codecs: Arc::new(CodecRegistry::new()),
        }
    }

    /// Use a custom codec registry for [`send_json`](Self::send_json)
    pub fn with_codec_registry(mut self, registry: CodecRegistry) -> Self {
        self.codecs = Arc::new(registry);
        self
    }

    pub fn transport(&self) -> &Arc<dyn TransportAdapter> {
        &self.transport
    }

    /// Send raw body bytes
    pub async fn send(
        &self,
        body: impl Into<bytes::Bytes>,
        headers: Headers,
        options: SendOptions,
    ) -> QueueResult<SendResult> {
        self.send_message(
            OutboundMessage::new(body)
                .with_headers(headers)
                .with_options(options),
        )
        .await
    }

    #[instrument(skip_all, fields(queue = %self.transport.options().queue_name, size = message.body_size()))]
    pub async fn send_message(&self, message: OutboundMessage) -> QueueResult<SendResult> {
        let message = with_trace_id(message);
        let result = self.transport.send(message).await?;
        debug!(queue_id = %result.queue_id, message_id = %result.message_id, "message sent");
        Ok(result)
    }

    /// Encode `value` with the default codec and send it
    pub async fn send_json<T: Serialize>(
        &self,
        value: &T,
        headers: Headers,
        options: SendOptions,
    ) -> QueueResult<SendResult> {
        let mut headers = headers;
        let body = self.codecs.encode(value, &mut headers)?;
        self.send(body, headers, options).await
    }

    pub async fn send_batch(&self, messages: Vec<OutboundMessage>) -> QueueResult<Vec<SendResult>> {
        let messages = messages.into_iter().map(with_trace_id).collect();
        self.transport.send_batch(messages).await
    }
}

/// Messages without a trace id get a fresh one
fn with_trace_id(mut message: OutboundMessage) -> OutboundMessage {
    if !message.headers.contains(standard::TRACE_ID.name()) {
        message
            .headers
            .set(&standard::TRACE_ID, uuid::Uuid::new_v4().to_string());
    }
    message
}
