//! Request/response over a pair of queues.
//!
//! A client sends requests tagged with a fresh correlation id and its own
//! response route. The server answers with [`RpcServer::reply`], which stores
//! the response under a message id equal to that correlation id and on the
//! client's route. The client's response pump claims responses on its route
//! and completes the matching waiter. [`RpcClient::fetch_response`] is the
//! pull alternative: a specific-id receive for one correlation id.
//!
//! The response queue should have routing enabled when several clients share
//! it; without routes any client's pump may claim any response.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    backend::TransportAdapter,
    codec::CodecRegistry,
    commit::CommitPipeline,
    producer::QueueProducer,
    receive::MessageReceiver,
    types::{
        headers::standard, CorrelationId, Headers, MessageContext, MessageId, OutboundMessage,
        ReceiveRequest, ReceivedMessage, SendOptions, SendResult,
    },
    QueueError, QueueResult,
};

type PendingMap = DashMap<CorrelationId, oneshot::Sender<ReceivedMessage>>;

/// Removes a waiter when its request finishes or is dropped
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

/// Sends requests and waits for their responses
pub struct RpcClient {
    requests: QueueProducer,
    responses: Arc<dyn TransportAdapter>,
    response_route: String,
    codecs: CodecRegistry,
    pending: Arc<PendingMap>,
    shutdown: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl RpcClient {
    /// Start a client with a fresh response route and its response pump
    pub fn new(
        requests: Arc<dyn TransportAdapter>,
        responses: Arc<dyn TransportAdapter>,
        poll_interval: Duration,
    ) -> Self {
        Self::with_route(requests, responses, format!("rpc-{}", uuid::Uuid::new_v4()), poll_interval)
    }

    pub fn with_route(
        requests: Arc<dyn TransportAdapter>,
        responses: Arc<dyn TransportAdapter>,
        response_route: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        let response_route = response_route.into();
        let pending = Arc::new(PendingMap::new());
        let shutdown = CancellationToken::new();

        let pump = ResponsePump {
            receiver: MessageReceiver::new(responses.clone()),
            commit: CommitPipeline::new(responses.clone()),
            request: ReceiveRequest::for_routes([response_route.clone()]),
            pending: pending.clone(),
            poll_interval,
            shutdown: shutdown.clone(),
        };

        Self {
            requests: QueueProducer::new(requests),
            responses,
            response_route,
            codecs: CodecRegistry::new(),
            pending,
            shutdown,
            pump: Some(tokio::spawn(pump.run())),
        }
    }

    pub fn response_route(&self) -> &str {
        &self.response_route
    }

    /// Requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait up to `timeout` for the response
    #[instrument(skip_all, fields(route = %self.response_route, timeout = ?timeout))]
    pub async fn request(
        &self,
        body: impl Into<Bytes>,
        headers: Headers,
        timeout: Duration,
    ) -> QueueResult<ReceivedMessage> {
        let correlation_id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id,
        };

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let headers = headers
            .with(&standard::RPC_RESPONSE_ROUTE, self.response_route.clone())
            .with(&standard::RPC_TIMEOUT_MS, timeout_ms);
        let mut options = SendOptions::new().with_correlation_id(correlation_id);
        if self.requests.transport().options().enable_message_expiration {
            options = options.with_expiration(timeout);
        }
        self.requests
            .send_message(OutboundMessage::new(body).with_headers(headers).with_options(options))
            .await?;
        debug!(%correlation_id, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(QueueError::WorkerShutdown),
            Err(_) => Err(QueueError::RpcTimeout {
                correlation_id: correlation_id.to_string(),
            }),
        }
    }

    /// JSON request and response bodies
    pub async fn request_json<Req, Resp>(&self, request: &Req, timeout: Duration) -> QueueResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut headers = Headers::new();
        let body = self.codecs.encode(request, &mut headers)?;
        let response = self.request(body, headers, timeout).await?;
        self.codecs.decode(&response)
    }

    /// Claim and delete the response for `correlation_id`, if it has arrived
    pub async fn fetch_response(&self, correlation_id: &CorrelationId) -> QueueResult<Option<ReceivedMessage>> {
        let message_id = MessageId::from(correlation_id);
        if !message_id.has_value() {
            return Ok(None);
        }
        let Some(response) = self
            .responses
            .receive(&ReceiveRequest::specific(message_id))
            .await?
        else {
            return Ok(None);
        };
        let ctx = MessageContext::new(&response, CancellationToken::new());
        CommitPipeline::new(self.responses.clone()).commit(&ctx).await?;
        Ok(Some(response))
    }

    /// Stop the response pump; waiting requests fail with `WorkerShutdown`
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        self.pending.clear();
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Claims responses on one route and completes their waiters
struct ResponsePump {
    receiver: MessageReceiver,
    commit: CommitPipeline,
    request: ReceiveRequest,
    pending: Arc<PendingMap>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl ResponsePump {
    async fn run(self) {
        while !self.shutdown.is_cancelled() {
            match self.receiver.receive(&self.request, &self.shutdown).await {
                Ok(Some(response)) => self.deliver(response).await,
                Ok(None) => self.idle().await,
                Err(err) => {
                    warn!(error = %err, "response pump receive failed");
                    self.idle().await;
                }
            }
        }
        debug!("response pump stopped");
    }

    async fn deliver(&self, response: ReceivedMessage) {
        let ctx = MessageContext::new(&response, self.shutdown.child_token());
        if let Err(err) = self.commit.commit(&ctx).await {
            warn!(error = %err, "failed to delete response");
        }
        match self.pending.remove(&response.correlation_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(response);
            }
            None => warn!(
                correlation_id = %response.correlation_id,
                "response has no waiting request; dropped"
            ),
        }
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }
}

/// Answers RPC requests
#[derive(Clone)]
pub struct RpcServer {
    responses: QueueProducer,
    codecs: CodecRegistry,
}

impl RpcServer {
    pub fn new(responses: Arc<dyn TransportAdapter>) -> Self {
        Self {
            responses: QueueProducer::new(responses),
            codecs: CodecRegistry::new(),
        }
    }

    /// Send `body` as the response to `request`
    #[instrument(skip_all, fields(correlation_id = %request.correlation_id))]
    pub async fn reply(
        &self,
        request: &ReceivedMessage,
        body: impl Into<Bytes>,
        headers: Headers,
    ) -> QueueResult<SendResult> {
        if !request.correlation_id.has_value() {
            return Err(QueueError::Send {
                correlation_id: request.correlation_id.to_string(),
                reason: "request carries no correlation id".to_string(),
            });
        }

        let mut options = SendOptions::new()
            .with_correlation_id(request.correlation_id)
            .with_message_id(MessageId::from(&request.correlation_id));
        if let Some(route) = request.headers.get(&standard::RPC_RESPONSE_ROUTE) {
            options = options.with_route(route);
        }
        if self.responses.transport().options().enable_message_expiration {
            if let Some(timeout_ms) = request.headers.get(&standard::RPC_TIMEOUT_MS) {
                options = options.with_expiration(Duration::from_millis(timeout_ms));
            }
        }
        self.responses
            .send_message(OutboundMessage::new(body).with_headers(headers).with_options(options))
            .await
    }

    /// JSON-encoded response
    pub async fn reply_json<T: Serialize>(&self, request: &ReceivedMessage, value: &T) -> QueueResult<SendResult> {
        let mut headers = Headers::new();
        let body = self.codecs.encode(value, &mut headers)?;
        self.reply(request, body, headers).await
    }
}
