use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dog_txqueue::prelude::*;

#[derive(Debug, Serialize, Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Sum {
    total: i64,
}

/// Answers every request through the response queue
struct Adder {
    server: RpcServer,
}

#[async_trait]
impl MessageHandler for Adder {
    async fn handle(&self, message: &ReceivedMessage, _ctx: &MessageContext) -> Result<(), HandlerError> {
        let request: Add = message
            .decode()
            .map_err(|e| HandlerError::permanent("DecodeError", e.to_string()))?;
        self.server
            .reply_json(message, &Sum { total: request.a + request.b })
            .await
            .map_err(|e| HandlerError::retryable("ReplyError", e.to_string()))?;
        Ok(())
    }
}

async fn create_test_transports() -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
    let requests = Arc::new(MemoryTransport::new(TransportOptions::new("rpc_requests")));
    let responses = Arc::new(MemoryTransport::new(TransportOptions {
        enable_route: true,
        ..TransportOptions::new("rpc_responses")
    }));
    requests.create_queue().await.unwrap();
    responses.create_queue().await.unwrap();
    (requests, responses)
}

fn server_config() -> QueueConfig {
    QueueConfig::default()
        .with_worker_count(2)
        .with_poll_interval(Duration::from_millis(5))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_response_round_trip() {
    let (requests, responses) = create_test_transports().await;
    let workers = QueueConsumer::new(
        requests.clone(),
        Adder {
            server: RpcServer::new(responses.clone()),
        },
        server_config(),
    )
    .unwrap()
    .start();

    let client = RpcClient::new(requests, responses.clone(), Duration::from_millis(5));
    let sum: Sum = client
        .request_json(&Add { a: 40, b: 2 }, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(sum, Sum { total: 42 });
    assert_eq!(client.pending_requests(), 0);

    client.shutdown().await;
    workers.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_get_their_own_responses() {
    let (requests, responses) = create_test_transports().await;
    let workers = QueueConsumer::new(
        requests.clone(),
        Adder {
            server: RpcServer::new(responses.clone()),
        },
        server_config(),
    )
    .unwrap()
    .start();

    let clients: Vec<_> = (0..4)
        .map(|_| Arc::new(RpcClient::new(requests.clone(), responses.clone(), Duration::from_millis(5))))
        .collect();
    let calls: Vec<_> = (0..20i64)
        .map(|i| {
            let client = clients[i as usize % clients.len()].clone();
            tokio::spawn(async move {
                let sum: Sum = client
                    .request_json(&Add { a: i, b: 1000 }, Duration::from_secs(5))
                    .await
                    .unwrap();
                assert_eq!(sum.total, i + 1000);
            })
        })
        .collect();
    for call in calls {
        call.await.unwrap();
    }

    drop(clients);
    workers.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fetch_response_by_correlation_id() {
    let (requests, responses) = create_test_transports().await;
    let correlation_id = CorrelationId::new();
    requests
        .send(OutboundMessage::new("ping").with_options(SendOptions::new().with_correlation_id(correlation_id)))
        .await
        .unwrap();
    let request = requests.receive(&ReceiveRequest::any()).await.unwrap().unwrap();
    RpcServer::new(responses.clone())
        .reply(&request, "pong", Headers::new())
        .await
        .unwrap();

    let client = RpcClient::with_route(requests, responses.clone(), "pull_client", Duration::from_secs(60));
    let response = client.fetch_response(&correlation_id).await.unwrap().unwrap();
    assert_eq!(&response.body[..], b"pong");
    assert_eq!(response.correlation_id, correlation_id);
    assert!(client.fetch_response(&correlation_id).await.unwrap().is_none());
    client.shutdown().await;
}
