// Tests for the upstream HTTP engine

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use genflight::app::AppState;
use genflight::config::Config;
use genflight::engine::{EngineError, EngineEvent, GenerationEngine, GenerationRequest, HttpEngine};
use genflight::ledger::{CreditLedger, InMemoryCreditLedger};
use genflight::session::{CoordinatorError, GenerateRequest};
use genflight::types::{OwnerId, ResourceId};

const CHUNKED_HEAD: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n";

/// Serve one connection: read the request, then hand the socket and body to `respond`
async fn upstream<F, Fut>(respond: F) -> String
where
    F: FnOnce(TcpStream, String) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let body = read_request_body(&mut socket).await;
        respond(socket, body).await;
    });

    format!("http://{}/generate", addr)
}

async fn read_request_body(socket: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending a request");
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_lowercase();
    let content_length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .map(|value| value.trim().parse().unwrap())
        .unwrap_or(0);

    while buffer.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.unwrap();
        buffer.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(buffer[header_end..header_end + content_length].to_vec()).unwrap()
}

fn request(message: &str) -> GenerationRequest {
    GenerationRequest {
        resource_id: ResourceId::new("app-1"),
        owner_id: OwnerId::new("owner-1"),
        message: message.to_string(),
    }
}

#[tokio::test]
async fn test_relays_upstream_body() {
    let (body_tx, body_rx) = oneshot::channel();
    let url = upstream(move |mut socket, body| async move {
        body_tx.send(body).unwrap();
        socket.write_all(CHUNKED_HEAD.as_bytes()).await.unwrap();
        socket.write_all(b"6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n").await.unwrap();
        socket.flush().await.unwrap();
    })
    .await;

    let engine = HttpEngine::new(url).unwrap();
    let run = engine.start(request("say hi"), CancellationToken::new()).await.unwrap();

    let mut events = run.into_events();
    let mut relayed = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Chunk(bytes) => relayed.extend_from_slice(&bytes),
            EngineEvent::Failed(reason) => panic!("unexpected failure: {}", reason),
        }
    }
    assert_eq!(String::from_utf8(relayed).unwrap(), "hello world");

    let sent: serde_json::Value = serde_json::from_str(&body_rx.await.unwrap()).unwrap();
    assert_eq!(sent["resource_id"], "app-1");
    assert_eq!(sent["owner_id"], "owner-1");
    assert_eq!(sent["message"], "say hi");
}

#[tokio::test]
async fn test_non_success_status_is_a_start_failure() {
    let url = upstream(|mut socket, _| async move {
        socket
            .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\n\r\nbusy")
            .await
            .unwrap();
        socket.flush().await.unwrap();
    })
    .await;

    let engine = HttpEngine::new(url).unwrap();
    match engine.start(request("hi"), CancellationToken::new()).await {
        Err(EngineError::Start(reason)) => {
            assert!(reason.contains("503"), "{}", reason);
            assert!(reason.contains("busy"), "{}", reason);
        }
        Err(other) => panic!("expected start error, got {:?}", other),
        Ok(_) => panic!("expected start error"),
    }
}

#[tokio::test]
async fn test_non_success_status_surfaces_through_coordinator() {
    let url = upstream(|mut socket, _| async move {
        socket
            .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        socket.flush().await.unwrap();
    })
    .await;

    let ledger = Arc::new(InMemoryCreditLedger::new(10));
    let engine = Arc::new(HttpEngine::new(url).unwrap());
    let coordinator = AppState::assemble(
        &Config::default(),
        Arc::clone(&ledger) as Arc<dyn CreditLedger>,
        engine as Arc<dyn GenerationEngine>,
    );

    let err = coordinator
        .generate(GenerateRequest::new("app-1", "owner-1", "hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::EngineStartFailure(_)));
    assert_eq!(ledger.balance(&OwnerId::new("owner-1")), 10);
    assert_eq!(coordinator.status(&ResourceId::new("app-1")).state, "error");
}

#[tokio::test]
async fn test_broken_upstream_body_is_reported_in_band() {
    let url = upstream(|mut socket, _| async move {
        socket.write_all(CHUNKED_HEAD.as_bytes()).await.unwrap();
        socket.write_all(b"8\r\npartial \r\n").await.unwrap();
        socket.flush().await.unwrap();
        // Close without the terminating chunk
        drop(socket);
    })
    .await;

    let ledger = Arc::new(InMemoryCreditLedger::new(10));
    let engine = Arc::new(HttpEngine::new(url).unwrap());
    let coordinator = AppState::assemble(
        &Config::default(),
        Arc::clone(&ledger) as Arc<dyn CreditLedger>,
        engine as Arc<dyn GenerationEngine>,
    );
    let app = ResourceId::new("app-1");

    let stream = coordinator
        .generate(GenerateRequest::new("app-1", "owner-1", "hi"))
        .await
        .unwrap();
    let chunks: Vec<Vec<u8>> = stream.collect().await;
    let body = String::from_utf8(chunks.concat()).unwrap();

    assert!(body.starts_with("partial "), "{}", body);
    assert!(body[8..].starts_with("3:\""), "{}", body);
    assert!(body.ends_with("\"\n"), "{}", body);

    for _ in 0..100 {
        if coordinator.status(&app).state == "error" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(coordinator.status(&app).state, "error");
    // Spent credits stay spent once the stream was handed out
    assert_eq!(ledger.balance(&OwnerId::new("owner-1")), 9);
}

#[tokio::test]
async fn test_cancellation_aborts_upstream_request() {
    let (closed_tx, closed_rx) = oneshot::channel();
    let url = upstream(move |mut socket, _| async move {
        socket.write_all(CHUNKED_HEAD.as_bytes()).await.unwrap();
        socket.write_all(b"6\r\nhello \r\n").await.unwrap();
        socket.flush().await.unwrap();

        // Hold the response open until the client goes away
        let mut scratch = [0u8; 64];
        loop {
            match socket.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(());
    })
    .await;

    let engine = HttpEngine::new(url).unwrap();
    let cancel = CancellationToken::new();
    let run = engine.start(request("hi"), cancel.clone()).await.unwrap();
    let mut events = run.into_events();

    assert_eq!(events.recv().await, Some(EngineEvent::Chunk(b"hello ".to_vec())));

    cancel.cancel();
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while events.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "event channel stayed open after cancel");

    let closed = tokio::time::timeout(Duration::from_secs(5), closed_rx).await;
    assert!(closed.is_ok(), "upstream connection stayed open after cancel");
}

#[tokio::test]
async fn test_cancel_before_upstream_responds() {
    let url = upstream(|socket, _| async move {
        // Never answer
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(socket);
    })
    .await;

    let engine = HttpEngine::new(url).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), engine.start(request("hi"), cancel)).await;
    match result {
        Ok(Err(EngineError::Start(reason))) => assert!(reason.contains("cancelled")),
        Ok(Err(other)) => panic!("expected start error, got {:?}", other),
        Ok(Ok(_)) => panic!("expected start error"),
        Err(_) => panic!("start ignored cancellation"),
    }
}
