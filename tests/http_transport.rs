//! Tests for the HTTP transport: the synchronous and asynchronous flush
//! flows must be observably identical.

use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::post;
use axum::Router;
use url::Url;

use girder::transport::{HttpTransport, Transport};
use girder::TransportErrorKind;

/// Start an in-process endpoint that echoes every POST body back.
async fn start_echo_endpoint() -> SocketAddr {
    let app = Router::new().route("/rpc", post(|body: axum::body::Bytes| async move { body }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn transport_for(addr: SocketAddr) -> HttpTransport {
    let url = Url::parse(&format!("http://{addr}/rpc")).unwrap();
    HttpTransport::builder(url)
        .connect_timeout(Duration::from_secs(2))
        .read_timeout(Duration::from_secs(2))
        .header("x-client", "girder-test")
        .build()
        .unwrap()
}

async fn read_all(transport: &mut HttpTransport) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        match transport.read(&mut chunk).await {
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e) => {
                assert_eq!(e.kind(), TransportErrorKind::EndOfFile);
                break;
            }
        }
    }
    out
}

#[tokio::test]
async fn sync_and_async_flush_read_identical_bytes() {
    let addr = start_echo_endpoint().await;
    let payload = b"[1,\"ping\",1,7,{}]";

    let mut sync_transport = transport_for(addr);
    sync_transport.write(payload).await.unwrap();
    sync_transport.flush().await.unwrap();
    let sync_bytes = read_all(&mut sync_transport).await;

    let mut async_transport = transport_for(addr);
    async_transport.write(payload).await.unwrap();
    let handle = async_transport.begin_flush().unwrap();
    async_transport.end_flush(handle).await.unwrap();
    let async_bytes = read_all(&mut async_transport).await;

    assert_eq!(sync_bytes, payload);
    assert_eq!(sync_bytes, async_bytes);
}

#[tokio::test]
async fn sync_and_async_flush_fail_identically_when_unreachable() {
    // Nothing listens here; both flows must classify the failure the same way.
    let url = Url::parse("http://127.0.0.1:9/rpc").unwrap();

    let mut sync_transport = HttpTransport::builder(url.clone())
        .connect_timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    sync_transport.write(b"payload").await.unwrap();
    let sync_err = sync_transport.flush().await.unwrap_err();

    let mut async_transport = HttpTransport::builder(url)
        .connect_timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    async_transport.write(b"payload").await.unwrap();
    let handle = async_transport.begin_flush().unwrap();
    let async_err = async_transport.end_flush(handle).await.unwrap_err();

    assert_eq!(sync_err.kind(), async_err.kind());
}

#[tokio::test]
async fn callback_consumer_observes_completion() {
    let addr = start_echo_endpoint().await;

    let mut transport = transport_for(addr);
    transport.write(b"observed").await.unwrap();
    let handle = transport.begin_flush().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    handle.forward(move |outcome| {
        let _ = tx.send(outcome);
    });

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("callback should fire")
        .unwrap();
    assert_eq!(outcome.unwrap(), b"observed");
}

#[tokio::test]
async fn second_flush_rejected_while_one_is_in_flight() {
    // A blackhole address keeps the first exchange pending long enough.
    let url = Url::parse("http://10.255.255.1:9/rpc").unwrap();
    let mut transport = HttpTransport::builder(url)
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    transport.write(b"first").await.unwrap();
    let _pending = transport.begin_flush().unwrap();

    transport.write(b"second").await.unwrap();
    let err = transport.begin_flush().unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::NotOpen);
}

#[tokio::test]
async fn read_before_any_exchange_is_rejected() {
    let url = Url::parse("http://127.0.0.1:9/rpc").unwrap();
    let mut transport = HttpTransport::builder(url).build().unwrap();

    let mut buf = [0u8; 8];
    let err = transport.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::NotOpen);
}

#[tokio::test]
async fn output_buffer_resets_after_failed_flush() {
    let addr = start_echo_endpoint().await;
    let unreachable = Url::parse("http://127.0.0.1:9/rpc").unwrap();

    let mut transport = HttpTransport::builder(unreachable)
        .connect_timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    transport.write(b"lost message").await.unwrap();
    assert!(transport.flush().await.is_err());

    // The failed message must not leak into the next exchange.
    let mut transport = transport_for(addr);
    transport.write(b"clean").await.unwrap();
    transport.flush().await.unwrap();
    assert_eq!(read_all(&mut transport).await, b"clean");
}
