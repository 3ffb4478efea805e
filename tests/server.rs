use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use waypoint::{from_fn, Application, RequestLogger};

async fn start(app: Application) -> SocketAddr {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = app
            .run("127.0.0.1:0", move |addr| {
                let _ = tx.send(addr);
            })
            .await;
    });
    rx.await.unwrap()
}

async fn roundtrip(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

fn app() -> Application {
    let mut app = Application::new();
    app.middleware(RequestLogger);
    app.get("/ping", |ctx| Box::pin(async move { ctx.res.text("pong") }))
        .unwrap();
    app.post("/echo", |ctx| {
        Box::pin(async move {
            let body = ctx.req.body.text().await?;
            ctx.res.text(body)
        })
    })
    .unwrap();
    app
}

#[tokio::test]
async fn test_serves_over_tcp() {
    let addr = start(app()).await;

    let response = roundtrip(addr, "GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("content-length: 4\r\n"));
    assert!(response.ends_with("\r\n\r\npong"));

    let response = roundtrip(addr, "GET /missing HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[tokio::test]
async fn test_reads_request_body() {
    let addr = start(app()).await;
    let response = roundtrip(
        addr,
        "POST /echo HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("hello"));
}

#[tokio::test]
async fn test_head_omits_body() {
    let addr = start(app()).await;
    let response = roundtrip(addr, "HEAD /ping HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("content-length: 4\r\n"));
    assert!(response.ends_with("\r\n\r\n"));
}

#[tokio::test]
async fn test_unknown_method_is_not_implemented() {
    let addr = start(app()).await;
    let response = roundtrip(addr, "BREW /pot HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 501 Not Implemented\r\n"));
}

#[tokio::test]
async fn test_invalid_content_length_is_bad_request() {
    let addr = start(app()).await;
    let response = roundtrip(addr, "POST /echo HTTP/1.1\r\nContent-Length: five\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn test_client_disconnect_stops_chain() {
    let reached = Arc::new(AtomicBool::new(false));
    let mut app = Application::new();
    app.middleware_at(
        "/slow",
        from_fn(|ctx, next| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                next.run(ctx).await
            })
        }),
    )
    .unwrap();
    let flag = Arc::clone(&reached);
    app.get("/slow", move |ctx| {
        let flag = Arc::clone(&flag);
        Box::pin(async move {
            flag.store(true, Ordering::SeqCst);
            ctx.res.text("done")
        })
    })
    .unwrap();
    let addr = start(app).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /slow HTTP/1.1\r\n\r\n").await.unwrap();
    drop(stream);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!reached.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_connected_client_still_gets_slow_response() {
    let mut app = Application::new();
    app.get("/slow", |ctx| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.res.text("done")
        })
    })
    .unwrap();
    let addr = start(app).await;

    let response = roundtrip(addr, "GET /slow HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("done"));
}
