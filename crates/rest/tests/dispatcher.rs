//! Dispatcher behaviour against local HTTP servers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use {
    axum::{
        Router,
        extract::State,
        response::{IntoResponse, Response},
        routing::any,
    },
    http::{Method, StatusCode},
    tokio::net::TcpListener,
};

use {
    ferrule_config::{ClientConfig, INTERACTION_CALLBACK_ROUTE},
    ferrule_ratelimit::{NIL_BUCKET_ID, RequestKey},
    ferrule_rest::{CreateMessage, Dispatcher, Error, InteractionResponse, routes},
};

fn config(base: &str) -> ClientConfig {
    let mut cfg = ClientConfig::new("test-token");
    cfg.api_base = base.to_string();
    cfg
}

// ── mockito: single-response endpoints ──────────────────────────────

#[tokio::test]
async fn learns_route_bucket_from_headers() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v10/channels/123/messages")
        .match_header("authorization", "Bot test-token")
        .match_header("content-type", "application/json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_header("x-ratelimit-limit", "5")
        .with_header("x-ratelimit-remaining", "4")
        .with_header("x-ratelimit-reset-after", "5")
        .with_header("x-ratelimit-bucket", "abc")
        .with_body(r#"{"id":"1","channel_id":"123","content":"hi"}"#)
        .expect(2)
        .create_async()
        .await;

    let dispatcher = Dispatcher::new(&config(&server.url())).unwrap();
    let message = dispatcher
        .create_message("123", &CreateMessage::new("hi"))
        .await
        .unwrap();
    assert_eq!(message.id, "1");

    let key = RequestKey::new(routes::CREATE_MESSAGE, "123");
    {
        let mut tx = dispatcher.rate_limit().start_tx();
        assert_eq!(tx.bucket_id(&key), Some("abc"));
        let bucket = tx.get_bucket(&key).unwrap();
        assert_eq!(bucket.id(), "abc");
        assert_eq!(bucket.limit(), 5);
        assert_eq!(bucket.remaining(), 4);
        assert_eq!(bucket.pending(), 0);
        let global = tx.get_bucket(&RequestKey::global()).unwrap();
        assert_eq!(global.limit(), 50);
        assert_eq!(global.pending(), 0);
    }

    // The default bucket allows one request per second; the learned one
    // has four left, so the second call goes straight out.
    let started = Instant::now();
    dispatcher
        .create_message("123", &CreateMessage::new("again"))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    mock.assert_async().await;
}

#[tokio::test]
async fn short_reset_after_replaces_default_window() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v10/channels/123/messages")
        .with_status(200)
        .with_header("x-ratelimit-limit", "5")
        .with_header("x-ratelimit-remaining", "4")
        .with_header("x-ratelimit-reset-after", "0.5")
        .with_header("x-ratelimit-bucket", "abc")
        .with_body(r#"{"id":"1","channel_id":"123","content":"hi"}"#)
        .create_async()
        .await;

    let dispatcher = Dispatcher::new(&config(&server.url())).unwrap();
    dispatcher
        .create_message("123", &CreateMessage::new("hi"))
        .await
        .unwrap();

    let key = RequestKey::new(routes::CREATE_MESSAGE, "123");
    let mut tx = dispatcher.rate_limit().start_tx();
    let bucket = tx.get_bucket(&key).unwrap();
    assert_eq!(bucket.id(), "abc");
    assert_eq!((bucket.limit(), bucket.remaining()), (5, 4));
}

#[tokio::test]
async fn malformed_limit_header_does_not_block_route() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v10/channels/123/messages")
        .with_status(200)
        .with_header("x-ratelimit-limit", "garbage")
        .with_header("x-ratelimit-remaining", "4")
        .with_header("x-ratelimit-reset-after", "2")
        .with_header("x-ratelimit-bucket", "abc")
        .with_body(r#"{"id":"1","channel_id":"123","content":"hi"}"#)
        .expect(2)
        .create_async()
        .await;

    let dispatcher = Dispatcher::new(&config(&server.url())).unwrap();
    dispatcher
        .create_message("123", &CreateMessage::new("hi"))
        .await
        .unwrap();
    let key = RequestKey::new(routes::CREATE_MESSAGE, "123");
    assert_eq!(
        dispatcher.rate_limit().start_tx().bucket_id(&key),
        Some(NIL_BUCKET_ID)
    );

    tokio::time::timeout(
        Duration::from_secs(1),
        dispatcher.create_message("123", &CreateMessage::new("again")),
    )
    .await
    .expect("second call is not held back")
    .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn response_without_bucket_marks_route_unlimited() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/v10/users/@me")
        .with_status(200)
        .with_body(r#"{"id":"9","username":"ferrule","bot":true}"#)
        .create_async()
        .await;

    let dispatcher = Dispatcher::new(&config(&server.url())).unwrap();
    let user = dispatcher.get_current_user().await.unwrap();
    assert!(user.bot);

    let key = RequestKey::new(routes::GET_CURRENT_USER, "");
    let mut tx = dispatcher.rate_limit().start_tx();
    assert_eq!(tx.bucket_id(&key), Some(NIL_BUCKET_ID));
    assert!(tx.get_bucket(&key).is_none());
}

#[tokio::test]
async fn client_error_carries_route_and_correlation() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v10/channels/404/messages")
        .with_status(404)
        .with_header("x-request-id", "req-77")
        .with_body(r#"{"message":"Unknown Channel","code":10003}"#)
        .create_async()
        .await;

    let dispatcher = Dispatcher::new(&config(&server.url())).unwrap();
    let err = dispatcher
        .create_message("404", &CreateMessage::new("hi"))
        .await
        .unwrap_err();
    match err {
        Error::Request {
            status,
            route,
            resource,
            message,
            code,
            correlation,
        } => {
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(route, routes::CREATE_MESSAGE);
            assert_eq!(resource, "404");
            assert_eq!(message, "Unknown Channel");
            assert_eq!(code, Some(10003));
            assert_eq!(correlation.as_deref(), Some("req-77"));
        },
        other => panic!("expected request error, got {other:?}"),
    }
}

#[tokio::test]
async fn exempt_route_skips_admission() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v10/interactions/55/tok/callback")
        .with_status(204)
        .expect(3)
        .create_async()
        .await;

    let dispatcher = Dispatcher::new(&config(&server.url())).unwrap();
    let reply = InteractionResponse {
        kind: 4,
        data: Some(serde_json::json!({ "content": "pong" })),
    };
    let started = Instant::now();
    for _ in 0..3 {
        dispatcher
            .create_interaction_response("55", "tok", &reply)
            .await
            .unwrap();
    }
    // Three calls on a one-per-second default bucket would take two seconds.
    assert!(started.elapsed() < Duration::from_millis(900));
    mock.assert_async().await;

    let mut tx = dispatcher.rate_limit().start_tx();
    let key = RequestKey::new(INTERACTION_CALLBACK_ROUTE, "55");
    assert!(tx.bucket_id(&key).is_none());
    assert_eq!(tx.get_bucket(&RequestKey::global()).unwrap().remaining(), 50);
}

#[tokio::test]
async fn gateway_bot_decodes() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/v10/gateway/bot")
        .with_status(200)
        .with_body(
            r#"{"url":"wss://gateway.example","shards":1,
                "session_start_limit":{"total":1000,"remaining":999,"reset_after":14400000,"max_concurrency":1}}"#,
        )
        .create_async()
        .await;

    let dispatcher = Dispatcher::new(&config(&server.url())).unwrap();
    let bot = dispatcher.get_gateway_bot().await.unwrap();
    assert_eq!(bot.url, "wss://gateway.example");
    assert_eq!(bot.session_start_limit.remaining, 999);
}

// ── axum: scripted multi-response servers ───────────────────────────

type Script = fn(usize) -> Response;

#[derive(Clone)]
struct Scripted {
    hits: Arc<AtomicUsize>,
    script: Script,
}

async fn scripted(State(state): State<Scripted>) -> Response {
    let n = state.hits.fetch_add(1, Ordering::SeqCst);
    (state.script)(n)
}

async fn serve(path: &str, script: Script) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(path, any(scripted))
        .with_state(Scripted {
            hits: Arc::clone(&hits),
            script,
        });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

fn ok() -> Response {
    (
        StatusCode::OK,
        [
            ("x-ratelimit-bucket", "w1"),
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "4"),
            ("x-ratelimit-reset-after", "1"),
        ],
        "{}",
    )
        .into_response()
}

fn shared_429() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("x-ratelimit-scope", "shared")],
        r#"{"message":"resource busy","retry_after":0.05,"global":false}"#,
    )
        .into_response()
}

async fn get_widget(dispatcher: &Dispatcher) -> ferrule_rest::Result<ferrule_rest::RestResponse> {
    dispatcher
        .send("widgets", "7", Method::GET, "/widgets/7", None, None)
        .await
}

#[tokio::test]
async fn route_429_waits_then_retries() {
    let (base, hits) = serve("/v10/widgets/7", |n| {
        if n == 0 {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    ("x-ratelimit-scope", "user"),
                    ("x-ratelimit-bucket", "w1"),
                    ("x-ratelimit-limit", "5"),
                    ("x-ratelimit-remaining", "0"),
                    ("x-ratelimit-reset-after", "0.2"),
                ],
                r#"{"message":"You are being rate limited.","retry_after":0.2,"global":false}"#,
            )
                .into_response()
        } else {
            ok()
        }
    })
    .await;

    let dispatcher = Dispatcher::new(&config(&base)).unwrap();
    let started = Instant::now();
    let response = get_widget(&dispatcher).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_millis(150));

    let mut tx = dispatcher.rate_limit().start_tx();
    assert_eq!(tx.bucket_id(&RequestKey::new("widgets", "7")), Some("w1"));
}

#[tokio::test]
async fn global_429_exhausts_global_bucket() {
    let (base, hits) = serve("/v10/widgets/7", |n| {
        if n == 0 {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("x-ratelimit-global", "true"), ("retry-after", "1")],
                r#"{"message":"global","retry_after":0.2,"global":true}"#,
            )
                .into_response()
        } else {
            ok()
        }
    })
    .await;

    let mut cfg = config(&base);
    cfg.rate_limit.default_bucket.limit = 10;
    let dispatcher = Dispatcher::new(&cfg).unwrap();
    let started = Instant::now();
    get_widget(&dispatcher).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    // The body's retry_after wins over the header.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_millis(900));
}

#[tokio::test]
async fn shared_429_without_retry_shared_returns_status() {
    let (base, hits) = serve("/v10/widgets/7", |_| shared_429()).await;

    let mut cfg = config(&base);
    cfg.rest.retry_shared = false;
    cfg.rest.max_retries = 3;
    let dispatcher = Dispatcher::new(&cfg).unwrap();
    let err = get_widget(&dispatcher).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::TOO_MANY_REQUESTS));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shared_429_retries_are_bounded() {
    let (base, hits) = serve("/v10/widgets/7", |_| shared_429()).await;

    let mut cfg = config(&base);
    cfg.rest.max_retries = 2;
    cfg.rate_limit.default_bucket.limit = 10;
    let dispatcher = Dispatcher::new(&cfg).unwrap();
    let err = get_widget(&dispatcher).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::TOO_MANY_REQUESTS));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn bad_gateway_is_retried() {
    let (base, hits) = serve("/v10/widgets/7", |n| {
        if n == 0 {
            (StatusCode::BAD_GATEWAY, "upstream down").into_response()
        } else {
            ok()
        }
    })
    .await;

    let dispatcher = Dispatcher::new(&config(&base)).unwrap();
    get_widget(&dispatcher).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn persistent_bad_gateway_surfaces_after_retries() {
    let (base, hits) = serve("/v10/widgets/7", |_| {
        (StatusCode::BAD_GATEWAY, "upstream down").into_response()
    })
    .await;

    let dispatcher = Dispatcher::new(&config(&base)).unwrap();
    let err = get_widget(&dispatcher).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // Neither attempt was counted by the server, so both tokens came back.
    let mut tx = dispatcher.rate_limit().start_tx();
    assert_eq!(tx.get_bucket(&RequestKey::global()).unwrap().remaining(), 50);
}
