// tests/gateway_tests.rs
//
// End-to-end tests: real gateway server on an ephemeral port, real TCP mock
// backends, reqwest as the client.
mod support;

use std::future::Future;
use std::time::{Duration, Instant};
use support::{start_gateway, test_config, MockBackend, SSE_EVENTS};

fn chat_body(content: &str) -> serde_json::Value {
    serde_json::json!({
        "model": "m",
        "messages": [{"role": "user", "content": content}],
    })
}

fn looks_like_request_id(s: &str) -> bool {
    s.len() == 36
        && s.chars().enumerate().all(|(i, c)| {
            if matches!(i, 8 | 13 | 18 | 23) {
                c == '-'
            } else {
                c.is_ascii_hexdigit()
            }
        })
}

async fn eventually<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let end = Instant::now() + deadline;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn control_endpoints_respond() {
    let gateway = start_gateway(test_config(vec![])).await;
    let client = reqwest::Client::new();

    let response = client.get(gateway.url("/")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let server = response.headers().get("server").unwrap().to_str().unwrap();
    assert!(server.starts_with("NTONIX/"), "got Server: {server}");
    let banner: serde_json::Value = response.json().await.unwrap();
    assert_eq!(banner["name"], "NTONIX");
    assert_eq!(banner["endpoints"]["chat_completions"], "/v1/chat/completions");

    let response = client.get(gateway.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), r#"{"status":"healthy"}"#);

    let response = client.get(gateway.url("/cache/stats")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let stats: serde_json::Value = response.json().await.unwrap();
    assert_eq!(stats["entries"], 0);

    let response = client.get(gateway.url("/no/such/path")).send().await.unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn chat_requires_json_and_healthy_backends() {
    let gateway = start_gateway(test_config(vec![])).await;
    let client = reqwest::Client::new();

    let response = client
        .post(gateway.url("/v1/chat/completions"))
        .header("content-type", "text/plain")
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 415);

    let response = client
        .post(gateway.url("/v1/chat/completions"))
        .json(&chat_body("hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "No healthy backends available");
}

#[tokio::test]
async fn identical_requests_hit_the_cache() {
    let backend = MockBackend::spawn("b1").await;
    let gateway = start_gateway(test_config(vec![backend.backend_config(1)])).await;
    let client = reqwest::Client::new();
    let body = chat_body("hi");

    let first = client
        .post(gateway.url("/v1/chat/completions"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
    let first_body = first.text().await.unwrap();

    let second = client
        .post(gateway.url("/v1/chat/completions"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    let second_body = second.text().await.unwrap();

    assert_eq!(first_body, second_body);
    assert_eq!(backend.chat_requests(), 1, "second request never reached the backend");

    let stats: serde_json::Value = client
        .get(gateway.url("/cache/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["hits"], 1);
    assert_eq!(stats["misses"], 1);
    assert_eq!(stats["entries"], 1);

    // Cache-Control: no-store forwards to the backend even with a warm cache.
    let third = client
        .post(gateway.url("/v1/chat/completions"))
        .header("cache-control", "no-store")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(third.status(), 200);
    assert_eq!(third.headers().get("x-cache").unwrap(), "MISS");
    assert_eq!(backend.chat_requests(), 2);

    let stats: serde_json::Value = client
        .get(gateway.url("/cache/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["hits"], 1, "bypass does not count as a hit");
    assert_eq!(stats["misses"], 1, "bypass does not count as a miss");
}

#[tokio::test]
async fn streaming_relays_sse_and_poisons_the_connection() {
    let backend = MockBackend::spawn("s1").await;
    let gateway = start_gateway(test_config(vec![backend.backend_config(1)])).await;
    let client = reqwest::Client::new();

    let body = serde_json::json!({
        "model": "m",
        "stream": true,
        "messages": [{"role": "user", "content": "hi"}],
    });

    let response = client
        .post(gateway.url("/v1/chat/completions"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(response.headers().get("x-cache").unwrap(), "MISS");

    // De-chunked client bytes are exactly the backend's SSE payload.
    let received = response.bytes().await.unwrap();
    assert_eq!(&received[..], SSE_EVENTS.concat().as_bytes());

    // Streaming bypasses the cache entirely.
    let stats: serde_json::Value = client
        .get(gateway.url("/cache/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["entries"], 0);
    assert_eq!(stats["hits"], 0);
    assert_eq!(stats["misses"], 0);

    // The streamed connection must not go back to the idle pool.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let pool = gateway.proxy.pools().pool(&backend.key()).unwrap();
    assert_eq!(pool.available_count(), 0);
    assert_eq!(pool.in_use_count(), 0);
}

async fn post_chat_status(client: &reqwest::Client, url: &str) -> u16 {
    client
        .post(url)
        .header("cache-control", "no-store")
        .json(&chat_body("ping"))
        .send()
        .await
        .unwrap()
        .status()
        .as_u16()
}

#[tokio::test]
async fn unhealthy_backend_is_dropped_and_recovers() {
    let backend = MockBackend::spawn("h1").await;
    let gateway = start_gateway(test_config(vec![backend.backend_config(1)])).await;
    let client = reqwest::Client::new();
    let url = gateway.url("/v1/chat/completions");

    assert_eq!(post_chat_status(&client, &url).await, 200);

    backend.set_health_status(500);
    let went_down = eventually(Duration::from_secs(5), || {
        let client = client.clone();
        let url = url.clone();
        async move { post_chat_status(&client, &url).await == 503 }
    })
    .await;
    assert!(went_down, "backend never became unhealthy after failed probes");

    backend.set_health_status(200);
    let came_back = eventually(Duration::from_secs(5), || {
        let client = client.clone();
        let url = url.clone();
        async move { post_chat_status(&client, &url).await == 200 }
    })
    .await;
    assert!(came_back, "backend never recovered after healthy probes");
}

#[tokio::test]
async fn request_ids_and_forwarded_headers() {
    let backend = MockBackend::spawn("r1").await;
    let gateway = start_gateway(test_config(vec![backend.backend_config(1)])).await;
    let client = reqwest::Client::new();

    let response = client
        .post(gateway.url("/v1/chat/completions"))
        .header("cache-control", "no-store")
        .header("x-request-id", "client-chosen-id")
        .json(&chat_body("one"))
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "client-chosen-id"
    );

    let seen = backend.last_chat_headers();
    assert!(seen.contains("X-Request-ID: client-chosen-id"), "{seen}");
    assert!(seen.contains("X-Forwarded-For: 127.0.0.1"), "{seen}");
    assert!(seen.contains("X-Real-IP: 127.0.0.1"), "{seen}");
    assert!(seen.contains("Connection: keep-alive"), "{seen}");

    let response = client
        .post(gateway.url("/v1/chat/completions"))
        .header("cache-control", "no-store")
        .json(&chat_body("two"))
        .send()
        .await
        .unwrap();
    let generated = response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(looks_like_request_id(&generated), "got {generated}");
}

#[tokio::test]
async fn weighted_distribution_across_backends() {
    let heavy = MockBackend::spawn("heavy").await;
    let light = MockBackend::spawn("light").await;
    let gateway = start_gateway(test_config(vec![
        heavy.backend_config(3),
        light.backend_config(1),
    ]))
    .await;
    let client = reqwest::Client::new();

    for i in 0..4 {
        let response = client
            .post(gateway.url("/v1/chat/completions"))
            .header("cache-control", "no-store")
            .json(&chat_body(&format!("message {i}")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    assert_eq!(heavy.chat_requests(), 3);
    assert_eq!(light.chat_requests(), 1);
}

#[tokio::test]
async fn reload_prunes_removed_backends() {
    let kept = MockBackend::spawn("kept").await;
    let dropped = MockBackend::spawn("dropped").await;
    let gateway = start_gateway(test_config(vec![
        kept.backend_config(1),
        dropped.backend_config(1),
    ]))
    .await;
    let client = reqwest::Client::new();
    let url = gateway.url("/v1/chat/completions");

    // Warm both pools.
    for i in 0..2 {
        let response = client
            .post(&url)
            .header("cache-control", "no-store")
            .json(&chat_body(&format!("warm {i}")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    assert!(gateway.proxy.pools().pool(&dropped.key()).is_some());

    gateway.proxy.set_backends(&[kept.backend_config(1)]);

    assert!(gateway.proxy.pools().pool(&kept.key()).is_some());
    assert!(
        gateway.proxy.pools().pool(&dropped.key()).is_none(),
        "pool for the removed backend is destroyed"
    );

    // All traffic now lands on the surviving backend.
    let before = kept.chat_requests();
    for i in 0..3 {
        let response = client
            .post(&url)
            .header("cache-control", "no-store")
            .json(&chat_body(&format!("after {i}")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    assert_eq!(kept.chat_requests(), before + 3);
}

#[tokio::test]
async fn shutdown_drains_in_flight_then_refuses_connections() {
    let backend = MockBackend::spawn("g1").await;
    let gateway = start_gateway(test_config(vec![backend.backend_config(1)])).await;
    let client = reqwest::Client::new();

    // Slow request held open across the shutdown signal.
    let slow_client = client.clone();
    let slow_url = gateway.url("/v1/chat/completions");
    let in_flight = tokio::spawn(async move {
        slow_client
            .post(slow_url)
            .header("cache-control", "no-store")
            .json(&serde_json::json!({
                "model": "m",
                "slow": 1,
                "messages": [{"role": "user", "content": "take your time"}],
            }))
            .send()
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    gateway.shutdown.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status(), 200, "in-flight request completed");

    // Fresh connections are refused once the listener is closed.
    let fresh = reqwest::Client::new();
    let refused = fresh.get(gateway.url("/health")).send().await;
    assert!(refused.is_err(), "listener should be closed");

    gateway.proxy.shutdown();
}
