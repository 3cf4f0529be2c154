//! Integration tests for the request pipeline.
//!
//! Requests are driven through the router with `oneshot` and forwarded to a
//! mock engine listening on a temporary Unix socket.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{policy, spawn_backend, spawn_silent_backend, state_at};
use doxy_proxy::api::REWRITE_BUFFER_LIMIT_BYTES;
use doxy_proxy::create_router;
use doxy_proxy::policy::{GPU_DEVICES, GPU_DRIVER_BIND, GPU_PATH_ENV};
use doxy_proxy::trace::TRACE_ID_HEADER;
use http_body_util::BodyExt;
use serde_json::Value;
use std::time::Duration;
use tower::ServiceExt;

const CREATE_ONLY: &[&str] = &["^/containers/create$"];

fn create_request(uri: &str, body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

async fn body_json(body: Body) -> Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn strings(value: &Value) -> Vec<String> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

// ============================================================================
// Gate
// ============================================================================

#[tokio::test]
async fn test_unlisted_path_is_rejected_without_backend_contact() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(CREATE_ONLY, &["/data:/data"], &[], true)));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/images/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["message"], "'/images/json' is not allowed.");
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn test_rejected_create_body_is_never_read() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(&["^/_ping$"], &[], &[], true)));

    // Not valid JSON: a rejection must come from the gate, not the decoder.
    let response = app
        .oneshot(create_request("/containers/create", "{broken"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn test_empty_allow_list_rejects_everything() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(&[], &[], &[], false)));

    let response = app
        .oneshot(Request::builder().uri("/_ping").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(backend.connections(), 0);
}

// ============================================================================
// Rewrite
// ============================================================================

#[tokio::test]
async fn test_gpu_scenario_injects_mounts_and_devices() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(CREATE_ONLY, &["/data:/data"], &[], true)));

    let response = app
        .oneshot(create_request("/containers/create", r#"{"Image":"x"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["Id"], "4fa6e0f0c678");

    let received = backend.last();
    assert_eq!(received.method, "POST");
    let sent = received.json();
    assert_eq!(sent["Image"], "x");

    let binds = strings(&sent["HostConfig"]["Binds"]);
    assert!(binds.contains(&GPU_DRIVER_BIND.to_string()));
    assert!(binds.contains(&"/data:/data".to_string()));

    let devices: Vec<String> = sent["HostConfig"]["Devices"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["PathOnHost"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = GPU_DEVICES
        .iter()
        .map(|spec| spec.split(':').next().unwrap().to_string())
        .collect();
    assert_eq!(devices, expected);

    assert_eq!(strings(&sent["Env"]), vec![GPU_PATH_ENV.to_string()]);
}

#[tokio::test]
async fn test_content_length_matches_rewritten_body() {
    let body = r#"{"Image":"x","HostConfig":{"Binds":["/home:/home"]}}"#;

    let plain = spawn_backend().await;
    create_router(plain.state(policy(CREATE_ONLY, &[], &[], false)))
        .oneshot(create_request("/containers/create", body))
        .await
        .unwrap();

    let enriched = spawn_backend().await;
    create_router(enriched.state(policy(
        CREATE_ONLY,
        &["/data:/data", "/scratch:/scratch"],
        &["/dev/fuse:/dev/fuse:rwm"],
        false,
    )))
    .oneshot(create_request("/containers/create", body))
    .await
    .unwrap();

    let plain = plain.last();
    let enriched = enriched.last();
    assert_eq!(plain.content_length(), Some(plain.body.len()));
    assert_eq!(enriched.content_length(), Some(enriched.body.len()));
    assert!(enriched.body.len() > plain.body.len());
    assert!(enriched.body.len() > body.len());
    assert!(enriched.headers.get(header::TRANSFER_ENCODING).is_none());
}

#[tokio::test]
async fn test_chunked_create_body_is_reframed() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(CREATE_ONLY, &["/data:/data"], &[], false)));

    // No Content-Length: the body arrives with unknown length.
    let request = Request::builder()
        .method("POST")
        .uri("/containers/create")
        .header(header::TRANSFER_ENCODING, "chunked")
        .body(Body::from(r#"{"Image":"x"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let received = backend.last();
    assert_eq!(received.content_length(), Some(received.body.len()));
    assert_eq!(strings(&received.json()["HostConfig"]["Binds"]), vec!["/data:/data"]);
}

#[tokio::test]
async fn test_malformed_device_spec_is_skipped() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(
        CREATE_ONLY,
        &[],
        &["/dev/only-one-colon:/dev/x", "/dev/fuse:/dev/fuse:rwm", "/dev/nope"],
        false,
    )));

    let response = app
        .oneshot(create_request("/containers/create", r#"{"Image":"x"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let sent = backend.last().json();
    let devices = sent["HostConfig"]["Devices"].as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["PathOnHost"], "/dev/fuse");
    assert_eq!(devices[0]["PathInContainer"], "/dev/fuse");
    assert_eq!(devices[0]["CgroupPermissions"], "rwm");
}

#[tokio::test]
async fn test_caller_fields_survive_rewrite() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(
        &["^/v1\\.43/containers/create$"],
        &["/data:/data"],
        &[],
        false,
    )));

    let body = r#"{"Image":"x","Labels":{"a":"b"},"HostConfig":{"Binds":["/home:/home:ro"],"ShmSize":1024},"NetworkingConfig":{"EndpointsConfig":{"net":{"Aliases":["web"]}}}}"#;
    let response = app
        .oneshot(create_request("/v1.43/containers/create?name=web", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let received = backend.last();
    assert_eq!(received.uri, "/v1.43/containers/create?name=web");
    let sent = received.json();
    assert_eq!(sent["Labels"]["a"], "b");
    assert_eq!(sent["HostConfig"]["ShmSize"], 1024);
    assert_eq!(
        sent["NetworkingConfig"]["EndpointsConfig"]["net"]["Aliases"][0],
        "web"
    );
    assert_eq!(
        strings(&sent["HostConfig"]["Binds"]),
        vec!["/home:/home:ro", "/data:/data"]
    );
}

#[tokio::test]
async fn test_case_variant_host_config_is_merged_not_shadowed() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(CREATE_ONLY, &["/data:/data"], &[], false)));

    let response = app
        .oneshot(create_request(
            "/containers/create",
            r#"{"Image":"x","hostConfig":{"Binds":["/home:/home"]}}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let received = backend.last();
    let sent = received.json();
    let object = sent.as_object().unwrap();
    let host_keys: Vec<&String> = object
        .keys()
        .filter(|k| k.eq_ignore_ascii_case("HostConfig"))
        .collect();
    assert_eq!(host_keys, vec!["HostConfig"]);
    assert_eq!(
        strings(&sent["HostConfig"]["Binds"]),
        vec!["/home:/home", "/data:/data"]
    );
    assert_eq!(received.content_length(), Some(received.body.len()));
}

#[tokio::test]
async fn test_oversized_create_body_is_rejected() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(CREATE_ONLY, &[], &[], false)));

    let request = Request::builder()
        .method("POST")
        .uri("/containers/create")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(vec![b' '; REWRITE_BUFFER_LIMIT_BYTES + 1]))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn test_undecodable_create_body_is_rejected() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(CREATE_ONLY, &[], &[], true)));

    let response = app
        .oneshot(create_request("/containers/create", "{not json"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn test_empty_create_body_is_forwarded_unchanged() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(CREATE_ONLY, &["/data:/data"], &[], true)));

    let response = app
        .oneshot(create_request("/containers/create", ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let received = backend.last();
    assert!(received.body.is_empty());
    assert_eq!(received.content_length(), Some(0));
}

// ============================================================================
// Pass-through
// ============================================================================

#[tokio::test]
async fn test_other_bodies_are_forwarded_verbatim() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(
        &["^/containers/[0-9a-f]+/exec$"],
        &["/data:/data"],
        &[],
        true,
    )));

    let body = r#"{"Cmd":["ls","-la"],"AttachStdout":true}"#;
    let response = app
        .oneshot(create_request("/containers/4fa6e0f0c678/exec", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let received = backend.last();
    assert_eq!(received.body, body.as_bytes());
    assert_eq!(received.content_length(), Some(body.len()));
}

#[tokio::test]
async fn test_target_is_rewritten_with_query_preserved() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(&["^/containers/json$"], &[], &[], false)));

    let uri = "/containers/json?all=1&filters=%7B%22status%22%3A%5B%22exited%22%5D%7D";
    let response = app
        .oneshot(
            Request::builder()
                .uri(uri)
                .header(header::HOST, "client.example")
                .header("X-Registry-Auth", "e30=")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(TRACE_ID_HEADER));

    let received = backend.last();
    assert_eq!(received.method, "GET");
    assert_eq!(received.uri, uri);
    assert_eq!(received.headers[header::HOST], "docker");
    assert_eq!(received.headers["x-registry-auth"], "e30=");
}

#[tokio::test]
async fn test_backend_hop_headers_do_not_reach_the_client() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(&["^/_ping$"], &[], &[], false)));

    let response = app
        .oneshot(Request::builder().uri("/_ping").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    // The backend hop is always closed; the client connection is not.
    assert_eq!(backend.last().headers[header::CONNECTION], "close");
    assert!(response.headers().get(header::CONNECTION).is_none());
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
}

#[tokio::test]
async fn test_each_request_uses_a_fresh_connection() {
    let backend = spawn_backend().await;
    let app = create_router(backend.state(policy(&["^/_ping$"], &[], &[], false)));

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/_ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(backend.connections(), 3);
    assert_eq!(backend.received().len(), 3);
}

// ============================================================================
// Backend failures
// ============================================================================

#[tokio::test]
async fn test_unreachable_backend_is_a_gateway_error() {
    let backend = spawn_backend().await;
    let state = backend.state(policy(&["^/_ping$"], &[], &[], false));
    drop(backend);

    let response = create_router(state)
        .oneshot(Request::builder().uri("/_ping").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let json = body_json(response.into_body()).await;
    assert!(json["message"].as_str().unwrap().contains("docker.sock"));
}

#[tokio::test]
async fn test_silent_backend_hits_response_deadline() {
    let (_dir, path) = spawn_silent_backend().await;
    let state = state_at(
        &path,
        policy(&["^/containers/[0-9a-f]+/wait$"], &[], &[], false),
        Some(Duration::from_millis(200)),
    );

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        create_router(state).oneshot(
            Request::builder()
                .method("POST")
                .uri("/containers/4fa6e0f0c678/wait")
                .body(Body::empty())
                .unwrap(),
        ),
    )
    .await
    .expect("deadline should fire before the test timeout")
    .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let json = body_json(response.into_body()).await;
    assert!(json["message"].as_str().unwrap().contains("no response from backend"));
}
