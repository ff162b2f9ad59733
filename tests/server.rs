use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use texpress::config::{Config, MAX_UPLOAD_SIZE};
use texpress::queue::QueueManager;
use texpress::server::{self, AppState};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

const SECRET: &str = "test-secret";
const ORIGIN: &str = "https://app.example.com";

fn test_config(max_concurrent: usize, max_queue_size: usize) -> Config {
    Config {
        api_secret: SECRET.to_string(),
        allowed_origin: ORIGIN.to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        max_concurrent,
        max_queue_size,
        convex: None,
    }
}

/// Bind an ephemeral port and serve the real router. `start_queue = false`
/// leaves submissions pending forever, which is how the queue-full path is
/// exercised deterministically.
async fn spawn_app(start_queue: bool, max_concurrent: usize, max_queue_size: usize) -> String {
    let queue = QueueManager::new(max_concurrent, max_queue_size);
    if start_queue {
        queue.start();
    }
    let state = Arc::new(AppState {
        config: test_config(max_concurrent, max_queue_size),
        queue,
        backend: None,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://{addr}")
}

fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn compile_form(zip: Vec<u8>, entrypoint: &str) -> reqwest::multipart::Form {
    reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(zip).file_name("src.zip"),
        )
        .text("entrypoint", entrypoint.to_string())
}

#[tokio::test]
async fn health_is_unauthenticated() {
    let base = spawn_app(false, 1, 5).await;
    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn compile_rejects_missing_and_wrong_bearer_tokens() {
    let base = spawn_app(false, 1, 5).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/compile"))
        .multipart(compile_form(build_zip(&[("main.tex", b"x")]), "main.tex"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .post(format!("{base}/compile"))
        .header("Authorization", "Bearer wrong")
        .multipart(compile_form(build_zip(&[("main.tex", b"x")]), "main.tex"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn unsafe_archive_is_a_zip_safety_violation() {
    let base = spawn_app(true, 1, 5).await;
    let zip = build_zip(&[("../escape.tex", b"evil")]);

    let response = reqwest::Client::new()
        .post(format!("{base}/compile"))
        .header("Authorization", format!("Bearer {SECRET}"))
        .multipart(compile_form(zip, "main.tex"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "zip_safety_violation");
}

#[tokio::test]
async fn missing_entrypoint_surfaces_as_compilation_failed() {
    let base = spawn_app(true, 1, 5).await;
    let zip = build_zip(&[("main.tex", b"\\documentclass{article}")]);

    let response = reqwest::Client::new()
        .post(format!("{base}/compile"))
        .header("Authorization", format!("Bearer {SECRET}"))
        .multipart(compile_form(zip, "other.tex"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "compilation_failed");
    assert_eq!(body["log"], "Entrypoint not found: other.tex");
}

#[tokio::test]
async fn oversized_upload_is_rejected_with_413() {
    let base = spawn_app(false, 1, 5).await;
    let blob = vec![0u8; MAX_UPLOAD_SIZE + 1];

    let response = reqwest::Client::new()
        .post(format!("{base}/compile"))
        .header("Authorization", format!("Bearer {SECRET}"))
        .multipart(compile_form(blob, "main.tex"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "upload_too_large");
}

#[tokio::test]
async fn saturated_queue_returns_503() {
    // Queue capacity 1 and no dispatcher: the first request parks forever,
    // the second bounces.
    let base = spawn_app(false, 1, 1).await;
    let client = reqwest::Client::new();

    let first_base = base.clone();
    let first_client = client.clone();
    tokio::spawn(async move {
        let _ = first_client
            .post(format!("{first_base}/compile"))
            .header("Authorization", format!("Bearer {SECRET}"))
            .multipart(compile_form(
                build_zip(&[("main.tex", b"x")]),
                "main.tex",
            ))
            .send()
            .await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = client
        .post(format!("{base}/compile"))
        .header("Authorization", format!("Bearer {SECRET}"))
        .multipart(compile_form(build_zip(&[("main.tex", b"x")]), "main.tex"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "queue_full");
}

#[tokio::test]
async fn compile_project_without_backend_is_a_fetch_failure() {
    let base = spawn_app(false, 1, 5).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/compile-project"))
        .header("Authorization", format!("Bearer {SECRET}"))
        .form(&[("project_id", "p1"), ("timeout", "30")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "project_fetch_failed");
}

#[tokio::test]
async fn cors_preflight_reflects_the_configured_origin() {
    let base = spawn_app(false, 1, 5).await;

    let response = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, format!("{base}/compile"))
        .header("Origin", ORIGIN)
        .header("Access-Control-Request-Method", "POST")
        .header("Access-Control-Request-Headers", "authorization")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some(ORIGIN)
    );
}
