//! ConvexBackend tests against a mock function endpoint.

use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use texpress::backend::ConvexBackend;

async fn mock_query(Json(body): Json<Value>) -> Json<Value> {
    match body["path"].as_str().unwrap_or_default() {
        "service:getProjectWithFiles" => {
            if body["args"]["projectId"] == "p1" {
                Json(json!({
                    "status": "success",
                    "value": {
                        "entrypoint": "main.tex",
                        "compiler": "xelatex",
                        "haltOnError": true,
                        "files": [
                            {"name": "main.tex", "content": "hello"},
                            {"name": "logo.png", "storageUrl": "https://blobs.example.com/1"},
                        ],
                    },
                }))
            } else {
                Json(json!({"status": "error", "errorMessage": "project not found"}))
            }
        }
        "service:getCompilationByHash" => {
            if body["args"]["zipHash"] == "cached-hash" {
                Json(json!({
                    "status": "success",
                    "value": {"pdfUrl": "https://blobs.example.com/pdf"},
                }))
            } else {
                Json(json!({"status": "success", "value": null}))
            }
        }
        _ => Json(json!({"status": "error", "errorMessage": "unknown function"})),
    }
}

async fn spawn_mock_backend() -> String {
    let app = Router::new().route("/api/query", post(mock_query));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn project_descriptor_decodes_from_the_function_envelope() {
    let backend = ConvexBackend::new(spawn_mock_backend().await, "deploy-key".to_string());

    let project = backend.get_project_with_files("p1").await.unwrap();
    assert_eq!(project.entrypoint, "main.tex");
    assert_eq!(project.compiler, "xelatex");
    assert!(project.halt_on_error);
    assert_eq!(project.files.len(), 2);
    assert_eq!(project.files[0].content.as_deref(), Some("hello"));
    assert_eq!(
        project.files[1].storage_url.as_deref(),
        Some("https://blobs.example.com/1")
    );
}

#[tokio::test]
async fn function_errors_surface_as_backend_errors() {
    let backend = ConvexBackend::new(spawn_mock_backend().await, "deploy-key".to_string());

    let err = backend.get_project_with_files("missing").await.unwrap_err();
    assert!(err.to_string().contains("project not found"));
}

#[tokio::test]
async fn cache_lookup_distinguishes_hit_and_miss() {
    let backend = ConvexBackend::new(spawn_mock_backend().await, "deploy-key".to_string());

    let hit = backend
        .get_compilation_by_hash("p1", "cached-hash")
        .await
        .unwrap();
    assert_eq!(hit.as_deref(), Some("https://blobs.example.com/pdf"));

    let miss = backend
        .get_compilation_by_hash("p1", "other-hash")
        .await
        .unwrap();
    assert!(miss.is_none());
}
