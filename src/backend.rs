//! Metadata/storage backend client (Convex HTTP function API).
//!
//! The service depends on four function shapes: project fetch, cached
//! compilation lookup, upload URL generation, and compilation record save.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::project::Project;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{function} failed: {message}")]
    Function { function: String, message: String },

    #[error("unexpected response from {function}: {message}")]
    Decode { function: String, message: String },
}

/// Function-call envelope returned by the backend.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionResponse {
    status: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error_message: Option<String>,
}

pub struct ConvexBackend {
    client: reqwest::Client,
    base_url: String,
    deploy_key: String,
}

impl ConvexBackend {
    pub fn new(base_url: String, deploy_key: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url,
            deploy_key,
        }
    }

    /// Shared client, reused for blob downloads during materialization.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn call(
        &self,
        endpoint: &str,
        function: &str,
        args: Value,
    ) -> Result<Value, BackendError> {
        let url = format!("{}/api/{endpoint}", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Convex {}", self.deploy_key),
            )
            .json(&json!({"path": function, "args": args, "format": "json"}))
            .send()
            .await?
            .error_for_status()?;
        let parsed: FunctionResponse = response.json().await?;
        if parsed.status != "success" {
            return Err(BackendError::Function {
                function: function.to_string(),
                message: parsed
                    .error_message
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        Ok(parsed.value)
    }

    pub async fn get_project_with_files(&self, project_id: &str) -> Result<Project, BackendError> {
        let value = self
            .call(
                "query",
                "service:getProjectWithFiles",
                json!({"projectId": project_id}),
            )
            .await?;
        serde_json::from_value(value).map_err(|e| BackendError::Decode {
            function: "service:getProjectWithFiles".to_string(),
            message: e.to_string(),
        })
    }

    /// Cached compilation lookup. `Ok(Some(url))` only for a record carrying
    /// a non-empty document URL.
    pub async fn get_compilation_by_hash(
        &self,
        project_id: &str,
        zip_hash: &str,
    ) -> Result<Option<String>, BackendError> {
        let value = self
            .call(
                "query",
                "service:getCompilationByHash",
                json!({"projectId": project_id, "zipHash": zip_hash}),
            )
            .await?;
        Ok(value
            .get("pdfUrl")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .map(String::from))
    }

    pub async fn fetch_pdf(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Upload a rendered document and record it under the project hash.
    pub async fn store_compilation(
        &self,
        project_id: &str,
        zip_hash: &str,
        pdf: &[u8],
    ) -> Result<(), BackendError> {
        let upload_url = self
            .call("mutation", "service:generateUploadUrl", json!({}))
            .await?;
        let upload_url = upload_url.as_str().ok_or_else(|| BackendError::Decode {
            function: "service:generateUploadUrl".to_string(),
            message: "expected a URL string".to_string(),
        })?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct UploadResponse {
            storage_id: String,
        }
        let upload: UploadResponse = self
            .client
            .post(upload_url)
            .header(reqwest::header::CONTENT_TYPE, "application/pdf")
            .body(pdf.to_vec())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.call(
            "mutation",
            "service:saveCompilation",
            json!({
                "projectId": project_id,
                "zipHash": zip_hash,
                "storageId": upload.storage_id,
            }),
        )
        .await?;
        Ok(())
    }
}
