use axum::{
    Json,
    extract::{Multipart, State},
    http::StatusCode,
    response::IntoResponse,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::AppState;

/// Forwards attachment blobs to the upstream object store. The blob is
/// held in memory and streamed upstream; nothing touches local disk.
#[derive(Clone)]
pub struct Uploader {
    client: reqwest::Client,
    upstream_url: String,
    preset: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamReply {
    secure_url: String,
    original_filename: String,
}

impl Uploader {
    pub fn new(upstream_url: String, preset: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            upstream_url,
            preset,
        }
    }

    /// Push the blob upstream tagged as a raw resource. Raw means no
    /// server-side image reprocessing, whatever the actual MIME type.
    async fn forward(&self, file_name: &str, data: Bytes) -> anyhow::Result<UploadResponse> {
        if self.upstream_url.is_empty() {
            anyhow::bail!("no upstream storage configured");
        }

        let size = data.len();
        let part = reqwest::multipart::Part::stream(reqwest::Body::from(data))
            .file_name(file_name.to_string());
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("resource_type", "raw")
            .text("folder", "chat_attachments");
        if let Some(preset) = &self.preset {
            form = form.text("upload_preset", preset.clone());
        }

        let response = self
            .client
            .post(&self.upstream_url)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("upstream storage returned {}", response.status());
        }
        let reply: UpstreamReply = response.json().await?;

        info!("uploaded {} ({} bytes)", reply.original_filename, size);
        Ok(UploadResponse {
            image_url: reply.secure_url,
            file_name: reply.original_filename,
        })
    }
}

type UploadError = (StatusCode, Json<serde_json::Value>);

fn error_body(status: StatusCode, message: &str) -> UploadError {
    (status, Json(serde_json::json!({ "error": message })))
}

/// POST /upload — single binary field named `image`.
/// 200 `{imageUrl, fileName}` on success, 400 when the field is
/// missing, 500 when upstream storage fails. A failed upload means the
/// message line was never sent; the client may retry.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, UploadError> {
    let mut file: Option<(String, Bytes)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!("bad multipart payload: {}", e);
                return Err(error_body(StatusCode::BAD_REQUEST, "invalid multipart payload"));
            }
        };

        if field.name() == Some("image") {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let data = field.bytes().await.map_err(|e| {
                warn!("failed to read upload body: {}", e);
                error_body(StatusCode::BAD_REQUEST, "invalid multipart payload")
            })?;
            file = Some((file_name, data));
            break;
        }
    }

    let Some((file_name, data)) = file else {
        return Err(error_body(StatusCode::BAD_REQUEST, "No file uploaded"));
    };

    match state.uploader.forward(&file_name, data).await {
        Ok(reply) => Ok(Json(reply)),
        Err(e) => {
            error!("Upload error: {}", e);
            Err(error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "file upload failed",
            ))
        }
    }
}
