//! HTTP surface for the extraction pipeline.
//!
//! This module exposes a compact Axum router with a handful of endpoints:
//!
//! - `POST /extract` – Extract, chunk and embed one uploaded document. Accepts either a
//!   `multipart/form-data` body with a `file` part (and an optional `language` part) or the raw
//!   document bytes with `?language=`. Returns the full extraction result.
//! - `GET /` – Service status and endpoint list.
//! - `GET /metrics` – Pipeline counters.
//! - `GET /commands` – Machine-readable command catalog for quick discovery by tools/hosts.
//!
//! Pipeline errors map to status codes by kind: unsupported formats are `415`, OCR failing on
//! every page is `422`, embedding failures are `500`.

use crate::metrics::MetricsSnapshot;
use crate::processing::{DocumentProcessor, DocumentRequest, ExtractionResult, PipelineError};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Query, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Build the HTTP router exposing the extraction API surface.
pub fn create_router<S>(service: Arc<S>, max_upload_bytes: usize) -> Router
where
    S: DocumentProcessor + 'static,
{
    Router::new()
        .route("/", get(get_status))
        .route("/extract", post(extract_document::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/commands", get(get_commands))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(service)
}

/// Query parameters accepted by `POST /extract`.
#[derive(Debug, Default, Deserialize)]
struct ExtractParams {
    /// OCR language hint (`eng`, `eng+deu`).
    #[serde(default)]
    language: Option<String>,
}

/// Extract a document uploaded as multipart form data or as a raw body.
async fn extract_document<S>(
    State(service): State<Arc<S>>,
    Query(params): Query<ExtractParams>,
    request: Request,
) -> Result<Json<ExtractionResult>, AppError>
where
    S: DocumentProcessor,
{
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let upload = match content_type.as_deref() {
        Some(value) if value.starts_with("multipart/form-data") => {
            read_multipart(request, params.language).await?
        }
        _ => {
            let bytes = Bytes::from_request(request, &())
                .await
                .map_err(|rejection| AppError::upload(rejection.status(), rejection.body_text()))?;
            if bytes.is_empty() {
                None
            } else {
                Some(DocumentRequest {
                    bytes: bytes.to_vec(),
                    content_type,
                    language: params.language,
                    file_name: None,
                })
            }
        }
    };
    let document = upload.ok_or_else(AppError::missing_upload)?;

    let result = service.process_document(document).await?;
    tracing::info!(
        status = ?result.status,
        pages = result.page_count,
        chunks = result.chunks.len(),
        "Extract request completed"
    );
    Ok(Json(result))
}

async fn read_multipart(
    request: Request,
    query_language: Option<String>,
) -> Result<Option<DocumentRequest>, AppError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|rejection| AppError::upload(rejection.status(), rejection.body_text()))?;

    let mut document: Option<DocumentRequest> = None;
    let mut language = query_language;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| AppError::upload(error.status(), error.body_text()))?
    {
        match field.name() {
            Some("file") => {
                let content_type = field.content_type().map(str::to_string);
                let file_name = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|error| AppError::upload(error.status(), error.body_text()))?;
                document = Some(DocumentRequest {
                    bytes: bytes.to_vec(),
                    content_type,
                    language: None,
                    file_name,
                });
            }
            Some("language") => {
                let value = field
                    .text()
                    .await
                    .map_err(|error| AppError::upload(error.status(), error.body_text()))?;
                language = Some(value);
            }
            other => {
                tracing::debug!(field = ?other, "Ignoring unknown multipart field");
            }
        }
    }

    Ok(document.map(|document| DocumentRequest {
        language,
        ..document
    }))
}

/// Response body for `GET /`.
#[derive(Serialize)]
struct StatusResponse {
    service: &'static str,
    version: &'static str,
    status: &'static str,
    endpoints: Vec<&'static str>,
}

/// Report service status.
async fn get_status() -> Json<StatusResponse> {
    Json(StatusResponse {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        status: "ok",
        endpoints: vec!["POST /extract", "GET /metrics", "GET /commands"],
    })
}

/// Return a metrics snapshot with document, page and chunk counters.
async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<MetricsSnapshot>
where
    S: DocumentProcessor,
{
    Json(service.metrics_snapshot())
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery/UX in hosts and tools.
async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "extract",
                method: "POST",
                path: "/extract",
                description: "Extract text from a PDF or image (native text layer first, OCR fallback per page), chunk it and embed every chunk. Send multipart form data with a `file` part and optional `language` part, or the raw bytes with `?language=`.",
                request_example: Some(json!({
                    "file": "<binary PDF or image>",
                    "language": "eng+deu"
                })),
            },
            CommandDescriptor {
                name: "status",
                method: "GET",
                path: "/",
                description: "Return service name, version and the available endpoints.",
                request_example: None,
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return document, page and chunk counters useful for observability dashboards.",
                request_example: None,
            },
        ],
    })
}

enum AppError {
    Pipeline(PipelineError),
    Upload { status: StatusCode, message: String },
}

impl AppError {
    fn upload(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Upload {
            status,
            message: message.into(),
        }
    }

    fn missing_upload() -> Self {
        Self::upload(
            StatusCode::BAD_REQUEST,
            "missing document upload: send a `file` part or a non-empty body",
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            Self::Pipeline(error) => {
                let status = match &error {
                    PipelineError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    PipelineError::OcrEngine { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    PipelineError::EmbeddingModel(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, error.kind(), error.to_string())
            }
            Self::Upload { status, message } => {
                let kind = match status {
                    StatusCode::BAD_REQUEST => "missing_upload",
                    StatusCode::PAYLOAD_TOO_LARGE => "payload_too_large",
                    _ => "invalid_upload",
                };
                (status, kind, message)
            }
        };
        (status, Json(json!({ "error": message, "kind": kind }))).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(inner: PipelineError) -> Self {
        Self::Pipeline(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{create_router, get_commands};
    use crate::extraction::{DetectedFormat, UnsupportedFormat};
    use crate::metrics::MetricsSnapshot;
    use crate::processing::{
        DocumentProcessor, DocumentRequest, DocumentStatus, ExtractionResult, FormatInfo,
        PipelineError,
    };
    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
    };
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    const LIMIT: usize = 1024;

    #[tokio::test]
    async fn commands_catalog_exposes_extract_endpoint() {
        let response = get_commands().await;
        let commands = response.0.commands;
        let extract = commands
            .iter()
            .find(|cmd| cmd.name == "extract")
            .expect("extract command present");

        assert_eq!(extract.method, "POST");
        assert_eq!(extract.path, "/extract");
        assert!(extract.description.to_lowercase().contains("ocr"));
        assert!(commands.len() >= 3);
    }

    #[tokio::test]
    async fn raw_body_upload_uses_query_language() {
        let service = Arc::new(StubProcessor::default());
        let app = create_router(service.clone(), LIMIT);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/extract?language=deu")
                    .header("content-type", "application/pdf")
                    .body(Body::from("%PDF-1.7 body"))
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "complete");
        assert_eq!(json["format"]["kind"], "pdf");

        let calls = service.recorded_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].bytes, b"%PDF-1.7 body");
        assert_eq!(calls[0].language.as_deref(), Some("deu"));
        assert_eq!(calls[0].content_type.as_deref(), Some("application/pdf"));
    }

    #[tokio::test]
    async fn multipart_upload_reads_file_and_language_parts() {
        let service = Arc::new(StubProcessor::default());
        let app = create_router(service.clone(), LIMIT);
        let body = concat!(
            "--XBOUNDARY\r\n",
            "Content-Disposition: form-data; name=\"language\"\r\n\r\n",
            "fra\r\n",
            "--XBOUNDARY\r\n",
            "Content-Disposition: form-data; name=\"file\"; filename=\"scan.png\"\r\n",
            "Content-Type: image/png\r\n\r\n",
            "PNGDATA\r\n",
            "--XBOUNDARY--\r\n",
        );

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/extract")
                    .header("content-type", "multipart/form-data; boundary=XBOUNDARY")
                    .body(Body::from(body))
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        let calls = service.recorded_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].bytes, b"PNGDATA");
        assert_eq!(calls[0].language.as_deref(), Some("fra"));
        assert_eq!(calls[0].content_type.as_deref(), Some("image/png"));
        assert_eq!(calls[0].file_name.as_deref(), Some("scan.png"));
    }

    #[tokio::test]
    async fn missing_upload_is_bad_request() {
        let service = Arc::new(StubProcessor::default());
        let app = create_router(service.clone(), LIMIT);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/extract")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["kind"], "missing_upload");
        assert!(service.recorded_calls().await.is_empty());
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let service = Arc::new(StubProcessor::default());
        let app = create_router(service.clone(), 16);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/extract")
                    .header("content-type", "application/pdf")
                    .body(Body::from(vec![b'x'; 64]))
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(service.recorded_calls().await.is_empty());
    }

    #[tokio::test]
    async fn unsupported_format_maps_to_415() {
        let service = Arc::new(StubProcessor {
            reject: true,
            ..StubProcessor::default()
        });
        let app = create_router(service, LIMIT);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/extract")
                    .body(Body::from("plain text"))
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let json = json_body(response).await;
        assert_eq!(json["kind"], "unsupported_format");
        assert!(json["error"].as_str().unwrap().contains("no signature"));
    }

    #[tokio::test]
    async fn metrics_route_returns_snapshot() {
        let app = create_router(Arc::new(StubProcessor::default()), LIMIT);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["documents_processed"], 7);
        assert_eq!(json["pages_ocr"], 0);
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&body).expect("json body")
    }

    #[derive(Default)]
    struct StubProcessor {
        calls: Mutex<Vec<DocumentRequest>>,
        reject: bool,
    }

    impl StubProcessor {
        async fn recorded_calls(&self) -> Vec<DocumentRequest> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl DocumentProcessor for StubProcessor {
        async fn process_document(
            &self,
            request: DocumentRequest,
        ) -> Result<ExtractionResult, PipelineError> {
            self.calls.lock().await.push(request);
            if self.reject {
                return Err(UnsupportedFormat::new("no signature found").into());
            }
            Ok(ExtractionResult {
                document_id: "0".repeat(64),
                format: FormatInfo::from(DetectedFormat::Pdf),
                mime_type: "application/pdf",
                page_count: 0,
                language: "eng".into(),
                status: DocumentStatus::Complete,
                pages: Vec::new(),
                chunks: Vec::new(),
                embeddings: Vec::new(),
                embedding_model: "stub".into(),
                embedding_dimension: 0,
                warnings: Vec::new(),
                processed_at: "1970-01-01T00:00:00Z".into(),
            })
        }

        fn metrics_snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot {
                documents_processed: 7,
                ..MetricsSnapshot::default()
            }
        }
    }
}
