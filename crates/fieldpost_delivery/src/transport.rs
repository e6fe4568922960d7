use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fieldpost_contract::{fields, ErrorBody, FailureReason, UploadMetadata, UploadResponse};
use fieldpost_contract::{HEALTH_LIVE_PATH, UPLOAD_PATH};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

/// One file plus its metadata, ready to go on the wire.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub metadata: UploadMetadata,
    pub file_name: String,
    pub declared_mime: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub ids: Vec<i64>,
    pub failed: u32,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("server responded {status}")]
    Status {
        status: StatusCode,
        code: Option<String>,
    },
    #[error("request timed out")]
    Timeout,
    #[error("network failure: {0}")]
    Network(String),
}

impl TransportError {
    pub fn classify(&self) -> FailureReason {
        match self {
            TransportError::Status { status, .. } => FailureReason::from_status(*status),
            TransportError::Timeout | TransportError::Network(_) => FailureReason::NetworkError,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Status { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// The ingestion endpoint as seen from the device.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn upload(&self, request: UploadRequest, token: &str)
        -> Result<UploadReceipt, TransportError>;

    /// Cheap reachability check used to drive the connectivity signal.
    async fn probe(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy)]
pub struct TransportTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpUploadTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUploadTransport {
    pub fn new(base_url: &str, timeouts: TransportTimeouts) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.request)
            .build()
            .context("build upload http client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn build_form(request: UploadRequest) -> Result<Form, TransportError> {
    // The declared type is advisory; anything unparseable goes out as opaque bytes.
    let declared = if request.declared_mime.parse::<mime::Mime>().is_ok() {
        request.declared_mime
    } else {
        mime::APPLICATION_OCTET_STREAM.to_string()
    };

    let part = Part::bytes(request.content)
        .file_name(request.file_name)
        .mime_str(&declared)?;

    let mut form = Form::new();
    for (name, value) in request.metadata.form_fields() {
        form = form.text(name, value);
    }
    Ok(form.part(fields::FILE, part))
}

#[async_trait]
impl UploadTransport for HttpUploadTransport {
    async fn upload(
        &self,
        request: UploadRequest,
        token: &str,
    ) -> Result<UploadReceipt, TransportError> {
        let form = build_form(request)?;
        let response = self
            .client
            .post(self.url(UPLOAD_PATH))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let code = response.json::<ErrorBody>().await.ok().map(|body| body.error);
            debug!(status = %status, code = ?code, "upload rejected");
            return Err(TransportError::Status { status, code });
        }

        // A 2xx means the server stored the file; an unreadable body must not
        // turn that into a retry.
        match response.json::<UploadResponse>().await {
            Ok(body) => Ok(UploadReceipt {
                ids: body.ids,
                failed: body.failed,
            }),
            Err(err) => {
                warn!(status = %status, error = %err, "upload accepted with unreadable body");
                Ok(UploadReceipt {
                    ids: Vec::new(),
                    failed: 0,
                })
            }
        }
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let response = self.client.get(self.url(HEALTH_LIVE_PATH)).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status { status, code: None })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_classify_by_code() {
        let err = TransportError::Status {
            status: StatusCode::BAD_GATEWAY,
            code: None,
        };
        assert_eq!(err.classify(), FailureReason::Http(502));
        assert!(!err.is_unauthorized());
    }

    #[test]
    fn timeouts_are_network_errors() {
        assert_eq!(TransportError::Timeout.classify(), FailureReason::NetworkError);
        assert_eq!(
            TransportError::Network("connection reset".to_string()).classify(),
            FailureReason::NetworkError
        );
    }

    #[test]
    fn unauthorized_is_detected() {
        let err = TransportError::Status {
            status: StatusCode::UNAUTHORIZED,
            code: Some("invalid_or_missing_bearer_token".to_string()),
        };
        assert!(err.is_unauthorized());
    }

    #[test]
    fn base_url_is_normalised() {
        let transport =
            HttpUploadTransport::new("http://127.0.0.1:8080/", TransportTimeouts::default())
                .expect("client");
        assert_eq!(transport.url(UPLOAD_PATH), "http://127.0.0.1:8080/v1/uploads");
    }
}
