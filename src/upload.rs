//! Upload sub-protocol: PUT the artifact to the signed URL from an
//! `Unknown` verdict response.

use crate::context::RequestContext;
use crate::error::{Result, VaasError};
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

pub type UploadReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Artifact content with a known length.
pub enum UploadBody {
    Bytes(Bytes),
    Reader { reader: UploadReader, len: u64 },
}

impl UploadBody {
    pub fn reader<R>(reader: R, len: u64) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        UploadBody::Reader {
            reader: Box::new(reader),
            len,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            UploadBody::Bytes(bytes) => bytes.len() as u64,
            UploadBody::Reader { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_body(self) -> Body {
        match self {
            UploadBody::Bytes(bytes) => Body::from(bytes),
            UploadBody::Reader { reader, .. } => Body::wrap_stream(ReaderStream::new(reader)),
        }
    }
}

impl std::fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadBody::Bytes(bytes) => write!(f, "UploadBody::Bytes({} bytes)", bytes.len()),
            UploadBody::Reader { len, .. } => write!(f, "UploadBody::Reader({} bytes)", len),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Uploader {
    client: Client,
}

impl Uploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// One PUT of `body` to `url`. The upload token goes into the
    /// `Authorization` header as-is.
    pub async fn upload(
        &self,
        url: &str,
        token: &str,
        body: UploadBody,
        ctx: &RequestContext,
    ) -> Result<()> {
        let len = body.len();
        tracing::debug!(bytes = len, "uploading artifact");

        let request = self
            .client
            .put(url)
            .header(AUTHORIZATION, token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, len)
            .body(body.into_body());

        let response = ctx.run(request.send()).await??;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "upload rejected");
            return Err(VaasError::UploadFailed {
                status: status.as_u16(),
                message,
            });
        }
        tracing::debug!(status = status.as_u16(), "upload complete");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::put;
    use axum::Router;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Received {
        auth: Option<String>,
        length: Option<String>,
        body: Vec<u8>,
    }

    async fn serve(status: StatusCode) -> (String, Arc<Mutex<Received>>) {
        let received = Arc::new(Mutex::new(Received::default()));
        let app = Router::new()
            .route(
                "/upload",
                put(
                    move |State(received): State<Arc<Mutex<Received>>>,
                          headers: HeaderMap,
                          body: axum::body::Bytes| async move {
                        let mut r = received.lock().unwrap();
                        r.auth = headers
                            .get("authorization")
                            .map(|v| v.to_str().unwrap().to_string());
                        r.length = headers
                            .get("content-length")
                            .map(|v| v.to_str().unwrap().to_string());
                        r.body = body.to_vec();
                        (status, "denied")
                    },
                ),
            )
            .with_state(received.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}/upload", addr), received)
    }

    #[tokio::test]
    async fn test_upload_stream_with_token() {
        let (url, received) = serve(StatusCode::OK).await;
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        let body = UploadBody::reader(std::io::Cursor::new(b"artifact".to_vec()), 8);

        Uploader::new()
            .upload(&url, "upload-token", body, &ctx)
            .await
            .unwrap();

        let r = received.lock().unwrap();
        assert_eq!(r.auth.as_deref(), Some("upload-token"));
        assert_eq!(r.length.as_deref(), Some("8"));
        assert_eq!(r.body, b"artifact");
    }

    #[tokio::test]
    async fn test_non_success_status_fails() {
        let (url, _received) = serve(StatusCode::FORBIDDEN).await;
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));

        let err = Uploader::new()
            .upload(&url, "t", UploadBody::Bytes(Bytes::from_static(b"x")), &ctx)
            .await
            .unwrap_err();
        match err {
            VaasError::UploadFailed { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "denied");
            }
            other => panic!("expected upload failure, got {:?}", other),
        }
    }
}
