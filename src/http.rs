//! Stateless HTTP polling client (the later protocol generation).
//!
//! Reports are fetched with `GET .../report`; `202 Accepted` means "still
//! working, ask again" and `404` on a file report means the hash is unknown.
//! Every request carries a fresh bearer token from the authenticator.

use crate::auth::Authenticator;
use crate::context::RequestContext;
use crate::engine::protocol::ProblemDetails;
use crate::error::{Result, VaasError};
use crate::hash::{sha256_file, Sha256};
use crate::options::VaasOptions;
use crate::verdict::{VaasVerdict, Verdict};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use url::Url;

/// Production endpoint of the polling API
pub const DEFAULT_HTTP_URL: &str = "https://gateway.production.vaas.gdatasecurity.de";

/// Pause between two polls of a pending report
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const CLIENT_USER_AGENT: &str = concat!("Rust/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize)]
pub struct FileReport {
    pub sha256: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub detection: Option<String>,
    #[serde(default, rename = "mimetype")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
}

impl From<FileReport> for VaasVerdict {
    fn from(report: FileReport) -> Self {
        VaasVerdict {
            detection: report.detection,
            mime_type: report.mime_type,
            file_type: report.file_type,
            ..VaasVerdict::new(report.verdict, report.sha256)
        }
    }
}

#[derive(Deserialize)]
struct FileAnalysis {
    sha256: String,
}

#[derive(Deserialize)]
struct UrlAnalysis {
    id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UrlAnalysisRequest<'a> {
    url: &'a str,
    use_hash_lookup: bool,
}

pub struct VaasHttp {
    client: Client,
    base: Url,
    authenticator: Arc<dyn Authenticator>,
    options: VaasOptions,
    poll_interval: Duration,
}

impl VaasHttp {
    pub fn new(
        base_url: &str,
        authenticator: Arc<dyn Authenticator>,
        options: VaasOptions,
    ) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| VaasError::Config(format!("invalid base url {:?}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(VaasError::Config(format!(
                "{:?} cannot be used as a base url",
                base_url
            )));
        }
        Ok(Self {
            client: Client::new(),
            base,
            authenticator,
            options,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub async fn for_sha256(&self, sha256: &Sha256, ctx: &RequestContext) -> Result<VaasVerdict> {
        let report = ctx.run(self.poll_file_report(sha256)).await??;
        Ok(match report {
            Some(report) => report.into(),
            None => VaasVerdict::new(Verdict::Unknown, sha256.as_str()),
        })
    }

    /// Hash lookup first; upload only when the verdict is not actionable.
    /// A lookup rejected for the caller's own fault (credentials, bad
    /// request, deadline) is returned as-is; the upload would fail the same way.
    pub async fn for_file(&self, path: impl AsRef<Path>, ctx: &RequestContext) -> Result<VaasVerdict> {
        let path = path.as_ref();
        let sha256 = sha256_file(path).await?;
        match self.for_sha256(&sha256, ctx).await {
            Ok(verdict) if verdict.verdict != Verdict::Unknown => return Ok(verdict),
            Ok(_) => {}
            Err(
                e @ (VaasError::Server(_)
                | VaasError::ConnectionFailed(_)
                | VaasError::ConnectionLost(_)
                | VaasError::InvalidResponse(_)),
            ) => tracing::debug!(%sha256, "hash lookup failed, uploading: {}", e),
            Err(e) => return Err(e),
        }

        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        self.for_stream(file, len, ctx).await
    }

    /// Upload the content, then poll the report of the returned hash.
    pub async fn for_stream<R>(&self, reader: R, len: u64, ctx: &RequestContext) -> Result<VaasVerdict>
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        let mut url = self.endpoint(&["files"])?;
        url.query_pairs_mut()
            .append_pair("useHashLookup", bool_param(self.options.use_hash_lookup));

        let request = self
            .request(Method::POST, url)
            .await?
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, len)
            .body(Body::wrap_stream(ReaderStream::new(reader)));
        let response = ctx.run(request.send()).await??;
        if response.status() != StatusCode::CREATED {
            return Err(problem(response).await);
        }
        let analysis: FileAnalysis = decode(response).await?;
        let sha256: Sha256 = analysis.sha256.parse()?;
        tracing::debug!(%sha256, bytes = len, "file submitted");
        self.for_sha256(&sha256, ctx).await
    }

    pub async fn for_url(&self, url: &str, ctx: &RequestContext) -> Result<VaasVerdict> {
        Url::parse(url)
            .map_err(|e| VaasError::InvalidOperation(format!("invalid url {:?}: {}", url, e)))?;

        let request = self
            .request(Method::POST, self.endpoint(&["urls"])?)
            .await?
            .json(&UrlAnalysisRequest {
                url,
                use_hash_lookup: self.options.use_hash_lookup,
            });
        let response = ctx.run(request.send()).await??;
        if response.status() != StatusCode::CREATED {
            return Err(problem(response).await);
        }
        let analysis: UrlAnalysis = decode(response).await?;
        tracing::debug!(job = %analysis.id, "url submitted");

        let report = ctx.run(self.poll_url_report(&analysis.id)).await??;
        Ok(report.into())
    }

    async fn poll_file_report(&self, sha256: &Sha256) -> Result<Option<FileReport>> {
        let mut url = self.endpoint(&["files", sha256.as_str(), "report"])?;
        url.query_pairs_mut()
            .append_pair("useCache", bool_param(self.options.use_cache))
            .append_pair("useHashLookup", bool_param(self.options.use_hash_lookup));

        loop {
            let response = self.request(Method::GET, url.clone()).await?.send().await?;
            match response.status() {
                StatusCode::OK => return decode(response).await.map(Some),
                StatusCode::NOT_FOUND => return Ok(None),
                StatusCode::ACCEPTED => {
                    tracing::trace!(%sha256, "report pending");
                    tokio::time::sleep(self.poll_interval).await;
                }
                _ => return Err(problem(response).await),
            }
        }
    }

    async fn poll_url_report(&self, job: &str) -> Result<FileReport> {
        let url = self.endpoint(&["urls", job, "report"])?;
        loop {
            let response = self.request(Method::GET, url.clone()).await?.send().await?;
            match response.status() {
                StatusCode::OK => return decode(response).await,
                StatusCode::NOT_FOUND => {
                    return Err(VaasError::Client(format!("url job {} not found", job)))
                }
                StatusCode::ACCEPTED => {
                    tracing::trace!(%job, "url report pending");
                    tokio::time::sleep(self.poll_interval).await;
                }
                _ => return Err(problem(response).await),
            }
        }
    }

    async fn request(&self, method: Method, url: Url) -> Result<RequestBuilder> {
        let token = self.authenticator.get_token().await?;
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(token)
            .header(USER_AGENT, CLIENT_USER_AGENT))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| VaasError::Config(format!("{} cannot be used as a base url", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn bool_param(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| VaasError::InvalidResponse(e.to_string()))
}

/// Map an unexpected status to the error taxonomy, using the problem
/// details body when the server sent one.
async fn problem(response: Response) -> VaasError {
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        return VaasError::AuthenticationFailed(format!("HTTP error: {}", status));
    }
    match serde_json::from_slice::<ProblemDetails>(&body) {
        Ok(details) if !details.kind.is_empty() || !details.detail.is_empty() => {
            if details.kind == "VaasClientException" {
                VaasError::Client(details.detail)
            } else {
                VaasError::Server(details.detail)
            }
        }
        _ if status.is_client_error() => VaasError::Client(format!("HTTP error: {}", status)),
        _ => VaasError::Server(format!("HTTP error: {}", status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    fn client(base: &str) -> VaasHttp {
        VaasHttp::new(base, Arc::new(StaticToken("t".into())), VaasOptions::default()).unwrap()
    }

    #[test]
    fn test_endpoint_paths() {
        let http = client("https://vaas.example/api/");
        assert_eq!(
            http.endpoint(&["files", "abc", "report"]).unwrap().as_str(),
            "https://vaas.example/api/files/abc/report"
        );

        let http = client("https://vaas.example");
        assert_eq!(
            http.endpoint(&["urls"]).unwrap().as_str(),
            "https://vaas.example/urls"
        );
    }

    #[test]
    fn test_rejects_bad_base() {
        assert!(matches!(
            VaasHttp::new("mailto:x@y", Arc::new(StaticToken("t".into())), VaasOptions::default()),
            Err(VaasError::Config(_))
        ));
        assert!(VaasHttp::new("::", Arc::new(StaticToken("t".into())), VaasOptions::default()).is_err());
    }

    #[test]
    fn test_report_into_verdict() {
        let report: FileReport = serde_json::from_str(
            r#"{"sha256":"abc","verdict":"Pup","detection":"Adware","mimetype":"text/plain","file_type":"ASCII"}"#,
        )
        .unwrap();
        let verdict = VaasVerdict::from(report);
        assert_eq!(verdict.verdict, Verdict::Pup);
        assert_eq!(verdict.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(verdict.file_type.as_deref(), Some("ASCII"));
    }
}
