//! Wire messages for the persistent-connection protocol.
//!
//! Every frame is one JSON object with a `kind` discriminator.
//! Client -> server: AuthRequest, VerdictRequest, VerdictRequestForUrl,
//! VerdictRequestForStream. Server -> client: AuthResponse, VerdictResponse, Error.

use crate::error::{Result, VaasError};
use crate::hash::Sha256;
use crate::options::VaasOptions;
use crate::verdict::Verdict;
use serde::{Deserialize, Serialize};

// =============================================================================
// Message Kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Kind {
    AuthRequest,
    AuthResponse,
    VerdictRequest,
    VerdictRequestForUrl,
    VerdictRequestForStream,
    VerdictResponse,
    Error,
}

impl Kind {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "AuthRequest" => Some(Self::AuthRequest),
            "AuthResponse" => Some(Self::AuthResponse),
            "VerdictRequest" => Some(Self::VerdictRequest),
            "VerdictRequestForUrl" => Some(Self::VerdictRequestForUrl),
            "VerdictRequestForStream" => Some(Self::VerdictRequestForStream),
            "VerdictResponse" => Some(Self::VerdictResponse),
            "Error" => Some(Self::Error),
            _ => None,
        }
    }
}

// =============================================================================
// AUTH
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest {
    pub kind: Kind,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AuthRequest {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            kind: Kind::AuthRequest,
            token: token.into(),
            session_id: None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        encode_json(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub text: String,
}

// =============================================================================
// VERDICT REQUEST
// =============================================================================

/// What a verdict request asks about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Sha256(Sha256),
    Url(String),
    /// Content follows through the upload sub-protocol
    Stream,
}

impl Target {
    pub fn kind(&self) -> Kind {
        match self {
            Target::Sha256(_) => Kind::VerdictRequest,
            Target::Url(_) => Kind::VerdictRequestForUrl,
            Target::Stream => Kind::VerdictRequestForStream,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerdictRequest {
    /// Client-generated, never reused
    pub guid: String,
    pub session_id: String,
    pub target: Target,
    pub use_cache: bool,
    pub use_hash_lookup: bool,
}

#[derive(Serialize)]
struct WireVerdictRequest<'a> {
    kind: Kind,
    guid: &'a str,
    session_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha256: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    use_cache: bool,
    use_hash_lookup: bool,
}

impl VerdictRequest {
    pub fn new(session_id: impl Into<String>, target: Target, options: &VaasOptions) -> Self {
        Self {
            guid: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            target,
            use_cache: options.use_cache,
            use_hash_lookup: options.use_hash_lookup,
        }
    }

    pub fn encode(&self) -> Result<String> {
        let (sha256, url) = match &self.target {
            Target::Sha256(sha) => (Some(sha.as_str()), None),
            Target::Url(url) => (None, Some(url.as_str())),
            Target::Stream => (None, None),
        };
        encode_json(&WireVerdictRequest {
            kind: self.target.kind(),
            guid: &self.guid,
            session_id: &self.session_id,
            sha256,
            url,
            use_cache: self.use_cache,
            use_hash_lookup: self.use_hash_lookup,
        })
    }
}

// =============================================================================
// VERDICT RESPONSE
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VerdictResponse {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub verdict: String,
    /// Signed upload URL, present when the server wants the content
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub upload_token: Option<String>,
    #[serde(default)]
    pub detection: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl VerdictResponse {
    /// Responses without a request id or a recognised verdict are discarded.
    pub fn is_valid(&self) -> bool {
        !self.guid.is_empty() && self.verdict.parse::<Verdict>().is_ok()
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict.parse().unwrap_or(Verdict::Error)
    }

    /// Upload URL and token, when this is an `Unknown` asking for content.
    pub fn upload_credentials(&self) -> Option<(&str, &str)> {
        if self.verdict() != Verdict::Unknown {
            return None;
        }
        match (self.url.as_deref(), self.upload_token.as_deref()) {
            (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => {
                Some((url, token))
            }
            _ => None,
        }
    }
}

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProblemDetails {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorMessage {
    #[serde(default, rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub problem_details: Option<ProblemDetails>,
}

impl ErrorMessage {
    /// Client-side fault reported by the server (bad request content).
    pub fn is_client_error(&self) -> bool {
        self.problem_details
            .as_ref()
            .map(|p| p.kind == "VaasClientException")
            .unwrap_or(false)
    }

    pub fn message(&self) -> String {
        if let Some(details) = &self.problem_details {
            if !details.detail.is_empty() {
                return details.detail.clone();
            }
        }
        if !self.text.is_empty() {
            return self.text.clone();
        }
        self.error_type.clone()
    }
}

// =============================================================================
// Inbound frame classification
// =============================================================================

#[derive(Debug, Clone)]
pub enum ServerFrame {
    Auth(AuthResponse),
    Verdict(VerdictResponse),
    Error(ErrorMessage),
    /// Well-formed frame of a kind this client does not handle
    Other(String),
}

#[derive(Deserialize)]
struct Envelope {
    kind: String,
}

impl ServerFrame {
    /// Decode one text frame. Malformed JSON or a missing `kind` yields
    /// `InvalidResponse`.
    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| VaasError::InvalidResponse(format!("undecodable frame: {}", e)))?;

        let frame = match Kind::from_name(&envelope.kind) {
            Some(Kind::AuthResponse) => ServerFrame::Auth(decode_json(text)?),
            Some(Kind::VerdictResponse) => ServerFrame::Verdict(decode_json(text)?),
            Some(Kind::Error) => ServerFrame::Error(decode_json(text)?),
            _ => ServerFrame::Other(envelope.kind),
        };
        Ok(frame)
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| VaasError::InvalidOperation(format!("failed to encode frame: {}", e)))
}

fn decode_json<'a, T: Deserialize<'a>>(text: &'a str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| VaasError::InvalidResponse(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
