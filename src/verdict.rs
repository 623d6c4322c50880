//! Verdict classification and the caller-facing result type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Clean,
    Malicious,
    Pup,
    Unknown,
    /// Client-side failure sentinel
    Error,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Clean => "Clean",
            Verdict::Malicious => "Malicious",
            Verdict::Pup => "Pup",
            Verdict::Unknown => "Unknown",
            Verdict::Error => "Error",
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Clean" => Ok(Verdict::Clean),
            "Malicious" => Ok(Verdict::Malicious),
            "Pup" => Ok(Verdict::Pup),
            "Unknown" => Ok(Verdict::Unknown),
            "Error" => Ok(Verdict::Error),
            other => Err(format!("unknown verdict {:?}", other)),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one verdict call. Never mutated after it is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaasVerdict {
    pub verdict: Verdict,

    /// Hash of the artifact, or the echoed target when the server sent none
    pub sha256: String,

    pub error_message: Option<String>,
    pub detection: Option<String>,
    pub mime_type: Option<String>,
    pub file_type: Option<String>,
}

impl VaasVerdict {
    pub fn new(verdict: Verdict, sha256: impl Into<String>) -> Self {
        Self {
            verdict,
            sha256: sha256.into(),
            error_message: None,
            detection: None,
            mime_type: None,
            file_type: None,
        }
    }

    /// `Error` entry used for a failed element of a list call.
    pub fn error(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::new(Verdict::Error, target)
        }
    }

    pub fn is_malicious(&self) -> bool {
        self.verdict == Verdict::Malicious
    }
}
