//! Verdict-as-a-Service client.
//!
//! Many concurrent callers share one authenticated connection; replies are
//! matched to callers by request id. See [`Vaas`] for the persistent
//! connection client and [`VaasHttp`] for the stateless polling client.

pub mod auth;
pub mod context;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod hash;
pub mod http;
pub mod options;
pub mod transport;
pub mod upload;
pub mod vaas;
pub mod verdict;

pub use auth::{Authenticator, Grant, OidcAuthenticator, StaticToken};
pub use context::RequestContext;
pub use credentials::Credentials;
pub use engine::ConnectionState;
pub use error::{Result, VaasError};
pub use hash::Sha256;
pub use http::VaasHttp;
pub use options::{ConnectionOptions, VaasOptions};
pub use upload::{UploadBody, Uploader};
pub use vaas::Vaas;
pub use verdict::{VaasVerdict, Verdict};
