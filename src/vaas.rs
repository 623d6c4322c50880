//! Verdict engine: the public surface of the persistent-connection client.
//!
//! Every call registers a correlation entry, enqueues its request on the
//! current session and waits for the matching reply. `Unknown` verdicts
//! that come with upload credentials are answered by uploading the content
//! and waiting again on the same request id.

use crate::auth::{Authenticator, OidcAuthenticator};
use crate::context::RequestContext;
use crate::credentials::Credentials;
use crate::engine::channel::{ConnectionState, Link, Reply, Session};
use crate::engine::correlation::{CorrelationTable, ReplySlot};
use crate::engine::protocol::{Target, VerdictRequest, VerdictResponse};
use crate::engine::supervisor::Supervisor;
use crate::error::{Result, VaasError};
use crate::hash::{sha256_bytes, sha256_file, Sha256};
use crate::options::{ConnectionOptions, VaasOptions};
use crate::transport::{Connector, WebSocketConnector};
use crate::upload::{UploadBody, Uploader};
use crate::verdict::VaasVerdict;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, SeekFrom};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

enum Lifecycle {
    Idle,
    Running(JoinHandle<()>),
    Closed,
}

struct Inner {
    supervisor: Arc<Supervisor>,
    link: watch::Receiver<Link>,
    table: Arc<CorrelationTable>,
    options: VaasOptions,
    uploader: Uploader,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone: let the supervisor drain and exit
        self.shutdown.cancel();
    }
}

/// Verdict client over one multiplexed connection. Cheap to clone; all
/// clones share the connection.
#[derive(Clone)]
pub struct Vaas {
    inner: Arc<Inner>,
}

impl Vaas {
    pub fn new(
        connector: Arc<dyn Connector>,
        authenticator: Arc<dyn Authenticator>,
        options: VaasOptions,
        connection: ConnectionOptions,
    ) -> Result<Self> {
        connection.validate()?;
        let table = Arc::new(CorrelationTable::new());
        let shutdown = CancellationToken::new();
        let supervisor = Arc::new(Supervisor::new(
            connector,
            authenticator,
            table.clone(),
            connection,
            shutdown.clone(),
        ));
        Ok(Self {
            inner: Arc::new(Inner {
                link: supervisor.subscribe(),
                supervisor,
                table,
                options,
                uploader: Uploader::new(),
                lifecycle: Mutex::new(Lifecycle::Idle),
                shutdown,
            }),
        })
    }

    /// WebSocket client against the endpoint and OAuth grant in `credentials`.
    pub fn from_credentials(
        credentials: &Credentials,
        options: VaasOptions,
        connection: ConnectionOptions,
    ) -> Result<Self> {
        let authenticator = OidcAuthenticator::new(credentials.grant()?, credentials.token_url())?;
        Self::new(
            Arc::new(WebSocketConnector::new(credentials.vaas_url())),
            Arc::new(authenticator),
            options,
            connection,
        )
    }

    /// Replace the HTTP client used for uploads.
    pub fn with_uploader(self, uploader: Uploader) -> Result<Self> {
        let mut inner = Arc::try_unwrap(self.inner).map_err(|_| {
            VaasError::InvalidOperation("uploader must be set before the client is shared".into())
        })?;
        inner.uploader = uploader;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Open and authenticate the connection. Errors from this first attempt
    /// are returned as-is; later losses are recovered in the background.
    pub async fn connect(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Running(_) => {
                return Err(VaasError::InvalidOperation("already connected".into()))
            }
            Lifecycle::Closed => return Err(VaasError::InvalidOperation("client is closed".into())),
            Lifecycle::Idle => {}
        }

        let established = self.inner.supervisor.establish().await?;
        let supervisor = self.inner.supervisor.clone();
        *lifecycle = Lifecycle::Running(tokio::spawn(supervisor.run(established)));
        Ok(())
    }

    /// Drain in-flight requests and close the connection. Safe to call more
    /// than once.
    pub async fn close(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            Lifecycle::Running(handle) => {
                self.inner.shutdown.cancel();
                if let Err(e) = handle.await {
                    tracing::error!("supervisor task failed: {}", e);
                }
            }
            Lifecycle::Idle => {
                self.inner.shutdown.cancel();
                self.inner.supervisor.close_idle();
            }
            Lifecycle::Closed => tracing::debug!("close called on a closed client"),
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.borrow().state
    }

    /// Session id of the current connection, if one is ready.
    pub fn session_id(&self) -> Option<String> {
        self.inner
            .link
            .borrow()
            .session
            .as_ref()
            .map(|session| session.id.clone())
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.table.len()
    }

    // =========================================================================
    // Verdict calls
    // =========================================================================

    pub async fn for_sha256(&self, sha256: &Sha256, ctx: &RequestContext) -> Result<VaasVerdict> {
        let (_pending, response) = self.submit(Target::Sha256(sha256.clone()), ctx).await?;
        Ok(into_verdict(response, sha256.as_str()))
    }

    pub async fn for_url(&self, url: &str, ctx: &RequestContext) -> Result<VaasVerdict> {
        url::Url::parse(url)
            .map_err(|e| VaasError::InvalidOperation(format!("invalid url {:?}: {}", url, e)))?;
        let (_pending, response) = self.submit(Target::Url(url.to_string()), ctx).await?;
        Ok(into_verdict(response, url))
    }

    /// Hash `path`; upload it when the server has not seen it before.
    pub async fn for_file(&self, path: impl AsRef<Path>, ctx: &RequestContext) -> Result<VaasVerdict> {
        let path = path.as_ref();
        let sha256 = sha256_file(path).await?;
        // Opened up front: nothing may await between the first reply and rearm
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        tracing::debug!(path = %path.display(), %sha256, "requesting file verdict");

        let (pending, response) = self.submit(Target::Sha256(sha256.clone()), ctx).await?;
        if response.upload_credentials().is_none() {
            return Ok(into_verdict(response, sha256.as_str()));
        }
        self.upload_and_wait(pending, response, UploadBody::reader(file, len), sha256.as_str(), ctx)
            .await
    }

    pub async fn for_file_in_memory(
        &self,
        data: impl Into<Bytes>,
        ctx: &RequestContext,
    ) -> Result<VaasVerdict> {
        let data = data.into();
        let sha256 = sha256_bytes(&data);

        let (pending, response) = self.submit(Target::Sha256(sha256.clone()), ctx).await?;
        if response.upload_credentials().is_none() {
            return Ok(into_verdict(response, sha256.as_str()));
        }
        self.upload_and_wait(pending, response, UploadBody::Bytes(data), sha256.as_str(), ctx)
            .await
    }

    /// Verdict for content that is uploaded unconditionally. `len` is
    /// required for the upload; without it the call fails before anything
    /// is sent.
    pub async fn for_stream<R>(
        &self,
        reader: R,
        len: Option<u64>,
        ctx: &RequestContext,
    ) -> Result<VaasVerdict>
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        let len = len.ok_or(VaasError::UnsupportedReader)?;
        let (pending, response) = self.submit(Target::Stream, ctx).await?;
        if response.upload_credentials().is_none() {
            return Err(VaasError::InvalidResponse(format!(
                "stream request answered with {} and no upload url",
                response.verdict
            )));
        }
        self.upload_and_wait(pending, response, UploadBody::reader(reader, len), "", ctx)
            .await
    }

    /// Like `for_stream`, with the length taken from the reader itself.
    pub async fn for_seekable<R>(&self, mut reader: R, ctx: &RequestContext) -> Result<VaasVerdict>
    where
        R: AsyncRead + AsyncSeek + Send + Sync + Unpin + 'static,
    {
        let start = reader.stream_position().await?;
        let end = reader.seek(SeekFrom::End(0)).await?;
        reader.seek(SeekFrom::Start(start)).await?;
        self.for_stream(reader, Some(end.saturating_sub(start)), ctx)
            .await
    }

    /// One concurrent call per hash. Failures become `Error` entries at
    /// their position.
    pub async fn for_sha256_list(&self, hashes: &[Sha256], ctx: &RequestContext) -> Vec<VaasVerdict> {
        let mut tasks = JoinSet::new();
        for (index, sha256) in hashes.iter().cloned().enumerate() {
            let vaas = self.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let verdict = vaas
                    .for_sha256(&sha256, &ctx)
                    .await
                    .unwrap_or_else(|e| VaasVerdict::error(sha256.as_str(), e.to_string()));
                (index, verdict)
            });
        }
        let targets = hashes.iter().map(|sha256| sha256.to_string()).collect();
        collect_positional(tasks, targets).await
    }

    pub async fn for_file_list(&self, paths: &[PathBuf], ctx: &RequestContext) -> Vec<VaasVerdict> {
        let mut tasks = JoinSet::new();
        for (index, path) in paths.iter().cloned().enumerate() {
            let vaas = self.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let verdict = vaas.for_file(&path, &ctx).await.unwrap_or_else(|e| {
                    VaasVerdict::error(path.display().to_string(), e.to_string())
                });
                (index, verdict)
            });
        }
        let targets = paths.iter().map(|path| path.display().to_string()).collect();
        collect_positional(tasks, targets).await
    }

    // =========================================================================
    // Request plumbing
    // =========================================================================

    /// Current session, waiting through a reconnect gap if needed.
    async fn session(&self, ctx: &RequestContext) -> Result<Arc<Session>> {
        let mut link = self.inner.link.clone();
        loop {
            {
                let current = link.borrow_and_update();
                match current.state {
                    ConnectionState::Ready => {
                        if let Some(session) = &current.session {
                            return Ok(session.clone());
                        }
                    }
                    ConnectionState::Closed => {
                        return Err(current
                            .terminal
                            .clone()
                            .map(|failure| failure.into_error())
                            .unwrap_or_else(|| {
                                VaasError::InvalidOperation("client is closed".into())
                            }))
                    }
                    ConnectionState::Draining => {
                        return Err(VaasError::InvalidOperation("client is closing".into()))
                    }
                    ConnectionState::Disconnected if !current.connected => {
                        return Err(VaasError::InvalidOperation(
                            "not connected; call connect() first".into(),
                        ))
                    }
                    _ => {}
                }
            }
            ctx.run(link.changed())
                .await?
                .map_err(|_| VaasError::InvalidOperation("client is closed".into()))?;
        }
    }

    /// Register, enqueue and wait for the first reply.
    async fn submit(
        &self,
        target: Target,
        ctx: &RequestContext,
    ) -> Result<(Pending<'_>, VerdictResponse)> {
        ctx.check()?;
        let session = self.session(ctx).await?;
        let request = VerdictRequest::new(session.id.as_str(), target, &self.inner.options);
        let frame = request.encode()?;

        let mut pending = Pending::register(&self.inner.table, &request.guid, session.clone())?;
        tracing::debug!(
            guid = %request.guid,
            session = %session.id,
            kind = ?request.target.kind(),
            "submitting request"
        );
        ctx.run(session.submit(frame)).await??;

        let response = pending.wait(ctx).await?;
        Ok((pending, response))
    }

    /// Upload `body` with the credentials in `response`, then wait for the
    /// follow-up verdict on the same request id.
    async fn upload_and_wait(
        &self,
        mut pending: Pending<'_>,
        response: VerdictResponse,
        body: UploadBody,
        target: &str,
        ctx: &RequestContext,
    ) -> Result<VaasVerdict> {
        let Some((url, token)) = response.upload_credentials() else {
            return Ok(into_verdict(response, target));
        };
        tracing::debug!(guid = %pending.id, bytes = body.len(), "server requested upload");

        // Re-register before uploading; the follow-up may beat the PUT response
        pending.rearm(&self.inner.link)?;

        // A connection loss fails the entry while the PUT may still be stuck
        let early = tokio::select! {
            uploaded = self.inner.uploader.upload(url, token, body, ctx) => {
                uploaded?;
                None
            }
            reply = pending.wait(ctx) => Some(reply),
        };
        let response = match early {
            Some(reply) => reply?,
            None => pending.wait(ctx).await?,
        };
        Ok(into_verdict(response, target))
    }
}

/// Correlation entry owned by one call. Dropping it removes the entry, so a
/// timed-out or cancelled call leaves nothing behind.
struct Pending<'a> {
    table: &'a CorrelationTable,
    id: String,
    /// Session the request was sent on; follow-ups only arrive there
    session: Arc<Session>,
    slot: Option<ReplySlot>,
}

impl<'a> Pending<'a> {
    fn register(table: &'a CorrelationTable, id: &str, session: Arc<Session>) -> Result<Self> {
        let slot = table.register(id)?;
        Ok(Self {
            table,
            id: id.to_string(),
            session,
            slot: Some(slot),
        })
    }

    /// Wait for another reply to the same request id. Fails when the
    /// request's session is no longer the published one.
    ///
    /// The entry is registered before the link is checked: a teardown that
    /// starts after the check still finds the entry in `fail_all`.
    fn rearm(&mut self, link: &watch::Receiver<Link>) -> Result<()> {
        self.slot = Some(self.table.register(&self.id)?);
        let current = link
            .borrow()
            .session
            .as_ref()
            .is_some_and(|session| Arc::ptr_eq(session, &self.session));
        if !current {
            // Drop removes the entry again
            return Err(VaasError::ConnectionLost(format!(
                "session {} ended before the upload",
                self.session.id
            )));
        }
        Ok(())
    }

    async fn wait(&mut self, ctx: &RequestContext) -> Result<VerdictResponse> {
        let slot = self
            .slot
            .as_mut()
            .ok_or_else(|| VaasError::InvalidOperation("no reply pending".into()))?;
        let reply = ctx.run(slot).await?;
        self.slot = None;
        match reply {
            Ok(Reply::Verdict(response)) => Ok(response),
            Ok(Reply::Failed(failure)) => Err(failure.into_error()),
            Err(_) => Err(VaasError::ConnectionLost(
                "reply slot dropped without a reply".into(),
            )),
        }
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.table.cancel(&self.id) {
            tracing::debug!(guid = %self.id, "request abandoned");
        }
    }
}

fn into_verdict(response: VerdictResponse, target: &str) -> VaasVerdict {
    let verdict = response.verdict();
    let sha256 = if response.sha256.is_empty() {
        target.to_string()
    } else {
        response.sha256
    };
    VaasVerdict {
        detection: response.detection,
        mime_type: response.mime_type,
        file_type: response.file_type,
        ..VaasVerdict::new(verdict, sha256)
    }
}

async fn collect_positional(
    mut tasks: JoinSet<(usize, VaasVerdict)>,
    targets: Vec<String>,
) -> Vec<VaasVerdict> {
    let mut results: Vec<Option<VaasVerdict>> = vec![None; targets.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, verdict)) => results[index] = Some(verdict),
            Err(e) => tracing::error!("list element task failed: {}", e),
        }
    }
    results
        .into_iter()
        .zip(targets)
        .map(|(result, target)| {
            result.unwrap_or_else(|| VaasVerdict::error(target, "verdict task did not complete"))
        })
        .collect()
}
