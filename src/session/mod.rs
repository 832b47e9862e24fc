//! Upload Session Controller
//!
//! Owns the lifecycle of one upload: the current file, the remote resource,
//! the byte position and the single live range request. Callers drive it with
//! [`start`](UploadController::start), [`pause`](UploadController::pause),
//! [`resume`](UploadController::resume) and [`cancel`](UploadController::cancel)
//! and observe it through [`Snapshot`]s.
//!
//! # Concurrency
//!
//! Commands are synchronous: each takes the session lock, applies its state
//! transition and returns. Network work happens on a spawned driver task.
//! Every command that changes what should be running bumps a run generation;
//! a driver whose generation is stale drops whatever result it receives, so a
//! late response can never resurrect a paused or cancelled session.
//!
//! Commands spawn tasks and must be called from within a Tokio runtime.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tus_uploadr::config::Config;
//! use tus_uploadr::session::{SessionState, UploadController};
//! use tus_uploadr::upload::LocalFile;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::with_endpoint("http://localhost:8080/tus-files/");
//! let controller = UploadController::from_config(&config)?;
//! let mut updates = controller.subscribe();
//!
//! controller.start(Arc::new(LocalFile::open("movie.mp4", Some("video/mp4")).await?));
//! let done = updates
//!     .wait_for(|s| s.state != SessionState::Uploading)
//!     .await?
//!     .clone();
//! println!("{} at {:.2}%", done.state, done.progress_percent);
//! # Ok(())
//! # }
//! ```

use crate::config::Config;
use crate::metrics;
use crate::store::{self, JsonFileStore, MemoryStore, ResourceStore, StoredResource};
use crate::tus::{
    ClientError, LiveRequest, ProgressCallback, TusClient, TusClientConfig, Transport,
    UploadResource,
};
use crate::upload::UploadableFile;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

pub mod state;

pub use state::{progress_percent, SessionState, Snapshot};

/// Controller behaviour switches
#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    /// Ask the server to delete the resource when a session is cancelled
    pub terminate_on_cancel: bool,
}

/// Upload Session Controller
///
/// Cloning yields another handle to the same session.
pub struct UploadController<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for UploadController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<T> {
    transport: T,
    endpoint: String,
    store: Arc<dyn ResourceStore>,
    options: ControllerOptions,
    session: Mutex<Session>,
    snapshots: watch::Sender<Snapshot>,
}

/// Identifies the run a driver task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    session_id: u64,
    run: u64,
}

struct Session {
    state: SessionState,
    // Changes on start and cancel
    session_id: u64,
    // Changes on every command
    run: u64,
    file: Option<Arc<dyn UploadableFile>>,
    fingerprint: Option<String>,
    resource: Option<UploadResource>,
    // Projection: acknowledged bytes plus progress of the live range
    received_bytes: u64,
    total_bytes: u64,
    live: Option<LiveRequest>,
    // Flips to true once the outstanding resource creation has settled
    creating: Option<watch::Receiver<bool>>,
    // Set when the server permanently refused the current resource
    rejected: bool,
    message: Option<String>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            session_id: 0,
            run: 0,
            file: None,
            fingerprint: None,
            resource: None,
            received_bytes: 0,
            total_bytes: 0,
            live: None,
            creating: None,
            rejected: false,
            message: None,
        }
    }

    fn ticket(&self) -> Ticket {
        Ticket {
            session_id: self.session_id,
            run: self.run,
        }
    }

    fn is_current(&self, ticket: Ticket) -> bool {
        self.ticket() == ticket
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.state,
            self.received_bytes,
            self.total_bytes,
            self.file.as_ref().map(|f| f.name().to_string()),
            self.message.clone(),
        )
    }

    fn abort_live(&mut self) {
        if let Some(live) = self.live.take() {
            tracing::debug!(from_offset = live.from_offset(), "Aborting live range request");
            live.abort();
        }
    }
}

impl UploadController<TusClient> {
    /// Build a controller talking to the configured tus endpoint
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        let client = TusClient::new(TusClientConfig::from(&config.tus))?;
        let store: Arc<dyn ResourceStore> = match &config.session.store_path {
            Some(path) => Arc::new(JsonFileStore::new(path)),
            None => Arc::new(MemoryStore::new()),
        };
        let options = ControllerOptions {
            terminate_on_cancel: config.session.terminate_on_cancel,
        };
        Ok(Self::with_options(client, store, options))
    }
}

impl<T: Transport> UploadController<T> {
    pub fn new(transport: T, store: Arc<dyn ResourceStore>) -> Self {
        Self::with_options(transport, store, ControllerOptions::default())
    }

    pub fn with_options(
        transport: T,
        store: Arc<dyn ResourceStore>,
        options: ControllerOptions,
    ) -> Self {
        let (snapshots, _) = watch::channel(Snapshot::idle());
        let endpoint = transport.endpoint();
        Self {
            shared: Arc::new(Shared {
                transport,
                endpoint,
                store,
                options,
                session: Mutex::new(Session::new()),
                snapshots,
            }),
        }
    }

    /// Current observable state
    pub fn snapshot(&self) -> Snapshot {
        self.shared.session.lock().snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.shared.session.lock().state
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Begin a new session for `file`
    ///
    /// Valid from `Idle`, `Succeeded` and `Cancelled`.
    pub fn start(&self, file: Arc<dyn UploadableFile>) {
        let mut session = self.shared.session.lock();
        match session.state {
            SessionState::Idle | SessionState::Succeeded | SessionState::Cancelled => {}
            state => return invalid_operation("start", state),
        }

        session.session_id += 1;
        session.run += 1;
        session.state = SessionState::Uploading;
        session.fingerprint = Some(store::fingerprint(&self.shared.endpoint, file.as_ref()));
        session.total_bytes = file.size();
        session.file = Some(file);
        session.resource = None;
        session.received_bytes = 0;
        session.live = None;
        session.creating = None;
        session.rejected = false;
        session.message = None;

        tracing::info!(
            session_id = session.session_id,
            file = session.file.as_ref().map(|f| f.name()).unwrap_or_default(),
            bytes = session.total_bytes,
            "Upload session started"
        );
        metrics::record_session("started");
        self.shared.publish(&session);

        self.spawn_driver(session.ticket());
    }

    /// Stop sending until [`resume`](Self::resume)
    ///
    /// Valid from `Uploading`; a no-op when already `Paused`.
    pub fn pause(&self) {
        let mut session = self.shared.session.lock();
        match session.state {
            SessionState::Uploading => {}
            SessionState::Paused => {
                tracing::debug!("Session already paused");
                return;
            }
            state => return invalid_operation("pause", state),
        }

        session.run += 1;
        session.state = SessionState::Paused;
        session.message = None;
        session.abort_live();

        tracing::info!(
            session_id = session.session_id,
            received = session.received_bytes,
            "Upload paused"
        );
        metrics::record_session("paused");
        self.shared.publish(&session);
    }

    /// Reconcile with the server and continue sending
    ///
    /// Valid from `Paused`; a no-op from `Idle`. Refused when the server
    /// permanently rejected the current resource.
    pub fn resume(&self) {
        let mut session = self.shared.session.lock();
        match session.state {
            SessionState::Paused if !session.rejected => {}
            SessionState::Paused => {
                tracing::warn!(
                    session_id = session.session_id,
                    "Server rejected this upload; cancel and start again"
                );
                return invalid_operation("resume", SessionState::Paused);
            }
            SessionState::Idle => {
                tracing::debug!("Nothing to resume");
                return;
            }
            state => return invalid_operation("resume", state),
        }

        session.run += 1;
        session.state = SessionState::Uploading;
        session.message = None;

        tracing::info!(session_id = session.session_id, "Upload resumed");
        self.shared.publish(&session);

        self.spawn_driver(session.ticket());
    }

    /// Abort and discard the session
    ///
    /// Valid from `Uploading` and `Paused`. Not resumable.
    pub fn cancel(&self) {
        let mut session = self.shared.session.lock();
        match session.state {
            SessionState::Uploading | SessionState::Paused => {}
            state => return invalid_operation("cancel", state),
        }

        session.session_id += 1;
        session.run += 1;
        session.abort_live();

        let resource = session.resource.take();
        let fingerprint = session.fingerprint.take();
        session.creating = None;
        session.file = None;
        session.received_bytes = 0;
        session.total_bytes = 0;
        session.rejected = false;
        session.message = None;
        session.state = SessionState::Cancelled;

        tracing::info!(session_id = session.session_id, "Upload cancelled");
        metrics::record_session("cancelled");
        self.shared.publish(&session);
        drop(session);

        if let Some(fingerprint) = fingerprint {
            self.shared.forget(&fingerprint);
        }
        if let Some(resource) = resource {
            self.shared.discard(resource);
        }
    }

    /// Return a finished session to `Idle`
    pub fn reset(&self) {
        let mut session = self.shared.session.lock();
        if !session.state.is_terminal() {
            return invalid_operation("reset", session.state);
        }

        session.run += 1;
        session.state = SessionState::Idle;
        session.received_bytes = 0;
        session.total_bytes = 0;
        session.message = None;
        self.shared.publish(&session);
    }

    fn spawn_driver(&self, ticket: Ticket) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Some(resource) = shared.establish(ticket).await {
                shared.send_ranges(ticket, resource).await;
            }
        });
    }
}

fn invalid_operation(operation: &str, state: SessionState) {
    tracing::warn!(
        operation = operation,
        state = %state,
        "Ignoring operation not valid in the current state"
    );
    metrics::record_invalid_operation(operation);
}

impl<T: Transport> Shared<T> {
    fn publish(&self, session: &Session) {
        self.snapshots.send_replace(session.snapshot());
    }

    fn forget(&self, fingerprint: &str) {
        if let Err(e) = self.store.remove(fingerprint) {
            tracing::warn!(error = %e, "Failed to remove resource hint");
        }
    }

    fn remember(&self, fingerprint: &str, resource: &UploadResource, file: &dyn UploadableFile) {
        let stored = StoredResource {
            url: resource.url.clone(),
            file_name: file.name().to_string(),
            size: file.size(),
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.store.save(fingerprint, stored) {
            tracing::warn!(error = %e, "Failed to save resource hint");
        }
    }

    /// Delete a resource no session will send to, when configured to
    fn discard(self: &Arc<Self>, resource: UploadResource) {
        if !self.options.terminate_on_cancel {
            return;
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            match shared.transport.terminate(&resource).await {
                Ok(()) => tracing::info!(location = %resource.url, "Terminated upload resource"),
                Err(e) => tracing::warn!(
                    location = %resource.url,
                    error = %e,
                    "Failed to terminate upload resource"
                ),
            }
        });
    }

    /// Find the resource to send to and reconcile the byte position with it
    async fn establish(self: &Arc<Self>, ticket: Ticket) -> Option<UploadResource> {
        loop {
            let (file, known, fingerprint, pending) = {
                let session = self.session.lock();
                if !session.is_current(ticket) {
                    return None;
                }
                (
                    session.file.clone()?,
                    session.resource.clone(),
                    session.fingerprint.clone(),
                    session.creating.clone(),
                )
            };

            if let Some(mut pending) = pending {
                tracing::debug!("Waiting for the outstanding resource creation");
                let settled = pending.wait_for(|settled| *settled).await.is_ok();
                if !settled {
                    let mut session = self.session.lock();
                    if session
                        .creating
                        .as_ref()
                        .is_some_and(|creating| creating.same_channel(&pending))
                    {
                        session.creating = None;
                    }
                }
                continue;
            }

            return match known {
                Some(resource) => self.reconcile(ticket, file, resource).await,
                None => {
                    let hint = resource_hint(self.store.as_ref(), fingerprint.as_deref());
                    self.locate(ticket, file, hint).await
                }
            };
        }
    }

    async fn reconcile(
        self: &Arc<Self>,
        ticket: Ticket,
        file: Arc<dyn UploadableFile>,
        mut resource: UploadResource,
    ) -> Option<UploadResource> {
        match self.transport.query_received_bytes(&resource).await {
            Ok(offset) => {
                let mut session = self.session.lock();
                if !session.is_current(ticket) {
                    return None;
                }
                let total = session.total_bytes;
                if offset > total {
                    self.fail(
                        &mut session,
                        ClientError::ProtocolError(format!(
                            "Server holds {} bytes of a {} byte file",
                            offset, total
                        )),
                    );
                    return None;
                }

                // May be lower than the local projection; surfaced as-is
                tracing::info!(
                    local = session.received_bytes,
                    server = offset,
                    "Reconciled offset with server"
                );
                resource.received_bytes = offset;
                session.received_bytes = offset;
                session.resource = Some(resource.clone());
                self.publish(&session);
                Some(resource)
            }
            Err(ClientError::ResourceNotFound(reason)) => {
                let fingerprint = {
                    let mut session = self.session.lock();
                    if !session.is_current(ticket) {
                        return None;
                    }
                    tracing::warn!(
                        location = %resource.url,
                        reason = %reason,
                        "Upload resource no longer exists, starting over"
                    );
                    session.resource = None;
                    session.fingerprint.clone()
                };
                if let Some(fingerprint) = fingerprint {
                    self.forget(&fingerprint);
                }
                self.locate(ticket, file, None).await
            }
            Err(e) => {
                let mut session = self.session.lock();
                if session.is_current(ticket) {
                    self.fail(&mut session, e);
                }
                None
            }
        }
    }

    /// Create the resource, or reuse the hinted one
    ///
    /// Runs that start while this is outstanding wait for it instead of
    /// creating a second resource.
    async fn locate(
        self: &Arc<Self>,
        ticket: Ticket,
        file: Arc<dyn UploadableFile>,
        prior: Option<StoredResource>,
    ) -> Option<UploadResource> {
        let (settled, pending) = watch::channel(false);
        {
            let mut session = self.session.lock();
            if !session.is_current(ticket) {
                return None;
            }
            session.creating = Some(pending);
        }

        let result = self
            .transport
            .create_or_locate(Arc::clone(&file), prior)
            .await;

        let resource = self.settle_creation(ticket, file.as_ref(), result);
        settled.send_replace(true);
        resource
    }

    /// Adopt a created resource; `None` when this run should not send to it
    fn settle_creation(
        self: &Arc<Self>,
        ticket: Ticket,
        file: &dyn UploadableFile,
        result: Result<UploadResource, ClientError>,
    ) -> Option<UploadResource> {
        let mut session = self.session.lock();
        if session.session_id != ticket.session_id {
            drop(session);
            if let Ok(resource) = result {
                tracing::debug!(
                    location = %resource.url,
                    "Discarding resource of a cancelled session"
                );
                self.discard(resource);
            }
            return None;
        }
        session.creating = None;

        let resource = match result {
            Ok(resource) => resource,
            Err(e) => {
                if session.is_current(ticket) {
                    self.fail(&mut session, e);
                }
                return None;
            }
        };

        if session.resource.is_some() {
            drop(session);
            tracing::debug!(location = %resource.url, "Discarding duplicate upload resource");
            self.discard(resource);
            return None;
        }

        // Kept even when paused meanwhile, so resume reconciles it
        session.resource = Some(resource.clone());
        let current = session.is_current(ticket);
        if current {
            session.received_bytes = resource.received_bytes;
            self.publish(&session);
        }
        let fingerprint = session.fingerprint.clone();
        drop(session);

        if let Some(fingerprint) = fingerprint {
            self.remember(&fingerprint, &resource, file);
            if self.session.lock().session_id != ticket.session_id {
                self.forget(&fingerprint);
            }
        }
        current.then_some(resource)
    }

    /// Send ranges until the server holds the whole file
    async fn send_ranges(self: &Arc<Self>, ticket: Ticket, mut resource: UploadResource) {
        loop {
            let from = resource.received_bytes;
            let file = {
                let mut session = self.session.lock();
                if !session.is_current(ticket) {
                    return;
                }
                if from >= session.total_bytes {
                    let fingerprint = self.complete(&mut session);
                    drop(session);
                    if let Some(fingerprint) = fingerprint {
                        self.forget(&fingerprint);
                    }
                    return;
                }
                match session.file.clone() {
                    Some(file) => file,
                    None => return,
                }
            };

            let handle = self.transport.send_range(
                &resource,
                file,
                from,
                self.progress_callback(ticket),
            );

            {
                let mut session = self.session.lock();
                if !session.is_current(ticket) {
                    handle.abort();
                    return;
                }
                session.live = Some(handle.live_request());
            }

            let outcome = handle.outcome().await;
            if !self.settle_range(ticket, &mut resource, outcome) {
                return;
            }
        }
    }

    /// Apply the outcome of the range sent from `resource.received_bytes`
    ///
    /// Returns false when the driver should stop.
    fn settle_range(
        &self,
        ticket: Ticket,
        resource: &mut UploadResource,
        outcome: Result<u64, ClientError>,
    ) -> bool {
        let from = resource.received_bytes;
        let mut session = self.session.lock();
        if !session.is_current(ticket) {
            tracing::debug!(from_offset = from, "Discarding result of a superseded range");
            return false;
        }
        session.live = None;

        match outcome {
            Ok(offset) if offset > from && offset <= session.total_bytes => {
                resource.received_bytes = offset;
                session.resource = Some(resource.clone());
                session.received_bytes = session.received_bytes.max(offset);
                self.publish(&session);
                true
            }
            Ok(offset) => {
                self.fail(
                    &mut session,
                    ClientError::ProtocolError(format!(
                        "Range from {} acknowledged at {}",
                        from, offset
                    )),
                );
                false
            }
            Err(e) => {
                self.fail(&mut session, e);
                false
            }
        }
    }

    fn progress_callback(self: &Arc<Self>, ticket: Ticket) -> ProgressCallback {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |uploaded: u64, total: u64| {
            if let Some(shared) = weak.upgrade() {
                shared.report_progress(ticket, uploaded, total);
            }
        })
    }

    /// Progress events only move the projection forward within their own run
    fn report_progress(&self, ticket: Ticket, uploaded: u64, total: u64) {
        let mut session = self.session.lock();
        if !session.is_current(ticket) || session.state != SessionState::Uploading {
            return;
        }
        if total != session.total_bytes {
            tracing::debug!(total = total, "Ignoring progress for a different file size");
            return;
        }
        if uploaded > session.received_bytes && uploaded <= session.total_bytes {
            session.received_bytes = uploaded;
            tracing::trace!(uploaded = uploaded, "Range progress");
            self.publish(&session);
        }
    }

    /// Returns the fingerprint whose hint should now be removed
    fn complete(&self, session: &mut Session) -> Option<String> {
        session.run += 1;
        session.state = SessionState::Succeeded;
        session.received_bytes = session.total_bytes;
        session.live = None;
        session.resource = None;
        session.file = None;
        session.message = None;

        tracing::info!(
            session_id = session.session_id,
            bytes = session.total_bytes,
            "Upload succeeded"
        );
        metrics::record_session("succeeded");
        self.publish(session);
        session.fingerprint.take()
    }

    /// Every failure lands in `Paused` with a diagnostic
    fn fail(&self, session: &mut Session, error: ClientError) {
        let message = match &error {
            ClientError::ServerRejected { .. } => {
                session.rejected = true;
                format!("{}; cancel and start a new upload", error)
            }
            ClientError::ResourceNotFound(_) => {
                format!("{}; resume will start over", error)
            }
            _ => error.to_string(),
        };

        session.run += 1;
        session.abort_live();
        session.state = SessionState::Paused;
        session.message = Some(message);

        tracing::warn!(
            session_id = session.session_id,
            received = session.received_bytes,
            error = %error,
            "Upload paused after error"
        );
        metrics::record_session("paused");
        self.publish(session);
    }
}

fn resource_hint(store: &dyn ResourceStore, fingerprint: Option<&str>) -> Option<StoredResource> {
    let fingerprint = fingerprint?;
    match store.find(fingerprint) {
        Ok(hint) => hint,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read resource hint");
            None
        }
    }
}
