//! Push (emit changes) queries.
//!
//! A push query keeps its response open. A reader task owns the transport
//! and its carry-over buffer, parses each completed line, and hands the
//! header, rows, errors and completion to [`PushCallbacks`]. The caller keeps
//! a [`StreamingQueryHandle`] to observe and stop the query.

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use ripple_audit::AuditLogger;
use ripple_core::{ExecutionContext, RowFormat};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::client::QueryClient;
use crate::error::ClientError;
use crate::protocol::{QueryHeader, StreamFrame, StreamItem, frame_stream};
use crate::row::Row;

pub type OnHeaderCallback = Arc<dyn Fn(&QueryHeader) + Send + Sync>;
pub type OnRowCallback = Arc<dyn Fn(Row) -> BoxFuture<'static, ()> + Send + Sync>;
pub type OnErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;
pub type OnCompleteCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks of a push query. All are optional.
///
/// The row callback is asynchronous and awaited before the next line is
/// read, so a slow consumer slows the reader down instead of queueing rows.
#[derive(Clone, Default)]
pub struct PushCallbacks {
    on_header: Option<OnHeaderCallback>,
    on_row: Option<OnRowCallback>,
    on_error: Option<OnErrorCallback>,
    on_complete: Option<OnCompleteCallback>,
}

impl fmt::Debug for PushCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushCallbacks")
            .field("on_header", &self.on_header.is_some())
            .field("on_row", &self.on_row.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl PushCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once with the column header.
    pub fn on_header(mut self, f: impl Fn(&QueryHeader) + Send + Sync + 'static) -> Self {
        self.on_header = Some(Arc::new(f));
        self
    }

    /// Called for every row.
    pub fn on_row<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Row) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_row = Some(Arc::new(move |row: Row| -> BoxFuture<'static, ()> {
            Box::pin(f(row))
        }));
        self
    }

    /// Called for engine errors inside the stream and for transport failures.
    /// Engine errors do not end the stream; transport failures do.
    pub fn on_error(mut self, f: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called when the engine closes the stream normally.
    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    fn emit_header(&self, header: &QueryHeader) {
        if let Some(cb) = &self.on_header {
            cb(header);
        }
    }

    async fn emit_row(&self, row: Row) {
        if let Some(cb) = &self.on_row {
            cb(row).await;
        }
    }

    fn emit_error(&self, err: &ClientError) {
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }

    fn emit_complete(&self) {
        if let Some(cb) = &self.on_complete {
            cb();
        }
    }
}

/// Lifecycle of a push query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Request accepted, header not yet received.
    Idle,
    /// Header received; rows are flowing.
    Active,
    /// Terminated by the caller, closed by the engine, or failed.
    Terminated,
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryState::Idle => write!(f, "idle"),
            QueryState::Active => write!(f, "active"),
            QueryState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Who the stream runs for, when its lifecycle is audited.
#[derive(Debug, Clone)]
pub(crate) struct StreamAudit {
    pub logger: AuditLogger,
    pub ctx: ExecutionContext,
}

struct Shared {
    state: watch::Sender<QueryState>,
    query_id: OnceLock<String>,
    /// Set by whichever of `terminate()` and natural completion runs first.
    settled: AtomicBool,
    rows: AtomicU64,
    statement: String,
    started: Instant,
    audit: Option<StreamAudit>,
}

impl Shared {
    fn activate(&self) {
        self.state.send_if_modified(|state| {
            if *state == QueryState::Idle {
                *state = QueryState::Active;
                true
            } else {
                false
            }
        });
    }

    fn mark_terminated(&self) {
        self.state.send_if_modified(|state| {
            let changed = *state != QueryState::Terminated;
            *state = QueryState::Terminated;
            changed
        });
    }

    /// Returns true for the first caller only.
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }

    fn query_id(&self) -> Option<&str> {
        self.query_id.get().map(String::as_str)
    }

    async fn audit_started(&self) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit
                .logger
                .log_stream_started(&audit.ctx, &self.statement, self.query_id())
                .await
            {
                tracing::warn!(error = %e, "Failed to write audit event");
            }
        }
    }

    async fn audit_terminated(&self) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit
                .logger
                .log_stream_terminated(
                    &audit.ctx,
                    self.query_id(),
                    self.rows.load(Ordering::Relaxed),
                    self.started.elapsed().as_millis() as u64,
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to write audit event");
            }
        }
    }
}

/// Handle to a running push query.
///
/// Dropping the handle does not stop the query; call [`terminate`](Self::terminate).
pub struct StreamingQueryHandle {
    shared: Arc<Shared>,
    reader: AbortHandle,
    client: QueryClient,
}

impl fmt::Debug for StreamingQueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingQueryHandle")
            .field("query_id", &self.query_id())
            .field("state", &self.state())
            .finish()
    }
}

impl StreamingQueryHandle {
    pub(crate) fn spawn(
        client: QueryClient,
        statement: &str,
        response: reqwest::Response,
        callbacks: PushCallbacks,
        audit: Option<StreamAudit>,
    ) -> Self {
        let (state, _) = watch::channel(QueryState::Idle);
        let shared = Arc::new(Shared {
            state,
            query_id: OnceLock::new(),
            settled: AtomicBool::new(false),
            rows: AtomicU64::new(0),
            statement: statement.to_string(),
            started: Instant::now(),
            audit,
        });

        let frames = frame_stream(response.bytes_stream());
        let task = tokio::spawn(read_stream(
            frames,
            shared.clone(),
            callbacks,
            client.config().row_format,
        ));

        Self {
            shared,
            reader: task.abort_handle(),
            client,
        }
    }

    /// Query id from the header, once it has arrived.
    pub fn query_id(&self) -> Option<&str> {
        self.shared.query_id()
    }

    pub fn state(&self) -> QueryState {
        *self.shared.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == QueryState::Active
    }

    /// Rows delivered so far.
    pub fn row_count(&self) -> u64 {
        self.shared.rows.load(Ordering::Relaxed)
    }

    /// Wait until the header has arrived or the query has ended.
    pub async fn ready(&self) -> QueryState {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(|s| *s != QueryState::Idle).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Wait until the query has ended, whichever way.
    pub async fn wait(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == QueryState::Terminated).await;
    }

    /// Stop the query.
    ///
    /// Closes the local stream and asks the engine to release the query. A
    /// release answered with "not found" counts as success. Only the first
    /// call does anything; later calls, and calls after the engine closed the
    /// stream itself, return `Ok(())`.
    pub async fn terminate(&self) -> Result<(), ClientError> {
        if !self.shared.settle() {
            tracing::debug!(query_id = ?self.query_id(), "Push query already terminated");
            return Ok(());
        }

        self.reader.abort();
        self.shared.mark_terminated();

        let result = match self.query_id() {
            Some(id) => self.client.close_query(id).await,
            None => {
                tracing::debug!("Push query has no id yet; nothing to release");
                Ok(())
            }
        };

        tracing::info!(
            query_id = ?self.query_id(),
            rows = self.row_count(),
            duration_ms = self.shared.started.elapsed().as_millis() as u64,
            "Push query terminated"
        );
        self.shared.audit_terminated().await;
        result
    }
}

/// Marks the query terminated when the reader exits, even by a panicking
/// callback. It does not settle, so `terminate()` can still release the query.
struct ReaderExit(Arc<Shared>);

impl Drop for ReaderExit {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!(query_id = ?self.0.query_id(), "Push stream callback panicked");
        }
        self.0.mark_terminated();
    }
}

async fn read_stream<S>(frames: S, shared: Arc<Shared>, callbacks: PushCallbacks, format: RowFormat)
where
    S: Stream<Item = StreamItem>,
{
    let _exit = ReaderExit(shared.clone());
    futures::pin_mut!(frames);
    let mut header: Option<QueryHeader> = None;

    while let Some(item) = frames.next().await {
        match item {
            StreamItem::Frame(StreamFrame::Header(h)) => {
                if header.is_some() {
                    tracing::debug!("Ignoring repeated header");
                    continue;
                }
                if let Some(id) = &h.query_id {
                    let _ = shared.query_id.set(id.clone());
                }
                tracing::debug!(query_id = ?h.query_id, columns = h.column_names.len(), "Push query header");
                shared.activate();
                shared.audit_started().await;
                callbacks.emit_header(&h);
                header = Some(h);
            }
            StreamItem::Frame(StreamFrame::Row(values)) => {
                shared.activate();
                shared.rows.fetch_add(1, Ordering::Relaxed);
                callbacks
                    .emit_row(Row::new(values, header.as_ref(), format))
                    .await;
            }
            StreamItem::Frame(StreamFrame::Error(err)) => {
                tracing::warn!(error_code = err.error_code, message = %err.message, "Engine error in push stream");
                callbacks.emit_error(&ClientError::from(err));
            }
            StreamItem::Frame(StreamFrame::Message(message)) => {
                tracing::debug!(%message, "Push stream message");
            }
            StreamItem::Malformed(e) => {
                tracing::warn!(error = %e, "Skipping malformed stream line");
            }
            StreamItem::Failed(e) => {
                tracing::error!(query_id = ?shared.query_id(), error = %e, "Push stream failed");
                // Leave the release to terminate(); the engine may still hold the query.
                shared.mark_terminated();
                callbacks.emit_error(&e);
                return;
            }
        }
    }

    if shared.settle() {
        tracing::info!(
            query_id = ?shared.query_id(),
            rows = shared.rows.load(Ordering::Relaxed),
            "Push query completed"
        );
        shared.mark_terminated();
        shared.audit_terminated().await;
        callbacks.emit_complete();
    }
}
