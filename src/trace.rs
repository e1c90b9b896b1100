//! Operation contexts.
//!
//! An [`Operation`] is threaded through every lifecycle and attach call. It
//! carries a short id for log correlation, a [`tracing::Span`], a cancellation
//! token, and an optional deadline. Children inherit cancellation and never
//! outlive their parent's deadline.
//!
//! ```rust,ignore
//! let op = Operation::new("commit handle");
//! let _t = op.begin("power on");
//! let props = op.bounded(vm.properties()).await?;
//! ```

use std::fmt;
use std::future::Future;

use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Span};

/// Why an operation stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// The operation (or an ancestor) was cancelled.
    Cancelled,
    /// The operation's deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "context canceled"),
            Self::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

/// Named, cancellable, deadline-bearing trace context.
#[derive(Debug, Clone)]
pub struct Operation {
    id: String,
    name: String,
    span: Span,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Operation {
    /// Creates a root operation.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = short_id();
        let span = tracing::info_span!("op", id = %id, name = %name);
        Self {
            id,
            name,
            span,
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Creates a child that inherits cancellation and deadline.
    #[must_use]
    pub fn child(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        let id = format!("{}.{}", self.id, &short_id()[..4]);
        let span = tracing::info_span!(parent: &self.span, "op", id = %id, name = %name);
        Self {
            id,
            name,
            span,
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Creates a child whose deadline is at most `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut child = self.child(format!("{} (timeout {timeout:?})", self.name));
        let deadline = Instant::now() + timeout;
        child.deadline = Some(match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        });
        child
    }

    /// Operation id used in log lines.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tracing span for this operation.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancels this operation and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the reason the operation is finished, if it is.
    #[must_use]
    pub fn err(&self) -> Option<Cause> {
        if self.token.is_cancelled() {
            return Some(Cause::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Cause::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the operation is cancelled or its deadline passes.
    pub async fn done(&self) -> Cause {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Cause::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Cause::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Cause::Cancelled
            }
        }
    }

    /// Runs `fut` until it completes or the operation is done.
    pub async fn bounded<F: Future>(&self, fut: F) -> Result<F::Output, Cause> {
        if let Some(cause) = self.err() {
            return Err(cause);
        }
        tokio::select! {
            biased;
            out = fut => Ok(out),
            cause = self.done() => Err(cause),
        }
    }

    /// Logs `[BEGIN] msg` now and `[ END ] msg` when the guard drops.
    #[must_use = "the END line is logged when the guard drops"]
    pub fn begin(&self, msg: impl Into<String>) -> TraceGuard {
        let msg = msg.into();
        debug!(op = %self.id, "[BEGIN] {msg}");
        TraceGuard {
            op: self.id.clone(),
            msg,
            started: Instant::now(),
        }
    }
}

/// Guard returned by [`Operation::begin`].
#[derive(Debug)]
pub struct TraceGuard {
    op: String,
    msg: String,
    started: Instant,
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        debug!(op = %self.op, "[ END ] [{:?}] {}", self.started.elapsed(), self.msg);
    }
}

fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
