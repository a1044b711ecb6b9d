use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

const ERR_MSG_UNMANAGED: &str = "operation requires a managed thread context";
const ERR_MSG_NOT_DRAIN: &str = "caller is not the drain of this pipe in its current scope";
const ERR_MSG_INVALID_PIPE: &str = "retired, corrupted, or otherwise invalid pipe";
const ERR_MSG_KILLED: &str = "interrupted by a kill notification";
const ERR_MSG_UNDERFLOW: &str = "scope exit without a matching scope entry";
const ERR_MSG_OPEN_SCOPES: &str = "worker yielded with scopes still open";
const ERR_MSG_PANICKED: &str = "worker panicked before yielding a result";

/// Everything a public operation can fail with.
///
/// `Os` passes a raw errno through unchanged (thread creation reports
/// `EAGAIN`/`ENOMEM` this way). `Internal` identifies the exact source
/// location that detected a broken invariant; it only surfaces when the
/// library itself is inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
    /// The calling thread has no pipe context and the operation needs one.
    Unmanaged,
    /// The pipe is tethered, but not to the caller at its current scope.
    NotDrain,
    /// The pipe's identity tag no longer matches a live pipe.
    InvalidPipe,
    /// The caller's own pipe was killed while it was blocked.
    Killed,
    /// `exit_scope` without a matching `enter_scope`.
    ScopeUnderflow,
    /// Warning: a worker yielded with inner scopes still open.
    ScopeNotExited,
    /// The worker closure panicked; no result value exists.
    Panicked,
    /// Raw OS error code passed through unchanged.
    Os(i32),
    /// Inconsistency detected at the given source location.
    Internal { file: &'static str, line: u32 },
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeError::Unmanaged => write!(f, "{ERR_MSG_UNMANAGED}"),
            PipeError::NotDrain => write!(f, "{ERR_MSG_NOT_DRAIN}"),
            PipeError::InvalidPipe => write!(f, "{ERR_MSG_INVALID_PIPE}"),
            PipeError::Killed => write!(f, "{ERR_MSG_KILLED}"),
            PipeError::ScopeUnderflow => write!(f, "{ERR_MSG_UNDERFLOW}"),
            PipeError::ScopeNotExited => write!(f, "{ERR_MSG_OPEN_SCOPES}"),
            PipeError::Panicked => write!(f, "{ERR_MSG_PANICKED}"),
            PipeError::Os(code) => write!(f, "{}", io::Error::from_raw_os_error(*code)),
            PipeError::Internal { file, line } => {
                write!(f, "internal error at {file}:{line}")
            }
        }
    }
}

impl Error for PipeError {}

/// Internal error site: records the exact location that detected an
/// inconsistency.
macro_rules! ier {
    () => {
        $crate::error::PipeError::Internal {
            file: file!(),
            line: line!(),
        }
    };
}
pub(crate) use ier;

/// First-error-wins channel threaded through the internal plumbing.
///
/// A slot that already holds an error is never overwritten; later raises
/// are dropped so the first detected failure is the one reported.
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot(Option<PipeError>);

impl ErrorSlot {
    pub(crate) fn new() -> Self {
        Self(None)
    }

    /// Record `err` unless an earlier error is already held.
    pub(crate) fn raise(&mut self, err: PipeError) {
        if self.0.is_none() {
            self.0 = Some(err);
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub(crate) fn take(&mut self) -> Option<PipeError> {
        self.0.take()
    }

    /// Fold the slot and an optional value into a public result. A missing
    /// value with an empty slot means a reporting path was skipped, which
    /// is itself an internal error.
    pub(crate) fn finish<T>(mut self, value: Option<T>) -> Result<T, PipeError> {
        match (self.take(), value) {
            (Some(err), _) => Err(err),
            (None, Some(v)) => Ok(v),
            (None, None) => Err(ier!()),
        }
    }

    /// Fold a slot used only for its error channel.
    pub(crate) fn ok(mut self) -> Result<(), PipeError> {
        match self.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Number of error records retained by the process-wide ledger.
const LEDGER_LIMIT: usize = 16;

#[derive(Default)]
struct LedgerInner {
    records: Vec<PipeError>,
    suppressed: u64,
}

/// Append-only bounded log for errors that arise in contexts with no
/// caller to report to (worker teardown, the exit handler). Dumped through
/// `tracing` on final teardown.
pub(crate) struct Ledger {
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Record one error, keeping at most `LEDGER_LIMIT` and counting the
    /// rest. Does nothing once coordination is deadlocked.
    pub(crate) fn record(&self, err: PipeError) {
        if deadlocked() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.records.len() < LEDGER_LIMIT {
            inner.records.push(err);
        } else {
            inner.suppressed = inner.suppressed.saturating_add(1);
        }
    }

    /// Drain the ledger into the log. Called once from the exit handler.
    pub(crate) fn report(&self) {
        let mut inner = self.inner.lock();
        for err in inner.records.drain(..) {
            tracing::error!("unreported runtime error: {err}");
        }
        if inner.suppressed > 0 {
            tracing::error!("{} further errors were detected", inner.suppressed);
            inner.suppressed = 0;
        }
    }
}

/// Set when a coordination primitive fails in a way that makes further
/// synchronization unsound; everything that could block checks it first.
static DEADLOCKED: CachePadded<AtomicBool> = CachePadded::new(AtomicBool::new(false));

pub(crate) fn deadlocked() -> bool {
    DEADLOCKED.load(Ordering::Acquire)
}

pub(crate) fn mark_deadlocked() {
    DEADLOCKED.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_keeps_first_error() {
        let mut slot = ErrorSlot::new();
        slot.raise(PipeError::Killed);
        slot.raise(PipeError::NotDrain);
        assert_eq!(slot.take(), Some(PipeError::Killed));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn finish_prefers_error_over_value() {
        let mut slot = ErrorSlot::new();
        slot.raise(PipeError::Unmanaged);
        assert_eq!(slot.finish(Some(7)), Err(PipeError::Unmanaged));
    }

    #[test]
    fn messages_are_distinct() {
        let kinds = [
            PipeError::Unmanaged,
            PipeError::NotDrain,
            PipeError::InvalidPipe,
            PipeError::Killed,
            PipeError::ScopeUnderflow,
            PipeError::ScopeNotExited,
            PipeError::Panicked,
        ];
        for a in &kinds {
            for b in &kinds {
                if a != b {
                    assert_ne!(a.to_string(), b.to_string());
                }
            }
        }
    }
}
