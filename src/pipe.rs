use crate::error::{ErrorSlot, PipeError, ier};
use crate::list::LinkId;
use crate::scope::ScopeStack;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Value delivered by a worker through its pipe.
pub type PipeValue = Box<dyn Any + Send>;

/// Identity tag. A live pipe carries `Live`; retirement or a detected
/// inconsistency turns it `Defunct`, recording the site, so dangling
/// handles fail with `InvalidPipe` instead of touching stale state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tag {
    Live,
    Defunct { file: &'static str, line: u32 },
}

/// Source-side end of a tether: a non-owning back-reference to the drain
/// plus the link token shared with the drain-side list entry.
pub(crate) struct Reader {
    pub(crate) drain: Weak<PipeCore>,
    pub(crate) link: LinkId,
}

impl Reader {
    pub(crate) fn is(&self, drain: &Arc<PipeCore>) -> bool {
        std::ptr::eq(self.drain.as_ptr(), Arc::as_ptr(drain))
    }
}

/// Everything mutable about a pipe, guarded by its lock.
pub(crate) struct PipeState {
    pub(crate) tag: Tag,
    /// Set by the drain (or by the reader yielding unread); workers
    /// observe it by polling. Implies untethered.
    pub(crate) killed: bool,
    /// Unreferenced but not yet reclaimable.
    pub(crate) zombie: bool,
    /// Stands in for an unmanaged thread at the root of a subtree.
    pub(crate) placeholder: bool,
    /// Membership in the root pool.
    pub(crate) pooled: bool,
    /// The drain, if tethered. At most one.
    pub(crate) reader: Option<Reader>,
    pub(crate) scopes: ScopeStack,
    /// The drain's scope level at the moment this pipe was tethered;
    /// fixes the pipe to one frame of the drain's scope stack.
    pub(crate) depth: usize,
    pub(crate) result: Option<PipeValue>,
    pub(crate) status: Option<PipeError>,
}

impl PipeState {
    pub(crate) fn live(&self) -> bool {
        matches!(self.tag, Tag::Live)
    }

    /// Flip the tag to defunct, recording the internal site that found
    /// the inconsistency.
    pub(crate) fn condemn(&mut self, site: PipeError) {
        if let PipeError::Internal { file, line } = site {
            self.tag = Tag::Defunct { file, line };
        }
    }
}

/// Shared pipe node. The state mutex is itself shared so the tree walk
/// below can hold an owning guard while stepping to the next node.
pub(crate) struct PipeCore {
    pub(crate) state: Arc<Mutex<PipeState>>,
    /// Monotonic: set when the worker's result is final, never cleared.
    /// Kept outside the lock so a drain can poll it while holding only
    /// its own lock; stores still happen under the lock that pairs with
    /// the matching condvar signal.
    pub(crate) yielded: AtomicBool,
    /// Signaled to the pipe acting as a drain: a source finished, or the
    /// pipe itself was killed while blocked.
    pub(crate) progress: Condvar,
    /// Signaled on yield when the pipe has no drain.
    pub(crate) termination: Condvar,
}

/// Allocate and initialize a pipe with a live tag and the sentinel scope
/// frame in place.
pub(crate) fn new_pipe() -> Arc<PipeCore> {
    Arc::new(PipeCore {
        state: Arc::new(Mutex::new(PipeState {
            tag: Tag::Live,
            killed: false,
            zombie: false,
            placeholder: false,
            pooled: false,
            reader: None,
            scopes: ScopeStack::new(),
            depth: 0,
            result: None,
            status: None,
        })),
        yielded: AtomicBool::new(false),
        progress: Condvar::new(),
        termination: Condvar::new(),
    })
}

/// Locked check for retirement eligibility: no enclosing scopes, an empty
/// sentinel frame, and either a placeholder or a worker that was both
/// killed and has yielded. Zombies are always retirable.
pub(crate) fn retirable(p: &Arc<PipeCore>) -> bool {
    let st = p.state.lock();
    if st.zombie {
        return true;
    }
    if !st.live() {
        return false;
    }
    st.scopes.quiescent() && (st.placeholder || (p.yielded.load(Ordering::Acquire) && st.killed))
}

/// Tear down a pipe that nothing depends on any more: no reader, no
/// blockers or finishers, scope stack down to the sentinel. The tag goes
/// defunct so any surviving handle is detected as invalid.
pub(crate) fn retired(p: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
    let mut st = p.state.lock();
    if !st.live() {
        slot.raise(PipeError::InvalidPipe);
        return false;
    }
    if st.reader.is_some() || !st.scopes.quiescent() {
        let site = ier!();
        st.condemn(site);
        slot.raise(site);
        return false;
    }
    st.tag = Tag::Defunct {
        file: file!(),
        line: line!(),
    };
    st.result = None;
    st.status = None;
    true
}

/// Hand-over-hand climb up the tether chain, holding at most two locks
/// and always acquiring the drain before releasing the source.
///
/// The probe inspects each successive drain together with the depth at
/// which the previous link was tethered; returning `Some` stops the walk.
/// A source that has itself yielded or been killed short-circuits to 1
/// before the first step. Tolerates concurrent tethering and untethering
/// of any link.
fn climb<F>(source: &Arc<PipeCore>, slot: &mut ErrorSlot, mut probe: F) -> u32
where
    F: FnMut(&Arc<PipeCore>, &PipeState, usize) -> Result<Option<u32>, PipeError>,
{
    let mut cur = source.clone();
    let mut guard = cur.state.lock_arc();
    if !guard.live() {
        slot.raise(PipeError::InvalidPipe);
        return 0;
    }
    if cur.yielded.load(Ordering::Acquire) || guard.killed {
        return 1;
    }
    loop {
        let Some(reader) = guard.reader.as_ref() else {
            return 0;
        };
        let depth = guard.depth;
        let Some(drain) = reader.drain.upgrade() else {
            slot.raise(ier!());
            return 0;
        };
        let next = drain.state.lock_arc();
        drop(guard);
        cur = drain;
        guard = next;
        if !guard.live() {
            slot.raise(PipeError::InvalidPipe);
            return 0;
        }
        match probe(&cur, &guard, depth) {
            Ok(Some(v)) => return v,
            Ok(None) => {}
            Err(e) => {
                slot.raise(e);
                return 0;
            }
        }
    }
}

/// True if the source, or any drain above it, has yielded or been killed.
pub(crate) fn heritably_killed_or_yielded(source: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
    climb(source, slot, |drain, st, _| {
        Ok(
            if drain.yielded.load(Ordering::Acquire) || st.killed {
                Some(1)
            } else {
                None
            },
        )
    }) != 0
}

/// Truncation level inherited through the tether chain. At each drain the
/// frame consulted is the one at the source's recorded depth, so a
/// truncation request propagates only down the scope frame that owns the
/// source, never across sibling scopes.
pub(crate) fn heritably_truncated(source: &Arc<PipeCore>, slot: &mut ErrorSlot) -> u32 {
    climb(source, slot, |_, st, depth| {
        if st.scopes.level() < depth {
            return Err(ier!());
        }
        let frame = st.scopes.frame_at(depth).ok_or(ier!())?;
        Ok(if frame.truncation > 0 {
            Some(frame.truncation)
        } else {
            None
        })
    })
}
