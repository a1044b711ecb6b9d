use crate::context;
use crate::error::{ErrorSlot, PipeError, ier};
use crate::pipe::{PipeCore, retirable, retired};
use crate::protocol::untethered_read;
use crate::scope::vacate_scopes;
use parking_lot::Mutex;
use std::sync::Arc;

/// Process-wide list of root pipes: untethered workers awaiting a reader
/// and placeholders for unmanaged threads. Everything here is reclaimed
/// at the latest by the exit sweep.
///
/// Lock order: the pool lock is always taken before any pipe lock.
pub(crate) struct RootPool {
    members: Mutex<Vec<Arc<PipeCore>>>,
}

impl RootPool {
    pub(crate) fn new() -> Self {
        Self {
            members: Mutex::new(Vec::new()),
        }
    }

    /// Insert unconditionally. Idempotent for members.
    pub(crate) fn placed(&self, d: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
        let mut members = self.members.lock();
        let mut st = d.state.lock();
        if !st.live() {
            slot.raise(PipeError::InvalidPipe);
            return false;
        }
        if !st.pooled {
            st.pooled = true;
            members.push(d.clone());
        }
        true
    }

    /// Remove unconditionally, whether or not present.
    pub(crate) fn displace(&self, p: &Arc<PipeCore>, slot: &mut ErrorSlot) {
        let mut members = self.members.lock();
        let mut st = p.state.lock();
        if !st.live() {
            slot.raise(PipeError::InvalidPipe);
            return;
        }
        if st.pooled {
            if let Some(at) = members.iter().position(|m| Arc::ptr_eq(m, p)) {
                members.swap_remove(at);
            }
            st.pooled = false;
        }
    }

    /// Insert `d` if it is not retirable, otherwise retire it instead.
    pub(crate) fn pooled(&self, d: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
        if !retirable(d) {
            return self.placed(d, slot);
        }
        self.displace(d, slot);
        retired(d, slot)
    }

    /// Retire `p` if it has become retirable, removing it from the pool
    /// first. A placeholder that is the calling thread's own context also
    /// drops the thread-local binding.
    pub(crate) fn unpool(&self, p: &Arc<PipeCore>, slot: &mut ErrorSlot) {
        if !retirable(p) {
            return;
        }
        let clears_context = {
            let st = p.state.lock();
            st.placeholder
                && context::current_context().is_some_and(|c| Arc::ptr_eq(&c, p))
        };
        self.displace(p, slot);
        if retired(p, slot) && clears_context {
            context::clear_context();
        }
    }

    /// Exit sweep: reclaim every root pipe. Still-running untethered
    /// workers are read to completion; placeholders are killed once so
    /// their descendants can notice, then given another pass. A pass that
    /// changes nothing means something can never become retirable, which
    /// is reported rather than spun on.
    pub(crate) fn eradicate(&self, slot: &mut ErrorSlot) {
        while !slot.is_set() {
            let batch: Vec<Arc<PipeCore>> = std::mem::take(&mut *self.members.lock());
            if batch.is_empty() {
                return;
            }
            let mut progressed = false;
            for p in batch {
                vacate_scopes(&p, slot);
                {
                    let mut st = p.state.lock();
                    if !st.live() {
                        slot.raise(PipeError::InvalidPipe);
                        continue;
                    }
                    if st.reader.is_some() {
                        slot.raise(ier!());
                        continue;
                    }
                    st.pooled = false;
                }
                if retirable(&p) {
                    if retired(&p, slot) {
                        progressed = true;
                    }
                    continue;
                }
                let deferred = {
                    let mut st = p.state.lock();
                    if st.placeholder && !st.killed {
                        st.killed = true;
                        progressed = true;
                        true
                    } else {
                        st.placeholder
                    }
                };
                if deferred {
                    self.placed(&p, slot);
                    continue;
                }
                // an untethered worker still running: wait it out and
                // reclaim it; an abandoned result is a reportable leak
                if untethered_read(&p, slot).is_some() {
                    slot.raise(ier!());
                }
                progressed = true;
            }
            if !progressed {
                slot.raise(ier!());
                return;
            }
        }
    }
}
