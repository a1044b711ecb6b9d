use crate::error::{ErrorSlot, PipeError, ier};
use crate::list::PipeList;
use crate::pipe::PipeCore;
use crate::plumbing::descendants_untethered;
use crate::runtime;
use std::sync::Arc;

/// One level of a pipe's attention stack: the sources still running, the
/// sources that have yielded (in yield order), and the truncation counter
/// inherited by every source tethered at this level.
pub(crate) struct ScopeFrame {
    pub(crate) truncation: u32,
    pub(crate) blockers: PipeList,
    pub(crate) finishers: PipeList,
}

impl ScopeFrame {
    fn new() -> Self {
        Self {
            truncation: 0,
            blockers: PipeList::new(),
            finishers: PipeList::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.blockers.is_empty() && self.finishers.is_empty()
    }
}

/// Per-pipe stack of scope frames. Index 0 is the sentinel frame every
/// pipe is born with; the scope level counts the frames above it, so the
/// frame that owns a source tethered at depth `d` is simply `frames[d]`.
pub(crate) struct ScopeStack {
    frames: Vec<ScopeFrame>,
}

impl ScopeStack {
    pub(crate) fn new() -> Self {
        Self {
            frames: vec![ScopeFrame::new()],
        }
    }

    pub(crate) fn level(&self) -> usize {
        self.frames.len() - 1
    }

    pub(crate) fn top(&self) -> &ScopeFrame {
        self.frames.last().expect("scope stack holds its sentinel")
    }

    pub(crate) fn top_mut(&mut self) -> &mut ScopeFrame {
        self.frames
            .last_mut()
            .expect("scope stack holds its sentinel")
    }

    pub(crate) fn frame_at(&self, depth: usize) -> Option<&ScopeFrame> {
        self.frames.get(depth)
    }

    pub(crate) fn frame_at_mut(&mut self, depth: usize) -> Option<&mut ScopeFrame> {
        self.frames.get_mut(depth)
    }

    fn push_frame(&mut self) {
        self.frames.push(ScopeFrame::new());
    }

    /// No enclosing frames and nothing left in the sentinel.
    pub(crate) fn quiescent(&self) -> bool {
        self.frames.len() == 1 && self.top().is_empty()
    }
}

/// Enter a local scope: subsequent opens, selects, and truncations apply
/// to the new top frame only.
pub(crate) fn scope_entered(p: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
    let mut st = p.state.lock();
    if !st.live() {
        slot.raise(PipeError::InvalidPipe);
        return false;
    }
    st.scopes.push_frame();
    true
}

/// Pop the top frame. Callers must have untethered any remaining sources
/// first; a populated frame or an attempt to pop the sentinel is an
/// internal error.
pub(crate) fn scope_exited(p: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
    let mut st = p.state.lock();
    if !st.live() {
        slot.raise(PipeError::InvalidPipe);
        return false;
    }
    if st.scopes.level() == 0 || !st.scopes.top().is_empty() {
        let site = ier!();
        st.condemn(site);
        slot.raise(site);
        return false;
    }
    st.scopes.frames.pop();
    true
}

pub(crate) fn scope_level(p: &Arc<PipeCore>) -> usize {
    p.state.lock().scopes.level()
}

/// True iff `d` is the drain of `s` in the drain's *current* scope.
/// Tethering is scope-sensitive: the same drain one scope deeper is not
/// the controlling drain.
pub(crate) fn drained_by(s: &Arc<PipeCore>, d: &Arc<PipeCore>) -> bool {
    let (is_reader, depth) = {
        let st = s.state.lock();
        match st.reader.as_ref() {
            Some(r) => (r.is(d), st.depth),
            None => return false,
        }
    };
    is_reader && depth == scope_level(d)
}

/// Variant for callers already holding the source lock; takes the drain's
/// lock briefly, respecting the source-before-drain order.
pub(crate) fn drained_by_locked(ss: &crate::pipe::PipeState, d: &Arc<PipeCore>) -> bool {
    match ss.reader.as_ref() {
        Some(r) => r.is(d) && ss.depth == scope_level(d),
        None => false,
    }
}

/// Exit every enclosed scope before a worker yields, untethering whatever
/// user code left behind. Open scopes at yield are a usage warning, not a
/// failure: the event is logged and ledgered but the yield proceeds.
pub(crate) fn vacate_scopes(s: &Arc<PipeCore>, slot: &mut ErrorSlot) {
    let mut warned = false;
    loop {
        let level = {
            let st = s.state.lock();
            if !st.live() {
                slot.raise(PipeError::InvalidPipe);
                return;
            }
            st.scopes.level()
        };
        if level == 0 {
            return;
        }
        if !warned {
            warned = true;
            tracing::warn!("worker yielded with {level} scopes still open");
            runtime::global().ledger.record(PipeError::ScopeNotExited);
        }
        if !descendants_untethered(s, slot) || !scope_exited(s, slot) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::new_pipe;

    #[test]
    fn sentinel_survives_enter_exit() {
        let p = new_pipe();
        let mut slot = ErrorSlot::new();
        assert_eq!(scope_level(&p), 0);
        assert!(scope_entered(&p, &mut slot));
        assert!(scope_entered(&p, &mut slot));
        assert_eq!(scope_level(&p), 2);
        assert!(scope_exited(&p, &mut slot));
        assert!(scope_exited(&p, &mut slot));
        assert_eq!(scope_level(&p), 0);
        // popping the sentinel is refused
        assert!(!scope_exited(&p, &mut slot));
        assert!(slot.is_set());
    }

    #[test]
    fn truncation_saturates() {
        let mut stack = ScopeStack::new();
        stack.top_mut().truncation = u32::MAX;
        stack.top_mut().truncation = stack.top().truncation.saturating_add(1);
        assert_eq!(stack.top().truncation, u32::MAX);
    }
}
