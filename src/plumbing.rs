use crate::context::current_context;
use crate::error::{ErrorSlot, PipeError, ier};
use crate::list::{Entry, LinkId};
use crate::pipe::{PipeCore, Reader, retired};
use crate::runtime;
use crate::scope::drained_by_locked;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Tether a source `s` to a drain `d` if it isn't already.
///
/// A source that has yielded goes straight into the drain's finishers
/// queue; a running one joins the blockers. Both locks are needed, source
/// first. A source that was sitting in the root pool is taken out on the
/// way.
pub(crate) fn tethered(s: &Arc<PipeCore>, d: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
    let ok = tether_under_locks(s, d, slot);
    runtime::global().pool.displace(s, slot);
    ok
}

fn tether_under_locks(s: &Arc<PipeCore>, d: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
    if Arc::ptr_eq(s, d) {
        slot.raise(ier!());
        return false;
    }
    let mut ss = s.state.lock();
    if !ss.live() {
        slot.raise(PipeError::InvalidPipe);
        return false;
    }
    if ss.reader.is_some() {
        if drained_by_locked(&ss, d) {
            return true;
        }
        slot.raise(PipeError::NotDrain);
        return false;
    }
    if ss.killed {
        slot.raise(ier!());
        return false;
    }
    let mut ds = d.state.lock();
    if !ds.live() {
        slot.raise(PipeError::InvalidPipe);
        return false;
    }
    let link = LinkId::fresh();
    let level = ds.scopes.level();
    let entry = Entry {
        pipe: s.clone(),
        link,
    };
    if s.yielded.load(Ordering::Acquire) {
        ds.scopes.top_mut().finishers.enqueue(entry);
    } else {
        ds.scopes.top_mut().blockers.push(entry);
    }
    ss.reader = Some(Reader {
        drain: Arc::downgrade(d),
        link,
    });
    ss.depth = level;
    true
}

/// Separate a possibly running source from its drain.
///
/// Only the drain itself, at the scope level the tether was made at, may
/// untether; anything else is `NotDrain`. The source ends up in the root
/// pool (or retired outright), and a drain left childless may itself be
/// reclaimed if it is a spent placeholder.
pub(crate) fn untethered(s: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
    {
        let ss = s.state.lock();
        if !ss.live() {
            slot.raise(PipeError::InvalidPipe);
            return false;
        }
        if ss.reader.is_none() {
            drop(ss);
            return runtime::global().pool.pooled(s, slot);
        }
    }
    let Some(d) = current_context() else {
        slot.raise(PipeError::NotDrain);
        return false;
    };
    let mut ss = s.state.lock();
    let Some(r) = ss.reader.as_ref() else {
        // untethered concurrently in the window above
        drop(ss);
        return runtime::global().pool.pooled(s, slot);
    };
    if !r.is(&d) {
        slot.raise(PipeError::NotDrain);
        return false;
    }
    let (link, depth) = (r.link, ss.depth);
    let mut ds = d.state.lock();
    if !ds.live() {
        slot.raise(PipeError::InvalidPipe);
        return false;
    }
    if ds.scopes.level() != depth {
        slot.raise(PipeError::NotDrain);
        return false;
    }
    let frame = ds.scopes.top_mut();
    let entry = match frame.blockers.sever(link) {
        Some(e) => Some(e),
        None => frame.finishers.sever(link),
    };
    match entry {
        Some(e) if Arc::ptr_eq(&e.pipe, s) => {}
        _ => {
            let site = ier!();
            ss.condemn(site);
            ds.condemn(site);
            slot.raise(site);
            return false;
        }
    }
    ss.reader = None;
    drop(ds);
    drop(ss);
    let pool = &runtime::global().pool;
    pool.unpool(&d, slot);
    pool.pooled(s, slot)
}

/// Untether every blocker and finisher in the top scope frame of `p`,
/// turning residual children into root-pool orphans. Runs in `p`'s own
/// context.
pub(crate) fn descendants_untethered(p: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
    loop {
        let child = {
            let st = p.state.lock();
            if !st.live() {
                slot.raise(PipeError::InvalidPipe);
                return false;
            }
            let frame = st.scopes.top();
            frame
                .finishers
                .first()
                .or_else(|| frame.blockers.first())
                .map(|e| e.pipe.clone())
        };
        match child {
            None => return true,
            Some(c) => {
                if !untethered(&c, slot) {
                    return false;
                }
            }
        }
    }
}

/// Kill and untether a pipe. The progress signal interrupts any select or
/// tethered read the dying pipe is blocked in; the untether completes
/// even if the pipe has already yielded.
pub(crate) fn killable(s: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
    {
        let mut ss = s.state.lock();
        if !ss.live() {
            slot.raise(PipeError::InvalidPipe);
            return false;
        }
        ss.killed = true;
        if !s.yielded.load(Ordering::Acquire) {
            s.progress.notify_one();
        }
    }
    untethered(s, slot)
}

fn blockers_killed(d: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
    {
        let st = d.state.lock();
        if !st.live() {
            slot.raise(PipeError::InvalidPipe);
            return false;
        }
        // placeholders go through kill_all's flag dance, never here, and
        // a drain that already yielded has no business killing anything
        if st.placeholder || d.yielded.load(Ordering::Acquire) {
            slot.raise(ier!());
            return false;
        }
    }
    loop {
        // the drain lock is dropped across each kill so the dying child
        // can take its own locks in source-before-drain order
        let next = {
            let st = d.state.lock();
            st.scopes.top().blockers.first().map(|e| e.pipe.clone())
        };
        match next {
            None => return true,
            Some(s) => {
                if !killable(&s, slot) {
                    return false;
                }
            }
        }
    }
}

/// Kill every blocker, then retire every finisher, in the drain's top
/// scope frame. Finishers' own descendants are already dead by induction,
/// so they retire directly. Runs in the drain's context; idempotent.
pub(crate) fn descendants_killed(d: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
    if !blockers_killed(d, slot) {
        return false;
    }
    loop {
        let entry = {
            let mut st = d.state.lock();
            if !st.live() {
                slot.raise(PipeError::InvalidPipe);
                return false;
            }
            st.scopes.top_mut().finishers.dequeue()
        };
        let Some(e) = entry else {
            return true;
        };
        {
            let mut cs = e.pipe.state.lock();
            if cs.pooled {
                let site = ier!();
                cs.condemn(site);
                slot.raise(site);
                return false;
            }
            match cs.reader.as_ref() {
                Some(r) if r.link == e.link => cs.reader = None,
                _ => {
                    let site = ier!();
                    cs.condemn(site);
                    slot.raise(site);
                    return false;
                }
            }
        }
        if !retired(&e.pipe, slot) {
            return false;
        }
    }
}

/// Retire an untethered, unpooled pipe, taking note of its error status.
/// Used for send-style workers whose result nobody will ever read.
pub(crate) fn acknowledged(s: &Arc<PipeCore>, slot: &mut ErrorSlot) -> bool {
    {
        let st = s.state.lock();
        if !st.live() {
            slot.raise(PipeError::InvalidPipe);
            return false;
        }
        if let Some(status) = st.status {
            slot.raise(status);
        }
    }
    descendants_killed(s, slot) && retired(s, slot)
}
