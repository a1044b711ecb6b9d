use crate::context::{clear_context, current_context, set_context};
use crate::error::{ErrorSlot, PipeError, ier, mark_deadlocked};
use crate::pipe::{PipeCore, PipeState, PipeValue};
use crate::plumbing::{acknowledged, descendants_killed, killable};
use crate::runtime;
use crate::scope::{drained_by, vacate_scopes};
use crate::sync::{ThreadSpec, Work};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Read from a pipe that has no drain. There is no drain to interrupt the
/// wait, so the caller blocks until the worker yields, then takes the
/// result and reclaims the pipe.
pub(crate) fn untethered_read(s: &Arc<PipeCore>, slot: &mut ErrorSlot) -> Option<PipeValue> {
    let result = {
        let mut ss = s.state.lock();
        if !ss.live() {
            slot.raise(PipeError::InvalidPipe);
            return None;
        }
        if ss.reader.is_some() {
            // the pipe belongs to some drain; leave it intact for them
            slot.raise(PipeError::NotDrain);
            return None;
        }
        while !s.yielded.load(Ordering::Acquire) {
            s.termination.wait(&mut ss);
        }
        if let Some(status) = ss.status.take() {
            slot.raise(status);
        }
        ss.result.take()
    };
    if killable(s, slot) { result } else { None }
}

/// Read from a source whose drain is the calling thread. The wait is on
/// the drain's progress signal: any of the drain's sources may fire it,
/// hence the loop, and the drain being killed ends the wait with
/// `Killed`. The source is reclaimed unconditionally afterwards so the
/// drain never holds a dangling tether.
pub(crate) fn tethered_read(s: &Arc<PipeCore>, slot: &mut ErrorSlot) -> Option<PipeValue> {
    let Some(d) = current_context() else {
        slot.raise(PipeError::NotDrain);
        return None;
    };
    if !drained_by(s, &d) {
        slot.raise(PipeError::NotDrain);
        return None;
    }
    let killed = {
        let mut ds = d.state.lock();
        if !ds.live() {
            slot.raise(PipeError::InvalidPipe);
            return None;
        }
        loop {
            if s.yielded.load(Ordering::Acquire) {
                break false;
            }
            if ds.killed {
                break true;
            }
            d.progress.wait(&mut ds);
        }
    };
    let result = if killed {
        slot.raise(PipeError::Killed);
        None
    } else {
        let mut ss = s.state.lock();
        if let Some(status) = ss.status.take() {
            slot.raise(status);
        }
        ss.result.take()
    };
    if killable(s, slot) { result } else { None }
}

/// Drain-less yield: publish the flag, signal whoever may be blocked in
/// an untethered read, and park any accumulated library error in the
/// status field for that reader to find.
fn untethered_yield(s: &Arc<PipeCore>, ss: &mut PipeState, slot: &mut ErrorSlot) {
    s.yielded.store(true, Ordering::Release);
    s.termination.notify_one();
    if !ss.killed
        && ss.status.is_none()
        && let Some(e) = slot.take()
    {
        ss.status = Some(e);
    }
}

/// Tethered yield: move this source from the blockers of the owning scope
/// frame to its finishers (preserving yield order) and signal the drain's
/// progress. The owning frame is the one at the depth recorded when the
/// tether was made, which may sit below scopes the drain entered since.
fn tethered_yield(s: &Arc<PipeCore>, ss: &mut PipeState, slot: &mut ErrorSlot) {
    if ss.killed {
        slot.raise(ier!());
        return;
    }
    let (link, drain) = match ss.reader.as_ref() {
        Some(r) => match r.drain.upgrade() {
            Some(d) => (r.link, d),
            None => {
                slot.raise(ier!());
                return;
            }
        },
        None => {
            slot.raise(ier!());
            return;
        }
    };
    let mut ds = drain.state.lock();
    if !ds.live() {
        slot.raise(PipeError::InvalidPipe);
        return;
    }
    if ds.scopes.level() < ss.depth {
        let site = ier!();
        ss.condemn(site);
        slot.raise(site);
        return;
    }
    let Some(frame) = ds.scopes.frame_at_mut(ss.depth) else {
        slot.raise(ier!());
        return;
    };
    let Some(entry) = frame.blockers.sever(link) else {
        let site = ier!();
        ds.condemn(site);
        slot.raise(site);
        return;
    };
    frame.finishers.enqueue(entry);
    s.yielded.store(true, Ordering::Release);
    drain.progress.notify_one();
    if ss.status.is_none()
        && let Some(e) = slot.take()
    {
        ss.status = Some(e);
    }
}

/// Yield according to whichever protocol applies. Children must not
/// outlive their parent, so the descendants are killed first; the source
/// lock then pins the tethered/untethered distinction for the hand-off.
fn yield_pipe(source: &Arc<PipeCore>, slot: &mut ErrorSlot) {
    if !descendants_killed(source, slot) {
        return;
    }
    let mut ss = source.state.lock();
    if !ss.live() {
        slot.raise(PipeError::InvalidPipe);
        return;
    }
    if ss.killed || ss.reader.is_none() {
        untethered_yield(source, &mut ss, slot);
    } else {
        tethered_yield(source, &mut ss, slot);
    }
}

/// Start routine for every spawned worker: bind the context, register with
/// the start handshake, run the user closure, store its outcome, vacate
/// leftover scopes, yield (or self-acknowledge for send-style workers),
/// then take a leg in the relay race so the thread gets joined.
pub(crate) fn manager(spec: ThreadSpec) {
    let mut slot = ErrorSlot::new();
    let rt = runtime::global();
    let ThreadSpec { pipe, work, handle } = spec;
    match pipe {
        Some(s) => {
            set_context(&s);
            if rt.sync.registered() {
                match work {
                    Work::Operate(f) => {
                        let outcome = catch_unwind(AssertUnwindSafe(f));
                        {
                            let mut ss = s.state.lock();
                            match outcome {
                                Ok(Ok(value)) => ss.result = Some(value),
                                Ok(Err(status)) => ss.status = Some(status),
                                Err(_) => ss.status = Some(PipeError::Panicked),
                            }
                        }
                        vacate_scopes(&s, &mut slot);
                        yield_pipe(&s, &mut slot);
                    }
                    Work::Mutate(f) => {
                        if catch_unwind(AssertUnwindSafe(f)).is_err() {
                            slot.raise(PipeError::Panicked);
                        }
                        vacate_scopes(&s, &mut slot);
                        if !acknowledged(&s, &mut slot) {
                            mark_deadlocked();
                        }
                    }
                }
            }
            clear_context();
        }
        None => {
            mark_deadlocked();
            slot.raise(ier!());
        }
    }
    let me = handle.wait_take();
    rt.sync.relay_race(me, &mut slot);
    if let Some(err) = slot.take() {
        rt.ledger.record(err);
    }
}
