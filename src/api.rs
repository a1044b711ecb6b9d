use crate::context::{current_context, current_or_new_context};
use crate::error::{ErrorSlot, PipeError, deadlocked, ier};
use crate::pipe::{
    PipeCore, PipeValue, heritably_killed_or_yielded, heritably_truncated, new_pipe, retired,
};
use crate::plumbing::{descendants_killed, descendants_untethered, killable, tethered, untethered};
use crate::protocol::{tethered_read, untethered_read};
use crate::runtime;
use crate::scope::{drained_by, scope_entered, scope_exited};
use crate::sync::{HandleSlot, ThreadSpec, Work, launch};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Handle to one worker's single-use result.
///
/// A pipe is created tethered to the opening thread, may be untethered
/// and re-tethered to pass ownership around, and is reclaimed by the
/// `read` that consumes its result or by a kill. Operations on a pipe
/// that has already been reclaimed fail with [`PipeError::InvalidPipe`].
pub struct Pipe(pub(crate) Arc<PipeCore>);

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("yielded", &self.0.yielded.load(Ordering::Acquire))
            .finish()
    }
}

/// Initialize the runtime on first use and refuse to coordinate once the
/// shutdown protocol has been sabotaged.
fn entry() -> Result<(), PipeError> {
    runtime::global();
    if deadlocked() { Err(ier!()) } else { Ok(()) }
}

/// Screen a prospective drain: it must be live, must not have yielded,
/// and must not be killed anywhere up its tether chain.
fn admissible_drain(d: &Arc<PipeCore>) -> Result<(), PipeError> {
    {
        let st = d.state.lock();
        if !st.live() {
            return Err(ier!());
        }
    }
    if d.yielded.load(Ordering::Acquire) {
        return Err(ier!());
    }
    let mut slot = ErrorSlot::new();
    if heritably_killed_or_yielded(d, &mut slot) {
        return Err(slot.take().unwrap_or(PipeError::Killed));
    }
    slot.ok()
}

/// Spawn a worker tethered to the calling thread and return its pipe.
///
/// The worker's `Ok` value is delivered by [`Pipe::read`]; an `Err`
/// becomes the pipe's status and is surfaced by the read instead. Fails
/// with [`PipeError::Killed`], spawning nothing, when the caller is
/// already killed somewhere up its chain.
pub fn open<F, T>(worker: F) -> Result<Pipe, PipeError>
where
    F: FnOnce() -> Result<T, PipeError> + Send + 'static,
    T: Any + Send,
{
    entry()?;
    let mut slot = ErrorSlot::new();
    let Some(drain) = current_or_new_context(&mut slot) else {
        return Err(slot.take().unwrap_or(ier!()));
    };
    admissible_drain(&drain)?;
    let source = new_pipe();
    if !tethered(&source, &drain, &mut slot) {
        return Err(slot.take().unwrap_or(ier!()));
    }
    let spec = ThreadSpec {
        pipe: Some(source.clone()),
        work: Work::Operate(Box::new(move || worker().map(|v| Box::new(v) as PipeValue))),
        handle: HandleSlot::new(),
    };
    if let Err(e) = launch(spec) {
        let mut cleanup = ErrorSlot::new();
        if untethered(&source, &mut cleanup) {
            source.state.lock().zombie = true;
            runtime::global().pool.unpool(&source, &mut cleanup);
        }
        if let Some(residue) = cleanup.take() {
            runtime::global().ledger.record(residue);
        }
        return Err(e);
    }
    Ok(Pipe(source))
}

/// Spawn a fire-and-forget worker. No pipe is returned; the worker's pipe
/// is reclaimed automatically when it finishes, and `sync` (or process
/// exit) still waits for it.
pub fn send<F>(mutator: F) -> Result<(), PipeError>
where
    F: FnOnce() + Send + 'static,
{
    entry()?;
    if let Some(d) = current_context() {
        admissible_drain(&d)?;
    }
    let source = new_pipe();
    let spec = ThreadSpec {
        pipe: Some(source.clone()),
        work: Work::Mutate(Box::new(mutator)),
        handle: HandleSlot::new(),
    };
    if let Err(e) = launch(spec) {
        let mut cleanup = ErrorSlot::new();
        source.state.lock().zombie = true;
        retired(&source, &mut cleanup);
        if let Some(residue) = cleanup.take() {
            runtime::global().ledger.record(residue);
        }
        return Err(e);
    }
    Ok(())
}

impl Pipe {
    /// Block until the worker yields, deliver its result, and reclaim the
    /// pipe. From a managed thread the wait is interruptible by a kill of
    /// the caller, which surfaces as [`PipeError::Killed`]; from an
    /// unmanaged thread the pipe must be untethered first.
    pub fn read(&self) -> Result<PipeValue, PipeError> {
        entry()?;
        let mut slot = ErrorSlot::new();
        match current_context() {
            None => {
                let value = untethered_read(&self.0, &mut slot);
                slot.finish(value)
            }
            Some(drain) => {
                if !tethered(&self.0, &drain, &mut slot) {
                    return Err(slot.take().unwrap_or(ier!()));
                }
                let value = tethered_read(&self.0, &mut slot);
                slot.finish(value)
            }
        }
    }

    /// Like [`read`](Self::read), downcasting the result to `T`.
    pub fn read_as<T: Any>(&self) -> Result<T, PipeError> {
        let value = self.read()?;
        value
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| PipeError::InvalidPipe)
    }

    /// Non-blocking check: would a read still have to wait?
    pub fn busy(&self) -> Result<bool, PipeError> {
        entry()?;
        let st = self.0.state.lock();
        if !st.live() {
            return Err(PipeError::InvalidPipe);
        }
        Ok(!self.0.yielded.load(Ordering::Acquire))
    }

    /// Ask the worker for a partial result. Only the pipe's drain may
    /// ask; the worker observes the request by polling [`truncated`].
    /// The request count saturates rather than wrapping.
    pub fn truncate(&self) -> Result<(), PipeError> {
        entry()?;
        {
            let st = self.0.state.lock();
            if !st.live() {
                return Err(PipeError::InvalidPipe);
            }
        }
        let Some(drain) = current_context() else {
            return Ok(());
        };
        if !drained_by(&self.0, &drain) {
            return Err(PipeError::NotDrain);
        }
        let mut st = self.0.state.lock();
        if !st.live() {
            return Err(PipeError::InvalidPipe);
        }
        let frame = st.scopes.top_mut();
        frame.truncation = frame.truncation.saturating_add(1);
        Ok(())
    }

    /// Tell the worker its result will be ignored and sever it from its
    /// drain. Cooperative: the worker keeps running until it observes
    /// [`killed`] or finishes on its own; the pipe is reclaimed either
    /// way.
    pub fn kill(&self) -> Result<(), PipeError> {
        entry()?;
        let mut slot = ErrorSlot::new();
        if killable(&self.0, &mut slot) {
            slot.ok()
        } else {
            Err(slot.take().unwrap_or(ier!()))
        }
    }

    /// Make the pipe independent of its drain: it survives the drain's
    /// exit and stays readable by whoever tethers it next (or by an
    /// unmanaged thread).
    pub fn untether(&self) -> Result<(), PipeError> {
        entry()?;
        let mut slot = ErrorSlot::new();
        if untethered(&self.0, &mut slot) {
            slot.ok()
        } else {
            Err(slot.take().unwrap_or(ier!()))
        }
    }

    /// Tether an untethered pipe to the calling thread, which makes it
    /// visible to this thread's [`select`] and [`read`].
    pub fn tether(&self) -> Result<(), PipeError> {
        entry()?;
        let mut slot = ErrorSlot::new();
        let Some(drain) = current_or_new_context(&mut slot) else {
            return Err(slot.take().unwrap_or(ier!()));
        };
        admissible_drain(&drain)?;
        if tethered(&self.0, &drain, &mut slot) {
            slot.ok()
        } else {
            Err(slot.take().unwrap_or(ier!()))
        }
    }
}

/// Would [`select`] have to wait? True only when the current scope has
/// running sources and no finished one ready.
pub fn blocked() -> Result<bool, PipeError> {
    entry()?;
    let Some(d) = current_context() else {
        return Ok(false);
    };
    let st = d.state.lock();
    if !st.live() {
        return Err(ier!());
    }
    let frame = st.scopes.top();
    Ok(frame.finishers.is_empty() && !frame.blockers.is_empty())
}

/// Next finished source in the caller's current scope, in yield order.
///
/// Blocks while sources are still running and none has finished; returns
/// `Ok(None)` once the scope has nothing left to wait for. A kill of the
/// caller interrupts the wait with [`PipeError::Killed`]. The returned
/// pipe comes back untethered; reading it from this thread re-tethers it
/// transparently.
pub fn select() -> Result<Option<Pipe>, PipeError> {
    enum Outcome {
        Killed,
        Taken(crate::list::Entry),
        Empty,
    }
    entry()?;
    let Some(d) = current_context() else {
        return Ok(None);
    };
    let outcome = {
        let mut ds = d.state.lock();
        if !ds.live() {
            return Err(ier!());
        }
        loop {
            if ds.killed {
                break Outcome::Killed;
            }
            if let Some(entry) = ds.scopes.top_mut().finishers.dequeue() {
                break Outcome::Taken(entry);
            }
            if ds.scopes.top().blockers.is_empty() {
                break Outcome::Empty;
            }
            d.progress.wait(&mut ds);
        }
    };
    match outcome {
        Outcome::Killed => Err(PipeError::Killed),
        Outcome::Empty => Ok(None),
        Outcome::Taken(entry) => {
            // complete the bilateral delist: the drain-side entry is out,
            // now clear the source's reader slot
            let mut ss = entry.pipe.state.lock();
            match ss.reader.as_ref() {
                Some(r) if r.link == entry.link => ss.reader = None,
                _ => {
                    let site = ier!();
                    ss.condemn(site);
                    return Err(site);
                }
            }
            drop(ss);
            Ok(Some(Pipe(entry.pipe)))
        }
    }
}

/// Ask every source tethered in the caller's current scope for a partial
/// result. Saturating, never an error for workers that already finished.
pub fn truncate_all() -> Result<(), PipeError> {
    entry()?;
    let Some(d) = current_context() else {
        return Ok(());
    };
    let mut st = d.state.lock();
    if !st.live() {
        return Err(ier!());
    }
    let frame = st.scopes.top_mut();
    frame.truncation = frame.truncation.saturating_add(1);
    Ok(())
}

/// Truncation level requested of the calling worker, directly or through
/// any drain above it. Zero means no request.
pub fn truncated() -> Result<u32, PipeError> {
    entry()?;
    let Some(source) = current_context() else {
        return Err(PipeError::Unmanaged);
    };
    let own = {
        let st = source.state.lock();
        if !st.live() {
            return Err(ier!());
        }
        st.scopes.top().truncation
    };
    if own > 0 {
        return Ok(own);
    }
    let mut slot = ErrorSlot::new();
    let inherited = heritably_truncated(&source, &mut slot);
    slot.finish(Some(inherited))
}

/// Kill every source tethered in the caller's current scope: blockers are
/// killed and untethered, finished results are discarded. Idempotent.
pub fn kill_all() -> Result<(), PipeError> {
    entry()?;
    let Some(d) = current_context() else {
        return Ok(());
    };
    let mut slot = ErrorSlot::new();
    // a placeholder sheds its flag for the duration of the cascade so the
    // pool cannot reclaim it out from under its own kill
    let was_placeholder = {
        let mut st = d.state.lock();
        if !st.live() {
            return Err(ier!());
        }
        let w = st.placeholder;
        if w {
            st.placeholder = false;
        }
        w
    };
    let ok = descendants_killed(&d, &mut slot);
    if was_placeholder {
        d.state.lock().placeholder = true;
        runtime::global().pool.unpool(&d, &mut slot);
    }
    if ok {
        slot.ok()
    } else {
        Err(slot.take().unwrap_or(ier!()))
    }
}

/// Has the calling worker been told its result will be ignored?
pub fn killed() -> Result<bool, PipeError> {
    entry()?;
    let Some(source) = current_context() else {
        return Err(PipeError::Unmanaged);
    };
    let st = source.state.lock();
    if !st.live() {
        return Err(ier!());
    }
    Ok(st.killed)
}

/// Restrict attention to pipes opened subsequently: `select`, `blocked`,
/// and `truncate_all` act on the innermost scope only.
pub fn enter_scope() -> Result<(), PipeError> {
    entry()?;
    let mut slot = ErrorSlot::new();
    let Some(p) = current_or_new_context(&mut slot) else {
        return Err(slot.take().unwrap_or(ier!()));
    };
    admissible_drain(&p)?;
    if scope_entered(&p, &mut slot) {
        slot.ok()
    } else {
        Err(slot.take().unwrap_or(ier!()))
    }
}

/// Resume the enclosing attention span. Sources opened in the exited
/// scope and not yet read continue untethered as root-pool orphans.
pub fn exit_scope() -> Result<(), PipeError> {
    entry()?;
    let Some(p) = current_context() else {
        return Err(PipeError::ScopeUnderflow);
    };
    {
        let st = p.state.lock();
        if !st.live() {
            return Err(ier!());
        }
        if st.scopes.level() == 0 {
            return Err(PipeError::ScopeUnderflow);
        }
    }
    let mut slot = ErrorSlot::new();
    if !descendants_untethered(&p, &mut slot) || !scope_exited(&p, &mut slot) {
        return Err(slot.take().unwrap_or(ier!()));
    }
    runtime::global().pool.unpool(&p, &mut slot);
    slot.ok()
}

/// Block until no thread created by this library remains. Terminates the
/// shutdown relay chain; also runs from the process-exit handler.
pub fn sync() -> Result<(), PipeError> {
    entry()?;
    let mut slot = ErrorSlot::new();
    runtime::global().sync.synchronize(&mut slot);
    slot.ok()
}
