use crate::error::{ErrorSlot, PipeError, deadlocked, ier, mark_deadlocked};
use crate::pipe::{PipeCore, PipeValue};
use crate::protocol::manager;
use crate::runtime;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use uuid::Uuid;

/// What a spawned thread runs: a worker whose result flows back through
/// its pipe, or a fire-and-forget mutator.
pub(crate) enum Work {
    Operate(Box<dyn FnOnce() -> Result<PipeValue, PipeError> + Send>),
    Mutate(Box<dyn FnOnce() + Send>),
}

/// Everything handed to a worker's start routine.
pub(crate) struct ThreadSpec {
    pub(crate) pipe: Option<Arc<PipeCore>>,
    pub(crate) work: Work,
    pub(crate) handle: Arc<HandleSlot>,
}

/// Hand-off cell for a worker's own join handle. The spawner deposits the
/// handle right after thread creation; the worker collects it on its way
/// into the relay race, where the next finisher will join it.
pub(crate) struct HandleSlot {
    cell: Mutex<Option<JoinHandle<()>>>,
    ready: Condvar,
}

impl HandleSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            cell: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn put(&self, handle: JoinHandle<()>) {
        let mut cell = self.cell.lock();
        *cell = Some(handle);
        self.ready.notify_one();
    }

    pub(crate) fn wait_take(&self) -> Option<JoinHandle<()>> {
        let mut cell = self.cell.lock();
        while cell.is_none() {
            self.ready.wait(&mut cell);
        }
        cell.take()
    }
}

struct RunnerState {
    /// At least one thread has been created since the last synchronize.
    starting: bool,
    /// Threads not yet joined by the relay race or synchronize.
    runners: usize,
    /// Finishing threads queued to be joined.
    finishers: usize,
    /// Handle of the thread to be joined next.
    finishing: Option<JoinHandle<()>>,
}

/// Start-registration handshake plus the relay-race shutdown chain. The
/// runner and starter locks are leaves: never held across a pipe lock.
pub(crate) struct SyncState {
    runner: Mutex<RunnerState>,
    finished: Condvar,
    last_runner: Condvar,
    starters: Mutex<usize>,
    started: Condvar,
}

impl SyncState {
    pub(crate) fn new() -> Self {
        Self {
            runner: Mutex::new(RunnerState {
                starting: false,
                runners: 0,
                finishers: 0,
                finishing: None,
            }),
            finished: Condvar::new(),
            last_runner: Condvar::new(),
            starters: Mutex::new(0),
            started: Condvar::new(),
        }
    }

    /// Called by a new thread's start routine: bump the runner count and
    /// assert the thread has started. The broadcast fires only on the
    /// 0→1 transition; several spawners may be waiting and any of them
    /// may be racing another thread's registration.
    pub(crate) fn registered(&self) -> bool {
        if deadlocked() {
            return false;
        }
        {
            let mut rs = self.runner.lock();
            rs.starting = true;
            match rs.runners.checked_add(1) {
                Some(n) => rs.runners = n,
                None => {
                    mark_deadlocked();
                    return false;
                }
            }
        }
        {
            let mut count = self.starters.lock();
            match count.checked_add(1) {
                Some(n) => {
                    *count = n;
                    if n == 1 {
                        self.started.notify_all();
                    }
                }
                None => {
                    mark_deadlocked();
                    return false;
                }
            }
        }
        !deadlocked()
    }

    /// Called by a spawner after creating a thread: wait until some new
    /// thread has registered, so a worker cannot be lost to the process
    /// exiting between thread creation and its start routine running.
    pub(crate) fn started(&self) -> bool {
        if deadlocked() {
            return false;
        }
        let mut count = self.starters.lock();
        loop {
            if deadlocked() {
                return false;
            }
            if *count > 0 {
                break;
            }
            self.started.wait(&mut count);
        }
        *count -= 1;
        true
    }

    /// One leg of the shutdown chain, run by every worker on its way out.
    ///
    /// Join every previously queued finisher (releasing the lock across
    /// each join so that thread can run to completion), then queue this
    /// thread's own handle and wait to be relieved by the next finisher
    /// or by `synchronize`. The wait costs nothing observable: user code
    /// in this thread has already yielded.
    pub(crate) fn relay_race(&self, me: Option<JoinHandle<()>>, slot: &mut ErrorSlot) {
        if deadlocked() {
            return;
        }
        let mut rs = self.runner.lock();
        while rs.finishers > 0 {
            rs.finishers -= 1;
            let Some(predecessor) = rs.finishing.take() else {
                mark_deadlocked();
                slot.raise(ier!());
                return;
            };
            self.finished.notify_one();
            drop(rs);
            if predecessor.join().is_err() {
                slot.raise(ier!());
            }
            if deadlocked() {
                return;
            }
            rs = self.runner.lock();
        }
        let Some(me) = me else {
            mark_deadlocked();
            slot.raise(ier!());
            return;
        };
        rs.finishers += 1;
        rs.finishing = Some(me);
        if rs.runners == 0 {
            mark_deadlocked();
            slot.raise(ier!());
            return;
        }
        rs.runners -= 1;
        if rs.runners == 0 {
            // more than one synchronize may be waiting
            self.last_runner.notify_all();
        }
        if !deadlocked() {
            self.finished.wait(&mut rs);
        }
    }

    /// Block until no library-created thread remains, then join the final
    /// finisher. Terminates the relay chain; called from `sync()` and
    /// from the exit handler. Concurrent callers all wait out the running
    /// threads; whichever gets the final handle performs the join.
    pub(crate) fn synchronize(&self, slot: &mut ErrorSlot) {
        if deadlocked() {
            return;
        }
        let mut rs = self.runner.lock();
        if !rs.starting && rs.runners == 0 && rs.finishers == 0 {
            return;
        }
        rs.starting = false;
        while rs.runners > 0 {
            if deadlocked() {
                return;
            }
            self.last_runner.wait(&mut rs);
        }
        if rs.finishers == 0 {
            return;
        }
        rs.finishers = 0;
        let handle = rs.finishing.take();
        self.finished.notify_one();
        drop(rs);
        match handle {
            Some(h) => {
                if h.join().is_err() {
                    slot.raise(ier!());
                }
            }
            None => {
                mark_deadlocked();
                slot.raise(ier!());
            }
        }
    }
}

/// Spawn a worker thread running the manager, deposit its join handle,
/// and wait for the start handshake. Thread creation failures pass
/// `EAGAIN`/`ENOMEM` through unchanged.
pub(crate) fn launch(spec: ThreadSpec) -> Result<(), PipeError> {
    let rt = runtime::global();
    let name = format!(
        "{}-{}",
        rt.config.thread_name_prefix,
        Uuid::new_v4().simple()
    );
    let mut builder = thread::Builder::new().name(name);
    if let Some(bytes) = rt.config.stack_size {
        builder = builder.stack_size(bytes);
    }
    let handle_slot = spec.handle.clone();
    match builder.spawn(move || manager(spec)) {
        Ok(handle) => {
            handle_slot.put(handle);
            if rt.sync.started() { Ok(()) } else { Err(ier!()) }
        }
        Err(e) => {
            tracing::error!("failed to spawn worker thread: {e}");
            Err(match e.raw_os_error() {
                Some(code) if code == libc::EAGAIN || code == libc::ENOMEM => PipeError::Os(code),
                _ => ier!(),
            })
        }
    }
}
