use crate::config::RuntimeConfig;
use crate::error::{ErrorSlot, Ledger, ier};
use crate::pool::RootPool;
use crate::sync::SyncState;
use std::sync::OnceLock;

/// Process-lifetime state: configuration, the root pool, the thread
/// synchronization counters, and the error ledger. Created on first use
/// by any public entry; the exit handler is registered at the same time.
pub(crate) struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) pool: RootPool,
    pub(crate) sync: SyncState,
    pub(crate) ledger: Ledger,
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

pub(crate) fn global() -> &'static Runtime {
    GLOBAL.get_or_init(|| {
        let rt = Runtime {
            config: RuntimeConfig::from_env(),
            pool: RootPool::new(),
            sync: SyncState::new(),
            ledger: Ledger::new(),
        };
        if unsafe { libc::atexit(teardown) } != 0 {
            rt.ledger.record(ier!());
        }
        rt
    })
}

/// Process-exit teardown: reclaim the root pipes, join every remaining
/// library thread through the relay chain, and dump the ledger. After
/// this returns, no thread the library created is still observable.
extern "C" fn teardown() {
    let Some(rt) = GLOBAL.get() else {
        return;
    };
    let mut slot = ErrorSlot::new();
    rt.pool.eradicate(&mut slot);
    rt.sync.synchronize(&mut slot);
    if let Some(err) = slot.take() {
        rt.ledger.record(err);
    }
    rt.ledger.report();
}
