use crate::error::ErrorSlot;
use crate::pipe::{PipeCore, new_pipe, retired};
use crate::runtime;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    /// The pipe this thread acts through, if any. Managed workers are
    /// bound by their start routine; unmanaged threads get a placeholder
    /// on first need.
    static CURSOR: RefCell<Option<Arc<PipeCore>>> = const { RefCell::new(None) };
}

pub(crate) fn current_context() -> Option<Arc<PipeCore>> {
    CURSOR.with(|c| c.borrow().clone())
}

pub(crate) fn set_context(pipe: &Arc<PipeCore>) {
    CURSOR.with(|c| *c.borrow_mut() = Some(pipe.clone()));
}

pub(crate) fn clear_context() {
    CURSOR.with(|c| *c.borrow_mut() = None);
}

/// Return the pipe bound to this thread, or create one. A fresh context
/// is a placeholder: it stands in for an unmanaged thread, lives in the
/// root pool, and is reclaimed once childless.
pub(crate) fn current_or_new_context(slot: &mut ErrorSlot) -> Option<Arc<PipeCore>> {
    if let Some(existing) = current_context() {
        return Some(existing);
    }
    let fresh = new_pipe();
    fresh.state.lock().placeholder = true;
    if !runtime::global().pool.placed(&fresh, slot) {
        retired(&fresh, slot);
        return None;
    }
    set_context(&fresh);
    Some(fresh)
}
