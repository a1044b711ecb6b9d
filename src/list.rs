use crate::pipe::PipeCore;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique token shared by the two ends of a complementary pair:
/// the drain-side list entry and the source's reader slot. Reciprocity
/// holds exactly when both ends carry the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkId(u64);

impl LinkId {
    pub(crate) fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One drain-side end of a tether: the source pipe plus the link token
/// pairing this entry with the source's reader slot.
pub(crate) struct Entry {
    pub(crate) pipe: Arc<PipeCore>,
    pub(crate) link: LinkId,
}

/// List of tethered sources held by one scope frame.
///
/// Used in two roles: as a blockers list (order irrelevant, entries are
/// pushed and severed by link) and as a finishers queue (strict FIFO in
/// yield order). Entries are unlinked by link id, never by position.
#[derive(Default)]
pub(crate) struct PipeList {
    items: VecDeque<Entry>,
}

impl PipeList {
    pub(crate) fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Prepend an entry (blockers role).
    pub(crate) fn push(&mut self, entry: Entry) {
        self.items.push_front(entry);
    }

    /// Append an entry (finishers role; preserves yield order).
    pub(crate) fn enqueue(&mut self, entry: Entry) {
        self.items.push_back(entry);
    }

    /// Remove and return the oldest entry, if any.
    pub(crate) fn dequeue(&mut self) -> Option<Entry> {
        self.items.pop_front()
    }

    pub(crate) fn first(&self) -> Option<&Entry> {
        self.items.front()
    }

    /// Remove the entry carrying `link`, wherever it sits in the list.
    pub(crate) fn sever(&mut self, link: LinkId) -> Option<Entry> {
        let at = self.items.iter().position(|e| e.link == link)?;
        self.items.remove(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::new_pipe;

    #[test]
    fn link_ids_are_unique() {
        let a = LinkId::fresh();
        let b = LinkId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn queue_role_is_fifo() {
        let mut list = PipeList::new();
        let links: Vec<LinkId> = (0..4).map(|_| LinkId::fresh()).collect();
        for &link in &links {
            list.enqueue(Entry {
                pipe: new_pipe(),
                link,
            });
        }
        for &link in &links {
            assert_eq!(list.dequeue().unwrap().link, link);
        }
        assert!(list.is_empty());
    }

    #[test]
    fn sever_removes_mid_list() {
        let mut list = PipeList::new();
        let links: Vec<LinkId> = (0..3).map(|_| LinkId::fresh()).collect();
        for &link in &links {
            list.push(Entry {
                pipe: new_pipe(),
                link,
            });
        }
        let taken = list.sever(links[1]).unwrap();
        assert_eq!(taken.link, links[1]);
        assert!(list.sever(links[1]).is_none());
        // the other two survive in order
        assert_eq!(list.dequeue().unwrap().link, links[2]);
        assert_eq!(list.dequeue().unwrap().link, links[0]);
        assert!(list.is_empty());
    }
}
