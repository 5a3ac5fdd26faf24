//! The live-connection registry: weak handles to every Active connection,
//! iterated during event fanout.

use super::Connection;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Set of weak references to active connections. Entries are added when a
/// connection activates; expired entries are swept opportunistically when a
/// connection is destroyed.
#[derive(Default)]
pub struct Registry {
    conns: RefCell<Vec<Weak<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, conn: Weak<Connection>) {
        self.conns.borrow_mut().push(conn);
    }

    /// Upgrades every live handle. The returned snapshot is what a dispatch
    /// pass iterates, so connections activating mid-fanout do not observe the
    /// in-flight event.
    pub fn snapshot(&self) -> Vec<Rc<Connection>> {
        self.conns.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.conns
            .borrow()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn sweep(&self) {
        let mut conns = self.conns.borrow_mut();
        conns.retain(|w| w.strong_count() > 0);
        log::debug!("registry sweep: {} live connections", conns.len());
    }
}
