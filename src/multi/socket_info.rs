use crate::engine::{HandleId, PollInterest, SocketId, SocketToken};
use crate::reactor::SocketResource;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{trace, warn};

/// Bookkeeping for one socket opened on behalf of the engine.
///
/// `pending_*` is true exactly while a readiness wait for that direction is
/// outstanding on the reactor. `monitor_*` mirrors the interest the engine
/// last requested.
#[derive(Debug)]
pub(crate) struct SocketInfo {
    pub(crate) handle: Option<HandleId>,
    pub(crate) socket: Option<SocketResource>,
    pub(crate) token: Option<SocketToken>,
    pub(crate) pending_read_op: bool,
    pub(crate) pending_write_op: bool,
    pub(crate) monitor_read: bool,
    pub(crate) monitor_write: bool,
}

/// Actions needed to bring the reactor in line with a new interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct MonitorPlan {
    pub(crate) start_read: bool,
    pub(crate) start_write: bool,
    pub(crate) cancel: bool,
}

impl SocketInfo {
    pub(crate) fn new(handle: Option<HandleId>, socket: SocketResource) -> Self {
        Self {
            handle,
            socket: Some(socket),
            token: None,
            pending_read_op: false,
            pending_write_op: false,
            monitor_read: false,
            monitor_write: false,
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.socket.is_some()
    }

    /// Records the engine's interest and returns which waits to start or
    /// cancel. A released socket never starts a wait.
    pub(crate) fn set_monitor(&mut self, interest: PollInterest) -> MonitorPlan {
        self.monitor_read = interest.wants_read();
        self.monitor_write = interest.wants_write();

        let live = self.is_live();
        let idle = !self.monitor_read && !self.monitor_write;
        MonitorPlan {
            start_read: live && self.monitor_read && !self.pending_read_op,
            start_write: live && self.monitor_write && !self.pending_write_op,
            cancel: live && idle && (self.pending_read_op || self.pending_write_op),
        }
    }

    /// Whether a completed wait for the given direction should be re-armed.
    pub(crate) fn should_rearm(&self, read: bool) -> bool {
        if !self.is_live() {
            return false;
        }
        if read {
            self.monitor_read && !self.pending_read_op
        } else {
            self.monitor_write && !self.pending_write_op
        }
    }

    /// Clears all flags and hands out the resource for release.
    pub(crate) fn release(&mut self) -> Option<SocketResource> {
        self.monitor_read = false;
        self.monitor_write = false;
        self.pending_read_op = false;
        self.pending_write_op = false;
        self.socket.take()
    }
}

/// All sockets currently opened on behalf of the engine, by identifier.
#[derive(Debug, Default)]
pub(crate) struct SocketRegistry {
    sockets: HashMap<SocketId, Rc<RefCell<SocketInfo>>>,
    next_token: u64,
}

impl SocketRegistry {
    /// Inserts a fresh entry. An entry left behind under the same identifier
    /// is stale (the descriptor was reused) and gets replaced.
    pub(crate) fn insert(&mut self, id: SocketId, info: SocketInfo) -> Rc<RefCell<SocketInfo>> {
        let info = Rc::new(RefCell::new(info));
        if let Some(stale) = self.sockets.insert(id, info.clone()) {
            warn!(socket = %id, "Replacing stale socket entry");
            drop(stale.borrow_mut().release());
        }
        trace!(socket = %id, count = self.sockets.len(), "Registered socket");
        info
    }

    pub(crate) fn get(&self, id: SocketId) -> Option<Rc<RefCell<SocketInfo>>> {
        self.sockets.get(&id).cloned()
    }

    pub(crate) fn remove(&mut self, id: SocketId) -> Option<Rc<RefCell<SocketInfo>>> {
        let removed = self.sockets.remove(&id);
        if removed.is_some() {
            trace!(socket = %id, count = self.sockets.len(), "Erased socket");
        }
        removed
    }

    /// Allocates the token the engine uses to refer back to a socket.
    pub(crate) fn next_token(&mut self) -> SocketToken {
        self.next_token += 1;
        SocketToken(self.next_token)
    }

    pub(crate) fn len(&self) -> usize {
        self.sockets.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<(SocketId, Rc<RefCell<SocketInfo>>)> {
        self.sockets.drain().collect()
    }
}
