use crate::error::Error;
use crate::reactor::{Reactor, TimerId};

use std::time::Duration;
use tracing::trace;

/// The single outstanding engine timeout.
#[derive(Debug, Default)]
pub(crate) struct TimerService {
    pending: Option<TimerId>,
}

impl TimerService {
    /// Arms the timer, cancelling the one armed before. Only the most recent
    /// arm ever fires.
    pub(crate) fn arm<F>(&mut self, reactor: &Reactor, delay: Duration, task: F)
    where
        F: FnOnce() -> Result<(), Error> + 'static,
    {
        self.cancel(reactor);
        trace!(?delay, "Arming engine timer");
        self.pending = Some(reactor.schedule_timer(delay, task));
    }

    /// Cancels the pending timer. Returns true if one was pending.
    pub(crate) fn cancel(&mut self, reactor: &Reactor) -> bool {
        match self.pending.take() {
            Some(id) => {
                trace!(timer = ?id, "Disarming engine timer");
                reactor.cancel_timer(id)
            }
            None => false,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    // Called by the timer task itself once it fires.
    pub(crate) fn clear(&mut self) {
        self.pending = None;
    }
}
