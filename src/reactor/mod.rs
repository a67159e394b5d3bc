//! Single-threaded event reactor.
//!
//! Provides the [`Reactor`] which runs posted tasks, one-shot readiness
//! subscriptions and one-shot timers on the calling thread, using mio for
//! readiness notification. Every callback runs to completion before the next
//! one starts, so state touched only from reactor callbacks needs no locking.

mod socket;

pub use socket::SocketResource;

use crate::config::get_namespaced_usize;
use crate::error::Error;
use ::config::Config;

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io::{self, ErrorKind};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

const DEFAULT_POLL_CAPACITY: usize = 1024;
const SOURCE_TOKEN_RANGE_START: usize = 1000;

/// A unit of work posted to the reactor.
pub type Task = Box<dyn FnOnce() -> Result<(), Error>>;

/// Callback of a one-shot readiness subscription.
pub type Waiter = Box<dyn FnOnce(Result<(), WaitError>) -> Result<(), Error>>;

/// Why a readiness subscription completed without the socket becoming ready.
#[derive(Debug)]
pub enum WaitError {
    /// The subscription was cancelled or its socket was released.
    Aborted,
    /// The poller reported an error condition on the socket.
    Io(io::Error),
}

impl WaitError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, WaitError::Aborted)
    }
}

/// Identifier of a timer scheduled with [`Reactor::schedule_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Readiness direction of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

// Internal data type for per-source subscription state
#[derive(Default)]
struct SourceSlot {
    read_waiter: Option<Waiter>,
    write_waiter: Option<Waiter>,
    registered: bool,
}

impl SourceSlot {
    fn interest(&self) -> Option<Interest> {
        match (self.read_waiter.is_some(), self.write_waiter.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn has_waiters(&self) -> bool {
        self.read_waiter.is_some() || self.write_waiter.is_some()
    }

    fn take_waiters(&mut self) -> impl Iterator<Item = Waiter> {
        [self.read_waiter.take(), self.write_waiter.take()]
            .into_iter()
            .flatten()
    }
}

struct ReactorInner {
    registry: Registry,
    queue: VecDeque<Task>,
    sources: HashMap<Token, SourceSlot>,
    timers: BTreeMap<(Instant, TimerId), Task>,
    timer_deadlines: HashMap<TimerId, Instant>,
    next_token: usize,
    next_timer: u64,
}

impl ReactorInner {
    fn post_abort(&mut self, waiter: Waiter) {
        self.queue
            .push_back(Box::new(move || waiter(Err(WaitError::Aborted))));
    }
}

/// Single-threaded cooperative scheduler shared by all components.
///
/// Cloning a `Reactor` yields another handle to the same scheduler. A reactor
/// is not thread-safe; it is driven by [`Reactor::run`] on the thread that
/// owns it.
///
/// # Configuration Keys
///
/// - `poll_capacity`: Maximum readiness events fetched per poll (default 1024)
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<ReactorInner>>,
    poll: Rc<RefCell<Poll>>,
    poll_capacity: usize,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Reactor")
            .field("queued", &inner.queue.len())
            .field("sources", &inner.sources.len())
            .field("timers", &inner.timers.len())
            .field("poll_capacity", &self.poll_capacity)
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Reactor {
    /// Creates a new reactor based on configuration.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Creates a new named reactor with configuration namespacing.
    ///
    /// Configuration lookup follows this priority:
    /// 1. `{name}.{key}`
    /// 2. `{key}`
    /// 3. Hard-coded default
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let poll_capacity =
            get_namespaced_usize(config, name, "poll_capacity").unwrap_or(DEFAULT_POLL_CAPACITY);

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;

        Ok(Self {
            inner: Rc::new(RefCell::new(ReactorInner {
                registry,
                queue: VecDeque::new(),
                sources: HashMap::new(),
                timers: BTreeMap::new(),
                timer_deadlines: HashMap::new(),
                next_token: SOURCE_TOKEN_RANGE_START,
                next_timer: 0,
            })),
            poll: Rc::new(RefCell::new(poll)),
            poll_capacity: poll_capacity.max(1),
        })
    }
}

// ============================================================================
// Tasks and Timers
// ============================================================================

impl Reactor {
    /// Queues a task. Tasks run in the order they were posted.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() -> Result<(), Error> + 'static,
    {
        self.inner.borrow_mut().queue.push_back(Box::new(task));
    }

    /// Schedules a one-shot timer running `task` once `delay` has elapsed.
    pub fn schedule_timer<F>(&self, delay: Duration, task: F) -> TimerId
    where
        F: FnOnce() -> Result<(), Error> + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let id = TimerId(inner.next_timer);
        inner.next_timer += 1;
        let deadline = Instant::now() + delay;
        inner.timers.insert((deadline, id), Box::new(task));
        inner.timer_deadlines.insert(id, deadline);
        trace!(timer = ?id, ?delay, "Scheduled timer");
        id
    }

    /// Cancels a timer. A cancelled timer never runs.
    ///
    /// Returns false if the timer already ran or was cancelled before.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.timer_deadlines.remove(&id) {
            Some(deadline) => {
                trace!(timer = ?id, "Cancelled timer");
                inner.timers.remove(&(deadline, id)).is_some()
            }
            None => false,
        }
    }

    /// Returns true if a posted task, timer or readiness subscription is
    /// outstanding.
    pub fn has_work(&self) -> bool {
        let inner = self.inner.borrow();
        !inner.queue.is_empty()
            || !inner.timers.is_empty()
            || inner.sources.values().any(SourceSlot::has_waiters)
    }
}

// ============================================================================
// Readiness Subscriptions
// ============================================================================

impl Reactor {
    // Allocates a token for a new source. The source is registered with the
    // poller lazily on its first subscription.
    pub(crate) fn add_source(&self) -> Token {
        let mut inner = self.inner.borrow_mut();
        loop {
            let token = Token(inner.next_token);
            inner.next_token = inner
                .next_token
                .checked_add(1)
                .unwrap_or(SOURCE_TOKEN_RANGE_START);
            if !inner.sources.contains_key(&token) {
                inner.sources.insert(token, SourceSlot::default());
                return token;
            }
        }
    }

    // Installs a one-shot waiter for one direction and updates the poller
    // registration to the union of outstanding directions. Re-registering
    // makes the poller report readiness that is already present.
    pub(crate) fn subscribe<S>(
        &self,
        token: Token,
        source: &mut S,
        direction: Direction,
        waiter: Waiter,
    ) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let slot = inner
            .sources
            .get_mut(&token)
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "source not known to reactor"))?;

        let previous = match direction {
            Direction::Read => slot.read_waiter.replace(waiter),
            Direction::Write => slot.write_waiter.replace(waiter),
        };

        let interest = slot
            .interest()
            .expect("a waiter was installed just above");
        let result = if slot.registered {
            inner.registry.reregister(source, token, interest)
        } else {
            inner.registry.register(source, token, interest)
        };

        match result {
            Ok(()) => {
                slot.registered = true;
                trace!(?token, ?direction, ?interest, "Armed readiness subscription");
                if let Some(previous) = previous {
                    warn!(?token, ?direction, "Replaced an outstanding readiness subscription");
                    inner
                        .queue
                        .push_back(Box::new(move || previous(Err(WaitError::Aborted))));
                }
                Ok(())
            }
            Err(err) => {
                // Roll back to the previous waiter, if any
                match direction {
                    Direction::Read => slot.read_waiter = previous,
                    Direction::Write => slot.write_waiter = previous,
                }
                Err(err)
            }
        }
    }

    // Completes all outstanding waiters of a source with `Aborted`. The
    // completions are posted, never run synchronously.
    pub(crate) fn cancel_source(&self, token: Token) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let Some(slot) = inner.sources.get_mut(&token) else {
            return;
        };
        let waiters: Vec<Waiter> = slot.take_waiters().collect();
        if !waiters.is_empty() {
            debug!(?token, count = waiters.len(), "Cancelling readiness subscriptions");
        }
        for waiter in waiters {
            inner.post_abort(waiter);
        }
    }

    // Aborts outstanding waiters, deregisters the source and forgets the
    // token.
    pub(crate) fn remove_source<S>(&self, token: Token, source: &mut S)
    where
        S: Source + ?Sized,
    {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let Some(mut slot) = inner.sources.remove(&token) else {
            return;
        };
        let waiters: Vec<Waiter> = slot.take_waiters().collect();
        for waiter in waiters {
            inner.post_abort(waiter);
        }
        if slot.registered {
            if let Err(err) = inner.registry.deregister(source) {
                warn!(?token, ?err, "Failed to deregister source");
            }
        }
    }
}

// ============================================================================
// Event Loop
// ============================================================================

impl Reactor {
    /// Runs callbacks until no posted task, timer or readiness subscription
    /// remains.
    ///
    /// Returns the first error returned by a callback. The reactor can be run
    /// again afterwards; the remaining work is left in place.
    pub fn run(&self) -> Result<(), Error> {
        self.run_until(None)
    }

    /// Like [`Reactor::run`], but returns once `duration` has elapsed even if
    /// work remains.
    pub fn run_for(&self, duration: Duration) -> Result<(), Error> {
        self.run_until(Some(Instant::now() + duration))
    }

    /// Runs one iteration of the event loop, waiting at most `timeout` for
    /// readiness when nothing is immediately runnable.
    ///
    /// Returns the number of callbacks that ran.
    #[instrument(level = "trace", skip(self))]
    pub fn poll_once(&self, timeout: Option<Duration>) -> Result<usize, Error> {
        let mut ran = self.run_queued()?;
        ran += self.run_expired_timers()?;

        let wait = if ran > 0 || !self.inner.borrow().queue.is_empty() {
            Some(Duration::ZERO)
        } else {
            let next_timer = self.time_to_next_timer();
            match (timeout, next_timer) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }
        };

        ran += self.dispatch_readiness(wait)?;
        ran += self.run_expired_timers()?;
        Ok(ran)
    }

    fn run_until(&self, deadline: Option<Instant>) -> Result<(), Error> {
        loop {
            if !self.has_work() {
                debug!("Reactor has no outstanding work");
                return Ok(());
            }

            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            self.poll_once(timeout)?;
        }
    }

    // Runs the tasks that were queued when the call started. Tasks posted by
    // those tasks wait for the next iteration.
    fn run_queued(&self) -> Result<usize, Error> {
        let count = self.inner.borrow().queue.len();
        for _ in 0..count {
            let task = self.inner.borrow_mut().queue.pop_front();
            match task {
                Some(task) => task()?,
                None => return Ok(count),
            }
        }
        Ok(count)
    }

    fn run_expired_timers(&self) -> Result<usize, Error> {
        let now = Instant::now();
        let mut ran = 0;
        loop {
            let task = {
                let mut inner = self.inner.borrow_mut();
                let Some((&key, _)) = inner.timers.first_key_value() else {
                    break;
                };
                if key.0 > now {
                    break;
                }
                inner.timer_deadlines.remove(&key.1);
                inner.timers.remove(&key)
            };
            if let Some(task) = task {
                ran += 1;
                task()?;
            }
        }
        Ok(ran)
    }

    fn time_to_next_timer(&self) -> Option<Duration> {
        let inner = self.inner.borrow();
        inner
            .timers
            .first_key_value()
            .map(|(&(deadline, _), _)| deadline.saturating_duration_since(Instant::now()))
    }

    fn dispatch_readiness(&self, timeout: Option<Duration>) -> Result<usize, Error> {
        let mut events = Events::with_capacity(self.poll_capacity);
        match self.poll.borrow_mut().poll(&mut events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err.into()),
        }

        // Collect the waiters first, then run them without holding the borrow.
        // A waiter may close a socket whose waiter was already collected; that
        // waiter still runs and has to cope with the released socket.
        let mut ready: Vec<(Waiter, Result<(), WaitError>)> = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            for event in events.iter() {
                let token = event.token();
                let Some(slot) = inner.sources.get_mut(&token) else {
                    trace!(?token, "Event for released source");
                    continue;
                };

                // mio reports errors alongside readable/writable bits. An
                // error completes both directions.
                if event.is_error() {
                    for waiter in slot.take_waiters() {
                        let err = io::Error::other("poller reported an error condition");
                        ready.push((waiter, Err(WaitError::Io(err))));
                    }
                    continue;
                }

                if event.is_readable() || event.is_read_closed() {
                    if let Some(waiter) = slot.read_waiter.take() {
                        ready.push((waiter, Ok(())));
                    }
                }
                if event.is_writable() || event.is_write_closed() {
                    if let Some(waiter) = slot.write_waiter.take() {
                        ready.push((waiter, Ok(())));
                    }
                }
            }
        }

        let ran = ready.len();
        if ran > 0 {
            trace!(count = ran, "Dispatching readiness");
        }
        for (waiter, result) in ready {
            waiter(result)?;
        }
        Ok(ran)
    }
}
