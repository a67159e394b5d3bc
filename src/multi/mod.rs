//! Multi Coordinator.
//!
//! [`Multi`] drives a [`TransferEngine`] from a [`Reactor`]. It opens and
//! tracks the sockets the engine asks for, keeps readiness subscriptions in
//! line with the interest the engine requests, paces the engine's timeout and
//! turns completion messages into completion callbacks on transfer handles.
//!
//! Engine callbacks run synchronously inside engine calls and must not call
//! the engine again. Work that needs the engine (token assignment and
//! zero-delay pumps) is queued by the callbacks and carried out once the
//! triggering engine call has returned.

mod socket_info;
mod timer;

use socket_info::{SocketInfo, SocketRegistry};
use timer::TimerService;

use crate::config::{get_namespaced_bool, get_namespaced_usize};
use crate::easy::{Dispatch, HandleShared};
use crate::engine::{
    AddressFamily, EventMask, HandleId, PollInterest, SocketHooks, SocketId, SocketKind,
    SocketPurpose, SocketRequest, SocketTarget, SocketToken, Transfer, TransferEngine,
};
use crate::error::{EngineError, Error};
use crate::init::Initialization;
use crate::reactor::{Direction, Reactor, SocketResource, WaitError};
use ::config::Config;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

const DEFAULT_TCP_NODELAY: bool = true;
const DEFAULT_MAX_PUMP_ITERATIONS: usize = 64;

/// Coordinates many concurrent transfers on one reactor.
///
/// Transfers are registered through
/// [`TransferHandle::async_perform`](crate::TransferHandle::async_perform).
/// Dropping the coordinator cancels every transfer still registered; each of
/// them receives an [`Error::Aborted`] completion before the engine is
/// dropped.
///
/// # Configuration Keys
///
/// - `tcp_nodelay`: Disable Nagle's algorithm on sockets opened for the
///   engine (default true)
/// - `max_pump_iterations`: Consecutive zero-delay timeouts handled within
///   one callback before the rest is posted to the reactor (default 64)
pub struct Multi {
    shared: Rc<MultiShared>,
}

pub(crate) struct MultiShared {
    weak_self: Weak<MultiShared>,
    reactor: Reactor,
    engine: RefCell<Box<dyn TransferEngine>>,
    state: RefCell<MultiState>,
    tcp_nodelay: bool,
    max_pump_iterations: usize,
    _init: Arc<Initialization>,
}

#[derive(Default)]
struct MultiState {
    handles: HashMap<HandleId, Weak<HandleShared>>,
    sockets: SocketRegistry,
    timer: TimerService,
    running: usize,
    pending_assigns: Vec<(SocketId, SocketToken)>,
    pending_detach: HashSet<HandleId>,
    pump_requested: bool,
    closing: bool,
}

impl fmt::Debug for Multi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("Multi")
            .field("running", &state.running)
            .field("registered", &state.handles.len())
            .field("sockets", &state.sockets.len())
            .field("timer_pending", &state.timer.is_pending())
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Multi {
    /// Creates a coordinator driving `engine` from `reactor`.
    pub fn new<E>(config: &Config, reactor: &Reactor, engine: E) -> Result<Self, Error>
    where
        E: TransferEngine + 'static,
    {
        Self::new_named(config, "", reactor, engine)
    }

    /// Creates a named coordinator with configuration namespacing.
    ///
    /// Configuration lookup follows this priority:
    /// 1. `{name}.{key}`
    /// 2. `{key}`
    /// 3. Hard-coded default
    pub fn new_named<E>(
        config: &Config,
        name: &str,
        reactor: &Reactor,
        engine: E,
    ) -> Result<Self, Error>
    where
        E: TransferEngine + 'static,
    {
        let tcp_nodelay =
            get_namespaced_bool(config, name, "tcp_nodelay").unwrap_or(DEFAULT_TCP_NODELAY);
        let max_pump_iterations = get_namespaced_usize(config, name, "max_pump_iterations")
            .unwrap_or(DEFAULT_MAX_PUMP_ITERATIONS);

        let mut setup = Ok(());
        let shared = Rc::new_cyclic(|weak: &Weak<MultiShared>| {
            let mut engine: Box<dyn TransferEngine> = Box::new(engine);
            setup = install_callbacks(engine.as_mut(), weak);
            MultiShared {
                weak_self: weak.clone(),
                reactor: reactor.clone(),
                engine: RefCell::new(engine),
                state: RefCell::new(MultiState::default()),
                tcp_nodelay,
                max_pump_iterations: max_pump_iterations.max(1),
                _init: Initialization::ensure(),
            }
        });
        setup?;

        info!(coordinator = name, tcp_nodelay, max_pump_iterations, "Transfer coordinator created");
        Ok(Self { shared })
    }
}

fn install_callbacks(
    engine: &mut dyn TransferEngine,
    multi: &Weak<MultiShared>,
) -> Result<(), Error> {
    let weak = multi.clone();
    engine
        .set_socket_callback(Box::new(move |request| match weak.upgrade() {
            Some(multi) => multi.on_socket_request(request),
            None => Ok(()),
        }))
        .map_err(|source| Error::Engine {
            op: "set_socket_callback",
            source,
        })?;

    let weak = multi.clone();
    engine
        .set_timer_callback(Box::new(move |timeout_ms| {
            if let Some(multi) = weak.upgrade() {
                multi.on_timer_request(timeout_ms);
            }
        }))
        .map_err(|source| Error::Engine {
            op: "set_timer_callback",
            source,
        })
}

// ============================================================================
// Introspection
// ============================================================================

impl Multi {
    /// Number of transfers the engine reported as running after its last
    /// `socket_action`.
    pub fn running(&self) -> usize {
        self.shared.state.borrow().running
    }

    /// Number of transfer handles currently registered.
    pub fn registered_count(&self) -> usize {
        self.shared.state.borrow().handles.len()
    }

    /// Number of sockets currently open on behalf of the engine.
    pub fn socket_count(&self) -> usize {
        self.shared.state.borrow().sockets.len()
    }

    /// Whether an engine timeout is armed.
    pub fn timer_pending(&self) -> bool {
        self.shared.state.borrow().timer.is_pending()
    }

    /// Transfer the socket is currently assigned to, if the socket is open.
    pub fn socket_handle(&self, socket: SocketId) -> Option<HandleId> {
        let info = self.shared.state.borrow().sockets.get(socket)?;
        let handle = info.borrow().handle;
        handle
    }

    pub fn reactor(&self) -> &Reactor {
        &self.shared.reactor
    }

    pub(crate) fn shared(&self) -> &Rc<MultiShared> {
        &self.shared
    }
}

impl Drop for Multi {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.state.borrow_mut().closing = true;

        loop {
            let next = {
                let state = shared.state.borrow();
                state.handles.iter().next().map(|(id, handle)| (*id, handle.clone()))
            };
            let Some((id, handle)) = next else {
                break;
            };

            let result = match handle.upgrade() {
                Some(handle) => handle.cancel(),
                None => shared.remove(id),
            };
            // cancel() may have bailed out before deregistering
            shared.state.borrow_mut().handles.remove(&id);
            if let Err(err) = result {
                warn!(handle = %id, %err, "Failed to cancel transfer during shutdown");
            }
        }

        let sockets = shared.state.borrow_mut().sockets.drain();
        for (_, info) in sockets {
            let resource = info.borrow_mut().release();
            drop(resource);
        }
        shared.state.borrow_mut().timer.cancel(&shared.reactor);
        debug!("Transfer coordinator dropped");
    }
}

// ============================================================================
// Transfer Registration
// ============================================================================

impl MultiShared {
    /// Registers a transfer with the engine.
    ///
    /// Completions the engine reports during registration are delivered
    /// through the reactor, never from inside this call. Once the completion
    /// of this registration has been handed out, later errors are only
    /// logged, so the outcome is reported exactly once.
    #[instrument(skip(self, owner, transfer), fields(handle = %transfer.id))]
    pub(crate) fn add(&self, owner: Weak<HandleShared>, transfer: Transfer) -> Result<(), Error> {
        if self.state.borrow().closing {
            return Err(Error::InvalidState("transfer coordinator is shutting down"));
        }

        let id = transfer.id;
        // A removal of the previous registration may still be queued
        if self.state.borrow_mut().pending_detach.remove(&id) {
            debug!("Removing previous registration before re-adding");
            self.detach(id)?;
        }

        self.state.borrow_mut().handles.insert(id, owner);
        if let Err(err) = self.call_engine("add", |engine| engine.add(transfer)) {
            self.state.borrow_mut().handles.remove(&id);
            return Err(err);
        }
        debug!("Transfer added");

        if let Err(err) = self.settle() {
            if !self.state.borrow().handles.contains_key(&id) {
                warn!(%err, "Coordinator error after the transfer already completed");
                return Ok(());
            }
            if let Err(remove_err) = self.remove_handle(id) {
                warn!(%remove_err, "Failed to remove transfer after registration error");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Deregisters a transfer. A transfer that is not registered is ignored.
    #[instrument(skip(self))]
    pub(crate) fn remove(&self, id: HandleId) -> Result<(), Error> {
        let removed = self.remove_handle(id);
        if self.engine.try_borrow().is_err() {
            // Inside an engine call; the deferred removal settles afterwards
            return removed;
        }
        let settled = self.settle();
        removed.and(settled)
    }

    fn remove_handle(&self, id: HandleId) -> Result<(), Error> {
        if self.state.borrow_mut().handles.remove(&id).is_none() {
            return Ok(());
        }
        self.detach(id)
    }

    // Removes the transfer from the engine. From inside an engine call (a
    // data or progress callback cancelling its own transfer) the removal is
    // posted to the reactor instead.
    fn detach(&self, id: HandleId) -> Result<(), Error> {
        if self.engine.try_borrow_mut().is_err() {
            debug!(handle = %id, "Engine busy, deferring transfer removal");
            self.state.borrow_mut().pending_detach.insert(id);
            let weak = self.weak_self.clone();
            self.reactor.post(move || match weak.upgrade() {
                Some(multi) => multi.deferred_detach(id),
                None => Ok(()),
            });
            return Ok(());
        }
        self.call_engine("remove", |engine| engine.remove(id))?;
        debug!(handle = %id, "Transfer removed");
        Ok(())
    }

    // A new registration of the same handle carries out the removal itself
    // and clears the pending entry, which turns this into a no-op.
    fn deferred_detach(&self, id: HandleId) -> Result<(), Error> {
        if !self.state.borrow_mut().pending_detach.remove(&id) {
            trace!(handle = %id, "Deferred removal already carried out");
            return Ok(());
        }
        self.detach(id)?;
        self.settle()
    }
}

// ============================================================================
// Engine Driving
// ============================================================================

impl MultiShared {
    fn call_engine<T, F>(&self, op: &'static str, call: F) -> Result<T, Error>
    where
        F: FnOnce(&mut dyn TransferEngine) -> Result<T, EngineError>,
    {
        let mut engine = self
            .engine
            .try_borrow_mut()
            .map_err(|_| Error::InvalidState("transfer engine called from its own callback"))?;
        call(engine.as_mut()).map_err(|source| Error::Engine { op, source })
    }

    /// Reports readiness (or a timeout) to the engine and records how many
    /// transfers are still running. No running transfers disarms the timer.
    fn socket_action(&self, target: SocketTarget, events: EventMask) -> Result<(), Error> {
        let running =
            self.call_engine("socket_action", |engine| engine.socket_action(target, events))?;

        let mut state = self.state.borrow_mut();
        state.running = running;
        if running == 0 && state.timer.cancel(&self.reactor) {
            debug!("No transfers running, engine timer disarmed");
        }
        trace!(?target, ?events, running, "Socket action");
        Ok(())
    }

    /// Drains completion messages until the engine has none left.
    ///
    /// Each completed transfer is deregistered and its completion callback is
    /// posted to the reactor. A failed removal does not stop the drain; the
    /// first such error is returned once every message is handled.
    fn process_messages(&self) -> Result<(), Error> {
        let mut first_err = None;
        loop {
            let messages = self.call_engine("drain_messages", |engine| Ok(engine.drain_messages()))?;
            if messages.is_empty() {
                return match first_err {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }

            for message in messages {
                let id = message.handle;
                let handle = self.state.borrow().handles.get(&id).cloned();
                let Some(handle) = handle else {
                    debug!(handle = %id, "Completion for a transfer that is no longer registered");
                    continue;
                };

                let removed = self.remove_handle(id);
                let result = EngineError::check(message.code).map_err(Error::Transfer);
                debug!(handle = %id, code = message.code, "Transfer finished");
                if let Some(handle) = handle.upgrade() {
                    handle.finish(result, Dispatch::Deferred(&self.reactor));
                }
                if let Err(err) = removed {
                    warn!(handle = %id, %err, "Failed to remove finished transfer");
                    first_err.get_or_insert(err);
                }
            }
        }
    }

    // Carries out the work engine callbacks queued during the last engine
    // call: token assignments, completion messages and zero-delay timeouts.
    fn settle(&self) -> Result<(), Error> {
        let mut pumps = 0;
        loop {
            self.flush_assignments()?;
            self.process_messages()?;

            let (pump, assigns_left) = {
                let mut state = self.state.borrow_mut();
                (
                    std::mem::take(&mut state.pump_requested),
                    !state.pending_assigns.is_empty(),
                )
            };

            if pump {
                if pumps >= self.max_pump_iterations {
                    debug!(pumps, "Posting remaining zero-delay timeouts to the reactor");
                    let weak = self.weak_self.clone();
                    self.reactor.post(move || match weak.upgrade() {
                        Some(multi) => multi.pump(),
                        None => Ok(()),
                    });
                    return Ok(());
                }
                pumps += 1;
                self.socket_action(SocketTarget::Timeout, EventMask::NONE)?;
            } else if !assigns_left {
                return Ok(());
            }
        }
    }

    fn flush_assignments(&self) -> Result<(), Error> {
        let pending = std::mem::take(&mut self.state.borrow_mut().pending_assigns);
        for (socket, token) in pending {
            let current = self
                .state
                .borrow()
                .sockets
                .get(socket)
                .map(|info| info.borrow().token);
            if current != Some(Some(token)) {
                trace!(%socket, "Skipping token assignment for a replaced socket");
                continue;
            }
            self.call_engine("assign", |engine| engine.assign(socket, token))?;
            trace!(%socket, token = token.get(), "Assigned socket token");
        }
        Ok(())
    }

    fn pump(&self) -> Result<(), Error> {
        self.socket_action(SocketTarget::Timeout, EventMask::NONE)?;
        self.settle()
    }

    fn on_timeout(&self) -> Result<(), Error> {
        self.state.borrow_mut().timer.clear();
        trace!("Engine timer expired");
        self.pump()
    }
}

// ============================================================================
// Engine Callbacks
// ============================================================================

impl MultiShared {
    fn on_timer_request(&self, timeout_ms: i64) {
        let mut state = self.state.borrow_mut();
        if timeout_ms > 0 {
            let weak = self.weak_self.clone();
            state.timer.arm(
                &self.reactor,
                Duration::from_millis(timeout_ms.unsigned_abs()),
                move || match weak.upgrade() {
                    Some(multi) => multi.on_timeout(),
                    None => Ok(()),
                },
            );
        } else {
            state.timer.cancel(&self.reactor);
            state.pump_requested = true;
        }
    }

    fn on_socket_request(&self, request: SocketRequest) -> io::Result<()> {
        let SocketRequest {
            handle,
            socket,
            interest,
            token,
        } = request;
        let info = self.state.borrow().sockets.get(socket);

        if interest == PollInterest::Remove {
            match info {
                Some(info) => return self.monitor(&info, PollInterest::Remove),
                None => {
                    debug!(%socket, "Remove request for a socket that is already closed");
                    return Ok(());
                }
            }
        }

        match (token, handle) {
            (Some(_), handle) => {
                let Some(info) = info else {
                    panic!("engine changed interest on unknown socket {socket}");
                };
                info.borrow_mut().handle = handle;
                self.monitor(&info, interest)
            }
            (None, Some(handle)) => {
                let Some(info) = info else {
                    panic!("engine registered unknown socket {socket}");
                };
                let token = {
                    let mut state = self.state.borrow_mut();
                    let token = state.sockets.next_token();
                    state.pending_assigns.push((socket, token));
                    token
                };
                {
                    let mut info = info.borrow_mut();
                    info.handle = Some(handle);
                    info.token = Some(token);
                }
                debug!(%socket, handle = %handle, ?interest, "Socket registered");
                self.monitor(&info, interest)
            }
            (None, None) => {
                panic!("socket request for {socket} carries neither a token nor a handle")
            }
        }
    }

    fn monitor(&self, info: &Rc<RefCell<SocketInfo>>, interest: PollInterest) -> io::Result<()> {
        let plan = info.borrow_mut().set_monitor(interest);
        if plan.start_read {
            self.start_wait(info, Direction::Read)?;
        }
        if plan.start_write {
            self.start_wait(info, Direction::Write)?;
        }
        if plan.cancel {
            if let Some(socket) = info.borrow().socket.as_ref() {
                trace!(socket = %socket.id(), "Cancelling readiness waits");
                socket.cancel();
            }
        }
        Ok(())
    }

    fn start_wait(&self, info: &Rc<RefCell<SocketInfo>>, direction: Direction) -> io::Result<()> {
        let weak_info = Rc::downgrade(info);
        let weak_multi = self.weak_self.clone();
        let callback = move |result: Result<(), WaitError>| {
            match (weak_multi.upgrade(), weak_info.upgrade()) {
                (Some(multi), Some(info)) => multi.on_socket_ready(&info, direction, result),
                _ => Ok(()),
            }
        };

        let mut guard = info.borrow_mut();
        let info = &mut *guard;
        let Some(socket) = info.socket.as_mut() else {
            return Ok(());
        };
        match direction {
            Direction::Read => {
                socket.wait_readable(callback)?;
                info.pending_read_op = true;
            }
            Direction::Write => {
                socket.wait_writable(callback)?;
                info.pending_write_op = true;
            }
        }
        Ok(())
    }

    fn on_socket_ready(
        &self,
        info: &Rc<RefCell<SocketInfo>>,
        direction: Direction,
        result: Result<(), WaitError>,
    ) -> Result<(), Error> {
        let socket = {
            let mut info = info.borrow_mut();
            match direction {
                Direction::Read => info.pending_read_op = false,
                Direction::Write => info.pending_write_op = false,
            }
            match info.socket.as_ref() {
                Some(socket) => socket.id(),
                None => {
                    trace!(?direction, "Readiness for a released socket");
                    return Ok(());
                }
            }
        };

        match result {
            Ok(()) => {
                let events = match direction {
                    Direction::Read => EventMask::READ,
                    Direction::Write => EventMask::WRITE,
                };
                self.socket_action(SocketTarget::Socket(socket), events)?;
                self.settle()?;
                self.rearm(info, direction)
            }
            // A cancel can race with a renewed interest; honour the interest
            Err(WaitError::Aborted) => {
                trace!(%socket, ?direction, "Readiness wait aborted");
                self.rearm(info, direction)
            }
            Err(WaitError::Io(err)) => {
                warn!(%socket, ?direction, %err, "Socket error");
                self.socket_action(SocketTarget::Socket(socket), EventMask::ERROR)?;
                self.settle()
            }
        }
    }

    fn rearm(&self, info: &Rc<RefCell<SocketInfo>>, direction: Direction) -> Result<(), Error> {
        let wanted = info.borrow().should_rearm(direction == Direction::Read);
        if wanted {
            self.start_wait(info, direction)?;
        }
        Ok(())
    }
}

// ============================================================================
// Socket Hooks
// ============================================================================

impl MultiShared {
    fn open_socket(
        &self,
        handle: HandleId,
        purpose: SocketPurpose,
        family: AddressFamily,
        kind: SocketKind,
    ) -> Option<SocketId> {
        if purpose != SocketPurpose::Connection || kind != SocketKind::Stream {
            debug!(handle = %handle, ?purpose, ?kind, "Refusing to open socket");
            return None;
        }

        let socket = match SocketResource::open(&self.reactor, family) {
            Ok(socket) => socket,
            Err(err) => {
                warn!(handle = %handle, ?family, %err, "Failed to open socket");
                return None;
            }
        };
        if self.tcp_nodelay {
            if let Err(err) = socket.set_nodelay(true) {
                warn!(socket = %socket.id(), %err, "Failed to set TCP_NODELAY");
            }
        }

        let id = socket.id();
        self.state
            .borrow_mut()
            .sockets
            .insert(id, SocketInfo::new(Some(handle), socket));
        debug!(socket = %id, handle = %handle, "Socket opened for transfer");
        Some(id)
    }

    // Erases the entry at once. Waits still outstanding on the resource
    // complete with `Aborted` and find their entry gone.
    fn socket_cleanup(&self, socket: SocketId) {
        let removed = self.state.borrow_mut().sockets.remove(socket);
        let Some(info) = removed else {
            debug!(%socket, "Close request for an unknown socket");
            return;
        };
        let resource = info.borrow_mut().release();
        drop(resource);
        debug!(%socket, "Socket closed");
    }
}

/// Socket hooks handed to the engine with each registered transfer.
///
/// Opening records the socket against the transfer; closing goes through
/// the coordinator, since pooled connections outlive the transfer that
/// opened them.
pub(crate) struct CoordinatorSockets {
    handle: HandleId,
    multi: Weak<MultiShared>,
}

impl CoordinatorSockets {
    pub(crate) fn new(handle: HandleId, multi: Weak<MultiShared>) -> Self {
        Self { handle, multi }
    }
}

impl SocketHooks for CoordinatorSockets {
    fn open_socket(
        &self,
        purpose: SocketPurpose,
        family: AddressFamily,
        kind: SocketKind,
    ) -> Option<SocketId> {
        self.multi
            .upgrade()?
            .open_socket(self.handle, purpose, family, kind)
    }

    fn close_socket(&self, socket: SocketId) {
        if let Some(multi) = self.multi.upgrade() {
            multi.socket_cleanup(socket);
        }
    }
}
