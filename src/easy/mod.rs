//! Transfer Handle.
//!
//! A [`TransferHandle`] describes one transfer: its options, the source it
//! uploads from, the sink it downloads into and the callbacks reporting
//! progress and completion. A handle either runs on a [`Multi`] coordinator
//! through [`TransferHandle::async_perform`] or blocks the calling thread in
//! [`TransferHandle::perform`] on an engine of its own.

mod stream;

use stream::{HandleIo, Source};

use crate::engine::{EasyEngine, HandleId, Progress, SocketHooks, Transfer, TransferOption};
use crate::error::Error;
use crate::init::Initialization;
use crate::multi::{CoordinatorSockets, Multi, MultiShared};
use crate::reactor::Reactor;

use futures::channel::oneshot;
use std::cell::RefCell;
use std::fmt;
use std::io::{Read, Seek, Write};
use std::mem;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

/// Callback receiving the outcome of a registered transfer.
pub type CompletionCallback = Box<dyn FnOnce(Result<(), Error>)>;

/// Callback receiving progress counters. Returning false aborts the transfer.
pub type ProgressCallback = Box<dyn FnMut(Progress) -> bool>;

/// One transfer and everything it reads from and writes to.
///
/// The completion callback passed to [`TransferHandle::async_perform`] runs
/// exactly once per registration: with `Ok(())` when the engine reports
/// success, [`Error::Transfer`] when it reports failure, or
/// [`Error::Aborted`] when the transfer is cancelled. Completions reported
/// by the engine are delivered from the reactor; cancellation delivers
/// synchronously.
///
/// Dropping a registered handle cancels it.
pub struct TransferHandle {
    shared: Rc<HandleShared>,
}

pub(crate) struct HandleShared {
    id: HandleId,
    mode: Mode,
    state: RefCell<HandleState>,
    _init: Arc<Initialization>,
}

enum Mode {
    Attached(Weak<MultiShared>),
    Standalone(RefCell<Box<dyn EasyEngine>>),
}

#[derive(Default)]
struct HandleState {
    source: Option<Box<dyn Source>>,
    sink: Option<Box<dyn Write>>,
    progress: Option<ProgressCallback>,
    completion: Option<CompletionCallback>,
    registered: bool,
    options: Vec<TransferOption>,
}

/// How a completion callback is delivered.
pub(crate) enum Dispatch<'a> {
    Immediate,
    Deferred(&'a Reactor),
}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("TransferHandle")
            .field("id", &self.shared.id)
            .field("attached", &matches!(self.shared.mode, Mode::Attached(_)))
            .field("registered", &state.registered)
            .field("options", &state.options)
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl TransferHandle {
    /// Creates an idle handle that runs on `multi`.
    pub fn new(multi: &Multi) -> Self {
        Self::with_mode(Mode::Attached(Rc::downgrade(multi.shared())))
    }

    /// Creates an idle handle that runs on its own engine with
    /// [`TransferHandle::perform`].
    pub fn standalone<E>(engine: E) -> Self
    where
        E: EasyEngine + 'static,
    {
        Self::with_mode(Mode::Standalone(RefCell::new(Box::new(engine))))
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            shared: Rc::new(HandleShared {
                id: HandleId::next(),
                mode,
                state: RefCell::new(HandleState::default()),
                _init: Initialization::ensure(),
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    /// Whether the handle is registered with its coordinator and waiting for
    /// completion.
    pub fn is_registered(&self) -> bool {
        self.shared.state.borrow().registered
    }
}

// ============================================================================
// Configuration
// ============================================================================

impl TransferHandle {
    /// Sets the source uploads are read from.
    pub fn set_source<S>(&self, source: S)
    where
        S: Read + Seek + 'static,
    {
        self.shared.state.borrow_mut().source = Some(Box::new(source));
    }

    /// Sets the sink downloads are written to. Without a sink, downloaded
    /// data is discarded.
    pub fn set_sink<W>(&self, sink: W)
    where
        W: Write + 'static,
    {
        self.shared.state.borrow_mut().sink = Some(Box::new(sink));
    }

    /// Enables progress reporting through `callback`.
    pub fn set_progress_callback<F>(&self, callback: F)
    where
        F: FnMut(Progress) -> bool + 'static,
    {
        self.shared.state.borrow_mut().progress = Some(Box::new(callback));
    }

    /// Disables progress reporting.
    pub fn unset_progress_callback(&self) {
        self.shared.state.borrow_mut().progress = None;
    }

    /// Sets an engine option, replacing an earlier option of the same kind.
    ///
    /// Options take effect on the next `perform` or `async_perform`.
    pub fn set_option(&self, option: TransferOption) {
        let mut state = self.shared.state.borrow_mut();
        let kind = mem::discriminant(&option);
        state.options.retain(|existing| mem::discriminant(existing) != kind);
        state.options.push(option);
    }
}

// ============================================================================
// Running Transfers
// ============================================================================

impl TransferHandle {
    /// Runs the transfer to completion on the calling thread.
    ///
    /// Only valid on a handle created with [`TransferHandle::standalone`].
    /// The sink is flushed once the engine returns.
    #[instrument(skip(self), fields(handle = %self.shared.id))]
    pub fn perform(&self) -> Result<(), Error> {
        let Mode::Standalone(engine) = &self.shared.mode else {
            return Err(Error::InvalidState(
                "blocking perform on a handle attached to a coordinator",
            ));
        };
        let mut engine = engine
            .try_borrow_mut()
            .map_err(|_| Error::InvalidState("transfer is already being performed"))?;

        let transfer = self.shared.transfer(None);
        let result = engine.perform(transfer);
        drop(engine);
        self.shared.flush_sink();

        match result {
            Ok(()) => {
                debug!("Transfer performed");
                Ok(())
            }
            Err(source) => Err(Error::Engine {
                op: "perform",
                source,
            }),
        }
    }

    /// Registers the transfer with its coordinator.
    ///
    /// A registration still outstanding is cancelled first, so its callback
    /// receives [`Error::Aborted`]. `completion` runs once the transfer
    /// finishes or is cancelled. It runs from the reactor even if the engine
    /// finishes the transfer during registration.
    #[instrument(skip(self, completion), fields(handle = %self.shared.id))]
    pub fn async_perform<F>(&self, completion: F) -> Result<(), Error>
    where
        F: FnOnce(Result<(), Error>) + 'static,
    {
        let Mode::Attached(multi) = &self.shared.mode else {
            return Err(Error::InvalidState(
                "async perform on a handle without a coordinator",
            ));
        };
        let multi = multi
            .upgrade()
            .ok_or(Error::InvalidState("transfer coordinator was dropped"))?;

        self.shared.cancel()?;

        {
            let mut state = self.shared.state.borrow_mut();
            state.completion = Some(Box::new(completion));
            state.registered = true;
        }

        let sockets: Rc<dyn SocketHooks> = Rc::new(CoordinatorSockets::new(
            self.shared.id,
            Rc::downgrade(&multi),
        ));
        let transfer = self.shared.transfer(Some(sockets));

        if let Err(err) = multi.add(Rc::downgrade(&self.shared), transfer) {
            let mut state = self.shared.state.borrow_mut();
            state.registered = false;
            state.completion = None;
            return Err(err);
        }
        Ok(())
    }

    /// Registers the transfer and returns a receiver resolving with its
    /// outcome.
    pub fn async_perform_channel(&self) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        let (tx, rx) = oneshot::channel();
        self.async_perform(move |result| {
            // The receiver may have been dropped
            let _ = tx.send(result);
        })?;
        Ok(rx)
    }

    /// Cancels a registered transfer.
    ///
    /// The completion callback receives [`Error::Aborted`] before this
    /// returns. The transfer is deregistered from the coordinator before the
    /// callback runs, so the callback may register the handle again.
    /// Readiness waits on the transfer's sockets complete later, from the
    /// reactor. Cancelling an idle handle does nothing.
    pub fn cancel(&self) -> Result<(), Error> {
        self.shared.cancel()
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shared.cancel() {
            warn!(handle = %self.shared.id, %err, "Failed to cancel transfer on drop");
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

impl HandleShared {
    fn transfer(self: &Rc<Self>, sockets: Option<Rc<dyn SocketHooks>>) -> Transfer {
        Transfer {
            id: self.id,
            options: self.state.borrow().options.clone(),
            io: Rc::new(HandleIo::new(Rc::downgrade(self))),
            sockets,
        }
    }

    pub(crate) fn cancel(&self) -> Result<(), Error> {
        if !self.state.borrow().registered {
            return Ok(());
        }
        debug!(handle = %self.id, "Cancelling transfer");

        let removed = match &self.mode {
            Mode::Attached(multi) => match multi.upgrade() {
                Some(multi) => multi.remove(self.id),
                None => Ok(()),
            },
            Mode::Standalone(_) => Ok(()),
        };
        self.finish(Err(Error::Aborted), Dispatch::Immediate);
        removed
    }

    /// Ends the current registration and hands `result` to its completion
    /// callback.
    pub(crate) fn finish(&self, result: Result<(), Error>, dispatch: Dispatch<'_>) {
        let completion = {
            let mut state = self.state.borrow_mut();
            if !state.registered {
                trace!(handle = %self.id, "Transfer already finished");
                return;
            }
            state.registered = false;
            state.completion.take()
        };
        self.flush_sink();

        let Some(completion) = completion else {
            return;
        };
        match dispatch {
            Dispatch::Immediate => completion(result),
            Dispatch::Deferred(reactor) => reactor.post(move || {
                completion(result);
                Ok(())
            }),
        }
    }

    fn flush_sink(&self) {
        let sink = self.state.borrow_mut().sink.take();
        let Some(mut sink) = sink else {
            return;
        };
        if let Err(err) = sink.flush() {
            warn!(handle = %self.id, %err, "Failed to flush sink");
        }
        let mut state = self.state.borrow_mut();
        if state.sink.is_none() {
            state.sink = Some(sink);
        }
    }
}
