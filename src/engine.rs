//! Contract of the transfer engine driven by this crate.
//!
//! The engine is a black-box multi-transfer state machine. It owns protocol
//! logic and decides when sockets are opened, watched and closed; this crate
//! only tells it when sockets become ready and when its timer expires. The
//! engine talks back through the callbacks installed with
//! [`TransferEngine::set_socket_callback`] and
//! [`TransferEngine::set_timer_callback`], and through the per-transfer
//! [`TransferIo`] and [`SocketHooks`] objects handed over in [`Transfer`].
//!
//! Engine callbacks are invoked synchronously from inside engine calls. The
//! engine must never call back into itself from them; everything that needs
//! the engine again (socket token assignment, zero-delay timeouts) is deferred
//! by the coordinator until the current engine call has returned.

use crate::error::EngineError;
use std::fmt;
use std::io;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Identifiers
// ============================================================================

/// Native identifier of a socket opened on behalf of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub RawFd);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Opaque identifier of a transfer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

impl HandleId {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value of this id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle:{}", self.0)
    }
}

/// Token the coordinator associates with a socket through
/// [`TransferEngine::assign`].
///
/// The engine hands the token back on every later [`SocketRequest`] for the
/// socket. Tokens are never reused, so a token from a closed socket never
/// matches a newer socket that got the same [`SocketId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketToken(pub(crate) u64);

impl SocketToken {
    /// Returns the raw numeric value of this token.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Target of a [`TransferEngine::socket_action`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketTarget {
    /// The engine's timer expired; no particular socket is ready.
    Timeout,
    /// A specific socket changed readiness.
    Socket(SocketId),
}

// ============================================================================
// Readiness and Interest
// ============================================================================

/// Readiness bits passed to [`TransferEngine::socket_action`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READ: EventMask = EventMask(0b001);
    pub const WRITE: EventMask = EventMask(0b010);
    pub const ERROR: EventMask = EventMask(0b100);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: EventMask) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names = [
            (EventMask::READ, "READ"),
            (EventMask::WRITE, "WRITE"),
            (EventMask::ERROR, "ERROR"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&set.join("|"))
    }
}

/// Socket interest requested by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollInterest {
    /// Stop watching the socket but keep it open.
    None,
    /// Watch for readability.
    In,
    /// Watch for writability.
    Out,
    /// Watch for both.
    InOut,
    /// The engine is done with the socket; stop watching it for good.
    Remove,
}

impl PollInterest {
    pub fn wants_read(self) -> bool {
        matches!(self, PollInterest::In | PollInterest::InOut)
    }

    pub fn wants_write(self) -> bool {
        matches!(self, PollInterest::Out | PollInterest::InOut)
    }
}

/// A socket-interest request from the engine.
///
/// The coordinator interprets the request in one of three forms:
///
/// - `interest == Remove`: stop monitoring the socket.
/// - `token` is set: change monitoring of a socket already known to the
///   engine; `handle` is the transfer currently owning the socket.
/// - `token` is unset and `handle` is set: first request for a socket opened
///   through [`SocketHooks::open_socket`]; the coordinator assigns a token.
///
/// A request with neither a token nor a handle, or one that names a socket
/// the coordinator never opened, violates the contract and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketRequest {
    pub handle: Option<HandleId>,
    pub socket: SocketId,
    pub interest: PollInterest,
    pub token: Option<SocketToken>,
}

/// Callback the engine invokes to change socket monitoring.
pub type SocketCallback = Box<dyn FnMut(SocketRequest) -> io::Result<()>>;

/// Callback the engine invokes to request a timeout, in milliseconds.
///
/// A positive value (re)arms the timer. Zero or a negative value asks for an
/// immediate [`SocketTarget::Timeout`] action.
pub type TimerCallback = Box<dyn FnMut(i64)>;

/// Completion record drained with [`TransferEngine::drain_messages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionMessage {
    pub handle: HandleId,
    /// Zero on success, an engine-specific error code otherwise.
    pub code: i32,
}

// ============================================================================
// Per-Transfer Callbacks
// ============================================================================

/// Result of pulling upload data from a transfer's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Number of bytes stored in the buffer. Zero signals end of stream.
    Data(usize),
    /// The source failed; the engine must abort the transfer.
    Abort,
}

/// Origin of a seek requested by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

/// Result of a seek requested by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    Ok,
    Fail,
}

/// Cumulative byte counters reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub download_total: u64,
    pub download_now: u64,
    pub upload_total: u64,
    pub upload_now: u64,
}

/// Address family of a socket the engine wants opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Other(i32),
}

/// Socket type of a socket the engine wants opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// Why the engine wants a socket opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPurpose {
    /// Outgoing connection.
    Connection,
    /// Listening socket for an incoming data connection.
    Accept,
}

/// Per-transfer option forwarded to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOption {
    Url(String),
    Verbose(bool),
    ConnectTimeoutMs(u64),
}

/// Data callbacks of one transfer.
///
/// Implementations borrow transfer state only for the duration of each call.
pub trait TransferIo {
    /// Pulls upload data into `buf`.
    fn read(&self, buf: &mut [u8]) -> ReadOutcome;
    /// Pushes downloaded data. Returning less than `data.len()` is fatal for
    /// the transfer.
    fn write(&self, data: &[u8]) -> usize;
    /// Repositions the upload source.
    fn seek(&self, offset: i64, origin: SeekOrigin) -> SeekOutcome;
    /// Whether [`TransferIo::progress`] should be called at all.
    fn wants_progress(&self) -> bool;
    /// Reports progress. Returning false must abort the transfer.
    fn progress(&self, progress: Progress) -> bool;
}

/// Socket lifecycle hooks of one registered transfer.
pub trait SocketHooks {
    /// Opens a socket. `None` tells the engine the socket could not be
    /// created.
    fn open_socket(
        &self,
        purpose: SocketPurpose,
        family: AddressFamily,
        kind: SocketKind,
    ) -> Option<SocketId>;
    /// Closes a socket previously returned by
    /// [`SocketHooks::open_socket`]. The engine must not close it itself.
    fn close_socket(&self, socket: SocketId);
}

/// Everything the engine needs to run one transfer.
pub struct Transfer {
    pub id: HandleId,
    pub options: Vec<TransferOption>,
    pub io: Rc<dyn TransferIo>,
    /// Present for coordinator-driven transfers. Blocking transfers open
    /// their own sockets.
    pub sockets: Option<Rc<dyn SocketHooks>>,
}

impl Transfer {
    /// Returns the last URL option, if any.
    pub fn url(&self) -> Option<&str> {
        self.options.iter().rev().find_map(|option| match option {
            TransferOption::Url(url) => Some(url.as_str()),
            _ => None,
        })
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("sockets", &self.sockets.is_some())
            .finish()
    }
}

// ============================================================================
// Engine Traits
// ============================================================================

/// Multi-transfer engine driven by [`Multi`](crate::Multi).
pub trait TransferEngine {
    fn set_socket_callback(&mut self, callback: SocketCallback) -> Result<(), EngineError>;
    fn set_timer_callback(&mut self, callback: TimerCallback) -> Result<(), EngineError>;

    fn add(&mut self, transfer: Transfer) -> Result<(), EngineError>;
    fn remove(&mut self, handle: HandleId) -> Result<(), EngineError>;

    /// Notifies the engine of readiness (or of its timeout) and returns the
    /// number of transfers still running.
    fn socket_action(&mut self, target: SocketTarget, events: EventMask)
        -> Result<usize, EngineError>;

    fn assign(&mut self, socket: SocketId, token: SocketToken) -> Result<(), EngineError>;

    /// Returns every queued completion message, leaving the queue empty.
    fn drain_messages(&mut self) -> Vec<CompletionMessage>;
}

/// Engine able to run a single transfer to completion on the calling thread.
pub trait EasyEngine {
    fn perform(&mut self, transfer: Transfer) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_mask_contains_and_union() {
        let mask = EventMask::READ | EventMask::ERROR;
        assert!(mask.contains(EventMask::READ));
        assert!(mask.contains(EventMask::ERROR));
        assert!(!mask.contains(EventMask::WRITE));
        assert!(!mask.contains(EventMask::NONE));
        assert!(EventMask::NONE.is_empty());
        assert_eq!(format!("{mask:?}"), "READ|ERROR");
    }

    #[test]
    fn interest_directions() {
        assert!(PollInterest::InOut.wants_read() && PollInterest::InOut.wants_write());
        assert!(!PollInterest::Remove.wants_read() && !PollInterest::Remove.wants_write());
        assert!(!PollInterest::None.wants_read());
        assert!(PollInterest::Out.wants_write() && !PollInterest::Out.wants_read());
    }

    #[test]
    fn handle_ids_are_unique() {
        let a = HandleId::next();
        let b = HandleId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }
}
