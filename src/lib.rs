//! TransferIO - Single-threaded glue between a mio reactor and a multi-transfer engine
//!
//! TransferIO runs many concurrent network transfers on one thread. A callback-driven
//! transfer engine decides which sockets it needs and what it wants to hear about them;
//! this crate opens those sockets, keeps readiness subscriptions on a [`Reactor`] in sync
//! with the engine's interest, paces the engine's timeout and delivers exactly one
//! completion per registered [`TransferHandle`].
//!
//! The engine itself is a black box implementing [`TransferEngine`] (or [`EasyEngine`] for
//! blocking transfers).

// Internal-only modules
pub(crate) mod config;
pub(crate) mod easy;
pub(crate) mod engine;
pub(crate) mod error;
pub(crate) mod init;
pub(crate) mod multi;
pub(crate) mod reactor;

// These are the intended public API
pub use easy::{CompletionCallback, ProgressCallback, TransferHandle};
pub use engine::{
    AddressFamily, CompletionMessage, EasyEngine, EventMask, HandleId, PollInterest, Progress,
    ReadOutcome, SeekOrigin, SeekOutcome, SocketCallback, SocketHooks, SocketId, SocketKind,
    SocketPurpose, SocketRequest, SocketTarget, SocketToken, TimerCallback, Transfer,
    TransferEngine, TransferIo, TransferOption,
};
pub use error::{EngineError, Error};
pub use init::Initialization;
pub use multi::Multi;
pub use reactor::{Reactor, SocketResource, TimerId, WaitError};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::easy::TransferHandle;
    pub use crate::engine::{
        EasyEngine, EventMask, HandleId, PollInterest, Progress, SocketId, SocketTarget,
        Transfer, TransferEngine, TransferIo, TransferOption,
    };
    pub use crate::error::{EngineError, Error};
    pub use crate::multi::Multi;
    pub use crate::reactor::Reactor;
}
