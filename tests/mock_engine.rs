//! Scripted transfer engine shared by the integration tests.
//!
//! Each transfer follows the [`Plan`] registered for its URL. Download plans
//! drive a real non-blocking socket opened through the coordinator's socket
//! hooks, so readiness comes from the kernel, not from the test.

#![allow(dead_code)]

use socket2::{SockRef, Socket};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::BorrowedFd;
use std::rc::Rc;
use std::sync::Once;
use std::thread;
use transferio::*;

/// Engine result code for a URL without a plan.
pub const CODE_BAD_URL: i32 = 3;
/// Engine result code when no socket could be opened.
pub const CODE_NO_SOCKET: i32 = 7;
/// Engine result code for a short sink write.
pub const CODE_WRITE_ERROR: i32 = 23;
/// Engine result code when the progress callback asked to abort.
pub const CODE_ABORTED_BY_CALLBACK: i32 = 42;
/// Engine result code for a socket error.
pub const CODE_RECV_ERROR: i32 = 56;
/// Engine error code returned by a failing `remove`.
pub const CODE_REMOVE_FAILED: i32 = 99;

static INIT: Once = Once::new();

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };

                let filter = format!("transferio={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Plans and Call Log
// ============================================================================

/// What the engine does with a transfer.
#[derive(Debug, Clone)]
pub enum Plan {
    /// Finishes with `code` inside `add`.
    Immediate(i32),
    /// Asks for an immediate timeout inside `add` and finishes with `code`
    /// on the timeout action.
    ViaTimer(i32),
    /// Requests each timeout in turn inside `add` and finishes on the first
    /// timeout action.
    Timers(Vec<i64>),
    /// Connects to `addr`, reads until end of stream and finishes with
    /// `code`.
    Download { addr: SocketAddr, code: i32 },
    /// Like `Download`, but once connected asks for read interest, drops all
    /// interest and asks for read interest again within one call.
    FlappingDownload { addr: SocketAddr, code: i32 },
    /// Takes over the socket of a running transfer, the way a pooled
    /// connection moves to the next transfer, and asks for read interest.
    Adopt,
    /// Asks the coordinator to register a socket it never opened.
    UnknownSocket,
}

/// Engine calls made by the coordinator, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Add(HandleId),
    Remove(HandleId),
    Action(SocketTarget, EventMask),
    Assign(SocketId),
}

pub type CallLog = Rc<RefCell<Vec<Call>>>;

struct Active {
    transfer: Transfer,
    plan: Plan,
    socket: Option<SocketId>,
    received: u64,
}

// ============================================================================
// Multi Engine
// ============================================================================

pub struct MockEngine {
    plans: HashMap<String, Plan>,
    log: CallLog,
    socket_callback: Option<SocketCallback>,
    timer_callback: Option<TimerCallback>,
    active: HashMap<HandleId, Active>,
    owners: HashMap<SocketId, HandleId>,
    tokens: HashMap<SocketId, SocketToken>,
    messages: Vec<CompletionMessage>,
    failing_urls: HashSet<String>,
    failing_removes: HashSet<HandleId>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            plans: HashMap::new(),
            log: Rc::new(RefCell::new(Vec::new())),
            socket_callback: None,
            timer_callback: None,
            active: HashMap::new(),
            owners: HashMap::new(),
            tokens: HashMap::new(),
            messages: Vec::new(),
            failing_urls: HashSet::new(),
            failing_removes: HashSet::new(),
        }
    }

    pub fn plan(mut self, url: &str, plan: Plan) -> Self {
        self.plans.insert(url.to_string(), plan);
        self
    }

    /// Makes `remove` fail for transfers registered with `url`.
    pub fn fail_remove(mut self, url: &str) -> Self {
        self.failing_urls.insert(url.to_string());
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    fn record(&self, call: Call) {
        self.log.borrow_mut().push(call);
    }

    fn request_timeout(&mut self, timeout_ms: i64) {
        let callback = self
            .timer_callback
            .as_mut()
            .expect("timer callback installed");
        callback(timeout_ms);
    }

    fn request_interest(
        &mut self,
        handle: HandleId,
        socket: SocketId,
        interest: PollInterest,
    ) -> Result<(), EngineError> {
        let request = SocketRequest {
            handle: Some(handle),
            socket,
            interest,
            token: self.tokens.get(&socket).copied(),
        };
        let callback = self
            .socket_callback
            .as_mut()
            .expect("socket callback installed");
        callback(request).map_err(|_| EngineError::new(CODE_RECV_ERROR))
    }

    fn connect(&mut self, id: HandleId, addr: SocketAddr) -> Result<(), EngineError> {
        let hooks = self.active[&id]
            .transfer
            .sockets
            .clone()
            .expect("coordinator transfers carry socket hooks");
        let socket = hooks
            .open_socket(SocketPurpose::Connection, AddressFamily::Inet, SocketKind::Stream)
            .ok_or(EngineError::new(CODE_NO_SOCKET))?;

        // The descriptor stays open until close_socket is called.
        let fd = unsafe { BorrowedFd::borrow_raw(socket.0) };
        // Non-blocking connect reports EINPROGRESS
        let _ = SockRef::from(&fd).connect(&addr.into());

        self.owners.insert(socket, id);
        if let Some(active) = self.active.get_mut(&id) {
            active.socket = Some(socket);
        }
        self.request_interest(id, socket, PollInterest::Out)
    }

    fn adopt(&mut self, id: HandleId) -> Result<(), EngineError> {
        let (&socket, &previous) = self
            .owners
            .iter()
            .next()
            .ok_or(EngineError::new(CODE_NO_SOCKET))?;
        if let Some(active) = self.active.get_mut(&previous) {
            active.socket = None;
        }
        if let Some(active) = self.active.get_mut(&id) {
            active.socket = Some(socket);
        }
        self.owners.insert(socket, id);
        self.request_interest(id, socket, PollInterest::In)
    }

    fn on_writable(&mut self, id: HandleId, socket: SocketId) -> Result<(), EngineError> {
        if matches!(self.active[&id].plan, Plan::FlappingDownload { .. }) {
            self.request_interest(id, socket, PollInterest::In)?;
            self.request_interest(id, socket, PollInterest::None)?;
        }
        self.request_interest(id, socket, PollInterest::In)
    }

    fn receive(&mut self, id: HandleId, socket: SocketId) {
        let (io, code) = match &self.active[&id] {
            Active {
                transfer,
                plan: Plan::Download { code, .. } | Plan::FlappingDownload { code, .. },
                ..
            } => (transfer.io.clone(), *code),
            _ => return,
        };

        let fd = unsafe { BorrowedFd::borrow_raw(socket.0) };
        let sock_ref = SockRef::from(&fd);
        let mut reader: &Socket = &sock_ref;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return self.finish(id, code),
                Ok(n) => {
                    let received = {
                        let active = self.active.get_mut(&id).expect("active transfer");
                        active.received += n as u64;
                        active.received
                    };
                    let progress = Progress {
                        download_now: received,
                        ..Progress::default()
                    };
                    if io.wants_progress() && !io.progress(progress) {
                        return self.finish(id, CODE_ABORTED_BY_CALLBACK);
                    }
                    if io.write(&buf[..n]) != n {
                        return self.finish(id, CODE_WRITE_ERROR);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return self.finish(id, CODE_RECV_ERROR),
            }
        }
    }

    fn release(&mut self, active: &Active) {
        let Some(socket) = active.socket else {
            return;
        };
        let _ = self.request_interest(active.transfer.id, socket, PollInterest::Remove);
        self.owners.remove(&socket);
        self.tokens.remove(&socket);
        if let Some(hooks) = &active.transfer.sockets {
            hooks.close_socket(socket);
        }
    }

    fn finish(&mut self, id: HandleId, code: i32) {
        if let Some(active) = self.active.remove(&id) {
            self.release(&active);
            self.messages.push(CompletionMessage { handle: id, code });
        }
    }
}

impl TransferEngine for MockEngine {
    fn set_socket_callback(&mut self, callback: SocketCallback) -> Result<(), EngineError> {
        self.socket_callback = Some(callback);
        Ok(())
    }

    fn set_timer_callback(&mut self, callback: TimerCallback) -> Result<(), EngineError> {
        self.timer_callback = Some(callback);
        Ok(())
    }

    fn add(&mut self, transfer: Transfer) -> Result<(), EngineError> {
        let id = transfer.id;
        self.record(Call::Add(id));
        let url = transfer.url().unwrap_or_default().to_string();
        let plan = self
            .plans
            .get(&url)
            .cloned()
            .ok_or(EngineError::new(CODE_BAD_URL))?;
        if self.failing_urls.contains(&url) {
            self.failing_removes.insert(id);
        }

        self.active.insert(
            id,
            Active {
                transfer,
                plan: plan.clone(),
                socket: None,
                received: 0,
            },
        );

        match plan {
            Plan::Immediate(code) => self.finish(id, code),
            Plan::ViaTimer(_) => self.request_timeout(0),
            Plan::Timers(timeouts) => {
                for timeout in timeouts {
                    self.request_timeout(timeout);
                }
            }
            Plan::Download { addr, .. } | Plan::FlappingDownload { addr, .. } => {
                self.request_timeout(30_000);
                if let Err(err) = self.connect(id, addr) {
                    self.active.remove(&id);
                    return Err(err);
                }
            }
            Plan::Adopt => {
                if let Err(err) = self.adopt(id) {
                    self.active.remove(&id);
                    return Err(err);
                }
            }
            Plan::UnknownSocket => {
                self.request_interest(id, SocketId(9999), PollInterest::In)?;
            }
        }
        Ok(())
    }

    fn remove(&mut self, handle: HandleId) -> Result<(), EngineError> {
        self.record(Call::Remove(handle));
        if self.failing_removes.contains(&handle) {
            return Err(EngineError::new(CODE_REMOVE_FAILED));
        }
        if let Some(active) = self.active.remove(&handle) {
            self.release(&active);
            if self.active.is_empty() {
                self.request_timeout(-1);
            }
        }
        Ok(())
    }

    fn socket_action(
        &mut self,
        target: SocketTarget,
        events: EventMask,
    ) -> Result<usize, EngineError> {
        self.record(Call::Action(target, events));
        match target {
            SocketTarget::Timeout => {
                let due: Vec<(HandleId, i32)> = self
                    .active
                    .iter()
                    .filter_map(|(id, active)| match active.plan {
                        Plan::ViaTimer(code) => Some((*id, code)),
                        Plan::Timers(_) => Some((*id, 0)),
                        _ => None,
                    })
                    .collect();
                for (id, code) in due {
                    self.finish(id, code);
                }
            }
            SocketTarget::Socket(socket) => {
                if let Some(&id) = self.owners.get(&socket) {
                    if events.contains(EventMask::ERROR) {
                        self.finish(id, CODE_RECV_ERROR);
                    } else if events.contains(EventMask::WRITE) {
                        self.on_writable(id, socket)?;
                    } else if events.contains(EventMask::READ) {
                        self.receive(id, socket);
                    }
                }
            }
        }
        Ok(self.active.len())
    }

    fn assign(&mut self, socket: SocketId, token: SocketToken) -> Result<(), EngineError> {
        self.record(Call::Assign(socket));
        self.tokens.insert(socket, token);
        Ok(())
    }

    fn drain_messages(&mut self) -> Vec<CompletionMessage> {
        mem::take(&mut self.messages)
    }
}

// ============================================================================
// Blocking Engine
// ============================================================================

/// Blocking engine writing `body` to the sink and returning `code`.
pub struct MockEasy {
    pub body: Vec<u8>,
    pub code: i32,
}

impl EasyEngine for MockEasy {
    fn perform(&mut self, transfer: Transfer) -> Result<(), EngineError> {
        for chunk in self.body.chunks(4) {
            if transfer.io.write(chunk) != chunk.len() {
                return Err(EngineError::new(CODE_WRITE_ERROR));
            }
        }
        EngineError::check(self.code)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub type Outcomes = Rc<RefCell<Vec<Result<(), Error>>>>;

/// Returns a completion callback recording every outcome it receives.
pub fn recorder() -> (Outcomes, impl FnOnce(Result<(), Error>) + 'static) {
    let outcomes: Outcomes = Rc::new(RefCell::new(Vec::new()));
    let sink = outcomes.clone();
    (outcomes, move |result| sink.borrow_mut().push(result))
}

/// Sink sharing its buffer with the test.
#[derive(Clone, Default)]
pub struct SharedSink(pub Rc<RefCell<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Serves `payload` to the first client on a loopback listener, then closes
/// the connection.
pub fn serve_once(payload: Vec<u8>) -> (SocketAddr, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            // The client may already be gone
            let _ = stream.write_all(&payload);
        }
    });
    (addr, server)
}

/// Returns a loopback address nobody listens on.
pub fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
