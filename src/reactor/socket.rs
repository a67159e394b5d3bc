use super::{Direction, Reactor, WaitError};
use crate::engine::{AddressFamily, SocketId};
use crate::error::Error;

use mio::net::TcpStream;
use mio::Token;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io::{self, ErrorKind};
use std::os::fd::AsRawFd;
use tracing::{debug, trace};

/// A non-blocking TCP socket registered with a [`Reactor`].
///
/// The socket is created unconnected; connecting it is up to the transfer
/// engine, which learns its descriptor through [`SocketResource::id`].
/// Dropping the resource completes any outstanding readiness waits with
/// [`WaitError::Aborted`], deregisters it from the reactor and closes the
/// descriptor.
pub struct SocketResource {
    stream: TcpStream,
    token: Token,
    reactor: Reactor,
}

impl fmt::Debug for SocketResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketResource")
            .field("id", &self.id())
            .field("token", &self.token)
            .finish()
    }
}

impl SocketResource {
    /// Opens a new TCP stream socket of the given address family.
    ///
    /// Families other than IPv4 and IPv6 fail with
    /// [`ErrorKind::Unsupported`].
    pub fn open(reactor: &Reactor, family: AddressFamily) -> io::Result<Self> {
        let domain = match family {
            AddressFamily::Inet => Domain::IPV4,
            AddressFamily::Inet6 => Domain::IPV6,
            AddressFamily::Other(raw) => {
                return Err(io::Error::new(
                    ErrorKind::Unsupported,
                    format!("unsupported address family {raw}"),
                ));
            }
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        let stream = TcpStream::from_std(std::net::TcpStream::from(socket));
        let token = reactor.add_source();

        debug!(socket = %SocketId(stream.as_raw_fd()), ?family, "Opened socket");

        Ok(Self {
            stream,
            token,
            reactor: reactor.clone(),
        })
    }

    /// Returns the descriptor identifying this socket to the engine.
    pub fn id(&self) -> SocketId {
        SocketId(self.stream.as_raw_fd())
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }

    /// Waits once for the socket to become readable.
    ///
    /// Replacing an outstanding read wait completes the earlier one with
    /// [`WaitError::Aborted`].
    pub fn wait_readable<F>(&mut self, callback: F) -> io::Result<()>
    where
        F: FnOnce(Result<(), WaitError>) -> Result<(), Error> + 'static,
    {
        self.wait(Direction::Read, Box::new(callback))
    }

    /// Waits once for the socket to become writable.
    pub fn wait_writable<F>(&mut self, callback: F) -> io::Result<()>
    where
        F: FnOnce(Result<(), WaitError>) -> Result<(), Error> + 'static,
    {
        self.wait(Direction::Write, Box::new(callback))
    }

    /// Completes all outstanding waits with [`WaitError::Aborted`].
    ///
    /// The completions run from the reactor, never from within this call.
    pub fn cancel(&self) {
        self.reactor.cancel_source(self.token);
    }

    fn wait(&mut self, direction: Direction, waiter: super::Waiter) -> io::Result<()> {
        trace!(socket = %self.id(), ?direction, "Waiting for readiness");
        self.reactor
            .subscribe(self.token, &mut self.stream, direction, waiter)
    }
}

impl Drop for SocketResource {
    fn drop(&mut self) {
        debug!(socket = %self.id(), "Closing socket");
        self.reactor.remove_source(self.token, &mut self.stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::config::Config;
    use socket2::SockRef;
    use std::cell::RefCell;
    use std::net::TcpListener;
    use std::rc::Rc;

    fn reactor() -> Reactor {
        Reactor::new(&Config::default()).unwrap()
    }

    fn connected(reactor: &Reactor) -> (SocketResource, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let socket = SocketResource::open(reactor, AddressFamily::Inet).unwrap();
        let addr = listener.local_addr().unwrap();
        // Non-blocking connect reports EINPROGRESS; accept() waits it out
        let _ = SockRef::from(&socket.stream).connect(&addr.into());
        let (peer, _) = listener.accept().unwrap();
        (socket, peer)
    }

    #[test]
    fn unsupported_family_is_rejected() {
        let reactor = reactor();
        let err = SocketResource::open(&reactor, AddressFamily::Other(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn writable_wait_completes() {
        let reactor = reactor();
        let (mut socket, _peer) = connected(&reactor);
        let outcome = Rc::new(RefCell::new(None));
        {
            let outcome = outcome.clone();
            socket
                .wait_writable(move |result| {
                    *outcome.borrow_mut() = Some(result.is_ok());
                    Ok(())
                })
                .unwrap();
        }
        reactor.run().unwrap();
        assert_eq!(*outcome.borrow(), Some(true));
    }

    #[test]
    fn cancel_completes_waits_with_aborted() {
        let reactor = reactor();
        let (mut socket, _peer) = connected(&reactor);
        let outcome = Rc::new(RefCell::new(None));
        {
            let outcome = outcome.clone();
            socket
                .wait_readable(move |result| {
                    *outcome.borrow_mut() = Some(matches!(result, Err(WaitError::Aborted)));
                    Ok(())
                })
                .unwrap();
        }
        socket.cancel();
        assert!(outcome.borrow().is_none());
        reactor.run().unwrap();
        assert_eq!(*outcome.borrow(), Some(true));
    }

    #[test]
    fn drop_completes_waits_with_aborted() {
        let reactor = reactor();
        let (mut socket, _peer) = connected(&reactor);
        let outcome = Rc::new(RefCell::new(None));
        {
            let outcome = outcome.clone();
            socket
                .wait_readable(move |result| {
                    *outcome.borrow_mut() = Some(matches!(result, Err(WaitError::Aborted)));
                    Ok(())
                })
                .unwrap();
        }
        drop(socket);
        reactor.run().unwrap();
        assert_eq!(*outcome.borrow(), Some(true));
        assert!(!reactor.has_work());
    }
}
