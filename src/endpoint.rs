use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs as _};

/// Largest datagram a UDP socket can deliver.
const MAX_UDP_SIZE: usize = 65536;

/// One bidirectional UDP association: the outward socket or one relay path.
///
/// An endpoint buffers at most one in-flight send (`send_primary`, a reusable
/// allocation) plus an unbounded FIFO tail (`send_queue`), and exactly one
/// unread datagram (`recv_buf`/`recv_len`). The engine drains the receive
/// slot every tick, so a socket is only read while the slot is empty.
///
/// Readiness is edge-triggered: the selector latches `readable`/`writable`
/// and [`Endpoint::handle`] clears them again when the socket reports
/// `WouldBlock`.
#[derive(Debug)]
pub struct Endpoint {
    socket: mio::net::UdpSocket,
    token: Token,

    local_spec: Option<String>,
    remote_spec: Option<String>,

    remote_addr: Option<SocketAddr>,
    /// When set, `remote_addr` tracks the source of the last received datagram.
    dynamic_remote: bool,

    readable: bool,
    writable: bool,

    send_primary: Vec<u8>,
    send_queue: VecDeque<Vec<u8>>,

    recv_buf: Box<[u8]>,
    recv_len: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("either a local or a remote address is required")]
    MissingAddress,
    #[error("failed to resolve `{spec}`")]
    Resolve {
        spec: String,
        #[source]
        source: io::Error,
    },
    #[error("`{spec}` did not resolve to a usable address")]
    NoUsableAddress { spec: String },
    #[error("failed to bind `{spec}`")]
    Bind {
        spec: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to create socket")]
    Socket(#[source] io::Error),
}

impl Endpoint {
    /// Sets up the socket for a `(local, remote)` address pair.
    ///
    /// With only `remote`, the socket stays unbound and the peer address is
    /// resolved up front, taking the first candidate whose family yields a
    /// socket. With only `local`, the peer is unknown until the
    /// first datagram arrives. At least one of the two must be present.
    /// When both are present, the remote must resolve within the address
    /// family the socket was bound in.
    pub fn new(
        local: Option<&str>,
        remote: Option<&str>,
        token: Token,
    ) -> Result<Self, SetupError> {
        let (socket, remote_addr) = match (local, remote) {
            (None, None) => return Err(SetupError::MissingAddress),
            (Some(local), remote) => {
                let (socket, bound) = bind_first_candidate(local)?;

                let remote_addr = match remote {
                    Some(remote) => Some(
                        resolve(remote, false)?
                            .into_iter()
                            .find(|addr| addr.is_ipv4() == bound.is_ipv4())
                            .ok_or_else(|| SetupError::NoUsableAddress {
                                spec: remote.to_owned(),
                            })?,
                    ),
                    None => None,
                };

                (socket, remote_addr)
            }
            (None, Some(remote)) => {
                let (socket, addr) = socket_for_first_candidate(remote)?;

                (socket, Some(addr))
            }
        };

        Ok(Self {
            socket: mio::net::UdpSocket::from_std(socket.into()),
            token,
            local_spec: local.map(str::to_owned),
            remote_spec: remote.map(str::to_owned),
            remote_addr,
            dynamic_remote: remote.is_none(),
            readable: false,
            writable: false,
            send_primary: Vec::new(),
            send_queue: VecDeque::new(),
            recv_buf: vec![0; MAX_UDP_SIZE].into_boxed_slice(),
            recv_len: 0,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(
            &mut self.socket,
            self.token,
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.socket)
    }

    /// Latches readiness reported by the selector.
    pub fn on_ready(&mut self, event: &mio::event::Event) {
        if event.is_readable() {
            self.readable = true;
        }

        if event.is_writable() {
            self.writable = true;
        }
    }

    /// Whether a call to [`Endpoint::handle`] would perform I/O right now.
    ///
    /// The event loop must not block while this is true: latched readiness is
    /// only reported once, so unread datagrams and undrained queues would
    /// otherwise sit until the next unrelated wake-up.
    pub fn can_make_progress(&self) -> bool {
        (self.readable && self.recv_len == 0) || (self.writable && self.has_pending_sends())
    }

    fn has_pending_sends(&self) -> bool {
        !self.send_primary.is_empty() || !self.send_queue.is_empty()
    }

    /// Queues a copy of `payload` for transmission. Never blocks.
    ///
    /// While the endpoint is idle the payload goes into the reusable primary
    /// buffer; otherwise it is appended to the tail queue as its own
    /// allocation. A dynamic endpoint that has not learned its peer yet
    /// silently drops the payload.
    pub fn enqueue(&mut self, payload: &[u8]) {
        if self.remote_addr.is_none() {
            return;
        }

        if self.has_pending_sends() {
            self.send_queue.push_back(payload.to_vec());
            return;
        }

        if self.send_primary.capacity() < payload.len() {
            let grown = if self.send_primary.capacity() == 0 {
                payload.len()
            } else {
                payload.len() + payload.len() / 2
            };

            self.send_primary = Vec::with_capacity(grown);
        }

        self.send_primary.extend_from_slice(payload);
    }

    /// Drains the receive slot.
    ///
    /// The returned bytes reference the internal buffer and stay valid until
    /// the next call that can refill it.
    pub fn receive(&mut self) -> Option<&[u8]> {
        if self.recv_len == 0 {
            return None;
        }

        let len = mem::take(&mut self.recv_len);

        Some(&self.recv_buf[..len])
    }

    /// Performs at most one read and at most one write.
    ///
    /// Transient conditions (`WouldBlock`, `Interrupted`, `EMSGSIZE`) are
    /// absorbed; an `Err` means the socket is broken and the endpoint must be
    /// removed.
    pub fn handle(&mut self) -> io::Result<()> {
        if self.readable && self.recv_len == 0 {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((0, _)) => {}
                Ok((len, from)) => {
                    self.recv_len = len;

                    if self.dynamic_remote {
                        self.remote_addr = Some(from);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.readable = false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        if self.writable && self.has_pending_sends() {
            let Some(remote) = self.remote_addr else {
                // Only reachable once a dynamic peer has been learned, so the
                // address is always present by the time sends are queued.
                return Ok(());
            };

            if !self.send_primary.is_empty() {
                match self.socket.send_to(&self.send_primary, remote) {
                    Ok(0) => return Err(zero_length_send()),
                    Ok(_) => self.send_primary.clear(),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.writable = false,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => {
                        tracing::debug!(endpoint = %self, "Dropping over-sized datagram");
                        self.send_primary.clear();
                    }
                    Err(e) => return Err(e),
                }
            } else if let Some(head) = self.send_queue.front() {
                match self.socket.send_to(head, remote) {
                    Ok(0) => return Err(zero_length_send()),
                    Ok(_) => {
                        self.send_queue.pop_front();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.writable = false,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => {
                        tracing::debug!(endpoint = %self, "Dropping over-sized datagram");
                        self.send_queue.pop_front();
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
impl Endpoint {
    pub(crate) fn inject_datagram(&mut self, payload: &[u8]) {
        self.recv_buf[..payload.len()].copy_from_slice(payload);
        self.recv_len = payload.len();
    }

    pub(crate) fn force_writable(&mut self) {
        self.writable = true;
    }

    pub(crate) fn primary(&self) -> &[u8] {
        &self.send_primary
    }

    pub(crate) fn pending_sends(&self) -> usize {
        usize::from(!self.send_primary.is_empty()) + self.send_queue.len()
    }

    pub(crate) fn raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd as _;

        self.socket.as_raw_fd()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = self.local_spec.as_deref().unwrap_or("<unspec>");
        let remote = self.remote_spec.as_deref().unwrap_or("<dynamic>");

        write!(f, "{local} -> {remote}")
    }
}

fn zero_length_send() -> io::Error {
    io::Error::new(io::ErrorKind::WriteZero, "socket accepted a zero-length send")
}

/// Resolves `spec` (`host:port`) into candidate addresses.
///
/// `*` as the host stands for the wildcard address of both families, but only
/// where the result will be bound; as a peer address it is an error.
fn resolve(spec: &str, passive: bool) -> Result<Vec<SocketAddr>, SetupError> {
    if passive && let Some(port) = spec.strip_prefix("*:") {
        let port = port.parse::<u16>().map_err(|e| SetupError::Resolve {
            spec: spec.to_owned(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        return Ok(vec![
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        ]);
    }

    let addrs = spec
        .to_socket_addrs()
        .map_err(|source| SetupError::Resolve {
            spec: spec.to_owned(),
            source,
        })?
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(SetupError::NoUsableAddress {
            spec: spec.to_owned(),
        });
    }

    Ok(addrs)
}

/// Binds a socket on the first candidate of `spec` that works.
fn bind_first_candidate(spec: &str) -> Result<(Socket, SocketAddr), SetupError> {
    let mut last_err = None;

    for candidate in resolve(spec, true)? {
        let socket = match make_socket(candidate) {
            Ok(socket) => socket,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };

        match socket.bind(&SockAddr::from(candidate)) {
            Ok(()) => return Ok((socket, candidate)),
            Err(e) => last_err = Some(e),
        }
    }

    Err(SetupError::Bind {
        spec: spec.to_owned(),
        source: last_err.unwrap_or_else(|| io::ErrorKind::AddrNotAvailable.into()),
    })
}

/// Creates a socket in the family of the first candidate of `spec` that
/// works, for endpoints that stay unbound.
fn socket_for_first_candidate(spec: &str) -> Result<(Socket, SocketAddr), SetupError> {
    let mut last_err = None;

    for candidate in resolve(spec, false)? {
        match make_socket(candidate) {
            Ok(socket) => return Ok((socket, candidate)),
            Err(e) => last_err = Some(e),
        }
    }

    Err(SetupError::Socket(
        last_err.unwrap_or_else(|| io::ErrorKind::AddrNotAvailable.into()),
    ))
}

/// A non-blocking datagram socket with `SO_REUSEADDR`, in `addr`'s family.
fn make_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::thread;
    use std::time::Duration;

    fn peer() -> UdpSocket {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        peer
    }

    fn endpoint_towards(peer: &UdpSocket) -> Endpoint {
        Endpoint::new(
            Some("127.0.0.1:0"),
            Some(&peer.local_addr().unwrap().to_string()),
            Token(9),
        )
        .unwrap()
    }

    fn wait_for_datagram(endpoint: &mut Endpoint) {
        for _ in 0..200 {
            endpoint.readable = true;
            endpoint.handle().unwrap();

            if endpoint.recv_len > 0 {
                return;
            }

            thread::sleep(Duration::from_millis(5));
        }

        panic!("datagram never arrived");
    }

    #[test]
    fn at_least_one_address_is_required() {
        let err = Endpoint::new(None, None, Token(9)).unwrap_err();

        assert!(matches!(err, SetupError::MissingAddress));
    }

    #[test]
    fn wildcard_is_rejected_as_peer_address() {
        let err = Endpoint::new(None, Some("*:4000"), Token(9)).unwrap_err();

        assert!(matches!(err, SetupError::Resolve { .. }));
    }

    #[test]
    fn binding_a_foreign_address_fails() {
        // 192.0.2.0/24 is reserved for documentation and never assigned locally.
        let err = Endpoint::new(Some("192.0.2.1:0"), None, Token(9)).unwrap_err();

        assert!(matches!(err, SetupError::Bind { .. }));
    }

    #[test]
    fn remote_only_endpoints_resolve_the_peer_up_front() {
        let mut endpoint = Endpoint::new(None, Some("127.0.0.1:4000"), Token(9)).unwrap();

        assert_eq!(
            endpoint.remote_addr(),
            Some("127.0.0.1:4000".parse().unwrap())
        );

        // The peer is known, so sends are buffered rather than dropped.
        endpoint.enqueue(b"kept");
        assert_eq!(endpoint.pending_sends(), 1);
    }

    #[test]
    fn dynamic_endpoint_drops_sends_until_peer_is_known() {
        let mut endpoint = Endpoint::new(Some("127.0.0.1:0"), None, Token(9)).unwrap();

        endpoint.enqueue(b"lost");

        assert_eq!(endpoint.pending_sends(), 0);
    }

    #[test]
    fn queued_sends_drain_in_order() {
        let peer = peer();
        let mut endpoint = endpoint_towards(&peer);

        endpoint.enqueue(b"one");
        endpoint.enqueue(b"two");
        endpoint.enqueue(b"three");

        assert_eq!(endpoint.pending_sends(), 3);
        assert_eq!(endpoint.send_queue.len(), 2);

        let mut buf = [0; 64];
        for expected in [&b"one"[..], b"two", b"three"] {
            endpoint.writable = true;
            endpoint.handle().unwrap();

            let (len, _) = peer.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..len], expected);
        }

        assert!(!endpoint.has_pending_sends());
    }

    #[test]
    fn primary_buffer_is_reused_and_grows_by_half() {
        let peer = peer();
        let mut endpoint = endpoint_towards(&peer);

        endpoint.enqueue(b"aa");
        endpoint.writable = true;
        endpoint.handle().unwrap();
        assert!(endpoint.send_primary.is_empty());

        endpoint.enqueue(&[0; 100]);
        assert!(endpoint.send_primary.capacity() >= 150);

        endpoint.writable = true;
        endpoint.handle().unwrap();

        let capacity = endpoint.send_primary.capacity();
        endpoint.enqueue(b"bb");

        assert_eq!(endpoint.send_primary.capacity(), capacity);
        assert_eq!(endpoint.primary(), b"bb");
    }

    #[test]
    fn receive_drains_the_single_slot() {
        let mut endpoint = Endpoint::new(Some("127.0.0.1:0"), None, Token(7)).unwrap();
        let sender = peer();
        sender
            .send_to(b"payload", endpoint.local_addr().unwrap())
            .unwrap();

        wait_for_datagram(&mut endpoint);

        assert_eq!(endpoint.receive(), Some(&b"payload"[..]));
        assert_eq!(endpoint.receive(), None);

        // No peer was configured, so the sender's address was learned.
        assert_eq!(endpoint.remote_addr(), Some(sender.local_addr().unwrap()));
    }

    #[test]
    fn full_slot_blocks_further_reads() {
        let mut endpoint = Endpoint::new(Some("127.0.0.1:0"), None, Token(7)).unwrap();
        let sender = peer();
        let target = endpoint.local_addr().unwrap();

        sender.send_to(b"first", target).unwrap();
        sender.send_to(b"second", target).unwrap();

        wait_for_datagram(&mut endpoint);

        // The slot is full: another handle call must not overwrite it.
        endpoint.readable = true;
        endpoint.handle().unwrap();

        assert_eq!(endpoint.receive(), Some(&b"first"[..]));

        wait_for_datagram(&mut endpoint);

        assert_eq!(endpoint.receive(), Some(&b"second"[..]));
    }
}
