use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::seen::SeenSet;
use crate::wire;
use anyhow::{Context as _, Result};
use mio::{Events, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const WAKER: Token = Token(0);
const OUTWARD: Token = Token(1);
const FIRST_RELAY: Token = Token(2);

/// The multiplex engine: one outward endpoint, a circular list of relay
/// endpoints, and the dedup window shared across all of them.
///
/// Datagrams received outward are stamped with `seq` and fanned out to every
/// relay; datagrams received from any relay are deduplicated by their
/// sequence number and the first copy is forwarded outward with the header
/// stripped. Everything runs on the calling thread; the only blocking point
/// is the readiness wait in [`Server::run`].
pub struct Server {
    poll: Poll,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,

    outward: Endpoint,
    relays: Vec<Endpoint>,
    /// Round-robin start position for the next fan-out.
    cursor: usize,

    seen: SeenSet,
    /// Next sequence number to stamp on an outward-inbound datagram.
    seq: u16,
    wrap_buf: Vec<u8>,
}

/// Asks a running [`Server`] to exit its event loop.
///
/// Cheap to clone and safe to use from another thread; the termination
/// handler only stores a flag and wakes the blocked poll.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Relaxed);
        let _ = self.waker.wake();
    }
}

impl Server {
    /// Resolves and binds every endpoint in `config`.
    ///
    /// Any endpoint that cannot be set up aborts construction; everything
    /// created so far is torn down on the way out.
    pub fn new(config: &Config) -> Result<Self> {
        let poll = Poll::new().context("failed to create selector")?;
        let waker =
            Waker::new(poll.registry(), WAKER).context("failed to create shutdown waker")?;

        let outward = Endpoint::new(config.listen.as_deref(), config.forward.as_deref(), OUTWARD)
            .context("failed to set up outward endpoint")?;
        tracing::info!(endpoint = %outward, "Outward endpoint ready");

        let mut relays = Vec::with_capacity(config.relays.len());
        for (i, relay) in config.relays.iter().enumerate() {
            let endpoint = Endpoint::new(
                Some(&relay.local),
                Some(&relay.remote),
                Token(FIRST_RELAY.0 + i),
            )
            .with_context(|| format!("failed to set up relay {} -> {}", relay.local, relay.remote))?;
            tracing::info!(endpoint = %endpoint, "Added relay");

            relays.push(endpoint);
        }

        Ok(Self {
            poll,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
            outward,
            relays,
            cursor: 0,
            seen: SeenSet::new(config.track),
            seq: 0,
            wrap_buf: Vec::new(),
        })
    }

    pub fn outward_addr(&self) -> io::Result<SocketAddr> {
        self.outward.local_addr()
    }

    pub fn num_relays(&self) -> usize {
        self.relays.len()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Runs the event loop until shutdown is requested or the outward
    /// endpoint fails.
    pub fn run(&mut self) -> Result<()> {
        let registry = self.poll.registry();

        self.outward
            .register(registry)
            .context("failed to register outward endpoint")?;

        for relay in &mut self.relays {
            relay
                .register(registry)
                .context("failed to register relay endpoint")?;
        }

        let mut events = Events::with_capacity(64);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            // Readiness is latched, so endpoints that can still progress must
            // be serviced before blocking again.
            let timeout = self.can_make_progress().then_some(Duration::ZERO);

            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("readiness wait failed"),
            }

            for event in events.iter() {
                let token = event.token();

                if token == WAKER {
                    continue;
                }

                if token == self.outward.token() {
                    self.outward.on_ready(event);
                } else if let Some(relay) =
                    self.relays.iter_mut().find(|relay| relay.token() == token)
                {
                    relay.on_ready(event);
                }
            }

            self.tick()?;
        }

        tracing::info!("Terminating");

        Ok(())
    }

    /// One pass over all endpoints: socket I/O, then dispatch.
    fn tick(&mut self) -> Result<()> {
        if let Err(e) = self.outward.handle() {
            return Err(e).context("outward endpoint failed");
        }

        let mut i = 0;
        while i < self.relays.len() {
            match self.relays[i].handle() {
                Ok(()) => i += 1,
                Err(e) => {
                    tracing::warn!(endpoint = %self.relays[i], error = %e, "Relay disabled");
                    self.remove_relay(i);
                }
            }
        }

        self.dispatch_inbound();
        self.dispatch_relayed();

        Ok(())
    }

    fn can_make_progress(&self) -> bool {
        self.outward.can_make_progress()
            || self.relays.iter().any(Endpoint::can_make_progress)
    }

    /// Wraps one outward-inbound payload and fans it out to every relay.
    ///
    /// Traversal starts at `cursor` and covers each relay exactly once; the
    /// cursor then advances so the next fan-out starts one position later.
    /// With no relays left this degrades to counting the datagram.
    fn dispatch_inbound(&mut self) {
        let Some(payload) = self.outward.receive() else {
            return;
        };

        wire::wrap(self.seq, payload, &mut self.wrap_buf);

        let relays = self.relays.len();
        for i in 0..relays {
            self.relays[(self.cursor + i) % relays].enqueue(&self.wrap_buf);
        }

        self.seq = self.seq.wrapping_add(1);

        if relays > 0 {
            self.cursor = (self.cursor + 1) % relays;
        }
    }

    /// Forwards the first copy of each relay-inbound payload outward.
    fn dispatch_relayed(&mut self) {
        for i in 0..self.relays.len() {
            let Some(msg) = self.relays[i].receive() else {
                continue;
            };

            let packet = match wire::RelayPacket::parse(msg) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!(error = %e, "Dropping malformed relay datagram");
                    continue;
                }
            };

            if !self.seen.push(packet.seq()) {
                // Another path delivered this datagram first.
                continue;
            }

            self.outward.enqueue(packet.payload());
        }
    }

    fn remove_relay(&mut self, index: usize) {
        let mut relay = self.relays.remove(index);
        let _ = relay.deregister(self.poll.registry());

        if self.cursor > index {
            self.cursor -= 1;
        }

        if self.cursor >= self.relays.len() {
            self.cursor = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    /// A server with `relay_count` relays, each pointed at a fresh local
    /// peer. The sockets are returned so the addresses stay taken.
    fn test_server(relay_count: usize) -> (Server, Vec<UdpSocket>) {
        let mut peers = Vec::new();

        let forward = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut text = format!(
            "listen 127.0.0.1:0\nforward 127.0.0.1:{}\n",
            forward.local_addr().unwrap().port()
        );

        for _ in 0..relay_count {
            let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
            text.push_str(&format!(
                "relay local 127.0.0.1:0 remote 127.0.0.1:{}\n",
                peer.local_addr().unwrap().port()
            ));
            peers.push(peer);
        }

        peers.push(forward);

        let server = Server::new(&Config::parse(&text).unwrap()).unwrap();

        (server, peers)
    }

    #[test]
    fn fan_out_reaches_every_relay_and_advances_the_cursor() {
        let (mut server, _peers) = test_server(2);

        server.outward.inject_datagram(b"x");
        server.dispatch_inbound();

        assert_eq!(server.relays[0].primary(), b"\x00\x00x");
        assert_eq!(server.relays[1].primary(), b"\x00\x00x");
        assert_eq!(server.seq, 1);
        assert_eq!(server.cursor, 1);
    }

    #[test]
    fn sequence_number_wraps_around() {
        let (mut server, _peers) = test_server(1);
        server.seq = u16::MAX;

        server.outward.inject_datagram(b"x");
        server.dispatch_inbound();

        assert_eq!(server.relays[0].primary(), b"\xff\xffx");
        assert_eq!(server.seq, 0);

        server.relays[0].force_writable();
        server.relays[0].handle().unwrap();

        server.outward.inject_datagram(b"y");
        server.dispatch_inbound();

        assert_eq!(server.relays[0].primary(), b"\x00\x00y");
    }

    #[test]
    fn fan_out_without_relays_still_counts_the_datagram() {
        let (mut server, _peers) = test_server(1);
        server.remove_relay(0);

        server.outward.inject_datagram(b"x");
        server.dispatch_inbound();

        assert_eq!(server.num_relays(), 0);
        assert_eq!(server.seq, 1);
    }

    #[test]
    fn removing_relays_keeps_the_cursor_on_the_next_start() {
        let (mut server, _peers) = test_server(3);
        server.cursor = 2;

        server.remove_relay(1);
        assert_eq!(server.cursor, 1);

        server.remove_relay(1);
        assert_eq!(server.cursor, 0);

        server.remove_relay(0);
        assert_eq!(server.cursor, 0);
        assert_eq!(server.num_relays(), 0);
    }

    #[test]
    fn fatal_relay_is_disabled_and_dropped_from_fan_out() {
        use std::os::fd::AsRawFd as _;

        let (mut server, _peers) = test_server(2);

        server.relays[0].enqueue(b"x");
        server.relays[0].force_writable();

        // Swap a non-socket descriptor in under the first relay so its next
        // send fails for good. dup2 (rather than a bare close) keeps the
        // descriptor number owned by the endpoint until it is dropped.
        let dev_null = std::fs::File::open("/dev/null").unwrap();
        // SAFETY: both descriptors are open; dup2 atomically replaces the
        // relay's descriptor without invalidating `dev_null`'s.
        unsafe { libc::dup2(dev_null.as_raw_fd(), server.relays[0].raw_fd()) };

        server.tick().unwrap();

        assert_eq!(server.num_relays(), 1);
        assert_eq!(server.cursor, 0);

        // Subsequent fan-outs reach only the surviving relay.
        server.outward.inject_datagram(b"hello");
        server.dispatch_inbound();

        assert_eq!(server.relays[0].primary(), b"\x00\x00hello");
        assert_eq!(server.seq, 1);
    }

    #[test]
    fn cross_relay_duplicates_are_dropped() {
        let (mut server, _peers) = test_server(2);

        server.relays[0].inject_datagram(b"\x00\x01pong");
        server.dispatch_relayed();

        assert_eq!(server.outward.pending_sends(), 1);
        assert_eq!(server.outward.primary(), b"pong");

        server.relays[1].inject_datagram(b"\x00\x01pong");
        server.dispatch_relayed();

        assert_eq!(server.outward.pending_sends(), 1);
    }

    #[test]
    fn header_only_datagrams_leave_no_trace() {
        let (mut server, _peers) = test_server(1);

        server.relays[0].inject_datagram(b"\x00\x07");
        server.dispatch_relayed();

        assert_eq!(server.outward.pending_sends(), 0);

        // The dropped datagram must not have claimed its sequence number.
        server.relays[0].inject_datagram(b"\x00\x07x");
        server.dispatch_relayed();

        assert_eq!(server.outward.primary(), b"x");
    }
}
