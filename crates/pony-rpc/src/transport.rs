//! Socket transport for the messaging fabric.
//!
//! A hub [`Transport::bind`]s a listening endpoint and serves every accepted
//! peer on its own task. An agent [`Transport::connect`]s: one supervisor
//! task dials the hub, performs the handshake and redials with backoff
//! whenever the connection is lost.
//!
//! Connection tasks never touch routing state. They report
//! [`TransportEvent`]s on a single channel, in the order they happen, and the
//! router consuming that channel is the only owner of the route table.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pony_types::{Identity, Role};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::address::Address;
use crate::backoff::Backoff;
use crate::codec::{Frame, PacketCodec};
use crate::error::TransportError;
use crate::protocol::{HANDSHAKE_TIMEOUT, Message, Packet};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type ConnectionId = u64;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed)
}

/// Any byte stream a peer connection can run over.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

type PeerFramed = Framed<Box<dyn PeerStream>, PacketCodec>;
type PacketSink = SplitSink<PeerFramed, Packet>;
type PacketStream = SplitStream<PeerFramed>;

pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Write side of one live connection.
///
/// Packets pushed through a link are written in push order by the
/// connection's writer task.
#[derive(Debug, Clone)]
pub struct Link {
    sender: mpsc::UnboundedSender<Packet>,
    closer: CancellationToken,
}

impl Link {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Packet>, closer: CancellationToken) -> Self {
        Self { sender, closer }
    }

    /// Queue a packet for the peer.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` if the connection is gone.
    pub fn send(&self, packet: Packet) -> Result<(), TransportError> {
        if self.closer.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.sender.send(packet).map_err(|_| TransportError::Closed)
    }

    /// Drop the connection. The peer sees the socket close.
    pub fn close(&self) {
        self.closer.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled() || self.sender.is_closed()
    }
}

/// Connection lifecycle and traffic, as observed by the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// Handshake completed. `local` is the identity this side was registered
    /// under, reported only on the agent side.
    Connected {
        conn: ConnectionId,
        peer: Identity,
        local: Option<Identity>,
        link: Link,
    },
    Received {
        conn: ConnectionId,
        message: Message,
    },
    Disconnected {
        conn: ConnectionId,
    },
}

#[derive(Debug)]
pub struct Transport {
    role: Role,
    address: Address,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    socket_file: Option<PathBuf>,
}

impl Transport {
    /// Open a listening endpoint and accept peers until closed.
    ///
    /// For `tcp://` addresses with port 0 the returned transport reports the
    /// port actually bound.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::AddrInUse` if another process listens on the
    /// address, or `TransportError::Io` for any other bind failure.
    pub async fn bind(
        address: &Address,
        hub: Identity,
    ) -> Result<(Self, EventReceiver), TransportError> {
        let (listener, bound, socket_file) = Listener::bind(address).await?;
        info!("Hub {} listening on {}", hub, bound);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, hub, events_tx, shutdown.clone()));

        Ok((
            Self {
                role: Role::Hub,
                address: bound,
                shutdown,
                task: Some(task),
                socket_file,
            },
            events_rx,
        ))
    }

    /// Maintain one outbound connection to the hub at `address`.
    ///
    /// Returns immediately; dialing happens in the background and is retried
    /// with `backoff` for as long as the transport is open. `identity` is
    /// advertised in every handshake.
    #[must_use]
    pub fn connect(
        address: Address,
        identity: Option<Identity>,
        backoff: Backoff,
    ) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervise_upstream(
            address.clone(),
            identity,
            backoff,
            events_tx,
            shutdown.clone(),
        ));

        (
            Self {
                role: Role::Agent,
                address,
                shutdown,
                task: Some(task),
                socket_file: None,
            },
            events_rx,
        )
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The bound address (hub) or the dialed address (agent).
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// Stop accepting or dialing, drop every connection and remove the
    /// socket file this transport created. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.task.take().is_none() {
            return;
        }
        self.shutdown.cancel();

        if let Some(path) = self.socket_file.take()
            && path.exists()
            && let Err(e) = std::fs::remove_file(&path)
        {
            warn!("Failed to remove socket file {:?}: {}", path, e);
        }

        debug!("Transport for {} closed", self.address);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn bind(address: &Address) -> Result<(Self, Address, Option<PathBuf>), TransportError> {
        match address {
            Address::Tcp(host_port) => {
                let listener = TcpListener::bind(host_port.as_str())
                    .await
                    .map_err(|e| match e.kind() {
                        std::io::ErrorKind::AddrInUse => {
                            TransportError::AddrInUse(address.to_string())
                        }
                        _ => TransportError::Io(e),
                    })?;
                let bound = Address::Tcp(listener.local_addr()?.to_string());
                Ok((Listener::Tcp(listener), bound, None))
            }
            Address::Ipc(path) => {
                cleanup_stale_socket(path).await?;
                let listener = UnixListener::bind(path)?;
                Ok((Listener::Unix(listener), address.clone(), Some(path.clone())))
            }
        }
    }

    async fn accept(&self) -> std::io::Result<Box<dyn PeerStream>> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Listener::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

async fn cleanup_stale_socket(path: &Path) -> Result<(), TransportError> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(TransportError::AddrInUse(path.display().to_string()));
        }
        info!("Removing stale socket at {}", path.display());
        std::fs::remove_file(path)?;
    }
    Ok(())
}

async fn dial(address: &Address) -> std::io::Result<Box<dyn PeerStream>> {
    match address {
        Address::Tcp(host_port) => {
            let stream = TcpStream::connect(host_port.as_str()).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        Address::Ipc(path) => Ok(Box::new(UnixStream::connect(path).await?)),
    }
}

fn generated_identity() -> Option<Identity> {
    Identity::new(uuid::Uuid::new_v4().to_string()).ok()
}

async fn accept_loop(
    listener: Listener,
    hub: Identity,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let conn = next_connection_id();
                    debug!("[conn {}] Accepted connection", conn);
                    tokio::spawn(serve_peer(
                        conn,
                        stream,
                        hub.clone(),
                        events.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => error!("Accept error: {}", e),
            }
        }
    }
    debug!("Accept loop stopped");
}

async fn serve_peer(
    conn: ConnectionId,
    stream: Box<dyn PeerStream>,
    hub: Identity,
    events: mpsc::UnboundedSender<TransportEvent>,
    closer: CancellationToken,
) {
    let mut framed: PeerFramed = Framed::new(stream, PacketCodec::new());

    let advertised = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(Frame::Packet(Packet::Hello { identity })))) => identity,
        Ok(Some(Ok(Frame::Packet(other)))) => {
            warn!("[conn {}] Expected hello, got {}", conn, other.op());
            return;
        }
        Ok(Some(Ok(Frame::Malformed { len, reason }))) => {
            warn!("[conn {}] Malformed hello ({} bytes): {}", conn, len, reason);
            return;
        }
        Ok(Some(Err(e))) => {
            warn!("[conn {}] Handshake read error: {}", conn, e);
            return;
        }
        Ok(None) => {
            debug!("[conn {}] Closed before handshake", conn);
            return;
        }
        Err(_) => {
            warn!("[conn {}] Handshake timed out", conn);
            return;
        }
    };

    let Some(identity) = advertised.or_else(generated_identity) else {
        return;
    };

    let welcome = Packet::Welcome {
        hub,
        identity: identity.clone(),
    };
    if let Err(e) = framed.send(welcome).await {
        warn!("[conn {}] Failed to send welcome to {}: {}", conn, identity, e);
        return;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let link = Link::new(tx, closer.clone());
    let connected = TransportEvent::Connected {
        conn,
        peer: identity,
        local: None,
        link,
    };
    if events.send(connected).is_err() {
        return;
    }

    let (sink, stream) = framed.split();
    pump(conn, sink, stream, rx, &events, closer).await;
}

struct Established {
    framed: PeerFramed,
    hub: Identity,
    identity: Identity,
}

async fn establish(
    address: &Address,
    identity: Option<&Identity>,
) -> Result<Established, TransportError> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, dial(address))
        .await
        .map_err(|_| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })??;

    let mut framed: PeerFramed = Framed::new(stream, PacketCodec::new());
    framed
        .send(Packet::Hello {
            identity: identity.cloned(),
        })
        .await?;

    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| TransportError::HandshakeTimeout)?;

    match reply {
        Some(Ok(Frame::Packet(Packet::Welcome { hub, identity }))) => Ok(Established {
            framed,
            hub,
            identity,
        }),
        Some(Ok(Frame::Packet(other))) => Err(TransportError::Handshake(format!(
            "expected welcome, got {}",
            other.op()
        ))),
        Some(Ok(Frame::Malformed { reason, .. })) => Err(TransportError::Handshake(format!(
            "malformed welcome: {reason}"
        ))),
        Some(Err(e)) => Err(e.into()),
        None => Err(TransportError::Closed),
    }
}

async fn supervise_upstream(
    address: Address,
    identity: Option<Identity>,
    backoff: Backoff,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) {
    let mut delays = backoff.delays();
    let mut failures: u64 = 0;

    loop {
        let outcome = tokio::select! {
            () = shutdown.cancelled() => break,
            outcome = establish(&address, identity.as_ref()) => outcome,
        };

        match outcome {
            Ok(Established {
                framed,
                hub,
                identity: assigned,
            }) => {
                info!("Connected to hub {} at {} as {}", hub, address, assigned);
                delays = backoff.delays();
                failures = 0;

                let conn = next_connection_id();
                let (tx, rx) = mpsc::unbounded_channel();
                let closer = shutdown.child_token();
                let connected = TransportEvent::Connected {
                    conn,
                    peer: hub,
                    local: Some(assigned),
                    link: Link::new(tx, closer.clone()),
                };
                if events.send(connected).is_err() {
                    break;
                }

                let (sink, stream) = framed.split();
                pump(conn, sink, stream, rx, &events, closer).await;

                if shutdown.is_cancelled() {
                    break;
                }
                warn!("Lost connection to hub at {}, reconnecting", address);
            }
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    warn!("Hub at {} unreachable ({}), retrying", address, e);
                } else {
                    debug!("Connect attempt {} to {} failed: {}", failures, address, e);
                }
            }
        }

        let delay = delays.next().unwrap_or(backoff.max);
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    debug!("Upstream supervisor for {} stopped", address);
}

/// Move packets in and out of one established connection until either side
/// closes it, then report the disconnect.
async fn pump(
    conn: ConnectionId,
    mut sink: PacketSink,
    mut stream: PacketStream,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    closer: CancellationToken,
) {
    let send_task = tokio::spawn(async move {
        trace!("[conn {}] send_task started", conn);
        while let Some(packet) = outbound.recv().await {
            if let Err(e) = sink.send(packet).await {
                warn!("[conn {}] Write error: {}", conn, e);
                break;
            }
        }
        trace!("[conn {}] send_task ended", conn);
    });

    loop {
        tokio::select! {
            () = closer.cancelled() => {
                debug!("[conn {}] Closed locally", conn);
                break;
            }
            next = stream.next() => match next {
                Some(Ok(Frame::Packet(Packet::Message(message)))) => {
                    trace!("[conn {}] Received kind={}", conn, message.kind);
                    if events.send(TransportEvent::Received { conn, message }).is_err() {
                        break;
                    }
                }
                Some(Ok(Frame::Packet(other))) => {
                    warn!("[conn {}] Unexpected {} packet after handshake", conn, other.op());
                }
                Some(Ok(Frame::Malformed { len, reason })) => {
                    warn!("[conn {}] Dropping malformed frame ({} bytes): {}", conn, len, reason);
                }
                Some(Err(e)) => {
                    warn!("[conn {}] Read error: {}", conn, e);
                    break;
                }
                None => {
                    debug!("[conn {}] Peer closed connection", conn);
                    break;
                }
            }
        }
    }

    closer.cancel();
    send_task.abort();
    let _ = events.send(TransportEvent::Disconnected { conn });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    fn ipc(dir: &tempfile::TempDir, name: &str) -> Address {
        Address::Ipc(dir.path().join(name))
    }

    async fn raw_peer(address: &Address) -> PeerFramed {
        let stream = dial(address).await.unwrap();
        Framed::new(stream, PacketCodec::new())
    }

    async fn next_event(events: &mut EventReceiver) -> TransportEvent {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_hello_registers_advertised_identity() {
        let dir = tempfile::tempdir().unwrap();
        let address = ipc(&dir, "hub.sock");
        let (_hub, mut events) = Transport::bind(&address, id("sparkle")).await.unwrap();

        let mut peer = raw_peer(&address).await;
        peer.send(Packet::Hello {
            identity: Some(id("twilight")),
        })
        .await
        .unwrap();

        let welcome = peer.next().await.unwrap().unwrap();
        assert_eq!(
            welcome,
            Frame::Packet(Packet::Welcome {
                hub: id("sparkle"),
                identity: id("twilight")
            })
        );

        match next_event(&mut events).await {
            TransportEvent::Connected { peer, local, .. } => {
                assert_eq!(peer, id("twilight"));
                assert!(local.is_none());
            }
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_anonymous_hello_gets_generated_identity() {
        let dir = tempfile::tempdir().unwrap();
        let address = ipc(&dir, "hub.sock");
        let (_hub, mut events) = Transport::bind(&address, id("sparkle")).await.unwrap();

        let mut peer = raw_peer(&address).await;
        peer.send(Packet::Hello { identity: None }).await.unwrap();

        let Some(Ok(Frame::Packet(Packet::Welcome { identity, .. }))) = peer.next().await else {
            panic!("Expected welcome");
        };
        assert!(uuid::Uuid::parse_str(identity.as_str()).is_ok());

        let TransportEvent::Connected { peer, .. } = next_event(&mut events).await else {
            panic!("Expected Connected");
        };
        assert_eq!(peer, identity);
    }

    #[tokio::test]
    async fn test_message_before_hello_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let address = ipc(&dir, "hub.sock");
        let (_hub, mut events) = Transport::bind(&address, id("sparkle")).await.unwrap();

        let mut peer = raw_peer(&address).await;
        peer.send(Packet::Message(Message::new(
            id("rogue"),
            None,
            "status",
            serde_json::Value::Null,
        )))
        .await
        .unwrap();

        assert!(peer.next().await.is_none(), "hub should drop the connection");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_frames_and_disconnect_are_reported_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let address = ipc(&dir, "hub.sock");
        let (_hub, mut events) = Transport::bind(&address, id("sparkle")).await.unwrap();

        let mut peer = raw_peer(&address).await;
        peer.send(Packet::Hello {
            identity: Some(id("luna")),
        })
        .await
        .unwrap();
        peer.next().await.unwrap().unwrap();

        for kind in ["one", "two"] {
            peer.send(Packet::Message(Message::new(
                id("luna"),
                None,
                kind,
                serde_json::Value::Null,
            )))
            .await
            .unwrap();
        }
        drop(peer);

        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected { .. }
        ));
        for expected in ["one", "two"] {
            let TransportEvent::Received { message, .. } = next_event(&mut events).await else {
                panic!("Expected Received");
            };
            assert_eq!(message.kind, expected);
        }
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped_without_disconnect() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let address = ipc(&dir, "hub.sock");
        let (_hub, mut events) = Transport::bind(&address, id("sparkle")).await.unwrap();

        let mut peer = raw_peer(&address).await;
        peer.send(Packet::Hello {
            identity: Some(id("luna")),
        })
        .await
        .unwrap();
        peer.next().await.unwrap().unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Connected { .. }
        ));

        let mut garbage = 8u32.to_be_bytes().to_vec();
        garbage.extend_from_slice(b"garbage!");
        peer.get_mut().write_all(&garbage).await.unwrap();
        peer.send(Packet::Message(Message::new(
            id("luna"),
            None,
            "after",
            serde_json::Value::Null,
        )))
        .await
        .unwrap();

        let TransportEvent::Received { message, .. } = next_event(&mut events).await else {
            panic!("Expected Received");
        };
        assert_eq!(message.kind, "after");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_hello_is_rejected() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let address = ipc(&dir, "hub.sock");
        let (_hub, mut events) = Transport::bind(&address, id("sparkle")).await.unwrap();

        let mut peer = raw_peer(&address).await;
        let mut garbage = 4u32.to_be_bytes().to_vec();
        garbage.extend_from_slice(b"{{{{");
        peer.get_mut().write_all(&garbage).await.unwrap();

        assert!(peer.next().await.is_none(), "hub should drop the connection");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bind_fails_when_address_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let address = ipc(&dir, "hub.sock");
        let (_first, _events) = Transport::bind(&address, id("sparkle")).await.unwrap();

        let second = Transport::bind(&address, id("sparkle")).await;
        assert!(matches!(second, Err(TransportError::AddrInUse(_))));
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.sock");
        std::fs::write(&path, b"").unwrap();

        let result = Transport::bind(&Address::Ipc(path), id("sparkle")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_tcp_reports_ephemeral_port() {
        let address = Address::Tcp("127.0.0.1:0".to_string());
        let (hub, _events) = Transport::bind(&address, id("sparkle")).await.unwrap();
        let Address::Tcp(bound) = hub.address() else {
            panic!("Expected tcp address");
        };
        assert!(!bound.ends_with(":0"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.sock");
        let (mut hub, _events) = Transport::bind(&Address::Ipc(path.clone()), id("sparkle"))
            .await
            .unwrap();
        assert!(path.exists());

        hub.close();
        assert!(hub.is_closed());
        assert!(!path.exists());

        hub.close();
        assert!(hub.is_closed());
    }

    #[tokio::test]
    async fn test_connect_retries_until_hub_appears() {
        let dir = tempfile::tempdir().unwrap();
        let address = ipc(&dir, "late.sock");
        let backoff = Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            factor: 2,
        };

        let (_agent, mut agent_events) =
            Transport::connect(address.clone(), Some(id("twilight")), backoff);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(agent_events.try_recv().is_err());

        let (_hub, _hub_events) = Transport::bind(&address, id("sparkle")).await.unwrap();

        match next_event(&mut agent_events).await {
            TransportEvent::Connected { peer, local, .. } => {
                assert_eq!(peer, id("sparkle"));
                assert_eq!(local, Some(id("twilight")));
            }
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_link_send_fails_after_close() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = Link::new(tx, CancellationToken::new());
        assert!(link.send(Packet::Hello { identity: None }).is_ok());

        link.close();
        assert!(link.is_closed());
        assert!(matches!(
            link.send(Packet::Hello { identity: None }),
            Err(TransportError::Closed)
        ));
    }
}
