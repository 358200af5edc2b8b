//! # Peer Links
//!
//! A Peer Link is one QUIC connection carrying exactly one bidirectional
//! stream, over which both ends exchange length-prefixed [`Frame`]s.
//!
//! ## Link Lifecycle
//!
//! ```text
//! Idle ──► Connecting ──► Connected ──► Closing ──► Closed
//!   │           │             │                       ▲
//!   └───────────┴─────────────┴──── transport error ──┘
//! ```
//!
//! `Closed` is terminal. A link is handed to the topology actor only once
//! it is `Connected`, i.e. after the handshake:
//!
//! | Step | Dialer | Acceptor |
//! |------|--------|----------|
//! | 1 | open stream, send `Hello{name, addrs, peers}` | |
//! | 2 | | read `Hello`, ask topology for admission |
//! | 3 | | send `Welcome{name, addrs}` or `Reject{reason}` |
//! | 4 | read reply, register link | register link |
//!
//! ## Tasks
//!
//! Each established link runs a reader task (frames → topology events) and
//! a writer task (bounded outbound queue → stream). Senders enqueue with
//! `try_send`, so one slow peer never stalls the topology actor.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use quinn::{ClientConfig, Connection, Endpoint, Incoming, RecvStream, SendStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::crypto::SERVER_NAME;
use crate::identity::NodeName;
use crate::messages::{self, Frame, MAX_FRAME_SIZE};
use crate::topology::{Admission, Topology};

/// Time allowed for the QUIC handshake with a dialed address.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for the `Hello`/`Welcome` exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound frames queued per link before new frames are dropped.
pub const LINK_QUEUE_SIZE: usize = 256;

/// How long a rejecting acceptor waits for the dialer to read `Reject`.
const REJECT_LINGER: Duration = Duration::from_secs(1);

/// Process-unique identifier of a link. Distinguishes a replaced link
/// from its successor to the same peer.
pub type LinkId = u64;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// We dialed.
    Outbound,
    /// They dialed.
    Inbound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl LinkState {
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connected, Closing)
                | (Idle | Connecting | Connected | Closing, Closed)
        )
    }
}

/// Shared state cell observed by the link's tasks and its owner.
#[derive(Clone, Debug)]
struct StateCell(Arc<Mutex<LinkState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(LinkState::Idle)))
    }

    fn get(&self) -> LinkState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next` if the transition is legal; returns whether it was.
    fn advance(&self, next: LinkState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }
}

/// Events delivered from link tasks to the topology actor.
#[derive(Debug)]
pub enum LinkEvent {
    Frame {
        link_id: LinkId,
        from: NodeName,
        frame: Frame,
    },
    Closed {
        link_id: LinkId,
        name: NodeName,
    },
}

/// An established, handshaken link to a named peer.
///
/// Owned by the topology actor. Dropping it stops the writer task, which in
/// turn closes the connection.
pub struct PeerLink {
    id: LinkId,
    name: NodeName,
    direction: Direction,
    remote: SocketAddr,
    addrs: Vec<String>,
    connection: Connection,
    outbound_tx: mpsc::Sender<Frame>,
    state: StateCell,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl PeerLink {
    #[allow(clippy::too_many_arguments)]
    fn establish(
        connection: Connection,
        send: SendStream,
        recv: RecvStream,
        name: NodeName,
        addrs: Vec<String>,
        direction: Direction,
        state: StateCell,
        events_tx: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        state.advance(LinkState::Connected);
        let (outbound_tx, outbound_rx) = mpsc::channel(LINK_QUEUE_SIZE);

        tokio::spawn(write_loop(
            name.clone(),
            send,
            outbound_rx,
            connection.clone(),
            state.clone(),
        ));
        tokio::spawn(read_loop(
            id,
            name.clone(),
            recv,
            connection.clone(),
            state.clone(),
            events_tx,
        ));

        Self {
            id,
            name,
            direction,
            remote: connection.remote_address(),
            addrs,
            connection,
            outbound_tx,
            state,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Addresses the peer advertised during the handshake.
    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    pub fn state(&self) -> LinkState {
        self.state.get()
    }

    /// Name of the node that dialed this link.
    pub fn dialer<'a>(&'a self, local: &'a NodeName) -> &'a NodeName {
        match self.direction {
            Direction::Outbound => local,
            Direction::Inbound => &self.name,
        }
    }

    /// Queue a frame without waiting. Returns `false` if it was dropped.
    pub fn try_send(&self, frame: Frame) -> bool {
        match self.outbound_tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(
                    peer = %self.name,
                    kind = frame.kind(),
                    "outbound queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(peer = %self.name, "link writer gone, dropping frame");
                false
            }
        }
    }

    pub fn close(&self, reason: &str) {
        if self.state.advance(LinkState::Closing) {
            debug!(peer = %self.name, link = self.id, reason, "closing link");
        }
        self.connection.close(0u32.into(), reason.as_bytes());
        self.state.advance(LinkState::Closed);
    }
}

async fn write_loop(
    name: NodeName,
    mut send: SendStream,
    mut outbound_rx: mpsc::Receiver<Frame>,
    connection: Connection,
    state: StateCell,
) {
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(e) = write_frame(&mut send, &frame).await {
            debug!(peer = %name, error = %e, "link write failed");
            break;
        }
    }
    let _ = send.finish();
    state.advance(LinkState::Closed);
    connection.close(0u32.into(), b"link closed");
}

async fn read_loop(
    link_id: LinkId,
    name: NodeName,
    mut recv: RecvStream,
    connection: Connection,
    state: StateCell,
    events_tx: mpsc::Sender<LinkEvent>,
) {
    loop {
        match read_frame(&mut recv).await {
            Ok(Some(frame)) => {
                trace!(peer = %name, kind = frame.kind(), "frame received");
                let event = LinkEvent::Frame {
                    link_id,
                    from: name.clone(),
                    frame,
                };
                if events_tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(peer = %name, "link stream finished");
                break;
            }
            Err(e) => {
                debug!(peer = %name, error = %format!("{e:#}"), "link read failed");
                break;
            }
        }
    }
    state.advance(LinkState::Closed);
    connection.close(0u32.into(), b"link closed");
    let _ = events_tx.send(LinkEvent::Closed { link_id, name }).await;
}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame(send: &mut SendStream, frame: &Frame) -> Result<()> {
    let bytes = messages::serialize_frame(frame).context("failed to encode frame")?;
    let len = u32::try_from(bytes.len()).context("frame length overflows u32")?;
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(&bytes).await?;
    Ok(())
}

/// Read one length-prefixed frame. `None` on a clean end of stream.
pub(crate) async fn read_frame(recv: &mut RecvStream) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame header"),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }
    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf)
        .await
        .context("failed to read frame body")?;
    let frame = messages::deserialize_frame(&buf).context("failed to decode frame")?;
    Ok(Some(frame))
}

// ============================================================================
// Connector (dial + accept)
// ============================================================================

/// Everything needed to open and accept links on behalf of one node.
pub struct Connector {
    endpoint: Endpoint,
    client_config: ClientConfig,
    local: NodeName,
    addrs: Vec<String>,
    events_tx: mpsc::Sender<LinkEvent>,
}

impl Connector {
    pub fn new(
        endpoint: Endpoint,
        client_config: ClientConfig,
        local: NodeName,
        addrs: Vec<String>,
        events_tx: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            endpoint,
            client_config,
            local,
            addrs,
            events_tx,
        }
    }

    pub fn local(&self) -> &NodeName {
        &self.local
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// Dial `addr` and complete the handshake, announcing `peers` as the
    /// links this node already holds.
    ///
    /// The returned link is `Connected` but not yet registered.
    pub async fn dial(&self, addr: SocketAddr, peers: &[NodeName]) -> Result<PeerLink> {
        let state = StateCell::new();
        state.advance(LinkState::Connecting);

        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, SERVER_NAME)
            .with_context(|| format!("failed to start connection to {}", addr))?;
        let connection = match tokio::time::timeout(CONNECT_TIMEOUT, connecting).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                state.advance(LinkState::Closed);
                return Err(e).with_context(|| format!("failed to connect to {}", addr));
            }
            Err(_) => {
                state.advance(LinkState::Closed);
                bail!("connection to {} timed out", addr);
            }
        };

        let handshake = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            dial_handshake(&connection, &self.local, &self.addrs, peers),
        )
        .await;
        let (send, recv, name, addrs) = match handshake {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                state.advance(LinkState::Closed);
                connection.close(0u32.into(), b"handshake failed");
                return Err(e);
            }
            Err(_) => {
                state.advance(LinkState::Closed);
                connection.close(0u32.into(), b"handshake timed out");
                bail!("handshake with {} timed out", addr);
            }
        };

        debug!(peer = %name, addr = %addr, "outbound link established");
        Ok(PeerLink::establish(
            connection,
            send,
            recv,
            name,
            addrs,
            Direction::Outbound,
            state,
            self.events_tx.clone(),
        ))
    }
}

async fn dial_handshake(
    connection: &Connection,
    local: &NodeName,
    addrs: &[String],
    peers: &[NodeName],
) -> Result<(SendStream, RecvStream, NodeName, Vec<String>)> {
    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .context("failed to open link stream")?;
    let hello = Frame::Hello {
        name: local.clone(),
        addrs: addrs.to_vec(),
        peers: peers.to_vec(),
    };
    write_frame(&mut send, &hello).await?;

    match read_frame(&mut recv).await? {
        Some(Frame::Welcome { name, addrs }) => Ok((send, recv, name, addrs)),
        Some(Frame::Reject { reason }) => bail!("rejected: {}", reason),
        Some(other) => bail!("unexpected {} frame during handshake", other.kind()),
        None => bail!("remote closed the link during handshake"),
    }
}

/// Accept an incoming connection, handshake, and register it with the
/// topology actor.
pub async fn accept(incoming: Incoming, topology: Topology) -> Result<()> {
    let state = StateCell::new();
    state.advance(LinkState::Connecting);

    let connection = incoming.await.context("failed to accept connection")?;
    let remote = connection.remote_address();

    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let (send, mut recv) = connection
            .accept_bi()
            .await
            .context("failed to accept link stream")?;
        let frame = read_frame(&mut recv).await?;
        Ok::<_, anyhow::Error>((send, recv, frame))
    })
    .await;
    let (mut send, recv, frame) = match hello {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            connection.close(0u32.into(), b"handshake failed");
            return Err(e).with_context(|| format!("handshake with {} failed", remote));
        }
        Err(_) => {
            connection.close(0u32.into(), b"handshake timed out");
            bail!("handshake with {} timed out", remote);
        }
    };
    let (name, addrs, peers) = match frame {
        Some(Frame::Hello { name, addrs, peers }) => (name, addrs, peers),
        Some(other) => {
            connection.close(0u32.into(), b"expected hello");
            bail!("{} sent {} before hello", remote, other.kind());
        }
        None => bail!("{} closed the link during handshake", remote),
    };

    if let Admission::Reject(reason) = topology.admit(name.clone(), peers).await? {
        debug!(peer = %name, remote = %remote, reason = %reason, "rejecting link");
        write_frame(&mut send, &Frame::Reject { reason }).await?;
        let _ = send.finish();
        let _ = tokio::time::timeout(REJECT_LINGER, connection.closed()).await;
        connection.close(0u32.into(), b"rejected");
        return Ok(());
    }

    let connector = topology.connector();
    let welcome = Frame::Welcome {
        name: connector.local().clone(),
        addrs: connector.addrs().to_vec(),
    };
    write_frame(&mut send, &welcome).await?;

    debug!(peer = %name, remote = %remote, "inbound link established");
    let link = PeerLink::establish(
        connection,
        send,
        recv,
        name,
        addrs,
        Direction::Inbound,
        state,
        connector.events_tx.clone(),
    );
    topology.register(link).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::messages::AdjacencyRow;

    #[test]
    fn link_state_transitions() {
        use LinkState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(Connected.can_transition_to(Closed));
        assert!(Idle.can_transition_to(Closed));

        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Closed));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Idle.can_transition_to(Connected));
    }

    #[test]
    fn state_cell_ignores_illegal_moves() {
        let cell = StateCell::new();
        assert!(!cell.advance(LinkState::Connected));
        assert_eq!(cell.get(), LinkState::Idle);
        assert!(cell.advance(LinkState::Connecting));
        assert!(cell.advance(LinkState::Closed));
        assert!(!cell.advance(LinkState::Connecting));
        assert_eq!(cell.get(), LinkState::Closed);
    }

    async fn connected_pair() -> (Endpoint, Connection, Connection) {
        let (certs, key) = crypto::generate_self_signed_cert().unwrap();
        let server_config = crypto::create_server_config(certs, key).unwrap();
        let mut endpoint =
            Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap()).unwrap();
        endpoint.set_default_client_config(crypto::create_client_config().unwrap());
        let addr = endpoint.local_addr().unwrap();

        let accept = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.accept().await.unwrap().await.unwrap() })
        };
        let client = endpoint.connect(addr, SERVER_NAME).unwrap().await.unwrap();
        let server = accept.await.unwrap();
        (endpoint, client, server)
    }

    #[tokio::test]
    async fn frames_cross_a_stream_in_order() {
        let (_endpoint, client, server) = connected_pair().await;
        let (mut send, _client_recv) = client.open_bi().await.unwrap();

        let row = AdjacencyRow {
            node: "kn1".parse().unwrap(),
            seq: 3,
            peers: vec!["kn2".parse().unwrap()],
            addrs: vec![],
        };
        write_frame(&mut send, &Frame::Gossip(row.clone())).await.unwrap();
        write_frame(&mut send, &Frame::Reject { reason: "x".into() })
            .await
            .unwrap();
        send.finish().unwrap();

        let (_server_send, mut recv) = server.accept_bi().await.unwrap();
        match read_frame(&mut recv).await.unwrap() {
            Some(Frame::Gossip(got)) => assert_eq!(got, row),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            read_frame(&mut recv).await.unwrap(),
            Some(Frame::Reject { .. })
        ));
        assert!(read_frame(&mut recv).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_header_rejected() {
        let (_endpoint, client, server) = connected_pair().await;
        let (mut send, _client_recv) = client.open_bi().await.unwrap();
        let len = (MAX_FRAME_SIZE as u32) + 1;
        send.write_all(&len.to_be_bytes()).await.unwrap();

        let (_server_send, mut recv) = server.accept_bi().await.unwrap();
        let err = read_frame(&mut recv).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
