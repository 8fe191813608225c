use super::message::{parse_peer_line, parse_peers_header, Ack, Request};
use crate::backoff::GrowingBackoff;
use crate::catalog::PieceCatalog;
use crate::constants::{MAX_RETRY_BACKOFF_SECS, QUORUM_RETRY_SECS, REGISTRY_TIMEOUT_SECS};
use crate::peer::Peer;
use crate::shutdown;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const COMMAND_BACKLOG: usize = 64;
const RECONNECT_BASE_MILLIS: u64 = 500;

fn registry_timeout() -> Duration {
    Duration::from_secs(REGISTRY_TIMEOUT_SECS)
}

/// Cheaply cloneable handle to the single registry connection. The actor
/// behind it owns the stream; responses are matched to callers in FIFO
/// order, and unsolicited peer-list pushes land in the catalog without any
/// caller involved.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    commands: mpsc::Sender<Command>,
}

#[derive(Debug)]
enum Command {
    Announce {
        pieces: HashSet<u32>,
        resp: oneshot::Sender<Ack>,
    },
    RequestPeers {
        resp: oneshot::Sender<()>,
    },
    Deregister {
        resp: oneshot::Sender<Ack>,
    },
}

impl RegistryClient {
    /// Connects and spawns the connection actor. Failure here is fatal to
    /// the node, there is no swarm without a registry. Once up, the actor
    /// outlives the connection: a lost registry is retried with backoff
    /// and the registration is replayed after a reconnect.
    pub async fn connect(
        registry: SocketAddrV4,
        self_peer: Peer,
        catalog: PieceCatalog,
        shutdown_rx: shutdown::Receiver,
    ) -> Result<Self> {
        let stream = timeout(registry_timeout(), TcpStream::connect(registry))
            .await
            .with_context(|| format!("timed out connecting to registry at {registry}"))?
            .with_context(|| format!("failed to connect to registry at {registry}"))?;

        info!("connected to registry at {registry}");

        let (commands, command_rx) = mpsc::channel(COMMAND_BACKLOG);
        tokio::spawn(actor(
            registry,
            stream,
            self_peer,
            catalog,
            command_rx,
            shutdown_rx,
        ));

        Ok(Self { commands })
    }

    /// Registers (or re-registers) this node with its current piece set.
    pub async fn announce(&self, pieces: HashSet<u32>) -> Result<Ack> {
        let (resp, rx) = oneshot::channel();
        self.send_command(Command::Announce { pieces, resp }).await?;
        self.await_ack(rx).await
    }

    /// Asks for the full peer list; by the time this returns, the catalog
    /// reflects it.
    pub async fn request_peers(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send_command(Command::RequestPeers { resp }).await?;

        timeout(registry_timeout(), rx)
            .await
            .context("registry did not answer REQUEST_PEERS in time")?
            .map_err(|_| anyhow!("registry connection is gone"))
    }

    pub async fn deregister(&self) -> Result<Ack> {
        let (resp, rx) = oneshot::channel();
        self.send_command(Command::Deregister { resp }).await?;
        self.await_ack(rx).await
    }

    /// Blocks until the catalog knows at least `min_peers` other peers,
    /// re-polling the registry on a fixed cadence. A failed poll is just
    /// another round of waiting.
    pub async fn await_quorum(&self, catalog: &PieceCatalog, min_peers: usize) {
        loop {
            match self.request_peers().await {
                Ok(()) => {
                    let known = catalog.peers().len();
                    if known >= min_peers {
                        info!("quorum reached with {known} known peers");
                        return;
                    }

                    debug!("waiting for quorum, {known}/{min_peers} peers known");
                }
                Err(e) => warn!("registry poll failed: {e:#}"),
            }

            sleep(Duration::from_secs(QUORUM_RETRY_SECS)).await;
        }
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("registry connection is gone"))
    }

    async fn await_ack(&self, rx: oneshot::Receiver<Ack>) -> Result<Ack> {
        timeout(registry_timeout(), rx)
            .await
            .context("registry did not acknowledge in time")?
            .map_err(|_| anyhow!("registry connection is gone"))
    }
}

enum ConnectionEnd {
    Shutdown,
    Lost,
}

async fn actor(
    registry: SocketAddrV4,
    stream: TcpStream,
    self_peer: Peer,
    catalog: PieceCatalog,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown_rx: shutdown::Receiver,
) {
    let mut backoff = GrowingBackoff::new(
        Duration::from_millis(RECONNECT_BASE_MILLIS),
        Duration::from_secs_f64(MAX_RETRY_BACKOFF_SECS),
    );
    let mut stream = Some(stream);
    let mut reconnected = false;

    loop {
        let connected = match stream.take() {
            Some(connected) => connected,
            None => {
                select! {
                    _ = shutdown_rx.recv() => return,
                    _ = backoff.tick() => {}
                    command = commands.recv() => {
                        let Some(command) = command else { return };
                        // dropping the waiter fails the caller right away
                        // instead of letting it run into its timeout
                        drop(command);
                        continue;
                    }
                }

                match TcpStream::connect(registry).await {
                    Ok(connected) => {
                        info!("reconnected to registry at {registry}");
                        connected
                    }
                    Err(e) => {
                        debug!("registry at {registry} still unreachable: {e}");
                        continue;
                    }
                }
            }
        };
        backoff.reset();

        let end = drive_connection(
            connected,
            reconnected,
            self_peer,
            &catalog,
            &mut commands,
            &mut shutdown_rx,
        )
        .await;

        match end {
            ConnectionEnd::Shutdown => return,
            ConnectionEnd::Lost => {
                warn!("lost the registry connection, will reconnect");
                reconnected = true;
            }
        }
    }
}

/// Runs one connection until shutdown or the stream dies. Waiters pending
/// when the stream dies are dropped, which fails their callers; retrying
/// is the caller's decision, reconnecting is the actor's.
async fn drive_connection(
    stream: TcpStream,
    reannounce: bool,
    self_peer: Peer,
    catalog: &PieceCatalog,
    commands: &mut mpsc::Receiver<Command>,
    shutdown_rx: &mut shutdown::Receiver,
) -> ConnectionEnd {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let mut ack_waiters: VecDeque<oneshot::Sender<Ack>> = VecDeque::new();
    let mut peers_waiters: VecDeque<oneshot::Sender<()>> = VecDeque::new();

    if reannounce {
        // the registry dropped our registration along with the old
        // connection; replay it with what the catalog owns now
        let (resp, _) = oneshot::channel();
        ack_waiters.push_back(resp);

        let request = Request::AddPeer {
            peer: self_peer,
            pieces: catalog.owned_indices().into_iter().collect(),
        };
        if write_half
            .write_all(format!("{}\n", request.encode()).as_bytes())
            .await
            .is_err()
        {
            return ConnectionEnd::Lost;
        }
    }

    loop {
        select! {
            _ = shutdown_rx.recv() => return ConnectionEnd::Shutdown,
            command = commands.recv() => {
                let Some(command) = command else { return ConnectionEnd::Shutdown };

                if let Err(e) = send_request(
                    command,
                    self_peer,
                    &mut write_half,
                    &mut ack_waiters,
                    &mut peers_waiters,
                )
                .await
                {
                    warn!("write to registry failed: {e:#}");
                    return ConnectionEnd::Lost;
                }
            },
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    return ConnectionEnd::Lost;
                };

                if let Err(e) = handle_server_line(
                    &line,
                    &mut lines,
                    catalog,
                    &mut ack_waiters,
                    &mut peers_waiters,
                )
                .await
                {
                    warn!("registry protocol breakdown: {e:#}");
                    return ConnectionEnd::Lost;
                }
            },
        }
    }
}

async fn send_request(
    command: Command,
    self_peer: Peer,
    write_half: &mut OwnedWriteHalf,
    ack_waiters: &mut VecDeque<oneshot::Sender<Ack>>,
    peers_waiters: &mut VecDeque<oneshot::Sender<()>>,
) -> Result<()> {
    let request = match command {
        Command::Announce { pieces, resp } => {
            ack_waiters.push_back(resp);
            Request::AddPeer {
                peer: self_peer,
                pieces,
            }
        }
        Command::RequestPeers { resp } => {
            peers_waiters.push_back(resp);
            Request::RequestPeers
        }
        Command::Deregister { resp } => {
            ack_waiters.push_back(resp);
            Request::RemovePeer
        }
    };

    write_half
        .write_all(format!("{}\n", request.encode()).as_bytes())
        .await
        .context("write to registry failed")
}

/// Server-to-client traffic is either a single ack line or a counted
/// `PEERS` block. Blocks answer a pending REQUEST_PEERS if one is in
/// flight and are otherwise unsolicited pushes; both update the catalog.
async fn handle_server_line(
    line: &str,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    catalog: &PieceCatalog,
    ack_waiters: &mut VecDeque<oneshot::Sender<Ack>>,
    peers_waiters: &mut VecDeque<oneshot::Sender<()>>,
) -> Result<()> {
    if let Some(count) = parse_peers_header(line) {
        let mut snapshot = HashMap::with_capacity(count);
        for _ in 0..count {
            let line = lines
                .next_line()
                .await
                .context("read from registry failed")?
                .context("peer list cut short")?;

            let (peer, pieces) = parse_peer_line(&line)?;
            snapshot.insert(peer, pieces);
        }

        debug!("registry reports {} peers", snapshot.len());
        catalog.apply_registry_snapshot(snapshot);

        if let Some(waiter) = peers_waiters.pop_front() {
            let _ = waiter.send(());
        }

        return Ok(());
    }

    if let Some(ack) = Ack::from_line(line) {
        match ack_waiters.pop_front() {
            Some(waiter) => {
                let _ = waiter.send(ack);
            }
            None => warn!("stray ack {ack:?} with nobody waiting"),
        }

        return Ok(());
    }

    bail!("unintelligible registry line {line:?}");
}
