use super::message::{encode_peer_list, Ack, Request};
use crate::peer::Peer;
use crate::shutdown;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// Registered peers and their reported pieces. BTreeMap so every encoded
/// peer list comes out in the same order.
type Swarm = Arc<StdMutex<BTreeMap<Peer, BTreeSet<u32>>>>;

const BROADCAST_BACKLOG: usize = 16;

/// The rendezvous service. Each accepted connection runs in its own task;
/// whenever registration state changes, the full peer list is pushed to
/// every connected registered peer, so peers need not poll aggressively.
pub async fn run(listener: TcpListener, mut shutdown_rx: shutdown::Receiver) {
    let swarm: Swarm = Arc::default();
    let (update_tx, _) = broadcast::channel(BROADCAST_BACKLOG);

    match listener.local_addr() {
        Ok(addr) => info!("registry listening on {addr}"),
        Err(e) => warn!(?e),
    }

    loop {
        select! {
            _ = shutdown_rx.recv() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, from)) => {
                        tokio::spawn(serve_connection(
                            stream,
                            from,
                            swarm.clone(),
                            update_tx.clone(),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => warn!(?e),
                }
            },
        }
    }
}

/// Connection lifecycle: Connected -> Registered -> Updated* ->
/// Disconnected. Disconnecting while registered removes the peer and
/// broadcasts the change.
#[instrument(skip_all, fields(from = %from))]
async fn serve_connection(
    stream: TcpStream,
    from: SocketAddr,
    swarm: Swarm,
    update_tx: broadcast::Sender<String>,
    mut shutdown_rx: shutdown::Receiver,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut update_rx = update_tx.subscribe();
    let mut registered: Option<Peer> = None;

    loop {
        select! {
            _ = shutdown_rx.recv() => break,
            update = update_rx.recv() => {
                let block = match update {
                    Ok(block) => block,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // a fresher list is coming, skipping is harmless
                        debug!("peer list push lagged by {missed}");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                // pushes go to registered peers only
                if registered.is_some()
                    && write_half.write_all(block.as_bytes()).await.is_err()
                {
                    break;
                }
            },
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };

                match handle_line(&line, &mut registered, &swarm, &update_tx, &mut write_half).await {
                    Ok(true) => (),
                    Ok(false) => break,
                    Err(e) => {
                        // ProtocolError: answer once, drop the connection
                        warn!("dropping connection: {e:#}");
                        let _ = write_half.write_all(format!("ERROR {e}\n").as_bytes()).await;
                        break;
                    }
                }
            },
        }
    }

    let Some(peer) = registered else { return };

    let removed = swarm.lock().unwrap().remove(&peer).is_some();
    if removed {
        debug!("connection closed, {peer} removed from swarm");
        broadcast_swarm(&swarm, &update_tx);
    }
}

/// Returns Ok(false) when the write side is gone and the connection
/// should wind down.
async fn handle_line(
    line: &str,
    registered: &mut Option<Peer>,
    swarm: &Swarm,
    update_tx: &broadcast::Sender<String>,
    write_half: &mut OwnedWriteHalf,
) -> Result<bool> {
    if line.trim().is_empty() {
        return Ok(true);
    }

    match Request::parse(line)? {
        Request::AddPeer { peer, pieces } => {
            let ack = {
                let mut swarm = swarm.lock().unwrap();

                // a connection re-registering under a new address gives
                // up its old identity
                if let Some(previous) = *registered {
                    if previous != peer {
                        swarm.remove(&previous);
                    }
                }

                match swarm.insert(peer, pieces.into_iter().collect()) {
                    Some(_) => Ack::PeerUpdated,
                    None => Ack::PeerAdded,
                }
            };

            *registered = Some(peer);
            debug!("{peer} {}", ack.as_line());

            if !send_line(write_half, ack.as_line()).await {
                return Ok(false);
            }
            broadcast_swarm(swarm, update_tx);
        }
        Request::RequestPeers => {
            let block = encode_peer_list(&swarm.lock().unwrap());
            if write_half.write_all(block.as_bytes()).await.is_err() {
                return Ok(false);
            }
        }
        Request::RemovePeer => {
            let removed = match registered.take() {
                Some(peer) => swarm.lock().unwrap().remove(&peer).is_some(),
                None => false,
            };

            let ack = if removed { Ack::PeerRemoved } else { Ack::PeerNotFound };
            if !send_line(write_half, ack.as_line()).await {
                return Ok(false);
            }

            if removed {
                broadcast_swarm(swarm, update_tx);
            }
        }
    }

    Ok(true)
}

async fn send_line(write_half: &mut OwnedWriteHalf, line: &str) -> bool {
    write_half
        .write_all(format!("{line}\n").as_bytes())
        .await
        .is_ok()
}

fn broadcast_swarm(swarm: &Swarm, update_tx: &broadcast::Sender<String>) {
    let block = encode_peer_list(&swarm.lock().unwrap());
    // no receivers is fine, nobody is connected yet
    let _ = update_tx.send(block);
}
