use crate::catalog::PieceCatalog;
use crate::choke::ChokeManager;
use crate::constants::{COMPACT_ADDR_LEN, FETCH_TIMEOUT_SECS, PIECE_SIZE};
use crate::peer::Peer;
use crate::shutdown;
use crate::store::PieceStore;
use anyhow::{anyhow, bail, Result};
use bincode::Options;
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

pub const BYTES_IN_LEN_PREFIX: usize = 4;
const ID_IDX: usize = 4;
const INDEX_START: usize = 5;
const PAYLOAD_START: usize = 9;

const REQUEST_ID: u8 = 0;
const CHUNK_ID: u8 = 1;
const NOT_FOUND_ID: u8 = 2;

const REQUEST_LEN: u32 = (1 + 4 + COMPACT_ADDR_LEN) as u32;
const NOT_FOUND_LEN: u32 = 5;

/// Frame body must fit a whole piece plus the header; anything bigger is
/// a protocol violation.
const MAX_FRAME_BYTES: usize = PIECE_SIZE + 16;

/// One frame of the chunk-exchange wire: `len(u32) | tag(u8) | ...`, all
/// big-endian. A request carries the requester's listen address so upload
/// credit lands on its canonical `ip:port` identity, not the ephemeral
/// source port of the connection.
#[derive(Debug, PartialEq)]
pub enum Message {
    Request { index: u32, requester: Peer },
    Chunk { index: u32, data: Vec<u8> },
    NotFound { index: u32 },
}

macro_rules! u32_from_be_slice {
    ($slice:expr) => {
        (($slice[0] as u32) << 24)
            + (($slice[1] as u32) << 16)
            + (($slice[2] as u32) << 8)
            + ($slice[3] as u32)
    };
}

impl Message {
    pub fn from_buf(buf: &[u8]) -> Option<Self> {
        if buf.len() < INDEX_START + 4 {
            return None;
        }

        let len = u32_from_be_slice!(buf[0..BYTES_IN_LEN_PREFIX]) as usize;
        let end = len + BYTES_IN_LEN_PREFIX;

        if len < 5 || buf.len() < end {
            warn!("frame len {len} does not fit provided buffer {}", buf.len());
            return None;
        }

        let index = u32_from_be_slice!(buf[INDEX_START..]);

        let message = match buf[ID_IDX] {
            REQUEST_ID => {
                if end != BYTES_IN_LEN_PREFIX + REQUEST_LEN as usize {
                    warn!("request frame has bad len {len}");
                    return None;
                }

                match Peer::from_compact_bytes(&buf[PAYLOAD_START..end]) {
                    Ok(requester) => Message::Request { index, requester },
                    Err(e) => {
                        warn!(?e);
                        return None;
                    }
                }
            }
            CHUNK_ID => Message::Chunk {
                index,
                data: buf[PAYLOAD_START..end].to_vec(),
            },
            NOT_FOUND_ID => Message::NotFound { index },
            unsupported => {
                warn!("unsupported frame tag {unsupported}");
                return None;
            }
        };

        Some(message)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        bincode::DefaultOptions::new()
            .with_big_endian()
            .with_fixint_encoding()
            .serialize(&self)
            .unwrap()
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Message::Request { index, requester } => {
                let compact = requester.to_compact_bytes();

                let mut tup = serializer.serialize_tuple(3 + compact.len())?;
                tup.serialize_element(&REQUEST_LEN)?;
                tup.serialize_element(&REQUEST_ID)?;
                tup.serialize_element(index)?;
                for byte in compact.iter() {
                    tup.serialize_element(byte)?;
                }
                tup.end()
            }
            Message::Chunk { index, data } => {
                let mut tup = serializer.serialize_tuple(3 + data.len())?;
                tup.serialize_element(&(5 + data.len() as u32))?;
                tup.serialize_element(&CHUNK_ID)?;
                tup.serialize_element(index)?;
                for byte in data.iter() {
                    tup.serialize_element(byte)?;
                }
                tup.end()
            }
            Message::NotFound { index } => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&NOT_FOUND_LEN)?;
                tup.serialize_element(&NOT_FOUND_ID)?;
                tup.serialize_element(index)?;
                tup.end()
            }
        }
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Message> {
    let mut len_buf = [0u8; BYTES_IN_LEN_PREFIX];
    stream.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 5 || len > MAX_FRAME_BYTES {
        bail!("frame len {len} outside protocol bounds");
    }

    let mut buf = vec![0u8; BYTES_IN_LEN_PREFIX + len];
    buf[..BYTES_IN_LEN_PREFIX].copy_from_slice(&len_buf);
    stream.read_exact(&mut buf[BYTES_IN_LEN_PREFIX..]).await?;

    Message::from_buf(&buf).ok_or_else(|| anyhow!("malformed frame"))
}

/// Why a fetch came back empty-handed. Hash checking is not this layer's
/// job; the catalog's commit does that in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchError {
    NotFound,
    ConnectionError,
    Timeout,
}

/// Requests piece `index` from `peer`. A timed-out attempt and an
/// unreachable peer are the caller's signal to try elsewhere; NotFound
/// means the remote's advertised availability was stale.
pub async fn fetch(
    peer: Peer,
    index: u32,
    self_addr: Peer,
    limit: Duration,
) -> Result<Vec<u8>, FetchError> {
    match timeout(limit, fetch_inner(peer, index, self_addr)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout),
    }
}

async fn fetch_inner(peer: Peer, index: u32, self_addr: Peer) -> Result<Vec<u8>, FetchError> {
    let mut stream = TcpStream::connect(peer.addr())
        .await
        .map_err(|_| FetchError::ConnectionError)?;

    let request = Message::Request {
        index,
        requester: self_addr,
    };
    stream
        .write_all(&request.into_bytes())
        .await
        .map_err(|_| FetchError::ConnectionError)?;

    match read_frame(&mut stream).await {
        Ok(Message::Chunk { index: got, data }) if got == index => Ok(data),
        Ok(Message::NotFound { .. }) => Err(FetchError::NotFound),
        Ok(other) => {
            warn!("peer {peer} answered piece {index} with {other:?}");
            Err(FetchError::ConnectionError)
        }
        Err(e) => {
            debug!(?e);
            Err(FetchError::ConnectionError)
        }
    }
}

/// The serving side: every accepted connection gets its own task, so one
/// slow peer never blocks another. Runs unconditionally for the lifetime
/// of the node, download in progress or seeding.
pub fn spawn_server(
    listener: TcpListener,
    catalog: PieceCatalog,
    store: PieceStore,
    choke: ChokeManager,
    mut shutdown_rx: shutdown::Receiver,
) {
    tokio::spawn(async move {
        loop {
            select! {
                _ = shutdown_rx.recv() => return,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, from)) => {
                            let handler_shutdown = shutdown_rx.clone();
                            tokio::spawn(serve_one(
                                stream,
                                from,
                                catalog.clone(),
                                store.clone(),
                                choke.clone(),
                                handler_shutdown,
                            ));
                        }
                        Err(e) => warn!(?e),
                    }
                },
            }
        }
    });
}

#[instrument(skip_all, fields(from = %from))]
async fn serve_one(
    mut stream: TcpStream,
    from: SocketAddr,
    catalog: PieceCatalog,
    store: PieceStore,
    choke: ChokeManager,
    _alive_while_serving: shutdown::Receiver,
) {
    let limit = Duration::from_secs(FETCH_TIMEOUT_SECS);

    let frame = match timeout(limit, read_frame(&mut stream)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            // ProtocolError: log it, drop the connection, carry on
            warn!(?e);
            return;
        }
        Err(_) => {
            debug!("request never arrived, dropping connection");
            return;
        }
    };

    let Message::Request { index, requester } = frame else {
        warn!("expected a request frame, got {frame:?}");
        return;
    };

    let response = if catalog.owns(index) {
        match store.read_piece(index).await {
            Ok(data) => Message::Chunk { index, data },
            Err(e) => {
                error!(?e);
                Message::NotFound { index }
            }
        }
    } else {
        Message::NotFound { index }
    };

    let served_chunk = matches!(response, Message::Chunk { .. });

    if let Err(e) = stream.write_all(&response.into_bytes()).await {
        warn!(?e);
        return;
    }

    if served_chunk {
        debug!("served piece {index} to {requester}");
        choke.record_upload(requester);
    }
}
