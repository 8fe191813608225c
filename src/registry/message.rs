use crate::peer::Peer;
use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;

/// Line protocol between peers and the registry. Requests are single
/// lines; every peer-list payload (response or unsolicited broadcast) is a
/// counted block so both can be parsed off the same stream:
///
/// ```text
/// PEERS 2
/// 10.0.0.5:6881: 1,4,7
/// 10.0.0.9:6881:
/// ```
///
/// `PEERS 0` is the explicit empty-result marker.
#[derive(Debug, PartialEq)]
pub enum Request {
    AddPeer { peer: Peer, pieces: HashSet<u32> },
    RequestPeers,
    RemovePeer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    PeerAdded,
    PeerUpdated,
    PeerRemoved,
    PeerNotFound,
}

impl Ack {
    pub fn as_line(self) -> &'static str {
        match self {
            Ack::PeerAdded => "PEER_ADDED",
            Ack::PeerUpdated => "PEER_UPDATED",
            Ack::PeerRemoved => "PEER_REMOVED",
            Ack::PeerNotFound => "PEER_NOT_FOUND",
        }
    }

    pub fn from_line(line: &str) -> Option<Self> {
        match line {
            "PEER_ADDED" => Some(Ack::PeerAdded),
            "PEER_UPDATED" => Some(Ack::PeerUpdated),
            "PEER_REMOVED" => Some(Ack::PeerRemoved),
            "PEER_NOT_FOUND" => Some(Ack::PeerNotFound),
            _ => None,
        }
    }
}

impl Request {
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();

        let request = match tokens.next() {
            Some("ADD_PEER") => {
                let addr = tokens.next().context("ADD_PEER without an address")?;
                let peer: Peer = addr
                    .parse()
                    .with_context(|| format!("ADD_PEER with bad address {addr:?}"))?;
                let pieces = match tokens.next() {
                    Some(list) => parse_piece_list(list)?,
                    None => HashSet::new(),
                };

                Request::AddPeer { peer, pieces }
            }
            Some("REQUEST_PEERS") => Request::RequestPeers,
            Some("REMOVE_PEER") => Request::RemovePeer,
            Some(verb) => bail!("unknown verb {verb:?}"),
            None => bail!("empty request line"),
        };

        if tokens.next().is_some() {
            bail!("trailing tokens in {line:?}");
        }

        Ok(request)
    }

    pub fn encode(&self) -> String {
        match self {
            Request::AddPeer { peer, pieces } => {
                let mut sorted: Vec<u32> = pieces.iter().copied().collect();
                sorted.sort_unstable();

                if sorted.is_empty() {
                    format!("ADD_PEER {peer}")
                } else {
                    format!("ADD_PEER {peer} {}", join_indices(&sorted))
                }
            }
            Request::RequestPeers => "REQUEST_PEERS".to_string(),
            Request::RemovePeer => "REMOVE_PEER".to_string(),
        }
    }
}

fn parse_piece_list(list: &str) -> Result<HashSet<u32>> {
    list.split(',')
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<u32>()
                .with_context(|| format!("bad piece index {token:?}"))
        })
        .collect()
}

fn join_indices(sorted: &[u32]) -> String {
    let mut out = String::new();
    for (i, index) in sorted.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{index}");
    }
    out
}

/// `PEERS <count>` header; returns the line count that follows.
pub fn parse_peers_header(line: &str) -> Option<usize> {
    line.strip_prefix("PEERS ")?.trim().parse().ok()
}

pub fn encode_peer_list(peers: &BTreeMap<Peer, BTreeSet<u32>>) -> String {
    let mut out = format!("PEERS {}\n", peers.len());

    for (peer, pieces) in peers {
        if pieces.is_empty() {
            let _ = writeln!(out, "{peer}:");
        } else {
            let sorted: Vec<u32> = pieces.iter().copied().collect();
            let _ = writeln!(out, "{peer}: {}", join_indices(&sorted));
        }
    }

    out
}

pub fn parse_peer_line(line: &str) -> Result<(Peer, HashSet<u32>)> {
    if let Some((addr, list)) = line.split_once(": ") {
        Ok((addr.parse()?, parse_piece_list(list.trim())?))
    } else if let Some(addr) = line.strip_suffix(':') {
        Ok((addr.parse()?, HashSet::new()))
    } else {
        bail!("malformed peer line {line:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::{
        encode_peer_list, parse_peer_line, parse_peers_header, Ack, Request,
    };
    use crate::peer::Peer;
    use std::collections::{BTreeMap, BTreeSet, HashSet};

    fn peer(port: u16) -> Peer {
        format!("10.1.2.3:{port}").parse().unwrap()
    }

    #[test]
    fn add_peer_with_pieces() {
        let line = "ADD_PEER 10.1.2.3:6881 3,1,8";
        let request = Request::parse(line).unwrap();

        assert_eq!(
            Request::AddPeer {
                peer: peer(6881),
                pieces: HashSet::from([1, 3, 8]),
            },
            request
        );

        // encode normalizes to sorted indices
        assert_eq!("ADD_PEER 10.1.2.3:6881 1,3,8", request.encode());
    }

    #[test]
    fn add_peer_with_nothing_yet() {
        let request = Request::parse("ADD_PEER 10.1.2.3:6881").unwrap();

        assert_eq!(
            Request::AddPeer {
                peer: peer(6881),
                pieces: HashSet::new(),
            },
            request
        );
        assert_eq!("ADD_PEER 10.1.2.3:6881", request.encode());
    }

    #[test]
    fn bare_verbs() {
        assert_eq!(Request::RequestPeers, Request::parse("REQUEST_PEERS").unwrap());
        assert_eq!(Request::RemovePeer, Request::parse("REMOVE_PEER").unwrap());
    }

    #[test]
    fn malformed_requests_fail() {
        assert!(Request::parse("").is_err());
        assert!(Request::parse("SUBSCRIBE").is_err());
        assert!(Request::parse("ADD_PEER").is_err());
        assert!(Request::parse("ADD_PEER 10.1.2.3").is_err());
        assert!(Request::parse("ADD_PEER 10.1.2.3:6881 1,x,3").is_err());
        assert!(Request::parse("REQUEST_PEERS now").is_err());
    }

    #[test]
    fn acks_round_trip() {
        for ack in [
            Ack::PeerAdded,
            Ack::PeerUpdated,
            Ack::PeerRemoved,
            Ack::PeerNotFound,
        ] {
            assert_eq!(Some(ack), Ack::from_line(ack.as_line()));
        }

        assert_eq!(None, Ack::from_line("PEER_MAYBE"));
    }

    #[test]
    fn peer_list_block() {
        let mut peers = BTreeMap::new();
        peers.insert(peer(6881), BTreeSet::from([1, 4, 7]));
        peers.insert(peer(6882), BTreeSet::new());

        let block = encode_peer_list(&peers);
        let mut lines = block.lines();

        assert_eq!(Some(2), parse_peers_header(lines.next().unwrap()));

        let (addr, pieces) = parse_peer_line(lines.next().unwrap()).unwrap();
        assert_eq!(peer(6881), addr);
        assert_eq!(HashSet::from([1, 4, 7]), pieces);

        let (addr, pieces) = parse_peer_line(lines.next().unwrap()).unwrap();
        assert_eq!(peer(6882), addr);
        assert!(pieces.is_empty());
    }

    #[test]
    fn empty_result_marker() {
        let block = encode_peer_list(&BTreeMap::new());
        assert_eq!("PEERS 0\n", block);
        assert_eq!(Some(0), parse_peers_header("PEERS 0"));
    }

    #[test]
    fn malformed_peer_lines_fail() {
        assert!(parse_peer_line("10.1.2.3:6881 1,2").is_err());
        assert!(parse_peer_line("not-an-addr: 1,2").is_err());
        assert!(parse_peer_line("10.1.2.3:6881: 1,two").is_err());
    }
}
