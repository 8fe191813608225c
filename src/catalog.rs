use crate::constants::MAX_CONSECUTIVE_FAILURES;
use crate::peer::Peer;
use crate::piece::{PieceHash, PieceStatus};
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, warn};

/// Outcome of a verified commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Committed,
    AlreadyOwned,
    HashMismatch,
}

/// Piece and peer bookkeeping for the local node: status of every piece,
/// who reportedly owns what, and the derived availability counts that
/// rarest-first selection runs on. Cloneable handle, all state behind one
/// mutex so commit and select can never interleave.
#[derive(Debug, Clone)]
pub struct PieceCatalog {
    inner: Arc<StdMutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    pieces: Vec<PieceEntry>,
    remotes: HashMap<Peer, PeerRecord>,
    self_addr: Peer,
}

#[derive(Debug)]
struct PieceEntry {
    hash: PieceHash,
    status: PieceStatus,
}

#[derive(Debug)]
struct PeerRecord {
    pieces: HashSet<u32>,
    failed_pieces: HashSet<u32>,
    consecutive_failures: u32,
    live: bool,
}

impl PeerRecord {
    fn new() -> Self {
        Self {
            pieces: HashSet::new(),
            failed_pieces: HashSet::new(),
            consecutive_failures: 0,
            live: true,
        }
    }
}

impl PieceCatalog {
    /// Piece indices are 1-based: `hashes[0]` belongs to piece 1.
    pub fn new(hashes: Vec<PieceHash>, self_addr: Peer) -> Self {
        let pieces = hashes
            .into_iter()
            .map(|hash| PieceEntry {
                hash,
                status: PieceStatus::Missing,
            })
            .collect();

        Self {
            inner: Arc::new(StdMutex::new(Inner {
                pieces,
                remotes: HashMap::new(),
                self_addr,
            })),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.inner.lock().unwrap().pieces.len()
    }

    /// Marks pieces the node already holds (a partial share found on disk).
    /// Fails without changing anything if any index is out of range.
    pub fn record_local_pieces(&self, indices: &[u32]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        for &index in indices {
            inner.check_range(index)?;
        }

        for &index in indices {
            inner.entry_mut(index).status = PieceStatus::Owned;
        }

        Ok(())
    }

    /// Replaces what is known about `peer`'s ownership; last write wins.
    /// Out-of-range indices in the report are dropped with a warning.
    pub fn update_remote_availability(&self, peer: Peer, owned: HashSet<u32>) {
        let mut inner = self.inner.lock().unwrap();
        inner.update_remote(peer, owned);
    }

    /// Wholesale replacement of the remote universe from a registry peer
    /// list: peers the registry no longer reports are dropped, retained
    /// peers keep their failure history, and a re-reported peer is live
    /// again. The local node's own entry is skipped.
    pub fn apply_registry_snapshot(&self, snapshot: HashMap<Peer, HashSet<u32>>) {
        let mut inner = self.inner.lock().unwrap();

        inner.remotes.retain(|peer, _| snapshot.contains_key(peer));

        for (peer, owned) in snapshot {
            inner.update_remote(peer, owned);
        }
    }

    /// The Missing piece with the fewest live providers; ties break toward
    /// the lowest index. `None` when nothing Missing has a known provider.
    pub fn select_next_piece(&self) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        let availability = inner.availability();

        inner
            .pieces
            .iter()
            .enumerate()
            .filter(|(i, entry)| entry.status == PieceStatus::Missing && availability[*i] > 0)
            .min_by_key(|(i, _)| (availability[*i], *i))
            .map(|(i, _)| i as u32 + 1)
    }

    pub fn mark_requested(&self, index: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_range(index)?;

        let entry = inner.entry_mut(index);
        if entry.status != PieceStatus::Missing {
            bail!("piece {index} is {:?}, cannot request it", entry.status);
        }

        entry.status = PieceStatus::Requested;
        Ok(())
    }

    /// Recovery path after a failed or corrupted fetch: the piece becomes
    /// eligible for re-selection. A no-op for an already-Missing piece;
    /// an Owned piece is never demoted.
    pub fn mark_missing(&self, index: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_range(index)?;

        let entry = inner.entry_mut(index);
        if entry.status == PieceStatus::Owned {
            bail!("piece {index} is owned, refusing to mark it missing");
        }

        entry.status = PieceStatus::Missing;
        Ok(())
    }

    /// Verifies `data` against the expected digest. On a match the piece is
    /// Owned from here on; on a mismatch it reverts to Missing and the
    /// caller must not persist the bytes.
    pub fn commit_owned(&self, index: u32, data: &[u8]) -> Result<Commit> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_range(index)?;

        let entry = inner.entry_mut(index);
        if entry.status == PieceStatus::Owned {
            return Ok(Commit::AlreadyOwned);
        }

        if entry.hash.matches(data) {
            entry.status = PieceStatus::Owned;
            Ok(Commit::Committed)
        } else {
            entry.status = PieceStatus::Missing;
            Ok(Commit::HashMismatch)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .pieces
            .iter()
            .all(|entry| entry.status == PieceStatus::Owned)
    }

    pub fn owned_indices(&self) -> Vec<u32> {
        self.inner
            .lock()
            .unwrap()
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.status == PieceStatus::Owned)
            .map(|(i, _)| i as u32 + 1)
            .collect()
    }

    pub fn owns(&self, index: u32) -> bool {
        let inner = self.inner.lock().unwrap();

        index >= 1
            && (index as usize) <= inner.pieces.len()
            && inner.pieces[index as usize - 1].status == PieceStatus::Owned
    }

    /// Live providers of a piece, the ones that never failed verification
    /// for it first. Both groups sorted by address for reproducibility.
    pub fn providers_of(&self, index: u32) -> Vec<Peer> {
        let inner = self.inner.lock().unwrap();
        let (mut fresh, tainted) = inner.providers(index);

        fresh.extend(tainted);
        fresh
    }

    /// Only the providers that never served a corrupt copy of this piece.
    pub fn fresh_providers_of(&self, index: u32) -> Vec<Peer> {
        self.inner.lock().unwrap().providers(index).0
    }

    /// All live remote addresses; the universe the choke refresh ranks.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner
            .lock()
            .unwrap()
            .remotes
            .iter()
            .filter(|(_, record)| record.live)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// A NotFound answer means the advertised availability was stale:
    /// forget that this peer provides this piece.
    pub fn remove_provider(&self, peer: Peer, index: u32) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(record) = inner.remotes.get_mut(&peer) {
            record.pieces.remove(&index);
        }
    }

    /// The peer served bytes that failed the digest check: keep it as a
    /// provider but only as a last resort for this piece.
    pub fn record_verification_failure(&self, peer: Peer, index: u32) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(record) = inner.remotes.get_mut(&peer) {
            record.failed_pieces.insert(index);
        }
    }

    pub fn record_fetch_failure(&self, peer: Peer) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(record) = inner.remotes.get_mut(&peer) {
            record.consecutive_failures += 1;

            if record.consecutive_failures >= MAX_CONSECUTIVE_FAILURES && record.live {
                warn!("peer {peer} unreachable {} times, marking it down", record.consecutive_failures);
                record.live = false;
            }
        }
    }

    pub fn record_fetch_success(&self, peer: Peer) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(record) = inner.remotes.get_mut(&peer) {
            record.consecutive_failures = 0;
        }
    }
}

impl Inner {
    fn check_range(&self, index: u32) -> Result<()> {
        if index < 1 || index as usize > self.pieces.len() {
            bail!("piece index {index} out of range 1..={}", self.pieces.len());
        }
        Ok(())
    }

    fn entry_mut(&mut self, index: u32) -> &mut PieceEntry {
        &mut self.pieces[index as usize - 1]
    }

    fn update_remote(&mut self, peer: Peer, owned: HashSet<u32>) {
        if peer == self.self_addr {
            return;
        }

        let piece_count = self.pieces.len();
        let (in_range, out_of_range): (HashSet<u32>, HashSet<u32>) = owned
            .into_iter()
            .partition(|&index| index >= 1 && index as usize <= piece_count);

        if !out_of_range.is_empty() {
            warn!("peer {peer} reported out-of-range pieces {out_of_range:?}, dropping them");
        }

        let record = self.remotes.entry(peer).or_insert_with(PeerRecord::new);
        record.pieces = in_range;
        if !record.live {
            debug!("peer {peer} is back");
            record.live = true;
            record.consecutive_failures = 0;
        }
    }

    /// Live providers of `index`, split into never-failed and
    /// failed-verification groups, each sorted by address.
    fn providers(&self, index: u32) -> (Vec<Peer>, Vec<Peer>) {
        let mut fresh = Vec::new();
        let mut tainted = Vec::new();

        for (peer, record) in &self.remotes {
            if !record.live || !record.pieces.contains(&index) {
                continue;
            }

            if record.failed_pieces.contains(&index) {
                tainted.push(*peer);
            } else {
                fresh.push(*peer);
            }
        }

        fresh.sort();
        tainted.sort();
        (fresh, tainted)
    }

    /// Provider count per piece, derived fresh from the live records so
    /// there is never a second source of truth to keep in sync.
    fn availability(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.pieces.len()];

        for record in self.remotes.values().filter(|record| record.live) {
            for &index in &record.pieces {
                counts[index as usize - 1] += 1;
            }
        }

        counts
    }
}
