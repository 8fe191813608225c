use crate::catalog::PieceCatalog;
use crate::constants::UNCHOKE_SLOTS;
use crate::peer::Peer;
use crate::shutdown;
use rand::seq::SliceRandom;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::select;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Reciprocation-based choking: peers we served the most get the unchoked
/// slots, one random outsider gets the optimistic slot so newcomers can
/// prove themselves. State is replaced wholesale on every refresh; readers
/// see the old or the new set, never a half-built one.
#[derive(Debug, Clone)]
pub struct ChokeManager {
    inner: Arc<StdMutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    uploads: HashMap<Peer, u64>,
    state: ChokeState,
}

#[derive(Debug, Default)]
struct ChokeState {
    unchoked: Vec<Peer>,
    optimistic: Option<Peer>,
}

impl ChokeManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StdMutex::new(Inner {
                uploads: HashMap::new(),
                state: ChokeState::default(),
            })),
        }
    }

    /// Credits a peer we just served a piece to.
    pub fn record_upload(&self, peer: Peer) {
        let mut inner = self.inner.lock().unwrap();
        *inner.uploads.entry(peer).or_insert(0) += 1;
    }

    /// Ranks `known_peers` by upload count descending, address string
    /// ascending on ties; the top K become the unchoked set and one
    /// uniform-random peer from the rest (if any) the optimistic slot.
    pub fn refresh(&self, known_peers: &[Peer]) {
        let mut inner = self.inner.lock().unwrap();

        let mut ranked = known_peers.to_vec();
        ranked.sort_by_cached_key(|peer| {
            let count = inner.uploads.get(peer).copied().unwrap_or(0);
            (Reverse(count), peer.to_string())
        });

        let rest = ranked.split_off(ranked.len().min(UNCHOKE_SLOTS));
        let optimistic = rest.choose(&mut rand::thread_rng()).copied();

        debug!("unchoked {ranked:?}, optimistic {optimistic:?}");
        inner.state = ChokeState {
            unchoked: ranked,
            optimistic,
        };
    }

    /// The only peers the orchestrator may request from.
    pub fn eligible_peers(&self) -> HashSet<Peer> {
        let inner = self.inner.lock().unwrap();

        let mut eligible: HashSet<Peer> = inner.state.unchoked.iter().copied().collect();
        eligible.extend(inner.state.optimistic);
        eligible
    }
}

impl Default for ChokeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic refresh, independent of all other activity, for the lifetime
/// of the node.
pub fn spawn_refresher(
    choke: ChokeManager,
    catalog: PieceCatalog,
    period: Duration,
    mut shutdown_rx: shutdown::Receiver,
) {
    tokio::spawn(async move {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            select! {
                _ = shutdown_rx.recv() => return,
                _ = interval.tick() => choke.refresh(&catalog.peers()),
            }
        }
    });
}
