use crate::backoff::GrowingBackoff;
use crate::catalog::{Commit, PieceCatalog};
use crate::choke::ChokeManager;
use crate::constants::{ELIGIBILITY_GRACE_MILLIS, FETCH_TIMEOUT_SECS, MAX_RETRY_BACKOFF_SECS};
use crate::exchange::{fetch, FetchError};
use crate::peer::Peer;
use crate::registry::client::RegistryClient;
use crate::store::PieceStore;
use anyhow::Result;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const BACKOFF_BASE_MILLIS: u64 = 500;

/// Drives the download to completion: pick the rarest obtainable piece,
/// pick a provider, fetch, verify, persist, re-announce. One request in
/// flight at a time, so a piece is never asked for twice concurrently and
/// every failure is attributed to exactly one peer.
pub struct Orchestrator {
    catalog: PieceCatalog,
    store: PieceStore,
    choke: ChokeManager,
    registry: RegistryClient,
    self_peer: Peer,
    backoff: GrowingBackoff,
}

impl Orchestrator {
    pub fn new(
        catalog: PieceCatalog,
        store: PieceStore,
        choke: ChokeManager,
        registry: RegistryClient,
        self_peer: Peer,
    ) -> Self {
        Self {
            catalog,
            store,
            choke,
            registry,
            self_peer,
            backoff: GrowingBackoff::new(
                Duration::from_millis(BACKOFF_BASE_MILLIS),
                Duration::from_secs_f64(MAX_RETRY_BACKOFF_SECS),
            ),
        }
    }

    /// Runs until every piece is owned, then announces the full set one
    /// last time. Serving continues elsewhere; this task's job ends here.
    /// Registry trouble is never fatal here: announces and polls that fail
    /// are logged and retried on later iterations while the download keeps
    /// going off the availability already known.
    pub async fn run(&mut self) -> Result<()> {
        while !self.catalog.is_complete() {
            let Some(index) = self.catalog.select_next_piece() else {
                debug!("no obtainable piece right now");
                self.backoff.tick().await;
                if let Err(e) = self.registry.request_peers().await {
                    warn!("registry poll failed: {e:#}");
                }
                continue;
            };

            let Some(provider) = self.pick_provider(index).await else {
                // availability changed under us between select and here
                self.backoff.tick().await;
                continue;
            };

            if let Err(e) = self.catalog.mark_requested(index) {
                debug!(?e);
                continue;
            }

            let progressed = self.fetch_one(index, provider).await?;
            if progressed {
                self.backoff.reset();
            } else {
                self.backoff.tick().await;
            }
        }

        let owned: HashSet<u32> = self.catalog.owned_indices().into_iter().collect();
        if let Err(e) = self.registry.announce(owned).await {
            // the connection actor re-registers once the registry is back
            warn!("completion announce failed: {e:#}");
        }
        info!("download complete, now seeding");

        Ok(())
    }

    /// Prefers a never-failed provider we currently unchoke; failing that,
    /// waits one short grace interval for the choke state to move before
    /// settling for the best provider there is. A tainted provider is
    /// only ever the last resort, eligible or not.
    async fn pick_provider(&self, index: u32) -> Option<Peer> {
        let eligible = self.choke.eligible_peers();
        let fresh = self.catalog.fresh_providers_of(index);

        if let Some(peer) = fresh.iter().find(|peer| eligible.contains(peer)) {
            return Some(*peer);
        }

        if self.catalog.providers_of(index).is_empty() {
            return None;
        }

        sleep(Duration::from_millis(ELIGIBILITY_GRACE_MILLIS)).await;

        let eligible = self.choke.eligible_peers();
        let fresh = self.catalog.fresh_providers_of(index);

        fresh
            .iter()
            .find(|peer| eligible.contains(peer))
            .copied()
            .or_else(|| self.catalog.providers_of(index).into_iter().next())
    }

    /// One fetch attempt. Returns whether the swarm got closer to
    /// completion; protocol-level and registry failures are absorbed into
    /// the catalog's bookkeeping, only local I/O bubbles up.
    async fn fetch_one(&mut self, index: u32, provider: Peer) -> Result<bool> {
        debug!("requesting piece {index} from {provider}");

        let limit = Duration::from_secs(FETCH_TIMEOUT_SECS);
        let data = match fetch(provider, index, self.self_peer, limit).await {
            Ok(data) => data,
            Err(FetchError::NotFound) => {
                debug!("{provider} no longer has piece {index}");
                self.catalog.mark_missing(index)?;
                self.catalog.remove_provider(provider, index);
                self.catalog.record_fetch_success(provider);
                return Ok(false);
            }
            Err(e @ (FetchError::ConnectionError | FetchError::Timeout)) => {
                debug!("fetch of piece {index} from {provider} failed: {e:?}");
                self.catalog.mark_missing(index)?;
                self.catalog.record_fetch_failure(provider);
                return Ok(false);
            }
        };

        self.catalog.record_fetch_success(provider);

        match self.catalog.commit_owned(index, &data)? {
            Commit::Committed => {
                self.store.write_piece(index, &data).await?;

                let owned = self.catalog.owned_indices();
                info!(
                    "piece {index} committed, {}/{} owned",
                    owned.len(),
                    self.catalog.piece_count()
                );

                if let Err(e) = self.registry.announce(owned.into_iter().collect()).await {
                    warn!("announce failed: {e:#}");
                }
                Ok(true)
            }
            Commit::AlreadyOwned => {
                debug!("piece {index} arrived twice, dropping the copy");
                Ok(false)
            }
            Commit::HashMismatch => {
                warn!("piece {index} from {provider} failed verification");
                self.catalog.record_verification_failure(provider, index);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Orchestrator;
    use crate::catalog::PieceCatalog;
    use crate::choke::ChokeManager;
    use crate::exchange::{spawn_server, Message};
    use crate::peer::Peer;
    use crate::piece::PieceHash;
    use crate::registry::client::RegistryClient;
    use crate::registry::message::{parse_peer_line, parse_peers_header};
    use crate::registry::server;
    use crate::shutdown;
    use crate::store::PieceStore;
    use std::collections::HashSet;
    use std::net::{SocketAddr, SocketAddrV4};
    use std::time::Duration;
    use tokio::fs::remove_dir_all;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{sleep, timeout};

    fn content(piece_count: usize) -> Vec<Vec<u8>> {
        (1..=piece_count)
            .map(|i| format!("{i:03}").repeat(24).into_bytes())
            .collect()
    }

    fn hashes(pieces: &[Vec<u8>]) -> Vec<PieceHash> {
        pieces.iter().map(|data| PieceHash::of(data)).collect()
    }

    async fn registry() -> (SocketAddrV4, shutdown::Sender) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };

        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        tokio::spawn(server::run(listener, shutdown_rx));

        (addr, shutdown_tx)
    }

    struct Node {
        addr: Peer,
        catalog: PieceCatalog,
        store: PieceStore,
        choke: ChokeManager,
        registry: RegistryClient,
        _shutdown_tx: shutdown::Sender,
    }

    /// A full node: piece store, exchange server, registry connection.
    async fn node(
        scratch: &str,
        registry_addr: SocketAddrV4,
        pieces: &[Vec<u8>],
        owned: &[u32],
    ) -> Node {
        let store = PieceStore::new(scratch).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: Peer = listener.local_addr().unwrap().into();

        let catalog = PieceCatalog::new(hashes(pieces), addr);
        for &index in owned {
            store
                .write_piece(index, &pieces[index as usize - 1])
                .await
                .unwrap();
        }
        catalog.record_local_pieces(owned).unwrap();

        let choke = ChokeManager::new();
        let (shutdown_tx, shutdown_rx) = shutdown::channel();

        spawn_server(
            listener,
            catalog.clone(),
            store.clone(),
            choke.clone(),
            shutdown_rx.clone(),
        );

        let registry = RegistryClient::connect(registry_addr, addr, catalog.clone(), shutdown_rx)
            .await
            .unwrap();
        registry
            .announce(owned.iter().copied().collect())
            .await
            .unwrap();

        Node {
            addr,
            catalog,
            store,
            choke,
            registry,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn orchestrator(node: &Node) -> Orchestrator {
        Orchestrator::new(
            node.catalog.clone(),
            node.store.clone(),
            node.choke.clone(),
            node.registry.clone(),
            node.addr,
        )
    }

    /// Registered observer whose `collect_additions` records, from the
    /// registry's pushes, the order in which `subject` gained pieces.
    struct Watcher {
        lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        _write: tokio::net::tcp::OwnedWriteHalf,
    }

    impl Watcher {
        async fn register(registry_addr: SocketAddrV4) -> Self {
            let stream = TcpStream::connect(registry_addr).await.unwrap();
            let (read_half, mut write) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            write.write_all(b"ADD_PEER 127.0.0.1:1\n").await.unwrap();
            assert_eq!("PEER_ADDED", lines.next_line().await.unwrap().unwrap());

            Self {
                lines,
                _write: write,
            }
        }

        async fn collect_additions(mut self, subject: Peer, until: usize) -> Vec<u32> {
            let mut seen: HashSet<u32> = HashSet::new();
            let mut additions = Vec::new();

            while additions.len() < until {
                let line = self.lines.next_line().await.unwrap().unwrap();
                let Some(count) = parse_peers_header(&line) else {
                    continue;
                };

                let mut subject_pieces = HashSet::new();
                for _ in 0..count {
                    let line = self.lines.next_line().await.unwrap().unwrap();
                    let (peer, pieces) = parse_peer_line(&line).unwrap();
                    if peer == subject {
                        subject_pieces = pieces;
                    }
                }

                let mut fresh: Vec<u32> = subject_pieces.difference(&seen).copied().collect();
                fresh.sort_unstable();
                additions.extend(&fresh);
                seen.extend(fresh);
            }

            additions
        }
    }

    #[tokio::test]
    async fn downloads_rarest_first_from_three_seeders() {
        let scratch = "orchestrator_swarm_test";
        let pieces = content(8);
        let (registry_addr, _registry_shutdown) = registry().await;

        // piece 5 has two providers, everything else exactly one
        let _a = node(&format!("{scratch}/a"), registry_addr, &pieces, &[1, 2, 3]).await;
        let _b = node(&format!("{scratch}/b"), registry_addr, &pieces, &[4, 5, 6]).await;
        let _c = node(&format!("{scratch}/c"), registry_addr, &pieces, &[5, 7, 8]).await;

        let leech = node(&format!("{scratch}/leech"), registry_addr, &pieces, &[]).await;
        leech.registry.await_quorum(&leech.catalog, 3).await;
        leech.choke.refresh(&leech.catalog.peers());

        let watcher = Watcher::register(registry_addr).await;
        let watcher = tokio::spawn(watcher.collect_additions(leech.addr, 8));

        timeout(Duration::from_secs(30), orchestrator(&leech).run())
            .await
            .unwrap()
            .unwrap();

        assert!(leech.catalog.is_complete());

        // single-provider pieces in index order, the widely-held one last
        let additions = timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vec![1, 2, 3, 4, 6, 7, 8, 5], additions);

        for (i, data) in pieces.iter().enumerate() {
            assert_eq!(data, &leech.store.read_piece(i as u32 + 1).await.unwrap());
        }

        remove_dir_all(scratch).await.unwrap();
    }

    #[tokio::test]
    async fn recovers_when_advertised_availability_is_stale() {
        let scratch = "orchestrator_stale_test";
        let pieces = content(2);
        let (registry_addr, _registry_shutdown) = registry().await;

        // claims both pieces, owns neither
        let liar = node(&format!("{scratch}/liar"), registry_addr, &pieces, &[]).await;
        liar.registry
            .announce(HashSet::from([1, 2]))
            .await
            .unwrap();

        let leech = node(&format!("{scratch}/leech"), registry_addr, &pieces, &[]).await;
        leech.registry.await_quorum(&leech.catalog, 1).await;
        leech.choke.refresh(&leech.catalog.peers());

        let mut downloader = orchestrator(&leech);
        let download = tokio::spawn(async move { downloader.run().await });

        // the honest seeder only shows up after the liar has answered
        // CHUNK_NOT_FOUND at least once
        sleep(Duration::from_millis(700)).await;
        let _honest = node(&format!("{scratch}/honest"), registry_addr, &pieces, &[1, 2]).await;

        timeout(Duration::from_secs(30), download)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(leech.catalog.is_complete());
        assert_eq!(pieces[0], leech.store.read_piece(1).await.unwrap());
        assert_eq!(pieces[1], leech.store.read_piece(2).await.unwrap());

        remove_dir_all(scratch).await.unwrap();
    }

    /// Answers every request for piece 1 with bytes that hash wrong.
    async fn corrupting_seeder(registry_addr: SocketAddrV4) -> (Peer, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: Peer = listener.local_addr().unwrap().into();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};

                    let mut request = [0u8; 15];
                    if stream.read_exact(&mut request).await.is_err() {
                        return;
                    }

                    let lie = Message::Chunk {
                        index: 1,
                        data: b"these are not the bytes you hashed".to_vec(),
                    };
                    let _ = stream.write_all(&lie.into_bytes()).await;
                });
            }
        });

        // register by hand and keep the connection open
        let mut registration = TcpStream::connect(registry_addr).await.unwrap();
        registration
            .write_all(format!("ADD_PEER {addr} 1\n").as_bytes())
            .await
            .unwrap();

        (addr, registration)
    }

    #[tokio::test]
    async fn retries_elsewhere_after_a_corrupted_transfer() {
        let scratch = "orchestrator_corrupt_test";
        let pieces = content(1);
        let (registry_addr, _registry_shutdown) = registry().await;

        let (rogue, _registration) = corrupting_seeder(registry_addr).await;

        let leech = node(&format!("{scratch}/leech"), registry_addr, &pieces, &[]).await;
        leech.registry.await_quorum(&leech.catalog, 1).await;
        leech.choke.refresh(&leech.catalog.peers());

        let mut downloader = orchestrator(&leech);
        let download = tokio::spawn(async move { downloader.run().await });

        // let at least one corrupted transfer happen first
        sleep(Duration::from_millis(700)).await;
        let honest = node(&format!("{scratch}/honest"), registry_addr, &pieces, &[1]).await;

        timeout(Duration::from_secs(30), download)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(leech.catalog.is_complete());
        assert_eq!(pieces[0], leech.store.read_piece(1).await.unwrap());

        // the rogue stays a provider of record but only as a last resort
        assert_eq!(vec![honest.addr, rogue], leech.catalog.providers_of(1));

        remove_dir_all(scratch).await.unwrap();
    }

    #[tokio::test]
    async fn finishes_the_download_after_the_registry_dies() {
        let scratch = "orchestrator_registry_loss_test";
        let pieces = content(4);
        let (registry_addr, registry_shutdown) = registry().await;

        let seeder = node(
            &format!("{scratch}/seeder"),
            registry_addr,
            &pieces,
            &[1, 2, 3, 4],
        )
        .await;

        let leech = node(&format!("{scratch}/leech"), registry_addr, &pieces, &[]).await;
        leech.registry.await_quorum(&leech.catalog, 1).await;
        leech.choke.refresh(&leech.catalog.peers());

        // the registry dies before a single piece has moved; the catalog
        // already knows the seeder, so every announce from here on fails
        registry_shutdown.send().wait().await;

        timeout(Duration::from_secs(30), orchestrator(&leech).run())
            .await
            .unwrap()
            .unwrap();

        assert!(leech.catalog.is_complete());
        for (i, data) in pieces.iter().enumerate() {
            assert_eq!(data, &leech.store.read_piece(i as u32 + 1).await.unwrap());
        }
        drop(seeder);

        remove_dir_all(scratch).await.unwrap();
    }
}
