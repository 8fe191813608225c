pub mod backoff;
pub mod catalog;
pub mod choke;
pub mod config;
pub mod constants;
pub mod exchange;
pub mod metainfo;
pub mod orchestrator;
pub mod peer;
pub mod piece;
pub mod registry;
pub mod shutdown;
pub mod store;

use anyhow::{Context, Result};
use catalog::PieceCatalog;
use choke::ChokeManager;
use config::{Config, Role};
use constants::{CHOKE_REFRESH_SECS, PIECE_SIZE};
use metainfo::Metainfo;
use orchestrator::Orchestrator;
use peer::Peer;
use registry::client::RegistryClient;
use std::net::SocketAddrV4;
use std::time::Duration;
use store::PieceStore;
use tokio::net::TcpListener;
use tokio::select;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    match Config::new().role {
        Role::Registry { listen } => run_registry(listen).await,
        Role::Peer {
            metainfo,
            listen,
            pieces_dir,
            min_peers,
            output,
        } => run_peer(metainfo, listen, pieces_dir, min_peers, output).await,
        Role::Chunk {
            file,
            pieces_dir,
            registry,
            out,
        } => run_chunk(file, pieces_dir, registry, out).await,
    }
}

async fn run_registry(listen: String) -> Result<()> {
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("cannot listen on {listen}"))?;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    tokio::spawn(registry::server::run(listener, shutdown_rx));

    let _ = signal::ctrl_c().await;
    info!("shutting down");
    shutdown_tx.send().wait().await;

    Ok(())
}

async fn run_peer(
    metainfo_path: String,
    listen: String,
    pieces_dir: String,
    min_peers: usize,
    output: Option<String>,
) -> Result<()> {
    let metainfo = Metainfo::from_file(&metainfo_path)?;
    metainfo::validate(&metainfo)?;
    let registry_addr = metainfo.registry_addr()?;

    let self_peer: Peer = listen
        .parse()
        .with_context(|| format!("invalid listen address {listen:?}"))?;
    let listener = TcpListener::bind(self_peer.addr())
        .await
        .with_context(|| format!("cannot listen on {self_peer}"))?;

    let store = PieceStore::new(&pieces_dir).await?;
    let catalog = PieceCatalog::new(metainfo.pieces.clone(), self_peer);

    let on_disk = store.scan(&metainfo).await?;
    info!(
        "{} of {} pieces already on disk",
        on_disk.len(),
        metainfo.piece_count()
    );
    catalog.record_local_pieces(&on_disk)?;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    let choke = ChokeManager::new();
    exchange::spawn_server(
        listener,
        catalog.clone(),
        store.clone(),
        choke.clone(),
        shutdown_rx.clone(),
    );
    choke::spawn_refresher(
        choke.clone(),
        catalog.clone(),
        Duration::from_secs(CHOKE_REFRESH_SECS),
        shutdown_rx.clone(),
    );

    let registry = RegistryClient::connect(
        registry_addr,
        self_peer,
        catalog.clone(),
        shutdown_rx.clone(),
    )
    .await?;
    drop(shutdown_rx);

    registry
        .announce(catalog.owned_indices().into_iter().collect())
        .await?;

    if !catalog.is_complete() {
        registry.await_quorum(&catalog, min_peers).await;
        choke.refresh(&catalog.peers());

        let mut orchestrator = Orchestrator::new(
            catalog.clone(),
            store.clone(),
            choke,
            registry.clone(),
            self_peer,
        );

        select! {
            result = orchestrator.run() => result?,
            _ = signal::ctrl_c() => return leave(registry, shutdown_tx).await,
        }
    }

    if let Some(out) = &output {
        store.assemble(&metainfo, out).await?;
        info!("reassembled {:?} into {out}", metainfo.name);
    }

    info!("seeding, ctrl-c to leave the swarm");
    let _ = signal::ctrl_c().await;

    leave(registry, shutdown_tx).await
}

async fn leave(registry: RegistryClient, shutdown_tx: shutdown::Sender) -> Result<()> {
    info!("leaving the swarm");

    if let Err(e) = registry.deregister().await {
        warn!(?e);
    }

    shutdown_tx.send().wait().await;
    Ok(())
}

async fn run_chunk(
    file: String,
    pieces_dir: String,
    registry: String,
    out: Option<String>,
) -> Result<()> {
    registry
        .parse::<SocketAddrV4>()
        .with_context(|| format!("invalid registry address {registry:?}"))?;

    let store = PieceStore::new(&pieces_dir).await?;
    let metainfo = store::chunk_file(&file, &store, registry, PIECE_SIZE).await?;

    let out = out.unwrap_or_else(|| format!("{}.shoal", metainfo.name));
    tokio::fs::write(&out, metainfo.to_bytes()?)
        .await
        .with_context(|| format!("cannot write metainfo to {out}"))?;

    info!(
        "split {:?} into {} pieces, metainfo at {out}",
        metainfo.name,
        metainfo.piece_count()
    );

    Ok(())
}
