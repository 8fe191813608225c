use crate::metainfo::Metainfo;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// One piece per file under a single directory, `chunk_<index>.chunk`.
/// Pieces are immutable once written; the store never rewrites an index.
#[derive(Debug, Clone)]
pub struct PieceStore {
    dir: PathBuf,
}

impl PieceStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();

        fs::DirBuilder::new()
            .recursive(true)
            .create(&dir)
            .await
            .with_context(|| format!("cannot create piece dir {dir:?}"))?;

        Ok(Self { dir })
    }

    fn piece_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("chunk_{index}.chunk"))
    }

    pub async fn read_piece(&self, index: u32) -> Result<Vec<u8>> {
        let path = self.piece_path(index);
        fs::read(&path)
            .await
            .with_context(|| format!("cannot read piece {index} at {path:?}"))
    }

    pub async fn write_piece(&self, index: u32, data: &[u8]) -> Result<()> {
        let path = self.piece_path(index);
        let mut file = fs::File::create(&path)
            .await
            .with_context(|| format!("cannot create piece {index} at {path:?}"))?;

        file.write_all(data).await?;
        file.flush().await?;

        Ok(())
    }

    /// Walks every in-range piece file and returns the indices whose bytes
    /// still match their digest. Corrupt or short files are left in place
    /// but never reported as owned.
    pub async fn scan(&self, metainfo: &Metainfo) -> Result<Vec<u32>> {
        let mut owned = Vec::new();

        for index in 1..=metainfo.piece_count() as u32 {
            let path = self.piece_path(index);

            let data = match fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("cannot scan {path:?}")),
            };

            let hash = &metainfo.pieces[index as usize - 1];
            if data.len() as u64 == metainfo.piece_size(index) && hash.matches(&data) {
                owned.push(index);
            } else {
                warn!("piece file {path:?} fails verification, ignoring it");
            }
        }

        Ok(owned)
    }

    /// Concatenates pieces 1..N into the reassembled file. Callers invoke
    /// this only once the catalog reports completion.
    pub async fn assemble(&self, metainfo: &Metainfo, out: impl AsRef<Path>) -> Result<()> {
        let mut file = fs::File::create(out.as_ref())
            .await
            .with_context(|| format!("cannot create output file {:?}", out.as_ref()))?;

        for index in 1..=metainfo.piece_count() as u32 {
            let data = self.read_piece(index).await?;
            file.write_all(&data).await?;
        }

        file.flush().await?;

        Ok(())
    }
}

/// Splits a file into `piece_size` pieces, writes the chunk files into the
/// store and returns the metainfo describing them.
pub async fn chunk_file(
    source: impl AsRef<Path>,
    store: &PieceStore,
    registry: String,
    piece_size: usize,
) -> Result<Metainfo> {
    let source = source.as_ref();

    let data = fs::read(source)
        .await
        .with_context(|| format!("cannot read {source:?}"))?;

    if data.is_empty() {
        bail!("{source:?} is empty, nothing to share");
    }

    let name = source
        .file_name()
        .with_context(|| format!("{source:?} has no file name"))?
        .to_string_lossy()
        .into_owned();

    let mut pieces = Vec::with_capacity(data.len() / piece_size + 1);

    for (i, piece) in data.chunks(piece_size).enumerate() {
        store.write_piece(i as u32 + 1, piece).await?;
        pieces.push(crate::piece::PieceHash::of(piece));
    }

    Ok(Metainfo {
        name,
        length: data.len() as u64,
        piece_length: piece_size as u64,
        pieces,
        registry,
    })
}
