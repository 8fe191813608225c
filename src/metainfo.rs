use crate::constants::HASH_LEN;
use crate::piece::PieceHash;
use anyhow::{anyhow, bail, Context, Result};
use bendy::decoding::{Decoder, FromBencode, Object};
use bendy::encoding::{AsString, SingleItemEncoder, ToBencode};
use std::net::SocketAddrV4;
use std::path::Path;

/// Shared-file identity: everything a node needs to join a swarm. Stored
/// bencoded; the `chunk` subcommand writes these, peers read them.
#[derive(Debug, PartialEq)]
pub struct Metainfo {
    pub name: String,
    pub length: u64,
    pub piece_length: u64,
    pub pieces: Vec<PieceHash>,
    pub registry: String,
}

impl Metainfo {
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn registry_addr(&self) -> Result<SocketAddrV4> {
        self.registry
            .parse()
            .with_context(|| format!("invalid registry address {:?}", self.registry))
    }

    /// Size of one specific piece; only the last one may be short.
    pub fn piece_size(&self, index: u32) -> u64 {
        if index as usize == self.pieces.len() {
            let tail = self.length % self.piece_length;
            if tail > 0 {
                return tail;
            }
        }

        self.piece_length
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.to_bencode()
            .map_err(|e| anyhow!("metainfo encoding failed: {e}"))
    }

    pub fn from_bytes(buffer: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(buffer);
        let object = decoder
            .next_object()
            .map_err(|e| anyhow!("metainfo is not bencode: {e}"))?
            .ok_or_else(|| anyhow!("metainfo is empty"))?;

        Self::decode_bencode_object(object).map_err(|e| anyhow!("metainfo is malformed: {e}"))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let buffer = std::fs::read(path.as_ref())
            .with_context(|| format!("cannot read metainfo {:?}", path.as_ref()))?;

        Self::from_bytes(&buffer)
    }
}

impl ToBencode for Metainfo {
    const MAX_DEPTH: usize = 2;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), bendy::encoding::Error> {
        let mut digests = Vec::with_capacity(self.pieces.len() * HASH_LEN);
        for hash in &self.pieces {
            digests.extend_from_slice(hash.as_byte_ref());
        }

        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", self.length)?;
            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", self.piece_length)?;
            e.emit_pair(b"pieces", AsString(digests.as_slice()))?;
            e.emit_pair(b"registry", &self.registry)
        })
    }
}

impl FromBencode for Metainfo {
    const EXPECTED_RECURSION_DEPTH: usize = 2;

    fn decode_bencode_object(object: Object) -> Result<Self, bendy::decoding::Error> {
        let mut name = None;
        let mut length = None;
        let mut piece_length = None;
        let mut pieces = None;
        let mut registry = None;

        let mut dict = object.try_into_dictionary()?;
        while let Some(kv) = dict.next_pair()? {
            match kv {
                (b"name", value) => {
                    name = Some(String::decode_bencode_object(value)?);
                }
                (b"length", value) => {
                    length = Some(u64::decode_bencode_object(value)?);
                }
                (b"piece length", value) => {
                    piece_length = Some(u64::decode_bencode_object(value)?);
                }
                (b"pieces", value) => {
                    let raw = AsString::decode_bencode_object(value)?.0;
                    pieces = Some(split_digests(&raw)?);
                }
                (b"registry", value) => {
                    registry = Some(String::decode_bencode_object(value)?);
                }
                _ => (),
            }
        }

        Ok(Metainfo {
            name: ok_or_missing_field(name, "name")?,
            length: ok_or_missing_field(length, "length")?,
            piece_length: ok_or_missing_field(piece_length, "piece length")?,
            pieces: ok_or_missing_field(pieces, "pieces")?,
            registry: ok_or_missing_field(registry, "registry")?,
        })
    }
}

fn ok_or_missing_field<T>(
    opt: Option<T>,
    field_name: &'static str,
) -> Result<T, bendy::decoding::Error> {
    opt.ok_or_else(|| bendy::decoding::Error::missing_field(field_name))
}

fn split_digests(raw: &[u8]) -> Result<Vec<PieceHash>, bendy::decoding::Error> {
    if raw.is_empty() || raw.len() % HASH_LEN > 0 {
        return Err(bendy::decoding::Error::missing_field(format!(
            "pieces must be concatenated {HASH_LEN}-byte SHA1 digests but len={}",
            raw.len()
        )));
    }

    Ok(raw
        .chunks_exact(HASH_LEN)
        .map(|chunk| PieceHash::from_slice(chunk).unwrap())
        .collect())
}

pub fn validate(metainfo: &Metainfo) -> Result<()> {
    if metainfo.pieces.is_empty() {
        bail!("metainfo has zero pieces");
    }

    if metainfo.piece_length == 0 {
        bail!("metainfo has zero piece length");
    }

    let covered = metainfo.piece_length * (metainfo.pieces.len() as u64 - 1);
    if metainfo.length <= covered || metainfo.length > covered + metainfo.piece_length {
        bail!(
            "metainfo length {} does not fit {} pieces of {}",
            metainfo.length,
            metainfo.pieces.len(),
            metainfo.piece_length
        );
    }

    metainfo.registry_addr()?;

    Ok(())
}

#[cfg(test)]
impl Metainfo {
    /// Metainfo for piece_count pieces of 64 bytes, the last one 10 bytes.
    /// Piece i's data is `mock_piece_data(i)`.
    pub fn mock(piece_count: usize) -> (Vec<Vec<u8>>, Metainfo) {
        let data: Vec<Vec<u8>> = (1..=piece_count)
            .map(|i| {
                let len = if i == piece_count { 10 } else { 64 };
                format!("{i:02}").into_bytes().repeat(len / 2)
            })
            .collect();

        let metainfo = Metainfo {
            name: "dark_knight.txt".to_string(),
            length: (piece_count as u64 - 1) * 64 + 10,
            piece_length: 64,
            pieces: data.iter().map(|d| PieceHash::of(d)).collect(),
            registry: "127.0.0.1:9090".to_string(),
        };

        (data, metainfo)
    }
}

#[cfg(test)]
mod tests {
    use super::{validate, Metainfo};

    fn mock(piece_count: usize) -> Metainfo {
        Metainfo::mock(piece_count).1
    }

    #[test]
    fn encode_then_decode() {
        let metainfo = mock(8);

        let bytes = metainfo.to_bytes().unwrap();
        let decoded = Metainfo::from_bytes(&bytes).unwrap();

        assert_eq!(metainfo, decoded);
        assert_eq!(8, decoded.piece_count());
    }

    #[test]
    fn rejects_truncated_digests() {
        // 19 bytes in "pieces" is not a whole number of SHA1 digests
        let bytes = b"d6:lengthi100e4:name4:test12:piece lengthi64e\
                      6:pieces19:01234567890123456788:registry14:127.0.0.1:9090e";

        assert!(Metainfo::from_bytes(bytes).is_err());
    }

    #[test]
    fn rejects_missing_registry() {
        let mut metainfo = mock(4);
        metainfo.registry = String::new();

        let bytes = metainfo.to_bytes().unwrap();
        let decoded = Metainfo::from_bytes(&bytes).unwrap();

        assert!(validate(&decoded).is_err());
    }

    #[test]
    fn last_piece_may_be_short() {
        let metainfo = mock(3);

        assert_eq!(64, metainfo.piece_size(1));
        assert_eq!(64, metainfo.piece_size(2));
        assert_eq!(10, metainfo.piece_size(3));
    }

    #[test]
    fn validation() {
        assert!(validate(&mock(5)).is_ok());

        let mut broken = mock(5);
        broken.length = 1000;
        assert!(validate(&broken).is_err());

        let mut broken = mock(5);
        broken.registry = "localhost".to_string();
        assert!(validate(&broken).is_err());

        let mut broken = mock(5);
        broken.pieces.clear();
        assert!(validate(&broken).is_err());
    }
}
