//! # Metainfo Codec
//!
//! This module produces and parses `.torrent`-style metainfo files. Metainfo
//! is bencoded and carries everything a peer needs to share one content file:
//!
//! - **announce**: tracker URL for peer discovery
//! - **creation_date**: unix timestamp of generation
//! - **info**: dictionary with the file name, its length, the piece length,
//!   and the concatenated piece hashes
//! - **infohash**: convenience copy of the content fingerprint (hex)
//!
//! ## Infohash
//!
//! The infohash is the SHA-256 digest of the bencoded `info` sub-dictionary.
//! It is the stable identity of a content item across the whole system: the
//! tracker keys swarms by it and every peer wire message carries it. The
//! stored top-level copy is optional; parsers recompute the value from the
//! `info` dictionary and prefer the recomputed one on disagreement.
//!
//! ## Bencode
//!
//! Encoding follows the canonical rules: `i<decimal>e` for integers,
//! `<len>:<raw bytes>` for strings, `l...e` for lists and `d...e` for
//! dictionaries with keys in raw byte-lexicographic order. The serializer
//! emits sorted keys, so hashing the bencoded `info` dictionary is stable
//! across generation and parsing.

use anyhow::{anyhow, Result};
use boring::sha::Sha256;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::util::{read_full, to_hex};

/// Size of one piece hash in bytes (SHA-256).
///
/// The digest width is a codec-wide parameter: every piece hash and the
/// infohash use this one length.
pub const PIECE_HASH_SIZE: usize = 32;

/// Parsed metainfo for a single content file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Tracker announce URL
    pub announce: String,
    /// Unix timestamp of generation
    pub creation_date: i64,
    /// Content file name (single file)
    pub name: String,
    /// Size of each piece in bytes (except possibly the last)
    pub piece_length: u64,
    /// Total size of the file in bytes
    pub length: u64,
    /// One SHA-256 hash per piece, in piece order
    pub piece_hashes: Vec<Vec<u8>>,
    /// SHA-256 hash of the bencoded info dictionary
    pub infohash: Vec<u8>,
}

/// Bencoded `info` sub-dictionary.
#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Size of the file in bytes
    #[serde(rename = "length")]
    length: u64,
    // Suggested filename where to save the file
    #[serde(rename = "name")]
    name: String,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u64,
    // Concatenation of all pieces SHA-256 hashes
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
}

/// Bencoded outer dictionary of a metainfo file.
#[derive(Deserialize, Serialize)]
struct BencodeMetainfo {
    // URL of the tracker
    announce: String,
    // Unix timestamp of generation
    creation_date: i64,
    // Informations about the shared file
    info: BencodeInfo,
    // Optional stored copy of the infohash, uppercase hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    infohash: Option<String>,
}

impl BencodeInfo {
    /// Hash bencoded informations to uniquely identify a file.
    fn hash(&self) -> Result<Vec<u8>> {
        // Serialize bencoded informations
        let buf: Vec<u8> = ser::to_bytes::<BencodeInfo>(self)?;

        // Hash bencoded informations
        let mut hasher = Sha256::new();
        hasher.update(&buf);

        // Read hash digest
        let hash = hasher.finish().to_vec();

        Ok(hash)
    }

    /// Split bencoded pieces into a vector of fixed-width hashes.
    fn split_pieces_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let pieces = self.pieces.to_owned();
        let nb_bytes = pieces.len();

        // Check pieces are a whole number of digests
        if nb_bytes % PIECE_HASH_SIZE != 0 {
            return Err(anyhow!("malformed metainfo: bad pieces length"));
        }
        let nb_hashes = nb_bytes / PIECE_HASH_SIZE;
        let mut hashes: Vec<Vec<u8>> = Vec::with_capacity(nb_hashes);

        // Split pieces
        for i in 0..nb_hashes {
            hashes.push(pieces[i * PIECE_HASH_SIZE..(i + 1) * PIECE_HASH_SIZE].to_vec());
        }

        Ok(hashes)
    }
}

impl Metainfo {
    /// Infohash as uppercase hex, the form used on external surfaces.
    pub fn infohash_hex(&self) -> String {
        to_hex(&self.infohash)
    }

    /// Number of pieces in the content file.
    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Size of the piece at `index`.
    ///
    /// Every piece is `piece_length` bytes except the last, which holds
    /// whatever remains of the file.
    pub fn piece_size(&self, index: u32) -> u64 {
        let begin = u64::from(index) * self.piece_length;
        let end = (begin + self.piece_length).min(self.length);
        end.saturating_sub(begin)
    }
}

/// Generate a metainfo file for a content file.
///
/// Reads the file in `piece_length` chunks, hashing each chunk, then writes
/// the bencoded metainfo to `out_path`.
///
/// # Arguments
///
/// * `file_path` - Path to the content file.
/// * `announce_url` - Tracker announce URL to embed.
/// * `out_path` - Where to write the `.torrent` file.
/// * `piece_length` - Piece size in bytes, must be >= 1.
///
pub fn make_metainfo(
    file_path: &Path,
    announce_url: &str,
    out_path: &Path,
    piece_length: u64,
) -> Result<()> {
    if piece_length == 0 {
        return Err(anyhow!("piece length must be >= 1"));
    }

    // Open content file
    let mut file = match File::open(file_path) {
        Ok(file) => file,
        Err(_) => return Err(anyhow!("could not open file: {}", file_path.display())),
    };

    // Hash the file piece by piece
    let mut pieces_concat: Vec<u8> = vec![];
    let mut length: u64 = 0;
    let mut buf = vec![0u8; piece_length as usize];

    loop {
        let bytes = match read_full(&mut file, &mut buf) {
            Ok(bytes) => bytes,
            Err(_) => return Err(anyhow!("could not read file: {}", file_path.display())),
        };
        if bytes == 0 {
            break;
        }

        let mut hasher = Sha256::new();
        hasher.update(&buf[..bytes]);
        pieces_concat.extend_from_slice(&hasher.finish());

        length += bytes as u64;
    }

    // Content file name, without its directory
    let name = match file_path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return Err(anyhow!("could not get file name: {}", file_path.display())),
    };

    let info = BencodeInfo {
        length,
        name,
        piece_length,
        pieces: ByteBuf::from(pieces_concat),
    };

    // The content fingerprint is the digest of the bencoded info dictionary
    let infohash = info.hash()?;

    let creation_date = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let metainfo = BencodeMetainfo {
        announce: announce_url.to_string(),
        creation_date,
        info,
        infohash: Some(to_hex(&infohash)),
    };

    // Serialize and write the metainfo file
    let encoded = ser::to_bytes(&metainfo)?;
    let mut out = match File::create(out_path) {
        Ok(out) => out,
        Err(_) => return Err(anyhow!("could not create file: {}", out_path.display())),
    };
    if out.write_all(&encoded).is_err() {
        return Err(anyhow!("could not write file: {}", out_path.display()));
    }

    info!(
        "Generated metainfo {} ({} pieces, infohash {})",
        out_path.display(),
        metainfo.info.pieces.len() / PIECE_HASH_SIZE,
        to_hex(&infohash)
    );

    Ok(())
}

/// Parse a metainfo file.
///
/// The infohash is always recomputed from the `info` sub-dictionary. When
/// the file carries a stored infohash that disagrees, the recomputed value
/// wins and a diagnostic is logged.
pub fn read_metainfo(path: &Path) -> Result<Metainfo> {
    // Read metainfo file content in a buffer
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return Err(anyhow!("could not open metainfo: {}", path.display())),
    };
    let mut buf = vec![];
    if file.read_to_end(&mut buf).is_err() {
        return Err(anyhow!("could not read metainfo: {}", path.display()));
    }

    // Deserialize bencoded data
    let bencode = match de::from_bytes::<BencodeMetainfo>(&buf) {
        Ok(bencode) => bencode,
        Err(_) => return Err(anyhow!("could not decode metainfo: {}", path.display())),
    };

    let piece_hashes = bencode.info.split_pieces_hashes()?;
    let infohash = bencode.info.hash()?;

    // Cross-check a stored infohash, preferring the recomputed value
    if let Some(stored) = &bencode.infohash {
        if !stored.eq_ignore_ascii_case(&to_hex(&infohash)) {
            warn!(
                "stored infohash {} disagrees with recomputed {} in {}",
                stored,
                to_hex(&infohash),
                path.display()
            );
        }
    }

    Ok(Metainfo {
        announce: bencode.announce,
        creation_date: bencode.creation_date,
        name: bencode.info.name,
        piece_length: bencode.info.piece_length,
        length: bencode.info.length,
        piece_hashes,
        infohash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::path::PathBuf;

    use serde_bencode::value::Value;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("btmini-metainfo-{}-{}", std::process::id(), name))
    }

    fn write_file(path: &Path, data: &[u8]) {
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn generate_then_parse_round_trips() {
        let content = temp_path("roundtrip.bin");
        let torrent = temp_path("roundtrip.bin.torrent");
        // 1 500 000 bytes with 500 000-byte pieces: exactly 3 hashes
        let data: Vec<u8> = (0..1_500_000u32).map(|i| (i % 251) as u8).collect();
        write_file(&content, &data);

        make_metainfo(&content, "http://127.0.0.1:8080/announce", &torrent, 500_000).unwrap();
        let meta = read_metainfo(&torrent).unwrap();

        assert_eq!(meta.announce, "http://127.0.0.1:8080/announce");
        assert_eq!(meta.piece_length, 500_000);
        assert_eq!(meta.length, 1_500_000);
        assert_eq!(meta.piece_hashes.len(), 3);
        assert_eq!(meta.infohash.len(), PIECE_HASH_SIZE);
        assert_eq!(meta.num_pieces(), 3);

        // Piece hashes match a direct digest of each chunk
        for (i, chunk) in data.chunks(500_000).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(chunk);
            assert_eq!(meta.piece_hashes[i], hasher.finish().to_vec());
        }

        // The infohash is the digest of the bencoded info dictionary
        let info = BencodeInfo {
            length: meta.length,
            name: meta.name.clone(),
            piece_length: meta.piece_length,
            pieces: ByteBuf::from(meta.piece_hashes.concat()),
        };
        assert_eq!(meta.infohash, info.hash().unwrap());

        std::fs::remove_file(&content).unwrap();
        std::fs::remove_file(&torrent).unwrap();
    }

    #[test]
    fn piece_count_matches_ceiling_division() {
        let content = temp_path("short.bin");
        let torrent = temp_path("short.bin.torrent");
        write_file(&content, &[7u8; 1000]);

        make_metainfo(&content, "http://t/announce", &torrent, 512).unwrap();
        let meta = read_metainfo(&torrent).unwrap();

        // ceil(1000 / 512) == 2, final piece short
        assert_eq!(meta.piece_hashes.len(), 2);
        assert_eq!(meta.piece_size(0), 512);
        assert_eq!(meta.piece_size(1), 488);

        std::fs::remove_file(&content).unwrap();
        std::fs::remove_file(&torrent).unwrap();
    }

    #[test]
    fn empty_file_has_zero_pieces() {
        let content = temp_path("empty.bin");
        let torrent = temp_path("empty.bin.torrent");
        write_file(&content, &[]);

        make_metainfo(&content, "http://t/announce", &torrent, 512_000).unwrap();
        let meta = read_metainfo(&torrent).unwrap();

        assert_eq!(meta.length, 0);
        assert!(meta.piece_hashes.is_empty());

        std::fs::remove_file(&content).unwrap();
        std::fs::remove_file(&torrent).unwrap();
    }

    #[test]
    fn zero_piece_length_is_rejected() {
        let content = temp_path("zerolen.bin");
        let torrent = temp_path("zerolen.bin.torrent");
        write_file(&content, b"data");

        assert!(make_metainfo(&content, "http://t/announce", &torrent, 0).is_err());

        std::fs::remove_file(&content).unwrap();
    }

    #[test]
    fn ragged_pieces_field_is_malformed() {
        let torrent = temp_path("ragged.torrent");
        let metainfo = BencodeMetainfo {
            announce: "http://t/announce".to_string(),
            creation_date: 0,
            info: BencodeInfo {
                length: 100,
                name: "x".to_string(),
                piece_length: 50,
                // 33 bytes: not a whole number of 32-byte digests
                pieces: ByteBuf::from(vec![0u8; PIECE_HASH_SIZE + 1]),
            },
            infohash: None,
        };
        write_file(&torrent, &ser::to_bytes(&metainfo).unwrap());

        assert!(read_metainfo(&torrent).is_err());

        std::fs::remove_file(&torrent).unwrap();
    }

    #[test]
    fn stored_infohash_mismatch_prefers_recomputed() {
        let torrent = temp_path("mismatch.torrent");
        let info = BencodeInfo {
            length: 4,
            name: "x".to_string(),
            piece_length: 4,
            pieces: ByteBuf::from(vec![0u8; PIECE_HASH_SIZE]),
        };
        let expected = info.hash().unwrap();
        let metainfo = BencodeMetainfo {
            announce: "http://t/announce".to_string(),
            creation_date: 0,
            info,
            infohash: Some("DEADBEEF".to_string()),
        };
        write_file(&torrent, &ser::to_bytes(&metainfo).unwrap());

        let meta = read_metainfo(&torrent).unwrap();
        assert_eq!(meta.infohash, expected);

        std::fs::remove_file(&torrent).unwrap();
    }

    #[test]
    fn metainfo_tolerates_absent_stored_infohash() {
        let torrent = temp_path("noih.torrent");
        let metainfo = BencodeMetainfo {
            announce: "http://t/announce".to_string(),
            creation_date: 42,
            info: BencodeInfo {
                length: 0,
                name: "empty".to_string(),
                piece_length: 1,
                pieces: ByteBuf::from(vec![]),
            },
            infohash: None,
        };
        write_file(&torrent, &ser::to_bytes(&metainfo).unwrap());

        let meta = read_metainfo(&torrent).unwrap();
        assert_eq!(meta.creation_date, 42);
        assert_eq!(meta.name, "empty");

        std::fs::remove_file(&torrent).unwrap();
    }

    #[test]
    fn bencode_round_trips_with_unsorted_dict_input() {
        // Dictionary built in non-sorted insertion order; the encoder must
        // emit sorted keys and the decoded value must still compare equal.
        let mut dict: HashMap<Vec<u8>, Value> = HashMap::new();
        dict.insert(b"zebra".to_vec(), Value::Int(1));
        dict.insert(b"apple".to_vec(), Value::Bytes(b"fruit".to_vec()));
        dict.insert(
            b"list".to_vec(),
            Value::List(vec![Value::Int(-3), Value::Bytes(vec![0xff, 0x00])]),
        );
        let value = Value::Dict(dict);

        let encoded = ser::to_bytes(&value).unwrap();
        let decoded: Value = de::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, value);

        // Keys come out byte-sorted
        let apple = encoded.windows(5).position(|w| w == &b"apple"[..]).unwrap();
        let list = encoded.windows(4).position(|w| w == &b"list"[..]).unwrap();
        let zebra = encoded.windows(5).position(|w| w == &b"zebra"[..]).unwrap();
        assert!(apple < list && list < zebra);
    }

    #[test]
    fn bencode_integer_and_string_forms() {
        assert_eq!(ser::to_bytes(&Value::Int(-42)).unwrap(), b"i-42e".to_vec());
        assert_eq!(
            ser::to_bytes(&Value::Bytes(b"spam".to_vec())).unwrap(),
            b"4:spam".to_vec()
        );
    }
}
