//! # Download Bookkeeping
//!
//! Tracks every in-progress download and folds received piece fragments into
//! a sparse output file.
//!
//! ## Reassembly
//!
//! Fragments carry their offset inside the piece, so they may arrive in any
//! order and from interleaved pieces. The output file is pre-allocated to
//! its final size the first time a fragment arrives, which makes positioned
//! writes safe anywhere in the file. Byte-level writes are idempotent; a
//! lost fragment simply leaves its piece incomplete.
//!
//! ## Progress accounting
//!
//! Per download, under one lock:
//!
//! - `sum(bytes_received_per_piece) == bytes_downloaded_total <= total_size`
//! - `piece_complete[i]` iff piece `i` received its full expected size
//! - `completed` is monotonic: once every piece is complete it stays set
//!
//! Fragment counts are clamped against the expected piece size so a
//! misbehaving peer cannot inflate the totals.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::metainfo::Metainfo;

/// One download record, alive for the process lifetime.
#[derive(Debug)]
pub struct Download {
    /// Content name from the metainfo
    pub name: String,
    /// Final size of the output file in bytes
    pub total_size: u64,
    /// Uppercase infohash hex identifying the content
    pub infohash_hex: String,
    /// Piece size in bytes (except possibly the last piece)
    pub piece_length: u64,
    /// Number of pieces
    pub num_pieces: u32,
    /// Where the reassembled file is written
    pub output_path: PathBuf,
    bytes_received_per_piece: Vec<u64>,
    piece_complete: Vec<bool>,
    bytes_downloaded_total: u64,
    pieces_complete_count: u32,
    completed: bool,
}

/// Progress snapshot of one download, for display.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub name: String,
    pub infohash_hex: String,
    pub bytes_downloaded: u64,
    pub total_size: u64,
    pub pieces_complete: u32,
    pub num_pieces: u32,
    pub completed: bool,
}

impl Download {
    /// Expected size of the piece at `index`.
    fn piece_size(&self, index: u32) -> u64 {
        let begin = u64::from(index) * self.piece_length;
        let end = (begin + self.piece_length).min(self.total_size);
        end.saturating_sub(begin)
    }

    /// Pre-allocate the sparse output file when missing or mis-sized.
    fn ensure_output_file(&self) -> std::io::Result<()> {
        let needs_allocation = match std::fs::metadata(&self.output_path) {
            Ok(meta) => meta.len() != self.total_size,
            Err(_) => true,
        };

        if needs_allocation {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.output_path)?;
            file.set_len(self.total_size)?;
            debug!(
                "pre-allocated {} ({} bytes)",
                self.output_path.display(),
                self.total_size
            );
        }

        Ok(())
    }
}

/// All downloads of this process, shared between the UI and the receive
/// loop behind one mutex.
#[derive(Debug, Default)]
pub struct DownloadTable {
    downloads: Mutex<Vec<Download>>,
}

impl DownloadTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Create a download record for a metainfo.
    ///
    /// Returns `false` when a download for the same infohash already exists;
    /// records are never removed, so the infohash stays claimed for the
    /// process lifetime.
    pub fn add(&self, meta: &Metainfo, output_path: &Path) -> bool {
        let infohash_hex = meta.infohash_hex();
        let num_pieces = meta.num_pieces();

        let mut downloads = self.lock();
        if downloads.iter().any(|d| d.infohash_hex == infohash_hex) {
            return false;
        }

        info!(
            "tracking download {} ({} bytes, {} pieces)",
            meta.name, meta.length, num_pieces
        );

        downloads.push(Download {
            name: meta.name.clone(),
            total_size: meta.length,
            infohash_hex,
            piece_length: meta.piece_length,
            num_pieces,
            output_path: output_path.to_path_buf(),
            bytes_received_per_piece: vec![0; num_pieces as usize],
            piece_complete: vec![false; num_pieces as usize],
            bytes_downloaded_total: 0,
            pieces_complete_count: 0,
            // An empty file has nothing left to receive
            completed: num_pieces == 0,
        });

        true
    }

    /// Fold one received piece fragment into its download.
    ///
    /// Invoked from the engine's receive loop for every `PIECE` datagram.
    /// Fragments for unknown downloads, out-of-range piece indices, or byte
    /// ranges past the end of the file are dropped with a log line.
    pub fn apply_chunk(
        &self,
        infohash_hex: &str,
        piece_index: u32,
        offset_in_piece: u64,
        total_piece_size: u64,
        bytes: &[u8],
    ) {
        let mut downloads = self.lock();

        let Some(download) = downloads
            .iter_mut()
            .find(|d| d.infohash_hex == infohash_hex)
        else {
            debug!("fragment for unknown download {}", infohash_hex);
            return;
        };

        if piece_index >= download.num_pieces {
            debug!(
                "fragment for out-of-range piece {} of {}",
                piece_index, download.name
            );
            return;
        }

        let expected = download.piece_size(piece_index);
        if total_piece_size != expected {
            debug!(
                "peer reports piece {} size {} but expected {}",
                piece_index, total_piece_size, expected
            );
        }

        if let Err(e) = download.ensure_output_file() {
            warn!(
                "could not allocate {}: {}",
                download.output_path.display(),
                e
            );
            return;
        }

        let abs_offset = u64::from(piece_index) * download.piece_length + offset_in_piece;
        if abs_offset + bytes.len() as u64 > download.total_size {
            debug!(
                "fragment past end of {} (offset {}, {} bytes), dropped",
                download.name,
                abs_offset,
                bytes.len()
            );
            return;
        }

        // Positioned write into the pre-allocated file
        let write_result = OpenOptions::new()
            .write(true)
            .open(&download.output_path)
            .and_then(|mut file| {
                file.seek(SeekFrom::Start(abs_offset))?;
                file.write_all(bytes)
            });
        if let Err(e) = write_result {
            warn!("could not write {}: {}", download.output_path.display(), e);
            return;
        }

        // Progress accounting, clamped against overrun
        let idx = piece_index as usize;
        let received = download.bytes_received_per_piece[idx];
        let delta = (bytes.len() as u64).min(expected.saturating_sub(received));
        download.bytes_received_per_piece[idx] += delta;
        download.bytes_downloaded_total =
            (download.bytes_downloaded_total + delta).min(download.total_size);

        if download.bytes_received_per_piece[idx] == expected && !download.piece_complete[idx] {
            download.piece_complete[idx] = true;
            download.pieces_complete_count += 1;
            debug!(
                "piece {} of {} complete ({}/{})",
                piece_index, download.name, download.pieces_complete_count, download.num_pieces
            );
        }

        if download.pieces_complete_count == download.num_pieces && !download.completed {
            download.completed = true;
            info!("download {} complete", download.name);
        }
    }

    /// Progress of one download, by infohash.
    pub fn progress(&self, infohash_hex: &str) -> Option<DownloadProgress> {
        self.lock()
            .iter()
            .find(|d| d.infohash_hex == infohash_hex)
            .map(progress_of)
    }

    /// Progress of every download.
    pub fn snapshot(&self) -> Vec<DownloadProgress> {
        self.lock().iter().map(progress_of).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Download>> {
        match self.downloads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn progress_of(download: &Download) -> DownloadProgress {
    DownloadProgress {
        name: download.name.clone(),
        infohash_hex: download.infohash_hex.clone(),
        bytes_downloaded: download.bytes_downloaded_total,
        total_size: download.total_size,
        pieces_complete: download.pieces_complete_count,
        num_pieces: download.num_pieces,
        completed: download.completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::metainfo::PIECE_HASH_SIZE;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("btmini-dl-{}-{}", std::process::id(), name))
    }

    fn test_meta(name: &str, length: u64, piece_length: u64) -> Metainfo {
        let num_pieces = if length == 0 {
            0
        } else {
            (length + piece_length - 1) / piece_length
        };
        Metainfo {
            announce: "http://t/announce".to_string(),
            creation_date: 0,
            name: name.to_string(),
            piece_length,
            length,
            piece_hashes: vec![vec![0u8; PIECE_HASH_SIZE]; num_pieces as usize],
            infohash: name.as_bytes().to_vec(),
        }
    }

    fn check_invariants(table: &DownloadTable, infohash_hex: &str) {
        let downloads = table.lock();
        let d = downloads
            .iter()
            .find(|d| d.infohash_hex == infohash_hex)
            .unwrap();
        let sum: u64 = d.bytes_received_per_piece.iter().sum();
        assert_eq!(sum, d.bytes_downloaded_total);
        assert!(d.bytes_downloaded_total <= d.total_size);
        let complete = d.piece_complete.iter().filter(|&&c| c).count() as u32;
        assert_eq!(complete, d.pieces_complete_count);
        assert_eq!(d.completed, d.pieces_complete_count == d.num_pieces);
    }

    #[test]
    fn out_of_order_fragments_reassemble_the_piece() {
        let out = temp_path("reorder.bin");
        let meta = test_meta("reorder", 3072, 3072);
        let ih = meta.infohash_hex();
        let table = DownloadTable::new();
        assert!(table.add(&meta, &out));

        let a = vec![1u8; 1024];
        let b = vec![2u8; 1024];
        let c = vec![3u8; 1024];

        // Offsets 0, 2048, 1024 - deliberately out of order
        table.apply_chunk(&ih, 0, 0, 3072, &a);
        table.apply_chunk(&ih, 0, 2048, 3072, &c);
        check_invariants(&table, &ih);
        assert!(!table.progress(&ih).unwrap().completed);

        table.apply_chunk(&ih, 0, 1024, 3072, &b);

        let progress = table.progress(&ih).unwrap();
        assert!(progress.completed);
        assert_eq!(progress.bytes_downloaded, 3072);
        assert_eq!(progress.pieces_complete, 1);
        check_invariants(&table, &ih);

        let written = std::fs::read(&out).unwrap();
        assert_eq!(written.len(), 3072);
        assert_eq!(&written[..1024], &a[..]);
        assert_eq!(&written[1024..2048], &b[..]);
        assert_eq!(&written[2048..], &c[..]);

        std::fs::remove_file(&out).unwrap();
    }

    #[test]
    fn duplicate_infohash_is_not_added_twice() {
        let meta = test_meta("dup", 100, 50);
        let table = DownloadTable::new();

        assert!(table.add(&meta, &temp_path("dup1.bin")));
        assert!(!table.add(&meta, &temp_path("dup2.bin")));
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn unknown_download_and_bad_piece_index_are_dropped() {
        let out = temp_path("drop.bin");
        let meta = test_meta("drop", 100, 50);
        let ih = meta.infohash_hex();
        let table = DownloadTable::new();
        table.add(&meta, &out);

        table.apply_chunk("NOTKNOWN", 0, 0, 50, &[0u8; 10]);
        table.apply_chunk(&ih, 2, 0, 50, &[0u8; 10]);

        let progress = table.progress(&ih).unwrap();
        assert_eq!(progress.bytes_downloaded, 0);
        check_invariants(&table, &ih);

        let _ = std::fs::remove_file(&out);
    }

    #[test]
    fn fragment_past_end_of_file_is_dropped() {
        let out = temp_path("pastend.bin");
        let meta = test_meta("pastend", 100, 50);
        let ih = meta.infohash_hex();
        let table = DownloadTable::new();
        table.add(&meta, &out);

        // Piece 1 holds bytes [50, 100); offset 40 would run past the end
        table.apply_chunk(&ih, 1, 40, 50, &[9u8; 20]);

        assert_eq!(table.progress(&ih).unwrap().bytes_downloaded, 0);
        check_invariants(&table, &ih);

        let _ = std::fs::remove_file(&out);
    }

    #[test]
    fn overrun_from_a_misbehaving_peer_is_clamped() {
        let out = temp_path("clamp.bin");
        let meta = test_meta("clamp", 100, 50);
        let ih = meta.infohash_hex();
        let table = DownloadTable::new();
        table.add(&meta, &out);

        // 30 bytes, then 30 more: only 50 count toward the 50-byte piece
        table.apply_chunk(&ih, 0, 0, 50, &[1u8; 30]);
        table.apply_chunk(&ih, 0, 20, 50, &[2u8; 30]);

        let progress = table.progress(&ih).unwrap();
        assert_eq!(progress.bytes_downloaded, 50);
        assert_eq!(progress.pieces_complete, 1);
        check_invariants(&table, &ih);

        std::fs::remove_file(&out).unwrap();
    }

    #[test]
    fn completed_is_monotonic() {
        let out = temp_path("mono.bin");
        let meta = test_meta("mono", 60, 60);
        let ih = meta.infohash_hex();
        let table = DownloadTable::new();
        table.add(&meta, &out);

        table.apply_chunk(&ih, 0, 0, 60, &[5u8; 60]);
        assert!(table.progress(&ih).unwrap().completed);

        // A late duplicate fragment must not regress anything
        table.apply_chunk(&ih, 0, 0, 60, &[5u8; 60]);
        let progress = table.progress(&ih).unwrap();
        assert!(progress.completed);
        assert_eq!(progress.bytes_downloaded, 60);
        check_invariants(&table, &ih);

        std::fs::remove_file(&out).unwrap();
    }

    #[test]
    fn output_file_is_preallocated_to_full_size() {
        let out = temp_path("prealloc.bin");
        let meta = test_meta("prealloc", 5000, 1000);
        let ih = meta.infohash_hex();
        let table = DownloadTable::new();
        table.add(&meta, &out);

        table.apply_chunk(&ih, 3, 0, 1000, &[7u8; 100]);

        assert_eq!(std::fs::metadata(&out).unwrap().len(), 5000);

        std::fs::remove_file(&out).unwrap();
    }
}
