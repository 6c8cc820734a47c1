//! # Content Catalog
//!
//! Enumerates the content root and records which files have a sibling
//! `.torrent`. The catalog is rebuilt on every scan; entries with a sibling
//! metainfo are marked `synced` and carry the infohash read from it, which
//! is what the periodic announcer keys its work on.

use anyhow::{anyhow, Result};

use std::path::{Path, PathBuf};

use crate::metainfo::read_metainfo;

const TORRENT_EXTENSION: &str = "torrent";

/// One candidate content file under the content root.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Filesystem path of the content file
    pub path: PathBuf,
    /// Display name (file name)
    pub name: String,
    /// File size in bytes
    pub size_bytes: u64,
    /// Uppercase infohash hex; empty until the sibling metainfo was read
    pub infohash_hex: String,
    /// Whether a sibling `.torrent` exists on disk
    pub synced: bool,
}

/// Path of the metainfo file that sits next to a content file:
/// `<path>.torrent`, appended to the full file name.
pub fn sibling_torrent_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(TORRENT_EXTENSION);
    PathBuf::from(name)
}

/// Scan the content root and rebuild the catalog.
///
/// The root directory is created when missing. Regular files are listed;
/// `.torrent` files themselves are skipped. For synced entries the sibling
/// metainfo is read to fill in the infohash; an unreadable sibling leaves
/// the infohash empty and is logged.
pub fn scan_content_root(root: &Path) -> Result<Vec<CatalogEntry>> {
    if !root.exists() {
        if std::fs::create_dir_all(root).is_err() {
            return Err(anyhow!("could not create content root: {}", root.display()));
        }
    }

    let dir = match std::fs::read_dir(root) {
        Ok(dir) => dir,
        Err(_) => return Err(anyhow!("could not read content root: {}", root.display())),
    };

    let mut entries = vec![];

    for dir_entry in dir {
        let Ok(dir_entry) = dir_entry else { continue };
        let path = dir_entry.path();

        let Ok(meta) = dir_entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }

        // Metainfo files are siblings, not content
        if path.extension().is_some_and(|e| e == TORRENT_EXTENSION) {
            continue;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let torrent_path = sibling_torrent_path(&path);
        let synced = torrent_path.exists();

        let infohash_hex = if synced {
            match read_metainfo(&torrent_path) {
                Ok(metainfo) => metainfo.infohash_hex(),
                Err(e) => {
                    warn!("could not read {}: {}", torrent_path.display(), e);
                    String::new()
                }
            }
        } else {
            String::new()
        };

        entries.push(CatalogEntry {
            path,
            name,
            size_bytes: meta.len(),
            infohash_hex,
            synced,
        });
    }

    // Stable listing for display
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    debug!(
        "scanned {}: {} entries, {} synced",
        root.display(),
        entries.len(),
        entries.iter().filter(|e| e.synced).count()
    );

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::metainfo::make_metainfo;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("btmini-catalog-{}-{}", std::process::id(), name))
    }

    #[test]
    fn scan_lists_content_and_marks_synced_entries() {
        let root = temp_root("scan");
        std::fs::create_dir_all(&root).unwrap();

        let synced_file = root.join("synced.bin");
        std::fs::write(&synced_file, vec![1u8; 4096]).unwrap();
        make_metainfo(
            &synced_file,
            "http://127.0.0.1:8080/announce",
            &sibling_torrent_path(&synced_file),
            1024,
        )
        .unwrap();

        let plain_file = root.join("plain.bin");
        std::fs::write(&plain_file, vec![2u8; 100]).unwrap();

        let entries = scan_content_root(&root).unwrap();

        // The .torrent file itself is not listed
        assert_eq!(entries.len(), 2);

        let plain = entries.iter().find(|e| e.name == "plain.bin").unwrap();
        assert!(!plain.synced);
        assert!(plain.infohash_hex.is_empty());
        assert_eq!(plain.size_bytes, 100);

        let synced = entries.iter().find(|e| e.name == "synced.bin").unwrap();
        assert!(synced.synced);
        assert_eq!(synced.infohash_hex.len(), 64);
        assert_eq!(synced.size_bytes, 4096);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn scan_creates_a_missing_root() {
        let root = temp_root("fresh");
        let _ = std::fs::remove_dir_all(&root);

        let entries = scan_content_root(&root).unwrap();
        assert!(entries.is_empty());
        assert!(root.is_dir());

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn sibling_path_appends_the_full_name() {
        let path = Path::new("/data/movie.mkv");
        assert_eq!(
            sibling_torrent_path(path),
            PathBuf::from("/data/movie.mkv.torrent")
        );
    }
}
