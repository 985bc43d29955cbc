//! Offset-accurate reads of gzip members out of the backing archives.
//!
//! The index pins each structure to an archive, a header offset and a
//! compressed size. A read opens the archive, seeks past the member's
//! 512-byte tar header, reads exactly the compressed payload and inflates
//! the whole member into memory; the requested slice is served from that
//! buffer. Decoded members are retained in a small MRU cache keyed by
//! `(uniprot_id, version)` so sequential reads over one file decompress
//! only once.
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use flate2::read::GzDecoder;
use lru::LruCache;
use tracing::debug;

use crate::db::FileInfo;
use crate::resolver::FsError;

/// Number of decoded members retained.
const DECODE_CACHE_SIZE: usize = 50;

/// Reads members out of the archives below one root directory.
pub struct ArchiveReader {
    root: PathBuf,
    cache: Mutex<LruCache<(String, i64), Arc<Vec<u8>>>>,
}

impl ArchiveReader {
    /// Create a reader for archives below `root`.
    pub fn new(root: PathBuf) -> ArchiveReader {
        ArchiveReader {
            root,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(DECODE_CACHE_SIZE).unwrap())),
        }
    }

    /// Read a byte range of the decompressed member described by `info`.
    ///
    /// The whole member is decompressed; the slice
    /// `[offset, offset + size)` of the result is returned, clamped to the
    /// member length. Reads starting at or past the end return empty bytes.
    pub fn read(&self, info: &FileInfo, size: u32, offset: u64) -> Result<Vec<u8>, FsError> {
        let decoded = self.decode(info)?;
        Ok(slice_at(&decoded, size as usize, offset as usize).to_vec())
    }

    /// Fully decompressed bytes of the member described by `info`.
    pub fn decode(&self, info: &FileInfo) -> Result<Arc<Vec<u8>>, FsError> {
        let key = (info.uniprot_id.clone(), info.version);
        if let Some(decoded) = self.cache.lock().unwrap().get(&key) {
            return Ok(decoded.clone());
        }

        debug!(
            uniprot_id = %info.uniprot_id,
            relpath = %info.relpath,
            offset = info.offset,
            size = info.size,
            "decoding member"
        );

        let mut archive = File::open(self.root.join(&info.relpath))?;
        archive.seek(SeekFrom::Start(info.offset + 512))?;
        let mut compressed = vec![0u8; info.size as usize];
        archive.read_exact(&mut compressed)?;

        let mut decoded = Vec::with_capacity(info.expanded_size as usize);
        GzDecoder::new(compressed.as_slice()).read_to_end(&mut decoded)?;

        // Only successfully decoded members enter the cache.
        let decoded = Arc::new(decoded);
        self.cache.lock().unwrap().put(key, decoded.clone());
        Ok(decoded)
    }
}

/// Clamped slice of a buffer. Shared with the README passthrough.
pub fn slice_at(buffer: &[u8], size: usize, offset: usize) -> &[u8] {
    if offset >= buffer.len() {
        return &[];
    }
    let end = buffer.len().min(offset + size);
    &buffer[offset..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use std::fs;

    fn fixture(dir: &std::path::Path, payload: &[u8]) -> (ArchiveReader, FileInfo) {
        let member = testutil::gzip(payload);
        let tar = testutil::tar_archive(&[testutil::member(
            "AF-A0A1Q1MKJ4-F1-model_v3.cif.gz",
            &member,
            1666224000,
        )]);
        fs::create_dir_all(dir.join("v3")).unwrap();
        fs::write(dir.join("v3/chunk-0.tar"), tar).unwrap();

        let info = FileInfo {
            uniprot_id: "A0A1Q1MKJ4".to_string(),
            version: 3,
            relpath: "v3/chunk-0.tar".to_string(),
            offset: 0,
            size: member.len() as u64,
            expanded_size: payload.len() as u64,
            modification_time: 1666224000,
        };
        (ArchiveReader::new(dir.to_path_buf()), info)
    }

    #[test]
    fn whole_member_and_slices() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"data_A0A1Q1MKJ4\n#\nloop_\n_atom_site.id\n";
        let (reader, info) = fixture(dir.path(), payload);

        let all = reader.read(&info, payload.len() as u32, 0).unwrap();
        assert_eq!(all, payload);

        // Tail read past the end is clamped to the final bytes.
        let tail = reader.read(&info, 10, payload.len() as u64 - 5).unwrap();
        assert_eq!(tail, &payload[payload.len() - 5..]);

        // Reads at or beyond the end are empty.
        assert!(reader.read(&info, 16, payload.len() as u64).unwrap().is_empty());
    }

    #[test]
    fn reads_are_idempotent_and_concatenate() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let (reader, info) = fixture(dir.path(), &payload);

        let first = reader.read(&info, 1000, 0).unwrap();
        let again = reader.read(&info, 1000, 0).unwrap();
        assert_eq!(first, again);

        let rest = reader.read(&info, 2000, 1000).unwrap();
        let mut joined = first;
        joined.extend_from_slice(&rest);
        assert_eq!(joined, payload);
    }

    #[test]
    fn truncated_archive_is_an_error_and_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (reader, mut info) = fixture(dir.path(), b"short payload");
        // Claim more compressed bytes than the archive holds.
        info.size += 100_000;

        assert!(matches!(reader.read(&info, 8, 0), Err(FsError::Io(_))));
        // The failure did not populate the cache; a fixed record decodes.
        info.size -= 100_000;
        assert_eq!(reader.read(&info, 5, 0).unwrap(), b"short");
    }

    #[test]
    fn slice_clamping() {
        let buf = b"0123456789";
        assert_eq!(slice_at(buf, 4, 0), b"0123");
        assert_eq!(slice_at(buf, 100, 6), b"6789");
        assert_eq!(slice_at(buf, 1, 10), b"");
        assert_eq!(slice_at(buf, 0, 3), b"");
    }
}
