//! Read-only access to the SQLite structure index.
//!
//! The index is produced offline by the `index` subcommand and opened here
//! with read-only URI semantics. One connection is shared and serialized
//! behind a mutex so individual statements execute atomically. Lookups of
//! single structures go through a bounded MRU cache; directory enumerations
//! always hit SQLite.
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use lru::LruCache;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use tracing::debug;

use crate::resolver::FsError;

/// Number of `file_info` results (hits and misses) retained.
const INFO_CACHE_SIZE: usize = 10_000;

/// One `files` row: where a structure lives inside the archive tree and how
/// big it gets once decompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub uniprot_id: String,
    pub version: i64,

    /// Archive path relative to the configured archive root.
    pub relpath: String,

    /// Byte offset of the member's 512-byte tar header within the archive.
    pub offset: u64,

    /// Compressed payload size in bytes.
    pub size: u64,

    /// Size of the gzip-decompressed payload in bytes.
    pub expanded_size: u64,

    /// Member modification time, seconds since epoch.
    pub modification_time: i64,
}

/// Read-only handle on the structure index.
pub struct Db {
    conn: Mutex<Connection>,
    info_cache: Mutex<LruCache<(String, Option<i64>), Option<FileInfo>>>,
}

impl Db {
    /// Open the index read-only.
    ///
    /// # Arguments
    /// * `path` - Path of the SQLite index file.
    pub fn open(path: &Path) -> Result<Db, FsError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Db {
            conn: Mutex::new(conn),
            info_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(INFO_CACHE_SIZE).unwrap(),
            )),
        })
    }

    /// Distinct dataset versions present in the index, oldest first.
    pub fn versions(&self) -> Result<Vec<i64>, FsError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT DISTINCT(version) AS version FROM versions ORDER BY version")?;
        let versions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(versions)
    }

    /// Locate one structure by identifier, served from the MRU cache when
    /// possible. Misses are cached too; I/O-level failures are not.
    ///
    /// # Arguments
    /// * `raw_id` - Identifier as it appears in a path, possibly carrying a
    ///   `_v<N>` version suffix and a `.cif` extension.
    /// * `max_version` - Upper bound on the dataset version, when serving
    ///   below a version root.
    pub fn file_info(&self, raw_id: &str, max_version: Option<i64>) -> Result<FileInfo, FsError> {
        let key = (raw_id.to_string(), max_version);
        if let Some(cached) = self.info_cache.lock().unwrap().get(&key) {
            return cached.clone().ok_or(FsError::NotFound);
        }

        match self.file_info_uncached(raw_id, max_version) {
            Ok(info) => {
                self.info_cache.lock().unwrap().put(key, Some(info.clone()));
                Ok(info)
            }
            Err(FsError::NotFound) => {
                self.info_cache.lock().unwrap().put(key, None);
                Err(FsError::NotFound)
            }
            Err(other) => Err(other),
        }
    }

    fn file_info_uncached(
        &self,
        raw_id: &str,
        max_version: Option<i64>,
    ) -> Result<FileInfo, FsError> {
        let (uniprot_id, pinned) = parse_identifier(raw_id)?;

        // An explicitly requested version newer than the version root cannot
        // exist below it.
        if let (Some(pinned), Some(cap)) = (pinned, max_version) {
            if pinned > cap {
                return Err(FsError::NotFound);
            }
        }

        let mut sql = String::from(
            "SELECT relpath, offset, size, expanded_size, modification_time, version \
             FROM files WHERE uniprot_id = ?",
        );
        let mut args: Vec<Value> = vec![Value::from(uniprot_id.to_string())];
        if let Some(pinned) = pinned {
            sql.push_str(" AND version = ?");
            args.push(Value::from(pinned));
        }
        if let Some(cap) = max_version {
            sql.push_str(" AND version <= ?");
            args.push(Value::from(cap));
        }
        sql.push_str(" ORDER BY version DESC LIMIT 1");

        debug!(uniprot_id, ?pinned, ?max_version, "file_info lookup");
        let conn = self.conn.lock().unwrap();
        let info = conn
            .query_row(&sql, params_from_iter(args), |row| {
                Ok(FileInfo {
                    uniprot_id: uniprot_id.to_string(),
                    relpath: row.get(0)?,
                    offset: row.get::<_, i64>(1)? as u64,
                    size: row.get::<_, i64>(2)? as u64,
                    expanded_size: row.get::<_, i64>(3)? as u64,
                    modification_time: row.get(4)?,
                    version: row.get(5)?,
                })
            })
            .optional()?;
        info.ok_or(FsError::NotFound)
    }

    /// Structures cross-referenced from one taxonomy ID, as
    /// `(uniprot_id, newest version <= max_version)` pairs.
    pub fn uniprots_for_taxonomy(
        &self,
        taxonomy_id: &str,
        max_version: i64,
    ) -> Result<Vec<(String, i64)>, FsError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT taxonomy.uniprot_id, MAX(files.version) AS version \
             FROM taxonomy \
                  LEFT JOIN files ON taxonomy.uniprot_id = files.uniprot_id \
             WHERE taxonomy_id = ?1 AND files.version <= ?2 \
             GROUP BY taxonomy.uniprot_id",
        )?;
        let rows = stmt
            .query_map(params![taxonomy_id, max_version], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Structures cross-referenced from one PDB ID. The ID is normalized to
    /// upper case before the query.
    pub fn uniprots_for_pdb(
        &self,
        pdb_id: &str,
        max_version: i64,
    ) -> Result<Vec<(String, i64)>, FsError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT pdb.uniprot_id, MAX(files.version) AS version \
             FROM pdb \
                  LEFT JOIN files ON pdb.uniprot_id = files.uniprot_id \
             WHERE pdb.pdb_id = ?1 AND files.version <= ?2 \
             GROUP BY pdb.uniprot_id",
        )?;
        let rows = stmt
            .query_map(params![pdb_id.to_uppercase(), max_version], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Structures whose identifier falls in one two-character bucket.
    pub fn uniprots_by_bucket(
        &self,
        bucket: &str,
        max_version: i64,
    ) -> Result<Vec<(String, i64)>, FsError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT uniprot_id, MAX(version) AS version \
             FROM files \
             WHERE substr(uniprot_id, -3, 2) = ?1 AND version <= ?2 \
             GROUP BY uniprot_id",
        )?;
        let rows = stmt
            .query_map(params![bucket, max_version], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Taxonomy IDs in one bucket that have at least one backing structure.
    pub fn taxonomies_by_bucket(
        &self,
        bucket: &str,
        max_version: i64,
    ) -> Result<Vec<String>, FsError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT(taxonomy_id) AS taxonomy_id \
             FROM taxonomy \
                  LEFT JOIN files f ON taxonomy.uniprot_id = f.uniprot_id \
             WHERE substr(taxonomy_id, -3, 2) = ?1 AND f.version <= ?2",
        )?;
        let rows = stmt
            .query_map(params![bucket, max_version], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    /// PDB IDs in one bucket that have at least one backing structure.
    pub fn pdbs_by_bucket(&self, bucket: &str, max_version: i64) -> Result<Vec<String>, FsError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT(pdb_id) AS pdb_id \
             FROM pdb \
                  INNER JOIN files f ON pdb.uniprot_id = f.uniprot_id \
             WHERE substr(pdb.pdb_id, -3, 2) = ?1 AND f.version <= ?2",
        )?;
        let rows = stmt
            .query_map(params![bucket.to_uppercase(), max_version], |row| {
                row.get(0)
            })?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    /// Second-level directory characters below one PDB first-level character:
    /// the distinct characters co-occurring with it in the bucket positions.
    pub fn pdb_second_level(
        &self,
        first: &str,
        max_version: i64,
    ) -> Result<Vec<String>, FsError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT(substr(pdb_id, -2, 1)) AS second \
             FROM pdb \
                  LEFT JOIN files f ON pdb.uniprot_id = f.uniprot_id \
             WHERE substr(pdb_id, -3, 1) = ?1 AND f.version <= ?2",
        )?;
        let rows = stmt
            .query_map(params![first.to_uppercase(), max_version], |row| {
                row.get(0)
            })?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }
}

/// Split a path component naming a structure into identifier and optional
/// pinned version: `A0A1Q1MKJ4_v3.cif` → `("A0A1Q1MKJ4", Some(3))`.
///
/// A malformed version suffix (no leading `v`, non-digit remainder) does not
/// name anything in the index.
fn parse_identifier(raw: &str) -> Result<(&str, Option<i64>), FsError> {
    let trimmed = raw.strip_suffix(".cif").unwrap_or(raw);
    match trimmed.split_once('_') {
        None => Ok((trimmed, None)),
        Some((id, suffix)) => {
            let digits = suffix.strip_prefix('v').ok_or(FsError::NotFound)?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FsError::NotFound);
            }
            let version = digits.parse().map_err(|_| FsError::NotFound)?;
            Ok((id, Some(version)))
        }
    }
}
