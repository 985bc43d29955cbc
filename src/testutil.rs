//! Shared fixtures: in-memory ustar archives and serving-schema index files.
use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, Connection};

/// One `files` row for [`build_index`].
pub struct FileRow {
    pub uniprot_id: String,
    pub version: i64,
    pub relpath: String,
    pub offset: i64,
    pub size: i64,
    pub expanded_size: i64,
    pub modification_time: i64,
}

#[allow(clippy::too_many_arguments)]
pub fn row(
    uniprot_id: &str,
    version: i64,
    relpath: &str,
    offset: i64,
    size: i64,
    expanded_size: i64,
    modification_time: i64,
) -> FileRow {
    FileRow {
        uniprot_id: uniprot_id.to_string(),
        version,
        relpath: relpath.to_string(),
        offset,
        size,
        expanded_size,
        modification_time,
    }
}

/// Create an index file with the serving schema and the given rows.
pub fn build_index(
    path: &Path,
    files: &[FileRow],
    pdb: &[(&str, &str)],
    taxonomy: &[(&str, &str)],
) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE files (relpath text, version int, uniprot_id text,
             offset numeric, size numeric, expanded_size numeric,
             modification_time numeric,
             PRIMARY KEY(uniprot_id, version)) WITHOUT ROWID;
         CREATE TABLE versions (version int);
         CREATE TABLE pdb (uniprot_id text, pdb_id text,
             PRIMARY KEY (uniprot_id, pdb_id)) WITHOUT ROWID;
         CREATE TABLE taxonomy (uniprot_id text, taxonomy_id text,
             PRIMARY KEY (uniprot_id, taxonomy_id)) WITHOUT ROWID;
         CREATE TABLE taxonomy_unique (taxonomy_id text PRIMARY KEY) WITHOUT ROWID;",
    )
    .unwrap();

    for f in files {
        conn.execute(
            "INSERT INTO files (relpath, version, uniprot_id, offset, size, \
             expanded_size, modification_time) VALUES (?,?,?,?,?,?,?)",
            params![
                f.relpath,
                f.version,
                f.uniprot_id,
                f.offset,
                f.size,
                f.expanded_size,
                f.modification_time
            ],
        )
        .unwrap();
    }
    conn.execute(
        "INSERT INTO versions (version) SELECT DISTINCT(version) FROM files",
        [],
    )
    .unwrap();
    for (uniprot_id, pdb_id) in pdb {
        conn.execute(
            "INSERT INTO pdb (uniprot_id, pdb_id) VALUES (?,?)",
            params![uniprot_id, pdb_id],
        )
        .unwrap();
    }
    for (uniprot_id, taxonomy_id) in taxonomy {
        conn.execute(
            "INSERT INTO taxonomy (uniprot_id, taxonomy_id) VALUES (?,?)",
            params![uniprot_id, taxonomy_id],
        )
        .unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO taxonomy_unique (taxonomy_id) VALUES (?)",
            params![taxonomy_id],
        )
        .unwrap();
    }
}

/// Gzip-compress a payload the way the corpus stores members.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// One archive member for [`tar_archive`].
pub struct Member {
    pub name: String,
    pub payload: Vec<u8>,
    pub mtime: u64,
}

pub fn member(name: &str, payload: &[u8], mtime: u64) -> Member {
    Member {
        name: name.to_string(),
        payload: payload.to_vec(),
        mtime,
    }
}

/// Assemble a POSIX ustar archive in memory: per-member 512-byte header,
/// payload padded to 512, two zero blocks at the end.
pub fn tar_archive(members: &[Member]) -> Vec<u8> {
    let mut archive = Vec::new();
    for m in members {
        archive.extend_from_slice(&header_block(&m.name, m.payload.len() as u64, m.mtime));
        archive.extend_from_slice(&m.payload);
        let padding = (512 - m.payload.len() % 512) % 512;
        archive.resize(archive.len() + padding, 0);
    }
    archive.resize(archive.len() + 1024, 0);
    archive
}

fn header_block(name: &str, size: u64, mtime: u64) -> [u8; 512] {
    let mut block = [0u8; 512];
    block[..name.len()].copy_from_slice(name.as_bytes());
    block[100..108].copy_from_slice(b"0000444\0");
    block[108..116].copy_from_slice(b"0000000\0");
    block[116..124].copy_from_slice(b"0000000\0");
    block[124..136].copy_from_slice(format!("{size:011o}\0").as_bytes());
    block[136..148].copy_from_slice(format!("{mtime:011o}\0").as_bytes());
    block[148..156].copy_from_slice(b"        ");
    block[156] = b'0';
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");

    // Checksum is computed with the checksum field blanked to spaces.
    let sum: u64 = block.iter().map(|b| *b as u64).sum();
    block[148..154].copy_from_slice(format!("{sum:06o}").as_bytes());
    block[154] = 0;
    block[155] = b' ';
    block
}
