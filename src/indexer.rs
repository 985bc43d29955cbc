//! Build the SQLite structure index from the archive tree.
//!
//! Archives are walked in parallel without extracting anything; each
//! matching member contributes one `files` row pinning its archive, header
//! offset, compressed size, uncompressed size and mtime. Cross-reference
//! tables come from the UniProt ID-mapping dataset. Every table is built as
//! `<name>_tmp` and swapped into place so a serving resolver never observes
//! partial state.
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Args;
use flate2::read::GzDecoder;
use rayon::prelude::*;
use rusqlite::{params, Connection};
use tracing::info;

use crate::tar::Scanner;

/// Compressed payloads up to this size have their uncompressed size read
/// from the gzip ISIZE trailer; anything bigger is decompressed and
/// measured, since ISIZE is only the size modulo 2^32.
const ISIZE_TRUST_LIMIT: u64 = 4 * 1024 * 1024;

const IDMAPPING_FILE: &str = "idmapping_selected.tab.gz";
const IDMAPPING_URL: &str = "https://ftp.uniprot.org/pub/databases/uniprot/current_release/knowledgebase/idmapping/idmapping_selected.tab.gz";

/// Options for the `index` subcommand.
#[derive(Args)]
pub struct IndexOptions {
    /// Where the source AlphaFold proteomes folder is.
    #[clap(short = 'a', long = "alphafold-path", default_value = "/extra/alphafold/")]
    pub alphafold_path: String,

    /// Where to store the sqlite file.
    #[clap(short = 's', long = "sql-file", default_value = "alphafold.sqlite")]
    pub sql_file: String,

    /// Force re-download of the ID-mapping source before processing.
    #[clap(short = 'd', long = "download")]
    pub download: bool,

    /// Don't reload the PDB/taxonomy ID mapping data.
    #[clap(long = "no-pdb")]
    pub no_pdb: bool,

    /// Don't reload the entry location data.
    #[clap(long = "no-entry")]
    pub no_entry: bool,
}

/// One indexed structure member.
struct Entry {
    relpath: String,
    version: i64,
    uniprot_id: String,
    offset: u64,
    size: u64,
    expanded_size: u64,
    modification_time: u64,
}

/// Run the indexer with the given options.
pub fn run(options: &IndexOptions) -> Result<()> {
    if options.no_entry && options.no_pdb {
        bail!("you have asked to do nothing: specify one or neither of --no-entry and --no-pdb");
    }

    let mut conn = Connection::open(&options.sql_file)
        .with_context(|| format!("opening {}", options.sql_file))?;

    if !options.no_entry {
        rebuild_entries(&mut conn, Path::new(&options.alphafold_path))?;
    }
    if !options.no_pdb {
        rebuild_mappings(&mut conn, options.download)?;
    }

    info!("done");
    Ok(())
}

/// Rebuild the `files` and `versions` tables from the archive tree.
fn rebuild_entries(conn: &mut Connection, root: &Path) -> Result<()> {
    let archives = find_archives(root)?;
    info!(archives = archives.len(), "scanning archives");

    let entries: Vec<Vec<Entry>> = archives
        .par_iter()
        .map(|(relpath, full_path)| scan_archive(relpath, full_path))
        .collect::<Result<_>>()?;

    let tx = conn.transaction()?;
    tx.execute("DROP TABLE IF EXISTS files_tmp", [])?;
    tx.execute(
        "CREATE TABLE files_tmp (relpath text, version int, uniprot_id text, \
         offset numeric, size numeric, expanded_size numeric, \
         modification_time numeric, \
         PRIMARY KEY(uniprot_id, version)) WITHOUT ROWID",
        [],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO files_tmp(relpath, version, uniprot_id, \
             offset, size, expanded_size, modification_time) \
             VALUES (?,?,?,?,?,?,?)",
        )?;
        for entry in entries.iter().flatten() {
            stmt.execute(params![
                entry.relpath,
                entry.version,
                entry.uniprot_id,
                entry.offset as i64,
                entry.size as i64,
                entry.expanded_size as i64,
                entry.modification_time as i64,
            ])?;
        }
    }
    tx.commit()?;

    info!("building substring index on UniProt");
    conn.execute_batch(
        "DROP INDEX IF EXISTS uniprot_substr;
         CREATE INDEX uniprot_substr ON files_tmp(substr(uniprot_id, -3, 2));
         DROP TABLE IF EXISTS files;
         ALTER TABLE files_tmp RENAME TO files;",
    )?;

    info!("preparing versions table");
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS versions (version int);
         DELETE FROM versions;
         INSERT INTO versions (version) SELECT DISTINCT(version) FROM files;",
    )?;
    Ok(())
}

/// Archives below `root`: one layer of version subdirectories, each holding
/// `.tar` files. Returned as (path relative to root, absolute path).
fn find_archives(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut archives = Vec::new();
    for version_dir in
        fs::read_dir(root).with_context(|| format!("reading {}", root.display()))?
    {
        let version_dir = version_dir?;
        if !version_dir.file_type()?.is_dir() {
            continue;
        }
        for tar in fs::read_dir(version_dir.path())? {
            let tar = tar?;
            let path = tar.path();
            if path.extension().map_or(false, |ext| ext == "tar") {
                let relpath = format!(
                    "{}/{}",
                    version_dir.file_name().to_string_lossy(),
                    tar.file_name().to_string_lossy()
                );
                archives.push((relpath, path));
            }
        }
    }
    Ok(archives)
}

/// Index the structure members of one archive.
fn scan_archive(relpath: &str, full_path: &Path) -> Result<Vec<Entry>> {
    info!(relpath, "processing");

    let mut scanner = Scanner::new(full_path)?;
    // Separate handle for size probes so the sequential walk keeps its
    // buffer.
    let mut raw = File::open(full_path)?;

    let mut entries = Vec::new();
    while let Some(member) = scanner.next_member()? {
        let (uniprot_id, version) = match parse_member_name(&member.name) {
            Some(parsed) => parsed,
            None => continue,
        };
        let expanded_size = expanded_size(&mut raw, member.offset, member.size)
            .with_context(|| format!("sizing {} in {}", member.name, relpath))?;
        entries.push(Entry {
            relpath: relpath.to_string(),
            version,
            uniprot_id,
            offset: member.offset,
            size: member.size,
            expanded_size,
            modification_time: member.mtime,
        });
    }
    Ok(entries)
}

/// Parse a predicted-structure member name,
/// `AF-<UNIPROT>-F1-model_v<V>.cif.gz`, into its UniProt ID and version.
fn parse_member_name(name: &str) -> Option<(String, i64)> {
    let base = name.rsplit('/').next().unwrap_or(name);
    let stem = base.strip_suffix(".cif.gz")?;

    let mut parts = stem.split('-');
    if parts.next()? != "AF" {
        return None;
    }
    let uniprot_id = parts.next()?;
    if parts.next()? != "F1" {
        return None;
    }
    let version = parts.next()?.strip_prefix("model_v")?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((uniprot_id.to_string(), version))
}

/// Uncompressed size of the gzip payload at `offset + 512`.
fn expanded_size(raw: &mut File, offset: u64, size: u64) -> Result<u64> {
    if size > ISIZE_TRUST_LIMIT || size < 4 {
        // Decompress and measure.
        raw.seek(SeekFrom::Start(offset + 512))?;
        let mut compressed = vec![0u8; size as usize];
        raw.read_exact(&mut compressed)?;

        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut buf = [0u8; 64 * 1024];
        let mut total: u64 = 0;
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            total += n as u64;
        }
        Ok(total)
    } else {
        // ISIZE trailer: last four bytes of the payload, little-endian.
        raw.seek(SeekFrom::Start(offset + 512 + size - 4))?;
        let mut isize_bytes = [0u8; 4];
        raw.read_exact(&mut isize_bytes)?;
        Ok(u32::from_le_bytes(isize_bytes) as u64)
    }
}

/// Rebuild the PDB and taxonomy cross-reference tables from the UniProt
/// ID-mapping dataset.
fn rebuild_mappings(conn: &mut Connection, download: bool) -> Result<()> {
    let mapping = ensure_idmapping(download)?;

    info!("building cross-reference tables");
    conn.execute_batch(
        "DROP TABLE IF EXISTS pdb_tmp;
         CREATE TABLE pdb_tmp (uniprot_id text, pdb_id text, \
             PRIMARY KEY (uniprot_id, pdb_id)) WITHOUT ROWID;
         DROP TABLE IF EXISTS taxonomy_tmp;
         CREATE TABLE taxonomy_tmp (uniprot_id text, taxonomy_id text, \
             PRIMARY KEY (uniprot_id, taxonomy_id)) WITHOUT ROWID;",
    )?;
    insert_mappings(conn, &mapping)?;

    info!("building cross-reference indices");
    conn.execute_batch(
        "DROP INDEX IF EXISTS pdb_index;
         CREATE INDEX pdb_index ON pdb_tmp(pdb_id);
         DROP INDEX IF EXISTS pdb_substr;
         CREATE INDEX pdb_substr ON pdb_tmp(substr(pdb_id, -3, 2));
         DROP INDEX IF EXISTS pdb_2level;
         CREATE INDEX pdb_2level ON pdb_tmp(substr(pdb_id, -3, 1));
         DROP INDEX IF EXISTS taxon_index;
         CREATE INDEX taxon_index ON taxonomy_tmp(taxonomy_id);
         DROP TABLE IF EXISTS taxonomy_unique_tmp;
         CREATE TABLE taxonomy_unique_tmp(taxonomy_id text PRIMARY KEY) WITHOUT ROWID;
         INSERT INTO taxonomy_unique_tmp(taxonomy_id) \
             SELECT DISTINCT(taxonomy_id) FROM taxonomy_tmp;
         DROP INDEX IF EXISTS taxon_substr;
         CREATE INDEX taxon_substr ON taxonomy_unique_tmp(substr(taxonomy_id, -3, 2));",
    )?;

    info!("moving tables into position");
    conn.execute_batch(
        "DROP TABLE IF EXISTS pdb;
         ALTER TABLE pdb_tmp RENAME TO pdb;
         DROP TABLE IF EXISTS taxonomy;
         ALTER TABLE taxonomy_tmp RENAME TO taxonomy;
         DROP TABLE IF EXISTS taxonomy_unique;
         ALTER TABLE taxonomy_unique_tmp RENAME TO taxonomy_unique;",
    )?;
    Ok(())
}

/// Local ID-mapping snapshot, downloaded only when forced or absent.
fn ensure_idmapping(download: bool) -> Result<PathBuf> {
    let path = PathBuf::from(IDMAPPING_FILE);
    if path.exists() && !download {
        return Ok(path);
    }

    info!(url = IDMAPPING_URL, "downloading UniProt id-mapping file");
    // -z redownloads only if the server copy is newer than the local one.
    let status = Command::new("curl")
        .args(["-z", IDMAPPING_FILE, "-o", IDMAPPING_FILE, IDMAPPING_URL])
        .status()
        .context("failed to run curl")?;
    if !status.success() {
        bail!("curl exited with {status}");
    }
    Ok(path)
}

/// Stream the tab-separated ID-mapping file into both `*_tmp` mapping
/// tables. Column 0 is the UniProt ID, column 5 the `; `-separated
/// `CODE:chain` PDB references, column 12 the taxonomy ID.
fn insert_mappings(conn: &mut Connection, mapping: &Path) -> Result<()> {
    let file = File::open(mapping)
        .with_context(|| format!("opening {}", mapping.display()))?;
    let reader = BufReader::new(GzDecoder::new(file));

    let tx = conn.transaction()?;
    {
        let mut pdb_stmt =
            tx.prepare("INSERT OR IGNORE INTO pdb_tmp(uniprot_id, pdb_id) VALUES (?,?)")?;
        let mut taxonomy_stmt = tx
            .prepare("INSERT OR IGNORE INTO taxonomy_tmp(uniprot_id, taxonomy_id) VALUES (?,?)")?;

        for line in reader.lines() {
            let line = line?;
            let fields: Vec<&str> = line.split('\t').collect();
            let uniprot_id = match fields.first() {
                Some(id) if !id.is_empty() => *id,
                _ => continue,
            };

            if let Some(refs) = fields.get(5) {
                // Several chains of one structure map to the same code.
                let pdb_ids: BTreeSet<&str> = refs
                    .split("; ")
                    .filter_map(|r| r.split(':').next())
                    .filter(|id| !id.is_empty())
                    .collect();
                for pdb_id in pdb_ids {
                    pdb_stmt.execute(params![uniprot_id, pdb_id])?;
                }
            }

            if let Some(taxonomy_id) = fields.get(12) {
                if !taxonomy_id.is_empty() {
                    taxonomy_stmt.execute(params![uniprot_id, taxonomy_id])?;
                }
            }
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use rusqlite::Connection;
    use std::io::Write;

    #[test]
    fn member_name_forms() {
        assert_eq!(
            parse_member_name("AF-A0A1Q1MKJ4-F1-model_v3.cif.gz"),
            Some(("A0A1Q1MKJ4".to_string(), 3))
        );
        assert_eq!(
            parse_member_name("prefix/AF-P12345-F1-model_v4.cif.gz"),
            Some(("P12345".to_string(), 4))
        );
        // Non-structure members and other fragments are skipped.
        assert_eq!(parse_member_name("AF-P12345-F2-model_v3.cif.gz"), None);
        assert_eq!(parse_member_name("AF-P12345-F1-model_v3.pdb.gz"), None);
        assert_eq!(parse_member_name("README.txt"), None);
        assert_eq!(parse_member_name("AF-P12345-F1-model_vX.cif.gz"), None);
    }

    #[test]
    fn isize_trailer_is_exact_for_small_members() {
        let payload = b"data_TEST\nloop_ atoms go here\n".repeat(40);
        let member = testutil::gzip(&payload);
        let archive = testutil::tar_archive(&[testutil::member(
            "AF-P12345-F1-model_v3.cif.gz",
            &member,
            1000,
        )]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk.tar");
        fs::write(&path, archive).unwrap();

        let mut raw = File::open(&path).unwrap();
        assert_eq!(
            expanded_size(&mut raw, 0, member.len() as u64).unwrap(),
            payload.len() as u64
        );
    }

    #[test]
    fn entry_rebuild_publishes_files_and_versions() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("alphafold");

        let member_a = testutil::gzip(b"structure A");
        let member_b = testutil::gzip(b"structure B, somewhat longer");
        let archive = testutil::tar_archive(&[
            testutil::member("AF-A0A1Q1MKJ4-F1-model_v3.cif.gz", &member_a, 1111),
            testutil::member("notes.txt", b"not a structure", 1112),
            testutil::member("AF-Q67890-F1-model_v3.cif.gz", &member_b, 2222),
        ]);
        fs::create_dir_all(root.join("v3")).unwrap();
        fs::write(root.join("v3/chunk-0.tar"), archive).unwrap();

        let mut conn = Connection::open(dir.path().join("index.sqlite")).unwrap();
        rebuild_entries(&mut conn, &root).unwrap();

        let versions: Vec<i64> = conn
            .prepare("SELECT version FROM versions")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(versions, vec![3]);

        let (relpath, offset, size, expanded, mtime): (String, i64, i64, i64, i64) = conn
            .query_row(
                "SELECT relpath, offset, size, expanded_size, modification_time \
                 FROM files WHERE uniprot_id = 'Q67890'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .unwrap();
        assert_eq!(relpath, "v3/chunk-0.tar");
        assert_eq!(size, member_b.len() as i64);
        assert_eq!(expanded, b"structure B, somewhat longer".len() as i64);
        assert_eq!(mtime, 2222);
        // Third member: two headers and two rounded payloads precede it.
        let rounded = |n: usize| ((n + 511) / 512 * 512) as i64;
        assert_eq!(
            offset,
            512 + rounded(member_a.len()) + 512 + rounded(15)
        );
        // No temporary table is left behind.
        assert!(conn
            .query_row("SELECT 1 FROM sqlite_master WHERE name = 'files_tmp'", [], |_| Ok(()))
            .is_err());
    }

    #[test]
    fn mapping_ingest_dedups_and_splits_columns() {
        let dir = tempfile::tempdir().unwrap();

        // Thirteen tab-separated columns, PDB refs in column 5, taxonomy in
        // column 12.
        let mut line_a = vec![""; 13];
        line_a[0] = "A0A1Q1MKJ4";
        line_a[5] = "2DOG:A; 2DOG:B; 1ABC:A";
        line_a[12] = "9606";
        let mut line_b = vec![""; 13];
        line_b[0] = "Q67890";
        line_b[12] = "10090";
        let text = format!("{}\n{}\n", line_a.join("\t"), line_b.join("\t"));

        let mapping = dir.path().join(IDMAPPING_FILE);
        let mut writer = flate2::write::GzEncoder::new(
            File::create(&mapping).unwrap(),
            flate2::Compression::default(),
        );
        writer.write_all(text.as_bytes()).unwrap();
        writer.finish().unwrap();

        let mut conn = Connection::open(dir.path().join("index.sqlite")).unwrap();
        conn.execute_batch(
            "CREATE TABLE pdb_tmp (uniprot_id text, pdb_id text, \
                 PRIMARY KEY (uniprot_id, pdb_id)) WITHOUT ROWID;
             CREATE TABLE taxonomy_tmp (uniprot_id text, taxonomy_id text, \
                 PRIMARY KEY (uniprot_id, taxonomy_id)) WITHOUT ROWID;",
        )
        .unwrap();
        insert_mappings(&mut conn, &mapping).unwrap();

        let pdb: Vec<(String, String)> = conn
            .prepare("SELECT uniprot_id, pdb_id FROM pdb_tmp ORDER BY pdb_id")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(
            pdb,
            vec![
                ("A0A1Q1MKJ4".to_string(), "1ABC".to_string()),
                ("A0A1Q1MKJ4".to_string(), "2DOG".to_string()),
            ]
        );

        let taxonomy: Vec<(String, String)> = conn
            .prepare("SELECT uniprot_id, taxonomy_id FROM taxonomy_tmp ORDER BY taxonomy_id")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(
            taxonomy,
            vec![
                ("Q67890".to_string(), "10090".to_string()),
                ("A0A1Q1MKJ4".to_string(), "9606".to_string()),
            ]
        );
    }
}
