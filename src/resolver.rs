//! Maps virtual paths onto the structure index and the backing archives.
//!
//! Below the mount root, each dataset version exposes three axes:
//!
//! ```text
//! /<version>/uniprot/<A>/<B>/<UNIPROT_ID>_v<V>.cif
//! /<version>/pdb/<A>/<B>/<PDB_ID>/<UNIPROT_ID>_v<V>.cif
//! /<version>/taxonomy/<A>/<B>/<TAXONOMY_ID>/<UNIPROT_ID>_v<V>.cif
//! ```
//!
//! `<A>` and `<B>` shard listings by the last three characters of an
//! identifier excluding its final one, always in agreement with SQL
//! `substr(id, -3, 2)`. The bucketed form and the flat form
//! (`/<version>/pdb/<PDB_ID>/…`, `/<version>/taxonomy/<TAXONOMY_ID>/…`)
//! name the same member sets. Everything below a version root is filtered
//! by `files.version <= version`.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;
use tracing::debug;

use crate::db::{Db, FileInfo};
use crate::reader::{slice_at, ArchiveReader};

/// Upper-case alphanumeric shard characters used by uniprot and pdb.
const ALPHANUMERIC: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Taxonomy IDs are decimal with no leading zero.
const NUMERIC: &str = "123456789";

/// Error kinds surfaced to the kernel adapter.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// The errno magnitude reported to the kernel.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EACCES,
            FsError::Io(_) => libc::EIO,
        }
    }
}

impl From<rusqlite::Error> for FsError {
    fn from(err: rusqlite::Error) -> FsError {
        match err {
            rusqlite::Error::QueryReturnedNoRows => FsError::NotFound,
            other => FsError::Io(std::io::Error::new(std::io::ErrorKind::Other, other)),
        }
    }
}

/// Kind of a synthesized filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
}

/// Attributes of a resolved path. Everything is read-only: directories are
/// `0o555`, files `0o444`.
#[derive(Debug, Clone)]
pub struct FsStat {
    pub kind: FileKind,
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
    pub mtime: i64,
}

impl FsStat {
    fn directory() -> FsStat {
        FsStat {
            kind: FileKind::Directory,
            size: 4096,
            perm: 0o555,
            nlink: 2,
            mtime: 0,
        }
    }

    fn file(size: u64, mtime: i64) -> FsStat {
        FsStat {
            kind: FileKind::RegularFile,
            size,
            perm: 0o444,
            nlink: 1,
            mtime,
        }
    }
}

/// One directory entry. Structure entries carry their version suffix so a
/// listing is directly openable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// Single-pass stream of directory entries.
pub struct DirEntries(std::vec::IntoIter<DirEntry>);

impl Iterator for DirEntries {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        self.0.next()
    }
}

impl From<Vec<DirEntry>> for DirEntries {
    fn from(entries: Vec<DirEntry>) -> DirEntries {
        DirEntries(entries.into_iter())
    }
}

/// Directory entries from a list of names.
fn dir_entries<I, S>(names: I) -> DirEntries
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names
        .into_iter()
        .map(|name| DirEntry {
            name: name.into(),
            kind: FileKind::Directory,
        })
        .collect::<Vec<_>>()
        .into()
}

/// Structure-file entries from `(uniprot_id, version)` pairs.
fn structure_entries(rows: Vec<(String, i64)>) -> DirEntries {
    rows.into_iter()
        .map(|(uniprot_id, version)| DirEntry {
            name: format!("{uniprot_id}_v{version}.cif"),
            kind: FileKind::RegularFile,
        })
        .collect::<Vec<_>>()
        .into()
}

/// The three semantic axes below a version root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Uniprot,
    Pdb,
    Taxonomy,
}

impl Axis {
    fn parse(name: &str) -> Option<Axis> {
        match name {
            "uniprot" => Some(Axis::Uniprot),
            "pdb" => Some(Axis::Pdb),
            "taxonomy" => Some(Axis::Taxonomy),
            _ => None,
        }
    }

    /// First-level shard characters listed below the axis directory.
    fn alphabet(self) -> &'static str {
        match self {
            Axis::Uniprot | Axis::Pdb => ALPHANUMERIC,
            Axis::Taxonomy => NUMERIC,
        }
    }
}

/// What a path denotes, independent of the operation applied to it.
enum Node {
    Directory,
    Structure(FileInfo),
    Readme,
}

/// Resolves virtual paths for the kernel adapter.
pub struct Resolver {
    db: Db,
    reader: ArchiveReader,

    /// Dataset versions present at mount time, oldest first.
    versions: Vec<i64>,

    /// Local file served as `/README.md`.
    readme: PathBuf,
}

impl Resolver {
    /// Open the index and prepare a resolver.
    ///
    /// # Arguments
    /// * `alphafold_dir` - Root directory containing version-named
    ///   subdirectories of archives.
    /// * `sqlpath` - Path of the SQLite index file.
    pub fn new(alphafold_dir: &Path, sqlpath: &Path) -> Result<Resolver, FsError> {
        let db = Db::open(sqlpath)?;
        let versions = db.versions()?;
        Ok(Resolver {
            db,
            reader: ArchiveReader::new(alphafold_dir.to_path_buf()),
            versions,
            readme: PathBuf::from("README.md"),
        })
    }

    /// Serve `/README.md` from the given local file instead of the default.
    pub fn with_readme(mut self, readme: PathBuf) -> Resolver {
        self.readme = readme;
        self
    }

    /// Attributes of the object at `path`.
    pub fn getattr(&self, path: &str) -> Result<FsStat, FsError> {
        debug!(path, "getattr");
        match self.resolve(path)? {
            Node::Directory => Ok(FsStat::directory()),
            Node::Structure(info) => {
                Ok(FsStat::file(info.expanded_size, info.modification_time))
            }
            Node::Readme => {
                let meta = fs::metadata(&self.readme)?;
                let mtime = meta
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                Ok(FsStat::file(meta.len(), mtime))
            }
        }
    }

    /// List the directory at `path` as a single-pass entry stream.
    pub fn readdir(&self, path: &str) -> Result<DirEntries, FsError> {
        debug!(path, "readdir");
        let comps = components(path);

        // Root: one directory per dataset version, plus the README.
        if comps.is_empty() {
            let mut entries: Vec<DirEntry> = self
                .versions
                .iter()
                .map(|v| DirEntry {
                    name: format!("v{v}"),
                    kind: FileKind::Directory,
                })
                .collect();
            entries.push(DirEntry {
                name: "README.md".to_string(),
                kind: FileKind::RegularFile,
            });
            return Ok(entries.into());
        }
        if comps[0] == "README.md" {
            return Err(FsError::NotFound);
        }

        let cap = self.version_cap(comps[0])?;
        let pc = &comps[1..];
        match pc.len() {
            0 => Ok(dir_entries(["uniprot", "pdb", "taxonomy"])),
            1 => {
                let axis = Axis::parse(pc[0]).ok_or(FsError::NotFound)?;
                Ok(dir_entries(axis.alphabet().chars().map(String::from)))
            }
            2 => {
                let axis = Axis::parse(pc[0]).ok_or(FsError::NotFound)?;
                if pc[1].len() == 1 {
                    // Second shard level. pdb only shows characters that
                    // actually co-occur with the first; the other axes
                    // repeat the full alphabet.
                    match axis {
                        Axis::Pdb => Ok(dir_entries(self.db.pdb_second_level(pc[1], cap)?)),
                        _ => Ok(dir_entries(axis.alphabet().chars().map(String::from))),
                    }
                } else {
                    // Flat shortcut: the ID itself, bypassing the shards.
                    match axis {
                        Axis::Taxonomy => {
                            Ok(structure_entries(self.db.uniprots_for_taxonomy(pc[1], cap)?))
                        }
                        Axis::Pdb => {
                            Ok(structure_entries(self.db.uniprots_for_pdb(pc[1], cap)?))
                        }
                        Axis::Uniprot => Err(FsError::NotFound),
                    }
                }
            }
            3 => {
                let axis = Axis::parse(pc[0]).ok_or(FsError::NotFound)?;
                if pc[1].len() != 1 {
                    return Err(FsError::NotFound);
                }
                let bucket = format!("{}{}", pc[1], pc[2]);
                match axis {
                    Axis::Uniprot => {
                        Ok(structure_entries(self.db.uniprots_by_bucket(&bucket, cap)?))
                    }
                    Axis::Taxonomy => {
                        Ok(dir_entries(self.db.taxonomies_by_bucket(&bucket, cap)?))
                    }
                    Axis::Pdb => Ok(dir_entries(self.db.pdbs_by_bucket(&bucket, cap)?)),
                }
            }
            4 => {
                let axis = Axis::parse(pc[0]).ok_or(FsError::NotFound)?;
                match axis {
                    Axis::Taxonomy => {
                        Ok(structure_entries(self.db.uniprots_for_taxonomy(pc[3], cap)?))
                    }
                    Axis::Pdb => {
                        Ok(structure_entries(self.db.uniprots_for_pdb(pc[3], cap)?))
                    }
                    Axis::Uniprot => Err(FsError::NotFound),
                }
            }
            _ => Err(FsError::NotFound),
        }
    }

    /// Gate an open call. Anything but read-only access is denied; the
    /// target must resolve.
    pub fn open(&self, path: &str, flags: i32) -> Result<(), FsError> {
        debug!(path, flags, "open");
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(FsError::PermissionDenied);
        }
        self.resolve(path).map(|_| ())
    }

    /// Read up to `size` bytes at `offset` of the file at `path`.
    pub fn read(&self, path: &str, size: u32, offset: u64) -> Result<Vec<u8>, FsError> {
        debug!(path, size, offset, "read");
        match self.resolve(path)? {
            Node::Structure(info) => self.reader.read(&info, size, offset),
            Node::Readme => {
                let bytes = fs::read(&self.readme)?;
                Ok(slice_at(&bytes, size as usize, offset as usize).to_vec())
            }
            Node::Directory => Err(FsError::NotFound),
        }
    }

    /// Resolve a path to the object it denotes.
    ///
    /// Dispatch is by component count below the version root, mirroring the
    /// published layout. Directory levels resolve structurally; file levels
    /// hit the index.
    fn resolve(&self, path: &str) -> Result<Node, FsError> {
        let comps = components(path);
        if comps.is_empty() {
            return Ok(Node::Directory);
        }
        if comps[0] == "README.md" {
            return if comps.len() == 1 {
                Ok(Node::Readme)
            } else {
                Err(FsError::NotFound)
            };
        }

        let cap = self.version_cap(comps[0])?;
        let pc = &comps[1..];
        match pc.len() {
            0 => Ok(Node::Directory),
            1 => {
                Axis::parse(pc[0]).ok_or(FsError::NotFound)?;
                Ok(Node::Directory)
            }
            2 => {
                let axis = Axis::parse(pc[0]).ok_or(FsError::NotFound)?;
                if pc[1].len() == 1 {
                    return Ok(Node::Directory);
                }
                match axis {
                    // /<v>/uniprot/<ID> is the file itself.
                    Axis::Uniprot => {
                        Ok(Node::Structure(self.db.file_info(pc[1], Some(cap))?))
                    }
                    // Flat ID directories for the cross-reference axes.
                    Axis::Pdb | Axis::Taxonomy => Ok(Node::Directory),
                }
            }
            3 => {
                let axis = Axis::parse(pc[0]).ok_or(FsError::NotFound)?;
                if pc[1].len() == 1 {
                    // /<v>/<axis>/<A>/<B> shard directory.
                    return Ok(Node::Directory);
                }
                match axis {
                    // Member file below a flat ID directory.
                    Axis::Pdb | Axis::Taxonomy => {
                        Ok(Node::Structure(self.db.file_info(pc[2], Some(cap))?))
                    }
                    Axis::Uniprot => Err(FsError::NotFound),
                }
            }
            4 => {
                let axis = Axis::parse(pc[0]).ok_or(FsError::NotFound)?;
                match axis {
                    // /<v>/uniprot/<A>/<B>/<ID> is the file itself.
                    Axis::Uniprot => {
                        Ok(Node::Structure(self.db.file_info(pc[3], Some(cap))?))
                    }
                    Axis::Pdb | Axis::Taxonomy => Ok(Node::Directory),
                }
            }
            5 => {
                let axis = Axis::parse(pc[0]).ok_or(FsError::NotFound)?;
                match axis {
                    Axis::Pdb | Axis::Taxonomy => {
                        Ok(Node::Structure(self.db.file_info(pc[4], Some(cap))?))
                    }
                    Axis::Uniprot => Err(FsError::NotFound),
                }
            }
            _ => Err(FsError::NotFound),
        }
    }

    /// Validate a version-root component (`v3`) against the mounted
    /// versions and return it as the version cap for everything below.
    fn version_cap(&self, comp: &str) -> Result<i64, FsError> {
        let digits = comp.strip_prefix('v').ok_or(FsError::NotFound)?;
        let version: i64 = digits.parse().map_err(|_| FsError::NotFound)?;
        if self.versions.contains(&version) {
            Ok(version)
        } else {
            Err(FsError::NotFound)
        }
    }
}

/// Non-empty components of a virtual path.
fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}
