//! Fuse adapter presenting the archive corpus as a read-only file-system.
//!
//! The kernel addresses objects by inode number while resolution works on
//! whole paths, so the adapter keeps a bidirectional inode ↔ path interning
//! table populated by `lookup` and `readdir`. Everything else is a direct
//! translation of kernel callbacks into resolver calls.
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::Result;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEntry, ReplyOpen, Request,
};
use libc::{EINVAL, ENAMETOOLONG, ENOENT};
use tracing::warn;

use crate::resolver::{FileKind, FsError, FsStat, Resolver};

/// Maximum permitted length of a name.
const MAX_NAME_LENGTH: u32 = 255;

/// Time to retain lookups for.
/// Larger values result in faster file-system performance.
/// Default value is 1 second, consistent with libfuse.
const TTL: Duration = Duration::new(1, 0);

/// Bidirectional inode ↔ path interning table. Inode 1 is the root.
struct InodeTable {
    paths: HashMap<u64, String>,
    inos: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> InodeTable {
        let mut table = InodeTable {
            paths: HashMap::new(),
            inos: HashMap::new(),
            next: 2,
        };
        table.paths.insert(1, "/".to_string());
        table.inos.insert("/".to_string(), 1);
        table
    }

    /// Path interned for an inode number, if any.
    fn path(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    /// Inode of `path`, assigning the next free number on first sight.
    fn intern(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.inos.get(path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.inos.insert(path.to_string(), ino);
        self.paths.insert(ino, path.to_string());
        ino
    }
}

/// Join a parent path and a child name.
fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Parent of a path: `/v3/uniprot` → `/v3`.
fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(p) => &path[..p],
    }
}

/// FUSE file-system over the archive corpus.
struct AlphaFoldFs {
    resolver: Resolver,
    inodes: InodeTable,

    /// Owner reported on every object.
    uid: u32,
    gid: u32,

    /// The next available file handle.
    next_file_handle: u64,
}

impl AlphaFoldFs {
    fn new(resolver: Resolver) -> AlphaFoldFs {
        AlphaFoldFs {
            resolver,
            inodes: InodeTable::new(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            next_file_handle: 1,
        }
    }

    /// Map resolver attributes onto FUSE attributes.
    fn to_attr(&self, ino: u64, stat: &FsStat) -> FileAttr {
        let mtime = UNIX_EPOCH + Duration::from_secs(stat.mtime.max(0) as u64);
        FileAttr {
            ino,
            size: stat.size,
            blocks: stat.size / 4096,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: to_file_type(stat.kind),
            perm: stat.perm,
            nlink: stat.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            flags: 0, // MacOS only
            blksize: 4096,
        }
    }
}

/// Map from resolver FileKind to FUSE FileType.
fn to_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::RegularFile => FileType::RegularFile,
    }
}

impl Filesystem for AlphaFoldFs {
    /// Lookup a child with given name in the parent directory.
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        // Enforce name length.
        if name.len() > MAX_NAME_LENGTH as usize {
            reply.error(ENAMETOOLONG);
            return;
        }

        // Ensure that name is a valid string.
        let name = match name.to_str() {
            Some(s) => s,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let parent = match self.inodes.path(parent) {
            Some(p) => p.to_string(),
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let path = child_path(&parent, name);
        match self.resolver.getattr(&path) {
            Ok(stat) => {
                let ino = self.inodes.intern(&path);
                reply.entry(&TTL, &self.to_attr(ino, &stat), 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    /// Get the attributes of a given inode.
    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let path = match self.inodes.path(ino) {
            Some(p) => p.to_string(),
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.resolver.getattr(&path) {
            Ok(stat) => reply.attr(&TTL, &self.to_attr(ino, &stat)),
            Err(err) => reply.error(err.errno()),
        }
    }

    /// Read the contents of a given directory.
    ///
    /// Entries may not fit a single readdir call. Each entry is submitted
    /// with its position in the virtual list (`.` = 1, `..` = 2, children
    /// from 3); the kernel calls back with the position to resume after.
    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.inodes.path(ino) {
            Some(p) => p.to_string(),
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let entries = match self.resolver.readdir(&path) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };

        // Populate `.` and `..`.
        if offset < 1 && reply.add(ino, 1, FileType::Directory, ".") {
            reply.ok();
            return;
        }
        if offset < 2 {
            let parent_ino = self.inodes.intern(parent_path(&path));
            if reply.add(parent_ino, 2, FileType::Directory, "..") {
                reply.ok();
                return;
            }
        }

        for (i, entry) in entries.enumerate() {
            let position = i as i64 + 3;
            if position <= offset {
                continue;
            }
            let child = child_path(&path, &entry.name);
            let child_ino = self.inodes.intern(&child);
            // Failure indicates that the buffer is full.
            if reply.add(child_ino, position, to_file_type(entry.kind), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    /// Open a given inode. Only read-only access is permitted.
    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.inodes.path(ino) {
            Some(p) => p.to_string(),
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.resolver.open(&path, flags) {
            Ok(()) => {
                reply.opened(self.next_file_handle, 0);
                self.next_file_handle += 1;
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    /// Read bytes from a given inode.
    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.inodes.path(ino) {
            Some(p) => p.to_string(),
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.resolver.read(&path, size, offset as u64) {
            Ok(bytes) => reply.data(&bytes),
            Err(err) => {
                if let FsError::Io(ref cause) = err {
                    warn!(path = %path, error = %cause, "read failed");
                }
                reply.error(err.errno());
            }
        }
    }
}

/// Mount the archive file-system.
///
/// # Arguments
/// * `alphafold_dir` - Root directory containing version subdirectories of
///   `.tar` archives.
/// * `sqlpath` - Path of the SQLite index file.
/// * `mount_point` - The directory to mount to.
pub fn mount(alphafold_dir: &str, sqlpath: &str, mount_point: &str) -> Result<()> {
    let options = vec![
        MountOption::FSName("alphafold-fs".to_string()),
        // Enable permission checking in the kernel.
        MountOption::DefaultPermissions,
        // Read-only.
        MountOption::RO,
        // Don't update inode access time.
        MountOption::NoAtime,
        // Async io.
        MountOption::Async,
    ];

    let resolver = Resolver::new(Path::new(alphafold_dir), Path::new(sqlpath))?;
    let fs = AlphaFoldFs::new(resolver);
    fuser::mount2(fs, mount_point, &options)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_interning_is_stable() {
        let mut table = InodeTable::new();
        assert_eq!(table.path(1), Some("/"));

        let a = table.intern("/v3");
        let b = table.intern("/v3/uniprot");
        assert_ne!(a, b);
        assert_eq!(table.intern("/v3"), a);
        assert_eq!(table.path(a), Some("/v3"));
        assert_eq!(table.path(999), None);
    }

    #[test]
    fn path_arithmetic() {
        assert_eq!(child_path("/", "v3"), "/v3");
        assert_eq!(child_path("/v3", "uniprot"), "/v3/uniprot");
        assert_eq!(parent_path("/v3/uniprot"), "/v3");
        assert_eq!(parent_path("/v3"), "/");
        assert_eq!(parent_path("/"), "/");
    }
}
