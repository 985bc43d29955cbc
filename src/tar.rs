//! Offset-accurate walk over the members of a POSIX tar archive.
//!
//! The indexer needs each member's header offset, payload size and
//! modification time without extracting anything, so headers are read block
//! by block and payloads are skipped. See
//! [Tar Format](https://www.ibm.com/docs/en/zos/2.1.0?topic=formats-tar-format-tar-archives)
//! for a description of each header field.
use std::fs::File;
use std::io::{BufReader, Read};
use std::mem;
use std::path::Path;
use std::slice;
use std::str;

use anyhow::{anyhow, Context, Result};

/// Tar header binary compatible with the Posix specification.
/// See [UStar format](https://en.wikipedia.org/wiki/Tar_(computing)#UStar_format)
#[repr(C)]
#[derive(Debug)]
struct PosixHeader {
    /// File name. Maximum 100 characters. Null terminated.
    name: [u8; 100],

    /// File mode (octal).
    mode: [u8; 8],

    /// Owner user ID (octal).
    uid: [u8; 8],

    /// Owner group ID (octal).
    gid: [u8; 8],

    /// File size in bytes (octal).
    size: [u8; 12],

    /// Last modification time in Unix time format (octal).
    mtime: [u8; 12],

    /// Checksum of all the bytes in the header. Ignored.
    chksum: [u8; 8],

    /// Type of the file. '0' or NUL for regular files; 'L' marks a GNU
    /// long-name record whose payload names the following member.
    typeflag: u8,

    /// Target of a link. Maximum 100 characters.
    linkname: [u8; 100],

    /// Format indicator. E.g USTAR. Null terminated.
    magic: [u8; 6],

    /// Format version number.
    version: [u8; 2],

    /// Owner user name. Maximum 32 characters. Null terminated.
    uname: [u8; 32],

    /// Owner group name. Maximum 32 characters. Null terminated.
    gname: [u8; 32],

    /// Device major number. Octal.
    devmajor: [u8; 8],

    /// Device minor number. Octal.
    devminor: [u8; 8],

    /// Filename prefix. 155 characters. Thus allowing maximum 255
    /// character long names.
    prefix: [u8; 155],

    /// Padding for 512 byte alignment.
    padding: [u8; 12],
}

/// Parse ascii octal number.
/// Leading blanks are skipped; a null or blank ends the number.
fn ascii_octal_to_u64(buf: &[u8]) -> Result<u64> {
    let mut n: u64 = 0;
    let mut seen_digit = false;

    for c in buf {
        match *c {
            b'0'..=b'7' => {
                n = n * 8 + (*c - b'0') as u64;
                seen_digit = true;
            }
            b' ' if !seen_digit => continue,
            b' ' | 0 => break,
            _ => return Err(anyhow!("illegal octal character {0}", c)),
        }
    }
    Ok(n)
}

#[doc(hidden)]
/// Extend one tar string with another.
fn extend(dest: &mut Vec<u8>, src: &[u8]) {
    for ch in src.iter() {
        if *ch != 0 {
            dest.push(*ch);
        } else {
            break;
        }
    }
}

/// Location of one regular-file member within its archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member path as stored in the archive.
    pub name: String,

    /// Byte offset of the member's 512-byte header. The payload starts at
    /// `offset + 512`.
    pub offset: u64,

    /// Payload size in bytes.
    pub size: u64,

    /// Modification time, seconds since epoch.
    pub mtime: u64,
}

/// Walks a tar file once, in order, yielding regular-file members.
pub struct Scanner {
    /// Tar file reader with buffering.
    reader: BufReader<File>,

    /// Current Posix tar header.
    header: PosixHeader,

    /// Current offset within the tar file.
    offset: u64,

    /// Name carried by a preceding GNU long-name record, if any.
    long_name: Option<String>,
}

impl Scanner {
    /// Create a new Scanner over the archive at `path`.
    pub fn new(path: &Path) -> Result<Scanner> {
        let file = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        Ok(Scanner {
            reader: BufReader::new(file),
            // Use unsafe to zero-initialize since Default trait is not
            // automatically implemented for arrays longer than 32 elements.
            header: unsafe { mem::zeroed() },
            offset: 0,
            long_name: None,
        })
    }

    /// Advance to the next regular-file member and return its location, or
    /// `None` at the end of the archive.
    pub fn next_member(&mut self) -> Result<Option<Member>> {
        let header_size = mem::size_of::<PosixHeader>();

        loop {
            let header_offset = self.offset;

            // Read the next header block.
            unsafe {
                let raw_ptr = &mut self.header as *mut _ as *mut u8;
                let block = slice::from_raw_parts_mut(raw_ptr, header_size);
                if self.reader.read_exact(block).is_err() {
                    return Ok(None);
                }
            }
            self.offset += 512;

            // Parse the payload size and round it up to a multiple of 512.
            let size = ascii_octal_to_u64(&self.header.size)?;
            let rsize = (size + 512 - 1) / 512 * 512;

            match self.header.typeflag {
                // Regular file, POSIX or old-style.
                flag if flag == b'0' || (flag == 0 && self.header.name[0] != 0) => {
                    let name = match self.long_name.take() {
                        Some(name) => name,
                        None => self.full_name()?,
                    };
                    let mtime = ascii_octal_to_u64(&self.header.mtime)?;
                    self.skip(rsize)?;
                    return Ok(Some(Member {
                        name,
                        offset: header_offset,
                        size,
                        mtime,
                    }));
                }

                // GNU long name: the payload names the following member.
                b'L' => {
                    let mut buf = vec![0u8; rsize as usize];
                    self.reader.read_exact(&mut buf)?;
                    self.offset += rsize;
                    let name = str::from_utf8(&buf[0..size as usize])?
                        .trim_end_matches('\0')
                        .to_string();
                    self.long_name = Some(name);
                }

                // End-of-archive padding.
                0 => continue,

                // Anything else (directories, links, pax records) is
                // skipped; a pending long name applies only to the very
                // next member.
                _ => {
                    self.long_name = None;
                    self.skip(rsize)?;
                }
            }
        }
    }

    /// Skip past the current member's payload without draining the buffer.
    fn skip(&mut self, rsize: u64) -> Result<()> {
        self.reader.seek_relative(rsize as i64)?;
        self.offset += rsize;
        Ok(())
    }

    /// Member name from the header, prefix included.
    fn full_name(&self) -> Result<String> {
        let mut buf = Vec::new();
        if self.header.prefix[0] != 0 {
            extend(&mut buf, &self.header.prefix);
            buf.push(b'/');
        }
        extend(&mut buf, &self.header.name);
        Ok(str::from_utf8(&buf)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use std::fs;

    #[test]
    fn octal_parsing() {
        assert_eq!(ascii_octal_to_u64(b"0000644\0").unwrap(), 0o644);
        assert_eq!(ascii_octal_to_u64(b"00000001234\0").unwrap(), 0o1234);
        assert_eq!(ascii_octal_to_u64(b"  644 \0").unwrap(), 0o644);
        assert_eq!(ascii_octal_to_u64(b"\0\0\0").unwrap(), 0);
        assert!(ascii_octal_to_u64(b"12x4").is_err());
    }

    #[test]
    fn members_with_offsets() {
        let first = vec![1u8; 700];
        let second = vec![2u8; 100];
        let archive = testutil::tar_archive(&[
            testutil::member("AF-P12345-F1-model_v3.cif.gz", &first, 1000),
            testutil::member("AF-Q67890-F1-model_v3.cif.gz", &second, 2000),
        ]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk.tar");
        fs::write(&path, archive).unwrap();

        let mut scanner = Scanner::new(&path).unwrap();
        let a = scanner.next_member().unwrap().unwrap();
        assert_eq!(a.name, "AF-P12345-F1-model_v3.cif.gz");
        assert_eq!(a.offset, 0);
        assert_eq!(a.size, 700);
        assert_eq!(a.mtime, 1000);

        // 700 bytes of payload round up to 1024; the next header follows.
        let b = scanner.next_member().unwrap().unwrap();
        assert_eq!(b.name, "AF-Q67890-F1-model_v3.cif.gz");
        assert_eq!(b.offset, 512 + 1024);
        assert_eq!(b.size, 100);
        assert_eq!(b.mtime, 2000);

        assert!(scanner.next_member().unwrap().is_none());
    }

    #[test]
    fn empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tar");
        fs::write(&path, vec![0u8; 1024]).unwrap();

        let mut scanner = Scanner::new(&path).unwrap();
        assert!(scanner.next_member().unwrap().is_none());
    }
}
