//! Append-only segment files.
//!
//! A segment is an append-only file named `<fid>.dat` holding concatenated
//! encoded entries; unused tail bytes are zero. Segments are bounded by
//! `Options::segment_size` and become immutable once rotated away from
//! active. Writes go through one of two backends: standard positional file
//! I/O or a fixed-size memory mapping.

use std::fs::{File, OpenOptions};
use std::io::Cursor;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};
use memmap2::MmapMut;

use crate::config::RwMode;
use crate::entry::{Entry, ENTRY_HEADER_SIZE};
use crate::errdata;
use crate::error::{Error, Result};

enum Backend {
    FileIo(File),
    Mmap { map: MmapMut },
    Released,
}

/// The active (or recovering) segment file.
pub struct DataFile {
    pub file_id: u64,
    /// Next append position.
    pub write_off: u64,
    /// Bytes written so far.
    pub actual_size: u64,
    backend: Backend,
    path: PathBuf,
}

impl std::fmt::Debug for DataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFile")
            .field("file_id", &self.file_id)
            .field("write_off", &self.write_off)
            .field("actual_size", &self.actual_size)
            .field("path", &self.path)
            .finish()
    }
}

impl DataFile {
    /// Opens (creating if absent) the segment file for `file_id` in `dir`.
    pub fn open(dir: &Path, file_id: u64, segment_size: u64, mode: RwMode) -> Result<Self> {
        let path = data_file_path(dir, file_id);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let backend = match mode {
            RwMode::FileIo => Backend::FileIo(file),
            RwMode::Mmap => {
                // The mapping covers the whole segment, so the file is
                // grown to its fixed size up front (zero-filled).
                if file.metadata()?.len() < segment_size {
                    file.set_len(segment_size)?;
                }
                let map = unsafe { MmapMut::map_mut(&file)? };
                Backend::Mmap { map }
            }
        };

        Ok(Self {
            file_id,
            write_off: 0,
            actual_size: 0,
            backend,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `data` at the given offset.
    pub fn write_at(&mut self, data: &[u8], off: u64) -> Result<usize> {
        match &mut self.backend {
            Backend::FileIo(file) => {
                file.write_all_at(data, off)?;
                Ok(data.len())
            }
            Backend::Mmap { map } => {
                let end = off as usize + data.len();
                if end > map.len() {
                    return Err(errdata!(
                        "write past end of mapped segment: {end} > {}",
                        map.len()
                    ));
                }
                map[off as usize..end].copy_from_slice(data);
                Ok(data.len())
            }
            Backend::Released => Err(Error::Io("segment file already released".to_string())),
        }
    }

    /// Reads exactly `buf.len()` bytes from the given offset.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<()> {
        match &self.backend {
            Backend::FileIo(file) => {
                file.read_exact_at(buf, off)?;
                Ok(())
            }
            Backend::Mmap { map } => {
                let end = off as usize + buf.len();
                if end > map.len() {
                    return Err(errdata!("read past end of mapped segment"));
                }
                buf.copy_from_slice(&map[off as usize..end]);
                Ok(())
            }
            Backend::Released => Err(Error::Io("segment file already released".to_string())),
        }
    }

    /// Forces written data to disk.
    pub fn sync(&self) -> Result<()> {
        match &self.backend {
            Backend::FileIo(file) => Ok(file.sync_all()?),
            Backend::Mmap { map } => Ok(map.flush()?),
            Backend::Released => Ok(()),
        }
    }

    /// Flushes and drops the backing handle. The segment is immutable
    /// afterwards; rotation replaces the whole `DataFile`.
    pub fn release(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.backend, Backend::Released) {
            Backend::FileIo(file) => {
                file.sync_all()?;
            }
            Backend::Mmap { map } => {
                map.flush()?;
            }
            Backend::Released => {}
        }
        Ok(())
    }
}

/// Path of the segment file for `file_id`.
pub fn data_file_path(dir: &Path, file_id: u64) -> PathBuf {
    dir.join(format!("{file_id}.dat"))
}

/// Reads one entry back from a segment file at the given position. Used
/// to resolve values the in-memory index does not retain.
pub fn read_entry_at(dir: &Path, file_id: u64, pos: u64) -> Result<Entry> {
    let path = data_file_path(dir, file_id);
    let file = File::open(&path)?;

    let mut header = [0u8; ENTRY_HEADER_SIZE as usize];
    file.read_exact_at(&mut header, pos)?;

    // Size fields sit after crc, timestamp, tx_id and ttl.
    let mut sizes = Cursor::new(&header[24..36]);
    let bucket_size = sizes.read_u32::<BigEndian>()?;
    let key_size = sizes.read_u32::<BigEndian>()?;
    let value_size = sizes.read_u32::<BigEndian>()?;
    let total =
        ENTRY_HEADER_SIZE + u64::from(bucket_size) + u64::from(key_size) + u64::from(value_size);

    let mut buf = vec![0u8; total as usize];
    file.read_exact_at(&mut buf, pos)?;

    let (entry, _) = Entry::decode(&buf)?;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{DataStructure, Flag, MetaData, Status, PERSISTENT};
    use tempfile::TempDir;

    fn sample_entry() -> Entry {
        Entry::new(
            b"b".to_vec(),
            b"k".to_vec(),
            b"v".to_vec(),
            MetaData {
                timestamp: 1,
                ttl: PERSISTENT,
                flag: Flag::Set,
                ds: DataStructure::Tree,
                status: Status::Committed,
                tx_id: 7,
                bucket_size: 1,
                key_size: 1,
                value_size: 1,
            },
        )
    }

    #[test]
    fn test_write_and_read_file_io() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut df =
            DataFile::open(dir.path(), 0, 1024, RwMode::FileIo).expect("Failed to open segment");

        df.write_at(b"hello", 0).expect("Failed to write");
        df.write_at(b"world", 5).expect("Failed to write");
        df.sync().expect("Failed to sync");

        let mut buf = [0u8; 10];
        df.read_at(&mut buf, 0).expect("Failed to read");
        assert_eq!(&buf, b"helloworld");
    }

    #[test]
    fn test_write_and_read_mmap() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut df =
            DataFile::open(dir.path(), 0, 1024, RwMode::Mmap).expect("Failed to open segment");

        df.write_at(b"hello", 100).expect("Failed to write");
        df.sync().expect("Failed to sync");

        let mut buf = [0u8; 5];
        df.read_at(&mut buf, 100).expect("Failed to read");
        assert_eq!(&buf, b"hello");

        // The mapped file has its full fixed size, zero-filled.
        let len = std::fs::metadata(df.path()).expect("Failed to stat").len();
        assert_eq!(len, 1024);
    }

    #[test]
    fn test_mmap_write_is_bounded() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut df =
            DataFile::open(dir.path(), 0, 16, RwMode::Mmap).expect("Failed to open segment");

        assert!(df.write_at(&[0u8; 32], 0).is_err());
        assert!(df.write_at(b"x", 16).is_err());
    }

    #[test]
    fn test_release_rejects_writes() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut df =
            DataFile::open(dir.path(), 0, 1024, RwMode::FileIo).expect("Failed to open segment");

        df.write_at(b"data", 0).expect("Failed to write");
        df.release().expect("Failed to release");
        assert!(df.write_at(b"more", 4).is_err());
    }

    #[test]
    fn test_read_entry_at() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut df =
            DataFile::open(dir.path(), 3, 1024, RwMode::FileIo).expect("Failed to open segment");

        let first = sample_entry();
        let mut second = sample_entry();
        second.value = b"second".to_vec();
        second.meta.value_size = 6;

        let bytes = first.encode().expect("Failed to encode entry");
        df.write_at(&bytes, 0).expect("Failed to write");
        let off = bytes.len() as u64;
        let bytes = second.encode().expect("Failed to encode entry");
        df.write_at(&bytes, off).expect("Failed to write");

        let got = read_entry_at(dir.path(), 3, off).expect("Failed to read entry back");
        assert_eq!(got, second);
        let got = read_entry_at(dir.path(), 3, 0).expect("Failed to read entry back");
        assert_eq!(got, first);
    }
}
