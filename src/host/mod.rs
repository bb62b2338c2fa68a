// Host-callback seam. Everything below this trait runs outside the trusted
// boundary: the host only ever sees ciphertext pages and the (oblivious)
// block numbers the adapters choose to touch.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{BlockNumber, BLCKSZ};
use crate::error::{Result, SoeError};

/// Synchronous host file callbacks, one logical file per relation.
///
/// Any error is fatal to the in-flight trusted operation. Implementations
/// must persist whole pages: a write either stores all `BLCKSZ` bytes or
/// fails.
pub trait HostFile: Send + Sync {
    /// Accept `nblocks` pre-initialized ciphertext pages laid out
    /// back-to-back in `pages`, stored starting at block `offset`.
    fn file_init(
        &self,
        name: &str,
        pages: &[u8],
        nblocks: u32,
        blocksize: usize,
        offset: BlockNumber,
    ) -> Result<()>;

    fn file_read(&self, name: &str, blkno: BlockNumber, out: &mut [u8]) -> Result<()>;

    fn file_write(&self, name: &str, blkno: BlockNumber, page: &[u8]) -> Result<()>;

    fn file_close(&self, name: &str) -> Result<()>;
}

/// Shared handle to the host side.
pub type HostRef = Arc<dyn HostFile>;

/// One observable host interaction, in invocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Init {
        name: String,
        nblocks: u32,
        offset: BlockNumber,
    },
    Read {
        name: String,
        blkno: BlockNumber,
    },
    Write {
        name: String,
        blkno: BlockNumber,
    },
    Close {
        name: String,
    },
}

/// In-memory host used by the test suite. Records every callback so tests
/// can assert on the external access trace (encryption discipline, dummy
/// padding counts).
#[derive(Default)]
pub struct MemHost {
    files: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    trace: Mutex<Vec<HostEvent>>,
}

impl MemHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn trace(&self) -> Vec<HostEvent> {
        self.trace.lock().clone()
    }

    pub fn clear_trace(&self) {
        self.trace.lock().clear();
    }

    pub fn read_count(&self, name: &str) -> usize {
        self.trace
            .lock()
            .iter()
            .filter(|e| matches!(e, HostEvent::Read { name: n, .. } if n == name))
            .count()
    }

    /// Raw ciphertext page as the host stores it.
    pub fn raw_page(&self, name: &str, blkno: BlockNumber) -> Option<Vec<u8>> {
        self.files
            .lock()
            .get(name)
            .and_then(|pages| pages.get(blkno as usize).cloned())
    }

    pub fn nblocks(&self, name: &str) -> usize {
        self.files.lock().get(name).map_or(0, |p| p.len())
    }
}

impl HostFile for MemHost {
    fn file_init(
        &self,
        name: &str,
        pages: &[u8],
        nblocks: u32,
        blocksize: usize,
        offset: BlockNumber,
    ) -> Result<()> {
        if pages.len() != nblocks as usize * blocksize {
            return Err(SoeError::Host(format!(
                "init of {name}: {} bytes for {nblocks} blocks",
                pages.len()
            )));
        }
        let mut files = self.files.lock();
        let file = files.entry(name.to_string()).or_default();
        let end = offset as usize + nblocks as usize;
        if file.len() < end {
            file.resize(end, vec![0u8; blocksize]);
        }
        for i in 0..nblocks as usize {
            file[offset as usize + i] = pages[i * blocksize..(i + 1) * blocksize].to_vec();
        }
        self.trace.lock().push(HostEvent::Init {
            name: name.to_string(),
            nblocks,
            offset,
        });
        Ok(())
    }

    fn file_read(&self, name: &str, blkno: BlockNumber, out: &mut [u8]) -> Result<()> {
        let files = self.files.lock();
        let pages = files
            .get(name)
            .ok_or_else(|| SoeError::Host(format!("read from unknown file {name}")))?;
        let page = pages
            .get(blkno as usize)
            .ok_or_else(|| SoeError::Host(format!("read past end of {name}: block {blkno}")))?;
        out.copy_from_slice(page);
        self.trace.lock().push(HostEvent::Read {
            name: name.to_string(),
            blkno,
        });
        Ok(())
    }

    fn file_write(&self, name: &str, blkno: BlockNumber, page: &[u8]) -> Result<()> {
        if page.len() != BLCKSZ {
            return Err(SoeError::Host(format!(
                "partial page write of {} bytes to {name}",
                page.len()
            )));
        }
        let mut files = self.files.lock();
        let pages = files
            .get_mut(name)
            .ok_or_else(|| SoeError::Host(format!("write to unknown file {name}")))?;
        if blkno as usize >= pages.len() {
            return Err(SoeError::Host(format!(
                "write past end of {name}: block {blkno}"
            )));
        }
        pages[blkno as usize] = page.to_vec();
        self.trace.lock().push(HostEvent::Write {
            name: name.to_string(),
            blkno,
        });
        Ok(())
    }

    fn file_close(&self, name: &str) -> Result<()> {
        self.trace.lock().push(HostEvent::Close {
            name: name.to_string(),
        });
        Ok(())
    }
}

/// Reference host backed by ordinary files, one per relation, page-addressed
/// by seek offset.
pub struct FileHost {
    base: PathBuf,
}

impl FileHost {
    pub fn new(base: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { base: base.into() })
    }

    fn path(&self, name: &str) -> PathBuf {
        // Relation names come from the untrusted caller; keep them inside
        // the base directory.
        let safe: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.base.join(safe)
    }
}

impl HostFile for FileHost {
    fn file_init(
        &self,
        name: &str,
        pages: &[u8],
        nblocks: u32,
        blocksize: usize,
        offset: BlockNumber,
    ) -> Result<()> {
        if pages.len() != nblocks as usize * blocksize {
            return Err(SoeError::Host(format!(
                "init of {name}: {} bytes for {nblocks} blocks",
                pages.len()
            )));
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.path(name))
            .map_err(|e| SoeError::Host(format!("open {name}: {e}")))?;
        file.seek(SeekFrom::Start(offset as u64 * blocksize as u64))
            .map_err(|e| SoeError::Host(format!("seek {name}: {e}")))?;
        file.write_all(pages)
            .map_err(|e| SoeError::Host(format!("init write {name}: {e}")))?;
        Ok(())
    }

    fn file_read(&self, name: &str, blkno: BlockNumber, out: &mut [u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .open(self.path(name))
            .map_err(|e| SoeError::Host(format!("open {name}: {e}")))?;
        file.seek(SeekFrom::Start(blkno as u64 * BLCKSZ as u64))
            .map_err(|e| SoeError::Host(format!("seek {name}: {e}")))?;
        file.read_exact(out)
            .map_err(|e| SoeError::Host(format!("read {name} block {blkno}: {e}")))?;
        Ok(())
    }

    fn file_write(&self, name: &str, blkno: BlockNumber, page: &[u8]) -> Result<()> {
        if page.len() != BLCKSZ {
            return Err(SoeError::Host(format!(
                "partial page write of {} bytes to {name}",
                page.len()
            )));
        }
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.path(name))
            .map_err(|e| SoeError::Host(format!("open {name}: {e}")))?;
        file.seek(SeekFrom::Start(blkno as u64 * BLCKSZ as u64))
            .map_err(|e| SoeError::Host(format!("seek {name}: {e}")))?;
        file.write_all(page)
            .map_err(|e| SoeError::Host(format!("write {name} block {blkno}: {e}")))?;
        Ok(())
    }

    fn file_close(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memhost_init_read_write() {
        let host = MemHost::new();
        let pages = vec![7u8; BLCKSZ * 2];
        host.file_init("rel", &pages, 2, BLCKSZ, 0).unwrap();
        let mut out = vec![0u8; BLCKSZ];
        host.file_read("rel", 1, &mut out).unwrap();
        assert_eq!(out, vec![7u8; BLCKSZ]);

        let page = vec![9u8; BLCKSZ];
        host.file_write("rel", 0, &page).unwrap();
        host.file_read("rel", 0, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn test_memhost_rejects_out_of_range() {
        let host = MemHost::new();
        let pages = vec![0u8; BLCKSZ];
        host.file_init("rel", &pages, 1, BLCKSZ, 0).unwrap();
        let mut out = vec![0u8; BLCKSZ];
        assert!(host.file_read("rel", 5, &mut out).is_err());
        assert!(host.file_write("rel", 5, &out).is_err());
    }

    #[test]
    fn test_memhost_trace_order() {
        let host = MemHost::new();
        let pages = vec![0u8; BLCKSZ];
        host.file_init("rel", &pages, 1, BLCKSZ, 0).unwrap();
        let mut out = vec![0u8; BLCKSZ];
        host.file_read("rel", 0, &mut out).unwrap();
        host.file_close("rel").unwrap();
        let trace = host.trace();
        assert!(matches!(trace[0], HostEvent::Init { .. }));
        assert!(matches!(trace[1], HostEvent::Read { blkno: 0, .. }));
        assert!(matches!(trace[2], HostEvent::Close { .. }));
    }

    #[test]
    fn test_filehost_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let host = FileHost::new(dir.path());
        let pages = vec![3u8; BLCKSZ * 2];
        host.file_init("rel", &pages, 2, BLCKSZ, 0).unwrap();
        let page = vec![5u8; BLCKSZ];
        host.file_write("rel", 1, &page).unwrap();
        let mut out = vec![0u8; BLCKSZ];
        host.file_read("rel", 1, &mut out).unwrap();
        assert_eq!(out, page);
    }
}
