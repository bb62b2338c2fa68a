//! Heap oblivious file adapter. Heap pages carry the smallest special area:
//! just the real block number used to recognize dummy pages after decryption.

use crate::common::{maxalign, BlockNumber};
use crate::error::Result;
use crate::host::HostRef;
use crate::page::{page_get_special, page_get_special_mut, page_init};

use super::{init_dummy_pages, read_page, write_page, OFile, PLBlock};

/// Special area: `o_blkno` plus alignment padding.
pub const HEAP_SPECIAL_SIZE: usize = maxalign(4);

pub fn heap_special_get_blkno(page: &[u8]) -> BlockNumber {
    let sp = page_get_special(page);
    u32::from_le_bytes([sp[0], sp[1], sp[2], sp[3]])
}

pub fn heap_special_set_blkno(page: &mut [u8], blkno: BlockNumber) {
    let sp = page_get_special_mut(page);
    sp[0..4].copy_from_slice(&blkno.to_le_bytes());
}

/// Initialize a heap page image for block `blkno`.
pub fn heap_page_init(page: &mut [u8], blkno: BlockNumber) {
    page_init(page, HEAP_SPECIAL_SIZE);
    heap_special_set_blkno(page, blkno);
}

pub struct HeapOFile {
    host: HostRef,
}

impl HeapOFile {
    pub fn new(host: HostRef) -> Self {
        Self { host }
    }
}

impl OFile for HeapOFile {
    fn page_init(&self, page: &mut [u8], blkno: BlockNumber) {
        heap_page_init(page, blkno);
    }

    fn file_init(&mut self, name: &str, nblocks: u32) -> Result<()> {
        init_dummy_pages(&self.host, name, nblocks, heap_page_init)
    }

    fn file_read(&mut self, name: &str, ob_blkno: BlockNumber) -> Result<PLBlock> {
        read_page(&self.host, name, ob_blkno, heap_special_get_blkno)
    }

    fn file_write(&mut self, block: &mut PLBlock, name: &str, ob_blkno: BlockNumber) -> Result<()> {
        if !block.is_dummy() && heap_special_get_blkno(&block.page) != block.blkno {
            heap_special_set_blkno(&mut block.page, block.blkno);
        }
        write_page(&self.host, name, ob_blkno, block, heap_page_init)
    }

    fn file_close(&mut self, name: &str) -> Result<()> {
        self.host.file_close(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BLCKSZ, DUMMY_BLOCK};
    use crate::host::MemHost;

    #[test]
    fn test_init_then_read_yields_dummy() {
        let host = MemHost::new();
        let mut ofile = HeapOFile::new(host.clone());
        ofile.file_init("heap", 4).unwrap();
        let block = ofile.file_read("heap", 2).unwrap();
        assert!(block.is_dummy());
    }

    #[test]
    fn test_write_then_read_recovers_real_blkno() {
        let host = MemHost::new();
        let mut ofile = HeapOFile::new(host.clone());
        ofile.file_init("heap", 4).unwrap();

        let mut page = vec![0u8; BLCKSZ];
        heap_page_init(&mut page, 3);
        let mut block = PLBlock::new(3, page);
        ofile.file_write(&mut block, "heap", 0).unwrap();

        let back = ofile.file_read("heap", 0).unwrap();
        assert_eq!(back.blkno, 3);
    }

    #[test]
    fn test_dummy_write_reinitializes() {
        let host = MemHost::new();
        let mut ofile = HeapOFile::new(host.clone());
        ofile.file_init("heap", 2).unwrap();

        // Garbage content under a dummy block number must not leak out.
        let mut block = PLBlock::new(DUMMY_BLOCK, vec![0x5Au8; BLCKSZ]);
        ofile.file_write(&mut block, "heap", 1).unwrap();
        let back = ofile.file_read("heap", 1).unwrap();
        assert!(back.is_dummy());
    }
}
