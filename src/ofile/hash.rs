//! Hash oblivious file adapter. Dummy pages are initialized as unused hash
//! pages so the decrypted special area always parses.

use crate::common::{BlockNumber, INVALID_BLOCK_NUMBER};
use crate::error::Result;
use crate::hash::{HashPageOpaque, HASHO_PAGE_ID, HASH_SPECIAL_SIZE, INVALID_BUCKET, LH_UNUSED_PAGE};
use crate::host::HostRef;
use crate::page::page_init;

use super::{init_dummy_pages, read_page, write_page, OFile, PLBlock};

/// Initialize a hash page image for block `blkno` as an unused page.
pub fn hash_page_init(page: &mut [u8], blkno: BlockNumber) {
    page_init(page, HASH_SPECIAL_SIZE);
    HashPageOpaque {
        o_blkno: blkno,
        prev_blkno: INVALID_BLOCK_NUMBER,
        next_blkno: INVALID_BLOCK_NUMBER,
        bucket: INVALID_BUCKET,
        flag: LH_UNUSED_PAGE,
        page_id: HASHO_PAGE_ID,
    }
    .write(page);
}

pub struct HashOFile {
    host: HostRef,
}

impl HashOFile {
    pub fn new(host: HostRef) -> Self {
        Self { host }
    }
}

impl OFile for HashOFile {
    fn page_init(&self, page: &mut [u8], blkno: BlockNumber) {
        hash_page_init(page, blkno);
    }

    fn file_init(&mut self, name: &str, nblocks: u32) -> Result<()> {
        init_dummy_pages(&self.host, name, nblocks, hash_page_init)
    }

    fn file_read(&mut self, name: &str, ob_blkno: BlockNumber) -> Result<PLBlock> {
        read_page(&self.host, name, ob_blkno, |page| {
            HashPageOpaque::read(page).o_blkno
        })
    }

    fn file_write(&mut self, block: &mut PLBlock, name: &str, ob_blkno: BlockNumber) -> Result<()> {
        if !block.is_dummy() {
            let mut opaque = HashPageOpaque::read(&block.page);
            if opaque.o_blkno != block.blkno {
                opaque.o_blkno = block.blkno;
                opaque.write(&mut block.page);
            }
        }
        write_page(&self.host, name, ob_blkno, block, hash_page_init)
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
    fn test_dummy_pages_parse_as_unused() {
        let host = MemHost::new();
        let mut ofile = HashOFile::new(host.clone());
        ofile.file_init("hidx", 3).unwrap();
        let block = ofile.file_read("hidx", 0).unwrap();
        assert_eq!(block.blkno, DUMMY_BLOCK);
        let opaque = HashPageOpaque::read(&block.page);
        assert_eq!(opaque.flag, LH_UNUSED_PAGE);
        assert_eq!(opaque.page_id, HASHO_PAGE_ID);
    }

    #[test]
    fn test_host_never_sees_plaintext_special() {
        let host = MemHost::new();
        let mut ofile = HashOFile::new(host.clone());
        ofile.file_init("hidx", 1).unwrap();

        let mut page = vec![0u8; BLCKSZ];
        hash_page_init(&mut page, 0);
        let mut block = PLBlock::new(0, page.clone());
        ofile.file_write(&mut block, "hidx", 0).unwrap();

        let raw = host.raw_page("hidx", 0).unwrap();
        assert_ne!(raw, page);
    }
}
