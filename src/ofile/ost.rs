//! OST oblivious file adapter. All levels of the forest share one backing
//! file; each level's adapter addresses a contiguous page range at the
//! cumulative fanout of the levels below it. The file is pre-allocated once,
//! by whichever level's `file_init` runs first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::common::BlockNumber;
use crate::error::Result;
use crate::host::HostRef;
use crate::ost::{OstPageOpaque, OST_P_NONE, OST_SPECIAL_SIZE};
use crate::page::page_init;

use super::{init_dummy_pages, read_page, write_page, OFile, PLBlock};

/// Initialize an OST page image for block `blkno`.
pub fn ost_page_init(page: &mut [u8], blkno: BlockNumber) {
    page_init(page, OST_SPECIAL_SIZE);
    OstPageOpaque {
        prev: OST_P_NONE,
        next: OST_P_NONE,
        o_blkno: blkno,
        flags: 0,
    }
    .write(page);
}

pub struct OstOFile {
    host: HostRef,
    fanouts: Arc<Vec<u32>>,
    level: u32,
    initialized: Arc<AtomicBool>,
}

impl OstOFile {
    /// Adapter for one level of the forest. `initialized` is shared across
    /// all levels of the same index so the backing file is allocated once.
    pub fn new(
        host: HostRef,
        fanouts: Arc<Vec<u32>>,
        level: u32,
        initialized: Arc<AtomicBool>,
    ) -> Self {
        Self {
            host,
            fanouts,
            level,
            initialized,
        }
    }

    /// Absolute file offset of this level's first page: the root page plus
    /// the fanout of every shallower level.
    fn level_offset(&self) -> BlockNumber {
        if self.level == 0 {
            return 0;
        }
        let mut offset: BlockNumber = 1;
        for l in 0..(self.level - 1) as usize {
            offset += self.fanouts[l];
        }
        offset
    }

    fn total_blocks(&self) -> u32 {
        1 + self.fanouts.iter().sum::<u32>()
    }
}

impl OFile for OstOFile {
    fn page_init(&self, page: &mut [u8], blkno: BlockNumber) {
        ost_page_init(page, blkno);
    }

    fn file_init(&mut self, name: &str, _nblocks: u32) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        init_dummy_pages(&self.host, name, self.total_blocks(), ost_page_init)
    }

    fn file_read(&mut self, name: &str, ob_blkno: BlockNumber) -> Result<PLBlock> {
        read_page(&self.host, name, ob_blkno + self.level_offset(), |page| {
            OstPageOpaque::read(page).o_blkno
        })
    }

    fn file_write(&mut self, block: &mut PLBlock, name: &str, ob_blkno: BlockNumber) -> Result<()> {
        if !block.is_dummy() {
            let mut opaque = OstPageOpaque::read(&block.page);
            if opaque.o_blkno != block.blkno {
                opaque.o_blkno = block.blkno;
                opaque.write(&mut block.page);
            }
        }
        write_page(
            &self.host,
            name,
            ob_blkno + self.level_offset(),
            block,
            ost_page_init,
        )
    }

    fn file_close(&mut self, name: &str) -> Result<()> {
        self.host.file_close(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BLCKSZ;
    use crate::host::{HostEvent, MemHost};

    fn forest(host: HostRef, fanouts: Vec<u32>) -> (Arc<Vec<u32>>, Arc<AtomicBool>, HostRef) {
        (Arc::new(fanouts), Arc::new(AtomicBool::new(false)), host)
    }

    #[test]
    fn test_level_offsets_are_cumulative() {
        let host = MemHost::new();
        let (fanouts, init, host_ref) = forest(host.clone(), vec![4, 16]);
        let l0 = OstOFile::new(host_ref.clone(), fanouts.clone(), 0, init.clone());
        let l1 = OstOFile::new(host_ref.clone(), fanouts.clone(), 1, init.clone());
        let l2 = OstOFile::new(host_ref, fanouts, 2, init);
        assert_eq!(l0.level_offset(), 0);
        assert_eq!(l1.level_offset(), 1);
        assert_eq!(l2.level_offset(), 5);
    }

    #[test]
    fn test_file_initialized_once() {
        let host = MemHost::new();
        let (fanouts, init, host_ref) = forest(host.clone(), vec![2, 4]);
        let mut l1 = OstOFile::new(host_ref.clone(), fanouts.clone(), 1, init.clone());
        let mut l2 = OstOFile::new(host_ref, fanouts, 2, init);
        l1.file_init("ost", 2).unwrap();
        l2.file_init("ost", 4).unwrap();
        assert_eq!(host.nblocks("ost"), 7);
        assert_eq!(
            host.trace()
                .iter()
                .filter(|e| matches!(e, HostEvent::Init { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_levels_address_disjoint_ranges() {
        let host = MemHost::new();
        let (fanouts, init, host_ref) = forest(host.clone(), vec![2, 4]);
        let mut l1 = OstOFile::new(host_ref.clone(), fanouts.clone(), 1, init.clone());
        let mut l2 = OstOFile::new(host_ref, fanouts, 2, init);
        l1.file_init("ost", 2).unwrap();

        let mut page = vec![0u8; BLCKSZ];
        ost_page_init(&mut page, 0);
        let mut block = PLBlock::new(0, page);
        l1.file_write(&mut block, "ost", 0).unwrap();
        // Level 2's block 0 is untouched by level 1's write.
        assert!(l2.file_read("ost", 0).unwrap().is_dummy());
        assert_eq!(l1.file_read("ost", 0).unwrap().blkno, 0);
    }
}
