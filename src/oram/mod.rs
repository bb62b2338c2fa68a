// Oblivious block store. One `Oram` per relation (or per OST level) maps
// logical block numbers through a shuffled position map onto the physical
// pages the adapter talks to. Each logical access costs exactly one host
// access; the PRF token set by the engine before the access labels it in
// the trace. The production eviction scheduler sits outside this crate —
// the engines only observe the single logical outcome per access.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::common::{BlockNumber, BLCKSZ};
use crate::crypto::Token;
use crate::error::{Result, SoeError};
use crate::ofile::{OFile, PLBlock};

pub struct Oram {
    name: String,
    nblocks: u32,
    /// Logical block -> physical slot, fixed at init by a uniform shuffle.
    pmap: Vec<BlockNumber>,
    token: Option<Token>,
    ofile: Box<dyn OFile>,
}

impl Oram {
    /// Create the store and pre-allocate its backing file with encrypted
    /// dummy pages.
    pub fn new(name: &str, nblocks: u32, mut ofile: Box<dyn OFile>) -> Result<Self> {
        ofile.file_init(name, nblocks)?;
        let mut pmap: Vec<BlockNumber> = (0..nblocks).collect();
        pmap.shuffle(&mut rand::rng());
        Ok(Self {
            name: name.to_string(),
            nblocks,
            pmap,
            token: None,
            ofile,
        })
    }

    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    /// Label the next access. Tokens come from the PRF over
    /// `(level, offset, counter)` and are consumed once.
    pub fn set_token(&mut self, token: Token) {
        self.token = Some(token);
    }

    fn slot(&self, blkno: BlockNumber) -> Result<BlockNumber> {
        self.pmap
            .get(blkno as usize)
            .copied()
            .ok_or(SoeError::OutOfBounds {
                blkno,
                nblocks: self.nblocks,
            })
    }

    fn trace_token(&mut self) {
        if let Some(token) = self.token.take() {
            tracing::trace!(oram = %self.name, token = %hex::encode(token), "labeled access");
        }
    }

    /// Read logical block `blkno`. `None` means the physical page has never
    /// held this block (a dummy), which callers treat as "fresh page".
    pub fn read(&mut self, blkno: BlockNumber) -> Result<Option<Vec<u8>>> {
        let slot = self.slot(blkno)?;
        self.trace_token();
        let block = self.ofile.file_read(&self.name, slot)?;
        if block.is_dummy() {
            Ok(None)
        } else {
            Ok(Some(block.page))
        }
    }

    /// Write logical block `blkno`. The page is re-encrypted on its way out.
    pub fn write(&mut self, page: &[u8], blkno: BlockNumber) -> Result<()> {
        if page.len() != BLCKSZ {
            return Err(SoeError::Invalid(format!(
                "oram write of {} bytes is not a full page",
                page.len()
            )));
        }
        let slot = self.slot(blkno)?;
        self.trace_token();
        let mut block = PLBlock::new(blkno, page.to_vec());
        self.ofile.file_write(&mut block, &self.name, slot)
    }

    /// Issue one host read whose outcome is discarded. Uniform over the
    /// physical slots, so the trace is indistinguishable from a real read.
    pub fn read_dummy(&mut self) -> Result<()> {
        let slot = rand::rng().random_range(0..self.nblocks);
        self.trace_token();
        self.ofile.file_read(&self.name, slot)?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.ofile.file_close(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostEvent, MemHost};
    use crate::ofile::heap::{heap_page_init, HeapOFile};

    fn test_oram(nblocks: u32) -> (Oram, std::sync::Arc<MemHost>) {
        let host = MemHost::new();
        let oram = Oram::new("rel", nblocks, Box::new(HeapOFile::new(host.clone()))).unwrap();
        (oram, host)
    }

    #[test]
    fn test_fresh_blocks_read_as_dummy() {
        let (mut oram, _) = test_oram(4);
        for blkno in 0..4 {
            assert!(oram.read(blkno).unwrap().is_none());
        }
    }

    #[test]
    fn test_write_then_read() {
        let (mut oram, _) = test_oram(4);
        let mut page = vec![0u8; BLCKSZ];
        heap_page_init(&mut page, 2);
        page[100] = 0xEE;
        oram.write(&page, 2).unwrap();
        let back = oram.read(2).unwrap().expect("block 2 was written");
        assert_eq!(back[100], 0xEE);
        // Other logical blocks stay dummy.
        assert!(oram.read(1).unwrap().is_none());
    }

    #[test]
    fn test_out_of_bounds() {
        let (mut oram, _) = test_oram(2);
        assert!(matches!(
            oram.read(9),
            Err(SoeError::OutOfBounds { blkno: 9, .. })
        ));
    }

    #[test]
    fn test_one_host_read_per_access() {
        let (mut oram, host) = test_oram(8);
        host.clear_trace();
        oram.read(3).unwrap();
        oram.read_dummy().unwrap();
        let reads = host
            .trace()
            .iter()
            .filter(|e| matches!(e, HostEvent::Read { .. }))
            .count();
        assert_eq!(reads, 2);
    }
}
