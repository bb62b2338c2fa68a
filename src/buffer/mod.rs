// Virtual relation / buffer manager. Translates logical block numbers into
// oblivious accesses, keeps the short per-relation list of resident pages
// (the scan working set), and owns the append-only free-space map. Engines
// address pages through `Buffer` handles (block numbers) into the resident
// list — never raw pointers.

pub mod ost;

use crate::common::{BlockNumber, Oid, P_NEW};
use crate::crypto::Token;
use crate::error::{Result, SoeError};
use crate::hash::HashMetaPage;
use crate::oram::Oram;
use crate::page::tupdesc::TupleDesc;

/// Buffer handle: the logical block number of a resident page.
pub type Buffer = BlockNumber;

pub const INVALID_BUFFER: Buffer = crate::common::INVALID_BLOCK_NUMBER;

struct VBlock {
    id: BlockNumber,
    page: Vec<u8>,
    pin_count: u32,
}

/// Per-relation handle over one ORAM-backed file.
pub struct VRelation {
    oram: Oram,
    pub rd_id: Oid,
    /// Comparison function OID for the indexed attribute.
    pub foid: Oid,
    /// Index handler OID (hash or B-tree), when this is an index relation.
    pub index_oid: Oid,

    pub current_block: BlockNumber,
    pub last_free_block: BlockNumber,
    pub total_blocks: u32,
    fsm: Vec<u32>,
    buffers: Vec<VBlock>,

    pub tuple_desc: TupleDesc,
    /// Cached hash metapage; refreshed on demand.
    pub amcache: Option<HashMetaPage>,

    // Ephemeral PRF protocol state for the current operation.
    pub level: u32,
    pub r_counter: u32,
    pub leaf_counter: u32,
    pub heap_block_counter: u32,
    pub t_height: u32,
    pub token: Option<Token>,
    pub fast_prf: bool,
    pub dummies_enabled: bool,

    page_init: fn(&mut [u8], BlockNumber),
}

impl VRelation {
    pub fn new(
        oram: Oram,
        oid: Oid,
        total_blocks: u32,
        page_init: fn(&mut [u8], BlockNumber),
        tuple_desc: TupleDesc,
    ) -> Self {
        Self {
            oram,
            rd_id: oid,
            foid: 0,
            index_oid: 0,
            current_block: 0,
            last_free_block: 0,
            total_blocks,
            fsm: vec![0; total_blocks as usize],
            buffers: Vec::new(),
            tuple_desc,
            amcache: None,
            level: 0,
            r_counter: 0,
            leaf_counter: 0,
            heap_block_counter: 0,
            t_height: 0,
            token: None,
            fast_prf: false,
            dummies_enabled: false,
            page_init,
        }
    }

    /// Zero-indexed: a relation with one block only has offset 0.
    pub fn number_of_blocks(&self) -> BlockNumber {
        self.last_free_block
    }

    fn resident(&self, blkno: BlockNumber) -> Option<usize> {
        self.buffers.iter().position(|b| b.id == blkno)
    }

    fn push_token(&mut self) {
        if let Some(token) = self.token.take() {
            self.oram.set_token(token);
        }
    }

    /// Return a buffer for `blkno`, or extend the relation when `P_NEW`.
    ///
    /// A resident block is returned without touching the ORAM: even a
    /// single-threaded session re-reads blocks it already holds (the hash
    /// metapage, for one), and the second read must not leak an extra
    /// access.
    pub fn read_buffer(&mut self, blkno: BlockNumber) -> Result<Buffer> {
        if blkno == P_NEW {
            let block_id = self.last_free_block;
            self.push_token();
            let page = match self.oram.read(block_id)? {
                Some(page) => page,
                None => {
                    // First touch of this block: build a fresh page image.
                    let mut page = vec![0u8; crate::common::BLCKSZ];
                    (self.page_init)(&mut page, block_id);
                    page
                }
            };
            self.last_free_block += 1;
            if self.fsm.len() < self.last_free_block as usize {
                self.fsm.push(0);
            }
            self.buffers.push(VBlock {
                id: block_id,
                page,
                pin_count: 1,
            });
            return Ok(block_id);
        }

        if blkno > self.last_free_block {
            return Err(SoeError::OutOfBounds {
                blkno,
                nblocks: self.last_free_block,
            });
        }

        if let Some(idx) = self.resident(blkno) {
            self.buffers[idx].pin_count += 1;
            return Ok(blkno);
        }

        self.push_token();
        let page = self.oram.read(blkno)?.ok_or_else(|| {
            SoeError::Invalid(format!("read a dummy block for logical block {blkno}"))
        })?;
        self.buffers.push(VBlock {
            id: blkno,
            page,
            pin_count: 1,
        });
        Ok(blkno)
    }

    /// One host read with a discarded outcome.
    pub fn read_dummy_buffer(&mut self) -> Result<()> {
        self.push_token();
        self.oram.read_dummy()
    }

    pub fn page(&self, buffer: Buffer) -> Result<&[u8]> {
        self.resident(buffer)
            .map(|i| self.buffers[i].page.as_slice())
            .ok_or_else(|| SoeError::Invalid(format!("no resident page for buffer {buffer}")))
    }

    pub fn page_mut(&mut self, buffer: Buffer) -> Result<&mut [u8]> {
        let idx = self
            .resident(buffer)
            .ok_or_else(|| SoeError::Invalid(format!("no resident page for buffer {buffer}")))?;
        Ok(self.buffers[idx].page.as_mut_slice())
    }

    pub fn buffer_get_block_number(&self, buffer: Buffer) -> BlockNumber {
        buffer
    }

    /// Write the page back through the ORAM. This is the only operation that
    /// pushes bytes toward the host; encryption happens in the adapter.
    pub fn mark_buffer_dirty(&mut self, buffer: Buffer) -> Result<()> {
        let idx = self
            .resident(buffer)
            .ok_or_else(|| SoeError::Invalid(format!("no resident page for buffer {buffer}")))?;
        self.push_token();
        let id = self.buffers[idx].id;
        let page = std::mem::take(&mut self.buffers[idx].page);
        let result = self.oram.write(&page, id);
        self.buffers[idx].page = page;
        result
    }

    /// Drop one pin on the resident copy; the page leaves the list when the
    /// last pin goes. Purely in-memory; callers must have marked the buffer
    /// dirty first if they modified it.
    pub fn release_buffer(&mut self, buffer: Buffer) {
        match self.resident(buffer) {
            Some(idx) => {
                self.buffers[idx].pin_count -= 1;
                if self.buffers[idx].pin_count == 0 {
                    self.buffers.swap_remove(idx);
                }
            }
            None => {
                // A scan may legitimately release a buffer twice.
                tracing::debug!(buffer, "could not find buffer to release");
            }
        }
    }

    /// `P_NEW` when the current append block has never taken an item, else
    /// the current block.
    pub fn free_space_block(&self) -> BlockNumber {
        if self.fsm[self.current_block as usize] == 0 {
            P_NEW
        } else {
            self.current_block
        }
    }

    pub fn update_fsm(&mut self) {
        self.fsm[self.current_block as usize] += 1;
    }

    pub fn buffer_full(&mut self) {
        self.current_block += 1;
        if self.fsm.len() <= self.current_block as usize {
            self.fsm.push(0);
        }
    }

    /// Bulk-load path: place a pre-built page image at `blkno`, extending
    /// the logical extent past it.
    pub fn load_block(&mut self, page: &[u8], blkno: BlockNumber) -> Result<()> {
        if page.len() != crate::common::BLCKSZ {
            return Err(SoeError::Invalid(format!(
                "load of {} bytes is not a full page",
                page.len()
            )));
        }
        self.push_token();
        self.oram.write(page, blkno)?;
        if blkno >= self.last_free_block {
            self.last_free_block = blkno + 1;
        }
        while self.fsm.len() < self.last_free_block as usize {
            self.fsm.push(0);
        }
        Ok(())
    }

    /// Record `count` occupied slots for a bulk-loaded block.
    pub fn set_fsm(&mut self, blkno: BlockNumber, count: u32) {
        self.fsm[blkno as usize] = count;
        self.current_block = blkno;
    }

    /// Write nothing, free everything, close the backing store.
    pub fn close(&mut self) -> Result<()> {
        self.buffers.clear();
        self.amcache = None;
        self.oram.close()
    }

    #[cfg(test)]
    pub fn resident_count(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemHost;
    use crate::ofile::heap::HeapOFile;

    fn test_rel(nblocks: u32) -> (VRelation, std::sync::Arc<MemHost>) {
        let host = MemHost::new();
        let oram = Oram::new("rel", nblocks, Box::new(HeapOFile::new(host.clone()))).unwrap();
        let rel = VRelation::new(
            oram,
            1234,
            nblocks,
            crate::ofile::heap::heap_page_init,
            TupleDesc::single_char_key(),
        );
        (rel, host)
    }

    #[test]
    fn test_extend_initializes_fresh_page() {
        let (mut rel, _) = test_rel(4);
        let buf = rel.read_buffer(P_NEW).unwrap();
        assert_eq!(buf, 0);
        assert_eq!(rel.number_of_blocks(), 1);
        let page = rel.page(buf).unwrap();
        assert!(!crate::page::page_is_new(page));
    }

    #[test]
    fn test_out_of_bounds_read() {
        let (mut rel, _) = test_rel(4);
        assert!(matches!(
            rel.read_buffer(3),
            Err(SoeError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_resident_hit_skips_oram() {
        let (mut rel, host) = test_rel(4);
        let buf = rel.read_buffer(P_NEW).unwrap();
        rel.mark_buffer_dirty(buf).unwrap();
        host.clear_trace();
        let again = rel.read_buffer(buf).unwrap();
        assert_eq!(again, buf);
        assert!(host.trace().is_empty());
        assert_eq!(rel.resident_count(), 1);
    }

    #[test]
    fn test_dirty_page_survives_release_and_reread() {
        let (mut rel, _) = test_rel(4);
        let buf = rel.read_buffer(P_NEW).unwrap();
        rel.page_mut(buf).unwrap()[100] = 0x42;
        rel.mark_buffer_dirty(buf).unwrap();
        rel.release_buffer(buf);
        assert_eq!(rel.resident_count(), 0);

        let again = rel.read_buffer(buf).unwrap();
        assert_eq!(rel.page(again).unwrap()[100], 0x42);
    }

    #[test]
    fn test_release_without_dirty_discards_changes() {
        let (mut rel, _) = test_rel(4);
        let buf = rel.read_buffer(P_NEW).unwrap();
        rel.mark_buffer_dirty(buf).unwrap();
        rel.page_mut(buf).unwrap()[100] = 0x42;
        rel.release_buffer(buf);

        let again = rel.read_buffer(buf).unwrap();
        assert_eq!(rel.page(again).unwrap()[100], 0);
    }

    #[test]
    fn test_fsm_advances_append_block() {
        let (mut rel, _) = test_rel(4);
        assert_eq!(rel.free_space_block(), P_NEW);
        let buf = rel.read_buffer(P_NEW).unwrap();
        rel.mark_buffer_dirty(buf).unwrap();
        rel.release_buffer(buf);
        rel.update_fsm();
        assert_eq!(rel.free_space_block(), 0);
        rel.buffer_full();
        assert_eq!(rel.free_space_block(), P_NEW);
    }
}
