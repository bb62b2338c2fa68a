// Heap engine: sequential append of opaque tuples, TID-keyed fetch. No
// deletion, no free-space search on earlier blocks — the free-space map is
// a cursor over an append-only file.

use crate::buffer::VRelation;
use crate::common::{maxalign, ItemPointer, BlockNumber, INVALID_OFFSET_NUMBER};
use crate::crypto::prf;
use crate::error::{Result, SoeError};
use crate::page::htup::{heap_tuple_set_ctid, HeapTuple, HEAP_TUPLE_HEADER_LEN};
use crate::page::{
    page_add_item, page_get_heap_free_space, page_get_item, page_get_item_id,
    page_get_max_offset_number,
};

/// Insert one stored heap item (header + payload) at the tail of the
/// current append block, advancing to a fresh block when it does not fit.
/// Returns the descriptor of the stored tuple, its `t_self` filled in.
pub fn heap_insert(rel: &mut VRelation, item: &[u8]) -> Result<HeapTuple> {
    if item.len() < HEAP_TUPLE_HEADER_LEN {
        return Err(SoeError::Invalid(format!(
            "heap item of {} bytes is smaller than its header",
            item.len()
        )));
    }

    let mut buffer = rel.read_buffer(rel.free_space_block())?;
    let aligned_size = maxalign(item.len());

    let free = page_get_heap_free_space(rel.page(buffer)?);
    if aligned_size > free {
        if page_get_max_offset_number(rel.page(buffer)?) == 0 {
            // Even an empty page cannot take it.
            return Err(SoeError::TooLarge {
                size: aligned_size,
                max: free,
            });
        }
        tracing::warn!(buffer, "page has no free space");
        rel.buffer_full();
        rel.release_buffer(buffer);
        buffer = rel.read_buffer(rel.free_space_block())?;
    }

    let blkno = rel.buffer_get_block_number(buffer);
    let offnum = page_add_item(rel.page_mut(buffer)?, item, INVALID_OFFSET_NUMBER, false, true)?;
    if offnum == INVALID_OFFSET_NUMBER {
        return Err(SoeError::PageFull(format!(
            "failed to append {} byte heap item to block {blkno}",
            item.len()
        )));
    }

    let t_self = ItemPointer::new(blkno, offnum);

    // Stamp the stored copy's own identity into its header.
    {
        let page = rel.page_mut(buffer)?;
        let item_id = page_get_item_id(page, offnum);
        if !item_id.is_normal() {
            return Err(SoeError::Invalid("inserted item id is not normal".into()));
        }
        let start = item_id.off as usize;
        heap_tuple_set_ctid(&mut page[start..start + item_id.len as usize], t_self);
    }

    let mut stored = item.to_vec();
    heap_tuple_set_ctid(&mut stored, t_self);

    rel.mark_buffer_dirty(buffer)?;
    rel.release_buffer(buffer);
    rel.update_fsm();

    Ok(HeapTuple {
        t_self,
        t_len: stored.len(),
        t_table_oid: rel.rd_id,
        t_data: stored,
    })
}

/// Fetch the tuple addressed by `tid`. The read is labeled with a PRF token
/// derived from the heap-block counter the preceding index descent captured.
pub fn heap_get_tuple(rel: &mut VRelation, tid: ItemPointer) -> Result<HeapTuple> {
    rel.token = Some(prf(0, tid.block, rel.heap_block_counter, rel.fast_prf));
    let buffer = rel.read_buffer(tid.block)?;

    if rel.buffer_get_block_number(buffer) != tid.block {
        rel.release_buffer(buffer);
        return Err(SoeError::Invalid(format!(
            "requested pointer does not match block number: {} != {}",
            tid.block,
            rel.buffer_get_block_number(buffer)
        )));
    }

    let (t_len, t_data) = {
        let page = rel.page(buffer)?;
        if tid.offnum == 0 || tid.offnum > page_get_max_offset_number(page) {
            rel.release_buffer(buffer);
            return Err(SoeError::Invalid(format!(
                "tuple offset {} beyond page extent",
                tid.offnum
            )));
        }
        let item_id = page_get_item_id(page, tid.offnum);
        if !item_id.is_normal() {
            rel.release_buffer(buffer);
            return Err(SoeError::Invalid(format!(
                "item id at ({}, {}) is not normal",
                tid.block, tid.offnum
            )));
        }
        (item_id.len as usize, page_get_item(page, item_id).to_vec())
    };

    rel.release_buffer(buffer);

    Ok(HeapTuple {
        t_self: tid,
        t_len,
        t_table_oid: rel.rd_id,
        t_data,
    })
}

/// Bulk-load path: place one externally built heap page at `blkno`.
pub fn heap_insert_block(rel: &mut VRelation, block: &[u8], blkno: BlockNumber) -> Result<()> {
    rel.load_block(block, blkno)?;
    rel.set_fsm(blkno, page_get_max_offset_number(block) as u32);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemHost;
    use crate::ofile::heap::{heap_page_init, HeapOFile};
    use crate::oram::Oram;
    use crate::page::htup::heap_form_tuple;
    use crate::page::tupdesc::TupleDesc;

    fn heap_rel(nblocks: u32) -> VRelation {
        let host = MemHost::new();
        let oram = Oram::new("heap", nblocks, Box::new(HeapOFile::new(host))).unwrap();
        VRelation::new(oram, 42, nblocks, heap_page_init, TupleDesc::single_char_key())
    }

    #[test]
    fn test_insert_then_fetch() {
        let mut rel = heap_rel(4);
        let item = heap_form_tuple(b"hello");
        let tuple = heap_insert(&mut rel, &item).unwrap();
        assert_eq!(tuple.t_self, ItemPointer::new(0, 1));

        let back = heap_get_tuple(&mut rel, tuple.t_self).unwrap();
        assert_eq!(back.payload(), b"hello");
        assert_eq!(back.t_table_oid, 42);
    }

    #[test]
    fn test_sequential_inserts_fill_then_advance() {
        let mut rel = heap_rel(8);
        let item = heap_form_tuple(&[7u8; 2000]);
        let mut blocks = Vec::new();
        for _ in 0..8 {
            blocks.push(heap_insert(&mut rel, &item).unwrap().t_self.block);
        }
        // Four ~2KB tuples per 8KB page.
        assert!(blocks.iter().any(|&b| b > 0));
        let first_on_second: usize = blocks.iter().position(|&b| b == 1).unwrap();
        assert_eq!(blocks[..first_on_second], vec![0; first_on_second][..]);
    }

    #[test]
    fn test_fetch_invalid_tid() {
        let mut rel = heap_rel(4);
        let item = heap_form_tuple(b"x");
        let tuple = heap_insert(&mut rel, &item).unwrap();
        let bad = ItemPointer::new(tuple.t_self.block, 99);
        assert!(heap_get_tuple(&mut rel, bad).is_err());
    }

    #[test]
    fn test_oversize_tuple_rejected() {
        let mut rel = heap_rel(4);
        let item = heap_form_tuple(&[0u8; crate::common::BLCKSZ]);
        assert!(matches!(
            heap_insert(&mut rel, &item),
            Err(SoeError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_stored_header_carries_tid() {
        let mut rel = heap_rel(4);
        let item = heap_form_tuple(b"payload");
        let tuple = heap_insert(&mut rel, &item).unwrap();
        let back = heap_get_tuple(&mut rel, tuple.t_self).unwrap();
        assert_eq!(
            crate::page::htup::heap_tuple_get_ctid(&back.t_data),
            tuple.t_self
        );
    }
}
