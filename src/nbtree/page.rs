//! B-tree page management: metapage creation, buffer fetch helpers, and the
//! bulk-load entry point.

use crate::buffer::{Buffer, VRelation};
use crate::common::{BlockNumber, P_NEW, BLCKSZ};
use crate::error::{Result, SoeError};
use crate::page::{page_get_special_size, page_is_new};

use super::{
    BTMetaPage, BTPageOpaque, BTP_LEAF, BTP_META, BTP_ROOT, BTREE_MAGIC, BTREE_METAPAGE,
    BTREE_VERSION, BT_SPECIAL_SIZE, P_NONE,
};

/// Verify that a freshly-read page looks sane.
pub fn bt_checkpage(rel: &VRelation, buf: Buffer) -> Result<()> {
    let page = rel.page(buf)?;
    if page_is_new(page) {
        return Err(SoeError::Invalid(format!(
            "index contains unexpected zero page at block {buf}"
        )));
    }
    if page_get_special_size(page) != BT_SPECIAL_SIZE {
        return Err(SoeError::Invalid(format!(
            "index contains corrupted page at block {buf}"
        )));
    }
    Ok(())
}

/// Get a buffer by block number; `P_NEW` extends the relation with an
/// already-initialized page.
pub fn bt_getbuf(rel: &mut VRelation, blkno: BlockNumber) -> Result<Buffer> {
    if blkno != P_NEW {
        let buf = rel.read_buffer(blkno)?;
        bt_checkpage(rel, buf)?;
        Ok(buf)
    } else {
        rel.read_buffer(P_NEW)
    }
}

pub fn bt_relbuf(rel: &mut VRelation, buf: Buffer) {
    rel.release_buffer(buf);
}

pub fn bt_pageinit(page: &mut [u8]) {
    crate::page::page_init(page, BT_SPECIAL_SIZE);
}

/// Create the metapage and an empty leaf root, leaving the index ready for
/// retail inserts.
pub fn bt_init(rel: &mut VRelation) -> Result<()> {
    let metabuf = bt_getbuf(rel, P_NEW)?;
    debug_assert_eq!(rel.buffer_get_block_number(metabuf), BTREE_METAPAGE);

    let rootbuf = bt_getbuf(rel, P_NEW)?;
    let rootblk = rel.buffer_get_block_number(rootbuf);
    {
        let page = rel.page_mut(rootbuf)?;
        let mut opaque = BTPageOpaque::read(page);
        opaque.prev = P_NONE;
        opaque.next = P_NONE;
        opaque.level = 0;
        opaque.flags = BTP_LEAF | BTP_ROOT;
        opaque.write(page);
    }
    rel.mark_buffer_dirty(rootbuf)?;
    rel.release_buffer(rootbuf);

    {
        let page = rel.page_mut(metabuf)?;
        let mut opaque = BTPageOpaque::read(page);
        opaque.flags = BTP_META;
        opaque.write(page);
        BTMetaPage {
            magic: BTREE_MAGIC,
            version: BTREE_VERSION,
            root: rootblk,
            level: 0,
            fastroot: rootblk,
            fastlevel: 0,
            last_cleanup_num_heap_tuples: -1.0,
        }
        .write(page);
    }
    rel.mark_buffer_dirty(metabuf)?;
    rel.release_buffer(metabuf);
    Ok(())
}

/// Read the metapage and return its contents. The buffer is released.
pub fn bt_getmeta(rel: &mut VRelation) -> Result<BTMetaPage> {
    let metabuf = bt_getbuf(rel, BTREE_METAPAGE)?;
    let meta = BTMetaPage::read(rel.page(metabuf)?)?;
    rel.release_buffer(metabuf);
    Ok(meta)
}

/// Bulk-load path: place one externally built index page at `offset`.
/// `level` is carried by the protocol but the dynamic tree addresses loads
/// by absolute block number.
pub fn bt_load_block(rel: &mut VRelation, block: &[u8], _level: u32, offset: BlockNumber) -> Result<()> {
    if block.len() != BLCKSZ {
        return Err(SoeError::Invalid(format!(
            "index load block of {} bytes",
            block.len()
        )));
    }
    rel.load_block(block, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemHost;
    use crate::ofile::nbtree::{nbtree_page_init, NbtreeOFile};
    use crate::oram::Oram;
    use crate::page::tupdesc::TupleDesc;

    pub(crate) fn bt_rel(nblocks: u32) -> VRelation {
        let host = MemHost::new();
        let oram = Oram::new("btree", nblocks, Box::new(NbtreeOFile::new(host))).unwrap();
        VRelation::new(
            oram,
            91,
            nblocks,
            nbtree_page_init,
            TupleDesc::single_char_key(),
        )
    }

    #[test]
    fn test_init_builds_meta_and_root() {
        let mut rel = bt_rel(16);
        bt_init(&mut rel).unwrap();
        let meta = bt_getmeta(&mut rel).unwrap();
        assert_eq!(meta.root, 1);
        assert_eq!(meta.level, 0);
        assert_eq!(meta.fastroot, 1);

        let rootbuf = bt_getbuf(&mut rel, meta.root).unwrap();
        let opaque = BTPageOpaque::read(rel.page(rootbuf).unwrap());
        assert!(opaque.is_leaf());
        assert!(opaque.is_root());
        assert!(opaque.is_rightmost() && opaque.is_leftmost());
        rel.release_buffer(rootbuf);
    }

    #[test]
    fn test_checkpage_rejects_zero_page() {
        let mut rel = bt_rel(16);
        bt_init(&mut rel).unwrap();
        let buf = rel.read_buffer(crate::common::P_NEW).unwrap();
        rel.page_mut(buf).unwrap().fill(0);
        assert!(bt_checkpage(&rel, buf).is_err());
    }
}
