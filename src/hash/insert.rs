//! Hash tuple insertion.

use crate::buffer::{Buffer, VRelation};
use crate::common::{block_number_is_valid, maxalign, ItemPointer, INVALID_OFFSET_NUMBER};
use crate::error::{Result, SoeError};
use crate::page::itup::{index_form_tuple, index_tuple_set_tid};
use crate::page::tupdesc::TupleDesc;
use crate::page::{page_add_item, page_get_free_space};

use super::ovfl::hash_addovflpage;
use super::page::{hash_getbuf, hash_getbucketbuf_from_hashkey, hash_expandtable};
use super::util::{get_indextuple_hashkey, hash_any, hash_binsearch, hash_checkpage};
use super::{
    HashMetaPage, HashPageOpaque, hash_max_item_size, HASH_METAPAGE, LH_BUCKET_PAGE,
    LH_META_PAGE, LH_OVERFLOW_PAGE,
};

/// Insert an index entry for the heap tuple at `ht_ctid`. The key datum is
/// hashed and the hash code, not the datum, is what the index stores.
pub fn hash_insert(rel: &mut VRelation, ht_ctid: ItemPointer, datum: &[u8]) -> Result<()> {
    let hashkey = hash_any(datum);
    tracing::debug!(hashkey, "hash insert");

    let mut itup = index_form_tuple(&TupleDesc::single_int_key(), &hashkey.to_le_bytes(), false)?;
    index_tuple_set_tid(&mut itup, ht_ctid);

    hash_doinsert(rel, &itup)
}

/// Place one fully-formed index tuple in its bucket, chaining overflow
/// pages as needed, and split the table when the fill factor is crossed.
pub fn hash_doinsert(rel: &mut VRelation, itup: &[u8]) -> Result<()> {
    let hashkey = get_indextuple_hashkey(itup);
    let itemsz = maxalign(itup.len());

    // The metapage version pins the item-size ceiling; no lock needed to
    // check it.
    let metabuf = hash_getbuf(rel, HASH_METAPAGE, LH_META_PAGE)?;
    if itemsz > hash_max_item_size() {
        rel.release_buffer(metabuf);
        return Err(SoeError::TooLarge {
            size: itemsz,
            max: hash_max_item_size(),
        });
    }

    let (bucket_buf, _metap) = hash_getbucketbuf_from_hashkey(rel, hashkey)?;
    let mut buf = bucket_buf;

    // Walk the bucket chain for a page with room; chain a new overflow page
    // if none has any.
    while page_get_free_space(rel.page(buf)?) < itemsz {
        let opaque = HashPageOpaque::read(rel.page(buf)?);
        let nextblkno = opaque.next_blkno;

        if block_number_is_valid(nextblkno) {
            if buf != bucket_buf {
                rel.release_buffer(buf);
            }
            buf = hash_getbuf(rel, nextblkno, LH_OVERFLOW_PAGE)?;
        } else {
            buf = hash_addovflpage(rel, metabuf, buf, buf == bucket_buf)?;
        }
    }

    hash_pgaddtup(rel, buf, itup)?;
    rel.mark_buffer_dirty(buf)?;
    if buf != bucket_buf {
        rel.release_buffer(buf);
    }
    rel.release_buffer(bucket_buf);

    // Count the tuple and see whether the table has outgrown its buckets.
    let mut meta = HashMetaPage::read(rel.page(metabuf)?)?;
    meta.ntuples += 1.0;
    let do_expand = meta.ntuples > meta.ffactor as f64 * (meta.maxbucket as f64 + 1.0);
    meta.write(rel.page_mut(metabuf)?);
    rel.mark_buffer_dirty(metabuf)?;
    rel.amcache = None;

    if do_expand {
        hash_expandtable(rel, metabuf)?;
    }
    rel.release_buffer(metabuf);
    Ok(())
}

/// Add one tuple to the page, preserving the page's hashkey ordering.
pub fn hash_pgaddtup(rel: &mut VRelation, buf: Buffer, itup: &[u8]) -> Result<crate::common::OffsetNumber> {
    hash_checkpage(rel, buf, LH_BUCKET_PAGE | LH_OVERFLOW_PAGE)?;
    let hashkey = get_indextuple_hashkey(itup);
    let itup_off = hash_binsearch(rel.page(buf)?, hashkey);
    let off = page_add_item(rel.page_mut(buf)?, itup, itup_off, false, false)?;
    if off == INVALID_OFFSET_NUMBER {
        return Err(SoeError::PageFull(
            "failed to add index item to hash page".into(),
        ));
    }
    Ok(off)
}

/// Add a batch of tuples to the page, each at its hashkey-ordered slot.
pub fn hash_pgaddmultitup(rel: &mut VRelation, buf: Buffer, itups: &[Vec<u8>]) -> Result<()> {
    hash_checkpage(rel, buf, LH_BUCKET_PAGE | LH_OVERFLOW_PAGE)?;
    for itup in itups {
        let hashkey = get_indextuple_hashkey(itup);
        let itup_off = hash_binsearch(rel.page(buf)?, hashkey);
        let off = page_add_item(rel.page_mut(buf)?, itup, itup_off, false, false)?;
        if off == INVALID_OFFSET_NUMBER {
            return Err(SoeError::PageFull(
                "failed to add index item to hash page".into(),
            ));
        }
    }
    Ok(())
}
