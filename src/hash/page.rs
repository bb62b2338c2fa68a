//! Hash page management: index creation, buffer fetch helpers, the cached
//! metapage, and table expansion (bucket splits).

use crate::buffer::{Buffer, VRelation};
use crate::common::{
    block_number_is_valid, maxalign, BlockNumber, OffsetNumber, BLCKSZ, FIRST_OFFSET_NUMBER,
    INVALID_BLOCK_NUMBER, P_NEW,
};
use crate::error::{Result, SoeError};
use crate::page::itup::{
    index_tuple_info, index_tuple_set_info, INDEX_MOVED_BY_SPLIT_MASK, INDEX_TUPLE_HEADER_LEN,
};
use crate::page::{
    page_get_free_space_for_multiple_tuples, page_get_item, page_get_item_id,
    page_get_max_offset_number, page_index_multi_delete, ITEM_ID_LEN,
};

use super::insert::hash_pgaddmultitup;
use super::ovfl::{hash_addovflpage, hash_initbitmapbuffer, hash_squeezebucket};
use super::util::{
    bucket_to_blkno, get_totalbuckets, hash_checkpage, hash_log2, hashkey2bucket,
    get_indextuple_hashkey, spareindex,
};
use super::{
    hash_get_max_bitmap_size, Bucket, HashMetaPage, HashPageOpaque, HASHO_PAGE_ID,
    HASH_DEFAULT_FILLFACTOR, HASH_MAGIC, HASH_MAX_BITMAPS, HASH_MAX_SPLITPOINTS, HASH_METAPAGE,
    HASH_VERSION, INVALID_BUCKET, LH_BUCKET_BEING_POPULATED, LH_BUCKET_BEING_SPLIT,
    LH_BUCKET_NEEDS_SPLIT_CLEANUP, LH_BUCKET_PAGE, LH_META_PAGE, LH_OVERFLOW_PAGE,
};

/// Fetch a page that must already exist; `P_NEW` is disallowed here.
pub fn hash_getbuf(rel: &mut VRelation, blkno: BlockNumber, flags: u16) -> Result<Buffer> {
    if blkno == P_NEW {
        return Err(SoeError::Invalid("hash AM does not use P_NEW".into()));
    }
    let buf = rel.read_buffer(blkno)?;
    hash_checkpage(rel, buf, flags)?;
    Ok(buf)
}

/// Fetch a page known to exist that will be rebuilt from scratch.
pub fn hash_getinitbuf(rel: &mut VRelation, blkno: BlockNumber) -> Result<Buffer> {
    if blkno == P_NEW {
        return Err(SoeError::Invalid("hash AM does not use P_NEW".into()));
    }
    let buf = rel.read_buffer(blkno)?;
    hash_pageinit(rel.page_mut(buf)?);
    Ok(buf)
}

/// Get a page at the end of the index, extending it if `blkno` is exactly
/// the current extent.
pub fn hash_getnewbuf(rel: &mut VRelation, blkno: BlockNumber) -> Result<Buffer> {
    let nblocks = rel.number_of_blocks();
    if blkno == nblocks {
        rel.read_buffer(P_NEW)
    } else {
        rel.read_buffer(blkno)
    }
}

/// Initialize a page body for the hash AM's special size.
pub fn hash_pageinit(page: &mut [u8]) {
    crate::page::page_init(page, super::HASH_SPECIAL_SIZE);
}

/// Set up a bucket page's special area. `prev_blkno` of a primary bucket
/// page stores the maxbucket value as of its creation or last split, which
/// lets readers detect a stale cached metapage.
pub fn hash_initbuf(
    rel: &mut VRelation,
    buf: Buffer,
    max_bucket: u32,
    num_bucket: Bucket,
    flag: u16,
    initpage: bool,
) -> Result<()> {
    let blkno = rel.buffer_get_block_number(buf);
    let page = rel.page_mut(buf)?;
    if initpage {
        hash_pageinit(page);
    }
    HashPageOpaque {
        o_blkno: blkno,
        prev_blkno: max_bucket,
        next_blkno: INVALID_BLOCK_NUMBER,
        bucket: num_bucket,
        flag,
        page_id: HASHO_PAGE_ID,
    }
    .write(page);
    Ok(())
}

/// Create the metapage, the initial buckets, and the first bitmap page.
/// Returns the initial bucket count.
pub fn hash_init(
    rel: &mut VRelation,
    num_tuples: f64,
    ffactor_override: Option<u16>,
) -> Result<u32> {
    // Target tuples per bucket from the fill factor; the key datatype is a
    // fixed-width hash code, so the item width is exact.
    let data_width = 4usize;
    let item_width = maxalign(INDEX_TUPLE_HEADER_LEN) + maxalign(data_width) + ITEM_ID_LEN;
    let mut ffactor = ((BLCKSZ * HASH_DEFAULT_FILLFACTOR / 100) / item_width) as u16;
    if ffactor < 10 {
        ffactor = 10;
    }
    if let Some(forced) = ffactor_override {
        ffactor = forced;
    }

    let metabuf = hash_getnewbuf(rel, HASH_METAPAGE)?;
    let meta = hash_init_metabuffer(rel, metabuf, num_tuples, ffactor)?;
    rel.mark_buffer_dirty(metabuf)?;

    let num_buckets = meta.maxbucket + 1;

    for i in 0..num_buckets {
        let blkno = bucket_to_blkno(&meta, i);
        let buf = hash_getnewbuf(rel, blkno)?;
        hash_initbuf(rel, buf, meta.maxbucket, i, LH_BUCKET_PAGE, false)?;
        rel.mark_buffer_dirty(buf)?;
        rel.release_buffer(buf);
    }

    let bitmapbuf = hash_getnewbuf(rel, num_buckets + 1)?;
    hash_initbitmapbuffer(rel, bitmapbuf, meta.bmsize, false)?;
    rel.mark_buffer_dirty(bitmapbuf)?;

    // Register the bitmap in the metapage.
    let mut meta = HashMetaPage::read(rel.page(metabuf)?)?;
    if meta.nmaps as usize >= HASH_MAX_BITMAPS {
        return Err(SoeError::PageFull(
            "out of overflow pages in hash index".into(),
        ));
    }
    meta.mapp[meta.nmaps as usize] = num_buckets + 1;
    meta.nmaps += 1;
    meta.write(rel.page_mut(metabuf)?);
    rel.mark_buffer_dirty(metabuf)?;

    rel.release_buffer(bitmapbuf);
    rel.release_buffer(metabuf);
    rel.amcache = None;

    Ok(num_buckets)
}

/// Fill in the metapage for an index expected to hold `num_tuples`.
fn hash_init_metabuffer(
    rel: &mut VRelation,
    buf: Buffer,
    num_tuples: f64,
    ffactor: u16,
) -> Result<HashMetaPage> {
    let dnumbuckets = num_tuples / ffactor as f64;
    let num_buckets = if dnumbuckets <= 2.0 {
        2
    } else if dnumbuckets >= 0x4000_0000 as f64 {
        0x4000_0000
    } else {
        get_totalbuckets(spareindex(dnumbuckets as u32))
    };

    let spare_index = spareindex(num_buckets);

    let bsize = hash_get_max_bitmap_size();
    let mut i = hash_log2(bsize as u32);
    while i > 0 && (1usize << i) > bsize {
        i -= 1;
    }
    let bmsize = 1u32 << i;
    let bmshift = i + super::BYTE_TO_BIT;

    let mut meta = HashMetaPage {
        magic: HASH_MAGIC,
        version: HASH_VERSION,
        ntuples: 0.0,
        ffactor,
        bsize: bsize as u16,
        bmsize: bmsize as u16,
        bmshift: bmshift as u16,
        maxbucket: num_buckets - 1,
        highmask: (1 << hash_log2(num_buckets + 1)) - 1,
        lowmask: ((1u32 << hash_log2(num_buckets + 1)) - 1) >> 1,
        ovflpoint: spare_index,
        firstfree: 0,
        nmaps: 0,
        procid: 0,
        spares: [0; HASH_MAX_SPLITPOINTS],
        mapp: vec![0; HASH_MAX_BITMAPS],
    };
    // One spare page (the first bitmap) past the initial splitpoints.
    meta.spares[spare_index as usize] = 1;

    let blkno = rel.buffer_get_block_number(buf);
    let page = rel.page_mut(buf)?;
    HashPageOpaque {
        o_blkno: blkno,
        prev_blkno: INVALID_BLOCK_NUMBER,
        next_blkno: INVALID_BLOCK_NUMBER,
        bucket: INVALID_BUCKET,
        flag: LH_META_PAGE,
        page_id: HASHO_PAGE_ID,
    }
    .write(page);
    meta.write(page);

    Ok(meta)
}

/// Cached metapage contents, refreshed from block 0 when missing or forced.
pub fn hash_getcachedmetap(rel: &mut VRelation, force_refresh: bool) -> Result<HashMetaPage> {
    if force_refresh || rel.amcache.is_none() {
        let metabuf = hash_getbuf(rel, HASH_METAPAGE, LH_META_PAGE)?;
        let meta = HashMetaPage::read(rel.page(metabuf)?)?;
        rel.release_buffer(metabuf);
        rel.amcache = Some(meta);
    }
    Ok(rel.amcache.clone().expect("metapage cache populated above"))
}

/// Locate and fetch the primary bucket page for `hashkey` using the cached
/// metapage. Returns the bucket buffer and the metapage contents used for
/// the mapping.
pub fn hash_getbucketbuf_from_hashkey(
    rel: &mut VRelation,
    hashkey: u32,
) -> Result<(Buffer, HashMetaPage)> {
    let metap = hash_getcachedmetap(rel, false)?;

    let bucket = hashkey2bucket(hashkey, metap.maxbucket, metap.highmask, metap.lowmask);
    let blkno = bucket_to_blkno(&metap, bucket);
    let buf = hash_getbuf(rel, blkno, LH_BUCKET_PAGE)?;

    // A primary bucket page records the maxbucket value it was created or
    // last split under; a larger value than the cached metapage's means the
    // cache is stale.
    let opaque = HashPageOpaque::read(rel.page(buf)?);
    if opaque.prev_blkno != INVALID_BLOCK_NUMBER && opaque.prev_blkno > metap.maxbucket {
        rel.release_buffer(buf);
        let metap = hash_getcachedmetap(rel, true)?;
        let bucket = hashkey2bucket(hashkey, metap.maxbucket, metap.highmask, metap.lowmask);
        let blkno = bucket_to_blkno(&metap, bucket);
        let buf = hash_getbuf(rel, blkno, LH_BUCKET_PAGE)?;
        return Ok((buf, metap));
    }

    Ok((buf, metap))
}

/// Grow the table by one bucket, splitting the bucket that maps onto the
/// new one.
pub fn hash_expandtable(rel: &mut VRelation, metabuf: Buffer) -> Result<()> {
    hash_checkpage(rel, metabuf, LH_META_PAGE)?;
    let mut meta = HashMetaPage::read(rel.page(metabuf)?)?;

    // Re-check: must stay in sync with the insert path's test.
    if meta.ntuples <= meta.ffactor as f64 * (meta.maxbucket as f64 + 1.0) {
        return Ok(());
    }

    // maxbucket + 1 must not overflow, and spares[] has finite room.
    if meta.maxbucket >= 0x7FFF_FFFE {
        return Err(SoeError::PageFull(
            "hash index cannot split: maxbucket saturated".into(),
        ));
    }

    let new_bucket = meta.maxbucket + 1;
    let old_bucket = new_bucket & meta.lowmask;
    let start_oblkno = bucket_to_blkno(&meta, old_bucket);
    let buf_oblkno = hash_getbuf(rel, start_oblkno, LH_BUCKET_PAGE)?;

    // Safe to compute before the mapping update: spares[ovflpoint] already
    // reflects where the new splitpoint's buckets will go.
    let start_nblkno = bucket_to_blkno(&meta, new_bucket);

    // A new splitpoint phase needs its whole batch of bucket pages
    // allocated up front.
    let spare_ndx = spareindex(new_bucket + 1);
    if spare_ndx > meta.ovflpoint {
        let buckets_to_add = get_totalbuckets(spare_ndx) - new_bucket;
        tracing::debug!(buckets_to_add, "allocating bucket batch for new splitpoint");
        hash_alloc_buckets(rel, start_nblkno, buckets_to_add)?;
    }

    let buf_nblkno = hash_getnewbuf(rel, start_nblkno)?;

    // Update the metapage mapping info.
    meta.maxbucket = new_bucket;
    if new_bucket > meta.highmask {
        // Starting a new doubling.
        meta.lowmask = meta.highmask;
        meta.highmask = new_bucket | meta.lowmask;
    }
    if spare_ndx > meta.ovflpoint {
        meta.spares[spare_ndx as usize] = meta.spares[meta.ovflpoint as usize];
        meta.ovflpoint = spare_ndx;
    }
    meta.write(rel.page_mut(metabuf)?);
    rel.mark_buffer_dirty(metabuf)?;
    rel.amcache = None;

    let maxbucket = meta.maxbucket;
    let highmask = meta.highmask;
    let lowmask = meta.lowmask;

    // Mark the old bucket as being split; refresh its creation stamp.
    {
        let page = rel.page_mut(buf_oblkno)?;
        let mut oopaque = HashPageOpaque::read(page);
        oopaque.flag |= LH_BUCKET_BEING_SPLIT;
        oopaque.prev_blkno = maxbucket;
        oopaque.write(page);
    }
    rel.mark_buffer_dirty(buf_oblkno)?;

    // Initialize the new bucket's primary page.
    {
        let nblkno = rel.buffer_get_block_number(buf_nblkno);
        let page = rel.page_mut(buf_nblkno)?;
        HashPageOpaque {
            o_blkno: nblkno,
            prev_blkno: maxbucket,
            next_blkno: INVALID_BLOCK_NUMBER,
            bucket: new_bucket,
            flag: LH_BUCKET_PAGE | LH_BUCKET_BEING_POPULATED,
            page_id: HASHO_PAGE_ID,
        }
        .write(page);
    }
    rel.mark_buffer_dirty(buf_nblkno)?;

    hash_splitbucket(
        rel, metabuf, old_bucket, new_bucket, buf_oblkno, buf_nblkno, maxbucket, highmask,
        lowmask,
    )?;

    rel.release_buffer(buf_oblkno);
    rel.release_buffer(buf_nblkno);
    Ok(())
}

/// Allocate a new splitpoint's worth of bucket pages. The oblivious file is
/// already fully pre-allocated; this only grows the virtual extent so the
/// buckets become addressable.
fn hash_alloc_buckets(rel: &mut VRelation, firstblock: BlockNumber, nblocks: u32) -> Result<()> {
    for index in 0..nblocks {
        let buf = hash_getnewbuf(rel, firstblock + index)?;
        rel.mark_buffer_dirty(buf)?;
        rel.release_buffer(buf);
    }
    Ok(())
}

/// Partition the old bucket's tuples between old and new bucket. Tuples
/// moving to the new bucket are copied there (tagged as moved-by-split);
/// the stale copies are removed afterwards by [`hash_bucket_cleanup`].
#[allow(clippy::too_many_arguments)]
fn hash_splitbucket(
    rel: &mut VRelation,
    metabuf: Buffer,
    obucket: Bucket,
    nbucket: Bucket,
    obuf: Buffer,
    nbuf: Buffer,
    maxbucket: u32,
    highmask: u32,
    lowmask: u32,
) -> Result<()> {
    let bucket_obuf = obuf;
    let bucket_nbuf = nbuf;
    let mut obuf = obuf;
    let mut nbuf = nbuf;

    let mut itups: Vec<Vec<u8>> = Vec::new();
    let mut all_tups_size = 0usize;

    loop {
        let (oblkno, moved) = {
            let opage = rel.page(obuf)?;
            let oopaque = HashPageOpaque::read(opage);
            let omaxoff = page_get_max_offset_number(opage);

            let mut moved: Vec<Vec<u8>> = Vec::new();
            for ooffnum in FIRST_OFFSET_NUMBER..=omaxoff {
                let item_id = page_get_item_id(opage, ooffnum);
                if item_id.is_dead() {
                    continue;
                }
                let itup = page_get_item(opage, item_id);
                let bucket = hashkey2bucket(
                    get_indextuple_hashkey(itup),
                    maxbucket,
                    highmask,
                    lowmask,
                );
                if bucket == nbucket {
                    let mut new_itup = itup.to_vec();
                    let info = index_tuple_info(&new_itup) | INDEX_MOVED_BY_SPLIT_MASK;
                    index_tuple_set_info(&mut new_itup, info);
                    moved.push(new_itup);
                }
            }
            (oopaque.next_blkno, moved)
        };

        for new_itup in moved {
            let itemsz = maxalign(new_itup.len());
            if page_get_free_space_for_multiple_tuples(rel.page(nbuf)?, itups.len() + 1)
                < all_tups_size + itemsz
            {
                hash_pgaddmultitup(rel, nbuf, &itups)?;
                rel.mark_buffer_dirty(nbuf)?;
                itups.clear();
                all_tups_size = 0;
                // Chain to a fresh overflow page in the new bucket.
                nbuf = hash_addovflpage(rel, metabuf, nbuf, nbuf == bucket_nbuf)?;
            }
            all_tups_size += itemsz;
            itups.push(new_itup);
        }

        if obuf != bucket_obuf {
            rel.release_buffer(obuf);
        }

        if !block_number_is_valid(oblkno) {
            hash_pgaddmultitup(rel, nbuf, &itups)?;
            rel.mark_buffer_dirty(nbuf)?;
            if nbuf != bucket_nbuf {
                rel.release_buffer(nbuf);
            }
            itups.clear();
            break;
        }

        obuf = hash_getbuf(rel, oblkno, LH_OVERFLOW_PAGE)?;
    }

    // Both chains are in their final shape: clear the in-progress flags and
    // queue the old bucket for cleanup.
    {
        let opage = rel.page_mut(bucket_obuf)?;
        let mut oopaque = HashPageOpaque::read(opage);
        oopaque.flag &= !LH_BUCKET_BEING_SPLIT;
        oopaque.flag |= LH_BUCKET_NEEDS_SPLIT_CLEANUP;
        oopaque.write(opage);
    }
    {
        let npage = rel.page_mut(bucket_nbuf)?;
        let mut nopaque = HashPageOpaque::read(npage);
        nopaque.flag &= !LH_BUCKET_BEING_POPULATED;
        nopaque.write(npage);
    }
    rel.mark_buffer_dirty(bucket_obuf)?;
    rel.mark_buffer_dirty(bucket_nbuf)?;

    let bucket_blkno = rel.buffer_get_block_number(bucket_obuf);
    hash_bucket_cleanup(
        rel,
        obucket,
        bucket_obuf,
        bucket_blkno,
        maxbucket,
        highmask,
        lowmask,
    )
}

/// Delete the tuples on the old bucket chain whose mapping now disagrees
/// with it (the ones copied to the new bucket), then squeeze the chain.
pub fn hash_bucket_cleanup(
    rel: &mut VRelation,
    cur_bucket: Bucket,
    bucket_buf: Buffer,
    bucket_blkno: BlockNumber,
    maxbucket: u32,
    highmask: u32,
    lowmask: u32,
) -> Result<()> {
    let mut blkno = bucket_blkno;
    let mut buf = bucket_buf;
    let mut bucket_dirty = false;

    loop {
        let (next_blkno, deletable) = {
            let page = rel.page(buf)?;
            let opaque = HashPageOpaque::read(page);
            let maxoffno = page_get_max_offset_number(page);

            let mut deletable: Vec<OffsetNumber> = Vec::new();
            for offno in FIRST_OFFSET_NUMBER..=maxoffno {
                let itup = page_get_item(page, page_get_item_id(page, offno));
                let bucket = hashkey2bucket(
                    get_indextuple_hashkey(itup),
                    maxbucket,
                    highmask,
                    lowmask,
                );
                // Tuples either belong here or were moved by the split;
                // nothing else can appear on this chain.
                if bucket != cur_bucket {
                    deletable.push(offno);
                }
            }
            (opaque.next_blkno, deletable)
        };

        let retain_pin = blkno == bucket_blkno;
        blkno = next_blkno;

        if !deletable.is_empty() {
            page_index_multi_delete(rel.page_mut(buf)?, &deletable)?;
            bucket_dirty = true;
            rel.mark_buffer_dirty(buf)?;
        }

        if !block_number_is_valid(blkno) {
            break;
        }

        let next_buf = hash_getbuf(rel, blkno, LH_OVERFLOW_PAGE)?;
        if !retain_pin {
            rel.release_buffer(buf);
        }
        buf = next_buf;
    }

    if buf != bucket_buf {
        rel.release_buffer(buf);
    }

    // Clear the garbage flag before squeezing.
    {
        let page = rel.page_mut(bucket_buf)?;
        let mut opaque = HashPageOpaque::read(page);
        opaque.flag &= !LH_BUCKET_NEEDS_SPLIT_CLEANUP;
        opaque.write(page);
    }
    rel.mark_buffer_dirty(bucket_buf)?;

    if bucket_dirty {
        hash_squeezebucket(rel, cur_bucket, bucket_blkno, bucket_buf)?;
    }
    Ok(())
}
