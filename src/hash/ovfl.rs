//! Overflow page management: allocation against the free-page bitmaps,
//! recycling, and the backward "squeeze" pass that packs a bucket chain
//! after deletions.

use crate::buffer::{Buffer, VRelation};
use crate::common::{
    block_number_is_valid, maxalign, BlockNumber, OffsetNumber, FIRST_OFFSET_NUMBER,
    INVALID_BLOCK_NUMBER,
};
use crate::error::{Result, SoeError};
use crate::page::{
    page_get_free_space_for_multiple_tuples, page_get_item, page_get_item_id,
    page_get_max_offset_number, page_index_multi_delete, page_set_contents_len,
};

use super::insert::hash_pgaddmultitup;
use super::page::{hash_getbuf, hash_getinitbuf, hash_getnewbuf, hash_pageinit};
use super::util::{get_totalbuckets, hash_checkpage};
use super::{
    Bucket, HashMetaPage, HashPageOpaque, ALL_SET, BITS_PER_MAP, HASHO_PAGE_ID, HASH_MAX_BITMAPS,
    HASH_METAPAGE, INVALID_BUCKET, LH_BITMAP_PAGE, LH_BUCKET_PAGE, LH_META_PAGE, LH_OVERFLOW_PAGE,
    LH_UNUSED_PAGE,
};

/// Convert a bit number in the free-page bitmaps to the block number of the
/// overflow page it tracks.
pub fn bitno_to_blkno(metap: &HashMetaPage, ovflbitnum: u32) -> BlockNumber {
    let splitnum = metap.ovflpoint;

    // Bit numbers are zero-based, page numbers one-based.
    let ovflbitnum = ovflbitnum + 1;

    let mut i = 1;
    while i < splitnum && ovflbitnum > metap.spares[i as usize] {
        i += 1;
    }

    // Add the bucket pages that precede this splitpoint.
    get_totalbuckets(i) + ovflbitnum
}

/// Inverse of [`bitno_to_blkno`].
pub fn ovflblkno_to_bitno(metap: &HashMetaPage, ovflblkno: BlockNumber) -> Result<u32> {
    let splitnum = metap.ovflpoint;

    for i in 1..=splitnum {
        if ovflblkno <= get_totalbuckets(i) {
            break;
        }
        let bitnum = ovflblkno - get_totalbuckets(i);
        // The overflow pages of splitpoint i start right after the pages of
        // every earlier splitpoint.
        if bitnum > metap.spares[(i - 1) as usize] && bitnum <= metap.spares[i as usize] {
            return Ok(bitnum - 1);
        }
    }
    Err(SoeError::Invalid(format!(
        "invalid overflow block number {ovflblkno}"
    )))
}

/// Number of the first clear bit in `map`.
fn hash_firstfreebit(map: u32) -> Result<u32> {
    for i in 0..BITS_PER_MAP {
        if map & (1 << i) == 0 {
            return Ok(i);
        }
    }
    Err(SoeError::Invalid("firstfreebit found no free bit".into()))
}

fn bitmap_word(page: &[u8], j: usize) -> u32 {
    let c = crate::page::page_get_contents(page);
    u32::from_le_bytes([c[j * 4], c[j * 4 + 1], c[j * 4 + 2], c[j * 4 + 3]])
}

fn bitmap_set_bit(page: &mut [u8], bit: u32) {
    let c = crate::page::page_get_contents_mut(page);
    let j = (bit / BITS_PER_MAP) as usize * 4;
    let mut word = u32::from_le_bytes([c[j], c[j + 1], c[j + 2], c[j + 3]]);
    word |= 1 << (bit % BITS_PER_MAP);
    c[j..j + 4].copy_from_slice(&word.to_le_bytes());
}

fn bitmap_clear_bit(page: &mut [u8], bit: u32) {
    let c = crate::page::page_get_contents_mut(page);
    let j = (bit / BITS_PER_MAP) as usize * 4;
    let mut word = u32::from_le_bytes([c[j], c[j + 1], c[j + 2], c[j + 3]]);
    word &= !(1 << (bit % BITS_PER_MAP));
    c[j..j + 4].copy_from_slice(&word.to_le_bytes());
}

pub fn bitmap_bit_is_set(page: &[u8], bit: u32) -> bool {
    bitmap_word(page, (bit / BITS_PER_MAP) as usize) & (1 << (bit % BITS_PER_MAP)) != 0
}

/// Initialize a bitmap page with every bit set: pages not yet allocated are
/// conveniently pre-marked "in use".
pub fn hash_initbitmapbuffer(
    rel: &mut VRelation,
    buf: Buffer,
    bmsize: u16,
    initpage: bool,
) -> Result<()> {
    let blkno = rel.buffer_get_block_number(buf);
    let page = rel.page_mut(buf)?;
    if initpage {
        hash_pageinit(page);
    }
    HashPageOpaque {
        o_blkno: blkno,
        prev_blkno: INVALID_BLOCK_NUMBER,
        next_blkno: INVALID_BLOCK_NUMBER,
        bucket: INVALID_BUCKET,
        flag: LH_BITMAP_PAGE,
        page_id: HASHO_PAGE_ID,
    }
    .write(page);

    let contents = crate::page::page_get_contents_mut(page);
    contents[..bmsize as usize].fill(0xFF);
    // Cover the bit array with pd_lower to keep the tail compressible.
    page_set_contents_len(page, bmsize as usize);
    Ok(())
}

/// Add an overflow page to the bucket whose chain contains `buf`, returning
/// the new page's buffer. The pin on `buf`'s tail is dropped unless
/// `retain_pin` marks it as the primary bucket page.
pub fn hash_addovflpage(
    rel: &mut VRelation,
    metabuf: Buffer,
    buf: Buffer,
    retain_pin: bool,
) -> Result<Buffer> {
    hash_checkpage(rel, buf, LH_BUCKET_PAGE | LH_OVERFLOW_PAGE)?;

    // Walk to the current tail of the chain.
    let mut tail = buf;
    loop {
        let opaque = HashPageOpaque::read(rel.page(tail)?);
        if !block_number_is_valid(opaque.next_blkno) {
            break;
        }
        let next = hash_getbuf(rel, opaque.next_blkno, LH_OVERFLOW_PAGE)?;
        if tail != buf {
            rel.release_buffer(tail);
        }
        tail = next;
    }

    hash_checkpage(rel, metabuf, LH_META_PAGE)?;
    let mut meta = HashMetaPage::read(rel.page(metabuf)?)?;

    // Search the bitmap pages, starting at the cached lower bound, for a
    // recycled overflow page.
    let orig_firstfree = meta.firstfree;
    let first_page = orig_firstfree >> meta.bmpg_shift();
    let mut bit = orig_firstfree & meta.bmpg_mask();
    let mut i = first_page;
    let mut j = bit / BITS_PER_MAP;
    bit &= !(BITS_PER_MAP - 1);

    let mut page_found = false;
    let mut bitmap_page_bit = 0u32;
    let mut mapbuf: Option<Buffer> = None;
    let mut newmapbuf: Option<Buffer> = None;
    let mut ovflbuf: Option<Buffer> = None;
    let mut chosen_bit = 0u32;

    let splitnum = meta.ovflpoint;
    let mut last_bit = 0u32;

    'bitmaps: loop {
        let max_ovflpg = meta.spares[splitnum as usize] - 1;
        let last_page = max_ovflpg >> meta.bmpg_shift();
        last_bit = max_ovflpg & meta.bmpg_mask();

        if i > last_page {
            break;
        }

        let mapblkno = meta.mapp[i as usize];
        let last_inpage = if i == last_page {
            last_bit
        } else {
            meta.bmpg_bits() - 1
        };

        let mbuf = hash_getbuf(rel, mapblkno, LH_BITMAP_PAGE)?;
        while bit <= last_inpage {
            let word = bitmap_word(rel.page(mbuf)?, j as usize);
            if word != ALL_SET {
                page_found = true;
                bit += hash_firstfreebit(word)?;
                bitmap_page_bit = bit;
                // Absolute bit number across bitmap pages.
                bit += i << meta.bmpg_shift();
                let blkno = bitno_to_blkno(&meta, bit);
                tracing::debug!(blkno, "reusing recycled overflow page");
                ovflbuf = Some(hash_getinitbuf(rel, blkno)?);
                mapbuf = Some(mbuf);
                chosen_bit = bit;
                break 'bitmaps;
            }
            j += 1;
            bit += BITS_PER_MAP;
        }

        rel.release_buffer(mbuf);
        i += 1;
        j = 0;
        bit = 0;
    }

    if ovflbuf.is_none() {
        // No free pages: extend the index. A new bitmap page comes first
        // when the last one's range is exhausted.
        if last_bit == meta.bmpg_bits() - 1 {
            let map_bit = meta.spares[splitnum as usize];
            if meta.nmaps as usize >= HASH_MAX_BITMAPS {
                return Err(SoeError::PageFull(
                    "out of overflow pages in hash index".into(),
                ));
            }
            let map_blkno = bitno_to_blkno(&meta, map_bit);
            newmapbuf = Some(hash_getnewbuf(rel, map_blkno)?);
        }

        let bit = if newmapbuf.is_some() {
            meta.spares[splitnum as usize] + 1
        } else {
            meta.spares[splitnum as usize]
        };
        let blkno = bitno_to_blkno(&meta, bit);
        ovflbuf = Some(hash_getnewbuf(rel, blkno)?);
        chosen_bit = bit;
    }

    let ovflbuf = ovflbuf.expect("overflow buffer chosen above");

    if page_found {
        let mbuf = mapbuf.expect("bitmap buffer held when a free bit was found");
        bitmap_set_bit(rel.page_mut(mbuf)?, bitmap_page_bit);
        rel.mark_buffer_dirty(mbuf)?;
    } else {
        meta.spares[splitnum as usize] += 1;
        if let Some(nmbuf) = newmapbuf {
            hash_initbitmapbuffer(rel, nmbuf, meta.bmsize, false)?;
            rel.mark_buffer_dirty(nmbuf)?;
            meta.mapp[meta.nmaps as usize] = rel.buffer_get_block_number(nmbuf);
            meta.nmaps += 1;
            meta.spares[splitnum as usize] += 1;
        }
        meta.write(rel.page_mut(metabuf)?);
        rel.mark_buffer_dirty(metabuf)?;
        // A brand-new page's bit is pre-set "in use" in its bitmap.
    }

    if meta.firstfree == orig_firstfree {
        meta.firstfree = chosen_bit + 1;
        meta.write(rel.page_mut(metabuf)?);
        rel.mark_buffer_dirty(metabuf)?;
    }
    rel.amcache = None;

    // Initialize the new overflow page and chain it in.
    let tail_opaque = HashPageOpaque::read(rel.page(tail)?);
    {
        let ovfl_blkno = rel.buffer_get_block_number(ovflbuf);
        let page = rel.page_mut(ovflbuf)?;
        HashPageOpaque {
            o_blkno: ovfl_blkno,
            prev_blkno: tail,
            next_blkno: INVALID_BLOCK_NUMBER,
            bucket: tail_opaque.bucket,
            flag: LH_OVERFLOW_PAGE,
            page_id: HASHO_PAGE_ID,
        }
        .write(page);
    }
    rel.mark_buffer_dirty(ovflbuf)?;

    {
        let ovfl_blkno = rel.buffer_get_block_number(ovflbuf);
        let page = rel.page_mut(tail)?;
        let mut opaque = HashPageOpaque::read(page);
        opaque.next_blkno = ovfl_blkno;
        opaque.write(page);
    }
    rel.mark_buffer_dirty(tail)?;

    if !retain_pin || tail != buf {
        rel.release_buffer(tail);
    }
    if let Some(mbuf) = mapbuf {
        rel.release_buffer(mbuf);
    }
    if let Some(nmbuf) = newmapbuf {
        rel.release_buffer(nmbuf);
    }

    Ok(ovflbuf)
}

/// Remove `ovflbuf` from its bucket chain, clear its bitmap bit, and place
/// the carried tuples on the write page. Returns the block that followed
/// the freed page.
pub fn hash_freeovflpage(
    rel: &mut VRelation,
    _bucketbuf: Buffer,
    ovflbuf: Buffer,
    wbuf: Buffer,
    itups: &[Vec<u8>],
) -> Result<BlockNumber> {
    hash_checkpage(rel, ovflbuf, LH_OVERFLOW_PAGE)?;
    let ovflblkno = rel.buffer_get_block_number(ovflbuf);
    let ovflopaque = HashPageOpaque::read(rel.page(ovflbuf)?);
    let nextblkno = ovflopaque.next_blkno;
    let prevblkno = ovflopaque.prev_blkno;
    let writeblkno = rel.buffer_get_block_number(wbuf);

    // The chain is doubly linked; fix up both neighbors.
    let prevbuf = if block_number_is_valid(prevblkno) {
        if prevblkno == writeblkno {
            Some(wbuf)
        } else {
            Some(hash_getbuf(
                rel,
                prevblkno,
                LH_BUCKET_PAGE | LH_OVERFLOW_PAGE,
            )?)
        }
    } else {
        None
    };
    let nextbuf = if block_number_is_valid(nextblkno) {
        Some(hash_getbuf(rel, nextblkno, LH_OVERFLOW_PAGE)?)
    } else {
        None
    };

    let metabuf = hash_getbuf(rel, HASH_METAPAGE, LH_META_PAGE)?;
    let mut meta = HashMetaPage::read(rel.page(metabuf)?)?;

    let ovflbitno = ovflblkno_to_bitno(&meta, ovflblkno)?;
    let bitmappage = ovflbitno >> meta.bmpg_shift();
    let bitmapbit = ovflbitno & meta.bmpg_mask();

    if bitmappage >= meta.nmaps {
        return Err(SoeError::Invalid(format!(
            "invalid overflow bit number {ovflbitno}"
        )));
    }
    let blkno = meta.mapp[bitmappage as usize];
    let mapbuf = hash_getbuf(rel, blkno, LH_BITMAP_PAGE)?;

    // Insert the carried tuples on the write page, preserving hashkey
    // ordering.
    if !itups.is_empty() {
        hash_pgaddmultitup(rel, wbuf, itups)?;
        rel.mark_buffer_dirty(wbuf)?;
    }

    // Reinitialize the freed page as unused.
    {
        let page = rel.page_mut(ovflbuf)?;
        hash_pageinit(page);
        HashPageOpaque {
            o_blkno: ovflblkno,
            prev_blkno: INVALID_BLOCK_NUMBER,
            next_blkno: INVALID_BLOCK_NUMBER,
            bucket: INVALID_BUCKET,
            flag: LH_UNUSED_PAGE,
            page_id: HASHO_PAGE_ID,
        }
        .write(page);
    }
    rel.mark_buffer_dirty(ovflbuf)?;

    if let Some(pbuf) = prevbuf {
        let page = rel.page_mut(pbuf)?;
        let mut opaque = HashPageOpaque::read(page);
        opaque.next_blkno = nextblkno;
        opaque.write(page);
        rel.mark_buffer_dirty(pbuf)?;
    }
    if let Some(nbuf) = nextbuf {
        let page = rel.page_mut(nbuf)?;
        let mut opaque = HashPageOpaque::read(page);
        opaque.prev_blkno = prevblkno;
        opaque.write(page);
        rel.mark_buffer_dirty(nbuf)?;
    }

    bitmap_clear_bit(rel.page_mut(mapbuf)?, bitmapbit);
    rel.mark_buffer_dirty(mapbuf)?;

    if ovflbitno < meta.firstfree {
        meta.firstfree = ovflbitno;
        meta.write(rel.page_mut(metabuf)?);
        rel.mark_buffer_dirty(metabuf)?;
        rel.amcache = None;
    }

    if let Some(pbuf) = prevbuf {
        if prevblkno != writeblkno {
            rel.release_buffer(pbuf);
        }
    }
    rel.release_buffer(ovflbuf);
    if let Some(nbuf) = nextbuf {
        rel.release_buffer(nbuf);
    }
    rel.release_buffer(mapbuf);
    rel.release_buffer(metabuf);

    Ok(nextblkno)
}

/// Pack the bucket's tuples toward the head of its chain, freeing emptied
/// overflow pages from the tail. The "read" page walks backward from the
/// chain tail while the "write" page walks forward from the primary page;
/// the pass ends when they meet.
pub fn hash_squeezebucket(
    rel: &mut VRelation,
    _bucket: Bucket,
    bucket_blkno: BlockNumber,
    bucket_buf: Buffer,
) -> Result<()> {
    let mut wblkno = bucket_blkno;
    let mut wbuf = bucket_buf;
    let mut wopaque = HashPageOpaque::read(rel.page(wbuf)?);

    // Nothing to squeeze without overflow pages.
    if !block_number_is_valid(wopaque.next_blkno) {
        return Ok(());
    }

    // Find the chain tail.
    let mut rbuf: Option<Buffer> = None;
    let mut ropaque = wopaque;
    let mut rblkno;
    loop {
        rblkno = ropaque.next_blkno;
        if let Some(prev) = rbuf {
            rel.release_buffer(prev);
        }
        let buf = hash_getbuf(rel, rblkno, LH_OVERFLOW_PAGE)?;
        ropaque = HashPageOpaque::read(rel.page(buf)?);
        rbuf = Some(buf);
        if !block_number_is_valid(ropaque.next_blkno) {
            break;
        }
    }
    let mut rbuf = rbuf.expect("bucket chain has at least one overflow page");

    loop {
        let mut deletable: Vec<OffsetNumber> = Vec::new();
        let mut itups: Vec<Vec<u8>> = Vec::new();
        let mut all_tups_size = 0usize;
        let mut retain_pin = false;

        'readpage: loop {
            let maxroffnum = page_get_max_offset_number(rel.page(rbuf)?);
            let mut roffnum = FIRST_OFFSET_NUMBER;
            while roffnum <= maxroffnum {
                let (itup, itemsz) = {
                    let rpage = rel.page(rbuf)?;
                    let item_id = page_get_item_id(rpage, roffnum);
                    if item_id.is_dead() {
                        roffnum += 1;
                        continue;
                    }
                    let itup = page_get_item(rpage, item_id).to_vec();
                    let itemsz = maxalign(itup.len());
                    (itup, itemsz)
                };

                // Walk the write side forward until the accumulated batch
                // plus this item fits.
                let mut tups_moved = false;
                while page_get_free_space_for_multiple_tuples(rel.page(wbuf)?, itups.len() + 1)
                    < all_tups_size + itemsz
                {
                    if wblkno == bucket_blkno {
                        retain_pin = true;
                    }
                    wblkno = wopaque.next_blkno;
                    if !block_number_is_valid(wblkno) {
                        return Err(SoeError::Invalid(
                            "squeeze ran off the end of the bucket chain".into(),
                        ));
                    }

                    let next_wbuf = if wblkno != rblkno {
                        Some(hash_getbuf(rel, wblkno, LH_OVERFLOW_PAGE)?)
                    } else {
                        None
                    };

                    if !itups.is_empty() {
                        hash_pgaddmultitup(rel, wbuf, &itups)?;
                        rel.mark_buffer_dirty(wbuf)?;
                        page_index_multi_delete(rel.page_mut(rbuf)?, &deletable)?;
                        rel.mark_buffer_dirty(rbuf)?;
                        tups_moved = true;
                    }

                    if !retain_pin {
                        rel.release_buffer(wbuf);
                    }

                    if rblkno == wblkno {
                        // Write caught up with read: everything is packed.
                        rel.release_buffer(rbuf);
                        return Ok(());
                    }

                    wbuf = next_wbuf.expect("write page distinct from read page");
                    wopaque = HashPageOpaque::read(rel.page(wbuf)?);
                    retain_pin = false;
                    itups.clear();
                    all_tups_size = 0;
                    deletable.clear();

                    if tups_moved {
                        // The read page was compacted; rescan it.
                        continue 'readpage;
                    }
                }

                deletable.push(roffnum);
                all_tups_size += itemsz;
                itups.push(itup);
                roffnum += 1;
            }
            break;
        }

        // The read page is (or will be) empty: free it outright, carrying
        // the accumulated tuples to the write page, and step back.
        rblkno = ropaque.prev_blkno;
        hash_freeovflpage(rel, bucket_buf, rbuf, wbuf, &itups)?;

        if rblkno == wblkno {
            if wblkno != bucket_blkno {
                rel.release_buffer(wbuf);
            }
            return Ok(());
        }

        rbuf = hash_getbuf(rel, rblkno, LH_OVERFLOW_PAGE)?;
        ropaque = HashPageOpaque::read(rel.page(rbuf)?);
    }
}
