//! B-tree insertion: find the leaf, make room (walking right past equal
//! keys when it pays), split when full, and propagate splits upward —
//! growing a new root when the old one splits.

use rand::Rng;

use crate::buffer::{Buffer, VRelation};
use crate::common::{
    maxalign, ItemPointer, OffsetNumber, BLCKSZ, INVALID_OFFSET_NUMBER, P_NEW,
};
use crate::error::{Result, SoeError};
use crate::page::itup::{
    index_form_tuple, index_tuple_set_info, index_tuple_set_natts, index_tuple_set_tid,
    inner_tuple_get_downlink, inner_tuple_set_downlink, INDEX_TUPLE_HEADER_LEN,
};
use crate::page::{
    page_add_item, page_get_exact_free_space, page_get_free_space, page_get_item,
    page_get_item_id, page_get_max_offset_number, ITEM_ID_LEN, SIZE_OF_PAGE_HEADER,
};

use super::page::{bt_getbuf, bt_pageinit};
use super::search::{bt_binsrch, bt_search, BTStackEntry};
use super::utils::{bt_compare, ScanKey};
use super::{
    bt_max_item_size, BTMetaPage, BTPageOpaque, BTP_HAS_GARBAGE, BTP_INCOMPLETE_SPLIT, BTP_ROOT,
    BTP_SPLIT_END, BTREE_METAPAGE, BTREE_DEFAULT_FILLFACTOR, BTREE_NONLEAF_FILLFACTOR,
    BT_SPECIAL_SIZE, P_HIKEY, P_FIRSTKEY, P_NONE,
};

/// Insert one index entry pointing at `ht_ctid`.
///
/// Duplicates are allowed; the returned flag is the (never-implemented)
/// uniqueness verdict and is always false.
pub fn bt_do_insert(rel: &mut VRelation, ht_ctid: ItemPointer, datum: &[u8]) -> Result<bool> {
    let is_unique = false;

    let mut value = datum.to_vec();
    if !value.ends_with(&[0]) {
        value.push(0);
    }
    let desc = rel.tuple_desc.clone();
    let mut itup = index_form_tuple(&desc, &value, false)?;
    index_tuple_set_tid(&mut itup, ht_ctid);

    let itup_scankey = ScanKey::new(rel.foid, datum);

    // Find the first page this key could be on.
    let (mut buf, mut stack) = bt_search(rel, &itup_scankey, false, false)?;

    let offset = bt_findinsertloc(rel, &mut buf, &itup_scankey, &itup)?;
    bt_insertonpg(rel, buf, None, &mut stack, &itup, offset, false)?;

    Ok(is_unique)
}

/// Find the page and offset the new tuple goes to, stepping right from
/// `buf` while the page is full and the key could legally live further
/// right. The walk is capped by a randomized "get tired" bound so runs of
/// equal keys stay O(N).
fn bt_findinsertloc(
    rel: &mut VRelation,
    buf: &mut Buffer,
    scankey: &ScanKey,
    newtup: &[u8],
) -> Result<OffsetNumber> {
    let itemsz = maxalign(newtup.len());
    if itemsz > bt_max_item_size() {
        return Err(SoeError::TooLarge {
            size: itemsz,
            max: bt_max_item_size(),
        });
    }

    let mut movedright = false;
    loop {
        let page = rel.page(*buf)?;
        if page_get_free_space(page) >= itemsz {
            break;
        }
        let opaque = BTPageOpaque::read(page);

        // Stay put (and split) once this is the last legal page, the high
        // key differs, or we got tired of walking.
        if opaque.is_rightmost()
            || bt_compare(scankey, page, P_HIKEY) != 0
            || rand::rng().random_range(0..100) == 0
        {
            break;
        }

        // Step right to the next non-dead page.
        let mut rblkno = opaque.next;
        loop {
            rel.release_buffer(*buf);
            let rbuf = rel.read_buffer(rblkno)?;
            let ropaque = BTPageOpaque::read(rel.page(rbuf)?);
            *buf = rbuf;
            if !ropaque.is_ignorable() {
                break;
            }
            if ropaque.is_rightmost() {
                return Err(SoeError::Invalid("fell off the end of the index".into()));
            }
            rblkno = ropaque.next;
        }
        movedright = true;
    }

    if movedright {
        let opaque = BTPageOpaque::read(rel.page(*buf)?);
        Ok(opaque.first_data_key())
    } else {
        Ok(bt_binsrch(scankey, rel.page(*buf)?, false))
    }
}

/// Insert `itup` on the page in `buf`, splitting it if necessary and
/// propagating the split to the parent. When inserting a downlink,
/// `cbuf` is the left half of the child split whose INCOMPLETE_SPLIT flag
/// gets cleared.
fn bt_insertonpg(
    rel: &mut VRelation,
    buf: Buffer,
    cbuf: Option<Buffer>,
    stack: &mut Vec<BTStackEntry>,
    itup: &[u8],
    newitemoff: OffsetNumber,
    _split_only_page: bool,
) -> Result<()> {
    let opaque = BTPageOpaque::read(rel.page(buf)?);
    if opaque.is_incomplete_split() {
        return Err(SoeError::Invalid(format!(
            "cannot insert into incompletely split page {buf}"
        )));
    }

    let itemsz = maxalign(itup.len());

    if page_get_free_space(rel.page(buf)?) < itemsz {
        let is_root = opaque.is_root();
        let is_only = opaque.is_leftmost() && opaque.is_rightmost();

        let (firstright, newitemonleft) = bt_findsplitloc(rel.page(buf)?, newitemoff, itemsz)?;
        let rbuf = bt_split(
            rel,
            buf,
            cbuf,
            firstright,
            newitemoff,
            itemsz,
            itup,
            newitemonleft,
        )?;

        // The split inserted the tuple; now hook the new right page into
        // the parent (possibly growing a new root).
        bt_insert_parent(rel, buf, rbuf, stack, is_root, is_only)
    } else {
        let itup_blkno = rel.buffer_get_block_number(buf);

        // Only splits and root construction may create minus-infinity
        // items.
        if !opaque.is_leaf() && newitemoff == opaque.first_data_key() {
            return Err(SoeError::Invalid(format!(
                "cannot insert second negative infinity item in block {itup_blkno}"
            )));
        }

        if !bt_pgaddtup(rel.page_mut(buf)?, itup, newitemoff)? {
            return Err(SoeError::PageFull(format!(
                "failed to add new item to block {itup_blkno}"
            )));
        }
        rel.mark_buffer_dirty(buf)?;

        if let Some(cbuf) = cbuf {
            clear_incomplete_split(rel, cbuf)?;
            rel.release_buffer(cbuf);
        }
        rel.release_buffer(buf);
        Ok(())
    }
}

fn clear_incomplete_split(rel: &mut VRelation, buf: Buffer) -> Result<()> {
    {
        let page = rel.page_mut(buf)?;
        let mut opaque = BTPageOpaque::read(page);
        opaque.flags &= !BTP_INCOMPLETE_SPLIT;
        opaque.write(page);
    }
    rel.mark_buffer_dirty(buf)
}

/// Add a tuple to a page at the given offset. The leftmost tuple of a
/// non-leaf page needs no key, so it is stripped to a bare header.
fn bt_pgaddtup(page: &mut [u8], itup: &[u8], itup_off: OffsetNumber) -> Result<bool> {
    let opaque = BTPageOpaque::read(page);
    let trunctuple: Vec<u8>;
    let item: &[u8] = if !opaque.is_leaf() && itup_off == opaque.first_data_key() {
        let mut t = itup[..INDEX_TUPLE_HEADER_LEN].to_vec();
        index_tuple_set_info(&mut t, INDEX_TUPLE_HEADER_LEN as u16);
        index_tuple_set_natts(&mut t, 0);
        trunctuple = t;
        &trunctuple
    } else {
        itup
    };

    Ok(page_add_item(page, item, itup_off, false, false)? != INVALID_OFFSET_NUMBER)
}

struct FindSplitState {
    newitemsz: usize,
    fillfactor: usize,
    is_leaf: bool,
    is_rightmost: bool,
    newitemoff: OffsetNumber,
    leftspace: isize,
    rightspace: isize,
    olddataitemstotal: isize,
    have_split: bool,
    newitemonleft: bool,
    firstright: OffsetNumber,
    best_delta: isize,
}

/// Choose the split point: the first existing tuple that goes to the right
/// page, plus whether the new tuple lands left of it. Aims for equal free
/// space on both halves, or the fill factor on a rightmost page, stopping
/// early at a good-enough imbalance.
fn bt_findsplitloc(
    page: &[u8],
    newitemoff: OffsetNumber,
    newitemsz: usize,
) -> Result<(OffsetNumber, bool)> {
    let opaque = BTPageOpaque::read(page);

    // Passed-in size is MAXALIGNED but lacks its line pointer.
    let newitemsz = newitemsz + ITEM_ID_LEN;
    let leftspace = (BLCKSZ - SIZE_OF_PAGE_HEADER - BT_SPECIAL_SIZE) as isize;
    let mut rightspace = leftspace;

    // The right page inherits the old page's high key.
    if !opaque.is_rightmost() {
        let item_id = page_get_item_id(page, P_HIKEY);
        rightspace -= (maxalign(item_id.len as usize) + ITEM_ID_LEN) as isize;
    }

    let olddataitemstotal = rightspace - page_get_exact_free_space(page) as isize;

    let mut state = FindSplitState {
        newitemsz,
        fillfactor: if opaque.is_leaf() {
            BTREE_DEFAULT_FILLFACTOR
        } else {
            BTREE_NONLEAF_FILLFACTOR
        },
        is_leaf: opaque.is_leaf(),
        is_rightmost: opaque.is_rightmost(),
        newitemoff,
        leftspace,
        rightspace,
        olddataitemstotal,
        have_split: false,
        newitemonleft: false,
        firstright: 0,
        best_delta: 0,
    };

    // Stop at the first split whose imbalance is within pagesize/16 rather
    // than scanning every position.
    let goodenough = leftspace / 16;

    let maxoff = page_get_max_offset_number(page);
    let mut olddataitemstoleft: isize = 0;
    let mut goodenoughfound = false;

    let mut offnum = opaque.first_data_key();
    while offnum <= maxoff {
        let item_id = page_get_item_id(page, offnum);
        let itemsz = (maxalign(item_id.len as usize) + ITEM_ID_LEN) as isize;

        if offnum > newitemoff {
            bt_checksplitloc(&mut state, offnum, true, olddataitemstoleft, itemsz);
        } else if offnum < newitemoff {
            bt_checksplitloc(&mut state, offnum, false, olddataitemstoleft, itemsz);
        } else {
            // The new item splits either side of this position.
            bt_checksplitloc(&mut state, offnum, true, olddataitemstoleft, itemsz);
            bt_checksplitloc(&mut state, offnum, false, olddataitemstoleft, itemsz);
        }

        if state.have_split && state.best_delta <= goodenough {
            goodenoughfound = true;
            break;
        }

        olddataitemstoleft += itemsz;
        offnum += 1;
    }

    // The new item may go at the end, with every old item on the left.
    if newitemoff > maxoff && !goodenoughfound {
        bt_checksplitloc(&mut state, newitemoff, false, olddataitemstotal, 0);
    }

    if !state.have_split {
        return Err(SoeError::PageFull(
            "could not find a feasible split point".into(),
        ));
    }
    Ok((state.firstright, state.newitemonleft))
}

/// Evaluate one candidate split and remember it if it beats the best so far.
fn bt_checksplitloc(
    state: &mut FindSplitState,
    firstoldonright: OffsetNumber,
    newitemonleft: bool,
    olddataitemstoleft: isize,
    firstoldonrightsz: isize,
) {
    let newitemisfirstonright = firstoldonright == state.newitemoff && !newitemonleft;
    let firstrightitemsz = if newitemisfirstonright {
        state.newitemsz as isize
    } else {
        firstoldonrightsz
    };

    let mut leftfree = state.leftspace - olddataitemstoleft;
    let mut rightfree = state.rightspace - (state.olddataitemstotal - olddataitemstoleft);

    // The first right item becomes the left page's high key, charging both
    // sides.
    leftfree -= firstrightitemsz;

    if newitemonleft {
        leftfree -= state.newitemsz as isize;
    } else {
        rightfree -= state.newitemsz as isize;
    }

    // Above the leaf level the first right item sheds its key data.
    if !state.is_leaf {
        rightfree +=
            firstrightitemsz - (maxalign(INDEX_TUPLE_HEADER_LEN) + ITEM_ID_LEN) as isize;
    }

    if leftfree >= 0 && rightfree >= 0 {
        let delta = if state.is_rightmost {
            // Leave (100 - fillfactor)% free on the left of a rightmost
            // split so ascending inserts pack pages.
            (state.fillfactor as isize) * leftfree
                - ((100 - state.fillfactor) as isize) * rightfree
        } else {
            leftfree - rightfree
        };
        let delta = delta.abs();
        if !state.have_split || delta < state.best_delta {
            state.have_split = true;
            state.newitemonleft = newitemonleft;
            state.firstright = firstoldonright;
            state.best_delta = delta;
        }
    }
}

/// Split the page in `buf`, inserting the new tuple into the proper half.
/// Returns the new right sibling, which stays resident along with `buf`.
#[allow(clippy::too_many_arguments)]
fn bt_split(
    rel: &mut VRelation,
    buf: Buffer,
    cbuf: Option<Buffer>,
    firstright: OffsetNumber,
    newitemoff: OffsetNumber,
    _newitemsz: usize,
    newitem: &[u8],
    newitemonleft: bool,
) -> Result<Buffer> {
    let rbuf = bt_getbuf(rel, P_NEW)?;

    let origpage = rel.page(buf)?.to_vec();
    let origpagenumber = rel.buffer_get_block_number(buf);
    let rightpagenumber = rel.buffer_get_block_number(rbuf);

    let oopaque = BTPageOpaque::read(&origpage);
    let isleaf = oopaque.is_leaf();

    // Build both halves in workspace pages; the original is overwritten
    // only once they are complete.
    let mut leftpage = vec![0u8; BLCKSZ];
    bt_pageinit(&mut leftpage);
    let mut rightpage = vec![0u8; BLCKSZ];
    bt_pageinit(&mut rightpage);

    // The split page stops being the root; SPLIT_END and HAS_GARBAGE do
    // not carry over either. The left half keeps INCOMPLETE_SPLIT until
    // its new downlink lands in the parent.
    let mut lflags = oopaque.flags & !(BTP_ROOT | BTP_SPLIT_END | BTP_HAS_GARBAGE);
    let rflags = lflags;
    lflags |= BTP_INCOMPLETE_SPLIT;

    BTPageOpaque {
        prev: oopaque.prev,
        next: rightpagenumber,
        level: oopaque.level,
        flags: lflags,
        o_blkno: oopaque.o_blkno,
    }
    .write(&mut leftpage);
    let mut ropaque = BTPageOpaque {
        prev: origpagenumber,
        next: oopaque.next,
        level: oopaque.level,
        flags: rflags,
        o_blkno: rightpagenumber,
    };
    ropaque.write(&mut rightpage);

    // A non-rightmost page's high key is copied to the right half.
    let mut rightoff = P_HIKEY;
    if !oopaque.is_rightmost() {
        let item = page_get_item(&origpage, page_get_item_id(&origpage, P_HIKEY));
        if page_add_item(&mut rightpage, item, rightoff, false, false)? == INVALID_OFFSET_NUMBER {
            return Err(SoeError::PageFull(format!(
                "failed to add hikey to the right sibling while splitting block {origpagenumber}"
            )));
        }
        rightoff += 1;
    }

    // The left half's new high key is the first key headed right: either
    // the existing item at firstright or the incoming tuple.
    let mut leftoff = P_HIKEY;
    let lefthikey: Vec<u8> = if !newitemonleft && newitemoff == firstright {
        newitem.to_vec()
    } else {
        page_get_item(&origpage, page_get_item_id(&origpage, firstright)).to_vec()
    };
    if page_add_item(&mut leftpage, &lefthikey, leftoff, false, false)? == INVALID_OFFSET_NUMBER {
        return Err(SoeError::PageFull(format!(
            "failed to add hikey to the left sibling while splitting block {origpagenumber}"
        )));
    }
    leftoff += 1;

    // Partition the data items.
    let maxoff = page_get_max_offset_number(&origpage);
    let mut i = oopaque.first_data_key();
    let mut new_item_placed = false;
    while i <= maxoff {
        let item = page_get_item(&origpage, page_get_item_id(&origpage, i)).to_vec();

        if i == newitemoff {
            new_item_placed = true;
            if newitemonleft {
                if !bt_pgaddtup(&mut leftpage, newitem, leftoff)? {
                    return Err(SoeError::PageFull(format!(
                        "failed to add new item to the left sibling while splitting block {origpagenumber}"
                    )));
                }
                leftoff += 1;
            } else {
                if !bt_pgaddtup(&mut rightpage, newitem, rightoff)? {
                    return Err(SoeError::PageFull(format!(
                        "failed to add new item to the right sibling while splitting block {origpagenumber}"
                    )));
                }
                rightoff += 1;
            }
        }

        if i < firstright {
            if !bt_pgaddtup(&mut leftpage, &item, leftoff)? {
                return Err(SoeError::PageFull(format!(
                    "failed to add old item to the left sibling while splitting block {origpagenumber}"
                )));
            }
            leftoff += 1;
        } else {
            if !bt_pgaddtup(&mut rightpage, &item, rightoff)? {
                return Err(SoeError::PageFull(format!(
                    "failed to add old item to the right sibling while splitting block {origpagenumber}"
                )));
            }
            rightoff += 1;
        }
        i += 1;
    }

    // The new item may belong at the very end, which must be the right
    // half (everything-on-the-left could not have required a split).
    if !new_item_placed {
        if !bt_pgaddtup(&mut rightpage, newitem, rightoff)? {
            return Err(SoeError::PageFull(format!(
                "failed to add new item to the right sibling while splitting block {origpagenumber}"
            )));
        }
    }

    // Fix the old right sibling's back-link, if any.
    let sbuf = if !oopaque.is_rightmost() {
        let sbuf = bt_getbuf(rel, oopaque.next)?;
        let sopaque = BTPageOpaque::read(rel.page(sbuf)?);
        if sopaque.prev != origpagenumber {
            return Err(SoeError::Invalid(format!(
                "right sibling's left-link doesn't match: block {} links to {} instead of expected {origpagenumber}",
                oopaque.next, sopaque.prev
            )));
        }
        ropaque.flags |= BTP_SPLIT_END;
        ropaque.write(&mut rightpage);
        Some(sbuf)
    } else {
        None
    };

    // Install both halves and rewire the chain.
    rel.page_mut(buf)?.copy_from_slice(&leftpage);
    rel.page_mut(rbuf)?.copy_from_slice(&rightpage);
    rel.mark_buffer_dirty(buf)?;
    rel.mark_buffer_dirty(rbuf)?;

    if let Some(sbuf) = sbuf {
        {
            let spage = rel.page_mut(sbuf)?;
            let mut sopaque = BTPageOpaque::read(spage);
            sopaque.prev = rightpagenumber;
            sopaque.write(spage);
        }
        rel.mark_buffer_dirty(sbuf)?;
        rel.release_buffer(sbuf);
    }

    // Inserting the downlink for a child split finishes that split.
    if !isleaf {
        if let Some(cbuf) = cbuf {
            clear_incomplete_split(rel, cbuf)?;
            rel.release_buffer(cbuf);
        }
    }

    Ok(rbuf)
}

/// Insert the downlink for `rbuf` into the parent after a split, creating a
/// new root when the true root was split.
fn bt_insert_parent(
    rel: &mut VRelation,
    buf: Buffer,
    rbuf: Buffer,
    stack: &mut Vec<BTStackEntry>,
    is_root: bool,
    is_only: bool,
) -> Result<()> {
    if is_root {
        let rootbuf = bt_newroot(rel, buf, rbuf)?;
        tracing::debug!(rootbuf, "root split, new root installed");
        rel.release_buffer(rootbuf);
        rel.release_buffer(rbuf);
        rel.release_buffer(buf);
        return Ok(());
    }

    let bknum = rel.buffer_get_block_number(buf);
    let rbknum = rel.buffer_get_block_number(rbuf);

    // The left page's high key is the lower bound for the new right page;
    // it becomes the parent's downlink tuple for rbuf.
    let mut new_item = {
        let page = rel.page(buf)?;
        page_get_item(page, page_get_item_id(page, P_HIKEY)).to_vec()
    };
    inner_tuple_set_downlink(&mut new_item, rbknum);

    let mut entry = stack.pop().ok_or_else(|| {
        SoeError::Invalid("split of a non-root page with an empty parent stack".into())
    })?;
    entry.btentry = bknum;

    let pbuf = bt_getstackbuf(rel, &mut entry)?;

    rel.release_buffer(rbuf);

    let pbuf = pbuf.ok_or_else(|| {
        SoeError::Invalid(format!(
            "failed to re-find parent key in index for split pages {bknum}/{rbknum}"
        ))
    })?;

    bt_insertonpg(
        rel,
        pbuf,
        Some(buf),
        stack,
        &new_item,
        entry.offset + 1,
        is_only,
    )
}

/// Re-find the parent item whose downlink is `entry.btentry`, scanning
/// right from the remembered offset and then left, walking right-links if
/// the item moved.
fn bt_getstackbuf(rel: &mut VRelation, entry: &mut BTStackEntry) -> Result<Option<Buffer>> {
    let mut blkno = entry.blkno;
    let mut start = entry.offset;

    loop {
        let buf = bt_getbuf(rel, blkno)?;
        let page = rel.page(buf)?;
        let opaque = BTPageOpaque::read(page);

        if opaque.is_incomplete_split() {
            return Err(SoeError::Unsupported(
                "concurrent split recovery is not supported",
            ));
        }

        if !opaque.is_ignorable() {
            let minoff = opaque.first_data_key();
            let maxoff = page_get_max_offset_number(page);

            // An invalid start means "search the whole page"; clamp it
            // against pages that grew or shrank since we saw them.
            if start < minoff {
                start = minoff;
            }
            if start > maxoff {
                start = maxoff + 1;
            }

            let mut offnum = start;
            while offnum <= maxoff {
                let item = page_get_item(page, page_get_item_id(page, offnum));
                if inner_tuple_get_downlink(item) == entry.btentry {
                    entry.blkno = blkno;
                    entry.offset = offnum;
                    return Ok(Some(buf));
                }
                offnum += 1;
            }

            let mut offnum = start;
            while offnum > minoff {
                offnum -= 1;
                let item = page_get_item(page, page_get_item_id(page, offnum));
                if inner_tuple_get_downlink(item) == entry.btentry {
                    entry.blkno = blkno;
                    entry.offset = offnum;
                    return Ok(Some(buf));
                }
            }
        }

        // The downlink moved right at least one page.
        if opaque.is_rightmost() {
            rel.release_buffer(buf);
            return Ok(None);
        }
        blkno = opaque.next;
        start = INVALID_OFFSET_NUMBER;
        rel.release_buffer(buf);
    }
}

/// Build a new root above a just-split old root.
fn bt_newroot(rel: &mut VRelation, lbuf: Buffer, rbuf: Buffer) -> Result<Buffer> {
    let lbkno = rel.buffer_get_block_number(lbuf);
    let rbkno = rel.buffer_get_block_number(rbuf);

    let rootbuf = bt_getbuf(rel, P_NEW)?;
    let rootblknum = rel.buffer_get_block_number(rootbuf);

    let metabuf = bt_getbuf(rel, BTREE_METAPAGE)?;

    // The left downlink is the implicit minus-infinity item: a bare header.
    let mut left_item = vec![0u8; INDEX_TUPLE_HEADER_LEN];
    index_tuple_set_info(&mut left_item, INDEX_TUPLE_HEADER_LEN as u16);
    inner_tuple_set_downlink(&mut left_item, lbkno);
    index_tuple_set_natts(&mut left_item, 0);

    // The right downlink carries the split key: the left page's high key.
    let (mut right_item, root_level) = {
        let lpage = rel.page(lbuf)?;
        let item = page_get_item(lpage, page_get_item_id(lpage, P_HIKEY)).to_vec();
        (item, BTPageOpaque::read(lpage).level + 1)
    };
    inner_tuple_set_downlink(&mut right_item, rbkno);

    {
        let rootpage = rel.page_mut(rootbuf)?;
        let mut rootopaque = BTPageOpaque::read(rootpage);
        rootopaque.prev = P_NONE;
        rootopaque.next = P_NONE;
        rootopaque.flags = BTP_ROOT;
        rootopaque.level = root_level;
        rootopaque.write(rootpage);

        // The root is the rightmost page of its level, so both downlinks
        // are data items; insert in item-number order.
        if page_add_item(rootpage, &left_item, P_HIKEY, false, false)? == INVALID_OFFSET_NUMBER {
            return Err(SoeError::PageFull(format!(
                "failed to add leftkey to new root page while splitting block {lbkno}"
            )));
        }
        if page_add_item(rootpage, &right_item, P_FIRSTKEY, false, false)? == INVALID_OFFSET_NUMBER
        {
            return Err(SoeError::PageFull(format!(
                "failed to add rightkey to new root page while splitting block {lbkno}"
            )));
        }
    }

    {
        let metapg = rel.page_mut(metabuf)?;
        let mut metad = BTMetaPage::read(metapg)?;
        metad.root = rootblknum;
        metad.level = root_level;
        metad.fastroot = rootblknum;
        metad.fastlevel = root_level;
        metad.write(metapg);
    }

    clear_incomplete_split(rel, lbuf)?;
    rel.mark_buffer_dirty(rootbuf)?;
    rel.mark_buffer_dirty(metabuf)?;
    rel.release_buffer(metabuf);

    Ok(rootbuf)
}
