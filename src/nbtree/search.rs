//! B-tree descent and forward scan.
//!
//! The descent is where the PRF counter discipline lives: each internal
//! page hands out the counter that labels the child access (stored per
//! offset in its special area), gets its own counter bumped, and is written
//! back — so read traffic refreshes ciphertexts as a side effect. With
//! dummy padding enabled, every probe is stretched to the full tree height.

use crate::buffer::{Buffer, VRelation};
use crate::common::{BlockNumber, ItemPointer, OffsetNumber, Oid};
use crate::crypto::prf;
use crate::error::{Result, SoeError};
use crate::page::itup::inner_tuple_get_downlink;
use crate::page::{page_get_item, page_get_item_id, page_get_max_offset_number};

use super::page::{bt_getbuf, bt_getmeta};
use super::utils::{bt_checkkeys, bt_compare, bt_strategy, ScanKey};
use super::{bt_counter_get, bt_counter_set, BTPageOpaque, P_NONE};

/// One parent-page position remembered during the descent, used to walk
/// back up after a split.
#[derive(Debug, Clone, Copy)]
pub struct BTStackEntry {
    pub blkno: BlockNumber,
    pub offset: OffsetNumber,
    /// The downlink followed, to uniquely re-find the parent item.
    pub btentry: BlockNumber,
}

/// Descend from the true root to the first leaf the key could be on.
///
/// Returns the leaf buffer plus the parent stack (deepest last). `nextkey`
/// selects "first item > key" positioning instead of ">=".
pub fn bt_search(
    rel: &mut VRelation,
    key: &ScanKey,
    nextkey: bool,
    do_dummy: bool,
) -> Result<(Buffer, Vec<BTStackEntry>)> {
    rel.level = 0;
    rel.token = Some(prf(0, 0, rel.r_counter, rel.fast_prf));
    let meta = bt_getmeta(rel)?;
    rel.r_counter += 1;
    rel.t_height = meta.level;

    let mut stack: Vec<BTStackEntry> = Vec::new();
    let mut t_height = 0u32;
    let mut current_counter = rel.r_counter;
    let mut old_blkno: BlockNumber = 0;

    rel.token = Some(prf(rel.level, meta.fastroot, current_counter, rel.fast_prf));
    let mut buf = bt_getbuf(rel, meta.fastroot)?;

    loop {
        let opaque = BTPageOpaque::read(rel.page(buf)?);
        if opaque.is_leaf() {
            rel.leaf_counter = current_counter;
            if do_dummy && rel.dummies_enabled {
                while t_height < rel.t_height {
                    rel.read_dummy_buffer()?;
                    t_height += 1;
                }
            }
            break;
        }

        // Choose the downlink and take over its access counter.
        let offnum = bt_binsrch(key, rel.page(buf)?, nextkey);
        let (blkno, next_counter) = {
            let page = rel.page_mut(buf)?;
            let item_id = page_get_item_id(page, offnum);
            if !item_id.is_normal() {
                return Err(SoeError::Invalid(format!(
                    "descent item at offset {offnum} is not normal"
                )));
            }
            let blkno = inner_tuple_get_downlink(page_get_item(page, item_id));
            let mut next_counter = bt_counter_get(page, offnum);
            if next_counter == 0 {
                next_counter = 2;
            }
            bt_counter_set(page, offnum, next_counter + 2);
            (blkno, next_counter)
        };

        let par_blkno = rel.buffer_get_block_number(buf);
        stack.push(BTStackEntry {
            blkno: par_blkno,
            offset: offnum,
            btentry: blkno,
        });

        // Evict the parent under its own label; read descents re-encrypt
        // the pages they walk.
        rel.token = Some(prf(rel.level, old_blkno, current_counter, rel.fast_prf));
        rel.mark_buffer_dirty(buf)?;
        rel.release_buffer(buf);

        current_counter = next_counter;
        t_height += 1;
        rel.level = t_height;

        rel.token = Some(prf(rel.level, blkno, current_counter, rel.fast_prf));
        buf = bt_getbuf(rel, blkno)?;
        current_counter += 1;
        old_blkno = blkno;
    }

    rel.r_counter += 1;
    Ok((buf, stack))
}

/// Binary search within one page.
///
/// On a leaf: the first offset whose key is >= the scan key (> when
/// `nextkey`); may be one past the last slot. On an internal page: the last
/// offset whose key is < the scan key (<= when `nextkey`) — the right
/// downlink to descend.
pub fn bt_binsrch(key: &ScanKey, page: &[u8], nextkey: bool) -> OffsetNumber {
    let opaque = BTPageOpaque::read(page);
    let mut low = opaque.first_data_key();
    let mut high = page_get_max_offset_number(page);

    // Empty page (or high key only): first available slot.
    if high < low {
        return low;
    }

    high += 1;
    let cmpval = if nextkey { 0 } else { 1 };

    while high > low {
        let mid = low + (high - low) / 2;
        let result = bt_compare(key, page, mid);
        if result >= cmpval {
            low = mid + 1;
        } else {
            high = mid;
        }
    }

    if opaque.is_leaf() {
        low
    } else {
        low - 1
    }
}

/// Current scan position over one leaf page.
#[derive(Debug)]
pub struct BtScanPos {
    pub buf: Option<Buffer>,
    pub curr_page: BlockNumber,
    pub next_page: BlockNumber,
    pub more_right: bool,
    pub items: Vec<(ItemPointer, OffsetNumber)>,
    pub item_index: usize,
    pub valid: bool,
}

impl BtScanPos {
    fn invalid() -> Self {
        Self {
            buf: None,
            curr_page: crate::common::INVALID_BLOCK_NUMBER,
            next_page: crate::common::INVALID_BLOCK_NUMBER,
            more_right: false,
            items: Vec::new(),
            item_index: 0,
            valid: false,
        }
    }
}

/// Private state of one B-tree scan.
pub struct BtScan {
    pub key: ScanKey,
    pub opoid: Oid,
    pub curr_pos: BtScanPos,
}

/// Outcome of one scan step at the index level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtTupleResult {
    /// A qualifying tuple; fetch it from the heap.
    Match(ItemPointer),
    /// No tuple this round, but the scan is not exhausted; with padding
    /// enabled the caller performs a dummy heap access.
    Dummy,
    End,
}

pub fn bt_begin_scan(rel: &VRelation, key: &[u8], opoid: Oid) -> BtScan {
    BtScan {
        key: ScanKey::new(rel.foid, key),
        opoid,
        curr_pos: BtScanPos::invalid(),
    }
}

pub fn bt_end_scan(rel: &mut VRelation, scan: &mut BtScan) {
    if let Some(buf) = scan.curr_pos.buf.take() {
        rel.release_buffer(buf);
    }
    scan.curr_pos = BtScanPos::invalid();
}

/// Advance the scan one step.
pub fn bt_get_tuple(rel: &mut VRelation, scan: &mut BtScan) -> Result<BtTupleResult> {
    let matched = if !scan.curr_pos.valid {
        let res = bt_first(rel, scan)?;
        if let Some(buf) = scan.curr_pos.buf.take() {
            rel.release_buffer(buf);
        }
        res
    } else {
        bt_next(rel, scan)?
    };

    if let Some(tid) = matched {
        return Ok(BtTupleResult::Match(tid));
    }
    if rel.dummies_enabled && crate::common::block_number_is_valid(scan.curr_pos.next_page)
        && scan.curr_pos.next_page != P_NONE
    {
        return Ok(BtTupleResult::Dummy);
    }
    Ok(BtTupleResult::End)
}

fn current_tid(scan: &BtScan) -> Option<ItemPointer> {
    scan.curr_pos
        .items
        .get(scan.curr_pos.item_index)
        .map(|(tid, _)| *tid)
}

/// Position on the first qualifying item.
fn bt_first(rel: &mut VRelation, scan: &mut BtScan) -> Result<Option<ItemPointer>> {
    let (nextkey, goback) = bt_strategy(scan.opoid)?;

    let (buf, _stack) = bt_search(rel, &scan.key, nextkey, true)?;

    let mut offnum = bt_binsrch(&scan.key, rel.page(buf)?, nextkey);
    if goback {
        offnum -= 1;
    }

    // The leaf's per-offset counter labels the upcoming heap fetch.
    let heap_counter = {
        let page = rel.page_mut(buf)?;
        let mut counter = bt_counter_get(page, offnum);
        if counter == 0 {
            counter = 2;
        }
        bt_counter_set(page, offnum, counter + 1);
        counter
    };
    rel.heap_block_counter = heap_counter;

    let leaf_blkno = rel.buffer_get_block_number(buf);
    rel.token = Some(prf(rel.level, leaf_blkno, rel.leaf_counter, rel.fast_prf));
    rel.mark_buffer_dirty(buf)?;

    scan.curr_pos.buf = Some(buf);
    scan.curr_pos.more_right = true;
    scan.curr_pos.valid = true;

    if !bt_readpage(rel, scan, offnum)? {
        // No match on this leaf. With dummy accesses the caller simulates
        // the rest; otherwise walk right now.
        if rel.dummies_enabled {
            return Ok(None);
        }
        if !bt_steppage(rel, scan)? {
            return Ok(None);
        }
    }
    Ok(current_tid(scan))
}

/// Step to the next item, walking right as pages run out. Dummy reads keep
/// the per-call page-touch count at tree height when padding is on.
fn bt_next(rel: &mut VRelation, scan: &mut BtScan) -> Result<Option<ItemPointer>> {
    scan.curr_pos.item_index += 1;
    if scan.curr_pos.item_index >= scan.curr_pos.items.len() {
        bt_dummy_search(rel, rel.t_height.saturating_sub(1))?;
        if !bt_steppage(rel, scan)? {
            bt_dummy_search(rel, 1)?;
            return Ok(None);
        }
    } else {
        bt_dummy_search(rel, rel.t_height)?;
    }
    Ok(current_tid(scan))
}

/// Emit `max_height` discarded index reads.
pub fn bt_dummy_search(rel: &mut VRelation, max_height: u32) -> Result<()> {
    if !rel.dummies_enabled {
        return Ok(());
    }
    for height in 0..max_height {
        rel.level = height;
        rel.read_dummy_buffer()?;
    }
    Ok(())
}

/// Load the qualifying items from the current leaf into the scan position.
fn bt_readpage(rel: &mut VRelation, scan: &mut BtScan, offnum: OffsetNumber) -> Result<bool> {
    let buf = scan
        .curr_pos
        .buf
        .ok_or_else(|| SoeError::Invalid("readpage without a pinned leaf".into()))?;
    let page = rel.page(buf)?;
    let opaque = BTPageOpaque::read(page);

    scan.curr_pos.curr_page = buf;
    // The right-link tells us where to step after these items; splits only
    // ever go right, so no left-link is needed.
    scan.curr_pos.next_page = opaque.next;
    scan.curr_pos.items.clear();
    scan.curr_pos.item_index = 0;

    let minoff = opaque.first_data_key();
    let maxoff = page_get_max_offset_number(page);
    let mut offnum = offnum.max(minoff);

    while offnum <= maxoff {
        let (tid, continuescan) = bt_checkkeys(&scan.key, scan.opoid, page, offnum);
        if let Some(tid) = tid {
            scan.curr_pos.items.push((tid, offnum));
        }
        if !continuescan {
            scan.curr_pos.more_right = false;
            break;
        }
        offnum += 1;
    }

    Ok(!scan.curr_pos.items.is_empty())
}

/// Follow the saved right-link to the next page with data.
fn bt_steppage(rel: &mut VRelation, scan: &mut BtScan) -> Result<bool> {
    let blkno = scan.curr_pos.next_page;
    if let Some(buf) = scan.curr_pos.buf.take() {
        rel.release_buffer(buf);
    }
    if !bt_readnextpage(rel, scan, blkno)? {
        return Ok(false);
    }
    if let Some(buf) = scan.curr_pos.buf.take() {
        rel.release_buffer(buf);
    }
    Ok(true)
}

fn bt_readnextpage(rel: &mut VRelation, scan: &mut BtScan, blkno: BlockNumber) -> Result<bool> {
    let mut blkno = blkno;
    loop {
        if blkno == P_NONE || !scan.curr_pos.more_right {
            scan.curr_pos = BtScanPos::invalid();
            scan.curr_pos.valid = true;
            return Ok(false);
        }

        rel.token = Some(prf(rel.level, blkno, rel.r_counter, rel.fast_prf));
        rel.r_counter += 1;
        let buf = bt_getbuf(rel, blkno)?;
        let opaque = BTPageOpaque::read(rel.page(buf)?);
        if opaque.is_ignorable() {
            // Deleted pages cannot exist here; seeing one means an extra
            // access was made, which would compromise the trace.
            rel.release_buffer(buf);
            return Err(SoeError::Invalid("scan stepped onto an ignored page".into()));
        }

        scan.curr_pos.buf = Some(buf);
        if bt_readpage(rel, scan, opaque.first_data_key())? {
            if let Some(b) = scan.curr_pos.buf.take() {
                rel.release_buffer(b);
            }
            return Ok(true);
        }

        blkno = opaque.next;
        if let Some(b) = scan.curr_pos.buf.take() {
            rel.release_buffer(b);
        }
    }
}
