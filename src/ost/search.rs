//! OST descent and leaf scan. Each probe reads the root file page, one page
//! per deeper level out of that level's ORAM, and pads with dummy reads so
//! the external trace always shows exactly `L + 1` page fetches no matter
//! where the key lands.

use crate::buffer::ost::OstRelation;
use crate::buffer::Buffer;
use crate::common::{ItemPointer, OffsetNumber, Oid};
use crate::error::{Result, SoeError};
use crate::nbtree::search::BtTupleResult;
use crate::nbtree::utils::{bt_strategy, c_strlen, strcmp, strncmp, ScanKey};
use crate::page::itup::{index_getattr, index_tuple_get_tid};
use crate::page::{page_get_item, page_get_item_id, page_get_max_offset_number};

use super::{OstPageOpaque, OST_P_NONE};

/// Compare the scan key to the tuple at `offnum`; minus-infinity rule on
/// internal pages as in the dynamic tree.
fn ost_compare(key: &ScanKey, page: &[u8], offnum: OffsetNumber) -> i32 {
    let opaque = OstPageOpaque::read(page);
    if !opaque.is_leaf() && offnum == opaque.first_data_key() {
        return 1;
    }
    let itup = page_get_item(page, page_get_item_id(page, offnum));
    let datum = index_getattr(itup);
    strncmp(&key.sk_argument, datum, c_strlen(&key.sk_argument))
}

/// Binary search within one OST page; same contract as the dynamic tree's.
pub fn ost_binsrch(key: &ScanKey, page: &[u8], nextkey: bool) -> OffsetNumber {
    let opaque = OstPageOpaque::read(page);
    let mut low = opaque.first_data_key();
    let mut high = page_get_max_offset_number(page);

    if high < low {
        return low;
    }

    high += 1;
    let cmpval = if nextkey { 0 } else { 1 };
    while high > low {
        let mid = low + (high - low) / 2;
        if ost_compare(key, page, mid) >= cmpval {
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

/// Descend the forest to the first leaf the key could be on. The returned
/// buffer lives at `rel.level`.
pub fn ost_search(
    rel: &mut OstRelation,
    key: &ScanKey,
    nextkey: bool,
    do_dummy: bool,
) -> Result<Buffer> {
    let mut height = 0u32;
    rel.level = 0;
    let mut buf = rel.read_buffer(0)?;

    loop {
        let opaque = OstPageOpaque::read(rel.page(buf)?);
        if opaque.is_leaf() {
            // Equalize the observed depth: one padded read per remaining
            // level.
            while do_dummy && height < rel.osts.nlevels {
                rel.read_dummy_buffer(height)?;
                height += 1;
            }
            break;
        }

        let (blkno, offnum) = {
            let page = rel.page(buf)?;
            let offnum = ost_binsrch(key, page, nextkey);
            let item_id = page_get_item_id(page, offnum);
            if !item_id.is_normal() {
                return Err(SoeError::Invalid(format!(
                    "ost descent item at level {} offset {offnum} is not normal",
                    rel.level
                )));
            }
            let item = page_get_item(page, item_id);
            (
                crate::page::itup::inner_tuple_get_downlink(item),
                offnum,
            )
        };
        tracing::trace!(level = rel.level, offnum, blkno, "ost descent step");

        rel.release_buffer(buf);
        height += 1;
        rel.level = height;

        buf = rel.read_buffer(blkno)?;
    }

    Ok(buf)
}

/// Scan position over one OST leaf.
#[derive(Debug)]
pub struct OstScanPos {
    pub buf: Option<Buffer>,
    pub next_page: crate::common::BlockNumber,
    pub more_right: bool,
    pub items: Vec<(ItemPointer, OffsetNumber)>,
    pub item_index: usize,
    pub valid: bool,
}

impl OstScanPos {
    fn invalid() -> Self {
        Self {
            buf: None,
            next_page: OST_P_NONE,
            more_right: false,
            items: Vec::new(),
            item_index: 0,
            valid: false,
        }
    }
}

pub struct OstScan {
    pub key: ScanKey,
    pub opoid: Oid,
    pub curr_pos: OstScanPos,
}

pub fn ost_begin_scan(key: &[u8], opoid: Oid) -> OstScan {
    OstScan {
        key: ScanKey::new(0, key),
        opoid,
        curr_pos: OstScanPos::invalid(),
    }
}

pub fn ost_end_scan(rel: &mut OstRelation, scan: &mut OstScan) {
    if let Some(buf) = scan.curr_pos.buf.take() {
        rel.release_buffer(buf);
    }
    scan.curr_pos = OstScanPos::invalid();
}

/// Advance the scan one step.
pub fn ost_get_tuple(rel: &mut OstRelation, scan: &mut OstScan) -> Result<BtTupleResult> {
    let matched = if !scan.curr_pos.valid {
        ost_first(rel, scan)?
    } else {
        ost_next(rel, scan)?
    };
    match matched {
        Some(tid) => Ok(BtTupleResult::Match(tid)),
        None => Ok(BtTupleResult::End),
    }
}

fn current_tid(scan: &OstScan) -> Option<ItemPointer> {
    scan.curr_pos
        .items
        .get(scan.curr_pos.item_index)
        .map(|(tid, _)| *tid)
}

fn ost_first(rel: &mut OstRelation, scan: &mut OstScan) -> Result<Option<ItemPointer>> {
    let (nextkey, goback) = bt_strategy(scan.opoid)?;

    let buf = ost_search(rel, &scan.key, nextkey, true)?;
    let mut offnum = ost_binsrch(&scan.key, rel.page(buf)?, nextkey);
    if goback {
        offnum -= 1;
    }

    scan.curr_pos.buf = Some(buf);
    scan.curr_pos.more_right = true;
    scan.curr_pos.valid = true;

    let found = ost_readpage(rel, scan, offnum)?;
    if let Some(b) = scan.curr_pos.buf.take() {
        rel.release_buffer(b);
    }
    if !found {
        return Ok(None);
    }
    Ok(current_tid(scan))
}

fn ost_next(rel: &mut OstRelation, scan: &mut OstScan) -> Result<Option<ItemPointer>> {
    scan.curr_pos.item_index += 1;
    if scan.curr_pos.item_index >= scan.curr_pos.items.len() {
        // The step-right read replaces one level's worth of padding.
        ost_dummy_search(rel, rel.osts.nlevels.saturating_sub(1))?;
        if !ost_steppage(rel, scan)? {
            rel.read_dummy_buffer(rel.osts.nlevels)?;
            return Ok(None);
        }
    } else {
        ost_dummy_search(rel, rel.osts.nlevels)?;
    }
    Ok(current_tid(scan))
}

/// One discarded read per level up to `max_height`.
pub fn ost_dummy_search(rel: &mut OstRelation, max_height: u32) -> Result<()> {
    for height in 0..max_height {
        rel.read_dummy_buffer(height)?;
    }
    Ok(())
}

fn ost_check_keys(
    scan: &OstScan,
    page: &[u8],
    offnum: OffsetNumber,
) -> (Option<ItemPointer>, bool) {
    let itup = page_get_item(page, page_get_item_id(page, offnum));
    let datum = index_getattr(itup);
    let test = strcmp(datum, &scan.key.sk_argument);
    let passes = match scan.opoid {
        crate::common::OP_LESS => test < 0,
        crate::common::OP_LESS_EQUAL => test <= 0,
        crate::common::OP_EQUAL => test == 0,
        crate::common::OP_GREATER_EQUAL => test >= 0,
        crate::common::OP_GREATER => test > 0,
        _ => false,
    };
    if passes {
        (Some(index_tuple_get_tid(itup)), true)
    } else {
        (None, false)
    }
}

fn ost_readpage(rel: &mut OstRelation, scan: &mut OstScan, offnum: OffsetNumber) -> Result<bool> {
    let buf = scan
        .curr_pos
        .buf
        .ok_or_else(|| SoeError::Invalid("ost readpage without a pinned leaf".into()))?;
    let page = rel.page(buf)?;
    let opaque = OstPageOpaque::read(page);

    scan.curr_pos.next_page = opaque.next;
    scan.curr_pos.items.clear();
    scan.curr_pos.item_index = 0;

    let minoff = opaque.first_data_key();
    let maxoff = page_get_max_offset_number(page);
    let mut offnum = offnum.max(minoff);

    while offnum <= maxoff {
        let (tid, continuescan) = ost_check_keys(scan, page, offnum);
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

fn ost_steppage(rel: &mut OstRelation, scan: &mut OstScan) -> Result<bool> {
    let blkno = scan.curr_pos.next_page;
    if let Some(buf) = scan.curr_pos.buf.take() {
        rel.release_buffer(buf);
    }

    let mut blkno = blkno;
    loop {
        if blkno == OST_P_NONE || !scan.curr_pos.more_right {
            scan.curr_pos = OstScanPos::invalid();
            scan.curr_pos.valid = true;
            return Ok(false);
        }

        // Right siblings live on the leaf level.
        rel.level = rel.osts.nlevels;
        let buf = rel.read_buffer(blkno)?;
        let opaque = OstPageOpaque::read(rel.page(buf)?);
        if opaque.is_ignorable() {
            rel.release_buffer(buf);
            return Err(SoeError::Invalid("ost scan stepped onto an ignored page".into()));
        }

        scan.curr_pos.buf = Some(buf);
        let found = ost_readpage(rel, scan, opaque.first_data_key())?;
        if let Some(b) = scan.curr_pos.buf.take() {
            rel.release_buffer(b);
        }
        if found {
            return Ok(true);
        }
        blkno = opaque.next;
    }
}
