// Slotted page layout.
//
// A page is BLCKSZ bytes: a 24-byte header, a line-pointer array growing up
// from `pd_lower`, tuple storage growing down from `pd_upper`, and an
// engine-owned special area at the tail. All multi-byte fields are stored in
// host byte order; the system does not target cross-endian portability.

pub mod htup;
pub mod itup;
pub mod tupdesc;

use crate::common::{
    maxalign, offset_number_is_valid, OffsetNumber, BLCKSZ, FIRST_OFFSET_NUMBER,
    INVALID_OFFSET_NUMBER,
};
use crate::error::{Result, SoeError};

pub const SIZE_OF_PAGE_HEADER: usize = 24;
pub const PG_PAGE_LAYOUT_VERSION: u16 = 4;

const PD_HAS_FREE_LINES: u16 = 0x0001;

const OFF_CHECKSUM: usize = 8;
const OFF_FLAGS: usize = 10;
const OFF_LOWER: usize = 12;
const OFF_UPPER: usize = 14;
const OFF_SPECIAL: usize = 16;
const OFF_PAGESIZE_VERSION: usize = 18;

pub const ITEM_ID_LEN: usize = 4;

/// Most line pointers one heap page can carry; enforced by `page_add_item`
/// when `is_heap` is set.
pub const MAX_HEAP_TUPLES_PER_PAGE: usize =
    (BLCKSZ - SIZE_OF_PAGE_HEADER) / (maxalign(htup::HEAP_TUPLE_HEADER_LEN) + ITEM_ID_LEN);

/// Conservative bound on index tuples per page (no special space accounted).
pub const MAX_INDEX_TUPLES_PER_PAGE: usize =
    (BLCKSZ - SIZE_OF_PAGE_HEADER) / (maxalign(itup::INDEX_TUPLE_HEADER_LEN + 1) + ITEM_ID_LEN);

/// Line pointer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpFlags {
    Unused = 0,
    Normal = 1,
    Redirect = 2,
    Dead = 3,
}

/// Decoded line pointer: `(offset, flags, length)` packed 15/2/15 on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemId {
    pub off: u16,
    pub flags: LpFlags,
    pub len: u16,
}

impl ItemId {
    pub fn unused() -> Self {
        Self {
            off: 0,
            flags: LpFlags::Unused,
            len: 0,
        }
    }

    pub fn normal(off: u16, len: u16) -> Self {
        Self {
            off,
            flags: LpFlags::Normal,
            len,
        }
    }

    pub fn is_used(&self) -> bool {
        !matches!(self.flags, LpFlags::Unused)
    }

    pub fn is_normal(&self) -> bool {
        matches!(self.flags, LpFlags::Normal)
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.flags, LpFlags::Dead)
    }

    pub fn has_storage(&self) -> bool {
        self.len != 0
    }

    fn pack(&self) -> u32 {
        (self.off as u32 & 0x7FFF)
            | ((self.flags as u32 & 0x3) << 15)
            | ((self.len as u32 & 0x7FFF) << 17)
    }

    fn unpack(raw: u32) -> Self {
        let flags = match (raw >> 15) & 0x3 {
            0 => LpFlags::Unused,
            1 => LpFlags::Normal,
            2 => LpFlags::Redirect,
            _ => LpFlags::Dead,
        };
        Self {
            off: (raw & 0x7FFF) as u16,
            flags,
            len: ((raw >> 17) & 0x7FFF) as u16,
        }
    }
}

#[inline]
fn get_u16(page: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([page[off], page[off + 1]])
}

#[inline]
fn set_u16(page: &mut [u8], off: usize, val: u16) {
    page[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

pub fn page_lower(page: &[u8]) -> u16 {
    get_u16(page, OFF_LOWER)
}

pub fn page_upper(page: &[u8]) -> u16 {
    get_u16(page, OFF_UPPER)
}

pub fn page_special(page: &[u8]) -> u16 {
    get_u16(page, OFF_SPECIAL)
}

pub fn page_size(page: &[u8]) -> usize {
    (get_u16(page, OFF_PAGESIZE_VERSION) & 0xFF00) as usize
}

/// A freshly-zeroed, never-initialized page has `pd_upper == 0`.
pub fn page_is_new(page: &[u8]) -> bool {
    page_upper(page) == 0
}

pub fn page_has_free_line_pointers(page: &[u8]) -> bool {
    get_u16(page, OFF_FLAGS) & PD_HAS_FREE_LINES != 0
}

pub fn page_set_has_free_line_pointers(page: &mut [u8]) {
    let flags = get_u16(page, OFF_FLAGS) | PD_HAS_FREE_LINES;
    set_u16(page, OFF_FLAGS, flags);
}

pub fn page_clear_has_free_line_pointers(page: &mut [u8]) {
    let flags = get_u16(page, OFF_FLAGS) & !PD_HAS_FREE_LINES;
    set_u16(page, OFF_FLAGS, flags);
}

/// Zero-fill the page and set up header pointers for `special_size` bytes of
/// engine-owned tail space (MAXALIGN-rounded).
pub fn page_init(page: &mut [u8], special_size: usize) {
    let special = maxalign(special_size);
    debug_assert!(special <= BLCKSZ - SIZE_OF_PAGE_HEADER);
    page.fill(0);
    set_u16(page, OFF_LOWER, SIZE_OF_PAGE_HEADER as u16);
    set_u16(page, OFF_UPPER, (BLCKSZ - special) as u16);
    set_u16(page, OFF_SPECIAL, (BLCKSZ - special) as u16);
    // Page size lives in the high byte bits, version in the low ones.
    set_u16(
        page,
        OFF_PAGESIZE_VERSION,
        BLCKSZ as u16 | PG_PAGE_LAYOUT_VERSION,
    );
    set_u16(page, OFF_CHECKSUM, 0);
}

/// Number of line pointers on the page (0 for an empty page).
pub fn page_get_max_offset_number(page: &[u8]) -> OffsetNumber {
    let lower = page_lower(page) as usize;
    if lower <= SIZE_OF_PAGE_HEADER {
        0
    } else {
        ((lower - SIZE_OF_PAGE_HEADER) / ITEM_ID_LEN) as OffsetNumber
    }
}

pub fn page_get_item_id(page: &[u8], offnum: OffsetNumber) -> ItemId {
    debug_assert!(offnum >= FIRST_OFFSET_NUMBER);
    let pos = SIZE_OF_PAGE_HEADER + (offnum as usize - 1) * ITEM_ID_LEN;
    ItemId::unpack(u32::from_le_bytes([
        page[pos],
        page[pos + 1],
        page[pos + 2],
        page[pos + 3],
    ]))
}

pub fn page_set_item_id(page: &mut [u8], offnum: OffsetNumber, item_id: ItemId) {
    let pos = SIZE_OF_PAGE_HEADER + (offnum as usize - 1) * ITEM_ID_LEN;
    page[pos..pos + 4].copy_from_slice(&item_id.pack().to_le_bytes());
}

pub fn page_get_item(page: &[u8], item_id: ItemId) -> &[u8] {
    &page[item_id.off as usize..item_id.off as usize + item_id.len as usize]
}

/// The engine-owned special area at the page tail.
pub fn page_get_special(page: &[u8]) -> &[u8] {
    &page[page_special(page) as usize..]
}

pub fn page_get_special_mut(page: &mut [u8]) -> &mut [u8] {
    let special = page_special(page) as usize;
    &mut page[special..]
}

pub fn page_get_special_size(page: &[u8]) -> usize {
    BLCKSZ - page_special(page) as usize
}

/// Contents region between the header and the special area; metapages and
/// bitmap pages store their payload here.
pub fn page_get_contents(page: &[u8]) -> &[u8] {
    &page[SIZE_OF_PAGE_HEADER..]
}

pub fn page_get_contents_mut(page: &mut [u8]) -> &mut [u8] {
    &mut page[SIZE_OF_PAGE_HEADER..]
}

/// Set `pd_lower` to cover `len` bytes of contents, making the tail look
/// compressible.
pub fn page_set_contents_len(page: &mut [u8], len: usize) {
    set_u16(page, OFF_LOWER, (SIZE_OF_PAGE_HEADER + len) as u16);
}

/// Free space left for one more tuple, accounting for its line pointer.
/// Index pages only; heap pages use [`page_get_heap_free_space`].
pub fn page_get_free_space(page: &[u8]) -> usize {
    let space = page_upper(page) as isize - page_lower(page) as isize;
    if space < ITEM_ID_LEN as isize {
        0
    } else {
        space as usize - ITEM_ID_LEN
    }
}

/// Free space assuming `ntups` new line pointers.
pub fn page_get_free_space_for_multiple_tuples(page: &[u8], ntups: usize) -> usize {
    let space = page_upper(page) as isize - page_lower(page) as isize;
    if space < (ntups * ITEM_ID_LEN) as isize {
        0
    } else {
        space as usize - ntups * ITEM_ID_LEN
    }
}

/// Raw gap between lower and upper, no line-pointer allowance.
pub fn page_get_exact_free_space(page: &[u8]) -> usize {
    let space = page_upper(page) as isize - page_lower(page) as isize;
    if space < 0 {
        0
    } else {
        space as usize
    }
}

/// Like [`page_get_free_space`], but returns zero once the page already
/// carries `MAX_HEAP_TUPLES_PER_PAGE` line pointers and none are recyclable.
pub fn page_get_heap_free_space(page: &[u8]) -> usize {
    let space = page_get_free_space(page);
    if space > 0 {
        let nline = page_get_max_offset_number(page) as usize;
        if nline >= MAX_HEAP_TUPLES_PER_PAGE {
            if page_has_free_line_pointers(page) {
                for offnum in FIRST_OFFSET_NUMBER..=nline as OffsetNumber {
                    if !page_get_item_id(page, offnum).is_used() {
                        return space;
                    }
                }
            }
            return 0;
        }
    }
    space
}

fn check_page_pointers(page: &[u8]) -> Result<()> {
    let lower = page_lower(page) as usize;
    let upper = page_upper(page) as usize;
    let special = page_special(page) as usize;
    if lower < SIZE_OF_PAGE_HEADER || lower > upper || upper > special || special > BLCKSZ {
        return Err(SoeError::Invalid(format!(
            "corrupted page pointers: lower = {lower}, upper = {upper}, special = {special}"
        )));
    }
    Ok(())
}

/// Add an item to the page.
///
/// `offnum` selects the slot: a valid offset either overwrites an unused
/// line pointer (`overwrite`) or inserts there shuffling later pointers up;
/// `INVALID_OFFSET_NUMBER` finds a recyclable slot or appends. Returns the
/// chosen offset, or `INVALID_OFFSET_NUMBER` when the item cannot be placed
/// (page full, used slot, heap line-pointer cap).
pub fn page_add_item(
    page: &mut [u8],
    item: &[u8],
    offnum: OffsetNumber,
    overwrite: bool,
    is_heap: bool,
) -> Result<OffsetNumber> {
    check_page_pointers(page)?;

    let limit = page_get_max_offset_number(page) + 1;
    let mut offset = offnum;
    let mut needshuffle = false;

    if offset_number_is_valid(offset) {
        if overwrite {
            if offset < limit {
                let item_id = page_get_item_id(page, offset);
                if item_id.is_used() || item_id.has_storage() {
                    tracing::warn!("will not overwrite a used item id");
                    return Ok(INVALID_OFFSET_NUMBER);
                }
            }
        } else if offset < limit {
            needshuffle = true;
        }
    } else {
        // No offset given; look for a recyclable slot, else append.
        offset = limit;
        if page_has_free_line_pointers(page) {
            for candidate in FIRST_OFFSET_NUMBER..limit {
                let item_id = page_get_item_id(page, candidate);
                if !item_id.is_used() && !item_id.has_storage() {
                    offset = candidate;
                    break;
                }
            }
            if offset >= limit {
                page_clear_has_free_line_pointers(page);
            }
        }
    }

    if offset > limit {
        tracing::warn!("specified item offset {offset} is too large");
        return Ok(INVALID_OFFSET_NUMBER);
    }

    if is_heap && offset as usize > MAX_HEAP_TUPLES_PER_PAGE {
        tracing::warn!("cannot place more than {MAX_HEAP_TUPLES_PER_PAGE} items in a heap page");
        return Ok(INVALID_OFFSET_NUMBER);
    }

    let lower = if offset == limit || needshuffle {
        page_lower(page) as usize + ITEM_ID_LEN
    } else {
        page_lower(page) as usize
    };

    let aligned = maxalign(item.len());
    let upper = page_upper(page) as isize - aligned as isize;
    if (lower as isize) > upper {
        return Ok(INVALID_OFFSET_NUMBER);
    }
    let upper = upper as usize;

    if needshuffle {
        let src = SIZE_OF_PAGE_HEADER + (offset as usize - 1) * ITEM_ID_LEN;
        let count = (limit - offset) as usize * ITEM_ID_LEN;
        page.copy_within(src..src + count, src + ITEM_ID_LEN);
    }

    page_set_item_id(page, offset, ItemId::normal(upper as u16, item.len() as u16));
    page[upper..upper + item.len()].copy_from_slice(item);

    set_u16(page, OFF_LOWER, lower as u16);
    set_u16(page, OFF_UPPER, upper as u16);

    Ok(offset)
}

/// Working copy of a page used while rebuilding its halves during a split.
pub fn page_get_temp_page(page: &[u8]) -> Vec<u8> {
    vec![0u8; page.len()]
}

/// Copy the rebuilt temp page over the original.
pub fn page_restore_temp_page(temp: &[u8], page: &mut [u8]) {
    page.copy_from_slice(temp);
}

/// Delete several items at once, compacting storage and renumbering the
/// surviving line pointers while preserving their order. `itemnos` must be
/// sorted ascending.
pub fn page_index_multi_delete(page: &mut [u8], itemnos: &[OffsetNumber]) -> Result<()> {
    check_page_pointers(page)?;
    let special = page_special(page) as usize;
    if special != maxalign(special) {
        return Err(SoeError::Invalid(format!(
            "corrupted special pointer: special = {special}"
        )));
    }

    struct Survivor {
        item_id: ItemId,
        itemoff: usize,
        alignedlen: usize,
    }

    let nline = page_get_max_offset_number(page);
    let pd_upper = page_upper(page) as usize;
    let mut survivors: Vec<Survivor> = Vec::with_capacity(nline as usize);
    let mut nextitm = 0usize;
    let mut totallen = 0usize;

    for offnum in FIRST_OFFSET_NUMBER..=nline {
        let item_id = page_get_item_id(page, offnum);
        let off = item_id.off as usize;
        let len = item_id.len as usize;
        if item_id.is_used() && (off < pd_upper || off + len > special || off != maxalign(off)) {
            return Err(SoeError::Invalid(format!(
                "corrupted item pointer: offset = {off}, length = {len}"
            )));
        }
        if nextitm < itemnos.len() && offnum == itemnos[nextitm] {
            nextitm += 1;
        } else {
            let alignedlen = maxalign(len);
            totallen += alignedlen;
            survivors.push(Survivor {
                item_id,
                itemoff: off,
                alignedlen,
            });
        }
    }

    if nextitm != itemnos.len() {
        return Err(SoeError::Invalid(
            "incorrect index offsets supplied".to_string(),
        ));
    }
    if totallen > special - SIZE_OF_PAGE_HEADER {
        return Err(SoeError::Invalid(format!(
            "corrupted item lengths: total {totallen}"
        )));
    }

    // Compact tuple storage from the special area downwards, moving
    // survivors in decreasing original-offset order so nothing is clobbered.
    let mut order: Vec<usize> = (0..survivors.len()).collect();
    order.sort_by(|&a, &b| survivors[b].itemoff.cmp(&survivors[a].itemoff));

    let mut upper = special;
    for &idx in &order {
        let s = &mut survivors[idx];
        upper -= s.alignedlen;
        page.copy_within(s.itemoff..s.itemoff + s.alignedlen, upper);
        s.item_id.off = upper as u16;
    }

    set_u16(
        page,
        OFF_LOWER,
        (SIZE_OF_PAGE_HEADER + survivors.len() * ITEM_ID_LEN) as u16,
    );
    set_u16(page, OFF_UPPER, upper as u16);
    for (i, s) in survivors.iter().enumerate() {
        page_set_item_id(page, (i + 1) as OffsetNumber, s.item_id);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_page() -> Vec<u8> {
        let mut page = vec![0u8; BLCKSZ];
        page_init(&mut page, 8);
        page
    }

    #[test]
    fn test_page_init_pointers() {
        let page = fresh_page();
        assert_eq!(page_lower(&page) as usize, SIZE_OF_PAGE_HEADER);
        assert_eq!(page_upper(&page) as usize, BLCKSZ - 8);
        assert_eq!(page_special(&page) as usize, BLCKSZ - 8);
        assert!(!page_is_new(&page));
        assert!(page_is_new(&vec![0u8; BLCKSZ]));
    }

    #[test]
    fn test_add_and_get_item() {
        let mut page = fresh_page();
        let off = page_add_item(&mut page, b"hello world", INVALID_OFFSET_NUMBER, false, false)
            .unwrap();
        assert_eq!(off, 1);
        let item_id = page_get_item_id(&page, off);
        assert!(item_id.is_normal());
        assert_eq!(page_get_item(&page, item_id), b"hello world");
        assert_eq!(page_get_max_offset_number(&page), 1);
    }

    #[test]
    fn test_insert_with_shuffle_keeps_order() {
        let mut page = fresh_page();
        page_add_item(&mut page, b"bb", INVALID_OFFSET_NUMBER, false, false).unwrap();
        page_add_item(&mut page, b"dd", INVALID_OFFSET_NUMBER, false, false).unwrap();
        // Insert between the two.
        let off = page_add_item(&mut page, b"cc", 2, false, false).unwrap();
        assert_eq!(off, 2);
        let items: Vec<&[u8]> = (1..=3)
            .map(|o| page_get_item(&page, page_get_item_id(&page, o)))
            .collect();
        assert_eq!(items, vec![&b"bb"[..], &b"cc"[..], &b"dd"[..]]);
    }

    #[test]
    fn test_page_full_returns_invalid_offset() {
        let mut page = fresh_page();
        let big = vec![1u8; 4000];
        assert_ne!(
            page_add_item(&mut page, &big, INVALID_OFFSET_NUMBER, false, false).unwrap(),
            INVALID_OFFSET_NUMBER
        );
        assert_ne!(
            page_add_item(&mut page, &big, INVALID_OFFSET_NUMBER, false, false).unwrap(),
            INVALID_OFFSET_NUMBER
        );
        assert_eq!(
            page_add_item(&mut page, &big, INVALID_OFFSET_NUMBER, false, false).unwrap(),
            INVALID_OFFSET_NUMBER
        );
    }

    #[test]
    fn test_free_space_accounting() {
        let mut page = fresh_page();
        let before = page_get_free_space(&page);
        page_add_item(&mut page, &[0u8; 64], INVALID_OFFSET_NUMBER, false, false).unwrap();
        let after = page_get_free_space(&page);
        assert_eq!(before - after, 64 + ITEM_ID_LEN);
    }

    #[test]
    fn test_multi_delete_compacts_and_preserves_order() {
        let mut page = fresh_page();
        for i in 0u8..6 {
            page_add_item(&mut page, &[i; 16], INVALID_OFFSET_NUMBER, false, false).unwrap();
        }
        page_index_multi_delete(&mut page, &[2, 5]).unwrap();
        assert_eq!(page_get_max_offset_number(&page), 4);
        let survivors: Vec<u8> = (1..=4)
            .map(|o| page_get_item(&page, page_get_item_id(&page, o))[0])
            .collect();
        assert_eq!(survivors, vec![0, 2, 3, 5]);
    }

    #[test]
    fn test_multi_delete_all_items_empties_page() {
        let mut page = fresh_page();
        for i in 0u8..3 {
            page_add_item(&mut page, &[i; 16], INVALID_OFFSET_NUMBER, false, false).unwrap();
        }
        page_index_multi_delete(&mut page, &[1, 2, 3]).unwrap();
        assert_eq!(page_get_max_offset_number(&page), 0);
        assert_eq!(page_upper(&page), page_special(&page));
    }
}
