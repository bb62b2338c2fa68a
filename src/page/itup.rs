//! Index tuple layout: an 8-byte header (`t_tid` + `t_info`) followed by the
//! key payload at a MAXALIGN boundary. `t_info` packs the tuple size in its
//! 13 low bits plus has-nulls / has-varwidth / AM-reserved flags.

use crate::common::{maxalign, ItemPointer, OffsetNumber};
use crate::error::{Result, SoeError};
use crate::page::tupdesc::{att_align, TupleDesc};

pub const INDEX_TUPLE_HEADER_LEN: usize = 8;

pub const INDEX_SIZE_MASK: u16 = 0x1FFF;
pub const INDEX_AM_RESERVED_BIT: u16 = 0x2000;
pub const INDEX_VAR_MASK: u16 = 0x4000;
pub const INDEX_NULL_MASK: u16 = 0x8000;

/// Hash tags tuples relocated by a bucket split with the AM-reserved bit.
pub const INDEX_MOVED_BY_SPLIT_MASK: u16 = INDEX_AM_RESERVED_BIT;

pub const INDEX_MAX_KEYS: usize = 32;
const NULL_BITMAP_LEN: usize = INDEX_MAX_KEYS.div_ceil(8);

const T_INFO_OFF: usize = 6;

pub fn index_tuple_get_tid(itup: &[u8]) -> ItemPointer {
    ItemPointer::decode(&itup[0..ItemPointer::ENCODED_LEN])
}

pub fn index_tuple_set_tid(itup: &mut [u8], tid: ItemPointer) {
    tid.encode(&mut itup[0..ItemPointer::ENCODED_LEN]);
}

pub fn index_tuple_info(itup: &[u8]) -> u16 {
    u16::from_le_bytes([itup[T_INFO_OFF], itup[T_INFO_OFF + 1]])
}

pub fn index_tuple_set_info(itup: &mut [u8], info: u16) {
    itup[T_INFO_OFF..T_INFO_OFF + 2].copy_from_slice(&info.to_le_bytes());
}

pub fn index_tuple_size(itup: &[u8]) -> usize {
    (index_tuple_info(itup) & INDEX_SIZE_MASK) as usize
}

pub fn index_tuple_has_nulls(itup: &[u8]) -> bool {
    index_tuple_info(itup) & INDEX_NULL_MASK != 0
}

/// Downlink accessors: internal B-tree tuples store the child block number
/// in the tid's block field.
pub fn inner_tuple_get_downlink(itup: &[u8]) -> u32 {
    index_tuple_get_tid(itup).block
}

pub fn inner_tuple_set_downlink(itup: &mut [u8], blkno: u32) {
    let mut tid = index_tuple_get_tid(itup);
    tid.block = blkno;
    index_tuple_set_tid(itup, tid);
}

/// Pivot tuples reuse the tid offset field for their attribute count.
pub fn index_tuple_set_natts(itup: &mut [u8], natts: OffsetNumber) {
    let mut tid = index_tuple_get_tid(itup);
    tid.offnum = natts;
    index_tuple_set_tid(itup, tid);
}

/// Offset of the key payload for a given `t_info`.
pub fn index_info_find_data_offset(t_info: u16) -> usize {
    if t_info & INDEX_NULL_MASK == 0 {
        maxalign(INDEX_TUPLE_HEADER_LEN)
    } else {
        maxalign(INDEX_TUPLE_HEADER_LEN + NULL_BITMAP_LEN)
    }
}

/// Key payload of a single-attribute index tuple.
pub fn index_getattr(itup: &[u8]) -> &[u8] {
    let start = index_info_find_data_offset(index_tuple_info(itup));
    let size = index_tuple_size(itup);
    &itup[start..size]
}

/// Build a single-key index tuple from the attribute value.
///
/// Fixed-width assumption: the payload is the already-marshaled datum bytes
/// (a 4-byte hash code, or a NUL-terminated char key). Any null sets
/// `INDEX_NULL_MASK`; a varwidth attribute sets `INDEX_VAR_MASK`.
pub fn index_form_tuple(desc: &TupleDesc, value: &[u8], isnull: bool) -> Result<Vec<u8>> {
    if desc.natts() > INDEX_MAX_KEYS {
        return Err(SoeError::Invalid(format!(
            "number of index columns ({}) exceeds limit ({INDEX_MAX_KEYS})",
            desc.natts()
        )));
    }

    let mut infomask: u16 = 0;
    if isnull {
        infomask |= INDEX_NULL_MASK;
    }

    let attr = &desc.attrs[0];
    if attr.attlen < 0 {
        infomask |= INDEX_VAR_MASK;
    }

    let hoff = index_info_find_data_offset(infomask);
    let data_size = if isnull {
        0
    } else {
        att_align(0, attr) + value.len()
    };
    let size = maxalign(hoff + data_size);

    if size as u16 & INDEX_SIZE_MASK != size as u16 {
        return Err(SoeError::TooLarge {
            size,
            max: INDEX_SIZE_MASK as usize,
        });
    }
    infomask |= size as u16;

    let mut tuple = vec![0u8; size];
    if !isnull {
        let data_start = hoff + att_align(0, attr);
        tuple[data_start..data_start + value.len()].copy_from_slice(value);
    }
    index_tuple_set_info(&mut tuple, infomask);
    Ok(tuple)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_tuple_int_key() {
        let desc = TupleDesc::single_int_key();
        let hash = 0xAABBCCDDu32.to_le_bytes();
        let tuple = index_form_tuple(&desc, &hash, false).unwrap();
        assert_eq!(index_tuple_size(&tuple), tuple.len());
        assert_eq!(&index_getattr(&tuple)[..4], &hash);
        assert!(!index_tuple_has_nulls(&tuple));
    }

    #[test]
    fn test_form_tuple_char_key_sets_var_mask() {
        let desc = TupleDesc::single_char_key();
        let tuple = index_form_tuple(&desc, b"hello\0", false).unwrap();
        assert!(index_tuple_info(&tuple) & INDEX_VAR_MASK != 0);
        assert_eq!(&index_getattr(&tuple)[..6], b"hello\0");
    }

    #[test]
    fn test_null_sets_mask_and_bitmap_offset() {
        let desc = TupleDesc::single_int_key();
        let tuple = index_form_tuple(&desc, &[], true).unwrap();
        assert!(index_tuple_has_nulls(&tuple));
        assert_eq!(
            index_info_find_data_offset(index_tuple_info(&tuple)),
            maxalign(INDEX_TUPLE_HEADER_LEN + NULL_BITMAP_LEN)
        );
    }

    #[test]
    fn test_tid_and_downlink() {
        let desc = TupleDesc::single_int_key();
        let mut tuple = index_form_tuple(&desc, &[0; 4], false).unwrap();
        index_tuple_set_tid(&mut tuple, ItemPointer::new(12, 3));
        assert_eq!(index_tuple_get_tid(&tuple), ItemPointer::new(12, 3));
        inner_tuple_set_downlink(&mut tuple, 99);
        assert_eq!(inner_tuple_get_downlink(&tuple), 99);
        // Offset survives a downlink update.
        assert_eq!(index_tuple_get_tid(&tuple).offnum, 3);
    }
}
