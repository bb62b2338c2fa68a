//! Heap tuple layout.
//!
//! A stored heap item is an 8-byte header carrying the tuple's own identity
//! (`t_ctid`, stamped at insert time) followed by the opaque payload handed
//! across the trust boundary.

use crate::common::{ItemPointer, Oid};

/// Header: 6-byte encoded tid plus 2 bytes of alignment padding.
pub const HEAP_TUPLE_HEADER_LEN: usize = 8;

/// In-memory descriptor of a fetched heap tuple.
#[derive(Debug, Clone)]
pub struct HeapTuple {
    pub t_self: ItemPointer,
    pub t_len: usize,
    pub t_table_oid: Oid,
    /// Full stored item bytes (header + payload).
    pub t_data: Vec<u8>,
}

impl HeapTuple {
    pub fn payload(&self) -> &[u8] {
        &self.t_data[HEAP_TUPLE_HEADER_LEN..]
    }
}

/// Build a storable heap item around `payload`.
pub fn heap_form_tuple(payload: &[u8]) -> Vec<u8> {
    let mut item = vec![0u8; HEAP_TUPLE_HEADER_LEN + payload.len()];
    item[HEAP_TUPLE_HEADER_LEN..].copy_from_slice(payload);
    item
}

pub fn heap_tuple_set_ctid(item: &mut [u8], tid: ItemPointer) {
    debug_assert!(item.len() >= HEAP_TUPLE_HEADER_LEN);
    tid.encode(&mut item[0..ItemPointer::ENCODED_LEN]);
}

pub fn heap_tuple_get_ctid(item: &[u8]) -> ItemPointer {
    ItemPointer::decode(&item[0..ItemPointer::ENCODED_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_and_stamp() {
        let mut item = heap_form_tuple(b"payload");
        let tid = ItemPointer::new(3, 7);
        heap_tuple_set_ctid(&mut item, tid);
        assert_eq!(heap_tuple_get_ctid(&item), tid);
        assert_eq!(&item[HEAP_TUPLE_HEADER_LEN..], b"payload");
    }
}
