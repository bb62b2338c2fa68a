//! Scan keys, key comparison, and the per-tuple qualification check.
//!
//! All keys are NUL-terminated char datums; ordering is byte-wise. The
//! descent comparison is bounded by the probe's length, the qualification
//! check compares the full stored datum.

use crate::common::{Oid, OP_EQUAL, OP_GREATER, OP_GREATER_EQUAL, OP_LESS, OP_LESS_EQUAL};
use crate::error::{Result, SoeError};
use crate::page::itup::index_getattr;
use crate::page::{page_get_item, page_get_item_id};

use super::BTPageOpaque;

/// Insertion-type scan key for a single char attribute.
#[derive(Debug, Clone)]
pub struct ScanKey {
    pub sk_subtype: Oid,
    /// NUL-terminated key bytes.
    pub sk_argument: Vec<u8>,
}

impl ScanKey {
    pub fn new(sk_subtype: Oid, datum: &[u8]) -> Self {
        let mut sk_argument = datum.to_vec();
        if !sk_argument.ends_with(&[0]) {
            sk_argument.push(0);
        }
        Self {
            sk_subtype,
            sk_argument,
        }
    }
}

/// Bytes before the terminating NUL.
pub fn c_strlen(s: &[u8]) -> usize {
    s.iter().position(|&b| b == 0).unwrap_or(s.len())
}

/// Byte-wise `strncmp` with NUL-termination semantics.
pub fn strncmp(a: &[u8], b: &[u8], n: usize) -> i32 {
    for i in 0..n {
        let ca = a.get(i).copied().unwrap_or(0);
        let cb = b.get(i).copied().unwrap_or(0);
        if ca != cb {
            return ca as i32 - cb as i32;
        }
        if ca == 0 {
            return 0;
        }
    }
    0
}

/// Byte-wise `strcmp` over NUL-terminated datums.
pub fn strcmp(a: &[u8], b: &[u8]) -> i32 {
    let mut i = 0;
    loop {
        let ca = a.get(i).copied().unwrap_or(0);
        let cb = b.get(i).copied().unwrap_or(0);
        if ca != cb {
            return ca as i32 - cb as i32;
        }
        if ca == 0 {
            return 0;
        }
        i += 1;
    }
}

/// Compare the scan key against the tuple at `offnum`.
///
/// Returns <0, 0 or >0 as the scan key sorts before, equal to, or after the
/// tuple. The first data item of an internal page is minus infinity: the
/// scan key always sorts after it.
pub fn bt_compare(key: &ScanKey, page: &[u8], offnum: crate::common::OffsetNumber) -> i32 {
    let opaque = BTPageOpaque::read(page);
    if !opaque.is_leaf() && offnum == opaque.first_data_key() {
        return 1;
    }

    let itup = page_get_item(page, page_get_item_id(page, offnum));
    let datum = index_getattr(itup);
    strncmp(&key.sk_argument, datum, c_strlen(&key.sk_argument))
}

/// Initial-positioning strategy for a scan operator: `(nextkey, goback)`.
/// The two operators needing a backward scan are unsupported on this
/// design.
pub fn bt_strategy(opoid: Oid) -> Result<(bool, bool)> {
    match opoid {
        // Find first item >= key then back up: backward scan territory.
        OP_LESS => Err(SoeError::Unsupported(
            "strictly-less scans require backward scan",
        )),
        OP_LESS_EQUAL => Err(SoeError::Unsupported(
            "less-or-equal scans require backward scan",
        )),
        OP_EQUAL => Ok((false, false)),
        OP_GREATER_EQUAL => Ok((false, false)),
        OP_GREATER => Ok((true, false)),
        other => Err(SoeError::Invalid(format!(
            "unrecognized scan operator {other}"
        ))),
    }
}

/// Test whether the tuple at `offnum` satisfies the scan operator, and
/// whether the forward scan can continue past it. Returns the heap TID on a
/// match.
pub fn bt_checkkeys(
    key: &ScanKey,
    opoid: Oid,
    page: &[u8],
    offnum: crate::common::OffsetNumber,
) -> (Option<crate::common::ItemPointer>, bool) {
    let itup = page_get_item(page, page_get_item_id(page, offnum));
    let datum = index_getattr(itup);
    let test = strcmp(datum, &key.sk_argument);

    let passes = match opoid {
        OP_LESS => test < 0,
        OP_LESS_EQUAL => test <= 0,
        OP_EQUAL => test == 0,
        OP_GREATER_EQUAL => test >= 0,
        OP_GREATER => test > 0,
        _ => false,
    };

    if passes {
        (Some(crate::page::itup::index_tuple_get_tid(itup)), true)
    } else {
        (None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strncmp_semantics() {
        assert_eq!(strncmp(b"abc\0", b"abc\0", 3), 0);
        assert!(strncmp(b"abc\0", b"abd\0", 3) < 0);
        assert_eq!(strncmp(b"ab\0", b"abX\0", 2), 0);
        // NUL stops the comparison.
        assert!(strncmp(b"a\0", b"ab\0", 5) < 0);
    }

    #[test]
    fn test_strcmp_orders_prefixes() {
        assert!(strcmp(b"a\0", b"ab\0") < 0);
        assert!(strcmp(b"b\0", b"ab\0") > 0);
        assert_eq!(strcmp(b"key\0", b"key\0"), 0);
    }

    #[test]
    fn test_strategy_mapping() {
        assert_eq!(bt_strategy(crate::common::OP_EQUAL).unwrap(), (false, false));
        assert_eq!(bt_strategy(crate::common::OP_GREATER).unwrap(), (true, false));
        assert!(matches!(
            bt_strategy(crate::common::OP_LESS),
            Err(SoeError::Unsupported(_))
        ));
        assert!(matches!(
            bt_strategy(9999),
            Err(SoeError::Invalid(_))
        ));
    }

    #[test]
    fn test_scan_key_nul_terminates() {
        let key = ScanKey::new(0, b"abc");
        assert_eq!(key.sk_argument, b"abc\0");
        let key = ScanKey::new(0, b"abc\0");
        assert_eq!(key.sk_argument, b"abc\0");
    }
}
