//! Hash utilities: the Jenkins lookup3 key hash, splitpoint arithmetic,
//! and per-page binary search over hashkey-ordered items.

use crate::buffer::{Buffer, VRelation};
use crate::common::{BlockNumber, OffsetNumber, FIRST_OFFSET_NUMBER};
use crate::error::{Result, SoeError};
use crate::page::itup::index_getattr;
use crate::page::{page_get_item, page_get_item_id, page_get_max_offset_number, page_is_new};

use super::{
    Bucket, HashMetaPage, HashPageOpaque, HASH_SPECIAL_SIZE, HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE,
    HASH_SPLITPOINT_PHASES_PER_GRP, HASH_SPLITPOINT_PHASE_BITS, HASH_SPLITPOINT_PHASE_MASK,
    LH_META_PAGE,
};

const HASH_SALT: u32 = 3_923_095;

#[inline]
fn rot(x: u32, k: u32) -> u32 {
    x.rotate_left(k)
}

#[inline]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= rot(*c, 4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= rot(*a, 6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= rot(*b, 8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= rot(*c, 16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= rot(*a, 19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= rot(*b, 4);
    *b = b.wrapping_add(*a);
}

#[inline]
fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(rot(*b, 14));
    *a ^= *c;
    *a = a.wrapping_sub(rot(*c, 11));
    *b ^= *a;
    *b = b.wrapping_sub(rot(*a, 25));
    *c ^= *b;
    *c = c.wrapping_sub(rot(*b, 16));
    *a ^= *c;
    *a = a.wrapping_sub(rot(*c, 4));
    *b ^= *a;
    *b = b.wrapping_sub(rot(*a, 14));
    *c ^= *b;
    *c = c.wrapping_sub(rot(*b, 24));
}

#[inline]
fn word(k: &[u8]) -> u32 {
    u32::from_le_bytes([k[0], k[1], k[2], k[3]])
}

/// Jenkins lookup3: hash a variable-length key into 32 bits. Every bit of
/// the key affects every bit of the result.
pub fn hash_any(key: &[u8]) -> u32 {
    let init = 0x9e37_79b9u32
        .wrapping_add(key.len() as u32)
        .wrapping_add(HASH_SALT);
    let mut a = init;
    let mut b = init;
    let mut c = init;
    let mut k = key;

    // Word-wide fetches; byte-order-equivalent to the unaligned path on the
    // little-endian targets this system supports.
    while k.len() >= 12 {
        a = a.wrapping_add(word(&k[0..4]));
        b = b.wrapping_add(word(&k[4..8]));
        c = c.wrapping_add(word(&k[8..12]));
        mix(&mut a, &mut b, &mut c);
        k = &k[12..];
    }

    // Last 11 bytes; the low byte of c is reserved for the length.
    if k.len() >= 8 {
        a = a.wrapping_add(word(&k[0..4]));
        b = b.wrapping_add(word(&k[4..8]));
        for (i, &byte) in k[8..].iter().enumerate() {
            c = c.wrapping_add((byte as u32) << (8 * (i + 1)));
        }
    } else if k.len() >= 4 {
        a = a.wrapping_add(word(&k[0..4]));
        for (i, &byte) in k[4..].iter().enumerate() {
            b = b.wrapping_add((byte as u32) << (8 * i));
        }
    } else {
        for (i, &byte) in k.iter().enumerate() {
            a = a.wrapping_add((byte as u32) << (8 * i));
        }
    }

    final_mix(&mut a, &mut b, &mut c);
    c
}

/// The one allowed hash-to-bucket assignment; must stay in sync with the
/// splitting discipline.
pub fn hashkey2bucket(hashkey: u32, maxbucket: u32, highmask: u32, lowmask: u32) -> Bucket {
    let mut bucket = hashkey & highmask;
    if bucket > maxbucket {
        bucket &= lowmask;
    }
    bucket
}

/// Smallest power of two >= `num`, as an exponent.
pub fn hash_log2(num: u32) -> u32 {
    let mut i = 0;
    let mut limit = 1u64;
    while limit < num as u64 {
        limit <<= 1;
        i += 1;
    }
    i
}

/// Splitpoint phase that the `num_bucket`'th bucket belongs to.
pub fn spareindex(num_bucket: u32) -> u32 {
    let splitpoint_group = hash_log2(num_bucket);
    if splitpoint_group < HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE {
        return splitpoint_group;
    }

    let mut splitpoint = HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE
        + ((splitpoint_group - HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE)
            << HASH_SPLITPOINT_PHASE_BITS);
    splitpoint += ((num_bucket - 1) >> (splitpoint_group - (HASH_SPLITPOINT_PHASE_BITS + 1)))
        & HASH_SPLITPOINT_PHASE_MASK;
    splitpoint
}

/// Total buckets allocated once `splitpoint_phase` is complete.
pub fn get_totalbuckets(splitpoint_phase: u32) -> u32 {
    if splitpoint_phase < HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE {
        return 1 << splitpoint_phase;
    }

    let splitpoint_group = HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE
        + ((splitpoint_phase - HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE)
            >> HASH_SPLITPOINT_PHASE_BITS);
    let mut total_buckets = 1 << (splitpoint_group - 1);
    let phases_within_group = ((splitpoint_phase - HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE)
        & HASH_SPLITPOINT_PHASE_MASK)
        + 1;
    total_buckets += ((1 << (splitpoint_group - 1)) >> HASH_SPLITPOINT_PHASE_BITS)
        * phases_within_group;
    total_buckets
}

/// Physical block of a bucket's primary page.
pub fn bucket_to_blkno(metap: &HashMetaPage, bucket: Bucket) -> BlockNumber {
    let spares = if bucket != 0 {
        metap.spares[(spareindex(bucket + 1) - 1) as usize]
    } else {
        0
    };
    bucket + spares + 1
}

/// Hash value carried in an index tuple's payload.
pub fn get_indextuple_hashkey(itup: &[u8]) -> u32 {
    let attr = index_getattr(itup);
    u32::from_le_bytes([attr[0], attr[1], attr[2], attr[3]])
}

/// First offset whose hashkey >= `hash_value`, preserving per-page hashkey
/// order. May return one past the last slot.
pub fn hash_binsearch(page: &[u8], hash_value: u32) -> OffsetNumber {
    let mut lower = FIRST_OFFSET_NUMBER;
    let mut upper = page_get_max_offset_number(page) + 1;

    while upper > lower {
        let off = lower + (upper - lower) / 2;
        let itup = page_get_item(page, page_get_item_id(page, off));
        if get_indextuple_hashkey(itup) < hash_value {
            lower = off + 1;
        } else {
            upper = off;
        }
    }
    lower
}

/// Verify a freshly-read hash page: sane header, right special size, and a
/// page type in the allowed set.
pub fn hash_checkpage(rel: &VRelation, buf: Buffer, flags: u16) -> Result<()> {
    let page = rel.page(buf)?;
    if page_is_new(page) {
        return Err(SoeError::Invalid(format!(
            "hash index contains unexpected zero page at block {buf}"
        )));
    }
    if crate::page::page_get_special_size(page) != HASH_SPECIAL_SIZE {
        return Err(SoeError::Invalid(format!(
            "hash index contains corrupted page at block {buf}"
        )));
    }
    let opaque = HashPageOpaque::read(page);
    if flags != 0 && opaque.page_type() & flags == 0 {
        return Err(SoeError::Invalid(format!(
            "hash index contains page of unexpected type {:#x} at block {buf}",
            opaque.flag
        )));
    }
    if flags & LH_META_PAGE != 0 {
        // Magic is validated on decode.
        HashMetaPage::read(page)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_any_spreads_bits() {
        let a = hash_any(b"hello");
        let b = hash_any(b"hellp");
        let c = hash_any(b"hell");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, hash_any(b"hello"));
    }

    #[test]
    fn test_hash_any_handles_all_tail_lengths() {
        // Exercise every tail-switch arm.
        let base: Vec<u8> = (0u8..32).collect();
        let mut seen = std::collections::HashSet::new();
        for len in 0..=24 {
            assert!(seen.insert(hash_any(&base[..len])));
        }
    }

    #[test]
    fn test_hashkey2bucket_masks() {
        // maxbucket 2, highmask 3, lowmask 1: hash 3 exceeds maxbucket and
        // wraps to its low half.
        assert_eq!(hashkey2bucket(3, 2, 3, 1), 1);
        assert_eq!(hashkey2bucket(2, 2, 3, 1), 2);
        // Idempotent on its arguments.
        assert_eq!(hashkey2bucket(3, 2, 3, 1), hashkey2bucket(3, 2, 3, 1));
    }

    #[test]
    fn test_log2() {
        assert_eq!(hash_log2(1), 0);
        assert_eq!(hash_log2(2), 1);
        assert_eq!(hash_log2(3), 2);
        assert_eq!(hash_log2(1024), 10);
    }

    #[test]
    fn test_spareindex_and_totalbuckets_agree() {
        // Phases with one group per doubling: totals are exact powers.
        for phase in 0..HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE {
            assert_eq!(get_totalbuckets(phase), 1 << phase);
        }
        // Every bucket number maps into a phase whose total covers it.
        for bucket in 1..5000u32 {
            let phase = spareindex(bucket);
            assert!(get_totalbuckets(phase) >= bucket);
            if phase > 0 {
                assert!(get_totalbuckets(phase - 1) < bucket);
            }
        }
    }

    #[test]
    fn test_bucket_to_blkno_without_overflow_pages() {
        let meta = HashMetaPage {
            magic: super::super::HASH_MAGIC,
            version: super::super::HASH_VERSION,
            ntuples: 0.0,
            ffactor: 10,
            bsize: 0,
            bmsize: 4096,
            bmshift: 15,
            maxbucket: 3,
            highmask: 7,
            lowmask: 3,
            ovflpoint: 2,
            firstfree: 0,
            nmaps: 0,
            procid: 0,
            spares: [0; super::super::HASH_MAX_SPLITPOINTS],
            mapp: vec![0; super::super::HASH_MAX_BITMAPS],
        };
        // Buckets 0..=3 occupy blocks 1..=4 when no spares intervene.
        for bucket in 0..4 {
            assert_eq!(bucket_to_blkno(&meta, bucket), bucket + 1);
        }
    }
}
