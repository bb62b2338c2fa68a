//! Hash equality scan: locate the probe's bucket, load every hashkey match
//! from the chain into the scan position, and hand tuples out one at a time.

use crate::buffer::{Buffer, VRelation};
use crate::common::{block_number_is_valid, ItemPointer, INVALID_BLOCK_NUMBER};
use crate::error::Result;
use crate::page::itup::index_tuple_get_tid;
use crate::page::{page_get_item, page_get_item_id, page_get_max_offset_number};

use super::page::hash_getbucketbuf_from_hashkey;
use super::util::{get_indextuple_hashkey, hash_any, hash_binsearch, hash_checkpage};
use super::{HashPageOpaque, HashScanPos, LH_BUCKET_PAGE, LH_OVERFLOW_PAGE};

/// Private state of one hash index scan.
pub struct HashScan {
    /// Probe key bytes (NUL-terminated char datum).
    pub key: Vec<u8>,
    /// Hash of the probe key, the value actually searched for.
    pub sk_hash: u32,
    /// Pin on the primary bucket page, held until the scan ends.
    pub bucket_buf: Option<Buffer>,
    pub split_bucket_buf: Option<Buffer>,
    pub curr_pos: HashScanPos,
}

pub fn hash_begin_scan(key: &[u8]) -> HashScan {
    HashScan {
        key: key.to_vec(),
        sk_hash: 0,
        bucket_buf: None,
        split_bucket_buf: None,
        curr_pos: HashScanPos::invalid(),
    }
}

/// Advance the scan and return the next matching heap TID, or `None` at
/// end-of-scan (scan buffers released).
pub fn hash_get_tuple(rel: &mut VRelation, scan: &mut HashScan) -> Result<Option<ItemPointer>> {
    if !scan.curr_pos.is_valid() {
        hash_first(rel, scan)
    } else {
        hash_next(rel, scan)
    }
}

pub fn hash_end_scan(rel: &mut VRelation, scan: &mut HashScan) {
    hash_dropscanbuf(rel, scan);
}

fn hash_first(rel: &mut VRelation, scan: &mut HashScan) -> Result<Option<ItemPointer>> {
    let hashkey = hash_any(&scan.key);
    scan.sk_hash = hashkey;

    let (buf, _metap) = hash_getbucketbuf_from_hashkey(rel, hashkey)?;
    scan.bucket_buf = Some(buf);
    scan.curr_pos.buf = Some(buf);

    if !hash_readpage(rel, scan, buf)? {
        hash_dropscanbuf(rel, scan);
        scan.curr_pos = HashScanPos::invalid();
        return Ok(None);
    }
    Ok(Some(scan.curr_pos.items[scan.curr_pos.item_index].0))
}

fn hash_next(rel: &mut VRelation, scan: &mut HashScan) -> Result<Option<ItemPointer>> {
    scan.curr_pos.item_index += 1;
    if scan.curr_pos.item_index > scan.curr_pos.last_item {
        // Page exhausted: follow the overflow chain.
        let blkno = scan.curr_pos.next_page;
        let mut end_of_scan = true;
        if block_number_is_valid(blkno) {
            let buf = super::page::hash_getbuf(rel, blkno, LH_OVERFLOW_PAGE)?;
            if hash_readpage(rel, scan, buf)? {
                end_of_scan = false;
            }
        }
        if end_of_scan {
            hash_dropscanbuf(rel, scan);
            scan.curr_pos = HashScanPos::invalid();
            return Ok(None);
        }
    }
    Ok(Some(scan.curr_pos.items[scan.curr_pos.item_index].0))
}

/// Load the probe's matches from the page at `buf` into the scan position,
/// walking forward through the chain until a page yields at least one.
fn hash_readpage(rel: &mut VRelation, scan: &mut HashScan, buf: Buffer) -> Result<bool> {
    hash_checkpage(rel, buf, LH_BUCKET_PAGE | LH_OVERFLOW_PAGE)?;

    let mut buf = Some(buf);
    scan.curr_pos.buf = buf;
    scan.curr_pos.curr_page = buf.unwrap();

    loop {
        let current = buf.expect("current scan page pinned");
        let opaque = HashPageOpaque::read(rel.page(current)?);

        // Locate the probe's run of equal hashkeys by binary search, then
        // save every item while the hashkey still matches.
        let page = rel.page(current)?;
        let mut offnum = hash_binsearch(page, scan.sk_hash);
        let maxoff = page_get_max_offset_number(page);
        scan.curr_pos.items.clear();
        while offnum <= maxoff {
            let itup = page_get_item(page, page_get_item_id(page, offnum));
            if scan.sk_hash != get_indextuple_hashkey(itup) {
                break;
            }
            scan.curr_pos.items.push((index_tuple_get_tid(itup), offnum));
            offnum += 1;
        }

        if !scan.curr_pos.items.is_empty() {
            scan.curr_pos.first_item = 0;
            scan.curr_pos.last_item = scan.curr_pos.items.len() - 1;
            scan.curr_pos.item_index = 0;
            scan.curr_pos.prev_page = opaque.prev_blkno;
            scan.curr_pos.next_page = opaque.next_blkno;
            scan.curr_pos.curr_page = current;
            rel.release_buffer(current);
            scan.curr_pos.buf = None;
            return Ok(true);
        }

        // No match here; remember where we came from and move to the next
        // page in the chain.
        let prev_blkno = if Some(current) == scan.bucket_buf || Some(current) == scan.split_bucket_buf
        {
            INVALID_BLOCK_NUMBER
        } else {
            opaque.prev_blkno
        };

        buf = hash_readnext(rel, scan, current, opaque.next_blkno)?;
        match buf {
            Some(next) => {
                scan.curr_pos.buf = Some(next);
                scan.curr_pos.curr_page = next;
            }
            None => {
                scan.curr_pos.prev_page = prev_blkno;
                scan.curr_pos.next_page = INVALID_BLOCK_NUMBER;
                scan.curr_pos.buf = None;
                return Ok(false);
            }
        }
    }
}

/// Advance to the next page in the bucket chain, retaining the pin on the
/// primary bucket page until the scan ends.
fn hash_readnext(
    rel: &mut VRelation,
    scan: &HashScan,
    current: Buffer,
    next_blkno: crate::common::BlockNumber,
) -> Result<Option<Buffer>> {
    if Some(current) != scan.bucket_buf && Some(current) != scan.split_bucket_buf {
        rel.release_buffer(current);
    }
    if block_number_is_valid(next_blkno) {
        Ok(Some(super::page::hash_getbuf(
            rel,
            next_blkno,
            LH_OVERFLOW_PAGE,
        )?))
    } else {
        Ok(None)
    }
}

/// Release every buffer the scan still pins.
fn hash_dropscanbuf(rel: &mut VRelation, scan: &mut HashScan) {
    if let Some(bucket_buf) = scan.bucket_buf.take() {
        if scan.curr_pos.buf != Some(bucket_buf) {
            rel.release_buffer(bucket_buf);
        }
    }
    if let Some(split_buf) = scan.split_bucket_buf.take() {
        if scan.curr_pos.buf != Some(split_buf) {
            rel.release_buffer(split_buf);
        }
    }
    if let Some(buf) = scan.curr_pos.buf.take() {
        rel.release_buffer(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{hash_init, hash_insert};
    use crate::host::MemHost;
    use crate::ofile::hash::{hash_page_init, HashOFile};
    use crate::oram::Oram;
    use crate::page::tupdesc::TupleDesc;

    fn hash_rel(nblocks: u32) -> VRelation {
        let host = MemHost::new();
        let oram = Oram::new("hidx", nblocks, Box::new(HashOFile::new(host))).unwrap();
        VRelation::new(
            oram,
            81,
            nblocks,
            hash_page_init,
            TupleDesc::single_char_key(),
        )
    }

    fn scan_all(rel: &mut VRelation, key: &[u8]) -> Vec<ItemPointer> {
        let mut scan = hash_begin_scan(key);
        let mut tids = Vec::new();
        while let Some(tid) = hash_get_tuple(rel, &mut scan).unwrap() {
            tids.push(tid);
        }
        hash_end_scan(rel, &mut scan);
        tids
    }

    #[test]
    fn test_insert_then_scan_finds_tuple() {
        let mut rel = hash_rel(64);
        hash_init(&mut rel, 0.0, None).unwrap();
        hash_insert(&mut rel, ItemPointer::new(0, 1), b"hello\0").unwrap();

        let tids = scan_all(&mut rel, b"hello\0");
        assert_eq!(tids, vec![ItemPointer::new(0, 1)]);
        assert!(scan_all(&mut rel, b"other\0").is_empty());
    }

    #[test]
    fn test_duplicate_keys_both_returned() {
        let mut rel = hash_rel(64);
        hash_init(&mut rel, 0.0, None).unwrap();
        hash_insert(&mut rel, ItemPointer::new(0, 1), b"dup\0").unwrap();
        hash_insert(&mut rel, ItemPointer::new(0, 2), b"dup\0").unwrap();

        let tids = scan_all(&mut rel, b"dup\0");
        assert_eq!(tids.len(), 2);
    }

    #[test]
    fn test_split_preserves_lookups() {
        let mut rel = hash_rel(256);
        hash_init(&mut rel, 0.0, Some(1)).unwrap();

        let keys: Vec<Vec<u8>> = (0..20)
            .map(|i| format!("key-{i}\0").into_bytes())
            .collect();
        for (i, key) in keys.iter().enumerate() {
            hash_insert(&mut rel, ItemPointer::new(0, (i + 1) as u16), key).unwrap();
        }

        // ffactor 1 forces repeated splits; every key stays findable and
        // maps to exactly one tuple.
        for (i, key) in keys.iter().enumerate() {
            let tids = scan_all(&mut rel, key);
            assert_eq!(tids, vec![ItemPointer::new(0, (i + 1) as u16)], "key {i}");
        }

        let meta = crate::hash::page::hash_getcachedmetap(&mut rel, true).unwrap();
        assert!(meta.maxbucket > 1, "splits occurred");
    }

    #[test]
    fn test_split_leaves_no_foreign_tuples() {
        use crate::hash::page::{hash_getbuf, hash_getcachedmetap};
        use crate::hash::util::{bucket_to_blkno, hashkey2bucket};
        use crate::hash::{LH_BUCKET_PAGE, LH_OVERFLOW_PAGE};

        let mut rel = hash_rel(256);
        crate::hash::hash_init(&mut rel, 0.0, Some(1)).unwrap();
        for i in 0..16u16 {
            let key = format!("skey-{i}\0").into_bytes();
            hash_insert(&mut rel, ItemPointer::new(1, i + 1), &key).unwrap();
        }

        // After the splits, every tuple left on a bucket chain still maps
        // to that bucket under the current masks.
        let meta = hash_getcachedmetap(&mut rel, true).unwrap();
        for bucket in 0..=meta.maxbucket {
            let mut blkno = bucket_to_blkno(&meta, bucket);
            loop {
                let buf =
                    hash_getbuf(&mut rel, blkno, LH_BUCKET_PAGE | LH_OVERFLOW_PAGE).unwrap();
                let next = {
                    let page = rel.page(buf).unwrap();
                    let maxoff = crate::page::page_get_max_offset_number(page);
                    for off in 1..=maxoff {
                        let itup = crate::page::page_get_item(
                            page,
                            crate::page::page_get_item_id(page, off),
                        );
                        let h = get_indextuple_hashkey(itup);
                        assert_eq!(
                            hashkey2bucket(h, meta.maxbucket, meta.highmask, meta.lowmask),
                            bucket,
                            "tuple stranded on bucket {bucket}"
                        );
                    }
                    HashPageOpaque::read(page).next_blkno
                };
                rel.release_buffer(buf);
                if !block_number_is_valid(next) {
                    break;
                }
                blkno = next;
            }
        }
    }

    #[test]
    fn test_overflow_chain_walk() {
        let mut rel = hash_rel(256);
        // ffactor large enough that no split happens; two buckets, so one
        // bucket's chain must grow overflow pages.
        hash_init(&mut rel, 0.0, Some(10_000)).unwrap();

        for i in 0..900u32 {
            let key = format!("k{i}\0").into_bytes();
            hash_insert(&mut rel, ItemPointer::new(i, 1), &key).unwrap();
        }
        for i in (0..900u32).step_by(97) {
            let key = format!("k{i}\0").into_bytes();
            let tids = scan_all(&mut rel, &key);
            assert_eq!(tids, vec![ItemPointer::new(i, 1)]);
        }
    }
}
