// Hash index engine: bucket pages addressed through splitpoint arithmetic,
// overflow chains tracked by bitmap pages, linear splitting driven by a
// tuples-per-bucket fill factor. All page traffic goes through the oblivious
// buffer manager.

pub mod insert;
pub mod ovfl;
pub mod page;
pub mod search;
pub mod util;

pub use insert::hash_insert;
pub use page::hash_init;
pub use search::{hash_begin_scan, hash_end_scan, hash_get_tuple, HashScan};

use crate::common::{BlockNumber, OffsetNumber, BLCKSZ};
use crate::error::{Result, SoeError};
use crate::page::{page_get_special, page_get_special_mut, SIZE_OF_PAGE_HEADER};
use crate::common::maxalign;

/// Bucket number within the index.
pub type Bucket = u32;

pub const INVALID_BUCKET: Bucket = 0xFFFF_FFFF;

pub const HASH_METAPAGE: BlockNumber = 0;
pub const HASH_MAGIC: u32 = 0x6440640;
pub const HASH_VERSION: u32 = 4;

pub const HASH_DEFAULT_FILLFACTOR: usize = 75;

/// Page-type bits plus transient state bits in `hasho_flag`.
pub const LH_UNUSED_PAGE: u16 = 0;
pub const LH_OVERFLOW_PAGE: u16 = 1 << 0;
pub const LH_BUCKET_PAGE: u16 = 1 << 1;
pub const LH_BITMAP_PAGE: u16 = 1 << 2;
pub const LH_META_PAGE: u16 = 1 << 3;
pub const LH_BUCKET_BEING_POPULATED: u16 = 1 << 4;
pub const LH_BUCKET_BEING_SPLIT: u16 = 1 << 5;
pub const LH_BUCKET_NEEDS_SPLIT_CLEANUP: u16 = 1 << 6;
pub const LH_PAGE_HAS_DEAD_TUPLES: u16 = 1 << 7;

pub const LH_PAGE_TYPE: u16 = LH_OVERFLOW_PAGE | LH_BUCKET_PAGE | LH_BITMAP_PAGE | LH_META_PAGE;

/// Trailing page-type tag, for tools that inspect raw pages.
pub const HASHO_PAGE_ID: u16 = 0xFF80;

/// Splitpoint phase layout (grows one phase per doubling after the first
/// `HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE` groups).
pub const HASH_SPLITPOINT_PHASE_BITS: u32 = 2;
pub const HASH_SPLITPOINT_PHASES_PER_GRP: u32 = 1 << HASH_SPLITPOINT_PHASE_BITS;
pub const HASH_SPLITPOINT_PHASE_MASK: u32 = HASH_SPLITPOINT_PHASES_PER_GRP - 1;
pub const HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE: u32 = 10;
pub const HASH_MAX_SPLITPOINT_GROUP: u32 = 32;
pub const HASH_MAX_SPLITPOINTS: usize = (((HASH_MAX_SPLITPOINT_GROUP
    - HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE)
    * HASH_SPLITPOINT_PHASES_PER_GRP)
    + HASH_SPLITPOINT_GROUPS_WITH_ONE_PHASE) as usize;

pub const HASH_MAX_BITMAPS: usize = if BLCKSZ / 8 < 1024 { BLCKSZ / 8 } else { 1024 };

/// Bits per bitmap word.
pub const BITS_PER_MAP: u32 = 32;
pub const ALL_SET: u32 = !0u32;
pub const BYTE_TO_BIT: u32 = 3;

/// Special area of a hash page:
/// `(o_blkno, prev, next, bucket, flags, page_id)`.
pub const HASH_SPECIAL_SIZE: usize = maxalign(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPageOpaque {
    pub o_blkno: BlockNumber,
    pub prev_blkno: BlockNumber,
    pub next_blkno: BlockNumber,
    pub bucket: Bucket,
    pub flag: u16,
    pub page_id: u16,
}

impl HashPageOpaque {
    pub fn read(page: &[u8]) -> Self {
        let sp = page_get_special(page);
        Self {
            o_blkno: u32::from_le_bytes([sp[0], sp[1], sp[2], sp[3]]),
            prev_blkno: u32::from_le_bytes([sp[4], sp[5], sp[6], sp[7]]),
            next_blkno: u32::from_le_bytes([sp[8], sp[9], sp[10], sp[11]]),
            bucket: u32::from_le_bytes([sp[12], sp[13], sp[14], sp[15]]),
            flag: u16::from_le_bytes([sp[16], sp[17]]),
            page_id: u16::from_le_bytes([sp[18], sp[19]]),
        }
    }

    pub fn write(&self, page: &mut [u8]) {
        let sp = page_get_special_mut(page);
        sp[0..4].copy_from_slice(&self.o_blkno.to_le_bytes());
        sp[4..8].copy_from_slice(&self.prev_blkno.to_le_bytes());
        sp[8..12].copy_from_slice(&self.next_blkno.to_le_bytes());
        sp[12..16].copy_from_slice(&self.bucket.to_le_bytes());
        sp[16..18].copy_from_slice(&self.flag.to_le_bytes());
        sp[18..20].copy_from_slice(&self.page_id.to_le_bytes());
    }

    pub fn page_type(&self) -> u16 {
        self.flag & LH_PAGE_TYPE
    }
}

/// Largest bitmap array that fits in a hash page's contents region.
pub const fn hash_get_max_bitmap_size() -> usize {
    BLCKSZ - SIZE_OF_PAGE_HEADER - HASH_SPECIAL_SIZE
}

/// Maximum index tuple size: one tuple per page must always be possible.
pub fn hash_max_item_size() -> usize {
    crate::common::maxalign_down(
        BLCKSZ - SIZE_OF_PAGE_HEADER - crate::page::ITEM_ID_LEN - HASH_SPECIAL_SIZE,
    )
}

/// In-memory image of the hash metapage, read from and written back to the
/// page's contents region.
#[derive(Debug, Clone)]
pub struct HashMetaPage {
    pub magic: u32,
    pub version: u32,
    pub ntuples: f64,
    pub ffactor: u16,
    pub bsize: u16,
    pub bmsize: u16,
    pub bmshift: u16,
    pub maxbucket: u32,
    pub highmask: u32,
    pub lowmask: u32,
    pub ovflpoint: u32,
    pub firstfree: u32,
    pub nmaps: u32,
    pub procid: u32,
    pub spares: [u32; HASH_MAX_SPLITPOINTS],
    pub mapp: Vec<BlockNumber>,
}

/// Serialized metapage footprint inside the contents region.
pub const HASH_META_LEN: usize = 52 + HASH_MAX_SPLITPOINTS * 4 + HASH_MAX_BITMAPS * 4;

impl HashMetaPage {
    pub fn read(page: &[u8]) -> Result<Self> {
        let c = crate::page::page_get_contents(page);
        let magic = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
        if magic != HASH_MAGIC {
            return Err(SoeError::Invalid(format!(
                "hash metapage magic {magic:#x} does not match {HASH_MAGIC:#x}"
            )));
        }
        let mut spares = [0u32; HASH_MAX_SPLITPOINTS];
        for (i, s) in spares.iter_mut().enumerate() {
            let p = 52 + i * 4;
            *s = u32::from_le_bytes([c[p], c[p + 1], c[p + 2], c[p + 3]]);
        }
        let base = 52 + HASH_MAX_SPLITPOINTS * 4;
        let mut mapp = vec![0u32; HASH_MAX_BITMAPS];
        for (i, m) in mapp.iter_mut().enumerate() {
            let p = base + i * 4;
            *m = u32::from_le_bytes([c[p], c[p + 1], c[p + 2], c[p + 3]]);
        }
        Ok(Self {
            magic,
            version: u32::from_le_bytes([c[4], c[5], c[6], c[7]]),
            ntuples: f64::from_le_bytes(c[8..16].try_into().unwrap()),
            ffactor: u16::from_le_bytes([c[16], c[17]]),
            bsize: u16::from_le_bytes([c[18], c[19]]),
            bmsize: u16::from_le_bytes([c[20], c[21]]),
            bmshift: u16::from_le_bytes([c[22], c[23]]),
            maxbucket: u32::from_le_bytes([c[24], c[25], c[26], c[27]]),
            highmask: u32::from_le_bytes([c[28], c[29], c[30], c[31]]),
            lowmask: u32::from_le_bytes([c[32], c[33], c[34], c[35]]),
            ovflpoint: u32::from_le_bytes([c[36], c[37], c[38], c[39]]),
            firstfree: u32::from_le_bytes([c[40], c[41], c[42], c[43]]),
            nmaps: u32::from_le_bytes([c[44], c[45], c[46], c[47]]),
            procid: u32::from_le_bytes([c[48], c[49], c[50], c[51]]),
            spares,
            mapp,
        })
    }

    pub fn write(&self, page: &mut [u8]) {
        let c = crate::page::page_get_contents_mut(page);
        c[0..4].copy_from_slice(&self.magic.to_le_bytes());
        c[4..8].copy_from_slice(&self.version.to_le_bytes());
        c[8..16].copy_from_slice(&self.ntuples.to_le_bytes());
        c[16..18].copy_from_slice(&self.ffactor.to_le_bytes());
        c[18..20].copy_from_slice(&self.bsize.to_le_bytes());
        c[20..22].copy_from_slice(&self.bmsize.to_le_bytes());
        c[22..24].copy_from_slice(&self.bmshift.to_le_bytes());
        c[24..28].copy_from_slice(&self.maxbucket.to_le_bytes());
        c[28..32].copy_from_slice(&self.highmask.to_le_bytes());
        c[32..36].copy_from_slice(&self.lowmask.to_le_bytes());
        c[36..40].copy_from_slice(&self.ovflpoint.to_le_bytes());
        c[40..44].copy_from_slice(&self.firstfree.to_le_bytes());
        c[44..48].copy_from_slice(&self.nmaps.to_le_bytes());
        c[48..52].copy_from_slice(&self.procid.to_le_bytes());
        for (i, s) in self.spares.iter().enumerate() {
            let p = 52 + i * 4;
            c[p..p + 4].copy_from_slice(&s.to_le_bytes());
        }
        let base = 52 + HASH_MAX_SPLITPOINTS * 4;
        for (i, m) in self.mapp.iter().enumerate() {
            let p = base + i * 4;
            c[p..p + 4].copy_from_slice(&m.to_le_bytes());
        }
        // Cover the metadata with pd_lower so the tail reads as free space.
        crate::page::page_set_contents_len(page, HASH_META_LEN);
    }

    /// Bits per bitmap page.
    pub fn bmpg_bits(&self) -> u32 {
        (self.bmsize as u32) << BYTE_TO_BIT
    }

    pub fn bmpg_shift(&self) -> u32 {
        self.bmshift as u32
    }

    pub fn bmpg_mask(&self) -> u32 {
        self.bmpg_bits() - 1
    }
}

/// Position in a hash scan: items matched on the current page plus the
/// forward/backward chain links needed to continue.
#[derive(Debug, Clone)]
pub struct HashScanPos {
    pub buf: Option<BlockNumber>,
    pub curr_page: BlockNumber,
    pub next_page: BlockNumber,
    pub prev_page: BlockNumber,
    pub first_item: usize,
    pub last_item: usize,
    pub item_index: usize,
    pub items: Vec<(crate::common::ItemPointer, OffsetNumber)>,
}

impl HashScanPos {
    pub fn invalid() -> Self {
        Self {
            buf: None,
            curr_page: crate::common::INVALID_BLOCK_NUMBER,
            next_page: crate::common::INVALID_BLOCK_NUMBER,
            prev_page: crate::common::INVALID_BLOCK_NUMBER,
            first_item: 0,
            last_item: 0,
            item_index: 0,
            items: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        crate::common::block_number_is_valid(self.curr_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BLCKSZ;
    use crate::page::page_init;

    #[test]
    fn test_opaque_roundtrip() {
        let mut page = vec![0u8; BLCKSZ];
        page_init(&mut page, HASH_SPECIAL_SIZE);
        let opaque = HashPageOpaque {
            o_blkno: 7,
            prev_blkno: 1,
            next_blkno: 2,
            bucket: 3,
            flag: LH_BUCKET_PAGE | LH_BUCKET_BEING_SPLIT,
            page_id: HASHO_PAGE_ID,
        };
        opaque.write(&mut page);
        let back = HashPageOpaque::read(&page);
        assert_eq!(back, opaque);
        assert_eq!(back.page_type(), LH_BUCKET_PAGE);
    }

    #[test]
    fn test_metapage_roundtrip() {
        let mut page = vec![0u8; BLCKSZ];
        page_init(&mut page, HASH_SPECIAL_SIZE);
        let mut meta = HashMetaPage {
            magic: HASH_MAGIC,
            version: HASH_VERSION,
            ntuples: 12.0,
            ffactor: 10,
            bsize: 4000,
            bmsize: 4096,
            bmshift: 15,
            maxbucket: 3,
            highmask: 7,
            lowmask: 3,
            ovflpoint: 2,
            firstfree: 0,
            nmaps: 1,
            procid: 0,
            spares: [0; HASH_MAX_SPLITPOINTS],
            mapp: vec![0; HASH_MAX_BITMAPS],
        };
        meta.spares[2] = 1;
        meta.mapp[0] = 5;
        meta.write(&mut page);
        let back = HashMetaPage::read(&page).unwrap();
        assert_eq!(back.maxbucket, 3);
        assert_eq!(back.spares[2], 1);
        assert_eq!(back.mapp[0], 5);
        assert_eq!(back.ntuples, 12.0);
    }

    #[test]
    fn test_metapage_fits_contents() {
        assert!(HASH_META_LEN <= BLCKSZ - SIZE_OF_PAGE_HEADER - HASH_SPECIAL_SIZE);
    }
}
