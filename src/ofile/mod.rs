// Oblivious file adapters: the bridge between the ORAM's physically
// addressed blocks and the host's ciphertext files. One adapter per on-disk
// family (heap, hash, dynamic B-tree, OST). Encryption and decryption happen
// here — plaintext never crosses into a host callback.

pub mod hash;
pub mod heap;
pub mod nbtree;
pub mod ost;

use crate::common::{BlockNumber, BATCH_SIZE, BLCKSZ, DUMMY_BLOCK};
use crate::crypto::{page_decryption, page_encryption};
use crate::error::Result;
use crate::host::HostRef;

/// A physically-addressed block in flight between an adapter and the ORAM:
/// the *real* (logical) block number recovered from the page's special area,
/// and the plaintext page bytes.
#[derive(Debug, Clone)]
pub struct PLBlock {
    pub blkno: BlockNumber,
    pub page: Vec<u8>,
}

impl PLBlock {
    pub fn new(blkno: BlockNumber, page: Vec<u8>) -> Self {
        Self { blkno, page }
    }

    pub fn is_dummy(&self) -> bool {
        self.blkno == DUMMY_BLOCK
    }
}

/// Adapter contract consumed by the ORAM layer.
pub trait OFile: Send {
    /// Initialize a page image for this family, recording `blkno` as its
    /// real block number in the special area.
    fn page_init(&self, page: &mut [u8], blkno: BlockNumber);

    /// Pre-allocate `nblocks` encrypted dummy pages on the host.
    fn file_init(&mut self, name: &str, nblocks: u32) -> Result<()>;

    /// Fetch and decrypt the physical page `ob_blkno`.
    fn file_read(&mut self, name: &str, ob_blkno: BlockNumber) -> Result<PLBlock>;

    /// Encrypt and store `block` at physical page `ob_blkno`. A dummy block
    /// is re-initialized first so that evicting nothing useful is
    /// indistinguishable from a real eviction.
    fn file_write(&mut self, block: &mut PLBlock, name: &str, ob_blkno: BlockNumber) -> Result<()>;

    fn file_close(&mut self, name: &str) -> Result<()>;
}

/// Shared `file_init` body: batches of freshly-initialized dummy pages,
/// each encrypted, handed to the host at increasing offsets. Batching keeps
/// the transient allocation bounded at `BATCH_SIZE` pages.
pub(crate) fn init_dummy_pages(
    host: &HostRef,
    name: &str,
    nblocks: u32,
    page_init: impl Fn(&mut [u8], BlockNumber),
) -> Result<()> {
    let mut remaining = nblocks;
    let mut boffset: BlockNumber = 0;
    let mut tmp = vec![0u8; BLCKSZ];
    while remaining > 0 {
        let alloc = remaining.min(BATCH_SIZE);
        let mut batch = vec![0u8; alloc as usize * BLCKSZ];
        for chunk in batch.chunks_exact_mut(BLCKSZ) {
            page_init(&mut tmp, DUMMY_BLOCK);
            page_encryption(&tmp, chunk)?;
        }
        host.file_init(name, &batch, alloc, BLCKSZ, boffset)?;
        remaining -= alloc;
        boffset += alloc;
    }
    Ok(())
}

/// Shared `file_read` body: fetch, decrypt, recover the real block number
/// through `real_blkno`.
pub(crate) fn read_page(
    host: &HostRef,
    name: &str,
    ob_blkno: BlockNumber,
    real_blkno: impl Fn(&[u8]) -> BlockNumber,
) -> Result<PLBlock> {
    let mut cipher = vec![0u8; BLCKSZ];
    host.file_read(name, ob_blkno, &mut cipher)?;
    let mut page = vec![0u8; BLCKSZ];
    page_decryption(&cipher, &mut page)?;
    let blkno = real_blkno(&page);
    tracing::trace!(name, ob_blkno, blkno, "ofile read");
    Ok(PLBlock::new(blkno, page))
}

/// Shared `file_write` body.
pub(crate) fn write_page(
    host: &HostRef,
    name: &str,
    ob_blkno: BlockNumber,
    block: &mut PLBlock,
    page_init: impl Fn(&mut [u8], BlockNumber),
) -> Result<()> {
    if block.is_dummy() {
        page_init(&mut block.page, DUMMY_BLOCK);
    }
    let mut cipher = vec![0u8; BLCKSZ];
    page_encryption(&block.page, &mut cipher)?;
    tracing::trace!(name, ob_blkno, blkno = block.blkno, "ofile write");
    host.file_write(name, ob_blkno, &cipher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemHost;

    #[test]
    fn test_init_batches_large_allocations() {
        let host = MemHost::new();
        let host_ref: HostRef = host.clone();
        init_dummy_pages(&host_ref, "big", BATCH_SIZE + 5, |page, _| {
            page.fill(0);
        })
        .unwrap();
        assert_eq!(host.nblocks("big"), (BATCH_SIZE + 5) as usize);
        // Two init callbacks: one full batch, one remainder.
        assert_eq!(
            host.trace()
                .iter()
                .filter(|e| matches!(e, crate::host::HostEvent::Init { .. }))
                .count(),
            2
        );
    }
}
