//! Buffer management for the OST forest: one resident list per level, reads
//! routed either to the root file page (level 0) or to that level's ORAM.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::common::{BlockNumber, Oid, BLCKSZ};
use crate::crypto::Token;
use crate::error::{Result, SoeError};
use crate::host::HostRef;
use crate::ofile::ost::OstOFile;
use crate::ofile::{OFile, PLBlock};
use crate::oram::Oram;
use crate::page::tupdesc::TupleDesc;

pub use super::Buffer;

/// Forest-wide static state: level fanouts and the per-level ORAMs.
pub struct OstState {
    pub iname: String,
    pub ioid: Oid,
    pub nlevels: u32,
    pub fanouts: Arc<Vec<u32>>,
    pub orams: Vec<Oram>,
}

struct OstVBlock {
    id: BlockNumber,
    page: Vec<u8>,
}

/// Per-relation handle over the forest. `level` selects which level the
/// next buffer operation addresses; the search code advances it as it
/// descends.
pub struct OstRelation {
    pub osts: OstState,
    root_ofile: OstOFile,
    pub rd_id: Oid,
    pub tuple_desc: TupleDesc,

    pub level: u32,
    buffers: Vec<Vec<OstVBlock>>,

    pub token: Option<Token>,
    pub leaf_counter: u32,
    pub heap_block_counter: u32,
}

impl OstRelation {
    /// Build the forest: the shared backing file, one ORAM per level >= 1.
    pub fn new(
        host: HostRef,
        name: &str,
        ioid: Oid,
        fanouts: Vec<u32>,
        tuple_desc: TupleDesc,
    ) -> Result<Self> {
        let nlevels = fanouts.len() as u32;
        let fanouts = Arc::new(fanouts);
        let initialized = Arc::new(AtomicBool::new(false));

        let mut root_ofile = OstOFile::new(host.clone(), fanouts.clone(), 0, initialized.clone());
        root_ofile.file_init(name, 1)?;

        let mut orams = Vec::with_capacity(nlevels as usize);
        for level in 1..=nlevels {
            let ofile = OstOFile::new(host.clone(), fanouts.clone(), level, initialized.clone());
            orams.push(Oram::new(
                name,
                fanouts[(level - 1) as usize],
                Box::new(ofile),
            )?);
        }

        let buffers = (0..=nlevels).map(|_| Vec::new()).collect();

        Ok(Self {
            osts: OstState {
                iname: name.to_string(),
                ioid,
                nlevels,
                fanouts,
                orams,
            },
            root_ofile,
            rd_id: ioid,
            tuple_desc,
            level: 0,
            buffers,
            token: None,
            leaf_counter: 0,
            heap_block_counter: 0,
        })
    }

    fn resident(&self, level: u32, blkno: BlockNumber) -> Option<usize> {
        self.buffers[level as usize].iter().position(|b| b.id == blkno)
    }

    /// Read a block at the current level. Level 0 is the root file page,
    /// deeper levels go through their ORAM. A never-written ORAM block comes
    /// back zeroed; the loader writes its content before any search runs.
    pub fn read_buffer(&mut self, blkno: BlockNumber) -> Result<Buffer> {
        let level = self.level;
        let page = if level == 0 {
            self.root_ofile
                .file_read(&self.osts.iname, blkno)
                .map(|b| b.page)?
        } else {
            let oram = &mut self.osts.orams[(level - 1) as usize];
            if let Some(token) = self.token.take() {
                oram.set_token(token);
            }
            match oram.read(blkno)? {
                Some(page) => page,
                None => vec![0u8; BLCKSZ],
            }
        };
        self.buffers[level as usize].push(OstVBlock { id: blkno, page });
        Ok(blkno)
    }

    /// One discarded read against `level`, indistinguishable in the host
    /// trace from a real one.
    pub fn read_dummy_buffer(&mut self, level: u32) -> Result<()> {
        if level == 0 {
            self.root_ofile.file_read(&self.osts.iname, 0)?;
            Ok(())
        } else {
            let oram = &mut self.osts.orams[(level - 1) as usize];
            if let Some(token) = self.token.take() {
                oram.set_token(token);
            }
            oram.read_dummy()
        }
    }

    pub fn page(&self, buffer: Buffer) -> Result<&[u8]> {
        self.resident(self.level, buffer)
            .map(|i| self.buffers[self.level as usize][i].page.as_slice())
            .ok_or_else(|| {
                SoeError::Invalid(format!(
                    "no resident page for buffer {buffer} at level {}",
                    self.level
                ))
            })
    }

    pub fn page_mut(&mut self, buffer: Buffer) -> Result<&mut [u8]> {
        let level = self.level;
        let idx = self.resident(level, buffer).ok_or_else(|| {
            SoeError::Invalid(format!(
                "no resident page for buffer {buffer} at level {level}"
            ))
        })?;
        Ok(self.buffers[level as usize][idx].page.as_mut_slice())
    }

    /// Push the page at the current level back to its store.
    pub fn mark_buffer_dirty(&mut self, buffer: Buffer) -> Result<()> {
        let level = self.level;
        let idx = self
            .resident(level, buffer)
            .ok_or_else(|| SoeError::Invalid(format!("no resident page for buffer {buffer}")))?;
        let entry = &mut self.buffers[level as usize][idx];
        if level == 0 {
            let mut block = PLBlock::new(entry.id, std::mem::take(&mut entry.page));
            let result = self
                .root_ofile
                .file_write(&mut block, &self.osts.iname, entry.id);
            self.buffers[level as usize][idx].page = block.page;
            result
        } else {
            let id = entry.id;
            let page = std::mem::take(&mut entry.page);
            let oram = &mut self.osts.orams[(level - 1) as usize];
            if let Some(token) = self.token.take() {
                oram.set_token(token);
            }
            let result = oram.write(&page, id);
            self.buffers[level as usize][idx].page = page;
            result
        }
    }

    pub fn release_buffer(&mut self, buffer: Buffer) {
        let level = self.level;
        match self.resident(level, buffer) {
            Some(idx) => {
                self.buffers[level as usize].swap_remove(idx);
            }
            None => tracing::debug!(buffer, level, "could not find buffer to release"),
        }
    }

    /// Accept one pre-built block: the root goes straight to the file page,
    /// deeper blocks land in their level's ORAM at the given offset.
    pub fn load_block(&mut self, block: &[u8], level: u32, offset: BlockNumber) -> Result<()> {
        if block.len() != BLCKSZ {
            return Err(SoeError::Invalid(format!(
                "ost load block of {} bytes",
                block.len()
            )));
        }
        if level > self.osts.nlevels {
            return Err(SoeError::Invalid(format!(
                "ost load level {level} beyond forest depth {}",
                self.osts.nlevels
            )));
        }
        if level == 0 {
            let mut plblock = PLBlock::new(offset, block.to_vec());
            self.root_ofile
                .file_write(&mut plblock, &self.osts.iname, offset)
        } else {
            self.osts.orams[(level - 1) as usize].write(block, offset)
        }
    }

    pub fn close(&mut self) -> Result<()> {
        for level in self.buffers.iter_mut() {
            level.clear();
        }
        for oram in self.osts.orams.iter_mut() {
            oram.close()?;
        }
        self.root_ofile.file_close(&self.osts.iname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemHost;
    use crate::ofile::ost::ost_page_init;

    fn forest() -> (OstRelation, std::sync::Arc<MemHost>) {
        let host = MemHost::new();
        let rel = OstRelation::new(
            host.clone(),
            "ost",
            77,
            vec![2, 4],
            TupleDesc::single_char_key(),
        )
        .unwrap();
        (rel, host)
    }

    #[test]
    fn test_forest_allocates_all_levels() {
        let (_, host) = forest();
        assert_eq!(host.nblocks("ost"), 7);
    }

    #[test]
    fn test_load_and_read_per_level() {
        let (mut rel, _) = forest();
        let mut page = vec![0u8; BLCKSZ];
        ost_page_init(&mut page, 1);
        page[200] = 0x77;
        rel.load_block(&page, 2, 1).unwrap();

        rel.level = 2;
        let buf = rel.read_buffer(1).unwrap();
        assert_eq!(rel.page(buf).unwrap()[200], 0x77);
        rel.release_buffer(buf);
    }

    #[test]
    fn test_root_is_direct_file_page() {
        let (mut rel, host) = forest();
        let mut page = vec![0u8; BLCKSZ];
        ost_page_init(&mut page, 0);
        page[64] = 0x11;
        rel.load_block(&page, 0, 0).unwrap();

        host.clear_trace();
        rel.level = 0;
        let buf = rel.read_buffer(0).unwrap();
        assert_eq!(rel.page(buf).unwrap()[64], 0x11);
        assert_eq!(host.read_count("ost"), 1);
    }

    #[test]
    fn test_levels_keep_separate_resident_lists() {
        let (mut rel, _) = forest();
        let mut page = vec![0u8; BLCKSZ];
        ost_page_init(&mut page, 0);
        rel.load_block(&page, 1, 0).unwrap();
        rel.load_block(&page, 2, 0).unwrap();

        rel.level = 1;
        rel.read_buffer(0).unwrap();
        rel.level = 2;
        rel.read_buffer(0).unwrap();
        assert!(rel.page(0).is_ok());
        rel.release_buffer(0);
        rel.level = 1;
        assert!(rel.page(0).is_ok());
    }
}
