//! Abstractions and code to access raw NAND flash, including the spare (OOB) area

use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::ensure;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the geometry of a NAND flash device
///
/// Blocks are numbered globally: target `t` owns blocks
/// `t * blocks_per_target..(t + 1) * blocks_per_target`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandGeometry {
    pub targets: u32,
    pub blocks_per_target: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub spare_bytes_per_page: usize,
}

impl NandGeometry {
    /// Total number of blocks across all targets
    pub fn blocks(&self) -> u32 {
        self.targets * self.blocks_per_target
    }

    /// Number of data-area bytes in one block
    pub fn block_bytes(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }

    /// The first page of a (global) block
    pub fn first_page(&self, block: u32) -> u32 {
        block * self.pages_per_block
    }

    /// The data-area byte offset of a page
    pub fn page_offset(&self, page: u32) -> u64 {
        u64::from(page) * self.bytes_per_page as u64
    }

    /// The data-area byte offset of the start of a (global) block
    pub fn block_offset(&self, block: u32) -> u64 {
        self.page_offset(self.first_page(block))
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES+SPARE", optionally prefixed with "TARGETS:"
///
/// `BLOCKS` counts the blocks of a single target.
impl FromStr for NandGeometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (targets, s) = match s.split_once(':') {
            Some((targets, rest)) => (targets.parse()?, rest),
            None => (1, s),
        };
        let (s, spare) = s
            .split_once('+')
            .ok_or(anyhow::anyhow!("expected #x#x#+#"))?;
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#+#"))?;

        let geometry = NandGeometry {
            targets,
            blocks_per_target: blocks.parse()?,
            pages_per_block: pages_per_block.parse()?,
            bytes_per_page: bytes_per_page.parse()?,
            spare_bytes_per_page: spare.parse()?,
        };

        ensure!(geometry.targets > 0, "at least one target is required");
        ensure!(geometry.blocks_per_target > 0, "targets cannot be empty");
        ensure!(geometry.pages_per_block > 0, "blocks cannot be empty");
        ensure!(geometry.bytes_per_page > 0, "pages cannot be empty");

        Ok(geometry)
    }
}

/// The raw access primitives a bad block table is built on
///
/// Data-area access is byte addressed (see [NandGeometry::page_offset]); spare access is per
/// page. Implementations report every failure and never mask one.
pub trait BlockStore {
    /// Get the geometry of the device
    fn geometry(&self) -> NandGeometry;

    /// Read `len` data-area bytes starting at byte `offset`
    fn read(&mut self, offset: u64, len: usize) -> anyhow::Result<Vec<u8>>;

    /// Read the full spare area of a page
    fn read_spare(&mut self, page: u32) -> anyhow::Result<Vec<u8>>;

    /// Program data-area bytes starting at byte `offset`, which must be page-aligned
    fn write(&mut self, offset: u64, data: &[u8]) -> anyhow::Result<()>;

    /// Program (a prefix of) the spare area of a page
    fn write_spare(&mut self, page: u32, data: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, setting every data and spare bit of it
    fn erase_block(&mut self, block: u32) -> anyhow::Result<()>;
}

impl<S: BlockStore + ?Sized> BlockStore for Box<S> {
    fn geometry(&self) -> NandGeometry {
        (**self).geometry()
    }
    fn read(&mut self, offset: u64, len: usize) -> anyhow::Result<Vec<u8>> {
        (**self).read(offset, len)
    }
    fn read_spare(&mut self, page: u32) -> anyhow::Result<Vec<u8>> {
        (**self).read_spare(page)
    }
    fn write(&mut self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        (**self).write(offset, data)
    }
    fn write_spare(&mut self, page: u32, data: &[u8]) -> anyhow::Result<()> {
        (**self).write_spare(page, data)
    }
    fn erase_block(&mut self, block: u32) -> anyhow::Result<()> {
        (**self).erase_block(block)
    }
}

/// Operations that a [SimNand] block can be told to fail
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SimFaults {
    pub read: bool,
    pub program: bool,
    pub erase: bool,
}

/// Counters of the operations performed against a [SimNand]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SimStats {
    pub reads: u64,
    pub programs: u64,
    pub erases: u64,
}

/// A simulated in-memory NAND flash, for testing purposes
///
/// Programming follows NAND rules: it can only clear bits, so writing over already-programmed
/// bytes yields the bitwise AND of old and new content.
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    geometry: NandGeometry,
    stats: SimStats,
}

/// A block of SimNand
#[derive(Debug, Clone)]
struct SimBlock {
    /// Data area of all pages, back to back
    data: Vec<u8>,

    /// Spare area of all pages, back to back
    spare: Vec<u8>,

    faults: SimFaults,
}

impl SimBlock {
    fn new(geometry: NandGeometry) -> Self {
        let pages = geometry.pages_per_block as usize;
        Self {
            data: vec![0xFF; pages * geometry.bytes_per_page],
            spare: vec![0xFF; pages * geometry.spare_bytes_per_page],
            faults: Default::default(),
        }
    }

    fn erase(&mut self) {
        self.data.fill(0xFF);
        self.spare.fill(0xFF);
    }
}

/// Program `src` over `dst` with NAND semantics
fn program_bytes(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d &= s;
    }
}

impl SimNand {
    /// Create a fully-erased SimNand with the specified geometry
    pub fn new(geometry: NandGeometry) -> Self {
        let blocks = vec![SimBlock::new(geometry); geometry.blocks() as usize];
        let blocks = blocks.into_boxed_slice();

        Self {
            blocks,
            geometry,
            stats: Default::default(),
        }
    }

    /// Initialize the NAND contents from a raw dump, laid out as each page's data area followed by
    /// its spare area.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let NandGeometry {
            bytes_per_page,
            spare_bytes_per_page,
            ..
        } = self.geometry;
        for block in self.blocks.iter_mut() {
            block.faults = Default::default();
            for page in 0..self.geometry.pages_per_block as usize {
                read.read_exact(&mut block.data[page * bytes_per_page..][..bytes_per_page])?;
                read.read_exact(
                    &mut block.spare[page * spare_bytes_per_page..][..spare_bytes_per_page],
                )?;
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File), in the
    /// format accepted by [SimNand::load]
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let NandGeometry {
            bytes_per_page,
            spare_bytes_per_page,
            ..
        } = self.geometry;
        for block in self.blocks.iter() {
            for page in 0..self.geometry.pages_per_block as usize {
                write.write_all(&block.data[page * bytes_per_page..][..bytes_per_page])?;
                write.write_all(&block.spare[page * spare_bytes_per_page..][..spare_bytes_per_page])?;
            }
        }

        Ok(())
    }

    /// Make subsequent operations on a block fail
    pub fn set_faults(&mut self, block: u32, faults: SimFaults) {
        if let Some(block) = self.blocks.get_mut(block as usize) {
            block.faults = faults;
        }
    }

    /// Get the operation counters
    pub fn stats(&self) -> SimStats {
        self.stats
    }

    fn block_mut(&mut self, block: u32) -> anyhow::Result<&mut SimBlock> {
        self.blocks
            .get_mut(block as usize)
            .ok_or(anyhow::anyhow!("block {block} out of range"))
    }

    /// Split a page index into (block, page within block)
    fn locate_page(&self, page: u32) -> anyhow::Result<(u32, usize)> {
        let block = page / self.geometry.pages_per_block;
        ensure!(block < self.geometry.blocks(), "page {page} out of range");
        Ok((block, (page % self.geometry.pages_per_block) as usize))
    }

    /// Check that a data-area byte range is in bounds, and return the (block, offset) it starts at
    fn locate_bytes(&self, offset: u64, len: usize) -> anyhow::Result<(u32, usize)> {
        let block_bytes = self.geometry.block_bytes() as u64;
        let end = offset + len as u64;
        ensure!(
            end <= block_bytes * u64::from(self.geometry.blocks()),
            "byte range {offset}..{end} out of range"
        );
        Ok(((offset / block_bytes) as u32, (offset % block_bytes) as usize))
    }

    /// Visit each block-local chunk of a data-area byte range
    fn for_each_chunk(
        &mut self,
        offset: u64,
        len: usize,
        mut visit: impl FnMut(&mut SimBlock, std::ops::Range<usize>, std::ops::Range<usize>) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let (mut block, mut start) = self.locate_bytes(offset, len)?;
        let block_bytes = self.geometry.block_bytes();
        let mut done = 0;
        while done < len {
            let n = std::cmp::min(len - done, block_bytes - start);
            visit(self.block_mut(block)?, start..start + n, done..done + n)?;
            done += n;
            block += 1;
            start = 0;
        }
        Ok(())
    }
}

impl BlockStore for SimNand {
    fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    fn read(&mut self, offset: u64, len: usize) -> anyhow::Result<Vec<u8>> {
        self.stats.reads += 1;
        let mut out = vec![0; len];
        self.for_each_chunk(offset, len, |block, src, dst| {
            ensure!(!block.faults.read, "simulated read failure");
            out[dst].copy_from_slice(&block.data[src]);
            Ok(())
        })?;
        Ok(out)
    }

    fn read_spare(&mut self, page: u32) -> anyhow::Result<Vec<u8>> {
        self.stats.reads += 1;
        let spare_size = self.geometry.spare_bytes_per_page;
        let (block, page) = self.locate_page(page)?;
        let block = self.block_mut(block)?;
        ensure!(!block.faults.read, "simulated read failure");
        Ok(block.spare[page * spare_size..][..spare_size].to_vec())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        ensure!(
            offset % self.geometry.bytes_per_page as u64 == 0,
            "write at {offset} not page-aligned"
        );
        self.stats.programs += 1;
        self.for_each_chunk(offset, data.len(), |block, dst, src| {
            ensure!(!block.faults.program, "simulated program failure");
            program_bytes(&mut block.data[dst], &data[src]);
            Ok(())
        })
    }

    fn write_spare(&mut self, page: u32, data: &[u8]) -> anyhow::Result<()> {
        let spare_size = self.geometry.spare_bytes_per_page;
        ensure!(data.len() <= spare_size, "spare content too large");
        self.stats.programs += 1;
        let (block, page) = self.locate_page(page)?;
        let block = self.block_mut(block)?;
        ensure!(!block.faults.program, "simulated program failure");
        program_bytes(&mut block.spare[page * spare_size..], data);
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> anyhow::Result<()> {
        self.stats.erases += 1;
        let block = self.block_mut(block)?;
        ensure!(!block.faults.erase, "simulated erase failure");
        block.erase();
        Ok(())
    }
}

#[cfg(test)]
const TEST_GEOMETRY: NandGeometry = NandGeometry {
    targets: 2,
    blocks_per_target: 4,
    pages_per_block: 16,
    bytes_per_page: 256,
    spare_bytes_per_page: 16,
};

#[test]
fn test_parse_geometry() {
    let geometry: NandGeometry = "128x64x2048+64".parse().unwrap();
    assert_eq!(geometry.targets, 1);
    assert_eq!(geometry.blocks(), 128);
    assert_eq!(geometry.spare_bytes_per_page, 64);

    let geometry: NandGeometry = "2:4x16x256+16".parse().unwrap();
    assert_eq!(geometry, TEST_GEOMETRY);

    assert!("4x16x256".parse::<NandGeometry>().is_err());
    assert!("0:4x16x256+16".parse::<NandGeometry>().is_err());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    let page_size = TEST_GEOMETRY.bytes_per_page;

    let data_in = vec![0xA5u8; page_size * 2];
    let offset = TEST_GEOMETRY.page_offset(3);
    nand.write(offset, &data_in).unwrap();
    assert!(nand.write(offset + 1, &data_in).is_err());

    assert!(nand.read(TEST_GEOMETRY.page_offset(2), page_size).unwrap().is_erased());
    assert_eq!(nand.read(offset, data_in.len()).unwrap(), data_in);

    // Programming can only clear bits
    nand.write(offset, &vec![0x5Au8; page_size]).unwrap();
    assert!(nand.read(offset, page_size).unwrap().iter().all(|&x| x == 0x00));

    nand.erase_block(0).unwrap();
    assert!(nand.read(offset, page_size).unwrap().is_erased());
    assert_eq!(nand.stats().erases, 1);
}

#[test]
fn test_sim_read_across_blocks() {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    let block_bytes = TEST_GEOMETRY.block_bytes();

    nand.write(0, &vec![0x11u8; block_bytes]).unwrap();
    nand.write(TEST_GEOMETRY.block_offset(1), &vec![0x22u8; block_bytes]).unwrap();

    let buf = nand.read(block_bytes as u64 - 4, 8).unwrap();
    assert_eq!(buf, [0x11, 0x11, 0x11, 0x11, 0x22, 0x22, 0x22, 0x22]);

    let total = TEST_GEOMETRY.block_offset(TEST_GEOMETRY.blocks());
    assert!(nand.read(total - 4, 8).is_err());
}

#[test]
fn test_sim_spare() {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    let page = TEST_GEOMETRY.first_page(5) + 1;

    nand.write_spare(page, &[0x00, 0x12]).unwrap();
    let spare = nand.read_spare(page).unwrap();
    assert_eq!(spare.len(), TEST_GEOMETRY.spare_bytes_per_page);
    assert_eq!(&spare[..3], &[0x00, 0x12, 0xFF]);
    assert!(nand.read_spare(page - 1).unwrap().is_erased());
    assert!(nand.write_spare(page, &[0; 17]).is_err());

    nand.erase_block(5).unwrap();
    assert!(nand.read_spare(page).unwrap().is_erased());
}

#[test]
fn test_sim_faults() {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    nand.set_faults(
        1,
        SimFaults {
            read: true,
            erase: true,
            ..Default::default()
        },
    );

    assert!(nand.read_spare(TEST_GEOMETRY.first_page(1)).is_err());
    assert!(nand.read(TEST_GEOMETRY.block_offset(1), 4).is_err());
    assert!(nand.erase_block(1).is_err());
    assert!(nand.write(TEST_GEOMETRY.block_offset(1), &[0; 4]).is_ok());
    assert!(nand.read_spare(TEST_GEOMETRY.first_page(0)).is_ok());
}

#[test]
fn test_sim_save_load() {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    nand.write(TEST_GEOMETRY.block_offset(6), &[0x42; 4]).unwrap();
    nand.write_spare(TEST_GEOMETRY.first_page(7), &[0x24; 2]).unwrap();

    let mut image = Vec::new();
    nand.save(&mut image).unwrap();
    let page_bytes = TEST_GEOMETRY.bytes_per_page + TEST_GEOMETRY.spare_bytes_per_page;
    assert_eq!(
        image.len(),
        page_bytes * (TEST_GEOMETRY.blocks() * TEST_GEOMETRY.pages_per_block) as usize
    );

    let mut loaded = SimNand::new(TEST_GEOMETRY);
    loaded.load(&mut &image[..]).unwrap();
    assert_eq!(loaded.read(TEST_GEOMETRY.block_offset(6), 5).unwrap(), [0x42, 0x42, 0x42, 0x42, 0xFF]);
    assert_eq!(&loaded.read_spare(TEST_GEOMETRY.first_page(7)).unwrap()[..3], &[0x24, 0x24, 0xFF]);
}
