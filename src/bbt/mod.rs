//! This module implements the bad block table (BBT): a persistent, redundant record of which
//! erase blocks of a NAND device may be used.
//!
//! Each target keeps two copies of the table (primary and mirror), each in one of the last few
//! blocks of the target's address range:
//!
//! ```text
//!  target start                                          target end
//! | block 0 | block 1 | ... | N-5 | N-4 | N-3 | N-2 | N-1 |
//!                                 \_______________________/
//!                                  search window (max_blocks)
//! ```
//!
//! A copy is recognized by its signature (`Bbt0` or `1tbB`), stored beside a one-byte version
//! counter. At boot the window is searched for both signatures; the copy with the newer version
//! is loaded and the other is rewritten to match. If neither copy exists, the blocks' factory bad
//! block markers are scanned instead, and a fresh pair of tables is written. The blocks in the
//! window are then reserved so that nothing else is allocated from them.
//!
//! Every later change to the table (e.g. [BadBlockTable::mark_block_bad]) bumps both versions
//! and rewrites both copies, one at a time, so that an interruption leaves at least one intact.

mod codec;
mod descriptor;
mod error;
mod factory;
mod locate;
mod write;

pub use codec::{Bitmap, BlockClass};
pub use descriptor::{
    BadBlockPattern, BbtConfig, StorageLayout, TableCopy, TableDescriptor, TableSlot,
    VersionOrder, DEFAULT_MAX_BLOCKS, MIRROR_SIGNATURE, PRIMARY_SIGNATURE,
};
pub use error::BbtError;

use crate::nand::{BlockStore, NandGeometry};

use std::ops::Range;

/// The lifecycle of one target's table
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum TargetState {
    #[default]
    Unscanned,

    /// No table was found; the factory markers are being scanned
    Scanning,

    /// The in-memory table is authoritative
    Loaded,
}

/// The block range of one target, in global block numbers
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct TargetRange {
    pub target: u32,
    pub first_block: u32,
    pub blocks: u32,
}

impl TargetRange {
    pub fn blocks(&self) -> Range<u32> {
        self.first_block..self.first_block + self.blocks
    }

    pub fn last_block(&self) -> u32 {
        self.first_block + self.blocks - 1
    }

    /// Up to `count` blocks, walking backward from `from` without leaving the target
    pub fn window(&self, from: u32, count: u32) -> impl Iterator<Item = u32> {
        (self.first_block..=from).rev().take(count as usize)
    }
}

/// A bad block table over a [BlockStore]
///
/// This owns the store; every operation runs to completion before returning, and concurrent use
/// must be serialized by the caller.
#[derive(Debug)]
pub struct BadBlockTable<S> {
    store: S,
    geometry: NandGeometry,
    config: BbtConfig,
    pattern: BadBlockPattern,
    bitmap: Bitmap,
    primary: TableDescriptor,
    mirror: TableDescriptor,
    states: Vec<TargetState>,
}

impl<S: BlockStore> BadBlockTable<S> {
    /// Attach to a store, sizing the table from its geometry
    ///
    /// Nothing is read until [BadBlockTable::scan_table]; until then every block reads as good.
    pub fn new(store: S, config: BbtConfig) -> Result<Self, BbtError> {
        let geometry = store.geometry();

        let payload_len = codec::packed_len(geometry.blocks_per_target);
        let marker_len = config.layout.marker_len();
        let (needed, available) = match config.layout {
            StorageLayout::SeparateSpare if geometry.spare_bytes_per_page < marker_len => {
                (marker_len, geometry.spare_bytes_per_page)
            }
            StorageLayout::SeparateSpare => (payload_len, geometry.block_bytes()),
            StorageLayout::Embedded => (payload_len + marker_len, geometry.block_bytes()),
        };
        if needed > available {
            return Err(BbtError::GeometryMismatch {
                expected: needed,
                found: available,
            });
        }

        let pattern = BadBlockPattern::for_geometry(&geometry);
        let primary = TableDescriptor::new(TableCopy::Primary, &config, geometry.targets);
        let mirror = TableDescriptor::new(TableCopy::Mirror, &config, geometry.targets);

        Ok(Self {
            store,
            geometry,
            config,
            pattern,
            bitmap: Bitmap::new(geometry.blocks()),
            primary,
            mirror,
            states: vec![Default::default(); geometry.targets as usize],
        })
    }

    /// Load the table of a target from flash, creating it from the factory markers if there is
    /// none.
    ///
    /// Calling this again on a target with a valid table only re-reads it.
    pub fn scan_table(&mut self, target: u32) -> Result<(), BbtError> {
        let range = self.target_range(target)?;

        match self.read_table(range) {
            Ok(()) => {}
            Err(BbtError::TableNotFound { .. }) => {
                log::info!("target {target}: no bad block table found, scanning factory markers");
                self.states[target as usize] = TargetState::Scanning;

                self.create_table(range);
                self.write_table(TableCopy::Primary, range)?;
                self.write_table(TableCopy::Mirror, range)?;
                self.mark_reserved(TableCopy::Primary, range)?;
                self.mark_reserved(TableCopy::Mirror, range)?;
            }
            Err(e) => return Err(e),
        }

        self.states[target as usize] = TargetState::Loaded;
        Ok(())
    }

    /// [BadBlockTable::scan_table] every target, in order
    pub fn scan_all(&mut self) -> Result<(), BbtError> {
        for target in 0..self.geometry.targets {
            self.scan_table(target)?;
        }
        Ok(())
    }

    /// Should this block be kept out of use?
    ///
    /// Blocks that don't exist are reported bad.
    pub fn is_block_bad(&self, target: u32, block: u32) -> bool {
        self.block_class(target, block).map_or(true, BlockClass::is_bad)
    }

    /// Get the classification of a block
    pub fn block_class(&self, target: u32, block: u32) -> Option<BlockClass> {
        let range = self.target_range(target).ok()?;
        if block >= range.blocks {
            return None;
        }
        self.bitmap.get(range.first_block + block)
    }

    /// Record that a block has failed, persisting the change to both table copies
    ///
    /// Blocks that are already bad or reserved are left alone, and nothing is written.
    pub fn mark_block_bad(&mut self, target: u32, block: u32) -> Result<(), BbtError> {
        let range = self.target_range(target)?;
        if block >= range.blocks {
            return Err(BbtError::BlockOutOfRange { target, block });
        }
        if self.state(target) != TargetState::Loaded {
            return Err(BbtError::TargetNotScanned { target });
        }

        let index = range.first_block + block;
        if self.bitmap.get(index) != Some(BlockClass::Good) {
            return Ok(());
        }

        log::info!("target {target}: marking block {block} bad");
        self.bitmap.set(index, BlockClass::WornBad);
        self.update_table(range)
    }

    pub fn state(&self, target: u32) -> TargetState {
        self.states
            .get(target as usize)
            .copied()
            .unwrap_or_default()
    }

    /// The target-relative block holding a table copy, if known
    pub fn table_block(&self, copy: TableCopy, target: u32) -> Option<u32> {
        let range = self.target_range(target).ok()?;
        let slot = self.descriptor(copy).slot(target);
        slot.page
            .filter(|_| slot.valid)
            .map(|page| page / self.geometry.pages_per_block - range.first_block)
    }

    /// The version of a table copy, if it is known to exist
    pub fn table_version(&self, copy: TableCopy, target: u32) -> Option<u8> {
        self.target_range(target).ok()?;
        let slot = self.descriptor(copy).slot(target);
        slot.valid.then_some(slot.version)
    }

    pub fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    pub fn config(&self) -> &BbtConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Direct access to the store, e.g. to read and write the good blocks
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub(crate) fn target_range(&self, target: u32) -> Result<TargetRange, BbtError> {
        if target >= self.geometry.targets {
            return Err(BbtError::TargetOutOfRange { target });
        }
        Ok(TargetRange {
            target,
            first_block: target * self.geometry.blocks_per_target,
            blocks: self.geometry.blocks_per_target,
        })
    }

    pub(crate) fn descriptor(&self, copy: TableCopy) -> &TableDescriptor {
        match copy {
            TableCopy::Primary => &self.primary,
            TableCopy::Mirror => &self.mirror,
        }
    }

    pub(crate) fn descriptor_mut(&mut self, copy: TableCopy) -> &mut TableDescriptor {
        match copy {
            TableCopy::Primary => &mut self.primary,
            TableCopy::Mirror => &mut self.mirror,
        }
    }

    /// Length of the encoded table of one target
    pub(crate) fn payload_len(&self) -> usize {
        codec::packed_len(self.geometry.blocks_per_target)
    }
}

#[cfg(test)]
mod tests;
