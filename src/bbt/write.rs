//! Persisting the table, and keeping both copies in step as it changes.

use super::{BadBlockTable, BbtError, BlockClass, StorageLayout, TableCopy, TargetRange};
use crate::nand::BlockStore;

impl<S: BlockStore> BadBlockTable<S> {
    /// Pick a block for a table copy that has none yet
    ///
    /// The block must not be defective, and must not hold the other copy.
    fn assign_table_block(&mut self, copy: TableCopy, range: TargetRange) -> Result<u32, BbtError> {
        let target = range.target;
        let other_page = self.descriptor(copy.other()).slot(target).page;
        let max_blocks = self.descriptor(copy).max_blocks;

        let page = range
            .window(range.last_block(), max_blocks)
            .filter(|&block| !self.bitmap.get(block).is_some_and(BlockClass::is_defective))
            .map(|block| self.geometry.first_page(block))
            .find(|&page| Some(page) != other_page)
            .ok_or(BbtError::NoFreeBlockForTable { target })?;

        let slot = self.descriptor_mut(copy).slot_mut(target);
        slot.page = Some(page);
        slot.valid = true;
        Ok(page)
    }

    /// Write one copy of a target's table to flash, picking a block for it first if needed
    pub(super) fn write_table(&mut self, copy: TableCopy, range: TargetRange) -> Result<(), BbtError> {
        let target = range.target;
        let page = match self.descriptor(copy).slot(target).page {
            Some(page) => page,
            None => self.assign_table_block(copy, range)?,
        };
        let block = page / self.geometry.pages_per_block;

        let payload = self.bitmap.encode_flash(range.blocks());
        let desc = self.descriptor(copy);
        let version = desc.slot(target).version;
        log::debug!("target {target}: writing {copy:?} table v{version} to block {block}");

        let offset = self.geometry.page_offset(page);
        match self.config.layout {
            StorageLayout::SeparateSpare => {
                let mut spare = vec![0xFF; self.geometry.spare_bytes_per_page];
                desc.fill_marker(target, &mut spare);

                self.store.erase_block(block)?;
                self.store.write(offset, &payload)?;
                self.store.write_spare(page, &spare)?;
            }
            StorageLayout::Embedded => {
                let mut data = payload;
                let marker_start = data.len();
                data.resize(marker_start + self.config.layout.marker_len(), 0xFF);
                desc.fill_marker(target, &mut data[marker_start..]);

                self.store.erase_block(block)?;
                self.store.write(offset, &data)?;
            }
        }

        Ok(())
    }

    /// Reserve the blocks around a table copy so they are never handed out for data
    ///
    /// Starting at the copy's block and walking backward over the search window, every good block
    /// becomes [BlockClass::Reserved]. The table is rewritten if anything changed.
    pub(super) fn mark_reserved(&mut self, copy: TableCopy, range: TargetRange) -> Result<(), BbtError> {
        let Some(page) = self.descriptor(copy).slot(range.target).page else {
            return Ok(());
        };
        let table_block = page / self.geometry.pages_per_block;
        let max_blocks = self.descriptor(copy).max_blocks;

        let mut changed = false;
        for block in range.window(table_block, max_blocks) {
            if self.bitmap.get(block) == Some(BlockClass::Good) {
                self.bitmap.set(block, BlockClass::Reserved);
                changed = true;
            }
        }

        if changed {
            self.update_table(range)?;
        }
        Ok(())
    }

    /// Bump the version of both copies of a target's table and rewrite them
    pub(super) fn update_table(&mut self, range: TargetRange) -> Result<(), BbtError> {
        let target = range.target;
        for copy in [TableCopy::Primary, TableCopy::Mirror] {
            let slot = self.descriptor_mut(copy).slot_mut(target);
            slot.version = slot.version.wrapping_add(1);
        }

        self.write_table(TableCopy::Primary, range)?;
        self.write_table(TableCopy::Mirror, range)
    }
}
