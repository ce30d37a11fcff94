//! Finding the table copies on flash, and deciding which one to believe.

use super::{BadBlockTable, BbtError, StorageLayout, TableCopy, TargetRange};
use crate::nand::BlockStore;

impl<S: BlockStore> BadBlockTable<S> {
    /// Read the area of a table block's first page that holds the signature and version
    ///
    /// In the [StorageLayout::Embedded] layout this is the part of the data area after the
    /// payload.
    pub(super) fn read_marker(&mut self, page: u32) -> anyhow::Result<Vec<u8>> {
        match self.config.layout {
            StorageLayout::SeparateSpare => self.store.read_spare(page),
            StorageLayout::Embedded => {
                let payload_len = self.payload_len();
                let offset = self.geometry.page_offset(page) + payload_len as u64;
                self.store.read(offset, self.config.layout.marker_len())
            }
        }
    }

    /// Search the end of a target for a table copy, filling in the descriptor's slot
    ///
    /// Returns whether the copy was found. Candidates that can't be read are skipped.
    pub(super) fn search_table(&mut self, copy: TableCopy, range: TargetRange) -> bool {
        let target = range.target;
        *self.descriptor_mut(copy).slot_mut(target) = Default::default();

        let max_blocks = self.descriptor(copy).max_blocks;
        for block in range.window(range.last_block(), max_blocks) {
            let page = self.geometry.first_page(block);
            let marker = match self.read_marker(page) {
                Ok(marker) => marker,
                Err(e) => {
                    log::warn!("target {target}: skipping unreadable table candidate {block}: {e}");
                    continue;
                }
            };

            let desc = self.descriptor_mut(copy);
            if !desc.matches(&marker) {
                continue;
            }
            let Some(&version) = marker.get(desc.version_offset) else {
                continue;
            };

            let slot = desc.slot_mut(target);
            slot.page = Some(page);
            slot.version = version;
            slot.valid = true;

            log::debug!("target {target}: found {copy:?} table v{version} in block {block}");
            return true;
        }

        false
    }

    /// Load a located table copy into the in-memory bitmap
    fn load_table(&mut self, copy: TableCopy, range: TargetRange) -> Result<(), BbtError> {
        let page = self
            .descriptor(copy)
            .slot(range.target)
            .page
            .ok_or(BbtError::TableNotFound {
                target: range.target,
            })?;

        let payload_len = self.payload_len();
        let payload = self
            .store
            .read(self.geometry.page_offset(page), payload_len)?;
        self.bitmap.decode_flash(range.blocks(), &payload)
    }

    /// Locate both copies of a target's table, load the authoritative one, and bring the other
    /// copy up to date
    pub(super) fn read_table(&mut self, range: TargetRange) -> Result<(), BbtError> {
        let target = range.target;
        let primary_found = self.search_table(TableCopy::Primary, range);
        let mirror_found = self.search_table(TableCopy::Mirror, range);

        // (copy to load, copy to rewrite)
        let (source, stale) = match (primary_found, mirror_found) {
            (false, false) => return Err(BbtError::TableNotFound { target }),
            (true, false) => (TableCopy::Primary, Some(TableCopy::Mirror)),
            (false, true) => (TableCopy::Mirror, Some(TableCopy::Primary)),
            (true, true) => {
                let primary = self.primary.slot(target).version;
                let mirror = self.mirror.slot(target).version;
                let order = self.config.version_order;
                if order.is_newer(primary, mirror) {
                    (TableCopy::Primary, Some(TableCopy::Mirror))
                } else if order.is_newer(mirror, primary) {
                    (TableCopy::Mirror, Some(TableCopy::Primary))
                } else {
                    (TableCopy::Primary, None)
                }
            }
        };

        self.load_table(source, range)?;

        let version = self.descriptor(source).slot(target).version;
        log::info!("target {target}: loaded {source:?} bad block table v{version}");

        if let Some(stale) = stale {
            log::info!("target {target}: rewriting {stale:?} bad block table as v{version}");
            self.descriptor_mut(stale).slot_mut(target).version = version;
            self.write_table(stale, range)?;
        }

        Ok(())
    }
}
