//! Building a table from scratch out of the vendor's factory bad block markers.

use super::{BadBlockTable, BlockClass, TargetRange};
use crate::nand::BlockStore;

impl<S: BlockStore> BadBlockTable<S> {
    /// Check the factory marker(s) of a block
    ///
    /// A marker page that can't be read is as good as a bad marker.
    fn has_good_markers(&mut self, block: u32) -> bool {
        let first_page = self.geometry.first_page(block);
        for page in self.pattern.pages(self.geometry.pages_per_block) {
            match self.store.read_spare(first_page + page) {
                Ok(spare) if self.pattern.matches(&spare) => {}
                Ok(_) => return false,
                Err(e) => {
                    log::warn!("block {block}: spare area unreadable, treating as bad: {e}");
                    return false;
                }
            }
        }
        true
    }

    /// Classify every block of a target from its factory markers alone
    pub(super) fn create_table(&mut self, range: TargetRange) {
        let rpt = howudoin::new()
            .label("Scanning factory bad block markers")
            .set_len(u64::from(range.blocks));

        self.bitmap.clear(range.blocks());
        let mut bad = 0;
        for block in range.blocks() {
            if !self.has_good_markers(block) {
                log::debug!("target {}: block {block} is factory bad", range.target);
                self.bitmap.set(block, BlockClass::FactoryBad);
                bad += 1;
            }
            rpt.inc();
        }

        rpt.close();
        log::info!(
            "target {}: {bad} of {} blocks factory bad",
            range.target,
            range.blocks
        );
    }
}
