//! This module implements access to raw images that span several blocks, stepping over any
//! block the bad block table says to avoid, the same way a boot loader finds its payload.
//!
//! An image is laid out one block-sized chunk per good block, starting at some block of a
//! target:
//!
//! ```text
//! | chunk 0 | chunk 1 | (bad) | chunk 2 | (bad) | (bad) | chunk 3 | ...
//! ```

use crate::bbt::BadBlockTable;
use crate::nand::{BlockStore, NandGeometry, PageUtil};

use std::io::{Read, Write};

/// Find the first good block at or after `block` in a target
fn next_good_block<S: BlockStore>(
    bbt: &BadBlockTable<S>,
    target: u32,
    mut block: u32,
) -> anyhow::Result<u32> {
    let blocks = bbt.geometry().blocks_per_target;
    loop {
        anyhow::ensure!(
            block < blocks,
            "ran out of good blocks on target {target}"
        );
        if !bbt.is_block_bad(target, block) {
            break Ok(block);
        }
        block += 1;
    }
}

/// The data-area byte offset of a target-relative block
fn block_offset(geometry: &NandGeometry, target: u32, block: u32) -> u64 {
    geometry.block_offset(target * geometry.blocks_per_target + block)
}

/// Copy `len` bytes of an image starting at `start_block` out to `out`.
pub fn read_image<S: BlockStore, W: Write>(
    bbt: &mut BadBlockTable<S>,
    target: u32,
    start_block: u32,
    len: u64,
    out: &mut W,
) -> anyhow::Result<()> {
    let geometry = bbt.geometry();
    let block_bytes = geometry.block_bytes() as u64;

    let mut remaining = len;
    let mut block = start_block;
    while remaining > 0 {
        block = next_good_block(bbt, target, block)?;

        let chunk = std::cmp::min(remaining, block_bytes);
        let offset = block_offset(&geometry, target, block);
        let data = bbt.store_mut().read(offset, chunk as usize)?;
        out.write_all(&data)?;

        remaining -= chunk;
        block += 1;
    }

    Ok(())
}

/// Bring a block's content in line with `data`, erasing only if it doesn't already match.
fn update_block<S: BlockStore>(store: &mut S, global_block: u32, data: &[u8]) -> anyhow::Result<()> {
    let offset = store.geometry().block_offset(global_block);

    // Read errors are considered "needs erase"
    match store.read(offset, data.len()) {
        Ok(current) if current == data => return Ok(()),
        Ok(current) if current.is_erased() => {}
        _ => store.erase_block(global_block)?,
    }

    store.write(offset, data)
}

/// Write an image into a target starting at `start_block`, one chunk per good block.
///
/// The target must have been scanned. This operation is idempotent; blocks that already hold
/// their chunk are not rewritten. A block that fails to erase or program is marked bad and its
/// chunk moves on to the next good block.
///
/// Returns the blocks the image landed in, in order.
pub fn write_image<S: BlockStore, R: Read>(
    bbt: &mut BadBlockTable<S>,
    target: u32,
    start_block: u32,
    image: &mut R,
) -> anyhow::Result<Vec<u32>> {
    let geometry = bbt.geometry();
    let block_bytes = geometry.block_bytes();
    let rpt = howudoin::new().label("Writing image");

    let mut used = Vec::new();
    let mut data = Vec::with_capacity(block_bytes);
    let mut block = start_block;
    loop {
        data.clear();
        image
            .by_ref()
            .take(block_bytes as u64)
            .read_to_end(&mut data)?;
        if data.is_empty() {
            // EOF encountered means the write is complete
            break;
        }

        // Pad to a multiple of the page size
        data.resize(data.len().next_multiple_of(geometry.bytes_per_page), 0xFF);

        loop {
            block = next_good_block(bbt, target, block)?;
            let global_block = target * geometry.blocks_per_target + block;

            match update_block(bbt.store_mut(), global_block, &data) {
                Ok(()) => break,
                Err(e) => {
                    log::warn!("target {target}: block {block} failed, marking bad: {e}");
                    bbt.mark_block_bad(target, block)?;
                    block += 1;
                }
            }
        }

        used.push(block);
        block += 1;
        rpt.inc();
    }

    rpt.close();
    Ok(used)
}
