//! Block classifications and the two 2-bit encodings they are stored in.
//!
//! In memory and on flash, four blocks share each byte, with block `i` at bit shift
//! `(i % 4) * 2` of byte `i / 4`. The two encodings assign different codes to each class:
//!
//! ```text
//! class        memory   flash
//! Good           00       11
//! WornBad        01       10
//! Reserved       10       01
//! FactoryBad     11       00
//! ```
//!
//! The flash codes are what existing readers of the table expect, so both directions go through
//! the lookup tables below rather than through any bit arithmetic.

use std::ops::Range;

use super::BbtError;

const BLOCKS_PER_BYTE: u32 = 4;
const BITS_PER_BLOCK: u32 = 2;
const CODE_MASK: u8 = 0b11;

/// The usability of an erase block
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BlockClass {
    #[default]
    Good,

    /// Failed during operation and was marked bad by software
    WornBad,

    /// Set aside to hold bad block tables
    Reserved,

    /// Marked defective by the flash vendor
    FactoryBad,
}

/// Indexed by in-memory code
const MEMORY_CODES: [BlockClass; 4] = [
    BlockClass::Good,
    BlockClass::WornBad,
    BlockClass::Reserved,
    BlockClass::FactoryBad,
];

/// Indexed by on-flash code
const FLASH_CODES: [BlockClass; 4] = [
    BlockClass::FactoryBad,
    BlockClass::Reserved,
    BlockClass::WornBad,
    BlockClass::Good,
];

impl BlockClass {
    /// Every class, in in-memory code order
    pub const ALL: [BlockClass; 4] = MEMORY_CODES;

    /// Is this block unusable for ordinary data?
    pub fn is_bad(self) -> bool {
        self != Self::Good
    }

    /// Is this block unusable because it failed, as opposed to being reserved?
    pub fn is_defective(self) -> bool {
        matches!(self, Self::WornBad | Self::FactoryBad)
    }

    pub fn memory_code(self) -> u8 {
        Self::code_in(&MEMORY_CODES, self)
    }

    pub fn flash_code(self) -> u8 {
        Self::code_in(&FLASH_CODES, self)
    }

    pub fn from_memory_code(code: u8) -> Self {
        MEMORY_CODES[usize::from(code & CODE_MASK)]
    }

    pub fn from_flash_code(code: u8) -> Self {
        FLASH_CODES[usize::from(code & CODE_MASK)]
    }

    fn code_in(table: &[BlockClass; 4], class: BlockClass) -> u8 {
        // Every class appears exactly once in each table
        table.iter().position(|&x| x == class).unwrap_or_default() as u8
    }
}

/// Locate a block's code within a packed buffer: (byte index, bit shift)
fn slot(index: u32) -> (usize, u32) {
    (
        (index / BLOCKS_PER_BYTE) as usize,
        (index % BLOCKS_PER_BYTE) * BITS_PER_BLOCK,
    )
}

/// Number of packed bytes needed to hold `blocks` codes
pub fn packed_len(blocks: u32) -> usize {
    blocks.div_ceil(BLOCKS_PER_BYTE) as usize
}

/// The in-memory classification of every block on a device
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Bitmap {
    bytes: Vec<u8>,
    blocks: u32,
}

impl Bitmap {
    /// A bitmap of `blocks` blocks, all [BlockClass::Good]
    pub fn new(blocks: u32) -> Self {
        Self {
            bytes: vec![0; packed_len(blocks)],
            blocks,
        }
    }

    pub fn len(&self) -> u32 {
        self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }

    /// The packed in-memory representation
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Classification of a block, or None if out of range
    pub fn get(&self, block: u32) -> Option<BlockClass> {
        if block >= self.blocks {
            return None;
        }
        let (byte, shift) = slot(block);
        Some(BlockClass::from_memory_code(self.bytes[byte] >> shift))
    }

    /// Reclassify a block, returning its previous class
    ///
    /// Panics if `block` is out of range.
    pub fn set(&mut self, block: u32, class: BlockClass) -> BlockClass {
        assert!(block < self.blocks, "block {block} out of range");
        let (byte, shift) = slot(block);
        let old = BlockClass::from_memory_code(self.bytes[byte] >> shift);
        self.bytes[byte] &= !(CODE_MASK << shift);
        self.bytes[byte] |= class.memory_code() << shift;
        old
    }

    /// Reset a range of blocks to [BlockClass::Good]
    pub fn clear(&mut self, blocks: Range<u32>) {
        for block in blocks {
            self.set(block, BlockClass::Good);
        }
    }

    /// Encode a range of blocks in the on-flash encoding
    ///
    /// The first block of the range lands at bit 0 of the first byte. Any unused trailing bits are
    /// left as `11`.
    pub fn encode_flash(&self, blocks: Range<u32>) -> Vec<u8> {
        let mut payload = vec![0xFF; packed_len(blocks.len() as u32)];
        for (i, block) in blocks.enumerate() {
            let class = self.get(block).unwrap_or_default();
            let (byte, shift) = slot(i as u32);
            payload[byte] &= !(CODE_MASK << shift);
            payload[byte] |= class.flash_code() << shift;
        }
        payload
    }

    /// Decode an on-flash payload into a range of blocks
    ///
    /// The payload must be exactly as long as [Bitmap::encode_flash] would produce.
    pub fn decode_flash(&mut self, blocks: Range<u32>, payload: &[u8]) -> Result<(), BbtError> {
        let expected = packed_len(blocks.len() as u32);
        if payload.len() != expected || blocks.end > self.blocks {
            return Err(BbtError::GeometryMismatch {
                expected,
                found: payload.len(),
            });
        }

        for (i, block) in blocks.enumerate() {
            let (byte, shift) = slot(i as u32);
            self.set(block, BlockClass::from_flash_code(payload[byte] >> shift));
        }
        Ok(())
    }
}

#[cfg(test)]
use proptest::prelude::*;

#[cfg(test)]
fn arb_class() -> impl Strategy<Value = BlockClass> {
    proptest::sample::select(BlockClass::ALL.to_vec())
}

#[test]
fn test_codes() {
    use BlockClass::*;

    assert_eq!(
        BlockClass::ALL.map(BlockClass::memory_code),
        [0b00, 0b01, 0b10, 0b11]
    );
    assert_eq!(
        [Good, WornBad, Reserved, FactoryBad].map(BlockClass::flash_code),
        [0b11, 0b10, 0b01, 0b00]
    );
    for class in BlockClass::ALL {
        assert_eq!(BlockClass::from_flash_code(class.flash_code()), class);
        assert_eq!(BlockClass::from_memory_code(class.memory_code()), class);
    }
}

#[test]
fn test_bitmap_packing() {
    let mut bitmap = Bitmap::new(6);
    assert_eq!(bitmap.as_bytes(), [0, 0]);

    assert_eq!(bitmap.set(1, BlockClass::WornBad), BlockClass::Good);
    bitmap.set(2, BlockClass::Reserved);
    bitmap.set(5, BlockClass::FactoryBad);
    assert_eq!(bitmap.as_bytes(), [0b00_10_01_00, 0b00_00_11_00]);
    assert_eq!(bitmap.get(5), Some(BlockClass::FactoryBad));
    assert_eq!(bitmap.get(6), None);

    // The same classes on flash, with padding bits left set
    assert_eq!(bitmap.encode_flash(0..6), [0b11_01_10_11, 0b11_11_00_11]);
    assert_eq!(bitmap.encode_flash(1..3), [0b11_11_01_10]);
}

#[test]
fn test_decode_rejects_wrong_length() {
    let mut bitmap = Bitmap::new(8);
    assert!(matches!(
        bitmap.decode_flash(0..8, &[0xFF]),
        Err(BbtError::GeometryMismatch {
            expected: 2,
            found: 1
        })
    ));
    assert!(bitmap.decode_flash(4..12, &[0xFF, 0xFF]).is_err());
}

#[cfg(test)]
proptest! {
    #[test]
    fn prop_flash_round_trip(classes in proptest::collection::vec(arb_class(), 1..200)) {
        let mut bitmap = Bitmap::new(classes.len() as u32);
        for (i, &class) in classes.iter().enumerate() {
            bitmap.set(i as u32, class);
        }

        let range = 0..bitmap.len();
        let payload = bitmap.encode_flash(range.clone());
        prop_assert_eq!(payload.len(), classes.len().div_ceil(4));

        let mut decoded = Bitmap::new(bitmap.len());
        decoded.decode_flash(range, &payload).unwrap();
        prop_assert_eq!(decoded, bitmap);
    }

    #[test]
    fn prop_set_is_local(
        classes in proptest::collection::vec(arb_class(), 1..64),
        index in any::<prop::sample::Index>(),
        class in arb_class(),
    ) {
        let mut bitmap = Bitmap::new(classes.len() as u32);
        for (i, &class) in classes.iter().enumerate() {
            bitmap.set(i as u32, class);
        }

        let target = index.index(classes.len()) as u32;
        bitmap.set(target, class);
        for (i, &expected) in classes.iter().enumerate() {
            let expected = if i as u32 == target { class } else { expected };
            prop_assert_eq!(bitmap.get(i as u32), Some(expected));
        }
    }
}
