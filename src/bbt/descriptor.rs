//! Where the two table copies live and how they are recognized, plus the knobs that select
//! between the layouts in use in the field.

use crate::nand::NandGeometry;

pub const SIGNATURE_LEN: usize = 4;
pub const PRIMARY_SIGNATURE: [u8; SIGNATURE_LEN] = *b"Bbt0";
pub const MIRROR_SIGNATURE: [u8; SIGNATURE_LEN] = *b"1tbB";

/// Default number of blocks at the end of each target searched for a table
pub const DEFAULT_MAX_BLOCKS: u32 = 4;

/// Page sizes up to this use the small-page factory marker profile
const SMALL_PAGE_SIZE: usize = 512;

/// Identifies one of the two redundant table copies
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TableCopy {
    Primary,
    Mirror,
}

impl TableCopy {
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Mirror,
            Self::Mirror => Self::Primary,
        }
    }
}

/// Where the table signature and version are stored relative to the table payload
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum StorageLayout {
    /// Payload in the data area, signature and version in the spare area of the first page
    #[default]
    SeparateSpare,

    /// Payload, signature and version written together in the data area, for controllers that
    /// leave no spare bytes free
    Embedded,
}

impl StorageLayout {
    /// Offset of the signature within the marker area
    pub fn signature_offset(self) -> usize {
        match self {
            Self::SeparateSpare => 8,
            Self::Embedded => 0,
        }
    }

    /// Offset of the version byte within the marker area
    pub fn version_offset(self) -> usize {
        match self {
            Self::SeparateSpare => 12,
            Self::Embedded => 4,
        }
    }

    /// Number of bytes the marker area must hold
    pub fn marker_len(self) -> usize {
        std::cmp::max(
            self.signature_offset() + SIGNATURE_LEN,
            self.version_offset() + 1,
        )
    }
}

/// How versions of the two copies are ordered when they disagree
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum VersionOrder {
    /// Plain integer comparison, as existing readers do; after 255 wraps to 0, the older copy
    /// wins
    #[default]
    Plain,

    /// Serial-number comparison modulo 256
    Serial,
}

impl VersionOrder {
    /// Is version `a` newer than version `b`?
    pub fn is_newer(self, a: u8, b: u8) -> bool {
        match self {
            Self::Plain => a > b,
            Self::Serial => matches!(a.wrapping_sub(b), 1..=127),
        }
    }
}

/// Settings for a bad block table
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BbtConfig {
    pub layout: StorageLayout,

    /// How many blocks, counting back from the end of each target, may hold a table
    pub max_blocks: u32,

    pub version_order: VersionOrder,
}

impl Default for BbtConfig {
    fn default() -> Self {
        Self {
            layout: Default::default(),
            max_blocks: DEFAULT_MAX_BLOCKS,
            version_order: Default::default(),
        }
    }
}

/// Per-target state of one table copy
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct TableSlot {
    /// First (global) page of the block holding this copy, if known
    pub page: Option<u32>,
    pub version: u8,

    /// Set once the copy has been found on, or assigned to, flash
    pub valid: bool,
}

/// Describes how to find and recognize one table copy
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TableDescriptor {
    pub signature: [u8; SIGNATURE_LEN],
    pub signature_offset: usize,
    pub version_offset: usize,
    pub max_blocks: u32,
    slots: Vec<TableSlot>,
}

impl TableDescriptor {
    pub fn new(copy: TableCopy, config: &BbtConfig, targets: u32) -> Self {
        let signature = match copy {
            TableCopy::Primary => PRIMARY_SIGNATURE,
            TableCopy::Mirror => MIRROR_SIGNATURE,
        };

        Self {
            signature,
            signature_offset: config.layout.signature_offset(),
            version_offset: config.layout.version_offset(),
            max_blocks: config.max_blocks,
            slots: vec![Default::default(); targets as usize],
        }
    }

    pub fn slot(&self, target: u32) -> &TableSlot {
        &self.slots[target as usize]
    }

    pub fn slot_mut(&mut self, target: u32) -> &mut TableSlot {
        &mut self.slots[target as usize]
    }

    /// Does `marker` (a marker area read from flash) carry this descriptor's signature?
    pub fn matches(&self, marker: &[u8]) -> bool {
        marker.get(self.signature_offset..self.signature_offset + SIGNATURE_LEN)
            == Some(&self.signature[..])
    }

    /// Fill in a marker area with this descriptor's signature and the target's version
    pub fn fill_marker(&self, target: u32, marker: &mut [u8]) {
        marker[self.signature_offset..][..SIGNATURE_LEN].copy_from_slice(&self.signature);
        marker[self.version_offset] = self.slot(target).version;
    }
}

/// Describes the factory bad block marker
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BadBlockPattern {
    /// Whether the second page of each block carries the marker too
    pub scan_second_page: bool,

    /// Offset of the marker within the spare area
    pub offset: usize,

    /// Expected content of a good block's marker
    pub pattern: Vec<u8>,
}

impl BadBlockPattern {
    /// The marker profile vendors use for a given page size
    pub fn for_geometry(geometry: &NandGeometry) -> Self {
        if geometry.bytes_per_page <= SMALL_PAGE_SIZE {
            Self {
                scan_second_page: true,
                offset: 5,
                pattern: vec![0xFF],
            }
        } else {
            Self {
                scan_second_page: true,
                offset: 0,
                pattern: vec![0xFF, 0xFF],
            }
        }
    }

    /// Does this spare area belong to a good block? Spare areas too short to hold the marker
    /// don't.
    pub fn matches(&self, spare: &[u8]) -> bool {
        spare.get(self.offset..self.offset + self.pattern.len()) == Some(&self.pattern[..])
    }

    /// Pages of a block (relative to its first page) that carry the marker
    pub fn pages(&self, pages_per_block: u32) -> std::ops::Range<u32> {
        let pages = if self.scan_second_page { 2 } else { 1 };
        0..std::cmp::min(pages, pages_per_block)
    }
}

#[test]
fn test_version_order() {
    assert!(VersionOrder::Plain.is_newer(7, 5));
    assert!(!VersionOrder::Plain.is_newer(5, 5));
    assert!(VersionOrder::Plain.is_newer(255, 0));

    assert!(VersionOrder::Serial.is_newer(7, 5));
    assert!(!VersionOrder::Serial.is_newer(5, 5));
    assert!(VersionOrder::Serial.is_newer(0, 255));
    assert!(!VersionOrder::Serial.is_newer(255, 0));
}

#[test]
fn test_signatures() {
    let config = BbtConfig::default();
    let primary = TableDescriptor::new(TableCopy::Primary, &config, 1);
    let mirror = TableDescriptor::new(TableCopy::Mirror, &config, 1);

    let mut marker = vec![0xFF; 16];
    primary.fill_marker(0, &mut marker);
    assert_eq!(&marker[8..13], b"Bbt0\x00");
    assert!(primary.matches(&marker));
    assert!(!mirror.matches(&marker));
    assert!(!primary.matches(&marker[..10]));
}

#[test]
fn test_marker_profiles() {
    let mut geometry = NandGeometry {
        targets: 1,
        blocks_per_target: 8,
        pages_per_block: 32,
        bytes_per_page: 512,
        spare_bytes_per_page: 16,
    };
    let small = BadBlockPattern::for_geometry(&geometry);
    assert_eq!((small.offset, small.pattern.len()), (5, 1));
    assert!(small.matches(&[0, 0, 0, 0, 0, 0xFF]));
    assert!(!small.matches(&[0xFF; 5]));

    geometry.bytes_per_page = 2048;
    let large = BadBlockPattern::for_geometry(&geometry);
    assert_eq!((large.offset, large.pattern.len()), (0, 2));
    assert!(!large.matches(&[0xFF, 0x00]));
    assert_eq!(large.pages(1), 0..1);
    assert_eq!(large.pages(64), 0..2);
}
