use super::*;

use crate::nand::{BlockStore, NandGeometry, PageUtil, SimFaults, SimNand};

const GEOMETRY: NandGeometry = NandGeometry {
    targets: 1,
    blocks_per_target: 128,
    pages_per_block: 4,
    bytes_per_page: 2048,
    spare_bytes_per_page: 64,
};

const PAYLOAD_LEN: usize = 32;

/// Clear the factory marker of a (global) block
fn set_factory_bad(nand: &mut SimNand, block: u32) {
    let page = nand.geometry().first_page(block);
    nand.write_spare(page, &[0x00, 0x00]).unwrap();
}

fn open(nand: SimNand) -> BadBlockTable<SimNand> {
    BadBlockTable::new(nand, BbtConfig::default()).unwrap()
}

fn scanned(nand: SimNand) -> BadBlockTable<SimNand> {
    let mut bbt = open(nand);
    bbt.scan_table(0).unwrap();
    bbt
}

fn classes(bbt: &BadBlockTable<SimNand>, target: u32) -> Vec<BlockClass> {
    (0..bbt.geometry().blocks_per_target)
        .map(|block| bbt.block_class(target, block).unwrap())
        .collect()
}

fn versions(bbt: &BadBlockTable<SimNand>, target: u32) -> (Option<u8>, Option<u8>) {
    (
        bbt.table_version(TableCopy::Primary, target),
        bbt.table_version(TableCopy::Mirror, target),
    )
}

/// Write a table copy by hand, as another reader/writer of the format would
fn write_raw_table(nand: &mut SimNand, block: u32, signature: &[u8; 4], version: u8, bad: &[u32]) {
    let mut bitmap = Bitmap::new(GEOMETRY.blocks_per_target);
    for &bad in bad {
        bitmap.set(bad, BlockClass::WornBad);
    }
    let payload = bitmap.encode_flash(0..GEOMETRY.blocks_per_target);

    let mut spare = vec![0xFF; GEOMETRY.spare_bytes_per_page];
    spare[8..12].copy_from_slice(signature);
    spare[12] = version;

    nand.erase_block(block).unwrap();
    nand.write(GEOMETRY.block_offset(block), &payload).unwrap();
    nand.write_spare(GEOMETRY.first_page(block), &spare).unwrap();
}

/// Read back (signature, version, payload) of a table copy in the spare-area layout
fn read_raw_table(nand: &mut SimNand, block: u32) -> (Vec<u8>, u8, Vec<u8>) {
    let spare = nand.read_spare(GEOMETRY.first_page(block)).unwrap();
    let payload = nand.read(GEOMETRY.block_offset(block), PAYLOAD_LEN).unwrap();
    (spare[8..12].to_vec(), spare[12], payload)
}

#[test]
fn test_fresh_device() {
    let mut nand = SimNand::new(GEOMETRY);
    set_factory_bad(&mut nand, 10);
    set_factory_bad(&mut nand, 55);

    let mut bbt = open(nand);
    assert_eq!(bbt.state(0), TargetState::Unscanned);
    bbt.scan_table(0).unwrap();
    assert_eq!(bbt.state(0), TargetState::Loaded);

    let found = classes(&bbt, 0);
    for (block, class) in found.iter().enumerate() {
        let expected = match block {
            10 | 55 => BlockClass::FactoryBad,
            123..=127 => BlockClass::Reserved,
            _ => BlockClass::Good,
        };
        assert_eq!(*class, expected, "block {block}");
    }

    assert_eq!(bbt.table_block(TableCopy::Primary, 0), Some(127));
    assert_eq!(bbt.table_block(TableCopy::Mirror, 0), Some(126));

    // Written once each, then bumped by reserving around each copy
    assert_eq!(versions(&bbt, 0), (Some(2), Some(2)));

    let mut nand = bbt.into_store();
    let (signature, version, _) = read_raw_table(&mut nand, 127);
    assert_eq!((&signature[..], version), (&b"Bbt0"[..], 2));
    let (signature, version, _) = read_raw_table(&mut nand, 126);
    assert_eq!((&signature[..], version), (&b"1tbB"[..], 2));

    // Reboot: the table is read back rather than rebuilt
    let before = nand.stats();
    let bbt = scanned(nand);
    assert_eq!(classes(&bbt, 0), found);
    assert_eq!(bbt.store().stats().programs, before.programs);
    assert_eq!(bbt.store().stats().erases, before.erases);
}

#[test]
fn test_scan_is_idempotent() {
    let mut nand = SimNand::new(GEOMETRY);
    set_factory_bad(&mut nand, 3);

    let mut bbt = scanned(nand);
    let first = classes(&bbt, 0);
    let stats = bbt.store().stats();

    bbt.scan_table(0).unwrap();
    assert_eq!(classes(&bbt, 0), first);
    assert_eq!(bbt.store().stats().programs, stats.programs);
    assert_eq!(bbt.store().stats().erases, stats.erases);
    assert_eq!(versions(&bbt, 0), (Some(2), Some(2)));
}

#[test]
fn test_newer_mirror_wins() {
    let mut nand = SimNand::new(GEOMETRY);
    write_raw_table(&mut nand, 127, b"Bbt0", 5, &[3]);
    write_raw_table(&mut nand, 126, b"1tbB", 7, &[3, 4]);

    let bbt = scanned(nand);
    assert_eq!(bbt.block_class(0, 3), Some(BlockClass::WornBad));
    assert_eq!(bbt.block_class(0, 4), Some(BlockClass::WornBad));
    assert_eq!(versions(&bbt, 0), (Some(7), Some(7)));

    // The primary was brought up to date in place
    let mut nand = bbt.into_store();
    let primary = read_raw_table(&mut nand, 127);
    let mirror = read_raw_table(&mut nand, 126);
    assert_eq!(primary.1, 7);
    assert_eq!(primary.2, mirror.2);
}

#[test]
fn test_newer_primary_wins() {
    let mut nand = SimNand::new(GEOMETRY);
    write_raw_table(&mut nand, 127, b"Bbt0", 9, &[20]);
    write_raw_table(&mut nand, 125, b"1tbB", 8, &[]);

    let mut bbt = scanned(nand);
    assert!(bbt.is_block_bad(0, 20));
    assert_eq!(versions(&bbt, 0), (Some(9), Some(9)));
    assert_eq!(bbt.table_block(TableCopy::Mirror, 0), Some(125));

    let (_, version, payload) = read_raw_table(bbt.store_mut(), 125);
    assert_eq!(version, 9);
    assert_eq!(payload, read_raw_table(bbt.store_mut(), 127).2);
}

#[test]
fn test_version_order_after_wrap() {
    let mut nand = SimNand::new(GEOMETRY);
    write_raw_table(&mut nand, 127, b"Bbt0", 255, &[3]);
    write_raw_table(&mut nand, 126, b"1tbB", 0, &[4]);

    // Plain comparison believes the copy that hasn't wrapped yet
    let bbt = scanned(nand.clone());
    assert!(bbt.is_block_bad(0, 3));
    assert!(!bbt.is_block_bad(0, 4));
    assert_eq!(versions(&bbt, 0), (Some(255), Some(255)));

    let config = BbtConfig {
        version_order: VersionOrder::Serial,
        ..Default::default()
    };
    let mut bbt = BadBlockTable::new(nand, config).unwrap();
    bbt.scan_table(0).unwrap();
    assert!(!bbt.is_block_bad(0, 3));
    assert!(bbt.is_block_bad(0, 4));
    assert_eq!(versions(&bbt, 0), (Some(0), Some(0)));
}

#[test]
fn test_version_wraps() {
    let mut nand = SimNand::new(GEOMETRY);
    write_raw_table(&mut nand, 127, b"Bbt0", 255, &[]);
    write_raw_table(&mut nand, 126, b"1tbB", 255, &[]);

    let mut bbt = scanned(nand);
    bbt.mark_block_bad(0, 42).unwrap();
    assert_eq!(versions(&bbt, 0), (Some(0), Some(0)));

    let mut nand = bbt.into_store();
    assert_eq!(read_raw_table(&mut nand, 127).1, 0);
    assert_eq!(read_raw_table(&mut nand, 126).1, 0);
}

#[test]
fn test_mark_block_bad() {
    let mut bbt = scanned(SimNand::new(GEOMETRY));
    let (primary, mirror) = versions(&bbt, 0);

    assert!(!bbt.is_block_bad(0, 42));
    bbt.mark_block_bad(0, 42).unwrap();
    assert!(bbt.is_block_bad(0, 42));
    assert_eq!(bbt.block_class(0, 42), Some(BlockClass::WornBad));
    assert_eq!(
        versions(&bbt, 0),
        (primary.map(|v| v.wrapping_add(1)), mirror.map(|v| v.wrapping_add(1)))
    );

    let mut nand = bbt.into_store();
    assert_eq!(read_raw_table(&mut nand, 127).1, 3);
    assert_eq!(read_raw_table(&mut nand, 126).1, 3);

    // Survives a reboot
    let bbt = scanned(nand);
    assert_eq!(bbt.block_class(0, 42), Some(BlockClass::WornBad));
}

#[test]
fn test_mark_bad_block_is_noop() {
    let mut nand = SimNand::new(GEOMETRY);
    set_factory_bad(&mut nand, 10);

    let mut bbt = scanned(nand);
    bbt.mark_block_bad(0, 11).unwrap();
    let stats = bbt.store().stats();
    let before = versions(&bbt, 0);

    for block in [10, 11, 125] {
        bbt.mark_block_bad(0, block).unwrap();
    }

    assert_eq!(bbt.block_class(0, 10), Some(BlockClass::FactoryBad));
    assert_eq!(bbt.block_class(0, 11), Some(BlockClass::WornBad));
    assert_eq!(bbt.block_class(0, 125), Some(BlockClass::Reserved));
    assert_eq!(versions(&bbt, 0), before);
    assert_eq!(bbt.store().stats().programs, stats.programs);
    assert_eq!(bbt.store().stats().erases, stats.erases);
}

#[test]
fn test_mark_bad_errors() {
    let mut bbt = open(SimNand::new(GEOMETRY));
    assert!(matches!(
        bbt.mark_block_bad(0, 5),
        Err(BbtError::TargetNotScanned { target: 0 })
    ));

    bbt.scan_table(0).unwrap();
    assert!(matches!(
        bbt.mark_block_bad(0, 128),
        Err(BbtError::BlockOutOfRange { target: 0, block: 128 })
    ));
    assert!(matches!(
        bbt.mark_block_bad(1, 0),
        Err(BbtError::TargetOutOfRange { target: 1 })
    ));
    assert!(matches!(
        bbt.scan_table(1),
        Err(BbtError::TargetOutOfRange { target: 1 })
    ));

    assert!(bbt.is_block_bad(0, 128));
    assert!(bbt.is_block_bad(1, 0));
    assert_eq!(bbt.block_class(0, 128), None);
}

#[test]
fn test_reserved_blocks() {
    let mut nand = SimNand::new(GEOMETRY);
    set_factory_bad(&mut nand, 127);

    let bbt = scanned(nand);

    // Defective blocks are passed over when placing the tables
    assert_eq!(bbt.table_block(TableCopy::Primary, 0), Some(126));
    assert_eq!(bbt.table_block(TableCopy::Mirror, 0), Some(125));

    assert_eq!(bbt.block_class(0, 127), Some(BlockClass::FactoryBad));
    for block in 122..=126 {
        assert_eq!(bbt.block_class(0, block), Some(BlockClass::Reserved));
        assert!(bbt.is_block_bad(0, block));
    }
    assert!(!bbt.is_block_bad(0, 121));
}

#[test]
fn test_missing_copy_is_rewritten() {
    let mut nand = scanned(SimNand::new(GEOMETRY)).into_store();
    nand.erase_block(126).unwrap();

    let mut bbt = scanned(nand);
    assert_eq!(bbt.table_block(TableCopy::Mirror, 0), Some(126));
    assert_eq!(versions(&bbt, 0), (Some(2), Some(2)));

    let (signature, version, payload) = read_raw_table(bbt.store_mut(), 126);
    assert_eq!(&signature[..], b"1tbB");
    assert_eq!(version, 2);
    assert_eq!(payload, read_raw_table(bbt.store_mut(), 127).2);
}

#[test]
fn test_unreadable_candidate_is_skipped() {
    let mut nand = scanned(SimNand::new(GEOMETRY)).into_store();
    let expected = classes(&scanned(nand.clone()), 0);
    nand.set_faults(
        127,
        SimFaults {
            read: true,
            ..Default::default()
        },
    );

    // The mirror is found behind the unreadable primary, and the primary is rewritten
    let erases = nand.stats().erases;
    let bbt = scanned(nand);
    assert_eq!(classes(&bbt, 0), expected);
    assert_eq!(bbt.table_block(TableCopy::Primary, 0), Some(127));
    assert_eq!(bbt.store().stats().erases, erases + 1);
}

#[test]
fn test_unreadable_block_is_factory_bad() {
    let mut nand = SimNand::new(GEOMETRY);
    nand.set_faults(
        20,
        SimFaults {
            read: true,
            ..Default::default()
        },
    );

    let bbt = scanned(nand);
    assert_eq!(bbt.block_class(0, 20), Some(BlockClass::FactoryBad));
    assert_eq!(bbt.block_class(0, 21), Some(BlockClass::Good));
}

#[test]
fn test_second_page_marker() {
    let mut nand = SimNand::new(GEOMETRY);
    nand.write_spare(GEOMETRY.first_page(30) + 1, &[0xFF, 0x00]).unwrap();

    let bbt = scanned(nand);
    assert_eq!(bbt.block_class(0, 30), Some(BlockClass::FactoryBad));
}

#[test]
fn test_no_free_block() {
    let mut nand = SimNand::new(GEOMETRY);
    for block in 124..128 {
        set_factory_bad(&mut nand, block);
    }

    let mut bbt = open(nand);
    assert!(matches!(
        bbt.scan_table(0),
        Err(BbtError::NoFreeBlockForTable { target: 0 })
    ));
    assert_ne!(bbt.state(0), TargetState::Loaded);
}

#[test]
fn test_single_usable_block() {
    let mut nand = SimNand::new(GEOMETRY);
    for block in 125..128 {
        set_factory_bad(&mut nand, block);
    }

    // There's room for the primary, but the mirror has nowhere to go
    let mut bbt = open(nand);
    assert!(matches!(
        bbt.scan_table(0),
        Err(BbtError::NoFreeBlockForTable { target: 0 })
    ));
    assert_eq!(bbt.table_block(TableCopy::Primary, 0), Some(124));
}

#[test]
fn test_io_failure_propagates() {
    let mut nand = SimNand::new(GEOMETRY);
    nand.set_faults(
        127,
        SimFaults {
            erase: true,
            ..Default::default()
        },
    );

    let mut bbt = open(nand);
    assert!(matches!(bbt.scan_table(0), Err(BbtError::Io(_))));
}

#[test]
fn test_embedded_layout() {
    let config = BbtConfig {
        layout: StorageLayout::Embedded,
        ..Default::default()
    };
    let mut nand = SimNand::new(GEOMETRY);
    set_factory_bad(&mut nand, 10);

    let mut bbt = BadBlockTable::new(nand, config).unwrap();
    bbt.scan_table(0).unwrap();
    let found = classes(&bbt, 0);
    assert_eq!(found[10], BlockClass::FactoryBad);

    // Signature and version follow the payload in the data area; the spare area is untouched
    let mut nand = bbt.into_store();
    let marker = nand
        .read(GEOMETRY.block_offset(127) + PAYLOAD_LEN as u64, 5)
        .unwrap();
    assert_eq!(marker, b"Bbt0\x02");
    assert!(nand.read_spare(GEOMETRY.first_page(127)).unwrap().is_erased());

    let mut bbt = BadBlockTable::new(nand, config).unwrap();
    bbt.scan_table(0).unwrap();
    assert_eq!(classes(&bbt, 0), found);
}

#[test]
fn test_multiple_targets() {
    let geometry = NandGeometry {
        targets: 2,
        blocks_per_target: 64,
        ..GEOMETRY
    };
    let mut nand = SimNand::new(geometry);
    set_factory_bad(&mut nand, 64 + 5);

    let mut bbt = BadBlockTable::new(nand, BbtConfig::default()).unwrap();
    bbt.scan_all().unwrap();

    assert!(!bbt.is_block_bad(0, 5));
    assert_eq!(bbt.block_class(1, 5), Some(BlockClass::FactoryBad));
    for target in 0..2 {
        assert_eq!(bbt.table_block(TableCopy::Primary, target), Some(63));
        assert_eq!(bbt.table_block(TableCopy::Mirror, target), Some(62));
        assert!(bbt.is_block_bad(target, 60));
    }

    bbt.mark_block_bad(1, 7).unwrap();
    assert!(!bbt.is_block_bad(0, 7));
    assert_eq!(versions(&bbt, 0), (Some(2), Some(2)));
    assert_eq!(versions(&bbt, 1), (Some(3), Some(3)));
}

#[test]
fn test_geometry_mismatch() {
    let geometry = NandGeometry {
        spare_bytes_per_page: 8,
        ..GEOMETRY
    };
    assert!(matches!(
        BadBlockTable::new(SimNand::new(geometry), BbtConfig::default()),
        Err(BbtError::GeometryMismatch { .. })
    ));

    /// Drops the last byte of every data-area read
    struct ShortReads(SimNand);

    impl BlockStore for ShortReads {
        fn geometry(&self) -> NandGeometry {
            self.0.geometry()
        }
        fn read(&mut self, offset: u64, len: usize) -> anyhow::Result<Vec<u8>> {
            let mut data = self.0.read(offset, len)?;
            data.pop();
            Ok(data)
        }
        fn read_spare(&mut self, page: u32) -> anyhow::Result<Vec<u8>> {
            self.0.read_spare(page)
        }
        fn write(&mut self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
            self.0.write(offset, data)
        }
        fn write_spare(&mut self, page: u32, data: &[u8]) -> anyhow::Result<()> {
            self.0.write_spare(page, data)
        }
        fn erase_block(&mut self, block: u32) -> anyhow::Result<()> {
            self.0.erase_block(block)
        }
    }

    let nand = scanned(SimNand::new(GEOMETRY)).into_store();
    let mut bbt = BadBlockTable::new(ShortReads(nand), BbtConfig::default()).unwrap();
    assert!(matches!(
        bbt.scan_table(0),
        Err(BbtError::GeometryMismatch {
            expected: PAYLOAD_LEN,
            found: 31
        })
    ));
}
