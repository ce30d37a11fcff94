//! Bad block table management for raw NAND flash.
//!
//! [bbt::BadBlockTable] keeps a per-block health map for each target of a device, persisted as a
//! primary and a mirror table copy near the end of the target. [skip_bad] builds on it to read
//! and write images that tolerate bad blocks. Raw device access goes through
//! [nand::BlockStore], either a Linux MTD device or the in-memory [nand::SimNand].

pub mod bbt;
pub mod nand;
pub mod skip_bad;
