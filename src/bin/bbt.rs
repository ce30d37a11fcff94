//! An operator tool for inspecting and maintaining the bad block tables of a NAND device.
//!
//! It can run against a real MTD device, or a NAND image file for offline work.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use std::fs::File;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use nand_bbt::nand::mtd::MtdNand;
use nand_bbt::{
    bbt::{
        BadBlockTable, BbtConfig, BlockClass, StorageLayout, TableCopy, VersionOrder,
        DEFAULT_MAX_BLOCKS,
    },
    nand::{BlockStore, NandGeometry, SimNand},
    skip_bad::{read_image, write_image},
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_geometry")]
    sim_path: Option<PathBuf>,

    /// Geometry of the NAND to simulate, as [TARGETS:]BLOCKSxPAGESxBYTES+SPARE
    #[clap(long)]
    sim_geometry: Option<NandGeometry>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(geometry) = self.sim_geometry {
            let mut sim = SimNand::new(geometry);
            if let Some(path) = &self.sim_path {
                let mut file = File::open(path)
                    .with_context(|| format!("could not open {}", path.display()))?;
                sim.load(&mut file)?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

impl BlockStore for NandImpl {
    fn geometry(&self) -> NandGeometry {
        match self {
            Self::Sim(nand) => nand.geometry(),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.geometry(),
        }
    }

    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self {
            Self::Sim(nand) => nand.read(offset, len),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.read(offset, len),
        }
    }

    fn read_spare(&mut self, page: u32) -> Result<Vec<u8>> {
        match self {
            Self::Sim(nand) => nand.read_spare(page),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.read_spare(page),
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            Self::Sim(nand) => nand.write(offset, data),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.write(offset, data),
        }
    }

    fn write_spare(&mut self, page: u32, data: &[u8]) -> Result<()> {
        match self {
            Self::Sim(nand) => nand.write_spare(page, data),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.write_spare(page, data),
        }
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        match self {
            Self::Sim(nand) => nand.erase_block(block),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => nand.erase_block(block),
        }
    }
}

#[derive(Args, Debug)]
struct TableOptions {
    /// Keep the table signature and version in the data area, after the table itself
    #[clap(long)]
    embedded: bool,

    /// How many blocks at the end of each target may hold a table
    #[clap(long, default_value_t = DEFAULT_MAX_BLOCKS)]
    max_blocks: u32,

    /// Compare table versions as serial numbers, so that a table survives version wraparound
    #[clap(long)]
    serial_versions: bool,
}

impl From<&TableOptions> for BbtConfig {
    fn from(value: &TableOptions) -> Self {
        BbtConfig {
            layout: match value.embedded {
                true => StorageLayout::Embedded,
                false => StorageLayout::SeparateSpare,
            },
            max_blocks: value.max_blocks,
            version_order: match value.serial_versions {
                true => VersionOrder::Serial,
                false => VersionOrder::Plain,
            },
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load (or create) the table of every target and print where the copies live
    Scan,

    /// List every block that is not good
    Show,

    /// Check whether one block may be used
    IsBad {
        /// The block, relative to the start of the target
        block: u32,

        #[clap(long, default_value_t = 0)]
        target: u32,
    },

    /// Mark a block as worn out and persist the change
    MarkBad {
        /// The block, relative to the start of the target
        block: u32,

        #[clap(long, default_value_t = 0)]
        target: u32,
    },

    /// Copy an image out of NAND, skipping bad blocks
    ReadImage {
        /// Where to save the image
        path: PathBuf,

        /// Number of bytes to read
        #[clap(long)]
        len: u64,

        /// The block the image starts in
        #[clap(long, default_value_t = 0)]
        start_block: u32,

        #[clap(long, default_value_t = 0)]
        target: u32,
    },

    /// Write an image to NAND, skipping bad blocks and marking any that fail
    WriteImage {
        /// The path to the image to write to NAND
        path: PathBuf,

        /// The block the image starts in
        #[clap(long, default_value_t = 0)]
        start_block: u32,

        #[clap(long, default_value_t = 0)]
        target: u32,
    },
}

impl Command {
    fn execute(self, bbt: &mut BadBlockTable<NandImpl>) -> Result<()> {
        match self {
            Command::Scan => {
                bbt.scan_all()?;

                for target in 0..bbt.geometry().targets {
                    for copy in [TableCopy::Primary, TableCopy::Mirror] {
                        match (bbt.table_block(copy, target), bbt.table_version(copy, target)) {
                            (Some(block), Some(version)) => {
                                println!("{target}: {copy:?} table v{version} in block {block}")
                            }
                            _ => println!("{target}: no {copy:?} table"),
                        }
                    }
                }
            }

            Command::Show => {
                bbt.scan_all()?;

                let geometry = bbt.geometry();
                for target in 0..geometry.targets {
                    for block in 0..geometry.blocks_per_target {
                        match bbt.block_class(target, block) {
                            Some(BlockClass::Good) | None => {}
                            Some(class) => println!("{target}:{block:5} => {class:?}"),
                        }
                    }
                }
            }

            Command::IsBad { block, target } => {
                bbt.scan_table(target)?;

                match bbt.is_block_bad(target, block) {
                    true => println!("bad"),
                    false => println!("good"),
                }
            }

            Command::MarkBad { block, target } => {
                bbt.scan_table(target)?;
                bbt.mark_block_bad(target, block)?;
            }

            Command::ReadImage {
                path,
                len,
                start_block,
                target,
            } => {
                bbt.scan_table(target)?;

                let mut image = File::create(&path)
                    .with_context(|| format!("could not create {}", path.display()))?;
                read_image(bbt, target, start_block, len, &mut image)?;
            }

            Command::WriteImage {
                path,
                start_block,
                target,
            } => {
                bbt.scan_table(target)?;

                let mut image = File::open(&path)
                    .with_context(|| format!("could not open {}", path.display()))?;
                let used = write_image(bbt, target, start_block, &mut image)?;

                println!("Used blocks: {used:?}");
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// How the bad block tables are laid out
    #[clap(flatten)]
    table: TableOptions,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    env_logger::init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = args.nand.open()?;
    let mut bbt = BadBlockTable::new(nand, BbtConfig::from(&args.table))?;
    args.cmd.execute(&mut bbt)?;
    args.nand.cleanup(bbt.into_store())?;
    Ok(())
}
