//! Block store implementation over the Linux MTD subsystem

use super::{BlockStore, NandGeometry};

use anyhow::{bail, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
///
/// An MTD device is always presented as a single target.
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    geometry: NandGeometry,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let geometry = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, geometry })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Issue an OOB ioctl against the spare area of `page`
    fn oob_buf(&self, page: u32, ptr: *mut u8, length: usize) -> anyhow::Result<ioctl::mtd_oob_buf> {
        let start = self.geometry.page_offset(page);
        ensure!(
            length <= self.geometry.spare_bytes_per_page,
            "spare access of {length} bytes exceeds OOB size"
        );

        Ok(ioctl::mtd_oob_buf {
            start: start.try_into()?,
            length: length.try_into()?,
            ptr,
        })
    }
}

impl BlockStore for MtdNand {
    fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    fn read(&mut self, offset: u64, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn read_spare(&mut self, page: u32) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0; self.geometry.spare_bytes_per_page];
        let mut oob = self.oob_buf(page, buf.as_mut_ptr(), buf.len())?;
        unsafe {
            ioctl::memreadoob(self.file.as_raw_fd(), &mut oob)?;
        }
        Ok(buf)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let page_size = self.geometry.bytes_per_page;
        ensure!(
            offset % page_size as u64 == 0,
            "write at {offset} not page-aligned"
        );

        // MTD only accepts whole pages; pad with erased bytes, which leave the flash untouched
        if data.len() % page_size == 0 {
            return Ok(self.file.write_all_at(data, offset)?);
        }
        let mut padded = data.to_vec();
        padded.resize(data.len().next_multiple_of(page_size), 0xFF);
        Ok(self.file.write_all_at(&padded, offset)?)
    }

    fn write_spare(&mut self, page: u32, data: &[u8]) -> anyhow::Result<()> {
        let mut buf = data.to_vec();
        let mut oob = self.oob_buf(page, buf.as_mut_ptr(), buf.len())?;
        unsafe {
            ioctl::memwriteoob(self.file.as_raw_fd(), &mut oob)?;
        }
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> anyhow::Result<()> {
        ensure!(block < self.geometry.blocks(), "block {block} out of range");

        let erase_info = ioctl::erase_info_user {
            start: self.geometry.block_offset(block).try_into()?,
            length: self.geometry.block_bytes().try_into()?,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandGeometry;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandGeometry> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<NandGeometry> {
            ensure!(self.writesize > 1, "MTD device is not page-based NAND");
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            Ok(NandGeometry {
                targets: 1,
                blocks_per_target: self.size / self.erasesize,
                pages_per_block: self.erasesize / self.writesize,
                bytes_per_page: self.writesize as usize,
                spare_bytes_per_page: self.oobsize as usize,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    #[repr(C)]
    pub struct mtd_oob_buf {
        pub start: u32,
        pub length: u32,
        pub ptr: *mut u8,
    }
    ioctl_readwrite!(memwriteoob, MTD_IOC_MAGIC, 3, mtd_oob_buf);
    ioctl_readwrite!(memreadoob, MTD_IOC_MAGIC, 4, mtd_oob_buf);
}
