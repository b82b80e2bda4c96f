//! [`FlashDriver`] implementation over the Linux MTD subsystem

use super::{FlashDriver, Geometry};

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    geometry: Geometry,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        };

        let geometry = Geometry {
            page_size: info.writesize,
            erase_size: info.erasesize,
            spare_size: info.oobsize,
            capacity: u64::from(info.size),
        };

        Ok(Self { file, geometry })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> io::Result<Self> {
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

        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("MTD device {name} could not be found"),
        ))
    }
}

impl FlashDriver for MtdNand {
    fn geometry(&self) -> io::Result<Geometry> {
        Ok(self.geometry)
    }

    fn is_block_bad(&mut self, addr: u64) -> io::Result<bool> {
        let ret = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &addr)? };
        Ok(ret != 0)
    }

    fn mark_block_bad(&mut self, addr: u64) -> io::Result<()> {
        unsafe {
            ioctl::memsetbadblock(self.file.as_raw_fd(), &addr)?;
        }
        Ok(())
    }

    fn erase_block(&mut self, addr: u64) -> io::Result<()> {
        let erase_info = ioctl::erase_info_user {
            start: addr as u32,
            length: self.geometry.erase_size,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }

    fn write_pages(&mut self, mut addr: u64, buf: &[u8]) -> io::Result<usize> {
        let geo = self.geometry;
        let page = geo.page_size as usize;

        let mut done = 0;
        while done < buf.len() {
            if addr >= geo.capacity {
                break;
            }
            if geo.is_block_aligned(addr) && self.is_block_bad(addr)? {
                addr += u64::from(geo.erase_size);
                continue;
            }
            self.file.write_all_at(&buf[done..done + page], addr)?;
            done += page;
            addr += page as u64;
        }
        Ok(done)
    }

    fn read_pages(&mut self, mut addr: u64, buf: &mut [u8]) -> io::Result<usize> {
        let geo = self.geometry;
        let page = geo.page_size as usize;

        let mut done = 0;
        while done < buf.len() {
            if addr >= geo.capacity {
                break;
            }
            if geo.is_block_aligned(addr) && self.is_block_bad(addr)? {
                addr += u64::from(geo.erase_size);
                continue;
            }
            self.file.read_exact_at(&mut buf[done..done + page], addr)?;
            done += page;
            addr += page as u64;
        }
        Ok(done)
    }

    fn write_pages_raw(&mut self, mut addr: u64, buf: &[u8]) -> io::Result<usize> {
        let geo = self.geometry;
        let unit = (geo.page_size + geo.spare_size) as usize;

        let mut done = 0;
        while done < buf.len() {
            if addr >= geo.capacity {
                break;
            }
            if geo.is_block_aligned(addr) && self.is_block_bad(addr)? {
                addr += u64::from(geo.erase_size);
                continue;
            }
            let chunk = &buf[done..done + unit];
            let (payload, spare) = chunk.split_at(geo.page_size as usize);
            self.write_page_raw(addr, payload, spare)?;
            done += unit;
            addr += u64::from(geo.page_size);
        }
        Ok(done)
    }

    fn write_page_raw(&mut self, addr: u64, payload: &[u8], spare: &[u8]) -> io::Result<()> {
        self.file.write_all_at(payload, addr)?;
        if !spare.is_empty() {
            let mut oob = ioctl::mtd_oob_buf {
                start: addr as u32,
                length: spare.len() as u32,
                ptr: spare.as_ptr() as *mut u8,
            };
            unsafe {
                ioctl::memwriteoob(self.file.as_raw_fd(), &mut oob)?;
            }
        }
        Ok(())
    }

    fn read_page_raw(&mut self, addr: u64, payload: &mut [u8], spare: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(payload, addr)?;
        if !spare.is_empty() {
            let mut oob = ioctl::mtd_oob_buf {
                start: addr as u32,
                length: spare.len() as u32,
                ptr: spare.as_mut_ptr(),
            };
            unsafe {
                ioctl::memreadoob(self.file.as_raw_fd(), &mut oob)?;
            }
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices
    #![allow(non_camel_case_types)]

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

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);
}
