// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Storage behind the virtio block device.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use virtio_bindings::virtio_blk::VIRTIO_BLK_ID_BYTES;

pub const SECTOR_SHIFT: u8 = 9;
pub const SECTOR_SIZE: u64 = 0x01 << SECTOR_SHIFT;

/// Byte addressed disk image, used from the block worker thread only.
pub trait DiskBackend: Send {
    /// Size in bytes.
    fn size(&self) -> u64;

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Serial reported through `VIRTIO_BLK_T_GET_ID`.
    fn serial(&self) -> String;
}

fn serial_bytes(serial: &str) -> Vec<u8> {
    let mut id = serial.as_bytes().to_vec();
    id.truncate(VIRTIO_BLK_ID_BYTES as usize);
    id
}

pub(crate) fn build_disk_image_id(disk: &dyn DiskBackend) -> Vec<u8> {
    serial_bytes(&disk.serial())
}

/// Host file backing a disk image.
pub struct FileDisk {
    file: File,
    path: PathBuf,
    size: u64,
}

impl FileDisk {
    pub fn open(path: &Path, read_only: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        Self::from_file(file, path.to_path_buf())
    }

    pub fn from_file(file: File, path: PathBuf) -> io::Result<Self> {
        let size = file.metadata()?.len();
        if size % SECTOR_SIZE != 0 {
            warn!(
                "Disk size {} is not a multiple of sector size {}; \
                 the remainder will not be visible to the guest.",
                size, SECTOR_SIZE
            );
        }
        Ok(FileDisk { file, path, size })
    }
}

impl DiskBackend for FileDisk {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn serial(&self) -> String {
        // Same identifier for the same backing file, like a real disk.
        let meta = self.file.metadata();
        match meta {
            Ok(meta) => {
                use std::os::unix::fs::MetadataExt;
                format!("{}{}{}", meta.dev(), meta.rdev(), meta.ino())
            }
            Err(_) => self.path.display().to_string(),
        }
    }
}

/// Disk image held in host memory. Clones share the same image.
#[derive(Clone)]
pub struct MemDisk {
    data: Arc<Mutex<Vec<u8>>>,
    serial: String,
}

impl MemDisk {
    pub fn new(size: u64) -> Self {
        Self::from_bytes(vec![0; size as usize])
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        MemDisk {
            data: Arc::new(Mutex::new(data)),
            serial: "xvisor-memdisk".to_string(),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    fn range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let size = self.data.lock().unwrap().len() as u64;
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => Ok(offset as usize..end as usize),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "access beyond the end of the disk",
            )),
        }
    }
}

impl DiskBackend for MemDisk {
    fn size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data.lock().unwrap()[range]);
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        self.data.lock().unwrap()[range].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn serial(&self) -> String {
        self.serial.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vmm_sys_util::tempfile::TempFile;

    #[test]
    fn file_disk_io() {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().write_all(&[0u8; 1024]).unwrap();
        let mut disk = FileDisk::open(tmp.as_path(), false).unwrap();
        assert_eq!(disk.size(), 1024);

        disk.write_at(b"sector one", 512).unwrap();
        disk.flush().unwrap();
        let mut buf = [0u8; 10];
        disk.read_at(&mut buf, 512).unwrap();
        assert_eq!(&buf, b"sector one");
        assert!(disk.read_at(&mut buf, 1020).is_err());
        assert!(!disk.serial().is_empty());

        let mut ro = FileDisk::open(tmp.as_path(), true).unwrap();
        assert!(ro.write_at(b"x", 0).is_err());
    }

    #[test]
    fn mem_disk_is_shared_and_bounded() {
        let disk = MemDisk::new(1024);
        let mut writer = disk.clone();
        writer.write_at(&[0xaa; 4], 1020).unwrap();
        assert_eq!(&disk.contents()[1020..], &[0xaa; 4]);
        assert!(writer.write_at(&[0; 8], 1020).is_err());
        assert_eq!(build_disk_image_id(&disk), b"xvisor-memdisk".to_vec());
    }
}
