//! Volume-level behavior on FAT12/16/32 RAM-disk images: formatting,
//! recognition, round trips, free-space accounting and failure injection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fatx::device::{BlockDevice, DeviceError, DeviceStatus, Ioctl, IoctlData, RamDisk};
use fatx::file::OpenMode;
use fatx::fs::{FatKind, Volume};
use fatx::mkfs::{mkfs, FormatKind, FormatOptions};
use fatx::{FsError, ATTR_ARCHIVE};

fn format_fat16_32m() -> Arc<RamDisk> {
    let disk = Arc::new(RamDisk::new(65536, 512)); // 32 MiB
    mkfs(
        disk.as_ref(),
        &FormatOptions {
            fmt: FormatKind::Fat,
            n_fat: 2,
            au_size: 2048,
            n_root: 512,
            align: 1,
            sfd: false,
        },
    )
    .unwrap();
    disk
}

#[test]
fn fresh_fat16_create_write_read_back() {
    let disk = format_fat16_32m();
    let mut vol = Volume::mount(disk.clone(), 0).unwrap();
    assert_eq!(vol.kind(), FatKind::Fat16);

    let mut f = vol
        .open("0:/hi.txt", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    assert_eq!(vol.write(&mut f, b"hello").unwrap(), 5);
    vol.close(&mut f).unwrap();

    let info = vol.stat("0:/hi.txt").unwrap();
    assert_eq!(info.fsize, 5);
    assert!(info.fattrib & ATTR_ARCHIVE != 0);

    let mut f = vol.open("0:/hi.txt", OpenMode::READ).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(vol.read(&mut f, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    assert!(f.eof());
    vol.close(&mut f).unwrap();

    // the data survives an unmount/remount cycle
    let disk = vol.unmount().unwrap();
    let mut vol = Volume::mount(disk, 0).unwrap();
    let mut f = vol.open("0:/hi.txt", OpenMode::READ).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(vol.read(&mut f, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    vol.close(&mut f).unwrap();
}

#[test]
fn create_new_on_existing_fails() {
    let disk = format_fat16_32m();
    let mut vol = Volume::mount(disk, 0).unwrap();
    let mut f = vol
        .open("0:/a.txt", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.close(&mut f).unwrap();
    assert_eq!(
        vol.open("0:/a.txt", OpenMode::WRITE | OpenMode::CREATE_NEW)
            .err(),
        Some(FsError::Exist)
    );
}

#[test]
fn fat12_and_fat32_recognition() {
    // small enough that the cluster count lands under 4085
    let disk = Arc::new(RamDisk::new(4096, 512)); // 2 MiB
    mkfs(
        disk.as_ref(),
        &FormatOptions {
            fmt: FormatKind::Fat,
            sfd: true,
            ..FormatOptions::default()
        },
    )
    .unwrap();
    let vol = Volume::mount(disk, 0).unwrap();
    assert_eq!(vol.kind(), FatKind::Fat12);

    let disk = Arc::new(RamDisk::new(131072, 512)); // 64 MiB
    mkfs(
        disk.as_ref(),
        &FormatOptions {
            fmt: FormatKind::Fat32,
            sfd: true,
            ..FormatOptions::default()
        },
    )
    .unwrap();
    let vol = Volume::mount(disk, 0).unwrap();
    assert_eq!(vol.kind(), FatKind::Fat32);
}

#[test]
fn unformatted_media_is_rejected() {
    let disk = Arc::new(RamDisk::new(4096, 512));
    assert_eq!(Volume::mount(disk, 0).err(), Some(FsError::NoFilesystem));
}

#[test]
fn free_count_tracks_allocation() {
    let disk = format_fat16_32m();
    let mut vol = Volume::mount(disk, 0).unwrap();
    let free0 = vol.getfree().unwrap();
    assert!(free0 > 0);

    // one cluster (2 KiB) of payload plus nothing else
    let mut f = vol
        .open("0:/one.bin", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut f, &[0xAAu8; 2048]).unwrap();
    vol.close(&mut f).unwrap();
    assert_eq!(vol.getfree().unwrap(), free0 - 1);

    vol.unlink("0:/one.bin").unwrap();
    assert_eq!(vol.getfree().unwrap(), free0);

    // the recomputed count after remount agrees with the running one
    let disk = vol.unmount().unwrap();
    let mut vol = Volume::mount(disk, 0).unwrap();
    assert_eq!(vol.getfree().unwrap(), free0);
}

#[test]
fn fat32_fsinfo_round_trip() {
    let disk = Arc::new(RamDisk::new(131072, 512));
    mkfs(
        disk.as_ref(),
        &FormatOptions {
            fmt: FormatKind::Fat32,
            sfd: true,
            ..FormatOptions::default()
        },
    )
    .unwrap();
    let mut vol = Volume::mount(disk.clone(), 0).unwrap();
    let free0 = vol.getfree().unwrap();
    let mut f = vol
        .open("0:/x.bin", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut f, &[1u8; 4096]).unwrap();
    vol.close(&mut f).unwrap();
    let free1 = vol.getfree().unwrap();
    assert!(free1 < free0);

    // remount: the FSInfo hint must agree with a raw scan of the FAT
    vol.unmount().unwrap();
    let image = disk.snapshot();
    let n_fatent = {
        let rsv = u16::from_le_bytes([image[14], image[15]]) as u32;
        let spc = image[13] as u32;
        let fat_sz = u32::from_le_bytes([image[36], image[37], image[38], image[39]]);
        let tot = u32::from_le_bytes([image[32], image[33], image[34], image[35]]);
        (tot - rsv - fat_sz * image[16] as u32) / spc + 2
    };
    let rsv = u16::from_le_bytes([image[14], image[15]]) as usize;
    let mut scanned_free = 0u32;
    for clu in 2..n_fatent as usize {
        let ofs = rsv * 512 + clu * 4;
        let cell =
            u32::from_le_bytes([image[ofs], image[ofs + 1], image[ofs + 2], image[ofs + 3]])
                & 0x0FFF_FFFF;
        if cell == 0 {
            scanned_free += 1;
        }
    }
    let fsinfo_free = u32::from_le_bytes([
        image[512 + 488],
        image[512 + 489],
        image[512 + 490],
        image[512 + 491],
    ]);
    assert_eq!(fsinfo_free, scanned_free);
    assert_eq!(fsinfo_free, free1);

    let mut vol = Volume::mount(disk.clone(), 0).unwrap();
    assert_eq!(vol.getfree().unwrap(), free1);
}

#[test]
fn unmount_invalidates_objects_by_generation() {
    let disk = format_fat16_32m();
    let mut vol = Volume::mount(disk, 0).unwrap();
    let mut f = vol
        .open("0:/gone.txt", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut f, b"x").unwrap();
    vol.close(&mut f).unwrap();
    let mut stale = vol.open("0:/gone.txt", OpenMode::READ).unwrap();

    let disk = vol.unmount().unwrap();
    let mut vol = Volume::mount(disk, 0).unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(vol.read(&mut stale, &mut buf), Err(FsError::InvalidObject));
    assert_eq!(vol.lseek(&mut stale, 0), Err(FsError::InvalidObject));

    // a freshly opened object works
    let mut f = vol.open("0:/gone.txt", OpenMode::READ).unwrap();
    assert_eq!(vol.read(&mut f, &mut buf).unwrap(), 1);
    vol.close(&mut f).unwrap();
}

/// Pass-through device that fails writes touching one armed LBA.
struct FlakyDisk {
    inner: RamDisk,
    fail_lba: AtomicU64, // u64::MAX = disarmed
}

impl FlakyDisk {
    fn new(inner: RamDisk) -> Self {
        Self {
            inner,
            fail_lba: AtomicU64::new(u64::MAX),
        }
    }

    fn arm(&self, lba: u64) {
        self.fail_lba.store(lba, Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.fail_lba.store(u64::MAX, Ordering::SeqCst);
    }
}

impl BlockDevice for FlakyDisk {
    fn status(&self) -> DeviceStatus {
        self.inner.status()
    }

    fn read_sectors(&self, buf: &mut [u8], lba: u64, count: usize) -> Result<(), DeviceError> {
        self.inner.read_sectors(buf, lba, count)
    }

    fn write_sectors(&self, buf: &[u8], lba: u64, count: usize) -> Result<(), DeviceError> {
        let armed = self.fail_lba.load(Ordering::SeqCst);
        if armed != u64::MAX && lba <= armed && armed < lba + count as u64 {
            return Err(DeviceError::WriteError);
        }
        self.inner.write_sectors(buf, lba, count)
    }

    fn ioctl(&self, cmd: Ioctl) -> Result<IoctlData, DeviceError> {
        self.inner.ioctl(cmd)
    }
}

#[test]
fn interrupted_extension_leaves_recoverable_state() {
    let disk = Arc::new(FlakyDisk::new(RamDisk::new(65536, 512)));
    mkfs(
        disk.as_ref(),
        &FormatOptions {
            fmt: FormatKind::Fat,
            n_fat: 2,
            au_size: 2048,
            n_root: 512,
            align: 1,
            sfd: false,
        },
    )
    .unwrap();
    let mut vol = Volume::mount(disk.clone(), 0).unwrap();

    let mut f = vol
        .open("0:/vic.bin", OpenMode::WRITE | OpenMode::READ | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut f, b"hello").unwrap();
    vol.close(&mut f).unwrap();
    let free_before = vol.getfree().unwrap();

    // find the sector holding the directory entry and arm the fault on it
    let image = disk.inner.snapshot();
    let pos = image
        .windows(11)
        .position(|w| w == b"VIC     BIN")
        .expect("entry on disk");
    disk.arm(pos as u64 / 512);

    // growing the file by a cluster updates FAT first, then the entry;
    // the entry write is the one that fails
    let mut f = vol
        .open("0:/vic.bin", OpenMode::WRITE | OpenMode::OPEN_APPEND)
        .unwrap();
    vol.write(&mut f, &[0x55u8; 4096]).unwrap();
    assert_eq!(vol.close(&mut f), Err(FsError::DiskErr));
    disk.disarm();

    // "crash": discard the in-memory volume without flushing, then
    // remount and rescan. The cluster the torn operation linked into the
    // FAT stays accounted as in use, nothing returns IntErr, and the old
    // content is still intact
    drop(vol);
    let mut vol = Volume::mount(disk.clone(), 0).unwrap();
    let free_after = vol.getfree().unwrap();
    assert!(free_after < free_before);

    let info = vol.stat("0:/vic.bin").unwrap();
    assert_eq!(info.fsize, 5);
    let mut f = vol.open("0:/vic.bin", OpenMode::READ).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(vol.read(&mut f, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    vol.close(&mut f).unwrap();
}
