//! Volume formatting and drive partitioning.
//!
//! `mkfs` lays a FAT12/16/32 or exFAT volume onto a drive: the variant
//! falls out of the cluster count the requested geometry produces, exactly
//! the same bands the recognizer uses. By default a conventional MBR with
//! one primary partition is created; super-floppy formatting puts the
//! volume at LBA 0 with no table at all. `fdisk` divides a drive into up
//! to four primary MBR partitions for separate `mkfs` runs.

use alloc::vec;
use alloc::vec::Vec;
use log::debug;

use crate::bpb::{exfat_boot_sum, MBR_TABLE, PTE_SIZ_LBA, PTE_ST_LBA, PTE_SYSTEM, SZ_PTE};
use crate::device::{BlockDevice, DeviceStatus, Ioctl, IoctlData};
use crate::entry::{upcase_checksum, ET_BITMAP, ET_UPCASE};
use crate::{
    write_le_u16, write_le_u32, write_le_u64, FsError, FsResult, BOOT_SIGNATURE, LEAD_SIGNATURE,
    MAX_CLUSTER_FAT12, MAX_CLUSTER_FAT16, MAX_CLUSTER_FAT32, STRUCT_SIGNATURE, TRAIL_SIGNATURE,
};

/// Requested on-disk variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    /// FAT12 or FAT16, whichever the cluster count lands on.
    Fat,
    Fat32,
    Exfat,
    /// Choose by volume size.
    Any,
}

/// Format parameters. Zeros mean "pick a sensible value".
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub fmt: FormatKind,
    /// Number of FAT copies (1 or 2).
    pub n_fat: u8,
    /// Cluster size in bytes (power of two), 0 = auto.
    pub au_size: u32,
    /// Root directory entries (FAT12/16 only).
    pub n_root: u16,
    /// Data area alignment in sectors, 0 = auto.
    pub align: u32,
    /// Format at LBA 0 without a partition table.
    pub sfd: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            fmt: FormatKind::Any,
            n_fat: 1,
            au_size: 0,
            n_root: 512,
            align: 0,
            sfd: false,
        }
    }
}

struct DriveGeometry {
    ssize: usize,
    total: u64,
}

fn probe(device: &dyn BlockDevice) -> FsResult<DriveGeometry> {
    if !device.status().contains(DeviceStatus::READY) {
        return Err(FsError::NotReady);
    }
    if device.status().contains(DeviceStatus::WRITE_PROTECTED) {
        return Err(FsError::WriteProtected);
    }
    let ssize = match device.ioctl(Ioctl::GetSectorSize) {
        Ok(IoctlData::SectorSize(s)) => s,
        _ => 512,
    };
    if !matches!(ssize, 512 | 1024 | 2048 | 4096) {
        return Err(FsError::DiskErr);
    }
    let total = match device.ioctl(Ioctl::GetSectorCount) {
        Ok(IoctlData::SectorCount(n)) => n,
        _ => return Err(FsError::DiskErr),
    };
    if total < 128 {
        return Err(FsError::MkfsAborted);
    }
    Ok(DriveGeometry { ssize, total })
}

fn zero_region(device: &dyn BlockDevice, ssize: usize, lba: u64, count: u64) -> FsResult<()> {
    let chunk = 64usize;
    let zeros = vec![0u8; ssize * chunk];
    let mut done = 0u64;
    while done < count {
        let n = core::cmp::min(chunk as u64, count - done) as usize;
        device
            .write_sectors(&zeros[..n * ssize], lba + done, n)
            .map_err(|_| FsError::DiskErr)?;
        done += n as u64;
    }
    Ok(())
}

/// Write an MBR whose single primary partition covers
/// [b_vol, b_vol + sz_vol).
fn write_mbr_single(
    device: &dyn BlockDevice,
    ssize: usize,
    b_vol: u64,
    sz_vol: u64,
    system: u8,
) -> FsResult<()> {
    let mut mbr = vec![0u8; ssize];
    let ofs = MBR_TABLE;
    mbr[ofs] = 0x00; // not bootable
    mbr[ofs + 1] = 0xFE; // CHS fudged, LBA rules
    mbr[ofs + 2] = 0xFF;
    mbr[ofs + 3] = 0xFF;
    mbr[ofs + PTE_SYSTEM] = system;
    mbr[ofs + 5] = 0xFE;
    mbr[ofs + 6] = 0xFF;
    mbr[ofs + 7] = 0xFF;
    write_le_u32(&mut mbr[ofs + PTE_ST_LBA..], b_vol as u32);
    write_le_u32(&mut mbr[ofs + PTE_SIZ_LBA..], sz_vol as u32);
    write_le_u16(&mut mbr[510..], BOOT_SIGNATURE);
    device
        .write_sectors(&mbr, 0, 1)
        .map_err(|_| FsError::DiskErr)
}

/// A serial number for a fresh volume; formatting is deterministic, so it
/// is derived from the geometry rather than wall time.
fn volume_serial(sz_vol: u64, n_clst: u32) -> u32 {
    let mut x = sz_vol as u32 ^ 0x4D53_444F;
    x = x.wrapping_mul(0x0100_0193) ^ n_clst;
    x.wrapping_mul(0x0100_0193)
}

/// Create a FAT/exFAT volume on the drive.
pub fn mkfs(device: &dyn BlockDevice, opts: &FormatOptions) -> FsResult<()> {
    let geo = probe(device)?;
    if !matches!(opts.n_fat, 1 | 2) {
        return Err(FsError::InvalidParameter);
    }
    if opts.au_size != 0
        && (!opts.au_size.is_power_of_two()
            || opts.au_size < geo.ssize as u32
            || opts.au_size > 128 * geo.ssize as u32)
    {
        return Err(FsError::InvalidParameter);
    }

    let b_vol: u64 = if opts.sfd { 0 } else { 2048.min(geo.total / 16) };
    let sz_vol = geo.total - b_vol;
    if sz_vol < 128 {
        return Err(FsError::MkfsAborted);
    }

    let fmt = match opts.fmt {
        FormatKind::Any => {
            // small media land on FAT, the rest on FAT32
            if sz_vol < 0x40000 {
                FormatKind::Fat
            } else {
                FormatKind::Fat32
            }
        }
        f => f,
    };

    match fmt {
        FormatKind::Fat => mkfs_fat16(device, &geo, opts, b_vol, sz_vol),
        FormatKind::Fat32 => mkfs_fat32(device, &geo, opts, b_vol, sz_vol),
        FormatKind::Exfat => mkfs_exfat(device, &geo, opts, b_vol, sz_vol),
        FormatKind::Any => unreachable!(),
    }?;
    let _ = device.ioctl(Ioctl::Sync);
    Ok(())
}

/// Shared FAT12/16/32 boot-sector skeleton.
#[allow(clippy::too_many_arguments)]
fn write_fat_boot(
    device: &dyn BlockDevice,
    ssize: usize,
    b_vol: u64,
    sz_vol: u64,
    au: u32,
    sz_rsv: u32,
    n_fat: u8,
    n_root: u16,
    sz_fat: u32,
    fat32: bool,
    n_clst: u32,
) -> FsResult<()> {
    let mut bs = vec![0u8; ssize];
    bs[0] = 0xEB;
    bs[1] = 0xFE;
    bs[2] = 0x90;
    bs[3..11].copy_from_slice(b"MSDOS5.0");
    write_le_u16(&mut bs[11..], ssize as u16);
    bs[13] = au as u8;
    write_le_u16(&mut bs[14..], sz_rsv as u16);
    bs[16] = n_fat;
    write_le_u16(&mut bs[17..], if fat32 { 0 } else { n_root });
    if sz_vol < 0x10000 && !fat32 {
        write_le_u16(&mut bs[19..], sz_vol as u16);
    } else {
        write_le_u32(&mut bs[32..], sz_vol as u32);
    }
    bs[21] = 0xF8;
    if !fat32 {
        write_le_u16(&mut bs[22..], sz_fat as u16);
    }
    write_le_u16(&mut bs[24..], 63); // sectors per track, legacy
    write_le_u16(&mut bs[26..], 255); // heads, legacy
    write_le_u32(&mut bs[28..], b_vol as u32); // hidden sectors
    let serial = volume_serial(sz_vol, n_clst);
    if fat32 {
        write_le_u32(&mut bs[36..], sz_fat);
        write_le_u16(&mut bs[42..], 0); // fs version 0.0
        write_le_u32(&mut bs[44..], 2); // root cluster
        write_le_u16(&mut bs[48..], 1); // fsinfo
        write_le_u16(&mut bs[50..], 6); // backup boot
        bs[64] = 0x80;
        bs[66] = 0x29;
        write_le_u32(&mut bs[67..], serial);
        bs[71..82].copy_from_slice(b"NO NAME    ");
        bs[82..90].copy_from_slice(b"FAT32   ");
    } else {
        bs[36] = 0x80;
        bs[38] = 0x29;
        write_le_u32(&mut bs[39..], serial);
        bs[43..54].copy_from_slice(b"NO NAME    ");
        bs[54..62].copy_from_slice(if n_clst < MAX_CLUSTER_FAT12 {
            b"FAT12   "
        } else {
            b"FAT16   "
        });
    }
    write_le_u16(&mut bs[510..], BOOT_SIGNATURE);
    device
        .write_sectors(&bs, b_vol, 1)
        .map_err(|_| FsError::DiskErr)?;
    if fat32 {
        // backup boot record at sector 6
        device
            .write_sectors(&bs, b_vol + 6, 1)
            .map_err(|_| FsError::DiskErr)?;
    }
    Ok(())
}

fn mkfs_fat16(
    device: &dyn BlockDevice,
    geo: &DriveGeometry,
    opts: &FormatOptions,
    b_vol: u64,
    sz_vol: u64,
) -> FsResult<()> {
    let ssize = geo.ssize as u32;
    let n_root = if opts.n_root == 0 { 512 } else { opts.n_root };
    if n_root as u32 % (ssize / 32) != 0 {
        return Err(FsError::InvalidParameter);
    }
    let au = if opts.au_size != 0 {
        opts.au_size / ssize
    } else {
        // classic media-size table
        match sz_vol {
            0..=0x2000 => 1,
            0x2001..=0x10000 => 2,
            0x10001..=0x40000 => 4,
            0x40001..=0x100000 => 16,
            0x100001..=0x400000 => 64,
            _ => 128,
        }
    };
    let sz_rsv = 1u32;
    let sz_dir = n_root as u32 * 32 / ssize;

    if sz_vol > u32::MAX as u64 {
        return Err(FsError::MkfsAborted);
    }
    let mut sz_fat = 0u32;
    let mut n_clst = 0u32;
    for _ in 0..4 {
        let used = sz_rsv + sz_fat * opts.n_fat as u32 + sz_dir;
        if sz_vol as u32 <= used {
            return Err(FsError::MkfsAborted);
        }
        n_clst = (sz_vol as u32 - used) / au;
        if n_clst == 0 {
            return Err(FsError::MkfsAborted);
        }
        let bytes = if n_clst < MAX_CLUSTER_FAT12 {
            (n_clst as u64 + 2) * 3 / 2 + 1
        } else {
            (n_clst as u64 + 2) * 2
        };
        sz_fat = ((bytes + ssize as u64 - 1) / ssize as u64) as u32;
    }
    if n_clst >= MAX_CLUSTER_FAT16 {
        return Err(FsError::MkfsAborted);
    }
    let fat12 = n_clst < MAX_CLUSTER_FAT12;

    write_fat_boot(
        device, geo.ssize, b_vol, sz_vol, au, sz_rsv, opts.n_fat, n_root, sz_fat, false, n_clst,
    )?;
    // FATs and the fixed root directory start out clear
    let b_fat = b_vol + sz_rsv as u64;
    zero_region(
        device,
        geo.ssize,
        b_fat,
        (sz_fat * opts.n_fat as u32 + sz_dir) as u64,
    )?;
    // reserved cells 0 and 1
    let mut first = vec![0u8; geo.ssize];
    if fat12 {
        write_le_u32(&mut first[0..], 0x00FF_FFF8);
    } else {
        write_le_u32(&mut first[0..], 0xFFFF_FFF8);
    }
    for copy in 0..opts.n_fat {
        device
            .write_sectors(&first, b_fat + (copy as u32 * sz_fat) as u64, 1)
            .map_err(|_| FsError::DiskErr)?;
    }
    if !opts.sfd {
        write_mbr_single(device, geo.ssize, b_vol, sz_vol, if fat12 { 0x01 } else { 0x06 })?;
    }
    debug!(
        "mkfs fat{}: {} clusters, fat {} sectors",
        if fat12 { 12 } else { 16 },
        n_clst,
        sz_fat
    );
    Ok(())
}

fn mkfs_fat32(
    device: &dyn BlockDevice,
    geo: &DriveGeometry,
    opts: &FormatOptions,
    b_vol: u64,
    sz_vol: u64,
) -> FsResult<()> {
    let ssize = geo.ssize as u32;
    let au = if opts.au_size != 0 {
        opts.au_size / ssize
    } else {
        match sz_vol {
            0..=0x80000 => 1,
            0x80001..=0x1000000 => 8,
            0x1000001..=0x2000000 => 16,
            0x2000001..=0x4000000 => 32,
            _ => 64,
        }
    };
    let sz_rsv = 32u32;

    if sz_vol > u32::MAX as u64 {
        return Err(FsError::MkfsAborted);
    }
    let mut sz_fat = 0u32;
    let mut n_clst = 0u32;
    for _ in 0..4 {
        let used = sz_rsv + sz_fat * opts.n_fat as u32;
        if sz_vol as u32 <= used {
            return Err(FsError::MkfsAborted);
        }
        n_clst = (sz_vol as u32 - used) / au;
        let bytes = (n_clst as u64 + 2) * 4;
        sz_fat = ((bytes + ssize as u64 - 1) / ssize as u64) as u32;
    }
    if n_clst < MAX_CLUSTER_FAT16 || n_clst > MAX_CLUSTER_FAT32 {
        return Err(FsError::MkfsAborted);
    }

    write_fat_boot(
        device, geo.ssize, b_vol, sz_vol, au, sz_rsv, opts.n_fat, 0, sz_fat, true, n_clst,
    )?;

    // FSInfo (and its backup copy next to the backup boot record)
    let mut fsi = vec![0u8; geo.ssize];
    write_le_u32(&mut fsi[0..], LEAD_SIGNATURE);
    write_le_u32(&mut fsi[484..], STRUCT_SIGNATURE);
    write_le_u32(&mut fsi[488..], n_clst - 1);
    write_le_u32(&mut fsi[492..], 2);
    write_le_u32(&mut fsi[508..], TRAIL_SIGNATURE);
    device
        .write_sectors(&fsi, b_vol + 1, 1)
        .map_err(|_| FsError::DiskErr)?;
    device
        .write_sectors(&fsi, b_vol + 7, 1)
        .map_err(|_| FsError::DiskErr)?;

    let b_fat = b_vol + sz_rsv as u64;
    zero_region(device, geo.ssize, b_fat, (sz_fat * opts.n_fat as u32) as u64)?;
    let mut first = vec![0u8; geo.ssize];
    write_le_u32(&mut first[0..], 0x0FFF_FFF8); // FAT[0]: media
    write_le_u32(&mut first[4..], 0x0FFF_FFFF); // FAT[1]: clean
    write_le_u32(&mut first[8..], 0x0FFF_FFFF); // FAT[2]: root dir EOC
    for copy in 0..opts.n_fat {
        device
            .write_sectors(&first, b_fat + (copy as u32 * sz_fat) as u64, 1)
            .map_err(|_| FsError::DiskErr)?;
    }
    // root directory cluster
    let b_data = b_fat + (sz_fat * opts.n_fat as u32) as u64;
    zero_region(device, geo.ssize, b_data, au as u64)?;

    if !opts.sfd {
        write_mbr_single(device, geo.ssize, b_vol, sz_vol, 0x0C)?;
    }
    debug!("mkfs fat32: {} clusters, fat {} sectors", n_clst, sz_fat);
    Ok(())
}

/// The up-case table written to fresh exFAT volumes: ASCII identity with
/// a-z folded, everything above mapping to itself implicitly.
fn build_upcase() -> Vec<u8> {
    let mut raw = Vec::with_capacity(256);
    for u in 0u16..128 {
        let up = if (0x61..=0x7A).contains(&u) { u - 0x20 } else { u };
        raw.extend_from_slice(&up.to_le_bytes());
    }
    raw
}

fn mkfs_exfat(
    device: &dyn BlockDevice,
    geo: &DriveGeometry,
    opts: &FormatOptions,
    b_vol: u64,
    sz_vol: u64,
) -> FsResult<()> {
    let ssize = geo.ssize as u64;
    let au = if opts.au_size != 0 {
        (opts.au_size as u64 / ssize) as u32
    } else if sz_vol >= 0x4000000 {
        256
    } else if sz_vol >= 0x80000 {
        64
    } else {
        8
    };
    let align = if opts.align == 0 { au } else { opts.align };
    let fat_ofs = 32u32;

    let mut sz_fat = 0u32;
    let mut heap_ofs = 0u32;
    let mut n_clst = 0u32;
    for _ in 0..4 {
        heap_ofs = fat_ofs + sz_fat;
        heap_ofs = (heap_ofs + align - 1) / align * align;
        if sz_vol <= heap_ofs as u64 {
            return Err(FsError::MkfsAborted);
        }
        n_clst = ((sz_vol - heap_ofs as u64) / au as u64) as u32;
        if n_clst == 0 {
            return Err(FsError::MkfsAborted);
        }
        let bytes = (n_clst as u64 + 2) * 4;
        sz_fat = ((bytes + ssize - 1) / ssize) as u32;
    }

    let csz = au as u64 * ssize;
    let bitmap_bytes = (n_clst as u64 + 7) / 8;
    let n_bitmap = ((bitmap_bytes + csz - 1) / csz) as u32;
    let upcase = build_upcase();
    let upcase_sum = upcase_checksum(&upcase);
    let n_upcase = ((upcase.len() as u64 + csz - 1) / csz) as u32;

    let bitmap_clu = 2u32;
    let upcase_clu = bitmap_clu + n_bitmap;
    let root_clu = upcase_clu + n_upcase;
    if root_clu >= n_clst + 2 {
        return Err(FsError::MkfsAborted);
    }

    let b_fat = b_vol + fat_ofs as u64;
    let b_data = b_vol + heap_ofs as u64;
    let clst2sect = |clu: u32| b_data + (clu as u64 - 2) * au as u64;

    // FAT: reserved cells, then chains for the three metafiles
    zero_region(device, geo.ssize, b_fat, sz_fat as u64)?;
    {
        let cells_per_sect = ssize as usize / 4;
        let n_cells = (root_clu + 1 + 2) as usize;
        let n_sect = (n_cells + cells_per_sect - 1) / cells_per_sect;
        let mut fat = vec![0u8; n_sect * geo.ssize];
        write_le_u32(&mut fat[0..], 0xFFFF_FFF8);
        write_le_u32(&mut fat[4..], 0xFFFF_FFFF);
        let mut chain = |first: u32, count: u32| {
            for i in 0..count {
                let clu = first + i;
                let val = if i + 1 == count { 0xFFFF_FFFF } else { clu + 1 };
                write_le_u32(&mut fat[clu as usize * 4..], val);
            }
        };
        chain(bitmap_clu, n_bitmap);
        chain(upcase_clu, n_upcase);
        chain(root_clu, 1);
        device
            .write_sectors(&fat, b_fat, n_sect)
            .map_err(|_| FsError::DiskErr)?;
    }

    // allocation bitmap: metafile clusters in use
    zero_region(device, geo.ssize, clst2sect(bitmap_clu), (n_bitmap * au) as u64)?;
    {
        let used = root_clu + 1 - 2;
        let mut head = vec![0u8; geo.ssize];
        for bit in 0..used {
            head[bit as usize / 8] |= 1 << (bit % 8);
        }
        device
            .write_sectors(&head, clst2sect(bitmap_clu), 1)
            .map_err(|_| FsError::DiskErr)?;
    }

    // up-case table
    zero_region(device, geo.ssize, clst2sect(upcase_clu), (n_upcase * au) as u64)?;
    {
        let mut sect = vec![0u8; geo.ssize];
        sect[..upcase.len()].copy_from_slice(&upcase);
        device
            .write_sectors(&sect, clst2sect(upcase_clu), 1)
            .map_err(|_| FsError::DiskErr)?;
    }

    // root directory: bitmap and up-case entries
    zero_region(device, geo.ssize, clst2sect(root_clu), au as u64)?;
    {
        let mut sect = vec![0u8; geo.ssize];
        sect[0] = ET_BITMAP;
        write_le_u32(&mut sect[20..], bitmap_clu);
        write_le_u64(&mut sect[24..], bitmap_bytes);
        sect[32] = ET_UPCASE;
        write_le_u32(&mut sect[32 + 4..], upcase_sum);
        write_le_u32(&mut sect[32 + 20..], upcase_clu);
        write_le_u64(&mut sect[32 + 24..], upcase.len() as u64);
        device
            .write_sectors(&sect, clst2sect(root_clu), 1)
            .map_err(|_| FsError::DiskErr)?;
    }

    // boot region: boot sector, eight extended boot sectors, OEM
    // parameters, one reserved sector, the checksum sector; then a full
    // backup copy
    let mut boot = vec![0u8; geo.ssize];
    boot[0] = 0xEB;
    boot[1] = 0x76;
    boot[2] = 0x90;
    boot[3..11].copy_from_slice(b"EXFAT   ");
    write_le_u64(&mut boot[64..], b_vol);
    write_le_u64(&mut boot[72..], sz_vol);
    write_le_u32(&mut boot[80..], fat_ofs);
    write_le_u32(&mut boot[84..], sz_fat);
    write_le_u32(&mut boot[88..], heap_ofs);
    write_le_u32(&mut boot[92..], n_clst);
    write_le_u32(&mut boot[96..], root_clu);
    write_le_u32(&mut boot[100..], volume_serial(sz_vol, n_clst));
    write_le_u16(&mut boot[104..], 0x0100); // revision 1.00
    write_le_u16(&mut boot[106..], 0); // volume flags
    boot[108] = geo.ssize.trailing_zeros() as u8;
    boot[109] = au.trailing_zeros() as u8;
    boot[110] = 1; // number of FATs
    boot[111] = 0x80; // drive select
    boot[112] = ((root_clu + 1 - 2) * 100 / n_clst) as u8;
    write_le_u16(&mut boot[510..], BOOT_SIGNATURE);

    // extended boot sectors end in the 0xAA550000 signature
    let mut ext = vec![0u8; geo.ssize];
    write_le_u32(&mut ext[geo.ssize - 4..], 0xAA55_0000);
    let zeros = vec![0u8; geo.ssize];

    let mut sum = 0u32;
    for s in 0..11u64 {
        let sector: &[u8] = match s {
            0 => &boot,
            1..=8 => &ext,
            _ => &zeros,
        };
        sum = exfat_boot_sum(sum, sector, s == 0);
    }
    let mut sumsect = vec![0u8; geo.ssize];
    for ofs in (0..geo.ssize).step_by(4) {
        write_le_u32(&mut sumsect[ofs..], sum);
    }

    for base in [b_vol, b_vol + 12] {
        device
            .write_sectors(&boot, base, 1)
            .map_err(|_| FsError::DiskErr)?;
        for s in 1..=8u64 {
            device
                .write_sectors(&ext, base + s, 1)
                .map_err(|_| FsError::DiskErr)?;
        }
        device
            .write_sectors(&zeros, base + 9, 1)
            .map_err(|_| FsError::DiskErr)?;
        device
            .write_sectors(&zeros, base + 10, 1)
            .map_err(|_| FsError::DiskErr)?;
        device
            .write_sectors(&sumsect, base + 11, 1)
            .map_err(|_| FsError::DiskErr)?;
    }

    if !opts.sfd {
        write_mbr_single(device, geo.ssize, b_vol, sz_vol, 0x07)?;
    }
    debug!(
        "mkfs exfat: {} clusters of {} sectors, fat {} sectors, root at {}",
        n_clst, au, sz_fat, root_clu
    );
    Ok(())
}

/// Divide a drive into up to four primary MBR partitions. Entries of
/// `sizes` are sector counts, or percentages of the drive when 100 or
/// less.
pub fn fdisk(device: &dyn BlockDevice, sizes: &[u32]) -> FsResult<()> {
    let geo = probe(device)?;
    if sizes.is_empty() || sizes.len() > 4 {
        return Err(FsError::InvalidParameter);
    }
    let mut mbr = vec![0u8; geo.ssize];
    let mut next = 63u64;
    for (i, &want) in sizes.iter().enumerate() {
        let sectors = if want <= 100 {
            geo.total * want as u64 / 100
        } else {
            want as u64
        };
        if sectors == 0 {
            continue;
        }
        let start = next;
        let end = core::cmp::min(start + sectors, geo.total);
        if start >= end {
            break;
        }
        let ofs = MBR_TABLE + SZ_PTE * i;
        mbr[ofs + 1] = 0xFE;
        mbr[ofs + 2] = 0xFF;
        mbr[ofs + 3] = 0xFF;
        mbr[ofs + PTE_SYSTEM] = 0x0C;
        mbr[ofs + 5] = 0xFE;
        mbr[ofs + 6] = 0xFF;
        mbr[ofs + 7] = 0xFF;
        write_le_u32(&mut mbr[ofs + PTE_ST_LBA..], start as u32);
        write_le_u32(&mut mbr[ofs + PTE_SIZ_LBA..], (end - start) as u32);
        next = end;
    }
    write_le_u16(&mut mbr[510..], BOOT_SIGNATURE);
    device
        .write_sectors(&mbr, 0, 1)
        .map_err(|_| FsError::DiskErr)?;
    let _ = device.ioctl(Ioctl::Sync);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpb::mbr_partition;
    use crate::device::RamDisk;

    #[test]
    fn fdisk_lays_out_primaries() {
        let disk = RamDisk::new(100_000, 512);
        fdisk(&disk, &[50, 25]).unwrap();
        let mut mbr = [0u8; 512];
        disk.read_sectors(&mut mbr, 0, 1).unwrap();
        let p1 = mbr_partition(&mbr, 0).unwrap();
        let p2 = mbr_partition(&mbr, 1).unwrap();
        assert_eq!(p1.start_lba, 63);
        assert_eq!(p1.size, 50_000);
        assert_eq!(p2.start_lba, p1.start_lba + p1.size);
        assert!(mbr_partition(&mbr, 2).is_none());
    }

    #[test]
    fn tiny_drive_is_rejected(){
        let disk = RamDisk::new(64, 512);
        assert_eq!(
            mkfs(&disk, &FormatOptions::default()),
            Err(FsError::MkfsAborted)
        );
    }
}
