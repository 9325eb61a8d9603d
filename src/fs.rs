//! Mounted volume state: geometry, the shared disk-access window, the
//! recognizer, and the per-volume file sharing table.
//!
//! Volume layout on disk:
//!     Boot Sector - Reserved Sectors - FAT1 - FAT2 - Root Directory
//!     (FAT12/16 only) - Data Region
//!
//! The working set of any single operation is one FAT sector plus one
//! directory sector, so a volume carries exactly one sector window.
//! Everything that touches FAT or directory sectors goes through
//! [`Volume::move_window`]; file data moves through each file's own window
//! or straight between the device and the caller's buffer. At most one
//! dirty window is outstanding per volume, and a dirty FAT sector is
//! mirrored into every FAT copy when it is written back.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};
use log::{debug, warn};

use crate::bpb::{
    exfat_boot_sum, gpt_partition, has_boot_signature, is_gpt_header, mbr_partition,
    BiosParameterBlock, ExfatBootSector, FsInfo, EXFAT_VOLUME_DIRTY, EXFAT_VOLUME_FLAGS_OFS,
    FSI_FREE_COUNT, FSI_LEAD_SIG, FSI_NXT_FREE, FSI_STRUC_SIG, FSI_TRAIL_SIG, GPT_ENT_COUNT,
    GPT_ENT_LBA, GPT_ENT_SIZE,
};
use crate::device::{BlockDevice, Clock, DeviceStatus, Ioctl, IoctlData, NoClock};
use crate::entry::{upcase_checksum, ET_BITMAP, ET_UPCASE, SZ_XDIR_BUF};
use crate::{
    read_le_u16, read_le_u32, read_le_u64, write_le_u32, FsError, FsResult, FS_LOCK,
    LEAD_SIGNATURE, MAX_CLUSTER_EXFAT, MAX_CLUSTER_FAT12, MAX_CLUSTER_FAT16, MAX_CLUSTER_FAT32,
    MAX_LFN, STRUCT_SIGNATURE, TRAIL_SIGNATURE,
};

/// On-disk variant of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatKind {
    Fat12,
    Fat16,
    Fat32,
    Exfat,
}

/// "value not known" marker for the free-cluster and last-allocated hints.
pub(crate) const UNKNOWN_CLST: u32 = 0xFFFF_FFFF;

/// Mount generation counter; every successful mount gets a fresh id so
/// objects issued against an earlier generation go stale.
static MOUNT_ID: AtomicU16 = AtomicU16::new(1);

/// Identity a file-sharing slot is keyed on: the location of the object's
/// directory entry, or the start cluster for directory objects.
pub(crate) type ShareKey = (u64, u32);

pub(crate) struct LockSlot {
    pub(crate) key: ShareKey,
    /// Reader count, or 0x100 for the writer.
    pub(crate) ctr: u16,
}

/// A mounted FAT/exFAT volume.
///
/// All public operations take `&mut self`: one call at a time has exclusive
/// use of the window, the FAT state and the allocation hints, which is the
/// same discipline the classic implementations enforce with a per-volume
/// mutex. Wrap the volume in [`crate::sync::SharedVolume`] to share it
/// between tasks.
pub struct Volume {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) kind: FatKind,
    pub(crate) mounted: bool,
    /// Mount generation, copied into every object issued on this volume.
    pub(crate) id: u16,
    /// Sector size in bytes (512, 1024, 2048 or 4096).
    pub(crate) ssize: usize,
    /// Cluster size in sectors, always a power of two.
    pub(crate) csize: u32,
    pub(crate) n_fats: u8,
    /// Number of root directory entries (FAT12/16 only).
    pub(crate) n_rootdir: u16,
    /// Number of FAT entries (cluster count + 2).
    pub(crate) n_fatent: u32,
    /// Sectors per FAT.
    pub(crate) fsize: u32,
    pub(crate) volbase: u64,
    pub(crate) fatbase: u64,
    /// Root directory base: sector for FAT12/16, cluster for FAT32/exFAT.
    pub(crate) dirbase: u64,
    pub(crate) database: u64,
    /// Allocation bitmap base sector (exFAT).
    pub(crate) bitbase: u64,
    pub(crate) last_clst: u32,
    pub(crate) free_clst: u32,
    /// Absolute LBA of the FSInfo sector, 0 when absent.
    pub(crate) fsi_sector: u64,
    /// Allocation hints changed since the last FSInfo write-back.
    pub(crate) fsi_flag: bool,
    /// exFAT VolumeDirty currently raised on disk.
    pub(crate) vol_dirty: bool,
    pub(crate) win: Vec<u8>,
    /// LBA cached in `win`; 0 means the window holds nothing.
    pub(crate) winsect: u64,
    pub(crate) wflag: bool,
    /// Current directory start cluster (0 = root).
    pub(crate) cdir: u32,
    /// Canonical text of the current directory, kept for exFAT where the
    /// on-disk tree has no dot-dot entries to walk back through.
    pub(crate) cwd: String,
    /// Long-name working buffer shared by lookup and registration.
    pub(crate) lfnbuf: Vec<u16>,
    /// exFAT directory entry set scratch.
    pub(crate) dirbuf: Vec<u8>,
    /// exFAT up-case table loaded from the volume at mount; indices past
    /// the table's end fold through the built-in BMP mapping.
    pub(crate) upcase: Vec<u16>,
    pub(crate) locks: Vec<LockSlot>,
}

impl Volume {
    /// Mount a volume on `device`. `part` selects the partition: 0 scans
    /// GPT, then MBR, then treats the medium as unpartitioned; 1..=n picks
    /// the n-th table slot.
    pub fn mount(device: Arc<dyn BlockDevice>, part: u32) -> FsResult<Volume> {
        let status = device.status();
        if !status.contains(DeviceStatus::READY) {
            return Err(FsError::NotReady);
        }
        let ssize = match device.ioctl(Ioctl::GetSectorSize) {
            Ok(IoctlData::SectorSize(s)) => s,
            _ => 512,
        };
        if !matches!(ssize, 512 | 1024 | 2048 | 4096) {
            return Err(FsError::DiskErr);
        }

        let mut vol = Volume {
            device,
            clock: Arc::new(NoClock),
            kind: FatKind::Fat12,
            mounted: false,
            id: MOUNT_ID.fetch_add(1, Ordering::Relaxed),
            ssize,
            csize: 0,
            n_fats: 0,
            n_rootdir: 0,
            n_fatent: 0,
            fsize: 0,
            volbase: 0,
            fatbase: 0,
            dirbase: 0,
            database: 0,
            bitbase: 0,
            last_clst: UNKNOWN_CLST,
            free_clst: UNKNOWN_CLST,
            fsi_sector: 0,
            fsi_flag: false,
            vol_dirty: false,
            win: vec![0u8; ssize],
            winsect: 0,
            wflag: false,
            cdir: 0,
            cwd: String::from("/"),
            lfnbuf: Vec::with_capacity(MAX_LFN + 1),
            dirbuf: vec![0u8; SZ_XDIR_BUF],
            upcase: Vec::new(),
            locks: Vec::with_capacity(FS_LOCK),
        };
        vol.find_volume(part)?;
        vol.mounted = true;
        Ok(vol)
    }

    /// Install a timestamp provider; entries created before this carry the
    /// default epoch stamp.
    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    /// Flush every pending change and give the drive handle back. All
    /// objects opened on this volume become stale.
    pub fn unmount(mut self) -> FsResult<Arc<dyn BlockDevice>> {
        self.sync_fs()?;
        self.mounted = false;
        self.locks.clear();
        Ok(self.device.clone())
    }

    pub fn kind(&self) -> FatKind {
        self.kind
    }

    pub fn sector_size(&self) -> usize {
        self.ssize
    }

    /// Cluster size in bytes.
    pub fn cluster_size(&self) -> u32 {
        self.csize * self.ssize as u32
    }

    /// Count of data clusters.
    pub fn total_clusters(&self) -> u32 {
        self.n_fatent - 2
    }

    // -----------------------------------------------------------------
    // Window cache
    // -----------------------------------------------------------------

    /// Write the window back if it is dirty. A window inside the first FAT
    /// is reflected into the second copy.
    pub(crate) fn sync_window(&mut self) -> FsResult<()> {
        if !self.wflag {
            return Ok(());
        }
        let lba = self.winsect;
        self.device
            .write_sectors(&self.win, lba, 1)
            .map_err(|_| FsError::DiskErr)?;
        self.wflag = false;
        if self.n_fats == 2 && lba >= self.fatbase && lba < self.fatbase + self.fsize as u64 {
            self.device
                .write_sectors(&self.win, lba + self.fsize as u64, 1)
                .map_err(|_| FsError::DiskErr)?;
        }
        Ok(())
    }

    /// Make the window hold `sector`, flushing the previous content first.
    /// `winsect == 0` doubles as the invalid marker, so sector 0 is never
    /// treated as cached.
    pub(crate) fn move_window(&mut self, sector: u64) -> FsResult<()> {
        if sector == self.winsect && sector != 0 {
            return Ok(());
        }
        self.sync_window()?;
        self.device
            .read_sectors(&mut self.win, sector, 1)
            .map_err(|_| FsError::DiskErr)?;
        self.winsect = sector;
        Ok(())
    }

    /// Splice bytes into the window and mark it dirty.
    pub(crate) fn win_write(&mut self, ofs: usize, data: &[u8]) {
        self.win[ofs..ofs + data.len()].copy_from_slice(data);
        self.wflag = true;
    }

    /// First sector of a data cluster.
    pub(crate) fn clst2sect(&self, clst: u32) -> u64 {
        self.database + (clst as u64 - 2) * self.csize as u64
    }

    pub(crate) fn cluster_bytes(&self) -> u64 {
        self.csize as u64 * self.ssize as u64
    }

    /// Object staleness check: a generation mismatch means the volume was
    /// remounted under the object.
    pub(crate) fn validate_obj(&self, obj_id: u16) -> FsResult<()> {
        if !self.mounted || obj_id != self.id {
            return Err(FsError::InvalidObject);
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> FsResult<()> {
        if self
            .device
            .status()
            .contains(DeviceStatus::WRITE_PROTECTED)
        {
            return Err(FsError::WriteProtected);
        }
        Ok(())
    }

    /// Raise the on-disk dirty mark before the first modification. Only
    /// exFAT defines one; FAT volumes are a no-op.
    pub(crate) fn set_dirty(&mut self) -> FsResult<()> {
        if self.kind != FatKind::Exfat || self.vol_dirty {
            return Ok(());
        }
        self.move_window(self.volbase)?;
        let mut flags = read_le_u16(&self.win[EXFAT_VOLUME_FLAGS_OFS..]);
        flags |= EXFAT_VOLUME_DIRTY;
        self.win_write(EXFAT_VOLUME_FLAGS_OFS, &flags.to_le_bytes());
        self.sync_window()?;
        self.vol_dirty = true;
        Ok(())
    }

    /// Flush the window, FSInfo (FAT32) and the drive-side cache. The
    /// persistence order within one public call is always: data sectors,
    /// directory entry, FAT, then FSInfo.
    pub(crate) fn sync_fs(&mut self) -> FsResult<()> {
        self.sync_window()?;
        if self.kind == FatKind::Fat32
            && self.fsi_flag
            && self.fsi_sector != 0
            && self.free_clst != UNKNOWN_CLST
        {
            self.move_window(self.fsi_sector)?;
            self.win.fill(0);
            write_le_u32(&mut self.win[FSI_LEAD_SIG..], LEAD_SIGNATURE);
            write_le_u32(&mut self.win[FSI_STRUC_SIG..], STRUCT_SIGNATURE);
            let free = self.free_clst;
            let last = self.last_clst;
            write_le_u32(&mut self.win[FSI_FREE_COUNT..], free);
            write_le_u32(&mut self.win[FSI_NXT_FREE..], last);
            write_le_u32(&mut self.win[FSI_TRAIL_SIG..], TRAIL_SIGNATURE);
            self.wflag = true;
            self.sync_window()?;
            self.fsi_flag = false;
        }
        if self.kind == FatKind::Exfat && self.vol_dirty {
            self.move_window(self.volbase)?;
            let mut flags = read_le_u16(&self.win[EXFAT_VOLUME_FLAGS_OFS..]);
            flags &= !EXFAT_VOLUME_DIRTY;
            self.win_write(EXFAT_VOLUME_FLAGS_OFS, &flags.to_le_bytes());
            self.sync_window()?;
            self.vol_dirty = false;
        }
        let _ = self.device.ioctl(Ioctl::Sync);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Recognizer
    // -----------------------------------------------------------------

    /// What the sector at `base` looks like.
    fn check_fs(&mut self, base: u64) -> FsResult<BootKind> {
        self.move_window(base)?;
        if !has_boot_signature(&self.win) {
            return Ok(BootKind::NoBoot);
        }
        if self.win[3..11] == *b"EXFAT   " {
            return Ok(BootKind::Exfat);
        }
        let bpb = BiosParameterBlock::from_bytes(&self.win);
        if bpb.is_plausible() {
            Ok(BootKind::Fat)
        } else {
            Ok(BootKind::NotFat)
        }
    }

    /// Locate the volume on the medium and derive its geometry.
    fn find_volume(&mut self, part: u32) -> FsResult<()> {
        // unpartitioned (super-floppy) layout is accepted only for part 0
        if part == 0 {
            match self.check_fs(0)? {
                BootKind::Fat => return self.init_fat_volume(0),
                BootKind::Exfat => return self.init_exfat_volume(0),
                _ => {}
            }
        }

        // a protective or real GPT carries its header at LBA 1
        let gpt = {
            self.move_window(1)?;
            is_gpt_header(&self.win)
        };
        let bases: Vec<u64> = if gpt {
            self.scan_gpt(part)?
        } else {
            self.scan_mbr(part)?
        };
        for base in bases {
            match self.check_fs(base)? {
                BootKind::Fat => return self.init_fat_volume(base),
                BootKind::Exfat => return self.init_exfat_volume(base),
                _ => continue,
            }
        }
        Err(FsError::NoFilesystem)
    }

    /// Candidate partition bases from a GPT, in table order. With a
    /// 1-based `part` only that Basic-Data entry is returned.
    fn scan_gpt(&mut self, part: u32) -> FsResult<Vec<u64>> {
        self.move_window(1)?;
        let ent_lba = read_le_u64(&self.win[GPT_ENT_LBA..]);
        let ent_count = read_le_u32(&self.win[GPT_ENT_COUNT..]);
        let ent_size = read_le_u32(&self.win[GPT_ENT_SIZE..]) as usize;
        if ent_size == 0 || ent_size > self.ssize || self.ssize % ent_size != 0 {
            return Err(FsError::NoFilesystem);
        }
        let per_sect = self.ssize / ent_size;
        let mut bases = Vec::new();
        let mut nth = 0u32;
        for i in 0..ent_count as usize {
            let sect = ent_lba + (i / per_sect) as u64;
            self.move_window(sect)?;
            let ofs = (i % per_sect) * ent_size;
            let entry: Vec<u8> = self.win[ofs..ofs + ent_size].to_vec();
            if let Some(p) = gpt_partition(&entry) {
                nth += 1;
                if part == 0 {
                    bases.push(p.start_lba);
                } else if nth == part {
                    return Ok(vec![p.start_lba]);
                }
            }
        }
        if part != 0 {
            return Err(FsError::NoFilesystem);
        }
        Ok(bases)
    }

    /// Candidate partition bases from the MBR. With a 1-based `part` only
    /// that primary slot is considered.
    fn scan_mbr(&mut self, part: u32) -> FsResult<Vec<u64>> {
        self.move_window(0)?;
        if !has_boot_signature(&self.win) {
            return Err(FsError::NoFilesystem);
        }
        if part > 4 {
            return Err(FsError::InvalidDrive);
        }
        let mut bases = Vec::new();
        for slot in 0..4usize {
            if part != 0 && part as usize != slot + 1 {
                continue;
            }
            if let Some(p) = mbr_partition(&self.win, slot) {
                bases.push(p.start_lba);
            }
        }
        if bases.is_empty() {
            return Err(FsError::NoFilesystem);
        }
        Ok(bases)
    }

    /// Derive FAT12/16/32 geometry from the BPB at `base`. The variant is
    /// decided by the cluster count bands and nothing else.
    fn init_fat_volume(&mut self, base: u64) -> FsResult<()> {
        self.move_window(base)?;
        let bpb = BiosParameterBlock::from_bytes(&self.win);
        if !bpb.is_plausible() || bpb.bytes_per_sector() != self.ssize {
            return Err(FsError::NoFilesystem);
        }

        let fasize = bpb.sectors_per_fat();
        let csize = bpb.sectors_per_cluster();
        let n_fats = bpb.fat_cnt();
        let n_rootdir = bpb.root_ent_cnt();
        let rsv = bpb.reserved_sector_cnt();
        let tot_sec = bpb.total_sector_cnt();
        if fasize == 0 || tot_sec == 0 {
            return Err(FsError::NoFilesystem);
        }
        if n_rootdir as usize % (self.ssize / 32) != 0 {
            return Err(FsError::NoFilesystem);
        }

        let sysect = rsv + fasize * n_fats as u32 + bpb.root_dir_sector_cnt();
        if tot_sec < sysect {
            return Err(FsError::NoFilesystem);
        }
        let n_clst = (tot_sec - sysect) / csize;
        if n_clst == 0 {
            return Err(FsError::NoFilesystem);
        }

        let kind = if n_clst < MAX_CLUSTER_FAT12 {
            FatKind::Fat12
        } else if n_clst < MAX_CLUSTER_FAT16 {
            FatKind::Fat16
        } else if n_clst <= MAX_CLUSTER_FAT32 {
            FatKind::Fat32
        } else {
            return Err(FsError::NoFilesystem);
        };
        match kind {
            FatKind::Fat32 => {
                if n_rootdir != 0 || bpb.fs_version() != 0 {
                    return Err(FsError::NoFilesystem);
                }
            }
            _ => {
                if n_rootdir == 0 {
                    return Err(FsError::NoFilesystem);
                }
            }
        }

        let n_fatent = n_clst + 2;
        // the FAT must be able to describe every cluster
        let needed = match kind {
            FatKind::Fat12 => (n_fatent as u64 * 3 + 1) / 2,
            FatKind::Fat16 => n_fatent as u64 * 2,
            _ => n_fatent as u64 * 4,
        };
        if (fasize as u64) * (self.ssize as u64) < needed {
            return Err(FsError::NoFilesystem);
        }

        self.kind = kind;
        self.csize = csize;
        self.n_fats = n_fats;
        self.n_rootdir = n_rootdir;
        self.n_fatent = n_fatent;
        self.fsize = fasize;
        self.volbase = base;
        self.fatbase = base + rsv as u64;
        self.database = base + sysect as u64;
        self.dirbase = if kind == FatKind::Fat32 {
            let root = bpb.root_cluster();
            if root < 2 || root >= n_fatent {
                return Err(FsError::NoFilesystem);
            }
            root as u64
        } else {
            self.fatbase + (fasize * n_fats as u32) as u64
        };
        self.last_clst = UNKNOWN_CLST;
        self.free_clst = UNKNOWN_CLST;
        self.fsi_sector = 0;
        self.bitbase = 0;
        self.upcase = Vec::new();

        if kind == FatKind::Fat32 {
            let fsi = bpb.fsinfo_sector();
            if fsi >= 1 && fsi < rsv {
                self.fsi_sector = base + fsi as u64;
                self.move_window(self.fsi_sector)?;
                match FsInfo::from_bytes(&self.win) {
                    Some(info) => {
                        if info.free_count <= n_clst {
                            self.free_clst = info.free_count;
                        }
                        if (2..n_fatent).contains(&info.next_free) {
                            self.last_clst = info.next_free;
                        }
                    }
                    None => warn!("fsinfo signatures invalid, hints ignored"),
                }
            }
        }

        debug!(
            "mounted {:?}: base={} csize={} n_fatent={} fatbase={} database={}",
            kind, base, csize, n_fatent, self.fatbase, self.database
        );
        Ok(())
    }

    /// Derive exFAT geometry from the boot region at `base`, verify the
    /// boot checksum sector, and locate the allocation bitmap and up-case
    /// table through the root directory.
    fn init_exfat_volume(&mut self, base: u64) -> FsResult<()> {
        self.move_window(base)?;
        let bs = ExfatBootSector::from_bytes(&self.win);
        if !bs.is_plausible() || bs.bytes_per_sector() != self.ssize {
            return Err(FsError::NoFilesystem);
        }

        // boot region checksum, sectors 0..=10, stored throughout sector 11
        let mut sum = 0u32;
        for s in 0..11u64 {
            self.move_window(base + s)?;
            sum = exfat_boot_sum(sum, &self.win, s == 0);
        }
        self.move_window(base + 11)?;
        for ofs in (0..self.ssize).step_by(4) {
            if read_le_u32(&self.win[ofs..]) != sum {
                return Err(FsError::NoFilesystem);
            }
        }

        self.move_window(base)?;
        let bs = ExfatBootSector::from_bytes(&self.win);
        let cluster_count = bs.cluster_count;
        if cluster_count > MAX_CLUSTER_EXFAT {
            return Err(FsError::NoFilesystem);
        }
        let root = bs.first_cluster_of_root_directory;
        if root < 2 || root >= cluster_count + 2 {
            return Err(FsError::NoFilesystem);
        }

        self.kind = FatKind::Exfat;
        self.csize = bs.sectors_per_cluster();
        self.n_fats = 1;
        self.n_rootdir = 0;
        self.n_fatent = cluster_count + 2;
        self.fsize = bs.fat_length;
        self.volbase = base;
        self.fatbase = base + bs.fat_offset as u64;
        self.database = base + bs.cluster_heap_offset as u64;
        self.dirbase = root as u64;
        self.last_clst = UNKNOWN_CLST;
        self.free_clst = UNKNOWN_CLST;
        self.fsi_sector = 0;
        self.bitbase = 0;
        let flags = bs.volume_flags;
        self.vol_dirty = flags & EXFAT_VOLUME_DIRTY != 0;

        self.locate_exfat_metafiles(root)?;
        if self.bitbase == 0 {
            return Err(FsError::NoFilesystem);
        }
        debug!(
            "mounted Exfat: base={} csize={} n_fatent={} bitbase={} upcase_len={}",
            base,
            self.csize,
            self.n_fatent,
            self.bitbase,
            self.upcase.len()
        );
        Ok(())
    }

    /// Walk the root directory for the allocation bitmap (0x81) and
    /// up-case table (0x82) entries.
    fn locate_exfat_metafiles(&mut self, root: u32) -> FsResult<()> {
        let mut clst = root;
        let mut hops = 0u32;
        let mut upcase_ref: Option<(u32, u64, u32)> = None;
        'scan: loop {
            let first = self.clst2sect(clst);
            for s in 0..self.csize as u64 {
                self.move_window(first + s)?;
                for ofs in (0..self.ssize).step_by(32) {
                    let ty = self.win[ofs];
                    if ty == 0 {
                        break 'scan;
                    }
                    match ty {
                        ET_BITMAP => {
                            let clu = read_le_u32(&self.win[ofs + 20..]);
                            if clu < 2 || clu >= self.n_fatent {
                                return Err(FsError::NoFilesystem);
                            }
                            self.bitbase = self.clst2sect(clu);
                        }
                        ET_UPCASE => {
                            let sum = read_le_u32(&self.win[ofs + 4..]);
                            let clu = read_le_u32(&self.win[ofs + 20..]);
                            let len = read_le_u64(&self.win[ofs + 24..]);
                            upcase_ref = Some((clu, len, sum));
                        }
                        _ => {}
                    }
                }
            }
            let next = self.get_fat(clst)?;
            if next >= crate::EOC_EXFAT {
                break;
            }
            if next < 2 || next >= self.n_fatent {
                return Err(FsError::IntErr);
            }
            clst = next;
            hops += 1;
            if hops > self.n_fatent - 2 {
                return Err(FsError::IntErr);
            }
        }
        if let Some((clu, len, sum)) = upcase_ref {
            self.load_upcase_table(clu, len, sum)?;
        }
        Ok(())
    }

    /// Read and expand the up-case table file. The on-disk form may be
    /// compressed: a 0xFFFF unit is followed by a count of identity
    /// mappings. The 32-bit table checksum must match the directory entry.
    fn load_upcase_table(&mut self, clu: u32, len: u64, want_sum: u32) -> FsResult<()> {
        if len == 0 || len > 2 * 0x10000 * 2 {
            return Err(FsError::NoFilesystem);
        }
        let mut raw: Vec<u8> = Vec::with_capacity(len as usize);
        let mut clst = clu;
        let mut sector = vec![0u8; self.ssize];
        let mut hops = 0u32;
        while (raw.len() as u64) < len {
            if clst < 2 || clst >= self.n_fatent {
                return Err(FsError::IntErr);
            }
            let first = self.clst2sect(clst);
            for s in 0..self.csize as u64 {
                if raw.len() as u64 >= len {
                    break;
                }
                self.device
                    .read_sectors(&mut sector, first + s, 1)
                    .map_err(|_| FsError::DiskErr)?;
                let take = core::cmp::min(self.ssize as u64, len - raw.len() as u64) as usize;
                raw.extend_from_slice(&sector[..take]);
            }
            if (raw.len() as u64) < len {
                let next = self.get_fat(clst)?;
                if next >= crate::EOC_EXFAT {
                    // the table is contiguous on freshly formatted volumes
                    clst += 1;
                } else {
                    clst = next;
                }
                hops += 1;
                if hops > self.n_fatent - 2 {
                    return Err(FsError::IntErr);
                }
            }
        }
        if upcase_checksum(&raw) != want_sum {
            return Err(FsError::IntErr);
        }

        let mut table: Vec<u16> = Vec::new();
        let mut i = 0usize;
        while i + 1 < raw.len() {
            let unit = read_le_u16(&raw[i..]);
            i += 2;
            if unit == 0xFFFF && i + 1 < raw.len() {
                let run = read_le_u16(&raw[i..]);
                i += 2;
                for _ in 0..run {
                    if table.len() >= 0x10000 {
                        break;
                    }
                    table.push(table.len() as u16);
                }
            } else {
                if table.len() >= 0x10000 {
                    break;
                }
                table.push(unit);
            }
        }
        self.upcase = table;
        Ok(())
    }

    /// Fold one unit through the volume's up-case mapping.
    pub(crate) fn upch(&self, unit: u16) -> u16 {
        if (unit as usize) < self.upcase.len() {
            self.upcase[unit as usize]
        } else {
            crate::name::to_upper(unit)
        }
    }

    // -----------------------------------------------------------------
    // File sharing table
    // -----------------------------------------------------------------

    /// Would opening this object in the requested mode violate the sharing
    /// policy? Any number of readers, one writer, never both.
    pub(crate) fn chk_share(&self, key: ShareKey, writer: bool) -> FsResult<()> {
        for slot in &self.locks {
            if slot.key == key {
                if writer || slot.ctr == 0x100 {
                    return Err(FsError::Locked);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn inc_share(&mut self, key: ShareKey, writer: bool) -> FsResult<()> {
        for slot in &mut self.locks {
            if slot.key == key {
                debug_assert!(!writer && slot.ctr != 0x100);
                slot.ctr += 1;
                return Ok(());
            }
        }
        if self.locks.len() >= FS_LOCK {
            return Err(FsError::TooManyOpenFiles);
        }
        self.locks.push(LockSlot {
            key,
            ctr: if writer { 0x100 } else { 1 },
        });
        Ok(())
    }

    pub(crate) fn dec_share(&mut self, key: ShareKey) {
        if let Some(i) = self.locks.iter().position(|s| s.key == key) {
            if self.locks[i].ctr == 0x100 || self.locks[i].ctr <= 1 {
                self.locks.swap_remove(i);
            } else {
                self.locks[i].ctr -= 1;
            }
        }
    }

    /// Is anything at all open on this entry?
    pub(crate) fn is_shared(&self, key: ShareKey) -> bool {
        self.locks.iter().any(|s| s.key == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootKind {
    Fat,
    Exfat,
    NotFat,
    NoBoot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;

    fn bare_volume(sectors: u64) -> Volume {
        Volume {
            device: Arc::new(RamDisk::new(sectors, 512)),
            clock: Arc::new(NoClock),
            kind: FatKind::Fat16,
            mounted: true,
            id: 1,
            ssize: 512,
            csize: 1,
            n_fats: 2,
            n_rootdir: 0,
            n_fatent: 16,
            fsize: 4,
            volbase: 0,
            fatbase: 8,
            dirbase: 16,
            database: 20,
            bitbase: 0,
            last_clst: UNKNOWN_CLST,
            free_clst: UNKNOWN_CLST,
            fsi_sector: 0,
            fsi_flag: false,
            vol_dirty: false,
            win: vec![0u8; 512],
            winsect: 0,
            wflag: false,
            cdir: 0,
            cwd: String::from("/"),
            lfnbuf: vec![0u16; MAX_LFN + 1],
            dirbuf: vec![0u8; SZ_XDIR_BUF],
            upcase: Vec::new(),
            locks: Vec::new(),
        }
    }

    #[test]
    fn window_flushes_on_move() {
        let mut vol = bare_volume(64);
        vol.move_window(20).unwrap();
        vol.win_write(0, b"hello");
        vol.move_window(21).unwrap();
        let mut sector = [0u8; 512];
        vol.device.read_sectors(&mut sector, 20, 1).unwrap();
        assert_eq!(&sector[..5], b"hello");
    }

    #[test]
    fn fat_window_mirrors_to_second_copy() {
        let mut vol = bare_volume(64);
        vol.move_window(9).unwrap(); // inside FAT1 (8..12)
        vol.win_write(0, &[0xAB; 4]);
        vol.sync_window().unwrap();
        let mut sector = [0u8; 512];
        vol.device.read_sectors(&mut sector, 13, 1).unwrap(); // FAT2 copy
        assert_eq!(&sector[..4], &[0xAB; 4]);
    }

    #[test]
    fn share_slots_enforce_single_writer() {
        let mut vol = bare_volume(64);
        let key = (100u64, 0u32);
        vol.inc_share(key, false).unwrap();
        vol.inc_share(key, false).unwrap();
        assert_eq!(vol.chk_share(key, true), Err(FsError::Locked));
        vol.dec_share(key);
        vol.dec_share(key);
        vol.chk_share(key, true).unwrap();
        vol.inc_share(key, true).unwrap();
        assert_eq!(vol.chk_share(key, false), Err(FsError::Locked));
    }

    #[test]
    fn stale_objects_are_rejected() {
        let vol = bare_volume(64);
        assert!(vol.validate_obj(1).is_ok());
        assert_eq!(vol.validate_obj(2), Err(FsError::InvalidObject));
    }
}
