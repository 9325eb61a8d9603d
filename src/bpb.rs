//! Boot region structures: BPB, FSInfo, exFAT boot sector, partition tables.
//!
//! The first important data structure on a FAT volume is the BPB (BIOS
//! Parameter Block), located in the first sector of the volume in the
//! Reserved Region. This sector is sometimes called the "boot sector" or
//! the "0th sector"; the important fact is simply that it is the first
//! sector of the volume.
//!
//! The count of clusters is exactly that: the count of data clusters
//! starting at cluster 2. The maximum valid cluster number for the volume
//! is CountofClusters + 1, and the "count of clusters including the two
//! reserved clusters" is CountofClusters + 2.
//!
//! Everything here is little endian. These structures are read out of (and
//! written into) a sector buffer by value; nothing retains a pointer into
//! the window.

use crate::{read_le_u16, read_le_u32, read_le_u64, BOOT_SIGNATURE};

/// Boot Sector and BPB Structure common to FAT12/16/32 (first 36 bytes).
#[derive(Debug, Clone, Copy)]
#[repr(packed)]
pub struct BasicBpb {
    /// x86 jump instruction to the boot code.
    ///
    /// Jump and NOP instructions    Size: 3 bytes    Value: 0xEB ?? 0x90 or 0xE9 ?? ??    Offset: 0x00
    pub(crate) bs_jmp_boot: [u8; 3],
    /// OEM name, only a name string.    Size: 8 bytes    Offset: 0x03
    pub(crate) bs_oem_name: [u8; 8],
    /// Bytes per sector. May take on only the values 512, 1024, 2048 or 4096.
    ///
    /// Size: 2 bytes    Offset: 0x0B
    pub(crate) byts_per_sec: u16,
    /// Sectors per allocation unit. Must be a power of 2 in 1..=128.
    ///
    /// Size: 1 byte    Offset: 0x0D
    pub(crate) sec_per_clus: u8,
    /// Number of reserved sectors, starting at the first sector of the
    /// volume. Must never be 0. Typically 32 for FAT32.
    ///
    /// Size: 2 bytes    Offset: 0x0E
    pub(crate) rsvd_sec_cnt: u16,
    /// Number of FATs. Should be 2 for any FAT volume, 1 is accepted.
    ///
    /// Size: 1 byte    Offset: 0x10
    pub(crate) num_fats: u8,
    /// Count of 32-byte entries in the root directory (FAT12/16).
    /// For FAT32 volumes this field must be 0.
    ///
    /// Size: 2 bytes    Offset: 0x11
    pub(crate) root_ent_cnt: u16,
    /// Total sectors (FAT12/16). If 0, tot_sec32 must be non-zero.
    ///
    /// Size: 2 bytes    Offset: 0x13
    pub(crate) tot_sec16: u16,
    /// Media descriptor. 0xF8 for fixed media, 0xF0 for removable.
    /// Whatever value is put here must also be put in the low byte of FAT[0].
    ///
    /// Size: 1 byte    Offset: 0x15
    pub(crate) media: u8,
    /// Sectors per FAT (FAT12/16). 0 on FAT32, where fat_sz32 is used.
    ///
    /// Size: 2 bytes    Offset: 0x16
    pub(crate) fat_sz16: u16,
    /// Sectors per track for interrupt 0x13. Not used.
    pub(crate) sec_per_trk: u16,
    /// Number of heads for interrupt 0x13. Not used.
    pub(crate) num_heads: u16,
    /// Count of hidden sectors preceding the partition containing this
    /// volume. Zero on unpartitioned media.
    ///
    /// Size: 4 bytes    Offset: 0x1C
    pub(crate) hidd_sec: u32,
    /// 32-bit total count of sectors on the volume, all four regions
    /// included. Non-zero when tot_sec16 is 0.
    ///
    /// Size: 4 bytes    Offset: 0x20
    pub(crate) tot_sec32: u32,
}

/// FAT32 extension of the boot sector, starting at offset 36 (0x24).
#[derive(Debug, Clone, Copy)]
#[repr(packed)]
pub struct Bpb32 {
    /// FAT32 32-bit count of sectors occupied by ONE FAT.
    ///
    /// Size: 4 bytes    Offset: 0x24
    pub(crate) fat_sz32: u32,
    /// Extended flags: b0-3 active FAT, b7 = 1 means mirroring disabled.
    ///
    /// Size: 2 bytes    Offset: 0x28
    pub(crate) ext_flags: u16,
    /// Filesystem version, must be 0.0 for this driver to mount.
    ///
    /// Size: 2 bytes    Offset: 0x2A
    pub(crate) fs_ver: u16,
    /// Cluster number of the first cluster of the root directory,
    /// usually 2 but not required to be 2.
    ///
    /// Size: 4 bytes    Offset: 0x2C
    pub(crate) root_clus: u32,
    /// Sector number of the FSINFO structure in the reserved area. Usually 1.
    ///
    /// Size: 2 bytes    Offset: 0x30
    pub(crate) fs_info: u16,
    /// Sector number of the backup boot record in the reserved area.
    /// No value other than 6 should ever be placed here.
    ///
    /// Size: 2 bytes    Offset: 0x32
    pub(crate) bk_boot_sec: u16,
    pub(crate) reserved: [u8; 12],
    /// Physical drive number for INT 13h.    Offset: 0x40
    pub(crate) bs_drv_num: u8,
    pub(crate) bs_reserved1: u8,
    /// Extended boot signature, 0x29 when the three fields below are present.
    pub(crate) bs_boot_sig: u8,
    /// Volume serial number, usually date and time combined at format.
    pub(crate) bs_vol_id: u32,
    /// Volume label, matching the 11-byte volume label in the root directory.
    pub(crate) bs_vol_lab: [u8; 11],
    /// "FAT32   ". Informational only, never used to determine the type.
    pub(crate) bs_fil_sys_type: [u8; 8],
}

/// Parsed copy of a candidate FAT boot sector.
#[derive(Debug, Clone, Copy)]
pub struct BiosParameterBlock {
    pub(crate) basic: BasicBpb,
    pub(crate) bpb32: Bpb32,
}

impl BiosParameterBlock {
    /// Snapshot the BPB out of a raw boot sector.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let basic = unsafe { (buf.as_ptr() as *const BasicBpb).read_unaligned() };
        let bpb32 = unsafe { (buf.as_ptr().add(36) as *const Bpb32).read_unaligned() };
        Self { basic, bpb32 }
    }

    /// Structural plausibility of the common fields. The variant itself is
    /// decided later, from the derived cluster count alone.
    pub fn is_plausible(&self) -> bool {
        let jmp = self.basic.bs_jmp_boot;
        let jump_ok = (jmp[0] == 0xEB && jmp[2] == 0x90) || jmp[0] == 0xE9;
        let bps = self.bytes_per_sector();
        let spc = self.basic.sec_per_clus;
        let n_fats = self.basic.num_fats;
        let rsvd = self.basic.rsvd_sec_cnt;
        jump_ok
            && matches!(bps, 512 | 1024 | 2048 | 4096)
            && spc.is_power_of_two()
            && matches!(n_fats, 1 | 2)
            && rsvd >= 1
    }

    pub fn bytes_per_sector(&self) -> usize {
        self.basic.byts_per_sec as usize
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        self.basic.sec_per_clus as u32
    }

    pub fn reserved_sector_cnt(&self) -> u32 {
        self.basic.rsvd_sec_cnt as u32
    }

    pub fn fat_cnt(&self) -> u8 {
        self.basic.num_fats
    }

    pub fn root_ent_cnt(&self) -> u16 {
        self.basic.root_ent_cnt
    }

    /// Total sectors, whichever of the 16/32-bit fields is in use.
    pub fn total_sector_cnt(&self) -> u32 {
        let ts16 = self.basic.tot_sec16;
        if ts16 != 0 {
            ts16 as u32
        } else {
            self.basic.tot_sec32
        }
    }

    /// Sectors per FAT, whichever of the 16/32-bit fields is in use.
    pub fn sectors_per_fat(&self) -> u32 {
        let fs16 = self.basic.fat_sz16;
        if fs16 != 0 {
            fs16 as u32
        } else {
            self.bpb32.fat_sz32
        }
    }

    /// Sectors occupied by the FAT12/16 root directory region. Always 0 on
    /// FAT32, where root_ent_cnt is 0. Note that this computation rounds up.
    pub fn root_dir_sector_cnt(&self) -> u32 {
        let bps = self.bytes_per_sector() as u32;
        (self.basic.root_ent_cnt as u32 * 32 + bps - 1) / bps
    }

    pub fn root_cluster(&self) -> u32 {
        self.bpb32.root_clus
    }

    pub fn fsinfo_sector(&self) -> u32 {
        self.bpb32.fs_info as u32
    }

    pub fn fs_version(&self) -> u16 {
        self.bpb32.fs_ver
    }

    pub fn volume_serial(&self) -> u32 {
        self.bpb32.bs_vol_id
    }

    pub fn media(&self) -> u8 {
        self.basic.media
    }
}

/// FAT32 FSInfo sector field offsets.
///
/// The free count at FSI_FREE_COUNT is the last known free cluster count on
/// the volume; 0xFFFFFFFF means unknown and must be computed. The next-free
/// value is a hint for where the driver should start looking for free
/// clusters, typically the last cluster allocated.
pub const FSI_LEAD_SIG: usize = 0;
pub const FSI_STRUC_SIG: usize = 484;
pub const FSI_FREE_COUNT: usize = 488;
pub const FSI_NXT_FREE: usize = 492;
pub const FSI_TRAIL_SIG: usize = 508;

/// Hints read out of a FAT32 FSInfo sector.
#[derive(Debug, Clone, Copy)]
pub struct FsInfo {
    pub free_count: u32,
    pub next_free: u32,
}

impl FsInfo {
    /// Validate both signatures and extract the hints.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if read_le_u32(&buf[FSI_LEAD_SIG..]) != crate::LEAD_SIGNATURE
            || read_le_u32(&buf[FSI_STRUC_SIG..]) != crate::STRUCT_SIGNATURE
        {
            return None;
        }
        Some(Self {
            free_count: read_le_u32(&buf[FSI_FREE_COUNT..]),
            next_free: read_le_u32(&buf[FSI_NXT_FREE..]),
        })
    }
}

/// exFAT boot sector (first 120 bytes; the rest is boot code and the
/// 0xAA55 signature).
///
/// The region at offset 11..64 corresponds to the FAT12/16/32 BPB and must
/// be all zeroes so FAT drivers cannot misinterpret the volume.
#[derive(Debug, Clone, Copy)]
#[repr(packed)]
pub struct ExfatBootSector {
    /// Must be 0xEB 0x76 0x90.
    pub(crate) jump_boot: [u8; 3],
    /// Must be "EXFAT   " (three trailing spaces).
    pub(crate) filesystem_name: [u8; 8],
    /// Corresponds to the FAT BPB; must be all zeroes.
    pub(crate) must_be_zero: [u8; 53],
    /// Media-relative sector offset of this volume. 0 means ignore.
    pub(crate) partition_offset: u64,
    /// Total size of the volume in sectors.
    pub(crate) volume_length: u64,
    /// Volume-relative sector offset of the first FAT. Minimum 24.
    pub(crate) fat_offset: u32,
    /// Sectors occupied by each FAT.
    pub(crate) fat_length: u32,
    /// Volume-relative sector offset of the cluster heap.
    pub(crate) cluster_heap_offset: u32,
    /// Number of clusters in the cluster heap.
    pub(crate) cluster_count: u32,
    /// Cluster index of the first cluster of the root directory.
    pub(crate) first_cluster_of_root_directory: u32,
    pub(crate) volume_serial_number: u32,
    /// 0x0100 for revision 1.00.
    pub(crate) file_system_revision: u16,
    /// b0 ActiveFat, b1 VolumeDirty, b2 MediaFailure, b3 ClearToZero.
    pub(crate) volume_flags: u16,
    /// log2 of the sector size; 9..=12.
    pub(crate) bytes_per_sector_shift: u8,
    /// log2 of sectors per cluster; 0..=25-bytes_per_sector_shift.
    pub(crate) sectors_per_cluster_shift: u8,
    /// 1, or 2 for TexFAT (not supported here).
    pub(crate) number_of_fats: u8,
    pub(crate) drive_select: u8,
    /// Percentage of allocated clusters, 0xFF = unknown.
    pub(crate) percent_in_use: u8,
    pub(crate) reserved: [u8; 7],
}

/// Byte offset of volume_flags / percent_in_use inside the boot sector;
/// both are excluded from the boot region checksum.
pub const EXFAT_VOLUME_FLAGS_OFS: usize = 106;
pub const EXFAT_PERCENT_IN_USE_OFS: usize = 112;

/// VolumeDirty bit of volume_flags.
pub const EXFAT_VOLUME_DIRTY: u16 = 0x0002;

impl ExfatBootSector {
    pub fn from_bytes(buf: &[u8]) -> Self {
        unsafe { (buf.as_ptr() as *const ExfatBootSector).read_unaligned() }
    }

    pub fn is_plausible(&self) -> bool {
        let name = self.filesystem_name;
        let zero = self.must_be_zero;
        let bshift = self.bytes_per_sector_shift;
        let cshift = self.sectors_per_cluster_shift;
        let n_fats = self.number_of_fats;
        let rev = self.file_system_revision;
        name == *b"EXFAT   "
            && zero.iter().all(|&b| b == 0)
            && (9..=12).contains(&bshift)
            && cshift <= 25 - bshift
            && n_fats == 1
            && rev >> 8 == 1
    }

    pub fn bytes_per_sector(&self) -> usize {
        1usize << self.bytes_per_sector_shift
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        1u32 << self.sectors_per_cluster_shift
    }
}

/// Fold one sector into the exFAT boot-region checksum. For sector 0 the
/// volume_flags and percent_in_use bytes are skipped so the checksum stays
/// stable across dirty-flag updates.
pub fn exfat_boot_sum(sum: u32, sector: &[u8], first_sector: bool) -> u32 {
    let mut sum = sum;
    for (i, &b) in sector.iter().enumerate() {
        if first_sector
            && (i == EXFAT_VOLUME_FLAGS_OFS
                || i == EXFAT_VOLUME_FLAGS_OFS + 1
                || i == EXFAT_PERCENT_IN_USE_OFS)
        {
            continue;
        }
        sum = (if sum & 1 != 0 { 0x8000_0000u32 } else { 0 })
            .wrapping_add(sum >> 1)
            .wrapping_add(b as u32);
    }
    sum
}

// ---------------------------------------------------------------------------
// Partition tables
// ---------------------------------------------------------------------------

/// MBR layout: partition table at 446, four 16-byte entries, 0xAA55 at 510.
pub const MBR_TABLE: usize = 446;
pub const SZ_PTE: usize = 16;
pub const PTE_SYSTEM: usize = 4;
pub const PTE_ST_LBA: usize = 8;
pub const PTE_SIZ_LBA: usize = 12;

/// GPT header (LBA 1) and entry field offsets.
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_ENT_LBA: usize = 72;
pub const GPT_ENT_COUNT: usize = 80;
pub const GPT_ENT_SIZE: usize = 84;
pub const GPTE_TYPE_GUID: usize = 0;
pub const GPTE_FST_LBA: usize = 32;
pub const GPTE_LST_LBA: usize = 40;

/// Microsoft Basic Data partition type GUID in on-disk byte order.
pub const GUID_MS_BASIC_DATA: [u8; 16] = [
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
];

/// One recognized partition table slot.
#[derive(Debug, Clone, Copy)]
pub struct PartitionEntry {
    pub start_lba: u64,
    pub size: u64,
}

/// Check the boot signature word of a sector image.
pub fn has_boot_signature(buf: &[u8]) -> bool {
    read_le_u16(&buf[510..]) == BOOT_SIGNATURE
}

/// Decode one MBR partition slot (0-based). Empty slots return None.
pub fn mbr_partition(buf: &[u8], slot: usize) -> Option<PartitionEntry> {
    let ofs = MBR_TABLE + SZ_PTE * slot;
    let system = buf[ofs + PTE_SYSTEM];
    let start = read_le_u32(&buf[ofs + PTE_ST_LBA..]) as u64;
    let size = read_le_u32(&buf[ofs + PTE_SIZ_LBA..]) as u64;
    if system == 0 || size == 0 {
        return None;
    }
    Some(PartitionEntry {
        start_lba: start,
        size,
    })
}

/// Is this sector a plausible GPT header?
pub fn is_gpt_header(buf: &[u8]) -> bool {
    buf[..8] == GPT_SIGNATURE[..]
}

/// Decode a GPT entry image; only Basic-Data entries are candidates for a
/// FAT/exFAT volume.
pub fn gpt_partition(entry: &[u8]) -> Option<PartitionEntry> {
    if entry[GPTE_TYPE_GUID..GPTE_TYPE_GUID + 16] != GUID_MS_BASIC_DATA[..] {
        return None;
    }
    let first = read_le_u64(&entry[GPTE_FST_LBA..]);
    let last = read_le_u64(&entry[GPTE_LST_LBA..]);
    if last < first {
        return None;
    }
    Some(PartitionEntry {
        start_lba: first,
        size: last - first + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write_le_u16;

    fn sample_fat16_sector() -> [u8; 512] {
        let mut s = [0u8; 512];
        s[0] = 0xEB;
        s[1] = 0x3C;
        s[2] = 0x90;
        s[3..11].copy_from_slice(b"MSDOS5.0");
        write_le_u16(&mut s[11..], 512); // byts_per_sec
        s[13] = 4; // sec_per_clus
        write_le_u16(&mut s[14..], 1); // rsvd
        s[16] = 2; // num_fats
        write_le_u16(&mut s[17..], 512); // root entries
        write_le_u16(&mut s[19..], 40960); // tot_sec16
        s[21] = 0xF8;
        write_le_u16(&mut s[22..], 40); // fat_sz16
        write_le_u16(&mut s[510..], 0xAA55);
        s
    }

    #[test]
    fn bpb_parses_and_validates() {
        let sector = sample_fat16_sector();
        let bpb = BiosParameterBlock::from_bytes(&sector);
        assert!(bpb.is_plausible());
        assert!(has_boot_signature(&sector));
        assert_eq!(bpb.bytes_per_sector(), 512);
        assert_eq!(bpb.sectors_per_cluster(), 4);
        assert_eq!(bpb.total_sector_cnt(), 40960);
        assert_eq!(bpb.sectors_per_fat(), 40);
        assert_eq!(bpb.root_dir_sector_cnt(), 32);
    }

    #[test]
    fn bad_jump_is_rejected() {
        let mut sector = sample_fat16_sector();
        sector[0] = 0x00;
        assert!(!BiosParameterBlock::from_bytes(&sector).is_plausible());
    }

    #[test]
    fn boot_sum_skips_flag_bytes() {
        let mut sector = [0u8; 512];
        let base = exfat_boot_sum(0, &sector, true);
        sector[EXFAT_VOLUME_FLAGS_OFS] = 0xFF;
        sector[EXFAT_PERCENT_IN_USE_OFS] = 0x55;
        assert_eq!(exfat_boot_sum(0, &sector, true), base);
        assert_ne!(exfat_boot_sum(0, &sector, false), base);
    }

    #[test]
    fn mbr_slot_decoding() {
        let mut sector = [0u8; 512];
        let ofs = MBR_TABLE;
        sector[ofs + PTE_SYSTEM] = 0x0C;
        sector[ofs + PTE_ST_LBA..ofs + PTE_ST_LBA + 4].copy_from_slice(&63u32.to_le_bytes());
        sector[ofs + PTE_SIZ_LBA..ofs + PTE_SIZ_LBA + 4].copy_from_slice(&1000u32.to_le_bytes());
        let p = mbr_partition(&sector, 0).unwrap();
        assert_eq!(p.start_lba, 63);
        assert_eq!(p.size, 1000);
        assert!(mbr_partition(&sector, 1).is_none());
    }
}
