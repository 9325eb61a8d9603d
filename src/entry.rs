//! Directory entry structures: 8.3 short entries, long-name shadow entries,
//! and exFAT entry sets.
//!
//! Special notes about the first byte (DIR_Name[0]) of a FAT directory
//! entry:
//! - 0xE5: the entry is free.
//! - 0x00: the entry is free and no allocated entry follows it; the rest of
//!   the directory does not need to be examined.
//! - 0x05: the actual first character is 0xE5 (valid KANJI lead byte).
//!
//! A set of long entries is always associated with a short entry that they
//! immediately precede, stored in reverse order with the last fragment
//! first. Every member carries the same checksum, computed over the 11
//! bytes of the short name; a mismatch makes the long entries orphans.
//!
//! exFAT replaces all of this with entry sets: one File entry (0x85), one
//! Stream Extension (0xC0) and up to 17 Name entries (0xC1), covered by a
//! 16-bit set checksum and carrying a 16-bit hash of the up-cased name.

use crate::{
    generate_checksum, read_le_u16, read_le_u32, ATTR_DIRECTORY, ATTR_LONG_NAME,
    DIR_ENTRY_LAST_AND_UNUSED, DIR_ENTRY_UNUSED, LAST_LONG_ENTRY, LONG_NAME_LEN, SPACE,
};

/// FAT 32 Byte Directory Entry Structure.
#[derive(Clone, Copy, Debug)]
#[repr(packed)]
pub struct ShortDirEntry {
    /// Short name body, trailing space padded. DIR_Name[0] may not be 0x20;
    /// lower case characters are not allowed.
    name: [u8; 8],
    /// Short name extension, trailing space padded.
    extension: [u8; 3],
    /// Attribute byte; 0x0F marks a long-name entry.
    attr: u8,
    /// NT case hints: 0x08 body is lower case, 0x10 extension is.
    nt_res: u8,
    /// Count of tenths of a second at creation, 0..=199.
    crt_time_tenth: u8,
    /// Creation time, 2-second granularity.
    crt_time: u16,
    crt_date: u16,
    /// Last access date. There is no last access time, only a date.
    lst_acc_date: u16,
    /// High word of the first cluster number (always 0 on FAT12/16).
    fst_clus_hi: u16,
    /// Time of last write. File creation is considered a write.
    wrt_time: u16,
    wrt_date: u16,
    /// Low word of the first cluster number.
    fst_clus_lo: u16,
    /// File size in bytes. Not used and always 0 on a directory; directories
    /// are sized by following their cluster chains to the EOC mark.
    file_size: u32,
}

impl ShortDirEntry {
    pub fn empty() -> Self {
        Self {
            name: [SPACE; 8],
            extension: [SPACE; 3],
            attr: 0,
            nt_res: 0,
            crt_time_tenth: 0,
            crt_time: 0,
            crt_date: 0,
            lst_acc_date: 0,
            fst_clus_hi: 0,
            wrt_time: 0,
            wrt_date: 0,
            fst_clus_lo: 0,
            file_size: 0,
        }
    }

    /// Fresh entry from the 11 padded alias bytes.
    pub fn new(name11: &[u8; 11], attr: u8, cluster: u32) -> Self {
        let mut e = Self::empty();
        e.name.copy_from_slice(&name11[..8]);
        e.extension.copy_from_slice(&name11[8..]);
        e.attr = attr;
        e.set_first_cluster(cluster);
        e
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        unsafe { (buf.as_ptr() as *const ShortDirEntry).read_unaligned() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const ShortDirEntry as *const u8, 32) }
    }

    pub fn to_bytes_array(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(self.as_bytes());
        bytes
    }

    pub fn name_bytes(&self) -> [u8; 11] {
        let mut full = [0u8; 11];
        full[..8].copy_from_slice(&self.name);
        full[8..].copy_from_slice(&self.extension);
        full
    }

    pub fn set_name_bytes(&mut self, name11: &[u8; 11]) {
        self.name.copy_from_slice(&name11[..8]);
        self.extension.copy_from_slice(&name11[8..]);
    }

    /// Checksum over the 11 name bytes, stored in every shadow LFN entry.
    pub fn checksum(&self) -> u8 {
        generate_checksum(&self.name_bytes())
    }

    pub fn first_cluster(&self) -> u32 {
        ((self.fst_clus_hi as u32) << 16) | self.fst_clus_lo as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.fst_clus_hi = (cluster >> 16) as u16;
        self.fst_clus_lo = (cluster & 0xFFFF) as u16;
    }

    pub fn attr(&self) -> u8 {
        self.attr
    }

    pub fn set_attr(&mut self, attr: u8) {
        self.attr = attr;
    }

    pub fn nt_res(&self) -> u8 {
        self.nt_res
    }

    pub fn set_nt_res(&mut self, nt_res: u8) {
        self.nt_res = nt_res;
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn set_file_size(&mut self, file_size: u32) {
        self.file_size = file_size;
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == DIR_ENTRY_UNUSED
    }

    /// Free, and nothing allocated after it.
    pub fn is_end(&self) -> bool {
        self.name[0] == DIR_ENTRY_LAST_AND_UNUSED
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_long(&self) -> bool {
        self.attr & crate::ATTR_MASK == ATTR_LONG_NAME
    }

    pub fn delete(&mut self) {
        self.name[0] = DIR_ENTRY_UNUSED;
    }

    /// Stamp modification time; creation is considered a write, so fresh
    /// entries receive the same value in the creation fields.
    pub fn set_modify_time(&mut self, fattime: u32) {
        self.wrt_date = (fattime >> 16) as u16;
        self.wrt_time = fattime as u16;
        self.lst_acc_date = (fattime >> 16) as u16;
    }

    pub fn set_create_time(&mut self, fattime: u32) {
        self.crt_date = (fattime >> 16) as u16;
        self.crt_time = fattime as u16;
    }

    pub fn modify_time(&self) -> u32 {
        ((self.wrt_date as u32) << 16) | self.wrt_time as u32
    }
}

/// FAT Long Directory Entry.
#[derive(Debug, Clone, Copy)]
#[repr(packed)]
pub struct LongDirEntry {
    /// Sequence number of this entry within its set, or'd with 0x40
    /// (`LAST_LONG_ENTRY`) on the last (first stored) member. 0xE5 when
    /// deleted.
    ord: u8,
    /// Characters 1-5, UTF-16LE. A name ending mid-entry is NUL terminated
    /// and then padded with 0xFFFF.
    name1: [u16; 5],
    /// Must be ATTR_LONG_NAME.
    attr: u8,
    /// Zero: sub-component of a long name.
    ldir_type: u8,
    /// Checksum of the short entry this set shadows.
    chk_sum: u8,
    /// Characters 6-11.
    name2: [u16; 6],
    /// Must be zero for compatibility with disk utilities.
    fst_clus_lo: u16,
    /// Characters 12-13.
    name3: [u16; 2],
}

impl LongDirEntry {
    pub fn empty() -> Self {
        Self {
            ord: 0,
            name1: [0; 5],
            attr: ATTR_LONG_NAME,
            ldir_type: 0,
            chk_sum: 0,
            name2: [0; 6],
            fst_clus_lo: 0,
            name3: [0; 2],
        }
    }

    /// Build one fragment entry. `frag` holds exactly 13 units, already
    /// NUL-terminated / 0xFFFF-padded by the caller.
    pub fn new(order: u8, check_sum: u8, frag: &[u16; 13]) -> Self {
        let mut lde = Self::empty();
        lde.ord = order;
        lde.chk_sum = check_sum;
        unsafe {
            core::ptr::addr_of_mut!(lde.name1)
                .write_unaligned(frag[..5].try_into().unwrap());
            core::ptr::addr_of_mut!(lde.name2)
                .write_unaligned(frag[5..11].try_into().unwrap());
            core::ptr::addr_of_mut!(lde.name3)
                .write_unaligned(frag[11..].try_into().unwrap());
        }
        lde
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        unsafe { (buf.as_ptr() as *const LongDirEntry).read_unaligned() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const LongDirEntry as *const u8, 32) }
    }

    pub fn to_bytes_array(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(self.as_bytes());
        bytes
    }

    /// The 13 stored units, terminator and padding included.
    pub fn fragment(&self) -> [u16; LONG_NAME_LEN] {
        let mut units = [0u16; LONG_NAME_LEN];
        units[..5].copy_from_slice(unsafe { &core::ptr::addr_of!(self.name1).read_unaligned() });
        units[5..11].copy_from_slice(unsafe { &core::ptr::addr_of!(self.name2).read_unaligned() });
        units[11..].copy_from_slice(unsafe { &core::ptr::addr_of!(self.name3).read_unaligned() });
        units
    }

    pub fn order(&self) -> u8 {
        self.ord
    }

    pub fn check_sum(&self) -> u8 {
        self.chk_sum
    }

    pub fn is_last(&self) -> bool {
        self.ord & LAST_LONG_ENTRY != 0
    }

    /// Pack 13 units out of the full name starting at `pos`, with the NUL
    /// terminator / 0xFFFF fill convention.
    pub fn pack_fragment(lfn: &[u16], pos: usize) -> [u16; 13] {
        let mut frag = [0xFFFFu16; 13];
        let mut terminated = false;
        for i in 0..13 {
            if pos + i < lfn.len() {
                frag[i] = lfn[pos + i];
            } else if !terminated {
                frag[i] = 0;
                terminated = true;
            }
        }
        frag
    }
}

// ---------------------------------------------------------------------------
// exFAT entry sets
// ---------------------------------------------------------------------------

/// exFAT directory entry type codes. Clearing bit 7 marks the entry deleted.
pub const ET_BITMAP: u8 = 0x81;
pub const ET_UPCASE: u8 = 0x82;
pub const ET_LABEL: u8 = 0x83;
pub const ET_FILEDIR: u8 = 0x85;
pub const ET_STREAM: u8 = 0xC0;
pub const ET_FILENAME: u8 = 0xC1;

/// Field offsets within an entry set image (File entry at 0, Stream
/// Extension at 32, Name entries from 64).
pub const XDIR_TYPE: usize = 0;
/// Number of secondary entries following the File entry.
pub const XDIR_NUMSEC: usize = 1;
pub const XDIR_SETSUM: usize = 2;
pub const XDIR_ATTR: usize = 4;
pub const XDIR_CRTTIME: usize = 8;
pub const XDIR_MODTIME: usize = 12;
pub const XDIR_ACCTIME: usize = 16;
/// Stream entry general flags: b0 allocation possible, b1 no FAT chain.
pub const XDIR_GENFLAGS: usize = 33;
pub const XDIR_NUMNAME: usize = 35;
pub const XDIR_NAMEHASH: usize = 36;
pub const XDIR_VALIDFILESIZE: usize = 40;
pub const XDIR_FSTCLUS: usize = 52;
pub const XDIR_FILESIZE: usize = 56;

/// Stream-extension flag: the object's clusters are contiguous and not
/// recorded in the FAT.
pub const XDIR_CONTIGUOUS: u8 = 0x02;
pub const XDIR_ALLOC_POSSIBLE: u8 = 0x01;

/// Largest entry set: file + stream + 17 name entries.
pub const MAX_XDIR_ENTRIES: usize = 19;
pub const SZ_XDIR_BUF: usize = MAX_XDIR_ENTRIES * 32;

/// 16-bit checksum over a whole entry set, skipping the checksum field
/// itself (bytes 2 and 3 of the File entry). Same right-rotate-plus-add
/// construction as the LFN checksum, widened to 16 bits.
pub fn xdir_checksum(set: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for (i, &b) in set.iter().enumerate() {
        if i == XDIR_SETSUM || i == XDIR_SETSUM + 1 {
            continue;
        }
        sum = (if sum & 1 != 0 { 0x8000u16 } else { 0 })
            .wrapping_add(sum >> 1)
            .wrapping_add(b as u16);
    }
    sum
}

/// 16-bit hash of an up-cased UTF-16 name, byte at a time, low byte first.
/// The caller folds each unit through the volume's up-case table.
pub fn xname_hash<I: Iterator<Item = u16>>(upcased: I) -> u16 {
    let mut sum: u16 = 0;
    for unit in upcased {
        for b in [unit as u8, (unit >> 8) as u8] {
            sum = (if sum & 1 != 0 { 0x8000u16 } else { 0 })
                .wrapping_add(sum >> 1)
                .wrapping_add(b as u16);
        }
    }
    sum
}

/// 32-bit checksum of the up-case table file contents.
pub fn upcase_checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for &b in data {
        sum = (if sum & 1 != 0 { 0x8000_0000u32 } else { 0 })
            .wrapping_add(sum >> 1)
            .wrapping_add(b as u32);
    }
    sum
}

/// Number of secondary entries an exFAT name of `len` units needs
/// (one stream entry plus name entries of 15 units each).
pub fn xdir_secondary_count(len: usize) -> usize {
    1 + (len + crate::EXFAT_NAME_LEN - 1) / crate::EXFAT_NAME_LEN
}

/// Read the name stored in an entry set image.
pub fn xdir_name(set: &[u8]) -> alloc::vec::Vec<u16> {
    let n = set[XDIR_NUMNAME] as usize;
    let mut name = alloc::vec::Vec::with_capacity(n);
    let mut ofs = 64 + 2; // first name entry, first unit
    while name.len() < n {
        name.push(read_le_u16(&set[ofs..]));
        ofs += 2;
        if ofs % 32 == 0 {
            ofs += 2; // skip the next entry's type and flag bytes
        }
    }
    name
}

/// Write `name` into the Name entries of an entry set image and record its
/// length.
pub fn xdir_put_name(set: &mut [u8], name: &[u16]) {
    set[XDIR_NUMNAME] = name.len() as u8;
    let n_name = (name.len() + crate::EXFAT_NAME_LEN - 1) / crate::EXFAT_NAME_LEN;
    for e in 0..n_name {
        let base = 64 + e * 32;
        set[base] = ET_FILENAME;
        set[base + 1] = 0;
        for i in 0..crate::EXFAT_NAME_LEN {
            let src = e * crate::EXFAT_NAME_LEN + i;
            let unit = if src < name.len() { name[src] } else { 0 };
            crate::write_le_u16(&mut set[base + 2 + i * 2..], unit);
        }
    }
}

pub fn xdir_first_cluster(set: &[u8]) -> u32 {
    read_le_u32(&set[XDIR_FSTCLUS..])
}

pub fn xdir_file_size(set: &[u8]) -> u64 {
    crate::read_le_u64(&set[XDIR_FILESIZE..])
}

pub fn xdir_valid_size(set: &[u8]) -> u64 {
    crate::read_le_u64(&set[XDIR_VALIDFILESIZE..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ATTR_ARCHIVE;

    #[test]
    fn short_entry_round_trip() {
        let mut e = ShortDirEntry::new(b"HELLO   TXT", ATTR_ARCHIVE, 0x12345);
        e.set_file_size(5);
        assert_eq!(e.first_cluster(), 0x12345);
        let bytes = e.to_bytes_array();
        let back = ShortDirEntry::from_bytes(&bytes);
        assert_eq!(back.name_bytes(), *b"HELLO   TXT");
        assert_eq!(back.file_size(), 5);
        assert_eq!(back.first_cluster(), 0x12345);
        assert!(!back.is_dir());
    }

    #[test]
    fn lfn_fragment_padding() {
        let name: alloc::vec::Vec<u16> = "abc".encode_utf16().collect();
        let frag = LongDirEntry::pack_fragment(&name, 0);
        assert_eq!(&frag[..3], &[b'a' as u16, b'b' as u16, b'c' as u16]);
        assert_eq!(frag[3], 0);
        assert!(frag[4..].iter().all(|&u| u == 0xFFFF));

        // exactly 13 units: no terminator, no padding
        let name13: alloc::vec::Vec<u16> = "thirteen.unit".encode_utf16().collect();
        assert_eq!(name13.len(), 13);
        let frag = LongDirEntry::pack_fragment(&name13, 0);
        assert!(frag.iter().all(|&u| u != 0 && u != 0xFFFF));
    }

    #[test]
    fn lfn_entry_round_trip() {
        let frag = LongDirEntry::pack_fragment(&"hello world!!".encode_utf16().collect::<alloc::vec::Vec<u16>>(), 0);
        let lde = LongDirEntry::new(1 | LAST_LONG_ENTRY, 0xA7, &frag);
        let bytes = lde.to_bytes_array();
        assert_eq!(bytes[11], ATTR_LONG_NAME);
        let back = LongDirEntry::from_bytes(&bytes);
        assert!(back.is_last());
        assert_eq!(back.check_sum(), 0xA7);
        assert_eq!(back.fragment(), frag);
    }

    #[test]
    fn xdir_checksum_skips_own_field() {
        let mut set = [0u8; 3 * 32];
        set[XDIR_TYPE] = ET_FILEDIR;
        set[XDIR_NUMSEC] = 2;
        set[32] = ET_STREAM;
        set[64] = ET_FILENAME;
        let sum = xdir_checksum(&set);
        crate::write_le_u16(&mut set[XDIR_SETSUM..], sum);
        assert_eq!(xdir_checksum(&set), sum);
    }

    #[test]
    fn xdir_name_round_trip() {
        let mut set = [0u8; 4 * 32];
        set[XDIR_TYPE] = ET_FILEDIR;
        let name: alloc::vec::Vec<u16> = "a file with a longer name".encode_utf16().collect();
        xdir_put_name(&mut set, &name);
        assert_eq!(set[XDIR_NUMNAME] as usize, name.len());
        assert_eq!(xdir_name(&set), name);
    }

    #[test]
    fn secondary_count() {
        assert_eq!(xdir_secondary_count(1), 2);
        assert_eq!(xdir_secondary_count(15), 2);
        assert_eq!(xdir_secondary_count(16), 3);
        assert_eq!(xdir_secondary_count(255), 18);
    }
}
