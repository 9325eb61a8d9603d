//! Directory engine: entry iteration, lookup, registration and deletion.
//!
//! Layout of one object's entries on a FAT directory, low address first:
//!
//!     lfn(n) .. lfn(2) lfn(1) sfn
//!
//! The long entries are stored in reverse order, each carrying 13 UTF-16
//! units, a sequence ordinal (last fragment or'd with 0x40) and the
//! checksum of the short name they shadow. On exFAT an object is an entry
//! set instead: File entry, Stream Extension, then Name entries, covered
//! by a 16-bit set checksum, with a 16-bit up-cased name hash in the
//! stream entry to cheapen lookups.
//!
//! All sector access goes through the volume window; directory positions
//! are plain byte offsets (`dptr`) paired with the resolved sector so an
//! entry can be re-addressed without re-walking the chain.

use alloc::string::String;
use alloc::vec::Vec;
use log::trace;

use crate::entry::{
    xdir_checksum, xdir_name, xdir_put_name, xname_hash, LongDirEntry, ShortDirEntry, ET_FILEDIR,
    ET_LABEL, ET_STREAM, XDIR_ATTR, XDIR_FILESIZE, XDIR_GENFLAGS, XDIR_MODTIME, XDIR_NAMEHASH,
    XDIR_NUMNAME, XDIR_NUMSEC, XDIR_SETSUM, XDIR_VALIDFILESIZE,
};
use crate::fs::{FatKind, Volume};
use crate::name::{sfn_to_string, to_upper, utf16_to_string, NS_LOSS, NS_NOLFN};
use crate::{
    read_le_u16, read_le_u32, write_le_u16, FsError, FsResult, ATTR_DIRECTORY, ATTR_LONG_NAME,
    ATTR_MASK, ATTR_VOLUME_ID, DIRENT_SIZE, DIR_ENTRY_UNUSED, LAST_LONG_ENTRY, LONG_NAME_LEN,
    MAX_DIR, MAX_DIR_EX,
};

/// Invalid entry-block offset marker.
pub(crate) const BADOFS: u32 = 0xFFFF_FFFF;

/// Cluster-chain shape of an exFAT object. Contiguous objects have no FAT
/// chain at all; their clusters are implicitly sequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStat {
    Unknown,
    Contiguous,
    Fragmented,
}

/// Location of an object's own directory entry (set): the containing
/// directory's start cluster and chain shape, plus the offset of the entry
/// block inside it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryRef {
    pub(crate) dir_sclust: u32,
    pub(crate) dir_stat: ChainStat,
    pub(crate) dir_size: u64,
    pub(crate) blk_ofs: u32,
}

/// An open directory: object identity plus iteration state. Caller-owned;
/// the volume only keeps a sharing-table slot while it is open.
pub struct Dir {
    /// Hosting volume's mount generation.
    pub(crate) id: u16,
    pub(crate) attr: u8,
    /// Start cluster; 0 is the FAT12/16 static root directory.
    pub(crate) sclust: u32,
    /// Directory size in bytes (exFAT; FAT directories are sized by their
    /// chain).
    pub(crate) objsize: u64,
    pub(crate) stat: ChainStat,
    /// Current read offset in bytes.
    pub(crate) dptr: u32,
    /// Cluster holding `dptr`.
    pub(crate) clust: u32,
    /// Sector holding `dptr`; 0 once iteration has terminated.
    pub(crate) sect: u64,
    /// Offset of the entry block (LFN chain or exFAT set) the current
    /// entry belongs to.
    pub(crate) blk_ofs: u32,
    /// SFN scratch: body[8] ext[3] flags[1].
    pub(crate) fn_: [u8; 12],
    /// Entries in the loaded exFAT set.
    pub(crate) n_ent: u8,
    /// This directory's own entry (None for the root).
    pub(crate) eref: Option<EntryRef>,
    /// Glob pattern for findfirst/findnext.
    pub(crate) pat: Option<String>,
    /// Registered in the volume's sharing table.
    pub(crate) locked: bool,
}

impl Dir {
    pub(crate) fn share_key(&self) -> crate::fs::ShareKey {
        (self.sclust as u64 | 1 << 63, 0)
    }
}

/// What readdir/stat hand back for one object.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub fsize: u64,
    /// Modified date, FAT packed form.
    pub fdate: u16,
    /// Modified time, FAT packed form.
    pub ftime: u16,
    pub fattrib: u8,
    /// Primary (long) name.
    pub fname: String,
    /// 8.3 alias; empty on exFAT.
    pub altname: String,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.fattrib & ATTR_DIRECTORY != 0
    }
}

impl Volume {
    // -----------------------------------------------------------------
    // Position management
    // -----------------------------------------------------------------

    fn dir_limit(&self) -> u32 {
        if self.kind == FatKind::Exfat {
            MAX_DIR_EX
        } else {
            MAX_DIR
        }
    }

    /// Next cluster of a directory chain, honoring contiguous exFAT
    /// directories whose extent is bounded by their recorded size.
    fn dir_chain_next(&mut self, dp: &Dir, clust: u32, consumed: u64) -> FsResult<Option<u32>> {
        if self.kind == FatKind::Exfat && dp.stat == ChainStat::Contiguous {
            if consumed >= dp.objsize {
                return Ok(None);
            }
            return Ok(Some(clust + 1));
        }
        self.chain_next(clust)
    }

    /// Set the directory position to the byte offset `ofs`.
    pub(crate) fn dir_sdi(&mut self, dp: &mut Dir, ofs: u32) -> FsResult<()> {
        if ofs >= self.dir_limit() || ofs % DIRENT_SIZE as u32 != 0 {
            return Err(FsError::IntErr);
        }
        dp.dptr = ofs;
        let mut clst = dp.sclust;
        if clst == 0 {
            // static FAT12/16 root
            if ofs as usize >= self.n_rootdir as usize * DIRENT_SIZE {
                return Err(FsError::IntErr);
            }
            dp.sect = self.dirbase + ofs as u64 / self.ssize as u64;
            dp.clust = 0;
            return Ok(());
        }
        let csz = self.cluster_bytes();
        let mut left = ofs as u64;
        let mut consumed = csz;
        while left >= csz {
            clst = self
                .dir_chain_next(dp, clst, consumed)?
                .ok_or(FsError::IntErr)?;
            left -= csz;
            consumed += csz;
        }
        dp.clust = clst;
        dp.sect = self.clst2sect(clst) + left / self.ssize as u64;
        Ok(())
    }

    /// Advance the position by one entry. With `stretch`, a directory that
    /// runs out of chain is grown by one zeroed cluster; without it the
    /// end of the directory surfaces as `NoFile`.
    pub(crate) fn dir_next(&mut self, dp: &mut Dir, stretch: bool) -> FsResult<()> {
        let ofs = dp.dptr + DIRENT_SIZE as u32;
        if dp.sect == 0 || ofs >= self.dir_limit() {
            dp.sect = 0;
            return Err(FsError::NoFile);
        }
        if ofs as u64 % self.ssize as u64 != 0 {
            dp.dptr = ofs;
            return Ok(());
        }

        if dp.sclust == 0 {
            // static root has a fixed entry count and can never stretch
            if ofs as usize >= self.n_rootdir as usize * DIRENT_SIZE {
                dp.sect = 0;
                return Err(if stretch { FsError::Denied } else { FsError::NoFile });
            }
            dp.sect += 1;
            dp.dptr = ofs;
            return Ok(());
        }

        if ofs as u64 % self.cluster_bytes() != 0 {
            dp.sect += 1;
            dp.dptr = ofs;
            return Ok(());
        }

        match self.dir_chain_next(dp, dp.clust, ofs as u64)? {
            Some(next) => {
                dp.clust = next;
                dp.sect = self.clst2sect(next);
            }
            None => {
                if !stretch {
                    dp.sect = 0;
                    return Err(FsError::NoFile);
                }
                let new = self.create_chain(dp.clust)?;
                if new == 0 {
                    dp.sect = 0;
                    return Err(FsError::Denied);
                }
                self.dir_clear(new)?;
                if self.kind == FatKind::Exfat {
                    dp.objsize += self.cluster_bytes();
                    let eref = dp.eref;
                    if let Some(eref) = eref {
                        let objsize = dp.objsize;
                        self.xdir_update_dir_size(eref, objsize)?;
                    }
                }
                dp.clust = new;
                dp.sect = self.clst2sect(new);
            }
        }
        dp.dptr = ofs;
        Ok(())
    }

    /// Zero-fill a fresh directory cluster. The window must not keep a
    /// stale image of any of these sectors.
    pub(crate) fn dir_clear(&mut self, clst: u32) -> FsResult<()> {
        self.sync_window()?;
        let first = self.clst2sect(clst);
        if self.winsect >= first && self.winsect < first + self.csize as u64 {
            self.winsect = 0;
        }
        let zeros = alloc::vec![0u8; self.ssize];
        for s in 0..self.csize as u64 {
            self.device
                .write_sectors(&zeros, first + s, 1)
                .map_err(|_| FsError::DiskErr)?;
        }
        Ok(())
    }

    /// Copy the 32-byte entry at the current position out of the window.
    pub(crate) fn dir_read_entry(&mut self, dp: &Dir) -> FsResult<[u8; 32]> {
        if dp.sect == 0 {
            return Err(FsError::NoFile);
        }
        self.move_window(dp.sect)?;
        let ofs = dp.dptr as usize % self.ssize;
        let mut ent = [0u8; 32];
        ent.copy_from_slice(&self.win[ofs..ofs + 32]);
        Ok(ent)
    }

    /// Write a 32-byte entry image at the current position.
    pub(crate) fn dir_write_entry(&mut self, dp: &Dir, ent: &[u8]) -> FsResult<()> {
        if dp.sect == 0 {
            return Err(FsError::IntErr);
        }
        self.move_window(dp.sect)?;
        let ofs = dp.dptr as usize % self.ssize;
        self.win_write(ofs, &ent[..32]);
        Ok(())
    }

    /// Read-modify-write the short entry at the current position.
    pub(crate) fn dir_update_entry(
        &mut self,
        dp: &Dir,
        f: impl FnOnce(&mut ShortDirEntry),
    ) -> FsResult<()> {
        let bytes = self.dir_read_entry(dp)?;
        let mut sde = ShortDirEntry::from_bytes(&bytes);
        f(&mut sde);
        self.dir_write_entry(dp, sde.as_bytes())
    }

    // -----------------------------------------------------------------
    // exFAT entry sets
    // -----------------------------------------------------------------

    /// Load the entry set starting at the current position into the
    /// volume's set scratch and verify its checksum. Leaves the position
    /// on the last entry of the set, `blk_ofs` on its first.
    pub(crate) fn load_xdir(&mut self, dp: &mut Dir) -> FsResult<()> {
        let first = self.dir_read_entry(dp)?;
        if first[0] != ET_FILEDIR {
            return Err(FsError::IntErr);
        }
        let n_sec = first[XDIR_NUMSEC] as usize;
        if !(1..=18).contains(&n_sec) {
            return Err(FsError::IntErr);
        }
        dp.blk_ofs = dp.dptr;
        self.dirbuf[..32].copy_from_slice(&first);
        for i in 1..=n_sec {
            // a set cut short by the end of the directory is corruption
            self.dir_next(dp, false).map_err(|e| match e {
                FsError::NoFile => FsError::IntErr,
                other => other,
            })?;
            let ent = self.dir_read_entry(dp)?;
            if i == 1 && ent[0] != ET_STREAM {
                return Err(FsError::IntErr);
            }
            self.dirbuf[i * 32..i * 32 + 32].copy_from_slice(&ent);
        }
        dp.n_ent = (n_sec + 1) as u8;
        let stored = read_le_u16(&self.dirbuf[XDIR_SETSUM..]);
        if xdir_checksum(&self.dirbuf[..(n_sec + 1) * 32]) != stored {
            return Err(FsError::IntErr);
        }
        Ok(())
    }

    /// Recompute the set checksum and write the scratch back at `blk_ofs`.
    pub(crate) fn store_xdir(&mut self, dp: &Dir) -> FsResult<()> {
        let n = dp.n_ent as usize;
        let sum = xdir_checksum(&self.dirbuf[..n * 32]);
        write_le_u16(&mut self.dirbuf[XDIR_SETSUM..], sum);
        let mut pos = clone_pos(dp);
        self.dir_sdi(&mut pos, dp.blk_ofs)?;
        for i in 0..n {
            let mut ent = [0u8; 32];
            ent.copy_from_slice(&self.dirbuf[i * 32..i * 32 + 32]);
            self.dir_write_entry(&pos, &ent)?;
            if i + 1 < n {
                self.dir_next(&mut pos, false)?;
            }
        }
        Ok(())
    }

    /// Patch a directory's recorded size in its own entry set after a
    /// stretch. Clobbers the set scratch.
    fn xdir_update_dir_size(&mut self, eref: EntryRef, new_size: u64) -> FsResult<()> {
        let mut host = Dir {
            id: self.id,
            attr: ATTR_DIRECTORY,
            sclust: eref.dir_sclust,
            objsize: eref.dir_size,
            stat: eref.dir_stat,
            dptr: 0,
            clust: eref.dir_sclust,
            sect: 0,
            blk_ofs: BADOFS,
            fn_: [0; 12],
            n_ent: 0,
            eref: None,
            pat: None,
            locked: false,
        };
        self.dir_sdi(&mut host, eref.blk_ofs)?;
        self.load_xdir(&mut host)?;
        crate::write_le_u64(&mut self.dirbuf[XDIR_FILESIZE..], new_size);
        crate::write_le_u64(&mut self.dirbuf[XDIR_VALIDFILESIZE..], new_size);
        self.store_xdir(&host)
    }

    /// Hash of a name folded through the volume's up-case table.
    pub(crate) fn xname_hash_of(&self, name: &[u16]) -> u16 {
        xname_hash(name.iter().map(|&u| self.upch(u)))
    }

    // -----------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------

    /// Position on the next occupied entry at or after the current
    /// position. For FAT this accumulates any LFN chain into the long-name
    /// buffer; for exFAT it loads the whole entry set. `labels` switches
    /// the scan to volume-label entries instead of files.
    pub(crate) fn dir_read(&mut self, dp: &mut Dir, labels: bool) -> FsResult<()> {
        if self.kind == FatKind::Exfat {
            loop {
                let ent = self.dir_read_entry(dp)?;
                let ty = ent[0];
                if ty == 0 {
                    return Err(FsError::NoFile);
                }
                if labels {
                    if ty == ET_LABEL {
                        return Ok(());
                    }
                } else if ty == ET_FILEDIR {
                    return self.load_xdir(dp);
                }
                self.dir_next(dp, false)?;
            }
        }

        let mut ord: u8 = 0xFF;
        let mut sum: u8 = 0;
        dp.blk_ofs = BADOFS;
        loop {
            let ent = self.dir_read_entry(dp)?;
            let b = ent[0];
            if b == 0 {
                return Err(FsError::NoFile);
            }
            let attr = ent[11] & ATTR_MASK;
            if b == DIR_ENTRY_UNUSED {
                ord = 0xFF;
                dp.blk_ofs = BADOFS;
            } else if attr == ATTR_LONG_NAME {
                let lde = LongDirEntry::from_bytes(&ent);
                if lde.is_last() {
                    let n = lde.order() & !LAST_LONG_ENTRY;
                    if (1..=20).contains(&n) {
                        sum = lde.check_sum();
                        dp.blk_ofs = dp.dptr;
                        self.lfnbuf.clear();
                        self.lfnbuf.resize(n as usize * LONG_NAME_LEN, 0xFFFF);
                        let frag = lde.fragment();
                        self.lfnbuf[(n as usize - 1) * LONG_NAME_LEN..].copy_from_slice(&frag);
                        ord = n - 1;
                    } else {
                        ord = 0xFF;
                        dp.blk_ofs = BADOFS;
                    }
                } else if ord != 0xFF
                    && ord >= 1
                    && lde.order() == ord
                    && lde.check_sum() == sum
                {
                    let frag = lde.fragment();
                    self.lfnbuf[(ord as usize - 1) * LONG_NAME_LEN..ord as usize * LONG_NAME_LEN]
                        .copy_from_slice(&frag);
                    ord -= 1;
                } else {
                    ord = 0xFF;
                    dp.blk_ofs = BADOFS;
                }
            } else if labels {
                if attr & ATTR_VOLUME_ID != 0 {
                    return Ok(());
                }
                ord = 0xFF;
            } else if attr & ATTR_VOLUME_ID != 0 || b == b'.' {
                // volume labels and dot entries are invisible to readdir
                ord = 0xFF;
                dp.blk_ofs = BADOFS;
            } else {
                let sde = ShortDirEntry::from_bytes(&ent);
                if ord != 0 || sum != sde.checksum() {
                    // orphaned long entries are ignored
                    dp.blk_ofs = BADOFS;
                }
                if dp.blk_ofs != BADOFS {
                    // trim the 0xFFFF padding and terminator
                    if let Some(end) = self.lfnbuf.iter().position(|&u| u == 0) {
                        self.lfnbuf.truncate(end);
                    } else {
                        while self.lfnbuf.last() == Some(&0xFFFF) {
                            self.lfnbuf.pop();
                        }
                    }
                }
                return Ok(());
            }
            self.dir_next(dp, false)?;
        }
    }

    /// Extract the FileInfo of the entry the position rests on.
    pub(crate) fn get_fileinfo(&mut self, dp: &Dir) -> FsResult<FileInfo> {
        if self.kind == FatKind::Exfat {
            let name = xdir_name(&self.dirbuf);
            let mtime = read_le_u32(&self.dirbuf[XDIR_MODTIME..]);
            return Ok(FileInfo {
                fsize: crate::entry::xdir_file_size(&self.dirbuf),
                fdate: (mtime >> 16) as u16,
                ftime: mtime as u16,
                fattrib: self.dirbuf[XDIR_ATTR],
                fname: utf16_to_string(&name),
                altname: String::new(),
            });
        }
        let ent = self.dir_read_entry(dp)?;
        let sde = ShortDirEntry::from_bytes(&ent);
        let altname = sfn_to_string(&sde.name_bytes(), 0);
        let fname = if dp.blk_ofs != BADOFS {
            utf16_to_string(&self.lfnbuf)
        } else {
            sfn_to_string(&sde.name_bytes(), sde.nt_res())
        };
        Ok(FileInfo {
            fsize: sde.file_size() as u64,
            fdate: (sde.modify_time() >> 16) as u16,
            ftime: sde.modify_time() as u16,
            fattrib: sde.attr(),
            fname,
            altname,
        })
    }

    // -----------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------

    /// Compare the long-name buffer against one LFN entry's fragment,
    /// case-folded. Mirrors the on-disk convention: NUL terminator, then
    /// 0xFFFF fill.
    fn cmp_lfn_fragment(&self, ent: &[u8; 32]) -> bool {
        if read_le_u16(&ent[26..]) != 0 {
            return false;
        }
        let lde = LongDirEntry::from_bytes(ent);
        let ord = (lde.order() & !LAST_LONG_ENTRY) as usize;
        if ord == 0 {
            return false;
        }
        let mut i = (ord - 1) * LONG_NAME_LEN;
        let frag = lde.fragment();
        let mut prev: u16 = 1;
        for &uc in frag.iter() {
            if prev != 0 {
                let want = if i < self.lfnbuf.len() {
                    self.lfnbuf[i]
                } else {
                    0
                };
                if to_upper(uc) != to_upper(want) {
                    return false;
                }
                i += 1;
                prev = uc;
            } else if uc != 0xFFFF {
                return false;
            }
        }
        if lde.is_last() && prev != 0 && i < self.lfnbuf.len() {
            // fragment matched but the name keeps going
            return false;
        }
        true
    }

    /// Find the object whose name is staged in the long-name buffer and
    /// SFN scratch. On success the position rests on the short entry
    /// (FAT) or the entry set (exFAT).
    pub(crate) fn dir_find(&mut self, dp: &mut Dir) -> FsResult<()> {
        self.dir_sdi(dp, 0)?;

        if self.kind == FatKind::Exfat {
            let target: Vec<u16> = self.lfnbuf.clone();
            let hash = self.xname_hash_of(&target);
            loop {
                self.dir_read(dp, false)?;
                if read_le_u16(&self.dirbuf[XDIR_NAMEHASH..]) == hash {
                    let name = xdir_name(&self.dirbuf);
                    if name.len() == target.len()
                        && name
                            .iter()
                            .zip(target.iter())
                            .all(|(&a, &b)| self.upch(a) == self.upch(b))
                    {
                        return Ok(());
                    }
                }
                self.dir_next(dp, false)?;
            }
        }

        let mut ord: u8 = 0xFF;
        let mut sum: u8 = 0xFF;
        dp.blk_ofs = BADOFS;
        let n_frag = ((self.lfnbuf.len() + LONG_NAME_LEN - 1) / LONG_NAME_LEN) as u8;
        let use_lfn = !self.lfnbuf.is_empty() && dp.fn_[11] & NS_NOLFN == 0;
        loop {
            let ent = self.dir_read_entry(dp)?;
            let b = ent[0];
            if b == 0 {
                return Err(FsError::NoFile);
            }
            let attr = ent[11] & ATTR_MASK;
            if b == DIR_ENTRY_UNUSED || (attr & ATTR_VOLUME_ID != 0 && attr != ATTR_LONG_NAME) {
                ord = 0xFF;
                dp.blk_ofs = BADOFS;
            } else if attr == ATTR_LONG_NAME {
                if use_lfn {
                    let lde = LongDirEntry::from_bytes(&ent);
                    if lde.is_last() {
                        sum = lde.check_sum();
                        let n = lde.order() & !LAST_LONG_ENTRY;
                        ord = if n >= 1 && n == n_frag && self.cmp_lfn_fragment(&ent) {
                            dp.blk_ofs = dp.dptr;
                            n - 1
                        } else {
                            0xFF
                        };
                    } else {
                        ord = if ord != 0xFF
                            && ord >= 1
                            && lde.order() == ord
                            && lde.check_sum() == sum
                            && self.cmp_lfn_fragment(&ent)
                        {
                            ord - 1
                        } else {
                            0xFF
                        };
                    }
                }
            } else {
                let sde = ShortDirEntry::from_bytes(&ent);
                if ord == 0 && sum == sde.checksum() {
                    return Ok(()); // long name matched
                }
                if dp.fn_[11] & NS_LOSS == 0 || dp.fn_[11] & NS_NOLFN != 0 {
                    if ent[..11] == dp.fn_[..11] {
                        return Ok(()); // short name matched
                    }
                }
                ord = 0xFF;
                dp.blk_ofs = BADOFS;
            }
            self.dir_next(dp, false)?;
        }
    }

    // -----------------------------------------------------------------
    // Registration and removal
    // -----------------------------------------------------------------

    /// Reserve `n_ent` contiguous free entries, stretching the directory
    /// as needed. Returns the byte offset of the first reserved entry.
    fn dir_alloc(&mut self, dp: &mut Dir, n_ent: usize) -> FsResult<u32> {
        self.dir_sdi(dp, 0)?;
        let mut run = 0usize;
        let mut base = 0u32;
        loop {
            let ent = self.dir_read_entry(dp)?;
            let b = ent[0];
            if b == DIR_ENTRY_UNUSED || b == 0 {
                if run == 0 {
                    base = dp.dptr;
                }
                run += 1;
                if run == n_ent {
                    return Ok(base);
                }
            } else {
                run = 0;
            }
            match self.dir_next(dp, true) {
                Ok(()) => {}
                Err(FsError::NoFile) => return Err(FsError::Denied),
                Err(e) => return Err(e),
            }
        }
    }

    /// Create the directory entries for the name staged in the long-name
    /// buffer / SFN scratch. On return the position rests on the short
    /// entry (FAT) or the set start (exFAT); the entry is zeroed except
    /// for name material, so the caller fills cluster, attribute, size
    /// and timestamps afterwards.
    pub(crate) fn dir_register(&mut self, dp: &mut Dir) -> FsResult<()> {
        if self.kind == FatKind::Exfat {
            return self.dir_register_ex(dp);
        }

        let flags = dp.fn_[11];
        let mut sfn = [0u8; 11];
        sfn.copy_from_slice(&dp.fn_[..11]);

        if flags & NS_LOSS != 0 {
            // numbered alias; probe until it no longer collides
            let base_sfn = sfn;
            let lfn: Vec<u16> = self.lfnbuf.clone();
            dp.fn_[11] = NS_NOLFN;
            let mut n = 1u32;
            loop {
                crate::name::gen_numname(&mut sfn, &base_sfn, &lfn, n);
                dp.fn_[..11].copy_from_slice(&sfn);
                match self.dir_find(dp) {
                    Ok(()) => {}
                    Err(FsError::NoFile) => break,
                    Err(e) => {
                        dp.fn_[11] = flags;
                        return Err(e);
                    }
                }
                n += 1;
                if n > 999_999 {
                    dp.fn_[11] = flags;
                    return Err(FsError::Denied);
                }
            }
            dp.fn_[11] = flags;
        }

        let n_ent = if flags & crate::name::NS_LFN != 0 {
            (self.lfnbuf.len() + LONG_NAME_LEN - 1) / LONG_NAME_LEN + 1
        } else {
            1
        };
        let base = self.dir_alloc(dp, n_ent)?;

        if n_ent > 1 {
            // shadow entries first, highest fragment first
            let sde_probe = ShortDirEntry::new(&sfn, 0, 0);
            let sum = sde_probe.checksum();
            let lfn: Vec<u16> = self.lfnbuf.clone();
            let n_lfn = n_ent - 1;
            self.dir_sdi(dp, base)?;
            for k in 0..n_lfn {
                let frag_no = n_lfn - k; // 1-based fragment index
                let mut ordv = frag_no as u8;
                if k == 0 {
                    ordv |= LAST_LONG_ENTRY;
                }
                let frag = LongDirEntry::pack_fragment(&lfn, (frag_no - 1) * LONG_NAME_LEN);
                let lde = LongDirEntry::new(ordv, sum, &frag);
                self.dir_write_entry(dp, lde.as_bytes())?;
                self.dir_next(dp, false)?;
            }
        } else {
            self.dir_sdi(dp, base)?;
        }

        // the short entry itself
        let mut sde = ShortDirEntry::new(&sfn, 0, 0);
        sde.set_nt_res(flags & (crate::name::NS_BODY | crate::name::NS_EXT));
        self.dir_write_entry(dp, sde.as_bytes())?;
        dp.blk_ofs = if n_ent > 1 { base } else { BADOFS };
        trace!("registered entry at dptr {}", dp.dptr);
        Ok(())
    }

    /// exFAT registration: build a fresh entry set in the scratch and
    /// store it over a reserved run.
    fn dir_register_ex(&mut self, dp: &mut Dir) -> FsResult<()> {
        let name: Vec<u16> = self.lfnbuf.clone();
        let n_sec = crate::entry::xdir_secondary_count(name.len());
        let n_ent = 1 + n_sec;
        let base = self.dir_alloc(dp, n_ent)?;

        self.dirbuf[..crate::entry::SZ_XDIR_BUF].fill(0);
        self.dirbuf[0] = ET_FILEDIR;
        self.dirbuf[XDIR_NUMSEC] = n_sec as u8;
        self.dirbuf[32] = ET_STREAM;
        self.dirbuf[XDIR_GENFLAGS] = crate::entry::XDIR_ALLOC_POSSIBLE;
        let hash = self.xname_hash_of(&name);
        write_le_u16(&mut self.dirbuf[XDIR_NAMEHASH..], hash);
        xdir_put_name(&mut self.dirbuf, &name);
        debug_assert_eq!(self.dirbuf[XDIR_NUMNAME] as usize, name.len());

        dp.blk_ofs = base;
        dp.n_ent = n_ent as u8;
        self.dir_sdi(dp, base)?;
        self.store_xdir(&Dir {
            blk_ofs: base,
            n_ent: n_ent as u8,
            ..clone_pos(dp)
        })?;
        Ok(())
    }

    /// Mark the entry block at the current position deleted: 0xE5 over the
    /// short entry and each shadow entry, or the in-use bit cleared on
    /// every entry of an exFAT set.
    pub(crate) fn dir_remove(&mut self, dp: &mut Dir) -> FsResult<()> {
        if self.kind == FatKind::Exfat {
            let n = dp.n_ent as usize;
            let mut pos = clone_pos(dp);
            self.dir_sdi(&mut pos, dp.blk_ofs)?;
            for i in 0..n {
                let mut ent = self.dir_read_entry(&pos)?;
                ent[0] &= 0x7F;
                self.dir_write_entry(&pos, &ent)?;
                if i + 1 < n {
                    self.dir_next(&mut pos, false)?;
                }
            }
            return Ok(());
        }

        let last = dp.dptr;
        let start = if dp.blk_ofs != BADOFS { dp.blk_ofs } else { last };
        let mut pos = clone_pos(dp);
        self.dir_sdi(&mut pos, start)?;
        loop {
            let mut ent = self.dir_read_entry(&pos)?;
            ent[0] = DIR_ENTRY_UNUSED;
            self.dir_write_entry(&pos, &ent)?;
            if pos.dptr >= last {
                break;
            }
            self.dir_next(&mut pos, false)?;
        }
        Ok(())
    }
}

/// Copy of a Dir's identity and position, without pattern/lock baggage.
pub(crate) fn clone_pos(dp: &Dir) -> Dir {
    Dir {
        id: dp.id,
        attr: dp.attr,
        sclust: dp.sclust,
        objsize: dp.objsize,
        stat: dp.stat,
        dptr: dp.dptr,
        clust: dp.clust,
        sect: dp.sect,
        blk_ofs: dp.blk_ofs,
        fn_: dp.fn_,
        n_ent: dp.n_ent,
        eref: dp.eref,
        pat: None,
        locked: false,
    }
}

impl Volume {
    // -----------------------------------------------------------------
    // Public directory interface
    // -----------------------------------------------------------------

    /// Open a directory by path.
    pub fn opendir(&mut self, path: &str) -> FsResult<Dir> {
        let mut dir = self.follow_path_to_dir(path)?;
        let key = dir.share_key();
        self.chk_share(key, false)?;
        self.inc_share(key, false)?;
        dir.locked = true;
        self.dir_sdi(&mut dir, 0)?;
        Ok(dir)
    }

    /// Release a directory object's sharing slot.
    pub fn closedir(&mut self, dir: &mut Dir) -> FsResult<()> {
        self.validate_obj(dir.id)?;
        if dir.locked {
            self.dec_share(dir.share_key());
            dir.locked = false;
        }
        dir.sect = 0;
        Ok(())
    }

    /// Read the next entry; `None` at the end of the directory.
    pub fn readdir(&mut self, dir: &mut Dir) -> FsResult<Option<FileInfo>> {
        self.validate_obj(dir.id)?;
        if dir.sect == 0 {
            return Ok(None);
        }
        match self.dir_read(dir, false) {
            Ok(()) => {
                let info = self.get_fileinfo(dir)?;
                // step past the consumed entry (or set)
                match self.dir_next(dir, false) {
                    Ok(()) | Err(FsError::NoFile) => {}
                    Err(e) => return Err(e),
                }
                Ok(Some(info))
            }
            Err(FsError::NoFile) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Rewind the iteration to the first entry.
    pub fn rewinddir(&mut self, dir: &mut Dir) -> FsResult<()> {
        self.validate_obj(dir.id)?;
        self.dir_sdi(dir, 0)
    }

    /// Open a directory and return the first entry matching `pattern`.
    pub fn findfirst(
        &mut self,
        path: &str,
        pattern: &str,
    ) -> FsResult<(Dir, Option<FileInfo>)> {
        let mut dir = self.opendir(path)?;
        dir.pat = Some(String::from(pattern));
        match self.findnext(&mut dir) {
            Ok(info) => Ok((dir, info)),
            Err(e) => {
                let _ = self.closedir(&mut dir);
                Err(e)
            }
        }
    }

    /// Next entry matching the pattern set by `findfirst`.
    pub fn findnext(&mut self, dir: &mut Dir) -> FsResult<Option<FileInfo>> {
        let pat = match dir.pat.clone() {
            Some(p) => p,
            None => return Err(FsError::InvalidObject),
        };
        loop {
            match self.readdir(dir)? {
                None => return Ok(None),
                Some(info) => {
                    if crate::path::pattern_match(&pat, &info.fname, 0, 4)
                        || (!info.altname.is_empty()
                            && crate::path::pattern_match(&pat, &info.altname, 0, 4))
                    {
                        return Ok(Some(info));
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Volume label
    // -----------------------------------------------------------------

    /// Volume label and serial number. An unlabeled volume yields an
    /// empty string.
    pub fn getlabel(&mut self) -> FsResult<(String, u32)> {
        let serial = {
            self.move_window(self.volbase)?;
            match self.kind {
                FatKind::Fat32 => read_le_u32(&self.win[67..]),
                FatKind::Exfat => read_le_u32(&self.win[100..]),
                _ => read_le_u32(&self.win[39..]),
            }
        };
        let mut dir = self.root_dir_obj();
        self.dir_sdi(&mut dir, 0)?;
        let label = match self.dir_read(&mut dir, true) {
            Ok(()) => {
                let ent = self.dir_read_entry(&dir)?;
                if self.kind == FatKind::Exfat {
                    let n = (ent[1] as usize).min(11);
                    let mut units = [0u16; 11];
                    for i in 0..n {
                        units[i] = read_le_u16(&ent[2 + i * 2..]);
                    }
                    utf16_to_string(&units[..n])
                } else {
                    let cp = crate::name::codepage();
                    let mut s = String::new();
                    for &b in ent[..11].iter() {
                        s.push(char::from_u32(cp.to_unicode(b) as u32).unwrap_or('_'));
                    }
                    String::from(s.trim_end())
                }
            }
            Err(FsError::NoFile) => String::new(),
            Err(e) => return Err(e),
        };
        Ok((label, serial))
    }

    /// Write, replace or (with an empty string) remove the volume label.
    pub fn setlabel(&mut self, label: &str) -> FsResult<()> {
        self.check_writable()?;
        let mut dir = self.root_dir_obj();
        self.dir_sdi(&mut dir, 0)?;
        let existing = match self.dir_read(&mut dir, true) {
            Ok(()) => true,
            Err(FsError::NoFile) => false,
            Err(e) => return Err(e),
        };

        if self.kind == FatKind::Exfat {
            let units: Vec<u16> = label.encode_utf16().collect();
            if units.len() > 11 {
                return Err(FsError::InvalidName);
            }
            let mut ent = [0u8; 32];
            ent[0] = ET_LABEL;
            ent[1] = units.len() as u8;
            for (i, &u) in units.iter().enumerate() {
                write_le_u16(&mut ent[2 + i * 2..], u);
            }
            if units.is_empty() {
                ent[0] = ET_LABEL & 0x7F;
            }
            if existing {
                self.dir_write_entry(&dir, &ent)?;
            } else if !units.is_empty() {
                let base = self.dir_alloc(&mut dir, 1)?;
                self.dir_sdi(&mut dir, base)?;
                self.dir_write_entry(&dir, &ent)?;
            }
            return self.sync_fs();
        }

        // FAT: label is an 11-byte OEM name with the volume attribute
        let cp = crate::name::codepage();
        let mut name11 = [crate::SPACE; 11];
        let mut n = 0usize;
        for ch in label.chars() {
            let unit = to_upper(ch as u16);
            let oem = cp
                .from_unicode(unit)
                .filter(|&o| crate::name::sfn_char_ok(o) || o == crate::SPACE)
                .ok_or(FsError::InvalidName)?;
            if n >= 11 {
                return Err(FsError::InvalidName);
            }
            name11[n] = oem;
            n += 1;
        }
        if n > 0 && name11[0] == crate::SPACE {
            return Err(FsError::InvalidName);
        }

        if existing {
            if n == 0 {
                let mut ent = self.dir_read_entry(&dir)?;
                ent[0] = DIR_ENTRY_UNUSED;
                self.dir_write_entry(&dir, &ent)?;
            } else {
                let mut ent = [0u8; 32];
                ent[..11].copy_from_slice(&name11);
                ent[11] = ATTR_VOLUME_ID;
                let now = self.clock.now();
                write_le_u16(&mut ent[22..], now as u16);
                write_le_u16(&mut ent[24..], (now >> 16) as u16);
                self.dir_write_entry(&dir, &ent)?;
            }
        } else if n > 0 {
            let base = self.dir_alloc(&mut dir, 1)?;
            self.dir_sdi(&mut dir, base)?;
            let mut ent = [0u8; 32];
            ent[..11].copy_from_slice(&name11);
            ent[11] = ATTR_VOLUME_ID;
            let now = self.clock.now();
            write_le_u16(&mut ent[22..], now as u16);
            write_le_u16(&mut ent[24..], (now >> 16) as u16);
            self.dir_write_entry(&dir, &ent)?;
        }
        self.sync_fs()
    }

    /// A Dir object standing on the root directory.
    pub(crate) fn root_dir_obj(&self) -> Dir {
        let sclust = match self.kind {
            FatKind::Fat32 | FatKind::Exfat => self.dirbase as u32,
            _ => 0,
        };
        Dir {
            id: self.id,
            attr: ATTR_DIRECTORY,
            sclust,
            objsize: 0,
            stat: ChainStat::Fragmented,
            dptr: 0,
            clust: sclust,
            sect: 0,
            blk_ofs: BADOFS,
            fn_: [0; 12],
            n_ent: 0,
            eref: None,
            pat: None,
            locked: false,
        }
    }
}
