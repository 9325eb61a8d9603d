//! Path resolution and namespace operations.
//!
//! A path is UTF-8 text: an optional `"<digit>:"` drive prefix, `/` or `\`
//! separators (leading one makes the path absolute, otherwise resolution
//! starts at the current directory), components validated by the name
//! codec. The resolver walks one directory lookup per component and leaves
//! the returned object positioned on the terminal entry; a missing
//! terminal component is reported separately from a missing intermediate
//! one so creation paths can reuse the staged name.
//!
//! Dot and dot-dot are resolved through the real dot entries on FAT
//! volumes. exFAT directories carry no dot entries, so those paths are
//! folded textually against the current-directory text instead.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::vec::Vec;

use crate::dir::{clone_pos, ChainStat, Dir, EntryRef, FileInfo, BADOFS};
use crate::entry::{
    xdir_file_size, xdir_first_cluster, ShortDirEntry, XDIR_ATTR, XDIR_GENFLAGS, XDIR_MODTIME,
    XDIR_CONTIGUOUS,
};
use crate::fs::{FatKind, ShareKey, Volume};
use crate::name::{component_to_utf16, make_sfn, to_upper, NS_DOT, NS_LAST, NS_NONAME};
use crate::{
    FsError, FsResult, ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_HIDDEN, ATTR_READ_ONLY, ATTR_SYSTEM,
    DIRENT_SIZE, SPACE,
};

/// Outcome of walking a full path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// Terminal entry found; the Dir rests on it.
    Found,
    /// Every intermediate resolved but the terminal entry does not exist;
    /// its name is staged for registration.
    Missing,
    /// The path names the root directory itself.
    Root,
}

fn is_sep(c: u8) -> bool {
    c == b'/' || c == b'\\'
}

impl Volume {
    /// Strip and validate the optional drive prefix. Only logical drive 0
    /// is bound in this single-volume configuration.
    fn strip_drive<'a>(&self, path: &'a str) -> FsResult<&'a str> {
        let b = path.as_bytes();
        if b.len() >= 2 && b[1] == b':' {
            if !b[0].is_ascii_digit() {
                return Err(FsError::InvalidDrive);
            }
            if b[0] != b'0' {
                return Err(FsError::InvalidDrive);
            }
            return Ok(&path[2..]);
        }
        Ok(path)
    }

    /// Stage the next component of `path` into the SFN scratch and the
    /// long-name buffer, returning the unconsumed remainder.
    fn create_name<'a>(&mut self, dp: &mut Dir, path: &'a str) -> FsResult<&'a str> {
        let b = path.as_bytes();
        let end = b.iter().position(|&c| is_sep(c)).unwrap_or(b.len());
        let comp = &path[..end];
        let mut rest = &path[end..];
        while !rest.is_empty() && is_sep(rest.as_bytes()[0]) {
            rest = &rest[1..];
        }
        let last = rest.is_empty();
        let last_flag = if last { NS_LAST } else { 0 };

        if comp == "." || comp == ".." {
            let mut f = [SPACE; 11];
            f[0] = b'.';
            if comp == ".." {
                f[1] = b'.';
            }
            dp.fn_[..11].copy_from_slice(&f);
            dp.fn_[11] = NS_DOT | last_flag;
            self.lfnbuf.clear();
            return Ok(rest);
        }

        let units = component_to_utf16(comp)?;
        if self.kind == FatKind::Exfat {
            self.lfnbuf.clear();
            self.lfnbuf.extend_from_slice(&units);
            dp.fn_[11] = last_flag;
        } else {
            let (sfn, cf) = make_sfn(&units)?;
            self.lfnbuf.clear();
            self.lfnbuf.extend_from_slice(&units);
            dp.fn_[..11].copy_from_slice(&sfn);
            dp.fn_[11] = cf | last_flag;
        }
        Ok(rest)
    }

    /// Fold `.` and `..` components of `path` against `base` (an absolute
    /// canonical path). Used for exFAT where no dot entries exist on disk.
    fn canonicalize(base: &str, path: &str) -> FsResult<String> {
        let absolute = path.as_bytes().first().map_or(false, |&c| is_sep(c));
        let mut segs: Vec<&str> = if absolute {
            Vec::new()
        } else {
            base.split(|c| c == '/' || c == '\\')
                .filter(|s| !s.is_empty())
                .collect()
        };
        for comp in path.split(|c| c == '/' || c == '\\') {
            match comp {
                "" | "." => {}
                ".." => {
                    if segs.pop().is_none() {
                        return Err(FsError::NoPath);
                    }
                }
                c => segs.push(c),
            }
        }
        let mut out = String::from("/");
        out.push_str(&segs.join("/"));
        Ok(out)
    }

    /// Walk `path` from the root or the current directory. On return the
    /// Dir is the containing directory positioned at the terminal entry
    /// (`Found`), at a staged-but-absent terminal name (`Missing`), or
    /// stands for the root itself (`Root`).
    pub(crate) fn follow_path(&mut self, path: &str) -> FsResult<(Dir, Lookup)> {
        let path = self.strip_drive(path)?;

        // exFAT has no on-disk dot entries to look up; fold them away and
        // walk from the root
        let folded: String;
        let mut path = path;
        if self.kind == FatKind::Exfat {
            let has_dots = path
                .split(|c| c == '/' || c == '\\')
                .any(|c| c == "." || c == "..");
            let relative = !path.as_bytes().first().map_or(false, |&c| is_sep(c));
            if has_dots || (relative && self.cdir != 0) {
                folded = Self::canonicalize(&self.cwd.clone(), path)?;
                path = &folded;
            }
        }

        let absolute = path.as_bytes().first().map_or(false, |&c| is_sep(c));
        let mut rest = path;
        while !rest.is_empty() && is_sep(rest.as_bytes()[0]) {
            rest = &rest[1..];
        }

        let mut dp = if absolute || self.cdir == 0 {
            self.root_dir_obj()
        } else {
            let mut d = self.root_dir_obj();
            d.sclust = self.cdir;
            d.clust = self.cdir;
            d
        };

        if rest.is_empty() {
            dp.fn_[11] = NS_NONAME;
            return Ok((dp, Lookup::Root));
        }

        loop {
            rest = self.create_name(&mut dp, rest)?;
            let last = dp.fn_[11] & NS_LAST != 0;
            match self.dir_find(&mut dp) {
                Ok(()) => {}
                Err(FsError::NoFile) => {
                    return if last {
                        Ok((dp, Lookup::Missing))
                    } else {
                        Err(FsError::NoPath)
                    };
                }
                Err(e) => return Err(e),
            }
            if last {
                return Ok((dp, Lookup::Found));
            }
            self.descend(&mut dp)?;
        }
    }

    /// Move the walker into the directory whose entry it rests on.
    fn descend(&mut self, dp: &mut Dir) -> FsResult<()> {
        if self.kind == FatKind::Exfat {
            let attr = self.dirbuf[XDIR_ATTR];
            if attr & ATTR_DIRECTORY == 0 {
                return Err(FsError::NoPath);
            }
            let eref = EntryRef {
                dir_sclust: dp.sclust,
                dir_stat: dp.stat,
                dir_size: dp.objsize,
                blk_ofs: dp.blk_ofs,
            };
            dp.attr = attr;
            dp.sclust = xdir_first_cluster(&self.dirbuf);
            dp.objsize = xdir_file_size(&self.dirbuf);
            dp.stat = if self.dirbuf[XDIR_GENFLAGS] & XDIR_CONTIGUOUS != 0 {
                ChainStat::Contiguous
            } else {
                ChainStat::Fragmented
            };
            dp.eref = Some(eref);
            if dp.sclust < 2 {
                return Err(FsError::IntErr);
            }
            return Ok(());
        }

        let ent = self.dir_read_entry(dp)?;
        let sde = ShortDirEntry::from_bytes(&ent);
        if !sde.is_dir() {
            return Err(FsError::NoPath);
        }
        let clu = sde.first_cluster();
        let eref = EntryRef {
            dir_sclust: dp.sclust,
            dir_stat: dp.stat,
            dir_size: dp.objsize,
            blk_ofs: if dp.blk_ofs != BADOFS {
                dp.blk_ofs
            } else {
                dp.dptr
            },
        };
        dp.attr = sde.attr();
        if clu == 0 {
            // a dot-dot entry pointing back at the root
            let root = self.root_dir_obj();
            dp.sclust = root.sclust;
            dp.eref = None;
        } else {
            dp.sclust = clu;
            dp.eref = Some(eref);
        }
        dp.objsize = 0;
        dp.stat = ChainStat::Fragmented;
        Ok(())
    }

    /// Sharing-table key of the entry the walker rests on.
    pub(crate) fn entry_share_key(&self, dp: &Dir) -> ShareKey {
        if self.kind == FatKind::Exfat {
            (dp.sclust as u64, dp.blk_ofs)
        } else {
            (dp.sclust as u64, dp.dptr)
        }
    }

    /// Open a directory object for `path` (root included).
    pub(crate) fn follow_path_to_dir(&mut self, path: &str) -> FsResult<Dir> {
        let (mut dp, lk) = self.follow_path(path)?;
        match lk {
            Lookup::Root => Ok(dp),
            Lookup::Missing => Err(FsError::NoPath),
            Lookup::Found => {
                self.descend(&mut dp)?;
                Ok(dp)
            }
        }
    }

    // -----------------------------------------------------------------
    // Namespace operations
    // -----------------------------------------------------------------

    /// File or directory status.
    pub fn stat(&mut self, path: &str) -> FsResult<FileInfo> {
        let (mut dp, lk) = self.follow_path(path)?;
        match lk {
            Lookup::Root => Err(FsError::InvalidName),
            Lookup::Missing => Err(FsError::NoFile),
            Lookup::Found => {
                if self.kind != FatKind::Exfat && dp.blk_ofs != BADOFS {
                    // refill the name buffer with the on-disk long name
                    // (lookup left the search pattern in it)
                    let at = dp.blk_ofs;
                    self.dir_sdi(&mut dp, at)?;
                    self.dir_read(&mut dp, false)?;
                }
                self.get_fileinfo(&dp)
            }
        }
    }

    /// Create a directory.
    pub fn mkdir(&mut self, path: &str) -> FsResult<()> {
        self.check_writable()?;
        let (mut dp, lk) = self.follow_path(path)?;
        match lk {
            Lookup::Root => return Err(FsError::InvalidName),
            Lookup::Found => return Err(FsError::Exist),
            Lookup::Missing => {}
        }
        if dp.fn_[11] & NS_DOT != 0 {
            return Err(FsError::InvalidName);
        }
        self.set_dirty()?;

        let dclu = self.create_chain(0)?;
        if dclu == 0 {
            return Err(FsError::Denied);
        }
        self.dir_clear(dclu)?;

        let now = self.clock.now();
        if self.kind == FatKind::Exfat {
            self.dir_register(&mut dp)?;
            self.dirbuf[XDIR_ATTR] = ATTR_DIRECTORY;
            crate::write_le_u32(&mut self.dirbuf[crate::entry::XDIR_CRTTIME..], now);
            crate::write_le_u32(&mut self.dirbuf[XDIR_MODTIME..], now);
            crate::write_le_u32(&mut self.dirbuf[crate::entry::XDIR_FSTCLUS..], dclu);
            let csz = self.cluster_bytes();
            crate::write_le_u64(&mut self.dirbuf[crate::entry::XDIR_FILESIZE..], csz);
            crate::write_le_u64(&mut self.dirbuf[crate::entry::XDIR_VALIDFILESIZE..], csz);
            self.store_xdir(&clone_pos(&dp))?;
        } else {
            // dot entries first so the directory is well formed on disk
            // before it becomes reachable
            let parent_clu = {
                let root = self.root_dir_obj();
                if dp.sclust == root.sclust {
                    0
                } else {
                    dp.sclust
                }
            };
            let sect = self.clst2sect(dclu);
            self.move_window(sect)?;
            let mut dot = ShortDirEntry::new(b".          ", ATTR_DIRECTORY, dclu);
            dot.set_create_time(now);
            dot.set_modify_time(now);
            let mut dotdot = ShortDirEntry::new(b"..         ", ATTR_DIRECTORY, parent_clu);
            dotdot.set_create_time(now);
            dotdot.set_modify_time(now);
            let dot_bytes = dot.to_bytes_array();
            let dotdot_bytes = dotdot.to_bytes_array();
            self.win_write(0, &dot_bytes);
            self.win_write(DIRENT_SIZE, &dotdot_bytes);

            self.dir_register(&mut dp)?;
            self.dir_update_entry(&dp, |sde| {
                sde.set_attr(ATTR_DIRECTORY);
                sde.set_first_cluster(dclu);
                sde.set_create_time(now);
                sde.set_modify_time(now);
            })?;
        }
        self.sync_fs()
    }

    /// Remove a file or an empty directory.
    pub fn unlink(&mut self, path: &str) -> FsResult<()> {
        self.check_writable()?;
        let (mut dp, lk) = self.follow_path(path)?;
        match lk {
            Lookup::Root => return Err(FsError::InvalidName),
            Lookup::Missing => return Err(FsError::NoFile),
            Lookup::Found => {}
        }
        if dp.fn_[11] & NS_DOT != 0 {
            return Err(FsError::InvalidName);
        }
        if self.is_shared(self.entry_share_key(&dp)) {
            return Err(FsError::Locked);
        }

        let (attr, sclu, objsize, contiguous) = if self.kind == FatKind::Exfat {
            (
                self.dirbuf[XDIR_ATTR],
                xdir_first_cluster(&self.dirbuf),
                xdir_file_size(&self.dirbuf),
                self.dirbuf[XDIR_GENFLAGS] & XDIR_CONTIGUOUS != 0,
            )
        } else {
            let ent = self.dir_read_entry(&dp)?;
            let sde = ShortDirEntry::from_bytes(&ent);
            (
                sde.attr(),
                sde.first_cluster(),
                sde.file_size() as u64,
                false,
            )
        };
        if attr & ATTR_READ_ONLY != 0 {
            return Err(FsError::Denied);
        }
        if attr & ATTR_DIRECTORY != 0 {
            if sclu == self.cdir {
                return Err(FsError::Denied);
            }
            if !self.dir_is_empty(&dp, sclu, objsize)? {
                return Err(FsError::Denied);
            }
            if self.is_shared((sclu as u64 | 1 << 63, 0)) {
                return Err(FsError::Locked);
            }
        }

        self.set_dirty()?;
        self.dir_remove(&mut dp)?;
        if sclu >= 2 {
            if contiguous {
                let csz = self.cluster_bytes();
                let n = ((objsize + csz - 1) / csz) as u32;
                self.free_contiguous(sclu, n)?;
            } else {
                self.remove_chain(sclu, 0)?;
            }
        }
        self.sync_fs()
    }

    /// Does the directory whose entry `dp` rests on contain anything
    /// besides its dot entries?
    fn dir_is_empty(&mut self, dp: &Dir, sclu: u32, objsize: u64) -> FsResult<bool> {
        let mut sub = clone_pos(dp);
        sub.sclust = sclu;
        sub.clust = sclu;
        sub.objsize = objsize;
        sub.stat = if self.kind == FatKind::Exfat {
            if self.dirbuf[XDIR_GENFLAGS] & XDIR_CONTIGUOUS != 0 {
                ChainStat::Contiguous
            } else {
                ChainStat::Fragmented
            }
        } else {
            ChainStat::Fragmented
        };
        sub.blk_ofs = BADOFS;
        self.dir_sdi(&mut sub, 0)?;
        match self.dir_read(&mut sub, false) {
            Ok(()) => Ok(false),
            Err(FsError::NoFile) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Rename or move a file/directory. The destination must not exist;
    /// the object's data is never copied, only its entries.
    pub fn rename(&mut self, path_old: &str, path_new: &str) -> FsResult<()> {
        self.check_writable()?;
        let (mut old_dp, lk) = self.follow_path(path_old)?;
        match lk {
            Lookup::Root => return Err(FsError::InvalidName),
            Lookup::Missing => return Err(FsError::NoFile),
            Lookup::Found => {}
        }
        if old_dp.fn_[11] & NS_DOT != 0 {
            return Err(FsError::InvalidName);
        }
        if self.is_shared(self.entry_share_key(&old_dp)) {
            return Err(FsError::Locked);
        }

        // stash everything about the old entry before the walker moves on
        let old_is_exfat = self.kind == FatKind::Exfat;
        let old_set: Vec<u8> = if old_is_exfat {
            self.dirbuf[..old_dp.n_ent as usize * 32].to_owned()
        } else {
            let ent = self.dir_read_entry(&old_dp)?;
            ent.to_vec()
        };

        let (new_dp, lk) = self.follow_path(path_new)?;
        let mut new_dp = new_dp;
        match lk {
            Lookup::Root => return Err(FsError::InvalidName),
            Lookup::Found => return Err(FsError::Exist),
            Lookup::Missing => {}
        }
        if new_dp.fn_[11] & NS_DOT != 0 {
            return Err(FsError::InvalidName);
        }
        self.set_dirty()?;

        let now = self.clock.now();
        if old_is_exfat {
            let n_new = {
                self.dir_register(&mut new_dp)?;
                // graft the object fields of the old set onto the new one:
                // attributes, times, chain shape, clusters and sizes
                self.dirbuf[XDIR_ATTR] = old_set[XDIR_ATTR];
                self.dirbuf[4 + 1] = old_set[4 + 1];
                self.dirbuf[crate::entry::XDIR_CRTTIME..crate::entry::XDIR_CRTTIME + 12]
                    .copy_from_slice(
                        &old_set[crate::entry::XDIR_CRTTIME..crate::entry::XDIR_CRTTIME + 12],
                    );
                self.dirbuf[XDIR_GENFLAGS] = old_set[XDIR_GENFLAGS];
                self.dirbuf[crate::entry::XDIR_VALIDFILESIZE..crate::entry::XDIR_VALIDFILESIZE + 8]
                    .copy_from_slice(
                        &old_set
                            [crate::entry::XDIR_VALIDFILESIZE..crate::entry::XDIR_VALIDFILESIZE + 8],
                    );
                self.dirbuf[crate::entry::XDIR_FSTCLUS..crate::entry::XDIR_FSTCLUS + 4]
                    .copy_from_slice(
                        &old_set[crate::entry::XDIR_FSTCLUS..crate::entry::XDIR_FSTCLUS + 4],
                    );
                self.dirbuf[crate::entry::XDIR_FILESIZE..crate::entry::XDIR_FILESIZE + 8]
                    .copy_from_slice(
                        &old_set[crate::entry::XDIR_FILESIZE..crate::entry::XDIR_FILESIZE + 8],
                    );
                crate::write_le_u32(&mut self.dirbuf[XDIR_MODTIME..], now);
                self.store_xdir(&clone_pos(&new_dp))?;
                new_dp.n_ent
            };
            let _ = n_new;
            // restore the old set image so dir_remove clears the right
            // number of entries
            self.dirbuf[..old_set.len()].copy_from_slice(&old_set);
            self.dir_remove(&mut old_dp)?;
        } else {
            let old_sde = ShortDirEntry::from_bytes(&old_set);
            self.dir_register(&mut new_dp)?;
            self.dir_update_entry(&new_dp, |sde| {
                let mut moved = old_sde;
                moved.set_name_bytes(&sde.name_bytes());
                moved.set_nt_res(sde.nt_res());
                moved.set_modify_time(now);
                *sde = moved;
            })?;
            // a directory moved across directories must re-point its
            // dot-dot entry at the new parent
            if old_sde.is_dir() && old_sde.first_cluster() >= 2 {
                let new_parent = {
                    let root = self.root_dir_obj();
                    if new_dp.sclust == root.sclust {
                        0
                    } else {
                        new_dp.sclust
                    }
                };
                let sect = self.clst2sect(old_sde.first_cluster());
                self.move_window(sect)?;
                let ent = ShortDirEntry::from_bytes(&self.win[DIRENT_SIZE..DIRENT_SIZE + 32]);
                if ent.name_bytes()[..2] == *b".." {
                    let mut dotdot = ent;
                    dotdot.set_first_cluster(new_parent);
                    let bytes = dotdot.to_bytes_array();
                    self.win_write(DIRENT_SIZE, &bytes);
                }
            }
            self.dir_remove(&mut old_dp)?;
        }
        self.sync_fs()
    }

    /// Change attribute bits selected by `mask` (read-only, hidden,
    /// system, archive).
    pub fn chmod(&mut self, path: &str, attr: u8, mask: u8) -> FsResult<()> {
        self.check_writable()?;
        let (dp, lk) = self.follow_path(path)?;
        match lk {
            Lookup::Root => return Err(FsError::InvalidName),
            Lookup::Missing => return Err(FsError::NoFile),
            Lookup::Found => {}
        }
        let mask = mask & (ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_ARCHIVE);
        self.set_dirty()?;
        if self.kind == FatKind::Exfat {
            let cur = self.dirbuf[XDIR_ATTR];
            self.dirbuf[XDIR_ATTR] = (attr & mask) | (cur & !mask);
            self.store_xdir(&clone_pos(&dp))?;
        } else {
            self.dir_update_entry(&dp, |sde| {
                let cur = sde.attr();
                sde.set_attr((attr & mask) | (cur & !mask));
            })?;
        }
        self.sync_fs()
    }

    /// Set the modification timestamp from a FileInfo's fdate/ftime.
    pub fn utime(&mut self, path: &str, fno: &FileInfo) -> FsResult<()> {
        self.check_writable()?;
        let (dp, lk) = self.follow_path(path)?;
        match lk {
            Lookup::Root => return Err(FsError::InvalidName),
            Lookup::Missing => return Err(FsError::NoFile),
            Lookup::Found => {}
        }
        let stamp = ((fno.fdate as u32) << 16) | fno.ftime as u32;
        self.set_dirty()?;
        if self.kind == FatKind::Exfat {
            crate::write_le_u32(&mut self.dirbuf[XDIR_MODTIME..], stamp);
            self.store_xdir(&clone_pos(&dp))?;
        } else {
            self.dir_update_entry(&dp, |sde| {
                sde.set_modify_time(stamp);
            })?;
        }
        self.sync_fs()
    }

    /// Change the current directory.
    pub fn chdir(&mut self, path: &str) -> FsResult<()> {
        let (mut dp, lk) = self.follow_path(path)?;
        match lk {
            Lookup::Root => {
                self.cdir = 0;
                self.cwd = String::from("/");
                return Ok(());
            }
            Lookup::Missing => return Err(FsError::NoPath),
            Lookup::Found => {}
        }
        self.descend(&mut dp)?;
        let root = self.root_dir_obj();
        self.cwd = Self::canonicalize(
            &self.cwd.clone(),
            self.strip_drive(path)?,
        )?;
        if dp.sclust == root.sclust {
            self.cdir = 0;
        } else {
            self.cdir = dp.sclust;
        }
        Ok(())
    }

    /// Text of the current directory. FAT volumes reconstruct it by
    /// walking dot-dot entries upward and matching each child's start
    /// cluster in its parent; exFAT returns the tracked text.
    pub fn getcwd(&mut self) -> FsResult<String> {
        if self.cdir == 0 {
            return Ok(String::from("/"));
        }
        if self.kind == FatKind::Exfat {
            return Ok(self.cwd.clone());
        }

        let mut names: Vec<String> = Vec::new();
        let mut child = self.cdir;
        let mut guard = 0u32;
        loop {
            // the second entry of any subdirectory is its dot-dot
            let mut d = self.root_dir_obj();
            d.sclust = child;
            d.clust = child;
            self.dir_sdi(&mut d, DIRENT_SIZE as u32)?;
            let ent = self.dir_read_entry(&d)?;
            let dotdot = ShortDirEntry::from_bytes(&ent);
            if dotdot.name_bytes()[..2] != *b".." {
                return Err(FsError::IntErr);
            }
            let parent = dotdot.first_cluster();
            let parent_is_root = parent == 0
                || (self.kind == FatKind::Fat32 && parent as u64 == self.dirbase);

            let mut pd = self.root_dir_obj();
            if !parent_is_root {
                pd.sclust = parent;
                pd.clust = parent;
            }
            self.dir_sdi(&mut pd, 0)?;
            loop {
                self.dir_read(&mut pd, false)?;
                let pent = self.dir_read_entry(&pd)?;
                let sde = ShortDirEntry::from_bytes(&pent);
                if sde.is_dir() && sde.first_cluster() == child {
                    names.push(self.get_fileinfo(&pd)?.fname);
                    break;
                }
                self.dir_next(&mut pd, false)?;
            }

            if parent_is_root {
                break;
            }
            child = parent;
            guard += 1;
            if guard > 128 {
                return Err(FsError::IntErr);
            }
        }

        let mut out = String::new();
        for name in names.iter().rev() {
            out.push('/');
            out.push_str(name);
        }
        Ok(out)
    }
}

/// Glob matcher with `?`/`*` wildcards, case-insensitive. `skip` carries a
/// count of name characters to consume blindly (low byte) and a
/// star-was-seen flag (bit 8); `recur` bounds wildcard branching.
pub(crate) fn pattern_match(pat: &str, name: &str, skip: u32, recur: u32) -> bool {
    fn fold(c: char) -> char {
        let u = c as u32;
        if u < 0x10000 {
            char::from_u32(to_upper(u as u16) as u32).unwrap_or(c)
        } else {
            c
        }
    }
    let p: Vec<char> = pat.chars().map(fold).collect();
    let n: Vec<char> = name.chars().map(fold).collect();
    match_inner(&p, &n, skip, recur)
}

fn match_inner(p: &[char], n: &[char], skip: u32, recur: u32) -> bool {
    let mut nam = n;
    let mut to_skip = skip & 0xFF;
    while to_skip != 0 {
        if nam.is_empty() {
            return false;
        }
        nam = &nam[1..];
        to_skip -= 1;
    }
    if p.is_empty() && skip & 0x100 != 0 {
        return true; // a trailing star swallows the rest
    }

    loop {
        let mut pp = p;
        let mut nn = nam;
        let nchr: Option<char>;
        loop {
            match pp.first().copied() {
                Some(c) if c == '?' || c == '*' => {
                    if recur == 0 {
                        return false;
                    }
                    let mut sk = 0u32;
                    while let Some(&c2) = pp.first() {
                        match c2 {
                            '?' => sk += 1,
                            '*' => sk |= 0x100,
                            _ => break,
                        }
                        pp = &pp[1..];
                    }
                    if match_inner(pp, nn, sk, recur - 1) {
                        return true;
                    }
                    nchr = nn.first().copied();
                    break;
                }
                pc => {
                    let nc = nn.first().copied();
                    if pc != nc {
                        nchr = nc;
                        break;
                    }
                    if pc.is_none() {
                        return true; // both exhausted
                    }
                    pp = &pp[1..];
                    nn = &nn[1..];
                }
            }
        }
        if skip & 0x100 != 0 && nchr.is_some() {
            nam = &nam[1..]; // star retries at the next name position
        } else {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_basics() {
        assert!(pattern_match("*", "anything.txt", 0, 4));
        assert!(pattern_match("*.txt", "NOTES.TXT", 0, 4));
        assert!(pattern_match("*.txt", "notes.txt", 0, 4));
        assert!(!pattern_match("*.txt", "notes.doc", 0, 4));
        assert!(pattern_match("n?tes.*", "notes.doc", 0, 4));
        assert!(!pattern_match("n?tes.*", "ntes.doc", 0, 4));
        assert!(pattern_match("a*c", "abbbc", 0, 4));
        assert!(!pattern_match("a*c", "abbbd", 0, 4));
        assert!(pattern_match("", "", 0, 4));
        assert!(!pattern_match("", "x", 0, 4));
    }

    #[test]
    fn canonicalization() {
        assert_eq!(Volume::canonicalize("/", "a/b").unwrap(), "/a/b");
        assert_eq!(Volume::canonicalize("/a/b", "../c").unwrap(), "/a/c");
        assert_eq!(Volume::canonicalize("/a", "/x/./y").unwrap(), "/x/y");
        assert_eq!(Volume::canonicalize("/a", "..").unwrap(), "/");
        assert!(Volume::canonicalize("/", "..").is_err());
    }
}
