//! File objects: open modes, sequential and random access, truncation,
//! preallocation and write-back.
//!
//! A file object is caller-owned storage: object identity (volume
//! generation, start cluster, size), the read/write pointer, the current
//! cluster/sector, the location of its directory entry for write-back, and
//! a private sector window. File data never moves through the volume
//! window: whole aligned sectors go straight between the device and the
//! caller's buffer, partial sectors stage through the file's window.
//!
//! Writes past the end of the object implicitly zero the gap (the sector
//! tail holding the old end is zeroed, then whole zero sectors up to the
//! new position), so reads of a hole always return zeros. On exFAT the
//! valid-data length tracks how far real data extends; a contiguous
//! (no-FAT-chain) file that receives a write beyond its valid length has
//! its chain materialised into the FAT first.

use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use log::trace;

use crate::dir::{clone_pos, ChainStat};
use crate::entry::{
    xdir_file_size, xdir_first_cluster, xdir_valid_size, ShortDirEntry, XDIR_ATTR,
    XDIR_CONTIGUOUS, XDIR_FSTCLUS, XDIR_GENFLAGS, XDIR_MODTIME, XDIR_VALIDFILESIZE,
};
use crate::fs::{FatKind, ShareKey, Volume};
use crate::name::NS_DOT;
use crate::path::Lookup;
use crate::{
    FsError, FsResult, ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_READ_ONLY, MAX_FILE_SIZE_FAT,
};

bitflags! {
    /// Open method and access mode. `OPEN_EXISTING` is the empty set;
    /// `OPEN_APPEND` implies `OPEN_ALWAYS` plus an initial seek to the end.
    pub struct OpenMode: u8 {
        const READ          = 0x01;
        const WRITE         = 0x02;
        const CREATE_NEW    = 0x04;
        const CREATE_ALWAYS = 0x08;
        const OPEN_ALWAYS   = 0x10;
        const OPEN_APPEND   = 0x30;
    }
}

/// An open file.
pub struct File {
    /// Hosting volume's mount generation; zeroed on close.
    pub(crate) id: u16,
    pub(crate) attr: u8,
    pub(crate) mode: OpenMode,
    /// Latched abort flag; once set, read/write refuse until close.
    pub(crate) err: Option<FsError>,
    /// Start cluster (0 until the first cluster is allocated).
    pub(crate) sclust: u32,
    /// Object size. On exFAT this is the data length (allocation extent).
    pub(crate) objsize: u64,
    /// Valid data length (== objsize on FAT variants).
    pub(crate) valid_size: u64,
    pub(crate) stat: ChainStat,
    /// Read/write pointer.
    pub(crate) fptr: u64,
    /// Cluster containing the byte before `fptr`; meaningless at fptr 0.
    pub(crate) clust: u32,
    /// Sector currently held in `buf` (0 = none).
    pub(crate) sect: u64,
    pub(crate) buf: Vec<u8>,
    pub(crate) buf_dirty: bool,
    /// Content or metadata changed; the directory entry needs write-back.
    pub(crate) modified: bool,
    /// FAT: location of the 32-byte directory entry.
    pub(crate) dir_sect: u64,
    pub(crate) dir_ofs: u32,
    /// exFAT: location of the entry set within the containing directory.
    pub(crate) e_dir_sclust: u32,
    pub(crate) e_dir_stat: ChainStat,
    pub(crate) e_dir_size: u64,
    pub(crate) e_blk_ofs: u32,
    pub(crate) e_n_ent: u8,
    pub(crate) share_key: ShareKey,
    pub(crate) locked: bool,
    /// Fast-seek cluster link map: (fragment length, first cluster) pairs.
    pub(crate) cltbl: Option<Vec<(u32, u32)>>,
}

impl File {
    pub fn tell(&self) -> u64 {
        self.fptr
    }

    pub fn size(&self) -> u64 {
        self.objsize
    }

    pub fn eof(&self) -> bool {
        self.fptr == self.objsize
    }

    /// The latched abort code, if any.
    pub fn error(&self) -> Option<FsError> {
        self.err
    }

    fn writable(&self) -> bool {
        self.mode.contains(OpenMode::WRITE)
    }

    fn abort(&mut self, e: FsError) -> FsError {
        self.err = Some(e);
        e
    }
}

impl Volume {
    fn validate_file(&self, fp: &File) -> FsResult<()> {
        self.validate_obj(fp.id)?;
        if let Some(_) = fp.err {
            return Err(FsError::IntErr);
        }
        Ok(())
    }

    /// Open or create a file.
    pub fn open(&mut self, path: &str, mode: OpenMode) -> FsResult<File> {
        if mode.contains(OpenMode::WRITE) {
            self.check_writable()?;
        }
        let (mut dp, lk) = self.follow_path(path)?;
        if lk == Lookup::Root || dp.fn_[11] & NS_DOT != 0 {
            return Err(FsError::InvalidName);
        }

        let creating = mode
            .intersects(OpenMode::CREATE_NEW | OpenMode::CREATE_ALWAYS | OpenMode::OPEN_ALWAYS);
        let now = self.clock.now();
        let mut truncated = false;
        match lk {
            Lookup::Found => {
                if mode.contains(OpenMode::CREATE_NEW) {
                    return Err(FsError::Exist);
                }
            }
            Lookup::Missing => {
                if !creating {
                    return Err(FsError::NoFile);
                }
                self.set_dirty()?;
                self.dir_register(&mut dp)?;
                if self.kind == FatKind::Exfat {
                    self.dirbuf[XDIR_ATTR] = ATTR_ARCHIVE;
                    crate::write_le_u32(&mut self.dirbuf[crate::entry::XDIR_CRTTIME..], now);
                    crate::write_le_u32(&mut self.dirbuf[XDIR_MODTIME..], now);
                    self.store_xdir(&clone_pos(&dp))?;
                } else {
                    self.dir_update_entry(&dp, |sde| {
                        sde.set_attr(ATTR_ARCHIVE);
                        sde.set_create_time(now);
                        sde.set_modify_time(now);
                    })?;
                }
            }
            Lookup::Root => unreachable!(),
        }

        // object snapshot out of the entry (set)
        let (attr, mut sclust, mut objsize, mut valid_size, mut stat) =
            if self.kind == FatKind::Exfat {
                (
                    self.dirbuf[XDIR_ATTR],
                    xdir_first_cluster(&self.dirbuf),
                    xdir_file_size(&self.dirbuf),
                    xdir_valid_size(&self.dirbuf),
                    if self.dirbuf[XDIR_GENFLAGS] & XDIR_CONTIGUOUS != 0 {
                        ChainStat::Contiguous
                    } else {
                        ChainStat::Fragmented
                    },
                )
            } else {
                let ent = self.dir_read_entry(&dp)?;
                let sde = ShortDirEntry::from_bytes(&ent);
                (
                    sde.attr(),
                    sde.first_cluster(),
                    sde.file_size() as u64,
                    sde.file_size() as u64,
                    ChainStat::Fragmented,
                )
            };
        if attr & ATTR_DIRECTORY != 0 {
            return Err(FsError::NoFile);
        }
        if mode.contains(OpenMode::WRITE) && attr & ATTR_READ_ONLY != 0 {
            return Err(FsError::Denied);
        }

        let key = self.entry_share_key(&dp);
        self.chk_share(key, mode.contains(OpenMode::WRITE))?;

        if lk == Lookup::Found && mode.contains(OpenMode::CREATE_ALWAYS) {
            // recreate in place: release the old chain, keep the entry
            self.set_dirty()?;
            if sclust >= 2 {
                if stat == ChainStat::Contiguous {
                    let csz = self.cluster_bytes();
                    let n = ((objsize + csz - 1) / csz) as u32;
                    self.free_contiguous(sclust, n)?;
                } else {
                    self.remove_chain(sclust, 0)?;
                }
            }
            sclust = 0;
            objsize = 0;
            valid_size = 0;
            stat = ChainStat::Fragmented;
            truncated = true;
        }

        self.inc_share(key, mode.contains(OpenMode::WRITE))?;
        let mut fp = File {
            id: self.id,
            attr,
            mode,
            err: None,
            sclust,
            objsize,
            valid_size,
            stat,
            fptr: 0,
            clust: 0,
            sect: 0,
            buf: vec![0u8; self.ssize],
            buf_dirty: false,
            modified: truncated || lk == Lookup::Missing,
            dir_sect: dp.sect,
            dir_ofs: dp.dptr,
            e_dir_sclust: dp.sclust,
            e_dir_stat: dp.stat,
            e_dir_size: dp.objsize,
            e_blk_ofs: dp.blk_ofs,
            e_n_ent: dp.n_ent,
            share_key: key,
            locked: true,
            cltbl: None,
        };
        if mode.contains(OpenMode::OPEN_APPEND) {
            let end = fp.objsize;
            if let Err(e) = self.lseek(&mut fp, end) {
                self.dec_share(fp.share_key);
                fp.locked = false;
                return Err(e);
            }
        }
        Ok(fp)
    }

    /// Flush and close. The object is unusable afterwards.
    pub fn close(&mut self, fp: &mut File) -> FsResult<()> {
        let res = if fp.err.is_none() && fp.writable() && self.validate_obj(fp.id).is_ok() {
            self.sync(fp)
        } else {
            Ok(())
        };
        if fp.locked {
            self.dec_share(fp.share_key);
            fp.locked = false;
        }
        fp.id = 0;
        res
    }

    /// Cluster holding cluster-index `ci` of the file.
    fn cluster_at(&mut self, fp: &File, ci: u32) -> FsResult<u32> {
        if fp.stat == ChainStat::Contiguous {
            return Ok(fp.sclust + ci);
        }
        if let Some(tbl) = &fp.cltbl {
            let mut left = ci;
            for &(len, first) in tbl {
                if left < len {
                    return Ok(first + left);
                }
                left -= len;
            }
            return Err(FsError::IntErr);
        }
        self.skip_chain(fp.sclust, ci)
    }

    /// Successor of the file's current cluster while reading.
    fn next_cluster_read(&mut self, fp: &File) -> FsResult<Option<u32>> {
        if fp.stat == ChainStat::Contiguous {
            return Ok(Some(fp.clust + 1));
        }
        self.chain_next(fp.clust)
    }

    fn flush_file_window(&mut self, fp: &mut File) -> FsResult<()> {
        if fp.buf_dirty {
            self.device
                .write_sectors(&fp.buf, fp.sect, 1)
                .map_err(|_| FsError::DiskErr)?;
            fp.buf_dirty = false;
        }
        Ok(())
    }

    /// Load `sect` into the file window. `fresh` skips the disk read for
    /// sectors with no recorded data yet, zero-filling instead.
    fn load_file_window(&mut self, fp: &mut File, sect: u64, fresh: bool) -> FsResult<()> {
        if fp.sect == sect {
            return Ok(());
        }
        self.flush_file_window(fp)?;
        if fresh {
            fp.buf.fill(0);
        } else {
            self.device
                .read_sectors(&mut fp.buf, sect, 1)
                .map_err(|_| FsError::DiskErr)?;
        }
        fp.sect = sect;
        Ok(())
    }

    /// Read up to `buff.len()` bytes from the current position. Short
    /// reads happen only at end of file.
    pub fn read(&mut self, fp: &mut File, buff: &mut [u8]) -> FsResult<usize> {
        self.validate_file(fp)?;
        if !fp.mode.contains(OpenMode::READ) {
            return Err(FsError::Denied);
        }
        let mut btr = buff.len() as u64;
        if fp.fptr >= fp.objsize {
            return Ok(0);
        }
        if btr > fp.objsize - fp.fptr {
            btr = fp.objsize - fp.fptr;
        }
        let mut done = 0usize;
        while btr > 0 {
            if self.kind == FatKind::Exfat && fp.fptr >= fp.valid_size {
                // the tail past the valid length reads as zeros
                let n = btr as usize;
                buff[done..done + n].fill(0);
                fp.fptr += n as u64;
                done += n;
                break;
            }
            let mut chunk = btr;
            if self.kind == FatKind::Exfat && fp.fptr + chunk > fp.valid_size {
                chunk = fp.valid_size - fp.fptr;
            }
            let n = self.read_raw(fp, &mut buff[done..done + chunk as usize])?;
            done += n;
            btr -= n as u64;
            if n == 0 {
                break;
            }
        }
        Ok(done)
    }

    fn read_raw(&mut self, fp: &mut File, buff: &mut [u8]) -> FsResult<usize> {
        let ssize = self.ssize as u64;
        let csize = self.csize as u64;
        let mut btr = buff.len();
        let mut done = 0usize;
        while btr > 0 {
            let in_sect = (fp.fptr % ssize) as usize;
            if in_sect == 0 {
                let csect = (fp.fptr / ssize) % csize;
                if csect == 0 {
                    let clst = if fp.fptr == 0 {
                        fp.sclust
                    } else {
                        match self.next_cluster_read(fp) {
                            Ok(Some(c)) => c,
                            Ok(None) => return Err(fp.abort(FsError::IntErr)),
                            Err(e) => return Err(fp.abort(e)),
                        }
                    };
                    if clst < 2 || clst >= self.n_fatent {
                        return Err(fp.abort(FsError::IntErr));
                    }
                    fp.clust = clst;
                }
                let sect = self.clst2sect(fp.clust) + csect;
                let cc = (btr as u64 / ssize).min(csize - csect) as usize;
                if cc > 0 {
                    // whole sectors go straight into the caller's buffer
                    if fp.buf_dirty && fp.sect >= sect && fp.sect < sect + cc as u64 {
                        self.flush_file_window(fp)?;
                    }
                    self.device
                        .read_sectors(&mut buff[done..done + cc * self.ssize], sect, cc)
                        .map_err(|e| {
                            let _ = e;
                            fp.abort(FsError::DiskErr)
                        })?;
                    let n = cc * self.ssize;
                    fp.fptr += n as u64;
                    done += n;
                    btr -= n;
                    continue;
                }
            }
            let sect_of_fptr = {
                let csect = (fp.fptr / ssize) % csize;
                self.clst2sect(fp.clust) + csect
            };
            self.load_file_window(fp, sect_of_fptr, false)
                .map_err(|e| fp.abort(e))?;
            let in_sect = (fp.fptr % ssize) as usize;
            let n = (self.ssize - in_sect).min(btr);
            buff[done..done + n].copy_from_slice(&fp.buf[in_sect..in_sect + n]);
            fp.fptr += n as u64;
            done += n;
            btr -= n;
        }
        Ok(done)
    }

    /// Successor cluster while writing, extending the chain at its end.
    /// Returns 0 when the volume is full.
    fn next_cluster_write(&mut self, fp: &mut File) -> FsResult<u32> {
        if fp.stat == ChainStat::Contiguous {
            let csz = self.cluster_bytes();
            let alloc = ((fp.objsize + csz - 1) / csz) as u32;
            let ci = (fp.fptr / csz) as u32;
            if ci < alloc {
                return Ok(fp.clust + 1);
            }
            // growth of a no-FAT-chain file records the chain first
            self.materialize_chain(fp)?;
        }
        match self.chain_next(fp.clust)? {
            Some(c) => Ok(c),
            None => self.create_chain(fp.clust),
        }
    }

    /// Record a contiguous object's implicit chain into the FAT and mark
    /// it fragmented; the entry's no-chain flag is rewritten on sync.
    fn materialize_chain(&mut self, fp: &mut File) -> FsResult<()> {
        let csz = self.cluster_bytes();
        let n = ((fp.objsize + csz - 1) / csz) as u32;
        if n > 0 {
            let mut clu = fp.sclust + n - 1;
            self.put_fat(clu, 0xFFFF_FFFF)?;
            while clu > fp.sclust {
                self.put_fat(clu - 1, clu)?;
                clu -= 1;
            }
        }
        fp.stat = ChainStat::Fragmented;
        fp.modified = true;
        trace!("materialized chain of {} clusters at {}", n, fp.sclust);
        Ok(())
    }

    /// Write `buff` at the current position, extending the object as
    /// needed. A short count means the volume filled up.
    pub fn write(&mut self, fp: &mut File, buff: &[u8]) -> FsResult<usize> {
        self.validate_file(fp)?;
        if !fp.writable() {
            return Err(FsError::Denied);
        }
        self.check_writable()?;
        let mut btw = buff.len() as u64;
        if btw == 0 {
            return Ok(0);
        }
        if self.kind != FatKind::Exfat && fp.fptr + btw > MAX_FILE_SIZE_FAT {
            btw = MAX_FILE_SIZE_FAT.saturating_sub(fp.fptr);
            if btw == 0 {
                return Err(FsError::Denied);
            }
        }
        self.set_dirty()?;

        // a write landing past the recorded data zero-fills the gap so the
        // hole reads back as zeros
        let data_end = if self.kind == FatKind::Exfat {
            fp.valid_size
        } else {
            fp.objsize
        };
        if fp.fptr > data_end {
            self.fill_hole(fp)?;
        }

        let ssize = self.ssize as u64;
        let csize = self.csize as u64;
        let mut left = btw as usize;
        let mut done = 0usize;
        while left > 0 {
            let in_sect = (fp.fptr % ssize) as usize;
            if in_sect == 0 {
                let csect = (fp.fptr / ssize) % csize;
                if csect == 0 {
                    let clst = if fp.fptr == 0 {
                        if fp.sclust == 0 {
                            let c = self.create_chain(0).map_err(|e| fp.abort(e))?;
                            if c == 0 {
                                break; // volume full
                            }
                            fp.sclust = c;
                            fp.stat = if self.kind == FatKind::Exfat {
                                ChainStat::Contiguous
                            } else {
                                ChainStat::Fragmented
                            };
                            c
                        } else {
                            fp.sclust
                        }
                    } else {
                        match self.next_cluster_write(fp) {
                            Ok(0) => break, // volume full
                            Ok(c) => c,
                            Err(e) => return Err(fp.abort(e)),
                        }
                    };
                    if clst < 2 || clst >= self.n_fatent {
                        return Err(fp.abort(FsError::IntErr));
                    }
                    fp.clust = clst;
                }
                let sect = self.clst2sect(fp.clust) + csect;
                let cc = (left as u64 / ssize).min(csize - csect) as usize;
                if cc > 0 {
                    if fp.sect >= sect && fp.sect < sect + cc as u64 {
                        // the private window aliases one of these sectors
                        fp.buf_dirty = false;
                        fp.sect = 0;
                    }
                    self.device
                        .write_sectors(&buff[done..done + cc * self.ssize], sect, cc)
                        .map_err(|e| {
                            let _ = e;
                            fp.abort(FsError::DiskErr)
                        })?;
                    let n = cc * self.ssize;
                    fp.fptr += n as u64;
                    done += n;
                    left -= n;
                    self.bump_sizes(fp);
                    continue;
                }
            }
            let sect_of_fptr = {
                let csect = (fp.fptr / ssize) % csize;
                self.clst2sect(fp.clust) + csect
            };
            // a sector that holds no recorded data yet is staged as zeros
            let sector_base = round_down(fp.fptr, ssize);
            let fresh = sector_base >= fp.objsize;
            self.load_file_window(fp, sect_of_fptr, fresh)
                .map_err(|e| fp.abort(e))?;
            let in_sect = (fp.fptr % ssize) as usize;
            let n = (self.ssize - in_sect).min(left);
            fp.buf[in_sect..in_sect + n].copy_from_slice(&buff[done..done + n]);
            fp.buf_dirty = true;
            fp.fptr += n as u64;
            done += n;
            left -= n;
            self.bump_sizes(fp);
        }
        fp.modified = true;
        Ok(done)
    }

    fn bump_sizes(&self, fp: &mut File) {
        if fp.fptr > fp.objsize {
            fp.objsize = fp.fptr;
        }
        if self.kind == FatKind::Exfat {
            if fp.fptr > fp.valid_size {
                fp.valid_size = fp.fptr;
            }
        } else {
            fp.valid_size = fp.objsize;
        }
    }

    /// Zero-fill from the end of recorded data up to `fp.fptr`, extending
    /// the cluster chain underneath. Leaves the current cluster valid for
    /// the pointer.
    fn fill_hole(&mut self, fp: &mut File) -> FsResult<()> {
        let upto = fp.fptr;
        let start = if self.kind == FatKind::Exfat {
            fp.valid_size
        } else {
            fp.objsize
        };
        debug_assert!(upto > start);
        let ssize = self.ssize as u64;
        let bcs = self.cluster_bytes();

        if self.kind == FatKind::Exfat && fp.stat == ChainStat::Contiguous && fp.sclust != 0 {
            self.materialize_chain(fp)?;
        }

        // make sure a cluster exists under `start`
        let mut clu;
        if fp.sclust == 0 {
            let c = self.create_chain(0)?;
            if c == 0 {
                return Err(FsError::Denied);
            }
            fp.sclust = c;
            if self.kind == FatKind::Exfat {
                fp.stat = ChainStat::Fragmented;
            }
            clu = c;
        } else {
            let target_ci = (start / bcs) as u32;
            clu = fp.sclust;
            let mut ci = 0u32;
            while ci < target_ci {
                clu = match self.chain_next(clu)? {
                    Some(c) => c,
                    None => {
                        let c = self.create_chain(clu)?;
                        if c == 0 {
                            return Err(FsError::Denied);
                        }
                        c
                    }
                };
                ci += 1;
            }
        }

        let mut pos = start;
        // preserve the head of the sector containing the old end
        if pos % ssize != 0 {
            let sect = self.clst2sect(clu) + (pos / ssize) % self.csize as u64;
            self.load_file_window(fp, sect, false)?;
            let from = (pos % ssize) as usize;
            fp.buf[from..].fill(0);
            fp.buf_dirty = true;
            self.flush_file_window(fp)?;
            pos = round_down(pos, ssize) + ssize;
        }

        let zeros = vec![0u8; self.ssize];
        while pos < upto {
            if pos % bcs == 0 && pos > start {
                clu = match self.chain_next(clu)? {
                    Some(c) => c,
                    None => {
                        let c = self.create_chain(clu)?;
                        if c == 0 {
                            return Err(FsError::Denied);
                        }
                        c
                    }
                };
            }
            let sect = self.clst2sect(clu) + (pos / ssize) % self.csize as u64;
            if fp.sect == sect {
                fp.sect = 0;
                fp.buf_dirty = false;
            }
            self.device
                .write_sectors(&zeros, sect, 1)
                .map_err(|_| FsError::DiskErr)?;
            pos += ssize;
        }

        // the cluster under `upto` may still be missing when upto sits on
        // a cluster boundary handled by the write loop itself
        fp.clust = clu;
        if self.kind == FatKind::Exfat {
            fp.valid_size = upto;
            if upto > fp.objsize {
                fp.objsize = upto;
            }
        } else {
            fp.objsize = upto;
            fp.valid_size = upto;
        }
        fp.modified = true;
        Ok(())
    }

    /// Move the read/write pointer. Seeking past the end is allowed only
    /// on writable objects; the gap materialises at the next write.
    pub fn lseek(&mut self, fp: &mut File, ofs: u64) -> FsResult<()> {
        self.validate_file(fp)?;
        let mut ofs = ofs;
        if ofs > fp.objsize && !fp.writable() {
            ofs = fp.objsize;
        }
        fp.fptr = ofs;
        if ofs == 0 {
            fp.clust = 0;
            return Ok(());
        }
        let bcs = self.cluster_bytes();
        let within = ofs.min(fp.objsize);
        if within > 0 && fp.sclust != 0 {
            let ci = ((within - 1) / bcs) as u32;
            fp.clust = self.cluster_at(fp, ci)?;
            // stage the sector under the pointer for partial access
            if ofs <= fp.objsize && ofs % self.ssize as u64 != 0 && ofs < fp.valid_size {
                let csect = (ofs / self.ssize as u64) % self.csize as u64;
                let sect = self.clst2sect(fp.clust) + csect;
                self.load_file_window(fp, sect, false)?;
            }
        }
        Ok(())
    }

    /// Drop everything past the current pointer.
    pub fn truncate(&mut self, fp: &mut File) -> FsResult<()> {
        self.validate_file(fp)?;
        if !fp.writable() {
            return Err(FsError::Denied);
        }
        if fp.fptr >= fp.objsize {
            return Ok(());
        }
        self.set_dirty()?;
        let bcs = self.cluster_bytes();
        if fp.fptr == 0 {
            if fp.sclust >= 2 {
                if fp.stat == ChainStat::Contiguous {
                    let n = ((fp.objsize + bcs - 1) / bcs) as u32;
                    self.free_contiguous(fp.sclust, n)?;
                } else {
                    self.remove_chain(fp.sclust, 0)?;
                }
            }
            fp.sclust = 0;
            fp.stat = ChainStat::Fragmented;
            fp.clust = 0;
        } else {
            let keep = ((fp.fptr + bcs - 1) / bcs) as u32;
            let total = ((fp.objsize + bcs - 1) / bcs) as u32;
            if fp.stat == ChainStat::Contiguous {
                if total > keep {
                    self.free_contiguous(fp.sclust + keep, total - keep)?;
                }
            } else {
                let last = self.cluster_at(fp, keep - 1)?;
                if let Some(next) = self.chain_next(last)? {
                    self.remove_chain(next, last)?;
                } else {
                    self.put_fat(last, 0xFFFF_FFFF)?;
                }
            }
        }
        fp.objsize = fp.fptr;
        if fp.valid_size > fp.objsize {
            fp.valid_size = fp.objsize;
        }
        fp.sect = 0;
        fp.buf_dirty = false;
        fp.cltbl = None;
        fp.modified = true;
        self.sync(fp)
    }

    /// Flush the file: data window, then the directory entry (size, start
    /// cluster, timestamp, archive bit), then FAT and FSInfo.
    pub fn sync(&mut self, fp: &mut File) -> FsResult<()> {
        self.validate_file(fp)?;
        if !fp.modified {
            return Ok(());
        }
        self.flush_file_window(fp)?;

        let now = self.clock.now();
        if self.kind == FatKind::Exfat {
            let mut host = self.root_dir_obj();
            host.sclust = fp.e_dir_sclust;
            host.clust = fp.e_dir_sclust;
            host.stat = fp.e_dir_stat;
            host.objsize = fp.e_dir_size;
            self.dir_sdi(&mut host, fp.e_blk_ofs)?;
            self.load_xdir(&mut host)?;
            self.dirbuf[XDIR_ATTR] |= ATTR_ARCHIVE;
            self.dirbuf[XDIR_GENFLAGS] = if fp.stat == ChainStat::Contiguous {
                crate::entry::XDIR_ALLOC_POSSIBLE | XDIR_CONTIGUOUS
            } else {
                crate::entry::XDIR_ALLOC_POSSIBLE
            };
            crate::write_le_u32(&mut self.dirbuf[XDIR_FSTCLUS..], fp.sclust);
            crate::write_le_u64(&mut self.dirbuf[crate::entry::XDIR_FILESIZE..], fp.objsize);
            crate::write_le_u64(&mut self.dirbuf[XDIR_VALIDFILESIZE..], fp.valid_size);
            crate::write_le_u32(&mut self.dirbuf[XDIR_MODTIME..], now);
            self.store_xdir(&host)?;
        } else {
            self.move_window(fp.dir_sect)?;
            let ofs = fp.dir_ofs as usize % self.ssize;
            let mut ent = [0u8; 32];
            ent.copy_from_slice(&self.win[ofs..ofs + 32]);
            let mut sde = ShortDirEntry::from_bytes(&ent);
            sde.set_attr(sde.attr() | ATTR_ARCHIVE);
            sde.set_first_cluster(fp.sclust);
            sde.set_file_size(fp.objsize as u32);
            sde.set_modify_time(now);
            let bytes = sde.to_bytes_array();
            self.win_write(ofs, &bytes);
        }
        self.sync_fs()?;
        fp.modified = false;
        Ok(())
    }

    /// Pump file content into `sink` without an intermediate caller
    /// buffer. The sink returns how many of the offered bytes it took; a
    /// short count ends the transfer.
    pub fn forward(
        &mut self,
        fp: &mut File,
        sink: &mut dyn FnMut(&[u8]) -> usize,
        mut btf: u64,
    ) -> FsResult<u64> {
        self.validate_file(fp)?;
        if !fp.mode.contains(OpenMode::READ) {
            return Err(FsError::Denied);
        }
        if btf > fp.objsize - fp.fptr.min(fp.objsize) {
            btf = fp.objsize - fp.fptr.min(fp.objsize);
        }
        let ssize = self.ssize as u64;
        let mut sent = 0u64;
        while btf > 0 {
            let in_sect = (fp.fptr % ssize) as usize;
            if in_sect == 0 {
                let csect = (fp.fptr / ssize) % self.csize as u64;
                if csect == 0 {
                    let clst = if fp.fptr == 0 {
                        fp.sclust
                    } else {
                        match self.next_cluster_read(fp)? {
                            Some(c) => c,
                            None => return Err(fp.abort(FsError::IntErr)),
                        }
                    };
                    if clst < 2 || clst >= self.n_fatent {
                        return Err(fp.abort(FsError::IntErr));
                    }
                    fp.clust = clst;
                }
            }
            let csect = (fp.fptr / ssize) % self.csize as u64;
            let sect = self.clst2sect(fp.clust) + csect;
            self.load_file_window(fp, sect, false)
                .map_err(|e| fp.abort(e))?;
            let n = ((ssize - fp.fptr % ssize) as u64).min(btf) as usize;
            let in_sect = (fp.fptr % ssize) as usize;
            let accepted = sink(&fp.buf[in_sect..in_sect + n]);
            let accepted = accepted.min(n);
            fp.fptr += accepted as u64;
            sent += accepted as u64;
            btf -= accepted as u64;
            if accepted < n {
                break; // sink is saturated
            }
        }
        Ok(sent)
    }

    /// Preallocate `fsz` bytes for an empty file. With `contiguous` the
    /// whole allocation must be one run; on exFAT it is recorded as a
    /// no-FAT-chain object with a zero valid length.
    pub fn expand(&mut self, fp: &mut File, fsz: u64, contiguous: bool) -> FsResult<()> {
        self.validate_file(fp)?;
        if !fp.writable() {
            return Err(FsError::Denied);
        }
        if fsz == 0 {
            return Err(FsError::InvalidParameter);
        }
        if fp.sclust != 0 || fp.objsize != 0 || fp.fptr != 0 {
            return Err(FsError::Denied);
        }
        if self.kind != FatKind::Exfat && fsz > MAX_FILE_SIZE_FAT {
            return Err(FsError::InvalidParameter);
        }
        self.set_dirty()?;
        let bcs = self.cluster_bytes();
        let n = ((fsz + bcs - 1) / bcs) as u32;

        if contiguous {
            let first = self.alloc_contiguous(n, self.kind != FatKind::Exfat)?;
            if first == 0 {
                return Err(FsError::Denied);
            }
            fp.sclust = first;
            fp.stat = if self.kind == FatKind::Exfat {
                ChainStat::Contiguous
            } else {
                ChainStat::Fragmented
            };
        } else {
            let mut prev = 0u32;
            let mut first = 0u32;
            for _ in 0..n {
                let c = self.create_chain(prev)?;
                if c == 0 {
                    if first != 0 {
                        self.remove_chain(first, 0)?;
                    }
                    return Err(FsError::Denied);
                }
                if first == 0 {
                    first = c;
                }
                prev = c;
            }
            fp.sclust = first;
            fp.stat = ChainStat::Fragmented;
        }

        fp.objsize = fsz;
        if self.kind == FatKind::Exfat {
            fp.valid_size = 0;
        } else {
            // FAT has no valid-length concept, so the preallocated
            // content must really be zeros for reads to see zeros
            fp.valid_size = fsz;
            let zeros = vec![0u8; self.ssize];
            for ci in 0..n {
                let c = self.cluster_at(fp, ci)?;
                let base = self.clst2sect(c);
                for s in 0..self.csize as u64 {
                    self.device
                        .write_sectors(&zeros, base + s, 1)
                        .map_err(|_| FsError::DiskErr)?;
                }
            }
        }
        fp.modified = true;
        self.sync(fp)
    }

    /// Build the fast-seek cluster link map by walking the chain once;
    /// subsequent seeks become table lookups.
    pub fn set_linkmap(&mut self, fp: &mut File) -> FsResult<()> {
        self.validate_file(fp)?;
        if fp.sclust == 0 {
            fp.cltbl = Some(Vec::new());
            return Ok(());
        }
        if fp.stat == ChainStat::Contiguous {
            let bcs = self.cluster_bytes();
            let n = ((fp.objsize + bcs - 1) / bcs) as u32;
            fp.cltbl = Some(vec![(n, fp.sclust)]);
            return Ok(());
        }
        let mut tbl: Vec<(u32, u32)> = Vec::new();
        let mut frag_first = fp.sclust;
        let mut frag_len = 1u32;
        let mut clu = fp.sclust;
        let mut hops = 0u32;
        loop {
            match self.chain_next(clu)? {
                Some(next) => {
                    if next == clu + 1 {
                        frag_len += 1;
                    } else {
                        tbl.push((frag_len, frag_first));
                        frag_first = next;
                        frag_len = 1;
                    }
                    clu = next;
                    hops += 1;
                    if hops > self.n_fatent - 2 {
                        return Err(FsError::IntErr);
                    }
                }
                None => {
                    tbl.push((frag_len, frag_first));
                    break;
                }
            }
        }
        fp.cltbl = Some(tbl);
        Ok(())
    }
}

fn round_down(v: u64, to: u64) -> u64 {
    v - v % to
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_mode_bits() {
        assert!(OpenMode::OPEN_APPEND.contains(OpenMode::OPEN_ALWAYS));
        assert_eq!(OpenMode::empty().bits(), 0);
        assert_eq!((OpenMode::READ | OpenMode::WRITE).bits(), 0x03);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_down(1023, 512), 512);
        assert_eq!(round_down(1024, 512), 1024);
        assert_eq!(round_down(0, 512), 0);
    }
}
