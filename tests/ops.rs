//! Namespace and object-layer behavior: rename, mkdir/unlink, holes,
//! truncation, sharing, relative paths and the forward pump.

use std::sync::Arc;

use fatx::device::RamDisk;
use fatx::dir::FileInfo;
use fatx::file::OpenMode;
use fatx::fs::Volume;
use fatx::mkfs::{mkfs, FormatKind, FormatOptions};
use fatx::{FsError, ATTR_READ_ONLY};

fn fat16_volume() -> Volume {
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
    Volume::mount(disk, 0).unwrap()
}

fn put_file(vol: &mut Volume, path: &str, data: &[u8]) {
    let mut f = vol
        .open(path, OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    assert_eq!(vol.write(&mut f, data).unwrap(), data.len());
    vol.close(&mut f).unwrap();
}

fn get_file(vol: &mut Volume, path: &str) -> Vec<u8> {
    let mut f = vol.open(path, OpenMode::READ).unwrap();
    let mut out = vec![0u8; f.size() as usize];
    assert_eq!(vol.read(&mut f, &mut out).unwrap(), out.len());
    vol.close(&mut f).unwrap();
    out
}

#[test]
fn rename_across_directories() {
    let mut vol = fat16_volume();
    vol.mkdir("0:/a").unwrap();
    vol.mkdir("0:/c").unwrap();
    put_file(&mut vol, "0:/a/b.txt", b"moving payload");
    let before = vol.stat("0:/a/b.txt").unwrap();

    // preconditions: source must exist, destination must not
    assert_eq!(
        vol.rename("0:/a/missing.txt", "0:/c/d.txt"),
        Err(FsError::NoFile)
    );
    assert_eq!(
        vol.rename("0:/a/b.txt", "0:/nodir/d.txt"),
        Err(FsError::NoPath)
    );
    put_file(&mut vol, "0:/c/taken.txt", b"x");
    assert_eq!(
        vol.rename("0:/a/b.txt", "0:/c/taken.txt"),
        Err(FsError::Exist)
    );

    vol.rename("0:/a/b.txt", "0:/c/d.txt").unwrap();
    assert_eq!(vol.stat("0:/a/b.txt").err(), Some(FsError::NoFile));
    let after = vol.stat("0:/c/d.txt").unwrap();
    assert_eq!(after.fsize, before.fsize);
    assert_eq!(get_file(&mut vol, "0:/c/d.txt"), b"moving payload");

    // directories move too, and keep working afterwards
    put_file(&mut vol, "0:/a/inner.txt", b"inner");
    vol.rename("0:/a", "0:/c/a2").unwrap();
    assert_eq!(get_file(&mut vol, "0:/c/a2/inner.txt"), b"inner");
    // the moved directory's dot-dot now points at the new parent
    vol.chdir("0:/c/a2").unwrap();
    vol.chdir("..").unwrap();
    assert_eq!(vol.getcwd().unwrap(), "/c");
}

#[test]
fn mkdir_and_unlink_report_second_attempts() {
    let mut vol = fat16_volume();
    vol.mkdir("0:/dir").unwrap();
    assert_eq!(vol.mkdir("0:/dir"), Err(FsError::Exist));

    put_file(&mut vol, "0:/dir/f.txt", b"1");
    // a populated directory refuses to go
    assert_eq!(vol.unlink("0:/dir"), Err(FsError::Denied));
    vol.unlink("0:/dir/f.txt").unwrap();
    assert_eq!(vol.unlink("0:/dir/f.txt"), Err(FsError::NoFile));
    vol.unlink("0:/dir").unwrap();
    assert_eq!(vol.unlink("0:/dir"), Err(FsError::NoFile));
}

#[test]
fn seek_past_end_reads_back_zeros() {
    let mut vol = fat16_volume();
    let mut f = vol
        .open(
            "0:/hole.bin",
            OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW,
        )
        .unwrap();
    vol.write(&mut f, b"AB").unwrap();
    // far past the end, across several 2 KiB clusters
    vol.lseek(&mut f, 10_000).unwrap();
    vol.write(&mut f, b"Z").unwrap();
    assert_eq!(f.size(), 10_001);
    vol.close(&mut f).unwrap();

    let data = get_file(&mut vol, "0:/hole.bin");
    assert_eq!(&data[..2], b"AB");
    assert!(data[2..10_000].iter().all(|&b| b == 0));
    assert_eq!(data[10_000], b'Z');
}

#[test]
fn truncate_releases_tail_clusters() {
    let mut vol = fat16_volume();
    let payload: Vec<u8> = (0..16384u32).map(|i| i as u8).collect();
    put_file(&mut vol, "0:/t.bin", &payload);
    let free_small = vol.getfree().unwrap();

    let mut f = vol
        .open("0:/t.bin", OpenMode::READ | OpenMode::WRITE)
        .unwrap();
    vol.lseek(&mut f, 3000).unwrap();
    vol.truncate(&mut f).unwrap();
    assert_eq!(f.size(), 3000);
    vol.close(&mut f).unwrap();

    // 16 KiB used 8 clusters, 3000 bytes need 2
    assert_eq!(vol.getfree().unwrap(), free_small + 6);
    let data = get_file(&mut vol, "0:/t.bin");
    assert_eq!(&data[..], &payload[..3000]);

    // truncate at zero frees everything
    let mut f = vol
        .open("0:/t.bin", OpenMode::READ | OpenMode::WRITE)
        .unwrap();
    vol.truncate(&mut f).unwrap();
    assert_eq!(f.size(), 0);
    vol.close(&mut f).unwrap();
    assert_eq!(vol.getfree().unwrap(), free_small + 8);
}

#[test]
fn sharing_policy() {
    let mut vol = fat16_volume();
    put_file(&mut vol, "0:/shared.txt", b"data");

    let mut r1 = vol.open("0:/shared.txt", OpenMode::READ).unwrap();
    let mut r2 = vol.open("0:/shared.txt", OpenMode::READ).unwrap();

    // readers exclude writers
    assert_eq!(
        vol.open("0:/shared.txt", OpenMode::READ | OpenMode::WRITE)
            .err(),
        Some(FsError::Locked)
    );
    // and an open file cannot be unlinked or renamed away
    assert_eq!(vol.unlink("0:/shared.txt"), Err(FsError::Locked));
    assert_eq!(
        vol.rename("0:/shared.txt", "0:/other.txt"),
        Err(FsError::Locked)
    );

    vol.close(&mut r1).unwrap();
    vol.close(&mut r2).unwrap();

    let mut w = vol
        .open("0:/shared.txt", OpenMode::READ | OpenMode::WRITE)
        .unwrap();
    assert_eq!(
        vol.open("0:/shared.txt", OpenMode::READ).err(),
        Some(FsError::Locked)
    );
    vol.close(&mut w).unwrap();
    vol.unlink("0:/shared.txt").unwrap();
}

#[test]
fn read_only_attribute_denies_writes() {
    let mut vol = fat16_volume();
    put_file(&mut vol, "0:/ro.txt", b"locked");
    vol.chmod("0:/ro.txt", ATTR_READ_ONLY, ATTR_READ_ONLY).unwrap();
    assert_eq!(
        vol.open("0:/ro.txt", OpenMode::READ | OpenMode::WRITE).err(),
        Some(FsError::Denied)
    );
    assert_eq!(vol.unlink("0:/ro.txt"), Err(FsError::Denied));
    vol.chmod("0:/ro.txt", 0, ATTR_READ_ONLY).unwrap();
    vol.unlink("0:/ro.txt").unwrap();
}

#[test]
fn utime_sets_stamp() {
    let mut vol = fat16_volume();
    put_file(&mut vol, "0:/dated.txt", b"x");
    let stamp = FileInfo {
        fdate: ((2021 - 1980) << 9 | 6 << 5 | 15) as u16,
        ftime: (13 << 11 | 37 << 5 | 21) as u16,
        ..FileInfo::default()
    };
    vol.utime("0:/dated.txt", &stamp).unwrap();
    let info = vol.stat("0:/dated.txt").unwrap();
    assert_eq!(info.fdate, stamp.fdate);
    assert_eq!(info.ftime, stamp.ftime);
}

#[test]
fn current_directory_navigation() {
    let mut vol = fat16_volume();
    vol.mkdir("0:/a").unwrap();
    vol.mkdir("0:/a/b").unwrap();
    put_file(&mut vol, "0:/a/b/deep.txt", b"deep");

    assert_eq!(vol.getcwd().unwrap(), "/");
    vol.chdir("0:/a/b").unwrap();
    assert_eq!(vol.getcwd().unwrap(), "/a/b");

    // relative lookups resolve against the current directory
    assert_eq!(get_file(&mut vol, "deep.txt"), b"deep");
    put_file(&mut vol, "rel.txt", b"rel");
    assert!(vol.stat("0:/a/b/rel.txt").is_ok());

    // dot-dot climbs through the on-disk parent entries
    vol.chdir("..").unwrap();
    assert_eq!(vol.getcwd().unwrap(), "/a");
    assert!(vol.stat("b/deep.txt").is_ok());
    vol.chdir("/").unwrap();
    assert_eq!(vol.getcwd().unwrap(), "/");

    // a directory that is current cannot be removed
    vol.chdir("0:/a/b").unwrap();
    assert_eq!(vol.unlink("0:/a/b").err(), Some(FsError::Denied));
}

#[test]
fn forward_pumps_through_sink() {
    let mut vol = fat16_volume();
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    put_file(&mut vol, "0:/fwd.bin", &payload);

    let mut f = vol.open("0:/fwd.bin", OpenMode::READ).unwrap();
    let mut collected = Vec::new();
    let mut sink = |chunk: &[u8]| {
        collected.extend_from_slice(chunk);
        chunk.len()
    };
    let sent = vol.forward(&mut f, &mut sink, 5000).unwrap();
    assert_eq!(sent, 5000);
    assert_eq!(collected, payload);

    // a saturated sink stops the transfer early
    vol.lseek(&mut f, 0).unwrap();
    let mut taken = 0usize;
    let mut slow_sink = |chunk: &[u8]| {
        let n = chunk.len().min(100 - taken.min(100));
        taken += n;
        n
    };
    let sent = vol.forward(&mut f, &mut slow_sink, 5000).unwrap();
    assert_eq!(sent, 100);
    assert_eq!(f.tell(), 100);
    vol.close(&mut f).unwrap();
}

#[test]
fn directory_grows_past_one_cluster() {
    let mut vol = fat16_volume();
    vol.mkdir("0:/many").unwrap();
    // 2 KiB cluster = 64 entries; dot entries take two, each short-named
    // file takes one
    for i in 0..150 {
        put_file(&mut vol, &format!("0:/many/F{:03}.TXT", i), b"x");
    }
    let mut dir = vol.opendir("0:/many").unwrap();
    let mut seen = 0;
    while vol.readdir(&mut dir).unwrap().is_some() {
        seen += 1;
    }
    vol.closedir(&mut dir).unwrap();
    assert_eq!(seen, 150);
    for i in [0usize, 63, 64, 149] {
        assert!(vol.stat(&format!("0:/many/F{:03}.TXT", i)).is_ok());
    }
}

#[test]
fn readdir_lists_fresh_subdirectory_as_empty() {
    let mut vol = fat16_volume();
    vol.mkdir("0:/empty").unwrap();
    let mut dir = vol.opendir("0:/empty").unwrap();
    // dot entries are administrative and never surface
    assert!(vol.readdir(&mut dir).unwrap().is_none());
    vol.closedir(&mut dir).unwrap();

    let mut dir = vol.opendir("0:/empty").unwrap();
    assert!(vol.readdir(&mut dir).unwrap().is_none());
    vol.rewinddir(&mut dir).unwrap();
    assert!(vol.readdir(&mut dir).unwrap().is_none());
    vol.closedir(&mut dir).unwrap();
}

#[test]
fn expand_preallocates_fat_files() {
    let mut vol = fat16_volume();
    let free0 = vol.getfree().unwrap();
    let mut f = vol
        .open(
            "0:/grow.bin",
            OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW,
        )
        .unwrap();
    vol.expand(&mut f, 10 * 2048, true).unwrap();
    assert_eq!(f.size(), 10 * 2048);
    // preallocated space reads as zeros
    let mut buf = vec![0xFFu8; 4096];
    vol.lseek(&mut f, 0).unwrap();
    vol.read(&mut f, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    vol.close(&mut f).unwrap();
    assert_eq!(vol.getfree().unwrap(), free0 - 10);
    vol.unlink("0:/grow.bin").unwrap();
    assert_eq!(vol.getfree().unwrap(), free0);
}
