//! Long/short name behavior on a FAT32 RAM disk: shadow entries, alias
//! generation, checksums, case folding, validation and globbing.

use std::sync::Arc;

use fatx::device::RamDisk;
use fatx::file::OpenMode;
use fatx::fs::{FatKind, Volume};
use fatx::mkfs::{mkfs, FormatKind, FormatOptions};
use fatx::{FsError, ATTR_LONG_NAME};

fn fat32_volume() -> (Arc<RamDisk>, Volume) {
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
    let vol = Volume::mount(disk.clone(), 0).unwrap();
    assert_eq!(vol.kind(), FatKind::Fat32);
    (disk, vol)
}

fn alias_charset_ok(alias: &str) -> bool {
    // ^[A-Z0-9~]{1,8}(\.[A-Z0-9]{1,3})?$
    let (body, ext) = match alias.split_once('.') {
        Some((b, e)) => (b, Some(e)),
        None => (alias, None),
    };
    if body.is_empty() || body.len() > 8 {
        return false;
    }
    if !body
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '~')
    {
        return false;
    }
    match ext {
        None => true,
        Some(e) => {
            !e.is_empty()
                && e.len() <= 3
                && e.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        }
    }
}

fn sfn_sum(name11: &[u8]) -> u8 {
    let mut sum: u8 = 0;
    for &b in name11 {
        sum = (if sum & 1 != 0 { 0x80u8 } else { 0 })
            .wrapping_add(sum >> 1)
            .wrapping_add(b);
    }
    sum
}

#[test]
fn lfn_and_sfn_coexist() {
    let (disk, mut vol) = fat32_volume();
    let name = "Über lange Datei.txt";
    let mut f = vol
        .open(&format!("0:/{}", name), OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut f, b"payload").unwrap();
    vol.close(&mut f).unwrap();

    // readdir reports the long name and a well-formed 8.3 alias
    let mut dir = vol.opendir("0:/").unwrap();
    let info = vol.readdir(&mut dir).unwrap().expect("one entry");
    assert!(vol.readdir(&mut dir).unwrap().is_none());
    vol.closedir(&mut dir).unwrap();
    assert_eq!(info.fname, name);
    assert!(
        alias_charset_ok(&info.altname),
        "alias {:?} out of shape",
        info.altname
    );
    assert_eq!(info.fsize, 7);

    // on disk: every shadow entry carries the checksum of the alias, and
    // the fragments reassemble to the long name
    let image = disk.snapshot();
    let sfn_pos = image
        .windows(6)
        .position(|w| w == b"BERLAN")
        .expect("alias on disk");
    let name11 = &image[sfn_pos..sfn_pos + 11];
    let sum = sfn_sum(name11);

    let mut units: Vec<u16> = Vec::new();
    let mut n_lfn = 0;
    let mut at = sfn_pos - 32;
    loop {
        let ent = &image[at..at + 32];
        if ent[11] != ATTR_LONG_NAME {
            break;
        }
        assert_eq!(ent[13], sum, "shadow checksum mismatch");
        n_lfn += 1;
        // walking upward meets ord 1 first, so fragments arrive in
        // ascending order
        for ofs in [1usize, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30] {
            units.push(u16::from_le_bytes([ent[ofs], ent[ofs + 1]]));
        }
        if at < 32 {
            break;
        }
        at -= 32;
    }
    assert_eq!(n_lfn, 2, "20 code units need two shadow entries");
    while matches!(units.last(), Some(&0) | Some(&0xFFFF)) {
        units.pop();
    }
    assert_eq!(String::from_utf16(&units).unwrap(), name);

    // lookup folds case through the up-case mapping
    assert!(vol.stat("0:/über lange datei.TXT").is_ok());
    assert!(vol.stat(&format!("0:/{}", info.altname)).is_ok());
}

#[test]
fn numeric_tails_disambiguate() {
    let (_disk, mut vol) = fat32_volume();
    let mut aliases = Vec::new();
    for i in 0..3 {
        let path = format!("0:/long name collision {}.txt", i);
        let mut f = vol
            .open(&path, OpenMode::WRITE | OpenMode::CREATE_NEW)
            .unwrap();
        vol.close(&mut f).unwrap();
        let info = vol.stat(&path).unwrap();
        assert!(
            alias_charset_ok(&info.altname),
            "alias {:?} out of shape",
            info.altname
        );
        assert!(info.altname.contains('~'));
        aliases.push(info.altname);
    }
    aliases.sort();
    aliases.dedup();
    assert_eq!(aliases.len(), 3, "aliases must be unique");
}

#[test]
fn name_length_limits() {
    let (_disk, mut vol) = fat32_volume();
    let body: String = std::iter::repeat('x').take(251).collect();
    let name = format!("{}.txt", body); // exactly 255 units
    let mut f = vol
        .open(&format!("0:/{}", name), OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.close(&mut f).unwrap();
    let info = vol.stat(&format!("0:/{}", name)).unwrap();
    assert_eq!(info.fname.len(), 255);

    let too_long = format!("x{}", name); // 256 units
    assert_eq!(
        vol.open(&format!("0:/{}", too_long), OpenMode::WRITE | OpenMode::CREATE_NEW)
            .err(),
        Some(FsError::InvalidName)
    );
}

#[test]
fn invalid_names_are_rejected() {
    let (_disk, mut vol) = fat32_volume();
    for bad in ["0:/a<b.txt", "0:/a|b", "0:/a\"b", "0:/ques?.txt", "0:/star*"] {
        assert_eq!(
            vol.open(bad, OpenMode::WRITE | OpenMode::CREATE_NEW).err(),
            Some(FsError::InvalidName),
            "{} must be rejected",
            bad
        );
    }
    // reserved device names are not special on FAT
    let mut f = vol
        .open("0:/CON", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.close(&mut f).unwrap();
    // trailing dots and spaces strip away
    let mut f = vol
        .open("0:/trailing. ", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.close(&mut f).unwrap();
    assert!(vol.stat("0:/trailing").is_ok());
}

#[test]
fn find_with_glob() {
    let (_disk, mut vol) = fat32_volume();
    for name in ["notes.txt", "draft.txt", "image.bin", "readme.md"] {
        let mut f = vol
            .open(&format!("0:/{}", name), OpenMode::WRITE | OpenMode::CREATE_NEW)
            .unwrap();
        vol.close(&mut f).unwrap();
    }
    let (mut dir, first) = vol.findfirst("0:/", "*.txt").unwrap();
    let mut found = vec![first.unwrap().fname];
    while let Some(info) = vol.findnext(&mut dir).unwrap() {
        found.push(info.fname);
    }
    vol.closedir(&mut dir).unwrap();
    found.sort();
    assert_eq!(found, ["draft.txt", "notes.txt"]);

    let (mut dir, hit) = vol.findfirst("0:/", "read??.md").unwrap();
    assert_eq!(hit.unwrap().fname, "readme.md");
    vol.closedir(&mut dir).unwrap();
}

#[test]
fn volume_labels() {
    let (_disk, mut vol) = fat32_volume();
    let (label, serial) = vol.getlabel().unwrap();
    assert_eq!(label, "");
    assert_ne!(serial, 0);

    vol.setlabel("MYDISK").unwrap();
    let (label, serial2) = vol.getlabel().unwrap();
    assert_eq!(label, "MYDISK");
    assert_eq!(serial, serial2);

    vol.setlabel("").unwrap();
    assert_eq!(vol.getlabel().unwrap().0, "");

    assert_eq!(vol.setlabel("way too long label"), Err(FsError::InvalidName));
}

#[test]
fn pure_sfn_names_keep_case_hints() {
    let (disk, mut vol) = fat32_volume();
    let mut f = vol
        .open("0:/lower.txt", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.close(&mut f).unwrap();
    let info = vol.stat("0:/lower.txt").unwrap();
    assert_eq!(info.fname, "lower.txt");
    assert_eq!(info.altname, "LOWER.TXT");

    // a case-hinted 8.3 name must not grow shadow entries
    let image = disk.snapshot();
    let pos = image
        .windows(11)
        .position(|w| w == b"LOWER   TXT")
        .unwrap();
    let prev = &image[pos - 32..pos];
    assert_ne!(prev[11], ATTR_LONG_NAME);
}
