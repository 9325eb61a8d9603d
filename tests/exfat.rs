//! exFAT behavior on a RAM disk: recognition with boot checksum, entry
//! sets, name hashes, the allocation bitmap, and no-FAT-chain files.

use std::sync::Arc;

use fatx::device::RamDisk;
use fatx::file::OpenMode;
use fatx::fs::{FatKind, Volume};
use fatx::mkfs::{mkfs, FormatKind, FormatOptions};
use fatx::FsError;

const MIB: u64 = 1024 * 1024;

fn exfat_volume() -> (Arc<RamDisk>, Volume) {
    let disk = Arc::new(RamDisk::new(131072, 512)); // 64 MiB
    mkfs(
        disk.as_ref(),
        &FormatOptions {
            fmt: FormatKind::Exfat,
            sfd: true,
            ..FormatOptions::default()
        },
    )
    .unwrap();
    let vol = Volume::mount(disk.clone(), 0).unwrap();
    assert_eq!(vol.kind(), FatKind::Exfat);
    (disk, vol)
}

/// Find the entry set (file + stream + names) for a file whose stream
/// entry records `data_len`, returning (offset of 0x85 entry, set bytes).
fn find_entry_set(image: &[u8], data_len: u64) -> (usize, Vec<u8>) {
    for at in (0..image.len() - 64).step_by(32) {
        if image[at] == 0x85 && image[at + 32] == 0xC0 {
            let dl = u64::from_le_bytes(image[at + 32 + 24..at + 32 + 32].try_into().unwrap());
            if dl == data_len {
                let n = image[at + 1] as usize + 1;
                return (at, image[at..at + n * 32].to_vec());
            }
        }
    }
    panic!("entry set with data length {} not found", data_len);
}

fn set_checksum(set: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for (i, &b) in set.iter().enumerate() {
        if i == 2 || i == 3 {
            continue;
        }
        sum = (if sum & 1 != 0 { 0x8000u16 } else { 0 })
            .wrapping_add(sum >> 1)
            .wrapping_add(b as u16);
    }
    sum
}

fn name_hash_ascii_upper(name: &str) -> u16 {
    let mut sum: u16 = 0;
    for unit in name.encode_utf16() {
        let up = if (0x61..=0x7A).contains(&unit) {
            unit - 0x20
        } else {
            unit
        };
        for b in [up as u8, (up >> 8) as u8] {
            sum = (if sum & 1 != 0 { 0x8000u16 } else { 0 })
                .wrapping_add(sum >> 1)
                .wrapping_add(b as u16);
        }
    }
    sum
}

#[test]
fn mount_and_round_trip() {
    let (_disk, mut vol) = exfat_volume();
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 233) as u8).collect();
    let mut f = vol
        .open(
            "0:/data file with a long-ish name.bin",
            OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW,
        )
        .unwrap();
    assert_eq!(vol.write(&mut f, &payload).unwrap(), payload.len());
    vol.close(&mut f).unwrap();

    let info = vol.stat("0:/data file with a long-ish name.bin").unwrap();
    assert_eq!(info.fsize, 100_000);
    assert_eq!(info.fname, "data file with a long-ish name.bin");

    let mut f = vol
        .open("0:/data file with a long-ish name.bin", OpenMode::READ)
        .unwrap();
    let mut back = vec![0u8; payload.len()];
    assert_eq!(vol.read(&mut f, &mut back).unwrap(), payload.len());
    assert_eq!(back, payload);
    vol.close(&mut f).unwrap();

    // survives remount, which re-verifies the boot checksum
    let disk = vol.unmount().unwrap();
    let mut vol = Volume::mount(disk, 0).unwrap();
    assert!(vol.stat("0:/data file with a long-ish name.bin").is_ok());
}

#[test]
fn entry_set_checksum_and_name_hash_are_bit_exact() {
    let (disk, mut vol) = exfat_volume();
    let name = "Hash Me Properly.txt";
    let mut f = vol
        .open(&format!("0:/{}", name), OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut f, &[7u8; 777]).unwrap();
    vol.close(&mut f).unwrap();

    let image = disk.snapshot();
    let (_at, set) = find_entry_set(&image, 777);

    // stored set checksum equals the recomputed one
    let stored = u16::from_le_bytes([set[2], set[3]]);
    assert_eq!(stored, set_checksum(&set));

    // stored name hash equals the hash of the up-cased name
    let hash = u16::from_le_bytes([set[32 + 4], set[32 + 5]]);
    assert_eq!(hash, name_hash_ascii_upper(name));

    // name length and the name entries themselves
    assert_eq!(set[32 + 3] as usize, name.encode_utf16().count());
    assert_eq!(set[64], 0xC1);

    // and the lookup actually uses the folded form
    assert!(vol.stat("0:/HASH ME PROPERLY.TXT").is_ok());
    assert!(vol.stat("0:/hash me properly.txt").is_ok());
}

#[test]
fn contiguous_expand_semantics() {
    let (disk, mut vol) = exfat_volume();
    let mut f = vol
        .open(
            "0:/big.bin",
            OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW,
        )
        .unwrap();
    vol.expand(&mut f, 16 * MIB, true).unwrap();
    assert_eq!(f.size(), 16 * MIB);

    // reads of the unwritten region come back as zeros
    let mut buf = vec![0xFFu8; 4096];
    vol.lseek(&mut f, 0).unwrap();
    assert_eq!(vol.read(&mut f, &mut buf).unwrap(), 4096);
    assert!(buf.iter().all(|&b| b == 0));

    // stream entry: no-FAT-chain set, valid length 0, data length 16 MiB
    let image = disk.snapshot();
    let (_, set) = find_entry_set(&image, 16 * MIB);
    assert_ne!(set[32 + 1] & 0x02, 0, "NoFatChain must be set");
    let valid = u64::from_le_bytes(set[32 + 8..32 + 16].try_into().unwrap());
    assert_eq!(valid, 0);

    // writing one byte at offset 0 keeps the file contiguous
    vol.lseek(&mut f, 0).unwrap();
    vol.write(&mut f, b"A").unwrap();
    vol.sync(&mut f).unwrap();
    let image = disk.snapshot();
    let (_, set) = find_entry_set(&image, 16 * MIB);
    assert_ne!(set[32 + 1] & 0x02, 0, "flag must survive a front write");
    let valid = u64::from_le_bytes(set[32 + 8..32 + 16].try_into().unwrap());
    assert_eq!(valid, 1);
    let first_clu = u32::from_le_bytes(set[32 + 20..32 + 24].try_into().unwrap());

    // writing beyond the valid length materialises the chain
    vol.lseek(&mut f, 8 * MIB).unwrap();
    vol.write(&mut f, b"B").unwrap();
    vol.sync(&mut f).unwrap();
    let image = disk.snapshot();
    let (_, set) = find_entry_set(&image, 16 * MIB);
    assert_eq!(set[32 + 1] & 0x02, 0, "NoFatChain must be cleared");

    // the FAT now records the sequential chain (fat offset 32 on this
    // super-floppy format)
    let cell = |clu: u32| {
        let ofs = 32 * 512 + clu as usize * 4;
        u32::from_le_bytes(image[ofs..ofs + 4].try_into().unwrap())
    };
    assert_eq!(cell(first_clu), first_clu + 1);
    assert_eq!(cell(first_clu + 1), first_clu + 2);

    // content checks across the hole
    vol.lseek(&mut f, 0).unwrap();
    let mut head = [0u8; 2];
    vol.read(&mut f, &mut head).unwrap();
    assert_eq!(&head, b"A\0");
    vol.lseek(&mut f, 8 * MIB - 1).unwrap();
    let mut mid = [0u8; 3];
    vol.read(&mut f, &mut mid).unwrap();
    assert_eq!(&mid, b"\0B\0");
    vol.close(&mut f).unwrap();
}

#[test]
fn expand_without_room_fails() {
    let (_disk, mut vol) = exfat_volume();
    let mut f = vol
        .open(
            "0:/toobig.bin",
            OpenMode::WRITE | OpenMode::CREATE_NEW,
        )
        .unwrap();
    assert_eq!(vol.expand(&mut f, 10_000 * MIB, true), Err(FsError::Denied));
    vol.close(&mut f).unwrap();
}

#[test]
fn directories_and_namespace_ops() {
    let (_disk, mut vol) = exfat_volume();
    vol.mkdir("0:/tree").unwrap();
    vol.mkdir("0:/tree/branch").unwrap();
    assert_eq!(vol.mkdir("0:/tree"), Err(FsError::Exist));

    let mut f = vol
        .open(
            "0:/tree/branch/leaf.txt",
            OpenMode::WRITE | OpenMode::CREATE_NEW,
        )
        .unwrap();
    vol.write(&mut f, b"leafy").unwrap();
    vol.close(&mut f).unwrap();

    // dot-dot folds textually on exFAT (no dot entries on disk)
    vol.chdir("0:/tree/branch").unwrap();
    assert_eq!(vol.getcwd().unwrap(), "/tree/branch");
    assert!(vol.stat("leaf.txt").is_ok());
    assert!(vol.stat("../branch/leaf.txt").is_ok());
    vol.chdir("..").unwrap();
    assert_eq!(vol.getcwd().unwrap(), "/tree");
    vol.chdir("/").unwrap();

    vol.rename("0:/tree/branch/leaf.txt", "0:/leaf2.txt").unwrap();
    let info = vol.stat("0:/leaf2.txt").unwrap();
    assert_eq!(info.fsize, 5);
    assert_eq!(vol.stat("0:/tree/branch/leaf.txt").err(), Some(FsError::NoFile));

    assert_eq!(vol.unlink("0:/tree"), Err(FsError::Denied)); // not empty
    vol.unlink("0:/tree/branch").unwrap();
    vol.unlink("0:/tree").unwrap();
    assert_eq!(vol.unlink("0:/tree"), Err(FsError::NoFile));
}

#[test]
fn free_space_accounting_via_bitmap() {
    let (_disk, mut vol) = exfat_volume();
    let free0 = vol.getfree().unwrap();
    assert!(free0 > 0);

    let csz = vol.cluster_size() as usize;
    let mut f = vol
        .open("0:/three.bin", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.write(&mut f, &vec![9u8; 3 * csz]).unwrap();
    vol.close(&mut f).unwrap();
    assert_eq!(vol.getfree().unwrap(), free0 - 3);

    vol.unlink("0:/three.bin").unwrap();
    assert_eq!(vol.getfree().unwrap(), free0);

    // recomputed from the bitmap after remount
    let disk = vol.unmount().unwrap();
    let mut vol = Volume::mount(disk, 0).unwrap();
    assert_eq!(vol.getfree().unwrap(), free0);
}

#[test]
fn exfat_volume_label() {
    let (_disk, mut vol) = exfat_volume();
    assert_eq!(vol.getlabel().unwrap().0, "");
    vol.setlabel("ARCHIVE").unwrap();
    assert_eq!(vol.getlabel().unwrap().0, "ARCHIVE");
    vol.setlabel("").unwrap();
    assert_eq!(vol.getlabel().unwrap().0, "");
}
