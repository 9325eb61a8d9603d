//! Name codec: OEM code page conversion, Unicode case folding, filename
//! validation and 8.3 alias generation.
//!
//! Short names are stored in the OEM code page the system is configured for
//! at the time the entry is created, always upper case. Long names are
//! stored in UTF-16 and preserve their original case; matching is case
//! insensitive through the up-case mapping. When a character cannot be
//! translated into the OEM page the short name becomes lossy and a numeric
//! tail alias is generated instead.

use crate::{FsError, FsResult, MAX_LFN, SPACE};
use alloc::string::String;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::RwLock;

/// OEM code page collaborator. Single-byte pages only; `from_unicode`
/// returns None when the code point has no OEM image.
pub trait OemCodepage: Send + Sync {
    fn id(&self) -> u16;
    fn to_unicode(&self, oem: u8) -> u16;
    fn from_unicode(&self, uni: u16) -> Option<u8>;
}

/// Code page 437 (U.S.), the format-time default of most removable media.
pub struct Cp437;

/// Unicode images of CP437 0x80..=0xFF.
const CP437_HIGH: [u16; 128] = [
    0x00C7, 0x00FC, 0x00E9, 0x00E2, 0x00E4, 0x00E0, 0x00E5, 0x00E7, // 0x80
    0x00EA, 0x00EB, 0x00E8, 0x00EF, 0x00EE, 0x00EC, 0x00C4, 0x00C5, // 0x88
    0x00C9, 0x00E6, 0x00C6, 0x00F4, 0x00F6, 0x00F2, 0x00FB, 0x00F9, // 0x90
    0x00FF, 0x00D6, 0x00DC, 0x00A2, 0x00A3, 0x00A5, 0x20A7, 0x0192, // 0x98
    0x00E1, 0x00ED, 0x00F3, 0x00FA, 0x00F1, 0x00D1, 0x00AA, 0x00BA, // 0xA0
    0x00BF, 0x2310, 0x00AC, 0x00BD, 0x00BC, 0x00A1, 0x00AB, 0x00BB, // 0xA8
    0x2591, 0x2592, 0x2593, 0x2502, 0x2524, 0x2561, 0x2562, 0x2556, // 0xB0
    0x2555, 0x2563, 0x2551, 0x2557, 0x255D, 0x255C, 0x255B, 0x2510, // 0xB8
    0x2514, 0x2534, 0x252C, 0x251C, 0x2500, 0x253C, 0x255E, 0x255F, // 0xC0
    0x255A, 0x2554, 0x2569, 0x2566, 0x2560, 0x2550, 0x256C, 0x2567, // 0xC8
    0x2568, 0x2564, 0x2565, 0x2559, 0x2558, 0x2552, 0x2553, 0x256B, // 0xD0
    0x256A, 0x2518, 0x250C, 0x2588, 0x2584, 0x258C, 0x2590, 0x2580, // 0xD8
    0x03B1, 0x00DF, 0x0393, 0x03C0, 0x03A3, 0x03C3, 0x00B5, 0x03C4, // 0xE0
    0x03A6, 0x0398, 0x03A9, 0x03B4, 0x221E, 0x03C6, 0x03B5, 0x2229, // 0xE8
    0x2261, 0x00B1, 0x2265, 0x2264, 0x2320, 0x2321, 0x00F7, 0x2248, // 0xF0
    0x00B0, 0x2219, 0x00B7, 0x221A, 0x207F, 0x00B2, 0x25A0, 0x00A0, // 0xF8
];

impl OemCodepage for Cp437 {
    fn id(&self) -> u16 {
        437
    }

    fn to_unicode(&self, oem: u8) -> u16 {
        if oem < 0x80 {
            oem as u16
        } else {
            CP437_HIGH[(oem - 0x80) as usize]
        }
    }

    fn from_unicode(&self, uni: u16) -> Option<u8> {
        if uni < 0x80 {
            return Some(uni as u8);
        }
        CP437_HIGH
            .iter()
            .position(|&u| u == uni)
            .map(|i| (i + 0x80) as u8)
    }
}

static CP437: Cp437 = Cp437;

lazy_static! {
    /// Process-wide active code page, switched by [`setcp`]. The page only
    /// affects how short names are encoded and displayed; long names are
    /// always UTF-16 on disk.
    static ref ACTIVE_CP: RwLock<&'static (dyn OemCodepage)> = RwLock::new(&CP437);
}

/// Select the active OEM code page. Only the built-in page 437 ships with
/// the crate; an embedder can register another table with
/// [`set_codepage_table`].
pub fn setcp(cp: u16) -> FsResult<()> {
    if cp == 437 {
        *ACTIVE_CP.write() = &CP437;
        Ok(())
    } else {
        Err(FsError::InvalidParameter)
    }
}

/// Install a caller-provided code page table.
pub fn set_codepage_table(table: &'static dyn OemCodepage) {
    *ACTIVE_CP.write() = table;
}

pub(crate) fn codepage() -> &'static dyn OemCodepage {
    *ACTIVE_CP.read()
}

/// Up-case one BMP code unit for case-insensitive matching. Covers ASCII,
/// Latin-1, Latin Extended-A, Greek and Cyrillic; anything else folds to
/// itself. exFAT volumes override this with the up-case table loaded at
/// mount.
pub fn to_upper(uni: u16) -> u16 {
    match uni {
        // Basic Latin
        0x0061..=0x007A => uni - 0x20,
        // Latin-1 supplement; 0xF7 is the division sign, 0xDF has no
        // single-unit upper form
        0x00E0..=0x00F6 | 0x00F8..=0x00FE => uni - 0x20,
        0x00FF => 0x0178,
        // Latin Extended-A comes in lower/upper pairs
        0x0101..=0x0137 if uni & 1 == 1 => uni - 1,
        0x0139..=0x0148 if uni & 1 == 0 => uni - 1,
        0x014B..=0x0177 if uni & 1 == 1 => uni - 1,
        0x017A | 0x017C | 0x017E => uni - 1,
        // Greek
        0x03B1..=0x03C1 => uni - 0x20,
        0x03C2 => 0x03A3,
        0x03C3..=0x03CB => uni - 0x20,
        0x03AC => 0x0386,
        0x03AD..=0x03AF => uni - 0x25,
        // Cyrillic
        0x0430..=0x044F => uni - 0x20,
        0x0450..=0x045F => uni - 0x50,
        _ => uni,
    }
}

/// Code points never allowed in a long name. Control characters below 0x20
/// are rejected as well.
pub(crate) fn lfn_char_ok(uni: u16) -> bool {
    if uni < 0x20 {
        return false;
    }
    !matches!(
        uni as u8 as char,
        '"' | '*' | '/' | ':' | '<' | '>' | '?' | '\\' | '|'
    ) || uni > 0x7F
}

/// Additionally rejected inside an 8.3 short name.
pub(crate) fn sfn_char_ok(oem: u8) -> bool {
    if oem < 0x20 || oem == 0x7F {
        return false;
    }
    !matches!(
        oem,
        0x22 | 0x2A | 0x2B | 0x2C | 0x2E | 0x2F | 0x3A | 0x3B | 0x3C | 0x3D | 0x3E | 0x3F | 0x5B
            | 0x5C | 0x5D | 0x7C
    )
}

/// Encode a UTF-8 component into UTF-16 units, applying the long-name
/// validity rules: length cap, rejected code points, and the LFN display
/// convention of stripping trailing dots and spaces. Surrogate pairs pass
/// through `encode_utf16` untouched; ill-formed UTF-8 cannot reach here
/// because the input is `&str`.
pub(crate) fn component_to_utf16(component: &str) -> FsResult<Vec<u16>> {
    let mut units: Vec<u16> = component.encode_utf16().collect();
    while let Some(&last) = units.last() {
        if last == SPACE as u16 || last == b'.' as u16 {
            units.pop();
        } else {
            break;
        }
    }
    if units.is_empty() || units.len() > MAX_LFN {
        return Err(FsError::InvalidName);
    }
    for &u in &units {
        // surrogate halves are valid storage units, the pair itself was
        // validated by the str encoding
        if (0xD800..=0xDFFF).contains(&u) {
            continue;
        }
        if !lfn_char_ok(u) {
            return Err(FsError::InvalidName);
        }
    }
    Ok(units)
}

pub(crate) fn utf16_to_string(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

// Name status flags kept in the 12th byte of the SFN scratch.
pub(crate) const NS_LOSS: u8 = 0x01; /* Out of 8.3 format */
pub(crate) const NS_LFN: u8 = 0x02; /* Force to create LFN entry */
pub(crate) const NS_LAST: u8 = 0x04; /* Last segment of the path */
pub(crate) const NS_BODY: u8 = 0x08; /* Lower case flag (body) */
pub(crate) const NS_EXT: u8 = 0x10; /* Lower case flag (ext) */
pub(crate) const NS_DOT: u8 = 0x20; /* Dot entry */
pub(crate) const NS_NOLFN: u8 = 0x40; /* Not to append LFN (in FAT/FAT32) */
pub(crate) const NS_NONAME: u8 = 0x80; /* Not followed */

/// Derive the 8.3 alias candidate for a long name. Returns the 11 padded
/// OEM bytes plus NS flags: `NS_LOSS | NS_LFN` when the name does not fit
/// 8.3 losslessly, case flags when it does but only differs in case.
pub(crate) fn make_sfn(lfn: &[u16]) -> FsResult<([u8; 11], u8)> {
    let mut sfn = [SPACE; 11];
    let mut cf: u8 = 0;

    // split at the last dot; leading dots belong to the body
    let dot = lfn.iter().rposition(|&u| u == b'.' as u16);
    let (body, ext): (&[u16], &[u16]) = match dot {
        Some(0) | None => (lfn, &[]),
        Some(i) => (&lfn[..i], &lfn[i + 1..]),
    };
    if body.iter().any(|&u| u == b'.' as u16) || ext.iter().any(|&u| u == b'.' as u16) {
        // an embedded dot beyond the separator can never fit 8.3
        cf |= NS_LOSS | NS_LFN;
    }

    let mut put = |src: &[u16], dst_ofs: usize, dst_len: usize, cf: &mut u8| {
        let mut di = 0;
        let mut lower = false;
        let mut upper = false;
        for &wc in src {
            if wc == SPACE as u16 {
                // embedded spaces are dropped from the alias
                *cf |= NS_LOSS | NS_LFN;
                continue;
            }
            let up = to_upper(wc);
            if up != wc {
                lower = true;
            } else if (0x41..=0x5A).contains(&wc) {
                upper = true;
            }
            // the alias stays plain ASCII; anything else is dropped and
            // the numeric tail disambiguates
            let oem = if up < 0x80 && sfn_char_ok(up as u8) {
                up as u8
            } else {
                *cf |= NS_LOSS | NS_LFN;
                continue;
            };
            if di >= dst_len {
                *cf |= NS_LOSS | NS_LFN;
                break;
            }
            sfn[dst_ofs + di] = oem;
            di += 1;
        }
        (lower, upper, di)
    };

    let (b_low, b_up, b_len) = put(body, 0, 8, &mut cf);
    let (e_low, e_up, _e_len) = put(ext, 8, 3, &mut cf);

    if b_len == 0 && cf & NS_LOSS == 0 {
        return Err(FsError::InvalidName);
    }
    if sfn[0] == crate::DIR_ENTRY_UNUSED {
        // 0xE5 is a valid KANJI lead byte; 0x05 stands in for it on disk
        sfn[0] = 0x05;
    }
    if b_low && b_up || e_low && e_up {
        // mixed case needs the long entry to be preserved
        cf |= NS_LFN;
    } else {
        if b_low {
            cf |= NS_BODY;
        }
        if e_low {
            cf |= NS_EXT;
        }
    }
    Ok((sfn, cf))
}

/// Generate a numbered alias from the plain one: `BODY~N.EXT` for small N,
/// a 4-hex-digit tail seeded from a hash of the long name above that, so
/// collisions scatter instead of walking.
pub(crate) fn gen_numname(dst: &mut [u8; 11], src: &[u8; 11], lfn: &[u16], seq: u32) {
    dst.copy_from_slice(src);

    let mut seq = seq;
    if seq > 9 {
        // CRC-style fold of the long name, reseeded by the attempt number
        let mut sr: u32 = seq;
        for &unit in lfn {
            let mut wc = unit as u32;
            for _ in 0..16 {
                sr = (sr << 1) + (wc & 1);
                wc >>= 1;
                if sr & 0x10000 != 0 {
                    sr ^= 0x11021;
                }
            }
        }
        seq = sr & 0xFFFF;
    }

    // render "~N" right-aligned in an 8-byte scratch
    let mut ns = [0u8; 8];
    let mut i: usize = 7;
    let mut s = seq;
    loop {
        let mut c = (s % 16) as u8 + b'0';
        if c > b'9' {
            c += 7;
        }
        ns[i] = c;
        s /= 16;
        if s == 0 {
            break;
        }
        i -= 1;
    }
    i -= 1;
    ns[i] = b'~';

    // keep as much of the body as fits ahead of the tail
    let mut j = 0;
    while j < i && dst[j] != SPACE {
        j += 1;
    }
    let mut k = i;
    while j < 8 {
        dst[j] = if k < 8 {
            let c = ns[k];
            k += 1;
            c
        } else {
            SPACE
        };
        j += 1;
    }
}

/// Reconstruct the displayable form of an 8.3 entry name, honoring the
/// NT case bits (0x08 body, 0x10 extension).
pub(crate) fn sfn_to_string(sfn: &[u8], nt_res: u8) -> String {
    let cp = codepage();
    let mut out = String::new();
    for (i, &b) in sfn[..8].iter().enumerate() {
        if b == SPACE {
            break;
        }
        let b = if i == 0 && b == 0x05 { 0xE5 } else { b };
        let mut u = cp.to_unicode(b);
        if nt_res & 0x08 != 0 && (0x41..=0x5A).contains(&u) {
            u += 0x20;
        }
        out.push(char::from_u32(u as u32).unwrap_or('_'));
    }
    if sfn[8] != SPACE {
        out.push('.');
        for &b in &sfn[8..11] {
            if b == SPACE {
                break;
            }
            let mut u = cp.to_unicode(b);
            if nt_res & 0x10 != 0 && (0x41..=0x5A).contains(&u) {
                u += 0x20;
            }
            out.push(char::from_u32(u as u32).unwrap_or('_'));
        }
    }
    out
}
