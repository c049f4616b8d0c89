//! Minimal ELF inspection for prefetch decisions.
//!
//! Only what the prefetcher needs: is this a dynamically linked ELF, what is
//! its program interpreter, and which DT_NEEDED libraries does it name. The
//! parser is total over arbitrary bytes; anything inconsistent yields `None`
//! rather than an error, because a misparse must never fail the read that
//! triggered it.
//!
//! Limited to little-endian ELF64, which covers the execution targets this
//! system supports.

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;

const DT_NEEDED: i64 = 1;
const DT_STRTAB: i64 = 5;

/// Dynamic-linking facts extracted from an ELF image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElfInfo {
    /// Program interpreter from PT_INTERP, e.g. `/lib64/ld-linux-x86-64.so.2`.
    pub interpreter: Option<String>,
    /// Library names from DT_NEEDED, in file order.
    pub needed: Vec<String>,
}

impl ElfInfo {
    /// Whether prefetching its dependencies is worthwhile at all.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.interpreter.is_some() || !self.needed.is_empty()
    }
}

/// Cheap check against the first page of a file: ELF magic, 64-bit,
/// little-endian, executable or shared object.
#[must_use]
pub fn looks_like_elf(data: &[u8]) -> bool {
    if data.len() < 18 || data[..4] != ELF_MAGIC {
        return false;
    }
    if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
        return false;
    }

    let e_type = u16::from_le_bytes([data[16], data[17]]);
    e_type == ET_EXEC || e_type == ET_DYN
}

/// Extracts interpreter and DT_NEEDED names from a complete ELF image.
#[must_use]
pub fn parse(data: &[u8]) -> Option<ElfInfo> {
    if !looks_like_elf(data) {
        return None;
    }

    let e_phoff = read_u64(data, 32)? as usize;
    let e_phentsize = read_u16(data, 54)? as usize;
    let e_phnum = read_u16(data, 56)? as usize;

    if e_phentsize < 56 {
        return None;
    }

    let mut info = ElfInfo::default();
    let mut loads: Vec<(u64, u64, u64)> = Vec::new();
    let mut dynamic: Option<(usize, usize)> = None;

    for i in 0..e_phnum {
        let at = e_phoff.checked_add(i.checked_mul(e_phentsize)?)?;
        let p_type = read_u32(data, at)?;
        let p_offset = read_u64(data, at + 8)?;
        let p_vaddr = read_u64(data, at + 16)?;
        let p_filesz = read_u64(data, at + 32)?;

        match p_type {
            PT_LOAD => loads.push((p_vaddr, p_offset, p_filesz)),
            PT_DYNAMIC => {
                dynamic = Some((usize::try_from(p_offset).ok()?, usize::try_from(p_filesz).ok()?));
            }
            PT_INTERP => {
                let start = usize::try_from(p_offset).ok()?;
                let len = usize::try_from(p_filesz).ok()?;
                let bytes = data.get(start..start.checked_add(len)?)?;
                let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                info.interpreter = std::str::from_utf8(&bytes[..nul]).ok().map(str::to_owned);
            }
            _ => {}
        }
    }

    let Some((dyn_off, dyn_len)) = dynamic else {
        return Some(info);
    };

    // First pass over the dynamic section: find the string table and the
    // name offsets.
    let mut strtab_vaddr = None;
    let mut needed_offsets = Vec::new();

    let dyn_bytes = data.get(dyn_off..dyn_off.checked_add(dyn_len)?)?;
    for chunk in dyn_bytes.chunks_exact(16) {
        let d_tag = i64::from_le_bytes(chunk[..8].try_into().ok()?);
        let d_val = u64::from_le_bytes(chunk[8..].try_into().ok()?);

        match d_tag {
            0 => break,
            DT_NEEDED => needed_offsets.push(d_val),
            DT_STRTAB => strtab_vaddr = Some(d_val),
            _ => {}
        }
    }

    let Some(strtab_vaddr) = strtab_vaddr else {
        return Some(info);
    };
    let strtab_off = vaddr_to_offset(&loads, strtab_vaddr)?;

    for name_off in needed_offsets {
        let at = usize::try_from(strtab_off.checked_add(name_off)?).ok()?;
        if let Some(name) = read_cstr(data, at) {
            info.needed.push(name);
        }
    }

    Some(info)
}

fn vaddr_to_offset(loads: &[(u64, u64, u64)], vaddr: u64) -> Option<u64> {
    loads
        .iter()
        .find(|(start, _, size)| {
            start
                .checked_add(*size)
                .is_some_and(|end| vaddr >= *start && vaddr < end)
        })
        .map(|(start, offset, _)| offset + (vaddr - start))
}

fn read_cstr(data: &[u8], at: usize) -> Option<String> {
    let tail = data.get(at..)?;
    let nul = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..nul]).ok().map(str::to_owned)
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(data.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(at..at + 8)?.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal but well-formed dynamic ELF64 image.
    fn synthetic_elf(interp: &str, needed: &[&str]) -> Vec<u8> {
        let mut strtab = vec![0u8];
        let mut needed_offsets = Vec::new();
        for name in needed {
            needed_offsets.push(strtab.len() as u64);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }

        // Layout: ehdr (64) | 3 phdrs (3 * 56) | interp | dynamic | strtab
        let phoff = 64u64;
        let interp_off = phoff + 3 * 56;
        let dyn_off = interp_off + interp.len() as u64 + 1;
        let dyn_len = (needed.len() as u64 + 2) * 16;
        let strtab_off = dyn_off + dyn_len;

        let total = strtab_off as usize + strtab.len();
        let mut img = vec![0u8; total];

        img[..4].copy_from_slice(&ELF_MAGIC);
        img[4] = ELFCLASS64;
        img[5] = ELFDATA2LSB;
        img[16..18].copy_from_slice(&ET_DYN.to_le_bytes());
        img[32..40].copy_from_slice(&phoff.to_le_bytes());
        img[54..56].copy_from_slice(&56u16.to_le_bytes());
        img[56..58].copy_from_slice(&3u16.to_le_bytes());

        let mut phdr = |idx: usize, p_type: u32, off: u64, vaddr: u64, filesz: u64| {
            let at = phoff as usize + idx * 56;
            img[at..at + 4].copy_from_slice(&p_type.to_le_bytes());
            img[at + 8..at + 16].copy_from_slice(&off.to_le_bytes());
            img[at + 16..at + 24].copy_from_slice(&vaddr.to_le_bytes());
            img[at + 32..at + 40].copy_from_slice(&filesz.to_le_bytes());
        };

        // Identity-mapped PT_LOAD covering the whole file.
        phdr(0, PT_LOAD, 0, 0, total as u64);
        phdr(1, PT_INTERP, interp_off, interp_off, interp.len() as u64 + 1);
        phdr(2, PT_DYNAMIC, dyn_off, dyn_off, dyn_len);

        img[interp_off as usize..interp_off as usize + interp.len()]
            .copy_from_slice(interp.as_bytes());

        let mut at = dyn_off as usize;
        for off in &needed_offsets {
            img[at..at + 8].copy_from_slice(&DT_NEEDED.to_le_bytes());
            img[at + 8..at + 16].copy_from_slice(&off.to_le_bytes());
            at += 16;
        }
        img[at..at + 8].copy_from_slice(&DT_STRTAB.to_le_bytes());
        img[at + 8..at + 16].copy_from_slice(&strtab_off.to_le_bytes());

        img[strtab_off as usize..].copy_from_slice(&strtab);
        img
    }

    #[test]
    fn test_parse_synthetic_binary() {
        let img = synthetic_elf("/lib64/ld-linux-x86-64.so.2", &["libc.so.6", "libm.so.6"]);

        assert!(looks_like_elf(&img));
        let info = parse(&img).unwrap();
        assert_eq!(info.interpreter.as_deref(), Some("/lib64/ld-linux-x86-64.so.2"));
        assert_eq!(info.needed, vec!["libc.so.6", "libm.so.6"]);
        assert!(info.is_dynamic());
    }

    #[test]
    fn test_non_elf_rejected() {
        assert!(!looks_like_elf(b"#!/bin/sh\n"));
        assert!(!looks_like_elf(b""));
        assert!(parse(b"\x7fELF but actually garbage").is_none());
    }

    #[test]
    fn test_truncated_image_never_panics() {
        let img = synthetic_elf("/lib64/ld-linux-x86-64.so.2", &["libc.so.6"]);

        for cut in 0..img.len() {
            // Result does not matter; parsing must stay total.
            let _ = parse(&img[..cut]);
        }
    }
}
