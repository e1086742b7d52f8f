// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loaded module enumeration from `/proc/self/maps`, without allocating.

use crate::collector::memory_reader::MemoryReader;
use crate::crash_info::{CrashRecord, ModuleInfo, MAX_BUILD_ID_LEN};
use nix::errno::Errno;

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapsEntry<'a> {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub executable: bool,
    pub offset: u64,
    pub inode: u64,
    pub path: &'a [u8],
}

fn parse_hex(field: &[u8]) -> Option<u64> {
    if field.is_empty() || field.len() > 16 {
        return None;
    }
    field.iter().try_fold(0u64, |acc, b| {
        let digit = (*b as char).to_digit(16)?;
        Some(acc << 4 | digit as u64)
    })
}

fn parse_dec(field: &[u8]) -> Option<u64> {
    if field.is_empty() {
        return None;
    }
    field.iter().try_fold(0u64, |acc, b| {
        let digit = (*b as char).to_digit(10)?;
        acc.checked_mul(10)?.checked_add(digit as u64)
    })
}

/// Parses `start-end perms offset dev inode [path]`.
pub fn parse_maps_line(line: &[u8]) -> Option<MapsEntry<'_>> {
    let mut fields = line
        .split(|b| *b == b' ')
        .filter(|field| !field.is_empty());
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let inode = fields.next()?;

    let dash = range.iter().position(|b| *b == b'-')?;
    let start = parse_hex(&range[..dash])?;
    let end = parse_hex(&range[dash + 1..])?;

    // The path is everything after the inode column, and may itself contain spaces.
    let inode_end = inode.as_ptr() as usize - line.as_ptr() as usize + inode.len();
    let path = trim_start(&line[inode_end..]);

    Some(MapsEntry {
        start,
        end,
        readable: perms.first() == Some(&b'r'),
        executable: perms.get(2) == Some(&b'x'),
        offset: parse_hex(offset)?,
        inode: parse_dec(inode)?,
        path,
    })
}

fn trim_start(mut bytes: &[u8]) -> &[u8] {
    while let [b' ', rest @ ..] = bytes {
        bytes = rest;
    }
    bytes
}

/// Whether a mapping belongs to a module: file backed, or the vDSO.
fn is_module_mapping(entry: &MapsEntry) -> bool {
    if entry.path == b"[vdso]" {
        return true;
    }
    entry.inode != 0 && entry.path.first() == Some(&b'/')
}

/// Adds one mapping to the module list, merging consecutive mappings of the same file.
/// Returns false when a new module did not fit.
pub(crate) fn add_mapping(record: &mut CrashRecord, entry: &MapsEntry) -> bool {
    if !is_module_mapping(entry) {
        return true;
    }
    if let Some(last) = record.modules_mut().last_mut() {
        if last.path() == entry.path && entry.start >= last.base {
            last.size = last.size.max(entry.end - last.base);
            return true;
        }
    }
    record.push_module(ModuleInfo::new(
        entry.start,
        entry.end - entry.start,
        entry.path,
        &[],
    ))
}

/// Streams `/proc/self/maps` through `scratch` and records every module.
/// Returns false if the list is incomplete.
pub(crate) fn enumerate_modules(record: &mut CrashRecord, scratch: &mut [u8]) -> bool {
    const MAPS: &[u8] = b"/proc/self/maps\0";
    // Safety: MAPS is nul terminated.
    let fd = unsafe { libc::open(MAPS.as_ptr().cast(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return false;
    }
    let mut complete = true;
    let mut filled = 0usize;
    let mut skipping_long_line = false;
    loop {
        if filled == scratch.len() {
            // A line longer than the buffer: drop it and resynchronise on the next newline.
            filled = 0;
            skipping_long_line = true;
            complete = false;
        }
        // Safety: the destination is the unfilled tail of `scratch`.
        let n = unsafe {
            libc::read(
                fd,
                scratch[filled..].as_mut_ptr().cast(),
                scratch.len() - filled,
            )
        };
        if n < 0 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            complete = false;
            break;
        }
        if n == 0 {
            break;
        }
        filled += n as usize;

        let mut consumed = 0;
        while let Some(newline) = scratch[consumed..filled].iter().position(|b| *b == b'\n') {
            let line = &scratch[consumed..consumed + newline];
            consumed += newline + 1;
            if skipping_long_line {
                skipping_long_line = false;
                continue;
            }
            if let Some(entry) = parse_maps_line(line) {
                if !add_mapping(record, &entry) {
                    complete = false;
                }
            }
        }
        scratch.copy_within(consumed..filled, 0);
        filled -= consumed;
    }
    // Safety: `fd` was opened above.
    unsafe { libc::close(fd) };
    complete
}

const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;
const NT_GNU_BUILD_ID: u32 = 3;
const MAX_PROGRAM_HEADERS: u64 = 128;
const MAX_NOTES_PER_SEGMENT: usize = 64;

/// Reads the GNU build id of the ELF image loaded at `base` through its in-memory program
/// headers. Returns the number of bytes written to `out`, 0 when there is none.
pub fn read_build_id<R: MemoryReader + ?Sized>(
    reader: &R,
    base: u64,
    out: &mut [u8; MAX_BUILD_ID_LEN],
) -> usize {
    let mut ident = [0u8; 6];
    if reader.read(base, &mut ident).is_err() {
        return 0;
    }
    // 64-bit little-endian ELF only.
    if &ident[..4] != b"\x7fELF" || ident[4] != 2 || ident[5] != 1 {
        return 0;
    }
    let Ok(phoff) = reader.read_word(base + 32) else {
        return 0;
    };
    let (Ok(phentsize), Ok(phnum)) = (reader.read_u16(base + 54), reader.read_u16(base + 56))
    else {
        return 0;
    };
    let (phentsize, phnum) = (phentsize as u64, (phnum as u64).min(MAX_PROGRAM_HEADERS));
    if phentsize < 56 {
        return 0;
    }
    // Header fields come from memory we do not trust, so every address is checked.
    let Some(table) = base.checked_add(phoff) else {
        return 0;
    };
    let field = |i: u64, offset: u64| {
        table
            .checked_add(i * phentsize)
            .and_then(|p| p.checked_add(offset))
    };
    let word = |i: u64, offset: u64| field(i, offset).and_then(|at| reader.read_word(at).ok());
    let kind = |i: u64| field(i, 0).and_then(|at| reader.read_u32(at).ok());

    // The load bias maps link-time addresses onto where the image actually sits.
    let mut bias = None;
    for i in 0..phnum {
        if kind(i) != Some(PT_LOAD) {
            continue;
        }
        if let (Some(0), Some(vaddr)) = (word(i, 8), word(i, 16)) {
            bias = Some(base.wrapping_sub(vaddr & !0xfff));
            break;
        }
    }
    let Some(bias) = bias else {
        return 0;
    };

    for i in 0..phnum {
        if kind(i) != Some(PT_NOTE) {
            continue;
        }
        let (Some(vaddr), Some(memsz)) = (word(i, 16), word(i, 40)) else {
            continue;
        };
        let len = note_build_id(reader, bias.wrapping_add(vaddr), memsz, out);
        if len > 0 {
            return len;
        }
    }
    0
}

fn note_build_id<R: MemoryReader + ?Sized>(
    reader: &R,
    start: u64,
    size: u64,
    out: &mut [u8; MAX_BUILD_ID_LEN],
) -> usize {
    let end = start.saturating_add(size);
    let mut at = start;
    for _ in 0..MAX_NOTES_PER_SEGMENT {
        let Some(name_at) = at.checked_add(12).filter(|&name_at| name_at <= end) else {
            break;
        };
        let (Ok(namesz), Ok(descsz), Ok(kind)) = (
            reader.read_u32(at),
            reader.read_u32(at + 4),
            reader.read_u32(at + 8),
        ) else {
            return 0;
        };
        let Some((desc_at, next)) = note_layout(name_at, namesz, descsz) else {
            return 0;
        };
        if next > end {
            return 0;
        }
        if kind == NT_GNU_BUILD_ID && namesz == 4 {
            let mut name = [0u8; 4];
            if reader.read(name_at, &mut name).is_ok() && &name == b"GNU\0" {
                let len = (descsz as usize).min(MAX_BUILD_ID_LEN);
                return match reader.read(desc_at, &mut out[..len]) {
                    Ok(()) => len,
                    Err(_) => 0,
                };
            }
        }
        at = next;
    }
    0
}

/// Where a note's descriptor starts and where the next note begins, or `None` if either
/// address would wrap.
fn note_layout(name_at: u64, namesz: u32, descsz: u32) -> Option<(u64, u64)> {
    let align4 = |v: u32| (v as u64 + 3) & !3;
    let desc_at = name_at.checked_add(align4(namesz))?;
    let next = desc_at.checked_add(align4(descsz))?;
    Some((desc_at, next))
}

/// Fills in the build id of every recorded module.
pub(crate) fn read_build_ids<R: MemoryReader + ?Sized>(record: &mut CrashRecord, reader: &R) {
    let mut build_id = [0u8; MAX_BUILD_ID_LEN];
    for module in record.modules_mut() {
        let len = read_build_id(reader, module.base, &mut build_id);
        module.set_build_id(&build_id[..len]);
    }
}
