//! Runtime Locator: finds the address of `_PyRuntime` (or,
//! on interpreters predating it, the `interp_head` global) using a ladder
//! of strategies, from the cheap and precise (a symbol table hit) to the
//! last-resort and expensive (scanning every anonymous mapping for
//! something that looks like an interpreter state).
//!
//! Grounded on py-spy's `python_process_info.rs::get_interpreter_address`
//! (symbol lookup falling back to a BSS scan validated with
//! `check_interpreter_addresses`).

use remoteprocess::ProcessMemory;

use crate::elf::ElfImage;
use crate::errors::EngineError;
use crate::maps::{ContainsAddr, MapInfo, VirtualMap};
use crate::memory;
use crate::object_renderer::copy_string;
use crate::offsets::Offsets;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Symbols,
    ElfData,
    Bss,
    Heap,
    AnonymousMaps,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Strategy::Symbols => "symbols",
            Strategy::ElfData => "elf-data",
            Strategy::Bss => "bss",
            Strategy::Heap => "heap",
            Strategy::AnonymousMaps => "anonymous-maps",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Policy {
    /// Stop at the first strategy that yields a validated candidate.
    Auto,
    /// Run every strategy and report disagreement (`--exhaustive`).
    Exhaustive,
}

pub struct Located {
    pub addr: usize,
    pub strategy: Strategy,
}

/// A validator checks that a candidate address, if dereferenced as the
/// symbol being searched for, looks sane (e.g. its first pointer field
/// points back into a known mapping). The Structure Walker supplies this
/// once it knows the offset table to check against; the locator itself
/// never interprets bytes beyond finding candidate pointers.
pub type Validator<'a> = dyn Fn(usize) -> bool + 'a;

/// `symbol_name` is `"_PyRuntime"` on 3.7+, `"interp_head"` on <=3.6 (it is
/// the caller's job to know which, since that depends on the already
/// version-detected release).
pub fn locate<P: ProcessMemory>(
    process: &P,
    python: &ElfImage,
    libpython: Option<&ElfImage>,
    maps: &MapInfo,
    symbol_name: &str,
    type_name: &str,
    validate: &Validator,
    policy: Policy,
) -> Result<Located, EngineError> {
    let mut found = Vec::new();

    if let Some(addr) = try_symbols(python, libpython, symbol_name) {
        if validate(addr) {
            found.push(Located { addr, strategy: Strategy::Symbols });
            if matches!(policy, Policy::Auto) {
                return Ok(found.pop().unwrap());
            }
        }
    }

    if let Some(addr) = try_elf_data(python, libpython, type_name) {
        if validate(addr) {
            found.push(Located { addr, strategy: Strategy::ElfData });
            if matches!(policy, Policy::Auto) {
                return Ok(found.pop().unwrap());
            }
        }
    }

    if let Some(addr) = scan_map(process, maps.bss.as_ref(), validate) {
        found.push(Located { addr, strategy: Strategy::Bss });
        if matches!(policy, Policy::Auto) {
            return Ok(found.pop().unwrap());
        }
    }

    if let Some(addr) = scan_map(process, maps.heap.as_ref(), validate) {
        found.push(Located { addr, strategy: Strategy::Heap });
        if matches!(policy, Policy::Auto) {
            return Ok(found.pop().unwrap());
        }
    }

    for m in maps.all.iter().filter(|m| m.is_anonymous() && m.is_writable()) {
        if let Some(addr) = scan_map(process, Some(m), validate) {
            found.push(Located { addr, strategy: Strategy::AnonymousMaps });
            if matches!(policy, Policy::Auto) {
                return Ok(found.pop().unwrap());
            }
        }
    }

    match found.into_iter().next() {
        Some(located) => Ok(located),
        None => Err(EngineError::InvalidPythonProcess(format!(
            "could not locate {symbol_name} by any strategy"
        ))),
    }
}

fn try_symbols(python: &ElfImage, libpython: Option<&ElfImage>, name: &str) -> Option<usize> {
    // Scenario F: the same symbol name can be mapped into both the main
    // binary and a dlopened libpython. Prefer whichever module actually
    // *defines* it; if both claim to define it, prefer the main binary
    // since that's how a statically-linked interpreter really resolves it.
    let python_hit = python.symbol_addr(name).filter(|_| python.is_symbol_defined(name));
    if let Some(addr) = python_hit {
        return Some(addr as usize);
    }
    if let Some(lib) = libpython {
        if let Some(addr) = lib.symbol_addr(name) {
            return Some(addr as usize);
        }
    }
    python.symbol_addr(name).map(|a| a as usize)
}

fn try_elf_data(python: &ElfImage, libpython: Option<&ElfImage>, type_name: &str) -> Option<usize> {
    python
        .global_by_type(type_name)
        .or_else(|| libpython.and_then(|l| l.global_by_type(type_name)))
        .map(|a| a as usize)
}

/// Scans a mapping word-by-word (8-byte aligned) looking for the first
/// candidate the caller's validator accepts. Linear, but only ever run
/// against a bss/heap region, which is small compared to a full
/// anonymous-maps sweep.
fn scan_map<P: ProcessMemory>(process: &P, map: Option<&VirtualMap>, validate: &Validator) -> Option<usize> {
    let map = map?;
    let bytes = memory::read(process, map.start, map.size()).ok()?;
    let mut offset = 0;
    while offset + 8 <= bytes.len() {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes[offset..offset + 8]);
        let candidate = usize::from_le_bytes(arr);
        if candidate != 0 && validate(candidate) {
            return Some(map.start + offset);
        }
        offset += 8;
    }
    None
}

/// A validator factory used by most callers: accept a candidate only if it
/// lies inside the process's known address range at all. Cheap, and a
/// strict superset of py-spy's `check_interpreter_addresses` first
/// filter before the more expensive structural check runs.
pub fn in_range_validator<'a>(maps: &'a MapInfo) -> impl Fn(usize) -> bool + 'a {
    move |addr: usize| maps.contains_addr(addr)
}

fn read_ptr<P: ProcessMemory>(process: &P, addr: usize) -> Option<usize> {
    let bytes = memory::read(process, addr, 8).ok()?;
    Some(usize::from_le_bytes(bytes.try_into().ok()?))
}

/// Walks one hop into the interpreter/thread/frame/code chain and confirms
/// each pointer resolves to something structurally plausible, beyond just
/// lying in mapped memory: the thread's interpreter back-pointer round-
/// trips, its frame (if any) decodes to a code object, and that code
/// object's name looks like a real identifier. Mirrors py-spy's
/// `check_interpreter_addresses`, which performs the same kind of
/// one-hop sanity read before trusting a candidate `_PyRuntime`/
/// `interp_head` address.
pub fn structural_validator<'a, P: ProcessMemory>(
    process: &'a P,
    offsets: &'a Offsets,
    maps: &'a MapInfo,
    symbol_name: &'a str,
) -> impl Fn(usize) -> bool + 'a {
    move |addr: usize| {
        if !maps.contains_addr(addr) {
            return false;
        }
        validate_structure(process, offsets, maps, symbol_name, addr).unwrap_or(false)
    }
}

fn validate_structure<P: ProcessMemory>(
    process: &P,
    offsets: &Offsets,
    maps: &MapInfo,
    symbol_name: &str,
    addr: usize,
) -> Option<bool> {
    let interp_addr = if symbol_name == "interp_head" {
        addr
    } else {
        read_ptr(process, addr + offsets.runtime_interp_head.offset)?
    };
    if !maps.contains_addr(interp_addr) {
        return Some(false);
    }

    let tstate_addr = read_ptr(process, interp_addr + offsets.interp_tstate_head.offset)?;
    if tstate_addr == 0 {
        // an interpreter with no threads yet is still structurally valid.
        return Some(true);
    }
    if !maps.contains_addr(tstate_addr) {
        return Some(false);
    }

    let back = read_ptr(process, tstate_addr + offsets.tstate_interp.offset)?;
    if back != interp_addr {
        return Some(false);
    }

    let frame_addr = if offsets.uses_inlined_frames {
        let cframe_field = offsets.tstate_cframe?;
        let cframe = read_ptr(process, tstate_addr + cframe_field.offset)?;
        if cframe == 0 {
            0
        } else {
            read_ptr(process, cframe)?
        }
    } else {
        read_ptr(process, tstate_addr + offsets.tstate_frame.offset)?
    };
    if frame_addr == 0 {
        // a thread that hasn't entered the eval loop yet is still valid.
        return Some(true);
    }
    if !maps.contains_addr(frame_addr) {
        return Some(false);
    }

    let code_addr = read_ptr(process, frame_addr + offsets.frame_code.offset)?;
    if code_addr == 0 {
        return Some(true);
    }
    if !maps.contains_addr(code_addr) {
        return Some(false);
    }

    let name_ptr = read_ptr(process, code_addr + offsets.code_name.offset)?;
    if name_ptr == 0 {
        return Some(false);
    }
    let name = copy_string(name_ptr, process).ok()?;
    Some(!name.is_empty() && name.len() < 256 && name.chars().all(|c| c.is_ascii_graphic() || c == '_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn map(start: usize, end: usize, anon: bool) -> VirtualMap {
        VirtualMap {
            start,
            end,
            file_offset: 0,
            readable: true,
            writable: true,
            executable: false,
            private: true,
            path: if anon { None } else { Some(PathBuf::from("/x")) },
        }
    }

    #[test]
    fn test_in_range_validator() {
        let info = MapInfo {
            range: crate::maps::MemoryRange { min: 0x1000, max: 0x9000 },
            heap: None,
            bss: None,
            python: map(0x1000, 0x2000, false),
            libpython: None,
            all: vec![map(0x1000, 0x2000, false), map(0x5000, 0x6000, true)],
        };
        let v = in_range_validator(&info);
        assert!(v(0x1500));
        assert!(v(0x5500));
        assert!(!v(0x7000));
    }
}
