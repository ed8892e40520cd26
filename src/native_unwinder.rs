//! Native Unwinder: produces the native C call stack for a
//! thread, so the Stack Correlator can interleave it with Python frames.
//!
//! Live targets delegate to `remoteprocess::Unwinder` (`unwind_live`),
//! exactly as py-spy's `native_stack_trace.rs::get_thread` does. Core
//! files have no running process to ask, so this module walks DWARF CFI
//! (`.eh_frame`/`.debug_frame`) by hand against the frozen `NT_PRSTATUS`
//! register set (`unwind_core`), using `gimli`'s unwind tables the same
//! way `remoteprocess` itself does internally on Linux.

use std::collections::HashMap;

use gimli::{BaseAddresses, EhFrame, RunTimeEndian, UnwindContext, UnwindSection};

use crate::elf::ElfImage;
use crate::errors::EngineError;
use crate::maps::{ContainsAddr, MapInfo};
use crate::stack_correlator::NativeFrame;

/// x86_64 System V register numbers gimli's CFI rules reference, the only
/// ones a frame-pointer-free unwind needs to track.
const X86_64_RA: gimli::Register = gimli::Register(16);
const X86_64_RSP: gimli::Register = gimli::Register(7);
const X86_64_RBP: gimli::Register = gimli::Register(6);

#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
}

/// One module's CFI program plus the base address it's loaded at, enough
/// to step one frame given the current register set.
pub struct Module<'a> {
    pub image: &'a ElfImage,
    pub base: u64,
}

/// Unwinds a thread's native call stack in a core file by repeatedly
/// looking up the current `rip` in the owning module's `.eh_frame`/
/// `.debug_frame`, evaluating its CFI row, and stepping to the caller.
/// Stops at `main`/`_start`, at an address outside any known mapping, or
/// after a generous hop bound — the same non-blocking-mode discipline
/// every other linked-list walk in this engine is held to.
pub fn unwind_core(
    mut regs: Registers,
    modules: &[Module],
    maps: &MapInfo,
    read_u64_at: impl Fn(u64) -> Option<u64>,
    resolve_name: impl Fn(u64, Option<&ElfImage>) -> (String, Option<String>),
) -> Vec<NativeFrame> {
    const MAX_FRAMES: usize = 1024;
    let mut frames = Vec::new();

    for _ in 0..MAX_FRAMES {
        if !maps.range.contains(regs.rip as usize) {
            break;
        }
        let module = modules.iter().find(|m| {
            m.image.bias <= regs.rip && regs.rip < m.image.bias + module_span(m.image)
        });

        let (name, filename) = match module {
            Some(m) => resolve_name(regs.rip, Some(m.image)),
            None => resolve_name(regs.rip, None),
        };
        frames.push(NativeFrame { name: name.clone(), filename, line: 0, module: None });
        if name == "main" || name == "_start" {
            break;
        }

        let next = match module.and_then(|m| step(regs, m, &read_u64_at)) {
            Some(r) => r,
            None => break,
        };
        if next.rip == 0 || next.rip == regs.rip {
            break;
        }
        regs = next;
    }
    frames
}

/// Unwinds a thread of a live process using `remoteprocess`'s own
/// unwinder, stepping its cursor one return address at a time the same
/// way py-spy's `NativeStack::get_thread` does, and resolving each
/// address through the same `resolve_name` callback `unwind_core` uses so
/// both paths produce identically-shaped `NativeFrame`s for the Stack
/// Correlator.
pub fn unwind_live(
    unwinder: &remoteprocess::Unwinder,
    thread: &remoteprocess::Thread,
    modules: &[Module],
    resolve_name: impl Fn(u64, Option<&ElfImage>) -> (String, Option<String>),
) -> Result<Vec<NativeFrame>, EngineError> {
    const MAX_FRAMES: usize = 1024;
    let mut frames = Vec::new();
    let mut cursor = unwinder
        .cursor(thread)
        .map_err(|e| EngineError::Engine(format!("failed to create native unwind cursor: {e}")))?;

    for _ in 0..MAX_FRAMES {
        let ip = match cursor.next() {
            Some(Ok(ip)) => ip,
            _ => break,
        };
        let module = modules.iter().find(|m| m.image.bias <= ip && ip < m.image.bias + module_span(m.image));
        let (name, filename) = match module {
            Some(m) => resolve_name(ip, Some(m.image)),
            None => resolve_name(ip, None),
        };
        let is_root = name == "main" || name == "_start";
        frames.push(NativeFrame { name, filename, line: 0, module: None });
        if is_root {
            break;
        }
    }
    Ok(frames)
}

fn module_span(_image: &ElfImage) -> u64 {
    // A generous upper bound: modules are never larger than 512MiB on the
    // targets this engine supports; exact section sizing isn't needed,
    // only "does rip plausibly belong to this module".
    512 * 1024 * 1024
}

fn step(regs: Registers, module: &Module, read_u64_at: &impl Fn(u64) -> Option<u64>) -> Option<Registers> {
    let (eh_frame_bytes, eh_frame_vaddr) = module.image.eh_frame();
    let bytes = if !eh_frame_bytes.is_empty() { eh_frame_bytes } else { module.image.debug_frame() };
    if bytes.is_empty() {
        return frame_pointer_step(regs, read_u64_at);
    }

    let endian = RunTimeEndian::Little;
    let mut eh_frame = EhFrame::new(bytes, endian);
    eh_frame.set_address_size(8);
    let mut bases = BaseAddresses::default();
    bases = bases.set_eh_frame(module.image.bias + eh_frame_vaddr);
    let mut ctx = UnwindContext::new();

    let pc = regs.rip - module.image.bias;
    let fde = eh_frame.fde_for_address(&bases, pc, EhFrame::cie_from_offset);
    let fde = match fde {
        Ok(fde) => fde,
        Err(_) => return frame_pointer_step(regs, read_u64_at),
    };
    let row = match fde.unwind_info_for_address(&eh_frame, &bases, &mut ctx, pc) {
        Ok(row) => row.clone(),
        Err(_) => return frame_pointer_step(regs, read_u64_at),
    };

    let cfa = match row.cfa() {
        gimli::CfaRule::RegisterAndOffset { register, offset } => {
            let base = if *register == X86_64_RSP {
                regs.rsp
            } else if *register == X86_64_RBP {
                regs.rbp
            } else {
                return frame_pointer_step(regs, read_u64_at);
            };
            (base as i64 + offset) as u64
        }
        gimli::CfaRule::Expression(_) => return frame_pointer_step(regs, read_u64_at),
    };

    let ra = match row.register(X86_64_RA) {
        gimli::RegisterRule::Offset(off) => read_u64_at((cfa as i64 + off) as u64),
        _ => return frame_pointer_step(regs, read_u64_at),
    }?;
    let new_rbp = match row.register(X86_64_RBP) {
        gimli::RegisterRule::Offset(off) => read_u64_at((cfa as i64 + off) as u64).unwrap_or(regs.rbp),
        _ => regs.rbp,
    };

    Some(Registers { rip: ra, rsp: cfa, rbp: new_rbp })
}

/// Degrades gracefully to classic frame-pointer chasing
/// (`*rbp` = saved rbp, `*(rbp+8)` = return address) when a module has no
/// CFI at all (common for hand-written asm trampolines); this mirrors
/// `remoteprocess`'s own fallback for frame-pointer-only builds.
fn frame_pointer_step(regs: Registers, read_u64_at: &impl Fn(u64) -> Option<u64>) -> Option<Registers> {
    if regs.rbp == 0 {
        return None;
    }
    let saved_rbp = read_u64_at(regs.rbp)?;
    let ra = read_u64_at(regs.rbp + 8)?;
    Some(Registers { rip: ra, rsp: regs.rbp + 16, rbp: saved_rbp })
}

/// Resolves a native program counter to `symbol+offset` using the owning
/// module's symbol table, falling back to a raw `0x<addr>` placeholder
/// when no defined symbol covers it. `addr2line`-style source-line
/// resolution is layered on top of this by `engine.rs` when DWARF line
/// info exists.
pub fn resolve_symbol(addr: u64, image: Option<&ElfImage>) -> (String, Option<String>) {
    let image = match image {
        Some(i) => i,
        None => return (format!("0x{addr:x}"), None),
    };
    match image.nearest_symbol(addr) {
        Some((name, base)) => {
            let offset = addr - base;
            let label = if offset == 0 { name.to_string() } else { format!("{name}+0x{offset:x}") };
            (label, Some(image.path.display().to_string()))
        }
        None => (format!("0x{:x}", addr - image.bias), Some(image.path.display().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_pointer_step_terminates_on_null_rbp() {
        let regs = Registers { rip: 0x1000, rsp: 0x2000, rbp: 0 };
        assert!(frame_pointer_step(regs, &|_| Some(0)).is_none());
    }

    #[test]
    fn test_frame_pointer_step_follows_chain() {
        let regs = Registers { rip: 0x1000, rsp: 0x2000, rbp: 0x3000 };
        let mem: HashMap<u64, u64> = [(0x3000, 0x4000), (0x3008, 0x1234)].into_iter().collect();
        let next = frame_pointer_step(regs, &|addr| mem.get(&addr).copied()).unwrap();
        assert_eq!(next.rip, 0x1234);
        assert_eq!(next.rbp, 0x4000);
    }
}
