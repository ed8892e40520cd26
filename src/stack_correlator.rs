//! Stack Correlator: classifies native frames and merges
//! them with the Structure Walker's Python frames into one ordered call
//! stack, plus the GIL/GC status annotation shown alongside each thread.
//!
//! Grounded in py-spy's `native_stack_trace.rs::merge_native_thread`/
//! `ignore_frame`, and in pystack's `types.py`
//! `SYMBOL_IGNORELIST`/`frame_type` and `traceback_formatter.py`
//! `_are_the_stacks_mergeable`/`_format_merged_stacks`.

use crate::stack_trace::{Frame, GilWait, StackTrace};

/// Mirrors pystack's `NativeFrame.FrameType` enum exactly:
/// a native frame is either noise to drop (`Ignore`), the eval loop itself
/// (`Eval`, where a Python frame gets spliced in), or ordinary C code
/// (`Other`, kept as-is).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Ignore,
    Eval,
    Other,
}

/// Exact ignore-list carried over from pystack's `SYMBOL_IGNORELIST`:
/// call-dispatch plumbing that would otherwise appear once per Python call
/// and add no information.
pub const SYMBOL_IGNORELIST: &[&str] = &[
    "PyObject_Call",
    "call_function",
    "classmethoddescr_call",
    "cmpwrapper_call",
    "fast_function",
    "function_call",
    "instance_call",
    "instancemethod_call",
    "methoddescr_call",
    "proxy_call",
    "slot_tp_call",
    "type_call",
    "weakref_call",
    "wrap_call",
    "wrapper_call",
    "wrapperdescr_call",
    "do_call_core",
];

fn is_eval_frame(symbol: &str, python_version: (u64, u64)) -> bool {
    if python_version < (3, 6) {
        symbol.contains("PyEval_EvalFrameEx")
    } else {
        symbol.contains("_PyEval_EvalFrameDefault")
    }
}

/// Ordered classification, matching pystack's `frame_type` exactly: the
/// eval-frame check runs first (so the eval symbol itself is never
/// swallowed by the broader `PyEval`/`_PyEval` prefix check below it),
/// then progressively broader prefix/substring rules, falling through to
/// the fixed ignore-list, with anything left over kept as `Other`.
pub fn frame_type(symbol: &str, python_version: (u64, u64)) -> FrameType {
    if is_eval_frame(symbol, python_version) {
        return FrameType::Eval;
    }
    if symbol.starts_with("PyEval") || symbol.starts_with("_PyEval") {
        return FrameType::Ignore;
    }
    if symbol.starts_with("_Py") {
        return FrameType::Ignore;
    }
    if python_version >= (3, 8) && symbol.to_lowercase().contains("vectorcall") {
        return FrameType::Ignore;
    }
    if SYMBOL_IGNORELIST.iter().any(|ignored| symbol.starts_with(ignored)) {
        return FrameType::Ignore;
    }
    FrameType::Other
}

/// One native (C) frame as produced by the Native Unwinder, before
/// merging.
#[derive(Debug, Clone)]
pub struct NativeFrame {
    pub name: String,
    pub filename: Option<String>,
    pub line: i32,
    pub module: Option<String>,
}

impl NativeFrame {
    fn into_frame(self) -> Frame {
        Frame {
            name: self.name,
            filename: self.filename.unwrap_or_default(),
            module: self.module,
            short_filename: None,
            line: self.line,
            locals: None,
            is_entry: false,
            native: true,
        }
    }
}

/// Where `Other` native frames land relative to the Python frames they
/// were found alongside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Splice each `Other` native frame in at the position it was unwound,
    /// interleaved with the Python frames around it.
    Interleaved,
    /// Defer every `Other` native frame to the tail of the merged stack,
    /// after every Python frame.
    NativeLast,
}

const UNMERGEABLE_MARKER: &str = "* - Unable to merge native stack due to insufficient native information - *";

/// Merges a thread's native frame list with its already-decoded Python
/// frames (both innermost-first, the convention `StackTrace::frames`
/// already uses).
///
/// Mirrors pystack's `_are_the_stacks_mergeable`/`_format_merged_stacks`:
/// first checks that the number of `Eval` native frames matches the
/// number of entry Python frames (CPython's zero-cost-exceptions shadow
/// stack can leave these out of sync on 3.11+ when a signal interrupts an
/// in-progress unwind); if they don't match, the native information is
/// judged too unreliable to splice in and the Python stack is returned
/// verbatim with a diagnostic marker frame appended. Otherwise walks the
/// native frames: `Ignore` is dropped, `Eval` consumes the next Python
/// frame and every trailing non-entry (inlined) frame after it, and
/// `Other` is kept as a native line (interleaved or deferred, per `mode`).
pub fn merge(
    python_frames: Vec<Frame>,
    native_frames: Vec<NativeFrame>,
    python_version: (u64, u64),
    mode: MergeMode,
) -> Vec<Frame> {
    if native_frames.is_empty() {
        return python_frames;
    }

    let n_eval = native_frames.iter().filter(|f| frame_type(&f.name, python_version) == FrameType::Eval).count();
    let n_entry = python_frames.iter().filter(|f| f.is_entry).count();
    if n_eval != n_entry {
        let mut unmerged = python_frames;
        unmerged.push(Frame {
            name: UNMERGEABLE_MARKER.to_string(),
            filename: String::new(),
            module: None,
            short_filename: None,
            line: 0,
            locals: None,
            is_entry: false,
            native: true,
        });
        return unmerged;
    }

    let mut merged = Vec::with_capacity(python_frames.len() + native_frames.len());
    let mut deferred = Vec::new();
    let mut py_iter = python_frames.into_iter().peekable();

    for native in native_frames {
        match frame_type(&native.name, python_version) {
            FrameType::Ignore => continue,
            FrameType::Eval => {
                if let Some(py) = py_iter.next() {
                    merged.push(py);
                }
                while let Some(py) = py_iter.peek() {
                    if py.is_entry {
                        break;
                    }
                    merged.push(py_iter.next().unwrap());
                }
            }
            FrameType::Other => match mode {
                MergeMode::Interleaved => merged.push(native.into_frame()),
                MergeMode::NativeLast => deferred.push(native.into_frame()),
            },
        }
    }
    merged.extend(py_iter);
    merged.extend(deferred);
    merged
}

/// Annotates a thread's GIL/GC status fields on the trace itself, from the
/// already-merged frame list: `owns_gil` is already known from the
/// Structure Walker; `gc_collecting` and `gil_wait` are derived from
/// whether specific native frame symbols are present in the merged stack.
/// Mirrors pystack's `PyThread.gc_status`/`gil_status` properties.
pub fn annotate_status(trace: &mut StackTrace) {
    trace.gc_collecting = trace
        .frames
        .iter()
        .any(|f| f.native && (f.name.contains("gc_collect") || f.name.contains("collect.constrprop")));

    trace.gil_wait = if trace.owns_gil {
        GilWait::None
    } else if trace.frames.iter().any(|f| f.native && f.name == "take_gil") {
        GilWait::Waiting
    } else if trace.frames.iter().any(|f| f.native && f.name == "drop_gil") {
        GilWait::Dropping
    } else {
        GilWait::None
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    const V311: (u64, u64) = (3, 11);

    fn py(name: &str, is_entry: bool) -> Frame {
        Frame {
            name: name.to_string(),
            filename: "f.py".to_string(),
            module: None,
            short_filename: None,
            line: 1,
            locals: None,
            is_entry,
            native: false,
        }
    }

    fn native(name: &str) -> NativeFrame {
        NativeFrame { name: name.to_string(), filename: None, line: 0, module: None }
    }

    #[test]
    fn test_frame_type_classification() {
        assert_eq!(frame_type("_PyEval_EvalFrameDefault", V311), FrameType::Eval);
        assert_eq!(frame_type("_PyObject_VectorcallTstate", V311), FrameType::Ignore);
        assert_eq!(frame_type("PyEval_EvalFrameEx", (3, 5)), FrameType::Ignore);
        assert_eq!(frame_type("method_vectorcall_NOARGS", V311), FrameType::Ignore);
        assert_eq!(frame_type("call_function", V311), FrameType::Ignore);
        assert_eq!(frame_type("my_c_extension_func", V311), FrameType::Other);
    }

    #[test]
    fn test_is_eval_frame_version_gated() {
        assert_eq!(frame_type("PyEval_EvalFrameEx", (3, 5)), FrameType::Eval);
        assert_eq!(frame_type("_PyEval_EvalFrameDefault", (3, 5)), FrameType::Ignore);
    }

    #[test]
    fn test_merge_drops_ignored_and_keeps_other() {
        let python = vec![py("foo", true), py("bar", true)];
        let native = vec![
            native("some_c_helper"),
            native("_PyObject_Vectorcall"),
            native("_PyEval_EvalFrameDefault"),
            native("main"),
            native("_PyEval_EvalFrameDefault"),
        ];
        let merged = merge(python, native, V311, MergeMode::Interleaved);
        let names: Vec<&str> = merged.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["some_c_helper", "foo", "main", "bar"]);
    }

    #[test]
    fn test_merge_consumes_inlined_frames_after_entry() {
        let python = vec![py("outer", true), py("inlined", false), py("inner", true)];
        let native = vec![native("_PyEval_EvalFrameDefault"), native("helper"), native("_PyEval_EvalFrameDefault")];
        let merged = merge(python, native, V311, MergeMode::Interleaved);
        let names: Vec<&str> = merged.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["outer", "inlined", "helper", "inner"]);
    }

    #[test]
    fn test_merge_native_last_defers_other_frames() {
        let python = vec![py("foo", true)];
        let native = vec![native("pre_call_native"), native("_PyEval_EvalFrameDefault"), native("post_call_native")];
        let merged = merge(python, native, V311, MergeMode::NativeLast);
        let names: Vec<&str> = merged.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["foo", "pre_call_native", "post_call_native"]);
    }

    #[test]
    fn test_merge_with_no_native_frames_is_identity() {
        let python = vec![py("foo", true)];
        let merged = merge(python.clone(), Vec::new(), V311, MergeMode::Interleaved);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "foo");
    }

    #[test]
    fn test_merge_unmergeable_stacks_returns_python_with_marker() {
        // two entry frames but only one eval frame: mismatched, so the
        // merge is judged unreliable.
        let python = vec![py("foo", true), py("bar", true)];
        let native = vec![native("_PyEval_EvalFrameDefault")];
        let merged = merge(python, native, V311, MergeMode::Interleaved);
        let names: Vec<&str> = merged.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["foo", "bar", UNMERGEABLE_MARKER]);
    }

    #[test]
    fn test_annotate_status_gc_collecting() {
        let mut trace = StackTrace {
            pid: 1,
            thread_id: 0,
            thread_name: None,
            os_thread_id: None,
            active: true,
            owns_gil: false,
            gc_collecting: false,
            gil_wait: GilWait::None,
            frames: vec![Frame { native: true, name: "gc_collect_region".to_string(), ..py("x", false) }],
            process_info: None,
        };
        annotate_status(&mut trace);
        assert!(trace.gc_collecting);
    }

    #[test]
    fn test_annotate_status_gil_wait() {
        let mut trace = StackTrace {
            pid: 1,
            thread_id: 0,
            thread_name: None,
            os_thread_id: None,
            active: true,
            owns_gil: false,
            gc_collecting: false,
            gil_wait: GilWait::None,
            frames: vec![Frame { native: true, name: "take_gil".to_string(), ..py("x", false) }],
            process_info: None,
        };
        annotate_status(&mut trace);
        assert_eq!(trace.gil_wait, GilWait::Waiting);
    }

    #[test]
    fn test_annotate_status_owns_gil_overrides_wait() {
        let mut trace = StackTrace {
            pid: 1,
            thread_id: 0,
            thread_name: None,
            os_thread_id: None,
            active: true,
            owns_gil: true,
            gc_collecting: false,
            gil_wait: GilWait::None,
            frames: vec![Frame { native: true, name: "take_gil".to_string(), ..py("x", false) }],
            process_info: None,
        };
        annotate_status(&mut trace);
        assert_eq!(trace.gil_wait, GilWait::None);
    }
}
