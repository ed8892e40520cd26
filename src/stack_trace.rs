//! Data model: the shapes every other component produces or
//! consumes. Kept free of any parsing logic — the Structure Walker,
//! Object Renderer and Stack Correlator build and fill these in, the CLI
//! layer only serializes and prints them.

use std::sync::Arc;

use remoteprocess::Pid;
use serde_derive::Serialize;

/// Call stack for a single Python thread, after native frames (if
/// requested) have been merged in by the Stack Correlator.
#[derive(Debug, Clone, Serialize)]
pub struct StackTrace {
    pub pid: Pid,
    pub thread_id: u64,
    pub thread_name: Option<String>,
    pub os_thread_id: Option<u64>,
    pub active: bool,
    pub owns_gil: bool,
    pub gc_collecting: bool,
    pub gil_wait: GilWait,
    pub frames: Vec<Frame>,
    pub process_info: Option<Arc<ProcessInfo>>,
}

/// Whether a thread that doesn't currently hold the GIL is blocked trying
/// to acquire it or in the middle of releasing it; derived from whether a
/// merged native stack contains a `take_gil`/`drop_gil` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GilWait {
    None,
    Waiting,
    Dropping,
}

/// One entry in a merged stack: either a decoded Python frame or an
/// interleaved native C frame, distinguished by `native`.
#[derive(Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Clone, Serialize)]
pub struct Frame {
    pub name: String,
    pub filename: String,
    pub module: Option<String>,
    pub short_filename: Option<String>,
    pub line: i32,
    pub locals: Option<Vec<LocalVariable>>,
    /// True for the outermost native frame of each Python call (the frame
    /// that actually invoked the eval loop); used to decide where native
    /// frames may be spliced in without double-counting a C function that
    /// only tail-calls into the loop again.
    pub is_entry: bool,
    /// True when this frame came from the Native Unwinder rather than the
    /// Structure Walker.
    pub native: bool,
}

#[derive(Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Clone, Serialize)]
pub struct LocalVariable {
    pub name: String,
    pub addr: usize,
    pub arg: bool,
    pub repr: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub command_line: String,
    pub parent: Option<Box<ProcessInfo>>,
}

impl StackTrace {
    /// pystack-style status string: combines GIL ownership, run state and
    /// GC activity. Grounded in pystack's
    /// `PyThread.status`/`gil_status`/`gc_status` properties.
    pub fn status_str(&self) -> String {
        let mut parts = Vec::new();
        parts.push(if self.active { "Running" } else { "Idle" });
        if self.owns_gil {
            parts.push("Has the GIL");
        } else {
            match self.gil_wait {
                GilWait::Waiting => parts.push("Waiting for the GIL"),
                GilWait::Dropping => parts.push("Dropping the GIL"),
                GilWait::None => {}
            }
        }
        if self.gc_collecting {
            parts.push("Garbage collecting");
        }
        parts.join(", ")
    }

    pub fn format_threadid(&self) -> String {
        #[cfg(target_os = "macos")]
        return format!("{:#X}", self.thread_id);

        #[cfg(not(target_os = "macos"))]
        match self.os_thread_id {
            Some(tid) => format!("{}", tid),
            None => format!("{:#X}", self.thread_id),
        }
    }
}

impl ProcessInfo {
    pub fn to_frame(&self) -> Frame {
        Frame {
            name: format!("process {}:\"{}\"", self.pid, self.command_line),
            filename: String::new(),
            module: None,
            short_filename: None,
            line: 0,
            locals: None,
            is_entry: true,
            native: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(active: bool, owns_gil: bool, gc_collecting: bool) -> StackTrace {
        StackTrace {
            pid: 1,
            thread_id: 0,
            thread_name: None,
            os_thread_id: None,
            active,
            owns_gil,
            gc_collecting,
            gil_wait: GilWait::None,
            frames: Vec::new(),
            process_info: None,
        }
    }

    #[test]
    fn test_status_str_waiting_for_gil() {
        let mut t = trace(true, false, false);
        t.gil_wait = GilWait::Waiting;
        assert_eq!(t.status_str(), "Running, Waiting for the GIL");
    }

    #[test]
    fn test_status_str_dropping_gil() {
        let mut t = trace(true, false, false);
        t.gil_wait = GilWait::Dropping;
        assert_eq!(t.status_str(), "Running, Dropping the GIL");
    }

    #[test]
    fn test_status_str_idle() {
        assert_eq!(trace(false, false, false).status_str(), "Idle");
    }

    #[test]
    fn test_status_str_running_with_gil_and_gc() {
        assert_eq!(
            trace(true, true, true).status_str(),
            "Running, Has the GIL, Garbage collecting"
        );
    }
}
