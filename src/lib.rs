//! py-stackprobe: remote introspection of a live CPython process or a saved
//! core dump, without any cooperation from the target.
//!
//! # Example
//!
//! ```rust,no_run
//! fn print_python_stacks(pid: py_stackprobe::Pid) -> Result<(), anyhow::Error> {
//!     let config = py_stackprobe::config::Config::default();
//!     let traces = py_stackprobe::engine::inspect_live(pid, &config)?;
//!     for trace in traces {
//!         println!("Thread {:#X} ({})", trace.thread_id, trace.status_str());
//!         for frame in &trace.frames {
//!             println!("\t {} ({}:{})", frame.name, frame.filename, frame.line);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

pub mod config;
#[cfg(target_os = "linux")]
pub mod coredump;
pub mod dump;
pub mod elf;
pub mod engine;
pub mod errors;
pub mod maps;
pub mod memory;
pub mod native_unwinder;
pub mod object_renderer;
pub mod offsets;
pub mod runtime_locator;
pub mod stack_correlator;
pub mod stack_trace;
pub mod structure_walker;
pub mod version;

pub use config::Config;
pub use remoteprocess::Pid;
pub use stack_trace::{Frame, StackTrace};
