//! Engine: the public entry point that wires every component together into
//! the two operations this crate exposes — inspecting a live process and
//! inspecting a core file.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};
use remoteprocess::{Pid, Process, ProcessMemory};

use crate::config::Config;
use crate::coredump::CoreDump;
use crate::elf::ElfImage;
use crate::maps::{self, MapInfo};
use crate::offsets::{self, Offsets};
use crate::runtime_locator::{self, Policy};
use crate::stack_correlator;
use crate::stack_trace::StackTrace;
use crate::structure_walker;
use crate::version::Version;

/// Runs the full pipeline against a live, running process.
pub fn inspect_live(pid: Pid, config: &Config) -> Result<Vec<StackTrace>, Error> {
    let process = Process::new(pid).map_err(|_| crate::errors::EngineError::ProcessNotFound(pid))?;
    let _lock = if config.blocking != crate::config::LockingStrategy::NonBlocking {
        Some(process.lock().context("failed to suspend the target process")?)
    } else {
        None
    };

    let raw_maps = maps::maps_for_pid(pid)?;
    let python_path = locate_python_binary(&raw_maps)?;
    let libpython_path = raw_maps
        .iter()
        .find(|m| m.path.as_deref().map(maps::is_python_lib).unwrap_or(false))
        .and_then(|m| m.path.clone());

    let mut map_info = maps::resolve(raw_maps, &python_path, libpython_path.as_deref())?;

    let version = detect_version(&python_path, libpython_path.as_deref(), &map_info, &process, config)?;

    let python_bias = load_bias(&python_path, map_info.python.start)?;
    let python_image = ElfImage::open(&python_path, python_bias)?;
    let libpython_image = match &libpython_path {
        Some(p) => {
            let bias = load_bias(p, map_info.libpython.as_ref().map(|m| m.start).unwrap_or(0))?;
            Some(ElfImage::open(p, bias)?)
        }
        None => None,
    };

    let offsets = offsets::resolve(&process, &python_image, libpython_image.as_ref(), version.major, version.minor)
        .ok_or_else(|| format_err!("unsupported python version {version}"))?;

    let bss_source = libpython_image.as_ref().unwrap_or(&python_image);
    let bss_module_maps: Vec<_> = map_info.all.iter().filter(|m| m.path.as_deref() == Some(bss_source.path.as_path())).cloned().collect();
    map_info.bss = maps::get_bss(bss_source, &bss_module_maps);

    let policy = if config.exhaustive { Policy::Exhaustive } else { Policy::Auto };
    let symbol_name = if version.major == 2 || (version.major == 3 && version.minor < 7) {
        "interp_head"
    } else {
        "_PyRuntime"
    };
    let validator = runtime_locator::structural_validator(&process, &offsets, &map_info, symbol_name);
    let located = runtime_locator::locate(
        &process,
        &python_image,
        libpython_image.as_ref(),
        &map_info,
        symbol_name,
        "_PyRuntimeState",
        &validator,
        policy,
    )?;
    log::info!("located {symbol_name} via {} at 0x{:016x}", located.strategy, located.addr);

    let interp_addr = interp_head_addr(&process, &offsets, located.addr, symbol_name)?;

    let gil_current_ptr = gil_current_thread_addr(&offsets, located.addr, symbol_name);
    let gil_thread_id = structure_walker::get_gil_threadid(&process, &offsets, gil_current_ptr).unwrap_or(0);

    let mut traces = structure_walker::get_stack_traces(
        &process,
        &offsets,
        interp_addr,
        gil_thread_id,
        config.dump_locals > 0,
        config.dump_locals > 1,
        &map_info,
    )?;

    for trace in &mut traces {
        trace.pid = pid;
    }

    if config.native_mode.is_enabled() {
        let unwinder = process.unwinder().context("failed to create a native unwinder for the live process")?;
        let modules: Vec<crate::native_unwinder::Module> = std::iter::once(&python_image)
            .chain(libpython_image.as_ref())
            .map(|img| crate::native_unwinder::Module { image: img, base: img.bias })
            .collect();
        let mode = if config.native_mode == crate::config::NativeMode::NativeLast {
            stack_correlator::MergeMode::NativeLast
        } else {
            stack_correlator::MergeMode::Interleaved
        };

        for trace in &mut traces {
            let os_thread_id = match trace.os_thread_id {
                Some(id) => id,
                None => continue,
            };
            let thread = match remoteprocess::Thread::new(os_thread_id as remoteprocess::Tid) {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("failed to open native thread {os_thread_id}: {e}");
                    continue;
                }
            };
            match crate::native_unwinder::unwind_live(&unwinder, &thread, &modules, crate::native_unwinder::resolve_symbol) {
                Ok(native_frames) => {
                    trace.frames = stack_correlator::merge(std::mem::take(&mut trace.frames), native_frames, (version.major, version.minor), mode);
                }
                Err(e) => log::warn!("failed to unwind native stack for thread {os_thread_id}: {e}"),
            }
        }
    }

    for trace in &mut traces {
        stack_correlator::annotate_status(trace);
    }

    Ok(traces)
}

/// Runs the full pipeline against a core file, optionally given an
/// explicit executable path when the core's own `NT_FILE` record can't be
/// trusted (stripped container image, relocated rootfs, etc).
pub fn inspect_core(corefile: &Path, executable_hint: Option<&Path>, config: &Config) -> Result<Vec<StackTrace>, Error> {
    let core = CoreDump::new(corefile)?;

    let python_map = executable_hint
        .and_then(|hint| core.maps.iter().find(|m| m.path.as_deref() == Some(hint)))
        .or_else(|| core.maps.iter().find(|m| m.is_executable() && m.path.is_some()))
        .ok_or_else(|| format_err!("failed to find the python binary's mapping in the core file"))?
        .clone();
    let python_path = resolve_core_path(&core, &python_map, config)?;

    let libpython_map = core
        .maps
        .iter()
        .find(|m| m.path.as_deref().map(maps::is_python_lib).unwrap_or(false))
        .cloned();
    let libpython_path = match &libpython_map {
        Some(m) => Some(resolve_core_path(&core, m, config)?),
        None => None,
    };

    let mut map_info = maps::resolve(core.maps.clone(), &python_path, libpython_path.as_deref())?;

    let version = detect_version_core(&python_path, libpython_path.as_deref(), &map_info, &core)?;

    let python_bias = load_bias(&python_path, python_map.start)?;
    let python_image = ElfImage::open(&python_path, python_bias)?;
    let libpython_image = match (&libpython_path, &libpython_map) {
        (Some(p), Some(m)) => Some(ElfImage::open(p, load_bias(p, m.start)?)?),
        _ => None,
    };

    let offsets = offsets::resolve(&core, &python_image, libpython_image.as_ref(), version.major, version.minor)
        .ok_or_else(|| format_err!("unsupported python version {version}"))?;

    let bss_source = libpython_image.as_ref().unwrap_or(&python_image);
    let bss_module_maps: Vec<_> = map_info.all.iter().filter(|m| m.path.as_deref() == Some(bss_source.path.as_path())).cloned().collect();
    map_info.bss = maps::get_bss(bss_source, &bss_module_maps);

    let policy = if config.exhaustive { Policy::Exhaustive } else { Policy::Auto };
    let symbol_name = if version.major == 2 || (version.major == 3 && version.minor < 7) {
        "interp_head"
    } else {
        "_PyRuntime"
    };
    let validator = runtime_locator::structural_validator(&core, &offsets, &map_info, symbol_name);
    let located = runtime_locator::locate(
        &core,
        &python_image,
        libpython_image.as_ref(),
        &map_info,
        symbol_name,
        "_PyRuntimeState",
        &validator,
        policy,
    )?;
    log::info!("located {symbol_name} via {} at 0x{:016x}", located.strategy, located.addr);

    let interp_addr = interp_head_addr(&core, &offsets, located.addr, symbol_name)?;
    let gil_current_ptr = gil_current_thread_addr(&offsets, located.addr, symbol_name);
    let gil_thread_id = structure_walker::get_gil_threadid(&core, &offsets, gil_current_ptr).unwrap_or(0);

    let mut traces = structure_walker::get_stack_traces(
        &core,
        &offsets,
        interp_addr,
        gil_thread_id,
        config.dump_locals > 0,
        config.dump_locals > 1,
        &map_info,
    )?;

    let mode = if config.native_mode == crate::config::NativeMode::NativeLast {
        stack_correlator::MergeMode::NativeLast
    } else {
        stack_correlator::MergeMode::Interleaved
    };

    for (i, trace) in traces.iter_mut().enumerate() {
        trace.pid = core.psinfo.map(|p| p.pr_pid).unwrap_or(0);
        if config.native_mode.is_enabled() {
            if let Some(regs) = core.registers_for(i) {
                let modules: Vec<crate::native_unwinder::Module> = std::iter::once(&python_image)
                    .chain(libpython_image.as_ref())
                    .map(|img| crate::native_unwinder::Module { image: img, base: img.bias })
                    .collect();
                let native_frames = crate::native_unwinder::unwind_core(
                    regs,
                    &modules,
                    &map_info,
                    |addr| core.read_u64(addr),
                    crate::native_unwinder::resolve_symbol,
                );
                trace.frames = stack_correlator::merge(
                    std::mem::take(&mut trace.frames),
                    native_frames,
                    (version.major, version.minor),
                    mode,
                );
            }
        }
        stack_correlator::annotate_status(trace);
    }

    Ok(traces)
}

fn locate_python_binary(maps: &[maps::VirtualMap]) -> Result<PathBuf, Error> {
    maps.iter()
        .find(|m| m.path.as_deref().map(maps::is_python_binary).unwrap_or(false) && m.is_executable())
        .and_then(|m| m.path.clone())
        .or_else(|| maps.iter().find(|m| m.is_executable() && m.path.is_some()).and_then(|m| m.path.clone()))
        .ok_or_else(|| format_err!("could not find the target's own executable among its mapped files"))
}

fn resolve_core_path(core: &CoreDump, map: &maps::VirtualMap, config: &Config) -> Result<PathBuf, Error> {
    let recorded = map
        .path
        .as_ref()
        .ok_or_else(|| format_err!("module has no recorded path in the core file"))?;
    core.resolve_module_path(recorded, &config.lib_search_path, config.lib_search_root.as_deref())
        .ok_or_else(|| crate::errors::EngineError::DetectedExecutableNotFound { path: recorded.clone() }.into())
}

fn load_bias(path: &Path, map_start: usize) -> Result<u64, Error> {
    let vaddr = ElfImage::first_exec_load_vaddr(path)?;
    Ok((map_start as u64).wrapping_sub(vaddr))
}

fn detect_version<P: ProcessMemory>(
    python_path: &Path,
    libpython_path: Option<&Path>,
    maps: &MapInfo,
    process: &P,
    config: &Config,
) -> Result<Version, Error> {
    if let Some(lib) = libpython_path {
        if let Some(v) = Version::from_libpython_path(lib) {
            return Ok(v);
        }
    }
    if let Ok(bytes) = crate::memory::read(process, maps.python.start, maps.python.size().min(1 << 20)) {
        if let Ok(v) = Version::scan_bytes(&bytes) {
            return Ok(v);
        }
    }
    if let Some(v) = Version::from_binary_path(python_path) {
        return Ok(v);
    }
    if !config.self_attach {
        if let Some(v) = Version::from_subprocess_version(python_path) {
            return Ok(v);
        }
    }
    Err(format_err!("could not determine the target's python version"))
}

fn detect_version_core(
    python_path: &Path,
    libpython_path: Option<&Path>,
    maps: &MapInfo,
    core: &CoreDump,
) -> Result<Version, Error> {
    if let Some(lib) = libpython_path {
        if let Some(v) = Version::from_libpython_path(lib) {
            return Ok(v);
        }
    }
    if let Ok(bytes) = crate::memory::read(core, maps.python.start, maps.python.size().min(1 << 20)) {
        if let Ok(v) = Version::scan_bytes(&bytes) {
            return Ok(v);
        }
    }
    Version::from_binary_path(python_path).ok_or_else(|| format_err!("could not determine the core's python version"))
}

/// The runtime locator returns the address of `_PyRuntime` itself (or, on
/// ancient interpreters, `interp_head` directly); this resolves that down
/// to the actual `PyInterpreterState*` the Structure Walker needs to
/// start its thread walk from.
fn interp_head_addr<P: ProcessMemory>(process: &P, offsets: &Offsets, located: usize, symbol_name: &str) -> Result<usize, Error> {
    if symbol_name == "interp_head" {
        return Ok(located);
    }
    let bytes = crate::memory::read(process, located + offsets.runtime_interp_head.offset, 8)?;
    Ok(usize::from_le_bytes(bytes.try_into().unwrap()))
}

/// The address of the pointer cell that holds the GIL-holding thread's
/// `PyThreadState*`, or 0 on interpreters too old to have `_PyRuntime`
/// (the Structure Walker treats 0 as "nobody holds the GIL").
fn gil_current_thread_addr(offsets: &Offsets, located: usize, symbol_name: &str) -> usize {
    if symbol_name == "interp_head" {
        return 0;
    }
    match offsets.runtime_gil_current_thread {
        Some(field) => located + field.offset,
        None => 0,
    }
}
