//! Map Resolver: the address space of either a live process
//! or a core file, reduced to one common shape so every other component
//! never needs to know which backend it is walking.

use std::path::{Path, PathBuf};

use crate::elf::ElfImage;
use crate::errors::EngineError;

/// One mapped region, whether it came from `/proc/<pid>/maps` or from a
/// core file's `PT_LOAD` + `NT_FILE` notes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMap {
    pub start: usize,
    pub end: usize,
    pub file_offset: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub private: bool,
    pub path: Option<PathBuf>,
}

impl VirtualMap {
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn is_anonymous(&self) -> bool {
        self.path.is_none()
    }
}

/// Minimum/maximum mapped address of the process, excluding pseudo-regions
/// (`[heap]`, `[stack]`, `[vdso]`, `[vvar]`, `[vsyscall]`) that don't belong
/// to any loaded module and would otherwise skew a "does this pointer look
/// sane at all" sanity check.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange {
    pub min: usize,
    pub max: usize,
}

impl MemoryRange {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.min && addr < self.max
    }
}

/// The resolved view of a target's address space needed by the rest of the
/// engine: the overall range, the heap and bss (for BSS-scan locator
/// strategies), and the binary/libpython module maps.
#[derive(Debug)]
pub struct MapInfo {
    pub range: MemoryRange,
    pub heap: Option<VirtualMap>,
    pub bss: Option<VirtualMap>,
    pub python: VirtualMap,
    pub libpython: Option<VirtualMap>,
    pub all: Vec<VirtualMap>,
}

pub trait ContainsAddr {
    fn contains_addr(&self, addr: usize) -> bool;
}

impl ContainsAddr for Vec<VirtualMap> {
    fn contains_addr(&self, addr: usize) -> bool {
        self.iter().any(|m| m.contains(addr))
    }
}

impl ContainsAddr for MapInfo {
    fn contains_addr(&self, addr: usize) -> bool {
        self.all.contains_addr(addr)
    }
}

const PSEUDO_REGIONS: &[&str] = &["[heap]", "[stack]", "[vdso]", "[vvar]", "[vsyscall]"];

fn is_pseudo(path: &Option<PathBuf>) -> bool {
    match path {
        Some(p) => {
            let s = p.to_string_lossy();
            PSEUDO_REGIONS.iter().any(|p| s == *p)
        }
        None => false,
    }
}

/// Live-process map enumeration via `/proc/<pid>/maps` (through the
/// `proc-maps` crate, same as py-spy's process-info module).
pub fn maps_for_pid(pid: remoteprocess::Pid) -> Result<Vec<VirtualMap>, EngineError> {
    let ranges = proc_maps::get_process_maps(pid as proc_maps::Pid)
        .map_err(|_| EngineError::ProcessNotFound(pid))?;
    Ok(ranges
        .into_iter()
        .map(|r| VirtualMap {
            start: r.start(),
            end: r.start() + r.size(),
            file_offset: r.offset as u64,
            readable: r.is_read(),
            writable: r.is_write(),
            executable: r.is_exec(),
            private: true,
            path: r.filename().map(|p| p.to_path_buf()),
        })
        .collect())
}

fn lower_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

pub fn is_python_lib(path: &Path) -> bool {
    let name = lower_name(path);
    lazy_static::lazy_static! {
        static ref LIBPYTHON_RE: regex::Regex =
            regex::Regex::new(r"^libpython(\d+(\.\d+)?)?(m|d)?\.(so|dylib|dll)").unwrap();
    }
    LIBPYTHON_RE.is_match(&name)
}

pub fn is_python_binary(path: &Path) -> bool {
    let name = lower_name(path);
    lazy_static::lazy_static! {
        static ref PYTHON_BIN_RE: regex::Regex =
            regex::Regex::new(r"^python(\d+(\.\d+)?)?(\.exe)?$").unwrap();
    }
    PYTHON_BIN_RE.is_match(&name)
}

/// Finds the distinct file-backed modules in `maps`, in first-appearance
/// (load) order, paired with the lowest-address map for each (used as the
/// load point for bias computation).
fn modules(maps: &[VirtualMap]) -> Vec<(PathBuf, VirtualMap)> {
    let mut seen: Vec<(PathBuf, VirtualMap)> = Vec::new();
    for m in maps {
        let path = match &m.path {
            Some(p) if !is_pseudo(&Some(p.clone())) => p.clone(),
            _ => continue,
        };
        match seen.iter_mut().find(|(p, _)| p == &path) {
            Some((_, existing)) if existing.start <= m.start => {}
            Some(slot) => slot.1 = m.clone(),
            None => seen.push((path, m.clone())),
        }
    }
    seen
}

/// Resolves the target module's on-disk `.bss` VMA, adds its load bias,
/// and finds the containing mapped region. When no file-backed map covers
/// that address (common: bss is anonymous, zero-fill-on-demand, and
/// sometimes not mapped until touched) falls back to the first writable
/// anonymous region belonging to the module's address range.
pub fn get_bss(image: &ElfImage, module_maps: &[VirtualMap]) -> Option<VirtualMap> {
    let (bss_vaddr, bss_size) = image.bss_info()?;
    if bss_size == 0 {
        return None;
    }
    if let Some(m) = module_maps.iter().find(|m| m.contains(bss_vaddr as usize)) {
        return Some(m.clone());
    }
    let module_start = module_maps.iter().map(|m| m.start).min()?;
    let module_end = module_maps.iter().map(|m| m.end).max()?;
    module_maps
        .iter()
        .find(|m| m.is_anonymous() && m.is_writable() && m.start >= module_start && m.end <= module_end)
        .cloned()
}

/// Resolves the full [`MapInfo`] for a target given its enumerated maps and
/// the already-identified python/libpython binary paths.
pub fn resolve(
    maps: Vec<VirtualMap>,
    python_path: &Path,
    libpython_path: Option<&Path>,
) -> Result<MapInfo, EngineError> {
    let mods = modules(&maps);

    let live_min = maps
        .iter()
        .filter(|m| !is_pseudo(&m.path) || m.path.is_none())
        .map(|m| m.start)
        .min();
    let range = MemoryRange {
        min: live_min.unwrap_or(0),
        max: maps.iter().map(|m| m.end).max().unwrap_or(0),
    };

    let python_maps: Vec<VirtualMap> = maps
        .iter()
        .filter(|m| m.path.as_deref() == Some(python_path))
        .cloned()
        .collect();
    if python_maps.is_empty() {
        return Err(EngineError::MissingExecutableMaps {
            path: python_path.to_path_buf(),
            detail: "no mapped region matches this executable path".to_string(),
        });
    }
    let python = python_maps
        .iter()
        .min_by_key(|m| m.start)
        .cloned()
        .expect("non-empty");

    let libpython = match libpython_path {
        Some(p) => maps
            .iter()
            .find(|m| m.path.as_deref() == Some(p))
            .cloned(),
        None => {
            let candidates: Vec<&VirtualMap> = maps
                .iter()
                .filter(|m| m.path.as_deref().map(is_python_lib).unwrap_or(false))
                .collect();
            let distinct: Vec<PathBuf> = {
                let mut v: Vec<PathBuf> = candidates
                    .iter()
                    .filter_map(|m| m.path.clone())
                    .collect();
                v.sort();
                v.dedup();
                v
            };
            if distinct.len() > 1 {
                return Err(EngineError::MultipleLibpython(distinct));
            }
            candidates.into_iter().min_by_key(|m| m.start).cloned()
        }
    };

    let heap = maps
        .iter()
        .find(|m| m.path.as_deref().map(|p| p.to_string_lossy() == "[heap]").unwrap_or(false))
        .cloned();

    let _ = mods;
    Ok(MapInfo {
        range,
        heap,
        bss: None,
        python,
        libpython,
        all: maps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(start: usize, end: usize, path: Option<&str>) -> VirtualMap {
        VirtualMap {
            start,
            end,
            file_offset: 0,
            readable: true,
            writable: false,
            executable: false,
            private: true,
            path: path.map(PathBuf::from),
        }
    }

    #[test]
    fn test_contains_addr() {
        let maps = vec![map(0x1000, 0x2000, None), map(0x3000, 0x4000, None)];
        assert!(maps.contains_addr(0x1500));
        assert!(!maps.contains_addr(0x2500));
        assert!(maps.contains_addr(0x3fff));
        assert!(!maps.contains_addr(0x4000));
    }

    #[test]
    fn test_is_python_lib() {
        assert!(is_python_lib(Path::new("/usr/lib/libpython3.10.so.1.0")));
        assert!(is_python_lib(Path::new("/usr/lib/libpython3.so")));
        assert!(!is_python_lib(Path::new("/usr/lib/libc.so.6")));
    }

    #[test]
    fn test_is_python_binary() {
        assert!(is_python_binary(Path::new("/usr/bin/python3.10")));
        assert!(is_python_binary(Path::new("python")));
        assert!(!is_python_binary(Path::new("pythonic-thing")));
    }

    #[test]
    fn test_resolve_missing_executable_maps() {
        let maps = vec![map(0x1000, 0x2000, Some("/usr/lib/libc.so.6"))];
        let err = resolve(maps, Path::new("/usr/bin/python3.10"), None).unwrap_err();
        assert!(matches!(err, EngineError::MissingExecutableMaps { .. }));
    }

    #[test]
    fn test_resolve_multiple_libpython() {
        let maps = vec![
            map(0x1000, 0x2000, Some("/usr/bin/python3.10")),
            map(0x3000, 0x4000, Some("/usr/lib/libpython3.10.so")),
            map(0x5000, 0x6000, Some("/opt/conda/lib/libpython3.10.so")),
        ];
        let err = resolve(maps, Path::new("/usr/bin/python3.10"), None).unwrap_err();
        assert!(matches!(err, EngineError::MultipleLibpython(_)));
    }

    #[test]
    fn test_resolve_picks_lowest_start_for_python_map() {
        let maps = vec![
            map(0x2000, 0x3000, Some("/usr/bin/python3.10")),
            map(0x1000, 0x2000, Some("/usr/bin/python3.10")),
        ];
        let info = resolve(maps, Path::new("/usr/bin/python3.10"), None).unwrap();
        assert_eq!(info.python.start, 0x1000);
    }
}
