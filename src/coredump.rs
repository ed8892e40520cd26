//! Core-file backend: parses a core's ELF
//! notes into the same `VirtualMap`/`MemoryRange` shapes the live backend
//! produces, and implements `ProcessMemory` by reading straight out of the
//! mmap'd core file instead of `/proc/<pid>/mem`.
//!
//! Grounded in py-spy's `coredump.rs`: the `NT_FILE`/`NT_PRSTATUS`/
//! `NT_PRPSINFO` note parsing is kept almost unchanged (it's already a
//! faithful manual decode of the kernel's core format), generalized to
//! hand the Map Resolver real [`VirtualMap`]s and to expose each thread's
//! general-purpose registers for the Native Unwinder, which the upstream
//! tool never needed because core dumps were stack-trace-only there.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use remoteprocess::ProcessMemory;

use crate::maps::VirtualMap;

pub struct CoreDump {
    pub filename: PathBuf,
    contents: Vec<u8>,
    pub maps: Vec<VirtualMap>,
    pub psinfo: Option<elfcore::elf_prpsinfo>,
    pub status: Vec<elfcore::elf_prstatus>,
}

impl CoreDump {
    pub fn new<P: AsRef<Path>>(filename: P) -> Result<CoreDump, Error> {
        let filename = filename.as_ref();
        let mut file = File::open(filename)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let elf = goblin::elf::Elf::parse(&contents)?;

        let notes = elf
            .iter_note_headers(&contents)
            .ok_or_else(|| format_err!("no note segment found"))?;

        let mut filenames: HashMap<u64, PathBuf> = HashMap::new();
        let mut psinfo = None;
        let mut status = Vec::new();
        for note in notes.flatten() {
            if note.n_type == goblin::elf::note::NT_PRPSINFO {
                if note.desc.len() >= std::mem::size_of::<elfcore::elf_prpsinfo>() {
                    psinfo = Some(unsafe { *(note.desc.as_ptr() as *const elfcore::elf_prpsinfo) });
                }
            } else if note.n_type == goblin::elf::note::NT_PRSTATUS {
                if note.desc.len() >= std::mem::size_of::<elfcore::elf_prstatus>() {
                    let thread_status =
                        unsafe { *(note.desc.as_ptr() as *const elfcore::elf_prstatus) };
                    status.push(thread_status);
                }
            } else if note.n_type == goblin::elf::note::NT_FILE {
                let data = note.desc;
                let ptrs = data.as_ptr() as *const usize;

                let count = unsafe { *ptrs };
                let _page_size = unsafe { *ptrs.offset(1) };

                let string_table = &data[(std::mem::size_of::<usize>() * (2 + count * 3))..];

                for (i, filename) in string_table.split(|chr| *chr == 0).enumerate() {
                    if i < count {
                        let i = i as isize;
                        let start = unsafe { *ptrs.offset(i * 3 + 2) } as u64;
                        let pathname = Path::new(&OsStr::from_bytes(filename)).to_path_buf();
                        filenames.insert(start, pathname);
                    }
                }
            }
        }

        let mut maps = Vec::new();
        for ph in &elf.program_headers {
            if ph.p_type == goblin::elf::program_header::PT_LOAD {
                // A core file's NT_FILE note keys by page-aligned vaddr;
                // a PT_LOAD segment's own vaddr should match exactly since
                // the kernel dumps whole pages, but tolerate a mismatch by
                // falling back to "no backing file" for that range rather
                // than guessing at a neighbor's path.
                let path = filenames.get(&ph.p_vaddr).cloned();
                log::debug!(
                    "map: {:016x}-{:016x} {}{}{} {}",
                    ph.p_vaddr,
                    ph.p_vaddr + ph.p_memsz,
                    if ph.is_read() { 'r' } else { '-' },
                    if ph.is_write() { 'w' } else { '-' },
                    if ph.is_executable() { 'x' } else { '-' },
                    path.as_deref().unwrap_or(Path::new("")).display()
                );
                maps.push(VirtualMap {
                    start: ph.p_vaddr as usize,
                    end: (ph.p_vaddr + ph.p_memsz) as usize,
                    file_offset: ph.p_offset,
                    readable: ph.is_read(),
                    writable: ph.is_write(),
                    executable: ph.is_executable(),
                    private: true,
                    path,
                });
            }
        }

        Ok(CoreDump { filename: filename.to_owned(), contents, maps, psinfo, status })
    }

    /// `--lib-search-path`/`--lib-search-root` fallback:
    /// when a module's `NT_FILE`-recorded path doesn't exist on this host,
    /// retry against each search path joined with the module's basename,
    /// then the search root joined with the basename.
    pub fn resolve_module_path(
        &self,
        recorded: &Path,
        search_paths: &[PathBuf],
        search_root: Option<&Path>,
    ) -> Option<PathBuf> {
        if recorded.exists() {
            return Some(recorded.to_path_buf());
        }
        let basename = recorded.file_name()?;
        for dir in search_paths {
            let candidate = dir.join(basename);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        if let Some(root) = search_root {
            let candidate = root.join(basename);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    /// Registers of the first recorded thread, used as the unwind seed
    /// for that thread's native stack.
    pub fn registers_for(&self, thread_index: usize) -> Option<crate::native_unwinder::Registers> {
        let regs = self.status.get(thread_index)?.pr_reg;
        Some(crate::native_unwinder::Registers {
            rip: regs[16],
            rsp: regs[19],
            rbp: regs[4],
        })
    }

    pub fn read_u64(&self, addr: u64) -> Option<u64> {
        let bytes = ProcessMemory::copy(self, addr as usize, 8).ok()?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }
}

impl ProcessMemory for CoreDump {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), remoteprocess::Error> {
        let start = addr as u64;
        for map in &self.maps {
            if start >= map.start as u64 && start <= (map.end as u64) {
                let offset = (start - map.start as u64 + map.file_offset) as usize;
                if offset + buf.len() > self.contents.len() {
                    break;
                }
                buf.copy_from_slice(&self.contents[offset..(offset + buf.len())]);
                return Ok(());
            }
        }
        let io_error = std::io::Error::from_raw_os_error(libc::EFAULT);
        Err(remoteprocess::Error::IOError(io_error))
    }
}

pub mod elfcore {
    #[repr(C)]
    #[derive(Debug, Copy, Clone)]
    pub struct elf_siginfo {
        pub si_signo: ::std::os::raw::c_int,
        pub si_code: ::std::os::raw::c_int,
        pub si_errno: ::std::os::raw::c_int,
    }

    #[repr(C)]
    #[derive(Debug, Copy, Clone)]
    pub struct timeval {
        pub tv_sec: ::std::os::raw::c_long,
        pub tv_usec: ::std::os::raw::c_long,
    }

    /// Linux x86_64 `user_regs_struct`, in the exact kernel field order,
    /// as embedded in `elf_prstatus.pr_reg`.
    pub type ElfGregSet = [u64; 27];

    #[repr(C)]
    #[derive(Debug, Copy, Clone)]
    pub struct elf_prstatus {
        pub pr_info: elf_siginfo,
        pub pr_cursig: ::std::os::raw::c_short,
        pub pr_sigpend: ::std::os::raw::c_ulong,
        pub pr_sighold: ::std::os::raw::c_ulong,
        pub pr_pid: ::std::os::raw::c_int,
        pub pr_ppid: ::std::os::raw::c_int,
        pub pr_pgrp: ::std::os::raw::c_int,
        pub pr_sid: ::std::os::raw::c_int,
        pub pr_utime: timeval,
        pub pr_stime: timeval,
        pub pr_cutime: timeval,
        pub pr_cstime: timeval,
        pub pr_reg: ElfGregSet,
        pub pr_fpvalid: ::std::os::raw::c_int,
    }

    #[repr(C)]
    #[derive(Debug, Copy, Clone)]
    pub struct elf_prpsinfo {
        pub pr_state: ::std::os::raw::c_char,
        pub pr_sname: ::std::os::raw::c_char,
        pub pr_zomb: ::std::os::raw::c_char,
        pub pr_nice: ::std::os::raw::c_char,
        pub pr_flag: ::std::os::raw::c_ulong,
        pub pr_uid: ::std::os::raw::c_uint,
        pub pr_gid: ::std::os::raw::c_uint,
        pub pr_pid: ::std::os::raw::c_int,
        pub pr_ppid: ::std::os::raw::c_int,
        pub pr_pgrp: ::std::os::raw::c_int,
        pub pr_sid: ::std::os::raw::c_int,
        pub pr_fname: [::std::os::raw::c_uchar; 16usize],
        pub pr_psargs: [::std::os::raw::c_uchar; 80usize],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_module_path_falls_back_to_search_paths() {
        let dir = tempfile::tempdir().unwrap();
        let lib_dir = dir.path().join("lib");
        std::fs::create_dir_all(&lib_dir).unwrap();
        let real = lib_dir.join("libfoo.so");
        std::fs::write(&real, b"x").unwrap();

        let core = CoreDump {
            filename: PathBuf::new(),
            contents: Vec::new(),
            maps: Vec::new(),
            psinfo: None,
            status: Vec::new(),
        };
        let recorded = Path::new("/nonexistent/path/libfoo.so");
        let resolved = core.resolve_module_path(recorded, &[lib_dir.clone()], None);
        assert_eq!(resolved, Some(real));
    }

    #[test]
    fn test_resolve_module_path_prefers_recorded_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("present.so");
        std::fs::write(&real, b"x").unwrap();
        let core = CoreDump {
            filename: PathBuf::new(),
            contents: Vec::new(),
            maps: Vec::new(),
            psinfo: None,
            status: Vec::new(),
        };
        assert_eq!(core.resolve_module_path(&real, &[], None), Some(real));
    }
}
