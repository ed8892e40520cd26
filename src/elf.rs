//! ELF/DWARF Oracle: opens a module's on-disk image, indexes
//! its symbol tables, build-id and DWARF sections, and answers symbol/type
//! queries with already-biased (target-virtual) addresses.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use goblin::elf::Elf;
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::section_header::{SHT_NOBITS, SHT_NOTE};

use crate::errors::EngineError;

pub struct ElfImage {
    pub path: PathBuf,
    pub bias: u64,
    data: Vec<u8>,
    symbols: HashMap<String, u64>,
    /// Whether a symbol is actually *defined* in this module (section index
    /// != SHN_UNDEF) as opposed to merely imported/aliased. Used to break
    /// ties when the same symbol name is mapped into more than one module
    /// (scenario F: `_PyRuntime` in both a static binary and a dlopened
    /// libpython via a libffi trampoline).
    defined: HashMap<String, bool>,
    bss: Option<(u64, u64)>,
    build_id: Option<Vec<u8>>,
    debug_info_range: Option<(usize, usize)>,
    debug_abbrev_range: Option<(usize, usize)>,
    debug_str_range: Option<(usize, usize)>,
    debug_line_range: Option<(usize, usize)>,
    eh_frame_range: Option<(usize, usize)>,
    eh_frame_addr: u64,
    debug_frame_range: Option<(usize, usize)>,
}

/// One global's DWARF-declared type name and its (biased) address.
pub struct TypedGlobal {
    pub name: String,
    pub type_name: String,
    pub addr: u64,
}

impl ElfImage {
    /// Opens and indexes an ELF image. `bias` is the module's load bias:
    /// the difference between its runtime base address and the vaddr of its
    /// first `PT_LOAD` segment, already known to the caller from the Map
    /// Resolver.
    pub fn open(path: &Path, bias: u64) -> Result<ElfImage, EngineError> {
        let data = fs::read(path).map_err(|e| EngineError::invalid_executable(path.to_path_buf(), e))?;
        let elf = Elf::parse(&data).map_err(|e| EngineError::invalid_executable(path.to_path_buf(), e))?;

        let mut symbols = HashMap::new();
        let mut defined: HashMap<String, bool> = HashMap::new();
        for sym in elf.syms.iter().chain(elf.dynsyms.iter()) {
            if sym.st_name == 0 {
                continue;
            }
            let name = match elf.strtab.get_at(sym.st_name) {
                Some(n) => n.to_owned(),
                None => match elf.dynstrtab.get_at(sym.st_name) {
                    Some(n) => n.to_owned(),
                    None => continue,
                },
            };
            let is_defined = sym.st_shndx != goblin::elf::section_header::SHN_UNDEF as usize;
            let addr = sym.st_value.wrapping_add(bias);
            // prefer a defined symbol over an imported alias; among equally
            // defined/undefined entries keep the first one seen (.symtab
            // before .dynsym since symtab is the fuller table)
            let better = match (symbols.get(&name), defined.get(&name)) {
                (None, _) => true,
                (Some(_), Some(&prev_defined)) => is_defined && !prev_defined,
                _ => false,
            };
            if better {
                symbols.insert(name.clone(), addr);
                defined.insert(name, is_defined);
            }
        }

        let bss = elf
            .section_headers
            .iter()
            .find(|s| s.sh_type == SHT_NOBITS && elf.shdr_strtab.get_at(s.sh_name) == Some(".bss"))
            .map(|s| (s.sh_addr.wrapping_add(bias), s.sh_size));

        let build_id = elf
            .iter_note_headers(&data)
            .into_iter()
            .flatten()
            .filter_map(|n| n.ok())
            .find(|n| n.n_type == goblin::elf::note::NT_GNU_BUILD_ID)
            .map(|n| n.desc.to_vec());

        let section_range = |name: &str| -> Option<(usize, usize)> {
            elf.section_headers
                .iter()
                .find(|s| elf.shdr_strtab.get_at(s.sh_name) == Some(name) && s.sh_type != SHT_NOTE)
                .map(|s| (s.sh_offset as usize, (s.sh_offset + s.sh_size) as usize))
        };
        let eh_frame_addr = elf
            .section_headers
            .iter()
            .find(|s| elf.shdr_strtab.get_at(s.sh_name) == Some(".eh_frame"))
            .map(|s| s.sh_addr)
            .unwrap_or(0);

        Ok(ElfImage {
            path: path.to_path_buf(),
            bias,
            symbols,
            defined,
            bss,
            build_id,
            debug_info_range: section_range(".debug_info"),
            debug_abbrev_range: section_range(".debug_abbrev"),
            debug_str_range: section_range(".debug_str"),
            debug_line_range: section_range(".debug_line"),
            eh_frame_range: section_range(".eh_frame"),
            eh_frame_addr,
            debug_frame_range: section_range(".debug_frame"),
            data,
        })
    }

    pub fn symbol_addr(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub fn is_symbol_defined(&self, name: &str) -> bool {
        self.defined.get(name).copied().unwrap_or(false)
    }

    /// Finds the defined symbol whose (biased) address is the closest one
    /// at or below `addr`, for labeling a native frame's program counter
    /// when no line-table entry covers it exactly.
    pub fn nearest_symbol(&self, addr: u64) -> Option<(&str, u64)> {
        self.symbols
            .iter()
            .filter(|(name, &a)| a <= addr && self.defined.get(*name).copied().unwrap_or(false))
            .max_by_key(|(_, &a)| a)
            .map(|(name, &a)| (name.as_str(), a))
    }

    pub fn bss_info(&self) -> Option<(u64, u64)> {
        self.bss
    }

    pub fn build_id(&self) -> Option<&[u8]> {
        self.build_id.as_deref()
    }

    fn section_bytes(&self, range: Option<(usize, usize)>) -> &[u8] {
        match range {
            Some((start, end)) if end <= self.data.len() => &self.data[start..end],
            _ => &[],
        }
    }

    /// Resolves a global variable whose DWARF-declared type matches
    /// `type_name`, returning its biased address. Walks only top-level
    /// compile-unit children
    /// (globals are never nested), which is sufficient for the structures
    /// this engine looks for (`_PyRuntime`, `interp_head`).
    pub fn global_by_type(&self, type_name: &str) -> Option<u64> {
        self.find_globals()
            .into_iter()
            .find(|g| g.type_name == type_name)
            .map(|g| g.addr)
    }

    pub fn global_by_name(&self, var_name: &str) -> Option<TypedGlobal> {
        self.find_globals().into_iter().find(|g| g.name == var_name)
    }

    fn find_globals(&self) -> Vec<TypedGlobal> {
        let info = self.section_bytes(self.debug_info_range);
        if info.is_empty() {
            return Vec::new();
        }
        let abbrev = self.section_bytes(self.debug_abbrev_range);
        let debug_str = self.section_bytes(self.debug_str_range);

        let endian = gimli::RunTimeEndian::Little;
        let debug_info = gimli::DebugInfo::new(info, endian);
        let debug_abbrev = gimli::DebugAbbrev::new(abbrev, endian);
        let debug_str = gimli::DebugStr::new(debug_str, endian);

        let mut out = Vec::new();
        let mut units = debug_info.units();
        while let Ok(Some(header)) = units.next() {
            let abbrevs = match header.abbreviations(&debug_abbrev) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let mut entries = header.entries(&abbrevs);
            // name of the most recently seen base/struct type DIE, indexed by offset
            let mut type_names: HashMap<usize, String> = HashMap::new();
            while let Ok(Some((_, entry))) = entries.next_dfs() {
                if matches!(
                    entry.tag(),
                    gimli::DW_TAG_structure_type | gimli::DW_TAG_base_type | gimli::DW_TAG_typedef
                ) {
                    if let Some(name) = Self::die_name(entry, &debug_str) {
                        type_names.insert(entry.offset().0, name);
                    }
                    continue;
                }
                if entry.tag() != gimli::DW_TAG_variable {
                    continue;
                }
                let name = match Self::die_name(entry, &debug_str) {
                    Some(n) => n,
                    None => continue,
                };
                let type_name = entry
                    .attr_value(gimli::DW_AT_type)
                    .ok()
                    .flatten()
                    .and_then(|v| match v {
                        gimli::AttributeValue::UnitRef(r) => type_names.get(&r.0).cloned(),
                        _ => None,
                    })
                    .unwrap_or_default();
                let addr = entry
                    .attr_value(gimli::DW_AT_location)
                    .ok()
                    .flatten()
                    .and_then(|v| match v {
                        gimli::AttributeValue::Exprloc(expr) => {
                            Self::static_addr_from_expr(&expr)
                        }
                        _ => None,
                    });
                if let Some(addr) = addr {
                    out.push(TypedGlobal {
                        name,
                        type_name,
                        addr: addr.wrapping_add(self.bias),
                    });
                }
            }
        }
        out
    }

    fn die_name(
        entry: &gimli::DebuggingInformationEntry<gimli::EndianSlice<gimli::RunTimeEndian>>,
        debug_str: &gimli::DebugStr<gimli::EndianSlice<gimli::RunTimeEndian>>,
    ) -> Option<String> {
        match entry.attr_value(gimli::DW_AT_name).ok().flatten()? {
            gimli::AttributeValue::DebugStrRef(offset) => debug_str
                .get_str(offset)
                .ok()
                .and_then(|s| s.to_string().ok().map(|s| s.to_owned())),
            gimli::AttributeValue::String(s) => s.to_string().ok().map(|s| s.to_owned()),
            _ => None,
        }
    }

    /// Evaluates a minimal subset of a DWARF location expression: a bare
    /// `DW_OP_addr`, which is what a non-PIE global variable's location
    /// expression consists of.
    fn static_addr_from_expr(expr: &gimli::Expression<gimli::EndianSlice<gimli::RunTimeEndian>>) -> Option<u64> {
        let bytes = expr.0.slice();
        if bytes.len() >= 9 && bytes[0] == gimli::constants::DW_OP_addr.0 {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&bytes[1..9]);
            return Some(u64::from_le_bytes(arr));
        }
        None
    }

    pub fn eh_frame(&self) -> (&[u8], u64) {
        (self.section_bytes(self.eh_frame_range), self.eh_frame_addr)
    }

    pub fn debug_frame(&self) -> &[u8] {
        self.section_bytes(self.debug_frame_range)
    }

    pub fn debug_line(&self) -> &[u8] {
        self.section_bytes(self.debug_line_range)
    }

    /// The vaddr (unbiased) of the first executable PT_LOAD segment, used
    /// by the Map Resolver to compute a module's load bias as
    /// `map.start() - this`.
    pub fn first_exec_load_vaddr(path: &Path) -> Result<u64, EngineError> {
        let data = fs::read(path).map_err(|e| EngineError::invalid_executable(path.to_path_buf(), e))?;
        let elf = Elf::parse(&data).map_err(|e| EngineError::invalid_executable(path.to_path_buf(), e))?;
        elf.program_headers
            .iter()
            .find(|h| h.p_type == PT_LOAD && h.is_executable())
            .map(|h| h.p_vaddr)
            .ok_or_else(|| EngineError::invalid_executable(path.to_path_buf(), "no executable PT_LOAD segment"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_self_binary_has_symbols() {
        // /proc/self/exe is always a valid ELF on the platforms this crate targets
        let path = PathBuf::from("/proc/self/exe");
        if let Ok(image) = ElfImage::open(&path, 0) {
            // main or _start should be resolvable as a defined symbol in
            // any non-stripped test binary; if the test binary is stripped
            // this degrades to an empty symbol table rather than a panic.
            let _ = image.symbol_addr("main");
            let _ = image.bss_info();
        }
    }
}
