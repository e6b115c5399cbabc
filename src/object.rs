//! The object aggregate: open, classification, load, and teardown.
//!
//! `open` runs the ELF phase (section discovery, map table construction,
//! program naming, relocation collection) over borrowed scratch state
//! that is dropped when it returns. `load` runs the kernel phase:
//! validation, map creation, instruction patching, and ordered program
//! submission.

use std::any::Any;
use std::fs;
use std::os::fd::RawFd;
use std::path::Path;

use crate::btf::{TypeInfo, TypeInfoParser};
use crate::elf::{ElfObject, STB_GLOBAL, SHF_EXECINSTR, SHT_PROGBITS, SHT_REL, SHT_SYMTAB, Sym};
use crate::error::{Error, Result};
use crate::maps::{self, Map};
use crate::programs::types::{self, AttachType, ProgType};
use crate::programs::Program;
use crate::reloc;
use crate::sys::KernelBpf;

/// License bytes retained, terminator excluded.
const LICENSE_MAX: usize = 63;

const SEC_LICENSE: &str = "license";
const SEC_VERSION: &str = "version";
const SEC_MAPS: &str = "maps";
const SEC_BTF: &str = ".BTF";
pub(crate) const SEC_TEXT: &str = ".text";

/// Open-time configuration.
#[derive(Default)]
pub struct OpenOptions<'a> {
    /// Origin name for in-memory buffers; file opens use the path.
    pub name: Option<String>,
    /// Parser handed the `.BTF` section, when the object carries one.
    pub type_info: Option<&'a dyn TypeInfoParser>,
}

/// An opened bytecode object: programs, maps, and the state needed to
/// submit them to the kernel.
pub struct Object {
    pub(crate) name: String,
    pub(crate) license: String,
    pub(crate) kern_version: u32,
    pub(crate) programs: Vec<Program>,
    pub(crate) maps: Vec<Map>,
    pub(crate) btf: Option<Box<dyn TypeInfo>>,
    pub(crate) loaded: bool,
    pub(crate) has_pseudo_calls: bool,
    pub(crate) text_shndx: Option<usize>,
    user_data: Option<Box<dyn Any>>,
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("name", &self.name)
            .field("license", &self.license)
            .field("kern_version", &self.kern_version)
            .field("programs", &self.programs)
            .field("maps", &self.maps)
            .field("btf", &self.btf.is_some())
            .field("loaded", &self.loaded)
            .field("has_pseudo_calls", &self.has_pseudo_calls)
            .field("text_shndx", &self.text_shndx)
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}

impl Object {
    /// Open an object file from the filesystem.
    pub fn open_file<P: AsRef<Path>>(path: P, opts: &OpenOptions<'_>) -> Result<Object> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| {
            log::warn!("failed to read object '{}': {}", path.display(), e);
            Error::Libelf
        })?;
        Self::open_impl(&data, path.display().to_string(), opts)
    }

    /// Open an object from an in-memory buffer.
    pub fn open_buffer(data: &[u8], opts: &OpenOptions<'_>) -> Result<Object> {
        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-byte object", data.len()));
        Self::open_impl(data, name, opts)
    }

    fn open_impl(data: &[u8], name: String, opts: &OpenOptions<'_>) -> Result<Object> {
        log::debug!("opening object '{}'", name);
        let elf = ElfObject::parse(data, &name)?;

        let mut obj = Object {
            name,
            license: String::new(),
            kern_version: 0,
            programs: Vec::new(),
            maps: Vec::new(),
            btf: None,
            loaded: false,
            has_pseudo_calls: false,
            text_shndx: None,
            user_data: None,
        };

        // Scratch state for the ELF phase; dropped on return.
        let mut symbols: Option<Vec<Sym>> = None;
        let mut strtab_idx: Option<usize> = None;
        let mut maps_shndx: Option<usize> = None;
        let mut maps_data: Option<&[u8]> = None;
        let mut pending_rels: Vec<usize> = Vec::new();

        for (idx, sh) in elf.sections().iter().enumerate() {
            let sec_name = elf.section_name(sh).map_err(|e| {
                log::warn!("object '{}': failed to resolve name of section {}", obj.name, idx);
                e
            })?;
            log::debug!(
                "object '{}': section {} '{}' type {} size {}",
                obj.name,
                idx,
                sec_name,
                sh.sh_type,
                sh.size
            );

            if sec_name == SEC_LICENSE {
                obj.set_license(elf.section_data(sh)?);
            } else if sec_name == SEC_VERSION {
                obj.set_kern_version(elf.section_data(sh)?)?;
            } else if sec_name == SEC_MAPS {
                maps_shndx = Some(idx);
                maps_data = Some(elf.section_data(sh)?);
            } else if sec_name == SEC_BTF {
                match opts.type_info {
                    Some(parser) => match parser.parse(elf.section_data(sh)?) {
                        Ok(handle) => obj.btf = Some(handle),
                        Err(err) => log::warn!(
                            "object '{}': failed to parse type metadata ({:?}), continuing without",
                            obj.name,
                            err
                        ),
                    },
                    None => log::debug!(
                        "object '{}': no type-metadata parser configured, ignoring '.BTF'",
                        obj.name
                    ),
                }
            } else if sh.sh_type == SHT_SYMTAB {
                if symbols.is_some() {
                    log::warn!("object '{}' has multiple symbol tables", obj.name);
                    return Err(Error::Format);
                }
                symbols = Some(elf.symbols(sh)?);
                strtab_idx = Some(sh.link as usize);
            } else if sh.sh_type == SHT_PROGBITS && sh.flags & SHF_EXECINSTR != 0 && sh.size > 0 {
                if sec_name == SEC_TEXT {
                    obj.text_shndx = Some(idx);
                }
                let prog = Program::new(idx, sec_name, elf.section_data(sh)?)?;
                log::debug!("object '{}': found program '{}'", obj.name, sec_name);
                obj.programs.push(prog);
            } else if sh.sh_type == SHT_REL {
                match elf.section(sh.info as usize) {
                    Some(target) if target.flags & SHF_EXECINSTR != 0 => pending_rels.push(idx),
                    _ => log::debug!(
                        "object '{}': skipping relocations for non-code section {}",
                        obj.name,
                        sh.info
                    ),
                }
            } else {
                log::debug!("object '{}': skipping section '{}'", obj.name, sec_name);
            }
        }

        let symbols = symbols.ok_or_else(|| {
            log::warn!("object '{}' has no symbol table", obj.name);
            Error::Format
        })?;
        let strtab_idx = match strtab_idx {
            Some(idx) if idx != 0 && idx < elf.section_count() => idx,
            _ => {
                log::warn!("object '{}': string table index out of range", obj.name);
                return Err(Error::Format);
            }
        };

        // The maps section is interpreted only now, with the symbol
        // table guaranteed discovered.
        if let (Some(ms_idx), Some(ms_data)) = (maps_shndx, maps_data) {
            let map_syms = symbols
                .iter()
                .filter(|sym| sym.shndx as usize == ms_idx)
                .map(|sym| Ok((elf.string_at(strtab_idx, sym.name_off)?.to_string(), sym.value)))
                .collect::<Result<Vec<_>>>()?;
            obj.maps = maps::build_map_table(&obj.name, ms_data, map_syms)?;
        }

        obj.resolve_program_names(&elf, &symbols, strtab_idx)?;

        for rel_idx in pending_rels {
            let sh = elf.section(rel_idx).ok_or(Error::Internal)?;
            let target = sh.info as usize;
            let Some(prog) = obj
                .programs
                .iter_mut()
                .find(|p| p.section_index == target)
            else {
                log::warn!(
                    "object '{}': relocation section {} has no matching program",
                    obj.name,
                    rel_idx
                );
                return Err(Error::Reloc);
            };
            let saw_pseudo_call = reloc::collect(
                prog,
                elf.section_data(sh)?,
                sh.entsize as usize,
                &symbols,
                &obj.maps,
                maps_shndx,
                obj.text_shndx,
            )?;
            if saw_pseudo_call {
                obj.has_pseudo_calls = true;
            }
        }

        Ok(obj)
    }

    fn set_license(&mut self, data: &[u8]) {
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        let end = end.min(LICENSE_MAX);
        self.license = String::from_utf8_lossy(&data[..end]).into_owned();
        log::debug!("object '{}': license '{}'", self.name, self.license);
    }

    fn set_kern_version(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != 4 {
            log::warn!(
                "object '{}': version section has size {}, expected 4",
                self.name,
                data.len()
            );
            return Err(Error::Format);
        }
        self.kern_version = u32::from_le_bytes(data.try_into().expect("length checked"));
        log::debug!("object '{}': kernel version {:#x}", self.name, self.kern_version);
        Ok(())
    }

    /// Attach each program's canonical name: the first global symbol on
    /// its section, or the literal `".text"` for the shared pool.
    fn resolve_program_names(
        &mut self,
        elf: &ElfObject<'_>,
        symbols: &[Sym],
        strtab_idx: usize,
    ) -> Result<()> {
        for prog in &mut self.programs {
            let global = symbols
                .iter()
                .find(|sym| sym.binding() == STB_GLOBAL && sym.shndx as usize == prog.section_index);
            prog.name = match global {
                Some(sym) => elf.string_at(strtab_idx, sym.name_off)?.to_string(),
                None if prog.section_name == SEC_TEXT => SEC_TEXT.to_string(),
                None => {
                    log::warn!(
                        "object '{}': no global symbol names program '{}'",
                        self.name,
                        prog.section_name
                    );
                    return Err(Error::InvalidInput);
                }
            };
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn license(&self) -> &str {
        &self.license
    }

    pub fn kern_version(&self) -> u32 {
        self.kern_version
    }

    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    pub fn programs_mut(&mut self) -> &mut [Program] {
        &mut self.programs
    }

    pub fn maps(&self) -> &[Map] {
        &self.maps
    }

    pub fn maps_mut(&mut self) -> &mut [Map] {
        &mut self.maps
    }

    pub fn map_by_name(&self, name: &str) -> Option<&Map> {
        self.maps.iter().find(|m| m.name() == name)
    }

    pub fn map_by_name_mut(&mut self, name: &str) -> Option<&mut Map> {
        self.maps.iter_mut().find(|m| m.name() == name)
    }

    /// Map whose definition sits at `offset` in the maps section.
    pub fn map_by_offset(&self, offset: u64) -> Option<&Map> {
        self.maps
            .binary_search_by_key(&offset, |m| m.section_offset())
            .ok()
            .map(|idx| &self.maps[idx])
    }

    pub fn program_by_section_name(&self, section_name: &str) -> Option<&Program> {
        self.programs.iter().find(|p| p.section_name() == section_name)
    }

    pub fn program_by_section_name_mut(&mut self, section_name: &str) -> Option<&mut Program> {
        self.programs
            .iter_mut()
            .find(|p| p.section_name() == section_name)
    }

    pub fn btf(&self) -> Option<&dyn TypeInfo> {
        self.btf.as_deref()
    }

    pub fn set_user_data(&mut self, data: Box<dyn Any>) {
        self.user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<&dyn Any> {
        self.user_data.as_deref()
    }

    /// Create maps, patch instruction streams, and submit every program
    /// to the kernel.
    ///
    /// Map-creation failures close the descriptors that attempt opened.
    /// Program-load failures leave earlier descriptors with the object;
    /// they are released by [`Object::unload`] or drop.
    pub fn load(&mut self, kernel: &dyn KernelBpf) -> Result<()> {
        if self.loaded {
            log::warn!("object '{}' is already loaded", self.name);
            return Err(Error::InvalidInput);
        }
        self.validate()?;
        maps::create_maps(&mut self.maps, self.btf.as_deref(), kernel)?;
        self.relocate()?;
        self.load_programs(kernel)?;
        self.loaded = true;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for prog in &self.programs {
            // An inlined `.text` is never submitted on its own.
            if self.has_pseudo_calls && Some(prog.section_index) == self.text_shndx {
                continue;
            }
            if types::needs_kern_version(prog.prog_type) && self.kern_version == 0 {
                log::warn!(
                    "object '{}' provides no kernel version but program '{}' requires one",
                    self.name,
                    prog.section_name()
                );
                return Err(Error::KVersion);
            }
        }
        Ok(())
    }

    fn relocate(&mut self) -> Result<()> {
        // `.text` goes first so callers splice an already-patched pool.
        let text_idx = self
            .text_shndx
            .and_then(|sh| self.programs.iter().position(|p| p.section_index == sh));
        if let Some(ti) = text_idx {
            reloc::apply(&mut self.programs[ti], &self.maps, self.text_shndx, None)?;
        }
        let text_insns = text_idx.map(|ti| self.programs[ti].insns().to_vec());
        for i in 0..self.programs.len() {
            if Some(i) == text_idx {
                continue;
            }
            reloc::apply(
                &mut self.programs[i],
                &self.maps,
                self.text_shndx,
                text_insns.as_deref(),
            )?;
        }
        Ok(())
    }

    fn load_programs(&mut self, kernel: &dyn KernelBpf) -> Result<()> {
        let text_shndx = self.text_shndx;
        let has_pseudo_calls = self.has_pseudo_calls;
        for prog in &mut self.programs {
            // An inlined `.text` lives inside every caller already;
            // submitting it separately would duplicate it.
            if has_pseudo_calls && Some(prog.section_index) == text_shndx {
                log::debug!("object '{}': skipping inlined '.text'", self.name);
                continue;
            }
            prog.load(&self.license, self.kern_version, kernel)?;
        }
        Ok(())
    }

    /// Close every map and program-instance descriptor owned by this
    /// object. Safe to call repeatedly.
    pub fn unload(&mut self) {
        for map in &mut self.maps {
            if map.fd >= 0 {
                crate::sys::close_fd(map.fd);
                map.fd = -1;
            }
        }
        for prog in &mut self.programs {
            prog.unload();
        }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Options for the [`load_file`] convenience wrapper.
#[derive(Default)]
pub struct LoadOptions<'a> {
    /// Fixed program type; [`ProgType::Unspec`] infers per section name.
    pub prog_type: ProgType,
    pub expected_attach_type: AttachType,
    /// Network device index applied to every program and map, 0 for
    /// none.
    pub ifindex: u32,
    pub type_info: Option<&'a dyn TypeInfoParser>,
}

/// Open `path`, infer or apply program types, load everything, and hand
/// back the object together with the first loaded program's descriptor.
///
/// An object without programs fails with `NotFound`; a section name the
/// inference table does not know fails with `InvalidInput`.
pub fn load_file<P: AsRef<Path>>(
    path: P,
    opts: &LoadOptions<'_>,
    kernel: &dyn KernelBpf,
) -> Result<(Object, RawFd)> {
    let open_opts = OpenOptions {
        name: None,
        type_info: opts.type_info,
    };
    let mut obj = Object::open_file(path, &open_opts)?;
    load_object(&mut obj, opts, kernel)?;
    let fd = obj
        .programs
        .iter()
        .find_map(|p| p.fd())
        .ok_or(Error::Internal)?;
    Ok((obj, fd))
}

/// [`load_file`] over an in-memory buffer.
pub fn load_buffer(
    data: &[u8],
    opts: &LoadOptions<'_>,
    kernel: &dyn KernelBpf,
) -> Result<(Object, RawFd)> {
    let open_opts = OpenOptions {
        name: None,
        type_info: opts.type_info,
    };
    let mut obj = Object::open_buffer(data, &open_opts)?;
    load_object(&mut obj, opts, kernel)?;
    let fd = obj
        .programs
        .iter()
        .find_map(|p| p.fd())
        .ok_or(Error::Internal)?;
    Ok((obj, fd))
}

fn load_object(obj: &mut Object, opts: &LoadOptions<'_>, kernel: &dyn KernelBpf) -> Result<()> {
    let name = obj.name.clone();
    let text_shndx = obj.text_shndx;
    if obj.programs.is_empty() {
        log::warn!("object '{}' contains no programs", name);
        return Err(Error::NotFound);
    }
    for prog in &mut obj.programs {
        prog.ifindex = opts.ifindex;
        if opts.prog_type == ProgType::Unspec {
            // The shared `.text` pool is inlined into its callers and
            // never typed on its own.
            if Some(prog.section_index) == text_shndx || prog.section_name() == SEC_TEXT {
                continue;
            }
            match types::infer_from_section(prog.section_name()) {
                Some((prog_type, attach_type)) => {
                    prog.prog_type = prog_type;
                    prog.expected_attach_type = attach_type;
                }
                None => {
                    log::warn!(
                        "object '{}': cannot infer program type from section '{}'",
                        name,
                        prog.section_name()
                    );
                    return Err(Error::InvalidInput);
                }
            }
        } else {
            prog.prog_type = opts.prog_type;
            prog.expected_attach_type = opts.expected_attach_type;
        }
    }
    for map in &mut obj.maps {
        map.set_ifindex(opts.ifindex);
    }
    obj.load(kernel)
}
