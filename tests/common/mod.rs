//! Shared test fixtures: an in-memory ELF object builder and mock
//! kernel/type-metadata collaborators.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use axerrno::LinuxError;
use bpfobj::insn::{self, Insn};
use bpfobj::{
    KernelBpf, MapCreateRequest, MapDef, MapInfo, ProgLoadRequest, ProgType, TypeInfo,
    TypeInfoParser, TypeKind, TypeMember, TypeRecord,
};

// =============================================================================
// ELF object builder
// =============================================================================

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_REL: u32 = 9;
pub const SHF_EXECINSTR: u64 = 0x4;
pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const EM_BPF: u16 = 247;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;

struct SectionSpec {
    name: String,
    sh_type: u32,
    flags: u64,
    data: Vec<u8>,
    link: u32,
    info: u32,
    entsize: u64,
}

struct SymSpec {
    name: String,
    shndx: u16,
    value: u64,
    binding: u8,
}

/// Builds little-endian relocatable objects in memory.
///
/// User sections keep their insertion order starting at index 1 (index 0
/// is the NULL section); `.symtab`, `.strtab`, and `.shstrtab` are
/// appended automatically at build time.
pub struct ElfBuilder {
    machine: u16,
    e_type: u16,
    endian: u8,
    sections: Vec<SectionSpec>,
    symbols: Vec<SymSpec>,
    rel_links_to_fix: Vec<usize>,
    with_symtab: bool,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self {
            machine: EM_BPF,
            e_type: 1,
            endian: 1,
            sections: Vec::new(),
            symbols: Vec::new(),
            rel_links_to_fix: Vec::new(),
            with_symtab: true,
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn e_type(mut self, e_type: u16) -> Self {
        self.e_type = e_type;
        self
    }

    pub fn big_endian(mut self) -> Self {
        self.endian = 2;
        self
    }

    pub fn without_symtab(mut self) -> Self {
        self.with_symtab = false;
        self
    }

    /// Add a section; returns its section index.
    pub fn section(&mut self, name: &str, sh_type: u32, flags: u64, data: Vec<u8>) -> usize {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            sh_type,
            flags,
            data,
            link: 0,
            info: 0,
            entsize: 0,
        });
        self.sections.len()
    }

    /// Add an executable PROGBITS section holding `insns`.
    pub fn prog_section(&mut self, name: &str, insns: &[Insn]) -> usize {
        self.section(name, SHT_PROGBITS, SHF_EXECINSTR, insn::encode(insns))
    }

    /// Add a REL section targeting section `target`; entries are
    /// `(r_offset, symbol_index)` pairs.
    pub fn rel_section(&mut self, name: &str, target: usize, entries: &[(u64, usize)]) -> usize {
        let mut data = Vec::with_capacity(entries.len() * 16);
        for &(r_offset, sym_idx) in entries {
            data.extend_from_slice(&r_offset.to_le_bytes());
            let r_info = ((sym_idx as u64) << 32) | 1;
            data.extend_from_slice(&r_info.to_le_bytes());
        }
        self.sections.push(SectionSpec {
            name: name.to_string(),
            sh_type: SHT_REL,
            flags: 0,
            data,
            link: 0,
            info: target as u32,
            entsize: 16,
        });
        let idx = self.sections.len();
        self.rel_links_to_fix.push(idx - 1);
        idx
    }

    /// Add a symbol; returns its symbol-table index.
    pub fn symbol(&mut self, name: &str, shndx: usize, value: u64, binding: u8) -> usize {
        self.symbols.push(SymSpec {
            name: name.to_string(),
            shndx: shndx as u16,
            value,
            binding,
        });
        self.symbols.len()
    }

    pub fn build(mut self) -> Vec<u8> {
        let symtab_idx = self.sections.len() + 1;
        let strtab_idx = symtab_idx + 1;
        let shstrtab_idx = strtab_idx + 1;

        // Symbol-name string table.
        let mut strtab = vec![0u8];
        let mut sym_name_offs = Vec::new();
        for sym in &self.symbols {
            sym_name_offs.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }

        // Symbol table: NULL entry plus declared symbols.
        let mut symtab = vec![0u8; 24];
        for (sym, name_off) in self.symbols.iter().zip(&sym_name_offs) {
            let mut ent = [0u8; 24];
            ent[0..4].copy_from_slice(&name_off.to_le_bytes());
            ent[4] = sym.binding << 4;
            ent[6..8].copy_from_slice(&sym.shndx.to_le_bytes());
            ent[8..16].copy_from_slice(&sym.value.to_le_bytes());
            symtab.extend_from_slice(&ent);
        }

        if self.with_symtab {
            self.sections.push(SectionSpec {
                name: ".symtab".to_string(),
                sh_type: 2,
                flags: 0,
                data: symtab,
                link: strtab_idx as u32,
                info: 0,
                entsize: 24,
            });
            self.sections.push(SectionSpec {
                name: ".strtab".to_string(),
                sh_type: 3,
                flags: 0,
                data: strtab,
                link: 0,
                info: 0,
                entsize: 0,
            });
        }
        for &rel in &self.rel_links_to_fix {
            self.sections[rel].link = symtab_idx as u32;
        }

        // Section-name string table.
        let mut shstrtab = vec![0u8];
        let mut sec_name_offs = vec![0u32];
        for sec in &self.sections {
            sec_name_offs.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(sec.name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name_off = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");
        self.sections.push(SectionSpec {
            name: ".shstrtab".to_string(),
            sh_type: 3,
            flags: 0,
            data: shstrtab,
            link: 0,
            info: 0,
            entsize: 0,
        });
        sec_name_offs.push(shstrtab_name_off);

        let shnum = self.sections.len() + 1;
        let shstrndx = if self.with_symtab {
            shstrtab_idx
        } else {
            self.sections.len()
        };

        // Lay out section data after the header, then the header table.
        let mut out = vec![0u8; EHDR_SIZE];
        let mut placements = Vec::with_capacity(self.sections.len());
        for sec in &self.sections {
            while out.len() % 8 != 0 {
                out.push(0);
            }
            placements.push((out.len() as u64, sec.data.len() as u64));
            out.extend_from_slice(&sec.data);
        }
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let shoff = out.len() as u64;

        // NULL section header.
        out.extend_from_slice(&[0u8; SHDR_SIZE]);
        for (i, sec) in self.sections.iter().enumerate() {
            let mut sh = [0u8; SHDR_SIZE];
            sh[0..4].copy_from_slice(&sec_name_offs[i + 1].to_le_bytes());
            sh[4..8].copy_from_slice(&sec.sh_type.to_le_bytes());
            sh[8..16].copy_from_slice(&sec.flags.to_le_bytes());
            sh[24..32].copy_from_slice(&placements[i].0.to_le_bytes());
            sh[32..40].copy_from_slice(&placements[i].1.to_le_bytes());
            sh[40..44].copy_from_slice(&sec.link.to_le_bytes());
            sh[44..48].copy_from_slice(&sec.info.to_le_bytes());
            sh[56..64].copy_from_slice(&sec.entsize.to_le_bytes());
            out.extend_from_slice(&sh);
        }

        // Object header.
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2;
        out[5] = self.endian;
        out[6] = 1;
        out[16..18].copy_from_slice(&self.e_type.to_le_bytes());
        out[18..20].copy_from_slice(&self.machine.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[40..48].copy_from_slice(&shoff.to_le_bytes());
        out[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out[58..60].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        out[60..62].copy_from_slice(&(shnum as u16).to_le_bytes());
        out[62..64].copy_from_slice(&(shstrndx as u16).to_le_bytes());
        out
    }
}

// =============================================================================
// Instruction helpers
// =============================================================================

/// `mov r0, imm`.
pub fn mov_r0(imm: i32) -> Insn {
    Insn {
        code: 0xb7,
        regs: 0,
        off: 0,
        imm,
    }
}

/// `exit`.
pub fn exit_insn() -> Insn {
    Insn {
        code: 0x95,
        regs: 0,
        off: 0,
        imm: 0,
    }
}

/// Two-word wide-immediate load into `dst`.
pub fn ld_imm_dw(dst: u8, imm: i32) -> [Insn; 2] {
    [
        Insn {
            code: insn::OP_LD_IMM_DW,
            regs: dst,
            off: 0,
            imm,
        },
        Insn::default(),
    ]
}

/// Pseudo-call with relative immediate `imm`.
pub fn pseudo_call(imm: i32) -> Insn {
    Insn {
        code: insn::OP_JMP_CALL,
        regs: insn::PSEUDO_CALL << 4,
        off: 0,
        imm,
    }
}

/// `mov r0, 0; exit`, the smallest loadable program.
pub fn ret0() -> Vec<Insn> {
    vec![mov_r0(0), exit_insn()]
}

/// Encode a map definition the way compilers lay it out in the `maps`
/// section.
pub fn map_def_bytes(def: &MapDef) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    for field in [
        def.map_type,
        def.key_size,
        def.value_size,
        def.max_entries,
        def.map_flags,
    ] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    out
}

pub fn hash_map_def() -> MapDef {
    MapDef {
        map_type: 1,
        key_size: 4,
        value_size: 4,
        max_entries: 1024,
        map_flags: 0,
    }
}

// =============================================================================
// Mock kernel
// =============================================================================

#[derive(Debug, Clone)]
pub struct CreatedMap {
    pub fd: RawFd,
    pub name: String,
    pub def: MapDef,
    pub btf_fd: RawFd,
    pub btf_key_type_id: u32,
    pub btf_value_type_id: u32,
}

#[derive(Debug, Clone)]
pub struct LoadedProg {
    pub fd: RawFd,
    pub name: String,
    pub prog_type: ProgType,
    pub insns: Vec<Insn>,
    pub license: String,
    pub kern_version: u32,
}

/// Scripted program-load behavior.
#[derive(Debug, Clone, Default)]
pub enum LoadBehavior {
    #[default]
    Succeed,
    /// Rejection with no verifier log.
    FailSilent,
    /// Rejection carrying a verifier log.
    FailWithLog(String),
    /// Rejection for the requested type while a kprobe probe succeeds.
    FailUnlessKprobe,
}

/// In-memory stand-in for the kernel syscall surface.
///
/// Descriptors are plain counters starting far above any fd the test
/// process could own, so stray closes are harmless.
#[derive(Default)]
pub struct MockKernel {
    next_fd: Cell<RawFd>,
    pub created: RefCell<Vec<CreatedMap>>,
    pub loaded: RefCell<Vec<LoadedProg>>,
    pub pinned: RefCell<Vec<(RawFd, PathBuf)>>,
    pub infos: RefCell<HashMap<RawFd, MapInfo>>,
    /// Map names whose creation fails with EPERM.
    pub fail_map_named: RefCell<Vec<String>>,
    /// Reject any creation request carrying type metadata.
    pub reject_btf_maps: Cell<bool>,
    pub load_behavior: RefCell<LoadBehavior>,
}

impl MockKernel {
    pub fn new() -> Self {
        let kernel = Self::default();
        kernel.next_fd.set(5000);
        kernel
    }

    fn alloc_fd(&self) -> RawFd {
        let fd = self.next_fd.get();
        self.next_fd.set(fd + 1);
        fd
    }

    pub fn map_create_calls(&self) -> usize {
        self.created.borrow().len()
    }
}

impl KernelBpf for MockKernel {
    fn create_map(&self, req: &MapCreateRequest<'_>) -> Result<RawFd, LinuxError> {
        if self.reject_btf_maps.get() && req.btf_fd != 0 {
            // Recorded so tests can count the annotated attempt.
            self.created.borrow_mut().push(CreatedMap {
                fd: -1,
                name: req.name.to_string(),
                def: req.def,
                btf_fd: req.btf_fd,
                btf_key_type_id: req.btf_key_type_id,
                btf_value_type_id: req.btf_value_type_id,
            });
            return Err(LinuxError::EINVAL);
        }
        if self.fail_map_named.borrow().iter().any(|n| n == req.name) {
            return Err(LinuxError::EPERM);
        }
        let fd = self.alloc_fd();
        self.created.borrow_mut().push(CreatedMap {
            fd,
            name: req.name.to_string(),
            def: req.def,
            btf_fd: req.btf_fd,
            btf_key_type_id: req.btf_key_type_id,
            btf_value_type_id: req.btf_value_type_id,
        });
        Ok(fd)
    }

    fn load_program(
        &self,
        req: &ProgLoadRequest<'_>,
        log: &mut String,
    ) -> Result<RawFd, LinuxError> {
        let behavior = self.load_behavior.borrow().clone();
        let accept = match behavior {
            LoadBehavior::Succeed => true,
            LoadBehavior::FailSilent => false,
            LoadBehavior::FailWithLog(text) => {
                log.push_str(&text);
                false
            }
            LoadBehavior::FailUnlessKprobe => req.prog_type == ProgType::Kprobe,
        };
        if !accept {
            return Err(LinuxError::EACCES);
        }
        let fd = self.alloc_fd();
        self.loaded.borrow_mut().push(LoadedProg {
            fd,
            name: req.name.to_string(),
            prog_type: req.prog_type,
            insns: req.insns.to_vec(),
            license: req.license.to_string(),
            kern_version: req.kern_version,
        });
        Ok(fd)
    }

    fn pin(&self, fd: RawFd, path: &Path) -> Result<(), LinuxError> {
        self.pinned.borrow_mut().push((fd, path.to_path_buf()));
        Ok(())
    }

    fn object_info(&self, fd: RawFd) -> Result<MapInfo, LinuxError> {
        self.infos
            .borrow()
            .get(&fd)
            .cloned()
            .ok_or(LinuxError::EBADF)
    }
}

// =============================================================================
// Mock type metadata
// =============================================================================

#[derive(Clone, Default)]
pub struct MockTypeInfo {
    pub names: HashMap<String, u32>,
    pub records: HashMap<u32, TypeRecord>,
    pub sizes: HashMap<u32, u32>,
    pub fd: RawFd,
}

impl TypeInfo for MockTypeInfo {
    fn find_by_name(&self, name: &str) -> Option<u32> {
        self.names.get(name).copied()
    }

    fn type_by_id(&self, id: u32) -> Option<TypeRecord> {
        self.records.get(&id).cloned()
    }

    fn resolve_size(&self, id: u32) -> Result<u32, LinuxError> {
        self.sizes.get(&id).copied().ok_or(LinuxError::EINVAL)
    }

    fn fd(&self) -> RawFd {
        self.fd
    }
}

pub struct MockTypeInfoParser(pub MockTypeInfo);

impl TypeInfoParser for MockTypeInfoParser {
    fn parse(&self, _bytes: &[u8]) -> Result<Box<dyn TypeInfo>, LinuxError> {
        Ok(Box::new(self.0.clone()))
    }
}

/// A parser that always fails, for the warn-and-continue path.
pub struct FailingTypeInfoParser;

impl TypeInfoParser for FailingTypeInfoParser {
    fn parse(&self, _bytes: &[u8]) -> Result<Box<dyn TypeInfo>, LinuxError> {
        Err(LinuxError::EINVAL)
    }
}

/// Metadata resolving `____btf_map_<map_name>` to a two-member struct
/// whose member sizes match the given definition.
pub fn btf_for_map(map_name: &str, key_size: u32, value_size: u32) -> MockTypeInfoParser {
    let mut info = MockTypeInfo {
        fd: 4999,
        ..Default::default()
    };
    info.names.insert(format!("____btf_map_{map_name}"), 7);
    info.records.insert(
        7,
        TypeRecord {
            kind: TypeKind::Struct,
            members: vec![TypeMember { type_id: 8 }, TypeMember { type_id: 9 }],
        },
    );
    info.sizes.insert(8, key_size);
    info.sizes.insert(9, value_size);
    MockTypeInfoParser(info)
}
