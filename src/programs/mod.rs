//! Program records and kernel submission.
//!
//! One [`Program`] exists per executable section of the object. Loading
//! may fan a program out into several kernel instances when a
//! preprocessor hook derives variant instruction streams from the shared
//! buffer.

pub mod types;

use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::insn::{self, Insn, MAX_INSNS};
use crate::reloc::RelocDesc;
use crate::sys::{self, KernelBpf, ProgLoadRequest};
use types::{AttachType, ProgType};

/// Result of one preprocessor invocation.
pub enum PreprocResult {
    /// Skip this instance; no descriptor is produced for it.
    Skip,
    /// Submit this instruction stream in place of the shared buffer.
    Submit(Vec<Insn>),
}

/// Per-instance hook invoked with the instance index and the shared
/// instruction buffer.
pub type Preprocessor = Box<dyn FnMut(usize, &[Insn]) -> PreprocResult>;

struct Prep {
    count: usize,
    func: Preprocessor,
}

/// Instance-descriptor state of a program.
#[derive(Debug, Default)]
pub enum Instances {
    /// Not yet initialized by a load.
    #[default]
    Uninit,
    /// One slot per instance; `None` marks an instance the preprocessor
    /// skipped.
    Loaded(Vec<Option<RawFd>>),
}

/// One verifier-bound bytecode unit.
pub struct Program {
    pub(crate) section_index: usize,
    pub(crate) name: String,
    pub(crate) section_name: String,
    pub(crate) insns: Vec<Insn>,
    /// Zero until `.text` has been spliced in; afterwards the
    /// pre-splice instruction count.
    pub(crate) main_insn_cnt: usize,
    pub(crate) relocs: Vec<RelocDesc>,
    pub(crate) prog_type: ProgType,
    pub(crate) expected_attach_type: AttachType,
    pub(crate) ifindex: u32,
    prep: Option<Prep>,
    pub(crate) instances: Instances,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("section_index", &self.section_index)
            .field("name", &self.name)
            .field("section_name", &self.section_name)
            .field("insns", &self.insns)
            .field("main_insn_cnt", &self.main_insn_cnt)
            .field("relocs", &self.relocs)
            .field("prog_type", &self.prog_type)
            .field("expected_attach_type", &self.expected_attach_type)
            .field("ifindex", &self.ifindex)
            .field("prep", &self.prep.is_some())
            .field("instances", &self.instances)
            .finish()
    }
}

impl Program {
    /// Build a program from an executable section's raw bytes.
    pub(crate) fn new(section_index: usize, section_name: &str, bytes: &[u8]) -> Result<Self> {
        let insns = insn::decode(bytes).map_err(|e| {
            log::warn!("program section '{}' is corrupted", section_name);
            e
        })?;
        Ok(Self {
            section_index,
            name: String::new(),
            section_name: section_name.to_string(),
            insns,
            main_insn_cnt: 0,
            relocs: Vec::new(),
            prog_type: ProgType::Kprobe,
            expected_attach_type: AttachType::default(),
            ifindex: 0,
            prep: None,
            instances: Instances::Uninit,
        })
    }

    /// Canonical name: the first global symbol on the program's section,
    /// or `".text"` for the shared pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn section_name(&self) -> &str {
        &self.section_name
    }

    pub fn section_index(&self) -> usize {
        self.section_index
    }

    pub fn prog_type(&self) -> ProgType {
        self.prog_type
    }

    pub fn set_type(&mut self, prog_type: ProgType) {
        self.prog_type = prog_type;
    }

    pub fn expected_attach_type(&self) -> AttachType {
        self.expected_attach_type
    }

    pub fn set_expected_attach_type(&mut self, attach_type: AttachType) {
        self.expected_attach_type = attach_type;
    }

    /// Target a network device for program offload.
    pub fn set_ifindex(&mut self, ifindex: u32) {
        self.ifindex = ifindex;
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn insn_cnt(&self) -> usize {
        self.insns.len()
    }

    /// Pre-splice instruction count, zero while `.text` has not been
    /// appended.
    pub fn main_insn_cnt(&self) -> usize {
        self.main_insn_cnt
    }

    pub fn instances(&self) -> &Instances {
        &self.instances
    }

    /// Descriptor of instance `n`, if that instance was loaded.
    pub fn instance_fd(&self, n: usize) -> Option<RawFd> {
        match &self.instances {
            Instances::Uninit => None,
            Instances::Loaded(fds) => fds.get(n).copied().flatten(),
        }
    }

    /// Descriptor of the first instance.
    pub fn fd(&self) -> Option<RawFd> {
        self.instance_fd(0)
    }

    /// Configure a preprocessor producing `count` instances per load.
    ///
    /// Must be called before the object is loaded.
    pub fn set_prep<F>(&mut self, count: usize, func: F) -> Result<()>
    where
        F: FnMut(usize, &[Insn]) -> PreprocResult + 'static,
    {
        if count == 0 {
            log::warn!("program '{}': instance count must be at least 1", self.section_name);
            return Err(Error::InvalidInput);
        }
        if matches!(self.instances, Instances::Loaded(_)) {
            log::warn!("program '{}': cannot set a preprocessor after load", self.section_name);
            return Err(Error::InvalidInput);
        }
        self.prep = Some(Prep {
            count,
            func: Box::new(func),
        });
        Ok(())
    }

    pub(crate) fn insn_mut(&mut self, idx: usize) -> &mut Insn {
        &mut self.insns[idx]
    }

    pub(crate) fn set_relocs(&mut self, relocs: Vec<RelocDesc>) {
        self.relocs = relocs;
    }

    pub(crate) fn take_relocs(&mut self) -> Vec<RelocDesc> {
        std::mem::take(&mut self.relocs)
    }

    /// Append the shared `.text` pool and record the splice point.
    pub(crate) fn splice_text(&mut self, text: &[Insn]) {
        self.main_insn_cnt = self.insns.len();
        self.insns.extend_from_slice(text);
    }

    /// Submit this program's instances to the kernel.
    ///
    /// Instances created before a mid-flight failure stay with the
    /// program and are released by unload.
    pub(crate) fn load(
        &mut self,
        license: &str,
        kern_version: u32,
        kernel: &dyn KernelBpf,
    ) -> Result<()> {
        let mut prep = self.prep.take();
        let mut fds: Vec<Option<RawFd>> = Vec::new();
        let mut failure = None;

        match &mut prep {
            None => match self.load_once(&self.insns, license, kern_version, kernel) {
                Ok(fd) => fds.push(Some(fd)),
                Err(err) => failure = Some(err),
            },
            Some(prep) => {
                for i in 0..prep.count {
                    match (prep.func)(i, &self.insns) {
                        PreprocResult::Skip => {
                            log::debug!(
                                "skipped loading instance {} of program '{}'",
                                i,
                                self.section_name
                            );
                            fds.push(None);
                        }
                        PreprocResult::Submit(insns) => {
                            match self.load_once(&insns, license, kern_version, kernel) {
                                Ok(fd) => fds.push(Some(fd)),
                                Err(err) => {
                                    failure = Some(err);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
        self.prep = prep;

        if !fds.is_empty() || failure.is_none() {
            self.instances = Instances::Loaded(fds);
        }
        match failure {
            Some(err) => Err(err),
            None => {
                // The kernel holds the authoritative copy now.
                self.insns = Vec::new();
                Ok(())
            }
        }
    }

    fn load_once(
        &self,
        insns: &[Insn],
        license: &str,
        kern_version: u32,
        kernel: &dyn KernelBpf,
    ) -> Result<RawFd> {
        let req = ProgLoadRequest {
            prog_type: self.prog_type,
            expected_attach_type: self.expected_attach_type,
            name: &self.name,
            insns,
            license,
            kern_version,
            ifindex: self.ifindex,
        };
        let mut log_buf = String::new();
        let err = match kernel.load_program(&req, &mut log_buf) {
            Ok(fd) => {
                log::debug!("loaded program '{}': fd {}", self.section_name, fd);
                return Ok(fd);
            }
            Err(err) => err,
        };

        if !log_buf.is_empty() {
            log::warn!(
                "program '{}' rejected by the verifier:\n{}",
                self.section_name,
                log_buf
            );
            return Err(Error::Verify(log_buf));
        }
        if insns.len() >= MAX_INSNS {
            log::warn!(
                "program '{}' has {} instructions, at or beyond the kernel maximum",
                self.section_name,
                insns.len()
            );
            return Err(Error::ProgTooBig);
        }
        // Distinguish a wrong type choice from a kernel mismatch by
        // probing under the kprobe type.
        if self.prog_type != ProgType::Kprobe {
            let probe = ProgLoadRequest {
                prog_type: ProgType::Kprobe,
                expected_attach_type: AttachType::default(),
                name: &self.name,
                insns,
                license,
                kern_version,
                ifindex: self.ifindex,
            };
            let mut probe_log = String::new();
            if let Ok(fd) = kernel.load_program(&probe, &mut probe_log) {
                sys::close_fd(fd);
                log::warn!(
                    "program '{}' loads as a kprobe: wrong type {:?} chosen",
                    self.section_name,
                    self.prog_type
                );
                return Err(Error::ProgType);
            }
        }
        log::warn!(
            "failed to load program '{}': {:?}, likely a kernel-version mismatch",
            self.section_name,
            err
        );
        Err(Error::Kver)
    }

    /// Close every instance descriptor and return to the uninitialized
    /// state. Safe to call repeatedly.
    pub(crate) fn unload(&mut self) {
        if let Instances::Loaded(fds) = std::mem::take(&mut self.instances) {
            for fd in fds.into_iter().flatten() {
                sys::close_fd(fd);
            }
        }
    }
}
