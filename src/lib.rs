//! User-space loader for eBPF ELF object files.
//!
//! The loader ingests a relocatable object holding bytecode programs and
//! map definitions, creates the kernel maps, patches instruction streams
//! with map descriptors and intra-object call targets, and submits each
//! program to the kernel for verification.
//!
//! # Quick Start
//!
//! ```ignore
//! use bpfobj::{LoadOptions, LinuxKernel, load_file};
//!
//! let kernel = LinuxKernel;
//! let (object, prog_fd) = load_file("probe.o", &LoadOptions::default(), &kernel)?;
//! for map in object.maps() {
//!     println!("{}: fd {}", map.name(), map.fd());
//! }
//! ```
//!
//! The kernel syscall surface and the type-metadata parser are consumed
//! through the [`sys::KernelBpf`] and [`btf::TypeInfo`] capability
//! traits, so the whole pipeline runs against mocks in tests.

pub mod btf;
pub mod elf;
pub mod error;
pub mod insn;
pub mod maps;
pub mod object;
mod pin;
pub mod programs;
pub mod reloc;
pub mod sys;

// Re-export key types for convenience
pub use btf::{TypeInfo, TypeInfoParser, TypeKind, TypeMember, TypeRecord};
pub use error::{Error, Result};
pub use insn::Insn;
pub use maps::{Map, MapDef};
pub use object::{LoadOptions, Object, OpenOptions, load_buffer, load_file};
pub use programs::types::{AttachType, ProgType};
pub use programs::{Instances, PreprocResult, Program};
pub use sys::{KernelBpf, MapCreateRequest, MapInfo, ProgLoadRequest};

#[cfg(target_os = "linux")]
pub use sys::LinuxKernel;
