//! Loader error taxonomy.
//!
//! A closed set of error kinds, each with a stable numeric encoding at
//! the public boundary. Loader-specific kinds occupy a private code block
//! starting at 4000; argument and lookup failures reuse the standard
//! errno values, and kernel errnos pass through as [`Error::Sys`].

use axerrno::LinuxError;

/// First code of the loader-specific block.
const CUSTOM_BASE: i32 = 4000;

/// Error kinds surfaced by the loader.
#[derive(Debug)]
pub enum Error {
    /// The input could not be read as an ELF object at all.
    Libelf,
    /// Malformed object: wrong type or machine, bad section layout,
    /// oversize or misshapen special sections.
    Format,
    /// The object carries no kernel version but a program type that
    /// requires one.
    KVersion,
    /// Byte order mismatch between the object and the host.
    Endian,
    /// Internal precondition violation.
    Internal,
    /// A relocation references an unknown section, an unexpected opcode,
    /// an unknown map offset, or a call inside `.text`.
    Reloc,
    /// The kernel rejected a program and produced no verifier log.
    Load,
    /// The kernel rejected a program; the verifier log is attached.
    Verify(String),
    /// Instruction count at or beyond the kernel maximum.
    ProgTooBig,
    /// The program loads under a different type: wrong type chosen.
    ProgType,
    /// Likely kernel-version mismatch.
    Kver,
    /// Invalid argument or input (EINVAL at the boundary).
    InvalidInput,
    /// Requested entity not found (ENOENT at the boundary).
    NotFound,
    /// Kernel errno passthrough.
    Sys(LinuxError),
}

impl Error {
    /// Numeric encoding of this error at the public boundary.
    pub fn code(&self) -> i32 {
        match self {
            Self::Libelf => CUSTOM_BASE,
            Self::Format => CUSTOM_BASE + 1,
            Self::KVersion => CUSTOM_BASE + 2,
            Self::Endian => CUSTOM_BASE + 3,
            Self::Internal => CUSTOM_BASE + 4,
            Self::Reloc => CUSTOM_BASE + 5,
            Self::Load => CUSTOM_BASE + 6,
            Self::Verify(_) => CUSTOM_BASE + 7,
            Self::ProgTooBig => CUSTOM_BASE + 8,
            Self::ProgType => CUSTOM_BASE + 9,
            Self::Kver => CUSTOM_BASE + 10,
            Self::InvalidInput => LinuxError::EINVAL as i32,
            Self::NotFound => LinuxError::ENOENT as i32,
            Self::Sys(e) => *e as i32,
        }
    }

    /// Verifier log attached to a [`Error::Verify`] rejection, if any.
    pub fn verifier_log(&self) -> Option<&str> {
        match self {
            Self::Verify(log) => Some(log),
            _ => None,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Libelf => write!(f, "failed to read ELF object"),
            Self::Format => write!(f, "malformed ELF object"),
            Self::KVersion => write!(f, "kernel version is required but missing"),
            Self::Endian => write!(f, "object byte order does not match host"),
            Self::Internal => write!(f, "internal error"),
            Self::Reloc => write!(f, "relocation failed"),
            Self::Load => write!(f, "kernel rejected the program"),
            Self::Verify(_) => write!(f, "kernel verifier rejected the program"),
            Self::ProgTooBig => write!(f, "program too big"),
            Self::ProgType => write!(f, "wrong program type chosen"),
            Self::Kver => write!(f, "incorrect kernel version"),
            Self::InvalidInput => write!(f, "invalid input"),
            Self::NotFound => write!(f, "not found"),
            Self::Sys(e) => write!(f, "kernel error: {:?}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<LinuxError> for Error {
    fn from(e: LinuxError) -> Self {
        Self::Sys(e)
    }
}

/// Loader result type.
pub type Result<T> = core::result::Result<T, Error>;
