//! Type-metadata capability boundary.
//!
//! Parsing the `.BTF` section is delegated to an external parser; the
//! loader only consumes the handle through [`TypeInfo`] to annotate map
//! creation requests with key/value type ids.

use std::os::fd::RawFd;

use axerrno::LinuxError;

/// Kind of a decoded type record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Struct,
    Union,
    Other,
}

/// One member of a struct or union type.
#[derive(Debug, Clone, Copy)]
pub struct TypeMember {
    pub type_id: u32,
}

/// A decoded type record.
#[derive(Debug, Clone)]
pub struct TypeRecord {
    pub kind: TypeKind,
    pub members: Vec<TypeMember>,
}

/// Capability offered by a parsed type-metadata blob.
pub trait TypeInfo {
    /// Look up a type id by name.
    fn find_by_name(&self, name: &str) -> Option<u32>;

    /// Fetch a type record by id.
    fn type_by_id(&self, id: u32) -> Option<TypeRecord>;

    /// Resolve the byte size of a type, following typedefs and
    /// qualifiers.
    fn resolve_size(&self, id: u32) -> Result<u32, LinuxError>;

    /// Kernel descriptor of the loaded metadata blob.
    fn fd(&self) -> RawFd;
}

/// Hook turning a raw `.BTF` section into a [`TypeInfo`] handle.
///
/// A parse failure is not fatal to the loader: the object is processed
/// without type metadata.
pub trait TypeInfoParser {
    fn parse(&self, bytes: &[u8]) -> Result<Box<dyn TypeInfo>, LinuxError>;
}
