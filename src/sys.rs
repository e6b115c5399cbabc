//! Kernel syscall capability boundary.
//!
//! [`KernelBpf`] abstracts the kernel surface the loader needs: map
//! creation, program submission, pinning, and descriptor introspection.
//! The real implementation drives the `bpf(2)` syscall directly; tests
//! substitute a mock, mirroring the real-versus-mock platform split.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::path::Path;

use axerrno::LinuxError;

use crate::insn::Insn;
use crate::maps::MapDef;
use crate::programs::types::{AttachType, ProgType};

/// Kernel cap on object names (terminator included).
pub const OBJ_NAME_LEN: usize = 16;

/// Verifier log capacity for program submission retries.
pub const LOG_BUF_SIZE: usize = 256 * 1024;

/// Map creation request.
#[derive(Debug, Clone)]
pub struct MapCreateRequest<'a> {
    pub name: &'a str,
    pub def: MapDef,
    /// Network device index for offloaded maps, 0 when none.
    pub ifindex: u32,
    /// Type-metadata descriptor, 0 when no metadata is attached.
    pub btf_fd: RawFd,
    pub btf_key_type_id: u32,
    pub btf_value_type_id: u32,
}

/// Program submission request.
#[derive(Debug, Clone)]
pub struct ProgLoadRequest<'a> {
    pub prog_type: ProgType,
    pub expected_attach_type: AttachType,
    pub name: &'a str,
    pub insns: &'a [Insn],
    pub license: &'a str,
    pub kern_version: u32,
    /// Network device index for offloaded programs, 0 when none.
    pub ifindex: u32,
}

/// Info queried for an existing map descriptor.
#[derive(Debug, Clone, Default)]
pub struct MapInfo {
    pub name: String,
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub btf_key_type_id: u32,
    pub btf_value_type_id: u32,
}

/// Kernel operations consumed by the loader.
pub trait KernelBpf {
    fn create_map(&self, req: &MapCreateRequest<'_>) -> Result<RawFd, LinuxError>;

    /// Submit a program for verification and loading. On rejection the
    /// verifier log, if the kernel produced one, is appended to `log`.
    fn load_program(&self, req: &ProgLoadRequest<'_>, log: &mut String)
    -> Result<RawFd, LinuxError>;

    /// Pin a descriptor at a path on the bpf filesystem.
    fn pin(&self, fd: RawFd, path: &Path) -> Result<(), LinuxError>;

    /// Query map info for an existing descriptor.
    fn object_info(&self, fd: RawFd) -> Result<MapInfo, LinuxError>;
}

/// Close a descriptor, ignoring errors.
pub(crate) fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Errno of the last failed libc call.
pub(crate) fn last_errno() -> LinuxError {
    errno_from_raw(
        std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO),
    )
}

fn errno_from_raw(raw: i32) -> LinuxError {
    match raw {
        libc::EPERM => LinuxError::EPERM,
        libc::ENOENT => LinuxError::ENOENT,
        libc::EINTR => LinuxError::EINTR,
        libc::EIO => LinuxError::EIO,
        libc::E2BIG => LinuxError::E2BIG,
        libc::EBADF => LinuxError::EBADF,
        libc::EAGAIN => LinuxError::EAGAIN,
        libc::ENOMEM => LinuxError::ENOMEM,
        libc::EACCES => LinuxError::EACCES,
        libc::EFAULT => LinuxError::EFAULT,
        libc::EBUSY => LinuxError::EBUSY,
        libc::EEXIST => LinuxError::EEXIST,
        libc::ENODEV => LinuxError::ENODEV,
        libc::ENOTDIR => LinuxError::ENOTDIR,
        libc::EINVAL => LinuxError::EINVAL,
        libc::ENFILE => LinuxError::ENFILE,
        libc::EMFILE => LinuxError::EMFILE,
        libc::EFBIG => LinuxError::EFBIG,
        libc::ENOSPC => LinuxError::ENOSPC,
        _ => LinuxError::EIO,
    }
}

/// Duplicate `fd` into a fresh close-on-exec slot.
///
/// A placeholder open of `/` reserves the slot, then the source
/// descriptor is duplicated over it with close-on-exec set.
pub(crate) fn dup_cloexec(fd: RawFd) -> Result<RawFd, LinuxError> {
    let root = CString::new("/").expect("no interior NUL");
    let placeholder = unsafe { libc::open(root.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if placeholder < 0 {
        return Err(last_errno());
    }
    let new_fd = unsafe { libc::dup3(fd, placeholder, libc::O_CLOEXEC) };
    if new_fd < 0 {
        let err = last_errno();
        close_fd(placeholder);
        return Err(err);
    }
    Ok(new_fd)
}

// =============================================================================
// Real Implementation (bpf(2) syscall)
// =============================================================================

#[cfg(target_os = "linux")]
pub use self::linux::LinuxKernel;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    const BPF_MAP_CREATE: libc::c_int = 0;
    const BPF_PROG_LOAD: libc::c_int = 5;
    const BPF_OBJ_PIN: libc::c_int = 6;
    const BPF_OBJ_GET_INFO_BY_FD: libc::c_int = 15;

    #[repr(C)]
    #[derive(Default)]
    struct MapCreateAttr {
        map_type: u32,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
        map_flags: u32,
        inner_map_fd: u32,
        numa_node: u32,
        map_name: [u8; OBJ_NAME_LEN],
        map_ifindex: u32,
        btf_fd: u32,
        btf_key_type_id: u32,
        btf_value_type_id: u32,
    }

    #[repr(C)]
    #[derive(Default)]
    struct ProgLoadAttr {
        prog_type: u32,
        insn_cnt: u32,
        insns: u64,
        license: u64,
        log_level: u32,
        log_size: u32,
        log_buf: u64,
        kern_version: u32,
        prog_flags: u32,
        prog_name: [u8; OBJ_NAME_LEN],
        prog_ifindex: u32,
        expected_attach_type: u32,
    }

    #[repr(C)]
    #[derive(Default)]
    struct ObjPinAttr {
        pathname: u64,
        bpf_fd: u32,
        file_flags: u32,
    }

    #[repr(C)]
    #[derive(Default)]
    struct InfoByFdAttr {
        bpf_fd: u32,
        info_len: u32,
        info: u64,
    }

    #[repr(C)]
    #[derive(Default)]
    struct RawMapInfo {
        map_type: u32,
        id: u32,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
        map_flags: u32,
        name: [u8; OBJ_NAME_LEN],
        ifindex: u32,
        netns_dev: u64,
        netns_ino: u64,
        btf_id: u32,
        btf_key_type_id: u32,
        btf_value_type_id: u32,
    }

    unsafe fn sys_bpf<T>(cmd: libc::c_int, attr: &mut T) -> Result<libc::c_long, LinuxError> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                cmd,
                attr as *mut T as *mut libc::c_void,
                core::mem::size_of::<T>(),
            )
        };
        if ret < 0 { Err(last_errno()) } else { Ok(ret) }
    }

    /// Truncating copy into a fixed kernel name field; the terminator is
    /// always preserved.
    fn copy_obj_name(dst: &mut [u8; OBJ_NAME_LEN], name: &str) {
        let n = name.len().min(OBJ_NAME_LEN - 1);
        dst[..n].copy_from_slice(&name.as_bytes()[..n]);
    }

    /// `bpf(2)`-backed kernel operations.
    pub struct LinuxKernel;

    impl KernelBpf for LinuxKernel {
        fn create_map(&self, req: &MapCreateRequest<'_>) -> Result<RawFd, LinuxError> {
            let mut attr = MapCreateAttr {
                map_type: req.def.map_type,
                key_size: req.def.key_size,
                value_size: req.def.value_size,
                max_entries: req.def.max_entries,
                map_flags: req.def.map_flags,
                map_ifindex: req.ifindex,
                btf_fd: req.btf_fd as u32,
                btf_key_type_id: req.btf_key_type_id,
                btf_value_type_id: req.btf_value_type_id,
                ..Default::default()
            };
            copy_obj_name(&mut attr.map_name, req.name);
            let fd = unsafe { sys_bpf(BPF_MAP_CREATE, &mut attr)? };
            Ok(fd as RawFd)
        }

        fn load_program(
            &self,
            req: &ProgLoadRequest<'_>,
            log: &mut String,
        ) -> Result<RawFd, LinuxError> {
            let license = CString::new(req.license).map_err(|_| LinuxError::EINVAL)?;
            let mut attr = ProgLoadAttr {
                prog_type: req.prog_type as u32,
                insn_cnt: req.insns.len() as u32,
                insns: req.insns.as_ptr() as u64,
                license: license.as_ptr() as u64,
                kern_version: req.kern_version,
                prog_ifindex: req.ifindex,
                expected_attach_type: req.expected_attach_type as u32,
                ..Default::default()
            };
            copy_obj_name(&mut attr.prog_name, req.name);

            // First attempt runs without a log buffer; the retry exists
            // only to capture the verifier's complaint.
            if let Ok(fd) = unsafe { sys_bpf(BPF_PROG_LOAD, &mut attr) } {
                return Ok(fd as RawFd);
            }

            let mut buf = vec![0u8; LOG_BUF_SIZE];
            attr.log_level = 1;
            attr.log_size = buf.len() as u32;
            attr.log_buf = buf.as_mut_ptr() as u64;
            match unsafe { sys_bpf(BPF_PROG_LOAD, &mut attr) } {
                Ok(fd) => Ok(fd as RawFd),
                Err(err) => {
                    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                    log.push_str(&String::from_utf8_lossy(&buf[..end]));
                    Err(err)
                }
            }
        }

        fn pin(&self, fd: RawFd, path: &Path) -> Result<(), LinuxError> {
            use std::os::unix::ffi::OsStrExt;
            let pathname =
                CString::new(path.as_os_str().as_bytes()).map_err(|_| LinuxError::EINVAL)?;
            let mut attr = ObjPinAttr {
                pathname: pathname.as_ptr() as u64,
                bpf_fd: fd as u32,
                ..Default::default()
            };
            unsafe { sys_bpf(BPF_OBJ_PIN, &mut attr)? };
            Ok(())
        }

        fn object_info(&self, fd: RawFd) -> Result<MapInfo, LinuxError> {
            let mut raw = RawMapInfo::default();
            let mut attr = InfoByFdAttr {
                bpf_fd: fd as u32,
                info_len: core::mem::size_of::<RawMapInfo>() as u32,
                info: &mut raw as *mut RawMapInfo as u64,
            };
            unsafe { sys_bpf(BPF_OBJ_GET_INFO_BY_FD, &mut attr)? };
            let name_end = raw.name.iter().position(|&b| b == 0).unwrap_or(raw.name.len());
            Ok(MapInfo {
                name: String::from_utf8_lossy(&raw.name[..name_end]).into_owned(),
                map_type: raw.map_type,
                key_size: raw.key_size,
                value_size: raw.value_size,
                max_entries: raw.max_entries,
                map_flags: raw.map_flags,
                btf_key_type_id: raw.btf_key_type_id,
                btf_value_type_id: raw.btf_value_type_id,
            })
        }
    }
}
