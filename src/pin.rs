//! Pinning descriptors onto the bpf filesystem.
//!
//! Every pin target's parent directory must live on a bpf filesystem;
//! a failing `statfs` is a hard error, never a silent pass.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::maps::Map;
use crate::object::Object;
use crate::programs::{Instances, Program};
use crate::sys::{self, KernelBpf};

/// Filesystem magic of the dedicated bpf filesystem.
const BPF_FS_MAGIC: u64 = 0xcafe4a11;

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::InvalidInput)
}

/// Verify that the parent directory of a pin target is on bpffs.
fn check_bpffs_parent(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let c_dir = path_cstring(dir)?;
    let mut st: libc::statfs = unsafe { core::mem::zeroed() };
    if unsafe { libc::statfs(c_dir.as_ptr(), &mut st) } < 0 {
        let err = sys::last_errno();
        log::warn!("failed to statfs '{}': {:?}", dir.display(), err);
        return Err(Error::Sys(err));
    }
    if st.f_type as u64 != BPF_FS_MAGIC {
        log::warn!("specified path '{}' is not on a bpf filesystem", path.display());
        return Err(Error::InvalidInput);
    }
    Ok(())
}

fn make_dir(path: &Path) -> Result<()> {
    let c_path = path_cstring(path)?;
    if unsafe { libc::mkdir(c_path.as_ptr(), 0o700) } < 0 {
        let err = sys::last_errno();
        log::warn!("failed to mkdir '{}': {:?}", path.display(), err);
        return Err(Error::Sys(err));
    }
    Ok(())
}

impl Map {
    /// Pin this map's descriptor at `path`.
    pub fn pin(&self, path: &Path, kernel: &dyn KernelBpf) -> Result<()> {
        check_bpffs_parent(path)?;
        if self.fd() < 0 {
            log::warn!("map '{}' has no descriptor to pin", self.name());
            return Err(Error::InvalidInput);
        }
        kernel.pin(self.fd(), path).map_err(|e| {
            log::warn!("failed to pin map '{}' at '{}': {:?}", self.name(), path.display(), e);
            Error::Sys(e)
        })?;
        log::debug!("pinned map '{}' at '{}'", self.name(), path.display());
        Ok(())
    }
}

impl Program {
    /// Pin one loaded instance at `path`.
    pub fn pin_instance(&self, path: &Path, instance: usize, kernel: &dyn KernelBpf) -> Result<()> {
        check_bpffs_parent(path)?;
        let Some(fd) = self.instance_fd(instance) else {
            log::warn!(
                "program '{}' instance {} has no descriptor to pin",
                self.section_name(),
                instance
            );
            return Err(Error::InvalidInput);
        };
        kernel.pin(fd, path).map_err(|e| {
            log::warn!(
                "failed to pin program '{}' instance {} at '{}': {:?}",
                self.section_name(),
                instance,
                path.display(),
                e
            );
            Error::Sys(e)
        })?;
        log::debug!(
            "pinned program '{}' instance {} at '{}'",
            self.section_name(),
            instance,
            path.display()
        );
        Ok(())
    }

    /// Pin every loaded instance under `dir`, one entry per instance
    /// index. Skipped instances have no descriptor and are passed over.
    pub fn pin(&self, dir: &Path, kernel: &dyn KernelBpf) -> Result<()> {
        let Instances::Loaded(fds) = self.instances() else {
            log::warn!("program '{}' is not loaded, nothing to pin", self.section_name());
            return Err(Error::InvalidInput);
        };
        check_bpffs_parent(dir)?;
        make_dir(dir)?;
        for (i, fd) in fds.iter().enumerate() {
            if fd.is_none() {
                log::debug!(
                    "program '{}': instance {} was skipped, not pinning",
                    self.section_name(),
                    i
                );
                continue;
            }
            self.pin_instance(&dir.join(i.to_string()), i, kernel)?;
        }
        Ok(())
    }
}

impl Object {
    /// Pin the whole object under `path`: the directory itself (0700),
    /// one entry per map, and one directory per program holding its
    /// instances.
    pub fn pin(&self, path: &Path, kernel: &dyn KernelBpf) -> Result<()> {
        if !self.loaded() {
            log::warn!("object '{}' must be loaded before pinning", self.name());
            return Err(Error::NotFound);
        }
        check_bpffs_parent(path)?;
        make_dir(path)?;
        for map in self.maps() {
            map.pin(&path.join(map.name()), kernel)?;
        }
        for prog in self.programs() {
            if matches!(prog.instances(), Instances::Uninit) {
                // An inlined `.text` owns no descriptors.
                continue;
            }
            prog.pin(&path.join(prog.section_name()), kernel)?;
        }
        Ok(())
    }
}
