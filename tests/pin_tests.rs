//! Integration tests for pinning preconditions.
//!
//! Positive pinning needs a mounted bpf filesystem, so these cover the
//! ordering and rejection rules: loaded-state checks and the
//! bpffs-magic verification of the target's parent directory.

mod common;

use bpfobj::{Error, Object, OpenOptions};
use common::*;

/// Section name deliberately slash-free so pin paths stay flat.
fn kprobe_object() -> Vec<u8> {
    let mut b = ElfBuilder::new();
    b.section("license", SHT_PROGBITS, 0, b"GPL\0".to_vec());
    b.section("version", SHT_PROGBITS, 0, 0x00040f00u32.to_le_bytes().to_vec());
    let p = b.prog_section("kprobe_open", &ret0());
    b.symbol("trace_open", p, 0, STB_GLOBAL);
    b.build()
}

#[test]
fn test_pin_requires_a_loaded_object() {
    let obj = Object::open_buffer(&kprobe_object(), &OpenOptions::default()).unwrap();
    let kernel = MockKernel::new();
    let err = obj.pin(std::path::Path::new("/tmp/bpfobj-pin"), &kernel).unwrap_err();
    assert!(matches!(err, Error::NotFound));
    assert!(kernel.pinned.borrow().is_empty());
}

#[test]
fn test_pin_outside_bpffs_is_rejected() {
    let mut obj = Object::open_buffer(&kprobe_object(), &OpenOptions::default()).unwrap();
    let kernel = MockKernel::new();
    obj.load(&kernel).unwrap();

    let dir = std::env::temp_dir().join(format!("bpfobj-pin-{}", std::process::id()));
    let err = obj.pin(&dir, &kernel).unwrap_err();

    // The temp filesystem is not bpffs; the check fires before any
    // directory is created and nothing reaches the kernel.
    assert!(!dir.exists());
    assert!(matches!(err, Error::InvalidInput));
    assert!(kernel.pinned.borrow().is_empty());
}

#[test]
fn test_pin_into_missing_directory_is_a_hard_error() {
    let mut obj = Object::open_buffer(&kprobe_object(), &OpenOptions::default()).unwrap();
    let kernel = MockKernel::new();
    obj.load(&kernel).unwrap();

    let map_like = std::path::Path::new("/nonexistent-bpfobj/pin");
    let err = obj.programs()[0].pin_instance(map_like, 0, &kernel).unwrap_err();
    // statfs of the absent parent fails; the magic is never consulted.
    assert!(matches!(err, Error::Sys(_)));
}

#[test]
fn test_pin_instance_requires_a_descriptor() {
    let obj = Object::open_buffer(&kprobe_object(), &OpenOptions::default()).unwrap();
    let kernel = MockKernel::new();
    let err = obj.programs()[0]
        .pin(std::path::Path::new("/tmp/bpfobj-pin-prog"), &kernel)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput));
}
