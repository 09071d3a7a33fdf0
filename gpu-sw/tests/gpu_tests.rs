//! Device bring-up and format coverage.

use tachyon_gpu::{format_info, Format, Manager, SetupParams};

fn manager() -> Manager {
    let _ = pretty_env_logger::try_init();
    Manager::new(tachyon_gpu_sw::plugin(), SetupParams::default())
}

#[test]
fn formats() {
    for format in Format::all() {
        let info = format_info(format);
        assert!(info.block_w > 0);
        assert!(info.block_h > 0);
        assert!(info.block_bits > 0);
        if info.compressed {
            assert!(info.block_w > 1 && info.block_h > 1);
        }
    }
}

#[test]
fn enumerate() {
    let manager = manager();
    let adapters = manager.enumerate_adapters().unwrap();
    assert!(!adapters.is_empty());
    assert!(!adapters[0].description.is_empty());
    // Enumeration is cached and stable.
    assert_eq!(manager.enumerate_adapters().unwrap().len(), adapters.len());
}

#[test]
fn initialize() {
    let manager = manager();
    assert!(!manager.is_initialized());
    let adapters = manager.enumerate_adapters().unwrap();
    assert!(!adapters.is_empty());
    manager.initialize(0).unwrap();
    assert!(manager.is_initialized());
}

#[test]
fn initialize_bad_adapter() {
    let manager = manager();
    assert!(manager.initialize(7).is_err());
    assert!(!manager.is_initialized());
}
