//! Frame lifecycle: bounded in-flight frames, deferred destruction, and
//! back-buffer cycling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tachyon_gpu::backend::{Backend, SetupParams};
use tachyon_gpu::*;
use tachyon_gpu_sw::SwBackend;

#[test]
fn next_frame_blocks_when_window_is_full() {
    let _ = pretty_env_logger::try_init();
    let backend = Arc::new(SwBackend::new(SetupParams::default()));
    backend.initialize(0).unwrap();

    // Hold the "GPU" still so no frame ever completes.
    backend.set_stalled(true).unwrap();

    let completed = Arc::new(AtomicU32::new(0));
    let worker = {
        let backend = Arc::clone(&backend);
        let completed = Arc::clone(&completed);
        std::thread::spawn(move || {
            for _ in 0..4 {
                backend.next_frame();
                completed.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    // Three frames fit in the window without ever blocking; the fourth call
    // must block until the oldest frame completes.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while completed.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(completed.load(Ordering::SeqCst), 3);

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(completed.load(Ordering::SeqCst), 3, "fourth call should block");

    backend.set_stalled(false).unwrap();
    worker.join().unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 4);
}

#[test]
fn destroyed_handles_retire_after_the_frame_window() {
    let _ = pretty_env_logger::try_init();
    let manager = Manager::new(tachyon_gpu_sw::plugin(), SetupParams::default());
    manager.initialize(0).unwrap();

    let buffer = manager
        .create_buffer(
            &BufferDesc {
                size: 256,
                bind_flags: BindFlags::SHADER_RESOURCE,
            },
            None,
            "deferred destroy",
        )
        .unwrap();

    manager.destroy_resource(buffer).unwrap();

    // The handle stays valid while the GPU may still be using the resource.
    for _ in 0..MAX_GPU_FRAMES - 1 {
        manager.next_frame();
        assert!(manager.handle_allocator().is_valid(buffer));
    }
    manager.next_frame();
    assert!(!manager.handle_allocator().is_valid(buffer));

    // The slot is reusable now, under a different generation.
    let reused = manager
        .create_buffer(
            &BufferDesc {
                size: 16,
                bind_flags: BindFlags::empty(),
            },
            None,
            "reused slot",
        )
        .unwrap();
    assert_eq!(reused.index(), buffer.index());
    assert_ne!(reused.generation(), buffer.generation());
}

#[test]
fn present_cycles_back_buffers() {
    let _ = pretty_env_logger::try_init();
    let backend = SwBackend::new(SetupParams::default());
    backend.initialize(0).unwrap();
    let handles = Arc::new(HandleAllocator::new());

    let swap_chain = handles.alloc(ResourceKind::SwapChain).unwrap();
    backend
        .create_swap_chain(
            swap_chain,
            &SwapChainDesc {
                width: 1024,
                height: 768,
                format: Format::R8G8B8A8_UNORM,
                buffer_count: 2,
                window: WindowHandle::default(),
            },
            "present test",
        )
        .unwrap();

    let fbs = handles.alloc(ResourceKind::FrameBindingSet).unwrap();
    let mut fbs_desc = FrameBindingSetDesc::default();
    fbs_desc.rtvs[0] = BindingRtv {
        resource: swap_chain,
        format: Format::R8G8B8A8_UNORM,
        dimension: ViewDimension::Tex2d,
        ..BindingRtv::default()
    };
    backend.create_frame_binding_set(fbs, &fbs_desc, "fbs").unwrap();

    let list = handles.alloc(ResourceKind::CommandList).unwrap();
    backend.create_command_list(list, "present list").unwrap();

    assert_eq!(backend.swap_chain_backbuffer_idx(swap_chain).unwrap(), 0);

    for expected in [1u32, 0u32] {
        let mut recorder = CommandList::new(Arc::clone(&handles));
        recorder.clear_rtv(fbs, 0, [0.1, 0.1, 0.2, 1.0]).unwrap();
        backend.compile_command_list(list, &recorder).unwrap();
        backend.submit_command_lists(&[list]).unwrap();
        backend.present_swap_chain(swap_chain).unwrap();
        backend.next_frame();
        assert_eq!(
            backend.swap_chain_backbuffer_idx(swap_chain).unwrap(),
            expected
        );
    }
}

#[test]
fn resize_swap_chain_drains_and_resets() {
    let _ = pretty_env_logger::try_init();
    let backend = SwBackend::new(SetupParams::default());
    backend.initialize(0).unwrap();
    let handles = Arc::new(HandleAllocator::new());

    let swap_chain = handles.alloc(ResourceKind::SwapChain).unwrap();
    backend
        .create_swap_chain(
            swap_chain,
            &SwapChainDesc {
                width: 640,
                height: 480,
                format: Format::R8G8B8A8_UNORM,
                buffer_count: 3,
                window: WindowHandle::default(),
            },
            "resize test",
        )
        .unwrap();

    backend.present_swap_chain(swap_chain).unwrap();
    assert_eq!(backend.swap_chain_backbuffer_idx(swap_chain).unwrap(), 1);

    backend.resize_swap_chain(swap_chain, 1280, 720).unwrap();
    assert_eq!(backend.swap_chain_backbuffer_idx(swap_chain).unwrap(), 0);
}

#[test]
fn unbalanced_event_scope_fails_compile() {
    let _ = pretty_env_logger::try_init();
    let manager = Manager::new(tachyon_gpu_sw::plugin(), SetupParams::default());
    manager.initialize(0).unwrap();

    let list_handle = manager.create_command_list("events").unwrap();
    let mut recorder = manager.create_command_list_recorder();
    let ev = recorder.event(0, "left open").unwrap();
    std::mem::forget(ev);

    assert_eq!(
        manager.compile_command_list(list_handle, &recorder),
        Err(Error::InvalidState)
    );
}
