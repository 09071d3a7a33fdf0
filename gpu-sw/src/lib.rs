//! Software backend for the `tachyon-gpu` abstraction.
//!
//! A complete implementation of the backend contract that runs on the CPU:
//! resources live in plain memory, a dedicated executor thread stands in for
//! the GPU queues, and compiled command lists are streams of concrete ops.
//! Draws and dispatches are validated, state-tracked and ordered but not
//! rasterised; transfers, clears, fences, presentation and readback have
//! full semantics.
//!
//! Useful as the headless/test device, and as the reference for what a
//! native backend must do — in particular the barrier placement the
//! command-list compiler produces is observable through
//! [`SwBackend::with_compiled_ops`].

pub mod backend;
pub mod command_list;
pub mod compile;
pub mod descriptor;
pub mod device;
pub mod pool;
pub mod resources;
pub mod upload;

pub use self::backend::SwBackend;
pub use self::command_list::{BarrierOp, BarrierSubresources, ListState, NativeOp, SwCommandList};
pub use self::descriptor::{
    Descriptor, DescriptorAllocation, DescriptorHeap, DescriptorHeapAllocator,
    DescriptorHeapSubType, LinearDescriptorAllocator, LinearDescriptorSubAllocator,
};
pub use self::device::{QueueKind, RootSignature, SwDevice};
pub use self::resources::TrackKey;
pub use self::upload::{LinearHeapAllocator, ResourceAllocation, UploadBlock};

use tachyon_gpu::backend::{Backend, BackendPlugin, SetupParams};

fn create_backend(setup_params: &SetupParams) -> Box<dyn Backend> {
    Box::new(SwBackend::new(*setup_params))
}

/// Plugin descriptor for in-process selection of the software backend.
pub fn plugin() -> BackendPlugin {
    BackendPlugin {
        api_name: "Software",
        create_backend,
        destroy_backend: BackendPlugin::drop_backend,
    }
}

/// Shared-library entry point, found under
/// [`tachyon_gpu::backend::BACKEND_PLUGIN_ENTRY`] by the plugin loader.
#[no_mangle]
pub extern "C" fn tachyon_gpu_backend() -> BackendPlugin {
    plugin()
}
