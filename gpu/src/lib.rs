//! Low-level, multi-backend GPU abstraction in the style of the explicit
//! graphics APIs.
//!
//! The crate provides the backend-agnostic half of the system:
//!
//! * generation-safe [`Handle`]s and their allocator,
//! * formats and footprint math,
//! * a recordable, deferred [`CommandList`],
//! * the [`Backend`] contract a native driver plugin implements,
//! * and the [`Manager`] facade that ties them together.
//!
//! Backends compile recorded command lists into native commands, tracking
//! resource-state transitions as they go; the facade keeps uploads, readbacks
//! and presentation ordered through fences and bounds the number of frames
//! in flight.
//!
//! Command lists are backend-agnostic and can be recorded from multiple
//! threads at once (one thread per list); resource creation and submission go
//! through the facade.

pub mod backend;
pub mod command_list;
pub mod error;
pub mod format;
pub mod handle;
pub mod manager;
pub mod resources;
pub mod types;

pub use self::backend::{
    load_backend_plugin, AdapterInfo, Backend, BackendPlugin, BackendPluginEntry,
    LoadedBackendPlugin, SetupParams, BACKEND_PLUGIN_ENTRY,
};
pub use self::command_list::{ClearUavValue, Command, CommandList, DataRange, ScopedEvent};
pub use self::error::{Error, Result};
pub use self::format::{
    copy_texture_data, format_info, texture_footprint, Footprint, Format, FormatInfo,
};
pub use self::handle::{Handle, HandleAllocator, ResourceKind};
pub use self::manager::Manager;
pub use self::resources::*;
pub use self::types::*;
