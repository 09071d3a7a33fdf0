//! The software device: queues, frame lifecycle, and the allocator fleet.
//!
//! A single executor thread stands in for the GPU. It drains direct, copy and
//! async-compute lanes in FIFO submission order (a stronger guarantee than
//! the contract requires; cross-queue ordering is still expressed through
//! fences). Everything the device owns that is per-frame — upload allocators,
//! the shader-visible descriptor stream — is rotated by `next_frame` once the
//! frame fence says the slot has retired.

use crate::command_list::NativeOp;
use crate::descriptor::{
    DescriptorHeapAllocator, DescriptorHeapSubType, LinearDescriptorAllocator,
    LinearDescriptorSubAllocator,
};
use crate::resources::FenceInner;
use crate::upload::LinearHeapAllocator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, Sender, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use tachyon_gpu::types::*;

/// Logical queue a task is submitted on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueueKind {
    Direct,
    Copy,
    AsyncCompute,
}

pub const UPLOAD_BLOCK_SIZE: u64 = 1024 * 1024;
const VIEW_HEAP_BLOCK_SIZE: u32 = 32768;
const SAMPLER_HEAP_BLOCK_SIZE: u32 = 2048;
const RTV_HEAP_BLOCK_SIZE: u32 = 1024;
const DSV_HEAP_BLOCK_SIZE: u32 = 1024;
const FRAME_DESCRIPTOR_STREAM_SIZE: u32 = 8192;
const FRAME_SAMPLER_STREAM_SIZE: u32 = 512;
const SUB_ALLOCATOR_BLOCK_SIZE: u32 = 256;

enum GpuTask {
    Execute {
        queue: QueueKind,
        ops: Arc<Vec<NativeOp>>,
    },
    Signal {
        queue: QueueKind,
        fence: Arc<FenceInner>,
        value: u64,
    },
    /// Queue-side wait: the executor stalls until `fence` reaches `value`.
    Wait {
        fence: Arc<FenceInner>,
        value: u64,
    },
    /// Drain marker; acknowledged once everything before it has executed.
    Flush {
        ack: SyncSender<()>,
    },
    /// Artificial stall, released when the sender is dropped. Used to hold
    /// the "GPU" still for capture tooling and frame-pacing tests.
    Hold {
        until: Receiver<()>,
    },
}

struct Executor {
    sender: Sender<GpuTask>,
    thread: Option<JoinHandle<()>>,
}

impl Executor {
    fn new() -> Executor {
        let (sender, receiver) = mpsc::channel::<GpuTask>();
        let thread = std::thread::Builder::new()
            .name("tachyon-gpu-executor".to_string())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    match task {
                        GpuTask::Execute { queue, ops } => {
                            log::trace!("executing {} ops on {:?}", ops.len(), queue);
                            for op in ops.iter() {
                                op.execute();
                            }
                        }
                        GpuTask::Signal { queue, fence, value } => {
                            log::trace!("signal {} on {:?}", value, queue);
                            fence.signal(value);
                        }
                        GpuTask::Wait { fence, value } => {
                            fence.wait(value);
                        }
                        GpuTask::Flush { ack } => {
                            let _ = ack.send(());
                        }
                        GpuTask::Hold { until } => {
                            // Blocks until the holder hangs up.
                            let _ = until.recv();
                        }
                    }
                }
            })
            .expect("failed to spawn executor thread");
        Executor {
            sender,
            thread: Some(thread),
        }
    }

    fn send(&self, task: GpuTask) {
        // The executor lives as long as the device.
        let _ = self.sender.send(task);
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Hang up, then let the thread drain what is queued.
        let (sender, _) = mpsc::channel();
        drop(std::mem::replace(&mut self.sender, sender));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

//--------------------------------------------------------------------------------------------------

/// Root signature: the fixed descriptor-table layout shaders are compiled
/// against. The device creates one per pipeline class at initialisation.
#[derive(Clone, Debug)]
pub struct RootSignature {
    pub debug_name: &'static str,
    pub num_cbvs: u32,
    pub num_srvs: u32,
    pub num_uavs: u32,
    pub num_samplers: u32,
}

/// Per-frame shader-visible descriptor stream: a linear view/sampler
/// allocator plus the padded sub-allocators feeding transient binding sets.
pub struct FrameDescriptorStream {
    pub views: Arc<LinearDescriptorAllocator>,
    pub samplers: Arc<LinearDescriptorAllocator>,
    pub cbvs: LinearDescriptorSubAllocator,
    pub srvs: LinearDescriptorSubAllocator,
    pub uavs: LinearDescriptorSubAllocator,
}

impl FrameDescriptorStream {
    fn new(
        view_heap: &DescriptorHeapAllocator,
        sampler_heap: &DescriptorHeapAllocator,
    ) -> FrameDescriptorStream {
        let views = Arc::new(
            LinearDescriptorAllocator::new(view_heap, FRAME_DESCRIPTOR_STREAM_SIZE)
                .expect("frame descriptor stream"),
        );
        let samplers = Arc::new(
            LinearDescriptorAllocator::new(sampler_heap, FRAME_SAMPLER_STREAM_SIZE)
                .expect("frame sampler stream"),
        );
        FrameDescriptorStream {
            cbvs: LinearDescriptorSubAllocator::new(
                Arc::clone(&views),
                DescriptorHeapSubType::Cbv,
                SUB_ALLOCATOR_BLOCK_SIZE,
            ),
            srvs: LinearDescriptorSubAllocator::new(
                Arc::clone(&views),
                DescriptorHeapSubType::Srv,
                SUB_ALLOCATOR_BLOCK_SIZE,
            ),
            uavs: LinearDescriptorSubAllocator::new(
                Arc::clone(&views),
                DescriptorHeapSubType::Uav,
                SUB_ALLOCATOR_BLOCK_SIZE,
            ),
            views,
            samplers,
        }
    }

    /// Rewinds the stream. Only called for a frame slot whose previous
    /// tenant has retired on the GPU.
    fn reset(&self) {
        self.cbvs.reset();
        self.srvs.reset();
        self.uavs.reset();
        self.views.reset();
        self.samplers.reset();
    }
}

pub struct SwDevice {
    executor: Executor,
    frame_idx: AtomicU64,
    frame_fence: Arc<FenceInner>,
    upload_fence: Arc<FenceInner>,
    /// Guards the upload fence counter so a queue-side wait can never be
    /// enqueued ahead of the signal it waits for.
    upload_fence_idx: Mutex<u64>,
    upload_allocators: Vec<LinearHeapAllocator>,

    pub view_heap_allocator: DescriptorHeapAllocator,
    pub sampler_heap_allocator: DescriptorHeapAllocator,
    pub rtv_heap_allocator: DescriptorHeapAllocator,
    pub dsv_heap_allocator: DescriptorHeapAllocator,

    frame_streams: Vec<FrameDescriptorStream>,

    pub graphics_root_signature: RootSignature,
    pub compute_root_signature: RootSignature,

    stall: Mutex<Option<SyncSender<()>>>,
}

impl SwDevice {
    pub fn new() -> SwDevice {
        let view_heap_allocator =
            DescriptorHeapAllocator::new(true, VIEW_HEAP_BLOCK_SIZE, "view descriptor heap");
        let sampler_heap_allocator =
            DescriptorHeapAllocator::new(true, SAMPLER_HEAP_BLOCK_SIZE, "sampler descriptor heap");
        let rtv_heap_allocator =
            DescriptorHeapAllocator::new(false, RTV_HEAP_BLOCK_SIZE, "rtv descriptor heap");
        let dsv_heap_allocator =
            DescriptorHeapAllocator::new(false, DSV_HEAP_BLOCK_SIZE, "dsv descriptor heap");

        let frame_streams = (0..MAX_GPU_FRAMES)
            .map(|_| FrameDescriptorStream::new(&view_heap_allocator, &sampler_heap_allocator))
            .collect();

        log::info!("software device initialised");

        SwDevice {
            executor: Executor::new(),
            frame_idx: AtomicU64::new(0),
            frame_fence: Arc::new(FenceInner::new(0)),
            upload_fence: Arc::new(FenceInner::new(0)),
            upload_fence_idx: Mutex::new(0),
            upload_allocators: (0..MAX_GPU_FRAMES)
                .map(|_| LinearHeapAllocator::new(UPLOAD_BLOCK_SIZE))
                .collect(),
            view_heap_allocator,
            sampler_heap_allocator,
            rtv_heap_allocator,
            dsv_heap_allocator,
            frame_streams,
            graphics_root_signature: RootSignature {
                debug_name: "graphics root signature",
                num_cbvs: MAX_CBV_BINDINGS as u32,
                num_srvs: MAX_SRV_BINDINGS as u32,
                num_uavs: MAX_UAV_BINDINGS as u32,
                num_samplers: MAX_SAMPLER_BINDINGS as u32,
            },
            compute_root_signature: RootSignature {
                debug_name: "compute root signature",
                num_cbvs: MAX_CBV_BINDINGS as u32,
                num_srvs: MAX_SRV_BINDINGS as u32,
                num_uavs: MAX_UAV_BINDINGS as u32,
                num_samplers: MAX_SAMPLER_BINDINGS as u32,
            },
            stall: Mutex::new(None),
        }
    }

    /// Descriptor stream of the current frame slot.
    pub fn frame_stream(&self) -> &FrameDescriptorStream {
        &self.frame_streams[(self.frame_idx() % MAX_GPU_FRAMES) as usize]
    }

    pub fn frame_idx(&self) -> u64 {
        self.frame_idx.load(Ordering::Acquire)
    }

    /// Upload allocator of the current frame slot.
    pub fn upload_allocator(&self) -> &LinearHeapAllocator {
        &self.upload_allocators[(self.frame_idx() % MAX_GPU_FRAMES) as usize]
    }

    pub fn frame_fence_completed(&self) -> u64 {
        self.frame_fence.completed_value()
    }

    //----------------------------------------------------------------------------------------------
    // Queue traffic.

    pub fn execute(&self, queue: QueueKind, ops: Arc<Vec<NativeOp>>) {
        if queue == QueueKind::Direct {
            // Uploads issued on the copy queue must land before direct work.
            // The lock keeps the wait behind the matching signal in the
            // task stream.
            let value = *self.upload_fence_idx.lock().unwrap();
            self.executor.send(GpuTask::Wait {
                fence: Arc::clone(&self.upload_fence),
                value,
            });
        }
        self.executor.send(GpuTask::Execute { queue, ops });
    }

    pub fn signal(&self, queue: QueueKind, fence: Arc<FenceInner>, value: u64) {
        self.executor.send(GpuTask::Signal { queue, fence, value });
    }

    /// Signals the internal upload fence on the copy queue after staging
    /// initial resource data.
    pub fn signal_upload(&self) {
        let mut idx = self.upload_fence_idx.lock().unwrap();
        *idx += 1;
        self.executor.send(GpuTask::Signal {
            queue: QueueKind::Copy,
            fence: Arc::clone(&self.upload_fence),
            value: *idx,
        });
    }

    /// Blocks until every task queued so far has executed.
    pub fn flush(&self) {
        let (ack, done) = sync_channel(1);
        self.executor.send(GpuTask::Flush { ack });
        let _ = done.recv();
    }

    /// Holds the executor still (`true`) or releases it (`false`). While
    /// held, submitted work does not complete and fences do not advance.
    pub fn set_stalled(&self, stalled: bool) {
        let mut stall = self.stall.lock().unwrap();
        if stalled {
            if stall.is_none() {
                let (tx, rx) = sync_channel(0);
                self.executor.send(GpuTask::Hold { until: rx });
                *stall = Some(tx);
            }
        } else {
            *stall = None;
        }
    }

    //----------------------------------------------------------------------------------------------
    // Frame lifecycle.

    /// Steps the frame index. Blocks on the frame fence while the in-flight
    /// window is full, then rewinds the retired frame's upload allocator and
    /// per-frame descriptor stream, and signals the new frame on the direct
    /// queue.
    pub fn next_frame(&self) {
        let frame_idx = self.frame_idx.load(Ordering::Acquire);
        if frame_idx - self.frame_fence.completed_value() >= MAX_GPU_FRAMES {
            self.frame_fence.wait(frame_idx - MAX_GPU_FRAMES + 1);
        }

        let frame_idx = frame_idx + 1;
        self.frame_idx.store(frame_idx, Ordering::Release);

        self.upload_allocators[(frame_idx % MAX_GPU_FRAMES) as usize].reset();
        self.frame_streams[(frame_idx % MAX_GPU_FRAMES) as usize].reset();

        self.signal(
            QueueKind::Direct,
            Arc::clone(&self.frame_fence),
            frame_idx,
        );
    }

    /// Drains all in-flight frames and queue work (resize, teardown).
    pub fn wait_idle(&self) {
        self.flush();
        self.frame_fence.wait(self.frame_idx());
    }
}

impl Drop for SwDevice {
    fn drop(&mut self) {
        self.set_stalled(false);
    }
}
