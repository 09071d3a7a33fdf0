//! Barrier placement and command-list state machine, observed through the
//! software backend's compiled op stream.

use std::sync::Arc;
use tachyon_gpu::backend::{Backend, SetupParams};
use tachyon_gpu::command_list::CommandList;
use tachyon_gpu::*;
use tachyon_gpu_sw::{BarrierOp, NativeOp, SwBackend};

struct Fixture {
    backend: SwBackend,
    handles: Arc<HandleAllocator>,
}

impl Fixture {
    fn new() -> Fixture {
        let _ = pretty_env_logger::try_init();
        let backend = SwBackend::new(SetupParams::default());
        backend.initialize(0).unwrap();
        Fixture {
            backend,
            handles: Arc::new(HandleAllocator::new()),
        }
    }

    fn alloc(&self, kind: ResourceKind) -> Handle {
        self.handles.alloc(kind).unwrap()
    }

    fn recorder(&self) -> CommandList {
        CommandList::new(Arc::clone(&self.handles))
    }

    fn compute_pso(&self) -> Handle {
        let shader = self.alloc(ResourceKind::Shader);
        self.backend
            .create_shader(
                shader,
                &ShaderDesc {
                    shader_type: ShaderType::Compute,
                    data: &[0xca, 0xfe],
                },
                "cs",
            )
            .unwrap();
        let pso = self.alloc(ResourceKind::ComputePipelineState);
        self.backend
            .create_compute_pipeline_state(pso, &ComputePipelineStateDesc { shader }, "cs pso")
            .unwrap();
        pso
    }

    fn graphics_pso(&self) -> Handle {
        let shader = self.alloc(ResourceKind::Shader);
        self.backend
            .create_shader(
                shader,
                &ShaderDesc {
                    shader_type: ShaderType::Vertex,
                    data: &[0xbe, 0xef],
                },
                "vs",
            )
            .unwrap();
        let pso = self.alloc(ResourceKind::GraphicsPipelineState);
        let mut desc = GraphicsPipelineStateDesc::default();
        desc.shaders[ShaderType::Vertex as usize] = shader;
        desc.num_rtvs = 1;
        desc.rtv_formats[0] = Format::R8G8B8A8_UNORM;
        self.backend
            .create_graphics_pipeline_state(pso, &desc, "gfx pso")
            .unwrap();
        pso
    }

    fn barrier_batches(&self, list: Handle) -> Vec<Vec<BarrierOp>> {
        self.backend
            .with_compiled_ops(list, |ops| {
                ops.iter()
                    .filter_map(|op| match op {
                        NativeOp::Barriers(barriers) => Some(barriers.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap()
    }
}

fn transitions(batch: &[BarrierOp]) -> Vec<(Handle, ResourceState, ResourceState)> {
    batch
        .iter()
        .filter_map(|b| match b {
            BarrierOp::Transition {
                resource,
                before,
                after,
                ..
            } => Some((resource.handle, *before, *after)),
            _ => None,
        })
        .collect()
}

#[test]
fn clear_then_draw_coalesces_to_two_barriers() {
    let f = Fixture::new();

    let swap_chain = f.alloc(ResourceKind::SwapChain);
    f.backend
        .create_swap_chain(
            swap_chain,
            &SwapChainDesc {
                width: 256,
                height: 256,
                format: Format::R8G8B8A8_UNORM,
                buffer_count: 2,
                window: WindowHandle::default(),
            },
            "sc",
        )
        .unwrap();

    let fbs = f.alloc(ResourceKind::FrameBindingSet);
    let mut fbs_desc = FrameBindingSetDesc::default();
    fbs_desc.rtvs[0] = BindingRtv {
        resource: swap_chain,
        format: Format::R8G8B8A8_UNORM,
        dimension: ViewDimension::Tex2d,
        ..BindingRtv::default()
    };
    f.backend.create_frame_binding_set(fbs, &fbs_desc, "fbs").unwrap();

    let pso = f.graphics_pso();
    let pbs = f.alloc(ResourceKind::PipelineBindingSet);
    f.backend
        .create_pipeline_binding_set(
            pbs,
            &PipelineBindingSetDesc {
                pipeline: pso,
                ..PipelineBindingSetDesc::default()
            },
            "pbs",
        )
        .unwrap();

    let mut recorder = f.recorder();
    recorder.clear_rtv(fbs, 0, [0.1, 0.1, 0.2, 1.0]).unwrap();
    recorder
        .draw(
            pbs,
            Handle::default(),
            fbs,
            &DrawState::default(),
            PrimitiveTopology::TriangleList,
            0,
            0,
            3,
            0,
            1,
        )
        .unwrap();

    let list = f.alloc(ResourceKind::CommandList);
    f.backend.create_command_list(list, "list").unwrap();
    f.backend.compile_command_list(list, &recorder).unwrap();

    // One barrier up front (present -> render target), one restoring the
    // default at the end. The draw on the already-transitioned target adds
    // nothing.
    let batches = f.barrier_batches(list);
    assert_eq!(batches.len(), 2);

    let head = transitions(&batches[0]);
    assert_eq!(head.len(), 1);
    assert_eq!(head[0].1, ResourceState::PRESENT);
    assert_eq!(head[0].2, ResourceState::RENDER_TARGET);

    let tail = transitions(&batches[1]);
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].1, ResourceState::RENDER_TARGET);
    assert_eq!(tail[0].2, ResourceState::PRESENT);
}

#[test]
fn copy_chain_restores_defaults() {
    let f = Fixture::new();

    let desc = TextureDesc {
        texture_type: TextureType::Tex2d,
        width: 4,
        height: 4,
        depth: 1,
        array_elements: 1,
        mip_levels: 1,
        format: Format::R8G8B8A8_UNORM,
        bind_flags: BindFlags::SHADER_RESOURCE,
    };
    let a = f.alloc(ResourceKind::Texture);
    let b = f.alloc(ResourceKind::Texture);
    f.backend.create_texture(a, &desc, None, "a").unwrap();
    f.backend.create_texture(b, &desc, None, "b").unwrap();

    let data = [7u8; 64];
    let mut recorder = f.recorder();
    recorder
        .update_texture_sub_resource(
            a,
            0,
            &TextureSubResourceData {
                data: &data,
                row_pitch: 16,
                slice_pitch: 64,
            },
        )
        .unwrap();
    recorder
        .copy_texture_sub_resource(
            b,
            0,
            Point::default(),
            a,
            0,
            Box3d {
                w: 4,
                h: 4,
                d: 1,
                ..Box3d::default()
            },
        )
        .unwrap();

    let list = f.alloc(ResourceKind::CommandList);
    f.backend.create_command_list(list, "list").unwrap();
    f.backend.compile_command_list(list, &recorder).unwrap();

    let batches = f.barrier_batches(list);
    let default_srv =
        ResourceState::PIXEL_SHADER_RESOURCE | ResourceState::NON_PIXEL_SHADER_RESOURCE;

    // `a` goes default -> copy dest -> copy source -> default; the restore
    // batch must put both textures back at their default state.
    let last = transitions(batches.last().unwrap());
    assert!(last
        .iter()
        .any(|&(h, before, after)| h == a
            && before == ResourceState::COPY_SOURCE
            && after == default_srv));
    assert!(last
        .iter()
        .any(|&(h, before, after)| h == b
            && before == ResourceState::COPY_DEST
            && after == default_srv));

    // No batch carries two contradictory transitions for one resource.
    for batch in &batches {
        let ts = transitions(batch);
        for (i, &(h, _, after)) in ts.iter().enumerate() {
            for &(other_h, _, other_after) in &ts[i + 1..] {
                assert!(!(h == other_h && after != other_after));
            }
        }
    }
}

#[test]
fn dispatch_reads_through_shader_resource_state() {
    let f = Fixture::new();

    let texture_desc = TextureDesc {
        texture_type: TextureType::Tex2d,
        width: 4,
        height: 4,
        depth: 1,
        array_elements: 1,
        mip_levels: 1,
        format: Format::R8G8B8A8_UNORM,
        bind_flags: BindFlags::SHADER_RESOURCE,
    };
    let texture = f.alloc(ResourceKind::Texture);
    f.backend.create_texture(texture, &texture_desc, None, "tex").unwrap();

    let pso = f.compute_pso();
    let pbs = f.alloc(ResourceKind::PipelineBindingSet);
    f.backend
        .create_pipeline_binding_set(
            pbs,
            &PipelineBindingSetDesc {
                pipeline: pso,
                num_srvs: 1,
                ..PipelineBindingSetDesc::default()
            },
            "pbs",
        )
        .unwrap();
    f.backend
        .update_srvs(
            pbs,
            0,
            &[BindingSrv {
                resource: texture,
                format: texture_desc.format,
                dimension: ViewDimension::Tex2d,
                mip_levels: 1,
                array_size: 1,
                ..BindingSrv::default()
            }],
        )
        .unwrap();

    let data = [3u8; 64];
    let mut recorder = f.recorder();
    recorder
        .update_texture_sub_resource(
            texture,
            0,
            &TextureSubResourceData {
                data: &data,
                row_pitch: 16,
                slice_pitch: 64,
            },
        )
        .unwrap();
    recorder.dispatch(pbs, 1, 1, 1).unwrap();

    let list = f.alloc(ResourceKind::CommandList);
    f.backend.create_command_list(list, "list").unwrap();
    f.backend.compile_command_list(list, &recorder).unwrap();

    let batches = f.barrier_batches(list);
    let default_srv =
        ResourceState::PIXEL_SHADER_RESOURCE | ResourceState::NON_PIXEL_SHADER_RESOURCE;

    // default -> copy dest, copy dest -> non-pixel srv, then restore.
    let all: Vec<_> = batches.iter().flat_map(|b| transitions(b)).collect();
    assert_eq!(
        all,
        vec![
            (texture, default_srv, ResourceState::COPY_DEST),
            (
                texture,
                ResourceState::COPY_DEST,
                ResourceState::NON_PIXEL_SHADER_RESOURCE
            ),
            (
                texture,
                ResourceState::NON_PIXEL_SHADER_RESOURCE,
                default_srv
            ),
        ]
    );
}

#[test]
fn adjacent_uav_dispatches_get_uav_barrier() {
    let f = Fixture::new();

    let buffer = f.alloc(ResourceKind::Buffer);
    f.backend
        .create_buffer(
            buffer,
            &BufferDesc {
                size: 256,
                bind_flags: BindFlags::UNORDERED_ACCESS,
            },
            None,
            "uav buffer",
        )
        .unwrap();

    let pso = f.compute_pso();
    let pbs = f.alloc(ResourceKind::PipelineBindingSet);
    f.backend
        .create_pipeline_binding_set(
            pbs,
            &PipelineBindingSetDesc {
                pipeline: pso,
                num_uavs: 1,
                ..PipelineBindingSetDesc::default()
            },
            "pbs",
        )
        .unwrap();
    f.backend
        .update_uavs(
            pbs,
            0,
            &[BindingUav {
                resource: buffer,
                dimension: ViewDimension::Buffer,
                num_elements: 64,
                structure_byte_stride: 4,
                ..BindingUav::default()
            }],
        )
        .unwrap();

    let mut recorder = f.recorder();
    recorder.dispatch(pbs, 1, 1, 1).unwrap();
    recorder.dispatch(pbs, 1, 1, 1).unwrap();

    let list = f.alloc(ResourceKind::CommandList);
    f.backend.create_command_list(list, "list").unwrap();
    f.backend.compile_command_list(list, &recorder).unwrap();

    let batches = f.barrier_batches(list);
    let uav_batches = batches
        .iter()
        .filter(|b| {
            b.iter()
                .any(|op| matches!(op, BarrierOp::Uav { resource } if resource.handle == buffer))
        })
        .count();
    // Both dispatches touch the buffer while it already rests in the
    // unordered-access state, so each gets an ordering barrier.
    assert_eq!(uav_batches, 2);
}

#[test]
fn failed_compile_leaves_list_closed_and_empty() {
    let f = Fixture::new();

    let buffer = f.alloc(ResourceKind::Buffer);
    f.backend
        .create_buffer(
            buffer,
            &BufferDesc {
                size: 64,
                bind_flags: BindFlags::SHADER_RESOURCE,
            },
            None,
            "buffer",
        )
        .unwrap();

    let mut recorder = f.recorder();
    recorder.update_buffer(buffer, 0, &[1u8; 16]).unwrap();

    // Pull the record out from under the recorded list; the compile must
    // fail and leave the native list submittable with zero work.
    f.backend.destroy_resource(buffer).unwrap();

    let list = f.alloc(ResourceKind::CommandList);
    f.backend.create_command_list(list, "list").unwrap();
    assert!(f.backend.compile_command_list(list, &recorder).is_err());

    f.backend.submit_command_lists(&[list]).unwrap();
    let num_ops = f.backend.with_compiled_ops(list, |ops| ops.len()).unwrap();
    assert_eq!(num_ops, 0);
}

#[test]
fn empty_list_restores_nothing_but_closes() {
    let f = Fixture::new();

    let recorder = f.recorder();
    let list = f.alloc(ResourceKind::CommandList);
    f.backend.create_command_list(list, "list").unwrap();
    f.backend.compile_command_list(list, &recorder).unwrap();

    assert_eq!(f.barrier_batches(list).len(), 0);
    f.backend.submit_command_lists(&[list]).unwrap();
}

#[test]
fn resubmission_requires_recompile() {
    let f = Fixture::new();

    let recorder = f.recorder();
    let list = f.alloc(ResourceKind::CommandList);
    f.backend.create_command_list(list, "list").unwrap();
    f.backend.compile_command_list(list, &recorder).unwrap();

    f.backend.submit_command_lists(&[list]).unwrap();
    // `Submitted` may not advance to `Submitted` again.
    assert_eq!(
        f.backend.submit_command_lists(&[list]),
        Err(Error::InvalidState)
    );

    f.backend.compile_command_list(list, &recorder).unwrap();
    f.backend.submit_command_lists(&[list]).unwrap();
}
