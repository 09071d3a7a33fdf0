//! Update / copy / readback round trips through the full stack.

use tachyon_gpu::*;

fn manager() -> Manager {
    let _ = pretty_env_logger::try_init();
    let manager = Manager::new(tachyon_gpu_sw::plugin(), SetupParams::default());
    manager.initialize(0).unwrap();
    manager
}

#[test]
fn update_copy_readback_buffer() {
    let manager = manager();

    let buffer = manager
        .create_buffer(
            &BufferDesc {
                size: 1024 * 1024,
                bind_flags: BindFlags::SHADER_RESOURCE,
            },
            None,
            "update_copy_readback_buffer",
        )
        .unwrap();
    let readback = manager
        .create_buffer(
            &BufferDesc {
                size: 1024 * 1024,
                bind_flags: BindFlags::empty(),
            },
            None,
            "update_copy_readback_buffer readback",
        )
        .unwrap();
    let fence = manager.create_fence(0, "update_copy_readback_buffer").unwrap();
    let list_handle = manager.create_command_list("update_copy_readback_buffer").unwrap();

    let test_data0: [f32; 4] = [1.0, 2.0, 3.0, 4.0];
    let test_data1: [f32; 4] = [0.1, 0.2, 0.3, 0.4];
    let bytes0: Vec<u8> = test_data0.iter().flat_map(|v| v.to_le_bytes()).collect();
    let bytes1: Vec<u8> = test_data1.iter().flat_map(|v| v.to_le_bytes()).collect();

    let mut list = manager.create_command_list_recorder();
    list.update_buffer(buffer, 0, &bytes0).unwrap();
    list.update_buffer(buffer, 16, &bytes1).unwrap();
    list.copy_buffer(readback, 0, buffer, 0, 1024 * 1024).unwrap();

    manager.compile_command_list(list_handle, &list).unwrap();
    manager.submit_command_list(list_handle).unwrap();

    manager.signal_fence(fence, 1).unwrap();
    manager.wait_fence(fence, 1).unwrap();
    assert_eq!(manager.fence_completed_value(fence).unwrap(), 1);

    let mut readback_data = [0u8; 32];
    manager.readback_buffer(readback, 0, &mut readback_data).unwrap();
    assert_eq!(&readback_data[0..16], bytes0.as_slice());
    assert_eq!(&readback_data[16..32], bytes1.as_slice());

    manager.destroy_resource(list_handle).unwrap();
    manager.destroy_resource(fence).unwrap();
    manager.destroy_resource(readback).unwrap();
    manager.destroy_resource(buffer).unwrap();
}

#[test]
fn update_copy_readback_texture() {
    let manager = manager();

    let texture_desc = TextureDesc {
        texture_type: TextureType::Tex2d,
        width: 4,
        height: 2,
        depth: 1,
        array_elements: 1,
        mip_levels: 1,
        format: Format::R32_FLOAT,
        bind_flags: BindFlags::SHADER_RESOURCE,
    };
    let readback_desc = TextureDesc {
        bind_flags: BindFlags::empty(),
        ..texture_desc
    };
    let texture = manager
        .create_texture(&texture_desc, None, "update_copy_readback_texture")
        .unwrap();
    let readback = manager
        .create_texture(&readback_desc, None, "update_copy_readback_texture readback")
        .unwrap();
    let fence = manager.create_fence(0, "update_copy_readback_texture").unwrap();
    let list_handle = manager.create_command_list("update_copy_readback_texture").unwrap();

    let test_data: [f32; 8] = [1.0, 2.0, 3.0, 4.0, 0.1, 0.2, 0.3, 0.4];
    let bytes: Vec<u8> = test_data.iter().flat_map(|v| v.to_le_bytes()).collect();

    let mut list = manager.create_command_list_recorder();
    list.update_texture_sub_resource(
        texture,
        0,
        &TextureSubResourceData {
            data: &bytes,
            row_pitch: 16,
            slice_pitch: 32,
        },
    )
    .unwrap();
    list.copy_texture_sub_resource(
        readback,
        0,
        Point::default(),
        texture,
        0,
        Box3d {
            x: 0,
            y: 0,
            z: 0,
            w: 4,
            h: 2,
            d: 1,
        },
    )
    .unwrap();

    manager.compile_command_list(list_handle, &list).unwrap();
    manager.submit_command_list(list_handle).unwrap();

    manager.signal_fence(fence, 1).unwrap();
    manager.wait_fence(fence, 1).unwrap();

    let mut readback_bytes = [0u8; 32];
    manager
        .readback_texture_subresource(
            readback,
            0,
            &mut TextureSubResourceDataMut {
                data: &mut readback_bytes,
                row_pitch: 16,
                slice_pitch: 32,
            },
        )
        .unwrap();
    assert_eq!(&readback_bytes[..], bytes.as_slice());

    manager.destroy_resource(list_handle).unwrap();
    manager.destroy_resource(fence).unwrap();
    manager.destroy_resource(readback).unwrap();
    manager.destroy_resource(texture).unwrap();
}

#[test]
fn update_copy_readback_texture_subregion() {
    let manager = manager();

    let desc = TextureDesc {
        texture_type: TextureType::Tex2d,
        width: 4,
        height: 4,
        depth: 1,
        array_elements: 1,
        mip_levels: 1,
        format: Format::R8_UNORM,
        bind_flags: BindFlags::SHADER_RESOURCE,
    };
    let src = manager.create_texture(&desc, None, "subregion src").unwrap();
    let dst = manager.create_texture(&desc, None, "subregion dst").unwrap();
    let fence = manager.create_fence(0, "subregion").unwrap();
    let list_handle = manager.create_command_list("subregion").unwrap();

    let pixels: Vec<u8> = (0u8..16).collect();
    let mut list = manager.create_command_list_recorder();
    list.update_texture_sub_resource(
        src,
        0,
        &TextureSubResourceData {
            data: &pixels,
            row_pitch: 4,
            slice_pitch: 16,
        },
    )
    .unwrap();
    // Copy the lower-right 2x2 quadrant into the top-left corner.
    list.copy_texture_sub_resource(
        dst,
        0,
        Point { x: 0, y: 0, z: 0 },
        src,
        0,
        Box3d {
            x: 2,
            y: 2,
            z: 0,
            w: 2,
            h: 2,
            d: 1,
        },
    )
    .unwrap();

    manager.compile_command_list(list_handle, &list).unwrap();
    manager.submit_command_list(list_handle).unwrap();
    manager.signal_fence(fence, 1).unwrap();
    manager.wait_fence(fence, 1).unwrap();

    let mut out = [0u8; 16];
    manager
        .readback_texture_subresource(
            dst,
            0,
            &mut TextureSubResourceDataMut {
                data: &mut out,
                row_pitch: 4,
                slice_pitch: 16,
            },
        )
        .unwrap();
    assert_eq!(&out[0..2], &[10, 11]);
    assert_eq!(&out[4..6], &[14, 15]);
}

#[test]
fn buffer_initial_data() {
    let manager = manager();
    let data: Vec<u8> = (0u8..64).collect();
    let buffer = manager
        .create_buffer(
            &BufferDesc {
                size: 64,
                bind_flags: BindFlags::SHADER_RESOURCE,
            },
            Some(&data),
            "buffer_initial_data",
        )
        .unwrap();

    let fence = manager.create_fence(0, "buffer_initial_data").unwrap();
    manager.signal_fence(fence, 1).unwrap();
    manager.wait_fence(fence, 1).unwrap();

    let mut out = [0u8; 64];
    manager.readback_buffer(buffer, 0, &mut out).unwrap();
    assert_eq!(&out[..], data.as_slice());
}

#[test]
fn compressed_copy_region_must_be_block_aligned() {
    let manager = manager();

    let desc = TextureDesc {
        texture_type: TextureType::Tex2d,
        width: 8,
        height: 8,
        depth: 1,
        array_elements: 1,
        mip_levels: 1,
        format: Format::BC1_UNORM,
        bind_flags: BindFlags::SHADER_RESOURCE,
    };
    let src = manager.create_texture(&desc, None, "bc src").unwrap();
    let dst = manager.create_texture(&desc, None, "bc dst").unwrap();
    let list_handle = manager.create_command_list("bc copy").unwrap();

    let mut list = manager.create_command_list_recorder();
    list.copy_texture_sub_resource(
        dst,
        0,
        Point { x: 0, y: 0, z: 0 },
        src,
        0,
        // 2x2 region inside a 4x4 block-compressed texture.
        Box3d {
            x: 2,
            y: 2,
            z: 0,
            w: 2,
            h: 2,
            d: 1,
        },
    )
    .unwrap();

    assert_eq!(
        manager.compile_command_list(list_handle, &list),
        Err(Error::Unsupported)
    );
}
