//! Pixel and buffer element formats, plus the footprint helpers used by the
//! upload, copy and readback paths.

use crate::error::{Error, Result};

/// Element formats understood by the abstraction.
///
/// The numeric layout follows the usual explicit-API conventions: packed
/// color formats, depth/stencil formats, and BC block-compressed formats.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum Format {
    UNKNOWN,

    R8_UNORM,
    R8_SNORM,
    R8_UINT,
    R8_SINT,
    R8G8_UNORM,
    R8G8_UINT,
    R8G8B8A8_UNORM,
    R8G8B8A8_UNORM_SRGB,
    R8G8B8A8_SNORM,
    R8G8B8A8_UINT,
    B8G8R8A8_UNORM,

    R16_FLOAT,
    R16_UNORM,
    R16_UINT,
    R16G16_FLOAT,
    R16G16_UINT,
    R16G16B16A16_FLOAT,
    R16G16B16A16_UNORM,
    R16G16B16A16_UINT,

    R32_FLOAT,
    R32_UINT,
    R32_SINT,
    R32G32_FLOAT,
    R32G32_UINT,
    R32G32B32_FLOAT,
    R32G32B32A32_FLOAT,
    R32G32B32A32_UINT,

    R10G10B10A2_UNORM,
    R11G11B10_FLOAT,

    D16_UNORM,
    D24_UNORM_S8_UINT,
    D32_FLOAT,
    D32_FLOAT_S8X24_UINT,

    BC1_UNORM,
    BC1_UNORM_SRGB,
    BC2_UNORM,
    BC3_UNORM,
    BC3_UNORM_SRGB,
    BC4_UNORM,
    BC5_UNORM,
    BC6H_UF16,
    BC7_UNORM,
}

impl Default for Format {
    fn default() -> Format {
        Format::UNKNOWN
    }
}

pub const NUM_FORMATS: usize = Format::BC7_UNORM as usize + 1;

impl Format {
    /// All formats, in declaration order. Handy for exhaustive checks.
    pub fn all() -> impl Iterator<Item = Format> {
        (0..NUM_FORMATS as u32).map(|v| unsafe { std::mem::transmute::<u32, Format>(v) })
    }
}

/// Per-format block metrics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FormatInfo {
    /// Block width in texels. 1 for uncompressed formats.
    pub block_w: u32,
    /// Block height in texels. 1 for uncompressed formats.
    pub block_h: u32,
    /// Bits per block. For uncompressed formats this is bits per texel.
    pub block_bits: u32,
    pub compressed: bool,
    pub depth: bool,
    pub stencil: bool,
}

impl FormatInfo {
    pub fn block_bytes(&self) -> u32 {
        self.block_bits / 8
    }
}

const fn color(bits: u32) -> FormatInfo {
    FormatInfo {
        block_w: 1,
        block_h: 1,
        block_bits: bits,
        compressed: false,
        depth: false,
        stencil: false,
    }
}

const fn depth(bits: u32, stencil: bool) -> FormatInfo {
    FormatInfo {
        block_w: 1,
        block_h: 1,
        block_bits: bits,
        compressed: false,
        depth: true,
        stencil,
    }
}

const fn block(bits: u32) -> FormatInfo {
    FormatInfo {
        block_w: 4,
        block_h: 4,
        block_bits: bits,
        compressed: true,
        depth: false,
        stencil: false,
    }
}

pub fn format_info(format: Format) -> FormatInfo {
    use self::Format::*;
    match format {
        // Treat UNKNOWN as a single opaque byte so buffer-ish paths stay sane.
        UNKNOWN => color(8),

        R8_UNORM | R8_SNORM | R8_UINT | R8_SINT => color(8),
        R8G8_UNORM | R8G8_UINT => color(16),
        R8G8B8A8_UNORM | R8G8B8A8_UNORM_SRGB | R8G8B8A8_SNORM | R8G8B8A8_UINT
        | B8G8R8A8_UNORM => color(32),

        R16_FLOAT | R16_UNORM | R16_UINT => color(16),
        R16G16_FLOAT | R16G16_UINT => color(32),
        R16G16B16A16_FLOAT | R16G16B16A16_UNORM | R16G16B16A16_UINT => color(64),

        R32_FLOAT | R32_UINT | R32_SINT => color(32),
        R32G32_FLOAT | R32G32_UINT => color(64),
        R32G32B32_FLOAT => color(96),
        R32G32B32A32_FLOAT | R32G32B32A32_UINT => color(128),

        R10G10B10A2_UNORM | R11G11B10_FLOAT => color(32),

        D16_UNORM => depth(16, false),
        D24_UNORM_S8_UINT => depth(32, true),
        D32_FLOAT => depth(32, false),
        D32_FLOAT_S8X24_UINT => depth(64, true),

        BC1_UNORM | BC1_UNORM_SRGB | BC4_UNORM => block(64),
        BC2_UNORM | BC3_UNORM | BC3_UNORM_SRGB | BC5_UNORM | BC6H_UF16 | BC7_UNORM => block(128),
    }
}

//--------------------------------------------------------------------------------------------------

/// Byte layout of one texture subresource.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Footprint {
    /// Bytes between the start of two block rows.
    pub row_pitch: u32,
    /// Bytes between the start of two depth slices.
    pub slice_pitch: u32,
    /// Block rows per slice.
    pub num_rows: u32,
    pub num_slices: u32,
    pub total_bytes: u64,
}

/// Computes the byte footprint of a `width` x `height` x `depth` subresource.
///
/// `row_pitch`/`slice_pitch` override the tightly-packed pitches when given;
/// they must not be smaller than the natural pitch. Compressed formats must
/// be queried with block-aligned dimensions.
pub fn texture_footprint(
    format: Format,
    width: u32,
    height: u32,
    depth: u32,
    row_pitch: Option<u32>,
    slice_pitch: Option<u32>,
) -> Result<Footprint> {
    if width == 0 || height == 0 || depth == 0 {
        return Err(Error::InvalidArgument);
    }

    let info = format_info(format);
    if info.compressed && (width % info.block_w != 0 || height % info.block_h != 0) {
        return Err(Error::InvalidArgument);
    }

    let blocks_w = (width + info.block_w - 1) / info.block_w;
    let blocks_h = (height + info.block_h - 1) / info.block_h;

    let natural_row = blocks_w * info.block_bytes();
    let row_pitch = match row_pitch {
        Some(p) if p < natural_row => return Err(Error::InvalidArgument),
        Some(p) => p,
        None => natural_row,
    };

    let natural_slice = row_pitch * blocks_h;
    let slice_pitch = match slice_pitch {
        Some(p) if p < natural_slice => return Err(Error::InvalidArgument),
        Some(p) => p,
        None => natural_slice,
    };

    Ok(Footprint {
        row_pitch,
        slice_pitch,
        num_rows: blocks_h,
        num_slices: depth,
        total_bytes: slice_pitch as u64 * depth as u64,
    })
}

/// Copies `rows` block rows over `slices` slices between two layouts,
/// re-pitching row by row. The payload bytes are passed through untouched.
pub fn copy_texture_data(
    dst: &mut [u8],
    dst_footprint: &Footprint,
    src: &[u8],
    src_footprint: &Footprint,
    rows: u32,
    slices: u32,
) -> Result<()> {
    let row_bytes = dst_footprint.row_pitch.min(src_footprint.row_pitch) as usize;

    for slice in 0..slices as usize {
        let dst_slice = slice * dst_footprint.slice_pitch as usize;
        let src_slice = slice * src_footprint.slice_pitch as usize;
        for row in 0..rows as usize {
            let dst_off = dst_slice + row * dst_footprint.row_pitch as usize;
            let src_off = src_slice + row * src_footprint.row_pitch as usize;
            let dst_row = dst
                .get_mut(dst_off..dst_off + row_bytes)
                .ok_or(Error::InvalidArgument)?;
            let src_row = src
                .get(src_off..src_off + row_bytes)
                .ok_or(Error::InvalidArgument)?;
            dst_row.copy_from_slice(src_row);
        }
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_is_total() {
        for format in Format::all() {
            let info = format_info(format);
            assert!(info.block_w > 0);
            assert!(info.block_h > 0);
            assert!(info.block_bits > 0);
        }
    }

    #[test]
    fn footprint_tight() {
        let fp = texture_footprint(Format::R32_FLOAT, 4, 2, 1, None, None).unwrap();
        assert_eq!(fp.row_pitch, 16);
        assert_eq!(fp.slice_pitch, 32);
        assert_eq!(fp.num_rows, 2);
        assert_eq!(fp.total_bytes, 32);
    }

    #[test]
    fn footprint_padded_rows() {
        let fp = texture_footprint(Format::R8G8B8A8_UNORM, 3, 3, 2, Some(256), None).unwrap();
        assert_eq!(fp.row_pitch, 256);
        assert_eq!(fp.slice_pitch, 256 * 3);
        assert_eq!(fp.total_bytes, 256 * 3 * 2);
    }

    #[test]
    fn footprint_compressed_alignment() {
        let fp = texture_footprint(Format::BC1_UNORM, 8, 8, 1, None, None).unwrap();
        assert_eq!(fp.row_pitch, 2 * 8); // two 64-bit blocks per row
        assert_eq!(fp.num_rows, 2);

        assert_eq!(
            texture_footprint(Format::BC1_UNORM, 6, 8, 1, None, None),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn footprint_undersized_pitch_rejected() {
        assert_eq!(
            texture_footprint(Format::R32_FLOAT, 4, 2, 1, Some(8), None),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn copy_repitches_rows() {
        let src_fp = texture_footprint(Format::R8_UNORM, 4, 2, 1, None, None).unwrap();
        let dst_fp = texture_footprint(Format::R8_UNORM, 4, 2, 1, Some(8), None).unwrap();

        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = [0u8; 16];
        copy_texture_data(&mut dst, &dst_fp, &src, &src_fp, 2, 1).unwrap();

        assert_eq!(&dst[0..4], &[1, 2, 3, 4]);
        assert_eq!(&dst[8..12], &[5, 6, 7, 8]);
    }
}
