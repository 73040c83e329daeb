//! Screenshot encoding helpers.

use crate::prelude::*;

use std::io::BufWriter;
use std::path::Path;

/// Row stride aligned to the 256-byte copy rule.
pub fn padded_bytes_per_row(width: u32) -> u32 {
  let unpadded = width * 4;
  let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
  unpadded.div_ceil(align) * align
}

/// Strips the row padding a texture-to-buffer copy introduced.
pub fn unpad_rows(padded: &[u8], padded_bytes_per_row: usize, width: u32, height: u32) -> Vec<u8> {
  let row = width as usize * 4;
  let mut out = Vec::with_capacity(row * height as usize);
  for y in 0..height as usize {
    let start = y * padded_bytes_per_row;
    out.extend_from_slice(&padded[start..start + row]);
  }
  out
}

pub fn is_bgra(format: wgpu::TextureFormat) -> bool {
  matches!(
    format,
    wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb
  )
}

/// In-place BGRA → RGBA swizzle.
pub fn bgra_to_rgba(pixels: &mut [u8]) {
  for pixel in pixels.chunks_exact_mut(4) {
    pixel.swap(0, 2);
  }
}

/// Writes RGBA8 pixels as a PNG file.
pub fn write_png(path: &Path, width: u32, height: u32, rgba: &[u8]) -> AnyResult<()> {
  let file = std::fs::File::create(path)?;
  let writer = BufWriter::new(file);

  let mut encoder = png::Encoder::new(writer, width, height);
  encoder.set_color(png::ColorType::Rgba);
  encoder.set_depth(png::BitDepth::Eight);
  let mut writer = encoder
    .write_header()
    .map_err(|e| TheErr::Gpu(format!("PNG encode failed: {e}")))?;
  writer
    .write_image_data(rgba)
    .map_err(|e| TheErr::Gpu(format!("PNG encode failed: {e}")))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn padded_rows_follow_the_alignment_rule() {
    assert_eq!(padded_bytes_per_row(64), 256);
    assert_eq!(padded_bytes_per_row(1), 256);
    assert_eq!(padded_bytes_per_row(800), 3328);
    assert_eq!(padded_bytes_per_row(64) % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT, 0);
  }

  #[test]
  fn unpad_strips_per_row_padding() {
    // 2x2 image, 12-byte padded rows (8 bytes of pixels + 4 padding).
    let padded = vec![
      1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0, //
      9, 10, 11, 12, 13, 14, 15, 16, 0, 0, 0, 0,
    ];
    let out = unpad_rows(&padded, 12, 2, 2);
    assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
  }

  #[test]
  fn swizzle_swaps_red_and_blue() {
    let mut pixels = vec![10, 20, 30, 40, 50, 60, 70, 80];
    bgra_to_rgba(&mut pixels);
    assert_eq!(pixels, vec![30, 20, 10, 40, 70, 60, 50, 80]);
  }

  #[test]
  fn png_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shot.png");

    let rgba: Vec<u8> = vec![128, 51, 204, 255].repeat(4);
    write_png(&path, 2, 2, &rgba).unwrap();

    let decoder = png::Decoder::new(std::fs::File::open(&path).unwrap());
    let mut reader = decoder.read_info().unwrap();
    let mut buf = vec![0u8; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf).unwrap();
    assert_eq!(info.width, 2);
    assert_eq!(info.height, 2);
    assert_eq!(&buf[..4], &[128, 51, 204, 255]);
  }
}
