use std::borrow::Cow;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::capture::frame::PixelFormat;
use crate::error::SinkError;

pub const DEFAULT_QUALITY: u8 = 85;

/// Encode a 24-bit frame as a baseline JPEG. `stride` is the length of one
/// source row in bytes and may include padding past `width * 3`.
pub fn encode_frame(
    data: &[u8],
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    quality: u8,
) -> Result<Vec<u8>, SinkError> {
    // Already intraframe-compressed
    if format == PixelFormat::Mjpeg {
        return Ok(data.to_vec());
    }

    let row = width as usize * 3;
    let stride = (stride as usize).max(row);
    let expected = row * height as usize;
    let needed = match height as usize {
        0 => 0,
        h => stride * (h - 1) + row,
    };
    if data.len() < needed {
        return Err(SinkError::Encode(format!(
            "{}x{} {} frame with stride {} needs {} bytes, got {}",
            width,
            height,
            format,
            stride,
            needed,
            data.len()
        )));
    }

    let mut pixels = if stride == row {
        Cow::Borrowed(&data[..expected])
    } else {
        Cow::Owned(
            data.chunks(stride)
                .take(height as usize)
                .flat_map(|line| &line[..row])
                .copied()
                .collect(),
        )
    };
    if format == PixelFormat::Bgr24 {
        for px in pixels.to_mut().chunks_exact_mut(3) {
            px.swap(0, 2);
        }
    }

    let mut out = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(&pixels, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| SinkError::Encode(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_rgb_to_jpeg() {
        let rgb = vec![128u8; 16 * 8 * 3];
        let jpeg = encode_frame(&rgb, 16, 8, 16 * 3, PixelFormat::Rgb24, DEFAULT_QUALITY).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn rejects_short_buffers() {
        let rgb = vec![0u8; 10];
        assert!(matches!(
            encode_frame(&rgb, 16, 8, 16 * 3, PixelFormat::Bgr24, DEFAULT_QUALITY),
            Err(SinkError::Encode(_))
        ));
    }

    #[test]
    fn padded_rows_are_repacked() {
        // 5 pixels wide: 15 bytes of pixels, rows padded to 16
        let (width, height, stride) = (5u32, 4u32, 16usize);
        let mut padded = Vec::new();
        let mut packed = Vec::new();
        for y in 0..height as usize {
            let line: Vec<u8> = (0..15).map(|x| (y * 60 + x * 4) as u8).collect();
            packed.extend_from_slice(&line);
            padded.extend_from_slice(&line);
            padded.push(0xEE);
        }

        let from_padded =
            encode_frame(&padded, width, height, stride as u32, PixelFormat::Rgb24, DEFAULT_QUALITY).unwrap();
        let from_packed =
            encode_frame(&packed, width, height, width * 3, PixelFormat::Rgb24, DEFAULT_QUALITY).unwrap();
        assert_eq!(from_padded, from_packed);

        // The last row needs no padding after it
        padded.pop();
        assert!(encode_frame(&padded, width, height, stride as u32, PixelFormat::Rgb24, DEFAULT_QUALITY).is_ok());
    }
}
