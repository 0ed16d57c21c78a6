/// PNG header inspection for captured snapshots

use crate::rendering::Screenshot;
use crate::{Error, Result};

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// Read `(width, height)` from the IHDR chunk of a PNG buffer.
pub fn png_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    // signature(8) + length(4) + "IHDR"(4) + width(4) + height(4)
    if data.len() < 24 || &data[0..8] != PNG_SIGNATURE || &data[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
    let height = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
    Some((width, height))
}

/// Wrap captured PNG bytes, checking they have the expected size.
pub fn screenshot_from_png(png_data: Vec<u8>, width: u32, height: u32) -> Result<Screenshot> {
    match png_dimensions(&png_data) {
        Some((w, h)) if w == width && h == height => Ok(Screenshot {
            width,
            height,
            png_data,
        }),
        Some((w, h)) => Err(Error::Render(format!(
            "captured {}x{} but expected {}x{}",
            w, h, width, height
        ))),
        None => Err(Error::Render("capture did not produce a PNG".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut enc = png::Encoder::new(&mut out, width, height);
            enc.set_color(png::ColorType::Rgba);
            enc.set_depth(png::BitDepth::Eight);
            let mut writer = enc.write_header().unwrap();
            writer
                .write_image_data(&vec![0u8; (width * height * 4) as usize])
                .unwrap();
        }
        out
    }

    #[test]
    fn reads_ihdr_dimensions() {
        let data = encode(7, 3);
        assert_eq!(png_dimensions(&data), Some((7, 3)));
        assert_eq!(png_dimensions(b"GIF89a...................."), None);
    }

    #[test]
    fn size_mismatch_is_an_error() {
        assert!(screenshot_from_png(encode(4, 4), 4, 4).is_ok());
        assert!(matches!(
            screenshot_from_png(encode(8, 4), 4, 4),
            Err(Error::Render(_))
        ));
        assert!(screenshot_from_png(vec![1, 2, 3], 4, 4).is_err());
    }
}
