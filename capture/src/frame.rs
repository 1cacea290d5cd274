//! Raw YUV420p frame helpers: overlay painting and RGB conversion for stills.

use anyhow::{bail, Result};
use image::RgbImage;

/// Height in rows of the status band painted over the top of each frame.
pub const BAND_ROWS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// Parse `#rgb` or `#rrggbb`.
    pub fn parse_hex(s: &str) -> Result<Self> {
        let hex = s.trim().trim_start_matches('#');
        if !hex.is_ascii() {
            bail!("Not a hex color: {s}");
        }
        let digits: Vec<u8> = match hex.len() {
            3 => hex
                .chars()
                .map(|c| c.to_digit(16).map(|d| (d * 17) as u8))
                .collect::<Option<_>>()
                .unwrap_or_default(),
            6 => (0..3)
                .filter_map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok())
                .collect(),
            _ => Vec::new(),
        };
        if digits.len() != 3 {
            bail!("Not a hex color: {s}");
        }
        Ok(Self(digits[0], digits[1], digits[2]))
    }

    /// BT.601 full-range conversion.
    pub fn to_yuv(self) -> (u8, u8, u8) {
        let (r, g, b) = (self.0 as f32, self.1 as f32, self.2 as f32);
        let y = 0.299 * r + 0.587 * g + 0.114 * b;
        let u = -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
        let v = 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
        (clamp(y), clamp(u), clamp(v))
    }
}

fn clamp(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Overwrite the top `rows` rows of a YUV420p frame with a solid color.
///
/// Frames of the wrong length are left untouched.
pub fn paint_band(frame: &mut [u8], width: u32, height: u32, color: Rgb, rows: u32) {
    let (w, h) = (width as usize, height as usize);
    let luma = w * h;
    if frame.len() != luma + luma / 2 {
        return;
    }
    let rows = (rows.min(height) as usize + 1) & !1;
    let rows = rows.min(h);
    let (y, u, v) = color.to_yuv();

    frame[..rows * w].fill(y);

    let (cw, chroma_rows) = (w / 2, rows / 2);
    let u_start = luma;
    let v_start = luma + luma / 4;
    frame[u_start..u_start + chroma_rows * cw].fill(u);
    frame[v_start..v_start + chroma_rows * cw].fill(v);
}

/// Convert a YUV420p frame to an RGB image (BT.601 full range).
pub fn yuv420_to_rgb(frame: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let (w, h) = (width as usize, height as usize);
    let luma = w * h;
    if frame.len() != luma + luma / 2 {
        bail!(
            "Frame is {} bytes, expected {} for {width}x{height}",
            frame.len(),
            luma + luma / 2
        );
    }
    let (y_plane, chroma) = frame.split_at(luma);
    let (u_plane, v_plane) = chroma.split_at(luma / 4);
    let cw = w / 2;

    Ok(RgbImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let c = (y / 2) * cw + x / 2;
        let yy = y_plane[y * w + x] as f32;
        let u = u_plane[c] as f32 - 128.0;
        let v = v_plane[c] as f32 - 128.0;
        image::Rgb([
            clamp(yy + 1.402 * v),
            clamp(yy - 0.344_136 * u - 0.714_136 * v),
            clamp(yy + 1.772 * u),
        ])
    }))
}
