//! Default decoder: EXIF-aware decode, contain-fit on a white mat, and
//! Floyd-Steinberg dithering to the 7-colour ACeP palette.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use image::imageops::{self, ColorMap, FilterType};
use image::{Rgb, RgbImage};
use tracing::debug;

use crate::error::DecodeError;
use crate::tasks::converter::{Decoder, PanelSpec, Rendering};

/// Colours the panel can physically show, in controller index order.
pub const ACEP_PALETTE: [Rgb<u8>; 7] = [
    Rgb([0, 0, 0]),
    Rgb([255, 255, 255]),
    Rgb([0, 255, 0]),
    Rgb([0, 0, 255]),
    Rgb([255, 0, 0]),
    Rgb([255, 255, 0]),
    Rgb([255, 128, 0]),
];

const MAT: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Debug, Clone, Copy, Default)]
pub struct PanelDecoder;

impl Decoder for PanelDecoder {
    fn decode(&self, source: &Path, panel: PanelSpec) -> Result<Rendering, DecodeError> {
        let oriented = decode_oriented(source)?;
        let mut framed = contain_on_mat(&oriented, panel);
        imageops::dither(&mut framed, &AcepPalette);
        Ok(Rendering::from_image(framed))
    }
}

struct AcepPalette;

impl ColorMap for AcepPalette {
    type Color = Rgb<u8>;

    fn index_of(&self, color: &Rgb<u8>) -> usize {
        nearest_index(color)
    }

    fn lookup(&self, index: usize) -> Option<Rgb<u8>> {
        ACEP_PALETTE.get(index).copied()
    }

    fn has_lookup(&self) -> bool {
        true
    }

    fn map_color(&self, color: &mut Rgb<u8>) {
        *color = ACEP_PALETTE[nearest_index(color)];
    }
}

fn nearest_index(color: &Rgb<u8>) -> usize {
    let distance = |candidate: &Rgb<u8>| -> u32 {
        color
            .0
            .iter()
            .zip(candidate.0.iter())
            .map(|(a, b)| {
                let d = i32::from(*a) - i32::from(*b);
                (d * d) as u32
            })
            .sum()
    };
    ACEP_PALETTE
        .iter()
        .enumerate()
        .min_by_key(|(_, candidate)| distance(candidate))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

fn decode_oriented(path: &Path) -> Result<RgbImage, DecodeError> {
    let img = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?
        .to_rgb8();

    Ok(match read_orientation(path).unwrap_or(1) {
        2 => imageops::flip_horizontal(&img),
        3 => imageops::rotate180(&img),
        4 => imageops::flip_vertical(&img),
        5 => imageops::flip_horizontal(&imageops::rotate90(&img)),
        6 => imageops::rotate90(&img),
        7 => imageops::flip_horizontal(&imageops::rotate270(&img)),
        8 => imageops::rotate270(&img),
        _ => img,
    })
}

fn read_orientation(path: &Path) -> Option<u32> {
    let file = File::open(path).ok()?;
    let exif = exif::Reader::new()
        .read_from_container(&mut BufReader::new(file))
        .ok()?;
    let orientation = exif
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)?
        .value
        .get_uint(0)?;
    debug!(path = %path.display(), orientation, "exif orientation");
    Some(orientation)
}

/// Largest size with the source aspect ratio that fits inside the panel.
fn fitted_size(width: u32, height: u32, panel: PanelSpec) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (panel.width, panel.height);
    }
    let scale = f64::min(
        f64::from(panel.width) / f64::from(width),
        f64::from(panel.height) / f64::from(height),
    );
    let w = (f64::from(width) * scale).round() as u32;
    let h = (f64::from(height) * scale).round() as u32;
    (w.clamp(1, panel.width), h.clamp(1, panel.height))
}

fn contain_on_mat(img: &RgbImage, panel: PanelSpec) -> RgbImage {
    let (w, h) = fitted_size(img.width(), img.height(), panel);
    let resized = if (w, h) == img.dimensions() {
        img.clone()
    } else {
        imageops::resize(img, w, h, FilterType::Triangle)
    };
    let mut canvas = RgbImage::from_pixel(panel.width, panel.height, MAT);
    let x = i64::from((panel.width - w) / 2);
    let y = i64::from((panel.height - h) / 2);
    imageops::overlay(&mut canvas, &resized, x, y);
    canvas
}
