use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use image::{DynamicImage, ImageFormat, Luma, RgbImage, RgbaImage};

use crate::identify::{IdentifyError, ImageSource};
use crate::pacer::ChatTransport;

#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl RecordingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, text)| text).collect()
    }

    pub(crate) fn count(&self) -> usize {
        self.sent.lock().map(|rows| rows.len()).unwrap_or_default()
    }
}

impl ChatTransport for RecordingTransport {
    fn send_message(&self, channel_id: &str, content: &str) -> anyhow::Result<()> {
        if self.fail {
            bail!("transport offline");
        }
        if let Ok(mut rows) = self.sent.lock() {
            rows.push((channel_id.to_string(), content.to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MapImageSource {
    images: HashMap<String, Vec<u8>>,
}

impl MapImageSource {
    pub(crate) fn with(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.images.insert(url.to_string(), bytes);
        self
    }
}

impl ImageSource for MapImageSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, IdentifyError> {
        self.images
            .get(url)
            .cloned()
            .ok_or_else(|| IdentifyError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

const SIDE: u32 = 64;

fn grayscale(f: impl Fn(u32, u32) -> u8) -> RgbImage {
    let luma = image::ImageBuffer::from_fn(SIDE, SIDE, |x, y| Luma([f(x, y)]));
    DynamicImage::ImageLuma8(luma).to_rgb8()
}

/// White left half, black right half.
pub(crate) fn split_vertical() -> RgbImage {
    grayscale(|x, _| if x < SIDE / 2 { 255 } else { 0 })
}

/// White top half, black bottom half.
pub(crate) fn split_horizontal() -> RgbImage {
    grayscale(|_, y| if y < SIDE / 2 { 255 } else { 0 })
}

/// White above the main diagonal.
pub(crate) fn diagonal() -> RgbImage {
    grayscale(|x, y| if x > y { 255 } else { 0 })
}

pub(crate) fn solid(value: u8) -> RgbImage {
    grayscale(|_, _| value)
}

pub(crate) fn png_bytes(image: &RgbImage) -> Vec<u8> {
    encode_png(DynamicImage::ImageRgb8(image.clone()))
}

pub(crate) fn rgba_png_bytes(image: &RgbaImage) -> Vec<u8> {
    encode_png(DynamicImage::ImageRgba8(image.clone()))
}

fn encode_png(image: DynamicImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("png encoding of an in-memory image");
    bytes
}
