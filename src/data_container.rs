//! This module defines the data structures exchanged between the deconvolution core and the
//! file collaborator: the acquisition metadata record, the per-run batch context and the
//! integer representation volumes are cast to before they are persisted.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Represents the ImageJ hyperstack metadata associated with an acquisition.
///
/// # Fields
/// - `images`: Total number of 2D planes stored in the file.
/// - `channels`: Number of channels (1 or 2 for the supported acquisitions).
/// - `slices`: Number of z-slices per timepoint.
/// - `frames`: Number of timepoints.
/// - `hyperstack`: Whether ImageJ should open the file as a hyperstack.
/// - `unit`: Physical unit of the spacing values.
/// - `spacing`: Distance between z-slices in `unit`.
/// - `looping`: ImageJ animation flag, persisted unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub images: usize,
    pub channels: usize,
    pub slices: usize,
    pub frames: usize,
    pub hyperstack: bool,
    pub unit: String,
    pub spacing: f64,
    pub looping: bool,
}

impl Default for ImageMetadata {
    fn default() -> Self {
        ImageMetadata {
            images: 1,
            channels: 1,
            slices: 1,
            frames: 1,
            hyperstack: true,
            unit: "micron".to_string(),
            spacing: 1.0,
            looping: false,
        }
    }
}

impl ImageMetadata {
    /// Refreshes the channel count and the derived plane count after a batch run.
    pub fn set_channels(&mut self, channels: usize) {
        self.channels = channels;
        self.images = self.channels * self.slices * self.frames;
    }

    /// Parses an ImageJ `ImageDescription` string (`key=value` per line).
    ///
    /// Returns `None` when the description was not written by ImageJ. Unknown keys are
    /// ignored and missing ones keep their defaults.
    pub fn from_imagej_description(description: &str) -> Option<ImageMetadata> {
        if !description.starts_with("ImageJ=") {
            return None;
        }
        let mut md = ImageMetadata {
            hyperstack: false,
            ..ImageMetadata::default()
        };
        for line in description.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "images" => md.images = value.parse().unwrap_or(md.images),
                "channels" => md.channels = value.parse().unwrap_or(md.channels),
                "slices" => md.slices = value.parse().unwrap_or(md.slices),
                "frames" => md.frames = value.parse().unwrap_or(md.frames),
                "hyperstack" => md.hyperstack = value == "true",
                "unit" => md.unit = value.to_string(),
                "spacing" => md.spacing = value.parse().unwrap_or(md.spacing),
                "loop" => md.looping = value == "true",
                _ => {}
            }
        }
        Some(md)
    }

    pub fn to_imagej_description(&self) -> String {
        let mut description = format!("ImageJ=1.11a\nimages={}\n", self.images);
        if self.channels > 1 {
            description.push_str(&format!("channels={}\n", self.channels));
        }
        if self.slices > 1 {
            description.push_str(&format!("slices={}\n", self.slices));
        }
        if self.frames > 1 {
            description.push_str(&format!("frames={}\n", self.frames));
        }
        if self.hyperstack {
            description.push_str("hyperstack=true\n");
        }
        description.push_str(&format!(
            "unit={}\nspacing={}\nloop={}\n",
            self.unit, self.spacing, self.looping
        ));
        description
    }
}

/// Per-run facts that shape the batch: how many kernels are synthesized and how the
/// channel axis of the output is laid out.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchContext {
    pub channel_count: usize,
    /// Micron per voxel along z.
    pub z_spacing: f64,
}

/// Pixel density written into the TIFF resolution tags (pixels per unit).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Resolution {
    pub x: f64,
    pub y: f64,
}

/// Casts a restored volume to the unsigned 16-bit range of the source counts.
///
/// Values are clamped to `[0, 65535]` and truncated, so infinities saturate. NaN becomes 0.
pub fn to_u16_volume(volume: &ArrayD<f32>) -> ArrayD<u16> {
    volume.mapv(|v| {
        if v.is_nan() {
            0
        } else {
            v.clamp(0.0, u16::MAX as f32) as u16
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn imagej_description_round_trip() {
        let md = ImageMetadata {
            images: 2 * 5 * 3,
            channels: 2,
            slices: 5,
            frames: 3,
            hyperstack: true,
            unit: "micron".to_string(),
            spacing: 0.25,
            looping: false,
        };
        let parsed = ImageMetadata::from_imagej_description(&md.to_imagej_description()).unwrap();
        assert_eq!(parsed, md);
    }

    #[test]
    fn foreign_description_is_rejected() {
        assert!(ImageMetadata::from_imagej_description("scanned with foo").is_none());
    }

    #[test]
    fn set_channels_updates_image_count() {
        let mut md = ImageMetadata {
            slices: 4,
            frames: 3,
            ..ImageMetadata::default()
        };
        md.set_channels(2);
        assert_eq!(md.channels, 2);
        assert_eq!(md.images, 24);
    }

    #[test]
    fn u16_cast_clamps_and_zeroes_nan() {
        let volume = arr1(&[
            -3.0f32,
            12.7,
            70000.0,
            f32::NAN,
            f32::INFINITY,
            f32::NEG_INFINITY,
        ])
        .into_dyn();
        let cast = to_u16_volume(&volume);
        assert_eq!(cast.as_slice().unwrap(), &[0, 12, u16::MAX, 0, u16::MAX, 0]);
    }
}
