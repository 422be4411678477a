//! File collaborator of the deconvolution core: ImageJ hyperstack TIFF files for the
//! acquisitions and CSV / `.npy` files for the point spread functions.

use crate::data_container::{ImageMetadata, Resolution};
use crate::error::{DeconError, Result};
use crate::filters::psf::PsfDescriptor;
use csv::{ReaderBuilder, Trim};
use ndarray::{Array2, ArrayD, Ix3, IxDyn};
use ndarray_npy::{read_npy, ReadNpyError};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tiff::decoder::ifd::Value;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, Rational, TiffEncoder};
use tiff::tags::{ResolutionUnit, Tag};

/// Denominator used when storing resolutions as TIFF rationals.
const RESOLUTION_DENOMINATOR: u32 = 1_000;

/// An acquisition as read from disk.
#[derive(Clone, Debug)]
pub struct Hyperstack {
    /// Pixel data with singleton `T`, `Z` and `C` axes squeezed out, always ending in `(Y, X)`.
    pub data: ArrayD<f32>,
    pub metadata: ImageMetadata,
    pub resolution: Option<Resolution>,
}

fn page_to_f32(page: DecodingResult) -> Vec<f32> {
    match page {
        DecodingResult::U8(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U16(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I16(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::F32(data) => data,
        DecodingResult::F64(data) => data.into_iter().map(|v| v as f32).collect(),
    }
}

fn rational_to_f64(value: Option<Value>) -> Option<f64> {
    match value {
        Some(Value::Rational(n, d)) if d != 0 => Some(n as f64 / d as f64),
        _ => None,
    }
}

fn to_rational(value: f64) -> Rational {
    Rational {
        n: (value * RESOLUTION_DENOMINATOR as f64).round().clamp(0.0, u32::MAX as f64) as u32,
        d: RESOLUTION_DENOMINATOR,
    }
}

/// Reads a multi-page grayscale TIFF.
///
/// The ImageJ description of the first page decides the layout: pages are stored with the
/// channel index running fastest, then the slice, then the frame. Without a description, the
/// pages are treated as z-slices of a single volume.
///
/// # Errors
/// `UnsupportedFormat` for non-grayscale pages, pages of different size or a description that
/// does not match the number of pages.
pub fn read_hyperstack(path: &Path) -> Result<Hyperstack> {
    let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;

    let description = match decoder.find_tag(Tag::ImageDescription)? {
        Some(Value::Ascii(text)) => Some(text),
        _ => None,
    };
    let x_resolution = rational_to_f64(decoder.find_tag(Tag::XResolution)?);
    let y_resolution = rational_to_f64(decoder.find_tag(Tag::YResolution)?);
    let resolution = x_resolution
        .zip(y_resolution)
        .map(|(x, y)| Resolution { x, y });

    let (width, height) = decoder.dimensions()?;
    let mut pixels: Vec<f32> = Vec::new();
    let mut pages = 0usize;
    loop {
        if decoder.dimensions()? != (width, height) {
            return Err(DeconError::UnsupportedFormat(format!(
                "page {pages} of {path:?} is not {width}x{height}"
            )));
        }
        match decoder.colortype()? {
            tiff::ColorType::Gray(_) => {}
            other => {
                return Err(DeconError::UnsupportedFormat(format!(
                    "only grayscale pages are supported, found {other:?}"
                )))
            }
        }
        pixels.extend(page_to_f32(decoder.read_image()?));
        pages += 1;
        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }

    let metadata = match description
        .as_deref()
        .and_then(ImageMetadata::from_imagej_description)
    {
        Some(metadata) => {
            let stacked = metadata.frames * metadata.slices * metadata.channels;
            if stacked != pages {
                return Err(DeconError::UnsupportedFormat(format!(
                    "ImageJ description announces {} frames x {} slices x {} channels, file has {pages} pages",
                    metadata.frames, metadata.slices, metadata.channels
                )));
            }
            metadata
        }
        None => ImageMetadata {
            images: pages,
            slices: pages,
            ..ImageMetadata::default()
        },
    };

    let mut shape: Vec<usize> = [metadata.frames, metadata.slices, metadata.channels]
        .into_iter()
        .filter(|n| *n > 1)
        .collect();
    shape.extend([height as usize, width as usize]);
    let data = ArrayD::from_shape_vec(IxDyn(&shape), pixels)
        .map_err(|err| DeconError::UnsupportedFormat(err.to_string()))?;

    log::info!(
        "read {path:?}: shape {:?}, spacing {} {}",
        data.shape(),
        metadata.spacing,
        metadata.unit
    );
    Ok(Hyperstack {
        data,
        metadata,
        resolution,
    })
}

/// Writes a volume ending in `(Y, X)` as a 16-bit ImageJ hyperstack.
///
/// The leading axes are flattened into pages in memory order, which must match the
/// `T, Z, C` page order announced by `metadata`.
pub fn write_hyperstack(
    path: &Path,
    volume: &ArrayD<u16>,
    metadata: &ImageMetadata,
    resolution: Option<Resolution>,
) -> Result<()> {
    let shape = volume.shape();
    if shape.len() < 2 {
        return Err(DeconError::ShapeMismatch(format!(
            "cannot write a volume of shape {shape:?} as images"
        )));
    }
    let (height, width) = (shape[shape.len() - 2], shape[shape.len() - 1]);
    let page_len = height * width;
    if page_len == 0 {
        return Err(DeconError::ShapeMismatch(format!(
            "cannot write empty images of shape {shape:?}"
        )));
    }
    let pages = volume.len() / page_len;
    if metadata.frames * metadata.slices * metadata.channels != pages {
        return Err(DeconError::ShapeMismatch(format!(
            "metadata describes {} frames x {} slices x {} channels, volume holds {pages} pages",
            metadata.frames, metadata.slices, metadata.channels
        )));
    }

    let contiguous = volume.as_standard_layout();
    let data = contiguous
        .as_slice()
        .ok_or_else(|| DeconError::ShapeMismatch("volume is not contiguous".to_string()))?;
    let description = metadata.to_imagej_description();

    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    for (index, page) in data.chunks(page_len).enumerate() {
        let mut image = encoder.new_image::<colortype::Gray16>(width as u32, height as u32)?;
        if index == 0 {
            image
                .encoder()
                .write_tag(Tag::ImageDescription, description.as_str())?;
        }
        if let Some(resolution) = resolution {
            image.resolution_unit(ResolutionUnit::None);
            image.x_resolution(to_rational(resolution.x));
            image.y_resolution(to_rational(resolution.y));
        }
        image.write_data(page)?;
    }
    log::info!("wrote {pages} page(s) to {path:?}");
    Ok(())
}

/// Reads the PSF descriptor of one channel.
///
/// * `.csv`: comma separated 3×3 covariance matrix without header.
/// * `.npy`: either a 3×3 covariance matrix or a precomputed 3D kernel.
pub fn read_psf(path: &Path) -> Result<PsfDescriptor> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("csv") => read_psf_csv(path),
        Some("npy") => read_psf_npy(path),
        _ => Err(DeconError::UnsupportedFormat(format!(
            "PSF files must be .csv or .npy, got {path:?}"
        ))),
    }
}

fn read_psf_csv(path: &Path) -> Result<PsfDescriptor> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .trim(Trim::All)
        .from_path(path)?;

    let mut values = Vec::with_capacity(9);
    let mut rows = 0;
    for record in reader.records() {
        let record = record?;
        for field in record.iter() {
            let value = field.parse::<f64>().map_err(|err| {
                DeconError::InvalidPsfParameters(format!("{path:?}: '{field}' is not a number ({err})"))
            })?;
            values.push(value);
        }
        rows += 1;
    }
    if rows != 3 || values.len() != 9 {
        return Err(DeconError::InvalidPsfParameters(format!(
            "{path:?} must hold a 3x3 matrix, found {} values in {rows} rows",
            values.len()
        )));
    }
    let matrix = Array2::from_shape_vec((3, 3), values)
        .map_err(|err| DeconError::InvalidPsfParameters(err.to_string()))?;
    log::debug!("PSF covariance from {path:?}: {matrix:?}");
    Ok(PsfDescriptor::Covariance(matrix))
}

fn read_psf_npy(path: &Path) -> Result<PsfDescriptor> {
    let array: ArrayD<f64> = match read_npy::<_, ArrayD<f32>>(path) {
        Ok(array) => array.mapv(f64::from),
        Err(ReadNpyError::WrongDescriptor(_)) => read_npy(path)?,
        Err(err) => return Err(err.into()),
    };
    let shape = array.shape().to_vec();
    match shape.as_slice() {
        [3, 3] => Ok(PsfDescriptor::Covariance(
            array
                .into_dimensionality()
                .map_err(|err| DeconError::InvalidPsfParameters(err.to_string()))?,
        )),
        [_, _, _] => Ok(PsfDescriptor::Kernel(
            array
                .mapv(|v| v as f32)
                .into_dimensionality::<Ix3>()
                .map_err(|err| DeconError::ShapeMismatch(err.to_string()))?,
        )),
        other => Err(DeconError::InvalidPsfParameters(format!(
            "{path:?} holds an array of shape {other:?}, expected 3x3 or a 3D kernel"
        ))),
    }
}

/// Output file for `input` restored with `iterations` iterations and `pad_amount` padding,
/// placed next to the input.
pub fn output_path(input: &Path, iterations: usize, pad_amount: usize) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{stem}_decon_rl{iterations}_pad{pad_amount}.tif"))
}
