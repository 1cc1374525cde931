//! TIFF access for a single image stack: probing, recompression and
//! read-back verification.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tiff::ColorType;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{Compression, DeflateLevel, TiffEncoder, colortype};
use tiff::tags::{Predictor, Tag};
use tracing::debug;

use super::invariant::FrameInvariantMetadata;
use super::metadata::{FrameVariantMetadata, is_frame_description};
use crate::error::{Error, IoResultExt, Result};

type StackDecoder = Decoder<BufReader<File>>;

/// A stack accepted for transcoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackProbe {
    pub path: PathBuf,
    pub pages: usize,
}

/// Decoded pixels of one frame.
#[derive(Debug, Clone, PartialEq)]
enum Pixels {
    U8(Vec<u8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
}

struct Frame {
    width: u32,
    height: u32,
    pixels: Pixels,
}

fn open(path: &Path) -> Result<StackDecoder> {
    let file = File::open(path).at(path)?;
    Decoder::new(BufReader::new(file)).map_err(|e| Error::tiff(path, e))
}

/// Check whether `path` is a multi-page grayscale stack with frame metadata.
///
/// Returns `None` for anything that is not, so the caller can leave it out.
pub fn probe(path: &Path) -> Result<Option<StackProbe>> {
    let mut decoder = match open(path) {
        Ok(decoder) => decoder,
        Err(Error::Tiff { source, .. }) => {
            debug!(path = %path.display(), error = %source, "Not a readable TIFF");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let grayscale = matches!(decoder.colortype(), Ok(ColorType::Gray(_)));
    let described = decoder
        .get_tag_ascii_string(Tag::ImageDescription)
        .map(|d| is_frame_description(&d))
        .unwrap_or(false);
    if !grayscale || !described {
        debug!(path = %path.display(), grayscale, described, "Not a frame stack");
        return Ok(None);
    }

    let mut pages = 1;
    while decoder.more_images() {
        if let Err(e) = decoder.next_image() {
            debug!(path = %path.display(), error = %e, "Unreadable page");
            return Ok(None);
        }
        pages += 1;
    }

    if pages < 2 {
        debug!(path = %path.display(), "Single page TIFF is not a frame stack");
        return Ok(None);
    }

    Ok(Some(StackProbe {
        path: path.to_path_buf(),
        pages,
    }))
}

/// Read the acquisition-wide metadata and first-frame row count from the
/// first page of `path`.
pub fn read_invariant(path: &Path) -> Result<(FrameInvariantMetadata, u32)> {
    let mut decoder = open(path)?;
    let missing = |tag: &str, e: tiff::TiffError| Error::InvalidStack {
        path: path.to_path_buf(),
        message: format!("first page lacks the {tag} tag: {e}"),
    };

    let software = decoder
        .get_tag_ascii_string(Tag::Software)
        .map_err(|e| missing("Software", e))?;
    let artist = decoder
        .get_tag_ascii_string(Tag::Artist)
        .map_err(|e| missing("Artist", e))?;
    let (_, rows) = decoder.dimensions().map_err(|e| Error::tiff(path, e))?;

    Ok((FrameInvariantMetadata::parse(path, &software, &artist)?, rows))
}

/// Rewrite `source` into `output` with lossless Deflate compression, reading
/// at most `batch_size` frames into memory at a time, and collect each
/// frame's metadata. The output carries pixels only.
pub fn recompress(
    source: &Path,
    output: &Path,
    pages: usize,
    batch_size: usize,
) -> Result<FrameVariantMetadata> {
    let batch_size = batch_size.max(1);
    let mut decoder = open(source)?;
    let mut metadata = FrameVariantMetadata::with_frames(pages);

    let file = File::create(output).at(output)?;
    let mut encoder = TiffEncoder::new(file)
        .map_err(|e| Error::tiff(output, e))?
        .with_compression(Compression::Deflate(DeflateLevel::Balanced))
        .with_predictor(Predictor::Horizontal);

    let mut index = 0;
    while index < pages {
        let end = (index + batch_size).min(pages);
        let mut batch = Vec::with_capacity(end - index);

        for frame in index..end {
            if frame > 0 {
                decoder.next_image().map_err(|e| Error::tiff(source, e))?;
            }
            let description = decoder
                .get_tag_ascii_string(Tag::ImageDescription)
                .map_err(|e| Error::tiff(source, e))?;
            metadata.record(source, frame, &description)?;
            batch.push(read_frame(&mut decoder, source)?);
        }

        for frame in &batch {
            write_frame(&mut encoder, output, frame)?;
        }
        debug!(stack = %source.display(), frames = end, pages, "Batch written");
        index = end;
    }

    Ok(metadata)
}

/// Re-read `source` and `output` side by side, one batch at a time, and
/// fail on the first frame whose pixels differ.
pub fn verify(source: &Path, output: &Path, pages: usize, batch_size: usize) -> Result<()> {
    let batch_size = batch_size.max(1);
    let mut original = open(source)?;
    let mut written = open(output)?;

    let mut index = 0;
    while index < pages {
        let end = (index + batch_size).min(pages);
        let mut expected = Vec::with_capacity(end - index);
        let mut actual = Vec::with_capacity(end - index);

        for frame in index..end {
            if frame > 0 {
                original.next_image().map_err(|e| Error::tiff(source, e))?;
                written.next_image().map_err(|_| Error::RecompressionMismatch {
                    stack: source.to_path_buf(),
                    frame,
                })?;
            }
            expected.push(read_frame(&mut original, source)?);
            actual.push(read_frame(&mut written, output)?);
        }

        for (offset, (want, got)) in expected.iter().zip(&actual).enumerate() {
            if want.pixels != got.pixels || (want.width, want.height) != (got.width, got.height) {
                return Err(Error::RecompressionMismatch {
                    stack: source.to_path_buf(),
                    frame: index + offset,
                });
            }
        }
        index = end;
    }

    if written.more_images() {
        return Err(Error::RecompressionMismatch {
            stack: source.to_path_buf(),
            frame: pages,
        });
    }
    Ok(())
}

fn read_frame(decoder: &mut StackDecoder, path: &Path) -> Result<Frame> {
    let (width, height) = decoder.dimensions().map_err(|e| Error::tiff(path, e))?;
    let pixels = match decoder.read_image().map_err(|e| Error::tiff(path, e))? {
        DecodingResult::U8(data) => Pixels::U8(data),
        DecodingResult::U16(data) => Pixels::U16(data),
        DecodingResult::I16(data) => Pixels::I16(data),
        _ => {
            return Err(Error::InvalidStack {
                path: path.to_path_buf(),
                message: "unsupported sample format; expected 8 or 16 bit grayscale".to_string(),
            });
        }
    };
    Ok(Frame {
        width,
        height,
        pixels,
    })
}

fn write_frame(encoder: &mut TiffEncoder<File>, path: &Path, frame: &Frame) -> Result<()> {
    let written = match &frame.pixels {
        Pixels::U8(data) => {
            encoder.write_image::<colortype::Gray8>(frame.width, frame.height, data)
        }
        Pixels::U16(data) => {
            encoder.write_image::<colortype::Gray16>(frame.width, frame.height, data)
        }
        Pixels::I16(data) => {
            encoder.write_image::<colortype::GrayI16>(frame.width, frame.height, data)
        }
    };
    written.map_err(|e| Error::tiff(path, e))
}
