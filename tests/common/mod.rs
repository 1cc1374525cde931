//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::fs::{self, File};
use std::path::Path;

use tiff::encoder::{TiffEncoder, colortype};
use tiff::tags::Tag;

pub const WIDTH: u32 = 16;
pub const HEIGHT: u32 = 8;

pub const SOFTWARE: &str = "SI.hRoiManager.scanVolumeRate = 9.5\n\
    SI.hStackManager.actualNumSlices = 1\n\
    SI.hChannels.channelsActive = 1\n\
    SI.acqState = 'grab'";

pub const ARTIST: &str = r#"{"RoiGroups":{"imagingRoiGroup":{"rois":{"scanfields":{"pixelResolutionXY":[16,8],"centerXY":[0,0],"sizeXY":[1,1]}}}}}"#;

pub fn create_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Per-frame description block as written by the acquisition software.
pub fn frame_description(frame: usize, extra: &str) -> String {
    format!(
        "frameNumbers = {frame}\n\
         acquisitionNumbers = 1\n\
         frameNumberAcquisition = {frame}\n\
         frameTimestamps_sec = {:.6}\n\
         acqTriggerTimestamps_sec = -1.000000\n\
         nextFileMarkerTimestamps_sec = -1.000000\n\
         endOfAcquisition = 0\n\
         endOfAcquisitionMode = 0\n\
         dcOverVoltage = 0\n\
         epoch = [2024 3 1 12 30 5.250000]\n\
         auxTrigger0 = []\n\
         auxTrigger1 = []\n\
         auxTrigger2 = []\n\
         auxTrigger3 = []\n\
         I2CData = {{}}\n{extra}",
        frame as f64 * 0.1
    )
}

/// Deterministic pixels for the frame with global number `frame`.
pub fn frame_pixels(frame: usize) -> Vec<u16> {
    (0..(WIDTH * HEIGHT) as usize)
        .map(|i| ((frame * 131 + i * 7) % 65_521) as u16)
        .collect()
}

/// Write a 16 bit stack of `frames` pages whose frame numbers start at
/// `first_frame`. `extra` is appended to every description.
pub fn write_stack(path: &Path, first_frame: usize, frames: usize, extra: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut encoder = TiffEncoder::new(File::create(path).unwrap()).unwrap();
    for offset in 0..frames {
        let frame = first_frame + offset;
        let mut image = encoder.new_image::<colortype::Gray16>(WIDTH, HEIGHT).unwrap();
        image
            .encoder()
            .write_tag(Tag::ImageDescription, frame_description(frame, extra).as_str())
            .unwrap();
        if offset == 0 {
            image.encoder().write_tag(Tag::Software, SOFTWARE).unwrap();
            image.encoder().write_tag(Tag::Artist, ARTIST).unwrap();
        }
        image.write_data(&frame_pixels(frame)).unwrap();
    }
}

/// Write a described RGB stack, which discovery must leave out.
pub fn write_rgb_stack(path: &Path, frames: usize) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut encoder = TiffEncoder::new(File::create(path).unwrap()).unwrap();
    for frame in 1..=frames {
        let mut image = encoder.new_image::<colortype::RGB8>(WIDTH, HEIGHT).unwrap();
        image
            .encoder()
            .write_tag(Tag::ImageDescription, frame_description(frame, "").as_str())
            .unwrap();
        image
            .write_data(&vec![frame as u8; (WIDTH * HEIGHT * 3) as usize])
            .unwrap();
    }
}

/// Read every page of a 16 bit stack.
pub fn read_stack(path: &Path) -> Vec<Vec<u16>> {
    let mut decoder = tiff::decoder::Decoder::new(File::open(path).unwrap()).unwrap();
    let mut pages = Vec::new();
    loop {
        match decoder.read_image().unwrap() {
            tiff::decoder::DecodingResult::U16(data) => pages.push(data),
            _ => panic!("unexpected sample format"),
        }
        if !decoder.more_images() {
            break;
        }
        decoder.next_image().unwrap();
    }
    pages
}
