use image::imageops::{self, FilterType};
use image::GrayImage;

use crate::{FRAME_HEIGHT, FRAME_WIDTH};

// =============================================================================
// Raw Frames
// =============================================================================

/// One grayscale screen capture at simulator resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl RawFrame {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }

    pub fn from_pixels(width: usize, height: usize, pixels: Vec<u8>) -> Self {
        assert_eq!(pixels.len(), width * height, "pixel count must match dims");
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Writable view used by simulators to capture in place.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }
}

/// The two most recent raw captures, indexed by a toggling parity bit.
pub struct FrameRingBuffer {
    frames: [RawFrame; 2],
    latest: usize,
    captures: u64,
}

impl FrameRingBuffer {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            frames: [RawFrame::new(width, height), RawFrame::new(width, height)],
            latest: 1,
            captures: 0,
        }
    }

    /// Capture into the older slot, which then becomes the latest.
    pub fn capture_with<E>(
        &mut self,
        capture: impl FnOnce(&mut RawFrame) -> Result<(), E>,
    ) -> Result<(), E> {
        let slot = self.latest ^ 1;
        capture(&mut self.frames[slot])?;
        self.latest = slot;
        self.captures += 1;
        Ok(())
    }

    pub fn current(&self) -> &RawFrame {
        &self.frames[self.latest]
    }

    pub fn previous(&self) -> &RawFrame {
        &self.frames[self.latest ^ 1]
    }

    /// Captures since the last `clear`.
    pub fn captures(&self) -> u64 {
        self.captures
    }

    pub fn is_ready(&self) -> bool {
        self.captures >= 2
    }

    pub fn clear(&mut self) {
        self.captures = 0;
    }
}

// =============================================================================
// Preprocessing
// =============================================================================

/// Flicker-corrected, downsampled observation (`FRAME_HEIGHT` x `FRAME_WIDTH`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessedFrame {
    pixels: Box<[u8]>,
}

impl PreprocessedFrame {
    pub const LEN: usize = FRAME_WIDTH * FRAME_HEIGHT;

    pub fn blank() -> Self {
        Self {
            pixels: vec![0; Self::LEN].into_boxed_slice(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * FRAME_WIDTH + x]
    }
}

impl PreprocessedFrame {
    /// Overwrite with `other`'s pixels, keeping this frame's allocation.
    pub fn copy_from(&mut self, other: &PreprocessedFrame) {
        self.pixels.copy_from_slice(&other.pixels);
    }
}

/// Reusable scratch for [`preprocess`]: the merged full-resolution image
/// survives between calls.
pub struct Preprocessor {
    merged: GrayImage,
}

impl Preprocessor {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            merged: GrayImage::new(width as u32, height as u32),
        }
    }

    /// Pixelwise max of the two latest captures, rescaled with a triangle
    /// filter into `out`.
    pub fn apply(&mut self, buffer: &FrameRingBuffer, out: &mut PreprocessedFrame) {
        debug_assert!(
            buffer.is_ready(),
            "preprocess needs two captures, have {}",
            buffer.captures()
        );
        let current = buffer.current();
        let previous = buffer.previous();
        let dims = (current.width as u32, current.height as u32);
        if self.merged.dimensions() != dims {
            self.merged = GrayImage::new(dims.0, dims.1);
        }
        let merged: &mut [u8] = &mut self.merged;
        for ((dst, &a), &b) in merged.iter_mut().zip(&current.pixels).zip(&previous.pixels) {
            *dst = a.max(b);
        }

        let resized = imageops::resize(
            &self.merged,
            FRAME_WIDTH as u32,
            FRAME_HEIGHT as u32,
            FilterType::Triangle,
        );
        out.pixels.copy_from_slice(resized.as_raw());
    }
}

/// One-shot [`Preprocessor::apply`] into a fresh frame.
pub fn preprocess(buffer: &FrameRingBuffer) -> PreprocessedFrame {
    let current = buffer.current();
    let mut out = PreprocessedFrame::blank();
    Preprocessor::new(current.width, current.height).apply(buffer, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(first: RawFrame, second: RawFrame) -> FrameRingBuffer {
        let mut buf = FrameRingBuffer::new(first.width(), first.height());
        buf.capture_with(|f| -> Result<(), ()> {
            *f = first;
            Ok(())
        })
        .unwrap();
        buf.capture_with(|f| -> Result<(), ()> {
            *f = second;
            Ok(())
        })
        .unwrap();
        buf
    }

    fn constant(value: u8) -> RawFrame {
        RawFrame::from_pixels(160, 210, vec![value; 160 * 210])
    }

    #[test]
    fn ring_buffer_toggles_parity() {
        let mut buf = FrameRingBuffer::new(2, 1);
        for v in 1..=3u8 {
            buf.capture_with(|f| -> Result<(), ()> {
                f.pixels_mut().fill(v);
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(buf.current().pixels(), &[3, 3]);
        assert_eq!(buf.previous().pixels(), &[2, 2]);
        assert_eq!(buf.captures(), 3);
        buf.clear();
        assert!(!buf.is_ready());
    }

    #[test]
    fn failed_capture_keeps_latest() {
        let mut buf = FrameRingBuffer::new(1, 1);
        buf.capture_with(|f| -> Result<(), ()> {
            f.pixels_mut()[0] = 9;
            Ok(())
        })
        .unwrap();
        assert!(buf.capture_with(|_| Err("boom")).is_err());
        assert_eq!(buf.current().pixels(), &[9]);
        assert_eq!(buf.captures(), 1);
    }

    #[test]
    fn constant_frames_stay_constant() {
        let out = preprocess(&buffer_with(constant(40), constant(200)));
        assert_eq!(out.pixels().len(), PreprocessedFrame::LEN);
        assert!(out.pixels().iter().all(|&p| p == 200));
    }

    #[test]
    fn max_removes_flicker() {
        // Left half lit in one frame, right half in the other.
        let (w, h) = (160, 210);
        let left: Vec<u8> = (0..w * h).map(|i| if i % w < w / 2 { 255 } else { 0 }).collect();
        let right: Vec<u8> = (0..w * h).map(|i| if i % w < w / 2 { 0 } else { 255 }).collect();
        let out = preprocess(&buffer_with(
            RawFrame::from_pixels(w, h, left),
            RawFrame::from_pixels(w, h, right),
        ));
        assert!(out.pixels().iter().all(|&p| p == 255));
    }

    #[test]
    fn equals_resize_of_manual_max() {
        let (w, h) = (64, 48);
        let a: Vec<u8> = (0..w * h).map(|i| ((i * 37) % 251) as u8).collect();
        let b: Vec<u8> = (0..w * h).map(|i| ((i * 91 + 13) % 241) as u8).collect();
        let expected_src: Vec<u8> = a.iter().zip(&b).map(|(x, y)| *x.max(y)).collect();
        let expected = imageops::resize(
            &GrayImage::from_raw(w as u32, h as u32, expected_src).unwrap(),
            FRAME_WIDTH as u32,
            FRAME_HEIGHT as u32,
            FilterType::Triangle,
        )
        .into_raw();

        let buf = buffer_with(
            RawFrame::from_pixels(w, h, a.clone()),
            RawFrame::from_pixels(w, h, b.clone()),
        );
        let first = preprocess(&buf);
        assert_eq!(first.pixels(), expected.as_slice());

        // Order of the two captures does not matter, and repeats are bit-identical.
        let swapped = buffer_with(RawFrame::from_pixels(w, h, b), RawFrame::from_pixels(w, h, a));
        assert_eq!(preprocess(&swapped), first);
        assert_eq!(preprocess(&buf), first);
    }

    #[test]
    fn preprocessor_reuses_scratch_across_sizes() {
        let mut pre = Preprocessor::new(8, 8);
        let mut out = PreprocessedFrame::blank();
        pre.apply(&buffer_with(constant(10), constant(90)), &mut out);
        assert!(out.pixels().iter().all(|&p| p == 90));

        let mut copy = PreprocessedFrame::blank();
        copy.copy_from(&out);
        assert_eq!(copy, out);

        pre.apply(&buffer_with(constant(70), constant(30)), &mut out);
        assert!(out.pixels().iter().all(|&p| p == 70));
        assert_ne!(copy, out);
    }
}
