use crate::HISTORY_LEN;
use crate::frame::PreprocessedFrame;

/// The `HISTORY_LEN` most recent observations, oldest first.
///
/// Backed by a fixed arena: pushing into a full window overwrites the oldest
/// slot and advances `head`, so no allocation happens per step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateWindow {
    slots: [PreprocessedFrame; HISTORY_LEN],
    head: usize,
    len: usize,
}

impl Default for StateWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl StateWindow {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| PreprocessedFrame::blank()),
            head: 0,
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    pub fn push(&mut self, frame: PreprocessedFrame) {
        if self.len < HISTORY_LEN {
            self.slots[(self.head + self.len) % HISTORY_LEN] = frame;
            self.len += 1;
        } else {
            self.slots[self.head] = frame;
            self.head = (self.head + 1) % HISTORY_LEN;
        }
    }

    /// Fill the next slot in place: the free one while filling, the oldest
    /// once full.
    pub fn push_with(&mut self, fill: impl FnOnce(&mut PreprocessedFrame)) {
        if self.len < HISTORY_LEN {
            fill(&mut self.slots[(self.head + self.len) % HISTORY_LEN]);
            self.len += 1;
        } else {
            fill(&mut self.slots[self.head]);
            self.head = (self.head + 1) % HISTORY_LEN;
        }
    }

    /// Become a copy of `other` without reallocating any frame.
    pub fn copy_from(&mut self, other: &StateWindow) {
        for (dst, src) in self.slots.iter_mut().zip(&other.slots) {
            dst.copy_from(src);
        }
        self.head = other.head;
        self.len = other.len;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == HISTORY_LEN
    }

    pub fn oldest(&self) -> Option<&PreprocessedFrame> {
        self.iter().next()
    }

    pub fn newest(&self) -> Option<&PreprocessedFrame> {
        self.iter().last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PreprocessedFrame> + '_ {
        (0..self.len).map(move |i| &self.slots[(self.head + i) % HISTORY_LEN])
    }

    /// Network input laid out as `[HISTORY_LEN, FRAME_HEIGHT, FRAME_WIDTH]`,
    /// scaled to `[0, 1]`.
    pub fn to_input(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(HISTORY_LEN * PreprocessedFrame::LEN);
        for frame in self.iter() {
            out.extend(frame.pixels().iter().map(|&p| p as f32 / 255.0));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameRingBuffer, preprocess};

    fn frame(value: u8) -> PreprocessedFrame {
        let mut buf = FrameRingBuffer::new(8, 8);
        for _ in 0..2 {
            buf.capture_with(|f| -> Result<(), ()> {
                f.pixels_mut().fill(value);
                Ok(())
            })
            .unwrap();
        }
        preprocess(&buf)
    }

    fn values(window: &StateWindow) -> Vec<u8> {
        window.iter().map(|f| f.get(0, 0)).collect()
    }

    #[test]
    fn fills_then_rotates() {
        let mut window = StateWindow::new();
        assert!(window.is_empty());
        for v in 1..=HISTORY_LEN as u8 {
            window.push(frame(v));
        }
        assert!(window.is_full());
        assert_eq!(values(&window), vec![1, 2, 3, 4]);

        for v in 5..=10u8 {
            window.push(frame(v));
            assert_eq!(window.len(), HISTORY_LEN);
            assert_eq!(window.newest().unwrap().get(0, 0), v);
            assert_eq!(window.oldest().unwrap().get(0, 0), v - 3);
        }
        assert_eq!(values(&window), vec![7, 8, 9, 10]);
    }

    #[test]
    fn clear_resets_order() {
        let mut window = StateWindow::new();
        for v in 0..6u8 {
            window.push(frame(v));
        }
        window.clear();
        assert_eq!(window.len(), 0);
        window.push(frame(42));
        assert_eq!(values(&window), vec![42]);
    }

    #[test]
    fn input_is_oldest_first_and_normalized() {
        let mut window = StateWindow::new();
        for v in [0u8, 51, 102, 255] {
            window.push(frame(v));
        }
        let input = window.to_input();
        assert_eq!(input.len(), HISTORY_LEN * PreprocessedFrame::LEN);
        assert_eq!(input[0], 0.0);
        assert_eq!(input[PreprocessedFrame::LEN], 0.2);
        assert_eq!(input[3 * PreprocessedFrame::LEN], 1.0);
    }

    #[test]
    fn copy_from_matches_source_order() {
        let mut source = StateWindow::new();
        for v in 1..=6u8 {
            source.push(frame(v));
        }
        let mut copy = StateWindow::new();
        copy.push(frame(99));
        copy.copy_from(&source);
        assert_eq!(copy, source);
        assert_eq!(values(&copy), vec![3, 4, 5, 6]);

        copy.push_with(|slot| slot.copy_from(&frame(7)));
        assert_eq!(values(&copy), vec![4, 5, 6, 7]);
        assert_eq!(values(&source), vec![3, 4, 5, 6]);
    }
}
