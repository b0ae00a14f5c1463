//! 按采集时间戳切分分段窗口
//!
//! A window opens at the `capture_ts` of its first frame. A frame whose
//! `capture_ts - start >= duration` closes the window before it is added and
//! becomes the first frame of the next one, so every closed window holds
//! exactly the frames in `[start, start + duration)`.

use crate::detection::FrameMetadata;

/// A closed window, ready to be written as one segment.
#[derive(Clone, Debug, PartialEq)]
pub struct ClosedWindow {
    pub start_ts: f64,
    pub frames: Vec<FrameMetadata>,
}

#[derive(Debug)]
pub struct SegmentWindow {
    duration: f64,
    start_ts: Option<f64>,
    frames: Vec<FrameMetadata>,
}

impl SegmentWindow {
    pub fn new(duration_secs: f64) -> Self {
        Self {
            duration: duration_secs,
            start_ts: None,
            frames: Vec::new(),
        }
    }

    pub fn start_ts(&self) -> Option<f64> {
        self.start_ts
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Would a frame stamped `ts` close the open window?
    pub fn closes_at(&self, ts: f64) -> bool {
        self.start_ts.is_some_and(|start| ts - start >= self.duration)
    }

    /// Accumulate one frame; returns the window it closed, if any.
    pub fn push(&mut self, metadata: FrameMetadata) -> Option<ClosedWindow> {
        let closed = if self.closes_at(metadata.capture_ts) {
            self.flush()
        } else {
            None
        };
        if self.start_ts.is_none() {
            self.start_ts = Some(metadata.capture_ts);
        }
        self.frames.push(metadata);
        closed
    }

    /// Close whatever is open, even if the duration has not elapsed.
    pub fn flush(&mut self) -> Option<ClosedWindow> {
        let start_ts = self.start_ts.take()?;
        Some(ClosedWindow {
            start_ts,
            frames: std::mem::take(&mut self.frames),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(window: &mut SegmentWindow, stamps: &[f64]) -> Vec<ClosedWindow> {
        let mut closed: Vec<ClosedWindow> = stamps
            .iter()
            .filter_map(|ts| window.push(FrameMetadata::empty(*ts)))
            .collect();
        closed.extend(window.flush());
        closed
    }

    fn stamps(w: &ClosedWindow) -> Vec<f64> {
        w.frames.iter().map(|f| f.capture_ts).collect()
    }

    #[test]
    fn test_one_second_frames_two_second_windows() {
        let mut window = SegmentWindow::new(2.0);
        let ts: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let closed = feed(&mut window, &ts);

        assert_eq!(closed.len(), 5);
        for (i, w) in closed.iter().enumerate() {
            let first = (2 * i) as f64;
            assert_eq!(w.start_ts, first);
            assert_eq!(stamps(w), vec![first, first + 1.0]);
        }
        assert!(window.is_empty());
    }

    #[test]
    fn test_windows_are_half_open_and_partition() {
        let ts = [0.0, 0.4, 0.9, 1.49, 1.5, 1.6, 2.95, 3.0, 3.2, 4.49, 4.5, 7.0];
        let mut window = SegmentWindow::new(1.5);
        let closed = feed(&mut window, &ts);

        for w in &closed {
            for f in &w.frames {
                assert!(f.capture_ts >= w.start_ts);
                assert!(f.capture_ts < w.start_ts + 1.5);
            }
        }
        let all: Vec<f64> = closed.iter().flat_map(stamps).collect();
        assert_eq!(all, ts.to_vec());
        assert_eq!(stamps(&closed[0]), vec![0.0, 0.4, 0.9, 1.49]);
        assert_eq!(closed[1].start_ts, 1.5);
    }

    #[test]
    fn test_start_is_set_by_next_frame_not_eagerly() {
        let mut window = SegmentWindow::new(2.0);
        assert!(window.push(FrameMetadata::empty(10.0)).is_none());
        // 大间隔后的帧开启新窗口, 起点就是该帧
        let closed = window.push(FrameMetadata::empty(25.0)).unwrap();
        assert_eq!(stamps(&closed), vec![10.0]);
        assert_eq!(window.start_ts(), Some(25.0));
        assert!(window.closes_at(27.0));
        assert!(!window.closes_at(26.99));
    }

    #[test]
    fn test_flush_on_empty_window() {
        let mut window = SegmentWindow::new(2.0);
        assert!(window.flush().is_none());
        assert!(!window.closes_at(100.0));
    }
}
