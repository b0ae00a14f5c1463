/// 检测器接口与桩实现
/// Detector capability, the stochastic stub detector and coordinate rescaling
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::types::{Detection, Frame, Resolution};
use crate::error::Result;

/// 桩检测器使用的假标签
pub const FAKE_LABELS: [&str; 10] = [
    "person", "car", "bottle", "cat", "dog", "chair", "tree", "phone", "laptop", "book",
];

/// 可替换的检测能力
///
/// Implementations return boxes in their own inference resolution
/// ([`Detector::input_size`]); the inference stage rescales them to the frame.
pub trait Detector: Send {
    /// 推理输入尺寸
    fn input_size(&self) -> Resolution;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    fn name(&self) -> &str {
        "detector"
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn input_size(&self) -> Resolution {
        (**self).input_size()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// 随机桩检测器: 每帧 1-3 个随机框
pub struct StubDetector {
    rng: StdRng,
    input_size: Resolution,
}

impl StubDetector {
    pub fn new(input_size: Resolution) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            input_size,
        }
    }

    /// Same seed, same detections.
    pub fn seeded(input_size: Resolution, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            input_size,
        }
    }
}

impl Detector for StubDetector {
    fn input_size(&self) -> Resolution {
        self.input_size
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        let w = self.input_size.width as i32;
        let h = self.input_size.height as i32;
        let count = self.rng.gen_range(1..=3);

        let mut detections = Vec::with_capacity(count);
        for _ in 0..count {
            let label = FAKE_LABELS.choose(&mut self.rng).copied().unwrap_or("person");
            let confidence = (self.rng.gen_range(0.5f32..=0.99) * 1000.0).round() / 1000.0;

            let xmin = self.rng.gen_range(0..=w / 2);
            let ymin = self.rng.gen_range(0..=h / 2);
            // 输入尺寸过小时保证区间非空
            let xmax = self.rng.gen_range((xmin + 10).min(w)..=w);
            let ymax = self.rng.gen_range((ymin + 10).min(h)..=h);

            detections.push(Detection {
                label: label.to_string(),
                confidence,
                xmin,
                ymin,
                xmax,
                ymax,
            });
        }
        Ok(detections)
    }

    fn name(&self) -> &str {
        "stub"
    }
}

// ========== 坐标还原 ==========

/// 推理分辨率 → 原图分辨率的缩放比例
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleFactors {
    pub sx: f64,
    pub sy: f64,
}

impl ScaleFactors {
    /// `sx = orig_w / inf_w`, `sy = orig_h / inf_h`.
    pub fn between(original: Resolution, inference: Resolution) -> Self {
        Self {
            sx: original.width as f64 / inference.width.max(1) as f64,
            sy: original.height as f64 / inference.height.max(1) as f64,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.sx == 1.0 && self.sy == 1.0
    }
}

/// 将一个推理空间的检测框还原到原图坐标
///
/// Products are computed in `f64` and truncated toward zero.
pub fn rescale(detection: &Detection, scale: ScaleFactors) -> Detection {
    let x = |v: i32| (v as f64 * scale.sx) as i32;
    let y = |v: i32| (v as f64 * scale.sy) as i32;
    Detection {
        label: detection.label.clone(),
        confidence: detection.confidence,
        xmin: x(detection.xmin),
        ymin: y(detection.ymin),
        xmax: x(detection.xmax),
        ymax: y(detection.ymax),
    }
}

pub fn rescale_all(detections: &[Detection], scale: ScaleFactors) -> Vec<Detection> {
    detections.iter().map(|d| rescale(d, scale)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(res: Resolution) -> Frame {
        Frame {
            data: vec![0; res.frame_len()],
            width: res.width,
            height: res.height,
            capture_ts: 0.0,
        }
    }

    fn boxed(x1: i32, y1: i32, x2: i32, y2: i32) -> Detection {
        Detection {
            label: "car".into(),
            confidence: 0.9,
            xmin: x1,
            ymin: y1,
            xmax: x2,
            ymax: y2,
        }
    }

    #[test]
    fn test_rescale_exact_multiple() {
        let scale = ScaleFactors::between(Resolution::new(1280, 720), Resolution::new(640, 360));
        let out = rescale(&boxed(10, 20, 100, 200), scale);
        assert_eq!((out.xmin, out.ymin, out.xmax, out.ymax), (20, 40, 200, 400));
        assert_eq!(out.label, "car");
        assert_eq!(out.confidence, 0.9);
    }

    #[test]
    fn test_rescale_truncates_instead_of_rounding() {
        // sx = 1920/640 = 3, sy = 1080/640 = 1.6875
        let scale = ScaleFactors::between(Resolution::new(1920, 1080), Resolution::new(640, 640));
        let out = rescale(&boxed(1, 1, 3, 7), scale);
        // 1*1.6875 = 1.6875 -> 1 ; 7*1.6875 = 11.8125 -> 11
        assert_eq!((out.xmin, out.ymin, out.xmax, out.ymax), (3, 1, 9, 11));
    }

    #[test]
    fn test_rescale_downscale_truncates() {
        // sx = 320/640 = 0.5, sy = 240/640 = 0.375
        let scale = ScaleFactors::between(Resolution::new(320, 240), Resolution::new(640, 640));
        let out = rescale(&boxed(3, 3, 639, 639), scale);
        // 3*0.5 = 1.5 -> 1 ; 3*0.375 = 1.125 -> 1 ; 639*0.5 = 319.5 -> 319 ; 639*0.375 = 239.625 -> 239
        assert_eq!((out.xmin, out.ymin, out.xmax, out.ymax), (1, 1, 319, 239));
    }

    #[test]
    fn test_identity_scale() {
        let res = Resolution::new(640, 480);
        let scale = ScaleFactors::between(res, res);
        assert!(scale.is_identity());
        let d = boxed(5, 6, 7, 8);
        assert_eq!(rescale(&d, scale), d);
    }

    #[test]
    fn test_stub_detector_bounds() {
        let size = Resolution::new(640, 480);
        let mut det = StubDetector::seeded(size, 7);
        let f = frame(Resolution::new(8, 8));
        for _ in 0..200 {
            let out = det.detect(&f).unwrap();
            assert!((1..=3).contains(&out.len()));
            for d in out {
                assert!(FAKE_LABELS.contains(&d.label.as_str()));
                assert!((0.5..=0.99).contains(&d.confidence));
                assert!(d.xmin >= 0 && d.xmin <= 320);
                assert!(d.ymin >= 0 && d.ymin <= 240);
                assert!(d.xmax >= d.xmin + 10 && d.xmax <= 640);
                assert!(d.ymax >= d.ymin + 10 && d.ymax <= 480);
            }
        }
    }

    #[test]
    fn test_stub_detector_seed_is_deterministic() {
        let size = Resolution::new(320, 320);
        let f = frame(Resolution::new(4, 4));
        let mut a = StubDetector::seeded(size, 42);
        let mut b = StubDetector::seeded(size, 42);
        for _ in 0..10 {
            assert_eq!(a.detect(&f).unwrap(), b.detect(&f).unwrap());
        }
    }
}
