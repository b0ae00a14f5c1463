// YOLOv8 ONNX 检测器
// 包含: 模型加载、预处理、推理、后处理

use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;

use super::detector::Detector;
use super::types::{Detection, Frame, Resolution};
use crate::error::{PipelineError, Result};

pub const COCO_NAMES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// YOLOv8 导出模型的输出张量名
const OUTPUT_NAME: &str = "output0";

/// 候选框 (推理空间, xyxy)
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    class_id: usize,
    confidence: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.) * (self.y2 - self.y1).max(0.)
    }

    fn intersection_area(&self, another: &Candidate) -> f32 {
        let l = self.x1.max(another.x1);
        let r = self.x2.min(another.x2);
        let t = self.y1.max(another.y1);
        let b = self.y2.min(another.y2);
        (r - l).max(0.) * (b - t).max(0.)
    }

    fn iou(&self, another: &Candidate) -> f32 {
        let union = self.area() + another.area() - self.intersection_area(another);
        if union <= 0. {
            return 0.;
        }
        self.intersection_area(another) / union
    }
}

/// 按置信度降序做类内NMS
fn non_max_suppression(xs: &mut Vec<Candidate>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].class_id == xs[index].class_id
                && xs[prev_index].iou(&xs[index]) > iou_threshold
            {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// 解码 YOLOv8 输出 `[1, 4 + nc, N]` (cx, cy, w, h, class scores...)
fn decode_output(shape: &[i64], data: &[f32], conf: f32, iou: f32) -> Result<Vec<Candidate>> {
    if shape.len() != 3 || shape[1] < 5 {
        return Err(PipelineError::Model(format!(
            "unexpected YOLOv8 output shape {shape:?}"
        )));
    }
    let channels = shape[1] as usize;
    let num_boxes = shape[2] as usize;
    if data.len() < channels * num_boxes {
        return Err(PipelineError::Model(format!(
            "output holds {} values, shape {shape:?} needs {}",
            data.len(),
            channels * num_boxes
        )));
    }

    let mut xs = Vec::new();
    for i in 0..num_boxes {
        let (mut best_class, mut best_score) = (0usize, 0f32);
        for class_id in 0..channels - 4 {
            let score = data[(4 + class_id) * num_boxes + i];
            if score > best_score {
                best_score = score;
                best_class = class_id;
            }
        }
        if best_score < conf {
            continue;
        }

        let cx = data[i];
        let cy = data[num_boxes + i];
        let w = data[2 * num_boxes + i];
        let h = data[3 * num_boxes + i];
        xs.push(Candidate {
            x1: cx - w / 2.,
            y1: cy - h / 2.,
            x2: cx + w / 2.,
            y2: cy + h / 2.,
            class_id: best_class,
            confidence: best_score,
        });
    }

    non_max_suppression(&mut xs, iou);
    Ok(xs)
}

/// 基于 ONNX Runtime 的 YOLOv8 检测器
pub struct OnnxDetector {
    session: Session,
    input_size: Resolution,
    conf: f32,
    iou: f32,
}

impl OnnxDetector {
    pub fn new(model: &str, input_size: Resolution, conf: f32, iou: f32) -> Result<Self> {
        let session = Session::builder()
            .map_err(|e| PipelineError::Model(format!("ONNX builder failed: {e}")))?
            .commit_from_file(model)
            .map_err(|e| PipelineError::Model(format!("failed to load {model}: {e}")))?;
        tracing::info!(model, input = %input_size, "✅ detection model loaded");

        Ok(Self {
            session,
            input_size,
            conf,
            iou,
        })
    }

    /// BGR24 → RGB → resize → NCHW f32 [0,1]
    fn preprocess(&self, frame: &Frame) -> Result<Array4<f32>> {
        let rgb: Vec<u8> = frame
            .data
            .chunks_exact(3)
            .flat_map(|p| [p[2], p[1], p[0]])
            .collect();
        let img = RgbImage::from_raw(frame.width, frame.height, rgb).ok_or_else(|| {
            PipelineError::Model(format!(
                "frame buffer does not match {}x{}",
                frame.width, frame.height
            ))
        })?;

        let (w, h) = (self.input_size.width, self.input_size.height);
        let resized = imageops::resize(&img, w, h, imageops::FilterType::Triangle);

        let input = Array4::from_shape_fn((1, 3, h as usize, w as usize), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
        });
        Ok(input)
    }
}

impl Detector for OnnxDetector {
    fn input_size(&self) -> Resolution {
        self.input_size
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.preprocess(frame)?;
        let value = Tensor::from_array(input)
            .map_err(|e| PipelineError::Model(format!("failed to create ONNX value: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![value])
            .map_err(|e| PipelineError::Model(format!("ONNX inference failed: {e}")))?;
        let output = outputs
            .get(OUTPUT_NAME)
            .ok_or_else(|| PipelineError::Model(format!("model has no `{OUTPUT_NAME}` output")))?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(format!("failed to extract output: {e}")))?;

        let candidates = decode_output(shape, data, self.conf, self.iou)?;
        Ok(candidates
            .into_iter()
            .map(|c| Detection {
                label: COCO_NAMES
                    .get(c.class_id)
                    .copied()
                    .unwrap_or("unknown")
                    .to_string(),
                confidence: c.confidence,
                xmin: c.x1.max(0.) as i32,
                ymin: c.y1.max(0.) as i32,
                xmax: c.x2 as i32,
                ymax: c.y2 as i32,
            })
            .collect())
    }

    fn name(&self) -> &str {
        "onnx"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x1: f32, conf: f32, class_id: usize) -> Candidate {
        Candidate {
            x1,
            y1: 0.,
            x2: x1 + 10.,
            y2: 10.,
            class_id,
            confidence: conf,
        }
    }

    #[test]
    fn test_nms_keeps_highest_overlapping() {
        let mut xs = vec![candidate(0., 0.6, 0), candidate(1., 0.9, 0), candidate(50., 0.5, 0)];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 2);
        assert_eq!(xs[0].confidence, 0.9);
        assert_eq!(xs[1].x1, 50.);
    }

    #[test]
    fn test_nms_is_class_aware() {
        let mut xs = vec![candidate(0., 0.6, 0), candidate(0., 0.9, 2)];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 2);
    }

    #[test]
    fn test_decode_output_filters_by_confidence() {
        // 2 boxes, 2 classes: channels = 6
        let shape = [1i64, 6, 2];
        #[rustfmt::skip]
        let data = [
            50., 200.,  // cx
            50., 200.,  // cy
            20., 40.,   // w
            10., 40.,   // h
            0.8, 0.1,   // class 0
            0.1, 0.2,   // class 1
        ];
        let out = decode_output(&shape, &data, 0.25, 0.45).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 0);
        assert_eq!((out[0].x1, out[0].y1, out[0].x2, out[0].y2), (40., 45., 60., 55.));
    }

    #[test]
    fn test_decode_output_rejects_bad_shape() {
        assert!(decode_output(&[1, 3], &[0.; 3], 0.25, 0.45).is_err());
    }

    #[test]
    fn test_model_errors_are_reported_not_panics() {
        let loaded = OnnxDetector::new("does-not-exist.onnx", Resolution::new(640, 640), 0.25, 0.45);
        assert!(matches!(loaded, Err(PipelineError::Model(_))));
        assert_eq!(OUTPUT_NAME, "output0");
    }
}
