use candle_core::{DType, Tensor};
use serde::Serialize;

use crate::YoloV5Error;

/// Candidates kept per image before running the suppression.
const MAX_NMS: usize = 30_000;

/// Bounding box struct for detection results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    /// Minimum x coordinate of the bounding box.
    pub xmin: f32,
    /// Minimum y coordinate of the bounding box.
    pub ymin: f32,
    /// Maximum x coordinate of the bounding box.
    pub xmax: f32,
    /// Maximum y coordinate of the bounding box.
    pub ymax: f32,
    /// Confidence score of the bounding box.
    pub confidence: f32,
    /// Class index of the bounding box.
    pub class: u32,
}

impl BoundingBox {
    /// Width of the box.
    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    /// Height of the box.
    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    /// Center x, center y, width and height.
    pub fn xywh(&self) -> [f32; 4] {
        [
            (self.xmin + self.xmax) / 2.,
            (self.ymin + self.ymax) / 2.,
            self.width(),
            self.height(),
        ]
    }

    fn area(&self) -> f32 {
        self.width().max(0.) * self.height().max(0.)
    }
}

/// Intersection over union of two bounding boxes.
fn iou(b1: &BoundingBox, b2: &BoundingBox) -> f32 {
    let i_xmin = b1.xmin.max(b2.xmin);
    let i_xmax = b1.xmax.min(b2.xmax);
    let i_ymin = b1.ymin.max(b2.ymin);
    let i_ymax = b1.ymax.min(b2.ymax);
    let i_area = (i_xmax - i_xmin).max(0.) * (i_ymax - i_ymin).max(0.);
    let union = b1.area() + b2.area() - i_area;
    if union <= 0. { 0. } else { i_area / union }
}

/// Non-maximum suppression for bounding boxes.
///
/// Each inner vector is suppressed independently, so grouping the boxes by
/// class gives class aware suppression and a single group gives agnostic one.
///
/// # Arguments
///
/// * `bboxes` - A mutable reference to groups of bounding boxes.
/// * `threshold` - The IoU threshold for suppression.
pub fn non_maximum_suppression(bboxes: &mut [Vec<BoundingBox>], threshold: f32) {
    for group in bboxes.iter_mut() {
        group.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));
        let mut current_index = 0;
        for index in 0..group.len() {
            let mut drop = false;
            for prev_index in 0..current_index {
                if iou(&group[prev_index], &group[index]) > threshold {
                    drop = true;
                    break;
                }
            }
            if !drop {
                group.swap(current_index, index);
                current_index += 1;
            }
        }
        group.truncate(current_index);
    }
}

/// Settings of [`non_max_suppression`].
#[derive(Debug, Clone, PartialEq)]
pub struct NmsConfig {
    /// Minimum `objectness * class score` of a kept box.
    pub conf_threshold: f32,
    /// IoU above which the lower scored box is dropped.
    pub iou_threshold: f32,
    /// Suppress across classes instead of per class.
    pub agnostic: bool,
    /// Keep one box per class above the threshold instead of the best class only.
    pub multi_label: bool,
    /// Only keep these classes.
    pub classes: Option<Vec<u32>>,
    /// Maximum detections per image.
    pub max_det: usize,
}

impl Default for NmsConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            agnostic: false,
            multi_label: false,
            classes: None,
            max_det: 1000,
        }
    }
}

impl NmsConfig {
    /// Rejects thresholds outside of `[0, 1]`.
    pub fn validate(&self) -> Result<(), YoloV5Error> {
        for (name, value) in [
            ("confidence", self.conf_threshold),
            ("IoU", self.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(YoloV5Error::InvalidThreshold { name, value });
            }
        }
        Ok(())
    }

    fn keeps_class(&self, class: u32) -> bool {
        self.classes
            .as_ref()
            .is_none_or(|classes| classes.contains(&class))
    }
}

/// Runs non-maximum suppression on raw network predictions.
///
/// `pred` has shape `(b, n, 5 + num_classes)` with rows
/// `cx, cy, w, h, objectness, class scores...`. Returns the kept boxes of each
/// image sorted by decreasing confidence.
pub fn non_max_suppression(
    pred: &Tensor,
    config: &NmsConfig,
) -> Result<Vec<Vec<BoundingBox>>, YoloV5Error> {
    config.validate()?;
    let (_, _, num_outputs) = pred.dims3()?;
    if num_outputs < 5 {
        return Err(YoloV5Error::InvalidPredictions(pred.dims().to_vec()));
    }
    let pred = pred.to_dtype(DType::F32)?.to_vec3::<f32>()?;
    Ok(pred
        .iter()
        .map(|rows| suppress_image(rows, config))
        .collect())
}

fn suppress_image(rows: &[Vec<f32>], config: &NmsConfig) -> Vec<BoundingBox> {
    let mut candidates = Vec::new();
    for row in rows {
        let objectness = row[4];
        if objectness <= config.conf_threshold {
            continue;
        }
        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let make_box = |confidence: f32, class: usize| BoundingBox {
            xmin: cx - w / 2.,
            ymin: cy - h / 2.,
            xmax: cx + w / 2.,
            ymax: cy + h / 2.,
            confidence,
            class: class as u32,
        };
        let scores = row[5..].iter().map(|score| score * objectness);
        if config.multi_label {
            candidates.extend(
                scores
                    .enumerate()
                    .filter(|&(_, conf)| conf > config.conf_threshold)
                    .map(|(class, conf)| make_box(conf, class)),
            );
        } else if let Some((class, conf)) = scores
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .filter(|&(_, conf)| conf > config.conf_threshold)
        {
            candidates.push(make_box(conf, class));
        }
    }
    candidates.retain(|b| config.keeps_class(b.class));

    if candidates.len() > MAX_NMS {
        candidates.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));
        candidates.truncate(MAX_NMS);
    }

    let mut groups: Vec<Vec<BoundingBox>> = if config.agnostic {
        vec![candidates]
    } else {
        let num_groups = candidates
            .iter()
            .map(|b| b.class as usize + 1)
            .max()
            .unwrap_or(0);
        let mut groups = vec![Vec::new(); num_groups];
        for b in candidates {
            groups[b.class as usize].push(b);
        }
        groups
    };
    non_maximum_suppression(&mut groups, config.iou_threshold);

    let mut kept: Vec<BoundingBox> = groups.into_iter().flatten().collect();
    kept.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));
    kept.truncate(config.max_det);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn bbox(xmin: f32, confidence: f32, class: u32) -> BoundingBox {
        BoundingBox {
            xmin,
            ymin: 0.0,
            xmax: xmin + 10.0,
            ymax: 10.0,
            confidence,
            class,
        }
    }

    #[test]
    fn test_non_maximum_suppression() {
        let mut bboxes = vec![vec![bbox(0.0, 0.5, 0), bbox(0.0, 0.5, 0)]];

        non_maximum_suppression(&mut bboxes, 0.5);

        assert_eq!(bboxes[0].len(), 1);
        assert_eq!(bboxes[0][0].confidence, 0.5);
    }

    #[test]
    fn test_non_maximum_suppression_keeps_distant_boxes() {
        let mut bboxes = vec![vec![
            bbox(0.0, 0.4, 0),
            bbox(1.0, 0.9, 0),
            bbox(50.0, 0.3, 0),
        ]];

        non_maximum_suppression(&mut bboxes, 0.5);

        let confidences: Vec<f32> = bboxes[0].iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.3]);
    }

    #[test]
    fn test_iou() {
        let a = bbox(0.0, 1.0, 0);
        assert_eq!(iou(&a, &a), 1.0);
        assert_eq!(iou(&a, &bbox(20.0, 1.0, 0)), 0.0);
        let half = iou(&a, &bbox(5.0, 1.0, 0));
        assert!((half - 50.0 / 150.0).abs() < 1e-6);
    }

    fn predictions() -> candle_core::Result<Tensor> {
        // two overlapping boxes of different classes and one weak box
        let rows: [[f32; 7]; 3] = [
            [20., 20., 10., 10., 0.9, 0.9, 0.1],
            [21., 20., 10., 10., 0.8, 0.1, 0.9],
            [80., 80., 10., 10., 0.2, 0.9, 0.1],
        ];
        Tensor::new(&rows, &Device::Cpu)?.unsqueeze(0)
    }

    #[test]
    fn test_class_aware_suppression() -> Result<(), YoloV5Error> {
        let kept = non_max_suppression(&predictions()?, &NmsConfig::default())?;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].len(), 2);
        assert_eq!(kept[0][0].class, 0);
        assert_eq!(kept[0][1].class, 1);
        assert!((kept[0][0].confidence - 0.81).abs() < 1e-5);
        assert_eq!(kept[0][0].xmin, 15.0);
        assert_eq!(kept[0][0].ymax, 25.0);
        Ok(())
    }

    #[test]
    fn test_agnostic_suppression() -> Result<(), YoloV5Error> {
        let config = NmsConfig {
            agnostic: true,
            ..Default::default()
        };
        let kept = non_max_suppression(&predictions()?, &config)?;
        assert_eq!(kept[0].len(), 1);
        assert_eq!(kept[0][0].class, 0);
        Ok(())
    }

    #[test]
    fn test_class_filter_and_max_det() -> Result<(), YoloV5Error> {
        let config = NmsConfig {
            classes: Some(vec![1]),
            ..Default::default()
        };
        let kept = non_max_suppression(&predictions()?, &config)?;
        assert_eq!(kept[0].len(), 1);
        assert_eq!(kept[0][0].class, 1);

        let config = NmsConfig {
            max_det: 1,
            ..Default::default()
        };
        let kept = non_max_suppression(&predictions()?, &config)?;
        assert_eq!(kept[0].len(), 1);
        assert_eq!(kept[0][0].class, 0);
        Ok(())
    }

    #[test]
    fn test_multi_label() -> Result<(), YoloV5Error> {
        let rows: [[f32; 7]; 1] = [[20., 20., 10., 10., 1.0, 0.6, 0.7]];
        let pred = Tensor::new(&rows, &Device::Cpu)?.unsqueeze(0)?;
        let config = NmsConfig {
            multi_label: true,
            ..Default::default()
        };
        let kept = non_max_suppression(&pred, &config)?;
        assert_eq!(kept[0].len(), 2);
        Ok(())
    }

    #[test]
    fn test_invalid_threshold() {
        let config = NmsConfig {
            iou_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(YoloV5Error::InvalidThreshold { name: "IoU", .. })
        ));
    }

    #[test]
    fn test_rejects_truncated_predictions() -> Result<(), YoloV5Error> {
        let pred = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            non_max_suppression(&pred, &NmsConfig::default()),
            Err(YoloV5Error::InvalidPredictions(dims)) if dims == [1, 2, 4]
        ));

        // objectness only, no class scores to pick from
        let pred = Tensor::ones((1, 2, 5), DType::F32, &Device::Cpu)?;
        let kept = non_max_suppression(&pred, &NmsConfig::default())?;
        assert_eq!(kept, vec![vec![]]);
        Ok(())
    }
}
