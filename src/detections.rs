use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use kornia_image::ImageSize;
use serde::Serialize;

use crate::{BoundingBox, YoloV5Error};

/// Wall time spent in each stage of a prediction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timings {
    /// Decoding and letterboxing.
    pub preprocess: Duration,
    /// Network forward pass.
    pub inference: Duration,
    /// Non-maximum suppression and rescaling.
    pub nms: Duration,
}

/// Detection results of a batch of images.
#[derive(Debug, Clone)]
pub struct Detections {
    pred: Vec<Vec<BoundingBox>>,
    shapes: Vec<ImageSize>,
    files: Vec<String>,
    names: Arc<[String]>,
    input_shape: (usize, usize),
    times: Timings,
}

/// Detections of a single image.
#[derive(Debug, Clone, Copy)]
pub struct ImageDetections<'a> {
    /// Source name of the image.
    pub file: &'a str,
    /// Original size of the image.
    pub size: ImageSize,
    /// Boxes in original image coordinates, best first.
    pub boxes: &'a [BoundingBox],
}

#[derive(Serialize)]
struct JsonDetection<'a> {
    name: &'a str,
    #[serde(flatten)]
    bbox: &'a BoundingBox,
}

#[derive(Serialize)]
struct JsonImage<'a> {
    file: &'a str,
    width: usize,
    height: usize,
    detections: Vec<JsonDetection<'a>>,
}

impl Detections {
    /// Bundles per image boxes with their image metadata.
    ///
    /// `pred`, `shapes` and `files` are indexed by image.
    pub fn new(
        pred: Vec<Vec<BoundingBox>>,
        shapes: Vec<ImageSize>,
        files: Vec<String>,
        names: Arc<[String]>,
        input_shape: (usize, usize),
        times: Timings,
    ) -> Self {
        debug_assert_eq!(pred.len(), shapes.len());
        debug_assert_eq!(pred.len(), files.len());
        Self {
            pred,
            shapes,
            files,
            names,
            input_shape,
            times,
        }
    }

    /// Results without any image.
    pub fn empty(names: Arc<[String]>) -> Self {
        Self::new(
            Vec::new(),
            Vec::new(),
            Vec::new(),
            names,
            (0, 0),
            Timings::default(),
        )
    }

    /// Number of images.
    pub fn len(&self) -> usize {
        self.pred.len()
    }

    /// Whether the batch had no images.
    pub fn is_empty(&self) -> bool {
        self.pred.is_empty()
    }

    /// Results of the image at `index`.
    pub fn get(&self, index: usize) -> Option<ImageDetections<'_>> {
        Some(ImageDetections {
            file: self.files.get(index)?,
            size: *self.shapes.get(index)?,
            boxes: self.pred.get(index)?,
        })
    }

    /// Iterates over the per image results.
    pub fn iter(&self) -> impl Iterator<Item = ImageDetections<'_>> {
        (0..self.len()).filter_map(|index| self.get(index))
    }

    /// Class names indexed by class id.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Name of a class, if known.
    pub fn name(&self, class: u32) -> Option<&str> {
        self.names.get(class as usize).map(String::as_str)
    }

    /// Letterboxed `(height, width)` the batch was run at.
    pub fn input_shape(&self) -> (usize, usize) {
        self.input_shape
    }

    /// Stage timings of the whole batch.
    pub fn times(&self) -> Timings {
        self.times
    }

    /// Boxes as `[xmin, ymin, xmax, ymax, confidence, class]` rows.
    pub fn xyxy(&self) -> Vec<Vec<[f32; 6]>> {
        self.rows(|b, _| [b.xmin, b.ymin, b.xmax, b.ymax])
    }

    /// Boxes as `[cx, cy, w, h, confidence, class]` rows.
    pub fn xywh(&self) -> Vec<Vec<[f32; 6]>> {
        self.rows(|b, _| b.xywh())
    }

    /// Like [`Detections::xyxy`] with coordinates normalized by the image size.
    pub fn xyxyn(&self) -> Vec<Vec<[f32; 6]>> {
        self.rows(|b, size| {
            let (w, h) = (size.width as f32, size.height as f32);
            [b.xmin / w, b.ymin / h, b.xmax / w, b.ymax / h]
        })
    }

    /// Like [`Detections::xywh`] with coordinates normalized by the image size.
    pub fn xywhn(&self) -> Vec<Vec<[f32; 6]>> {
        self.rows(|b, size| {
            let (w, h) = (size.width as f32, size.height as f32);
            let [cx, cy, bw, bh] = b.xywh();
            [cx / w, cy / h, bw / w, bh / h]
        })
    }

    fn rows(&self, coords: impl Fn(&BoundingBox, ImageSize) -> [f32; 4]) -> Vec<Vec<[f32; 6]>> {
        self.pred
            .iter()
            .zip(self.shapes.iter())
            .map(|(boxes, &size)| {
                boxes
                    .iter()
                    .map(|b| {
                        let [a, b2, c, d] = coords(b, size);
                        [a, b2, c, d, b.confidence, b.class as f32]
                    })
                    .collect()
            })
            .collect()
    }

    /// One line per image, e.g. `image 1/2: 480x640 2 persons, 1 dog`.
    pub fn summary(&self) -> String {
        self.iter()
            .enumerate()
            .map(|(i, image)| {
                let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
                for b in image.boxes {
                    *counts.entry(b.class).or_default() += 1;
                }
                let classes = if counts.is_empty() {
                    "(no detections)".to_string()
                } else {
                    counts
                        .iter()
                        .map(|(&class, &n)| {
                            let name = self.name(class).unwrap_or("unknown");
                            format!("{n} {name}{}", if n > 1 { "s" } else { "" })
                        })
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                format!(
                    "image {}/{}: {}x{} {classes}",
                    i + 1,
                    self.len(),
                    image.size.height,
                    image.size.width
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Serializes the results, one object per image.
    pub fn to_json(&self) -> Result<String, YoloV5Error> {
        let images: Vec<JsonImage> = self
            .iter()
            .map(|image| JsonImage {
                file: image.file,
                width: image.size.width,
                height: image.size.height,
                detections: image
                    .boxes
                    .iter()
                    .map(|bbox| JsonDetection {
                        name: self.name(bbox.class).unwrap_or("unknown"),
                        bbox,
                    })
                    .collect(),
            })
            .collect();
        Ok(serde_json::to_string(&images)?)
    }
}

impl fmt::Display for Detections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary())?;
        let per_image = |d: Duration| d.as_secs_f64() * 1e3 / self.len().max(1) as f64;
        write!(
            f,
            "Speed: {:.1}ms pre-process, {:.1}ms inference, {:.1}ms NMS per image at shape ({}, 3, {}, {})",
            per_image(self.times.preprocess),
            per_image(self.times.inference),
            per_image(self.times.nms),
            self.len(),
            self.input_shape.0,
            self.input_shape.1,
        )
    }
}
