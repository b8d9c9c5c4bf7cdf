#![deny(missing_docs)]

//! YOLOv5 inference in Rust
//!
//! This crate packages the YOLOv5 object detector and provides a thin
//! interface to load its weights on a device and run it on images.
//!
//! # Examples
//!
//! ```no_run
//! use yolov5::{YoloV5, YoloV5Config};
//!
//! let config = YoloV5Config {
//!     model_path: "yolov5/weights/yolov5s.safetensors".into(),
//!     device: Some("cpu".to_string()),
//!     ..Default::default()
//! };
//!
//! let model = YoloV5::new(config).expect("Failed to create YOLOv5 model");
//!
//! let detections = model
//!     .predict(&["path/to/image.jpg".into()], 640, false)
//!     .expect("Failed to run inference");
//! println!("{}", detections.summary());
//! ```
//!
//! Lower level access goes through [`load_model`]:
//!
//! ```no_run
//! use yolov5::{LoadOptions, load_model};
//!
//! let options = LoadOptions {
//!     verbose: true,
//!     ..Default::default()
//! };
//! let model = load_model("yolov5/weights/yolov5s.safetensors", &options)?;
//! let detections = model.predict(&["path/to/image.jpg".into()], 640, false)?;
//! # Ok::<(), yolov5::YoloV5Error>(())
//! ```

/// Letterboxing, batching and NMS around the raw network
mod autoshape;

/// Weights loading and test time augmentation
mod backend;

/// Bounding box module with non-maximum suppression
mod bounding_box;

/// COCO class names
pub mod coco_classes;

/// Detection results
mod detections;

/// Compute device selection
pub mod device;

mod error;

/// Model loading helpers
mod helpers;

/// Letterbox resizing and box rescaling
mod letterbox;

/// YOLOv5 model definition in candle
mod model;

mod verbosity;

/// YOLOv5 high level interface
mod yolov5;

pub use autoshape::{AutoShape, ImageSource};
pub use backend::{BackendOptions, DetectMultiBackend, WeightsFormat, YoloV5Size};
pub use bounding_box::{BoundingBox, NmsConfig, non_max_suppression, non_maximum_suppression};
pub use detections::{Detections, ImageDetections, Timings};
pub use device::DeviceSelector;
pub use error::YoloV5Error;
pub use helpers::{LoadOptions, LoadedModel, load_model};
pub use verbosity::Verbosity;
pub use yolov5::{CandleLoader, DEFAULT_SIZE, ModelLoader, Predictor, YoloV5, YoloV5Config};
