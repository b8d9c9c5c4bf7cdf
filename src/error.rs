use std::path::PathBuf;

/// YOLOv5 error enum.
#[derive(thiserror::Error, Debug)]
pub enum YoloV5Error {
    /// Prediction was requested before any model was loaded.
    #[error("model is not loaded, call `load_model()` before `predict()`")]
    ModelNotLoaded,

    /// Failed to load YOLOv5 model.
    #[error("Failed to load YOLOv5 model: {0}")]
    LoadModelError(String),

    /// The device string could not be parsed or the device is unavailable.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// A detection threshold is outside of `[0, 1]`.
    #[error("Invalid {name} threshold {value}, valid values are between 0.0 and 1.0")]
    InvalidThreshold {
        /// Name of the threshold.
        name: &'static str,
        /// The rejected value.
        value: f32,
    },

    /// The weights file has an extension no reader is registered for.
    #[error("Unsupported weights format: {0}")]
    UnsupportedWeights(PathBuf),

    /// The image uri scheme is not supported.
    #[error("Unsupported image uri: {0}")]
    UnsupportedUri(String),

    /// Raw predictions do not have the `(batch, anchors, 5 + classes)` layout.
    #[error("Invalid predictions shape {0:?}, expected (batch, anchors, 5 + classes)")]
    InvalidPredictions(Vec<usize>),

    /// Image inference was requested from a model loaded without autoshape.
    #[error("model was loaded without autoshape, call `forward()` with a tensor instead")]
    AutoShapeRequired,

    /// Internal candle error.
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    /// Kornia image error.
    #[error(transparent)]
    KorniaImageError(#[from] kornia_image::ImageError),

    /// Kornia io error.
    #[error(transparent)]
    KorniaIoError(#[from] kornia_io::error::IoError),

    /// Hugging Face API error.
    #[error(transparent)]
    ApiError(#[from] hf_hub::api::sync::ApiError),

    /// Filesystem error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}
