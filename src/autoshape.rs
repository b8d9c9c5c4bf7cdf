use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use candle_core::{DType, Device, Tensor};
use kornia_image::{Image, ImageSize};
use url::Url;

use crate::{
    YoloV5Error,
    backend::DetectMultiBackend,
    bounding_box::{NmsConfig, non_max_suppression},
    detections::{Detections, Timings},
    letterbox::{inference_shape, letterbox, scale_box},
    verbosity::verbose_info,
};

/// An image in any of the accepted input forms.
#[derive(Clone)]
pub enum ImageSource {
    /// Path of an image file.
    Path(PathBuf),
    /// `file://` uri of an image file.
    Uri(Url),
    /// Decoded rgb8 image.
    Image(Image<u8, 3>),
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<&str> for ImageSource {
    /// Strings with a scheme are treated as uris, anything else as a path.
    fn from(s: &str) -> Self {
        match Url::parse(s) {
            Ok(url) if url.scheme().len() > 1 => Self::Uri(url),
            _ => Self::Path(PathBuf::from(s)),
        }
    }
}

impl From<Url> for ImageSource {
    fn from(url: Url) -> Self {
        Self::Uri(url)
    }
}

impl From<Image<u8, 3>> for ImageSource {
    fn from(image: Image<u8, 3>) -> Self {
        Self::Image(image)
    }
}

impl std::fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Uri(url) => f.debug_tuple("Uri").field(&url.as_str()).finish(),
            Self::Image(image) => write!(f, "Image({}x{})", image.width(), image.height()),
        }
    }
}

impl ImageSource {
    /// Name used in the results, the file name for files.
    fn name(&self, index: usize) -> String {
        let path = match self {
            Self::Path(path) => Some(path.clone()),
            Self::Uri(url) => url.to_file_path().ok(),
            Self::Image(_) => None,
        };
        match path.as_deref().and_then(Path::file_name) {
            Some(name) => name.to_string_lossy().into_owned(),
            None => format!("image{index}"),
        }
    }

    /// Decodes the source into an rgb8 image.
    fn decode(&self) -> Result<Image<u8, 3>, YoloV5Error> {
        match self {
            Self::Path(path) => Ok(kornia_io::functional::read_image_any(path)?),
            Self::Uri(url) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| YoloV5Error::UnsupportedUri(url.to_string()))?;
                Ok(kornia_io::functional::read_image_any(path)?)
            }
            Self::Uri(url) => Err(YoloV5Error::UnsupportedUri(url.to_string())),
            Self::Image(image) => Ok(image.clone()),
        }
    }
}

/// Input normalization and non-maximum suppression around a raw backend.
///
/// Accepts images of heterogeneous sizes and forms, letterboxes them into one
/// batch, runs the network and returns boxes in original image coordinates.
#[derive(Debug)]
pub struct AutoShape {
    model: DetectMultiBackend,
    /// NMS settings, `conf_threshold` 0.25 and `iou_threshold` 0.45 by default.
    pub nms: NmsConfig,
}

impl AutoShape {
    /// Wraps `model`, suppressing across classes when `agnostic` is set.
    pub fn new(model: DetectMultiBackend, agnostic: bool) -> Self {
        Self {
            model,
            nms: NmsConfig {
                agnostic,
                ..Default::default()
            },
        }
    }

    /// The wrapped backend.
    pub fn model(&self) -> &DetectMultiBackend {
        &self.model
    }

    /// Detects objects in `images`, inferring at `size` pixels on the longest
    /// side.
    pub fn predict(
        &self,
        images: &[ImageSource],
        size: usize,
        augment: bool,
    ) -> Result<Detections, YoloV5Error> {
        if images.is_empty() {
            return Ok(Detections::empty(self.model.names()));
        }
        let verbosity = self.model.verbosity();

        let start = Instant::now();
        let decoded = images
            .iter()
            .map(ImageSource::decode)
            .collect::<Result<Vec<_>, _>>()?;
        let shapes: Vec<ImageSize> = decoded.iter().map(|image| image.size()).collect();
        let input_shape = inference_shape(&shapes, size, self.model.stride());
        let batch = decoded
            .iter()
            .map(|image| image_to_tensor(&letterbox(image, input_shape)?, &Device::Cpu))
            .collect::<Result<Vec<_>, _>>()?;
        let batch = Tensor::stack(&batch, 0)?;
        let preprocess = start.elapsed();

        let start = Instant::now();
        let pred = self.model.forward(&batch, augment)?;
        let inference = start.elapsed();

        let start = Instant::now();
        let boxes = non_max_suppression(&pred, &self.nms)?
            .into_iter()
            .zip(shapes.iter())
            .map(|(boxes, &shape)| {
                boxes
                    .iter()
                    .map(|bbox| scale_box(bbox, input_shape, shape))
                    .collect()
            })
            .collect();
        let nms = start.elapsed();

        let files = images
            .iter()
            .enumerate()
            .map(|(index, image)| image.name(index))
            .collect();
        let detections = Detections::new(
            boxes,
            shapes,
            files,
            self.model.names(),
            input_shape,
            Timings {
                preprocess,
                inference,
                nms,
            },
        );
        verbose_info!(verbosity, "{detections}");
        Ok(detections)
    }
}

/// Converts an rgb8 image into a `(3, h, w)` tensor of `[0, 1]` floats.
fn image_to_tensor(image: &Image<u8, 3>, device: &Device) -> Result<Tensor, YoloV5Error> {
    let (width, height) = (image.width(), image.height());
    let tensor = Tensor::from_vec(image.as_slice().to_vec(), (height, width, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?;
    Ok(tensor)
}
