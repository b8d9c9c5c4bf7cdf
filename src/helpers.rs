use std::path::Path;

use candle_core::Tensor;

use crate::{
    Detections, YoloV5Error,
    autoshape::{AutoShape, ImageSource},
    backend::{BackendOptions, DetectMultiBackend, YoloV5Size},
    device::DeviceSelector,
    verbosity::{Verbosity, verbose_info},
};

/// Options of [`load_model`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Device string such as `cpu`, `cuda:0` or `mps`, first available
    /// accelerator when `None`.
    pub device: Option<String>,
    /// Wrap the network into [`AutoShape`] so it accepts images directly.
    pub autoshape: bool,
    /// Class agnostic non-maximum suppression.
    pub agnostic: bool,
    /// Half precision inference, ignored on cpu.
    pub fp16: bool,
    /// Report informational messages, warnings are always reported.
    pub verbose: bool,
    /// Model size, inferred from the file name when `None`.
    pub size: Option<YoloV5Size>,
    /// Number of classes of the checkpoint.
    pub num_classes: usize,
    /// Class names of the checkpoint.
    pub class_names: Option<Vec<String>>,
    /// Hugging Face repository to fetch missing weights from.
    pub hub_repo: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            device: None,
            autoshape: true,
            agnostic: false,
            fp16: false,
            verbose: false,
            size: None,
            num_classes: 80,
            class_names: None,
            hub_repo: None,
        }
    }
}

impl LoadOptions {
    /// Verbosity the loaded model logs with.
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_verbose(self.verbose)
    }

    fn backend_options(&self) -> Result<BackendOptions, YoloV5Error> {
        Ok(BackendOptions {
            device: DeviceSelector::from_option(self.device.as_deref())?,
            fp16: self.fp16,
            size: self.size,
            num_classes: self.num_classes,
            class_names: self.class_names.clone(),
            hub_repo: self.hub_repo.clone(),
            verbosity: self.verbosity(),
        })
    }
}

/// A loaded model, ready to run.
#[derive(Debug)]
pub enum LoadedModel {
    /// Raw network taking preprocessed tensors.
    Raw(DetectMultiBackend),
    /// Network taking images and returning detections.
    AutoShape(AutoShape),
}

impl LoadedModel {
    /// The underlying network.
    pub fn backend(&self) -> &DetectMultiBackend {
        match self {
            Self::Raw(model) => model,
            Self::AutoShape(model) => model.model(),
        }
    }

    /// The autoshape wrapper, if the model was loaded with one.
    pub fn as_autoshape(&self) -> Option<&AutoShape> {
        match self {
            Self::AutoShape(model) => Some(model),
            Self::Raw(_) => None,
        }
    }

    /// Runs the raw network on a preprocessed `(b, 3, h, w)` batch.
    pub fn forward(&self, xs: &Tensor, augment: bool) -> Result<Tensor, YoloV5Error> {
        self.backend().forward(xs, augment)
    }

    /// Detects objects in `images`.
    ///
    /// Fails with [`YoloV5Error::AutoShapeRequired`] when the model was loaded
    /// without autoshape, the raw network only accepts tensors.
    pub fn predict(
        &self,
        images: &[ImageSource],
        size: usize,
        augment: bool,
    ) -> Result<Detections, YoloV5Error> {
        match self {
            Self::AutoShape(model) => model.predict(images, size, augment),
            Self::Raw(_) => Err(YoloV5Error::AutoShapeRequired),
        }
    }
}

/// Creates a YOLOv5 model from the weights at `model_path`.
///
/// Without a device the first available accelerator is used, falling back to
/// the cpu. Errors of the weights reader propagate unchanged.
pub fn load_model(
    model_path: impl AsRef<Path>,
    options: &LoadOptions,
) -> Result<LoadedModel, YoloV5Error> {
    let model_path = model_path.as_ref();
    let backend = DetectMultiBackend::load(model_path, &options.backend_options()?)?;
    verbose_info!(
        options.verbosity(),
        "loaded {} on {:?}",
        model_path.display(),
        backend.device()
    );

    Ok(if options.autoshape {
        LoadedModel::AutoShape(AutoShape::new(backend, options.agnostic))
    } else {
        LoadedModel::Raw(backend)
    })
}
