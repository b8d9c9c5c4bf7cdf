use std::path::{Path, PathBuf};

use crate::{
    Detections, YoloV5Error,
    autoshape::ImageSource,
    backend::YoloV5Size,
    helpers::{LoadOptions, LoadedModel, load_model},
};

/// Default inference size, longest image side in pixels.
pub const DEFAULT_SIZE: usize = 640;

/// A model that turns a batch of images into detections.
pub trait Predictor {
    /// Detects objects in `images` at `size` pixels, optionally with test time
    /// augmentation.
    fn predict(
        &self,
        images: &[ImageSource],
        size: usize,
        augment: bool,
    ) -> Result<Detections, YoloV5Error>;
}

impl Predictor for LoadedModel {
    fn predict(
        &self,
        images: &[ImageSource],
        size: usize,
        augment: bool,
    ) -> Result<Detections, YoloV5Error> {
        LoadedModel::predict(self, images, size, augment)
    }
}

/// Creates the model handle of a [`YoloV5`] wrapper.
pub trait ModelLoader {
    /// Handle type.
    type Model: Predictor;

    /// Loads the weights at `path`.
    fn load(&self, path: &Path, options: &LoadOptions) -> Result<Self::Model, YoloV5Error>;
}

/// Loads models with [`load_model`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleLoader;

impl ModelLoader for CandleLoader {
    type Model = LoadedModel;

    fn load(&self, path: &Path, options: &LoadOptions) -> Result<Self::Model, YoloV5Error> {
        load_model(path, options)
    }
}

/// YOLOv5 configuration struct.
#[derive(Debug, Clone)]
pub struct YoloV5Config {
    /// Path of the weights file.
    pub model_path: PathBuf,
    /// Device string, first available accelerator when `None`.
    pub device: Option<String>,
    /// Load the weights while constructing the wrapper.
    pub load_on_init: bool,
    /// Class agnostic non-maximum suppression.
    pub agnostic: bool,
    /// Half precision inference.
    pub fp16: bool,
    /// Report informational messages.
    pub verbose: bool,
    /// Model size, inferred from the file name when `None`.
    pub size: Option<YoloV5Size>,
    /// Number of classes of the checkpoint.
    pub num_classes: usize,
    /// Hugging Face repository to fetch missing weights from.
    pub hub_repo: Option<String>,
}

/// Default configuration for YOLOv5.
impl Default for YoloV5Config {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("yolov5/weights/yolov5s.safetensors"),
            device: None,
            load_on_init: true,
            agnostic: false,
            fp16: false,
            verbose: false,
            size: None,
            num_classes: 80,
            hub_repo: None,
        }
    }
}

impl YoloV5Config {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            device: self.device.clone(),
            autoshape: true,
            agnostic: self.agnostic,
            fp16: self.fp16,
            verbose: self.verbose,
            size: self.size,
            num_classes: self.num_classes,
            class_names: None,
            hub_repo: self.hub_repo.clone(),
        }
    }
}

/// YOLOv5 high level interface.
///
/// Binds a weights path and a device to a model handle that is loaded either
/// on construction or with [`YoloV5::load_model`].
pub struct YoloV5<L: ModelLoader = CandleLoader> {
    config: YoloV5Config,
    loader: L,
    model: Option<L::Model>,
}

impl YoloV5 {
    /// Create a new YOLOv5 instance
    pub fn new(config: YoloV5Config) -> Result<Self, YoloV5Error> {
        Self::with_loader(config, CandleLoader)
    }
}

impl<L: ModelLoader> YoloV5<L> {
    /// Create a new YOLOv5 instance whose handle is created by `loader`.
    pub fn with_loader(config: YoloV5Config, loader: L) -> Result<Self, YoloV5Error> {
        let mut yolo = Self {
            config,
            loader,
            model: None,
        };
        if yolo.config.load_on_init {
            yolo.load_model()?;
        }
        Ok(yolo)
    }

    /// Load the weights, replacing any previously loaded model.
    pub fn load_model(&mut self) -> Result<(), YoloV5Error> {
        let parent = self.config.model_path.parent();
        if let Some(parent) = parent.filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let model = self
            .loader
            .load(&self.config.model_path, &self.config.load_options())?;
        self.model = Some(model);
        Ok(())
    }

    /// Whether a model handle is present.
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// The loaded model handle.
    pub fn model(&self) -> Option<&L::Model> {
        self.model.as_ref()
    }

    /// Path of the weights file.
    pub fn model_path(&self) -> &Path {
        &self.config.model_path
    }

    /// Requested device string.
    pub fn device(&self) -> Option<&str> {
        self.config.device.as_deref()
    }

    /// Perform prediction using the loaded model weights.
    ///
    /// `images`, `size` and `augment` are passed unchanged to the model, and
    /// its results are returned as is.
    pub fn predict(
        &self,
        images: &[ImageSource],
        size: usize,
        augment: bool,
    ) -> Result<Detections, YoloV5Error> {
        let model = self.model.as_ref().ok_or(YoloV5Error::ModelNotLoaded)?;
        model.predict(images, size, augment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        cell::{Cell, RefCell},
        rc::Rc,
        sync::Arc,
    };

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        sources: Vec<String>,
        size: usize,
        augment: bool,
    }

    #[derive(Default)]
    struct Recorder {
        loads: Cell<usize>,
        options: RefCell<Vec<(PathBuf, Option<String>, bool, bool)>>,
        calls: RefCell<Vec<Call>>,
    }

    struct FakeModel {
        id: usize,
        recorder: Rc<Recorder>,
    }

    impl Predictor for FakeModel {
        fn predict(
            &self,
            images: &[ImageSource],
            size: usize,
            augment: bool,
        ) -> Result<Detections, YoloV5Error> {
            self.recorder.calls.borrow_mut().push(Call {
                sources: images.iter().map(|image| format!("{image:?}")).collect(),
                size,
                augment,
            });
            let names: Arc<[String]> = vec![format!("model{}", self.id)].into();
            Ok(Detections::empty(names))
        }
    }

    #[derive(Default)]
    struct FakeLoader {
        recorder: Rc<Recorder>,
    }

    impl ModelLoader for FakeLoader {
        type Model = FakeModel;

        fn load(&self, path: &Path, options: &LoadOptions) -> Result<FakeModel, YoloV5Error> {
            let id = self.recorder.loads.get() + 1;
            self.recorder.loads.set(id);
            self.recorder.options.borrow_mut().push((
                path.to_path_buf(),
                options.device.clone(),
                options.agnostic,
                options.autoshape,
            ));
            Ok(FakeModel {
                id,
                recorder: self.recorder.clone(),
            })
        }
    }

    fn config(dir: &Path, load_on_init: bool) -> YoloV5Config {
        YoloV5Config {
            model_path: dir.join("weights/nested/yolov5s.safetensors"),
            device: Some("cpu".to_string()),
            load_on_init,
            agnostic: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_predict_before_load_fails() -> Result<(), YoloV5Error> {
        let dir = tempfile::tempdir()?;
        let yolo = YoloV5::with_loader(config(dir.path(), false), FakeLoader::default())?;
        assert!(!yolo.is_loaded());
        assert!(matches!(
            yolo.predict(&[], DEFAULT_SIZE, false),
            Err(YoloV5Error::ModelNotLoaded)
        ));

        // the default loader fails the same way without touching any weights
        let yolo = YoloV5::new(config(dir.path(), false))?;
        assert!(matches!(
            yolo.predict(&["bus.jpg".into()], DEFAULT_SIZE, false),
            Err(YoloV5Error::ModelNotLoaded)
        ));
        Ok(())
    }

    #[test]
    fn test_load_on_init() -> Result<(), YoloV5Error> {
        let dir = tempfile::tempdir()?;
        let loader = FakeLoader::default();
        let recorder = loader.recorder.clone();
        let yolo = YoloV5::with_loader(config(dir.path(), true), loader)?;

        assert!(yolo.is_loaded());
        assert_eq!(recorder.loads.get(), 1);
        assert!(dir.path().join("weights/nested").is_dir());

        let options = recorder.options.borrow();
        assert_eq!(options[0].0, yolo.model_path());
        assert_eq!(options[0].1.as_deref(), Some("cpu"));
        assert!(options[0].2, "agnostic flag is forwarded");
        assert!(options[0].3, "autoshape is always on");
        Ok(())
    }

    #[test]
    fn test_lazy_load_replaces_handle() -> Result<(), YoloV5Error> {
        let dir = tempfile::tempdir()?;
        let loader = FakeLoader::default();
        let recorder = loader.recorder.clone();
        let mut yolo = YoloV5::with_loader(config(dir.path(), false), loader)?;
        assert_eq!(recorder.loads.get(), 0);
        assert!(!dir.path().join("weights").exists());

        yolo.load_model()?;
        assert!(yolo.is_loaded());
        assert!(dir.path().join("weights/nested").is_dir());
        assert_eq!(yolo.model().map(|m| m.id), Some(1));

        yolo.load_model()?;
        assert_eq!(yolo.model().map(|m| m.id), Some(2));
        let detections = yolo.predict(&[], DEFAULT_SIZE, false)?;
        assert_eq!(detections.names(), ["model2".to_string()]);
        Ok(())
    }

    #[test]
    fn test_predict_forwards_arguments() -> Result<(), YoloV5Error> {
        let dir = tempfile::tempdir()?;
        let loader = FakeLoader::default();
        let recorder = loader.recorder.clone();
        let yolo = YoloV5::with_loader(config(dir.path(), true), loader)?;

        let images: Vec<ImageSource> = vec!["a.jpg".into(), PathBuf::from("b.png").into()];
        let detections = yolo.predict(&images, 1280, true)?;
        yolo.predict(&images[..1], 320, false)?;

        assert!(detections.is_empty());
        let calls = recorder.calls.borrow();
        assert_eq!(
            *calls,
            vec![
                Call {
                    sources: images.iter().map(|image| format!("{image:?}")).collect(),
                    size: 1280,
                    augment: true,
                },
                Call {
                    sources: vec![format!("{:?}", images[0])],
                    size: 320,
                    augment: false,
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_end_to_end_with_candle() -> Result<(), YoloV5Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("yolov5n.safetensors");
        crate::backend::write_test_weights(&path, 80)?;

        let config = YoloV5Config {
            model_path: path,
            device: Some("cpu".to_string()),
            ..Default::default()
        };
        let yolo = YoloV5::new(config)?;
        assert!(yolo.is_loaded());
        assert_eq!(yolo.device(), Some("cpu"));

        let image = kornia_image::Image::<u8, 3>::from_size_val(
            kornia_image::ImageSize {
                width: 48,
                height: 32,
            },
            90,
        )?;
        let detections = yolo.predict(&[image.into()], 64, false)?;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections.input_shape(), (64, 64));
        Ok(())
    }
}
