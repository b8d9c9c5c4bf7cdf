use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::VarBuilder;

use crate::{
    YoloV5Error, coco_classes,
    device::DeviceSelector,
    model::{Multiples, STRIDES, YoloV5 as YoloV5Model},
    verbosity::{Verbosity, verbose_info},
};

/// Scales of the test time augmentation and whether the pass is flipped left-right.
const AUGMENT_SCALES: [(f64, bool); 3] = [(1.0, false), (0.83, true), (0.67, false)];

/// Value padded images are filled with, 114 / 255.
const PAD_FILL: f64 = 0.447;

/// YOLOv5 model size enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YoloV5Size {
    /// N model size.
    N,
    /// S model size.
    S,
    /// M model size.
    M,
    /// L model size.
    L,
    /// X model size.
    X,
}

impl YoloV5Size {
    fn multiples(&self) -> Multiples {
        match self {
            YoloV5Size::N => Multiples::n(),
            YoloV5Size::S => Multiples::s(),
            YoloV5Size::M => Multiples::m(),
            YoloV5Size::L => Multiples::l(),
            YoloV5Size::X => Multiples::x(),
        }
    }

    /// Infers the size from a checkpoint name such as `yolov5s.safetensors`.
    pub fn from_path(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?.to_lowercase();
        let suffix = stem.strip_prefix("yolov5")?;
        suffix.get(..1)?.parse().ok()
    }
}

impl FromStr for YoloV5Size {
    type Err = YoloV5Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "n" => YoloV5Size::N,
            "s" => YoloV5Size::S,
            "m" => YoloV5Size::M,
            "l" => YoloV5Size::L,
            "x" => YoloV5Size::X,
            _ => return Err(YoloV5Error::LoadModelError(format!("Invalid size: {s}"))),
        })
    }
}

impl TryFrom<String> for YoloV5Size {
    type Error = YoloV5Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for YoloV5Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                YoloV5Size::N => "n",
                YoloV5Size::S => "s",
                YoloV5Size::M => "m",
                YoloV5Size::L => "l",
                YoloV5Size::X => "x",
            }
        )
    }
}

/// On disk format of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsFormat {
    /// `.safetensors`, memory mapped.
    SafeTensors,
    /// `.pt`, `.pth` or `.bin` PyTorch state dict.
    PyTorch,
}

impl WeightsFormat {
    /// Picks the reader from the file extension.
    pub fn from_path(path: &Path) -> Result<Self, YoloV5Error> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("safetensors") => Ok(Self::SafeTensors),
            Some("pt" | "pth" | "bin") => Ok(Self::PyTorch),
            _ => Err(YoloV5Error::UnsupportedWeights(path.to_path_buf())),
        }
    }
}

/// Settings of [`DetectMultiBackend::load`].
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Device to load the weights on.
    pub device: DeviceSelector,
    /// Run in half precision, accelerators only.
    pub fp16: bool,
    /// Model size, inferred from the file name when `None`.
    pub size: Option<YoloV5Size>,
    /// Number of classes of the detection head.
    pub num_classes: usize,
    /// Class names, COCO names or `class{i}` when `None`.
    pub class_names: Option<Vec<String>>,
    /// Hugging Face repository to fetch missing weights from.
    pub hub_repo: Option<String>,
    /// Logging verbosity.
    pub verbosity: Verbosity,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            device: DeviceSelector::Auto,
            fp16: false,
            size: None,
            num_classes: 80,
            class_names: None,
            hub_repo: None,
            verbosity: Verbosity::QUIET,
        }
    }
}

/// Raw YOLOv5 network bound to a device, loaded from any supported format.
pub struct DetectMultiBackend {
    model: YoloV5Model,
    device: Device,
    dtype: DType,
    names: Arc<[String]>,
    weights: PathBuf,
    verbosity: Verbosity,
}

impl fmt::Debug for DetectMultiBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectMultiBackend")
            .field("weights", &self.weights)
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("num_classes", &self.names.len())
            .finish()
    }
}

impl DetectMultiBackend {
    /// Loads the checkpoint at `weights`.
    pub fn load(weights: &Path, options: &BackendOptions) -> Result<Self, YoloV5Error> {
        let verbosity = options.verbosity;
        let device = options.device.into_device()?;

        // f16 is restricted to accelerators
        let dtype = if options.fp16 && !device.is_cpu() {
            DType::F16
        } else {
            if options.fp16 {
                tracing::warn!("fp16 is not supported on cpu, falling back to fp32");
            }
            DType::F32
        };

        let size = match options.size {
            Some(size) => size,
            None => YoloV5Size::from_path(weights).ok_or_else(|| {
                YoloV5Error::LoadModelError(format!(
                    "cannot infer the model size from {}, set it explicitly",
                    weights.display()
                ))
            })?,
        };

        let format = WeightsFormat::from_path(weights)?;
        let weights = Self::ensure_weights(weights, options.hub_repo.as_deref(), verbosity)?;

        verbose_info!(
            verbosity,
            "loading yolov5{size} from {} on {:?} ({:?})",
            weights.display(),
            device,
            dtype
        );
        let vb = match format {
            WeightsFormat::SafeTensors => unsafe {
                VarBuilder::from_mmaped_safetensors(&[&weights], dtype, &device)?
            },
            WeightsFormat::PyTorch => VarBuilder::from_pth(&weights, dtype, &device)?,
        };
        let model = YoloV5Model::load(vb, size.multiples(), options.num_classes)?;

        let num_classes = model.num_classes();
        let names: Arc<[String]> = match &options.class_names {
            Some(names) if names.len() == num_classes => names.clone().into(),
            Some(names) => {
                return Err(YoloV5Error::LoadModelError(format!(
                    "{} class names given for {num_classes} classes",
                    names.len(),
                )));
            }
            None => coco_classes::default_names(num_classes).into(),
        };

        Ok(Self {
            model,
            device,
            dtype,
            names,
            weights,
            verbosity,
        })
    }

    /// Returns the path of the weights, downloading them first when missing and
    /// a hub repository is configured.
    fn ensure_weights(
        weights: &Path,
        hub_repo: Option<&str>,
        verbosity: Verbosity,
    ) -> Result<PathBuf, YoloV5Error> {
        if weights.exists() {
            return Ok(weights.to_path_buf());
        }
        let Some(repo) = hub_repo else {
            return Err(YoloV5Error::LoadModelError(format!(
                "weights not found: {}",
                weights.display()
            )));
        };
        let file_name = weights
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| YoloV5Error::UnsupportedWeights(weights.to_path_buf()))?;

        verbose_info!(verbosity, "downloading {file_name} from {repo}");
        let cached = hf_hub::api::sync::Api::new()?
            .model(repo.to_string())
            .get(file_name)?;
        std::fs::copy(&cached, weights)?;
        Ok(weights.to_path_buf())
    }

    /// Largest stride of the network, input sizes must be multiples of it.
    pub fn stride(&self) -> usize {
        STRIDES[STRIDES.len() - 1]
    }

    /// Class names indexed by class id.
    pub fn names(&self) -> Arc<[String]> {
        self.names.clone()
    }

    /// Device the weights live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Precision of the weights.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Logging verbosity the backend was loaded with.
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Runs the network on a `(b, 3, h, w)` batch of `[0, 1]` floats.
    ///
    /// Returns `(b, n, 5 + num_classes)` f32 predictions in input pixels. With
    /// `augment` the batch is also run rescaled and flipped and all predictions
    /// are concatenated.
    pub fn forward(&self, xs: &Tensor, augment: bool) -> Result<Tensor, YoloV5Error> {
        let xs = xs.to_device(&self.device)?.to_dtype(self.dtype)?;
        if !augment {
            return Ok(self.model.forward(&xs)?);
        }

        let (_, _, _, w) = xs.dims4()?;
        let preds = AUGMENT_SCALES
            .iter()
            .map(|&(scale, flip)| {
                let xi = if flip { flip_lr(&xs)? } else { xs.clone() };
                let xi = scale_image(&xi, scale, self.stride())?;
                let yi = self.model.forward(&xi)?;
                descale_pred(&yi, scale, flip.then_some(w))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&preds, 1)?)
    }
}

/// Mirrors a `(b, c, h, w)` batch along the width axis.
fn flip_lr(xs: &Tensor) -> candle_core::Result<Tensor> {
    let w = xs.dim(D::Minus1)? as u32;
    let idx: Vec<u32> = (0..w).rev().collect();
    let idx = Tensor::new(idx.as_slice(), xs.device())?;
    xs.index_select(&idx, 3)
}

/// Resizes a batch by `ratio` and pads it back up to a multiple of `stride`.
fn scale_image(xs: &Tensor, ratio: f64, stride: usize) -> candle_core::Result<Tensor> {
    if ratio == 1.0 {
        return Ok(xs.clone());
    }
    let (b, c, h, w) = xs.dims4()?;
    let (sh, sw) = (
        ((h as f64 * ratio) as usize).max(1),
        ((w as f64 * ratio) as usize).max(1),
    );
    let resized = xs.interpolate2d(sh, sw)?;
    let (ph, pw) = (sh.div_ceil(stride) * stride, sw.div_ceil(stride) * stride);
    if (ph, pw) == (sh, sw) {
        return Ok(resized);
    }
    let canvas = Tensor::full(PAD_FILL as f32, (b, c, ph, pw), xs.device())?;
    let canvas = canvas.to_dtype(xs.dtype())?;
    canvas.slice_assign(&[0..b, 0..c, 0..sh, 0..sw], &resized)
}

/// Maps predictions of an augmented pass back to the original frame.
fn descale_pred(
    pred: &Tensor,
    scale: f64,
    flip_width: Option<usize>,
) -> candle_core::Result<Tensor> {
    let xy = pred.narrow(2, 0, 2)?.affine(1. / scale, 0.)?;
    let xy = match flip_width {
        Some(width) => {
            let x = xy.narrow(2, 0, 1)?.affine(-1., width as f64)?;
            Tensor::cat(&[&x, &xy.narrow(2, 1, 1)?], 2)?
        }
        None => xy,
    };
    let wh = pred.narrow(2, 2, 2)?.affine(1. / scale, 0.)?;
    let rest = pred.narrow(2, 4, pred.dim(2)? - 4)?;
    Tensor::cat(&[&xy, &wh, &rest], 2)
}

/// Writes randomly initialized weights of a yolov5n checkpoint.
#[cfg(test)]
pub(crate) fn write_test_weights(path: &Path, num_classes: usize) -> Result<(), YoloV5Error> {
    let varmap = candle_nn::VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    YoloV5Model::load(vb, Multiples::n(), num_classes)?;
    varmap.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_options(num_classes: usize) -> BackendOptions {
        BackendOptions {
            device: DeviceSelector::Cpu,
            num_classes,
            ..Default::default()
        }
    }

    #[test]
    fn test_size_from_path() {
        assert_eq!(
            YoloV5Size::from_path(Path::new("weights/yolov5s.pt")),
            Some(YoloV5Size::S)
        );
        assert_eq!(
            YoloV5Size::from_path(Path::new("YOLOv5x6.safetensors")),
            Some(YoloV5Size::X)
        );
        assert_eq!(YoloV5Size::from_path(Path::new("best.pt")), None);
        assert!(YoloV5Size::try_from("q".to_string()).is_err());
    }

    #[test]
    fn test_weights_format() {
        assert_eq!(
            WeightsFormat::from_path(Path::new("a.safetensors")).ok(),
            Some(WeightsFormat::SafeTensors)
        );
        assert_eq!(
            WeightsFormat::from_path(Path::new("a.pth")).ok(),
            Some(WeightsFormat::PyTorch)
        );
        assert!(matches!(
            WeightsFormat::from_path(Path::new("a.onnx")),
            Err(YoloV5Error::UnsupportedWeights(_))
        ));
    }

    #[test]
    fn test_missing_weights() {
        let path = Path::new("missing/yolov5n.safetensors");
        let result = DetectMultiBackend::load(path, &cpu_options(80));
        assert!(matches!(result, Err(YoloV5Error::LoadModelError(_))));
    }

    #[test]
    fn test_load_and_forward() -> Result<(), YoloV5Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("yolov5n.safetensors");
        write_test_weights(&path, 3)?;

        let backend = DetectMultiBackend::load(&path, &cpu_options(3))?;
        assert_eq!(backend.stride(), 32);
        assert_eq!(backend.dtype(), DType::F32);
        assert_eq!(backend.names().as_ref(), ["class0", "class1", "class2"]);

        let xs = Tensor::rand(0f32, 1f32, (1, 3, 64, 64), &Device::Cpu)?;
        let cells = 8 * 8 + 4 * 4 + 2 * 2;
        assert_eq!(backend.forward(&xs, false)?.dims(), &[1, 3 * cells, 8]);

        // 64 -> 53 -> pad 64, and 64 -> 42 -> pad 64
        assert_eq!(backend.forward(&xs, true)?.dims(), &[1, 9 * cells, 8]);
        Ok(())
    }

    #[test]
    fn test_fp16_falls_back_on_cpu() -> Result<(), YoloV5Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("yolov5n.safetensors");
        write_test_weights(&path, 80)?;

        let options = BackendOptions {
            fp16: true,
            ..cpu_options(80)
        };
        let backend = DetectMultiBackend::load(&path, &options)?;
        assert_eq!(backend.dtype(), DType::F32);
        assert_eq!(backend.names()[0], "person");
        Ok(())
    }

    #[test]
    fn test_class_names_mismatch() -> Result<(), YoloV5Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("yolov5n.safetensors");
        write_test_weights(&path, 2)?;

        let options = BackendOptions {
            class_names: Some(vec!["cat".into()]),
            ..cpu_options(2)
        };
        assert!(matches!(
            DetectMultiBackend::load(&path, &options),
            Err(YoloV5Error::LoadModelError(_))
        ));
        Ok(())
    }

    #[test]
    fn test_flip_and_descale() -> candle_core::Result<()> {
        let xs = Tensor::arange(0f32, 4., &Device::Cpu)?.reshape((1, 1, 1, 4))?;
        let flipped = flip_lr(&xs)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(flipped, vec![3., 2., 1., 0.]);

        let pred = Tensor::new(&[[[10f32, 20., 4., 8., 0.9, 0.5]]], &Device::Cpu)?;
        let out = descale_pred(&pred, 0.5, Some(100))?;
        assert_eq!(
            out.flatten_all()?.to_vec1::<f32>()?,
            vec![80., 40., 8., 16., 0.9, 0.5]
        );
        Ok(())
    }
}
