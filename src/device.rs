use std::{fmt, str::FromStr};

use candle_core::Device;

use crate::YoloV5Error;

/// Reports which accelerators can be used by the running process.
pub trait AcceleratorProbe {
    /// Whether a CUDA device can be created.
    fn cuda_available(&self) -> bool;
    /// Whether a Metal device can be created.
    fn metal_available(&self) -> bool;
}

/// Probe backed by the accelerators candle was compiled with.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl AcceleratorProbe for SystemProbe {
    fn cuda_available(&self) -> bool {
        candle_core::utils::cuda_is_available()
    }

    fn metal_available(&self) -> bool {
        candle_core::utils::metal_is_available()
    }
}

/// Compute device a model is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// First available accelerator, otherwise the CPU.
    #[default]
    Auto,
    /// General purpose compute.
    Cpu,
    /// CUDA device with the given ordinal.
    Cuda(usize),
    /// Metal device with the given ordinal.
    Metal(usize),
}

impl DeviceSelector {
    /// Parses an optional device string, `None` meaning [`DeviceSelector::Auto`].
    pub fn from_option(device: Option<&str>) -> Result<Self, YoloV5Error> {
        device.map_or(Ok(Self::Auto), str::parse::<Self>)
    }

    /// Turns [`DeviceSelector::Auto`] into a concrete selector.
    ///
    /// CUDA is preferred over Metal. Concrete selectors are returned unchanged.
    pub fn resolve(self, probe: &impl AcceleratorProbe) -> Self {
        match self {
            Self::Auto if probe.cuda_available() => Self::Cuda(0),
            Self::Auto if probe.metal_available() => Self::Metal(0),
            Self::Auto => Self::Cpu,
            concrete => concrete,
        }
    }

    /// Whether the selector targets an accelerator.
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Self::Cuda(_) | Self::Metal(_))
    }

    /// Creates the candle device, resolving `Auto` against the system first.
    pub fn into_device(self) -> Result<Device, YoloV5Error> {
        match self.resolve(&SystemProbe) {
            Self::Cpu | Self::Auto => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|e| {
                YoloV5Error::InvalidDevice(format!("failed to create cuda:{ordinal}: {e}"))
            }),
            Self::Metal(ordinal) => Device::new_metal(ordinal).map_err(|e| {
                YoloV5Error::InvalidDevice(format!("failed to create metal:{ordinal}: {e}"))
            }),
        }
    }
}

fn parse_ordinal(s: &str, original: &str) -> Result<usize, YoloV5Error> {
    s.trim()
        .parse()
        .map_err(|_| YoloV5Error::InvalidDevice(format!("invalid device ordinal in '{original}'")))
}

impl FromStr for DeviceSelector {
    type Err = YoloV5Error;

    /// Accepted forms: `cpu`, `cuda`, `gpu`, `cuda:N`, `N`, `mps`, `metal`, `metal:N`.
    /// Automatic selection has no string form, it is only reached through
    /// [`DeviceSelector::from_option`] with `None`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Ok(match lower.as_str() {
            "cpu" => Self::Cpu,
            "cuda" | "gpu" => Self::Cuda(0),
            "mps" | "metal" => Self::Metal(0),
            other => {
                if let Some(ordinal) = other.strip_prefix("cuda:") {
                    Self::Cuda(parse_ordinal(ordinal, s)?)
                } else if let Some(ordinal) = other.strip_prefix("metal:") {
                    Self::Metal(parse_ordinal(ordinal, s)?)
                } else if !other.is_empty() && other.chars().all(|c| c.is_ascii_digit()) {
                    Self::Cuda(parse_ordinal(other, s)?)
                } else {
                    return Err(YoloV5Error::InvalidDevice(format!("unknown device '{s}'")));
                }
            }
        })
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}
