use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, batch_norm, conv2d, conv2d_no_bias};

/// Default anchors in input pixels, one row of three `(w, h)` pairs per stride.
const DEFAULT_ANCHORS: [[(f32, f32); 3]; 3] = [
    [(10., 13.), (16., 30.), (33., 23.)],
    [(30., 61.), (62., 45.), (59., 119.)],
    [(116., 90.), (156., 198.), (373., 326.)],
];

/// Strides of the three detection levels.
pub const STRIDES: [usize; 3] = [8, 16, 32];

/// Depth and width multiples of a model size.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Multiples {
    depth: f64,
    width: f64,
}

impl Multiples {
    pub fn n() -> Self {
        Self {
            depth: 0.33,
            width: 0.25,
        }
    }
    pub fn s() -> Self {
        Self {
            depth: 0.33,
            width: 0.50,
        }
    }
    pub fn m() -> Self {
        Self {
            depth: 0.67,
            width: 0.75,
        }
    }
    pub fn l() -> Self {
        Self {
            depth: 1.00,
            width: 1.00,
        }
    }
    pub fn x() -> Self {
        Self {
            depth: 1.33,
            width: 1.25,
        }
    }

    /// Output channels of a layer, rounded up to a multiple of 8.
    fn channels(&self, c: usize) -> usize {
        ((c as f64 * self.width) / 8.).ceil() as usize * 8
    }

    /// Number of repeated blocks, at least one.
    fn depth(&self, n: usize) -> usize {
        ((n as f64 * self.depth).round() as usize).max(1)
    }
}

#[derive(Debug)]
struct ConvBlock {
    conv: Conv2d,
}

impl ConvBlock {
    fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        k: usize,
        stride: usize,
        padding: Option<usize>,
    ) -> Result<Self> {
        let padding = padding.unwrap_or(k / 2);
        let cfg = Conv2dConfig {
            padding,
            stride,
            ..Default::default()
        };
        let bn = batch_norm(c2, 1e-3, vb.pp("bn"))?;
        let conv = conv2d_no_bias(c1, c2, k, cfg, vb.pp("conv"))?.absorb_bn(&bn)?;
        Ok(Self { conv })
    }
}

impl Module for ConvBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        candle_nn::ops::silu(&xs)
    }
}

#[derive(Debug)]
struct Bottleneck {
    cv1: ConvBlock,
    cv2: ConvBlock,
    residual: bool,
}

impl Bottleneck {
    fn load(vb: VarBuilder, c1: usize, c2: usize, shortcut: bool) -> Result<Self> {
        let cv1 = ConvBlock::load(vb.pp("cv1"), c1, c2, 1, 1, None)?;
        let cv2 = ConvBlock::load(vb.pp("cv2"), c2, c2, 3, 1, None)?;
        Ok(Self {
            cv1,
            cv2,
            residual: shortcut && c1 == c2,
        })
    }
}

impl Module for Bottleneck {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.cv2.forward(&self.cv1.forward(xs)?)?;
        if self.residual { xs + ys } else { Ok(ys) }
    }
}

/// CSP bottleneck with three convolutions.
#[derive(Debug)]
struct C3 {
    cv1: ConvBlock,
    cv2: ConvBlock,
    cv3: ConvBlock,
    bottlenecks: Vec<Bottleneck>,
}

impl C3 {
    fn load(vb: VarBuilder, c1: usize, c2: usize, n: usize, shortcut: bool) -> Result<Self> {
        let c = c2 / 2;
        let cv1 = ConvBlock::load(vb.pp("cv1"), c1, c, 1, 1, None)?;
        let cv2 = ConvBlock::load(vb.pp("cv2"), c1, c, 1, 1, None)?;
        let cv3 = ConvBlock::load(vb.pp("cv3"), 2 * c, c2, 1, 1, None)?;
        let bottlenecks = (0..n)
            .map(|idx| Bottleneck::load(vb.pp(format!("m.{idx}")), c, c, shortcut))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            cv1,
            cv2,
            cv3,
            bottlenecks,
        })
    }
}

impl Module for C3 {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut ys = self.cv1.forward(xs)?;
        for bottleneck in self.bottlenecks.iter() {
            ys = bottleneck.forward(&ys)?;
        }
        let zs = Tensor::cat(&[&ys, &self.cv2.forward(xs)?], 1)?;
        self.cv3.forward(&zs)
    }
}

/// Spatial pyramid pooling, fast variant.
#[derive(Debug)]
struct Sppf {
    cv1: ConvBlock,
    cv2: ConvBlock,
    k: usize,
}

impl Sppf {
    fn load(vb: VarBuilder, c1: usize, c2: usize, k: usize) -> Result<Self> {
        let c = c1 / 2;
        let cv1 = ConvBlock::load(vb.pp("cv1"), c1, c, 1, 1, None)?;
        let cv2 = ConvBlock::load(vb.pp("cv2"), c * 4, c2, 1, 1, None)?;
        Ok(Self { cv1, cv2, k })
    }

    fn pool(&self, xs: &Tensor) -> Result<Tensor> {
        xs.pad_with_same(2, self.k / 2, self.k / 2)?
            .pad_with_same(3, self.k / 2, self.k / 2)?
            .max_pool2d_with_stride(self.k, 1)
    }
}

impl Module for Sppf {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.cv1.forward(xs)?;
        let y1 = self.pool(&xs)?;
        let y2 = self.pool(&y1)?;
        let y3 = self.pool(&y2)?;
        self.cv2.forward(&Tensor::cat(&[&xs, &y1, &y2, &y3], 1)?)
    }
}

fn upsample(xs: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    xs.upsample_nearest2d(h * 2, w * 2)
}

/// CSP-Darknet backbone, layers 0 to 9.
#[derive(Debug)]
struct DarkNet {
    stem: ConvBlock,
    down1: ConvBlock,
    c3_1: C3,
    down2: ConvBlock,
    c3_2: C3,
    down3: ConvBlock,
    c3_3: C3,
    down4: ConvBlock,
    c3_4: C3,
    sppf: Sppf,
}

impl DarkNet {
    fn load(vb: VarBuilder, m: Multiples) -> Result<Self> {
        let (c1, c2, c3, c4, c5) = (
            m.channels(64),
            m.channels(128),
            m.channels(256),
            m.channels(512),
            m.channels(1024),
        );
        Ok(Self {
            stem: ConvBlock::load(vb.pp("0"), 3, c1, 6, 2, Some(2))?,
            down1: ConvBlock::load(vb.pp("1"), c1, c2, 3, 2, None)?,
            c3_1: C3::load(vb.pp("2"), c2, c2, m.depth(3), true)?,
            down2: ConvBlock::load(vb.pp("3"), c2, c3, 3, 2, None)?,
            c3_2: C3::load(vb.pp("4"), c3, c3, m.depth(6), true)?,
            down3: ConvBlock::load(vb.pp("5"), c3, c4, 3, 2, None)?,
            c3_3: C3::load(vb.pp("6"), c4, c4, m.depth(9), true)?,
            down4: ConvBlock::load(vb.pp("7"), c4, c5, 3, 2, None)?,
            c3_4: C3::load(vb.pp("8"), c5, c5, m.depth(3), true)?,
            sppf: Sppf::load(vb.pp("9"), c5, c5, 5)?,
        })
    }

    /// Returns the P3, P4 and P5 feature maps.
    fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let xs = self.down1.forward(&self.stem.forward(xs)?)?;
        let xs = self.c3_1.forward(&xs)?;
        let p3 = self.c3_2.forward(&self.down2.forward(&xs)?)?;
        let p4 = self.c3_3.forward(&self.down3.forward(&p3)?)?;
        let p5 = self.c3_4.forward(&self.down4.forward(&p4)?)?;
        let p5 = self.sppf.forward(&p5)?;
        Ok((p3, p4, p5))
    }
}

/// PAN neck, layers 10 to 23.
#[derive(Debug)]
struct YoloV5Neck {
    lateral5: ConvBlock,
    c3_up4: C3,
    lateral4: ConvBlock,
    c3_up3: C3,
    down3: ConvBlock,
    c3_down4: C3,
    down4: ConvBlock,
    c3_down5: C3,
}

impl YoloV5Neck {
    fn load(vb: VarBuilder, m: Multiples) -> Result<Self> {
        let (c3, c4, c5) = (m.channels(256), m.channels(512), m.channels(1024));
        let n = m.depth(3);
        Ok(Self {
            lateral5: ConvBlock::load(vb.pp("10"), c5, c4, 1, 1, None)?,
            c3_up4: C3::load(vb.pp("13"), c4 * 2, c4, n, false)?,
            lateral4: ConvBlock::load(vb.pp("14"), c4, c3, 1, 1, None)?,
            c3_up3: C3::load(vb.pp("17"), c3 * 2, c3, n, false)?,
            down3: ConvBlock::load(vb.pp("18"), c3, c3, 3, 2, None)?,
            c3_down4: C3::load(vb.pp("20"), c3 * 2, c4, n, false)?,
            down4: ConvBlock::load(vb.pp("21"), c4, c4, 3, 2, None)?,
            c3_down5: C3::load(vb.pp("23"), c4 * 2, c5, n, false)?,
        })
    }

    fn forward(&self, p3: &Tensor, p4: &Tensor, p5: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let h10 = self.lateral5.forward(p5)?;
        let h13 = self
            .c3_up4
            .forward(&Tensor::cat(&[&upsample(&h10)?, p4], 1)?)?;
        let h14 = self.lateral4.forward(&h13)?;
        let out3 = self
            .c3_up3
            .forward(&Tensor::cat(&[&upsample(&h14)?, p3], 1)?)?;
        let out4 = self
            .c3_down4
            .forward(&Tensor::cat(&[&self.down3.forward(&out3)?, &h14], 1)?)?;
        let out5 = self
            .c3_down5
            .forward(&Tensor::cat(&[&self.down4.forward(&out4)?, &h10], 1)?)?;
        Ok((out3, out4, out5))
    }
}

/// Anchor based detection head, layer 24.
#[derive(Debug)]
struct Detect {
    convs: Vec<Conv2d>,
    /// Anchors in input pixels, shape `(levels, anchors, 2)`.
    anchors: Tensor,
    num_outputs: usize,
}

impl Detect {
    const NUM_ANCHORS: usize = 3;

    fn load(vb: VarBuilder, num_classes: usize, channels: [usize; 3]) -> Result<Self> {
        let num_outputs = num_classes + 5;
        let convs = channels
            .iter()
            .enumerate()
            .map(|(idx, &c)| {
                conv2d(
                    c,
                    Self::NUM_ANCHORS * num_outputs,
                    1,
                    Default::default(),
                    vb.pp(format!("m.{idx}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        // trained weights may carry their own anchors, stored in stride units
        let anchors = if vb.contains_tensor("anchors") {
            let strides = Tensor::new(&STRIDES.map(|s| s as f32), vb.device())?;
            let strides = strides.reshape((3, 1, 1))?;
            vb.get((3, Self::NUM_ANCHORS, 2), "anchors")?
                .to_dtype(DType::F32)?
                .broadcast_mul(&strides)?
        } else {
            let flat: Vec<f32> = DEFAULT_ANCHORS
                .iter()
                .flatten()
                .flat_map(|&(w, h)| [w, h])
                .collect();
            Tensor::from_vec(flat, (3, Self::NUM_ANCHORS, 2), vb.device())?
        };

        Ok(Self {
            convs,
            anchors,
            num_outputs,
        })
    }

    /// Decodes one level into `(b, anchors * h * w, num_outputs)`.
    fn decode(&self, level: usize, xs: &Tensor) -> Result<Tensor> {
        let (b, _, ny, nx) = xs.dims4()?;
        let na = Self::NUM_ANCHORS;
        let no = self.num_outputs;
        let stride = STRIDES[level] as f64;
        let dev = xs.device();

        let ys = self.convs[level]
            .forward(xs)?
            .to_dtype(DType::F32)?
            .reshape((b, na, no, ny, nx))?
            .permute((0, 1, 3, 4, 2))?;
        let ys = candle_nn::ops::sigmoid(&ys)?;

        let gx = Tensor::arange(0u32, nx as u32, dev)?
            .to_dtype(DType::F32)?
            .reshape((1, nx))?
            .broadcast_as((ny, nx))?;
        let gy = Tensor::arange(0u32, ny as u32, dev)?
            .to_dtype(DType::F32)?
            .reshape((ny, 1))?
            .broadcast_as((ny, nx))?;
        let grid = Tensor::stack(&[&gx, &gy], 2)?
            .affine(1., -0.5)?
            .reshape((1, 1, ny, nx, 2))?;
        let anchor_grid = self.anchors.get(level)?.reshape((1, na, 1, 1, 2))?;

        let xy = ys
            .narrow(4, 0, 2)?
            .affine(2., 0.)?
            .broadcast_add(&grid)?
            .affine(stride, 0.)?;
        let wh = ys
            .narrow(4, 2, 2)?
            .affine(2., 0.)?
            .sqr()?
            .broadcast_mul(&anchor_grid)?;
        let rest = ys.narrow(4, 4, no - 4)?;

        Tensor::cat(&[&xy, &wh, &rest], 4)?.reshape((b, na * ny * nx, no))
    }

    fn forward(&self, xs: [&Tensor; 3]) -> Result<Tensor> {
        let levels = xs
            .iter()
            .enumerate()
            .map(|(level, xs)| self.decode(level, xs))
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&levels, 1)
    }
}

/// YOLOv5 network.
#[derive(Debug)]
pub struct YoloV5 {
    net: DarkNet,
    neck: YoloV5Neck,
    head: Detect,
    num_classes: usize,
}

impl YoloV5 {
    /// Builds the network from a var builder rooted at the checkpoint top level.
    pub fn load(vb: VarBuilder, m: Multiples, num_classes: usize) -> Result<Self> {
        let vb = vb.pp("model");
        let net = DarkNet::load(vb.clone(), m)?;
        let neck = YoloV5Neck::load(vb.clone(), m)?;
        let head = Detect::load(
            vb.pp("24"),
            num_classes,
            [m.channels(256), m.channels(512), m.channels(1024)],
        )?;
        Ok(Self {
            net,
            neck,
            head,
            num_classes,
        })
    }

    /// Number of classes predicted by the head.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl Module for YoloV5 {
    /// Returns f32 predictions `(b, n, 5 + num_classes)` as
    /// `cx, cy, w, h, objectness, class scores...` in input pixels.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (p3, p4, p5) = self.net.forward(xs)?;
        let (out3, out4, out5) = self.neck.forward(&p3, &p4, &p5)?;
        self.head.forward([&out3, &out4, &out5])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_multiples() {
        let s = Multiples::s();
        assert_eq!(s.channels(64), 32);
        assert_eq!(s.channels(1024), 512);
        assert_eq!(s.depth(9), 3);
        let n = Multiples::n();
        assert_eq!(n.channels(64), 16);
        assert_eq!(n.depth(3), 1);
        assert_eq!(Multiples::x().channels(64), 80);
        assert_eq!(Multiples::x().depth(9), 12);
        assert_eq!(Multiples::m().depth(6), 4);
    }

    #[test]
    fn test_forward_shape() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = YoloV5::load(vb, Multiples::n(), 4)?;

        let xs = Tensor::zeros((2, 3, 64, 96), DType::F32, &Device::Cpu)?;
        let ys = model.forward(&xs)?;

        let cells = 8 * 12 + 4 * 6 + 2 * 3;
        assert_eq!(ys.dims(), &[2, 3 * cells, 9]);
        assert_eq!(model.num_classes(), 4);
        Ok(())
    }

    #[test]
    fn test_weight_names() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        YoloV5::load(vb, Multiples::n(), 80)?;

        let data = varmap.data().lock().unwrap();
        for name in [
            "model.0.conv.weight",
            "model.0.bn.running_var",
            "model.2.m.0.cv2.conv.weight",
            "model.9.cv2.conv.weight",
            "model.23.cv3.conv.weight",
            "model.24.m.2.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert_eq!(data["model.24.m.0.weight"].dims(), &[255, 64, 1, 1]);
        Ok(())
    }
}
