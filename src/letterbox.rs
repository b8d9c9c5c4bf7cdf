use kornia_image::{Image, ImageSize};
use kornia_imgproc::{interpolation::InterpolationMode, resize::resize_fast};

use crate::{BoundingBox, YoloV5Error};

/// Gray level used for the padding border.
const PAD_VALUE: u8 = 114;

/// Rounds `num / den` up to the next multiple of `divisor`, never below
/// `divisor`.
fn make_divisible(num: usize, den: usize, divisor: usize) -> usize {
    (num.div_ceil(den.max(1) * divisor) * divisor).max(divisor)
}

/// Common inference size `(height, width)` of a batch.
///
/// Every image is scaled so its longest side equals `size`, then the per axis
/// maximum of the batch is rounded up to a multiple of `stride`. Scaled sides
/// stay exact fractions until the rounding, so `32.5` becomes `64` at stride
/// 32.
pub fn inference_shape(shapes: &[ImageSize], size: usize, stride: usize) -> (usize, usize) {
    shapes.iter().fold((stride, stride), |(h, w), s| {
        let longest = s.height.max(s.width);
        (
            h.max(make_divisible(s.height * size, longest, stride)),
            w.max(make_divisible(s.width * size, longest, stride)),
        )
    })
}

/// Resizes `image` to fit `(height, width)` keeping its aspect ratio and pads
/// the remaining border, centering the content.
pub fn letterbox(
    image: &Image<u8, 3>,
    (height, width): (usize, usize),
) -> Result<Image<u8, 3>, YoloV5Error> {
    let (h0, w0) = (image.height(), image.width());
    let r = (height as f32 / h0 as f32).min(width as f32 / w0 as f32);
    let new_w = ((w0 as f32 * r).round() as usize).clamp(1, width);
    let new_h = ((h0 as f32 * r).round() as usize).clamp(1, height);

    let mut resized = Image::from_size_val(
        ImageSize {
            width: new_w,
            height: new_h,
        },
        0,
    )?;
    resize_fast(image, &mut resized, InterpolationMode::Bilinear)?;

    let dw = (width - new_w) as f32 / 2.;
    let dh = (height - new_h) as f32 / 2.;
    let top = (dh - 0.1).round().max(0.) as usize;
    let left = (dw - 0.1).round().max(0.) as usize;

    let mut data = vec![PAD_VALUE; height * width * 3];
    let src = resized.as_slice();
    for y in 0..new_h {
        let dst_start = ((top + y) * width + left) * 3;
        let src_start = y * new_w * 3;
        data[dst_start..dst_start + new_w * 3]
            .copy_from_slice(&src[src_start..src_start + new_w * 3]);
    }

    Ok(Image::new(ImageSize { width, height }, data)?)
}

/// Maps a box from the letterboxed `(height, width)` frame back to `original`
/// coordinates, clipping it to the image.
pub fn scale_box(
    bbox: &BoundingBox,
    (height, width): (usize, usize),
    original: ImageSize,
) -> BoundingBox {
    let (h0, w0) = (original.height as f32, original.width as f32);
    let gain = (height as f32 / h0).min(width as f32 / w0);
    let pad_x = (width as f32 - w0 * gain) / 2.;
    let pad_y = (height as f32 - h0 * gain) / 2.;

    BoundingBox {
        xmin: ((bbox.xmin - pad_x) / gain).clamp(0., w0),
        ymin: ((bbox.ymin - pad_y) / gain).clamp(0., h0),
        xmax: ((bbox.xmax - pad_x) / gain).clamp(0., w0),
        ymax: ((bbox.ymax - pad_y) / gain).clamp(0., h0),
        ..*bbox
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(width: usize, height: usize) -> ImageSize {
        ImageSize { width, height }
    }

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(640, 1, 32), 640);
        assert_eq!(make_divisible(481, 1, 32), 512);
        assert_eq!(make_divisible(0, 1, 32), 32);
        assert_eq!(make_divisible(65 * 64, 128, 32), 64);
    }

    #[test]
    fn test_inference_shape() {
        assert_eq!(inference_shape(&[size(640, 480)], 640, 32), (480, 640));
        assert_eq!(inference_shape(&[size(1280, 500)], 640, 32), (256, 640));
        // portrait and landscape images share one padded shape
        assert_eq!(
            inference_shape(&[size(640, 480), size(300, 600)], 640, 32),
            (640, 640)
        );
        assert_eq!(inference_shape(&[], 640, 32), (32, 32));
    }

    #[test]
    fn test_inference_shape_rounds_up_fractional_sides() {
        // 128x65 at size 64 scales to 64x32.5, the half pixel needs another stride
        assert_eq!(inference_shape(&[size(128, 65)], 64, 32), (64, 64));
        assert_eq!(inference_shape(&[size(128, 64)], 64, 32), (32, 64));
        assert_eq!(inference_shape(&[size(1000, 333)], 640, 32), (224, 640));
    }

    #[test]
    fn test_letterbox_pads_short_side() -> Result<(), YoloV5Error> {
        let image = Image::from_size_val(size(20, 10), 255)?;
        let boxed = letterbox(&image, (32, 32))?;
        assert_eq!((boxed.width(), boxed.height()), (32, 32));

        let data = boxed.as_slice();
        let pixel = |x: usize, y: usize| data[(y * 32 + x) * 3];
        // 20x10 scales to 32x16, centered vertically with 8 rows of padding
        assert_eq!(pixel(0, 0), PAD_VALUE);
        assert_eq!(pixel(16, 7), PAD_VALUE);
        assert!(pixel(16, 8) > 200);
        assert!(pixel(16, 23) > 200);
        assert_eq!(pixel(16, 24), PAD_VALUE);
        Ok(())
    }

    #[test]
    fn test_scale_box_round_trip() {
        // 20x10 image letterboxed into 32x32: gain 1.6, 8 px vertical padding
        let bbox = BoundingBox {
            xmin: 16.,
            ymin: 16.,
            xmax: 32.,
            ymax: 40.,
            confidence: 0.7,
            class: 3,
        };
        let scaled = scale_box(&bbox, (32, 32), size(20, 10));
        let close = |a: f32, b: f32| (a - b).abs() < 1e-4;
        assert!(close(scaled.xmin, 10.));
        assert!(close(scaled.ymin, 5.));
        assert!(close(scaled.xmax, 20.));
        assert_eq!(scaled.ymax, 10.);
        assert_eq!(scaled.class, 3);
    }
}
