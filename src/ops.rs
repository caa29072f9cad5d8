//! Reference transforms built on the `image` crate.
//!
//! Every transform reads the source buffer and returns a new one.

use anyhow::{anyhow, bail, Context, Result};
use image::DynamicImage;

use crate::codec;
use crate::session::{ImageBuffer, Transform};
use crate::view::Rect;

fn dynamic_op<F>(name: impl Into<String>, op: F) -> Transform
where
    F: Fn(&DynamicImage) -> Result<DynamicImage> + Send + Sync + 'static,
{
    Transform::new(name, move |input: &ImageBuffer| {
        let source = codec::to_dynamic(input)?;
        let output = op(&source)?;
        Ok(codec::from_dynamic(output)?)
    })
}

pub fn grayscale() -> Transform {
    dynamic_op("grayscale", |img| Ok(img.grayscale()))
}

pub fn invert() -> Transform {
    dynamic_op("invert", |img| {
        let mut out = img.clone();
        out.invert();
        Ok(out)
    })
}

pub fn flip_horizontal() -> Transform {
    dynamic_op("flip-h", |img| Ok(img.fliph()))
}

pub fn flip_vertical() -> Transform {
    dynamic_op("flip-v", |img| Ok(img.flipv()))
}

pub fn rotate90() -> Transform {
    dynamic_op("rotate90", |img| Ok(img.rotate90()))
}

/// `brightness` is added to every channel; `contrast` is in percent, where
/// positive values increase contrast.
pub fn brightness_contrast(brightness: i32, contrast: f32) -> Transform {
    dynamic_op(
        format!("brightness-contrast({brightness},{contrast})"),
        move |img| {
            let mut out = img.brighten(brightness);
            if contrast != 0.0 {
                out = out.adjust_contrast(contrast);
            }
            Ok(out)
        },
    )
}

pub fn crop(rect: Rect) -> Transform {
    dynamic_op(format!("crop({rect:?})"), move |img| {
        let clamped = rect
            .clamp_to(img.width(), img.height())
            .ok_or_else(|| anyhow!("crop {rect:?} is outside the {}x{} image", img.width(), img.height()))?;
        Ok(img.crop_imm(clamped.x, clamped.y, clamped.width, clamped.height))
    })
}

/// Parse an operation as written on the command line.
///
/// Accepted forms: `grayscale`, `invert`, `flip-h`, `flip-v`, `rotate90`,
/// `brightness=N`, `contrast=F`, `crop=X,Y,W,H`.
pub fn parse(spec: &str) -> Result<Transform> {
    let (name, arg) = match spec.split_once('=') {
        Some((name, arg)) => (name.trim(), Some(arg.trim())),
        None => (spec.trim(), None),
    };
    let transform = match (name.to_ascii_lowercase().as_str(), arg) {
        ("grayscale" | "greyscale", None) => grayscale(),
        ("invert", None) => invert(),
        ("flip-h", None) => flip_horizontal(),
        ("flip-v", None) => flip_vertical(),
        ("rotate90", None) => rotate90(),
        ("brightness", Some(arg)) => {
            let value = arg
                .parse::<i32>()
                .with_context(|| format!("invalid brightness '{arg}'"))?;
            brightness_contrast(value, 0.0)
        }
        ("contrast", Some(arg)) => {
            let value = arg
                .parse::<f32>()
                .with_context(|| format!("invalid contrast '{arg}'"))?;
            brightness_contrast(0, value)
        }
        ("crop", Some(arg)) => crop(parse_rect(arg)?),
        _ => bail!("unknown operation '{spec}'"),
    };
    Ok(transform)
}

fn parse_rect(arg: &str) -> Result<Rect> {
    let parts = arg
        .split(',')
        .map(|part| part.trim().parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("invalid crop rectangle '{arg}'"))?;
    match parts.as_slice() {
        [x, y, w, h] => Ok(Rect::new(*x, *y, *w, *h)),
        _ => bail!("crop expects X,Y,W,H, got '{arg}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::{crop, grayscale, invert, parse, rotate90};
    use crate::session::ImageBuffer;
    use crate::view::Rect;

    fn rgb(width: u32, height: u32) -> ImageBuffer {
        let pixels = (0..width * height * 3).map(|i| (i * 10 % 256) as u8).collect();
        ImageBuffer::new(width, height, 3, pixels).expect("rgb")
    }

    #[test]
    fn grayscale_drops_colour_channels() {
        let out = grayscale().run(&rgb(2, 2)).expect("grayscale");
        assert_eq!(out.channels(), 1);
        assert_eq!((out.width(), out.height()), (2, 2));
    }

    #[test]
    fn invert_twice_restores_content() {
        let source = rgb(3, 1);
        let once = invert().run(&source).expect("invert");
        assert_eq!(once.pixels()[0], 255 - source.pixels()[0]);
        let twice = invert().run(&once).expect("invert");
        assert!(twice.same_content(&source));
    }

    #[test]
    fn rotation_swaps_dimensions() {
        let out = rotate90().run(&rgb(3, 2)).expect("rotate");
        assert_eq!((out.width(), out.height()), (2, 3));
    }

    #[test]
    fn crop_outside_image_fails() {
        let err = crop(Rect::new(10, 10, 1, 1)).run(&rgb(2, 2)).expect_err("outside");
        assert!(err.to_string().contains("crop"));
    }

    #[test]
    fn parse_understands_cli_forms() {
        assert_eq!(parse("flip-h").expect("flip").name(), "flip-h");
        assert_eq!(parse(" Grayscale ").expect("gray").name(), "grayscale");
        assert!(parse("crop=0,0,1,1").is_ok());
        assert!(parse("crop=0,0,1").is_err());
        assert!(parse("brightness=abc").is_err());
        assert!(parse("sharpen").is_err());
    }
}
