use crate::{layers::check_channels, normalize::IMAGE_CHANNELS, Dims, Error};
use ndarray::Array4;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// The dimensions an image of `width`x`height` is scaled to so its shorter
/// edge becomes `edge`, keeping the aspect ratio. The longer edge is
/// truncated, the same way torchvision's `Resize(int)` does it.
pub fn shorter_edge_dims(width: u32, height: u32, edge: u32) -> Dims {
    let scale = |long: u32, short: u32| {
        let long = (u64::from(edge) * u64::from(long) / u64::from(short.max(1))) as u32;
        long.max(1)
    };

    if width <= height {
        Dims::new(edge, scale(height, width))
    } else {
        Dims::new(scale(width, height), edge)
    }
}

/// Loads an image as RGB and scales it so its shorter edge is `edge` pixels.
pub(crate) fn load_image(src: ImageSource<'_>, edge: u32) -> Result<image::RgbImage, Error> {
    let img = load_dynamic_image(src)?.to_rgb();
    let dims = shorter_edge_dims(img.width(), img.height(), edge);

    Ok(resize(img, dims))
}

/// Loads an image as RGB and scales it to exactly `dims`.
pub(crate) fn load_image_exact(src: ImageSource<'_>, dims: Dims) -> Result<image::RgbImage, Error> {
    let img = load_dynamic_image(src)?.to_rgb();
    Ok(resize(img, dims))
}

fn resize(img: image::RgbImage, dims: Dims) -> image::RgbImage {
    if img.width() == dims.width && img.height() == dims.height {
        img
    } else {
        image::imageops::resize(&img, dims.width, dims.height, image::imageops::Triangle)
    }
}

/// Converts an RGB image into a `[1, 3, height, width]` tensor in `[0, 1]`
pub fn image_to_tensor(img: &image::RgbImage) -> Array4<f32> {
    let (width, height) = img.dimensions();

    Array4::from_shape_fn(
        (1, IMAGE_CHANNELS, height as usize, width as usize),
        |(_, c, y, x)| f32::from(img.get_pixel(x as u32, y as u32)[c]) / 255.0,
    )
}

/// Converts a `[1, 3, height, width]` tensor back into an RGB image, values
/// outside of `[0, 1]` are saturated.
pub fn tensor_to_image(tensor: &Array4<f32>) -> Result<image::RgbImage, Error> {
    check_channels("image tensor", tensor, IMAGE_CHANNELS)?;

    let (_, _, height, width) = tensor.dim();
    let to_byte = |v: f32| (v.max(0.0).min(1.0) * 255.0).round() as u8;

    Ok(image::RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        image::Rgb([
            to_byte(tensor[[0, 0, y, x]]),
            to_byte(tensor[[0, 1, y, x]]),
            to_byte(tensor[[0, 2, y, x]]),
        ])
    }))
}

/// Uniform noise in `[0, 1]`, the same seed always produces the same image
pub(crate) fn noise_tensor(dims: Dims, seed: u64) -> Array4<f32> {
    let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);

    Array4::from_shape_simple_fn(
        (1, IMAGE_CHANNELS, dims.height as usize, dims.width as usize),
        || rng.gen_range(0.0..=1.0),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shorter_edge_is_scaled() {
        assert_eq!(shorter_edge_dims(1024, 768, 512), Dims::new(682, 512));
        assert_eq!(shorter_edge_dims(300, 900, 100), Dims::new(100, 300));
        assert_eq!(shorter_edge_dims(64, 64, 32), Dims::square(32));
        // extreme aspect ratios still keep at least one pixel
        assert_eq!(shorter_edge_dims(1, 1000, 4), Dims::new(4, 4000));
        assert_eq!(shorter_edge_dims(1000, 1, 1), Dims::new(1000, 1));
    }

    #[test]
    fn tensor_layout() {
        let img = image::RgbImage::from_fn(3, 2, |x, y| image::Rgb([x as u8 * 100, y as u8 * 255, 51]));
        let t = image_to_tensor(&img);

        assert_eq!(t.shape(), &[1, 3, 2, 3]);
        assert!((t[[0, 0, 1, 2]] - 200.0 / 255.0).abs() < 1e-6);
        assert_eq!(t[[0, 1, 1, 0]], 1.0);
        assert!((t[[0, 2, 0, 0]] - 0.2).abs() < 1e-6);

        assert_eq!(tensor_to_image(&t).unwrap(), img);
    }

    #[test]
    fn saturates_out_of_range() {
        let t = Array4::from_shape_vec((1, 3, 1, 1), vec![-0.5, 2.0, 0.5]).unwrap();
        let img = tensor_to_image(&t).unwrap();
        assert_eq!(img.get_pixel(0, 0), &image::Rgb([0, 255, 128]));

        assert!(tensor_to_image(&Array4::zeros((1, 4, 1, 1))).is_err());
    }

    #[test]
    fn loads_and_resizes() {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(40, 20, image::Rgb([10, 20, 30])));

        let loaded = load_image(ImageSource::from(img.clone()), 10).unwrap();
        assert_eq!(loaded.dimensions(), (20, 10));
        // a solid image stays solid, up to rounding of the filter weights
        for (got, want) in loaded.get_pixel(5, 5).0.iter().zip(&[10u8, 20, 30]) {
            assert!((i16::from(*got) - i16::from(*want)).abs() <= 1);
        }

        let exact = load_image_exact(ImageSource::from(img), Dims::new(7, 9)).unwrap();
        assert_eq!(exact.dimensions(), (7, 9));
    }

    #[test]
    fn noise_is_seeded() {
        let a = noise_tensor(Dims::new(4, 3), 7);
        assert_eq!(a, noise_tensor(Dims::new(4, 3), 7));
        assert_ne!(a, noise_tensor(Dims::new(4, 3), 8));
        assert_eq!(a.shape(), &[1, 3, 3, 4]);
        assert!(a.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
