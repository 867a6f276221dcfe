use crate::error::{PipelineError, Result};
use bbox::Bbox;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb, Rgb32FImage};
use std::str::FromStr;

/// Gray used to pad letterboxed frames.
pub const LETTERBOX_FILL: f32 = 0.5;

/// Packed 8-bit pixel layouts accepted from the media pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Bgr,
    Rgb,
    Bgrx,
    Rgbx,
    Xbgr,
    Xrgb,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Bgr | PixelLayout::Rgb => 3,
            _ => 4,
        }
    }

    /// Byte offsets of the red, green and blue samples inside one pixel.
    pub fn offsets(self) -> [usize; 3] {
        match self {
            PixelLayout::Rgb | PixelLayout::Rgbx => [0, 1, 2],
            PixelLayout::Bgr | PixelLayout::Bgrx => [2, 1, 0],
            PixelLayout::Xrgb => [1, 2, 3],
            PixelLayout::Xbgr => [3, 2, 1],
        }
    }

    /// Row stride of a tightly packed image with rows rounded up to 4 bytes.
    pub fn default_stride(self, width: usize) -> usize {
        (width * self.bytes_per_pixel() + 3) & !3
    }
}

impl FromStr for PixelLayout {
    type Err = PipelineError;

    /// Parses raw video format names such as `BGR` or `xRGB`.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BGR" => Ok(PixelLayout::Bgr),
            "RGB" => Ok(PixelLayout::Rgb),
            "BGRx" => Ok(PixelLayout::Bgrx),
            "RGBx" => Ok(PixelLayout::Rgbx),
            "xBGR" => Ok(PixelLayout::Xbgr),
            "xRGB" => Ok(PixelLayout::Xrgb),
            _ => Err(PipelineError::UnsupportedLayout(s.to_string())),
        }
    }
}

/// RGB image of normalized `f32` samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    image: Rgb32FImage,
}

impl Frame {
    pub fn new(width: usize, height: usize) -> Self {
        Frame {
            image: Rgb32FImage::new(width as u32, height as u32),
        }
    }

    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        Frame {
            image: ImageBuffer::from_pixel(width as u32, height as u32, Rgb([value; 3])),
        }
    }

    pub fn width(&self) -> usize {
        self.image.width() as usize
    }

    pub fn height(&self) -> usize {
        self.image.height() as usize
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width(), self.height())
    }

    /// Samples in row-major, interleaved RGB order.
    pub fn data(&self) -> &[f32] {
        self.image.as_raw()
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut *self.image
    }

    pub fn image(&self) -> &Rgb32FImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Rgb32FImage {
        &mut self.image
    }

    pub fn fill(&mut self, value: f32) {
        self.data_mut().iter_mut().for_each(|v| *v = value);
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize, c: usize) -> f32 {
        self.image.get_pixel(x as u32, y as u32)[c]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: usize, y: usize, c: usize, value: f32) {
        self.image.get_pixel_mut(x as u32, y as u32)[c] = value;
    }

    pub fn set_rgb(&mut self, x: usize, y: usize, rgb: [f32; 3]) {
        self.image.put_pixel(x as u32, y as u32, Rgb(rgb));
    }

    /// Copy `other` into `self`; both must have the same dimensions.
    pub fn copy_from(&mut self, other: &Frame) -> Result<()> {
        if self.dimensions() != other.dimensions() {
            return Err(PipelineError::ResolutionChange {
                from: self.dimensions(),
                to: other.dimensions(),
            });
        }
        self.data_mut().copy_from_slice(other.data());
        Ok(())
    }

    fn check_buffer(&self, len: usize, layout: PixelLayout, stride: usize) -> Result<()> {
        let row = self.width() * layout.bytes_per_pixel();
        let needed = if self.height() == 0 {
            0
        } else {
            stride * (self.height() - 1) + row
        };
        if stride < row || len < needed {
            return Err(PipelineError::BufferTooSmall {
                actual: len,
                height: self.height(),
                stride,
            });
        }
        Ok(())
    }

    /// Fill the frame from a packed pixel buffer.
    pub fn read_packed(&mut self, pixels: &[u8], layout: PixelLayout, stride: usize) -> Result<()> {
        self.check_buffer(pixels.len(), layout, stride)?;
        let bpp = layout.bytes_per_pixel();
        let offsets = layout.offsets();

        for (x, y, px) in self.image.enumerate_pixels_mut() {
            let p = &pixels[y as usize * stride + x as usize * bpp..];
            for (c, offset) in offsets.iter().enumerate() {
                px[c] = p[*offset] as f32 / 255.;
            }
        }
        Ok(())
    }

    /// Write the frame into a packed pixel buffer, leaving padding bytes alone.
    pub fn write_packed(&self, pixels: &mut [u8], layout: PixelLayout, stride: usize) -> Result<()> {
        self.check_buffer(pixels.len(), layout, stride)?;
        let bpp = layout.bytes_per_pixel();
        let offsets = layout.offsets();

        for (x, y, px) in self.image.enumerate_pixels() {
            let p = &mut pixels[y as usize * stride + x as usize * bpp..];
            for (c, offset) in offsets.iter().enumerate() {
                p[*offset] = (px[c] * 255.).round().clamp(0., 255.) as u8;
            }
        }
        Ok(())
    }

    /// Stretch the frame over all of `dst` with bilinear filtering.
    pub fn resize_into(&self, dst: &mut Frame) {
        let (w, h) = dst.image.dimensions();
        if w == 0 || h == 0 || self.image.width() == 0 || self.image.height() == 0 {
            return;
        }
        dst.image = imageops::resize(&self.image, w, h, FilterType::Triangle);
    }

    /// Aspect preserving resize into `dst`, padding with [`LETTERBOX_FILL`].
    pub fn letterbox_into(&self, dst: &mut Frame) -> Letterbox {
        let (net_w, net_h) = dst.dimensions();
        let geometry = Letterbox::new(self.width(), self.height(), net_w, net_h);
        dst.fill(LETTERBOX_FILL);
        if geometry.new_w == 0 || geometry.new_h == 0 || self.width() == 0 || self.height() == 0 {
            return geometry;
        }

        let resized = imageops::resize(
            &self.image,
            geometry.new_w as u32,
            geometry.new_h as u32,
            FilterType::Triangle,
        );
        imageops::replace(
            &mut dst.image,
            &resized,
            geometry.left() as i64,
            geometry.top() as i64,
        );
        geometry
    }
}

/// Where an image lands inside a letterboxed network input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Letterbox {
    pub net_w: usize,
    pub net_h: usize,
    pub new_w: usize,
    pub new_h: usize,
}

impl Letterbox {
    pub fn new(src_w: usize, src_h: usize, net_w: usize, net_h: usize) -> Self {
        let (src_w, src_h) = (src_w.max(1), src_h.max(1));
        let (new_w, new_h) = if (net_w as f32 / src_w as f32) < (net_h as f32 / src_h as f32) {
            (net_w, src_h * net_w / src_w)
        } else {
            (src_w * net_h / src_h, net_h)
        };
        Letterbox {
            net_w,
            net_h,
            new_w,
            new_h,
        }
    }

    pub fn left(&self) -> usize {
        (self.net_w - self.new_w) / 2
    }

    pub fn top(&self) -> usize {
        (self.net_h - self.new_h) / 2
    }

    /// Map a box relative to the network input back onto the source image.
    pub fn correct(&self, b: &mut Bbox) {
        let (net_w, net_h) = (self.net_w as f32, self.net_h as f32);
        let (new_w, new_h) = (self.new_w.max(1) as f32, self.new_h.max(1) as f32);

        b.x = (b.x - (net_w - new_w) / 2. / net_w) / (new_w / net_w);
        b.y = (b.y - (net_h - new_h) / 2. / net_h) / (new_h / net_h);
        b.width *= net_w / new_w;
        b.height *= net_h / new_h;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: usize, height: usize, layout: PixelLayout) -> (Vec<u8>, usize) {
        let stride = layout.default_stride(width);
        let mut pixels = vec![0u8; stride * height];
        for (i, p) in pixels.iter_mut().enumerate() {
            *p = (i * 37 % 256) as u8;
        }
        (pixels, stride)
    }

    #[test]
    fn test_default_stride_rounds_to_four() {
        assert_eq!(PixelLayout::Bgr.default_stride(5), 16);
        assert_eq!(PixelLayout::Bgr.default_stride(4), 12);
        assert_eq!(PixelLayout::Bgrx.default_stride(5), 20);
    }

    #[test]
    fn test_packed_round_trip() {
        for layout in [
            PixelLayout::Bgr,
            PixelLayout::Rgb,
            PixelLayout::Bgrx,
            PixelLayout::Xrgb,
        ] {
            let (width, height) = (5, 3);
            let (pixels, stride) = gradient(width, height, layout);
            let mut frame = Frame::new(width, height);
            frame.read_packed(&pixels, layout, stride).unwrap();

            let mut out = pixels.clone();
            frame.write_packed(&mut out, layout, stride).unwrap();
            assert_eq!(out, pixels, "{:?}", layout);
        }
    }

    #[test]
    fn test_bgr_is_stored_as_rgb() {
        let pixels = [10u8, 20, 30, 0];
        let mut frame = Frame::new(1, 1);
        frame.read_packed(&pixels, PixelLayout::Bgr, 4).unwrap();

        assert_eq!(frame.pixel(0, 0, 0), 30. / 255.);
        assert_eq!(frame.pixel(0, 0, 2), 10. / 255.);
    }

    #[test]
    fn test_layout_from_format_name() {
        assert_eq!("BGR".parse::<PixelLayout>().unwrap(), PixelLayout::Bgr);
        assert_eq!("xRGB".parse::<PixelLayout>().unwrap(), PixelLayout::Xrgb);
        assert!(matches!(
            "I420".parse::<PixelLayout>(),
            Err(PipelineError::UnsupportedLayout(name)) if name == "I420"
        ));
        assert!("bgr".parse::<PixelLayout>().is_err());
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let mut frame = Frame::new(4, 4);
        let pixels = vec![0u8; 40];
        assert!(matches!(
            frame.read_packed(&pixels, PixelLayout::Bgr, 12),
            Err(PipelineError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_letterbox_geometry() {
        let lb = Letterbox::new(64, 48, 32, 32);
        assert_eq!((lb.new_w, lb.new_h), (32, 24));
        assert_eq!((lb.left(), lb.top()), (0, 4));

        let tall = Letterbox::new(48, 64, 32, 32);
        assert_eq!((tall.new_w, tall.new_h), (24, 32));
        assert_eq!((tall.left(), tall.top()), (4, 0));
    }

    #[test]
    fn test_letterbox_pads_with_gray() {
        let src = Frame::filled(64, 48, 1.);
        let mut dst = Frame::new(32, 32);
        src.letterbox_into(&mut dst);

        assert_eq!(dst.pixel(10, 0, 0), LETTERBOX_FILL);
        assert_eq!(dst.pixel(10, 3, 1), LETTERBOX_FILL);
        assert!((dst.pixel(10, 4, 2) - 1.).abs() < 1e-5);
        assert!((dst.pixel(31, 27, 0) - 1.).abs() < 1e-5);
        assert_eq!(dst.pixel(31, 28, 0), LETTERBOX_FILL);
    }

    #[test]
    fn test_correct_undoes_letterbox() {
        let lb = Letterbox::new(64, 48, 32, 32);
        // centre of the image, 0.2 of the network input on each side
        let mut b = Bbox::new(0.5, 0.5, 0.2, 0.2);
        lb.correct(&mut b);

        assert!((b.x - 0.5).abs() < 1e-6);
        assert!((b.y - 0.5).abs() < 1e-6);
        assert!((b.width - 0.2).abs() < 1e-6);
        assert!((b.height - 0.2 * 32. / 24.).abs() < 1e-6);
    }

    #[test]
    fn test_resize_keeps_constant_image() {
        let src = Frame::filled(7, 5, 0.25);
        let mut dst = Frame::new(3, 9);
        src.resize_into(&mut dst);
        assert_eq!(dst.dimensions(), (3, 9));
        assert!(dst.data().iter().all(|v| (*v - 0.25).abs() < 1e-5));
    }
}
