// rust/ptfu-core/src/codec/image.rs

use bytes::Bytes;
use image::{DynamicImage, ImageFormat};

use super::Decoder;
use crate::error::{DatasetError, Result};
use crate::record::{NdArray, Record};

/// PNG and JPEG members, decoded to `u8` pixel arrays.
///
/// Grayscale images become `[h, w]`, images with alpha `[h, w, 4]` and
/// everything else `[h, w, 3]`.
#[derive(Debug, Clone, Copy)]
pub struct ImageDecoder {
    format: ImageFormat,
}

impl ImageDecoder {
    pub const PNG: ImageDecoder = ImageDecoder {
        format: ImageFormat::Png,
    };
    pub const JPEG: ImageDecoder = ImageDecoder {
        format: ImageFormat::Jpeg,
    };
}

fn to_array(img: DynamicImage) -> Result<NdArray> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let color = img.color();
    if color.has_alpha() {
        NdArray::new(vec![h, w, 4], img.into_rgba8().into_raw())
    } else if color.channel_count() == 1 {
        NdArray::new(vec![h, w], img.into_luma8().into_raw())
    } else {
        NdArray::new(vec![h, w, 3], img.into_rgb8().into_raw())
    }
}

impl Decoder for ImageDecoder {
    fn decode(&self, name: &str, data: Bytes) -> Result<Record> {
        let img = image::load_from_memory_with_format(&data, self.format)
            .map_err(|e| DatasetError::decode(self.name(), name, e.to_string()))?;
        Ok(Record::array(name, to_array(img)?))
    }

    fn name(&self) -> &'static str {
        match self.format {
            ImageFormat::Png => "png",
            _ => "jpg",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ArrayData;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode(img: DynamicImage, format: ImageFormat) -> Bytes {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        Bytes::from(buf.into_inner())
    }

    #[test]
    fn test_decode_rgb_png() {
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(2, 1, Rgb([0, 0, 255]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);

        let record = ImageDecoder::PNG.decode("img", bytes).unwrap();
        let array = record.as_array().unwrap();
        assert_eq!(array.shape(), &[2, 3, 3]);
        match array.data() {
            ArrayData::U8(px) => {
                assert_eq!(&px[0..3], &[255, 0, 0]);
                assert_eq!(&px[15..18], &[0, 0, 255]);
            }
            other => panic!("unexpected data {other:?}"),
        }
    }

    #[test]
    fn test_decode_gray_png() {
        let img = GrayImage::from_pixel(4, 5, Luma([7]));
        let bytes = encode(DynamicImage::ImageLuma8(img), ImageFormat::Png);

        let record = ImageDecoder::PNG.decode("gray", bytes).unwrap();
        let array = record.as_array().unwrap();
        assert_eq!(array.shape(), &[5, 4]);
        assert_eq!(array.data(), &ArrayData::U8(vec![7; 20]));
    }

    #[test]
    fn test_decode_jpeg_shape() {
        let img = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Jpeg);

        let record = ImageDecoder::JPEG.decode("photo", bytes).unwrap();
        assert_eq!(record.as_array().unwrap().shape(), &[8, 8, 3]);
    }

    #[test]
    fn test_decode_invalid_image() {
        let result = ImageDecoder::PNG.decode("bad", Bytes::from_static(b"not a png"));
        assert!(matches!(result, Err(DatasetError::Decode { .. })));
    }
}
