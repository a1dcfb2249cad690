// rust/ptfu-core/src/codec/cifar10.rs

use bytes::Bytes;

use super::Decoder;
use crate::error::{DatasetError, Result};
use crate::record::{NdArray, Record};

/// Image side length of a CIFAR-10 entry.
pub const CIFAR10_SIDE: usize = 32;
const PLANE: usize = CIFAR10_SIDE * CIFAR10_SIDE;

/// One label byte followed by three 32x32 colour planes.
pub const CIFAR10_ENTRY_SIZE: usize = 1 + 3 * PLANE;

/// A single CIFAR-10 binary batch entry, decoded to `[32, 32, 3]` plus label.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cifar10Decoder;

impl Decoder for Cifar10Decoder {
    fn decode(&self, name: &str, data: Bytes) -> Result<Record> {
        if data.len() != CIFAR10_ENTRY_SIZE {
            return Err(DatasetError::decode(
                self.name(),
                name,
                format!(
                    "entry is {} bytes, expected {CIFAR10_ENTRY_SIZE}",
                    data.len()
                ),
            ));
        }

        let label = i64::from(data[0]);
        let planes = &data[1..];
        // CHW -> HWC
        let mut pixels = vec![0u8; 3 * PLANE];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            for (c, value) in px.iter_mut().enumerate() {
                *value = planes[c * PLANE + i];
            }
        }

        let array = NdArray::new(vec![CIFAR10_SIDE, CIFAR10_SIDE, 3], pixels)?;
        Ok(Record::array(name, array).with_label(label))
    }

    fn name(&self) -> &'static str {
        "cifar10"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ArrayData;

    #[test]
    fn test_decode_entry_transposes_planes() {
        let mut entry = vec![0u8; CIFAR10_ENTRY_SIZE];
        entry[0] = 6;
        // pixel (0, 1): red, green, blue planes
        entry[1 + 1] = 11;
        entry[1 + PLANE + 1] = 22;
        entry[1 + 2 * PLANE + 1] = 33;

        let record = Cifar10Decoder.decode("00000", Bytes::from(entry)).unwrap();
        assert_eq!(record.label, Some(6));
        let array = record.as_array().unwrap();
        assert_eq!(array.shape(), &[32, 32, 3]);
        match array.data() {
            ArrayData::U8(px) => assert_eq!(&px[3..6], &[11, 22, 33]),
            other => panic!("unexpected data {other:?}"),
        }
    }

    #[test]
    fn test_decode_wrong_size() {
        let result = Cifar10Decoder.decode("short", Bytes::from(vec![0u8; 10]));
        assert!(result.is_err());
    }
}
