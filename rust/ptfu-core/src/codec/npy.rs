// rust/ptfu-core/src/codec/npy.rs

use bytes::Bytes;

use super::Decoder;
use crate::error::{DatasetError, Result};
use crate::record::{NdArray, Record};

/// NumPy `.npy` members.
#[derive(Debug, Clone, Copy, Default)]
pub struct NpyDecoder;

impl Decoder for NpyDecoder {
    fn decode(&self, name: &str, data: Bytes) -> Result<Record> {
        let array = NdArray::from_npy(&data)
            .map_err(|e| DatasetError::decode(self.name(), name, e.to_string()))?;
        Ok(Record::array(name, array))
    }

    fn name(&self) -> &'static str {
        "npy"
    }
}
