// rust/ptfu-core/src/record.rs

//! Record model shared by every reader, writer and cache.
//!
//! A [`Record`] is a named payload with an optional class label. Payloads are
//! either decoded numeric arrays ([`NdArray`]) or opaque byte blobs. Arrays are
//! persisted in NPY format so any reader can hand them back unchanged.

use std::io::Cursor;

use bytes::Bytes;
use npyz::WriterBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};

/// Extension used when an array payload is persisted.
pub const NPY_EXTENSION: &str = "npy";

/// Typed element buffer of an [`NdArray`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! impl_from_vec {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Vec<$t>> for ArrayData {
                fn from(values: Vec<$t>) -> Self {
                    ArrayData::$variant(values)
                }
            }
        )*
    };
}

impl_from_vec!(
    u8 => U8,
    u16 => U16,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
);

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::U8(v) => v.len(),
            ArrayData::U16(v) => v.len(),
            ArrayData::I16(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// NumPy-style element type name.
    pub fn dtype_name(&self) -> &'static str {
        match self {
            ArrayData::U8(_) => "uint8",
            ArrayData::U16(_) => "uint16",
            ArrayData::I16(_) => "int16",
            ArrayData::I32(_) => "int32",
            ArrayData::I64(_) => "int64",
            ArrayData::F32(_) => "float32",
            ArrayData::F64(_) => "float64",
        }
    }

    /// Converts every element to `f64`.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            ArrayData::U8(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::U16(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::I16(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::I32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::I64(v) => v.iter().map(|&x| x as f64).collect(),
            ArrayData::F32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::F64(v) => v.clone(),
        }
    }
}

/// Decoded numeric array with a row-major shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl NdArray {
    /// Creates an array, checking that the shape matches the element count.
    ///
    /// # Errors
    ///
    /// Returns a serialization error when `shape` does not describe exactly
    /// `data.len()` elements.
    pub fn new(shape: Vec<usize>, data: impl Into<ArrayData>) -> Result<Self> {
        let data = data.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(DatasetError::serialization(format!(
                "shape {:?} holds {} elements but {} were given",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional array over `values`.
    pub fn from_vec(values: impl Into<ArrayData>) -> Self {
        let data = values.into();
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Encodes the array as an NPY file image.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the NPY writer fails.
    pub fn to_npy(&self) -> Result<Vec<u8>> {
        let shape: Vec<u64> = self.shape.iter().map(|&d| d as u64).collect();
        let encoded = match &self.data {
            ArrayData::U8(v) => write_npy(&shape, v),
            ArrayData::U16(v) => write_npy(&shape, v),
            ArrayData::I16(v) => write_npy(&shape, v),
            ArrayData::I32(v) => write_npy(&shape, v),
            ArrayData::I64(v) => write_npy(&shape, v),
            ArrayData::F32(v) => write_npy(&shape, v),
            ArrayData::F64(v) => write_npy(&shape, v),
        };
        encoded.map_err(|e| DatasetError::serialization(format!("failed to encode npy: {e}")))
    }

    /// Decodes an NPY file image.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed input or an element type
    /// that has no [`ArrayData`] counterpart.
    pub fn from_npy(bytes: &[u8]) -> Result<Self> {
        let npy = npyz::NpyFile::new(Cursor::new(bytes))
            .map_err(|e| DatasetError::serialization(format!("invalid npy header: {e}")))?;
        let shape: Vec<usize> = npy.shape().iter().map(|&d| d as usize).collect();

        let descr = match npy.dtype() {
            npyz::DType::Plain(type_str) => type_str.to_string(),
            other => {
                return Err(DatasetError::serialization(format!(
                    "unsupported npy dtype: {other:?}"
                )))
            }
        };
        // Strip the byte-order mark; npyz converts endianness on read.
        let kind = descr.get(1..).unwrap_or_default();

        let data = match kind {
            "u1" => npy.into_vec::<u8>().map(ArrayData::U8),
            "u2" => npy.into_vec::<u16>().map(ArrayData::U16),
            "i2" => npy.into_vec::<i16>().map(ArrayData::I16),
            "i4" => npy.into_vec::<i32>().map(ArrayData::I32),
            "i8" => npy.into_vec::<i64>().map(ArrayData::I64),
            "f4" => npy.into_vec::<f32>().map(ArrayData::F32),
            "f8" => npy.into_vec::<f64>().map(ArrayData::F64),
            _ => {
                return Err(DatasetError::serialization(format!(
                    "unsupported npy element type '{descr}'"
                )))
            }
        }
        .map_err(|e| DatasetError::serialization(format!("failed to read npy data: {e}")))?;

        Self::new(shape, data)
    }
}

fn write_npy<T>(shape: &[u64], values: &[T]) -> std::io::Result<Vec<u8>>
where
    T: npyz::AutoSerialize + Copy,
{
    let mut buf = Vec::new();
    let mut writer = npyz::WriteOptions::new()
        .default_dtype()
        .shape(shape)
        .writer(&mut buf)
        .begin_nd()?;
    writer.extend(values.iter().copied())?;
    writer.finish()?;
    Ok(buf)
}

/// Record payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Array(NdArray),
    Bytes(Bytes),
}

/// A named payload, unique by name within one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    pub payload: Payload,
    pub label: Option<i64>,
}

impl Record {
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        Self {
            name: name.into(),
            payload,
            label: None,
        }
    }

    pub fn array(name: impl Into<String>, array: NdArray) -> Self {
        Self::new(name, Payload::Array(array))
    }

    pub fn bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(name, Payload::Bytes(data.into()))
    }

    #[must_use]
    pub fn with_label(mut self, label: i64) -> Self {
        self.label = Some(label);
        self
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match &self.payload {
            Payload::Array(a) => Some(a),
            Payload::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Bytes(b) => Some(b),
            Payload::Array(_) => None,
        }
    }

    /// Member name under which `name` is persisted for this payload.
    ///
    /// Arrays get an `.npy` suffix unless `name` already carries it.
    pub fn persisted_name(&self, name: &str) -> String {
        match &self.payload {
            Payload::Array(_) if !has_extension(name, NPY_EXTENSION) => {
                format!("{name}.{NPY_EXTENSION}")
            }
            _ => name.to_string(),
        }
    }

    /// Serialized member content: NPY for arrays, verbatim for bytes.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if NPY encoding fails.
    pub fn persisted_bytes(&self) -> Result<Bytes> {
        match &self.payload {
            Payload::Array(a) => a.to_npy().map(Bytes::from),
            Payload::Bytes(b) => Ok(b.clone()),
        }
    }
}

/// Case-insensitive check for a `.ext` suffix.
pub fn has_extension(name: &str, ext: &str) -> bool {
    if ext.is_empty() {
        return true;
    }
    let suffix_len = ext.len() + 1;
    if name.len() < suffix_len || !name.is_char_boundary(name.len() - suffix_len) {
        return false;
    }
    let suffix = &name[name.len() - suffix_len..];
    suffix.starts_with('.') && suffix[1..].eq_ignore_ascii_case(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ndarray_shape_mismatch() {
        let result = NdArray::new(vec![2, 2], vec![1u8, 2, 3]);
        assert!(result.is_err());

        let array = NdArray::new(vec![2, 2], vec![1u8, 2, 3, 4]).unwrap();
        assert_eq!(array.shape(), &[2, 2]);
        assert_eq!(array.len(), 4);
    }

    #[test]
    fn test_npy_roundtrip_preserves_dtype_and_shape() {
        let array = NdArray::new(vec![2, 3], vec![1.5f32, 2.0, -3.0, 4.0, 5.25, 6.0]).unwrap();
        let bytes = array.to_npy().unwrap();
        assert_eq!(&bytes[..6], b"\x93NUMPY");

        let decoded = NdArray::from_npy(&bytes).unwrap();
        assert_eq!(decoded, array);
        assert_eq!(decoded.data().dtype_name(), "float32");
    }

    #[test]
    fn test_npy_integer_types() {
        let array = NdArray::from_vec(vec![1i64, 2, 3]);
        let decoded = NdArray::from_npy(&array.to_npy().unwrap()).unwrap();
        assert_eq!(decoded.data(), &ArrayData::I64(vec![1, 2, 3]));

        let array = NdArray::new(vec![1, 2], vec![7u16, 9]).unwrap();
        let decoded = NdArray::from_npy(&array.to_npy().unwrap()).unwrap();
        assert_eq!(decoded, array);
    }

    #[test]
    fn test_from_npy_garbage() {
        assert!(NdArray::from_npy(b"not an npy file").is_err());
    }

    #[test]
    fn test_persisted_name() {
        let array = Record::array("a", NdArray::from_vec(vec![1u8]));
        assert_eq!(array.persisted_name("a"), "a.npy");
        assert_eq!(array.persisted_name("a.npy"), "a.npy");
        assert_eq!(array.persisted_name("a.NPY"), "a.NPY");

        let blob = Record::bytes("img.png", b"\x89PNG".to_vec());
        assert_eq!(blob.persisted_name("img.png"), "img.png");
        assert_eq!(blob.persisted_bytes().unwrap().as_ref(), b"\x89PNG");
    }

    #[test]
    fn test_has_extension() {
        assert!(has_extension("x.png", "png"));
        assert!(has_extension("x.PNG", "png"));
        assert!(!has_extension("xpng", "png"));
        assert!(!has_extension("png", "png"));
        assert!(has_extension("anything", ""));
        assert!(has_extension("a.tar.gz", "tar.gz"));
    }

    #[test]
    fn test_record_bincode_roundtrip() {
        let record = Record::array("r", NdArray::from_vec(vec![0.5f64, 1.5])).with_label(3);
        let encoded = bincode::serialize(&record).unwrap();
        let decoded: Record = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.label, Some(3));
    }
}
