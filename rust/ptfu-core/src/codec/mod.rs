// rust/ptfu-core/src/codec/mod.rs

//! Member decoders.
//!
//! Every [`DataType`](crate::datatype::DataType) is bound to exactly one
//! [`Decoder`] that turns the raw bytes of an archive member into a
//! [`Record`].

mod cifar10;
mod dicom;
mod image;
mod npy;
mod pickle;

pub use self::cifar10::{Cifar10Decoder, CIFAR10_ENTRY_SIZE, CIFAR10_SIDE};
pub use self::dicom::DicomDecoder;
pub use self::image::ImageDecoder;
pub use self::npy::NpyDecoder;
pub use self::pickle::PickleDecoder;

use bytes::Bytes;

use crate::error::Result;
use crate::record::Record;

/// Turns raw member bytes into a record.
pub trait Decoder: Send + Sync {
    /// Decode `data` into a record named `name`.
    fn decode(&self, name: &str, data: Bytes) -> Result<Record>;

    /// Name of the format this decoder reads
    fn name(&self) -> &'static str;
}

/// Keeps member bytes as an opaque payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    fn decode(&self, name: &str, data: Bytes) -> Result<Record> {
        Ok(Record::bytes(name, data))
    }

    fn name(&self) -> &'static str {
        "raw"
    }
}
