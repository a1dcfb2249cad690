// rust/ptfu-core/src/lib.rs

//! PTFU dataset core
//!
//! This crate reads training samples out of archives (directories, tar, zip,
//! TFRecord, CIFAR-10 batches and archives nested inside each other), caches
//! decoded records in memory and on disk, builds new datasets through a
//! filter/split/write pipeline and feeds shuffled minibatches to a trainer.

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::PtfuConfig;
pub use error::{DatasetError, Result};

pub mod datatype;
pub mod record;
pub use datatype::DataType;
pub use record::{ArrayData, NdArray, Payload, Record};

pub mod codec;
pub use codec::Decoder;

pub mod queue;
pub use queue::DataQueue;

pub mod cache;
pub use cache::{DiskCache, DiskCacheRegistry, MemCache};

pub mod archive;
pub use archive::{ArchiveReader, ArchiveSource, ArchiveWriter, BatchOutcome, Location};

pub mod storetype;
pub use storetype::{SourceSpec, StoreType};

pub mod creator;
pub use creator::{CreationReport, DatasetCreator, SplitManner};

pub mod feeder;
pub use feeder::{LabelStyle, MinibatchFeeder};
