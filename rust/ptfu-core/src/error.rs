// rust/ptfu-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Member '{name}' not found in {location}")]
    NotFound {
        name: String,
        location: String,
    },

    #[error("Archive error in {location}: {message}")]
    Archive {
        location: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Failed to decode '{name}' as {datatype}: {message}")]
    Decode {
        datatype: String,
        name: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Record name is missing: pass one explicitly or set it on the record")]
    MissingName,

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },

    #[error("Filter rejected '{name}': {message}")]
    Filter {
        name: String,
        message: String,
    },

    #[error("Queue error: {message}")]
    Queue {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, DatasetError>;

// Convenience constructors
impl DatasetError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn not_found(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self::NotFound {
            name: name.into(),
            location: location.into(),
        }
    }

    pub fn archive(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Archive {
            location: location.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn archive_with_source(
        location: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Archive {
            location: location.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn decode(
        datatype: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Decode {
            datatype: datatype.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn filter(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Filter {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Returns true for the "name absent from source" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
