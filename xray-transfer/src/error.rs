//! Error types for the classifier.

use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A backbone name outside the supported set.
    #[error("unsupported backbone: {0} (expected ResNet50V2, MobileNetV2 or VGG16)")]
    UnsupportedBackbone(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything surfaced by libtorch: shape mismatches, missing weight
    /// files, device failures. Propagated, not mediated.
    #[error("torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("image error: {0}")]
    Image(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("training error: {0}")]
    Training(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err.to_string())
    }
}

impl Error {
    pub fn dataset(path: &Path, message: &str) -> Self {
        Error::Dataset(format!("{}: {}", path.display(), message))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_backbone_display() {
        let err = Error::UnsupportedBackbone("ResNet34".to_string());
        assert!(err.to_string().contains("ResNet34"));
        assert!(err.to_string().contains("VGG16"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
