use thiserror::Error;

use crate::pickle::PickleError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // IO and codec errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Pickle error: {0}")]
    Pickle(#[from] PickleError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    // Archive layout
    #[error("Unexpected archive layout: {0}")]
    UnexpectedLayout(String),

    #[error("{split} set has {rows} samples but {labels} labels")]
    LabelCountMismatch {
        split: &'static str,
        rows: usize,
        labels: usize,
    },

    #[error("{split} set has {found} columns, expected {expected}")]
    ColumnMismatch {
        split: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Label {0} does not fit in a byte")]
    LabelOutOfRange(i64),

    // Batching
    #[error("Batching needs {needed} rows but only {available} are available")]
    NotEnoughRows { needed: usize, available: usize },

    #[error("Batch {0} would contain no rows")]
    EmptyBatch(usize),

    #[error("Malformed label file: {0}")]
    MalformedLabelFile(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
