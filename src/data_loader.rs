use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use log::{debug, info};
use ndarray::{Array2, ShapeBuilder};

use super::common::*;
use super::error::{Error, Result};
use super::pickle::{self, NdArray, Value};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Reads the `(train, validation, test)` archive, each split a pickled
/// `(images, labels)` pair of numpy arrays. Gzip compression is detected
/// from the magic bytes.
pub fn load_mnist(path: &Path) -> Result<Dataset> {
    info!("Loading {:?}", path);
    let mut reader = BufReader::new(File::open(path)?);
    let compressed = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    let value = if compressed {
        pickle::from_reader(GzDecoder::new(reader))?
    } else {
        debug!("{:?} is not gzip compressed, reading a raw pickle", path);
        pickle::from_reader(reader)?
    };
    dataset_from_value(value)
}

pub fn load_mnist_from_reader<R: Read>(reader: R) -> Result<Dataset> {
    dataset_from_value(pickle::from_reader(reader)?)
}

fn dataset_from_value(value: Value) -> Result<Dataset> {
    let splits = value
        .as_items()
        .ok_or_else(|| Error::UnexpectedLayout("top-level object is not a sequence".into()))?;
    let [train, validation, test] = splits else {
        return Err(Error::UnexpectedLayout(format!(
            "expected 3 splits, found {}",
            splits.len()
        )));
    };

    let train = split_from_value(train, "training")?;
    let validation = split_from_value(validation, "validation")?;
    let test = split_from_value(test, "test")?;

    let width = train.images().ncols();
    for (name, split) in [("validation", &validation), ("test", &test)] {
        if split.images().ncols() != width {
            return Err(Error::ColumnMismatch {
                split: name,
                expected: width,
                found: split.images().ncols(),
            });
        }
    }

    let data = Dataset { train, validation, test };
    for (name, split) in data.splits() {
        info!("{} set: {} samples of {} pixels", name, split.len(), width);
    }
    Ok(data)
}

fn split_from_value(value: &Value, name: &'static str) -> Result<Split> {
    let pair = value
        .as_items()
        .ok_or_else(|| Error::UnexpectedLayout(format!("{} set is not a sequence", name)))?;
    let [images, labels] = pair else {
        return Err(Error::UnexpectedLayout(format!(
            "{} set has {} members, expected (images, labels)",
            name,
            pair.len()
        )));
    };

    let images = images_from_value(images, name)?;
    let labels = labels_from_value(labels, name)?;
    if images.nrows() != labels.len() {
        return Err(Error::LabelCountMismatch {
            split: name,
            rows: images.nrows(),
            labels: labels.len(),
        });
    }
    Ok(Split::new(images, labels))
}

fn array<'a>(value: &'a Value, name: &str, what: &str) -> Result<&'a NdArray> {
    match value {
        Value::Array(array) => Ok(array),
        _ => Err(Error::UnexpectedLayout(format!("{} {} are not a numpy array", name, what))),
    }
}

fn images_from_value(value: &Value, name: &str) -> Result<A2> {
    let array = array(value, name, "images")?;
    let (rows, cols) = match array.shape[..] {
        [rows, cols] => (rows, cols),
        _ => {
            return Err(Error::UnexpectedLayout(format!(
                "{} images have shape {:?}, expected 2 dimensions",
                name, array.shape
            )))
        }
    };
    debug!("{} images: {}x{} {}", name, rows, cols, array.dtype.descr());

    let data = array.to_f32()?;
    let images = if array.fortran_order {
        Array2::from_shape_vec((rows, cols).f(), data)?
            .as_standard_layout()
            .into_owned()
    } else {
        Array2::from_shape_vec((rows, cols), data)?
    };
    Ok(images)
}

fn labels_from_value(value: &Value, name: &str) -> Result<Vec<u8>> {
    let array = array(value, name, "labels")?;
    if array.shape.len() != 1 {
        return Err(Error::UnexpectedLayout(format!(
            "{} labels have shape {:?}, expected 1 dimension",
            name, array.shape
        )));
    }
    array
        .to_i64()?
        .into_iter()
        .map(|label| u8::try_from(label).map_err(|_| Error::LabelOutOfRange(label)))
        .collect()
}
