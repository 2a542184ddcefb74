use std::path::PathBuf;

use log::{debug, info};
use serde::Serialize;

use super::common::Dataset;
use super::config::Config;
use super::data_loader;
use super::error::{Error, Result};
use super::images::{self, Batcher};
use super::recorders::{JsVarRecorder, LabelRecorder};

#[derive(Debug, Serialize)]
pub struct BatchRecord {
    pub index: usize,
    pub path: PathBuf,
    pub first_row: usize,
    pub rows: usize,
}

/// What a conversion wrote.
#[derive(Debug, Serialize)]
pub struct Report {
    pub batches: Vec<BatchRecord>,
    pub labels_path: PathBuf,
    pub label_count: usize,
}

/// Loads the archive named by `config` and writes all artifacts.
impl Report {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub fn run(config: &Config) -> Result<Report> {
    let data = data_loader::load_mnist(&config.input_path)?;
    convert(&data, config)
}

pub fn convert(data: &Dataset, config: &Config) -> Result<Report> {
    // Image rows: train ++ validation ++ all of test. The main pass only
    // looks at the prefix that ends after the first `test_subset_size`
    // test samples.
    let images = data.concat_images(data.test.len())?;
    let main_rows = data.train.len() + data.validation.len() + data.test.len().min(config.test_subset_size);
    debug!("combined matrix {:?}, main pass over {} rows", images.dim(), main_rows);

    let pixels = images::scale_to_pixels(images.view(), config.scale);
    drop(images);

    let labels = data.concat_labels();
    if labels.len() != pixels.nrows() {
        return Err(Error::LabelCountMismatch {
            split: "combined",
            rows: pixels.nrows(),
            labels: labels.len(),
        });
    }

    let batcher = Batcher::new(pixels.view(), main_rows, config.batch_size, config.batch_count)?;
    let mut batches = Vec::with_capacity(config.batch_count + 1);
    for (index, rows, view) in batcher.batches()? {
        let path = config.batch_path(index);
        images::write_batch(&path, view)?;
        batches.push(BatchRecord { index, path, first_row: rows.start, rows: rows.len() });
    }

    let labels_path = config.labels_path();
    JsVarRecorder::save(&labels, &labels_path)?;
    info!("Wrote {} labels to {:?}", labels.len(), labels_path);

    Ok(Report { batches, labels_path, label_count: labels.len() })
}
