use std::path::PathBuf;

use crate::error::{Error, Result};

pub const BATCH_SIZE: usize = 3000;
pub const BATCH_COUNT: usize = 20;
pub const TEST_SUBSET_SIZE: usize = 3000;
pub const SCALE: f32 = 255.0;

/// Everything the conversion needs to know. `Default` is the layout of the
/// published MNIST archive; other values only make sense for small
/// synthetic datasets.
#[derive(Debug, Clone)]
pub struct Config {
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub batch_size: usize,
    pub batch_count: usize,
    // Test samples kept in the main batching pass.
    pub test_subset_size: usize,
    pub scale: f32,
    pub image_prefix: String,
    pub labels_file: String,
}

impl Config {
    pub fn validate(self) -> Result<Self> {
        if 0 == self.batch_size {
            return Err(Error::InvalidConfig("batch size must be greater than 0".into()));
        }
        if 0 == self.batch_count {
            return Err(Error::InvalidConfig("batch count must be greater than 0".into()));
        }
        if !(self.scale > 0.0) {
            return Err(Error::InvalidConfig(format!("scale must be positive, got {}", self.scale)));
        }
        Ok(self)
    }

    /// First row of the final image, which also ends the main pass.
    pub fn final_batch_start(&self) -> usize {
        self.batch_size * self.batch_count
    }

    pub fn batch_path(&self, index: usize) -> PathBuf {
        self.output_dir.join(format!("{}{}.png", self.image_prefix, index))
    }

    pub fn labels_path(&self) -> PathBuf {
        self.output_dir.join(&self.labels_file)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("mnist.pkl.gz"),
            output_dir: PathBuf::from("."),
            batch_size: BATCH_SIZE,
            batch_count: BATCH_COUNT,
            test_subset_size: TEST_SUBSET_SIZE,
            scale: SCALE,
            image_prefix: "mnist_batch_".into(),
            labels_file: "mnist_labels.js".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    #[test]
    fn default_matches_published_layout() {
        let config = Config::default().validate().unwrap();
        assert_eq!(config.final_batch_start(), 60_000);
        assert_eq!(config.batch_path(20), Path::new("./mnist_batch_20.png"));
        assert_eq!(config.labels_path(), Path::new("./mnist_labels.js"));
    }

    #[test]
    fn rejects_degenerate_batching() {
        let config = Config { batch_size: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = Config { batch_count: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = Config { scale: f32::NAN, ..Config::default() };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
