use ndarray::{concatenate, s, Array2, ArrayView2, Axis};

use crate::error::Result;

pub type A2 = Array2<f32>;
pub type Pixels = Array2<u8>;

/// One partition of the dataset: a sample per row, a label per sample.
#[derive(Debug, Clone)]
pub struct Split {
    images: A2,
    labels: Vec<u8>,
}

impl Split {
    /// Callers guarantee `labels.len() == images.nrows()`; the loader checks
    /// it before building a split.
    pub fn new(images: A2, labels: Vec<u8>) -> Self {
        debug_assert_eq!(images.nrows(), labels.len());
        Split { images, labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn images(&self) -> ArrayView2<f32> {
        self.images.view()
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

}

/// The three splits, always handled in the order train, validation, test.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub train: Split,
    pub validation: Split,
    pub test: Split,
}

impl Dataset {
    pub fn splits(&self) -> [(&'static str, &Split); 3] {
        [
            ("training", &self.train),
            ("validation", &self.validation),
            ("test", &self.test),
        ]
    }

    pub fn len(&self) -> usize {
        self.splits().iter().map(|(_, split)| split.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All samples stacked in split order, the test split cut to its first
    /// `test_rows` rows (or kept whole when it is shorter).
    pub fn concat_images(&self, test_rows: usize) -> Result<A2> {
        let test_rows = test_rows.min(self.test.len());
        let views = [
            self.train.images(),
            self.validation.images(),
            self.test.images.slice(s![..test_rows, ..]),
        ];
        Ok(concatenate(Axis(0), &views)?)
    }

    pub fn concat_labels(&self) -> Vec<u8> {
        self.splits()
            .iter()
            .flat_map(|(_, split)| split.labels().iter().copied())
            .collect()
    }
}
