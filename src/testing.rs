//! Test fixtures: a protocol 2 pickle writer that lays numpy arrays out the
//! way numpy itself does, and small in-memory datasets.

use std::iter;

use ndarray::Array;

use crate::common::{Dataset, Split};

pub struct PickledArray {
    shape: Vec<usize>,
    descr: &'static str,
    size: usize,
    byte_order: &'static str,
    fortran: bool,
    data: Vec<u8>,
}

impl PickledArray {
    pub fn f32(shape: &[usize], values: &[f32]) -> Self {
        PickledArray {
            shape: shape.to_vec(),
            descr: "f4",
            size: 4,
            byte_order: "<",
            fortran: false,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn i64(values: &[i64]) -> Self {
        PickledArray {
            shape: vec![values.len()],
            descr: "i8",
            size: 8,
            byte_order: "<",
            fortran: false,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn f64(shape: &[usize], values: &[f64]) -> Self {
        PickledArray {
            shape: shape.to_vec(),
            descr: "f8",
            size: 8,
            byte_order: "<",
            fortran: false,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Stores every element most significant byte first.
    pub fn big_endian(mut self) -> Self {
        for element in self.data.chunks_exact_mut(self.size) {
            element.reverse();
        }
        self.byte_order = ">";
        self
    }

    /// Marks `data` as column-major.
    pub fn fortran(mut self) -> Self {
        self.fortran = true;
        self
    }
}

#[derive(Default)]
pub struct ArchiveBuilder {
    splits: Vec<(PickledArray, PickledArray)>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn split(mut self, images: PickledArray, labels: PickledArray) -> Self {
        self.splits.push((images, labels));
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0x80, 0x02, b'('];
        let mut reconstruct_memoized = false;
        for (images, labels) in &self.splits {
            for array in [images, labels] {
                write_array(&mut out, array, &mut reconstruct_memoized);
            }
            out.push(0x86); // TUPLE2
        }
        out.extend_from_slice(b"t.");
        out
    }
}

fn write_short_string(out: &mut Vec<u8>, text: &str) {
    out.push(b'U');
    out.push(text.len() as u8);
    out.extend_from_slice(text.as_bytes());
}

fn write_array(out: &mut Vec<u8>, array: &PickledArray, reconstruct_memoized: &mut bool) {
    if *reconstruct_memoized {
        out.extend_from_slice(b"h\x00");
    } else {
        out.extend_from_slice(b"cnumpy.core.multiarray\n_reconstruct\nq\x00");
        *reconstruct_memoized = true;
    }
    out.extend_from_slice(b"cnumpy\nndarray\nK\x00\x85");
    write_short_string(out, "b");
    out.extend_from_slice(b"\x87R");

    // BUILD state: (1, shape, dtype, fortran, data)
    out.extend_from_slice(b"(K\x01(");
    for &dim in &array.shape {
        out.push(b'J');
        out.extend_from_slice(&(dim as i32).to_le_bytes());
    }
    out.push(b't');

    out.extend_from_slice(b"cnumpy\ndtype\n");
    write_short_string(out, array.descr);
    out.extend_from_slice(b"K\x00K\x01\x87R(K\x03");
    write_short_string(out, array.byte_order);
    out.extend_from_slice(b"NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tb");

    out.push(if array.fortran { 0x88 } else { 0x89 });
    out.push(b'T');
    out.extend_from_slice(&(array.data.len() as i32).to_le_bytes());
    out.extend_from_slice(&array.data);
    out.extend_from_slice(b"tb");
}

/// Split whose sample `i` has every pixel set to `values[i]`.
pub fn split(values: &[f32], labels: &[u8], width: usize) -> Split {
    let data = values.iter().flat_map(|&v| iter::repeat(v).take(width)).collect();
    Split::new(
        Array::from_shape_vec((values.len(), width), data).unwrap(),
        labels.to_vec(),
    )
}

pub fn dataset() -> Dataset {
    Dataset {
        train: split(&[0.1, 0.2], &[1, 4], 4),
        validation: split(&[0.3], &[2], 4),
        test: split(&[0.4, 0.5, 0.6], &[3, 5, 9], 4),
    }
}
