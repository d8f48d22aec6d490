//! Bucket archives. Stage logic talks to [`BucketStore`]; the two backends
//! differ only in how buckets are laid out inside the `.npz` file.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use ndarray::{stack, Array3, Array4, ArrayView3, Axis};
use ndarray_npy::{NpzReader, NpzWriter};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::{PrepError, StoreMode};

/// Array name numpy gives the first positional array of `savez`.
pub const CONTIGUOUS_KEY: &str = "arr_0";

pub type BucketFn<'a> = dyn Fn(&str, ArrayView3<'_, f64>) -> Array3<f64> + Sync + 'a;

pub trait BucketStore: Send + Sync {
    fn mode(&self) -> StoreMode;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buckets with their names. Contiguous stores name buckets by position.
    fn iter(&self) -> Box<dyn Iterator<Item = (&str, &Array3<f64>)> + '_>;

    fn push(&mut self, name: String, bucket: Array3<f64>);

    /// Replace every bucket by `f(name, bucket)`, in parallel.
    fn map_buckets(&mut self, f: &BucketFn<'_>);

    /// Randomize bucket order. Keyed stores have no order to shuffle.
    fn shuffle(&mut self, rng: &mut StdRng);

    /// Bucket shape `(window, slices, channels)` an empty store is written
    /// with. Keyed stores write no arrays when empty.
    fn set_bucket_shape(&mut self, _shape: (usize, usize, usize)) {}

    /// Write the whole store to `path`, replacing any existing file.
    fn write(&self, path: &Path) -> Result<(), PrepError>;
}

pub fn empty_store(mode: StoreMode) -> Box<dyn BucketStore> {
    match mode {
        StoreMode::InMemory => Box::new(ContiguousStore::default()),
        StoreMode::Keyed => Box::new(KeyedStore::default()),
    }
}

pub fn open_store(mode: StoreMode, path: &Path) -> Result<Box<dyn BucketStore>, PrepError> {
    Ok(match mode {
        StoreMode::InMemory => Box::new(ContiguousStore::open(path)?),
        StoreMode::Keyed => Box::new(KeyedStore::open(path)?),
    })
}

/// Path the store is staged at before [`commit`] moves it into place.
pub fn staging_path(path: &Path) -> PathBuf {
    path.with_extension("npz.tmp")
}

/// Write to the staging path; nothing at `path` changes until [`commit`].
pub fn stage(store: &dyn BucketStore, path: &Path) -> Result<PathBuf, PrepError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PrepError::io(parent, e))?;
    }
    let staged = staging_path(path);
    store.write(&staged)?;
    Ok(staged)
}

pub fn commit(staged: &Path, path: &Path) -> Result<(), PrepError> {
    fs::rename(staged, path).map_err(|e| PrepError::io(path, e))
}

fn archive_err(path: &Path, err: impl std::fmt::Display) -> PrepError {
    PrepError::Archive {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn reader(path: &Path) -> Result<NpzReader<File>, PrepError> {
    let file = File::open(path).map_err(|e| PrepError::io(path, e))?;
    NpzReader::new(file).map_err(|e| archive_err(path, e))
}

/// Every bucket of a split in one `[n, window, slices, channels]` array.
#[derive(Clone, Debug, Default)]
pub struct ContiguousStore {
    buckets: Vec<(String, Array3<f64>)>,
    bucket_shape: (usize, usize, usize),
}

impl ContiguousStore {
    pub fn open(path: &Path) -> Result<Self, PrepError> {
        let mut npz = reader(path)?;
        let all: Array4<f64> = npz
            .by_name(CONTIGUOUS_KEY)
            .map_err(|e| archive_err(path, e))?;
        let (_, window, slices, channels) = all.dim();
        let buckets = all
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(i, b)| (format!("bucket_no{:05}", i), b.to_owned()))
            .collect();
        Ok(Self {
            buckets,
            bucket_shape: (window, slices, channels),
        })
    }

    pub fn to_array(&self) -> Result<Array4<f64>, ndarray::ShapeError> {
        if self.buckets.is_empty() {
            let (window, slices, channels) = self.bucket_shape;
            return Ok(Array4::zeros((0, window, slices, channels)));
        }
        let views: Vec<ArrayView3<'_, f64>> = self.buckets.iter().map(|(_, b)| b.view()).collect();
        stack(Axis(0), &views)
    }
}

impl BucketStore for ContiguousStore {
    fn mode(&self) -> StoreMode {
        StoreMode::InMemory
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (&str, &Array3<f64>)> + '_> {
        Box::new(self.buckets.iter().map(|(n, b)| (n.as_str(), b)))
    }

    fn push(&mut self, name: String, bucket: Array3<f64>) {
        self.buckets.push((name, bucket));
    }

    fn map_buckets(&mut self, f: &BucketFn<'_>) {
        self.buckets
            .par_iter_mut()
            .for_each(|(name, bucket)| *bucket = f(name, bucket.view()));
    }

    fn shuffle(&mut self, rng: &mut StdRng) {
        self.buckets.shuffle(rng);
    }

    fn set_bucket_shape(&mut self, shape: (usize, usize, usize)) {
        self.bucket_shape = shape;
    }

    fn write(&self, path: &Path) -> Result<(), PrepError> {
        let all = self.to_array().map_err(|e| archive_err(path, e))?;
        let file = File::create(path).map_err(|e| PrepError::io(path, e))?;
        let mut npz = NpzWriter::new(file);
        npz.add_array(CONTIGUOUS_KEY, &all)
            .map_err(|e| archive_err(path, e))?;
        npz.finish().map_err(|e| archive_err(path, e))?;
        Ok(())
    }
}

/// One named array per bucket.
#[derive(Clone, Debug, Default)]
pub struct KeyedStore {
    buckets: BTreeMap<String, Array3<f64>>,
}

impl KeyedStore {
    pub fn open(path: &Path) -> Result<Self, PrepError> {
        let mut npz = reader(path)?;
        let names = npz.names().map_err(|e| archive_err(path, e))?;
        let mut buckets = BTreeMap::new();
        for name in names {
            let bucket: Array3<f64> = npz.by_name(&name).map_err(|e| archive_err(path, e))?;
            buckets.insert(name, bucket);
        }
        Ok(Self { buckets })
    }

    pub fn get(&self, name: &str) -> Option<&Array3<f64>> {
        self.buckets.get(name)
    }
}

impl BucketStore for KeyedStore {
    fn mode(&self) -> StoreMode {
        StoreMode::Keyed
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (&str, &Array3<f64>)> + '_> {
        Box::new(self.buckets.iter().map(|(n, b)| (n.as_str(), b)))
    }

    fn push(&mut self, name: String, bucket: Array3<f64>) {
        self.buckets.insert(name, bucket);
    }

    fn map_buckets(&mut self, f: &BucketFn<'_>) {
        self.buckets
            .par_iter_mut()
            .for_each(|(name, bucket)| *bucket = f(name, bucket.view()));
    }

    fn shuffle(&mut self, _rng: &mut StdRng) {}

    fn write(&self, path: &Path) -> Result<(), PrepError> {
        let file = File::create(path).map_err(|e| PrepError::io(path, e))?;
        let mut npz = NpzWriter::new(file);
        for (name, bucket) in &self.buckets {
            npz.add_array(name.as_str(), bucket)
                .map_err(|e| archive_err(path, e))?;
        }
        npz.finish().map_err(|e| archive_err(path, e))?;
        Ok(())
    }
}
