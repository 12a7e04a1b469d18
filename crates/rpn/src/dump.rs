//! Optional sink for intermediate arrays.
//!
//! The pipeline reports its intermediate results (selected indices, decoded boxes, NMS survivors)
//! to a [`TensorSink`]. This is used to compare numerics against a reference implementation.
//! Production code uses [`NullSink`], which drops everything without materializing it.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use itertools::Itertools;
use ndarray::ArrayViewD;
use serde::Serialize;

/// Receiver of named intermediate arrays.
///
/// Emitting is best-effort: implementations must not fail the pipeline, and should log problems
/// instead.
pub trait TensorSink: Send + Sync {
    /// Returns whether this sink wants data at all.
    ///
    /// Callers check this before building arrays that exist only to be emitted.
    fn enabled(&self) -> bool {
        true
    }

    /// Receives a float array named `name` within `scope`.
    fn emit(&self, scope: &str, name: &str, array: ArrayViewD<'_, f32>);

    /// Receives a list of indices named `name` within `scope`.
    fn emit_indices(&self, scope: &str, name: &str, indices: &[usize]);

    /// Advances to the next iteration.
    fn step(&self) {}
}

/// A sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TensorSink for NullSink {
    fn enabled(&self) -> bool {
        false
    }

    fn emit(&self, _: &str, _: &str, _: ArrayViewD<'_, f32>) {}

    fn emit_indices(&self, _: &str, _: &str, _: &[usize]) {}
}

#[derive(Serialize)]
struct Record<'a, T: Serialize> {
    shape: &'a [usize],
    data: T,
}

/// A sink that writes every array to its own JSON file.
///
/// Files are written to `{base_dir}/iter_{n}/{scope}/{name}.{shape}.json`, where `n` is the
/// current iteration and `shape` is the array shape as a tuple, eg. `(2, 4)`.
pub struct DirSink {
    base_dir: PathBuf,
    iteration: AtomicU64,
}

impl DirSink {
    pub fn new<P: Into<PathBuf>>(base_dir: P, iteration: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            iteration: AtomicU64::new(iteration),
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }

    /// Jumps to iteration `iteration`.
    pub fn set_iteration(&self, iteration: u64) {
        self.iteration.store(iteration, Ordering::Relaxed);
    }

    /// Returns the path the array `name` of the given shape will be written to.
    pub fn path_for(&self, scope: &str, name: &str, shape: &[usize]) -> PathBuf {
        let mut dir = self.base_dir.join(format!("iter_{}", self.iteration()));
        if !scope.is_empty() {
            dir = dir.join(scope);
        }
        dir.join(format!("{name}.{}.json", shape_suffix(shape)))
    }

    fn write<T: Serialize>(&self, scope: &str, name: &str, shape: &[usize], data: T) {
        let path = self.path_for(scope, name, shape);
        if let Err(e) = write_record(&path, &Record { shape, data }) {
            log::warn!("failed to dump `{scope}/{name}`: {e:#}");
        }
    }
}

impl TensorSink for DirSink {
    fn emit(&self, scope: &str, name: &str, array: ArrayViewD<'_, f32>) {
        let data: Vec<f32> = array.iter().copied().collect();
        self.write(scope, name, array.shape(), data);
    }

    fn emit_indices(&self, scope: &str, name: &str, indices: &[usize]) {
        self.write(scope, name, &[indices.len()], indices);
    }

    fn step(&self) {
        self.iteration.fetch_add(1, Ordering::Relaxed);
    }
}

fn shape_suffix(shape: &[usize]) -> String {
    match shape {
        [single] => format!("({single},)"),
        _ => format!("({})", shape.iter().join(", ")),
    }
}

fn write_record<T: Serialize>(path: &Path, record: &Record<'_, T>) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let file = fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer(file, record)?;
    Ok(())
}
