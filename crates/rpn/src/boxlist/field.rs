//! Per-box fields of a [`BoxList`][super::BoxList].

use std::fmt;

use crate::iter::zip_exact;
use crate::Error;

/// Names of the per-box fields a box list can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    /// Class-agnostic object score in `[0, 1]`, produced by the RPN.
    Objectness,
    /// Class-specific score, produced by the detection head.
    Scores,
    /// Class id.
    Labels,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Objectness => "objectness",
            Field::Scores => "scores",
            Field::Labels => "labels",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A column of per-box values.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldData {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

impl FieldData {
    pub fn len(&self) -> usize {
        match self {
            FieldData::F32(v) => v.len(),
            FieldData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            FieldData::F32(v) => Some(v),
            FieldData::I64(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            FieldData::I64(v) => Some(v),
            FieldData::F32(_) => None,
        }
    }

    pub(super) fn select(&self, indices: &[usize]) -> Self {
        match self {
            FieldData::F32(v) => FieldData::F32(indices.iter().map(|&i| v[i]).collect()),
            FieldData::I64(v) => FieldData::I64(indices.iter().map(|&i| v[i]).collect()),
        }
    }

    pub(super) fn filter(&self, mask: &[bool]) -> Self {
        fn keep<T: Copy>(v: &[T], mask: &[bool]) -> Vec<T> {
            zip_exact(v, mask)
                .filter(|(_, m)| **m)
                .map(|(&x, _)| x)
                .collect()
        }
        match self {
            FieldData::F32(v) => FieldData::F32(keep(v, mask)),
            FieldData::I64(v) => FieldData::I64(keep(v, mask)),
        }
    }

    /// Appends `other` to `self`. Both columns must hold the same element type.
    fn extend_from(&mut self, field: Field, other: &FieldData) -> Result<(), Error> {
        match (self, other) {
            (FieldData::F32(a), FieldData::F32(b)) => a.extend_from_slice(b),
            (FieldData::I64(a), FieldData::I64(b)) => a.extend_from_slice(b),
            _ => return Err(Error::FieldType { field }),
        }
        Ok(())
    }
}

impl From<Vec<f32>> for FieldData {
    fn from(v: Vec<f32>) -> Self {
        FieldData::F32(v)
    }
}

impl From<Vec<i64>> for FieldData {
    fn from(v: Vec<i64>) -> Self {
        FieldData::I64(v)
    }
}

/// The set of field columns of one box list, ordered by [`Field`].
///
/// Length invariants are maintained by the owning `BoxList`, which is the only way to add
/// columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields {
    columns: Vec<(Field, FieldData)>,
}

impl Fields {
    pub fn get(&self, field: Field) -> Option<&FieldData> {
        self.columns
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, data)| data)
    }

    pub fn contains(&self, field: Field) -> bool {
        self.get(field).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = Field> + '_ {
        self.columns.iter().map(|(f, _)| *f)
    }

    pub(super) fn insert(&mut self, field: Field, data: FieldData) {
        match self.columns.binary_search_by_key(&field, |(f, _)| *f) {
            Ok(i) => self.columns[i].1 = data,
            Err(i) => self.columns.insert(i, (field, data)),
        }
    }

    pub(super) fn map(&self, mut f: impl FnMut(&FieldData) -> FieldData) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|(name, data)| (*name, f(data)))
                .collect(),
        }
    }

    pub(super) fn retain(&mut self, keep: &[Field]) {
        self.columns.retain(|(f, _)| keep.contains(f));
    }

    /// Appends the columns of `other`, which must carry exactly the same field names.
    pub(super) fn extend_from(&mut self, other: &Fields) -> Result<(), Error> {
        if !self.names().eq(other.names()) {
            return Err(Error::FieldSet {
                expected: self.names().collect(),
                got: other.names().collect(),
            });
        }
        for ((name, dst), (_, src)) in self.columns.iter_mut().zip(&other.columns) {
            dst.extend_from(*name, src)?;
        }
        Ok(())
    }
}
