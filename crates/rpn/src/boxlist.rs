//! Per-image collections of boxes with aligned per-box fields.
//!
//! A [`BoxList`] stores `N` boxes of one image as rows of an `[N, 4]` array, together with the
//! image size, the [`BoxMode`] of the rows, the [`Device`] the data belongs to, and any number of
//! per-box [`Field`] columns. Every column always has exactly `N` entries; all transforms that
//! reorder or drop boxes apply the same permutation to every column.

mod field;

pub use field::{Field, FieldData, Fields};

use ndarray::{Array2, ArrayView2, Axis};
use rpn_boxes::{bbox, BBox, BoxMode, ImageSize};

use crate::iter::zip_exact;
use crate::tensor::Device;
use crate::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct BoxList {
    bbox: Array2<f32>,
    size: ImageSize,
    mode: BoxMode,
    device: Device,
    fields: Fields,
}

impl BoxList {
    /// Creates a box list from an `[N, 4]` array of coordinates in `mode`.
    pub fn new(bbox: Array2<f32>, size: ImageSize, mode: BoxMode) -> Result<Self, Error> {
        if bbox.ncols() != 4 {
            return Err(Error::BoxColumns(bbox.ncols()));
        }
        Ok(Self {
            bbox,
            size,
            mode,
            device: Device::Cpu,
            fields: Fields::default(),
        })
    }

    /// Creates a box list from individual boxes, converting each of them to `mode`.
    pub fn from_boxes<I: IntoIterator<Item = BBox>>(boxes: I, size: ImageSize, mode: BoxMode) -> Self {
        let flat: Vec<f32> = boxes
            .into_iter()
            .flat_map(|b| b.convert(mode).coords())
            .collect();
        let n = flat.len() / 4;
        let bbox = Array2::from_shape_vec((n, 4), flat)
            .expect("flattened boxes always have a multiple of 4 coordinates");
        Self {
            bbox,
            size,
            mode,
            device: Device::Cpu,
            fields: Fields::default(),
        }
    }

    /// Creates a box list without any boxes.
    pub fn empty(size: ImageSize, mode: BoxMode) -> Self {
        Self {
            bbox: Array2::zeros((0, 4)),
            size,
            mode,
            device: Device::Cpu,
            fields: Fields::default(),
        }
    }

    /// Attaches a field column, replacing any existing column of the same name.
    pub fn with_field(mut self, field: Field, data: impl Into<FieldData>) -> Result<Self, Error> {
        self.add_field(field, data)?;
        Ok(self)
    }

    /// Attaches a field column, replacing any existing column of the same name.
    pub fn add_field(&mut self, field: Field, data: impl Into<FieldData>) -> Result<(), Error> {
        let data = data.into();
        if data.len() != self.len() {
            return Err(Error::FieldLength {
                field,
                expected: self.len(),
                got: data.len(),
            });
        }
        self.fields.insert(field, data);
        Ok(())
    }

    pub fn field(&self, field: Field) -> Option<&FieldData> {
        self.fields.get(field)
    }

    pub fn has_field(&self, field: Field) -> bool {
        self.fields.contains(field)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Returns the `f32` column `field`, failing if it is missing or holds integers.
    pub fn f32_field(&self, field: Field) -> Result<&[f32], Error> {
        self.fields
            .get(field)
            .ok_or(Error::MissingField(field))?
            .as_f32()
            .ok_or(Error::FieldType { field })
    }

    /// Returns the `objectness` column.
    pub fn objectness(&self) -> Result<&[f32], Error> {
        self.f32_field(Field::Objectness)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bbox.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn size(&self) -> ImageSize {
        self.size
    }

    #[inline]
    pub fn mode(&self) -> BoxMode {
        self.mode
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns the raw `[N, 4]` coordinates in [`BoxList::mode`].
    #[inline]
    pub fn bbox(&self) -> ArrayView2<'_, f32> {
        self.bbox.view()
    }

    /// Returns box `i`.
    pub fn get(&self, i: usize) -> BBox {
        let row = self.bbox.row(i);
        BBox::new([row[0], row[1], row[2], row[3]], self.mode)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = BBox> + '_ {
        (0..self.len()).map(|i| self.get(i))
    }

    /// Returns the boxes as corner-corner rows.
    pub fn xyxy(&self) -> Array2<f32> {
        match self.mode {
            BoxMode::Xyxy => self.bbox.clone(),
            BoxMode::Xywh => self.convert(BoxMode::Xyxy).bbox,
        }
    }

    /// Moves the box list to `device`.
    #[must_use]
    pub fn to(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Returns the same boxes represented in `mode`. Fields are carried over unchanged.
    #[must_use]
    pub fn convert(&self, mode: BoxMode) -> Self {
        if mode == self.mode {
            return self.clone();
        }
        let mut bbox = self.bbox.clone();
        for mut row in bbox.rows_mut() {
            let out = self.mode.convert([row[0], row[1], row[2], row[3]], mode);
            row.assign(&ndarray::aview1(&out));
        }
        Self {
            bbox,
            mode,
            ..self.clone()
        }
    }

    /// Per-box areas.
    pub fn area(&self) -> Vec<f32> {
        self.iter().map(|b| b.area()).collect()
    }

    /// Clamps every box into the image area.
    ///
    /// Boxes that lie entirely outside of the image collapse to zero width or height. They are
    /// dropped only if `remove_empty` is set.
    #[must_use]
    pub fn clip_to_image(&self, remove_empty: bool) -> Self {
        let mut clipped = self.convert(BoxMode::Xyxy);
        for mut row in clipped.bbox.rows_mut() {
            let out = bbox::clip([row[0], row[1], row[2], row[3]], self.size);
            row.assign(&ndarray::aview1(&out));
        }
        if remove_empty {
            let keep: Vec<bool> = clipped
                .bbox
                .rows()
                .into_iter()
                .map(|r| r[2] > r[0] && r[3] > r[1])
                .collect();
            clipped = clipped.filter(&keep);
        }
        clipped.convert(self.mode)
    }

    /// Drops every box whose width or height is less than `min_size`.
    #[must_use]
    pub fn remove_small_boxes(&self, min_size: f32) -> Self {
        let keep: Vec<bool> = self
            .iter()
            .map(|b| b.width() >= min_size && b.height() >= min_size)
            .collect();
        self.filter(&keep)
    }

    /// Gathers the boxes at `indices` (in that order), together with their fields.
    ///
    /// # Panics
    ///
    /// Panics if any index is out of bounds.
    #[must_use]
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            bbox: self.bbox.select(Axis(0), indices),
            size: self.size,
            mode: self.mode,
            device: self.device,
            fields: self.fields.map(|col| col.select(indices)),
        }
    }

    /// Keeps the boxes for which `mask` is `true`, preserving their order.
    ///
    /// # Panics
    ///
    /// Panics if `mask` does not have exactly one entry per box.
    #[must_use]
    pub fn filter(&self, mask: &[bool]) -> Self {
        let indices: Vec<usize> = zip_exact(0..self.len(), mask)
            .filter(|(_, m)| **m)
            .map(|(i, _)| i)
            .collect();
        Self {
            bbox: self.bbox.select(Axis(0), &indices),
            size: self.size,
            mode: self.mode,
            device: self.device,
            fields: self.fields.map(|col| col.filter(mask)),
        }
    }

    /// Returns a copy carrying only the listed fields. All listed fields must be present.
    pub fn copy_with_fields(&self, fields: &[Field]) -> Result<Self, Error> {
        if let Some(&missing) = fields.iter().find(|f| !self.has_field(**f)) {
            return Err(Error::MissingField(missing));
        }
        let mut copy = self.clone();
        copy.fields.retain(fields);
        Ok(copy)
    }

    /// Concatenates box lists of the same image.
    ///
    /// All lists must agree on image size, mode and device, and carry the same set of fields.
    /// Field sets are not unioned: a list with a missing or extra field is rejected with
    /// [`Error::FieldSet`], since there is no value to fill the gaps with. Per-level proposals
    /// always carry exactly `objectness`, so concatenating them never fails this way.
    pub fn cat(lists: &[BoxList]) -> Result<BoxList, Error> {
        let (first, rest) = lists.split_first().ok_or(Error::EmptyConcat)?;
        let mut fields = first.fields.clone();
        for list in rest {
            if list.size != first.size {
                return Err(Error::SizeMismatch {
                    expected: first.size,
                    got: list.size,
                });
            }
            if list.mode != first.mode {
                return Err(Error::ModeMismatch {
                    expected: first.mode,
                    got: list.mode,
                });
            }
            if list.device != first.device {
                return Err(Error::DeviceMismatch {
                    what: "concatenated box list",
                    expected: first.device,
                    found: list.device,
                });
            }
            fields.extend_from(&list.fields)?;
        }

        let views: Vec<_> = lists.iter().map(|l| l.bbox.view()).collect();
        let bbox = ndarray::concatenate(Axis(0), &views)
            .expect("box arrays always have 4 columns");
        Ok(BoxList {
            bbox,
            size: first.size,
            mode: first.mode,
            device: first.device,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    const SIZE: ImageSize = ImageSize::new(20, 30);

    fn sample() -> BoxList {
        BoxList::new(
            array![
                [0.0, 0.0, 10.0, 10.0],
                [5.0, 5.0, 5.5, 15.0],
                [-10.0, 2.0, 40.0, 25.0],
                [35.0, 25.0, 50.0, 30.0],
            ],
            SIZE,
            BoxMode::Xyxy,
        )
        .unwrap()
        .with_field(Field::Objectness, vec![0.9f32, 0.8, 0.7, 0.6])
        .unwrap()
        .with_field(Field::Labels, vec![1i64, 2, 3, 4])
        .unwrap()
    }

    #[test]
    fn field_length_is_checked() {
        let list = BoxList::empty(SIZE, BoxMode::Xyxy);
        assert_eq!(
            list.with_field(Field::Objectness, vec![1.0f32]),
            Err(Error::FieldLength {
                field: Field::Objectness,
                expected: 0,
                got: 1
            })
        );
        assert_eq!(
            BoxList::new(Array2::zeros((2, 5)), SIZE, BoxMode::Xyxy),
            Err(Error::BoxColumns(5))
        );
    }

    #[test]
    fn select_reorders_fields() {
        let list = sample().select(&[2, 0]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.bbox().row(0).to_vec(), [-10.0, 2.0, 40.0, 25.0]);
        assert_eq!(list.objectness().unwrap(), [0.7, 0.9]);
        assert_eq!(list.field(Field::Labels).unwrap().as_i64().unwrap(), [3, 1]);
    }

    #[test]
    fn clip_keeps_empty_boxes_unless_asked() {
        let clipped = sample().clip_to_image(false);
        assert_eq!(clipped.len(), 4);
        assert_eq!(clipped.bbox().row(2).to_vec(), [0.0, 2.0, 30.0, 20.0]);
        assert_eq!(clipped.bbox().row(3).to_vec(), [30.0, 20.0, 30.0, 20.0]);
        assert_eq!(clipped.area(), [100.0, 5.0, 540.0, 0.0]);
        assert_eq!(clipped.convert(BoxMode::Xywh).area(), clipped.area());
        for b in clipped.iter() {
            let [x1, y1, x2, y2] = b.xyxy();
            assert!((0.0..=30.0).contains(&x1) && (0.0..=30.0).contains(&x2));
            assert!((0.0..=20.0).contains(&y1) && (0.0..=20.0).contains(&y2));
        }

        let removed = sample().clip_to_image(true);
        assert_eq!(removed.len(), 3);
        assert_eq!(removed.objectness().unwrap(), [0.9, 0.8, 0.7]);
    }

    #[test]
    fn small_boxes_are_removed() {
        let list = sample().remove_small_boxes(1.0);
        assert_eq!(list.objectness().unwrap(), [0.9, 0.7, 0.6]);
        assert_eq!(list.field(Field::Labels).unwrap().as_i64().unwrap(), [1, 3, 4]);
    }

    #[test]
    fn clip_preserves_mode() {
        let list = sample().convert(BoxMode::Xywh).clip_to_image(false);
        assert_eq!(list.mode(), BoxMode::Xywh);
        assert_eq!(list.bbox().row(2).to_vec(), [0.0, 2.0, 30.0, 18.0]);
    }

    #[test]
    fn cat_requires_matching_fields() {
        let a = sample();
        let b = sample().select(&[1]);
        let both = BoxList::cat(&[a.clone(), b]).unwrap();
        assert_eq!(both.len(), 5);
        assert_eq!(both.objectness().unwrap(), [0.9, 0.8, 0.7, 0.6, 0.8]);

        let bare = a.copy_with_fields(&[Field::Objectness]).unwrap();
        assert!(matches!(
            BoxList::cat(&[a.clone(), bare.clone()]),
            Err(Error::FieldSet { .. })
        ));
        assert!(matches!(
            BoxList::cat(&[bare, a.clone()]),
            Err(Error::FieldSet { .. })
        ));
        assert!(matches!(
            BoxList::cat(&[a.clone(), a.clone().to(Device::Accelerator(0))]),
            Err(Error::DeviceMismatch { .. })
        ));
        assert_eq!(BoxList::cat(&[]), Err(Error::EmptyConcat));
    }

    #[test]
    fn copy_with_missing_field_fails() {
        let list = sample().copy_with_fields(&[]).unwrap();
        assert!(!list.has_field(Field::Objectness));
        assert_eq!(
            list.copy_with_fields(&[Field::Scores]),
            Err(Error::MissingField(Field::Scores))
        );
    }
}
