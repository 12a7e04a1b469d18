//! Evaluation results file.
//!
//! After inference, the proposals of every image are collected (see [`crate::gather`]) and written
//! to `predictions.json` in the output directory, where evaluation tools pick them up. The file
//! holds a JSON object mapping each image ID to its [`Prediction`].

use std::{
    collections::BTreeMap,
    fs,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use anyhow::Context;
use rpn_boxes::ImageSize;
use serde::{Deserialize, Serialize};

use crate::{boxlist::BoxList, Error};

/// Name of the results file inside the output directory.
pub const PREDICTIONS_FILE: &str = "predictions.json";

/// The proposals computed for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Proposal boxes in `xyxy` mode.
    pub boxes: Vec<[f32; 4]>,
    pub objectness: Vec<f32>,
    pub image_size: ImageSize,
}

impl Prediction {
    /// Copies the boxes and objectness scores out of `proposals`.
    pub fn from_boxlist(proposals: &BoxList) -> Result<Self, Error> {
        let objectness = proposals.objectness()?.to_vec();
        let boxes = proposals.iter().map(|b| b.xyxy()).collect();
        Ok(Self {
            boxes,
            objectness,
            image_size: proposals.size(),
        })
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// Writes `predictions` to `{dir}/predictions.json`, creating `dir` if needed.
///
/// Returns the path of the written file.
pub fn save_predictions<'a, I>(dir: &Path, predictions: I) -> anyhow::Result<PathBuf>
where
    I: IntoIterator<Item = (u64, &'a Prediction)>,
{
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;

    let map: BTreeMap<u64, &Prediction> = predictions.into_iter().collect();
    let path = dir.join(PREDICTIONS_FILE);
    let file = fs::File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer(BufWriter::new(file), &map)
        .with_context(|| format!("failed to write {}", path.display()))?;

    log::info!("wrote {} predictions to {}", map.len(), path.display());
    Ok(path)
}

/// Reads the results file written by [`save_predictions`].
pub fn load_predictions(path: &Path) -> anyhow::Result<BTreeMap<u64, Prediction>> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rpn_boxes::BoxMode;

    use super::*;
    use crate::boxlist::Field;

    #[test]
    fn prediction_from_boxlist() {
        let list = BoxList::new(array![[1.0, 2.0, 3.0, 4.0]], ImageSize::new(10, 20), BoxMode::Xywh)
            .unwrap()
            .with_field(Field::Objectness, vec![0.5f32])
            .unwrap();
        let pred = Prediction::from_boxlist(&list).unwrap();
        assert_eq!(pred.boxes, [[1.0, 2.0, 4.0, 6.0]]);
        assert_eq!(pred.objectness, [0.5]);
        assert_eq!(pred.image_size, ImageSize::new(10, 20));

        let bare = list.copy_with_fields(&[]).unwrap();
        assert_eq!(
            Prediction::from_boxlist(&bare),
            Err(Error::MissingField(Field::Objectness))
        );
    }

    #[test]
    fn save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("inference").join("coco_val");
        let a = Prediction {
            boxes: vec![[0.0, 0.0, 5.0, 5.0]],
            objectness: vec![0.25],
            image_size: ImageSize::new(8, 8),
        };
        let b = Prediction {
            boxes: vec![],
            objectness: vec![],
            image_size: ImageSize::new(4, 6),
        };

        let path = save_predictions(&dir, [(7, &a), (2, &b)]).unwrap();
        assert_eq!(path, dir.join(PREDICTIONS_FILE));

        let loaded = load_predictions(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&7], a);
        assert!(loaded[&2].is_empty());
    }
}
