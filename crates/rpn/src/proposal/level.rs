//! Proposal decoding for a single pyramid level.

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use rpn_boxes::{num::sigmoid, BoxMode};

use crate::{
    box_coder::BoxCoder,
    boxlist::{BoxList, Field},
    dump::TensorSink,
    nms::{boxlist_nms, NonMaxSuppression},
    tensor::{flatten_scores, permute_and_flatten, FeatureMap},
    timer::Timer,
    topk::top_k_rows,
    Error,
};

const SCOPE: &str = "rpn";
const DECODE_SCOPE: &str = "rpn/box_decode";

/// Turns the raw head outputs of one pyramid level into per-image proposals.
///
/// For every image, the `pre_nms_top_n` anchors with the highest objectness are decoded, clipped
/// to the image, filtered by `min_size` and finally deduplicated by NMS, keeping at most
/// `post_nms_top_n` proposals.
#[derive(Debug, Clone)]
pub struct LevelDecoder {
    pre_nms_top_n: usize,
    min_size: f32,
    nms: NonMaxSuppression,
    box_coder: BoxCoder,
    t_decode: Timer,
    t_nms: Timer,
}

impl LevelDecoder {
    pub fn new(
        pre_nms_top_n: usize,
        post_nms_top_n: usize,
        nms_thresh: f32,
        min_size: f32,
        box_coder: BoxCoder,
    ) -> Self {
        let mut nms = NonMaxSuppression::new();
        nms.set_iou_thresh(nms_thresh);
        nms.set_max_keep(Some(post_nms_top_n));
        Self {
            pre_nms_top_n,
            min_size,
            nms,
            box_coder,
            t_decode: Timer::new("decode"),
            t_nms: Timer::new("nms"),
        }
    }

    pub fn pre_nms_top_n(&self) -> usize {
        self.pre_nms_top_n
    }

    pub fn post_nms_top_n(&self) -> usize {
        self.nms.max_keep().unwrap_or(usize::MAX)
    }

    pub fn nms_thresh(&self) -> f32 {
        self.nms.iou_thresh()
    }

    pub fn min_size(&self) -> f32 {
        self.min_size
    }

    pub fn box_coder(&self) -> &BoxCoder {
        &self.box_coder
    }

    pub fn timers(&self) -> [&Timer; 2] {
        [&self.t_decode, &self.t_nms]
    }

    /// Decodes the proposals of pyramid level `level` for every image of the batch.
    ///
    /// - `anchors` holds one list of `A * H * W` anchors per image, in the same location-major
    ///   order as the flattened head outputs. Its image sizes are used for clipping.
    /// - `objectness` is the `[N, A, H, W]` logit output of the head.
    /// - `regression` is the `[N, A * 4, H, W]` box regression output of the head.
    ///
    /// All shapes and devices are checked before any image is processed. The returned proposals
    /// carry an `objectness` field and are sorted by it, best first.
    pub fn decode_level(
        &self,
        anchors: &[&BoxList],
        objectness: &FeatureMap,
        regression: &FeatureMap,
        level: usize,
        sink: &dyn TensorSink,
    ) -> Result<Vec<BoxList>, Error> {
        check_level_inputs(anchors, objectness, regression, level)?;
        let device = objectness.device();

        let (scores, deltas, candidates) = self.t_decode.time(|| {
            let scores = flatten_scores(objectness.view()).mapv_into(sigmoid);
            let deltas = permute_and_flatten(regression.view(), 4)?;
            let candidates = top_k_rows(scores.view(), self.pre_nms_top_n);
            Ok::<_, Error>((scores, deltas, candidates))
        })?;
        log::trace!(
            "level {level}: {} anchors per image, {} candidates after top-k",
            scores.ncols(),
            candidates.first().map_or(0, Vec::len),
        );

        let decoded: Vec<Decoded> = self.t_decode.time(|| {
            (0..anchors.len())
                .into_par_iter()
                .map(|img| {
                    let idx = &candidates[img];
                    let reference = anchors[img].xyxy().select(Axis(0), idx);
                    let delta = deltas.index_axis(Axis(0), img).select(Axis(0), idx);
                    let boxes = self.box_coder.decode(delta.view(), reference.view());
                    Decoded {
                        reference,
                        delta,
                        boxes,
                    }
                })
                .collect()
        });

        if sink.enabled() {
            for (img, idx) in candidates.iter().enumerate() {
                sink.emit_indices(SCOPE, &format!("topk_idx_img_{img}_layer_{level}"), idx);
            }
            let batch = [
                ("ref_boxes", stack_rows(decoded.iter().map(|d| d.reference.view()))),
                ("boxes_delta", stack_rows(decoded.iter().map(|d| d.delta.view()))),
                ("boxes", stack_rows(decoded.iter().map(|d| d.boxes.view()))),
            ];
            for (name, array) in batch {
                sink.emit(
                    DECODE_SCOPE,
                    &format!("{name}_layer_{level}"),
                    array.view().into_dyn(),
                );
            }
            for (img, d) in decoded.iter().enumerate() {
                sink.emit(
                    SCOPE,
                    &format!("proposals_after_decode_img_{img}_layer_{level}"),
                    d.boxes.view().into_dyn(),
                );
            }
        }

        let proposals = decoded
            .into_par_iter()
            .enumerate()
            .map(|(img, Decoded { boxes, .. })| {
                let score: Vec<f32> = candidates[img]
                    .iter()
                    .map(|&i| scores[[img, i]])
                    .collect();
                let list = BoxList::new(boxes, anchors[img].size(), BoxMode::Xyxy)?
                    .to(device)
                    .with_field(Field::Objectness, score)?
                    .clip_to_image(false)
                    .remove_small_boxes(self.min_size);
                if sink.enabled() {
                    sink.emit(
                        SCOPE,
                        &format!("after_remove_small_boxes_img_{img}_layer_{level}"),
                        list.bbox().into_dyn(),
                    );
                }

                let kept = self.t_nms.time(|| {
                    boxlist_nms(&list, &self.nms, Field::Objectness, |keep| {
                        if sink.enabled() {
                            sink.emit_indices(
                                SCOPE,
                                &format!("nms_indices_img_{img}_layer_{level}"),
                                keep,
                            );
                        }
                    })
                })?;
                if sink.enabled() {
                    sink.emit(
                        SCOPE,
                        &format!("proposals_img_{img}_layer_{level}"),
                        kept.bbox().into_dyn(),
                    );
                }
                log::trace!(
                    "level {level}, image {img}: {} after size filter, {} after nms",
                    list.len(),
                    kept.len(),
                );
                Ok(kept)
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(proposals)
    }
}

/// Gathered inputs and decoded outputs of the top-k candidates of one image.
struct Decoded {
    reference: Array2<f32>,
    delta: Array2<f32>,
    boxes: Array2<f32>,
}

/// Stacks `[n, 4]` arrays of all images into one `[sum n, 4]` array.
fn stack_rows<'a>(parts: impl Iterator<Item = ArrayView2<'a, f32>>) -> Array2<f32> {
    let views: Vec<_> = parts.collect();
    ndarray::concatenate(Axis(0), &views).unwrap_or_else(|_| Array2::zeros((0, 4)))
}

/// Checks that the inputs of one pyramid level fit together.
pub(super) fn check_level_inputs(
    anchors: &[&BoxList],
    objectness: &FeatureMap,
    regression: &FeatureMap,
    level: usize,
) -> Result<(), Error> {
    let device = objectness.device();
    if regression.device() != device {
        return Err(Error::DeviceMismatch {
            what: "box regression",
            expected: device,
            found: regression.device(),
        });
    }
    if let Some(list) = anchors.iter().find(|list| list.device() != device) {
        return Err(Error::DeviceMismatch {
            what: "anchors",
            expected: device,
            found: list.device(),
        });
    }

    let (n, a, h, w) = objectness.dim();
    let (reg_n, reg_c, reg_h, reg_w) = regression.dim();
    if reg_c % 4 != 0 {
        return Err(Error::ChannelLayout {
            channels: reg_c,
            per_anchor: 4,
        });
    }
    if reg_n != n {
        return Err(Error::BatchSize {
            what: "box regression",
            expected: n,
            got: reg_n,
        });
    }
    if anchors.len() != n {
        return Err(Error::BatchSize {
            what: "anchors",
            expected: n,
            got: anchors.len(),
        });
    }
    if reg_c / 4 != a {
        return Err(Error::AnchorsPerLocation {
            objectness: a,
            regression: reg_c / 4,
        });
    }
    if (reg_h, reg_w) != (h, w) {
        return Err(Error::SpatialSize {
            objectness: (h, w),
            regression: (reg_h, reg_w),
        });
    }
    for (image, list) in anchors.iter().enumerate() {
        if list.len() != a * h * w {
            return Err(Error::AnchorCount {
                image,
                level,
                expected: a * h * w,
                got: list.len(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;
    use rpn_boxes::{num::logit, ImageSize};

    use super::*;
    use crate::{dump::NullSink, tensor::Device};

    const SIZE: ImageSize = ImageSize::new(100, 100);

    fn anchors(n: usize) -> BoxList {
        let boxes = Array2::from_shape_fn((n, 4), |(i, c)| match c {
            0 => 20.0 * i as f32,
            2 => 20.0 * i as f32 + 10.0,
            1 => 0.0,
            _ => 10.0,
        });
        BoxList::new(boxes, SIZE, BoxMode::Xyxy).unwrap()
    }

    fn decoder(pre: usize, post: usize, thresh: f32, min_size: f32) -> LevelDecoder {
        LevelDecoder::new(pre, post, thresh, min_size, BoxCoder::default())
    }

    #[test]
    fn mismatched_batch_is_rejected() {
        let obj = FeatureMap::new(Array4::zeros((2, 1, 1, 2)));
        let reg = FeatureMap::new(Array4::zeros((1, 4, 1, 2)));
        let err = decoder(4, 4, 0.5, 0.0)
            .decode_level(&[&anchors(2), &anchors(2)], &obj, &reg, 1, &NullSink)
            .unwrap_err();
        assert_eq!(
            err,
            Error::BatchSize {
                what: "box regression",
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn checks_run_in_order() {
        let obj = FeatureMap::new(Array4::zeros((1, 2, 1, 1)));
        let reg = FeatureMap::new(Array4::zeros((1, 6, 1, 1)));
        assert!(matches!(
            check_level_inputs(&[&anchors(2)], &obj, &reg, 1),
            Err(Error::ChannelLayout { channels: 6, .. })
        ));

        let reg = FeatureMap::new(Array4::zeros((1, 4, 1, 1)));
        assert!(matches!(
            check_level_inputs(&[&anchors(2)], &obj, &reg, 1),
            Err(Error::AnchorsPerLocation { objectness: 2, regression: 1 })
        ));

        let reg = FeatureMap::new(Array4::zeros((1, 8, 2, 1)));
        assert!(matches!(
            check_level_inputs(&[&anchors(2)], &obj, &reg, 1),
            Err(Error::SpatialSize { .. })
        ));

        let reg = FeatureMap::new(Array4::zeros((1, 8, 1, 1)));
        assert!(matches!(
            check_level_inputs(&[&anchors(3)], &obj, &reg, 3),
            Err(Error::AnchorCount { image: 0, level: 3, expected: 2, got: 3 })
        ));
        assert!(check_level_inputs(&[&anchors(2)], &obj, &reg, 1).is_ok());
    }

    #[test]
    fn device_mismatch_is_rejected() {
        let obj = FeatureMap::on(Array4::zeros((1, 1, 1, 2)), Device::Accelerator(0));
        let reg = FeatureMap::on(Array4::zeros((1, 4, 1, 2)), Device::Accelerator(0));
        let err = decoder(4, 4, 0.5, 0.0)
            .decode_level(&[&anchors(2)], &obj, &reg, 1, &NullSink)
            .unwrap_err();
        assert_eq!(
            err,
            Error::DeviceMismatch {
                what: "anchors",
                expected: Device::Accelerator(0),
                found: Device::Cpu
            }
        );

        let reg = FeatureMap::on(Array4::zeros((1, 4, 1, 2)), Device::Accelerator(1));
        let anchors = anchors(2).to(Device::Accelerator(0));
        assert!(matches!(
            decoder(4, 4, 0.5, 0.0).decode_level(&[&anchors], &obj, &reg, 1, &NullSink),
            Err(Error::DeviceMismatch { what: "box regression", .. })
        ));
    }

    #[test]
    fn proposals_follow_the_input_device() {
        let dev = Device::Accelerator(2);
        let obj = FeatureMap::on(Array4::zeros((1, 1, 1, 2)), dev);
        let reg = FeatureMap::on(Array4::zeros((1, 4, 1, 2)), dev);
        let out = decoder(4, 4, 0.5, 0.0)
            .decode_level(&[&anchors(2).to(dev)], &obj, &reg, 1, &NullSink)
            .unwrap();
        assert_eq!(out[0].device(), dev);
    }

    #[test]
    fn pre_nms_budget_limits_candidates() {
        // 6 non-overlapping anchors on a 1x6 map.
        let logits = [0.1, 0.6, 0.3, 0.9, 0.2, 0.5].map(logit);
        let obj = FeatureMap::new(Array4::from_shape_fn((1, 1, 1, 6), |(_, _, _, x)| logits[x]));
        let reg = FeatureMap::new(Array4::zeros((1, 4, 1, 6)));
        let out = decoder(3, 10, 0.7, 0.0)
            .decode_level(&[&anchors(6)], &obj, &reg, 1, &NullSink)
            .unwrap();
        let scores = out[0].objectness().unwrap();
        assert_eq!(scores.len(), 3);
        approx::assert_abs_diff_eq!(scores[0], 0.9, epsilon = 1e-5);
        approx::assert_abs_diff_eq!(scores[1], 0.6, epsilon = 1e-5);
        approx::assert_abs_diff_eq!(scores[2], 0.5, epsilon = 1e-5);
        assert_eq!(out[0].bbox().row(0).to_vec(), [60.0, 0.0, 70.0, 10.0]);
    }

    #[test]
    fn empty_feature_map_yields_empty_lists() {
        let obj = FeatureMap::new(Array4::zeros((2, 1, 0, 0)));
        let reg = FeatureMap::new(Array4::zeros((2, 4, 0, 0)));
        let out = decoder(4, 4, 0.5, 0.0)
            .decode_level(&[&anchors(0), &anchors(0)], &obj, &reg, 2, &NullSink)
            .unwrap();
        assert_eq!(out.len(), 2);
        for list in &out {
            assert!(list.is_empty());
            assert!(list.objectness().unwrap().is_empty());
            assert_eq!(list.size(), SIZE);
        }
    }

    #[test]
    fn zero_pre_nms_budget_yields_empty_lists() {
        let obj = FeatureMap::new(Array4::ones((1, 1, 1, 3)));
        let reg = FeatureMap::new(Array4::zeros((1, 4, 1, 3)));
        let out = decoder(0, 4, 0.5, 0.0)
            .decode_level(&[&anchors(3)], &obj, &reg, 1, &NullSink)
            .unwrap();
        assert!(out[0].is_empty());
        assert!(out[0].has_field(Field::Objectness));
    }

    #[test]
    fn stacking_empty_parts_keeps_four_columns() {
        let parts = [Array2::<f32>::zeros((0, 4)), Array2::zeros((0, 4))];
        assert_eq!(stack_rows(parts.iter().map(|a| a.view())).dim(), (0, 4));
        assert_eq!(stack_rows(std::iter::empty()).dim(), (0, 4));
    }

    #[test]
    fn boxes_outside_the_image_are_kept_with_zero_area() {
        // Anchor 1 lies entirely right of the 100px wide image.
        let anchors = BoxList::new(
            ndarray::array![[0.0, 0.0, 10.0, 10.0], [150.0, 0.0, 160.0, 10.0]],
            SIZE,
            BoxMode::Xyxy,
        )
        .unwrap();
        let obj = FeatureMap::new(Array4::zeros((1, 1, 1, 2)));
        let reg = FeatureMap::new(Array4::zeros((1, 4, 1, 2)));
        let out = decoder(4, 4, 0.5, 0.0)
            .decode_level(&[&anchors], &obj, &reg, 1, &NullSink)
            .unwrap();
        assert_eq!(out[0].len(), 2);
        assert_eq!(out[0].bbox().row(1).to_vec(), [100.0, 0.0, 100.0, 10.0]);
    }
}
