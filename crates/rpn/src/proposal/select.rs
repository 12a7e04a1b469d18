//! Selection of the final proposals after all levels have been merged.

use crate::{
    boxlist::{BoxList, Field},
    iter::{split_lengths, zip_exact},
    topk::top_k,
    Error,
};

/// How the post-NMS budget is shared between the images of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BudgetPolicy {
    /// Every image gets its own budget of `fpn_post_nms_top_n` proposals.
    PerImage,
    /// The whole batch shares one budget of `fpn_post_nms_top_n` proposals.
    ///
    /// Images with higher-scoring proposals take a larger share, and an image can end up with no
    /// proposals at all. This matches the behaviour Detectron-trained models expect.
    #[default]
    PerBatch,
}

/// Re-ranks per-image proposals that were merged from several pyramid levels.
///
/// With [`BudgetPolicy::PerBatch`] the `fpn_post_nms_top_n` best proposals of the whole batch
/// survive, and each image keeps its survivors in their original order. With
/// [`BudgetPolicy::PerImage`] every image keeps its own `fpn_post_nms_top_n` best proposals,
/// sorted by descending objectness.
///
/// Equal scores are ranked by position, images earlier in the batch first.
pub fn select_over_all_levels(
    boxlists: Vec<BoxList>,
    policy: BudgetPolicy,
    fpn_post_nms_top_n: usize,
) -> Result<Vec<BoxList>, Error> {
    match policy {
        BudgetPolicy::PerBatch => {
            let lengths: Vec<usize> = boxlists.iter().map(BoxList::len).collect();
            let mut pooled = Vec::with_capacity(lengths.iter().sum());
            for list in &boxlists {
                pooled.extend_from_slice(list.objectness()?);
            }

            let mut mask = vec![false; pooled.len()];
            for i in top_k(&pooled, fpn_post_nms_top_n) {
                mask[i] = true;
            }
            log::debug!(
                "batch-wide selection kept {} of {} proposals",
                fpn_post_nms_top_n.min(pooled.len()),
                pooled.len(),
            );

            Ok(zip_exact(&boxlists, split_lengths(&mask, &lengths))
                .map(|(list, mask)| list.filter(mask))
                .collect())
        }
        BudgetPolicy::PerImage => boxlists
            .iter()
            .map(|list| -> Result<BoxList, Error> {
                let selected = top_k(list.objectness()?, fpn_post_nms_top_n);
                Ok(list.select(&selected))
            })
            .collect(),
    }
}

/// Appends the ground truth boxes `targets` to the proposals of their image.
///
/// Ground truth boxes get an `objectness` of 1 and carry no other fields. They are converted to
/// the mode and device of the proposals they are appended to.
pub fn add_gt_proposals(proposals: Vec<BoxList>, targets: &[BoxList]) -> Result<Vec<BoxList>, Error> {
    if proposals.len() != targets.len() {
        return Err(Error::BatchSize {
            what: "targets",
            expected: proposals.len(),
            got: targets.len(),
        });
    }

    zip_exact(proposals, targets)
        .map(|(proposal, target)| {
            let gt = target
                .copy_with_fields(&[])?
                .convert(proposal.mode())
                .to(proposal.device());
            let gt = gt.with_field(Field::Objectness, vec![1.0f32; target.len()])?;
            BoxList::cat(&[proposal, gt])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use rpn_boxes::{num::cmp_desc, BoxMode, ImageSize};

    use super::*;
    use crate::tensor::Device;

    const SIZE: ImageSize = ImageSize::new(50, 50);

    fn is_ranked(scores: &[f32]) -> bool {
        (1..scores.len()).all(|i| cmp_desc(scores, i - 1, i).is_le())
    }

    fn proposals(scores: &[f32]) -> BoxList {
        let boxes = Array2::from_shape_fn((scores.len(), 4), |(i, c)| match c {
            0 | 1 => i as f32,
            _ => i as f32 + 5.0,
        });
        BoxList::new(boxes, SIZE, BoxMode::Xyxy)
            .unwrap()
            .with_field(Field::Objectness, scores.to_vec())
            .unwrap()
    }

    #[test]
    fn batch_budget_is_shared() {
        let lists = vec![
            proposals(&[0.9, 0.1, 0.8, 0.3, 0.2]),
            proposals(&[0.7, 0.95, 0.05, 0.6, 0.4]),
        ];
        let out = select_over_all_levels(lists, BudgetPolicy::PerBatch, 6).unwrap();
        assert_eq!(out[0].len() + out[1].len(), 6);
        // Survivors keep their order within the image.
        assert_eq!(out[0].objectness().unwrap(), [0.9, 0.8]);
        assert_eq!(out[1].objectness().unwrap(), [0.7, 0.95, 0.6, 0.4]);
    }

    #[test]
    fn batch_budget_can_starve_an_image() {
        let lists = vec![proposals(&[0.9, 0.8]), proposals(&[0.1, 0.2])];
        let out = select_over_all_levels(lists, BudgetPolicy::PerBatch, 2).unwrap();
        assert_eq!(out[0].len(), 2);
        assert!(out[1].is_empty());
    }

    #[test]
    fn batch_budget_ties_prefer_earlier_images() {
        let lists = vec![proposals(&[0.5, 0.5]), proposals(&[0.5, 0.5])];
        let out = select_over_all_levels(lists, BudgetPolicy::PerBatch, 3).unwrap();
        assert_eq!(out[0].len(), 2);
        assert_eq!(out[1].len(), 1);
        assert_eq!(out[1].bbox().row(0)[0], 0.0);
    }

    #[test]
    fn per_image_budget_sorts() {
        let lists = vec![proposals(&[0.2, 0.9, 0.5]), proposals(&[0.3])];
        let out = select_over_all_levels(lists, BudgetPolicy::PerImage, 2).unwrap();
        assert_eq!(out[0].objectness().unwrap(), [0.9, 0.5]);
        assert_eq!(out[1].objectness().unwrap(), [0.3]);
        assert!(out.iter().all(|l| is_ranked(l.objectness().unwrap())));
    }

    #[test]
    fn missing_objectness_is_an_error() {
        let bare = BoxList::new(Array2::zeros((1, 4)), SIZE, BoxMode::Xyxy).unwrap();
        for policy in [BudgetPolicy::PerBatch, BudgetPolicy::PerImage] {
            assert_eq!(
                select_over_all_levels(vec![bare.clone()], policy, 1),
                Err(Error::MissingField(Field::Objectness))
            );
        }
    }

    #[test]
    fn ground_truth_is_appended() {
        let dev = Device::Accelerator(0);
        let target = BoxList::new(
            ndarray::array![[1.0, 2.0, 3.0, 4.0]],
            SIZE,
            BoxMode::Xywh,
        )
        .unwrap()
        .with_field(Field::Labels, vec![7i64])
        .unwrap();

        let out = add_gt_proposals(vec![proposals(&[0.3, 0.2]).to(dev)], &[target]).unwrap();
        let list = &out[0];
        assert_eq!(list.len(), 3);
        assert_eq!(list.device(), dev);
        assert_eq!(list.mode(), BoxMode::Xyxy);
        assert_eq!(list.objectness().unwrap(), [0.3, 0.2, 1.0]);
        assert!(!list.has_field(Field::Labels));
        assert_eq!(list.bbox().row(2).to_vec(), [1.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn ground_truth_batch_must_match() {
        assert!(matches!(
            add_gt_proposals(vec![proposals(&[0.3])], &[]),
            Err(Error::BatchSize { what: "targets", .. })
        ));
    }
}
