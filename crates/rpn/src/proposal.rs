//! Turning raw RPN head outputs into region proposals.
//!
//! The RPN head predicts, for every anchor of every pyramid level, an objectness logit and four
//! box regression deltas. [`RpnPostProcessor`] decodes these into a small set of high-scoring,
//! deduplicated proposals per image:
//!
//! 1. Every level is processed independently by a [`LevelDecoder`]: top-k by objectness, box
//!    decoding, clipping, size filtering and NMS.
//! 2. The per-level proposals of each image are concatenated.
//! 3. If there is more than one level, the merged proposals are cut down to
//!    `fpn_post_nms_top_n` again (see [`select_over_all_levels`]).
//! 4. During training, the ground truth boxes are appended to each image's proposals.

pub mod level;
pub mod select;

use std::{fmt, sync::Arc};

use crate::{
    box_coder::BoxCoder,
    boxlist::BoxList,
    dump::{NullSink, TensorSink},
    iter::zip_exact,
    tensor::FeatureMap,
    timer::Timer,
    Error,
};

pub use level::LevelDecoder;
pub use select::{add_gt_proposals, select_over_all_levels, BudgetPolicy};

/// Whether the postprocessor runs as part of training or inference.
///
/// Training differs in that the post-NMS budget may be shared by the batch, and that ground truth
/// boxes are appended to the proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

/// Post-processes RPN head outputs into per-image proposals.
pub struct RpnPostProcessor {
    decoder: LevelDecoder,
    fpn_post_nms_top_n: usize,
    policy: BudgetPolicy,
    mode: Mode,
    sink: Arc<dyn TensorSink>,
    t_select: Timer,
}

impl RpnPostProcessor {
    /// Creates a postprocessor in [`Mode::Inference`].
    ///
    /// The codec uses unit weights, `fpn_post_nms_top_n` defaults to `post_nms_top_n`, and the
    /// budget is shared by the batch during training.
    pub fn new(pre_nms_top_n: usize, post_nms_top_n: usize, nms_thresh: f32, min_size: f32) -> Self {
        Self {
            decoder: LevelDecoder::new(
                pre_nms_top_n,
                post_nms_top_n,
                nms_thresh,
                min_size,
                BoxCoder::default(),
            ),
            fpn_post_nms_top_n: post_nms_top_n,
            policy: BudgetPolicy::default(),
            mode: Mode::Inference,
            sink: Arc::new(NullSink),
            t_select: Timer::new("select"),
        }
    }

    pub fn with_box_coder(mut self, box_coder: BoxCoder) -> Self {
        let d = &self.decoder;
        self.decoder = LevelDecoder::new(
            d.pre_nms_top_n(),
            d.post_nms_top_n(),
            d.nms_thresh(),
            d.min_size(),
            box_coder,
        );
        self
    }

    /// Sets the number of proposals kept per image (or per batch) after merging all levels.
    pub fn with_fpn_post_nms_top_n(mut self, fpn_post_nms_top_n: usize) -> Self {
        self.fpn_post_nms_top_n = fpn_post_nms_top_n;
        self
    }

    /// Sets how the post-NMS budget is shared during training. Inference always uses
    /// [`BudgetPolicy::PerImage`].
    pub fn with_policy(mut self, policy: BudgetPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Reports intermediate arrays to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn TensorSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Switches to [`Mode::Training`].
    pub fn train(&mut self) {
        self.mode = Mode::Training;
    }

    /// Switches to [`Mode::Inference`].
    pub fn eval(&mut self) {
        self.mode = Mode::Inference;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn decoder(&self) -> &LevelDecoder {
        &self.decoder
    }

    pub fn fpn_post_nms_top_n(&self) -> usize {
        self.fpn_post_nms_top_n
    }

    pub fn policy(&self) -> BudgetPolicy {
        self.policy
    }

    /// Returns the decode, NMS and level selection timers.
    pub fn timers(&self) -> [&Timer; 3] {
        let [decode, nms] = self.decoder.timers();
        [decode, nms, &self.t_select]
    }

    /// Computes the proposals of a batch.
    ///
    /// - `anchors[i][l]` are the anchors of image `i` on pyramid level `l`.
    /// - `objectness[l]` and `regression[l]` are the `[N, A, H, W]` and `[N, A * 4, H, W]` head
    ///   outputs for level `l`.
    /// - `targets` are the ground truth boxes of each image. They are only used in
    ///   [`Mode::Training`].
    ///
    /// Returns one proposal list per image, each with an `objectness` field. All inputs are
    /// checked before any proposals are computed.
    pub fn forward(
        &self,
        anchors: &[Vec<BoxList>],
        objectness: &[FeatureMap],
        regression: &[FeatureMap],
        targets: Option<&[BoxList]>,
    ) -> Result<Vec<BoxList>, Error> {
        let num_levels = objectness.len();
        if num_levels == 0 {
            return Err(Error::NoLevels);
        }
        if regression.len() != num_levels {
            return Err(Error::LevelCount {
                what: "box regression",
                expected: num_levels,
                got: regression.len(),
            });
        }
        if let Some(per_image) = anchors.iter().find(|a| a.len() != num_levels) {
            return Err(Error::LevelCount {
                what: "anchors",
                expected: num_levels,
                got: per_image.len(),
            });
        }
        let targets = match (self.mode, targets) {
            (Mode::Training, Some(targets)) => {
                if targets.len() != anchors.len() {
                    return Err(Error::BatchSize {
                        what: "targets",
                        expected: anchors.len(),
                        got: targets.len(),
                    });
                }
                Some(targets)
            }
            _ => None,
        };

        let per_level_anchors: Vec<Vec<&BoxList>> = (0..num_levels)
            .map(|level| anchors.iter().map(|per_image| &per_image[level]).collect())
            .collect();
        for (level, ((anchors, obj), reg)) in
            zip_exact(zip_exact(&per_level_anchors, objectness), regression).enumerate()
        {
            level::check_level_inputs(anchors, obj, reg, level + 1)?;
        }

        // Levels are numbered from 1 in dump names.
        let mut per_image: Vec<Vec<BoxList>> = (0..anchors.len())
            .map(|_| Vec::with_capacity(num_levels))
            .collect();
        for (level, ((anchors, obj), reg)) in
            zip_exact(zip_exact(&per_level_anchors, objectness), regression).enumerate()
        {
            let sampled = self
                .decoder
                .decode_level(anchors, obj, reg, level + 1, &*self.sink)?;
            for (lists, list) in zip_exact(&mut per_image, sampled) {
                lists.push(list);
            }
        }

        let mut boxlists = per_image
            .iter()
            .map(|lists| BoxList::cat(lists))
            .collect::<Result<Vec<_>, Error>>()?;

        if num_levels > 1 {
            let policy = match self.mode {
                Mode::Training => self.policy,
                Mode::Inference => BudgetPolicy::PerImage,
            };
            boxlists = self
                .t_select
                .time(|| select_over_all_levels(boxlists, policy, self.fpn_post_nms_top_n))?;
        }

        if let Some(targets) = targets {
            boxlists = add_gt_proposals(boxlists, targets)?;
        }

        if self.sink.enabled() {
            for (img, list) in boxlists.iter().enumerate() {
                self.sink
                    .emit("rpn", &format!("final_proposals_img_{img}"), list.bbox().into_dyn());
            }
        }
        log::debug!(
            "{:?}: {} images, {} levels, {} proposals",
            self.mode,
            boxlists.len(),
            num_levels,
            boxlists.iter().map(BoxList::len).sum::<usize>(),
        );

        Ok(boxlists)
    }
}

impl fmt::Debug for RpnPostProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpnPostProcessor")
            .field("decoder", &self.decoder)
            .field("fpn_post_nms_top_n", &self.fpn_post_nms_top_n)
            .field("policy", &self.policy)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
