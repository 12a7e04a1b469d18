//! RPN post-processing configuration.

use std::{fs, path::Path, sync::Arc};

use anyhow::{bail, ensure, Context};
use serde::{Deserialize, Serialize};

use crate::{
    box_coder::BoxCoder,
    dump::TensorSink,
    proposal::{BudgetPolicy, Mode, RpnPostProcessor},
};

/// Parameters of the RPN proposal postprocessor.
///
/// Budgets come in a training and a test variant; [`RpnPostProcessor::from_config`] picks the
/// one matching its [`Mode`]. Missing keys take the values of [`RpnConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpnConfig {
    /// Anchors kept per image and level before NMS, during training.
    pub pre_nms_top_n_train: usize,
    pub pre_nms_top_n_test: usize,
    /// Proposals kept per image and level after NMS, during training.
    pub post_nms_top_n_train: usize,
    pub post_nms_top_n_test: usize,
    /// Proposals kept after merging all levels, during training. Falls back to
    /// `post_nms_top_n_train` when absent.
    pub fpn_post_nms_top_n_train: Option<usize>,
    pub fpn_post_nms_top_n_test: Option<usize>,
    /// Whether the training budget `fpn_post_nms_top_n_train` is shared by the whole batch.
    pub fpn_post_nms_per_batch: bool,
    pub nms_thresh: f32,
    /// Minimum width and height of proposals, in pixels.
    pub min_size: f32,
    /// `(wx, wy, ww, wh)` weights of the box codec.
    pub box_coder_weights: [f32; 4],
}

impl Default for RpnConfig {
    fn default() -> Self {
        Self {
            pre_nms_top_n_train: 2000,
            pre_nms_top_n_test: 1000,
            post_nms_top_n_train: 2000,
            post_nms_top_n_test: 1000,
            fpn_post_nms_top_n_train: Some(2000),
            fpn_post_nms_top_n_test: Some(2000),
            fpn_post_nms_per_batch: true,
            nms_thresh: 0.7,
            min_size: 0.0,
            box_coder_weights: [1.0; 4],
        }
    }
}

impl RpnConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read RPN config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse RPN config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid RPN config {}", path.display()))?;
        Ok(config)
    }

    /// Checks that all values are usable.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.nms_thresh > 0.0 && self.nms_thresh < 1.0,
            "`nms_thresh` must be in (0, 1), got {}",
            self.nms_thresh
        );
        ensure!(
            self.min_size >= 0.0,
            "`min_size` must not be negative, got {}",
            self.min_size
        );
        let budgets = [
            ("pre_nms_top_n_train", Some(self.pre_nms_top_n_train)),
            ("pre_nms_top_n_test", Some(self.pre_nms_top_n_test)),
            ("post_nms_top_n_train", Some(self.post_nms_top_n_train)),
            ("post_nms_top_n_test", Some(self.post_nms_top_n_test)),
            ("fpn_post_nms_top_n_train", self.fpn_post_nms_top_n_train),
            ("fpn_post_nms_top_n_test", self.fpn_post_nms_top_n_test),
        ];
        for (name, budget) in budgets {
            if budget == Some(0) {
                bail!("`{name}` must be at least 1");
            }
        }
        if let Some(w) = self.box_coder_weights.iter().find(|w| !(w.is_finite() && **w > 0.0)) {
            bail!("box coder weights must be positive, got {w}");
        }
        Ok(())
    }

    pub fn pre_nms_top_n(&self, mode: Mode) -> usize {
        match mode {
            Mode::Training => self.pre_nms_top_n_train,
            Mode::Inference => self.pre_nms_top_n_test,
        }
    }

    pub fn post_nms_top_n(&self, mode: Mode) -> usize {
        match mode {
            Mode::Training => self.post_nms_top_n_train,
            Mode::Inference => self.post_nms_top_n_test,
        }
    }

    pub fn fpn_post_nms_top_n(&self, mode: Mode) -> usize {
        let budget = match mode {
            Mode::Training => self.fpn_post_nms_top_n_train,
            Mode::Inference => self.fpn_post_nms_top_n_test,
        };
        budget.unwrap_or_else(|| self.post_nms_top_n(mode))
    }

    pub fn policy(&self) -> BudgetPolicy {
        if self.fpn_post_nms_per_batch {
            BudgetPolicy::PerBatch
        } else {
            BudgetPolicy::PerImage
        }
    }
}

impl RpnPostProcessor {
    /// Creates a postprocessor for `mode` from a validated configuration.
    pub fn from_config(config: &RpnConfig, mode: Mode) -> anyhow::Result<Self> {
        config.validate()?;
        let rpn = Self::new(
            config.pre_nms_top_n(mode),
            config.post_nms_top_n(mode),
            config.nms_thresh,
            config.min_size,
        )
        .with_box_coder(BoxCoder::new(config.box_coder_weights))
        .with_fpn_post_nms_top_n(config.fpn_post_nms_top_n(mode))
        .with_policy(config.policy())
        .with_mode(mode);
        log::debug!("created RPN postprocessor: {rpn:?}");
        Ok(rpn)
    }

    /// Like [`RpnPostProcessor::from_config`], additionally reporting intermediate arrays to
    /// `sink`.
    pub fn from_config_with_sink(
        config: &RpnConfig,
        mode: Mode,
        sink: Arc<dyn TensorSink>,
    ) -> anyhow::Result<Self> {
        Ok(Self::from_config(config, mode)?.with_sink(sink))
    }
}
