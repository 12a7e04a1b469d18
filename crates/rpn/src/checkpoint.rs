//! When to save training checkpoints, and under which name.

use serde::{Deserialize, Serialize};

/// Persists the training state under a name. Implemented by the training driver.
pub trait Checkpointer {
    fn save(&mut self, name: &str, iteration: u64) -> anyhow::Result<()>;
}

/// Saves a checkpoint every `period` iterations, and a final one at `max_iter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSchedule {
    period: u64,
    max_iter: u64,
}

impl CheckpointSchedule {
    /// # Panics
    ///
    /// Panics if `period` is 0.
    pub fn new(period: u64, max_iter: u64) -> Self {
        assert!(period > 0, "checkpoint period must be positive");
        Self { period, max_iter }
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn max_iter(&self) -> u64 {
        self.max_iter
    }

    /// Returns the checkpoint names due after finishing `iteration` (counted from 1).
    pub fn names_for(&self, iteration: u64) -> Vec<String> {
        let mut names = Vec::new();
        if iteration % self.period == 0 {
            names.push(format!("model_{iteration:07}"));
        }
        if iteration == self.max_iter {
            names.push("model_final".to_string());
        }
        names
    }

    /// Saves all checkpoints due after `iteration`.
    pub fn save_due(&self, iteration: u64, checkpointer: &mut dyn Checkpointer) -> anyhow::Result<()> {
        for name in self.names_for(iteration) {
            log::info!("saving checkpoint `{name}` at iteration {iteration}");
            checkpointer.save(&name, iteration)?;
        }
        Ok(())
    }
}
