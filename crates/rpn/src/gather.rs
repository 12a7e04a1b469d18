//! Collecting per-worker results on a main worker.
//!
//! Evaluation is typically split across several workers, each processing a disjoint subset of the
//! dataset. Before results can be written or scored, they have to be collected in one place. A
//! [`ProcessGroup`] connects a fixed number of in-process workers (eg. threads), identified by
//! their rank, with channels and a shared barrier. Rank 0 is the main worker.
//!
//! Every collective operation must be called by all members of the group, in the same order.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Barrier},
};

use anyhow::{anyhow, Context};
use crossbeam::channel::{Receiver, Sender};
use itertools::Itertools;

type Message = (usize, Box<dyn Any + Send>);

/// Factory for the members of a group of workers.
pub struct ProcessGroup;

impl ProcessGroup {
    /// Creates a group of `world_size` workers and returns one [`Member`] per rank, in rank order.
    ///
    /// # Panics
    ///
    /// Panics if `world_size` is 0.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(world_size: usize) -> Vec<Member> {
        assert!(world_size > 0, "a process group needs at least one member");
        let (sender, recv) = crossbeam::channel::unbounded();
        let barrier = Arc::new(Barrier::new(world_size));
        (0..world_size)
            .map(|rank| Member {
                rank,
                world_size,
                sender: sender.clone(),
                recv: (rank == 0).then(|| recv.clone()),
                barrier: barrier.clone(),
            })
            .collect()
    }
}

/// One worker's handle to its [`ProcessGroup`].
pub struct Member {
    rank: usize,
    world_size: usize,
    sender: Sender<Message>,
    recv: Option<Receiver<Message>>,
    barrier: Arc<Barrier>,
}

impl Member {
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Returns whether this is the main worker (rank 0).
    #[inline]
    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    /// Blocks until every member of the group has called `synchronize`.
    pub fn synchronize(&self) {
        if self.world_size > 1 {
            self.barrier.wait();
        }
    }

    /// Collects one value from every member on the main worker.
    ///
    /// The main worker receives all values in rank order. All other workers receive `None` once
    /// the main worker has collected everything.
    pub fn all_gather<T: Send + 'static>(&self, value: T) -> anyhow::Result<Option<Vec<T>>> {
        if self.world_size == 1 {
            return Ok(Some(vec![value]));
        }

        // Only the main worker receives, so this fails once it is gone and the barrier can no
        // longer be passed by anyone.
        self.sender
            .send((self.rank, Box::new(value)))
            .map_err(|_| anyhow!("main worker of the process group has exited"))?;

        // The main worker must reach the barrier even if it fails, or everyone else would hang.
        let gathered = self.recv.as_ref().map(|recv| self.receive_all::<T>(recv));
        self.barrier.wait();
        gathered.transpose()
    }

    fn receive_all<T: 'static>(&self, recv: &Receiver<Message>) -> anyhow::Result<Vec<T>> {
        let mut messages = Vec::with_capacity(self.world_size);
        for _ in 0..self.world_size {
            messages.push(
                recv.recv()
                    .context("process group was closed during `all_gather`")?,
            );
        }

        messages
            .into_iter()
            .sorted_by_key(|(rank, _)| *rank)
            .map(|(rank, value)| {
                value
                    .downcast::<T>()
                    .map(|value| *value)
                    .map_err(|_| anyhow!("worker {rank} passed a different type to `all_gather`"))
            })
            .collect()
    }
}

/// Per-image results merged from all workers.
#[derive(Debug, Clone, PartialEq)]
pub struct Gathered<T> {
    /// Results sorted by image ID.
    pub predictions: Vec<(u64, T)>,
    /// Whether the image IDs are exactly `0..predictions.len()`.
    ///
    /// If this is `false`, some images were not evaluated by any worker.
    pub contiguous: bool,
}

/// Merges the per-image results of all workers on the main worker.
///
/// Returns `None` on all other workers. A gap in the image IDs is logged as a warning, but the
/// results that were gathered are returned anyway.
pub fn accumulate_predictions<T: Send + 'static>(
    member: &Member,
    predictions: HashMap<u64, T>,
) -> anyhow::Result<Option<Gathered<T>>> {
    let Some(all) = member.all_gather(predictions)? else {
        return Ok(None);
    };

    let merged: BTreeMap<u64, T> = all.into_iter().flatten().collect();
    let contiguous = match merged.keys().next_back() {
        Some(&max) => max + 1 == merged.len() as u64,
        None => true,
    };
    if !contiguous {
        log::warn!(
            "number of images that were gathered from workers ({}) does not match the image IDs; \
             some images might be missing from the evaluation",
            merged.len()
        );
    }

    Ok(Some(Gathered {
        predictions: merged.into_iter().collect(),
        contiguous,
    }))
}

/// Averages named scalars (eg. losses) across all workers.
///
/// Only the main worker receives the averaged values; all other workers receive `None`. Names that
/// are missing on some workers are averaged over the workers that reported them.
pub fn reduce_mean(
    member: &Member,
    values: BTreeMap<String, f32>,
) -> anyhow::Result<Option<BTreeMap<String, f32>>> {
    let Some(all) = member.all_gather(values)? else {
        return Ok(None);
    };

    let mut sums: BTreeMap<String, (f32, usize)> = BTreeMap::new();
    for (name, value) in all.into_iter().flatten() {
        let entry = sums.entry(name).or_default();
        entry.0 += value;
        entry.1 += 1;
    }
    Ok(Some(
        sums.into_iter()
            .map(|(name, (sum, count))| (name, sum / count as f32))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    /// Runs `f` on every member of a new group of size `n`, each on its own thread.
    fn run<R: Send>(n: usize, f: impl Fn(Member) -> R + Sync) -> Vec<R> {
        let members = ProcessGroup::new(n);
        thread::scope(|s| {
            let handles: Vec<_> = members
                .into_iter()
                .map(|m| s.spawn(|| f(m)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn gather_is_rank_ordered() {
        let results = run(4, |m| {
            let first = m.all_gather(m.rank() * 10).unwrap();
            let second = m.all_gather(format!("r{}", m.rank())).unwrap();
            (first, second)
        });
        assert_eq!(results[0].0, Some(vec![0, 10, 20, 30]));
        assert_eq!(
            results[0].1,
            Some(["r0", "r1", "r2", "r3"].map(String::from).to_vec())
        );
        for (first, second) in &results[1..] {
            assert!(first.is_none() && second.is_none());
        }
    }

    #[test]
    fn single_member() {
        let m = ProcessGroup::new(1).pop().unwrap();
        assert!(m.is_main());
        m.synchronize();
        assert_eq!(m.all_gather(5).unwrap(), Some(vec![5]));
    }

    #[test]
    fn accumulate_detects_missing_images() {
        let results = run(2, |m| {
            // Image 2 was never evaluated.
            let ids: &[u64] = if m.is_main() { &[0, 3] } else { &[1] };
            let preds = ids.iter().map(|&id| (id, id * 100)).collect();
            accumulate_predictions(&m, preds).unwrap()
        });
        let gathered = results[0].as_ref().unwrap();
        assert_eq!(gathered.predictions, [(0, 0), (1, 100), (3, 300)]);
        assert!(!gathered.contiguous);
        assert!(results[1].is_none());

        let results = run(3, |m| {
            let preds = HashMap::from([(m.rank() as u64, ())]);
            accumulate_predictions(&m, preds).unwrap()
        });
        assert!(results[0].as_ref().unwrap().contiguous);
    }

    #[test]
    fn reduce_mean_averages() {
        let results = run(2, |m| {
            let loss = BTreeMap::from([
                ("loss_objectness".to_string(), m.rank() as f32 + 1.0),
                ("loss_rpn_box_reg".to_string(), 4.0),
            ]);
            m.synchronize();
            reduce_mean(&m, loss).unwrap()
        });
        let mean = results[0].as_ref().unwrap();
        assert_eq!(mean["loss_objectness"], 1.5);
        assert_eq!(mean["loss_rpn_box_reg"], 4.0);
        assert!(results[1].is_none());
    }

    #[test]
    fn gather_fails_after_main_worker_exits() {
        let mut members = ProcessGroup::new(3);
        let last = members.pop().unwrap();
        drop(members);
        let err = last.all_gather(7).unwrap_err();
        assert!(err.to_string().contains("main worker"), "{err}");
    }

    #[test]
    fn mismatched_types_fail_on_main() {
        let results = run(2, |m| {
            if m.is_main() {
                m.all_gather(1u32).map(|_| ())
            } else {
                m.all_gather("one").map(|_| ())
            }
        });
        assert!(results[0].is_err());
    }
}
