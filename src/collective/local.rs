use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

use super::{CollectiveError, ProcessGroup, ReduceOp, Result, fold_in_rank_order};

struct Slot {
    op: ReduceOp,
    values: Vec<f64>,
}

struct Shared {
    slots: Mutex<Vec<Option<Slot>>>,
    barrier: Barrier,
    aborted: CancellationToken,
    abort_reason: Mutex<Option<(usize, String)>>,
}

/// A process group whose members live in the same process, one handle per simulated rank.
///
/// Each collective is two rendezvous: every member publishes its slot and waits, then every
/// member folds all slots in rank order and waits again before a slot may be rewritten.
pub struct LocalGroup {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates the handles of a group of `size` members, indexed by rank.
    pub fn new(size: usize) -> Vec<Self> {
        let shared = Arc::new(Shared {
            slots: Mutex::new((0..size).map(|_| None).collect()),
            barrier: Barrier::new(size),
            aborted: CancellationToken::new(),
            abort_reason: Mutex::new(None),
        });

        (0..size)
            .map(|rank| Self {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// A group of one, where every collective is the identity.
    pub fn single() -> Self {
        let mut group = Self::new(1);
        group.remove(0)
    }

    async fn rendezvous(&self) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.shared.aborted.cancelled() => Err(self.aborted_error()),
            _ = self.shared.barrier.wait() => Ok(()),
        }
    }

    fn aborted_error(&self) -> CollectiveError {
        let (rank, reason) = self
            .shared
            .abort_reason
            .lock()
            .clone()
            .unwrap_or_else(|| (self.rank, "group aborted".to_string()));

        CollectiveError::PeerAborted { rank, reason }
    }

    fn fold_slots(&self, values: &mut [f64], op: ReduceOp) -> Result<()> {
        let slots = self.shared.slots.lock();
        let mut rows = Vec::with_capacity(self.size);

        for (rank, slot) in slots.iter().enumerate() {
            let Some(slot) = slot else {
                return Err(CollectiveError::Protocol(format!(
                    "rank {rank} reached the rendezvous without a contribution"
                )));
            };

            if slot.op != op || slot.values.len() != values.len() {
                return Err(CollectiveError::Mismatch(format!(
                    "rank {} issued {:?} over {} values, rank {rank} issued {:?} over {}",
                    self.rank,
                    op,
                    values.len(),
                    slot.op,
                    slot.values.len()
                )));
            }

            rows.push(slot.values.as_slice());
        }

        fold_in_rank_order(rows, op, values);
        Ok(())
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn all_reduce(&mut self, values: &mut [f64], op: ReduceOp) -> Result<()> {
        if self.shared.aborted.is_cancelled() {
            return Err(self.aborted_error());
        }

        self.shared.slots.lock()[self.rank] = Some(Slot {
            op,
            values: values.to_vec(),
        });

        self.rendezvous().await?;
        let folded = self.fold_slots(values, op);
        self.rendezvous().await?;
        folded
    }

    async fn barrier(&mut self) -> Result<()> {
        if self.shared.aborted.is_cancelled() {
            return Err(self.aborted_error());
        }

        self.rendezvous().await
    }

    async fn abort(&mut self, reason: &str) {
        {
            let mut slot = self.shared.abort_reason.lock();
            if slot.is_none() {
                *slot = Some((self.rank, reason.to_string()));
            }
        }

        self.shared.aborted.cancel();
    }

    async fn leave(&mut self) -> Result<()> {
        self.barrier().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_all<F, Fut, T>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(LocalGroup) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = LocalGroup::new(size)
            .into_iter()
            .map(|g| tokio::spawn(f(g)))
            .collect();

        let mut out = Vec::with_capacity(size);
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn all_reduce_is_the_same_on_every_rank() {
        let results = run_all(4, |mut g| async move {
            let r = g.rank() as f64;
            let mut mean = [r, 10.0 * r];
            g.all_reduce(&mut mean, ReduceOp::Mean).await.unwrap();

            let mut max = [r];
            g.all_reduce(&mut max, ReduceOp::Max).await.unwrap();

            (mean, max)
        })
        .await;

        for (mean, max) in results {
            assert_eq!(mean, [1.5, 15.0]);
            assert_eq!(max, [3.0]);
        }
    }

    #[tokio::test]
    async fn repeated_collectives_do_not_bleed_into_each_other() {
        let results = run_all(3, |mut g| async move {
            let mut sums = Vec::new();
            for i in 0..50 {
                let mut v = [(g.rank() + i) as f64];
                g.all_reduce(&mut v, ReduceOp::Sum).await.unwrap();
                sums.push(v[0]);
            }
            sums
        })
        .await;

        let expected: Vec<f64> = (0..50).map(|i| (3 * i + 3) as f64).collect();
        for sums in results {
            assert_eq!(sums, expected);
        }
    }

    #[tokio::test]
    async fn leave_after_an_abort_reports_the_abort() {
        let mut groups = LocalGroup::new(2);
        let mut second = groups.pop().unwrap();
        let mut first = groups.pop().unwrap();

        second.abort("disk full").await;
        match first.leave().await {
            Err(CollectiveError::PeerAborted { rank, reason }) => {
                assert_eq!(rank, 1);
                assert_eq!(reason, "disk full");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn mismatched_op_is_reported_everywhere() {
        let results = run_all(2, |mut g| async move {
            let op = if g.rank() == 0 {
                ReduceOp::Max
            } else {
                ReduceOp::Min
            };
            let mut v = [1.0];
            g.all_reduce(&mut v, op).await
        })
        .await;

        for res in results {
            assert!(matches!(res, Err(CollectiveError::Mismatch(_))));
        }
    }

    #[tokio::test]
    async fn abort_releases_blocked_members() {
        let mut groups = LocalGroup::new(2);
        let mut second = groups.pop().unwrap();
        let mut first = groups.pop().unwrap();

        let blocked = tokio::spawn(async move {
            let mut v = [1.0];
            second.all_reduce(&mut v, ReduceOp::Sum).await
        });

        first.abort("disk on fire").await;

        let err = blocked.await.unwrap().unwrap_err();
        match err {
            CollectiveError::PeerAborted { rank, reason } => {
                assert_eq!(rank, 0);
                assert_eq!(reason, "disk on fire");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let mut v = [1.0];
        assert!(first.all_reduce(&mut v, ReduceOp::Sum).await.is_err());
    }

    #[tokio::test]
    async fn single_group_is_identity() {
        let mut g = LocalGroup::single();
        let mut v = [4.0, f64::INFINITY];
        g.all_reduce(&mut v, ReduceOp::Mean).await.unwrap();
        assert_eq!(v, [4.0, f64::INFINITY]);
        g.barrier().await.unwrap();
    }
}
