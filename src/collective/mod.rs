//! Collective operations across every process of the run.

mod error;
mod local;
mod reducer;
mod tcp;

pub use comms::ReduceOp;
pub use error::{CollectiveError, Result};
pub use local::LocalGroup;
pub use reducer::{DistributedReducer, GlobalLoss};
pub use tcp::TcpGroup;

/// A group of cooperating processes able to run collectives.
///
/// Every member must issue the same collectives, in the same order, with the same op and
/// length. A member that skips one leaves the others blocked on it.
#[trait_variant::make(ProcessGroup: Send)]
pub trait ProcessGroupTemplate {
    /// This process's rank within the group.
    fn rank(&self) -> usize;

    /// The amount of processes in the group.
    fn size(&self) -> usize;

    /// Reduces `values` elementwise across the group in place.
    ///
    /// # Arguments
    /// * `values` - This process's contribution, overwritten with the reduced result.
    /// * `op` - The reduction to apply.
    ///
    /// # Returns
    /// An error if the transport fails, a peer aborted or the members disagree on the
    /// collective's shape.
    async fn all_reduce(&mut self, values: &mut [f64], op: ReduceOp) -> Result<()>;

    /// Waits until every member reaches the barrier.
    async fn barrier(&mut self) -> Result<()>;

    /// Tells the rest of the group this process is failing. Best effort.
    async fn abort(&mut self, reason: &str);

    /// Leaves the group once every member has finished its collectives. Nothing may be
    /// issued afterwards.
    async fn leave(&mut self) -> Result<()>;
}

/// Folds `contributions`, given in rank order, into `out`.
///
/// The fold order is fixed so the result is identical on every process no matter which
/// contribution arrived first. `Max` and `Min` propagate NaN.
pub(crate) fn fold_in_rank_order<'a, I>(contributions: I, op: ReduceOp, out: &mut [f64])
where
    I: IntoIterator<Item = &'a [f64]>,
{
    let mut count = 0usize;
    for values in contributions {
        if count == 0 {
            out.copy_from_slice(values);
        } else {
            for (acc, &v) in out.iter_mut().zip(values) {
                *acc = combine(*acc, v, op);
            }
        }
        count += 1;
    }

    if op == ReduceOp::Mean && count > 0 {
        let n = count as f64;
        out.iter_mut().for_each(|v| *v /= n);
    }
}

fn combine(acc: f64, v: f64, op: ReduceOp) -> f64 {
    match op {
        ReduceOp::Sum | ReduceOp::Mean => acc + v,
        ReduceOp::Max if acc.is_nan() || v.is_nan() => f64::NAN,
        ReduceOp::Max => acc.max(v),
        ReduceOp::Min if acc.is_nan() || v.is_nan() => f64::NAN,
        ReduceOp::Min => acc.min(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(rows: &[&[f64]], op: ReduceOp) -> Vec<f64> {
        let mut out = vec![0.0; rows[0].len()];
        fold_in_rank_order(rows.iter().copied(), op, &mut out);
        out
    }

    #[test]
    fn fold_applies_each_op() {
        let rows: &[&[f64]] = &[&[1.0, -2.0], &[3.0, 4.0], &[5.0, 1.0]];

        assert_eq!(fold(rows, ReduceOp::Sum), vec![9.0, 3.0]);
        assert_eq!(fold(rows, ReduceOp::Mean), vec![3.0, 1.0]);
        assert_eq!(fold(rows, ReduceOp::Max), vec![5.0, 4.0]);
        assert_eq!(fold(rows, ReduceOp::Min), vec![1.0, -2.0]);
    }

    #[test]
    fn max_and_min_propagate_nan() {
        let rows: &[&[f64]] = &[&[1.0], &[f64::NAN], &[3.0]];
        assert!(fold(rows, ReduceOp::Max)[0].is_nan());
        assert!(fold(rows, ReduceOp::Min)[0].is_nan());

        let rows: &[&[f64]] = &[&[f64::NAN], &[3.0]];
        assert!(fold(rows, ReduceOp::Max)[0].is_nan());
    }

    #[test]
    fn single_contribution_is_identity() {
        let rows: &[&[f64]] = &[&[2.5, 7.0]];
        for op in [ReduceOp::Sum, ReduceOp::Mean, ReduceOp::Max, ReduceOp::Min] {
            assert_eq!(fold(rows, op), vec![2.5, 7.0]);
        }
    }
}
