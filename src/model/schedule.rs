//! Cumulative unmasking schedule for iterative decoding.

/// Default steepness of the exponential schedule.
pub const DEFAULT_SCHEDULE_K: f64 = 5.0;

/// Number of positions that should be resolved once step `step` (0-indexed) is done.
///
/// Follows `total * (exp(k * step / total_steps) - 1) / (exp(k) - 1)`: few commits early,
/// most at the end. The last step always returns exactly `total_positions`, later steps
/// stay flat there.
pub fn exp_schedule(step: usize, total_steps: usize, total_positions: usize, k: f64) -> f64 {
    let total = total_positions as f64;
    if total_steps >= 1 && step >= total_steps - 1 {
        return total;
    }
    let x = step as f64 / total_steps.max(1) as f64;
    let fraction = if k.abs() < 1e-8 {
        // k -> 0 limit of expm1(k x) / expm1(k)
        x
    } else {
        (k * x).exp_m1() / k.exp_m1()
    };
    (total * fraction).min(total)
}

/// Integer target for a step: the schedule value rounded up.
pub fn schedule_target(step: usize, total_steps: usize, total_positions: usize, k: f64) -> usize {
    exp_schedule(step, total_steps, total_positions, k).ceil() as usize
}

/// Positions to commit this step for one batch element.
///
/// At least `floor` (progress even when the schedule stalls), at most `num_masked`.
pub fn commit_count(target: usize, num_resolved: usize, num_masked: usize, floor: usize) -> usize {
    target
        .saturating_sub(num_resolved)
        .max(floor)
        .min(num_masked)
}

/// Minimum commits per step: 1/16 of the horizon, never zero.
pub fn commit_floor(total_positions: usize) -> usize {
    (total_positions / 16).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_step_is_exact() {
        for steps in 1..12 {
            for n in [0usize, 1, 7, 12, 24, 1000] {
                assert_eq!(exp_schedule(steps - 1, steps, n, DEFAULT_SCHEDULE_K), n as f64);
                assert_eq!(schedule_target(steps - 1, steps, n, 2.5), n);
            }
        }
    }

    #[test]
    fn single_step_budget_resolves_everything() {
        assert_eq!(exp_schedule(0, 1, 37, DEFAULT_SCHEDULE_K), 37.0);
    }

    #[test]
    fn starts_at_zero_and_grows() {
        let n = 240;
        let steps = 10;
        assert_eq!(exp_schedule(0, steps, n, DEFAULT_SCHEDULE_K), 0.0);
        let mut prev = -1.0;
        for m in 0..steps {
            let v = exp_schedule(m, steps, n, DEFAULT_SCHEDULE_K);
            assert!(v > prev, "step {m}: {v} <= {prev}");
            assert!(v <= n as f64);
            prev = v;
        }
    }

    #[test]
    fn convex_growth() {
        let steps = 8;
        let vals: Vec<f64> = (0..steps - 1)
            .map(|m| exp_schedule(m, steps, 1000, DEFAULT_SCHEDULE_K))
            .collect();
        for w in vals.windows(3) {
            assert!(w[2] - w[1] > w[1] - w[0]);
        }
    }

    #[test]
    fn flat_after_budget_and_zero_steps() {
        assert_eq!(exp_schedule(20, 5, 64, DEFAULT_SCHEDULE_K), 64.0);
        // No step budget: divisor floored at 1, value capped at total.
        assert!(exp_schedule(0, 0, 64, DEFAULT_SCHEDULE_K).is_finite());
        assert!(exp_schedule(3, 0, 64, DEFAULT_SCHEDULE_K) <= 64.0);
    }

    #[test]
    fn zero_steepness_is_linear() {
        let v = exp_schedule(2, 4, 100, 0.0);
        assert!((v - 50.0).abs() < 1e-9);
    }

    #[test]
    fn commit_count_clamps() {
        // schedule ahead of progress
        assert_eq!(commit_count(10, 4, 20, 1), 6);
        // schedule stalled: floor applies
        assert_eq!(commit_count(3, 5, 20, 2), 2);
        // never more than what is left
        assert_eq!(commit_count(100, 0, 7, 1), 7);
        assert_eq!(commit_count(0, 0, 1, 4), 1);
    }

    #[test]
    fn floor_is_sixteenth() {
        assert_eq!(commit_floor(12), 1);
        assert_eq!(commit_floor(64), 4);
        assert_eq!(commit_floor(0), 1);
    }
}
