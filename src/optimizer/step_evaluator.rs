//! Non-monotonic step acceptance bookkeeping.
//!
//! The step evaluator tracks three cost accumulators so the trust-region loop
//! can accept steps that temporarily increase the objective, which helps it
//! traverse narrow valleys where the quadratic model is poor:
//!
//! - the *current* cost at the iterate,
//! - the *reference* cost that step quality is measured against, and
//! - the *candidate* cost that will become the reference once the window of
//!   consecutive non-monotonic steps elapses.
//!
//! With a window of zero the evaluator degenerates to classic monotonic
//! descent: the reference always tracks the best cost seen so far.

/// Tracks accepted-step history and scores prospective steps.
#[derive(Debug, Clone)]
pub struct TrustRegionStepEvaluator {
    max_consecutive_nonmonotonic_steps: usize,
    minimum_cost: f64,
    current_cost: f64,
    reference_cost: f64,
    candidate_cost: f64,
    accumulated_reference_model_cost_change: f64,
    accumulated_candidate_model_cost_change: f64,
    num_consecutive_nonmonotonic_steps: usize,
}

impl TrustRegionStepEvaluator {
    /// Create an evaluator seated at `initial_cost`. A window of
    /// `max_consecutive_nonmonotonic_steps == 0` yields strict monotonic
    /// descent.
    pub fn new(initial_cost: f64, max_consecutive_nonmonotonic_steps: usize) -> Self {
        TrustRegionStepEvaluator {
            max_consecutive_nonmonotonic_steps,
            minimum_cost: initial_cost,
            current_cost: initial_cost,
            reference_cost: initial_cost,
            candidate_cost: initial_cost,
            accumulated_reference_model_cost_change: 0.0,
            accumulated_candidate_model_cost_change: 0.0,
            num_consecutive_nonmonotonic_steps: 0,
        }
    }

    /// Quality of a step that would move the iterate to `cost`, given the
    /// decrease `model_cost_change` predicted by the quadratic model.
    ///
    /// The immediate ratio compares against the current cost, the historical
    /// ratio against the reference cost and the model decrease accumulated
    /// since the reference was set; the better of the two is returned.
    pub fn step_quality(&self, cost: f64, model_cost_change: f64) -> f64 {
        let relative_decrease = (self.current_cost - cost) / model_cost_change;
        let historical_relative_decrease = (self.reference_cost - cost)
            / (self.accumulated_reference_model_cost_change + model_cost_change);
        relative_decrease.max(historical_relative_decrease)
    }

    /// Record an accepted step that moved the iterate to `cost`.
    pub fn step_accepted(&mut self, cost: f64, model_cost_change: f64) {
        self.current_cost = cost;
        self.accumulated_candidate_model_cost_change += model_cost_change;
        self.accumulated_reference_model_cost_change += model_cost_change;

        if cost < self.minimum_cost {
            self.minimum_cost = cost;
            self.num_consecutive_nonmonotonic_steps = 0;
            self.candidate_cost = cost;
            self.accumulated_candidate_model_cost_change = 0.0;
        } else {
            self.num_consecutive_nonmonotonic_steps += 1;
            if cost > self.candidate_cost {
                self.candidate_cost = cost;
                self.accumulated_candidate_model_cost_change = 0.0;
            }
        }

        // Unconditional window check: with a window of zero the reference is
        // refreshed on every accepted step.
        if self.num_consecutive_nonmonotonic_steps == self.max_consecutive_nonmonotonic_steps {
            self.reference_cost = self.candidate_cost;
            self.accumulated_reference_model_cost_change =
                self.accumulated_candidate_model_cost_change;
        }
    }

    pub fn minimum_cost(&self) -> f64 {
        self.minimum_cost
    }

    pub fn current_cost(&self) -> f64 {
        self.current_cost
    }

    pub fn reference_cost(&self) -> f64 {
        self.reference_cost
    }

    pub fn candidate_cost(&self) -> f64 {
        self.candidate_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_reference_tracks_current() {
        let mut evaluator = TrustRegionStepEvaluator::new(10.0, 0);

        evaluator.step_accepted(8.0, 1.0);
        assert_eq!(evaluator.current_cost(), 8.0);
        assert_eq!(evaluator.reference_cost(), 8.0);

        evaluator.step_accepted(5.0, 1.0);
        assert_eq!(evaluator.reference_cost(), 5.0);
        assert_eq!(evaluator.minimum_cost(), 5.0);
    }

    #[test]
    fn test_step_quality_monotonic() {
        let evaluator = TrustRegionStepEvaluator::new(10.0, 0);
        // Immediate ratio: (10 - 9) / 2 = 0.5; historical identical at start.
        assert!((evaluator.step_quality(9.0, 2.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_nonmonotonic_window_resets_reference() {
        // Accepted cost sequence 10 -> 12 -> 11 -> 9 with a window of two
        // non-monotonic steps. The second consecutive non-decreasing step
        // promotes the worst-since-minimum cost (12) to reference.
        let mut evaluator = TrustRegionStepEvaluator::new(10.0, 2);

        evaluator.step_accepted(12.0, 1.0);
        assert_eq!(evaluator.reference_cost(), 10.0);
        assert_eq!(evaluator.candidate_cost(), 12.0);

        evaluator.step_accepted(11.0, 1.0);
        assert_eq!(evaluator.reference_cost(), 12.0);

        evaluator.step_accepted(9.0, 1.0);
        assert_eq!(evaluator.minimum_cost(), 9.0);
        assert_eq!(evaluator.candidate_cost(), 9.0);
    }

    #[test]
    fn test_step_quality_uses_better_of_two_ratios() {
        let mut evaluator = TrustRegionStepEvaluator::new(10.0, 5);
        // Move uphill; the reference stays at 10.
        evaluator.step_accepted(12.0, 1.0);

        // From cost 12, a step to 9.5: immediate ratio (12 - 9.5)/1 = 2.5,
        // historical (10 - 9.5)/(1 + 1) = 0.25.
        assert!((evaluator.step_quality(9.5, 1.0) - 2.5).abs() < 1e-12);

        // A step to 11.9 barely helps immediately but is nothing historically:
        // immediate 0.1, historical (10 - 11.9)/2 < 0.
        assert!((evaluator.step_quality(11.9, 1.0) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_new_minimum_resets_window() {
        let mut evaluator = TrustRegionStepEvaluator::new(10.0, 3);
        evaluator.step_accepted(11.0, 1.0);
        evaluator.step_accepted(10.5, 1.0);
        evaluator.step_accepted(8.0, 1.0);
        // The new minimum resets the non-monotonic counter, so two more
        // uphill steps do not hit the window of three.
        evaluator.step_accepted(9.0, 1.0);
        evaluator.step_accepted(9.5, 1.0);
        assert_eq!(evaluator.reference_cost(), 10.0);
    }
}
