use crate::errors::PathError;
use crate::model::Model;
use nalgebra::DVector;

/// A time path of state vectors, length `horizon + 1`. Index 0 is the initial
/// state and index `horizon` the steady state; both are boundary conditions
/// and never solved for. Only periods `1..horizon` are unknowns.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    states: Vec<DVector<f64>>,
}

impl Trajectory {
    /// A path constant at `steady` over `horizon + 1` periods.
    pub fn constant(steady: &DVector<f64>, horizon: usize) -> Self {
        Self {
            states: vec![steady.clone(); horizon + 1],
        }
    }

    pub fn horizon(&self) -> usize {
        self.states.len() - 1
    }

    pub fn nvars(&self) -> usize {
        self.states[0].len()
    }

    pub fn state(&self, t: usize) -> &DVector<f64> {
        &self.states[t]
    }

    pub fn state_mut(&mut self, t: usize) -> &mut DVector<f64> {
        &mut self.states[t]
    }

    pub fn states(&self) -> &[DVector<f64>] {
        &self.states
    }

    /// Flattens the interior periods `1..horizon` into one stacked vector of
    /// length `nvars * (horizon - 1)`, period-major.
    pub fn interior_flat(&self) -> DVector<f64> {
        let n = self.nvars();
        let horizon = self.horizon();
        let mut out = DVector::zeros(n * (horizon - 1));
        for t in 1..horizon {
            out.rows_mut((t - 1) * n, n).copy_from(&self.states[t]);
        }
        out
    }

    /// Scatters a stacked vector back into the interior periods. Boundary
    /// periods are left untouched.
    pub fn set_interior(&mut self, stacked: &DVector<f64>) {
        let n = self.nvars();
        let horizon = self.horizon();
        assert_eq!(stacked.len(), n * (horizon - 1));
        for t in 1..horizon {
            self.states[t].copy_from(&stacked.rows((t - 1) * n, n));
        }
    }
}

/// Realized shock values per interior period: `horizon - 1` rows of
/// `n_shocks` entries each, zero everywhere except the injected cell in
/// row 0 when a shock is supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct ShockSeries {
    rows: Vec<Vec<f64>>,
}

impl ShockSeries {
    pub fn zeros(periods: usize, n_shocks: usize) -> Self {
        Self {
            rows: vec![vec![0.0; n_shocks]; periods],
        }
    }

    /// Shock values at interior period `t` (1-based period index).
    pub fn row(&self, t: usize) -> &[f64] {
        &self.rows[t - 1]
    }

    pub fn periods(&self) -> usize {
        self.rows.len()
    }

    pub fn set(&mut self, period: usize, shock: usize, value: f64) {
        self.rows[period][shock] = value;
    }
}

/// The smallest horizon `H' >= horizon` whose interior period count divides
/// evenly across `lanes` worker lanes. With a shock in period 0 the first
/// interior period is evaluated on its own, so `H' - 2` rather than `H' - 1`
/// must divide. A single lane never pads, and a horizon too short to have
/// any interior to split is returned unchanged.
pub fn pad_horizon(horizon: usize, lanes: usize, shocked: bool) -> usize {
    if lanes <= 1 {
        return horizon;
    }
    let base = horizon.saturating_sub(1 + usize::from(shocked));
    match base % lanes {
        0 => horizon,
        rem => horizon + lanes - rem,
    }
}

/// Builds the initial-guess trajectory and the shock series for one solve.
///
/// The trajectory is the steady state everywhere, with period 0 overwritten
/// by `initial_state` and interior periods optionally overwritten by a
/// warm-start path (e.g. from a cheaper approximation) where it covers them.
/// Setup errors are raised here, before any numeric work.
pub fn build_path(
    model: &Model,
    horizon: usize,
    initial_state: Option<&[f64]>,
    shock: Option<(&str, f64)>,
    warm_start: Option<&Trajectory>,
) -> Result<(Trajectory, ShockSeries), PathError> {
    let n = model.nvars();

    let shock_cell = match shock {
        Some((name, magnitude)) => {
            let idx = model
                .shock_index(name)
                .ok_or_else(|| PathError::UnknownShock(name.to_string()))?;
            Some((idx, magnitude))
        }
        None => None,
    };

    if let Some(x0) = initial_state {
        if x0.len() != n {
            return Err(PathError::Dimension {
                what: "initial state",
                expected: n,
                got: x0.len(),
            });
        }
    }
    if let Some(warm) = warm_start {
        if warm.nvars() != n {
            return Err(PathError::Dimension {
                what: "warm start",
                expected: n,
                got: warm.nvars(),
            });
        }
    }

    let mut trajectory = Trajectory::constant(model.steady_state(), horizon);
    if let Some(x0) = initial_state {
        trajectory.state_mut(0).copy_from_slice(x0);
    }
    if let Some(warm) = warm_start {
        // Overwrite the interior periods the warm start covers.
        let last = warm.horizon().min(horizon - 1);
        for t in 1..=last {
            trajectory.state_mut(t).copy_from(warm.state(t));
        }
    }

    let mut shocks = ShockSeries::zeros(horizon - 1, model.shocks().len());
    if let Some((idx, magnitude)) = shock_cell {
        shocks.set(0, idx, magnitude);
    }

    Ok((trajectory, shocks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelSpec;
    use std::collections::HashMap;

    fn ar1_model() -> Model {
        Model::compile(ModelSpec {
            variables: vec!["x".to_string()],
            shocks: vec!["e_x".to_string()],
            parameters: vec![("rho".to_string(), 0.9)],
            aux_equations: vec![],
            equations: vec!["x = rho * xLag + e_x".to_string()],
            steady_state: HashMap::from([("x".to_string(), 0.0)]),
        })
        .unwrap()
    }

    #[test]
    fn padding_rule_over_lane_counts() {
        // (horizon, lanes, shocked) -> effective horizon
        let cases = [
            (50, 1, false, 50),
            (50, 1, true, 50),
            (41, 4, false, 41),  // (41-1) % 4 == 0, no change
            (42, 4, false, 45),  // rounded up to (45-1) % 4 == 0
            (43, 4, false, 45),
            (44, 4, false, 45),
            (45, 4, false, 45),
            (42, 4, true, 42),   // (42-2) % 4 == 0
            (43, 4, true, 46),
            (30, 7, false, 36),
            (1, 4, true, 1),     // degenerate horizon never underflows
            (1, 4, false, 1),
        ];
        for (horizon, lanes, shocked, expected) in cases {
            let padded = pad_horizon(horizon, lanes, shocked);
            assert_eq!(padded, expected, "pad_horizon({horizon}, {lanes}, {shocked})");
            assert!(padded >= horizon);
            if lanes > 1 {
                assert_eq!(padded.saturating_sub(1 + usize::from(shocked)) % lanes, 0);
            }
        }
    }

    #[test]
    fn builds_steady_path_with_initial_state() {
        let model = ar1_model();
        let (path, shocks) = build_path(&model, 10, Some(&[2.0]), None, None).unwrap();
        assert_eq!(path.horizon(), 10);
        assert_eq!(path.state(0)[0], 2.0);
        for t in 1..=10 {
            assert_eq!(path.state(t)[0], 0.0);
        }
        assert_eq!(shocks.periods(), 9);
    }

    #[test]
    fn shock_lands_in_first_interior_row() {
        let model = ar1_model();
        let (_, shocks) = build_path(&model, 10, None, Some(("e_x", 0.5)), None).unwrap();
        assert_eq!(shocks.row(1), &[0.5]);
        for t in 2..10 {
            assert_eq!(shocks.row(t), &[0.0]);
        }
    }

    #[test]
    fn unknown_shock_is_rejected_before_numeric_work() {
        let model = ar1_model();
        let err = build_path(&model, 10, None, Some(("e_y", 1.0)), None).unwrap_err();
        assert!(matches!(err, PathError::UnknownShock(ref name) if name == "e_y"));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let model = ar1_model();
        let err = build_path(&model, 10, Some(&[1.0, 2.0]), None, None).unwrap_err();
        assert!(matches!(
            err,
            PathError::Dimension {
                expected: 1,
                got: 2,
                ..
            }
        ));
    }

    #[test]
    fn warm_start_overwrites_covered_interior_only() {
        let model = ar1_model();
        let mut warm = Trajectory::constant(model.steady_state(), 4);
        for t in 0..=4 {
            warm.state_mut(t)[0] = t as f64;
        }
        let (path, _) = build_path(&model, 10, None, None, Some(&warm)).unwrap();
        // Boundary stays, covered interior copied, the rest steady.
        assert_eq!(path.state(0)[0], 0.0);
        for t in 1..=3 {
            assert_eq!(path.state(t)[0], t as f64);
        }
        assert_eq!(path.state(4)[0], 4.0);
        for t in 5..=10 {
            assert_eq!(path.state(t)[0], 0.0);
        }
    }

    #[test]
    fn interior_roundtrip() {
        let model = ar1_model();
        let (mut path, _) = build_path(&model, 5, Some(&[1.0]), None, None).unwrap();
        let mut stacked = path.interior_flat();
        assert_eq!(stacked.len(), 4);
        for i in 0..4 {
            stacked[i] = (i + 1) as f64;
        }
        path.set_interior(&stacked);
        assert_eq!(path.state(0)[0], 1.0);
        assert_eq!(path.state(2)[0], 2.0);
        assert_eq!(path.state(5)[0], 0.0);
        assert_eq!(path.interior_flat(), stacked);
    }
}
