use crate::autodiff::Dual;
use crate::path::ShockSeries;
use crate::traits::PeriodResidual;
use nalgebra::DVector;
use rayon::prelude::*;
use std::ops::Range;

/// Per-horizon layout of the stacked system: how interior periods are
/// partitioned across worker lanes. Built once per `(model, horizon)` and
/// cached on the model, the compiled-handle analog of the original design.
#[derive(Debug, Clone)]
pub struct StackedKernel {
    pub horizon: usize,
    pub nvars: usize,
    pub lanes: usize,
    /// Whether a shock occupies period 0, in which case the first interior
    /// period is evaluated on its own with the shock row.
    pub shocked: bool,
    /// Interior period count, `horizon - 1`.
    pub interior: usize,
    /// Contiguous ranges of interior period indices (1-based), one per lane.
    pub blocks: Vec<Range<usize>>,
}

impl StackedKernel {
    pub fn new(horizon: usize, nvars: usize, lanes: usize, shocked: bool) -> Self {
        let interior = horizon - 1;
        let first = if shocked { 2 } else { 1 };
        let count = horizon - first;

        // Contiguous, order-preserving partition. After horizon padding the
        // remainder is zero; an uneven count still partitions correctly.
        let lanes = lanes.max(1).min(count.max(1));
        let mut blocks = Vec::with_capacity(lanes);
        let chunk = count / lanes;
        let rem = count % lanes;
        let mut start = first;
        for lane in 0..lanes {
            let len = chunk + usize::from(lane < rem);
            blocks.push(start..start + len);
            start += len;
        }

        Self {
            horizon,
            nvars,
            lanes,
            shocked,
            interior,
            blocks,
        }
    }

    /// Length of the stacked unknown/residual vector.
    pub fn stacked_len(&self) -> usize {
        self.nvars * self.interior
    }
}

/// The stacked nonlinear system for one solve: the compiled residual
/// function wired to fixed boundary states, the shock series and the kernel
/// layout. All references are read-only; evaluation shares no mutable state
/// across lanes.
pub struct StackedSystem<'a, F> {
    pub residual_fn: &'a F,
    pub kernel: &'a StackedKernel,
    pub steady: &'a [f64],
    pub params: &'a [f64],
    /// Boundary state at period 0.
    pub initial: &'a DVector<f64>,
    /// Boundary state at the terminal period.
    pub endpoint: &'a DVector<f64>,
    pub shocks: &'a ShockSeries,
    pub parallel: bool,
}

impl<'a, F: PeriodResidual<f64>> StackedSystem<'a, F> {
    /// State of period `t` given the candidate interior `x`: boundaries come
    /// from the fixed endpoints, everything else from the stacked vector.
    pub fn period_state<'b>(&'b self, x: &'b DVector<f64>, t: usize) -> &'b [f64] {
        let n = self.kernel.nvars;
        if t == 0 {
            self.initial.as_slice()
        } else if t == self.kernel.horizon {
            self.endpoint.as_slice()
        } else {
            &x.as_slice()[(t - 1) * n..t * n]
        }
    }

    fn eval_periods(&self, x: &DVector<f64>, periods: Range<usize>) -> Vec<f64> {
        let n = self.kernel.nvars;
        let mut out = vec![0.0; n * periods.len()];
        let mut scratch = Vec::new();
        for (k, t) in periods.enumerate() {
            self.residual_fn.eval(
                self.period_state(x, t - 1),
                self.period_state(x, t),
                self.period_state(x, t + 1),
                self.steady,
                self.shocks.row(t),
                self.params,
                &mut out[k * n..(k + 1) * n],
                &mut scratch,
            );
        }
        out
    }

    /// Evaluates the stacked residual at the candidate interior `x`:
    /// one `nvars`-block per interior period, concatenated in period order.
    pub fn residual_at(&self, x: &DVector<f64>) -> DVector<f64> {
        let n = self.kernel.nvars;
        if !self.parallel {
            return DVector::from_vec(self.eval_periods(x, 1..self.kernel.horizon));
        }

        let mut out = Vec::with_capacity(self.kernel.stacked_len());
        if self.kernel.shocked {
            // The shocked first period runs on its own; the remaining periods
            // split evenly across lanes.
            out.extend_from_slice(&self.eval_periods(x, 1..2));
        }
        let chunks: Vec<Vec<f64>> = self
            .kernel
            .blocks
            .par_iter()
            .map(|block| self.eval_periods(x, block.clone()))
            .collect();
        for chunk in chunks {
            out.extend_from_slice(&chunk);
        }
        debug_assert_eq!(out.len(), n * self.kernel.interior);
        DVector::from_vec(out)
    }
}

impl<'a, F: PeriodResidual<f64> + PeriodResidual<Dual>> StackedSystem<'a, F> {
    /// Directional derivative of the stacked residual: exact `J . v` via one
    /// dual-number pass, boundary periods held fixed (zero perturbation).
    pub fn jvp(&self, x: &DVector<f64>, v: &DVector<f64>) -> DVector<f64> {
        let n = self.kernel.nvars;
        let horizon = self.kernel.horizon;
        let steady: Vec<Dual> = self.steady.iter().map(|&s| Dual::constant(s)).collect();
        let params: Vec<Dual> = self.params.iter().map(|&p| Dual::constant(p)).collect();

        let dual_state = |t: usize| -> Vec<Dual> {
            let base = self.period_state(x, t);
            if t == 0 || t == horizon {
                base.iter().map(|&b| Dual::constant(b)).collect()
            } else {
                base.iter()
                    .zip(v.as_slice()[(t - 1) * n..t * n].iter())
                    .map(|(&b, &d)| Dual::new(b, d))
                    .collect()
            }
        };

        let mut out = DVector::zeros(self.kernel.stacked_len());
        let mut buf = vec![Dual::constant(0.0); n];
        let mut scratch = Vec::new();
        for t in 1..horizon {
            let shocks: Vec<Dual> = self
                .shocks
                .row(t)
                .iter()
                .map(|&s| Dual::constant(s))
                .collect();
            self.residual_fn.eval(
                &dual_state(t - 1),
                &dual_state(t),
                &dual_state(t + 1),
                &steady,
                &shocks,
                &params,
                &mut buf,
                &mut scratch,
            );
            for i in 0..n {
                out[(t - 1) * n + i] = buf[i].dot;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelSpec};
    use crate::path::build_path;
    use std::collections::HashMap;

    fn two_var_model() -> Model {
        Model::compile(ModelSpec {
            variables: vec!["x".to_string(), "y".to_string()],
            shocks: vec!["e".to_string()],
            parameters: vec![("rho".to_string(), 0.8), ("beta".to_string(), 0.5)],
            aux_equations: vec![],
            equations: vec![
                "x = rho * xLag + beta * yPrime + e".to_string(),
                "y = beta * x + 0.1 * yLag".to_string(),
            ],
            steady_state: HashMap::from([("x".to_string(), 0.0), ("y".to_string(), 0.0)]),
        })
        .unwrap()
    }

    fn system<'a>(
        model: &'a Model,
        kernel: &'a StackedKernel,
        trajectory: &'a crate::path::Trajectory,
        shocks: &'a ShockSeries,
        parallel: bool,
    ) -> StackedSystem<'a, crate::equation_engine::ModelEquations> {
        StackedSystem {
            residual_fn: model.equations(),
            kernel,
            steady: model.steady_state().as_slice(),
            params: model.params(),
            initial: trajectory.state(0),
            endpoint: trajectory.state(trajectory.horizon()),
            shocks,
            parallel,
        }
    }

    #[test]
    fn kernel_partitions_cover_interior_in_order() {
        let kernel = StackedKernel::new(10, 2, 3, false);
        assert_eq!(kernel.interior, 9);
        let flat: Vec<usize> = kernel.blocks.iter().flat_map(|b| b.clone()).collect();
        assert_eq!(flat, (1..10).collect::<Vec<_>>());

        let shocked = StackedKernel::new(10, 2, 4, true);
        let flat: Vec<usize> = shocked.blocks.iter().flat_map(|b| b.clone()).collect();
        assert_eq!(flat, (2..10).collect::<Vec<_>>());
    }

    #[test]
    fn residual_is_zero_at_steady_state() {
        let model = two_var_model();
        let (path, shocks) = build_path(&model, 8, None, None, None).unwrap();
        let kernel = StackedKernel::new(8, 2, 1, false);
        let sys = system(&model, &kernel, &path, &shocks, false);
        let r = sys.residual_at(&path.interior_flat());
        assert_eq!(r.len(), 14);
        assert!(r.iter().all(|v| v.abs() < 1e-15));
    }

    #[test]
    fn parallel_and_sequential_assembly_agree() {
        let model = two_var_model();
        let horizon = 10; // (10 - 2) divides by 4
        let (path, shocks) = build_path(&model, horizon, None, Some(("e", 1.0)), None).unwrap();
        let kernel_seq = StackedKernel::new(horizon, 2, 1, true);
        let kernel_par = StackedKernel::new(horizon, 2, 4, true);

        let mut x = path.interior_flat();
        for (i, v) in x.iter_mut().enumerate() {
            *v = (i as f64) * 0.01 - 0.05;
        }

        let seq = system(&model, &kernel_seq, &path, &shocks, false).residual_at(&x);
        let par = system(&model, &kernel_par, &path, &shocks, true).residual_at(&x);
        assert_eq!(seq, par);
    }

    #[test]
    fn jvp_matches_finite_differences() {
        let model = two_var_model();
        let horizon = 6;
        let (path, shocks) = build_path(&model, horizon, None, None, None).unwrap();
        let kernel = StackedKernel::new(horizon, 2, 1, false);
        let sys = system(&model, &kernel, &path, &shocks, false);

        let mut x = path.interior_flat();
        for (i, v) in x.iter_mut().enumerate() {
            *v = 0.1 + 0.02 * i as f64;
        }
        let v = DVector::from_fn(x.len(), |i, _| 1.0 + (i % 3) as f64);

        let exact = sys.jvp(&x, &v);
        let eps = 1e-7;
        let fd = (sys.residual_at(&(&x + &v * eps)) - sys.residual_at(&x)) / eps;
        for i in 0..exact.len() {
            assert!(
                (exact[i] - fd[i]).abs() < 1e-5,
                "entry {i}: {} vs {}",
                exact[i],
                fd[i]
            );
        }
    }
}
