use crate::autodiff::Dual;
use crate::errors::PathError;
use crate::stacked::StackedSystem;
use crate::traits::PeriodResidual;
use nalgebra::{DMatrix, DVector, Dyn};
use rayon::prelude::*;

/// How the Newton solver obtains its search direction. Both strategies solve
/// `J . delta = -residual` at the current iterate behind the same contract,
/// so the Newton loop never depends on which one is active.
pub trait JacobianStrategy<F: PeriodResidual<f64> + PeriodResidual<Dual>> {
    fn newton_step(
        &mut self,
        system: &StackedSystem<'_, F>,
        x: &DVector<f64>,
        residual: &DVector<f64>,
        iteration: usize,
    ) -> Result<DVector<f64>, PathError>;
}

/// Derivative blocks of one period's residual: `a` with respect to the lag
/// state, `b` the current state, `c` the lead state. The stacked Jacobian is
/// block tridiagonal because no equation reaches further than one period.
struct PeriodBlocks {
    a: DMatrix<f64>,
    b: DMatrix<f64>,
    c: DMatrix<f64>,
}

fn period_blocks<F: PeriodResidual<Dual>>(
    residual_fn: &F,
    lag: &[f64],
    now: &[f64],
    lead: &[f64],
    steady: &[Dual],
    params: &[Dual],
    shocks: &[f64],
    n: usize,
) -> PeriodBlocks {
    let mut dual_lag: Vec<Dual> = lag.iter().map(|&v| Dual::constant(v)).collect();
    let mut dual_now: Vec<Dual> = now.iter().map(|&v| Dual::constant(v)).collect();
    let mut dual_lead: Vec<Dual> = lead.iter().map(|&v| Dual::constant(v)).collect();
    let dual_shocks: Vec<Dual> = shocks.iter().map(|&v| Dual::constant(v)).collect();

    let mut blocks = PeriodBlocks {
        a: DMatrix::zeros(n, n),
        b: DMatrix::zeros(n, n),
        c: DMatrix::zeros(n, n),
    };
    let mut out = vec![Dual::constant(0.0); n];
    let mut scratch = Vec::new();

    // One dual pass per direction; each pass fills one Jacobian column.
    for j in 0..n {
        dual_lag[j].dot = 1.0;
        residual_fn.eval(
            &dual_lag,
            &dual_now,
            &dual_lead,
            steady,
            &dual_shocks,
            params,
            &mut out,
            &mut scratch,
        );
        dual_lag[j].dot = 0.0;
        for i in 0..n {
            blocks.a[(i, j)] = out[i].dot;
        }

        dual_now[j].dot = 1.0;
        residual_fn.eval(
            &dual_lag,
            &dual_now,
            &dual_lead,
            steady,
            &dual_shocks,
            params,
            &mut out,
            &mut scratch,
        );
        dual_now[j].dot = 0.0;
        for i in 0..n {
            blocks.b[(i, j)] = out[i].dot;
        }

        dual_lead[j].dot = 1.0;
        residual_fn.eval(
            &dual_lag,
            &dual_now,
            &dual_lead,
            steady,
            &dual_shocks,
            params,
            &mut out,
            &mut scratch,
        );
        dual_lead[j].dot = 0.0;
        for i in 0..n {
            blocks.c[(i, j)] = out[i].dot;
        }
    }
    blocks
}

/// Direct strategy: differentiate the stacked residual period-by-period with
/// dual numbers and solve the resulting block-tridiagonal system with a block
/// Thomas elimination. Never materializes the dense stacked Jacobian; memory
/// stays `O(horizon * nvars^2)`.
#[derive(Debug, Default)]
pub struct DirectBanded;

impl DirectBanded {
    pub fn new() -> Self {
        Self
    }
}

impl<F: PeriodResidual<f64> + PeriodResidual<Dual>> JacobianStrategy<F> for DirectBanded {
    fn newton_step(
        &mut self,
        system: &StackedSystem<'_, F>,
        x: &DVector<f64>,
        residual: &DVector<f64>,
        iteration: usize,
    ) -> Result<DVector<f64>, PathError> {
        let n = system.kernel.nvars;
        let p = system.kernel.interior;
        let steady: Vec<Dual> = system.steady.iter().map(|&s| Dual::constant(s)).collect();
        let params: Vec<Dual> = system.params.iter().map(|&v| Dual::constant(v)).collect();

        let blocks_at = |t: usize| {
            period_blocks(
                system.residual_fn,
                system.period_state(x, t - 1),
                system.period_state(x, t),
                system.period_state(x, t + 1),
                &steady,
                &params,
                system.shocks.row(t),
                n,
            )
        };
        let triples: Vec<PeriodBlocks> = if system.parallel {
            (1..=p).into_par_iter().map(blocks_at).collect()
        } else {
            (1..=p).map(blocks_at).collect()
        };

        // Block Thomas: forward elimination with one LU per period, then back
        // substitution. g_mats[t] = Btilde_t^-1 C_t, g_vecs[t] = Btilde_t^-1 rhs_t.
        let singular = || PathError::SingularJacobian { iteration };
        let mut g_mats: Vec<DMatrix<f64>> = Vec::with_capacity(p);
        let mut g_vecs: Vec<DVector<f64>> = Vec::with_capacity(p);
        for t in 1..=p {
            let blocks = &triples[t - 1];
            let mut btilde = blocks.b.clone();
            let mut rhs = -residual.rows((t - 1) * n, n).clone_owned();
            if t > 1 {
                // The lag coupling of period 1 hits the fixed initial state
                // and drops out; from period 2 on it folds into the pivot.
                btilde -= &blocks.a * &g_mats[t - 2];
                rhs -= &blocks.a * &g_vecs[t - 2];
            }
            let lu = btilde.lu();
            let g_vec = lu.solve(&rhs).ok_or_else(singular)?;
            let g_mat = if t < p {
                lu.solve(&blocks.c).ok_or_else(singular)?
            } else {
                // The lead coupling of the last period hits the fixed endpoint.
                DMatrix::zeros(n, n)
            };
            g_mats.push(g_mat);
            g_vecs.push(g_vec);
        }

        let mut delta = DVector::zeros(n * p);
        let mut next = g_vecs[p - 1].clone();
        delta.rows_mut((p - 1) * n, n).copy_from(&next);
        for t in (1..p).rev() {
            next = &g_vecs[t - 1] - &g_mats[t - 1] * &next;
            delta.rows_mut((t - 1) * n, n).copy_from(&next);
        }
        Ok(delta)
    }
}

/// Composite strategy: a once-per-model factorized base Jacobian (amortizing
/// an expensive partial derivative) combined with the exact directional
/// derivative of the stacked residual for one refinement step per iteration.
pub struct CompositeStrategy {
    lu: nalgebra::LU<f64, Dyn, Dyn>,
    dim: usize,
}

impl CompositeStrategy {
    /// Factorizes the base Jacobian once; `newton_step` reuses the factors
    /// across all iterations and solves.
    pub fn new(base: DMatrix<f64>) -> Result<Self, PathError> {
        if base.nrows() != base.ncols() {
            return Err(PathError::Dimension {
                what: "composite base Jacobian",
                expected: base.nrows(),
                got: base.ncols(),
            });
        }
        let dim = base.nrows();
        Ok(Self { lu: base.lu(), dim })
    }
}

impl<F: PeriodResidual<f64> + PeriodResidual<Dual>> JacobianStrategy<F> for CompositeStrategy {
    fn newton_step(
        &mut self,
        system: &StackedSystem<'_, F>,
        x: &DVector<f64>,
        residual: &DVector<f64>,
        iteration: usize,
    ) -> Result<DVector<f64>, PathError> {
        if residual.len() != self.dim {
            return Err(PathError::Dimension {
                what: "composite base Jacobian",
                expected: self.dim,
                got: residual.len(),
            });
        }
        let singular = || PathError::SingularJacobian { iteration };
        let step = self.lu.solve(&-residual).ok_or_else(singular)?;
        // Residual the base factors leave behind, measured with the exact
        // Jacobian-vector product, then corrected through the same factors.
        let defect = residual + system.jvp(x, &step);
        let correction = self.lu.solve(&defect).ok_or_else(singular)?;
        Ok(step - correction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelSpec};
    use crate::path::build_path;
    use crate::stacked::StackedKernel;
    use std::collections::HashMap;

    fn model() -> Model {
        Model::compile(ModelSpec {
            variables: vec!["x".to_string(), "y".to_string()],
            shocks: vec!["e".to_string()],
            parameters: vec![("rho".to_string(), 0.7), ("kappa".to_string(), 0.3)],
            aux_equations: vec![],
            equations: vec![
                "x = rho * xLag + kappa * yPrime + e".to_string(),
                "y = kappa * x * x + 0.2 * yLag".to_string(),
            ],
            steady_state: HashMap::from([("x".to_string(), 0.0), ("y".to_string(), 0.0)]),
        })
        .unwrap()
    }

    fn dense_jacobian(
        sys: &StackedSystem<'_, crate::equation_engine::ModelEquations>,
        x: &DVector<f64>,
    ) -> DMatrix<f64> {
        let dim = sys.kernel.stacked_len();
        let mut jac = DMatrix::zeros(dim, dim);
        for j in 0..dim {
            let mut e = DVector::zeros(dim);
            e[j] = 1.0;
            jac.set_column(j, &sys.jvp(x, &e));
        }
        jac
    }

    #[test]
    fn period_block_derivatives_match_the_equations() {
        let m = model();
        let steady: Vec<Dual> = vec![Dual::constant(0.0); 2];
        let params: Vec<Dual> = m.params().iter().map(|&v| Dual::constant(v)).collect();
        let blocks = period_blocks(
            m.equations(),
            &[0.5, 0.2],
            &[0.4, 0.3],
            &[0.1, 0.6],
            &steady,
            &params,
            &[0.0],
            2,
        );
        // Residual 0: x - rho*xLag - kappa*yPrime - e
        assert!((blocks.a[(0, 0)] + 0.7).abs() < 1e-14);
        assert!((blocks.b[(0, 0)] - 1.0).abs() < 1e-14);
        assert!((blocks.c[(0, 1)] + 0.3).abs() < 1e-14);
        // Residual 1: y - kappa*x^2 - 0.2*yLag; d/dx = -2*kappa*x at x=0.4
        assert!((blocks.b[(1, 0)] + 0.24).abs() < 1e-14);
        assert!((blocks.a[(1, 1)] + 0.2).abs() < 1e-14);
        assert!(blocks.c[(1, 0)].abs() < 1e-14);
    }

    #[test]
    fn banded_step_solves_the_stacked_system() {
        let m = model();
        let horizon = 7;
        let (path, shocks) = build_path(&m, horizon, None, Some(("e", 0.4)), None).unwrap();
        let kernel = StackedKernel::new(horizon, 2, 1, true);
        let sys = StackedSystem {
            residual_fn: m.equations(),
            kernel: &kernel,
            steady: m.steady_state().as_slice(),
            params: m.params(),
            initial: path.state(0),
            endpoint: path.state(horizon),
            shocks: &shocks,
            parallel: false,
        };

        let mut x = path.interior_flat();
        for (i, v) in x.iter_mut().enumerate() {
            *v = 0.05 * (i as f64 + 1.0);
        }
        let residual = sys.residual_at(&x);

        let mut direct = DirectBanded::new();
        let delta = direct.newton_step(&sys, &x, &residual, 0).unwrap();

        // The banded elimination must agree with a dense solve of J*d = -r.
        let jac = dense_jacobian(&sys, &x);
        let dense = jac.lu().solve(&-&residual).expect("dense solve");
        for i in 0..delta.len() {
            assert!(
                (delta[i] - dense[i]).abs() < 1e-10,
                "entry {i}: {} vs {}",
                delta[i],
                dense[i]
            );
        }
    }

    #[test]
    fn parallel_block_evaluation_matches_sequential() {
        let m = model();
        let horizon = 10; // (10 - 2) divides by 4
        let (path, shocks) = build_path(&m, horizon, None, Some(("e", 0.4)), None).unwrap();
        let kernel_seq = StackedKernel::new(horizon, 2, 1, true);
        let kernel_par = StackedKernel::new(horizon, 2, 4, true);

        let mut x = path.interior_flat();
        for (i, v) in x.iter_mut().enumerate() {
            *v = 0.03 * (i as f64) - 0.1;
        }

        let make = |kernel, parallel| StackedSystem {
            residual_fn: m.equations(),
            kernel,
            steady: m.steady_state().as_slice(),
            params: m.params(),
            initial: path.state(0),
            endpoint: path.state(horizon),
            shocks: &shocks,
            parallel,
        };
        let sys_seq = make(&kernel_seq, false);
        let sys_par = make(&kernel_par, true);
        let r_seq = sys_seq.residual_at(&x);
        let r_par = sys_par.residual_at(&x);
        assert_eq!(r_seq, r_par);

        let mut direct = DirectBanded::new();
        let d_seq = direct.newton_step(&sys_seq, &x, &r_seq, 0).unwrap();
        let d_par = direct.newton_step(&sys_par, &x, &r_par, 0).unwrap();
        assert_eq!(d_seq, d_par);
    }

    #[test]
    fn composite_with_exact_base_matches_direct() {
        let m = model();
        let horizon = 6;
        let (path, shocks) = build_path(&m, horizon, None, Some(("e", 0.4)), None).unwrap();
        let kernel = StackedKernel::new(horizon, 2, 1, true);
        let sys = StackedSystem {
            residual_fn: m.equations(),
            kernel: &kernel,
            steady: m.steady_state().as_slice(),
            params: m.params(),
            initial: path.state(0),
            endpoint: path.state(horizon),
            shocks: &shocks,
            parallel: false,
        };

        let mut x = path.interior_flat();
        for (i, v) in x.iter_mut().enumerate() {
            *v = 0.04 * (i as f64 + 1.0);
        }
        let residual = sys.residual_at(&x);

        let mut direct = DirectBanded::new();
        let d_direct = direct.newton_step(&sys, &x, &residual, 0).unwrap();

        let mut composite = CompositeStrategy::new(dense_jacobian(&sys, &x)).unwrap();
        let d_composite = composite.newton_step(&sys, &x, &residual, 0).unwrap();

        for i in 0..d_direct.len() {
            assert!((d_direct[i] - d_composite[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn singular_jacobian_is_reported() {
        let base = DMatrix::zeros(4, 4);
        let mut composite = CompositeStrategy::new(base).unwrap();
        let m = model();
        let horizon = 3;
        let (path, shocks) = build_path(&m, horizon, None, None, None).unwrap();
        let kernel = StackedKernel::new(horizon, 2, 1, false);
        let sys = StackedSystem {
            residual_fn: m.equations(),
            kernel: &kernel,
            steady: m.steady_state().as_slice(),
            params: m.params(),
            initial: path.state(0),
            endpoint: path.state(horizon),
            shocks: &shocks,
            parallel: false,
        };
        let x = path.interior_flat();
        let residual = DVector::from_element(4, 1.0);
        let err = composite.newton_step(&sys, &x, &residual, 3).unwrap_err();
        assert!(matches!(err, PathError::SingularJacobian { iteration: 3 }));
    }
}
