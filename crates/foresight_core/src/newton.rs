use crate::autodiff::Dual;
use crate::errors::PathError;
use crate::jacobian::JacobianStrategy;
use crate::stacked::StackedSystem;
use crate::traits::PeriodResidual;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonSettings {
    /// Sup-norm residual threshold for convergence.
    pub tolerance: f64,
    /// Iteration cap; exceeding it is a reported failure, never retried.
    pub max_iterations: usize,
    /// Step damping factor, 1.0 for full Newton steps.
    pub damping: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 30,
            damping: 1.0,
        }
    }
}

/// Phases of one Newton solve. `Converged` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewtonPhase {
    Init,
    Iterating,
    Converged,
    Failed,
}

/// Final state of a Newton solve: the best iterate found, whether the solve
/// failed, and a human-readable status. Solve-scoped; nothing persists.
#[derive(Debug)]
pub struct NewtonOutcome {
    pub x: DVector<f64>,
    pub iterations: usize,
    pub max_residual: f64,
    pub failed: bool,
    pub message: String,
    /// The numerical failure, if any, for callers that opted into raising.
    pub error: Option<PathError>,
}

/// Maximum absolute entry. Convergence uses the sup-norm so a single badly
/// violated equation blocks convergence even when the aggregate norm is small.
pub fn sup_norm(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0f64, |acc, x| acc.max(x.abs()))
}

/// Drives the stacked unknowns to a root of the stacked residual.
///
/// Strictly sequential across iterations; each iterate depends on the last.
/// Parallelism lives inside the residual/Jacobian evaluations.
pub fn solve_stacked<F, J>(
    system: &StackedSystem<'_, F>,
    strategy: &mut J,
    x_init: DVector<f64>,
    settings: &NewtonSettings,
) -> NewtonOutcome
where
    F: PeriodResidual<f64> + PeriodResidual<Dual>,
    J: JacobianStrategy<F>,
{
    let mut phase = NewtonPhase::Init;
    let mut x = x_init;
    let mut residual = system.residual_at(&x);
    let mut res_norm = sup_norm(&residual);
    let mut iterations = 0usize;
    let mut error: Option<PathError> = None;

    loop {
        match phase {
            NewtonPhase::Init => {
                phase = NewtonPhase::Iterating;
            }
            NewtonPhase::Iterating => {
                if res_norm < settings.tolerance {
                    phase = NewtonPhase::Converged;
                    continue;
                }
                if iterations >= settings.max_iterations {
                    error = Some(PathError::Convergence {
                        iterations,
                        max_residual: res_norm,
                    });
                    phase = NewtonPhase::Failed;
                    continue;
                }
                match strategy.newton_step(system, &x, &residual, iterations) {
                    Ok(delta) => {
                        x += delta * settings.damping;
                        iterations += 1;
                        residual = system.residual_at(&x);
                        res_norm = sup_norm(&residual);
                    }
                    Err(e) => {
                        error = Some(e);
                        phase = NewtonPhase::Failed;
                    }
                }
            }
            NewtonPhase::Converged => {
                return NewtonOutcome {
                    x,
                    iterations,
                    max_residual: res_norm,
                    failed: false,
                    message: format!(
                        "Converged after {iterations} iteration(s). Max residual is {res_norm:1.2e}."
                    ),
                    error: None,
                };
            }
            NewtonPhase::Failed => {
                let err = error.take().unwrap_or(PathError::Convergence {
                    iterations,
                    max_residual: res_norm,
                });
                return NewtonOutcome {
                    x,
                    iterations,
                    max_residual: res_norm,
                    failed: true,
                    message: format!("{err} Max residual is {res_norm:1.2e}."),
                    error: Some(err),
                };
            }
        }
    }
}
