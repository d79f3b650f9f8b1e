use crate::jacobian::{DirectBanded, JacobianStrategy};
use crate::model::Model;
use crate::newton::{solve_stacked, sup_norm, NewtonSettings};
use crate::path::{build_path, pad_horizon, Trajectory};
use crate::stacked::StackedSystem;
use anyhow::{bail, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Options for one transition-path solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveOptions {
    /// Initial state at period 0; defaults to the steady state.
    pub initial_state: Option<Vec<f64>>,
    /// Shock injected at period 0, `(name, magnitude)`.
    pub shock: Option<(String, f64)>,
    /// Periods until the system is assumed back at the steady state. May be
    /// padded upward to fit the lane count when solving in parallel.
    pub horizon: usize,
    pub tolerance: Option<f64>,
    pub max_iterations: Option<usize>,
    pub damping: Option<f64>,
    /// Evaluate residual and Jacobian blocks across worker lanes.
    pub parallel: bool,
    /// Lane count; defaults to the detected hardware concurrency.
    pub lanes: Option<usize>,
    /// Warm-start path (e.g. from a cheaper approximation); interior periods
    /// it covers overwrite the steady-state initial guess.
    #[serde(skip)]
    pub warm_start: Option<Trajectory>,
    /// Whether numerical failures raise instead of being reported through
    /// the returned flag. Setup errors always raise.
    pub raise_errors: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            initial_state: None,
            shock: None,
            horizon: 300,
            tolerance: None,
            max_iterations: None,
            damping: None,
            parallel: false,
            lanes: None,
            warm_start: None,
            raise_errors: true,
        }
    }
}

/// A solved (or best-effort) transition path.
#[derive(Debug)]
pub struct PathResult {
    /// The full trajectory, `horizon + 1` periods with boundary rows intact.
    pub trajectory: Trajectory,
    /// True if the solver did not converge.
    pub failed: bool,
    pub message: String,
    pub iterations: usize,
    /// Sup-norm residual re-measured at the returned trajectory.
    pub max_residual: f64,
}

/// Finds the perfect-foresight transition path with the banded-Jacobian
/// Newton strategy.
pub fn solve(model: &Model, options: &SolveOptions) -> Result<PathResult> {
    solve_with_strategy(model, options, &mut DirectBanded::new())
}

/// Finds the transition path with a caller-supplied Jacobian strategy, e.g.
/// a [`CompositeStrategy`](crate::jacobian::CompositeStrategy) amortizing a
/// precomputed partial Jacobian.
pub fn solve_with_strategy<J>(
    model: &Model,
    options: &SolveOptions,
    strategy: &mut J,
) -> Result<PathResult>
where
    J: JacobianStrategy<crate::equation_engine::ModelEquations>,
{
    let started = Instant::now();

    if options.horizon < 2 {
        bail!("Horizon must be at least 2, got {}.", options.horizon);
    }

    let shocked = options.shock.is_some();
    let lanes = if options.parallel {
        options.lanes.unwrap_or_else(rayon::current_num_threads).max(1)
    } else {
        1
    };
    let horizon = pad_horizon(options.horizon, lanes, shocked);
    if horizon != options.horizon {
        info!(
            "Horizon padded from {} to {} to fit {} lanes.",
            options.horizon, horizon, lanes
        );
    }

    // Setup errors (unknown shock, dimension mismatch) raise here, before
    // any kernel is cached or any iteration runs.
    let shock = options
        .shock
        .as_ref()
        .map(|(name, magnitude)| (name.as_str(), *magnitude));
    let (mut trajectory, shocks) = build_path(
        model,
        horizon,
        options.initial_state.as_deref(),
        shock,
        options.warm_start.as_ref(),
    )?;

    let kernel = model.kernel(horizon, shocked, lanes);
    let system = StackedSystem {
        residual_fn: model.equations(),
        kernel: &kernel,
        steady: model.steady_state().as_slice(),
        params: model.params(),
        initial: trajectory.state(0),
        endpoint: trajectory.state(horizon),
        shocks: &shocks,
        parallel: options.parallel,
    };

    let settings = NewtonSettings {
        tolerance: options.tolerance.unwrap_or(1e-8),
        max_iterations: options.max_iterations.unwrap_or(30),
        damping: options.damping.unwrap_or(1.0),
    };

    info!(
        "Solving stack (size: {}) over horizon {}.",
        kernel.stacked_len(),
        horizon
    );
    let outcome = solve_stacked(&system, strategy, trajectory.interior_flat(), &settings);

    // Compose the result: solved interior, boundary rows verbatim, residual
    // re-measured at the final point.
    let max_residual = sup_norm(&system.residual_at(&outcome.x));
    drop(system);
    let error = outcome.error;
    trajectory.set_interior(&outcome.x);

    let elapsed = started.elapsed().as_secs_f64();
    let result = if outcome.failed { "FAILED" } else { "done" };
    let message = format!("Stacking {result} ({elapsed:1.3}s). {}", outcome.message);

    if outcome.failed {
        if options.raise_errors {
            match error {
                Some(err) => return Err(anyhow::Error::new(err).context(message)),
                None => bail!(message),
            }
        }
        warn!("{message}");
    } else {
        info!("{message}");
    }

    Ok(PathResult {
        trajectory,
        failed: outcome.failed,
        message,
        iterations: outcome.iterations,
        max_residual,
    })
}
