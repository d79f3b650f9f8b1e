/// The `foresight_core` crate computes perfect-foresight transition paths for
/// dynamic economic models: given variables, parameters and equations linking
/// a variable's past, present and future values, it finds the trajectory
/// satisfying all equations jointly from an initial (possibly shocked) state
/// back to the steady state.
///
/// Key components:
/// - **Traits**: `Scalar` (numeric type abstraction), `PeriodResidual` (the
///   compiled one-period residual function).
/// - **Equation Engine**: a bytecode VM compiling equation text with
///   time-tagged variable references (`xLag`, `x`, `xPrime`, `xSS`).
/// - **Autodiff**: dual numbers driving exact Jacobian blocks and
///   directional derivatives.
/// - **Stacking**: the whole horizon assembled as one nonlinear system with a
///   block-tridiagonal Jacobian, solved by Newton iteration with optional
///   data-parallel block evaluation.
pub mod autodiff;
pub mod equation_engine;
pub mod errors;
pub mod jacobian;
pub mod model;
pub mod newton;
pub mod path;
pub mod solve;
pub mod stacked;
pub mod traits;

pub use errors::PathError;
pub use jacobian::{CompositeStrategy, DirectBanded, JacobianStrategy};
pub use model::{Model, ModelSpec};
pub use newton::{NewtonOutcome, NewtonPhase, NewtonSettings};
pub use path::{build_path, pad_horizon, ShockSeries, Trajectory};
pub use solve::{solve, solve_with_strategy, PathResult, SolveOptions};
pub use stacked::{StackedKernel, StackedSystem};
pub use traits::{PeriodResidual, Scalar};
