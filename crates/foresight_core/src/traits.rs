use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in model evaluation.
/// Must support floating-point arithmetic, debug printing and conversion
/// from f64. `Send + Sync` because residual blocks are evaluated in
/// parallel across worker lanes.
pub trait Scalar: Float + FromPrimitive + Debug + Send + Sync + 'static {}

impl<T: Float + FromPrimitive + Debug + Send + Sync + 'static> Scalar for T {}

/// One period of a perfect-foresight model: the compiled residual function.
///
/// `eval` writes one entry per model variable into `out`; the entries are
/// zero exactly when the model equations hold at that period.
///
/// * `lag`, `now`, `lead`: state vectors at t-1, t, t+1
/// * `steady`: the steady-state vector
/// * `shocks`: the shock values realized at this period
/// * `params`: model parameters
/// * `scratch`: evaluation buffer owned by the caller, so that worker
///   lanes never share mutable state
pub trait PeriodResidual<T: Scalar>: Sync {
    /// Number of model variables (= number of equations).
    fn nvars(&self) -> usize;

    #[allow(clippy::too_many_arguments)]
    fn eval(
        &self,
        lag: &[T],
        now: &[T],
        lead: &[T],
        steady: &[T],
        shocks: &[T],
        params: &[T],
        out: &mut [T],
        scratch: &mut Vec<T>,
    );
}
