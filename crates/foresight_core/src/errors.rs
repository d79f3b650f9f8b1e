use thiserror::Error;

/// Error taxonomy for model compilation and path solving.
///
/// Setup-time errors (`UnknownShock`, `Dimension`, `Compile`) indicate caller
/// misuse and always propagate immediately. Iteration-time numerical failures
/// (`Convergence`, `SingularJacobian`) are surfaced through the returned
/// result flag and only raised when the caller opted into `raise_errors`.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("Shock '{0}' is not defined.")]
    UnknownShock(String),

    #[error("Dimension mismatch for {what}: expected {expected}, got {got}.")]
    Dimension {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("No convergence after {iterations} iterations (max residual {max_residual:1.2e}).")]
    Convergence {
        iterations: usize,
        max_residual: f64,
    },

    #[error("Jacobian is singular in iteration {iteration}.")]
    SingularJacobian { iteration: usize },

    #[error("Model compilation failed: {0}")]
    Compile(String),
}
