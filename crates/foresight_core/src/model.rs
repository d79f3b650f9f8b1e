use crate::equation_engine::ModelEquations;
use crate::errors::PathError;
use crate::stacked::StackedKernel;
use crate::traits::PeriodResidual;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Plain-data description of a model, as loaded from a specification
/// document. Compiled into a [`Model`] by [`Model::compile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Ordered variable names; one equation per variable.
    pub variables: Vec<String>,
    /// Declared shock names, possibly empty.
    #[serde(default)]
    pub shocks: Vec<String>,
    /// Ordered `(name, value)` parameter pairs.
    #[serde(default)]
    pub parameters: Vec<(String, f64)>,
    /// Aux bindings `name = expr`, evaluated before the equations each period.
    #[serde(default)]
    pub aux_equations: Vec<String>,
    /// Model equations, `lhs = rhs` or a bare residual expression.
    pub equations: Vec<String>,
    /// Steady-state value for every variable.
    pub steady_state: HashMap<String, f64>,
}

/// A compiled model. Immutable after compilation and shared read-only across
/// solves; the per-horizon kernel cache is the only interior-mutable state.
#[derive(Debug)]
pub struct Model {
    variables: Vec<String>,
    shocks: Vec<String>,
    param_names: Vec<String>,
    param_values: Vec<f64>,
    steady_state: DVector<f64>,
    equations: ModelEquations,
    kernels: Mutex<HashMap<usize, Arc<StackedKernel>>>,
}

impl Model {
    pub fn compile(spec: ModelSpec) -> Result<Self, PathError> {
        if spec.variables.is_empty() {
            return Err(PathError::Compile("Model has no variables.".to_string()));
        }
        if spec.variables.len() != spec.equations.len() {
            return Err(PathError::Compile(format!(
                "Model has {} variables but {} equations.",
                spec.variables.len(),
                spec.equations.len()
            )));
        }

        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (name, kind) in spec
            .variables
            .iter()
            .map(|n| (n, "variable"))
            .chain(spec.shocks.iter().map(|n| (n, "shock")))
            .chain(spec.parameters.iter().map(|(n, _)| (n, "parameter")))
        {
            if let Some(prior) = seen.insert(name.as_str(), kind) {
                return Err(PathError::Compile(format!(
                    "Name '{name}' declared as both {prior} and {kind}."
                )));
            }
        }

        let param_names: Vec<String> = spec.parameters.iter().map(|(n, _)| n.clone()).collect();
        let param_values: Vec<f64> = spec.parameters.iter().map(|(_, v)| *v).collect();

        let equations = ModelEquations::compile(
            &spec.variables,
            &spec.shocks,
            &param_names,
            &spec.aux_equations,
            &spec.equations,
        )?;

        for (i, name) in spec.variables.iter().enumerate() {
            if !equations.references_current(i) {
                return Err(PathError::Compile(format!(
                    "Variable '{name}' is not defined for time t."
                )));
            }
        }

        let mut steady = DVector::zeros(spec.variables.len());
        for (i, name) in spec.variables.iter().enumerate() {
            match spec.steady_state.get(name) {
                Some(&v) => steady[i] = v,
                None => {
                    return Err(PathError::Compile(format!(
                        "No steady-state value for variable '{name}'."
                    )))
                }
            }
        }

        Ok(Self {
            variables: spec.variables,
            shocks: spec.shocks,
            param_names,
            param_values,
            steady_state: steady,
            equations,
            kernels: Mutex::new(HashMap::new()),
        })
    }

    pub fn nvars(&self) -> usize {
        self.variables.len()
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn shocks(&self) -> &[String] {
        &self.shocks
    }

    pub fn shock_index(&self, name: &str) -> Option<usize> {
        self.shocks.iter().position(|s| s == name)
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn params(&self) -> &[f64] {
        &self.param_values
    }

    pub fn steady_state(&self) -> &DVector<f64> {
        &self.steady_state
    }

    pub fn equations(&self) -> &ModelEquations {
        &self.equations
    }

    /// Fetches the stacked kernel for `horizon`, building and caching it on
    /// first use. An entry is replaced if the cached layout no longer matches
    /// (different lane count, or shock moved into/out of period 0 at the same
    /// horizon, which only happens with a single lane).
    pub fn kernel(&self, horizon: usize, shocked: bool, lanes: usize) -> Arc<StackedKernel> {
        let mut cache = self.kernels.lock().unwrap();
        if let Some(kernel) = cache.get(&horizon) {
            if kernel.lanes == lanes && kernel.shocked == shocked {
                return Arc::clone(kernel);
            }
        }
        let kernel = Arc::new(StackedKernel::new(horizon, self.nvars(), lanes, shocked));
        cache.insert(horizon, Arc::clone(&kernel));
        kernel
    }

    /// Horizons with a cached kernel, sorted. Mostly useful for inspection
    /// and tests.
    pub fn cached_horizons(&self) -> Vec<usize> {
        let cache = self.kernels.lock().unwrap();
        let mut horizons: Vec<usize> = cache.keys().copied().collect();
        horizons.sort_unstable();
        horizons
    }
}

/// Convenience: evaluates the model's residual at the steady state with zero
/// shocks. Entries near zero confirm the supplied steady state is consistent.
pub fn steady_state_residual(model: &Model) -> DVector<f64> {
    let n = model.nvars();
    let steady = model.steady_state().as_slice();
    let zero_shocks = vec![0.0; model.shocks().len()];
    let mut out = vec![0.0; n];
    let mut scratch = Vec::new();
    model.equations().eval(
        steady,
        steady,
        steady,
        steady,
        &zero_shocks,
        model.params(),
        &mut out,
        &mut scratch,
    );
    DVector::from_vec(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ar1_spec() -> ModelSpec {
        ModelSpec {
            variables: vec!["x".to_string()],
            shocks: vec!["e_x".to_string()],
            parameters: vec![("rho".to_string(), 0.9)],
            aux_equations: vec![],
            equations: vec!["x = rho * xLag + e_x".to_string()],
            steady_state: HashMap::from([("x".to_string(), 0.0)]),
        }
    }

    #[test]
    fn compiles_valid_spec() {
        let model = Model::compile(ar1_spec()).unwrap();
        assert_eq!(model.nvars(), 1);
        assert_eq!(model.shock_index("e_x"), Some(0));
        assert_eq!(model.shock_index("nope"), None);
    }

    #[test]
    fn rejects_equation_count_mismatch() {
        let mut spec = ar1_spec();
        spec.equations.push("x = xLag".to_string());
        let err = Model::compile(spec).unwrap_err();
        assert!(format!("{err}").contains("1 variables but 2 equations"));
    }

    #[test]
    fn rejects_variable_without_current_reference() {
        let mut spec = ar1_spec();
        spec.equations = vec!["xLag = e_x".to_string()];
        let err = Model::compile(spec).unwrap_err();
        assert!(format!("{err}").contains("not defined for time t"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut spec = ar1_spec();
        spec.shocks.push("x".to_string());
        assert!(Model::compile(spec).is_err());
    }

    #[test]
    fn rejects_missing_steady_state() {
        let mut spec = ar1_spec();
        spec.steady_state.clear();
        let err = Model::compile(spec).unwrap_err();
        assert!(format!("{err}").contains("steady-state"));
    }

    #[test]
    fn steady_state_residual_is_zero_for_consistent_model() {
        let model = Model::compile(ar1_spec()).unwrap();
        let res = steady_state_residual(&model);
        assert!(res.iter().all(|v| v.abs() < 1e-15));
    }

    #[test]
    fn kernel_cache_is_per_horizon() {
        let model = Model::compile(ar1_spec()).unwrap();
        assert!(model.cached_horizons().is_empty());
        let a = model.kernel(10, false, 1);
        let b = model.kernel(10, false, 1);
        assert!(Arc::ptr_eq(&a, &b));
        let _ = model.kernel(20, false, 1);
        assert_eq!(model.cached_horizons(), vec![10, 20]);
    }

    #[test]
    fn kernel_cache_replaces_on_layout_change() {
        let model = Model::compile(ar1_spec()).unwrap();
        let a = model.kernel(13, false, 4);
        let b = model.kernel(13, false, 2);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(model.cached_horizons(), vec![13]);
    }
}
