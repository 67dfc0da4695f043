use log::{debug, info};
use nalgebra::{DMatrix, DVector};

use super::{Analysis, AnalysisOptions};
use crate::circuit::{AnalysisMode, CircuitModel};
use crate::error::{AnalysisError, Result};
use crate::newton::{self, NewtonConfig, NonlinearSystem};
use crate::result::TransientResult;

/// Fixed-order ring buffer of past states, oldest overwritten first
#[derive(Debug, Clone)]
pub struct History<const N: usize> {
    slots: [DVector<f64>; N],
    head: usize,
}

impl<const N: usize> History<N> {
    /// A history whose every slot holds `initial`
    pub fn new(initial: DVector<f64>) -> Self {
        History {
            slots: std::array::from_fn(|_| initial.clone()),
            head: N - 1,
        }
    }

    pub fn push(&mut self, state: DVector<f64>) {
        self.head = (self.head + 1) % N;
        self.slots[self.head] = state;
    }

    /// State `age` pushes ago; `get(0)` is the latest
    pub fn get(&self, age: usize) -> Option<&DVector<f64>> {
        if age >= N {
            return None;
        }
        Some(&self.slots[(self.head + N - age) % N])
    }

    pub fn latest(&self) -> &DVector<f64> {
        &self.slots[self.head]
    }

    pub fn oldest(&self) -> &DVector<f64> {
        &self.slots[(self.head + 1) % N]
    }
}

/// Time grid and initial state of a transient run
#[derive(Debug, Clone, PartialEq)]
pub struct TransientParams {
    pub tend: f64,
    /// Requested step; the integrator's default when `None`
    pub timestep: Option<f64>,
    /// Initial state, zeros when `None`
    pub x0: Option<DVector<f64>>,
}

impl Default for TransientParams {
    fn default() -> Self {
        TransientParams {
            tend: 1e-3,
            timestep: None,
            x0: None,
        }
    }
}

impl TransientParams {
    pub fn new(tend: f64, timestep: f64) -> Self {
        TransientParams {
            tend,
            timestep: Some(timestep),
            x0: None,
        }
    }

    pub fn with_x0(mut self, x0: DVector<f64>) -> Self {
        self.x0 = Some(x0);
        self
    }

    /// `floor(tend / timestep)` evenly spaced points on `[0, tend]` and their spacing
    fn grid(&self, default_timestep: f64) -> Result<(usize, f64)> {
        let timestep = self.timestep.unwrap_or(default_timestep);
        if !(self.tend > 0.0 && self.tend.is_finite()) {
            return Err(AnalysisError::configuration(format!("invalid end time {}", self.tend)));
        }
        if !(timestep > 0.0 && timestep.is_finite()) {
            return Err(AnalysisError::configuration(format!("invalid timestep {}", timestep)));
        }

        let num = (self.tend / timestep).floor() as usize;
        if num < 2 {
            return Err(AnalysisError::configuration(format!(
                "timestep {} leaves fewer than two points up to {}",
                timestep, self.tend
            )));
        }
        Ok((num, self.tend / (num - 1) as f64))
    }
}

/// Explicit transient integrator.
///
/// Each point solves `(G + C/dt)·x' = -(u + i - G·x_k - C/dt·x_{k-1})`
/// with the matrices evaluated at the latest accepted state.
pub struct ExplicitTransient<'a, M: CircuitModel + ?Sized> {
    analysis: Analysis<'a, M>,
    result: TransientResult<'a, M>,
}

impl<'a, M: CircuitModel + ?Sized> ExplicitTransient<'a, M> {
    pub const DEFAULT_TIMESTEP: f64 = 1e-5;

    pub fn new(circuit: &'a M, options: AnalysisOptions) -> Result<Self> {
        let analysis = Analysis::new(circuit, options)?;
        let result = TransientResult::new(circuit, analysis.params().clone());
        Ok(ExplicitTransient { analysis, result })
    }

    /// States accepted by the last run, complete or not
    pub fn result(&self) -> &TransientResult<'a, M> {
        &self.result
    }

    pub fn solve(&mut self, params: &TransientParams) -> Result<&TransientResult<'a, M>> {
        let circuit = self.analysis.circuit();
        let n = circuit.n();
        let (num, dt) = params.grid(Self::DEFAULT_TIMESTEP)?;

        let x0 = match &params.x0 {
            Some(x0) if x0.len() != n => {
                return Err(AnalysisError::DimensionMismatch {
                    expected: n,
                    actual: x0.len(),
                })
            }
            Some(x0) => x0.clone(),
            None => DVector::zeros(n),
        };

        info!("explicit transient: {} points, dt = {:.3e}", num, dt);
        self.result = TransientResult::new(circuit, self.analysis.params().clone());
        let mut history = History::<2>::new(x0);

        for k in 0..num {
            let x_new = self.step(&history, dt)?;
            debug!("t = {:.6e}: accepted", k as f64 * dt);
            history.push(x_new.clone());
            self.result.push(k as f64 * dt, x_new);
        }

        info!("explicit transient finished");
        Ok(&self.result)
    }

    fn step(&self, history: &History<2>, dt: f64) -> Result<DVector<f64>> {
        let circuit = self.analysis.circuit();
        let params = self.analysis.params();
        let refnode = self.analysis.refnode();
        let x = history.latest();

        let g = circuit.g(x, params)?;
        let geq = circuit.c(x, params)? / dt;
        let companion = circuit.i(x, params)? - &g * x;
        let u_total = circuit.u(x, AnalysisMode::Tran, params)? + companion - &geq * history.oldest();
        let g_total = g + geq;

        let g_reduced = refnode.matrix(&g_total)?;
        let u_reduced = refnode.vector(&u_total)?;
        let x_reduced = self.analysis.toolkit().linear_solver(&g_reduced, &(-u_reduced))?;
        refnode.reinsert(&x_reduced)
    }
}

/// Implicit (backward Euler) transient integrator solved with Newton.
///
/// States in the history exclude the reference node; the result stores
/// them with the reference reinserted.
pub struct ImplicitTransient<'a, M: CircuitModel + ?Sized> {
    analysis: Analysis<'a, M>,
    newton: NewtonConfig,
    result: TransientResult<'a, M>,
}

impl<'a, M: CircuitModel + ?Sized> ImplicitTransient<'a, M> {
    pub const DEFAULT_TIMESTEP: f64 = 1e-6;

    pub fn new(circuit: &'a M, options: AnalysisOptions) -> Result<Self> {
        let analysis = Analysis::new(circuit, options)?;
        let result = TransientResult::new(circuit, analysis.params().clone());
        Ok(ImplicitTransient {
            analysis,
            newton: NewtonConfig::default(),
            result,
        })
    }

    pub fn with_newton(mut self, newton: NewtonConfig) -> Self {
        self.newton = newton;
        self
    }

    pub fn newton(&self) -> &NewtonConfig {
        &self.newton
    }

    pub fn result(&self) -> &TransientResult<'a, M> {
        &self.result
    }

    /// Run the time loop; `params.x0`, when given, excludes the reference node
    pub fn solve(&mut self, params: &TransientParams) -> Result<&TransientResult<'a, M>> {
        let circuit = self.analysis.circuit();
        let refnode = self.analysis.refnode();
        let reduced = circuit.n() - 1;
        let (num, dt) = params.grid(Self::DEFAULT_TIMESTEP)?;

        let x0 = match &params.x0 {
            Some(x0) if x0.len() != reduced => {
                return Err(AnalysisError::DimensionMismatch {
                    expected: reduced,
                    actual: x0.len(),
                })
            }
            Some(x0) => x0.clone(),
            None => DVector::zeros(reduced),
        };

        info!(
            "implicit transient: {} points, dt = {:.3e}, newton tolerance {:.1e}",
            num, dt, self.newton.residual_tolerance
        );
        self.result = TransientResult::new(circuit, self.analysis.params().clone());
        let mut history = History::<1>::new(x0);

        for k in 0..num {
            let x_new = self.solve_timestep(history.latest(), dt)?;
            self.result.push(k as f64 * dt, refnode.reinsert(&x_new)?);
            history.push(x_new);
        }

        info!("implicit transient finished");
        Ok(&self.result)
    }

    /// Advance one step of size `dt` from the reduced state `x_k`
    pub fn solve_timestep(&self, x_k: &DVector<f64>, dt: f64) -> Result<DVector<f64>> {
        let step = BackwardEulerStep {
            analysis: &self.analysis,
            x_prev: self.analysis.refnode().reinsert(x_k)?,
            dt,
        };
        let solved = newton::solve(&step, x_k, &self.newton, self.analysis.toolkit())?;
        debug!(
            "step converged in {} iterations (residual {:.3e})",
            solved.iterations, solved.residual
        );
        Ok(solved.solution)
    }
}

/// `F(x) = i(x) + C(x)/dt·(x - x_k) + u(x)` on the reduced state
struct BackwardEulerStep<'s, 'a, M: CircuitModel + ?Sized> {
    analysis: &'s Analysis<'a, M>,
    x_prev: DVector<f64>,
    dt: f64,
}

impl<'s, 'a, M: CircuitModel + ?Sized> NonlinearSystem for BackwardEulerStep<'s, 'a, M> {
    fn residual(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        let circuit = self.analysis.circuit();
        let params = self.analysis.params();
        let refnode = self.analysis.refnode();
        let x = refnode.reinsert(x)?;

        let geq = circuit.c(&x, params)? / self.dt;
        let ueq = -(&geq * &self.x_prev);
        let f = circuit.i(&x, params)? + &geq * &x + circuit.u(&x, AnalysisMode::Tran, params)? + ueq;
        refnode.vector(&f)
    }

    fn jacobian(&self, x: &DVector<f64>) -> Result<DMatrix<f64>> {
        let circuit = self.analysis.circuit();
        let params = self.analysis.params();
        let refnode = self.analysis.refnode();
        let x = refnode.reinsert(x)?;

        let j = circuit.g(&x, params)? + circuit.c(&x, params)? / self.dt;
        refnode.matrix(&j)
    }
}
