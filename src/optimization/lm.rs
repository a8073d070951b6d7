//! Damped least squares (Levenberg-Marquardt) as a pure state transition.
//!
//! A [`LeastSquaresProblem`] supplies the cost and the Gauss-Newton normal
//! equations at a parameter value. [`step`] performs one damped iteration from
//! an [`LmState`] and returns the next state; [`minimize`] iterates it until
//! convergence, the iteration budget or cancellation.

use crate::cancel::CancelFlag;
use crate::optimization::TerminationCriteria;
use log::debug;
use nalgebra::{DMatrix, DVector};

/// Damping of the first iteration, relative to `diag(JᵀJ)`.
pub const INITIAL_DAMPING: f64 = 1e-3;
const DAMPING_FACTOR: f64 = 10.0;
const MAX_DAMPING: f64 = 1e16;
/// Diagonal entries of `JᵀJ` below this fraction of the largest one mark an
/// unobservable parameter.
const OBSERVABILITY_RATIO: f64 = 1e-12;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LmError {
    #[error("normal equations are singular: {0}")]
    Singular(String),
    #[error("damping overflow, no step reduces the cost")]
    DampingOverflow,
    #[error("no cost reduction within {0} iterations")]
    NoProgress(usize),
    #[error("non-finite cost: {0}")]
    NonFinite(String),
    #[error("cancelled")]
    Cancelled,
}

/// Gauss-Newton system at one parameter value.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    pub jtj: DMatrix<f64>,
    pub jtr: DVector<f64>,
    /// Sum of squared residuals.
    pub cost: f64,
}

impl NormalEquations {
    pub fn zeros(n: usize) -> Self {
        Self {
            jtj: DMatrix::zeros(n, n),
            jtr: DVector::zeros(n),
            cost: 0.0,
        }
    }

    /// Adds another partial system, used to reduce per-block contributions.
    pub fn accumulate(mut self, other: &NormalEquations) -> Self {
        self.jtj += &other.jtj;
        self.jtr += &other.jtr;
        self.cost += other.cost;
        self
    }
}

pub trait LeastSquaresProblem: Sync {
    type Params: Clone + Send + Sync;

    fn num_params(&self) -> usize;

    /// Sum of squared residuals, `f64::INFINITY` when the parameters are not
    /// admissible (for instance a point behind the camera).
    fn cost(&self, params: &Self::Params) -> Result<f64, LmError>;

    fn normal_equations(&self, params: &Self::Params) -> Result<NormalEquations, LmError>;

    /// Applies an update `delta` of length [`LeastSquaresProblem::num_params`].
    fn retract(&self, params: &Self::Params, delta: &DVector<f64>) -> Self::Params;

    /// Norm used for the relative step size.
    fn param_norm(&self, params: &Self::Params) -> f64;
}

#[derive(Debug, Clone)]
pub struct LmState<P> {
    pub params: P,
    pub damping: f64,
    pub cost: f64,
    pub iteration: usize,
}

#[derive(Debug, Clone)]
pub struct Transition<P> {
    pub state: LmState<P>,
    pub accepted: bool,
    /// `‖δ‖ / (‖x‖ + ε)` of the attempted update.
    pub step_norm: f64,
}

impl<P: Clone> LmState<P> {
    pub fn new<Q>(problem: &Q, params: P) -> Result<Self, LmError>
    where
        Q: LeastSquaresProblem<Params = P>,
    {
        let cost = problem.cost(&params)?;
        if !cost.is_finite() {
            return Err(LmError::NonFinite(
                "initial parameters are not admissible".to_string(),
            ));
        }
        Ok(Self {
            params,
            damping: INITIAL_DAMPING,
            cost,
            iteration: 0,
        })
    }
}

/// Solves `(JᵀJ + λ diag(JᵀJ)) δ = −Jᵀr` for the current state.
fn solve_damped(normal: &NormalEquations, damping: f64) -> Result<DVector<f64>, LmError> {
    let diagonal = normal.jtj.diagonal();
    let max_diag = diagonal.iter().copied().fold(0.0, f64::max);
    if !(max_diag > 0.0) || !max_diag.is_finite() {
        return Err(LmError::Singular("empty Jacobian".to_string()));
    }
    if let Some(idx) = diagonal
        .iter()
        .position(|d| *d <= OBSERVABILITY_RATIO * max_diag)
    {
        return Err(LmError::Singular(format!("parameter {idx} is unobservable")));
    }

    let mut damped = normal.jtj.clone();
    for (i, d) in diagonal.iter().enumerate() {
        damped[(i, i)] += damping * d;
    }
    let cholesky = damped
        .cholesky()
        .ok_or_else(|| LmError::Singular("Cholesky factorization failed".to_string()))?;
    Ok(-cholesky.solve(&normal.jtr))
}

/// One Levenberg-Marquardt iteration. The returned state keeps the old
/// parameters when the step is rejected.
pub fn step<Q: LeastSquaresProblem>(
    problem: &Q,
    state: &LmState<Q::Params>,
) -> Result<Transition<Q::Params>, LmError> {
    let normal = problem.normal_equations(&state.params)?;
    let delta = solve_damped(&normal, state.damping)?;
    let step_norm = delta.norm() / (problem.param_norm(&state.params) + f64::EPSILON);

    let candidate = problem.retract(&state.params, &delta);
    let candidate_cost = problem.cost(&candidate)?;

    let next = if candidate_cost.is_finite() && candidate_cost < state.cost {
        Transition {
            state: LmState {
                params: candidate,
                damping: (state.damping / DAMPING_FACTOR).max(f64::MIN_POSITIVE),
                cost: candidate_cost,
                iteration: state.iteration + 1,
            },
            accepted: true,
            step_norm,
        }
    } else {
        let damping = state.damping * DAMPING_FACTOR;
        if damping > MAX_DAMPING {
            return Err(LmError::DampingOverflow);
        }
        Transition {
            state: LmState {
                params: state.params.clone(),
                damping,
                cost: state.cost,
                iteration: state.iteration + 1,
            },
            accepted: false,
            step_norm,
        }
    };
    Ok(next)
}

#[derive(Debug, Clone)]
pub struct LmOutcome<P> {
    pub state: LmState<P>,
    pub initial_cost: f64,
    pub converged: bool,
}

/// Error of [`minimize`] together with the last accepted state.
#[derive(Debug, Clone)]
pub struct LmFailure<P> {
    pub error: LmError,
    pub state: LmState<P>,
}

/// Iterates [`step`] until the relative step drops below `criteria.epsilon`
/// or `criteria.max_iterations` is spent.
pub fn minimize<Q: LeastSquaresProblem>(
    problem: &Q,
    params: Q::Params,
    criteria: &TerminationCriteria,
    cancel: Option<&CancelFlag>,
) -> Result<LmOutcome<Q::Params>, Box<LmFailure<Q::Params>>> {
    let fallback = LmState {
        params: params.clone(),
        damping: INITIAL_DAMPING,
        cost: f64::INFINITY,
        iteration: 0,
    };
    let mut state = LmState::new(problem, params).map_err(|error| {
        Box::new(LmFailure {
            error,
            state: fallback,
        })
    })?;
    let initial_cost = state.cost;
    let mut any_accepted = false;

    while state.iteration < criteria.max_iterations {
        if cancel.is_some_and(CancelFlag::is_cancelled) {
            return Err(Box::new(LmFailure {
                error: LmError::Cancelled,
                state,
            }));
        }
        let transition = match step(problem, &state) {
            Ok(transition) => transition,
            Err(error) => return Err(Box::new(LmFailure { error, state })),
        };
        debug!(
            "LM iteration {}: cost {:.6e}, damping {:.1e}, step {:.3e}, {}",
            transition.state.iteration,
            transition.state.cost,
            transition.state.damping,
            transition.step_norm,
            if transition.accepted { "accepted" } else { "rejected" }
        );
        any_accepted |= transition.accepted;
        state = transition.state;
        if transition.step_norm < criteria.epsilon {
            return Ok(LmOutcome {
                state,
                initial_cost,
                converged: true,
            });
        }
    }

    if !any_accepted && criteria.max_iterations > 0 {
        let iterations = state.iteration;
        return Err(Box::new(LmFailure {
            error: LmError::NoProgress(iterations),
            state,
        }));
    }
    Ok(LmOutcome {
        state,
        initial_cost,
        converged: false,
    })
}
