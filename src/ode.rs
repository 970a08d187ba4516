//! Minimal fixed-step integrators for CNF state tuples.
//!
//! The concrete solver is an external collaborator; any integrator that calls
//! `before_odeint` once and then `forward(t, states)` per step can drive the
//! state functions in `odefunc`. This module is the fixed-step stand-in used
//! by the crate's own tests and sampling paths:
//! \[
//! \frac{d}{dt}\,\text{states}(t) = f(t, \text{states}),
//! \]
//! advancing **all** channels jointly from the derivative tuple.
//!
//! We keep this module tiny and deterministic: no adaptive stepping, no hidden
//! tolerances.

use crate::odefunc::StateChannel;
use crate::{Error, Result};

/// Fixed-step ODE method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdeMethod {
    /// Explicit Euler (1st order).
    Euler,
    /// Heun / explicit trapezoid / RK2 (2nd order).
    Heun,
}

fn axpy(states: &mut [StateChannel], a: f32, derivs: &[StateChannel]) -> Result<()> {
    if states.len() != derivs.len() {
        return Err(Error::Shape("derivative tuple length differs from state"));
    }
    for (x, v) in states.iter_mut().zip(derivs) {
        x.scaled_add(a, v)?;
    }
    Ok(())
}

/// Integrate a joint state tuple forward with fixed steps.
///
/// - `states0`: initial channels (position, log-density, auxiliaries)
/// - `t0`: initial time
/// - `dt`: step size
/// - `steps`: number of steps (must be >= 1)
/// - `f`: returns the joint derivative tuple
pub fn integrate_fixed(
    method: OdeMethod,
    states0: &[StateChannel],
    t0: f32,
    dt: f32,
    steps: usize,
    mut f: impl FnMut(f32, &[StateChannel]) -> Result<Vec<StateChannel>>,
) -> Result<Vec<StateChannel>> {
    assert!(steps >= 1);
    assert!(dt.is_finite());

    let mut states = states0.to_vec();
    let mut t = t0;

    match method {
        OdeMethod::Euler => {
            for _ in 0..steps {
                let v = f(t, &states)?;
                axpy(&mut states, dt, &v)?;
                t += dt;
            }
        }
        OdeMethod::Heun => {
            for _ in 0..steps {
                let v0 = f(t, &states)?;

                // predictor
                let mut pred = states.clone();
                axpy(&mut pred, dt, &v0)?;

                // corrector
                let v1 = f(t + dt, &pred)?;
                axpy(&mut states, 0.5 * dt, &v0)?;
                axpy(&mut states, 0.5 * dt, &v1)?;

                t += dt;
            }
        }
    }

    Ok(states)
}
