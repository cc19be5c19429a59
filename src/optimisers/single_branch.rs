use std::cell::RefCell;

use argmin::core::{CostFunction, Executor, IterState, State};
use argmin::solver::brent::BrentOpt;
use log::debug;

use crate::optimisers::{BranchSettings, SingleValOptResult};
use crate::Result;

const MAX_STEP_HALVINGS: usize = 10;

struct NegatedObjective<'a, F: FnMut(f64) -> f64> {
    f: RefCell<&'a mut F>,
}

impl<F: FnMut(f64) -> f64> CostFunction for NegatedObjective<'_, F> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, value: &Self::Param) -> Result<Self::Output> {
        let mut f = self.f.borrow_mut();
        Ok(-(*f)(*value))
    }
}

/// Maximises `f` on `[min, max]` with Brent's method, returning the best point and its value.
pub fn brent_maximise<F: FnMut(f64) -> f64>(
    min: f64,
    max: f64,
    start: f64,
    max_iterations: usize,
    f: &mut F,
) -> Result<(f64, f64)> {
    let objective = NegatedObjective { f: RefCell::new(f) };
    let res = Executor::new(objective, BrentOpt::new(min, max))
        .configure(|_| {
            IterState::new()
                .param(start)
                .max_iters(max_iterations as u64)
        })
        .run()?;
    let state = res.state();
    Ok((state.best_param.unwrap_or(start), -state.best_cost))
}

/// Maximises a log-likelihood in one branch length. `f` returns the log-likelihood and its first
/// two derivatives at a length. Newton steps are clamped to the bounds and halved until they do
/// not lose likelihood; when the curvature is not negative or no step helps, Brent's method on
/// the bounds takes over. The result never scores below `start`: if nothing better is found the
/// starting length is kept and reported as retained.
pub fn optimise_single_branch<F>(
    settings: &BranchSettings,
    start: f64,
    mut f: F,
) -> Result<SingleValOptResult>
where
    F: FnMut(f64) -> (f64, f64, f64),
{
    let clamp = |x: f64| x.clamp(settings.min_blen, settings.max_blen);
    let (initial_cost, _, _) = f(start);

    let mut x = clamp(start);
    let (mut fx, mut dfx, mut ddfx) = f(x);
    let mut iterations = 0;
    let mut fallback = !fx.is_finite();
    while !fallback && iterations < settings.max_iterations {
        iterations += 1;
        if !(ddfx < 0.0) {
            fallback = true;
            break;
        }
        let mut next = clamp(x - dfx / ddfx);
        let (mut f_next, mut df_next, mut ddf_next) = f(next);
        let mut halvings = 0;
        while (f_next < fx || f_next.is_nan()) && halvings < MAX_STEP_HALVINGS {
            next = x + (next - x) / 2.0;
            (f_next, df_next, ddf_next) = f(next);
            halvings += 1;
        }
        if f_next < fx || f_next.is_nan() {
            fallback = true;
            break;
        }
        let gain = f_next - fx;
        (x, fx, dfx, ddfx) = (next, f_next, df_next, ddf_next);
        if gain < settings.epsilon {
            break;
        }
    }

    if fallback {
        debug!("Newton failed for start length {start}, falling back to Brent");
        let mut logl = |blen: f64| f(blen).0;
        let (brent_x, brent_fx) = brent_maximise(
            settings.min_blen,
            settings.max_blen,
            x,
            settings.max_iterations,
            &mut logl,
        )?;
        if brent_fx > fx || !fx.is_finite() {
            (x, fx) = (clamp(brent_x), brent_fx);
        }
    }

    if !(fx >= initial_cost) {
        return Ok(SingleValOptResult {
            value: start,
            initial_cost,
            final_cost: initial_cost,
            iterations,
            retained: true,
        });
    }
    Ok(SingleValOptResult {
        value: x,
        initial_cost,
        final_cost: fx,
        iterations,
        retained: false,
    })
}
