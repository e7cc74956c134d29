//! Setpoint/readback settle loop.
//!
//! [`set_and_wait_within_tolerance`] writes a setpoint without waiting, then
//! polls until the readback is within tolerance:
//!
//! ```text
//! set(value)            (no wait, own group)
//! rb = read()           (fails if the set already failed)
//! while |rb - value| > tolerance:
//!     poll()            (default: delay 1 s)
//!     rb = read()       (fails if the set already failed)
//!     checkpoint()
//! stop(set)             (if still moving)
//! finish()              (always, exactly once)
//! ```
//!
//! The finishing action runs whether the loop succeeded, failed or was
//! aborted. The default finish writes the last readback back to the setpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{AlignError, AlignResult};
use crate::experiment::plans::Count;
use crate::experiment::run_engine::{MoveOptions, RunEngine, ScanContext};

/// Progress of a closed loop towards a target.
///
/// Shared by the settle loop (no cap) and the centring procedure (capped).
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceState {
    /// Value the loop drives towards
    pub target: f64,
    /// Largest acceptable `|readback - target|`
    pub tolerance: f64,
    /// Latest readback, `None` before the first read
    pub readback: Option<f64>,
    /// Corrections performed so far
    pub iterations: u32,
    /// Corrections allowed before giving up
    pub max_iterations: Option<u32>,
}

impl ConvergenceState {
    /// Uncapped state
    pub fn new(target: f64, tolerance: f64) -> Self {
        Self {
            target,
            tolerance,
            readback: None,
            iterations: 0,
            max_iterations: None,
        }
    }

    /// Cap the number of corrections
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Record a new readback
    pub fn update(&mut self, readback: f64) {
        self.readback = Some(readback);
    }

    /// `readback - target`, if a readback exists
    pub fn deviation(&self) -> Option<f64> {
        self.readback.map(|rb| rb - self.target)
    }

    /// True when the latest readback is within tolerance
    pub fn is_converged(&self) -> bool {
        matches!(self.deviation(), Some(d) if d.abs() <= self.tolerance)
    }

    /// Fail once the cap has been reached.
    ///
    /// # Errors
    /// [`AlignError::ConvergenceExceeded`] when `iterations` has hit `max_iterations`.
    pub fn check_budget(&self) -> AlignResult<()> {
        match self.max_iterations {
            Some(max) if self.iterations >= max => Err(AlignError::ConvergenceExceeded {
                iterations: self.iterations,
            }),
            _ => Ok(()),
        }
    }

    /// Count one correction
    pub fn advance(&mut self) {
        self.iterations += 1;
    }
}

/// Step run by the settle loop (poll) or after it (finish).
#[async_trait]
pub trait SettleAction: Send + Sync {
    /// Execute the action
    async fn run(&self, engine: &RunEngine) -> AlignResult<()>;
}

/// Sleep between readback checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayAction(pub f64);

impl Default for DelayAction {
    fn default() -> Self {
        Self(default_poll_delay())
    }
}

#[async_trait]
impl SettleAction for DelayAction {
    async fn run(&self, engine: &RunEngine) -> AlignResult<()> {
        engine.delay(self.0).await
    }
}

/// Take `num` readings of `detectors` as one run per poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanAction {
    /// Detectors to read
    pub detectors: Vec<String>,
    /// Readings per poll
    pub num: usize,
    /// Seconds between readings
    pub delay: f64,
}

impl PlanAction {
    /// Count `detectors` `num` times per poll
    pub fn count(detectors: &[&str], num: usize) -> Self {
        Self {
            detectors: detectors.iter().map(|d| d.to_string()).collect(),
            num,
            delay: 0.0,
        }
    }
}

#[async_trait]
impl SettleAction for PlanAction {
    async fn run(&self, engine: &RunEngine) -> AlignResult<()> {
        let mut plan = Count::new(self.num)
            .with_detectors(&self.detectors)
            .with_delay(self.delay);
        ScanContext::new(engine).execute_plan(&mut plan).await?;
        Ok(())
    }
}

/// Write the current readback to the setpoint and wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetpointToReadback {
    /// Setpoint device
    pub set_signal: String,
    /// Readback device
    pub readback: String,
}

#[async_trait]
impl SettleAction for SetpointToReadback {
    async fn run(&self, engine: &RunEngine) -> AlignResult<()> {
        set_setpoint_to_readback(engine, &self.set_signal, &self.readback).await
    }
}

/// Read `readback` and move `set_signal` to that value, waiting for completion.
pub async fn set_setpoint_to_readback(
    engine: &RunEngine,
    set_signal: &str,
    readback: &str,
) -> AlignResult<()> {
    let value = engine.read(readback).await?;
    debug!(set_signal, value, "Setpoint follows readback");
    engine.move_to(set_signal, value, MoveOptions::wait()).await
}

fn default_poll_delay() -> f64 {
    1.0
}

/// Defaults for settle loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettleConfig {
    /// Seconds slept between readback checks when no poll action is given
    #[serde(default = "default_poll_delay")]
    pub poll_delay: f64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            poll_delay: default_poll_delay(),
        }
    }
}

/// Optional parts of a settle loop.
#[derive(Default)]
pub struct SettleOptions {
    /// Readback device; the setpoint device itself when `None`
    pub readback: Option<String>,
    /// Poll action; a one second delay when `None`
    pub poll: Option<Box<dyn SettleAction>>,
    /// Finishing action; [`SetpointToReadback`] when `None`
    pub finish: Option<Box<dyn SettleAction>>,
}

impl SettleOptions {
    /// Options whose default poll uses `config.poll_delay`
    pub fn from_config(config: &SettleConfig) -> Self {
        Self::default().with_poll(DelayAction(config.poll_delay))
    }

    /// Read a separate readback device
    pub fn with_readback(mut self, readback: impl Into<String>) -> Self {
        self.readback = Some(readback.into());
        self
    }

    /// Replace the poll action
    pub fn with_poll(mut self, poll: impl SettleAction + 'static) -> Self {
        self.poll = Some(Box::new(poll));
        self
    }

    /// Replace the finishing action
    pub fn with_finish(mut self, finish: impl SettleAction + 'static) -> Self {
        self.finish = Some(Box::new(finish));
        self
    }
}

/// Outcome of a settled loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SettleReport {
    /// Readback that ended the loop
    pub final_readback: f64,
    /// Poll actions executed
    pub polls: u32,
}

/// Drive `set_signal` to `value` and wait for the readback to agree within
/// `tolerance`.
///
/// The setpoint move runs in the background while the readback is polled. A
/// failure of that move ends the loop. Whatever is still moving is stopped
/// before the finishing action runs, and the finishing action always runs
/// once. A loop error is returned in preference to a finishing error.
#[instrument(skip(engine, opts), err)]
pub async fn set_and_wait_within_tolerance(
    engine: &RunEngine,
    set_signal: &str,
    value: f64,
    tolerance: f64,
    opts: SettleOptions,
) -> AlignResult<SettleReport> {
    let readback = opts.readback.unwrap_or_else(|| set_signal.to_string());
    let poll = opts.poll.unwrap_or_else(|| Box::new(DelayAction::default()));
    let finish = opts.finish.unwrap_or_else(|| {
        Box::new(SetpointToReadback {
            set_signal: set_signal.to_string(),
            readback: readback.clone(),
        })
    });

    let group = format!("{set_signal}_settle");
    engine
        .move_to(set_signal, value, MoveOptions::in_group(group.as_str()))
        .await?;

    let state = ConvergenceState::new(value, tolerance);
    let settled = match (
        settle(engine, &readback, &group, state, poll.as_ref()).await,
        engine.cancel(&group).await,
    ) {
        (Ok(state), Ok(())) => Ok(state),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), cancelled) => {
            if let Err(cancel_err) = cancelled {
                warn!(set_signal, error = %cancel_err, "Stopping setpoint move failed after loop error");
            }
            Err(e)
        }
    };
    let finished = finish.run(engine).await;

    match (settled, finished) {
        (Ok(state), Ok(())) => {
            let report = SettleReport {
                final_readback: state.readback.unwrap_or(value),
                polls: state.iterations,
            };
            info!(set_signal, value, polls = report.polls, "Readback within tolerance");
            Ok(report)
        }
        (Ok(_), Err(e)) => Err(e),
        (Err(e), finished) => {
            if let Err(finish_err) = finished {
                warn!(set_signal, error = %finish_err, "Finishing action failed after loop error");
            }
            Err(e)
        }
    }
}

async fn settle(
    engine: &RunEngine,
    readback: &str,
    group: &str,
    mut state: ConvergenceState,
    poll: &dyn SettleAction,
) -> AlignResult<ConvergenceState> {
    state.update(engine.read(readback).await?);
    engine.check_group(group).await?;
    while !state.is_converged() {
        debug!(
            readback,
            deviation = ?state.deviation(),
            polls = state.iterations,
            "Waiting for readback"
        );
        poll.run(engine).await?;
        state.advance();
        state.update(engine.read(readback).await?);
        engine.check_group(group).await?;
        engine.checkpoint().await?;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convergence_state_budget() {
        let mut state = ConvergenceState::new(1.0, 0.1).with_max_iterations(2);
        assert!(!state.is_converged());
        state.update(1.05);
        assert!(state.is_converged());
        state.update(2.0);
        assert!(state.check_budget().is_ok());
        state.advance();
        state.advance();
        assert!(matches!(
            state.check_budget(),
            Err(AlignError::ConvergenceExceeded { iterations: 2 })
        ));
    }

    #[test]
    fn test_uncapped_state_never_exceeds() {
        let mut state = ConvergenceState::new(0.0, 0.0);
        for _ in 0..100 {
            state.advance();
        }
        assert!(state.check_budget().is_ok());
    }

    #[test]
    fn test_settle_config_default_delay() {
        let config: SettleConfig = toml::from_str("").unwrap();
        assert_eq!(config.poll_delay, 1.0);
    }
}
