//! Ordered fallback ladder for hardware bring-up steps
//!
//! A ladder is a list of named recovery rungs tried after the initial attempt
//! fails. Each rung inspects the latest error, decides whether it applies,
//! adjusts the context and the attempt is repeated. The first success wins;
//! once every rung has been tried the last error is returned.

use tracing::{debug, warn};

use super::hal::{HalError, HalResult};

type Prepare<'r, C> = Box<dyn FnMut(&mut C, &HalError) -> HalResult<bool> + 'r>;
type Revert<'r, C> = Box<dyn FnMut(&mut C) + 'r>;

/// One recovery strategy
pub struct Rung<'r, C> {
    name: &'static str,
    prepare: Prepare<'r, C>,
    revert: Option<Revert<'r, C>>,
}

impl<'r, C> Rung<'r, C> {
    /// `prepare` returns `Ok(false)` when the rung does not apply to the
    /// error, `Ok(true)` after adjusting the context for a retry. An `Err`
    /// means the recovery itself failed and ends the ladder.
    pub fn new(
        name: &'static str,
        prepare: impl FnMut(&mut C, &HalError) -> HalResult<bool> + 'r,
    ) -> Self {
        Self {
            name,
            prepare: Box::new(prepare),
            revert: None,
        }
    }

    /// Undo the adjustment when the retry fails, before the next rung runs
    pub fn with_revert(mut self, revert: impl FnMut(&mut C) + 'r) -> Self {
        self.revert = Some(Box::new(revert));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub struct Ladder<'r, C> {
    step: &'static str,
    rungs: Vec<Rung<'r, C>>,
}

impl<'r, C> Ladder<'r, C> {
    pub fn new(step: &'static str) -> Self {
        Self {
            step,
            rungs: Vec::new(),
        }
    }

    pub fn rung(mut self, rung: Rung<'r, C>) -> Self {
        self.rungs.push(rung);
        self
    }

    pub fn len(&self) -> usize {
        self.rungs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rungs.is_empty()
    }

    /// Run `attempt`, walking the rungs in order until it succeeds
    pub fn run<T>(
        mut self,
        ctx: &mut C,
        mut attempt: impl FnMut(&mut C) -> HalResult<T>,
    ) -> HalResult<T> {
        let mut last = match attempt(ctx) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        for rung in self.rungs.iter_mut() {
            if !(rung.prepare)(ctx, &last)? {
                debug!("{}: {} does not apply to {}", self.step, rung.name, last);
                continue;
            }
            warn!("{} failed ({}), retrying with {}", self.step, last, rung.name);
            match attempt(ctx) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} still failing after {}: {}", self.step, rung.name, e);
                    if let Some(revert) = rung.revert.as_mut() {
                        revert(ctx);
                    }
                    last = e;
                }
            }
        }
        Err(last)
    }
}
