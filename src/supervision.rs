//! Supervision: maps a handler error to a resume/reset/stop outcome.

use std::sync::Arc;

use crate::rich::RichValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Resume,
    Reset,
    Stop,
}

/// Decides the outcome of a handler error against the entity's current
/// state. Implementers can consult `state` (e.g. a transaction counter) in
/// addition to the error itself.
pub trait Supervisor: Send + Sync {
    fn strategy(&self, state: &RichValue, error: &anyhow::Error) -> Strategy;
}

type Guard = Arc<dyn Fn(&RichValue, &anyhow::Error) -> bool + Send + Sync>;

/// Builds a [`Supervisor`] out of guards, evaluated with precedence
/// `stop > reset > resume`: the first matching `stop_when`
/// guard wins outright, then the first matching `reset_when` guard,
/// otherwise the configured default (itself `resume` unless overridden).
pub struct SupervisorBuilder {
    stop_guards: Vec<Guard>,
    reset_guards: Vec<Guard>,
    default: Strategy,
}

impl SupervisorBuilder {
    pub fn new() -> Self {
        SupervisorBuilder {
            stop_guards: Vec::new(),
            reset_guards: Vec::new(),
            default: Strategy::Resume,
        }
    }

    pub fn stop_when<F>(mut self, guard: F) -> Self
    where
        F: Fn(&RichValue, &anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.stop_guards.push(Arc::new(guard));
        self
    }

    pub fn reset_when<F>(mut self, guard: F) -> Self
    where
        F: Fn(&RichValue, &anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.reset_guards.push(Arc::new(guard));
        self
    }

    pub fn default_strategy(mut self, strategy: Strategy) -> Self {
        self.default = strategy;
        self
    }

    pub fn build(self) -> GuardedSupervisor {
        GuardedSupervisor {
            stop_guards: self.stop_guards,
            reset_guards: self.reset_guards,
            default: self.default,
        }
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GuardedSupervisor {
    stop_guards: Vec<Guard>,
    reset_guards: Vec<Guard>,
    default: Strategy,
}

impl Supervisor for GuardedSupervisor {
    fn strategy(&self, state: &RichValue, error: &anyhow::Error) -> Strategy {
        if self.stop_guards.iter().any(|g| g(state, error)) {
            return Strategy::Stop;
        }
        if self.reset_guards.iter().any(|g| g(state, error)) {
            return Strategy::Reset;
        }
        self.default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_takes_precedence_over_reset() {
        let supervisor = SupervisorBuilder::new()
            .stop_when(|_, _| true)
            .reset_when(|_, _| true)
            .build();
        let err = anyhow::anyhow!("boom");
        assert_eq!(supervisor.strategy(&RichValue::Null, &err), Strategy::Stop);
    }

    #[test]
    fn falls_back_to_default_when_no_guard_matches() {
        let supervisor = SupervisorBuilder::new()
            .reset_when(|_, _| false)
            .default_strategy(Strategy::Resume)
            .build();
        let err = anyhow::anyhow!("boom");
        assert_eq!(supervisor.strategy(&RichValue::Null, &err), Strategy::Resume);
    }
}
