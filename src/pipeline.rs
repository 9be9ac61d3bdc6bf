//! Ordered run of named steps, each either fatal or recoverable on failure.

use anyhow::{Context, Result};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The error aborts the run.
    Fatal,
    /// The error is logged and the run goes on.
    Recoverable,
}

type Action<'a, C> = Box<dyn FnMut(&mut C) -> Result<()> + 'a>;

pub struct Step<'a, C> {
    pub name: &'static str,
    pub severity: Severity,
    action: Action<'a, C>,
}

/// Outcome of a run that was not aborted.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub completed: Vec<&'static str>,
    /// Recoverable steps that failed, with their error chain
    pub warnings: Vec<(&'static str, String)>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

pub struct Pipeline<'a, C> {
    steps: Vec<Step<'a, C>>,
}

impl<'a, C> Default for Pipeline<'a, C> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<'a, C> Pipeline<'a, C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step<F>(mut self, name: &'static str, severity: Severity, action: F) -> Self
    where
        F: FnMut(&mut C) -> Result<()> + 'a,
    {
        self.steps.push(Step {
            name,
            severity,
            action: Box::new(action),
        });
        self
    }

    pub fn fatal<F>(self, name: &'static str, action: F) -> Self
    where
        F: FnMut(&mut C) -> Result<()> + 'a,
    {
        self.step(name, Severity::Fatal, action)
    }

    pub fn recoverable<F>(self, name: &'static str, action: F) -> Self
    where
        F: FnMut(&mut C) -> Result<()> + 'a,
    {
        self.step(name, Severity::Recoverable, action)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order against `ctx`.
    ///
    /// The first fatal failure is returned with the step name as context;
    /// later steps do not run.
    pub fn run(self, ctx: &mut C) -> Result<RunReport> {
        let mut report = RunReport::default();
        let total = self.steps.len();

        for (i, mut step) in self.steps.into_iter().enumerate() {
            info!(step = step.name, index = i + 1, total, "Running step");
            match (step.action)(ctx) {
                Ok(()) => report.completed.push(step.name),
                Err(e) => match step.severity {
                    Severity::Fatal => {
                        return Err(e).with_context(|| format!("Step '{}' failed", step.name));
                    }
                    Severity::Recoverable => {
                        let msg = format!("{:#}", e);
                        warn!(step = step.name, error = %msg, "Step failed, continuing");
                        report.warnings.push((step.name, msg));
                    }
                },
            }
        }

        Ok(report)
    }
}
