//! Runs scenarios in sequence and collects their outcomes.

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tracing::instrument;

use crate::scenario::{Scenario, ScenarioContext};
use crate::{HarnessError, Result};

/// What happens after a scenario fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Skip the remaining scenarios.
    #[default]
    Abort,
    /// Suspend for inspection, then tear down and continue with the next scenario.
    PauseForInspection,
}

/// Someone who looks at the cluster while a failed scenario's state is still in place.
#[async_trait::async_trait]
pub trait Operator: Send + Sync {
    /// Returns when the run may resume.
    async fn suspend(&self, ctx: &ScenarioContext, failure: &ScenarioFailure);
}

/// Waits for a line on stdin.
#[derive(Debug, Default)]
pub struct StdinOperator;

#[async_trait::async_trait]
impl Operator for StdinOperator {
    async fn suspend(&self, ctx: &ScenarioContext, failure: &ScenarioFailure) {
        tracing::warn!("run suspended for inspection");
        eprintln!(
            "{failure}\n\nclient.{} on {}, client.{} on {}\nrun suspended, press enter to resume",
            ctx.mount_a.client_id(),
            ctx.mount_a.core().hostname(),
            ctx.mount_b.client_id(),
            ctx.mount_b.core().hostname(),
        );
        let mut line = String::new();
        let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
        if let Err(error) = stdin.read_line(&mut line).await {
            tracing::warn!("reading stdin: {}", error);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum FailureKind {
    /// An expectation about the service did not hold.
    Fail,
    /// The scenario could not be carried out.
    Error,
}

#[derive(Debug)]
pub struct ScenarioFailure {
    pub scenario: Scenario,
    pub kind: FailureKind,
    pub diagnostic: String,
}

impl std::fmt::Display for ScenarioFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}\n{}", self.kind, self.scenario, self.diagnostic)
    }
}

#[derive(Debug)]
pub enum Outcome {
    Passed(std::time::Duration),
    Failed(ScenarioFailure),
    NotRun,
}

#[derive(Debug)]
pub struct ScenarioOutcome {
    pub scenario: Scenario,
    pub outcome: Outcome,
}

/// Outcome of every selected scenario, in run order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<ScenarioOutcome>,
}

impl RunReport {
    pub fn passed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Passed(_)))
            .count()
    }

    pub fn not_run(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::NotRun))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScenarioFailure> {
        self.outcomes.iter().filter_map(|o| match &o.outcome {
            Outcome::Failed(failure) => Some(failure),
            _ => None,
        })
    }

    pub fn was_successful(&self) -> bool {
        self.failures().next().is_none() && self.not_run() == 0
    }

    /// Re-emits every failure's diagnostic and folds them into one error.
    pub fn into_result(self) -> Result<RunReport> {
        if self.was_successful() {
            return Ok(self);
        }
        for failure in self.failures() {
            tracing::error!("{}", failure);
        }
        let failed = self
            .outcomes
            .iter()
            .filter(|o| !matches!(o.outcome, Outcome::Passed(_)))
            .map(|o| o.scenario.to_string())
            .collect();
        Err(HarnessError::RunFailed {
            failed,
            total: self.outcomes.len(),
        })
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for outcome in &self.outcomes {
            match &outcome.outcome {
                Outcome::Passed(took) => writeln!(
                    f,
                    "{} ... ok ({})",
                    outcome.scenario,
                    crate::timing::format(*took)
                )?,
                Outcome::Failed(failure) => {
                    writeln!(f, "{} ... {}", outcome.scenario, failure.kind)?
                }
                Outcome::NotRun => writeln!(f, "{} ... not run", outcome.scenario)?,
            }
        }
        let failed = self.failures().filter(|x| x.kind == FailureKind::Fail).count();
        let errors = self.failures().filter(|x| x.kind == FailureKind::Error).count();
        write!(
            f,
            "ran {} scenarios: {} passed, {} failed, {} errors, {} not run",
            self.outcomes.len() - self.not_run(),
            self.passed(),
            failed,
            errors,
            self.not_run()
        )
    }
}

pub struct ScenarioRunner {
    policy: FailurePolicy,
    operator: Option<Arc<dyn Operator>>,
}

impl ScenarioRunner {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            operator: None,
        }
    }

    /// Consulted on failure under [`FailurePolicy::PauseForInspection`].
    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operator = Some(operator);
        self
    }

    async fn diagnose(
        ctx: &ScenarioContext,
        scenario: Scenario,
        error: &HarnessError,
    ) -> ScenarioFailure {
        let kind = if error.is_assertion() {
            FailureKind::Fail
        } else {
            FailureKind::Error
        };
        let sessions = match ctx.service.list_sessions().await {
            Ok(sessions) => format!("{sessions:#?}"),
            Err(error) => format!("unavailable: {error:#}"),
        };
        let state = match ctx.service.daemon_state().await {
            Ok(state) => state,
            Err(error) => format!("unavailable: {error:#}"),
        };
        ScenarioFailure {
            scenario,
            kind,
            diagnostic: format!(
                "{error:#}\nservice state: {state}\nclient.{}: {}, client.{}: {}\nsessions: {sessions}",
                ctx.mount_a.client_id(),
                ctx.mount_a.state(),
                ctx.mount_b.client_id(),
                ctx.mount_b.state(),
            ),
        }
    }

    #[instrument(skip_all)]
    pub async fn run(&self, ctx: &mut ScenarioContext, scenarios: &[Scenario]) -> RunReport {
        let mut report = RunReport::default();
        let mut aborted = false;
        for &scenario in scenarios {
            if aborted {
                report.outcomes.push(ScenarioOutcome {
                    scenario,
                    outcome: Outcome::NotRun,
                });
                continue;
            }
            tracing::info!("running scenario {}", scenario);
            let started = tokio::time::Instant::now();
            let result = match ctx.setup().await {
                Ok(()) => scenario.run(ctx).await,
                Err(error) => Err(error),
            };
            let mut failure = match result {
                Ok(()) => None,
                Err(error) => Some(Self::diagnose(ctx, scenario, &error).await),
            };
            if let Some(failure) = &failure {
                tracing::error!("{}", failure);
                if self.policy == FailurePolicy::PauseForInspection {
                    match &self.operator {
                        Some(operator) => operator.suspend(ctx, failure).await,
                        None => tracing::warn!(
                            "no operator to pause for after {}, tearing down right away",
                            scenario
                        ),
                    }
                }
            }
            if let Err(error) = ctx.teardown().await {
                tracing::error!("teardown after {} failed: {:#}", scenario, error);
                match &mut failure {
                    Some(failure) => {
                        failure.diagnostic = format!("{}\nteardown: {error:#}", failure.diagnostic)
                    }
                    None => {
                        failure = Some(ScenarioFailure {
                            scenario,
                            kind: FailureKind::Error,
                            diagnostic: format!("teardown: {error:#}"),
                        })
                    }
                }
            }
            let outcome = match failure {
                Some(failure) => {
                    aborted = self.policy == FailurePolicy::Abort;
                    Outcome::Failed(failure)
                }
                None => {
                    let took = started.elapsed();
                    tracing::info!(
                        "scenario {} passed in {}",
                        scenario,
                        crate::timing::format(took)
                    );
                    Outcome::Passed(took)
                }
            };
            report.outcomes.push(ScenarioOutcome { scenario, outcome });
        }
        tracing::info!("{}", report);
        report
    }
}
