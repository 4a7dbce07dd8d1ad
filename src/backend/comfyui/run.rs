//! Completion state machine for a single workflow run
//!
//! `Submitted -> Queued -> Executing(pct) -> {Completed | Errored} | TimedOut`
//!
//! Push events and poll responses are both translated into [`RunSignal`]s and
//! fed through [`WorkflowRun::apply`]. The first completion signal flips a
//! one-shot latch; later completion signals, from either channel, are inert.

/// Location of a produced image on the workflow server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    pub filename: String,
    pub subfolder: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Submitted,
    Queued,
    Executing { percent: u8 },
    Completed,
    Errored(String),
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Errored(_) | RunStatus::TimedOut)
    }
}

/// Something either detection channel observed about the run
#[derive(Debug, Clone, PartialEq)]
pub enum RunSignal {
    /// Accepted but not started
    Queued,
    ExecutionStarted,
    Progress { value: u64, max: u64 },
    /// `None` means the server has no node left to execute
    Executing { node: Option<String> },
    /// A node produced an image
    Output(OutputRef),
    Finished,
    Failed(String),
}

/// What the caller should do after a signal
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Unchanged,
    Queued,
    Progress(u8),
    /// First completion signal; fetch the outputs
    CompletionTriggered,
    Failed(String),
}

#[derive(Debug)]
pub struct WorkflowRun {
    run_id: String,
    status: RunStatus,
    output: Option<OutputRef>,
    completion_latched: bool,
}

impl WorkflowRun {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Submitted,
            output: None,
            completion_latched: false,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn output(&self) -> Option<&OutputRef> {
        self.output.as_ref()
    }

    /// Whether some channel has already reported completion
    pub fn completion_latched(&self) -> bool {
        self.completion_latched
    }

    pub fn apply(&mut self, signal: RunSignal) -> Transition {
        if self.status.is_terminal() {
            return Transition::Unchanged;
        }

        match signal {
            RunSignal::Queued => {
                if self.status == RunStatus::Submitted {
                    self.status = RunStatus::Queued;
                    Transition::Queued
                } else {
                    Transition::Unchanged
                }
            }
            RunSignal::ExecutionStarted => self.set_percent(0),
            RunSignal::Executing { node: Some(_) } => {
                if matches!(self.status, RunStatus::Executing { .. }) {
                    Transition::Unchanged
                } else {
                    self.set_percent(0)
                }
            }
            RunSignal::Executing { node: None } => self.latch(),
            RunSignal::Progress { value, max } => {
                if max == 0 {
                    return Transition::Unchanged;
                }
                let percent = (value.min(max) * 100 / max) as u8;
                let transition = self.set_percent(percent);
                if value >= max {
                    self.latch()
                } else {
                    transition
                }
            }
            RunSignal::Output(output) => {
                self.output = Some(output);
                Transition::Unchanged
            }
            RunSignal::Finished => self.latch(),
            RunSignal::Failed(message) => {
                self.status = RunStatus::Errored(message.clone());
                Transition::Failed(message)
            }
        }
    }

    /// The outputs were fetched
    pub fn complete(&mut self, output: OutputRef) {
        self.output = Some(output);
        self.status = RunStatus::Completed;
    }

    pub fn time_out(&mut self) {
        if !self.status.is_terminal() {
            self.status = RunStatus::TimedOut;
        }
    }

    fn set_percent(&mut self, percent: u8) -> Transition {
        let previous = match self.status {
            RunStatus::Executing { percent } => Some(percent),
            _ => None,
        };
        self.status = RunStatus::Executing { percent };
        if previous == Some(percent) {
            Transition::Unchanged
        } else {
            Transition::Progress(percent)
        }
    }

    fn latch(&mut self) -> Transition {
        if self.completion_latched {
            Transition::Unchanged
        } else {
            self.completion_latched = true;
            Transition::CompletionTriggered
        }
    }
}
