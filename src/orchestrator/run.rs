use serde::Serialize;

use crate::metrics::MetricSample;
use crate::wire::{Role, SessionKey};

use super::plan::TestPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Pending,
    StartingServers,
    StartingClients,
    Running,
    RunningUpload,
    RunningDownload,
    Stopping,
    Completed,
    Failed,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::StartingServers => "starting_servers",
            Self::StartingClients => "starting_clients",
            Self::Running => "running",
            Self::RunningUpload => "running_upload",
            Self::RunningDownload => "running_download",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Phases in which traffic flows and metrics are polled.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(
            self,
            Self::Running | Self::RunningUpload | Self::RunningDownload
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl From<Phase> for RunStatus {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Pending => Self::Pending,
            Phase::StartingServers
            | Phase::StartingClients
            | Phase::Running
            | Phase::RunningUpload
            | Phase::RunningDownload
            | Phase::Stopping => Self::Running,
            Phase::Completed => Self::Completed,
            Phase::Failed => Self::Failed,
        }
    }
}

/// Samples gathered from one participant, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSeries {
    pub name: String,
    pub agent: String,
    pub role: Role,
    pub sessions: Vec<SessionKey>,
    pub samples: Vec<MetricSample>,
    /// Polls of this participant's agent that timed out or failed.
    pub poll_failures: u64,
}

impl AgentSeries {
    #[must_use]
    pub fn mean_mbps(&self) -> (Option<f64>, Option<f64>) {
        let mean = |values: Vec<f64>| {
            let count = values.len();
            (count > 0).then(|| values.iter().sum::<f64>() / count as f64)
        };
        let up = self.samples.iter().filter_map(|sample| sample.up_mbps);
        let down = self.samples.iter().filter_map(|sample| sample.down_mbps);
        (mean(up.collect()), mean(down.collect()))
    }
}

/// A client that never started and was left out of aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientFailure {
    pub name: String,
    pub agent: String,
    pub error: String,
}

/// Offsets of one running phase from the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseWindow {
    pub phase: Phase,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Live and terminal state of one run. Published to subscribers after every
/// transition and tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestRun {
    pub plan: TestPlan,
    pub phase: Phase,
    pub status: RunStatus,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ticks: u64,
    pub phases: Vec<PhaseWindow>,
    pub series: Vec<AgentSeries>,
    pub failures: Vec<ClientFailure>,
}

impl TestRun {
    #[must_use]
    pub fn new(plan: TestPlan) -> Self {
        Self {
            plan,
            ..Self::default()
        }
    }

    pub(super) fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.status = RunStatus::from(phase);
    }

    #[must_use]
    pub fn series_named(&self, name: &str) -> Option<&AgentSeries> {
        self.series.iter().find(|series| series.name == name)
    }
}
