//! Pipeline lifecycle and the errors that end it.

use std::fmt;

use serde::Serialize;

use crate::assembler::AssembleError;
use crate::configurator::ConfigureError;
use crate::layer::LayerError;

/// Where a pipeline run is.
///
/// ```text
/// Initialized → Resolving → Building(i) ⇄ Pruning → Configuring → Sealed
///                   any non-terminal state → Failed(reason)
/// ```
///
/// `Sealed` and `Failed` are terminal; a run is never resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum PipelineState {
    Initialized,
    Resolving,
    /// Executing the stage at this index
    Building(usize),
    Pruning,
    Configuring,
    Sealed,
    Failed(String),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Sealed | PipelineState::Failed(_))
    }

    pub fn can_transition(&self, next: &PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Sealed | Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Initialized, Resolving) => true,
            (Resolving, Building(_) | Pruning | Configuring) => true,
            (Building(i), Building(j)) => j > i,
            (Building(_), Pruning | Configuring) => true,
            (Pruning, Building(_) | Pruning | Configuring) => true,
            (Configuring, Sealed) => true,
            _ => false,
        }
    }

    pub fn transition(&mut self, next: PipelineState) -> Result<(), PipelineError> {
        if !self.can_transition(&next) {
            return Err(PipelineError::InvalidTransition {
                from: self.clone(),
                to: next,
            });
        }
        tracing::debug!(from = %self, to = %next, "pipeline state");
        *self = next;
        Ok(())
    }

    /// Moves to `Failed(reason)` unless already terminal.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.is_terminal() {
            *self = PipelineState::Failed(reason.into());
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Initialized => f.write_str("initialized"),
            PipelineState::Resolving => f.write_str("resolving"),
            PipelineState::Building(i) => write!(f, "building({i})"),
            PipelineState::Pruning => f.write_str("pruning"),
            PipelineState::Configuring => f.write_str("configuring"),
            PipelineState::Sealed => f.write_str("sealed"),
            PipelineState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Resolve(#[from] hoist_core::Error),

    #[error(transparent)]
    Plan(#[from] AssembleError),

    #[error("stage {index} ({label}) failed: {kind}", kind = layer_kind(.source))]
    Stage {
        index: usize,
        label: String,
        source: LayerError,
    },

    #[error(transparent)]
    Configure(#[from] ConfigureError),

    #[error("failed to prepare the staging root")]
    Setup(#[source] LayerError),

    #[error("cannot move pipeline from {from} to {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
}

impl PipelineError {
    /// Error kind shown to users, e.g. `PackageInstallError`.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Resolve(hoist_core::Error::UnsupportedPlatform { .. }) => {
                "UnsupportedPlatform"
            }
            PipelineError::Resolve(hoist_core::Error::VersionPinConflict { .. }) => {
                "VersionPinConflict"
            }
            PipelineError::Resolve(_) => "InvalidConfiguration",
            PipelineError::Plan(AssembleError::PruneOverlap { .. }) => "PruneOverlapError",
            PipelineError::Plan(AssembleError::Descriptor(hoist_core::Error::UnsupportedPlatform {
                ..
            })) => "UnsupportedPlatform",
            PipelineError::Plan(_) => "InvalidPlan",
            PipelineError::Stage { source, .. } => layer_kind(source),
            PipelineError::Configure(ConfigureError::MissingOverlayTarget { .. }) => {
                "MissingOverlayTarget"
            }
            PipelineError::Configure(ConfigureError::PrivilegedUser { .. }) => "PrivilegedUser",
            PipelineError::Configure(_) => "ConfigurationError",
            PipelineError::Setup(_) => "BackendError",
            PipelineError::InvalidTransition { .. } => "InvalidTransition",
        }
    }
}

fn layer_kind(error: &LayerError) -> &'static str {
    match error {
        LayerError::PackageInstall { .. } => "PackageInstallError",
        LayerError::CommandExecution { .. } => "CommandExecutionError",
        _ => "StageError",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut state = PipelineState::Initialized;
        for next in [
            PipelineState::Resolving,
            PipelineState::Building(0),
            PipelineState::Building(3),
            PipelineState::Pruning,
            PipelineState::Building(5),
            PipelineState::Configuring,
            PipelineState::Sealed,
        ] {
            state.transition(next).unwrap();
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut sealed = PipelineState::Sealed;
        assert!(sealed.transition(PipelineState::Resolving).is_err());
        sealed.fail("late");
        assert_eq!(sealed, PipelineState::Sealed);

        let mut failed = PipelineState::Failed("boom".to_owned());
        assert!(failed.transition(PipelineState::Configuring).is_err());
        assert!(failed.transition(PipelineState::Failed("again".to_owned())).is_err());
    }

    #[test]
    fn building_index_only_moves_forward() {
        let mut state = PipelineState::Building(2);
        assert!(state.transition(PipelineState::Building(2)).is_err());
        assert!(state.transition(PipelineState::Building(1)).is_err());
    }

    #[test]
    fn skipping_resolution_is_rejected() {
        let mut state = PipelineState::Initialized;
        let err = state.transition(PipelineState::Building(0)).unwrap_err();
        assert_eq!(err.kind(), "InvalidTransition");
        assert_eq!(
            err.to_string(),
            "cannot move pipeline from initialized to building(0)"
        );
    }

    #[test]
    fn any_live_state_can_fail() {
        let mut state = PipelineState::Building(4);
        state.fail("stage 4 failed");
        assert_eq!(state, PipelineState::Failed("stage 4 failed".to_owned()));
    }
}
