//! Pipeline state management

use crate::runtime::StageState;

/// Pipeline state machine
///
/// Represents the current state of a pipeline. Requested transitions are
/// validated against [`PipelineState::can_transition_to`]; `Faulted` is only
/// ever entered by the controller itself when a fatal runtime error arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// No graph, or a graph that was built but never started
    Idle,

    /// Resources allocated, no data flowing
    Ready,

    /// Prerolled, data flow held
    Paused,

    /// Data flowing
    Playing,

    /// A fatal error stopped every stage; only teardown is accepted
    Faulted,
}

impl PipelineState {
    /// Check if a requested transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            // Faulted is never a request target
            (_, Faulted) => false,

            // Teardown is always allowed
            (_, Idle) => true,

            // From Faulted - only teardown
            (Faulted, _) => false,

            // Self-transitions
            (a, b) if a == b => true,

            // From Idle
            (Idle, Ready) => true,

            // From Ready
            (Ready, Paused) => true,
            (Ready, Playing) => true,

            // From Paused
            (Paused, Playing) => true,
            (Paused, Ready) => true,

            // From Playing
            (Playing, Paused) => true,
            (Playing, Ready) => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Ready => "Ready",
            PipelineState::Paused => "Paused",
            PipelineState::Playing => "Playing",
            PipelineState::Faulted => "Faulted",
        }
    }

    /// Check if the pipeline holds runtime resources (ready, paused or playing)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PipelineState::Ready | PipelineState::Paused | PipelineState::Playing
        )
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, PipelineState::Playing)
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, PipelineState::Faulted)
    }

    /// State every stage is driven to while the pipeline is in this state
    pub fn stage_state(&self) -> StageState {
        match self {
            PipelineState::Idle | PipelineState::Faulted => StageState::Null,
            PipelineState::Ready => StageState::Ready,
            PipelineState::Paused => StageState::Paused,
            PipelineState::Playing => StageState::Playing,
        }
    }

    /// Intermediate states a resume walks through to reach `target` from Idle
    pub fn path_from_idle(target: PipelineState) -> &'static [PipelineState] {
        match target {
            PipelineState::Ready => &[PipelineState::Ready],
            PipelineState::Paused => &[PipelineState::Ready, PipelineState::Paused],
            PipelineState::Playing => &[PipelineState::Ready, PipelineState::Playing],
            PipelineState::Idle | PipelineState::Faulted => &[],
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn test_valid_transitions() {
        assert!(Idle.can_transition_to(&Ready));
        assert!(Ready.can_transition_to(&Paused));
        assert!(Ready.can_transition_to(&Playing));
        assert!(Paused.can_transition_to(&Playing));
        assert!(Playing.can_transition_to(&Paused));
        assert!(Playing.can_transition_to(&Ready));
        assert!(Paused.can_transition_to(&Ready));
        assert!(Faulted.can_transition_to(&Idle));
        assert!(Playing.can_transition_to(&Idle));

        // Self-transitions
        assert!(Idle.can_transition_to(&Idle));
        assert!(Playing.can_transition_to(&Playing));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Idle.can_transition_to(&Playing)); // Must go through Ready
        assert!(!Idle.can_transition_to(&Paused));
        assert!(!Faulted.can_transition_to(&Ready));
        assert!(!Faulted.can_transition_to(&Faulted));
        assert!(!Playing.can_transition_to(&Faulted));
    }

    #[test]
    fn test_state_checks() {
        assert!(Playing.is_active());
        assert!(Playing.is_playing());
        assert!(Paused.is_active());
        assert!(!Paused.is_playing());
        assert!(!Idle.is_active());
        assert!(!Faulted.is_active());
        assert!(Faulted.is_faulted());
        assert_eq!(Faulted.stage_state(), StageState::Null);
        assert_eq!(Paused.to_string(), "Paused");
    }

    #[test]
    fn test_resume_paths() {
        for target in [Ready, Paused, Playing] {
            let path = PipelineState::path_from_idle(target);
            assert_eq!(path.last(), Some(&target));
            let mut current = Idle;
            for step in path {
                assert!(current.can_transition_to(step));
                current = *step;
            }
        }
        assert!(PipelineState::path_from_idle(Faulted).is_empty());
    }
}
