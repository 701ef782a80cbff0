//! Session state of a protocol instance.

use std::fmt;

/// Progress of a session. Ordered: each state implies every earlier one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolState {
    #[default]
    Inactive,
    Active,
    Configured,
    Computed,
}

impl ProtocolState {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// Configuring again from `Configured` or `Computed` lands back in
    /// `Configured`; nothing else moves backwards and `Active` is never
    /// skipped.
    pub fn can_transition_to(self, next: ProtocolState) -> bool {
        use ProtocolState::*;
        matches!(
            (self, next),
            (Inactive, Active)
                | (Active, Configured)
                | (Configured, Configured)
                | (Computed, Configured)
                | (Configured, Computed)
        )
    }

    /// Move to `next`.
    ///
    /// # Panics
    ///
    /// On an illegal transition.
    pub fn advance(&mut self, next: ProtocolState) {
        assert!(
            self.can_transition_to(next),
            "illegal protocol transition {self} -> {next}"
        );
        *self = next;
    }

    /// Guard for requests needing at least `minimum`.
    pub fn require(self, minimum: ProtocolState, message: &str) -> Result<(), String> {
        if self >= minimum {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::Inactive => "inactive",
            ProtocolState::Active => "active",
            ProtocolState::Configured => "configured",
            ProtocolState::Computed => "computed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path() {
        let mut state = ProtocolState::default();
        state.advance(ProtocolState::Active);
        state.advance(ProtocolState::Configured);
        state.advance(ProtocolState::Computed);
        state.advance(ProtocolState::Configured);
        assert_eq!(state, ProtocolState::Configured);
    }

    #[test]
    fn test_illegal_transitions() {
        use ProtocolState::*;
        assert!(!Inactive.can_transition_to(Configured));
        assert!(!Active.can_transition_to(Computed));
        assert!(!Computed.can_transition_to(Computed));
        assert!(!Configured.can_transition_to(Active));
        assert!(!Active.can_transition_to(Inactive));
    }

    #[test]
    #[should_panic(expected = "illegal protocol transition")]
    fn test_skipping_active_panics() {
        let mut state = ProtocolState::Inactive;
        state.advance(ProtocolState::Configured);
    }

    #[test]
    fn test_require() {
        assert!(ProtocolState::Computed
            .require(ProtocolState::Configured, "x")
            .is_ok());
        assert_eq!(
            ProtocolState::Active.require(ProtocolState::Computed, "No build system was generated yet."),
            Err("No build system was generated yet.".to_string())
        );
    }
}
