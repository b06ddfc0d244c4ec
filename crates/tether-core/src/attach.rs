//! Process-wide attach lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Phase of the attach machinery inside one target process.
///
/// ```text
/// Uninitialized ──▶ Hooked ◀──▶ Sessioned
///                     │             │
///                     └──────┬──────┘
///                            ▼
///                       Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachPhase {
    /// No hook installed yet.
    #[default]
    Uninitialized,
    /// Hook installed, no controller bound.
    Hooked,
    /// Hook installed and one session bound.
    Sessioned,
    /// Target is going away with its process.
    Terminated,
}

impl AttachPhase {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Hooked => "hooked",
            Self::Sessioned => "sessioned",
            Self::Terminated => "terminated",
        }
    }

    #[must_use]
    pub fn can_transition_to(&self, next: AttachPhase) -> bool {
        use AttachPhase::*;
        matches!(
            (self, next),
            (Uninitialized, Hooked)
                | (Hooked, Hooked)
                | (Hooked, Sessioned)
                | (Sessioned, Hooked)
                | (Uninitialized, Terminated)
                | (Hooked, Terminated)
                | (Sessioned, Terminated)
        )
    }

    pub fn transition(&mut self, next: AttachPhase) -> Result<(), DomainError> {
        if !self.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.label().to_string(),
                to: next.label().to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// True once a hook has been installed and the process is alive.
    #[must_use]
    pub fn is_hooked(&self) -> bool {
        matches!(self, Self::Hooked | Self::Sessioned)
    }
}

impl fmt::Display for AttachPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut phase = AttachPhase::default();
        phase.transition(AttachPhase::Hooked).unwrap();
        phase.transition(AttachPhase::Sessioned).unwrap();
        phase.transition(AttachPhase::Hooked).unwrap();
        phase.transition(AttachPhase::Sessioned).unwrap();
        phase.transition(AttachPhase::Terminated).unwrap();
        assert!(!phase.is_hooked());
    }

    #[test]
    fn test_no_double_session() {
        let mut phase = AttachPhase::Sessioned;
        assert!(phase.transition(AttachPhase::Sessioned).is_err());
    }

    #[test]
    fn test_terminated_is_final() {
        let mut phase = AttachPhase::Terminated;
        assert!(phase.transition(AttachPhase::Hooked).is_err());
    }

    #[test]
    fn test_session_needs_hook() {
        assert!(!AttachPhase::Uninitialized.can_transition_to(AttachPhase::Sessioned));
    }
}
