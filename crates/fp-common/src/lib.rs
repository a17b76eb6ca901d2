//! Pieces shared by every pipeline crate and binary.

pub mod logging;
pub mod signal;

pub use signal::{cancel_on_signal, termination_signal};

/// Collaborator liveness as reported to the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Up,
    Down,
}

impl Liveness {
    pub fn is_up(self) -> bool {
        matches!(self, Liveness::Up)
    }
}

impl From<bool> for Liveness {
    fn from(up: bool) -> Self {
        if up {
            Liveness::Up
        } else {
            Liveness::Down
        }
    }
}
