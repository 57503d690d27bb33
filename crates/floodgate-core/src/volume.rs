//! Connection-volume watermark state machine.
//!
//! A server tracks how full it is relative to `max_connections` and switches
//! between two coarse states with hysteresis: crossing the high watermark
//! enters `HighWater`, and only draining back to the low watermark returns
//! to `Normal`. Workers read the published state to pick the effective idle
//! bound per connection, so a loaded server sheds idle connections
//! aggressively.
//!
//! The transition function is pure and lives here so it can be tested
//! exhaustively without a server around it.

use std::fmt;

/// Coarse indicator of a server's connection volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionVolumeState {
    /// Below the high watermark (or drained back to the low one).
    #[default]
    Normal,
    /// At or above the high watermark and not yet drained to the low one.
    HighWater,
}

impl fmt::Display for ConnectionVolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::HighWater => f.write_str("highwater"),
        }
    }
}

/// Absolute watermark thresholds derived from server settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    /// Open-connection count at or below which `HighWater` clears.
    pub low: usize,
    /// Open-connection count at or above which `HighWater` sets.
    pub high: usize,
}

impl Watermarks {
    /// Derive thresholds from `max_connections` and the two percentages.
    ///
    /// Percentages are assumed validated (`0 ≤ low ≤ high ≤ 1`); see
    /// [`ServerSettings::validate`](crate::ServerSettings::validate).
    pub fn derive(max_connections: usize, low_pct: f64, high_pct: f64) -> Self {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        #[allow(clippy::cast_sign_loss)]
        let scale = |pct: f64| (pct * max_connections as f64) as usize;
        Self { low: scale(low_pct), high: scale(high_pct) }
    }

    /// The pure transition function.
    ///
    /// Boundaries are asymmetric (`≥ high` to set, `≤ low` to clear) so the
    /// state is sticky anywhere strictly between the marks: a load
    /// oscillating inside the band causes no transitions.
    #[must_use]
    pub fn next_state(
        &self,
        current: ConnectionVolumeState,
        open_connections: usize,
    ) -> ConnectionVolumeState {
        match current {
            ConnectionVolumeState::Normal if open_connections >= self.high => {
                ConnectionVolumeState::HighWater
            },
            ConnectionVolumeState::HighWater if open_connections <= self.low => {
                ConnectionVolumeState::Normal
            },
            unchanged => unchanged,
        }
    }
}
