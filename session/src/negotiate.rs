//! Settings negotiation: what a peer may change and how requests are
//! judged.

use std::time::Duration;

use tether_wire::{HeartbeatMode, NegotiateRequest, SupportedRanges};

/// A requested settings change. Fields left `None` keep their current
/// value; an empty change is valid and always approved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsChange {
    /// Requested heartbeat mode
    pub heartbeat_mode: Option<HeartbeatMode>,
    /// Requested heartbeat interval
    pub heartbeat_interval: Option<Duration>,
}

impl SettingsChange {
    pub(crate) fn into_request(self, id: String) -> NegotiateRequest {
        NegotiateRequest {
            id,
            heartbeat_mode: self.heartbeat_mode,
            heartbeat_interval: self.heartbeat_interval.map(|d| d.as_secs_f64()),
        }
    }
}

/// Bounds on what a peer is allowed to negotiate.
#[derive(Debug, Clone, PartialEq)]
pub struct SupportedOptions {
    /// Heartbeat modes that may be requested
    pub heartbeat_modes: Vec<HeartbeatMode>,
    /// Smallest acceptable heartbeat interval
    pub min_interval: Duration,
    /// Largest acceptable heartbeat interval
    pub max_interval: Duration,
}

impl Default for SupportedOptions {
    fn default() -> Self {
        Self {
            heartbeat_modes: vec![HeartbeatMode::Roundtrip],
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(60),
        }
    }
}

impl SupportedOptions {
    /// Judge a requested change against these bounds.
    pub fn evaluate(&self, request: &NegotiateRequest) -> bool {
        if let Some(mode) = request.heartbeat_mode {
            if !self.heartbeat_modes.contains(&mode) {
                return false;
            }
        }
        if let Some(seconds) = request.heartbeat_interval {
            let Ok(interval) = Duration::try_from_secs_f64(seconds) else {
                return false;
            };
            if interval < self.min_interval || interval > self.max_interval {
                return false;
            }
        }
        true
    }

    /// Wire form, with intervals as seconds.
    pub fn to_ranges(&self) -> SupportedRanges {
        SupportedRanges {
            heartbeat_modes: self.heartbeat_modes.clone(),
            min_heartbeat_interval: self.min_interval.as_secs_f64(),
            max_heartbeat_interval: self.max_interval.as_secs_f64(),
        }
    }

    /// Parse the wire form. Out-of-range interval numbers collapse to zero
    /// rather than failing, since the values are advisory.
    pub fn from_ranges(ranges: SupportedRanges) -> Self {
        Self {
            heartbeat_modes: ranges.heartbeat_modes,
            min_interval: Duration::try_from_secs_f64(ranges.min_heartbeat_interval)
                .unwrap_or(Duration::ZERO),
            max_interval: Duration::try_from_secs_f64(ranges.max_heartbeat_interval)
                .unwrap_or(Duration::ZERO),
        }
    }
}

/// What a negotiation call resolves to once the peer answered.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationOutcome {
    /// Whether the peer applied the change
    pub approved: bool,
    /// The peer's advertised bounds, when it sent them
    pub supported: Option<SupportedOptions>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        mode: Option<HeartbeatMode>,
        interval: Option<f64>,
    ) -> NegotiateRequest {
        NegotiateRequest {
            id: "1".to_string(),
            heartbeat_mode: mode,
            heartbeat_interval: interval,
        }
    }

    #[test]
    fn test_change_within_bounds_approved() {
        let options = SupportedOptions::default();
        assert!(options.evaluate(&request(Some(HeartbeatMode::Roundtrip), Some(1.0))));
    }

    #[test]
    fn test_empty_change_approved() {
        assert!(SupportedOptions::default().evaluate(&request(None, None)));
    }

    #[test]
    fn test_interval_above_max_rejected() {
        let options = SupportedOptions {
            max_interval: Duration::from_secs(3),
            ..SupportedOptions::default()
        };
        assert!(!options.evaluate(&request(None, Some(5.0))));
    }

    #[test]
    fn test_interval_below_min_rejected() {
        assert!(!SupportedOptions::default().evaluate(&request(None, Some(0.05))));
    }

    #[test]
    fn test_unsupported_mode_rejected() {
        assert!(!SupportedOptions::default().evaluate(&request(Some(HeartbeatMode::Upstream), None)));
    }

    #[test]
    fn test_pathological_interval_numbers_rejected() {
        let options = SupportedOptions::default();
        assert!(!options.evaluate(&request(None, Some(f64::NAN))));
        assert!(!options.evaluate(&request(None, Some(f64::INFINITY))));
        assert!(!options.evaluate(&request(None, Some(-1.0))));
    }

    #[test]
    fn test_ranges_round_trip() {
        let options = SupportedOptions {
            heartbeat_modes: vec![HeartbeatMode::Roundtrip, HeartbeatMode::Upstream],
            min_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(30),
        };
        assert_eq!(SupportedOptions::from_ranges(options.to_ranges()), options);
    }
}
