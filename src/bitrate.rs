//! Adaptive video bitrate controller
//!
//! Once per second the network sender reports queue depth, throughput and
//! drops; the controller moves the video target bitrate inside the configured
//! [min, max] envelope. Congestion backs off immediately; recovery probes up
//! only after a run of healthy ticks.

use crate::config::StreamConfig;
use crate::events::NetStateCode;

/// Multiplicative step down under congestion
const DOWN_FACTOR: f64 = 0.75;
/// Multiplicative step up while probing
const UP_FACTOR: f64 = 1.125;
/// Healthy ticks required before probing upward
const HEALTHY_TICKS_BEFORE_RAISE: u32 = 5;
/// Queue depth (packets) considered congested
const CONGESTED_QUEUE_DEPTH: usize = 16;

/// One second of sender observations
#[derive(Debug, Clone, Copy, Default)]
pub struct SenderFeedback {
    /// Outbound packets waiting in the send queue at tick time
    pub queue_depth: usize,
    /// Bytes handed to the socket during the tick
    pub bytes_sent: u64,
    /// Video frames dropped during the tick
    pub dropped_frames: u64,
}

/// Result of a controller tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateDecision {
    /// New video target, kbit/s
    pub target_kbps: u32,
    /// Event to surface, if the target moved
    pub event: Option<NetStateCode>,
}

pub struct BitrateController {
    min_kbps: u32,
    max_kbps: u32,
    target_kbps: u32,
    enabled: bool,
    healthy_ticks: u32,
}

impl BitrateController {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            min_kbps: config.video_min_bitrate,
            max_kbps: config.video_max_bitrate,
            target_kbps: config.clamped_init_bitrate(),
            enabled: config.auto_adjust_bitrate,
            healthy_ticks: 0,
        }
    }

    /// Current video target, kbit/s
    pub fn target_kbps(&self) -> u32 {
        self.target_kbps
    }

    /// Process one second of sender feedback
    ///
    /// When auto-adjust is disabled the target never moves and no events are
    /// produced.
    pub fn on_tick(&mut self, feedback: SenderFeedback) -> BitrateDecision {
        if !self.enabled {
            return BitrateDecision { target_kbps: self.target_kbps, event: None };
        }

        let congested =
            feedback.dropped_frames > 0 || feedback.queue_depth >= CONGESTED_QUEUE_DEPTH;

        if congested {
            self.healthy_ticks = 0;
            let next = ((self.target_kbps as f64 * DOWN_FACTOR) as u32).max(self.min_kbps);
            if next < self.target_kbps {
                log::info!(
                    "bitrate down {} -> {} kbps (queue {}, dropped {})",
                    self.target_kbps,
                    next,
                    feedback.queue_depth,
                    feedback.dropped_frames
                );
                self.target_kbps = next;
                return BitrateDecision {
                    target_kbps: next,
                    event: Some(NetStateCode::EstimatedBandwidthDrop),
                };
            }
            // Already pinned to the floor; nothing to surface.
            return BitrateDecision { target_kbps: self.target_kbps, event: None };
        }

        self.healthy_ticks += 1;
        if self.healthy_ticks >= HEALTHY_TICKS_BEFORE_RAISE && self.target_kbps < self.max_kbps {
            self.healthy_ticks = 0;
            let next = ((self.target_kbps as f64 * UP_FACTOR) as u32).min(self.max_kbps);
            log::info!("bitrate up {} -> {} kbps", self.target_kbps, next);
            self.target_kbps = next;
            return BitrateDecision {
                target_kbps: next,
                event: Some(NetStateCode::EstimatedBandwidthRaise),
            };
        }

        BitrateDecision { target_kbps: self.target_kbps, event: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(enabled: bool) -> BitrateController {
        let mut config = StreamConfig::default(); // min 200, init 600, max 800
        config.auto_adjust_bitrate = enabled;
        BitrateController::new(&config)
    }

    fn healthy() -> SenderFeedback {
        SenderFeedback { queue_depth: 0, bytes_sent: 100_000, dropped_frames: 0 }
    }

    fn congested() -> SenderFeedback {
        SenderFeedback { queue_depth: 32, bytes_sent: 10_000, dropped_frames: 3 }
    }

    #[test]
    fn test_disabled_controller_is_inert() {
        let mut c = controller(false);
        for _ in 0..20 {
            let decision = c.on_tick(congested());
            assert_eq!(decision.target_kbps, 600);
            assert!(decision.event.is_none());
        }
    }

    #[test]
    fn test_congestion_steps_down() {
        let mut c = controller(true);
        let decision = c.on_tick(congested());
        assert_eq!(decision.target_kbps, 450);
        assert_eq!(decision.event, Some(NetStateCode::EstimatedBandwidthDrop));
    }

    #[test]
    fn test_never_below_floor() {
        let mut c = controller(true);
        for _ in 0..50 {
            c.on_tick(congested());
        }
        assert_eq!(c.target_kbps(), 200);
        // Pinned at the floor, no further drop events.
        let decision = c.on_tick(congested());
        assert!(decision.event.is_none());
    }

    #[test]
    fn test_raise_requires_healthy_run() {
        let mut c = controller(true);
        c.on_tick(congested()); // 450
        for _ in 0..4 {
            assert!(c.on_tick(healthy()).event.is_none());
        }
        let decision = c.on_tick(healthy());
        assert_eq!(decision.event, Some(NetStateCode::EstimatedBandwidthRaise));
        assert!(decision.target_kbps > 450);
    }

    #[test]
    fn test_congestion_resets_healthy_run() {
        let mut c = controller(true);
        c.on_tick(congested()); // 450
        for _ in 0..4 {
            c.on_tick(healthy());
        }
        c.on_tick(congested()); // reset counter, down again
        for _ in 0..4 {
            assert!(c.on_tick(healthy()).event.is_none());
        }
    }

    #[test]
    fn test_never_above_ceiling() {
        let mut c = controller(true);
        for _ in 0..200 {
            c.on_tick(healthy());
        }
        assert!(c.target_kbps() <= 800);
        assert_eq!(c.target_kbps(), 800);
    }
}
