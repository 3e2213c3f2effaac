//! Channel-Hop Policy: picks a hopping schedule that favors coverage
//! while the drone moves fast and dwell time while it's near-stationary.

use anyhow::Result;
use log::{info, warn};
use std::sync::Mutex;

pub const CHANNELS_2GHZ: &[u32] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
pub const CHANNELS_5GHZ: &[u32] = &[
    36, 40, 44, 48, 52, 56, 60, 64, 100, 104, 108, 112, 116, 120, 124, 128, 132, 136, 140, 144,
    149, 153, 157, 161, 165,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopMode {
    Fast,
    Slow,
    Adaptive,
    Lock,
}

impl HopMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Some(HopMode::Fast),
            "slow" => Some(HopMode::Slow),
            "adaptive" => Some(HopMode::Adaptive),
            "lock" => Some(HopMode::Lock),
            _ => None,
        }
    }
}

/// Implemented by whatever drives the radio — the Upstream Poller's REST
/// client in production, a no-op stub in tests.
pub trait HopControl {
    fn set_hop_channels(&self, source_id: &str, channels: &[u32], rate: f64) -> Result<()>;
    fn set_channel(&self, source_id: &str, channel: u32) -> Result<()>;
    fn disable_hop(&self, source_id: &str) -> Result<()>;
}

struct State {
    mode: HopMode,
    active_source: Option<String>,
    locked_channel: Option<u32>,
    current_rate: f64,
}

pub struct ChannelHopPolicy {
    fast_rate: f64,
    slow_rate: f64,
    state: Mutex<State>,
}

impl ChannelHopPolicy {
    pub fn new(default_mode: &str, fast_rate: f64, slow_rate: f64) -> Self {
        let mode = HopMode::parse(default_mode).unwrap_or(HopMode::Adaptive);
        ChannelHopPolicy {
            fast_rate,
            slow_rate,
            state: Mutex::new(State {
                mode,
                active_source: None,
                locked_channel: None,
                current_rate: slow_rate,
            }),
        }
    }

    pub fn mode(&self) -> HopMode {
        self.state.lock().unwrap().mode
    }

    /// Rejects an unrecognized mode string, leaving state unchanged.
    pub fn set_mode(&self, mode: &str) -> bool {
        match HopMode::parse(mode) {
            Some(m) => {
                self.state.lock().unwrap().mode = m;
                true
            }
            None => {
                warn!("rejected invalid channel-hop mode: {mode}");
                false
            }
        }
    }

    pub fn set_active_source(&self, source_id: &str) {
        self.state.lock().unwrap().active_source = Some(source_id.to_string());
    }

    /// Forces lock mode on the given channel.
    pub fn lock_channel(&self, channel: u32) {
        let mut state = self.state.lock().unwrap();
        state.mode = HopMode::Lock;
        state.locked_channel = Some(channel);
    }

    /// Linear interpolation between `slow_rate` (≤2 m/s) and `fast_rate`
    /// (≥10 m/s); called by `tick()` when in adaptive mode.
    pub fn adaptive_rate(&self, speed_m_s: f64) -> f64 {
        if speed_m_s <= 2.0 {
            self.slow_rate
        } else if speed_m_s >= 10.0 {
            self.fast_rate
        } else {
            self.slow_rate + (speed_m_s - 2.0) / 8.0 * (self.fast_rate - self.slow_rate)
        }
    }

    /// Called periodically by the Orchestrator; applies the current
    /// mode's channel set/rate through `control` when a source is bound.
    pub fn tick(&self, speed_m_s: f64, control: &dyn HopControl) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(source_id) = state.active_source.clone() else {
            return Ok(());
        };

        match state.mode {
            HopMode::Lock => {
                if let Some(ch) = state.locked_channel {
                    control.set_channel(&source_id, ch)?;
                }
            }
            HopMode::Fast => {
                state.current_rate = self.fast_rate;
                control.set_hop_channels(&source_id, &all_channels(), self.fast_rate)?;
            }
            HopMode::Slow => {
                state.current_rate = self.slow_rate;
                control.set_hop_channels(&source_id, &all_channels(), self.slow_rate)?;
            }
            HopMode::Adaptive => {
                let rate = self.adaptive_rate(speed_m_s);
                state.current_rate = rate;
                control.set_hop_channels(&source_id, &all_channels(), rate)?;
            }
        }

        Ok(())
    }

    pub fn current_rate(&self) -> f64 {
        self.state.lock().unwrap().current_rate
    }
}

pub fn all_channels() -> Vec<u32> {
    let mut channels: Vec<u32> = CHANNELS_2GHZ.to_vec();
    channels.extend_from_slice(CHANNELS_5GHZ);
    channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingControl {
        calls: AtomicUsize,
    }

    impl HopControl for CountingControl {
        fn set_hop_channels(&self, _source_id: &str, _channels: &[u32], _rate: f64) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn set_channel(&self, _source_id: &str, _channel: u32) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn disable_hop(&self, _source_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn channel_sets_are_exact() {
        assert_eq!(CHANNELS_2GHZ, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(CHANNELS_5GHZ.len(), 25);
        assert_eq!(CHANNELS_5GHZ[0], 36);
        assert_eq!(*CHANNELS_5GHZ.last().unwrap(), 165);
    }

    #[test]
    fn invalid_mode_rejected_leaves_state() {
        let policy = ChannelHopPolicy::new("adaptive", 5.0, 1.0);
        assert!(!policy.set_mode("warp-speed"));
        assert_eq!(policy.mode(), HopMode::Adaptive);
    }

    #[test]
    fn adaptive_rate_interpolates_linearly() {
        let policy = ChannelHopPolicy::new("adaptive", 5.0, 1.0);
        assert_eq!(policy.adaptive_rate(0.0), 1.0);
        assert_eq!(policy.adaptive_rate(2.0), 1.0);
        assert_eq!(policy.adaptive_rate(10.0), 5.0);
        assert_eq!(policy.adaptive_rate(20.0), 5.0);
        assert_eq!(policy.adaptive_rate(6.0), 1.0 + (6.0 - 2.0) / 8.0 * (5.0 - 1.0));
    }

    #[test]
    fn lock_channel_forces_lock_mode() {
        let policy = ChannelHopPolicy::new("fast", 5.0, 1.0);
        policy.lock_channel(6);
        assert_eq!(policy.mode(), HopMode::Lock);
    }

    #[test]
    fn tick_without_active_source_is_a_no_op() {
        let policy = ChannelHopPolicy::new("fast", 5.0, 1.0);
        let control = CountingControl { calls: AtomicUsize::new(0) };
        policy.tick(5.0, &control).unwrap();
        assert_eq!(control.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tick_with_active_source_invokes_control() {
        let policy = ChannelHopPolicy::new("fast", 5.0, 1.0);
        policy.set_active_source("src-1");
        let control = CountingControl { calls: AtomicUsize::new(0) };
        policy.tick(5.0, &control).unwrap();
        assert_eq!(control.calls.load(Ordering::SeqCst), 1);
    }
}
