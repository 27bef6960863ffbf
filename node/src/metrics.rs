//! Lightweight metrics helpers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub fn rate_per_sec(count: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(count as f64 / secs)
    } else {
        None
    }
}

#[derive(Debug, Default)]
pub struct Meter {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl Meter {
    pub fn mark(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Inbound and outbound protocol traffic.
#[derive(Debug, Default)]
pub struct TrafficMeters {
    pub ingress: Meter,
    pub egress: Meter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSnapshot {
    pub in_packets: u64,
    pub in_bytes: u64,
    pub out_packets: u64,
    pub out_bytes: u64,
}

impl TrafficMeters {
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            in_packets: self.ingress.packets(),
            in_bytes: self.ingress.bytes(),
            out_packets: self.egress.packets(),
            out_bytes: self.egress.bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_per_sec_handles_zero_duration() {
        assert_eq!(rate_per_sec(10, Duration::from_secs(0)), None);
        let rate = rate_per_sec(10, Duration::from_secs(2)).expect("rate");
        assert!((rate - 5.0).abs() < 1e-6);
    }

    #[test]
    fn meters_accumulate() {
        let meters = TrafficMeters::default();
        meters.egress.mark(10);
        meters.egress.mark(5);
        meters.ingress.mark(100);
        assert_eq!(
            meters.snapshot(),
            TrafficSnapshot {
                in_packets: 1,
                in_bytes: 100,
                out_packets: 2,
                out_bytes: 15,
            }
        );
    }
}
