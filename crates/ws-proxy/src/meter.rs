use std::time::Duration;

use cash_register::Metering;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

/// Payload size of a forwarded frame in bytes.
pub fn frame_size(message: &Message) -> u64 {
    message.len() as u64
}

/// Bytes bought by `amount` at `price` per KiB.
pub fn bytes_for(amount: u64, price: u64) -> u64 {
    if price == 0 {
        return 0;
    }
    amount.saturating_mul(1024) / price
}

/// Connection time bought by `amount` at `price` per minute.
pub fn time_for(amount: u64, price: u64) -> Duration {
    if price == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(amount.saturating_mul(60) / price)
}

/// Byte counters and a prepaid byte budget for one connection.
///
/// A frame is admitted only if it fits in what remains. A frame that uses
/// the budget up exactly is admitted; after that the meter stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficMeter {
    upstream: u64,
    downstream: u64,
    remaining: u64,
}

impl TrafficMeter {
    pub fn with_allowance(bytes: u64) -> Self {
        Self {
            remaining: bytes,
            ..Self::default()
        }
    }

    pub fn top_up(&mut self, bytes: u64) {
        self.remaining = self.remaining.saturating_add(bytes);
    }

    /// Client to upstream. Returns whether the frame may be forwarded.
    pub fn measure_upstream(&mut self, message: &Message) -> bool {
        let Some(size) = self.admit(frame_size(message)) else {
            return false;
        };
        self.upstream += size;
        tracing::trace!(size, up = self.upstream, down = self.downstream, "upstream frame metered");
        true
    }

    /// Upstream to client. Returns whether the frame may be forwarded.
    pub fn measure_downstream(&mut self, message: &Message) -> bool {
        let Some(size) = self.admit(frame_size(message)) else {
            return false;
        };
        self.downstream += size;
        tracing::trace!(size, up = self.upstream, down = self.downstream, "downstream frame metered");
        true
    }

    fn admit(&mut self, size: u64) -> Option<u64> {
        if !self.meter_is_running() || size > self.remaining {
            return None;
        }
        self.remaining -= size;
        Some(size)
    }

    pub fn meter_is_running(&self) -> bool {
        self.remaining > 0
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn upstream_total(&self) -> u64 {
        self.upstream
    }

    pub fn downstream_total(&self) -> u64 {
        self.downstream
    }

    /// Bytes forwarded in both directions.
    pub fn total(&self) -> u64 {
        self.upstream + self.downstream
    }
}

/// What a connection may still consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allowance {
    /// Static upstream or free mode.
    Unmetered,
    Bytes(TrafficMeter),
    /// Paid by the minute; the connection ends at this instant.
    Until(Instant),
}

impl Allowance {
    /// Add `amount` worth of allowance to `current`. Paid credit replaces an
    /// unmetered or differently-metered allowance, and extends a matching
    /// one.
    pub fn credit(current: Option<Allowance>, amount: u64, price: u64, metering: Metering) -> Allowance {
        match (metering, current) {
            (Metering::PerKib, Some(Allowance::Bytes(mut meter))) => {
                meter.top_up(bytes_for(amount, price));
                Allowance::Bytes(meter)
            }
            (Metering::PerKib, _) => Allowance::Bytes(TrafficMeter::with_allowance(bytes_for(amount, price))),
            (Metering::PerMinute, Some(Allowance::Until(deadline))) if deadline > Instant::now() => {
                Allowance::Until(deadline + time_for(amount, price))
            }
            (Metering::PerMinute, _) => Allowance::Until(Instant::now() + time_for(amount, price)),
        }
    }

    /// Whether anything bought is left. Unmetered does not count as paid.
    pub fn is_paid_and_live(&self) -> bool {
        match self {
            Allowance::Unmetered => false,
            Allowance::Bytes(meter) => meter.meter_is_running(),
            Allowance::Until(deadline) => *deadline > Instant::now(),
        }
    }

    pub fn admit_upstream(&mut self, message: &Message) -> bool {
        match self {
            Allowance::Unmetered => true,
            Allowance::Bytes(meter) => meter.measure_upstream(message),
            Allowance::Until(deadline) => *deadline > Instant::now(),
        }
    }

    pub fn admit_downstream(&mut self, message: &Message) -> bool {
        match self {
            Allowance::Unmetered => true,
            Allowance::Bytes(meter) => meter.measure_downstream(message),
            Allowance::Until(deadline) => *deadline > Instant::now(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Allowance::Until(deadline) => Some(*deadline),
            _ => None,
        }
    }

    pub fn meter(&self) -> Option<&TrafficMeter> {
        match self {
            Allowance::Bytes(meter) => Some(meter),
            _ => None,
        }
    }
}
