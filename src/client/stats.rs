/// Cumulative packet counters read from the sending transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCounters {
    pub packets_lost: u64,
    pub packets_received: u64,
}

/// Turns cumulative counters into a loss percentage over the last poll.
#[derive(Debug, Default)]
pub struct LossSampler {
    previous: TransportCounters,
}

impl LossSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loss in percent since the previous sample, 0 when no packets moved.
    pub fn sample(&mut self, counters: TransportCounters) -> f64 {
        // A counter going backwards means the transport was recreated.
        let baseline = if counters.packets_lost < self.previous.packets_lost
            || counters.packets_received < self.previous.packets_received
        {
            TransportCounters::default()
        } else {
            self.previous
        };
        self.previous = counters;

        let lost = counters.packets_lost - baseline.packets_lost;
        let received = counters.packets_received - baseline.packets_received;
        let total = lost + received;
        if total == 0 {
            return 0.0;
        }
        lost as f64 / total as f64 * 100.0
    }
}
