use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use derivative::Derivative;
use enclose::enc;
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::AdaptiveConfig,
    error::{BitrateErrorKind, Error},
};

use super::{
    ramp::{initial_ramp, transition, Ramp},
    stats::LossSampler,
    BitrateSink, StatsSource,
};

/// A change the control loop decided on, carrying the new cap in bps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    StepDown(u64),
    StepUp(u64),
}

impl Adjustment {
    pub fn bitrate(&self) -> u64 {
        match self {
            Adjustment::StepDown(bitrate) | Adjustment::StepUp(bitrate) => *bitrate,
        }
    }
}

fn stale_target() -> Error {
    Error::new_bitrate(
        "target bitrate is zero, holding current cap".to_string(),
        BitrateErrorKind::StaleTargetError,
    )
}

/// Send-side bitrate cap of one transmission: slow increase, fast decrease, bounded by the
/// target the server allocated and a floor derived from it.
#[derive(Debug, Clone)]
pub struct BitrateState {
    config: AdaptiveConfig,
    target: u64,
    floor: u64,
    current_cap: u64,
    loss_since: Option<Instant>,
    last_change: Instant,
    active: bool,
    ramping: bool,
}

impl BitrateState {
    pub fn new(target: u64, config: AdaptiveConfig, now: Instant) -> Self {
        Self {
            floor: target * config.floor_percent / 100,
            config,
            target,
            current_cap: target,
            loss_since: None,
            last_change: now,
            active: false,
            ramping: false,
        }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn current_cap(&self) -> u64 {
        self.current_cap
    }

    pub fn is_ramping(&self) -> bool {
        self.ramping
    }

    /// Marks the transmission active and returns the initial ramp.
    pub fn start(&mut self) -> Result<Vec<u64>, Error> {
        if self.target == 0 {
            return Err(stale_target());
        }
        self.active = true;
        self.ramping = true;
        Ok(initial_ramp(self.target, &self.config.initial_ramp_percents))
    }

    /// Adopts a new authoritative target and returns the transition towards it. Before the
    /// transmission starts the cap simply follows the target and no steps are returned.
    pub fn retarget(&mut self, target: u64, now: Instant) -> Result<Vec<u64>, Error> {
        if target == 0 {
            return Err(stale_target());
        }
        self.target = target;
        self.floor = target * self.config.floor_percent / 100;
        self.last_change = now;
        if !self.active {
            self.current_cap = target;
            return Ok(Vec::new());
        }
        self.ramping = true;
        Ok(transition(
            self.current_cap,
            target,
            self.config.transition_steps,
        ))
    }

    pub(crate) fn apply_step(&mut self, cap: u64) {
        self.current_cap = cap;
    }

    pub(crate) fn finish_ramp(&mut self, now: Instant) {
        self.ramping = false;
        self.last_change = now;
    }

    /// One control loop tick. At most one adjustment is returned.
    pub fn on_sample(&mut self, loss_percent: f64, now: Instant) -> Option<Adjustment> {
        if self.target == 0 {
            return None;
        }

        if loss_percent > self.config.loss_threshold_percent {
            let since = *self.loss_since.get_or_insert(now);
            if self.ramping || now.duration_since(since) < self.config.congestion_window() {
                return None;
            }
            let reduced = (self.current_cap * self.config.step_down_percent / 100).max(self.floor);
            self.loss_since = Some(now);
            if reduced >= self.current_cap {
                return None;
            }
            self.current_cap = reduced;
            self.last_change = now;
            return Some(Adjustment::StepDown(reduced));
        }

        self.loss_since = None;
        if self.ramping
            || self.current_cap >= self.target
            || now.duration_since(self.last_change) < self.config.recovery_interval()
        {
            return None;
        }
        let raised = (self.current_cap * self.config.step_up_percent / 100).min(self.target);
        self.current_cap = raised;
        self.last_change = now;
        Some(Adjustment::StepUp(raised))
    }
}

/// Drives a [`BitrateState`] for one sender: ramps run as tasks, a monitor polls transport
/// statistics every `statsIntervalMs`. Dropping the controller stops all of them.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BitrateController {
    config: AdaptiveConfig,
    state: Arc<Mutex<BitrateState>>,
    #[derivative(Debug = "ignore")]
    sink: Arc<dyn BitrateSink>,
    ramp: Mutex<Option<CancellationToken>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl BitrateController {
    pub fn new(target: u64, config: AdaptiveConfig, sink: Arc<dyn BitrateSink>) -> Self {
        let state = BitrateState::new(target, config.clone(), Instant::now());
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
            sink,
            ramp: Mutex::new(None),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Begins the initial ramp and the monitor loop.
    pub async fn start(&self, stats: Arc<dyn StatsSource>) -> Result<(), Error> {
        self.config.validate()?;
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("bitrate controller already started");
            return Ok(());
        }

        let mut slot = self.ramp.lock().await;
        let steps = match self.state.lock().await.start() {
            Ok(steps) => steps,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        tracing::info!("starting transmission, ramping to {:?}", steps.last());
        *slot = Some(self.spawn_ramp(Ramp {
            steps,
            interval: self.config.initial_ramp_interval(),
        }));

        let interval = self.config.stats_interval();
        let token = self.cancel.child_token();
        let (state, sink) = (&self.state, &self.sink);
        tokio::spawn(enc!((state, sink) async move {
            let mut sampler = LossSampler::new();
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("bitrate monitor stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let counters = match stats.transport_counters().await {
                    Ok(counters) => counters,
                    Err(err) => {
                        tracing::warn!("failed to read transport stats: {}", err);
                        continue;
                    }
                };
                let loss = sampler.sample(counters);
                let mut state = state.lock().await;
                match state.on_sample(loss, Instant::now()) {
                    Some(Adjustment::StepDown(cap)) => {
                        tracing::warn!(
                            "network congestion ({:.1}% loss), reducing bitrate to {:.2} Mbps",
                            loss,
                            cap as f64 / 1_000_000.0
                        );
                        if let Err(err) = sink.apply_bitrate_cap(cap).await {
                            tracing::error!("failed to apply bitrate cap {}: {}", cap, err);
                        }
                    }
                    Some(Adjustment::StepUp(cap)) => {
                        tracing::info!(
                            "network stable, increasing bitrate to {:.2} Mbps (target {:.2} Mbps)",
                            cap as f64 / 1_000_000.0,
                            state.target() as f64 / 1_000_000.0
                        );
                        if let Err(err) = sink.apply_bitrate_cap(cap).await {
                            tracing::error!("failed to apply bitrate cap {}: {}", cap, err);
                        }
                    }
                    None => {}
                }
            }
        }));
        Ok(())
    }

    /// Applies a server reallocation. A zero target is refused and the cap holds.
    pub async fn retarget(&self, target: u64) -> Result<(), Error> {
        let mut slot = self.ramp.lock().await;
        let mut state = self.state.lock().await;
        let steps = state.retarget(target, Instant::now())?;
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        if steps.is_empty() {
            return Ok(());
        }
        tracing::info!(
            "adjusting bitrate {:.2} -> {:.2} Mbps",
            state.current_cap() as f64 / 1_000_000.0,
            target as f64 / 1_000_000.0
        );
        drop(state);
        *slot = Some(self.spawn_ramp(Ramp {
            steps,
            interval: self.config.transition_interval(),
        }));
        Ok(())
    }

    fn spawn_ramp(&self, ramp: Ramp) -> CancellationToken {
        let token = self.cancel.child_token();
        tokio::spawn(ramp.run(self.state.clone(), self.sink.clone(), token.clone()));
        token
    }

    pub async fn current_cap(&self) -> u64 {
        self.state.lock().await.current_cap()
    }

    pub async fn target(&self) -> u64 {
        self.state.lock().await.target()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BitrateController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
