use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyntheticConfig;
use crate::error::{PipelineError, Result};
use crate::feed::RawCollection;
use crate::models::{FeedMode, Metric, Reading, SequenceId, Subject, SubjectId};
use crate::normalize::{normalize_image, normalize_vital};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedHandle(pub Uuid);

impl FeedHandle {
    pub fn new() -> Self {
        FeedHandle(Uuid::new_v4())
    }
}

impl Default for FeedHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// The whole state tree of one device, as pushed by the feed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceSnapshot {
    pub vitals: Option<RawCollection>,
    pub alerts: Option<RawCollection>,
    pub audio: Option<RawCollection>,
    pub images: Option<RawCollection>,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: SubjectId,
    pub token: SubscriptionToken,
    pub snapshot: Option<DeviceSnapshot>,
}

/// Callback side of a subscription, handed to the push feed.
#[derive(Debug, Clone)]
pub struct SnapshotSink {
    subject: SubjectId,
    token: SubscriptionToken,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl SnapshotSink {
    pub fn new(
        subject: SubjectId,
        token: SubscriptionToken,
        tx: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        Self { subject, token, tx }
    }

    /// Returns false once the receiving pipeline is gone.
    pub fn push(&self, snapshot: Option<DeviceSnapshot>) -> bool {
        self.tx
            .send(Delivery {
                subject: self.subject,
                token: self.token,
                snapshot,
            })
            .is_ok()
    }
}

/// External push source. Reconnects and auth are the implementor's business.
pub trait PushFeed {
    fn subscribe(&mut self, device_id: &str, sink: SnapshotSink) -> FeedHandle;
    fn unsubscribe(&mut self, handle: FeedHandle);
}

/// In-process feed that fans published snapshots out to its subscribers.
#[derive(Debug, Default)]
pub struct LocalFeed {
    subscriptions: HashMap<FeedHandle, (String, SnapshotSink)>,
}

impl LocalFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a snapshot to every subscriber of `device_id`. Returns how many received it.
    pub fn publish(&self, device_id: &str, snapshot: Option<DeviceSnapshot>) -> usize {
        self.subscriptions
            .values()
            .filter(|(device, _)| device == device_id)
            .filter(|(_, sink)| sink.push(snapshot.clone()))
            .count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Sinks for `device_id`, including ones a caller may hold past teardown.
    pub fn sinks(&self, device_id: &str) -> Vec<SnapshotSink> {
        self.subscriptions
            .values()
            .filter(|(device, _)| device == device_id)
            .map(|(_, sink)| sink.clone())
            .collect()
    }
}

impl PushFeed for LocalFeed {
    fn subscribe(&mut self, device_id: &str, sink: SnapshotSink) -> FeedHandle {
        let handle = FeedHandle::new();
        self.subscriptions
            .insert(handle, (device_id.to_string(), sink));
        handle
    }

    fn unsubscribe(&mut self, handle: FeedHandle) {
        self.subscriptions.remove(&handle);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticTick {
    pub readings: Vec<Reading>,
    pub capture: bool,
}

/// Local stand-in for a device: baseline plus bounded uniform jitter.
#[derive(Debug, Clone)]
pub struct SyntheticGenerator {
    heart_rate_baseline: f64,
    spo2_baseline: f64,
    config: SyntheticConfig,
    next_sequence: u64,
}

impl SyntheticGenerator {
    pub fn new(subject: &Subject, config: SyntheticConfig) -> Self {
        Self {
            heart_rate_baseline: subject.baseline(Metric::HeartRate),
            spo2_baseline: subject.baseline(Metric::SpO2),
            config,
            next_sequence: 1,
        }
    }

    fn jitter(&self, metric: Metric) -> f64 {
        match metric {
            Metric::HeartRate => self.config.heart_rate_jitter,
            Metric::SpO2 => self.config.spo2_jitter,
        }
    }

    fn baseline(&self, metric: Metric) -> f64 {
        match metric {
            Metric::HeartRate => self.heart_rate_baseline,
            Metric::SpO2 => self.spo2_baseline,
        }
    }

    /// One reading per metric at `at`, sharing one sequence id.
    fn sample<R: Rng>(&mut self, rng: &mut R, at: DateTime<Utc>) -> Vec<Reading> {
        let sequence_id = SequenceId::Int(self.next_sequence);
        self.next_sequence += 1;
        Metric::ALL
            .iter()
            .map(|metric| {
                let jitter = self.jitter(*metric);
                Reading {
                    sequence_id: sequence_id.clone(),
                    captured_at: at,
                    metric: *metric,
                    value: self.baseline(*metric) + rng.gen_range(-jitter..=jitter),
                }
            })
            .collect()
    }

    pub fn next_tick<R: Rng>(&mut self, rng: &mut R, now: DateTime<Utc>) -> SyntheticTick {
        let readings = self.sample(rng, now);
        let capture = rng.gen_bool(self.config.capture_probability);
        SyntheticTick { readings, capture }
    }

    /// Hourly history followed by a one-second-spaced window ending at `now`.
    pub fn backfill<R: Rng>(&mut self, rng: &mut R, now: DateTime<Utc>) -> Vec<Reading> {
        let history = self.config.history_seed as i64;
        let window = self.config.backfill as i64;
        let window_start = now - Duration::seconds(window.saturating_sub(1).max(0));

        let mut readings = Vec::new();
        for hours_back in (1..=history).rev() {
            readings.extend(self.sample(rng, window_start - Duration::hours(hours_back)));
        }
        for offset in 0..window {
            readings.extend(self.sample(rng, window_start + Duration::seconds(offset)));
        }
        readings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Subscribing,
    Active,
    /// Teardown finishes before `teardown` returns, so `state` reports `Idle` instead.
    TearingDown,
}

#[derive(Debug)]
enum ChannelMode {
    Live {
        handle: FeedHandle,
        known_vitals: HashMap<String, Value>,
        last_image: Option<DateTime<Utc>>,
    },
    Synthetic {
        generator: SyntheticGenerator,
    },
}

#[derive(Debug)]
struct ActiveChannel {
    subject: SubjectId,
    token: SubscriptionToken,
    state: ChannelState,
    mode: ChannelMode,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub token: SubscriptionToken,
    pub mode: FeedMode,
    /// Readings to seed before the first tick; empty for live feeds.
    pub seed: Vec<Reading>,
}

/// What a snapshot changed relative to the previous one on this channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotChanges {
    pub new_readings: Vec<Reading>,
    pub changed_readings: Vec<Reading>,
    /// Samples whose record changed id or lost the metric.
    pub stale_readings: Vec<(Metric, SequenceId)>,
    pub alerts: Option<RawCollection>,
    pub audio: Option<RawCollection>,
    pub capture: bool,
}

pub struct ChannelManager<F, R = StdRng> {
    feed: F,
    rng: R,
    config: SyntheticConfig,
    tx: mpsc::UnboundedSender<Delivery>,
    active: Option<ActiveChannel>,
    next_token: u64,
}

impl<F: PushFeed> ChannelManager<F, StdRng> {
    pub fn seeded(
        feed: F,
        seed: u64,
        config: SyntheticConfig,
        tx: mpsc::UnboundedSender<Delivery>,
    ) -> Result<Self> {
        Self::new(feed, StdRng::seed_from_u64(seed), config, tx)
    }
}

impl<F: PushFeed, R: Rng> ChannelManager<F, R> {
    pub fn new(
        feed: F,
        rng: R,
        config: SyntheticConfig,
        tx: mpsc::UnboundedSender<Delivery>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            feed,
            rng,
            config,
            tx,
            active: None,
            next_token: 0,
        })
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    pub fn state(&self, subject: SubjectId) -> ChannelState {
        match &self.active {
            Some(active) if active.subject == subject => active.state,
            _ => ChannelState::Idle,
        }
    }

    pub fn active_subject(&self) -> Option<SubjectId> {
        self.active.as_ref().map(|active| active.subject)
    }

    fn is_current(&self, subject: SubjectId, token: SubscriptionToken) -> bool {
        matches!(&self.active, Some(active) if active.subject == subject && active.token == token)
    }

    /// Open a channel for `subject`, tearing down whatever was active first.
    pub fn select(&mut self, subject: &Subject, now: DateTime<Utc>) -> Selection {
        self.teardown();

        self.next_token += 1;
        let token = SubscriptionToken(self.next_token);

        match subject.mode {
            FeedMode::LiveFeed => {
                let sink = SnapshotSink::new(subject.id, token, self.tx.clone());
                let handle = self.feed.subscribe(&subject.device_id, sink);
                info!(subject = subject.id, device = %subject.device_id, "subscribed to live feed");
                self.active = Some(ActiveChannel {
                    subject: subject.id,
                    token,
                    state: ChannelState::Subscribing,
                    mode: ChannelMode::Live {
                        handle,
                        known_vitals: HashMap::new(),
                        last_image: None,
                    },
                });
                Selection {
                    token,
                    mode: FeedMode::LiveFeed,
                    seed: Vec::new(),
                }
            }
            FeedMode::Synthetic => {
                let mut generator = SyntheticGenerator::new(subject, self.config.clone());
                let seed = generator.backfill(&mut self.rng, now);
                info!(subject = subject.id, seeded = seed.len(), "started synthetic generator");
                self.active = Some(ActiveChannel {
                    subject: subject.id,
                    token,
                    state: ChannelState::Active,
                    mode: ChannelMode::Synthetic { generator },
                });
                Selection {
                    token,
                    mode: FeedMode::Synthetic,
                    seed,
                }
            }
        }
    }

    /// Close the active channel, if any. Returns the subject that was torn down.
    pub fn teardown(&mut self) -> Option<SubjectId> {
        let active = self.active.take()?;
        debug!(subject = active.subject, "closing channel");
        match active.mode {
            ChannelMode::Live { handle, .. } => {
                self.feed.unsubscribe(handle);
                info!(subject = active.subject, "unsubscribed from live feed");
            }
            ChannelMode::Synthetic { .. } => {
                info!(subject = active.subject, "stopped synthetic generator");
            }
        }
        Some(active.subject)
    }

    /// Check a delivery against the active subscription and diff its vitals.
    pub fn accept(&mut self, delivery: Delivery) -> Result<SnapshotChanges> {
        if !self.is_current(delivery.subject, delivery.token) {
            return Err(PipelineError::ChannelTeardownRace(delivery.subject));
        }
        let Some(active) = self.active.as_mut() else {
            return Err(PipelineError::ChannelTeardownRace(delivery.subject));
        };
        let ChannelMode::Live {
            known_vitals,
            last_image,
            ..
        } = &mut active.mode
        else {
            return Err(PipelineError::ChannelTeardownRace(delivery.subject));
        };

        if active.state == ChannelState::Subscribing {
            active.state = ChannelState::Active;
            debug!(subject = active.subject, "first delivery received");
        }

        let Some(snapshot) = delivery.snapshot else {
            return Ok(SnapshotChanges::default());
        };

        let mut changes = SnapshotChanges {
            alerts: snapshot.alerts,
            audio: snapshot.audio,
            ..SnapshotChanges::default()
        };

        for (key, raw) in snapshot.vitals.unwrap_or_default() {
            let previous = match known_vitals.get(&key) {
                None => None,
                Some(previous) if previous == &raw => continue,
                Some(previous) => Some(previous.clone()),
            };
            for metric in Metric::ALL {
                let stale = previous
                    .as_ref()
                    .and_then(|previous| normalize_vital(&key, previous, metric).ok())
                    .map(|reading| reading.sequence_id);
                match normalize_vital(&key, &raw, metric) {
                    Ok(reading) => {
                        if let Some(old) = stale.filter(|old| old != &reading.sequence_id) {
                            changes.stale_readings.push((metric, old));
                        }
                        if previous.is_some() {
                            changes.changed_readings.push(reading);
                        } else {
                            changes.new_readings.push(reading);
                        }
                    }
                    Err(err) => {
                        if let Some(old) = stale {
                            changes.stale_readings.push((metric, old));
                        }
                        warn!(subject = active.subject, %err, "skipping vital");
                    }
                }
            }
            known_vitals.insert(key, raw);
        }

        let newest_image = snapshot
            .images
            .iter()
            .flatten()
            .filter_map(|(key, raw)| normalize_image(key, raw).ok())
            .max();
        if let Some(newest) = newest_image {
            if last_image.map_or(true, |seen| newest > seen) {
                *last_image = Some(newest);
                changes.capture = true;
            }
        }

        Ok(changes)
    }

    /// Produce the next synthetic tick for the active subscription.
    pub fn tick(
        &mut self,
        subject: SubjectId,
        token: SubscriptionToken,
        now: DateTime<Utc>,
    ) -> Result<SyntheticTick> {
        if !self.is_current(subject, token) {
            return Err(PipelineError::ChannelTeardownRace(subject));
        }
        match self.active.as_mut().map(|active| &mut active.mode) {
            Some(ChannelMode::Synthetic { generator }) => Ok(generator.next_tick(&mut self.rng, now)),
            _ => Err(PipelineError::ChannelTeardownRace(subject)),
        }
    }
}
