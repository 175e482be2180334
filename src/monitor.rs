use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval};
use tracing::{debug, info, warn};

use crate::anomaly::{self, Classifier, RangeStatus, Recency};
use crate::channel::{ChannelManager, ChannelState, Delivery, PushFeed, Selection, SubscriptionToken};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::export::{self, SeriesSummary};
use crate::feed::FeedSorter;
use crate::models::{AlertEvent, AudioEvent, FeedMode, Metric, Reading, SubjectId, VitalSample};
use crate::roster::Roster;
use crate::series::{InsertOutcome, SeriesAggregator};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub subject: Option<SubjectId>,
    pub inserted: usize,
    pub duplicates: usize,
    pub replaced: usize,
    pub removed: usize,
    pub capture: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportPayload {
    pub filename: String,
    pub mime: &'static str,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Select(SubjectId),
    Deselect,
    Shutdown,
}

pub struct Monitor<F, R = StdRng> {
    config: PipelineConfig,
    roster: Roster,
    classifier: Classifier,
    series: SeriesAggregator,
    feeds: FeedSorter,
    channels: ChannelManager<F, R>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    selected: Option<SubjectId>,
    capture_pending: bool,
}

impl<F: PushFeed, R: Rng> Monitor<F, R> {
    pub fn new(config: PipelineConfig, roster: Roster, feed: F, rng: R) -> Result<Self> {
        config.validate()?;
        let classifier = Classifier::new(config.anomaly.clone());
        let (tx, deliveries) = mpsc::unbounded_channel();

        Ok(Self {
            series: SeriesAggregator::new(classifier.clone(), config.live_window),
            channels: ChannelManager::new(feed, rng, config.synthetic.clone(), tx)?,
            feeds: FeedSorter::default(),
            classifier,
            roster,
            config,
            deliveries,
            selected: None,
            capture_pending: false,
        })
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn feed(&self) -> &F {
        self.channels.feed()
    }

    pub fn selected(&self) -> Option<SubjectId> {
        self.selected
    }

    pub fn channel_state(&self, subject: SubjectId) -> ChannelState {
        self.channels.state(subject)
    }

    /// Make `subject` the active one. Returns `None` when it is not on the roster.
    pub fn select(&mut self, subject: SubjectId, now: DateTime<Utc>) -> Option<Selection> {
        let Some(entry) = self.roster.find(subject) else {
            warn!(subject, "subject not on roster");
            return None;
        };

        self.series.reset(subject);
        self.feeds.reset(subject);
        let selection = self.channels.select(entry, now);
        self.selected = Some(subject);
        self.capture_pending = false;

        for reading in selection.seed.iter().cloned() {
            self.series.insert(subject, reading);
        }
        Some(selection)
    }

    pub fn deselect(&mut self) {
        if let Some(subject) = self.channels.teardown() {
            debug!(subject, "deselected");
        }
        self.selected = None;
        self.capture_pending = false;
    }

    /// Apply one feed delivery. Deliveries for torn-down subscriptions are dropped.
    pub fn dispatch(&mut self, delivery: Delivery) -> Update {
        let subject = delivery.subject;
        let changes = match self.channels.accept(delivery) {
            Ok(changes) => changes,
            Err(err) => {
                debug!(%err, "discarding delivery");
                return Update::default();
            }
        };

        let mut update = self.apply(subject, changes.new_readings);
        for (metric, id) in &changes.stale_readings {
            if self.series.remove(subject, *metric, id) {
                update.removed += 1;
            }
        }
        for reading in changes.changed_readings {
            self.series.replace(subject, reading);
            update.replaced += 1;
        }
        if let Some(alerts) = changes.alerts.as_ref() {
            self.feeds.replace_alerts(subject, Some(alerts));
        }
        if let Some(audio) = changes.audio.as_ref() {
            self.feeds.replace_audio(subject, Some(audio));
        }
        if changes.capture {
            self.capture_pending = true;
            update.capture = true;
        }
        update
    }

    /// Advance the synthetic generator behind `token` by one interval.
    pub fn on_tick(&mut self, subject: SubjectId, token: SubscriptionToken, now: DateTime<Utc>) -> Update {
        match self.channels.tick(subject, token, now) {
            Ok(tick) => {
                let mut update = self.apply(subject, tick.readings);
                if tick.capture {
                    self.capture_pending = true;
                    update.capture = true;
                }
                update
            }
            Err(err) => {
                debug!(%err, "discarding tick");
                Update::default()
            }
        }
    }

    fn apply(&mut self, subject: SubjectId, readings: Vec<Reading>) -> Update {
        let mut update = Update {
            subject: Some(subject),
            ..Update::default()
        };
        for reading in readings {
            match self.series.insert(subject, reading) {
                InsertOutcome::Inserted => update.inserted += 1,
                InsertOutcome::Duplicate => update.duplicates += 1,
            }
        }
        update
    }

    /// Apply every delivery already queued, without waiting.
    pub fn pump(&mut self) -> Vec<Update> {
        let mut updates = Vec::new();
        while let Ok(delivery) = self.deliveries.try_recv() {
            updates.push(self.dispatch(delivery));
        }
        updates
    }

    pub fn take_capture(&mut self) -> bool {
        std::mem::take(&mut self.capture_pending)
    }

    pub fn live_window(&self, subject: SubjectId, metric: Metric) -> &[VitalSample] {
        self.series.live_window(subject, metric)
    }

    pub fn historical_series(&self, subject: SubjectId, metric: Metric) -> &[VitalSample] {
        self.series.historical_series(subject, metric)
    }

    pub fn latest_timestamp(&self, subject: SubjectId) -> Option<DateTime<Utc>> {
        self.series.latest_timestamp(subject)
    }

    pub fn current_value(&self, subject: SubjectId, metric: Metric) -> i64 {
        anomaly::current_value(self.live_window(subject, metric))
    }

    pub fn range_status(&self, subject: SubjectId, metric: Metric) -> RangeStatus {
        let current = self.current_value(subject, metric) as f64;
        self.classifier.range_status(metric, current)
    }

    pub fn recency(&self, subject: SubjectId, now: DateTime<Utc>) -> Recency {
        anomaly::recency(
            self.latest_timestamp(subject),
            now,
            Duration::seconds(self.config.recent_threshold_secs),
        )
    }

    pub fn alerts(&self, subject: SubjectId) -> &[AlertEvent] {
        self.feeds.alerts(subject)
    }

    pub fn audio(&self, subject: SubjectId) -> &[AudioEvent] {
        self.feeds.audio(subject)
    }

    pub fn summary(&self, subject: SubjectId, metric: Metric) -> SeriesSummary {
        export::summarize(self.historical_series(subject, metric))
    }

    pub fn export(&self, subject: SubjectId, metric: Metric) -> Result<ExportPayload> {
        self.roster.require(subject)?;
        Ok(ExportPayload {
            filename: export::export_filename(subject, metric),
            mime: export::CSV_MIME,
            body: export::format(self.historical_series(subject, metric))?,
        })
    }

    /// Drive the pipeline until `Command::Shutdown` or the command channel closes.
    /// `on_update` sees the pipeline after every applied delivery or tick.
    pub async fn run<U>(&mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut on_update: U)
    where
        U: FnMut(&Self, &Update),
    {
        let period = std::time::Duration::from_millis(self.config.synthetic.interval_ms);
        let mut ticker: Option<(SubjectId, SubscriptionToken, Interval)> = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Select(subject)) => {
                        ticker = None;
                        if let Some(selection) = self.select(subject, Utc::now()) {
                            if selection.mode == FeedMode::Synthetic {
                                let interval = time::interval_at(Instant::now() + period, period);
                                ticker = Some((subject, selection.token, interval));
                            }
                        }
                    }
                    Some(Command::Deselect) => {
                        ticker = None;
                        self.deselect();
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(delivery) = self.deliveries.recv() => {
                    let update = self.dispatch(delivery);
                    if update.subject.is_some() {
                        on_update(self, &update);
                    }
                }
                (subject, token) = next_tick(&mut ticker) => {
                    let update = self.on_tick(subject, token, Utc::now());
                    if update.subject.is_some() {
                        on_update(self, &update);
                    }
                }
            }
        }

        self.deselect();
        info!("monitor stopped");
    }
}

async fn next_tick(
    ticker: &mut Option<(SubjectId, SubscriptionToken, Interval)>,
) -> (SubjectId, SubscriptionToken) {
    match ticker {
        Some((subject, token, interval)) => {
            interval.tick().await;
            (*subject, *token)
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{DeviceSnapshot, LocalFeed};
    use crate::models::SequenceId;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use serde_json::json;

    fn monitor() -> Monitor<LocalFeed> {
        Monitor::new(
            PipelineConfig::default(),
            Roster::seed(),
            LocalFeed::new(),
            StdRng::seed_from_u64(11),
        )
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn snapshot(value: serde_json::Value) -> Option<DeviceSnapshot> {
        Some(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn snapshot_vitals_are_ordered_and_classified() {
        let mut monitor = monitor();
        monitor.select(1, now()).unwrap();
        monitor.feed().publish(
            "wearable_001",
            snapshot(json!({"vitals": {
                "b": {"timestamp": 2000, "heart_rate": 70, "spo2": 98},
                "a": {"timestamp": 1000, "heart_rate": 105, "spo2": 96}
            }})),
        );
        let updates = monitor.pump();
        assert_eq!(updates[0].inserted, 4);

        let heart: Vec<(f64, bool)> = monitor
            .historical_series(1, Metric::HeartRate)
            .iter()
            .map(|sample| (sample.value, sample.anomaly))
            .collect();
        assert_eq!(heart, vec![(105.0, true), (70.0, false)]);
        assert_eq!(
            monitor.historical_series(1, Metric::HeartRate)[0].sequence_id,
            SequenceId::Text("a".into())
        );
        assert_eq!(monitor.current_value(1, Metric::HeartRate), 70);
        assert_eq!(monitor.current_value(1, Metric::SpO2), 98);
    }

    #[test]
    fn repeated_snapshots_do_not_duplicate() {
        let mut monitor = monitor();
        monitor.select(1, now()).unwrap();
        let tree = json!({"vitals": {"a": {"timestamp": 1000, "heart_rate": 80, "spo2": 97}}});
        monitor.feed().publish("wearable_001", snapshot(tree.clone()));
        monitor.feed().publish("wearable_001", snapshot(tree));
        monitor.pump();
        assert_eq!(monitor.historical_series(1, Metric::HeartRate).len(), 1);
    }

    #[test]
    fn malformed_records_are_skipped_not_fatal() {
        let mut monitor = monitor();
        monitor.select(1, now()).unwrap();
        monitor.feed().publish(
            "wearable_001",
            snapshot(json!({
                "vitals": {
                    "good": {"timestamp": 1000, "heart_rate": 80, "spo2": 97},
                    "no_time": {"heart_rate": 80, "spo2": 97},
                    "half": {"timestamp": 2000, "heart_rate": 120}
                },
                "alerts": {
                    "ok": {"timestamp": 1000, "alert_type": "threshold", "value": 120},
                    "bad": {"alert_type": "threshold"}
                }
            })),
        );
        monitor.pump();
        assert_eq!(monitor.historical_series(1, Metric::HeartRate).len(), 2);
        assert_eq!(monitor.historical_series(1, Metric::SpO2).len(), 1);
        assert_eq!(monitor.alerts(1).len(), 1);
    }

    #[test]
    fn delayed_delivery_after_switch_is_a_no_op() {
        let mut monitor = monitor();
        monitor.select(1, now()).unwrap();
        let sink = monitor.feed().sinks("wearable_001").remove(0);
        sink.push(snapshot(json!({"vitals": {"a": {"timestamp": 1000, "heart_rate": 80, "spo2": 97}}})));
        monitor.pump();
        let before = monitor.historical_series(1, Metric::HeartRate).to_vec();

        monitor.select(2, now()).unwrap();
        sink.push(snapshot(json!({"vitals": {"z": {"timestamp": 9000, "heart_rate": 150, "spo2": 80}}})));
        let updates = monitor.pump();

        assert_eq!(updates, vec![Update::default()]);
        assert_eq!(monitor.historical_series(1, Metric::HeartRate), before.as_slice());
        assert_eq!(monitor.channel_state(1), ChannelState::Idle);
        assert_eq!(monitor.feed().subscriber_count(), 0);
    }

    #[test]
    fn stale_tick_after_switch_is_a_no_op() {
        let mut monitor = monitor();
        let first = monitor.select(2, now()).unwrap();
        let seeded = monitor.historical_series(2, Metric::HeartRate).len();
        monitor.select(3, now()).unwrap();

        let update = monitor.on_tick(2, first.token, now() + Duration::seconds(2));
        assert_eq!(update, Update::default());
        assert_eq!(monitor.historical_series(2, Metric::HeartRate).len(), seeded);
    }

    #[test]
    fn synthetic_subject_is_seeded_and_ticks_append() {
        let mut monitor = monitor();
        let selection = monitor.select(3, now()).unwrap();
        assert_eq!(monitor.live_window(3, Metric::SpO2).len(), 20);
        assert_eq!(monitor.historical_series(3, Metric::SpO2).len(), 28);
        assert_eq!(monitor.recency(3, now()), Recency::JustNow);

        let update = monitor.on_tick(3, selection.token, now() + Duration::seconds(2));
        assert_eq!(update.inserted, 2);
        assert_eq!(monitor.live_window(3, Metric::HeartRate).len(), 20);
        assert_eq!(monitor.historical_series(3, Metric::HeartRate).len(), 29);
        assert_eq!(
            monitor.latest_timestamp(3),
            Some(now() + Duration::seconds(2))
        );
    }

    #[test]
    fn unknown_subject_surfaces_as_not_found() {
        let mut monitor = monitor();
        assert!(monitor.select(42, now()).is_none());
        assert!(monitor.selected().is_none());
        assert!(monitor.export(42, Metric::HeartRate).is_err());
        assert!(monitor.live_window(42, Metric::HeartRate).is_empty());
    }

    #[test]
    fn export_of_empty_live_subject_is_header_only() {
        let mut monitor = monitor();
        monitor.select(1, now()).unwrap();
        let payload = monitor.export(1, Metric::SpO2).unwrap();
        assert_eq!(payload.filename, "subject1_spo2_data.csv");
        assert_eq!(payload.mime, "text/csv");
        assert_eq!(payload.body, "ID,Date,Value,Anomaly\n");
        assert_eq!(monitor.current_value(1, Metric::SpO2), 0);
        assert_eq!(monitor.recency(1, now()), Recency::NotAvailable);
    }

    #[test]
    fn alert_and_audio_views_are_newest_first() {
        let mut monitor = monitor();
        monitor.select(1, now()).unwrap();
        monitor.feed().publish(
            "wearable_001",
            snapshot(json!({
                "alerts": {
                    "t1": {"timestamp": 1000, "alert_type": "threshold"},
                    "t3": {"timestamp": 3000, "alert_type": "keyword", "keyword": "ouch"},
                    "t2": {"timestamp": 2000, "alert_type": "anomaly", "anomaly_score": 0.9}
                },
                "audio": {
                    "a1": {"timestamp": 1000, "filepath": "audio/1.wav"},
                    "a3": {"timestamp": 3000, "filepath": "audio/3.wav"},
                    "a2": {"timestamp": 2000, "filepath": "audio/2.wav"}
                },
                "images": {"i": {"timestamp": 2500}}
            })),
        );
        let updates = monitor.pump();
        assert!(updates[0].capture);
        assert!(monitor.take_capture());
        assert!(!monitor.take_capture());

        let alerts: Vec<&str> = monitor.alerts(1).iter().map(|a| a.id.as_str()).collect();
        let audio: Vec<&str> = monitor.audio(1).iter().map(|a| a.id.as_str()).collect();
        assert_eq!(alerts, vec!["t3", "t2", "t1"]);
        assert_eq!(audio, vec!["a3", "a2", "a1"]);
    }

    #[test]
    fn snapshots_without_alert_keys_keep_previous_views() {
        let mut monitor = monitor();
        monitor.select(1, now()).unwrap();
        monitor.feed().publish(
            "wearable_001",
            snapshot(json!({
                "alerts": {"a": {"timestamp": 1000, "alert_type": "threshold"}},
                "audio": {"r": {"timestamp": 1000, "filepath": "audio/r.wav"}}
            })),
        );
        monitor.pump();
        assert_eq!(monitor.alerts(1).len(), 1);

        monitor.feed().publish("wearable_001", None);
        monitor.pump();
        assert_eq!(monitor.alerts(1).len(), 1);
        assert_eq!(monitor.audio(1).len(), 1);

        monitor.feed().publish(
            "wearable_001",
            snapshot(json!({"vitals": {"v": {"timestamp": 2000, "heart_rate": 70, "spo2": 97}}})),
        );
        monitor.pump();
        assert_eq!(monitor.alerts(1).len(), 1);
        assert_eq!(monitor.audio(1).len(), 1);

        monitor.feed().publish("wearable_001", snapshot(json!({"alerts": {}})));
        monitor.pump();
        assert!(monitor.alerts(1).is_empty());
        assert_eq!(monitor.audio(1).len(), 1);
    }

    #[test]
    fn record_losing_a_metric_drops_its_old_sample() {
        let mut monitor = monitor();
        monitor.select(1, now()).unwrap();
        monitor.feed().publish(
            "wearable_001",
            snapshot(json!({"vitals": {"b": {"timestamp": 2000, "heart_rate": 72, "spo2": 95}}})),
        );
        monitor.pump();
        monitor.feed().publish(
            "wearable_001",
            snapshot(json!({"vitals": {"b": {"timestamp": 2000, "heart_rate": 72}}})),
        );
        let updates = monitor.pump();

        assert_eq!(updates[0].removed, 1);
        assert!(monitor.historical_series(1, Metric::SpO2).is_empty());
        assert_eq!(monitor.historical_series(1, Metric::HeartRate).len(), 1);
    }

    #[test]
    fn deselect_clears_pending_capture() {
        let mut monitor = monitor();
        monitor.select(1, now()).unwrap();
        monitor.feed().publish(
            "wearable_001",
            snapshot(json!({"images": {"i": {"timestamp": 2500}}})),
        );
        monitor.pump();
        monitor.deselect();
        assert!(!monitor.take_capture());
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_ticks_synthetic_subjects() {
        let mut monitor = monitor();
        let (commands, rx) = mpsc::unbounded_channel();
        commands.send(Command::Select(4)).unwrap();

        let mut ticks = 0;
        let stopper = commands.clone();
        monitor
            .run(rx, |monitor, update| {
                assert_eq!(update.subject, Some(4));
                assert_eq!(update.inserted, 2);
                assert!(monitor.live_window(4, Metric::HeartRate).len() <= 20);
                ticks += 1;
                if ticks == 3 {
                    stopper.send(Command::Shutdown).unwrap();
                }
            })
            .await;

        assert_eq!(ticks, 3);
        assert_eq!(monitor.historical_series(4, Metric::HeartRate).len(), 28 + 3);
        assert_eq!(monitor.channel_state(4), ChannelState::Idle);
    }

    #[tokio::test]
    async fn run_loop_applies_feed_deliveries() {
        let mut monitor = monitor();
        let (stopper, rx) = mpsc::unbounded_channel();
        let mut published = false;
        monitor.select(1, now()).unwrap();
        monitor.feed().publish(
            "wearable_001",
            snapshot(json!({"vitals": {"a": {"timestamp": 1000, "heart_rate": 90, "spo2": 95}}})),
        );
        monitor
            .run(rx, |monitor, update| {
                published = true;
                assert_eq!(update.inserted, 2);
                assert_eq!(monitor.current_value(1, Metric::HeartRate), 90);
                stopper.send(Command::Shutdown).unwrap();
            })
            .await;
        assert!(published);
    }
}
