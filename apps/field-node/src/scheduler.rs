use crate::aggregate::{BurstWindow, WindowAggregator, WindowAverage};
use crate::avglog::{AverageLog, AverageLogEntry};
use crate::broker::Broker;
use crate::calibration::MoistureCalibration;
use crate::errlog::ErrorLog;
use crate::health::HostMonitor;
use crate::metric::MetricId;
use crate::plant::{self, PlantSchedule};
use crate::publisher::Publisher;
use crate::records::RecordBuilder;
use crate::sensors::{sample_all, SensorSlots};
use crate::stats::NodeStats;
use crate::validate::{TickSnapshot, ValidationFailure, Validator};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

const FLOW_BURST_LABEL: &str = "flow_burst";

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_period: Duration,
    pub window_length: Duration,
    pub burst_window: Duration,
    pub plant: PlantSchedule,
    pub calibration_path: PathBuf,
    pub status_interval: Duration,
    pub host: HostMonitor,
}

/// Wall-clock time stamps records and windows; the monotonic instant drives
/// broker backoff.
#[derive(Debug, Clone, Copy)]
pub struct TickTime {
    pub wall: DateTime<Utc>,
    pub mono: Instant,
}

impl TickTime {
    pub fn now() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerState {
    pub windows: WindowAggregator,
    pub burst: BurstWindow,
    pub plant_last_run: DateTime<Utc>,
    pub status_last_run: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl SchedulerState {
    pub fn new(settings: &SchedulerSettings, started_at: DateTime<Utc>) -> Self {
        Self {
            windows: WindowAggregator::new(&MetricId::WINDOWED, settings.window_length, started_at),
            burst: BurstWindow::new(settings.burst_window, started_at),
            plant_last_run: started_at,
            status_last_run: started_at,
            started_at,
        }
    }
}

fn elapsed_at_least(since: DateTime<Utc>, interval: Duration, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(since)
        .to_std()
        .is_ok_and(|elapsed| elapsed >= interval)
}

pub struct Scheduler<B> {
    sensors: SensorSlots,
    validator: Arc<Validator>,
    records: RecordBuilder,
    publisher: Publisher<B>,
    averages: AverageLog,
    errors: Arc<ErrorLog>,
    stats: Arc<NodeStats>,
    settings: SchedulerSettings,
    state: SchedulerState,
}

impl<B: Broker> Scheduler<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sensors: SensorSlots,
        validator: Validator,
        records: RecordBuilder,
        publisher: Publisher<B>,
        averages: AverageLog,
        errors: Arc<ErrorLog>,
        stats: Arc<NodeStats>,
        settings: SchedulerSettings,
        started_at: DateTime<Utc>,
    ) -> Self {
        let state = SchedulerState::new(&settings, started_at);
        Self {
            sensors,
            validator: Arc::new(validator),
            records,
            publisher,
            averages,
            errors,
            stats,
            settings,
            state,
        }
    }

    /// Drives ticks until the future is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            tick_ms = self.settings.tick_period.as_millis() as u64,
            window_secs = self.settings.window_length.as_secs(),
            sensors = self.sensors.enabled_count(),
            "scheduler started"
        );
        loop {
            ticker.tick().await;
            self.tick(TickTime::now()).await;
        }
    }

    pub async fn tick(&mut self, time: TickTime) {
        self.publisher.maintain(time.mono).await;

        let readings = sample_all(&self.sensors.per_tick(), time.wall).await;
        let mut snapshot = TickSnapshot::new(time.wall);
        let mut failures = Vec::new();
        for reading in &readings {
            self.validator.apply(reading, &mut snapshot, &mut failures);
        }
        self.report_failures(&failures);

        self.publisher
            .publish(&self.records.sets(&snapshot), time.mono)
            .await;
        self.publisher
            .publish(&self.records.environment(&snapshot), time.mono)
            .await;

        if elapsed_at_least(self.state.plant_last_run, self.settings.plant.interval, time.wall) {
            self.run_plant_cycle(time).await;
        }
        if elapsed_at_least(self.state.status_last_run, self.settings.status_interval, time.wall) {
            self.publish_status(&snapshot, time).await;
        }

        self.accumulate(&snapshot);
        self.flush_due(time.wall);
        self.forward_errors(time).await;

        self.publisher.drain_one_pass(time.mono).await;
        self.stats.record_tick();
    }

    fn accumulate(&mut self, snapshot: &TickSnapshot) {
        for metric in MetricId::WINDOWED {
            if metric == MetricId::WindDirection {
                continue;
            }
            self.state
                .windows
                .accumulate(metric, snapshot.metric_value(metric));
        }
        if let Some(direction) = snapshot.wind_direction {
            self.state
                .windows
                .accumulate_bearing(direction.degrees, direction.compass);
        }
        self.state
            .burst
            .accumulate(snapshot.metric_value(MetricId::Flow));
    }

    fn flush_due(&mut self, now: DateTime<Utc>) {
        let full_flow_flush = self.state.windows.is_due(MetricId::Flow, now);
        for metric in self.state.windows.due(now) {
            let average = self.state.windows.flush(metric, now);
            self.write_average(metric.as_str(), average, now);
        }

        if full_flow_flush {
            self.state.burst.reset(now);
        } else if let Some(average) = self.state.burst.poll(now) {
            self.write_average(FLOW_BURST_LABEL, Some(average), now);
        }
    }

    fn write_average(&self, label: &str, average: Option<WindowAverage>, now: DateTime<Utc>) {
        let Some(average) = average else {
            tracing::info!(metric = label, "no samples in window; average skipped");
            return;
        };
        let entry = AverageLogEntry {
            timestamp: now,
            metric_label: label.to_string(),
            mean_value: average.mean,
            sample_count: average.count,
            mode_label: average.mode.map(|mode| mode.as_str().to_string()),
        };
        match self.averages.append(&entry) {
            Ok(()) => {
                self.stats.averages_written.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(metric = label, mean = average.mean, samples = average.count, "average written");
            }
            Err(err) => {
                self.errors
                    .record(format!("average log write for {label} failed: {err:#}"));
            }
        }
    }

    async fn run_plant_cycle(&mut self, time: TickTime) {
        self.state.plant_last_run = time.wall;

        let samples = match self.sensors.color.clone() {
            Some(slot) => {
                let validator = self.validator.clone();
                let schedule = self.settings.plant;
                let collected = tokio::task::spawn_blocking(move || {
                    let mut source = slot.lock().unwrap_or_else(PoisonError::into_inner);
                    plant::collect(&mut **source, &validator, schedule)
                })
                .await;
                match collected {
                    Ok((samples, failures)) => {
                        self.report_failures(&failures);
                        samples
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "plant cycle task failed");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let calibration = if samples.is_empty() {
            None
        } else {
            match MoistureCalibration::load(&self.settings.calibration_path) {
                Ok(calibration) => Some(calibration),
                Err(err) => {
                    self.errors
                        .record(format!("moisture calibration unavailable: {err:#}"));
                    None
                }
            }
        };

        let summary = plant::summarize(time.wall, &samples, calibration.as_ref());
        self.publisher
            .publish(&self.records.plant(&summary), time.mono)
            .await;

        let count = summary.samples;
        let moisture = summary.moisture_pct.map(|mean| WindowAverage {
            mean,
            count,
            mode: None,
        });
        let lux = summary.lux.map(|mean| WindowAverage {
            mean,
            count,
            mode: None,
        });
        self.write_average(MetricId::Moisture.as_str(), moisture, time.wall);
        self.write_average(MetricId::Lux.as_str(), lux, time.wall);
    }

    async fn publish_status(&mut self, snapshot: &TickSnapshot, time: TickTime) {
        self.state.status_last_run = time.wall;
        let host = self.settings.host.collect();
        if let Some(warning) = host.cpu_warning() {
            tracing::warn!(cpu_temp_c = host.cpu_temp_c, status = warning.as_str(), "cpu running hot");
        }
        let depth = self.stats.queue_depth.load(Ordering::Relaxed) as usize;
        self.publisher
            .publish(&self.records.system(snapshot, &host, depth), time.mono)
            .await;
    }

    /// Publishes error-log lines recorded since the previous tick.
    async fn forward_errors(&mut self, time: TickTime) {
        for event in self.errors.take_pending() {
            self.publisher
                .publish(&self.records.error(&event), time.mono)
                .await;
        }
    }

    fn report_failures(&self, failures: &[ValidationFailure]) {
        for failure in failures {
            self.stats.validation_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(metric = failure.kind_label(), error = %failure, "validation failed");
            self.errors.record(format!("validation failed: {failure}"));
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    #[cfg(test)]
    pub fn publisher(&self) -> &Publisher<B> {
        &self.publisher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::WindCalibration;
    use crate::health;
    use crate::metric::ValidationLimits;
    use crate::publisher::fake::FakeBroker;
    use crate::publisher::{BackoffPolicy, LinkState};
    use crate::retry::{QueueLimits, RetryQueue};
    use crate::sensors::fake::ScriptedSource;
    use crate::sensors::{slot, ColorSample, RawValue, SensorKind};
    use crate::validate::Conversions;
    use chrono::TimeZone;
    use serde_json::Value;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        data_dir: PathBuf,
        errors: Arc<ErrorLog>,
        stats: Arc<NodeStats>,
        t0: TickTime,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let data_dir = dir.path().to_path_buf();
            let errors = Arc::new(ErrorLog::open(&data_dir.join("error_log.txt"), 100).unwrap());
            Self {
                _dir: dir,
                data_dir,
                errors,
                stats: Arc::new(NodeStats::new()),
                t0: TickTime {
                    wall: Utc.timestamp_opt(1_750_000_000, 0).unwrap(),
                    mono: Instant::now(),
                },
            }
        }

        fn at(&self, secs: u64) -> TickTime {
            TickTime {
                wall: self.t0.wall + chrono::Duration::seconds(secs as i64),
                mono: self.t0.mono + Duration::from_secs(secs),
            }
        }

        fn settings(&self) -> SchedulerSettings {
            SchedulerSettings {
                tick_period: Duration::from_secs(1),
                window_length: Duration::from_secs(300),
                burst_window: Duration::from_secs(5),
                plant: PlantSchedule {
                    interval: Duration::from_secs(300),
                    readings: 2,
                    spacing: Duration::ZERO,
                },
                calibration_path: self.data_dir.join("calibration.json"),
                status_interval: Duration::from_secs(3600),
                host: health::fake::host(&self.data_dir.join("host"), "45000"),
            }
        }

        fn scheduler(&self, sensors: SensorSlots, broker: FakeBroker) -> Scheduler<FakeBroker> {
            self.scheduler_with(sensors, broker, self.settings())
        }

        fn scheduler_with(
            &self,
            sensors: SensorSlots,
            broker: FakeBroker,
            settings: SchedulerSettings,
        ) -> Scheduler<FakeBroker> {
            let queue = RetryQueue::in_memory(QueueLimits {
                max_records: 1000,
                keep_free_bytes: 0,
            });
            let publisher = Publisher::new(
                broker,
                BackoffPolicy::default(),
                queue,
                self.stats.clone(),
                self.errors.clone(),
                self.t0.mono,
            );
            Scheduler::new(
                sensors,
                Validator::new(
                    ValidationLimits::default(),
                    Conversions::default(),
                    WindCalibration::default(),
                ),
                RecordBuilder::new("sensors", "test-node", "0.1.0"),
                publisher,
                AverageLog::open(&self.data_dir, 1000).unwrap(),
                self.errors.clone(),
                self.stats.clone(),
                settings,
                self.t0.wall,
            )
        }

        fn averages(&self, label: &str) -> Vec<AverageLogEntry> {
            AverageLog::open(&self.data_dir, 1000).unwrap().entries(label)
        }
    }

    fn pulses(count: u64) -> RawValue {
        RawValue::Pulses {
            count,
            window: Duration::from_secs(1),
        }
    }

    fn pressure_only() -> SensorSlots {
        SensorSlots {
            pressure: Some(slot(ScriptedSource::constant(
                SensorKind::Pressure,
                RawValue::Volts(2.5),
            ))),
            ..SensorSlots::default()
        }
    }

    async fn delivered(scheduler: &Scheduler<FakeBroker>) -> Vec<(String, Value)> {
        scheduler
            .publisher()
            .with_broker(|broker| broker.delivered.clone())
            .await
    }

    fn on_topic<'a>(delivered: &'a [(String, Value)], topic: &str) -> Vec<&'a Value> {
        delivered
            .iter()
            .filter(|(delivered_topic, _)| delivered_topic == topic)
            .map(|(_, payload)| payload)
            .collect()
    }

    #[tokio::test]
    async fn broker_outage_is_recovered_by_retry_queue() {
        let harness = Harness::new();
        let broker = FakeBroker::new(false);
        let up = broker.up.clone();
        let mut scheduler = harness.scheduler(pressure_only(), broker);

        for secs in 0..3 {
            scheduler.tick(harness.at(secs)).await;
        }
        // Two groups per tick while offline.
        assert_eq!(scheduler.publisher().queued().await, 6);
        assert!(delivered(&scheduler).await.is_empty());

        up.store(true, Ordering::SeqCst);
        scheduler.tick(harness.at(10)).await;
        assert_eq!(scheduler.publisher().link_state().await, LinkState::Connected);
        assert_eq!(scheduler.publisher().queued().await, 0);

        let delivered = delivered(&scheduler).await;
        assert_eq!(delivered.len(), 8);
        let sets: Vec<&Value> = delivered
            .iter()
            .filter(|(topic, _)| topic == "sensors/sets")
            .map(|(_, payload)| payload)
            .collect();
        assert_eq!(sets.len(), 4);
        assert!(sets.iter().all(|payload| payload["pressure_psi"] == 50.0));
    }

    #[tokio::test]
    async fn disabled_flow_never_writes_a_flow_average() {
        let harness = Harness::new();
        let mut scheduler = harness.scheduler(pressure_only(), FakeBroker::new(true));

        for secs in [0, 100, 200, 299, 300, 301, 400, 500, 599, 600] {
            scheduler.tick(harness.at(secs)).await;
        }

        assert!(harness.averages("flow").is_empty());
        assert!(harness.averages(FLOW_BURST_LABEL).is_empty());
        let pressure = harness.averages("pressure");
        assert_eq!(pressure.len(), 2);
        assert!(pressure.iter().all(|entry| (entry.mean_value - 50.0).abs() < 1e-9));

        let delivered = delivered(&scheduler).await;
        let sets = delivered
            .iter()
            .find(|(topic, _)| topic == "sensors/sets")
            .map(|(_, payload)| payload)
            .unwrap();
        assert!(sets["flow_lpm"].is_null());
        assert!(sets["flow_pulses"].is_null());
    }

    #[tokio::test]
    async fn window_flush_writes_mean_and_count_then_resets() {
        let harness = Harness::new();
        let sensors = SensorSlots {
            flow: Some(slot(ScriptedSource::new(
                SensorKind::Flow,
                vec![Some(pulses(450)), Some(pulses(900)), None, Some(pulses(0))],
            ))),
            ..SensorSlots::default()
        };
        let mut scheduler = harness.scheduler(sensors, FakeBroker::new(true));

        scheduler.tick(harness.at(100)).await;
        scheduler.tick(harness.at(200)).await;
        scheduler.tick(harness.at(250)).await;
        scheduler.tick(harness.at(300)).await;

        let flow = harness.averages("flow");
        assert_eq!(flow.len(), 1);
        assert_eq!(flow[0].sample_count, 3);
        assert!((flow[0].mean_value - 60.0).abs() < 1e-9);
        assert_eq!(flow[0].timestamp, harness.at(300).wall);

        let window = scheduler.state().windows.window(MetricId::Flow).unwrap();
        assert_eq!(window.len(), 0);
        assert_eq!(window.open_since(), harness.at(300).wall);
        // The full flush also restarts the burst accumulator.
        assert_eq!(scheduler.state().burst.len(), 0);
        let bursts: Vec<f64> = harness
            .averages(FLOW_BURST_LABEL)
            .iter()
            .map(|entry| entry.mean_value)
            .collect();
        assert_eq!(bursts, vec![60.0, 120.0]);
    }

    #[tokio::test]
    async fn burst_window_logs_active_flow_between_full_flushes() {
        let harness = Harness::new();
        let sensors = SensorSlots {
            flow: Some(slot(ScriptedSource::new(
                SensorKind::Flow,
                vec![Some(pulses(0)), Some(pulses(0)), Some(pulses(45)), Some(pulses(45))],
            ))),
            ..SensorSlots::default()
        };
        let mut scheduler = harness.scheduler(sensors, FakeBroker::new(true));

        scheduler.tick(harness.at(1)).await;
        scheduler.tick(harness.at(5)).await;
        assert!(harness.averages(FLOW_BURST_LABEL).is_empty());

        scheduler.tick(harness.at(6)).await;
        scheduler.tick(harness.at(10)).await;
        let burst = harness.averages(FLOW_BURST_LABEL);
        assert_eq!(burst.len(), 1);
        assert_eq!(burst[0].sample_count, 2);
        assert!((burst[0].mean_value - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn validation_failures_are_logged_and_excluded() {
        let harness = Harness::new();
        let sensors = SensorSlots {
            pressure: Some(slot(ScriptedSource::new(
                SensorKind::Pressure,
                vec![Some(RawValue::Volts(9.0)), Some(RawValue::Volts(2.5))],
            ))),
            ..SensorSlots::default()
        };
        let mut scheduler = harness.scheduler(sensors, FakeBroker::new(true));

        scheduler.tick(harness.at(1)).await;
        scheduler.tick(harness.at(2)).await;
        assert_eq!(
            scheduler
                .state()
                .windows
                .window(MetricId::Pressure)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(harness.stats.validation_failures.load(Ordering::Relaxed), 1);
        let lines = harness.errors.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("validation failed: pressure value 9"));

        let delivered = delivered(&scheduler).await;
        let sets = on_topic(&delivered, "sensors/sets");
        assert!(sets[0]["pressure_psi"].is_null());
        assert_eq!(sets[1]["pressure_psi"], 50.0);

        let forwarded = on_topic(&delivered, "status/errors");
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0]["sensor_name"], "test-node");
        assert!(forwarded[0]["error"]
            .as_str()
            .unwrap()
            .starts_with("validation failed: pressure value 9"));
    }

    #[tokio::test]
    async fn plant_cycle_runs_on_its_own_interval() {
        let harness = Harness::new();
        std::fs::write(
            harness.data_dir.join("calibration.json"),
            r#"{"dry":{"b":14.0},"wet":{"b":21.0}}"#,
        )
        .unwrap();
        let sensors = SensorSlots {
            color: Some(slot(ScriptedSource::constant(
                SensorKind::Color,
                RawValue::Color(ColorSample {
                    red: 3.0,
                    green: 4.0,
                    blue: 17.5,
                    lux: 250.0,
                }),
            ))),
            ..SensorSlots::default()
        };
        let mut scheduler = harness.scheduler(sensors, FakeBroker::new(true));

        scheduler.tick(harness.at(1)).await;
        scheduler.tick(harness.at(299)).await;
        assert!(harness.averages("moisture").is_empty());

        scheduler.tick(harness.at(300)).await;
        let moisture = harness.averages("moisture");
        assert_eq!(moisture.len(), 1);
        assert!((moisture[0].mean_value - 50.0).abs() < 1e-9);
        assert_eq!(moisture[0].sample_count, 2);
        assert_eq!(harness.averages("lux")[0].mean_value, 250.0);

        let delivered = delivered(&scheduler).await;
        let plant: Vec<&Value> = delivered
            .iter()
            .filter(|(topic, _)| topic == "sensors/plant")
            .map(|(_, payload)| payload)
            .collect();
        assert_eq!(plant.len(), 1);
        assert_eq!(plant[0]["moisture_pct"], 50.0);
        assert_eq!(plant[0]["samples"], 2);
    }

    #[tokio::test]
    async fn missing_calibration_publishes_null_moisture() {
        let harness = Harness::new();
        let sensors = SensorSlots {
            color: Some(slot(ScriptedSource::constant(
                SensorKind::Color,
                RawValue::Color(ColorSample {
                    red: 3.0,
                    green: 4.0,
                    blue: 17.5,
                    lux: 250.0,
                }),
            ))),
            ..SensorSlots::default()
        };
        let mut scheduler = harness.scheduler(sensors, FakeBroker::new(true));
        scheduler.tick(harness.at(300)).await;

        assert!(harness.averages("moisture").is_empty());
        assert_eq!(harness.averages("lux").len(), 1);
        assert!(harness
            .errors
            .lines()
            .iter()
            .any(|line| line.contains("moisture calibration unavailable")));
        let delivered = delivered(&scheduler).await;
        let plant = delivered
            .iter()
            .find(|(topic, _)| topic == "sensors/plant")
            .unwrap();
        assert!(plant.1["moisture_pct"].is_null());
        assert_eq!(plant.1["lux"], 250.0);
    }

    #[tokio::test]
    async fn wind_direction_average_carries_modal_label() {
        let harness = Harness::new();
        let sensors = SensorSlots {
            wind_direction: Some(slot(ScriptedSource::new(
                SensorKind::WindDirection,
                vec![
                    Some(RawValue::Adc(18052)),
                    Some(RawValue::Adc(18052)),
                    Some(RawValue::Adc(21755)),
                ],
            ))),
            ..SensorSlots::default()
        };
        let mut scheduler = harness.scheduler(sensors, FakeBroker::new(true));
        scheduler.tick(harness.at(1)).await;
        scheduler.tick(harness.at(2)).await;
        scheduler.tick(harness.at(300)).await;

        let entries = harness.averages("wind_direction");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sample_count, 3);
        assert_eq!(entries[0].mode_label.as_deref(), Some("NE"));
    }

    #[tokio::test]
    async fn failed_average_write_is_logged_and_window_still_resets() {
        let harness = Harness::new();
        std::fs::create_dir_all(harness.data_dir.join("avg_flow_log.txt")).unwrap();
        let sensors = SensorSlots {
            flow: Some(slot(ScriptedSource::constant(SensorKind::Flow, pulses(450)))),
            ..SensorSlots::default()
        };
        let mut scheduler = harness.scheduler(sensors, FakeBroker::new(true));

        scheduler.tick(harness.at(100)).await;
        scheduler.tick(harness.at(200)).await;
        scheduler.tick(harness.at(300)).await;

        assert!(harness
            .errors
            .lines()
            .iter()
            .any(|line| line.contains("average log write for flow failed")));
        let window = scheduler.state().windows.window(MetricId::Flow).unwrap();
        assert_eq!(window.len(), 0);
        assert_eq!(window.open_since(), harness.at(300).wall);

        let delivered = delivered(&scheduler).await;
        assert!(on_topic(&delivered, "status/errors")
            .iter()
            .any(|payload| payload["error"]
                .as_str()
                .is_some_and(|error| error.contains("average log write for flow failed"))));
    }

    #[tokio::test]
    async fn system_status_runs_on_its_own_cadence() {
        let harness = Harness::new();
        let sensors = SensorSlots {
            climate: Some(slot(ScriptedSource::constant(
                SensorKind::Climate,
                RawValue::Climate {
                    temperature_c: 18.5,
                    humidity_pct: 40.0,
                },
            ))),
            soil_temperature: Some(slot(ScriptedSource::constant(
                SensorKind::SoilTemperature,
                RawValue::Celsius(12.5),
            ))),
            ..SensorSlots::default()
        };
        let mut settings = harness.settings();
        settings.status_interval = Duration::from_secs(10);
        settings.host = health::fake::host(&harness.data_dir.join("hot-host"), "65000");
        let mut scheduler = harness.scheduler_with(sensors, FakeBroker::new(true), settings);

        for secs in [0, 5, 9] {
            scheduler.tick(harness.at(secs)).await;
        }
        assert!(on_topic(&delivered(&scheduler).await, "status/system").is_empty());

        for secs in [10, 15, 20] {
            scheduler.tick(harness.at(secs)).await;
        }
        let delivered = delivered(&scheduler).await;
        let status = on_topic(&delivered, "status/system");
        assert_eq!(status.len(), 2);
        assert_eq!(status[0]["hostname"], "orchard-pi");
        assert_eq!(status[0]["cpu_temp_warning"], "ELEVATED_TEMP");
        assert_eq!(status[0]["system_health"], "ELEVATED_TEMP");
        assert_eq!(status[0]["env_temp_c"], 18.5);
        assert_eq!(status[0]["soil_temp_c"], 12.5);
        assert_eq!(status[0]["mem"]["total_kb"], 3_884_096);
        assert!(status[0]["disk"]["total_bytes"].as_u64().unwrap() > 0);
        assert_eq!(scheduler.state().status_last_run, harness.at(20).wall);
    }

    #[tokio::test]
    async fn soil_temperature_has_its_own_window() {
        let harness = Harness::new();
        let sensors = SensorSlots {
            soil_temperature: Some(slot(ScriptedSource::new(
                SensorKind::SoilTemperature,
                vec![
                    Some(RawValue::Celsius(10.0)),
                    Some(RawValue::Celsius(14.0)),
                    Some(RawValue::Celsius(200.0)),
                    Some(RawValue::Celsius(12.0)),
                ],
            ))),
            ..SensorSlots::default()
        };
        let mut scheduler = harness.scheduler(sensors, FakeBroker::new(true));

        for secs in [100, 200, 250, 300] {
            scheduler.tick(harness.at(secs)).await;
        }

        let soil = harness.averages("soil_temperature");
        assert_eq!(soil.len(), 1);
        assert_eq!(soil[0].sample_count, 3);
        assert!((soil[0].mean_value - 12.0).abs() < 1e-9);
        assert!(harness.averages("temperature").is_empty());
        assert_eq!(harness.stats.validation_failures.load(Ordering::Relaxed), 1);

        let delivered = delivered(&scheduler).await;
        let environment = on_topic(&delivered, "sensors/environment");
        assert_eq!(environment[0]["soil_temperature_c"], 10.0);
        assert!(environment[2]["soil_temperature_c"].is_null());
    }
}
