use crate::calibration::Compass;
use crate::metric::MetricId;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowAverage {
    pub mean: f64,
    pub count: usize,
    pub mode: Option<Compass>,
}

/// Compass label counts in first-seen order; ties resolve to the earliest label.
#[derive(Debug, Clone, Default)]
struct LabelTally {
    counts: Vec<(Compass, usize)>,
}

impl LabelTally {
    fn add(&mut self, label: Compass) {
        match self.counts.iter_mut().find(|(seen, _)| *seen == label) {
            Some((_, count)) => *count += 1,
            None => self.counts.push((label, 1)),
        }
    }

    fn mode(&self) -> Option<Compass> {
        let mut best: Option<(Compass, usize)> = None;
        for &(label, count) in &self.counts {
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((label, count));
            }
        }
        best.map(|(label, _)| label)
    }

    fn clear(&mut self) {
        self.counts.clear();
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since).to_std().unwrap_or_default()
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

#[derive(Debug, Clone)]
pub struct Window {
    metric: MetricId,
    open_since: DateTime<Utc>,
    length: Duration,
    samples: Vec<f64>,
    labels: Option<LabelTally>,
}

impl Window {
    pub fn new(metric: MetricId, length: Duration, opened_at: DateTime<Utc>) -> Self {
        Self {
            metric,
            open_since: opened_at,
            length,
            samples: Vec::new(),
            labels: None,
        }
    }

    pub fn with_labels(mut self) -> Self {
        self.labels = Some(LabelTally::default());
        self
    }

    pub fn metric(&self) -> MetricId {
        self.metric
    }

    pub fn open_since(&self) -> DateTime<Utc> {
        self.open_since
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn accumulate(&mut self, value: Option<f64>) {
        if let Some(value) = value {
            self.samples.push(value);
        }
    }

    pub fn accumulate_labelled(&mut self, value: f64, label: Compass) {
        self.samples.push(value);
        if let Some(labels) = self.labels.as_mut() {
            labels.add(label);
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        elapsed(self.open_since, now) >= self.length
    }

    /// Closes the window at `now`. The window always restarts empty; the
    /// average is `None` when no samples were collected.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Option<WindowAverage> {
        let average = mean(&self.samples).map(|mean| WindowAverage {
            mean,
            count: self.samples.len(),
            mode: self.labels.as_ref().and_then(LabelTally::mode),
        });
        self.samples.clear();
        if let Some(labels) = self.labels.as_mut() {
            labels.clear();
        }
        self.open_since = now;
        average
    }
}

/// One window per windowed metric, all of the same length.
#[derive(Debug, Clone)]
pub struct WindowAggregator {
    windows: BTreeMap<MetricId, Window>,
}

impl WindowAggregator {
    pub fn new(metrics: &[MetricId], length: Duration, opened_at: DateTime<Utc>) -> Self {
        let windows = metrics
            .iter()
            .map(|&metric| {
                let window = Window::new(metric, length, opened_at);
                let window = if metric == MetricId::WindDirection {
                    window.with_labels()
                } else {
                    window
                };
                (metric, window)
            })
            .collect();
        Self { windows }
    }

    pub fn accumulate(&mut self, metric: MetricId, value: Option<f64>) {
        if let Some(window) = self.windows.get_mut(&metric) {
            window.accumulate(value);
        }
    }

    pub fn accumulate_bearing(&mut self, degrees: f64, compass: Compass) {
        if let Some(window) = self.windows.get_mut(&MetricId::WindDirection) {
            window.accumulate_labelled(degrees, compass);
        }
    }

    pub fn is_due(&self, metric: MetricId, now: DateTime<Utc>) -> bool {
        self.windows
            .get(&metric)
            .is_some_and(|window| window.is_due(now))
    }

    pub fn due(&self, now: DateTime<Utc>) -> Vec<MetricId> {
        self.windows
            .values()
            .filter(|window| window.is_due(now))
            .map(Window::metric)
            .collect()
    }

    pub fn flush(&mut self, metric: MetricId, now: DateTime<Utc>) -> Option<WindowAverage> {
        self.windows
            .get_mut(&metric)
            .and_then(|window| window.flush(now))
    }

    pub fn window(&self, metric: MetricId) -> Option<&Window> {
        self.windows.get(&metric)
    }
}

/// Short flow window that reports bursts of activity between full flushes.
#[derive(Debug, Clone)]
pub struct BurstWindow {
    length: Duration,
    last_evaluated: DateTime<Utc>,
    samples: Vec<f64>,
}

impl BurstWindow {
    pub fn new(length: Duration, opened_at: DateTime<Utc>) -> Self {
        Self {
            length,
            last_evaluated: opened_at,
            samples: Vec::new(),
        }
    }

    pub fn accumulate(&mut self, value: Option<f64>) {
        if let Some(value) = value {
            self.samples.push(value);
        }
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.samples.clear();
        self.last_evaluated = now;
    }

    /// Evaluates the burst window once its length has elapsed. The window is
    /// reset on every evaluation; an average is reported only for a strictly
    /// positive mean.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<WindowAverage> {
        if elapsed(self.last_evaluated, now) < self.length {
            return None;
        }
        let average = mean(&self.samples).map(|mean| WindowAverage {
            mean,
            count: self.samples.len(),
            mode: None,
        });
        self.reset(now);
        average.filter(|average| average.mean > 0.0)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}
