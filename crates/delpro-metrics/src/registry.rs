//! Metric set backed by a `prometheus-client` registry.
//!
//! A [`MetricSet`] registers one labeled family per catalog entry. Cloning a
//! set shares its state; [`MetricSet::new`] creates an isolated one with its
//! own registry, which is what historical replay relies on.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::error::{MetricsError, Result};
use crate::model::{LabelSet, Metric, MetricKind, DURATION_BUCKETS};

/// Floating-point gauge, as every catalog gauge carries liters, seconds or counts.
pub type FloatGauge = Gauge<f64, AtomicU64>;

/// Identity of one series: a catalog metric plus its label pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    metric: Metric,
    labels: LabelSet,
}

impl SeriesKey {
    /// Creates a series key.
    #[must_use]
    pub const fn new(metric: Metric, labels: LabelSet) -> Self {
        Self { metric, labels }
    }

    /// Returns the catalog metric.
    #[must_use]
    pub const fn metric(&self) -> Metric {
        self.metric
    }

    /// Returns the label pairs.
    #[must_use]
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }
}

fn duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.into_iter())
}

/// The registered family of one catalog entry.
enum MetricFamily {
    Counter(Family<LabelSet, Counter>),
    Gauge(Family<LabelSet, FloatGauge>),
    Histogram(Family<LabelSet, Histogram, fn() -> Histogram>),
}

impl MetricFamily {
    fn register(registry: &mut Registry, metric: Metric) -> Self {
        let name = metric.registered_name();
        match metric.kind() {
            MetricKind::Counter => {
                let family = Family::<LabelSet, Counter>::default();
                registry.register(name, metric.help(), family.clone());
                Self::Counter(family)
            }
            MetricKind::Gauge => {
                let family = Family::<LabelSet, FloatGauge>::default();
                registry.register(name, metric.help(), family.clone());
                Self::Gauge(family)
            }
            // Only the session duration is a histogram.
            MetricKind::Histogram => {
                let family: Family<LabelSet, Histogram, fn() -> Histogram> =
                    Family::new_with_constructor(duration_histogram);
                registry.register(name, metric.help(), family.clone());
                Self::Histogram(family)
            }
        }
    }

    const fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Histogram(_) => MetricKind::Histogram,
        }
    }

    /// Materialises the series at its zero value.
    fn create(&self, labels: &LabelSet) {
        match self {
            Self::Counter(family) => drop(family.get_or_create(labels)),
            Self::Gauge(family) => drop(family.get_or_create(labels)),
            Self::Histogram(family) => drop(family.get_or_create(labels)),
        }
    }
}

struct Inner {
    registry: Registry,
    /// Indexed by [`Metric::index`].
    families: Vec<MetricFamily>,
    /// Series materialised so far.
    series: RwLock<BTreeSet<SeriesKey>>,
}

/// Shared set of labeled counter, gauge and histogram families.
#[derive(Clone)]
pub struct MetricSet {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MetricSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricSet")
            .field("series", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for MetricSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSet {
    /// Creates an isolated metric set with every catalog family registered.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let families = Metric::ALL
            .iter()
            .map(|metric| MetricFamily::register(&mut registry, *metric))
            .collect();

        Self {
            inner: Arc::new(Inner {
                registry,
                families,
                series: RwLock::new(BTreeSet::new()),
            }),
        }
    }

    /// Returns the number of series in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.series.read().len()
    }

    /// Returns true if the set holds no series.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.series.read().is_empty()
    }

    /// Returns true if the series has been materialised.
    #[must_use]
    pub fn contains(&self, key: &SeriesKey) -> bool {
        self.inner.series.read().contains(key)
    }

    fn family(&self, metric: Metric) -> &MetricFamily {
        &self.inner.families[metric.index()]
    }

    fn track(&self, key: &SeriesKey) -> bool {
        if self.contains(key) {
            return false;
        }
        self.inner.series.write().insert(key.clone())
    }

    fn mismatch(key: &SeriesKey, expected: MetricKind, family: &MetricFamily) -> MetricsError {
        MetricsError::KindMismatch {
            metric: key.metric.name(),
            expected,
            actual: family.kind(),
        }
    }

    /// Increments a counter series by one.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::KindMismatch` if the metric is not a counter.
    pub fn inc_counter(&self, key: &SeriesKey) -> Result<()> {
        match self.family(key.metric) {
            MetricFamily::Counter(family) => {
                family.get_or_create(&key.labels).inc();
                self.track(key);
                Ok(())
            }
            other => Err(Self::mismatch(key, MetricKind::Counter, other)),
        }
    }

    fn gauge_family(&self, key: &SeriesKey) -> Result<&Family<LabelSet, FloatGauge>> {
        match self.family(key.metric) {
            MetricFamily::Gauge(family) => Ok(family),
            other => Err(Self::mismatch(key, MetricKind::Gauge, other)),
        }
    }

    /// Sets a gauge series.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::KindMismatch` if the metric is not a gauge.
    pub fn set_gauge(&self, key: &SeriesKey, value: f64) -> Result<()> {
        self.gauge_family(key)?.get_or_create(&key.labels).set(value);
        self.track(key);
        Ok(())
    }

    /// Adds to a gauge series.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::KindMismatch` if the metric is not a gauge.
    pub fn add_gauge(&self, key: &SeriesKey, delta: f64) -> Result<()> {
        self.gauge_family(key)?.get_or_create(&key.labels).inc_by(delta);
        self.track(key);
        Ok(())
    }

    /// Increments a gauge series by one.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::KindMismatch` if the metric is not a gauge.
    pub fn inc_gauge(&self, key: &SeriesKey) -> Result<()> {
        self.add_gauge(key, 1.0)
    }

    /// Records an observation in a histogram series.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::KindMismatch` if the metric is not a histogram.
    pub fn observe(&self, key: &SeriesKey, observation: f64) -> Result<()> {
        match self.family(key.metric) {
            MetricFamily::Histogram(family) => {
                family.get_or_create(&key.labels).observe(observation);
                self.track(key);
                Ok(())
            }
            other => Err(Self::mismatch(key, MetricKind::Histogram, other)),
        }
    }

    /// Creates the series at zero if it does not exist yet.
    ///
    /// Returns true if the series was created.
    pub fn ensure(&self, key: &SeriesKey) -> bool {
        if self.contains(key) {
            return false;
        }
        self.family(key.metric).create(&key.labels);
        self.track(key)
    }

    /// Returns the value of a counter series.
    #[must_use]
    pub fn counter(&self, key: &SeriesKey) -> Option<u64> {
        if !self.contains(key) {
            return None;
        }
        match self.family(key.metric) {
            MetricFamily::Counter(family) => Some(family.get_or_create(&key.labels).get()),
            _ => None,
        }
    }

    /// Returns the value of a gauge series.
    #[must_use]
    pub fn gauge(&self, key: &SeriesKey) -> Option<f64> {
        if !self.contains(key) {
            return None;
        }
        match self.family(key.metric) {
            MetricFamily::Gauge(family) => Some(family.get_or_create(&key.labels).get()),
            _ => None,
        }
    }

    /// Returns the materialised series, in key order.
    #[must_use]
    pub fn keys(&self) -> Vec<SeriesKey> {
        self.inner.series.read().iter().cloned().collect()
    }

    /// Encodes every family in the text exposition format.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::Encode` if the encoder fails.
    pub fn encode_to(&self, out: &mut String) -> Result<()> {
        encode(out, &self.inner.registry)?;
        Ok(())
    }

    /// Encodes every family for a scrape.
    ///
    /// Families without series still carry their `# HELP` and `# TYPE` lines.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = self.encode_to(&mut buffer) {
            tracing::error!(error = %e, "failed to encode metrics");
            return String::new();
        }
        buffer
    }
}
