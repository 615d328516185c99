//! Metric families, the registry that owns them, and the four-instrument
//! [`MetricSet`] every instrumented handler reports into.
//!
//! # Shape
//!
//! A family is one metric name with one label dimension. Each distinct label
//! value gets its own atomic cell, created on first use and kept for the life
//! of the process. Callers never touch cells directly: `with_label_values`
//! hands out a [`metrics`] crate handle (`Counter`, `Gauge`, `Histogram`)
//! backed by the cell, so every update is a single atomic operation and no
//! lock is held on the hot path.
//!
//! ```text
//! Registry ── "example_onboarding_calls_total" ── CounterVec
//!                                                  ├─ method="start"  → AtomicU64
//!                                                  └─ method="finish" → AtomicU64
//! ```
//!
//! # Registration
//!
//! Names are unique per registry. A second registration under an existing
//! name is refused with [`RegistryError::AlreadyRegistered`].
//! [`MetricSet::must_register`] turns that refusal into a panic: a metric
//! collision is a startup defect, never a per-request condition.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use ::metrics::atomics::AtomicU64;
use ::metrics::{Counter, Gauge, Histogram, HistogramFn};

use crate::config::Config;

/// Upper bounds used when no buckets are configured.
pub const DEFAULT_BUCKETS: &[f64] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// The single label every [`MetricSet`] instrument is keyed by.
pub const METHOD_LABEL: &str = "method";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("metric `{name}` is already registered")]
    AlreadyRegistered { name: String },
    #[error("invalid metric or label name `{name}`")]
    InvalidName { name: String },
    #[error("histogram `{name}` needs finite, strictly increasing buckets")]
    InvalidBuckets { name: String },
}

// ── Opts ──────────────────────────────────────────────────────────────────────

/// Naming and help text for a metric family.
///
/// The registered name is `{namespace}_{subsystem}_{name}`, skipping empty
/// parts.
#[derive(Debug, Clone, Default)]
pub struct Opts {
    pub namespace: String,
    pub subsystem: String,
    pub name: String,
    pub help: String,
}

impl Opts {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self { name: name.into(), help: help.into(), ..Self::default() }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = subsystem.into();
        self
    }

    pub fn fq_name(&self) -> String {
        [self.namespace.as_str(), self.subsystem.as_str(), self.name.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("_")
    }
}

#[derive(Debug)]
struct Desc {
    name: String,
    help: String,
    label: String,
}

impl Desc {
    fn new(opts: &Opts, label: &str) -> Result<Self, RegistryError> {
        let name = opts.fq_name();
        if !valid_name(&name, true) {
            return Err(RegistryError::InvalidName { name });
        }
        if !valid_name(label, false) {
            return Err(RegistryError::InvalidName { name: label.to_owned() });
        }
        Ok(Self { name, help: opts.help.clone(), label: label.to_owned() })
    }
}

/// `[a-zA-Z_:][a-zA-Z0-9_:]*` for metric names; labels may not use `:`.
fn valid_name(name: &str, allow_colon: bool) -> bool {
    let ok = |c: char, first: bool| {
        c.is_ascii_alphabetic()
            || c == '_'
            || (allow_colon && c == ':')
            || (!first && c.is_ascii_digit())
    };
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if ok(c, true) => chars.all(|c| ok(c, false)),
        _ => false,
    }
}

// ── Per-label storage ─────────────────────────────────────────────────────────

/// Label value → cell. Cells are never removed.
struct Cells<C> {
    desc: Desc,
    cells: RwLock<HashMap<String, Arc<C>>>,
}

impl<C> Cells<C> {
    fn new(desc: Desc) -> Self {
        Self { desc, cells: RwLock::new(HashMap::new()) }
    }

    fn get_or_insert(&self, label_value: &str, init: impl FnOnce() -> C) -> Arc<C> {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(cell) = cells.get(label_value) {
            return Arc::clone(cell);
        }
        drop(cells);
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cells.entry(label_value.to_owned()).or_insert_with(|| Arc::new(init())))
    }

    fn get(&self, label_value: &str) -> Option<Arc<C>> {
        self.cells.read().unwrap_or_else(PoisonError::into_inner).get(label_value).cloned()
    }

    /// Cells sorted by label value, for stable exposition output.
    fn sorted(&self) -> Vec<(String, Arc<C>)> {
        let mut out: Vec<_> = self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

// ── CounterVec ────────────────────────────────────────────────────────────────

/// Monotonic counters keyed by one label.
#[derive(Clone)]
pub struct CounterVec(Arc<Cells<AtomicU64>>);

impl CounterVec {
    pub fn new(opts: Opts, label: &str) -> Result<Self, RegistryError> {
        Ok(Self(Arc::new(Cells::new(Desc::new(&opts, label)?))))
    }

    pub fn with_label_values(&self, value: &str) -> Counter {
        Counter::from_arc(self.0.get_or_insert(value, || AtomicU64::new(0)))
    }

    /// Current count for `value`; zero if never touched.
    pub fn get(&self, value: &str) -> u64 {
        self.0.get(value).map_or(0, |c| c.load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.0.desc.name
    }
}

// ── GaugeVec ──────────────────────────────────────────────────────────────────

/// Gauges keyed by one label. Values are `f64` stored as bits.
#[derive(Clone)]
pub struct GaugeVec(Arc<Cells<AtomicU64>>);

impl GaugeVec {
    pub fn new(opts: Opts, label: &str) -> Result<Self, RegistryError> {
        Ok(Self(Arc::new(Cells::new(Desc::new(&opts, label)?))))
    }

    pub fn with_label_values(&self, value: &str) -> Gauge {
        Gauge::from_arc(self.0.get_or_insert(value, || AtomicU64::new(0.0f64.to_bits())))
    }

    pub fn get(&self, value: &str) -> f64 {
        self.0.get(value).map_or(0.0, |g| f64::from_bits(g.load(Ordering::Acquire)))
    }

    pub fn name(&self) -> &str {
        &self.0.desc.name
    }
}

// ── HistogramVec ──────────────────────────────────────────────────────────────

/// One histogram's state. Bucket counts are per-bucket, not cumulative.
struct HistogramCell {
    bounds: Arc<[f64]>,
    buckets: Box<[AtomicU64]>,
    count: AtomicU64,
    sum: AtomicU64,
}

impl HistogramCell {
    fn new(bounds: Arc<[f64]>) -> Self {
        let buckets = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self { bounds, buckets, count: AtomicU64::new(0), sum: AtomicU64::new(0.0f64.to_bits()) }
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = 0;
        let buckets = self.bounds
            .iter()
            .zip(self.buckets.iter())
            .map(|(bound, n)| {
                cumulative += n.load(Ordering::Acquire);
                (*bound, cumulative)
            })
            .collect();
        HistogramSnapshot {
            count: self.count.load(Ordering::Acquire),
            sum: f64::from_bits(self.sum.load(Ordering::Acquire)),
            buckets,
        }
    }
}

impl HistogramFn for HistogramCell {
    fn record(&self, value: f64) {
        // Values above the last bound only show up in `+Inf` (== count).
        if let Some(i) = self.bounds.iter().position(|bound| value <= *bound) {
            self.buckets[i].fetch_add(1, Ordering::AcqRel);
        }
        let _ = self.sum.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            Some((f64::from_bits(bits) + value).to_bits())
        });
        self.count.fetch_add(1, Ordering::AcqRel);
    }
}

/// Point-in-time view of one histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    /// `(upper bound, cumulative count)` pairs, excluding `+Inf`.
    pub buckets: Vec<(f64, u64)>,
}

/// Histograms keyed by one label, sharing one set of bucket bounds.
#[derive(Clone)]
pub struct HistogramVec {
    cells: Arc<Cells<HistogramCell>>,
    bounds: Arc<[f64]>,
}

impl HistogramVec {
    pub fn new(opts: Opts, label: &str, buckets: &[f64]) -> Result<Self, RegistryError> {
        let desc = Desc::new(&opts, label)?;
        let increasing = buckets.windows(2).all(|w| w[0] < w[1]);
        if buckets.is_empty() || !increasing || buckets.iter().any(|b| !b.is_finite()) {
            return Err(RegistryError::InvalidBuckets { name: desc.name });
        }
        Ok(Self { cells: Arc::new(Cells::new(desc)), bounds: buckets.into() })
    }

    pub fn with_label_values(&self, value: &str) -> Histogram {
        let bounds = Arc::clone(&self.bounds);
        Histogram::from_arc(self.cells.get_or_insert(value, || HistogramCell::new(bounds)))
    }

    pub fn snapshot(&self, value: &str) -> Option<HistogramSnapshot> {
        self.cells.get(value).map(|h| h.snapshot())
    }

    pub fn name(&self) -> &str {
        &self.cells.desc.name
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Anything a [`Registry`] can hold.
#[derive(Clone)]
pub enum Collector {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
}

impl Collector {
    fn name(&self) -> &str {
        match self {
            Self::Counter(c) => c.name(),
            Self::Gauge(g) => g.name(),
            Self::Histogram(h) => h.name(),
        }
    }
}

impl From<CounterVec> for Collector {
    fn from(c: CounterVec) -> Self {
        Self::Counter(c)
    }
}

impl From<GaugeVec> for Collector {
    fn from(g: GaugeVec) -> Self {
        Self::Gauge(g)
    }
}

impl From<HistogramVec> for Collector {
    fn from(h: HistogramVec) -> Self {
        Self::Histogram(h)
    }
}

/// Owns metric families by name. Clones share the same families.
///
/// Create one at startup and pass it to whatever needs to register or
/// render. There is no hidden global instance.
#[derive(Clone, Default)]
pub struct Registry {
    families: Arc<Mutex<BTreeMap<String, Collector>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, collector: impl Into<Collector>) -> Result<(), RegistryError> {
        self.register_all([collector.into()])
    }

    /// Registers every collector, or none of them if any name is taken.
    pub fn register_all(
        &self,
        collectors: impl IntoIterator<Item = Collector>,
    ) -> Result<(), RegistryError> {
        let collectors: Vec<Collector> = collectors.into_iter().collect();
        let mut families = self.families.lock().unwrap_or_else(PoisonError::into_inner);

        for (i, c) in collectors.iter().enumerate() {
            let name = c.name();
            let repeated = collectors[..i].iter().any(|prev| prev.name() == name);
            if repeated || families.contains_key(name) {
                return Err(RegistryError::AlreadyRegistered { name: name.to_owned() });
            }
        }
        for c in collectors {
            families.insert(c.name().to_owned(), c);
        }
        Ok(())
    }

    /// Registered family names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.families.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    /// Renders every family in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let families = self.families.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for collector in families.values() {
            match collector {
                Collector::Counter(c) => {
                    let desc = &c.0.desc;
                    header(&mut out, desc, "counter");
                    for (value, cell) in c.0.sorted() {
                        let v = cell.load(Ordering::Acquire) as f64;
                        sample(&mut out, &desc.name, &desc.label, &value, None, v);
                    }
                }
                Collector::Gauge(g) => {
                    let desc = &g.0.desc;
                    header(&mut out, desc, "gauge");
                    for (value, cell) in g.0.sorted() {
                        let v = f64::from_bits(cell.load(Ordering::Acquire));
                        sample(&mut out, &desc.name, &desc.label, &value, None, v);
                    }
                }
                Collector::Histogram(h) => {
                    let desc = &h.cells.desc;
                    header(&mut out, desc, "histogram");
                    let bucket = format!("{}_bucket", desc.name);
                    let sum = format!("{}_sum", desc.name);
                    let count = format!("{}_count", desc.name);
                    for (value, cell) in h.cells.sorted() {
                        let snap = cell.snapshot();
                        let total = snap.count as f64;
                        for (bound, n) in &snap.buckets {
                            let le = bound.to_string();
                            sample(&mut out, &bucket, &desc.label, &value, Some(&le), *n as f64);
                        }
                        sample(&mut out, &bucket, &desc.label, &value, Some("+Inf"), total);
                        sample(&mut out, &sum, &desc.label, &value, None, snap.sum);
                        sample(&mut out, &count, &desc.label, &value, None, total);
                    }
                }
            }
        }
        out
    }
}

fn header(out: &mut String, desc: &Desc, kind: &str) {
    let help = desc.help.replace('\\', r"\\").replace('\n', r"\n");
    let _ = writeln!(out, "# HELP {} {help}", desc.name);
    let _ = writeln!(out, "# TYPE {} {kind}", desc.name);
}

fn sample(out: &mut String, name: &str, label: &str, value: &str, le: Option<&str>, v: f64) {
    let value = value.replace('\\', r"\\").replace('"', "\\\"").replace('\n', r"\n");
    let _ = match le {
        Some(le) => writeln!(out, "{name}{{{label}=\"{value}\",le=\"{le}\"}} {v}"),
        None => writeln!(out, "{name}{{{label}=\"{value}\"}} {v}"),
    };
}

// ── MetricSet ─────────────────────────────────────────────────────────────────

/// The four instruments behind the instrumentation middleware.
///
/// | Field | Name suffix | Kind |
/// |---|---|---|
/// | `duration` | `request_duration_milliseconds` | histogram |
/// | `in_flight` | `in_flight_total` | gauge |
/// | `calls` | `calls_total` | counter |
/// | `errors` | `errors_total` | counter |
///
/// All four are keyed by [`METHOD_LABEL`]. Build once per
/// namespace/subsystem at startup and hand clones to each wrapper.
#[derive(Clone)]
pub struct MetricSet {
    pub duration: HistogramVec,
    pub in_flight: GaugeVec,
    pub calls: CounterVec,
    pub errors: CounterVec,
}

impl MetricSet {
    /// Registers the four instruments with [`DEFAULT_BUCKETS`].
    pub fn register(
        registry: &Registry,
        namespace: &str,
        subsystem: &str,
    ) -> Result<Self, RegistryError> {
        Self::register_with_buckets(registry, namespace, subsystem, DEFAULT_BUCKETS)
    }

    pub fn register_with_buckets(
        registry: &Registry,
        namespace: &str,
        subsystem: &str,
        buckets: &[f64],
    ) -> Result<Self, RegistryError> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).namespace(namespace).subsystem(subsystem)
        };

        let set = Self {
            duration: HistogramVec::new(
                opts(
                    "request_duration_milliseconds",
                    "Duration histogram of time taken to execute requests",
                ),
                METHOD_LABEL,
                buckets,
            )?,
            in_flight: GaugeVec::new(opts("in_flight_total", "Saturation levels"), METHOD_LABEL)?,
            calls: CounterVec::new(opts("calls_total", "Number of calls"), METHOD_LABEL)?,
            errors: CounterVec::new(opts("errors_total", "Number of errors"), METHOD_LABEL)?,
        };
        registry.register_all([
            set.duration.clone().into(),
            set.calls.clone().into(),
            set.in_flight.clone().into(),
            set.errors.clone().into(),
        ])?;
        Ok(set)
    }

    pub fn from_config(registry: &Registry, config: &Config) -> Result<Self, RegistryError> {
        Self::register_with_buckets(
            registry,
            &config.namespace,
            &config.subsystem,
            &config.duration_buckets,
        )
    }

    /// Like [`register`](Self::register), but a failure is fatal.
    ///
    /// # Panics
    ///
    /// Panics if any of the four names is already registered or invalid.
    pub fn must_register(registry: &Registry, namespace: &str, subsystem: &str) -> Self {
        match Self::register(registry, namespace, subsystem) {
            Ok(set) => set,
            Err(e) => panic!("metric registration failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fq_name_skips_empty_parts() {
        let opts = Opts::new("calls_total", "");
        assert_eq!(
            opts.clone().namespace("example").subsystem("onboarding").fq_name(),
            "example_onboarding_calls_total"
        );
        assert_eq!(opts.clone().subsystem("onboarding").fq_name(), "onboarding_calls_total");
        assert_eq!(Opts::new("calls_total", "").fq_name(), "calls_total");
    }

    #[test]
    fn metric_set_uses_the_documented_names() {
        let registry = Registry::new();
        MetricSet::register(&registry, "example", "onboarding").unwrap();
        assert_eq!(registry.names(), vec![
            "example_onboarding_calls_total",
            "example_onboarding_errors_total",
            "example_onboarding_in_flight_total",
            "example_onboarding_request_duration_milliseconds",
        ]);
    }

    #[test]
    fn duplicate_registration_is_refused_atomically() {
        let registry = Registry::new();
        let opts = Opts::new("calls_total", "").namespace("example").subsystem("onboarding");
        let calls = CounterVec::new(opts, "method").unwrap();
        registry.register(calls).unwrap();

        let err = MetricSet::register(&registry, "example", "onboarding").err().unwrap();
        assert_eq!(
            err,
            RegistryError::AlreadyRegistered { name: "example_onboarding_calls_total".into() }
        );
        // Nothing from the failed batch was kept.
        assert_eq!(registry.names(), vec!["example_onboarding_calls_total"]);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn must_register_twice_is_fatal() {
        let registry = Registry::new();
        MetricSet::must_register(&registry, "example", "onboarding");
        MetricSet::must_register(&registry, "example", "onboarding");
    }

    #[test]
    fn separate_registries_do_not_collide() {
        MetricSet::must_register(&Registry::new(), "example", "onboarding");
        MetricSet::must_register(&Registry::new(), "example", "onboarding");
    }

    #[test]
    fn invalid_names_and_buckets_are_rejected() {
        assert!(matches!(
            CounterVec::new(Opts::new("9lives", ""), "method"),
            Err(RegistryError::InvalidName { .. })
        ));
        assert!(matches!(
            CounterVec::new(Opts::new("ok", ""), "me:thod"),
            Err(RegistryError::InvalidName { .. })
        ));
        assert!(matches!(
            HistogramVec::new(Opts::new("h", ""), "method", &[1.0, 1.0]),
            Err(RegistryError::InvalidBuckets { .. })
        ));
        assert!(matches!(
            HistogramVec::new(Opts::new("h", ""), "method", &[]),
            Err(RegistryError::InvalidBuckets { .. })
        ));
    }

    #[test]
    fn handles_update_the_registered_cells() {
        let set = MetricSet::register(&Registry::new(), "", "svc").unwrap();

        set.calls.with_label_values("start").increment(2);
        set.in_flight.with_label_values("start").increment(3.0);
        set.in_flight.with_label_values("start").decrement(1.0);
        set.duration.with_label_values("start").record(0.02);
        set.duration.with_label_values("start").record(50.0);

        assert_eq!(set.calls.get("start"), 2);
        assert_eq!(set.calls.get("finish"), 0);
        assert_eq!(set.in_flight.get("start"), 2.0);

        let snap = set.duration.snapshot("start").unwrap();
        assert_eq!(snap.count, 2);
        assert!((snap.sum - 50.02).abs() < 1e-9);
        assert_eq!(snap.buckets[0], (0.005, 0));
        assert_eq!(snap.buckets[2], (0.025, 1));
        assert_eq!(snap.buckets.last(), Some(&(10.0, 1)));
        assert!(set.duration.snapshot("finish").is_none());
    }

    #[test]
    fn render_emits_prometheus_text() {
        let registry = Registry::new();
        let set = MetricSet::register_with_buckets(&registry, "example", "onboarding", &[1.0, 5.0])
            .unwrap();
        set.calls.with_label_values("start").increment(1);
        set.duration.with_label_values("start").record(2.0);

        let text = registry.render();
        assert!(text.contains("# HELP example_onboarding_calls_total Number of calls\n"));
        assert!(text.contains("# TYPE example_onboarding_calls_total counter\n"));
        assert!(text.contains("example_onboarding_calls_total{method=\"start\"} 1\n"));
        let duration = "example_onboarding_request_duration_milliseconds";
        assert!(text.contains(&format!("# TYPE {duration} histogram\n")));
        assert!(text.contains(&format!("{duration}_bucket{{method=\"start\",le=\"1\"}} 0\n")));
        assert!(text.contains(&format!("{duration}_bucket{{method=\"start\",le=\"5\"}} 1\n")));
        assert!(text.contains(&format!("{duration}_bucket{{method=\"start\",le=\"+Inf\"}} 1\n")));
        assert!(text.contains(&format!("{duration}_sum{{method=\"start\"}} 2\n")));
        assert!(text.contains(&format!("{duration}_count{{method=\"start\"}} 1\n")));
    }
}
