//! Metrics registry
//!
//! A process-wide registry behind a mutex, recording admission latency,
//! reservation backlog, resolver actions, and budget usage. Rendering uses
//! the Prometheus text exposition format with stable, sorted label output;
//! the HTTP binding lives outside the core.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use once_cell::sync::Lazy;

/// Fixed histogram buckets for admission latency, in seconds.
pub const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));

/// A cumulative histogram with the fixed latency bucket layout.
#[derive(Clone, Debug)]
pub struct Histogram {
    /// Upper bucket bounds
    pub buckets: Vec<f64>,
    /// Cumulative observation counts per bucket
    pub counts: Vec<u64>,
    /// Total observations
    pub count: u64,
    /// Sum of observed values
    pub sum: f64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: LATENCY_BUCKETS.to_vec(),
            counts: vec![0; LATENCY_BUCKETS.len()],
            count: 0,
            sum: 0.0,
        }
    }
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        for (i, bound) in self.buckets.iter().enumerate() {
            if value <= *bound {
                self.counts[i] += 1;
            }
        }
    }
}

/// Identifies a budget usage gauge entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct BudgetKey {
    /// Budget owner
    pub owner: String,
    /// Budget name
    pub budget: String,
    /// Envelope name
    pub envelope: String,
    /// GPU flavor
    pub flavor: String,
}

/// Owned / borrowed / spare concurrency for one envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BudgetUsage {
    /// Concurrency paid by the owner for itself
    pub owned: f64,
    /// Concurrency lent out to borrowers
    pub borrowed: f64,
    /// Concurrency held as spares
    pub spare: f64,
}

#[derive(Default)]
struct Registry {
    admission_latency: BTreeMap<String, BTreeMap<String, Histogram>>,
    reservation_backlog: BTreeMap<String, f64>,
    resolver_actions: BTreeMap<String, f64>,
    budget_usage: BTreeMap<BudgetKey, BudgetUsage>,
    spare_usage: BTreeMap<String, f64>,
}

/// A copy of the current metrics state, for inspection and tests.
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    /// Admission latency histograms keyed by flavor then result
    pub admission_latency: BTreeMap<String, BTreeMap<String, Histogram>>,
    /// Reservation backlog seconds keyed by flavor
    pub reservation_backlog: BTreeMap<String, f64>,
    /// Resolver action counts keyed by kind
    pub resolver_actions: BTreeMap<String, f64>,
    /// Budget usage gauges
    pub budget_usage: BTreeMap<BudgetKey, BudgetUsage>,
    /// Spare usage gauges keyed by flavor
    pub spare_usage: BTreeMap<String, f64>,
}

/// Records the duration of an admission attempt.
pub fn observe_admission(flavor: &str, result: &str, seconds: f64) {
    if flavor.is_empty() || result.is_empty() {
        return;
    }
    let mut registry = REGISTRY.lock().expect("metrics mutex poisoned");
    registry
        .admission_latency
        .entry(flavor.to_string())
        .or_default()
        .entry(result.to_string())
        .or_default()
        .observe(seconds);
}

/// Updates the backlog forecast for a flavor.
pub fn set_reservation_backlog(flavor: &str, seconds: f64) {
    if flavor.is_empty() {
        return;
    }
    let mut registry = REGISTRY.lock().expect("metrics mutex poisoned");
    registry
        .reservation_backlog
        .insert(flavor.to_string(), seconds);
}

/// Increments the resolver action counter for the kind.
pub fn inc_resolver_action(kind: &str) {
    if kind.is_empty() {
        return;
    }
    let mut registry = REGISTRY.lock().expect("metrics mutex poisoned");
    *registry.resolver_actions.entry(kind.to_string()).or_insert(0.0) += 1.0;
}

/// Publishes usage gauges for one envelope.
pub fn record_budget_usage(key: BudgetKey, usage: BudgetUsage) {
    if key.owner.is_empty() || key.budget.is_empty() || key.envelope.is_empty() {
        return;
    }
    let mut registry = REGISTRY.lock().expect("metrics mutex poisoned");
    registry.budget_usage.insert(key, usage);
}

/// Updates the aggregate spare usage gauge for a flavor.
pub fn set_spare_usage(flavor: &str, value: f64) {
    if flavor.is_empty() {
        return;
    }
    let mut registry = REGISTRY.lock().expect("metrics mutex poisoned");
    registry.spare_usage.insert(flavor.to_string(), value);
}

/// Returns a copy of the current metrics data.
pub fn snapshot() -> MetricsSnapshot {
    let registry = REGISTRY.lock().expect("metrics mutex poisoned");
    MetricsSnapshot {
        admission_latency: registry.admission_latency.clone(),
        reservation_backlog: registry.reservation_backlog.clone(),
        resolver_actions: registry.resolver_actions.clone(),
        budget_usage: registry.budget_usage.clone(),
        spare_usage: registry.spare_usage.clone(),
    }
}

/// Clears all recorded metrics.
pub fn reset() {
    let mut registry = REGISTRY.lock().expect("metrics mutex poisoned");
    *registry = Registry::default();
}

/// Renders the metrics in Prometheus text exposition format.
pub fn render_prometheus() -> String {
    let snap = snapshot();
    let mut out = String::new();

    write_header(
        &mut out,
        "jobtree_runs_admission_latency_seconds",
        "Time to admit or reserve a run.",
        "histogram",
    );
    for (flavor, by_result) in &snap.admission_latency {
        for (result, hist) in by_result {
            for (i, bound) in hist.buckets.iter().enumerate() {
                write_sample(
                    &mut out,
                    "jobtree_runs_admission_latency_seconds_bucket",
                    &[
                        ("flavor", flavor.as_str()),
                        ("le", &format_float(*bound)),
                        ("result", result.as_str()),
                    ],
                    &hist.counts[i].to_string(),
                );
            }
            write_sample(
                &mut out,
                "jobtree_runs_admission_latency_seconds_bucket",
                &[
                    ("flavor", flavor.as_str()),
                    ("le", "+Inf"),
                    ("result", result.as_str()),
                ],
                &hist.count.to_string(),
            );
            write_sample(
                &mut out,
                "jobtree_runs_admission_latency_seconds_count",
                &[("flavor", flavor.as_str()), ("result", result.as_str())],
                &hist.count.to_string(),
            );
            write_sample(
                &mut out,
                "jobtree_runs_admission_latency_seconds_sum",
                &[("flavor", flavor.as_str()), ("result", result.as_str())],
                &format_float(hist.sum),
            );
        }
    }

    write_header(
        &mut out,
        "jobtree_reservations_backlog_seconds",
        "Forecasted backlog until pending reservations can start.",
        "gauge",
    );
    for (flavor, seconds) in &snap.reservation_backlog {
        write_sample(
            &mut out,
            "jobtree_reservations_backlog_seconds",
            &[("flavor", flavor.as_str())],
            &format_float(*seconds),
        );
    }

    write_header(
        &mut out,
        "jobtree_resolver_actions_total",
        "Structural actions performed by the resolver.",
        "counter",
    );
    for (kind, count) in &snap.resolver_actions {
        write_sample(
            &mut out,
            "jobtree_resolver_actions_total",
            &[("kind", kind.as_str())],
            &format_float(*count),
        );
    }

    write_header(
        &mut out,
        "jobtree_budgets_concurrency_gpus",
        "Current concurrency split into owned/borrowed/spare per envelope.",
        "gauge",
    );
    for (key, usage) in &snap.budget_usage {
        for (class, value) in [
            ("owned", usage.owned),
            ("borrowed", usage.borrowed),
            ("spare", usage.spare),
        ] {
            write_sample(
                &mut out,
                "jobtree_budgets_concurrency_gpus",
                &[
                    ("budget", key.budget.as_str()),
                    ("class", class),
                    ("envelope", key.envelope.as_str()),
                    ("flavor", key.flavor.as_str()),
                    ("owner", key.owner.as_str()),
                ],
                &format_float(value),
            );
        }
    }

    write_header(
        &mut out,
        "jobtree_spares_concurrency_gpus",
        "Aggregate spare usage across envelopes.",
        "gauge",
    );
    for (flavor, value) in &snap.spare_usage {
        write_sample(
            &mut out,
            "jobtree_spares_concurrency_gpus",
            &[("flavor", flavor.as_str())],
            &format_float(*value),
        );
    }

    out
}

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Labels must already be sorted by key; the callers pass them that way.
fn write_sample(out: &mut String, name: &str, labels: &[(&str, &str)], value: &str) {
    if labels.is_empty() {
        let _ = writeln!(out, "{name} {value}");
        return;
    }
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
        .collect();
    let _ = writeln!(out, "{name}{{{}}} {value}", rendered.join(","));
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

fn format_float(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    format!("{value}")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // The registry is process-wide, so these tests use unique label values
    // instead of resetting it out from under parallel tests.

    #[test]
    fn histogram_buckets_are_cumulative() {
        observe_admission("flavor-hist", "bound", 0.003);
        observe_admission("flavor-hist", "bound", 0.03);
        observe_admission("flavor-hist", "bound", 20.0);

        let snap = snapshot();
        let hist = &snap.admission_latency["flavor-hist"]["bound"];
        assert_eq!(hist.count, 3);
        // 0.003 lands in every bucket, 0.03 from 0.05 upward, 20.0 in none.
        assert_eq!(hist.counts[0], 1); // le 0.005
        assert_eq!(hist.counts[3], 2); // le 0.05
        assert_eq!(hist.counts[10], 2); // le 10
        assert!((hist.sum - 20.033).abs() < 1e-9);
    }

    #[test]
    fn gauges_overwrite_counters_accumulate() {
        set_reservation_backlog("flavor-gauge", 900.0);
        set_reservation_backlog("flavor-gauge", 60.0);
        inc_resolver_action("TestKind");
        inc_resolver_action("TestKind");

        let snap = snapshot();
        assert_eq!(snap.reservation_backlog["flavor-gauge"], 60.0);
        assert!(snap.resolver_actions["TestKind"] >= 2.0);
    }

    #[test]
    fn prometheus_rendering_is_stable_and_escaped() {
        observe_admission("flavor-render", "bound", 0.02);
        set_reservation_backlog("flavor-render", 300.0);
        record_budget_usage(
            BudgetKey {
                owner: "org:\"render\"".to_string(),
                budget: "render-budget".to_string(),
                envelope: "west".to_string(),
                flavor: "flavor-render".to_string(),
            },
            BudgetUsage {
                owned: 4.0,
                borrowed: 2.0,
                spare: 1.0,
            },
        );
        set_spare_usage("flavor-render", 1.0);

        let text = render_prometheus();
        assert!(text.contains("# TYPE jobtree_runs_admission_latency_seconds histogram"));
        assert!(text.contains(
            "jobtree_runs_admission_latency_seconds_bucket{flavor=\"flavor-render\",le=\"0.025\",result=\"bound\"} 1"
        ));
        assert!(text
            .contains("jobtree_reservations_backlog_seconds{flavor=\"flavor-render\"} 300"));
        assert!(text.contains(
            "jobtree_budgets_concurrency_gpus{budget=\"render-budget\",class=\"owned\",envelope=\"west\",flavor=\"flavor-render\",owner=\"org:\\\"render\\\"\"} 4"
        ));
        assert!(text.contains("jobtree_spares_concurrency_gpus{flavor=\"flavor-render\"} 1"));
    }

    #[test]
    fn empty_labels_are_ignored() {
        observe_admission("", "bound", 0.1);
        observe_admission("flavor-empty-result", "", 0.1);
        set_reservation_backlog("", 1.0);
        inc_resolver_action("");
        let after = snapshot();
        assert!(!after.admission_latency.contains_key(""));
        assert!(!after.admission_latency.contains_key("flavor-empty-result"));
        assert!(!after.reservation_backlog.contains_key(""));
        assert!(!after.resolver_actions.contains_key(""));
    }
}
