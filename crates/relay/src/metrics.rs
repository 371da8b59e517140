use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use crate::ws::registry::ConnectionRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Default)]
pub struct RelayMetrics {
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    connections_opened_total: AtomicU64,
    connections_closed_total: AtomicU64,
    auth_failures_total: AtomicU64,
    session_faults_total: AtomicU64,
    messages_relayed_total: AtomicU64,
    messages_undelivered_total: AtomicU64,
    malformed_envelopes_total: AtomicU64,
    delivery_failures_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn increment_connections_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.connections_opened_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn increment_connections_closed(faulted: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.connections_closed_total.fetch_add(1, Ordering::Relaxed);
        if faulted {
            metrics.session_faults_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub fn increment_auth_failures() {
    if let Some(metrics) = global_metrics() {
        metrics.auth_failures_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_relay_outcome(delivered: bool) {
    if let Some(metrics) = global_metrics() {
        let counter = if delivered {
            &metrics.messages_relayed_total
        } else {
            &metrics.messages_undelivered_total
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn increment_malformed_envelopes() {
    if let Some(metrics) = global_metrics() {
        metrics.malformed_envelopes_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn add_delivery_failures(count: usize) {
    if count == 0 {
        return;
    }
    if let Some(metrics) = global_metrics() {
        metrics.delivery_failures_total.fetch_add(count as u64, Ordering::Relaxed);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    /// Render counters plus live registry gauges in Prometheus text format.
    pub fn render_prometheus(&self, registry: &ConnectionRegistry) -> String {
        let mut output = String::new();

        append_http_family(
            &mut output,
            "relay_request_rate_total",
            "Total HTTP requests by endpoint.",
            &self.request_rate_total,
        );
        append_http_family(
            &mut output,
            "relay_request_errors_total",
            "Total HTTP error responses by endpoint.",
            &self.request_errors_total,
        );
        append_http_family(
            &mut output,
            "relay_request_duration_ms_sum",
            "Sum of HTTP request latency in milliseconds by endpoint.",
            &self.request_duration_sum_ms,
        );

        for (name, help, counter) in [
            (
                "relay_connections_opened_total",
                "WebSocket connections that authenticated and registered.",
                &self.connections_opened_total,
            ),
            (
                "relay_connections_closed_total",
                "Registered WebSocket connections that have closed.",
                &self.connections_closed_total,
            ),
            (
                "relay_auth_failures_total",
                "WebSocket handshakes closed for a missing or rejected credential.",
                &self.auth_failures_total,
            ),
            (
                "relay_session_faults_total",
                "Sessions closed with an internal error.",
                &self.session_faults_total,
            ),
            (
                "relay_messages_relayed_total",
                "Envelopes relayed to an online recipient.",
                &self.messages_relayed_total,
            ),
            (
                "relay_messages_undelivered_total",
                "Envelopes acknowledged with delivered=false.",
                &self.messages_undelivered_total,
            ),
            (
                "relay_malformed_envelopes_total",
                "Inbound envelopes answered with an error event.",
                &self.malformed_envelopes_total,
            ),
            (
                "relay_delivery_failures_total",
                "Recipient connections evicted after a failed send.",
                &self.delivery_failures_total,
            ),
        ] {
            output.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n"));
            output.push_str(&format!("{name} {}\n", counter.load(Ordering::Relaxed)));
        }

        output.push_str("# HELP relay_online_users Users with at least one live connection.\n");
        output.push_str("# TYPE relay_online_users gauge\n");
        output.push_str(&format!("relay_online_users {}\n", registry.online_users()));

        output.push_str("# HELP relay_live_connections Registered WebSocket connections.\n");
        output.push_str("# TYPE relay_live_connections gauge\n");
        output.push_str(&format!("relay_live_connections {}\n", registry.total_connections()));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    let segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if segment.chars().all(|character| character.is_ascii_digit()) {
                "{number}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>();

    format!("/{}", segments.join("/"))
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_http_family(
    output: &mut String,
    metric_name: &str,
    help: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    output.push_str(&format!("# HELP {metric_name} {help}\n# TYPE {metric_name} counter\n"));

    let guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
