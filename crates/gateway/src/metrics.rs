use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct GatewayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_messages_total: Mutex<HashMap<String, u64>>,
    ws_message_errors_total: Mutex<HashMap<String, u64>>,
    auth_rejections_total: Mutex<HashMap<String, u64>>,
    outbox_depth: Mutex<HashMap<String, i64>>,
    active_connections: AtomicI64,
    dropped_events_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<GatewayMetrics>> = OnceLock::new();

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_messages_total: Mutex::new(HashMap::new()),
            ws_message_errors_total: Mutex::new(HashMap::new()),
            auth_rejections_total: Mutex::new(HashMap::new()),
            outbox_depth: Mutex::new(HashMap::new()),
            active_connections: AtomicI64::new(0),
            dropped_events_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<GatewayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<GatewayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_message(message_type: &str, is_error: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_message(message_type, is_error);
    }
}

pub fn record_auth_rejection(kind: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_auth_rejection(kind);
    }
}

pub fn set_outbox_depth_for_user(user_id: Uuid, depth: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.set_outbox_depth_for_user(user_id, depth);
    }
}

pub fn increment_dropped_events() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_dropped_events();
    }
}

pub fn connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_opened();
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_closed();
    }
}

impl GatewayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_message(&self, message_type: &str, is_error: bool) {
        let label = normalize_label(message_type);
        increment_label_counter(&self.ws_messages_total, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_message_errors_total, &label, 1);
        }
    }

    pub fn record_auth_rejection(&self, kind: &str) {
        increment_label_counter(&self.auth_rejections_total, &normalize_label(kind), 1);
    }

    pub fn set_outbox_depth_for_user(&self, user_id: Uuid, depth: i64) {
        let mut guard = self.outbox_depth.lock().expect("metrics map lock poisoned");
        let label = user_id.to_string();
        if depth <= 0 {
            guard.remove(&label);
        } else {
            guard.insert(label, depth);
        }
    }

    pub fn increment_dropped_events(&self) {
        self.dropped_events_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP gateway_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE gateway_request_rate_total counter\n");
        append_counter_lines(&mut output, "gateway_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP gateway_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE gateway_request_errors_total counter\n");
        append_counter_lines(
            &mut output,
            "gateway_request_errors_total",
            &self.request_errors_total,
        );

        output.push_str("# HELP gateway_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE gateway_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "gateway_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP gateway_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE gateway_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "gateway_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str(
            "# HELP gateway_ws_messages_total Total websocket frames sent by message type.\n",
        );
        output.push_str("# TYPE gateway_ws_messages_total counter\n");
        append_label_counter_lines(
            &mut output,
            "gateway_ws_messages_total",
            "message_type",
            &self.ws_messages_total,
        );

        output.push_str(
            "# HELP gateway_ws_message_errors_total Total websocket frame errors by message type.\n",
        );
        output.push_str("# TYPE gateway_ws_message_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "gateway_ws_message_errors_total",
            "message_type",
            &self.ws_message_errors_total,
        );

        output.push_str(
            "# HELP gateway_auth_rejections_total Rejected connection attempts by internal cause.\n",
        );
        output.push_str("# TYPE gateway_auth_rejections_total counter\n");
        append_label_counter_lines(
            &mut output,
            "gateway_auth_rejections_total",
            "kind",
            &self.auth_rejections_total,
        );

        output.push_str("# HELP gateway_outbox_depth Queued undelivered events per user.\n");
        output.push_str("# TYPE gateway_outbox_depth gauge\n");
        append_outbox_depth_lines(&mut output, &self.outbox_depth);

        output.push_str("# HELP gateway_active_connections Currently registered connections.\n");
        output.push_str("# TYPE gateway_active_connections gauge\n");
        output.push_str(&format!(
            "gateway_active_connections {}\n",
            self.active_connections.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP gateway_dropped_events_total Events dropped after exhausting delivery attempts.\n",
        );
        output.push_str("# TYPE gateway_dropped_events_total counter\n");
        output.push_str(&format!(
            "gateway_dropped_events_total {}\n",
            self.dropped_events_total.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
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

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    if guard.is_empty() {
        return;
    }

    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn append_outbox_depth_lines(output: &mut String, map: &Mutex<HashMap<String, i64>>) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_user, _), (right_user, _)| left_user.cmp(right_user));
    for (user_id, value) in entries {
        output.push_str(&format!(
            "gateway_outbox_depth{{user_id=\"{}\"}} {value}\n",
            escape_label_value(user_id),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
