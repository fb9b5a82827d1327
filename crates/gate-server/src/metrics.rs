use metrics::{describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// 初始化 Prometheus metrics exporter
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    // 描述所有指标
    describe_metrics();

    tracing::info!("Metrics exporter started on http://{}/metrics", addr);
    Ok(())
}

/// 描述所有指标
fn describe_metrics() {
    // 请求准入
    describe_counter!(
        "gate_requests_total",
        "Gated requests by outcome (admitted or error kind)"
    );
    describe_histogram!(
        "gate_upstream_duration_seconds",
        "Upstream forwarding duration in seconds"
    );

    // 会话与令牌
    describe_counter!("gate_sessions_created_total", "Sessions created");
    describe_counter!(
        "gate_token_refresh_total",
        "Access token refresh attempts by result"
    );

    // 策略缓存
    describe_counter!(
        "gate_policy_refresh_total",
        "Policy snapshot refreshes by result"
    );
    describe_gauge!(
        "gate_policy_snapshot_version",
        "Version of the active policy snapshot"
    );
    describe_gauge!("gate_policy_rules", "Number of rules in the active snapshot");

    // 权限缓存
    describe_counter!(
        "gate_permission_lookups_total",
        "Permission lookups by the cache level that answered"
    );
    describe_counter!(
        "gate_permission_origin_calls_total",
        "Calls made to the permission origin"
    );

    // 限流
    describe_counter!(
        "gate_ratelimit_decisions_total",
        "Rate limit decisions by backend and result"
    );
}

/// 记录转发到上游的耗时
pub fn record_upstream_duration(duration_secs: f64) {
    histogram!("gate_upstream_duration_seconds", duration_secs);
}
