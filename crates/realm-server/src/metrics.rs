//! Metrics collection and export for Realm.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use realm_core::{DrainStats, LaneStats, PersistSweepStats, RosterSweepStats};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "realm_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "realm_connections_active";
    pub const FRAMES_TOTAL: &str = "realm_frames_total";
    pub const FRAMES_COALESCED: &str = "realm_frames_coalesced_total";
    pub const HANDLER_FAULTS: &str = "realm_handler_faults_total";
    pub const DRAIN_SECONDS: &str = "realm_drain_seconds";
    pub const PLAYERS_ONLINE: &str = "realm_players_online";
    pub const WORLDS_ONLINE: &str = "realm_worlds_online";
    pub const LANE_FIRINGS: &str = "realm_lane_firings";
    pub const LANE_FAULTS: &str = "realm_lane_faults";
    pub const SAVES_TOTAL: &str = "realm_saves_total";
    pub const ROSTER_CHANGES: &str = "realm_roster_changes_total";
    pub const PULSES_TOTAL: &str = "realm_pulses_total";
    pub const ERRORS_TOTAL: &str = "realm_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(
        names::FRAMES_COALESCED,
        "Frames skipped because their opcode was already handled in the same drain pass"
    );
    metrics::describe_counter!(names::HANDLER_FAULTS, "Frame handler errors and panics");
    metrics::describe_histogram!(names::DRAIN_SECONDS, "Drain pass duration in seconds");
    metrics::describe_gauge!(names::PLAYERS_ONLINE, "Players logged in to this world");
    metrics::describe_gauge!(names::WORLDS_ONLINE, "Worlds attached to the hub");
    metrics::describe_gauge!(names::LANE_FIRINGS, "Completed firings per executor lane");
    metrics::describe_gauge!(names::LANE_FAULTS, "Failed firings per executor lane");
    metrics::describe_counter!(names::SAVES_TOTAL, "Player saves by outcome");
    metrics::describe_counter!(names::ROSTER_CHANGES, "Membership changes applied by roster sweeps");
    metrics::describe_counter!(names::PULSES_TOTAL, "Simulation pulses since start");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection(kind: &'static str) {
    counter!(names::CONNECTIONS_TOTAL, "kind" => kind).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE, "kind" => kind).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection(kind: &'static str) {
    gauge!(names::CONNECTIONS_ACTIVE, "kind" => kind).decrement(1.0);
}

/// Record a frame.
pub fn record_frame(direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
}

/// Record one drain pass.
pub fn record_drain(stats: &DrainStats, seconds: f64) {
    counter!(names::FRAMES_COALESCED).increment(stats.coalesced as u64);
    counter!(names::HANDLER_FAULTS).increment(stats.failed as u64);
    histogram!(names::DRAIN_SECONDS).record(seconds);
}

/// Update online player count.
pub fn set_players_online(count: usize) {
    gauge!(names::PLAYERS_ONLINE).set(count as f64);
}

/// Update attached world count.
pub fn set_worlds_online(count: usize) {
    gauge!(names::WORLDS_ONLINE).set(count as f64);
}

/// Publish lane counters.
pub fn record_lanes(stats: &[LaneStats]) {
    for lane in stats {
        let name = lane.affinity.name();
        gauge!(names::LANE_FIRINGS, "lane" => name).set(lane.firings as f64);
        gauge!(names::LANE_FAULTS, "lane" => name).set(lane.faults as f64);
    }
}

/// Record a persistence sweep.
pub fn record_saves(stats: &PersistSweepStats) {
    counter!(names::SAVES_TOTAL, "outcome" => "saved").increment(stats.saved as u64);
    counter!(names::SAVES_TOTAL, "outcome" => "declined").increment(stats.declined as u64);
    counter!(names::SAVES_TOTAL, "outcome" => "failed").increment(stats.failed as u64);
}

/// Record a roster sweep.
pub fn record_roster_sweep(stats: &RosterSweepStats) {
    counter!(names::ROSTER_CHANGES).increment(stats.changes as u64);
    if stats.failed > 0 {
        record_error("roster");
    }
}

/// Record one simulation pulse.
pub fn record_pulse() {
    counter!(names::PULSES_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    kind: &'static str,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        record_connection(kind);
        Self { kind }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection(self.kind);
    }
}
