//! HTTP API for zone management, counts and metrics
//!
//! Routes:
//! - `GET /zones`, `GET /zones/{camera}`, `POST /zones/{camera}`
//! - `GET /zones/{camera}/{zone}/stats`, `GET /zones/{camera}/{zone}/dwell`
//! - `DELETE /zones/{camera}/{zone}`, `POST /zones/{camera}/{zone}/reset`
//! - `GET /counts[?camera_id=]`
//! - `GET /cameras`, `GET|POST /cameras/active`
//! - `GET /metrics` (Prometheus text), `GET /health`
//!
//! Uses hyper for the HTTP server. Routing is a plain function over
//! method, path, query and body so it can be exercised without a socket.

use crate::domain::zone::ZoneError;
use crate::infra::metrics::{Metrics, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::occupancy::OccupancyService;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::borrow::Cow;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Largest request body accepted
const MAX_BODY_BYTES: usize = 64 * 1024;

const JSON: &str = "application/json";
const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared state handed to every request
pub struct ApiContext {
    pub service: Arc<OccupancyService>,
    pub metrics: Arc<Metrics>,
    pub site_id: String,
}

/// Routed response before it is turned into a hyper response
#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl ApiResponse {
    fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self { status, content_type: JSON, body },
            Err(e) => Self::error(StatusCode::INTERNAL_SERVER_ERROR, &format!("serialization failed: {e}")),
        }
    }

    fn ok<T: Serialize>(value: &T) -> Self {
        Self::json(StatusCode::OK, value)
    }

    fn error(status: StatusCode, reason: &str) -> Self {
        Self { status, content_type: JSON, body: json!({ "error": reason }).to_string() }
    }

    fn from_zone_error(e: &ZoneError) -> Self {
        let status = match e {
            ZoneError::CameraNotFound(_) | ZoneError::ZoneNotFound { .. } => StatusCode::NOT_FOUND,
            ZoneError::InvalidRectangle { .. } | ZoneError::MissingField(_) => StatusCode::BAD_REQUEST,
        };
        Self::error(status, &e.to_string())
    }

    fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(self.body)));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(self.content_type));
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        response
    }
}

#[derive(Debug, Deserialize)]
struct ZoneRequest {
    zone: Option<String>,
    top_left: Option<[i32; 2]>,
    bottom_right: Option<[i32; 2]>,
}

#[derive(Debug, Deserialize)]
struct ActiveCameraRequest {
    camera_id: Option<String>,
}

fn parse_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, ApiResponse> {
    if body.is_empty() {
        return Err(ApiResponse::error(StatusCode::BAD_REQUEST, "no data provided"));
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiResponse::error(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {e}")))
}

/// Value of `key` in a query string (no percent-decoding)
fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

/// Route one request
pub fn route(ctx: &ApiContext, method: &Method, path: &str, query: Option<&str>, body: &[u8]) -> ApiResponse {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["health"]) => ApiResponse::ok(&json!({
            "status": "healthy",
            "site": ctx.site_id,
            "cameras": ctx.service.cameras().len(),
            "active_camera": ctx.service.active_camera(),
        })),
        (&Method::GET, ["metrics"]) => ApiResponse {
            status: StatusCode::OK,
            content_type: PROMETHEUS_TEXT,
            body: format_prometheus_metrics(ctx),
        },
        (&Method::GET, ["zones"]) => ApiResponse::ok(&ctx.service.full_snapshot()),
        (&Method::GET, ["zones", camera]) => match ctx.service.camera_snapshot(camera) {
            Ok(record) => ApiResponse::ok(&json!({ "camera_id": camera, "zones": record.zones })),
            Err(e) => ApiResponse::from_zone_error(&e),
        },
        (&Method::POST, ["zones", camera]) => create_zone(ctx, camera, body),
        (&Method::DELETE, ["zones", camera, zone]) => match ctx.service.delete_zone(camera, zone) {
            Ok(()) => ApiResponse::ok(&json!({ "camera_id": camera, "zone": zone, "deleted": true })),
            Err(e) => ApiResponse::from_zone_error(&e),
        },
        (&Method::POST, ["zones", camera, zone, "reset"]) => match ctx.service.reset_zone_counts(camera, zone) {
            Ok(()) => ApiResponse::ok(&json!({ "camera_id": camera, "zone": zone, "reset": true })),
            Err(e) => ApiResponse::from_zone_error(&e),
        },
        (&Method::GET, ["zones", camera, zone, "stats"]) => match ctx.service.zone_stats(camera, zone) {
            Ok(stats) => ApiResponse::ok(&stats),
            Err(e) => ApiResponse::from_zone_error(&e),
        },
        (&Method::GET, ["zones", camera, zone, "dwell"]) => match ctx.service.dwell_details(camera, zone) {
            Ok(details) => ApiResponse::ok(&json!({ "camera_id": camera, "zone": zone, "people": details })),
            Err(e) => ApiResponse::from_zone_error(&e),
        },
        (&Method::GET, ["counts"]) => match ctx.service.counts(query_param(query, "camera_id")) {
            Ok(counts) => ApiResponse::ok(&counts),
            Err(e) => ApiResponse::from_zone_error(&e),
        },
        (&Method::GET, ["cameras"]) => ApiResponse::ok(&json!({
            "cameras": ctx.service.cameras(),
            "active_camera": ctx.service.active_camera(),
        })),
        (&Method::GET, ["cameras", "active"]) => {
            ApiResponse::ok(&json!({ "camera_id": ctx.service.active_camera() }))
        }
        (&Method::POST, ["cameras"] | ["cameras", "active"]) => set_active_camera(ctx, body),
        (_, ["health" | "metrics" | "zones" | "counts" | "cameras", ..]) => {
            ApiResponse::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => ApiResponse::error(StatusCode::NOT_FOUND, "resource not found"),
    }
}

fn create_zone(ctx: &ApiContext, camera: &str, body: &[u8]) -> ApiResponse {
    let request: ZoneRequest = match parse_body(body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let Some(zone) = request.zone else {
        return ApiResponse::from_zone_error(&ZoneError::MissingField("zone"));
    };
    let Some(top_left) = request.top_left else {
        return ApiResponse::from_zone_error(&ZoneError::MissingField("top_left"));
    };
    let Some(bottom_right) = request.bottom_right else {
        return ApiResponse::from_zone_error(&ZoneError::MissingField("bottom_right"));
    };

    match ctx.service.create_or_update_zone(camera, &zone, top_left, bottom_right) {
        Ok(change) => ApiResponse::ok(&json!({
            "camera_id": camera,
            "zone": zone,
            "change": change.as_str(),
            "top_left": top_left,
            "bottom_right": bottom_right,
        })),
        Err(e) => ApiResponse::from_zone_error(&e),
    }
}

fn set_active_camera(ctx: &ApiContext, body: &[u8]) -> ApiResponse {
    let request: ActiveCameraRequest = match parse_body(body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let Some(camera_id) = request.camera_id.filter(|id| !id.trim().is_empty()) else {
        return ApiResponse::from_zone_error(&ZoneError::MissingField("camera_id"));
    };
    match ctx.service.set_active_camera(&camera_id) {
        Ok(()) => ApiResponse::ok(&json!({ "camera_id": camera_id })),
        Err(e) => ApiResponse::from_zone_error(&e),
    }
}

/// Escape a label value for the text exposition format (`\\`, `"`, newline)
fn escape_label(value: &str) -> Cow<'_, str> {
    if !value.contains(['\\', '"', '\n']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// Write a simple metric with an already escaped site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: &str, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {typ}");
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
///
/// Reads counters without resetting them, so scrapes do not disturb the
/// periodic metrics report.
fn format_prometheus_metrics(ctx: &ApiContext) -> String {
    let metrics = &ctx.metrics;
    let site = escape_label(&ctx.site_id);
    let site = site.as_ref();
    let mut output = String::with_capacity(4096);

    let counters = [
        ("zone_counter_frames_total", "Detection frames processed", metrics.frames_total()),
        ("zone_counter_observations_total", "Observations run through the state machine", metrics.observations_total()),
        ("zone_counter_observations_skipped_total", "Malformed observations skipped", metrics.observations_skipped()),
        ("zone_counter_entries_total", "Qualified zone entries", metrics.entries_total()),
        ("zone_counter_exits_total", "Confirmed zone exits", metrics.exits_total()),
        ("zone_counter_reaped_total", "Stale tracking entries removed", metrics.reaped_total()),
        ("zone_counter_frames_dropped_total", "Frames dropped due to channel full", metrics.frames_dropped()),
        ("zone_counter_egress_dropped_total", "Egress messages dropped due to channel full", metrics.egress_dropped()),
        ("zone_counter_store_failures_total", "Failed snapshot writes", metrics.store_failures()),
    ];
    for (name, help, val) in counters {
        write_metric(&mut output, name, help, "counter", site, val);
    }

    write_histogram(
        &mut output,
        "zone_counter_frame_latency_us",
        "Frame processing latency in microseconds",
        site,
        &metrics.latency_buckets(),
        metrics.latency_sum_us(),
    );

    write_metric(
        &mut output,
        "zone_counter_cameras",
        "Cameras known to the service",
        "gauge",
        site,
        ctx.service.cameras().len() as u64,
    );
    write_metric(
        &mut output,
        "zone_counter_tracked_people",
        "Open dwell sessions across all zones",
        "gauge",
        site,
        ctx.service.tracked_people() as u64,
    );

    let gauges = ctx.service.zone_gauges();
    let _ = writeln!(output, "# HELP zone_counter_zone_occupancy People currently inside each zone");
    let _ = writeln!(output, "# TYPE zone_counter_zone_occupancy gauge");
    for g in &gauges {
        let _ = writeln!(
            output,
            "zone_counter_zone_occupancy{{site=\"{site}\",camera=\"{}\",zone=\"{}\"}} {}",
            escape_label(&g.camera_id),
            escape_label(&g.zone),
            g.occupancy
        );
    }
    let _ = writeln!(output, "# HELP zone_counter_zone_in_count Entries counted per zone");
    let _ = writeln!(output, "# TYPE zone_counter_zone_in_count gauge");
    for g in &gauges {
        let _ = writeln!(
            output,
            "zone_counter_zone_in_count{{site=\"{site}\",camera=\"{}\",zone=\"{}\"}} {}",
            escape_label(&g.camera_id),
            escape_label(&g.zone),
            g.in_count
        );
    }
    let _ = writeln!(output, "# HELP zone_counter_zone_out_count Exits counted per zone");
    let _ = writeln!(output, "# TYPE zone_counter_zone_out_count gauge");
    for g in &gauges {
        let _ = writeln!(
            output,
            "zone_counter_zone_out_count{{site=\"{site}\",camera=\"{}\",zone=\"{}\"}} {}",
            escape_label(&g.camera_id),
            escape_label(&g.zone),
            g.out_count
        );
    }

    output
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: Arc<ApiContext>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "http_body_rejected");
            return Ok(ApiResponse::error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large or unreadable")
                .into_response());
        }
    };

    let response = route(&ctx, &parts.method, parts.uri.path(), parts.uri.query(), &body);
    debug!(method = %parts.method, path = %parts.uri.path(), status = %response.status.as_u16(), "http_request");
    Ok(response.into_response())
}

/// Start the HTTP API server
pub async fn start_http_server(
    port: u16,
    ctx: Arc<ApiContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, site = %ctx.site_id, "http_api_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let ctx = ctx.clone();
                                async move { handle_request(req, ctx).await }
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_api_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
