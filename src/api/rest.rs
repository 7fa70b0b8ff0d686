// =============================================================================
// Admin HTTP Surface — Axum 0.7
// =============================================================================
//
// Every endpoint returns canonical JSON (`application/json; charset=utf-8`,
// sorted keys, compact separators), including error bodies.  Per-request
// order: latency record → token check (401) → rate limit (429) → audit
// append → handler.  Validation failures return a code from a closed set per
// endpoint and never touch state; snapshot loaders route through the
// snapshot engine and therefore inherit all integrity checks.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::allocator::{SymbolOverride, CAP_EFF_BPS_MAX, K_EFF_MAX};
use crate::api::audit::AdminGate;
use crate::api::auth::ActiveSlot;
use crate::app_state::{now_secs, AppState};
use crate::canary::{CanaryBuilder, CanaryInputs};
use crate::config::{SchedulerConfig, WindowConfig};
use crate::rollout::{MAX_PINNED_CIDS, MAX_SALT_LEN};
use crate::scheduler::tod::{suggest_windows, BucketStats, SuggestConfig};
use crate::snapshot::{self, canonical_json};
use crate::types::Color;

type SharedState = Arc<AppState>;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full admin router with CORS and latency middleware.
pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        // ── Rollout ─────────────────────────────────────────────────
        .route("/admin/rollout", get(rollout_get).post(rollout_post))
        .route("/admin/rollout/ramp", get(ramp_get).post(ramp_post))
        .route("/admin/rollout/ramp/load", post(ramp_load))
        .route("/admin/rollout/state/load", post(rollout_state_load))
        .route(
            "/admin/rollout/killswitch",
            get(killswitch_get).post(killswitch_post),
        )
        .route(
            "/admin/rollout/autopromote",
            get(autopromote_get).post(autopromote_post),
        )
        .route("/admin/rollout/promote", post(promote))
        // ── Guards ──────────────────────────────────────────────────
        .route("/admin/guard", get(guard_get).post(guard_post))
        .route("/admin/guard/load", post(guard_load))
        .route("/admin/anti-stale-guard", get(anti_stale_get).post(anti_stale_post))
        .route("/admin/autopolicy", get(autopolicy_get).post(autopolicy_post))
        .route("/admin/autopolicy/load", post(autopolicy_load))
        .route("/admin/throttle", get(throttle_get))
        .route("/admin/throttle/reset", post(throttle_reset))
        .route("/admin/throttle/load", post(throttle_load))
        .route("/admin/throttle/snapshot_status", get(throttle_snapshot_status))
        // ── Allocator ───────────────────────────────────────────────
        .route("/admin/allocator", get(allocator_get))
        .route("/admin/allocator/reset_hwm", post(allocator_reset_hwm))
        .route("/admin/allocator/load", post(allocator_load))
        .route(
            "/admin/allocator/snapshot_status",
            get(allocator_snapshot_status),
        )
        .route(
            "/admin/allocator/cost_calibration",
            get(cost_calibration_get).post(cost_calibration_post),
        )
        .route("/admin/allocator/cost_inputs", post(cost_inputs_post))
        // ── Scheduler ───────────────────────────────────────────────
        .route("/admin/scheduler", get(scheduler_get))
        .route("/admin/scheduler/suggest", post(scheduler_suggest))
        .route("/admin/scheduler/apply", post(scheduler_apply))
        // ── Chaos ───────────────────────────────────────────────────
        .route("/admin/chaos", get(chaos_get).post(chaos_post))
        // ── Auth & audit ────────────────────────────────────────────
        .route("/admin/auth/rotate", post(auth_rotate))
        .route("/admin/audit/log", get(audit_log))
        .route("/admin/audit/clear", post(audit_clear))
        // ── Alerts & selfcheck ──────────────────────────────────────
        .route("/admin/alerts/log", get(alerts_log))
        .route("/admin/alerts/clear", post(alerts_clear))
        .route("/admin/selfcheck", get(selfcheck))
        // ── Canary reports ──────────────────────────────────────────
        .route("/admin/report/canary", get(report_canary))
        .route("/admin/report/canary/generate", post(report_canary_generate))
        .route("/admin/report/canary/replay", post(report_canary_replay))
        .route(
            "/admin/report/canary/baseline",
            get(canary_baseline_get).post(canary_baseline_post),
        )
        .route("/admin/report/canary/diff", post(canary_diff))
        // ── Execution recorder ──────────────────────────────────────
        .route("/admin/execution/recorder/status", get(recorder_status))
        .route("/admin/execution/recorder/rotate", post(recorder_rotate))
        .route("/admin/execution/replay", post(execution_replay))
        // ── Middleware & state ──────────────────────────────────────
        .layer(middleware::from_fn_with_state(state.clone(), latency_layer))
        .layer(cors)
        .with_state(state)
}

/// Outermost layer: record per-endpoint latency before anything else runs.
async fn latency_layer(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let resp = next.run(req).await;
    state
        .metrics
        .add_loop_duration_ms(&format!("http:{path}"), started.elapsed().as_secs_f64() * 1e3);
    resp
}

// =============================================================================
// Response & admission helpers
// =============================================================================

fn canon(status: StatusCode, value: &Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        canonical_json(value),
    )
        .into_response()
}

fn err(status: StatusCode, code: &str) -> Response {
    canon(status, &json!({"error": code}))
}

fn bad(code: &str) -> Response {
    err(StatusCode::BAD_REQUEST, code)
}

/// Parse a POST body; empty bodies mean `{}`, anything unparsable is a 400.
fn parse_body(body: &Bytes) -> Result<Value, Response> {
    if body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|_| bad("invalid_json"))
}

/// Token check → rate limit → audit append. Returns the actor label.
fn admit(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    endpoint: &str,
    audit_payload: &Value,
) -> Result<String, Response> {
    state.metrics.inc_admin_request(endpoint);

    let token = headers
        .get("X-Admin-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.get("token").cloned())
        .unwrap_or_default();

    if !state.auth.check(&token) {
        state.metrics.inc_admin_unauthorized(endpoint);
        return Err(err(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let actor = AdminGate::actor_for_token(&token);
    if !state.gate.check_rate(&actor, endpoint, now_secs()) {
        state.metrics.inc_admin_rate_limited(endpoint);
        return Err(err(StatusCode::TOO_MANY_REQUESTS, "rate_limited"));
    }

    state.gate.record(endpoint, &actor, audit_payload);
    Ok(actor)
}

/// Snapshot loader plumbing shared by every `/load` endpoint.
fn load_through_engine(
    state: &AppState,
    kind: &str,
    body: &Value,
    apply: impl Fn(&Value) -> Result<(), &'static str>,
) -> Response {
    let Some(path) = body.get("path").and_then(|v| v.as_str()) else {
        return bad("invalid_path");
    };
    match snapshot::load(path) {
        Ok(payload) => match apply(&payload) {
            Ok(()) => {
                state
                    .metrics
                    .set_gauge(&format!("snapshot_load_ok_ts{{kind=\"{kind}\"}}"), now_secs());
                canon(StatusCode::OK, &json!({"status": "ok", "kind": kind}))
            }
            Err(code) => {
                state.note_snapshot_failure(kind);
                bad(code)
            }
        },
        Err(e) => {
            state.note_snapshot_failure(kind);
            bad(e.kind())
        }
    }
}

fn snapshot_status(state: &AppState, path: &std::path::Path) -> Value {
    json!({
        "path": path.display().to_string(),
        "exists": path.exists(),
        "version": snapshot::peek_version(path),
        "last_write_ts": state.metrics.gauge(&format!(
            "snapshot_write_ts{{path=\"{}\"}}",
            path.display()
        )),
    })
}

// =============================================================================
// Public endpoints
// =============================================================================

async fn healthz(State(state): State<SharedState>) -> Response {
    canon(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "profile": state.profile.to_string(),
            "dry_run": state.dry_run,
        }),
    )
}

async fn readyz(State(state): State<SharedState>) -> Response {
    let reasons = state.readiness_reasons();
    if reasons.is_empty() {
        canon(StatusCode::OK, &json!({"status": "ready"}))
    } else {
        canon(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({"status": "not_ready", "reasons": reasons}),
        )
    }
}

async fn version(State(state): State<SharedState>) -> Response {
    canon(
        StatusCode::OK,
        &json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "commit": state.commit,
            "build_time": state.build_time_iso.clone().unwrap_or_else(|| crate::canary::EPOCH_ISO.to_string()),
        }),
    )
}

// =============================================================================
// Rollout
// =============================================================================

fn rollout_view(state: &AppState) -> Value {
    let st = state.rollout.rollout_state();
    json!({
        "traffic_split_pct": st.traffic_split_pct,
        "active": st.active.as_str(),
        "salt": st.salt,
        "pinned_cids_green": st.pinned_cids_green,
        "overlays": {"blue": st.overlay_blue, "green": st.overlay_green},
    })
}

async fn rollout_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/rollout", &json!({})) {
        return resp;
    }
    canon(StatusCode::OK, &rollout_view(&state))
}

async fn rollout_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/rollout", &payload) {
        return resp;
    }

    // Validate everything before the first mutation.
    let split = match payload.get("split_pct") {
        None => None,
        Some(v) => match v.as_u64() {
            Some(pct) if pct <= 100 => Some(pct as u32),
            _ => return bad("invalid_split"),
        },
    };
    let active = match payload.get("active") {
        None => None,
        Some(v) => match v.as_str().and_then(Color::parse) {
            Some(color) => Some(color),
            None => return bad("invalid_active"),
        },
    };
    let salt = match payload.get("salt") {
        None => None,
        Some(v) => match v.as_str() {
            Some(s) if s.len() <= MAX_SALT_LEN => Some(s.to_string()),
            _ => return bad("invalid_salt"),
        },
    };
    let pins = match payload.get("pinned_cids_green") {
        None => None,
        Some(v) => {
            let Some(arr) = v.as_array() else {
                return bad("invalid_pins");
            };
            if arr.len() > MAX_PINNED_CIDS {
                return bad("pins_too_many");
            }
            let mut pins = Vec::with_capacity(arr.len());
            for item in arr {
                match item.as_str() {
                    Some(s) => pins.push(s.to_string()),
                    None => return bad("invalid_pins"),
                }
            }
            Some(pins)
        }
    };
    let overlays = match payload.get("overlays") {
        None => None,
        Some(v) => {
            let Some(obj) = v.as_object() else {
                return bad("invalid_payload");
            };
            let blue = match obj.get("blue") {
                None => None,
                Some(b) => match b.as_object() {
                    Some(map) => Some(map.clone()),
                    None => return bad("invalid_payload"),
                },
            };
            let green = match obj.get("green") {
                None => None,
                Some(g) => match g.as_object() {
                    Some(map) => Some(map.clone()),
                    None => return bad("invalid_payload"),
                },
            };
            Some((blue, green))
        }
    };

    if let Some(pct) = split {
        state.rollout.set_split_pct(pct);
    }
    if let Some(color) = active {
        state.rollout.set_active(color);
    }
    if let Some(s) = salt {
        state.rollout.set_salt(s);
    }
    if let Some(p) = pins {
        state.rollout.set_pinned_cids(p);
    }
    if let Some((blue, green)) = overlays {
        if let Some(b) = blue {
            state.rollout.set_overlay(Color::Blue, b);
        }
        if let Some(g) = green {
            state.rollout.set_overlay(Color::Green, g);
        }
    }
    info!("rollout updated via admin");
    canon(StatusCode::OK, &rollout_view(&state))
}

fn ramp_view(state: &AppState) -> Value {
    let cfg = state.rollout.ramp_config();
    let ramp = state.rollout.ramp_state();
    json!({
        "enabled": ramp.enabled,
        "steps_pct": cfg.steps_pct,
        "step_interval_sec": cfg.step_interval_sec,
        "min_sample_fills": cfg.min_sample_fills,
        "max_reject_rate_delta_pct": cfg.max_reject_rate_delta_pct,
        "max_latency_delta_ms": cfg.max_latency_delta_ms,
        "max_step_increase_pct": cfg.max_step_increase_pct,
        "cooldown_after_rollback_sec": cfg.cooldown_after_rollback_sec,
        "step_idx": ramp.step_idx,
        "frozen": ramp.frozen,
        "consecutive_stable_steps": ramp.consecutive_stable_steps,
        "holds": {"sample": ramp.holds_sample, "cooldown": ramp.holds_cooldown},
    })
}

async fn ramp_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/rollout/ramp", &json!({})) {
        return resp;
    }
    canon(StatusCode::OK, &ramp_view(&state))
}

async fn ramp_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/rollout/ramp", &payload) {
        return resp;
    }

    let mut cfg = state.rollout.ramp_config();

    if let Some(v) = payload.get("steps_pct") {
        let Some(arr) = v.as_array() else {
            return bad("invalid_steps");
        };
        let mut steps = Vec::with_capacity(arr.len());
        for item in arr {
            match item.as_u64() {
                Some(s) if s <= 100 => steps.push(s as u32),
                _ => return bad("invalid_steps"),
            }
        }
        if steps.is_empty() || !steps.windows(2).all(|w| w[0] < w[1]) {
            return bad("invalid_steps");
        }
        cfg.steps_pct = steps;
    }
    if let Some(v) = payload.get("step_interval_sec") {
        match v.as_u64() {
            Some(sec) if sec >= 10 => cfg.step_interval_sec = sec,
            _ => return bad("invalid_interval"),
        }
    }
    if let Some(v) = payload.get("cooldown_after_rollback_sec") {
        match v.as_u64() {
            Some(sec) => cfg.cooldown_after_rollback_sec = sec,
            None => return bad("invalid_cooldown"),
        }
    }
    if let Some(v) = payload.get("max_step_increase_pct") {
        match v.as_u64() {
            Some(pct) if (1..=100).contains(&pct) => cfg.max_step_increase_pct = pct as u32,
            _ => return bad("max_step_pct_out_of_range"),
        }
    }
    if let Some(v) = payload.get("min_sample_fills") {
        match v.as_u64() {
            Some(n) => cfg.min_sample_fills = n,
            None => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("max_reject_rate_delta_pct") {
        match v.as_f64() {
            Some(x) if x >= 0.0 => cfg.max_reject_rate_delta_pct = x,
            _ => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("max_latency_delta_ms") {
        match v.as_f64() {
            Some(x) if x >= 0.0 => cfg.max_latency_delta_ms = x,
            _ => return bad("invalid_payload"),
        }
    }
    let frozen = match payload.get("frozen") {
        None => None,
        Some(v) => match v.as_bool() {
            Some(b) => Some(b),
            None => return bad("invalid_payload"),
        },
    };
    if let Some(v) = payload.get("enabled") {
        match v.as_bool() {
            Some(b) => cfg.enabled = b,
            None => return bad("invalid_payload"),
        }
    }

    state.rollout.update_ramp_config(cfg);
    if let Some(frozen) = frozen {
        state.rollout.set_frozen(frozen);
    }
    canon(StatusCode::OK, &ramp_view(&state))
}

async fn ramp_load(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/rollout/ramp/load", &payload) {
        return resp;
    }
    load_through_engine(&state, "ramp", &payload, |p| {
        state.rollout.load_ramp_snapshot(p)
    })
}

async fn rollout_state_load(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/rollout/state/load", &payload) {
        return resp;
    }
    load_through_engine(&state, "rollout_state", &payload, |p| {
        state.rollout.load_state_snapshot(p)
    })
}

async fn killswitch_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/rollout/killswitch", &json!({})) {
        return resp;
    }
    let cfg = state.rollout.killswitch_config();
    canon(
        StatusCode::OK,
        &json!({
            "enabled": cfg.enabled,
            "dry_run": cfg.dry_run,
            "action": cfg.action,
            "max_reject_delta": cfg.max_reject_delta,
            "max_latency_delta_ms": cfg.max_latency_delta_ms,
            "min_fills": cfg.min_fills,
            "fired": state.rollout.ramp_state().killswitch_fired,
        }),
    )
}

async fn killswitch_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/rollout/killswitch", &payload) {
        return resp;
    }

    let mut cfg = state.rollout.killswitch_config();
    if let Some(v) = payload.get("enabled") {
        match v.as_bool() {
            Some(b) => cfg.enabled = b,
            None => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("dry_run") {
        match v.as_bool() {
            Some(b) => cfg.dry_run = b,
            None => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("action") {
        match v.as_str() {
            Some(a @ ("rollback" | "freeze")) => cfg.action = a.to_string(),
            _ => return bad("invalid_action"),
        }
    }
    if let Some(v) = payload.get("max_reject_delta") {
        match v.as_f64() {
            Some(x) if (0.0..=1.0).contains(&x) => cfg.max_reject_delta = x,
            _ => return bad("invalid_max_reject_delta"),
        }
    }
    if let Some(v) = payload.get("max_latency_delta_ms") {
        match v.as_f64() {
            Some(x) if x >= 0.0 => cfg.max_latency_delta_ms = x,
            _ => return bad("invalid_max_latency_delta_ms"),
        }
    }
    if let Some(v) = payload.get("min_fills") {
        match v.as_u64() {
            Some(n) => cfg.min_fills = n,
            None => return bad("invalid_min_fills"),
        }
    }

    state.rollout.update_killswitch_config(cfg.clone());
    canon(
        StatusCode::OK,
        &json!({
            "enabled": cfg.enabled,
            "dry_run": cfg.dry_run,
            "action": cfg.action,
            "max_reject_delta": cfg.max_reject_delta,
            "max_latency_delta_ms": cfg.max_latency_delta_ms,
            "min_fills": cfg.min_fills,
        }),
    )
}

async fn autopromote_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/rollout/autopromote", &json!({})) {
        return resp;
    }
    let cfg = state.rollout.autopromote_config();
    canon(
        StatusCode::OK,
        &json!({
            "enabled": cfg.enabled,
            "stable_steps_required": cfg.stable_steps_required,
            "min_split_pct": cfg.min_split_pct,
            "consecutive_stable_steps": state.rollout.ramp_state().consecutive_stable_steps,
        }),
    )
}

async fn autopromote_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/rollout/autopromote", &payload) {
        return resp;
    }

    let mut cfg = state.rollout.autopromote_config();
    if let Some(v) = payload.get("enabled") {
        match v.as_bool() {
            Some(b) => cfg.enabled = b,
            None => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("stable_steps_required") {
        match v.as_u64() {
            Some(n) if n >= 1 => cfg.stable_steps_required = n as u32,
            _ => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("min_split_pct") {
        match v.as_u64() {
            Some(pct) if pct <= 100 => cfg.min_split_pct = pct as u32,
            _ => return bad("invalid_payload"),
        }
    }
    state.rollout.update_autopromote_config(cfg.clone());
    canon(
        StatusCode::OK,
        &json!({
            "enabled": cfg.enabled,
            "stable_steps_required": cfg.stable_steps_required,
            "min_split_pct": cfg.min_split_pct,
        }),
    )
}

async fn promote(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/rollout/promote", &payload) {
        return resp;
    }
    state.rollout.promote("manual", now_secs());
    canon(StatusCode::OK, &rollout_view(&state))
}

// =============================================================================
// Guards
// =============================================================================

fn guard_view(state: &AppState) -> Value {
    let cfg = state.guard.config();
    let st = state.guard.state();
    json!({
        "enabled": cfg.enabled,
        "paused": st.paused,
        "effective_pause": state.guard.effective_pause(),
        "dry_run": st.dry_run,
        "manual_override_pause": st.manual_override,
        "last_reason_mask": st.last_reason_mask,
        "breach_streak": st.breach_streak,
        "pauses_total": st.pauses_total,
        "ws_lag_ms": st.ws_lag_ms,
        "thresholds": {
            "cancel_rate_per_sec_max": cfg.cancel_rate_per_sec_max,
            "rest_error_rate_max": cfg.rest_error_rate_max,
            "pnl_slope_min_per_min": cfg.pnl_slope_min_per_min,
            "ws_lag_ms_max": cfg.ws_lag_ms_max,
        },
    })
}

async fn guard_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/guard", &json!({})) {
        return resp;
    }
    canon(StatusCode::OK, &guard_view(&state))
}

async fn guard_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/guard", &payload) {
        return resp;
    }

    let mut cfg = state.guard.config();
    if let Some(v) = payload.get("cancel_rate_per_sec_max") {
        match v.as_f64() {
            Some(x) if x >= 0.0 => cfg.cancel_rate_per_sec_max = x,
            _ => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("rest_error_rate_max") {
        match v.as_f64() {
            Some(x) if x >= 0.0 => cfg.rest_error_rate_max = x,
            _ => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("ws_lag_ms_max") {
        match v.as_f64() {
            Some(x) if x >= 0.0 => cfg.ws_lag_ms_max = x,
            _ => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("pnl_slope_min_per_min") {
        match v.as_f64() {
            Some(x) => cfg.pnl_slope_min_per_min = x,
            None => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("enabled") {
        match v.as_bool() {
            Some(b) => cfg.enabled = b,
            None => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("dry_run") {
        match v.as_bool() {
            Some(b) => cfg.dry_run = b,
            None => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("manual_override_pause") {
        match v.as_bool() {
            Some(b) => cfg.manual_override_pause = b,
            None => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("hysteresis_bad") {
        match v.as_u64() {
            Some(n) if n >= 1 => cfg.hysteresis_bad = n as u32,
            _ => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("hysteresis_good") {
        match v.as_u64() {
            Some(n) if n >= 1 => cfg.hysteresis_good = n as u32,
            _ => return bad("invalid_payload"),
        }
    }

    state.guard.update_config(cfg);
    canon(StatusCode::OK, &guard_view(&state))
}

async fn guard_load(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/guard/load", &payload) {
        return resp;
    }
    load_through_engine(&state, "guard", &payload, |p| state.guard.load_snapshot(p))
}

async fn anti_stale_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/anti-stale-guard", &json!({})) {
        return resp;
    }
    let cfg = state.guard.anti_stale();
    canon(
        StatusCode::OK,
        &json!({"enabled": cfg.enabled, "max_ws_lag_ms": cfg.max_ws_lag_ms}),
    )
}

async fn anti_stale_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/anti-stale-guard", &payload) {
        return resp;
    }

    let mut cfg = state.guard.anti_stale();
    if let Some(v) = payload.get("enabled") {
        match v.as_bool() {
            Some(b) => cfg.enabled = b,
            None => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("max_ws_lag_ms") {
        match v.as_f64() {
            Some(x) if x >= 0.0 => cfg.max_ws_lag_ms = x,
            _ => return bad("invalid_payload"),
        }
    }
    state.guard.set_anti_stale(cfg);
    canon(
        StatusCode::OK,
        &json!({"enabled": cfg.enabled, "max_ws_lag_ms": cfg.max_ws_lag_ms}),
    )
}

// =============================================================================
// AutoPolicy
// =============================================================================

fn autopolicy_view(state: &AppState) -> Value {
    let cfg = state.autopolicy.config();
    let st = state.autopolicy.state();
    json!({
        "enabled": cfg.enabled,
        "level": st.level,
        "max_level": cfg.max_level,
        "consec_bad": st.consec_bad,
        "consec_good": st.consec_good,
        "steps_total": st.steps_total,
        "base": {
            "min_time_in_book_ms": st.base.min_time_in_book_ms,
            "replace_threshold_bps": st.base.replace_threshold_bps,
            "levels_per_side_max": st.base.levels_per_side_max,
        },
        "overrides": {
            "min_time_in_book_ms_eff": st.overrides.min_time_in_book_ms_eff,
            "replace_threshold_bps_eff": st.overrides.replace_threshold_bps_eff,
            "levels_per_side_max_eff": st.overrides.levels_per_side_max_eff,
        },
    })
}

async fn autopolicy_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/autopolicy", &json!({})) {
        return resp;
    }
    canon(StatusCode::OK, &autopolicy_view(&state))
}

async fn autopolicy_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/autopolicy", &payload) {
        return resp;
    }

    let mut cfg = state.autopolicy.config();
    if let Some(v) = payload.get("enabled") {
        match v.as_bool() {
            Some(b) => cfg.enabled = b,
            None => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("max_level") {
        match v.as_u64() {
            Some(n) => cfg.max_level = n as u32,
            None => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("trigger_backoff_ms") {
        match v.as_f64() {
            Some(x) if x >= 0.0 => cfg.trigger_backoff_ms = x,
            _ => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("trigger_events_total") {
        match v.as_u64() {
            Some(n) => cfg.trigger_events_total = n,
            None => return bad("invalid_payload"),
        }
    }
    if let Some(v) = payload.get("cooldown_minutes") {
        match v.as_f64() {
            Some(x) if x >= 0.0 => cfg.cooldown_minutes = x,
            _ => return bad("invalid_payload"),
        }
    }
    state.autopolicy.update_config(cfg);

    if let Some(base) = payload.get("base") {
        let tib = base.get("min_time_in_book_ms").and_then(|v| v.as_f64());
        let rep = base.get("replace_threshold_bps").and_then(|v| v.as_f64());
        let lvl = base.get("levels_per_side_max").and_then(|v| v.as_u64());
        match (tib, rep, lvl) {
            (Some(tib), Some(rep), Some(lvl)) => {
                state.autopolicy.set_base(tib, rep, lvl as u32);
                state.autopolicy.apply();
            }
            _ => return bad("invalid_payload"),
        }
    }

    canon(StatusCode::OK, &autopolicy_view(&state))
}

async fn autopolicy_load(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/autopolicy/load", &payload) {
        return resp;
    }
    load_through_engine(&state, "autopolicy", &payload, |p| {
        state.autopolicy.load_snapshot(p)
    })
}

// =============================================================================
// Throttle
// =============================================================================

async fn throttle_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/throttle", &json!({})) {
        return resp;
    }
    let now = now_secs();
    let per_symbol: BTreeMap<String, Value> = state
        .symbols
        .iter()
        .map(|sym| {
            let counts = state.throttle.get_window_counts(sym, now);
            (
                sym.clone(),
                json!({
                    "create": counts.create,
                    "amend": counts.amend,
                    "cancel": counts.cancel,
                    "backoff_ms": state.throttle.backoff_ms(sym),
                }),
            )
        })
        .collect();
    canon(
        StatusCode::OK,
        &json!({
            "per_symbol": per_symbol,
            "events_total": state.throttle.events_total(),
            "backoff_ms_max": state.throttle.backoff_ms_max(),
        }),
    )
}

async fn throttle_reset(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/throttle/reset", &payload) {
        return resp;
    }
    state.throttle.reset();
    canon(StatusCode::OK, &json!({"status": "ok"}))
}

async fn throttle_load(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/throttle/load", &payload) {
        return resp;
    }
    load_through_engine(&state, "throttle", &payload, |p| {
        state.throttle.load_snapshot(p)
    })
}

async fn throttle_snapshot_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/throttle/snapshot_status", &json!({})) {
        return resp;
    }
    canon(
        StatusCode::OK,
        &snapshot_status(&state, &state.throttle_snapshot_path()),
    )
}

// =============================================================================
// Allocator
// =============================================================================

async fn allocator_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/allocator", &json!({})) {
        return resp;
    }
    canon(StatusCode::OK, &state.allocator.status())
}

async fn allocator_reset_hwm(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/allocator/reset_hwm", &payload) {
        return resp;
    }

    match payload.get("mode").and_then(|v| v.as_str()) {
        Some("zero") => state.allocator.reset_hwm_zero(),
        Some("to_current_equity") => {
            let Some(equity) = payload.get("equity_usd").and_then(|v| v.as_f64()) else {
                return bad("invalid_payload");
            };
            if equity < 0.0 {
                return bad("invalid_payload");
            }
            state.allocator.reset_hwm_to(equity);
        }
        _ => return bad("invalid_mode"),
    }
    canon(
        StatusCode::OK,
        &json!({"hwm_equity_usd": state.allocator.hwm_equity_usd()}),
    )
}

async fn allocator_load(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/allocator/load", &payload) {
        return resp;
    }
    load_through_engine(&state, "allocator", &payload, |p| {
        state.allocator.load_snapshot(p)
    })
}

async fn allocator_snapshot_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/allocator/snapshot_status", &json!({})) {
        return resp;
    }
    canon(
        StatusCode::OK,
        &snapshot_status(&state, &state.allocator_snapshot_path()),
    )
}

async fn cost_calibration_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/allocator/cost_calibration", &json!({})) {
        return resp;
    }
    let overrides: BTreeMap<String, Value> = state
        .allocator
        .overrides()
        .into_iter()
        .map(|(sym, ov)| {
            (
                sym,
                json!({"k_eff": ov.k_eff, "cap_eff_bps": ov.cap_eff_bps}),
            )
        })
        .collect();
    canon(
        StatusCode::OK,
        &json!({
            "overrides": overrides,
            "winsor_pct": state.metrics.gauge("cost_calibration_winsor_pct"),
            "max_step_pct": state.metrics.gauge("cost_calibration_max_step_pct"),
        }),
    )
}

async fn cost_calibration_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/allocator/cost_calibration", &payload) {
        return resp;
    }

    // Validate clamping parameters first.
    let winsor = match payload.get("winsor_pct") {
        None => None,
        Some(v) => match v.as_f64() {
            Some(x) if (0.0..=0.49).contains(&x) => Some(x),
            _ => return bad("winsor_out_of_range"),
        },
    };
    let max_step = match payload.get("max_step_pct") {
        None => None,
        Some(v) => match v.as_f64() {
            Some(x) if (0.0..=100.0).contains(&x) => Some(x),
            _ => return bad("max_step_pct_out_of_range"),
        },
    };

    // Validate every override before applying any.
    let mut parsed: Vec<(String, SymbolOverride)> = Vec::new();
    if let Some(overrides) = payload.get("overrides") {
        let Some(obj) = overrides.as_object() else {
            return bad("invalid_payload");
        };
        for (sym, entry) in obj {
            let k_eff = match entry.get("k_eff") {
                None => None,
                Some(v) => match v.as_f64() {
                    Some(k) if (0.0..=K_EFF_MAX).contains(&k) => Some(k),
                    _ => return bad("k_eff_out_of_range"),
                },
            };
            let cap_eff_bps = match entry.get("cap_eff_bps") {
                None => None,
                Some(v) => match v.as_f64() {
                    Some(c) if (0.0..=CAP_EFF_BPS_MAX).contains(&c) => Some(c),
                    _ => return bad("cap_eff_out_of_range"),
                },
            };
            parsed.push((sym.clone(), SymbolOverride { k_eff, cap_eff_bps }));
        }
    }

    for (sym, ov) in parsed {
        state.allocator.set_override(&sym, ov);
    }
    if let Some(w) = winsor {
        state.metrics.set_gauge("cost_calibration_winsor_pct", w);
    }
    if let Some(m) = max_step {
        state.metrics.set_gauge("cost_calibration_max_step_pct", m);
    }
    canon(StatusCode::OK, &json!({"status": "ok"}))
}

async fn cost_inputs_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/allocator/cost_inputs", &payload) {
        return resp;
    }

    let symbol = payload.get("symbol").and_then(|v| v.as_str());
    let spread = payload.get("spread_bps").and_then(|v| v.as_f64());
    let volume = payload.get("volume_usd").and_then(|v| v.as_f64());
    let slippage = payload.get("slippage_bps").and_then(|v| v.as_f64());
    let (Some(symbol), Some(spread), Some(volume), Some(slippage)) =
        (symbol, spread, volume, slippage)
    else {
        return bad("invalid_payload");
    };
    state
        .allocator
        .set_cost_inputs(symbol, spread, volume, slippage);
    canon(StatusCode::OK, &json!({"status": "ok"}))
}

// =============================================================================
// Scheduler
// =============================================================================

async fn scheduler_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/scheduler", &json!({})) {
        return resp;
    }
    canon(StatusCode::OK, &state.scheduler.status(Utc::now()))
}

async fn scheduler_suggest(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/scheduler/suggest", &payload) {
        return resp;
    }

    let cfg: SuggestConfig = match payload.get("cfg") {
        None => SuggestConfig::default(),
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(cfg) => cfg,
            Err(_) => return bad("invalid_payload"),
        },
    };
    if !["conservative", "neutral", "aggressive"].contains(&cfg.mode.to_lowercase().as_str()) {
        return bad("invalid_mode");
    }
    let stats: BTreeMap<String, BucketStats> = match payload.get("stats") {
        None => return bad("invalid_payload"),
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(stats) => stats,
            Err(_) => return bad("invalid_payload"),
        },
    };

    let suggestions = suggest_windows(&stats, &cfg);
    canon(
        StatusCode::OK,
        &json!({"suggestions": suggestions, "mode": cfg.mode.to_lowercase()}),
    )
}

async fn scheduler_apply(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/scheduler/apply", &payload) {
        return resp;
    }

    let windows: Vec<WindowConfig> = match payload.get("windows") {
        None => return bad("invalid_payload"),
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(w) => w,
            Err(_) => return bad("invalid_payload"),
        },
    };

    // A symbol-scoped apply replaces only that symbol's windows.
    if let Some(symbol) = payload.get("symbol").and_then(|v| v.as_str()) {
        state.scheduler.set_symbol_windows(symbol, &windows);
        return canon(
            StatusCode::OK,
            &json!({"status": "ok", "symbol": symbol, "windows": windows.len()}),
        );
    }

    let cfg = SchedulerConfig {
        tz: payload
            .get("tz")
            .and_then(|v| v.as_str())
            .unwrap_or("UTC")
            .to_string(),
        windows,
        holidays: payload
            .get("holidays")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|d| d.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        cooldown_open_minutes: payload
            .get("cooldown_open_minutes")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        cooldown_close_minutes: payload
            .get("cooldown_close_minutes")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        block_in_cooldown: payload
            .get("block_in_cooldown")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
    };
    state.scheduler.apply(&cfg);
    canon(StatusCode::OK, &state.scheduler.status(Utc::now()))
}

// =============================================================================
// Chaos
// =============================================================================

async fn chaos_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/chaos", &json!({})) {
        return resp;
    }
    let chaos = state.rollout.chaos_config();
    canon(
        StatusCode::OK,
        &json!({
            "reject_inflate_pct": chaos.reject_inflate_pct,
            "latency_inflate_ms": chaos.latency_inflate_ms,
        }),
    )
}

async fn chaos_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/chaos", &payload) {
        return resp;
    }

    let mut chaos = state.rollout.chaos_config();
    if let Some(v) = payload.get("reject_inflate_pct") {
        match v.as_f64() {
            Some(x) if (0.0..=100.0).contains(&x) => chaos.reject_inflate_pct = x,
            _ => return bad("invalid_reject_inflate_pct"),
        }
    }
    if let Some(v) = payload.get("latency_inflate_ms") {
        match v.as_f64() {
            Some(x) if (0.0..=60_000.0).contains(&x) => chaos.latency_inflate_ms = x,
            _ => return bad("invalid_latency_inflate_ms"),
        }
    }
    state.rollout.set_chaos(chaos);
    canon(
        StatusCode::OK,
        &json!({
            "reject_inflate_pct": chaos.reject_inflate_pct,
            "latency_inflate_ms": chaos.latency_inflate_ms,
        }),
    )
}

// =============================================================================
// Auth & audit
// =============================================================================

async fn auth_rotate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Token values never reach the audit trail.
    let mut masked = serde_json::Map::new();
    for key in ["primary", "secondary"] {
        if payload.get(key).is_some() {
            masked.insert(key.to_string(), json!("***"));
        }
    }
    if let Some(a) = payload.get("activate") {
        masked.insert("activate".to_string(), a.clone());
    }
    if let Err(resp) = admit(&state, &headers, &q, "/admin/auth/rotate", &Value::Object(masked)) {
        return resp;
    }

    let primary = match payload.get("primary") {
        None => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.to_string()),
            None => return bad("invalid_payload"),
        },
    };
    let secondary = match payload.get("secondary") {
        None => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.to_string()),
            None => return bad("invalid_payload"),
        },
    };
    let activate = match payload.get("activate") {
        None => None,
        Some(v) => match v.as_str().and_then(ActiveSlot::parse) {
            Some(slot) => Some(slot),
            None => return bad("invalid_payload"),
        },
    };

    state.auth.rotate(primary, secondary, activate);
    canon(
        StatusCode::OK,
        &json!({"status": "ok", "active": state.auth.active().as_str()}),
    )
}

async fn audit_log(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/audit/log", &json!({})) {
        return resp;
    }
    let records = serde_json::to_value(state.gate.records()).unwrap_or_else(|_| json!([]));
    canon(StatusCode::OK, &records)
}

async fn audit_clear(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/audit/clear", &payload) {
        return resp;
    }
    state.gate.clear();
    canon(StatusCode::OK, &json!({"status": "ok"}))
}

// =============================================================================
// Alerts & selfcheck
// =============================================================================

async fn alerts_log(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/alerts/log", &json!({})) {
        return resp;
    }
    let records = serde_json::to_value(state.alerts.read_all()).unwrap_or_else(|_| json!([]));
    canon(StatusCode::OK, &records)
}

async fn alerts_clear(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/alerts/clear", &payload) {
        return resp;
    }
    if state.alerts.clear().is_err() {
        return err(StatusCode::INTERNAL_SERVER_ERROR, "alerts_clear_failed");
    }
    canon(StatusCode::OK, &json!({"status": "ok"}))
}

async fn selfcheck(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/selfcheck", &json!({})) {
        return resp;
    }
    let snapshot_fails: BTreeMap<&str, u64> = ["allocator", "throttle", "ramp", "rollout_state", "guard", "autopolicy"]
        .into_iter()
        .map(|kind| (kind, state.metrics.snapshot_integrity_fails(kind)))
        .collect();
    canon(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "artifacts_dir": state.artifacts_dir.display().to_string(),
            "artifacts_writable": AppState::artifacts_dir_writable(&state.artifacts_dir),
            "circuit": state.circuit.status(),
            "guard_paused_effective": state.guard.effective_pause(),
            "ramp_frozen": state.rollout.ramp_state().frozen,
            "snapshot_integrity_fails": snapshot_fails,
        }),
    )
}

// =============================================================================
// Canary reports
// =============================================================================

async fn report_canary(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/report/canary", &json!({})) {
        return resp;
    }
    canon(StatusCode::OK, &state.canary.build())
}

async fn report_canary_generate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/report/canary/generate", &payload) {
        return resp;
    }

    let report = state.canary.build();
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let canary_path = state.artifacts_dir.join(format!("canary_{stamp}.json"));
    let md_path = state.artifacts_dir.join(format!("REPORT_CANARY_{stamp}.md"));

    if std::fs::write(&canary_path, CanaryBuilder::to_canonical(&report)).is_err() {
        return err(StatusCode::INTERNAL_SERVER_ERROR, "artifact_write_failed");
    }
    let md = render_canary_markdown(&report);
    if std::fs::write(&md_path, md).is_err() {
        return err(StatusCode::INTERNAL_SERVER_ERROR, "artifact_write_failed");
    }

    canon(
        StatusCode::OK,
        &json!({
            "canary_path": canary_path.display().to_string(),
            "report_path": md_path.display().to_string(),
        }),
    )
}

async fn report_canary_replay(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/report/canary/replay", &payload) {
        return resp;
    }

    let inputs: CanaryInputs = match serde_json::from_value(payload.clone()) {
        Ok(inputs) => inputs,
        Err(_) => return bad("invalid_payload"),
    };
    canon(StatusCode::OK, &state.canary.build_from(&inputs))
}

async fn canary_baseline_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/report/canary/baseline", &json!({})) {
        return resp;
    }
    match state.canary.baseline() {
        Some(baseline) => canon(StatusCode::OK, &baseline),
        None => bad("baseline_not_initialized"),
    }
}

async fn canary_baseline_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/report/canary/baseline", &payload) {
        return resp;
    }
    let baseline = state.canary.build();
    state.canary.save_baseline(baseline.clone());
    canon(StatusCode::OK, &json!({"status": "ok"}))
}

async fn canary_diff(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/report/canary/diff", &payload) {
        return resp;
    }

    let candidate = match payload.get("payload") {
        Some(p) => p.clone(),
        None => state.canary.build(),
    };
    match state.canary.diff_against_baseline(&candidate) {
        Some(diff) => canon(
            StatusCode::OK,
            &json!({"changed_paths": diff, "identical": diff.is_empty()}),
        ),
        None => bad("baseline_not_initialized"),
    }
}

fn render_canary_markdown(report: &Value) -> String {
    let rollout = &report["rollout"];
    let hints = report["hints"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|h| h.as_str())
                .map(|h| format!("- {h}\n"))
                .collect::<String>()
        })
        .unwrap_or_default();
    format!(
        "# Canary Report\n\n\
         Generated: {}\n\n\
         ## Rollout\n\n\
         | metric | blue | green |\n|---|---|---|\n\
         | fills | {} | {} |\n\
         | rejects | {} | {} |\n\
         | latency_ms_avg | {} | {} |\n\n\
         Split expected/observed: {} / {}\n\n\
         ## Hints\n\n{}",
        report["meta"]["generated_at"].as_str().unwrap_or(""),
        rollout["fills_blue"],
        rollout["fills_green"],
        rollout["rejects_blue"],
        rollout["rejects_green"],
        rollout["latency_ms_avg_blue"],
        rollout["latency_ms_avg_green"],
        rollout["split_expected_pct"],
        rollout["split_observed_pct"],
        if hints.is_empty() { "- none\n".to_string() } else { hints },
    )
}

// =============================================================================
// Execution recorder
// =============================================================================

async fn recorder_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = admit(&state, &headers, &q, "/admin/execution/recorder/status", &json!({})) {
        return resp;
    }
    canon(StatusCode::OK, &state.recorder.status())
}

async fn recorder_rotate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/execution/recorder/rotate", &payload) {
        return resp;
    }
    match state.recorder.rotate() {
        Ok(out) => canon(StatusCode::OK, &out),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn execution_replay(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = admit(&state, &headers, &q, "/admin/execution/replay", &payload) {
        return resp;
    }

    let Some(path) = payload.get("path").and_then(|v| v.as_str()) else {
        return bad("invalid_path");
    };
    match crate::exchange::ExecutionRecorder::replay_summary(std::path::Path::new(path)) {
        Ok(summary) => canon(StatusCode::OK, &summary),
        Err(_) => bad("invalid_path"),
    }
}
