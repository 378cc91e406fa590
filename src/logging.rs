//! Structured logging for the agent pipeline.
//!
//! Every record is a single JSON line with a run id, a sequence number, a
//! level, a domain and a free-form `data` object. Lines go to stdout; when
//! `LOG_DIR` is set they are also written to a per-run directory:
//!
//! ```text
//! $LOG_DIR/<run_id>/events.jsonl   info and above
//! $LOG_DIR/<run_id>/trace.jsonl    trace/debug
//! $LOG_DIR/<run_id>/manifest.json
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Market,    // Observations, indicator windows
    Signal,    // Ensemble scoring
    Trend,     // Regime / direction classification
    Sentiment, // Text scoring
    Strategy,  // Consensus fusion
    Risk,      // Gate decisions
    Exec,      // Order lifecycle, fills
    Rollup,    // Stats, leaderboard, hints
    Bus,       // Publish / subscribe plumbing
    Drift,     // Distribution drift
    Advisory,  // Optional external explanations
    Audit,     // Message audit trail
    System,    // Startup, shutdown, config
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Market => "market",
            Domain::Signal => "signal",
            Domain::Trend => "trend",
            Domain::Sentiment => "sentiment",
            Domain::Strategy => "strategy",
            Domain::Risk => "risk",
            Domain::Exec => "exec",
            Domain::Rollup => "rollup",
            Domain::Bus => "bus",
            Domain::Drift => "drift",
            Domain::Advisory => "advisory",
            Domain::Audit => "audit",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    sinks: Option<Sinks>,
}

#[derive(Debug)]
struct Sinks {
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let sinks = std::env::var("LOG_DIR")
            .ok()
            .and_then(|base| open_sinks(PathBuf::from(base), &run_id));
        RunContext { run_id, sinks }
    })
}

fn open_sinks(mut run_dir: PathBuf, run_id: &str) -> Option<Sinks> {
    run_dir.push(run_id);
    if let Err(err) = create_dir_all(&run_dir) {
        eprintln!("[log] failed to create run dir: {}", err);
        return None;
    }
    let _ = std::fs::write(
        run_dir.join("manifest.json"),
        json!({
            "run_id": run_id,
            "ts": ts_now(),
            "pid": process::id(),
            "log_dir": run_dir.to_string_lossy(),
        })
        .to_string(),
    );
    let events = File::create(run_dir.join("events.jsonl"))
        .map_err(|err| eprintln!("[log] failed to create events log: {}", err))
        .ok()?;
    let trace = File::create(run_dir.join("trace.jsonl"))
        .map_err(|err| eprintln!("[log] failed to create trace log: {}", err))
        .ok()?;
    Some(Sinks {
        events: Mutex::new(BufWriter::new(events)),
        trace: Mutex::new(BufWriter::new(trace)),
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["api_key", "x-api-key", "authorization", "Authorization"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["agent", "asset", "topic", "order_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
/// Whether a record at `level` in `domain` would be emitted. Callers check
/// this before building expensive fields.
pub fn enabled(level: Level, domain: Domain) -> bool {
    level >= Level::from_env() && domain.is_enabled()
}

pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if !enabled(level, domain) {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(sanitize_fields(fields));

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if let Some(sinks) = &ctx.sinks {
        match level {
            Level::Trace | Level::Debug => write_line(&sinks.trace, &line),
            _ => write_line(&sinks.events, &line),
        }
    }
    println!("{}", line);
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

/// Audit trail entry for a published message.
pub fn log_message(sender: &str, topic: &str, message_id: &str, payload: &Value) {
    log(
        Level::Debug,
        Domain::Audit,
        "publish",
        obj(&[
            ("agent", v_str(sender)),
            ("topic", v_str(topic)),
            ("message_id", v_str(message_id)),
            ("digest", v_str(&payload_digest(payload))),
        ]),
    );
}

pub fn log_signal(agent: &str, asset: &str, action: &str, score: f64, rule_score: f64, reason: &str) {
    log(
        Level::Info,
        Domain::Signal,
        "signal",
        obj(&[
            ("agent", v_str(agent)),
            ("asset", v_str(asset)),
            ("action", v_str(action)),
            ("score", v_num(score)),
            ("rule_score", v_num(rule_score)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_risk_check(asset: &str, check: &str, result: &str, value: f64, threshold: f64) {
    log(
        Level::Debug,
        Domain::Risk,
        "guard",
        obj(&[
            ("asset", v_str(asset)),
            ("check", v_str(check)),
            ("result", v_str(result)),
            ("value", v_num(value)),
            ("threshold", v_num(threshold)),
        ]),
    );
}

pub fn log_order_state(order_id: &str, prev: &str, next: &str, filled: f64, qty: f64) {
    log(
        Level::Debug,
        Domain::Exec,
        "order_state",
        obj(&[
            ("order_id", v_str(order_id)),
            ("prev_state", v_str(prev)),
            ("new_state", v_str(next)),
            ("filled_qty", v_num(filled)),
            ("qty", v_num(qty)),
        ]),
    );
}

pub fn log_drift(agent: &str, asset: &str, feature: &str, value: f64, deviation: f64) {
    log(
        Level::Warn,
        Domain::Drift,
        "drift_detected",
        obj(&[
            ("agent", v_str(agent)),
            ("asset", v_str(asset)),
            ("feature", v_str(feature)),
            ("value", v_num(value)),
            ("deviation", v_num(deviation)),
        ]),
    );
}

/// Upstream failure replaced by a default.
pub fn log_fallback(domain: Domain, what: &str, err: &str) {
    log(
        Level::Warn,
        domain,
        "fallback",
        obj(&[("what", v_str(what)), ("error", v_str(err))]),
    );
}

/// Gate short-circuit (halted or frozen).
pub fn log_gated(domain: Domain, agent: &str, gate: &str) {
    log(
        Level::Debug,
        domain,
        "gated",
        obj(&[("agent", v_str(agent)), ("gate", v_str(gate))]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Hex SHA-256 of the canonical JSON encoding.
pub fn payload_digest(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_enabled_follows_level_threshold() {
        if std::env::var("LOG_LEVEL").is_err() && std::env::var("LOG_DOMAINS").is_err() {
            assert!(!enabled(Level::Debug, Domain::Audit));
            assert!(!enabled(Level::Trace, Domain::Bus));
            assert!(enabled(Level::Info, Domain::Audit));
        }
    }

    #[test]
    fn test_payload_digest_deterministic() {
        let a = payload_digest(&json!({"asset": "AAPL", "size": 100}));
        let b = payload_digest(&json!({"asset": "AAPL", "size": 100}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_payload_digest_different_inputs() {
        let a = payload_digest(&json!({"size": 100}));
        let b = payload_digest(&json!({"size": 101}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_sanitize_redacts_keys() {
        let m = sanitize_fields(obj(&[("x-api-key", v_str("secret")), ("asset", v_str("AAPL"))]));
        assert_eq!(m.get("x-api-key").unwrap(), "[REDACTED]");
        assert_eq!(m.get("asset").unwrap(), "AAPL");
    }

    #[test]
    fn test_split_fields_lifts_top_level_keys() {
        let (top, data) = split_fields(obj(&[("agent", v_str("risk-agent")), ("value", v_num(1.0))]));
        assert!(top.contains_key("agent"));
        assert!(data.contains_key("value"));
        assert!(!data.contains_key("agent"));
    }
}
