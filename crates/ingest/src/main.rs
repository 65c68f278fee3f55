use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kardex::{FactEnvelope, KardexError, Ledger, TrustPolicy};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::env;
use std::io::{self, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod framing;

use framing::{read_message, write_message};

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const LEDGER_ERROR: i64 = -32000;
const MISSING_IDENTITY: i64 = -32001;
const INCOMPATIBLE_DATA: i64 = -32002;

struct AppState {
    ledger: Ledger,
}

impl AppState {
    fn open() -> Result<Self> {
        let db_path = env::var("KARDEX_DB_PATH").unwrap_or_else(|_| "./kardex.redb".to_string());
        let trust = match env::var("KARDEX_TRUST_POLICY") {
            Ok(path) => TrustPolicy::load(&path)
                .with_context(|| format!("failed to load trust policy from {path}"))?,
            Err(_) => {
                tracing::warn!("KARDEX_TRUST_POLICY not set; every source is untrusted");
                TrustPolicy::default()
            }
        };
        let ledger = Ledger::open(&db_path, trust)
            .with_context(|| format!("failed to open kardex database at {db_path}"))?;
        tracing::info!(db_path = %db_path, "ledger open");
        Ok(Self { ledger })
    }
}

/// JSON-RPC error object.
#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
        }
    }
}

impl From<KardexError> for RpcError {
    fn from(err: KardexError) -> Self {
        let code = match err {
            KardexError::MissingIdentity(_) => MISSING_IDENTITY,
            KardexError::IncompatibleData(_) => INCOMPATIBLE_DATA,
            _ => LEDGER_ERROR,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kardex=info".parse()?)
                .add_directive("kardex_ingest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let state = AppState::open()?;
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                // A bad frame is reported and skipped; the stream stays open.
                tracing::warn!(error = %e, "unreadable frame");
                let err_resp = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": PARSE_ERROR, "message": format!("Parse error: {e}") }
                });
                write_message(&mut writer, &err_resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    Ok(())
}

/// Requests without an `id` are notifications and get no response.
fn handle_request(state: &AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned()?;
    let method = req.get("method").and_then(JsonValue::as_str)?;
    let params = req.get("params");

    let result = match method {
        "initialize" => Ok(json!({
            "serverInfo": { "name": "kardex-ingest", "version": env!("CARGO_PKG_VERSION") },
            "trustedSources": state.ledger.trust_policy().trusted_sources().collect::<Vec<_>>()
        })),
        "ping" => Ok(json!({})),
        "facts/apply" => apply_fact(state, params),
        "visits/get" => get_visit(state, params),
        "visits/audits" => visit_audits(state, params),
        _ => Err(RpcError {
            code: METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
        }),
    };

    Some(match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(err) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": err.code, "message": err.message }
        }),
    })
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Option<&JsonValue>) -> Result<T, RpcError> {
    let params = params.ok_or_else(|| RpcError::invalid_params("missing params"))?;
    serde_json::from_value(params.clone()).map_err(|e| RpcError::invalid_params(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::from(KardexError::from(e)))
}

fn apply_fact(state: &AppState, params: Option<&JsonValue>) -> Result<JsonValue, RpcError> {
    let envelope: FactEnvelope = parse_params(params)?;
    match state.ledger.process(&envelope) {
        Ok(outcome) => to_json(&outcome),
        Err(err) => {
            tracing::warn!(
                fact = envelope.fact.name(),
                encounter = ?envelope.encounter,
                source = %envelope.source_system,
                error = %err,
                "fact rejected"
            );
            Err(err.into())
        }
    }
}

#[derive(Deserialize)]
struct VisitParams {
    encounter: String,
    /// Processing time to read the visit as of; defaults to now.
    #[serde(default)]
    as_of: Option<DateTime<Utc>>,
}

fn get_visit(state: &AppState, params: Option<&JsonValue>) -> Result<JsonValue, RpcError> {
    let VisitParams { encounter, as_of } = parse_params(params)?;
    let visit = match as_of {
        Some(at) => state.ledger.visit_as_of(&encounter, at)?,
        None => state.ledger.visit(&encounter)?,
    };
    Ok(json!({
        "visit": to_json(&visit)?,
        "location_visits": to_json(&state.ledger.location_visits(&encounter)?)?,
        "planned_movements": to_json(&state.ledger.planned_movements(&encounter)?)?,
    }))
}

fn visit_audits(state: &AppState, params: Option<&JsonValue>) -> Result<JsonValue, RpcError> {
    let VisitParams { encounter, .. } = parse_params(params)?;
    let audits = state.ledger.visit_audits(&encounter)?;
    Ok(json!({ "audits": to_json(&audits)? }))
}
