//! Line-delimited JSON spoken with the desktop UI over stdin/stdout.

use crate::error::AppError;
use crate::events::EngineEvent;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Everything written to stdout, one JSON object per line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Response { id: Option<u64>, result: Value },
    Event(EngineEvent),
}

/// On failure the request id is still recovered when the line was at least valid JSON.
pub fn parse_request(line: &str) -> Result<RpcRequest, (Option<u64>, AppError)> {
    let value: Value = serde_json::from_str(line).map_err(|e| (None, AppError::from(e)))?;
    let id = value.get("id").and_then(Value::as_u64);
    serde_json::from_value(value).map_err(|e| (id, AppError::InvalidInputArgument(format!("Malformed request: {}", e))))
}

/// `{"success": true}` merged with the fields of `payload` when it serialises to an object.
pub fn success<T: Serialize>(payload: T) -> Value {
    let mut body = Map::new();
    body.insert("success".to_string(), Value::Bool(true));
    match serde_json::to_value(payload) {
        Ok(Value::Object(fields)) => body.extend(fields),
        Ok(Value::Null) => {}
        Ok(other) => {
            body.insert("value".to_string(), other);
        }
        Err(e) => return failure(&AppError::from(e)),
    }
    Value::Object(body)
}

pub fn failure(err: &AppError) -> Value {
    json!({ "success": false, "error": err.to_string(), "kind": err.kind() })
}
