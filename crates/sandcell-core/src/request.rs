//! Inbound request parsing
//!
//! Accepts the JSON body `{ "sourceCode": "...", "requestedCapabilities": [...] }`
//! and the query-string form of the same request. `code` is an alias of
//! `sourceCode`; a single capability string is a one-element list.

use sandcell_sandbox::ExecutionRequest;
use serde_json::Value;
use std::collections::HashMap;

/// Why a request body was refused before reaching the engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Request body must be a JSON object")]
    NotAnObject,

    #[error("Code parameter is required")]
    MissingCode,

    #[error("Code parameter must be a string")]
    InvalidCode,

    #[error("requestedCapabilities must be a string or an array of strings")]
    InvalidCapabilities,
}

/// Parse a JSON request body
pub fn parse_request(body: &Value) -> Result<ExecutionRequest, RequestError> {
    let fields = body.as_object().ok_or(RequestError::NotAnObject)?;

    let code = match fields.get("sourceCode").or_else(|| fields.get("code")) {
        None | Some(Value::Null) => return Err(RequestError::MissingCode),
        Some(Value::String(code)) => code.clone(),
        Some(_) => return Err(RequestError::InvalidCode),
    };
    let capabilities = parse_capabilities(fields.get("requestedCapabilities"))?;

    Ok(ExecutionRequest::new(code).with_capabilities(capabilities))
}

/// Normalise the `requestedCapabilities` field
///
/// Absent or `null` is an empty list.
pub fn parse_capabilities(value: Option<&Value>) -> Result<Vec<String>, RequestError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(name)) => Ok(vec![name.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or(RequestError::InvalidCapabilities)
            })
            .collect(),
        Some(_) => Err(RequestError::InvalidCapabilities),
    }
}

/// Parse the query-string form: `?code=...&capability=fs,path`
///
/// `sourceCode` and `requestedCapabilities` are accepted as the long names.
/// Capability lists are comma separated; empty segments are ignored.
pub fn parse_query(params: &HashMap<String, String>) -> Result<ExecutionRequest, RequestError> {
    let code = params
        .get("code")
        .or_else(|| params.get("sourceCode"))
        .ok_or(RequestError::MissingCode)?;

    let capabilities = params
        .get("capability")
        .or_else(|| params.get("requestedCapabilities"))
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(ExecutionRequest::new(code.as_str()).with_capabilities(capabilities))
}
