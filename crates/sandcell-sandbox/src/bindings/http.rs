//! `http` (axios-style client) and `fetch`
//!
//! Requests run on the worker thread with a blocking client, so the promises
//! handed back are already settled when the sandboxed code sees them. Every
//! request (and every redirect) is checked against the host allow-list, and
//! is bounded by both the policy timeout and the execution deadline.

use super::{arg_string, settled};
use crate::capabilities::HttpPolicy;
use crate::environment::{Host, Intrinsics};
use crate::serialize::{self, SerializeError, SerializeOptions};
use boa_engine::object::{FunctionObjectBuilder, ObjectInitializer};
use boa_engine::{
    js_string, Context, JsError, JsNativeError, JsObject, JsResult, JsString, JsValue,
    NativeFunction,
};
use boa_gc::{custom_trace, empty_trace, Finalize, Trace};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::{redirect, Method, Url};
use serde_json::{json, Map, Value};
use std::cell::OnceCell;
use std::io::Read;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

const MAX_REDIRECTS: usize = 5;

/// Nesting allowed in request configs and bodies
const MAX_REQUEST_DEPTH: usize = 32;

pub(crate) struct HttpTransport {
    policy: HttpPolicy,
    host: Rc<Host>,
    client: OnceCell<Client>,
}

struct Outgoing {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
    json_body: bool,
    timeout: Option<Duration>,
}

struct Incoming {
    status: u16,
    status_text: String,
    url: String,
    headers: Map<String, Value>,
    body: String,
}

#[derive(Debug)]
enum HttpFailure {
    Denied(String),
    Invalid(String),
    Cancelled,
    Transport(String),
    TooLarge(usize),
}

impl HttpFailure {
    fn into_js(self, host: &Host, context: &mut Context) -> JsError {
        match self {
            HttpFailure::Denied(message) => host.refuse(&message, context),
            HttpFailure::Invalid(message) => JsNativeError::typ().with_message(message).into(),
            HttpFailure::Cancelled => JsNativeError::error()
                .with_message("Request cancelled: the execution deadline passed")
                .into(),
            HttpFailure::Transport(message) => JsNativeError::error().with_message(message).into(),
            HttpFailure::TooLarge(limit) => JsNativeError::range()
                .with_message(format!("Response body exceeds the {limit} byte limit"))
                .into(),
        }
    }
}

impl HttpTransport {
    pub fn new(policy: HttpPolicy, host: Rc<Host>) -> Self {
        Self {
            policy,
            host,
            client: OnceCell::new(),
        }
    }

    fn client(&self) -> Result<&Client, HttpFailure> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let policy = self.policy.clone();
        let client = Client::builder()
            .user_agent(concat!("sandcell/", env!("CARGO_PKG_VERSION")))
            .redirect(redirect::Policy::custom(move |attempt| {
                let allowed = attempt
                    .url()
                    .host_str()
                    .is_some_and(|host| policy.can_access_host(host));
                if allowed && attempt.previous().len() < MAX_REDIRECTS {
                    attempt.follow()
                } else {
                    attempt.stop()
                }
            }))
            .build()
            .map_err(|e| HttpFailure::Transport(format!("HTTP client unavailable: {e}")))?;
        Ok(self.client.get_or_init(|| client))
    }

    fn send(&self, outgoing: Outgoing) -> Result<Incoming, HttpFailure> {
        if self.host.is_cancelled() {
            return Err(HttpFailure::Cancelled);
        }

        let url = Url::parse(&outgoing.url)
            .map_err(|e| HttpFailure::Invalid(format!("Invalid URL '{}': {e}", outgoing.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HttpFailure::Invalid(format!(
                "Unsupported protocol {}:",
                url.scheme()
            )));
        }
        let host = url.host_str().unwrap_or_default();
        if !self.policy.can_access_host(host) {
            return Err(HttpFailure::Denied(format!("Host '{host}' is not permitted")));
        }

        let remaining = self.host.remaining();
        if remaining.is_zero() {
            return Err(HttpFailure::Cancelled);
        }
        let mut timeout = self.policy.timeout.min(remaining);
        if let Some(requested) = outgoing.timeout {
            timeout = timeout.min(requested);
        }

        debug!(method = %outgoing.method, url = %url, "outbound request");
        let mut request = self
            .client()?
            .request(outgoing.method, url)
            .timeout(timeout);
        let mut has_content_type = false;
        for (name, value) in &outgoing.headers {
            has_content_type |= name.eq_ignore_ascii_case(CONTENT_TYPE.as_str());
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = outgoing.body {
            if outgoing.json_body && !has_content_type {
                request = request.header(CONTENT_TYPE, "application/json");
            }
            request = request.body(body);
        }

        let response = request
            .send()
            .map_err(|e| HttpFailure::Transport(e.to_string()))?;
        let status = response.status();
        let final_url = response.url().to_string();

        let mut headers = Map::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            match headers.get_mut(name.as_str()) {
                Some(Value::String(existing)) => {
                    existing.push_str(", ");
                    existing.push_str(&value);
                }
                _ => {
                    headers.insert(name.as_str().to_string(), Value::String(value));
                }
            }
        }

        let limit = self.policy.max_body_bytes;
        let mut bytes = Vec::new();
        response
            .take(limit as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| HttpFailure::Transport(e.to_string()))?;
        if bytes.len() > limit {
            return Err(HttpFailure::TooLarge(limit));
        }

        Ok(Incoming {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            url: final_url,
            headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    /// Convert a request config or body to JSON, keeping every field
    fn plain_json(
        &self,
        value: &JsValue,
        intrinsics: &Intrinsics,
        context: &mut Context,
    ) -> JsResult<Value> {
        let options = SerializeOptions {
            denylist: &[],
            max_depth: MAX_REQUEST_DEPTH,
            budget: self.policy.max_body_bytes,
        };
        match serialize::to_json(value, intrinsics, options, context) {
            Ok(value) => Ok(value),
            Err(SerializeError::Js(err)) => Err(err),
            Err(SerializeError::TooLarge) => Err(JsNativeError::range()
                .with_message(format!(
                    "Request body exceeds the {} byte limit",
                    self.policy.max_body_bytes
                ))
                .into()),
        }
    }
}

fn parse_method(name: &str) -> Result<Method, HttpFailure> {
    Method::from_bytes(name.to_ascii_uppercase().as_bytes())
        .map_err(|_| HttpFailure::Invalid(format!("Invalid HTTP method '{name}'")))
}

fn header_list(headers: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Object(headers)) = headers else {
        return Vec::new();
    };
    headers
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| {
            let value = match value {
                Value::String(value) => value.clone(),
                other => other.to_string(),
            };
            (name.clone(), value)
        })
        .collect()
}

/// Body text and whether it was JSON-encoded
fn body_of(data: Option<&Value>) -> (Option<String>, bool) {
    match data {
        None | Some(Value::Null) => (None, false),
        Some(Value::String(text)) => (Some(text.clone()), false),
        Some(other) => (Some(other.to_string()), true),
    }
}

/// Append `params` to the query string
fn with_params(url: &str, params: Option<&Value>) -> String {
    let Some(Value::Object(params)) = params else {
        return url.to_string();
    };
    if params.is_empty() {
        return url.to_string();
    }
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    {
        let mut pairs = parsed.query_pairs_mut();
        for (name, value) in params {
            match value {
                Value::Null => {}
                Value::String(value) => {
                    pairs.append_pair(name, value);
                }
                other => {
                    pairs.append_pair(name, &other.to_string());
                }
            }
        }
    }
    parsed.to_string()
}

/// Response body as JSON when it parses, as text otherwise
fn response_data(body: &str) -> Value {
    if body.is_empty() {
        return Value::String(String::new());
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Get,
    Delete,
    Head,
    Post,
    Put,
    Patch,
    /// Method taken from the config
    Request,
}

impl Verb {
    fn method(self) -> Option<Method> {
        match self {
            Verb::Get => Some(Method::GET),
            Verb::Delete => Some(Method::DELETE),
            Verb::Head => Some(Method::HEAD),
            Verb::Post => Some(Method::POST),
            Verb::Put => Some(Method::PUT),
            Verb::Patch => Some(Method::PATCH),
            Verb::Request => None,
        }
    }

    fn has_body(self) -> bool {
        matches!(self, Verb::Post | Verb::Put | Verb::Patch)
    }
}

#[derive(Finalize)]
struct AxiosCapture {
    transport: Rc<HttpTransport>,
    intrinsics: Intrinsics,
    verb: Verb,
}

unsafe impl Trace for AxiosCapture {
    custom_trace!(this, mark, {
        mark(&this.intrinsics);
    });
}

pub(crate) fn axios_module(
    transport: HttpTransport,
    intrinsics: &Intrinsics,
    context: &mut Context,
) -> JsObject {
    let transport = Rc::new(transport);
    let verbs = [
        ("get", Verb::Get, 2),
        ("delete", Verb::Delete, 2),
        ("head", Verb::Head, 2),
        ("post", Verb::Post, 3),
        ("put", Verb::Put, 3),
        ("patch", Verb::Patch, 3),
        ("request", Verb::Request, 1),
    ];

    let mut module = ObjectInitializer::new(context);
    for (name, verb, length) in verbs {
        let function = NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &AxiosCapture, ctx| {
                let response = axios_request(captures, args, ctx);
                settled(response, ctx)
            },
            AxiosCapture {
                transport: transport.clone(),
                intrinsics: intrinsics.clone(),
                verb,
            },
        );
        module.function(function, JsString::from(name), length);
    }
    module.build()
}

fn axios_request(captures: &AxiosCapture, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let transport = &captures.transport;
    let verb = captures.verb;
    let (url_arg, data_arg, config_arg) = match verb {
        Verb::Request => (None, None, args.first()),
        verb if verb.has_body() => (args.first(), args.get(1), args.get(2)),
        _ => (args.first(), None, args.get(1)),
    };

    let mut config = match config_arg {
        Some(value) if value.is_object() => {
            match transport.plain_json(value, &captures.intrinsics, context)? {
                Value::Object(map) => map,
                _ => Map::new(),
            }
        }
        _ => Map::new(),
    };
    if url_arg.is_some() {
        let url = arg_string(args, 0, context)?;
        config.insert("url".to_string(), Value::String(url));
    }
    if let Some(data) = data_arg.filter(|data| !data.is_undefined()) {
        let data = transport.plain_json(data, &captures.intrinsics, context)?;
        config.insert("data".to_string(), data);
    }

    let method = match verb.method() {
        Some(method) => method,
        None => {
            let name = config.get("method").and_then(Value::as_str).unwrap_or("get");
            parse_method(name).map_err(|failure| failure.into_js(&transport.host, context))?
        }
    };
    config.insert(
        "method".to_string(),
        Value::String(method.as_str().to_ascii_lowercase()),
    );

    let Some(url) = config.get("url").and_then(Value::as_str) else {
        return Err(JsNativeError::typ()
            .with_message("Request URL is required")
            .into());
    };
    let url = with_params(url, config.get("params"));
    let (body, json_body) = body_of(config.get("data"));
    let timeout = config
        .get("timeout")
        .and_then(Value::as_f64)
        .filter(|ms| ms.is_finite() && *ms > 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0));

    let outgoing = Outgoing {
        method: method.clone(),
        url,
        headers: header_list(config.get("headers")),
        body,
        json_body,
        timeout,
    };
    let incoming = transport
        .send(outgoing)
        .map_err(|failure| failure.into_js(&transport.host, context))?;

    let status = incoming.status;
    let response = json!({
        "status": status,
        "statusText": incoming.status_text,
        "headers": incoming.headers,
        "data": response_data(&incoming.body),
        "config": config,
        "request": { "method": method.as_str(), "url": incoming.url },
    });
    let response = JsValue::from_json(&response, context)?;

    if !(200..300).contains(&status) {
        let error = JsNativeError::error()
            .with_message(format!("Request failed with status code {status}"))
            .to_opaque(context);
        error.set(js_string!("status"), JsValue::from(u32::from(status)), true, context)?;
        error.set(js_string!("response"), response, true, context)?;
        return Err(JsError::from_opaque(error.into()));
    }
    Ok(response)
}

#[derive(Finalize)]
struct FetchCapture {
    transport: Rc<HttpTransport>,
    intrinsics: Intrinsics,
}

unsafe impl Trace for FetchCapture {
    custom_trace!(this, mark, {
        mark(&this.intrinsics);
    });
}

#[derive(Finalize)]
struct BodyCapture {
    body: Rc<str>,
}

unsafe impl Trace for BodyCapture {
    empty_trace!();
}

pub(crate) fn fetch_function(
    transport: HttpTransport,
    intrinsics: &Intrinsics,
    context: &mut Context,
) -> JsObject {
    let function = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures: &FetchCapture, ctx| {
            let response = fetch_request(captures, args, ctx);
            settled(response, ctx)
        },
        FetchCapture {
            transport: Rc::new(transport),
            intrinsics: intrinsics.clone(),
        },
    );
    FunctionObjectBuilder::new(context.realm(), function)
        .name(js_string!("fetch"))
        .length(2)
        .constructor(false)
        .build()
        .into()
}

fn fetch_request(captures: &FetchCapture, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let transport = &captures.transport;
    let url = arg_string(args, 0, context)?;
    let init = match args.get(1) {
        Some(value) if value.is_object() => {
            match transport.plain_json(value, &captures.intrinsics, context)? {
                Value::Object(map) => map,
                _ => Map::new(),
            }
        }
        _ => Map::new(),
    };

    let method = init.get("method").and_then(Value::as_str).unwrap_or("GET");
    let method = parse_method(method).map_err(|failure| failure.into_js(&transport.host, context))?;
    let (body, json_body) = body_of(init.get("body"));
    let outgoing = Outgoing {
        method,
        url,
        headers: header_list(init.get("headers")),
        body,
        json_body,
        timeout: None,
    };
    let incoming = transport
        .send(outgoing)
        .map_err(|failure| failure.into_js(&transport.host, context))?;

    let response = JsValue::from_json(
        &json!({
            "ok": (200..300).contains(&incoming.status),
            "status": incoming.status,
            "statusText": incoming.status_text,
            "url": incoming.url,
            "headers": incoming.headers,
        }),
        context,
    )?;
    let object = response
        .as_object()
        .map(|object| object.clone())
        .ok_or_else(|| JsNativeError::typ().with_message("response is not an object"))?;

    let body: Rc<str> = Rc::from(incoming.body.as_str());
    let text = NativeFunction::from_copy_closure_with_captures(
        |_this, _args, captures: &BodyCapture, ctx| {
            settled(Ok(JsString::from(&*captures.body).into()), ctx)
        },
        BodyCapture { body: body.clone() },
    );
    let json = NativeFunction::from_copy_closure_with_captures(
        |_this, _args, captures: &BodyCapture, ctx| {
            let parsed = match serde_json::from_str::<Value>(&captures.body) {
                Ok(value) => JsValue::from_json(&value, ctx),
                Err(e) => Err(JsNativeError::syntax()
                    .with_message(format!("Unexpected response body: {e}"))
                    .into()),
            };
            settled(parsed, ctx)
        },
        BodyCapture { body },
    );
    let text = FunctionObjectBuilder::new(context.realm(), text)
        .name(js_string!("text"))
        .length(0)
        .constructor(false)
        .build();
    let json = FunctionObjectBuilder::new(context.realm(), json)
        .name(js_string!("json"))
        .length(0)
        .constructor(false)
        .build();
    object.set(js_string!("text"), text, false, context)?;
    object.set(js_string!("json"), json, false, context)?;
    Ok(response)
}
