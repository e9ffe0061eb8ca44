//! Host modules handed out by `require`
//!
//! One builder per [`Capability`] variant. Each call builds a fresh module
//! object, except `timers`, which is shared with the environment's event loop.

mod fs;
mod http;
mod ids;
mod path;
mod timers;

pub(crate) use timers::{TimerQueue, TimerRuntime};

use crate::capabilities::Capability;
use crate::environment::{Host, Intrinsics};
use boa_engine::object::builtins::JsPromise;
use boa_engine::{js_string, Context, JsError, JsNativeError, JsObject, JsResult, JsString, JsValue};
use std::rc::Rc;

pub(crate) fn module_for(
    capability: &Capability,
    host: &Rc<Host>,
    intrinsics: &Intrinsics,
    timers: &JsObject,
    context: &mut Context,
) -> JsResult<JsValue> {
    match capability {
        Capability::Path => Ok(path::module(context).into()),
        Capability::Fs(policy) => Ok(fs::module(policy.clone(), host.clone(), context).into()),
        Capability::Http(policy) => {
            let transport = http::HttpTransport::new(policy.clone(), host.clone());
            Ok(http::axios_module(transport, intrinsics, context).into())
        }
        Capability::Fetch(policy) => {
            let transport = http::HttpTransport::new(policy.clone(), host.clone());
            Ok(http::fetch_function(transport, intrinsics, context).into())
        }
        Capability::Timers => Ok(timers.clone().into()),
        Capability::Uuid => Ok(ids::module(context).into()),
    }
}

/// Argument `index` converted with `String(value)` semantics
pub(crate) fn arg_string(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    let value = args.get(index).cloned().unwrap_or_default();
    Ok(value.to_string(context)?.to_std_string_escaped())
}

/// An `Error` object whose `name` is `name`
pub(crate) fn named_error(name: &str, message: &str, context: &mut Context) -> JsObject {
    let error = JsNativeError::error()
        .with_message(message.to_string())
        .to_opaque(context);
    let _ = error.set(js_string!("name"), JsString::from(name), true, context);
    error
}

/// A promise already settled with `result`
///
/// Runtime limit errors cannot be caught by script code, so they propagate
/// instead of rejecting the promise.
pub(crate) fn settled(result: JsResult<JsValue>, context: &mut Context) -> JsResult<JsValue> {
    let (promise, resolvers) = JsPromise::new_pending(context);
    match result {
        Ok(value) => {
            resolvers
                .resolve
                .call(&JsValue::undefined(), &[value], context)?;
        }
        Err(err) if is_runtime_limit(&err) => return Err(err),
        Err(err) => {
            let reason = err.to_opaque(context);
            resolvers
                .reject
                .call(&JsValue::undefined(), &[reason], context)?;
        }
    }
    Ok(promise.into())
}

/// True for the engine's uncatchable loop, recursion and stack limit errors
pub(crate) fn is_runtime_limit(err: &JsError) -> bool {
    err.as_native().is_some_and(JsNativeError::is_runtime_limit)
}
