//! The isolated environment one execution runs in
//!
//! Everything here happens on the execution's own worker thread: a fresh
//! interpreter with ECMAScript built-ins, plus `console` and `require`.
//! There is no other route to the host.

use crate::bindings::{self, TimerQueue, TimerRuntime};
use crate::capabilities::CapabilityRegistry;
use crate::config::SandboxConfig;
use crate::diagnose::{
    RawFailure, PERMISSION_ERROR_NAME, SOURCE_MARKER, WRAPPER_PREFIX_LINES,
};
use crate::jobs::JobQueue;
use crate::logs::SharedLogs;
use crate::serialize::{self, SerializeError, SerializeOptions};
use boa_engine::object::FunctionObjectBuilder;
use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::vm::RuntimeLimits;
use boa_engine::{
    js_string, Context, JsArgs, JsError, JsNativeError, JsObject, JsResult, JsString, JsValue,
    NativeFunction, Script, Source,
};
use boa_gc::{custom_trace, Finalize, Trace};
use serde_json::Value;
use tracing::debug;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long the event loop sleeps between checks while waiting on a timer
const POLL_INTERVAL: Duration = Duration::from_millis(10);

const STALLED_MESSAGE: &str = "Execution stalled: the result can never settle";

/// Captured before any sandboxed code runs, so that code cannot swap them out
const PRELUDE: &str = r#"(() => {
  const apply = Reflect.apply;
  const then = Promise.prototype.then;
  const resolve = Promise.resolve.bind(Promise);
  return {
    keys: Object.keys,
    isArray: Array.isArray,
    settle: (value, onFulfilled, onRejected) => {
      apply(then, resolve(value), [onFulfilled, onRejected]);
    },
  };
})()"#;

/// Everything the worker thread needs for one execution
pub(crate) struct Job {
    pub source: String,
    pub registry: CapabilityRegistry,
    pub config: Arc<SandboxConfig>,
    pub logs: SharedLogs,
    pub cancel: Arc<AtomicBool>,
    pub deadline: Instant,
}

/// Host-side state shared by the native functions of one environment
pub(crate) struct Host {
    pub config: Arc<SandboxConfig>,
    pub registry: CapabilityRegistry,
    pub logs: SharedLogs,
    pub cancel: Arc<AtomicBool>,
    pub deadline: Instant,
    pub timers: RefCell<TimerQueue>,
    /// Error objects raised by [`Host::refuse`]
    refusals: RefCell<Vec<JsObject>>,
}

impl Host {
    /// True once the caller gave up on this execution
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Raise a capability refusal
    ///
    /// Only errors made here diagnose as permission failures. A script
    /// throwing its own `PermissionError` look-alike is an ordinary error.
    pub fn refuse(&self, message: &str, context: &mut Context) -> JsError {
        let error = bindings::named_error(PERMISSION_ERROR_NAME, message, context);
        self.refusals.borrow_mut().push(error.clone());
        JsError::from_opaque(error.into())
    }

    fn is_refusal(&self, object: &JsObject) -> bool {
        self.refusals
            .borrow()
            .iter()
            .any(|refused| JsObject::equals(refused, object))
    }

    /// Console output keeps every field; the denylist is for results only
    fn log_options(&self) -> SerializeOptions<'_> {
        SerializeOptions {
            denylist: &[],
            max_depth: self.config.max_depth,
            budget: self.config.max_log_bytes,
        }
    }

    fn result_options(&self) -> SerializeOptions<'_> {
        SerializeOptions {
            denylist: &self.config.denylist,
            max_depth: self.config.max_depth,
            budget: self.config.max_result_bytes,
        }
    }
}

/// Built-ins captured by the prelude
#[derive(Clone, Finalize)]
pub(crate) struct Intrinsics {
    pub keys: JsObject,
    pub is_array: JsObject,
    pub settle: JsObject,
}

unsafe impl Trace for Intrinsics {
    custom_trace!(this, mark, {
        mark(&this.keys);
        mark(&this.is_array);
        mark(&this.settle);
    });
}

impl Intrinsics {
    pub fn capture(context: &mut Context) -> JsResult<Self> {
        let captured = context.eval(Source::from_bytes(PRELUDE))?;
        let captured = captured
            .as_object()
            .map(|object| object.clone())
            .ok_or_else(|| internal_error("prelude did not return an object"))?;
        Ok(Self {
            keys: function_property(&captured, "keys", context)?,
            is_array: function_property(&captured, "isArray", context)?,
            settle: function_property(&captured, "settle", context)?,
        })
    }
}

fn function_property(object: &JsObject, name: &str, context: &mut Context) -> JsResult<JsObject> {
    object
        .get(JsString::from(name), context)?
        .as_object()
        .map(|function| function.clone())
        .filter(|function| function.is_callable())
        .ok_or_else(|| internal_error(&format!("prelude is missing '{name}'")))
}

fn internal_error(message: &str) -> JsError {
    JsNativeError::error()
        .with_message(message.to_string())
        .into()
}

#[derive(Finalize)]
struct HostCapture {
    host: Rc<Host>,
    intrinsics: Intrinsics,
}

unsafe impl Trace for HostCapture {
    custom_trace!(this, mark, {
        mark(&this.intrinsics);
    });
}

#[derive(Finalize)]
struct RequireCapture {
    host: Rc<Host>,
    intrinsics: Intrinsics,
    timers: JsObject,
}

unsafe impl Trace for RequireCapture {
    custom_trace!(this, mark, {
        mark(&this.intrinsics);
        mark(&this.timers);
    });
}

type Settlement = Rc<RefCell<Option<Result<Value, RawFailure>>>>;

#[derive(Finalize)]
struct SettleCapture {
    host: Rc<Host>,
    intrinsics: Intrinsics,
    slot: Settlement,
    prefix_lines: u32,
}

unsafe impl Trace for SettleCapture {
    custom_trace!(this, mark, {
        mark(&this.intrinsics);
    });
}

/// Run one execution to completion on the current thread
pub(crate) fn run(job: Job) -> Result<Value, RawFailure> {
    let Job {
        source,
        registry,
        config,
        logs,
        cancel,
        deadline,
    } = job;

    let host = Rc::new(Host {
        config,
        registry,
        logs,
        cancel,
        deadline,
        timers: RefCell::new(TimerQueue::default()),
        refusals: RefCell::new(Vec::new()),
    });

    let jobs = Rc::new(JobQueue::default());
    let mut context = Context::builder()
        .job_executor(jobs.clone())
        .build()
        .map_err(|err| RawFailure::Internal(format!("Sandbox setup failed: {err}")))?;
    let mut limits = RuntimeLimits::default();
    limits.set_loop_iteration_limit(host.config.loop_iteration_limit);
    limits.set_recursion_limit(host.config.recursion_limit);
    limits.set_stack_size_limit(host.config.stack_size_limit);
    context.set_runtime_limits(limits);

    let result = execute(&source, &host, &jobs, &mut context);
    // Recorded refusals are GC roots that reach closures holding `host`
    host.refusals.borrow_mut().clear();
    result
}

fn execute(
    source: &str,
    host: &Rc<Host>,
    jobs: &JobQueue,
    context: &mut Context,
) -> Result<Value, RawFailure> {
    let setup = |context: &mut Context| -> JsResult<(Intrinsics, TimerRuntime)> {
        let intrinsics = Intrinsics::capture(context)?;
        let timers = TimerRuntime::install(host.clone(), context)?;
        register_console(context, host, &intrinsics)?;
        register_require(context, host, &intrinsics, &timers.module)?;
        Ok((intrinsics, timers))
    };
    let (intrinsics, timers) = setup(context)
        .map_err(|err| RawFailure::Internal(format!("Sandbox setup failed: {err}")))?;

    let (script, prefix_lines) = compile(source, context)?;
    let completion = script
        .evaluate(context)
        .map_err(|err| failure_from_error(err, host, context, prefix_lines))?;

    let slot: Settlement = Rc::new(RefCell::new(None));
    let on_fulfilled = settle_function(host, &intrinsics, &slot, prefix_lines, true, context);
    let on_rejected = settle_function(host, &intrinsics, &slot, prefix_lines, false, context);
    intrinsics
        .settle
        .call(
            &JsValue::undefined(),
            &[completion, on_fulfilled.into(), on_rejected.into()],
            context,
        )
        .map_err(|err| failure_from_error(err, host, context, prefix_lines))?;

    let result = drive(context, host, jobs, &timers.fire, &slot, prefix_lines)?;

    let size = serde_json::to_string(&result).map(|s| s.len()).unwrap_or(0);
    if size > host.config.max_result_bytes {
        return Err(result_too_large(host.config.max_result_bytes));
    }
    Ok(result)
}

/// Parse the source as a plain script, falling back to the async wrapper
/// for sources that only make sense inside a function body (top-level
/// `await` or `return`).
fn compile(source: &str, context: &mut Context) -> Result<(Script, u32), RawFailure> {
    let plain_error = match parse(source, context) {
        Ok(script) => return Ok((script, 0)),
        Err(err) => err,
    };

    let wrapped = format!("(async () => {{\n{source}\n}})()");
    match parse(&wrapped, context) {
        Ok(script) => Ok((script, WRAPPER_PREFIX_LINES)),
        Err(_) => Err(RawFailure::Compile(error_message(&plain_error))),
    }
}

fn parse(source: &str, context: &mut Context) -> JsResult<Script> {
    let source = Source::from_bytes(source).with_path(Path::new(SOURCE_MARKER));
    Script::parse(source, None, context)
}

/// Run jobs and timers until the result settles, time runs out, or nothing
/// is left that could settle it
///
/// Promise jobs run one at a time with the deadline checked between them,
/// so a script that keeps queueing jobs still stops at the deadline.
fn drive(
    context: &mut Context,
    host: &Host,
    jobs: &JobQueue,
    fire: &JsObject,
    slot: &Settlement,
    prefix_lines: u32,
) -> Result<Value, RawFailure> {
    loop {
        if let Some(settled) = slot.borrow_mut().take() {
            return settled;
        }
        if host.is_cancelled() || host.remaining().is_zero() {
            debug!(pending_jobs = jobs.len(), "event loop stopped at the deadline");
            return Err(deadline_exceeded(host));
        }

        if let Some(ran) = jobs.run_next(context) {
            ran.map_err(|err| failure_from_error(err, host, context, prefix_lines))?;
            continue;
        }

        let next_due = host.timers.borrow_mut().next_due();
        let Some(due) = next_due else {
            return Err(RawFailure::Timeout(STALLED_MESSAGE.to_string()));
        };

        let now = Instant::now();
        if due > now {
            std::thread::sleep((due - now).min(POLL_INTERVAL).min(host.remaining()));
            continue;
        }

        let fired = host.timers.borrow_mut().pop_due(now);
        if let Some(id) = fired {
            fire.call(&JsValue::undefined(), &[JsValue::from(id)], context)
                .map_err(|err| failure_from_error(err, host, context, prefix_lines))?;
        }
    }
}

fn deadline_exceeded(host: &Host) -> RawFailure {
    RawFailure::Timeout(format!(
        "Script execution timed out after {}ms",
        host.config.timeout_ms
    ))
}

fn result_too_large(limit: usize) -> RawFailure {
    RawFailure::Internal(format!("Result exceeds the {limit} byte limit"))
}

fn settle_function(
    host: &Rc<Host>,
    intrinsics: &Intrinsics,
    slot: &Settlement,
    prefix_lines: u32,
    fulfilled: bool,
    context: &mut Context,
) -> JsObject {
    let capture = SettleCapture {
        host: host.clone(),
        intrinsics: intrinsics.clone(),
        slot: slot.clone(),
        prefix_lines,
    };
    let function = if fulfilled {
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &SettleCapture, ctx| {
                let options = captures.host.result_options();
                let settled = match serialize::to_json(
                    args.get_or_undefined(0),
                    &captures.intrinsics,
                    options,
                    ctx,
                ) {
                    Ok(value) => Ok(value),
                    Err(SerializeError::TooLarge) => {
                        Err(result_too_large(captures.host.config.max_result_bytes))
                    }
                    Err(SerializeError::Js(err)) => {
                        Err(failure_from_error(err, &captures.host, ctx, captures.prefix_lines))
                    }
                };
                *captures.slot.borrow_mut() = Some(settled);
                Ok(JsValue::undefined())
            },
            capture,
        )
    } else {
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &SettleCapture, ctx| {
                let failure = failure_from_value(
                    args.get_or_undefined(0),
                    &captures.host,
                    ctx,
                    captures.prefix_lines,
                );
                *captures.slot.borrow_mut() = Some(Err(failure));
                Ok(JsValue::undefined())
            },
            capture,
        )
    };
    FunctionObjectBuilder::new(context.realm(), function)
        .length(1)
        .constructor(false)
        .build()
        .into()
}

fn register_console(context: &mut Context, host: &Rc<Host>, intrinsics: &Intrinsics) -> JsResult<()> {
    let mut console = ObjectInitializer::new(context);
    for level in ["log", "info", "warn", "error", "debug"] {
        let capture = HostCapture {
            host: host.clone(),
            intrinsics: intrinsics.clone(),
        };
        let function = NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &HostCapture, ctx| {
                let host = &captures.host;
                if host.is_cancelled() {
                    return Ok(JsValue::undefined());
                }
                for arg in args {
                    let entry = serialize::to_json(arg, &captures.intrinsics, host.log_options(), ctx);
                    let mut logs = host.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    match entry {
                        Ok(value) => {
                            logs.push(value);
                        }
                        Err(SerializeError::TooLarge) => logs.mark_dropped(),
                        Err(SerializeError::Js(err)) => return Err(err),
                    }
                }
                Ok(JsValue::undefined())
            },
            capture,
        );
        console.function(function, JsString::from(level), 0);
    }
    let console = console.build();
    context.register_global_property(js_string!("console"), console, Attribute::all())
}

fn register_require(
    context: &mut Context,
    host: &Rc<Host>,
    intrinsics: &Intrinsics,
    timers: &JsObject,
) -> JsResult<()> {
    let capture = RequireCapture {
        host: host.clone(),
        intrinsics: intrinsics.clone(),
        timers: timers.clone(),
    };
    let require = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures: &RequireCapture, ctx| {
            let name = bindings::arg_string(args, 0, ctx)?;
            match captures.host.registry.lookup(&name) {
                Ok(capability) => bindings::module_for(
                    capability,
                    &captures.host,
                    &captures.intrinsics,
                    &captures.timers,
                    ctx,
                ),
                Err(denied) => Err(captures.host.refuse(&denied.to_string(), ctx)),
            }
        },
        capture,
    );
    context.register_global_builtin_callable(js_string!("require"), 1, require)
}

/// Turn an error escaping the sandboxed code into a raw failure
pub(crate) fn failure_from_error(
    err: JsError,
    host: &Host,
    context: &mut Context,
    prefix_lines: u32,
) -> RawFailure {
    if let Some(native) = err.as_native() {
        if native.is_runtime_limit() {
            // Loop limits stand in for CPU time; recursion and stack
            // limits are ordinary runtime failures
            let message = native.message().to_string();
            if message.to_ascii_lowercase().contains("loop iteration") {
                return RawFailure::Timeout(
                    "Script execution exceeded the loop iteration limit".to_string(),
                );
            }
            return RawFailure::Thrown {
                name: None,
                message,
                trace: err.to_string(),
                prefix_lines,
            };
        }
        let native = native.clone();
        let value = err.to_opaque(context);
        let mut failure = failure_from_value(&value, host, context, prefix_lines);
        if let RawFailure::Thrown { trace, .. } = &mut failure {
            // The native form carries the position the engine raised it at
            trace.insert_str(0, &format!("{native}\n"));
        }
        return failure;
    }
    let value = err.to_opaque(context);
    failure_from_value(&value, host, context, prefix_lines)
}

/// Read `name`, `message` and `stack` off a thrown value. A thrown
/// primitive becomes its string form.
pub(crate) fn failure_from_value(
    value: &JsValue,
    host: &Host,
    context: &mut Context,
    prefix_lines: u32,
) -> RawFailure {
    let Some(object) = value.as_object().map(|object| object.clone()) else {
        let message = value
            .to_string(context)
            .map(|s| s.to_std_string_escaped())
            .unwrap_or_else(|_| "Uncaught exception".to_string());
        return RawFailure::Thrown {
            name: None,
            message,
            trace: String::new(),
            prefix_lines,
        };
    };

    let read = |key: &str, context: &mut Context| -> Option<String> {
        object
            .get(JsString::from(key), context)
            .ok()
            .and_then(|value| value.as_string().map(|s| s.to_std_string_escaped()))
    };
    let message = match read("message", context) {
        Some(message) => message,
        None => value
            .to_string(context)
            .map(|s| s.to_std_string_escaped())
            .unwrap_or_else(|_| "Uncaught exception".to_string()),
    };
    if host.is_refusal(&object) {
        return RawFailure::Refused(message);
    }

    let name = read("name", context);
    let trace = trace_of(value, read("stack", context), context);
    RawFailure::Thrown {
        name,
        message,
        trace,
        prefix_lines,
    }
}

/// Diagnostic text of a thrown value, searched later for the source marker
///
/// Starts with the `stack` property. Error objects add the engine's native
/// form, which carries the raise position, and their display form.
fn trace_of(value: &JsValue, stack: Option<String>, context: &mut Context) -> String {
    let mut trace = stack.unwrap_or_default();
    if let Ok(native) = JsError::from_opaque(value.clone()).try_native(context) {
        trace.push('\n');
        trace.push_str(&native.to_string());
        trace.push('\n');
        trace.push_str(&value.display().to_string());
    }
    trace
}

fn error_message(err: &JsError) -> String {
    match err.as_native() {
        Some(native) => native.message().to_string(),
        None => err.to_string(),
    }
}
