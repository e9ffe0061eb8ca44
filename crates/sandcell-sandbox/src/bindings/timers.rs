//! `timers`: setTimeout / clearTimeout / sleep
//!
//! Callbacks live on the JavaScript side; the host only keeps the due times.
//! The event loop in the environment pops due ids and hands them back to
//! `fire`.

use crate::environment::Host;
use boa_engine::object::FunctionObjectBuilder;
use boa_engine::{
    js_string, Context, JsArgs, JsNativeError, JsObject, JsResult, JsString, JsValue,
    NativeFunction, Source,
};
use boa_gc::{empty_trace, Finalize, Trace};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Ceiling on timers waiting at once
const MAX_PENDING_TIMERS: usize = 10_000;

const FACTORY: &str = r#"(function (schedule, unschedule) {
  const pending = new Map();
  let nextId = 1;
  function setTimeout(callback, ms, ...args) {
    if (typeof callback !== 'function') {
      throw new TypeError('The "callback" argument must be of type function');
    }
    const id = nextId++;
    pending.set(id, () => callback(...args));
    schedule(id, Number(ms) || 0);
    return id;
  }
  function clearTimeout(id) {
    if (pending.delete(id)) {
      unschedule(id);
    }
  }
  function sleep(ms) {
    return new Promise((resolve) => setTimeout(resolve, ms));
  }
  function fire(id) {
    const task = pending.get(id);
    if (task !== undefined) {
      pending.delete(id);
      task();
    }
  }
  return { module: Object.freeze({ setTimeout, clearTimeout, sleep }), fire };
})"#;

/// Due times of pending timers, earliest first, ties in scheduling order
///
/// Cancelled ids stay in the heap until they reach the front, but stop
/// counting as pending at once.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, u32)>>,
    scheduled: HashSet<u32>,
    sequence: u64,
}

impl TimerQueue {
    pub fn schedule(&mut self, id: u32, delay: Duration) -> bool {
        if self.scheduled.len() >= MAX_PENDING_TIMERS || !self.scheduled.insert(id) {
            return false;
        }
        self.sequence += 1;
        self.heap
            .push(Reverse((Instant::now() + delay, self.sequence, id)));
        true
    }

    /// Forget a pending timer. False if it was not pending.
    pub fn cancel(&mut self, id: u32) -> bool {
        self.scheduled.remove(&id)
    }

    pub fn next_due(&mut self) -> Option<Instant> {
        self.prune();
        self.heap.peek().map(|Reverse((due, _, _))| *due)
    }

    /// Take the earliest timer if it is due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<u32> {
        self.prune();
        match self.heap.peek() {
            Some(Reverse((due, _, _))) if *due <= now => {
                let id = self.heap.pop().map(|Reverse((_, _, id))| id)?;
                self.scheduled.remove(&id);
                Some(id)
            }
            _ => None,
        }
    }

    /// Drop cancelled entries from the front of the heap
    fn prune(&mut self) {
        while let Some(Reverse((_, _, id))) = self.heap.peek() {
            if self.scheduled.contains(id) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// The per-environment timer module and the hook that runs a due callback
pub(crate) struct TimerRuntime {
    pub module: JsObject,
    pub fire: JsObject,
}

#[derive(Finalize)]
struct ScheduleCapture {
    host: Rc<Host>,
}

unsafe impl Trace for ScheduleCapture {
    empty_trace!();
}

impl TimerRuntime {
    pub fn install(host: Rc<Host>, context: &mut Context) -> JsResult<Self> {
        let schedule = NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &ScheduleCapture, ctx| {
                let host = &captures.host;
                if host.is_cancelled() {
                    return Ok(JsValue::undefined());
                }
                let id = args.get_or_undefined(0).to_u32(ctx)?;
                let ms = args.get_or_undefined(1).to_number(ctx)?;
                let delay = if ms.is_finite() && ms > 0.0 {
                    Duration::from_secs_f64(ms / 1000.0)
                } else {
                    Duration::ZERO
                };
                if !host.timers.borrow_mut().schedule(id, delay) {
                    return Err(JsNativeError::range()
                        .with_message(format!("Too many pending timers (limit {MAX_PENDING_TIMERS})"))
                        .into());
                }
                Ok(JsValue::undefined())
            },
            ScheduleCapture { host: host.clone() },
        );
        let schedule = FunctionObjectBuilder::new(context.realm(), schedule)
            .name(js_string!("schedule"))
            .length(2)
            .constructor(false)
            .build();

        let unschedule = NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &ScheduleCapture, ctx| {
                let id = args.get_or_undefined(0).to_u32(ctx)?;
                captures.host.timers.borrow_mut().cancel(id);
                Ok(JsValue::undefined())
            },
            ScheduleCapture { host },
        );
        let unschedule = FunctionObjectBuilder::new(context.realm(), unschedule)
            .name(js_string!("unschedule"))
            .length(1)
            .constructor(false)
            .build();

        let factory = context.eval(Source::from_bytes(FACTORY))?;
        let factory = factory
            .as_object()
            .map(|factory| factory.clone())
            .ok_or_else(|| JsNativeError::typ().with_message("timer factory is not a function"))?;
        let runtime = factory.call(
            &JsValue::undefined(),
            &[schedule.into(), unschedule.into()],
            context,
        )?;
        let runtime = runtime
            .as_object()
            .map(|runtime| runtime.clone())
            .ok_or_else(|| JsNativeError::typ().with_message("timer factory returned no runtime"))?;

        let field = |name: JsString, context: &mut Context| -> JsResult<JsObject> {
            runtime
                .get(name, context)?
                .as_object()
                .map(|object| object.clone())
                .ok_or_else(|| JsNativeError::typ().with_message("timer runtime is incomplete").into())
        };
        Ok(Self {
            module: field(js_string!("module"), context)?,
            fire: field(js_string!("fire"), context)?,
        })
    }
}
