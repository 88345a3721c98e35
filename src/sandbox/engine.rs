//! The JavaScript context of one sandbox.
//!
//! Wraps a `boa_engine` [`Context`] that has evaluated the bootstrap
//! program. The bootstrap talks to Rust through a handful of `__host`
//! functions (frame posting, timers, fetch); Rust calls back into it through
//! the frozen `__sandbox` object.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use boa_engine::builtins::promise::{OperationType, PromiseState};
use boa_engine::context::HostHooks;
use boa_engine::module::Module;
use boa_engine::object::builtins::JsPromise;
use boa_engine::object::{JsObject, ObjectInitializer};
use boa_engine::property::Attribute;
use boa_engine::vm::RuntimeLimits;
use boa_engine::{
    Context, JsArgs, JsError, JsNativeError, JsNativeErrorKind, JsResult, JsString, JsValue,
    NativeFunction, Source,
};
use boa_gc::{empty_trace, Finalize, Trace};
use tracing::{debug, warn};

use super::net::{FetchResponse, Fetcher, USER_AGENT};
use super::timers::TimerQueue;
use super::worker::{Outbox, WorkerEvent, WorkerOptions};
use crate::error::SandboxError;
use crate::protocol::{encode_sandbox_frame, SandboxMessage};

const BOOTSTRAP: &str = include_str!("bootstrap.js");

/// Longest accepted timer delay (2^31 - 1 ms), larger values are clamped.
const MAX_TIMER_DELAY_MS: f64 = 2_147_483_647.0;

/// Reported when the engine aborts an evaluation it cannot turn into a
/// JavaScript exception.
const HALTED: &str = "RuntimeLimit: script exceeded an engine limit (call depth or loop iterations), sandbox halted";

/// Everything the `__host` functions need, shared by all of them.
struct HostState {
    outbox: Rc<dyn Outbox>,
    timers: RefCell<TimerQueue>,
    fetcher: Fetcher,
}

#[derive(Finalize)]
struct HostCapture {
    host: Rc<HostState>,
}

// No GC-managed values inside
unsafe impl Trace for HostCapture {
    empty_trace!();
}

type HostCall = fn(&HostState, &[JsValue], &mut Context) -> JsResult<JsValue>;

/// Collects promises rejected without a handler. A promise that gets a
/// handler later (in the same job drain) is taken off the list again.
#[derive(Default)]
struct RejectionTracker {
    unhandled: RefCell<Vec<JsObject>>,
}

impl RejectionTracker {
    fn forget(&self, promise: &JsObject) {
        self.unhandled
            .borrow_mut()
            .retain(|p| !JsObject::equals(p, promise));
    }

    fn take(&self) -> Vec<JsObject> {
        std::mem::take(&mut *self.unhandled.borrow_mut())
    }
}

impl HostHooks for RejectionTracker {
    fn promise_rejection_tracker(
        &self,
        promise: &JsObject,
        operation: OperationType,
        _context: &mut Context,
    ) {
        match operation {
            OperationType::Reject => self.unhandled.borrow_mut().push(promise.clone()),
            OperationType::Handle => self.forget(promise),
        }
    }
}

pub struct Engine {
    context: Context,
    host: Rc<HostState>,
    rejections: Rc<RejectionTracker>,
    /// The `__sandbox` object installed by the bootstrap.
    entry: JsObject,
    /// Evaluation promises of modules that have not settled yet.
    modules: Vec<JsPromise>,
    /// Set once an evaluation was aborted inside the engine; every later
    /// event is ignored.
    halted: bool,
}

impl Engine {
    /// Creates a fresh context and evaluates the bootstrap program in it.
    /// The bootstrap posts the `ready` frame itself.
    pub fn boot(
        outbox: Rc<dyn Outbox>,
        loopback: Sender<WorkerEvent>,
        options: &WorkerOptions,
    ) -> Result<Self, SandboxError> {
        let rejections = Rc::new(RejectionTracker::default());
        let mut context = Context::builder()
            .host_hooks(rejections.clone())
            .build()
            .map_err(|e| SandboxError::Bootstrap(e.to_string()))?;

        let mut limits = RuntimeLimits::default();
        if let Some(limit) = options.loop_iteration_limit {
            limits.set_loop_iteration_limit(limit);
        }
        if let Some(limit) = options.recursion_limit {
            limits.set_recursion_limit(limit);
        }
        context.set_runtime_limits(limits);

        let host = Rc::new(HostState {
            outbox,
            timers: RefCell::new(TimerQueue::new()),
            fetcher: Fetcher::new(options.allow_network, loopback),
        });
        install_host(&mut context, &host).map_err(|e| SandboxError::Bootstrap(e.to_string()))?;

        context
            .eval(Source::from_bytes(BOOTSTRAP))
            .map_err(|e| SandboxError::Bootstrap(e.to_string()))?;
        context
            .run_jobs()
            .map_err(|e| SandboxError::Bootstrap(e.to_string()))?;

        let entry = context
            .global_object()
            .get(JsString::from("__sandbox"), &mut context)
            .map_err(|e| SandboxError::Bootstrap(e.to_string()))?
            .as_object()
            .map(|object| object.clone())
            .ok_or_else(|| SandboxError::Bootstrap("__sandbox entry points missing".to_string()))?;

        Ok(Self {
            context,
            host,
            rejections,
            entry,
            modules: Vec::new(),
            halted: false,
        })
    }

    /// Evaluates `code` as the body of a top-level module.
    pub fn run_module(&mut self, code: &str) {
        self.guarded(|engine| {
            let module = match Module::parse(Source::from_bytes(code), None, &mut engine.context) {
                Ok(module) => module,
                Err(err) => {
                    let description = engine.describe_error(&err);
                    engine.report_error(description);
                    return;
                }
            };
            let promise = module.load_link_evaluate(&mut engine.context);
            engine.modules.push(promise);
            engine.checkpoint();
        });
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        if self.halted {
            return None;
        }
        self.host.timers.borrow().next_deadline()
    }

    /// Runs the callbacks of every timer due at `now`, each followed by a
    /// microtask checkpoint.
    pub fn fire_due_timers(&mut self, now: Instant) {
        let due = self.host.timers.borrow_mut().pop_due(now);
        self.guarded(|engine| {
            for id in due {
                if let Err(err) = engine.call_entry("fire", &[JsValue::from(id)]) {
                    let description = engine.describe_error(&err);
                    engine.report_error(description);
                }
                engine.checkpoint();
            }
        });
    }

    /// Settles the promise returned by `fetch()` call `id`.
    pub fn settle_fetch(&mut self, id: u32, outcome: Result<FetchResponse, String>) {
        let (ok, payload) = match outcome {
            Ok(response) => match serde_json::to_string(&response) {
                Ok(json) => (true, json),
                Err(e) => (false, e.to_string()),
            },
            Err(message) => (false, message),
        };
        let args = [
            JsValue::from(id),
            JsValue::from(ok),
            JsValue::from(JsString::from(payload.as_str())),
        ];
        self.guarded(|engine| {
            if let Err(err) = engine.call_entry("settleFetch", &args) {
                let description = engine.describe_error(&err);
                engine.report_error(description);
            }
            engine.checkpoint();
        });
    }

    /// Runs `step` unless the engine is halted. boa panics when some of its
    /// own paths (module evaluation among them) meet a runtime-limit error;
    /// such a panic halts this engine and becomes one error report.
    fn guarded(&mut self, step: impl FnOnce(&mut Self)) {
        if self.halted {
            debug!("Engine halted, event ignored");
            return;
        }
        if panic::catch_unwind(AssertUnwindSafe(|| step(&mut *self))).is_err() {
            warn!("Engine aborted an evaluation, halting sandbox");
            self.halted = true;
            self.report_error(HALTED.to_string());
        }
    }

    /// Drains the job queue, then reports modules that failed and promises
    /// that ended up rejected with no handler.
    pub fn checkpoint(&mut self) {
        if let Err(err) = self.context.run_jobs() {
            let description = self.describe_error(&err);
            self.report_error(description);
        }

        let mut pending = Vec::new();
        for promise in std::mem::take(&mut self.modules) {
            match promise.state() {
                PromiseState::Pending => pending.push(promise),
                PromiseState::Fulfilled(_) => {}
                PromiseState::Rejected(reason) => {
                    // Reported here, not again as an unhandled rejection
                    self.rejections.forget(&promise);
                    let description = describe(&reason, &mut self.context);
                    self.report_error(description);
                }
            }
        }
        self.modules = pending;

        for object in self.rejections.take() {
            let Ok(promise) = JsPromise::from_object(object) else {
                continue;
            };
            let PromiseState::Rejected(reason) = promise.state() else {
                continue;
            };
            // The engine does not mark a promise handled when the reaction
            // was attached while it was still pending; the bootstrap does.
            let handled = self
                .call_entry("isHandled", &[JsValue::from(promise.clone())])
                .map(|value| value.to_boolean())
                .unwrap_or(false);
            if !handled {
                let description = describe(&reason, &mut self.context);
                self.report_error(description);
            }
        }
    }

    fn call_entry(&mut self, name: &str, args: &[JsValue]) -> JsResult<JsValue> {
        let function = self.entry.get(JsString::from(name), &mut self.context)?;
        let Some(function) = function.as_callable() else {
            return Err(JsNativeError::typ()
                .with_message("sandbox entry point is not callable")
                .into());
        };
        let this = JsValue::from(self.entry.clone());
        function.call(&this, args, &mut self.context)
    }

    fn describe_error(&mut self, err: &JsError) -> String {
        // Runtime-limit errors have no JavaScript counterpart
        if let Some(native) = err.as_native() {
            if matches!(native.kind, JsNativeErrorKind::RuntimeLimit) {
                return err.to_string();
            }
        }
        let value = err.to_opaque(&mut self.context);
        describe(&value, &mut self.context)
    }

    fn report_error(&self, description: String) {
        debug!("Sandboxed code failed: {description}");
        self.host
            .outbox
            .post(encode_sandbox_frame(&SandboxMessage::Error(description)));
    }
}

/// `String(err)`, followed by the stack trace when the engine records one
/// that does not already repeat the message.
fn describe(value: &JsValue, context: &mut Context) -> String {
    let text = match value.to_string(context) {
        Ok(text) => text.to_std_string_escaped(),
        Err(_) => value.display().to_string(),
    };
    let Some(object) = value.as_object() else {
        return text;
    };
    let stack = match object.get(JsString::from("stack"), context) {
        Ok(stack) => stack
            .as_string()
            .map(|stack| stack.to_std_string_escaped())
            .unwrap_or_default(),
        Err(_) => String::new(),
    };
    if stack.is_empty() {
        text
    } else if stack.contains(&text) {
        stack
    } else {
        format!("{text}\n{stack}")
    }
}

// ── __host bindings ──────────────────────────────────────

fn install_host(context: &mut Context, host: &Rc<HostState>) -> JsResult<()> {
    let bind = |call: HostCall| {
        NativeFunction::from_copy_closure_with_captures(
            move |_this, args, capture: &HostCapture, ctx| call(&capture.host, args, ctx),
            HostCapture { host: host.clone() },
        )
    };

    let object = ObjectInitializer::new(context)
        .function(bind(host_post), JsString::from("post"), 1)
        .function(bind(host_echo), JsString::from("echo"), 2)
        .function(bind(host_schedule), JsString::from("schedule"), 2)
        .function(bind(host_cancel), JsString::from("cancel"), 1)
        .function(bind(host_fetch), JsString::from("fetch"), 3)
        .property(
            JsString::from("userAgent"),
            JsString::from(USER_AGENT),
            Attribute::READONLY,
        )
        .build();

    context.register_global_property(JsString::from("__host"), object, Attribute::all())
}

fn text_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

fn host_post(host: &HostState, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let frame = text_arg(args, 0, context)?;
    host.outbox.post(frame);
    Ok(JsValue::undefined())
}

fn host_echo(_host: &HostState, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let level = text_arg(args, 0, context)?;
    let text = text_arg(args, 1, context)?;
    debug!("console.{level}: {text}");
    Ok(JsValue::undefined())
}

fn host_schedule(host: &HostState, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let id = args.get_or_undefined(0).to_u32(context)?;
    let delay_ms = args.get_or_undefined(1).to_number(context)?;
    let delay = if delay_ms.is_finite() && delay_ms > 0.0 {
        Duration::from_secs_f64(delay_ms.min(MAX_TIMER_DELAY_MS) / 1000.0)
    } else {
        Duration::ZERO
    };
    host.timers.borrow_mut().schedule(id, delay, Instant::now());
    Ok(JsValue::undefined())
}

fn host_cancel(host: &HostState, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let id = args.get_or_undefined(0).to_u32(context)?;
    host.timers.borrow_mut().cancel(id);
    Ok(JsValue::undefined())
}

fn host_fetch(host: &HostState, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let id = args.get_or_undefined(0).to_u32(context)?;
    let url = text_arg(args, 1, context)?;
    let init = text_arg(args, 2, context)?;
    host.fetcher.start(id, url, &init);
    Ok(JsValue::undefined())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::LogKind;
    use crate::format::ValueFormatter;
    use crate::protocol::decode_sandbox_frame;
    use std::sync::mpsc;

    /// Keeps every posted frame.
    #[derive(Default)]
    struct Recorder {
        frames: RefCell<Vec<String>>,
    }

    impl Outbox for Recorder {
        fn post(&self, frame: String) {
            self.frames.borrow_mut().push(frame);
        }
    }

    impl Recorder {
        fn messages(&self) -> Vec<SandboxMessage> {
            self.frames
                .borrow()
                .iter()
                .map(|frame| decode_sandbox_frame(frame).unwrap())
                .collect()
        }

        /// Console and error messages rendered the way the bridge renders them.
        fn lines(&self) -> Vec<(LogKind, String)> {
            let formatter = ValueFormatter::new();
            self.messages()
                .into_iter()
                .filter_map(|message| match message {
                    SandboxMessage::Console(report) => {
                        Some((report.level, formatter.format_args(&report.args)))
                    }
                    SandboxMessage::Error(description) => Some((LogKind::Error, description)),
                    _ => None,
                })
                .collect()
        }
    }

    fn boot() -> (Engine, Rc<Recorder>, mpsc::Receiver<WorkerEvent>) {
        let recorder = Rc::new(Recorder::default());
        let (tx, rx) = mpsc::channel();
        let options = WorkerOptions {
            allow_network: false,
            ..WorkerOptions::default()
        };
        let engine = Engine::boot(recorder.clone(), tx, &options).unwrap();
        (engine, recorder, rx)
    }

    // ── Bootstrap ────────────────────────────────────────

    #[test]
    fn test_bootstrap_posts_ready() {
        let (_engine, recorder, _rx) = boot();
        assert_eq!(recorder.messages(), vec![SandboxMessage::Ready]);
    }

    #[test]
    fn test_host_bindings_are_hidden() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("console.log(typeof __host, typeof __sandbox.fire)");
        assert_eq!(recorder.lines(), vec![(LogKind::Log, "undefined function".to_string())]);
    }

    // ── Console capture ──────────────────────────────────

    #[test]
    fn test_console_log_with_object() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module(r#"console.log("hi", {a: 1})"#);
        assert_eq!(
            recorder.lines(),
            vec![(LogKind::Log, "hi {\n  \"a\": 1\n}".to_string())]
        );
    }

    #[test]
    fn test_console_levels_in_order() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("console.info('a'); console.warn('b'); console.error('c'); console.log('d');");
        let kinds: Vec<LogKind> = recorder.lines().into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(
            kinds,
            vec![LogKind::Info, LogKind::Warn, LogKind::Error, LogKind::Log]
        );
    }

    #[test]
    fn test_circular_object() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("const o = {}; o.self = o; console.log(o);");
        let lines = recorder.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].1.contains("[Circular]"), "got {:?}", lines[0].1);
    }

    #[test]
    fn test_numbers_keep_engine_text() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("console.log([1, 2.5, NaN, -0])");
        assert_eq!(
            recorder.lines(),
            vec![(LogKind::Log, "[\n  1,\n  2.5,\n  null,\n  0\n]".to_string())]
        );
    }

    // ── Errors ───────────────────────────────────────────

    #[test]
    fn test_uncaught_throw_is_reported() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module(r#"throw new Error("boom")"#);
        let lines = recorder.lines();
        assert_eq!(lines.len(), 1, "got {lines:?}");
        assert_eq!(lines[0].0, LogKind::Error);
        assert!(lines[0].1.contains("boom"));
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("let = ;");
        let lines = recorder.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, LogKind::Error);
    }

    #[test]
    fn test_unhandled_rejection_is_reported() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module(r#"Promise.reject(new Error("async boom"));"#);
        let lines = recorder.lines();
        assert_eq!(lines.len(), 1, "got {lines:?}");
        assert!(lines[0].1.contains("async boom"));
    }

    #[test]
    fn test_handled_rejection_is_silent() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("Promise.reject(new Error('x')).catch(() => console.log('caught'));");
        assert_eq!(recorder.lines(), vec![(LogKind::Log, "caught".to_string())]);
    }

    #[test]
    fn test_caught_exception_is_silent() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("try { null.x } catch (e) { console.log('ok') }");
        assert_eq!(recorder.lines(), vec![(LogKind::Log, "ok".to_string())]);
    }

    // ── Timers ───────────────────────────────────────────

    #[test]
    fn test_set_timeout_fires_from_loop() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("setTimeout(() => console.log('later'), 0); console.log('now');");
        assert!(engine.next_timer_deadline().is_some());
        engine.fire_due_timers(Instant::now());
        assert_eq!(
            recorder.lines(),
            vec![
                (LogKind::Log, "now".to_string()),
                (LogKind::Log, "later".to_string())
            ]
        );
        assert!(engine.next_timer_deadline().is_none());
    }

    #[test]
    fn test_clear_timeout() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("const t = setTimeout(() => console.log('never'), 0); clearTimeout(t);");
        assert!(engine.next_timer_deadline().is_none());
        engine.fire_due_timers(Instant::now());
        assert!(recorder.lines().is_empty());
    }

    #[test]
    fn test_throw_in_timer_callback_is_reported() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("setTimeout(() => { throw new Error('tick') }, 0);");
        engine.fire_due_timers(Instant::now());
        let lines = recorder.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].1.contains("tick"));
    }

    #[test]
    fn test_top_level_await() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module(
            "await new Promise((resolve) => setTimeout(resolve, 0)); console.log('resumed');",
        );
        assert!(recorder.lines().is_empty());
        engine.fire_due_timers(Instant::now());
        assert_eq!(recorder.lines(), vec![(LogKind::Log, "resumed".to_string())]);
    }

    // ── Runtime surface ──────────────────────────────────

    #[test]
    fn test_local_storage() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module(
            "localStorage.setItem('k', 1); console.log(localStorage.getItem('k'), localStorage.length, localStorage.getItem('nope'));",
        );
        assert_eq!(recorder.lines(), vec![(LogKind::Log, "1 1 null".to_string())]);
    }

    #[test]
    fn test_navigator_user_agent() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("console.log(navigator.userAgent)");
        assert_eq!(recorder.lines(), vec![(LogKind::Log, USER_AGENT.to_string())]);
    }

    #[test]
    fn test_fetch_rejects_when_network_disabled() {
        let (mut engine, recorder, rx) = boot();
        engine.run_module("fetch('https://example.com').catch((e) => console.log(e.message));");
        match rx.recv().unwrap() {
            WorkerEvent::FetchDone { id, outcome } => engine.settle_fetch(id, outcome),
            _ => panic!("Expected FetchDone"),
        }
        let lines = recorder.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].1.contains("network access is disabled"));
    }

    #[test]
    fn test_settled_fetch_builds_response() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module(
            "fetch('https://example.com').then(async (r) => console.log(r.status, r.ok, r.headers.get('Content-Type'), await r.text()));",
        );
        let response = FetchResponse {
            status: 200,
            status_text: "OK".into(),
            url: "https://example.com/".into(),
            headers: [("content-type".to_string(), "text/plain".to_string())]
                .into_iter()
                .collect(),
            body: "hello".into(),
        };
        engine.settle_fetch(1, Ok(response));
        assert_eq!(
            recorder.lines(),
            vec![(LogKind::Log, "200 true text/plain hello".to_string())]
        );
    }

    #[test]
    fn test_fetch_rejection_caught_later_is_silent() {
        let (mut engine, recorder, rx) = boot();
        engine.run_module(
            "try { await fetch('https://example.com'); } catch (e) { console.log('offline'); }",
        );
        match rx.recv().unwrap() {
            WorkerEvent::FetchDone { id, outcome } => engine.settle_fetch(id, outcome),
            _ => panic!("Expected FetchDone"),
        }
        assert_eq!(recorder.lines(), vec![(LogKind::Log, "offline".to_string())]);
    }

    // ── Pending rejections ───────────────────────────────

    #[test]
    fn test_rejection_after_catch_attached_is_silent() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module(
            "new Promise((_, reject) => setTimeout(() => reject(new Error('late')), 0)).catch((e) => console.log('caught', e.message));",
        );
        engine.fire_due_timers(Instant::now());
        assert_eq!(recorder.lines(), vec![(LogKind::Log, "caught late".to_string())]);
    }

    #[test]
    fn test_awaited_rejection_caught_by_try_is_silent() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module(
            "try { await new Promise((_, reject) => setTimeout(() => reject(new Error('x')), 0)); } catch (e) { console.log('caught'); }",
        );
        engine.fire_due_timers(Instant::now());
        assert_eq!(recorder.lines(), vec![(LogKind::Log, "caught".to_string())]);
    }

    #[test]
    fn test_late_rejection_without_handler_is_reported() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("new Promise((_, reject) => setTimeout(() => reject(new Error('nobody')), 0));");
        engine.fire_due_timers(Instant::now());
        let lines = recorder.lines();
        assert_eq!(lines.len(), 1, "got {lines:?}");
        assert_eq!(lines[0].0, LogKind::Error);
        assert!(lines[0].1.contains("nobody"));
    }

    // ── Capture edge cases ───────────────────────────────

    #[test]
    fn test_deeply_nested_value_still_reaches_the_console() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module(
            "let n = null; for (let i = 0; i < 50; i++) n = { next: n }; console.log(n); console.log('after');",
        );
        let lines = recorder.lines();
        assert_eq!(lines.len(), 2, "got {lines:?}");
        assert!(lines[0].1.starts_with("{\n  \"next\": {"));
        assert!(lines[0].1.contains("\"[Object]\""));
        assert_eq!(lines[1], (LogKind::Log, "after".to_string()));
    }

    #[test]
    fn test_top_level_to_json_string_is_quoted() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("console.log(new Date(0)); console.log({ when: new Date(0) });");
        assert_eq!(
            recorder.lines(),
            vec![
                (LogKind::Log, "\"1970-01-01T00:00:00.000Z\"".to_string()),
                (
                    LogKind::Log,
                    "{\n  \"when\": \"1970-01-01T00:00:00.000Z\"\n}".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_unserializable_array_falls_back_to_join() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module(
            "console.log([1n, 2]); const a = [1n]; const b = [a]; a.push(b); console.log(a);",
        );
        assert_eq!(
            recorder.lines(),
            vec![
                (LogKind::Log, "1,2".to_string()),
                (LogKind::Log, "1,".to_string())
            ]
        );
    }

    // ── Engine limits ────────────────────────────────────

    #[test]
    fn test_runaway_recursion_reports_one_error() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module("function f() { return f(); } f();");
        let lines = recorder.lines();
        assert_eq!(lines.len(), 1, "got {lines:?}");
        assert_eq!(lines[0].0, LogKind::Error);
        assert!(lines[0].1.contains("RuntimeLimit"));
    }

    #[test]
    fn test_halted_engine_ignores_later_events() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module(
            "setTimeout(() => console.log('late'), 0); function f() { return f(); } f();",
        );
        assert!(engine.next_timer_deadline().is_none());
        engine.fire_due_timers(Instant::now());
        engine.run_module("console.log('again')");
        assert_eq!(recorder.lines().len(), 1);
    }

    #[test]
    fn test_recursion_in_timer_callback_keeps_engine_alive() {
        let (mut engine, recorder, _rx) = boot();
        engine.run_module(
            "function f() { return f(); } setTimeout(f, 0); setTimeout(() => console.log('alive'), 0);",
        );
        engine.fire_due_timers(Instant::now());
        let lines = recorder.lines();
        assert_eq!(lines.len(), 2, "got {lines:?}");
        assert_eq!(lines[0].0, LogKind::Error);
        assert!(lines[0].1.contains("RuntimeLimit"));
        assert_eq!(lines[1], (LogKind::Log, "alive".to_string()));
    }

    #[test]
    fn test_loop_iteration_limit_stops_runaway_loop() {
        let recorder = Rc::new(Recorder::default());
        let (tx, _rx) = mpsc::channel();
        let options = WorkerOptions {
            allow_network: false,
            loop_iteration_limit: Some(10_000),
            recursion_limit: None,
        };
        let mut engine = Engine::boot(recorder.clone(), tx, &options).unwrap();
        engine.run_module("while (true) {}");
        let lines = recorder.lines();
        assert_eq!(lines.len(), 1, "got {lines:?}");
        assert_eq!(lines[0].0, LogKind::Error);
        assert!(lines[0].1.contains("RuntimeLimit"));
    }
}
