//! Cross-process scripting bridge.
//!
//! Host objects are exposed to script running in another process through
//! integer handles and a get/set/apply proxy protocol. The host can evaluate
//! script remotely, and asynchronous native calls settle script promises.
//! Both sides talk over a fire-and-forget message channel; request/response
//! semantics and blocking waits are layered on top by the [`correlator`].
//!
//! [`HostBridge`] and [`ScriptBridge`] are the two facades. Wire them with a
//! [`LocalChannel`] to run both ends in one process.

pub mod channel;
pub mod codec;
pub mod config;
pub mod context;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod host;
pub mod js_value;
pub mod marshal;
pub mod promise;
pub mod proxy;
pub mod registry;
pub mod script;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{FrameHandler, LocalChannel, LocalEndpoint, Transport};
pub use config::BridgeConfig;
pub use context::{ContextId, FrameAddress, ScriptContext};
pub use engine::ScriptEngine;
pub use error::BridgeError;
pub use evaluation::{EvalRequest, EvalResult, ExceptionDetail};
pub use host::{HostBridge, HostMessage, PostMode};
pub use js_value::JSValue;
pub use marshal::Marshaller;
pub use promise::{AsyncCall, ScriptPromise};
pub use proxy::DynamicProxy;
pub use registry::NativeProxy;
pub use script::{ScriptBridge, ScriptMessage};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::TestEngine;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn sum_args(args: &str) -> Result<String, String> {
        let values: Vec<i64> = serde_json::from_str(args).map_err(|e| e.to_string())?;
        Ok(values.iter().sum::<i64>().to_string())
    }

    fn math() -> DynamicProxy {
        DynamicProxy::builder()
            .property("pi", || "3.14159".to_string())
            .function("add", sum_args)
            .async_function("delayedAdd", |args, call| {
                let args = args.to_string();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(50));
                    match sum_args(&args) {
                        Ok(sum) => call.resolve(sum),
                        Err(err) => call.reject(err),
                    }
                });
            })
            .build()
    }

    fn session() -> (Arc<HostBridge>, Arc<ScriptBridge>) {
        let (host_end, script_end) = LocalChannel::pair();
        let host = HostBridge::connect(BridgeConfig::default(), host_end).unwrap();
        let script = ScriptBridge::connect(
            BridgeConfig::default().with_call_timeout(Duration::from_secs(10)),
            Arc::new(TestEngine),
            script_end,
        )
        .unwrap();
        host.register_object("math", Arc::new(math())).unwrap();
        (host, script)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    fn object_id(value: JSValue) -> i64 {
        match value {
            JSValue::NativeObject { id } => id,
            other => panic!("Expected native object, got {:?}", other),
        }
    }

    #[test]
    fn test_property_is_a_number() {
        let (_host, script) = session();
        let ctx = script.create_context(1).unwrap();
        let math = object_id(script.get_native_object(&ctx, "math").unwrap());

        assert_eq!(
            script.get_property(&ctx, math, "pi").unwrap(),
            JSValue::Float(3.14159)
        );
        assert_eq!(script.get_property(&ctx, math, "nope").unwrap(), JSValue::Undefined);
    }

    #[test]
    fn test_sync_function_creates_no_promise() {
        let (_host, script) = session();
        let ctx = script.create_context(1).unwrap();
        let math = object_id(script.get_native_object(&ctx, "math").unwrap());

        assert_eq!(
            script.get_property(&ctx, math, "add").unwrap(),
            JSValue::NativeFunction {
                object_id: math,
                name: "add".to_string(),
                asynchronous: false,
            }
        );
        assert_eq!(
            script.call_function(&ctx, math, "add", "[2,3]").unwrap(),
            JSValue::Int(5)
        );
        assert_eq!(script.pending_promises(), 0);
        assert_eq!(script.pending_requests(), 0);
    }

    #[test]
    fn test_async_function_returns_a_pending_promise() {
        let (_host, script) = session();
        let ctx = script.create_context(1).unwrap();
        let math = object_id(script.get_native_object(&ctx, "math").unwrap());

        assert_eq!(
            script.get_property(&ctx, math, "delayedAdd").unwrap(),
            JSValue::NativeFunction {
                object_id: math,
                name: "delayedAdd".to_string(),
                asynchronous: true,
            }
        );

        let mut promise = script.begin_async_call(&ctx, math, "delayedAdd", "[2,3]").unwrap();
        assert!(promise.try_result().is_none());
        assert_eq!(promise.wait().unwrap(), JSValue::Int(5));
        assert_eq!(script.pending_promises(), 0);
    }

    #[test]
    fn test_settled_promise_can_be_inspected_again() {
        let (_host, script) = session();
        let ctx = script.create_context(1).unwrap();
        let math = object_id(script.get_native_object(&ctx, "math").unwrap());

        let mut promise = script.begin_async_call(&ctx, math, "delayedAdd", "[2,3]").unwrap();
        wait_until(|| promise.try_result().is_some());

        for _ in 0..2 {
            assert_eq!(promise.try_result().unwrap().unwrap(), JSValue::Int(5));
        }
        assert_eq!(promise.wait().unwrap(), JSValue::Int(5));
    }

    #[test]
    fn test_call_paths_are_checked() {
        let (_host, script) = session();
        let ctx = script.create_context(1).unwrap();
        let math = object_id(script.get_native_object(&ctx, "math").unwrap());

        // Async member through the blocking path.
        let err = script.call_function(&ctx, math, "delayedAdd", "[2,3]").unwrap_err();
        assert!(err.to_string().starts_with("[Bridge] "));
        assert!(err.to_string().contains("delayedAdd"));

        // Sync member through the promise path settles at once.
        let promise = script.begin_async_call(&ctx, math, "add", "[4,5]").unwrap();
        assert_eq!(promise.wait().unwrap(), JSValue::Int(9));

        // Unknown member through the promise path rejects.
        let promise = script.begin_async_call(&ctx, math, "missing", "[]").unwrap();
        let err = promise.wait().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_remote_evaluation() {
        let (host, script) = session();
        let ctx = script.create_context(1).unwrap();

        let result = host
            .evaluate(ctx.id(), "1+1", "about:blank", 1, false)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.data, "2");
        assert_eq!(result.value, None);

        let detailed = host
            .evaluate(ctx.id(), r#"{"a": [1, 2.5]}"#, "about:blank", 1, true)
            .await
            .unwrap();
        match detailed.value {
            Some(JSValue::Object(map)) => assert_eq!(
                map.get("a"),
                Some(&JSValue::Array(vec![JSValue::Int(1), JSValue::Float(2.5)]))
            ),
            other => panic!("Expected object value, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_evaluation_exception() {
        let (host, script) = session();
        let ctx = script.create_context(1).unwrap();

        let source = "var x = 1;\nthrow new Error('boom');";
        let result = host
            .evaluate(ctx.id(), source, "https://example.test/app.js", 10, false)
            .await
            .unwrap();
        assert!(!result.success);

        let exception = result.exception.clone().unwrap();
        assert_eq!(exception.message, "Uncaught Error: boom");
        assert_eq!(exception.line_number, 11);
        assert_eq!(exception.resource_name, "https://example.test/app.js");
        assert_eq!(exception.source_line, "throw new Error('boom');");

        let err = result.into_result().unwrap_err();
        assert!(err.to_string().starts_with("[Bridge] Uncaught Error: boom"));
    }

    #[tokio::test]
    async fn test_engine_panic_fails_only_that_evaluation() {
        let (host, script) = session();
        let ctx = script.create_context(1).unwrap();

        let crashed = host
            .evaluate(ctx.id(), "crash('boom')", "https://example.test/app.js", 3, false)
            .await
            .unwrap();
        assert!(!crashed.success);
        let exception = crashed.exception.clone().unwrap();
        assert!(exception.message.contains("boom"), "{}", exception.message);
        assert_eq!(exception.line_number, 3);
        assert!(!crashed.into_result().unwrap_err().is_cancellation());

        let next = host.evaluate(ctx.id(), "1+1", "", 1, false).await.unwrap();
        assert!(next.success);
        assert_eq!(next.data, "2");
        assert_eq!(script.contexts(), vec![ctx.id()]);
        assert!(!ctx.is_released());
        assert_eq!(host.pending_evaluations(), 0);
    }

    #[test]
    fn test_panicking_listener_keeps_the_context_alive() {
        let (host, script) = session();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        script.on_message(move |message| {
            if message.value == JSValue::String("explode".to_string()) {
                panic!("listener failed");
            }
            let _ = tx.lock().send(message.value);
        });

        let ctx = script.create_context(1).unwrap();
        host.post_message(ctx.id(), "explode", PostMode::AsString).unwrap();
        host.post_message(ctx.id(), "7", PostMode::AsJson).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), JSValue::Int(7));

        let math = object_id(script.get_native_object(&ctx, "math").unwrap());
        let promise = script.begin_async_call(&ctx, math, "delayedAdd", "[1,2]").unwrap();
        assert_eq!(promise.wait().unwrap(), JSValue::Int(3));
    }

    #[test]
    fn test_unregistered_object_fails_cleanly() {
        let (host, script) = session();
        let ctx = script.create_context(1).unwrap();

        let err = script.get_native_object(&ctx, "nope").unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("[Bridge] "));
        assert!(message.contains("nope"));

        host.unregister_object("math");
        assert!(script.get_native_object(&ctx, "math").is_err());
        assert_eq!(script.pending_requests(), 0);
    }

    #[test]
    fn test_properties_round_trip_through_set() {
        let (host, script) = session();
        let title = Arc::new(Mutex::new("\"untitled\"".to_string()));
        let (read, write) = (title.clone(), title.clone());
        let doc = DynamicProxy::builder()
            .read_write_property("title", move || read.lock().clone(), move |json| {
                *write.lock() = json.to_string()
            })
            .child("math", Arc::new(math()))
            .build();
        host.register_object("doc", Arc::new(doc)).unwrap();

        let ctx = script.create_context(1).unwrap();
        let doc = object_id(script.get_native_object(&ctx, "doc").unwrap());

        assert!(script.set_property(&ctx, doc, "title", "\"Report\"").unwrap());
        assert!(!script.set_property(&ctx, doc, "missing", "1").unwrap());
        assert_eq!(
            script.get_property(&ctx, doc, "title").unwrap(),
            JSValue::String("Report".to_string())
        );

        let nested = object_id(script.get_property(&ctx, doc, "math").unwrap());
        assert_eq!(object_id(script.get_property(&ctx, doc, "math").unwrap()), nested);
        assert_eq!(
            script.call_function(&ctx, nested, "add", "[1,2]").unwrap(),
            JSValue::Int(3)
        );
    }

    #[test]
    fn test_blocking_call_from_the_context_queue() {
        let (_host, script) = session();
        let ctx = script.create_context(1).unwrap();
        let (tx, rx) = mpsc::channel();

        let bridge = script.clone();
        let target = ctx.clone();
        ctx.post(move || {
            let result = bridge
                .get_native_object(&target, "math")
                .and_then(|math| bridge.get_property(&target, object_id(math), "pi"));
            let _ = tx.send(result);
        })
        .unwrap();

        let value = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
        assert_eq!(value, JSValue::Float(3.14159));
    }

    #[test]
    fn test_release_is_isolated() {
        let (host, script) = session();
        let calls: Arc<Mutex<Vec<AsyncCall>>> = Arc::new(Mutex::new(Vec::new()));
        let parked = calls.clone();
        let jobs = DynamicProxy::builder()
            .async_function("run", move |_args, call| parked.lock().push(call))
            .build();
        host.register_object("jobs", Arc::new(jobs)).unwrap();

        let a = script.create_context(1).unwrap();
        let b = script.create_context(2).unwrap();
        let jobs_a = object_id(script.get_native_object(&a, "jobs").unwrap());
        let jobs_b = object_id(script.get_native_object(&b, "jobs").unwrap());

        let a_promises: Vec<ScriptPromise> = (0..3)
            .map(|_| script.begin_async_call(&a, jobs_a, "run", "[]").unwrap())
            .collect();
        let mut b_promise = script.begin_async_call(&b, jobs_b, "run", "[]").unwrap();
        wait_until(|| calls.lock().len() == 4);

        assert!(script.release_context(a.id()));
        for promise in a_promises {
            assert!(promise.wait().unwrap_err().is_cancellation());
        }

        assert!(b_promise.try_result().is_none());
        assert_eq!(script.pending_promises(), 1);
        let b_call = {
            let mut calls = calls.lock();
            let index = calls
                .iter()
                .position(|call| call.call_id() == b_promise.call_id())
                .unwrap();
            calls.remove(index)
        };
        b_call.resolve("\"done\"");
        assert_eq!(b_promise.wait().unwrap(), JSValue::String("done".to_string()));
    }

    #[tokio::test]
    async fn test_release_settles_pending_evaluations() {
        let (host, script) = session();
        let ctx = script.create_context(1).unwrap();
        let id = ctx.id();
        wait_until(|| host.contexts().contains(&id));

        let slow = host.evaluate(id, "sleep(300)", "", 1, false);
        let queued = host.evaluate(id, "1+1", "", 1, false);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(script.release_context(id));
        assert!(slow.await.unwrap_err().is_cancellation());
        assert!(queued.await.unwrap_err().is_cancellation());
        assert_eq!(host.pending_evaluations(), 0);
        wait_until(|| !host.contexts().contains(&id));

        // Evaluating in a context that no longer exists fails instead of hanging.
        let late = host.evaluate(id, "1+1", "", 1, false).await.unwrap();
        assert!(!late.success);
    }

    #[test]
    fn test_post_messages_both_ways() {
        let (host, script) = session();
        let (to_host_tx, to_host_rx) = mpsc::channel();
        let to_host_tx = Mutex::new(to_host_tx);
        host.on_message(move |message| {
            let _ = to_host_tx.lock().send(message);
        });
        let (to_script_tx, to_script_rx) = mpsc::channel();
        let to_script_tx = Mutex::new(to_script_tx);
        script.on_message(move |message| {
            let thread = thread::current().name().map(str::to_string);
            let _ = to_script_tx.lock().send((message, thread));
        });

        let ctx = script.create_context(7).unwrap();
        script.post_message_to_host(&ctx, r#"{"ready":true}"#).unwrap();
        let message = to_host_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(message.context, ctx.id());
        assert_eq!(message.frame_id, 7);
        assert_eq!(message.json, r#"{"ready":true}"#);

        host.post_message(ctx.id(), "42", PostMode::AsJson).unwrap();
        host.post_message(ctx.id(), "42", PostMode::AsString).unwrap();
        let (first, thread) = to_script_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let (second, _) = to_script_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.value, JSValue::Int(42));
        assert_eq!(second.value, JSValue::String("42".to_string()));
        assert_eq!(thread.as_deref(), Some("jsbridge-context-1"));
    }

    #[test]
    fn test_shutdown_settles_everything() {
        let (host, script) = session();
        let ctx = script.create_context(1).unwrap();
        let jobs = DynamicProxy::builder()
            .async_function("never", |_args, call| {
                // Parked forever; only teardown can settle the promise.
                std::mem::forget(call);
            })
            .build();
        host.register_object("jobs", Arc::new(jobs)).unwrap();
        let jobs = object_id(script.get_native_object(&ctx, "jobs").unwrap());
        let promise = script.begin_async_call(&ctx, jobs, "never", "[]").unwrap();

        script.shutdown();
        script.shutdown();
        assert!(promise.wait().unwrap_err().is_cancellation());
        assert!(script.create_context(2).is_err());

        host.shutdown();
        assert!(host.is_shut_down());
    }
}
