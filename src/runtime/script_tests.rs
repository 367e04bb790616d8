//! Script-facing behavior of a running cell: timers, promises, fetch, jeth
//! and signals.

use super::testing::{host, wait_until};
use super::{Cell, CellConfig, JSValue};
use crate::rpc::tests::FakeNode;
use crate::runtime::event_loop::{FetchRequest, FetchResponse};
use crate::signal::Signal;
use serde_json::json;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn is_set(cell: &Cell, path: &str) -> bool {
    !cell.get(path).unwrap().is_null()
}

fn collect_signals() -> (Arc<Mutex<Vec<Signal>>>, crate::signal::SignalHandler) {
    let signals = Arc::new(Mutex::new(Vec::new()));
    let sink = signals.clone();
    (signals, Arc::new(move |signal: &Signal| sink.lock().unwrap().push(signal.clone())))
}

/// Serve one HTTP response with a JSON body and close.
fn serve_once(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes());
    });
    format!("http://{addr}/data")
}

/// Accept connections and never answer, so requests stay in flight.
fn serve_nothing() -> (String, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (format!("http://{addr}/hang"), listener)
}

#[test]
fn test_timeout_fires_once_after_delay() {
    let host = host();
    let cell = Cell::spawn("timeout", CellConfig::default(), &host.services).unwrap();

    cell.run(
        r#"
        var fired = 0;
        var elapsed = null;
        setTimeout(function (startedAt) {
            fired++;
            elapsed = Date.now() - startedAt;
        }, 50, Date.now());
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || is_set(&cell, "elapsed")));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(cell.get("fired").unwrap(), JSValue::Int(1));
    assert!(cell.get("elapsed").unwrap().as_i64().unwrap() >= 50);
    assert_eq!(cell.pending_tasks().unwrap(), 0);
}

#[test]
fn test_timeouts_from_many_host_threads() {
    const THREADS: usize = 8;
    let host = host();
    let cell = Cell::spawn("many-timeouts", CellConfig::default(), &host.services).unwrap();
    cell.run("var fired = 0;").unwrap();

    let threads: Vec<_> = (0..THREADS)
        .map(|i| {
            let cell = cell.clone();
            thread::spawn(move || {
                cell.run(&format!("setTimeout(function () {{ fired++; }}, {})", i % 3))
                    .unwrap()
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let expected = JSValue::Int(THREADS as i64);
    assert!(wait_until(WAIT, || cell.get("fired").unwrap() == expected));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(cell.get("fired").unwrap(), expected);
    assert_eq!(cell.pending_tasks().unwrap(), 0);
}

#[test]
fn test_cleared_timeout_never_fires() {
    let host = host();
    let cell = Cell::spawn("cleared", CellConfig::default(), &host.services).unwrap();

    cell.run(
        r#"
        var fired = false;
        var handle = setTimeout(function () { fired = true; }, 20);
        clearTimeout(handle);
        clearTimeout(handle);
        clearTimeout(12345);
        "#,
    )
    .unwrap();

    thread::sleep(Duration::from_millis(150));
    assert_eq!(cell.get("fired").unwrap(), JSValue::Bool(false));
    assert_eq!(cell.pending_tasks().unwrap(), 0);
}

#[test]
fn test_interval_repeats_until_cleared() {
    let host = host();
    let cell = Cell::spawn("interval", CellConfig::default(), &host.services).unwrap();

    cell.run(
        r#"
        var ticks = 0;
        var handle = setInterval(function () {
            ticks++;
            if (ticks === 3) clearInterval(handle);
        }, 10);
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || cell.get("ticks").unwrap() == JSValue::Int(3)));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(cell.get("ticks").unwrap(), JSValue::Int(3));
    assert_eq!(cell.pending_tasks().unwrap(), 0);
}

#[test]
fn test_interval_ticks_are_spaced_by_the_floor() {
    let host = host();
    let cell = Cell::spawn("interval-spacing", CellConfig::default(), &host.services).unwrap();

    cell.run(
        r#"
        var stamps = [];
        var events = [];
        var handle = setInterval(function () {
            stamps.push(Date.now());
            events.push('tick');
            if (stamps.length === 4) clearInterval(handle);
        }, 0);
        setTimeout(function () { events.push('timeout'); }, 100);
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || cell.run("events.length").unwrap() == JSValue::Int(5)));
    let stamps = cell.get("stamps").unwrap().to_json().unwrap();
    let stamps: Vec<i64> = stamps
        .as_array()
        .unwrap()
        .iter()
        .map(|stamp| stamp.as_i64().unwrap())
        .collect();
    for pair in stamps.windows(2) {
        assert!(pair[1] - pair[0] >= 10, "ticks too close: {stamps:?}");
    }
    assert_eq!(
        cell.get("events").unwrap().to_json().unwrap(),
        json!(["tick", "tick", "tick", "tick", "timeout"])
    );
}

#[test]
fn test_set_immediate_and_ordering() {
    let host = host();
    let cell = Cell::spawn("immediate", CellConfig::default(), &host.services).unwrap();

    cell.run(
        r#"
        var order = [];
        setTimeout(function () { order.push('timeout'); }, 60);
        setImmediate(function (tag) { order.push(tag); }, 'immediate');
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || {
        cell.run("order.length").unwrap() == JSValue::Int(2)
    }));
    assert_eq!(
        cell.get("order").unwrap().to_json().unwrap(),
        json!(["immediate", "timeout"])
    );
}

#[test]
fn test_failing_task_cancels_siblings() {
    let host = host();
    let (signals, handler) = collect_signals();
    let mut services = host.services.clone();
    services.signal_handler = Some(handler);
    let cell = Cell::spawn("fail-fast", CellConfig::default(), &services).unwrap();

    cell.run(
        r#"
        var ticks = 0;
        var late = false;
        setInterval(function () { ticks++; }, 10);
        setTimeout(function () { late = true; }, 2000);
        setTimeout(function () { throw new Error('boom'); }, 30);
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || {
        signals
            .lock()
            .unwrap()
            .iter()
            .any(|signal| matches!(signal, Signal::TaskError { .. }))
    }));
    assert_eq!(cell.pending_tasks().unwrap(), 0);

    let frozen = cell.get("ticks").unwrap();
    thread::sleep(Duration::from_millis(60));
    assert_eq!(cell.get("ticks").unwrap(), frozen);

    let signals = signals.lock().unwrap();
    let Some(Signal::TaskError {
        chat_id,
        kind,
        message,
        ..
    }) = signals
        .iter()
        .find(|signal| matches!(signal, Signal::TaskError { .. }))
    else {
        unreachable!();
    };
    assert_eq!(chat_id, "fail-fast");
    assert_eq!(kind, "timeout");
    assert!(message.contains("boom"), "{message}");

    // The cell itself keeps working.
    assert_eq!(cell.run("late").unwrap(), JSValue::Bool(false));
    cell.run("setTimeout(function () { late = true; }, 1)").unwrap();
    assert!(wait_until(WAIT, || cell.get("late").unwrap() == JSValue::Bool(true)));
}

#[test]
fn test_failure_rejects_in_flight_fetch_with_abort_error() {
    let host = host();
    let cell = Cell::spawn("abort", CellConfig::default(), &host.services).unwrap();
    let (url, _listener) = serve_nothing();

    cell.set("url", url.as_str()).unwrap();
    cell.run(
        r#"
        var caught = null;
        fetch(url).catch(function (err) { caught = err.name; });
        setTimeout(function () {
            Promise.resolve(1).then(function () {});
            throw new Error('x');
        }, 20);
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || is_set(&cell, "caught")));
    assert_eq!(cell.get("caught").unwrap(), JSValue::from("AbortError"));
}

#[test]
fn test_promise_reactions_are_deferred() {
    let host = host();
    let cell = Cell::spawn("promise", CellConfig::default(), &host.services).unwrap();

    let sync = cell
        .run(
            r#"
            var order = [];
            Promise.resolve(1).then(function (v) { order.push('then:' + v); });
            order.push('sync');
            order.slice();
            "#,
        )
        .unwrap();
    assert_eq!(sync.to_json().unwrap(), json!(["sync"]));

    assert!(wait_until(WAIT, || cell.run("order.length").unwrap() == JSValue::Int(2)));
    assert_eq!(
        cell.get("order").unwrap().to_json().unwrap(),
        json!(["sync", "then:1"])
    );
}

#[test]
fn test_promise_combinators() {
    let host = host();
    let cell = Cell::spawn("combinators", CellConfig::default(), &host.services).unwrap();

    cell.run(
        r#"
        var all = null, settled = null, raced = null, caught = null, finalized = false;
        Promise.all([1, Promise.resolve(2), new Promise(function (r) { setTimeout(r, 5, 3); })])
            .then(function (values) { all = values; });
        Promise.allSettled([Promise.resolve('a'), Promise.reject('b')])
            .then(function (results) { settled = results; });
        Promise.race([new Promise(function (r) { setTimeout(r, 50, 'slow'); }), 'fast'])
            .then(function (value) { raced = value; });
        Promise.reject(new Error('nope'))
            .catch(function (err) { caught = err.message; })
            .finally(function () { finalized = true; });
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || {
        ["all", "settled", "raced", "caught"]
            .iter()
            .all(|name| is_set(&cell, name))
            && cell.get("finalized").unwrap() == JSValue::Bool(true)
    }));
    assert_eq!(cell.get("all").unwrap().to_json().unwrap(), json!([1, 2, 3]));
    assert_eq!(
        cell.get("settled").unwrap().to_json().unwrap(),
        json!([{"status": "fulfilled", "value": "a"}, {"status": "rejected", "reason": "b"}])
    );
    assert_eq!(cell.get("raced").unwrap(), JSValue::from("fast"));
    assert_eq!(cell.get("caught").unwrap(), JSValue::from("nope"));
}

#[test]
fn test_async_functions_await_loop_promises() {
    let host = host();
    let cell = Cell::spawn("await", CellConfig::default(), &host.services).unwrap();

    cell.run(
        r#"
        var awaited = null;
        (async function () {
            awaited = await new Promise(function (r) { setTimeout(r, 5, 'late'); });
        })();
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || is_set(&cell, "awaited")));
    assert_eq!(cell.get("awaited").unwrap(), JSValue::from("late"));
}

#[test]
fn test_fetch_network_json() {
    let host = host();
    let cell = Cell::spawn("fetch", CellConfig::default(), &host.services).unwrap();
    let url = serve_once(r#"{"key":"value"}"#);

    cell.set("url", url.as_str()).unwrap();
    cell.run(
        r#"
        var result = null, status = null;
        fetch(url)
            .then(function (response) { status = response.status; return response.json(); })
            .then(function (data) { result = data; })
            .catch(function (err) { result = { error: err.name + ': ' + err.message }; });
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || is_set(&cell, "result")));
    assert_eq!(cell.get("result").unwrap().to_json().unwrap(), json!({"key": "value"}));
    assert_eq!(cell.get("status").unwrap(), JSValue::Int(200));
}

#[test]
fn test_parallel_fetches_settle_independently() {
    let host = host();
    let config = CellConfig::new().with_fetch_timeout(Some(Duration::from_secs(1)));
    let cell = Cell::spawn("parallel-fetch", config, &host.services).unwrap();
    let url = serve_once(r#"{"key":"value"}"#);

    cell.set("url", url.as_str()).unwrap();
    cell.run(
        r#"
        var good = null, bad = null, contentType = null;
        fetch(url)
            .then(function (response) {
                contentType = response.headers.get('Content-Type');
                return response.json();
            })
            .then(function (data) { good = data; }, function (err) { good = err.name; });
        fetch('http://127.0.0.1:1/')
            .then(function () { bad = 'resolved'; }, function (err) { bad = err.name; });
        "#,
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(1), || {
        is_set(&cell, "good") && is_set(&cell, "bad")
    }));
    assert_eq!(cell.get("good").unwrap().to_json().unwrap(), json!({"key": "value"}));
    assert_eq!(cell.get("contentType").unwrap(), JSValue::from("application/json"));
    assert_eq!(cell.get("bad").unwrap(), JSValue::from("FetchError"));
}

#[test]
fn test_fetch_unreachable_host_rejects() {
    let host = host();
    let config = CellConfig::new().with_fetch_timeout(Some(Duration::from_secs(2)));
    let cell = Cell::spawn("unreachable", config, &host.services).unwrap();

    cell.run(
        r#"
        var failure = null;
        fetch('http://127.0.0.1:1/')
            .then(function () { failure = 'resolved'; })
            .catch(function (err) { failure = err.name; });
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || is_set(&cell, "failure")));
    assert_eq!(cell.get("failure").unwrap(), JSValue::from("FetchError"));
}

#[test]
fn test_fetch_local_route() {
    let host = host();
    let mut services = host.services.clone();
    services.local_handler = Some(Arc::new(|request: &FetchRequest| {
        FetchResponse::json(&json!({
            "method": request.method(),
            "path": request.url,
            "token": request.header("x-token"),
            "body": request.body,
        }))
    }));
    let cell = Cell::spawn("local", CellConfig::default(), &services).unwrap();

    cell.run(
        r#"
        var local = null;
        fetch('/api/echo', { method: 'POST', headers: { 'X-Token': 'abc' }, body: 'ping' })
            .then(function (response) { return response.json(); })
            .then(function (data) { local = data; });
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || is_set(&cell, "local")));
    assert_eq!(
        cell.get("local").unwrap().to_json().unwrap(),
        json!({"method": "POST", "path": "/api/echo", "token": "abc", "body": "ping"})
    );
}

#[test]
fn test_fetch_local_route_without_handler() {
    let host = host();
    let cell = Cell::spawn("no-local", CellConfig::default(), &host.services).unwrap();

    cell.run(
        r#"
        var failure = null;
        fetch('/missing').catch(function (err) { failure = err.name; });
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || is_set(&cell, "failure")));
    assert_eq!(cell.get("failure").unwrap(), JSValue::from("TypeError"));
}

#[test]
fn test_jeth_send_and_send_async() {
    let host = host();
    let mut services = host.services.clone();
    services.rpc_client = Some(Arc::new(FakeNode));
    let cell = Cell::spawn("jeth", CellConfig::default(), &services).unwrap();

    let sync = cell
        .run("jeth.send({jsonrpc: '2.0', id: 1, method: 'eth_blockNumber'}).result")
        .unwrap();
    assert_eq!(sync, JSValue::from("0x10"));
    assert_eq!(cell.run("jeth.isConnected()").unwrap(), JSValue::Bool(true));

    cell.run(
        r#"
        var asyncResult = null;
        jeth.sendAsync({jsonrpc: '2.0', id: 2, method: 'fail'}, function (err, response) {
            asyncResult = err ? 'error' : response.error.message;
        });
        "#,
    )
    .unwrap();

    assert!(wait_until(WAIT, || is_set(&cell, "asyncResult")));
    assert_eq!(
        cell.get("asyncResult").unwrap(),
        JSValue::from("Transport error: connection reset")
    );
}

#[test]
fn test_jeth_without_client() {
    let host = host();
    let cell = Cell::spawn("offline", CellConfig::default(), &host.services).unwrap();

    assert_eq!(cell.run("jeth.isConnected()").unwrap(), JSValue::Bool(false));
    let response = cell
        .run("jeth.send({id: 9, method: 'eth_blockNumber'})")
        .unwrap()
        .to_json()
        .unwrap();
    assert_eq!(response["id"], 9);
    assert_eq!(response["error"]["code"], -32603);
}

#[test]
fn test_console_and_status_signals() {
    let host = host();
    let (signals, handler) = collect_signals();
    let mut services = host.services.clone();
    services.signal_handler = Some(handler);
    let cell = Cell::spawn("chat-1", CellConfig::default(), &services).unwrap();

    cell.run(
        r#"
        console.log('hello', {a: 1}, 2);
        statusSignals.sendMessage('hi there');
        statusSignals.showSuggestions({buttons: ['yes', 'no']});
        "#,
    )
    .unwrap();

    let signals = signals.lock().unwrap();
    assert_eq!(
        *signals,
        vec![
            Signal::Console {
                chat_id: "chat-1".to_string(),
                level: "log".to_string(),
                message: r#"hello {"a":1} 2"#.to_string(),
            },
            Signal::SendMessage {
                chat_id: "chat-1".to_string(),
                message: json!("hi there"),
            },
            Signal::ShowSuggestions {
                chat_id: "chat-1".to_string(),
                markup: json!({"buttons": ["yes", "no"]}),
            },
        ]
    );
}

#[test]
fn test_console_signals_can_be_disabled() {
    let host = host();
    let (signals, handler) = collect_signals();
    let mut services = host.services.clone();
    services.signal_handler = Some(handler);
    let config = CellConfig::new().with_console(false);
    let cell = Cell::spawn("quiet", config, &services).unwrap();

    cell.run("console.warn('not forwarded')").unwrap();
    assert!(signals.lock().unwrap().is_empty());
}

#[test]
fn test_host_internals_are_hidden() {
    let host = host();
    let cell = Cell::spawn("hidden", CellConfig::default(), &host.services).unwrap();

    assert_eq!(cell.run("typeof Deno").unwrap(), JSValue::from("undefined"));
    assert_eq!(
        cell.run("typeof globalThis[Symbol.for('jailcell.internals')]").unwrap(),
        JSValue::from("undefined")
    );
}

#[test]
fn test_stop_cancels_pending_work() {
    let host = host();
    let cell = Cell::spawn("stopping", CellConfig::default(), &host.services).unwrap();

    cell.run("setInterval(function () {}, 10); setTimeout(function () {}, 10000);")
        .unwrap();
    assert_eq!(cell.pending_tasks().unwrap(), 2);

    assert!(cell.stop_and_wait());
    assert!(cell.is_stopped());
}
