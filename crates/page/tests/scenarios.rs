//! End-to-end load scenarios against the scripted transport.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use common::{harness, harness_with};
use dom::{EventTarget, ListenerOptions};
use js::{GlobalValue, NavigationSource};
use net::testing::ScriptedResponse;
use page::{LoadState, PageConfig, PageEvent};

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<PageEvent>) -> Vec<PageEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

#[test]
fn blank_navigation_completes_without_http() {
    let mut h = harness();
    let mut rx = h.page.subscribe();

    h.page.navigate("about:blank").expect("navigate");
    h.page.wait_until_complete().expect("completes");

    let events = drain_events(&mut rx);
    let navigate = events.iter().find_map(|ev| match ev {
        PageEvent::Navigate(p) => Some(p.clone()),
        _ => None,
    });
    let navigated = events.iter().find_map(|ev| match ev {
        PageEvent::Navigated(p) => Some(p.clone()),
        _ => None,
    });
    let navigate = navigate.expect("page_navigate emitted");
    let navigated = navigated.expect("page_navigated emitted");
    assert_eq!(navigate.request_id, navigated.request_id);

    assert_eq!(h.page.document_url().as_str(), "about:blank");
    assert_eq!(h.page.load_state(), LoadState::Complete);
    assert!(h.transport.borrow().issued.is_empty(), "no HTTP issued");
    // Even a blank document gets the html/head/body skeleton.
    assert_eq!(
        h.page.serialize(),
        "<html><head></head><body></body></html>"
    );
}

#[test]
fn single_inline_script_sets_global_then_dcl_then_load() {
    let mut h = harness();
    h.transport.borrow_mut().route(
        "http://t/page",
        ScriptedResponse::ok("<html><body><script>window.x = 1;</script></body></html>"),
    );

    h.page.navigate("http://t/page").expect("navigate");
    let root = h.page.tree().root();
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::default();
    {
        let log = Rc::clone(&log);
        h.page.add_event_listener(
            EventTarget::Node(root),
            "DOMContentLoaded",
            ListenerOptions::default(),
            Rc::new(move |_| log.borrow_mut().push("dcl")),
        );
    }
    {
        let log = Rc::clone(&log);
        h.page.add_event_listener(
            EventTarget::Window,
            "load",
            ListenerOptions::default(),
            Rc::new(move |_| log.borrow_mut().push("load")),
        );
    }

    h.page.wait_until_complete().expect("completes");

    assert_eq!(h.global("x"), Some(GlobalValue::Number(1.0)));
    assert_eq!(*log.borrow(), vec!["dcl", "load"], "each exactly once, in order");
}

#[test]
fn deferred_scripts_keep_document_order_and_gate_dcl() {
    let mut h = harness();
    h.transport.borrow_mut().route(
        "http://t/page",
        ScriptedResponse::ok(
            "<html><head>\
             <script defer src=\"/a.js\"></script>\
             <script defer src=\"/b.js\"></script>\
             </head><body></body></html>",
        ),
    );
    // b responds before a.
    h.transport
        .borrow_mut()
        .route("/a.js", ScriptedResponse::script("window.a = 1;").after_ticks(4));
    h.transport
        .borrow_mut()
        .route("/b.js", ScriptedResponse::script("window.b = 1;"));

    h.page.navigate("http://t/page").expect("navigate");
    let root = h.page.tree().root();
    let evaluated_at_dcl = Rc::new(RefCell::new(usize::MAX));
    {
        let engines = Rc::clone(&h.engines);
        let seen = Rc::clone(&evaluated_at_dcl);
        h.page.add_event_listener(
            EventTarget::Node(root),
            "DOMContentLoaded",
            ListenerOptions::default(),
            Rc::new(move |_| {
                let engine = Rc::clone(engines.borrow().last().expect("engine"));
                let count = engine.borrow().evaluated.len();
                *seen.borrow_mut() = count;
            }),
        );
    }

    h.page.wait_until_complete().expect("completes");

    assert_eq!(
        h.evaluated_urls(),
        ["http://t/a.js", "http://t/b.js"],
        "document order despite b finishing first"
    );
    assert_eq!(*evaluated_at_dcl.borrow(), 2, "DCL after both deferred scripts");
}

#[test]
fn async_scripts_run_in_completion_order_and_do_not_gate_dcl() {
    let mut h = harness();
    h.transport.borrow_mut().route(
        "http://t/page",
        ScriptedResponse::ok(
            "<html><head>\
             <script async src=\"/slow.js\"></script>\
             <script async src=\"/fast.js\"></script>\
             </head><body></body></html>",
        ),
    );
    h.transport
        .borrow_mut()
        .route("/slow.js", ScriptedResponse::script("window.slow = 1;").after_ticks(5));
    h.transport
        .borrow_mut()
        .route("/fast.js", ScriptedResponse::script("window.fast = 1;"));

    h.page.navigate("http://t/page").expect("navigate");
    let root = h.page.tree().root();
    let evaluated_at_dcl = Rc::new(RefCell::new(usize::MAX));
    let evaluated_at_load = Rc::new(RefCell::new(usize::MAX));
    {
        let engines = Rc::clone(&h.engines);
        let seen = Rc::clone(&evaluated_at_dcl);
        h.page.add_event_listener(
            EventTarget::Node(root),
            "DOMContentLoaded",
            ListenerOptions::default(),
            Rc::new(move |_| {
                let engine = Rc::clone(engines.borrow().last().expect("engine"));
                let count = engine.borrow().evaluated.len();
                *seen.borrow_mut() = count;
            }),
        );
    }
    {
        let engines = Rc::clone(&h.engines);
        let seen = Rc::clone(&evaluated_at_load);
        h.page.add_event_listener(
            EventTarget::Window,
            "load",
            ListenerOptions::default(),
            Rc::new(move |_| {
                let engine = Rc::clone(engines.borrow().last().expect("engine"));
                let count = engine.borrow().evaluated.len();
                *seen.borrow_mut() = count;
            }),
        );
    }

    h.page.wait_until_complete().expect("completes");

    assert_eq!(
        h.evaluated_urls(),
        ["http://t/fast.js", "http://t/slow.js"],
        "completion order, not document order"
    );
    assert_eq!(*evaluated_at_dcl.borrow(), 0, "DCL does not wait for async");
    assert_eq!(*evaluated_at_load.borrow(), 2, "window load waits for both");
}

#[test]
fn script_navigation_beats_queued_anchor_click() {
    let mut h = harness();
    h.transport.borrow_mut().route(
        "http://t/page",
        ScriptedResponse::ok("<html><body><a id=\"go\" href=\"/b\">b</a></body></html>"),
    );
    h.transport
        .borrow_mut()
        .route("http://t/a", ScriptedResponse::ok("<html><body>A</body></html>"));
    h.transport
        .borrow_mut()
        .route("http://t/b", ScriptedResponse::ok("<html><body>B</body></html>"));

    h.page.navigate("http://t/page").expect("navigate");
    h.page.wait_until_complete().expect("completes");

    let anchor = h.page.get_element_by_id("go").expect("anchor exists");
    // The click queues an anchor navigation to /b...
    h.page.click(anchor);
    // ...then a script asks for /a before control returns to the loop.
    h.page
        .evaluate_script("location = 'http://t/a';", "inline://nav")
        .expect("script runs");

    h.page.wait_until_complete().expect("second navigation");
    assert_eq!(h.page.document_url().as_str(), "http://t/a");
}

#[test]
fn anchor_click_cannot_displace_queued_script_navigation() {
    let mut h = harness();
    h.transport.borrow_mut().route(
        "http://t/page",
        ScriptedResponse::ok("<html><body><a id=\"go\" href=\"/b\">b</a></body></html>"),
    );
    h.transport
        .borrow_mut()
        .route("http://t/a", ScriptedResponse::ok("<html><body>A</body></html>"));
    h.transport
        .borrow_mut()
        .route("http://t/b", ScriptedResponse::ok("<html><body>B</body></html>"));

    h.page.navigate("http://t/page").expect("navigate");
    h.page.wait_until_complete().expect("completes");

    h.page
        .evaluate_script("location = 'http://t/a';", "inline://nav")
        .expect("script runs");
    let anchor = h.page.get_element_by_id("go").expect("anchor exists");
    h.page.click(anchor);

    h.page.wait_until_complete().expect("second navigation");
    assert_eq!(h.page.document_url().as_str(), "http://t/a");
}

#[test]
fn within_a_priority_class_the_last_writer_wins() {
    let mut h = harness();
    h.transport
        .borrow_mut()
        .route("http://t/one", ScriptedResponse::ok("<html></html>"));
    h.transport
        .borrow_mut()
        .route("http://t/two", ScriptedResponse::ok("<html></html>"));

    h.page.navigate("about:blank").expect("navigate");
    h.page.wait_until_complete().expect("completes");

    h.page.queue_navigation("http://t/one", NavigationSource::Script);
    h.page.queue_navigation("http://t/two", NavigationSource::Script);
    h.page.wait_until_complete().expect("navigation");
    assert_eq!(h.page.document_url().as_str(), "http://t/two");
}

#[test]
fn network_idle_fires_once_after_threshold() {
    let mut h = harness_with(PageConfig {
        idle_threshold: Duration::from_millis(40),
        ..PageConfig::default()
    });
    h.transport
        .borrow_mut()
        .route("http://t/page", ScriptedResponse::ok("<html><body>hi</body></html>"));
    let mut rx = h.page.subscribe();

    h.page.navigate("http://t/page").expect("navigate");
    h.page.wait_until_complete().expect("completes");
    h.page.pump_for(Duration::from_millis(120));

    let events = drain_events(&mut rx);
    let idle_count = events
        .iter()
        .filter(|ev| matches!(ev, PageEvent::NetworkIdle(_)))
        .count();
    let almost_count = events
        .iter()
        .filter(|ev| matches!(ev, PageEvent::NetworkAlmostIdle(_)))
        .count();
    assert_eq!(idle_count, 1, "network idle fires exactly once");
    assert_eq!(almost_count, 1, "almost idle fires exactly once");

    // Keep pumping: done is terminal, nothing re-fires.
    h.page.pump_for(Duration::from_millis(80));
    assert!(drain_events(&mut rx)
        .iter()
        .all(|ev| !matches!(ev, PageEvent::NetworkIdle(_) | PageEvent::NetworkAlmostIdle(_))));
}

#[test]
fn failed_navigation_still_reaches_complete_with_error_document() {
    let mut h = harness();
    h.transport
        .borrow_mut()
        .route("http://t/down", ScriptedResponse::error("connection refused"));

    h.page.navigate("http://t/down").expect("navigate");
    h.page.wait_until_complete().expect("completes anyway");

    assert_eq!(h.page.load_state(), LoadState::Complete);
    assert_eq!(h.page.ready_state(), dom::ReadyState::Complete);
    let html = h.page.serialize();
    assert!(html.contains("Unable to load"), "error page synthesized: {html}");
    assert!(html.contains("connection refused"));
}

#[test]
fn redirect_exposes_final_url_as_document_url() {
    let mut h = harness();
    let final_url = url::Url::parse("http://t/final").expect("url");
    h.transport.borrow_mut().route(
        "http://t/start",
        ScriptedResponse::ok("<html><body>end</body></html>").redirected_to(final_url),
    );

    h.page.navigate("http://t/start").expect("navigate");
    h.page.wait_until_complete().expect("completes");
    assert_eq!(h.page.document_url().as_str(), "http://t/final");
}

#[test]
fn iframe_completion_gates_parent_load() {
    let mut h = harness();
    h.transport.borrow_mut().route(
        "http://t/page",
        ScriptedResponse::ok("<html><body><iframe src=\"/frame\"></iframe></body></html>"),
    );
    h.transport.borrow_mut().route(
        "/frame",
        ScriptedResponse::ok("<html><body>inner</body></html>").after_ticks(2),
    );
    let mut rx = h.page.subscribe();

    h.page.navigate("http://t/page").expect("navigate");
    h.page.wait_until_complete().expect("completes");

    assert_eq!(h.page.frames().len(), 1);
    assert!(h.page.frames()[0].is_complete(), "frame completed");
    assert!(h.page.is_complete());
    assert_eq!(h.page.pending_loads(), 0);

    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|ev| matches!(ev, PageEvent::FrameCreated { .. })));
}

#[test]
fn non_html_response_is_wrapped_for_the_parser() {
    let mut h = harness();
    h.transport.borrow_mut().route(
        "http://t/data.json",
        ScriptedResponse::ok("{\"a\":1}").with_content_type("application/json"),
    );

    h.page.navigate("http://t/data.json").expect("navigate");
    h.page.wait_until_complete().expect("completes");
    let html = h.page.serialize();
    assert!(html.contains("<pre>"), "wrapped in pre: {html}");
    assert!(html.contains("{\"a\":1}"));
}

#[test]
fn blocking_script_evaluates_during_parse() {
    let mut h = harness();
    h.transport.borrow_mut().route(
        "http://t/page",
        ScriptedResponse::ok(
            "<html><body>\
             <script src=\"/sync.js\"></script>\
             <script>window.after = 1;</script>\
             </body></html>",
        ),
    );
    h.transport
        .borrow_mut()
        .route("/sync.js", ScriptedResponse::script("window.sync = 1;").after_ticks(2));

    h.page.navigate("http://t/page").expect("navigate");
    h.page.wait_until_complete().expect("completes");

    let urls = h.evaluated_urls();
    assert_eq!(urls.first().map(String::as_str), Some("http://t/sync.js"));
    assert_eq!(h.global("sync"), Some(GlobalValue::Number(1.0)));
    assert_eq!(h.global("after"), Some(GlobalValue::Number(1.0)));
}
