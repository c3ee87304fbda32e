//! Consume-gate behavior against a minimal in-process sidecar stub.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;

use telepresence_client::api::ApiService;
use telepresence_client::propagation::{ConsumeFilter, InterceptContext};

/// One-shot HTTP stub answering every request with `body`.
fn stub_sidecar(body: &'static str, requests: usize) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub");
    let port = listener.local_addr().expect("local addr").port();
    thread::spawn(move || {
        for _ in 0..requests {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    port
}

#[test]
fn test_consume_here_honors_a_true_answer() {
    let port = stub_sidecar("true", 1);
    let api = ApiService::with_port(port);
    assert!(api.consume_here(&InterceptContext::new(), Some("/orders")));
}

#[test]
fn test_consume_here_honors_a_false_answer() {
    let port = stub_sidecar("false", 1);
    let api = ApiService::with_port(port);
    assert!(!api.consume_here(&InterceptContext::new(), None));
}

#[test]
fn test_consume_here_fails_open_when_sidecar_is_down() {
    // Nothing listens on port 1.
    let api = ApiService::with_port(1);
    assert!(api.consume_here(&InterceptContext::new(), None));
}

#[test]
fn test_healthz_reflects_reachability() {
    let port = stub_sidecar("ok", 1);
    assert!(ApiService::with_port(port).healthz());
    assert!(!ApiService::with_port(1).healthz());
}

#[test]
fn test_intercept_info_parses_stub_answer() {
    let port = stub_sidecar(r#"{"intercepted": true, "clientSide": true}"#, 1);
    let info = ApiService::with_port(port)
        .intercept_info(&InterceptContext::new())
        .expect("info");
    assert!(info.intercepted);
    assert!(info.client_side);
}

#[test]
fn test_consume_filter_captures_context_and_gates() {
    let port = stub_sidecar("true", 1);
    let filter = ConsumeFilter::with_api(ApiService::with_port(port));
    let (consume, context) = filter.should_consume([
        ("X-Telepresence-Intercept-As", "alice"),
        ("content-type", "text/plain"),
    ]);
    assert!(consume);
    assert_eq!(context.get("x-telepresence-intercept-as"), Some("alice"));
    assert_eq!(context.headers().count(), 1);
}
