//! Skips socket-bound tests where localhost cannot be bound.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_SOCKET_TESTS_VAR: &str = "RANGEFETCH_REQUIRE_SOCKET_TESTS";

fn socket_tests_required() -> bool {
    std::env::var(REQUIRE_SOCKET_TESTS_VAR)
        .ok()
        .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Value returned by a test body that was skipped.
pub fn socket_skip_return() {}

/// Starts a mock server, or `None` when localhost sockets are unavailable.
#[track_caller]
pub fn start_mock_server_or_skip() -> impl std::future::Future<Output = Option<MockServer>> {
    let skip = should_skip(Location::caller());
    async move {
        if skip {
            None
        } else {
            Some(MockServer::start().await)
        }
    }
}

/// True when localhost sockets are unavailable and the calling test should return early.
#[track_caller]
pub fn skip_socket_test() -> bool {
    should_skip(Location::caller())
}

fn should_skip(location: &Location<'_>) -> bool {
    if TcpListener::bind("127.0.0.1:0").is_ok() {
        return false;
    }
    let message = format!(
        "[socket-bound-test] cannot bind localhost socket at {}:{}",
        location.file(),
        location.line()
    );
    assert!(
        !socket_tests_required(),
        "{message}. Unset {REQUIRE_SOCKET_TESTS_VAR} to allow skipping."
    );
    eprintln!("{message}. Skipping test. Set {REQUIRE_SOCKET_TESTS_VAR}=1 to fail instead.");
    true
}
