/*!
Assertion helpers for integration tests against a live host.
*/

use std::time::Duration;

/// Init logging for tests; safe to call from every test.
pub fn init_test_logging() {
    env_logger::try_init().ok();
}

/// Poll a condition every 25 ms until it holds or the timeout runs out.
/// Returns the condition's final value.
pub async fn wait_for<F: Fn() -> bool>(condition: F, timeout_ms: u64) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
