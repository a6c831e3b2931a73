//! Fixtures shared by the integration suites.

pub mod factory;
pub mod lookup;

use std::time::Duration;

/// Poll `condition` until it holds, failing the test after about a second.
///
/// Works with paused time too: every sleep advances the clock.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
