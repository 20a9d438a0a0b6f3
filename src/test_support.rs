use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        if Instant::now() > deadline {
            panic!("condition not met within 2s");
        }
        sleep(Duration::from_millis(5)).await;
    }
}
