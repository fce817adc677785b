use std::time::Duration;

use tracing::debug;

/// Suspends the current task for at least `duration`, then resumes
pub async fn wait(duration: Duration) {
    debug!("Waiting for {}ms", duration.as_millis());
    tokio::time::sleep(duration).await;
}
