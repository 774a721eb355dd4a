//! Shutdown signal helpers.

use tokio::sync::watch;

/// Resolve once the shutdown flag is set to `true`.
///
/// A dropped sender never fires: the caller keeps running until some other
/// termination signal arrives.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}
