use std::future::Future;
use std::io;

use tokio::task::JoinHandle;

/// Spawn one peer's background task. Named through the Tokio builder under
/// `tokio_unstable`, otherwise wrapped in a `peer_task` span.
pub fn spawn_named_task<F, S>(name: S, future: F) -> io::Result<JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Into<String>,
{
    let task_name = name.into();
    #[cfg(tokio_unstable)]
    {
        tokio::task::Builder::new().name(&task_name).spawn(future)
    }
    #[cfg(not(tokio_unstable))]
    {
        use tracing::Instrument;
        let span = tracing::info_span!(target: "legit_mahjong::tasks", "peer_task", task_name = %task_name);
        Ok(tokio::spawn(future.instrument(span)))
    }
}
