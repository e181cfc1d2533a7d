use tokio::task::JoinHandle;

/// Runs a blocking engine call off the async runtime. The name shows up in the log on panic.
pub fn spawn_blocking_named<F, R>(name: &'static str, f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        match result {
            Ok(value) => value,
            Err(panic) => {
                crate::error!("blocking task '{}' panicked", name);
                std::panic::resume_unwind(panic)
            }
        }
    })
}
