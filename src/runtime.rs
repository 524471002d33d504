use once_cell::sync::Lazy;
use std::future::Future;
use std::sync::Mutex;
use tokio::runtime::{Builder, Runtime};

static TOKIO_RUNTIME: Lazy<Mutex<Runtime>> = Lazy::new(|| {
    Mutex::new(
        Builder::new_current_thread()
            .thread_name("tokio-rollover-blocking")
            .enable_all()
            .build()
            .expect("cannot build tokio runtime"),
    )
});

/// Drives an AWS SDK future to completion from the synchronous call sites.
pub fn block_on<F: Future>(future: F) -> F::Output {
    TOKIO_RUNTIME.lock().unwrap().block_on(future)
}
