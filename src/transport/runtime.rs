use std::future::Future;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::error::Result;

/// Tokio runtime the connection tasks run on
///
/// Either dedicated to one `Client`/`Server` or borrowed from the
/// application. A dedicated runtime is shut down in the background on drop so
/// dropping never waits on a task that is blocked in I/O.
pub(crate) struct TransportRuntime {
    handle: Handle,
    owned: Option<Runtime>,
}

impl TransportRuntime {
    pub(crate) fn dedicated(thread_name: &str, worker_threads: Option<usize>) -> Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder.thread_name(thread_name).enable_all();
        if let Some(n) = worker_threads {
            builder.worker_threads(n);
        }
        let runtime = builder.build()?;

        Ok(Self {
            handle: runtime.handle().clone(),
            owned: Some(runtime),
        })
    }

    pub(crate) fn shared(handle: Handle) -> Self {
        Self {
            handle,
            owned: None,
        }
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl Drop for TransportRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.owned.take() {
            runtime.shutdown_background();
        }
    }
}
