//! Executor construction
//!
//! The channel itself is runtime-agnostic: every loop is a spawned task on
//! whatever runtime `Channel::start` is awaited from. This module maps the
//! `num_threads` option onto a tokio runtime flavor for embedders that let
//! the options record pick the executor shape.

use tokio::runtime::{Builder, Runtime};

/// Build a runtime for the given worker count.
///
/// `0` runs the event loop on the caller thread (current-thread runtime);
/// any other value builds a worker pool of that size.
pub fn build_runtime(num_threads: usize) -> std::io::Result<Runtime> {
    if num_threads == 0 {
        Builder::new_current_thread().enable_all().build()
    } else {
        Builder::new_multi_thread()
            .worker_threads(num_threads)
            .enable_all()
            .build()
    }
}
