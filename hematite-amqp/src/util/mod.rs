//! Common utilities

use std::{pin::Pin, task::Poll, time::Duration};

use futures_util::Future;
use tokio::time::{Instant, Sleep};

mod operation_queue;
pub use operation_queue::AsyncOperationQueue;

/// Whether an event loop should continue running after handling one unit of
/// work
#[derive(Debug)]
pub(crate) enum Running {
    Continue,
    Stop,
}

/// Tracks the peer-facing idle timeout of a transport.
///
/// The deadline is reset whenever a frame arrives; the future resolves when
/// the remote has been silent for the whole duration.
#[derive(Debug)]
pub(crate) struct IdleTimeout {
    delay: Pin<Box<Sleep>>,
    duration: Duration,
}

impl IdleTimeout {
    pub fn new(duration: Duration) -> Self {
        let delay = Box::pin(tokio::time::sleep(duration));
        Self { delay, duration }
    }

    pub fn reset(&mut self) {
        let next = Instant::now() + self.duration;
        self.delay.as_mut().reset(next);
    }
}

impl Future for IdleTimeout {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.delay.as_mut().poll(cx)
    }
}

/// Shared type state for builders
#[derive(Debug)]
pub struct Uninitialized {}

/// Shared type state for builders
#[derive(Debug)]
pub struct Initialized {}
