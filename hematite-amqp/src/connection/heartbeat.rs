//! Implements an asynchronous heartbeat for the connection event loop

use std::{task::Poll, time::Duration};

use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio::time::Instant;
use tokio_stream::wrappers::IntervalStream;

pin_project! {
    /// A wrapper over an `Option<IntervalStream>` which never yields if the
    /// underlying interval is `None`
    #[derive(Debug)]
    pub struct HeartBeat {
        #[pin]
        interval: Option<IntervalStream>,
    }
}

impl HeartBeat {
    /// A [`HeartBeat`] that never yields an item
    pub fn never() -> Self {
        Self { interval: None }
    }

    /// A [`HeartBeat`] that yields an item per the given interval
    pub fn new(period: Duration) -> Self {
        let interval = Some(IntervalStream::new(tokio::time::interval(period)));
        Self { interval }
    }
}

impl Stream for HeartBeat {
    type Item = Instant;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.interval.as_pin_mut() {
            Some(stream) => stream.poll_next(cx),
            None => Poll::Pending,
        }
    }
}
