use futures::prelude::*;
pub use kube::runtime::watcher::{Event, Result};
use kube::ResourceExt;
use std::pin::Pin;
use tokio::time;
use tracing::{debug, info, Instrument};

/// Wraps a resource event stream, retrying through errors.
pub struct Watch<T> {
    initialized: bool,
    skip_until: Option<u64>,
    span: tracing::Span,
    rx: Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>,
}

// === impl Watch ===

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = Result<Event<T>>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Self::new(watch.boxed())
    }
}

impl<T> Watch<T> {
    pub fn new(rx: Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>) -> Watch<T> {
        Self {
            rx,
            initialized: false,
            skip_until: None,
            span: tracing::Span::current(),
        }
    }

    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Drops object events at or below `version` until the first newer event is received.
    ///
    /// Used when resuming from a known point: the initial listing replays objects that have
    /// already been processed.
    pub fn skip_until(mut self, version: Option<u64>) -> Self {
        self.skip_until = version;
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl<T: ResourceExt> Watch<T> {
    /// Receives the next event in the stream, or `None` once the stream ends.
    ///
    /// If the stream fails, log the error and sleep for 1s before polling for a reset event.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            let ev = self.rx.next().instrument(self.span.clone()).await?;

            match ev {
                Ok(ev) => {
                    self.initialized = true;
                    if self.skips(&ev) {
                        continue;
                    }
                    return Some(ev);
                }
                Err(error) => {
                    info!(parent: &self.span, %error, "Failed");
                    time::sleep(time::Duration::from_secs(1)).await;
                    info!(parent: &self.span, "Restarting");
                }
            }
        }
    }

    fn skips(&mut self, ev: &Event<T>) -> bool {
        let Some(start) = self.skip_until else {
            return false;
        };
        let obj = match ev {
            Event::Apply(obj) | Event::Delete(obj) | Event::InitApply(obj) => obj,
            Event::Init | Event::InitDone => return false,
        };

        // Versions that are not integers cannot be compared and are never skipped.
        match obj.resource_version().and_then(|v| v.parse::<u64>().ok()) {
            Some(version) if version <= start => {
                debug!(parent: &self.span, name = %obj.name_any(), version, "Skipping");
                true
            }
            _ => {
                self.skip_until = None;
                false
            }
        }
    }
}
