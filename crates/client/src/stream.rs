//! Per-observer status stream.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_stream::Stream;

use jobwatch_core::JobHandle;

use crate::poller::Poller;
use crate::registry::{JobEvent, JobRegistry, Subscription, SubscriberId};

/// Stream of [`JobEvent`]s for one job.
///
/// Starts with the current known status and ends after a terminal status or
/// a `Lost` event. Dropping it unsubscribes; when the last observer leaves,
/// polling stops after the grace period.
pub struct JobStream {
    handle: JobHandle,
    subscriber: Option<SubscriberId>,
    receiver: UnboundedReceiver<JobEvent>,
    registry: Arc<JobRegistry>,
    poller: Poller,
    finished: bool,
}

impl JobStream {
    pub(crate) fn new(
        handle: JobHandle,
        subscription: Subscription,
        registry: Arc<JobRegistry>,
        poller: Poller,
    ) -> Self {
        Self {
            handle,
            subscriber: Some(subscription.id),
            receiver: subscription.receiver,
            registry,
            poller,
            finished: false,
        }
    }

    /// A stream that yields one `Lost` event and ends.
    pub(crate) fn lost(
        handle: JobHandle,
        reason: impl Into<String>,
        registry: Arc<JobRegistry>,
        poller: Poller,
    ) -> Self {
        let (tx, receiver) = mpsc::unbounded_channel();
        let _ = tx.send(JobEvent::Lost {
            reason: reason.into(),
        });
        Self {
            handle,
            subscriber: None,
            receiver,
            registry,
            poller,
            finished: false,
        }
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn detach(&mut self) {
        let Some(id) = self.subscriber.take() else {
            return;
        };
        if self.registry.unsubscribe(&self.handle, id) != Some(0) {
            return;
        }
        // Dropped outside a runtime: nothing can run the grace timer.
        if tokio::runtime::Handle::try_current().is_ok() {
            self.poller.release(&self.handle);
        } else {
            self.poller.stop(&self.handle);
        }
    }
}

impl Stream for JobStream {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_final() {
                    self.finished = true;
                    self.detach();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                self.detach();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for JobStream {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for JobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStream")
            .field("handle", &self.handle)
            .field("subscriber", &self.subscriber)
            .field("finished", &self.finished)
            .finish()
    }
}
