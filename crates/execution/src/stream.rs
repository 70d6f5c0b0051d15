//! Step-vector stream abstractions and channel adapters.

use std::pin::Pin;
use std::task::{Context, Poll};

use fmq_common::{FmqError, Result};
use fmq_storage::Labels;
use futures::channel::mpsc;
use futures::Stream;

use crate::model::StepVector;

/// A stream of step-vector batches that also knows the series it carries.
pub trait StepVectorStream: Stream<Item = Result<Vec<StepVector>>> + Send {
    /// Labels of every series batches on this stream may contain.
    fn series(&self) -> &[Labels];
}

/// The standard "stream a remote engine hands back".
pub type SendableStepVectorStream = Pin<Box<dyn StepVectorStream>>;

/// Adapter that attaches a series list to any batch stream.
pub struct StreamAdapter<S> {
    series: Vec<Labels>,
    inner: S,
}

impl<S> StreamAdapter<S> {
    pub fn new(series: Vec<Labels>, inner: S) -> Self {
        Self { series, inner }
    }
}

impl<S> StepVectorStream for StreamAdapter<S>
where
    S: Stream<Item = Result<Vec<StepVector>>> + Send + Unpin + 'static,
{
    fn series(&self) -> &[Labels] {
        &self.series
    }
}

impl<S> Stream for StreamAdapter<S>
where
    S: Stream<Item = Result<Vec<StepVector>>> + Unpin,
{
    type Item = Result<Vec<StepVector>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// A stream that ends immediately (useful for engines with no matching data).
pub fn empty_stream(series: Vec<Labels>) -> SendableStepVectorStream {
    let inner = futures::stream::empty::<Result<Vec<StepVector>>>();
    Box::pin(StreamAdapter::new(series, inner))
}

/// Create a stream backed by a bounded channel.
///
/// Backpressure: when the consumer is slow and the buffer fills up,
/// `sender.send_batch(..).await` waits until there is capacity again.
pub fn bounded_batch_channel(
    series: Vec<Labels>,
    capacity: usize,
) -> (BatchSender, SendableStepVectorStream) {
    let (tx, rx) = mpsc::channel::<Result<Vec<StepVector>>>(capacity);
    let stream = Box::pin(StreamAdapter::new(series, rx));
    (BatchSender { tx }, stream)
}

/// Sender side for [`bounded_batch_channel`].
#[derive(Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<Result<Vec<StepVector>>>,
}

impl BatchSender {
    /// Send a batch (awaits if the channel buffer is full).
    pub async fn send_batch(&mut self, batch: Vec<StepVector>) -> Result<()> {
        use futures::SinkExt;
        self.tx
            .send(Ok(batch))
            .await
            .map_err(|e| FmqError::RemoteUnavailable(format!("batch channel closed: {e}")))
    }

    /// Send an error and terminate downstream consumption.
    pub async fn send_error(&mut self, err: FmqError) -> Result<()> {
        use futures::SinkExt;
        self.tx
            .send(Err(err))
            .await
            .map_err(|e| FmqError::RemoteUnavailable(format!("batch channel closed: {e}")))
    }
}
