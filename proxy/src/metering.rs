//! Adapters that turn a byte source into a sequence of chunks and charge
//! every chunk to the ledger as it is consumed.

use bytes::Bytes;
use common::BandwidthLedger;
use futures::Stream;
use hyper::body::{Body, Frame, SizeHint};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// Which counter a chunk lands in, seen from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Caller → destination
    Sent,
    /// Destination → caller
    Received,
}

#[derive(Clone)]
pub struct Meter {
    ledger: Arc<BandwidthLedger>,
    destination: Arc<str>,
    direction: Direction,
}

impl Meter {
    pub fn new(ledger: Arc<BandwidthLedger>, destination: &str, direction: Direction) -> Self {
        Self {
            ledger,
            destination: Arc::from(destination),
            direction,
        }
    }

    pub fn record(&self, len: usize) {
        let len = len as u64;
        match self.direction {
            Direction::Sent => self.ledger.record_bytes(&self.destination, len, 0),
            Direction::Received => self.ledger.record_bytes(&self.destination, 0, len),
        }
    }

    pub fn ledger(&self) -> &Arc<BandwidthLedger> {
        &self.ledger
    }
}

/// Chunks read from an async reader, each one metered once when yielded.
/// Ends at EOF and cannot be restarted.
pub struct MeteredChunks<R> {
    chunks: ReaderStream<R>,
    meter: Meter,
}

impl<R: AsyncRead> MeteredChunks<R> {
    pub fn new(reader: R, meter: Meter) -> Self {
        Self {
            chunks: ReaderStream::new(reader),
            meter,
        }
    }
}

impl<R: AsyncRead + Unpin> Stream for MeteredChunks<R> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = ready!(Pin::new(&mut this.chunks).poll_next(cx));
        if let Some(Ok(chunk)) = &item {
            this.meter.record(chunk.len());
        }
        Poll::Ready(item)
    }
}

/// Response body wrapper that meters each data frame and schedules a ledger
/// flush once the body finishes, fails, or is dropped early.
pub struct MeteredBody<B> {
    inner: B,
    meter: Meter,
    flushed: bool,
}

impl<B> MeteredBody<B> {
    pub fn new(inner: B, meter: Meter) -> Self {
        Self {
            inner,
            meter,
            flushed: false,
        }
    }

    fn finish(&mut self) {
        if !self.flushed {
            self.flushed = true;
            self.meter.ledger().schedule_flush();
        }
    }
}

impl<B> Body for MeteredBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.meter.record(data.len());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for MeteredBody<B> {
    fn drop(&mut self) {
        self.finish();
    }
}
