use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};

use crate::{DecodedFrame, FrameSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSendError {
    Full,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub depth: usize,
    pub peak_depth: usize,
    pub sent: u64,
    /// Subset of `sent` that came from the decoder rather than a still image.
    pub decoded: u64,
    pub dropped: u64,
}

#[derive(Debug)]
struct ChannelCounters {
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    sent: AtomicU64,
    decoded: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl ChannelCounters {
    fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            sent: AtomicU64::new(0),
            decoded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn on_send(&self, from_decoder: bool) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        if from_decoder {
            self.decoded.fetch_add(1, Ordering::Relaxed);
        }
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        let mut peak = self.peak_depth.load(Ordering::Relaxed);
        while depth > peak {
            match self.peak_depth.compare_exchange_weak(
                peak,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }
    }

    fn on_recv(&self) {
        let current = self.depth.load(Ordering::Relaxed);
        if current > 0 {
            let _ = self.depth.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn on_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            depth: self.depth.load(Ordering::Relaxed),
            peak_depth: self.peak_depth.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Producer half of the decoded-frame channel. Handed to the external decoder
/// so its output callback can deliver pictures without touching session state.
#[derive(Debug)]
pub struct FrameSender {
    inner: SyncSender<DecodedFrame>,
    counters: Arc<ChannelCounters>,
}

impl Clone for FrameSender {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

#[derive(Debug)]
pub struct FrameReceiver {
    inner: Receiver<DecodedFrame>,
    counters: Arc<ChannelCounters>,
}

impl FrameSender {
    /// Never blocks. A full or closed channel drops the frame and counts it.
    pub fn send(&self, frame: DecodedFrame) -> Result<(), FrameSendError> {
        if self.counters.closed.load(Ordering::Acquire) {
            self.counters.on_drop();
            return Err(FrameSendError::Closed);
        }
        let from_decoder = frame.source == FrameSource::Decoder;
        match self.inner.try_send(frame) {
            Ok(()) => {
                self.counters.on_send(from_decoder);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.on_drop();
                Err(FrameSendError::Full)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.on_drop();
                Err(FrameSendError::Closed)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.counters.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }
}

impl FrameReceiver {
    pub fn try_recv(&self) -> Option<DecodedFrame> {
        match self.inner.try_recv() {
            Ok(frame) => {
                self.counters.on_recv();
                Some(frame)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Marks the channel closed and discards anything still queued. Senders
    /// held by a decoder callback keep working but every send is dropped.
    pub fn close(&self) -> usize {
        self.counters.closed.store(true, Ordering::Release);
        let mut discarded = 0usize;
        while self.try_recv().is_some() {
            discarded += 1;
        }
        discarded
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }
}

pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    let counters = Arc::new(ChannelCounters::new());
    (
        FrameSender {
            inner: tx,
            counters: Arc::clone(&counters),
        },
        FrameReceiver {
            inner: rx,
            counters,
        },
    )
}
