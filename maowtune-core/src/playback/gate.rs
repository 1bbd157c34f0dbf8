//! playback/gate.rs
//!
//! Pause/resume gate placed between the transcoder output and the demuxer.
//! A paused gate holds back reads at the source, so the encoder stalls
//! behind a pause, and the pump waits on the handle before each frame so
//! packets the demuxer already holds stay put too. The handle side is shared with command handlers; the
//! reader side is owned by the pump.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Playing,
    Paused,
    /// Terminal. Readers see end-of-stream.
    Closed,
}

/// Controls a gate. Cheap to clone; every clone drives the same gate.
#[derive(Clone)]
pub struct GateHandle {
    state: Arc<watch::Sender<GateState>>,
}

/// Create a gate around `inner`, initially playing.
pub fn gate<R>(inner: R) -> (GateHandle, GatedReader<R>) {
    let (tx, rx) = watch::channel(GateState::Playing);
    let handle = GateHandle { state: Arc::new(tx) };
    let reader = GatedReader {
        inner,
        state: rx,
        waiting: None,
    };
    (handle, reader)
}

impl GateHandle {
    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    /// Returns true if the gate went from playing to paused.
    pub fn pause(&self) -> bool {
        self.transition(|s| match s {
            GateState::Playing => Some(GateState::Paused),
            _ => None,
        })
    }

    /// Returns true if the gate went from paused to playing.
    pub fn resume(&self) -> bool {
        self.transition(|s| match s {
            GateState::Paused => Some(GateState::Playing),
            _ => None,
        })
    }

    /// Flip between playing and paused and report the resulting state.
    /// A closed gate stays closed.
    pub fn toggle(&self) -> GateState {
        let mut result = GateState::Closed;
        self.state.send_if_modified(|s| {
            let next = match *s {
                GateState::Playing => GateState::Paused,
                GateState::Paused => GateState::Playing,
                GateState::Closed => GateState::Closed,
            };
            result = next;
            if next != *s {
                *s = next;
                true
            } else {
                false
            }
        });
        debug!("gate toggled => {:?}", result);
        result
    }

    /// Close the gate for good, waking any blocked reader.
    pub fn close(&self) {
        self.state.send_if_modified(|s| {
            if *s == GateState::Closed {
                false
            } else {
                *s = GateState::Closed;
                true
            }
        });
    }

    /// Resolve once the gate is not paused, returning `Playing` or `Closed`.
    pub async fn wait_until_open(&self) -> GateState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| *s != GateState::Paused).await {
            Ok(s) => *s,
            Err(_) => GateState::Closed,
        }
    }

    fn transition(&self, f: impl FnOnce(GateState) -> Option<GateState>) -> bool {
        self.state.send_if_modified(|s| match f(*s) {
            Some(next) => {
                *s = next;
                true
            }
            None => false,
        })
    }
}

type WaitFuture = Pin<Box<dyn Future<Output = GateState> + Send>>;

/// Read side of a gate. Reads pass straight through while playing, park
/// while paused and report end-of-stream once closed.
pub struct GatedReader<R> {
    inner: R,
    state: watch::Receiver<GateState>,
    waiting: Option<WaitFuture>,
}

impl<R: AsyncRead + Unpin> AsyncRead for GatedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(wait) = this.waiting.as_mut() {
                let state = ready!(wait.as_mut().poll(cx));
                this.waiting = None;
                return match state {
                    GateState::Closed => Poll::Ready(Ok(())),
                    _ => Pin::new(&mut this.inner).poll_read(cx, buf),
                };
            }

            let current = *this.state.borrow();
            match current {
                GateState::Playing => return Pin::new(&mut this.inner).poll_read(cx, buf),
                GateState::Closed => return Poll::Ready(Ok(())),
                GateState::Paused => {
                    // wait_for checks the current value before parking, so a
                    // resume that lands between borrow() and here is not lost.
                    let mut rx = this.state.clone();
                    this.waiting = Some(Box::pin(async move {
                        match rx.wait_for(|s| *s != GateState::Paused).await {
                            Ok(s) => *s,
                            Err(_) => GateState::Closed,
                        }
                    }));
                }
            }
        }
    }
}
