//! Length-prefixed framed-stream adapter.
//!
//! The bulk store-import operation wraps its payload in frames: an
//! 8-byte little-endian length followed by exactly that many raw bytes,
//! no padding. [`FramedReader`] strips the framing and exposes the
//! concatenated payload as a plain [`AsyncRead`], so the codec and the
//! archive validator work on it unchanged.

use std::io;
use std::pin::Pin;
use std::task::ready;
use std::task::Context;
use std::task::Poll;

use tokio::io::AsyncRead;
use tokio::io::ReadBuf;

/// Maximum length of a single frame (256 MB).
/// A hostile prefix beyond this is a framing error, not an allocation.
pub const MAX_FRAME_LEN: u64 = 256 * 1024 * 1024;

enum FrameState {
    /// Accumulating the 8-byte length prefix.
    Header { buf: [u8; 8], filled: usize },
    /// Streaming the current frame's payload.
    Body { remaining: u64 },
}

/// Read adapter that reassembles framed payload bytes.
///
/// Zero-length frames are skipped. EOF on a frame boundary is a clean
/// end of stream; EOF inside a header or body is a framing error.
pub struct FramedReader<R> {
    inner: R,
    state: FrameState,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: FrameState::Header { buf: [0; 8], filled: 0 },
        }
    }

    /// Give back the underlying stream.
    ///
    /// Callers are expected to have consumed the framed payload in
    /// full; any partially-read frame is abandoned mid-stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for FramedReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            match &mut this.state {
                FrameState::Header { buf, filled } => {
                    while *filled < 8 {
                        let mut header = ReadBuf::new(&mut buf[*filled..]);
                        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut header))?;
                        let n = header.filled().len();
                        if n == 0 {
                            if *filled == 0 {
                                // Clean EOF between frames.
                                return Poll::Ready(Ok(()));
                            }
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "truncated frame header",
                            )));
                        }
                        *filled += n;
                    }

                    let len = u64::from_le_bytes(*buf);
                    if len > MAX_FRAME_LEN {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("frame length {len} exceeds maximum {MAX_FRAME_LEN}"),
                        )));
                    }
                    this.state = FrameState::Body { remaining: len };
                }
                FrameState::Body { remaining } => {
                    if *remaining == 0 {
                        this.state = FrameState::Header { buf: [0; 8], filled: 0 };
                        continue;
                    }

                    let want = out.remaining().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                    let mut body = out.take(want);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut body))?;
                    let n = body.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "truncated frame body",
                        )));
                    }

                    // Safety: `poll_read` on the inner stream initialized `n` bytes
                    // of the region `take` borrowed from `out`.
                    unsafe { out.assume_init(n) };
                    out.advance(n);
                    *remaining -= n as u64;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}
