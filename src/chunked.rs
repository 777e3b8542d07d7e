//! Chunked transfer encoding (RFC 7230 section 4.1) for streamed response bodies. This is
//! needed for transports that do not do the chunking themselves; transports with native
//! chunked framing can consume the body stream directly.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;

const CRLF: &[u8] = b"\r\n";
const FINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// Wraps a stream of body chunks so that it yields proper chunks for chunked transfer
/// encoding: each non-empty chunk is prefixed with its size in hex and terminated with CRLF,
/// empty chunks are skipped, and a final zero-length chunk terminates the encoded stream.
/// The source stream is consumed in a single forward pass and is never buffered.
pub struct ChunkedBody<S> {
  inner: S,
  finished: bool
}

impl<S> ChunkedBody<S> {
  /// Creates a new `ChunkedBody` wrapping the given stream
  pub fn new(inner: S) -> ChunkedBody<S> {
    ChunkedBody {
      inner,
      finished: false
    }
  }
}

fn encode_chunk(chunk: Bytes) -> Bytes {
  let size = format!("{:x}", chunk.len());
  let mut framed = BytesMut::with_capacity(size.len() + chunk.len() + 2 * CRLF.len());
  framed.put(size.as_bytes());
  framed.put(CRLF);
  framed.put(chunk);
  framed.put(CRLF);
  framed.freeze()
}

impl<S> Stream for ChunkedBody<S>
  where S: Stream<Item = Bytes> + Unpin {
  type Item = Bytes;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
    let this = self.get_mut();
    if this.finished {
      return Poll::Ready(None)
    }
    loop {
      match Pin::new(&mut this.inner).poll_next(cx) {
        Poll::Ready(Some(chunk)) => {
          // zero-size chunks would terminate the encoded stream early, so skip them
          if !chunk.is_empty() {
            return Poll::Ready(Some(encode_chunk(chunk)))
          }
        },
        Poll::Ready(None) => {
          this.finished = true;
          return Poll::Ready(Some(Bytes::from_static(FINAL_CHUNK)))
        },
        Poll::Pending => return Poll::Pending
      }
    }
  }
}
