//! Event-stream frame reader.
//!
//! The chat endpoint streams blocks of text separated by a blank line.  Each block carries its
//! payload on one or more `data:` lines holding a JSON [`StreamEvent`].  The reader tolerates
//! arbitrary chunk boundaries: bytes are buffered until a complete block is present, so a chunk
//! may end in the middle of the marker, of the payload, of a multi-byte character, or of the
//! delimiter itself.

use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use crate::observability::{
    STREAM_BYTES, STREAM_DISCARDED, STREAM_ERRORS, STREAM_FRAMES, STREAM_SALVAGED_ERRORS,
};
use crate::{Error, Result, StreamEvent};

/// Prefix of a payload line.
pub const DATA_MARKER: &str = "data:";

////////////////////////////////////////////// Framing /////////////////////////////////////////////

/// Splits buffered bytes into frames and decodes each into a [`StreamEvent`].
///
/// Frames that decode to nothing are skipped.  Bytes left over at end of input never form an
/// event.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameDecoder {
    // Offset into the buffer before which no delimiter can start.  Bytes ahead of it have already
    // been searched, so a frame arriving in many chunks is scanned once.
    next_index: usize,
}

impl FrameDecoder {
    /// Creates a new decoder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameDecoder {
    type Item = StreamEvent;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<StreamEvent>> {
        while let Some((end, delimiter)) = find_delimiter(buf, self.next_index) {
            let frame = buf.split_to(end);
            buf.advance(delimiter);
            self.next_index = 0;
            STREAM_FRAMES.click();
            if let Some(event) = decode_frame(&frame) {
                return Ok(Some(event));
            }
        }
        // The longest delimiter is three bytes, so one may still start in the last two.
        self.next_index = buf.len().saturating_sub(2);
        Ok(None)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<StreamEvent>> {
        if let Some(event) = self.decode(buf)? {
            return Ok(Some(event));
        }
        if !buf.is_empty() {
            STREAM_DISCARDED.click();
            tracing::debug!(bytes = buf.len(), "stream ended inside a frame; discarding remainder");
            buf.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

/// Finds the first blank line at or after `from`, returning where the frame ends and how long the
/// delimiter is.
fn find_delimiter(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some((i, 2)),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Decodes one complete frame.
///
/// A frame whose payload is not a recognized event is kept only if it reads like an error the
/// backend emitted as plain text; anything else (comments, ids, keep-alives) is dropped.
pub fn decode_frame(frame: &[u8]) -> Option<StreamEvent> {
    let text = String::from_utf8_lossy(frame);
    let mut payload = Vec::new();
    let mut other = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(data) = line.strip_prefix(DATA_MARKER) {
            payload.push(data.strip_prefix(' ').unwrap_or(data));
        } else if !line.is_empty() && !line.starts_with(':') {
            other.push(line);
        }
    }

    let candidate = if payload.is_empty() {
        other.join("\n")
    } else {
        payload.join("\n")
    };
    if candidate.trim().is_empty() {
        STREAM_DISCARDED.click();
        return None;
    }

    match serde_json::from_str::<StreamEvent>(&candidate) {
        Ok(event) => Some(event),
        Err(err) if looks_like_error(&candidate) => {
            STREAM_SALVAGED_ERRORS.click();
            tracing::debug!(error = %err, "treating undecodable frame as a backend error");
            Some(StreamEvent::error(candidate.trim()))
        }
        Err(err) => {
            STREAM_DISCARDED.click();
            tracing::debug!(error = %err, "discarding undecodable frame");
            None
        }
    }
}

// Some backends emit failures as bare text frames.
fn looks_like_error(text: &str) -> bool {
    text.to_ascii_lowercase().contains("error")
}

////////////////////////////////////////////// Reading /////////////////////////////////////////////

struct ReadState<S> {
    source: Option<S>,
    buffer: BytesMut,
    decoder: FrameDecoder,
    cancel: CancellationToken,
}

impl<S> ReadState<S> {
    fn release(&mut self) {
        self.source = None;
        self.buffer.clear();
        self.decoder = FrameDecoder::new();
    }
}

/// Decodes `bytes` into a lazy sequence of events.
///
/// Nothing is read until the sequence is polled.  The byte source is dropped on every exit path:
/// at end of input, after the first read error (which is yielded), and when `cancel` fires (an
/// [`Error::Abort`] is yielded in that case).  Bytes that arrive after cancellation are never
/// decoded.
pub fn read_events<S>(
    bytes: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<StreamEvent>> + Send + 'static
where
    S: Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
{
    let state = ReadState {
        source: Some(bytes),
        buffer: BytesMut::new(),
        decoder: FrameDecoder::new(),
        cancel,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.source.is_some() && state.cancel.is_cancelled() {
                state.release();
                return Some((Err(Error::abort("stream cancelled")), state));
            }

            match state.decoder.decode(&mut state.buffer) {
                Ok(Some(event)) => return Some((Ok(event), state)),
                Ok(None) => {}
                Err(err) => {
                    state.release();
                    return Some((Err(err), state));
                }
            }

            let ReadState {
                source, cancel, ..
            } = &mut state;
            let source = source.as_mut()?;
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => continue,
                next = source.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    STREAM_BYTES.count(chunk.len() as u64);
                    state.buffer.extend_from_slice(&chunk);
                }
                Some(Err(err)) => {
                    STREAM_ERRORS.click();
                    tracing::warn!(error = %err, "event stream failed");
                    state.release();
                    return Some((Err(err), state));
                }
                None => {
                    state.source = None;
                    if let Ok(Some(event)) = state.decoder.decode_eof(&mut state.buffer) {
                        return Some((Ok(event), state));
                    }
                    state.release();
                    return None;
                }
            }
        }
    })
}
