//! Length-prefixed bincode framing over any reliable byte stream.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use dfit_core::{DfitError, ErrorInfo};

/// Upper bound on a single frame's payload. A header above this is
/// treated as stream corruption rather than an allocation request.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Writes one message as a `u32` big-endian length prefix followed by its
/// bincode payload, then flushes the stream.
pub fn write_frame<W: Write, T: Serialize>(stream: &mut W, message: &T) -> Result<(), DfitError> {
    let payload = bincode::serialize(message)
        .map_err(|err| DfitError::Protocol(ErrorInfo::new("frame-encode", err.to_string())))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        DfitError::Protocol(
            ErrorInfo::new("frame-oversize", "message exceeds u32 frame length")
                .with_context("bytes", payload.len().to_string()),
        )
    })?;
    if len > MAX_FRAME_BYTES {
        return Err(DfitError::Protocol(
            ErrorInfo::new("frame-oversize", "message exceeds frame cap")
                .with_context("bytes", len.to_string())
                .with_context("cap", MAX_FRAME_BYTES.to_string()),
        ));
    }
    stream
        .write_all(&len.to_be_bytes())
        .and_then(|_| stream.write_all(&payload))
        .and_then(|_| stream.flush())
        .map_err(|err| DfitError::Io(ErrorInfo::new("frame-write", err.to_string())))
}

/// Reads one framed message. A closed stream, short read or undecodable
/// payload is a protocol error; the caller treats it as fatal since the
/// protocol has no retry.
pub fn read_frame<R: Read, T: DeserializeOwned>(stream: &mut R) -> Result<T, DfitError> {
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .map_err(|err| DfitError::Protocol(ErrorInfo::new("frame-header", err.to_string())))?;
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_BYTES {
        return Err(DfitError::Protocol(
            ErrorInfo::new("frame-cap", "frame length exceeds cap")
                .with_context("bytes", len.to_string())
                .with_context("cap", MAX_FRAME_BYTES.to_string())
                .with_hint("stream is likely corrupt or misaligned"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .map_err(|err| DfitError::Protocol(ErrorInfo::new("frame-body", err.to_string())))?;
    bincode::deserialize(&payload)
        .map_err(|err| DfitError::Protocol(ErrorInfo::new("frame-decode", err.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CoordRequest, WorkerReply};
    use std::io::Cursor;

    #[test]
    fn request_round_trips_through_frame() {
        let request = CoordRequest::Evaluate {
            n_total: 7,
            n_free: 5,
            values: vec![1.0, -2.5, 0.25],
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &request).expect("write");
        let mut cursor = Cursor::new(buffer);
        let decoded: CoordRequest = read_frame(&mut cursor).expect("read");
        assert_eq!(decoded, request);
    }

    #[test]
    fn consecutive_frames_stay_aligned() {
        let first = WorkerReply::Loaded {
            worker_id: 0,
            event_count: 12_000,
        };
        let second = WorkerReply::Evaluated {
            worker_id: 0,
            partial_nll: -1234.5,
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &first).expect("write first");
        write_frame(&mut buffer, &second).expect("write second");
        let mut cursor = Cursor::new(buffer);
        let a: WorkerReply = read_frame(&mut cursor).expect("read first");
        let b: WorkerReply = read_frame(&mut cursor).expect("read second");
        assert_eq!(a, first);
        assert_eq!(b, second);
    }

    #[test]
    fn truncated_stream_is_a_protocol_error() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &CoordRequest::Cache).expect("write");
        buffer.truncate(buffer.len() - 1);
        let mut cursor = Cursor::new(buffer);
        let err = read_frame::<_, CoordRequest>(&mut cursor).unwrap_err();
        assert_eq!(err.info().code, "frame-body");
    }

    #[test]
    fn oversized_header_is_rejected_without_allocating() {
        let mut buffer = Vec::from((MAX_FRAME_BYTES + 1).to_be_bytes());
        buffer.extend_from_slice(&[0u8; 8]);
        let mut cursor = Cursor::new(buffer);
        let err = read_frame::<_, CoordRequest>(&mut cursor).unwrap_err();
        assert_eq!(err.info().code, "frame-cap");
    }
}
