use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::envelope::Envelope;
use crate::error::{ProtocolError, ProtocolResult};

/// Upper bound for a single control-channel frame, delimiter excluded.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

pub const FRAME_DELIMITER: u8 = b'\n';

/// Data-channel chunk types (TLV convention between file-transfer peers).
pub const CHUNK_DATA: u8 = 0x01;
pub const CHUNK_END_OF_STREAM: u8 = 0x02;
pub const CHUNK_FAILURE: u8 = 0x03;

/// Encode an envelope into wire bytes: compact JSON plus the delimiter.
pub fn encode_frame(envelope: &Envelope) -> ProtocolResult<Vec<u8>> {
    let mut data = serde_json::to_vec(envelope)
        .map_err(|e| ProtocolError::bad_request(format!("Encode failed: {e}")))?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::bad_request(
            "Payload too large for control channel",
        ));
    }
    data.push(FRAME_DELIMITER);
    Ok(data)
}

/// Decode wire bytes into an envelope, stripping a trailing delimiter.
pub fn decode_frame(data: &[u8]) -> ProtocolResult<Envelope> {
    let body = match data.split_last() {
        Some((&FRAME_DELIMITER, rest)) => rest,
        _ => data,
    };
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::bad_request(
            "Payload too large for control channel",
        ));
    }
    serde_json::from_slice(body)
        .map_err(|e| ProtocolError::bad_request(format!("Decode failed: {e}")))
}

/// Read one delimited frame's raw bytes from the stream.
///
/// Returns `None` on a clean EOF, or when the peer vanishes mid-frame.
pub async fn read_raw_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader.read_until(FRAME_DELIMITER, &mut buf).await?;
    if n == 0 || buf.last() != Some(&FRAME_DELIMITER) {
        return Ok(None);
    }
    Ok(Some(buf))
}

/// Encode a binary data-channel chunk: 1 byte type, 4 bytes LE length,
/// then the payload.
pub fn encode_chunk(chunk_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(chunk_type);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decode a TLV chunk, returning the type byte and its payload.
pub fn decode_chunk(data: &[u8]) -> ProtocolResult<(u8, &[u8])> {
    if data.len() < 5 {
        return Err(ProtocolError::bad_request("Incomplete chunk header"));
    }
    let chunk_type = data[0];
    let length = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
    let payload = data
        .get(5..5 + length)
        .ok_or_else(|| ProtocolError::bad_request("Chunk payload truncated"))?;
    Ok((chunk_type, payload))
}
