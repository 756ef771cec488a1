// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Framed binary codec and TCP session.
//!
//! Requests and responses travel as length-prefixed frames. A request is
//! the command name followed by its arguments in declared order, each
//! tagged with a wire type; a response is a controller error string (empty
//! means success) followed by a tagged payload list. Bool arguments are
//! encoded as int by the caller before they reach this layer.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! request  := u32 body_len, body
//! body     := u16 cmd_len, cmd_utf8, u16 arg_count, arg*
//! arg      := u16 name_len, name_utf8, tagged
//! response := u32 body_len, body
//! body     := u32 err_len, err_utf8, u32 payload_count, tagged*
//! tagged   := 0u8 f64 | 1u8 i64 | 2u8 (u32 len, utf8) | 3u8 (u32 count, tagged*)
//! ```
//!
//! The encoder/decoder pair is public so loopback test controllers and
//! out-of-tree adapters can speak the same bytes.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BridgeError, Result};
use crate::value::{ScalarValue, WireValue};

use super::{ResponseEnvelope, Session, SessionFactory};

const TAG_FLOAT: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_STR: u8 = 2;
const TAG_LIST: u8 = 3;

/// Upper bound on a frame body; anything larger is a protocol error, not
/// an allocation request.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a request body (without the length prefix).
pub fn encode_request(command: &str, args: &[(String, ScalarValue)]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    put_short_str(&mut buf, command)?;
    let count = u16::try_from(args.len())
        .map_err(|_| BridgeError::protocol("too many arguments for one frame"))?;
    buf.put_u16(count);
    for (name, value) in args {
        put_short_str(&mut buf, name)?;
        match value {
            ScalarValue::Float(v) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f64(*v);
            }
            ScalarValue::Int(v) => {
                buf.put_u8(TAG_INT);
                buf.put_i64(*v);
            }
            // Bool is coerced to int upstream; encode defensively anyway.
            ScalarValue::Bool(v) => {
                buf.put_u8(TAG_INT);
                buf.put_i64(i64::from(*v));
            }
            ScalarValue::Str(text) => {
                buf.put_u8(TAG_STR);
                put_long_str(&mut buf, text)?;
            }
        }
    }
    Ok(buf.freeze())
}

/// Decode a request body. Server-side counterpart of [`encode_request`],
/// used by loopback test controllers.
pub fn decode_request(body: &[u8]) -> Result<(String, Vec<(String, ScalarValue)>)> {
    let mut buf = body;
    let command = get_short_str(&mut buf)?;
    let count = get_u16(&mut buf)?;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = get_short_str(&mut buf)?;
        let tag = get_u8(&mut buf)?;
        let value = match tag {
            TAG_FLOAT => ScalarValue::Float(get_f64(&mut buf)?),
            TAG_INT => ScalarValue::Int(get_i64(&mut buf)?),
            TAG_STR => ScalarValue::Str(get_long_str(&mut buf)?),
            other => {
                return Err(BridgeError::protocol(format!(
                    "unknown argument tag {other} in request frame"
                )))
            }
        };
        args.push((name, value));
    }
    Ok((command, args))
}

/// Encode a response body (without the length prefix).
pub fn encode_response(error: &str, payload: &[WireValue]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    put_long_str(&mut buf, error)?;
    let count = u32::try_from(payload.len())
        .map_err(|_| BridgeError::protocol("payload too large for one frame"))?;
    buf.put_u32(count);
    for value in payload {
        put_wire_value(&mut buf, value)?;
    }
    Ok(buf.freeze())
}

/// Decode a response body into the `(error_string, payload)` envelope.
pub fn decode_response(body: &[u8]) -> Result<ResponseEnvelope> {
    let mut buf = body;
    let error = get_long_str(&mut buf)?;
    let count = get_u32(&mut buf)?;
    let mut payload = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        payload.push(get_wire_value(&mut buf)?);
    }
    if !buf.is_empty() {
        return Err(BridgeError::protocol(format!(
            "{} trailing bytes after response payload",
            buf.len()
        )));
    }
    Ok(ResponseEnvelope { error, payload })
}

fn put_wire_value(buf: &mut BytesMut, value: &WireValue) -> Result<()> {
    match value {
        WireValue::Float(v) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_f64(*v);
        }
        WireValue::Int(v) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*v);
        }
        WireValue::Str(text) => {
            buf.put_u8(TAG_STR);
            put_long_str(buf, text)?;
        }
        WireValue::List(items) => {
            buf.put_u8(TAG_LIST);
            let count = u32::try_from(items.len())
                .map_err(|_| BridgeError::protocol("list too large for one frame"))?;
            buf.put_u32(count);
            for item in items {
                put_wire_value(buf, item)?;
            }
        }
    }
    Ok(())
}

fn get_wire_value(buf: &mut &[u8]) -> Result<WireValue> {
    let tag = get_u8(buf)?;
    match tag {
        TAG_FLOAT => Ok(WireValue::Float(get_f64(buf)?)),
        TAG_INT => Ok(WireValue::Int(get_i64(buf)?)),
        TAG_STR => Ok(WireValue::Str(get_long_str(buf)?)),
        TAG_LIST => {
            let count = get_u32(buf)?;
            let mut items = Vec::with_capacity(count.min(4096) as usize);
            for _ in 0..count {
                items.push(get_wire_value(buf)?);
            }
            Ok(WireValue::List(items))
        }
        other => Err(BridgeError::protocol(format!(
            "unknown payload tag {other} in response frame"
        ))),
    }
}

fn put_short_str(buf: &mut BytesMut, text: &str) -> Result<()> {
    let len = u16::try_from(text.len())
        .map_err(|_| BridgeError::protocol(format!("string too long for frame: {text}")))?;
    buf.put_u16(len);
    buf.put_slice(text.as_bytes());
    Ok(())
}

fn put_long_str(buf: &mut BytesMut, text: &str) -> Result<()> {
    let len = u32::try_from(text.len())
        .map_err(|_| BridgeError::protocol("string too long for frame"))?;
    buf.put_u32(len);
    buf.put_slice(text.as_bytes());
    Ok(())
}

fn need(buf: &&[u8], bytes: usize) -> Result<()> {
    if buf.remaining() < bytes {
        return Err(BridgeError::protocol(format!(
            "truncated frame: needed {bytes} more bytes, had {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_i64(buf: &mut &[u8]) -> Result<i64> {
    need(buf, 8)?;
    Ok(buf.get_i64())
}

fn get_f64(buf: &mut &[u8]) -> Result<f64> {
    need(buf, 8)?;
    Ok(buf.get_f64())
}

fn get_short_str(buf: &mut &[u8]) -> Result<String> {
    let len = get_u16(buf)? as usize;
    get_str_bytes(buf, len)
}

fn get_long_str(buf: &mut &[u8]) -> Result<String> {
    let len = get_u32(buf)? as usize;
    get_str_bytes(buf, len)
}

fn get_str_bytes(buf: &mut &[u8], len: usize) -> Result<String> {
    if len > MAX_FRAME_LEN {
        return Err(BridgeError::protocol(format!("string length {len} exceeds frame limit")));
    }
    need(buf, len)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(bytes)
        .map_err(|_| BridgeError::protocol("frame string is not valid utf-8"))
}

/// Write one length-prefixed frame.
pub fn write_frame(stream: &mut impl Write, body: &[u8]) -> std::io::Result<()> {
    let len = body.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

/// Read one length-prefixed frame.
pub fn read_frame(stream: &mut impl Read) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).map_err(map_io_error)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(BridgeError::protocol(format!(
            "frame length {len} exceeds limit {MAX_FRAME_LEN}"
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).map_err(map_io_error)?;
    Ok(body)
}

/// Remap socket errors onto the transport taxonomy: timeouts become
/// `TimeoutError`, drops become `ConnectionError`.
pub fn map_io_error(err: std::io::Error) -> BridgeError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            BridgeError::timeout(format!("socket operation timed out: {err}"))
        }
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionRefused
        | ErrorKind::NotConnected => {
            BridgeError::connection(format!("connection dropped: {err}"))
        }
        _ => BridgeError::connection(format!("socket error: {err}")),
    }
}

/// A live framed-protocol session over one TCP stream.
pub struct TcpWireSession {
    endpoint: String,
    stream: TcpStream,
}

impl Session for TcpWireSession {
    fn call(&mut self, command: &str, args: &[(String, ScalarValue)]) -> Result<ResponseEnvelope> {
        let body = encode_request(command, args)?;
        write_frame(&mut self.stream, &body).map_err(map_io_error)?;
        let response = read_frame(&mut self.stream)?;
        decode_response(&response)
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Opens framed-protocol TCP sessions.
pub struct TcpSessionFactory;

impl SessionFactory for TcpSessionFactory {
    fn open(&self, host: &str, port: u16, timeout: Duration) -> Result<Box<dyn Session>> {
        let endpoint = format!("{host}:{port}");
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| BridgeError::connection(format!("cannot resolve {endpoint}: {e}")))?
            .next()
            .ok_or_else(|| {
                BridgeError::connection(format!("no address resolved for {endpoint}"))
            })?;
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                BridgeError::timeout(format!(
                    "timed out opening socket to {endpoint} (timeout {timeout:?})"
                ))
            } else {
                BridgeError::connection(format!("failed to open socket to {endpoint}: {e}"))
            }
        })?;
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|()| stream.set_write_timeout(Some(timeout)))
            .and_then(|()| stream.set_nodelay(true))
            .map_err(|e| BridgeError::connection(format!("socket setup for {endpoint}: {e}")))?;
        Ok(Box::new(TcpWireSession { endpoint, stream }))
    }

    fn backend_name(&self) -> &str {
        "wire"
    }

    fn version_string(&self) -> String {
        format!("spmbridge-wire/{}", env!("CARGO_PKG_VERSION"))
    }
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
