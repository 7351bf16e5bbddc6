use crate::messages::{
    target_byte, CloseTarget, DescribeTarget, FrontendMessage, PROTOCOL_VERSION, SSL_REQUEST_CODE,
};
use crate::wire::{put_cstring, put_message, split_frame, Payload};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use datacave_core::{DatacaveError, Result};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Append the wire encoding of a frontend message to `buf`.
pub fn encode_message(buf: &mut BytesMut, msg: &FrontendMessage) {
    match msg {
        FrontendMessage::Startup { params } => {
            let start = buf.len();
            buf.put_i32(0);
            buf.put_i32(PROTOCOL_VERSION);
            // Sorted so the packet is deterministic.
            let mut keys: Vec<&String> = params.keys().collect();
            keys.sort();
            for key in keys {
                put_cstring(buf, key);
                put_cstring(buf, &params[key]);
            }
            buf.put_u8(0);
            let len = (buf.len() - start) as i32;
            buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
        }
        FrontendMessage::SslRequest => {
            buf.put_i32(8);
            buf.put_i32(SSL_REQUEST_CODE);
        }
        FrontendMessage::Query { sql } => put_message(buf, b'Q', |b| put_cstring(b, sql)),
        FrontendMessage::Password { password } => {
            put_message(buf, b'p', |b| put_cstring(b, password))
        }
        FrontendMessage::Terminate => put_message(buf, b'X', |_| {}),
        FrontendMessage::Unsupported { code } => put_message(buf, *code, |_| {}),
        FrontendMessage::Parse {
            statement_name,
            query,
            param_oids,
        } => put_message(buf, b'P', |b| {
            put_cstring(b, statement_name);
            put_cstring(b, query);
            b.put_i16(param_oids.len() as i16);
            for oid in param_oids {
                b.put_i32(*oid);
            }
        }),
        FrontendMessage::Bind {
            portal_name,
            statement_name,
            param_format_codes,
            param_values,
            result_format_codes,
        } => put_message(buf, b'B', |b| {
            put_cstring(b, portal_name);
            put_cstring(b, statement_name);
            b.put_i16(param_format_codes.len() as i16);
            for code in param_format_codes {
                b.put_i16(*code);
            }
            b.put_i16(param_values.len() as i16);
            for value in param_values {
                match value {
                    Some(v) => {
                        b.put_i32(v.len() as i32);
                        b.extend_from_slice(v);
                    }
                    None => b.put_i32(-1),
                }
            }
            b.put_i16(result_format_codes.len() as i16);
            for code in result_format_codes {
                b.put_i16(*code);
            }
        }),
        FrontendMessage::Describe { target, name } => put_message(buf, b'D', |b| {
            b.put_u8(target_byte(*target == DescribeTarget::Statement));
            put_cstring(b, name);
        }),
        FrontendMessage::Execute {
            portal_name,
            max_rows,
        } => put_message(buf, b'E', |b| {
            put_cstring(b, portal_name);
            b.put_i32(*max_rows);
        }),
        FrontendMessage::Sync => put_message(buf, b'S', |_| {}),
        FrontendMessage::Flush => put_message(buf, b'H', |_| {}),
        FrontendMessage::Close { target, name } => put_message(buf, b'C', |b| {
            b.put_u8(target_byte(*target == CloseTarget::Statement));
            put_cstring(b, name);
        }),
    }
}

/// Decode the untagged startup packet (or SSL request) from the front of `buf`.
pub fn decode_startup(buf: &mut BytesMut) -> Result<Option<FrontendMessage>> {
    if buf.len() < 8 {
        return Ok(None);
    }
    let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len < 8 {
        return Err(DatacaveError::protocol(format!("invalid startup length {len}")));
    }
    if buf.len() < len as usize {
        return Ok(None);
    }
    let mut packet = buf.split_to(len as usize).freeze();
    packet.advance(4);
    let version = packet.get_i32();
    if version == SSL_REQUEST_CODE {
        return Ok(Some(FrontendMessage::SslRequest));
    }
    if version != PROTOCOL_VERSION {
        return Err(DatacaveError::protocol(format!("unsupported protocol version {version}")));
    }
    Ok(Some(FrontendMessage::Startup {
        params: parse_params(packet)?,
    }))
}

/// Decode one tagged frontend message from the front of `buf`.
pub fn decode_message(buf: &mut BytesMut, max_len: usize) -> Result<Option<FrontendMessage>> {
    let Some((tag, payload)) = split_frame(buf, max_len)? else {
        return Ok(None);
    };
    parse_message(tag, payload).map(Some)
}

/// Read the startup packet from a stream.
pub async fn read_startup<S: AsyncRead + Unpin>(stream: &mut S) -> Result<FrontendMessage> {
    let len = stream.read_i32().await?;
    if len < 8 {
        return Err(DatacaveError::protocol(format!("invalid startup length {len}")));
    }
    let mut buf = BytesMut::with_capacity(len as usize);
    buf.put_i32(len);
    buf.resize(len as usize, 0);
    stream.read_exact(&mut buf[4..]).await?;
    decode_startup(&mut buf)?.ok_or_else(|| DatacaveError::protocol("incomplete startup packet"))
}

/// Read one tagged message from a stream; end of stream reads as `Terminate`.
pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> Result<FrontendMessage> {
    let msg_type = match stream.read_u8().await {
        Ok(v) => v,
        Err(_) => return Ok(FrontendMessage::Terminate),
    };
    let len = stream.read_i32().await?;
    if len < 4 {
        return Err(DatacaveError::protocol(format!("invalid message length {len}")));
    }
    let mut buf = vec![0u8; len as usize - 4];
    stream.read_exact(&mut buf).await?;
    parse_message(msg_type, Payload::new(Bytes::from(buf)))
}

fn parse_message(tag: u8, mut payload: Payload) -> Result<FrontendMessage> {
    let msg = match tag {
        b'Q' => FrontendMessage::Query {
            sql: payload.cstring()?,
        },
        b'p' => FrontendMessage::Password {
            password: payload.cstring()?,
        },
        b'X' => FrontendMessage::Terminate,
        b'P' => {
            let statement_name = payload.cstring()?;
            let query = payload.cstring()?;
            let count = payload.i16()?.max(0);
            let mut param_oids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                param_oids.push(payload.i32()?);
            }
            FrontendMessage::Parse {
                statement_name,
                query,
                param_oids,
            }
        }
        b'B' => {
            let portal_name = payload.cstring()?;
            let statement_name = payload.cstring()?;
            let mut param_format_codes = Vec::new();
            for _ in 0..payload.i16()?.max(0) {
                param_format_codes.push(payload.i16()?);
            }
            let mut param_values = Vec::new();
            for _ in 0..payload.i16()?.max(0) {
                param_values.push(payload.nullable_bytes()?);
            }
            let mut result_format_codes = Vec::new();
            for _ in 0..payload.i16()?.max(0) {
                result_format_codes.push(payload.i16()?);
            }
            FrontendMessage::Bind {
                portal_name,
                statement_name,
                param_format_codes,
                param_values,
                result_format_codes,
            }
        }
        b'D' => {
            let target = match payload.u8()? {
                b'S' => DescribeTarget::Statement,
                b'P' => DescribeTarget::Portal,
                other => {
                    return Err(DatacaveError::protocol(format!(
                        "invalid describe target {:?}",
                        other as char
                    )))
                }
            };
            FrontendMessage::Describe {
                target,
                name: payload.cstring()?,
            }
        }
        b'E' => FrontendMessage::Execute {
            portal_name: payload.cstring()?,
            max_rows: payload.i32()?,
        },
        b'S' => FrontendMessage::Sync,
        b'H' => FrontendMessage::Flush,
        b'C' => {
            let target = match payload.u8()? {
                b'S' => CloseTarget::Statement,
                b'P' => CloseTarget::Portal,
                other => {
                    return Err(DatacaveError::protocol(format!(
                        "invalid close target {:?}",
                        other as char
                    )))
                }
            };
            FrontendMessage::Close {
                target,
                name: payload.cstring()?,
            }
        }
        other => return Ok(FrontendMessage::Unsupported { code: other }),
    };
    payload.finish("frontend message")?;
    Ok(msg)
}

fn parse_params(packet: Bytes) -> Result<HashMap<String, String>> {
    let mut payload = Payload::new(packet);
    let mut params = HashMap::new();
    while payload.remaining() > 0 {
        let key = payload.cstring()?;
        if key.is_empty() {
            break;
        }
        let value = payload.cstring()?;
        params.insert(key, value);
    }
    Ok(params)
}
