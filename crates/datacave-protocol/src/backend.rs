use crate::messages::{BackendMessage, RowDescriptionField, TransactionState};
use crate::wire::{put_cstring, put_message, split_frame, Payload};
use bytes::{BufMut, BytesMut};
use datacave_core::{DatacaveError, Result, ServerError};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Largest backend message accepted unless the caller configures otherwise.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Append the wire encoding of a backend message to `buf`.
pub fn encode_message(buf: &mut BytesMut, msg: &BackendMessage) {
    match msg {
        BackendMessage::AuthenticationOk => put_message(buf, b'R', |b| b.put_i32(0)),
        BackendMessage::AuthenticationCleartextPassword => put_message(buf, b'R', |b| b.put_i32(3)),
        BackendMessage::AuthenticationMd5Password { salt } => put_message(buf, b'R', |b| {
            b.put_i32(5);
            b.extend_from_slice(salt);
        }),
        BackendMessage::AuthenticationSasl { mechanisms } => put_message(buf, b'R', |b| {
            b.put_i32(10);
            for mechanism in mechanisms {
                put_cstring(b, mechanism);
            }
            b.put_u8(0);
        }),
        BackendMessage::AuthenticationOther { code } => put_message(buf, b'R', |b| b.put_i32(*code)),
        BackendMessage::ParameterStatus { key, value } => put_message(buf, b'S', |b| {
            put_cstring(b, key);
            put_cstring(b, value);
        }),
        BackendMessage::BackendKeyData { pid, secret } => put_message(buf, b'K', |b| {
            b.put_i32(*pid);
            b.put_i32(*secret);
        }),
        BackendMessage::ReadyForQuery { state } => {
            put_message(buf, b'Z', |b| b.put_u8(state.wire_byte()))
        }
        BackendMessage::ParseComplete => put_message(buf, b'1', |_| {}),
        BackendMessage::BindComplete => put_message(buf, b'2', |_| {}),
        BackendMessage::CloseComplete => put_message(buf, b'3', |_| {}),
        BackendMessage::NoData => put_message(buf, b'n', |_| {}),
        BackendMessage::EmptyQueryResponse => put_message(buf, b'I', |_| {}),
        BackendMessage::PortalSuspended => put_message(buf, b's', |_| {}),
        BackendMessage::ParameterDescription { type_oids } => put_message(buf, b't', |b| {
            b.put_i16(type_oids.len() as i16);
            for oid in type_oids {
                b.put_i32(*oid);
            }
        }),
        BackendMessage::RowDescription { fields } => put_message(buf, b'T', |b| {
            b.put_i16(fields.len() as i16);
            for field in fields {
                put_cstring(b, &field.name);
                b.put_i32(field.table_oid);
                b.put_i16(field.column_id);
                b.put_i32(field.type_oid);
                b.put_i16(field.type_size);
                b.put_i32(field.type_modifier);
                b.put_i16(field.format);
            }
        }),
        BackendMessage::DataRow { values } => put_message(buf, b'D', |b| {
            b.put_i16(values.len() as i16);
            for value in values {
                match value {
                    Some(v) => {
                        b.put_i32(v.len() as i32);
                        b.extend_from_slice(v);
                    }
                    None => b.put_i32(-1),
                }
            }
        }),
        BackendMessage::CommandComplete { tag } => put_message(buf, b'C', |b| put_cstring(b, tag)),
        BackendMessage::ErrorResponse(err) => put_message(buf, b'E', |b| put_error_fields(b, err)),
        BackendMessage::NoticeResponse(err) => put_message(buf, b'N', |b| put_error_fields(b, err)),
        BackendMessage::NotificationResponse {
            pid,
            channel,
            payload,
        } => put_message(buf, b'A', |b| {
            b.put_i32(*pid);
            put_cstring(b, channel);
            put_cstring(b, payload);
        }),
    }
}

/// Encode and write a single backend message to a stream.
pub async fn write_message<S: AsyncWrite + Unpin>(stream: &mut S, msg: &BackendMessage) -> Result<()> {
    let mut buf = BytesMut::new();
    encode_message(&mut buf, msg);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Decode one backend message from the front of `buf`.
///
/// On success the consumed bytes are removed from `buf`. `Ok(None)` means the
/// buffer does not yet hold a complete message and nothing was consumed.
pub fn decode_message(buf: &mut BytesMut, max_len: usize) -> Result<Option<BackendMessage>> {
    let Some((tag, mut payload)) = split_frame(buf, max_len)? else {
        return Ok(None);
    };
    let msg = match tag {
        b'R' => {
            let code = payload.i32()?;
            match code {
                0 => BackendMessage::AuthenticationOk,
                3 => BackendMessage::AuthenticationCleartextPassword,
                5 => {
                    let salt = payload.bytes(4)?;
                    BackendMessage::AuthenticationMd5Password {
                        salt: [salt[0], salt[1], salt[2], salt[3]],
                    }
                }
                10 => {
                    let mut mechanisms = Vec::new();
                    loop {
                        let mechanism = payload.cstring()?;
                        if mechanism.is_empty() {
                            break;
                        }
                        mechanisms.push(mechanism);
                    }
                    BackendMessage::AuthenticationSasl { mechanisms }
                }
                other => {
                    // Remaining bytes are method specific and irrelevant once rejected.
                    let rest = payload.remaining();
                    payload.bytes(rest)?;
                    BackendMessage::AuthenticationOther { code: other }
                }
            }
        }
        b'S' => {
            let key = payload.cstring()?;
            let value = payload.cstring()?;
            BackendMessage::ParameterStatus { key, value }
        }
        b'K' => {
            let pid = payload.i32()?;
            let secret = payload.i32()?;
            BackendMessage::BackendKeyData { pid, secret }
        }
        b'Z' => {
            let byte = payload.u8()?;
            let state = TransactionState::from_wire_byte(byte).ok_or_else(|| {
                DatacaveError::protocol(format!("invalid transaction state {:?}", byte as char))
            })?;
            BackendMessage::ReadyForQuery { state }
        }
        b'1' => BackendMessage::ParseComplete,
        b'2' => BackendMessage::BindComplete,
        b'3' => BackendMessage::CloseComplete,
        b'n' => BackendMessage::NoData,
        b'I' => BackendMessage::EmptyQueryResponse,
        b's' => BackendMessage::PortalSuspended,
        b't' => {
            let count = read_count(&mut payload)?;
            let mut type_oids = Vec::with_capacity(count);
            for _ in 0..count {
                type_oids.push(payload.i32()?);
            }
            BackendMessage::ParameterDescription { type_oids }
        }
        b'T' => {
            let count = read_count(&mut payload)?;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(RowDescriptionField {
                    name: payload.cstring()?,
                    table_oid: payload.i32()?,
                    column_id: payload.i16()?,
                    type_oid: payload.i32()?,
                    type_size: payload.i16()?,
                    type_modifier: payload.i32()?,
                    format: payload.i16()?,
                });
            }
            BackendMessage::RowDescription { fields }
        }
        b'D' => {
            let count = read_count(&mut payload)?;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(payload.nullable_bytes()?);
            }
            BackendMessage::DataRow { values }
        }
        b'C' => BackendMessage::CommandComplete {
            tag: payload.cstring()?,
        },
        b'E' => BackendMessage::ErrorResponse(read_error_fields(&mut payload)?),
        b'N' => BackendMessage::NoticeResponse(read_error_fields(&mut payload)?),
        b'A' => {
            let pid = payload.i32()?;
            let channel = payload.cstring()?;
            let payload_text = payload.cstring()?;
            BackendMessage::NotificationResponse {
                pid,
                channel,
                payload: payload_text,
            }
        }
        other => {
            return Err(DatacaveError::protocol(format!(
                "unknown backend message tag {:?}",
                other as char
            )))
        }
    };
    payload.finish(msg.name())?;
    Ok(Some(msg))
}

fn read_count(payload: &mut Payload) -> Result<usize> {
    let count = payload.i16()?;
    if count < 0 {
        return Err(DatacaveError::protocol(format!("negative field count {count}")));
    }
    Ok(count as usize)
}

fn put_error_fields(buf: &mut BytesMut, err: &ServerError) {
    buf.put_u8(b'S');
    put_cstring(buf, &err.severity);
    buf.put_u8(b'C');
    put_cstring(buf, &err.code);
    buf.put_u8(b'M');
    put_cstring(buf, &err.message);
    if let Some(detail) = &err.detail {
        buf.put_u8(b'D');
        put_cstring(buf, detail);
    }
    if let Some(hint) = &err.hint {
        buf.put_u8(b'H');
        put_cstring(buf, hint);
    }
    buf.put_u8(0);
}

fn read_error_fields(payload: &mut Payload) -> Result<ServerError> {
    let mut err = ServerError::default();
    loop {
        let field = payload.u8()?;
        if field == 0 {
            break;
        }
        let value = payload.cstring()?;
        match field {
            // Non-localized severity wins over the localized one.
            b'S' if err.severity.is_empty() => err.severity = value,
            b'V' => err.severity = value,
            b'C' => err.code = value,
            b'M' => err.message = value,
            b'D' => err.detail = Some(value),
            b'H' => err.hint = Some(value),
            _ => {}
        }
    }
    Ok(err)
}
