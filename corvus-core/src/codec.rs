//! Framed codec for the NATS text protocol.
//!
//! Client ops encode to exact wire frames; server ops decode
//! resumably: whenever a frame is incomplete the decoder consumes
//! nothing and returns `Ok(None)`, so arbitrarily chunked input
//! produces the same op sequence as the unsplit stream.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::headers::HeaderMap;
use crate::info::{ConnectInfo, ServerInfo};

const CRLF: &[u8] = b"\r\n";

/// Operations the client writes to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    Connect(ConnectInfo),
    Publish {
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    },
    Subscribe {
        subject: String,
        queue_group: Option<String>,
        sid: String,
    },
    Unsubscribe {
        sid: String,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

/// Operations the server sends to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    Info(Box<ServerInfo>),
    Msg {
        subject: String,
        sid: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Codec failure: either transport I/O or a protocol violation.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Stateless framing codec; holds no partial-parse state because the
/// decoder rewinds to frame boundaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct Codec;

impl Encoder<ClientOp> for Codec {
    type Error = CodecError;

    fn encode(&mut self, op: ClientOp, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match op {
            ClientOp::Connect(info) => {
                let json = serde_json::to_string(&info).map_err(|e| {
                    ProtocolError::invalid_message(format!("CONNECT encode: {e}"))
                })?;
                dst.extend_from_slice(b"CONNECT ");
                dst.extend_from_slice(json.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            ClientOp::Publish {
                subject,
                reply,
                headers,
                payload,
            } => match headers {
                Some(headers) => {
                    let block = headers.encode();
                    let hlen = block.len();
                    let tlen = hlen + payload.len();
                    dst.extend_from_slice(b"HPUB ");
                    dst.extend_from_slice(subject.as_bytes());
                    if let Some(ref reply) = reply {
                        dst.extend_from_slice(b" ");
                        dst.extend_from_slice(reply.as_bytes());
                    }
                    dst.extend_from_slice(format!(" {hlen} {tlen}").as_bytes());
                    dst.extend_from_slice(CRLF);
                    dst.extend_from_slice(&block);
                    dst.extend_from_slice(&payload);
                    dst.extend_from_slice(CRLF);
                }
                None => {
                    dst.extend_from_slice(b"PUB ");
                    dst.extend_from_slice(subject.as_bytes());
                    if let Some(ref reply) = reply {
                        dst.extend_from_slice(b" ");
                        dst.extend_from_slice(reply.as_bytes());
                    }
                    dst.extend_from_slice(format!(" {}", payload.len()).as_bytes());
                    dst.extend_from_slice(CRLF);
                    dst.extend_from_slice(&payload);
                    dst.extend_from_slice(CRLF);
                }
            },
            ClientOp::Subscribe {
                subject,
                queue_group,
                sid,
            } => {
                dst.extend_from_slice(b"SUB ");
                dst.extend_from_slice(subject.as_bytes());
                if let Some(ref queue) = queue_group {
                    dst.extend_from_slice(b" ");
                    dst.extend_from_slice(queue.as_bytes());
                }
                dst.extend_from_slice(b" ");
                dst.extend_from_slice(sid.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            ClientOp::Unsubscribe { sid, max } => {
                dst.extend_from_slice(b"UNSUB ");
                dst.extend_from_slice(sid.as_bytes());
                if let Some(max) = max {
                    dst.extend_from_slice(format!(" {max}").as_bytes());
                }
                dst.extend_from_slice(CRLF);
            }
            ClientOp::Ping => dst.extend_from_slice(b"PING\r\n"),
            ClientOp::Pong => dst.extend_from_slice(b"PONG\r\n"),
        }
        Ok(())
    }
}

impl Decoder for Codec {
    type Item = ServerOp;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerOp>, Self::Error> {
        let Some(line_end) = find_crlf(src) else {
            return Ok(None);
        };

        // Parse the command line before consuming anything so an
        // incomplete payload rewinds to the frame start for free.
        let line = std::str::from_utf8(&src[..line_end])
            .map_err(|_| ProtocolError::invalid_message("command line is not UTF-8"))?;
        let (command, args) = match line.split_once(' ') {
            Some((c, a)) => (c, Some(a)),
            None => (line, None),
        };

        if command.eq_ignore_ascii_case("MSG") {
            let args = MsgArgs::parse(args.unwrap_or(""), false)?;
            let payload_start = line_end + 2;
            let total = payload_start + args.payload_len + 2;
            if src.len() < total {
                return Ok(None);
            }
            let mut frame = src.split_to(total);
            frame.advance(payload_start);
            let payload = frame.split_to(args.payload_len).freeze();
            return Ok(Some(ServerOp::Msg {
                subject: args.subject,
                sid: args.sid,
                reply: args.reply,
                headers: None,
                payload,
            }));
        }

        if command.eq_ignore_ascii_case("HMSG") {
            let args = MsgArgs::parse(args.unwrap_or(""), true)?;
            let header_len = args.header_len;
            let body_start = line_end + 2;
            let total = body_start + args.payload_len + 2;
            if src.len() < total {
                return Ok(None);
            }
            let mut frame = src.split_to(total);
            frame.advance(body_start);
            let header_block = frame.split_to(header_len);
            let payload = frame.split_to(args.payload_len - header_len).freeze();
            let headers = HeaderMap::decode(&header_block)?;
            return Ok(Some(ServerOp::Msg {
                subject: args.subject,
                sid: args.sid,
                reply: args.reply,
                headers: Some(headers),
                payload,
            }));
        }

        // Every remaining op is a single line; build it, then consume.
        let op = if command.eq_ignore_ascii_case("INFO") {
            let json = args
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .ok_or_else(|| ProtocolError::invalid_message("INFO without payload"))?;
            let info: ServerInfo = serde_json::from_str(json)
                .map_err(|e| ProtocolError::invalid_message(format!("INFO payload: {e}")))?;
            ServerOp::Info(Box::new(info))
        } else if command.eq_ignore_ascii_case("PING") {
            ServerOp::Ping
        } else if command.eq_ignore_ascii_case("PONG") {
            ServerOp::Pong
        } else if command.eq_ignore_ascii_case("+OK") {
            ServerOp::Ok
        } else if command.eq_ignore_ascii_case("-ERR") {
            let message = args.map(str::trim).unwrap_or("");
            let message = message
                .strip_prefix('\'')
                .and_then(|m| m.strip_suffix('\''))
                .or_else(|| {
                    message
                        .strip_prefix('"')
                        .and_then(|m| m.strip_suffix('"'))
                })
                .unwrap_or(message);
            ServerOp::Err(message.to_owned())
        } else {
            return Err(ProtocolError::invalid_message(format!(
                "unknown command: '{command}'"
            ))
            .into());
        };

        src.advance(line_end + 2);
        Ok(Some(op))
    }
}

/// Parsed argument list of a MSG or HMSG command line.
struct MsgArgs {
    subject: String,
    sid: String,
    reply: Option<String>,
    /// Total sized bytes after the command line (tlen for HMSG).
    payload_len: usize,
    header_len: usize,
}

impl MsgArgs {
    fn parse(args: &str, with_headers: bool) -> Result<Self, ProtocolError> {
        let parts: Vec<&str> = args.split_ascii_whitespace().collect();
        let (fixed, op) = if with_headers { (4, "HMSG") } else { (3, "MSG") };
        // optional reply adds one
        if parts.len() != fixed && parts.len() != fixed + 1 {
            return Err(ProtocolError::invalid_message(format!(
                "malformed {op} arguments: '{args}'"
            )));
        }
        let has_reply = parts.len() == fixed + 1;
        let subject = parts[0].to_owned();
        let sid = parts[1].to_owned();
        let reply = has_reply.then(|| parts[2].to_owned());
        let sizes = &parts[2 + usize::from(has_reply)..];

        let parse_size = |s: &str| -> Result<usize, ProtocolError> {
            let n: i64 = s.parse().map_err(|_| {
                ProtocolError::invalid_message(format!("non-numeric size in {op}: '{s}'"))
            })?;
            usize::try_from(n).map_err(|_| {
                ProtocolError::invalid_message(format!("negative size in {op}: {n}"))
            })
        };

        if with_headers {
            let header_len = parse_size(sizes[0])?;
            let total_len = parse_size(sizes[1])?;
            if total_len < header_len {
                return Err(ProtocolError::invalid_message(format!(
                    "HMSG total length {total_len} below header length {header_len}"
                )));
            }
            Ok(MsgArgs {
                subject,
                sid,
                reply,
                payload_len: total_len,
                header_len,
            })
        } else {
            Ok(MsgArgs {
                subject,
                sid,
                reply,
                payload_len: parse_size(sizes[0])?,
                header_len: 0,
            })
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}
