//! sluice wire format — framed commands and responses on both transports.
//!
//! Two encodings carry the same logical frames: a compact binary form used
//! on the GATT link and a JSON form used on the broker link. The two are
//! deliberately asymmetric — a command carries an opcode string, a response
//! carries a status byte in place of it — so a response can never be
//! mis-parsed as a command. `decode_command` enforces that refusal.
//!
//! Every field and every size here is part of the device's external
//! protocol. Changing anything is a breaking change for paired apps.

use serde::{Deserialize, Serialize};

// ── Limits ────────────────────────────────────────────────────────────────────

/// Maximum opcode length in bytes.
pub const MAX_OP_LEN: usize = 15;

/// Smallest possible binary command: id(2) + opLen(1).
pub const MIN_COMMAND_LEN: usize = 3;

/// Opcode string a binary response carries when status == 0.
const OP_OK: &str = "ok";
/// Opcode string a binary response carries when status != 0.
const OP_ERR: &str = "err";

// ── Frames ────────────────────────────────────────────────────────────────────

/// Which transport produced a frame.
///
/// Stamped by the receiving transport when the frame is decoded, never taken
/// from the sender. Egress workers filter their outgoing queue by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Short-range GATT-style link.
    Gatt,
    /// Publish/subscribe broker link.
    Broker,
}

/// A decoded command, ready for the processor.
///
/// Created by a transport, consumed exactly once by the command processor.
/// The payload moves with the frame — whoever holds the frame owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// 16-bit correlation id, echoed in every response.
    pub id: u16,
    /// Opcode, 1..=15 bytes of printable ASCII.
    pub op: String,
    /// Transport that delivered this command.
    pub origin: Origin,
    /// Optional opaque payload.
    pub payload: Option<Vec<u8>>,
}

/// A response produced by the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Copied from the command.
    pub id: u16,
    /// Copied from the command — selects the egress transport.
    pub origin: Origin,
    /// 0 = ok, negative = error kind.
    pub status: i8,
    /// Optional payload, owned by whoever holds the frame.
    pub payload: Option<Vec<u8>>,
    /// False only for intermediate responses of a stream.
    pub is_final: bool,
}

impl ResponseFrame {
    /// The single final response for a command.
    pub fn finish(cmd: &CommandFrame, status: i8, payload: Option<Vec<u8>>) -> Self {
        Self {
            id: cmd.id,
            origin: cmd.origin,
            status,
            payload,
            is_final: true,
        }
    }
}

// ── Binary codec ──────────────────────────────────────────────────────────────

/// Decode a binary command frame: `id(2, LE) ‖ opLen(1) ‖ op ‖ payload`.
///
/// Refuses response frames: an opcode of `"ok"` or `"err"` can only have
/// been produced by `encode_response`, and decoding one as a command is a
/// protocol violation on the sender's side.
pub fn decode_command(bytes: &[u8], origin: Origin) -> Result<CommandFrame, WireError> {
    if bytes.len() < MIN_COMMAND_LEN {
        return Err(WireError::ShortFrame(bytes.len()));
    }

    let id = u16::from_le_bytes([bytes[0], bytes[1]]);
    let op_len = bytes[2] as usize;
    if op_len == 0 || op_len > MAX_OP_LEN {
        return Err(WireError::BadOpLen(bytes[2]));
    }
    if MIN_COMMAND_LEN + op_len > bytes.len() {
        return Err(WireError::ShortFrame(bytes.len()));
    }

    let op_bytes = &bytes[MIN_COMMAND_LEN..MIN_COMMAND_LEN + op_len];
    if !is_printable_ascii(op_bytes) {
        return Err(WireError::Encoding);
    }
    // Infallible after the ASCII check.
    let op = String::from_utf8(op_bytes.to_vec()).map_err(|_| WireError::Encoding)?;

    if op == OP_OK || op == OP_ERR {
        return Err(WireError::ResponseAsCommand);
    }

    let rest = &bytes[MIN_COMMAND_LEN + op_len..];
    let payload = if rest.is_empty() {
        None
    } else {
        Some(rest.to_vec())
    };

    Ok(CommandFrame {
        id,
        op,
        origin,
        payload,
    })
}

/// Encode a binary response frame:
/// `id(2, LE) ‖ opLen(1) ‖ "ok"|"err" ‖ status(1) ‖ payload`.
pub fn encode_response(resp: &ResponseFrame) -> Vec<u8> {
    let op = if resp.status == 0 { OP_OK } else { OP_ERR };
    let payload = resp.payload.as_deref().unwrap_or(&[]);

    let mut out = Vec::with_capacity(3 + op.len() + 1 + payload.len());
    out.extend_from_slice(&resp.id.to_le_bytes());
    out.push(op.len() as u8);
    out.extend_from_slice(op.as_bytes());
    out.push(resp.status as u8);
    out.extend_from_slice(payload);
    out
}

// ── JSON codec ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JsonCommand {
    id: u16,
    op: String,
    payload: Option<String>,
}

#[derive(Serialize)]
struct JsonResponse<'a> {
    id: u16,
    status: i8,
    is_final: bool,
    payload: Option<&'a str>,
}

/// Decode a JSON command object: `{"id": u16, "op": string, "payload"?: string}`.
///
/// Missing or wrongly-typed required fields fail with `Schema`; opcode
/// limits are the same as for the binary form.
pub fn decode_command_json(bytes: &[u8], origin: Origin) -> Result<CommandFrame, WireError> {
    let parsed: JsonCommand =
        serde_json::from_slice(bytes).map_err(|e| WireError::Schema(e.to_string()))?;

    if parsed.op.is_empty() || parsed.op.len() > MAX_OP_LEN {
        return Err(WireError::BadOpLen(parsed.op.len().min(255) as u8));
    }
    if !is_printable_ascii(parsed.op.as_bytes()) {
        return Err(WireError::Encoding);
    }
    if parsed.op == OP_OK || parsed.op == OP_ERR {
        return Err(WireError::ResponseAsCommand);
    }

    Ok(CommandFrame {
        id: parsed.id,
        op: parsed.op,
        origin,
        payload: parsed.payload.map(String::into_bytes),
    })
}

/// Encode a JSON response object:
/// `{"id": u16, "status": i8, "is_final": bool, "payload": string|null}`.
///
/// The payload travels as a JSON string and must therefore be valid UTF-8;
/// anything else fails with `Encoding`.
pub fn encode_response_json(resp: &ResponseFrame) -> Result<Vec<u8>, WireError> {
    let payload = match resp.payload.as_deref() {
        Some(bytes) => Some(std::str::from_utf8(bytes).map_err(|_| WireError::Encoding)?),
        None => None,
    };

    serde_json::to_vec(&JsonResponse {
        id: resp.id,
        status: resp.status,
        is_final: resp.is_final,
        payload,
    })
    .map_err(|e| WireError::Schema(e.to_string()))
}

fn is_printable_ascii(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| (0x20..=0x7e).contains(b))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting frame data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: {0} bytes")]
    ShortFrame(usize),

    #[error("opcode length out of range: {0}")]
    BadOpLen(u8),

    #[error("refusing to decode a response frame as a command")]
    ResponseAsCommand,

    #[error("JSON schema violation: {0}")]
    Schema(String),

    #[error("opcode or payload is not valid text")]
    Encoding,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
