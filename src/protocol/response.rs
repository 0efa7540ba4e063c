use bytes::{Buf, BufMut, BytesMut};

use super::packet::{status_flags::*, Buffer, Command, Packet};

/// First payload byte of an OK packet
pub const OK_HEADER: u8 = 0x00;
/// First payload byte of an ERR packet
pub const ERR_HEADER: u8 = 0xFF;
/// First payload byte of an EOF packet (and of auth-switch requests)
pub const EOF_HEADER: u8 = 0xFE;
/// First payload byte of a LOCAL INFILE request
pub const LOCAL_INFILE_HEADER: u8 = 0xFB;

/// Server error numbers the core reacts to
pub mod err_codes {
    /// Too many failed connects; the server refuses new ones from this host
    pub const ER_HOST_IS_BLOCKED: u16 = 1129;
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    pub const ER_DBACCESS_DENIED_ERROR: u16 = 1044;
    pub const ER_ACCESS_DENIED_NO_PASSWORD_ERROR: u16 = 1698;
}

/// Check if a payload is an OK packet
pub fn is_ok_payload(payload: &[u8]) -> bool {
    payload.len() >= 7 && payload[0] == OK_HEADER
}

/// Check if a payload is an ERR packet
pub fn is_err_payload(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == ERR_HEADER
}

/// Check if a payload is an EOF packet
pub fn is_eof_payload(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == EOF_HEADER && payload.len() < 9
}

/// Check if a payload is an auth-switch request: same header byte as EOF
/// but longer than any EOF can be
pub fn is_auth_switch_payload(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == EOF_HEADER && payload.len() >= 9
}

/// Check if a payload opens a result set: the first byte is a
/// length-encoded column count in (0, 0xFA]
pub fn is_result_set_header(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] > 0 && payload[0] <= 0xFA
}

/// Read a length-encoded integer, returning the value and bytes consumed
pub fn read_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    match data.first()? {
        v @ 0..=0xFA => Some((*v as u64, 1)),
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => {
            Some((u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64, 4))
        }
        0xFE if data.len() >= 9 => Some((
            u64::from_le_bytes([
                data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
            ]),
            9,
        )),
        _ => None,
    }
}

/// Read a length-encoded string, returning the bytes and total consumed
pub fn read_lenenc_str(data: &[u8]) -> Option<(&[u8], usize)> {
    let (len, consumed) = read_lenenc_int(data)?;
    let len = len as usize;
    if data.len() < consumed + len {
        return None;
    }
    Some((&data[consumed..consumed + len], consumed + len))
}

/// Encode a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// OK packet
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: Vec<u8>,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            ..Default::default()
        }
    }

    /// Parse from packet payload; header byte 0x00 and at least 7 bytes
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if !is_ok_payload(payload) {
            return None;
        }
        let mut buf = &payload[1..];

        let (affected_rows, n) = read_lenenc_int(buf)?;
        buf = &buf[n..];
        let (last_insert_id, n) = read_lenenc_int(buf)?;
        buf = &buf[n..];

        if buf.len() < 4 {
            return None;
        }
        let status_flags = buf.get_u16_le();
        let warnings = buf.get_u16_le();

        Some(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info: buf.to_vec(),
        })
    }

    pub fn more_results(&self) -> bool {
        self.status_flags & SERVER_MORE_RESULTS_EXIST != 0
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(OK_HEADER);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(self.warnings);
        buf.extend_from_slice(&self.info);
        Packet::new(sequence_id, buf.freeze())
    }
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if !is_err_payload(payload) {
            return None;
        }
        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return None;
        }
        let error_code = buf.get_u16_le();

        let (sql_state, error_message) = if !buf.is_empty() && buf[0] == b'#' {
            buf.advance(1);
            if buf.len() >= 5 {
                let sql_state = String::from_utf8_lossy(&buf[..5]).to_string();
                buf.advance(5);
                (sql_state, String::from_utf8_lossy(buf).to_string())
            } else {
                ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
            }
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
        };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(ERR_HEADER);
        buf.put_u16_le(self.error_code);
        buf.put_u8(b'#');
        buf.extend_from_slice(self.sql_state.as_bytes());
        buf.extend_from_slice(self.error_message.as_bytes());
        Packet::new(sequence_id, buf.freeze())
    }
}

/// EOF packet: 0xFE, warnings, status flags
#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if !is_eof_payload(payload) {
            return None;
        }
        if payload.len() < 5 {
            // Pre-4.1 EOF without status; nothing useful in it
            return Some(Self {
                warnings: 0,
                status_flags: 0,
            });
        }
        Some(Self {
            warnings: u16::from_le_bytes([payload[1], payload[2]]),
            status_flags: u16::from_le_bytes([payload[3], payload[4]]),
        })
    }

    pub fn more_results(&self) -> bool {
        self.status_flags & SERVER_MORE_RESULTS_EXIST != 0
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(EOF_HEADER);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.status_flags);
        Packet::new(sequence_id, buf.freeze())
    }
}

/// The first packet of a COM_STMT_PREPARE response
#[derive(Debug, Clone, Copy)]
pub struct PreparedOk {
    pub statement_id: u32,
    pub columns: u16,
    pub parameters: u16,
    pub warnings: u16,
}

impl PreparedOk {
    /// Parse from the first payload of a prepare response: header 0x00 and
    /// exactly 12 bytes
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() != 12 || payload[0] != OK_HEADER {
            return None;
        }
        let mut buf = &payload[1..];
        let statement_id = buf.get_u32_le();
        let columns = buf.get_u16_le();
        let parameters = buf.get_u16_le();
        buf.advance(1); // filler
        let warnings = buf.get_u16_le();
        Some(Self {
            statement_id,
            columns,
            parameters,
            warnings,
        })
    }

    /// Total frames in a complete prepare response: the OK itself, then the
    /// parameter definitions plus their EOF, then the column definitions
    /// plus their EOF
    pub fn expected_frames(&self) -> usize {
        let mut expected = 1;
        if self.columns > 0 {
            expected += self.columns as usize + 1;
        }
        if self.parameters > 0 {
            expected += self.parameters as usize + 1;
        }
        expected
    }
}

/// Count the EOF signal packets in a buffer of complete frames and report
/// whether the last one announced another result set.
///
/// A collected text result is complete once the signal count is even and
/// the trailing signal does not carry SERVER_MORE_RESULTS_EXIST.
pub fn count_signal_packets(buffer: &Buffer) -> (usize, bool) {
    let mut count = 0;
    let mut more = false;
    for (_, payload) in buffer.frames() {
        if is_eof_payload(payload) {
            count += 1;
            more = EofPacket::parse(payload).map(|e| e.more_results()).unwrap_or(false);
        }
    }
    (count, more)
}

/// Whether a collected buffer holds a complete text result
pub fn text_result_complete(buffer: &Buffer) -> bool {
    let (count, more) = count_signal_packets(buffer);
    count % 2 == 0 && !more
}

/// Whether a collected buffer holds a complete prepare response
pub fn prepared_response_complete(buffer: &Buffer) -> bool {
    let first = match buffer.frames().next() {
        Some((_, payload)) => payload,
        None => return false,
    };
    match PreparedOk::parse(first) {
        Some(ok) => buffer.frame_count() == ok.expected_frames(),
        None => false,
    }
}

/// One recorded change from an OK packet's session-state block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTrackDelta {
    SystemVariable { name: String, value: String },
    Schema(String),
    Gtid(String),
    Other(u8),
}

/// Decode the session-state-information block that follows the status
/// flags in an OK payload, if the server flagged one.
///
/// Layout after warnings: lenenc info string, then (when
/// SERVER_SESSION_STATE_CHANGED is set) a lenenc block of entries, each a
/// type byte followed by lenenc-wrapped data.
pub fn parse_session_track(ok: &OkPacket) -> Vec<SessionTrackDelta> {
    let mut deltas = Vec::new();
    if ok.status_flags & SERVER_SESSION_STATE_CHANGED == 0 {
        return deltas;
    }

    let buf = &ok.info[..];
    // Skip the human-readable info string
    let (_, n) = match read_lenenc_str(buf) {
        Some(v) => v,
        None => return deltas,
    };
    let (mut state, _) = match read_lenenc_str(&buf[n..]) {
        Some(v) => v,
        None => return deltas,
    };

    while !state.is_empty() {
        let kind = state[0];
        let (data, n) = match read_lenenc_str(&state[1..]) {
            Some(v) => v,
            None => break,
        };
        state = &state[1 + n..];

        match kind {
            0x00 => {
                // SESSION_TRACK_SYSTEM_VARIABLES: lenenc name, lenenc value
                if let Some((name, n)) = read_lenenc_str(data) {
                    if let Some((value, _)) = read_lenenc_str(&data[n..]) {
                        deltas.push(SessionTrackDelta::SystemVariable {
                            name: String::from_utf8_lossy(name).to_string(),
                            value: String::from_utf8_lossy(value).to_string(),
                        });
                    }
                }
            }
            0x01 => {
                // SESSION_TRACK_SCHEMA: lenenc schema name
                if let Some((name, _)) = read_lenenc_str(data) {
                    deltas.push(SessionTrackDelta::Schema(
                        String::from_utf8_lossy(name).to_string(),
                    ));
                }
            }
            0x03 => {
                // SESSION_TRACK_GTIDS: encoding byte then lenenc gtid text
                if data.len() > 1 {
                    if let Some((gtid, _)) = read_lenenc_str(&data[1..]) {
                        deltas.push(SessionTrackDelta::Gtid(
                            String::from_utf8_lossy(gtid).to_string(),
                        ));
                    }
                }
            }
            other => deltas.push(SessionTrackDelta::Other(other)),
        }
    }

    deltas
}

/// Synthesize the client-facing ERR for a dead backend, sequence 1, with
/// the OS-level cause appended when one is known.
pub fn lost_connection_error(cause: &str, os_error: Option<&std::io::Error>) -> Buffer {
    let message = match os_error.and_then(|e| e.raw_os_error().map(|code| (code, e))) {
        Some((code, e)) => format!(
            "Lost connection to backend server: {} ({}, {})",
            cause, code, e
        ),
        None => format!("Lost connection to backend server: {}", cause),
    };
    let err = ErrPacket::new(2003, "HY000", &message);
    Buffer::from_packet(&err.encode(1))
}

/// Tracks where a streamed response stands, one frame at a time.
///
/// Streaming routers receive frames as they arrive; the session still has
/// to know when the current exchange is over so it can accept the next
/// client command. Feed every reply payload through `observe`; it returns
/// true on the frame that terminates the response.
#[derive(Debug)]
pub struct ResponseTracker {
    command: Command,
    state: ResponseState,
}

#[derive(Debug, PartialEq)]
enum ResponseState {
    FirstFrame,
    ResultSet { signals: usize },
    Prepared { remaining: usize },
}

impl ResponseTracker {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            state: ResponseState::FirstFrame,
        }
    }

    pub fn observe(&mut self, payload: &[u8]) -> bool {
        match self.state {
            ResponseState::FirstFrame => {
                if is_err_payload(payload) {
                    return true;
                }
                if self.command == Command::StmtPrepare {
                    if let Some(ok) = PreparedOk::parse(payload) {
                        let remaining = ok.expected_frames() - 1;
                        if remaining == 0 {
                            return true;
                        }
                        self.state = ResponseState::Prepared { remaining };
                        return false;
                    }
                    return true;
                }
                if is_ok_payload(payload) {
                    let more = OkPacket::parse(payload)
                        .map(|ok| ok.more_results())
                        .unwrap_or(false);
                    return !more;
                }
                if payload.first() == Some(&LOCAL_INFILE_HEADER) {
                    // The file-transfer sub-protocol is not relayed; the
                    // request itself ends this exchange.
                    return true;
                }
                self.state = ResponseState::ResultSet { signals: 0 };
                false
            }
            ResponseState::ResultSet { signals } => {
                if is_err_payload(payload) {
                    return true;
                }
                if is_eof_payload(payload) {
                    let signals = signals + 1;
                    if signals % 2 == 0 {
                        let more = EofPacket::parse(payload)
                            .map(|e| e.more_results())
                            .unwrap_or(false);
                        if more {
                            self.state = ResponseState::FirstFrame;
                            return false;
                        }
                        return true;
                    }
                    self.state = ResponseState::ResultSet { signals };
                }
                false
            }
            ResponseState::Prepared { remaining } => {
                let remaining = remaining - 1;
                if remaining == 0 {
                    return true;
                }
                self.state = ResponseState::Prepared { remaining };
                false
            }
        }
    }
}
