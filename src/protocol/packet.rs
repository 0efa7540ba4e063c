use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1)
///
/// A frame carrying exactly this many payload bytes means the logical
/// command continues in the next frame.
pub const MAX_PAYLOAD_SIZE: usize = 0xFF_FF_FF;

/// MySQL wire protocol packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Encode packet to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        // 3 bytes for length (little endian)
        dst.put_u8((len & 0xFF) as u8);
        dst.put_u8(((len >> 8) & 0xFF) as u8);
        dst.put_u8(((len >> 16) & 0xFF) as u8);
        // 1 byte for sequence id
        dst.put_u8(self.sequence_id);
        // Payload
        dst.extend_from_slice(&self.payload);
    }

    /// Try to decode packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        // Read length (3 bytes, little endian)
        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);

        let total_len = PACKET_HEADER_SIZE + len;
        if src.len() < total_len {
            return None;
        }

        // Read sequence id
        let sequence_id = src[3];

        // Advance past header
        src.advance(PACKET_HEADER_SIZE);

        // Read payload
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }

    /// Whether this frame is the maximum size, meaning a continuation follows
    pub fn is_large(&self) -> bool {
        self.payload.len() == MAX_PAYLOAD_SIZE
    }

    /// The command byte, for client-to-server command packets
    pub fn command_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Routing hints carried alongside a buffer through the core.
///
/// Routers set the outbound bits; the core sets RESULT on buffers it hands
/// upward after collecting a complete response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags(u8);

impl BufferFlags {
    /// The response must be accumulated into one contiguous buffer
    pub const COLLECT_RESULT: BufferFlags = BufferFlags(0x01);
    /// The OK payload's session-state block should be decoded
    pub const TRACK_STATE: BufferFlags = BufferFlags(0x02);
    /// The response must not reach the client
    pub const IGNORABLE: BufferFlags = BufferFlags(0x04);
    /// Set by the core: this buffer is a collected, complete result
    pub const RESULT: BufferFlags = BufferFlags(0x08);

    pub fn empty() -> Self {
        BufferFlags(0)
    }

    pub fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: BufferFlags) -> Self {
        BufferFlags(self.0 | other.0)
    }

    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }
}

/// One or more complete MySQL frames (headers included) plus routing flags.
///
/// This is the unit the router and the backend write path exchange. A
/// buffer always starts at a frame boundary and ends at one.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    pub data: BytesMut,
    pub flags: BufferFlags,
}

impl Buffer {
    pub fn new(data: BytesMut) -> Self {
        Self {
            data,
            flags: BufferFlags::empty(),
        }
    }

    pub fn from_packet(packet: &Packet) -> Self {
        let mut data = BytesMut::with_capacity(PACKET_HEADER_SIZE + packet.payload.len());
        packet.encode(&mut data);
        Self::new(data)
    }

    #[must_use]
    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags.insert(flags);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Payload length declared by the first frame header
    pub fn first_payload_len(&self) -> Option<usize> {
        if self.data.len() < PACKET_HEADER_SIZE {
            return None;
        }
        Some(
            self.data[0] as usize
                | ((self.data[1] as usize) << 8)
                | ((self.data[2] as usize) << 16),
        )
    }

    /// Command byte of the first frame
    pub fn command_byte(&self) -> Option<u8> {
        if self.data.len() <= PACKET_HEADER_SIZE {
            return None;
        }
        Some(self.data[PACKET_HEADER_SIZE])
    }

    /// Sequence byte of the first frame
    pub fn sequence_id(&self) -> Option<u8> {
        self.data.get(3).copied()
    }

    /// Overwrite the sequence byte of the first frame
    pub fn set_sequence_id(&mut self, seq: u8) {
        if self.data.len() >= PACKET_HEADER_SIZE {
            self.data[3] = seq;
        }
    }

    /// Append another buffer's frames after this one's
    pub fn append(&mut self, other: Buffer) {
        self.data.extend_from_slice(&other.data);
    }

    /// Iterate over the complete frames in this buffer as (sequence, payload)
    pub fn frames(&self) -> FrameIter<'_> {
        FrameIter {
            data: &self.data,
            offset: 0,
        }
    }

    /// Number of complete frames in this buffer
    pub fn frame_count(&self) -> usize {
        self.frames().count()
    }

    pub fn is_com_quit(&self) -> bool {
        self.command_byte() == Some(Command::Quit as u8)
    }

    pub fn is_com_change_user(&self) -> bool {
        self.command_byte() == Some(Command::ChangeUser as u8)
    }
}

/// Borrowing iterator over (sequence, payload) frame views
pub struct FrameIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.data[self.offset..];
        if rest.len() < PACKET_HEADER_SIZE {
            return None;
        }
        let len = rest[0] as usize | ((rest[1] as usize) << 8) | ((rest[2] as usize) << 16);
        if rest.len() < PACKET_HEADER_SIZE + len {
            return None;
        }
        let seq = rest[3];
        let payload = &rest[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + len];
        self.offset += PACKET_HEADER_SIZE + len;
        Some((seq, payload))
    }
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 13;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_RESERVED: u32 = 1 << 15;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Default capabilities for the proxy
    ///
    /// Note: CLIENT_DEPRECATE_EOF is intentionally NOT included because some
    /// MySQL backends advertise support but don't actually implement it
    /// properly, still sending EOF packets despite negotiating deprecation.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_SESSION_TRACK
        | CLIENT_PLUGIN_AUTH;
}

/// Server status flags carried in OK and EOF packets
#[allow(dead_code)]
pub mod status_flags {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXIST: u16 = 0x0008;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// MySQL command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
    Unknown = 0xff,
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1d => Command::Daemon,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            _ => Command::Unknown,
        }
    }
}

impl Command {
    /// Commands whose response is a text result set
    pub fn expects_text_result(self) -> bool {
        matches!(
            self,
            Command::Query | Command::StmtExecute | Command::StmtFetch
        )
    }

    /// Commands the server never answers
    pub fn expects_response(self) -> bool {
        !matches!(
            self,
            Command::Quit | Command::StmtClose | Command::StmtSendLongData
        )
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    /// Build a single raw frame: header + payload
    pub fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let len = payload.len();
        out.push((len & 0xFF) as u8);
        out.push(((len >> 8) & 0xFF) as u8);
        out.push(((len >> 16) & 0xFF) as u8);
        out.push(seq);
        out.extend_from_slice(payload);
        out
    }

    /// Build an EOF frame payload: 0xFE warnings status
    pub fn eof_payload(warnings: u16, status: u16) -> Vec<u8> {
        let mut p = vec![0xFE];
        p.extend_from_slice(&warnings.to_le_bytes());
        p.extend_from_slice(&status.to_le_bytes());
        p
    }
}
