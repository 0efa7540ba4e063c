//! Per-connection command bookkeeping.
//!
//! Every outbound write stamps the tracker with what was sent and how the
//! reply must be handled; every inbound frame consults it. The tracker
//! itself never touches the socket, which keeps the bookkeeping rules
//! testable on their own.

use crate::protocol::packet::MAX_PAYLOAD_SIZE;
use crate::protocol::response::SessionTrackDelta;
use crate::protocol::{Buffer, BufferFlags, Command};

#[derive(Debug)]
pub struct CommandTracker {
    /// Latest command byte sent on this connection
    pub current_command: Command,
    /// The previous frame was maximum-size: the next client packet
    /// continues it and must not be re-read for a command byte
    pub large_query: bool,
    /// Accumulate the response into one contiguous buffer
    pub collect_result: bool,
    /// Decode session-state blocks from OK payloads
    pub track_state: bool,
    /// Replies that must be consumed without reaching the client
    ignore_replies: u32,
    /// Client writes deferred until an in-flight re-auth completes.
    /// Non-empty implies `ignore_replies >= 1`.
    pub stored_query: Option<Buffer>,
    /// A COM_CHANGE_USER exchange is in flight
    pub changing_user: bool,
    /// A file-transfer sub-protocol is active on the session
    pub load_active: bool,
    /// Per-session tracker deltas decoded from OK payloads
    pub session_deltas: Vec<SessionTrackDelta>,
}

impl Default for CommandTracker {
    fn default() -> Self {
        Self {
            current_command: Command::Sleep,
            large_query: false,
            collect_result: false,
            track_state: false,
            ignore_replies: 0,
            stored_query: None,
            changing_user: false,
            load_active: false,
            session_deltas: Vec::new(),
        }
    }
}

impl CommandTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound client write.
    ///
    /// Order matters: the continuation check reads the large-query flag
    /// left behind by the previous write before this write overwrites it.
    pub fn prepare_for_write(&mut self, buffer: &Buffer) {
        let continuation = self.large_query && !self.load_active;
        if !continuation {
            if let Some(cmd) = buffer.command_byte() {
                self.current_command = Command::from(cmd);
            }
        }

        self.large_query = buffer.first_payload_len() == Some(MAX_PAYLOAD_SIZE);
        self.collect_result = buffer.flags.contains(BufferFlags::COLLECT_RESULT);
        self.track_state = buffer.flags.contains(BufferFlags::TRACK_STATE);

        if buffer.flags.contains(BufferFlags::IGNORABLE) {
            self.ignore_replies += 1;
        }
    }

    pub fn ignore_replies(&self) -> u32 {
        self.ignore_replies
    }

    pub fn ignoring(&self) -> bool {
        self.ignore_replies > 0
    }

    /// One more reply must be suppressed
    pub fn expect_ignored_reply(&mut self) {
        self.ignore_replies += 1;
    }

    /// An ignored reply arrived. Returns the stored query when this was
    /// the last outstanding one and a query is waiting to go out.
    pub fn ignored_reply_done(&mut self) -> Option<Buffer> {
        self.ignore_replies = self.ignore_replies.saturating_sub(1);
        if self.ignore_replies == 0 {
            self.stored_query.take()
        } else {
            None
        }
    }

    /// Defer a client write behind the in-flight re-auth
    pub fn store_query(&mut self, buffer: Buffer) {
        match &mut self.stored_query {
            Some(stored) => stored.append(buffer),
            None => self.stored_query = Some(buffer),
        }
    }

    /// Whether the response currently expected is a text result set
    pub fn expecting_text_result(&self) -> bool {
        self.current_command.expects_text_result()
    }

    pub fn expecting_prepare_response(&self) -> bool {
        self.current_command == Command::StmtPrepare
    }

    /// Reset per-checkout state when a connection leaves the pool
    pub fn reset_for_checkout(&mut self) {
        self.ignore_replies = 0;
        self.stored_query = None;
        self.changing_user = false;
        self.collect_result = false;
        self.large_query = false;
        self.session_deltas.clear();
    }

    /// Park-time invariant: nothing pending, nothing suppressed
    pub fn is_clean(&self) -> bool {
        self.ignore_replies == 0 && self.stored_query.is_none() && !self.changing_user
    }

    pub fn record_deltas(&mut self, deltas: Vec<SessionTrackDelta>) {
        self.session_deltas.extend(deltas);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::test_util::frame;
    use bytes::BytesMut;

    fn buffer(payload: &[u8]) -> Buffer {
        Buffer::new(BytesMut::from(&frame(0, payload)[..]))
    }

    /// A buffer whose header claims the maximum payload size. Only the
    /// header matters to the tracker, so the body can stay short.
    fn large_buffer(first_byte: u8) -> Buffer {
        let mut data = BytesMut::from(&frame(0, &[first_byte, 0xAA, 0xBB])[..]);
        data[0] = 0xFF;
        data[1] = 0xFF;
        data[2] = 0xFF;
        Buffer::new(data)
    }

    #[test]
    fn test_command_byte_recorded() {
        let mut tracker = CommandTracker::new();
        tracker.prepare_for_write(&buffer(&[Command::Query as u8, b'S']));
        assert_eq!(tracker.current_command, Command::Query);
        assert!(!tracker.large_query);

        tracker.prepare_for_write(&buffer(&[Command::Ping as u8]));
        assert_eq!(tracker.current_command, Command::Ping);
    }

    #[test]
    fn test_large_query_continuation_keeps_command() {
        // Property: after a maximum-size frame, the next frame is a
        // continuation and must not change the tracked command.
        let mut tracker = CommandTracker::new();
        tracker.prepare_for_write(&large_buffer(Command::Query as u8));
        assert_eq!(tracker.current_command, Command::Query);
        assert!(tracker.large_query);

        // The continuation starts with arbitrary payload bytes; 0x01 would
        // misread as COM_QUIT if the command byte were re-extracted.
        tracker.prepare_for_write(&buffer(&[0x01, 0x02, 0x03]));
        assert_eq!(tracker.current_command, Command::Query);
        assert!(!tracker.large_query);

        // The command after the continuation is read normally again
        tracker.prepare_for_write(&buffer(&[Command::Ping as u8]));
        assert_eq!(tracker.current_command, Command::Ping);
    }

    #[test]
    fn test_chained_large_frames() {
        let mut tracker = CommandTracker::new();
        tracker.prepare_for_write(&large_buffer(Command::StmtExecute as u8));
        tracker.prepare_for_write(&large_buffer(0x55));
        assert_eq!(tracker.current_command, Command::StmtExecute);
        assert!(tracker.large_query);
        tracker.prepare_for_write(&buffer(&[0x77]));
        assert_eq!(tracker.current_command, Command::StmtExecute);
        assert!(!tracker.large_query);
    }

    #[test]
    fn test_flags_mirrored() {
        let mut tracker = CommandTracker::new();
        let buf = buffer(&[Command::Query as u8]).with_flags(
            BufferFlags::COLLECT_RESULT.with(BufferFlags::TRACK_STATE),
        );
        tracker.prepare_for_write(&buf);
        assert!(tracker.collect_result);
        assert!(tracker.track_state);

        // The next plain write clears both
        tracker.prepare_for_write(&buffer(&[Command::Query as u8]));
        assert!(!tracker.collect_result);
        assert!(!tracker.track_state);
    }

    #[test]
    fn test_ignorable_bumps_counter() {
        let mut tracker = CommandTracker::new();
        let buf = buffer(&[Command::Query as u8]).with_flags(BufferFlags::IGNORABLE);
        tracker.prepare_for_write(&buf);
        assert_eq!(tracker.ignore_replies(), 1);
        tracker.prepare_for_write(&buf);
        assert_eq!(tracker.ignore_replies(), 2);
    }

    #[test]
    fn test_ignore_counter_never_negative() {
        // Property: no legal sequence of operations drives the counter
        // below zero.
        let mut tracker = CommandTracker::new();
        assert!(tracker.ignored_reply_done().is_none());
        assert_eq!(tracker.ignore_replies(), 0);

        tracker.expect_ignored_reply();
        tracker.expect_ignored_reply();
        assert!(tracker.ignored_reply_done().is_none());
        assert!(tracker.ignored_reply_done().is_none());
        assert!(tracker.ignored_reply_done().is_none());
        assert_eq!(tracker.ignore_replies(), 0);
    }

    #[test]
    fn test_stored_query_released_at_zero() {
        let mut tracker = CommandTracker::new();
        tracker.expect_ignored_reply();
        tracker.expect_ignored_reply();
        tracker.store_query(buffer(&[Command::Query as u8, b'2']));

        // First OK: still one suppressed reply outstanding
        assert!(tracker.ignored_reply_done().is_none());
        // Second OK: the stored query comes out
        let released = tracker.ignored_reply_done().unwrap();
        assert_eq!(released.command_byte(), Some(Command::Query as u8));
        assert!(tracker.stored_query.is_none());
    }

    #[test]
    fn test_store_query_appends() {
        let mut tracker = CommandTracker::new();
        tracker.expect_ignored_reply();
        tracker.store_query(buffer(&[Command::Query as u8, b'a']));
        tracker.store_query(buffer(&[Command::Query as u8, b'b']));

        let released = tracker.ignored_reply_done().unwrap();
        assert_eq!(released.frame_count(), 2);
    }

    #[test]
    fn test_clean_for_parking() {
        let mut tracker = CommandTracker::new();
        assert!(tracker.is_clean());

        tracker.expect_ignored_reply();
        assert!(!tracker.is_clean());
        tracker.ignored_reply_done();
        assert!(tracker.is_clean());

        tracker.changing_user = true;
        assert!(!tracker.is_clean());
        tracker.reset_for_checkout();
        assert!(tracker.is_clean());
    }
}
