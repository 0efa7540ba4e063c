pub mod codec;
pub mod command;
pub mod handshake;
pub mod packet;
pub mod response;

pub use codec::PacketCodec;
pub use command::ClientCommand;
pub use handshake::{
    build_change_user, compute_auth_response, compute_auth_response_from_stage1, sha1_digest,
    AuthSwitchRequest, ChangeUserRequest, HandshakeResponse, InitialHandshake, DEFAULT_AUTH_PLUGIN,
    SCRAMBLE_LEN,
};
pub use packet::{capabilities, status_flags, Buffer, BufferFlags, Command, Packet};
pub use response::{
    count_signal_packets, is_auth_switch_payload, is_eof_payload, is_err_payload, is_ok_payload,
    is_result_set_header, lost_connection_error, EofPacket, ErrPacket, OkPacket, PreparedOk,
    ResponseTracker,
};
