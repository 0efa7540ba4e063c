use bytes::Bytes;

use super::packet::Command;

/// Parsed command from client
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Query(String),
    InitDb(String),
    Quit,
    Ping,
    ChangeUser,
    StmtPrepare,
    StmtExecute,
    StmtFetch,
    Unknown(u8, Bytes),
}

impl ClientCommand {
    /// Parse command from packet payload
    pub fn parse(payload: &Bytes) -> Self {
        if payload.is_empty() {
            return ClientCommand::Unknown(0, Bytes::new());
        }

        let cmd = Command::from(payload[0]);
        let data = payload.slice(1..);

        match cmd {
            Command::Query => {
                let sql = String::from_utf8_lossy(&data).to_string();
                ClientCommand::Query(sql)
            }
            Command::InitDb => {
                let db = String::from_utf8_lossy(&data).to_string();
                ClientCommand::InitDb(db)
            }
            Command::Quit => ClientCommand::Quit,
            Command::Ping => ClientCommand::Ping,
            Command::ChangeUser => ClientCommand::ChangeUser,
            Command::StmtPrepare => ClientCommand::StmtPrepare,
            Command::StmtExecute => ClientCommand::StmtExecute,
            Command::StmtFetch => ClientCommand::StmtFetch,
            _ => ClientCommand::Unknown(payload[0], data),
        }
    }

    /// Check if this command can be served by a read-only backend.
    ///
    /// Classification stops at the command byte and the leading keyword;
    /// anything ambiguous goes to the writable backend.
    pub fn is_read_only(&self) -> bool {
        match self {
            ClientCommand::Query(sql) => {
                let sql_upper = sql.trim_start().to_uppercase();
                sql_upper.starts_with("SELECT")
                    || sql_upper.starts_with("SHOW")
                    || sql_upper.starts_with("DESCRIBE")
                    || sql_upper.starts_with("DESC")
                    || sql_upper.starts_with("EXPLAIN")
            }
            ClientCommand::Ping => true,
            ClientCommand::StmtFetch => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    #[test]
    fn test_parse_query() {
        let cmd = ClientCommand::parse(&payload(b"\x03SELECT 1"));
        match cmd {
            ClientCommand::Query(sql) => assert_eq!(sql, "SELECT 1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_control_commands() {
        assert!(matches!(
            ClientCommand::parse(&payload(&[0x01])),
            ClientCommand::Quit
        ));
        assert!(matches!(
            ClientCommand::parse(&payload(&[0x0e])),
            ClientCommand::Ping
        ));
        assert!(matches!(
            ClientCommand::parse(&payload(b"\x11bob\0")),
            ClientCommand::ChangeUser
        ));
        assert!(matches!(
            ClientCommand::parse(&payload(b"\x16SELECT ?")),
            ClientCommand::StmtPrepare
        ));
    }

    #[test]
    fn test_read_only_classification() {
        assert!(ClientCommand::parse(&payload(b"\x03select * from t")).is_read_only());
        assert!(ClientCommand::parse(&payload(b"\x03  SHOW TABLES")).is_read_only());
        assert!(!ClientCommand::parse(&payload(b"\x03INSERT INTO t VALUES (1)")).is_read_only());
        assert!(!ClientCommand::parse(&payload(b"\x03BEGIN")).is_read_only());
        assert!(!ClientCommand::parse(&payload(b"\x16SELECT ?")).is_read_only());
    }
}
