//! Role and replication-lag detection for MySQL servers
//!
//! A server is a slave if `@@read_only` is set or `SHOW SLAVE STATUS`
//! returns a row. The lag comes from that row's `Seconds_Behind_Master`.

use tracing::debug;

use crate::backend::{BackendLink, ConnectionError};
use crate::config::ServerRole;
use crate::protocol::response::{is_eof_packet, is_err_packet, is_ok_packet};
use crate::protocol::resultset::{parse_text_row, ColumnDefinition};
use crate::protocol::wire::read_lenenc_int;
use crate::protocol::{Command, ErrPacket, Packet};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Parse error: {0}")]
    Parse(String),
}

/// What one probe learned about a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub role: ServerRole,
    pub replication_lag: Option<u64>,
}

/// Small text-protocol result, only used for monitor queries
#[derive(Debug, Default)]
struct QueryResult {
    columns: Vec<ColumnDefinition>,
    rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    fn value(&self, row: usize, column: &str) -> Option<&str> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))?;
        self.rows.get(row)?.get(index)?.as_deref()
    }
}

pub struct ServerProbe;

impl ServerProbe {
    /// Verify the link and detect role and lag in two round trips
    pub async fn probe(link: &mut BackendLink) -> Result<ProbeResult, ProbeError> {
        let ping = Self::query(link, "SELECT 1, @@read_only").await?;
        let read_only = match ping.rows.first().and_then(|r| r.get(1)).and_then(|v| v.as_deref()) {
            Some("0") => false,
            Some("1") => true,
            other => {
                debug!(value = ?other, "Unexpected read_only value, assuming slave");
                true
            }
        };

        let slave_status = match Self::query(link, "SHOW SLAVE STATUS").await {
            Ok(result) => result,
            // No REPLICATION CLIENT privilege: nothing to learn about lag
            Err(ProbeError::Query(e)) => {
                debug!(error = %e, "SHOW SLAVE STATUS failed, assuming no replication");
                QueryResult::default()
            }
            Err(e) => return Err(e),
        };

        let replicating = !slave_status.rows.is_empty();
        let replication_lag = slave_status
            .value(0, "Seconds_Behind_Master")
            .and_then(|v| v.parse::<u64>().ok());

        let role = if read_only || replicating {
            ServerRole::Slave
        } else {
            ServerRole::Master
        };
        debug!(role = role.as_str(), lag = ?replication_lag, "Probe complete");

        Ok(ProbeResult {
            role,
            replication_lag,
        })
    }

    async fn query(link: &mut BackendLink, sql: &str) -> Result<QueryResult, ProbeError> {
        let mut payload = vec![Command::Query as u8];
        payload.extend_from_slice(sql.as_bytes());
        link.send(Packet::new(0, payload)).await?;

        let first = link.recv().await?;
        if is_err_packet(&first.payload) {
            let message = ErrPacket::parse(&first.payload)
                .map(|e| e.error_message)
                .unwrap_or_default();
            return Err(ProbeError::Query(message));
        }
        if is_ok_packet(&first.payload) {
            return Ok(QueryResult::default());
        }

        let (column_count, _) = read_lenenc_int(&first.payload)
            .ok_or_else(|| ProbeError::Parse("Invalid column count".into()))?;

        let mut result = QueryResult::default();
        for _ in 0..column_count {
            let packet = link.recv().await?;
            let column = ColumnDefinition::parse(&packet.payload)
                .ok_or_else(|| ProbeError::Parse("Invalid column definition".into()))?;
            result.columns.push(column);
        }

        let eof = link.recv().await?;
        if !is_eof_packet(&eof.payload) {
            return Err(ProbeError::Parse("Expected EOF after column definitions".into()));
        }

        loop {
            let packet = link.recv().await?;
            if is_eof_packet(&packet.payload) {
                break;
            }
            if is_err_packet(&packet.payload) {
                return Err(ProbeError::Query("Error while reading rows".into()));
            }
            let row = parse_text_row(&packet.payload, result.columns.len())
                .ok_or_else(|| ProbeError::Parse("Invalid row".into()))?;
            result.rows.push(
                row.into_iter()
                    .map(|v| v.map(|b| String::from_utf8_lossy(&b).into_owned()))
                    .collect(),
            );
        }

        Ok(result)
    }
}
