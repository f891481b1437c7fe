use crate::config::SackConfig;
use crate::tcp::connection::SackConnection;
use crate::util::seq_num::SeqNum;
use rustc_hash::FxHashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::debug;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owns all connections of an endpoint, and the counter their ids are allocated from
pub struct ConnectionTable {
    config: Arc<SackConfig>,
    connections: FxHashMap<ConnectionId, SackConnection>,
    next_connection_id: u64,
}

impl ConnectionTable {
    pub fn new(config: Arc<SackConfig>) -> anyhow::Result<ConnectionTable> {
        config.validate()?;

        Ok(ConnectionTable {
            config,
            connections: Default::default(),
            next_connection_id: 1,
        })
    }

    pub fn open(&mut self, irs: SeqNum, iss: SeqNum, sack_permitted: bool) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;

        debug!("opening connection {}", id);
        self.connections.insert(id, SackConnection::new(id, self.config.clone(), irs, iss, sack_permitted));
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&SackConnection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut SackConnection> {
        self.connections.get_mut(&id)
    }

    /// Returns false if there is no connection with the id
    pub fn close(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some(mut connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::connection::ReceiveOutcome;

    fn table() -> ConnectionTable {
        ConnectionTable::new(Arc::new(SackConfig::default_rfc3517())).unwrap()
    }

    #[test]
    fn test_ids_are_unique() {
        let mut table = table();
        let a = table.open(SeqNum::ZERO, SeqNum::ZERO, true);
        let b = table.open(SeqNum::ZERO, SeqNum::ZERO, true);
        assert_ne!(a, b);
        assert!(table.close(a));

        let c = table.open(SeqNum::ZERO, SeqNum::ZERO, false);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(c).map(|conn| conn.id()), Some(c));
    }

    #[test]
    fn test_close() {
        let mut table = table();
        let id = table.open(SeqNum::from_raw(100), SeqNum::ZERO, true);
        let conn = table.get_mut(id).unwrap();
        assert_eq!(conn.record_received_segment(SeqNum::from_raw(200), 10), ReceiveOutcome::Gap);

        assert!(table.close(id));
        assert!(!table.close(id));
        assert!(table.get(id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = SackConfig::default_rfc3517();
        config.mss = 0;
        assert!(ConnectionTable::new(Arc::new(config)).is_err());
    }
}
