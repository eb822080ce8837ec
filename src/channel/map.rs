//! Stream ↔ connection bimap
//!
//! The relation is symmetric and many-to-many: a connection carries any
//! number of streams, a stream fans out to any number of connections.
//! Implemented as two parallel multi-maps kept consistent by the single
//! mutator, [`ChannelMap::insert`]. Direction constraints (one input per
//! stream) are enforced by the channel, not here.

use std::collections::{BTreeSet, HashMap};

/// Bidirectional multi-map between connection names and stream identifiers
#[derive(Debug, Default)]
pub struct ChannelMap {
    by_connection: HashMap<String, BTreeSet<u16>>,
    by_stream: HashMap<u16, BTreeSet<String>>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `connection_name` carries `stream_id`
    pub fn insert(&mut self, connection_name: &str, stream_id: u16) {
        self.by_connection
            .entry(connection_name.to_string())
            .or_default()
            .insert(stream_id);
        self.by_stream
            .entry(stream_id)
            .or_default()
            .insert(connection_name.to_string());
    }

    /// Stream identifiers carried by a connection, in ascending order
    pub fn streams_of(&self, connection_name: &str) -> impl Iterator<Item = u16> + '_ {
        self.by_connection
            .get(connection_name)
            .into_iter()
            .flatten()
            .copied()
    }

    /// Names of the connections a stream is mapped to, in ascending order
    pub fn connections_of(&self, stream_id: u16) -> impl Iterator<Item = &str> + '_ {
        self.by_stream
            .get(&stream_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Whether a connection has at least one stream mapped to it
    pub fn has_streams(&self, connection_name: &str) -> bool {
        self.by_connection
            .get(connection_name)
            .is_some_and(|streams| !streams.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_many_to_many() {
        let mut map = ChannelMap::new();
        map.insert("in0", 100);
        map.insert("out0", 100);
        map.insert("out1", 100);
        map.insert("out0", 200);

        assert_eq!(map.streams_of("out0").collect::<Vec<_>>(), vec![100, 200]);
        assert_eq!(
            map.connections_of(100).collect::<Vec<_>>(),
            vec!["in0", "out0", "out1"]
        );
        assert_eq!(map.connections_of(200).collect::<Vec<_>>(), vec!["out0"]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut map = ChannelMap::new();
        map.insert("in0", 100);
        map.insert("in0", 100);

        assert_eq!(map.streams_of("in0").count(), 1);
        assert_eq!(map.connections_of(100).count(), 1);
    }

    #[test]
    fn test_unmapped_lookups_are_empty() {
        let map = ChannelMap::new();

        assert_eq!(map.streams_of("nope").count(), 0);
        assert_eq!(map.connections_of(9).count(), 0);
        assert!(!map.has_streams("nope"));
    }
}
