use std::fmt;

use thiserror::Error;

/// Sentinel table name for topics that buffer events for every table of a
/// destination (retry and dead-letter topics).
pub const ALL_TABLES: &str = "_all_";

const TOPIC_PREFIX: &str = "in.id.";
const MODE_SEP: &str = ".m.";
const TABLE_SEP: &str = ".t.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("invalid topic id '{0}'")]
    InvalidTopicId(String),
}

/// Role of a destination topic on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusMode {
    /// Primary per-table topic drained by the table batch consumer.
    Batch,
    /// Primary per-table topic drained by the stream consumer.
    Stream,
    /// Sibling topic buffering messages awaiting redelivery.
    Retry,
    /// Sibling topic parking messages with no attempts left.
    Dead,
}

impl BusMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusMode::Batch => "batch",
            BusMode::Stream => "stream",
            BusMode::Retry => "retry",
            BusMode::Dead => "dead",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "batch" => Some(BusMode::Batch),
            "stream" => Some(BusMode::Stream),
            "retry" => Some(BusMode::Retry),
            "dead" => Some(BusMode::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for BusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed form of a destination topic name,
/// `in.id.{destination}.m.{mode}.t.{table}`. Construction and parsing
/// roundtrip exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicId {
    pub destination_id: String,
    pub mode: BusMode,
    pub table_name: String,
}

impl TopicId {
    pub fn new(destination_id: &str, mode: BusMode, table_name: &str) -> Self {
        Self {
            destination_id: destination_id.to_string(),
            mode,
            table_name: table_name.to_string(),
        }
    }

    /// The retry topic shared by all tables of a destination.
    pub fn retry_for(destination_id: &str) -> Self {
        Self::new(destination_id, BusMode::Retry, ALL_TABLES)
    }

    /// The dead-letter topic shared by all tables of a destination.
    pub fn dead_for(destination_id: &str) -> Self {
        Self::new(destination_id, BusMode::Dead, ALL_TABLES)
    }

    /// Decodes a topic name. Destination ids may themselves contain dots, so
    /// the rightmost `.m.` / `.t.` separators win; anything that does not
    /// decompose into non-empty parts with a known mode tag is rejected.
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let invalid = || TopicError::InvalidTopicId(topic.to_string());
        let rest = topic.strip_prefix(TOPIC_PREFIX).ok_or_else(invalid)?;
        let table_at = rest.rfind(TABLE_SEP).ok_or_else(invalid)?;
        let (head, table_name) = (&rest[..table_at], &rest[table_at + TABLE_SEP.len()..]);
        let mode_at = head.rfind(MODE_SEP).ok_or_else(invalid)?;
        let (destination_id, mode_tag) = (&head[..mode_at], &head[mode_at + MODE_SEP.len()..]);
        if destination_id.is_empty() || table_name.is_empty() {
            return Err(invalid());
        }
        let mode = BusMode::from_tag(mode_tag).ok_or_else(invalid)?;
        Ok(Self::new(destination_id, mode, table_name))
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{TOPIC_PREFIX}{}{MODE_SEP}{}{TABLE_SEP}{}",
            self.destination_id, self.mode, self.table_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_parse_roundtrip() {
        for mode in [BusMode::Batch, BusMode::Stream, BusMode::Retry, BusMode::Dead] {
            let id = TopicId::new("clickhouse-prod", mode, "events");
            assert_eq!(TopicId::parse(&id.to_string()).unwrap(), id);
        }
    }

    #[test]
    fn all_tables_topics_roundtrip() {
        let retry = TopicId::retry_for("dst1");
        assert_eq!(retry.to_string(), "in.id.dst1.m.retry.t._all_");
        assert_eq!(TopicId::parse("in.id.dst1.m.retry.t._all_").unwrap(), retry);

        let dead = TopicId::dead_for("dst1");
        assert_eq!(dead.to_string(), "in.id.dst1.m.dead.t._all_");
    }

    #[test]
    fn destination_ids_may_contain_dots() {
        let id = TopicId::new("team.prod.ch", BusMode::Batch, "pages");
        let parsed = TopicId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed.destination_id, "team.prod.ch");
        assert_eq!(parsed.table_name, "pages");
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for topic in [
            "events",
            "in.id.dst1",
            "in.id.dst1.m.batch",
            "in.id.dst1.t.events",
            "in.id.dst1.m.firehose.t.events",
            "in.id..m.batch.t.events",
            "in.id.dst1.m.batch.t.",
            "out.id.dst1.m.batch.t.events",
        ] {
            assert_eq!(
                TopicId::parse(topic),
                Err(TopicError::InvalidTopicId(topic.to_string())),
                "{topic} should be rejected"
            );
        }
    }
}
