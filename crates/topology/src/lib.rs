//! Parsers for the Redis topology surfaces the replication system consumes:
//! `CLUSTER NODES`, `CLUSTER SHARDS`, and `INFO` sections. These are pure
//! parsers; fetching the underlying replies is the wire client's business.

mod info;
mod nodes;
mod shards;

pub use info::{parse_info, parse_keyspace, redis_version, replication_ids};
pub use nodes::{
    filter_role, is_migrating, parse_cluster_nodes, ClusterNode, Direction, SlotMigration,
};
pub use shards::{parse_cluster_shards, ClusterShard, ShardNode, Value};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed cluster node line: {0:?}")]
    BadNodeLine(String),
    #[error("malformed slot entry {0:?}")]
    BadSlot(String),
    #[error("no role among flags {0:?}")]
    BadRole(String),
    #[error("malformed {0} in cluster shards reply")]
    BadShards(&'static str),
    #[error("malformed info payload: {0}")]
    BadInfo(String),
}

/// Role of a node within its shard. `CLUSTER NODES` spells the secondary
/// role "slave", `CLUSTER SHARDS` spells it "replica"; both parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica,
}

impl Role {
    pub fn parse(text: &str) -> Option<Role> {
        match text {
            "master" => Some(Role::Master),
            "slave" | "replica" => Some(Role::Replica),
            _ => None,
        }
    }
}

/// An inclusive range of hash slots, `0-16383` at the widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub begin: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn parse(text: &str) -> Result<SlotRange, Error> {
        let bad = || Error::BadSlot(text.to_string());
        match text.split_once('-') {
            Some((begin, end)) => Ok(SlotRange {
                begin: begin.parse().map_err(|_| bad())?,
                end: end.parse().map_err(|_| bad())?,
            }),
            None => {
                let slot = text.parse().map_err(|_| bad())?;
                Ok(SlotRange {
                    begin: slot,
                    end: slot,
                })
            }
        }
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.begin == self.end {
            write!(f, "{}", self.begin)
        } else {
            write!(f, "{}-{}", self.begin, self.end)
        }
    }
}
