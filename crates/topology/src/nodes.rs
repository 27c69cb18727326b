//! `CLUSTER NODES` parsing. Each line:
//!
//! ```text
//! <id> <ip:port@cport> <flags> <master> <ping-sent> <pong-recv> <config-epoch> <link-state> <slot> <slot> ... [<slot>-><node>] ...
//! ```
//!
//! Trailing slot entries are ranges (`0-5460`), single slots (`2000`), or
//! in-flight migrations (`[3000->-<node>]` leaving, `[3000-<-<node>]`
//! arriving).

use crate::{Error, Role, SlotRange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: String,
    /// `ip:port` as advertised; may be `:0` for nodes with no known address.
    pub address: String,
    /// Cluster-bus port suffix (`@16379`), when present.
    pub bus_port: Option<String>,
    /// Raw flags, e.g. `["myself", "master"]`.
    pub flags: Vec<String>,
    pub role: Role,
    /// Replicated master id, or None when the line carries `-`.
    pub master_id: Option<String>,
    pub ping_sent: i64,
    pub pong_recv: i64,
    pub config_epoch: i64,
    pub link_state: String,
    pub slots: Vec<SlotRange>,
    pub migrations: Vec<SlotMigration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMigration {
    pub slot: u16,
    pub direction: Direction,
    pub node_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Migrating,
    Importing,
}

pub fn parse_cluster_nodes(content: &str) -> Result<Vec<ClusterNode>, Error> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Result<ClusterNode, Error> {
    let bad = || Error::BadNodeLine(line.to_string());
    let mut items = line.split_whitespace();

    let id = items.next().ok_or_else(bad)?.to_string();
    let addr = items.next().ok_or_else(bad)?;
    let (address, bus_port) = match addr.split_once('@') {
        Some((address, bus)) => (address.to_string(), Some(bus.to_string())),
        None => (addr.to_string(), None),
    };

    let flags: Vec<String> = items
        .next()
        .ok_or_else(bad)?
        .split(',')
        .map(str::to_string)
        .collect();
    let role = flags
        .iter()
        .find_map(|flag| Role::parse(flag))
        .ok_or_else(|| Error::BadRole(flags.join(",")))?;

    let master_id = match items.next().ok_or_else(bad)? {
        "-" => None,
        id => Some(id.to_string()),
    };

    let mut int = || -> Result<i64, Error> {
        items.next().ok_or_else(bad)?.parse().map_err(|_| bad())
    };
    let ping_sent = int()?;
    let pong_recv = int()?;
    let config_epoch = int()?;
    let link_state = items.next().ok_or_else(bad)?.to_string();

    let mut slots = Vec::new();
    let mut migrations = Vec::new();
    for item in items {
        if let Some(migration) = parse_migration(item)? {
            migrations.push(migration);
        } else {
            slots.push(SlotRange::parse(item)?);
        }
    }

    Ok(ClusterNode {
        id,
        address,
        bus_port,
        flags,
        role,
        master_id,
        ping_sent,
        pong_recv,
        config_epoch,
        link_state,
        slots,
        migrations,
    })
}

fn parse_migration(item: &str) -> Result<Option<SlotMigration>, Error> {
    let Some(inner) = item.strip_prefix('[') else {
        return Ok(None);
    };
    let inner = inner
        .strip_suffix(']')
        .ok_or_else(|| Error::BadSlot(item.to_string()))?;

    let (slot, direction, node_id) = if let Some((slot, node)) = inner.split_once("->-") {
        (slot, Direction::Migrating, node)
    } else if let Some((slot, node)) = inner.split_once("-<-") {
        (slot, Direction::Importing, node)
    } else {
        return Err(Error::BadSlot(item.to_string()));
    };

    Ok(Some(SlotMigration {
        slot: slot.parse().map_err(|_| Error::BadSlot(item.to_string()))?,
        direction,
        node_id: node_id.to_string(),
    }))
}

impl std::fmt::Display for ClusterNode {
    /// Re-serialize the node to its `CLUSTER NODES` line form.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.id, self.address)?;
        if let Some(bus) = &self.bus_port {
            write!(f, "@{bus}")?;
        }
        write!(
            f,
            " {} {} {} {} {} {}",
            self.flags.join(","),
            self.master_id.as_deref().unwrap_or("-"),
            self.ping_sent,
            self.pong_recv,
            self.config_epoch,
            self.link_state,
        )?;
        for slot in &self.slots {
            write!(f, " {slot}")?;
        }
        for migration in &self.migrations {
            let arrow = match migration.direction {
                Direction::Migrating => "->-",
                Direction::Importing => "-<-",
            };
            write!(f, " [{}{arrow}{}]", migration.slot, migration.node_id)?;
        }
        Ok(())
    }
}

/// The nodes holding `role`, in input order.
pub fn filter_role(nodes: &[ClusterNode], role: Role) -> Vec<&ClusterNode> {
    nodes.iter().filter(|node| node.role == role).collect()
}

/// Whether any node reports an in-flight slot migration.
pub fn is_migrating(nodes: &[ClusterNode]) -> bool {
    nodes.iter().any(|node| !node.migrations.is_empty())
}
