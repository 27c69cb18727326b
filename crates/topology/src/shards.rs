//! `CLUSTER SHARDS` interpretation. The wire client hands over a generic
//! reply tree; this module shapes it into shards with slot ranges, a master
//! and its replicas, picking each node's advertised address the way
//! clients are expected to (ip, else endpoint, else hostname).

use crate::{Error, Role, SlotRange};

/// A minimal RESP reply tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    /// Simple or bulk strings; Redis replies are UTF-8 for these surfaces.
    Text(String),
    Array(Vec<Value>),
    Null,
}

impl Value {
    fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(int) => Some(*int),
            _ => None,
        }
    }

    fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterShard {
    pub slots: Vec<SlotRange>,
    pub master: Option<ShardNode>,
    pub replicas: Vec<ShardNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShardNode {
    pub id: String,
    pub ip: String,
    pub endpoint: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub tls_port: Option<u16>,
    pub role: Role,
    pub repl_offset: i64,
    pub health: String,
}

impl ShardNode {
    /// The address peers should dial: ip when known, else endpoint, else
    /// hostname, with the plaintext port.
    pub fn address(&self) -> String {
        let host = if !self.ip.is_empty() && self.ip != "?" {
            &self.ip
        } else if !self.endpoint.is_empty() && self.endpoint != "?" {
            &self.endpoint
        } else {
            &self.hostname
        };
        format!("{host}:{}", self.port.unwrap_or(0))
    }
}

pub fn parse_cluster_shards(reply: &Value) -> Result<Vec<ClusterShard>, Error> {
    let shards = reply.as_array().ok_or(Error::BadShards("reply"))?;
    shards.iter().map(parse_shard).collect()
}

fn parse_shard(value: &Value) -> Result<ClusterShard, Error> {
    let fields = value.as_array().ok_or(Error::BadShards("shard"))?;

    let mut shard = ClusterShard {
        slots: Vec::new(),
        master: None,
        replicas: Vec::new(),
    };

    for pair in fields.chunks(2) {
        let [key, value] = pair else {
            return Err(Error::BadShards("shard field pairing"));
        };
        match key.as_text().ok_or(Error::BadShards("shard key"))? {
            "slots" => {
                let bounds = value.as_array().ok_or(Error::BadShards("slots"))?;
                // Flat list of [begin, end, begin, end, ...] bounds.
                if bounds.len() % 2 != 0 {
                    return Err(Error::BadShards("slots pairing"));
                }
                for bound in bounds.chunks(2) {
                    let begin = bound[0].as_int().ok_or(Error::BadShards("slot bound"))?;
                    let end = bound[1].as_int().ok_or(Error::BadShards("slot bound"))?;
                    shard.slots.push(SlotRange {
                        begin: u16::try_from(begin).map_err(|_| Error::BadShards("slot bound"))?,
                        end: u16::try_from(end).map_err(|_| Error::BadShards("slot bound"))?,
                    });
                }
            }
            "nodes" => {
                let nodes = value.as_array().ok_or(Error::BadShards("nodes"))?;
                for node in nodes {
                    let node = parse_node(node)?;
                    match node.role {
                        Role::Master => shard.master = Some(node),
                        Role::Replica => shard.replicas.push(node),
                    }
                }
            }
            _ => (),
        }
    }
    Ok(shard)
}

fn parse_node(value: &Value) -> Result<ShardNode, Error> {
    let fields = value.as_array().ok_or(Error::BadShards("node"))?;

    let mut node = ShardNode {
        id: String::new(),
        ip: String::new(),
        endpoint: String::new(),
        hostname: String::new(),
        port: None,
        tls_port: None,
        role: Role::Master,
        repl_offset: 0,
        health: String::new(),
    };
    let mut role = None;

    for pair in fields.chunks(2) {
        let [key, value] = pair else {
            return Err(Error::BadShards("node field pairing"));
        };
        let key = key.as_text().ok_or(Error::BadShards("node key"))?;
        match key {
            "id" => node.id = text(value, "id")?,
            "ip" => node.ip = text(value, "ip")?,
            "endpoint" => node.endpoint = text(value, "endpoint")?,
            "hostname" => node.hostname = text(value, "hostname")?,
            "port" => node.port = Some(port(value)?),
            "tls-port" => node.tls_port = Some(port(value)?),
            "role" => {
                let name = text(value, "role")?;
                role = Some(Role::parse(&name).ok_or(Error::BadShards("role"))?);
            }
            "replication-offset" => {
                node.repl_offset = value.as_int().ok_or(Error::BadShards("replication-offset"))?
            }
            "health" => node.health = text(value, "health")?,
            _ => (),
        }
    }

    node.role = role.ok_or(Error::BadShards("role"))?;
    Ok(node)
}

fn text(value: &Value, field: &'static str) -> Result<String, Error> {
    value
        .as_text()
        .map(str::to_string)
        .ok_or(Error::BadShards(field))
}

fn port(value: &Value) -> Result<u16, Error> {
    let port = value.as_int().ok_or(Error::BadShards("port"))?;
    u16::try_from(port).map_err(|_| Error::BadShards("port"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> Value {
        Value::Text(value.to_string())
    }

    fn node(id: &str, ip: &str, endpoint: &str, port: i64, role: &str, offset: i64) -> Value {
        Value::Array(vec![
            text("id"),
            text(id),
            text("port"),
            Value::Int(port),
            text("ip"),
            text(ip),
            text("endpoint"),
            text(endpoint),
            text("role"),
            text(role),
            text("replication-offset"),
            Value::Int(offset),
            text("health"),
            text("online"),
        ])
    }

    fn shard() -> Value {
        Value::Array(vec![
            text("slots"),
            Value::Array(vec![
                Value::Int(0),
                Value::Int(5460),
                Value::Int(15000),
                Value::Int(15004),
            ]),
            text("nodes"),
            Value::Array(vec![
                node("m1", "10.0.0.1", "", 6379, "master", 9000),
                node("r1", "?", "replica.example", 6380, "replica", 8990),
            ]),
        ])
    }

    #[test]
    fn shapes_shards_from_a_reply_tree() {
        let shards = parse_cluster_shards(&Value::Array(vec![shard()])).unwrap();
        assert_eq!(shards.len(), 1);

        let shard = &shards[0];
        assert_eq!(
            shard.slots,
            vec![
                SlotRange {
                    begin: 0,
                    end: 5460,
                },
                SlotRange {
                    begin: 15000,
                    end: 15004,
                },
            ]
        );

        let master = shard.master.as_ref().unwrap();
        assert_eq!(master.id, "m1");
        assert_eq!(master.repl_offset, 9000);
        assert_eq!(master.address(), "10.0.0.1:6379");

        // The replica's ip is unknown; the endpoint is preferred.
        assert_eq!(shard.replicas.len(), 1);
        assert_eq!(shard.replicas[0].address(), "replica.example:6380");
    }

    #[test]
    fn rejects_malformed_trees() {
        assert!(parse_cluster_shards(&Value::Int(3)).is_err());
        assert!(parse_cluster_shards(&Value::Array(vec![Value::Null])).is_err());

        let odd_slots = Value::Array(vec![Value::Array(vec![
            text("slots"),
            Value::Array(vec![Value::Int(0)]),
        ])]);
        assert!(matches!(
            parse_cluster_shards(&odd_slots),
            Err(Error::BadShards("slots pairing"))
        ));
    }
}
