use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub channel: channel::Config,
    pub replica: ReplicaConfig,
    pub input: InputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicaConfig {
    /// Address the leader's Sync service listens on.
    pub listen: std::net::SocketAddr,
    /// Leader peer to follow. When set, this node starts as a follower of
    /// that peer; otherwise it only serves.
    #[serde(default)]
    pub leader: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    pub kind: InputKind,
    /// Advertised address of this node's upstream input, announced to sync
    /// peers.
    pub address: String,
    /// Run ids the input currently serves, most current first. Usually
    /// left empty and fed at runtime by the upstream consumer.
    #[serde(default)]
    pub run_ids: Vec<String>,
    /// Captured `INFO replication` payload used to seed run ids when
    /// `run_ids` is not given.
    #[serde(default)]
    pub info: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Standalone,
    Cluster,
    Sentinel,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;

        if config.input.kind == InputKind::Sentinel {
            anyhow::bail!("sentinel inputs are not supported");
        }
        if config.input.address.is_empty() {
            anyhow::bail!("input.address must not be empty");
        }
        Ok(config)
    }

    /// The input's run ids, most current first: the configured list, or
    /// ids extracted from a captured `INFO replication` payload.
    pub fn seed_run_ids(&self) -> anyhow::Result<Vec<String>> {
        if !self.input.run_ids.is_empty() {
            return Ok(self.input.run_ids.clone());
        }
        let Some(info_path) = &self.input.info else {
            return Ok(Vec::new());
        };
        let contents = std::fs::read_to_string(info_path)
            .with_context(|| format!("reading info seed {}", info_path.display()))?;

        let (current, previous) = topology::replication_ids(&contents);
        if current.is_empty() {
            anyhow::bail!("info seed {} has no master_replid", info_path.display());
        }
        let mut ids = vec![current];
        if !previous.is_empty() && previous.bytes().any(|b| b != b'0') {
            ids.push(previous);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_a_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "config.yaml",
            "\
channel:
  dir: /var/lib/redrelay/channel
replica:
  listen: 0.0.0.0:6600
  leader: 10.0.0.1:6600
input:
  kind: cluster
  address: 10.0.0.2:6379
  run_ids: [abc123]
",
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.replica.leader.as_deref(), Some("10.0.0.1:6600"));
        assert_eq!(config.input.kind, InputKind::Cluster);
        assert_eq!(config.seed_run_ids().unwrap(), vec!["abc123".to_string()]);
    }

    #[test]
    fn sentinel_inputs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "config.yaml",
            "\
channel:
  dir: /tmp/ch
replica:
  listen: 0.0.0.0:6600
input:
  kind: sentinel
  address: 10.0.0.2:26379
",
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("sentinel"));
    }

    #[test]
    fn run_ids_seed_from_captured_info() {
        let dir = tempfile::tempdir().unwrap();
        let info = write(
            &dir,
            "info.txt",
            "# Replication\r\nmaster_replid:aaaa\r\nmaster_replid2:0000000000000000000000000000000000000000\r\n",
        );
        let path = write(
            &dir,
            "config.yaml",
            &format!(
                "\
channel:
  dir: /tmp/ch
replica:
  listen: 0.0.0.0:6600
input:
  kind: standalone
  address: 10.0.0.2:6379
  info: {}
",
                info.display()
            ),
        );

        let config = Config::load(&path).unwrap();
        // The all-zero replid2 means no prior history; only the current id.
        assert_eq!(config.seed_run_ids().unwrap(), vec!["aaaa".to_string()]);
    }
}
