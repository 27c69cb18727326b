//! `INFO` section parsing: flat `key:value` lines separated by CRLF, with
//! `#`-prefixed section headers.

use std::collections::HashMap;

use crate::Error;

/// Parse a single `INFO` section (e.g. `INFO server`, `INFO replication`)
/// into its key/value pairs. Header and malformed lines are skipped.
pub fn parse_info(content: &str) -> HashMap<String, String> {
    content
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// The upstream's replication history ids from `INFO replication`:
/// `master_replid`, then `master_replid2` when one is advertised.
pub fn replication_ids(content: &str) -> (String, String) {
    let info = parse_info(content);
    let get = |key: &str| info.get(key).cloned().unwrap_or_default();
    (get("master_replid"), get("master_replid2"))
}

/// `redis_version` from `INFO server`.
pub fn redis_version(content: &str) -> Option<String> {
    parse_info(content).remove("redis_version")
}

/// Parse the `# Keyspace` section into db index -> key count, e.g.
/// `db0:keys=18,expires=0,avg_ttl=0`.
pub fn parse_keyspace(content: &str) -> Result<HashMap<i32, i64>, Error> {
    if !content.starts_with("# Keyspace") {
        return Err(Error::BadInfo(format!(
            "not a keyspace section: {content:?}"
        )));
    }
    let bad = |line: &str| Error::BadInfo(line.to_string());

    let mut keyspace = HashMap::new();
    for line in content.lines().map(str::trim) {
        let Some(rest) = line.strip_prefix("db") else {
            continue;
        };
        let (db, stats) = rest.split_once(':').ok_or_else(|| bad(line))?;
        let db: i32 = db.parse().map_err(|_| bad(line))?;

        let keys = stats
            .split(',')
            .next()
            .and_then(|field| field.strip_prefix("keys="))
            .ok_or_else(|| bad(line))?;
        let keys: i64 = keys.parse().map_err(|_| bad(line))?;
        keyspace.insert(db, keys);
    }
    Ok(keyspace)
}
