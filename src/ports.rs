//! Port block allocation and `${ports.*}` substitution.
//!
//! Each tree claims a base port; named services derive their ports as
//! `base + offset` from the configured mapping (e.g. `web = "+0"`,
//! `api = "+1"`). Bases are spaced `max_offset + 1` apart so expanded
//! blocks never overlap.
//!
//! Allocation only happens inside the state store's locked create path, so
//! the scan here and the reservation of the returned base are atomic with
//! respect to other processes.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::state::TreeRecord;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port block in range [{start}, {end}] — clean up or shelve a tree first")]
    Exhausted { start: u16, end: u16 },
}

fn parse_offset(raw: &str) -> u16 {
    raw.trim_start_matches('+').parse().unwrap_or(0)
}

fn max_offset(mapping: &BTreeMap<String, String>) -> u16 {
    mapping.values().map(|v| parse_offset(v)).max().unwrap_or(0)
}

/// Find the lowest unclaimed base in `range` for the given repo's trees.
pub fn allocate(
    trees: &[&TreeRecord],
    range: (u16, u16),
    mapping: &BTreeMap<String, String>,
) -> Result<u16, PortError> {
    let (start, end) = range;
    let step = u32::from(max_offset(mapping)) + 1;
    let used: HashSet<u16> = trees.iter().filter_map(|t| t.port_base).collect();

    let mut base = u32::from(start);
    while base + step - 1 <= u32::from(end) {
        #[allow(clippy::cast_possible_truncation)]
        let candidate = base as u16;
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
        base += step;
    }
    Err(PortError::Exhausted { start, end })
}

/// Expand the offset mapping into concrete ports for a base.
pub fn resolve(base: u16, mapping: &BTreeMap<String, String>) -> BTreeMap<String, u16> {
    mapping
        .iter()
        .map(|(name, offset)| (name.clone(), base + parse_offset(offset)))
        .collect()
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)] // pattern is a literal
    RE.get_or_init(|| Regex::new(r"\$\{ports\.(\w+)\}").unwrap())
}

/// Replace `${ports.<name>}` tokens in a raw value (env templates, URLs).
/// Unknown service names resolve with offset 0.
pub fn substitute(value: &str, mapping: &BTreeMap<String, String>, base: u16) -> String {
    token_regex()
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let offset = mapping.get(&caps[1]).map_or(0, |o| parse_offset(o));
            (base + offset).to_string()
        })
        .into_owned()
}

/// Probe whether something is listening on localhost:`port`.
pub async fn is_port_open(port: u16) -> bool {
    tokio::time::timeout(
        Duration::from_secs(1),
        TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    .is_ok_and(|r| r.is_ok())
}

/// Poll until the port opens or the deadline passes. Returns whether the
/// port came up — never an error, so callers can offer a manual override.
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if is_port_open(port).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn mapping(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn tree_at(base: u16) -> TreeRecord {
        TreeRecord {
            branch: format!("tree-{base}"),
            repo_path: PathBuf::from("/repo"),
            path: None,
            ticket_id: None,
            title: None,
            created_at: Utc::now(),
            pr_url: None,
            merge_notified: false,
            port_base: Some(base),
        }
    }

    #[test]
    fn allocate_steps_past_claimed_bases() {
        let mapping = mapping(&[("web", "+0"), ("api", "+1")]);
        let existing = tree_at(3000);
        let trees = vec![&existing];
        assert_eq!(allocate(&trees, (3000, 4000), &mapping).unwrap(), 3002);
    }

    #[test]
    fn allocate_empty_mapping_uses_step_one() {
        let mapping = BTreeMap::new();
        let a = tree_at(3000);
        let b = tree_at(3001);
        let trees = vec![&a, &b];
        assert_eq!(allocate(&trees, (3000, 4000), &mapping).unwrap(), 3002);
    }

    #[test]
    fn allocate_exhausted_range_errors() {
        let mapping = mapping(&[("web", "+0"), ("api", "+1"), ("db", "+2")]);
        let a = tree_at(3000);
        let b = tree_at(3003);
        let trees = vec![&a, &b];
        // Next candidate would be 3006..3008, past the end of the range.
        let err = allocate(&trees, (3000, 3007), &mapping).unwrap_err();
        assert!(matches!(err, PortError::Exhausted { start: 3000, end: 3007 }));
    }

    #[test]
    fn allocated_blocks_never_overlap() {
        let mapping = mapping(&[("web", "+0"), ("api", "+3")]);
        let mut trees: Vec<TreeRecord> = Vec::new();
        let mut claimed: HashSet<u16> = HashSet::new();
        for _ in 0..10 {
            let refs: Vec<&TreeRecord> = trees.iter().collect();
            let base = allocate(&refs, (4000, 4100), &mapping).unwrap();
            for port in resolve(base, &mapping).values() {
                assert!(claimed.insert(*port), "port {port} allocated twice");
            }
            trees.push(tree_at(base));
        }
    }

    #[test]
    fn resolve_expands_offsets() {
        let mapping = mapping(&[("api", "+1"), ("web", "+0")]);
        let ports = resolve(3100, &mapping);
        assert_eq!(ports.get("web"), Some(&3100));
        assert_eq!(ports.get("api"), Some(&3101));
    }

    #[test]
    fn substitute_replaces_tokens() {
        let mapping = mapping(&[("web", "+0"), ("api", "+1")]);
        assert_eq!(
            substitute("http://localhost:${ports.web}/x?api=${ports.api}", &mapping, 3000),
            "http://localhost:3000/x?api=3001"
        );
    }

    #[test]
    fn substitute_unknown_name_uses_base() {
        let mapping = mapping(&[("web", "+0")]);
        assert_eq!(substitute("PORT=${ports.mystery}", &mapping, 3000), "PORT=3000");
    }

    #[test]
    fn substitute_leaves_plain_text() {
        let mapping = BTreeMap::new();
        assert_eq!(substitute("DATABASE_URL=pg://x", &mapping, 3000), "DATABASE_URL=pg://x");
    }

    #[tokio::test]
    async fn port_probe_detects_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_open(port).await);
        drop(listener);
    }

    #[tokio::test]
    async fn wait_for_port_times_out_when_closed() {
        // An unbound port on localhost fails fast; the wait hits its deadline.
        assert!(!wait_for_port(1, Duration::from_millis(100)).await);
    }
}
