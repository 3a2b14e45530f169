use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use tracing::debug;

/// Environment variable consulted when no node name is configured.
pub const NODE_NAME_ENV: &str = "NODE_NAME";

/// Who is reporting: the node name plus every address of the local host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Every address bound to the local hostname, each followed by ", ".
    pub source_addresses: String,
    pub node_name: String,
}

impl LocalIdentity {
    /// Resolve the local hostname's addresses and pair them with `node_name`.
    pub async fn resolve(node_name: &str) -> Result<Self> {
        let hostname = gethostname::gethostname()
            .into_string()
            .map_err(|raw| anyhow::anyhow!("local host name is not valid UTF-8: {raw:?}"))?;

        let addrs = lookup_host_addrs(&hostname)
            .await
            .with_context(|| format!("looking up local IP addresses for {hostname}"))?;

        let source_addresses = join_addresses(&addrs);
        debug!(%hostname, addresses = %source_addresses, "resolved local identity");

        Ok(Self {
            source_addresses,
            node_name: node_name.to_string(),
        })
    }
}

/// Pick the node name from configuration, falling back to `NODE_NAME`.
pub fn resolve_node_name(configured: &str) -> Result<String> {
    node_name_from(configured, std::env::var(NODE_NAME_ENV).ok())
}

fn node_name_from(configured: &str, env_value: Option<String>) -> Result<String> {
    if !configured.is_empty() {
        return Ok(configured.to_string());
    }

    match env_value {
        Some(name) if !name.is_empty() => Ok(name),
        _ => bail!("node_name is not configured and {NODE_NAME_ENV} is not set"),
    }
}

async fn lookup_host_addrs(hostname: &str) -> Result<Vec<IpAddr>> {
    let mut addrs = Vec::new();
    for socket_addr in tokio::net::lookup_host((hostname, 0)).await? {
        let ip = socket_addr.ip();
        if !addrs.contains(&ip) {
            addrs.push(ip);
        }
    }

    if addrs.is_empty() {
        bail!("no addresses found");
    }

    Ok(addrs)
}

/// Render addresses as `"a, b, "`, separator included after the last one.
fn join_addresses(addrs: &[IpAddr]) -> String {
    addrs.iter().map(|ip| format!("{ip}, ")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_node_name_wins() {
        let name = node_name_from("node-a", Some("node-b".into())).expect("name");
        assert_eq!(name, "node-a");
    }

    #[test]
    fn test_node_name_falls_back_to_env() {
        let name = node_name_from("", Some("node-b".into())).expect("name");
        assert_eq!(name, "node-b");
    }

    #[test]
    fn test_node_name_missing_is_an_error() {
        let err = node_name_from("", None).expect_err("no name");
        assert!(err.to_string().contains(NODE_NAME_ENV));

        assert!(node_name_from("", Some(String::new())).is_err());
    }

    #[test]
    fn test_join_addresses() {
        let addrs: Vec<IpAddr> = vec![
            "10.0.0.1".parse().expect("ip"),
            "fe80::1".parse().expect("ip"),
        ];
        assert_eq!(join_addresses(&addrs), "10.0.0.1, fe80::1, ");
        assert_eq!(join_addresses(&addrs[..1]), "10.0.0.1, ");
    }

    #[tokio::test]
    async fn test_lookup_localhost() {
        let addrs = lookup_host_addrs("localhost").await.expect("localhost resolves");
        assert!(addrs.iter().all(|ip| ip.is_loopback()));
    }
}
