//! Masquerade rule for a virtual-device bridge.
//!
//! Each rule carries a `teardown_<bridge>` comment. Removal filters the
//! saved rule set by that comment and reloads it, so only this session's
//! rule goes away even if the rule text was edited by someone else.

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::types::BridgeAllocation;
use crate::utils::{run_checked, run_with_stdin};

const IPTABLES: &str = "iptables-legacy";
const IPTABLES_SAVE: &str = "iptables-legacy-save";
const IPTABLES_RESTORE: &str = "iptables-legacy-restore";

/// Comment tag identifying the rule of one bridge
pub fn rule_comment(bridge_name: &str) -> String {
    format!("teardown_{}", bridge_name)
}

/// Arguments that append the masquerade rule for traffic leaving the bridge
pub fn masquerade_args(alloc: &BridgeAllocation) -> Vec<String> {
    let comment = rule_comment(&alloc.bridge_name);
    [
        "-t",
        "nat",
        "-A",
        "POSTROUTING",
        "!",
        "-o",
        alloc.bridge_name.as_str(),
        "--source",
        alloc.cidr().as_str(),
        "-j",
        "MASQUERADE",
        "-m",
        "comment",
        "--comment",
        comment.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Drop every saved rule tagged with `comment`
pub fn filter_rules(saved: &str, comment: &str) -> String {
    let needle = format!("--comment {}", comment);
    let mut kept: String = saved
        .lines()
        .filter(|line| {
            // Match the whole tag so teardown_br1 does not hit teardown_br10
            !line
                .match_indices(&needle)
                .any(|(i, _)| line[i + needle.len()..].chars().next().map_or(true, |c| c == ' '))
        })
        .collect::<Vec<_>>()
        .join("\n");
    kept.push('\n');
    kept
}

pub async fn add_masquerade(alloc: &BridgeAllocation) -> Result<()> {
    let args = masquerade_args(alloc);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    run_checked(IPTABLES, &args)
        .await
        .context("adding MASQUERADE rule")?;

    info!(bridge = %alloc.bridge_name, source = %alloc.cidr(), "NAT rule installed");
    Ok(())
}

pub async fn remove_masquerade(bridge_name: &str) -> Result<()> {
    let saved = run_checked(IPTABLES_SAVE, &[])
        .await
        .context("saving iptables rules")?;
    let saved = String::from_utf8_lossy(&saved.stdout);

    let comment = rule_comment(bridge_name);
    let filtered = filter_rules(&saved, &comment);
    if filtered.trim_end() == saved.trim_end() {
        debug!(bridge = %bridge_name, "no tagged NAT rule left to remove");
        return Ok(());
    }

    run_with_stdin(IPTABLES_RESTORE, &[], filtered.as_bytes())
        .await
        .context("restoring filtered iptables rules")?;

    info!(bridge = %bridge_name, "NAT rule removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn alloc(name: &str) -> BridgeAllocation {
        BridgeAllocation {
            bridge_name: name.into(),
            bridge_address: Ipv4Addr::new(10, 10, 11, 1),
            dhcp_range: "10.10.11.2,10.10.11.254".into(),
        }
    }

    #[test]
    fn test_masquerade_args() {
        let args = masquerade_args(&alloc("brabc"));
        assert_eq!(
            args.join(" "),
            "-t nat -A POSTROUTING ! -o brabc --source 10.10.11.1/24 -j MASQUERADE \
             -m comment --comment teardown_brabc"
        );
    }

    #[test]
    fn test_filter_removes_only_tagged_rule() {
        let saved = "\
*nat
:POSTROUTING ACCEPT [0:0]
-A POSTROUTING -s 172.17.0.0/16 ! -o docker0 -j MASQUERADE
-A POSTROUTING -s 10.10.11.0/24 ! -o br1 -m comment --comment teardown_br1 -j MASQUERADE
-A POSTROUTING -s 10.10.12.0/24 ! -o br10 -m comment --comment teardown_br10 -j MASQUERADE
COMMIT";

        let filtered = filter_rules(saved, &rule_comment("br1"));
        assert!(!filtered.contains("teardown_br1 "));
        assert!(filtered.contains("teardown_br10"));
        assert!(filtered.contains("docker0"));
        assert!(filtered.ends_with("COMMIT\n"));
    }

    #[test]
    fn test_filter_matches_tag_at_line_end() {
        let saved = "-A POSTROUTING -j MASQUERADE -m comment --comment teardown_br1\nCOMMIT";
        let filtered = filter_rules(saved, "teardown_br1");
        assert_eq!(filtered, "COMMIT\n");
    }

    #[cfg(feature = "privileged-tests")]
    #[tokio::test]
    async fn test_masquerade_lifecycle() {
        let alloc = alloc("rigdnattest");
        add_masquerade(&alloc).await.expect("add rule (requires root)");
        remove_masquerade(&alloc.bridge_name).await.unwrap();
        // Second removal finds nothing and is fine
        remove_masquerade(&alloc.bridge_name).await.unwrap();
    }
}
