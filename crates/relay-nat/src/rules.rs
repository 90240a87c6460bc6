//! NAT rule compiler.
//!
//! Translates port mappings into nftables DNAT rules. Compilation is pure
//! and deterministic: the same mappings in the same order always yield the
//! same bytes, on every platform.

use std::fmt::Write;

use relay_core::PortMapping;

/// nftables table owning every relay rule.
pub const TABLE_NAME: &str = "horde";

/// One DNAT rule per assigned port, in mapping order then port order.
///
/// Ports without a relay port are skipped; stored mappings always have one.
pub fn generate_rules(mappings: &[PortMapping]) -> Vec<String> {
    let mut rules = Vec::new();
    for mapping in mappings {
        let source_match = if mapping.allowed_source_ips.is_empty() {
            String::new()
        } else {
            let sources: Vec<&str> = mapping
                .allowed_source_ips
                .iter()
                .map(String::as_str)
                .collect();
            format!("ip saddr {{ {} }} ", sources.join(", "))
        };

        for port in &mapping.ports {
            let Some(relay_port) = port.relay_port else {
                continue;
            };
            rules.push(format!(
                "{source_match}{proto} dport {relay_port} dnat to {agent_ip}:{agent_port} comment \"leaseId={lease_id}\"",
                proto = port.protocol.as_str(),
                agent_ip = mapping.agent_ip,
                agent_port = port.agent_port,
                lease_id = mapping.lease_id,
            ));
        }
    }
    rules
}

/// A complete ruleset that replaces the relay table atomically when loaded
/// with `nft -f`.
///
/// The leading `table` line makes the `delete` succeed on a fresh host.
pub fn generate_file(mappings: &[PortMapping]) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(out, "table ip {TABLE_NAME}");
    let _ = writeln!(out, "delete table ip {TABLE_NAME}");
    let _ = writeln!(out, "table ip {TABLE_NAME} {{");
    out.push_str("  chain prerouting {\n");
    out.push_str("    type nat hook prerouting priority -100; policy accept;\n");
    for rule in generate_rules(mappings) {
        let _ = writeln!(out, "    {rule}");
    }
    out.push_str("  }\n");
    out.push_str("  chain postrouting {\n");
    out.push_str("    type nat hook postrouting priority 100; policy accept;\n");
    out.push_str("    masquerade\n");
    out.push_str("  }\n");
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Port, Protocol};
    use std::collections::BTreeSet;

    fn port(protocol: Protocol, agent_port: u16, relay_port: u16) -> Port {
        Port {
            protocol,
            agent_port,
            relay_port: Some(relay_port),
        }
    }

    fn lease_map_1() -> PortMapping {
        PortMapping {
            lease_id: "lease1".to_string(),
            agent_ip: "192.168.1.1".to_string(),
            allowed_source_ips: BTreeSet::new(),
            ports: vec![port(Protocol::Tcp, 2000, 1000)],
        }
    }

    fn lease_map_2() -> PortMapping {
        PortMapping {
            lease_id: "lease2".to_string(),
            agent_ip: "192.168.1.2".to_string(),
            allowed_source_ips: BTreeSet::new(),
            ports: vec![
                port(Protocol::Tcp, 2001, 1001),
                port(Protocol::Udp, 2002, 1002),
            ],
        }
    }

    /// Second port is still waiting for a relay port.
    fn lease_map_3() -> PortMapping {
        PortMapping {
            lease_id: "lease3".to_string(),
            agent_ip: "192.168.1.3".to_string(),
            allowed_source_ips: BTreeSet::from([
                "10.0.0.2".to_string(),
                "10.0.0.1".to_string(),
            ]),
            ports: vec![port(Protocol::Udp, 2003, 1003), Port::new(Protocol::Tcp, 2004)],
        }
    }

    #[test]
    fn one_rule_per_assigned_port() {
        let rules = generate_rules(&[lease_map_1(), lease_map_2(), lease_map_3()]);
        assert_eq!(rules.len(), 4);
        assert_eq!(
            rules[0],
            "tcp dport 1000 dnat to 192.168.1.1:2000 comment \"leaseId=lease1\""
        );
        assert_eq!(
            rules[2],
            "udp dport 1002 dnat to 192.168.1.2:2002 comment \"leaseId=lease2\""
        );
    }

    #[test]
    fn source_restricted_rules_list_addresses() {
        let mut mapping = lease_map_3();
        mapping.ports[1].relay_port = Some(1004);
        let rules = generate_rules(&[mapping]);
        assert_eq!(
            rules,
            vec![
                "ip saddr { 10.0.0.1, 10.0.0.2 } udp dport 1003 dnat to 192.168.1.3:2003 comment \"leaseId=lease3\"",
                "ip saddr { 10.0.0.1, 10.0.0.2 } tcp dport 1004 dnat to 192.168.1.3:2004 comment \"leaseId=lease3\"",
            ]
        );
    }

    #[test]
    fn unassigned_ports_are_skipped() {
        let mut mapping = lease_map_1();
        mapping.ports.push(Port::new(Protocol::Udp, 53));
        assert_eq!(generate_rules(&[mapping]).len(), 1);
    }

    #[test]
    fn input_order_is_preserved() {
        let rules = generate_rules(&[lease_map_2(), lease_map_1()]);
        assert!(rules[0].ends_with("\"leaseId=lease2\""));
        assert!(rules[2].ends_with("\"leaseId=lease1\""));
    }

    #[test]
    fn empty_mappings_yield_no_rules() {
        assert!(generate_rules(&[]).is_empty());
    }

    #[test]
    fn file_layout_is_exact() {
        let file = generate_file(&[lease_map_1()]);
        let expected = "table ip horde\n\
delete table ip horde\n\
table ip horde {\n  \
chain prerouting {\n    \
type nat hook prerouting priority -100; policy accept;\n    \
tcp dport 1000 dnat to 192.168.1.1:2000 comment \"leaseId=lease1\"\n  \
}\n  \
chain postrouting {\n    \
type nat hook postrouting priority 100; policy accept;\n    \
masquerade\n  \
}\n\
}\n";
        assert_eq!(file, expected);
    }

    #[test]
    fn file_uses_unix_line_endings() {
        let file = generate_file(&[lease_map_1(), lease_map_2(), lease_map_3()]);
        assert!(!file.contains('\r'));
        assert!(file.ends_with("}\n"));
        assert_eq!(file.lines().filter(|l| l.contains("dnat to")).count(), 4);
    }

    #[test]
    fn empty_file_still_declares_chains() {
        let file = generate_file(&[]);
        assert!(file.contains("chain prerouting {"));
        assert!(file.contains("    masquerade\n"));
    }
}
