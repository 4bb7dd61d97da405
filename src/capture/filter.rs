use std::collections::HashSet;
use std::net::IpAddr;

use crate::config::Direction;

/// Builds the default capture filter expression.
///
/// `base_expr` is normally `tcp or udp or icmp`. For direction `out`/`in`
/// the local IPv4 addresses are OR'ed together as `src host`/`dst host`
/// clauses; `both` carries no endpoint clause. Only IPv4 locals are used
/// (IPv6 host clauses are not portable across libpcap versions). Every
/// variant excludes packets where both endpoints are RFC1918 private, so
/// purely internal hops never reach the collector.
pub fn build_default_filter(
    base_expr: &str,
    direction: Direction,
    local_ips: &HashSet<String>,
) -> String {
    let base_expr = {
        let trimmed = base_expr.trim();
        if trimmed.is_empty() {
            "tcp or udp or icmp"
        } else {
            trimmed
        }
    };

    if direction == Direction::Both {
        return format!("({base_expr}) and not {}", both_private_ipv4_clause());
    }

    let mut ipv4s: Vec<String> = local_ips
        .iter()
        .filter_map(|s| match s.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => Some(v4.to_string()),
            _ => None,
        })
        .collect();
    ipv4s.sort();

    if ipv4s.is_empty() {
        // No usable local IPv4s; fall back to protocol-only capture.
        return format!("({base_expr}) and not {}", both_private_ipv4_clause());
    }

    let prefix = match direction {
        Direction::In => "dst host ",
        _ => "src host ",
    };
    let parts: Vec<String> = ipv4s.iter().map(|ip| format!("{prefix}{ip}")).collect();
    let local_clause = format!("({})", parts.join(" or "));

    format!(
        "({base_expr}) and {local_clause} and not {}",
        both_private_ipv4_clause(),
    )
}

/// Matches packets where BOTH endpoints are RFC1918 private IPv4:
/// 10.0.0.0/8, 172.16.0.0/12, or 192.168.0.0/16.
fn both_private_ipv4_clause() -> String {
    let private = "(net 10.0.0.0/8 or net 172.16.0.0/12 or net 192.168.0.0/16)";
    format!("(src {private} and dst {private})")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locals(addrs: &[&str]) -> HashSet<String> {
        addrs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_outbound_includes_local_clause() {
        let filter = build_default_filter("tcp or udp", Direction::Out, &locals(&["10.0.0.1", "fe80::1"]));
        assert!(filter.contains("src host 10.0.0.1"));
        // IPv6 locals are excluded for portability.
        assert!(!filter.contains("fe80"));
        assert!(filter.contains("not"));
        assert!(filter.contains("net 10.0.0.0/8"));
    }

    #[test]
    fn test_both_keeps_private_exclusion() {
        let filter = build_default_filter("tcp", Direction::Both, &locals(&["10.0.0.1"]));
        assert_ne!(filter, "tcp");
        assert!(!filter.contains("src host"));
        assert!(filter.contains("net 172.16.0.0/12"));
    }

    #[test]
    fn test_inbound_uses_dst_host() {
        let filter = build_default_filter("tcp or udp", Direction::In, &locals(&["192.168.1.10"]));
        assert!(filter.contains("dst host 192.168.1.10"));
        assert!(!filter.contains("src host"));
    }

    #[test]
    fn test_empty_base_expr_defaults() {
        let filter = build_default_filter("", Direction::Out, &locals(&["10.0.0.1"]));
        assert!(filter.contains("tcp or udp or icmp"));
    }

    #[test]
    fn test_no_local_ips_drops_endpoint_clause() {
        let filter = build_default_filter("tcp", Direction::Out, &HashSet::new());
        assert!(!filter.contains("src host"));
        assert!(filter.contains("not"));
    }

    #[test]
    fn test_ipv6_only_locals_drop_endpoint_clause() {
        let filter = build_default_filter("tcp", Direction::Out, &locals(&["fe80::1", "::1"]));
        assert!(!filter.contains("src host"));
        assert!(filter.contains("not"));
    }

    #[test]
    fn test_multiple_ipv4s_are_sorted() {
        let filter = build_default_filter("tcp", Direction::Out, &locals(&["10.0.0.2", "10.0.0.1"]));
        assert!(filter.contains("src host 10.0.0.1 or src host 10.0.0.2"));
    }
}
