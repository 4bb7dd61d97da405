use std::net::IpAddr;

use chrono::{DateTime, Utc};

/// Transport-level protocol tag of a captured packet.
///
/// A closed set rather than a free-form string so unexpected protocols
/// cannot explode the flow-key cardinality. The declaration order defines
/// the sort order of flow keys, so it must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl Protocol {
    /// Returns the wire tag used in exported records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
            Self::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded packet observation handed from the capture thread to the
/// flow aggregator.
#[derive(Debug, Clone)]
pub struct PacketEvent {
    /// Capture timestamp from the pcap header.
    pub timestamp: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// Zero for protocols without ports (ICMP, OTHER).
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    /// Length of the captured frame in bytes.
    pub length: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_tags() {
        assert_eq!(Protocol::Tcp.as_str(), "TCP");
        assert_eq!(Protocol::Udp.as_str(), "UDP");
        assert_eq!(Protocol::Icmp.as_str(), "ICMP");
        assert_eq!(Protocol::Other.as_str(), "OTHER");
    }

    #[test]
    fn test_protocol_sort_order_is_stable() {
        let mut protos = vec![
            Protocol::Other,
            Protocol::Icmp,
            Protocol::Tcp,
            Protocol::Udp,
        ];
        protos.sort();
        assert_eq!(
            protos,
            vec![
                Protocol::Tcp,
                Protocol::Udp,
                Protocol::Icmp,
                Protocol::Other,
            ],
        );
    }
}
