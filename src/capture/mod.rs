pub mod event;
pub mod filter;

use std::collections::HashSet;
use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use self::event::{PacketEvent, Protocol};

/// Bounded queue between the capture thread and the update task.
const CHANNEL_CAPACITY: usize = 2048;

/// pcap read timeout; bounds how long the capture thread can go without
/// checking for cancellation.
const READ_TIMEOUT_MS: i32 = 500;

/// Names of all capture-capable interfaces on this host.
pub fn list_ifaces() -> Vec<String> {
    pnet::datalink::interfaces()
        .into_iter()
        .map(|iface| iface.name)
        .collect()
}

/// Resolves the set of addresses (text form) assigned to an interface.
pub fn local_ips_for_interface(name: &str) -> Result<HashSet<String>> {
    let iface = pnet::datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name);

    let Some(iface) = iface else {
        bail!("interface {name:?} not found");
    };

    Ok(iface
        .ips
        .iter()
        .map(|network| network.ip().to_string())
        .collect())
}

/// Opens a capture on `iface` and spawns a dedicated thread that decodes
/// frames into [`PacketEvent`]s on the returned channel.
///
/// The thread exits when the token is cancelled (observed on the pcap read
/// timeout), when the receiver is dropped, or on a capture error; in every
/// case the channel closes, which downstream treats as source termination.
pub fn start(
    iface: &str,
    filter_expr: &str,
    snaplen: i32,
    promisc: bool,
    cancel: CancellationToken,
) -> Result<(std::thread::JoinHandle<()>, mpsc::Receiver<PacketEvent>)> {
    let mut cap = pcap::Capture::from_device(iface)
        .with_context(|| format!("opening device {iface:?}"))?
        .snaplen(snaplen)
        .promisc(promisc)
        .timeout(READ_TIMEOUT_MS)
        .open()
        .with_context(|| format!("activating capture on {iface:?}"))?;

    if !filter_expr.is_empty() {
        cap.filter(filter_expr, true)
            .with_context(|| format!("setting capture filter {filter_expr:?}"))?;
    }

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let handle = std::thread::Builder::new()
        .name("netwatch-capture".to_string())
        .spawn(move || {
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                match cap.next_packet() {
                    Ok(packet) => {
                        let ts = timeval_to_datetime(
                            packet.header.ts.tv_sec as i64,
                            packet.header.ts.tv_usec as i64,
                        );
                        if let Some(ev) = parse_frame(packet.data, ts) {
                            if tx.blocking_send(ev).is_err() {
                                // Receiver gone; nothing left to feed.
                                return;
                            }
                        }
                    }
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(e) => {
                        warn!(error = %e, "capture read failed, stopping");
                        return;
                    }
                }
            }
        })
        .context("spawning capture thread")?;

    Ok((handle, rx))
}

fn timeval_to_datetime(sec: i64, usec: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(sec, (usec * 1000) as u32)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Decodes one link-layer frame into a packet event. Non-IP frames and
/// frames too short to parse yield `None` and are dropped silently; that
/// is the adapter contract, not an error.
fn parse_frame(data: &[u8], timestamp: DateTime<Utc>) -> Option<PacketEvent> {
    let eth = EthernetPacket::new(data)?;

    let (src_ip, dst_ip, next, payload_range) = match eth.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ip = Ipv4Packet::new(eth.payload())?;
            let header_len = usize::from(ip.get_header_length()) * 4;
            (
                IpAddr::V4(ip.get_source()),
                IpAddr::V4(ip.get_destination()),
                ip.get_next_level_protocol(),
                payload_offset(eth.payload(), header_len)?,
            )
        }
        EtherTypes::Ipv6 => {
            let ip = Ipv6Packet::new(eth.payload())?;
            (
                IpAddr::V6(ip.get_source()),
                IpAddr::V6(ip.get_destination()),
                ip.get_next_header(),
                payload_offset(eth.payload(), 40)?,
            )
        }
        _ => return None,
    };

    let (protocol, src_port, dst_port) = transport_info(next, payload_range);

    Some(PacketEvent {
        timestamp,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        length: data.len() as u32,
    })
}

fn payload_offset(ip_packet: &[u8], header_len: usize) -> Option<&[u8]> {
    ip_packet.get(header_len..)
}

fn transport_info(next: IpNextHeaderProtocol, payload: &[u8]) -> (Protocol, u16, u16) {
    match next {
        IpNextHeaderProtocols::Tcp => match TcpPacket::new(payload) {
            Some(tcp) => (Protocol::Tcp, tcp.get_source(), tcp.get_destination()),
            None => (Protocol::Other, 0, 0),
        },
        IpNextHeaderProtocols::Udp => match UdpPacket::new(payload) {
            Some(udp) => (Protocol::Udp, udp.get_source(), udp.get_destination()),
            None => (Protocol::Other, 0, 0),
        },
        IpNextHeaderProtocols::Icmp | IpNextHeaderProtocols::Icmpv6 => (Protocol::Icmp, 0, 0),
        _ => (Protocol::Other, 0, 0),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    /// Builds an ethernet/IPv4 frame with the given transport payload.
    fn ipv4_frame(proto: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();

        // Ethernet: dst MAC, src MAC, ethertype 0x0800.
        frame.extend_from_slice(&[0u8; 6]);
        frame.extend_from_slice(&[0u8; 6]);
        frame.extend_from_slice(&[0x08, 0x00]);

        // IPv4 header, no options.
        let total_len = 20 + payload.len();
        frame.push(0x45); // version 4, IHL 5
        frame.push(0);
        frame.extend_from_slice(&(total_len as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0]); // id, flags/frag
        frame.push(64); // ttl
        frame.push(proto);
        frame.extend_from_slice(&[0, 0]); // checksum (unchecked by parser)
        frame.extend_from_slice(&[10, 0, 0, 1]); // src
        frame.extend_from_slice(&[8, 8, 8, 8]); // dst
        frame.extend_from_slice(payload);

        frame
    }

    fn udp_payload(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut udp = Vec::new();
        udp.extend_from_slice(&src_port.to_be_bytes());
        udp.extend_from_slice(&dst_port.to_be_bytes());
        udp.extend_from_slice(&8u16.to_be_bytes()); // length
        udp.extend_from_slice(&[0, 0]); // checksum
        udp
    }

    fn tcp_payload(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        tcp[12] = 0x50; // data offset 5
        tcp
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_udp_frame() {
        let frame = ipv4_frame(17, &udp_payload(1234, 53));
        let ev = parse_frame(&frame, ts()).expect("parse UDP frame");

        assert_eq!(ev.protocol, Protocol::Udp);
        assert_eq!(ev.src_ip.to_string(), "10.0.0.1");
        assert_eq!(ev.dst_ip.to_string(), "8.8.8.8");
        assert_eq!(ev.src_port, 1234);
        assert_eq!(ev.dst_port, 53);
        assert_eq!(ev.length, frame.len() as u32);
    }

    #[test]
    fn test_parse_tcp_frame() {
        let frame = ipv4_frame(6, &tcp_payload(50000, 443));
        let ev = parse_frame(&frame, ts()).expect("parse TCP frame");

        assert_eq!(ev.protocol, Protocol::Tcp);
        assert_eq!(ev.src_port, 50000);
        assert_eq!(ev.dst_port, 443);
    }

    #[test]
    fn test_parse_icmp_frame_has_zero_ports() {
        // Minimal ICMP echo header.
        let frame = ipv4_frame(1, &[8, 0, 0, 0, 0, 0, 0, 0]);
        let ev = parse_frame(&frame, ts()).expect("parse ICMP frame");

        assert_eq!(ev.protocol, Protocol::Icmp);
        assert_eq!(ev.src_port, 0);
        assert_eq!(ev.dst_port, 0);
    }

    #[test]
    fn test_unknown_transport_maps_to_other() {
        // Protocol 47 (GRE) is not decoded.
        let frame = ipv4_frame(47, &[0, 0, 0, 0]);
        let ev = parse_frame(&frame, ts()).expect("parse GRE frame");
        assert_eq!(ev.protocol, Protocol::Other);
        assert_eq!(ev.src_port, 0);
    }

    #[test]
    fn test_non_ip_frame_is_dropped() {
        // ARP ethertype.
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&[0x08, 0x06]);
        frame.extend_from_slice(&[0u8; 28]);
        assert!(parse_frame(&frame, ts()).is_none());
    }

    #[test]
    fn test_truncated_frame_is_dropped() {
        assert!(parse_frame(&[0x45, 0x00], ts()).is_none());
    }

    #[test]
    fn test_timeval_conversion() {
        let dt = timeval_to_datetime(1_700_000_000, 250_000);
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_micros(), 250_000);
    }
}
