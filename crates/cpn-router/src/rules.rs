//! Address-rewrite rule pair
//!
//! ```text
//! client ──► ingress ── forward: dst anycast -> instance ──► instance
//! client ◄── ingress ◄─ reverse: src instance -> anycast ─── instance
//! ```
//!
//! The forward rule matches the client's first packet shape (in_port,
//! client, anycast address, service port) and rewrites the destination
//! MAC, IP and port. The reverse rule matches the instance's replies to the
//! client and restores the anycast address, port and sentinel MAC.

use cpn_core::FlowConfig;
use cpn_types::{
    FlowAction, FlowMatch, FlowMod, MacAddr, PortNo, ServiceId, ServiceInstance, TransportProtocol,
};
use std::net::Ipv4Addr;

/// Everything a rule pair is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteTarget {
    pub service: ServiceId,
    /// Port the client's traffic enters the ingress switch on
    pub in_port: PortNo,
    pub client: Ipv4Addr,
    pub instance: ServiceInstance,
    pub instance_mac: MacAddr,
    /// First-hop port from the ingress switch toward the instance
    pub out_port: PortNo,
}

/// Forward and reverse flow-mods for one dispatch decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRules {
    pub forward: FlowMod,
    pub reverse: FlowMod,
}

/// Match of the client's requests toward the anycast service
pub fn forward_match(service: ServiceId, in_port: PortNo, client: Ipv4Addr) -> FlowMatch {
    let base = FlowMatch::ipv4(client, service.ip)
        .with_in_port(in_port)
        .with_ip_proto(service.protocol.ip_proto());
    match service.protocol {
        TransportProtocol::Tcp => base.with_tcp_dst(service.port),
        TransportProtocol::Udp => base.with_udp_dst(service.port),
    }
}

/// Match of the instance's replies to the client
pub fn reverse_match(service: ServiceId, instance: ServiceInstance, client: Ipv4Addr) -> FlowMatch {
    let base = FlowMatch::ipv4(instance.ip, client).with_ip_proto(service.protocol.ip_proto());
    match service.protocol {
        TransportProtocol::Tcp => base.with_tcp_src(instance.port),
        TransportProtocol::Udp => base.with_udp_src(instance.port),
    }
}

impl RewriteRules {
    pub fn build(target: &RewriteTarget, sentinel_mac: MacAddr, flow: &FlowConfig) -> Self {
        let service = target.service;
        let instance = target.instance;

        let set_dst_port = match service.protocol {
            TransportProtocol::Tcp => FlowAction::SetTcpDst { port: instance.port },
            TransportProtocol::Udp => FlowAction::SetUdpDst { port: instance.port },
        };
        let forward_actions = vec![
            FlowAction::SetEthDst { mac: target.instance_mac },
            FlowAction::SetIpv4Dst { ip: instance.ip },
            set_dst_port,
            FlowAction::output(target.out_port),
        ];

        let set_src_port = match service.protocol {
            TransportProtocol::Tcp => FlowAction::SetTcpSrc { port: service.port },
            TransportProtocol::Udp => FlowAction::SetUdpSrc { port: service.port },
        };
        let reverse_actions = vec![
            FlowAction::SetEthSrc { mac: sentinel_mac },
            FlowAction::SetIpv4Src { ip: service.ip },
            set_src_port,
            FlowAction::output(target.in_port),
        ];

        let rule = |flow_match: FlowMatch, actions: Vec<FlowAction>| {
            FlowMod::new(flow.anycast_priority, flow_match, actions)
                .with_timeouts(flow.idle_timeout, flow.hard_timeout)
                .with_flow_removed()
        };

        Self {
            forward: rule(forward_match(service, target.in_port, target.client), forward_actions),
            reverse: rule(reverse_match(service, instance, target.client), reverse_actions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpn_types::{IPPROTO_TCP, IPPROTO_UDP};

    fn target(service: ServiceId) -> RewriteTarget {
        RewriteTarget {
            service,
            in_port: 1,
            client: Ipv4Addr::new(10, 0, 0, 1),
            instance: ServiceInstance::new(Ipv4Addr::new(10, 0, 0, 7), 8080),
            instance_mac: MacAddr([0, 0, 0, 0, 0, 7]),
            out_port: 3,
        }
    }

    #[test]
    fn test_tcp_rule_pair() {
        let service = ServiceId::tcp(Ipv4Addr::new(192, 168, 255, 1), 8000);
        let sentinel = MacAddr([0xf0, 0, 0, 0, 0, 1]);
        let rules = RewriteRules::build(&target(service), sentinel, &FlowConfig::default());

        let fwd = &rules.forward;
        assert_eq!(fwd.priority, 0x9000);
        assert_eq!((fwd.idle_timeout, fwd.hard_timeout), (600, 3600));
        assert!(fwd.send_flow_removed);
        assert_eq!(fwd.flow_match.in_port, Some(1));
        assert_eq!(fwd.flow_match.ip_proto, Some(IPPROTO_TCP));
        assert_eq!(fwd.flow_match.ipv4_dst, Some(service.ip));
        assert_eq!(fwd.flow_match.tcp_dst, Some(8000));
        assert!(fwd.actions.contains(&FlowAction::SetIpv4Dst { ip: Ipv4Addr::new(10, 0, 0, 7) }));
        assert!(fwd.actions.contains(&FlowAction::SetTcpDst { port: 8080 }));
        assert_eq!(fwd.output_port(), Some(3));

        let rev = &rules.reverse;
        assert_eq!(rev.flow_match.in_port, None);
        assert_eq!(rev.flow_match.ipv4_src, Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(rev.flow_match.ipv4_dst, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(rev.flow_match.tcp_src, Some(8080));
        assert!(rev.actions.contains(&FlowAction::SetEthSrc { mac: sentinel }));
        assert!(rev.actions.contains(&FlowAction::SetIpv4Src { ip: service.ip }));
        assert!(rev.actions.contains(&FlowAction::SetTcpSrc { port: 8000 }));
        assert_eq!(rev.output_port(), Some(1));
    }

    #[test]
    fn test_udp_rewrites_udp_ports() {
        let service = ServiceId::udp(Ipv4Addr::new(192, 168, 255, 2), 9000);
        let rules = RewriteRules::build(&target(service), MacAddr::ZERO, &FlowConfig::default());

        assert_eq!(rules.forward.flow_match.ip_proto, Some(IPPROTO_UDP));
        assert_eq!(rules.forward.flow_match.udp_dst, Some(9000));
        assert_eq!(rules.forward.flow_match.tcp_dst, None);
        assert!(rules.forward.actions.contains(&FlowAction::SetUdpDst { port: 8080 }));
        assert!(!rules
            .forward
            .actions
            .iter()
            .any(|a| matches!(a, FlowAction::SetTcpDst { .. })));
        assert_eq!(rules.reverse.flow_match.udp_src, Some(8080));
        assert!(rules.reverse.actions.contains(&FlowAction::SetUdpSrc { port: 9000 }));
    }
}
