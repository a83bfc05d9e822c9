//! End-to-end tests: fabric events in, flow table programming out
//!
//! ```text
//!   client 10.0.0.1          primeApp2 10.0.0.8
//!        │ 1                       │ 1
//!      [s1] 3 ──── 1 [s2] 2 ──── 2 [s3]
//!        │ 2
//!   primeApp1 10.0.0.7
//! ```

use bytes::Bytes;
use cpn_controller::{event_stream, Controller};
use cpn_core::{ControllerConfig, IngressNode, InstanceConfig, PolicyAlgorithm, ServiceConfig};
use cpn_router::EntryState;
use cpn_router_core::{SignalTable, StaticSignals};
use cpn_types::{
    Dpid, EthernetFrame, FabricEvent, FlowAction, FlowRemoved, FlowRemovedReason, IcmpPacket, Ipv4Packet, Link,
    MacAddr, NetworkLayer, PacketIn, PortNo, RecordingSouthbound, ServiceId, TransportLayer, TransportProtocol,
    ARP_REPLY, ARP_REQUEST, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::info;

const ANYCAST: Ipv4Addr = Ipv4Addr::new(192, 168, 255, 1);
const SENTINEL: MacAddr = MacAddr([0xf0, 0, 0, 0, 0, 1]);

/// Initialize tracing for tests
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

fn mac(last: u8) -> MacAddr {
    MacAddr([0, 0, 0, 0, 0, last])
}

fn service() -> ServiceId {
    ServiceId::tcp(ANYCAST, 8000)
}

fn create_config(algorithm: PolicyAlgorithm) -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.policy.algorithm = algorithm;
    config.anycast.ingress = vec![IngressNode {
        name: "cpNode1".to_string(),
        dpid: 1,
    }];
    config.anycast.services = vec![ServiceConfig {
        anycast_ip: ANYCAST,
        port: 8000,
        protocol: TransportProtocol::Tcp,
        description: "prime-app".to_string(),
        instances: vec![
            InstanceConfig {
                name: "primeApp1".to_string(),
                ip: ip(7),
                port: 8000,
            },
            InstanceConfig {
                name: "primeApp2".to_string(),
                ip: ip(8),
                port: 8000,
            },
        ],
    }];
    config
}

fn capacities(entries: &[(&str, f64)]) -> SignalTable {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn fabric_events() -> Vec<FabricEvent> {
    let arp_from = |last: u8, dpid: Dpid, port: PortNo| {
        let frame = EthernetFrame::arp_frame(ARP_REQUEST, mac(last), ip(last), MacAddr::ZERO, ip(254));
        FabricEvent::PacketIn(PacketIn::new(dpid, port, frame.encode()))
    };
    vec![
        FabricEvent::SwitchEnter {
            dpid: 1,
            ports: vec![1, 2, 3],
        },
        FabricEvent::SwitchEnter {
            dpid: 2,
            ports: vec![1, 2],
        },
        FabricEvent::SwitchEnter {
            dpid: 3,
            ports: vec![1, 2],
        },
        FabricEvent::LinkAdd(Link::new(1, 3, 2, 1)),
        FabricEvent::LinkAdd(Link::new(2, 2, 3, 2)),
        arp_from(1, 1, 1),
        arp_from(7, 1, 2),
        arp_from(8, 3, 1),
    ]
}

struct Fabric {
    sb: Arc<RecordingSouthbound>,
    signals: Arc<StaticSignals>,
    controller: Controller,
}

fn create_fabric(algorithm: PolicyAlgorithm) -> Fabric {
    let sb = Arc::new(RecordingSouthbound::new());
    let signals = Arc::new(StaticSignals::new());
    let controller = Controller::with_signals(create_config(algorithm), sb.clone(), signals.clone()).unwrap();
    for event in fabric_events() {
        controller.dispatch(event);
    }
    controller.topology().refresh_paths();
    controller.router().initialize_entries();
    sb.take();
    Fabric {
        sb,
        signals,
        controller,
    }
}

fn client_packet(transport: TransportLayer, dst: Ipv4Addr) -> FabricEvent {
    let frame = EthernetFrame::new(
        SENTINEL,
        mac(1),
        NetworkLayer::Ipv4(Ipv4Packet::new(ip(1), dst, transport)),
    );
    FabricEvent::PacketIn(PacketIn::new(1, 1, frame.encode()))
}

fn tcp_to_anycast() -> FabricEvent {
    client_packet(
        TransportLayer::Tcp {
            src_port: 40000,
            dst_port: 8000,
        },
        ANYCAST,
    )
}

fn rewritten_dst(actions: &[FlowAction]) -> Option<Ipv4Addr> {
    actions.iter().find_map(|a| match a {
        FlowAction::SetIpv4Dst { ip } => Some(*ip),
        _ => None,
    })
}

#[test]
fn test_anycast_session_follows_policy() {
    init_tracing();
    let f = create_fabric(PolicyAlgorithm::QpsWeighted);
    f.signals.set_capacities(capacities(&[("primeApp1", 100.0), ("primeApp2", 0.0)]));

    // First packet: everything weighs on primeApp1, reachable on s1:2
    f.controller.dispatch(tcp_to_anycast());
    let mods = f.sb.flow_mods();
    assert_eq!(mods.len(), 2);
    assert!(mods.iter().all(|(dpid, fm)| *dpid == 1 && fm.priority == 0x9000 && fm.send_flow_removed));
    assert_eq!(rewritten_dst(&mods[0].1.actions), Some(ip(7)));
    assert_eq!(mods[0].1.output_port(), Some(2));
    assert_eq!(mods[1].1.flow_match.ipv4_src, Some(ip(7)));
    assert_eq!(f.sb.packet_outs().len(), 1);
    f.sb.take();

    // Unchanged policy: ticks are silent
    assert_eq!(f.controller.router().refresh_policy_tick(), 0);
    assert!(f.sb.is_empty());

    // Capacity moves to primeApp2, two hops away
    f.signals.set_capacities(capacities(&[("primeApp1", 0.0), ("primeApp2", 100.0)]));
    assert_eq!(f.controller.router().refresh_policy_tick(), 1);
    let mods = f.sb.flow_mods();
    assert_eq!(mods.len(), 2);
    assert_eq!(rewritten_dst(&mods[0].1.actions), Some(ip(8)));
    assert_eq!(mods[0].1.output_port(), Some(3));
    assert_eq!(mods[1].1.flow_match.ipv4_src, Some(ip(8)));
    assert!(mods[1].1.actions.contains(&FlowAction::SetEthSrc { mac: SENTINEL }));
    let forward = mods[0].1.flow_match.clone();
    info!(?forward, "Entry moved to primeApp2");

    // The forward rule ages out: back to idle
    f.controller.dispatch(FabricEvent::FlowRemoved(FlowRemoved {
        dpid: 1,
        flow_match: forward,
        priority: 0x9000,
        reason: FlowRemovedReason::IdleTimeout,
        duration_sec: 600,
        packet_count: 40,
        byte_count: 12_000,
    }));
    let entry = f.controller.router().entry(1, &service()).unwrap();
    assert_eq!(entry.state(), EntryState::Idle);

    let counts = f.controller.router().dispatch_counts();
    assert!(counts.keys().any(|instance| instance.ip == ip(8)));
}

#[test]
fn test_anycast_address_answers_arp_and_ping() {
    init_tracing();
    let f = create_fabric(PolicyAlgorithm::Balance);

    let request = EthernetFrame::arp_frame(ARP_REQUEST, mac(1), ip(1), MacAddr::ZERO, ANYCAST);
    f.controller
        .dispatch(FabricEvent::PacketIn(PacketIn::new(1, 1, request.encode())));
    let outs = f.sb.packet_outs();
    assert_eq!(outs.len(), 1);
    let reply = EthernetFrame::parse(outs[0].1.data.as_ref().unwrap()).unwrap();
    let arp = reply.arp().unwrap();
    assert_eq!(arp.opcode, ARP_REPLY);
    assert_eq!((arp.sender_mac, arp.sender_ip), (SENTINEL, ANYCAST));
    assert_eq!(reply.dst, mac(1));
    f.sb.take();

    f.controller.dispatch(client_packet(
        TransportLayer::Icmp(IcmpPacket {
            icmp_type: ICMP_ECHO_REQUEST,
            code: 0,
            identifier: 0x1234,
            sequence: 9,
            payload: Bytes::from_static(b"abcdefgh"),
        }),
        ANYCAST,
    ));
    let outs = f.sb.packet_outs();
    assert_eq!(outs.len(), 1);
    assert_eq!(outs[0].1.actions, vec![FlowAction::output(1)]);
    let reply = EthernetFrame::parse(outs[0].1.data.as_ref().unwrap()).unwrap();
    let ipv4 = reply.ipv4().unwrap();
    assert_eq!((ipv4.src, ipv4.dst), (ANYCAST, ip(1)));
    match &ipv4.transport {
        TransportLayer::Icmp(icmp) => {
            assert_eq!(icmp.icmp_type, ICMP_ECHO_REPLY);
            assert_eq!((icmp.identifier, icmp.sequence), (0x1234, 9));
            assert_eq!(icmp.payload, Bytes::from_static(b"abcdefgh"));
        }
        other => panic!("unexpected transport {:?}", other),
    }
    assert!(f.sb.flow_mods().is_empty());
}

#[test]
fn test_plain_traffic_takes_shortest_path() {
    init_tracing();
    let f = create_fabric(PolicyAlgorithm::Balance);

    f.controller.dispatch(client_packet(
        TransportLayer::Udp {
            src_port: 5000,
            dst_port: 5001,
        },
        ip(8),
    ));

    let mods = f.sb.flow_mods();
    assert_eq!(mods.len(), 6);
    for dpid in [1, 2, 3] {
        let hop: Vec<_> = mods.iter().filter(|(d, _)| *d == dpid).collect();
        assert_eq!(hop.len(), 2, "switch {}", dpid);
        assert!(hop.iter().all(|(_, fm)| fm.priority == 1));
    }
    assert!(mods
        .iter()
        .any(|(d, fm)| *d == 1 && fm.flow_match.ipv4_dst == Some(ip(8)) && fm.output_port() == Some(3)));
    assert!(mods
        .iter()
        .any(|(d, fm)| *d == 3 && fm.flow_match.ipv4_dst == Some(ip(8)) && fm.output_port() == Some(1)));
    assert_eq!(f.sb.packet_outs().len(), 1);
    assert_eq!(f.controller.router().entry(1, &service()).unwrap().state(), EntryState::Idle);
}

#[test]
fn test_link_down_isolates_far_instance() {
    init_tracing();
    let f = create_fabric(PolicyAlgorithm::QpsWeighted);
    f.signals.set_capacities(capacities(&[("primeApp1", 0.0), ("primeApp2", 100.0)]));

    f.controller
        .dispatch(FabricEvent::LinkDelete(Link::new(2, 2, 3, 2)));
    f.controller.topology().refresh_paths();
    f.sb.take();

    // No path toward primeApp2: nothing is written, the entry stays idle
    f.controller.dispatch(tcp_to_anycast());
    assert!(f.sb.flow_mods().is_empty());
    assert_eq!(f.controller.router().entry(1, &service()).unwrap().state(), EntryState::Idle);
}

#[tokio::test]
async fn test_entries_created_by_periodic_task() {
    init_tracing();
    let mut config = create_config(PolicyAlgorithm::Balance);
    config.anycast.entry_init_period_secs = 0.02;
    config.anycast.policy_update_period_secs = 0.02;
    let sb = Arc::new(RecordingSouthbound::new());
    let controller = Arc::new(Controller::with_signals(config, sb.clone(), Arc::new(StaticSignals::new())).unwrap());

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(controller.clone().run(event_stream(rx)));
    for event in fabric_events() {
        tx.send(event).unwrap();
    }

    timeout(Duration::from_secs(2), async {
        while controller.router().entry_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("entries never initialized");
    assert_eq!(controller.router().entry_count(), 1);

    drop(tx);
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("run did not stop")
        .unwrap();
}
