//! Controller node
//!
//! Builds every component with explicit references and routes each fabric
//! event to the component that owns it.

use cpn_core::{ControllerConfig, PolicyAlgorithm, ServiceCatalogue};
use cpn_network::{BandwidthMonitor, DelayDetector, ShortestForwarding, TopologyStore};
use cpn_router::CpnRouter;
use cpn_router_core::{JsonFileSignals, SignalSource, UtilizationFeed};
use cpn_types::{EthernetFrame, FabricEvent, NetworkLayer, PacketIn, Southbound};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ControllerResult;
use crate::sampler::{CommandProbe, UtilizationProbe};
use crate::tasks::{spawn_periodic, TaskSet};

pub struct Controller {
    config: ControllerConfig,
    topology: Arc<TopologyStore>,
    monitor: Option<Arc<BandwidthMonitor>>,
    delay: Option<Arc<DelayDetector>>,
    forwarding: Arc<ShortestForwarding>,
    router: Arc<CpnRouter>,
    utilization: Arc<UtilizationFeed>,
    probe: Option<Arc<dyn UtilizationProbe>>,
}

impl Controller {
    /// Controller reading its signal tables from the configured JSON files
    pub fn new(config: ControllerConfig, southbound: Arc<dyn Southbound>) -> ControllerResult<Self> {
        let signals = Arc::new(JsonFileSignals::new(
            config.policy.capacity_table.clone(),
            config.policy.arrival_table.clone(),
        ));
        Self::with_signals(config, southbound, signals)
    }

    pub fn with_signals(
        config: ControllerConfig,
        southbound: Arc<dyn Southbound>,
        signals: Arc<dyn SignalSource>,
    ) -> ControllerResult<Self> {
        config.validate()?;
        info!(
            controller_id = %config.controller_id,
            metric = %config.topology.metric,
            k_paths = config.topology.k_paths,
            policy = %config.policy.algorithm,
            "Creating controller"
        );

        let topology = Arc::new(TopologyStore::new(
            config.topology.metric,
            config.topology.k_paths,
            southbound.clone(),
        ));
        let monitor = config.bandwidth_enabled().then(|| {
            Arc::new(BandwidthMonitor::new(
                topology.clone(),
                southbound.clone(),
                &config.monitor,
                config.flow.forwarding_priority,
            ))
        });
        let delay = config
            .delay_enabled()
            .then(|| Arc::new(DelayDetector::new(topology.clone(), southbound.clone(), &config.monitor)));

        let catalogue = ServiceCatalogue::from_config(&config.anycast);
        let forwarding = Arc::new(ShortestForwarding::new(
            topology.clone(),
            monitor.clone(),
            southbound.clone(),
            catalogue.clone(),
            config.flow.clone(),
        ));

        let utilization = Arc::new(UtilizationFeed::new());
        let router = Arc::new(CpnRouter::new(
            &config,
            topology.clone(),
            forwarding.clone(),
            southbound,
            catalogue,
            signals,
            utilization.clone(),
        )?);

        let probe: Option<Arc<dyn UtilizationProbe>> = (config.policy.algorithm == PolicyAlgorithm::DynamicFeedback)
            .then(|| {
                Arc::new(CommandProbe::new(
                    config.policy.cpu_probe_command.clone(),
                    config.policy.container_prefix.clone(),
                )) as Arc<dyn UtilizationProbe>
            });

        Ok(Self {
            config,
            topology,
            monitor,
            delay,
            forwarding,
            router,
            utilization,
            probe,
        })
    }

    /// Replace the CPU utilization probe
    pub fn with_probe(mut self, probe: Arc<dyn UtilizationProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn controller_id(&self) -> &str {
        &self.config.controller_id
    }

    pub fn topology(&self) -> &Arc<TopologyStore> {
        &self.topology
    }

    pub fn forwarding(&self) -> &Arc<ShortestForwarding> {
        &self.forwarding
    }

    pub fn router(&self) -> &Arc<CpnRouter> {
        &self.router
    }

    pub fn monitor(&self) -> Option<&Arc<BandwidthMonitor>> {
        self.monitor.as_ref()
    }

    pub fn delay_detector(&self) -> Option<&Arc<DelayDetector>> {
        self.delay.as_ref()
    }

    pub fn utilization(&self) -> &Arc<UtilizationFeed> {
        &self.utilization
    }

    // ========== Event dispatch ==========

    pub fn dispatch(&self, event: FabricEvent) {
        match event {
            FabricEvent::SwitchEnter { dpid, ports } => self.topology.on_switch_enter(dpid, &ports),
            FabricEvent::SwitchLeave { dpid } => self.topology.on_switch_leave(dpid),
            FabricEvent::PortStatus { dpid, port_no, reason } => {
                self.topology.on_port_status(dpid, port_no, reason)
            }
            FabricEvent::LinkAdd(link) => self.topology.on_link_add(link),
            FabricEvent::LinkDelete(link) => self.topology.on_link_delete(link),
            FabricEvent::PacketIn(packet) => self.on_packet_in(&packet),
            FabricEvent::FlowRemoved(removed) => {
                self.router.handle_flow_removed(&removed);
            }
            FabricEvent::PortStatsReply { dpid, stats } => match &self.monitor {
                Some(monitor) => monitor.on_port_stats_reply(dpid, &stats),
                None => debug!(dpid = dpid, "Port stats without bandwidth monitor"),
            },
            FabricEvent::FlowStatsReply { dpid, stats } => match &self.monitor {
                Some(monitor) => monitor.on_flow_stats_reply(dpid, &stats),
                None => debug!(dpid = dpid, "Flow stats without bandwidth monitor"),
            },
            FabricEvent::PortDescReply { dpid, ports } => match &self.monitor {
                Some(monitor) => monitor.on_port_desc_reply(dpid, &ports),
                None => debug!(dpid = dpid, "Port description without bandwidth monitor"),
            },
            FabricEvent::EchoReply { dpid, payload } => match &self.delay {
                Some(delay) => delay.on_echo_reply(dpid, &payload),
                None => debug!(dpid = dpid, "Echo reply without delay detector"),
            },
            FabricEvent::LinkProbe { link, round_trip } => match &self.delay {
                Some(delay) => delay.on_link_probe(&link, round_trip),
                None => debug!(src = link.src, dst = link.dst, "Link probe without delay detector"),
            },
        }
    }

    /// Learn the sender, then offer the packet to the anycast engine and
    /// fall back to shortest-path forwarding
    fn on_packet_in(&self, packet: &PacketIn) {
        match EthernetFrame::parse(&packet.data) {
            Ok(frame) => {
                if let NetworkLayer::Arp(arp) = &frame.network {
                    self.topology
                        .on_host_sighting(packet.dpid, packet.in_port, arp.sender_ip, arp.sender_mac);
                }
            }
            Err(e) => {
                debug!(dpid = packet.dpid, in_port = packet.in_port, error = %e, "Dropping malformed frame");
                return;
            }
        }

        if !self.router.handle_packet_in(packet) {
            self.forwarding.handle_packet_in(packet);
        }
    }

    // ========== Runtime ==========

    /// Start the periodic tasks and dispatch events until the stream ends
    pub async fn run<S>(self: Arc<Self>, events: S)
    where
        S: Stream<Item = FabricEvent> + Send + Unpin,
    {
        let mut tasks = self.clone().spawn_tasks();
        info!(
            controller_id = %self.config.controller_id,
            tasks = ?tasks.names(),
            "Controller running"
        );

        let mut events = events;
        while let Some(event) = events.next().await {
            self.dispatch(event);
        }

        info!("Event stream closed, stopping controller");
        tasks.abort_all();
    }

    /// Spawn every periodic task this configuration needs
    pub fn spawn_tasks(self: Arc<Self>) -> TaskSet {
        let mut tasks = TaskSet::new();

        let topology = self.topology.clone();
        tasks.push(
            "topology_refresh",
            spawn_periodic("topology_refresh", self.config.topology.discovery_period(), move || {
                let topology = topology.clone();
                async move {
                    if topology.refresh_paths() {
                        debug!(switches = topology.switch_count(), "Topology refreshed");
                    }
                    anyhow::Ok(())
                }
            }),
        );

        if let Some(monitor) = self.monitor.clone() {
            tasks.push(
                "bandwidth_monitor",
                spawn_periodic("bandwidth_monitor", self.config.monitor.bandwidth_period(), move || {
                    let monitor = monitor.clone();
                    async move {
                        // Replies of the previous round are in by now
                        monitor.save_bandwidth_graph();
                        let switches = monitor.request_stats();
                        debug!(switches = switches, "Bandwidth round started");
                        anyhow::Ok(())
                    }
                }),
            );
        }

        if let Some(delay) = self.delay.clone() {
            tasks.push(
                "delay_detector",
                spawn_periodic("delay_detector", self.config.monitor.delay_period(), move || {
                    let delay = delay.clone();
                    async move {
                        delay.probe_round().await;
                        anyhow::Ok(())
                    }
                }),
            );
        }

        let router = self.router.clone();
        tasks.push(
            "entry_init",
            spawn_periodic("entry_init", self.config.anycast.entry_init_period(), move || {
                let router = router.clone();
                async move {
                    router.initialize_entries();
                    anyhow::Ok(())
                }
            }),
        );

        let router = self.router.clone();
        tasks.push(
            "policy_tick",
            spawn_periodic("policy_tick", self.config.anycast.policy_update_period(), move || {
                let router = router.clone();
                async move {
                    if router.entries_initialized() {
                        router.refresh_policy_tick();
                    }
                    anyhow::Ok(())
                }
            }),
        );

        if let Some(probe) = self.probe.clone() {
            let utilization = self.utilization.clone();
            tasks.push(
                "cpu_probe",
                spawn_periodic("cpu_probe", self.config.policy.cpu_probe_period(), move || {
                    let probe = probe.clone();
                    let utilization = utilization.clone();
                    async move {
                        let snapshot = probe.sample().await?;
                        utilization.publish(snapshot);
                        anyhow::Ok(())
                    }
                }),
            );
        }

        tasks
    }
}
