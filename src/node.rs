//! Cluster Node
//!
//! Composition root: builds the clock, failure detector, gossiper,
//! snitch stack, topology and transport from a configuration, wires the
//! event-bus subscribers between them, and owns the pump tasks that move
//! messages between the gossiper and the network.

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::admin::ClusterAdmin;
use crate::clock::MonotonicClock;
use crate::config::WolfpackConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::gossip::{
    EndpointStateSubscriber, Envelope, EventBus, FailureDetector, GossipMessage, Gossiper,
};
use crate::net::{GossipClient, GossipServer, PreferredAddressBook};
use crate::state::{status, ApplicationKey, EndpointState, VersionGenerator, VersionedValue};
use crate::topology::{
    ConfigSnitch, DynamicSnitch, LocalStrategy, NetworkTopologyStrategy, ReplicationStrategy,
    Snitch, TopologyMetaData,
};

pub struct ClusterNode {
    config: WolfpackConfig,
    local: Endpoint,
    topology: Arc<TopologyMetaData>,
    failure_detector: Arc<FailureDetector>,
    gossiper: Arc<Gossiper>,
    snitch: Arc<DynamicSnitch>,
    strategy: Arc<dyn ReplicationStrategy>,
    client: Arc<GossipClient>,
    server: Arc<GossipServer>,
    outbound_rx: Mutex<Option<mpsc::Receiver<(Endpoint, GossipMessage)>>>,
    incoming_rx: Mutex<Option<mpsc::Receiver<(Endpoint, GossipMessage)>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterNode {
    pub fn new(config: WolfpackConfig) -> Result<Self> {
        config.validate()?;
        let local = config.local_endpoint()?;
        let seeds = config.seed_endpoints()?;

        let clock = MonotonicClock::new();
        let versions = Arc::new(VersionGenerator::new());
        let topology = Arc::new(TopologyMetaData::new());
        let events = Arc::new(EventBus::new());
        let failure_detector = Arc::new(FailureDetector::new(
            config.failure_detector_config(),
            clock,
        ));

        let (outbound_tx, outbound_rx) = mpsc::channel(1024);
        let gossiper = Gossiper::new(
            local.clone(),
            config.gossip_settings(),
            seeds,
            clock,
            versions,
            failure_detector.clone(),
            topology.clone(),
            events,
            outbound_tx,
        );

        let subsnitch: Arc<dyn Snitch> = Arc::new(ConfigSnitch::new(
            config.cluster.datacenter.clone(),
            config.cluster.rack.clone(),
            topology.clone(),
        ));
        let snitch = DynamicSnitch::new(
            subsnitch.clone(),
            gossiper.clone(),
            config.dynamic_snitch_config(),
            clock,
        );
        gossiper.set_latency_subscriber(snitch.clone());

        let strategy: Arc<dyn ReplicationStrategy> = match config.replication.strategy.as_str() {
            "local" => Arc::new(LocalStrategy::new(local.clone())),
            "network-topology" => {
                let options = config
                    .replication
                    .factors
                    .iter()
                    .map(|(datacenter, factor)| (datacenter.clone(), factor.to_string()))
                    .collect();
                Arc::new(NetworkTopologyStrategy::new(snitch.clone(), &options)?)
            }
            other => {
                return Err(Error::Config(format!(
                    "unknown replication strategy {:?}",
                    other
                )))
            }
        };

        let client = Arc::new(GossipClient::new(
            Duration::from_secs(2),
            PreferredAddressBook::load(Some(config.preferred_address_path())),
        ));
        let (incoming_tx, incoming_rx) = mpsc::channel(1024);
        let server = Arc::new(GossipServer::new(
            config.node.bind_address.clone(),
            incoming_tx,
            gossiper.backlog(),
        ));

        // topology follows membership events
        gossiper.register_subscriber(Arc::new(TopologyUpdater {
            topology: topology.clone(),
            datacenter: config.cluster.datacenter.clone(),
            rack: config.cluster.rack.clone(),
            gossiper: RwLock::new(Arc::downgrade(&gossiper)),
        }));
        // reconnect to same-DC peers over their internal address
        if config.cluster.prefer_local {
            gossiper.register_subscriber(Arc::new(ReconnectHelper {
                client: client.clone(),
                snitch: subsnitch,
                local_datacenter: config.cluster.datacenter.clone(),
            }));
        }

        Ok(Self {
            config,
            local,
            topology,
            failure_detector,
            gossiper,
            snitch,
            strategy,
            client,
            server,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            incoming_rx: Mutex::new(Some(incoming_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the transport, the snitch timers and the gossiper
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(Error::Internal("node already started".into()));
        }

        let server = self.server.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("gossip server failed: {}", e);
            }
        }));

        // outbound pump: gossiper -> network
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("outbound pump already taken".into()))?;
        let client = self.client.clone();
        let local = self.local.clone();
        tasks.push(tokio::spawn(async move {
            while let Some((to, message)) = outbound_rx.recv().await {
                let envelope = Envelope::new(local.clone(), message);
                if let Err(e) = client.send_one_way(&to, &envelope).await {
                    // dropped messages are retried by the next gossip round
                    tracing::debug!("could not gossip to {}: {}", to, e);
                }
            }
        }));

        // inbound pump: network -> gossiper
        let mut incoming_rx = self
            .incoming_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("inbound pump already taken".into()))?;
        let gossiper = self.gossiper.clone();
        tasks.push(tokio::spawn(async move {
            while let Some((from, message)) = incoming_rx.recv().await {
                gossiper.handle_message(from, message).await;
            }
        }));

        self.snitch.subsnitch().gossiper_starting();
        self.snitch.clone().start();

        // register ourselves as a topology member before gossiping
        self.topology.add_member(
            &self.local,
            &self.config.cluster.datacenter,
            &self.config.cluster.rack,
            self.config.node.host_id.as_deref(),
        );

        let generation = chrono::Utc::now().timestamp() as i32;
        let mut preload = vec![
            (ApplicationKey::Status, status::NORMAL.to_string()),
            (
                ApplicationKey::Datacenter,
                self.config.cluster.datacenter.clone(),
            ),
            (ApplicationKey::Rack, self.config.cluster.rack.clone()),
            (ApplicationKey::NetVersion, "1".to_string()),
        ];
        if let Some(host_id) = &self.config.node.host_id {
            preload.push((ApplicationKey::HostId, host_id.clone()));
        }
        if let Some(internal) = &self.config.node.internal_address {
            preload.push((ApplicationKey::InternalIp, internal.clone()));
        }
        tasks.push(self.gossiper.clone().start(generation, preload));

        tracing::info!(
            "wolfpack node {} up in {}/{}",
            self.local,
            self.config.cluster.datacenter,
            self.config.cluster.rack
        );
        Ok(())
    }

    /// Announce shutdown, stop the timers and tear the pumps down
    pub async fn stop(&self) {
        self.gossiper.stop().await;
        self.snitch.stop();
        self.server.stop();
        self.client.close_all();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        tracing::info!("wolfpack node {} stopped", self.local);
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub fn gossiper(&self) -> &Arc<Gossiper> {
        &self.gossiper
    }

    pub fn topology(&self) -> &Arc<TopologyMetaData> {
        &self.topology
    }

    pub fn snitch(&self) -> &Arc<DynamicSnitch> {
        &self.snitch
    }

    pub fn strategy(&self) -> &Arc<dyn ReplicationStrategy> {
        &self.strategy
    }

    pub fn admin(&self) -> ClusterAdmin {
        ClusterAdmin::new(
            self.gossiper.clone(),
            self.failure_detector.clone(),
            self.snitch.clone(),
        )
    }
}

/// Keeps topology metadata in sync with membership events: endpoints
/// with a NORMAL status become members at their advertised datacenter
/// and rack, dead statuses and removals take them out
struct TopologyUpdater {
    topology: Arc<TopologyMetaData>,
    datacenter: String,
    rack: String,
    gossiper: RwLock<Weak<Gossiper>>,
}

impl TopologyUpdater {
    fn maybe_register(&self, endpoint: &Endpoint, state: &EndpointState) {
        let Some(status_value) = state.application_state(ApplicationKey::Status) else {
            return;
        };
        let token = status_value.status_token();
        if token == status::NORMAL {
            let datacenter = state
                .application_state(ApplicationKey::Datacenter)
                .map(|value| value.value.clone())
                .unwrap_or_else(|| self.datacenter.clone());
            let rack = state
                .application_state(ApplicationKey::Rack)
                .map(|value| value.value.clone())
                .unwrap_or_else(|| self.rack.clone());
            let host_id = state
                .application_state(ApplicationKey::HostId)
                .map(|value| value.value.clone())
                .or_else(|| endpoint.host_id.clone());
            self.topology
                .add_member(endpoint, &datacenter, &rack, host_id.as_deref());
        } else if crate::state::is_dead_status_token(token) {
            self.topology.remove_member(endpoint);
        }
    }

    fn refresh(&self, endpoint: &Endpoint) {
        let Some(gossiper) = self.gossiper.read().unwrap().upgrade() else {
            return;
        };
        if let Some(state) = gossiper.endpoint_state(endpoint) {
            self.maybe_register(endpoint, &state);
        }
    }
}

impl EndpointStateSubscriber for TopologyUpdater {
    fn on_join(&self, endpoint: &Endpoint, state: &EndpointState) {
        self.maybe_register(endpoint, state);
    }

    fn on_change(&self, endpoint: &Endpoint, key: ApplicationKey, value: &VersionedValue) {
        match key {
            ApplicationKey::Status => {
                if crate::state::is_dead_status_token(value.status_token()) {
                    self.topology.remove_member(endpoint);
                } else {
                    self.refresh(endpoint);
                }
            }
            ApplicationKey::Datacenter | ApplicationKey::Rack | ApplicationKey::HostId => {
                self.refresh(endpoint)
            }
            _ => {}
        }
    }

    fn on_remove(&self, endpoint: &Endpoint) {
        self.topology.remove_member(endpoint);
    }
}

/// Sidekick for deployments where a node has a public and an internal
/// address: when a same-datacenter peer advertises its internal address,
/// record it so new connections go there
struct ReconnectHelper {
    client: Arc<GossipClient>,
    snitch: Arc<dyn Snitch>,
    local_datacenter: String,
}

impl ReconnectHelper {
    fn reconnect(&self, endpoint: &Endpoint, internal: &str) {
        if self.snitch.datacenter_of(endpoint) != self.local_datacenter {
            return;
        }
        match Endpoint::parse(internal) {
            Ok(preferred) => {
                if preferred != *endpoint {
                    tracing::debug!(
                        "initiated reconnect to internal address {} for {}",
                        preferred,
                        endpoint
                    );
                    self.client.set_preferred(endpoint, preferred);
                }
            }
            Err(e) => tracing::error!("bad internal address for {}: {}", endpoint, e),
        }
    }

    fn check_state(&self, endpoint: &Endpoint, state: &EndpointState) {
        if let Some(value) = state.application_state(ApplicationKey::InternalIp) {
            self.reconnect(endpoint, &value.value);
        }
    }
}

impl EndpointStateSubscriber for ReconnectHelper {
    fn on_join(&self, endpoint: &Endpoint, state: &EndpointState) {
        self.check_state(endpoint, state);
    }

    fn on_alive(&self, endpoint: &Endpoint, state: &EndpointState) {
        self.check_state(endpoint, state);
    }

    fn on_change(&self, endpoint: &Endpoint, key: ApplicationKey, value: &VersionedValue) {
        if key == ApplicationKey::InternalIp {
            self.reconnect(endpoint, &value.value);
        }
    }
}
