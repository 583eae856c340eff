//! Gossiper
//!
//! Maintains the list of live and dead endpoints for the local node.
//! Every second a gossip task picks a random peer and runs a round of
//! anti-entropy with it: SYN carries state digests, ACK answers with the
//! digests the receiver still needs plus the states the sender lacks,
//! ACK2 completes the exchange with the requested states. Heartbeat
//! arrivals feed the failure detector; its convictions and every other
//! lifecycle transition leave through the event bus after the gossip
//! locks are dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex};

use crate::clock::MonotonicClock;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::gossip::digest::GossipDigest;
use crate::gossip::events::{EndpointEvent, EventBus};
use crate::gossip::failure_detector::FailureDetector;
use crate::gossip::messages::GossipMessage;
use crate::state::{
    ApplicationKey, EndpointState, HeartbeatState, ValueFactory, VersionGenerator,
};
use crate::topology::{LatencySubscriber, SeveritySource, TopologyMetaData};

/// Gossip period, the base unit for every derived timeout
pub const GOSSIP_INTERVAL_MS: u64 = 1000;

/// Expire-time horizon for endpoints that left the cluster (3 days)
pub const VERY_LONG_TIME_MS: i64 = 259_200_000;

/// Generation gap beyond which an incoming state is treated as
/// corruption (about one year of seconds)
const MAX_GENERATION_DIFFERENCE: i64 = 86_400 * 365;

/// Timing knobs for the gossiper
#[derive(Debug, Clone)]
pub struct GossipSettings {
    pub cluster_name: String,
    /// Gossip tick period
    pub interval: Duration,
    /// Upper bound on convergence after a topology change
    pub ring_delay: Duration,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            cluster_name: "wolfpack".to_string(),
            interval: Duration::from_millis(GOSSIP_INTERVAL_MS),
            ring_delay: Duration::from_secs(30),
        }
    }
}

impl GossipSettings {
    /// An evicted endpoint may not be re-admitted before this elapses
    pub fn quarantine_delay(&self) -> Duration {
        self.ring_delay * 2
    }

    /// Silent timeout for gossip-only members
    pub fn fat_client_timeout(&self) -> Duration {
        self.quarantine_delay() / 2
    }
}

/// Tracks inbound message pressure so the status check can skip a tick
/// instead of convicting nodes while the handler queue is backed up
#[derive(Debug, Default)]
pub struct MessageBacklog {
    pending: AtomicUsize,
    last_processed_millis: AtomicU64,
}

impl MessageBacklog {
    pub fn enqueued(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn processed(&self, now_millis: u64) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| p.checked_sub(1));
        self.last_processed_millis
            .store(now_millis, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn last_processed_millis(&self) -> u64 {
        self.last_processed_millis.load(Ordering::SeqCst)
    }
}

/// Everything the gossiper mutates under its state lock
#[derive(Default)]
struct GossipState {
    endpoint_states: HashMap<Endpoint, EndpointState>,
    live: BTreeSet<Endpoint>,
    /// unreachable endpoint -> monotonic nanos when marked down
    unreachable: HashMap<Endpoint, u64>,
    /// quarantined endpoint -> monotonic millis of removal
    just_removed: HashMap<Endpoint, u64>,
    /// endpoint -> wall-clock millis after which a dead state may be evicted
    expire_times: HashMap<Endpoint, i64>,
    /// endpoints probed with an ECHO -> monotonic nanos when sent
    pending_echo: HashMap<Endpoint, u64>,
    in_shadow_round: bool,
}

impl GossipState {
    fn state_newer_than(&self, endpoint: &Endpoint, version: i32) -> Option<EndpointState> {
        self.endpoint_states
            .get(endpoint)
            .and_then(|state| state.newer_than(version))
    }
}

/// Messages, events and latency samples produced under the gossip locks,
/// delivered once they are released
#[derive(Default)]
struct TickOutput {
    events: Vec<EndpointEvent>,
    sends: Vec<(Endpoint, GossipMessage)>,
    timings: Vec<(Endpoint, u64)>,
}

impl TickOutput {
    fn send(&mut self, to: Endpoint, message: GossipMessage) {
        self.sends.push((to, message));
    }

    fn event(&mut self, event: EndpointEvent) {
        self.events.push(event);
    }
}

pub struct Gossiper {
    local: Endpoint,
    settings: GossipSettings,
    clock: MonotonicClock,
    values: ValueFactory,
    failure_detector: Arc<FailureDetector>,
    topology: Arc<TopologyMetaData>,
    events: Arc<EventBus>,
    outbound: mpsc::Sender<(Endpoint, GossipMessage)>,
    backlog: Arc<MessageBacklog>,
    configured_seeds: Vec<Endpoint>,
    seeds: StdRwLock<BTreeSet<Endpoint>>,
    state: StdMutex<GossipState>,
    /// Serializes the gossip tick and every merge; never held across a
    /// subscriber notification or an outbound send
    tick_lock: Mutex<()>,
    latency_subscriber: StdRwLock<Option<Arc<dyn LatencySubscriber>>>,
    running: watch::Sender<bool>,
}

#[allow(clippy::too_many_arguments)]
impl Gossiper {
    pub fn new(
        local: Endpoint,
        settings: GossipSettings,
        seeds: Vec<Endpoint>,
        clock: MonotonicClock,
        versions: Arc<VersionGenerator>,
        failure_detector: Arc<FailureDetector>,
        topology: Arc<TopologyMetaData>,
        events: Arc<EventBus>,
        outbound: mpsc::Sender<(Endpoint, GossipMessage)>,
    ) -> Arc<Self> {
        let (running, _) = watch::channel(false);
        Arc::new(Self {
            local,
            settings,
            clock,
            values: ValueFactory::new(versions),
            failure_detector,
            topology,
            events,
            outbound,
            backlog: Arc::new(MessageBacklog::default()),
            configured_seeds: seeds,
            seeds: StdRwLock::new(BTreeSet::new()),
            state: StdMutex::new(GossipState::default()),
            tick_lock: Mutex::new(()),
            latency_subscriber: StdRwLock::new(None),
            running,
        })
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub fn settings(&self) -> &GossipSettings {
        &self.settings
    }

    pub fn backlog(&self) -> Arc<MessageBacklog> {
        self.backlog.clone()
    }

    pub fn register_subscriber(
        &self,
        subscriber: Arc<dyn crate::gossip::events::EndpointStateSubscriber>,
    ) {
        self.events.register(subscriber);
    }

    /// The transport (or the node's echo path) reports per-message
    /// latencies through this hook
    pub fn set_latency_subscriber(&self, subscriber: Arc<dyn LatencySubscriber>) {
        *self.latency_subscriber.write().unwrap() = Some(subscriber);
    }

    /// Start gossiping with the given generation, preloading local
    /// application states before the first round
    pub fn start(
        self: Arc<Self>,
        generation: i32,
        preload: Vec<(ApplicationKey, String)>,
    ) -> tokio::task::JoinHandle<()> {
        self.build_seeds_list();
        {
            let mut state = self.state.lock().unwrap();
            let now = self.clock.now_nanos();
            state
                .endpoint_states
                .entry(self.local.clone())
                .or_insert_with(|| EndpointState::new(HeartbeatState::new(generation), now));
            let local_state = state.endpoint_states.get_mut(&self.local).unwrap();
            for (key, value) in preload {
                let value = self.values.raw(value);
                local_state.add_application_state(key, value);
            }
            tracing::debug!(
                "gossip starting with generation {}",
                local_state.generation()
            );

            // Seed endpoints enter the map at generation 0 and dead, the
            // same way saved endpoints do: the first syn then carries a
            // digest for them and the seed answers with its full state.
            let seeds: Vec<Endpoint> = self.seeds.read().unwrap().iter().cloned().collect();
            for seed in seeds {
                state.endpoint_states.entry(seed).or_insert_with(|| {
                    let mut ep_state = EndpointState::new(HeartbeatState::new(0), now);
                    ep_state.mark_dead();
                    ep_state
                });
            }
        }

        self.running.send_replace(true);
        let mut shutdown = self.running.subscribe();
        let gossiper = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gossiper.settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        gossiper.run_tick().await;
                    }
                    _ = shutdown.changed() => {
                        if !*shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Stop the gossip task, announce shutdown to live peers and give the
    /// broadcast time to drain
    pub async fn stop(&self) {
        self.running.send_replace(false);
        tracing::info!("Announcing shutdown");
        let live: Vec<Endpoint> = {
            let state = self.state.lock().unwrap();
            state.live.iter().cloned().collect()
        };
        for endpoint in live {
            self.send_outbound(endpoint, GossipMessage::Shutdown).await;
        }
        tokio::time::sleep(self.settings.interval * 2).await;
    }

    pub fn is_enabled(&self) -> bool {
        *self.running.borrow()
    }

    fn build_seeds_list(&self) {
        let mut seeds = self.seeds.write().unwrap();
        seeds.clear();
        for seed in &self.configured_seeds {
            if *seed != self.local {
                seeds.insert(seed.clone());
            }
        }
    }

    // ---------- periodic tick ----------

    async fn run_tick(&self) {
        let output = {
            let _tick = self.tick_lock.lock().await;
            let mut out = TickOutput::default();
            {
                let mut state = self.state.lock().unwrap();
                self.tick_locked(&mut state, &mut out);
            }
            out
        };
        self.flush(output).await;
    }

    fn tick_locked(&self, state: &mut GossipState, out: &mut TickOutput) {
        if let Some(local_state) = state.endpoint_states.get_mut(&self.local) {
            local_state.heartbeat_mut().update(self.values_generator());
            tracing::trace!(
                "my heartbeat is now {}",
                local_state.heartbeat().version
            );
        }

        let digests = self.make_random_digests(state);
        if digests.is_empty() {
            return;
        }
        let syn = GossipMessage::Syn {
            cluster_name: self.settings.cluster_name.clone(),
            digests,
        };

        let live: Vec<Endpoint> = state.live.iter().cloned().collect();
        let unreachable: Vec<Endpoint> = state.unreachable.keys().cloned().collect();
        let seeds: Vec<Endpoint> = self.seeds.read().unwrap().iter().cloned().collect();
        let mut rng = rand::thread_rng();

        // gossip to some random live member
        let mut gossiped_to_seed = false;
        if let Some(to) = live.choose(&mut rng) {
            tracing::trace!("sending a GossipDigestSyn to {}", to);
            out.send(to.clone(), syn.clone());
            gossiped_to_seed = seeds.contains(to);
        }

        // gossip to some unreachable member with some probability to
        // check if it is back up
        if !unreachable.is_empty() {
            let probability = unreachable.len() as f64 / (live.len() as f64 + 1.0);
            if rng.gen::<f64>() < probability {
                if let Some(to) = unreachable.choose(&mut rng) {
                    out.send(to.clone(), syn.clone());
                }
            }
        }

        // Gossip to a seed if we did not do so above, or we have seen
        // fewer nodes than there are seeds. In a partition every live
        // subcluster keeps exchanging state with a seed and re-converges.
        if !gossiped_to_seed || live.len() < seeds.len() {
            if !seeds.is_empty() {
                if live.is_empty() {
                    if let Some(to) = seeds.choose(&mut rng) {
                        out.send(to.clone(), syn);
                    }
                } else {
                    let probability =
                        seeds.len() as f64 / (live.len() + unreachable.len()) as f64;
                    if rng.gen::<f64>() <= probability {
                        if let Some(to) = seeds.choose(&mut rng) {
                            out.send(to.clone(), syn);
                        }
                    }
                }
            }
        }

        self.status_check(state, out);
    }

    fn values_generator(&self) -> &VersionGenerator {
        self.values.generator()
    }

    /// Digest list over every known endpoint, shuffled rather than in map
    /// order
    fn make_random_digests(&self, state: &GossipState) -> Vec<GossipDigest> {
        let mut endpoints: Vec<Endpoint> = state.endpoint_states.keys().cloned().collect();
        endpoints.shuffle(&mut rand::thread_rng());
        endpoints
            .into_iter()
            .map(|endpoint| {
                let ep_state = &state.endpoint_states[&endpoint];
                GossipDigest::new(
                    endpoint.clone(),
                    ep_state.generation(),
                    ep_state.max_version(),
                )
            })
            .collect()
    }

    fn status_check(&self, state: &mut GossipState, out: &mut TickOutput) {
        let now_millis = self.clock.now_millis();
        if self.backlog.pending() > 0
            && self.backlog.last_processed_millis() + 1000 < now_millis
        {
            tracing::warn!(
                "gossip handlers have {} pending messages; skipping status check (no nodes will be marked down)",
                self.backlog.pending()
            );
            return;
        }

        let now_nanos = self.clock.now_nanos();
        let wall_millis = chrono::Utc::now().timestamp_millis();
        let fat_client_timeout_nanos = self.settings.fat_client_timeout().as_nanos() as u64;

        let endpoints: Vec<Endpoint> = state.endpoint_states.keys().cloned().collect();
        for endpoint in endpoints {
            if endpoint == self.local {
                continue;
            }

            if let Some(conviction) = self.failure_detector.interpret(&endpoint) {
                self.convict_locked(state, out, &endpoint, conviction.phi);
            }

            let Some(ep_state) = state.endpoint_states.get(&endpoint) else {
                continue;
            };
            let update_stamp = ep_state.update_timestamp_nanos();
            let alive = ep_state.is_alive();

            // Fat clients are dropped from gossip automatically after the
            // silent timeout; dead states are kept until their expire time.
            if self.is_gossip_only_member_locked(state, &endpoint)
                && !state.just_removed.contains_key(&endpoint)
                && now_nanos.saturating_sub(update_stamp) > fat_client_timeout_nanos
            {
                tracing::info!(
                    "FatClient {} has been silent for {}ms, removing from gossip",
                    endpoint,
                    self.settings.fat_client_timeout().as_millis()
                );
                self.remove_endpoint_locked(state, out, &endpoint, now_millis);
                self.evict_locked(state, &endpoint, now_millis);
                continue;
            }

            let expire_time = state
                .expire_times
                .get(&endpoint)
                .copied()
                .unwrap_or_else(Self::compute_expire_time);
            if !alive && wall_millis > expire_time && !self.topology.is_member(&endpoint) {
                tracing::debug!("time is expiring for endpoint: {} ({})", endpoint, expire_time);
                self.evict_locked(state, &endpoint, now_millis);
            }
        }

        let quarantine_millis = self.settings.quarantine_delay().as_millis() as u64;
        state.just_removed.retain(|endpoint, stamp| {
            if now_millis.saturating_sub(*stamp) > quarantine_millis {
                tracing::debug!("{} gossip quarantine over", endpoint);
                false
            } else {
                true
            }
        });
    }

    // ---------- inbound messages ----------

    pub async fn handle_message(&self, from: Endpoint, message: GossipMessage) {
        self.backlog.processed(self.clock.now_millis());
        let output = {
            let _tick = self.tick_lock.lock().await;
            let mut out = TickOutput::default();
            {
                let mut state = self.state.lock().unwrap();
                match message {
                    GossipMessage::Syn {
                        cluster_name,
                        digests,
                    } => self.handle_syn(&mut state, &mut out, &from, cluster_name, digests),
                    GossipMessage::Ack { digests, states } => {
                        self.handle_ack(&mut state, &mut out, &from, digests, states)
                    }
                    GossipMessage::Ack2 { states } => {
                        self.handle_ack2(&mut state, &mut out, states)
                    }
                    GossipMessage::Shutdown => self.handle_shutdown(&mut state, &mut out, &from),
                    GossipMessage::Echo => out.send(from.clone(), GossipMessage::EchoResponse),
                    GossipMessage::EchoResponse => {
                        self.handle_echo_response(&mut state, &mut out, &from)
                    }
                }
            }
            out
        };
        self.flush(output).await;
    }

    fn handle_syn(
        &self,
        state: &mut GossipState,
        out: &mut TickOutput,
        from: &Endpoint,
        cluster_name: String,
        mut digests: Vec<GossipDigest>,
    ) {
        if cluster_name != self.settings.cluster_name {
            tracing::warn!(
                "ClusterName mismatch from {}: {} != {}",
                from,
                cluster_name,
                self.settings.cluster_name
            );
            return;
        }

        if digests.is_empty() {
            // A completely empty syn never happens in a normal round: the
            // peer is shadow gossiping, so reply with everything we know.
            tracing::debug!("shadow request received, adding all states");
            digests = state
                .endpoint_states
                .keys()
                .map(|endpoint| GossipDigest::new(endpoint.clone(), 0, 0))
                .collect();
        }

        let (delta_digests, delta_states) = self.examine_digests(state, &digests);
        out.send(
            from.clone(),
            GossipMessage::Ack {
                digests: delta_digests,
                states: delta_states,
            },
        );
    }

    fn handle_ack(
        &self,
        state: &mut GossipState,
        out: &mut TickOutput,
        from: &Endpoint,
        digests: Vec<GossipDigest>,
        states: Vec<(Endpoint, EndpointState)>,
    ) {
        if !states.is_empty() {
            self.notify_failure_detector(state, &states);
            self.apply_state_locally(state, out, states);
        }

        if state.in_shadow_round {
            tracing::debug!("finishing shadow round with {}", from);
            state.in_shadow_round = false;
            return;
        }

        let mut reply = Vec::new();
        for digest in digests {
            if let Some(partial) = state.state_newer_than(&digest.endpoint, digest.max_version) {
                reply.push((digest.endpoint.clone(), partial));
            }
        }
        out.send(from.clone(), GossipMessage::Ack2 { states: reply });
    }

    fn handle_ack2(
        &self,
        state: &mut GossipState,
        out: &mut TickOutput,
        states: Vec<(Endpoint, EndpointState)>,
    ) {
        self.notify_failure_detector(state, &states);
        self.apply_state_locally(state, out, states);
    }

    fn handle_shutdown(&self, state: &mut GossipState, out: &mut TickOutput, from: &Endpoint) {
        let Some(ep_state) = state.endpoint_states.get(from) else {
            return;
        };
        if ep_state.is_alive() {
            self.mark_dead_locked(state, out, from);
        }
    }

    fn handle_echo_response(
        &self,
        state: &mut GossipState,
        out: &mut TickOutput,
        from: &Endpoint,
    ) {
        if let Some(sent_nanos) = state.pending_echo.remove(from) {
            let rtt = self.clock.now_nanos().saturating_sub(sent_nanos);
            out.timings.push((from.clone(), rtt));
            self.real_mark_alive_locked(state, out, from);
        }
    }

    /// Figure the state we have that the peer lacks and the digests we
    /// still need, per the anti-entropy comparison table
    fn examine_digests(
        &self,
        state: &GossipState,
        digests: &[GossipDigest],
    ) -> (Vec<GossipDigest>, Vec<(Endpoint, EndpointState)>) {
        let mut delta_digests = Vec::new();
        let mut delta_states = Vec::new();

        for digest in digests {
            let remote_generation = digest.generation;
            let remote_max_version = digest.max_version;
            let Some(local_state) = state.endpoint_states.get(&digest.endpoint) else {
                // nothing local: request everything
                delta_digests.push(GossipDigest::new(
                    digest.endpoint.clone(),
                    remote_generation,
                    0,
                ));
                continue;
            };

            let local_generation = local_state.generation();
            let local_max_version = local_state.max_version();
            if remote_generation == local_generation && remote_max_version == local_max_version {
                continue;
            }

            if remote_generation > local_generation {
                delta_digests.push(GossipDigest::new(
                    digest.endpoint.clone(),
                    remote_generation,
                    0,
                ));
            } else if remote_generation < local_generation {
                // send everything at version > 0
                if let Some(partial) = state.state_newer_than(&digest.endpoint, 0) {
                    delta_states.push((digest.endpoint.clone(), partial));
                }
            } else if remote_max_version > local_max_version {
                delta_digests.push(GossipDigest::new(
                    digest.endpoint.clone(),
                    remote_generation,
                    local_max_version,
                ));
            } else if remote_max_version < local_max_version {
                if let Some(partial) =
                    state.state_newer_than(&digest.endpoint, remote_max_version)
                {
                    delta_states.push((digest.endpoint.clone(), partial));
                }
            }
        }

        (delta_digests, delta_states)
    }

    // ---------- merging ----------

    fn apply_state_locally(
        &self,
        state: &mut GossipState,
        out: &mut TickOutput,
        remote_states: Vec<(Endpoint, EndpointState)>,
    ) {
        for (endpoint, remote_state) in remote_states {
            if endpoint == self.local && !state.in_shadow_round {
                continue;
            }
            if state.just_removed.contains_key(&endpoint) {
                tracing::trace!("ignoring gossip for {} because it is quarantined", endpoint);
                continue;
            }

            let Some(local_state) = state.endpoint_states.get(&endpoint) else {
                // first time we see this node
                self.failure_detector.report(&endpoint);
                self.handle_major_state_change(state, out, &endpoint, remote_state);
                continue;
            };

            let local_generation = local_state.generation();
            let remote_generation = remote_state.generation();
            if local_generation != 0
                && remote_generation as i64 > local_generation as i64 + MAX_GENERATION_DIFFERENCE
            {
                // assume some peer has corrupted memory and is
                // broadcasting an unbelievable generation
                tracing::warn!(
                    "received an invalid gossip generation for peer {}; local generation = {}, received generation = {}",
                    endpoint,
                    local_generation,
                    remote_generation
                );
            } else if remote_generation > local_generation {
                self.handle_major_state_change(state, out, &endpoint, remote_state);
            } else if remote_generation == local_generation {
                let local_max_version = local_state.max_version();
                let remote_max_version = remote_state.max_version();
                if remote_max_version > local_max_version {
                    self.apply_new_states(state, out, &endpoint, remote_state);
                } else {
                    tracing::trace!(
                        "ignoring remote version {} <= {} for {}",
                        remote_max_version,
                        local_max_version,
                        endpoint
                    );
                }
                let ep_state = &state.endpoint_states[&endpoint];
                if !ep_state.is_alive() && !ep_state.is_dead_state() {
                    self.mark_alive_locked(state, out, &endpoint);
                }
            } else {
                tracing::trace!(
                    "ignoring remote generation {} < {}",
                    remote_generation,
                    local_generation
                );
            }
        }
    }

    /// Generation change: wholly replace the local state and walk the
    /// restart -> alive/dead -> join sequence
    fn handle_major_state_change(
        &self,
        state: &mut GossipState,
        out: &mut TickOutput,
        endpoint: &Endpoint,
        remote_state: EndpointState,
    ) {
        let dead = remote_state.is_dead_state();
        if !dead {
            if state.endpoint_states.contains_key(endpoint) {
                tracing::info!("Node {} has restarted, now UP", endpoint);
            } else {
                tracing::info!("Node {} is now part of the cluster", endpoint);
            }
        }

        let mut fresh = remote_state;
        fresh.touch(self.clock.now_nanos());
        state.endpoint_states.insert(endpoint.clone(), fresh);
        let snapshot = state.endpoint_states[endpoint].clone();
        out.event(EndpointEvent::Restart(endpoint.clone(), snapshot.clone()));

        if !dead {
            self.mark_alive_locked(state, out, endpoint);
        } else {
            tracing::debug!("not marking {} alive due to dead state", endpoint);
            self.mark_dead_locked(state, out, endpoint);
        }
        let snapshot = state.endpoint_states[endpoint].clone();
        out.event(EndpointEvent::Join(endpoint.clone(), snapshot));
    }

    /// Same generation, newer versions: write every entry, then fire the
    /// change notifications, so observers see a consistent snapshot
    fn apply_new_states(
        &self,
        state: &mut GossipState,
        out: &mut TickOutput,
        endpoint: &Endpoint,
        remote_state: EndpointState,
    ) {
        let local_state = state.endpoint_states.get_mut(endpoint).unwrap();
        let old_version = local_state.heartbeat().version;
        local_state.set_heartbeat(remote_state.heartbeat());
        tracing::trace!(
            "updating heartbeat state version to {} from {} for {}",
            local_state.heartbeat().version,
            old_version,
            endpoint
        );

        let mut changed: Vec<(ApplicationKey, crate::state::VersionedValue)> = remote_state
            .application_states()
            .map(|(key, value)| (key, value.clone()))
            .collect();
        for (key, value) in &changed {
            local_state.add_application_state(*key, value.clone());
        }
        local_state.touch(self.clock.now_nanos());

        // notifications in version order
        changed.sort_by_key(|(_, value)| value.version);
        for (key, value) in changed {
            out.event(EndpointEvent::Change(endpoint.clone(), key, value));
        }
    }

    fn notify_failure_detector(
        &self,
        state: &mut GossipState,
        remote_states: &[(Endpoint, EndpointState)],
    ) {
        for (endpoint, remote_state) in remote_states {
            let Some(local_state) = state.endpoint_states.get_mut(endpoint) else {
                continue;
            };
            let local_generation = local_state.generation();
            let remote_generation = remote_state.generation();
            if remote_generation > local_generation {
                local_state.touch(self.clock.now_nanos());
                if !local_state.is_alive() {
                    // dead node with a changed generation: a reboot or a
                    // takeover, so clear the intervals and relearn them
                    tracing::debug!(
                        "clearing interval times for {} due to generation change",
                        endpoint
                    );
                    self.failure_detector.remove(endpoint);
                }
                self.failure_detector.report(endpoint);
            } else if remote_generation == local_generation {
                let local_max_version = local_state.max_version();
                let remote_version = remote_state.heartbeat().version;
                if remote_version > local_max_version {
                    local_state.touch(self.clock.now_nanos());
                    self.failure_detector.report(endpoint);
                }
            }
        }
    }

    // ---------- liveness transitions ----------

    /// First phase of marking alive: probe with an ECHO; only the
    /// response flips the endpoint to live, which avoids flapping on a
    /// single bidirectional gossip message
    fn mark_alive_locked(&self, state: &mut GossipState, out: &mut TickOutput, endpoint: &Endpoint) {
        if let Some(ep_state) = state.endpoint_states.get_mut(endpoint) {
            ep_state.mark_dead();
        }
        tracing::trace!("sending an EchoMessage to {}", endpoint);
        state
            .pending_echo
            .insert(endpoint.clone(), self.clock.now_nanos());
        out.send(endpoint.clone(), GossipMessage::Echo);
    }

    fn real_mark_alive_locked(
        &self,
        state: &mut GossipState,
        out: &mut TickOutput,
        endpoint: &Endpoint,
    ) {
        let Some(ep_state) = state.endpoint_states.get_mut(endpoint) else {
            return;
        };
        ep_state.mark_alive();
        // prevents the status check from racing us and evicting a node
        // that was down longer than the expire horizon
        ep_state.touch(self.clock.now_nanos());
        let snapshot = ep_state.clone();
        state.live.insert(endpoint.clone());
        state.unreachable.remove(endpoint);
        state.expire_times.remove(endpoint);
        tracing::info!("Node {} is now UP", endpoint);
        out.event(EndpointEvent::Alive(endpoint.clone(), snapshot));
    }

    fn mark_dead_locked(&self, state: &mut GossipState, out: &mut TickOutput, endpoint: &Endpoint) {
        let Some(ep_state) = state.endpoint_states.get_mut(endpoint) else {
            return;
        };
        ep_state.mark_dead();
        let snapshot = ep_state.clone();
        state.live.remove(endpoint);
        state
            .unreachable
            .insert(endpoint.clone(), self.clock.now_nanos());
        tracing::info!("Node {} is now DOWN", endpoint);
        out.event(EndpointEvent::Dead(endpoint.clone(), snapshot));
    }

    fn convict_locked(
        &self,
        state: &mut GossipState,
        out: &mut TickOutput,
        endpoint: &Endpoint,
        phi: f64,
    ) {
        let Some(ep_state) = state.endpoint_states.get(endpoint) else {
            return;
        };
        if ep_state.is_alive() && !ep_state.is_dead_state() {
            tracing::debug!("convicting {} with phi {:.2}", endpoint, phi);
            self.mark_dead_locked(state, out, endpoint);
        } else {
            let ep_state = state.endpoint_states.get_mut(endpoint).unwrap();
            ep_state.mark_dead();
        }
    }

    /// Operator path: convict regardless of the arrival window
    pub async fn force_convict(&self, endpoint: &Endpoint) {
        let conviction = self.failure_detector.force_conviction(endpoint);
        let output = {
            let _tick = self.tick_lock.lock().await;
            let mut out = TickOutput::default();
            {
                let mut state = self.state.lock().unwrap();
                self.convict_locked(&mut state, &mut out, endpoint, conviction.phi);
            }
            out
        };
        self.flush(output).await;
    }

    // ---------- removal, quarantine, assassination ----------

    fn remove_endpoint_locked(
        &self,
        state: &mut GossipState,
        out: &mut TickOutput,
        endpoint: &Endpoint,
        now_millis: u64,
    ) {
        out.event(EndpointEvent::Remove(endpoint.clone()));

        {
            let mut seeds = self.seeds.write().unwrap();
            if seeds.remove(endpoint) {
                tracing::info!("removed {} from seeds, updated seeds list = {:?}", endpoint, seeds);
            }
        }

        state.live.remove(endpoint);
        state.unreachable.remove(endpoint);
        // the endpoint state itself stays until the quarantine expires
        self.failure_detector.remove(endpoint);
        state.just_removed.insert(endpoint.clone(), now_millis);
        tracing::debug!("removing endpoint {}", endpoint);
    }

    fn evict_locked(&self, state: &mut GossipState, endpoint: &Endpoint, now_millis: u64) {
        state.unreachable.remove(endpoint);
        state.endpoint_states.remove(endpoint);
        state.expire_times.remove(endpoint);
        state.just_removed.insert(endpoint.clone(), now_millis);
        tracing::debug!("evicting {} from gossip", endpoint);
    }

    /// Force-removes an endpoint from the ring by spoofing a newer
    /// generation with a LEFT status. Waits `ring_delay` and re-checks
    /// the generation and heartbeat to detect concurrent activity.
    pub async fn assassinate(&self, endpoint: &Endpoint) -> Result<()> {
        tracing::warn!("Assassinating {} via gossip", endpoint);
        let observed = {
            let state = self.state.lock().unwrap();
            state
                .endpoint_states
                .get(endpoint)
                .map(|s| (s.generation(), s.heartbeat().version))
        };

        if observed.is_some() {
            tracing::info!(
                "Sleeping for {}ms to ensure {} does not change",
                self.settings.ring_delay.as_millis(),
                endpoint
            );
            tokio::time::sleep(self.settings.ring_delay).await;
        }

        let output = {
            let _tick = self.tick_lock.lock().await;
            let mut out = TickOutput::default();
            {
                let mut state = self.state.lock().unwrap();
                let spoofed = match (observed, state.endpoint_states.get(endpoint)) {
                    (Some(_), None) => {
                        tracing::warn!(
                            "Endpoint {} disappeared while trying to assassinate, continuing anyway",
                            endpoint
                        );
                        self.blank_assassination_state()
                    }
                    (Some((generation, heartbeat)), Some(current)) => {
                        if current.generation() != generation
                            || current.heartbeat().version != heartbeat
                        {
                            return Err(Error::EndpointStillAlive(endpoint.to_string()));
                        }
                        let mut spoofed = current.clone();
                        spoofed.touch(self.clock.now_nanos());
                        spoofed.heartbeat_mut().force_newer_generation();
                        spoofed
                    }
                    (None, _) => self.blank_assassination_state(),
                };

                let mut spoofed = spoofed;
                spoofed.add_application_state(
                    ApplicationKey::Status,
                    self.values.left(Self::compute_expire_time()),
                );
                self.handle_major_state_change(&mut state, &mut out, endpoint, spoofed);
            }
            out
        };
        self.flush(output).await;
        tokio::time::sleep(self.settings.interval * 4).await;
        tracing::warn!("Finished assassinating {}", endpoint);
        Ok(())
    }

    fn blank_assassination_state(&self) -> EndpointState {
        // a generation a minute in the future beats whatever the victim
        // may still be gossiping
        let generation = (chrono::Utc::now().timestamp() + 60) as i32;
        EndpointState::new(
            HeartbeatState::with_version(generation, 9999),
            self.clock.now_nanos(),
        )
    }

    pub fn compute_expire_time() -> i64 {
        chrono::Utc::now().timestamp_millis() + VERY_LONG_TIME_MS
    }

    pub fn add_expire_time(&self, endpoint: &Endpoint, expire_time_millis: i64) {
        tracing::debug!(
            "adding expire time for endpoint: {} ({})",
            endpoint,
            expire_time_millis
        );
        let mut state = self.state.lock().unwrap();
        state
            .expire_times
            .insert(endpoint.clone(), expire_time_millis);
    }

    // ---------- local state updates ----------

    /// Assign the next version to a local application state and announce
    /// the change. Raises the version after the before-change
    /// notifications, so the value cannot lose to a remote update applied
    /// while they ran.
    pub async fn apply_local_state(&self, key: ApplicationKey, value: String) {
        self.apply_local_states(vec![(key, value)]).await;
    }

    pub async fn apply_local_states(&self, updates: Vec<(ApplicationKey, String)>) {
        let output = {
            let _tick = self.tick_lock.lock().await;
            let mut out = TickOutput::default();
            {
                let mut state = self.state.lock().unwrap();
                for (key, value) in updates {
                    let Some(local_state) = state.endpoint_states.get(&self.local) else {
                        tracing::warn!("local state not initialized; dropping {:?} update", key);
                        continue;
                    };
                    let initial = self.values.raw(value);
                    out.event(EndpointEvent::BeforeChange(
                        self.local.clone(),
                        local_state.clone(),
                        key,
                        initial.clone(),
                    ));
                    let raised = self.values.clone_with_higher_version(&initial);
                    let local_state = state.endpoint_states.get_mut(&self.local).unwrap();
                    local_state.add_application_state(key, raised.clone());
                    local_state.touch(self.clock.now_nanos());
                    out.event(EndpointEvent::Change(self.local.clone(), key, raised));
                }
            }
            out
        };
        self.flush(output).await;
    }

    // ---------- shadow round and saved endpoints ----------

    /// A single round that only collects state: send an empty syn to
    /// every seed and wait for the first ack. Used when replacing a node.
    pub async fn do_shadow_round(&self) -> Result<()> {
        self.build_seeds_list();
        let seeds: Vec<Endpoint> = self.seeds.read().unwrap().iter().cloned().collect();
        if seeds.is_empty() {
            return Err(Error::Config("no seeds to shadow gossip with".into()));
        }
        {
            let mut state = self.state.lock().unwrap();
            state.in_shadow_round = true;
        }
        for seed in seeds {
            self.send_outbound(
                seed,
                GossipMessage::Syn {
                    cluster_name: self.settings.cluster_name.clone(),
                    digests: Vec::new(),
                },
            )
            .await;
        }

        let mut slept = Duration::ZERO;
        loop {
            tokio::time::sleep(self.settings.interval).await;
            if !self.state.lock().unwrap().in_shadow_round {
                return Ok(());
            }
            slept += self.settings.interval;
            if slept > self.settings.ring_delay {
                return Err(Error::Internal("unable to gossip with any seeds".into()));
            }
        }
    }

    /// Re-seed the map with an endpoint we knew before a restart but
    /// whose state is unknown; the first real gossip refreshes it
    pub fn add_saved_endpoint(&self, endpoint: &Endpoint) {
        if *endpoint == self.local {
            tracing::debug!("attempt to add self as saved endpoint");
            return;
        }
        let mut state = self.state.lock().unwrap();
        let now = self.clock.now_nanos();
        let ep_state = state
            .endpoint_states
            .entry(endpoint.clone())
            .or_insert_with(|| EndpointState::new(HeartbeatState::new(0), now));
        ep_state.set_heartbeat(HeartbeatState::new(0));
        ep_state.mark_dead();
        state.unreachable.insert(endpoint.clone(), now);
        tracing::trace!("adding saved endpoint {}", endpoint);
    }

    // ---------- accessors ----------

    pub fn live_members(&self) -> BTreeSet<Endpoint> {
        let state = self.state.lock().unwrap();
        let mut live = state.live.clone();
        live.insert(self.local.clone());
        live
    }

    pub fn unreachable_members(&self) -> BTreeSet<Endpoint> {
        let state = self.state.lock().unwrap();
        state.unreachable.keys().cloned().collect()
    }

    pub fn endpoint_state(&self, endpoint: &Endpoint) -> Option<EndpointState> {
        let state = self.state.lock().unwrap();
        state.endpoint_states.get(endpoint).cloned()
    }

    pub fn endpoint_states(&self) -> Vec<(Endpoint, EndpointState)> {
        let state = self.state.lock().unwrap();
        state
            .endpoint_states
            .iter()
            .map(|(endpoint, ep_state)| (endpoint.clone(), ep_state.clone()))
            .collect()
    }

    pub fn is_known_endpoint(&self, endpoint: &Endpoint) -> bool {
        let state = self.state.lock().unwrap();
        state.endpoint_states.contains_key(endpoint)
    }

    pub fn is_alive(&self, endpoint: &Endpoint) -> bool {
        if *endpoint == self.local {
            return true;
        }
        let state = self.state.lock().unwrap();
        match state.endpoint_states.get(endpoint) {
            Some(ep_state) => ep_state.is_alive(),
            None => {
                tracing::error!("unknown endpoint {}", endpoint);
                false
            }
        }
    }

    /// A gossip participant that is not a topology member ("fat client")
    pub fn is_gossip_only_member(&self, endpoint: &Endpoint) -> bool {
        let state = self.state.lock().unwrap();
        self.is_gossip_only_member_locked(&state, endpoint)
    }

    fn is_gossip_only_member_locked(&self, state: &GossipState, endpoint: &Endpoint) -> bool {
        match state.endpoint_states.get(endpoint) {
            Some(ep_state) => !ep_state.is_dead_state() && !self.topology.is_member(endpoint),
            None => false,
        }
    }

    pub fn current_generation(&self, endpoint: &Endpoint) -> Option<i32> {
        let state = self.state.lock().unwrap();
        state
            .endpoint_states
            .get(endpoint)
            .map(|ep_state| ep_state.generation())
    }

    /// Milliseconds the endpoint has been unreachable, 0 when live
    pub fn endpoint_downtime(&self, endpoint: &Endpoint) -> u64 {
        let state = self.state.lock().unwrap();
        match state.unreachable.get(endpoint) {
            Some(since_nanos) => self.clock.now_nanos().saturating_sub(*since_nanos) / 1_000_000,
            None => 0,
        }
    }

    /// Which endpoint started up earlier, by generation
    pub fn compare_endpoint_startup(
        &self,
        a: &Endpoint,
        b: &Endpoint,
    ) -> Option<std::cmp::Ordering> {
        let state = self.state.lock().unwrap();
        let generation_a = state.endpoint_states.get(a)?.generation();
        let generation_b = state.endpoint_states.get(b)?.generation();
        Some(generation_a.cmp(&generation_b))
    }

    pub fn simple_states(&self) -> HashMap<String, String> {
        let state = self.state.lock().unwrap();
        state
            .endpoint_states
            .iter()
            .map(|(endpoint, ep_state)| {
                let status = if ep_state.is_alive() { "UP" } else { "DOWN" };
                (endpoint.to_string(), status.to_string())
            })
            .collect()
    }

    pub fn up_endpoint_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .endpoint_states
            .values()
            .filter(|ep_state| ep_state.is_alive())
            .count()
    }

    pub fn down_endpoint_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .endpoint_states
            .values()
            .filter(|ep_state| !ep_state.is_alive())
            .count()
    }

    pub fn all_endpoint_states(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut output = String::new();
        for (endpoint, ep_state) in &state.endpoint_states {
            output.push_str(&endpoint.to_string());
            output.push('\n');
            output.push_str(&ep_state.to_string());
        }
        output
    }

    // ---------- plumbing ----------

    async fn flush(&self, output: TickOutput) {
        self.events.publish_all(output.events);
        if !output.timings.is_empty() {
            let subscriber = self.latency_subscriber.read().unwrap().clone();
            if let Some(subscriber) = subscriber {
                for (endpoint, latency_nanos) in output.timings {
                    subscriber.receive_timing(&endpoint, latency_nanos);
                }
            }
        }
        for (to, message) in output.sends {
            self.send_outbound(to, message).await;
        }
    }

    async fn send_outbound(&self, to: Endpoint, message: GossipMessage) {
        if self.outbound.send((to, message)).await.is_err() {
            tracing::debug!("outbound channel closed; dropping gossip message");
        }
    }
}

impl SeveritySource for Gossiper {
    fn severity_of(&self, endpoint: &Endpoint) -> f64 {
        self.endpoint_state(endpoint)
            .and_then(|state| {
                state
                    .application_state(ApplicationKey::Severity)
                    .and_then(|value| value.value.parse::<f64>().ok())
            })
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::events::EndpointStateSubscriber;
    use crate::gossip::failure_detector::FailureDetectorConfig;
    use crate::state::{status, VersionedValue};
    use std::sync::Mutex as TestMutex;

    struct TestNode {
        gossiper: Arc<Gossiper>,
        outbound_rx: mpsc::Receiver<(Endpoint, GossipMessage)>,
    }

    fn settings() -> GossipSettings {
        GossipSettings {
            cluster_name: "test-pack".to_string(),
            interval: Duration::from_millis(10),
            ring_delay: Duration::from_millis(50),
        }
    }

    fn make_node(host: &str, seeds: Vec<Endpoint>) -> TestNode {
        make_node_with(host, seeds, settings())
    }

    fn make_node_with(host: &str, seeds: Vec<Endpoint>, settings: GossipSettings) -> TestNode {
        let local = Endpoint::new(host, 7946);
        let clock = MonotonicClock::new();
        let versions = Arc::new(VersionGenerator::new());
        let failure_detector = Arc::new(FailureDetector::new(
            FailureDetectorConfig::default(),
            clock,
        ));
        let topology = Arc::new(TopologyMetaData::new());
        let events = Arc::new(EventBus::new());
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let gossiper = Gossiper::new(
            local,
            settings,
            seeds,
            clock,
            versions,
            failure_detector,
            topology,
            events,
            outbound_tx,
        );
        TestNode {
            gossiper,
            outbound_rx,
        }
    }

    fn start_node(node: &TestNode, generation: i32) {
        // initialize state without spawning the periodic task
        node.gossiper.build_seeds_list();
        let mut state = node.gossiper.state.lock().unwrap();
        let now = node.gossiper.clock.now_nanos();
        state.endpoint_states.insert(
            node.gossiper.local.clone(),
            EndpointState::new(HeartbeatState::new(generation), now),
        );
        let seeds: Vec<Endpoint> = node.gossiper.seeds.read().unwrap().iter().cloned().collect();
        for seed in seeds {
            state.endpoint_states.entry(seed).or_insert_with(|| {
                let mut ep_state = EndpointState::new(HeartbeatState::new(0), now);
                ep_state.mark_dead();
                ep_state
            });
        }
    }

    /// Deliver every queued message until all outboxes are empty
    async fn route(nodes: &mut [TestNode]) {
        loop {
            let mut batch = Vec::new();
            for node in nodes.iter_mut() {
                let from = node.gossiper.local_endpoint().clone();
                while let Ok((to, message)) = node.outbound_rx.try_recv() {
                    batch.push((from.clone(), to, message));
                }
            }
            if batch.is_empty() {
                return;
            }
            for (from, to, message) in batch {
                let target = nodes
                    .iter()
                    .find(|node| *node.gossiper.local_endpoint() == to)
                    .map(|node| node.gossiper.clone());
                if let Some(gossiper) = target {
                    gossiper.handle_message(from, message).await;
                }
            }
        }
    }

    fn remote_state(generation: i32, version: i32) -> EndpointState {
        EndpointState::new(HeartbeatState::with_version(generation, version), 0)
    }

    #[derive(Default)]
    struct EventRecorder {
        log: TestMutex<Vec<String>>,
    }

    impl EndpointStateSubscriber for EventRecorder {
        fn on_join(&self, endpoint: &Endpoint, _state: &EndpointState) {
            self.log.lock().unwrap().push(format!("join:{}", endpoint));
        }
        fn on_restart(&self, endpoint: &Endpoint, _state: &EndpointState) {
            self.log
                .lock()
                .unwrap()
                .push(format!("restart:{}", endpoint));
        }
        fn on_alive(&self, endpoint: &Endpoint, _state: &EndpointState) {
            self.log.lock().unwrap().push(format!("alive:{}", endpoint));
        }
        fn on_dead(&self, endpoint: &Endpoint, _state: &EndpointState) {
            self.log.lock().unwrap().push(format!("dead:{}", endpoint));
        }
        fn on_remove(&self, endpoint: &Endpoint) {
            self.log
                .lock()
                .unwrap()
                .push(format!("remove:{}", endpoint));
        }
        fn before_change(
            &self,
            endpoint: &Endpoint,
            _state: &EndpointState,
            key: ApplicationKey,
            _new_value: &VersionedValue,
        ) {
            self.log
                .lock()
                .unwrap()
                .push(format!("before_change:{}:{:?}", endpoint, key));
        }
        fn on_change(&self, endpoint: &Endpoint, key: ApplicationKey, _value: &VersionedValue) {
            self.log
                .lock()
                .unwrap()
                .push(format!("change:{}:{:?}", endpoint, key));
        }
    }

    // Node A starts with seed B; B already knows C. A's first round with
    // the seed pulls B's state; the cluster fully converges within a few
    // lossless rounds and nobody is convicted along the way.
    #[tokio::test]
    async fn test_cold_join() {
        let endpoint_a = Endpoint::new("10.0.0.1", 7946);
        let endpoint_b = Endpoint::new("10.0.0.2", 7946);
        let endpoint_c = Endpoint::new("10.0.0.3", 7946);

        // generous timeouts so a slow run cannot evict anyone mid-test
        let join_settings = GossipSettings {
            cluster_name: "test-pack".to_string(),
            interval: Duration::from_millis(10),
            ring_delay: Duration::from_secs(10),
        };
        let mut nodes = [
            make_node_with("10.0.0.1", vec![endpoint_b.clone()], join_settings.clone()),
            make_node_with("10.0.0.2", vec![endpoint_b.clone()], join_settings.clone()),
            make_node_with("10.0.0.3", vec![endpoint_b.clone()], join_settings),
        ];
        start_node(&nodes[0], 100);
        start_node(&nodes[1], 100);
        start_node(&nodes[2], 100);

        // C introduces itself to seed B first
        nodes[2].gossiper.run_tick().await;
        route(&mut nodes).await;
        assert!(nodes[1].gossiper.is_known_endpoint(&endpoint_c));

        // A's first round goes to seed B and pulls the seed's state
        nodes[0].gossiper.run_tick().await;
        route(&mut nodes).await;
        assert!(nodes[0].gossiper.is_known_endpoint(&endpoint_b));
        assert!(nodes[1].gossiper.is_known_endpoint(&endpoint_a));

        // free lossless gossip converges every view in O(log n) rounds
        let everyone = [&endpoint_a, &endpoint_b, &endpoint_c];
        let mut converged = false;
        for _ in 0..50 {
            for node in nodes.iter() {
                node.gossiper.run_tick().await;
            }
            route(&mut nodes).await;
            converged = nodes.iter().all(|node| {
                everyone
                    .iter()
                    .all(|endpoint| node.gossiper.live_members().contains(endpoint))
            });
            if converged {
                break;
            }
        }
        assert!(converged, "cluster failed to converge");

        // identical endpoint sets everywhere, and no convictions
        for node in &nodes {
            assert_eq!(node.gossiper.endpoint_states().len(), 3);
            assert!(node.gossiper.unreachable_members().is_empty());
        }
    }

    #[tokio::test]
    async fn test_applying_same_state_twice_is_noop() {
        let mut nodes = [make_node("10.0.0.1", vec![])];
        start_node(&nodes[0], 100);
        let recorder = Arc::new(EventRecorder::default());
        nodes[0].gossiper.register_subscriber(recorder.clone());

        let peer = Endpoint::new("10.0.0.2", 7946);
        let state = remote_state(200, 5);
        nodes[0]
            .gossiper
            .handle_message(
                peer.clone(),
                GossipMessage::Ack2 {
                    states: vec![(peer.clone(), state.clone())],
                },
            )
            .await;
        let first_events = recorder.log.lock().unwrap().len();
        assert!(first_events > 0);
        let first_version = nodes[0].gossiper.endpoint_state(&peer).unwrap().max_version();

        nodes[0]
            .gossiper
            .handle_message(
                peer.clone(),
                GossipMessage::Ack2 {
                    states: vec![(peer.clone(), state)],
                },
            )
            .await;
        // no new lifecycle events beyond a repeated echo probe
        let second_version = nodes[0].gossiper.endpoint_state(&peer).unwrap().max_version();
        assert_eq!(first_version, second_version);
        let log = recorder.log.lock().unwrap();
        assert_eq!(
            log.iter().filter(|e| e.starts_with("join")).count(),
            1,
            "second apply must not re-join: {:?}",
            *log
        );
    }

    #[tokio::test]
    async fn test_generation_gap_is_ignored() {
        let mut nodes = [make_node("10.0.0.1", vec![])];
        start_node(&nodes[0], 100);
        let peer = Endpoint::new("10.0.0.2", 7946);

        nodes[0]
            .gossiper
            .handle_message(
                peer.clone(),
                GossipMessage::Ack2 {
                    states: vec![(peer.clone(), remote_state(1000, 1))],
                },
            )
            .await;
        assert_eq!(nodes[0].gossiper.current_generation(&peer), Some(1000));

        // a generation more than a year ahead is treated as corruption
        let unbelievable = 1000 + (MAX_GENERATION_DIFFERENCE as i32) + 10;
        nodes[0]
            .gossiper
            .handle_message(
                peer.clone(),
                GossipMessage::Ack2 {
                    states: vec![(peer.clone(), remote_state(unbelievable, 1))],
                },
            )
            .await;
        assert_eq!(nodes[0].gossiper.current_generation(&peer), Some(1000));
    }

    #[tokio::test]
    async fn test_dead_status_skips_mark_alive() {
        let mut nodes = [make_node("10.0.0.1", vec![])];
        start_node(&nodes[0], 100);
        let peer = Endpoint::new("10.0.0.2", 7946);

        let mut state = remote_state(200, 1);
        state.add_application_state(
            ApplicationKey::Status,
            VersionedValue::new(format!("{},{}", status::LEFT, 0), 2),
        );
        nodes[0]
            .gossiper
            .handle_message(
                peer.clone(),
                GossipMessage::Ack2 {
                    states: vec![(peer.clone(), state)],
                },
            )
            .await;

        assert!(!nodes[0].gossiper.is_alive(&peer));
        assert!(nodes[0].gossiper.unreachable_members().contains(&peer));
        // no echo was sent for a dead state
        assert!(nodes[0]
            .gossiper
            .state
            .lock()
            .unwrap()
            .pending_echo
            .is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_verb_marks_dead() {
        let mut nodes = [make_node("10.0.0.1", vec![]), make_node("10.0.0.2", vec![])];
        start_node(&nodes[0], 100);
        start_node(&nodes[1], 100);
        let endpoint_b = Endpoint::new("10.0.0.2", 7946);

        nodes[0]
            .gossiper
            .handle_message(
                endpoint_b.clone(),
                GossipMessage::Ack2 {
                    states: vec![(endpoint_b.clone(), remote_state(200, 1))],
                },
            )
            .await;
        route(&mut nodes).await;
        assert!(nodes[0].gossiper.live_members().contains(&endpoint_b));

        nodes[0]
            .gossiper
            .handle_message(endpoint_b.clone(), GossipMessage::Shutdown)
            .await;
        assert!(!nodes[0].gossiper.is_alive(&endpoint_b));
        assert!(nodes[0].gossiper.endpoint_downtime(&endpoint_b) < 10_000);
    }

    #[tokio::test]
    async fn test_quarantined_endpoint_is_dropped_until_delay_passes() {
        let mut nodes = [make_node("10.0.0.1", vec![])];
        start_node(&nodes[0], 100);
        let peer = Endpoint::new("10.0.0.2", 7946);

        {
            let mut state = nodes[0].gossiper.state.lock().unwrap();
            let now = nodes[0].gossiper.clock.now_millis();
            state.just_removed.insert(peer.clone(), now);
        }

        nodes[0]
            .gossiper
            .handle_message(
                peer.clone(),
                GossipMessage::Ack2 {
                    states: vec![(peer.clone(), remote_state(200, 1))],
                },
            )
            .await;
        assert!(!nodes[0].gossiper.is_known_endpoint(&peer));

        // quarantine is 2 x ring_delay = 100ms with the test settings
        tokio::time::sleep(Duration::from_millis(150)).await;
        nodes[0].gossiper.run_tick().await;

        nodes[0]
            .gossiper
            .handle_message(
                peer.clone(),
                GossipMessage::Ack2 {
                    states: vec![(peer.clone(), remote_state(200, 1))],
                },
            )
            .await;
        assert!(nodes[0].gossiper.is_known_endpoint(&peer));
    }

    #[tokio::test]
    async fn test_fat_client_is_evicted_after_silent_timeout() {
        let mut nodes = [make_node("10.0.0.1", vec![])];
        start_node(&nodes[0], 100);
        let recorder = Arc::new(EventRecorder::default());
        nodes[0].gossiper.register_subscriber(recorder.clone());
        let peer = Endpoint::new("10.0.0.2", 7946);

        nodes[0]
            .gossiper
            .handle_message(
                peer.clone(),
                GossipMessage::Ack2 {
                    states: vec![(peer.clone(), remote_state(200, 1))],
                },
            )
            .await;
        assert!(nodes[0].gossiper.is_gossip_only_member(&peer));

        // fat client timeout is quarantine/2 = 50ms with the test settings
        tokio::time::sleep(Duration::from_millis(80)).await;
        nodes[0].gossiper.run_tick().await;

        assert!(!nodes[0].gossiper.is_known_endpoint(&peer));
        assert!(recorder
            .log
            .lock()
            .unwrap()
            .iter()
            .any(|e| e == &format!("remove:{}", peer)));
    }

    #[tokio::test]
    async fn test_local_update_raises_version_and_notifies() {
        let mut nodes = [make_node("10.0.0.1", vec![])];
        start_node(&nodes[0], 100);
        let recorder = Arc::new(EventRecorder::default());
        nodes[0].gossiper.register_subscriber(recorder.clone());
        let local = nodes[0].gossiper.local_endpoint().clone();

        nodes[0]
            .gossiper
            .apply_local_state(ApplicationKey::Load, "0.42".to_string())
            .await;

        let state = nodes[0].gossiper.endpoint_state(&local).unwrap();
        let value = state.application_state(ApplicationKey::Load).unwrap();
        assert_eq!(value.value, "0.42");
        assert!(value.version > 0);

        let log = recorder.log.lock().unwrap();
        assert_eq!(log[0], format!("before_change:{}:Load", local));
        assert_eq!(log[1], format!("change:{}:Load", local));
    }

    #[tokio::test]
    async fn test_examine_digests_follows_comparison_table() {
        let mut nodes = [make_node("10.0.0.1", vec![])];
        start_node(&nodes[0], 100);
        let known = Endpoint::new("10.0.0.2", 7946);
        let unknown = Endpoint::new("10.0.0.9", 7946);

        nodes[0]
            .gossiper
            .handle_message(
                known.clone(),
                GossipMessage::Ack2 {
                    states: vec![(known.clone(), remote_state(200, 5))],
                },
            )
            .await;
        while nodes[0].outbound_rx.try_recv().is_ok() {}

        // absent locally, newer remote generation, older remote
        // generation, same generation newer version, same generation
        // older version, identical
        let digests = vec![
            GossipDigest::new(unknown.clone(), 7, 3),
            GossipDigest::new(known.clone(), 300, 2),
            GossipDigest::new(known.clone(), 100, 2),
            GossipDigest::new(known.clone(), 200, 9),
            GossipDigest::new(known.clone(), 200, 2),
            GossipDigest::new(known.clone(), 200, 5),
        ];
        nodes[0]
            .gossiper
            .handle_message(
                known.clone(),
                GossipMessage::Syn {
                    cluster_name: "test-pack".to_string(),
                    digests,
                },
            )
            .await;

        let (_, reply) = nodes[0].outbound_rx.try_recv().unwrap();
        let GossipMessage::Ack { digests, states } = reply else {
            panic!("expected an ack");
        };

        // requested: everything for the unknown, everything for the newer
        // generation, the delta above version 5 for the newer version
        assert_eq!(digests.len(), 3);
        assert_eq!(digests[0], GossipDigest::new(unknown, 7, 0));
        assert_eq!(digests[1], GossipDigest::new(known.clone(), 300, 0));
        assert_eq!(digests[2], GossipDigest::new(known.clone(), 200, 5));

        // sent: full state for the older generation, delta above version
        // 2 for the older version
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|(endpoint, _)| *endpoint == known));
    }

    #[tokio::test]
    async fn test_cluster_name_mismatch_is_dropped() {
        let mut nodes = [make_node("10.0.0.1", vec![])];
        start_node(&nodes[0], 100);
        let peer = Endpoint::new("10.0.0.2", 7946);

        nodes[0]
            .gossiper
            .handle_message(
                peer.clone(),
                GossipMessage::Syn {
                    cluster_name: "other-pack".to_string(),
                    digests: vec![GossipDigest::new(peer.clone(), 1, 1)],
                },
            )
            .await;
        assert!(nodes[0].outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shadow_syn_answers_with_everything() {
        let mut nodes = [make_node("10.0.0.1", vec![])];
        start_node(&nodes[0], 100);
        let peer = Endpoint::new("10.0.0.2", 7946);
        nodes[0]
            .gossiper
            .handle_message(
                peer.clone(),
                GossipMessage::Ack2 {
                    states: vec![(peer.clone(), remote_state(200, 5))],
                },
            )
            .await;
        while nodes[0].outbound_rx.try_recv().is_ok() {}

        let stranger = Endpoint::new("10.0.0.7", 7946);
        nodes[0]
            .gossiper
            .handle_message(
                stranger.clone(),
                GossipMessage::Syn {
                    cluster_name: "test-pack".to_string(),
                    digests: Vec::new(),
                },
            )
            .await;
        let (to, reply) = nodes[0].outbound_rx.try_recv().unwrap();
        assert_eq!(to, stranger);
        let GossipMessage::Ack { states, .. } = reply else {
            panic!("expected an ack");
        };
        // full states for both known endpoints (local + peer)
        assert_eq!(states.len(), 2);
    }

    #[tokio::test]
    async fn test_force_convict_marks_dead() {
        let mut nodes = [make_node("10.0.0.1", vec![]), make_node("10.0.0.2", vec![])];
        start_node(&nodes[0], 100);
        start_node(&nodes[1], 100);
        let endpoint_b = Endpoint::new("10.0.0.2", 7946);

        nodes[0]
            .gossiper
            .handle_message(
                endpoint_b.clone(),
                GossipMessage::Ack2 {
                    states: vec![(endpoint_b.clone(), remote_state(200, 1))],
                },
            )
            .await;
        route(&mut nodes).await;
        assert!(nodes[0].gossiper.is_alive(&endpoint_b));

        nodes[0].gossiper.force_convict(&endpoint_b).await;
        assert!(!nodes[0].gossiper.is_alive(&endpoint_b));
        assert!(nodes[0].gossiper.unreachable_members().contains(&endpoint_b));
    }

    #[tokio::test]
    async fn test_generation_and_version_never_regress() {
        let mut nodes = [make_node("10.0.0.1", vec![])];
        start_node(&nodes[0], 100);
        let peer = Endpoint::new("10.0.0.2", 7946);

        let mut observed = Vec::new();
        for (generation, version) in [(200, 5), (200, 3), (150, 9), (200, 8), (201, 1), (200, 50)]
        {
            nodes[0]
                .gossiper
                .handle_message(
                    peer.clone(),
                    GossipMessage::Ack2 {
                        states: vec![(peer.clone(), remote_state(generation, version))],
                    },
                )
                .await;
            let state = nodes[0].gossiper.endpoint_state(&peer).unwrap();
            observed.push((state.generation(), state.max_version()));
        }
        for window in observed.windows(2) {
            assert!(window[1] >= window[0], "view regressed: {:?}", observed);
        }
    }

    #[tokio::test]
    async fn test_saved_endpoint_starts_dead_with_zero_generation() {
        let nodes = [make_node("10.0.0.1", vec![])];
        start_node(&nodes[0], 100);
        let peer = Endpoint::new("10.0.0.2", 7946);

        nodes[0].gossiper.add_saved_endpoint(&peer);
        assert_eq!(nodes[0].gossiper.current_generation(&peer), Some(0));
        assert!(!nodes[0].gossiper.is_alive(&peer));
        assert!(nodes[0].gossiper.unreachable_members().contains(&peer));
    }
}
