//! Two-phase update orchestration over a registry of nodes.
//!
//! Unknown nodes move through `Uninitialized -> AnchorInitialized -> MeshRefined`:
//!
//! - [`NodeRegistry::update_from_anchors`] ranges the node against every anchor in registry order
//!   and feeds each range into its estimator.
//! - [`NodeRegistry::update_from_mesh`] does the same against every other unknown node that
//!   already has an estimate. It can be repeated indefinitely.
//!
//! Peers are only ever consumed as [`NodeEstimate`] snapshots. [`NodeRegistry::run_round`] drives
//! a phase for the whole network, either strictly in registry order ([`RoundMode::Sequential`],
//! later nodes see estimates refreshed earlier in the same round) or from peer snapshots captured
//! at round start ([`RoundMode::Snapshot`], node updates run in parallel).
use crate::error::{LocalizationError, Result};
use crate::filter::{Estimator, FilterConfig, RangeParticleFilter};
use crate::measurements::RangeSensor;
use crate::node::{InitializationState, Node, NodeConfig, NodeEstimate, NodeId, Role};
use crate::particle::{ParticleState, StateVector};

use log::{debug, info, warn};
use nalgebra::Vector3;
use rand::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Most particles handed out for rendering, whatever the true count.
pub const DEFAULT_DISPLAY_CAP: usize = 500;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub display_cap: usize,
    pub default_particles: usize,
    /// Center of the broad prior for nodes without a seed position.
    pub prior_center: [f64; 3],
    /// Seed of the registry RNG; drawn from the OS when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub sensor: RangeSensor,
    pub filter: FilterConfig,
}
impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            display_cap: DEFAULT_DISPLAY_CAP,
            default_particles: 1000,
            prior_center: [0.0; 3],
            seed: None,
            sensor: RangeSensor::default(),
            filter: FilterConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Anchors,
    Mesh,
}
impl Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Anchors => write!(f, "anchors"),
            UpdatePhase::Mesh => write!(f, "mesh"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum RoundMode {
    #[default]
    Sequential,
    Snapshot,
}

/// Result of one node update.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome {
    /// Ranges from `peers` were applied; `skipped` peers had no estimate yet.
    Applied {
        peers: Vec<NodeId>,
        skipped: Vec<NodeId>,
    },
    /// Mesh update requested on a node that has not been initialized from anchors.
    NotReady,
    /// No usable peer; the node's state and estimate are unchanged.
    NoPeers { skipped: Vec<NodeId> },
}
impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}

/// Read-only view of a peer taken before an update.
#[derive(Clone, Copy, Debug)]
struct PeerSnapshot {
    id: NodeId,
    role: Role,
    truth: StateVector,
    estimate: Option<NodeEstimate>,
}
impl PeerSnapshot {
    fn of(node: &Node) -> Self {
        PeerSnapshot {
            id: node.id(),
            role: node.role(),
            truth: node.ground_truth(),
            estimate: if node.is_ready() { node.estimate().ok() } else { None },
        }
    }
}

/// Range `node` against the selected peers and commit the new estimate.
fn update_node<R: Rng + ?Sized>(
    node: &mut Node,
    phase: UpdatePhase,
    peers: &[PeerSnapshot],
    sensor: &RangeSensor,
    rng: &mut R,
) -> Result<UpdateOutcome> {
    if node.role() == Role::Anchor {
        return Err(LocalizationError::WrongRole {
            id: node.id(),
            role: node.role(),
        });
    }
    let (wanted_role, next_state) = match phase {
        UpdatePhase::Anchors => (Role::Anchor, InitializationState::AnchorInitialized),
        UpdatePhase::Mesh => {
            if !node.is_ready() {
                warn!("node {} not initialized; mesh update ignored", node.id());
                return Ok(UpdateOutcome::NotReady);
            }
            (Role::Unknown, InitializationState::MeshRefined)
        }
    };

    let mut applied = Vec::new();
    let mut skipped = Vec::new();
    let self_id = node.id();
    let truth = node.ground_truth();
    for peer in peers
        .iter()
        .filter(|p| p.role == wanted_role && p.id != self_id)
    {
        let Some(estimate) = peer.estimate else {
            skipped.push(peer.id);
            continue;
        };
        let measurement = sensor.measure(&truth, &peer.truth, rng);
        debug!(
            "node {} <- {} {}: range {:.4}",
            self_id,
            phase,
            peer.id,
            measurement
        );
        node.apply_range(measurement, 0.0, &estimate)?;
        applied.push(peer.id);
    }

    if applied.is_empty() {
        debug!("node {}: no {} peers available", node.id(), phase);
        return Ok(UpdateOutcome::NoPeers { skipped });
    }
    let estimate = node.commit(next_state)?;
    debug!("node {} estimate {}", node.id(), estimate);
    Ok(UpdateOutcome::Applied {
        peers: applied,
        skipped,
    })
}

/// Insertion-ordered set of nodes plus the shared sensor and RNG.
pub struct NodeRegistry {
    config: MeshConfig,
    nodes: Vec<Node>,
    next_id: NodeId,
    rng: StdRng,
}

impl NodeRegistry {
    pub fn new(config: MeshConfig) -> Result<Self> {
        config.filter.validate()?;
        if config.default_particles == 0 {
            return Err(LocalizationError::InvalidConfig(
                "default_particles must be positive".to_string(),
            ));
        }
        if !(config.sensor.noise_std.is_finite() && config.sensor.noise_std >= 0.0) {
            return Err(LocalizationError::InvalidConfig(
                "sensor noise_std must be finite and non-negative".to_string(),
            ));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(NodeRegistry {
            config,
            nodes: Vec::new(),
            next_id: 0,
            rng,
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
    /// Nodes in registry order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id()).collect()
    }
    pub fn unknown_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.role() == Role::Unknown)
            .map(|n| n.id())
            .collect()
    }

    fn index_of(&self, id: NodeId) -> Result<usize> {
        self.nodes
            .iter()
            .position(|n| n.id() == id)
            .ok_or(LocalizationError::UnknownNode(id))
    }

    pub fn get(&self, id: NodeId) -> Result<&Node> {
        let idx = self.index_of(id)?;
        Ok(&self.nodes[idx])
    }

    /// Add a node with the registry's default particle count.
    pub fn add_node(&mut self, role: Role, position: Vector3<f64>) -> Result<NodeId> {
        let config = NodeConfig {
            role,
            position: [position[0], position[1], position[2]],
            delay: 0.0,
            num_particles: None,
            seed_position: None,
        };
        self.add_node_from_config(&config)
    }

    /// Add a node backed by a [`RangeParticleFilter`] built from the registry's filter config.
    pub fn add_node_from_config(&mut self, config: &NodeConfig) -> Result<NodeId> {
        let center = Vector3::from(config.seed_position.unwrap_or(self.config.prior_center));
        let filter = RangeParticleFilter::new(self.config.filter.clone(), center, self.rng.random())?;
        self.add_node_with_estimator(config, Box::new(filter))
    }

    /// Add a node around a caller-supplied estimator.
    pub fn add_node_with_estimator(
        &mut self,
        config: &NodeConfig,
        estimator: Box<dyn Estimator>,
    ) -> Result<NodeId> {
        let num_particles = config.num_particles.unwrap_or(self.config.default_particles);
        let id = self.next_id;
        let node = Node::new(
            id,
            config.role,
            Vector3::from(config.position),
            config.delay,
            num_particles,
            self.config.filter.model_delay,
            estimator,
        )?;
        self.next_id += 1;
        info!(
            "added {} node {} at {:?} with {} particles",
            config.role, id, config.position, num_particles
        );
        self.nodes.push(node);
        Ok(id)
    }

    pub fn remove(&mut self, id: NodeId) -> Result<Node> {
        let idx = self.index_of(id)?;
        info!("removed node {id}");
        Ok(self.nodes.remove(idx))
    }

    pub fn set_role(&mut self, id: NodeId, role: Role) -> Result<()> {
        let idx = self.index_of(id)?;
        self.nodes[idx].set_role(role)
    }

    /// Change a node's particle count, discarding its estimate if it is unknown.
    pub fn set_particle_count(&mut self, id: NodeId, num_particles: usize) -> Result<()> {
        let idx = self.index_of(id)?;
        self.nodes[idx].resize(num_particles)?;
        info!("node {id} resized to {num_particles} particles");
        Ok(())
    }

    /// At most `display_cap` particles of a node.
    pub fn particle_snapshot(&self, id: NodeId) -> Result<Vec<ParticleState>> {
        Ok(self.get(id)?.particle_snapshot(self.config.display_cap))
    }

    fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.nodes.iter().map(PeerSnapshot::of).collect()
    }

    fn update(&mut self, id: NodeId, phase: UpdatePhase) -> Result<UpdateOutcome> {
        let idx = self.index_of(id)?;
        let peers = self.snapshot();
        update_node(
            &mut self.nodes[idx],
            phase,
            &peers,
            &self.config.sensor,
            &mut self.rng,
        )
    }

    /// Range an unknown node against every anchor, in registry order.
    pub fn update_from_anchors(&mut self, id: NodeId) -> Result<UpdateOutcome> {
        self.update(id, UpdatePhase::Anchors)
    }

    /// Range an initialized unknown node against every other initialized unknown node.
    pub fn update_from_mesh(&mut self, id: NodeId) -> Result<UpdateOutcome> {
        self.update(id, UpdatePhase::Mesh)
    }

    /// Run `phase` for every unknown node in registry order.
    pub fn run_round(
        &mut self,
        phase: UpdatePhase,
        mode: RoundMode,
    ) -> Result<Vec<(NodeId, UpdateOutcome)>> {
        let outcomes = match mode {
            RoundMode::Sequential => {
                let mut outcomes = Vec::new();
                for id in self.unknown_ids() {
                    outcomes.push((id, self.update(id, phase)?));
                }
                outcomes
            }
            RoundMode::Snapshot => {
                let peers = self.snapshot();
                let seeds: Vec<u64> = (0..self.nodes.len()).map(|_| self.rng.random()).collect();
                let sensor = &self.config.sensor;
                self.nodes
                    .par_iter_mut()
                    .zip(seeds.par_iter())
                    .filter(|(node, _)| node.role() == Role::Unknown)
                    .map(|(node, &seed)| {
                        let mut rng = StdRng::seed_from_u64(seed);
                        update_node(node, phase, &peers, sensor, &mut rng)
                            .map(|outcome| (node.id(), outcome))
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };
        let applied = outcomes.iter().filter(|(_, o)| o.is_applied()).count();
        info!(
            "{:?} {} round: {}/{} nodes updated",
            mode,
            phase,
            applied,
            outcomes.len()
        );
        Ok(outcomes)
    }
}
