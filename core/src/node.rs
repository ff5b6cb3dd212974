//! Node bookkeeping: role, ground truth, initialization state and the stored estimate.
//!
//! A [`Node`] owns its estimator exclusively. Other nodes only ever read its [`NodeEstimate`],
//! which is refreshed from the estimator after each completed update.
use crate::error::{LocalizationError, Result};
use crate::filter::Estimator;
use crate::particle::{ParticleState, StateVector};

use log::info;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Unique, monotonically increasing node identifier.
pub type NodeId = u64;

/// Per-component variance reported for anchors.
pub const ANCHOR_VARIANCE: f64 = 0.01;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Known, fixed position.
    Anchor,
    /// Position and delay estimated from ranges.
    Unknown,
}
impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Anchor => write!(f, "anchor"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializationState {
    #[default]
    Uninitialized,
    AnchorInitialized,
    MeshRefined,
}

/// Snapshot of a node's weighted mean and per-component variance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeEstimate {
    pub mean: StateVector,
    pub variance: StateVector,
}
impl Display for NodeEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mean {} var {}", self.mean, self.variance)
    }
}
impl NodeEstimate {
    /// Exact estimate of an anchor at `position`.
    pub fn anchor(position: &Vector3<f64>) -> Self {
        NodeEstimate {
            mean: StateVector::new(*position, 0.0),
            variance: StateVector::splat(ANCHOR_VARIANCE),
        }
    }
    /// Average of the three position variance components.
    pub fn scalar_variance(&self) -> f64 {
        self.variance.position.sum() / 3.0
    }
}

/// Static description of a node, as read from a scenario file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: Role,
    /// Ground-truth position.
    pub position: [f64; 3],
    /// Ground-truth delay; anchors always carry zero.
    #[serde(default)]
    pub delay: f64,
    /// Overrides the registry's default particle count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_particles: Option<usize>,
    /// Center of the broad prior; defaults to the registry's prior center.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_position: Option<[f64; 3]>,
}
impl NodeConfig {
    pub fn anchor(x: f64, y: f64, z: f64) -> Self {
        NodeConfig {
            role: Role::Anchor,
            position: [x, y, z],
            delay: 0.0,
            num_particles: None,
            seed_position: None,
        }
    }
    pub fn unknown(x: f64, y: f64, z: f64) -> Self {
        NodeConfig {
            role: Role::Unknown,
            ..NodeConfig::anchor(x, y, z)
        }
    }
}

pub struct Node {
    id: NodeId,
    role: Role,
    position: Vector3<f64>,
    true_delay: f64,
    model_delay: bool,
    state: InitializationState,
    estimate: Option<NodeEstimate>,
    estimator: Box<dyn Estimator>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("position", &self.position)
            .field("state", &self.state)
            .field("estimate", &self.estimate)
            .field("num_particles", &self.estimator.num_particles())
            .finish()
    }
}

impl Node {
    /// Build a node around an estimator and allocate its particles. Anchors are pinned to their
    /// ground-truth position and start out `AnchorInitialized`.
    pub fn new(
        id: NodeId,
        role: Role,
        position: Vector3<f64>,
        true_delay: f64,
        num_particles: usize,
        model_delay: bool,
        mut estimator: Box<dyn Estimator>,
    ) -> Result<Self> {
        estimator.initialize(num_particles, model_delay)?;
        let mut node = Node {
            id,
            role,
            position,
            true_delay,
            model_delay,
            state: InitializationState::Uninitialized,
            estimate: None,
            estimator,
        };
        if role == Role::Anchor {
            node.make_anchor()?;
        }
        Ok(node)
    }

    fn make_anchor(&mut self) -> Result<()> {
        self.estimator.pin(&self.position)?;
        self.true_delay = 0.0;
        self.estimate = Some(NodeEstimate::anchor(&self.position));
        self.state = InitializationState::AnchorInitialized;
        Ok(())
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
    pub fn role(&self) -> Role {
        self.role
    }
    pub fn position(&self) -> Vector3<f64> {
        self.position
    }
    pub fn true_delay(&self) -> f64 {
        self.true_delay
    }
    /// Ground truth as a state vector, for synthetic measurement generation only.
    pub fn ground_truth(&self) -> StateVector {
        StateVector::new(self.position, self.true_delay)
    }
    pub fn state(&self) -> InitializationState {
        self.state
    }
    pub fn is_ready(&self) -> bool {
        self.state != InitializationState::Uninitialized
    }
    pub fn num_particles(&self) -> usize {
        self.estimator.num_particles()
    }
    pub fn estimator(&self) -> &dyn Estimator {
        self.estimator.as_ref()
    }

    /// Last stored estimate, or `NotInitialized` before the first completed update.
    pub fn estimate(&self) -> Result<NodeEstimate> {
        self.estimate.ok_or(LocalizationError::NotInitialized)
    }

    /// Distance between the estimated and true position.
    pub fn position_error(&self) -> Option<f64> {
        self.estimate
            .map(|e| (e.mean.position - self.position).norm())
    }

    pub fn delay_error(&self) -> Option<f64> {
        self.estimate.map(|e| (e.mean.delay - self.true_delay).abs())
    }

    /// Up to `cap` particles, for rendering.
    pub fn particle_snapshot(&self, cap: usize) -> Vec<ParticleState> {
        (0..self.estimator.num_particles().min(cap))
            .filter_map(|i| self.estimator.get_particle(i).ok())
            .collect()
    }

    /// Feed one range measurement against a peer snapshot into the estimator.
    pub(crate) fn apply_range(
        &mut self,
        measurement: f64,
        nlos_probability: f64,
        peer: &NodeEstimate,
    ) -> Result<()> {
        self.estimator
            .estimate_state(measurement, nlos_probability, &peer.mean, &peer.variance)
    }

    /// Read the estimator's moments, store them and move to `state`.
    pub(crate) fn commit(&mut self, state: InitializationState) -> Result<NodeEstimate> {
        let estimate = NodeEstimate {
            mean: self.estimator.get_estimate_mean()?,
            variance: self.estimator.get_estimate_variance()?,
        };
        self.estimate = Some(estimate);
        if self.state != state {
            info!("node {} {:?} -> {:?}", self.id, self.state, state);
        }
        self.state = state;
        Ok(estimate)
    }

    /// Switch role. Becoming an anchor pins the set; becoming unknown redraws the prior and
    /// forgets the estimate.
    pub fn set_role(&mut self, role: Role) -> Result<()> {
        if role == self.role {
            return Ok(());
        }
        match role {
            Role::Anchor => {
                self.role = Role::Anchor;
                self.make_anchor()?;
            }
            Role::Unknown => {
                let n = self.estimator.num_particles();
                self.estimator.initialize(n, self.model_delay)?;
                self.role = Role::Unknown;
                self.estimate = None;
                self.state = InitializationState::Uninitialized;
            }
        }
        info!("node {} is now {}", self.id, self.role);
        Ok(())
    }

    /// Change the particle count. Unknown nodes lose their estimate and revert to
    /// `Uninitialized`; anchors stay pinned.
    pub fn resize(&mut self, num_particles: usize) -> Result<()> {
        self.estimator.resize(num_particles)?;
        if self.role == Role::Unknown {
            self.estimate = None;
            self.state = InitializationState::Uninitialized;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterConfig, RangeParticleFilter};

    fn filter(seed: u64) -> Box<dyn Estimator> {
        Box::new(RangeParticleFilter::new(FilterConfig::default(), Vector3::zeros(), seed).unwrap())
    }

    #[test]
    fn anchor_is_exact_and_ready() {
        let position = Vector3::new(5.0, 0.5, 5.0);
        let node = Node::new(0, Role::Anchor, position, 0.3, 100, false, filter(1)).unwrap();
        assert!(node.is_ready());
        assert_eq!(node.state(), InitializationState::AnchorInitialized);
        let estimate = node.estimate().unwrap();
        assert_eq!(estimate.mean.position, position);
        assert_eq!(estimate.variance, StateVector::splat(ANCHOR_VARIANCE));
        assert_eq!(node.true_delay(), 0.0);
        assert_eq!(node.position_error(), Some(0.0));
        assert!(node.particle_snapshot(10).iter().all(|p| p.position() == position));
    }

    #[test]
    fn unknown_starts_uninitialized() {
        let node = Node::new(1, Role::Unknown, Vector3::zeros(), 0.0, 50, false, filter(2)).unwrap();
        assert!(!node.is_ready());
        assert_eq!(node.estimate(), Err(LocalizationError::NotInitialized));
        assert_eq!(node.position_error(), None);
        assert_eq!(node.num_particles(), 50);
    }

    #[test]
    fn zero_particles_rejected() {
        assert!(matches!(
            Node::new(1, Role::Unknown, Vector3::zeros(), 0.0, 0, false, filter(3)),
            Err(LocalizationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn snapshot_is_capped() {
        let node = Node::new(1, Role::Unknown, Vector3::zeros(), 0.0, 800, false, filter(4)).unwrap();
        assert_eq!(node.particle_snapshot(500).len(), 500);
        assert_eq!(node.particle_snapshot(2000).len(), 800);
    }

    #[test]
    fn role_toggle_round_trip() {
        let position = Vector3::new(1.0, 2.0, 3.0);
        let mut node = Node::new(7, Role::Unknown, position, 0.0, 40, false, filter(5)).unwrap();
        node.set_role(Role::Anchor).unwrap();
        assert_eq!(node.estimate().unwrap().mean.position, position);
        node.set_role(Role::Unknown).unwrap();
        assert_eq!(node.state(), InitializationState::Uninitialized);
        assert!(node.estimate().is_err());
        assert_eq!(node.num_particles(), 40);
    }

    #[test]
    fn scalar_variance_averages_position_components() {
        let estimate = NodeEstimate {
            mean: StateVector::new(Vector3::new(30.0, 60.0, 90.0), 0.0),
            variance: StateVector::new(Vector3::new(1.0, 2.0, 3.0), 9.0),
        };
        assert_eq!(estimate.scalar_variance(), 2.0);
    }
}
