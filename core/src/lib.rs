//! Cooperative particle-filter localization of ranging nodes
//!
//! This crate estimates the unknown 3D position and clock/antenna delay of network nodes from noisy pairwise
//! range measurements. Anchor nodes have known positions. Unknown nodes bootstrap their estimate from the
//! anchors and then refine it from other already-estimated unknown nodes, so that the network localizes itself
//! cooperatively. Each node carries its own particle filter; nodes only ever exchange their weighted mean and
//! variance, never their particles.
//!
//! The crate is built on:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): vector arithmetic for positions.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): random
//!   number generation for the measurement model, the priors, diffusion and resampling.
//! - [`rayon`](https://crates.io/crates/rayon): parallel node updates in snapshot rounds.
//!
//! ## Crate overview
//!
//! - [particle]: particle state, particle sets, weight normalization and the resampling strategies.
//! - [measurements]: the synthetic range sensor and the line-of-sight / non-line-of-sight likelihood.
//! - [filter]: the [`Estimator`] capability and its particle filter implementation.
//! - [node]: node role, initialization state and the stored estimate.
//! - [mesh]: the node registry and the two-phase update orchestration.
//! - [sim]: scenario files, convergence runs and CSV output.
//!
//! ## State definition
//!
//! Each particle carries the state
//!
//! $$
//! x = [p_x, p_y, p_z, d]
//! $$
//!
//! where $p$ is the position in an arbitrary Cartesian frame and $d$ is the node's delay, expressed as a fraction
//! of the measured range. The delay only enters the predicted range when delay modelling is switched on:
//!
//! $$
//! \hat{r} = \lVert p - p_{peer} \rVert + (d + d_{peer}) r
//! $$
//!
//! ## Update protocol
//!
//! Unknown nodes follow the state machine `Uninitialized -> AnchorInitialized -> MeshRefined`. An anchor update
//! ranges the node against every anchor in registry order; a mesh update ranges it against every other
//! initialized unknown node. The mesh update may be repeated indefinitely. Anchors are pinned: their estimate
//! is their true position with a fixed variance of [`ANCHOR_VARIANCE`] per component.
//!
//! ```
//! use meshloc::{MeshConfig, NodeRegistry, Role};
//! use nalgebra::Vector3;
//!
//! let mut registry = NodeRegistry::new(MeshConfig {
//!     default_particles: 500,
//!     seed: Some(1),
//!     ..MeshConfig::default()
//! })
//! .unwrap();
//! for anchor in [[0.0, 10.0, 0.0], [10.0, 0.0, 0.0], [0.0, 0.0, 10.0], [10.0, 10.0, 10.0]] {
//!     registry.add_node(Role::Anchor, Vector3::from(anchor)).unwrap();
//! }
//! let id = registry.add_node(Role::Unknown, Vector3::zeros()).unwrap();
//! registry.update_from_anchors(id).unwrap();
//! let estimate = registry.get(id).unwrap().estimate().unwrap();
//! println!("estimated position: {}", estimate.mean);
//! ```
pub mod error;
pub mod filter;
pub mod measurements;
pub mod mesh;
pub mod node;
pub mod particle;
pub mod sim;

pub use error::{LocalizationError, Result};
pub use filter::{Estimator, FilterConfig, RangeParticleFilter};
pub use measurements::{NlosModel, RangeLikelihood, RangeSensor};
pub use mesh::{DEFAULT_DISPLAY_CAP, MeshConfig, NodeRegistry, RoundMode, UpdateOutcome, UpdatePhase};
pub use node::{ANCHOR_VARIANCE, InitializationState, Node, NodeConfig, NodeEstimate, NodeId, Role};
pub use particle::{ParticleResamplingStrategy, ParticleSet, ParticleState, StateVector};
