//! Scenario configuration, convergence runs and CSV output.
//!
//! A [`ScenarioConfig`] describes a mesh (filter, sensor, seed), its nodes and how many anchor
//! and mesh rounds to run. [`run_scenario`] plays it through a [`NodeRegistry`] and returns one
//! [`ConvergenceRecord`] per initialized unknown node per round, which can be written to CSV for
//! analysis. [`particle_count_sweep`] repeats a scenario over several particle counts.
use crate::error::Result;
use crate::mesh::{MeshConfig, NodeRegistry, RoundMode, UpdatePhase};
use crate::node::{NodeConfig, NodeId, Role};

use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub anchor_rounds: usize,
    pub mesh_rounds: usize,
    pub round_mode: RoundMode,
    pub mesh: MeshConfig,
    pub nodes: Vec<NodeConfig>,
}

impl Default for ScenarioConfig {
    /// Four non-coplanar anchors around three unknown nodes.
    fn default() -> Self {
        ScenarioConfig {
            anchor_rounds: 1,
            mesh_rounds: 3,
            round_mode: RoundMode::Sequential,
            mesh: MeshConfig {
                seed: Some(42),
                ..MeshConfig::default()
            },
            nodes: vec![
                NodeConfig::anchor(5.0, 0.5, 5.0),
                NodeConfig::anchor(10.0, 6.0, -15.0),
                NodeConfig::anchor(-10.0, 0.5, -15.0),
                NodeConfig::anchor(-15.0, 8.0, 15.0),
                NodeConfig::unknown(0.0, 0.5, 0.0),
                NodeConfig::unknown(3.0, 2.0, -5.0),
                NodeConfig::unknown(-6.0, 1.0, 4.0),
            ],
        }
    }
}

impl ScenarioConfig {
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Write using the format implied by the extension (.json/.yaml/.yml/.toml).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Read using the format implied by the extension (.json/.yaml/.yml/.toml).
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// Estimate of one unknown node after one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceRecord {
    /// 1-based round counter over anchor and mesh rounds.
    pub round: usize,
    pub phase: UpdatePhase,
    pub id: NodeId,
    pub num_particles: usize,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub d: f64,
    pub var_x: f64,
    pub var_y: f64,
    pub var_z: f64,
    pub var_d: f64,
    /// Distance between the estimated and true position.
    pub distance: f64,
    pub delay_error: f64,
}

impl ConvergenceRecord {
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn from_csv<P: AsRef<Path>>(path: P) -> std::result::Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            records.push(result?);
        }
        Ok(records)
    }
}

fn record_round(
    registry: &NodeRegistry,
    round: usize,
    phase: UpdatePhase,
    records: &mut Vec<ConvergenceRecord>,
) {
    for node in registry.nodes().filter(|n| n.role() == Role::Unknown) {
        let Ok(estimate) = node.estimate() else {
            continue;
        };
        records.push(ConvergenceRecord {
            round,
            phase,
            id: node.id(),
            num_particles: node.num_particles(),
            x: estimate.mean.position[0],
            y: estimate.mean.position[1],
            z: estimate.mean.position[2],
            d: estimate.mean.delay,
            var_x: estimate.variance.position[0],
            var_y: estimate.variance.position[1],
            var_z: estimate.variance.position[2],
            var_d: estimate.variance.delay,
            distance: (estimate.mean.position - node.position()).norm(),
            delay_error: (estimate.mean.delay - node.true_delay()).abs(),
        });
    }
}

/// Build the registry described by `config`.
pub fn build_registry(config: &ScenarioConfig) -> Result<NodeRegistry> {
    let mut registry = NodeRegistry::new(config.mesh.clone())?;
    for node in &config.nodes {
        registry.add_node_from_config(node)?;
    }
    Ok(registry)
}

/// Play the scenario: `anchor_rounds` anchor rounds, then `mesh_rounds` mesh rounds.
pub fn run_scenario(config: &ScenarioConfig) -> Result<Vec<ConvergenceRecord>> {
    let mut registry = build_registry(config)?;
    let mut records = Vec::new();
    let phases = std::iter::repeat_n(UpdatePhase::Anchors, config.anchor_rounds)
        .chain(std::iter::repeat_n(UpdatePhase::Mesh, config.mesh_rounds));
    for (round, phase) in phases.enumerate() {
        registry.run_round(phase, config.round_mode)?;
        record_round(&registry, round + 1, phase, &mut records);
    }
    info!(
        "scenario finished: {} nodes, {} records",
        registry.len(),
        records.len()
    );
    Ok(records)
}

/// Run the scenario once per particle count, overriding every node's count.
pub fn particle_count_sweep(
    config: &ScenarioConfig,
    counts: &[usize],
) -> Result<Vec<ConvergenceRecord>> {
    let mut records = Vec::new();
    for &count in counts {
        let mut scenario = config.clone();
        scenario.mesh.default_particles = count;
        for node in &mut scenario.nodes {
            node.num_particles = None;
        }
        info!("sweep: running scenario with {count} particles");
        records.extend(run_scenario(&scenario)?);
    }
    Ok(records)
}

/// Mean final-round position error per particle count, in ascending particle count.
pub fn final_error_by_particle_count(records: &[ConvergenceRecord]) -> Vec<(usize, f64)> {
    let mut counts: Vec<usize> = records.iter().map(|r| r.num_particles).collect();
    counts.sort_unstable();
    counts.dedup();
    counts
        .into_iter()
        .filter_map(|n| {
            let of_count: Vec<&ConvergenceRecord> =
                records.iter().filter(|r| r.num_particles == n).collect();
            let last_round = of_count.iter().map(|r| r.round).max()?;
            let errors: Vec<f64> = of_count
                .iter()
                .filter(|r| r.round == last_round)
                .map(|r| r.distance)
                .collect();
            Some((n, errors.iter().sum::<f64>() / errors.len() as f64))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_scenario() -> ScenarioConfig {
        let mut config = ScenarioConfig::default();
        config.mesh.default_particles = 200;
        config.mesh_rounds = 1;
        config
    }

    #[test]
    fn config_round_trips_through_every_format() {
        let dir = tempdir().unwrap();
        let config = ScenarioConfig::default();
        for name in ["scenario.json", "scenario.yaml", "scenario.toml"] {
            let path = dir.path().join(name);
            config.to_file(&path).unwrap();
            let loaded = ScenarioConfig::from_file(&path).unwrap();
            assert_eq!(loaded, config, "{name}");
        }
        let bad = dir.path().join("scenario.txt");
        assert!(config.to_file(&bad).is_err());
        assert!(ScenarioConfig::from_file(&bad).is_err());
    }

    #[test]
    fn partial_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(
            &path,
            r#"{"mesh_rounds": 2, "nodes": [{"role": "anchor", "position": [1.0, 2.0, 3.0]}]}"#,
        )
        .unwrap();
        let config = ScenarioConfig::from_file(&path).unwrap();
        assert_eq!(config.mesh_rounds, 2);
        assert_eq!(config.anchor_rounds, 1);
        assert_eq!(config.nodes, vec![NodeConfig::anchor(1.0, 2.0, 3.0)]);
        assert_eq!(config.mesh.filter.correction_stages, 8);
    }

    #[test]
    fn scenario_records_every_unknown_each_round() {
        let config = small_scenario();
        let records = run_scenario(&config).unwrap();
        // 3 unknown nodes x (1 anchor round + 1 mesh round)
        assert_eq!(records.len(), 6);
        assert!(records[..3].iter().all(|r| r.phase == UpdatePhase::Anchors && r.round == 1));
        assert!(records[3..].iter().all(|r| r.phase == UpdatePhase::Mesh && r.round == 2));
        assert!(records.iter().all(|r| r.num_particles == 200));
        assert!(records.iter().all(|r| r.distance.is_finite() && r.var_x >= 0.0));
    }

    #[test]
    fn records_round_trip_through_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let records = run_scenario(&small_scenario()).unwrap();
        ConvergenceRecord::to_csv(&records, &path).unwrap();
        let loaded = ConvergenceRecord::from_csv(&path).unwrap();
        assert_eq!(loaded.len(), records.len());
        assert_eq!(loaded[0].id, records[0].id);
        assert_eq!(loaded[4].phase, UpdatePhase::Mesh);
    }

    #[test]
    fn sweep_overrides_particle_counts() {
        let mut config = small_scenario();
        config.mesh_rounds = 0;
        config.nodes[4].num_particles = Some(7);
        let records = particle_count_sweep(&config, &[20, 60]).unwrap();
        assert_eq!(records.len(), 6);
        let summary = final_error_by_particle_count(&records);
        assert_eq!(summary.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![20, 60]);
        assert!(particle_count_sweep(&config, &[0]).is_err());
    }
}
