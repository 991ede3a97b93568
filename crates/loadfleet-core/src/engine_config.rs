use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{ExecutionPlan, Plan, RunId};
use crate::plan_kind::PlanKind;

/// One data file as a specific engine should receive it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDataFile {
    /// Bare file name.
    pub filename: String,
    /// Object-storage path of the full file.
    pub filepath: String,
    /// Number of slices the file is cut into.
    pub total_splits: u32,
    /// Which slice this engine receives.
    pub current_split: u32,
}

impl EngineDataFile {
    /// A file that every engine receives in full.
    pub fn whole(filename: impl Into<String>, filepath: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            filepath: filepath.into(),
            total_splits: 1,
            current_split: 0,
        }
    }

    /// Cut this engine's slice further into `parts` and keep slice `index`.
    ///
    /// Used when a collection-level slice is split again across a plan's engines.
    /// Splits are round-robin, so sub-slice `index` of slice `c` out of `t`
    /// is slice `c + index * t` out of `t * parts`.
    pub fn subdivide(&self, parts: u32, index: u32) -> Self {
        let parts = parts.max(1);
        let total = self.total_splits.max(1);
        Self {
            filename: self.filename.clone(),
            filepath: self.filepath.clone(),
            total_splits: total * parts,
            current_split: self.current_split + index * total,
        }
    }
}

/// Per-engine data assignment for a single trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDataConfig {
    /// Files keyed by file name.
    #[serde(default)]
    pub engine_data: BTreeMap<String, EngineDataFile>,
    /// The run this assignment belongs to.
    pub run_id: RunId,
    /// Engine ordinal within the plan.
    pub engine_id: u32,
}

/// Everything the coordinator needs to start one plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEnginesConfig {
    /// Load generator kind.
    pub kind: PlanKind,
    /// Plan name (used by some test-file renderers).
    pub name: String,
    /// Duration in minutes.
    pub duration: u32,
    /// Virtual users per engine.
    pub concurrency: u32,
    /// Ramp-up in seconds.
    pub rampup: u32,
    /// One entry per engine ordinal.
    #[serde(rename = "engine_data_config")]
    pub engines_config: Vec<EngineDataConfig>,
}

impl PlanEnginesConfig {
    /// Build the config for a plan from its execution parameters and engine assignments.
    pub fn new(plan: &Plan, ep: &ExecutionPlan, engines_config: Vec<EngineDataConfig>) -> Self {
        Self {
            kind: plan.kind,
            name: plan.name.clone(),
            duration: ep.duration,
            concurrency: ep.concurrency,
            rampup: ep.rampup,
            engines_config,
        }
    }

    /// Number of engines this plan expects.
    pub fn engine_count(&self) -> usize {
        self.engines_config.len()
    }

    /// The run id carried by the engine assignments (0 when there are none).
    pub fn run_id(&self) -> RunId {
        self.engines_config.first().map(|c| c.run_id).unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_subdivide_whole_file() {
        let f = EngineDataFile::whole("users.csv", "p/users.csv");
        let s = f.subdivide(3, 2);
        assert_eq!(s.total_splits, 3);
        assert_eq!(s.current_split, 2);
    }

    #[test]
    fn test_subdivide_collection_slice() {
        let f = EngineDataFile {
            filename: "users.csv".into(),
            filepath: "c/users.csv".into(),
            total_splits: 2,
            current_split: 1,
        };
        let s = f.subdivide(2, 0);
        assert_eq!(s.total_splits, 4);
        assert_eq!(s.current_split, 1);
        let s = f.subdivide(2, 1);
        assert_eq!(s.current_split, 3);
    }

    #[test]
    fn test_subdivided_lines_stay_inside_parent_slice() {
        let content = b"0\n1\n2\n3\n4\n5\n6\n7\n8\n9\n";
        let parent = EngineDataFile {
            filename: "ids.csv".into(),
            filepath: "ids.csv".into(),
            total_splits: 2,
            current_split: 1,
        };
        let parent_lines =
            crate::split_csv(content, parent.total_splits, parent.current_split).unwrap();
        let mut union = Vec::new();
        for engine in 0..2 {
            let f = parent.subdivide(2, engine);
            let lines = crate::split_csv(content, f.total_splits, f.current_split).unwrap();
            for line in lines.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
                assert!(
                    parent_lines.split(|b| *b == b'\n').any(|p| p == line),
                    "engine {engine} got a line outside its parent slice"
                );
            }
            union.extend(lines);
        }
        union.sort_unstable();
        let mut expected = parent_lines.clone();
        expected.sort_unstable();
        assert_eq!(union, expected);
    }

    #[test]
    fn test_plan_engines_config_json_shape() {
        let pec = PlanEnginesConfig {
            kind: PlanKind::Jmeter,
            name: "checkout".into(),
            duration: 5,
            concurrency: 20,
            rampup: 30,
            engines_config: vec![EngineDataConfig {
                engine_data: BTreeMap::new(),
                run_id: 9,
                engine_id: 0,
            }],
        };
        let json = serde_json::to_value(&pec).unwrap();
        assert_eq!(json["kind"], "jmeter");
        assert_eq!(json["engine_data_config"][0]["run_id"], 9);
        assert_eq!(pec.run_id(), 9);
        assert_eq!(pec.engine_count(), 1);
    }
}
