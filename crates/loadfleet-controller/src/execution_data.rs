//! Assignment of data files to engines before a trigger.
//!
//! Collection data is first cut per plan when the collection's split flag is
//! set (plan `i` of `n` gets slice `i/n`). Each plan then cuts every file it
//! received, plus its own data, across its engines when the execution plan's
//! split flag is set; otherwise every engine gets the plan's slice in full.

use loadfleet_core::{
    Collection, DataFile, EngineDataConfig, EngineDataFile, ExecutionPlan, Plan, RunId,
};
use std::collections::BTreeMap;

/// Files keyed by name.
pub type FileShare = BTreeMap<String, EngineDataFile>;

/// Each plan's share of the collection data, in execution-plan order.
pub fn split_collection_data(collection: &Collection) -> Vec<FileShare> {
    let plan_count = collection.execution_plans.len() as u32;
    (0..plan_count)
        .map(|i| {
            collection
                .data
                .iter()
                .map(|d| {
                    let whole = EngineDataFile::whole(&d.filename, &d.filepath);
                    let share = if collection.csv_split {
                        EngineDataFile {
                            total_splits: plan_count,
                            current_split: i,
                            ..whole
                        }
                    } else {
                        whole
                    };
                    (d.filename.clone(), share)
                })
                .collect()
        })
        .collect()
}

/// Per-engine file assignment for one plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionData {
    csv_split: bool,
    files: Vec<FileShare>,
}

impl ExecutionData {
    /// No files yet for `engines` engines; `csv_split` cuts files across them.
    pub fn new(engines: u32, csv_split: bool) -> Self {
        Self {
            csv_split,
            files: vec![FileShare::new(); engines as usize],
        }
    }

    /// Assign `file` to every engine, replacing an earlier file of the same name.
    pub fn add(&mut self, file: &EngineDataFile) {
        let engines = self.files.len() as u32;
        for (i, share) in self.files.iter_mut().enumerate() {
            let assigned = if self.csv_split {
                file.subdivide(engines, i as u32)
            } else {
                file.clone()
            };
            share.insert(file.filename.clone(), assigned);
        }
    }

    /// Files assigned to one engine.
    pub fn engine_files(&self, engine_id: usize) -> Option<&FileShare> {
        self.files.get(engine_id)
    }

    pub fn into_engine_configs(self, run_id: RunId) -> Vec<EngineDataConfig> {
        self.files
            .into_iter()
            .enumerate()
            .map(|(i, engine_data)| EngineDataConfig {
                engine_data,
                run_id,
                engine_id: i as u32,
            })
            .collect()
    }
}

/// Build the engine configs for one plan from its share of collection data and its own data.
///
/// Plan data wins over collection data with the same file name.
pub fn prepare_plan(
    ep: &ExecutionPlan,
    plan: &Plan,
    collection_share: &FileShare,
    run_id: RunId,
) -> Vec<EngineDataConfig> {
    let mut data = ExecutionData::new(ep.engines, ep.csv_split);
    for file in collection_share.values() {
        data.add(file);
    }
    for DataFile {
        filename, filepath, ..
    } in &plan.data
    {
        data.add(&EngineDataFile::whole(filename, filepath));
    }
    data.into_engine_configs(run_id)
}
