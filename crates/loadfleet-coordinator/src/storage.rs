//! On-disk layout of the artifacts engines pull when a run starts.
//!
//! ```text
//! <root>/collection/<cid>/plan/<pid>/<test file>
//! <root>/collection/<cid>/plan/<pid>/<data file>/<engine id>/<data file>
//! ```

use loadfleet_core::{
    split_csv, CollectionId, EngineDataConfig, LoadfleetError, LoadfleetResult, PlanId,
    RenderedFile,
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Files of one (collection, plan) below the coordinator's file root.
#[derive(Debug, Clone)]
pub struct PlanFiles {
    root: PathBuf,
    collection_id: CollectionId,
    plan_id: PlanId,
}

impl PlanFiles {
    pub fn new(root: impl Into<PathBuf>, collection_id: CollectionId, plan_id: PlanId) -> Self {
        Self {
            root: root.into(),
            collection_id,
            plan_id,
        }
    }

    /// Directory path relative to the file root, as served under `/files`.
    pub fn relative_dir(&self) -> String {
        format!("collection/{}/plan/{}", self.collection_id, self.plan_id)
    }

    /// Absolute directory of the plan's files.
    pub fn dir(&self) -> PathBuf {
        self.root.join(self.relative_dir())
    }

    /// Where the rendered test file is stored.
    pub fn test_file_path(&self, filename: &str) -> PathBuf {
        self.dir().join(filename)
    }

    /// Where one engine's slice of a data file is stored.
    pub fn engine_data_path(&self, filename: &str, engine_id: u32) -> PathBuf {
        self.dir()
            .join(filename)
            .join(engine_id.to_string())
            .join(filename)
    }

    /// Write rendered test files into the plan directory.
    pub async fn store_test_files(&self, files: &[RenderedFile]) -> LoadfleetResult<()> {
        for file in files {
            check_filename(&file.filename)?;
            let path = self.test_file_path(&file.filename);
            write_file(&path, &file.content).await?;
            debug!(path = %path.display(), bytes = file.content.len(), "Test file stored");
        }
        Ok(())
    }

    /// Write each engine's slice of a data file.
    ///
    /// Engines whose config does not mention the file get it whole.
    pub async fn store_data_file(
        &self,
        filename: &str,
        content: &[u8],
        engines: &[EngineDataConfig],
    ) -> LoadfleetResult<()> {
        check_filename(filename)?;
        for engine in engines {
            let slice = match engine.engine_data.get(filename) {
                Some(edf) => split_csv(content, edf.total_splits, edf.current_split)?,
                None => content.to_vec(),
            };
            let path = self.engine_data_path(filename, engine.engine_id);
            write_file(&path, &slice).await?;
            debug!(path = %path.display(), engine_id = engine.engine_id, bytes = slice.len(), "Data file stored");
        }
        Ok(())
    }
}

fn check_filename(filename: &str) -> LoadfleetResult<()> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\'])
    {
        return Err(LoadfleetError::Precondition(format!(
            "invalid file name '{filename}'"
        )));
    }
    Ok(())
}

async fn write_file(path: &Path, content: &[u8]) -> LoadfleetResult<()> {
    if let Some(parent) = path.parent() {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(parent).await.map_err(|e| {
            LoadfleetError::Storage(format!("Failed to create '{}': {e}", parent.display()))
        })?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| LoadfleetError::Storage(format!("Failed to write '{}': {e}", path.display())))
}
