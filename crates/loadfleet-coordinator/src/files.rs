//! Multipart field keys and assembly of the start payload on trigger.

use loadfleet_core::{
    CollectionId, EngineMessage, LoadfleetError, LoadfleetResult, Payload, PlanEnginesConfig,
    PlanId, PlanMessage, Verb,
};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::storage::PlanFiles;

/// Multipart field name carrying the per-plan engine configs.
pub const ENGINE_DATA_FIELD: &str = "engine_data";

/// Structured key of an uploaded file field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormFileKey {
    /// `test:<plan id>`: the plan's test script.
    Test(PlanId),
    /// `data:plan:<plan id>`: a data file for one plan.
    PlanData(PlanId),
    /// `data:collection:<name>`: a data file shared by every plan.
    CollectionData(String),
}

impl fmt::Display for FormFileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormFileKey::Test(pid) => write!(f, "test:{pid}"),
            FormFileKey::PlanData(pid) => write!(f, "data:plan:{pid}"),
            FormFileKey::CollectionData(name) => write!(f, "data:collection:{name}"),
        }
    }
}

impl FromStr for FormFileKey {
    type Err = LoadfleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_plan = |raw: &str| {
            raw.parse::<PlanId>()
                .map_err(|_| LoadfleetError::Precondition(format!("invalid plan id in form key '{s}'")))
        };
        if let Some(pid) = s.strip_prefix("test:") {
            return Ok(FormFileKey::Test(parse_plan(pid)?));
        }
        if let Some(pid) = s.strip_prefix("data:plan:") {
            return Ok(FormFileKey::PlanData(parse_plan(pid)?));
        }
        if let Some(name) = s.strip_prefix("data:collection:") {
            if !name.is_empty() {
                return Ok(FormFileKey::CollectionData(name.to_string()));
            }
        }
        Err(LoadfleetError::Precondition(format!("unknown form key '{s}'")))
    }
}

/// One uploaded file field.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Parsed form field name.
    pub key: FormFileKey,
    /// Client-supplied file name.
    pub filename: String,
    /// Raw file bytes.
    pub content: Vec<u8>,
}

/// Persist every upload and build the `start` payload announcing them.
///
/// Collection data goes to every plan in `configs`. A key naming a plan that
/// is not in `configs` is rejected.
pub async fn prepare_start(
    root: &Path,
    collection_id: CollectionId,
    configs: &BTreeMap<PlanId, PlanEnginesConfig>,
    uploads: &[UploadedFile],
) -> LoadfleetResult<Payload> {
    let mut plan_message = PlanMessage::new();
    for (pid, pec) in configs {
        plan_message.insert(*pid, EngineMessage::start(pec.run_id()));
    }

    for upload in uploads {
        match &upload.key {
            FormFileKey::Test(pid) => {
                let pec = plan_config(configs, *pid)?;
                let cap = pec.kind.capability();
                if !pec.kind.is_valid_test_file(&upload.filename) {
                    return Err(LoadfleetError::Precondition(format!(
                        "{} is not a {} test file",
                        upload.filename, pec.kind
                    )));
                }
                let rendered = (cap.render)(&upload.filename, &upload.content, pec)?;
                PlanFiles::new(root, collection_id, *pid)
                    .store_test_files(&rendered)
                    .await?;
                if let Some(msg) = plan_message.get_mut(pid) {
                    msg.test_file = upload.filename.clone();
                }
            }
            FormFileKey::PlanData(pid) => {
                let pec = plan_config(configs, *pid)?;
                PlanFiles::new(root, collection_id, *pid)
                    .store_data_file(&upload.filename, &upload.content, &pec.engines_config)
                    .await?;
                if let Some(msg) = plan_message.get_mut(pid) {
                    msg.data_files.insert(upload.filename.clone());
                }
            }
            FormFileKey::CollectionData(_) => {
                for (pid, pec) in configs {
                    PlanFiles::new(root, collection_id, *pid)
                        .store_data_file(&upload.filename, &upload.content, &pec.engines_config)
                        .await?;
                    if let Some(msg) = plan_message.get_mut(pid) {
                        msg.data_files.insert(upload.filename.clone());
                    }
                }
            }
        }
    }

    Ok(Payload {
        verb: Verb::Start,
        plan_message,
    })
}

fn plan_config(
    configs: &BTreeMap<PlanId, PlanEnginesConfig>,
    plan_id: PlanId,
) -> LoadfleetResult<&PlanEnginesConfig> {
    configs.get(&plan_id).ok_or_else(|| {
        LoadfleetError::Precondition(format!("plan {plan_id} is not part of this trigger"))
    })
}

/// Total engines requested across every plan.
pub fn required_engines(configs: &BTreeMap<PlanId, PlanEnginesConfig>) -> usize {
    configs.values().map(PlanEnginesConfig::engine_count).sum()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use loadfleet_core::{EngineDataConfig, EngineDataFile, PlanKind};

    fn pec(kind: PlanKind, engines: u32) -> PlanEnginesConfig {
        PlanEnginesConfig {
            kind,
            name: "p".into(),
            duration: 1,
            concurrency: 10,
            rampup: 1,
            engines_config: (0..engines)
                .map(|engine_id| {
                    let mut engine_data = BTreeMap::new();
                    engine_data.insert(
                        "ids.csv".to_string(),
                        EngineDataFile::whole("ids.csv", "ids.csv").subdivide(engines, engine_id),
                    );
                    EngineDataConfig {
                        engine_data,
                        run_id: 42,
                        engine_id,
                    }
                })
                .collect(),
        }
    }

    #[test]
    fn test_form_key_parsing() {
        assert_eq!("test:5".parse::<FormFileKey>().unwrap(), FormFileKey::Test(5));
        assert_eq!(
            "data:plan:6".parse::<FormFileKey>().unwrap(),
            FormFileKey::PlanData(6)
        );
        assert_eq!(
            "data:collection:ids.csv".parse::<FormFileKey>().unwrap(),
            FormFileKey::CollectionData("ids.csv".into())
        );
        assert!("test:x".parse::<FormFileKey>().is_err());
        assert!("data:collection:".parse::<FormFileKey>().is_err());
        assert!("other".parse::<FormFileKey>().is_err());
        assert_eq!(FormFileKey::PlanData(6).to_string(), "data:plan:6");
    }

    #[tokio::test]
    async fn test_prepare_start_routes_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let configs: BTreeMap<PlanId, PlanEnginesConfig> =
            [(1, pec(PlanKind::Locust, 2)), (2, pec(PlanKind::Locust, 1))]
                .into_iter()
                .collect();
        let uploads = vec![
            UploadedFile {
                key: FormFileKey::Test(1),
                filename: "locustfile.py".into(),
                content: b"pass\n".to_vec(),
            },
            UploadedFile {
                key: FormFileKey::CollectionData("ids.csv".into()),
                filename: "ids.csv".into(),
                content: b"1\n2\n3\n4\n".to_vec(),
            },
            UploadedFile {
                key: FormFileKey::PlanData(2),
                filename: "extra.csv".into(),
                content: b"x\n".to_vec(),
            },
        ];
        let payload = prepare_start(dir.path(), 9, &configs, &uploads).await.unwrap();

        assert_eq!(payload.verb, Verb::Start);
        let one = payload.for_plan(1).unwrap();
        assert_eq!(one.run_id, 42);
        assert_eq!(one.test_file, "locustfile.py");
        assert_eq!(one.data_files.iter().collect::<Vec<_>>(), vec!["ids.csv"]);
        let two = payload.for_plan(2).unwrap();
        assert!(two.test_file.is_empty());
        assert_eq!(two.data_files.len(), 2);

        let p1 = PlanFiles::new(dir.path(), 9, 1);
        assert!(p1.test_file_path("locust.conf").exists());
        assert_eq!(std::fs::read(p1.engine_data_path("ids.csv", 0)).unwrap(), b"1\n3\n");
        assert_eq!(std::fs::read(p1.engine_data_path("ids.csv", 1)).unwrap(), b"2\n4\n");
        let p2 = PlanFiles::new(dir.path(), 9, 2);
        assert_eq!(std::fs::read(p2.engine_data_path("ids.csv", 0)).unwrap(), b"1\n2\n3\n4\n");
        assert_eq!(std::fs::read(p2.engine_data_path("extra.csv", 0)).unwrap(), b"x\n");
    }

    #[tokio::test]
    async fn test_prepare_start_rejects_unknown_plan_and_bad_extension() {
        let dir = tempfile::tempdir().unwrap();
        let configs: BTreeMap<PlanId, PlanEnginesConfig> =
            [(1, pec(PlanKind::Jmeter, 1))].into_iter().collect();

        let unknown = vec![UploadedFile {
            key: FormFileKey::PlanData(7),
            filename: "x.csv".into(),
            content: vec![],
        }];
        let err = prepare_start(dir.path(), 1, &configs, &unknown).await.unwrap_err();
        assert!(err.is_precondition());

        let wrong = vec![UploadedFile {
            key: FormFileKey::Test(1),
            filename: "locustfile.py".into(),
            content: vec![],
        }];
        let err = prepare_start(dir.path(), 1, &configs, &wrong).await.unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn test_required_engines() {
        let configs: BTreeMap<PlanId, PlanEnginesConfig> =
            [(1, pec(PlanKind::Jmeter, 2)), (2, pec(PlanKind::Jmeter, 3))]
                .into_iter()
                .collect();
        assert_eq!(required_engines(&configs), 5);
    }
}
