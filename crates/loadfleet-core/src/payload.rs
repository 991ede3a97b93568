use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::model::{CollectionId, PlanId, RunId};

/// Broker topic a collection's engines subscribe to.
pub fn collection_topic(collection_id: CollectionId) -> String {
    format!("collection:{collection_id}")
}

/// Command carried by a [`Payload`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    /// Fetch the referenced files and start generating load.
    Start,
    /// Stop generating load.
    #[default]
    Stop,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Start => write!(f, "start"),
            Verb::Stop => write!(f, "stop"),
        }
    }
}

/// Per-plan part of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMessage {
    /// Command for this plan's engines.
    #[serde(default)]
    pub verb: Verb,
    /// Run the engines report metrics under.
    #[serde(default)]
    pub run_id: RunId,
    /// Name of the test file to pull.
    #[serde(default)]
    pub test_file: String,
    /// Names of the data files to pull in addition to the test file.
    #[serde(default)]
    pub data_files: BTreeSet<String>,
}

impl EngineMessage {
    /// A start message for `run_id` with no files registered yet.
    pub fn start(run_id: RunId) -> Self {
        Self {
            verb: Verb::Start,
            run_id,
            ..Default::default()
        }
    }

    /// A stop message.
    pub fn stop() -> Self {
        Self::default()
    }
}

/// Plan id → message for that plan's engines.
pub type PlanMessage = BTreeMap<PlanId, EngineMessage>;

/// The message broadcast to every engine on a collection topic.
///
/// Engines act only on the entry keyed by their own plan id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Collection-wide command.
    pub verb: Verb,
    /// Per-plan messages.
    #[serde(default)]
    pub plan_message: PlanMessage,
}

impl Payload {
    /// A stop payload scoped to `plans`.
    pub fn stop<I: IntoIterator<Item = PlanId>>(plans: I) -> Self {
        Self {
            verb: Verb::Stop,
            plan_message: plans
                .into_iter()
                .map(|pid| (pid, EngineMessage::stop()))
                .collect(),
        }
    }

    /// The entry for `plan_id`, if this payload addresses that plan.
    pub fn for_plan(&self, plan_id: PlanId) -> Option<&EngineMessage> {
        self.plan_message.get(&plan_id)
    }

    /// Serialize to the wire format.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse from the wire format.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plans: Vec<String> = self.plan_message.keys().map(ToString::to_string).collect();
        write!(f, "{} [{}]", self.verb, plans.join(","))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_name() {
        assert_eq!(collection_topic(42), "collection:42");
    }

    #[test]
    fn test_payload_wire_round_trip_keeps_empty_data_files() {
        let mut start = EngineMessage::start(3);
        start.test_file = "plan.jmx".into();
        let mut with_data = EngineMessage::start(3);
        with_data.test_file = "locustfile.py".into();
        with_data.data_files.insert("users.csv".into());

        let payload = Payload {
            verb: Verb::Start,
            plan_message: [(1, start), (2, with_data)].into_iter().collect(),
        };

        let raw = payload.to_json().unwrap();
        let parsed = Payload::from_json(&raw).unwrap();
        assert_eq!(parsed, payload);
        assert!(parsed.for_plan(1).unwrap().data_files.is_empty());
        assert_eq!(parsed.for_plan(2).unwrap().data_files.len(), 1);
    }

    #[test]
    fn test_plan_ids_are_string_keys_on_the_wire() {
        let payload = Payload::stop([10, 11]);
        let value: serde_json::Value = serde_json::from_str(&payload.to_json().unwrap()).unwrap();
        assert_eq!(value["verb"], "stop");
        assert!(value["plan_message"]["10"].is_object());
        assert!(value["plan_message"]["11"].is_object());
    }

    #[test]
    fn test_sparse_stop_message_parses() {
        let parsed = Payload::from_json(r#"{"verb":"stop","plan_message":{"4":{}}}"#).unwrap();
        assert_eq!(parsed.verb, Verb::Stop);
        assert_eq!(parsed.for_plan(4), Some(&EngineMessage::stop()));
        assert!(parsed.for_plan(5).is_none());
    }

    #[test]
    fn test_display_lists_plans() {
        assert_eq!(Payload::stop([2, 1]).to_string(), "stop [1,2]");
    }
}
