//! Experiment configuration model.
//!
//! Steps may be written either as a list or as a mapping keyed by step uid;
//! both keep the order of the file:
//!
//! ```yaml
//! metadata:
//!   name: Burn-in
//! steps:
//!   power-on:
//!     class: SetInstrument
//!     instrument_uid: psu-enable
//!     value: true
//!   settle:
//!     class: Wait
//!     duration: 2.0
//! ```

use crate::step::StepConfiguration;
use bench_core::{BenchError, BenchResult};
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Descriptive metadata of an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    /// Display name
    pub name: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Contents of one experiment-scope configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfiguration {
    pub metadata: ExperimentMetadata,
    /// Steps in execution order
    #[serde(default, deserialize_with = "ordered_steps")]
    pub steps: Vec<StepConfiguration>,
}

impl ExperimentConfiguration {
    /// Reject empty or duplicate step uids.
    pub fn validate(&self) -> BenchResult<()> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            let uid = step.metadata.uid.as_str();
            if uid.is_empty() {
                return Err(BenchError::configuration(format!(
                    "'{}': step of class '{}' has no uid",
                    self.metadata.name, step.class
                )));
            }
            if !seen.insert(uid) {
                return Err(BenchError::configuration(format!(
                    "'{}': duplicate step uid '{uid}'",
                    self.metadata.name
                )));
            }
        }
        Ok(())
    }
}

fn ordered_steps<'de, D>(deserializer: D) -> Result<Vec<StepConfiguration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StepsVisitor;

    impl<'de> Visitor<'de> for StepsVisitor {
        type Value = Vec<StepConfiguration>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a list of steps or a mapping from step uid to step")
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut steps = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(step) = seq.next_element::<StepConfiguration>()? {
                steps.push(step);
            }
            Ok(steps)
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut steps = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((uid, mut step)) = map.next_entry::<String, StepConfiguration>()? {
                if step.metadata.uid.is_empty() {
                    step.metadata.uid = uid;
                } else if step.metadata.uid != uid {
                    return Err(de::Error::custom(format!(
                        "step keyed '{uid}' declares uid '{}'",
                        step.metadata.uid
                    )));
                }
                steps.push(step);
            }
            Ok(steps)
        }
    }

    deserializer.deserialize_any(StepsVisitor)
}
