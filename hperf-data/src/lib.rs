pub mod arith_parser;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use arith_parser::ParseError;

// Instruction set architectures reported by `lscpu`
pub const ISA_X86_64: &str = "x86_64";
pub const ISA_AARCH64: &str = "aarch64";

// Well-known architecture profiles
pub const INTEL_ICELAKE: &str = "intel_icelake";
pub const INTEL_CASCADELAKE: &str = "intel_cascadelake";
pub const ARM_GENERIC: &str = "arm";

/// Granularity at which the sampler attributes an event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventScope {
    #[default]
    Cpu,
    Socket,
    System,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchDesc {
    pub arch_id: String,
    pub name: String,
    pub vendor: String,
    pub isa: String,
    pub available_counters: usize,
    pub events: Vec<EventDesc>,
    pub other_events: Vec<u32>,
    pub pinned_events: Vec<u32>,
    pub event_groups: Vec<Vec<u32>>,
    pub metrics: Vec<Metric>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDesc {
    pub id: u32,
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub scope: EventScope,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub expression: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescError {
    #[error("'{arch}' declares no general-purpose counters")]
    NoCounters { arch: String },
    #[error("'{arch}' defines event id {id} more than once")]
    DuplicateId { arch: String, id: u32 },
    #[error("'{arch}' defines event token '{token}' more than once")]
    DuplicateToken { arch: String, token: String },
    #[error("'{arch}' defines event name '{name}' more than once")]
    DuplicateName { arch: String, name: String },
    #[error("'{arch}' references undefined event id {id} in {context}")]
    UnknownEventId {
        arch: String,
        id: u32,
        context: &'static str,
    },
    #[error("'{arch}' seeds a group of {size} events but has only {capacity} counters")]
    OversizedGroup {
        arch: String,
        size: usize,
        capacity: usize,
    },
    #[error("metric '{metric}' of '{arch}' references unknown operand '{operand}'")]
    UnknownOperand {
        arch: String,
        metric: String,
        operand: String,
    },
    #[error("metric '{metric}' of '{arch}' is malformed: {source}")]
    InvalidExpression {
        arch: String,
        metric: String,
        #[source]
        source: ParseError,
    },
}

/// Name under which an event's value is visible to metric expressions.
pub fn operand_name(id: u32) -> String {
    format!("e{id}")
}

/// Inverse of [`operand_name`].
pub fn operand_event_id(operand: &str) -> Option<u32> {
    operand.strip_prefix('e')?.parse().ok()
}

impl ArchDesc {
    pub fn event(&self, id: u32) -> Option<&EventDesc> {
        self.events.iter().find(|evt| evt.id == id)
    }

    pub fn validate(&self) -> Result<(), DescError> {
        let arch = || self.arch_id.clone();

        if self.available_counters == 0 {
            return Err(DescError::NoCounters { arch: arch() });
        }

        let mut ids = HashSet::new();
        let mut tokens = HashSet::new();
        let mut names = HashSet::new();
        for evt in &self.events {
            if !ids.insert(evt.id) {
                return Err(DescError::DuplicateId {
                    arch: arch(),
                    id: evt.id,
                });
            }
            if !tokens.insert(evt.token.as_str()) {
                return Err(DescError::DuplicateToken {
                    arch: arch(),
                    token: evt.token.clone(),
                });
            }
            if !names.insert(evt.name.as_str()) {
                return Err(DescError::DuplicateName {
                    arch: arch(),
                    name: evt.name.clone(),
                });
            }
        }

        let referenced = self
            .other_events
            .iter()
            .map(|id| (*id, "other events"))
            .chain(self.pinned_events.iter().map(|id| (*id, "pinned events")))
            .chain(
                self.event_groups
                    .iter()
                    .flatten()
                    .map(|id| (*id, "event groups")),
            );
        for (id, context) in referenced {
            if !ids.contains(&id) {
                return Err(DescError::UnknownEventId {
                    arch: arch(),
                    id,
                    context,
                });
            }
        }

        for group in &self.event_groups {
            if group.len() > self.available_counters {
                return Err(DescError::OversizedGroup {
                    arch: arch(),
                    size: group.len(),
                    capacity: self.available_counters,
                });
            }
        }

        for metric in &self.metrics {
            let expr = arith_parser::parse_expr(&metric.expression).map_err(|source| {
                DescError::InvalidExpression {
                    arch: arch(),
                    metric: metric.name.clone(),
                    source,
                }
            })?;

            for operand in expr.variables() {
                let known = operand_event_id(operand).is_some_and(|id| ids.contains(&id));
                if !known {
                    return Err(DescError::UnknownOperand {
                        arch: arch(),
                        metric: metric.name.clone(),
                        operand: operand.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_desc() -> ArchDesc {
        let json = r#"
        {
            "arch_id": "test",
            "name": "Test",
            "vendor": "Nobody",
            "isa": "x86_64",
            "available_counters": 4,
            "events": [
                { "id": 1, "token": "duration_time", "name": "WALL CLOCK TIME", "scope": "SYSTEM" },
                { "id": 20, "token": "cycles", "name": "CYCLES" },
                { "id": 21, "token": "instructions", "name": "INSTRUCTIONS" },
                { "id": 100, "token": "cha/event=0x34,umask=0x1fe001/", "name": "LL CACHE MISSES", "scope": "SOCKET" }
            ],
            "other_events": [1, 100],
            "pinned_events": [20, 21],
            "event_groups": [],
            "metrics": [
                { "name": "CPI", "expression": "e20 / e21" }
            ]
        }
        "#;

        serde_json::from_str(json).expect("failed to parse architecture json")
    }

    #[test]
    fn parses_scopes_with_default() {
        let desc = sample_desc();
        assert_eq!(desc.event(1).unwrap().scope, EventScope::System);
        assert_eq!(desc.event(20).unwrap().scope, EventScope::Cpu);
        assert_eq!(desc.event(100).unwrap().scope, EventScope::Socket);
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn operand_names_round_trip() {
        assert_eq!(operand_name(110), "e110");
        assert_eq!(operand_event_id("e110"), Some(110));
        assert_eq!(operand_event_id("x110"), None);
        assert_eq!(operand_event_id("e"), None);
    }

    #[test]
    fn rejects_unknown_operand() {
        let mut desc = sample_desc();
        desc.metrics.push(Metric {
            name: "BROKEN".to_string(),
            expression: "e20 / e99".to_string(),
        });

        assert_eq!(
            desc.validate(),
            Err(DescError::UnknownOperand {
                arch: "test".to_string(),
                metric: "BROKEN".to_string(),
                operand: "e99".to_string(),
            })
        );
    }

    #[test]
    fn rejects_dangling_group_member() {
        let mut desc = sample_desc();
        desc.event_groups.push(vec![20, 42]);

        assert!(matches!(
            desc.validate(),
            Err(DescError::UnknownEventId { id: 42, .. })
        ));
    }

    #[test]
    fn rejects_group_larger_than_counters() {
        let mut desc = sample_desc();
        desc.event_groups.push(vec![1, 20, 21, 100, 1]);

        assert!(matches!(
            desc.validate(),
            Err(DescError::OversizedGroup { size: 5, capacity: 4, .. })
        ));
    }

    #[test]
    fn rejects_duplicate_tokens() {
        let mut desc = sample_desc();
        desc.events.push(EventDesc {
            id: 22,
            token: "cycles".to_string(),
            name: "MORE CYCLES".to_string(),
            scope: EventScope::Cpu,
        });

        assert!(matches!(
            desc.validate(),
            Err(DescError::DuplicateToken { .. })
        ));
    }

    #[test]
    fn rejects_malformed_expression() {
        let mut desc = sample_desc();
        desc.metrics[0].expression = "e20 /".to_string();

        assert!(matches!(
            desc.validate(),
            Err(DescError::InvalidExpression { .. })
        ));
    }
}
