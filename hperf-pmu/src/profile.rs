use std::collections::HashMap;

use hperf_data::{arith_parser, operand_event_id, ArchDesc, EventDesc, EventScope};

use crate::{cpu_family, Error};

#[derive(Debug, Clone)]
pub struct CompiledMetric {
    pub name: String,
    pub expression: String,
    pub expr: arith_parser::Expr,
}

impl CompiledMetric {
    /// Evaluates the metric for one interval. `value_of` returns the summed
    /// value of an event by id.
    pub fn evaluate<F>(&self, value_of: F) -> f64
    where
        F: Fn(u32) -> Option<f64>,
    {
        self.expr
            .eval(&|operand: &str| operand_event_id(operand).and_then(&value_of))
    }
}

/// A validated architecture description with its metric expressions parsed.
#[derive(Debug, Clone)]
pub struct ArchitectureProfile {
    arch_id: String,
    name: String,
    vendor: String,
    isa: String,
    available_counters: usize,
    events: Vec<EventDesc>,
    other_events: Vec<u32>,
    pinned_events: Vec<u32>,
    initial_groups: Vec<Vec<u32>>,
    metrics: Vec<CompiledMetric>,
    by_id: HashMap<u32, usize>,
    by_token: HashMap<String, usize>,
}

impl ArchitectureProfile {
    pub fn load(arch_id: &str) -> Result<Self, Error> {
        let desc = cpu_family::find_architecture(arch_id)
            .ok_or_else(|| Error::UnknownArchitecture(arch_id.to_string()))?;
        ArchitectureProfile::from_desc(desc.clone())
    }

    pub fn from_desc(desc: ArchDesc) -> Result<Self, Error> {
        desc.validate()?;

        let mut metrics = Vec::with_capacity(desc.metrics.len());
        for metric in desc.metrics {
            let expr = arith_parser::parse_expr(&metric.expression).map_err(|source| {
                hperf_data::DescError::InvalidExpression {
                    arch: desc.arch_id.clone(),
                    metric: metric.name.clone(),
                    source,
                }
            })?;
            metrics.push(CompiledMetric {
                name: metric.name,
                expression: metric.expression,
                expr,
            });
        }

        let by_id = desc
            .events
            .iter()
            .enumerate()
            .map(|(idx, evt)| (evt.id, idx))
            .collect();
        let by_token = desc
            .events
            .iter()
            .enumerate()
            .map(|(idx, evt)| (evt.token.clone(), idx))
            .collect();

        Ok(ArchitectureProfile {
            arch_id: desc.arch_id,
            name: desc.name,
            vendor: desc.vendor,
            isa: desc.isa,
            available_counters: desc.available_counters,
            events: desc.events,
            other_events: desc.other_events,
            pinned_events: desc.pinned_events,
            initial_groups: desc.event_groups,
            metrics,
            by_id,
            by_token,
        })
    }

    pub fn arch_id(&self) -> &str {
        &self.arch_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn isa(&self) -> &str {
        &self.isa
    }

    pub fn available_counters(&self) -> usize {
        self.available_counters
    }

    pub fn events(&self) -> &[EventDesc] {
        &self.events
    }

    pub fn other_events(&self) -> &[u32] {
        &self.other_events
    }

    pub fn pinned_events(&self) -> &[u32] {
        &self.pinned_events
    }

    pub fn initial_groups(&self) -> &[Vec<u32>] {
        &self.initial_groups
    }

    pub fn metrics(&self) -> &[CompiledMetric] {
        &self.metrics
    }

    pub fn event(&self, id: u32) -> Option<&EventDesc> {
        self.by_id.get(&id).map(|idx| &self.events[*idx])
    }

    /// Resolves a token as printed by the sampler, ignoring modifiers such
    /// as the `:D` pin marker.
    pub fn event_by_token(&self, token: &str) -> Option<&EventDesc> {
        let base = token.split(':').next().unwrap_or(token);
        self.by_token.get(base).map(|idx| &self.events[*idx])
    }

    pub fn has_scope(&self, scope: EventScope) -> bool {
        self.events.iter().any(|evt| evt.scope == scope)
    }
}

#[cfg(test)]
mod tests {
    use hperf_data::{ARM_GENERIC, INTEL_CASCADELAKE, INTEL_ICELAKE};

    use super::*;

    #[test]
    fn every_profile_loads() {
        for id in [INTEL_ICELAKE, INTEL_CASCADELAKE, ARM_GENERIC] {
            let profile = ArchitectureProfile::load(id).unwrap();
            assert_eq!(profile.arch_id(), id);
            assert!(!profile.metrics().is_empty());
        }
    }

    #[test]
    fn unknown_profile_is_rejected() {
        assert!(matches!(
            ArchitectureProfile::load("amd"),
            Err(Error::UnknownArchitecture(_))
        ));
    }

    #[test]
    fn metric_operands_exist_in_profile() {
        for desc in cpu_family::known_architectures() {
            let profile = ArchitectureProfile::from_desc(desc.clone()).unwrap();
            for metric in profile.metrics() {
                for operand in metric.expr.variables() {
                    let id = operand_event_id(operand).unwrap();
                    assert!(
                        profile.event(id).is_some(),
                        "{}: {} uses {operand}",
                        profile.arch_id(),
                        metric.name
                    );
                }
            }
        }
    }

    #[test]
    fn resolves_tokens_with_modifiers() {
        let profile = ArchitectureProfile::load(INTEL_ICELAKE).unwrap();
        assert_eq!(profile.event_by_token("cycles:D").unwrap().id, 20);
        assert_eq!(
            profile
                .event_by_token("cha/event=0x34,umask=0x1fe001/")
                .unwrap()
                .name,
            "LL CACHE MISSES"
        );
        assert!(profile.event_by_token("bogus").is_none());
    }

    #[test]
    fn scopes_are_reported() {
        let icelake = ArchitectureProfile::load(INTEL_ICELAKE).unwrap();
        assert!(icelake.has_scope(EventScope::Socket));
        assert!(icelake.has_scope(EventScope::System));

        let arm = ArchitectureProfile::load(ARM_GENERIC).unwrap();
        assert!(!arm.has_scope(EventScope::Socket));
    }

    #[test]
    fn evaluates_compiled_metric() {
        let profile = ArchitectureProfile::load(INTEL_CASCADELAKE).unwrap();
        let cpi = profile.metrics().iter().find(|m| m.name == "CPI").unwrap();

        let values = HashMap::from([(20, 300.0), (21, 150.0)]);
        assert_eq!(cpi.evaluate(|id| values.get(&id).copied()), 2.0);
        assert!(cpi.evaluate(|id| if id == 21 { Some(0.0) } else { Some(1.0) }).is_nan());
    }

    #[test]
    fn rejects_invalid_description() {
        let mut desc = cpu_family::find_architecture(ARM_GENERIC).unwrap().clone();
        desc.metrics[0].expression = "e0 / e999".to_string();
        assert!(matches!(
            ArchitectureProfile::from_desc(desc),
            Err(Error::InvalidProfile(_))
        ));
    }
}
