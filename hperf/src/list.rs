use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use hperf_pmu::{ArchitectureProfile, EventScope};
use itertools::Itertools;

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn architectures_table() -> Table {
    let mut table = new_table(vec!["ID", "Name", "Vendor", "ISA", "Counters"]);
    for arch in hperf_pmu::known_architectures() {
        table.add_row(vec![
            arch.arch_id.clone(),
            arch.name.clone(),
            arch.vendor.clone(),
            arch.isa.clone(),
            arch.available_counters.to_string(),
        ]);
    }
    table
}

fn role(profile: &ArchitectureProfile, id: u32) -> &'static str {
    if profile.other_events().contains(&id) {
        "always on"
    } else if profile.pinned_events().contains(&id) {
        "pinned"
    } else {
        "multiplexed"
    }
}

fn scope_name(scope: EventScope) -> &'static str {
    match scope {
        EventScope::Cpu => "CPU",
        EventScope::Socket => "SOCKET",
        EventScope::System => "SYSTEM",
    }
}

/// Events, planned groups and metrics of one profile.
pub fn describe(profile: &ArchitectureProfile) -> String {
    let mut events = new_table(vec!["ID", "Token", "Name", "Scope", "Role"]);
    for event in profile.events() {
        events.add_row(vec![
            event.id.to_string(),
            event.token.clone(),
            event.name.clone(),
            scope_name(event.scope).to_string(),
            role(profile, event.id).to_string(),
        ]);
    }

    let mut groups = new_table(vec!["Group", "Events"]);
    for (idx, group) in hperf_pmu::optimize_groups(profile).iter().enumerate() {
        let names = group
            .iter()
            .map(|id| profile.event(*id).map_or("?", |evt| evt.name.as_str()))
            .join(", ");
        groups.add_row(vec![idx.to_string(), names]);
    }

    let mut metrics = new_table(vec!["Metric", "Expression"]);
    for metric in profile.metrics() {
        metrics.add_row(vec![metric.name.clone(), metric.expression.clone()]);
    }

    format!(
        "{} ({}, {} general-purpose counters)\n{events}\n{groups}\n{metrics}",
        profile.name(),
        profile.isa(),
        profile.available_counters()
    )
}
