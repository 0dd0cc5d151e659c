//! Packing of multiplexed events into counter groups and rendering of the
//! `perf stat -e` selection.

use std::collections::{BTreeSet, HashSet};

use itertools::Itertools;

use crate::{ArchitectureProfile, Error};

/// Ids of events the sampler schedules onto the counters together.
pub type EventGroup = BTreeSet<u32>;

/// Marks an event that must keep its counter for the whole run.
pub const PINNED_SUFFIX: &str = ":D";

/// Greedily merges seed groups while the merged group fits into `capacity`
/// counters.
///
/// Events listed in `excluded` are dropped from the seeds first, and seeds
/// left empty disappear. Each round takes the smallest group, pairs it with
/// the group that yields the smallest union and merges the two at the front.
/// The first pair that does not fit is put back in place and packing stops.
pub fn pack_groups(seeds: &[Vec<u32>], excluded: &HashSet<u32>, capacity: usize) -> Vec<EventGroup> {
    let mut candidates: Vec<EventGroup> = seeds
        .iter()
        .map(|seed| {
            seed.iter()
                .copied()
                .filter(|id| !excluded.contains(id))
                .collect::<EventGroup>()
        })
        .filter(|group| !group.is_empty())
        .collect();

    while candidates.len() > 1 {
        let Some(i) = candidates.iter().position_min_by_key(|group| group.len()) else {
            break;
        };
        let gi = candidates.remove(i);

        let Some(j) = candidates
            .iter()
            .position_min_by_key(|group| group.union(&gi).count())
        else {
            candidates.insert(i, gi);
            break;
        };
        let gj = candidates.remove(j);

        let merged: EventGroup = gi.union(&gj).copied().collect();
        if merged.len() <= capacity {
            candidates.insert(0, merged);
        } else {
            candidates.insert(j, gj);
            candidates.insert(i, gi);
            break;
        }
    }

    candidates
}

pub fn optimize_groups(profile: &ArchitectureProfile) -> Vec<EventGroup> {
    let excluded: HashSet<u32> = profile
        .other_events()
        .iter()
        .chain(profile.pinned_events())
        .copied()
        .collect();

    pack_groups(
        profile.initial_groups(),
        &excluded,
        profile.available_counters(),
    )
}

pub fn selection_string(
    profile: &ArchitectureProfile,
    groups: &[EventGroup],
) -> Result<String, Error> {
    let token = |id: u32| {
        profile
            .event(id)
            .map(|evt| evt.token.as_str())
            .ok_or(Error::MissingEvent(id))
    };

    let mut parts = vec![];
    for id in profile.other_events() {
        parts.push(token(*id)?.to_string());
    }
    for id in profile.pinned_events() {
        parts.push(format!("{}{PINNED_SUFFIX}", token(*id)?));
    }
    for group in groups {
        let tokens = group
            .iter()
            .map(|id| token(*id))
            .collect::<Result<Vec<_>, _>>()?;
        parts.push(format!("'{{{}}}'", tokens.join(",")));
    }

    Ok(parts.join(","))
}

/// Tokens recovered from a selection string, by role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSelection {
    pub standalone: Vec<String>,
    pub pinned: Vec<String>,
    pub groups: Vec<Vec<String>>,
}

pub fn parse_selection_string(selection: &str) -> Result<ParsedSelection, Error> {
    let mut parsed = ParsedSelection::default();
    if selection.is_empty() {
        return Ok(parsed);
    }

    let malformed = || Error::MalformedSelection(selection.to_string());

    for item in split_top_level(selection).ok_or_else(malformed)? {
        if item.is_empty() {
            return Err(malformed());
        }

        if let Some(inner) = item
            .strip_prefix("'{")
            .and_then(|rest| rest.strip_suffix("}'"))
        {
            let tokens = split_top_level(inner).ok_or_else(malformed)?;
            if tokens.iter().any(|tok| tok.is_empty()) {
                return Err(malformed());
            }
            parsed
                .groups
                .push(tokens.into_iter().map(str::to_string).collect());
        } else if item.contains(['{', '}', '\'']) {
            return Err(malformed());
        } else if let Some(token) = item.strip_suffix(PINNED_SUFFIX) {
            parsed.pinned.push(token.to_string());
        } else {
            parsed.standalone.push(item.to_string());
        }
    }

    Ok(parsed)
}

// Splits on commas that are neither inside a group nor inside a
// `pmu/param=..,param=../` token.
fn split_top_level(s: &str) -> Option<Vec<&str>> {
    let mut items = vec![];
    let mut depth = 0usize;
    let mut in_pmu = false;
    let mut start = 0;

    for (pos, c) in s.char_indices() {
        match c {
            '/' => in_pmu = !in_pmu,
            '{' if !in_pmu => depth += 1,
            '}' if !in_pmu => depth = depth.checked_sub(1)?,
            ',' if depth == 0 && !in_pmu => {
                items.push(&s[start..pos]);
                start = pos + 1;
            }
            _ => {}
        }
    }

    if depth != 0 || in_pmu {
        return None;
    }
    items.push(&s[start..]);
    Some(items)
}

#[cfg(test)]
mod tests {
    use hperf_data::{ARM_GENERIC, INTEL_CASCADELAKE, INTEL_ICELAKE};
    use insta::assert_snapshot;

    use super::*;

    fn groups(list: &[&[u32]]) -> Vec<EventGroup> {
        list.iter().map(|g| g.iter().copied().collect()).collect()
    }

    #[test]
    fn merges_when_union_fits() {
        let packed = pack_groups(&[vec![1], vec![2, 3]], &HashSet::new(), 3);
        assert_eq!(packed, groups(&[&[1, 2, 3]]));
    }

    #[test]
    fn keeps_groups_that_do_not_fit() {
        let seeds = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let packed = pack_groups(&seeds, &HashSet::new(), 4);
        assert_eq!(packed, groups(&[&[1, 2, 3], &[4, 5, 6]]));
    }

    #[test]
    fn drops_excluded_and_empty_seeds() {
        let seeds = vec![vec![20, 21], vec![30, 31, 20], vec![40]];
        let excluded = HashSet::from([20, 21]);
        let packed = pack_groups(&seeds, &excluded, 2);
        assert_eq!(packed, groups(&[&[30, 31], &[40]]));
    }

    #[test]
    fn prefers_overlapping_partner() {
        // {5} pairs with {5, 6} since their union is smallest
        let seeds = vec![vec![1, 2], vec![5, 6], vec![5]];
        let packed = pack_groups(&seeds, &HashSet::new(), 2);
        assert_eq!(packed, groups(&[&[5, 6], &[1, 2]]));
    }

    #[test]
    fn restores_positions_when_stopping() {
        let seeds = vec![vec![1, 2, 3], vec![4], vec![5, 6, 7]];
        let packed = pack_groups(&seeds, &HashSet::new(), 3);
        assert_eq!(packed, groups(&[&[1, 2, 3], &[4], &[5, 6, 7]]));
    }

    #[test]
    fn profiles_respect_counter_capacity() {
        for id in [INTEL_ICELAKE, INTEL_CASCADELAKE, ARM_GENERIC] {
            let profile = ArchitectureProfile::load(id).unwrap();
            for group in optimize_groups(&profile) {
                assert!(group.len() <= profile.available_counters());
            }
        }
    }

    #[test]
    fn cascadelake_groups_stay_apart() {
        let profile = ArchitectureProfile::load(INTEL_CASCADELAKE).unwrap();
        assert_eq!(
            optimize_groups(&profile),
            groups(&[&[30, 31, 32], &[33, 34]])
        );
    }

    #[test]
    fn renders_cascadelake_selection() {
        let profile = ArchitectureProfile::load(INTEL_CASCADELAKE).unwrap();
        let selection = selection_string(&profile, &optimize_groups(&profile)).unwrap();
        assert_snapshot!(selection, @"cpu-clock,duration_time,msr/tsc/,cycles:D,instructions:D,ref-cycles:D,'{r08d1,r10d1,r20d1}','{r00c4,r00c5}'");
    }

    #[test]
    fn selection_with_missing_event_fails() {
        let profile = ArchitectureProfile::load(INTEL_CASCADELAKE).unwrap();
        assert!(matches!(
            selection_string(&profile, &groups(&[&[30, 77]])),
            Err(Error::MissingEvent(77))
        ));
    }

    #[test]
    fn parses_pmu_tokens_with_commas() {
        let parsed = parse_selection_string(
            "cha/event=0x34,umask=0x1fe001/,cycles:D,'{imc/event=0x04,umask=0x0f/,r08d1}'",
        )
        .unwrap();

        assert_eq!(parsed.standalone, vec!["cha/event=0x34,umask=0x1fe001/"]);
        assert_eq!(parsed.pinned, vec!["cycles"]);
        assert_eq!(
            parsed.groups,
            vec![vec!["imc/event=0x04,umask=0x0f/", "r08d1"]]
        );
    }

    #[test]
    fn rejects_malformed_selection() {
        assert!(parse_selection_string("cycles,,instructions").is_err());
        assert!(parse_selection_string("'{r08d1,r10d1'").is_err());
        assert!(parse_selection_string("cha/event=0x34").is_err());
        assert!(parse_selection_string("'{}'").is_err());
        assert_eq!(
            parse_selection_string("").unwrap(),
            ParsedSelection::default()
        );
    }
}
