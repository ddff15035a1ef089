//! Candidate matching between import specs and places

use std::collections::BTreeMap;

use protocol::types::{ImportSpec, Place};

/// Find an assignment of every import part name to a distinct part of the
/// place, or `None` if the place is not a candidate.
///
/// Returns the chosen part index per import part name.
pub fn find_assignment(spec: &ImportSpec, place: &Place) -> Option<BTreeMap<String, usize>> {
    let names: Vec<&String> = spec.parts.keys().collect();
    let part_tags: Vec<_> = place.parts.iter().map(|p| p.tags()).collect();

    let mut graph = Vec::with_capacity(names.len());
    for name in &names {
        let required = spec.parts[*name].required_tags();
        let matches: Vec<usize> = part_tags
            .iter()
            .enumerate()
            .filter(|(_, tags)| required.is_subset(tags))
            .map(|(idx, _)| idx)
            .collect();
        if matches.is_empty() {
            return None;
        }
        graph.push(matches);
    }

    let matching = common::matching::find_perfect_matching(&graph, place.parts.len())?;
    Some(
        names
            .into_iter()
            .cloned()
            .zip(matching)
            .collect(),
    )
}
