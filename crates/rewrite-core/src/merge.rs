//! Folding per-trial traces into phase accumulators.
//!
//! Roots and call-graph edges are presence facts and merge by set union on
//! counter-free call-site keys. Signatures are per-occurrence observations and
//! merge by concatenation on the occurrence-qualified key.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::ids::strip_occurrence;

pub fn merge_roots(acc: &mut BTreeSet<String>, trial_roots: &[String]) {
    for id in trial_roots {
        acc.insert(strip_occurrence(id).to_string());
    }
}

pub fn merge_call_graph(
    acc: &mut BTreeMap<String, BTreeSet<String>>,
    trial_graph: &BTreeMap<String, Vec<String>>,
) {
    for (caller, callees) in trial_graph {
        let entry = acc.entry(strip_occurrence(caller).to_string()).or_default();
        for callee in callees {
            entry.insert(strip_occurrence(callee).to_string());
        }
    }
}

pub fn merge_signatures(
    acc: &mut BTreeMap<String, Vec<Value>>,
    trial_signatures: BTreeMap<String, Vec<Value>>,
) {
    for (invocation, records) in trial_signatures {
        acc.entry(invocation).or_default().extend(records);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn graph(pairs: Vec<(&str, Vec<&str>)>) -> BTreeMap<String, Vec<String>> {
        pairs
            .into_iter()
            .map(|(caller, callees)| (caller.to_string(), ids(&callees)))
            .collect()
    }

    #[test]
    fn roots_are_normalized_into_call_sites() {
        let mut acc = BTreeSet::new();
        merge_roots(
            &mut acc,
            &ids(&["a.js:10_count1", "a.js:10_count2", "b.js:4_count1"]),
        );
        let expected: BTreeSet<String> = ["a.js:10", "b.js:4"].iter().map(|s| s.to_string()).collect();
        assert_eq!(acc, expected);
    }

    #[test]
    fn merging_the_same_roots_twice_is_idempotent() {
        let trial = ids(&["a.js:10_count1", "c.js:7_count3"]);
        let mut once = BTreeSet::new();
        merge_roots(&mut once, &trial);
        let mut twice = once.clone();
        merge_roots(&mut twice, &trial);
        assert_eq!(once, twice);
    }

    #[test]
    fn root_and_graph_merges_commute() {
        let t1_roots = ids(&["a.js:10_count1", "b.js:4_count2"]);
        let t2_roots = ids(&["b.js:4_count1", "d.js:1_count1"]);
        let t1_graph = graph(vec![
            ("a.js:10_count1", vec!["b.js:4_count1"]),
            ("d.js:1_count1", vec![]),
        ]);
        let t2_graph = graph(vec![("a.js:10_count4", vec!["c.js:2_count1", "b.js:4_count3"])]);

        let mut roots_12 = BTreeSet::new();
        merge_roots(&mut roots_12, &t1_roots);
        merge_roots(&mut roots_12, &t2_roots);
        let mut roots_21 = BTreeSet::new();
        merge_roots(&mut roots_21, &t2_roots);
        merge_roots(&mut roots_21, &t1_roots);
        assert_eq!(roots_12, roots_21);

        let mut graph_12 = BTreeMap::new();
        merge_call_graph(&mut graph_12, &t1_graph);
        merge_call_graph(&mut graph_12, &t2_graph);
        let mut graph_21 = BTreeMap::new();
        merge_call_graph(&mut graph_21, &t2_graph);
        merge_call_graph(&mut graph_21, &t1_graph);
        assert_eq!(graph_12, graph_21);
        assert_eq!(graph_12["a.js:10"].len(), 2);
    }

    #[test]
    fn call_graph_strips_callers_and_callees() {
        let mut acc = BTreeMap::new();
        merge_call_graph(&mut acc, &graph(vec![("a.js:10_count1", vec!["b.js:4_count1"])]));
        assert_eq!(acc.len(), 1);
        assert_eq!(
            acc["a.js:10"].iter().collect::<Vec<_>>(),
            vec![&"b.js:4".to_string()]
        );
    }

    #[test]
    fn empty_callee_list_only_creates_entry() {
        let mut acc = BTreeMap::new();
        merge_call_graph(&mut acc, &graph(vec![("leaf.js:3_count2", vec![])]));
        assert!(acc["leaf.js:3"].is_empty());
    }

    #[test]
    fn signatures_concatenate_in_trial_order() {
        let mut acc = BTreeMap::new();
        let mut t1 = BTreeMap::new();
        t1.insert("f.js:2_count1".to_string(), vec![json!(["read", "a"]), json!(["write", "b"])]);
        let mut t2 = BTreeMap::new();
        t2.insert("f.js:2_count1".to_string(), vec![json!(["read", "a"])]);
        t2.insert("f.js:2_count2".to_string(), vec![json!(["read", "z"])]);

        merge_signatures(&mut acc, t1);
        merge_signatures(&mut acc, t2);

        assert_eq!(
            acc["f.js:2_count1"],
            vec![json!(["read", "a"]), json!(["write", "b"]), json!(["read", "a"])]
        );
        assert_eq!(acc["f.js:2_count2"], vec![json!(["read", "z"])]);
    }
}
