//! Minimal delta computation.
//!
//! Given the document previously stored for an object and the freshly
//! serialized version of it, produce the smallest flat document that still
//! lets a client apply the change: meta fields plus only the user fields
//! that actually changed. List-typed fields are compared as sets — two lists
//! with the same elements in a different order are considered unchanged,
//! even though every other field type uses strict equality. This is a
//! deliberate rule, not an oversight: it trades false negatives (an actual
//! reorder a client might care about) for a much smaller broadcast volume on
//! the common case of re-fetched, re-ordered relational lists.

use crate::document::FlatDocument;
use serde_json::Value;

/// Compute the minimal delta of `new` against `prior`. Returns `None` when
/// nothing user-visible changed (meta fields like `_tstamp` always differ,
/// but that alone never forces a delta).
pub fn minimal_delta(prior: &FlatDocument, new: &FlatDocument) -> Option<FlatDocument> {
    let mut changed_any = false;
    let mut out = new.clone();

    let keys: Vec<String> = new
        .user_fields()
        .map(|(k, _)| k.clone())
        .collect();

    for key in &keys {
        let new_value = new.get(key);
        let prior_value = prior.get(key);
        if values_equal(prior_value, new_value) {
            out.remove(key);
        } else {
            changed_any = true;
        }
    }

    // A field present before and absent now (removed from the payload)
    // still counts as a change, and must be explicitly carried as null so
    // the client can drop it.
    for (key, _) in prior.user_fields() {
        if new.get(key).is_none() && out.get(key).is_none() {
            out.set(key.clone(), Value::Null);
            changed_any = true;
        }
    }

    if changed_any {
        Some(out)
    } else {
        None
    }
}

fn values_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(Value::Array(a)), Some(Value::Array(b))) => arrays_equal_as_sets(a, b),
        (a, b) => a == b,
    }
}

/// Order-insensitive comparison: every element of `a` has a matching,
/// not-yet-consumed element in `b`, and the lengths match. `Value` doesn't
/// implement `Hash` (it can contain floats), so this is O(n^2) rather than
/// a hash-set comparison; list fields in this system are small enough that
/// this is not a concern.
fn arrays_equal_as_sets(a: &[Value], b: &[Value]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    for item in a {
        let Some(slot) = b
            .iter()
            .enumerate()
            .position(|(i, candidate)| !used[i] && candidate == item)
        else {
            return false;
        };
        used[slot] = true;
    }
    true
}

impl FlatDocument {
    fn remove(&mut self, key: &str) {
        self.as_map_mut().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Operation;
    use crate::Tstamp;
    use serde_json::json;

    fn doc(fields: &[(&str, Value)]) -> FlatDocument {
        let mut d = FlatDocument::new("Room", "r1", "r1", Tstamp::new(1, 0), Operation::Update);
        for (k, v) in fields {
            d.set((*k).to_string(), v.clone());
        }
        d
    }

    #[test]
    fn unchanged_scalar_produces_no_delta() {
        let prior = doc(&[("name", json!("lobby"))]);
        let new = doc(&[("name", json!("lobby"))]);
        assert!(minimal_delta(&prior, &new).is_none());
    }

    #[test]
    fn changed_scalar_is_kept_unchanged_fields_dropped() {
        let prior = doc(&[("name", json!("lobby")), ("capacity", json!(10))]);
        let new = doc(&[("name", json!("foyer")), ("capacity", json!(10))]);
        let delta = minimal_delta(&prior, &new).unwrap();
        assert_eq!(delta.get("name"), Some(&json!("foyer")));
        assert_eq!(delta.get("capacity"), None);
    }

    #[test]
    fn reordered_list_is_not_a_change() {
        let prior = doc(&[("tags", json!(["a", "b", "c"]))]);
        let new = doc(&[("tags", json!(["c", "a", "b"]))]);
        assert!(minimal_delta(&prior, &new).is_none());
    }

    #[test]
    fn list_with_different_elements_is_a_change() {
        let prior = doc(&[("tags", json!(["a", "b"]))]);
        let new = doc(&[("tags", json!(["a", "c"]))]);
        let delta = minimal_delta(&prior, &new).unwrap();
        assert_eq!(delta.get("tags"), Some(&json!(["a", "c"])));
    }

    #[test]
    fn list_with_duplicate_elements_is_order_insensitive_but_count_sensitive() {
        let prior = doc(&[("tags", json!(["a", "a", "b"]))]);
        let new_same = doc(&[("tags", json!(["b", "a", "a"]))]);
        assert!(minimal_delta(&prior, &new_same).is_none());

        let new_diff = doc(&[("tags", json!(["a", "b", "b"]))]);
        assert!(minimal_delta(&prior, &new_diff).is_some());
    }

    #[test]
    fn removed_field_becomes_explicit_null() {
        let prior = doc(&[("name", json!("lobby")), ("note", json!("hi"))]);
        let new = doc(&[("name", json!("lobby"))]);
        let delta = minimal_delta(&prior, &new).unwrap();
        assert_eq!(delta.get("note"), Some(&Value::Null));
        assert_eq!(delta.get("name"), None);
    }

    #[test]
    fn meta_only_difference_is_not_a_change() {
        let prior = FlatDocument::new("Room", "r1", "r1", Tstamp::new(1, 0), Operation::Update);
        let new = FlatDocument::new("Room", "r1", "r1", Tstamp::new(2, 0), Operation::Update);
        assert!(minimal_delta(&prior, &new).is_none());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_tag_list() -> impl Strategy<Value = Vec<String>> {
            prop::collection::vec("[a-c]", 0..6)
        }

        proptest! {
            /// Any permutation of the same multiset of tags must not
            /// produce a delta — the list-as-set rule holds regardless of
            /// which permutation a re-fetch happens to return.
            #[test]
            fn permutation_of_same_tags_never_deltas(mut tags in arb_tag_list(), seed in 0u64..1000) {
                let prior = doc(&[("tags", Value::from(tags.clone()))]);
                // Deterministic "shuffle" keyed by `seed`, so proptest can
                // shrink on it like any other input.
                let len = tags.len();
                if len > 1 {
                    let rotate_by = (seed as usize) % len;
                    tags.rotate_left(rotate_by);
                }
                let new = doc(&[("tags", Value::from(tags))]);
                prop_assert!(minimal_delta(&prior, &new).is_none());
            }

            /// `minimal_delta` of a document against itself is always
            /// `None` — reflexivity, independent of field contents.
            #[test]
            fn identical_document_never_deltas(name in "[a-zA-Z0-9 ]{0,16}", capacity in 0i64..10_000) {
                let d = doc(&[("name", Value::from(name)), ("capacity", Value::from(capacity))]);
                prop_assert!(minimal_delta(&d, &d).is_none());
            }

            /// `arrays_equal_as_sets` is symmetric: swapping the two lists
            /// must not change the verdict.
            #[test]
            fn set_comparison_is_symmetric(a in arb_tag_list(), b in arb_tag_list()) {
                prop_assert_eq!(arrays_equal_as_sets(&to_values(&a), &to_values(&b)), arrays_equal_as_sets(&to_values(&b), &to_values(&a)));
            }
        }

        fn to_values(items: &[String]) -> Vec<Value> {
            items.iter().map(|s| Value::String(s.clone())).collect()
        }
    }
}
