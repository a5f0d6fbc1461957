use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

pub type Labels = BTreeMap<String, String>;

/// Full equality of two selectors. A Service and "its" Deployment carry identical selectors by
/// convention, which is what this checks. `None` is treated as an empty map.
pub fn selectors_equal(a: Option<&Labels>, b: Option<&Labels>) -> bool {
    let a_len = a.map(|m| m.len()).unwrap_or(0);
    let b_len = b.map(|m| m.len()).unwrap_or(0);
    if a_len != b_len {
        return false;
    }
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Subset containment: every key of `selector` is present in `labels` with the same value.
/// An empty selector matches everything, see [`selects`] for the guarded variant.
pub fn labels_satisfy_selector(labels: Option<&Labels>, selector: Option<&Labels>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    selector.iter().all(|(key, value)| {
        labels
            .and_then(|labels| labels.get(key))
            .map(|v| v == value)
            .unwrap_or(false)
    })
}

/// Selection as Services and Deployments do it: an absent or empty selector selects nothing.
pub fn selects(selector: Option<&Labels>, labels: Option<&Labels>) -> bool {
    match selector {
        Some(selector) if !selector.is_empty() => labels_satisfy_selector(labels, Some(selector)),
        _ => false,
    }
}

pub fn selects_pod(selector: Option<&Labels>, pod: &Pod) -> bool {
    selects(selector, pod.metadata.labels.as_ref())
}

#[cfg(test)]
mod tests {
    use quickcheck::{quickcheck, TestResult};

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn equal_selectors() {
        let a = labels(&[("app", "web"), ("tier", "front")]);
        let b = labels(&[("tier", "front"), ("app", "web")]);
        assert!(selectors_equal(Some(&a), Some(&b)));
    }

    #[test]
    fn selectors_differing_in_value_or_key() {
        let a = labels(&[("app", "web")]);
        assert!(!selectors_equal(Some(&a), Some(&labels(&[("app", "api")]))));
        assert!(!selectors_equal(Some(&a), Some(&labels(&[("name", "web")]))));
        assert!(!selectors_equal(
            Some(&a),
            Some(&labels(&[("app", "web"), ("tier", "front")]))
        ));
    }

    #[test]
    fn missing_selectors_compare_as_empty() {
        assert!(selectors_equal(None, None));
        assert!(selectors_equal(None, Some(&Labels::new())));
        assert!(!selectors_equal(None, Some(&labels(&[("app", "web")]))));
    }

    #[test]
    fn subset_match() {
        let pod = labels(&[("app", "web"), ("pod-template-hash", "abc")]);
        assert!(labels_satisfy_selector(
            Some(&pod),
            Some(&labels(&[("app", "web")]))
        ));
        assert!(!labels_satisfy_selector(
            Some(&pod),
            Some(&labels(&[("app", "api")]))
        ));
        assert!(!labels_satisfy_selector(
            None,
            Some(&labels(&[("app", "web")]))
        ));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let pod = labels(&[("app", "web")]);
        assert!(labels_satisfy_selector(Some(&pod), Some(&Labels::new())));
        assert!(labels_satisfy_selector(None, None));
    }

    #[test]
    fn guarded_selection_rejects_empty_selectors() {
        let pod = labels(&[("app", "web")]);
        assert!(!selects(None, Some(&pod)));
        assert!(!selects(Some(&Labels::new()), Some(&pod)));
        assert!(selects(Some(&labels(&[("app", "web")])), Some(&pod)));
    }

    quickcheck! {
        fn subset_matches_definition(pod: Labels, selector: Labels) -> bool {
            let expected = selector.iter().all(|(k, v)| pod.get(k) == Some(v));
            labels_satisfy_selector(Some(&pod), Some(&selector)) == expected
        }

        fn empty_selector_always_matches(pod: Labels) -> bool {
            labels_satisfy_selector(Some(&pod), Some(&Labels::new()))
        }

        fn selector_matches_its_own_labels(selector: Labels, extra: Labels) -> bool {
            let mut pod = extra;
            pod.extend(selector.clone());
            labels_satisfy_selector(Some(&pod), Some(&selector))
        }

        fn equality_is_reflexive(selector: Labels) -> bool {
            selectors_equal(Some(&selector), Some(&selector.clone()))
        }

        fn equality_breaks_on_one_value(selector: Labels) -> TestResult {
            let Some(key) = selector.keys().next().cloned() else {
                return TestResult::discard();
            };
            let mut other = selector.clone();
            other.entry(key).and_modify(|v| v.push('x'));
            TestResult::from_bool(!selectors_equal(Some(&selector), Some(&other)))
        }

        fn equality_breaks_on_one_key(selector: Labels, key: String, value: String) -> TestResult {
            if selector.contains_key(&key) {
                return TestResult::discard();
            }
            let mut other = selector.clone();
            other.insert(key, value);
            TestResult::from_bool(!selectors_equal(Some(&selector), Some(&other)))
        }
    }
}
