//! Property-based tests: semver ordering, round-trip and compatibility sign.

use std::cmp::Ordering;

use dcomm_core::*;
use proptest::prelude::*;

fn arb_ids() -> impl Strategy<Value = Option<String>> {
    proptest::option::of(
        proptest::collection::vec(
            prop_oneof![
                Just("0"),
                Just("1"),
                Just("2"),
                Just("10"),
                Just("alpha"),
                Just("beta"),
                Just("rc"),
                Just("x-y"),
                Just("0a"),
            ],
            1..4,
        )
        .prop_map(|segs| segs.join(".")),
    )
}

fn arb_semver_text() -> impl Strategy<Value = String> {
    (0u64..4, proptest::option::of(0u64..4), proptest::option::of(0u64..12), arb_ids(), arb_ids())
        .prop_map(|(major, minor, patch, pre, build)| {
            let mut s = major.to_string();
            if let Some(minor) = minor {
                s.push_str(&format!(".{minor}"));
                if let Some(patch) = patch {
                    s.push_str(&format!(".{patch}"));
                    if let Some(pre) = pre {
                        s.push_str(&format!("-{pre}"));
                    }
                    if let Some(build) = build {
                        s.push_str(&format!("+{build}"));
                    }
                }
            }
            s
        })
}

fn arb_semver() -> impl Strategy<Value = Semver> {
    arb_semver_text().prop_map(|s| Semver::parse(&s).unwrap())
}

proptest! {
    #[test]
    fn parse_display_round_trip(text in arb_semver_text()) {
        let parsed = Semver::parse(&text).unwrap();
        prop_assert_eq!(parsed.to_string(), text.clone());
        prop_assert_eq!(Semver::parse(&parsed.to_string()).unwrap(), parsed);
    }

    #[test]
    fn ordering_is_antisymmetric_and_consistent_with_eq(a in arb_semver(), b in arb_semver()) {
        prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        prop_assert_eq!(a.cmp(&b) == Ordering::Equal, a == b);
    }

    #[test]
    fn ordering_is_transitive(a in arb_semver(), b in arb_semver(), c in arb_semver()) {
        let mut sorted = [a, b, c];
        sorted.sort();
        prop_assert!(sorted[0] <= sorted[1]);
        prop_assert!(sorted[1] <= sorted[2]);
        prop_assert!(sorted[0] <= sorted[2]);
    }

    #[test]
    fn compatibility_sign_is_symmetric(a in arb_semver(), b in arb_semver()) {
        prop_assume!(a != b);
        prop_assert_eq!(a.compatible_with(&b), -b.compatible_with(&a));
    }

    #[test]
    fn compatibility_magnitude_in_range(a in arb_semver(), b in arb_semver()) {
        let score = a.compatible_with(&b);
        prop_assert!((-5..=5).contains(&score));
        if a.major() != b.major() {
            prop_assert_eq!(score, 0);
        }
    }

    #[test]
    fn identifiers_ignore_case_and_punctuation(word in "[a-z0-9]{1,12}", punct in "[-_ !.]{0,3}") {
        let mut noisy = String::new();
        for (i, c) in word.chars().enumerate() {
            if i % 2 == 0 {
                noisy.extend(c.to_uppercase());
            } else {
                noisy.push(c);
            }
            noisy.push_str(&punct);
        }
        prop_assert_eq!(compare_identifiers(Some(&word), Some(&noisy)), Ordering::Equal);
        prop_assert_eq!(compare_identifiers(None, Some(&word)), Ordering::Less);
    }
}

#[test]
fn documented_prerelease_chain() {
    let chain = ["1.2.3-1.a", "1.2.3-2.a", "1.2.3-a.1"];
    let parsed: Vec<Semver> = chain.iter().map(|s| Semver::parse(s).unwrap()).collect();
    assert!(parsed[0] < parsed[1]);
    assert!(parsed[1] < parsed[2]);
}
