// SPDX-License-Identifier: MIT OR Apache-2.0
//! Library-version compatibility rules.
//!
//! A plugin records the library version it was built against; the
//! sender and worker hosts refuse to interoperate across incompatible
//! versions. Compatibility follows semver intent: equal major, and —
//! because everything changes before 1.0 — equal minor while major is
//! zero. Build metadata never participates in the decision.

use semver::Version;
use std::cmp::Ordering;

/// Returns `true` if `candidate` is compatible with `local`.
///
/// Two versions are compatible iff their major components match, and,
/// when the major component is `0`, their minor components match as
/// well. Pre-release and build metadata are ignored.
pub fn is_compatible(candidate: &Version, local: &Version) -> bool {
    if candidate.major != local.major {
        return false;
    }
    candidate.major != 0 || candidate.minor == local.minor
}

/// Ordering used to pick the `latest` info row per plugin id.
///
/// Semver precedence decides; among precedence-equal versions the build
/// metadata breaks the tie, descending (a later build wins).
pub fn latest_ordering(a: &Version, b: &Version) -> Ordering {
    a.cmp_precedence(b)
        .then_with(|| a.build.as_str().cmp(b.build.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    // -- Compatibility ---------------------------------------------------

    #[test]
    fn same_major_is_compatible() {
        assert!(is_compatible(&v("1.2.0"), &v("1.9.3")));
        assert!(is_compatible(&v("2.0.0"), &v("2.0.1")));
    }

    #[test]
    fn different_major_is_incompatible() {
        assert!(!is_compatible(&v("1.2.0"), &v("2.0.0")));
        assert!(!is_compatible(&v("3.0.0"), &v("2.9.9")));
    }

    #[test]
    fn zero_major_requires_same_minor() {
        assert!(is_compatible(&v("0.4.1"), &v("0.4.9")));
        assert!(!is_compatible(&v("0.4.1"), &v("0.5.0")));
    }

    #[test]
    fn build_metadata_is_ignored() {
        assert!(is_compatible(&v("1.2.0+build.7"), &v("1.4.0")));
        assert!(is_compatible(&v("0.3.0+a"), &v("0.3.5+b")));
    }

    // -- Latest ordering -------------------------------------------------

    #[test]
    fn precedence_decides_latest() {
        assert_eq!(latest_ordering(&v("1.2.0"), &v("1.10.0")), Ordering::Less);
        assert_eq!(latest_ordering(&v("2.0.0"), &v("1.9.9")), Ordering::Greater);
    }

    #[test]
    fn build_metadata_breaks_precedence_ties() {
        assert_eq!(
            latest_ordering(&v("1.2.0+build.2"), &v("1.2.0+build.10")),
            Ordering::Greater,
            "lexical comparison on build strings"
        );
        assert_eq!(
            latest_ordering(&v("1.2.0+a"), &v("1.2.0+b")),
            Ordering::Less
        );
    }

    #[test]
    fn equal_versions_are_equal() {
        assert_eq!(latest_ordering(&v("1.2.3"), &v("1.2.3")), Ordering::Equal);
    }
}
