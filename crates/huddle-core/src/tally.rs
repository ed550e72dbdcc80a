//! Vote tallies and story navigation helpers.

use crate::identity::PeerIdentity;
use crate::state::{Story, VoteValue};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Numeric votes, ascending. Special cards are skipped.
pub fn numeric_votes(votes: &BTreeMap<PeerIdentity, VoteValue>) -> Vec<u32> {
    let mut points: Vec<u32> = votes.values().filter_map(VoteValue::points).collect();
    points.sort_unstable();
    points
}

/// Suggested estimate: the element at index `n / 2` of the sorted numeric votes.
///
/// For an even count this picks the upper of the two middle values.
pub fn median_estimate(votes: &BTreeMap<PeerIdentity, VoteValue>) -> Option<u32> {
    let points = numeric_votes(votes);
    points.get(points.len() / 2).copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spread {
    pub min: u32,
    pub max: u32,
}

/// Lowest and highest numeric vote, when they disagree.
pub fn spread(votes: &BTreeMap<PeerIdentity, VoteValue>) -> Option<Spread> {
    let points = numeric_votes(votes);
    match (points.first(), points.last()) {
        (Some(&min), Some(&max)) if min != max => Some(Spread { min, max }),
        _ => None,
    }
}

/// How many participants picked each value: numbers ascending, then "☕", then "❓".
pub fn counts(votes: &BTreeMap<PeerIdentity, VoteValue>) -> Vec<(VoteValue, usize)> {
    let mut counts: Vec<(VoteValue, usize)> = Vec::new();
    for value in votes.values() {
        match counts.iter_mut().find(|(v, _)| v == value) {
            Some((_, n)) => *n += 1,
            None => counts.push((*value, 1)),
        }
    }
    counts.sort_by(|(a, _), (b, _)| display_order(a, b));
    counts
}

fn display_order(a: &VoteValue, b: &VoteValue) -> Ordering {
    fn rank(v: &VoteValue) -> (u8, u32) {
        match v {
            VoteValue::Points(n) => (0, *n),
            VoteValue::Coffee => (1, 0),
            VoteValue::Unsure => (2, 0),
        }
    }
    rank(a).cmp(&rank(b))
}

/// The first story after `current_id` that has no estimate yet.
///
/// With no current story, searches from the start.
pub fn next_unestimated_story<'a>(stories: &'a [Story], current_id: Option<&str>) -> Option<&'a Story> {
    let start = current_id
        .and_then(|id| stories.iter().position(|s| s.id == id))
        .map_or(0, |i| i + 1);
    stories[start..].iter().find(|s| s.estimate.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn votes(entries: &[(&str, VoteValue)]) -> BTreeMap<PeerIdentity, VoteValue> {
        entries
            .iter()
            .map(|(id, v)| (PeerIdentity::new(*id).unwrap(), *v))
            .collect()
    }

    fn story(id: &str, estimate: Option<u32>) -> Story {
        Story {
            id: id.into(),
            title: id.into(),
            description: None,
            estimate: estimate.map(VoteValue::Points),
        }
    }

    // ==================== Median ====================

    #[test]
    fn test_median_even_count_takes_upper_middle() {
        let v = votes(&[
            ("a", VoteValue::Points(1)),
            ("b", VoteValue::Points(2)),
            ("c", VoteValue::Points(3)),
            ("d", VoteValue::Points(5)),
        ]);
        assert_eq!(median_estimate(&v), Some(3));
    }

    #[test]
    fn test_median_ignores_special_cards() {
        let v = votes(&[
            ("a", VoteValue::Points(8)),
            ("b", VoteValue::Coffee),
            ("c", VoteValue::Points(2)),
            ("d", VoteValue::Unsure),
            ("e", VoteValue::Points(5)),
        ]);
        assert_eq!(median_estimate(&v), Some(5));
    }

    #[test]
    fn test_median_without_numeric_votes() {
        assert_eq!(median_estimate(&votes(&[])), None);
        assert_eq!(median_estimate(&votes(&[("a", VoteValue::Coffee)])), None);
    }

    // ==================== Spread / Counts ====================

    #[test]
    fn test_spread_only_when_votes_disagree() {
        let agree = votes(&[("a", VoteValue::Points(3)), ("b", VoteValue::Points(3))]);
        assert_eq!(spread(&agree), None);

        let disagree = votes(&[
            ("a", VoteValue::Points(13)),
            ("b", VoteValue::Points(2)),
            ("c", VoteValue::Unsure),
        ]);
        assert_eq!(spread(&disagree), Some(Spread { min: 2, max: 13 }));
    }

    #[test]
    fn test_counts_ordering() {
        let v = votes(&[
            ("a", VoteValue::Unsure),
            ("b", VoteValue::Points(5)),
            ("c", VoteValue::Coffee),
            ("d", VoteValue::Points(2)),
            ("e", VoteValue::Points(5)),
        ]);
        assert_eq!(
            counts(&v),
            vec![
                (VoteValue::Points(2), 1),
                (VoteValue::Points(5), 2),
                (VoteValue::Coffee, 1),
                (VoteValue::Unsure, 1),
            ]
        );
    }

    // ==================== Next Story ====================

    #[test]
    fn test_next_story_skips_estimated() {
        let stories = vec![story("s1", None), story("s2", Some(3)), story("s3", None)];
        let next = next_unestimated_story(&stories, Some("s1")).unwrap();
        assert_eq!(next.id, "s3");
    }

    #[test]
    fn test_next_story_does_not_wrap() {
        let stories = vec![story("s1", None), story("s2", None)];
        assert!(next_unestimated_story(&stories, Some("s2")).is_none());
    }

    #[test]
    fn test_next_story_without_current_starts_at_beginning() {
        let stories = vec![story("s1", Some(1)), story("s2", None)];
        assert_eq!(next_unestimated_story(&stories, None).unwrap().id, "s2");
        assert_eq!(next_unestimated_story(&stories, Some("missing")).unwrap().id, "s2");
    }
}
