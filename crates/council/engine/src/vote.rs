//! Quorum vote resolution
//!
//! `resolve_vote` is a pure function of the eligible set, the ballots cast,
//! the majority rule and whether the vote is closed. Only the first ballot
//! of each eligible role counts; ballots from anyone else are ignored.

use council_types::*;
use std::collections::{BTreeMap, BTreeSet};

pub fn resolve_vote(
    eligible: &BTreeSet<RoleId>,
    ballots: &[Vote],
    rule: MajorityRule,
    closed: bool,
) -> (VoteTally, VoteOutcome) {
    let mut counted: BTreeMap<&RoleId, Ballot> = BTreeMap::new();
    for vote in ballots {
        if eligible.contains(&vote.role) {
            counted.entry(&vote.role).or_insert(vote.ballot);
        }
    }

    let mut tally = VoteTally {
        eligible: eligible.len() as u32,
        missing: (eligible.len() - counted.len()) as u32,
        ..VoteTally::default()
    };
    for ballot in counted.values() {
        match ballot {
            Ballot::Support => tally.support += 1,
            Ballot::Oppose => tally.oppose += 1,
            Ballot::Abstain => tally.abstain += 1,
        }
    }

    if tally.missing > 0 && !closed {
        return (tally, VoteOutcome::Pending);
    }

    // Missing ballots count against the motion once the vote closes
    tally.oppose += tally.missing;

    let denominator = tally.eligible - tally.abstain;
    if denominator == 0 {
        return (tally, VoteOutcome::Failed);
    }

    let fails = match rule {
        MajorityRule::Strict => tally.oppose * 2 > denominator,
        MajorityRule::AtLeastHalf => tally.oppose * 2 >= denominator,
    };
    let outcome = if fails {
        VoteOutcome::Failed
    } else {
        VoteOutcome::Passed
    };
    (tally, outcome)
}
