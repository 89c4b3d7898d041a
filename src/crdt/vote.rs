//! A vote across the replicas of an entity.

use crate::proto::VoteDelta;

/// Replicated vote. Each replica contributes one boolean; the proxy
/// aggregates the tallies and relays them back in inbound deltas. The
/// outbound delta carries only this replica's vote.
#[derive(Debug, Clone)]
pub struct Vote {
    self_vote: bool,
    votes_for: u32,
    total_voters: u32,
    changed: bool,
}

impl Default for Vote {
    fn default() -> Self {
        Self {
            self_vote: false,
            votes_for: 0,
            total_voters: 1,
            changed: false,
        }
    }
}

impl Vote {
    pub fn new() -> Self {
        Self::default()
    }

    /// This replica's current vote.
    pub fn self_vote(&self) -> bool {
        self.self_vote
    }

    /// Number of replicas voting yes, as last observed.
    pub fn votes_for(&self) -> u32 {
        self.votes_for
    }

    /// Number of replicas participating, as last observed.
    pub fn total_voters(&self) -> u32 {
        self.total_voters
    }

    /// Whether at least one replica votes yes.
    pub fn at_least_one(&self) -> bool {
        self.votes_for > 0
    }

    /// Whether more than half of the replicas vote yes.
    pub fn majority(&self) -> bool {
        self.votes_for * 2 > self.total_voters
    }

    /// Whether every replica votes yes.
    pub fn all(&self) -> bool {
        self.votes_for == self.total_voters
    }

    /// Cast this replica's vote. The local tally adjusts immediately; the
    /// authoritative tallies arrive with the next inbound delta.
    pub fn vote(&mut self, vote: bool) {
        if vote == self.self_vote {
            return;
        }
        if vote {
            self.votes_for += 1;
        } else {
            self.votes_for = self.votes_for.saturating_sub(1);
        }
        self.self_vote = vote;
        self.changed = true;
    }

    pub fn get_and_reset_delta(&mut self, initial: bool) -> Option<VoteDelta> {
        if !self.changed && !initial {
            return None;
        }
        self.changed = false;
        Some(VoteDelta {
            self_vote: self.self_vote,
            votes_for: 0,
            total_voters: 0,
        })
    }

    pub fn apply_delta(&mut self, delta: &VoteDelta) {
        self.self_vote = delta.self_vote;
        self.votes_for = delta.votes_for;
        self.total_voters = delta.total_voters.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_vote_counts_itself() {
        let vote = Vote::new();
        assert!(!vote.self_vote());
        assert_eq!(vote.total_voters(), 1);
        assert!(!vote.at_least_one());
        assert!(!vote.majority());
    }

    #[test]
    fn test_vote_adjusts_local_tally() {
        let mut vote = Vote::new();
        vote.vote(true);
        assert!(vote.self_vote());
        assert_eq!(vote.votes_for(), 1);
        assert!(vote.at_least_one());
        assert!(vote.majority());
        assert!(vote.all());
    }

    #[test]
    fn test_delta_carries_only_self_vote() {
        let mut vote = Vote::new();
        vote.vote(true);
        let delta = vote.get_and_reset_delta(false).unwrap();
        assert!(delta.self_vote);
        assert_eq!(delta.votes_for, 0);
        assert_eq!(delta.total_voters, 0);
    }

    #[test]
    fn test_no_delta_for_same_vote() {
        let mut vote = Vote::new();
        vote.vote(false);
        assert!(vote.get_and_reset_delta(false).is_none());

        vote.vote(true);
        assert!(vote.get_and_reset_delta(false).is_some());
        assert!(vote.get_and_reset_delta(false).is_none());
    }

    #[test]
    fn test_inbound_delta_installs_tallies() {
        let mut vote = Vote::new();
        vote.apply_delta(&VoteDelta {
            self_vote: true,
            votes_for: 2,
            total_voters: 3,
        });
        assert!(vote.self_vote());
        assert_eq!(vote.votes_for(), 2);
        assert_eq!(vote.total_voters(), 3);
        assert!(vote.majority());
        assert!(!vote.all());
    }

    #[test]
    fn test_majority_boundaries() {
        let mut vote = Vote::new();
        vote.apply_delta(&VoteDelta {
            self_vote: true,
            votes_for: 2,
            total_voters: 4,
        });
        assert!(!vote.majority());

        vote.apply_delta(&VoteDelta {
            self_vote: true,
            votes_for: 3,
            total_voters: 4,
        });
        assert!(vote.majority());
    }
}
