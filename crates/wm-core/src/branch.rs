//! Version-control operations over temporal memory: branch, checkout,
//! merge and cherry-pick.

use serde::{Deserialize, Serialize};

use crate::error::TrmError;
use crate::temporal::{Branch, CommitId, TemporalMemory, TemporalNode};
use crate::time::{now_unix_f64, unix_to_iso8601};

/// Outcome of `cognitive_merge`. Conflicts are reported, not fatal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    pub merged_commit_id: Option<CommitId>,
    pub conflicts: Vec<String>,
    pub insights: String,
}

impl TemporalMemory {
    /// Create `name` from the live timeline up to and including
    /// `from_commit`, or from the whole timeline.
    pub fn create_branch(&mut self, name: &str, from_commit: Option<CommitId>) -> Result<&Branch, TrmError> {
        if self.branch(name).is_some() {
            return Err(TrmError::BranchExists(name.to_string()));
        }

        let (timeline, base) = match from_commit {
            Some(commit) => {
                let pos = self
                    .stream
                    .iter()
                    .position(|n| n.commit_id == commit)
                    .ok_or_else(|| TrmError::UnknownCommit {
                        branch: self.current.clone(),
                        commit: commit.to_string(),
                    })?;
                (self.stream.iter().take(pos + 1).cloned().collect(), Some(commit))
            }
            None => (self.stream.iter().cloned().collect(), self.head()),
        };

        self.branches.push(Branch::new(name, base, timeline));
        tracing::info!(branch = name, base = ?base, "created branch");
        let idx = self.branches.len() - 1;
        Ok(&self.branches[idx])
    }

    /// Save the live timeline into the current branch and load `name`.
    pub fn checkout_branch(&mut self, name: &str) -> Result<(), TrmError> {
        let target = self
            .branches
            .iter()
            .position(|b| b.branch_name == name)
            .ok_or_else(|| TrmError::UnknownBranch(name.to_string()))?;
        if self.current == name {
            return Ok(());
        }

        let outgoing: Vec<TemporalNode> = self.stream.drain(..).collect();
        if let Some(current) = self.branches.iter_mut().find(|b| b.branch_name == self.current) {
            current.timeline = outgoing;
            current.is_active = false;
        }

        let incoming = self.branches[target].timeline.clone();
        self.branches[target].is_active = true;
        self.load_stream(incoming);
        tracing::info!(from = %self.current, to = name, "checked out branch");
        self.current = name.to_string();
        Ok(())
    }

    /// Apply `source`'s commits after its base onto HEAD.
    ///
    /// A candidate conflicts when the current timeline already holds the
    /// same content under a different timestamp. Others are re-parented
    /// with fresh commit ids, keeping their timestamp and energy. Running
    /// the same merge twice re-applies the non-conflicting nodes.
    pub fn cognitive_merge(&mut self, source: &str) -> Result<MergeResult, TrmError> {
        if source == self.current {
            return Err(TrmError::SelfMerge(source.to_string()));
        }
        let branch = self
            .branch(source)
            .ok_or_else(|| TrmError::UnknownBranch(source.to_string()))?;
        let base = branch.base_commit;
        let candidates: Vec<TemporalNode> = branch
            .timeline
            .iter()
            .filter(|n| base.is_none_or(|b| n.commit_id > b))
            .cloned()
            .collect();

        let mut conflicts = Vec::new();
        let mut merged = Vec::new();
        for node in candidates {
            let diverged = self
                .stream
                .iter()
                .find(|n| n.content == node.content && n.timestamp != node.timestamp);
            if let Some(existing) = diverged {
                conflicts.push(format!(
                    "'{}' at {} conflicts with {}",
                    node.content,
                    unix_to_iso8601(node.timestamp),
                    unix_to_iso8601(existing.timestamp)
                ));
                continue;
            }
            let applied = self.append_guarded(
                &node.content,
                &node.source_id,
                node.recursion_depth,
                node.timestamp,
                node.activation_energy,
            );
            if applied.is_some() {
                merged.push(node.content);
            }
        }

        let summary = format!(
            "merge {source} into {}: {} merged, {} conflicts",
            self.current,
            merged.len(),
            conflicts.len()
        );
        let merge_commit = self.append(&summary, "merge", 0, now_unix_f64(), 1.0);
        tracing::info!(
            source,
            merged = merged.len(),
            conflicts = conflicts.len(),
            "cognitive merge"
        );

        let insights = if merged.is_empty() {
            summary
        } else {
            format!("{summary}\n{}", merged.join("\n"))
        };
        Ok(MergeResult {
            success: true,
            merged_commit_id: Some(merge_commit),
            conflicts,
            insights,
        })
    }

    /// Copy one commit from `branch` onto HEAD under a provenance prefix.
    pub fn cherry_pick(&mut self, branch: &str, commit: CommitId) -> Result<CommitId, TrmError> {
        let node = if branch == self.current {
            self.stream.iter().find(|n| n.commit_id == commit)
        } else {
            self.branch(branch)
                .ok_or_else(|| TrmError::UnknownBranch(branch.to_string()))?
                .timeline
                .iter()
                .find(|n| n.commit_id == commit)
        }
        .cloned()
        .ok_or_else(|| TrmError::UnknownCommit {
            branch: branch.to_string(),
            commit: commit.to_string(),
        })?;

        let content = format!("[cherry-pick {branch}@{commit}] {}", node.content);
        let picked = self.append(&content, &node.source_id, node.recursion_depth, now_unix_f64(), 1.0);
        tracing::info!(branch, %commit, %picked, "cherry-picked commit");
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use crate::constants::MAIN_BRANCH;
    use crate::error::TrmError;
    use crate::temporal::{CommitId, TemporalMemory};

    const T0: f64 = 1_700_000_000.0;

    fn contents(memory: &TemporalMemory) -> Vec<String> {
        memory.log().map(|n| n.content.clone()).collect()
    }

    #[test]
    fn test_main_exists_and_is_current() {
        let m = TemporalMemory::default();
        assert_eq!(m.current_branch(), MAIN_BRANCH);
        assert!(m.branch(MAIN_BRANCH).unwrap().is_active);
    }

    #[test]
    fn test_create_branch_duplicate_name_fails() {
        let mut m = TemporalMemory::default();
        m.create_branch("idea", None).unwrap();
        assert_eq!(
            m.create_branch("idea", None).unwrap_err(),
            TrmError::BranchExists("idea".into())
        );
        assert!(matches!(
            m.create_branch(MAIN_BRANCH, None),
            Err(TrmError::BranchExists(_))
        ));
    }

    #[test]
    fn test_create_branch_from_commit_truncates() {
        let mut m = TemporalMemory::default();
        let a = m.push_state("a", "t").unwrap();
        m.push_state("b", "t");
        let branch = m.create_branch("early", Some(a)).unwrap();
        assert_eq!(branch.base_commit, Some(a));
        assert_eq!(branch.timeline.len(), 1);
        assert!(!branch.is_active);
    }

    #[test]
    fn test_create_branch_unknown_commit() {
        let mut m = TemporalMemory::default();
        m.push_state("a", "t");
        assert!(matches!(
            m.create_branch("x", Some(CommitId(1))),
            Err(TrmError::UnknownCommit { .. })
        ));
    }

    #[test]
    fn test_checkout_unknown_fails() {
        let mut m = TemporalMemory::default();
        assert_eq!(
            m.checkout_branch("nowhere"),
            Err(TrmError::UnknownBranch("nowhere".into()))
        );
        assert_eq!(m.current_branch(), MAIN_BRANCH);
    }

    #[test]
    fn test_branch_isolation() {
        let mut m = TemporalMemory::default();
        m.push_state("shared root", "t");
        m.create_branch("b", None).unwrap();
        m.push_state("main only", "t");
        assert_eq!(m.branch("b").unwrap().timeline.len(), 1);

        m.checkout_branch("b").unwrap();
        assert_eq!(contents(&m), vec!["shared root"]);
        m.push_state("b only", "t");
        m.checkout_branch(MAIN_BRANCH).unwrap();
        assert_eq!(contents(&m), vec!["shared root", "main only"]);
        assert!(m.branch(MAIN_BRANCH).unwrap().is_active);
        assert!(!m.branch("b").unwrap().is_active);
    }

    #[test]
    fn test_merge_reports_single_conflict() {
        let mut m = TemporalMemory::default();
        m.push_state_at("root", "t", T0);
        m.create_branch("b", None).unwrap();
        m.push_state_at("X", "t", T0 + 10.0);

        m.checkout_branch("b").unwrap();
        m.push_state_at("X", "t", T0 + 20.0);
        m.push_state_at("new insight", "t", T0 + 30.0);
        m.checkout_branch(MAIN_BRANCH).unwrap();

        let result = m.cognitive_merge("b").unwrap();
        assert!(result.success);
        assert_eq!(result.conflicts.len(), 1);
        assert!(result.conflicts[0].contains("'X'"));

        let xs: Vec<f64> = m
            .log()
            .filter(|n| n.content == "X")
            .map(|n| n.timestamp)
            .collect();
        assert_eq!(xs, vec![T0 + 10.0]);
        assert!(contents(&m).contains(&"new insight".to_string()));
        assert_eq!(m.head(), result.merged_commit_id);
    }

    #[test]
    fn test_merge_reparents_with_fresh_ids() {
        let mut m = TemporalMemory::default();
        m.create_branch("b", None).unwrap();
        m.checkout_branch("b").unwrap();
        let source = m.push_state_at("from b", "t", T0).unwrap();
        m.checkout_branch(MAIN_BRANCH).unwrap();
        let main_head = m.push_state("on main", "t").unwrap();

        m.cognitive_merge("b").unwrap();
        let merged = m.log().find(|n| n.content == "from b").unwrap();
        assert_ne!(merged.commit_id, source);
        assert_eq!(merged.parent_id, Some(main_head));
        assert_eq!(merged.timestamp, T0);
    }

    #[test]
    fn test_merge_not_idempotent() {
        let mut m = TemporalMemory::default();
        m.create_branch("b", None).unwrap();
        m.checkout_branch("b").unwrap();
        m.push_state_at("insight", "t", T0);
        m.checkout_branch(MAIN_BRANCH).unwrap();

        m.cognitive_merge("b").unwrap();
        let second = m.cognitive_merge("b").unwrap();
        assert!(second.conflicts.is_empty());
        assert_eq!(contents(&m).iter().filter(|c| *c == "insight").count(), 2);
    }

    #[test]
    fn test_merge_commit_always_appended() {
        let mut m = TemporalMemory::default();
        m.create_branch("empty", None).unwrap();
        let result = m.cognitive_merge("empty").unwrap();
        assert!(result.success);
        assert!(result.conflicts.is_empty());
        assert_eq!(m.len(), 1);
        assert!(m.log().next().unwrap().content.starts_with("merge empty into main"));
    }

    #[test]
    fn test_merge_unknown_and_self() {
        let mut m = TemporalMemory::default();
        assert_eq!(
            m.cognitive_merge("missing"),
            Err(TrmError::UnknownBranch("missing".into()))
        );
        assert_eq!(
            m.cognitive_merge(MAIN_BRANCH),
            Err(TrmError::SelfMerge(MAIN_BRANCH.into()))
        );
    }

    #[test]
    fn test_cherry_pick_provenance() {
        let mut m = TemporalMemory::default();
        m.create_branch("side", None).unwrap();
        m.checkout_branch("side").unwrap();
        m.push_state("side effect", "t");
        let wanted = m.push_state("the good idea", "t").unwrap();
        m.checkout_branch(MAIN_BRANCH).unwrap();

        let picked = m.cherry_pick("side", wanted).unwrap();
        assert_ne!(picked, wanted);
        let node = m.log().last().unwrap();
        assert_eq!(node.commit_id, picked);
        assert!(node.content.starts_with("[cherry-pick side@"));
        assert!(node.content.ends_with("the good idea"));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_cherry_pick_not_found() {
        let mut m = TemporalMemory::default();
        m.create_branch("side", None).unwrap();
        assert!(matches!(
            m.cherry_pick("nope", CommitId(1)),
            Err(TrmError::UnknownBranch(_))
        ));
        assert!(matches!(
            m.cherry_pick("side", CommitId(1)),
            Err(TrmError::UnknownCommit { .. })
        ));
    }
}
