use serde::Serialize;

use crate::model::PermissionMap;

/// Key-level difference between what a new version asks for and what the
/// installed version already holds. Caveats are never compared.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PermissionDiff {
    /// Requested but not yet granted.
    pub new: PermissionMap,
    /// Granted but no longer requested.
    pub unused: PermissionMap,
    /// Granted and still requested.
    pub approved: PermissionMap,
}

impl PermissionDiff {
    pub fn compute(desired: &PermissionMap, granted: &PermissionMap) -> Self {
        let new = permissions_diff(desired, granted);
        let unused = permissions_diff(granted, desired);
        let approved = permissions_diff(granted, &unused);
        Self {
            new,
            unused,
            approved,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.new.is_empty() && self.unused.is_empty()
    }
}

/// Entries of `left` whose key is absent from `right`.
pub fn permissions_diff(left: &PermissionMap, right: &PermissionMap) -> PermissionMap {
    left.iter()
        .filter(|(name, _)| !right.contains_key(*name))
        .map(|(name, spec)| (name.clone(), spec.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PermissionSpec, MAX_REQUEST_TIME_CAVEAT};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn map(names: &[&str]) -> PermissionMap {
        names
            .iter()
            .map(|name| (name.to_string(), PermissionSpec::default()))
            .collect()
    }

    fn keys(map: &PermissionMap) -> BTreeSet<&str> {
        map.keys().map(String::as_str).collect()
    }

    #[test]
    fn identical_sets_have_nothing_new_or_unused() {
        let perms = map(&["endowment:rpc", "manage_state"]);
        let diff = PermissionDiff::compute(&perms, &perms);
        assert!(diff.new.is_empty());
        assert!(diff.unused.is_empty());
        assert_eq!(diff.approved, perms);
        assert!(diff.is_unchanged());
    }

    #[test]
    fn partitions_cover_desired_and_granted() {
        let cases = [
            (vec!["a", "b", "c"], vec!["b", "c", "d"]),
            (vec![], vec!["x"]),
            (vec!["x"], vec![]),
            (vec!["a", "b"], vec!["c", "d"]),
        ];
        for (desired, granted) in cases {
            let desired = map(&desired);
            let granted = map(&granted);
            let diff = PermissionDiff::compute(&desired, &granted);

            let new_and_approved: BTreeSet<_> =
                keys(&diff.new).union(&keys(&diff.approved)).copied().collect();
            assert_eq!(new_and_approved, keys(&desired));

            let unused_and_approved: BTreeSet<_> = keys(&diff.unused)
                .union(&keys(&diff.approved))
                .copied()
                .collect();
            assert_eq!(unused_and_approved, keys(&granted));
        }
    }

    #[test]
    fn caveat_changes_are_ignored() {
        let desired: PermissionMap = [(
            "endowment:rpc".to_string(),
            PermissionSpec::with_caveat(MAX_REQUEST_TIME_CAVEAT, json!(10)),
        )]
        .into_iter()
        .collect();
        let granted = map(&["endowment:rpc"]);
        let diff = PermissionDiff::compute(&desired, &granted);
        assert!(diff.is_unchanged());
        assert_eq!(keys(&diff.approved), BTreeSet::from(["endowment:rpc"]));
    }
}
