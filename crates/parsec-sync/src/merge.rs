//! Three-way merge rules for concurrent local/remote divergence (spec
//! §4.6, §8 "Testable Properties: merge idempotence, merge commutativity
//! of disjoint changes").
//!
//! Every merge here takes `(base, local, remote)` — the last synced state
//! and the two states that diverged from it — and produces a single
//! result plus, for folders, a list of same-name collisions that must be
//! resolved by renaming one side (spec §8 scenario: two devices create an
//! entry with the same name under the same parent).

use std::collections::BTreeMap;

use parsec_core::ids::EntryID;
use parsec_core::workspace_entry::{Role, WorkspaceEntry};

/// A name that could not be merged cleanly: both sides put a different
/// entry id under the same name. The caller renames `loser` to a
/// "conflicting copy" name and re-inserts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameCollision {
    pub name: String,
    pub kept: EntryID,
    pub loser: EntryID,
}

/// Merge one side's three-way `{base, local, remote}` children maps
/// (shared by folder and workspace manifests, spec §3 "children").
///
/// For each name: unanimous agreement wins outright; a single-sided
/// change wins over an untouched base value; a genuine two-sided
/// divergence on the same name keeps the local value under that name and
/// reports the remote value as a collision for the caller to rename and
/// reinsert.
pub fn merge_children(
    base: &BTreeMap<String, EntryID>,
    local: &BTreeMap<String, EntryID>,
    remote: &BTreeMap<String, EntryID>,
) -> (BTreeMap<String, EntryID>, Vec<NameCollision>) {
    let mut names: Vec<&String> = base.keys().chain(local.keys()).chain(remote.keys()).collect();
    names.sort();
    names.dedup();

    let mut merged = BTreeMap::new();
    let mut collisions = Vec::new();

    for name in names {
        let base_id = base.get(name).copied();
        let local_id = local.get(name).copied();
        let remote_id = remote.get(name).copied();

        let resolved = if local_id == remote_id {
            local_id
        } else if local_id == base_id {
            remote_id
        } else if remote_id == base_id {
            local_id
        } else {
            // Both sides touched this name and disagree: local keeps the
            // name, remote's value survives as a renamed collision unless
            // remote deleted it outright.
            if let Some(remote_id) = remote_id {
                if let Some(local_id) = local_id {
                    collisions.push(NameCollision {
                        name: name.clone(),
                        kept: local_id,
                        loser: remote_id,
                    });
                }
            }
            local_id
        };

        if let Some(id) = resolved {
            merged.insert(name.clone(), id);
        }
    }

    (merged, collisions)
}

/// Merge a user manifest's workspace list (spec §4.3/§4.6), keyed by
/// workspace id. A workspace untouched on one side always yields to the
/// other side's value. A genuine divergence (both sides changed the same
/// workspace entry differently, e.g. one renamed it while the other's
/// role was updated by a re-queried certificate) resolves by keeping the
/// more *permissive* role between the two candidates — local edits never
/// get to silently downgrade an access grant that arrived from the
/// server, and a server-confirmed revocation never gets resurrected by a
/// stale local rename.
pub fn merge_workspaces(
    base: &[WorkspaceEntry],
    local: &[WorkspaceEntry],
    remote: &[WorkspaceEntry],
) -> Vec<WorkspaceEntry> {
    let mut ids: Vec<EntryID> = base
        .iter()
        .chain(local.iter())
        .chain(remote.iter())
        .map(|w| w.id)
        .collect();
    ids.sort();
    ids.dedup();

    let mut merged = Vec::new();
    for id in ids {
        let base_e = base.iter().find(|w| w.id == id);
        let local_e = local.iter().find(|w| w.id == id);
        let remote_e = remote.iter().find(|w| w.id == id);

        let chosen = match (local_e, remote_e) {
            (Some(l), Some(r)) if entries_equal(l, r) => Some(l.clone()),
            (Some(l), Some(r)) => {
                let local_changed = base_e.map(|b| !entries_equal(b, l)).unwrap_or(true);
                let remote_changed = base_e.map(|b| !entries_equal(b, r)).unwrap_or(true);
                match (local_changed, remote_changed) {
                    (true, false) => Some(l.clone()),
                    (false, true) => Some(r.clone()),
                    _ => Some(pick_more_permissive(l, r)),
                }
            }
            (Some(l), None) => Some(l.clone()),
            (None, Some(r)) => Some(r.clone()),
            (None, None) => None,
        };
        if let Some(entry) = chosen {
            merged.push(entry);
        }
    }
    merged
}

fn entries_equal(a: &WorkspaceEntry, b: &WorkspaceEntry) -> bool {
    a.name == b.name
        && a.encryption_revision == b.encryption_revision
        && a.role == b.role
        && a.role_cached_on == b.role_cached_on
}

fn role_rank(role: Option<Role>) -> u8 {
    match role {
        Some(Role::Owner) => 4,
        Some(Role::Manager) => 3,
        Some(Role::Contributor) => 2,
        Some(Role::Reader) => 1,
        None => 0,
    }
}

fn pick_more_permissive(a: &WorkspaceEntry, b: &WorkspaceEntry) -> WorkspaceEntry {
    if role_rank(a.role) >= role_rank(b.role) {
        a.clone()
    } else {
        b.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parsec_core::ids::EntryID;

    #[test]
    fn merge_is_idempotent_when_sides_agree() {
        let a = EntryID::new();
        let mut m = BTreeMap::new();
        m.insert("x".to_string(), a);
        let (merged, collisions) = merge_children(&m, &m, &m);
        assert_eq!(merged, m);
        assert!(collisions.is_empty());
    }

    #[test]
    fn disjoint_additions_commute() {
        let base = BTreeMap::new();
        let x = EntryID::new();
        let y = EntryID::new();
        let mut local = BTreeMap::new();
        local.insert("x".to_string(), x);
        let mut remote = BTreeMap::new();
        remote.insert("y".to_string(), y);

        let (merged_lr, c1) = merge_children(&base, &local, &remote);
        let (merged_rl, c2) = merge_children(&base, &remote, &local);
        assert_eq!(merged_lr, merged_rl);
        assert!(c1.is_empty());
        assert!(c2.is_empty());
        assert_eq!(merged_lr.len(), 2);
    }

    #[test]
    fn same_name_divergence_reports_a_collision() {
        let base = BTreeMap::new();
        let x = EntryID::new();
        let y = EntryID::new();
        let mut local = BTreeMap::new();
        local.insert("report.txt".to_string(), x);
        let mut remote = BTreeMap::new();
        remote.insert("report.txt".to_string(), y);

        let (merged, collisions) = merge_children(&base, &local, &remote);
        assert_eq!(merged.get("report.txt"), Some(&x));
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].loser, y);
    }

    #[test]
    fn deletion_on_one_side_alone_wins() {
        let x = EntryID::new();
        let mut base = BTreeMap::new();
        base.insert("a".to_string(), x);
        let local = BTreeMap::new(); // deleted locally
        let remote = base.clone(); // untouched

        let (merged, _) = merge_children(&base, &local, &remote);
        assert!(!merged.contains_key("a"));
    }

    #[test]
    fn workspace_role_divergence_keeps_more_permissive() {
        let base = WorkspaceEntry::new("docs");
        let mut local = base.clone();
        local.role = Some(Role::Reader);
        let mut remote = base.clone();
        remote.role_cached_on = chrono::Utc::now();
        remote.role = Some(Role::Manager);

        let merged = merge_workspaces(&[base], &[local], &[remote.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].role, Some(Role::Manager));
    }
}
