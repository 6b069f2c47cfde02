use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use dashmap::DashMap;

use crate::models::archive::{DeletedUser, DeletionReceipt};
use crate::models::users::{User, UserNode, UserStatus};
use crate::settings;

/// Sanity bound on parent-pointer walks. The forest invariant makes cycles
/// impossible, so hitting this means corrupted state, not a deep tree.
const MAX_ANCESTRY_WALK: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("user not found: {0}")]
    NotFound(String),
    #[error("user already exists: {0}")]
    AlreadyExists(String),
    #[error("parent {0} already has the maximum number of direct children")]
    ParentFull(String),
    #[error("user {0} still has direct children")]
    HasChildren(String),
    #[error("placing {user_id} under {parent_id} would create a cycle")]
    CycleDetected { user_id: String, parent_id: String },
    #[error("the company root cannot be created, moved, or deleted")]
    RootImmutable,
    #[error("parent chain from {0} exceeded the ancestry walk bound")]
    AncestryTooDeep(String),
}

type Edge = Arc<Mutex<Vec<String>>>;

fn lock_edge(edge: &Edge) -> MutexGuard<'_, Vec<String>> {
    edge.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Canonical adjacency and sponsor linkage for every user, plus the archive
/// of deleted users. Single source of truth for capacity counts.
///
/// Concurrency: the capacity check and the child-edge write happen under one
/// per-parent edge mutex, so concurrent placements against the same parent
/// serialize on that parent alone. Re-parenting and deletion additionally
/// hold `structure`, which keeps parent pointers stable while they lock the
/// (child, parent) or (old parent, new parent) edge pair in sorted key
/// order. Placements never take `structure`, so the hot path stays
/// per-parent.
pub struct TreeStore {
    capacity: usize,
    root_id: String,
    nodes: DashMap<String, User>,
    edges: DashMap<String, Edge>,
    referral_codes: DashMap<String, String>,
    archive: RwLock<Vec<DeletedUser>>,
    structure: Mutex<()>,
}

impl TreeStore {
    /// Seeds the company root sentinel; it exists for the lifetime of the
    /// store and is exempt from the capacity cap.
    pub fn new(tree: &settings::Tree) -> Self {
        let now = Utc::now();
        let root = User {
            user_id: tree.root_id.clone(),
            full_name: tree.root_name.clone(),
            email: String::new(),
            phone: None,
            genealogy: None,
            package_usd: 0.0,
            status: UserStatus::Active,
            referral_code: tree.root_id.clone(),
            date_joined: now.date_naive(),
            created_at: now,
            updated_at: now,
        };

        let store = TreeStore {
            capacity: tree.capacity,
            root_id: tree.root_id.clone(),
            nodes: DashMap::new(),
            edges: DashMap::new(),
            referral_codes: DashMap::new(),
            archive: RwLock::new(Vec::new()),
            structure: Mutex::new(()),
        };
        store
            .edges
            .insert(root.user_id.clone(), Arc::new(Mutex::new(Vec::new())));
        store
            .referral_codes
            .insert(root.referral_code.clone(), root.user_id.clone());
        store.nodes.insert(root.user_id.clone(), root);
        store
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.nodes.contains_key(user_id)
    }

    pub fn get_user(&self, user_id: &str) -> Result<User, StoreError> {
        self.nodes
            .get(user_id)
            .map(|u| u.clone())
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))
    }

    pub fn referral_code_taken(&self, code: &str) -> bool {
        self.referral_codes.contains_key(code)
    }

    fn edge(&self, user_id: &str) -> Option<Edge> {
        self.edges.get(user_id).map(|e| e.value().clone())
    }

    /// Direct children under the placement edge, in insertion order.
    pub fn get_children(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let edge = self
            .edge(user_id)
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
        let children = lock_edge(&edge).clone();
        Ok(children)
    }

    pub fn child_count(&self, user_id: &str) -> Result<usize, StoreError> {
        let edge = self
            .edge(user_id)
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
        let count = lock_edge(&edge).len();
        Ok(count)
    }

    /// Inserts a new user under its placement parent. Capacity check and
    /// edge write are one atomic step under the parent's edge lock, so two
    /// racing inserts against a parent with K-1 children cannot both win.
    pub fn insert_user(&self, user: User) -> Result<(), StoreError> {
        let genealogy = user.genealogy.as_ref().ok_or(StoreError::RootImmutable)?;
        let parent_id = genealogy.placement.clone();
        if !self.nodes.contains_key(&genealogy.sponsorship) {
            return Err(StoreError::NotFound(genealogy.sponsorship.clone()));
        }

        let edge = self
            .edge(&parent_id)
            .ok_or_else(|| StoreError::NotFound(parent_id.clone()))?;
        let mut children = lock_edge(&edge);

        // The parent may have been deleted between the lookup and the lock.
        if !self.nodes.contains_key(&parent_id) {
            return Err(StoreError::NotFound(parent_id));
        }
        if parent_id != self.root_id && children.len() >= self.capacity {
            return Err(StoreError::ParentFull(parent_id));
        }
        if self.nodes.contains_key(&user.user_id) {
            return Err(StoreError::AlreadyExists(user.user_id.clone()));
        }

        children.push(user.user_id.clone());
        self.edges
            .insert(user.user_id.clone(), Arc::new(Mutex::new(Vec::new())));
        self.referral_codes
            .insert(user.referral_code.clone(), user.user_id.clone());
        self.nodes.insert(user.user_id.clone(), user);
        Ok(())
    }

    /// Walks placement parents from `user_id` towards the root, returning
    /// whether `ancestor_id` is on that path.
    fn descends_from(&self, user_id: &str, ancestor_id: &str) -> Result<bool, StoreError> {
        let mut current = user_id.to_string();
        for _ in 0..MAX_ANCESTRY_WALK {
            if current == ancestor_id {
                return Ok(true);
            }
            let parent = self
                .nodes
                .get(&current)
                .and_then(|u| u.parent_id().map(String::from));
            match parent {
                Some(p) => current = p,
                None => return Ok(false),
            }
        }
        Err(StoreError::AncestryTooDeep(user_id.to_string()))
    }

    /// Moves `user_id` under `new_parent_id`. Leaf checks are the caller's
    /// business rule; this operation guards the structural invariants
    /// (existence, acyclicity, capacity on the new edge).
    pub fn set_parent(&self, user_id: &str, new_parent_id: &str) -> Result<(), StoreError> {
        if user_id == self.root_id {
            return Err(StoreError::RootImmutable);
        }

        // Two concurrent moves could each pass the ancestry walk and then
        // jointly form a cycle; holding `structure` for the whole move rules
        // that out. Placements never contend for it.
        let _structure = self
            .structure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let user = self.get_user(user_id)?;
        let old_parent_id = match user.genealogy {
            Some(g) => g.placement,
            None => return Err(StoreError::RootImmutable),
        };
        if old_parent_id == new_parent_id {
            return Ok(());
        }
        if !self.nodes.contains_key(new_parent_id) {
            return Err(StoreError::NotFound(new_parent_id.to_string()));
        }
        if new_parent_id == user_id || self.descends_from(new_parent_id, user_id)? {
            return Err(StoreError::CycleDetected {
                user_id: user_id.to_string(),
                parent_id: new_parent_id.to_string(),
            });
        }

        let old_edge = self
            .edge(&old_parent_id)
            .ok_or_else(|| StoreError::NotFound(old_parent_id.clone()))?;
        let new_edge = self
            .edge(new_parent_id)
            .ok_or_else(|| StoreError::NotFound(new_parent_id.to_string()))?;

        // Sorted key order keeps edge-pair acquisition deadlock-free.
        let (mut old_children, mut new_children) = if old_parent_id.as_str() < new_parent_id {
            let first = lock_edge(&old_edge);
            let second = lock_edge(&new_edge);
            (first, second)
        } else {
            let second = lock_edge(&new_edge);
            let first = lock_edge(&old_edge);
            (first, second)
        };

        if new_parent_id != self.root_id && new_children.len() >= self.capacity {
            return Err(StoreError::ParentFull(new_parent_id.to_string()));
        }

        old_children.retain(|c| c != user_id);
        new_children.push(user_id.to_string());
        if let Some(mut node) = self.nodes.get_mut(user_id) {
            if let Some(genealogy) = node.genealogy.as_mut() {
                genealogy.placement = new_parent_id.to_string();
            }
            node.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Applies a mutation to display/sponsorship fields and bumps
    /// `updated_at`. Structural fields go through `set_parent`.
    pub fn update_user<F>(&self, user_id: &str, apply: F) -> Result<User, StoreError>
    where
        F: FnOnce(&mut User),
    {
        let mut node = self
            .nodes
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
        apply(&mut node);
        node.updated_at = Utc::now();
        Ok(node.clone())
    }

    /// Excises a leaf: transfers its balance to the placement parent, writes
    /// the archive record, and removes the node. All failable checks happen
    /// before the first write, so the operation is all-or-nothing.
    pub fn remove_node(&self, user_id: &str, deleted_by: &str) -> Result<DeletionReceipt, StoreError> {
        if user_id == self.root_id {
            return Err(StoreError::RootImmutable);
        }
        let _structure = self
            .structure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let user = self.get_user(user_id)?;
        let parent_id = match &user.genealogy {
            Some(g) => g.placement.clone(),
            None => return Err(StoreError::RootImmutable),
        };

        let user_edge = self
            .edge(user_id)
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
        let parent_edge = self
            .edge(&parent_id)
            .ok_or_else(|| StoreError::NotFound(parent_id.clone()))?;

        let (user_children, mut parent_children) = if user_id < parent_id.as_str() {
            let first = lock_edge(&user_edge);
            let second = lock_edge(&parent_edge);
            (first, second)
        } else {
            let second = lock_edge(&parent_edge);
            let first = lock_edge(&user_edge);
            (first, second)
        };

        // An in-flight placement under this node either completed before we
        // took its edge lock (visible here) or will fail its NotFound
        // re-check after we drop it.
        if !user_children.is_empty() {
            return Err(StoreError::HasChildren(user_id.to_string()));
        }

        let removed = match self.nodes.remove(user_id) {
            Some((_, node)) => node,
            None => return Err(StoreError::NotFound(user_id.to_string())),
        };
        parent_children.retain(|c| c != user_id);
        let transferred = removed.package_usd;
        if let Some(mut parent) = self.nodes.get_mut(&parent_id) {
            parent.package_usd += transferred;
            parent.updated_at = Utc::now();
        }
        self.referral_codes.remove(&removed.referral_code);
        drop(user_children);
        self.edges.remove(user_id);

        self.archive
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeletedUser::new(&removed, deleted_by.to_string(), transferred));

        Ok(DeletionReceipt {
            user_id: removed.user_id,
            transferred_amount_usd: transferred,
            transferred_to: parent_id,
        })
    }

    /// Materializes the subtree under `user_id`, bounded by `max_depth`
    /// levels below it. Pure read; no state retained between calls.
    pub fn get_subtree(&self, user_id: &str, max_depth: usize) -> Result<UserNode, StoreError> {
        let user = self.get_user(user_id)?;
        Ok(self.project_node(&user, max_depth))
    }

    fn project_node(&self, user: &User, depth: usize) -> UserNode {
        let children = if depth == 0 {
            Vec::new()
        } else {
            self.get_children(&user.user_id)
                .unwrap_or_default()
                .iter()
                .filter_map(|id| self.nodes.get(id).map(|u| u.clone()))
                .map(|child| self.project_node(&child, depth - 1))
                .collect()
        };
        let split = user.is_split_sponsor();
        UserNode {
            user_id: user.user_id.clone(),
            full_name: user.full_name.clone(),
            package_usd: user.package_usd,
            is_split_sponsor: split,
            original_sponsor_id: if split {
                user.sponsor_id().map(String::from)
            } else {
                None
            },
            children,
        }
    }

    /// One-hop placement parent; `None` only for the root sentinel.
    pub fn get_ancestor(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let user = self.get_user(user_id)?;
        match user.parent_id() {
            Some(parent_id) => Ok(self.nodes.get(parent_id).map(|u| u.clone())),
            None => Ok(None),
        }
    }

    /// Every user except the root sentinel, unordered.
    pub fn list_users(&self) -> Vec<User> {
        self.nodes
            .iter()
            .filter(|entry| entry.key() != &self.root_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn list_deleted(&self) -> Vec<DeletedUser> {
        self.archive
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::users::Genealogy;

    fn test_tree(capacity: usize) -> settings::Tree {
        settings::Tree {
            capacity,
            max_depth: 5,
            root_id: "SAGENEX-GOLD".to_string(),
            root_name: "Sagenex Gold".to_string(),
        }
    }

    fn user(id: &str, parent: &str, sponsor: &str, package: f64) -> User {
        let now = Utc::now();
        User {
            user_id: id.to_string(),
            full_name: format!("User {}", id),
            email: format!("{}@example.com", id),
            phone: None,
            genealogy: Some(Genealogy {
                placement: parent.to_string(),
                sponsorship: sponsor.to_string(),
            }),
            package_usd: package,
            status: UserStatus::Active,
            referral_code: format!("SGX-{}", id),
            date_joined: now.date_naive(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn seeds_root_sentinel() {
        let store = TreeStore::new(&test_tree(6));
        let root = store.get_user("SAGENEX-GOLD").unwrap();
        assert!(root.is_root());
        assert_eq!(store.child_count("SAGENEX-GOLD").unwrap(), 0);
        assert!(store.get_ancestor("SAGENEX-GOLD").unwrap().is_none());
    }

    #[test]
    fn insert_places_under_parent() {
        let store = TreeStore::new(&test_tree(6));
        store
            .insert_user(user("u1", "SAGENEX-GOLD", "SAGENEX-GOLD", 100.0))
            .unwrap();
        assert_eq!(store.get_children("SAGENEX-GOLD").unwrap(), vec!["u1"]);
        let parent = store.get_ancestor("u1").unwrap().unwrap();
        assert_eq!(parent.user_id, "SAGENEX-GOLD");
    }

    #[test]
    fn insert_rejects_missing_parent() {
        let store = TreeStore::new(&test_tree(6));
        let err = store
            .insert_user(user("u1", "nobody", "nobody", 0.0))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn insert_enforces_capacity_per_edge() {
        let store = TreeStore::new(&test_tree(2));
        store
            .insert_user(user("s", "SAGENEX-GOLD", "SAGENEX-GOLD", 0.0))
            .unwrap();
        store.insert_user(user("a", "s", "s", 0.0)).unwrap();
        store.insert_user(user("b", "s", "s", 0.0)).unwrap();
        let err = store.insert_user(user("c", "s", "s", 0.0)).unwrap_err();
        assert!(matches!(err, StoreError::ParentFull(p) if p == "s"));
        assert_eq!(store.child_count("s").unwrap(), 2);
    }

    #[test]
    fn root_is_exempt_from_capacity() {
        let store = TreeStore::new(&test_tree(2));
        for i in 0..5 {
            store
                .insert_user(user(&format!("u{}", i), "SAGENEX-GOLD", "SAGENEX-GOLD", 0.0))
                .unwrap();
        }
        assert_eq!(store.child_count("SAGENEX-GOLD").unwrap(), 5);
    }

    #[test]
    fn set_parent_moves_leaf() {
        let store = TreeStore::new(&test_tree(6));
        store
            .insert_user(user("a", "SAGENEX-GOLD", "SAGENEX-GOLD", 0.0))
            .unwrap();
        store
            .insert_user(user("b", "SAGENEX-GOLD", "SAGENEX-GOLD", 0.0))
            .unwrap();
        store.set_parent("b", "a").unwrap();
        assert_eq!(store.get_children("a").unwrap(), vec!["b"]);
        assert_eq!(store.get_children("SAGENEX-GOLD").unwrap(), vec!["a"]);
        // sponsorship untouched by a structural move
        let b = store.get_user("b").unwrap();
        assert_eq!(b.sponsor_id(), Some("SAGENEX-GOLD"));
        assert!(b.is_split_sponsor());
    }

    #[test]
    fn set_parent_detects_cycles() {
        let store = TreeStore::new(&test_tree(6));
        store
            .insert_user(user("a", "SAGENEX-GOLD", "SAGENEX-GOLD", 0.0))
            .unwrap();
        store.insert_user(user("b", "a", "a", 0.0)).unwrap();
        store.insert_user(user("c", "b", "b", 0.0)).unwrap();

        let err = store.set_parent("a", "c").unwrap_err();
        assert!(matches!(err, StoreError::CycleDetected { .. }));
        let err = store.set_parent("a", "a").unwrap_err();
        assert!(matches!(err, StoreError::CycleDetected { .. }));
        // unrelated move still fine
        store.set_parent("c", "SAGENEX-GOLD").unwrap();
    }

    #[test]
    fn set_parent_rejects_root_and_missing_targets() {
        let store = TreeStore::new(&test_tree(6));
        store
            .insert_user(user("a", "SAGENEX-GOLD", "SAGENEX-GOLD", 0.0))
            .unwrap();
        assert!(matches!(
            store.set_parent("SAGENEX-GOLD", "a").unwrap_err(),
            StoreError::RootImmutable
        ));
        assert!(matches!(
            store.set_parent("a", "nobody").unwrap_err(),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            store.set_parent("nobody", "a").unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn set_parent_enforces_capacity_on_new_edge() {
        let store = TreeStore::new(&test_tree(1));
        store
            .insert_user(user("p", "SAGENEX-GOLD", "SAGENEX-GOLD", 0.0))
            .unwrap();
        store.insert_user(user("a", "p", "p", 0.0)).unwrap();
        store
            .insert_user(user("b", "SAGENEX-GOLD", "SAGENEX-GOLD", 0.0))
            .unwrap();
        let err = store.set_parent("b", "p").unwrap_err();
        assert!(matches!(err, StoreError::ParentFull(_)));
    }

    #[test]
    fn remove_node_transfers_balance_and_archives() {
        let store = TreeStore::new(&test_tree(6));
        store
            .insert_user(user("p", "SAGENEX-GOLD", "SAGENEX-GOLD", 500.0))
            .unwrap();
        store.insert_user(user("c", "p", "p", 250.0)).unwrap();

        let receipt = store.remove_node("c", "admin-1").unwrap();
        assert_eq!(receipt.transferred_amount_usd, 250.0);
        assert_eq!(receipt.transferred_to, "p");

        assert!(!store.contains("c"));
        assert_eq!(store.get_user("p").unwrap().package_usd, 750.0);
        assert_eq!(store.get_children("p").unwrap(), Vec::<String>::new());

        let archive = store.list_deleted();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].user.user_id, "c");
        assert_eq!(archive[0].deleted_by, "admin-1");
        assert_eq!(archive[0].transferred_amount_usd, 250.0);
    }

    #[test]
    fn remove_node_refuses_non_leaf_and_leaves_state_unchanged() {
        let store = TreeStore::new(&test_tree(6));
        store
            .insert_user(user("p", "SAGENEX-GOLD", "SAGENEX-GOLD", 500.0))
            .unwrap();
        store.insert_user(user("c", "p", "p", 250.0)).unwrap();

        let err = store.remove_node("p", "admin-1").unwrap_err();
        assert!(matches!(err, StoreError::HasChildren(u) if u == "p"));
        assert!(store.contains("p"));
        assert_eq!(store.get_user("p").unwrap().package_usd, 500.0);
        assert!(store.list_deleted().is_empty());
    }

    #[test]
    fn remove_node_refuses_root() {
        let store = TreeStore::new(&test_tree(6));
        assert!(matches!(
            store.remove_node("SAGENEX-GOLD", "admin-1").unwrap_err(),
            StoreError::RootImmutable
        ));
    }

    #[test]
    fn subtree_is_depth_bounded() {
        let store = TreeStore::new(&test_tree(6));
        store
            .insert_user(user("a", "SAGENEX-GOLD", "SAGENEX-GOLD", 0.0))
            .unwrap();
        store.insert_user(user("b", "a", "a", 0.0)).unwrap();
        store.insert_user(user("c", "b", "b", 0.0)).unwrap();

        let tree = store.get_subtree("SAGENEX-GOLD", 1).unwrap();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].user_id, "a");
        assert!(tree.children[0].children.is_empty());

        let deep = store.get_subtree("a", 5).unwrap();
        assert_eq!(deep.children[0].children[0].user_id, "c");
    }

    #[test]
    fn subtree_marks_split_sponsors() {
        let store = TreeStore::new(&test_tree(6));
        store
            .insert_user(user("s", "SAGENEX-GOLD", "SAGENEX-GOLD", 0.0))
            .unwrap();
        store.insert_user(user("d", "s", "s", 0.0)).unwrap();
        // spilled under d, sponsored by s
        store.insert_user(user("x", "d", "s", 0.0)).unwrap();

        let tree = store.get_subtree("d", 1).unwrap();
        let node = &tree.children[0];
        assert!(node.is_split_sponsor);
        assert_eq!(node.original_sponsor_id.as_deref(), Some("s"));
    }

    #[test]
    fn parent_chain_terminates_at_root() {
        let store = TreeStore::new(&test_tree(6));
        store
            .insert_user(user("a", "SAGENEX-GOLD", "SAGENEX-GOLD", 0.0))
            .unwrap();
        store.insert_user(user("b", "a", "a", 0.0)).unwrap();
        store.insert_user(user("c", "b", "b", 0.0)).unwrap();
        store.set_parent("c", "a").unwrap();

        for id in ["a", "b", "c"] {
            let mut current = id.to_string();
            let mut hops = 0;
            while let Some(parent) = store.get_ancestor(&current).unwrap() {
                current = parent.user_id;
                hops += 1;
                assert!(hops < 100);
            }
            assert_eq!(current, "SAGENEX-GOLD");
        }
    }
}
