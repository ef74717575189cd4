//! Execution nodes and placement evaluation.
//!
//! A node exposes a fixed number of executor slots and a set of
//! labels (its own name, configured tokens, and labels contributed by
//! registered extensions). `can_take` decides whether a node will
//! accept a queue item; the registry aggregates that decision across
//! all known nodes, distinguishing "no such label exists" from "label
//! exists but nothing can run it right now".

use crate::blockage::CauseOfBlockage;
use crate::item::Item;
use crucible_core::task::Identity;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Node scheduling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeMode {
    /// Accepts any matching task.
    #[default]
    Normal,
    /// Reserved: refuses tasks that did not ask for this node by label.
    Exclusive,
}

/// A machine (or container, VM, ...) that can run builds.
pub struct Node {
    name: String,
    labels: HashSet<String>,
    mode: NodeMode,
    num_executors: AtomicUsize,
    available: AtomicBool,
    properties: Vec<Arc<dyn NodeProperty>>,
}

impl Node {
    pub fn new(name: impl Into<String>, num_executors: usize) -> Self {
        Self {
            name: name.into(),
            labels: HashSet::new(),
            mode: NodeMode::Normal,
            num_executors: AtomicUsize::new(num_executors),
            available: AtomicBool::new(true),
            properties: Vec::new(),
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels.extend(labels.into_iter().map(Into::into));
        self
    }

    pub fn with_mode(mut self, mode: NodeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_property(mut self, property: Arc<dyn NodeProperty>) -> Self {
        self.properties.push(property);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    /// Configured label tokens, not including the node's own name or
    /// contributed labels.
    pub fn static_labels(&self) -> &HashSet<String> {
        &self.labels
    }

    pub fn num_executors(&self) -> usize {
        self.num_executors.load(Ordering::SeqCst)
    }

    pub fn set_num_executors(&self, n: usize) {
        self.num_executors.store(n, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether this node will accept the item. `None` means yes;
    /// otherwise the first refusing check wins: property veto,
    /// exclusive-mode restriction, label mismatch, permission.
    pub fn can_take(
        &self,
        item: &Item,
        effective_labels: &HashSet<String>,
        checker: &dyn PermissionChecker,
    ) -> Option<CauseOfBlockage> {
        for property in &self.properties {
            if let Some(cause) = property.can_take(self, item) {
                return Some(cause);
            }
        }

        let label = item.task.assigned_label();

        if self.mode == NodeMode::Exclusive && label.is_none() {
            return Some(CauseOfBlockage::NodeReserved {
                node: self.name.clone(),
            });
        }

        if let Some(expr) = &label
            && !expr.matches(effective_labels)
        {
            return Some(CauseOfBlockage::LabelMissing {
                label: expr.to_string(),
            });
        }

        if !checker.can_execute(&item.task.identity(), self) {
            return Some(CauseOfBlockage::LackingPermission {
                node: self.name.clone(),
            });
        }

        None
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("labels", &self.labels)
            .field("mode", &self.mode)
            .field("num_executors", &self.num_executors())
            .field("available", &self.is_available())
            .finish()
    }
}

/// Resource-level veto contract. Evaluated before any other check, in
/// registration order.
pub trait NodeProperty: Send + Sync {
    fn can_take(&self, node: &Node, item: &Item) -> Option<CauseOfBlockage>;
}

/// Contributes dynamic labels to nodes (e.g. detected toolchains).
pub trait LabelContributor: Send + Sync {
    fn labels_for(&self, node: &Node) -> Vec<String>;
}

/// Execute-permission check for a task identity on a node.
pub trait PermissionChecker: Send + Sync {
    fn can_execute(&self, identity: &Identity, node: &Node) -> bool;
}

/// Permission checker that lets everything through.
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn can_execute(&self, _identity: &Identity, _node: &Node) -> bool {
        true
    }
}

/// All currently known nodes, with the shared permission checker and
/// label contributors.
pub struct NodeRegistry {
    nodes: RwLock<Vec<Arc<Node>>>,
    contributors: RwLock<Vec<Arc<dyn LabelContributor>>>,
    checker: Arc<dyn PermissionChecker>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::with_permission_checker(Arc::new(AllowAll))
    }

    pub fn with_permission_checker(checker: Arc<dyn PermissionChecker>) -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            contributors: RwLock::new(Vec::new()),
            checker,
        }
    }

    pub fn register(&self, node: Arc<Node>) {
        self.nodes.write().unwrap().push(node);
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut nodes = self.nodes.write().unwrap();
        let before = nodes.len();
        nodes.retain(|n| n.name() != name);
        nodes.len() != before
    }

    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap()
            .iter()
            .find(|n| n.name() == name)
            .cloned()
    }

    /// Snapshot in registration order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().unwrap().clone()
    }

    pub fn add_label_contributor(&self, contributor: Arc<dyn LabelContributor>) {
        self.contributors.write().unwrap().push(contributor);
    }

    /// The node's full label set: its own name, configured tokens,
    /// and contributed labels.
    pub fn effective_labels(&self, node: &Node) -> HashSet<String> {
        let mut labels = node.static_labels().clone();
        labels.insert(node.name().to_string());
        for contributor in self.contributors.read().unwrap().iter() {
            labels.extend(contributor.labels_for(node));
        }
        labels
    }

    /// `can_take` with this registry's contributed labels and
    /// permission checker applied.
    pub fn can_take(&self, node: &Node, item: &Item) -> Option<CauseOfBlockage> {
        node.can_take(item, &self.effective_labels(node), self.checker.as_ref())
    }

    /// Aggregate placement decision across all known nodes. `None`
    /// means at least one node accepts the item. Otherwise: the label
    /// matches no known node at all (`LabelMissing`), every matching
    /// node is offline (`LabelBusy`), or the first refusal in
    /// registration order.
    pub fn evaluate(&self, item: &Item) -> Option<CauseOfBlockage> {
        let nodes = self.nodes();
        let label = item.task.assigned_label();
        let label_desc = label
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "any".to_string());

        let matching: Vec<&Arc<Node>> = nodes
            .iter()
            .filter(|n| match &label {
                Some(expr) => expr.matches(&self.effective_labels(n)),
                None => true,
            })
            .collect();

        if matching.is_empty() {
            return Some(match &label {
                Some(_) => CauseOfBlockage::LabelMissing { label: label_desc },
                None => CauseOfBlockage::LabelBusy { label: label_desc },
            });
        }

        let mut first_refusal = None;
        let mut any_available = false;
        for node in matching {
            if !node.is_available() {
                continue;
            }
            any_available = true;
            match self.can_take(node, item) {
                None => return None,
                Some(cause) => {
                    first_refusal.get_or_insert(cause);
                }
            }
        }

        if !any_available {
            return Some(CauseOfBlockage::LabelBusy { label: label_desc });
        }
        first_refusal
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
