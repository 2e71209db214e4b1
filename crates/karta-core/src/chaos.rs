//! Weighted chaos-action trees.
//!
//! Trees are stored as an arena of nodes with explicit parent/child links.
//! Construction, validation and selection all walk the arena with explicit
//! stacks so pathological configurations cannot exhaust the call stack.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosAction {
    pub name: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl ChaosAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subjects: Vec::new(),
            params: HashMap::new(),
        }
    }

    pub fn with_subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects.extend(subjects.into_iter().map(Into::into));
        self
    }
}

/// How a node picks among its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubTreeSelection {
    /// One child, drawn by weight.
    #[default]
    Exclusive,
    /// Every positively weighted child, each traversed independently.
    Inclusive,
}

/// Nested configuration form of a chaos tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosTreeSpec {
    #[serde(default)]
    pub action: Option<ChaosAction>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub selection: SubTreeSelection,
    #[serde(default)]
    pub children: Vec<ChaosTreeSpec>,
}

fn default_weight() -> f64 {
    1.0
}

impl ChaosTreeSpec {
    pub fn leaf(action: ChaosAction, weight: f64) -> Self {
        Self {
            action: Some(action),
            weight,
            selection: SubTreeSelection::Exclusive,
            children: Vec::new(),
        }
    }

    pub fn branch(selection: SubTreeSelection, weight: f64, children: Vec<ChaosTreeSpec>) -> Self {
        Self {
            action: None,
            weight,
            selection,
            children,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ChaosNodeId(pub usize);

impl std::fmt::Display for ChaosNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosNode {
    pub action: Option<ChaosAction>,
    pub weight: f64,
    pub selection: SubTreeSelection,
    pub children: Vec<ChaosNodeId>,
    pub parent: Option<ChaosNodeId>,
}

impl ChaosNode {
    pub fn new(action: Option<ChaosAction>, weight: f64, selection: SubTreeSelection) -> Self {
        Self {
            action,
            weight,
            selection,
            children: Vec::new(),
            parent: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChaosTreeError {
    #[error("chaos tree has no nodes")]
    Empty,
    #[error("chaos node {node} references missing node {missing}")]
    MissingNode { node: ChaosNodeId, missing: ChaosNodeId },
    #[error("chaos node {node} is reachable more than once (cycle or shared child)")]
    Revisited { node: ChaosNodeId },
    #[error("chaos node {node} records parent {recorded:?} but is a child of {actual:?}")]
    ParentMismatch {
        node: ChaosNodeId,
        recorded: Option<ChaosNodeId>,
        actual: Option<ChaosNodeId>,
    },
    #[error("chaos node {node} is not reachable from the root")]
    Unreachable { node: ChaosNodeId },
    #[error("chaos node {node} has invalid weight {weight}")]
    InvalidWeight { node: ChaosNodeId, weight: f64 },
    #[error("chaos node {node} has children but none with a positive weight")]
    NoPositiveWeight { node: ChaosNodeId },
    #[error("chaos node {node} has child weights that sum past f64::MAX")]
    WeightOverflow { node: ChaosNodeId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosActionTree {
    nodes: Vec<ChaosNode>,
    root: ChaosNodeId,
}

impl ChaosActionTree {
    /// Arena with a single root node.
    pub fn new(root: ChaosNode) -> Self {
        Self {
            nodes: vec![ChaosNode { parent: None, ..root }],
            root: ChaosNodeId(0),
        }
    }

    /// Takes a prebuilt arena as-is. Call [`ChaosActionTree::validate`] before use.
    pub fn from_parts(nodes: Vec<ChaosNode>, root: ChaosNodeId) -> Self {
        Self { nodes, root }
    }

    pub fn from_spec(spec: &ChaosTreeSpec) -> Self {
        let mut nodes: Vec<ChaosNode> = Vec::new();
        let mut stack: Vec<(&ChaosTreeSpec, Option<ChaosNodeId>)> = vec![(spec, None)];

        while let Some((current, parent)) = stack.pop() {
            let id = ChaosNodeId(nodes.len());
            nodes.push(ChaosNode {
                action: current.action.clone(),
                weight: current.weight,
                selection: current.selection,
                children: Vec::new(),
                parent,
            });
            if let Some(parent) = parent {
                nodes[parent.0].children.push(id);
            }
            for child in current.children.iter().rev() {
                stack.push((child, Some(id)));
            }
        }

        Self {
            nodes,
            root: ChaosNodeId(0),
        }
    }

    pub fn add_child(
        &mut self,
        parent: ChaosNodeId,
        node: ChaosNode,
    ) -> Result<ChaosNodeId, ChaosTreeError> {
        if parent.0 >= self.nodes.len() {
            return Err(ChaosTreeError::MissingNode {
                node: parent,
                missing: parent,
            });
        }
        let id = ChaosNodeId(self.nodes.len());
        self.nodes.push(ChaosNode {
            parent: Some(parent),
            children: Vec::new(),
            ..node
        });
        self.nodes[parent.0].children.push(id);
        Ok(id)
    }

    pub fn root(&self) -> ChaosNodeId {
        self.root
    }

    pub fn node(&self, id: ChaosNodeId) -> Option<&ChaosNode> {
        self.nodes.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Checks structure and weights. Leaves always validate.
    pub fn validate(&self) -> Result<(), ChaosTreeError> {
        if self.nodes.is_empty() {
            return Err(ChaosTreeError::Empty);
        }
        let root = self.lookup(self.root, self.root)?;
        if root.parent.is_some() {
            return Err(ChaosTreeError::ParentMismatch {
                node: self.root,
                recorded: root.parent,
                actual: None,
            });
        }

        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if visited[id.0] {
                return Err(ChaosTreeError::Revisited { node: id });
            }
            visited[id.0] = true;

            let node = &self.nodes[id.0];
            if node.is_leaf() {
                continue;
            }

            let mut has_positive = false;
            let mut total = 0.0_f64;
            for &child_id in &node.children {
                let child = self.lookup(id, child_id)?;
                if child.parent != Some(id) {
                    return Err(ChaosTreeError::ParentMismatch {
                        node: child_id,
                        recorded: child.parent,
                        actual: Some(id),
                    });
                }
                if !child.weight.is_finite() || child.weight < 0.0 {
                    return Err(ChaosTreeError::InvalidWeight {
                        node: child_id,
                        weight: child.weight,
                    });
                }
                has_positive |= child.weight > 0.0;
                total += child.weight;
                stack.push(child_id);
            }
            if !has_positive {
                return Err(ChaosTreeError::NoPositiveWeight { node: id });
            }
            if !total.is_finite() {
                return Err(ChaosTreeError::WeightOverflow { node: id });
            }
        }

        if let Some(index) = visited.iter().position(|seen| !seen) {
            return Err(ChaosTreeError::Unreachable {
                node: ChaosNodeId(index),
            });
        }
        Ok(())
    }

    /// Draws the actions for one invocation.
    ///
    /// Every reached node carrying an action contributes it, in traversal
    /// order. Results are reproducible for a seeded `rng`.
    pub fn next_chaos_actions<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<Vec<ChaosAction>, ChaosTreeError> {
        self.validate()?;

        let mut actions = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            if let Some(action) = &node.action {
                actions.push(action.clone());
            }
            if node.is_leaf() {
                continue;
            }
            match node.selection {
                SubTreeSelection::Exclusive => {
                    if let Some(child) = self.draw_child(node, rng) {
                        stack.push(child);
                    }
                }
                SubTreeSelection::Inclusive => {
                    for &child in node.children.iter().rev() {
                        if self.nodes[child.0].weight > 0.0 {
                            stack.push(child);
                        }
                    }
                }
            }
        }
        Ok(actions)
    }

    fn draw_child<R: Rng + ?Sized>(&self, node: &ChaosNode, rng: &mut R) -> Option<ChaosNodeId> {
        let weighted: Vec<(ChaosNodeId, f64)> = node
            .children
            .iter()
            .map(|&child| (child, self.nodes[child.0].weight))
            .filter(|(_, weight)| *weight > 0.0)
            .collect();
        let total: f64 = weighted.iter().map(|(_, weight)| weight).sum();
        if weighted.is_empty() || !total.is_finite() {
            return None;
        }

        let draw = rng.gen_range(0.0..total);
        let mut cumulative = 0.0;
        for &(child, weight) in &weighted {
            cumulative += weight;
            if draw < cumulative {
                return Some(child);
            }
        }
        // float rounding at the upper band edge
        weighted.last().map(|(child, _)| *child)
    }

    fn lookup(&self, from: ChaosNodeId, id: ChaosNodeId) -> Result<&ChaosNode, ChaosTreeError> {
        self.nodes.get(id.0).ok_or(ChaosTreeError::MissingNode {
            node: from,
            missing: id,
        })
    }
}
