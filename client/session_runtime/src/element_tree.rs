//! Immutable-update tree of UI nodes produced by script runs.
//!
//! Every node records the run that last produced or touched it. Updates copy
//! the path from the root to the changed node and share every other subtree,
//! so a snapshot handed to a consumer is never mutated afterwards.

use crate::error::TreeError;
use crate::protocol::{Block, Delta, Element};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum AppNode {
    Element(ElementNode),
    Block(BlockNode),
}

impl AppNode {
    pub fn script_run_id(&self) -> &str {
        match self {
            Self::Element(node) => &node.script_run_id,
            Self::Block(node) => &node.script_run_id,
        }
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Self::Element(node) => Some(&node.element),
            Self::Block(_) => None,
        }
    }

    pub fn as_block(&self) -> Option<&BlockNode> {
        match self {
            Self::Block(node) => Some(node),
            Self::Element(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementNode {
    pub element: Element,
    pub script_run_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockNode {
    /// `None` only for the tree root.
    pub block: Option<Block>,
    pub children: Vec<Arc<AppNode>>,
    pub script_run_id: String,
}

impl BlockNode {
    fn root() -> Self {
        Self {
            block: None,
            children: Vec::new(),
            script_run_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementTree {
    root: Arc<BlockNode>,
}

impl Default for ElementTree {
    fn default() -> Self {
        Self::empty()
    }
}

impl ElementTree {
    pub fn empty() -> Self {
        Self {
            root: Arc::new(BlockNode::root()),
        }
    }

    pub fn root(&self) -> &BlockNode {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Returns a new tree with `delta` applied at `path`. Every block on the
    /// way down is re-stamped with `run_id`.
    pub fn apply_delta(&self, path: &[u32], delta: &Delta, run_id: &str) -> Result<Self, TreeError> {
        let root = set_in(&self.root, path, path, delta, run_id)?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    /// Drops every node not produced by `run_id`. The root itself is kept.
    pub fn clear_stale_nodes(&self, run_id: &str) -> Self {
        let children = prune_children(&self.root.children, run_id);
        Self {
            root: Arc::new(BlockNode {
                block: None,
                children,
                script_run_id: self.root.script_run_id.clone(),
            }),
        }
    }

    pub fn get(&self, path: &[u32]) -> Option<&AppNode> {
        let (&first, rest) = path.split_first()?;
        let mut node = self.root.children.get(first as usize)?.as_ref();
        for &index in rest {
            node = node.as_block()?.children.get(index as usize)?.as_ref();
        }
        Some(node)
    }

    /// Depth-first list of every element in the tree.
    pub fn elements(&self) -> Vec<&Element> {
        let mut out = Vec::new();
        collect_elements(&self.root, &mut out);
        out
    }

    pub fn widget_ids(&self) -> HashSet<String> {
        self.elements()
            .into_iter()
            .filter_map(Element::widget_id)
            .map(str::to_string)
            .collect()
    }

    /// Number of nodes below the root.
    pub fn node_count(&self) -> usize {
        fn count(block: &BlockNode) -> usize {
            block
                .children
                .iter()
                .map(|child| match child.as_ref() {
                    AppNode::Element(_) => 1,
                    AppNode::Block(inner) => 1 + count(inner),
                })
                .sum()
        }
        count(&self.root)
    }
}

fn set_in(
    block: &BlockNode,
    full_path: &[u32],
    rest: &[u32],
    delta: &Delta,
    run_id: &str,
) -> Result<BlockNode, TreeError> {
    let (&index, tail) = rest.split_first().ok_or(TreeError::EmptyPath)?;
    let here = &full_path[..full_path.len() - tail.len()];
    let slot = index as usize;
    let len = block.children.len();

    if slot > len {
        return Err(TreeError::IndexOutOfBounds {
            path: here.to_vec(),
            index,
            len,
        });
    }

    let existing = block.children.get(slot).map(Arc::as_ref);
    let node = if tail.is_empty() {
        build_node(existing, delta, run_id, here)?
    } else {
        match existing {
            Some(AppNode::Block(child)) => {
                AppNode::Block(set_in(child, full_path, tail, delta, run_id)?)
            }
            Some(AppNode::Element(_)) => {
                return Err(TreeError::NotABlock {
                    path: here.to_vec(),
                });
            }
            None => {
                return Err(TreeError::MissingNode {
                    path: here.to_vec(),
                });
            }
        }
    };

    let mut children = block.children.clone();
    if slot == len {
        children.push(Arc::new(node));
    } else {
        children[slot] = Arc::new(node);
    }

    Ok(BlockNode {
        block: block.block.clone(),
        children,
        script_run_id: run_id.to_string(),
    })
}

fn build_node(
    existing: Option<&AppNode>,
    delta: &Delta,
    run_id: &str,
    path: &[u32],
) -> Result<AppNode, TreeError> {
    match delta {
        Delta::NewElement(element) => Ok(AppNode::Element(ElementNode {
            element: element.clone(),
            script_run_id: run_id.to_string(),
        })),
        Delta::AddBlock(block) => {
            // A block re-added with the same kind keeps its children so the
            // rerun can overwrite them in place.
            let children = match existing {
                Some(AppNode::Block(prev))
                    if prev.block.as_ref().map(|b| b.kind.as_str()) == Some(block.kind.as_str()) =>
                {
                    prev.children.clone()
                }
                _ => Vec::new(),
            };
            Ok(AppNode::Block(BlockNode {
                block: Some(block.clone()),
                children,
                script_run_id: run_id.to_string(),
            }))
        }
        Delta::AddRows(add) => {
            let mut element = match existing {
                Some(AppNode::Element(node)) => node.element.clone(),
                Some(AppNode::Block(_)) => {
                    return Err(TreeError::NotAnElement {
                        path: path.to_vec(),
                    });
                }
                None => {
                    return Err(TreeError::MissingNode {
                        path: path.to_vec(),
                    });
                }
            };
            let data = element
                .props
                .entry("data")
                .or_insert_with(|| Value::Array(Vec::new()));
            if !data.is_array() {
                *data = Value::Array(Vec::new());
            }
            if let Value::Array(rows) = data {
                rows.extend(add.rows.iter().cloned());
            }
            Ok(AppNode::Element(ElementNode {
                element,
                script_run_id: run_id.to_string(),
            }))
        }
    }
}

fn prune_children(children: &[Arc<AppNode>], run_id: &str) -> Vec<Arc<AppNode>> {
    children
        .iter()
        .filter(|child| child.script_run_id() == run_id)
        .map(|child| match child.as_ref() {
            AppNode::Element(_) => child.clone(),
            AppNode::Block(block) => Arc::new(AppNode::Block(BlockNode {
                block: block.block.clone(),
                children: prune_children(&block.children, run_id),
                script_run_id: block.script_run_id.clone(),
            })),
        })
        .collect()
}

fn collect_elements<'a>(block: &'a BlockNode, out: &mut Vec<&'a Element>) {
    for child in &block.children {
        match child.as_ref() {
            AppNode::Element(node) => out.push(&node.element),
            AppNode::Block(inner) => collect_elements(inner, out),
        }
    }
}
