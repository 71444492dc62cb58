//! Task graph of a template version.
//!
//! Tasks form a DAG through their `parents`. The graph is stored as an arena
//! of nodes with index-based parent and ancestor sets, computed once when a
//! template is compiled and never mutated afterwards.

use std::collections::{BTreeSet, HashMap};

use super::template::{TaskTemplate, Template, TemplateError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    pub index: usize,
    pub api_name: String,
    pub parents: BTreeSet<usize>,
    pub ancestors: BTreeSet<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateGraph {
    nodes: Vec<TaskNode>,
    by_api_name: HashMap<String, usize>,
}

impl TemplateGraph {
    /// Build the graph. A task with no explicit parents depends on the task
    /// immediately before it; explicit parents must precede the task.
    pub fn build(tasks: &[TaskTemplate]) -> Result<Self, TemplateError> {
        let by_api_name: HashMap<String, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.api_name.clone(), i))
            .collect();

        let mut nodes: Vec<TaskNode> = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.iter().enumerate() {
            let mut parents = BTreeSet::new();
            if task.parents.is_empty() {
                if index > 0 {
                    parents.insert(index - 1);
                }
            } else {
                for parent in &task.parents {
                    let parent_index = *by_api_name.get(parent).ok_or_else(|| {
                        TemplateError::UnknownParent {
                            task: task.api_name.clone(),
                            parent: parent.clone(),
                        }
                    })?;
                    if parent_index >= index {
                        return Err(TemplateError::ParentNotEarlier {
                            task: task.api_name.clone(),
                            parent: parent.clone(),
                        });
                    }
                    parents.insert(parent_index);
                }
            }

            // Parents always precede the node, so their ancestor sets are final
            let mut ancestors = parents.clone();
            for parent in &parents {
                ancestors.extend(nodes[*parent].ancestors.iter().copied());
            }

            nodes.push(TaskNode {
                index,
                api_name: task.api_name.clone(),
                parents,
                ancestors,
            });
        }

        Ok(Self { nodes, by_api_name })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&TaskNode> {
        self.nodes.get(index)
    }

    pub fn index_of(&self, api_name: &str) -> Option<usize> {
        self.by_api_name.get(api_name).copied()
    }

    /// Whether `candidate` is a (transitive) parent of `task`.
    pub fn is_ancestor(&self, task: usize, candidate: usize) -> bool {
        self.nodes
            .get(task)
            .map(|node| node.ancestors.contains(&candidate))
            .unwrap_or(false)
    }

    pub fn parent_names(&self, index: usize) -> Vec<String> {
        self.names(self.nodes.get(index).map(|n| &n.parents))
    }

    pub fn ancestor_names(&self, index: usize) -> Vec<String> {
        self.names(self.nodes.get(index).map(|n| &n.ancestors))
    }

    /// Ancestors ordered from the closest (highest index) to the furthest.
    pub fn ancestors_nearest_first(&self, index: usize) -> Vec<usize> {
        self.nodes
            .get(index)
            .map(|n| n.ancestors.iter().rev().copied().collect())
            .unwrap_or_default()
    }

    fn names(&self, set: Option<&BTreeSet<usize>>) -> Vec<String> {
        set.map(|indices| {
            indices
                .iter()
                .map(|i| self.nodes[*i].api_name.clone())
                .collect()
        })
        .unwrap_or_default()
    }
}

/// A validated template together with its graph.
///
/// Shared as `Arc<CompiledTemplate>` per (template id, version).
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub template: Template,
    pub graph: TemplateGraph,
}

impl CompiledTemplate {
    pub fn task(&self, api_name: &str) -> Option<&TaskTemplate> {
        self.graph
            .index_of(api_name)
            .and_then(|i| self.template.tasks.get(i))
    }

    /// Template of the task at 1-based position `number`.
    pub fn task_by_number(&self, number: u32) -> Option<&TaskTemplate> {
        (number as usize)
            .checked_sub(1)
            .and_then(|i| self.template.tasks.get(i))
    }

    /// Whether task `ancestor` precedes task `task` in the graph.
    pub fn is_ancestor(&self, task: &str, ancestor: &str) -> bool {
        match (self.graph.index_of(task), self.graph.index_of(ancestor)) {
            (Some(t), Some(a)) => self.graph.is_ancestor(t, a),
            _ => false,
        }
    }
}
