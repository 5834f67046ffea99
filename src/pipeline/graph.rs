//! Element graph builder
//!
//! A [`Graph`] is an arena: it owns every stage it instantiated and releases
//! them in one place, in reverse instantiation order, whether the build
//! failed halfway or the graph is torn down later.

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::pipeline::descriptor::{StageDescriptor, Topology};
use crate::pipeline::error::BuildError;
use crate::runtime::{BusHandle, MediaRuntime, Stage, StageError, StageState};

/// One instantiated stage together with the descriptor it came from
pub struct StageInstance<S> {
    pub descriptor: StageDescriptor,
    stage: S,
}

pub struct Graph<S: Stage> {
    instances: Vec<StageInstance<S>>,
    edges: Vec<(usize, usize)>,
    /// Upstream before downstream
    order: Vec<usize>,
}

/// Checks names and links, returning edges as indices and a topological order
fn validate(
    descriptors: &[StageDescriptor],
    topology: &Topology,
) -> Result<(Vec<(usize, usize)>, Vec<usize>), BuildError> {
    if descriptors.is_empty() {
        return Err(BuildError::Empty);
    }

    let mut index = HashMap::with_capacity(descriptors.len());
    for (i, descriptor) in descriptors.iter().enumerate() {
        if index.insert(descriptor.name.as_str(), i).is_some() {
            return Err(BuildError::DuplicateName {
                name: descriptor.name.clone(),
            });
        }
    }

    let mut edges = Vec::new();
    for (from, to) in topology.links(descriptors) {
        let resolve = |name: &str| {
            index.get(name).copied().ok_or_else(|| BuildError::UnknownStage {
                name: name.to_string(),
            })
        };
        let (a, b) = (resolve(from)?, resolve(to)?);
        if a == b {
            return Err(BuildError::Cycle {
                name: from.to_string(),
            });
        }
        if !edges.contains(&(a, b)) {
            edges.push((a, b));
        }
    }

    // Directed reachability from the first stage
    let mut seen = vec![false; descriptors.len()];
    let mut queue = VecDeque::from([0]);
    seen[0] = true;
    while let Some(node) = queue.pop_front() {
        for &(a, b) in &edges {
            if a == node && !seen[b] {
                seen[b] = true;
                queue.push_back(b);
            }
        }
    }
    if let Some(i) = seen.iter().position(|reached| !reached) {
        return Err(BuildError::Unreachable {
            name: descriptors[i].name.clone(),
        });
    }

    // Kahn's algorithm, stable on list order
    let mut indegree = vec![0usize; descriptors.len()];
    for &(_, b) in &edges {
        indegree[b] += 1;
    }
    let mut ready: VecDeque<usize> = (0..descriptors.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(descriptors.len());
    while let Some(node) = ready.pop_front() {
        order.push(node);
        for &(a, b) in &edges {
            if a == node {
                indegree[b] -= 1;
                if indegree[b] == 0 {
                    ready.push_back(b);
                }
            }
        }
    }
    if order.len() < descriptors.len() {
        let placed: HashSet<usize> = order.iter().copied().collect();
        let stuck = (0..descriptors.len()).find(|i| !placed.contains(i)).unwrap_or(0);
        return Err(BuildError::Cycle {
            name: descriptors[stuck].name.clone(),
        });
    }

    Ok((edges, order))
}

/// Mutable references to two distinct elements of a slice
fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert_ne!(a, b, "cannot borrow the same stage twice");
    if a < b {
        let (left, right) = items.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = items.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

impl<S: Stage> Graph<S> {
    /// Validate, instantiate and link `descriptors`
    ///
    /// On error every stage instantiated so far has been released.
    pub fn build<R>(
        runtime: &R,
        descriptors: &[StageDescriptor],
        topology: &Topology,
        bus: BusHandle,
    ) -> Result<Self, BuildError>
    where
        R: MediaRuntime<Stage = S>,
    {
        let (edges, order) = validate(descriptors, topology)?;

        let mut graph = Graph {
            instances: Vec::with_capacity(descriptors.len()),
            edges: Vec::new(),
            order,
        };

        for descriptor in descriptors {
            let stage = runtime
                .create_stage(descriptor, bus.clone())
                .map_err(|e| match e {
                    StageError::DeviceBusy(device) => BuildError::DeviceBusy { device },
                    other => BuildError::StageCreationFailed {
                        name: descriptor.name.clone(),
                        reason: other.to_string(),
                    },
                })?;
            debug!("instantiated {} ({})", descriptor.name, descriptor.kind);
            graph.instances.push(StageInstance {
                descriptor: descriptor.clone(),
                stage,
            });
        }

        for &(a, b) in &edges {
            let (up, down) = pair_mut(&mut graph.instances, a, b);
            runtime
                .link(&mut up.stage, &mut down.stage)
                .map_err(|e| BuildError::LinkFailed {
                    from: up.descriptor.name.clone(),
                    to: down.descriptor.name.clone(),
                    reason: e.to_string(),
                })?;
        }
        graph.edges = edges;

        info!(
            "built graph: {}",
            graph
                .instances
                .iter()
                .map(|i| i.descriptor.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.instances.iter().map(|i| &i.descriptor)
    }

    pub fn descriptor(&self, name: &str) -> Option<&StageDescriptor> {
        self.descriptors().find(|d| d.name == name)
    }

    /// Links as `(from, to)` stage names
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.edges
            .iter()
            .map(|&(a, b)| {
                (
                    self.instances[a].descriptor.name.as_str(),
                    self.instances[b].descriptor.name.as_str(),
                )
            })
            .collect()
    }

    /// Indices of display sink stages
    pub fn display_sinks(&self) -> Vec<usize> {
        self.instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.stage.is_display_sink())
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn stage_mut(&mut self, idx: usize) -> &mut S {
        &mut self.instances[idx].stage
    }

    /// Command every stage to `target`. Raising walks downstream-first so
    /// sinks are ready before data arrives; lowering walks upstream-first so
    /// sources stop feeding first. Stops at the first refusal.
    pub fn command(&mut self, target: StageState, raising: bool) -> Result<(), (String, StageError)> {
        let order: Vec<usize> = if raising {
            self.order.iter().rev().copied().collect()
        } else {
            self.order.clone()
        };
        for idx in order {
            let instance = &mut self.instances[idx];
            instance
                .stage
                .set_state(target)
                .map_err(|e| (instance.descriptor.name.clone(), e))?;
        }
        Ok(())
    }

    /// Command every stage to `target`, logging instead of stopping on
    /// refusals. Used for rollback and forced stops.
    pub fn force(&mut self, target: StageState, raising: bool) {
        let order: Vec<usize> = if raising {
            self.order.iter().rev().copied().collect()
        } else {
            self.order.clone()
        };
        for idx in order {
            let instance = &mut self.instances[idx];
            if let Err(e) = instance.stage.set_state(target) {
                warn!("{}: could not return to {}: {}", instance.descriptor.name, target, e);
            }
        }
    }

    /// Name of the first stage (in list order) not yet in `target`
    pub fn unsettled(&self, target: StageState) -> Option<&str> {
        self.instances
            .iter()
            .find(|i| i.stage.current_state() != target)
            .map(|i| i.descriptor.name.as_str())
    }

    /// Release every stage in reverse instantiation order. Idempotent.
    pub fn release(&mut self) {
        while let Some(mut instance) = self.instances.pop() {
            instance.stage.release();
            debug!("released {}", instance.descriptor.name);
        }
        self.edges.clear();
        self.order.clear();
    }
}

impl<S: Stage> Drop for Graph<S> {
    fn drop(&mut self) {
        self.release();
    }
}
