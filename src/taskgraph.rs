//! Minimal deterministic task graph wiring the per-step pipeline.
//!
//! Nodes are registered once with their dependencies declared up front;
//! registration order must already respect them (asserted), so execution is
//! a plain in-order sweep. Each node is a boxed closure over the per-world
//! [`StepContext`]. Worlds are independent: a [`Simulation`] steps all of
//! them in parallel, running the node list sequentially within each world.

use rayon::prelude::*;

use crate::physics::PhysicsWorld;
use crate::render::RenderState;

/// Opaque handle to a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

/// Everything one world's step touches.
pub struct StepContext<'a> {
    pub world: &'a mut hecs::World,
    pub physics: &'a mut PhysicsWorld,
    pub render: Option<&'a mut RenderState>,
}

type NodeFn = Box<dyn Fn(&mut StepContext) + Send + Sync>;

struct Node {
    label: &'static str,
    run: NodeFn,
}

/// Collects nodes and dependency declarations.
#[derive(Default)]
pub struct TaskGraphBuilder {
    nodes: Vec<Node>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node after its dependencies. Dependencies are declared,
    /// not executed; they only pin the ordering contract.
    pub fn add_node(
        &mut self,
        label: &'static str,
        deps: &[NodeId],
        run: impl Fn(&mut StepContext) + Send + Sync + 'static,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        for dep in deps {
            assert!(
                dep.0 < id.0,
                "node '{label}' registered before its dependency"
            );
        }
        self.nodes.push(Node {
            label,
            run: Box::new(run),
        });
        id
    }

    pub fn build(self) -> TaskGraph {
        TaskGraph { nodes: self.nodes }
    }
}

/// An immutable node list executed in topological (registration) order.
pub struct TaskGraph {
    nodes: Vec<Node>,
}

impl TaskGraph {
    /// Run every node against one world's context.
    pub fn execute(&self, ctx: &mut StepContext) {
        for node in &self.nodes {
            tracing::trace!(node = node.label, "task-graph node");
            (node.run)(ctx);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One simulated world: ECS storage, physics state, optional render state.
pub struct WorldContext {
    pub world: hecs::World,
    pub physics: PhysicsWorld,
    pub render: Option<RenderState>,
}

/// A batch of independent worlds stepped in parallel through one graph.
pub struct Simulation {
    pub worlds: Vec<WorldContext>,
    graph: TaskGraph,
}

impl Simulation {
    pub fn new(graph: TaskGraph) -> Self {
        Self {
            worlds: Vec::new(),
            graph,
        }
    }

    pub fn add_world(&mut self, world: WorldContext) -> usize {
        self.worlds.push(world);
        self.worlds.len() - 1
    }

    /// Advance every world one step. Worlds run in parallel on the rayon
    /// pool; within one world the graph nodes run in order.
    pub fn step(&mut self) {
        let graph = &self.graph;
        self.worlds.par_iter_mut().for_each(|ctx| {
            let mut step = StepContext {
                world: &mut ctx.world,
                physics: &mut ctx.physics,
                render: ctx.render.as_mut(),
            };
            graph.execute(&mut step);
        });
    }
}
