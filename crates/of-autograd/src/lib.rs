#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use of_core::{DenseTensor, DenseTensorError, Device, ExecutionMode};
use of_dispatch::{
    DispatchDecision, DispatchError, OpKind, dispatch_backward, dispatch_forward,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeOp {
    Leaf,
    Unary { op: OpKind, input: NodeId },
    Binary { op: OpKind, lhs: NodeId, rhs: NodeId },
}

impl NodeOp {
    fn inputs(self) -> ([Option<NodeId>; 2], Option<OpKind>) {
        match self {
            Self::Leaf => ([None, None], None),
            Self::Unary { op, input } => ([Some(input), None], Some(op)),
            Self::Binary { op, lhs, rhs } => ([Some(lhs), Some(rhs)], Some(op)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Node {
    tensor: DenseTensor,
    requires_grad: bool,
    mode: ExecutionMode,
    op: NodeOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerTelemetry {
    pub execution_order: Vec<NodeId>,
    pub queue_pushes: usize,
    pub queue_pops: usize,
    pub max_queue_len: usize,
    pub dependency_snapshot: Vec<usize>,
    pub hardened_fallback_used: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyTask {
    node: NodeId,
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node.0.cmp(&other.node.0)
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct ReadyQueue {
    heap: BinaryHeap<ReadyTask>,
    pushes: usize,
    pops: usize,
    max_len: usize,
}

impl ReadyQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            pushes: 0,
            pops: 0,
            max_len: 0,
        }
    }

    fn push(&mut self, node: NodeId) {
        self.heap.push(ReadyTask { node });
        self.pushes += 1;
        self.max_len = self.max_len.max(self.heap.len());
    }

    fn pop(&mut self) -> Option<NodeId> {
        let next = self.heap.pop().map(|task| task.node);
        if next.is_some() {
            self.pops += 1;
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationEvent {
    pub op: OpKind,
    pub inputs: Vec<NodeId>,
    pub out: NodeId,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackwardStep {
    pub node: NodeId,
    pub incoming_grad: Vec<f32>,
    pub rule: &'static str,
    pub decision: Option<DispatchDecision>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorBackwardReport {
    gradients: Vec<Option<Vec<f32>>>,
    pub steps: Vec<BackwardStep>,
    pub telemetry: SchedulerTelemetry,
}

impl TensorBackwardReport {
    #[must_use]
    pub fn gradient(&self, node: NodeId) -> Option<&[f32]> {
        self.gradients.get(node.0).and_then(|grad| grad.as_deref())
    }

    #[must_use]
    pub fn gradients(&self) -> &[Option<Vec<f32>>] {
        &self.gradients
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutogradError {
    UnknownNode(NodeId),
    Dispatch(DispatchError),
    Tensor(DenseTensorError),
    ArityMismatch {
        op: OpKind,
        expected: usize,
        actual: usize,
    },
    SeedShapeMismatch {
        expected: usize,
        actual: usize,
    },
    DependencyUnderflow {
        node: NodeId,
    },
}

impl fmt::Display for AutogradError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(node) => write!(f, "unknown node id {}", node.0),
            Self::Dispatch(error) => write!(f, "dispatch failure: {error}"),
            Self::Tensor(error) => write!(f, "tensor failure: {error}"),
            Self::ArityMismatch {
                op,
                expected,
                actual,
            } => write!(
                f,
                "operator {op} expects {expected} input nodes, got {actual}"
            ),
            Self::SeedShapeMismatch { expected, actual } => write!(
                f,
                "backward seed length mismatch: expected={expected}, actual={actual}"
            ),
            Self::DependencyUnderflow { node } => {
                write!(f, "dependency scheduler underflow at node {}", node.0)
            }
        }
    }
}

impl std::error::Error for AutogradError {}

impl From<DispatchError> for AutogradError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<DenseTensorError> for AutogradError {
    fn from(value: DenseTensorError) -> Self {
        Self::Tensor(value)
    }
}

const fn backward_rule(op: OpKind) -> &'static str {
    match op {
        OpKind::Div => "d(a/b)/da=1/b; d(a/b)/db=-(a/b)/b",
        OpKind::Log => "d(ln x)/dx=1/x",
        OpKind::Sqr => "d(x^2)/dx=2x",
        OpKind::Sigmoid => "d(sigmoid x)/dx=y(1-y)",
    }
}

fn accumulate(slot: &mut Option<Vec<f32>>, values: &[f32]) {
    match slot {
        Some(existing) => {
            for (acc, value) in existing.iter_mut().zip(values) {
                *acc += *value;
            }
        }
        None => *slot = Some(values.to_vec()),
    }
}

/// Records elementwise operator applications over dense tensors and replays
/// them in reverse to produce per-leaf gradients.
#[derive(Debug, Clone, Default)]
pub struct TensorTape {
    nodes: Vec<Node>,
}

impl TensorTape {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf(
        &mut self,
        values: Vec<f32>,
        shape: Vec<usize>,
        device: Device,
        requires_grad: bool,
    ) -> Result<NodeId, AutogradError> {
        let tensor = DenseTensor::from_contiguous_values(values, shape, device)?;
        Ok(self.leaf_tensor(tensor, requires_grad))
    }

    pub fn leaf_tensor(&mut self, tensor: DenseTensor, requires_grad: bool) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            tensor,
            requires_grad,
            mode: ExecutionMode::Strict,
            op: NodeOp::Leaf,
        });
        id
    }

    pub fn tensor(&self, node: NodeId) -> Result<&DenseTensor, AutogradError> {
        Ok(&self.node(node)?.tensor)
    }

    pub fn values(&self, node: NodeId) -> Result<&[f32], AutogradError> {
        Ok(self.node(node)?.tensor.values())
    }

    pub fn requires_grad(&self, node: NodeId) -> Result<bool, AutogradError> {
        Ok(self.node(node)?.requires_grad)
    }

    pub fn apply(
        &mut self,
        op: OpKind,
        inputs: &[NodeId],
        mode: ExecutionMode,
    ) -> Result<(NodeId, OperationEvent), AutogradError> {
        if inputs.len() != op.num_inputs() {
            return Err(AutogradError::ArityMismatch {
                op,
                expected: op.num_inputs(),
                actual: inputs.len(),
            });
        }

        let (requires_grad, outcome) = {
            let nodes = inputs
                .iter()
                .map(|id| self.node(*id))
                .collect::<Result<Vec<_>, _>>()?;
            let requires_grad = nodes.iter().any(|node| node.requires_grad);
            let tensors = nodes.iter().map(|node| &node.tensor).collect::<Vec<_>>();
            let outcome = dispatch_forward(op, mode, tensors.as_slice(), requires_grad)?;
            (requires_grad, outcome)
        };

        let tensor = outcome
            .tensors
            .into_iter()
            .next()
            .ok_or(AutogradError::ArityMismatch {
                op,
                expected: op.num_outputs(),
                actual: 0,
            })?;

        let out = NodeId(self.nodes.len());
        let node_op = match inputs {
            [input] => NodeOp::Unary { op, input: *input },
            [lhs, rhs] => NodeOp::Binary {
                op,
                lhs: *lhs,
                rhs: *rhs,
            },
            _ => {
                return Err(AutogradError::ArityMismatch {
                    op,
                    expected: op.num_inputs(),
                    actual: inputs.len(),
                });
            }
        };
        self.nodes.push(Node {
            tensor,
            requires_grad,
            mode,
            op: node_op,
        });

        Ok((
            out,
            OperationEvent {
                op,
                inputs: inputs.to_vec(),
                out,
                decision: outcome.decision,
            },
        ))
    }

    /// Backpropagates from `root` with an all-ones seed.
    pub fn backward(&self, root: NodeId) -> Result<TensorBackwardReport, AutogradError> {
        let numel = self.node(root)?.tensor.numel();
        self.backward_with_seed(root, &vec![1.0; numel])
    }

    pub fn backward_with_seed(
        &self,
        root: NodeId,
        seed: &[f32],
    ) -> Result<TensorBackwardReport, AutogradError> {
        let root_numel = self.node(root)?.tensor.numel();
        if seed.len() != root_numel {
            return Err(AutogradError::SeedShapeMismatch {
                expected: root_numel,
                actual: seed.len(),
            });
        }

        let reachable = self.compute_reachable(root)?;
        let mut pending = self.compute_dependencies(&reachable)?;

        let mut grads: Vec<Option<Vec<f32>>> = vec![None; self.nodes.len()];
        grads[root.0] = Some(seed.to_vec());

        let mut queue = ReadyQueue::with_capacity(self.nodes.len().max(1));
        queue.push(root);

        let mut steps = Vec::with_capacity(self.nodes.len());
        let mut execution_order = Vec::with_capacity(self.nodes.len());
        let mut hardened_fallback_used = false;

        while let Some(node_id) = queue.pop() {
            execution_order.push(node_id);
            let node = &self.nodes[node_id.0];
            let ([first, second], op) = node.op.inputs();

            let Some(op) = op else {
                if node.requires_grad {
                    steps.push(BackwardStep {
                        node: node_id,
                        incoming_grad: grads[node_id.0].clone().unwrap_or_default(),
                        rule: "leaf",
                        decision: None,
                    });
                }
                continue;
            };

            let children = [first, second].into_iter().flatten().collect::<Vec<_>>();
            if node.requires_grad {
                let incoming = grads[node_id.0]
                    .clone()
                    .unwrap_or_else(|| vec![0.0; node.tensor.numel()]);
                let grad_tensor = node.tensor.with_values(incoming.clone())?;
                let input_tensors = children
                    .iter()
                    .map(|child| &self.nodes[child.0].tensor)
                    .collect::<Vec<_>>();
                let outcome = dispatch_backward(
                    op,
                    node.mode,
                    &grad_tensor,
                    input_tensors.as_slice(),
                    &node.tensor,
                )?;
                hardened_fallback_used |= outcome.decision.fallback_used;

                for (child, grad) in children.iter().zip(outcome.tensors.iter()) {
                    accumulate(&mut grads[child.0], grad.values());
                }

                steps.push(BackwardStep {
                    node: node_id,
                    incoming_grad: incoming,
                    rule: backward_rule(op),
                    decision: Some(outcome.decision),
                });
            }

            for child in children {
                Self::complete_dependency(&mut pending, child, &mut queue)?;
            }
        }

        let gradients = grads
            .into_iter()
            .enumerate()
            .map(|(idx, grad)| {
                if self.nodes[idx].requires_grad {
                    grad
                } else {
                    None
                }
            })
            .collect();

        let telemetry = SchedulerTelemetry {
            execution_order,
            queue_pushes: queue.pushes,
            queue_pops: queue.pops,
            max_queue_len: queue.max_len,
            dependency_snapshot: pending,
            hardened_fallback_used,
        };

        Ok(TensorBackwardReport {
            gradients,
            steps,
            telemetry,
        })
    }

    fn compute_reachable(&self, root: NodeId) -> Result<Vec<bool>, AutogradError> {
        let mut reachable = vec![false; self.nodes.len()];
        let mut stack = vec![root];

        while let Some(node) = stack.pop() {
            if node.0 >= self.nodes.len() {
                return Err(AutogradError::UnknownNode(node));
            }
            if reachable[node.0] {
                continue;
            }
            reachable[node.0] = true;

            let ([first, second], _) = self.nodes[node.0].op.inputs();
            stack.extend([first, second].into_iter().flatten());
        }

        Ok(reachable)
    }

    fn compute_dependencies(&self, reachable: &[bool]) -> Result<Vec<usize>, AutogradError> {
        if reachable.len() != self.nodes.len() {
            return Err(AutogradError::DependencyUnderflow { node: NodeId(0) });
        }

        let mut pending = vec![0usize; self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            if !reachable[idx] {
                continue;
            }
            let ([first, second], _) = node.op.inputs();
            for child in [first, second].into_iter().flatten() {
                pending[child.0] = pending[child.0].saturating_add(1);
            }
        }

        Ok(pending)
    }

    fn complete_dependency(
        pending: &mut [usize],
        node: NodeId,
        queue: &mut ReadyQueue,
    ) -> Result<(), AutogradError> {
        if pending[node.0] == 0 {
            return Err(AutogradError::DependencyUnderflow { node });
        }
        pending[node.0] -= 1;
        if pending[node.0] == 0 {
            queue.push(node);
        }
        Ok(())
    }

    fn node(&self, id: NodeId) -> Result<&Node, AutogradError> {
        self.nodes.get(id.0).ok_or(AutogradError::UnknownNode(id))
    }
}
