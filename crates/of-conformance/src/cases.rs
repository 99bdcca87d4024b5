use of_api::{ApiError, OperatorDef, create_operator};
use of_dispatch::OpKind;
use proptest::strategy::Strategy;
use rand::rngs::StdRng;

use crate::checks::InputTensor;
use crate::generators::{sample_shape, shape_strategy, uniform_tensor};

/// Generation bounds and check targets for one elementwise operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementwiseCase {
    pub op: OpKind,
    pub dim_bounds: &'static [(usize, usize)],
    /// Added to `U[0, 1)` per input; keeps `ln` and division away from zero.
    pub input_shifts: &'static [f32],
    pub gradient_input: usize,
    pub gradient_outputs: &'static [usize],
}

pub const ELEMENTWISE_CASES: [ElementwiseCase; 4] = [
    ElementwiseCase {
        op: OpKind::Div,
        dim_bounds: &[(2, 10), (4, 6), (2, 3)],
        input_shifts: &[0.0, 5.0],
        gradient_input: 0,
        gradient_outputs: &[0],
    },
    ElementwiseCase {
        op: OpKind::Log,
        dim_bounds: &[(5, 6), (4, 6)],
        input_shifts: &[1.0],
        gradient_input: 0,
        gradient_outputs: &[0],
    },
    ElementwiseCase {
        op: OpKind::Sqr,
        dim_bounds: &[(5, 6), (4, 6)],
        input_shifts: &[0.0],
        gradient_input: 0,
        gradient_outputs: &[0],
    },
    ElementwiseCase {
        op: OpKind::Sigmoid,
        dim_bounds: &[(5, 6), (4, 6)],
        input_shifts: &[0.0],
        gradient_input: 0,
        gradient_outputs: &[0],
    },
];

impl ElementwiseCase {
    #[must_use]
    pub fn for_op(op: OpKind) -> &'static Self {
        match op {
            OpKind::Div => &ELEMENTWISE_CASES[0],
            OpKind::Log => &ELEMENTWISE_CASES[1],
            OpKind::Sqr => &ELEMENTWISE_CASES[2],
            OpKind::Sigmoid => &ELEMENTWISE_CASES[3],
        }
    }

    #[must_use]
    pub fn test_id(&self) -> String {
        format!("test_{}", self.op.name().to_ascii_lowercase())
    }

    pub fn shape_strategy(&self) -> impl Strategy<Value = Vec<usize>> + use<> {
        shape_strategy(self.dim_bounds)
    }

    pub fn sample_shape(&self, rng: &mut StdRng) -> Vec<usize> {
        sample_shape(rng, self.dim_bounds)
    }

    /// Every input shares `shape`; input `i` is `U[0, 1) + input_shifts[i]`.
    pub fn make_inputs(&self, shape: &[usize], rng: &mut StdRng) -> Vec<InputTensor> {
        self.input_shifts
            .iter()
            .map(|shift| uniform_tensor(rng, shape, *shift))
            .collect()
    }

    pub fn operator_def(&self) -> Result<OperatorDef, ApiError> {
        let inputs: &[&str] = match self.op.num_inputs() {
            2 => &["X", "Y"],
            _ => &["X"],
        };
        create_operator(self.op.name(), inputs, &["Z"])
    }

    #[must_use]
    pub fn reference(&self, inputs: &[InputTensor]) -> Vec<Vec<f32>> {
        reference_outputs(self.op, inputs)
    }
}

/// Ideal outputs computed in f64 and rounded once to f32.
#[must_use]
pub fn reference_outputs(op: OpKind, inputs: &[InputTensor]) -> Vec<Vec<f32>> {
    let Some(first) = inputs.first() else {
        return Vec::new();
    };
    let unary = |f: fn(f64) -> f64| -> Vec<Vec<f32>> {
        vec![
            first
                .values
                .iter()
                .map(|x| f(f64::from(*x)) as f32)
                .collect(),
        ]
    };
    match op {
        OpKind::Div => {
            let Some(second) = inputs.get(1) else {
                return Vec::new();
            };
            vec![
                first
                    .values
                    .iter()
                    .zip(&second.values)
                    .map(|(a, b)| (f64::from(*a) / f64::from(*b)) as f32)
                    .collect(),
            ]
        }
        OpKind::Log => unary(f64::ln),
        OpKind::Sqr => unary(|x| x * x),
        OpKind::Sigmoid => unary(|x| 1.0 / (1.0 + (-x).exp())),
    }
}
