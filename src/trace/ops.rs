// src/trace/ops.rs

use std::fmt;

/// The ONNX operators the tracer can emit, with the opset window in which
/// the form we emit is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpKind {
    Constant,
    Identity,
    Gather,
    Slice,
    Concat,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Sqrt,
    Erf,
    Relu,
    Sigmoid,
    MatMul,
    Transpose,
    Reshape,
    ReduceMean,
    Softmax,
}

impl OpKind {
    pub const ALL: [OpKind; 19] = [
        OpKind::Constant,
        OpKind::Identity,
        OpKind::Gather,
        OpKind::Slice,
        OpKind::Concat,
        OpKind::Add,
        OpKind::Sub,
        OpKind::Mul,
        OpKind::Div,
        OpKind::Pow,
        OpKind::Sqrt,
        OpKind::Erf,
        OpKind::Relu,
        OpKind::Sigmoid,
        OpKind::MatMul,
        OpKind::Transpose,
        OpKind::Reshape,
        OpKind::ReduceMean,
        OpKind::Softmax,
    ];

    pub fn op_type(self) -> &'static str {
        match self {
            OpKind::Constant => "Constant",
            OpKind::Identity => "Identity",
            OpKind::Gather => "Gather",
            OpKind::Slice => "Slice",
            OpKind::Concat => "Concat",
            OpKind::Add => "Add",
            OpKind::Sub => "Sub",
            OpKind::Mul => "Mul",
            OpKind::Div => "Div",
            OpKind::Pow => "Pow",
            OpKind::Sqrt => "Sqrt",
            OpKind::Erf => "Erf",
            OpKind::Relu => "Relu",
            OpKind::Sigmoid => "Sigmoid",
            OpKind::MatMul => "MatMul",
            OpKind::Transpose => "Transpose",
            OpKind::Reshape => "Reshape",
            OpKind::ReduceMean => "ReduceMean",
            OpKind::Softmax => "Softmax",
        }
    }

    pub fn from_op_type(op_type: &str) -> Option<Self> {
        OpKind::ALL.iter().copied().find(|op| op.op_type() == op_type)
    }

    /// First opset in which the emitted form of the operator exists.
    pub fn since_version(self) -> i64 {
        match self {
            OpKind::Constant | OpKind::Identity | OpKind::Gather | OpKind::Transpose => 1,
            OpKind::MatMul | OpKind::ReduceMean | OpKind::Softmax => 1,
            OpKind::Concat => 4,
            OpKind::Reshape => 5,
            OpKind::Sqrt | OpKind::Relu | OpKind::Sigmoid => 6,
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::Pow => 7,
            OpKind::Erf => 9,
            // starts/ends/axes as tensor inputs
            OpKind::Slice => 10,
        }
    }

    /// Last opset in which the emitted form is valid, if it was later replaced.
    pub fn last_version(self) -> Option<i64> {
        match self {
            // opset 18 moved `axes` from an attribute to an input
            OpKind::ReduceMean => Some(17),
            _ => None,
        }
    }

    pub fn available_in(self, opset: i64) -> bool {
        opset >= self.since_version() && self.last_version().map_or(true, |last| opset <= last)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op_type())
    }
}

/// IR version written alongside a given default-domain opset, following the
/// ONNX release that introduced that opset.
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        ..=8 => 3,
        9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        19..=20 => 9,
        _ => 10,
    }
}
