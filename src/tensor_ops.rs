// src/tensor_ops.rs
//
// Dense kernels behind the eager forward pass and the tracer. Semantics
// follow the ONNX operator definitions for the subset this crate emits.

use ndarray::{concatenate, s, Array3, ArrayD, ArrayViewD, Axis, IxDyn, Slice, Zip};

use crate::tensor::TensorError;

pub fn normalize_axis(axis: i64, rank: usize) -> Result<usize, TensorError> {
    let r = rank as i64;
    let resolved = if axis < 0 { axis + r } else { axis };
    if resolved < 0 || resolved >= r {
        return Err(TensorError::UnsupportedAxis(format!("axis {} out of range for rank {}", axis, rank)));
    }
    Ok(resolved as usize)
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>, TensorError> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(TensorError::IncompatibleShapes(format!(
                    "cannot broadcast {:?} with {:?}",
                    a, b
                )))
            }
        };
    }
    Ok(out)
}

pub fn binary<F>(a: &ArrayD<f32>, b: &ArrayD<f32>, f: F) -> Result<ArrayD<f32>, TensorError>
where
    F: Fn(f32, f32) -> f32,
{
    let shape = broadcast_shape(a.shape(), b.shape())?;
    let av = a
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| TensorError::IncompatibleShapes(format!("{:?} -> {:?}", a.shape(), shape)))?;
    let bv = b
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| TensorError::IncompatibleShapes(format!("{:?} -> {:?}", b.shape(), shape)))?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

pub fn add(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, TensorError> {
    binary(a, b, |x, y| x + y)
}

pub fn sub(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, TensorError> {
    binary(a, b, |x, y| x - y)
}

pub fn mul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, TensorError> {
    binary(a, b, |x, y| x * y)
}

pub fn div(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, TensorError> {
    binary(a, b, |x, y| x / y)
}

pub fn pow(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, TensorError> {
    binary(a, b, |x, y| if y == 2.0 { x * x } else { x.powf(y) })
}

pub fn sqrt(a: &ArrayD<f32>) -> ArrayD<f32> {
    a.mapv(f32::sqrt)
}

pub fn erf(a: &ArrayD<f32>) -> ArrayD<f32> {
    a.mapv(libm::erff)
}

pub fn relu(a: &ArrayD<f32>) -> ArrayD<f32> {
    a.mapv(|x| x.max(0.0))
}

pub fn sigmoid(a: &ArrayD<f32>) -> ArrayD<f32> {
    a.mapv(|x| 1.0 / (1.0 + (-x).exp()))
}

/// Batched matrix product with numpy broadcasting over the leading dimensions.
pub fn matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, TensorError> {
    let (ra, rb) = (a.ndim(), b.ndim());
    if ra < 2 || rb < 2 {
        return Err(TensorError::InvalidDimension(format!(
            "matmul expects rank >= 2 operands, got {:?} and {:?}",
            a.shape(), b.shape()
        )));
    }
    let (m, k) = (a.shape()[ra - 2], a.shape()[ra - 1]);
    let (k2, n) = (b.shape()[rb - 2], b.shape()[rb - 1]);
    if k != k2 {
        return Err(TensorError::IncompatibleShapes(format!(
            "matmul inner dimensions differ: {:?} x {:?}",
            a.shape(), b.shape()
        )));
    }
    let batch = broadcast_shape(&a.shape()[..ra - 2], &b.shape()[..rb - 2])?;
    let batch_len: usize = batch.iter().product();

    let mut a_target = batch.clone();
    a_target.extend_from_slice(&[m, k]);
    let mut b_target = batch.clone();
    b_target.extend_from_slice(&[k, n]);

    let a3 = expand_to_3d(a, &a_target, batch_len, m, k)?;
    let b3 = expand_to_3d(b, &b_target, batch_len, k, n)?;

    let mut out = Array3::<f32>::zeros((batch_len, m, n));
    for i in 0..batch_len {
        let prod = a3.index_axis(Axis(0), i).dot(&b3.index_axis(Axis(0), i));
        out.slice_mut(s![i, .., ..]).assign(&prod);
    }

    let mut out_shape = batch;
    out_shape.extend_from_slice(&[m, n]);
    out.into_dyn()
        .into_shape(IxDyn(&out_shape))
        .map_err(|e| TensorError::ShapeMismatch(e.to_string()))
}

fn expand_to_3d(
    x: &ArrayD<f32>,
    target: &[usize],
    batch_len: usize,
    rows: usize,
    cols: usize,
) -> Result<Array3<f32>, TensorError> {
    let view = x
        .broadcast(IxDyn(target))
        .ok_or_else(|| TensorError::IncompatibleShapes(format!("{:?} -> {:?}", x.shape(), target)))?;
    view.as_standard_layout()
        .into_owned()
        .into_shape((batch_len, rows, cols))
        .map_err(|e| TensorError::ShapeMismatch(e.to_string()))
}

pub fn transpose<T: Clone>(a: &ArrayD<T>, perm: &[usize]) -> Result<ArrayD<T>, TensorError> {
    let mut seen = vec![false; a.ndim()];
    if perm.len() != a.ndim() {
        return Err(TensorError::InvalidDimension(format!(
            "permutation {:?} does not match rank {}",
            perm,
            a.ndim()
        )));
    }
    for &p in perm {
        if p >= a.ndim() || seen[p] {
            return Err(TensorError::InvalidDimension(format!("invalid permutation {:?}", perm)));
        }
        seen[p] = true;
    }
    Ok(a.view()
        .permuted_axes(IxDyn(perm))
        .as_standard_layout()
        .into_owned())
}

/// Resolves an ONNX reshape target (`0` copies the input dim, one `-1` is inferred).
pub fn resolve_reshape(input: &[usize], target: &[i64]) -> Result<Vec<usize>, TensorError> {
    let total: usize = input.iter().product();
    let mut dims = Vec::with_capacity(target.len());
    let mut infer_at = None;
    for (i, &t) in target.iter().enumerate() {
        match t {
            -1 => {
                if infer_at.replace(i).is_some() {
                    return Err(TensorError::InvalidDimension(format!("more than one -1 in {:?}", target)));
                }
                dims.push(1);
            }
            0 => {
                let d = *input.get(i).ok_or_else(|| {
                    TensorError::InvalidDimension(format!("0 at index {} beyond input rank {}", i, input.len()))
                })?;
                dims.push(d);
            }
            t if t > 0 => dims.push(t as usize),
            t => return Err(TensorError::InvalidDimension(format!("negative dimension {}", t))),
        }
    }
    if let Some(i) = infer_at {
        let known: usize = dims.iter().product();
        if known == 0 || total % known != 0 {
            return Err(TensorError::ShapeMismatch(format!(
                "cannot infer -1 reshaping {:?} to {:?}",
                input, target
            )));
        }
        dims[i] = total / known;
    }
    if dims.iter().product::<usize>() != total {
        return Err(TensorError::ShapeMismatch(format!("cannot reshape {:?} to {:?}", input, target)));
    }
    Ok(dims)
}

pub fn reshape<T: Clone>(a: &ArrayD<T>, target: &[i64]) -> Result<ArrayD<T>, TensorError> {
    let dims = resolve_reshape(a.shape(), target)?;
    a.as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(&dims))
        .map_err(|e| TensorError::ShapeMismatch(e.to_string()))
}

pub fn gather<T: Clone>(data: &ArrayD<T>, indices: &ArrayD<i64>, axis: i64) -> Result<ArrayD<T>, TensorError> {
    let axis = normalize_axis(axis, data.ndim())?;
    let dim = data.shape()[axis] as i64;
    let mut flat = Vec::with_capacity(indices.len());
    for &idx in indices.iter() {
        let resolved = if idx < 0 { idx + dim } else { idx };
        if resolved < 0 || resolved >= dim {
            return Err(TensorError::OutOfBounds(format!(
                "index {} out of range for axis {} with size {}",
                idx, axis, dim
            )));
        }
        flat.push(resolved as usize);
    }
    let selected = data.select(Axis(axis), &flat);

    let mut out_shape: Vec<usize> = data.shape()[..axis].to_vec();
    out_shape.extend_from_slice(indices.shape());
    out_shape.extend_from_slice(&data.shape()[axis + 1..]);
    selected
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(&out_shape))
        .map_err(|e| TensorError::ShapeMismatch(e.to_string()))
}

/// ONNX `Slice` with unit steps. Out-of-range bounds are clamped.
pub fn slice<T: Clone>(a: &ArrayD<T>, starts: &[i64], ends: &[i64], axes: &[i64]) -> Result<ArrayD<T>, TensorError> {
    if starts.len() != ends.len() || starts.len() != axes.len() {
        return Err(TensorError::InvalidDimension(format!(
            "slice starts/ends/axes lengths differ: {} {} {}",
            starts.len(),
            ends.len(),
            axes.len()
        )));
    }
    let mut view: ArrayViewD<T> = a.view();
    for ((&start, &end), &axis) in starts.iter().zip(ends).zip(axes) {
        let ax = normalize_axis(axis, a.ndim())?;
        let dim = a.shape()[ax] as i64;
        let clamp = |v: i64| -> i64 {
            let v = if v < 0 { v.saturating_add(dim) } else { v };
            v.clamp(0, dim)
        };
        let (s0, e0) = (clamp(start), clamp(end));
        let e0 = e0.max(s0);
        view.slice_axis_inplace(Axis(ax), Slice::from((s0 as usize)..(e0 as usize)));
    }
    Ok(view.to_owned())
}

pub fn concat<T: Clone>(arrays: &[&ArrayD<T>], axis: i64) -> Result<ArrayD<T>, TensorError> {
    let first = arrays
        .first()
        .ok_or_else(|| TensorError::InvalidDimension("concat of zero tensors".to_string()))?;
    let ax = normalize_axis(axis, first.ndim())?;
    for (i, t) in arrays.iter().enumerate() {
        if t.ndim() != first.ndim() {
            return Err(TensorError::IncompatibleShapes(format!(
                "tensor {} has rank {}, expected {}",
                i,
                t.ndim(),
                first.ndim()
            )));
        }
        for d in 0..t.ndim() {
            if d != ax && t.shape()[d] != first.shape()[d] {
                return Err(TensorError::IncompatibleShapes(format!(
                    "dimension {} mismatch: {} vs {} (tensor {})",
                    d,
                    first.shape()[d],
                    t.shape()[d],
                    i
                )));
            }
        }
    }
    let views: Vec<ArrayViewD<T>> = arrays.iter().map(|a| a.view()).collect();
    concatenate(Axis(ax), &views).map_err(|e| TensorError::ShapeMismatch(e.to_string()))
}

pub fn reduce_mean(a: &ArrayD<f32>, axes: &[i64], keepdims: bool) -> Result<ArrayD<f32>, TensorError> {
    let mut resolved = axes
        .iter()
        .map(|&ax| normalize_axis(ax, a.ndim()))
        .collect::<Result<Vec<_>, _>>()?;
    resolved.sort_unstable_by(|x, y| y.cmp(x));
    resolved.dedup();

    let mut out = a.clone();
    for ax in resolved {
        out = out
            .mean_axis(Axis(ax))
            .ok_or_else(|| TensorError::InvalidDimension(format!("mean over empty axis {}", ax)))?;
        if keepdims {
            out = out.insert_axis(Axis(ax));
        }
    }
    Ok(out)
}

/// Softmax along a single axis.
pub fn softmax(a: &ArrayD<f32>, axis: i64) -> Result<ArrayD<f32>, TensorError> {
    let ax = Axis(normalize_axis(axis, a.ndim())?);
    let max = a.fold_axis(ax, f32::NEG_INFINITY, |&m, &v| m.max(v)).insert_axis(ax);
    let exp = sub(a, &max)?.mapv(f32::exp);
    let sum = exp.sum_axis(ax).insert_axis(ax);
    div(&exp, &sum)
}
