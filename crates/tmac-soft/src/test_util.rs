//! Plain-`f32` reference helpers shared by the unit tests.

use candle_core::Tensor;
use candle_nn::VarMap;

/// Overwrites every `*.bias` in `var_map` with small distinct values so
/// reference checks also cover the bias terms.
pub fn perturb_biases(var_map: &VarMap) {
    let data = var_map.data().lock().unwrap();
    let mut names: Vec<&String> = data.keys().filter(|n| n.ends_with(".bias")).collect();
    names.sort();
    for (i, name) in names.into_iter().enumerate() {
        let var = &data[name];
        let values: Vec<f32> = (0..var.elem_count())
            .map(|j| 0.1 * ((i * 7 + j) as f32 * 0.9 + 0.3).sin())
            .collect();
        let tensor = Tensor::from_vec(values, var.dims(), var.device()).unwrap();
        var.set(&tensor).unwrap();
    }
}

/// `W x + b` using the weights stored under `prefix`.
pub fn linear_ref(var_map: &VarMap, prefix: &str, x: &[f32]) -> Vec<f32> {
    let data = var_map.data().lock().unwrap();
    let weight = data[&format!("{prefix}.weight")]
        .as_tensor()
        .to_vec2::<f32>()
        .unwrap();
    let bias = data[&format!("{prefix}.bias")]
        .as_tensor()
        .to_vec1::<f32>()
        .unwrap();
    assert_eq!(weight[0].len(), x.len(), "{prefix} input width");
    weight
        .iter()
        .zip(&bias)
        .map(|(row, b)| row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>() + b)
        .collect()
}

/// Masked softmax of one score row.
pub fn softmax_ref(scores: &[f32], mask: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores
        .iter()
        .zip(mask)
        .map(|(s, m)| (s - max).exp() * m)
        .collect();
    let total: f32 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}

pub fn assert_rows_close(actual: &Tensor, expected: &[Vec<f32>], tolerance: f32) {
    let actual = actual.to_vec2::<f32>().unwrap();
    assert_eq!(actual.len(), expected.len());
    for (row, want) in actual.iter().zip(expected) {
        assert_eq!(row.len(), want.len());
        for (a, b) in row.iter().zip(want) {
            assert!((a - b).abs() < tolerance, "{row:?} vs {want:?}");
        }
    }
}
