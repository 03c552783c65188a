mod codec;

use crate::tensor::{DType, TensorData};
use crate::StateDict;

pub(super) fn sample() -> StateDict {
    [
        ("embed.weight", TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [2, 2])),
        ("embed.bias", TensorData::new(vec![0.5f64, -0.5], [2])),
        ("mask", TensorData::new(vec![true, false, true], [3])),
        ("ids", TensorData::new(vec![7i64], Vec::new())),
        ("half", TensorData::zeros(DType::F16, [2])),
    ]
    .into_iter()
    .collect()
}
