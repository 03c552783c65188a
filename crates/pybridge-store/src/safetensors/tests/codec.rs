use std::collections::BTreeMap;
use std::io::Cursor;

use super::sample;
use crate::safetensors::{
    SafetensorsReader, decode_safetensors, encode_safetensors, encode_safetensors_with_metadata,
};
use crate::tensor::{DType, TensorData};
use crate::{KeyFilter, StateDict, StoreError};

fn raw_file(header: &str, data: &[u8]) -> Vec<u8> {
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(data);
    bytes
}

#[test]
fn round_trip_keeps_order_and_values() {
    let state_dict = sample();
    let decoded = decode_safetensors(&encode_safetensors(&state_dict).unwrap(), None).unwrap();

    assert_eq!(decoded, state_dict);
    let names: Vec<&str> = decoded.names().collect();
    assert_eq!(names, vec!["embed.weight", "embed.bias", "mask", "ids", "half"]);
    assert_eq!(decoded.get("mask").unwrap().dtype(), DType::Bool);
}

#[test]
fn header_is_aligned_and_offsets_follow_dict_order() {
    let bytes = encode_safetensors(&sample()).unwrap();
    let header_len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
    assert_eq!(header_len % 8, 0);

    let reader = SafetensorsReader::new(Cursor::new(&bytes)).unwrap();
    let index = reader.index();
    assert_eq!(index.get("embed.weight").unwrap().data_offsets, (0, 16));
    assert_eq!(index.get("embed.bias").unwrap().data_offsets, (16, 32));
    assert_eq!(index.get("mask").unwrap().data_offsets, (32, 35));
    assert_eq!(index.get("ids").unwrap().data_offsets, (35, 43));
    assert_eq!(index.get("half").unwrap().data_offsets, (43, 47));
    assert_eq!(bytes.len(), 8 + header_len + 47);
}

#[test]
fn metadata_is_written_and_exposed() {
    let mut metadata = BTreeMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    let bytes = encode_safetensors_with_metadata(&sample(), Some(&metadata)).unwrap();

    let reader = SafetensorsReader::from_bytes(bytes).unwrap();
    assert_eq!(reader.metadata(), Some(&metadata));
    assert_eq!(reader.index().len(), 5);
}

#[test]
fn filter_reads_only_selected_tensors() {
    let bytes = encode_safetensors(&sample()).unwrap();
    let filter = KeyFilter::new().with_regex(r"^embed\.").unwrap();

    let partial = decode_safetensors(&bytes, Some(&filter)).unwrap();
    let names: Vec<&str> = partial.names().collect();
    assert_eq!(names, vec!["embed.weight", "embed.bias"]);
    assert_eq!(
        partial.get("embed.bias").unwrap().to_vec::<f64>().unwrap(),
        vec![0.5, -0.5]
    );
}

#[test]
fn single_tensor_reads_seek_to_their_range() {
    let bytes = encode_safetensors(&sample()).unwrap();
    let mut reader = SafetensorsReader::from_bytes(bytes).unwrap();

    let ids = reader.read_tensor("ids").unwrap();
    assert_eq!(ids.to_vec::<i64>().unwrap(), vec![7]);
    let weight = reader.read_tensor("embed.weight").unwrap();
    assert_eq!(weight.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    assert!(matches!(reader.read_tensor("nope"), Err(StoreError::Format(_))));
}

#[test]
fn views_are_written_in_logical_order() {
    let storage = std::sync::Arc::new(
        [1i32, 2, 3, 4, 5, 6]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect::<Vec<u8>>(),
    );
    let column = TensorData::strided(storage, DType::I32, vec![2], vec![3], 1).unwrap();
    let state_dict: StateDict = [("column", column)].into_iter().collect();

    let decoded = decode_safetensors(&encode_safetensors(&state_dict).unwrap(), None).unwrap();
    assert_eq!(decoded.get("column").unwrap().to_vec::<i32>().unwrap(), vec![2, 5]);
}

#[test]
fn complex_tensors_are_rejected() {
    let state_dict: StateDict = [("z", TensorData::zeros(DType::Complex64, [2]))]
        .into_iter()
        .collect();
    assert!(matches!(
        encode_safetensors(&state_dict),
        Err(StoreError::UnsupportedType(_))
    ));
}

#[test]
fn reserved_name_is_rejected() {
    let state_dict: StateDict = [("__metadata__", TensorData::zeros(DType::U8, [1]))]
        .into_iter()
        .collect();
    assert!(matches!(
        encode_safetensors(&state_dict),
        Err(StoreError::Format(_))
    ));
}

#[test]
fn range_inconsistent_with_shape_is_a_length_mismatch() {
    let header = r#"{"w":{"dtype":"F32","shape":[3],"data_offsets":[0,8]}}"#;
    let bytes = raw_file(header, &[0; 8]);

    match decode_safetensors(&bytes, None) {
        Err(StoreError::LengthMismatch {
            name,
            expected,
            found,
        }) => {
            assert_eq!(name, "w");
            assert_eq!(expected, 12);
            assert_eq!(found, 8);
        }
        other => panic!("expected LengthMismatch, got {other:?}"),
    }
}

#[test]
fn truncated_files_are_format_errors() {
    assert!(matches!(
        decode_safetensors(&[1, 2, 3], None),
        Err(StoreError::Format(_))
    ));

    let mut bytes = 100u64.to_le_bytes().to_vec();
    bytes.extend_from_slice(b"{}");
    assert!(matches!(
        decode_safetensors(&bytes, None),
        Err(StoreError::Format(_))
    ));

    let header = r#"{"w":{"dtype":"U8","shape":[4],"data_offsets":[0,4]}}"#;
    assert!(matches!(
        decode_safetensors(&raw_file(header, &[0; 2]), None),
        Err(StoreError::Format(_))
    ));
}

#[test]
fn empty_state_dict_round_trips() {
    let bytes = encode_safetensors(&StateDict::new()).unwrap();
    assert!(decode_safetensors(&bytes, None).unwrap().is_empty());
}

#[test]
fn empty_tensors_round_trip_in_order() {
    let state_dict: StateDict = [
        ("z", TensorData::zeros(DType::F32, [0])),
        ("a", TensorData::zeros(DType::F32, [0])),
        ("m", TensorData::full(1.0f32, [1])),
        ("b", TensorData::zeros(DType::I64, [2, 0])),
    ]
    .into_iter()
    .collect();

    let decoded = decode_safetensors(&encode_safetensors(&state_dict).unwrap(), None).unwrap();

    let names: Vec<&str> = decoded.names().collect();
    assert_eq!(names, vec!["z", "a", "m", "b"]);
    assert_eq!(decoded, state_dict);
}
