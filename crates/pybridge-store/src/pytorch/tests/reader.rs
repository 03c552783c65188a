use super::{Pickler, View, f32_bytes, f64_bytes, zip_checkpoint};
use crate::pytorch::{
    DictKey, OpCode, PickleValue, PytorchReader, TensorLoading, decode_checkpoint, read_pickle,
};
use crate::tensor::{DType, TensorError};
use crate::StoreError;

/// `OrderedDict` state dict with a row-major weight, its transpose, an offset view into a
/// double storage and the `_metadata` attribute torch attaches through `BUILD`.
fn state_dict_checkpoint() -> Vec<u8> {
    let mut p = Pickler::new();
    p.ordered_dict().op(OpCode::Mark);
    p.str("weight")
        .tensor(&View::new("FloatStorage", "0", 6, &[2, 3], &[3, 1]));
    p.str("weight_t")
        .tensor(&View::new("FloatStorage", "0", 6, &[3, 2], &[1, 3]));
    p.str("bias")
        .tensor(&View::new("DoubleStorage", "1", 4, &[2], &[1]).offset(1));
    p.op(OpCode::SetItems);
    p.op(OpCode::EmptyDict)
        .str("_metadata")
        .ordered_dict()
        .op(OpCode::SetItem)
        .op(OpCode::Build);
    let program = p.finish();

    zip_checkpoint(
        &program,
        &[
            ("0", f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])),
            ("1", f64_bytes(&[0.5, 1.5, 2.5, 3.5])),
        ],
    )
}

#[test]
fn reads_state_dict_in_order() {
    let state_dict = decode_checkpoint(&state_dict_checkpoint()).unwrap();

    let names: Vec<&str> = state_dict.names().collect();
    assert_eq!(names, vec!["weight", "weight_t", "bias"]);

    let weight = state_dict.get("weight").unwrap();
    assert_eq!(weight.dtype(), DType::F32);
    assert_eq!(weight.shape(), &[2, 3]);
    assert_eq!(
        weight.to_vec::<f32>().unwrap(),
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
    );
}

#[test]
fn transposed_view_reads_column_major() {
    let state_dict = decode_checkpoint(&state_dict_checkpoint()).unwrap();
    let weight_t = state_dict.get("weight_t").unwrap();

    assert!(!weight_t.is_contiguous());
    assert_eq!(
        weight_t.to_vec::<f32>().unwrap(),
        vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
    );
}

#[test]
fn offset_view_skips_leading_elements() {
    let state_dict = decode_checkpoint(&state_dict_checkpoint()).unwrap();
    let bias = state_dict.get("bias").unwrap();

    assert_eq!(bias.dtype(), DType::F64);
    assert_eq!(bias.storage_offset(), 1);
    assert_eq!(bias.to_vec::<f64>().unwrap(), vec![1.5, 2.5]);
}

#[test]
fn aliasing_views_share_storage() {
    let state_dict = decode_checkpoint(&state_dict_checkpoint()).unwrap();
    let weight = state_dict.get("weight").unwrap();
    let weight_t = state_dict.get("weight_t").unwrap();

    assert!(std::sync::Arc::ptr_eq(weight.storage(), weight_t.storage()));
}

#[test]
fn metadata_attribute_is_dropped() {
    let reader = PytorchReader::from_bytes(state_dict_checkpoint()).unwrap();
    let root = reader.read_value(TensorLoading::Eager).unwrap();

    let dict = match root {
        PickleValue::OrderedDict(dict) => dict,
        other => panic!("expected an OrderedDict, got {other:?}"),
    };
    assert_eq!(dict.len(), 3);
    assert!(!dict.contains_key(&DictKey::from("_metadata")));
}

#[test]
fn deferred_tensors_read_once() {
    let reader = PytorchReader::from_bytes(state_dict_checkpoint()).unwrap();
    let index = reader.read_lazy_state_dict().unwrap();

    let bias = index.get("bias").unwrap();
    assert_eq!(bias.dtype(), DType::F64);
    assert_eq!(bias.shape(), &[2]);
    assert!(!bias.is_consumed());

    assert_eq!(bias.load().unwrap().to_vec::<f64>().unwrap(), vec![1.5, 2.5]);
    assert!(bias.is_consumed());
    assert!(matches!(bias.load(), Err(StoreError::Reuse(_))));

    // Other views over the same storage keep their own handle.
    let weight = index.get("weight_t").unwrap();
    assert_eq!(weight.load().unwrap().shape(), &[3, 2]);
}

#[test]
fn legacy_format_is_rejected() {
    let mut p = Pickler::new();
    p.op(OpCode::EmptyDict);
    let legacy = p.finish();

    assert!(matches!(
        decode_checkpoint(&legacy),
        Err(StoreError::LegacyFormat)
    ));
    assert!(matches!(decode_checkpoint(b"PK"), Err(StoreError::LegacyFormat)));
}

#[test]
fn whole_model_save_is_rejected() {
    let mut p = Pickler::new();
    p.ordered_dict().str("weight");
    p.global("torch._utils", "_rebuild_parameter").op(OpCode::Mark);
    p.tensor(&View::new("FloatStorage", "0", 2, &[2], &[1]))
        .op(OpCode::NewTrue)
        .ordered_dict()
        .op(OpCode::Tuple)
        .op(OpCode::Reduce)
        .op(OpCode::SetItem);
    let program = p.finish();
    let bytes = zip_checkpoint(&program, &[("0", f32_bytes(&[1.0, 2.0]))]);

    match decode_checkpoint(&bytes) {
        Err(StoreError::UnsupportedConstruct { class, hint }) => {
            assert_eq!(class, "torch._utils._rebuild_parameter");
            assert!(hint.contains("state_dict()"));
        }
        other => panic!("expected UnsupportedConstruct, got {other:?}"),
    }
}

#[test]
fn pickled_classes_are_rejected() {
    let mut p = Pickler::new();
    p.global("__main__", "Net").op(OpCode::EmptyTuple).op(OpCode::NewObj);
    let bytes = zip_checkpoint(&p.finish(), &[]);

    assert!(matches!(
        decode_checkpoint(&bytes),
        Err(StoreError::UnsupportedConstruct { ref class, .. }) if class == "__main__.Net"
    ));
}

#[test]
fn unknown_storage_class_is_unsupported() {
    let mut p = Pickler::new();
    p.op(OpCode::EmptyDict).str("q");
    p.tensor(&View::new("QInt8Storage", "0", 2, &[2], &[1]))
        .op(OpCode::SetItem);
    let bytes = zip_checkpoint(&p.finish(), &[("0", vec![1, 2])]);

    assert!(matches!(
        decode_checkpoint(&bytes),
        Err(StoreError::UnsupportedType(_))
    ));
}

#[test]
fn short_storage_is_a_length_mismatch() {
    let mut p = Pickler::new();
    p.op(OpCode::EmptyDict).str("w");
    p.tensor(&View::new("FloatStorage", "0", 4, &[4], &[1]))
        .op(OpCode::SetItem);
    let bytes = zip_checkpoint(&p.finish(), &[("0", f32_bytes(&[1.0, 2.0]))]);

    assert!(matches!(
        decode_checkpoint(&bytes),
        Err(StoreError::LengthMismatch {
            expected: 16,
            found: 8,
            ..
        })
    ));
}

#[test]
fn view_past_storage_end_is_rejected() {
    let mut p = Pickler::new();
    p.op(OpCode::EmptyDict).str("w");
    p.tensor(&View::new("FloatStorage", "0", 2, &[3], &[1]))
        .op(OpCode::SetItem);
    let bytes = zip_checkpoint(&p.finish(), &[("0", f32_bytes(&[1.0, 2.0]))]);

    assert!(matches!(decode_checkpoint(&bytes), Err(StoreError::Tensor(_))));
}

/// A `[3, 3]` float view whose strides overflow when the view extent is computed.
fn overflowing_view_checkpoint() -> Vec<u8> {
    let mut p = Pickler::new();
    p.op(OpCode::EmptyDict).str("w");
    p.global("torch._utils", "_rebuild_tensor_v2").op(OpCode::Mark);
    p.persistent_storage("FloatStorage", "0", 2);
    p.int(0).int_tuple(&[3, 3]);
    p.op(OpCode::Mark)
        .long(i64::MAX)
        .long(i64::MAX)
        .op(OpCode::Tuple);
    p.op(OpCode::NewFalse)
        .ordered_dict()
        .op(OpCode::Tuple)
        .op(OpCode::Reduce)
        .op(OpCode::SetItem);
    zip_checkpoint(&p.finish(), &[("0", f32_bytes(&[1.0, 2.0]))])
}

#[test]
fn overflowing_strides_are_out_of_bounds() {
    let bytes = overflowing_view_checkpoint();
    let out_of_bounds = |result: Result<_, StoreError>| {
        matches!(
            result,
            Err(StoreError::Tensor(TensorError::OutOfBounds {
                required: usize::MAX,
                available: 2,
            }))
        )
    };

    assert!(out_of_bounds(decode_checkpoint(&bytes).map(|_| ())));
    let reader = PytorchReader::from_bytes(bytes).unwrap();
    assert!(out_of_bounds(reader.read_lazy_state_dict().map(|_| ())));
}

#[test]
fn missing_pickle_entry_is_a_format_error() {
    let bytes = {
        let mut archive =
            crate::archive::ArchiveWriter::new(std::io::Cursor::new(Vec::new()), "model");
        archive.write_entry("version", b"3\n").unwrap();
        archive.finish().unwrap().into_inner()
    };

    assert!(matches!(decode_checkpoint(&bytes), Err(StoreError::Format(_))));
}

#[test]
fn nested_dicts_are_flattened() {
    let mut p = Pickler::new();
    p.op(OpCode::EmptyDict).str("encoder").op(OpCode::EmptyDict).str("weight");
    p.tensor(&View::new("FloatStorage", "0", 2, &[2], &[1]))
        .op(OpCode::SetItem)
        .op(OpCode::SetItem);
    p.str("epoch").int(3).op(OpCode::SetItem);
    let bytes = zip_checkpoint(&p.finish(), &[("0", f32_bytes(&[1.0, 2.0]))]);

    let state_dict = decode_checkpoint(&bytes).unwrap();
    let names: Vec<&str> = state_dict.names().collect();
    assert_eq!(names, vec!["encoder.weight"]);
}

fn entry<'a>(value: &'a PickleValue, key: &str) -> &'a PickleValue {
    value.as_dict().unwrap().get(&DictKey::from(key)).unwrap()
}

// Bytes of `pickle.dumps({'a': l, 'b': l}, protocol=2)` with `l = [1, 2]`.
const SHARED_LIST: &[u8] =
    b"\x80\x02}q\x00(X\x01\x00\x00\x00aq\x01]q\x02(K\x01K\x02eX\x01\x00\x00\x00bq\x03h\x02u.";

// Bytes of `pickle.dumps({'a': d, 'b': d}, protocol=2)` with `d = {'x': 1}`.
const SHARED_DICT: &[u8] =
    b"\x80\x02}q\x00(X\x01\x00\x00\x00aq\x01}q\x02X\x01\x00\x00\x00xq\x03K\x01sX\x01\x00\x00\x00bq\x04h\x02u.";

#[test]
fn recalled_list_has_its_items() {
    let value = read_pickle(&mut &SHARED_LIST[..]).unwrap();
    let expected = PickleValue::List(vec![PickleValue::Int(1), PickleValue::Int(2)]);

    assert_eq!(entry(&value, "a"), &expected);
    assert_eq!(entry(&value, "b"), &expected);
}

#[test]
fn recalled_dict_has_its_items() {
    let value = read_pickle(&mut &SHARED_DICT[..]).unwrap();

    for key in ["a", "b"] {
        let inner = entry(&value, key);
        assert_eq!(inner.as_dict().unwrap().len(), 1);
        assert_eq!(entry(inner, "x"), &PickleValue::Int(1));
    }
}

#[test]
fn param_groups_sharing_betas_decode_both_pairs() {
    // `[{'betas': b}, {'betas': b}]` with `b = [0.5, 0.25]`; the key string is recalled too.
    let mut program = b"\x80\x02]q\x00(}q\x01X\x05\x00\x00\x00betasq\x02]q\x03(G".to_vec();
    program.extend_from_slice(&0.5f64.to_be_bytes());
    program.push(b'G');
    program.extend_from_slice(&0.25f64.to_be_bytes());
    program.extend_from_slice(b"es}q\x04h\x02h\x03se.");

    let value = read_pickle(&mut program.as_slice()).unwrap();
    let groups = value.as_sequence().unwrap();
    let betas = PickleValue::List(vec![PickleValue::Float(0.5), PickleValue::Float(0.25)]);

    assert_eq!(groups.len(), 2);
    assert_eq!(entry(&groups[0], "betas"), &betas);
    assert_eq!(entry(&groups[1], "betas"), &betas);
}

#[test]
fn unknown_memo_reference_is_an_error() {
    let program = b"\x80\x02h\x07.";
    assert!(matches!(
        read_pickle(&mut &program[..]),
        Err(StoreError::Pickle(crate::pytorch::PickleError::MemoNotFound(7)))
    ));
}
