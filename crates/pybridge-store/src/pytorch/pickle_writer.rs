//! Protocol 2 pickle encoder for checkpoint value trees.
//!
//! Output depends only on the logical input: dictionaries are written in insertion order, the
//! memo is keyed by content and tensor storages are numbered in the order they are met.

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use hashbrown::HashMap;

use crate::pytorch::pickle_reader::OpCode;
use crate::pytorch::value::{DictKey, PickleDict, PickleValue, TensorRef};
use crate::tensor::{contiguous_strides, TensorData};
use crate::StoreError;

/// Items written per `APPENDS`/`SETITEMS` batch.
const BATCH_SIZE: usize = 1000;

/// Result of encoding: the pickle program and the storages it references.
///
/// Storage `i` is referenced under the archive key `i.to_string()`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPickle {
    /// The pickle program, ending with `STOP`.
    pub program: Vec<u8>,
    /// Raw little-endian bytes of every storage, in key order.
    pub storages: Vec<Vec<u8>>,
}

#[derive(Debug, PartialEq, Eq, Hash)]
enum MemoKey {
    String(String),
    Global(String, String),
}

/// Encode a value tree as a protocol 2 pickle program.
pub fn write_pickle(root: &PickleValue) -> Result<EncodedPickle, StoreError> {
    let mut writer = PickleWriter::default();
    writer.op(OpCode::Proto);
    writer.out.push(2);
    writer.value(root)?;
    writer.op(OpCode::Stop);

    Ok(EncodedPickle {
        program: writer.out,
        storages: writer.storages,
    })
}

#[derive(Default)]
struct PickleWriter {
    out: Vec<u8>,
    memo: HashMap<MemoKey, u32>,
    storages: Vec<Vec<u8>>,
}

impl PickleWriter {
    fn op(&mut self, op: OpCode) {
        self.out.push(op as u8);
    }

    fn value(&mut self, value: &PickleValue) -> Result<(), StoreError> {
        match value {
            PickleValue::None => self.op(OpCode::None),
            PickleValue::Bool(true) => self.op(OpCode::NewTrue),
            PickleValue::Bool(false) => self.op(OpCode::NewFalse),
            PickleValue::Int(v) => self.int(*v),
            PickleValue::Float(v) => {
                self.op(OpCode::BinFloat);
                self.out.write_f64::<BigEndian>(*v)?;
            }
            PickleValue::Bytes(bytes) => self.bytes(bytes)?,
            PickleValue::String(s) => self.string(s)?,
            PickleValue::Tuple(items) => self.tuple(items)?,
            PickleValue::List(items) => {
                self.op(OpCode::EmptyList);
                for batch in items.chunks(BATCH_SIZE) {
                    if let [item] = batch {
                        self.value(item)?;
                        self.op(OpCode::Append);
                        continue;
                    }
                    self.op(OpCode::Mark);
                    for item in batch {
                        self.value(item)?;
                    }
                    self.op(OpCode::Appends);
                }
            }
            PickleValue::Dict(dict) => {
                self.op(OpCode::EmptyDict);
                self.dict_items(dict)?;
            }
            PickleValue::OrderedDict(dict) => {
                self.global("collections", "OrderedDict")?;
                self.op(OpCode::EmptyTuple);
                self.op(OpCode::Reduce);
                self.dict_items(dict)?;
            }
            PickleValue::Global { module, name } => self.global(module, name)?,
            PickleValue::Tensor(TensorRef::Loaded(data)) => self.tensor(data)?,
            PickleValue::Tensor(tensor @ TensorRef::Deferred(_)) => {
                let data = tensor.load()?;
                self.tensor(&data)?;
            }
            PickleValue::Storage(record) => {
                return Err(StoreError::Format(format!(
                    "storage `{}` is not attached to a tensor and cannot be encoded",
                    record.key
                )));
            }
        }
        Ok(())
    }

    fn int(&mut self, v: i64) {
        if (0..=0xff).contains(&v) {
            self.op(OpCode::BinInt1);
            self.out.push(v as u8);
        } else if (0..=0xffff).contains(&v) {
            self.op(OpCode::BinInt2);
            self.out.extend_from_slice(&(v as u16).to_le_bytes());
        } else if i32::try_from(v).is_ok() {
            self.op(OpCode::BinInt);
            self.out.extend_from_slice(&(v as i32).to_le_bytes());
        } else {
            let bytes = encode_long(v);
            self.op(OpCode::Long1);
            self.out.push(bytes.len() as u8);
            self.out.extend_from_slice(&bytes);
        }
    }

    fn bytes(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if bytes.len() < 256 {
            self.op(OpCode::ShortBinBytes);
            self.out.push(bytes.len() as u8);
        } else {
            self.op(OpCode::BinBytes);
            self.out.write_u32::<LittleEndian>(u32_len(bytes.len())?)?;
        }
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    fn string(&mut self, s: &str) -> Result<(), StoreError> {
        if let Some(&idx) = self.memo.get(&MemoKey::String(s.to_string())) {
            self.get(idx);
            return Ok(());
        }
        self.op(OpCode::BinUnicode);
        self.out.write_u32::<LittleEndian>(u32_len(s.len())?)?;
        self.out.extend_from_slice(s.as_bytes());
        self.put(MemoKey::String(s.to_string()));
        Ok(())
    }

    fn global(&mut self, module: &str, name: &str) -> Result<(), StoreError> {
        let key = MemoKey::Global(module.to_string(), name.to_string());
        if let Some(&idx) = self.memo.get(&key) {
            self.get(idx);
            return Ok(());
        }
        if module.contains('\n') || name.contains('\n') {
            return Err(StoreError::Format(format!(
                "global `{module}.{name}` contains a newline"
            )));
        }
        self.op(OpCode::Global);
        self.out.extend_from_slice(module.as_bytes());
        self.out.push(b'\n');
        self.out.extend_from_slice(name.as_bytes());
        self.out.push(b'\n');
        self.put(key);
        Ok(())
    }

    fn tuple(&mut self, items: &[PickleValue]) -> Result<(), StoreError> {
        let op = match items.len() {
            0 => {
                self.op(OpCode::EmptyTuple);
                return Ok(());
            }
            1 => OpCode::Tuple1,
            2 => OpCode::Tuple2,
            3 => OpCode::Tuple3,
            _ => {
                self.op(OpCode::Mark);
                OpCode::Tuple
            }
        };
        for item in items {
            self.value(item)?;
        }
        self.op(op);
        Ok(())
    }

    fn dict_items(&mut self, dict: &PickleDict) -> Result<(), StoreError> {
        let entries: Vec<(&DictKey, &PickleValue)> = dict.iter().collect();
        for batch in entries.chunks(BATCH_SIZE) {
            let single = batch.len() == 1;
            if !single {
                self.op(OpCode::Mark);
            }
            for (key, value) in batch {
                match key {
                    DictKey::Int(i) => self.int(*i),
                    DictKey::String(s) => self.string(s)?,
                }
                self.value(value)?;
            }
            self.op(if single {
                OpCode::SetItem
            } else {
                OpCode::SetItems
            });
        }
        Ok(())
    }

    /// `_rebuild_tensor_v2(storage, 0, size, stride, False, OrderedDict())` over a new storage.
    fn tensor(&mut self, data: &TensorData) -> Result<(), StoreError> {
        let key = self.storages.len();
        let bytes = data.to_bytes().into_owned();
        let shape: Vec<PickleValue> = data
            .shape()
            .iter()
            .map(|&dim| PickleValue::Int(dim as i64))
            .collect();
        let strides: Vec<PickleValue> = contiguous_strides(data.shape())
            .into_iter()
            .map(|stride| PickleValue::Int(stride as i64))
            .collect();

        self.global("torch._utils", "_rebuild_tensor_v2")?;
        self.op(OpCode::Mark);
        {
            let pid = PickleValue::Tuple(vec![
                PickleValue::String("storage".into()),
                PickleValue::Global {
                    module: "torch".into(),
                    name: data.dtype().storage_type().into(),
                },
                PickleValue::String(key.to_string()),
                PickleValue::String("cpu".into()),
                PickleValue::Int(data.num_elements() as i64),
            ]);
            self.value(&pid)?;
            self.op(OpCode::BinPersId);
        }
        self.int(0);
        self.tuple(&shape)?;
        self.tuple(&strides)?;
        self.op(OpCode::NewFalse);
        self.value(&PickleValue::OrderedDict(PickleDict::new()))?;
        self.op(OpCode::Tuple);
        self.op(OpCode::Reduce);

        self.storages.push(bytes);
        Ok(())
    }

    fn put(&mut self, key: MemoKey) {
        let idx = self.memo.len() as u32;
        if idx < 256 {
            self.op(OpCode::BinPut);
            self.out.push(idx as u8);
        } else {
            self.op(OpCode::LongBinPut);
            self.out.extend_from_slice(&idx.to_le_bytes());
        }
        self.memo.insert(key, idx);
    }

    fn get(&mut self, idx: u32) {
        if idx < 256 {
            self.op(OpCode::BinGet);
            self.out.push(idx as u8);
        } else {
            self.op(OpCode::LongBinGet);
            self.out.extend_from_slice(&idx.to_le_bytes());
        }
    }
}

fn u32_len(len: usize) -> Result<u32, StoreError> {
    u32::try_from(len)
        .map_err(|_| StoreError::Format(format!("value of {len} bytes is too large to pickle")))
}

/// Minimal little-endian two's complement bytes of an integer, as `LONG1` expects.
fn encode_long(v: i64) -> Vec<u8> {
    let mut bytes = v.to_le_bytes().to_vec();
    while bytes.len() > 1 {
        let last = bytes[bytes.len() - 1];
        let prev = bytes[bytes.len() - 2];
        let redundant = (last == 0x00 && prev & 0x80 == 0) || (last == 0xff && prev & 0x80 != 0);
        if !redundant {
            break;
        }
        bytes.pop();
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pytorch::pickle_reader::read_pickle;
    use std::io::Cursor;

    fn round_trip(value: &PickleValue) -> PickleValue {
        let encoded = write_pickle(value).unwrap();
        assert!(encoded.storages.is_empty());
        read_pickle(&mut Cursor::new(encoded.program)).unwrap()
    }

    #[test]
    fn integers_pick_the_smallest_opcode() {
        let cases: [(i64, u8); 6] = [
            (7, b'K'),
            (300, b'M'),
            (-1, b'J'),
            (70_000, b'J'),
            (1 << 40, 0x8a),
            (i64::MIN, 0x8a),
        ];
        for (value, op) in cases {
            let encoded = write_pickle(&PickleValue::Int(value)).unwrap();
            assert_eq!(encoded.program[2], op, "opcode for {value}");
            assert_eq!(round_trip(&PickleValue::Int(value)), PickleValue::Int(value));
        }
    }

    #[test]
    fn long_encoding_is_minimal() {
        assert_eq!(encode_long(1 << 40), vec![0, 0, 0, 0, 0, 1]);
        assert_eq!(encode_long(-(1 << 40)), vec![0, 0, 0, 0, 0, 0xff]);
        assert_eq!(encode_long(0x80_0000_0000), vec![0, 0, 0, 0, 0x80, 0]);
    }

    #[test]
    fn repeated_strings_are_memoized() {
        let value = PickleValue::List(vec!["lr".into(), "lr".into(), "momentum".into()]);
        let encoded = write_pickle(&value).unwrap();
        let occurrences = encoded
            .program
            .windows(2)
            .filter(|window| *window == b"lr")
            .count();

        assert_eq!(occurrences, 1);
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn nested_containers_round_trip() {
        let mut group = PickleDict::new();
        group.insert("lr".into(), PickleValue::Float(1e-3));
        group.insert(
            "betas".into(),
            PickleValue::Tuple(vec![PickleValue::Float(0.9), PickleValue::Float(0.999)]),
        );
        group.insert("nesterov".into(), PickleValue::Bool(false));
        group.insert("foreach".into(), PickleValue::None);
        group.insert(
            "params".into(),
            PickleValue::List((0..1500).map(PickleValue::Int).collect()),
        );
        let mut root = PickleDict::new();
        root.insert(DictKey::Int(3), PickleValue::Bytes(vec![1, 2, 3]));
        root.insert("param_groups".into(), PickleValue::List(vec![PickleValue::Dict(group)]));
        let value = PickleValue::Dict(root);

        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn ordered_dicts_use_construct_then_setitems() {
        let mut dict = PickleDict::new();
        dict.insert("a".into(), PickleValue::Int(1));
        dict.insert("b".into(), PickleValue::Int(2));
        let encoded = write_pickle(&PickleValue::OrderedDict(dict)).unwrap();

        let expected: &[u8] = b"\x80\x02ccollections\nOrderedDict\nq\x00)R(X\x01\x00\x00\x00aq\x01K\x01X\x01\x00\x00\x00bq\x02K\x02u.";
        assert_eq!(encoded.program, expected);
    }

    #[test]
    fn tensors_go_to_side_storages() {
        let value = PickleValue::List(vec![
            TensorData::new(vec![1.0f32, 2.0], [2]).into(),
            TensorData::new(vec![7i64], [1, 1]).into(),
        ]);
        let encoded = write_pickle(&value).unwrap();

        assert_eq!(encoded.storages.len(), 2);
        assert_eq!(encoded.storages[1], 7i64.to_le_bytes().to_vec());
        assert!(read_pickle(&mut Cursor::new(encoded.program)).is_err());
    }
}
