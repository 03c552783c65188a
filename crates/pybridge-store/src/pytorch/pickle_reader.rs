//! Just enough pickle support to read PyTorch checkpoints.
//!
//! The decoder is a stack machine over the opcode subset written by `torch.save` with pickle
//! protocols 2 to 5. Calls are only executed for the small, fixed set of constructors that
//! state dicts need; anything else is rejected with [`StoreError::UnsupportedConstruct`].

use std::io::{BufRead, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use hashbrown::HashMap;

use crate::error::STATE_DICT_HINT;
use crate::pytorch::rebuild::TensorDescriptor;
use crate::pytorch::storage::PersistentLoad;
use crate::pytorch::value::{DictKey, PickleDict, PickleValue};
use crate::StoreError;

/// Low level failures of the pickle program itself.
#[derive(thiserror::Error, Debug)]
pub enum PickleError {
    /// Byte that is not an opcode of the supported subset.
    #[error("Invalid pickle opcode 0x{0:02x}, the file may be corrupted or use an unsupported feature")]
    InvalidOpCode(u8),

    /// Protocol newer than 5.
    #[error("Unsupported pickle protocol {0}, supported versions are 2 to 5")]
    InvalidProtocol(u8),

    /// Opcode applied to a value it cannot operate on.
    #[error("Unexpected pickle opcode {0:?} for the value on top of the stack")]
    UnexpectedOpCode(OpCode),

    /// Pop from an empty stack.
    #[error("Pickle stack underflow, the file may be corrupted")]
    StackUnderflow,

    /// Mark-consuming opcode without a mark.
    #[error("Pickle mark not found, the file may be corrupted")]
    MarkNotFound,

    /// Memo lookup of an index that was never stored.
    #[error("Pickle memo reference {0} not found, the file may be corrupted")]
    MemoNotFound(u32),

    /// Malformed operand.
    #[error("Invalid data in pickle program: {0}")]
    InvalidData(String),
}

type Result<T> = std::result::Result<T, StoreError>;

// https://github.com/python/cpython/blob/main/Lib/pickletools.py
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum OpCode {
    Mark = b'(',
    Stop = b'.',
    Pop = b'0',
    PopMark = b'1',
    Dup = b'2',
    Int = b'I',
    BinInt = b'J',
    BinInt1 = b'K',
    BinInt2 = b'M',
    None = b'N',
    PersId = b'P',
    BinPersId = b'Q',
    Reduce = b'R',
    BinString = b'T',
    ShortBinString = b'U',
    BinUnicode = b'X',
    Append = b'a',
    Build = b'b',
    Global = b'c',
    Dict = b'd',
    EmptyDict = b'}',
    Appends = b'e',
    BinGet = b'h',
    LongBinGet = b'j',
    List = b'l',
    EmptyList = b']',
    BinPut = b'q',
    LongBinPut = b'r',
    SetItem = b's',
    Tuple = b't',
    EmptyTuple = b')',
    SetItems = b'u',
    BinFloat = b'G',
    BinBytes = b'B',
    ShortBinBytes = b'C',
    Proto = 0x80,
    NewObj = 0x81,
    Tuple1 = 0x85,
    Tuple2 = 0x86,
    Tuple3 = 0x87,
    NewTrue = 0x88,
    NewFalse = 0x89,
    Long1 = 0x8a,
    Long4 = 0x8b,
    ShortBinUnicode = 0x8c,
    BinUnicode8 = 0x8d,
    BinBytes8 = 0x8e,
    StackGlobal = 0x93,
    Memoize = 0x94,
    Frame = 0x95,
}

// Avoid using FromPrimitive so as not to drag another dependency.
impl TryFrom<u8> for OpCode {
    type Error = u8;
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            b'(' => Ok(Self::Mark),
            b'.' => Ok(Self::Stop),
            b'0' => Ok(Self::Pop),
            b'1' => Ok(Self::PopMark),
            b'2' => Ok(Self::Dup),
            b'I' => Ok(Self::Int),
            b'J' => Ok(Self::BinInt),
            b'K' => Ok(Self::BinInt1),
            b'M' => Ok(Self::BinInt2),
            b'N' => Ok(Self::None),
            b'P' => Ok(Self::PersId),
            b'Q' => Ok(Self::BinPersId),
            b'R' => Ok(Self::Reduce),
            b'T' => Ok(Self::BinString),
            b'U' => Ok(Self::ShortBinString),
            b'X' => Ok(Self::BinUnicode),
            b'a' => Ok(Self::Append),
            b'b' => Ok(Self::Build),
            b'c' => Ok(Self::Global),
            b'd' => Ok(Self::Dict),
            b'}' => Ok(Self::EmptyDict),
            b'e' => Ok(Self::Appends),
            b'h' => Ok(Self::BinGet),
            b'j' => Ok(Self::LongBinGet),
            b'l' => Ok(Self::List),
            b']' => Ok(Self::EmptyList),
            b'q' => Ok(Self::BinPut),
            b'r' => Ok(Self::LongBinPut),
            b's' => Ok(Self::SetItem),
            b't' => Ok(Self::Tuple),
            b')' => Ok(Self::EmptyTuple),
            b'u' => Ok(Self::SetItems),
            b'G' => Ok(Self::BinFloat),
            b'B' => Ok(Self::BinBytes),
            b'C' => Ok(Self::ShortBinBytes),
            0x80 => Ok(Self::Proto),
            0x81 => Ok(Self::NewObj),
            0x85 => Ok(Self::Tuple1),
            0x86 => Ok(Self::Tuple2),
            0x87 => Ok(Self::Tuple3),
            0x88 => Ok(Self::NewTrue),
            0x89 => Ok(Self::NewFalse),
            0x8a => Ok(Self::Long1),
            0x8b => Ok(Self::Long4),
            0x8c => Ok(Self::ShortBinUnicode),
            0x8d => Ok(Self::BinUnicode8),
            0x8e => Ok(Self::BinBytes8),
            0x93 => Ok(Self::StackGlobal),
            0x94 => Ok(Self::Memoize),
            0x95 => Ok(Self::Frame),
            value => Err(value),
        }
    }
}

/// The constructors a checkpoint may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Constructor {
    RebuildTensor,
    RebuildTensorV2,
    RebuildParameter,
    OrderedDict,
}

impl Constructor {
    fn resolve(callable: &PickleValue) -> Result<Self> {
        let (module, name) = match callable {
            PickleValue::Global { module, name } => (module.as_str(), name.as_str()),
            other => {
                return Err(StoreError::Format(format!(
                    "cannot call a value of type {}",
                    other.type_name()
                )));
            }
        };

        match (module, name) {
            ("torch._utils", "_rebuild_tensor") => Ok(Self::RebuildTensor),
            ("torch._utils", "_rebuild_tensor_v2") => Ok(Self::RebuildTensorV2),
            ("torch._utils", "_rebuild_parameter")
            | ("torch._utils", "_rebuild_parameter_with_state") => Ok(Self::RebuildParameter),
            ("collections", "OrderedDict") => Ok(Self::OrderedDict),
            _ => Err(StoreError::unsupported_construct(
                module,
                name,
                "only tensor state dicts can be loaded, objects of this type are not supported",
            )),
        }
    }

    fn call(self, callable: &PickleValue, args: PickleValue) -> Result<PickleValue> {
        let args = match args {
            PickleValue::Tuple(args) => args,
            other => {
                return Err(StoreError::Format(format!(
                    "constructor arguments must be a tuple, got {}",
                    other.type_name()
                )));
            }
        };

        match self {
            Self::RebuildTensor | Self::RebuildTensorV2 => {
                let descriptor = TensorDescriptor::from_args(&args)?;
                descriptor.materialize().map(PickleValue::Tensor)
            }
            Self::RebuildParameter => Err(StoreError::UnsupportedConstruct {
                class: qualified_name(callable),
                hint: STATE_DICT_HINT.into(),
            }),
            Self::OrderedDict => {
                if !args.is_empty() {
                    log::debug!("Ignoring {} OrderedDict constructor arguments", args.len());
                }
                Ok(PickleValue::OrderedDict(PickleDict::new()))
            }
        }
    }
}

fn qualified_name(value: &PickleValue) -> String {
    match value {
        PickleValue::Global { module, name } => format!("{module}.{name}"),
        other => other.type_name().into(),
    }
}

/// Merge a `__setstate__` dict into an ordered dict, keeping only tensor entries.
fn set_state(dict: &mut PickleDict, state: PickleDict) {
    for (key, value) in state {
        if matches!(value, PickleValue::Tensor(_)) {
            dict.insert(key, value);
        } else {
            log::debug!("Dropping non-tensor OrderedDict state entry `{key}`");
        }
    }
}

fn dict_key(key: PickleValue) -> Result<DictKey> {
    match key {
        PickleValue::String(s) => Ok(DictKey::String(s)),
        PickleValue::Int(i) => Ok(DictKey::Int(i)),
        other => Err(PickleError::InvalidData(format!(
            "dict keys must be strings or integers, got {}",
            other.type_name()
        ))
        .into()),
    }
}

fn insert_items(target: &mut PickleValue, items: Vec<PickleValue>, op: OpCode) -> Result<()> {
    if items.len() % 2 != 0 {
        return Err(PickleError::InvalidData(format!(
            "{op:?} requires an even number of objects"
        ))
        .into());
    }
    let dict = match target {
        PickleValue::Dict(dict) | PickleValue::OrderedDict(dict) => dict,
        _ => return Err(PickleError::UnexpectedOpCode(op).into()),
    };
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        dict.insert(dict_key(key)?, value);
    }
    Ok(())
}

/// A memoized value.
///
/// Pickle memoizes lists and dicts right after creating them, before their items are
/// appended. While the memoized value is still on the stack the memo points at its slot, so
/// a recall sees the filled container; it is copied out when the slot is popped.
#[derive(Debug)]
enum MemoEntry {
    Slot(usize),
    Value(PickleValue),
}

/// Stack machine state: value stack, mark positions and memo.
struct Stack {
    stack: Vec<PickleValue>,
    marks: Vec<usize>,
    memo: HashMap<u32, MemoEntry>,
    /// `(slot, memo index)` of memo entries still pointing into the stack, by slot.
    pinned: Vec<(usize, u32)>,
}

impl Stack {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
            pinned: Vec::new(),
        }
    }

    fn push(&mut self, value: PickleValue) {
        self.stack.push(value)
    }

    fn pop(&mut self) -> Result<PickleValue> {
        let len = self.stack.len();
        if len == 0 {
            return Err(PickleError::StackUnderflow.into());
        }
        self.unpin(len - 1);
        self.stack.pop().ok_or(PickleError::StackUnderflow.into())
    }

    fn top(&self) -> Result<&PickleValue> {
        self.stack.last().ok_or(PickleError::StackUnderflow.into())
    }

    fn last_mut(&mut self) -> Result<&mut PickleValue> {
        self.stack.last_mut().ok_or(PickleError::StackUnderflow.into())
    }

    fn push_mark(&mut self) {
        self.marks.push(self.stack.len());
    }

    fn pop_to_mark(&mut self) -> Result<Vec<PickleValue>> {
        let mark = self.marks.pop().ok_or(PickleError::MarkNotFound)?;
        if mark > self.stack.len() {
            return Err(PickleError::StackUnderflow.into());
        }
        self.unpin(mark);
        Ok(self.stack.split_off(mark))
    }

    /// Copy out the memo entries pointing at slots `from..` before those slots are popped.
    fn unpin(&mut self, from: usize) {
        while let Some(&(slot, idx)) = self.pinned.last() {
            if slot < from {
                break;
            }
            self.pinned.pop();
            let current = matches!(self.memo.get(&idx), Some(MemoEntry::Slot(s)) if *s == slot);
            let value = match self.stack.get(slot) {
                Some(value) if current => value.clone(),
                _ => continue,
            };
            self.memo.insert(idx, MemoEntry::Value(value));
        }
    }

    fn memo_put(&mut self, idx: u32) -> Result<()> {
        let slot = self
            .stack
            .len()
            .checked_sub(1)
            .ok_or(PickleError::StackUnderflow)?;
        self.memo.insert(idx, MemoEntry::Slot(slot));
        self.pinned.push((slot, idx));
        Ok(())
    }

    fn memo_get(&mut self, idx: u32) -> Result<()> {
        let value = match self.memo.get(&idx) {
            Some(MemoEntry::Slot(slot)) => self.stack.get(*slot).cloned(),
            Some(MemoEntry::Value(value)) => Some(value.clone()),
            None => None,
        }
        .ok_or(PickleError::MemoNotFound(idx))?;
        self.push(value);
        Ok(())
    }
}

fn read_to_newline<R: BufRead>(r: &mut R) -> Result<Vec<u8>> {
    let mut data: Vec<u8> = Vec::with_capacity(32);
    r.read_until(b'\n', &mut data)?;
    if data.pop() != Some(b'\n') {
        return Err(PickleError::InvalidData("unterminated line".into()).into());
    }
    if data.last() == Some(&b'\r') {
        data.pop();
    }
    Ok(data)
}

fn buf_to_str(buf: Vec<u8>) -> Result<String> {
    String::from_utf8(buf)
        .map_err(|e| PickleError::InvalidData(format!("invalid UTF-8: {e}")).into())
}

fn read_bytes<R: BufRead>(r: &mut R, len: u64) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let read = r.take(len).read_to_end(&mut data)?;
    if read as u64 != len {
        return Err(PickleError::InvalidData(format!(
            "expected {len} bytes, found {read}"
        ))
        .into());
    }
    Ok(data)
}

/// Decode a little-endian two's complement integer of up to 8 bytes.
fn decode_long(data: &[u8]) -> Result<i64> {
    if data.len() > 8 {
        return Err(PickleError::InvalidData(format!(
            "integer of {} bytes does not fit in 64 bits",
            data.len()
        ))
        .into());
    }
    let Some(&last) = data.last() else {
        return Ok(0);
    };
    let fill = if last & 0x80 != 0 { 0xff } else { 0x00 };
    let mut buf = [fill; 8];
    buf[..data.len()].copy_from_slice(data);
    Ok(i64::from_le_bytes(buf))
}

fn read_int_line<R: BufRead>(r: &mut R) -> Result<PickleValue> {
    let line = buf_to_str(read_to_newline(r)?)?;
    // Protocol 0 spells booleans as INT 01 / INT 00.
    match line.as_str() {
        "01" => return Ok(PickleValue::Bool(true)),
        "00" => return Ok(PickleValue::Bool(false)),
        _ => {}
    }
    line.parse::<i64>()
        .map(PickleValue::Int)
        .map_err(|e| PickleError::InvalidData(format!("invalid INT value '{line}': {e}")).into())
}

/// Decode one pickle program without a persistent-id hook.
///
/// Programs referencing persistent storage fail; use [`read_pickle_with`] for checkpoints.
pub fn read_pickle<R: BufRead>(r: &mut R) -> Result<PickleValue> {
    decode(r, None)
}

/// Decode one pickle program, resolving persistent ids through `persistent`.
pub fn read_pickle_with<R: BufRead>(
    r: &mut R,
    persistent: &mut dyn PersistentLoad,
) -> Result<PickleValue> {
    decode(r, Some(persistent))
}

fn decode<R: BufRead>(
    r: &mut R,
    mut persistent: Option<&mut dyn PersistentLoad>,
) -> Result<PickleValue> {
    let mut stack = Stack::new();
    loop {
        let op_code = r.read_u8()?;
        let op_code = OpCode::try_from(op_code).map_err(PickleError::InvalidOpCode)?;
        match op_code {
            OpCode::Proto => {
                let version = r.read_u8()?;
                if version > 5 {
                    return Err(PickleError::InvalidProtocol(version).into());
                }
            }
            OpCode::Frame => {
                // Frames only hint buffering; the opcodes inside are read as usual.
                r.read_u64::<LittleEndian>()?;
            }
            OpCode::Stop => break,
            OpCode::Mark => stack.push_mark(),
            OpCode::Pop => {
                if stack.marks.last() == Some(&stack.stack.len()) {
                    stack.marks.pop();
                } else {
                    stack.pop()?;
                }
            }
            OpCode::PopMark => {
                stack.pop_to_mark()?;
            }
            OpCode::Dup => {
                let top = stack.top()?.clone();
                stack.push(top);
            }
            OpCode::None => stack.push(PickleValue::None),
            OpCode::NewTrue => stack.push(PickleValue::Bool(true)),
            OpCode::NewFalse => stack.push(PickleValue::Bool(false)),
            OpCode::Int => {
                let value = read_int_line(r)?;
                stack.push(value);
            }
            OpCode::BinInt => {
                let v = r.read_i32::<LittleEndian>()?;
                stack.push(PickleValue::Int(v as i64));
            }
            OpCode::BinInt1 => {
                let v = r.read_u8()?;
                stack.push(PickleValue::Int(v as i64));
            }
            OpCode::BinInt2 => {
                let v = r.read_u16::<LittleEndian>()?;
                stack.push(PickleValue::Int(v as i64));
            }
            OpCode::Long1 => {
                let len = r.read_u8()? as u64;
                let data = read_bytes(r, len)?;
                stack.push(PickleValue::Int(decode_long(&data)?));
            }
            OpCode::Long4 => {
                let len = r.read_i32::<LittleEndian>()?;
                if len < 0 {
                    return Err(PickleError::InvalidData("negative LONG4 length".into()).into());
                }
                let data = read_bytes(r, len as u64)?;
                stack.push(PickleValue::Int(decode_long(&data)?));
            }
            OpCode::BinFloat => {
                // Python's BINFLOAT uses big-endian encoding
                let v = r.read_f64::<BigEndian>()?;
                stack.push(PickleValue::Float(v));
            }
            OpCode::BinUnicode | OpCode::BinString => {
                let len = r.read_u32::<LittleEndian>()? as u64;
                let s = buf_to_str(read_bytes(r, len)?)?;
                stack.push(PickleValue::String(s));
            }
            OpCode::ShortBinUnicode | OpCode::ShortBinString => {
                let len = r.read_u8()? as u64;
                let s = buf_to_str(read_bytes(r, len)?)?;
                stack.push(PickleValue::String(s));
            }
            OpCode::BinUnicode8 => {
                let len = r.read_u64::<LittleEndian>()?;
                let s = buf_to_str(read_bytes(r, len)?)?;
                stack.push(PickleValue::String(s));
            }
            OpCode::BinBytes => {
                let len = r.read_u32::<LittleEndian>()? as u64;
                stack.push(PickleValue::Bytes(read_bytes(r, len)?));
            }
            OpCode::ShortBinBytes => {
                let len = r.read_u8()? as u64;
                stack.push(PickleValue::Bytes(read_bytes(r, len)?));
            }
            OpCode::BinBytes8 => {
                let len = r.read_u64::<LittleEndian>()?;
                stack.push(PickleValue::Bytes(read_bytes(r, len)?));
            }
            OpCode::EmptyTuple => stack.push(PickleValue::Tuple(Vec::new())),
            OpCode::Tuple => {
                let items = stack.pop_to_mark()?;
                stack.push(PickleValue::Tuple(items));
            }
            OpCode::Tuple1 => {
                let a = stack.pop()?;
                stack.push(PickleValue::Tuple(vec![a]));
            }
            OpCode::Tuple2 => {
                let b = stack.pop()?;
                let a = stack.pop()?;
                stack.push(PickleValue::Tuple(vec![a, b]));
            }
            OpCode::Tuple3 => {
                let c = stack.pop()?;
                let b = stack.pop()?;
                let a = stack.pop()?;
                stack.push(PickleValue::Tuple(vec![a, b, c]));
            }
            OpCode::EmptyList => stack.push(PickleValue::List(Vec::new())),
            OpCode::List => {
                let items = stack.pop_to_mark()?;
                stack.push(PickleValue::List(items));
            }
            OpCode::Append => {
                let value = stack.pop()?;
                match stack.last_mut()? {
                    PickleValue::List(list) => list.push(value),
                    _ => return Err(PickleError::UnexpectedOpCode(op_code).into()),
                }
            }
            OpCode::Appends => {
                let items = stack.pop_to_mark()?;
                match stack.last_mut()? {
                    PickleValue::List(list) => list.extend(items),
                    _ => return Err(PickleError::UnexpectedOpCode(op_code).into()),
                }
            }
            OpCode::EmptyDict => stack.push(PickleValue::Dict(PickleDict::new())),
            OpCode::Dict => {
                let items = stack.pop_to_mark()?;
                let mut dict = PickleValue::Dict(PickleDict::new());
                insert_items(&mut dict, items, op_code)?;
                stack.push(dict);
            }
            OpCode::SetItem => {
                let value = stack.pop()?;
                let key = stack.pop()?;
                insert_items(stack.last_mut()?, vec![key, value], op_code)?;
            }
            OpCode::SetItems => {
                let items = stack.pop_to_mark()?;
                insert_items(stack.last_mut()?, items, op_code)?;
            }
            OpCode::BinPut => {
                let idx = r.read_u8()? as u32;
                stack.memo_put(idx)?;
            }
            OpCode::LongBinPut => {
                let idx = r.read_u32::<LittleEndian>()?;
                stack.memo_put(idx)?;
            }
            OpCode::Memoize => {
                let idx = stack.memo.len() as u32;
                stack.memo_put(idx)?;
            }
            OpCode::BinGet => {
                let idx = r.read_u8()? as u32;
                stack.memo_get(idx)?;
            }
            OpCode::LongBinGet => {
                let idx = r.read_u32::<LittleEndian>()?;
                stack.memo_get(idx)?;
            }
            OpCode::Global => {
                let module = buf_to_str(read_to_newline(r)?)?;
                let name = buf_to_str(read_to_newline(r)?)?;
                stack.push(PickleValue::Global { module, name });
            }
            OpCode::StackGlobal => {
                let name = stack.pop()?;
                let module = stack.pop()?;
                match (module, name) {
                    (PickleValue::String(module), PickleValue::String(name)) => {
                        stack.push(PickleValue::Global { module, name })
                    }
                    _ => {
                        return Err(PickleError::InvalidData(
                            "STACK_GLOBAL requires two strings".into(),
                        )
                        .into());
                    }
                }
            }
            OpCode::PersId | OpCode::BinPersId => {
                let pid = match op_code {
                    OpCode::PersId => PickleValue::String(buf_to_str(read_to_newline(r)?)?),
                    _ => stack.pop()?,
                };
                let hook = persistent.as_deref_mut().ok_or_else(|| {
                    StoreError::Format("persistent reference without a storage resolver".into())
                })?;
                let value = hook.persistent_load(pid)?;
                stack.push(value);
            }
            OpCode::Reduce | OpCode::NewObj => {
                let args = stack.pop()?;
                let callable = stack.pop()?;
                let value = Constructor::resolve(&callable)?.call(&callable, args)?;
                stack.push(value);
            }
            OpCode::Build => {
                let state = stack.pop()?;
                match (stack.last_mut()?, state) {
                    (PickleValue::OrderedDict(dict), PickleValue::Dict(state))
                    | (PickleValue::OrderedDict(dict), PickleValue::OrderedDict(state)) => {
                        set_state(dict, state)
                    }
                    (PickleValue::OrderedDict(_), PickleValue::None) => {}
                    (PickleValue::Dict(dict), PickleValue::Dict(state)) => {
                        for (key, value) in state {
                            dict.insert(key, value);
                        }
                    }
                    (PickleValue::Tensor(_), PickleValue::None) => {}
                    (PickleValue::Tensor(_), PickleValue::Dict(state)) if state.is_empty() => {}
                    (PickleValue::Tensor(_), PickleValue::OrderedDict(state))
                        if state.is_empty() => {}
                    _ => return Err(PickleError::UnexpectedOpCode(op_code).into()),
                }
            }
        }
    }
    stack.pop()
}
