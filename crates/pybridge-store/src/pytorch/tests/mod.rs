mod reader;

use std::io::Cursor;

use crate::archive::ArchiveWriter;
use crate::pytorch::OpCode;

/// Assembles pickle programs opcode by opcode, the way `torch.save` emits them.
pub(super) struct Pickler {
    out: Vec<u8>,
}

impl Pickler {
    pub fn new() -> Self {
        Self {
            out: vec![OpCode::Proto as u8, 2],
        }
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.out.push(op as u8);
        self
    }

    pub fn global(&mut self, module: &str, name: &str) -> &mut Self {
        self.op(OpCode::Global);
        self.out.extend_from_slice(module.as_bytes());
        self.out.push(b'\n');
        self.out.extend_from_slice(name.as_bytes());
        self.out.push(b'\n');
        self
    }

    pub fn str(&mut self, value: &str) -> &mut Self {
        self.op(OpCode::BinUnicode);
        self.out
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.out.extend_from_slice(value.as_bytes());
        self
    }

    pub fn int(&mut self, value: u8) -> &mut Self {
        self.op(OpCode::BinInt1);
        self.out.push(value);
        self
    }

    pub fn long(&mut self, value: i64) -> &mut Self {
        self.op(OpCode::Long1);
        self.out.push(8);
        self.out.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn int_tuple(&mut self, values: &[u8]) -> &mut Self {
        self.op(OpCode::Mark);
        for value in values {
            self.int(*value);
        }
        self.op(OpCode::Tuple)
    }

    pub fn ordered_dict(&mut self) -> &mut Self {
        self.global("collections", "OrderedDict")
            .op(OpCode::EmptyTuple)
            .op(OpCode::Reduce)
    }

    /// `_rebuild_tensor_v2(storage, offset, size, stride, False, OrderedDict())`.
    pub fn tensor(&mut self, view: &View) -> &mut Self {
        self.global("torch._utils", view.rebuild).op(OpCode::Mark);
        self.persistent_storage(view.class, view.key, view.numel);
        self.int(view.offset)
            .int_tuple(view.shape)
            .int_tuple(view.strides)
            .op(OpCode::NewFalse)
            .ordered_dict()
            .op(OpCode::Tuple)
            .op(OpCode::Reduce)
    }

    pub fn persistent_storage(&mut self, class: &str, key: &str, numel: u8) -> &mut Self {
        self.op(OpCode::Mark)
            .str("storage")
            .global("torch", class)
            .str(key)
            .str("cpu")
            .int(numel)
            .op(OpCode::Tuple)
            .op(OpCode::BinPersId)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        self.op(OpCode::Stop);
        std::mem::take(&mut self.out)
    }
}

/// One `_rebuild_tensor_v2` call.
pub(super) struct View<'a> {
    pub rebuild: &'a str,
    pub class: &'a str,
    pub key: &'a str,
    pub numel: u8,
    pub offset: u8,
    pub shape: &'a [u8],
    pub strides: &'a [u8],
}

impl<'a> View<'a> {
    pub fn new(class: &'a str, key: &'a str, numel: u8, shape: &'a [u8], strides: &'a [u8]) -> Self {
        Self {
            rebuild: "_rebuild_tensor_v2",
            class,
            key,
            numel,
            offset: 0,
            shape,
            strides,
        }
    }

    pub fn offset(mut self, offset: u8) -> Self {
        self.offset = offset;
        self
    }
}

/// Zip a pickle program and its storages under the `model/` prefix.
pub(super) fn zip_checkpoint(program: &[u8], storages: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut archive = ArchiveWriter::new(Cursor::new(Vec::new()), "model");
    archive.write_entry("data.pkl", program).unwrap();
    for (key, bytes) in storages {
        archive.write_entry(&format!("data/{key}"), bytes).unwrap();
    }
    archive.write_entry("version", b"3\n").unwrap();
    archive.finish().unwrap().into_inner()
}

pub(super) fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(super) fn f64_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
