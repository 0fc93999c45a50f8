use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::LuaError;
use crate::opcode::OpCode;

/// Leading bytes of a dumped chunk.
pub const SIGNATURE: &[u8; 4] = b"\x1bLuB";
pub const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Number(f64),
    String(Arc<str>),
}

/// Where a closure finds an upvalue when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpvalDesc {
    /// A slot of the enclosing function.
    Local(u16),
    /// An upvalue of the enclosing function.
    Upval(u16),
}

/// A compiled function body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proto {
    pub name: Arc<str>,
    pub source: Arc<str>,
    pub line_defined: u32,
    pub num_params: u16,
    pub is_vararg: bool,
    pub num_slots: u16,
    pub code: Vec<OpCode>,
    /// Source line of each instruction.
    pub lines: Vec<u32>,
    pub constants: Vec<Constant>,
    pub protos: Vec<Arc<Proto>>,
    pub upvalues: Vec<UpvalDesc>,
}

impl Default for Proto {
    fn default() -> Self {
        Self {
            name: Arc::from("?"),
            source: Arc::from("?"),
            line_defined: 0,
            num_params: 0,
            is_vararg: false,
            num_slots: 0,
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
        }
    }
}

impl Proto {
    #[inline]
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(self.line_defined)
    }

    pub fn is_main(&self) -> bool {
        self.line_defined == 0
    }
}

/// Returns true when `bytes` look like a dumped chunk rather than source text.
pub fn is_binary(bytes: &[u8]) -> bool {
    bytes.first() == Some(&SIGNATURE[0])
}

pub fn dump(proto: &Proto) -> Result<Vec<u8>, LuaError> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(SIGNATURE);
    out.push(FORMAT_VERSION);
    let body = bincode::serialize(proto).map_err(|e| {
        log::error!("dump: {e}");
        LuaError::Dump
    })?;
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn undump(bytes: &[u8], chunk: &str) -> Result<Proto, LuaError> {
    if bytes.len() < SIGNATURE.len() + 1 || &bytes[..SIGNATURE.len()] != SIGNATURE {
        return Err(LuaError::Undump(format!("{chunk}: bad header in precompiled chunk")));
    }
    let version = bytes[SIGNATURE.len()];
    if version != FORMAT_VERSION {
        return Err(LuaError::Undump(format!(
            "{chunk}: bad header in precompiled chunk (version {version})"
        )));
    }
    let proto: Proto = bincode::deserialize(&bytes[SIGNATURE.len() + 1..])
        .map_err(|e| LuaError::Undump(format!("{chunk}: bad binary format ({e})")))?;
    if !proto.upvalues.is_empty() {
        // a loaded chunk is closed over nothing
        return Err(LuaError::Undump(format!(
            "{chunk}: bad binary format (main chunk declares upvalues)"
        )));
    }
    validate(&proto)
        .map_err(|what| LuaError::Undump(format!("{chunk}: bad binary format ({what})")))?;
    Ok(proto)
}

/// Rejects prototypes whose operands point outside their tables, so the
/// interpreter may index them without checks failing mid-run.
fn validate(proto: &Proto) -> Result<(), &'static str> {
    use OpCode::*;
    if proto.code.len() != proto.lines.len() {
        return Err("line info mismatch");
    }
    let nk = proto.constants.len() as u32;
    let ns = proto.num_slots as u32;
    let nu = proto.upvalues.len() as u32;
    let np = proto.protos.len() as u32;
    let nc = proto.code.len() as u32;
    for op in &proto.code {
        let ok = match *op {
            Const(k) | GetGlobal(k) | SetGlobal(k) | SelfMethod(k) => k < nk,
            GetLocal(s) | SetLocal(s) | NewLocal(s) => (s as u32) < ns,
            GetUpval(u) | SetUpval(u) => (u as u32) < nu,
            ForPrep(b) | ForStep(b) => b as u32 + 2 < ns,
            ForTest { base, exit } => base as u32 + 3 < ns && exit <= nc,
            Closure(p) => p < np,
            Jump(t) | JumpIfFalse(t) | JumpIfNil(t) | AndJump(t) | OrJump(t) => t <= nc,
            _ => true,
        };
        if !ok {
            return Err("operand out of range");
        }
    }
    for child in &proto.protos {
        let captures_ok = child.upvalues.iter().all(|d| match *d {
            UpvalDesc::Local(s) => (s as u32) < ns,
            UpvalDesc::Upval(u) => (u as u32) < nu,
        });
        if !captures_ok {
            return Err("upvalue out of range");
        }
        validate(child)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_checked() {
        let err = undump(b"\x1bLuA\x01", "c").unwrap_err();
        assert_eq!(err.to_string(), "c: bad header in precompiled chunk");
        let err = undump(b"\x1bLuB\x09", "c").unwrap_err();
        assert!(err.to_string().contains("version 9"));
    }

    #[test]
    fn dump_then_undump() {
        let proto = Proto {
            name: Arc::from("main chunk"),
            source: Arc::from("t"),
            code: vec![OpCode::Const(0), OpCode::Return(crate::opcode::Count::Fixed(1))],
            lines: vec![1, 1],
            constants: vec![Constant::Number(41.0)],
            is_vararg: true,
            ..Default::default()
        };
        let bytes = dump(&proto).unwrap();
        assert!(bytes.starts_with(SIGNATURE));
        let back = undump(&bytes, "t").unwrap();
        assert_eq!(back.code, proto.code);
        assert_eq!(back.constants, proto.constants);
    }

    #[test]
    fn out_of_range_operands_are_rejected() {
        let proto = Proto {
            code: vec![OpCode::Const(3)],
            lines: vec![1],
            ..Default::default()
        };
        let bytes = dump(&proto).unwrap();
        assert!(undump(&bytes, "t").is_err());
    }

    #[test]
    fn main_chunk_with_upvalues_is_rejected() {
        let proto = Proto {
            code: vec![OpCode::GetUpval(0), OpCode::Return(crate::opcode::Count::Fixed(1))],
            lines: vec![1, 1],
            upvalues: vec![UpvalDesc::Local(0)],
            num_slots: 1,
            ..Default::default()
        };
        let bytes = dump(&proto).unwrap();
        let err = undump(&bytes, "t").unwrap_err();
        assert_eq!(
            err.to_string(),
            "t: bad binary format (main chunk declares upvalues)"
        );
    }
}
