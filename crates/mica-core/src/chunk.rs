//! Binary chunk serialization
//!
//! A precompiled chunk starts with a non-ASCII signature byte so the
//! loader can distinguish it from textual source. The payload is the
//! recursive prototype encoding, preceded by a crc32 that is verified
//! on load. Chunks round-trip: `load(dump(f))` reproduces `f`'s
//! behavior for chunks whose only upvalue is the environment.

use once_cell::sync::Lazy;

use crate::error::{Status, VmError};
use crate::gc::header::ObjBody;
use crate::interp::{ArithOp, CompareOp, Instr};
use crate::object::{LocVar, Proto, ScriptClosure, Upvalue, UpvalDesc};
use crate::state::RIDX_GLOBALS;
use crate::value::{ObjKind, ObjRef, Value};
use crate::vm::{ThreadId, Vm};
use crate::Flow;

/// First byte of a precompiled chunk: outside the ASCII range.
pub const SIGNATURE_BYTE: u8 = 0x1B;

const SIGNATURE_TAIL: &[u8; 3] = b"Mca";
const CHUNK_VERSION: u8 = 0x10;
const CHUNK_FORMAT: u8 = 0;

/// Complete expected header, assembled once.
static CHUNK_HEADER: Lazy<[u8; 6]> = Lazy::new(|| {
    let mut h = [0u8; 6];
    h[0] = SIGNATURE_BYTE;
    h[1..4].copy_from_slice(SIGNATURE_TAIL);
    h[4] = CHUNK_VERSION;
    h[5] = CHUNK_FORMAT;
    h
});

/// Pull-style chunk source: returns successive blocks, `None` at end.
pub trait Reader {
    fn read_block(&mut self) -> Option<Vec<u8>>;
}

/// Reader over one in-memory slice.
pub struct SliceReader<'a> {
    data: Option<&'a [u8]>,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SliceReader { data: Some(data) }
    }
}

impl Reader for SliceReader<'_> {
    fn read_block(&mut self) -> Option<Vec<u8>> {
        self.data.take().map(|d| d.to_vec())
    }
}

/// Push-style chunk sink.
pub trait Writer {
    fn write_block(&mut self, data: &[u8]) -> Result<(), ()>;
}

impl Writer for Vec<u8> {
    fn write_block(&mut self, data: &[u8]) -> Result<(), ()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// Buffered cursor over a [`Reader`].
pub(crate) struct Source<'a> {
    reader: &'a mut dyn Reader,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> Source<'a> {
    pub(crate) fn new(reader: &'a mut dyn Reader) -> Self {
        Source { reader, buf: Vec::new(), pos: 0 }
    }

    pub(crate) fn next_byte(&mut self) -> Option<u8> {
        loop {
            if self.pos < self.buf.len() {
                let b = self.buf[self.pos];
                self.pos += 1;
                return Some(b);
            }
            match self.reader.read_block() {
                Some(block) if block.is_empty() => continue,
                Some(block) => {
                    self.buf = block;
                    self.pos = 0;
                }
                None => return None,
            }
        }
    }

    /// Drain everything left in the source.
    pub(crate) fn read_all(&mut self) -> Vec<u8> {
        let mut out = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        while let Some(block) = self.reader.read_block() {
            out.extend_from_slice(&block);
        }
        out
    }

    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, VmError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.next_byte().ok_or(VmError::BadChunk)?);
        }
        Ok(out)
    }
}

// ============================================================================
// Encoding
// ============================================================================

struct Enc {
    out: Vec<u8>,
}

impl Enc {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.out.extend_from_slice(&v.to_bits().to_le_bytes());
    }
    fn str_(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.out.extend_from_slice(s.as_bytes());
    }

    fn instr(&mut self, i: Instr) {
        match i {
            Instr::Move { a, b } => {
                self.u8(0);
                self.u8(a);
                self.u8(b);
            }
            Instr::LoadK { a, k } => {
                self.u8(1);
                self.u8(a);
                self.u32(k as u32);
            }
            Instr::LoadBool { a, b, skip } => {
                self.u8(2);
                self.u8(a);
                self.u8(b as u8);
                self.u8(skip as u8);
            }
            Instr::LoadNil { a, n } => {
                self.u8(3);
                self.u8(a);
                self.u8(n);
            }
            Instr::GetUpval { a, b } => {
                self.u8(4);
                self.u8(a);
                self.u8(b);
            }
            Instr::SetUpval { a, b } => {
                self.u8(5);
                self.u8(a);
                self.u8(b);
            }
            Instr::GetTabUp { a, b, k } => {
                self.u8(6);
                self.u8(a);
                self.u8(b);
                self.u32(k as u32);
            }
            Instr::SetTabUp { a, k, b } => {
                self.u8(7);
                self.u8(a);
                self.u32(k as u32);
                self.u8(b);
            }
            Instr::GetTable { a, b, c } => {
                self.u8(8);
                self.u8(a);
                self.u8(b);
                self.u8(c);
            }
            Instr::SetTable { a, b, c } => {
                self.u8(9);
                self.u8(a);
                self.u8(b);
                self.u8(c);
            }
            Instr::NewTable { a, narr, nrec } => {
                self.u8(10);
                self.u8(a);
                self.u8(narr);
                self.u8(nrec);
            }
            Instr::Arith { op, a, b, c } => {
                self.u8(11);
                self.u8(op as u8);
                self.u8(a);
                self.u8(b);
                self.u8(c);
            }
            Instr::Not { a, b } => {
                self.u8(12);
                self.u8(a);
                self.u8(b);
            }
            Instr::Len { a, b } => {
                self.u8(13);
                self.u8(a);
                self.u8(b);
            }
            Instr::Concat { a, b, c } => {
                self.u8(14);
                self.u8(a);
                self.u8(b);
                self.u8(c);
            }
            Instr::Jmp { offset } => {
                self.u8(15);
                self.i32(offset);
            }
            Instr::Cmp { op, expect, b, c } => {
                self.u8(16);
                self.u8(op as u8);
                self.u8(expect as u8);
                self.u8(b);
                self.u8(c);
            }
            Instr::Test { a, expect } => {
                self.u8(17);
                self.u8(a);
                self.u8(expect as u8);
            }
            Instr::Call { a, b, c } => {
                self.u8(18);
                self.u8(a);
                self.u8(b);
                self.u8(c);
            }
            Instr::TailCall { a, b } => {
                self.u8(19);
                self.u8(a);
                self.u8(b);
            }
            Instr::Return { a, b } => {
                self.u8(20);
                self.u8(a);
                self.u8(b);
            }
            Instr::Closure { a, bx } => {
                self.u8(21);
                self.u8(a);
                self.u32(bx as u32);
            }
            Instr::Vararg { a, b } => {
                self.u8(22);
                self.u8(a);
                self.u8(b);
            }
        }
    }
}

fn encode_proto(vm: &Vm, enc: &mut Enc, proto: ObjRef) -> Result<(), VmError> {
    let p = vm.g.heap.proto(proto);
    enc.u32(p.line_defined);
    enc.u32(p.last_line_defined);
    enc.u8(p.num_params);
    enc.u8(p.is_vararg as u8);
    enc.u8(p.max_stack_size);
    enc.u32(p.code.len() as u32);
    for i in &p.code {
        enc.instr(*i);
    }
    enc.u32(p.k.len() as u32);
    for v in &p.k {
        match v {
            Value::Nil => enc.u8(0),
            Value::Boolean(b) => {
                enc.u8(1);
                enc.u8(*b as u8);
            }
            Value::Number(n) => {
                enc.u8(3);
                enc.f64(*n);
            }
            Value::Object(r) if r.kind == ObjKind::Str => {
                enc.u8(4);
                enc.str_(vm.g.heap.str_(*r).as_str());
            }
            _ => return Err(VmError::BadChunk), // unserializable constant
        }
    }
    enc.u32(p.upvalues.len() as u32);
    for d in &p.upvalues {
        enc.u8(d.in_stack as u8);
        enc.u8(d.index);
        match &d.name {
            Some(n) => {
                enc.u8(1);
                enc.str_(n);
            }
            None => enc.u8(0),
        }
    }
    let protos = p.protos.clone();
    enc.u32(protos.len() as u32);
    for sub in protos {
        encode_proto(vm, enc, sub)?;
    }
    // debug information
    let p = vm.g.heap.proto(proto);
    match p.source {
        Some(s) => {
            enc.u8(1);
            enc.str_(vm.g.heap.str_(s).as_str());
        }
        None => enc.u8(0),
    }
    enc.u32(p.line_info.len() as u32);
    for l in &p.line_info {
        enc.u32(*l);
    }
    enc.u32(p.locvars.len() as u32);
    for lv in &p.locvars {
        enc.str_(&lv.name);
        enc.u32(lv.start_pc);
        enc.u32(lv.end_pc);
    }
    Ok(())
}

/// Serialize the script function at the top of the stack through a
/// writer. Returns `Ok` or the writer/shape failure.
pub(crate) fn dump(vm: &Vm, t: ThreadId, w: &mut dyn Writer) -> Result<(), VmError> {
    let th = vm.th(t);
    debug_assert!(th.frame_height() >= 1);
    let v = th.stack[th.top - 1];
    let Some(cl) = v.as_kind(ObjKind::Closure) else {
        return Err(VmError::BadChunk);
    };
    let proto = vm.g.heap.closure(cl).proto;
    let mut enc = Enc { out: Vec::new() };
    encode_proto(vm, &mut enc, proto)?;
    let crc = crc32fast::hash(&enc.out);
    w.write_block(&*CHUNK_HEADER).map_err(|_| VmError::BadChunk)?;
    w.write_block(&crc.to_le_bytes()).map_err(|_| VmError::BadChunk)?;
    w.write_block(&enc.out).map_err(|_| VmError::BadChunk)?;
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

struct Dec<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    fn u8(&mut self) -> Result<u8, VmError> {
        let b = *self.data.get(self.pos).ok_or(VmError::BadChunk)?;
        self.pos += 1;
        Ok(b)
    }
    fn u32(&mut self) -> Result<u32, VmError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(VmError::BadChunk)?;
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }
    fn i32(&mut self) -> Result<i32, VmError> {
        Ok(self.u32()? as i32)
    }
    fn f64(&mut self) -> Result<f64, VmError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 8)
            .ok_or(VmError::BadChunk)?;
        self.pos += 8;
        Ok(f64::from_bits(u64::from_le_bytes(bytes.try_into().expect("8 bytes"))))
    }
    fn str_(&mut self) -> Result<String, VmError> {
        let len = self.u32()? as usize;
        let bytes = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or(VmError::BadChunk)?;
        self.pos += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| VmError::BadChunk)
    }
    fn bool_(&mut self) -> Result<bool, VmError> {
        Ok(self.u8()? != 0)
    }

    fn instr(&mut self) -> Result<Instr, VmError> {
        let op = self.u8()?;
        Ok(match op {
            0 => Instr::Move { a: self.u8()?, b: self.u8()? },
            1 => Instr::LoadK { a: self.u8()?, k: self.u32()? as u16 },
            2 => Instr::LoadBool { a: self.u8()?, b: self.bool_()?, skip: self.bool_()? },
            3 => Instr::LoadNil { a: self.u8()?, n: self.u8()? },
            4 => Instr::GetUpval { a: self.u8()?, b: self.u8()? },
            5 => Instr::SetUpval { a: self.u8()?, b: self.u8()? },
            6 => Instr::GetTabUp { a: self.u8()?, b: self.u8()?, k: self.u32()? as u16 },
            7 => Instr::SetTabUp { a: self.u8()?, k: self.u32()? as u16, b: self.u8()? },
            8 => Instr::GetTable { a: self.u8()?, b: self.u8()?, c: self.u8()? },
            9 => Instr::SetTable { a: self.u8()?, b: self.u8()?, c: self.u8()? },
            10 => Instr::NewTable { a: self.u8()?, narr: self.u8()?, nrec: self.u8()? },
            11 => {
                let op = match self.u8()? {
                    0 => ArithOp::Add,
                    1 => ArithOp::Sub,
                    2 => ArithOp::Mul,
                    3 => ArithOp::Div,
                    4 => ArithOp::Mod,
                    5 => ArithOp::Pow,
                    6 => ArithOp::Unm,
                    _ => return Err(VmError::BadChunk),
                };
                Instr::Arith { op, a: self.u8()?, b: self.u8()?, c: self.u8()? }
            }
            12 => Instr::Not { a: self.u8()?, b: self.u8()? },
            13 => Instr::Len { a: self.u8()?, b: self.u8()? },
            14 => Instr::Concat { a: self.u8()?, b: self.u8()?, c: self.u8()? },
            15 => Instr::Jmp { offset: self.i32()? },
            16 => {
                let op = match self.u8()? {
                    0 => CompareOp::Eq,
                    1 => CompareOp::Lt,
                    2 => CompareOp::Le,
                    _ => return Err(VmError::BadChunk),
                };
                Instr::Cmp { op, expect: self.bool_()?, b: self.u8()?, c: self.u8()? }
            }
            17 => Instr::Test { a: self.u8()?, expect: self.bool_()? },
            18 => Instr::Call { a: self.u8()?, b: self.u8()?, c: self.u8()? },
            19 => Instr::TailCall { a: self.u8()?, b: self.u8()? },
            20 => Instr::Return { a: self.u8()?, b: self.u8()? },
            21 => Instr::Closure { a: self.u8()?, bx: self.u32()? as u16 },
            22 => Instr::Vararg { a: self.u8()?, b: self.u8()? },
            _ => return Err(VmError::BadChunk),
        })
    }
}

fn decode_proto(vm: &mut Vm, t: ThreadId, dec: &mut Dec<'_>) -> Flow<Result<ObjRef, VmError>> {
    macro_rules! bail {
        ($e:expr) => {
            match $e {
                Ok(v) => v,
                Err(e) => return Ok(Err(e)),
            }
        };
    }
    let mut p = Proto::new();
    p.line_defined = bail!(dec.u32());
    p.last_line_defined = bail!(dec.u32());
    p.num_params = bail!(dec.u8());
    p.is_vararg = bail!(dec.bool_());
    p.max_stack_size = bail!(dec.u8());
    let ncode = bail!(dec.u32()) as usize;
    for _ in 0..ncode {
        p.code.push(bail!(dec.instr()));
    }
    let nk = bail!(dec.u32()) as usize;
    for _ in 0..nk {
        let v = match bail!(dec.u8()) {
            0 => Value::Nil,
            1 => Value::Boolean(bail!(dec.bool_())),
            3 => Value::Number(bail!(dec.f64())),
            4 => {
                let s = bail!(dec.str_());
                Value::Object(vm.new_str(t, &s)?)
            }
            _ => return Ok(Err(VmError::BadChunk)),
        };
        p.k.push(v);
    }
    let nup = bail!(dec.u32()) as usize;
    for _ in 0..nup {
        let in_stack = bail!(dec.bool_());
        let index = bail!(dec.u8());
        let name = if bail!(dec.bool_()) {
            Some(bail!(dec.str_()).into_boxed_str())
        } else {
            None
        };
        p.upvalues.push(UpvalDesc { name, in_stack, index });
    }
    let nprotos = bail!(dec.u32()) as usize;
    for _ in 0..nprotos {
        match decode_proto(vm, t, dec)? {
            Ok(sub) => p.protos.push(sub),
            Err(e) => return Ok(Err(e)),
        }
    }
    if bail!(dec.bool_()) {
        let s = bail!(dec.str_());
        p.source = Some(vm.new_str(t, &s)?);
    }
    let nlines = bail!(dec.u32()) as usize;
    for _ in 0..nlines {
        p.line_info.push(bail!(dec.u32()));
    }
    let nloc = bail!(dec.u32()) as usize;
    for _ in 0..nloc {
        let name = bail!(dec.str_()).into_boxed_str();
        let start_pc = bail!(dec.u32());
        let end_pc = bail!(dec.u32());
        p.locvars.push(LocVar { name, start_pc, end_pc });
    }
    let r = vm.alloc_obj(t, ObjBody::Proto(p))?;
    Ok(Ok(r))
}

fn syntax_error(vm: &mut Vm, t: ThreadId, msg: &str) -> crate::Control {
    match vm.new_str(t, msg) {
        Ok(r) => {
            let th = vm.th_mut(t);
            th.stack[th.top] = Value::Object(r);
            th.top += 1;
            vm.throw(t, Status::SyntaxErr)
        }
        Err(c) => c,
    }
}

fn check_mode(vm: &mut Vm, t: ThreadId, mode: Option<&str>, what: &str) -> Flow<()> {
    if let Some(m) = mode {
        let ch = if what == "binary" { 'b' } else { 't' };
        if !m.contains(ch) {
            return Err(syntax_error(
                vm,
                t,
                &format!("attempt to load a {} chunk (mode is '{}')", what, m),
            ));
        }
    }
    Ok(())
}

/// Parse a chunk from a source and leave the resulting closure at the
/// top of the stack, its upvalues instantiated (closed over nil).
pub(crate) fn parse_chunk(
    vm: &mut Vm,
    t: ThreadId,
    source: &mut Source<'_>,
    chunkname: &str,
    mode: Option<&str>,
) -> Flow<()> {
    let Some(first) = source.next_byte() else {
        return Err(syntax_error(vm, t, &format!("{}: empty chunk", chunkname)));
    };
    let proto = if first == SIGNATURE_BYTE {
        check_mode(vm, t, mode, "binary")?;
        let rest = source.read_all();
        undump(vm, t, first, &rest, chunkname)?
    } else {
        check_mode(vm, t, mode, "text")?;
        let Some(compile) = vm.g.compiler else {
            return Err(syntax_error(
                vm,
                t,
                &format!("{}: no compiler installed for text chunks", chunkname),
            ));
        };
        let mut src = vec![first];
        src.extend_from_slice(&source.read_all());
        match compile(vm, t, &src, chunkname) {
            Ok(p) => p,
            Err(msg) => return Err(syntax_error(vm, t, &msg)),
        }
    };
    // instantiate the closure with fresh upvalue cells
    let nup = vm.g.heap.proto(proto).upvalues.len();
    let mut upvals = Vec::with_capacity(nup);
    for _ in 0..nup {
        upvals.push(vm.alloc_obj(t, ObjBody::Upvalue(Upvalue::Closed(Value::Nil)))?);
    }
    let cl = vm.alloc_obj(t, ObjBody::Closure(ScriptClosure { proto, upvals }))?;
    crate::exec::stack::reserve(vm, t, 1)?;
    let th = vm.th_mut(t);
    th.stack[th.top] = Value::Object(cl);
    th.top += 1;
    Ok(())
}

fn undump(
    vm: &mut Vm,
    t: ThreadId,
    first: u8,
    rest: &[u8],
    chunkname: &str,
) -> Flow<ObjRef> {
    let header = &*CHUNK_HEADER;
    let ok = first == header[0]
        && rest.len() >= header.len() - 1 + 4
        && rest[..header.len() - 1] == header[1..];
    if !ok {
        return Err(syntax_error(
            vm,
            t,
            &format!("{}: bad header in precompiled chunk", chunkname),
        ));
    }
    let crc_off = header.len() - 1;
    let crc = u32::from_le_bytes(rest[crc_off..crc_off + 4].try_into().expect("4 bytes"));
    let payload = &rest[crc_off + 4..];
    if crc32fast::hash(payload) != crc {
        return Err(syntax_error(
            vm,
            t,
            &format!("{}: corrupted precompiled chunk", chunkname),
        ));
    }
    let mut dec = Dec { data: payload, pos: 0 };
    match decode_proto(vm, t, &mut dec)? {
        Ok(proto) => Ok(proto),
        Err(_) => Err(syntax_error(
            vm,
            t,
            &format!("{}: truncated precompiled chunk", chunkname),
        )),
    }
}

/// Protected load: parse under a protected, non-yieldable scope and,
/// on success, bind a single upvalue to the globals table (the chunk's
/// default environment).
pub(crate) fn protected_load(
    vm: &mut Vm,
    t: ThreadId,
    reader: &mut dyn Reader,
    chunkname: &str,
    mode: Option<&str>,
) -> Status {
    vm.th_mut(t).nny += 1; // cannot yield during parsing
    let old_top = vm.th(t).top;
    let errfunc = vm.th(t).errfunc;
    let mut source = Source::new(reader);
    let status = crate::exec::protect::pcall_raw(
        vm,
        t,
        |vm, t| parse_chunk(vm, t, &mut source, chunkname, mode),
        old_top,
        errfunc,
    );
    vm.th_mut(t).nny -= 1;
    if status == Status::Ok {
        // bind the environment upvalue
        let th = vm.th(t);
        let cl = th.stack[th.top - 1]
            .as_kind(ObjKind::Closure)
            .expect("load leaves a closure on success");
        if vm.g.heap.closure(cl).upvals.len() == 1 {
            let globals = vm
                .g
                .heap
                .table(vm.registry_ref())
                .get_int(RIDX_GLOBALS);
            let up = vm.g.heap.closure(cl).upvals[0];
            *vm.g.heap.upvalue_mut(up) = Upvalue::Closed(globals);
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_non_ascii() {
        assert!(!CHUNK_HEADER[0].is_ascii_alphanumeric());
        assert!(CHUNK_HEADER[0] >= 0x1B);
    }

    #[test]
    fn test_source_pulls_blocks() {
        struct Two {
            n: usize,
        }
        impl Reader for Two {
            fn read_block(&mut self) -> Option<Vec<u8>> {
                self.n += 1;
                match self.n {
                    1 => Some(vec![1, 2]),
                    2 => Some(vec![]),
                    3 => Some(vec![3]),
                    _ => None,
                }
            }
        }
        let mut r = Two { n: 0 };
        let mut s = Source::new(&mut r);
        assert_eq!(s.next_byte(), Some(1));
        assert_eq!(s.read_all(), vec![2, 3]);
        assert_eq!(s.next_byte(), None);
    }

    #[test]
    fn test_instr_roundtrip() {
        let instrs = vec![
            Instr::LoadK { a: 1, k: 300 },
            Instr::Arith { op: ArithOp::Mod, a: 0, b: 1, c: 2 },
            Instr::Cmp { op: CompareOp::Le, expect: true, b: 3, c: 4 },
            Instr::Jmp { offset: -5 },
            Instr::Return { a: 0, b: 2 },
        ];
        let mut enc = Enc { out: Vec::new() };
        for i in &instrs {
            enc.instr(*i);
        }
        let mut dec = Dec { data: &enc.out, pos: 0 };
        for want in &instrs {
            assert_eq!(dec.instr().unwrap(), *want);
        }
    }
}
