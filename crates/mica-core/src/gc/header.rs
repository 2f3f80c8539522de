//! Object headers
//!
//! Every arena slot holds a [`GcBox`]: the header the collector works
//! with plus the object body. The header's `kind` always matches the
//! body variant; values referencing the slot carry the same kind.

use crate::object::{HostClosure, Proto, ScriptClosure, StrObject, Table, Upvalue, Userdata};
use crate::value::ObjKind;
use crate::vm::ThreadId;

/// Per-object collector metadata.
#[derive(Debug, Clone, Copy)]
pub struct GcHeader {
    /// Object kind, mirrored into every `ObjRef` pointing here
    pub kind: ObjKind,
    /// Mark bit (reachable in the current cycle)
    pub marked: bool,
    /// Never collected (tag-method names, the memory-error message)
    pub fixed: bool,
    /// Finalizer already ran; do not run it again
    pub finalized: bool,
    /// Linked in the finalization-pending list
    pub in_finobj: bool,
}

impl GcHeader {
    pub fn new(kind: ObjKind) -> Self {
        GcHeader {
            kind,
            marked: false,
            fixed: false,
            finalized: false,
            in_finobj: false,
        }
    }
}

/// Body of a collectable object.
pub enum ObjBody {
    Str(StrObject),
    Table(Table),
    Userdata(Userdata),
    Proto(Proto),
    Closure(ScriptClosure),
    HostClosure(HostClosure),
    Upvalue(Upvalue),
    /// Thread objects point into the runtime's thread slab; the slab
    /// entry is freed when the object is swept.
    Thread(ThreadId),
}

impl ObjBody {
    pub fn kind(&self) -> ObjKind {
        match self {
            ObjBody::Str(_) => ObjKind::Str,
            ObjBody::Table(_) => ObjKind::Table,
            ObjBody::Userdata(_) => ObjKind::Userdata,
            ObjBody::Proto(_) => ObjKind::Proto,
            ObjBody::Closure(_) => ObjKind::Closure,
            ObjBody::HostClosure(_) => ObjKind::HostClosure,
            ObjBody::Upvalue(_) => ObjKind::Upvalue,
            ObjBody::Thread(_) => ObjKind::Thread,
        }
    }

    /// Approximate heap footprint in bytes, used for GC accounting.
    pub fn footprint(&self) -> usize {
        match self {
            ObjBody::Str(s) => s.footprint(),
            ObjBody::Table(t) => t.footprint(),
            ObjBody::Userdata(u) => u.footprint(),
            ObjBody::Proto(p) => p.footprint(),
            ObjBody::Closure(c) => {
                std::mem::size_of::<ScriptClosure>() + c.upvals.capacity() * std::mem::size_of::<u64>()
            }
            ObjBody::HostClosure(c) => {
                std::mem::size_of::<HostClosure>()
                    + c.upvals.capacity() * std::mem::size_of::<crate::Value>()
            }
            ObjBody::Upvalue(_) => std::mem::size_of::<Upvalue>() + 16,
            ObjBody::Thread(_) => 256,
        }
    }
}

/// One arena slot: header plus body.
pub struct GcBox {
    pub header: GcHeader,
    pub body: ObjBody,
}

impl GcBox {
    pub fn new(body: ObjBody) -> Self {
        GcBox {
            header: GcHeader::new(body.kind()),
            body,
        }
    }
}
