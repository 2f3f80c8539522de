//! Call, return, and protected-call engine
//!
//! The modules here own the interlock the rest of the runtime depends
//! on: stack sizing (`stack`), the precall/postcall protocol (`call`),
//! protected execution and error propagation (`protect`), and the
//! coroutine scheduler (`coroutine`).

pub mod call;
pub mod coroutine;
pub mod protect;
pub mod stack;
