//! Minimal host-framework contract.
//!
//! Provides just enough of a training framework for the aggregator to hook
//! into: a module tree with named parameters, dense tensors, callback
//! registries that hand out releasable handles, and a way to replay a
//! backward pass through those callbacks. Computing gradients is left to the
//! caller.

pub mod hooks;
pub mod module;
pub mod tensor;

pub use hooks::{HookHandle, HookKind, HookRegistry};
pub use module::{qualify, BackwardHook, BackwardPass, GradHook, Module, Parameter, WeakParameter};
pub use tensor::Tensor;
