//! Module tree, parameters and backward-pass replay.

use super::hooks::{HookHandle, HookKind, HookRegistry};
use super::tensor::Tensor;
use crate::error::HookError;
use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Gradient hook on a parameter. `None` means no gradient reached the
/// parameter on this pass.
pub type GradHook = Box<dyn FnMut(Option<&Tensor>)>;

/// Backward hook on a module: `(module, grad_input, grad_output)`.
pub type BackwardHook = Box<dyn FnMut(&Module, &[Tensor], &[Tensor])>;

/// Join a module path and a parameter name. The unnamed root contributes no prefix.
pub fn qualify(module: &str, name: &str) -> String {
    if module.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", module, name)
    }
}

/// A shared handle to a weight tensor.
///
/// Clones refer to the same storage, flag and hook registry.
#[derive(Clone)]
pub struct Parameter {
    data: Rc<RefCell<Tensor>>,
    requires_grad: Rc<Cell<bool>>,
    hooks: HookRegistry<GradHook>,
}

impl Parameter {
    /// A trainable parameter.
    pub fn new(tensor: Tensor) -> Self {
        Self {
            data: Rc::new(RefCell::new(tensor)),
            requires_grad: Rc::new(Cell::new(true)),
            hooks: HookRegistry::new(HookKind::Gradient),
        }
    }

    /// A parameter excluded from gradient computation.
    pub fn frozen(tensor: Tensor) -> Self {
        let param = Self::new(tensor);
        param.set_requires_grad(false);
        param
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad.get()
    }

    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.requires_grad.set(requires_grad);
    }

    pub fn tensor(&self) -> Ref<'_, Tensor> {
        self.data.borrow()
    }

    /// Mutate the underlying tensor in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut Tensor) -> R) -> R {
        f(&mut self.data.borrow_mut())
    }

    pub fn norm(&self) -> f64 {
        self.data.borrow().norm()
    }

    pub fn numel(&self) -> usize {
        self.data.borrow().numel()
    }

    /// A non-owning view, for callbacks that must not keep the weights alive.
    pub fn downgrade(&self) -> WeakParameter {
        WeakParameter {
            data: Rc::downgrade(&self.data),
        }
    }

    /// Register a gradient hook. Fails for parameters that do not require gradients.
    pub fn register_hook(&self, hook: GradHook) -> Result<HookHandle, HookError> {
        if !self.requires_grad() {
            return Err(HookError::NotTrainable);
        }
        Ok(self.hooks.register(hook))
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// True when both handles refer to the same storage (tied weights).
    pub fn shares_storage(&self, other: &Parameter) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    fn fire(&self, gradient: Option<&Tensor>) {
        self.hooks.dispatch(|hook| hook(gradient));
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("shape", &self.data.borrow().shape())
            .field("requires_grad", &self.requires_grad())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Weak counterpart of [`Parameter`].
#[derive(Debug, Clone)]
pub struct WeakParameter {
    data: Weak<RefCell<Tensor>>,
}

impl WeakParameter {
    /// Current norm, or `None` if the parameter is gone.
    pub fn norm(&self) -> Option<f64> {
        self.data.upgrade().map(|data| data.borrow().norm())
    }
}

/// A node in the model tree.
pub struct Module {
    kind: String,
    children: Vec<(String, Module)>,
    parameters: Vec<(String, Parameter)>,
    hooks: HookRegistry<BackwardHook>,
}

impl Module {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            children: Vec::new(),
            parameters: Vec::new(),
            hooks: HookRegistry::new(HookKind::Backward),
        }
    }

    pub fn with_child(mut self, name: impl Into<String>, child: Module) -> Self {
        self.add_child(name, child);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, parameter: Parameter) -> Self {
        self.add_parameter(name, parameter);
        self
    }

    pub fn add_child(&mut self, name: impl Into<String>, child: Module) {
        self.children.push((name.into(), child));
    }

    pub fn add_parameter(&mut self, name: impl Into<String>, parameter: Parameter) {
        self.parameters.push((name.into(), parameter));
    }

    /// Type label, e.g. `Linear` or `ReLU`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &Module)> {
        self.children.iter().map(|(n, m)| (n.as_str(), m))
    }

    pub fn child(&self, name: &str) -> Option<&Module> {
        self.children().find(|(n, _)| *n == name).map(|(_, m)| m)
    }

    /// True when the module has no child modules, whether or not it owns parameters.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Parameters owned directly by this module.
    pub fn named_parameters(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.parameters.iter().map(|(n, p)| (n.as_str(), p))
    }

    /// Every module in the tree, pre-order, with its qualified name.
    /// The root itself is yielded first under `""`.
    pub fn named_modules(&self) -> Vec<(String, &Module)> {
        let mut out = Vec::new();
        self.collect_modules(String::new(), &mut out);
        out
    }

    fn collect_modules<'a>(&'a self, name: String, out: &mut Vec<(String, &'a Module)>) {
        out.push((name.clone(), self));
        for (child_name, child) in &self.children {
            child.collect_modules(qualify(&name, child_name), out);
        }
    }

    /// Every parameter in the tree with its qualified name.
    pub fn all_parameters(&self) -> Vec<(String, &Parameter)> {
        self.named_modules()
            .into_iter()
            .flat_map(|(module_name, module)| {
                module
                    .named_parameters()
                    .map(move |(name, param)| (qualify(&module_name, name), param))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn register_backward_hook(&self, hook: BackwardHook) -> HookHandle {
        self.hooks.register(hook)
    }

    pub fn backward_hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// Total hooks registered anywhere in the tree.
    pub fn total_hook_count(&self) -> usize {
        self.named_modules()
            .iter()
            .map(|(_, m)| {
                m.backward_hook_count()
                    + m.named_parameters().map(|(_, p)| p.hook_count()).sum::<usize>()
            })
            .sum()
    }

    /// Replay a backward pass through the registered hooks.
    ///
    /// Modules are visited in traversal order. Each trainable parameter's
    /// gradient hooks fire with its gradient from `pass` (or `None`), then the
    /// module's backward hooks fire if `pass` carries module gradients for it.
    /// A parameter shared by several modules fires once, under the name of
    /// its first owner.
    pub fn run_backward(&self, pass: &BackwardPass) {
        let mut fired: Vec<&Parameter> = Vec::new();
        for (name, module) in self.named_modules() {
            for (param_name, param) in module.named_parameters() {
                if !param.requires_grad() || fired.iter().any(|p| p.shares_storage(param)) {
                    continue;
                }
                fired.push(param);
                param.fire(pass.gradient(&qualify(&name, param_name)));
            }

            if let Some((grad_input, grad_output)) = pass.module_grads(&name) {
                module
                    .hooks
                    .dispatch(|hook| hook(module, grad_input, grad_output));
            }
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("kind", &self.kind)
            .field("children", &self.children)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Gradients produced by one backward pass.
#[derive(Debug, Clone, Default)]
pub struct BackwardPass {
    gradients: HashMap<String, Tensor>,
    module_grads: HashMap<String, (Vec<Tensor>, Vec<Tensor>)>,
}

impl BackwardPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gradient for the parameter with the given qualified name.
    pub fn set_gradient(&mut self, name: impl Into<String>, gradient: Tensor) {
        self.gradients.insert(name.into(), gradient);
    }

    pub fn with_gradient(mut self, name: impl Into<String>, gradient: Tensor) -> Self {
        self.set_gradient(name, gradient);
        self
    }

    /// Gradients w.r.t. a module's inputs and outputs.
    pub fn set_module_grads(
        &mut self,
        module: impl Into<String>,
        grad_input: Vec<Tensor>,
        grad_output: Vec<Tensor>,
    ) {
        self.module_grads
            .insert(module.into(), (grad_input, grad_output));
    }

    pub fn gradient(&self, name: &str) -> Option<&Tensor> {
        self.gradients.get(name)
    }

    pub fn module_grads(&self, module: &str) -> Option<(&[Tensor], &[Tensor])> {
        self.module_grads
            .get(module)
            .map(|(i, o)| (i.as_slice(), o.as_slice()))
    }
}
