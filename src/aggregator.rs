//! Sampled gradient statistics.
//!
//! [`HookAggregator`] attaches hooks to every leaf module of a model, keeps
//! the latest gradient and weight norm per parameter, and flushes them to a
//! [`Monitor`] every `every_n_steps` ticks. Hooks live only as long as the
//! [`HookScope`] returned by [`HookAggregator::enter`].

use crate::error::{GradtopError, HookError, Result};
use crate::models::{MetricReport, ParamStat};
use crate::monitor::Monitor;
use crate::nn::{qualify, BackwardHook, HookHandle, Module, Tensor};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Values recorded by hooks since the last flush.
#[derive(Debug, Default)]
struct Sample {
    params: BTreeMap<String, ParamStat>,
    activations: BTreeMap<String, f64>,
}

/// Collects per-parameter norms from hooks and reports them periodically.
pub struct HookAggregator<'m, M> {
    model: &'m Module,
    every_n_steps: u64,
    step: u64,
    sample: Rc<RefCell<Sample>>,
    activation_stats: bool,
    monitor: M,
}

impl<'m, M: Monitor> HookAggregator<'m, M> {
    /// Create an aggregator for `model` that flushes every `every_n_steps` ticks.
    pub fn new(model: &'m Module, every_n_steps: usize, monitor: M) -> Result<Self> {
        if every_n_steps == 0 {
            return Err(GradtopError::InvalidInterval);
        }

        Ok(Self {
            model,
            every_n_steps: every_n_steps as u64,
            step: 0,
            sample: Rc::new(RefCell::new(Sample::default())),
            activation_stats: false,
            monitor,
        })
    }

    /// Record the share of non-positive output gradients per leaf module.
    pub fn with_activation_stats(mut self, enabled: bool) -> Self {
        self.activation_stats = enabled;
        self
    }

    /// Attach hooks to the model.
    ///
    /// Every leaf module gets one backward hook, and every trainable
    /// parameter it owns directly gets one gradient hook. The hooks are
    /// released when the returned scope is released or dropped, including
    /// when registration fails partway through.
    pub fn enter(&mut self) -> Result<HookScope<'_, 'm, M>> {
        let model = self.model;
        let sample = Rc::clone(&self.sample);
        let activation_stats = self.activation_stats;

        let mut scope = HookScope {
            aggregator: self,
            handles: Vec::new(),
        };

        let mut leaves = 0usize;
        for (name, module) in model.named_modules() {
            if !module.is_leaf() {
                continue;
            }
            leaves += 1;

            let hook = backward_hook(&name, &sample, activation_stats);
            scope.handles.push(module.register_backward_hook(hook));

            for (param_name, param) in module.named_parameters() {
                if !param.requires_grad() {
                    trace!("Skipping frozen parameter {}", qualify(&name, param_name));
                    continue;
                }

                let key = qualify(&name, param_name);
                let weights = param.downgrade();
                let sample = Rc::clone(&sample);
                let handle = param.register_hook(Box::new(move |grad: Option<&Tensor>| {
                    let Some(grad) = grad else { return };
                    let Some(weight_norm) = weights.norm() else { return };
                    sample.borrow_mut().params.insert(
                        key.clone(),
                        ParamStat {
                            grad_norm: grad.norm(),
                            weight_norm,
                        },
                    );
                }))?;
                scope.handles.push(handle);
            }
        }

        debug!(
            "Attached {} hooks across {} leaf modules",
            scope.handles.len(),
            leaves
        );
        Ok(scope)
    }

    /// Advance the step counter and flush on every `every_n_steps`-th call.
    ///
    /// Returns `true` when a report was sent. The sample is cleared on every
    /// flush, including when the monitor returns an error.
    pub fn tick(&mut self, loss: f64) -> Result<bool> {
        self.step += 1;
        if self.step % self.every_n_steps != 0 {
            return Ok(false);
        }

        let sample = std::mem::take(&mut *self.sample.borrow_mut());
        let report = MetricReport::new(self.step, loss, sample.params, sample.activations);
        trace!("Flushing {} parameters at step {}", report.len(), self.step);

        self.monitor.tick(&report)?;
        Ok(true)
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn every_n_steps(&self) -> u64 {
        self.every_n_steps
    }

    /// Parameters with a recorded value since the last flush.
    pub fn pending(&self) -> usize {
        self.sample.borrow().params.len()
    }

    pub fn monitor(&self) -> &M {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut M {
        &mut self.monitor
    }

    pub fn into_monitor(self) -> M {
        self.monitor
    }
}

fn backward_hook(
    name: &str,
    sample: &Rc<RefCell<Sample>>,
    activation_stats: bool,
) -> BackwardHook {
    if !activation_stats {
        return Box::new(|_: &Module, _: &[Tensor], _: &[Tensor]| {});
    }

    let name = name.to_string();
    let sample = Rc::clone(sample);
    Box::new(move |_: &Module, _: &[Tensor], grad_output: &[Tensor]| {
        if let Some(output) = grad_output.first() {
            sample
                .borrow_mut()
                .activations
                .insert(name.clone(), output.fraction_non_positive());
        }
    })
}

/// Guard holding the hooks registered by [`HookAggregator::enter`].
///
/// Derefs to the aggregator so the training loop can `tick` through it.
pub struct HookScope<'a, 'm, M> {
    aggregator: &'a mut HookAggregator<'m, M>,
    handles: Vec<HookHandle>,
}

impl<'a, 'm, M> HookScope<'a, 'm, M> {
    /// Number of hooks currently held.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Release every hook now, returning the first failure.
    pub fn release(mut self) -> Result<(), HookError> {
        self.release_all()
    }

    fn release_all(&mut self) -> Result<(), HookError> {
        let mut first_error = None;
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.remove() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<'a, 'm, M> Deref for HookScope<'a, 'm, M> {
    type Target = HookAggregator<'m, M>;

    fn deref(&self) -> &Self::Target {
        &*self.aggregator
    }
}

impl<'a, 'm, M> DerefMut for HookScope<'a, 'm, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.aggregator
    }
}

impl<'a, 'm, M> Drop for HookScope<'a, 'm, M> {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        if let Err(e) = self.release_all() {
            warn!("Failed to release hooks on scope exit: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MemoryMonitor;
    use crate::nn::{BackwardPass, Parameter};

    fn two_param_model() -> Module {
        Module::new("Root")
            .with_child(
                "a",
                Module::new("Linear")
                    .with_parameter("w", Parameter::new(Tensor::from_vec(vec![3.0, 4.0]))),
            )
            .with_child(
                "b",
                Module::new("Linear")
                    .with_parameter("w", Parameter::new(Tensor::from_vec(vec![1.0]))),
            )
    }

    fn grads(a: f32, b: f32) -> BackwardPass {
        BackwardPass::new()
            .with_gradient("a.w", Tensor::from_vec(vec![a]))
            .with_gradient("b.w", Tensor::from_vec(vec![b]))
    }

    #[test]
    fn test_zero_interval_rejected() {
        let model = two_param_model();
        let result = HookAggregator::new(&model, 0, MemoryMonitor::new());
        assert!(matches!(result, Err(GradtopError::InvalidInterval)));
    }

    #[test]
    fn test_flush_count_is_floor_of_ticks_over_interval() {
        let model = two_param_model();
        for n in 1..=5usize {
            for k in 0..=12u64 {
                let mut aggregator =
                    HookAggregator::new(&model, n, MemoryMonitor::new()).unwrap();
                let mut flushed = 0;
                for _ in 0..k {
                    if aggregator.tick(0.1).unwrap() {
                        flushed += 1;
                    }
                }
                assert_eq!(aggregator.monitor().reports().len() as u64, k / n as u64);
                assert_eq!(flushed, k / n as u64);
            }
        }
    }

    #[test]
    fn test_latest_values_overwrite_within_interval() {
        let model = two_param_model();
        let mut aggregator = HookAggregator::new(&model, 2, MemoryMonitor::new()).unwrap();
        {
            let mut scope = aggregator.enter().unwrap();

            model.run_backward(&grads(1.0, 2.0));
            assert!(!scope.tick(0.5).unwrap());
            model.run_backward(&grads(3.0, 4.0));
            assert!(scope.tick(0.5).unwrap());
        }

        let reports = aggregator.monitor().reports();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.step, 2);
        assert_eq!(report.loss, 0.5);
        assert_eq!(report.names, vec!["a.w", "b.w"]);
        assert_eq!(report.grad_norms, vec![3.0, 4.0]);
        assert_eq!(report.weight_norms, vec![5.0, 1.0]);
    }

    #[test]
    fn test_sample_empty_after_flush() {
        let model = two_param_model();
        let mut aggregator = HookAggregator::new(&model, 1, MemoryMonitor::new()).unwrap();
        let mut scope = aggregator.enter().unwrap();

        model.run_backward(&grads(1.0, 1.0));
        assert_eq!(scope.pending(), 2);
        scope.tick(1.0).unwrap();
        assert_eq!(scope.pending(), 0);

        // An already-empty sample stays empty and still reports
        scope.tick(1.0).unwrap();
        assert_eq!(scope.pending(), 0);
        assert!(scope.monitor().reports()[1].is_empty());
    }

    #[test]
    fn test_missing_gradient_is_omitted_not_carried() {
        let model = two_param_model();
        let mut aggregator = HookAggregator::new(&model, 1, MemoryMonitor::new()).unwrap();
        let mut scope = aggregator.enter().unwrap();

        model.run_backward(&grads(1.0, 2.0));
        scope.tick(0.3).unwrap();

        let only_a = BackwardPass::new().with_gradient("a.w", Tensor::from_vec(vec![7.0]));
        model.run_backward(&only_a);
        scope.tick(0.2).unwrap();

        let reports = scope.monitor().reports();
        assert_eq!(reports[0].names, vec!["a.w", "b.w"]);
        assert_eq!(reports[1].names, vec!["a.w"]);
        assert_eq!(reports[1].grad_norms, vec![7.0]);
    }

    #[test]
    fn test_hooks_inert_after_scope_exit() {
        let model = two_param_model();
        let mut aggregator = HookAggregator::new(&model, 1, MemoryMonitor::new()).unwrap();
        {
            let scope = aggregator.enter().unwrap();
            // two leaves, each with one backward hook and one gradient hook
            assert_eq!(scope.handle_count(), 4);
            assert_eq!(model.total_hook_count(), 4);
        }
        assert_eq!(model.total_hook_count(), 0);

        model.run_backward(&grads(1.0, 2.0));
        assert_eq!(aggregator.pending(), 0);
    }

    #[test]
    fn test_explicit_release() {
        let model = two_param_model();
        let mut aggregator = HookAggregator::new(&model, 1, MemoryMonitor::new()).unwrap();
        let scope = aggregator.enter().unwrap();
        scope.release().unwrap();
        assert_eq!(model.total_hook_count(), 0);
    }

    #[test]
    fn test_release_on_error_path() {
        fn failing_body(
            model: &Module,
            aggregator: &mut HookAggregator<'_, MemoryMonitor>,
        ) -> Result<()> {
            let _scope = aggregator.enter()?;
            assert_eq!(model.total_hook_count(), 4);
            Err(GradtopError::Monitor("training diverged".to_string()))
        }

        let model = two_param_model();
        let mut aggregator = HookAggregator::new(&model, 1, MemoryMonitor::new()).unwrap();
        assert!(failing_body(&model, &mut aggregator).is_err());
        assert_eq!(model.total_hook_count(), 0);
    }

    #[test]
    fn test_no_trainable_leaves_reports_empty_lists() {
        let model = Module::new("Root")
            .with_child("act", Module::new("ReLU"))
            .with_child(
                "frozen",
                Module::new("Linear")
                    .with_parameter("w", Parameter::frozen(Tensor::from_vec(vec![1.0]))),
            );
        let mut aggregator = HookAggregator::new(&model, 3, MemoryMonitor::new()).unwrap();
        let mut scope = aggregator.enter().unwrap();
        // backward hooks only
        assert_eq!(scope.handle_count(), 2);

        for _ in 0..6 {
            model.run_backward(&BackwardPass::new());
            scope.tick(1.0).unwrap();
        }

        let reports = scope.monitor().reports();
        assert_eq!(reports.len(), 2);
        for report in reports {
            assert!(report.names.is_empty());
            assert!(report.grad_norms.is_empty());
            assert!(report.weight_norms.is_empty());
        }
    }

    #[test]
    fn test_only_leaf_parameters_are_hooked() {
        // The root owns a parameter but is not a leaf
        let model = Module::new("Root")
            .with_parameter("scale", Parameter::new(Tensor::from_vec(vec![1.0])))
            .with_child(
                "leaf",
                Module::new("Linear")
                    .with_parameter("w", Parameter::new(Tensor::from_vec(vec![1.0]))),
            );
        let mut aggregator = HookAggregator::new(&model, 1, MemoryMonitor::new()).unwrap();
        let mut scope = aggregator.enter().unwrap();

        let pass = BackwardPass::new()
            .with_gradient("scale", Tensor::from_vec(vec![1.0]))
            .with_gradient("leaf.w", Tensor::from_vec(vec![2.0]));
        model.run_backward(&pass);
        scope.tick(0.0).unwrap();

        assert_eq!(scope.monitor().reports()[0].names, vec!["leaf.w"]);
    }

    #[test]
    fn test_root_leaf_uses_bare_parameter_names() {
        let model = Module::new("Linear")
            .with_parameter("weight", Parameter::new(Tensor::from_vec(vec![2.0])));
        let mut aggregator = HookAggregator::new(&model, 1, MemoryMonitor::new()).unwrap();
        let mut scope = aggregator.enter().unwrap();

        let pass = BackwardPass::new().with_gradient("weight", Tensor::from_vec(vec![1.0]));
        model.run_backward(&pass);
        scope.tick(0.0).unwrap();

        assert_eq!(scope.monitor().reports()[0].names, vec!["weight"]);
    }

    #[test]
    fn test_activation_stats() {
        let model = Module::new("Root")
            .with_child("act", Module::new("ReLU"))
            .with_child(
                "head",
                Module::new("Linear")
                    .with_parameter("w", Parameter::new(Tensor::from_vec(vec![1.0]))),
            );
        let mut aggregator = HookAggregator::new(&model, 1, MemoryMonitor::new())
            .unwrap()
            .with_activation_stats(true);
        let mut scope = aggregator.enter().unwrap();

        let mut pass = BackwardPass::new();
        pass.set_module_grads(
            "act",
            Vec::new(),
            vec![Tensor::from_vec(vec![-1.0, 0.0, 1.0, 2.0])],
        );
        model.run_backward(&pass);
        scope.tick(0.0).unwrap();

        let report = &scope.monitor().reports()[0];
        assert_eq!(report.activations.get("act"), Some(&0.5));
        assert!(report.names.is_empty());
    }

    #[test]
    fn test_weight_norm_read_when_gradient_arrives() {
        let weight = Parameter::new(Tensor::from_vec(vec![1.0]));
        let model = Module::new("Root").with_child(
            "layer",
            Module::new("Linear").with_parameter("w", weight.clone()),
        );
        let mut aggregator = HookAggregator::new(&model, 1, MemoryMonitor::new()).unwrap();
        let mut scope = aggregator.enter().unwrap();

        let pass = BackwardPass::new().with_gradient("layer.w", Tensor::from_vec(vec![1.0]));
        model.run_backward(&pass);
        weight.update(|t| t.data_mut()[0] = 10.0);
        scope.tick(0.0).unwrap();

        assert_eq!(scope.monitor().reports()[0].weight_norms, vec![1.0]);
    }
}
