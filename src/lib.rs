//! gradtop - sampled gradient and weight norm monitoring.
//!
//! Attach hooks to every leaf module of a model, keep the latest gradient
//! and weight norm per parameter, and report them to a [`Monitor`] every N
//! training steps.
//!
//! ```no_run
//! use gradtop::{HookAggregator, LogMonitor, Module, Parameter, Tensor};
//!
//! let model = Module::new("MLP").with_child(
//!     "head",
//!     Module::new("Linear").with_parameter("weight", Parameter::new(Tensor::zeros(vec![1, 4]))),
//! );
//! let mut aggregator = HookAggregator::new(&model, 10, LogMonitor::new())?;
//! let mut scope = aggregator.enter()?;
//! // run backward passes through `model`, then once per step:
//! scope.tick(0.25)?;
//! # Ok::<(), gradtop::GradtopError>(())
//! ```

pub mod aggregator;
pub mod cli;
pub mod config;
pub mod demo;
pub mod error;
pub mod models;
pub mod monitor;
pub mod nn;
pub mod report;

pub use aggregator::{HookAggregator, HookScope};
pub use error::{GradtopError, HookError};
pub use models::{MetricReport, ParamStat, RunSummary};
pub use monitor::{ChannelMonitor, JsonlMonitor, LogMonitor, MemoryMonitor, Monitor};
pub use nn::{BackwardPass, Module, Parameter, Tensor};
