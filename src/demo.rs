//! Demo training loop.
//!
//! A two-layer MLP (`encoder` → `act` → `head`) fitted to a synthetic
//! regression target with full-batch SGD. Gradients are computed by hand and
//! replayed through the model's hooks, so the aggregator sees the same
//! sequence of callbacks a framework backward pass would produce.

use crate::aggregator::HookScope;
use crate::config::DemoConfig;
use crate::error::Result;
use crate::monitor::Monitor;
use crate::nn::{BackwardPass, Module, Parameter, Tensor};
use indicatif::ProgressBar;
use tracing::{debug, info};

const INPUTS: usize = 2;

/// Fixed input/target pairs.
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Vec<[f32; INPUTS]>,
    targets: Vec<f32>,
}

impl Dataset {
    /// Deterministic points with a mildly non-linear target.
    pub fn synthetic(samples: usize) -> Self {
        let mut inputs = Vec::with_capacity(samples);
        let mut targets = Vec::with_capacity(samples);

        for i in 0..samples {
            let t = i as f32;
            let x = [(t * 0.7).sin(), (t * 1.3).cos()];
            inputs.push(x);
            targets.push(0.8 * x[0] - 0.5 * x[1] + 0.3 * x[0] * x[1]);
        }

        Self { inputs, targets }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// splitmix64 mapped to [-1, 1).
fn init_value(seed: u64) -> f32 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    ((z >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
}

fn init_tensor(shape: Vec<usize>, seed: u64, scale: f32) -> Result<Tensor> {
    let len: usize = shape.iter().product();
    let data = (0..len as u64)
        .map(|i| init_value(seed.wrapping_mul(1_000_003).wrapping_add(i)) * scale)
        .collect();
    Tensor::new(shape, data)
}

/// The demo network and handles to its parameters.
pub struct DemoModel {
    model: Module,
    hidden: usize,
    encoder_weight: Parameter,
    encoder_bias: Parameter,
    head_weight: Parameter,
    head_bias: Parameter,
}

impl DemoModel {
    pub fn new(hidden: usize, freeze_head_bias: bool) -> Result<Self> {
        let encoder_weight = Parameter::new(init_tensor(
            vec![hidden, INPUTS],
            1,
            1.0 / (INPUTS as f32).sqrt(),
        )?);
        let encoder_bias = Parameter::new(Tensor::zeros(vec![hidden]));
        let head_weight =
            Parameter::new(init_tensor(vec![1, hidden], 2, 1.0 / (hidden as f32).sqrt())?);
        let head_bias = Parameter::new(Tensor::zeros(vec![1]));
        head_bias.set_requires_grad(!freeze_head_bias);

        let model = Module::new("MLP")
            .with_child(
                "encoder",
                Module::new("Linear")
                    .with_parameter("weight", encoder_weight.clone())
                    .with_parameter("bias", encoder_bias.clone()),
            )
            .with_child("act", Module::new("ReLU"))
            .with_child(
                "head",
                Module::new("Linear")
                    .with_parameter("weight", head_weight.clone())
                    .with_parameter("bias", head_bias.clone()),
            );

        Ok(Self {
            model,
            hidden,
            encoder_weight,
            encoder_bias,
            head_weight,
            head_bias,
        })
    }

    pub fn from_config(config: &DemoConfig) -> Result<Self> {
        Self::new(config.hidden, config.freeze_head_bias)
    }

    pub fn model(&self) -> &Module {
        &self.model
    }

    /// Full-batch forward and backward pass. Returns the mean squared error
    /// and the gradients of every trainable parameter.
    pub fn forward_backward(&self, data: &Dataset) -> Result<(f64, BackwardPass)> {
        let h = self.hidden;
        let n = data.len();
        let w1 = self.encoder_weight.tensor();
        let b1 = self.encoder_bias.tensor();
        let w2 = self.head_weight.tensor();
        let b2 = self.head_bias.tensor();
        let (w1, b1, w2, b2) = (w1.data(), b1.data(), w2.data(), b2.data()[0]);

        let mut grad_w1 = vec![0.0f32; h * INPUTS];
        let mut grad_b1 = vec![0.0f32; h];
        let mut grad_w2 = vec![0.0f32; h];
        let mut grad_b2 = 0.0f32;

        // dL/d(output), dL/d(hidden), dL/d(pre-activation)
        let mut head_grad_out = Vec::with_capacity(n);
        let mut act_grad_out = vec![0.0f32; n * h];
        let mut act_grad_in = vec![0.0f32; n * h];

        let mut pre = vec![0.0f32; h];
        let mut loss_sum = 0.0f64;

        for (s, (x, &target)) in data.inputs.iter().zip(&data.targets).enumerate() {
            let mut y = b2;
            for j in 0..h {
                pre[j] = w1[j * INPUTS] * x[0] + w1[j * INPUTS + 1] * x[1] + b1[j];
                y += w2[j] * pre[j].max(0.0);
            }

            let err = y - target;
            loss_sum += f64::from(err) * f64::from(err);
            let dy = 2.0 * err / n as f32;
            head_grad_out.push(dy);
            grad_b2 += dy;

            for j in 0..h {
                let hidden = pre[j].max(0.0);
                grad_w2[j] += dy * hidden;

                let dh = dy * w2[j];
                let dpre = if pre[j] > 0.0 { dh } else { 0.0 };
                act_grad_out[s * h + j] = dh;
                act_grad_in[s * h + j] = dpre;

                grad_b1[j] += dpre;
                grad_w1[j * INPUTS] += dpre * x[0];
                grad_w1[j * INPUTS + 1] += dpre * x[1];
            }
        }

        let mut pass = BackwardPass::new()
            .with_gradient("encoder.weight", Tensor::new(vec![h, INPUTS], grad_w1)?)
            .with_gradient("encoder.bias", Tensor::from_vec(grad_b1))
            .with_gradient("head.weight", Tensor::new(vec![1, h], grad_w2)?);
        if self.head_bias.requires_grad() {
            pass.set_gradient("head.bias", Tensor::from_vec(vec![grad_b2]));
        }

        let act_out = Tensor::new(vec![n, h], act_grad_out)?;
        let act_in = Tensor::new(vec![n, h], act_grad_in)?;
        pass.set_module_grads(
            "head",
            vec![act_out.clone()],
            vec![Tensor::new(vec![n, 1], head_grad_out)?],
        );
        pass.set_module_grads("act", vec![act_in.clone()], vec![act_out]);
        pass.set_module_grads("encoder", Vec::new(), vec![act_in]);

        Ok((loss_sum / n as f64, pass))
    }

    /// In-place SGD update for every trainable parameter that has a gradient.
    pub fn apply_sgd(&self, pass: &BackwardPass, learning_rate: f32) {
        for (name, param) in self.model.all_parameters() {
            if !param.requires_grad() {
                continue;
            }
            let Some(grad) = pass.gradient(&name) else {
                continue;
            };
            param.update(|weights| {
                for (w, g) in weights.data_mut().iter_mut().zip(grad.data()) {
                    *w -= learning_rate * g;
                }
            });
        }
    }
}

/// What a demo run did.
#[derive(Debug, Clone, Default)]
pub struct DemoOutcome {
    pub steps: usize,
    pub initial_loss: Option<f64>,
    pub final_loss: Option<f64>,
    /// The monitor asked to stop before all steps ran.
    pub stopped_early: bool,
}

/// Train `demo` for up to `steps` steps, ticking the scope once per step.
pub fn train<M: Monitor>(
    demo: &DemoModel,
    data: &Dataset,
    scope: &mut HookScope<'_, '_, M>,
    steps: usize,
    learning_rate: f32,
    progress: Option<&ProgressBar>,
) -> Result<DemoOutcome> {
    let mut outcome = DemoOutcome::default();

    for step in 0..steps {
        if !scope.monitor().is_running() {
            info!("Monitor stopped; ending training after {} steps", step);
            outcome.stopped_early = true;
            break;
        }

        let (loss, pass) = demo.forward_backward(data)?;
        demo.model().run_backward(&pass);
        demo.apply_sgd(&pass, learning_rate);

        if scope.tick(loss)? {
            debug!("Reported at step {} (loss {:.5})", scope.step(), loss);
        }

        outcome.steps += 1;
        outcome.initial_loss.get_or_insert(loss);
        outcome.final_loss = Some(loss);

        if let Some(pb) = progress {
            pb.inc(1);
            pb.set_message(format!("loss {:.4}", loss));
        }
    }

    Ok(outcome)
}
