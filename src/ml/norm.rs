// ============================================================
// Layer 5 — Frozen-Statistics Normalisation
// ============================================================
// Batch normalisation over the channel dimension (dim 1) with an
// explicit `frozen` flag.
//
//   autodiff backend, not frozen → batch statistics, running
//                                  statistics updated
//   autodiff backend, frozen     → running statistics, never updated
//   inference backend            → running statistics
//
// Burn has no train/eval mode switch on modules; the backend
// decides. The flag is therefore the only way to keep running
// statistics fixed while the rest of the model trains, and it is
// set through `FreezeNormStats` on the whole model.

use burn::{
    module::{Param, RunningState},
    prelude::*,
};

#[derive(Config, Debug)]
pub struct FrozenNormConfig {
    pub num_features: usize,
    #[config(default = 1e-5)]
    pub epsilon:      f64,
    #[config(default = 0.1)]
    pub momentum:     f64,
}

impl FrozenNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FrozenNorm<B> {
        FrozenNorm {
            gamma:        Param::from_tensor(Tensor::ones([self.num_features], device)),
            beta:         Param::from_tensor(Tensor::zeros([self.num_features], device)),
            running_mean: RunningState::new(Tensor::zeros([self.num_features], device)),
            running_var:  RunningState::new(Tensor::ones([self.num_features], device)),
            epsilon:      self.epsilon,
            momentum:     self.momentum,
            frozen:       false,
        }
    }
}

#[derive(Module, Debug)]
pub struct FrozenNorm<B: Backend> {
    pub gamma:        Param<Tensor<B, 1>>,
    pub beta:         Param<Tensor<B, 1>>,
    pub running_mean: RunningState<Tensor<B, 1>>,
    pub running_var:  RunningState<Tensor<B, 1>>,
    pub epsilon:      f64,
    pub momentum:     f64,
    pub frozen:       bool,
}

/// Recursive toggle for the `frozen` flag of every normalisation
/// layer inside a module.
pub trait FreezeNormStats: Sized {
    fn freeze_norm_stats(self, frozen: bool) -> Self;
}

impl<B: Backend> FreezeNormStats for FrozenNorm<B> {
    fn freeze_norm_stats(self, frozen: bool) -> Self {
        Self { frozen, ..self }
    }
}

impl<B: Backend> FrozenNorm<B> {
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// input: [batch, channels, ...] → same shape
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let channels = input.dims()[1];

        let (mean, var) = if B::ad_enabled() && !self.frozen {
            self.batch_statistics(input.clone())
        } else {
            (self.running_mean.value(), self.running_var.value())
        };

        let shape = channel_shape::<D>(channels);
        let mean  = mean.reshape(shape);
        let std   = var.add_scalar(self.epsilon).sqrt().reshape(shape);
        let gamma = self.gamma.val().reshape(shape);
        let beta  = self.beta.val().reshape(shape);

        input.sub(mean).div(std).mul(gamma).add(beta)
    }

    /// Per-channel mean and biased variance of the batch; folds them
    /// into the running statistics.
    fn batch_statistics<const D: usize>(&self, input: Tensor<B, D>) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let channels = input.dims()[1];

        // [C, N * spatial]
        let flat: Tensor<B, 2> = input.swap_dims(0, 1).flatten(1, D - 1);
        let mean = flat.clone().mean_dim(1);
        let var  = flat.sub(mean.clone()).powf_scalar(2.0).mean_dim(1);
        let mean = mean.reshape([channels]);
        let var  = var.reshape([channels]);

        let keep = 1.0 - self.momentum;
        let running_mean = self
            .running_mean
            .value_sync()
            .mul_scalar(keep)
            .add(mean.clone().detach().mul_scalar(self.momentum));
        let running_var = self
            .running_var
            .value_sync()
            .mul_scalar(keep)
            .add(var.clone().detach().mul_scalar(self.momentum));
        self.running_mean.update(running_mean.detach());
        self.running_var.update(running_var.detach());

        (mean, var)
    }
}

/// [1, C, 1, ...] for broadcasting per-channel values over a rank-D input.
fn channel_shape<const D: usize>(channels: usize) -> [usize; D] {
    let mut shape = [1; D];
    shape[1] = channels;
    shape
}
