// ============================================================
// Layer 5 — Combination-of-Global-Descriptors Model
// ============================================================
// images [N, 3, S, S]
//    │
//    ▼
// backbone: stride-2 conv blocks (conv → frozen-stat norm → relu)
//    │  shared feature map [N, C, h, w]
//    ├──► descriptor 1 (pool → linear → L2) ─┐
//    ├──► descriptor 2 (pool → linear → L2) ─┼─► concat → L2 → embeddings [N, D]
//    └──► ...                                ┘
//    descriptor 1's pooled vector → norm → linear → logits [N, classes]
//
// Descriptor letters:  S = average pooling (SPoC, GeM p = 1)
//                      M = max pooling     (MAC, GeM p = ∞)
//                      G = GeM pooling     (p = 3)

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Linear, LinearConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};
use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};
use crate::ml::norm::{FreezeNormStats, FrozenNorm, FrozenNormConfig};

const GEM_P: f64 = 3.0;
const NORM_EPSILON: f64 = 1e-12;

/// What the training and evaluation loops need from a model.
pub trait EmbeddingModel<B: Backend> {
    fn forward(&self, images: Tensor<B, 4>) -> ModelOutput<B>;
}

pub struct ModelOutput<B: Backend> {
    /// L2-normalised, shape [N, D]
    pub embeddings: Tensor<B, 2>,
    /// Raw class scores, shape [N, C]
    pub logits:     Tensor<B, 2>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    Small,
    Base,
}

impl BackboneKind {
    fn widths(self) -> &'static [usize] {
        match self {
            BackboneKind::Small => &[16, 32, 64, 128],
            BackboneKind::Base  => &[32, 64, 128, 256],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackboneKind::Small => "small",
            BackboneKind::Base  => "base",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Average,
    Max,
    Gem,
}

impl DescriptorKind {
    fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'S' => Some(Self::Average),
            'M' => Some(Self::Max),
            'G' => Some(Self::Gem),
            _   => None,
        }
    }

    fn pooling_power(self) -> f64 {
        match self {
            Self::Average => 1.0,
            Self::Max     => f64::INFINITY,
            Self::Gem     => GEM_P,
        }
    }
}

/// Parse a descriptor string such as "SG" or "MSG": one to three of
/// the letters S, M, G, each at most once.
pub fn parse_gd_config(gd_config: &str) -> TrainResult<Vec<DescriptorKind>> {
    let mut kinds = Vec::new();
    for letter in gd_config.chars() {
        let kind = DescriptorKind::from_letter(letter).ok_or_else(|| {
            TrainError::InvalidConfig(format!(
                "unknown global descriptor '{letter}' in '{gd_config}', expected S, M or G"
            ))
        })?;
        if kinds.contains(&kind) {
            return Err(TrainError::InvalidConfig(format!(
                "global descriptor '{letter}' repeated in '{gd_config}'"
            )));
        }
        kinds.push(kind);
    }
    if kinds.is_empty() {
        return Err(TrainError::InvalidConfig("global descriptor config is empty".into()));
    }
    Ok(kinds)
}

#[derive(Config, Debug)]
pub struct CgdModelConfig {
    pub backbone:    BackboneKind,
    pub gd_config:   String,
    pub feature_dim: usize,
    pub num_classes: usize,
}

impl CgdModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TrainResult<CgdModel<B>> {
        let kinds = parse_gd_config(&self.gd_config)?;
        if self.feature_dim == 0 || self.feature_dim % kinds.len() != 0 {
            return Err(TrainError::InvalidConfig(format!(
                "feature dim {} must be a positive multiple of {} descriptors",
                self.feature_dim,
                kinds.len()
            )));
        }
        if self.num_classes < 2 {
            return Err(TrainError::InvalidConfig(format!(
                "need at least 2 classes, got {}",
                self.num_classes
            )));
        }

        let widths = self.backbone.widths();
        let mut in_channels = 3;
        let backbone = widths
            .iter()
            .map(|&out_channels| {
                let block = ConvBlock {
                    conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                        .with_stride([2, 2])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device),
                    norm: FrozenNormConfig::new(out_channels).init(device),
                };
                in_channels = out_channels;
                block
            })
            .collect();

        let channels = in_channels;
        let k        = self.feature_dim / kinds.len();
        let descriptors = kinds
            .iter()
            .map(|kind| GlobalDescriptor {
                projection: LinearConfig::new(channels, k).with_bias(false).init(device),
                p:          kind.pooling_power(),
            })
            .collect();

        Ok(CgdModel {
            backbone,
            descriptors,
            aux_norm:   FrozenNormConfig::new(channels).init(device),
            classifier: LinearConfig::new(channels, self.num_classes).init(device),
        })
    }
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: FrozenNorm<B>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.norm.forward(self.conv.forward(x)))
    }
}

impl<B: Backend> FreezeNormStats for ConvBlock<B> {
    fn freeze_norm_stats(self, frozen: bool) -> Self {
        Self { norm: self.norm.freeze_norm_stats(frozen), ..self }
    }
}

/// Generalised-mean pooling followed by a bias-free projection.
#[derive(Module, Debug)]
pub struct GlobalDescriptor<B: Backend> {
    pub projection: Linear<B>,
    /// Pooling power: 1 = average, ∞ = max, otherwise GeM
    pub p:          f64,
}

impl<B: Backend> GlobalDescriptor<B> {
    /// features: [N, C, h, w] → [N, C]
    pub fn pool(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [n, c, h, w] = features.dims();
        let flat = features.reshape([n, c, h * w]);

        let pooled = if self.p.is_infinite() {
            flat.max_dim(2)
        } else if (self.p - 1.0).abs() < f64::EPSILON {
            flat.mean_dim(2)
        } else {
            flat.clamp_min(1e-6)
                .powf_scalar(self.p)
                .mean_dim(2)
                .powf_scalar(1.0 / self.p)
        };
        pooled.reshape([n, c])
    }

    pub fn project(&self, pooled: Tensor<B, 2>) -> Tensor<B, 2> {
        l2_normalize(self.projection.forward(pooled))
    }
}

#[derive(Module, Debug)]
pub struct CgdModel<B: Backend> {
    pub backbone:    Vec<ConvBlock<B>>,
    pub descriptors: Vec<GlobalDescriptor<B>>,
    pub aux_norm:    FrozenNorm<B>,
    pub classifier:  Linear<B>,
}

impl<B: Backend> EmbeddingModel<B> for CgdModel<B> {
    fn forward(&self, images: Tensor<B, 4>) -> ModelOutput<B> {
        let mut shared = images;
        for block in &self.backbone {
            shared = block.forward(shared);
        }

        let mut parts  = Vec::with_capacity(self.descriptors.len());
        let mut logits = None;
        for (i, descriptor) in self.descriptors.iter().enumerate() {
            let pooled = descriptor.pool(shared.clone());
            if i == 0 {
                logits = Some(self.classifier.forward(self.aux_norm.forward(pooled.clone())));
            }
            parts.push(descriptor.project(pooled));
        }

        ModelOutput {
            embeddings: l2_normalize(Tensor::cat(parts, 1)),
            // CgdModelConfig::init guarantees at least one descriptor
            logits: logits.unwrap_or_else(|| {
                let n = shared.dims()[0];
                Tensor::zeros([n, self.classifier.weight.val().dims()[1]], &shared.device())
            }),
        }
    }
}

impl<B: Backend> FreezeNormStats for CgdModel<B> {
    fn freeze_norm_stats(self, frozen: bool) -> Self {
        Self {
            backbone: self
                .backbone
                .into_iter()
                .map(|block| block.freeze_norm_stats(frozen))
                .collect(),
            aux_norm: self.aux_norm.freeze_norm_stats(frozen),
            ..self
        }
    }
}

/// Row-wise L2 normalisation.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .clamp_min(NORM_EPSILON)
        .sqrt();
    x.div(norm)
}
