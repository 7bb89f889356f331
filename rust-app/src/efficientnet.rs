//! EfficientNet-B0 laid out with `timm` parameter names, inference only.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, conv2d, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder};

const BN_EPS: f64 = 1e-5;
const STEM_CHANNELS: usize = 32;
const HEAD_CHANNELS: usize = 1280;

/// One row of the B0 block table.
#[derive(Debug, Clone, Copy)]
struct Stage {
    kernel: usize,
    stride: usize,
    expand: usize,
    out_channels: usize,
    repeats: usize,
}

const fn stage(kernel: usize, stride: usize, expand: usize, out_channels: usize, repeats: usize) -> Stage {
    Stage {
        kernel,
        stride,
        expand,
        out_channels,
        repeats,
    }
}

// ds_r1_k3_s1_e1_c16, then ir_* rows of efficientnet_b0
const B0_STAGES: [Stage; 7] = [
    stage(3, 1, 1, 16, 1),
    stage(3, 2, 6, 24, 2),
    stage(5, 2, 6, 40, 2),
    stage(3, 2, 6, 80, 3),
    stage(5, 1, 6, 112, 3),
    stage(5, 2, 6, 192, 4),
    stage(3, 1, 6, 320, 1),
];

fn conv(in_c: usize, out_c: usize, kernel: usize, stride: usize, groups: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: kernel / 2,
        stride,
        groups,
        ..Default::default()
    };
    conv2d_no_bias(in_c, out_c, kernel, cfg, vb)
}

fn bn(channels: usize, vb: VarBuilder) -> Result<BatchNorm> {
    batch_norm(channels, BN_EPS, vb)
}

#[derive(Debug, Clone)]
struct SqueezeExcite {
    conv_reduce: Conv2d,
    conv_expand: Conv2d,
}

impl SqueezeExcite {
    fn new(channels: usize, reduced: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv_reduce: conv2d(channels, reduced, 1, Conv2dConfig::default(), vb.pp("conv_reduce"))?,
            conv_expand: conv2d(reduced, channels, 1, Conv2dConfig::default(), vb.pp("conv_expand"))?,
        })
    }
}

impl Module for SqueezeExcite {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let scale = xs
            .mean_keepdim((2, 3))?
            .apply(&self.conv_reduce)?
            .silu()?
            .apply(&self.conv_expand)?;
        xs.broadcast_mul(&candle_nn::ops::sigmoid(&scale)?)
    }
}

/// Stage 0 block: dw conv -> SE -> pw conv.
#[derive(Debug, Clone)]
struct DepthwiseSeparable {
    conv_dw: Conv2d,
    bn1: BatchNorm,
    se: SqueezeExcite,
    conv_pw: Conv2d,
    bn2: BatchNorm,
    residual: bool,
}

impl DepthwiseSeparable {
    fn new(in_c: usize, out_c: usize, kernel: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv_dw: conv(in_c, in_c, kernel, stride, in_c, vb.pp("conv_dw"))?,
            bn1: bn(in_c, vb.pp("bn1"))?,
            se: SqueezeExcite::new(in_c, (in_c / 4).max(1), vb.pp("se"))?,
            conv_pw: conv(in_c, out_c, 1, 1, 1, vb.pp("conv_pw"))?,
            bn2: bn(out_c, vb.pp("bn2"))?,
            residual: stride == 1 && in_c == out_c,
        })
    }
}

impl ModuleT for DepthwiseSeparable {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = xs
            .apply(&self.conv_dw)?
            .apply_t(&self.bn1, train)?
            .silu()?
            .apply(&self.se)?
            .apply(&self.conv_pw)?
            .apply_t(&self.bn2, train)?;
        if self.residual {
            ys + xs
        } else {
            Ok(ys)
        }
    }
}

/// MBConv: pw expand -> dw conv -> SE -> pw linear projection.
#[derive(Debug, Clone)]
struct InvertedResidual {
    conv_pw: Conv2d,
    bn1: BatchNorm,
    conv_dw: Conv2d,
    bn2: BatchNorm,
    se: SqueezeExcite,
    conv_pwl: Conv2d,
    bn3: BatchNorm,
    residual: bool,
}

impl InvertedResidual {
    fn new(in_c: usize, out_c: usize, kernel: usize, stride: usize, expand: usize, vb: VarBuilder) -> Result<Self> {
        let mid = in_c * expand;
        Ok(Self {
            conv_pw: conv(in_c, mid, 1, 1, 1, vb.pp("conv_pw"))?,
            bn1: bn(mid, vb.pp("bn1"))?,
            conv_dw: conv(mid, mid, kernel, stride, mid, vb.pp("conv_dw"))?,
            bn2: bn(mid, vb.pp("bn2"))?,
            // SE width follows the block input, not the expanded width
            se: SqueezeExcite::new(mid, (in_c / 4).max(1), vb.pp("se"))?,
            conv_pwl: conv(mid, out_c, 1, 1, 1, vb.pp("conv_pwl"))?,
            bn3: bn(out_c, vb.pp("bn3"))?,
            residual: stride == 1 && in_c == out_c,
        })
    }
}

impl ModuleT for InvertedResidual {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = xs
            .apply(&self.conv_pw)?
            .apply_t(&self.bn1, train)?
            .silu()?
            .apply(&self.conv_dw)?
            .apply_t(&self.bn2, train)?
            .silu()?
            .apply(&self.se)?
            .apply(&self.conv_pwl)?
            .apply_t(&self.bn3, train)?;
        if self.residual {
            ys + xs
        } else {
            Ok(ys)
        }
    }
}

#[derive(Debug, Clone)]
enum Block {
    DepthwiseSeparable(DepthwiseSeparable),
    InvertedResidual(InvertedResidual),
}

impl ModuleT for Block {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Block::DepthwiseSeparable(b) => b.forward_t(xs, train),
            Block::InvertedResidual(b) => b.forward_t(xs, train),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EfficientNet {
    conv_stem: Conv2d,
    bn1: BatchNorm,
    blocks: Vec<Block>,
    conv_head: Conv2d,
    bn2: BatchNorm,
    classifier: Linear,
}

impl EfficientNet {
    /// Builds `efficientnet_b0` with a `num_classes`-wide classifier head.
    pub fn b0(num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let conv_stem = conv(3, STEM_CHANNELS, 3, 2, 1, vb.pp("conv_stem"))?;
        let bn1 = bn(STEM_CHANNELS, vb.pp("bn1"))?;

        let vb_blocks = vb.pp("blocks");
        let mut blocks = Vec::new();
        let mut in_c = STEM_CHANNELS;
        for (stage_idx, stage) in B0_STAGES.iter().enumerate() {
            let vb_stage = vb_blocks.pp(stage_idx);
            for block_idx in 0..stage.repeats {
                let stride = if block_idx == 0 { stage.stride } else { 1 };
                let vb_block = vb_stage.pp(block_idx);
                let block = if stage.expand == 1 {
                    Block::DepthwiseSeparable(DepthwiseSeparable::new(
                        in_c,
                        stage.out_channels,
                        stage.kernel,
                        stride,
                        vb_block,
                    )?)
                } else {
                    Block::InvertedResidual(InvertedResidual::new(
                        in_c,
                        stage.out_channels,
                        stage.kernel,
                        stride,
                        stage.expand,
                        vb_block,
                    )?)
                };
                blocks.push(block);
                in_c = stage.out_channels;
            }
        }

        let conv_head = conv(in_c, HEAD_CHANNELS, 1, 1, 1, vb.pp("conv_head"))?;
        let bn2 = bn(HEAD_CHANNELS, vb.pp("bn2"))?;
        let classifier = linear(HEAD_CHANNELS, num_classes, vb.pp("classifier"))?;
        Ok(Self {
            conv_stem,
            bn1,
            blocks,
            conv_head,
            bn2,
            classifier,
        })
    }
}

impl ModuleT for EfficientNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.apply(&self.conv_stem)?.apply_t(&self.bn1, train)?.silu()?;
        for block in &self.blocks {
            xs = xs.apply_t(block, train)?;
        }
        xs.apply(&self.conv_head)?
            .apply_t(&self.bn2, train)?
            .silu()?
            .mean((2, 3))?
            .apply(&self.classifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(num_classes: usize) -> (VarMap, EfficientNet) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = EfficientNet::b0(num_classes, vb).unwrap();
        (varmap, model)
    }

    #[test]
    fn uses_timm_parameter_names() {
        let (varmap, _) = build(5);
        let vars = varmap.data().lock().unwrap();
        for name in [
            "conv_stem.weight",
            "bn1.running_var",
            "blocks.0.0.conv_dw.weight",
            "blocks.0.0.se.conv_reduce.bias",
            "blocks.0.0.conv_pw.weight",
            "blocks.1.0.conv_pwl.weight",
            "blocks.5.3.bn3.running_mean",
            "blocks.6.0.se.conv_expand.weight",
            "conv_head.weight",
            "bn2.bias",
            "classifier.weight",
        ] {
            assert!(vars.contains_key(name), "missing {name}");
        }
        assert!(!vars.contains_key("blocks.6.1.conv_pw.weight"));
    }

    #[test]
    fn block_shapes_match_b0() {
        let (varmap, _) = build(5);
        let vars = varmap.data().lock().unwrap();
        let dims = |name: &str| vars[name].as_tensor().dims().to_vec();

        assert_eq!(dims("conv_stem.weight"), vec![32, 3, 3, 3]);
        assert_eq!(dims("blocks.0.0.se.conv_reduce.weight"), vec![8, 32, 1, 1]);
        assert_eq!(dims("blocks.1.0.conv_dw.weight"), vec![96, 1, 3, 3]);
        assert_eq!(dims("blocks.1.0.se.conv_reduce.weight"), vec![4, 96, 1, 1]);
        assert_eq!(dims("blocks.2.0.conv_dw.weight"), vec![144, 1, 5, 5]);
        assert_eq!(dims("blocks.6.0.conv_pwl.weight"), vec![320, 1152, 1, 1]);
        assert_eq!(dims("conv_head.weight"), vec![1280, 320, 1, 1]);
        assert_eq!(dims("classifier.weight"), vec![5, 1280]);
    }

    #[test]
    fn forward_produces_one_logit_per_class() {
        let (_, model) = build(5);
        let input = Tensor::zeros((2, 3, 224, 224), DType::F32, &Device::Cpu).unwrap();
        let logits = model.forward_t(&input, false).unwrap();
        assert_eq!(logits.dims(), &[2, 5]);
    }
}
