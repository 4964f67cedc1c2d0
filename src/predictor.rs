//! 推理接口 (Predictor capability)
//!
//! The classifier only ever sees [`Predictor`]. Which variant sits behind it
//! is decided once, at load time:
//!
//! - [`OnnxPredictor`]: the interpreted ONNX graph, run by tract.
//! - [`ReferencePredictor`]: the reference architecture rebuilt natively,
//!   with only its numeric weights loaded from a safetensors file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use tract_onnx::prelude::*;

use crate::error::{Result, VerifyError};

/// NHWC f32 input, batch of one.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub shape: [usize; 4],
}

impl ImageTensor {
    pub fn side(&self) -> usize {
        self.shape[1]
    }
}

pub trait Predictor: Send + Sync {
    /// Raw model output, flattened.
    fn infer(&self, input: &ImageTensor) -> Result<Vec<f32>>;

    /// Short name for logs and the health endpoint.
    fn kind(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Interpreted graph (tract)
// ---------------------------------------------------------------------------

pub struct OnnxPredictor {
    // tract plans are serialized around `run` only; preprocessing happens
    // outside the lock
    plan: Mutex<TypedRunnableModel<TypedModel>>,
}

impl OnnxPredictor {
    pub fn new(plan: TypedRunnableModel<TypedModel>) -> Self {
        Self { plan: Mutex::new(plan) }
    }
}

impl Predictor for OnnxPredictor {
    fn infer(&self, input: &ImageTensor) -> Result<Vec<f32>> {
        let [n, h, w, c] = input.shape;
        let array = tract_ndarray::Array4::from_shape_vec((n, h, w, c), input.data.clone())
            .map_err(|e| VerifyError::Inference(format!("input tensor: {e}")))?;
        let tensor: Tensor = array.into();

        let outputs = {
            let plan = self
                .plan
                .lock()
                .map_err(|_| VerifyError::Inference("inference plan poisoned".into()))?;
            plan.run(tvec!(tensor.into()))
                .map_err(|e| VerifyError::Inference(format!("run: {e}")))?
        };

        let first = outputs
            .first()
            .ok_or_else(|| VerifyError::Inference("model produced no outputs".into()))?;
        let view = first
            .to_array_view::<f32>()
            .map_err(|e| VerifyError::Inference(format!("output tensor: {e}")))?;
        Ok(view.iter().copied().collect())
    }

    fn kind(&self) -> &'static str {
        "onnx"
    }
}

// ---------------------------------------------------------------------------
// Native reference architecture
// ---------------------------------------------------------------------------

/// Side of the average-pooling grid applied before the dense head.
pub const POOL_GRID: usize = 8;
/// Feature width entering the first dense layer (grid cells x RGB).
pub const REFERENCE_FEATURES: usize = POOL_GRID * POOL_GRID * 3;

/// One dense layer, weights row-major `[inputs, outputs]`.
#[derive(Debug, Clone)]
pub struct DenseLayer {
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
    pub inputs: usize,
    pub outputs: usize,
}

impl DenseLayer {
    fn forward(&self, x: &[f32]) -> Vec<f32> {
        let mut out = self.bias.clone();
        for (i, xi) in x.iter().enumerate() {
            let row = &self.weight[i * self.outputs..(i + 1) * self.outputs];
            for (o, w) in out.iter_mut().zip(row) {
                *o += xi * w;
            }
        }
        out
    }
}

/// 参考架构：8x8 平均池化 -> 若干 ReLU 全连接层 -> sigmoid 输出。
///
/// Dropout layers of the trained network are identities at inference time
/// and have no weights, so they do not appear here.
pub struct ReferencePredictor {
    layers: Vec<DenseLayer>,
}

impl ReferencePredictor {
    /// Validates the layer chain: `REFERENCE_FEATURES` in, one scalar out.
    pub fn new(layers: Vec<DenseLayer>) -> Result<Self> {
        let first = layers
            .first()
            .ok_or_else(|| VerifyError::ModelUnavailable("reference weights have no layers".into()))?;
        if first.inputs != REFERENCE_FEATURES {
            return Err(VerifyError::ModelUnavailable(format!(
                "first layer expects {} features, reference architecture has {REFERENCE_FEATURES}",
                first.inputs
            )));
        }
        for pair in layers.windows(2) {
            if pair[0].outputs != pair[1].inputs {
                return Err(VerifyError::ModelUnavailable(format!(
                    "layer chain broken: {} outputs feed {} inputs",
                    pair[0].outputs, pair[1].inputs
                )));
            }
        }
        for layer in &layers {
            if layer.weight.len() != layer.inputs * layer.outputs || layer.bias.len() != layer.outputs {
                return Err(VerifyError::ModelUnavailable("layer tensor sizes disagree".into()));
            }
        }
        if layers.last().map(|l| l.outputs) != Some(1) {
            return Err(VerifyError::ModelUnavailable("reference head must emit one scalar".into()));
        }
        Ok(Self { layers })
    }

    /// Reads `dense_{i}.weight` / `dense_{i}.bias` for i = 0.. until a gap.
    pub fn from_safetensors(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let tensors = SafeTensors::deserialize(&bytes)
            .map_err(|e| VerifyError::ModelUnavailable(format!("safetensors: {e}")))?;

        let mut layers = Vec::new();
        for idx in 0.. {
            let Ok(weight) = tensors.tensor(&format!("dense_{idx}.weight")) else {
                break;
            };
            let bias = tensors
                .tensor(&format!("dense_{idx}.bias"))
                .map_err(|e| VerifyError::ModelUnavailable(format!("dense_{idx}.bias: {e}")))?;
            let shape = weight.shape();
            if shape.len() != 2 {
                return Err(VerifyError::ModelUnavailable(format!(
                    "dense_{idx}.weight has rank {}",
                    shape.len()
                )));
            }
            layers.push(DenseLayer {
                inputs: shape[0],
                outputs: shape[1],
                weight: f32_data(&weight)?,
                bias: f32_data(&bias)?,
            });
        }
        Self::new(layers)
    }

    fn pool(input: &ImageTensor) -> Vec<f32> {
        let side = input.side();
        let cell = (side / POOL_GRID).max(1);
        let mut features = vec![0.0f32; REFERENCE_FEATURES];
        let mut counts = vec![0u32; POOL_GRID * POOL_GRID];
        for y in 0..side {
            let gy = (y / cell).min(POOL_GRID - 1);
            for x in 0..side {
                let gx = (x / cell).min(POOL_GRID - 1);
                let g = gy * POOL_GRID + gx;
                counts[g] += 1;
                for c in 0..3 {
                    features[g * 3 + c] += input.data[(y * side + x) * 3 + c];
                }
            }
        }
        for (g, n) in counts.iter().enumerate() {
            if *n > 0 {
                for c in 0..3 {
                    features[g * 3 + c] /= *n as f32;
                }
            }
        }
        features
    }
}

impl Predictor for ReferencePredictor {
    fn infer(&self, input: &ImageTensor) -> Result<Vec<f32>> {
        if input.data.len() != input.shape.iter().product::<usize>() || input.shape[3] != 3 {
            return Err(VerifyError::Inference(format!("bad input shape {:?}", input.shape)));
        }
        let mut x = Self::pool(input);
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x);
            if i == last {
                x.iter_mut().for_each(|v| *v = 1.0 / (1.0 + (-*v).exp()));
            } else {
                x.iter_mut().for_each(|v| *v = v.max(0.0));
            }
        }
        Ok(x)
    }

    fn kind(&self) -> &'static str {
        "reference"
    }
}

fn f32_data(view: &TensorView<'_>) -> Result<Vec<f32>> {
    if view.dtype() != Dtype::F32 {
        return Err(VerifyError::ModelUnavailable(format!(
            "expected F32 weights, found {:?}",
            view.dtype()
        )));
    }
    Ok(view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Export reference-architecture weights in the layout
/// [`ReferencePredictor::from_safetensors`] reads.
pub fn save_reference_weights(path: &Path, layers: &[DenseLayer]) -> Result<()> {
    let raw: Vec<(String, Vec<u8>, Vec<usize>)> = layers
        .iter()
        .enumerate()
        .flat_map(|(i, l)| {
            [
                (format!("dense_{i}.weight"), le_bytes(&l.weight), vec![l.inputs, l.outputs]),
                (format!("dense_{i}.bias"), le_bytes(&l.bias), vec![l.outputs]),
            ]
        })
        .collect();

    let mut views = Vec::with_capacity(raw.len());
    for (name, bytes, shape) in &raw {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
            .map_err(|e| VerifyError::ModelUnavailable(format!("{name}: {e}")))?;
        views.push((name.clone(), view));
    }
    let info: Option<HashMap<String, String>> = None;
    let out = safetensors::serialize(views, &info)
        .map_err(|e| VerifyError::ModelUnavailable(format!("serialize weights: {e}")))?;
    std::fs::write(path, out)?;
    Ok(())
}

fn le_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}
