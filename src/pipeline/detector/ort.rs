use anyhow::{Context, Result, anyhow};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{
    PoseEstimator,
    common::{self, INPUT_SIZE},
};
use crate::{
    config::{Delegate, EngineConfig},
    types::{Frame, FrameTimestamp, PoseResult},
};

/// BlazePose landmark model run through ONNX Runtime on full letterboxed frames.
pub struct OrtPoseEstimator {
    session: Session,
    min_pose_presence: f32,
}

impl OrtPoseEstimator {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let model_path = config.model_path();
        if !model_path.exists() {
            return Err(anyhow!("pose model not found at {}", model_path.display()));
        }

        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?;
        if config.delegate == Delegate::Gpu {
            builder = builder.with_execution_providers([CUDAExecutionProvider::default().build()])?;
        }
        let session = builder
            .commit_from_file(&model_path)
            .with_context(|| format!("failed to load ORT session from {}", model_path.display()))?;

        log::info!(
            "pose landmark model {} loaded ({:?}, {:?})",
            model_path.display(),
            config.variant,
            config.delegate
        );

        Ok(Self {
            session,
            min_pose_presence: config.min_pose_presence,
        })
    }
}

impl PoseEstimator for OrtPoseEstimator {
    fn estimate(&mut self, frame: &Frame, _timestamp: FrameTimestamp) -> Result<Vec<PoseResult>> {
        let (input, letterbox) = common::prepare_frame(frame, INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run ORT session")?;

        if outputs.len() < 2 {
            return Err(anyhow!(
                "model returned {} outputs, expected landmarks and pose flag",
                outputs.len()
            ));
        }

        let presence_logit = outputs[1]
            .try_extract_array::<f32>()?
            .iter()
            .next()
            .copied()
            .unwrap_or(f32::NEG_INFINITY);
        if common::sigmoid(presence_logit) < self.min_pose_presence {
            return Ok(Vec::new());
        }

        let coords = outputs[0].try_extract_array::<f32>()?;
        let flattened: Vec<f32> = coords.iter().copied().collect();
        let pose = common::decode_landmarks(&flattened, &letterbox)?;

        Ok(vec![pose])
    }
}
