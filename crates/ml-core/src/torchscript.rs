//! TorchScript-backed vehicle classifier (YOLOv8 export layout).

use std::{convert::TryFrom, path::Path};

use anyhow::{Result, bail};
use tch::{self, Device, Kind, Tensor};
use video_ingest::Frame;

use crate::classifier::{Classifier, InferenceParams, RawDetection, non_max_suppression};

/// Upper bound on candidate boxes decoded per frame before suppression.
const MAX_CANDIDATES: usize = 512;

pub struct TorchScriptClassifier {
    module: tch::CModule,
    device: Device,
}

impl TorchScriptClassifier {
    /// Load a TorchScript module onto the requested device.
    pub fn load<P: AsRef<Path>>(model_path: P, device: Device) -> Result<Self> {
        let module = tch::CModule::load_on_device(model_path, device)?;
        Ok(Self { module, device })
    }

    /// Convert a BGR frame into a normalised `[1, 3, size, size]` RGB tensor.
    fn frame_to_tensor(&self, frame: &Frame, size: i64) -> Result<Tensor> {
        let expected = (frame.width as usize) * (frame.height as usize) * 3;
        if frame.data.len() != expected {
            bail!(
                "unexpected frame buffer size: got {} bytes, expected {}",
                frame.data.len(),
                expected
            );
        }

        let chw = Tensor::from_slice(&frame.data)
            .view([frame.height as i64, frame.width as i64, 3])
            .flip([2])
            .permute([2, 0, 1]);
        let resized = tch::vision::image::resize(&chw, size, size)?;
        let tensor = resized
            .to_device(self.device)
            .to_kind(Kind::Float)
            .unsqueeze(0)
            / 255.0;
        Ok(tensor)
    }
}

impl Classifier for TorchScriptClassifier {
    fn infer(&mut self, frame: &Frame, params: &InferenceParams) -> Result<Vec<RawDetection>> {
        let size = params.image_size as i64;
        let input = self.frame_to_tensor(frame, size)?;
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))?;

        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        let channels = shape[1];
        if channels < 5 {
            bail!("detector output requires at least 5 channels (x,y,w,h,scores), got {channels}");
        }

        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let scale_x = frame.width as f32 / size as f32;
        let scale_y = frame.height as f32 / size as f32;
        let mut candidates = Vec::new();
        for row in rows {
            let Some((class_idx, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            let class_id = class_idx as u32;
            if score < params.confidence_threshold {
                continue;
            }
            if !params.class_filter.is_empty() && !params.class_filter.contains(&class_id) {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            candidates.push(RawDetection {
                class_id,
                confidence: score,
                bbox_xyxy: [
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    (cx + w / 2.0) * scale_x,
                    (cy + h / 2.0) * scale_y,
                ],
            });
            if candidates.len() >= MAX_CANDIDATES {
                break;
            }
        }

        Ok(non_max_suppression(candidates, params.iou_threshold))
    }
}
