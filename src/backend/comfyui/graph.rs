//! Node-graph description of the two-pass generation pipeline

use serde_json::{json, Value};

/// Node whose output images are collected
pub const SAVE_NODE: &str = "9";

/// Smallest latent edge the samplers accept
const MIN_EDGE: u32 = 64;

/// Parameters for one workflow run
#[derive(Debug, Clone)]
pub struct GraphParams {
    pub checkpoint: String,
    pub positive: String,
    pub negative: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f32,
    pub sampler: String,
    pub scheduler: String,
    pub seed: u64,
    /// Final size divided by base-pass size
    pub upscale_factor: f64,
    /// Denoise strength of the refinement pass
    pub refine_denoise: f64,
    pub filename_prefix: String,
}

/// Round to the nearest multiple of 8, never below the minimum edge
pub fn snap_to_latent(value: f64) -> u32 {
    let snapped = ((value / 8.0).round() * 8.0) as u32;
    snapped.max(MIN_EDGE)
}

/// Resolution of the first sampling pass for a requested final size
pub fn base_resolution(width: u32, height: u32, upscale_factor: f64) -> (u32, u32) {
    let factor = if upscale_factor.is_finite() && upscale_factor >= 1.0 {
        upscale_factor
    } else {
        1.0
    };
    (
        snap_to_latent(width as f64 / factor),
        snap_to_latent(height as f64 / factor),
    )
}

/// Steps for the refinement pass: half the base steps, at least one
pub fn refine_steps(steps: u32) -> u32 {
    (steps / 2).max(1)
}

/// Build the workflow: base-resolution pass, latent upscale, low-denoise
/// refinement pass, decode and save
pub fn build_two_pass_graph(params: &GraphParams) -> Value {
    let (final_w, final_h) = (snap_to_latent(params.width as f64), snap_to_latent(params.height as f64));
    let (base_w, base_h) = base_resolution(final_w, final_h, params.upscale_factor);

    json!({
        "1": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": { "ckpt_name": params.checkpoint }
        },
        "2": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": params.positive, "clip": ["1", 1] }
        },
        "3": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": params.negative, "clip": ["1", 1] }
        },
        "4": {
            "class_type": "EmptyLatentImage",
            "inputs": { "width": base_w, "height": base_h, "batch_size": 1 }
        },
        "5": {
            "class_type": "KSampler",
            "inputs": {
                "seed": params.seed,
                "steps": params.steps,
                "cfg": params.guidance,
                "sampler_name": params.sampler,
                "scheduler": params.scheduler,
                "denoise": 1.0,
                "model": ["1", 0],
                "positive": ["2", 0],
                "negative": ["3", 0],
                "latent_image": ["4", 0]
            }
        },
        "6": {
            "class_type": "LatentUpscale",
            "inputs": {
                "upscale_method": "nearest-exact",
                "width": final_w,
                "height": final_h,
                "crop": "disabled",
                "samples": ["5", 0]
            }
        },
        "7": {
            "class_type": "KSampler",
            "inputs": {
                "seed": params.seed,
                "steps": refine_steps(params.steps),
                "cfg": params.guidance,
                "sampler_name": params.sampler,
                "scheduler": params.scheduler,
                "denoise": params.refine_denoise,
                "model": ["1", 0],
                "positive": ["2", 0],
                "negative": ["3", 0],
                "latent_image": ["6", 0]
            }
        },
        "8": {
            "class_type": "VAEDecode",
            "inputs": { "samples": ["7", 0], "vae": ["1", 2] }
        },
        SAVE_NODE: {
            "class_type": "SaveImage",
            "inputs": { "filename_prefix": params.filename_prefix, "images": ["8", 0] }
        }
    })
}
