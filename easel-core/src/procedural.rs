use std::ops::Range;

use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::{
    GenerationParams, LoadError, ModelId, PipelineManifest, PipelineOptions, Precision,
    TextToImage,
};

const DEFAULT_PALETTE: [[u8; 3]; 5] = [
    [11, 30, 61],
    [29, 78, 137],
    [122, 158, 126],
    [244, 211, 94],
    [238, 150, 75],
];

/// Rows rendered per band when sliced rendering is on.
const ROW_BAND: u32 = 64;

/// Deterministic layered-interference renderer.
///
/// Stands in for a diffusion backend behind [`TextToImage`]: the output is a
/// pure function of the manifest and [`GenerationParams`], so a fixed
/// (model, seed, parameters) triple reproduces byte-identical images.
pub struct ProceduralPipeline {
    manifest: PipelineManifest,
    options: PipelineOptions,
    palette: Vec<[u8; 3]>,
}

/// One interference layer; `steps` controls how many are mixed.
struct Wave {
    fx: f64,
    fy: f64,
    swirl: f64,
    phase: f64,
    weight: f64,
}

impl ProceduralPipeline {
    pub fn new(
        model: &ModelId,
        manifest: PipelineManifest,
        options: PipelineOptions,
    ) -> Result<Self, LoadError> {
        let palette = if manifest.palette.is_empty() {
            DEFAULT_PALETTE.to_vec()
        } else {
            manifest
                .palette
                .iter()
                .map(|hex| parse_hex_color(hex))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|reason| LoadError::Manifest {
                    model: model.clone(),
                    reason,
                })?
        };
        if palette.len() < 2 {
            return Err(LoadError::Manifest {
                model: model.clone(),
                reason: "palette needs at least two stops".to_string(),
            });
        }
        Ok(Self {
            manifest,
            options,
            palette,
        })
    }

    fn waves(&self, params: &GenerationParams) -> Vec<Wave> {
        // Seed and prompt digest together key the layer parameters, so the
        // same seed still yields distinct images for distinct prompts.
        let digest = Sha256::digest(params.prompt.as_bytes());
        let mut key = [0u8; 8];
        key.copy_from_slice(&digest[..8]);
        let mut rng = StdRng::seed_from_u64(params.seed ^ u64::from_le_bytes(key));

        let count = params.steps.clamp(4, 64) as usize;
        let mut waves = Vec::with_capacity(count);
        for i in 0..count {
            waves.push(Wave {
                fx: rng.random_range(0.5..9.0),
                fy: rng.random_range(0.5..9.0),
                swirl: rng.random_range(-2.0..2.0),
                phase: rng.random_range(0.0..std::f64::consts::TAU),
                weight: 1.0 / (1.0 + i as f64 * 0.35),
            });
        }
        waves
    }

    fn triggered(&self, prompt: &str) -> bool {
        self.manifest
            .trigger_token
            .as_deref()
            .is_some_and(|token| prompt.contains(token))
    }

    /// Maps a value in [0, 1] across the palette stops.
    fn shade(&self, t: f64) -> Rgb<u8> {
        let scaled = t.clamp(0.0, 1.0) * (self.palette.len() - 1) as f64;
        let idx = (scaled as usize).min(self.palette.len() - 2);
        let frac = scaled - idx as f64;
        let lo = self.palette[idx];
        let hi = self.palette[idx + 1];
        let mut rgb = [0u8; 3];
        for channel in 0..3 {
            let value = lo[channel] as f64 + (hi[channel] as f64 - lo[channel] as f64) * frac;
            rgb[channel] = value.round() as u8;
        }
        Rgb(rgb)
    }

    fn render_rows(
        &self,
        image: &mut RgbImage,
        rows: Range<u32>,
        waves: &[Wave],
        contrast: f64,
        emphasize: bool,
    ) {
        let width = image.width();
        let height = image.height();
        for y in rows {
            let v = (y as f64 + 0.5) / height as f64;
            for x in 0..width {
                let u = (x as f64 + 0.5) / width as f64;
                let mut value = match self.options.precision {
                    Precision::Full => field_f64(waves, u, v),
                    Precision::Half => field_f32(waves, u, v),
                };
                if emphasize {
                    let dx = u - 0.5;
                    let dy = v - 0.5;
                    value += 0.8 * (1.0 - 2.0 * (dx * dx + dy * dy).sqrt());
                }
                let t = ((value * contrast).tanh() + 1.0) / 2.0;
                image.put_pixel(x, y, self.shade(t));
            }
        }
    }
}

impl TextToImage for ProceduralPipeline {
    fn generate(&self, params: &GenerationParams) -> anyhow::Result<RgbImage> {
        if params.width == 0 || params.height == 0 {
            anyhow::bail!("image dimensions must be non-zero");
        }
        let waves = self.waves(params);
        let contrast = params.guidance / 7.5;
        let emphasize = self.triggered(&params.prompt);
        let mut image = RgbImage::new(params.width, params.height);
        if self.options.sliced_rendering {
            let mut row = 0;
            while row < params.height {
                let end = (row + ROW_BAND).min(params.height);
                self.render_rows(&mut image, row..end, &waves, contrast, emphasize);
                row = end;
            }
        } else {
            self.render_rows(&mut image, 0..params.height, &waves, contrast, emphasize);
        }
        Ok(image)
    }
}

fn field_f64(waves: &[Wave], u: f64, v: f64) -> f64 {
    let mut acc = 0.0;
    for wave in waves {
        let a = std::f64::consts::TAU * (wave.fx * u + wave.swirl * u * v) + wave.phase;
        let b = std::f64::consts::TAU * wave.fy * v - wave.phase;
        acc += wave.weight * a.sin() * b.cos();
    }
    acc
}

fn field_f32(waves: &[Wave], u: f64, v: f64) -> f64 {
    let (u, v) = (u as f32, v as f32);
    let mut acc = 0.0f32;
    for wave in waves {
        let a = std::f32::consts::TAU * (wave.fx as f32 * u + wave.swirl as f32 * u * v)
            + wave.phase as f32;
        let b = std::f32::consts::TAU * wave.fy as f32 * v - wave.phase as f32;
        acc += wave.weight as f32 * a.sin() * b.cos();
    }
    acc as f64
}

fn parse_hex_color(hex: &str) -> Result<[u8; 3], String> {
    let raw = hex.strip_prefix('#').unwrap_or(hex);
    if raw.len() != 6 || !raw.is_ascii() {
        return Err(format!("bad palette color `{hex}`, expected `#rrggbb`"));
    }
    let mut rgb = [0u8; 3];
    for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk).map_err(|_| format!("bad palette color `{hex}`"))?;
        rgb[i] = u8::from_str_radix(pair, 16)
            .map_err(|_| format!("bad palette color `{hex}`, expected `#rrggbb`"))?;
    }
    Ok(rgb)
}
