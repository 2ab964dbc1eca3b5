//! Display stretch: black/white point + gamma + per-channel scale.
//!
//! `apply` is a pure function from (buffer, preset) to an 8-bit frame:
//! same inputs, bit-identical output. Presets live in a bank of ten slots;
//! selecting one copies it into the active slot, which the operator can then
//! nudge parameter by parameter.

use crate::decode::PixelBuffer;

/// Smallest allowed distance between black and white point. Clamping to this
/// keeps the (white - black) divisor nonzero for any input.
pub const MIN_SPAN: f32 = 1e-4;

const GAMMA_RANGE: (f32, f32) = (0.1, 5.0);
const SCALE_RANGE: (f32, f32) = (0.1, 10.0);

/// Tone-mapping parameters over normalized [0,1] samples. Construction
/// clamps every field into its documented range; out-of-range input is never
/// kept as-is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StretchPreset {
    pub black: f32,
    pub white: f32,
    pub gamma: f32,
    pub channel_scale: [f32; 3],
}

impl StretchPreset {
    pub fn new(black: f32, white: f32, gamma: f32, channel_scale: [f32; 3]) -> Self {
        let black = black.clamp(0.0, 1.0 - MIN_SPAN);
        let white = white.clamp(black + MIN_SPAN, 1.0);
        let gamma = gamma.clamp(GAMMA_RANGE.0, GAMMA_RANGE.1);
        let channel_scale = channel_scale.map(|s| s.clamp(SCALE_RANGE.0, SCALE_RANGE.1));
        StretchPreset {
            black,
            white,
            gamma,
            channel_scale,
        }
    }

    /// Identity mapping: show the data as decoded.
    pub fn linear() -> Self {
        StretchPreset::new(0.0, 1.0, 1.0, [1.0; 3])
    }
}

/// Adjustable parameter of the active preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StretchParam {
    Black,
    White,
    Gamma,
    ScaleR,
    ScaleG,
    ScaleB,
}

/// Ten preset slots plus the active (custom) one. Slot layout follows the
/// original tool: 0 is linear, 1 the everyday default, and the rest walk up
/// in aggressiveness with a few inspection variants at the top.
pub struct PresetBank {
    slots: [StretchPreset; 10],
    active: StretchPreset,
}

impl PresetBank {
    pub fn new() -> Self {
        let slots = [
            StretchPreset::linear(),                               // 0: linear
            StretchPreset::new(0.001, 0.4, 0.7, [1.0; 3]),         // 1: default
            StretchPreset::new(0.002, 0.25, 0.8, [1.0; 3]),        // 2: medium
            StretchPreset::new(0.005, 0.1, 0.7, [1.0; 3]),         // 3: strong
            StretchPreset::new(0.01, 0.05, 0.5, [1.0; 3]),         // 4: max
            StretchPreset::new(0.0, 0.3, 0.6, [1.0; 3]),           // 5: shadow lift
            StretchPreset::new(0.02, 0.6, 1.2, [1.0; 3]),          // 6: highlights
            StretchPreset::new(0.05, 0.2, 1.0, [1.0; 3]),          // 7: high contrast
            StretchPreset::new(0.0, 1.0, 0.45, [1.0; 3]),          // 8: flat inspect
            StretchPreset::new(0.0005, 0.03, 0.9, [1.0; 3]),       // 9: background check
        ];
        PresetBank {
            slots,
            active: slots[1],
        }
    }

    pub fn active(&self) -> StretchPreset {
        self.active
    }

    /// Copy slot `key` into the active slot. Returns false for keys past 9.
    pub fn select(&mut self, key: usize) -> bool {
        match self.slots.get(key) {
            Some(p) => {
                self.active = *p;
                true
            }
            None => false,
        }
    }

    /// Nudge one parameter of the active preset; the result is re-clamped as
    /// a whole so black/white can never cross.
    pub fn adjust(&mut self, param: StretchParam, delta: f32) -> StretchPreset {
        let p = self.active;
        let mut black = p.black;
        let mut white = p.white;
        let mut gamma = p.gamma;
        let mut scale = p.channel_scale;
        match param {
            StretchParam::Black => black += delta,
            StretchParam::White => white += delta,
            StretchParam::Gamma => gamma += delta,
            StretchParam::ScaleR => scale[0] += delta,
            StretchParam::ScaleG => scale[1] += delta,
            StretchParam::ScaleB => scale[2] += delta,
        }
        self.active = StretchPreset::new(black, white, gamma, scale);
        self.active
    }
}

/// Displayable 8-bit frame, interleaved like the source buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

/// Map normalized samples to display bytes:
/// `clamp((s·scale[c] − black)/(white − black), 0, 1)^(1/gamma) · 255`.
/// Preset validation guarantees `white > black`, so the divisor is nonzero.
pub fn apply(buffer: &PixelBuffer, preset: &StretchPreset) -> Frame {
    let span = preset.white - preset.black;
    let inv_gamma = 1.0 / preset.gamma;
    let channels = buffer.channels.max(1) as usize;

    let pixels = buffer
        .samples
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            let scale = preset.channel_scale[i % channels % 3];
            let v = ((s * scale - preset.black) / span).clamp(0.0, 1.0);
            (v.powf(inv_gamma) * 255.0 + 0.5) as u8
        })
        .collect();

    Frame {
        pixels,
        width: buffer.width,
        height: buffer.height,
        channels: buffer.channels,
    }
}
