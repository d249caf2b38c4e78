use serde::{Deserialize, Serialize};

/// Presets de ecualizador disponibles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EqualizerPreset {
    Flat,
    Bass,
    Pop,
    Rock,
    Jazz,
    Classical,
    Electronic,
    Vocal,
}

impl EqualizerPreset {
    /// Ganancias de las 15 bandas del nodo (-0.25 a 1.0).
    pub fn gains(self) -> [f32; 15] {
        match self {
            EqualizerPreset::Flat => [0.0; 15],
            EqualizerPreset::Bass => [
                0.2, 0.15, 0.1, 0.05, 0.0, -0.05, -0.05, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            ],
            EqualizerPreset::Pop => [
                -0.02, -0.01, 0.08, 0.1, 0.15, 0.1, 0.03, -0.02, -0.035, -0.05, -0.05, -0.05,
                -0.05, -0.05, -0.05,
            ],
            EqualizerPreset::Rock => [
                0.3, 0.25, 0.2, 0.1, 0.05, -0.05, -0.15, -0.2, -0.1, -0.05, 0.05, 0.1, 0.2, 0.25,
                0.3,
            ],
            EqualizerPreset::Jazz => [
                0.1, 0.1, 0.05, 0.05, -0.05, -0.05, 0.0, 0.05, 0.05, 0.1, 0.1, 0.1, 0.05, 0.05,
                0.0,
            ],
            EqualizerPreset::Classical => [
                0.375, 0.35, 0.125, 0.0, 0.0, 0.125, 0.55, 0.05, 0.125, 0.25, 0.2, 0.25, 0.3,
                0.25, 0.3,
            ],
            EqualizerPreset::Electronic => [
                0.375, 0.35, 0.125, 0.0, 0.0, -0.125, -0.125, 0.0, 0.25, 0.125, 0.15, 0.2, 0.25,
                0.35, 0.4,
            ],
            EqualizerPreset::Vocal => [
                -0.1, -0.1, -0.05, 0.0, 0.1, 0.2, 0.25, 0.25, 0.2, 0.1, 0.0, -0.05, -0.05, -0.1,
                -0.1,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqualizerBand {
    pub band: u8,
    pub gain: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Karaoke {
    pub level: f32,
    pub mono_level: f32,
    pub filter_band: f32,
    pub filter_width: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timescale {
    pub speed: f32,
    pub pitch: f32,
    pub rate: f32,
}

/// Tremolo y vibrato comparten forma.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Oscillation {
    pub frequency: f32,
    pub depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    pub rotation_hz: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMix {
    pub left_to_left: f32,
    pub left_to_right: f32,
    pub right_to_left: f32,
    pub right_to_right: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LowPass {
    pub smoothing: f32,
}

/// Configuración de filtros de audio de un player.
///
/// Serializes to the node's `filters` object; unset filters are omitted so the
/// node keeps them disabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equalizer: Option<Vec<EqualizerBand>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<Karaoke>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Timescale>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<Oscillation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<Oscillation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_mix: Option<ChannelMix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<LowPass>,
    #[serde(skip)]
    preset: Option<EqualizerPreset>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aplica preset de ecualizador
    pub fn with_preset(mut self, preset: EqualizerPreset) -> Self {
        self.apply_preset(preset);
        self
    }

    pub fn apply_preset(&mut self, preset: EqualizerPreset) {
        self.equalizer = match preset {
            EqualizerPreset::Flat => None,
            _ => Some(
                preset
                    .gains()
                    .iter()
                    .enumerate()
                    .map(|(band, gain)| EqualizerBand {
                        band: band as u8,
                        gain: *gain,
                    })
                    .collect(),
            ),
        };
        self.preset = Some(preset);
    }

    /// Obtiene preset actual
    pub fn preset(&self) -> EqualizerPreset {
        self.preset.unwrap_or(EqualizerPreset::Flat)
    }

    /// Obtiene detalles del ecualizador
    pub fn describe(&self) -> String {
        let preset = match self.preset() {
            EqualizerPreset::Flat => "Plano",
            EqualizerPreset::Bass => "Bass Boost",
            EqualizerPreset::Pop => "Pop",
            EqualizerPreset::Rock => "Rock",
            EqualizerPreset::Jazz => "Jazz",
            EqualizerPreset::Classical => "Clásica",
            EqualizerPreset::Electronic => "Electrónica",
            EqualizerPreset::Vocal => "Vocal",
        };
        format!("Ecualizador: {}", preset)
    }

    /// Efecto nightcore: más rápido y más agudo.
    pub fn nightcore(mut self) -> Self {
        self.timescale = Some(Timescale {
            speed: 1.2,
            pitch: 1.2,
            rate: 1.0,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Filters::default()
    }
}
