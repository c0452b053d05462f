//! Codec de frames audio : PCM flottant <-> PCM16 <-> texte de transport
//!
//! Le service distant échange de l'audio brut en PCM16 signé little-endian,
//! transporté en base64 standard dans des messages JSON.
//!
//! Tout ici est pur et sans état : aucune I/O, aucune allocation au-delà
//! du tampon de sortie.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::{AudioCodec, AudioFrame, CodecError, CodecResult, PlaybackBuffer, Sample};

/// Facteur d'échelle entre [-1.0, 1.0] et l'espace PCM16
const PCM16_SCALE: f32 = 32768.0;

/// Convertit des échantillons flottants en PCM16 little-endian
///
/// Chaque échantillon est borné à [-1.0, 1.0] puis multiplié par 32768.
/// `+1.0` sature à `i16::MAX`.
pub fn float_to_pcm16(samples: &[Sample]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * PCM16_SCALE)
            .clamp(i16::MIN as f32, i16::MAX as f32);
        bytes.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    bytes
}

/// Convertit du PCM16 little-endian entrelacé en échantillons flottants par canal
///
/// Un éventuel échantillon orphelin en fin de tampon (frame incomplète) est ignoré.
///
/// # Erreurs
/// - `CodecError::InvalidChannelCount` si `channel_count == 0`
/// - `CodecError::OddByteCount` si le tampon n'est pas aligné sur 2 octets
pub fn pcm16_to_float(bytes: &[u8], channel_count: u16) -> CodecResult<Vec<Vec<Sample>>> {
    if channel_count == 0 {
        return Err(CodecError::InvalidChannelCount(channel_count));
    }
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddByteCount(bytes.len()));
    }

    let channels = channel_count as usize;
    let frame_count = bytes.len() / 2 / channels;
    let mut output = vec![Vec::with_capacity(frame_count); channels];

    for (index, chunk) in bytes.chunks_exact(2).take(frame_count * channels).enumerate() {
        let value = i16::from_le_bytes([chunk[0], chunk[1]]);
        output[index % channels].push(value as f32 / PCM16_SCALE);
    }

    Ok(output)
}

/// Encode des octets pour le transport (base64 standard)
pub fn bytes_to_wire_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Décode le texte de transport en octets
///
/// # Erreurs
/// `CodecError::InvalidWireText` dès qu'un caractère hors alphabet ou un
/// padding invalide est rencontré ; le texte n'est jamais tronqué silencieusement.
pub fn wire_text_to_bytes(text: &str) -> CodecResult<Vec<u8>> {
    Ok(STANDARD.decode(text)?)
}

/// Rééchantillonnage linéaire d'un bloc isolé
///
/// Utilisé côté lecture quand le périphérique ne tourne pas à 24 kHz.
pub fn resample_linear(samples: &[Sample], from_rate: u32, to_rate: u32) -> Vec<Sample> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let mut resampler = LinearResampler::new(from_rate, to_rate);
    resampler.process(samples)
}

/// Rééchantillonnage linéaire vers un nombre exact d'échantillons
///
/// Côté lecture, la longueur est imposée par les bornes du buffer sur
/// l'horloge du périphérique : deux buffers consécutifs se touchent alors
/// à l'échantillon près, sans trou ni recouvrement.
pub fn resample_to_len(samples: &[Sample], len: usize) -> Vec<Sample> {
    if samples.len() == len {
        return samples.to_vec();
    }
    if samples.is_empty() {
        return vec![0.0; len];
    }

    let last = samples.len() - 1;
    let step = samples.len() as f64 / len as f64;
    (0..len)
        .map(|i| {
            let position = i as f64 * step;
            let index = (position.floor() as usize).min(last);
            let frac = (position - index as f64) as f32;
            let a = samples[index];
            let b = samples[(index + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

/// Rééchantillonneur linéaire en flux continu
///
/// Conserve le dernier échantillon du bloc précédent pour interpoler sans
/// discontinuité d'un bloc à l'autre (capture découpée par les callbacks cpal).
#[derive(Clone, Debug)]
pub struct LinearResampler {
    /// Pas d'avancement dans le signal source pour un échantillon de sortie
    step: f64,

    /// Position du prochain échantillon de sortie ; l'index 0 désigne `previous`
    position: f64,

    /// Dernier échantillon du bloc précédent
    previous: Sample,

    passthrough: bool,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate as f64,
            position: 1.0,
            previous: 0.0,
            passthrough: from_rate == to_rate,
        }
    }

    /// Traite un bloc et retourne les échantillons produits
    pub fn process(&mut self, input: &[Sample]) -> Vec<Sample> {
        if self.passthrough || input.is_empty() {
            return input.to_vec();
        }

        let n = input.len();
        let value_at = |index: usize, previous: Sample| {
            if index == 0 { previous } else { input[index - 1] }
        };

        let mut output = Vec::with_capacity((n as f64 / self.step) as usize + 1);
        while self.position <= n as f64 {
            let index = self.position.floor() as usize;
            let frac = (self.position - index as f64) as f32;
            let a = value_at(index, self.previous);
            let sample = if index == n {
                a
            } else {
                a + (value_at(index + 1, self.previous) - a) * frac
            };
            output.push(sample);
            self.position += self.step;
        }

        self.position -= n as f64;
        self.previous = input[n - 1];
        output
    }
}

/// Codec PCM16 / base64 pour les sessions vocales
///
/// Les deux sens n'ont pas la même fréquence : la capture est encodée à la
/// fréquence d'entrée, l'audio reçu est décodé à la fréquence de sortie.
#[derive(Clone, Debug)]
pub struct Pcm16Codec {
    input_rate: u32,
    output_rate: u32,
    output_channels: u16,
}

impl Pcm16Codec {
    /// Crée un codec
    ///
    /// # Arguments
    /// * `input_rate` - Fréquence des frames capturées (16 kHz)
    /// * `output_rate` - Fréquence de l'audio reçu (24 kHz)
    /// * `output_channels` - Nombre de canaux de l'audio reçu
    pub fn new(input_rate: u32, output_rate: u32, output_channels: u16) -> Self {
        Self {
            input_rate,
            output_rate,
            output_channels,
        }
    }
}

impl AudioCodec for Pcm16Codec {
    fn encode(&self, frame: &AudioFrame) -> Vec<u8> {
        float_to_pcm16(&frame.samples)
    }

    fn decode(&self, wire_text: &str) -> CodecResult<PlaybackBuffer> {
        let bytes = wire_text_to_bytes(wire_text)?;
        let channels = pcm16_to_float(&bytes, self.output_channels)?;
        Ok(PlaybackBuffer {
            channels,
            sample_rate: self.output_rate,
        })
    }

    fn codec_info(&self) -> String {
        format!(
            "PCM16 LE - entrée {} Hz, sortie {} Hz x{}",
            self.input_rate, self.output_rate, self.output_channels
        )
    }
}
