//! Configuration audio pour les sessions vocales
//!
//! Ce module définit les paramètres audio des deux sens de la conversation.
//! Les fréquences sont volontairement asymétriques : le service distant attend
//! du 16 kHz mono en entrée et renvoie sa voix synthétique en 24 kHz mono.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fréquence de capture attendue par le service distant
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Fréquence de la voix synthétique renvoyée par le service
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Taille d'une frame de capture en échantillons (~256ms à 16 kHz)
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

/// Paramètres d'un flux audio (capture ou lecture)
///
/// `#[derive(Serialize, Deserialize)]` : permet de sauvegarder/charger depuis un fichier
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Fréquence d'échantillonnage en Hz
    pub sample_rate: u32,

    /// Nombre de canaux (1 = mono, suffisant pour la voix)
    pub channels: u16,

    /// Nombre d'échantillons par frame
    ///
    /// Côté capture, c'est la granularité d'envoi vers le service.
    /// Côté lecture, la taille des morceaux est imposée par le service et ce
    /// champ ne sert qu'à dimensionner les buffers.
    pub frame_samples: usize,
}

impl Default for AudioConfig {
    /// Par défaut : le format de capture
    fn default() -> Self {
        Self::capture()
    }
}

impl AudioConfig {
    /// Format d'entrée : 16 kHz mono, frames de 4096 échantillons
    pub fn capture() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: 1,
            frame_samples: CAPTURE_FRAME_SAMPLES,
        }
    }

    /// Format de sortie : 24 kHz mono
    pub fn playback() -> Self {
        Self {
            sample_rate: PLAYBACK_SAMPLE_RATE,
            channels: 1,
            frame_samples: CAPTURE_FRAME_SAMPLES,
        }
    }

    /// Durée d'une frame complète
    ///
    /// Exemple : 4096 / 16000 = 256ms
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples_to_seconds(self.frame_samples))
    }

    /// Convertit un nombre d'échantillons (par canal) en secondes
    pub fn samples_to_seconds(&self, samples: usize) -> f64 {
        samples as f64 / self.sample_rate as f64
    }

    /// Type MIME annoncé au service pour l'audio PCM16 brut
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Valide que la configuration est cohérente
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate < 8000 || self.sample_rate > 48000 {
            return Err(format!("Sample rate invalide: {} (doit être entre 8000 et 48000)", self.sample_rate));
        }

        if self.channels == 0 || self.channels > 2 {
            return Err(format!("Nombre de canaux invalide: {} (doit être 1 ou 2)", self.channels));
        }

        if self.frame_samples == 0 {
            return Err("Une frame doit contenir au moins un échantillon".to_string());
        }

        Ok(())
    }
}

/// Configuration du pipeline de capture
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Format produit par le pipeline (après rééchantillonnage éventuel)
    pub audio: AudioConfig,

    /// Nombre de frames en attente au-delà duquel on signale un retard
    ///
    /// Les frames ne sont jamais jetées : le retard est seulement journalisé.
    pub backlog_warning_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::capture(),
            backlog_warning_frames: 4,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.audio.validate()?;
        if self.backlog_warning_frames == 0 {
            return Err("Le seuil de retard doit être d'au moins une frame".to_string());
        }
        Ok(())
    }
}

/// Configuration de l'ordonnanceur de lecture
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Avance maximale du curseur sur l'horloge du périphérique avant avertissement
    ///
    /// Au-delà, la file se vide naturellement : le curseur n'est jamais ramené
    /// en arrière tant que des buffers restent programmés.
    pub max_lead: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_lead: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_preset() {
        let config = AudioConfig::capture();

        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.frame_samples, 4096);
        assert!((config.frame_duration().as_secs_f64() - 0.256).abs() < 1e-6);
        assert_eq!(config.mime_type(), "audio/pcm;rate=16000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_playback_preset() {
        let config = AudioConfig::playback();

        assert_eq!(config.sample_rate, 24000);
        assert!((config.samples_to_seconds(12000) - 0.5).abs() < 1e-9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = AudioConfig::capture();

        config.sample_rate = 1000; // Trop bas
        assert!(config.validate().is_err());

        config.sample_rate = 16000;
        config.channels = 0; // Invalide
        assert!(config.validate().is_err());

        config.channels = 1;
        config.frame_samples = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_capture_config_validation() {
        let mut config = CaptureConfig::default();
        assert!(config.validate().is_ok());

        config.backlog_warning_frames = 0;
        assert!(config.validate().is_err());
    }
}
