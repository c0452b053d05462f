//! Traits abstraits pour le système audio
//!
//! Ce module définit les interfaces que doivent implémenter les composants
//! audio. La session ne connaît que ces traits : en production ils sont
//! implémentés avec cpal, dans les tests par les périphériques simulés.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    AudioConfig, AudioFrame, AudioResult, CaptureConfig, CapturedFrame, CodecResult,
    PlaybackBuffer, Sample, ScheduledUnit, UnitId,
};

/// Destinataire des frames capturées
///
/// Appelé depuis une tâche dédiée, jamais depuis le callback temps réel.
pub type FrameSink = Box<dyn FnMut(CapturedFrame) + Send>;

/// Canal par lequel un périphérique de sortie signale la fin d'un buffer
pub type CompletionSender = mpsc::UnboundedSender<UnitId>;

/// Trait pour capturer l'audio depuis un périphérique d'entrée
///
/// Ce trait abstrait permet d'utiliser différentes implémentations :
/// - CpalCapture : implémentation avec la librairie cpal
/// - SimulatedCapture : frames scriptées pour les tests
///
/// `#[async_trait]` permet d'avoir des fonctions async dans les traits.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Démarre la capture et livre chaque frame au `sink`
    ///
    /// Ne bloque pas l'appelant : les frames arrivent au rythme naturel du
    /// périphérique (environ toutes les 256ms pour 4096 échantillons à 16 kHz).
    ///
    /// # Erreurs
    /// - `AudioError::DeviceUnavailable` : permission refusée ou périphérique pris
    /// - `AudioError::InitializationError` : capture déjà démarrée ou déjà arrêtée
    async fn start(&mut self, sink: FrameSink) -> AudioResult<()>;

    /// Arrête la capture et libère le microphone
    ///
    /// Idempotent : un second appel ne fait rien. Après le retour, plus
    /// aucune frame n'est livrée au sink.
    async fn stop(&mut self);

    /// Vérifie si la capture est active
    fn is_recording(&self) -> bool;

    /// Nombre d'épisodes de retard signalés (le sink ne suit pas)
    fn backlog_warnings(&self) -> u64 {
        0
    }

    /// Retourne des informations sur le périphérique utilisé
    fn device_info(&self) -> String {
        "Périphérique inconnu".to_string()
    }
}

/// Trait pour un périphérique de sortie piloté par horloge
///
/// Le périphérique joue des buffers programmés à un instant précis de sa
/// propre horloge. Il signale la fin de chaque buffer sur le canal de
/// complétion fourni à l'ouverture.
///
/// Toutes les méthodes sont synchrones et rapides : elles sont appelées
/// sous le verrou de l'ordonnanceur.
pub trait OutputDevice: Send + Sync {
    /// Heure courante de l'horloge du périphérique, en secondes
    fn current_time(&self) -> f64;

    /// Fréquence d'échantillonnage attendue par `schedule`
    fn sample_rate(&self) -> u32;

    /// Programme la lecture de `samples` (mono) à `unit.start_at`
    ///
    /// # Erreurs
    /// `AudioError::DeviceDisconnected` si le périphérique est fermé
    fn schedule(&self, unit: ScheduledUnit, samples: Vec<Sample>) -> AudioResult<()>;

    /// Interrompt immédiatement un buffer programmé (sans effet s'il est fini)
    fn stop(&self, id: UnitId);

    /// Ferme le périphérique ; plus rien ne sera joué ensuite
    fn close(&self) -> AudioResult<()>;

    fn device_info(&self) -> String {
        "Périphérique de sortie inconnu".to_string()
    }
}

/// Trait pour encoder/décoder l'audio vers le format de transport
pub trait AudioCodec: Send + Sync {
    /// Encode une frame capturée en PCM16
    fn encode(&self, frame: &AudioFrame) -> Vec<u8>;

    /// Décode un morceau d'audio reçu (texte de transport) en buffer jouable
    ///
    /// # Erreurs
    /// `CodecError` si le texte ou le PCM16 est mal formé
    fn decode(&self, wire_text: &str) -> CodecResult<PlaybackBuffer>;

    /// Retourne des informations sur la configuration du codec
    fn codec_info(&self) -> String {
        "Codec audio".to_string()
    }
}

/// Fournisseur de périphériques
///
/// La session acquiert ses périphériques à travers ce trait pendant la
/// transition vers CONNECTING. Les appels sont bloquants : la session les
/// exécute hors du runtime async, sous un délai maximal.
pub trait DeviceProvider: Send + Sync {
    /// Ouvre le microphone (sans démarrer la capture)
    fn open_capture(&self, config: &CaptureConfig) -> AudioResult<Box<dyn AudioCapture>>;

    /// Ouvre la sortie audio
    ///
    /// Le périphérique envoie l'identifiant de chaque buffer terminé sur `completions`.
    fn open_output(
        &self,
        config: &AudioConfig,
        completions: CompletionSender,
    ) -> AudioResult<Arc<dyn OutputDevice>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimulatedCapture, SimulatedOutput};

    // Vérifie que les traits restent utilisables comme objets

    #[test]
    fn test_trait_objects() {
        let capture: Box<dyn AudioCapture> = Box::new(SimulatedCapture::new(Vec::new()));
        assert!(!capture.is_recording());
        assert_eq!(capture.backlog_warnings(), 0);

        let (tx, _rx) = mpsc::unbounded_channel();
        let output: Arc<dyn OutputDevice> = Arc::new(SimulatedOutput::new(24000, tx));
        assert_eq!(output.sample_rate(), 24000);
        assert_eq!(output.current_time(), 0.0);
    }
}
