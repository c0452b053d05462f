//! Gestion d'erreurs pour le système audio
//!
//! Deux familles d'erreurs coexistent ici :
//! - `AudioError` : acquisition et pilotage des périphériques (fatale pour une session)
//! - `CodecError` : conversion PCM16 / texte de transport (limitée au message fautif)

use thiserror::Error;

/// Énumération des erreurs liées aux périphériques audio
///
/// `thiserror::Error` génère automatiquement l'implémentation du trait Error
/// et nous permet de définir des messages d'erreur avec `#[error("...")]`
#[derive(Error, Debug)]
pub enum AudioError {
    /// Aucun périphérique audio (microphone ou haut-parleurs) n'a été trouvé
    #[error("Aucun périphérique audio trouvé ({0})")]
    NoDeviceFound(&'static str),

    /// Le système refuse l'accès au périphérique (permission micro, périphérique occupé)
    #[error("Périphérique audio indisponible: {0}")]
    DeviceUnavailable(String),

    /// Erreur lors de la configuration des paramètres audio (sample rate, format, etc.)
    #[error("Erreur de configuration audio: {0}")]
    ConfigError(String),

    /// Erreur provenant de la librairie cpal au démarrage du stream
    #[error("Erreur cpal: {0}")]
    CpalError(#[from] cpal::PlayStreamError),

    /// L'acquisition des périphériques a dépassé le délai autorisé
    #[error("Acquisition des périphériques trop lente (> {timeout_ms}ms)")]
    AcquisitionTimeout { timeout_ms: u64 },

    /// Le périphérique audio a été fermé ou débranché pendant l'utilisation
    #[error("Périphérique audio déconnecté")]
    DeviceDisconnected,

    /// Erreur lors de l'initialisation d'un composant
    #[error("Erreur d'initialisation: {0}")]
    InitializationError(String),
}

/// Conversion des erreurs cpal::BuildStreamError
///
/// `DeviceNotAvailable` est le cas typique d'une permission micro refusée
/// ou d'un périphérique déjà pris en exclusivité.
impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                AudioError::DeviceUnavailable("le périphérique n'est plus disponible".to_string())
            }
            other => AudioError::ConfigError(format!("Erreur construction stream: {:?}", other)),
        }
    }
}

/// Conversion des erreurs cpal::DefaultStreamConfigError
impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        AudioError::ConfigError(format!("Erreur config par défaut: {:?}", err))
    }
}

/// Conversion des erreurs cpal::SupportedStreamConfigsError
impl From<cpal::SupportedStreamConfigsError> for AudioError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        match err {
            cpal::SupportedStreamConfigsError::DeviceNotAvailable => {
                AudioError::DeviceUnavailable("configurations inaccessibles".to_string())
            }
            other => AudioError::ConfigError(format!("Erreur configs supportées: {:?}", other)),
        }
    }
}

/// Type Result personnalisé pour les périphériques
///
/// Au lieu d'écrire Result<T, AudioError> partout, on peut écrire AudioResult<T>
pub type AudioResult<T> = Result<T, AudioError>;

/// Erreurs du codec PCM16 / base64
///
/// Une erreur de codec ne concerne qu'un seul message : l'appelant le journalise
/// et passe au suivant, la session continue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Le texte reçu n'est pas du base64 standard valide
    #[error("Texte de transport invalide: {0}")]
    InvalidWireText(#[from] base64::DecodeError),

    /// Un tampon PCM16 doit contenir un nombre pair d'octets
    #[error("Tampon PCM16 de longueur impaire: {0} octets")]
    OddByteCount(usize),

    /// Un tampon audio a au moins un canal
    #[error("Nombre de canaux invalide: {0}")]
    InvalidChannelCount(u16),
}

/// Type Result pour le codec
pub type CodecResult<T> = Result<T, CodecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AudioError::NoDeviceFound("entrée");
        assert_eq!(error.to_string(), "Aucun périphérique audio trouvé (entrée)");

        let error = AudioError::ConfigError("Test".to_string());
        assert_eq!(error.to_string(), "Erreur de configuration audio: Test");

        let error = AudioError::AcquisitionTimeout { timeout_ms: 3000 };
        assert!(error.to_string().contains("3000"));
    }

    #[test]
    fn test_build_stream_error_mapping() {
        let error: AudioError = cpal::BuildStreamError::DeviceNotAvailable.into();
        assert!(matches!(error, AudioError::DeviceUnavailable(_)));

        let error: AudioError = cpal::BuildStreamError::StreamConfigNotSupported.into();
        assert!(matches!(error, AudioError::ConfigError(_)));
    }

    #[test]
    fn test_codec_error_display() {
        assert_eq!(
            CodecError::OddByteCount(3).to_string(),
            "Tampon PCM16 de longueur impaire: 3 octets"
        );
        assert!(CodecError::InvalidChannelCount(0).to_string().contains('0'));
    }
}
