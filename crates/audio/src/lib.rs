//! Crate audio des sessions vocales temps réel
//!
//! Ce crate gère toute la chaîne audio :
//! - Codec PCM16 / base64 (format du service distant)
//! - Pipeline de capture microphone avec cpal (16 kHz mono, frames de 4096)
//! - Ordonnanceur de lecture sans trou sur l'horloge de sortie (24 kHz)
//! - Périphériques simulés pour les tests

pub mod config;      // Configuration audio
pub mod types;       // Types de données (AudioFrame, PlaybackBuffer, etc.)
pub mod traits;      // Traits abstraits
pub mod codec;       // PCM16 et texte de transport
pub mod device;      // Threads de stream cpal et fournisseur réel
pub mod capture;     // Pipeline de capture avec cpal
pub mod playback;    // Sortie cpal et ordonnanceur
pub mod simulated;   // Périphériques simulés
pub mod error;       // Gestion d'erreurs

// Réexports pour faciliter l'utilisation
pub use config::*;
pub use types::*;
pub use traits::*;
pub use error::*;

// Réexports des implémentations principales
pub use capture::{CpalCapture, FrameAssembler, encode_frame};
pub use codec::{
    LinearResampler, Pcm16Codec, bytes_to_wire_text, float_to_pcm16, pcm16_to_float,
    resample_linear, resample_to_len, wire_text_to_bytes,
};
pub use device::{CpalDevices, StreamInfo};
pub use playback::{CpalOutput, PlaybackScheduler};
pub use simulated::{SimulatedCapture, SimulatedDevices, SimulatedOutput};
