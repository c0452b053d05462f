//! Accès aux périphériques cpal
//!
//! Un stream cpal n'est pas transférable entre threads sur toutes les
//! plateformes. Chaque stream vit donc sur un thread dédié qui le construit,
//! le démarre sur commande et le détruit à l'arrêt. Le reste du crate ne
//! manipule que la poignée `StreamThread`, elle `Send + Sync`.

use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SupportedStreamConfig, SupportedStreamConfigRange};
use tracing::{debug, warn};

use crate::{
    AudioCapture, AudioConfig, AudioError, AudioResult, CaptureConfig, CompletionSender,
    CpalCapture, CpalOutput, DeviceProvider, OutputDevice,
};

/// Informations sur un stream ouvert
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    pub device_name: String,
    /// Fréquence réelle du matériel (peut différer de la fréquence demandée)
    pub sample_rate: u32,
    pub channels: u16,
}

enum StreamCommand {
    Play(std_mpsc::Sender<AudioResult<()>>),
    Shutdown,
}

/// Poignée vers le thread propriétaire d'un stream cpal
pub(crate) struct StreamThread {
    commands: std_mpsc::Sender<StreamCommand>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Lance le thread et y construit le stream avec `build`
    ///
    /// Retourne quand le stream est construit (ou que la construction a échoué) :
    /// une erreur de permission remonte donc immédiatement à l'appelant.
    pub(crate) fn spawn<F>(name: &str, build: F) -> AudioResult<(Self, StreamInfo)>
    where
        F: FnOnce() -> AudioResult<(cpal::Stream, StreamInfo)> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (commands, command_rx) = std_mpsc::channel();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok((stream, info)) => {
                        let _ = ready_tx.send(Ok(info));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Une poignée abandonnée ferme aussi le canal de commandes
                while let Ok(command) = command_rx.recv() {
                    match command {
                        StreamCommand::Play(reply) => {
                            let _ = reply.send(stream.play().map_err(AudioError::from));
                        }
                        StreamCommand::Shutdown => break,
                    }
                }

                drop(stream);
            })
            .map_err(|e| AudioError::InitializationError(format!("thread audio: {}", e)))?;

        let info = ready_rx.recv().map_err(|_| {
            AudioError::InitializationError("le thread audio s'est arrêté".to_string())
        })??;

        debug!(thread = name, device = %info.device_name, rate = info.sample_rate, "Stream construit");

        Ok((
            Self {
                commands,
                handle: Some(handle),
            },
            info,
        ))
    }

    /// Démarre le stream
    pub(crate) fn play(&self) -> AudioResult<()> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.commands
            .send(StreamCommand::Play(reply_tx))
            .map_err(|_| AudioError::DeviceDisconnected)?;
        reply_rx.recv().map_err(|_| AudioError::DeviceDisconnected)?
    }

    /// Détruit le stream et attend la fin du thread
    ///
    /// Après le retour, plus aucun callback cpal ne s'exécute.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.commands.send(StreamCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Le thread audio s'est terminé en panique");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Nom lisible d'un périphérique cpal
pub(crate) fn device_name(device: &cpal::Device) -> String {
    // description() remplace name() et fournit des informations plus complètes
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
        .unwrap_or_else(|| "Périphérique inconnu".to_string())
}

/// Formats d'échantillons pris en charge par nos callbacks
pub(crate) fn is_supported_format(format: SampleFormat) -> bool {
    matches!(format, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16)
}

/// Choisit la configuration matérielle la plus proche du format voulu
///
/// Préfère une plage qui accepte exactement `sample_rate`, avec le moins de
/// canaux possible. À défaut, retombe sur la configuration par défaut du
/// périphérique : l'appelant rééchantillonne alors lui-même.
pub(crate) fn select_config<I>(
    ranges: I,
    default: SupportedStreamConfig,
    sample_rate: u32,
) -> SupportedStreamConfig
where
    I: IntoIterator<Item = SupportedStreamConfigRange>,
{
    ranges
        .into_iter()
        .filter(|range| is_supported_format(range.sample_format()))
        .filter(|range| {
            range.min_sample_rate() <= sample_rate && sample_rate <= range.max_sample_rate()
        })
        .min_by_key(|range| range.channels())
        .map(|range| range.with_sample_rate(sample_rate))
        .unwrap_or(default)
}

/// Fournisseur de périphériques réels (cpal, hôte par défaut)
#[derive(Clone, Debug, Default)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }

    /// Décrit les périphériques par défaut (pour la commande `devices`)
    pub fn describe(&self) -> AudioResult<Vec<String>> {
        let host = cpal::default_host();
        let mut lines = vec![format!("Hôte audio : {:?}", host.id())];

        match host.default_input_device() {
            Some(device) => {
                let config = device.default_input_config()?;
                lines.push(format!(
                    "Entrée : {} ({} Hz, {} canaux, {:?})",
                    device_name(&device),
                    config.sample_rate(),
                    config.channels(),
                    config.sample_format()
                ));
            }
            None => lines.push("Entrée : aucune".to_string()),
        }

        match host.default_output_device() {
            Some(device) => {
                let config = device.default_output_config()?;
                lines.push(format!(
                    "Sortie : {} ({} Hz, {} canaux, {:?})",
                    device_name(&device),
                    config.sample_rate(),
                    config.channels(),
                    config.sample_format()
                ));
            }
            None => lines.push("Sortie : aucune".to_string()),
        }

        Ok(lines)
    }
}

impl DeviceProvider for CpalDevices {
    fn open_capture(&self, config: &CaptureConfig) -> AudioResult<Box<dyn AudioCapture>> {
        Ok(Box::new(CpalCapture::open(config.clone())?))
    }

    fn open_output(
        &self,
        config: &AudioConfig,
        completions: CompletionSender,
    ) -> AudioResult<Arc<dyn OutputDevice>> {
        Ok(Arc::new(CpalOutput::open(config, completions)?))
    }
}
