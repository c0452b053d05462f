//! Pipeline de capture audio utilisant cpal
//!
//! Ce module implémente le trait AudioCapture en utilisant la librairie cpal
//! (Cross-Platform Audio Library) pour capturer l'audio depuis le microphone.
//!
//! # Architecture thread
//!
//! cpal fonctionne avec des callbacks. Le callback temps réel se contente de
//! convertir les échantillons en mono f32 et de les pousser dans un channel
//! non borné : il ne bloque jamais et ne perd rien. Une tâche tokio dédiée
//! découpe ensuite le flux en frames de 4096 échantillons à 16 kHz, calcule
//! leur volume, les encode en PCM16 et les remet au sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{LinearResampler, float_to_pcm16};
use crate::device::{StreamInfo, StreamThread, device_name, select_config};
use crate::{
    AudioCapture, AudioConfig, AudioError, AudioFrame, AudioResult, CaptureConfig,
    CapturedFrame, FrameSink, Sample,
};

/// Encode une frame et mesure son volume
pub fn encode_frame(frame: &AudioFrame) -> CapturedFrame {
    CapturedFrame {
        pcm16: float_to_pcm16(&frame.samples),
        volume: frame.rms_level(),
        sequence_number: frame.sequence_number,
    }
}

/// Découpe un flux continu d'échantillons en frames de taille fixe
///
/// Le flux entrant est à la fréquence du matériel ; il est rééchantillonné
/// vers la fréquence de la configuration avant découpage.
pub struct FrameAssembler {
    resampler: LinearResampler,
    pending: Vec<Sample>,
    frame_samples: usize,
    next_sequence: u64,
}

impl FrameAssembler {
    pub fn new(device_rate: u32, config: &AudioConfig) -> Self {
        Self {
            resampler: LinearResampler::new(device_rate, config.sample_rate),
            pending: Vec::with_capacity(config.frame_samples * 2),
            frame_samples: config.frame_samples,
            next_sequence: 0,
        }
    }

    /// Ajoute un bloc d'échantillons et retourne les frames complètes
    pub fn push(&mut self, chunk: &[Sample]) -> Vec<CapturedFrame> {
        self.pending.extend(self.resampler.process(chunk));

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let samples: Vec<Sample> = self.pending.drain(..self.frame_samples).collect();
            let frame = AudioFrame::new(samples, self.next_sequence);
            self.next_sequence += 1;
            frames.push(encode_frame(&frame));
        }
        frames
    }

    /// Échantillons en attente d'une frame complète
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// Surveille le retard du sink sur le microphone
///
/// Un avertissement est émis une seule fois par épisode : il faut que le
/// retard repasse sous le seuil avant qu'un nouvel avertissement soit possible.
struct BacklogMonitor {
    threshold_samples: usize,
    in_episode: bool,
    warnings: Arc<AtomicU64>,
}

impl BacklogMonitor {
    fn new(threshold_samples: usize, warnings: Arc<AtomicU64>) -> Self {
        Self {
            threshold_samples: threshold_samples.max(1),
            in_episode: false,
            warnings,
        }
    }

    /// Retourne `true` si un nouvel épisode de retard commence
    fn observe(&mut self, backlog_samples: usize) -> bool {
        if backlog_samples < self.threshold_samples {
            self.in_episode = false;
            return false;
        }
        if self.in_episode {
            return false;
        }
        self.in_episode = true;
        self.warnings.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Moyenne des canaux de chaque frame entrelacée
fn downmix<T>(data: &[T], channels: usize) -> Vec<Sample>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| {
            frame.iter().map(|&s| f32::from_sample_(s)).sum::<f32>() / frame.len() as f32
        })
        .collect()
}

/// Implémentation de capture audio avec cpal
pub struct CpalCapture {
    config: CaptureConfig,

    /// Thread propriétaire du stream (None une fois arrêté)
    stream: Option<StreamThread>,

    info: StreamInfo,

    /// Blocs bruts venant du callback, pris au démarrage
    chunks: Option<mpsc::UnboundedReceiver<Vec<Sample>>>,

    /// Échantillons poussés par le callback et pas encore traités
    pending: Arc<AtomicUsize>,

    forwarder: Option<JoinHandle<()>>,

    is_recording: bool,

    backlog_warnings: Arc<AtomicU64>,
}

impl CpalCapture {
    /// Ouvre le microphone par défaut sans démarrer la capture
    ///
    /// # Erreurs
    /// - `AudioError::NoDeviceFound` si aucun microphone n'est disponible
    /// - `AudioError::DeviceUnavailable` si le système refuse l'accès
    /// - `AudioError::ConfigError` si aucun format exploitable n'est proposé
    pub fn open(config: CaptureConfig) -> AudioResult<Self> {
        config.validate().map_err(AudioError::ConfigError)?;

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let target_rate = config.audio.sample_rate;
        let callback_pending = Arc::clone(&pending);
        let (stream, info) = StreamThread::spawn("capture-audio", move || {
            build_input(target_rate, chunk_tx, callback_pending)
        })?;

        info!(
            device = %info.device_name,
            device_rate = info.sample_rate,
            channels = info.channels,
            "Périphérique de capture ouvert"
        );
        if info.sample_rate != target_rate {
            debug!(from = info.sample_rate, to = target_rate, "Rééchantillonnage de la capture");
        }

        Ok(Self {
            config,
            stream: Some(stream),
            info,
            chunks: Some(chunk_rx),
            pending,
            forwarder: None,
            is_recording: false,
            backlog_warnings: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Seuil de retard exprimé en échantillons au rythme du matériel
    fn backlog_threshold_samples(&self) -> usize {
        let audio = &self.config.audio;
        let frames = self.config.backlog_warning_frames * audio.frame_samples;
        (frames as u64 * self.info.sample_rate as u64 / audio.sample_rate as u64) as usize
    }
}

/// Construit le stream d'entrée (appelé sur le thread du stream)
fn build_input(
    target_rate: u32,
    chunks: mpsc::UnboundedSender<Vec<Sample>>,
    pending: Arc<AtomicUsize>,
) -> AudioResult<(cpal::Stream, StreamInfo)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoDeviceFound("entrée"))?;

    let supported = select_config(
        device.supported_input_configs()?,
        device.default_input_config()?,
        target_rate,
    );
    let stream_config: StreamConfig = supported.config();
    let info = StreamInfo {
        device_name: device_name(&device),
        sample_rate: stream_config.sample_rate,
        channels: stream_config.channels,
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &stream_config, chunks, pending)?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &stream_config, chunks, pending)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &stream_config, chunks, pending)?,
        other => {
            return Err(AudioError::ConfigError(format!(
                "Format d'échantillon non supporté : {:?}",
                other
            )));
        }
    };

    Ok((stream, info))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    chunks: mpsc::UnboundedSender<Vec<Sample>>,
    pending: Arc<AtomicUsize>,
) -> AudioResult<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let chunk = downmix(data, channels);
            pending.fetch_add(chunk.len(), Ordering::Relaxed);
            // Le récepteur disparaît à l'arrêt de la capture
            let _ = chunks.send(chunk);
        },
        |err| warn!(error = %err, "Erreur stream audio d'entrée"),
        None,
    )?;
    Ok(stream)
}

/// Tâche de découpage : bloc brut -> frames encodées -> sink
async fn forward_frames(
    mut chunks: mpsc::UnboundedReceiver<Vec<Sample>>,
    pending: Arc<AtomicUsize>,
    mut assembler: FrameAssembler,
    mut monitor: BacklogMonitor,
    mut sink: FrameSink,
) {
    while let Some(chunk) = chunks.recv().await {
        let backlog = pending
            .fetch_sub(chunk.len(), Ordering::Relaxed)
            .saturating_sub(chunk.len());
        if monitor.observe(backlog) {
            warn!(backlog_samples = backlog, "La capture prend du retard sur le microphone");
        }

        for frame in assembler.push(&chunk) {
            sink(frame);
        }
    }
    debug!("Fin du flux de capture");
}

#[async_trait]
impl AudioCapture for CpalCapture {
    async fn start(&mut self, sink: FrameSink) -> AudioResult<()> {
        let chunks = self.chunks.take().ok_or_else(|| {
            AudioError::InitializationError("capture déjà démarrée ou arrêtée".to_string())
        })?;
        let stream = self.stream.as_ref().ok_or(AudioError::DeviceDisconnected)?;

        let assembler = FrameAssembler::new(self.info.sample_rate, &self.config.audio);
        let monitor = BacklogMonitor::new(
            self.backlog_threshold_samples(),
            Arc::clone(&self.backlog_warnings),
        );
        self.forwarder = Some(tokio::spawn(forward_frames(
            chunks,
            Arc::clone(&self.pending),
            assembler,
            monitor,
            sink,
        )));

        stream.play()?;
        self.is_recording = true;

        info!(
            frame_samples = self.config.audio.frame_samples,
            rate = self.config.audio.sample_rate,
            "Capture audio démarrée"
        );
        Ok(())
    }

    async fn stop(&mut self) {
        let stream = self.stream.take();
        let forwarder = self.forwarder.take();
        if stream.is_none() && forwarder.is_none() {
            return;
        }

        // Le join du thread est bloquant mais bref
        if let Some(mut stream) = stream {
            let _ = tokio::task::spawn_blocking(move || stream.shutdown()).await;
        }
        if let Some(forwarder) = forwarder {
            forwarder.abort();
            let _ = forwarder.await;
        }

        self.chunks = None;
        self.is_recording = false;
        info!("Capture audio arrêtée");
    }

    fn is_recording(&self) -> bool {
        self.is_recording
    }

    fn backlog_warnings(&self) -> u64 {
        self.backlog_warnings.load(Ordering::Relaxed)
    }

    fn device_info(&self) -> String {
        format!("{} ({} Hz)", self.info.device_name, self.info.sample_rate)
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        // Le StreamThread détruit le stream dans son propre Drop
    }
}
