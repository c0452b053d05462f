//! Lecture audio : périphérique de sortie cpal et ordonnanceur sans trou
//!
//! La lecture est pilotée par horloge : chaque buffer reçu est programmé à un
//! instant précis de l'horloge du périphérique, juste à la fin du précédent.
//!
//! - `CpalOutput` : le périphérique. Son horloge est le nombre d'échantillons
//!   réellement rendus par le callback cpal.
//! - `PlaybackScheduler` : tient le curseur "prochaine heure de lecture" et
//!   l'ensemble des buffers programmés non terminés.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{resample_linear, resample_to_len};
use crate::device::{StreamInfo, StreamThread, device_name, select_config};
use crate::{
    AudioConfig, AudioError, AudioResult, CompletionSender, OutputDevice, PlaybackBuffer,
    Sample, ScheduledUnit, SchedulerConfig, UnitId,
};

/// Un buffer programmé, converti à la fréquence du matériel
struct ActiveUnit {
    id: UnitId,
    start_frame: u64,
    samples: Vec<Sample>,
}

impl ActiveUnit {
    /// Place un buffer sur l'horloge du périphérique
    ///
    /// Le début et la fin sont arrondis chacun à l'échantillon : la fin d'un
    /// buffer et le début du suivant tombent sur le même échantillon, quelle
    /// que soit la fréquence du matériel.
    fn place(unit: ScheduledUnit, samples: &[Sample], device_rate: u32) -> Self {
        let rate = device_rate as f64;
        let start_frame = (unit.start_at * rate).round() as u64;
        let end_frame = (unit.end_at() * rate).round() as u64;
        let len = end_frame.saturating_sub(start_frame) as usize;

        Self {
            id: unit.id,
            start_frame,
            samples: resample_to_len(samples, len),
        }
    }

    fn sample_at(&self, position: u64) -> Sample {
        position
            .checked_sub(self.start_frame)
            .and_then(|index| self.samples.get(index as usize))
            .copied()
            .unwrap_or(0.0)
    }

    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// État partagé entre le callback cpal et les appels de l'ordonnanceur
struct OutputShared {
    /// Horloge du périphérique en échantillons rendus
    frames_rendered: AtomicU64,

    units: Mutex<Vec<ActiveUnit>>,

    completions: CompletionSender,
}

impl OutputShared {
    /// Remplit un buffer de sortie cpal
    ///
    /// Appelé sur le thread temps réel : `try_lock` uniquement. Si
    /// l'ordonnanceur tient le verrou, ce cycle est rendu en silence mais
    /// l'horloge avance quand même.
    fn render<T>(&self, data: &mut [T], channels: usize)
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = channels.max(1);
        let frames = (data.len() / channels) as u64;
        let start = self.frames_rendered.load(Ordering::Acquire);

        match self.units.try_lock() {
            Ok(mut units) => {
                for (i, frame) in data.chunks_mut(channels).enumerate() {
                    let position = start + i as u64;
                    let value: Sample = units.iter().map(|unit| unit.sample_at(position)).sum();
                    frame.fill(T::from_sample_(value.clamp(-1.0, 1.0)));
                }

                let end = start + frames;
                units.retain(|unit| {
                    let finished = unit.end_frame() <= end;
                    if finished {
                        let _ = self.completions.send(unit.id);
                    }
                    !finished
                });
            }
            Err(_) => data.fill(T::EQUILIBRIUM),
        }

        self.frames_rendered.fetch_add(frames, Ordering::Release);
    }
}

/// Périphérique de sortie cpal
pub struct CpalOutput {
    shared: Arc<OutputShared>,

    /// Fréquence des buffers reçus par `schedule`
    source_rate: u32,

    info: StreamInfo,

    stream: Mutex<Option<StreamThread>>,

    closed: AtomicBool,
}

impl CpalOutput {
    /// Ouvre la sortie par défaut et démarre son horloge
    ///
    /// Le stream joue du silence tant que rien n'est programmé.
    ///
    /// # Erreurs
    /// - `AudioError::NoDeviceFound` si aucune sortie n'est disponible
    /// - `AudioError::ConfigError` si aucun format exploitable n'est proposé
    pub fn open(config: &AudioConfig, completions: CompletionSender) -> AudioResult<Self> {
        config.validate().map_err(AudioError::ConfigError)?;

        let shared = Arc::new(OutputShared {
            frames_rendered: AtomicU64::new(0),
            units: Mutex::new(Vec::new()),
            completions,
        });

        let target_rate = config.sample_rate;
        let callback_shared = Arc::clone(&shared);
        let (stream, info) = StreamThread::spawn("lecture-audio", move || {
            build_output(target_rate, callback_shared)
        })?;
        stream.play()?;

        info!(
            device = %info.device_name,
            device_rate = info.sample_rate,
            channels = info.channels,
            "Périphérique de lecture ouvert"
        );

        Ok(Self {
            shared,
            source_rate: config.sample_rate,
            info,
            stream: Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
        })
    }
}

fn build_output(
    target_rate: u32,
    shared: Arc<OutputShared>,
) -> AudioResult<(cpal::Stream, StreamInfo)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoDeviceFound("sortie"))?;

    let supported = select_config(
        device.supported_output_configs()?,
        device.default_output_config()?,
        target_rate,
    );
    let stream_config: StreamConfig = supported.config();
    let info = StreamInfo {
        device_name: device_name(&device),
        sample_rate: stream_config.sample_rate,
        channels: stream_config.channels,
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &stream_config, shared)?,
        SampleFormat::I16 => build_output_stream::<i16>(&device, &stream_config, shared)?,
        SampleFormat::U16 => build_output_stream::<u16>(&device, &stream_config, shared)?,
        other => {
            return Err(AudioError::ConfigError(format!(
                "Format d'échantillon non supporté : {:?}",
                other
            )));
        }
    };

    Ok((stream, info))
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<OutputShared>,
) -> AudioResult<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| shared.render(data, channels),
        |err| warn!(error = %err, "Erreur stream audio de sortie"),
        None,
    )?;
    Ok(stream)
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        self.shared.frames_rendered.load(Ordering::Acquire) as f64 / self.info.sample_rate as f64
    }

    fn sample_rate(&self) -> u32 {
        self.source_rate
    }

    fn schedule(&self, unit: ScheduledUnit, samples: Vec<Sample>) -> AudioResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AudioError::DeviceDisconnected);
        }

        let active = ActiveUnit::place(unit, &samples, self.info.sample_rate);
        self.shared
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(active);
        Ok(())
    }

    fn stop(&self, id: UnitId) {
        self.shared
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|unit| unit.id != id);
    }

    fn close(&self) -> AudioResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut stream) = stream {
            stream.shutdown();
        }
        self.shared
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        info!("Périphérique de lecture fermé");
        Ok(())
    }

    fn device_info(&self) -> String {
        format!("{} ({} Hz)", self.info.device_name, self.info.sample_rate)
    }
}

/// État protégé de l'ordonnanceur
struct SchedulerState {
    /// Prochaine heure de lecture, en secondes d'horloge du périphérique
    cursor: f64,

    /// Buffers programmés dont la fin n'a pas encore été observée
    in_flight: BTreeSet<UnitId>,

    next_id: UnitId,
}

/// Ordonnanceur de lecture sans trou ni chevauchement
///
/// Toutes les mutations passent par un seul verrou : `enqueue` et `stop_all`
/// peuvent être appelés depuis des tâches différentes sans se marcher dessus.
///
/// # Dérive
/// Le curseur n'est jamais ramené en arrière tant que des buffers restent
/// programmés. Si l'avance dépasse `max_lead`, un avertissement est émis et
/// la file se vide d'elle-même ; `stop_all` reste le seul moyen de resynchroniser.
pub struct PlaybackScheduler {
    device: Arc<dyn OutputDevice>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
}

impl PlaybackScheduler {
    pub fn new(device: Arc<dyn OutputDevice>, config: SchedulerConfig) -> Self {
        let cursor = device.current_time();
        Self {
            device,
            config,
            state: Mutex::new(SchedulerState {
                cursor,
                in_flight: BTreeSet::new(),
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Programme un buffer juste après le précédent
    ///
    /// `start_at = max(curseur, maintenant)` : après une longue pause, le
    /// curseur périmé est ramené à l'heure courante au lieu de "rattraper".
    pub fn enqueue(&self, buffer: &PlaybackBuffer) -> AudioResult<ScheduledUnit> {
        let mut samples = buffer.to_mono();
        let device_rate = self.device.sample_rate();
        if buffer.sample_rate != device_rate {
            samples = resample_linear(&samples, buffer.sample_rate, device_rate);
        }

        let mut state = self.lock();
        let now = self.device.current_time();
        let start_at = state.cursor.max(now);

        let lead = start_at - now;
        if lead > self.config.max_lead.as_secs_f64() {
            warn!(
                lead_secs = lead,
                in_flight = state.in_flight.len(),
                "Le curseur de lecture est loin devant l'horloge, la file se videra d'elle-même"
            );
        }

        let unit = ScheduledUnit {
            id: state.next_id,
            start_at,
            duration: buffer.duration(),
        };
        self.device.schedule(unit, samples)?;

        state.next_id += 1;
        state.cursor = unit.end_at();
        state.in_flight.insert(unit.id);

        debug!(id = unit.id, start_at = unit.start_at, duration = unit.duration, "Buffer programmé");
        Ok(unit)
    }

    /// Arrête immédiatement tous les buffers programmés
    ///
    /// Vide l'ensemble en vol et ramène le curseur à l'heure courante.
    /// Retourne le nombre de buffers interrompus.
    pub fn stop_all(&self) -> usize {
        let mut state = self.lock();
        let stopped = state.in_flight.len();
        for &id in &state.in_flight {
            self.device.stop(id);
        }
        state.in_flight.clear();
        state.cursor = self.device.current_time();

        if stopped > 0 {
            debug!(stopped, "Lecture interrompue");
        }
        stopped
    }

    /// Retire un buffer dont la fin de lecture a été observée
    pub fn on_unit_ended(&self, id: UnitId) {
        self.lock().in_flight.remove(&id);
    }

    /// Consomme les notifications de fin du périphérique
    ///
    /// Se termine quand le périphérique ferme son canal de complétion.
    pub async fn run_completions(
        self: Arc<Self>,
        mut completions: mpsc::UnboundedReceiver<UnitId>,
    ) {
        while let Some(id) = completions.recv().await {
            self.on_unit_ended(id);
        }
    }

    pub fn cursor(&self) -> f64 {
        self.lock().cursor
    }

    /// Identifiants des buffers encore en vol (ordre croissant)
    pub fn in_flight(&self) -> Vec<UnitId> {
        self.lock().in_flight.iter().copied().collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn device(&self) -> &Arc<dyn OutputDevice> {
        &self.device
    }
}
