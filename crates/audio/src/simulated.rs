//! Périphériques audio simulés
//!
//! Permettent de tester la session sans matériel : horloge de sortie pilotée
//! à la main, microphone qui rejoue des frames scriptées, et fournisseur qui
//! compte les acquisitions et libérations.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::capture::encode_frame;
use crate::{
    AudioCapture, AudioConfig, AudioError, AudioFrame, AudioResult, CaptureConfig,
    CompletionSender, DeviceProvider, FrameSink, OutputDevice, Sample, ScheduledUnit, UnitId,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sortie audio simulée avec horloge manuelle
///
/// Les buffers se terminent quand `advance` fait passer l'horloge au-delà de
/// leur fin ; la complétion est alors envoyée comme le ferait le matériel.
pub struct SimulatedOutput {
    sample_rate: u32,
    clock: Mutex<f64>,
    active: Mutex<Vec<ScheduledUnit>>,
    history: Mutex<Vec<(ScheduledUnit, usize)>>,
    stopped: Mutex<Vec<UnitId>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    completions: CompletionSender,
}

impl SimulatedOutput {
    pub fn new(sample_rate: u32, completions: CompletionSender) -> Self {
        Self {
            sample_rate,
            clock: Mutex::new(0.0),
            active: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            completions,
        }
    }

    /// Place l'horloge à `seconds` sans déclencher de complétion
    pub fn set_time(&self, seconds: f64) {
        *lock(&self.clock) = seconds;
    }

    /// Avance l'horloge et termine les buffers dépassés
    pub fn advance(&self, seconds: f64) {
        let now = {
            let mut clock = lock(&self.clock);
            *clock += seconds;
            *clock
        };

        lock(&self.active).retain(|unit| {
            let finished = unit.end_at() <= now;
            if finished {
                let _ = self.completions.send(unit.id);
            }
            !finished
        });
    }

    /// Tous les buffers programmés, dans l'ordre des appels
    pub fn scheduled_units(&self) -> Vec<ScheduledUnit> {
        lock(&self.history).iter().map(|(unit, _)| *unit).collect()
    }

    /// Nombre d'échantillons de chaque buffer programmé
    pub fn scheduled_sample_counts(&self) -> Vec<usize> {
        lock(&self.history).iter().map(|(_, count)| *count).collect()
    }

    /// Buffers interrompus par `stop`, dans l'ordre des appels
    pub fn stopped_units(&self) -> Vec<UnitId> {
        lock(&self.stopped).clone()
    }

    /// Buffers programmés ni terminés ni interrompus
    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl OutputDevice for SimulatedOutput {
    fn current_time(&self) -> f64 {
        *lock(&self.clock)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn schedule(&self, unit: ScheduledUnit, samples: Vec<Sample>) -> AudioResult<()> {
        if self.is_closed() {
            return Err(AudioError::DeviceDisconnected);
        }
        lock(&self.history).push((unit, samples.len()));
        lock(&self.active).push(unit);
        Ok(())
    }

    fn stop(&self, id: UnitId) {
        lock(&self.active).retain(|unit| unit.id != id);
        lock(&self.stopped).push(id);
    }

    fn close(&self) -> AudioResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.active).clear();
        Ok(())
    }

    fn device_info(&self) -> String {
        format!("Sortie simulée ({} Hz)", self.sample_rate)
    }
}

/// Microphone simulé qui rejoue des frames scriptées
///
/// Chaque capture est libérée une seule fois, au premier `stop` ou à la
/// destruction ; le compteur optionnel enregistre ces libérations.
pub struct SimulatedCapture {
    frames: Vec<AudioFrame>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
    started: bool,
    recording: Arc<AtomicBool>,
    released: bool,
    releases: Option<Arc<AtomicUsize>>,
}

impl SimulatedCapture {
    pub fn new(frames: Vec<AudioFrame>) -> Self {
        Self {
            frames,
            interval: Duration::ZERO,
            task: None,
            started: false,
            recording: Arc::new(AtomicBool::new(false)),
            released: false,
            releases: None,
        }
    }

    /// Délai entre deux frames (zéro = toutes d'un coup)
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Compteur incrémenté à la libération du microphone
    pub fn with_release_counter(mut self, releases: Arc<AtomicUsize>) -> Self {
        self.releases = Some(releases);
        self
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.recording.store(false, Ordering::SeqCst);
        if let Some(releases) = &self.releases {
            releases.fetch_add(1, Ordering::SeqCst);
        }
        debug!("Microphone simulé libéré");
    }
}

#[async_trait]
impl AudioCapture for SimulatedCapture {
    async fn start(&mut self, mut sink: FrameSink) -> AudioResult<()> {
        if self.started || self.released {
            return Err(AudioError::InitializationError(
                "capture déjà démarrée ou arrêtée".to_string(),
            ));
        }
        self.started = true;
        self.recording.store(true, Ordering::SeqCst);

        let frames = std::mem::take(&mut self.frames);
        let interval = self.interval;
        self.task = Some(tokio::spawn(async move {
            for frame in frames {
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                sink(encode_frame(&frame));
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.release();
    }

    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    fn device_info(&self) -> String {
        "Microphone simulé".to_string()
    }
}

impl Drop for SimulatedCapture {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.release();
    }
}

/// Fournisseur de périphériques simulés
///
/// À partager en `Arc` entre le test et la session : le test garde la main
/// sur les horloges et lit les compteurs d'acquisition et de libération.
#[derive(Default)]
pub struct SimulatedDevices {
    capture_frames: Mutex<Vec<AudioFrame>>,
    frame_interval: Mutex<Duration>,
    acquisition_delay: Mutex<Duration>,
    fail_capture: AtomicBool,
    fail_output: AtomicBool,
    captures_opened: AtomicUsize,
    capture_releases: Arc<AtomicUsize>,
    outputs: Mutex<Vec<Arc<SimulatedOutput>>>,
}

impl SimulatedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames rejouées par le prochain microphone ouvert
    pub fn with_capture_frames(self, frames: Vec<AudioFrame>, interval: Duration) -> Self {
        *lock(&self.capture_frames) = frames;
        *lock(&self.frame_interval) = interval;
        self
    }

    /// Bloque l'acquisition (simule un dialogue de permission sans réponse)
    pub fn with_acquisition_delay(self, delay: Duration) -> Self {
        *lock(&self.acquisition_delay) = delay;
        self
    }

    /// Refuse l'accès au microphone
    pub fn failing_capture(self) -> Self {
        self.fail_capture.store(true, Ordering::SeqCst);
        self
    }

    /// Aucune sortie disponible
    pub fn failing_output(self) -> Self {
        self.fail_output.store(true, Ordering::SeqCst);
        self
    }

    pub fn captures_opened(&self) -> usize {
        self.captures_opened.load(Ordering::SeqCst)
    }

    pub fn capture_releases(&self) -> usize {
        self.capture_releases.load(Ordering::SeqCst)
    }

    pub fn outputs_opened(&self) -> usize {
        lock(&self.outputs).len()
    }

    /// Total des fermetures de sortie (tous périphériques confondus)
    pub fn output_closes(&self) -> usize {
        lock(&self.outputs).iter().map(|output| output.close_count()).sum()
    }

    /// Dernière sortie ouverte
    pub fn last_output(&self) -> Option<Arc<SimulatedOutput>> {
        lock(&self.outputs).last().cloned()
    }
}

impl DeviceProvider for SimulatedDevices {
    fn open_capture(&self, _config: &CaptureConfig) -> AudioResult<Box<dyn AudioCapture>> {
        let delay = *lock(&self.acquisition_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.fail_capture.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceUnavailable("permission micro refusée".to_string()));
        }

        self.captures_opened.fetch_add(1, Ordering::SeqCst);
        let frames = std::mem::take(&mut *lock(&self.capture_frames));
        let capture = SimulatedCapture::new(frames)
            .with_interval(*lock(&self.frame_interval))
            .with_release_counter(Arc::clone(&self.capture_releases));
        Ok(Box::new(capture))
    }

    fn open_output(
        &self,
        config: &AudioConfig,
        completions: CompletionSender,
    ) -> AudioResult<Arc<dyn OutputDevice>> {
        if self.fail_output.load(Ordering::SeqCst) {
            return Err(AudioError::NoDeviceFound("sortie"));
        }

        let output = Arc::new(SimulatedOutput::new(config.sample_rate, completions));
        lock(&self.outputs).push(Arc::clone(&output));
        Ok(output)
    }
}
