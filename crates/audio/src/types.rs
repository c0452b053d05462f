//! Types de données pour le système audio
//!
//! Ce module définit les structures qui circulent dans les deux pipelines :
//! - AudioFrame : bloc d'échantillons capturés, taille fixe
//! - CapturedFrame : frame encodée en PCM16 prête pour le transport, avec son volume
//! - PlaybackBuffer : audio décodé reçu du service, prêt à être programmé
//! - ScheduledUnit : un buffer programmé sur l'horloge du périphérique de sortie

/// Type pour un échantillon audio
///
/// - Valeurs entre -1.0 et +1.0
/// - 0.0 = silence
pub type Sample = f32;

/// Identifiant d'un buffer programmé sur le périphérique de sortie
pub type UnitId = u64;

/// Frame d'audio brute (non encodée)
///
/// La position dans le flux est donnée par l'ordre d'arrivée ; le numéro de
/// séquence ne sert qu'aux journaux.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    /// Les échantillons audio bruts (mono)
    pub samples: Vec<Sample>,

    /// Numéro de séquence, incrémenté pour chaque frame capturée
    pub sequence_number: u64,
}

impl AudioFrame {
    /// Crée une nouvelle frame audio
    ///
    /// # Example
    /// ```rust
    /// use audio::AudioFrame;
    ///
    /// let frame = AudioFrame::new(vec![0.1, 0.2, -0.1, 0.0], 42);
    /// assert_eq!(frame.len(), 4);
    /// ```
    pub fn new(samples: Vec<Sample>, sequence_number: u64) -> Self {
        Self {
            samples,
            sequence_number,
        }
    }

    /// Crée une frame de silence
    pub fn silence(sample_count: usize, sequence_number: u64) -> Self {
        Self::new(vec![0.0; sample_count], sequence_number)
    }

    /// Nombre d'échantillons
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Durée de la frame en secondes pour une fréquence donnée
    pub fn duration_secs(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 / sample_rate as f64
    }

    /// Calcule le niveau sonore RMS (Root Mean Square)
    ///
    /// C'est l'échantillon de volume envoyé à l'interface pour chaque frame.
    /// Retourne une valeur entre 0.0 et ~1.0
    pub fn rms_level(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let sum_squares: f32 = self.samples.iter()
            .map(|&s| s * s)
            .sum();

        (sum_squares / self.samples.len() as f32).sqrt()
    }
}

/// Frame capturée, encodée et mesurée
///
/// C'est ce que le pipeline de capture remet au transport.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedFrame {
    /// Échantillons en PCM16 signé little-endian
    pub pcm16: Vec<u8>,

    /// Volume RMS de la frame (pour la visualisation)
    pub volume: f32,

    /// Numéro de séquence de la frame d'origine
    pub sequence_number: u64,
}

/// Audio décodé reçu du service distant
///
/// Les échantillons sont rangés par canal (`channels[c][i]`).
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackBuffer {
    /// Échantillons par canal
    pub channels: Vec<Vec<Sample>>,

    /// Fréquence d'échantillonnage du buffer
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    /// Crée un buffer mono
    pub fn mono(samples: Vec<Sample>, sample_rate: u32) -> Self {
        Self {
            channels: vec![samples],
            sample_rate,
        }
    }

    /// Nombre d'échantillons par canal
    pub fn frame_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Durée en secondes
    ///
    /// Équivalent à `échantillons_totaux / sample_rate / canaux`.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    /// Mélange tous les canaux en un seul (moyenne)
    pub fn to_mono(&self) -> Vec<Sample> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            count => (0..self.frame_count())
                .map(|i| {
                    self.channels.iter()
                        .map(|channel| channel.get(i).copied().unwrap_or(0.0))
                        .sum::<f32>()
                        / count as f32
                })
                .collect(),
        }
    }
}

/// Un buffer programmé sur l'horloge du périphérique de sortie
///
/// Les temps sont exprimés en secondes sur l'horloge du périphérique.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScheduledUnit {
    pub id: UnitId,
    pub start_at: f64,
    pub duration: f64,
}

impl ScheduledUnit {
    /// Instant de fin de lecture
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}
