pub const PITCH_CLASSES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Krumhansl-Kessler probe-tone profiles, tonic at index 0
const MAJOR_PROFILE: [f32; 12] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];
const MINOR_PROFILE: [f32; 12] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Major,
    Minor,
}

/// 24 rotated key profiles plus 24 triad templates.
#[derive(Debug, Clone)]
pub struct TonalTemplates {
    keys: Vec<(usize, Mode, [f32; 12])>,
    chords: Vec<(usize, Mode, [f32; 12])>,
}

impl TonalTemplates {
    pub fn new() -> Self {
        let mut keys = Vec::with_capacity(24);
        let mut chords = Vec::with_capacity(24);
        for tonic in 0..12 {
            keys.push((tonic, Mode::Major, rotate(&MAJOR_PROFILE, tonic)));
            keys.push((tonic, Mode::Minor, rotate(&MINOR_PROFILE, tonic)));
            chords.push((tonic, Mode::Major, triad(tonic, 4)));
            chords.push((tonic, Mode::Minor, triad(tonic, 3)));
        }
        Self { keys, chords }
    }

    /// Best matching key by Pearson correlation. Confidence is the
    /// correlation clamped to [0, 1].
    pub fn detect_key(&self, chroma: &[f32; 12]) -> Option<(String, f32)> {
        if chroma.iter().all(|&c| c <= f32::EPSILON) {
            return None;
        }
        let (tonic, mode, score) = self
            .keys
            .iter()
            .map(|(tonic, mode, profile)| (*tonic, *mode, pearson(chroma, profile)))
            .max_by(|a, b| a.2.total_cmp(&b.2))?;
        let label = match mode {
            Mode::Major => format!("{} major", PITCH_CLASSES[tonic]),
            Mode::Minor => format!("{} minor", PITCH_CLASSES[tonic]),
        };
        Some((label, score.clamp(0.0, 1.0)))
    }

    /// Best matching major/minor triad by cosine similarity.
    pub fn detect_chord(&self, chroma: &[f32; 12]) -> Option<(String, f32)> {
        let norm = chroma.iter().map(|c| c * c).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return None;
        }
        let (root, mode, score) = self
            .chords
            .iter()
            .map(|(root, mode, template)| {
                let dot: f32 = chroma.iter().zip(template).map(|(a, b)| a * b).sum();
                (*root, *mode, dot / (norm * 3f32.sqrt()))
            })
            .max_by(|a, b| a.2.total_cmp(&b.2))?;
        let label = match mode {
            Mode::Major => PITCH_CLASSES[root].to_string(),
            Mode::Minor => format!("{}m", PITCH_CLASSES[root]),
        };
        Some((label, score.clamp(0.0, 1.0)))
    }
}

impl Default for TonalTemplates {
    fn default() -> Self {
        Self::new()
    }
}

fn rotate(profile: &[f32; 12], tonic: usize) -> [f32; 12] {
    let mut out = [0.0; 12];
    for (i, &v) in profile.iter().enumerate() {
        out[(i + tonic) % 12] = v;
    }
    out
}

fn triad(root: usize, third: usize) -> [f32; 12] {
    let mut out = [0.0; 12];
    out[root % 12] = 1.0;
    out[(root + third) % 12] = 1.0;
    out[(root + 7) % 12] = 1.0;
    out
}

fn pearson(a: &[f32; 12], b: &[f32; 12]) -> f32 {
    let mean_a = a.iter().sum::<f32>() / 12.0;
    let mean_b = b.iter().sum::<f32>() / 12.0;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    let denom = (var_a * var_b).sqrt();
    if denom <= f32::EPSILON {
        0.0
    } else {
        cov / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pitch_classes(notes: &[usize]) -> [f32; 12] {
        let mut chroma = [0.05; 12];
        for &n in notes {
            chroma[n] = 1.0;
        }
        chroma
    }

    #[test]
    fn c_major_scale_detects_c_major() {
        let templates = TonalTemplates::new();
        // C E G weighted over the rest of the C major scale
        let mut chroma = pitch_classes(&[0, 2, 4, 5, 7, 9, 11]);
        chroma[0] = 1.5;
        chroma[4] = 1.2;
        chroma[7] = 1.3;
        let (key, confidence) = templates.detect_key(&chroma).unwrap();
        assert_eq!(key, "C major");
        assert!(confidence > 0.5);
    }

    #[test]
    fn triads_are_recognized() {
        let templates = TonalTemplates::new();
        let (chord, confidence) = templates.detect_chord(&pitch_classes(&[9, 0, 4])).unwrap();
        assert_eq!(chord, "Am");
        assert!(confidence > 0.9);

        let (chord, _) = templates.detect_chord(&pitch_classes(&[7, 11, 2])).unwrap();
        assert_eq!(chord, "G");
    }

    #[test]
    fn silence_has_no_key() {
        let templates = TonalTemplates::new();
        assert!(templates.detect_key(&[0.0; 12]).is_none());
        assert!(templates.detect_chord(&[0.0; 12]).is_none());
    }
}
