// THEORY:
// The `signal_matcher` turns a tracked sequence's on/off history into a marker
// identity. It is the last stage of the engine and the only one the result consumer
// talks to.
//
// Key architectural principles & algorithm steps:
// 1.  **Trailing Window**: Only the last `code_length` observations matter; a longer
//     history is trimmed, a shorter one is used as is.
// 2.  **Fast Rejection**: A valid code toggles periodically and never stays dark for
//     three consecutive symbols. Three consecutive "off" bits mean the light is gone
//     (or never was a marker) and short-circuit to `NoSignal`.
// 3.  **Cyclic Cross-Correlation**: The observation can start anywhere in the code's
//     period. Bits are mapped to +1/-1 and correlated against every cyclic shift of
//     every catalogue entry; the normalised score is 1.0 for a perfect match.
// 4.  **Confidence & Ambiguity**: The best entry is only reported if its score clears
//     a minimum correlation and strictly beats every other entry. Otherwise the
//     sequence is `Unresolved`: not yet identifiable, but not known to be dead either.
// 5.  **Determinism**: The same window against the same catalogue always yields the
//     same answer; ties go to the lower catalogue index before the margin check
//     turns them into `Unresolved`.

use crate::core_modules::catalogue::Catalogue;
use serde::{Deserialize, Serialize};

/// Number of consecutive "off" symbols that proves there is no valid code.
pub const SILENT_RUN_FOR_NO_SIGNAL: usize = 3;

/// Result of decoding one sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodedId {
    /// Index of the matched catalogue entry.
    Marker(usize),
    /// The on/off history cannot belong to any valid code.
    NoSignal,
    /// Not enough evidence yet, or the evidence is ambiguous.
    Unresolved,
}

impl DecodedId {
    pub const NO_SIGNAL_WIRE: i32 = -2;
    pub const UNRESOLVED_WIRE: i32 = -1;

    /// Integer form used by downstream consumers: the catalogue index, or a negative
    /// sentinel.
    pub fn wire_value(&self) -> i32 {
        match self {
            DecodedId::Marker(index) => i32::try_from(*index).unwrap_or(Self::NO_SIGNAL_WIRE),
            DecodedId::NoSignal => Self::NO_SIGNAL_WIRE,
            DecodedId::Unresolved => Self::UNRESOLVED_WIRE,
        }
    }

    pub fn marker(&self) -> Option<usize> {
        match self {
            DecodedId::Marker(index) => Some(*index),
            _ => None,
        }
    }

    pub fn is_identified(&self) -> bool {
        matches!(self, DecodedId::Marker(_))
    }

    /// Only a confirmed absence of signal licenses hiding the point.
    pub fn suppress_visual(&self) -> bool {
        matches!(self, DecodedId::NoSignal)
    }
}

/// Acceptance thresholds of the correlation decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Minimum normalised correlation in [-1, 1] for a match.
    pub min_correlation: f64,
    /// The winner's score must exceed every other entry's by more than this.
    pub min_margin: f64,
    /// Windows shorter than this are never decoded.
    pub min_bits: usize,
}

impl DecoderConfig {
    pub const DEFAULT_MIN_CORRELATION: f64 = 0.75;
    pub const DEFAULT_MIN_MARGIN: f64 = 0.0;
    pub const DEFAULT_MIN_BITS: usize = 4;
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            min_correlation: Self::DEFAULT_MIN_CORRELATION,
            min_margin: Self::DEFAULT_MIN_MARGIN,
            min_bits: Self::DEFAULT_MIN_BITS,
        }
    }
}

/// Detailed outcome of a correlation decode.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchReport {
    pub id: DecodedId,
    /// Best-scoring catalogue entry, even when it was rejected.
    pub best_index: Option<usize>,
    /// Cyclic shift of the best entry that produced the score.
    pub best_shift: usize,
    /// Normalised correlation of the best entry.
    pub score: f64,
    /// `score - runner_up_score`.
    pub margin: f64,
}

impl MatchReport {
    fn short_circuit(id: DecodedId) -> Self {
        Self {
            id,
            best_index: None,
            best_shift: 0,
            score: 0.0,
            margin: 0.0,
        }
    }
}

/// True if `bits` contains `run` consecutive `false` values.
pub fn has_silent_run(bits: &[bool], run: usize) -> bool {
    run > 0 && bits.windows(run).any(|w| w.iter().all(|b| !b))
}

fn polar(bit: bool) -> i32 {
    if bit { 1 } else { -1 }
}

/// Decoder of on/off histories against a fixed catalogue.
#[derive(Debug, Clone)]
pub struct SignalMatcher {
    catalogue: Catalogue,
    config: DecoderConfig,
}

impl SignalMatcher {
    pub fn new(catalogue: Catalogue, config: DecoderConfig) -> Self {
        Self { catalogue, config }
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    /// Length of the trailing window the decoder looks at.
    pub fn window(&self) -> usize {
        self.catalogue.code_length()
    }

    pub fn decode(&self, bits: &[bool]) -> DecodedId {
        self.decode_detailed(bits).id
    }

    pub fn decode_detailed(&self, bits: &[bool]) -> MatchReport {
        let skip = bits.len().saturating_sub(self.window());
        let window = &bits[skip..];

        if has_silent_run(window, SILENT_RUN_FOR_NO_SIGNAL) {
            return MatchReport::short_circuit(DecodedId::NoSignal);
        }
        if window.is_empty() || window.len() < self.config.min_bits {
            return MatchReport::short_circuit(DecodedId::Unresolved);
        }

        // --- Correlation against every entry ---
        let mut best: Option<(usize, usize, f64)> = None;
        let mut runner_up = -1.0f64;
        for (index, code) in self.catalogue.iter().enumerate() {
            let (shift, score) = Self::correlate(window, code);
            match best {
                Some((_, _, best_score)) if score <= best_score => {
                    runner_up = runner_up.max(score);
                }
                Some((_, _, best_score)) => {
                    runner_up = runner_up.max(best_score);
                    best = Some((index, shift, score));
                }
                None => best = Some((index, shift, score)),
            }
        }

        let Some((index, shift, score)) = best else {
            return MatchReport::short_circuit(DecodedId::Unresolved);
        };
        let margin = score - runner_up;
        let accepted = score >= self.config.min_correlation && margin > self.config.min_margin;

        MatchReport {
            id: if accepted {
                DecodedId::Marker(index)
            } else {
                DecodedId::Unresolved
            },
            best_index: Some(index),
            best_shift: shift,
            score,
            margin,
        }
    }

    /// Best normalised cyclic correlation of `observed` against `code`, with the
    /// shift that produced it (lowest shift on ties).
    fn correlate(observed: &[bool], code: &[bool]) -> (usize, f64) {
        let len = code.len();
        if len == 0 || observed.is_empty() {
            return (0, -1.0);
        }
        let mut best = (0usize, i32::MIN);
        for shift in 0..len {
            let sum: i32 = observed
                .iter()
                .enumerate()
                .map(|(i, bit)| polar(*bit) * polar(code[(i + shift) % len]))
                .sum();
            if sum > best.1 {
                best = (shift, sum);
            }
        }
        (best.0, best.1 as f64 / observed.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(s: &str) -> Vec<bool> {
        s.chars().map(|c| c == '1').collect()
    }

    fn matcher() -> SignalMatcher {
        let codes = vec![bits("110100"), bits("111010"), bits("101010")];
        let catalogue = Catalogue::new(codes).expect("catalogue");
        SignalMatcher::new(catalogue, DecoderConfig::default())
    }

    #[test]
    fn three_offs_short_circuit_to_no_signal() {
        assert_eq!(matcher().decode(&bits("1010001")), DecodedId::NoSignal);
        // Trimmed to the trailing six symbols, the silent run is still there.
        assert_eq!(matcher().decode(&bits("11101000")), DecodedId::NoSignal);
    }

    #[test]
    fn no_signal_regardless_of_catalogue() {
        let catalogue = Catalogue::new(vec![bits("1000000")]).expect("catalogue");
        let m = SignalMatcher::new(catalogue, DecoderConfig::default());
        assert_eq!(m.decode(&bits("1000000")), DecodedId::NoSignal);
    }

    #[test]
    fn exact_codes_decode_at_any_phase() {
        let m = matcher();
        for (index, code) in ["110100", "111010", "101010"].iter().enumerate() {
            let period = bits(code);
            for phase in 0..period.len() {
                let observed: Vec<bool> = (0..period.len() * 2)
                    .map(|i| period[(i + phase) % period.len()])
                    .collect();
                assert_eq!(
                    m.decode(&observed),
                    DecodedId::Marker(index),
                    "code {code} phase {phase}"
                );
            }
        }
    }

    #[test]
    fn decoding_is_deterministic() {
        let m = matcher();
        let observed = bits("011010");
        let first = m.decode_detailed(&observed);
        for _ in 0..10 {
            assert_eq!(m.decode_detailed(&observed), first);
        }
    }

    #[test]
    fn short_windows_are_unresolved() {
        assert_eq!(matcher().decode(&bits("101")), DecodedId::Unresolved);
        assert_eq!(matcher().decode(&[]), DecodedId::Unresolved);
    }

    #[test]
    fn ties_are_unresolved() {
        let catalogue = Catalogue::new(vec![bits("1100"), bits("0011")]).expect("catalogue");
        let m = SignalMatcher::new(catalogue, DecoderConfig::default());
        // 0011 is a cyclic shift of 1100: both entries match perfectly.
        let report = m.decode_detailed(&bits("1100"));
        assert_eq!(report.id, DecodedId::Unresolved);
        assert_eq!(report.best_index, Some(0));
        assert_eq!(report.margin, 0.0);
    }

    #[test]
    fn low_correlation_is_unresolved() {
        let catalogue = Catalogue::new(vec![bits("11110110")]).expect("catalogue");
        let m = SignalMatcher::new(catalogue, DecoderConfig::default());
        // Best alignment still disagrees on three of eight symbols: 0.25 < 0.75.
        let report = m.decode_detailed(&bits("10101011"));
        assert!(report.score < DecoderConfig::DEFAULT_MIN_CORRELATION);
        assert_eq!(report.id, DecodedId::Unresolved);
    }

    #[test]
    fn wire_values() {
        assert_eq!(DecodedId::Marker(3).wire_value(), 3);
        assert_eq!(DecodedId::NoSignal.wire_value(), -2);
        assert_eq!(DecodedId::Unresolved.wire_value(), -1);
        assert!(DecodedId::NoSignal.suppress_visual());
        assert!(!DecodedId::Unresolved.suppress_visual());
        assert!(!DecodedId::Unresolved.is_identified());
    }
}
