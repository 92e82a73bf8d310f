// THEORY:
// The `catalogue` is the dictionary of blink codes the fleet's markers transmit.
// Each entry is a fixed-length on/off pattern; a marker's identity is the index of
// its code in the catalogue.
//
// Key architectural principles:
// 1.  **Validated Once, Immutable After**: Codes must be non-empty and of equal
//     length. That is checked when the catalogue is built and never again.
// 2.  **Line Coding Is a Load-Time Concern**: Transmitters can send their logical
//     bits Manchester-encoded. The expansion (each logical bit becomes two symbols)
//     happens here, once, so the tracker and the decoder only ever see the symbol
//     stream actually emitted by the LED.
// 3.  **Safe Lookup**: Ids coming back from the outside world are resolved through
//     the catalogue; an id outside its range is reported as "no signal" rather than
//     being used as an index.

use crate::core_modules::signal_matcher::DecodedId;
use crate::error::CatalogueError;
use serde::{Deserialize, Serialize};

/// How logical code bits are turned into LED symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineCoding {
    /// One symbol per bit.
    #[default]
    Plain,
    /// IEEE 802.3 Manchester: `1 -> [0, 1]`, `0 -> [1, 0]`.
    Manchester,
}

impl LineCoding {
    pub fn expand(&self, bits: &[bool]) -> Vec<bool> {
        match self {
            LineCoding::Plain => bits.to_vec(),
            LineCoding::Manchester => bits
                .iter()
                .flat_map(|bit| if *bit { [false, true] } else { [true, false] })
                .collect(),
        }
    }
}

/// Serializable description of a catalogue, as found in configuration files.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogueSpec {
    /// Logical codes, one `0`/`1` entry per bit.
    pub codes: Vec<Vec<u8>>,
    #[serde(default)]
    pub coding: LineCoding,
}

/// The immutable set of known blink codes.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalogue {
    codes: Vec<Vec<bool>>,
    coding: LineCoding,
}

impl Catalogue {
    /// Builds a catalogue from already-expanded symbol sequences.
    pub fn new(codes: Vec<Vec<bool>>) -> Result<Self, CatalogueError> {
        Self::validate(&codes)?;
        Ok(Self {
            codes,
            coding: LineCoding::Plain,
        })
    }

    /// Builds a catalogue from logical bits, applying `coding` to every code.
    pub fn with_coding(
        logical: Vec<Vec<bool>>,
        coding: LineCoding,
    ) -> Result<Self, CatalogueError> {
        Self::validate(&logical)?;
        let codes = logical.iter().map(|code| coding.expand(code)).collect();
        Ok(Self { codes, coding })
    }

    pub fn from_spec(spec: &CatalogueSpec) -> Result<Self, CatalogueError> {
        let mut logical = Vec::with_capacity(spec.codes.len());
        for (index, code) in spec.codes.iter().enumerate() {
            let bits = code
                .iter()
                .map(|symbol| match symbol {
                    0 => Ok(false),
                    1 => Ok(true),
                    other => Err(CatalogueError::InvalidSymbol {
                        index,
                        symbol: *other,
                    }),
                })
                .collect::<Result<Vec<bool>, _>>()?;
            logical.push(bits);
        }
        let catalogue = Self::with_coding(logical, spec.coding)?;
        if spec.coding == LineCoding::Manchester {
            tracing::warn!("Manchester coding enabled; transmitters must use the same coding");
        }
        tracing::info!(
            "loaded {} codes of {} symbols",
            catalogue.len(),
            catalogue.code_length()
        );
        Ok(catalogue)
    }

    fn validate(codes: &[Vec<bool>]) -> Result<(), CatalogueError> {
        let first = codes.first().ok_or(CatalogueError::Empty)?;
        for (index, code) in codes.iter().enumerate() {
            if code.is_empty() {
                return Err(CatalogueError::EmptyCode { index });
            }
            if code.len() != first.len() {
                return Err(CatalogueError::LengthMismatch {
                    index,
                    expected: first.len(),
                    got: code.len(),
                });
            }
        }
        Ok(())
    }

    /// Number of codes.
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Never true for a constructed catalogue.
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Symbols per code, after line coding.
    pub fn code_length(&self) -> usize {
        self.codes.first().map_or(0, Vec::len)
    }

    pub fn coding(&self) -> LineCoding {
        self.coding
    }

    pub fn get(&self, index: usize) -> Option<&[bool]> {
        self.codes.get(index).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[bool]> {
        self.codes.iter().map(Vec::as_slice)
    }

    /// Maps a raw id from outside the core onto a [`DecodedId`]. Negative or
    /// out-of-range values are reported as [`DecodedId::NoSignal`].
    pub fn resolve_wire(&self, raw: i64) -> DecodedId {
        if raw == DecodedId::UNRESOLVED_WIRE as i64 {
            return DecodedId::Unresolved;
        }
        match usize::try_from(raw) {
            Ok(index) if index < self.len() => DecodedId::Marker(index),
            _ => DecodedId::NoSignal,
        }
    }
}
