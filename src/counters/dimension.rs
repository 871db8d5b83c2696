use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Number of low bits available for dimension positions.
pub const MAX_DIMENSION_BITS: u32 = 48;

/// Largest counter id that fits in the top 16 bits of an instance id.
pub const MAX_COUNTER_ID: u64 = 0xFFFF;

/// Number of dimension kinds, including [`Dimension::None`].
pub const NUM_DIMENSIONS: u32 = 8;

/// Bits allotted to each dimension slot.
pub const DIMENSION_BIT_LENGTH: u32 = MAX_DIMENSION_BITS / NUM_DIMENSIONS;

/// Largest extent a dimension slot can address.
pub const MAX_DIMENSION_SIZE: u64 = 1 << DIMENSION_BIT_LENGTH;

const DIMENSION_MASK: u64 = (1 << MAX_DIMENSION_BITS) - 1;

/// Errors raised when a value does not fit its bit field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DimensionError {
    #[error("counter id {counter_id} exceeds {MAX_COUNTER_ID:#x}")]
    CounterIdOverflow { counter_id: u64 },

    #[error("position {position} does not fit {dimension} (max {max})")]
    PositionOverflow {
        dimension: Dimension,
        position: u64,
        max: u64,
    },
}

/// Hardware axis along which a counter produces multiple instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[repr(u8)]
pub enum Dimension {
    #[serde(rename = "DIMENSION_NONE")]
    None = 0,
    #[serde(rename = "DIMENSION_XCC")]
    Xcc = 1,
    #[serde(rename = "DIMENSION_AID")]
    Aid = 2,
    #[serde(rename = "DIMENSION_SHADER_ENGINE")]
    ShaderEngine = 3,
    #[serde(rename = "DIMENSION_AGENT")]
    Agent = 4,
    #[serde(rename = "DIMENSION_SHADER_ARRAY")]
    ShaderArray = 5,
    #[serde(rename = "DIMENSION_WGP")]
    Wgp = 6,
    #[serde(rename = "DIMENSION_INSTANCE")]
    Instance = 7,
}

impl Dimension {
    /// Every dimension that owns a slot, in slot order.
    pub const SLOTTED: [Dimension; 7] = [
        Self::Xcc,
        Self::Aid,
        Self::ShaderEngine,
        Self::Agent,
        Self::ShaderArray,
        Self::Wgp,
        Self::Instance,
    ];

    /// Returns the canonical name used in expressions and definition files.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "DIMENSION_NONE",
            Self::Xcc => "DIMENSION_XCC",
            Self::Aid => "DIMENSION_AID",
            Self::ShaderEngine => "DIMENSION_SHADER_ENGINE",
            Self::Agent => "DIMENSION_AGENT",
            Self::ShaderArray => "DIMENSION_SHADER_ARRAY",
            Self::Wgp => "DIMENSION_WGP",
            Self::Instance => "DIMENSION_INSTANCE",
        }
    }

    /// Looks up a dimension by its canonical name.
    pub fn from_name(name: &str) -> Option<Self> {
        std::iter::once(Self::None)
            .chain(Self::SLOTTED)
            .find(|dim| dim.as_str() == name)
    }

    /// Bit range `[start, end)` of this dimension's slot.
    fn slot(self) -> (u32, u32) {
        let index = self as u32;
        ((index - 1) * DIMENSION_BIT_LENGTH, index * DIMENSION_BIT_LENGTH)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extent of a single dimension for a counter on a particular agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricDimension {
    pub dimension: Dimension,
    pub size: u64,
}

impl MetricDimension {
    pub const fn new(dimension: Dimension, size: u64) -> Self {
        Self { dimension, size }
    }

    /// The synthetic single-instance dimension reported by scalars.
    pub const fn scalar() -> Self {
        Self::new(Dimension::Instance, 1)
    }

    /// Whether every position of this dimension fits its slot.
    pub const fn is_encodable(&self) -> bool {
        !matches!(self.dimension, Dimension::None)
            && self.size >= 1
            && self.size <= MAX_DIMENSION_SIZE
    }
}

/// A counter id and its dimension positions packed into one 64-bit key.
///
/// Layout: bits `[48, 64)` hold the counter id, bits `[0, 48)` hold one
/// fixed-width slot per dimension. Reductions collapse a dimension by
/// clearing its slot, so the packed value doubles as a grouping key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterInstanceId(u64);

impl CounterInstanceId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Replaces the counter id bits.
    pub fn encode_counter(self, counter_id: u64) -> Result<Self, DimensionError> {
        if counter_id > MAX_COUNTER_ID {
            return Err(DimensionError::CounterIdOverflow { counter_id });
        }
        Ok(Self((self.0 & DIMENSION_MASK) | (counter_id << MAX_DIMENSION_BITS)))
    }

    /// Replaces the position stored for `dim`.
    ///
    /// [`Dimension::None`] writes the whole 48-bit dimension field.
    pub fn encode_dimension(self, dim: Dimension, position: u64) -> Result<Self, DimensionError> {
        if dim == Dimension::None {
            if position > DIMENSION_MASK {
                return Err(DimensionError::PositionOverflow {
                    dimension: dim,
                    position,
                    max: DIMENSION_MASK,
                });
            }
            return Ok(Self((self.0 & !DIMENSION_MASK) | position));
        }

        let (start, end) = dim.slot();
        let max = (1u64 << (end - start)) - 1;
        if position > max {
            return Err(DimensionError::PositionOverflow {
                dimension: dim,
                position,
                max,
            });
        }
        let slot_mask = max << start;
        Ok(Self((self.0 & !slot_mask) | (position << start)))
    }

    /// Returns the counter id stored in the top 16 bits.
    pub const fn decode_counter(self) -> u64 {
        self.0 >> MAX_DIMENSION_BITS
    }

    /// Returns the position stored for `dim`.
    pub fn decode_dimension(self, dim: Dimension) -> u64 {
        if dim == Dimension::None {
            return self.0 & DIMENSION_MASK;
        }
        let (start, end) = dim.slot();
        (self.0 >> start) & ((1u64 << (end - start)) - 1)
    }

    /// Zeroes the slot of `dim`. Infallible since zero fits every slot.
    pub fn clear_dimension(self, dim: Dimension) -> Self {
        if dim == Dimension::None {
            return Self(self.0 & !DIMENSION_MASK);
        }
        let (start, end) = dim.slot();
        let slot_mask = ((1u64 << (end - start)) - 1) << start;
        Self(self.0 & !slot_mask)
    }

    /// Builds an id from a counter id and a list of `(dimension, position)` pairs.
    pub fn pack(counter_id: u64, positions: &[(Dimension, u64)]) -> Result<Self, DimensionError> {
        positions
            .iter()
            .try_fold(Self::default().encode_counter(counter_id)?, |id, &(dim, pos)| {
                id.encode_dimension(dim, pos)
            })
    }
}

impl fmt::Display for CounterInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_length_divides_budget() {
        assert_eq!(DIMENSION_BIT_LENGTH, 6);
    }

    #[test]
    fn test_encode_counter_round_trip() {
        for counter_id in [0, 1, 42, 0x1234, MAX_COUNTER_ID] {
            let id = CounterInstanceId::default()
                .encode_counter(counter_id)
                .expect("counter id fits");
            assert_eq!(id.decode_counter(), counter_id);
        }
    }

    #[test]
    fn test_encode_counter_rejects_overflow() {
        let err = CounterInstanceId::default()
            .encode_counter(MAX_COUNTER_ID + 1)
            .unwrap_err();
        assert_eq!(
            err,
            DimensionError::CounterIdOverflow {
                counter_id: 0x10000
            }
        );
    }

    #[test]
    fn test_encode_counter_preserves_dimensions() {
        let id = CounterInstanceId::default()
            .encode_dimension(Dimension::ShaderEngine, 5)
            .expect("fits")
            .encode_counter(9)
            .expect("fits")
            .encode_counter(11)
            .expect("fits");
        assert_eq!(id.decode_counter(), 11);
        assert_eq!(id.decode_dimension(Dimension::ShaderEngine), 5);
    }

    #[test]
    fn test_dimension_round_trip_every_slot() {
        let max = (1u64 << DIMENSION_BIT_LENGTH) - 1;
        for dim in Dimension::SLOTTED {
            for position in [0, 1, 7, max] {
                let id = CounterInstanceId::default()
                    .encode_counter(0xBEEF)
                    .and_then(|id| id.encode_dimension(dim, position))
                    .expect("position fits");
                assert_eq!(id.decode_dimension(dim), position, "{dim}");
                assert_eq!(id.decode_counter(), 0xBEEF);
            }
        }
    }

    #[test]
    fn test_dimension_slots_are_independent() {
        let mut id = CounterInstanceId::default();
        for (i, dim) in Dimension::SLOTTED.iter().enumerate() {
            id = id.encode_dimension(*dim, i as u64 + 1).expect("fits");
        }
        for (i, dim) in Dimension::SLOTTED.iter().enumerate() {
            assert_eq!(id.decode_dimension(*dim), i as u64 + 1);
        }
    }

    #[test]
    fn test_encode_dimension_rejects_overflow() {
        let err = CounterInstanceId::default()
            .encode_dimension(Dimension::Xcc, 64)
            .unwrap_err();
        assert!(matches!(
            err,
            DimensionError::PositionOverflow {
                dimension: Dimension::Xcc,
                position: 64,
                max: 63
            }
        ));
    }

    #[test]
    fn test_none_dimension_spans_whole_field() {
        let id = CounterInstanceId::default()
            .encode_counter(3)
            .and_then(|id| id.encode_dimension(Dimension::None, 0xABCD_EF01_2345))
            .expect("fits in 48 bits");
        assert_eq!(id.decode_dimension(Dimension::None), 0xABCD_EF01_2345);
        assert_eq!(id.decode_counter(), 3);

        assert!(CounterInstanceId::default()
            .encode_dimension(Dimension::None, 1 << 48)
            .is_err());
    }

    #[test]
    fn test_clear_dimension() {
        let id = CounterInstanceId::pack(
            7,
            &[(Dimension::Xcc, 2), (Dimension::ShaderEngine, 3)],
        )
        .expect("fits");
        let cleared = id.clear_dimension(Dimension::ShaderEngine);
        assert_eq!(cleared.decode_dimension(Dimension::ShaderEngine), 0);
        assert_eq!(cleared.decode_dimension(Dimension::Xcc), 2);
        assert_eq!(cleared.decode_counter(), 7);
    }

    #[test]
    fn test_dimension_from_name() {
        assert_eq!(
            Dimension::from_name("DIMENSION_SHADER_ENGINE"),
            Some(Dimension::ShaderEngine)
        );
        assert_eq!(Dimension::from_name("DIMENSION_NONE"), Some(Dimension::None));
        assert_eq!(Dimension::from_name("SHADER_ENGINE"), None);
    }
}
