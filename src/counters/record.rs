use super::dimension::{CounterInstanceId, Dimension, DimensionError, MetricDimension};

/// One evaluated counter instance.
///
/// Plain value type: copies are cheap and share nothing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleRecord {
    pub id: CounterInstanceId,
    pub value: f64,
    pub dispatch_id: u64,
    pub user_data: u64,
    pub agent_id: u64,
}

impl SampleRecord {
    /// Creates a record with no dispatch, user or agent attribution.
    pub const fn new(id: CounterInstanceId, value: f64) -> Self {
        Self {
            id,
            value,
            dispatch_id: 0,
            user_data: 0,
            agent_id: 0,
        }
    }

    /// Returns a copy carrying `value`, keeping id and attribution.
    pub fn with_value(self, value: f64) -> Self {
        Self { value, ..self }
    }

    /// Returns a copy carrying `id`, keeping value and attribution.
    pub fn with_id(self, id: CounterInstanceId) -> Self {
        Self { id, ..self }
    }

    /// Lays `values` out over `dims`, the last dimension varying fastest.
    ///
    /// Values beyond the layout's instance count spill into the first
    /// dimension and fail once they exceed its slot width.
    pub fn from_values(
        counter_id: u64,
        dims: &[MetricDimension],
        values: &[f64],
    ) -> Result<Vec<Self>, DimensionError> {
        let mut positions: Vec<(Dimension, u64)> = Vec::with_capacity(dims.len());
        values
            .iter()
            .enumerate()
            .map(|(index, value)| {
                positions.clear();
                let mut rest = index as u64;
                for (k, dim) in dims.iter().enumerate().rev() {
                    let position = if k == 0 { rest } else { rest % dim.size.max(1) };
                    rest /= dim.size.max(1);
                    positions.push((dim.dimension, position));
                }
                let id = CounterInstanceId::pack(counter_id, &positions)?;
                Ok(Self::new(id, *value))
            })
            .collect()
    }
}
