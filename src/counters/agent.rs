use serde::Deserialize;

use super::metric::CatalogError;

/// Static description of an accelerator agent.
///
/// Constant metrics (for example `simd_count`) read their value from here
/// instead of from a hardware sample.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentDescriptor {
    /// Operator-facing agent name.
    pub name: String,
    /// Architecture name used to select metric definitions (e.g. "gfx90a").
    pub architecture: String,
    /// Identifier stamped into every record evaluated for this agent.
    #[serde(default)]
    pub agent_id: u64,

    #[serde(default)]
    pub node_id: u32,
    #[serde(default)]
    pub cpu_cores_count: u32,
    #[serde(default)]
    pub simd_count: u32,
    #[serde(default)]
    pub array_count: u32,
    #[serde(default)]
    pub simd_arrays_per_engine: u32,
    #[serde(default)]
    pub cu_count: u32,
    #[serde(default)]
    pub cu_per_simd_array: u32,
    #[serde(default)]
    pub simd_per_cu: u32,
    #[serde(default)]
    pub max_waves_per_simd: u32,
    #[serde(default)]
    pub wave_front_size: u32,
    #[serde(default)]
    pub num_shader_banks: u32,
    #[serde(default)]
    pub num_xcc: u32,
    #[serde(default)]
    pub max_engine_clk_fcompute: u32,
    #[serde(default)]
    pub max_engine_clk_ccompute: u32,
    #[serde(default)]
    pub lds_size_in_kb: u32,
    #[serde(default)]
    pub gfx_target_version: u32,
    #[serde(default)]
    pub local_mem_size: u64,
    #[serde(default)]
    pub max_scratch_slots_per_cu: u32,
}

type PropertyAccessor = fn(&AgentDescriptor) -> f64;

/// Name -> accessor table for every agent property usable as a constant.
const AGENT_PROPERTIES: &[(&str, PropertyAccessor)] = &[
    ("node_id", |a| f64::from(a.node_id)),
    ("cpu_cores_count", |a| f64::from(a.cpu_cores_count)),
    ("simd_count", |a| f64::from(a.simd_count)),
    ("array_count", |a| f64::from(a.array_count)),
    ("simd_arrays_per_engine", |a| f64::from(a.simd_arrays_per_engine)),
    ("cu_count", |a| f64::from(a.cu_count)),
    ("cu_per_simd_array", |a| f64::from(a.cu_per_simd_array)),
    ("simd_per_cu", |a| f64::from(a.simd_per_cu)),
    ("max_waves_per_simd", |a| f64::from(a.max_waves_per_simd)),
    ("wave_front_size", |a| f64::from(a.wave_front_size)),
    ("num_shader_banks", |a| f64::from(a.num_shader_banks)),
    ("num_xcc", |a| f64::from(a.num_xcc)),
    ("max_engine_clk_fcompute", |a| f64::from(a.max_engine_clk_fcompute)),
    ("max_engine_clk_ccompute", |a| f64::from(a.max_engine_clk_ccompute)),
    ("lds_size_in_kb", |a| f64::from(a.lds_size_in_kb)),
    ("gfx_target_version", |a| f64::from(a.gfx_target_version)),
    ("local_mem_size", |a| a.local_mem_size as f64),
    ("max_scratch_slots_per_cu", |a| f64::from(a.max_scratch_slots_per_cu)),
];

/// Reads the agent property named `name`.
pub fn resolve_agent_property(name: &str, agent: &AgentDescriptor) -> Result<f64, CatalogError> {
    AGENT_PROPERTIES
        .iter()
        .find(|(prop, _)| *prop == name)
        .map(|(_, accessor)| accessor(agent))
        .ok_or_else(|| CatalogError::PropertyNotFound {
            name: name.to_string(),
        })
}

/// Returns the names of every resolvable agent property.
pub fn agent_property_names() -> impl Iterator<Item = &'static str> {
    AGENT_PROPERTIES.iter().map(|(name, _)| *name)
}
