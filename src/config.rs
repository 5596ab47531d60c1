//! Engine configuration: statistics sub-config, proposal flags, and the
//! allocator-stability switch consumed by the compiled-code bridge.

/// Statistics collection switches and the gas limit.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub instruction_counting: bool,
    pub cost_measuring: bool,
    pub time_measuring: bool,
    /// Gas budget for an invocation when cost measuring is on. `u64::MAX`
    /// means unlimited.
    pub cost_limit: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            instruction_counting: false,
            cost_measuring: false,
            time_measuring: false,
            cost_limit: u64::MAX,
        }
    }
}

impl StatsConfig {
    pub fn any_enabled(&self) -> bool {
        self.instruction_counting || self.cost_measuring || self.time_measuring
    }
}

/// Which Wasm extensions the embedder has enabled. The engine trusts the
/// validator, so these are consulted only at facade boundaries (e.g. component
/// instantiation) and by the bridge when publishing the execution context.
#[derive(Debug, Clone)]
pub struct Proposals {
    pub threads: bool,
    pub gc: bool,
    pub exceptions: bool,
    pub component_model: bool,
    pub relaxed_simd: bool,
    pub tail_call: bool,
}

impl Default for Proposals {
    fn default() -> Self {
        Self {
            threads: true,
            gc: true,
            exceptions: true,
            component_model: true,
            relaxed_simd: true,
            tail_call: true,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub stats: StatsConfig,
    pub proposals: Proposals,
    /// When true, linear-memory base pointers handed to compiled code stay
    /// valid across `memory.grow`, so the execution context may cache bases
    /// directly. When false the context goes through a per-memory slot that
    /// grow rewrites.
    pub stable_allocator: bool,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instruction_counting(mut self, on: bool) -> Self {
        self.stats.instruction_counting = on;
        self
    }

    pub fn with_cost_measuring(mut self, on: bool) -> Self {
        self.stats.cost_measuring = on;
        self
    }

    pub fn with_time_measuring(mut self, on: bool) -> Self {
        self.stats.time_measuring = on;
        self
    }

    pub fn with_cost_limit(mut self, limit: u64) -> Self {
        self.stats.cost_limit = limit;
        self
    }

    pub fn with_stable_allocator(mut self, on: bool) -> Self {
        self.stable_allocator = on;
        self
    }
}
