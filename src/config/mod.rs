//! Configuration: serde-backed TOML with validated defaults.

mod settings;

pub use settings::{
    AutoPushPolicy, BudgetConfig, ContinuousConfig, DegradationConfig, ForemanConfig,
    GreenBranchConfig, ParallelConfig, PricingConfig, ReviewConfig, RoundsConfig, SchedulerConfig,
    TargetConfig, VerificationConfig,
};
