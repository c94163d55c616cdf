//! Combined configuration for the delivery core.

use courier_bounce::BounceConfig;
use courier_mda::MdaLimits;
use courier_scheduler::{BackoffPolicy, SchedulerConfig};
use serde::Deserialize;

/// One section per event loop, each with its own defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    #[serde(default)]
    pub mda: MdaLimits,

    #[serde(default)]
    pub bounce: BounceConfig,
}
