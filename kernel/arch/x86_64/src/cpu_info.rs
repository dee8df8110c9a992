//! Various CPU information functions

use log::debug;
use raw_cpuid::{CpuId, ExtendedFeatures, ExtendedProcessorFeatureIdentifiers};

/// Protection features the nested kernel relies on
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct CpuFeatures {
    /// Supervisor mode execution prevention
    pub smep: bool,
    /// Supervisor mode access prevention
    pub smap: bool,
    /// Execute-disable bit in page table entries
    pub nx: bool,
}

impl CpuFeatures {
    /// Queries the executing CPU
    #[must_use]
    pub fn detect() -> Self {
        let cpuid = CpuId::new();
        let extended = cpuid.get_extended_feature_info();
        let features = Self {
            smep: extended.as_ref().is_some_and(ExtendedFeatures::has_smep),
            smap: extended.as_ref().is_some_and(ExtendedFeatures::has_smap),
            nx: cpuid
                .get_extended_processor_and_feature_identifiers()
                .as_ref()
                .is_some_and(ExtendedProcessorFeatureIdentifiers::has_execute_disable),
        };
        debug!("CPU protection features: {features:?}");
        features
    }
}
