use std::collections::BTreeMap;

use hperf_data::{
    ArchDesc, EventDesc, EventScope, Metric, ARM_GENERIC, INTEL_CASCADELAKE, INTEL_ICELAKE,
    ISA_AARCH64, ISA_X86_64,
};
use hperf_sut::Executor;
use lazy_static::lazy_static;
use tracing::{debug, warn, Span};

use crate::{ArchitectureProfile, Error};

include!(concat!(env!("OUT_DIR"), "/architectures.rs"));

pub const ISA_COMMAND: &str = "lscpu | grep 'Architecture:' | awk -F: '{print $2}'";
pub const MODEL_NAME_COMMAND: &str = "lscpu | grep 'Model name:' | awk -F: '{print $2}'";
pub const MODEL_COMMAND: &str = "lscpu | grep 'Model:' | awk -F: '{print $2}'";

// Intel model numbers as reported by `lscpu`
const INTEL_MODEL_ICELAKE_SP: u32 = 106;
const INTEL_MODEL_SKYLAKE_SP: u32 = 85;

pub fn find_architecture(id: &str) -> Option<&'static ArchDesc> {
    ARCHITECTURES.get(id)
}

pub fn known_architectures() -> impl Iterator<Item = &'static ArchDesc> {
    ARCHITECTURES.values()
}

/// Maps what `lscpu` reports to one of the compiled-in profiles.
///
/// `model` is the numeric `Model:` field and only matters for Intel parts.
/// Unknown Intel models fall back to Cascade Lake, the most conservative
/// profile; every aarch64 part uses the generic Arm profile.
pub fn classify(isa: &str, model_name: &str, model: Option<&str>) -> Result<&'static str, Error> {
    match isa {
        ISA_X86_64 => {
            if !model_name.contains("Intel") {
                return Err(Error::UnsupportedProcessor {
                    isa: isa.to_string(),
                    model: model_name.to_string(),
                });
            }

            let model = model.unwrap_or_default().trim();
            match model.parse::<u32>() {
                Ok(INTEL_MODEL_ICELAKE_SP) => Ok(INTEL_ICELAKE),
                Ok(INTEL_MODEL_SKYLAKE_SP) => Ok(INTEL_CASCADELAKE),
                Ok(other) => {
                    warn!(model = other, "unrecognized Intel model, assuming {INTEL_CASCADELAKE}");
                    Ok(INTEL_CASCADELAKE)
                }
                Err(_) => {
                    warn!(model, "unrecognized Intel model, assuming {INTEL_CASCADELAKE}");
                    Ok(INTEL_CASCADELAKE)
                }
            }
        }
        ISA_AARCH64 => Ok(ARM_GENERIC),
        other => Err(Error::UnsupportedIsa(other.to_string())),
    }
}

pub fn detect_architecture(
    executor: &dyn Executor,
    span: &Span,
) -> Result<ArchitectureProfile, Error> {
    let _enter = span.enter();

    let isa = executor.run_checked(ISA_COMMAND)?.trim().to_string();
    debug!(isa, "detected ISA");

    let model_name = executor.run_checked(MODEL_NAME_COMMAND)?.trim().to_string();
    debug!(model_name, "detected processor");

    let model = if isa == ISA_X86_64 && model_name.contains("Intel") {
        Some(executor.run_checked(MODEL_COMMAND)?.trim().to_string())
    } else {
        None
    };

    let arch_id = classify(&isa, &model_name, model.as_deref())?;
    debug!(arch_id, "selected architecture profile");

    ArchitectureProfile::load(arch_id)
}
