pub mod cpu_family;
pub mod event_group;
mod profile;

pub use cpu_family::{classify, detect_architecture, find_architecture, known_architectures};
pub use event_group::{
    optimize_groups, pack_groups, parse_selection_string, selection_string, EventGroup,
    ParsedSelection, PINNED_SUFFIX,
};
pub use hperf_data::{EventDesc, EventScope, ISA_AARCH64, ISA_X86_64};
pub use profile::{ArchitectureProfile, CompiledMetric};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported ISA '{0}'")]
    UnsupportedIsa(String),
    #[error("unsupported {isa} processor '{model}'")]
    UnsupportedProcessor { isa: String, model: String },
    #[error("no architecture profile named '{0}'")]
    UnknownArchitecture(String),
    #[error("invalid architecture profile")]
    InvalidProfile(#[from] hperf_data::DescError),
    #[error("event id {0} is not defined by the architecture profile")]
    MissingEvent(u32),
    #[error("malformed event selection '{0}'")]
    MalformedSelection(String),
    #[error("failed to query the SUT")]
    Executor(#[from] hperf_sut::Error),
}
