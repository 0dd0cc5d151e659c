use thiserror::Error;

use crate::pipeline::Stage;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{step} failed")]
    Execution {
        step: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("sampling failed on the SUT: {}", .failed.join(", "))]
    PartialSampling { failed: Vec<String> },
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
    #[error("run aborted: {0}")]
    Aborted(String),
    #[error("cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: Stage, to: Stage },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn execution(
        step: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::Execution {
            step: step.into(),
            source: source.into(),
        }
    }

    /// Errors that leave nothing usable behind. Anything else may still have
    /// produced raw data in the test directory.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Execution { .. } | Error::PartialSampling { .. })
    }
}

impl From<hperf_pmu::Error> for Error {
    fn from(err: hperf_pmu::Error) -> Self {
        match err {
            hperf_pmu::Error::Executor(source) => Error::execution("architecture detection", source),
            other => Error::Configuration(format_chain(&other)),
        }
    }
}

pub fn format_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
