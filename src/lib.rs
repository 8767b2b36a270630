mod config;
mod backend;
mod header;
mod storage;
mod simulator;
mod spectrometer;
mod instrument;

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation is not valid in the current lifecycle state, or was given a bad argument.
    #[error("precondition violated: {0}")]
    Precondition(String),
    /// The instrument replied with something that could not be understood.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The instrument did not produce a result before the deadline.
    #[error("no data from the instrument within {0:?}")]
    Timeout(Duration),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("binary encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("text encoding error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    pub(crate) fn precondition(reason: impl Into<String>) -> Self {
        Error::Precondition(reason.into())
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol(reason.into())
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::Precondition(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T> =
    core::result::Result<T, Error>;

pub use config::{
    SpectrometerConfiguration,
    InstrumentConfiguration,
    MAX_INTEGRATION_TIME,
};

pub use backend::{
    Backend,
    BufferSet,
    ConnectionState,
    Link,
};

pub use header::{
    Header,
    HEADER_LEN,
};

pub use storage::{
    DataSink,
    FileStore,
    Format,
    load,
};

pub use simulator::DummyInstrument;

pub use spectrometer::SpectrometerBackend;

pub use instrument::{
    InstrumentBackend,
    parse_reply,
};
