pub mod agent;
pub mod bpf;
pub mod config;
pub mod http;
pub mod inspect;
pub mod metrics;
pub mod services;
pub mod sync;

use aya::EbpfError;
use aya::programs::ProgramError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    EbpfError(String),

    #[error("{0}")]
    EbpfProgramError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("conversion error: {0}")]
    ConversionError(String),

    #[error("addr parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("map error: {0}")]
    MapError(#[from] aya::maps::MapError),

    #[error("map {name} not found")]
    MapNotFound { name: String },

    #[error("failed to parse services file: {0}")]
    YamlConversion(#[from] serde_yaml::Error),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("task failed: {0}")]
    Task(String),

    #[error("{failed} service writes failed, first: {first}")]
    PartialSync { failed: usize, first: Box<Error> },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::EbpfError(_) | Error::EbpfProgramError(_) => "ebpf".into(),
            Error::IoError(_) => "io".into(),
            Error::ConversionError(_) | Error::AddrParseError(_) => "conversion".into(),
            Error::MapError(_) | Error::MapNotFound { .. } => "map".into(),
            Error::YamlConversion(_) | Error::InvalidProtocol(_) => "parse".into(),
            Error::Task(_) => "task".into(),
            Error::PartialSync { first, .. } => first.metric_label(),
            Error::Other(_) => "other".into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<aya::EbpfError> for Error {
    fn from(err: EbpfError) -> Self {
        Self::EbpfError(err.to_string())
    }
}

impl From<aya::programs::ProgramError> for Error {
    fn from(err: ProgramError) -> Self {
        Self::EbpfProgramError(err.to_string())
    }
}
