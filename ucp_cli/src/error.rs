use libucp::UcpError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid settings file: {0}")]
    InvalidSettings(#[from] serde_yml::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] UcpError),
    #[error("Benchmark failed: {0}")]
    Bench(String),
}
