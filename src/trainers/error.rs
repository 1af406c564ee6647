//! Fatal training errors
//! None of these are retried; they propagate up to the binary and end the run

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("missing required argument `--{0}`")]
    MissingArgument(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Gradient accumulation is not supported when training the text encoder in distributed training. \
         Please set gradient_accumulation_steps to 1."
    )]
    TextEncoderAccumulation,

    #[error("text encoder architecture `{0}` is not supported")]
    UnsupportedArchitecture(String),

    #[error("Unknown prediction type {0}")]
    UnknownPredictionType(String),

    #[error("{feature} is not available in this build: {hint}")]
    MissingOptionalDependency {
        feature: &'static str,
        hint: &'static str,
    },
}
