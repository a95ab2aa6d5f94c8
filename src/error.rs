use std::{io, path::PathBuf};

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid quoted-printable content: {0}")]
    QuotedPrintable(#[from] quoted_printable::QuotedPrintableError),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Parse(#[from] mailparse::MailParseError),
    #[error("failed to decode message body: {0}")]
    Body(#[from] TransferError),
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("failed to parse token response: {source}, body: {body}")]
    Malformed {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("no access token in response, body: {body}")]
    MissingToken { body: String },
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("sendMail request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to encode sendMail request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Graph API error ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("cannot unwrap secret `{field}`: {reason}")]
    Secret { field: &'static str, reason: String },
}
