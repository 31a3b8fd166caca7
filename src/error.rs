//! Error types for the dispatch engine.

use thiserror::Error;

use crate::domain::campaign::CampaignId;
use crate::domain::template::TemplateId;

/// Result type alias using the broadside error type.
pub type Result<T> = std::result::Result<T, BroadsideError>;

/// Main error type for the dispatch engine.
#[derive(Error, Debug)]
pub enum BroadsideError {
    /// Campaign not found
    #[error("Campaign not found: {0}")]
    CampaignNotFound(CampaignId),

    /// Template not found
    #[error("Template not found: {0}")]
    TemplateNotFound(TemplateId),

    /// Stored file could not be resolved
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Campaign is in an invalid state for the requested operation
    #[error("Invalid state transition: campaign {0} is in state '{1}', expected '{2}'")]
    InvalidState(CampaignId, String, String),

    /// Validation error (e.g., empty contact list, missing schedule time)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dispatcher is shutting down
    #[error("Dispatcher is shutting down")]
    Shutdown,

    /// Contact file could not be parsed
    #[error("Contact file could not be parsed: {0}")]
    ContactFile(#[from] csv::Error),

    /// Email message could not be assembled
    #[error("Email could not be built: {0}")]
    Message(#[from] lettre::error::Error),

    /// A recipient or sender address did not parse
    #[error("Invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// SMTP transport error
    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
