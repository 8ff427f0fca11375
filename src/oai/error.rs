//! OAI-PMH protocol errors.

use thiserror::Error;

/// Error conditions a harvester can receive; rendered as `<error code="…">`
/// inside a successful HTTP response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum OaiError {
    #[error("Value of the verb argument is not a legal OAI-PMH verb, the verb argument is missing, or the verb argument is repeated.")]
    BadVerb,

    #[error("The request includes illegal arguments, is missing required arguments, includes a repeated argument, or values for arguments have an illegal syntax.")]
    BadArgument,

    #[error("The metadata format identified by the value given for the metadataPrefix argument is not supported by the item or by the repository.")]
    CannotDisseminateFormat,

    #[error("The combination of the values of the from, until, set and metadataPrefix arguments results in an empty list.")]
    NoRecordsMatch,

    #[error("The value of the resumptionToken argument is invalid or expired.")]
    BadResumptionToken,
}

impl OaiError {
    /// Protocol error code.
    pub fn code(&self) -> &'static str {
        match self {
            OaiError::BadVerb => "badVerb",
            OaiError::BadArgument => "badArgument",
            OaiError::CannotDisseminateFormat => "cannotDisseminateFormat",
            OaiError::NoRecordsMatch => "noRecordsMatch",
            OaiError::BadResumptionToken => "badResumptionToken",
        }
    }

    /// Whether the response repeats the request arguments. Requests that
    /// were not understood are not echoed.
    pub fn echoes_request(&self) -> bool {
        !matches!(self, OaiError::BadVerb | OaiError::BadArgument)
    }
}
