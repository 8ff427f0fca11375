//! OAI-PMH 2.0 harvesting interface over committed dumps.

mod engine;
mod error;
mod request;
mod response;
mod token;

pub use engine::{OaiConfig, OaiEngine, OaiResponse};
pub use error::OaiError;
pub use request::{DateRange, OaiRequest, Verb, METADATA_PREFIX};
pub use token::ResumptionToken;
