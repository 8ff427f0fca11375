//! The OAI-PMH protocol engine.
//!
//! Stateless: every request is answered from the repository's committed
//! dumps. Protocol errors are ordinary responses; only storage failures
//! surface as `Err`.

use super::error::OaiError;
use super::request::{DateRange, OaiRequest, Verb, METADATA_PREFIX};
use super::response::{
    ResponseBuilder, DC_NAMESPACE, OAI_DC_NAMESPACE, OAI_DC_SCHEMA_LOCATION, XSI_NAMESPACE,
};
use super::token::ResumptionToken;
use crate::dumps::{PageRef, MARC_NAMESPACE};
use crate::error::{HarvestError, Result};
use crate::repository::Repository;
use crate::types::{Stream, StreamId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const MARC21_SCHEMA: &str = "http://www.loc.gov/standards/marcxml/schema/MARC21slim.xsd";

/// What `Identify` reports about the repository.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OaiConfig {
    pub repository_name: String,

    /// Public URL of the endpoint, echoed in every response.
    pub base_url: String,

    pub admin_email: String,
}

impl Default for OaiConfig {
    fn default() -> Self {
        Self {
            repository_name: "POD Aggregator".to_string(),
            base_url: "http://localhost:3000/oai".to_string(),
            admin_email: "admin@example.org".to_string(),
        }
    }
}

/// A rendered response. `verb` is set whenever the request named exactly one
/// known verb, even if it then failed.
#[derive(Clone, Debug)]
pub struct OaiResponse {
    pub verb: Option<Verb>,
    pub body: String,
}

pub struct OaiEngine {
    repository: Arc<Repository>,
    config: OaiConfig,
}

impl OaiEngine {
    pub fn new(repository: Arc<Repository>, config: OaiConfig) -> Self {
        Self { repository, config }
    }

    pub fn config(&self) -> &OaiConfig {
        &self.config
    }

    /// Answer one request given as ordered `(name, value)` pairs.
    pub fn respond(&self, params: &[(String, String)]) -> Result<OaiResponse> {
        self.respond_at(params, Timestamp::now())
    }

    pub fn respond_at(&self, params: &[(String, String)], now: Timestamp) -> Result<OaiResponse> {
        let verb = OaiRequest::verb(params).ok();

        let body = match self.dispatch(params, now) {
            Ok(body) => body,
            Err(HarvestError::Oai(error)) => {
                debug!(verb = ?verb, code = error.code(), "protocol error");
                self.error_response(error, params, now)?
            }
            Err(e) => return Err(e),
        };

        Ok(OaiResponse { verb, body })
    }

    fn dispatch(&self, params: &[(String, String)], now: Timestamp) -> Result<String> {
        let request = OaiRequest::parse(params)?;
        debug!(verb = request.verb.as_str(), "dispatching");

        match request.verb {
            Verb::Identify => self.identify(params, now),
            Verb::ListMetadataFormats => self.list_metadata_formats(params, now),
            Verb::ListSets => self.list_sets(&request, params, now),
            Verb::ListRecords => self.list_records(&request, params, now),
        }
    }

    fn list_records(
        &self,
        request: &OaiRequest,
        params: &[(String, String)],
        now: Timestamp,
    ) -> Result<String> {
        let (token, from_token) = match request.get("resumptionToken") {
            Some(encoded) => {
                if request.argument_count() > 1 {
                    return Err(OaiError::BadArgument.into());
                }
                (ResumptionToken::decode(encoded)?, true)
            }
            None => {
                let prefix = request.get("metadataPrefix").ok_or(OaiError::BadArgument)?;
                if prefix != METADATA_PREFIX {
                    return Err(OaiError::CannotDisseminateFormat.into());
                }
                let token = ResumptionToken::new(
                    present(request.get("set")),
                    present(request.get("from")),
                    present(request.get("until")),
                );
                (token, false)
            }
        };

        let range = DateRange::parse(token.from_date.as_deref(), token.until_date.as_deref())
            .ok_or(if from_token {
                OaiError::BadResumptionToken
            } else {
                OaiError::BadArgument
            })?;

        let pages = self.record_pages(token.set.as_deref(), range);
        let last = pages.len().checked_sub(1).ok_or(OaiError::NoRecordsMatch)?;
        let next = match token.page {
            page if page == last => None,
            page if page < last => Some(token.next_page().encode()),
            _ => return Err(OaiError::BadResumptionToken.into()),
        };

        let content = self.repository.read_page(&pages[token.page])?;
        let fragments = String::from_utf8(content)
            .map_err(|e| HarvestError::Corruption(format!("OAI page is not UTF-8: {e}")))?;

        let mut response = ResponseBuilder::begin(&self.config.base_url, params, now)?;
        response.start("ListRecords")?;
        response.raw(&fragments)?;
        if let Some(next) = next {
            response.text_element("resumptionToken", &next)?;
        }
        response.end("ListRecords")?;
        response.finish()
    }

    /// OAI pages of the selected streams' current dumps in commit order.
    ///
    /// Dump ids are allocated under the catalog commit lock, so a dump
    /// committed during a harvest always lands after every page already
    /// listed, whatever its window.
    fn record_pages(&self, set: Option<&str>, range: DateRange) -> Vec<PageRef> {
        let streams: Vec<StreamId> = match set {
            Some(set) => set
                .parse::<u64>()
                .ok()
                .map(StreamId)
                .filter(|id| self.repository.stream(*id).is_ok())
                .into_iter()
                .collect(),
            None => self
                .repository
                .harvestable_streams()
                .into_iter()
                .map(|s| s.id)
                .collect(),
        };

        let mut dumps: Vec<_> = streams
            .into_iter()
            .flat_map(|stream| self.repository.current_dumps(stream))
            .collect();
        dumps.sort_by_key(|dump| dump.id);

        dumps
            .iter()
            .filter(|dump| range.contains(dump.created_at))
            .flat_map(|dump| dump.oai_pages.iter().cloned())
            .collect()
    }

    fn list_sets(
        &self,
        request: &OaiRequest,
        params: &[(String, String)],
        now: Timestamp,
    ) -> Result<String> {
        // Sets are never paged, so no token can be valid.
        if request.get("resumptionToken").is_some() {
            return Err(OaiError::BadResumptionToken.into());
        }

        let mut response = ResponseBuilder::begin(&self.config.base_url, params, now)?;
        response.start("ListSets")?;
        for stream in self.repository.harvestable_streams() {
            response.start("set")?;
            response.text_element("setSpec", &stream.id.to_string())?;
            response.text_element(
                "setName",
                &format!("{}, stream {}", stream.organization, stream.display_name()),
            )?;
            response.start("setDescription")?;
            response.start_with(
                "oai_dc:dc",
                &[
                    ("xmlns:oai_dc", OAI_DC_NAMESPACE),
                    ("xmlns:dc", DC_NAMESPACE),
                    ("xmlns:xsi", XSI_NAMESPACE),
                    ("xsi:schemaLocation", OAI_DC_SCHEMA_LOCATION),
                ],
            )?;
            response.text_element("dc:description", &self.set_description(&stream))?;
            response.end("oai_dc:dc")?;
            response.end("setDescription")?;
            response.end("set")?;
        }
        response.end("ListSets")?;
        response.finish()
    }

    /// The periods during which the stream was its organization's default.
    fn set_description(&self, stream: &Stream) -> String {
        let periods: Vec<String> = self
            .repository
            .default_history(stream.id)
            .iter()
            .map(|period| match period.end_time {
                Some(end) => format!(
                    "{} to {}",
                    period.start_time.date_string(),
                    end.date_string()
                ),
                None => format!("{} to present", period.start_time.date_string()),
            })
            .collect();

        format!(
            "Records from {} (default stream {})",
            stream.organization,
            periods.join(", ")
        )
    }

    fn identify(&self, params: &[(String, String)], now: Timestamp) -> Result<String> {
        let earliest = self.repository.earliest_datestamp().unwrap_or(now);

        let mut response = ResponseBuilder::begin(&self.config.base_url, params, now)?;
        response.start("Identify")?;
        response.text_element("repositoryName", &self.config.repository_name)?;
        response.text_element("baseURL", &self.config.base_url)?;
        response.text_element("protocolVersion", "2.0")?;
        response.text_element("earliestDatestamp", &earliest.date_string())?;
        response.text_element("deletedRecord", "transient")?;
        response.text_element("granularity", "YYYY-MM-DD")?;
        response.text_element("adminEmail", &self.config.admin_email)?;
        response.end("Identify")?;
        response.finish()
    }

    fn list_metadata_formats(&self, params: &[(String, String)], now: Timestamp) -> Result<String> {
        let mut response = ResponseBuilder::begin(&self.config.base_url, params, now)?;
        response.start("ListMetadataFormats")?;
        response.start("metadataFormat")?;
        response.text_element("metadataPrefix", METADATA_PREFIX)?;
        response.text_element("schema", MARC21_SCHEMA)?;
        response.text_element("metadataNamespace", MARC_NAMESPACE)?;
        response.end("metadataFormat")?;
        response.end("ListMetadataFormats")?;
        response.finish()
    }

    fn error_response(
        &self,
        error: OaiError,
        params: &[(String, String)],
        now: Timestamp,
    ) -> Result<String> {
        let echoed: &[(String, String)] = if error.echoes_request() { params } else { &[] };

        let mut response = ResponseBuilder::begin(&self.config.base_url, echoed, now)?;
        response.start_with("error", &[("code", error.code())])?;
        response.text(&error.to_string())?;
        response.end("error")?;
        response.finish()
    }
}

/// Blank arguments count as absent.
fn present(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
