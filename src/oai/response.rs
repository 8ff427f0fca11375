//! OAI-PMH response documents.

use crate::error::{HarvestError, Result};
use crate::types::Timestamp;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

pub const OAI_NAMESPACE: &str = "http://www.openarchives.org/OAI/2.0/";
pub const OAI_SCHEMA_LOCATION: &str =
    "http://www.openarchives.org/OAI/2.0/ http://www.openarchives.org/OAI/2.0/OAI-PMH.xsd";
pub const OAI_DC_NAMESPACE: &str = "http://www.openarchives.org/OAI/2.0/oai_dc/";
pub const OAI_DC_SCHEMA_LOCATION: &str =
    "http://www.openarchives.org/OAI/2.0/oai_dc/ http://www.openarchives.org/OAI/2.0/oai_dc.xsd";
pub const DC_NAMESPACE: &str = "http://purl.org/dc/elements/1.1/";
pub const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Streaming builder for one `OAI-PMH` document.
pub struct ResponseBuilder {
    writer: Writer<Vec<u8>>,
}

impl ResponseBuilder {
    /// Write the envelope up to and including `<request>`.
    ///
    /// `request` becomes the attributes of `<request>`, whose text is the
    /// base URL.
    pub fn begin(base_url: &str, request: &[(String, String)], now: Timestamp) -> Result<Self> {
        let mut builder = Self {
            writer: Writer::new(Vec::new()),
        };

        builder.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        builder.event(Event::Start(BytesStart::new("OAI-PMH").with_attributes([
            ("xmlns", OAI_NAMESPACE),
            ("xmlns:xsi", XSI_NAMESPACE),
            ("xsi:schemaLocation", OAI_SCHEMA_LOCATION),
        ])))?;
        builder.text_element("responseDate", &now.to_string())?;

        let mut element = BytesStart::new("request");
        for (name, value) in request {
            element.push_attribute((name.as_str(), value.as_str()));
        }
        builder.event(Event::Start(element))?;
        builder.text(base_url)?;
        builder.event(Event::End(BytesEnd::new("request")))?;

        Ok(builder)
    }

    pub fn start(&mut self, name: &str) -> Result<()> {
        self.event(Event::Start(BytesStart::new(name)))
    }

    pub fn start_with(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        self.event(Event::Start(
            BytesStart::new(name).with_attributes(attributes.iter().copied()),
        ))
    }

    pub fn end(&mut self, name: &str) -> Result<()> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    /// Escaped character data.
    pub fn text(&mut self, text: &str) -> Result<()> {
        self.event(Event::Text(BytesText::new(text)))
    }

    /// `<name>text</name>`, text escaped.
    pub fn text_element(&mut self, name: &str, text: &str) -> Result<()> {
        self.start(name)?;
        self.text(text)?;
        self.end(name)
    }

    /// Insert already well-formed XML verbatim.
    pub fn raw(&mut self, xml: &str) -> Result<()> {
        self.event(Event::Text(BytesText::from_escaped(xml)))
    }

    /// Close the document.
    pub fn finish(mut self) -> Result<String> {
        self.end("OAI-PMH")?;
        String::from_utf8(self.writer.into_inner())
            .map_err(|e| HarvestError::Xml(e.to_string()))
    }

    fn event(&mut self, event: Event<'_>) -> Result<()> {
        self.writer
            .write_event(event)
            .map_err(|e| HarvestError::Xml(e.to_string()))
    }
}
