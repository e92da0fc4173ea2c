//! SAML 2.0 login plumbing for the IdP-initiated flow.
//!
//! Validation is deliberately shallow: the IdP posts over TLS and the
//! embedded certificate is compared byte-for-byte against the configured
//! one. No XML signature verification happens here. Assertions carrying
//! `InResponseTo` are rejected because this service never issues
//! AuthnRequests.

use std::collections::HashMap;
use std::time::{Duration as StdDuration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};

use crate::models::SsoIdentity;

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
/// Tolerated disagreement between our clock and the IdP's.
const CLOCK_SKEW_SECS: i64 = 90;
/// How long consumed assertion IDs are remembered.
const REPLAY_TTL: StdDuration = StdDuration::from_secs(8 * 3600);

static SEEN_ASSERTIONS: Lazy<DashMap<String, Instant>> = Lazy::new(DashMap::new);

#[derive(thiserror::Error, Debug)]
pub enum SamlError {
    #[error("response is not valid base64")] Encoding,
    #[error("response xml is malformed: {0}")] Xml(#[from] quick_xml::Error),
    #[error("identity provider reported a non-success status")] Status,
    #[error("signing certificate does not match the configured one")] CertMismatch,
    #[error("assertion is outside its validity window")] Expired,
    #[error("assertion audience does not match")] Audience,
    #[error("assertion was already consumed")] Replayed,
    #[error("unsolicited logins only: InResponseTo is not accepted")] Unsolicited,
    #[error("assertion is missing {0}")] Missing(&'static str),
}

/// IdP settings pulled from the environment at startup.
#[derive(Clone, Debug)]
pub struct SamlConfig {
    pub idp_sso_url: String,
    /// Normalized certificate body (PEM armor and whitespace stripped).
    pub idp_cert: String,
    pub audience: Option<String>,
}

impl SamlConfig {
    /// `None` when SSO is not configured; login routes answer 503 then.
    pub fn from_env() -> Option<Self> {
        let idp_sso_url = std::env::var("SAML_IDP_SSO_URL").ok()?;
        let idp_cert = std::env::var("SAML_IDP_CERT").ok()?;
        Some(Self {
            idp_sso_url,
            idp_cert: normalize_cert(&idp_cert),
            audience: std::env::var("SAML_AUDIENCE").ok(),
        })
    }

    /// Where to send the browser for login. `next` survives the round trip
    /// through the IdP as RelayState.
    pub fn login_url(&self, next: Option<&str>) -> String {
        match next.and_then(safe_next) {
            Some(n) => {
                let sep = if self.idp_sso_url.contains('?') { '&' } else { '?' };
                format!("{}{}RelayState={}", self.idp_sso_url, sep, urlencoding::encode(n))
            }
            None => self.idp_sso_url.clone(),
        }
    }
}

/// Strip PEM armor lines and all whitespace so certificates compare
/// regardless of wrapping.
pub fn normalize_cert(raw: &str) -> String {
    raw.lines()
        .filter(|l| !l.contains("CERTIFICATE"))
        .collect::<String>()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Only relative in-app paths may ride along as RelayState.
pub fn safe_next(candidate: &str) -> Option<&str> {
    if candidate.starts_with('/') && !candidate.starts_with("//") {
        Some(candidate)
    } else {
        None
    }
}

/// Fields pulled out of a Response document, unvalidated.
#[derive(Debug, Default)]
struct ParsedAssertion {
    assertion_id: Option<String>,
    in_response_to: Option<String>,
    status: Option<String>,
    name_id: Option<String>,
    certificate: Option<String>,
    not_before: Option<DateTime<Utc>>,
    not_on_or_after: Option<DateTime<Utc>>,
    audience: Option<String>,
    attributes: HashMap<String, String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Capture {
    NameId,
    StatusValueText, // some IdPs put the code in element text instead of the attr
    Certificate,
    Audience,
    AttributeValue,
}

/// Decode and fully validate a form-posted `SAMLResponse`, registering the
/// assertion ID against replays. Returns the member identity on success.
pub fn validate_response(
    encoded: &str,
    cfg: &SamlConfig,
    now: DateTime<Utc>,
) -> Result<SsoIdentity, SamlError> {
    let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD.decode(cleaned.as_bytes()).map_err(|_| SamlError::Encoding)?;
    let xml = String::from_utf8(bytes).map_err(|_| SamlError::Encoding)?;
    let parsed = parse_response(&xml)?;

    match parsed.status.as_deref() {
        Some(STATUS_SUCCESS) => {}
        _ => return Err(SamlError::Status),
    }
    if parsed.in_response_to.as_deref().is_some_and(|v| !v.is_empty()) {
        return Err(SamlError::Unsolicited);
    }

    let presented = parsed.certificate.as_deref().ok_or(SamlError::Missing("X509Certificate"))?;
    if presented != cfg.idp_cert {
        log::warn!(
            "SAML certificate mismatch, presented fingerprint sha256:{}",
            fingerprint(presented)
        );
        return Err(SamlError::CertMismatch);
    }

    let skew = Duration::seconds(CLOCK_SKEW_SECS);
    if let Some(nb) = parsed.not_before {
        if now + skew < nb {
            return Err(SamlError::Expired);
        }
    }
    if let Some(exp) = parsed.not_on_or_after {
        if now - skew >= exp {
            return Err(SamlError::Expired);
        }
    }

    if let (Some(want), Some(got)) = (&cfg.audience, &parsed.audience) {
        if want != got {
            return Err(SamlError::Audience);
        }
    }

    let assertion_id = parsed.assertion_id.as_deref().ok_or(SamlError::Missing("Assertion ID"))?;
    if !register_assertion(assertion_id) {
        return Err(SamlError::Replayed);
    }

    identity_from(&parsed)
}

fn register_assertion(id: &str) -> bool {
    SEEN_ASSERTIONS.retain(|_, seen| seen.elapsed() < REPLAY_TTL);
    match SEEN_ASSERTIONS.entry(id.to_string()) {
        dashmap::mapref::entry::Entry::Occupied(_) => false,
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(Instant::now());
            true
        }
    }
}

fn fingerprint(cert_b64: &str) -> String {
    let der = STANDARD
        .decode(cert_b64.as_bytes())
        .unwrap_or_else(|_| cert_b64.as_bytes().to_vec());
    hex::encode(Sha256::digest(der))
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

/// Last path segment of a claim URI, lowercased. Plain names pass through.
fn attribute_key(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_lowercase()
}

fn parse_response(xml: &str) -> Result<ParsedAssertion, SamlError> {
    let mut reader = Reader::from_str(xml);
    let mut parsed = ParsedAssertion::default();
    let mut capture: Option<Capture> = None;
    let mut current_attribute: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"Response" => {
                        for attr in e.attributes() {
                            let attr = attr.map_err(quick_xml::Error::from)?;
                            if attr.key.local_name().as_ref() == b"InResponseTo" {
                                parsed.in_response_to = Some(attr.unescape_value()?.into_owned());
                            }
                        }
                    }
                    b"StatusCode" => {
                        let mut found = false;
                        for attr in e.attributes() {
                            let attr = attr.map_err(quick_xml::Error::from)?;
                            if attr.key.local_name().as_ref() == b"Value" {
                                // Nested StatusCode elements refine the first; keep the top-level one.
                                if parsed.status.is_none() {
                                    parsed.status = Some(attr.unescape_value()?.into_owned());
                                }
                                found = true;
                            }
                        }
                        if !found && parsed.status.is_none() {
                            capture = Some(Capture::StatusValueText);
                        }
                    }
                    b"Assertion" => {
                        for attr in e.attributes() {
                            let attr = attr.map_err(quick_xml::Error::from)?;
                            if attr.key.local_name().as_ref() == b"ID" && parsed.assertion_id.is_none() {
                                parsed.assertion_id = Some(attr.unescape_value()?.into_owned());
                            }
                        }
                    }
                    b"Conditions" => {
                        for attr in e.attributes() {
                            let attr = attr.map_err(quick_xml::Error::from)?;
                            let value = attr.unescape_value()?;
                            match attr.key.local_name().as_ref() {
                                b"NotBefore" => parsed.not_before = parse_instant(&value),
                                b"NotOnOrAfter" => parsed.not_on_or_after = parse_instant(&value),
                                _ => {}
                            }
                        }
                    }
                    b"NameID" => capture = Some(Capture::NameId),
                    b"X509Certificate" => capture = Some(Capture::Certificate),
                    b"Audience" => capture = Some(Capture::Audience),
                    b"Attribute" => {
                        let mut name: Option<String> = None;
                        let mut friendly: Option<String> = None;
                        for attr in e.attributes() {
                            let attr = attr.map_err(quick_xml::Error::from)?;
                            match attr.key.local_name().as_ref() {
                                b"Name" => name = Some(attr.unescape_value()?.into_owned()),
                                b"FriendlyName" => friendly = Some(attr.unescape_value()?.into_owned()),
                                _ => {}
                            }
                        }
                        current_attribute = friendly.or(name).map(|n| attribute_key(&n));
                    }
                    b"AttributeValue" => capture = Some(Capture::AttributeValue),
                    _ => {}
                }
            }
            Event::Text(ref e) => {
                let text = e.unescape()?.trim().to_string();
                if !text.is_empty() {
                    store_text(&mut parsed, capture, &current_attribute, text);
                }
            }
            Event::CData(ref e) => {
                let text = String::from_utf8_lossy(e.as_ref()).trim().to_string();
                if !text.is_empty() {
                    store_text(&mut parsed, capture, &current_attribute, text);
                }
            }
            Event::End(ref e) => {
                capture = None;
                if e.local_name().as_ref() == b"Attribute" {
                    current_attribute = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(parsed)
}

fn store_text(
    parsed: &mut ParsedAssertion,
    capture: Option<Capture>,
    current_attribute: &Option<String>,
    text: String,
) {
    match capture {
        Some(Capture::NameId) => {
            if parsed.name_id.is_none() {
                parsed.name_id = Some(text);
            }
        }
        Some(Capture::StatusValueText) => {
            if parsed.status.is_none() {
                parsed.status = Some(text);
            }
        }
        Some(Capture::Certificate) => {
            if parsed.certificate.is_none() {
                parsed.certificate = Some(normalize_cert(&text));
            }
        }
        Some(Capture::Audience) => {
            if parsed.audience.is_none() {
                parsed.audience = Some(text);
            }
        }
        Some(Capture::AttributeValue) => {
            if let Some(key) = current_attribute {
                parsed.attributes.entry(key.clone()).or_insert(text);
            }
        }
        None => {}
    }
}

fn identity_from(parsed: &ParsedAssertion) -> Result<SsoIdentity, SamlError> {
    let external_id = parsed.name_id.clone().ok_or(SamlError::Missing("NameID"))?;

    let email = parsed
        .attributes
        .get("email")
        .or_else(|| parsed.attributes.get("mail"))
        .or_else(|| parsed.attributes.get("emailaddress"))
        .cloned()
        .or_else(|| external_id.contains('@').then(|| external_id.clone()))
        .ok_or(SamlError::Missing("email attribute"))?;

    let display_name = parsed
        .attributes
        .get("displayname")
        .cloned()
        .or_else(|| {
            let first = parsed
                .attributes
                .get("firstname")
                .or_else(|| parsed.attributes.get("givenname"))?;
            let last = parsed
                .attributes
                .get("lastname")
                .or_else(|| parsed.attributes.get("surname"))?;
            Some(format!("{first} {last}"))
        })
        .unwrap_or_else(|| email.split('@').next().unwrap_or(&email).to_string());

    Ok(SsoIdentity { external_id, email, display_name })
}
