//! Startup negotiation with a running marimo server.
//!
//! The server's landing page embeds the values a client needs before it can
//! make authenticated calls, each as a data attribute on a custom element:
//!
//! ```text
//! <marimo-server-token data-token="...">
//! <marimo-user-config data-config="{...json...}">
//! <marimo-version data-version="0.9.1">
//! ```
//!
//! Fetching does not retry; callers decide whether to try again.

use std::time::Duration;

use log::debug;
use serde::Serialize;
use url::Url;

/// Path the server redirects to when it requires a login we don't have.
pub const AUTH_LOGIN_PATH: &str = "/auth/login";

/// Errors from fetching or parsing the landing page.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("Failed to reach marimo server: {0}")]
    Request(#[from] reqwest::Error),

    #[error("marimo server returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error(
        "Port is held by a marimo server this host did not launch (redirected to {url}); \
         stop it or choose another port"
    )]
    ForeignServer { url: String },

    #[error("Could not find <{0}> on the marimo landing page")]
    MissingElement(&'static str),

    #[error("<{element}> has no {attribute} attribute")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("Invalid user config in <marimo-user-config>: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}

impl NegotiationError {
    /// Whether trying again could help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NegotiationError::Request(_) | NegotiationError::Status { .. }
        )
    }
}

/// Session-critical values extracted from the landing page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupValues {
    pub skew_token: String,
    pub version: String,
    pub user_config: serde_json::Value,
}

/// Everything a start cycle produces. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupResult {
    pub port: u16,
    pub skew_token: String,
    pub version: String,
    pub user_config: serde_json::Value,
}

impl StartupResult {
    pub fn new(port: u16, values: StartupValues) -> Self {
        Self {
            port,
            skew_token: values.skew_token,
            version: values.version,
            user_config: values.user_config,
        }
    }
}

/// Fetches and parses the landing page of a marimo server.
#[derive(Clone)]
pub struct StartupNegotiator {
    client: reqwest::Client,
}

impl StartupNegotiator {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// GET `landing_url` and extract the startup values.
    pub async fn fetch(&self, landing_url: &Url) -> Result<StartupValues, NegotiationError> {
        debug!("[negotiator] Fetching {}", landing_url);
        let response = self.client.get(landing_url.clone()).send().await?;

        let final_url = response.url().clone();
        if final_url.path().starts_with(AUTH_LOGIN_PATH) {
            return Err(NegotiationError::ForeignServer {
                url: final_url.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(NegotiationError::Status {
                status: response.status().as_u16(),
                url: final_url.to_string(),
            });
        }

        let body = response.text().await?;
        parse_landing_page(&body)
    }
}

/// Extract the startup values from landing page markup.
pub fn parse_landing_page(html: &str) -> Result<StartupValues, NegotiationError> {
    let skew_token = required_attribute(html, "marimo-server-token", "data-token")?;
    let config = required_attribute(html, "marimo-user-config", "data-config")?;
    let version = required_attribute(html, "marimo-version", "data-version")?;

    Ok(StartupValues {
        skew_token,
        version,
        user_config: serde_json::from_str(&config)?,
    })
}

fn required_attribute(
    html: &str,
    element: &'static str,
    attribute: &'static str,
) -> Result<String, NegotiationError> {
    let attributes = find_element(html, element).ok_or(NegotiationError::MissingElement(element))?;
    attributes
        .into_iter()
        .find(|(name, _)| name == attribute)
        .map(|(_, value)| value)
        .ok_or(NegotiationError::MissingAttribute { element, attribute })
}

/// Find the first opening tag named `tag` and return its attributes with
/// entity-decoded values.
fn find_element(html: &str, tag: &str) -> Option<Vec<(String, String)>> {
    for (start, _) in html.match_indices('<') {
        let rest = &html[start + 1..];
        let Some(name) = rest.get(..tag.len()) else {
            continue;
        };
        if !name.eq_ignore_ascii_case(tag) {
            continue;
        }
        let after = &rest[tag.len()..];
        match after.chars().next() {
            Some(c) if c.is_whitespace() || c == '>' || c == '/' => {
                return Some(parse_attributes(after));
            }
            _ => continue,
        }
    }
    None
}

/// Parse attributes from the text following a tag name, up to the closing `>`.
fn parse_attributes(input: &str) -> Vec<(String, String)> {
    let mut attributes = Vec::new();
    let mut chars = input.char_indices().peekable();

    loop {
        while chars.next_if(|(_, c)| c.is_whitespace() || *c == '/').is_some() {}
        let Some(&(start, c)) = chars.peek() else {
            break;
        };
        if c == '>' {
            break;
        }

        let mut end = start;
        while let Some((i, c)) = chars.next_if(|(_, c)| {
            !c.is_whitespace() && *c != '=' && *c != '>' && *c != '/'
        }) {
            end = i + c.len_utf8();
        }
        let name = input[start..end].to_ascii_lowercase();

        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
        if chars.next_if(|(_, c)| *c == '=').is_none() {
            attributes.push((name, String::new()));
            continue;
        }
        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let value = match chars.peek().copied() {
            Some((i, quote @ ('"' | '\''))) => {
                chars.next();
                let value_start = i + 1;
                let mut value_end = input.len();
                for (j, c) in chars.by_ref() {
                    if c == quote {
                        value_end = j;
                        break;
                    }
                }
                &input[value_start..value_end.max(value_start)]
            }
            Some((i, _)) => {
                let mut value_end = i;
                while let Some((j, c)) = chars.next_if(|(_, c)| !c.is_whitespace() && *c != '>') {
                    value_end = j + c.len_utf8();
                }
                &input[i..value_end]
            }
            None => "",
        };
        attributes.push((name, decode_entities(value)));
    }

    attributes
}

/// Decode the HTML entities marimo uses when escaping attribute values.
fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&#34;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
