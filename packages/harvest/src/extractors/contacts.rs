//! Contact details from a web page, via an LLM.
//!
//! The page is fetched once and parsed with `scraper`. Its visible text is
//! handed to the model together with any `mailto:`/`tel:` links found in
//! `a[href]` attributes. Links are merged into the model's answer so they
//! survive a model that ignores them.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use openrouter_client::{truncate_to_char_boundary, OpenRouterClient};
use scraper::{Html, Node, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::ProviderConfig;
use crate::engine::Extractor;
use crate::error::{Error, ExtractionError, Result};
use crate::types::WorkInput;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_PAGE_BYTES: usize = 12_000;

const SYSTEM_PROMPT: &str = "You extract contact details from website text. \
Find names of people, organizations or departments, phone numbers and email addresses \
anywhere in the text, including footers, headers, team and contact sections, and the \
links listed separately. Handle formatting variations such as country codes or obfuscated \
emails. Respond with a JSON object with exactly the keys `names`, `phone_numbers` and \
`email_addresses`, each a list of unique strings. Use an empty list when nothing is found. \
Do not invent values.";

const NAME_KEYS: &[&str] = &["names", "name", "contact_names", "people", "owners", "staff"];
const PHONE_KEYS: &[&str] = &["phone_numbers", "phones", "contact_phones", "telephone", "phone", "tel"];
const EMAIL_KEYS: &[&str] = &["email_addresses", "emails", "contact_emails", "email", "mail"];

/// Placeholder values models emit instead of an empty list.
const PLACEHOLDERS: &[&str] = &["none", "null", "n/a"];

/// Elements whose content is never visible text.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "iframe"];

/// Contacts found for one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactDetails {
    pub names: Vec<String>,
    pub phones: Vec<String>,
    pub emails: Vec<String>,
    /// The model's reply as parsed JSON
    pub raw_response: Value,
}

/// `"; "`-joined columns, `None` when a list is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinedContacts {
    pub names: Option<String>,
    pub phones: Option<String>,
    pub emails: Option<String>,
}

impl ContactDetails {
    /// Read a model reply, tolerating alternate key names and a `content` wrapper.
    pub fn from_llm_value(value: &Value) -> Self {
        let content = match value.get("content") {
            Some(inner @ Value::Object(_)) => inner,
            _ => value,
        };

        Self {
            names: clean_list(pick_list(content, NAME_KEYS)),
            phones: clean_list(pick_list(content, PHONE_KEYS)),
            emails: clean_list(pick_list(content, EMAIL_KEYS)),
            raw_response: value.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.phones.is_empty() && self.emails.is_empty()
    }

    pub fn joined(&self) -> JoinedContacts {
        let join = |items: &[String]| (!items.is_empty()).then(|| items.join("; "));
        JoinedContacts {
            names: join(&self.names),
            phones: join(&self.phones),
            emails: join(&self.emails),
        }
    }

    fn merge_links(&mut self, links: PageLinks) {
        self.emails = clean_list(self.emails.drain(..).chain(links.emails).collect());
        self.phones = clean_list(self.phones.drain(..).chain(links.phones).collect());
    }
}

/// First alias whose value is non-empty, as strings.
fn pick_list(content: &Value, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .filter_map(|key| content.get(*key))
        .map(as_strings)
        .find(|items| !items.is_empty())
        .unwrap_or_default()
}

fn as_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(scalar_string).collect(),
        other => scalar_string(other).into_iter().collect(),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Trim, drop blanks and placeholders, dedupe keeping first occurrence.
fn clean_list(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .filter(|item| !PLACEHOLDERS.contains(&item.to_lowercase().as_str()))
        .filter(|item| seen.insert(item.to_lowercase()))
        .collect()
}

#[derive(Debug, Default, PartialEq)]
struct PageLinks {
    emails: Vec<String>,
    phones: Vec<String>,
}

/// `mailto:` and `tel:` targets of every link in the document.
fn harvest_links(document: &Html) -> PageLinks {
    let link_selector = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return PageLinks::default(),
    };

    let mut emails = Vec::new();
    let mut phones = Vec::new();
    for href in document
        .select(&link_selector)
        .filter_map(|el| el.value().attr("href"))
    {
        let Ok(target) = Url::parse(href.trim()) else {
            continue;
        };
        let value = match urlencoding::decode(target.path()) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => target.path().to_string(),
        };
        match target.scheme() {
            "mailto" => emails.push(value),
            "tel" => phones.push(value),
            _ => {}
        }
    }

    PageLinks {
        emails: clean_list(emails),
        phones: clean_list(phones),
    }
}

/// Visible text of an HTML document, whitespace collapsed.
pub fn html_to_text(html: &str) -> String {
    visible_text(&Html::parse_document(html))
}

fn visible_text(document: &Html) -> String {
    let mut words: Vec<&str> = Vec::new();
    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            matches!(ancestor.value(), Node::Element(el) if HIDDEN_ELEMENTS.contains(&el.name()))
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ")
}

/// Extracts [`ContactDetails`] from URL work items.
#[derive(Clone)]
pub struct ContactExtractor {
    http: reqwest::Client,
    llm: OpenRouterClient,
    model: String,
    max_page_bytes: usize,
}

impl ContactExtractor {
    pub fn new(llm: OpenRouterClient, model: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            llm,
            model: model.into(),
            max_page_bytes: DEFAULT_MAX_PAGE_BYTES,
        })
    }

    pub fn from_config(providers: &ProviderConfig) -> Result<Self> {
        let api_key = providers
            .openrouter_api_key
            .clone()
            .ok_or_else(|| Error::Config("OPENROUTER_API_KEY must be set".into()))?;
        let llm = OpenRouterClient::new(api_key)
            .with_base_url(&providers.openrouter_base_url)
            .with_app_name("harvest");

        Self::new(llm, &providers.openrouter_model)
    }

    /// Cap on page text sent to the model.
    pub fn with_max_page_bytes(mut self, max_page_bytes: usize) -> Self {
        self.max_page_bytes = max_page_bytes;
        self
    }

    pub async fn extract_contacts(&self, raw_url: &str) -> std::result::Result<ContactDetails, ExtractionError> {
        let url = Url::parse(raw_url)
            .map_err(|e| ExtractionError::permanent(format!("invalid URL {}: {}", raw_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ExtractionError::permanent(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }

        let html = self.fetch_page(&url).await?;
        // `Html` is not `Send`; keep it out of the await below
        let (links, text) = {
            let document = Html::parse_document(&html);
            (harvest_links(&document), visible_text(&document))
        };
        let text = truncate_to_char_boundary(&text, self.max_page_bytes);

        let mut prompt = format!("Website: {}\n\nPage text:\n{}", url, text);
        if !links.emails.is_empty() || !links.phones.is_empty() {
            prompt.push_str(&format!(
                "\n\nLinked emails: {}\nLinked phone numbers: {}",
                links.emails.join(", "),
                links.phones.join(", ")
            ));
        }

        let reply = self.llm.json_completion(&self.model, SYSTEM_PROMPT, prompt).await?;
        let mut details = ContactDetails::from_llm_value(&reply);
        details.merge_links(links);

        debug!(
            %url,
            names = details.names.len(),
            phones = details.phones.len(),
            emails = details.emails.len(),
            "extracted contacts"
        );
        Ok(details)
    }

    async fn fetch_page(&self, url: &Url) -> std::result::Result<String, ExtractionError> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ExtractionError::retryable(format!("failed to fetch {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("fetching {} returned HTTP {}", url, status.as_u16());
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                ExtractionError::retryable(message)
            } else {
                ExtractionError::permanent(message)
            });
        }

        response
            .text()
            .await
            .map_err(|e| ExtractionError::retryable(format!("failed to read {}: {}", url, e)))
    }
}

#[async_trait]
impl Extractor for ContactExtractor {
    async fn extract(&self, input: &WorkInput) -> std::result::Result<Value, ExtractionError> {
        let url = input.as_url().unwrap_or(&input.key);
        let details = self.extract_contacts(url).await?;
        serde_json::to_value(&details).map_err(|e| ExtractionError::permanent(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;
    use httpmock::prelude::*;
    use serde_json::json;

    const PAGE: &str = r#"<html><head><style>.x { color: red }</style>
        <script>var email = "bot@trap.example";</script></head>
        <body><h1>Main Street Clinic</h1>
        <!-- old: legacy@clinic.example -->
        <p>Call us &amp; visit.</p>
        <a href="mailto:front@clinic.example?subject=Hi">Email</a>
        <a href="tel:+1-555-010-2000">Phone</a>
        </body></html>"#;

    fn extractor(server: &MockServer) -> ContactExtractor {
        let llm = OpenRouterClient::new("sk-test").with_base_url(server.base_url());
        ContactExtractor::new(llm, "test-model").unwrap()
    }

    #[test]
    fn test_html_to_text_drops_hidden_content() {
        let text = html_to_text(PAGE);
        assert!(text.starts_with("Main Street Clinic"));
        assert!(text.contains("Call us & visit."));
        assert!(!text.contains("bot@trap.example"));
        assert!(!text.contains("legacy@clinic.example"));
        assert!(!text.contains("color"));
    }

    #[test]
    fn test_harvests_mailto_and_tel_links() {
        let links = harvest_links(&Html::parse_document(PAGE));
        assert_eq!(links.emails, vec!["front@clinic.example"]);
        assert_eq!(links.phones, vec!["+1-555-010-2000"]);
    }

    #[test]
    fn test_entities_are_decoded_and_attributes_stay_hidden() {
        let html = r#"<p>info&#x40;clinic.example &eacute;quipe &#8212; <a title="x > y">Call</a></p>"#;
        assert_eq!(html_to_text(html), "info@clinic.example \u{e9}quipe \u{2014} Call");
    }

    #[test]
    fn test_link_targets_are_decoded() {
        let html = r#"<a href="mailto:desk&#64;clinic.example">a</a>
            <a href="MAILTO:Front%20Desk%40clinic.example?cc=x">b</a>
            <a href="tel:+1%20555%200100">c</a>
            <a href="/contact">d</a>"#;

        let links = harvest_links(&Html::parse_document(html));
        assert_eq!(links.emails, vec!["desk@clinic.example", "Front Desk@clinic.example"]);
        assert_eq!(links.phones, vec!["+1 555 0100"]);
    }

    #[test]
    fn test_reply_aliases_and_cleaning() {
        let reply = json!({
            "content": {
                "names": [],
                "people": ["Dr. Ada Lovelace", " N/A ", "dr. ada lovelace"],
                "phone": "555-0100",
                "emails": ["none", "info@clinic.example"]
            }
        });

        let details = ContactDetails::from_llm_value(&reply);

        assert_eq!(details.names, vec!["Dr. Ada Lovelace"]);
        assert_eq!(details.phones, vec!["555-0100"]);
        assert_eq!(details.emails, vec!["info@clinic.example"]);
        assert_eq!(details.raw_response, reply);
    }

    #[test]
    fn test_joined_columns() {
        let details = ContactDetails {
            names: vec!["Ada".into(), "Grace".into()],
            emails: vec!["a@b.example".into()],
            ..Default::default()
        };

        let joined = details.joined();
        assert_eq!(joined.names.as_deref(), Some("Ada; Grace"));
        assert_eq!(joined.phones, None);
        assert_eq!(joined.emails.as_deref(), Some("a@b.example"));
    }

    #[tokio::test]
    async fn test_extracts_and_merges_links() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/contact");
                then.status(200).header("content-type", "text/html").body(PAGE);
            })
            .await;
        let llm = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .body_contains("Main Street Clinic");
                then.status(200).json_body(json!({
                    "choices": [{"message": {"content":
                        "{\"names\": [\"Main Street Clinic\"], \"phone_numbers\": [], \"email_addresses\": [\"info@clinic.example\"]}"
                    }}]
                }));
            })
            .await;

        let input = WorkInput::url(server.url("/contact"));
        let value = extractor(&server).extract(&input).await.unwrap();
        let details: ContactDetails = serde_json::from_value(value).unwrap();

        llm.assert_async().await;
        assert_eq!(details.names, vec!["Main Street Clinic"]);
        assert_eq!(details.emails, vec!["info@clinic.example", "front@clinic.example"]);
        assert_eq!(details.phones, vec!["+1-555-010-2000"]);
    }

    #[tokio::test]
    async fn test_http_status_classification() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gone");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/busy");
                then.status(503);
            })
            .await;
        let extractor = extractor(&server);

        let err = extractor.extract_contacts(&server.url("/gone")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NonRetryable);

        let err = extractor.extract_contacts(&server.url("/busy")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Retryable);
    }

    #[tokio::test]
    async fn test_rejects_non_http_urls() {
        let server = MockServer::start_async().await;
        let err = extractor(&server)
            .extract_contacts("ftp://files.example/contacts.txt")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NonRetryable);
    }
}
