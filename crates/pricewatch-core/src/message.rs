//! Candidate URL extraction from inbound chat messages.

use std::sync::LazyLock;

use pricewatch_models::Message;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use regex::Regex;
use scraper::Html;

/// Where a bare link in free text ends.
static URL_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\p{Han}]").expect("Invalid regex"));

/// Escaped XML envelope used by shared-link messages.
const ESCAPED_ENVELOPE: &str = "&lt;msg";

/// The URL a message points at, if any.
///
/// An explicit `url` wins. Otherwise an escaped `<msg><appmsg>` envelope is
/// read for its `url`, then scanned through its `title` and `des`; any other
/// content is scanned as free text.
pub fn candidate_url(message: &Message) -> Option<String> {
    if !message.url.is_empty() {
        return Some(unescape_html(&message.url));
    }
    if message.content.is_empty() {
        return None;
    }

    if message.content.starts_with(ESCAPED_ENVELOPE) {
        let envelope = Envelope::parse(&unescape_html(&message.content));
        if let Some(url) = envelope.url.filter(|url| !url.is_empty()) {
            return Some(unescape_html(&url));
        }
        return [envelope.title, envelope.des].into_iter().find_map(|field| {
            let text = unescape_html(&field?);
            find_url_in_text(&text).map(str::to_string)
        });
    }

    let text = unescape_html(&message.content);
    find_url_in_text(&text).map(str::to_string)
}

/// The `msg/appmsg` fields of a shared-link envelope.
#[derive(Debug, Default, PartialEq)]
struct Envelope {
    url: Option<String>,
    title: Option<String>,
    des: Option<String>,
}

impl Envelope {
    /// Read the fields as XML, CDATA sections included. A malformed tail
    /// keeps whatever was read before it.
    fn parse(xml: &str) -> Self {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut envelope = Self::default();
        let mut path: Vec<String> = Vec::new();
        loop {
            let text = match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                    if let Some(field) = envelope.field(&path, &name) {
                        field.get_or_insert_with(String::new);
                    }
                    path.push(name);
                    continue;
                }
                Ok(Event::End(_)) => {
                    path.pop();
                    continue;
                }
                Ok(Event::Text(text)) => match text.unescape() {
                    Ok(text) => text.into_owned(),
                    Err(_) => String::from_utf8_lossy(&text).into_owned(),
                },
                Ok(Event::CData(data)) => String::from_utf8_lossy(&data.into_inner()).into_owned(),
                Ok(Event::Eof) | Err(_) => break,
                Ok(_) => continue,
            };
            if let Some((name, parents)) = path.split_last()
                && let Some(field) = envelope.field(parents, name)
            {
                field.get_or_insert_with(String::new).push_str(text.trim());
            }
        }
        envelope
    }

    fn field(&mut self, parents: &[String], name: &str) -> Option<&mut Option<String>> {
        if parents != ["msg", "appmsg"] {
            return None;
        }
        match name {
            "url" => Some(&mut self.url),
            "title" => Some(&mut self.title),
            "des" => Some(&mut self.des),
            _ => None,
        }
    }
}

/// The first `http…` (or, failing that, `www…`) token of `text`.
///
/// The token ends at whitespace or at the first Han character, since links in
/// chat text are often followed directly by Chinese prose.
pub fn find_url_in_text(text: &str) -> Option<&str> {
    let start = text.find("http").or_else(|| text.find("www"))?;
    let rest = &text[start..];
    let end = URL_BOUNDARY
        .find(rest)
        .map_or(rest.len(), |boundary| boundary.start());
    Some(&rest[..end])
}

/// Decode HTML character references.
pub fn unescape_html(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    Html::parse_fragment(text).root_element().text().collect()
}
