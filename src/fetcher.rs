use std::time::Duration;

use html_escape::decode_html_entities;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const USER_AGENT: &str = "gator";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(#[from] NetworkError),

    #[error("malformed feed document: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Network(NetworkError::Transport(err))
    }
}

impl FetchError {
    /// Transport failures, including cancellation and timeouts.
    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

/// An RSS 2.0 document: `<rss><channel>...</channel></rss>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedDocument {
    pub channel: Channel,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Channel {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<FeedItem>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub pub_date: String,
}

#[derive(Clone, Copy)]
enum Field {
    Title,
    Link,
    Description,
    PubDate,
}

impl Field {
    // Names are matched with their prefix, so `atom:link` is not `link`.
    fn channel(name: &[u8]) -> Option<Self> {
        match name {
            b"title" => Some(Field::Title),
            b"link" => Some(Field::Link),
            b"description" => Some(Field::Description),
            _ => None,
        }
    }

    fn item(name: &[u8]) -> Option<Self> {
        match name {
            b"pubDate" => Some(Field::PubDate),
            other => Field::channel(other),
        }
    }
}

impl Channel {
    fn slot(&mut self, field: Field) -> Option<&mut String> {
        match field {
            Field::Title => Some(&mut self.title),
            Field::Link => Some(&mut self.link),
            Field::Description => Some(&mut self.description),
            Field::PubDate => None,
        }
    }
}

impl FeedItem {
    fn slot(&mut self, field: Field) -> Option<&mut String> {
        match field {
            Field::Title => Some(&mut self.title),
            Field::Link => Some(&mut self.link),
            Field::Description => Some(&mut self.description),
            Field::PubDate => Some(&mut self.pub_date),
        }
    }
}

fn set_field(target: &mut String, text: &str) {
    let text = text.trim();
    if target.is_empty() && !text.is_empty() {
        *target = text.to_string();
    }
}

impl FeedDocument {
    /// Decode a complete document. Nothing is returned unless the whole body parses.
    ///
    /// Only the first non-empty occurrence of a field is kept. Markup nested in a
    /// field contributes its text and the tags are dropped.
    pub fn parse(body: &str) -> Result<Self, FetchError> {
        let mut reader = Reader::from_str(body);

        let mut path: Vec<Vec<u8>> = Vec::new();
        let mut channel: Option<Channel> = None;
        let mut item: Option<FeedItem> = None;
        // Field being read and the depth of its element.
        let mut field: Option<(Field, usize)> = None;
        let mut text = String::new();

        loop {
            let event = reader
                .read_event()
                .map_err(|e| FetchError::Decode(e.to_string()))?;

            match event {
                Event::Start(e) => {
                    path.push(e.name().as_ref().to_vec());
                    if field.is_some() {
                        continue;
                    }

                    let depth = path.len();
                    let name = e.name();
                    let name = name.as_ref();
                    match depth {
                        2 if name == b"channel" && channel.is_none() => {
                            channel = Some(Channel::default());
                        }
                        3 if channel.is_some() && path[1] == b"channel" => {
                            if name == b"item" {
                                item = Some(FeedItem::default());
                            } else if let Some(f) = Field::channel(name) {
                                field = Some((f, depth));
                                text.clear();
                            }
                        }
                        4 if item.is_some() => {
                            if let Some(f) = Field::item(name) {
                                field = Some((f, depth));
                                text.clear();
                            }
                        }
                        _ => {}
                    }
                }
                Event::End(_) => {
                    let depth = path.len();
                    match field {
                        Some((f, at)) if at == depth => {
                            let target = match item.as_mut() {
                                Some(item) => item.slot(f),
                                None => channel.as_mut().and_then(|c| c.slot(f)),
                            };
                            if let Some(target) = target {
                                set_field(target, &text);
                            }
                            field = None;
                        }
                        Some(_) => {}
                        None if depth == 3 => {
                            if let (Some(done), Some(channel)) = (item.take(), channel.as_mut()) {
                                channel.items.push(done);
                            }
                        }
                        None => {}
                    }
                    path.pop();
                }
                Event::Text(e) if field.is_some() => {
                    text.push_str(&decode_html_entities(&String::from_utf8_lossy(&e)));
                }
                Event::CData(e) if field.is_some() => {
                    text.push_str(&String::from_utf8_lossy(&e));
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !path.is_empty() {
            return Err(FetchError::Decode("unexpected end of document".to_string()));
        }
        let channel = channel
            .ok_or_else(|| FetchError::Decode("missing <channel> element".to_string()))?;

        let mut doc = FeedDocument { channel };
        doc.unescape_html();
        Ok(doc)
    }

    // Feed text is routinely HTML-escaped on top of the XML escaping.
    fn unescape_html(&mut self) {
        let channel = &mut self.channel;
        channel.title = decode_html_entities(&channel.title).into_owned();
        channel.description = decode_html_entities(&channel.description).into_owned();

        for item in &mut channel.items {
            item.title = decode_html_entities(&item.title).into_owned();
            item.description = decode_html_entities(&item.description).into_owned();
        }
    }
}

#[derive(Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }

    /// Retrieve and decode one feed. No retries; a cancelled token aborts the request.
    pub async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<FeedDocument, FetchError> {
        let request = async {
            let response = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await?
                .error_for_status()?;
            let body = response.text().await?;
            Ok::<_, FetchError>(body)
        };

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetworkError::Cancelled.into()),
            body = request => body?,
        };

        debug!("Fetched {} bytes from {}", body.len(), url);
        FeedDocument::parse(&body)
    }
}
