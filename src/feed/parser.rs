use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::util::unescape_html;

/// SEC-003: Maximum element nesting depth accepted in a feed document.
const MAX_DEPTH: usize = 64;

/// Errors that can occur while parsing a feed body.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The body is not well-formed XML.
    #[error("XML syntax error at byte {position}: {message}")]
    Syntax { position: u64, message: String },

    /// The document ended with elements still open.
    #[error("Document ended inside <{0}>")]
    Truncated(String),

    /// Well-formed XML, but not an RSS document.
    #[error("Document has no <channel> element")]
    MissingChannel,

    /// SEC-003: nesting depth exceeds the safety limit.
    #[error("Nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),
}

/// One `<item>` of a channel. `pub_date` is kept as the raw string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RssItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub pub_date: String,
}

/// A parsed RSS channel. Produced fresh on every fetch, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RssFeed {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<RssItem>,
}

impl RssFeed {
    /// Decode HTML entities in every title and description, exactly once.
    ///
    /// Links and publish dates are left as they are.
    fn unescape_text(&mut self) {
        unescape_in_place(&mut self.title);
        unescape_in_place(&mut self.description);
        for item in &mut self.items {
            unescape_in_place(&mut item.title);
            unescape_in_place(&mut item.description);
        }
    }
}

fn unescape_in_place(field: &mut String) {
    if let std::borrow::Cow::Owned(decoded) = unescape_html(field) {
        *field = decoded;
    }
}

#[derive(Clone, Copy)]
enum Field {
    Title,
    Link,
    Description,
    PubDate,
}

#[derive(Clone, Copy)]
enum Target {
    Channel(Field),
    Item(Field),
}

/// Which field the text inside `path` belongs to, if any.
///
/// Only unprefixed element names match, so `atom:link`, `dc:creator` and
/// friends are skipped.
fn target(path: &[Vec<u8>]) -> Option<Target> {
    let [.., parent, leaf] = path else {
        return None;
    };
    let field = match leaf.as_slice() {
        b"title" => Field::Title,
        b"link" => Field::Link,
        b"description" => Field::Description,
        b"pubDate" => Field::PubDate,
        _ => return None,
    };
    match (parent.as_slice(), field) {
        (b"channel", Field::PubDate) => None,
        (b"channel", field) => Some(Target::Channel(field)),
        (b"item", field) => Some(Target::Item(field)),
        _ => None,
    }
}

fn field_mut(feed: &mut RssFeed, target: Target) -> Option<&mut String> {
    match target {
        Target::Channel(Field::Title) => Some(&mut feed.title),
        Target::Channel(Field::Link) => Some(&mut feed.link),
        Target::Channel(Field::Description) => Some(&mut feed.description),
        Target::Channel(Field::PubDate) => None,
        Target::Item(field) => {
            let item = feed.items.last_mut()?;
            Some(match field {
                Field::Title => &mut item.title,
                Field::Link => &mut item.link,
                Field::Description => &mut item.description,
                Field::PubDate => &mut item.pub_date,
            })
        }
    }
}

/// Parse an RSS document and decode HTML entities in its text fields.
///
/// Missing elements default to empty strings. `<item>`s are collected in
/// document order wherever they appear, which also covers RSS 1.0 documents
/// that place items beside the channel.
///
/// # Security
///
/// SEC-002: quick-xml (0.37) never expands `<!ENTITY>` declarations, so
/// external entity (XXE) payloads surface as a syntax error instead of being
/// resolved.
pub fn parse_feed(bytes: &[u8]) -> Result<RssFeed, ParseError> {
    let mut feed = parse_document(bytes)?;
    feed.unescape_text();
    Ok(feed)
}

fn parse_document(bytes: &[u8]) -> Result<RssFeed, ParseError> {
    // Text is kept exactly as written, including whitespace around CDATA
    let mut reader = Reader::from_reader(bytes);

    let mut feed = RssFeed::default();
    let mut saw_channel = false;
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut buf = Vec::new();

    let syntax = |reader: &Reader<&[u8]>, message: String| ParseError::Syntax {
        position: reader.buffer_position() as u64,
        message,
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"channel" => saw_channel = true,
                    b"item" => feed.items.push(RssItem::default()),
                    _ => {}
                }
                path.push(name);
                if path.len() > MAX_DEPTH {
                    return Err(ParseError::MaxDepthExceeded(MAX_DEPTH));
                }
                // A repeated element replaces the earlier value
                if let Some(field) = target(&path).and_then(|t| field_mut(&mut feed, t)) {
                    field.clear();
                }
            }
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"channel" => saw_channel = true,
                b"item" => feed.items.push(RssItem::default()),
                _ => {}
            },
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(e)) => {
                if let Some(field) = target(&path).and_then(|t| field_mut(&mut feed, t)) {
                    let text = e.unescape().map_err(|err| syntax(&reader, err.to_string()))?;
                    field.push_str(&text);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(field) = target(&path).and_then(|t| field_mut(&mut feed, t)) {
                    let text = reader
                        .decoder()
                        .decode(&e)
                        .map_err(|err| syntax(&reader, err.to_string()))?;
                    field.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(syntax(&reader, err.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = path.last() {
        return Err(ParseError::Truncated(
            String::from_utf8_lossy(open).into_owned(),
        ));
    }
    if !saw_channel {
        return Err(ParseError::MissingChannel);
    }

    Ok(feed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom">
  <channel>
    <title>Lane&amp;apos;s Blog</title>
    <link>https://www.wagslane.dev/</link>
    <atom:link href="https://www.wagslane.dev/index.xml" rel="self" type="application/rss+xml"/>
    <description>Thoughts &amp;amp; notes</description>
    <item>
      <title>The &amp;ldquo;Zen&amp;rdquo; of Go</title>
      <link>https://www.wagslane.dev/posts/zen-of-go/?a=1&amp;b=2</link>
      <pubDate>Sun, 10 Dec 2023 00:00:00 +0000</pubDate>
      <description>&lt;p&gt;Simple &amp;gt; clever&lt;/p&gt;</description>
    </item>
    <item>
      <title><![CDATA[Caf&eacute; & more]]></title>
      <link>https://www.wagslane.dev/posts/cafe/</link>
      <pubDate>not a date</pubDate>
      <description><![CDATA[<b>bold</b> &amp; brave]]></description>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_sample_feed() {
        let feed = parse_feed(SAMPLE_RSS.as_bytes()).unwrap();

        assert_eq!(feed.title, "Lane's Blog");
        assert_eq!(feed.link, "https://www.wagslane.dev/");
        assert_eq!(feed.description, "Thoughts & notes");
        assert_eq!(feed.items.len(), 2);

        assert_eq!(
            feed.items[0],
            RssItem {
                title: "The \u{201C}Zen\u{201D} of Go".to_string(),
                link: "https://www.wagslane.dev/posts/zen-of-go/?a=1&b=2".to_string(),
                description: "<p>Simple > clever</p>".to_string(),
                pub_date: "Sun, 10 Dec 2023 00:00:00 +0000".to_string(),
            }
        );
        assert_eq!(feed.items[1].title, "Caf\u{e9} & more");
        assert_eq!(feed.items[1].description, "<b>bold</b> & brave");
        assert_eq!(feed.items[1].pub_date, "not a date");
    }

    #[test]
    fn test_unescape_happens_once() {
        let xml = r#"<rss><channel><title>t</title>
            <item><title>A &amp;amp;amp; B</title></item>
        </channel></rss>"#;
        let feed = parse_feed(xml.as_bytes()).unwrap();
        // XML decoding yields "A &amp;amp; B", one HTML pass yields "A &amp; B"
        assert_eq!(feed.items[0].title, "A &amp; B");
    }

    #[test]
    fn test_links_not_unescaped() {
        let xml = r#"<rss><channel><link>https://e.com/?q=&amp;amp;</link></channel></rss>"#;
        let feed = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(feed.link, "https://e.com/?q=&amp;");
    }

    #[test]
    fn test_text_and_cdata_keep_whitespace() {
        let xml = r#"<rss><channel>
            <title>Hello <![CDATA[World]]></title>
            <item><title> padded </title><description>a <![CDATA[<b>b</b>]]> c</description></item>
        </channel></rss>"#;
        let feed = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(feed.title, "Hello World");
        assert_eq!(feed.items[0].title, " padded ");
        assert_eq!(feed.items[0].description, "a <b>b</b> c");
    }

    #[test]
    fn test_missing_fields_default_empty() {
        let xml = r#"<rss><channel><item><title>Only title</title></item><item/></channel></rss>"#;
        let feed = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(feed.title, "");
        assert_eq!(feed.items.len(), 2);
        assert_eq!(feed.items[0].link, "");
        assert_eq!(feed.items[1], RssItem::default());
    }

    #[test]
    fn test_empty_channel() {
        let xml = r#"<?xml version="1.0"?><rss version="2.0"><channel></channel></rss>"#;
        let feed = parse_feed(xml.as_bytes()).unwrap();
        assert!(feed.items.is_empty());
    }

    #[test]
    fn test_nested_titles_ignored() {
        let xml = r#"<rss><channel>
            <title>Real</title>
            <image><title>Logo</title><link>https://e.com/logo.png</link></image>
            <item><title>Item</title><source url="x"><title>Nope</title></source></item>
        </channel></rss>"#;
        let feed = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(feed.title, "Real");
        assert_eq!(feed.link, "");
        assert_eq!(feed.items[0].title, "Item");
    }

    #[test]
    fn test_malformed_xml_rejected() {
        assert!(matches!(
            parse_feed(b"<rss><channel></item></channel></rss>"),
            Err(ParseError::Syntax { .. })
        ));
        assert!(matches!(
            parse_feed(b"<rss><channel><title>cut off"),
            Err(ParseError::Truncated(_) | ParseError::Syntax { .. })
        ));
    }

    #[test]
    fn test_non_rss_rejected() {
        assert!(matches!(
            parse_feed(b"<html><body>hello</body></html>"),
            Err(ParseError::MissingChannel)
        ));
        assert!(matches!(
            parse_feed(b"just some text"),
            Err(ParseError::MissingChannel)
        ));
    }

    #[test]
    fn test_custom_entities_not_expanded() {
        let xml = r#"<?xml version="1.0"?>
<!DOCTYPE rss [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<rss><channel><title>&xxe;</title></channel></rss>"#;
        assert!(matches!(
            parse_feed(xml.as_bytes()),
            Err(ParseError::Syntax { .. })
        ));
    }

    #[test]
    fn test_depth_limit() {
        let mut xml = String::from("<rss><channel>");
        for _ in 0..MAX_DEPTH {
            xml.push_str("<x>");
        }
        assert!(matches!(
            parse_feed(xml.as_bytes()),
            Err(ParseError::MaxDepthExceeded(_))
        ));
    }
}
