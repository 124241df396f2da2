// src/ingest/opml.rs
//! OPML import and single-feed registration for users.

use quick_xml::de::from_str;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{sources, subscriptions};
use crate::models::{NewSource, Source, SourceType};
use crate::ssrf::{UrlRejection, UrlValidator};

#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("malformed OPML: {0}")]
    Malformed(String),
    #[error(transparent)]
    InvalidUrl(#[from] UrlRejection),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Deserialize)]
struct Opml {
    body: Body,
}

#[derive(Debug, Deserialize)]
struct Body {
    #[serde(rename = "outline", default)]
    outline: Vec<Outline>,
}

#[derive(Debug, Deserialize)]
struct Outline {
    #[serde(rename = "@xmlUrl")]
    xml_url: Option<String>,
    #[serde(rename = "@htmlUrl")]
    html_url: Option<String>,
    #[serde(rename = "@text")]
    text: Option<String>,
    #[serde(rename = "@title")]
    title: Option<String>,
    #[serde(rename = "outline", default)]
    children: Vec<Outline>,
}

/// One feed entry found in an OPML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    pub xml_url: String,
    pub html_url: Option<String>,
    pub title: Option<String>,
}

fn collect(outlines: Vec<Outline>, out: &mut Vec<OpmlFeed>) {
    for o in outlines {
        if let Some(xml_url) = o.xml_url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()) {
            let title = o
                .title
                .or(o.text)
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty());
            out.push(OpmlFeed {
                xml_url,
                html_url: o.html_url.filter(|u| !u.trim().is_empty()),
                title,
            });
        }
        collect(o.children, out);
    }
}

/// Every outline carrying an `xmlUrl`, depth first, in document order.
pub fn parse_opml(xml: &str) -> Result<Vec<OpmlFeed>, OpmlError> {
    if !xml.to_ascii_lowercase().contains("<opml") {
        return Err(OpmlError::Malformed("missing <opml> root".into()));
    }
    let doc: Opml = from_str(xml).map_err(|e| OpmlError::Malformed(e.to_string()))?;
    let mut feeds = Vec::new();
    collect(doc.body.outline, &mut feeds);
    Ok(feeds)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub created: usize,
    pub subscribed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Result of registering one feed for a user.
#[derive(Debug, Clone)]
pub struct AddedFeed {
    pub source: Source,
    pub created: bool,
    /// False when the user already had an enabled subscription.
    pub newly_subscribed: bool,
}

/// Validate `url`, reuse or create the RSS source for it and subscribe the user.
pub async fn add_feed(
    pool: &SqlitePool,
    validator: &UrlValidator,
    user_id: i64,
    url: &str,
    name: Option<&str>,
    html_url: Option<&str>,
) -> Result<AddedFeed, OpmlError> {
    let parsed = validator.validate(url)?;
    let feed_url = parsed.as_str();

    let (source, created) = match sources::find_by_feed_url(pool, feed_url).await? {
        Some(existing) => (existing, false),
        None => {
            let host = parsed.host_str().unwrap_or("feed");
            let base = name.map(str::trim).filter(|n| !n.is_empty()).unwrap_or(host);
            let new = NewSource {
                name: sources::unique_name(pool, base).await?,
                source_type: SourceType::Rss,
                base_url: html_url
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}://{host}", parsed.scheme())),
                icon: None,
                config: json!({ "feedUrl": feed_url }),
                is_built_in: false,
                created_by: Some(user_id),
            };
            let src = sources::insert(pool, &new).await?;
            info!(target: "ingest", source_id = src.id, name = %src.name, "created rss source");
            (src, true)
        }
    };

    let already = subscriptions::get(pool, user_id, source.id)
        .await?
        .is_some_and(|s| s.enabled);
    if !already {
        subscriptions::subscribe(pool, user_id, source.id).await?;
    }
    Ok(AddedFeed {
        source,
        created,
        newly_subscribed: !already,
    })
}

/// Import every feed of an OPML document for `user_id`.
///
/// Only a malformed document fails the whole import; per-feed problems end
/// up in `errors`.
pub async fn import_opml(
    pool: &SqlitePool,
    validator: &UrlValidator,
    user_id: i64,
    xml: &str,
) -> Result<ImportReport, OpmlError> {
    let feeds = parse_opml(xml)?;
    let mut report = ImportReport::default();

    for feed in feeds {
        match add_feed(
            pool,
            validator,
            user_id,
            &feed.xml_url,
            feed.title.as_deref(),
            feed.html_url.as_deref(),
        )
        .await
        {
            Ok(added) => {
                if added.created {
                    report.created += 1;
                }
                if added.newly_subscribed {
                    report.subscribed += 1;
                } else {
                    report.skipped += 1;
                }
            }
            Err(OpmlError::InvalidUrl(e)) => {
                report.errors.push(format!("{}: {e}", feed.xml_url));
            }
            Err(e) => {
                warn!(target: "ingest", url = %feed.xml_url, error = %e, "opml feed import failed");
                report.errors.push(format!("{}: {e}", feed.xml_url));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_pool, users};

    const OPML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Subs</title></head>
  <body>
    <outline text="Tech">
      <outline text="Rust Blog" type="rss" xmlUrl="https://blog.rust-lang.org/feed.xml" htmlUrl="https://blog.rust-lang.org"/>
      <outline title="Nested" text="ignored">
        <outline text="Deep" xmlUrl="https://deep.example.com/rss"/>
      </outline>
    </outline>
    <outline text="Local" xmlUrl="http://192.168.1.10/feed"/>
    <outline text="Dup" xmlUrl="https://blog.rust-lang.org/feed.xml"/>
  </body>
</opml>"#;

    #[test]
    fn parses_nested_outlines() {
        let feeds = parse_opml(OPML).unwrap();
        let urls: Vec<_> = feeds.iter().map(|f| f.xml_url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://blog.rust-lang.org/feed.xml",
                "https://deep.example.com/rss",
                "http://192.168.1.10/feed",
                "https://blog.rust-lang.org/feed.xml",
            ]
        );
        assert_eq!(feeds[0].title.as_deref(), Some("Rust Blog"));
    }

    #[test]
    fn rejects_non_opml() {
        assert!(matches!(parse_opml("<html></html>"), Err(OpmlError::Malformed(_))));
        assert!(matches!(
            parse_opml("<opml><body><outline></body>"),
            Err(OpmlError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn import_creates_subscribes_and_reports() {
        let pool = test_pool().await;
        let user = users::register(&pool, "reader@example.com").await.unwrap();
        let v = UrlValidator::new();

        let report = import_opml(&pool, &v, user.id, OPML).await.unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.subscribed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("192.168.1.10"));

        let again = import_opml(&pool, &v, user.id, OPML).await.unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.subscribed, 0);
        assert_eq!(again.skipped, 3);
    }

    #[tokio::test]
    async fn add_feed_reuses_existing_source_and_suffixes_names() {
        let pool = test_pool().await;
        let a = users::register(&pool, "a@example.com").await.unwrap();
        let b = users::register(&pool, "b@example.com").await.unwrap();
        let v = UrlValidator::new();

        let first = add_feed(&pool, &v, a.id, "https://one.example.com/rss", Some("Blog"), None)
            .await
            .unwrap();
        let shared = add_feed(&pool, &v, b.id, "https://one.example.com/rss", None, None)
            .await
            .unwrap();
        assert!(first.created);
        assert!(!shared.created);
        assert_eq!(first.source.id, shared.source.id);

        let other = add_feed(&pool, &v, a.id, "https://two.example.com/rss", Some("Blog"), None)
            .await
            .unwrap();
        assert_eq!(other.source.name, "Blog (2)");

        assert!(matches!(
            add_feed(&pool, &v, a.id, "file:///etc/passwd", None, None).await,
            Err(OpmlError::InvalidUrl(_))
        ));
    }
}
