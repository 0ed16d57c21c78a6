//! Template compositor: builds the single fixed card layout as a
//! self-contained HTML document.
//!
//! The branding mark is inlined as a `data:` URI when the compositor is
//! built, so the rendered document never needs filesystem access for it.

use base64::Engine as Base64Engine;
use chrono::{Local, NaiveDate};
use std::path::Path;

use crate::resolve::Resolution;
use crate::{Result, Viewport};

/// Element id of the full-bleed background image
pub const BACKGROUND_ELEMENT_ID: &str = "background-image";
/// Element id of the news image inside the card
pub const NEWS_ELEMENT_ID: &str = "news-image";

/// Neutral fill shown when no background image is available
pub const FALLBACK_FILL: &str = "#1f2933";

/// Fixed date stamp format, independent of the host locale
pub const DATE_FORMAT: &str = "%d/%m/%Y";

const BUILTIN_BRANDING: &[u8] = include_bytes!("../assets/branding.svg");

/// A composed document and the image elements it contains
#[derive(Debug, Clone)]
pub struct Document {
    pub html: String,
    pub has_background: bool,
    pub has_news_image: bool,
}

impl Document {
    /// Ids of image elements the renderer should wait for, news image first
    pub fn image_element_ids(&self) -> Vec<&'static str> {
        let mut ids = Vec::with_capacity(2);
        if self.has_news_image {
            ids.push(NEWS_ELEMENT_ID);
        }
        if self.has_background {
            ids.push(BACKGROUND_ELEMENT_ID);
        }
        ids
    }
}

pub struct Compositor {
    branding_uri: String,
    viewport: Viewport,
}

impl Compositor {
    /// Compositor using the bundled branding mark
    pub fn new(viewport: Viewport) -> Self {
        Self {
            branding_uri: data_uri("image/svg+xml", BUILTIN_BRANDING),
            viewport,
        }
    }

    /// Compositor using a branding asset read once from disk
    pub fn with_branding_file(path: impl AsRef<Path>, viewport: Viewport) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        Ok(Self {
            branding_uri: data_uri(mime.essence_str(), &bytes),
            viewport,
        })
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Compose the card, stamping today's local date
    pub fn compose(&self, headline: &str, background: &Resolution, news: &Resolution) -> Document {
        self.compose_on(headline, background, news, Local::now().date_naive())
    }

    pub fn compose_on(
        &self,
        headline: &str,
        background: &Resolution,
        news: &Resolution,
        date: NaiveDate,
    ) -> Document {
        let width = self.viewport.width;
        let height = self.viewport.height;
        let headline = collapse_whitespace(headline);
        let date_stamp = date.format(DATE_FORMAT).to_string();

        let background_html = background
            .href()
            .map(|href| {
                format!(
                    r#"<img id="{}" class="background" src="{}" alt="">"#,
                    BACKGROUND_ELEMENT_ID,
                    escape_html(href)
                )
            })
            .unwrap_or_default();

        let card_html = news
            .href()
            .map(|href| {
                format!(
                    r#"<div class="card"><img id="{}" src="{}" alt=""></div>"#,
                    NEWS_ELEMENT_ID,
                    escape_html(href)
                )
            })
            .unwrap_or_default();

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
  html, body {{ margin: 0; padding: 0; }}
  body {{ width: {width}px; height: {height}px; overflow: hidden; position: relative;
         background: {fill}; font-family: Helvetica, Arial, sans-serif; }}
  .background {{ position: absolute; inset: 0; width: 100%; height: 100%; object-fit: cover; }}
  .card {{ position: absolute; left: 50%; top: 38%; transform: translate(-50%, -50%);
          width: 78%; height: 46%; background: #ffffff; border-radius: 18px; padding: 14px;
          box-sizing: border-box; box-shadow: 0 12px 40px rgba(0, 0, 0, 0.45); }}
  .card img {{ width: 100%; height: 100%; object-fit: cover; border-radius: 10px; display: block; }}
  .headline {{ position: absolute; left: 6%; right: 6%; bottom: 12%; padding: 22px 28px;
              background: rgba(10, 10, 10, 0.78); color: #ffffff; text-align: center;
              font-size: 44px; font-weight: 700; line-height: 1.2;
              overflow-wrap: break-word; word-break: break-word; white-space: normal; }}
  .date {{ position: absolute; top: 24px; left: 28px; padding: 6px 12px; background: rgba(0, 0, 0, 0.55);
          color: #ffffff; font-size: 22px; border-radius: 6px; }}
  .brand {{ position: absolute; right: 28px; bottom: 24px; height: 48px; }}
</style>
</head>
<body>
{background}
{card}
<div class="date">{date}</div>
<div class="headline">{headline}</div>
<img class="brand" id="brand-mark" src="{brand}" alt="">
</body>
</html>
"#,
            title = escape_html(&headline),
            width = width,
            height = height,
            fill = FALLBACK_FILL,
            background = background_html,
            card = card_html,
            date = escape_html(&date_stamp),
            headline = escape_html(&headline),
            brand = self.branding_uri,
        );

        Document {
            html,
            has_background: background.href().is_some(),
            has_news_image: news.href().is_some(),
        }
    }
}

fn data_uri(mime: &str, bytes: &[u8]) -> String {
    let b64 = Base64Engine::encode(&base64::engine::general_purpose::STANDARD, bytes);
    format!("data:{};base64,{}", mime, b64)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Escape text for use in HTML element content and quoted attributes
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
