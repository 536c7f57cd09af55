use thiserror::Error;
use url::{Position, Url};

use crate::gopher::{Item, ItemType};
use crate::transport::DEFAULT_PORT;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Invalid link for {display:?}: {reason}")]
    Link { display: String, reason: String },
    #[error("Render failed: {0}")]
    Other(String),
}

/// Turns a listing into a response body for the gateway.
pub trait ListingRenderer: Send + Sync {
    fn render(&self, items: &[Item]) -> Result<Vec<u8>, RenderError>;

    fn content_type(&self) -> &'static str {
        "text/html; charset=utf-8"
    }
}

/// Renders a listing as an HTML page whose links lead back through the
/// gateway.
#[derive(Debug, Clone)]
pub struct HtmlRenderer {
    title: String,
}

impl Default for HtmlRenderer {
    fn default() -> Self {
        HtmlRenderer {
            title: "Gopher".to_string(),
        }
    }
}

impl HtmlRenderer {
    pub fn new(title: impl Into<String>) -> Self {
        HtmlRenderer { title: title.into() }
    }

    fn link(item: &Item) -> Result<String, RenderError> {
        let invalid = |reason: String| RenderError::Link {
            display: item.display.clone(),
            reason,
        };

        let host = if item.port == DEFAULT_PORT {
            item.host.clone()
        } else {
            format!("{}:{}", item.host, item.port)
        };
        let selector = if item.selector.starts_with('/') {
            item.selector.clone()
        } else {
            format!("/{}", item.selector)
        };

        let mut url = Url::parse("http://gateway.invalid/").map_err(|e| invalid(e.to_string()))?;
        url.set_path(&format!("/{}{}", host, selector));
        url.query_pairs_mut()
            .append_pair("type", &item.itype.to_char().to_string());
        Ok(url[Position::BeforePath..].to_string())
    }
}

impl ListingRenderer for HtmlRenderer {
    fn render(&self, items: &[Item]) -> Result<Vec<u8>, RenderError> {
        let mut page = String::new();
        page.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        page.push_str(&format!("<title>{}</title>\n", escape_html(&self.title)));
        page.push_str("</head>\n<body>\n<pre class=\"gophermap\">\n");

        for item in items {
            let display = escape_html(&item.display);
            match item.itype {
                ItemType::Info => page.push_str(&format!("<span class=\"info\">{}</span>\n", display)),
                ItemType::Error => page.push_str(&format!("<span class=\"error\">{}</span>\n", display)),
                _ if !item.is_connectable() => {
                    page.push_str(&format!("<span class=\"dead\">{}</span>\n", display))
                }
                ItemType::Telnet => page.push_str(&format!(
                    "<span class=\"telnet\">{} (telnet {}:{})</span>\n",
                    display,
                    escape_html(&item.host),
                    item.port
                )),
                itype => {
                    let class = if item.is_external { "link external" } else { "link" };
                    page.push_str(&format!(
                        "<a class=\"{}\" data-type=\"{}\" href=\"{}\">{}</a>",
                        class,
                        escape_html(itype.name()),
                        escape_html(&Self::link(item)?),
                        display
                    ));
                    if item.is_external {
                        page.push_str(&format!(" <small>({})</small>", escape_html(&item.host)));
                    }
                    page.push('\n');
                }
            }
        }

        page.push_str("</pre>\n</body>\n</html>\n");
        Ok(page.into_bytes())
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn type_indicator(itype: ItemType) -> &'static str {
    match itype {
        ItemType::Directory => "[+]",
        ItemType::File | ItemType::Uuencoded => "[T]",
        ItemType::Search => "[?]",
        ItemType::Html => "[H]",
        ItemType::Binary | ItemType::BinHex | ItemType::DosBinary => "[B]",
        ItemType::Gif | ItemType::Image => "[I]",
        ItemType::Error => "[!]",
        ItemType::Info => "   ",
        _ => "[.]",
    }
}

/// Terminal view of a listing, one line per item.
pub fn render_text(items: &[Item]) -> String {
    let mut out = String::new();
    for item in items {
        match item.itype {
            ItemType::Info => out.push_str(&format!("    {}\n", item.display)),
            ItemType::Directory => out.push_str(&format!(
                "{} {}...{}\n",
                type_indicator(item.itype),
                item.display,
                external_suffix(item)
            )),
            itype => out.push_str(&format!(
                "{} {}{}\n",
                type_indicator(itype),
                item.display,
                external_suffix(item)
            )),
        }
    }
    out
}

fn external_suffix(item: &Item) -> String {
    if item.is_external {
        format!(" ({}:{})", item.host, item.port)
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> Vec<Item> {
        let mut external = Item::new(ItemType::Directory, "Floodgap", "/", "gopher.floodgap.com", 70);
        external.is_external = true;
        vec![
            Item::info("Hello <world> & friends"),
            Item::new(ItemType::File, "Read me", "/docs/read me.txt", "localhost", 7070),
            Item::new(ItemType::Binary, "report", "files/report.bin", "localhost", 70),
            external,
            Item::error("'/x' not found"),
        ]
    }

    #[test]
    fn html_escapes_and_links_through_gateway() {
        let body = HtmlRenderer::default().render(&listing()).unwrap();
        let html = String::from_utf8(body).unwrap();

        assert!(html.contains("Hello &lt;world&gt; &amp; friends"));
        assert!(html.contains("href=\"/localhost:7070/docs/read%20me.txt?type=0\""));
        assert!(html.contains("href=\"/localhost/files/report.bin?type=9\""));
        assert!(html.contains("class=\"link external\""));
        assert!(html.contains("<small>(gopher.floodgap.com)</small>"));
        assert!(html.contains("<span class=\"error\">&#39;/x&#39; not found</span>"));
    }

    #[test]
    fn unconnectable_items_are_not_linked() {
        let items = vec![Item::new(ItemType::File, "dead", "/dead", "localhost", 0)];
        let html = String::from_utf8(HtmlRenderer::default().render(&items).unwrap()).unwrap();
        assert!(!html.contains("href="));
        assert!(html.contains("<span class=\"dead\">dead</span>"));
    }

    #[test]
    fn text_view() {
        let text = render_text(&listing());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "    Hello <world> & friends");
        assert_eq!(lines[1], "[T] Read me");
        assert_eq!(lines[2], "[B] report");
        assert_eq!(lines[3], "[+] Floodgap... (gopher.floodgap.com:70)");
        assert_eq!(lines[4], "[!] '/x' not found");
    }
}
