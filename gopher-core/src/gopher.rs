use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host name carried by error records, which point nowhere.
pub const ERROR_HOST: &str = "(error)";
/// Host name carried by informational lines.
pub const INFO_HOST: &str = "(none)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    File,
    Directory,
    CsoNameserver,
    Error,
    BinHex,
    DosBinary,
    Uuencoded,
    Search,
    Telnet,
    Binary,
    Gif,
    Image,
    Html,
    Info,
    /// A tag outside the known vocabulary, kept as sent.
    Unrecognized(char),
}

impl From<char> for ItemType {
    fn from(c: char) -> Self {
        match c {
            '0' => ItemType::File,
            '1' => ItemType::Directory,
            '2' => ItemType::CsoNameserver,
            '3' => ItemType::Error,
            '4' => ItemType::BinHex,
            '5' => ItemType::DosBinary,
            '6' => ItemType::Uuencoded,
            '7' => ItemType::Search,
            '8' => ItemType::Telnet,
            '9' => ItemType::Binary,
            'g' => ItemType::Gif,
            'I' => ItemType::Image,
            'h' => ItemType::Html,
            'i' => ItemType::Info,
            other => ItemType::Unrecognized(other),
        }
    }
}

impl ItemType {
    pub fn to_char(&self) -> char {
        match self {
            ItemType::File => '0',
            ItemType::Directory => '1',
            ItemType::CsoNameserver => '2',
            ItemType::Error => '3',
            ItemType::BinHex => '4',
            ItemType::DosBinary => '5',
            ItemType::Uuencoded => '6',
            ItemType::Search => '7',
            ItemType::Telnet => '8',
            ItemType::Binary => '9',
            ItemType::Gif => 'g',
            ItemType::Image => 'I',
            ItemType::Html => 'h',
            ItemType::Info => 'i',
            ItemType::Unrecognized(c) => *c,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ItemType::File => "File",
            ItemType::Directory => "Directory",
            ItemType::CsoNameserver => "CsoNameserver",
            ItemType::Error => "Error",
            ItemType::BinHex => "BinHex",
            ItemType::DosBinary => "DosBinary",
            ItemType::Uuencoded => "Uuencoded",
            ItemType::Search => "Search",
            ItemType::Telnet => "Telnet",
            ItemType::Binary => "Binary",
            ItemType::Gif => "Gif",
            ItemType::Image => "Image",
            ItemType::Html => "Html",
            ItemType::Info => "Info",
            ItemType::Unrecognized(_) => "Unrecognized",
        }
    }

    /// Content type of the payload a selector of this type answers with.
    pub fn mime(&self) -> &'static str {
        match self {
            ItemType::File | ItemType::Uuencoded => "text/plain; charset=utf-8",
            ItemType::Directory | ItemType::Search => "application/x-gopher-menu",
            ItemType::Binary | ItemType::BinHex | ItemType::DosBinary => {
                "application/octet-stream"
            }
            ItemType::Gif => "image/gif",
            ItemType::Image => "image/jpeg",
            ItemType::Html => "text/html; charset=utf-8",
            _ => "text/plain; charset=utf-8",
        }
    }

    /// Whether a response to this type is a menu rather than a byte stream.
    pub fn is_listing(&self) -> bool {
        matches!(self, ItemType::Directory | ItemType::Search)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub itype: ItemType,
    pub display: String,
    pub selector: String,
    pub host: String,
    pub port: u16,
    /// Set by the client when `host` is not the server the listing came from.
    #[serde(default)]
    pub is_external: bool,
}

impl Item {
    pub fn new(
        itype: ItemType,
        display: impl Into<String>,
        selector: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Item {
            itype,
            display: display.into(),
            selector: selector.into(),
            host: host.into(),
            port,
            is_external: false,
        }
    }

    /// The record a server sends back when a request cannot be served.
    pub fn error(message: impl Into<String>) -> Self {
        Item::new(ItemType::Error, message, "/", ERROR_HOST, 0)
    }

    pub fn info(text: impl Into<String>) -> Self {
        Item::new(ItemType::Info, text, "", INFO_HOST, 0)
    }

    /// Port 0 marks an item that must never be dialed.
    pub fn is_connectable(&self) -> bool {
        self.port != 0 && !matches!(self.itype, ItemType::Info | ItemType::Error)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed menu line: expected 4 tab-separated fields, got {fields}")]
    MalformedLine { fields: usize },
    #[error("invalid port: {0:?}")]
    InvalidPort(String),
}

/// True for the lines that end a listing: the lone dot and the empty line.
pub fn is_terminator(line: &str) -> bool {
    line.is_empty() || line == "."
}

pub fn parse_line(line: &str) -> Result<Item, ParseError> {
    let parts: Vec<&str> = line.splitn(4, '\t').collect();
    if parts.len() < 4 {
        return Err(ParseError::MalformedLine { fields: parts.len() });
    }

    let mut head = parts[0].chars();
    let itype = match head.next() {
        Some(c) => ItemType::from(c),
        None => return Err(ParseError::MalformedLine { fields: parts.len() }),
    };

    // Gopher+ servers append fields after the port.
    let port_field = parts[3].split('\t').next().unwrap_or("");
    let port = port_field
        .trim_end_matches('\r')
        .parse::<u16>()
        .map_err(|_| ParseError::InvalidPort(port_field.to_string()))?;

    Ok(Item {
        itype,
        display: head.as_str().to_string(),
        selector: parts[1].to_string(),
        host: parts[2].to_string(),
        port,
        is_external: false,
    })
}

/// Control characters would break the line framing; they go out as spaces.
fn field(text: &str) -> Cow<'_, str> {
    if text.chars().any(char::is_control) {
        Cow::Owned(text.chars().map(|c| if c.is_control() { ' ' } else { c }).collect())
    } else {
        Cow::Borrowed(text)
    }
}

pub fn serialize_item(item: &Item) -> String {
    format!(
        "{}{}\t{}\t{}\t{}",
        item.itype.to_char(),
        field(&item.display),
        field(&item.selector),
        field(&item.host),
        item.port
    )
}

/// Full listing body: every item on its own CRLF line, then the dot terminator.
pub fn serialize_listing(items: &[Item]) -> String {
    let mut body = String::new();
    for item in items {
        body.push_str(&serialize_item(item));
        body.push_str("\r\n");
    }
    body.push_str(".\r\n");
    body
}
