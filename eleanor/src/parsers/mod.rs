//! Parser capability framework: a polymorphic `Parser` trait, a registry
//! that picks a parser by file-extension hint then by content sniffing,
//! and a lazy streaming `parse()` contract so large inputs never require
//! more than O(K) memory for K consumed events.

pub mod apache_nginx_iis;
pub mod browser_sqlite;
pub mod cef;
pub mod crowdstrike_fdr;
pub mod memory;
pub mod osquery;
pub mod suricata;
pub mod zeek;

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::core::{NormalizedEvent, RawEvent};
use crate::err::Result;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<NormalizedEvent>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserCategory {
    Cef,
    CrowdstrikeFdr,
    Suricata,
    Zeek,
    WebServer,
    Osquery,
    Memory,
    BrowserHistory,
}

impl ParserCategory {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cef => "cef",
            Self::CrowdstrikeFdr => "crowdstrike_fdr",
            Self::Suricata => "suricata",
            Self::Zeek => "zeek",
            Self::WebServer => "web_server",
            Self::Osquery => "osquery",
            Self::Memory => "memory",
            Self::BrowserHistory => "browser_history",
        }
    }
}

/// A format-specific event parser. Implementations must yield events
/// lazily: `parse` returns a `Stream` rather than a materialized `Vec`, so
/// a parser consuming K events out of an arbitrarily large source uses
/// O(K) memory, not O(N).
#[async_trait]
pub trait Parser: Send + Sync {
    fn category(&self) -> ParserCategory;

    /// Cheap sniff used by the registry when no extension hint is
    /// available or the extension is ambiguous. Should look at only the
    /// first few hundred bytes.
    fn sniff(&self, sample: &[u8]) -> bool;

    /// File extensions this parser is normally associated with, without
    /// the leading dot (`"log"`, `"json"`, `"db"` ...).
    fn extensions(&self) -> &'static [&'static str];

    /// Parses a raw source into a lazy stream of normalized events.
    /// Record-level failures (one bad line) are yielded as `Err` items
    /// inline rather than aborting the stream; format-level failures
    /// (the whole source isn't this format) should fail fast on the
    /// first item.
    fn parse(&self, raw: RawEvent) -> EventStream;
}

pub struct ParserRegistry {
    parsers: Vec<Box<dyn Parser>>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self { parsers: Vec::new() }
    }

    /// Registers the full, fixed set of built-in parsers. Call once at
    /// start-up from the composition root.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(cef::CefParser::default()));
        registry.register(Box::new(crowdstrike_fdr::CrowdstrikeFdrParser::default()));
        registry.register(Box::new(suricata::SuricataParser::default()));
        registry.register(Box::new(zeek::ZeekParser::default()));
        registry.register(Box::new(apache_nginx_iis::WebServerParser::default()));
        registry.register(Box::new(osquery::OsqueryParser::default()));
        registry.register(Box::new(memory::MemoryParser::default()));
        registry.register(Box::new(browser_sqlite::BrowserHistoryParser::default()));
        registry
    }

    pub fn register(&mut self, parser: Box<dyn Parser>) {
        self.parsers.push(parser);
    }

    /// Selects a parser: extension hint first, then content sniffing over
    /// the registered set in registration order.
    pub fn select(&self, extension_hint: Option<&str>, sample: &[u8]) -> Option<&dyn Parser> {
        if let Some(ext) = extension_hint {
            let ext = ext.trim_start_matches('.');
            if let Some(p) = self.parsers.iter().find(|p| p.extensions().contains(&ext)) {
                return Some(p.as_ref());
            }
        }
        self.parsers.iter().find(|p| p.sniff(sample)).map(|p| p.as_ref())
    }

    pub fn by_category(&self, category: ParserCategory) -> Option<&dyn Parser> {
        self.parsers.iter().find(|p| p.category() == category).map(|p| p.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_selects_by_extension_before_sniffing() {
        let registry = ParserRegistry::with_builtins();
        let parser = registry.select(Some("log"), b"");
        assert!(parser.is_some());
    }
}
