//! Core data model: crawl items and the URL records they carry

mod item;
mod url;

pub use item::{Item, ItemKind, ItemSource, ItemStatus};
pub use url::{CrawlUrl, FetchedResponse, UrlError};
