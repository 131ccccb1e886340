//! Crawl items: the unit of work moving through the pipeline
//!
//! An item is a small tree rooted at a URL. Assets discovered on the page
//! become children of the root; a redirect becomes a dedicated redirection
//! node (possibly chained); outlinks become brand-new root items that the
//! finisher hands back to the work source. Only root items are registered
//! in the reactor state table, children ride their root's traversal.

use uuid::Uuid;

use super::url::CrawlUrl;

/// Position of an item within one pass through the pipeline.
///
/// Transitions are monotonic within a pass; an item only "goes back" by
/// re-entering the reactor as feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Fresh,
    PreProcessed,
    Captured,
    Archived,
    GotChildren,
    GotRedirected,
    PostProcessed,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::PreProcessed => "preprocessed",
            Self::Captured => "captured",
            Self::Archived => "archived",
            Self::GotChildren => "got_children",
            Self::GotRedirected => "got_redirected",
            Self::PostProcessed => "postprocessed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states that skip further stage work
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Where an item entered the reactor from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSource {
    Insert,
    Queue,
    Hq,
    Feedback,
}

/// Whether an item is a page in its own right or a page dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Seed,
    Asset,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Asset => "asset",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "seed" => Some(Self::Seed),
            "asset" => Some(Self::Asset),
            _ => None,
        }
    }
}

/// One unit of crawl work
#[derive(Debug, Clone)]
pub struct Item {
    id: Uuid,
    url: CrawlUrl,
    parent_url: Option<String>,
    kind: ItemKind,
    status: ItemStatus,
    source: ItemSource,
    children: Vec<Item>,
    redirection: Option<Box<Item>>,
    outlinks: Vec<Item>,
    bypass_seencheck: bool,
    content_hash: String,
    locally_crawled: u64,
    /// Identifier assigned by HQ when the item came from a feed
    remote_id: Option<String>,
}

impl Item {
    pub fn new(id: Uuid, url: CrawlUrl, parent_url: Option<String>, kind: ItemKind) -> Self {
        Self {
            id,
            url,
            parent_url,
            kind,
            status: ItemStatus::Fresh,
            source: ItemSource::Insert,
            children: Vec::new(),
            redirection: None,
            outlinks: Vec::new(),
            bypass_seencheck: false,
            content_hash: String::new(),
            locally_crawled: 0,
            remote_id: None,
        }
    }

    /// A fresh root item for a raw seed URL
    pub fn seed(raw: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4(), CrawlUrl::new(raw), None, ItemKind::Seed)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// First segment of the UUID, for log lines
    pub fn short_id(&self) -> String {
        self.id.to_string().chars().take(8).collect()
    }

    pub fn url(&self) -> &CrawlUrl {
        &self.url
    }

    pub fn url_mut(&mut self) -> &mut CrawlUrl {
        &mut self.url
    }

    pub fn parent_url(&self) -> Option<&str> {
        self.parent_url.as_deref()
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn is_seed(&self) -> bool {
        self.parent_url.is_none() && self.kind == ItemKind::Seed
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ItemStatus) {
        self.status = status;
    }

    pub fn source(&self) -> ItemSource {
        self.source
    }

    pub fn set_source(&mut self, source: ItemSource) {
        self.source = source;
    }

    pub fn bypass_seencheck(&self) -> bool {
        self.bypass_seencheck
    }

    pub fn set_bypass_seencheck(&mut self, bypass: bool) {
        self.bypass_seencheck = bypass;
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn set_content_hash(&mut self, hash: impl Into<String>) {
        self.content_hash = hash.into();
    }

    pub fn locally_crawled(&self) -> u64 {
        self.locally_crawled
    }

    pub fn set_locally_crawled(&mut self, n: u64) {
        self.locally_crawled = n;
    }

    pub fn incr_locally_crawled(&mut self) {
        self.locally_crawled += 1;
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn set_remote_id(&mut self, id: impl Into<String>) {
        self.remote_id = Some(id.into());
    }

    pub fn children(&self) -> &[Item] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<Item> {
        &mut self.children
    }

    pub fn add_child(&mut self, child: Item) {
        self.children.push(child);
    }

    pub fn redirection(&self) -> Option<&Item> {
        self.redirection.as_deref()
    }

    pub fn set_redirection(&mut self, item: Item) {
        self.redirection = Some(Box::new(item));
    }

    /// Walk to the deepest node of the redirection chain, if any
    pub fn deepest_redirection(&self) -> Option<&Item> {
        let mut node = self.redirection.as_deref()?;
        while let Some(next) = node.redirection.as_deref() {
            node = next;
        }
        Some(node)
    }

    pub fn deepest_redirection_mut(&mut self) -> Option<&mut Item> {
        let mut node = self.redirection.as_deref_mut()?;
        while node.redirection.is_some() {
            node = node.redirection.as_deref_mut().unwrap();
        }
        Some(node)
    }

    /// Length of the redirection chain hanging off this item
    pub fn redirection_depth(&self) -> usize {
        let mut depth = 0;
        let mut node = self.redirection.as_deref();
        while let Some(n) = node {
            depth += 1;
            node = n.redirection.as_deref();
        }
        depth
    }

    /// True while this node's own URL still awaits its HTTP capture
    pub fn needs_capture(&self) -> bool {
        self.url.response().is_none()
    }

    pub fn outlinks(&self) -> &[Item] {
        &self.outlinks
    }

    pub fn add_outlink(&mut self, item: Item) {
        self.outlinks.push(item);
    }

    pub fn take_outlinks(&mut self) -> Vec<Item> {
        std::mem::take(&mut self.outlinks)
    }

    /// Number of nodes in this item's tree (root + redirection chain + children)
    pub fn tree_size(&self) -> usize {
        1 + self.redirection_depth() + self.children.len()
    }
}
