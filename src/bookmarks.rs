//! Browser-side bookmark collaborators: the bookmark tree and native
//! keyword search.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{NaiveDate, TimeDelta};
use serde::{Deserialize, Serialize};

/// A folder or a bookmark. Folders have no url.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BookmarkNode {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_added: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BookmarkNode>,
}

impl BookmarkNode {
    pub fn leaf(id: &str, title: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    pub fn folder(id: &str, title: &str, children: Vec<BookmarkNode>) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            children,
            ..Default::default()
        }
    }

    pub fn is_folder(&self) -> bool {
        self.url.is_none()
    }
}

/// Fields of a bookmark-changed event. `None` means unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BookmarkChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Every bookmark with a url, depth first. Folders are skipped.
pub fn flatten_leaves(tree: &[BookmarkNode]) -> Vec<&BookmarkNode> {
    let mut leaves = Vec::new();
    let mut stack: Vec<&BookmarkNode> = tree.iter().rev().collect();

    while let Some(node) = stack.pop() {
        if node.is_folder() {
            stack.extend(node.children.iter().rev());
        } else {
            leaves.push(node);
        }
    }

    leaves
}

/// Case-insensitive keyword match: every whitespace-separated term must
/// appear in the title or the url.
pub fn keyword_search(tree: &[BookmarkNode], query: &str) -> Vec<BookmarkNode> {
    let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
    if terms.is_empty() {
        return vec![];
    }

    flatten_leaves(tree)
        .into_iter()
        .filter(|node| {
            let title = node.title.to_lowercase();
            let url = node.url.as_deref().unwrap_or_default().to_lowercase();
            terms
                .iter()
                .all(|term| title.contains(term.as_str()) || url.contains(term.as_str()))
        })
        .cloned()
        .collect()
}

/// Read access to the browser's bookmarks.
pub trait BookmarkSource: Send + Sync {
    fn tree(&self) -> anyhow::Result<Vec<BookmarkNode>>;
    fn search(&self, query: &str) -> anyhow::Result<Vec<BookmarkNode>>;
}

/// Chrome's `Bookmarks` JSON file, read fresh on every call.
pub struct ChromeBookmarksFile {
    path: PathBuf,
}

impl ChromeBookmarksFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BookmarkSource for ChromeBookmarksFile {
    fn tree(&self) -> anyhow::Result<Vec<BookmarkNode>> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        parse_chrome_bookmarks(&raw).with_context(|| format!("failed to parse {}", self.path.display()))
    }

    fn search(&self, query: &str) -> anyhow::Result<Vec<BookmarkNode>> {
        Ok(keyword_search(&self.tree()?, query))
    }
}

#[derive(Debug, Deserialize)]
struct ChromeFile {
    roots: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChromeNode {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    date_added: Option<String>,
    #[serde(default)]
    children: Vec<ChromeNode>,
}

impl From<ChromeNode> for BookmarkNode {
    fn from(node: ChromeNode) -> Self {
        let url = if node.kind == "url" { node.url } else { None };
        BookmarkNode {
            id: node.id,
            title: node.name,
            url,
            date_added: node.date_added.as_deref().and_then(chrome_time_to_unix_ms),
            children: node.children.into_iter().map(BookmarkNode::from).collect(),
        }
    }
}

/// Parse the `roots` of a Chrome bookmarks file. Roots that are not
/// bookmark nodes (such as `sync_transaction_version`) are ignored.
pub fn parse_chrome_bookmarks(raw: &str) -> anyhow::Result<Vec<BookmarkNode>> {
    let file: ChromeFile = serde_json::from_str(raw)?;

    let mut roots = Vec::new();
    for (name, value) in file.roots {
        match serde_json::from_value::<ChromeNode>(value) {
            Ok(node) => roots.push(BookmarkNode::from(node)),
            Err(e) => log::debug!("skipping bookmarks root '{}': {}", name, e),
        }
    }
    Ok(roots)
}

/// Chrome stores timestamps as microseconds since 1601-01-01 UTC.
fn chrome_time_to_unix_ms(raw: &str) -> Option<i64> {
    let micros: i64 = raw.trim().parse().ok()?;
    if micros <= 0 {
        return None;
    }

    let epoch = NaiveDate::from_ymd_opt(1601, 1, 1)?.and_hms_opt(0, 0, 0)?;
    let time = epoch.checked_add_signed(TimeDelta::microseconds(micros))?;
    Some(time.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_BOOKMARKS: &str = r#"{
        "checksum": "abc",
        "roots": {
            "bookmark_bar": {
                "children": [
                    {
                        "date_added": "13285932710000000",
                        "id": "5",
                        "name": "Rust Programming Language",
                        "type": "url",
                        "url": "https://www.rust-lang.org/"
                    },
                    {
                        "children": [
                            {
                                "id": "7",
                                "name": "Go Programming Tutorial",
                                "type": "url",
                                "url": "https://go.dev/tour"
                            }
                        ],
                        "id": "6",
                        "name": "Go",
                        "type": "folder"
                    }
                ],
                "id": "1",
                "name": "Bookmarks bar",
                "type": "folder"
            },
            "other": {
                "children": [],
                "id": "2",
                "name": "Other bookmarks",
                "type": "folder"
            },
            "sync_transaction_version": "1"
        },
        "version": 1
    }"#;

    #[test]
    fn test_parse_chrome_bookmarks() {
        let roots = parse_chrome_bookmarks(CHROME_BOOKMARKS).unwrap();
        assert_eq!(roots.len(), 2);

        let leaves = flatten_leaves(&roots);
        let ids: Vec<&str> = leaves.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["5", "7"]);
        assert_eq!(leaves[0].url.as_deref(), Some("https://www.rust-lang.org/"));
    }

    #[test]
    fn test_chrome_time_conversion() {
        // 13285932710000000 us since 1601 = 2022-01-06T08:51:50Z
        assert_eq!(chrome_time_to_unix_ms("13285932710000000"), Some(1_641_459_110_000));
        assert_eq!(chrome_time_to_unix_ms("0"), None);
        assert_eq!(chrome_time_to_unix_ms("garbage"), None);
    }

    #[test]
    fn test_flatten_skips_folders() {
        let tree = vec![BookmarkNode::folder(
            "0",
            "root",
            vec![
                BookmarkNode::leaf("1", "a", "https://a"),
                BookmarkNode::folder("f", "folder", vec![BookmarkNode::leaf("2", "b", "https://b")]),
                BookmarkNode::folder("empty", "empty", vec![]),
                BookmarkNode::leaf("3", "c", "https://c"),
            ],
        )];

        let ids: Vec<&str> = flatten_leaves(&tree).iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_keyword_search_all_terms() {
        let tree = vec![
            BookmarkNode::leaf("1", "Rust Programming Language", "https://www.rust-lang.org"),
            BookmarkNode::leaf("2", "Go Programming Tutorial", "https://go.dev"),
        ];

        let ids = |q: &str| -> Vec<String> { keyword_search(&tree, q).into_iter().map(|n| n.id).collect() };

        assert_eq!(ids("programming"), vec!["1", "2"]);
        assert_eq!(ids("RUST programming"), vec!["1"]);
        assert_eq!(ids("go.dev"), vec!["2"]);
        assert!(ids("python").is_empty());
        assert!(ids("   ").is_empty());
    }

    #[test]
    fn test_chrome_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Bookmarks");
        std::fs::write(&path, CHROME_BOOKMARKS).unwrap();

        let source = ChromeBookmarksFile::new(path);
        assert_eq!(flatten_leaves(&source.tree().unwrap()).len(), 2);
        assert_eq!(source.search("tutorial").unwrap()[0].id, "7");
    }

    #[test]
    fn test_missing_file_is_error() {
        let source = ChromeBookmarksFile::new(PathBuf::from("/nonexistent/Bookmarks"));
        assert!(source.tree().is_err());
    }
}
