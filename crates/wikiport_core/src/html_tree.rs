use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use pulldown_cmark::{Options, Parser, html};
use serde::Serialize;
use tracing::{debug, warn};

use crate::bundle::{ContainerEntry, ContainerSummary, write_container};
use crate::markup::escape_html;
use crate::path_codec::basename;

const INDEX_NAME: &str = "index";

/// A page waiting to be written into the HTML tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// Final location, `/index`-suffixed when the page also acts as a folder.
    pub path: String,
    /// The path the page was inserted under.
    pub source_path: String,
    pub markup: String,
}

impl TreeNode {
    pub fn title(&self) -> &str {
        basename(&self.source_path)
    }
}

/// Flattens path-named pages into a file tree. A page whose path is also a
/// proper prefix of another page's path is stored as `<path>/index`, in
/// whichever order the two arrive.
#[derive(Debug, Default)]
pub struct HtmlTreeBuilder {
    nodes: Vec<Option<TreeNode>>,
    by_path: HashMap<String, usize>,
    directories: HashSet<String>,
}

impl HtmlTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    pub fn insert(&mut self, path: &str, markup: String) {
        let source_path = canonical_path(path);

        for ancestor in ancestors(&source_path) {
            if let Some(position) = self.by_path.remove(ancestor) {
                let folded = index_path(ancestor);
                debug!(from = ancestor, to = %folded, "folded page into directory index");
                self.place(position, folded);
            }
            self.directories.insert(ancestor.to_string());
        }

        let target = if self.directories.contains(&source_path) {
            index_path(&source_path)
        } else {
            source_path.clone()
        };

        if let Some(&position) = self.by_path.get(&target) {
            warn!(path = %target, "duplicate page path, keeping the later page");
            if let Some(node) = self.nodes[position].as_mut() {
                node.source_path = source_path;
                node.markup = markup;
            }
            return;
        }

        self.by_path.insert(target.clone(), self.nodes.len());
        self.nodes.push(Some(TreeNode {
            path: target,
            source_path,
            markup,
        }));
    }

    /// Moves the node at `position` to `path`, replacing any node that
    /// already lives there.
    fn place(&mut self, position: usize, path: String) {
        if let Some(previous) = self.by_path.insert(path.clone(), position) {
            warn!(path = %path, "folded page replaces an existing index page");
            self.nodes[previous] = None;
        }
        if let Some(node) = self.nodes[position].as_mut() {
            node.path = path;
        }
    }

    /// Nodes in insertion order, with their final paths.
    pub fn finalize(self) -> Vec<TreeNode> {
        self.nodes.into_iter().flatten().collect()
    }
}

fn canonical_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}

fn index_path(path: &str) -> String {
    format!("{path}/{INDEX_NAME}")
}

/// Every proper `/`-prefix of `path`, shortest first: `/a/b/c` gives `/a`, `/a/b`.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/')
        .map(|(index, _)| index)
        .filter(|&index| index > 0)
        .map(move |index| &path[..index])
}

pub trait DocumentRenderer {
    /// File suffix, without the dot.
    fn extension(&self) -> &'static str;

    fn render(&self, title: &str, markdown: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlRenderer;

impl DocumentRenderer for HtmlRenderer {
    fn extension(&self) -> &'static str {
        "html"
    }

    fn render(&self, title: &str, markdown: &str) -> String {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TABLES);
        let parser = Parser::new_ext(markdown, options);
        let mut body = String::with_capacity(markdown.len() * 3 / 2);
        html::push_html(&mut body, parser);

        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n{body}</body>\n</html>\n",
            escape_html(title)
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

impl DocumentRenderer for MarkdownRenderer {
    fn extension(&self) -> &'static str {
        "md"
    }

    fn render(&self, _title: &str, markdown: &str) -> String {
        markdown.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    #[default]
    Html,
    Markdown,
}

impl DocumentFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Markdown => "markdown",
        }
    }

    pub fn renderer(self) -> Box<dyn DocumentRenderer> {
        match self {
            Self::Html => Box::new(HtmlRenderer),
            Self::Markdown => Box::new(MarkdownRenderer),
        }
    }
}

pub fn document_entries(nodes: &[TreeNode], renderer: &dyn DocumentRenderer) -> Vec<ContainerEntry> {
    nodes
        .iter()
        .map(|node| {
            let name = format!(
                "{}.{}",
                node.path.trim_start_matches('/'),
                renderer.extension()
            );
            ContainerEntry::new(name, renderer.render(node.title(), &node.markup).into_bytes())
        })
        .collect()
}

pub fn write_html_bundle(
    dest: &Path,
    nodes: &[TreeNode],
    renderer: &dyn DocumentRenderer,
) -> Result<ContainerSummary> {
    write_container(dest, &document_entries(nodes, renderer))
}
