use std::ops::Range;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use url::Url;

static AUTHOR_DIRECTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^#author\("([^"\n]*)","[^"\n]*","[^"\n]*"\)"#).expect("valid regex"));
static AUTHOR_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^#author\(.*\)[^\n]*\n?"#).expect("valid regex"));
static ANCHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m) \[#[0-9a-z]+\]$").expect("valid regex"));
static TOC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#contents[^\n]*\n?").expect("valid regex"));
static BRACKET_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\n]+?)\]\]").expect("valid regex"));
static BULLET_DEPTH_3_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^---").expect("valid regex"));
static BULLET_DEPTH_2_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^--").expect("valid regex"));
static BULLET_SPACING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([ \t]*)-([^ \n])").expect("valid regex"));
static LINE_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&br;?").expect("valid regex"));
static PRE_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#pre\{+").expect("valid regex"));
static PRE_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\}+[ \t]*$").expect("valid regex"));
static LSX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#lsx(\([^)\n]*\))?").expect("valid regex"));
static HEADING_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\*{1,3})([^\n]*)$").expect("valid regex"));
static HEADING_SPACING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(#+)([^ #\n])").expect("valid regex"));
static NESTED_BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?: {4})+- ").expect("valid regex"));

const FENCE: &str = "```";
pub const BREAK_TAG: &str = "<br>";
/// Stands in for [`BREAK_TAG`] until escaping has run, so a literal `<br>`
/// typed in the source is still escaped. U+FDD0 is a noncharacter.
const BREAK_SENTINEL: char = '\u{FDD0}';

/// Every pipeline stage has this shape so stages can be listed, reordered in
/// tests and run one at a time.
pub type Rewrite = fn(&str) -> String;

/// How the legacy `&br` token is rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineBreak {
    /// Two trailing spaces (Markdown soft break).
    #[default]
    Spaces,
    /// An explicit `<br>` tag, kept intact by the escaping stage.
    Tag,
}

impl LineBreak {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spaces => "spaces",
            Self::Tag => "tag",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertOptions {
    pub line_break: LineBreak,
}

/// Legacy wiki syntax to Markdown, as a fixed sequence of text rewrites.
/// Order matters: `#` is reused by several directives, so headings are
/// rewritten only after every `#`-prefixed directive has been consumed.
#[derive(Debug, Clone)]
pub struct MarkupConverter {
    stages: Vec<(&'static str, Rewrite)>,
}

impl Default for MarkupConverter {
    fn default() -> Self {
        Self::new(ConvertOptions::default())
    }
}

impl MarkupConverter {
    pub fn new(options: ConvertOptions) -> Self {
        let (line_break, escape): (Rewrite, Rewrite) = match options.line_break {
            LineBreak::Spaces => (convert_line_breaks_to_spaces, escape_html),
            LineBreak::Tag => (convert_line_breaks_to_tags, escape_html_keeping_breaks),
        };
        let stages: Vec<(&'static str, Rewrite)> = vec![
            ("normalize_newlines", normalize_newlines),
            ("delete_author", delete_author),
            ("delete_anchors", delete_anchors),
            ("delete_toc", delete_toc),
            ("convert_links", convert_links),
            ("convert_bullets", convert_bullets),
            ("convert_line_breaks", line_break),
            ("convert_pre", convert_pre),
            ("convert_strike", convert_strike),
            ("convert_emphasis", convert_emphasis),
            ("convert_lsx", convert_lsx),
            ("convert_headings", convert_headings),
            ("fence_indented_blocks", fence_indented_blocks),
            ("escape_html", escape),
        ];
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(name, _)| *name).collect()
    }

    pub fn convert(&self, source: &str) -> String {
        let mut text = source.to_string();
        for (_, stage) in &self.stages {
            text = stage(&text);
        }
        text
    }
}

/// Timestamp recorded by the first `#author("<date>","<id>","<name>")`
/// directive, or `None` when the directive is missing or its date is empty.
pub fn extract_authored_date(source: &str) -> Option<String> {
    let captures = AUTHOR_DIRECTIVE_RE.captures(source)?;
    let date = captures.get(1)?.as_str().trim();
    if date.is_empty() {
        return None;
    }
    Some(date.to_string())
}

pub fn normalize_newlines(src: &str) -> String {
    src.replace("\r\n", "\n").replace('\r', "\n")
}

pub fn delete_author(src: &str) -> String {
    AUTHOR_LINE_RE.replace_all(src, "").into_owned()
}

pub fn delete_anchors(src: &str) -> String {
    ANCHOR_RE.replace_all(src, "").into_owned()
}

pub fn delete_toc(src: &str) -> String {
    TOC_RE.replace_all(src, "").into_owned()
}

/// Rewrites bracketed external links to Markdown links. Internal page links
/// and inter-wiki shorthands stay bracketed, with a `>` alias turned into `:`.
pub fn convert_links(src: &str) -> String {
    let mut edits = Vec::new();
    for captures in BRACKET_LINK_RE.captures_iter(src) {
        let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let inner = inner.as_str();
        if let Some(markdown) = external_link_markdown(inner) {
            edits.push(Edit::replace(whole.range(), markdown));
        } else if let Some((name, target)) = inner.split_once('>') {
            edits.push(Edit::replace(whole.range(), format!("[[{name}:{target}]]")));
        }
    }
    apply_edits(src, edits)
}

fn external_link_markdown(inner: &str) -> Option<String> {
    let (name, url) = match inner.split_once('>') {
        Some(aliased) => aliased,
        None => inner.split_once(':')?,
    };
    let has_scheme = network_target(url)?;
    if has_scheme {
        Some(format!("[{name}]({url})"))
    } else {
        let literal = format!("{name}:{url}");
        Some(format!("[{literal}]({literal})"))
    }
}

/// `Some(has_scheme)` when `url` names a network host (`scheme://host/...`
/// or `//host/...`), `None` otherwise.
fn network_target(url: &str) -> Option<bool> {
    let (has_scheme, absolute) = if url.starts_with("//") {
        (false, format!("http:{url}"))
    } else {
        let (scheme, rest) = url.split_once(':')?;
        if !is_scheme(scheme) || !rest.starts_with("//") {
            return None;
        }
        (true, url.to_string())
    };
    let parsed = Url::parse(&absolute).ok()?;
    parsed.host_str().filter(|host| !host.is_empty())?;
    Some(has_scheme)
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic())
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
}

pub fn convert_bullets(src: &str) -> String {
    let depth3 = BULLET_DEPTH_3_RE.replace_all(src, "        -");
    let depth2 = BULLET_DEPTH_2_RE.replace_all(&depth3, "    -");
    BULLET_SPACING_RE
        .replace_all(&depth2, "${1}- ${2}")
        .into_owned()
}

pub fn convert_line_breaks_to_spaces(src: &str) -> String {
    LINE_BREAK_RE.replace_all(src, "  ").into_owned()
}

/// Leaves a placeholder that [`escape_html_keeping_breaks`] turns into `<br>`.
pub fn convert_line_breaks_to_tags(src: &str) -> String {
    let mut sentinel = [0u8; 4];
    let sentinel: &str = BREAK_SENTINEL.encode_utf8(&mut sentinel);
    LINE_BREAK_RE.replace_all(src, sentinel).into_owned()
}

pub fn convert_pre(src: &str) -> String {
    let opened = PRE_OPEN_RE.replace_all(src, FENCE);
    PRE_CLOSE_RE.replace_all(&opened, FENCE).into_owned()
}

pub fn convert_strike(src: &str) -> String {
    src.replace("%%", "~~")
}

/// `'''` (italic) before `''` (bold), otherwise the longer marker would be
/// half-consumed by the shorter one. Lines opening with emphasis use `_`
/// markers so that a leading `*` always means a heading.
pub fn convert_emphasis(src: &str) -> String {
    src.split_inclusive('\n')
        .map(|line| {
            let (italic, bold) = if line.starts_with("''") {
                ("_", "__")
            } else {
                ("*", "**")
            };
            line.replace("'''", italic).replace("''", bold)
        })
        .collect()
}

pub fn convert_lsx(src: &str) -> String {
    LSX_RE
        .replace_all(src, |captures: &Captures| {
            let arguments = captures.get(1).map_or("()", |m| m.as_str());
            format!("$lsx{arguments}")
        })
        .into_owned()
}

/// Fenced lines are left verbatim.
pub fn convert_headings(src: &str) -> String {
    let mut output = String::with_capacity(src.len() + 16);
    let mut in_fence = false;
    for line in src.split_inclusive('\n') {
        if line.starts_with(FENCE) {
            in_fence = !in_fence;
            output.push_str(line);
        } else if in_fence {
            output.push_str(line);
        } else {
            output.push_str(&heading_line(line));
        }
    }
    output
}

fn heading_line(line: &str) -> String {
    let marked = HEADING_MARKER_RE.replace(line, |captures: &Captures| {
        format!("{}{}", "#".repeat(captures[1].len()), &captures[2])
    });
    HEADING_SPACING_RE.replace(&marked, "${1} ${2}").into_owned()
}

/// Fences every maximal run of lines starting with a space, dropping one
/// leading space per line. Lines inside existing fences are left alone.
pub fn fence_indented_blocks(src: &str) -> String {
    let mut edits = Vec::new();
    let mut in_fence = false;
    let mut run: Option<Range<usize>> = None;
    let mut offset = 0usize;

    for line in src.split_inclusive('\n') {
        let content = line.trim_end_matches('\n');
        if !in_fence && is_indented_code(content, run.is_some()) {
            let span = run.get_or_insert(offset..offset);
            span.end = offset + line.len();
            edits.push(Edit::replace(offset..offset + 1, String::new()));
        } else {
            if let Some(span) = run.take() {
                push_fences(src, span, &mut edits);
            }
            if content.starts_with(FENCE) {
                in_fence = !in_fence;
            }
        }
        offset += line.len();
    }
    if let Some(span) = run.take() {
        push_fences(src, span, &mut edits);
    }

    apply_edits(src, edits)
}

fn is_indented_code(line: &str, run_open: bool) -> bool {
    let Some(rest) = line.strip_prefix(' ') else {
        return false;
    };
    if NESTED_BULLET_RE.is_match(line) {
        return false;
    }
    if rest.trim().is_empty() {
        return run_open;
    }
    true
}

fn push_fences(src: &str, span: Range<usize>, edits: &mut Vec<Edit>) {
    edits.push(Edit::replace(span.start..span.start, format!("{FENCE}\n")));
    let closing = if src[..span.end].ends_with('\n') {
        format!("{FENCE}\n")
    } else {
        format!("\n{FENCE}")
    };
    edits.push(Edit::replace(span.end..span.end, closing));
}

pub fn escape_html(src: &str) -> String {
    let mut output = String::with_capacity(src.len());
    for ch in src.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&#x27;"),
            _ => output.push(ch),
        }
    }
    output
}

pub fn escape_html_keeping_breaks(src: &str) -> String {
    escape_html(src).replace(BREAK_SENTINEL, BREAK_TAG)
}

/// A pending replacement of `range` in the original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Edit {
    range: Range<usize>,
    replacement: String,
}

impl Edit {
    pub(crate) fn replace(range: Range<usize>, replacement: String) -> Self {
        Self { range, replacement }
    }
}

/// Applies non-overlapping edits collected against `src`. Edits run from the
/// highest offset down so earlier offsets stay valid; at equal starts the
/// wider edit runs first, which puts insertions in front of removals.
pub(crate) fn apply_edits(src: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by(|left, right| {
        right
            .range
            .start
            .cmp(&left.range.start)
            .then(right.range.end.cmp(&left.range.end))
    });
    let mut output = src.to_string();
    for edit in edits {
        output.replace_range(edit.range, &edit.replacement);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(source: &str) -> String {
        MarkupConverter::default().convert(source)
    }

    #[test]
    fn converts_mixed_document_in_pipeline_order() {
        let source = "#author(\"2018-11-08T16:04:27+09:00\",\"\",\"\")\nhoge [#fuga]\n***hoge\n*piyo\n-hoge\n&br\n#pre{\nfuga\n}\n%%x%%\n#lsx";
        let converted = convert(source);
        assert_eq!(
            converted,
            "hoge\n### hoge\n# piyo\n- hoge\n  \n```\nfuga\n```\n~~x~~\n$lsx()"
        );
        assert!(!converted.contains("#author"));
    }

    #[test]
    fn converts_nested_bullets_and_headings() {
        let source = "**fuga\n-hoge\n--fuga\n---piyo\n";
        assert_eq!(
            convert(source),
            "## fuga\n- hoge\n    - fuga\n        - piyo\n"
        );
    }

    #[test]
    fn pre_block_is_fenced_before_headings_run() {
        let source = "#pre{{\n*not a heading yet\n}}\n";
        let fenced = convert_pre(source);
        assert_eq!(fenced, "```\n*not a heading yet\n```\n");
        let names = MarkupConverter::default().stage_names();
        let pre = names.iter().position(|name| *name == "convert_pre");
        let headings = names.iter().position(|name| *name == "convert_headings");
        assert!(pre < headings);
    }

    #[test]
    fn pre_block_content_is_not_rewritten_as_heading() {
        assert_eq!(convert("#pre{\n*x\n-y\n}\n"), "```\n*x\n- y\n```\n");
        assert_eq!(
            convert("*a\n#pre{{\n**b\n}}\n*c\n"),
            "# a\n```\n**b\n```\n# c\n"
        );
    }

    #[test]
    fn pre_block_keeps_indented_content_single_fenced() {
        let source = "#pre{\n    hoge\n}\n";
        assert_eq!(convert(source), "```\n    hoge\n```\n");
    }

    #[test]
    fn extract_authored_date_reads_directive() {
        assert_eq!(
            extract_authored_date("#author(\"2022-06-28T08:46:56+00:00\",\"default:ht\",\"ht\")"),
            Some("2022-06-28T08:46:56+00:00".to_string())
        );
        assert_eq!(
            extract_authored_date("#author(\"2018-11-08T16:04:27+09:00\",\"\",\"\")\nbody"),
            Some("2018-11-08T16:04:27+09:00".to_string())
        );
        assert_eq!(
            extract_authored_date("#author(\"\",\"default:ht\",\"ht\")"),
            None
        );
        assert_eq!(extract_authored_date("no directive"), None);
    }

    #[test]
    fn author_line_is_removed_even_without_date() {
        assert_eq!(delete_author("#author(\"\",\"a\",\"b\")\nbody\n"), "body\n");
    }

    #[test]
    fn links_are_classified() {
        assert_eq!(convert_links("[[Home]]"), "[[Home]]");
        assert_eq!(convert_links("[[wiki:SomePage]]"), "[[wiki:SomePage]]");
        assert_eq!(convert_links("[[Alias>Page]]"), "[[Alias:Page]]");
        assert_eq!(
            convert_links("[[Example>http://example.com/]]"),
            "[Example](http://example.com/)"
        );
        assert_eq!(
            convert_links("[[Example:http://example.com/]]"),
            "[Example](http://example.com/)"
        );
        assert_eq!(
            convert_links("[[http://example.com/]]"),
            "[http://example.com/](http://example.com/)"
        );
    }

    #[test]
    fn alias_links_keep_no_raw_angle_bracket() {
        assert_eq!(convert("[[Alias>Page]]\n"), "[[Alias:Page]]\n");
        assert_eq!(
            convert("see [[Top>FrontPage]] and [[Doc>https://d.example/]]\n"),
            "see [[Top:FrontPage]] and [Doc](https://d.example/)\n"
        );
    }

    #[test]
    fn multiple_links_on_one_line_keep_offsets() {
        let source = "see [[A>https://a.example/x]] and [[Home]] then [[B:http://b.example/]].";
        assert_eq!(
            convert_links(source),
            "see [A](https://a.example/x) and [[Home]] then [B](http://b.example/)."
        );
    }

    #[test]
    fn scheme_without_authority_is_not_external() {
        assert_eq!(convert_links("[[mail:mailto:a@b.c]]"), "[[mail:mailto:a@b.c]]");
        assert_eq!(convert_links("[[x:http:foo]]"), "[[x:http:foo]]");
    }

    #[test]
    fn bullets_get_space_after_dash() {
        assert_eq!(convert_bullets("-a\n--b\n- c\n"), "- a\n    - b\n- c\n");
    }

    #[test]
    fn line_break_variants() {
        assert_eq!(convert_line_breaks_to_spaces("a&br;b&br"), "a  b  ");
        let converter = MarkupConverter::new(ConvertOptions {
            line_break: LineBreak::Tag,
        });
        assert_eq!(converter.convert("a&br\nb & c"), "a<br>\nb &amp; c");
    }

    #[test]
    fn literal_break_tags_in_source_are_escaped() {
        let converter = MarkupConverter::new(ConvertOptions {
            line_break: LineBreak::Tag,
        });
        assert_eq!(converter.convert("a<br>b&br\n"), "a&lt;br&gt;b<br>\n");
        assert_eq!(convert("a<br>b&br;c"), "a&lt;br&gt;b  c");
    }

    #[test]
    fn emphasis_markers_map_longest_first() {
        assert_eq!(convert_emphasis("x '''it''' and ''bold''"), "x *it* and **bold**");
        assert_eq!(convert_emphasis("'''it''' and ''bold''\n"), "_it_ and __bold__\n");
    }

    #[test]
    fn lsx_keeps_arguments() {
        assert_eq!(convert_lsx("#lsx\n#lsx(prefix=/a)\n"), "$lsx()\n$lsx(prefix=/a)\n");
    }

    #[test]
    fn leading_emphasis_is_not_a_heading() {
        assert_eq!(
            convert("''bold'' text\n'''it''' text\n"),
            "__bold__ text\n_it_ text\n"
        );
        assert_eq!(convert_headings("***x\n#y\n"), "### x\n# y\n");
    }

    #[test]
    fn headings_keep_inline_emphasis_and_stars() {
        assert_eq!(convert("**Sub ''x''\n"), "## Sub **x**\n");
        assert_eq!(convert("*Notes 5 * 3\n"), "# Notes 5 * 3\n");
        assert_eq!(convert("*Title '''it'''\n"), "# Title *it*\n");
    }

    #[test]
    fn indented_runs_are_fenced_independently() {
        let source = "intro\n code one\n code two\nbetween\n  second\nend\n";
        assert_eq!(
            fence_indented_blocks(source),
            "intro\n```\ncode one\ncode two\n```\nbetween\n```\n second\n```\nend\n"
        );
    }

    #[test]
    fn trailing_indented_run_is_closed() {
        assert_eq!(fence_indented_blocks("a\n b"), "a\n```\nb\n```");
        assert_eq!(fence_indented_blocks(" only\n"), "```\nonly\n```\n");
    }

    #[test]
    fn indentation_check_ignores_nested_bullets_and_blank_lines() {
        let source = "- a\n    - b\n  \ntext\n";
        assert_eq!(fence_indented_blocks(source), source);
    }

    #[test]
    fn conversion_is_stable_on_converted_text() {
        let source = "*Title\n**Sub\n-a\n--b\n#pre{\n x\n}\n code\n  more\nend\n";
        let once = convert(source);
        let twice = convert(&once);
        assert_eq!(once, twice);
        assert_eq!(once.matches(FENCE).count(), 4);
    }

    #[test]
    fn escaping_runs_last() {
        assert_eq!(
            convert("a < b & \"c\" 'd'"),
            "a &lt; b &amp; &quot;c&quot; &#x27;d&#x27;"
        );
        assert_eq!(convert("[[Ex>http://e.example/?a=1&b=2]]"), "[Ex](http://e.example/?a=1&amp;b=2)");
    }

    #[test]
    fn crlf_input_is_normalized() {
        assert_eq!(convert("*a [#abc]\r\n-b\r\n"), "# a\n- b\n");
    }

    #[test]
    fn toc_directive_line_is_removed() {
        assert_eq!(delete_toc("#contents\nbody\n"), "body\n");
    }

    #[test]
    fn apply_edits_handles_insert_and_remove_at_same_offset() {
        let edits = vec![
            Edit::replace(0..1, String::new()),
            Edit::replace(0..0, "X".to_string()),
            Edit::replace(3..3, "Y".to_string()),
        ];
        assert_eq!(apply_edits(" ab", edits), "XabY");
    }
}
