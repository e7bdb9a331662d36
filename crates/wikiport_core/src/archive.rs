use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::Serialize;
use tar::{Archive, Entry};
use tracing::{debug, info, warn};

use crate::entities::{Page, Revision, RunClock, User};
use crate::error::ExportError;
use crate::ids::IdGenerator;
use crate::markup::{MarkupConverter, extract_authored_date};
use crate::path_codec::LegacyCodec;

pub const DEFAULT_WIKI_DIR: &str = "wiki";
pub const DEFAULT_SPECIAL_MARKER: &str = ":";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Open a dump as a tar stream, transparently un-gzipping `.tar.gz` input.
pub fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let is_gzip = reader
        .fill_buf()
        .with_context(|| format!("failed to read {}", path.display()))?
        .starts_with(&GZIP_MAGIC);
    let stream: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    Ok(Archive::new(stream))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotRegularFile,
    OutsideWikiDir,
    SpecialPage,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotRegularFile => "not a regular file",
            Self::OutsideWikiDir => "not a wiki page",
            Self::SpecialPage => "special page",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WalkReport {
    pub total_entries: usize,
    pub accepted: usize,
    pub source_bytes: u64,
    pub skipped: Vec<SkippedEntry>,
}

impl WalkReport {
    pub fn skipped_count(&self, reason: SkipReason) -> usize {
        self.skipped
            .iter()
            .filter(|entry| entry.reason == reason)
            .count()
    }

    fn skip(&mut self, path: String, reason: SkipReason) {
        match reason {
            SkipReason::NotRegularFile => debug!(path = %path, "skipped: {}", reason.as_str()),
            _ => warn!(path = %path, "skipped: {}", reason.as_str()),
        }
        self.skipped.push(SkippedEntry { path, reason });
    }
}

#[derive(Debug, Clone)]
pub struct PageFilter {
    pub wiki_dir: String,
    pub special_marker: String,
}

impl Default for PageFilter {
    fn default() -> Self {
        Self {
            wiki_dir: DEFAULT_WIKI_DIR.to_string(),
            special_marker: DEFAULT_SPECIAL_MARKER.to_string(),
        }
    }
}

impl PageFilter {
    /// `None` when `raw_path` is a content page: it lives under the wiki
    /// directory and its decoded title does not carry the special marker.
    pub fn skip_reason(&self, raw_path: &str, codec: &LegacyCodec) -> Option<SkipReason> {
        let dir = self.wiki_dir.trim_matches('/');
        let relative = raw_path.trim_start_matches("./").trim_start_matches('/');
        let in_wiki_dir = relative
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'));
        if !in_wiki_dir {
            return Some(SkipReason::OutsideWikiDir);
        }
        let title = codec.normalize(raw_path, "");
        if !self.special_marker.is_empty() && title.starts_with(&self.special_marker) {
            return Some(SkipReason::SpecialPage);
        }
        None
    }
}

/// One accepted archive entry after decoding and conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePage {
    pub source_path: String,
    /// Decoded page path joined under the prefix, without a leading `/`.
    pub path: String,
    pub body: String,
    pub authored_at: Option<String>,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct WalkSettings {
    pub prefix: String,
    pub codec: LegacyCodec,
    pub converter: MarkupConverter,
    pub filter: PageFilter,
}

#[derive(Debug, Clone)]
pub struct WalkOutput {
    pub pages: Vec<Page>,
    pub revisions: Vec<Revision>,
    pub report: WalkReport,
}

/// Single forward pass over a tar stream. Entries are visited in archive
/// order and each accepted entry is read exactly once.
#[derive(Debug, Clone, Default)]
pub struct ArchiveWalker {
    settings: WalkSettings,
}

impl ArchiveWalker {
    pub fn new(settings: WalkSettings) -> Self {
        Self { settings }
    }

    /// Calls `visit` for every accepted page, in archive order.
    pub fn for_each_page<R, F>(&self, archive: &mut Archive<R>, mut visit: F) -> Result<WalkReport>
    where
        R: Read,
        F: FnMut(SourcePage) -> Result<()>,
    {
        let mut report = WalkReport::default();
        let entries = archive.entries().context("failed to read archive entries")?;

        for (index, entry) in entries.enumerate() {
            let mut entry =
                entry.with_context(|| format!("failed to read archive entry #{}", index + 1))?;
            report.total_entries += 1;
            let raw_path = self.settings.codec.decode_text(&entry.path_bytes());

            if !entry.header().entry_type().is_file() {
                report.skip(raw_path, SkipReason::NotRegularFile);
                continue;
            }
            if let Some(reason) = self.settings.filter.skip_reason(&raw_path, &self.settings.codec)
            {
                report.skip(raw_path, reason);
                continue;
            }

            let page = self.read_page(&mut entry, raw_path)?;
            debug!(
                entry = index + 1,
                bytes = page.bytes,
                source = %page.source_path,
                path = %page.path,
                "converted page"
            );
            report.accepted += 1;
            report.source_bytes += page.bytes;
            visit(page)?;
        }

        Ok(report)
    }

    /// Builds the page/revision graph for the JSON bundle. Output order is
    /// archive order.
    pub fn walk<R: Read>(
        &self,
        archive: &mut Archive<R>,
        author: &User,
        ids: &IdGenerator,
        clock: &RunClock,
    ) -> Result<WalkOutput> {
        let mut pages = Vec::new();
        let mut revisions = Vec::new();

        let report = self.for_each_page(archive, |source| {
            let mut page = Page::new(&source.path, ids.new_id(), clock);
            let revision = Revision::new(
                ids.new_id(),
                &page,
                Some(author),
                source.body,
                source.authored_at,
            );
            page.attach(&revision);
            pages.push(page);
            revisions.push(revision);
            Ok(())
        })?;

        info!(
            pages = pages.len(),
            skipped = report.skipped.len(),
            "archive walk finished"
        );
        Ok(WalkOutput {
            pages,
            revisions,
            report,
        })
    }

    pub(crate) fn read_page<R: Read>(
        &self,
        entry: &mut Entry<'_, R>,
        raw_path: String,
    ) -> Result<SourcePage> {
        if !entry.header().entry_type().is_file() {
            return Err(ExportError::NotRegularFile(raw_path).into());
        }

        let mut content = Vec::new();
        if let Err(source) = entry.read_to_end(&mut content) {
            return Err(ExportError::UnreadableEntry {
                path: raw_path,
                source,
            }
            .into());
        }

        let original = self.settings.codec.decode_text(&content);
        let path = self
            .settings
            .codec
            .normalize(&raw_path, &self.settings.prefix);
        Ok(SourcePage {
            path,
            body: self.settings.converter.convert(&original),
            authored_at: extract_authored_date(&original),
            bytes: content.len() as u64,
            source_path: raw_path,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::entities::UserSpec;

    pub(crate) enum Fixture<'a> {
        File(&'a str, &'a [u8]),
        Dir(&'a str),
    }

    pub(crate) fn build_tar(entries: &[Fixture<'_>]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for entry in entries {
            let mut header = tar::Header::new_gnu();
            match entry {
                Fixture::File(path, data) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(data.len() as u64);
                    header.set_mode(0o644);
                    builder
                        .append_data(&mut header, path, *data)
                        .expect("append file");
                }
                Fixture::Dir(path) => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    builder
                        .append_data(&mut header, path, std::io::empty())
                        .expect("append dir");
                }
            }
        }
        builder.into_inner().expect("finish tar")
    }

    pub(crate) fn page_file(title: &str) -> String {
        format!("wiki/{}.txt", LegacyCodec::default().encode_name(title))
    }

    fn clock() -> RunClock {
        RunClock::start(9).expect("clock")
    }

    fn author(ids: &IdGenerator, clock: &RunClock) -> User {
        User::new(
            UserSpec {
                name: "pukiwiki".to_string(),
                ..UserSpec::default()
            },
            "seed",
            ids,
            clock,
        )
    }

    #[test]
    fn filter_accepts_only_wiki_dir_pages() {
        let codec = LegacyCodec::default();
        let filter = PageFilter::default();
        assert_eq!(filter.skip_reason(&page_file("FrontPage"), &codec), None);
        assert_eq!(
            filter.skip_reason(&format!("/{}", page_file("FrontPage")), &codec),
            None
        );
        assert_eq!(
            filter.skip_reason("backup/46726F6E74.txt", &codec),
            Some(SkipReason::OutsideWikiDir)
        );
        assert_eq!(
            filter.skip_reason("wikipedia/46726F6E74.txt", &codec),
            Some(SkipReason::OutsideWikiDir)
        );
        assert_eq!(
            filter.skip_reason(&page_file(":RenameLog"), &codec),
            Some(SkipReason::SpecialPage)
        );
        assert_eq!(
            filter.skip_reason(&page_file(":config/plugin"), &codec),
            Some(SkipReason::SpecialPage)
        );
    }

    #[test]
    fn walk_builds_linked_pages_and_revisions_in_archive_order() {
        let zeta = page_file("Zeta");
        let alpha = page_file("日本語");
        let special = page_file(":RecentChanges");
        let tar = build_tar(&[
            Fixture::Dir("wiki/"),
            Fixture::File(&zeta, b"*Zeta\n"),
            Fixture::File("attach/file.bin", b"\x00\x01"),
            Fixture::File(&special, b"-x\n"),
            Fixture::File(
                &alpha,
                b"#author(\"2018-11-08T16:04:27+09:00\",\"\",\"\")\n-\xa4\xa2\n",
            ),
        ]);
        let mut archive = Archive::new(Cursor::new(tar));
        let ids = IdGenerator::default();
        let clock = clock();
        let user = author(&ids, &clock);
        let walker = ArchiveWalker::new(WalkSettings {
            prefix: "pukiwiki".to_string(),
            ..WalkSettings::default()
        });

        let output = walker
            .walk(&mut archive, &user, &ids, &clock)
            .expect("walk");

        assert_eq!(output.report.total_entries, 5);
        assert_eq!(output.report.accepted, 2);
        assert_eq!(output.report.skipped_count(SkipReason::NotRegularFile), 1);
        assert_eq!(output.report.skipped_count(SkipReason::OutsideWikiDir), 1);
        assert_eq!(output.report.skipped_count(SkipReason::SpecialPage), 1);

        let paths: Vec<&str> = output.pages.iter().map(|page| page.path.as_str()).collect();
        assert_eq!(paths, vec!["/pukiwiki/Zeta", "/pukiwiki/日本語"]);

        for (page, revision) in output.pages.iter().zip(&output.revisions) {
            assert_eq!(page.revision_id, Some(revision.id));
            assert_eq!(revision.page_id, page.id);
            assert_eq!(revision.author_id, Some(user.id));
            assert_eq!(page.created_at, revision.created_at);
        }
        assert_eq!(output.revisions[0].body, "# Zeta\n");
        assert_eq!(output.revisions[0].created_at, clock.now_iso());
        assert_eq!(output.revisions[1].body, "- あ\n");
        assert_eq!(output.revisions[1].created_at, "2018-11-08T16:04:27+09:00");
    }

    #[test]
    fn undecodable_bytes_survive_as_escapes() {
        let path = page_file("Broken");
        let tar = build_tar(&[Fixture::File(&path, b"ok \xff end\n")]);
        let mut archive = Archive::new(Cursor::new(tar));
        let mut visited = Vec::new();
        ArchiveWalker::default()
            .for_each_page(&mut archive, |page| {
                visited.push((page.source_path, page.body));
                Ok(())
            })
            .expect("walk");
        assert_eq!(visited, vec![(path, "ok \\xff end\n".to_string())]);
    }

    #[test]
    fn visitor_errors_propagate() {
        let path = page_file("A");
        let tar = build_tar(&[Fixture::File(&path, b"a")]);
        let mut archive = Archive::new(Cursor::new(tar));
        let error = ArchiveWalker::default()
            .for_each_page(&mut archive, |_| anyhow::bail!("abort run"))
            .expect_err("must fail");
        assert!(error.to_string().contains("abort run"));
    }

    #[test]
    fn reading_a_directory_as_page_is_an_error() {
        let tar = build_tar(&[Fixture::Dir("wiki/")]);
        let mut archive = Archive::new(Cursor::new(tar));
        let walker = ArchiveWalker::default();
        let mut entries = archive.entries().expect("entries");
        let mut entry = entries.next().expect("one entry").expect("entry");
        let error = walker
            .read_page(&mut entry, "wiki/".to_string())
            .expect_err("must fail");
        assert!(matches!(
            error.downcast_ref::<ExportError>(),
            Some(ExportError::NotRegularFile(_))
        ));
    }

    #[test]
    fn open_archive_reads_plain_and_gzipped_dumps() {
        use std::io::Write;

        use flate2::Compression;
        use flate2::write::GzEncoder;

        let temp = tempfile::tempdir().expect("tempdir");
        let path = page_file("FrontPage");
        let tar = build_tar(&[Fixture::File(&path, b"hello")]);

        let plain = temp.path().join("dump.tar");
        std::fs::write(&plain, &tar).expect("write tar");
        let gzipped = temp.path().join("dump.tar.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).expect("gzip");
        std::fs::write(&gzipped, encoder.finish().expect("finish gzip")).expect("write gz");

        for dump in [&plain, &gzipped] {
            let mut archive = open_archive(dump).expect("open");
            let mut titles = Vec::new();
            ArchiveWalker::default()
                .for_each_page(&mut archive, |page| {
                    titles.push(page.path);
                    Ok(())
                })
                .expect("walk");
            assert_eq!(titles, vec!["FrontPage".to_string()]);
        }
    }
}
