use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::archive::{ArchiveWalker, WalkReport, WalkSettings, open_archive};
use crate::bundle::{BundleMeta, ContainerSummary, write_bundle};
use crate::entities::{RunClock, User, UserSpec, random_password_seed};
use crate::error::ExportError;
use crate::html_tree::{DocumentFormat, HtmlTreeBuilder, write_html_bundle};
use crate::ids::IdGenerator;

pub const DEFAULT_GROWI_OUTPUT: &str = "export.growi.zip";
pub const DEFAULT_HTML_OUTPUT: &str = "export.zip";

#[derive(Debug, Clone)]
pub struct GrowiExportOptions {
    pub dump: PathBuf,
    pub output: PathBuf,
    pub walk: WalkSettings,
    pub author: UserSpec,
    pub target_version: String,
    pub ids: IdGenerator,
    pub clock: RunClock,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrowiExportReport {
    pub output: PathBuf,
    pub pages: usize,
    pub revisions: usize,
    pub author: String,
    pub target_version: String,
    pub password_seed: String,
    pub exported_at: String,
    pub walk: WalkReport,
    pub container: ContainerSummary,
}

#[derive(Debug, Clone)]
pub struct HtmlExportOptions {
    pub dump: PathBuf,
    pub output: PathBuf,
    pub walk: WalkSettings,
    pub format: DocumentFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct HtmlExportReport {
    pub output: PathBuf,
    pub format: DocumentFormat,
    pub documents: usize,
    /// Pages moved to `<path>/index` because other pages live beneath them.
    pub folded: usize,
    pub walk: WalkReport,
    pub container: ContainerSummary,
}

/// Fails fast before the dump is read. The exclusive create at write time
/// still guards against the file appearing in between.
fn ensure_destination_free(output: &Path) -> Result<()> {
    if output.exists() {
        return Err(ExportError::DestinationExists(output.to_path_buf()).into());
    }
    Ok(())
}

pub fn run_growi_export(options: &GrowiExportOptions) -> Result<GrowiExportReport> {
    ensure_destination_free(&options.output)?;
    let mut archive = open_archive(&options.dump)?;

    let password_seed = random_password_seed();
    let user = User::new(
        options.author.clone(),
        &password_seed,
        &options.ids,
        &options.clock,
    );
    let walker = ArchiveWalker::new(options.walk.clone());
    let output = walker.walk(&mut archive, &user, &options.ids, &options.clock)?;

    let meta = BundleMeta {
        version: options.target_version.clone(),
        password_seed,
        exported_at: options.clock.now_iso(),
    };
    let container = write_bundle(
        &options.output,
        &output.pages,
        &output.revisions,
        &user,
        &meta,
    )?;
    info!(
        output = %options.output.display(),
        pages = output.pages.len(),
        "wrote import bundle"
    );

    Ok(GrowiExportReport {
        output: options.output.clone(),
        pages: output.pages.len(),
        revisions: output.revisions.len(),
        author: user.name,
        target_version: meta.version,
        password_seed: meta.password_seed,
        exported_at: meta.exported_at,
        walk: output.report,
        container,
    })
}

pub fn run_html_export(options: &HtmlExportOptions) -> Result<HtmlExportReport> {
    ensure_destination_free(&options.output)?;
    let mut archive = open_archive(&options.dump)?;

    let walker = ArchiveWalker::new(options.walk.clone());
    let mut builder = HtmlTreeBuilder::new();
    let walk = walker.for_each_page(&mut archive, |page| {
        builder.insert(&page.path, page.body);
        Ok(())
    })?;

    let nodes = builder.finalize();
    let folded = nodes
        .iter()
        .filter(|node| node.path != node.source_path)
        .count();
    let renderer = options.format.renderer();
    let container = write_html_bundle(&options.output, &nodes, renderer.as_ref())?;
    info!(
        output = %options.output.display(),
        documents = nodes.len(),
        folded,
        "wrote document bundle"
    );

    Ok(HtmlExportReport {
        output: options.output.clone(),
        format: options.format,
        documents: nodes.len(),
        folded,
        walk,
        container,
    })
}
