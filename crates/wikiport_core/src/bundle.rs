use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};
use zip::CompressionMethod;
use zip::write::{FileOptions, ZipWriter};

use crate::entities::{Page, Revision, User};
use crate::error::ExportError;
use crate::ids::Id;

pub const PAGES_JSON: &str = "pages.json";
pub const REVISIONS_JSON: &str = "revisions.json";
pub const USERS_JSON: &str = "users.json";
pub const META_JSON: &str = "meta.json";

const PAGE_STATUS: &str = "published";
const PAGE_GRANT_PUBLIC: u8 = 1;
const USER_LANG: &str = "ja_JP";
const USER_STATUS_ACTIVE: u8 = 2;
const USER_IMAGE_URL: &str = "/images/icons/user.svg";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord<'a> {
    parent: Option<Id>,
    descendant_count: u32,
    is_empty: bool,
    status: &'static str,
    grant: u8,
    granted_users: [Id; 0],
    liker: [Id; 0],
    seen_users: [Id; 0],
    comment_count: u32,
    granted_group: Option<Id>,
    #[serde(rename = "__v")]
    version: u32,
    #[serde(rename = "_id")]
    id: Id,
    revision: Option<Id>,
    path: &'a str,
    created_at: &'a str,
    updated_at: &'a str,
}

impl<'a> From<&'a Page> for PageRecord<'a> {
    fn from(page: &'a Page) -> Self {
        Self {
            parent: None,
            descendant_count: 0,
            is_empty: false,
            status: PAGE_STATUS,
            grant: PAGE_GRANT_PUBLIC,
            granted_users: [],
            liker: [],
            seen_users: [],
            comment_count: 0,
            granted_group: None,
            version: 0,
            id: page.id,
            revision: page.revision_id,
            path: &page.path,
            created_at: &page.created_at,
            updated_at: &page.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionRecord<'a> {
    #[serde(rename = "__v")]
    version: u32,
    #[serde(rename = "_id")]
    id: Id,
    format: &'a str,
    created_at: &'a str,
    page_id: Id,
    author: Option<Id>,
    body: &'a str,
}

impl<'a> From<&'a Revision> for RevisionRecord<'a> {
    fn from(revision: &'a Revision) -> Self {
        Self {
            version: 0,
            id: revision.id,
            format: revision.format,
            created_at: &revision.created_at,
            page_id: revision.page_id,
            author: revision.author_id,
            body: &revision.body,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord<'a> {
    is_gravatar_enabled: bool,
    is_email_published: bool,
    lang: &'static str,
    status: u8,
    is_invitation_email_sended: bool,
    #[serde(rename = "__v")]
    version: u32,
    image_url_cached: &'static str,
    last_login_at: &'a str,
    #[serde(rename = "_id")]
    id: Id,
    admin: bool,
    created_at: &'a str,
    name: &'a str,
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

impl<'a> From<&'a User> for UserRecord<'a> {
    fn from(user: &'a User) -> Self {
        Self {
            is_gravatar_enabled: false,
            is_email_published: true,
            lang: USER_LANG,
            status: USER_STATUS_ACTIVE,
            is_invitation_email_sended: false,
            version: 0,
            image_url_cached: USER_IMAGE_URL,
            last_login_at: &user.last_login_at,
            id: user.id,
            admin: user.is_admin,
            created_at: &user.created_at,
            name: &user.name,
            username: &user.username,
            email: &user.email,
            password: &user.password,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMeta {
    pub version: String,
    pub password_seed: String,
    pub exported_at: String,
}

/// One named file inside an output container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub name: String,
    pub data: Vec<u8>,
}

impl ContainerEntry {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub entries: usize,
    pub uncompressed_bytes: u64,
}

/// Create `dest` exclusively. An existing file is never opened for writing.
pub fn create_container(dest: &Path) -> Result<File> {
    match OpenOptions::new().write(true).create_new(true).open(dest) {
        Ok(file) => Ok(file),
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
            Err(ExportError::DestinationExists(dest.to_path_buf()).into())
        }
        Err(error) => Err(error).with_context(|| format!("failed to create {}", dest.display())),
    }
}

/// Write `entries` as a deflated zip at `dest`. A partially written
/// container is removed when a later step fails.
pub fn write_container(dest: &Path, entries: &[ContainerEntry]) -> Result<ContainerSummary> {
    let file = create_container(dest)?;
    let result = write_zip(file, entries);
    if result.is_err()
        && let Err(cleanup) = fs::remove_file(dest)
    {
        warn!(path = %dest.display(), error = %cleanup, "failed to remove partial container");
    }
    result.with_context(|| format!("failed to write {}", dest.display()))
}

fn write_zip(file: File, entries: &[ContainerEntry]) -> Result<ContainerSummary> {
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(file);
    let mut summary = ContainerSummary::default();
    for entry in entries {
        zip.start_file(entry.name.as_str(), options)
            .with_context(|| format!("failed to start entry {}", entry.name))?;
        zip.write_all(&entry.data)
            .with_context(|| format!("failed to write entry {}", entry.name))?;
        debug!(entry = %entry.name, bytes = entry.data.len(), "wrote container entry");
        summary.entries += 1;
        summary.uncompressed_bytes += entry.data.len() as u64;
    }
    zip.finish().context("failed to finalize zip")?;
    Ok(summary)
}

/// The four JSON documents of an importable bundle, in entry order.
pub fn bundle_entries(
    pages: &[Page],
    revisions: &[Revision],
    user: &User,
    meta: &BundleMeta,
) -> Result<Vec<ContainerEntry>> {
    let page_records: Vec<PageRecord<'_>> = pages.iter().map(PageRecord::from).collect();
    let revision_records: Vec<RevisionRecord<'_>> =
        revisions.iter().map(RevisionRecord::from).collect();
    let user_records = [UserRecord::from(user)];

    Ok(vec![
        ContainerEntry::new(
            PAGES_JSON,
            serde_json::to_vec(&page_records).context("failed to serialize pages")?,
        ),
        ContainerEntry::new(
            REVISIONS_JSON,
            serde_json::to_vec(&revision_records).context("failed to serialize revisions")?,
        ),
        ContainerEntry::new(
            USERS_JSON,
            serde_json::to_vec(&user_records).context("failed to serialize users")?,
        ),
        ContainerEntry::new(
            META_JSON,
            serde_json::to_vec(meta).context("failed to serialize meta")?,
        ),
    ])
}

pub fn write_bundle(
    dest: &Path,
    pages: &[Page],
    revisions: &[Revision],
    user: &User,
    meta: &BundleMeta,
) -> Result<ContainerSummary> {
    let entries = bundle_entries(pages, revisions, user, meta)?;
    write_container(dest, &entries)
}
