use anyhow::{Result, anyhow};
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use sha2::{Digest, Sha256};

use crate::ids::{Id, IdGenerator};

pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 9;
pub const REVISION_FORMAT: &str = "markdown";
const RAW_PASSWORD_LENGTH: usize = 64;
const PASSWORD_SEED_LENGTH: usize = 32;
const EMAIL_DOMAIN: &str = "growi.example.com";

/// The single "now" of one export run. Every default timestamp is taken from
/// here, so entities never capture their own wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunClock {
    now: DateTime<FixedOffset>,
}

impl RunClock {
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self { now }
    }

    /// Current time rendered in a fixed UTC offset.
    pub fn start(utc_offset_hours: i32) -> Result<Self> {
        let offset = FixedOffset::east_opt(utc_offset_hours.saturating_mul(3600))
            .ok_or_else(|| anyhow!("UTC offset out of range: {utc_offset_hours} hours"))?;
        Ok(Self::new(Utc::now().with_timezone(&offset)))
    }

    pub fn now_iso(&self) -> String {
        self.now.to_rfc3339_opts(SecondsFormat::Secs, false)
    }

    /// The Unix epoch in the clock's offset, for "never happened" fields.
    pub fn epoch_iso(&self) -> String {
        DateTime::<Utc>::UNIX_EPOCH
            .with_timezone(self.now.offset())
            .to_rfc3339_opts(SecondsFormat::Secs, false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub id: Id,
    /// Always starts with `/`.
    pub path: String,
    pub revision_id: Option<Id>,
    pub created_at: String,
    pub updated_at: String,
}

impl Page {
    pub fn new(path: &str, id: Id, clock: &RunClock) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let now = clock.now_iso();
        Self {
            id,
            path,
            revision_id: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Point the page at its revision and adopt the revision's timestamp.
    pub fn attach(&mut self, revision: &Revision) {
        self.revision_id = Some(revision.id);
        self.created_at = revision.created_at.clone();
        self.updated_at = revision.created_at.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub id: Id,
    pub page_id: Id,
    pub author_id: Option<Id>,
    pub body: String,
    pub format: &'static str,
    pub created_at: String,
}

impl Revision {
    /// `authored_at` wins over the page's default timestamp when present.
    pub fn new(
        id: Id,
        page: &Page,
        author: Option<&User>,
        body: String,
        authored_at: Option<String>,
    ) -> Self {
        Self {
            id,
            page_id: page.id,
            author_id: author.map(|user| user.id),
            body,
            format: REVISION_FORMAT,
            created_at: authored_at.unwrap_or_else(|| page.created_at.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Id,
    pub name: String,
    pub username: String,
    pub email: String,
    /// `sha256(seed + raw_secret)` as lowercase hex.
    pub password: String,
    pub is_admin: bool,
    pub created_at: String,
    /// The synthetic account never logged in: the epoch.
    pub last_login_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct UserSpec {
    pub name: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub is_admin: bool,
}

impl User {
    /// Builds the synthetic author. The raw secret is generated here and
    /// discarded; only its seeded hash survives.
    pub fn new(spec: UserSpec, password_seed: &str, ids: &IdGenerator, clock: &RunClock) -> Self {
        let raw_password = random_secret(RAW_PASSWORD_LENGTH);
        let username = spec
            .username
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| spec.name.clone());
        let email = spec
            .email
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| format!("{}@{EMAIL_DOMAIN}", spec.name));
        Self {
            id: ids.new_id(),
            password: hash_password(password_seed, &raw_password),
            name: spec.name,
            username,
            email,
            is_admin: spec.is_admin,
            created_at: clock.now_iso(),
            last_login_at: clock.epoch_iso(),
        }
    }
}

pub fn random_secret(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Per-run seed recorded in the export metadata.
pub fn random_password_seed() -> String {
    random_secret(PASSWORD_SEED_LENGTH)
}

pub fn hash_password(seed: &str, password: &str) -> String {
    let digest = Sha256::digest(format!("{seed}{password}").as_bytes());
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
