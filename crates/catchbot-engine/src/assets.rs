//! Reference sprite set: the `<dex> <identity>` name map, the sprite
//! directory it points at, and the downloader that fills that directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use catchbot_contracts::config::AssetConfig;
use reqwest::blocking::Client as HttpClient;
use tracing::{info, warn};

use crate::hash::{CollisionPolicy, HashIndex};
use crate::router::DataRegenerator;

const SPRITE_FETCH_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub dex: String,
    pub identity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameMap {
    entries: Vec<NameEntry>,
}

impl NameMap {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read name map {}", path.display()))?;
        let names = Self::parse(&raw);
        if names.is_empty() {
            bail!("name map {} lists no creatures", path.display());
        }
        Ok(names)
    }

    /// One `<dex> <identity>` pair per line; the identity may contain
    /// spaces. Blank and malformed lines are skipped.
    pub fn parse(raw: &str) -> Self {
        let mut entries = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Some((dex, identity)) = trimmed.split_once(char::is_whitespace) else {
                warn!(line = line_no + 1, content = trimmed, "skipping malformed name map line");
                continue;
            };
            let identity = identity.trim();
            if identity.is_empty() {
                warn!(line = line_no + 1, content = trimmed, "skipping malformed name map line");
                continue;
            }
            entries.push(NameEntry {
                dex: dex.to_string(),
                identity: identity.to_string(),
            });
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[NameEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn sprite_path(sprite_dir: &Path, identity: &str) -> PathBuf {
    sprite_dir.join(format!("{identity}.png"))
}

/// Read every sprite the name map lists. A missing sprite is an error.
pub fn load_reference_images(names: &NameMap, sprite_dir: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    names
        .entries()
        .iter()
        .map(|entry| {
            let path = sprite_path(sprite_dir, &entry.identity);
            let bytes = fs::read(&path).with_context(|| {
                format!(
                    "failed to read reference sprite for {} at {}",
                    entry.identity,
                    path.display()
                )
            })?;
            Ok((entry.identity.clone(), bytes))
        })
        .collect()
}

pub fn build_index_from_assets(config: &AssetConfig, policy: CollisionPolicy) -> Result<HashIndex> {
    let names = NameMap::load(&config.name_map)?;
    info!(count = names.len(), "generating hash index");
    let references = load_reference_images(&names, &config.sprite_dir)?;
    let index = HashIndex::build(references, policy).context("failed to build hash index")?;
    info!(
        entries = index.len(),
        collisions = index.collisions().len(),
        "hash index ready"
    );
    Ok(index)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub failed: Vec<(String, String)>,
}

/// Fetches `<art_base_url><dex>.png` into `<sprite_dir>/<identity>.png`.
pub struct SpriteDownloader {
    client: HttpClient,
    base_url: String,
    name_map: PathBuf,
    sprite_dir: PathBuf,
}

impl SpriteDownloader {
    pub fn new(config: &AssetConfig) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(SPRITE_FETCH_TIMEOUT_SECONDS))
            .build()
            .context("failed to build sprite http client")?;
        Ok(Self {
            client,
            base_url: normalize_base_url(&config.art_base_url),
            name_map: config.name_map.clone(),
            sprite_dir: config.sprite_dir.clone(),
        })
    }

    pub fn sprite_url(&self, dex: &str) -> String {
        format!("{}{dex}.png", self.base_url)
    }

    pub fn download_all(&self) -> Result<DownloadReport> {
        let names = NameMap::load(&self.name_map)?;
        fs::create_dir_all(&self.sprite_dir).with_context(|| {
            format!("failed to create sprite dir {}", self.sprite_dir.display())
        })?;

        let mut report = DownloadReport::default();
        for entry in names.entries() {
            match self.download_one(entry) {
                Ok(()) => report.downloaded += 1,
                Err(err) => {
                    warn!(identity = %entry.identity, "sprite download failed: {err:#}");
                    report.failed.push((entry.identity.clone(), format!("{err:#}")));
                }
            }
        }
        info!(
            downloaded = report.downloaded,
            failed = report.failed.len(),
            "sprite download finished"
        );
        Ok(report)
    }

    fn download_one(&self, entry: &NameEntry) -> Result<()> {
        let url = self.sprite_url(&entry.dex);
        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("request to {url} failed ({})", status.as_u16());
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read body of {url}"))?;
        let path = sprite_path(&self.sprite_dir, &entry.identity);
        fs::write(&path, &bytes).with_context(|| format!("failed to write {}", path.display()))
    }
}

impl DataRegenerator for SpriteDownloader {
    fn regenerate(&self) -> Result<usize> {
        let report = self.download_all()?;
        if !report.failed.is_empty() {
            bail!(
                "{} of {} sprites failed to download",
                report.failed.len(),
                report.failed.len() + report.downloaded
            );
        }
        Ok(report.downloaded)
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}
