//! Fetching ecoshards into a local cache through the task graph.

use crate::error::{PnnError, Result};
use crate::taskgraph::{TaskGraph, TaskId, TaskSpec};
use flate2::read::GzDecoder;
use log::{debug, info};
use reqwest::blocking::Client;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use zip::ZipArchive;

const GZIP_BUFFER_SIZE: usize = 1 << 20;

/// Source of remote bytes.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<()>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(60))
            .timeout(None)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<()> {
        let mut response = self.client.get(url).send()?.error_for_status()?;
        io::copy(&mut response, sink)?;
        Ok(())
    }
}

/// How a downloaded ecoshard is unpacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decompress {
    None,
    Gunzip,
    Unzip,
}

/// Last path segment of `url`, ignoring any query string.
pub fn url_basename(url: &str) -> Result<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(PnnError::InvalidUrl(url.to_string())),
    }
}

/// Stream `url` into `target_path` through a temp file in the same directory.
pub fn download_url(fetcher: &dyn Fetcher, url: &str, target_path: &Path) -> Result<()> {
    let parent = target_path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    info!("Downloading {} -> {}", url, target_path.display());

    let temp = tempfile::Builder::new()
        .prefix(".download")
        .tempfile_in(parent)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        fetcher.fetch(url, &mut writer)?;
        writer.flush()?;
    }
    temp.persist(target_path).map_err(|err| PnnError::Io(err.error))?;
    Ok(())
}

/// Download a `.gz` next to `target_path`, inflate it there and delete it.
pub fn download_and_ungzip(fetcher: &dyn Fetcher, url: &str, target_path: &Path) -> Result<()> {
    let parent = target_path.parent().unwrap_or_else(|| Path::new("."));
    let gzip_path = parent.join(url_basename(url)?);
    download_url(fetcher, url, &gzip_path)?;

    let mut decoder = GzDecoder::new(BufReader::with_capacity(GZIP_BUFFER_SIZE, File::open(&gzip_path)?));
    let temp = tempfile::Builder::new()
        .prefix(".gunzip")
        .tempfile_in(parent)?;
    {
        let mut target = BufWriter::with_capacity(GZIP_BUFFER_SIZE, temp.as_file());
        let mut chunk = vec![0u8; GZIP_BUFFER_SIZE];
        loop {
            let n = io::Read::read(&mut decoder, &mut chunk)?;
            if n == 0 {
                break;
            }
            target.write_all(&chunk[..n])?;
        }
        target.flush()?;
    }
    temp.persist(target_path).map_err(|err| PnnError::Io(err.error))?;

    fs::remove_file(&gzip_path)?;
    Ok(())
}

/// Extract every entry of `zip_path` under `target_dir`.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(File::open(zip_path)?)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => return Err(PnnError::ZipTraversal(entry.name().to_string())),
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)?;
            continue;
        }
        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&entry_path)?;
        io::copy(&mut entry, &mut outfile)?;
    }
    debug!("Extracted {} entries from {}", archive.len(), zip_path.display());
    Ok(())
}

/// Download a zip into `target_dir`, extract it, delete it, then write
/// `token_path` to mark completion.
pub fn download_and_unzip(
    fetcher: &dyn Fetcher,
    url: &str,
    target_dir: &Path,
    token_path: &Path,
) -> Result<()> {
    let zip_path = target_dir.join(url_basename(url)?);
    download_url(fetcher, url, &zip_path)?;
    extract_zip(&zip_path, target_dir)?;
    fs::remove_file(&zip_path)?;

    fs::write(token_path, format!("unzipped {}", zip_path.display()))?;
    Ok(())
}

#[derive(Debug, Clone)]
struct Registration {
    url: String,
    local_path: PathBuf,
    task: TaskId,
}

/// Registry of ecoshards keyed by a short logical name.
pub struct EcoshardDownloader {
    download_dir: PathBuf,
    token_dir: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    registrations: BTreeMap<String, Registration>,
}

impl EcoshardDownloader {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(
        download_dir: P,
        token_dir: Q,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        let download_dir = download_dir.into();
        let token_dir = token_dir.into();
        fs::create_dir_all(&download_dir)?;
        fs::create_dir_all(&token_dir)?;
        Ok(Self {
            download_dir,
            token_dir,
            fetcher,
            registrations: BTreeMap::new(),
        })
    }

    /// Schedule the download of `url` under `key`.
    ///
    /// With [`Decompress::Unzip`] the key resolves to `local_path` inside the
    /// download directory (or the directory itself when `local_path` is
    /// `None`); otherwise `local_path` is ignored and the key resolves to the
    /// downloaded, possibly gunzipped, file.
    pub fn download_ecoshard(
        &mut self,
        graph: &mut TaskGraph,
        url: &str,
        key: &str,
        decompress: Decompress,
        local_path: Option<&str>,
    ) -> Result<()> {
        if let Some(existing) = self.registrations.get(key) {
            return Err(PnnError::DuplicateKey {
                key: key.to_string(),
                url: existing.url.clone(),
            });
        }

        let basename = url_basename(url)?;
        let fetcher = Arc::clone(&self.fetcher);
        let owned_url = url.to_string();

        let (local, task) = match decompress {
            Decompress::None => {
                let target = self.download_dir.join(&basename);
                let task_target = target.clone();
                let task = graph.add_task(
                    TaskSpec::new(format!("download {}", target.display()))
                        .args(url)
                        .targets([&target]),
                    move || download_url(fetcher.as_ref(), &owned_url, &task_target),
                )?;
                (target, task)
            }
            Decompress::Gunzip => {
                let stem = basename
                    .strip_suffix(".gz")
                    .ok_or_else(|| PnnError::NotGzip(url.to_string()))?;
                let target = self.download_dir.join(stem);
                let task_target = target.clone();
                let task = graph.add_task(
                    TaskSpec::new(format!("download {}", target.display()))
                        .args(url)
                        .targets([&target]),
                    move || download_and_ungzip(fetcher.as_ref(), &owned_url, &task_target),
                )?;
                (target, task)
            }
            Decompress::Unzip => {
                let token = self.token_dir.join(format!("{}.UNZIPTOKEN", basename));
                let task_token = token.clone();
                let target_dir = self.download_dir.clone();
                let task = graph.add_task(
                    TaskSpec::new(format!("download {}", basename))
                        .args(url)
                        .targets([&token]),
                    move || download_and_unzip(fetcher.as_ref(), &owned_url, &target_dir, &task_token),
                )?;
                let local = match local_path {
                    Some(relative) => self.download_dir.join(relative),
                    None => self.download_dir.clone(),
                };
                (local, task)
            }
        };

        debug!("Registered ecoshard '{}' -> {}", key, local.display());
        self.registrations.insert(
            key.to_string(),
            Registration {
                url: url.to_string(),
                local_path: local,
                task,
            },
        );
        Ok(())
    }

    /// Local path of `key`, downloading it first if needed.
    pub fn get_path(&self, graph: &mut TaskGraph, key: &str) -> Result<PathBuf> {
        let registration = self
            .registrations
            .get(key)
            .ok_or_else(|| PnnError::UnknownKey(key.to_string()))?;
        graph.join_task(registration.task)?;
        if !registration.local_path.exists() {
            return Err(PnnError::MissingPath(registration.local_path.clone()));
        }
        Ok(registration.local_path.clone())
    }

    /// Task that produces `key`, for use as a dependency.
    pub fn task(&self, key: &str) -> Result<TaskId> {
        self.registrations
            .get(key)
            .map(|registration| registration.task)
            .ok_or_else(|| PnnError::UnknownKey(key.to_string()))
    }

    /// Block until every registered download is complete.
    pub fn join(&self, graph: &mut TaskGraph) -> Result<()> {
        for registration in self.registrations.values() {
            graph.join_task(registration.task)?;
        }
        Ok(())
    }
}
