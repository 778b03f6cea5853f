use anyhow::{Context, Result};
use reqwest::Client as HttpClient;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::singbox::{referenced_rule_sets, rule_set_dir};

const GEOIP_URL: &str = "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/geoip.dat";
const GEOSITE_URL: &str =
    "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/geosite.dat";
const MIRROR_BASE: &str = "https://fastly.jsdelivr.net/gh/MetaCubeX/meta-rules-dat@release";

/// Downloads rule-set and geodata files the engines expect on disk
#[derive(Debug, Clone)]
pub struct AssetFetcher {
    client: HttpClient,
    artifacts_dir: PathBuf,
}

impl AssetFetcher {
    pub fn new(artifacts_dir: &Path) -> Self {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            artifacts_dir: artifacts_dir.to_path_buf(),
        }
    }

    /// `<artifacts>/geo`
    pub fn geo_dir(&self) -> PathBuf {
        self.artifacts_dir.join("geo")
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context(format!("Failed to download {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("download {} returned {}", url, response.status());
        }

        let body = response.bytes().await.context("Failed to read download body")?;
        if body.is_empty() {
            anyhow::bail!("download {}: empty payload", url);
        }
        Ok(body.to_vec())
    }

    /// Fetch every `.srs` referenced by a rendered sing-box config that is missing or empty.
    pub async fn ensure_rule_sets(&self, config: &[u8]) -> Result<()> {
        let dir = rule_set_dir(&self.artifacts_dir);
        for tag in referenced_rule_sets(config)? {
            let target = dir.join(format!("{}.srs", tag));
            if non_empty_file(&target).await {
                continue;
            }
            let url = rule_set_url(&tag)?;
            let data = self
                .download(&url)
                .await
                .with_context(|| format!("download rule-set {}", tag))?;
            write_atomic(&target, &data)
                .await
                .with_context(|| format!("write rule-set {}", tag))?;
            tracing::info!(tag = %tag, "rule-set downloaded");
        }
        Ok(())
    }

    /// Place `GeoIP.dat`, `GeoSite.dat` and `geoip.metadb` into a mihomo work dir.
    ///
    /// Sources are cached under `<artifacts>/geo`. Every file is attempted; the
    /// first failure is returned after the others have been tried.
    pub async fn ensure_geodata(&self, engine_dir: &Path) -> Result<()> {
        let geo_dir = self.geo_dir();
        let geoip_mirror = format!("{}/geoip.dat", MIRROR_BASE);
        let geosite_mirror = format!("{}/geosite.dat", MIRROR_BASE);
        let metadb_mirror = format!("{}/geoip.metadb", MIRROR_BASE);
        let pairs: [(&str, &str, Vec<&str>); 3] = [
            ("geoip.dat", "GeoIP.dat", vec![GEOIP_URL, geoip_mirror.as_str()]),
            ("geosite.dat", "GeoSite.dat", vec![GEOSITE_URL, geosite_mirror.as_str()]),
            ("geoip.metadb", "geoip.metadb", vec![metadb_mirror.as_str()]),
        ];

        let mut first_err = None;
        for (src_name, dst_name, urls) in pairs {
            let dst = engine_dir.join(dst_name);
            if non_empty_file(&dst).await {
                continue;
            }
            let src = geo_dir.join(src_name);
            if let Err(e) = self.ensure_source(&src, &urls).await {
                first_err.get_or_insert(e);
                continue;
            }
            let data = tokio::fs::read(&src)
                .await
                .with_context(|| format!("Failed to read {}", src.display()))?;
            write_atomic(&dst, &data).await?;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn ensure_source(&self, path: &Path, urls: &[&str]) -> Result<()> {
        if non_empty_file(path).await {
            return Ok(());
        }
        let mut last_err = None;
        for url in urls {
            match self.download(url).await {
                Ok(data) => return write_atomic(path, &data).await,
                Err(e) => {
                    tracing::debug!(url = %url, "geo download failed: {:#}", e);
                    last_err = Some(e);
                }
            }
        }
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("no source url"))
            .context(format!("download {}", name)))
    }
}

/// Upstream URL of a `geosite-*` / `geoip-*` rule-set.
pub fn rule_set_url(tag: &str) -> Result<String> {
    let tag = tag.trim().to_lowercase();
    if tag.starts_with("geosite-") {
        Ok(format!(
            "https://raw.githubusercontent.com/SagerNet/sing-geosite/rule-set/{}.srs",
            tag
        ))
    } else if tag.starts_with("geoip-") {
        Ok(format!(
            "https://raw.githubusercontent.com/SagerNet/sing-geoip/rule-set/{}.srs",
            tag
        ))
    } else {
        anyhow::bail!("unknown sing-box rule-set tag: {}", tag)
    }
}

async fn non_empty_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Write through a temp file in the same directory, then rename.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent directory for {}", path.display()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("Failed to replace {}", path.display()));
    }
    Ok(())
}
