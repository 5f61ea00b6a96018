//! OCI packaging and transport for module versions.
//!
//! One module version is an image manifest whose config is the module
//! artifact type pointing at a scratch `{}` blob, with exactly two
//! layers: the module zip and the raw `cue.mod/module.cue` text. Tags
//! are canonical version strings, optionally behind a configured
//! prefix; every major version of a module shares one repository.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{NotFound, Result};
use crate::modzip;
use crate::par::Cancellation;
use crate::path;
use crate::registry::Remote;
use crate::version::{self, Version};

pub const MODULE_ARTIFACT_TYPE: &str = "application/vnd.cue.module.v1+json";
pub const MODULE_FILE_MEDIA_TYPE: &str = "application/vnd.cue.modulefile.v1";
pub const ZIP_MEDIA_TYPE: &str = "application/zip";
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

pub const ANNOTATION_VCS_TYPE: &str = "org.cuelang.vcs-type";
pub const ANNOTATION_VCS_COMMIT: &str = "org.cuelang.vcs-commit";
pub const ANNOTATION_VCS_COMMIT_TIME: &str = "org.cuelang.vcs-commit-time";

const SCRATCH_CONFIG: &[u8] = b"{}";

// Manifests are small; anything bigger than this is not a module.
const MAX_MANIFEST_SIZE: u64 = 1 << 20;

const TAG_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

/// Validates that an OCI manifest has the exact shape of a module
/// version: the module config type on a scratch blob and the zip and
/// module-file layers, in that order.
pub fn check_module_manifest(m: &OciManifest) -> Result<()> {
    if m.schema_version != 2 {
        anyhow::bail!("unexpected manifest schema version {}", m.schema_version);
    }
    if m.config.media_type != MODULE_ARTIFACT_TYPE {
        anyhow::bail!(
            "unexpected config media type {:?}; want {:?}",
            m.config.media_type,
            MODULE_ARTIFACT_TYPE
        );
    }
    if m.layers.len() != 2 {
        anyhow::bail!("expected 2 layers in module manifest, found {}", m.layers.len());
    }
    if m.layers[0].media_type != ZIP_MEDIA_TYPE {
        anyhow::bail!(
            "unexpected media type {:?} on layer 0; want {:?}",
            m.layers[0].media_type,
            ZIP_MEDIA_TYPE
        );
    }
    if m.layers[1].media_type != MODULE_FILE_MEDIA_TYPE {
        anyhow::bail!(
            "unexpected media type {:?} on layer 1; want {:?}",
            m.layers[1].media_type,
            MODULE_FILE_MEDIA_TYPE
        );
    }
    if let Some(annotations) = &m.annotations {
        for (k, v) in annotations {
            if v.is_empty() {
                anyhow::bail!("empty value for annotation {:?}", k);
            }
        }
    }
    Ok(())
}

/// A module version packaged for pushing: the manifest plus every blob
/// it references, keyed by digest.
#[derive(Debug)]
pub struct ModuleArtifact {
    pub manifest: OciManifest,
    pub manifest_json: Vec<u8>,
    pub blobs: Vec<(String, Vec<u8>)>,
}

/// Builds the OCI representation of one module version from its zip
/// archive and manifest text. All annotation values must be non-empty.
pub fn build_module_manifest(
    zip_data: Vec<u8>,
    module_file: Vec<u8>,
    annotations: BTreeMap<String, String>,
) -> Result<ModuleArtifact> {
    for (k, v) in &annotations {
        if v.is_empty() {
            anyhow::bail!("empty value for annotation {:?}", k);
        }
    }
    let manifest = OciManifest {
        schema_version: 2,
        media_type: Some(MANIFEST_MEDIA_TYPE.to_string()),
        config: Descriptor {
            media_type: MODULE_ARTIFACT_TYPE.to_string(),
            digest: digest_of(SCRATCH_CONFIG),
            size: SCRATCH_CONFIG.len() as u64,
            annotations: None,
        },
        layers: vec![
            Descriptor {
                media_type: ZIP_MEDIA_TYPE.to_string(),
                digest: digest_of(&zip_data),
                size: zip_data.len() as u64,
                annotations: None,
            },
            Descriptor {
                media_type: MODULE_FILE_MEDIA_TYPE.to_string(),
                digest: digest_of(&module_file),
                size: module_file.len() as u64,
                annotations: None,
            },
        ],
        annotations: if annotations.is_empty() {
            None
        } else {
            Some(annotations)
        },
    };
    let manifest_json = serde_json::to_vec(&manifest)?;
    let blobs = vec![
        (digest_of(SCRATCH_CONFIG), SCRATCH_CONFIG.to_vec()),
        (manifest.layers[0].digest.clone(), zip_data),
        (manifest.layers[1].digest.clone(), module_file),
    ];
    Ok(ModuleArtifact {
        manifest,
        manifest_json,
        blobs,
    })
}

/// VCS metadata annotations for a published module version.
pub fn vcs_annotations(
    vcs_type: &str,
    commit: &str,
    commit_time: DateTime<Utc>,
) -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert(ANNOTATION_VCS_TYPE.to_string(), vcs_type.to_string());
    m.insert(ANNOTATION_VCS_COMMIT.to_string(), commit.to_string());
    m.insert(
        ANNOTATION_VCS_COMMIT_TIME.to_string(),
        commit_time.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    m
}

#[derive(Deserialize)]
struct TagList {
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct RegistryErrors {
    errors: Option<Vec<RegistryError>>,
}

#[derive(Deserialize)]
struct RegistryError {
    code: Option<String>,
}

/// An OCI registry endpoint serving module repositories.
pub struct OciClient {
    agent: ureq::Agent,
    base_url: String,
    repo_prefix: String,
    tag_prefix: String,
}

impl OciClient {
    /// A client for the registry at `base_url` (scheme and host, no
    /// trailing slash).
    pub fn new(base_url: impl Into<String>) -> OciClient {
        OciClient {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(60))
                .build(),
            base_url: base_url.into(),
            repo_prefix: String::new(),
            tag_prefix: String::new(),
        }
    }

    /// Nests every module repository under a path prefix.
    pub fn with_repo_prefix(mut self, prefix: impl Into<String>) -> OciClient {
        self.repo_prefix = prefix.into();
        self
    }

    /// Expects version tags behind a fixed prefix.
    pub fn with_tag_prefix(mut self, prefix: impl Into<String>) -> OciClient {
        self.tag_prefix = prefix.into();
        self
    }

    fn repo_for(&self, base_path: &str) -> Result<String> {
        path::check_base_path(base_path)?;
        let escaped = path::escape_path(base_path)?;
        if self.repo_prefix.is_empty() {
            Ok(escaped)
        } else {
            Ok(format!("{}/{}", self.repo_prefix, escaped))
        }
    }

    fn tag_for(&self, vers: &str) -> String {
        format!("{}{}", self.tag_prefix, vers)
    }

    fn version_from_tag<'a>(&self, tag: &'a str) -> Option<&'a str> {
        let v = tag.strip_prefix(self.tag_prefix.as_str())?;
        if version::is_canonical(v) {
            Some(v)
        } else {
            None
        }
    }

    // Maps a registry response to the structured error taxonomy:
    // plain 404, a 403 carrying no explicit DENIED code, and the
    // registry's own name-unknown codes all mean "not found".
    fn call(&self, what: &str, req: ureq::Request) -> Result<ureq::Response> {
        match req.call() {
            Ok(resp) => Ok(resp),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                let codes: Vec<String> = serde_json::from_str::<RegistryErrors>(&body)
                    .ok()
                    .and_then(|e| e.errors)
                    .map(|errs| errs.into_iter().filter_map(|e| e.code).collect())
                    .unwrap_or_default();
                let not_found = match code {
                    404 => true,
                    403 => !codes.iter().any(|c| c == "DENIED"),
                    _ => codes.iter().any(|c| c == "NAME_UNKNOWN" || c == "NAME_INVALID"),
                };
                if not_found {
                    Err(NotFound {
                        what: what.to_string(),
                    }
                    .into())
                } else {
                    Err(anyhow::anyhow!(
                        "registry responded with status {} for {}: {}",
                        code,
                        what,
                        body.trim()
                    ))
                }
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("cannot reach registry for {}", what))),
        }
    }

    pub fn get_manifest(&self, cancel: &Cancellation, repo: &str, tag: &str) -> Result<OciManifest> {
        cancel.check()?;
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repo, tag);
        let what = format!("module {}:{}", repo, tag);
        let resp = self.call(
            &what,
            self.agent.get(&url).set("Accept", MANIFEST_MEDIA_TYPE),
        )?;
        let mut body = String::new();
        resp.into_reader()
            .take(MAX_MANIFEST_SIZE)
            .read_to_string(&mut body)
            .with_context(|| format!("cannot read manifest for {}", what))?;
        let manifest: OciManifest = serde_json::from_str(&body)
            .with_context(|| format!("invalid manifest JSON for {}", what))?;
        Ok(manifest)
    }

    /// Fetches a blob, verifying its digest and declared size, and
    /// refusing anything above `limit` bytes.
    pub fn get_blob(
        &self,
        cancel: &Cancellation,
        repo: &str,
        desc: &Descriptor,
        limit: u64,
        out: &mut dyn Write,
    ) -> Result<u64> {
        cancel.check()?;
        if desc.size > limit {
            anyhow::bail!(
                "blob {} has size {} greater than limit {}",
                desc.digest,
                desc.size,
                limit
            );
        }
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, repo, desc.digest);
        let what = format!("blob {} in {}", desc.digest, repo);
        let resp = self.call(&what, self.agent.get(&url))?;
        let mut reader = resp.into_reader().take(desc.size + 1);
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut total: u64 = 0;
        loop {
            let n = reader.read(&mut buf).with_context(|| format!("cannot read {}", what))?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if total > desc.size {
                anyhow::bail!("{} is larger than its declared size {}", what, desc.size);
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])
                .with_context(|| format!("cannot write {}", what))?;
        }
        if total != desc.size {
            anyhow::bail!(
                "{} has size {}, declared {}",
                what,
                total,
                desc.size
            );
        }
        let got = format!("sha256:{:x}", hasher.finalize());
        if got != desc.digest {
            anyhow::bail!("{} digest mismatch: got {}", what, got);
        }
        Ok(total)
    }

    pub fn list_tags(&self, cancel: &Cancellation, repo: &str) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut last: Option<String> = None;
        loop {
            cancel.check()?;
            let mut url = format!(
                "{}/v2/{}/tags/list?n={}",
                self.base_url, repo, TAG_PAGE_SIZE
            );
            if let Some(last) = &last {
                url.push_str("&last=");
                url.push_str(last);
            }
            let what = format!("tags for {}", repo);
            let resp = self.call(&what, self.agent.get(&url))?;
            let page: TagList = resp
                .into_json()
                .with_context(|| format!("invalid tag list JSON for {}", repo))?;
            let page = page.tags.unwrap_or_default();
            let n = page.len();
            tags.extend(page);
            if n < TAG_PAGE_SIZE {
                return Ok(tags);
            }
            last = tags.last().cloned();
        }
    }

    /// Retrieves and shape-checks the module manifest for one version.
    pub fn get_module(&self, cancel: &Cancellation, m: &Version) -> Result<OciManifest> {
        let repo = self.repo_for(m.base_path())?;
        let manifest = self.get_manifest(cancel, &repo, &self.tag_for(m.version()))?;
        check_module_manifest(&manifest)
            .with_context(|| format!("module {} has an invalid registry manifest", m))?;
        Ok(manifest)
    }

    // Two-step OCI blob upload: an empty POST yields an upload
    // location, the PUT to it carries the bytes and the digest.
    fn put_blob(&self, cancel: &Cancellation, repo: &str, digest: &str, data: &[u8]) -> Result<()> {
        cancel.check()?;
        let url = format!("{}/v2/{}/blobs/uploads/", self.base_url, repo);
        let what = format!("blob upload for {}", repo);
        let resp = self.call(&what, self.agent.post(&url))?;
        let location = resp
            .header("Location")
            .ok_or_else(|| anyhow::anyhow!("registry returned no upload location for {}", repo))?
            .to_string();
        let sep = if location.contains('?') { '&' } else { '?' };
        let upload_url = if location.starts_with("http://") || location.starts_with("https://") {
            format!("{}{}digest={}", location, sep, digest)
        } else {
            format!("{}{}{}digest={}", self.base_url, location, sep, digest)
        };
        let req = self
            .agent
            .put(&upload_url)
            .set("Content-Type", "application/octet-stream");
        match req.send_bytes(data) {
            Ok(_) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("cannot upload blob {} to {}", digest, repo))),
        }
    }

    /// Publishes one module version: checks the archive, lifts its
    /// manifest text out, uploads the blobs and tags the manifest.
    pub fn put_module(&self, cancel: &Cancellation, m: &Version, zip_data: Vec<u8>) -> Result<()> {
        let cf = modzip::check_zip(
            m,
            std::io::Cursor::new(&zip_data),
            zip_data.len() as u64,
        )?;
        cf.result()
            .with_context(|| format!("cannot publish invalid module zip for {}", m))?;
        let module_file = modzip::read_module_file(std::io::Cursor::new(&zip_data))?;
        let art = build_module_manifest(zip_data, module_file, BTreeMap::new())?;

        let repo = self.repo_for(m.base_path())?;
        for (digest, data) in &art.blobs {
            self.put_blob(cancel, &repo, digest, data)?;
        }
        cancel.check()?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url,
            repo,
            self.tag_for(m.version())
        );
        let req = self
            .agent
            .put(&url)
            .set("Content-Type", MANIFEST_MEDIA_TYPE);
        match req.send_bytes(&art.manifest_json) {
            Ok(_) => Ok(()),
            Err(e) => {
                Err(anyhow::Error::new(e).context(format!("cannot publish manifest for {}", m)))
            }
        }
    }
}

impl Remote for OciClient {
    fn module_file(&self, cancel: &Cancellation, m: &Version) -> Result<Vec<u8>> {
        let repo = self.repo_for(m.base_path())?;
        let manifest = self.get_module(cancel, m)?;
        let mut out = Vec::new();
        self.get_blob(cancel, &repo, &manifest.layers[1], modzip::MAX_CUE_MOD, &mut out)?;
        Ok(out)
    }

    fn module_zip(&self, cancel: &Cancellation, m: &Version, out: &mut dyn Write) -> Result<u64> {
        let repo = self.repo_for(m.base_path())?;
        let manifest = self.get_module(cancel, m)?;
        self.get_blob(cancel, &repo, &manifest.layers[0], modzip::MAX_ZIP_FILE, out)
    }

    fn module_versions(&self, cancel: &Cancellation, mpath: &str) -> Result<Vec<String>> {
        let (base, major) = match path::split_path_version(mpath) {
            Some((base, major)) => (base, Some(major)),
            None => (mpath, None),
        };
        let repo = self.repo_for(base)?;
        let tags = self.list_tags(cancel, &repo)?;
        let mut versions: Vec<String> = tags
            .iter()
            .filter_map(|t| self.version_from_tag(t))
            .filter(|v| match major {
                Some(mj) => version::major(v).as_deref() == Some(mj),
                None => true,
            })
            .map(str::to_string)
            .collect();
        version::sort_versions(&mut versions);
        versions.dedup();
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_artifact() -> ModuleArtifact {
        build_module_manifest(
            b"zipdata".to_vec(),
            b"module: \"foo.com/bar@v0\"\n".to_vec(),
            BTreeMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn manifest_shape_round_trips() {
        let art = module_artifact();
        check_module_manifest(&art.manifest).unwrap();
        let parsed: OciManifest = serde_json::from_slice(&art.manifest_json).unwrap();
        assert_eq!(parsed, art.manifest);
        assert_eq!(parsed.config.digest, digest_of(b"{}"));
    }

    #[test]
    fn manifest_shape_is_strict() {
        let mut m = module_artifact().manifest;
        m.layers.push(m.layers[0].clone());
        assert!(check_module_manifest(&m).is_err());

        let mut m = module_artifact().manifest;
        m.layers.truncate(1);
        assert!(check_module_manifest(&m).is_err());

        let mut m = module_artifact().manifest;
        m.config.media_type = "application/json".to_string();
        assert!(check_module_manifest(&m).is_err());

        let mut m = module_artifact().manifest;
        m.layers[1].media_type = ZIP_MEDIA_TYPE.to_string();
        assert!(check_module_manifest(&m).is_err());
    }

    #[test]
    fn annotations_must_be_non_empty() {
        let mut ann = BTreeMap::new();
        ann.insert(ANNOTATION_VCS_COMMIT.to_string(), String::new());
        assert!(build_module_manifest(vec![1], vec![2], ann).is_err());

        let ann = vcs_annotations("git", "abc123", DateTime::<Utc>::from_timestamp(0, 0).unwrap());
        assert!(build_module_manifest(vec![1], vec![2], ann).is_ok());
    }

    #[test]
    fn fetches_module_blobs_over_http() {
        let mut server = mockito::Server::new();
        let art = module_artifact();
        let zip_digest = art.manifest.layers[0].digest.clone();

        let _m1 = server
            .mock("GET", "/v2/foo.com/bar/manifests/v0.1.0")
            .with_status(200)
            .with_body(art.manifest_json.clone())
            .create();
        let _m2 = server
            .mock(
                "GET",
                format!("/v2/foo.com/bar/blobs/{}", zip_digest).as_str(),
            )
            .with_status(200)
            .with_body(b"zipdata".to_vec())
            .create();

        let client = OciClient::new(server.url());
        let cancel = Cancellation::new();
        let m = Version::must_parse("foo.com/bar@v0.1.0");
        let mut out = Vec::new();
        let n = client.module_zip(&cancel, &m, &mut out).unwrap();
        assert_eq!(n, 7);
        assert_eq!(out, b"zipdata");
    }

    #[test]
    fn maps_missing_modules_to_not_found() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/v2/foo.com/bar/manifests/v0.1.0")
            .with_status(404)
            .with_body(r#"{"errors":[{"code":"MANIFEST_UNKNOWN"}]}"#)
            .create();
        let client = OciClient::new(server.url());
        let m = Version::must_parse("foo.com/bar@v0.1.0");
        let err = client.get_module(&Cancellation::new(), &m).unwrap_err();
        assert!(crate::errors::is_not_found(&err), "{:#}", err);
    }

    #[test]
    fn publishes_a_module() {
        use crate::modzip;
        use std::io::Cursor;

        struct MemFile(&'static str, &'static [u8]);
        impl modzip::ArchiveFile for MemFile {
            fn path(&self) -> String {
                self.0.to_string()
            }
            fn size(&self) -> Result<u64> {
                Ok(self.1.len() as u64)
            }
            fn open(&self) -> Result<Box<dyn Read>> {
                Ok(Box::new(Cursor::new(self.1.to_vec())))
            }
        }

        let files = [
            MemFile("cue.mod/module.cue", b"module: \"foo.com/bar@v0\"\n"),
            MemFile("x.cue", b"package x\n"),
        ];
        let m = Version::must_parse("foo.com/bar@v0.1.0");
        let mut zip = Cursor::new(Vec::new());
        modzip::create(&mut zip, &m, &files).unwrap();

        let mut server = mockito::Server::new();
        let _uploads = server
            .mock("POST", "/v2/foo.com/bar/blobs/uploads/")
            .with_status(202)
            .with_header("Location", "/v2/foo.com/bar/blobs/uploads/session1")
            .expect(3)
            .create();
        let _blob_put = server
            .mock("PUT", "/v2/foo.com/bar/blobs/uploads/session1")
            .match_query(mockito::Matcher::Any)
            .with_status(201)
            .expect(3)
            .create();
        let _manifest_put = server
            .mock("PUT", "/v2/foo.com/bar/manifests/v0.1.0")
            .match_header("Content-Type", MANIFEST_MEDIA_TYPE)
            .with_status(201)
            .create();

        let client = OciClient::new(server.url());
        client
            .put_module(&Cancellation::new(), &m, zip.into_inner())
            .unwrap();
        _uploads.assert();
        _blob_put.assert();
        _manifest_put.assert();
    }

    #[test]
    fn lists_and_filters_versions() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/v2/foo.com/bar/tags/list")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"tags":["v0.1.0","v0.2.0","v1.0.0","latest","v0.3"]}"#)
            .create();
        let client = OciClient::new(server.url());
        let cancel = Cancellation::new();
        let vs = client
            .module_versions(&cancel, "foo.com/bar@v0")
            .unwrap();
        assert_eq!(vs, vec!["v0.1.0", "v0.2.0"]);
        let all = client.module_versions(&cancel, "foo.com/bar").unwrap();
        assert_eq!(all, vec!["v0.1.0", "v0.2.0", "v1.0.0"]);
    }
}
