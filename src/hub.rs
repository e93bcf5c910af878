//! HuggingFace Hub asset resolution.
//!
//! A [`RemoteAssetSpec`] names a repository and a set of fnmatch-style file
//! patterns; [`AssetResolver::resolve`] turns it into a local snapshot
//! directory, downloading only what the cache does not already hold.
//!
//! ```rust,ignore
//! use xtts_clone::hub::{AssetResolver, HubSource, RemoteAssetSpec};
//!
//! let resolver = AssetResolver::new(HubSource::new(None, false)?);
//! let bundle = resolver.resolve(&RemoteAssetSpec::base_model("coqui/XTTS-v2", None))?;
//! println!("model files under {}", bundle.root.display());
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Cache, Repo, RepoType};
use thiserror::Error;

/// Default repositories used by the service.
pub mod repo_ids {
    /// Pretrained multilingual base model
    pub const BASE_MODEL: &str = "coqui/XTTS-v2";

    /// Fine-tuned checkpoint weights
    pub const CHECKPOINT: &str = "jonorl/pepe";

    /// Reference speaker recording
    pub const SPEAKER: &str = "jonorl/pepe";
}

/// Why an asset set could not be made available locally.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("no file patterns given for {repo}")]
    NoPatterns { repo: String },

    #[error("failed to list files in {repo}: {reason}")]
    Listing { repo: String, reason: String },

    #[error("failed to download {file} from {repo}: {reason}")]
    Download {
        repo: String,
        file: String,
        reason: String,
    },

    #[error("no files in {repo} match {}", patterns.join(", "))]
    NoMatch { repo: String, patterns: Vec<String> },

    #[error("{file} from {repo} is not in the local cache and the hub is offline")]
    NotCached { repo: String, file: String },
}

/// What to fetch: repository, optional access token, and file patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAssetSpec {
    pub repo_id: String,
    pub token: Option<String>,
    pub patterns: Vec<String>,
    /// Branch, tag or commit; `main` when absent
    pub revision: Option<String>,
}

impl RemoteAssetSpec {
    pub fn new(repo_id: impl Into<String>, patterns: &[&str], token: Option<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            token,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            revision: None,
        }
    }

    /// Config, tokenizer vocabulary and auxiliary weights.
    pub fn base_model(repo_id: impl Into<String>, token: Option<String>) -> Self {
        Self::new(repo_id, &["*.json", "vocab.json", "*.pth"], token)
    }

    /// Fine-tuned weights.
    pub fn checkpoint(repo_id: impl Into<String>, token: Option<String>) -> Self {
        Self::new(repo_id, &["*.pth"], token)
    }

    /// Reference voice recordings.
    pub fn speaker(repo_id: impl Into<String>, token: Option<String>) -> Self {
        Self::new(repo_id, &["*.wav"], token)
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    fn revision(&self) -> &str {
        self.revision.as_deref().unwrap_or("main")
    }

    fn repo(&self) -> Repo {
        Repo::with_revision(
            self.repo_id.clone(),
            RepoType::Model,
            self.revision().to_string(),
        )
    }

    /// True when `file` matches at least one pattern.
    pub fn matches(&self, file: &str) -> bool {
        self.patterns.iter().any(|p| glob_match(p, file))
    }
}

/// Local snapshot of the matched files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAssetBundle {
    /// Snapshot directory; relative repo paths resolve against it
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Where repository listings and file bytes come from.
pub trait AssetSource {
    /// Repo-relative paths of every file at the requested revision.
    fn list(&self, spec: &RemoteAssetSpec) -> Result<Vec<String>, RetrievalError>;

    /// Local path when `file` is already cached.
    fn cached(&self, spec: &RemoteAssetSpec, file: &str) -> Option<PathBuf>;

    /// Download `file` into the cache and return its local path.
    fn fetch(&self, spec: &RemoteAssetSpec, file: &str) -> Result<PathBuf, RetrievalError>;
}

/// Resolves asset specs against a source, preferring cached files.
pub struct AssetResolver<S> {
    source: S,
}

impl<S: AssetSource> AssetResolver<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Make every file matching `spec` available locally.
    ///
    /// Idempotent: once the cache is warm no further downloads happen and the
    /// same root is returned.
    pub fn resolve(&self, spec: &RemoteAssetSpec) -> Result<LocalAssetBundle, RetrievalError> {
        if spec.patterns.is_empty() {
            return Err(RetrievalError::NoPatterns {
                repo: spec.repo_id.clone(),
            });
        }

        let mut wanted: Vec<String> = self
            .source
            .list(spec)?
            .into_iter()
            .filter(|f| spec.matches(f))
            .collect();
        wanted.sort();
        wanted.dedup();

        if wanted.is_empty() {
            return Err(RetrievalError::NoMatch {
                repo: spec.repo_id.clone(),
                patterns: spec.patterns.clone(),
            });
        }

        tracing::info!(
            "Resolving {} file(s) from {} ({})",
            wanted.len(),
            spec.repo_id,
            spec.patterns.join(", ")
        );

        let mut files = Vec::with_capacity(wanted.len());
        let mut downloaded = 0usize;
        for file in &wanted {
            let path = match self.source.cached(spec, file) {
                Some(path) => {
                    tracing::debug!("  cached: {}", file);
                    path
                }
                None => {
                    tracing::info!("  downloading: {}", file);
                    downloaded += 1;
                    self.source.fetch(spec, file)?
                }
            };
            files.push(path);
        }

        let root = snapshot_root(&files[0], &wanted[0]);
        tracing::info!(
            "{} ready at {} ({} downloaded)",
            spec.repo_id,
            root.display(),
            downloaded
        );

        Ok(LocalAssetBundle { root, files })
    }
}

/// Strip the repo-relative components of `file` from `path`.
fn snapshot_root(path: &Path, file: &str) -> PathBuf {
    let depth = file.split('/').filter(|c| !c.is_empty()).count();
    let mut root = path.to_path_buf();
    for _ in 0..depth {
        if !root.pop() {
            break;
        }
    }
    root
}

/// Live HuggingFace Hub through `hf_hub`'s blocking client, sharing the
/// standard cache layout.
pub struct HubSource {
    cache: Cache,
    /// Client used when no per-spec token is given
    api: Option<Api>,
    default_token: Option<String>,
    offline: bool,
}

impl HubSource {
    /// `offline` disables all network access (`HF_HUB_OFFLINE=1`).
    pub fn new(token: Option<String>, offline: bool) -> anyhow::Result<Self> {
        Self::with_cache(Cache::from_env(), token, offline)
    }

    pub fn with_cache(cache: Cache, token: Option<String>, offline: bool) -> anyhow::Result<Self> {
        let api = if offline {
            None
        } else {
            Some(Self::build_api(&cache, token.clone()).context("Failed to create HuggingFace API")?)
        };
        Ok(Self {
            cache,
            api,
            default_token: token,
            offline,
        })
    }

    fn build_api(cache: &Cache, token: Option<String>) -> Result<Api, hf_hub::api::sync::ApiError> {
        ApiBuilder::from_cache(cache.clone())
            .with_token(token)
            .with_progress(false)
            .build()
    }

    fn api_for(&self, spec: &RemoteAssetSpec) -> Result<Api, RetrievalError> {
        let offline = || RetrievalError::Listing {
            repo: spec.repo_id.clone(),
            reason: "hub is offline".to_string(),
        };
        let default_api = self.api.as_ref().ok_or_else(offline)?;
        match &spec.token {
            Some(token) if self.default_token.as_ref() != Some(token) => {
                Self::build_api(&self.cache, Some(token.clone())).map_err(|e| {
                    RetrievalError::Listing {
                        repo: spec.repo_id.clone(),
                        reason: e.to_string(),
                    }
                })
            }
            _ => Ok(default_api.clone()),
        }
    }

    /// Files present in the cached snapshot of the requested revision.
    fn list_cached(&self, spec: &RemoteAssetSpec) -> Result<Vec<String>, RetrievalError> {
        let repo_dir = self.cache.path().join(spec.repo().folder_name());
        let not_cached = || RetrievalError::NotCached {
            repo: spec.repo_id.clone(),
            file: spec.patterns.join(", "),
        };

        let revision = spec.revision();
        let commit = std::fs::read_to_string(repo_dir.join("refs").join(revision))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| revision.to_string());
        let snapshot = repo_dir.join("snapshots").join(commit);
        if !snapshot.is_dir() {
            return Err(not_cached());
        }

        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&snapshot).sort_by_file_name() {
            let Ok(entry) = entry else { continue };
            if entry.file_type().is_dir() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&snapshot) {
                let parts: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                files.push(parts.join("/"));
            }
        }
        Ok(files)
    }
}

impl AssetSource for HubSource {
    fn list(&self, spec: &RemoteAssetSpec) -> Result<Vec<String>, RetrievalError> {
        if self.offline {
            return self.list_cached(spec);
        }
        let info = self
            .api_for(spec)?
            .repo(spec.repo())
            .info()
            .map_err(|e| RetrievalError::Listing {
                repo: spec.repo_id.clone(),
                reason: e.to_string(),
            })?;
        Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
    }

    fn cached(&self, spec: &RemoteAssetSpec, file: &str) -> Option<PathBuf> {
        self.cache.repo(spec.repo()).get(file)
    }

    fn fetch(&self, spec: &RemoteAssetSpec, file: &str) -> Result<PathBuf, RetrievalError> {
        if self.offline {
            return Err(RetrievalError::NotCached {
                repo: spec.repo_id.clone(),
                file: file.to_string(),
            });
        }
        self.api_for(spec)?
            .repo(spec.repo())
            .download(file)
            .map_err(|e| RetrievalError::Download {
                repo: spec.repo_id.clone(),
                file: file.to_string(),
                reason: e.to_string(),
            })
    }
}

/// fnmatch-style matching: `*` (any run, including `/`), `?`, and `[...]`
/// classes with `!` negation and ranges.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();

    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ni));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ni += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(&p, pi, n[ni]) {
                        if matched {
                            pi = next;
                            ni += 1;
                            continue;
                        }
                    } else if n[ni] == '[' {
                        // Unterminated class is a literal '['
                        pi += 1;
                        ni += 1;
                        continue;
                    }
                }
                c if c == n[ni] => {
                    pi += 1;
                    ni += 1;
                    continue;
                }
                _ => {}
            }
        }
        // Mismatch: let the last star absorb one more character
        match star {
            Some((sp, sn)) => {
                pi = sp + 1;
                ni = sn + 1;
                star = Some((sp, sn + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

/// Match `c` against the class starting at `p[start] == '['`. Returns
/// `(matched, index after ']')`, or `None` when the class is unterminated.
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = matches!(p.get(i), Some('!'));
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < p.len() {
        if p[i] == ']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;
        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            if p[i] <= c && c <= p[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if p[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    None
}
