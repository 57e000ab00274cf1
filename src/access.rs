// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Filesystem layout of a table under its data root.
//!
//! ```text
//! <root>/
//!   <partition>_<min>_<max>_<level>[_<mutation>]/   one directory per part
//!   mutation_<version>.txt                          one file per mutation
//!   tmp_mutation_<version>.txt                      staging, removed on load
//!   tmp_*, delete_tmp_*, tmp-fetch_*                staging directories
//!   detached/                                       detached parts
//!   deduplication_logs/                             dedup index files
//! ```
//!
//! Only directory-level operations live here; part payload formats are the
//! concern of other layers. Every part directory carries a `meta.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use snafu::ResultExt;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{IoSnafu, Result, SerdeJsonSnafu};
use crate::part::info::PartInfo;
use crate::part::PartMeta;

pub const DETACHED_DIR_NAME: &str = "detached";
pub const DEDUP_LOGS_DIR_NAME: &str = "deduplication_logs";
pub const PART_META_FILE: &str = "meta.json";

/// Staging-directory prefixes swept on startup and by periodic cleanup.
pub const TMP_DIR_PREFIXES: [&str; 3] = ["tmp_", "delete_tmp_", "tmp-fetch_"];

/// All I/O of one table goes through its access layer.
#[derive(Debug)]
pub struct AccessLayer {
    root: PathBuf,
}

pub type AccessLayerRef = Arc<AccessLayer>;

impl AccessLayer {
    pub fn new(root: impl Into<PathBuf>) -> AccessLayer {
        AccessLayer { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn part_path(&self, dir_name: &str) -> PathBuf {
        self.root.join(dir_name)
    }

    pub fn detached_path(&self, dir_name: &str) -> PathBuf {
        self.root.join(DETACHED_DIR_NAME).join(dir_name)
    }

    /// Creates the root layout. Idempotent.
    pub async fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.root.join(DETACHED_DIR_NAME),
            self.root.join(DEDUP_LOGS_DIR_NAME),
        ] {
            fs::create_dir_all(&dir).await.context(IoSnafu {
                path: dir.display().to_string(),
            })?;
        }
        Ok(())
    }

    /// Stages a part directory under `tmp_<prefix><name>` and writes its
    /// metadata. The caller later renames it into place with
    /// [commit_staged](Self::commit_staged) or removes it on rollback.
    pub async fn stage_part(&self, tmp_prefix: &str, meta: &PartMeta) -> Result<PathBuf> {
        let tmp = self.root.join(format!("{tmp_prefix}{}", meta.name()));
        fs::create_dir_all(&tmp).await.context(IoSnafu {
            path: tmp.display().to_string(),
        })?;
        self.write_part_meta(&tmp, meta).await?;
        Ok(tmp)
    }

    /// Renames a staged directory to the final part directory.
    pub async fn commit_staged(&self, staged: &Path, info: &PartInfo) -> Result<PathBuf> {
        let dst = self.part_path(&info.dir_name());
        fs::rename(staged, &dst).await.context(IoSnafu {
            path: dst.display().to_string(),
        })?;
        Ok(dst)
    }

    /// Removes a staged directory, e.g. on rollback.
    pub async fn remove_staged(&self, staged: &Path) {
        if let Err(e) = fs::remove_dir_all(staged).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staged dir {}: {}", staged.display(), e);
            }
        }
    }

    pub async fn write_part_meta(&self, part_dir: &Path, meta: &PartMeta) -> Result<()> {
        let path = part_dir.join(PART_META_FILE);
        let body = serde_json::to_vec(meta).context(SerdeJsonSnafu)?;
        fs::write(&path, body).await.context(IoSnafu {
            path: path.display().to_string(),
        })
    }

    pub async fn read_part_meta(&self, part_dir: &Path) -> Result<PartMeta> {
        let path = part_dir.join(PART_META_FILE);
        let body = fs::read(&path).await.context(IoSnafu {
            path: path.display().to_string(),
        })?;
        serde_json::from_slice(&body).context(SerdeJsonSnafu)
    }

    /// Removes a part directory from the filesystem.
    pub async fn remove_part_dir(&self, dir_name: &str) -> Result<()> {
        let path = self.part_path(dir_name);
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(IoSnafu {
                path: path.display().to_string(),
            }),
        }
    }

    /// Clones the files of `src_dir` into `dst_dir`, hard-linking when
    /// possible and `copy` is false.
    async fn clone_dir(&self, src_dir: &Path, dst_dir: &Path, copy: bool) -> Result<()> {
        fs::create_dir_all(dst_dir).await.context(IoSnafu {
            path: dst_dir.display().to_string(),
        })?;
        let mut entries = fs::read_dir(src_dir).await.context(IoSnafu {
            path: src_dir.display().to_string(),
        })?;
        while let Some(entry) = entries.next_entry().await.context(IoSnafu {
            path: src_dir.display().to_string(),
        })? {
            let src = entry.path();
            let dst = dst_dir.join(entry.file_name());
            if copy {
                fs::copy(&src, &dst).await.context(IoSnafu {
                    path: dst.display().to_string(),
                })?;
            } else if let Err(e) = fs::hard_link(&src, &dst).await {
                // Cross-device links fall back to copies.
                debug!("Hardlink {} failed ({}), copying instead", dst.display(), e);
                fs::copy(&src, &dst).await.context(IoSnafu {
                    path: dst.display().to_string(),
                })?;
            }
        }
        Ok(())
    }

    /// Hard-links a part directory into `detached/`.
    pub async fn detach_part(&self, dir_name: &str) -> Result<()> {
        let src = self.part_path(dir_name);
        let dst = self.detached_path(dir_name);
        info!("Detaching {}", dir_name);
        self.clone_dir(&src, &dst, false).await
    }

    /// Clones a part from another table's layer into a staging directory of
    /// this table, rewriting the metadata to `dst_meta`.
    pub async fn clone_part_from(
        &self,
        src: &AccessLayer,
        src_dir_name: &str,
        tmp_prefix: &str,
        dst_meta: &PartMeta,
        copy: bool,
    ) -> Result<PathBuf> {
        let src_dir = src.part_path(src_dir_name);
        let tmp = self.root.join(format!("{tmp_prefix}{}", dst_meta.name()));
        self.clone_dir(&src_dir, &tmp, copy).await?;
        self.write_part_meta(&tmp, dst_meta).await?;
        Ok(tmp)
    }

    /// Restores a detached part into a staging directory.
    pub async fn clone_detached(
        &self,
        src_dir_name: &str,
        tmp_prefix: &str,
        dst_meta: &PartMeta,
    ) -> Result<PathBuf> {
        let src_dir = self.detached_path(src_dir_name);
        let tmp = self.root.join(format!("{tmp_prefix}{}", dst_meta.name()));
        self.clone_dir(&src_dir, &tmp, false).await?;
        self.write_part_meta(&tmp, dst_meta).await?;
        Ok(tmp)
    }

    /// Part directories currently on disk, in name order. Staging
    /// directories, service directories and mutation files are skipped.
    pub async fn list_part_dirs(&self) -> Result<Vec<(PartInfo, PathBuf)>> {
        let mut result = Vec::new();
        let mut entries = fs::read_dir(&self.root).await.context(IoSnafu {
            path: self.root.display().to_string(),
        })?;
        while let Some(entry) = entries.next_entry().await.context(IoSnafu {
            path: self.root.display().to_string(),
        })? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == DETACHED_DIR_NAME
                || name == DEDUP_LOGS_DIR_NAME
                || TMP_DIR_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
            {
                continue;
            }
            match PartInfo::parse_dir_name(&name) {
                Ok(info) => result.push((info, entry.path())),
                Err(_) => warn!("Unexpected directory {} in data root, ignoring", name),
            }
        }
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }

    /// Names of detached part directories.
    pub async fn list_detached(&self) -> Result<Vec<PartInfo>> {
        let dir = self.root.join(DETACHED_DIR_NAME);
        let mut result = Vec::new();
        let mut entries = fs::read_dir(&dir).await.context(IoSnafu {
            path: dir.display().to_string(),
        })?;
        while let Some(entry) = entries.next_entry().await.context(IoSnafu {
            path: dir.display().to_string(),
        })? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(info) = PartInfo::parse_dir_name(&name) {
                result.push(info);
            }
        }
        result.sort();
        Ok(result)
    }

    /// Removes staging directories older than `lifetime`. Returns how many
    /// were removed.
    pub async fn clear_stale_tmp_dirs(&self, lifetime: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await.context(IoSnafu {
            path: self.root.display().to_string(),
        })?;
        while let Some(entry) = entries.next_entry().await.context(IoSnafu {
            path: self.root.display().to_string(),
        })? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !TMP_DIR_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
                continue;
            }
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let stale = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => now
                    .duration_since(modified)
                    .map(|age| age >= lifetime)
                    .unwrap_or(false),
                Err(_) => false,
            };
            if stale {
                info!("Removing stale temporary directory {}", name);
                fs::remove_dir_all(entry.path()).await.context(IoSnafu {
                    path: entry.path().display().to_string(),
                })?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
