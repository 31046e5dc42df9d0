// Filesystem-rooted content store. Artifact directories are committed with a
// tmp-write / fsync / rename protocol and a `.committed` sentinel; recovery
// deletes anything that never reached the sentinel.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use scrivener_common::{content_hash, Reference};

use crate::error::{ArchiveError, Result};
use crate::fetch::FetchedDocument;
use crate::verify::Verdict;

const COMMIT_SENTINEL: &str = ".committed";

/// What commit() produced: where the artifact lives and its current identity.
#[derive(Debug, Clone)]
pub struct CommittedDir {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_count: u64,
}

#[derive(Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory an artifact for this reference lands in. Human-browsable;
    /// identity lives in the index, not the path.
    pub fn artifact_dir(&self, reference: &Reference, now: DateTime<Utc>) -> PathBuf {
        self.root
            .join(reference.kind.as_str())
            .join(now.format("%Y-%m-%d").to_string())
            .join(reference.id.as_str())
    }

    /// Write the artifact files into a tmp directory, fsync, rename into the
    /// final path, then drop the sentinel. Returns the committed directory
    /// and the hash over the canonical bytes (cleaned markdown when present,
    /// raw bytes otherwise).
    pub fn commit(
        &self,
        reference: &Reference,
        doc: &FetchedDocument,
        markdown: Option<&str>,
        verdict: &Verdict,
        now: DateTime<Utc>,
    ) -> Result<CommittedDir> {
        let final_dir = self.artifact_dir(reference, now);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let tmp_dir = self
            .root
            .join(format!("tmp-{}-{nanos}", reference.id.as_str()));

        fs::create_dir_all(&tmp_dir)?;

        let canonical: &[u8] = match markdown {
            Some(md) => md.as_bytes(),
            None => &doc.bytes,
        };
        let hash = content_hash(canonical);

        if let Some(md) = markdown {
            write_synced(&tmp_dir.join("content.md"), md.as_bytes())?;
        }
        if doc.is_html() {
            write_synced(&tmp_dir.join("raw.html"), &doc.bytes)?;
        } else {
            write_synced(&tmp_dir.join("raw.bin"), &doc.bytes)?;
        }

        let sidecar = json!({
            "reference_id": reference.id.as_str(),
            "kind": reference.kind.as_str(),
            "source_url": reference.source_url,
            "canonical_url": reference.canonical_url,
            "final_url": doc.final_url,
            "obtained_via": doc.transport.as_str(),
            "obtained_from": doc.obtained_from.as_str(),
            "source_resolver": doc.source_resolver,
            "content_hash": hash,
            "byte_count": canonical.len() as u64,
            "word_count": verdict.word_count,
            "quality": verdict.quality.as_str(),
            "quality_reasons": verdict.reasons,
            "fetched_at": now.to_rfc3339(),
        });
        write_synced(
            &tmp_dir.join("metadata.json"),
            serde_json::to_string_pretty(&sidecar)?.as_bytes(),
        )?;

        if let Some(parent) = final_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        // A leftover directory here never got its sentinel (or a policy
        // violation is replaying a fetch); either way it is stale.
        if final_dir.exists() {
            warn!(path = %final_dir.display(), "replacing stale artifact directory");
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;
        sync_dir(final_dir.parent().unwrap_or(&self.root))?;

        write_synced(&final_dir.join(COMMIT_SENTINEL), b"")?;

        info!(path = %final_dir.display(), bytes = canonical.len(), "artifact committed");

        Ok(CommittedDir {
            path: final_dir,
            content_hash: hash,
            byte_count: canonical.len() as u64,
        })
    }

    /// Swap in replacement markdown (from an enrichment hook) and return the
    /// new canonical hash. Only legal before the index records the hash.
    pub fn replace_markdown(&self, dir: &Path, markdown: &str) -> Result<String> {
        write_synced(&dir.join("content.md"), markdown.as_bytes())?;
        let hash = content_hash(markdown.as_bytes());

        let meta_path = dir.join("metadata.json");
        let mut meta: serde_json::Value = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
        meta["content_hash"] = json!(hash);
        meta["byte_count"] = json!(markdown.len() as u64);
        write_synced(&meta_path, serde_json::to_string_pretty(&meta)?.as_bytes())?;

        Ok(hash)
    }

    /// The bytes the content hash is defined over.
    pub fn canonical_bytes(&self, dir: &Path) -> Result<Vec<u8>> {
        let md = dir.join("content.md");
        if md.exists() {
            return Ok(fs::read(md)?);
        }
        let raw = dir.join("raw.html");
        if raw.exists() {
            return Ok(fs::read(raw)?);
        }
        Ok(fs::read(dir.join("raw.bin"))?)
    }

    pub fn is_committed(&self, dir: &Path) -> bool {
        dir.join(COMMIT_SENTINEL).exists()
    }

    /// Check stored bytes against a recorded hash.
    pub fn verify_integrity(&self, dir: &Path, expected_hash: &str) -> Result<()> {
        let bytes = self.canonical_bytes(dir)?;
        let actual = content_hash(&bytes);
        if actual != expected_hash {
            return Err(ArchiveError::Integrity(format!(
                "{}: stored {actual}, recorded {expected_hash}",
                dir.display()
            )));
        }
        Ok(())
    }

    /// Startup sweep: delete tmp directories and any artifact directory that
    /// never received its sentinel. Returns how many were removed.
    pub fn recover(&self) -> Result<u64> {
        let mut removed = 0u64;

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("tmp-") && entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
                removed += 1;
                continue;
            }
            if !entry.file_type()?.is_dir() {
                continue;
            }
            // kind / date / reference_id
            for date_entry in fs::read_dir(entry.path())? {
                let date_entry = date_entry?;
                if !date_entry.file_type()?.is_dir() {
                    continue;
                }
                for artifact_entry in fs::read_dir(date_entry.path())? {
                    let artifact_entry = artifact_entry?;
                    let dir = artifact_entry.path();
                    if artifact_entry.file_type()?.is_dir() && !self.is_committed(&dir) {
                        warn!(path = %dir.display(), "removing uncommitted artifact directory");
                        fs::remove_dir_all(&dir)?;
                        removed += 1;
                    }
                }
            }
        }

        if removed > 0 {
            info!(removed, "content store recovery sweep complete");
        }
        Ok(removed)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn sync_dir(path: &Path) -> Result<()> {
    // Directory fsync makes the rename durable on POSIX filesystems.
    if let Ok(dir) = File::open(path) {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrivener_common::{
        ObtainedFrom, Quality, ReferenceId, ReferenceKind, Stage, Transport,
    };

    fn reference(url: &str) -> Reference {
        let now = Utc::now();
        Reference {
            id: ReferenceId::derive(ReferenceKind::Article, url),
            kind: ReferenceKind::Article,
            source_url: url.to_string(),
            canonical_url: url.to_string(),
            host_key: "example.com".into(),
            content_hash: None,
            stage: Stage::Verified,
            processable: true,
            failure_reason: None,
            failure_detail: None,
            priority: 0,
            attempts: 0,
            spent_ms: 0,
            ready_at: now,
            last_attempt_outcome: None,
            lease_owner: None,
            lease_expires_at: None,
            duplicate_of: None,
            created_at: now,
            updated_at: now,
            metadata: None,
        }
    }

    fn doc(body: &str) -> FetchedDocument {
        FetchedDocument {
            bytes: body.as_bytes().to_vec(),
            final_url: "https://example.com/a".into(),
            locator_url: "https://example.com/a".into(),
            locator_hint: scrivener_common::TransportHint::Direct,
            transport: Transport::DirectHttp,
            obtained_from: ObtainedFrom::Origin,
            source_resolver: "origin".into(),
            content_type: Some("text/html".into()),
        }
    }

    fn verdict(words: u64) -> Verdict {
        Verdict {
            quality: Quality::Good,
            reasons: vec![],
            word_count: words,
            byte_count: 1000,
        }
    }

    #[test]
    fn commit_writes_files_and_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();
        let r = reference("https://example.com/a");

        let committed = store
            .commit(&r, &doc("<html>x</html>"), Some("# Title\n\nbody"), &verdict(2), Utc::now())
            .unwrap();

        assert!(committed.path.join("content.md").exists());
        assert!(committed.path.join("raw.html").exists());
        assert!(committed.path.join("metadata.json").exists());
        assert!(store.is_committed(&committed.path));
        assert_eq!(committed.content_hash, content_hash(b"# Title\n\nbody"));
    }

    #[test]
    fn hash_covers_markdown_when_present_else_raw() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();
        let r = reference("https://example.com/b");

        let with_md = store
            .commit(&r, &doc("<html>x</html>"), Some("cleaned"), &verdict(1), Utc::now())
            .unwrap();
        assert_eq!(with_md.content_hash, content_hash(b"cleaned"));
        assert_eq!(store.canonical_bytes(&with_md.path).unwrap(), b"cleaned");

        let r2 = reference("https://example.com/raw-only");
        let mut binary = doc("rawbytes");
        binary.content_type = Some("application/octet-stream".into());
        let raw_only = store
            .commit(&r2, &binary, None, &verdict(0), Utc::now())
            .unwrap();
        assert_eq!(raw_only.content_hash, content_hash(b"rawbytes"));
    }

    #[test]
    fn recovery_removes_uncommitted_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();
        let r = reference("https://example.com/c");

        let committed = store
            .commit(&r, &doc("<html>x</html>"), Some("keep me"), &verdict(2), Utc::now())
            .unwrap();

        // Simulate a crash: artifact dir without sentinel + a stray tmp dir.
        let orphan = dir.path().join("article").join("2026-01-01").join("orphan");
        fs::create_dir_all(&orphan).unwrap();
        fs::write(orphan.join("content.md"), "half written").unwrap();
        fs::create_dir_all(dir.path().join("tmp-crashed-123")).unwrap();

        let removed = store.recover().unwrap();
        assert_eq!(removed, 2);
        assert!(!orphan.exists());
        assert!(committed.path.exists(), "committed artifacts survive recovery");
    }

    #[test]
    fn replace_markdown_updates_hash_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();
        let r = reference("https://example.com/d");

        let committed = store
            .commit(&r, &doc("<html>x</html>"), Some("first pass"), &verdict(2), Utc::now())
            .unwrap();

        let new_hash = store.replace_markdown(&committed.path, "transcribed text").unwrap();
        assert_eq!(new_hash, content_hash(b"transcribed text"));
        store.verify_integrity(&committed.path, &new_hash).unwrap();

        let meta: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(committed.path.join("metadata.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["content_hash"], json!(new_hash));
    }

    #[test]
    fn integrity_check_catches_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path()).unwrap();
        let r = reference("https://example.com/e");

        let committed = store
            .commit(&r, &doc("<html>x</html>"), Some("original"), &verdict(1), Utc::now())
            .unwrap();
        fs::write(committed.path.join("content.md"), "tampered").unwrap();

        assert!(store
            .verify_integrity(&committed.path, &committed.content_hash)
            .is_err());
    }
}
