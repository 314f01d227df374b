//! Writes finished operations into an output directory.

use async_trait::async_trait;
use pk_core::CaptureError;
use pk_core::CaptureResult;
use pk_encode::parse_data_url;
use pk_ipc::SaveAction;
use pk_session::PackageJob;
use pk_session::Packager;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

const MAX_NAME_ATTEMPTS: usize = 1000;

pub(crate) struct FilePackager {
    dir: PathBuf,
    written: Mutex<Vec<PathBuf>>,
}

impl FilePackager {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            written: Mutex::new(Vec::new()),
        }
    }

    /// Last file written.
    pub(crate) fn written(&self) -> Option<PathBuf> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

#[async_trait]
impl Packager for FilePackager {
    async fn package(&self, job: PackageJob) -> CaptureResult<()> {
        let bytes = match job.action {
            SaveAction::Extract => {
                let data_url = job.fragments.concat();
                parse_data_url(&data_url)?.bytes
            }
            SaveAction::Save | SaveAction::Remove => job.fragments.concat().into_bytes(),
        };
        if job.restricted {
            tracing::debug!(target: "pagekeep::app", tab = %job.tab, "page policy restricts downloads, writing directly");
        }

        std::fs::create_dir_all(&self.dir).map_err(|error| {
            CaptureError::new(
                "app.output.create_failed",
                format!("cannot create {}: {error}", self.dir.display()),
            )
        })?;
        let path = unique_path(&self.dir, &job.file_name)?;
        std::fs::write(&path, &bytes).map_err(|error| {
            CaptureError::new(
                "app.output.write_failed",
                format!("cannot write {}: {error}", path.display()),
            )
        })?;
        tracing::info!(target: "pagekeep::app", path = %path.display(), bytes = bytes.len(), "file written");
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path);
        Ok(())
    }
}

/// `name`, or `name (1)`, `name (2)`, ... when the file already exists.
fn unique_path(dir: &Path, file_name: &str) -> CaptureResult<PathBuf> {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return Ok(candidate);
    }
    let (stem, extension) = match file_name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => (stem, Some(extension)),
        _ => (file_name, None),
    };
    for attempt in 1..=MAX_NAME_ATTEMPTS {
        let name = match extension {
            Some(extension) => format!("{stem} ({attempt}).{extension}"),
            None => format!("{stem} ({attempt})"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(CaptureError::new(
        "app.output.name_exhausted",
        format!("no free file name for {file_name}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::FilePackager;
    use pk_core::TabId;
    use pk_ipc::SaveAction;
    use pk_session::PackageJob;
    use pk_session::Packager;

    fn job(action: SaveAction, fragments: &[&str], file_name: &str) -> PackageJob {
        PackageJob {
            tab: TabId(1),
            action,
            fragments: fragments.iter().map(|fragment| (*fragment).to_owned()).collect(),
            file_name: file_name.to_owned(),
            restricted: false,
        }
    }

    #[tokio::test]
    async fn joins_fragments_and_never_overwrites() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(error) => panic!("{error}"),
        };
        let packager = FilePackager::new(dir.path().join("out"));

        let first = packager.package(job(SaveAction::Save, &["<html>", "</html>"], "Page.html")).await;
        assert!(first.is_ok());
        let second = packager.package(job(SaveAction::Save, &["again"], "Page.html")).await;
        assert!(second.is_ok());

        let saved = std::fs::read_to_string(dir.path().join("out/Page.html")).unwrap_or_default();
        assert_eq!(saved, "<html></html>");
        assert_eq!(packager.written(), Some(dir.path().join("out/Page (1).html")));
    }

    #[tokio::test]
    async fn extracted_resources_are_decoded() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(error) => panic!("{error}"),
        };
        let packager = FilePackager::new(dir.path().to_path_buf());
        let result = packager
            .package(job(SaveAction::Extract, &["data:image/png;base64,cG5n"], "a.png"))
            .await;
        assert!(result.is_ok());
        assert_eq!(std::fs::read(dir.path().join("a.png")).unwrap_or_default(), b"png");

        let broken = packager.package(job(SaveAction::Extract, &["not a data url"], "b.png")).await;
        assert!(broken.is_err());
    }
}
