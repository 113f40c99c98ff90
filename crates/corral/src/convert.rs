//! Post-capture conversion: remuxes finished captures into mp4.
//!
//! Runs as its own process (`corral convert`), scanning the completed
//! directory on an interval. Conversions are sequential; a scan finishes
//! one remux before looking at the next file, so at most one ffmpeg runs
//! at a time. On success both the output and the source move to the
//! destination directory (or the source is deleted, behind a config flag);
//! a failed conversion leaves the source in place for the next scan.

use crate::capture::move_file;
use anyhow::{Context, Result};
use corralconf::CorralConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// One planned remux: the program to run and the file it writes.
pub struct ConvertJob {
    pub program: String,
    pub args: Vec<String>,
    /// Remuxed output, written next to the source file.
    pub output: PathBuf,
}

/// Builds the remux command line for one finished capture.
pub trait ConvertBackend: Send + Sync {
    /// `None` when the file is not a convertible capture.
    fn plan(&self, src: &Path) -> Option<ConvertJob>;
}

/// ffmpeg remux into an mp4 container, copying streams.
///
/// `.ts` sources need the ADTS-to-ASC bitstream filter for the audio
/// track; `.flv` sources get the faststart flag instead so the result is
/// seekable before it is fully downloaded.
pub struct RemuxBackend;

impl ConvertBackend for RemuxBackend {
    fn plan(&self, src: &Path) -> Option<ConvertJob> {
        let ext = src.extension()?.to_str()?;
        let output = src.with_extension("mp4");

        let common = [
            "-i".to_string(),
            src.display().to_string(),
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "panic".to_string(),
        ];

        let rest: Vec<String> = match ext {
            "ts" => vec![
                "-c:v".to_string(),
                "copy".to_string(),
                "-c:a".to_string(),
                "copy".to_string(),
                "-bsf:a".to_string(),
                "aac_adtstoasc".to_string(),
                "-copyts".to_string(),
                output.display().to_string(),
            ],
            "flv" => vec![
                "-movflags".to_string(),
                "+faststart".to_string(),
                "-c:v".to_string(),
                "copy".to_string(),
                "-strict".to_string(),
                "-2".to_string(),
                "-q:a".to_string(),
                "100".to_string(),
                output.display().to_string(),
            ],
            _ => return None,
        };

        Some(ConvertJob {
            program: "ffmpeg".to_string(),
            args: common.into_iter().chain(rest).collect(),
            output,
        })
    }
}

/// Scans a directory of finished captures and converts them one by one.
pub struct Converter {
    src_dir: PathBuf,
    dst_dir: PathBuf,
    delete_after: bool,
    backend: Box<dyn ConvertBackend>,
}

impl Converter {
    pub fn new(config: &CorralConfig, backend: Box<dyn ConvertBackend>) -> Self {
        Self {
            src_dir: config.convert.src_dir.clone(),
            dst_dir: config.convert.dst_dir.clone(),
            delete_after: config.convert.delete_after,
            backend,
        }
    }

    /// Capture files in the source directory eligible for conversion.
    ///
    /// Only `.ts` and `.flv` files qualify; anything else (in-progress
    /// `.part` files included) is left alone.
    async fn eligible(&self) -> Result<Vec<PathBuf>> {
        let mut dir = tokio::fs::read_dir(&self.src_dir)
            .await
            .with_context(|| format!("Failed to read {}", self.src_dir.display()))?;

        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let convertible = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "ts" || e == "flv");
            if convertible {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// One scan over the source directory. Returns how many files
    /// converted successfully; per-file failures are logged and skipped.
    pub async fn scan_once(&self) -> Result<usize> {
        let files = self.eligible().await?;
        if files.is_empty() {
            tracing::debug!("No files to convert");
            return Ok(0);
        }

        tracing::info!(count = files.len(), "Files to convert");
        let mut converted = 0;
        for src in files {
            match self.convert_one(&src).await {
                Ok(()) => converted += 1,
                Err(e) => {
                    tracing::error!(path = %src.display(), "Failed to convert: {e:#}");
                }
            }
        }
        Ok(converted)
    }

    async fn convert_one(&self, src: &Path) -> Result<()> {
        let job = self
            .backend
            .plan(src)
            .context("No conversion for this file type")?;

        tracing::info!(
            from = %src.display(),
            to = %job.output.display(),
            "Converting"
        );

        let status = Command::new(&job.program)
            .args(&job.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .with_context(|| format!("Failed to spawn {}", job.program))?;

        if !status.success() {
            anyhow::bail!("{} exited with {:?}", job.program, status.code());
        }

        let out_name = job.output.file_name().context("Output has no file name")?;
        move_file(&job.output, &self.dst_dir.join(out_name))
            .await
            .context("Failed to move converted file")?;

        if self.delete_after {
            if let Err(e) = tokio::fs::remove_file(src).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %src.display(), "Failed to remove converted source: {e}");
                }
            }
        } else {
            let src_name = src.file_name().context("Source has no file name")?;
            move_file(src, &self.dst_dir.join(src_name))
                .await
                .context("Failed to archive converted source")?;
        }

        Ok(())
    }

    /// Scan on the given interval until cancelled. The first scan runs
    /// immediately.
    pub async fn run(self, scan_interval: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(scan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scan_once().await {
                        tracing::error!("Directory scan failed: {e:#}");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Converter shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Backend running a shell snippet; `{src}`/`{out}` expand to the
    /// source and output paths.
    struct ShellRemux {
        script: String,
    }

    impl ConvertBackend for ShellRemux {
        fn plan(&self, src: &Path) -> Option<ConvertJob> {
            let output = src.with_extension("mp4");
            let script = self
                .script
                .replace("{src}", &src.display().to_string())
                .replace("{out}", &output.display().to_string());
            Some(ConvertJob {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script],
                output,
            })
        }
    }

    fn test_converter(dir: &TempDir, script: &str, delete_after: bool) -> Converter {
        let mut config = CorralConfig::default();
        config.convert.src_dir = dir.path().join("complete");
        config.convert.dst_dir = dir.path().join("converted");
        config.convert.delete_after = delete_after;
        std::fs::create_dir_all(&config.convert.src_dir).unwrap();
        std::fs::create_dir_all(&config.convert.dst_dir).unwrap();
        Converter::new(
            &config,
            Box::new(ShellRemux {
                script: script.to_string(),
            }),
        )
    }

    #[test]
    fn test_remux_command_for_ts() {
        let job = RemuxBackend.plan(Path::new("/done/alice.ts")).unwrap();
        assert_eq!(job.program, "ffmpeg");
        assert_eq!(job.output, PathBuf::from("/done/alice.mp4"));
        assert!(job.args.iter().any(|a| a == "aac_adtstoasc"));
        assert!(job.args.iter().any(|a| a == "-copyts"));
        assert_eq!(job.args.last().unwrap(), "/done/alice.mp4");
    }

    #[test]
    fn test_remux_command_for_flv() {
        let job = RemuxBackend.plan(Path::new("/done/bob-flv.flv")).unwrap();
        assert!(job.args.iter().any(|a| a == "+faststart"));
        assert!(!job.args.iter().any(|a| a == "aac_adtstoasc"));
        assert_eq!(job.output, PathBuf::from("/done/bob-flv.mp4"));
    }

    #[test]
    fn test_remux_skips_foreign_files() {
        assert!(RemuxBackend.plan(Path::new("/done/notes.txt")).is_none());
        assert!(RemuxBackend.plan(Path::new("/done/alice.ts.part")).is_none());
        assert!(RemuxBackend.plan(Path::new("/done/noext")).is_none());
    }

    #[tokio::test]
    async fn test_scan_converts_and_archives_source() {
        let dir = TempDir::new().unwrap();
        let converter = test_converter(&dir, "cp {src} {out}", false);
        std::fs::write(dir.path().join("complete/alice.ts"), "payload").unwrap();

        assert_eq!(converter.scan_once().await.unwrap(), 1);

        let converted = dir.path().join("converted");
        assert_eq!(
            std::fs::read_to_string(converted.join("alice.mp4")).unwrap(),
            "payload"
        );
        assert!(converted.join("alice.ts").exists());
        assert!(!dir.path().join("complete/alice.ts").exists());
    }

    #[tokio::test]
    async fn test_delete_after_removes_source() {
        let dir = TempDir::new().unwrap();
        let converter = test_converter(&dir, "cp {src} {out}", true);
        std::fs::write(dir.path().join("complete/alice.ts"), "payload").unwrap();

        assert_eq!(converter.scan_once().await.unwrap(), 1);

        assert!(dir.path().join("converted/alice.mp4").exists());
        assert!(!dir.path().join("converted/alice.ts").exists());
        assert!(!dir.path().join("complete/alice.ts").exists());
    }

    #[tokio::test]
    async fn test_failed_conversion_leaves_source_for_next_scan() {
        let dir = TempDir::new().unwrap();
        let converter = test_converter(&dir, "exit 1", false);
        std::fs::write(dir.path().join("complete/alice.ts"), "payload").unwrap();

        assert_eq!(converter.scan_once().await.unwrap(), 0);

        assert!(dir.path().join("complete/alice.ts").exists());
        assert!(!dir.path().join("converted/alice.mp4").exists());
    }

    #[tokio::test]
    async fn test_scan_ignores_unfinished_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        let converter = test_converter(&dir, "cp {src} {out}", false);
        let src = dir.path().join("complete");
        std::fs::write(src.join("bob.ts"), "payload").unwrap();
        std::fs::write(src.join("alice.ts.part"), "half").unwrap();
        std::fs::write(src.join("notes.txt"), "text").unwrap();

        assert_eq!(converter.scan_once().await.unwrap(), 1);

        assert!(dir.path().join("converted/bob.mp4").exists());
        assert!(src.join("alice.ts.part").exists());
        assert!(src.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_empty_directory_is_a_quiet_scan() {
        let dir = TempDir::new().unwrap();
        let converter = test_converter(&dir, "cp {src} {out}", false);
        assert_eq!(converter.scan_once().await.unwrap(), 0);
    }
}
