pub mod mime;
pub mod scan;

use std::path::PathBuf;
use std::time::Duration;

use common::storage::{BoxReader, Fingerprint, FingerprintBuilder};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config::ValidatorConfig;
use scan::ScanVerdict;

/// Validation reads the stream at most once; no per-read progress for this
/// long aborts the upload.
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Content up to this size stays in memory; larger uploads spill to a temp
/// file so the pipeline never holds a whole large upload in RAM.
const SPILL_THRESHOLD: usize = 1024 * 1024;

/// Bytes buffered for magic-byte sniffing.
const SNIFF_WINDOW: usize = 512;

/// Extensions rejected outright.
const BLOCKED_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "com", "pif", "scr", "vbs", "vbe", "js", "jar", "msi", "dll", "deb",
    "rpm", "dmg", "pkg", "sh", "bash", "zsh", "fish", "csh", "ksh", "ps1", "psm1", "py", "rb",
    "pl", "php", "asp", "aspx", "jsp", "war", "ipa", "apk", "app", "gadget", "workflow",
];

/// Extensions accepted with a warning.
const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz", "bz2"];

/// Filename substrings worth flagging.
const SUSPICIOUS_NAMES: &[&str] = &[
    "autorun.inf",
    "desktop.ini",
    ".htaccess",
    "web.config",
    "config.php",
    "wp-config.php",
    ".env",
    "id_rsa",
    "id_dsa",
    "private.key",
];

/// Injection patterns flagged in text content.
const SCRIPT_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "vbscript:",
    "onload=",
    "onerror=",
    "eval(",
    "exec(",
    "system(",
    "shell_exec(",
];

/// Character sequences forbidden in filenames.
const DANGEROUS_SEQUENCES: &[&str] = &["../", "..\\", "<", ">", ":", "\"", "|", "?", "*", "\0"];

/// Validated content, spooled for the later store write.
pub enum SpooledContent {
    Memory(Vec<u8>),
    File { path: PathBuf, size: u64 },
}

impl SpooledContent {
    /// Open a fresh reader over the spooled bytes.
    pub async fn reader(&self) -> std::io::Result<BoxReader> {
        match self {
            Self::Memory(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
            Self::File { path, .. } => {
                let file = fs::File::open(path).await?;
                Ok(Box::new(tokio::io::BufReader::new(file)))
            }
        }
    }

    /// The full content, when it fits in memory.
    pub fn in_memory(&self) -> Option<&[u8]> {
        match self {
            Self::Memory(bytes) => Some(bytes),
            Self::File { .. } => None,
        }
    }
}

impl Drop for SpooledContent {
    fn drop(&mut self) {
        if let Self::File { path, .. } = self {
            // Best effort.
            let _ = std::fs::remove_file(&*path);
        }
    }
}

/// The facts validation established about accepted content.
pub struct FileMeta {
    pub fingerprint: Fingerprint,
    pub size_bytes: i64,
    pub detected_mime: String,
    pub warnings: Vec<String>,
}

/// Validation is a sum, not an exception: callers match instead of catching.
pub enum ValidationOutcome {
    Valid {
        meta: FileMeta,
        content: SpooledContent,
    },
    Rejected {
        errors: Vec<String>,
        warnings: Vec<String>,
    },
    Infected {
        threat: String,
    },
    Cancelled,
    ReadError(String),
}

/// Single-pass content validator.
///
/// The stream is read exactly once: hashing, size accounting, sniffing and
/// spooling all happen in the same loop.
pub struct Validator {
    max_bytes: u64,
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(max_bytes: u64, config: ValidatorConfig) -> Self {
        Self { max_bytes, config }
    }

    pub async fn validate(
        &self,
        filename: &str,
        declared_mime: Option<&str>,
        reader: BoxReader,
        cancel: &CancellationToken,
    ) -> ValidationOutcome {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        check_filename(filename, &mut errors);
        check_extension(filename, &mut errors, &mut warnings);
        check_suspicious_name(filename, &mut warnings);

        let (content, fingerprint, size) =
            match self.spool_stream(reader, cancel).await {
                Ok(spooled) => spooled,
                Err(outcome) => return outcome,
            };

        if size == 0 {
            errors.push("File is empty".to_string());
        }

        let head = sniff_window(&content).await;
        let detected_mime = mime::detect(filename, &head);

        if let Some(declared) = declared_mime {
            check_mime_consistency(declared, &detected_mime, &mut warnings);
        }

        if let Some(format) = mime::find_executable_magic(&head) {
            let declared_as_executable =
                declared_mime.is_some_and(|d| d == mime::executable_mime(format));
            if !declared_as_executable {
                errors.push(format!("File contains embedded {format} executable"));
            }
        }

        if mime::is_text_content(&head) {
            check_script_patterns(&content, &head, &mut warnings);
        }

        if !errors.is_empty() {
            return ValidationOutcome::Rejected { errors, warnings };
        }

        if self.config.virus_scan.enabled {
            let scan_reader = match content.reader().await {
                Ok(r) => r,
                Err(e) => return ValidationOutcome::ReadError(format!("spool reopen failed: {e}")),
            };
            match scan::scan_stream(&self.config.virus_scan, scan_reader).await {
                Ok(ScanVerdict::Clean) => {}
                Ok(ScanVerdict::Infected(threat)) => {
                    return ValidationOutcome::Infected { threat };
                }
                Err(e) => {
                    // Fail-open: record the gap, let the upload through.
                    warn!(filename, "{e}");
                    warnings.push("Virus scan could not be completed".to_string());
                }
            }
        }

        ValidationOutcome::Valid {
            meta: FileMeta {
                fingerprint,
                size_bytes: size as i64,
                detected_mime,
                warnings,
            },
            content,
        }
    }

    /// Drain the stream into the spool, hashing and counting as we go.
    async fn spool_stream(
        &self,
        mut reader: BoxReader,
        cancel: &CancellationToken,
    ) -> Result<(SpooledContent, Fingerprint, u64), ValidationOutcome> {
        let mut hasher = FingerprintBuilder::new();
        let mut size: u64 = 0;
        let mut memory: Vec<u8> = Vec::new();
        let mut spill: Option<(PathBuf, fs::File)> = None;
        let mut buf = vec![0u8; 64 * 1024];

        let cleanup_spill = |spill: Option<(PathBuf, fs::File)>| {
            if let Some((path, file)) = spill {
                drop(file);
                let _ = std::fs::remove_file(path);
            }
        };

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => {
                    cleanup_spill(spill);
                    return Err(ValidationOutcome::Cancelled);
                }
                read = tokio::time::timeout(STREAM_READ_TIMEOUT, reader.read(&mut buf)) => {
                    match read {
                        Err(_) => {
                            cleanup_spill(spill);
                            return Err(ValidationOutcome::ReadError(
                                "no stream progress within 30s".to_string(),
                            ));
                        }
                        Ok(Err(e)) => {
                            cleanup_spill(spill);
                            return Err(ValidationOutcome::ReadError(format!(
                                "failed to read content: {e}"
                            )));
                        }
                        Ok(Ok(n)) => n,
                    }
                }
            };
            if n == 0 {
                break;
            }

            size += n as u64;
            if size > self.max_bytes {
                cleanup_spill(spill);
                return Err(ValidationOutcome::Rejected {
                    errors: vec![format!(
                        "File size exceeds maximum allowed size ({} bytes)",
                        self.max_bytes
                    )],
                    warnings: vec![],
                });
            }

            hasher.update(&buf[..n]);

            if spill.is_none() && memory.len() + n > SPILL_THRESHOLD {
                let path =
                    std::env::temp_dir().join(format!("vault-upload-{}", Uuid::new_v4()));
                let mut file = match fs::File::create(&path).await {
                    Ok(f) => f,
                    Err(e) => {
                        return Err(ValidationOutcome::ReadError(format!(
                            "spool create failed: {e}"
                        )));
                    }
                };
                if let Err(e) = file.write_all(&memory).await {
                    drop(file);
                    let _ = std::fs::remove_file(&path);
                    return Err(ValidationOutcome::ReadError(format!(
                        "spool write failed: {e}"
                    )));
                }
                memory.clear();
                spill = Some((path, file));
            }

            let write_result = match &mut spill {
                Some((_, file)) => file.write_all(&buf[..n]).await,
                None => {
                    memory.extend_from_slice(&buf[..n]);
                    Ok(())
                }
            };
            if let Err(e) = write_result {
                cleanup_spill(spill);
                return Err(ValidationOutcome::ReadError(format!(
                    "spool write failed: {e}"
                )));
            }
        }

        let content = match spill {
            Some((path, mut file)) => {
                if let Err(e) = file.flush().await {
                    drop(file);
                    let _ = std::fs::remove_file(&path);
                    return Err(ValidationOutcome::ReadError(format!(
                        "spool flush failed: {e}"
                    )));
                }
                drop(file);
                SpooledContent::File { path, size }
            }
            None => SpooledContent::Memory(memory),
        };

        Ok((content, hasher.finalize(), size))
    }
}

/// First bytes of the spool, for sniffing.
async fn sniff_window(content: &SpooledContent) -> Vec<u8> {
    match content {
        SpooledContent::Memory(bytes) => bytes[..bytes.len().min(SNIFF_WINDOW)].to_vec(),
        SpooledContent::File { path, .. } => {
            let mut head = vec![0u8; SNIFF_WINDOW];
            match fs::File::open(path).await {
                Ok(mut file) => {
                    let mut filled = 0;
                    while filled < head.len() {
                        match file.read(&mut head[filled..]).await {
                            Ok(0) => break,
                            Ok(n) => filled += n,
                            Err(_) => break,
                        }
                    }
                    head.truncate(filled);
                    head
                }
                Err(_) => Vec::new(),
            }
        }
    }
}

fn check_filename(filename: &str, errors: &mut Vec<String>) {
    if filename.trim().is_empty() {
        errors.push("Filename cannot be empty".to_string());
        return;
    }

    for sequence in DANGEROUS_SEQUENCES {
        if filename.contains(sequence) {
            errors.push(format!(
                "Filename contains dangerous character sequence: {}",
                sequence.escape_default()
            ));
        }
    }

    if filename.chars().count() > 255 {
        errors.push("Filename is too long (max 255 characters)".to_string());
    }
}

fn extension_of(filename: &str) -> Option<String> {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn check_extension(filename: &str, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    let Some(ext) = extension_of(filename) else {
        return;
    };

    if BLOCKED_EXTENSIONS.contains(&ext.as_str()) {
        errors.push(format!(
            "File type '.{ext}' is not allowed for security reasons"
        ));
        return;
    }

    if ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
        warnings.push(format!(
            "Archive file detected (.{ext}). Contents are not inspected"
        ));
    }
}

fn check_suspicious_name(filename: &str, warnings: &mut Vec<String>) {
    let lower = filename.to_lowercase();
    for pattern in SUSPICIOUS_NAMES {
        if lower.contains(pattern) {
            warnings.push(format!("Suspicious filename pattern detected: {pattern}"));
        }
    }
}

fn check_mime_consistency(declared: &str, detected: &str, warnings: &mut Vec<String>) {
    if declared.is_empty() || declared == detected {
        return;
    }

    // Detected types that are safe generalizations of common declarations.
    let acceptable = match detected {
        "application/octet-stream" => true,
        "text/plain" => declared == "application/octet-stream",
        "application/zip" => matches!(
            declared,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
                | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
                | "application/vnd.openxmlformats-officedocument.presentationml.presentation"
                | "application/java-archive"
        ),
        _ => false,
    };

    if !acceptable {
        warnings.push(format!(
            "Declared MIME type ({declared}) differs from detected type ({detected})"
        ));
    }
}

fn check_script_patterns(content: &SpooledContent, head: &[u8], warnings: &mut Vec<String>) {
    // Spilled uploads only get the sniff window scanned; anything held in
    // memory is scanned in full.
    let window: &[u8] = content.in_memory().unwrap_or(head);
    let lower = String::from_utf8_lossy(window).to_lowercase();

    for pattern in SCRIPT_PATTERNS {
        if lower.contains(pattern) {
            warnings.push(format!(
                "Potentially suspicious script content detected: {pattern}"
            ));
        }
    }
}
