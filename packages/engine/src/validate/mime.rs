/// Magic-byte MIME detection over the first 512 bytes of content.
///
/// Detection order: fixed signature table, then structured-text sniffing,
/// then the printable-text heuristic, then extension lookup, then
/// `application/octet-stream`.

/// Fixed prefix signatures, checked in order.
const SIGNATURES: &[(&[u8], &str)] = &[
    // Images
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"\x89PNG\r\n\x1A\n", "image/png"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\x00\x00\x01\x00", "image/x-icon"),
    // Documents
    (b"%PDF-", "application/pdf"),
    (b"PK\x03\x04", "application/zip"), // also DOCX/XLSX/PPTX/JAR
    (
        b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1",
        "application/msword", // OLE compound: DOC/XLS/PPT
    ),
    // Archives
    (b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    (b"7z\xBC\xAF\x27\x1C", "application/x-7z-compressed"),
    (b"\x1F\x8B", "application/gzip"),
    // Audio/Video
    (b"ID3", "audio/mpeg"),
    (b"\xFF\xFB", "audio/mpeg"),
    (b"OggS", "audio/ogg"),
    (b"\x1A\x45\xDF\xA3", "video/webm"), // Matroska/WebM
    // Executables
    (b"\x7FELF", "application/x-executable"),
    (b"\xFE\xED\xFA\xCE", "application/x-mach-binary"),
    (b"\xFE\xED\xFA\xCF", "application/x-mach-binary"),
    (b"\xCE\xFA\xED\xFE", "application/x-mach-binary"),
    (b"\xCF\xFA\xED\xFE", "application/x-mach-binary"),
    // Text with byte-order mark
    (b"\xEF\xBB\xBF", "text/plain"),
];

/// Detect MIME from content, falling back to the filename extension.
pub fn detect(filename: &str, head: &[u8]) -> String {
    if let Some(mime) = detect_by_content(head) {
        return mime;
    }

    if let Some(mime) = mime_guess::from_path(filename).first() {
        return mime.to_string();
    }

    "application/octet-stream".to_string()
}

/// Signature-table detection only.
pub fn detect_by_content(head: &[u8]) -> Option<String> {
    if head.is_empty() {
        return None;
    }

    // RIFF containers disambiguate on the FourCC at offset 8.
    if head.starts_with(b"RIFF") {
        if head.len() >= 12 && &head[8..12] == b"WEBP" {
            return Some("image/webp".to_string());
        }
        return Some("audio/wav".to_string());
    }

    // Windows PE: MZ stub followed by a PE header somewhere in the file.
    if head.starts_with(b"MZ") && contains(head, b"PE\x00\x00") {
        return Some("application/vnd.microsoft.portable-executable".to_string());
    }

    for (signature, mime) in SIGNATURES {
        if head.starts_with(signature) {
            return Some(mime.to_string());
        }
    }

    // Structured text.
    if head.starts_with(b"<?xml") || head.starts_with(b"<!DOCTYPE") || head.starts_with(b"<html") {
        let window = &head[..head.len().min(100)];
        if contains_ignore_case(window, b"html") {
            return Some("text/html".to_string());
        }
        return Some("application/xml".to_string());
    }

    if is_text_content(head) {
        return Some("text/plain".to_string());
    }

    None
}

/// Executable magic found in the sniff window, regardless of position.
///
/// Returns the human-readable format name for the rejection message.
pub fn find_executable_magic(head: &[u8]) -> Option<&'static str> {
    if contains(head, b"\x7FELF") {
        return Some("ELF");
    }
    if contains(head, b"MZ") && contains(head, b"PE\x00\x00") {
        return Some("Windows PE");
    }
    for magic in [
        b"\xFE\xED\xFA\xCE",
        b"\xFE\xED\xFA\xCF",
        b"\xCE\xFA\xED\xFE",
        b"\xCF\xFA\xED\xFE",
    ] {
        if contains(head, magic) {
            return Some("Mach-O");
        }
    }
    None
}

/// The MIME a declaration must carry for an executable format to pass.
pub fn executable_mime(format: &str) -> &'static str {
    match format {
        "ELF" => "application/x-executable",
        "Windows PE" => "application/vnd.microsoft.portable-executable",
        _ => "application/x-mach-binary",
    }
}

/// Heuristic: mostly printable in the sniff window means text.
pub fn is_text_content(head: &[u8]) -> bool {
    if head.is_empty() {
        return false;
    }

    let window = &head[..head.len().min(512)];
    let non_printable = window
        .iter()
        .filter(|&&b| !matches!(b, b'\t' | b'\n' | b'\r' | 0x20..=0x7E | 0x80..))
        .count();

    (non_printable as f64) / (window.len() as f64) < 0.3
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}
