use std::path::Path;

/// Reduces a client supplied filename to a safe single path component.
///
/// Returns `None` when nothing usable is left.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    // Browsers on Windows send the full path with backslashes
    let last = filename.rsplit(['/', '\\']).next().unwrap_or("");
    let name = Path::new(last)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        tracing::warn!("Path traversal attempt detected: {}", filename);
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control()
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
                || c == ','
                || c.is_whitespace()
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    let sanitized = sanitized.trim_start_matches('.').to_string();

    // Limit length safely for UTF-8
    let sanitized = if sanitized.len() > 255 {
        let mut end = 255;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    };

    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("roads.csv").as_deref(), Some("roads.csv"));
        assert_eq!(
            sanitize_filename("my roads.csv").as_deref(),
            Some("my_roads.csv")
        );
        assert_eq!(
            sanitize_filename("test<script>.csv").as_deref(),
            Some("test_script_.csv")
        );
    }

    #[test]
    fn test_sanitize_strips_paths() {
        assert_eq!(
            sanitize_filename("../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            sanitize_filename("C:\\Users\\me\\parcels.gpkg").as_deref(),
            Some("parcels.gpkg")
        );
    }

    #[test]
    fn test_sanitize_rejects_empty() {
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename("..."), None);
        assert_eq!(sanitize_filename("dir/"), None);
    }

    #[test]
    fn test_sanitize_keeps_commas_out() {
        // Comma separates members in archive download descriptors
        assert_eq!(sanitize_filename("a,b.csv").as_deref(), Some("a_b.csv"));
    }
}
