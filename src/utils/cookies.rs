//! Netscape cookie file support

use std::path::Path;

/// Build a `Cookie` header from the Netscape-format cookie file entries that
/// apply to `domain`. Returns `None` when the file is unreadable or no entry
/// matches.
pub fn cookie_header_for(path: &Path, domain: &str) -> Option<String> {
    let content = match fs_err::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!("Cannot read cookie file: {}", e);
            return None;
        }
    };

    let pairs = parse_netscape_cookies(&content, domain);
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join("; "))
    }
}

/// Name/value pairs from a Netscape cookie file matching `domain`
fn parse_netscape_cookies(content: &str, domain: &str) -> Vec<(String, String)> {
    let domain = domain.trim_start_matches('.').to_lowercase();

    content
        .lines()
        .filter_map(|line| {
            // `#HttpOnly_` prefixed lines are real cookies
            let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
            if line.starts_with('#') || line.trim().is_empty() {
                return None;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                return None;
            }
            let cookie_domain = fields[0].trim_start_matches('.').to_lowercase();
            let applies = domain == cookie_domain || domain.ends_with(&format!(".{}", cookie_domain));
            applies.then(|| (fields[5].to_string(), fields[6].trim_end().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# Netscape HTTP Cookie File\n\
.bilibili.com\tTRUE\t/\tFALSE\t0\tSESSDATA\tabc\n\
#HttpOnly_.bilibili.com\tTRUE\t/\tTRUE\t0\tbili_jct\tdef\n\
.youtube.com\tTRUE\t/\tTRUE\t0\tSID\tzzz\n\
malformed line\n";

    #[test]
    fn test_parse_matches_domain_and_subdomains() {
        let pairs = parse_netscape_cookies(SAMPLE, "api.bilibili.com");
        assert_eq!(
            pairs,
            vec![("SESSDATA".to_string(), "abc".to_string()), ("bili_jct".to_string(), "def".to_string())]
        );
        assert!(parse_netscape_cookies(SAMPLE, "example.com").is_empty());
    }

    #[test]
    fn test_cookie_header_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(&path, SAMPLE).unwrap();

        assert_eq!(cookie_header_for(&path, "bilibili.com").as_deref(), Some("SESSDATA=abc; bili_jct=def"));
        assert_eq!(cookie_header_for(&dir.path().join("missing.txt"), "bilibili.com"), None);
    }
}
