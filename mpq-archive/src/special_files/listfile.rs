//! (listfile) parsing and generation
//!
//! Newline-separated ASCII paths with `\` separators. Parsing tolerates
//! comment lines and trailing metadata; generation emits `\r\n` endings.

use crate::Result;

/// Parse a `(listfile)` payload into individual paths
pub fn parse_listfile(data: &[u8]) -> Result<Vec<String>> {
    let content = match std::str::from_utf8(data) {
        Ok(s) => s.to_string(),
        Err(_) => {
            log::warn!("(listfile) contains invalid UTF-8, using lossy conversion");
            String::from_utf8_lossy(data).into_owned()
        }
    };

    let files = content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                return None;
            }
            // Tolerate "path;metadata" lines
            let path = match line.find(';') {
                Some(pos) => line[..pos].trim(),
                None => line,
            };
            (!path.is_empty()).then(|| path.to_string())
        })
        .collect();

    Ok(files)
}

/// Generate a `(listfile)` payload from a path list
pub fn generate_listfile<'a>(paths: impl Iterator<Item = &'a str>) -> Vec<u8> {
    let mut content = String::new();
    for path in paths {
        content.push_str(path);
        content.push_str("\r\n");
    }
    content.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let files = parse_listfile(b"file1.txt\r\nunits\\footman.mdx\nfile3.bin").unwrap();
        assert_eq!(files, ["file1.txt", "units\\footman.mdx", "file3.bin"]);
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let content = b"; comment\nfile1.txt\n\n# other comment\nfile2.dat\n";
        let files = parse_listfile(content).unwrap();
        assert_eq!(files, ["file1.txt", "file2.dat"]);
    }

    #[test]
    fn test_parse_strips_metadata() {
        let files = parse_listfile(b"file1.txt;12345\nfile2.dat").unwrap();
        assert_eq!(files, ["file1.txt", "file2.dat"]);
    }

    #[test]
    fn test_generate_round_trips() {
        let paths = ["war3map.j", "scripts\\common.j"];
        let payload = generate_listfile(paths.iter().copied());
        assert_eq!(payload, b"war3map.j\r\nscripts\\common.j\r\n");

        let parsed = parse_listfile(&payload).unwrap();
        assert_eq!(parsed, paths);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_listfile(b"").unwrap().is_empty());
    }
}
