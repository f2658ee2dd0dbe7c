//! Text and fuzzy filename search over the non-excluded part of the workspace.

use super::{expand, stat, VirtualFileSystem};
use crate::errors::{BridgeError, BridgeResult};
use crate::models::{File, SearchFileResult, SearchOptions, SearchTextResponse, SearchTextResult};
use regex::{Regex, RegexBuilder};
use std::fs;
use std::path::Path;
use tracing::debug;

const PREVIEW_CONTEXT_CHARS: usize = 100;
const MAX_NAME_DISTANCE: usize = 3;
const MAX_NAME_RESULTS: usize = 20;
const NAME_PREVIEW_LINES: usize = 20;

impl VirtualFileSystem {
    pub fn search_text(&self, query: &str, options: &SearchOptions) -> BridgeResult<SearchTextResponse> {
        let pattern = build_pattern(query, options)?;
        let mut results = Vec::new();
        let mut total_matches = 0;

        for file in self.searchable_files()? {
            let content = match fs::read_to_string(&file.absolute_path) {
                Ok(content) => content,
                Err(error) => {
                    debug!(path = %file.absolute_path, %error, "skipping unreadable file");
                    continue;
                }
            };

            let mut matches = pattern.find_iter(&content);
            let Some(first) = matches.next() else {
                continue;
            };
            let number_of_matches = 1 + matches.count();
            total_matches += number_of_matches;

            results.push(SearchTextResult {
                preview_content: preview_around(&content, first.start(), first.end()),
                number_of_matches,
                file,
            });
        }

        Ok(SearchTextResponse {
            results,
            total_matches,
        })
    }

    pub fn search_files(&self, query: &str) -> BridgeResult<Vec<SearchFileResult>> {
        let query = query.to_lowercase();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, File)> = self
            .searchable_files()?
            .into_iter()
            .filter_map(|file| {
                let score = name_distance(&file.name, &query);
                (score < MAX_NAME_DISTANCE).then_some((score, file))
            })
            .collect();
        scored.sort_by_key(|(score, _)| *score);
        scored.truncate(MAX_NAME_RESULTS);

        Ok(scored
            .into_iter()
            .map(|(match_score, file)| SearchFileResult {
                preview_content: head_lines(&file.absolute_path, NAME_PREVIEW_LINES),
                match_score,
                file,
            })
            .collect())
    }

    /// Every regular file under the root, skipping excluded directories.
    fn searchable_files(&self) -> BridgeResult<Vec<File>> {
        fs::create_dir_all(&self.root)?;
        let mut files = Vec::new();
        self.collect_files(&self.root, &mut files)?;
        Ok(files)
    }

    fn collect_files(&self, dir: &Path, out: &mut Vec<File>) -> BridgeResult<()> {
        for entry in expand(dir)? {
            if self.is_excluded(&entry) {
                continue;
            }
            let Ok(node) = stat(&entry) else {
                continue;
            };
            if node.is_directory {
                self.collect_files(&entry, out)?;
            } else if node.is_file {
                out.push(node);
            }
        }
        Ok(())
    }
}

pub(crate) fn build_pattern(query: &str, options: &SearchOptions) -> BridgeResult<Regex> {
    if query.is_empty() {
        return Err(BridgeError::InvalidRequest("search query is empty".into()));
    }
    let source = if options.use_regex {
        query.to_string()
    } else {
        let escaped = regex::escape(query);
        if options.match_whole_word {
            format!(r"\b{escaped}\b")
        } else {
            escaped
        }
    };
    Ok(RegexBuilder::new(&source)
        .case_insensitive(!options.match_case)
        .build()?)
}

/// The first match plus up to 100 characters on either side.
fn preview_around(content: &str, start: usize, end: usize) -> String {
    let from = content[..start]
        .char_indices()
        .rev()
        .take(PREVIEW_CONTEXT_CHARS)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(start);
    let to = content[end..]
        .char_indices()
        .nth(PREVIEW_CONTEXT_CHARS)
        .map(|(i, _)| end + i)
        .unwrap_or(content.len());
    content[from..to].to_string()
}

fn name_distance(name: &str, query: &str) -> usize {
    let name = name.to_lowercase();
    let full = levenshtein(&name, query);
    match Path::new(&name).file_stem().and_then(|s| s.to_str()) {
        Some(stem) if stem != name => full.min(levenshtein(stem, query)),
        _ => full,
    }
}

fn head_lines(path: &str, count: usize) -> String {
    match fs::read_to_string(path) {
        Ok(content) => content.lines().take(count).collect::<Vec<_>>().join("\n"),
        Err(_) => String::new(),
    }
}

/// Edit distance over Unicode scalar values.
fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != *cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use tempfile::TempDir;

    fn setup() -> (TempDir, VirtualFileSystem) {
        let dir = TempDir::new().unwrap();
        let vfs = VirtualFileSystem::new(&BridgeConfig::for_root(dir.path()));
        (dir, vfs)
    }

    fn whole_word() -> SearchOptions {
        SearchOptions {
            use_regex: false,
            match_whole_word: true,
            match_case: false,
        }
    }

    #[test]
    fn levenshtein_distances() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("foo", "fooo"), 1);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("bar", "fooo"), 4);
    }

    #[test]
    fn whole_word_ignores_case_but_not_substrings() {
        let (dir, vfs) = setup();
        fs::write(dir.path().join("a.txt"), "The CAT sat").unwrap();
        fs::write(dir.path().join("b.txt"), "concatenate").unwrap();

        let response = vfs.search_text("cat", &whole_word()).unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].file.name, "a.txt");
        assert_eq!(response.total_matches, 1);
    }

    #[test]
    fn match_case_and_regex_modes() {
        let (dir, vfs) = setup();
        fs::write(dir.path().join("code.rs"), "let Foo = foo(); foo2").unwrap();

        let exact = SearchOptions {
            match_case: true,
            ..Default::default()
        };
        assert_eq!(vfs.search_text("foo", &exact).unwrap().total_matches, 2);

        let regex = SearchOptions {
            use_regex: true,
            ..Default::default()
        };
        assert_eq!(vfs.search_text(r"foo\d", &regex).unwrap().total_matches, 1);
        assert!(matches!(
            vfs.search_text("(", &regex),
            Err(BridgeError::Pattern(_))
        ));

        // Metacharacters are literal without use_regex.
        assert_eq!(vfs.search_text("foo()", &SearchOptions::default()).unwrap().total_matches, 1);
    }

    #[test]
    fn excluded_directories_are_skipped_by_component() {
        let (dir, vfs) = setup();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::create_dir_all(dir.path().join(".github")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join(".git/config"), "needle").unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), "needle").unwrap();
        fs::write(dir.path().join(".github/ci.yml"), "needle").unwrap();

        let response = vfs.search_text("needle", &SearchOptions::default()).unwrap();
        let names: Vec<_> = response.results.iter().map(|r| r.file.name.as_str()).collect();
        assert_eq!(names, vec!["ci.yml"]);
    }

    #[test]
    fn preview_is_clamped_to_hundred_chars_each_side() {
        let before = "é".repeat(150);
        let after = "x".repeat(150);
        let content = format!("{before}MATCH{after}");
        let start = before.len();
        let preview = preview_around(&content, start, start + 5);
        assert_eq!(preview.chars().count(), 205);
        assert!(preview.starts_with('é'));
        assert!(preview.contains("MATCH"));

        assert_eq!(preview_around("MATCH", 0, 5), "MATCH");
    }

    #[test]
    fn fuzzy_name_search_keeps_close_names() {
        let (dir, vfs) = setup();
        fs::write(dir.path().join("foo.txt"), "line1\nline2").unwrap();
        fs::write(dir.path().join("bar.txt"), "").unwrap();

        let results = vfs.search_files("fooo").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file.name, "foo.txt");
        assert_eq!(results[0].match_score, 1);
        assert_eq!(results[0].preview_content, "line1\nline2");
    }

    #[test]
    fn fuzzy_results_are_sorted_and_capped() {
        let (dir, vfs) = setup();
        for i in 0..25 {
            fs::create_dir_all(dir.path().join(format!("d{i}"))).unwrap();
            fs::write(dir.path().join(format!("d{i}/mod.rs")), "").unwrap();
        }
        fs::write(dir.path().join("mode.rs"), "").unwrap();

        let results = vfs.search_files("mod.rs").unwrap();
        assert_eq!(results.len(), 20);
        assert!(results.windows(2).all(|w| w[0].match_score <= w[1].match_score));
        assert_eq!(results[0].match_score, 0);
    }

    #[test]
    fn content_behind_links_is_not_searched() {
        let (dir, vfs) = setup();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("notes.txt"), "needle outside").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("ext")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("notes.txt"), dir.path().join("notes-link.txt"))
            .unwrap();
        fs::write(dir.path().join("a.txt"), "needle inside").unwrap();

        let found = vfs.search_text("needle", &SearchOptions::default()).unwrap();
        assert_eq!(found.total_matches, 1);
        assert_eq!(found.results.len(), 1);
        assert_eq!(found.results[0].file.name, "a.txt");

        assert!(vfs.search_files("notes").unwrap().is_empty());
    }
}
