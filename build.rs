use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are held to the policy.
const SOURCE_DIRS: [&str; 6] = ["select", "tuning", "shared", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

#[derive(Clone, Copy)]
enum Policy {
    UnderscorePrefix,
    ForbiddenWords,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Policy {
    const ALL: [Policy; 5] = [
        Policy::UnderscorePrefix,
        Policy::ForbiddenWords,
        Policy::StarsInComment,
        Policy::UppercaseComment,
        Policy::AllowDeadCode,
    ];

    fn pattern(self) -> String {
        match self {
            Policy::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Policy::ForbiddenWords => format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Policy::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Policy::UppercaseComment => r"(//|/\*).*".to_string(),
            Policy::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Policy::UnderscorePrefix => {
                "Underscore-prefixed names are not allowed. Use the binding or remove it."
            }
            Policy::ForbiddenWords => {
                "Comments must not narrate edits (FIX, NEW, CHANGE, UPDATE and similar markers)."
            }
            Policy::StarsInComment => "'**' is only allowed in doc comments.",
            Policy::UppercaseComment => "Comments written entirely in capitals are not allowed.",
            Policy::AllowDeadCode => {
                "#[allow(dead_code)] is not allowed. Use the code or remove it."
            }
        }
    }

    fn skips_build_script(self) -> bool {
        !matches!(self, Policy::UnderscorePrefix)
    }

    /// Decides whether a line matched by `pattern` really breaks the policy.
    fn is_violation(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Policy::UnderscorePrefix => {
                let in_comment = trimmed.starts_with("//") || line.contains("/*");
                let in_string = line
                    .split('"')
                    .enumerate()
                    .any(|(i, part)| i % 2 == 1 && part.contains('_'));
                !in_comment && !in_string
            }
            Policy::ForbiddenWords | Policy::AllowDeadCode => true,
            Policy::StarsInComment => !trimmed.starts_with("///"),
            Policy::UppercaseComment => {
                let Some(text) = comment_text(line) else {
                    return false;
                };
                let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }
        }
    }
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    Some(match line[start..].find("*/") {
        Some(end) => line[start..start + end].trim(),
        None => line[start..].trim(),
    })
}

struct PolicyCollector {
    policy: Policy,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl PolicyCollector {
    fn new(policy: Policy, file_path: &Path) -> Self {
        Self {
            policy,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut error_msg = format!(
            "\n❌ ERROR: {} source policy violation(s) in {}:\n",
            self.violations.len(),
            self.file_path.display()
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.policy.explanation()));
        Some(error_msg)
    }
}

impl Sink for PolicyCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.policy.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn rust_sources() -> Vec<PathBuf> {
    let mut sources = vec![PathBuf::from("build.rs")];
    for dir in SOURCE_DIRS {
        sources.extend(
            WalkDir::new(dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.into_path()),
        );
    }
    sources
}

fn enforce(policy: Policy, sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&policy.pattern())?;
    let mut searcher = Searcher::new();
    for path in sources {
        if policy.skips_build_script() && path.file_name().is_some_and(|name| name == "build.rs") {
            continue;
        }
        let mut collector = PolicyCollector::new(policy, path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let sources = rust_sources();
    for policy in Policy::ALL {
        if let Err(e) = enforce(policy, &sources) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
