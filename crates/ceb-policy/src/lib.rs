//! Static policy screening (C3): a coarse, language-aware deny list checked
//! against raw source text before any subprocess is spawned. This is a
//! *policy* gate, not a sandbox — it must never be relied upon for
//! containment, only for blocking obviously hostile submissions up front.

use std::sync::LazyLock;
use std::time::Duration;

use ceb_core::{LanguageId, PolicyVerdict};
use regex::Regex;
use sha2::{Digest, Sha256};

const MEMO_TTL: Duration = Duration::from_secs(5 * 60);
const MEMO_MAX_CAPACITY: u64 = 10_000;

struct Pattern {
    name: &'static str,
    regex: &'static LazyLock<Regex>,
}

macro_rules! pattern {
    ($name:literal, $re:literal) => {{
        static RE: LazyLock<Regex> = LazyLock::new(|| Regex::new($re).expect("valid pattern"));
        Pattern {
            name: $name,
            regex: &RE,
        }
    }};
}

/// Patterns that apply regardless of language: shell-out primitives, raw
/// system-file access roots, and backtick/command-substitution syntax that
/// has no legitimate use inside a submitted program body.
fn universal_patterns() -> Vec<Pattern> {
    vec![
        pattern!("shell-substitution", r"\$\([^)]*\)|`[^`]*`"),
        pattern!("etc-passwd-access", r"/etc/(passwd|shadow|sudoers)"),
        pattern!("proc-mem-access", r"/proc/\d+/(mem|maps)"),
        pattern!("dev-raw-disk", r"/dev/(sd[a-z]|nvme\d|mem|kmem)"),
    ]
}

/// Patterns specific to one language family — tokens associated with
/// process creation, raw syscalls, or reflective redefinition in that
/// language's standard library.
fn language_patterns(language: LanguageId) -> Vec<Pattern> {
    match language {
        LanguageId::Python => vec![
            pattern!("python-os-system", r"\bos\.(system|popen|exec[lv]p?e?)\b"),
            pattern!("python-subprocess", r"\bsubprocess\.(run|Popen|call|check_output)\b"),
            pattern!("python-dunder-import", r"__import__\s*\(\s*['\"]os['\"]"),
        ],
        LanguageId::Javascript | LanguageId::Typescript => vec![
            pattern!("node-child-process", r"require\(\s*['\"]child_process['\"]\s*\)"),
            pattern!("node-child-process-import", r#"from\s+['"]child_process['"]"#),
        ],
        LanguageId::Java => vec![pattern!(
            "java-runtime-exec",
            r"Runtime\.getRuntime\(\)\.exec|ProcessBuilder\s*\("
        )],
        LanguageId::C | LanguageId::Cpp => {
            vec![pattern!("c-system-call", r"\bsystem\s*\(|\bexecvp?e?\s*\(")]
        }
        LanguageId::Csharp => vec![pattern!(
            "dotnet-process-start",
            r"System\.Diagnostics\.Process\.Start"
        )],
        LanguageId::Rust => vec![pattern!(
            "rust-process-command",
            r"std::process::Command::new"
        )],
        LanguageId::Go => vec![pattern!("go-os-exec", r#"os/exec"|exec\.Command\("#)],
        LanguageId::Php => vec![pattern!(
            "php-shell-exec",
            r"\b(shell_exec|exec|system|passthru|popen)\s*\("
        )],
        LanguageId::Perl => vec![pattern!("perl-system", r"\bsystem\s*\(|`.*`")],
        LanguageId::Ruby => vec![pattern!(
            "ruby-kernel-exec",
            r"\bKernel#?\.(system|exec|spawn)\b|%x\{"
        )],
        LanguageId::Lua => vec![pattern!("lua-os-execute", r"os\.execute\s*\(")],
        LanguageId::Swift | LanguageId::Objc => {
            vec![pattern!("nstask-launch", r"NSTask|Process\(\)\.launch")]
        }
    }
}

fn digest(language: LanguageId, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(language.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Memoizing static screener. Cheap to clone — the memo cache is internally
/// `Arc`-backed by `moka`.
#[derive(Clone)]
pub struct PolicyScreener {
    memo: moka::sync::Cache<String, PolicyVerdict>,
}

impl Default for PolicyScreener {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyScreener {
    pub fn new() -> Self {
        Self {
            memo: moka::sync::Cache::builder()
                .max_capacity(MEMO_MAX_CAPACITY)
                .time_to_live(MEMO_TTL)
                .build(),
        }
    }

    /// Screen `code` for `language`. Memoized by `sha256(language || code)`
    /// for at least [`MEMO_TTL`].
    pub fn screen(&self, language: LanguageId, code: &str) -> PolicyVerdict {
        let key = digest(language, code);
        if let Some(cached) = self.memo.get(&key) {
            return cached;
        }

        let verdict = Self::evaluate(language, code);
        self.memo.insert(key, verdict.clone());
        verdict
    }

    fn evaluate(language: LanguageId, code: &str) -> PolicyVerdict {
        for pattern in universal_patterns()
            .into_iter()
            .chain(language_patterns(language))
        {
            if pattern.regex.is_match(code) {
                return PolicyVerdict::deny(pattern.name);
            }
        }
        PolicyVerdict::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_benign_python() {
        let screener = PolicyScreener::new();
        let verdict = screener.screen(LanguageId::Python, "print('Hello from Python!')");
        assert!(verdict.valid);
    }

    #[test]
    fn test_rejects_os_system() {
        let screener = PolicyScreener::new();
        let verdict = screener.screen(LanguageId::Python, "import os; os.system('ls')");
        assert!(!verdict.valid);
        assert_eq!(verdict.reason.as_deref(), Some("python-os-system"));
    }

    #[test]
    fn test_rejects_node_child_process() {
        let screener = PolicyScreener::new();
        let verdict = screener.screen(
            LanguageId::Javascript,
            "const { exec } = require('child_process'); exec('ls');",
        );
        assert!(!verdict.valid);
        assert_eq!(verdict.reason.as_deref(), Some("node-child-process"));
    }

    #[test]
    fn test_universal_pattern_applies_across_languages() {
        let screener = PolicyScreener::new();
        let verdict = screener.screen(LanguageId::Ruby, "puts `ls /etc`");
        assert!(!verdict.valid);
    }

    #[test]
    fn test_rust_code_flagging_command() {
        let screener = PolicyScreener::new();
        let code = "fn main() { std::process::Command::new(\"ls\").spawn().unwrap(); }";
        let verdict = screener.screen(LanguageId::Rust, code);
        assert!(!verdict.valid);
        assert_eq!(verdict.reason.as_deref(), Some("rust-process-command"));
    }

    #[test]
    fn test_memoization_is_keyed_by_language_and_code() {
        let screener = PolicyScreener::new();
        let py = screener.screen(LanguageId::Python, "print(1)");
        let rb = screener.screen(LanguageId::Ruby, "print(1)");
        assert!(py.valid && rb.valid);
        // Same code, different language: independent cache entries, but
        // identical verdicts here since "print(1)" is benign for both.
        assert_eq!(py, rb);
    }

    #[test]
    fn test_digest_differs_by_language() {
        let a = digest(LanguageId::Python, "x");
        let b = digest(LanguageId::Ruby, "x");
        assert_ne!(a, b);
    }
}
