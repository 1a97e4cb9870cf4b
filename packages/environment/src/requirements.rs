// ABOUTME: PEP 508 style requirement line parsing
// ABOUTME: Shared by requirements.txt, conda pip sections and PEP 621 dependency arrays

use regex::Regex;
use reprobox_core::Dependency;
use std::sync::LazyLock;
use tracing::debug;

static REQUIREMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?:\[[^\]]*\])?\s*(?P<spec>.*)$")
        .expect("requirement pattern is valid")
});

static VERSION_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(===|==|>=|<=|!=|~=|>|<)\s*[A-Za-z0-9.*+!_-]+$")
        .expect("version clause pattern is valid")
});

static EGG_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"#egg=(?P<name>[A-Za-z0-9][A-Za-z0-9._-]*)").expect("egg pattern is valid")
});

/// Parse a whole requirements file. Blank lines, comments, pip options and
/// local path installs are skipped.
pub fn parse_requirements(text: &str) -> Result<Vec<Dependency>, String> {
    let mut dependencies = Vec::new();
    let mut pending = String::new();

    for (number, raw) in text.lines().enumerate() {
        // Backslash continues a logical line
        if let Some(stripped) = raw.trim_end().strip_suffix('\\') {
            pending.push_str(stripped);
            pending.push(' ');
            continue;
        }
        pending.push_str(raw);
        let line = std::mem::take(&mut pending);

        match parse_requirement_line(&line) {
            Ok(Some(dep)) => dependencies.push(dep),
            Ok(None) => {}
            Err(e) => return Err(format!("line {}: {}", number + 1, e)),
        }
    }

    if !pending.trim().is_empty() {
        if let Some(dep) = parse_requirement_line(&pending)? {
            dependencies.push(dep);
        }
    }

    Ok(dependencies)
}

/// Parse one logical requirement line. `Ok(None)` means nothing to install.
pub fn parse_requirement_line(line: &str) -> Result<Option<Dependency>, String> {
    let line = strip_comment(line).trim();
    if line.is_empty() {
        return Ok(None);
    }

    // -r other.txt, -e ., --index-url ...
    if line.starts_with('-') {
        debug!("Skipping pip option line: {}", line);
        return Ok(None);
    }

    if line.starts_with('.') || line.starts_with('/') {
        debug!("Skipping local path requirement: {}", line);
        return Ok(None);
    }

    // git+https://...#egg=name
    if line.contains("://") && !line.contains(" @ ") && !line.contains('@') {
        return match EGG_NAME.captures(line) {
            Some(caps) => Ok(Some(Dependency::new(
                &caps["name"],
                Some(format!("@ {}", line)),
            ))),
            None => Err(format!("direct URL without a package name: {:?}", line)),
        };
    }

    // Drop environment markers and per-requirement options like --hash
    let line = line.split(';').next().unwrap_or_default();
    let line = line
        .split_whitespace()
        .take_while(|token| !token.starts_with("--"))
        .collect::<Vec<_>>()
        .join(" ");

    let caps = REQUIREMENT
        .captures(&line)
        .ok_or_else(|| format!("unparsable requirement {:?}", line))?;
    let name = caps["name"].to_string();
    let spec = caps["spec"].trim();

    if spec.is_empty() {
        return Ok(Some(Dependency::new(name, None)));
    }

    if let Some(url) = spec.strip_prefix('@') {
        let url = url.trim();
        if url.is_empty() {
            return Err(format!("empty direct reference for {}", name));
        }
        return Ok(Some(Dependency::new(name, Some(format!("@ {}", url)))));
    }

    let spec = spec.trim_start_matches('(').trim_end_matches(')');
    let mut clauses = Vec::new();
    for clause in spec.split(',') {
        let clause = clause.trim();
        if !VERSION_CLAUSE.is_match(clause) {
            return Err(format!("invalid version specifier {:?} for {}", clause, name));
        }
        clauses.push(clause.replace(' ', ""));
    }

    Ok(Some(Dependency::new(name, Some(clauses.join(",")))))
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    // An inline comment needs whitespace before the hash, so #egg= survives
    match line.find(" #").or_else(|| line.find("\t#")) {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dep(name: &str, version: Option<&str>) -> Dependency {
        Dependency::new(name, version.map(str::to_string))
    }

    #[test]
    fn test_parses_common_forms() {
        let text = "\
# core
numpy==1.26.0
pandas >= 2.0, <3  # data
torch~=2.1
scikit-learn
requests[security]>=2.31
typing-extensions; python_version < \"3.11\"
";
        assert_eq!(
            parse_requirements(text).unwrap(),
            vec![
                dep("numpy", Some("==1.26.0")),
                dep("pandas", Some(">=2.0,<3")),
                dep("torch", Some("~=2.1")),
                dep("scikit-learn", None),
                dep("requests", Some(">=2.31")),
                dep("typing-extensions", None),
            ]
        );
    }

    #[test]
    fn test_skips_options_and_local_paths() {
        let text = "-r base.txt\n--index-url https://pypi.org/simple\n-e .\n.\n./vendor/pkg\n\nrich\n";
        assert_eq!(parse_requirements(text).unwrap(), vec![dep("rich", None)]);
    }

    #[test]
    fn test_direct_references() {
        assert_eq!(
            parse_requirement_line("mylib @ https://example.com/mylib-1.0.tar.gz").unwrap(),
            Some(dep("mylib", Some("@ https://example.com/mylib-1.0.tar.gz")))
        );
        assert_eq!(
            parse_requirement_line("git+https://github.com/a/b.git#egg=bee").unwrap(),
            Some(dep("bee", Some("@ git+https://github.com/a/b.git#egg=bee")))
        );
        assert!(parse_requirement_line("git+https://github.com/a/b.git").is_err());
    }

    #[test]
    fn test_line_continuations_and_hashes() {
        let text = "flask==3.0.0 \\\n    --hash=sha256:abc \\\n    --hash=sha256:def\nclick\n";
        assert_eq!(
            parse_requirements(text).unwrap(),
            vec![dep("flask", Some("==3.0.0")), dep("click", None)]
        );
    }

    #[test]
    fn test_garbage_is_rejected_with_line_number() {
        let err = parse_requirements("numpy\n<<<<<<< HEAD\n").unwrap_err();
        assert!(err.starts_with("line 2"), "{}", err);

        assert!(parse_requirement_line("numpy==").is_err());
        assert!(parse_requirement_line("numpy = 1.0").is_err());
    }
}
