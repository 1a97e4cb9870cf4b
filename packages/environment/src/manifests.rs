// ABOUTME: Parsers for conda, pyproject and Pipfile manifests
// ABOUTME: Each returns dependencies plus any concrete Python version the manifest pins

use regex::Regex;
use reprobox_core::{Dependency, EnvKind};
use std::sync::LazyLock;

use crate::requirements::{parse_requirement_line, parse_requirements};

/// Dependencies and interpreter hint read from one manifest
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedManifest {
    pub kind: EnvKind,
    pub dependencies: Vec<Dependency>,
    pub python_version: Option<String>,
}

static CONDA_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?P<spec>.*)$")
        .expect("conda pattern is valid")
});

/// Leading major.minor of a constraint that pins an interpreter line.
/// Lower bounds such as `>=3.8` do not pin anything.
static PINNED_PYTHON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:==|~=|\^|~|=)?\s*(?P<major>\d+)\.(?P<minor>\d+)(?:[.*\d]*)$")
        .expect("python version pattern is valid")
});

/// Concrete `major.minor` from a Python constraint, if it names one
pub fn pinned_python_version(constraint: &str) -> Option<String> {
    let constraint = constraint.trim();
    let caps = PINNED_PYTHON.captures(constraint)?;
    Some(format!("{}.{}", &caps["major"], &caps["minor"]))
}

pub fn parse_requirements_txt(text: &str) -> Result<ParsedManifest, String> {
    Ok(ParsedManifest {
        kind: EnvKind::Pip,
        dependencies: parse_requirements(text)?,
        python_version: None,
    })
}

pub fn parse_environment_yml(text: &str) -> Result<ParsedManifest, String> {
    let doc: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    let mapping = doc
        .as_mapping()
        .ok_or_else(|| "environment.yml must be a mapping".to_string())?;

    let entries = match mapping.get("dependencies") {
        None | Some(serde_yaml::Value::Null) => return Ok(empty(EnvKind::Conda)),
        Some(serde_yaml::Value::Sequence(entries)) => entries,
        Some(_) => return Err("dependencies must be a list".to_string()),
    };

    let mut dependencies = Vec::new();
    let mut python_version = None;

    for entry in entries {
        match entry {
            serde_yaml::Value::String(spec) => {
                let (name, version) = parse_conda_spec(spec)?;
                match name.as_str() {
                    "python" => {
                        python_version = version.as_deref().and_then(pinned_python_version);
                    }
                    "pip" => {}
                    _ => dependencies.push(Dependency::new(name, version)),
                }
            }
            serde_yaml::Value::Mapping(section) => {
                let Some(pip) = section.get("pip") else {
                    continue;
                };
                let pip = pip
                    .as_sequence()
                    .ok_or_else(|| "pip section must be a list".to_string())?;
                for item in pip {
                    let line = item
                        .as_str()
                        .ok_or_else(|| "pip entries must be strings".to_string())?;
                    if let Some(dep) = parse_requirement_line(line)? {
                        dependencies.push(dep);
                    }
                }
            }
            other => return Err(format!("unsupported dependency entry: {:?}", other)),
        }
    }

    Ok(ParsedManifest {
        kind: EnvKind::Conda,
        dependencies,
        python_version,
    })
}

/// `[channel::]name[=version[=build]]` or `name<op>version` or `name version`
fn parse_conda_spec(raw: &str) -> Result<(String, Option<String>), String> {
    let spec = raw.rsplit("::").next().unwrap_or(raw).trim();
    let caps = CONDA_SPEC
        .captures(spec)
        .ok_or_else(|| format!("unparsable conda spec {:?}", raw))?;
    let name = caps["name"].to_string();
    let rest = caps["spec"].trim();

    if rest.is_empty() {
        return Ok((name, None));
    }

    let version = if let Some(single) = rest.strip_prefix('=').filter(|r| !r.starts_with('=')) {
        // Conda's single '=' is a fuzzy pin; a second '=' introduces a build string
        let version = single.split('=').next().unwrap_or_default().trim();
        if version.is_empty() {
            return Err(format!("empty version in conda spec {:?}", raw));
        }
        format!("=={}", version)
    } else if rest.starts_with(['=', '<', '>', '!', '~']) {
        rest.replace(' ', "")
    } else {
        format!("=={}", rest.split_whitespace().next().unwrap_or(rest))
    };

    Ok((name, Some(version)))
}

pub fn parse_pyproject_toml(text: &str) -> Result<ParsedManifest, String> {
    let doc: toml::Value = toml::from_str(text).map_err(|e| e.to_string())?;

    let poetry = doc.get("tool").and_then(|tool| tool.get("poetry"));
    if let Some(poetry) = poetry {
        let mut dependencies = Vec::new();
        let mut python_version = None;

        if let Some(table) = poetry.get("dependencies") {
            let table = table
                .as_table()
                .ok_or_else(|| "tool.poetry.dependencies must be a table".to_string())?;
            for (name, spec) in table {
                let version = table_version(spec);
                if name.eq_ignore_ascii_case("python") {
                    python_version = version.as_deref().and_then(pinned_python_version);
                    continue;
                }
                dependencies.push(Dependency::new(name.clone(), version));
            }
        }

        return Ok(ParsedManifest {
            kind: EnvKind::Poetry,
            dependencies,
            python_version,
        });
    }

    // PEP 621 projects install through pip
    let project = doc.get("project");
    let mut dependencies = Vec::new();
    if let Some(list) = project.and_then(|p| p.get("dependencies")) {
        let list = list
            .as_array()
            .ok_or_else(|| "project.dependencies must be an array".to_string())?;
        for item in list {
            let line = item
                .as_str()
                .ok_or_else(|| "project.dependencies entries must be strings".to_string())?;
            if let Some(dep) = parse_requirement_line(line)? {
                dependencies.push(dep);
            }
        }
    }

    let python_version = project
        .and_then(|p| p.get("requires-python"))
        .and_then(|v| v.as_str())
        .and_then(pinned_python_version);

    Ok(ParsedManifest {
        kind: EnvKind::Pip,
        dependencies,
        python_version,
    })
}

pub fn parse_pipfile(text: &str) -> Result<ParsedManifest, String> {
    let doc: toml::Value = toml::from_str(text).map_err(|e| e.to_string())?;

    let mut dependencies = Vec::new();
    if let Some(packages) = doc.get("packages") {
        let packages = packages
            .as_table()
            .ok_or_else(|| "[packages] must be a table".to_string())?;
        for (name, spec) in packages {
            dependencies.push(Dependency::new(name.clone(), table_version(spec)));
        }
    }

    let python_version = doc
        .get("requires")
        .and_then(|r| r.get("python_version").or_else(|| r.get("python_full_version")))
        .and_then(|v| v.as_str())
        .and_then(pinned_python_version);

    Ok(ParsedManifest {
        kind: EnvKind::Pipenv,
        dependencies,
        python_version,
    })
}

/// Version from a `name = "1.0"` or `name = { version = "1.0", ... }` entry.
/// `*` and git/path tables carry no version.
fn table_version(spec: &toml::Value) -> Option<String> {
    let raw = match spec {
        toml::Value::String(s) => Some(s.as_str()),
        toml::Value::Table(t) => t.get("version").and_then(|v| v.as_str()),
        _ => None,
    }?;
    let raw = raw.trim();
    if raw.is_empty() || raw == "*" {
        None
    } else {
        Some(raw.to_string())
    }
}

fn empty(kind: EnvKind) -> ParsedManifest {
    ParsedManifest {
        kind,
        dependencies: Vec::new(),
        python_version: None,
    }
}
