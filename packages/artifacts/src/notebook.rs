// ABOUTME: Jupyter notebook that walks through reproducing a job by hand
// ABOUTME: nbformat 4 JSON with clone, environment setup and run cells

use crate::{ArtifactError, ArtifactInput};
use reprobox_core::{ArtifactKind, EnvKind, EnvironmentInfo};
use serde_json::{json, Value};

/// Split text into the line list nbformat expects, keeping newlines
fn source_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(str::to_string).collect()
}

fn markdown_cell(text: &str) -> Value {
    json!({
        "cell_type": "markdown",
        "metadata": {},
        "source": source_lines(text),
    })
}

fn code_cell(code: &str, outputs: Vec<Value>) -> Value {
    json!({
        "cell_type": "code",
        "execution_count": null,
        "metadata": {},
        "outputs": outputs,
        "source": source_lines(code),
    })
}

fn stream_output(name: &str, text: &str) -> Value {
    json!({
        "name": name,
        "output_type": "stream",
        "text": source_lines(text),
    })
}

fn setup_code(env: &EnvironmentInfo) -> String {
    let manifest = env.detected_files.first().map(String::as_str);
    match env.kind {
        EnvKind::Pip if manifest == Some("requirements.txt") => {
            "!pip install -r requirements.txt".to_string()
        }
        EnvKind::Poetry => "!pip install poetry && poetry install --no-root --only main".to_string(),
        EnvKind::Pipenv => "!pip install pipenv && pipenv install --system".to_string(),
        EnvKind::Pip | EnvKind::Conda => {
            if env.dependencies.is_empty() {
                "# No dependencies declared".to_string()
            } else {
                let specs: Vec<String> = env
                    .dependencies
                    .iter()
                    .map(|d| format!("\"{}\"", d.to_requirement()))
                    .collect();
                format!("!pip install {}", specs.join(" "))
            }
        }
    }
}

pub fn render_notebook(input: &ArtifactInput<'_>) -> Result<String, ArtifactError> {
    let job = input.job;
    let run = input.run;

    let mut header = format!("# Reproducing `{}`\n\n", job.repo_url);
    if let Some(paper) = &job.paper_id {
        header.push_str(&format!("Paper: {}\n\n", paper));
    }
    header.push_str(&format!(
        "Generated from job `{}`. Run the cells in order.",
        job.id
    ));

    let mut cells = vec![
        markdown_cell(&header),
        markdown_cell("## Get the code"),
        code_cell(&format!("!git clone {} repo\n%cd repo", job.repo_url), vec![]),
    ];

    if let Some(env) = input.environment {
        let python = env
            .python_version
            .as_deref()
            .map(|v| format!(" Python {} was requested.", v))
            .unwrap_or_default();
        cells.push(markdown_cell(&format!(
            "## Environment setup\n\nDetected a {} environment from `{}`; the job ran on `{}`.{}",
            env.kind,
            env.detected_files.first().map(String::as_str).unwrap_or("?"),
            env.base_image,
            python
        )));
        cells.push(code_cell(&setup_code(env), vec![]));
    }

    let mut outputs = Vec::new();
    if !run.stdout_preview.is_empty() {
        outputs.push(stream_output("stdout", &run.stdout_preview));
    }
    if !run.stderr_preview.is_empty() {
        outputs.push(stream_output("stderr", &run.stderr_preview));
    }
    cells.push(markdown_cell("## Run"));
    cells.push(code_cell(&format!("!{}", input.command), outputs));

    let exit = match run.exit_code {
        Some(code) => format!("exited with code {}", code),
        None => "did not exit on its own".to_string(),
    };
    cells.push(markdown_cell(&format!(
        "The original run {} ({}).",
        exit,
        input.badge_status().label()
    )));

    let notebook = json!({
        "cells": cells,
        "metadata": {
            "kernelspec": {
                "display_name": "Python 3",
                "language": "python",
                "name": "python3",
            },
            "language_info": { "name": "python" },
            "reprobox": { "job_id": job.id },
        },
        "nbformat": 4,
        "nbformat_minor": 4,
    });

    serde_json::to_string_pretty(&notebook).map_err(|e| ArtifactError::Render {
        kind: ArtifactKind::Notebook,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_notebook_structure() {
        let job = fixtures::job();
        let run = fixtures::run(Some(1));
        let env = fixtures::environment();
        let text = render_notebook(&ArtifactInput {
            job: &job,
            run: &run,
            environment: Some(&env),
            error: None,
            command: "python train.py --epochs 1",
        })
        .unwrap();

        let doc: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["nbformat"], 4);
        assert_eq!(doc["metadata"]["kernelspec"]["name"], "python3");

        let cells = doc["cells"].as_array().unwrap();
        let clone = cells[2]["source"].as_array().unwrap();
        assert_eq!(
            clone[0],
            "!git clone https://github.com/example/paper-code repo\n"
        );

        let run_cell = cells
            .iter()
            .find(|c| c["source"][0] == "!python train.py --epochs 1")
            .unwrap();
        assert_eq!(run_cell["outputs"][0]["name"], "stdout");
        assert_eq!(run_cell["outputs"][0]["text"][0], "epoch 1 loss=0.42\n");

        let last = cells.last().unwrap()["source"][0].as_str().unwrap();
        assert!(last.contains("exited with code 1 (partial)"));
    }

    #[test]
    fn test_setup_code_per_manager() {
        let mut env = fixtures::environment();
        assert_eq!(setup_code(&env), "!pip install -r requirements.txt");

        env.kind = EnvKind::Conda;
        env.detected_files = vec!["environment.yml".into()];
        assert_eq!(setup_code(&env), "!pip install \"numpy==1.26.0\" \"torch\"");
    }
}
