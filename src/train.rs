//! Training hand-off.
//!
//! The pipeline does not train models itself. This stage validates the
//! inputs, prepares a per-run experiment directory, records exactly what is
//! about to run, then invokes the external trainer and propagates its exit
//! status.
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::util::{now_epoch_ms, sha256_file};

pub const PARAMETERS_FILE_NAME: &str = "parameters.yaml";
pub const INVOCATION_FILE_NAME: &str = "invocation.json";

/// Inputs for the train stage.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub experiments_root: PathBuf,
    pub hdf5_file: PathBuf,
    pub parameters_file: PathBuf,
    pub experiment_name: String,
    pub trainer_cmd: String,
    pub force: bool,
}

/// Manifest written next to the trainer's outputs before it starts.
#[derive(Debug, Serialize)]
struct Invocation {
    experiment_name: String,
    hdf5_file: String,
    hdf5_sha256: String,
    parameters_file: String,
    trainer_argv: Vec<String>,
    started_at_epoch_ms: u64,
}

/// Prepare the experiment directory and run the trainer.
///
/// Returns the trainer's exit code so the caller can propagate it.
pub fn run(options: &TrainOptions) -> Result<i32> {
    if !options.hdf5_file.is_file() {
        bail!("archive {} does not exist", options.hdf5_file.display());
    }
    validate_parameters(&options.parameters_file)?;
    let argv = resolve_trainer(&options.trainer_cmd)?;

    let experiment_dir = experiment_dir(options)?;
    let parameters = experiment_dir.join(PARAMETERS_FILE_NAME);
    fs::copy(&options.parameters_file, &parameters).with_context(|| {
        format!(
            "copy {} to {}",
            options.parameters_file.display(),
            parameters.display()
        )
    })?;

    let full_argv = trainer_argv(&argv, options, &parameters);
    write_invocation(&experiment_dir, options, &full_argv)?;

    tracing::info!(
        experiment = %options.experiment_name,
        trainer = %full_argv.join(" "),
        "starting trainer"
    );
    let status = Command::new(&full_argv[0])
        .args(&full_argv[1..])
        .current_dir(&experiment_dir)
        .status()
        .with_context(|| format!("spawn trainer {:?}", full_argv[0]))?;

    let code = status.code().unwrap_or(1);
    if code == 0 {
        tracing::info!(experiment = %options.experiment_name, "trainer finished");
    } else {
        tracing::warn!(experiment = %options.experiment_name, code, "trainer failed");
    }
    Ok(code)
}

fn validate_parameters(path: &Path) -> Result<()> {
    let content =
        fs::read_to_string(path).with_context(|| format!("read parameters {}", path.display()))?;
    let _: serde_yaml::Value = serde_yaml::from_str(&content)
        .with_context(|| format!("parameters file {} is not valid YAML", path.display()))?;
    Ok(())
}

/// Split the trainer command shell-style and resolve its program on PATH.
fn resolve_trainer(trainer_cmd: &str) -> Result<Vec<String>> {
    let mut argv = shell_words::split(trainer_cmd)
        .with_context(|| format!("parse trainer command {trainer_cmd:?}"))?;
    let program = argv
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("trainer command is empty"))?;

    let resolved = if program.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(&program);
        if !path.is_file() {
            bail!("trainer {} does not exist", path.display());
        }
        path
    } else {
        which::which(&program)
            .map_err(|err| anyhow!("trainer {program:?} not found on PATH: {err}"))?
    };
    argv[0] = resolved.to_string_lossy().into_owned();
    Ok(argv)
}

fn experiment_dir(options: &TrainOptions) -> Result<PathBuf> {
    // The name becomes a directory that may be removed under --force, so it
    // must stay a single plain component inside the experiments root.
    let name = options.experiment_name.as_str();
    let mut components = Path::new(name).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    );
    if name.is_empty() || !single_normal {
        bail!("invalid experiment name {name:?}: must be a plain directory name");
    }
    let dir = options.experiments_root.join(name);
    if dir.exists() {
        if !options.force {
            bail!(
                "experiment {} already exists (use --force to replace it)",
                dir.display()
            );
        }
        fs::remove_dir_all(&dir)
            .with_context(|| format!("remove previous experiment {}", dir.display()))?;
    }
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(dir)
}

fn trainer_argv(argv: &[String], options: &TrainOptions, parameters: &Path) -> Vec<String> {
    let mut full = argv.to_vec();
    full.push("--hdf5_filename".to_string());
    full.push(options.hdf5_file.display().to_string());
    full.push("--parameters_filename".to_string());
    full.push(parameters.display().to_string());
    full.push("--experiment_name".to_string());
    full.push(options.experiment_name.clone());
    full.push(options.experiments_root.display().to_string());
    full
}

fn write_invocation(dir: &Path, options: &TrainOptions, argv: &[String]) -> Result<()> {
    let invocation = Invocation {
        experiment_name: options.experiment_name.clone(),
        hdf5_file: options.hdf5_file.display().to_string(),
        hdf5_sha256: sha256_file(&options.hdf5_file)?,
        parameters_file: options.parameters_file.display().to_string(),
        trainer_argv: argv.to_vec(),
        started_at_epoch_ms: now_epoch_ms()?,
    };
    let path = dir.join(INVOCATION_FILE_NAME);
    fs::write(&path, serde_json::to_string_pretty(&invocation)?)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_fake_trainer(dir: &Path, exit_code: i32) -> PathBuf {
        let path = dir.join("fake_trainer.sh");
        fs::write(
            &path,
            format!("#!/bin/sh\necho \"$@\" > args.txt\nexit {exit_code}\n"),
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn base_options(dir: &Path, trainer: &Path) -> TrainOptions {
        let hdf5 = dir.join("dataset.hdf5");
        fs::write(&hdf5, b"not really hdf5, good enough for hand-off checks").unwrap();
        let parameters = dir.join("params.yaml");
        fs::write(&parameters, "model:\n  layers: 4\n").unwrap();
        TrainOptions {
            experiments_root: dir.join("experiments"),
            hdf5_file: hdf5,
            parameters_file: parameters,
            experiment_name: "exp1".to_string(),
            trainer_cmd: trainer.display().to_string(),
            force: false,
        }
    }

    #[test]
    fn runs_trainer_with_documented_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = write_fake_trainer(dir.path(), 0);
        let options = base_options(dir.path(), &trainer);

        let code = run(&options).unwrap();
        assert_eq!(code, 0);

        let experiment = options.experiments_root.join("exp1");
        let args = fs::read_to_string(experiment.join("args.txt")).unwrap();
        assert!(args.contains("--hdf5_filename"));
        assert!(args.contains("--experiment_name exp1"));
        assert!(args.contains(PARAMETERS_FILE_NAME));
        assert!(experiment.join(PARAMETERS_FILE_NAME).is_file());

        let invocation: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(experiment.join(INVOCATION_FILE_NAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(invocation["experiment_name"], "exp1");
        assert_eq!(invocation["hdf5_sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn propagates_trainer_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = write_fake_trainer(dir.path(), 3);
        let options = base_options(dir.path(), &trainer);
        assert_eq!(run(&options).unwrap(), 3);
    }

    #[test]
    fn existing_experiment_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = write_fake_trainer(dir.path(), 0);
        let options = base_options(dir.path(), &trainer);
        run(&options).unwrap();

        let err = run(&options).unwrap_err().to_string();
        assert!(err.contains("--force"));

        let forced = TrainOptions {
            force: true,
            ..options
        };
        assert_eq!(run(&forced).unwrap(), 0);
    }

    #[test]
    fn experiment_name_cannot_escape_the_experiments_root() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = write_fake_trainer(dir.path(), 0);
        let sibling = dir.path().join("precious.txt");
        fs::write(&sibling, "do not delete").unwrap();
        fs::create_dir_all(dir.path().join("experiments")).unwrap();

        for name in ["..", ".", "a/b", "/tmp/abs"] {
            let options = TrainOptions {
                experiment_name: name.to_string(),
                force: true,
                ..base_options(dir.path(), &trainer)
            };
            let err = run(&options).unwrap_err().to_string();
            assert!(err.contains("experiment name"), "accepted {name:?}");
        }
        assert!(sibling.is_file());
    }

    #[test]
    fn invalid_yaml_fails_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = write_fake_trainer(dir.path(), 0);
        let options = base_options(dir.path(), &trainer);
        fs::write(&options.parameters_file, "model: [unclosed\n").unwrap();

        let err = run(&options).unwrap_err();
        assert!(format!("{err:#}").contains("not valid YAML"));
        assert!(!options.experiments_root.join("exp1").exists());
    }

    #[test]
    fn unresolvable_trainer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = write_fake_trainer(dir.path(), 0);
        let mut options = base_options(dir.path(), &trainer);
        options.trainer_cmd = "definitely-not-a-real-trainer-binary".to_string();

        let err = run(&options).unwrap_err().to_string();
        assert!(err.contains("not found on PATH"));
    }
}
