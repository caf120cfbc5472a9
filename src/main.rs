use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dwiprep::check;
use dwiprep::cli::{CheckArgs, Command, OrganizeArgs, PackageArgs, RootArgs, TrainArgs};
use dwiprep::organize;
use dwiprep::package;
use dwiprep::sampler::SamplerConfig;
use dwiprep::train;

fn main() -> Result<()> {
    let args = RootArgs::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.logging.as_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Organize(args) => cmd_organize(args),
        Command::Package(args) => cmd_package(args),
        Command::Check(args) => cmd_check(args),
        Command::Train(args) => cmd_train(args),
    }
}

fn cmd_organize(args: OrganizeArgs) -> Result<()> {
    let summary = organize::run(&organize::OrganizeOptions {
        source_root: args.source,
        database: args.database,
        subjects_file: args.subjects,
        rules_file: args.rules,
        force: args.force,
    })?;
    println!(
        "Organized {} subject(s), skipped {} already present.",
        summary.organized.len(),
        summary.skipped.len()
    );
    Ok(())
}

fn cmd_package(args: PackageArgs) -> Result<()> {
    let summary = package::run(&package::PackageOptions {
        database: args.database_folder,
        config_file: args.config_file,
        training_subjects_file: args.training_subjs,
        validation_subjects_file: args.validation_subjs,
        name: args.name,
        std_masks: args.std_masks,
        space: args.space,
        step_size_mm: args.step_size,
        enforce_files_presence: args.enforce_files_presence,
        save_intermediate: args.save_intermediate,
        force: args.force,
    })?;
    println!(
        "Wrote {} with {} subject(s) and {} group(s).",
        summary.archive.display(),
        summary.subjects.len(),
        summary.groups.len()
    );
    Ok(())
}

fn cmd_check(args: CheckArgs) -> Result<()> {
    let report = check::run(&check::CheckOptions {
        archive: args.archive,
        config_file: args.config_file,
        training_subjects_file: args.training_subjs,
        validation_subjects_file: args.validation_subjs,
        sampler: SamplerConfig {
            batch_size: args.batch_size,
            units: args.batch_units,
            chunk_size: args.chunk_size,
            nb_subjects_per_batch: args.subjects_per_batch,
            cycles: args.cycles,
            seed: args.seed,
        },
    })?;

    if report.ok() {
        println!(
            "Archive OK: {} subject(s) checked, {} batch(es) sampled.",
            report.subjects_checked, report.batches_sampled
        );
        Ok(())
    } else {
        for failure in &report.failures {
            eprintln!("FAIL: {failure}");
        }
        eprintln!("{} check(s) failed.", report.failures.len());
        std::process::exit(1);
    }
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let code = train::run(&train::TrainOptions {
        experiments_root: args.experiments_root,
        hdf5_file: args.hdf5_filename,
        parameters_file: args.parameters_filename,
        experiment_name: args.experiment_name,
        trainer_cmd: args.trainer_cmd,
        force: args.force,
    })?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
