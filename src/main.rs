use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use log::LevelFilter;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use face_feature_processor::cli::Args;
use face_feature_processor::face_analysis::batch::{
    default_worker_count, BatchOptions, BatchResult, BatchRunner,
};
use face_feature_processor::face_analysis::report::BatchReport;
use face_feature_processor::face_analysis::sidecar::{SidecarCommand, SidecarHandle};
use face_feature_processor::face_analysis::{discover_images, AnalysisStatus, FaceAnalyzer};
use face_feature_processor::json_output::JsonMessage;
use face_feature_processor::utils::{
    create_progress_bar, error_println, format_duration, validate_inputs, verbose_println,
    warn_println,
};

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

/// Write the result table as pretty JSON
fn write_table(batch: &BatchResult, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create output file: {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &batch.to_table())
        .with_context(|| format!("Failed to write result table: {}", path.display()))?;
    Ok(())
}

fn file_label(identifier: &str) -> String {
    Path::new(identifier)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(identifier)
        .to_string()
}

fn main() -> Result<()> {
    let mut args = Args::parse();
    init_logging(args.verbose);
    let json = args.json_progress;
    let verbose = args.verbose && !json;

    let config = args.load_and_merge_config()?;
    validate_inputs(&args)?;

    if !json {
        println!("{}", style("Face Feature Processor").bold().blue());
        println!("{}", style("Landmark geometry at batch scale").dim());
        println!();
    }

    let image_files: Vec<PathBuf> = discover_images(&args.input_paths, &args.extensions())?;
    if image_files.is_empty() {
        if json {
            JsonMessage::summary(&BatchResult::default()).emit();
        } else {
            println!(
                "{}",
                style("No images found with specified extensions").red()
            );
        }
        return Ok(());
    }

    if args.validate_only {
        if !json {
            println!(
                "{}",
                style(format!("✓ Found {} images", image_files.len())).green()
            );
            for path in &image_files {
                println!("  {}", path.display());
            }
        }
        return Ok(());
    }

    let command = SidecarCommand::parse(args.sidecar.as_deref().unwrap_or_default())?;
    let workers = if args.jobs == 0 {
        default_worker_count()
    } else {
        args.jobs
    };

    if verbose {
        println!("{}", style("Configuration:").bold());
        println!("  Images: {}", image_files.len());
        println!("  Workers: {}", workers);
        println!("  Sidecar: {} {}", command.program, command.args.join(" "));
        match args.unit_timeout() {
            Some(timeout) => println!("  Per-image timeout: {}", format_duration(timeout)),
            None => println!("  Per-image timeout: none"),
        }
        println!("  Detector upsample: {}", config.detect_upsample);
        println!(
            "  Aligned crop: {}px, padding {:.2}",
            config.align_target_size, config.align_padding
        );
        println!(
            "  Enhancement: bilateral={} (d={}, σc={}, σs={}), illumination={}, grayscale={}",
            config.apply_bilateral_filter,
            config.bilateral_diameter,
            config.bilateral_sigma_color,
            config.bilateral_sigma_space,
            config.apply_illumination_norm,
            config.apply_grayscale
        );
        println!();
    }

    let identifiers: Vec<String> = image_files
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let total = identifiers.len();

    let progress = create_progress_bar(total as u64)?;
    if json {
        progress.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }
    progress.set_message("Analyzing faces");

    let runner = BatchRunner::new(BatchOptions {
        workers,
        unit_timeout: args.unit_timeout(),
        keep_images: false,
    })
    .with_progress(|result, batch_progress| {
        if json {
            JsonMessage::for_result(result).emit();
            JsonMessage::progress(
                batch_progress.completed,
                batch_progress.total,
                result.image_identifier.as_str(),
            );
        } else {
            progress.set_position(batch_progress.completed as u64);
            let label = file_label(&result.image_identifier);
            match batch_progress.eta() {
                Some(eta) if batch_progress.completed < batch_progress.total => {
                    progress.set_message(format!("{} (eta {})", label, format_duration(eta)))
                }
                _ => progress.set_message(label),
            }
        }
    });

    let batch = runner.run(&identifiers, || {
        let handle = SidecarHandle::spawn(&command)?;
        Ok(FaceAnalyzer::new(handle.clone(), handle, config.clone())?)
    })?;
    progress.finish_with_message("✓ Analysis complete!");

    if let Some(output) = &args.output {
        write_table(&batch, output)?;
        if !json {
            verbose_println(verbose, &format!("Result table written to {}", output.display()));
        }
    }

    if json {
        JsonMessage::summary(&batch).emit();
        return Ok(());
    }

    println!();
    println!("{}", style("Results Summary:").bold().green());
    println!(
        "  Successful: {}",
        style(batch.count(AnalysisStatus::Success)).bold().green()
    );
    for (status, count) in batch.status_counts() {
        if status != AnalysisStatus::Success {
            println!("  {}: {}", status, style(count).bold().yellow());
        }
    }

    println!();
    println!("{}", style("Performance:").bold().blue());
    println!(
        "  Total processing time: {}",
        style(format_duration(batch.elapsed())).bold()
    );
    println!(
        "  Average time per image: {}",
        style(format_duration(batch.elapsed() / total as u32)).dim()
    );

    if let Some(output) = &args.output {
        println!();
        println!("{}", style("Output file:").bold().green());
        println!("  {}", output.display());
    } else {
        println!();
        warn_println("No --output given; the feature table was not saved");
    }

    if args.report {
        BatchReport::new(&batch).print();
    } else if !batch.failures().is_empty() {
        println!();
        println!("{}", style("Errors encountered:").bold().red());
        for (i, failure) in batch.failures().iter().enumerate() {
            error_println(&format!(
                "{}: {} - {}",
                style(format!("#{}", i + 1)).dim(),
                style(file_label(&failure.identifier)).bold().red(),
                failure.detail
            ));
        }
        println!("  Check image files and try again with --verbose for more details");
    }

    Ok(())
}
