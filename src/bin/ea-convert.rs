//! ea-convert CLI - Command-line interface for the conversion pipeline
//!
//! Commands:
//! - convert: Align and chunk the raw sessions of a patient
//! - split / unsplit: Assign converted sessions to splits, or undo it
//! - label / clean: Write forecast labels, or remove augmented chunks
//! - audit: Report start times in ambiguous daylight-saving hours
//! - config: Print the effective configuration

use clap::{Parser, Subcommand};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use ea_convert::{Config, ConfigError, Pipeline, PipelineError, WindowParams, VERSION};

/// ea-convert - Wearable EDF recordings to seizure-forecasting chunks
#[derive(Parser)]
#[command(name = "ea-convert")]
#[command(version = VERSION)]
#[command(about = "Convert wearable EDF recordings into labeled hourly chunks", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data root holding edf/, chunks/, sztimes/ and artifacts/
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Worker threads for conversion
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Align and chunk every raw session of a patient
    Convert {
        /// Patient id
        patient_id: String,
    },

    /// Split converted sessions chronologically by size
    Split {
        /// Patient id
        patient_id: String,

        /// Split weights in split-name order, e.g. 0.6 0.2 0.2
        #[arg(required = true, num_args = 1..)]
        proportions: Vec<f64>,
    },

    /// Move split sessions back into the unsplit pool
    Unsplit {
        /// Patient id
        patient_id: String,
    },

    /// Label the chunks of every split against seizure onsets
    Label {
        /// Patient id
        patient_id: String,

        /// Forecast window in seconds
        #[arg(long)]
        forecast_window: Option<i64>,

        /// Gap between forecast window and onset in seconds
        #[arg(long)]
        setback: Option<i64>,

        /// Minimum spacing for a lead seizure in seconds
        #[arg(long)]
        lead_gap: Option<i64>,
    },

    /// Remove augmented chunks and their label rows
    Clean {
        /// Patient id
        patient_id: String,
    },

    /// Report start times in ambiguous daylight-saving hours
    Audit {
        /// Patient id; all registered patients when omitted
        patient_id: Option<String>,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), ConvertCliError> {
    let config = load_config(cli.config.as_deref(), cli.root.as_deref(), cli.workers)?;

    if let Commands::Config = cli.command {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    let pipeline = Pipeline::new(config)?;
    match cli.command {
        Commands::Convert { patient_id } => {
            let report = pipeline.convert(&patient_id)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Patient:   {}", report.patient_id);
                println!("Sessions:  {}", report.sessions);
                println!("Converted: {}", report.converted);
                println!("Chunks:    {}", report.chunks);
                println!("Dodgy:     {}", report.dodgy.len());
                for session in &report.dodgy {
                    println!("  {}", session.display());
                }
            }
        }
        Commands::Split {
            patient_id,
            proportions,
        } => {
            let assignment = pipeline.split(&patient_id, &proportions)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&assignment)?);
            } else {
                for (session, split) in &assignment {
                    println!("{} -> {}", session, split);
                }
            }
        }
        Commands::Unsplit { patient_id } => {
            let moved = pipeline.undo_split(&patient_id)?;
            println!("Moved {} sessions back into {}", moved, patient_id);
        }
        Commands::Label {
            patient_id,
            forecast_window,
            setback,
            lead_gap,
        } => {
            let defaults = WindowParams::from_config(pipeline.config());
            let params = WindowParams {
                forecast_window: forecast_window.unwrap_or(defaults.forecast_window),
                setback: setback.unwrap_or(defaults.setback),
                lead_gap: lead_gap.unwrap_or(defaults.lead_gap),
            };
            let labels = pipeline.label(&patient_id, Some(params))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&labels)?);
            } else {
                for split in &labels {
                    println!(
                        "{:<6} {} chunks, {} positive, {} augmented -> {}",
                        split.split,
                        split.records,
                        split.positives,
                        split.augmented,
                        split.path.display()
                    );
                }
            }
        }
        Commands::Clean { patient_id } => {
            let removed = pipeline.clean(&patient_id)?;
            println!("Removed {} augmented chunks", removed);
        }
        Commands::Audit { patient_id } => {
            let report = pipeline.audit(patient_id.as_deref())?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Ambiguous file start times:    {}", report.files.len());
                println!("Ambiguous seizure start times: {}", report.seizures.len());
            }
        }
        Commands::Config => {}
    }
    Ok(())
}

fn load_config(path: Option<&Path>, root: Option<&Path>, workers: Option<usize>) -> Result<Config, ConvertCliError> {
    let mut config = match path {
        Some(path) => Config::from_json(&fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    if let Some(root) = root {
        let rooted = Config::with_root(root);
        config.raw_root = rooted.raw_root;
        config.chunk_root = rooted.chunk_root;
        config.seizure_root = rooted.seizure_root;
        config.artifacts_root = rooted.artifacts_root;
    }
    if workers.is_some() {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
enum ConvertCliError {
    Io(io::Error),
    Json(serde_json::Error),
    Config(ConfigError),
    Pipeline(PipelineError),
}

impl From<io::Error> for ConvertCliError {
    fn from(e: io::Error) -> Self {
        ConvertCliError::Io(e)
    }
}

impl From<serde_json::Error> for ConvertCliError {
    fn from(e: serde_json::Error) -> Self {
        ConvertCliError::Json(e)
    }
}

impl From<ConfigError> for ConvertCliError {
    fn from(e: ConfigError) -> Self {
        ConvertCliError::Config(e)
    }
}

impl From<PipelineError> for ConvertCliError {
    fn from(e: PipelineError) -> Self {
        ConvertCliError::Pipeline(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn new(code: &str, message: String, hint: Option<&str>) -> Self {
        CliError {
            code: code.to_string(),
            message,
            hint: hint.map(str::to_string),
        }
    }
}

impl From<ConvertCliError> for CliError {
    fn from(e: ConvertCliError) -> Self {
        match e {
            ConvertCliError::Io(e) => CliError::new("IO_ERROR", e.to_string(), Some("Check file paths and permissions")),
            ConvertCliError::Json(e) => CliError::new("JSON_ERROR", e.to_string(), None),
            ConvertCliError::Config(e) => {
                CliError::new("CONFIG_ERROR", e.to_string(), Some("Run 'ea-convert config' to see the defaults"))
            }
            ConvertCliError::Pipeline(e) => {
                let message = e.to_string();
                match e {
                    PipelineError::UnknownPatient(_) => {
                        CliError::new("UNKNOWN_PATIENT", message, Some("Add the id to patient_ids in the configuration"))
                    }
                    PipelineError::NoRawData(_) => CliError::new("NO_RAW_DATA", message, Some("Check raw_root")),
                    PipelineError::NoConvertedData(_) => {
                        CliError::new("NO_CONVERTED_DATA", message, Some("Run 'ea-convert convert' first"))
                    }
                    PipelineError::AlreadySplit(_) => {
                        CliError::new("ALREADY_SPLIT", message, Some("Run 'ea-convert unsplit' first"))
                    }
                    PipelineError::MissingSplits { .. } => {
                        CliError::new("MISSING_SPLITS", message, Some("Run 'ea-convert split' first"))
                    }
                    PipelineError::MissingSeizures(_) => {
                        CliError::new("MISSING_SEIZURES", message, Some("Check seizure_root"))
                    }
                    PipelineError::InvalidProportions(_) => CliError::new("INVALID_PROPORTIONS", message, None),
                    PipelineError::InvalidWindow(_) => CliError::new("INVALID_WINDOW", message, None),
                    PipelineError::AlignmentFailed(_) | PipelineError::Align(_) => {
                        CliError::new("ALIGNMENT_FAILED", message, Some("Inspect the listed sessions"))
                    }
                    PipelineError::SessionCollision(_) => CliError::new("SESSION_COLLISION", message, None),
                    PipelineError::Config(_) => CliError::new("CONFIG_ERROR", message, None),
                    PipelineError::Chunk(_) | PipelineError::Store(_) => CliError::new("CHUNK_ERROR", message, None),
                    PipelineError::Csv { .. } => CliError::new("CSV_ERROR", message, None),
                    PipelineError::ThreadPool(_) => CliError::new("THREAD_POOL_ERROR", message, None),
                    PipelineError::Io { .. } => {
                        CliError::new("IO_ERROR", message, Some("Check file paths and permissions"))
                    }
                }
            }
        }
    }
}
