// src/runtime_interface.rs

use clap::{ArgAction, Args, Parser, Subcommand};
use std::fmt::Write;
use std::path::PathBuf;

use crate::error::RuntimeError;
use crate::onnx::{OnnxError, OnnxGraph};
use crate::pipeline;
use crate::settings::{ExportSettings, SettingsError};

#[derive(Parser, Debug)]
#[command(name = "seq2seq-onnx", author, version, about = "Export a pretrained seq2seq summarization model to ONNX")]
pub struct Cli {
    /// JSON settings file; CLI flags take precedence over it
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Trace the model on an example text and write an ONNX file (default)
    Export(ExportArgs),
    /// Print metadata and the operator histogram of an ONNX file
    Inspect { file: PathBuf },
}

#[derive(Args, Debug, Default, Clone)]
pub struct ExportArgs {
    #[arg(long)]
    pub model_id: Option<String>,
    #[arg(long)]
    pub tokenizer_id: Option<String>,
    /// Example text used as the dummy input
    #[arg(long)]
    pub text: Option<String>,
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    #[arg(long)]
    pub opset: Option<i64>,
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
    /// Only use files already in the hub cache
    #[arg(long)]
    pub offline: bool,
}

impl ExportArgs {
    fn apply(&self, settings: &mut ExportSettings) {
        if let Some(model_id) = &self.model_id {
            settings.model_id = model_id.clone();
        }
        if let Some(tokenizer_id) = &self.tokenizer_id {
            settings.tokenizer_id = Some(tokenizer_id.clone());
        }
        if let Some(text) = &self.text {
            settings.example_text = text.clone();
        }
        if let Some(output) = &self.output {
            settings.output_path = output.clone();
        }
        if let Some(opset) = self.opset {
            settings.opset_version = opset;
        }
        if let Some(cache_dir) = &self.cache_dir {
            settings.cache_dir = Some(cache_dir.clone());
        }
        if self.offline {
            settings.offline = true;
        }
    }
}

pub fn log_level(verbose: u8) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// Defaults, then the settings file, then CLI flags.
pub fn build_settings(config: Option<&PathBuf>, args: &ExportArgs) -> Result<ExportSettings, SettingsError> {
    let mut settings = match config {
        Some(path) => ExportSettings::load(path)?,
        None => ExportSettings::default(),
    };
    args.apply(&mut settings);
    Ok(settings)
}

pub fn format_inspection(graph: &OnnxGraph) -> Result<String, OnnxError> {
    let meta = graph.metadata()?;
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(out, "producer:     {} {}", meta.producer_name, meta.producer_version);
    let _ = writeln!(out, "ir_version:   {}", meta.ir_version);
    for (domain, version) in &meta.opsets {
        let domain = if domain.is_empty() { "ai.onnx" } else { domain.as_str() };
        let _ = writeln!(out, "opset:        {} v{}", domain, version);
    }
    if !meta.doc_string.is_empty() {
        let _ = writeln!(out, "doc_string:   {}", meta.doc_string);
    }
    let _ = writeln!(out, "nodes:        {}", meta.node_count);
    let _ = writeln!(out, "initializers: {}", meta.initializer_count);
    match graph.check() {
        Ok(()) => {
            let _ = writeln!(out, "runnable:     yes");
        }
        Err(e) => {
            let _ = writeln!(out, "runnable:     no ({})", e);
        }
    }
    for input in &meta.inputs {
        let _ = writeln!(out, "input:        {}", input);
    }
    for output in &meta.outputs {
        let _ = writeln!(out, "output:       {}", output);
    }
    let _ = writeln!(out, "operators:");
    for (op, count) in graph.op_histogram()? {
        let _ = writeln!(out, "  {:<12} {}", op, count);
    }
    Ok(out)
}

pub fn run(cli: Cli) -> Result<(), RuntimeError> {
    match cli.command {
        Some(Command::Inspect { file }) => {
            let graph = OnnxGraph::open(&file)?;
            print!("{}", format_inspection(&graph)?);
        }
        Some(Command::Export(args)) => export(cli.config.as_ref(), &args)?,
        None => export(cli.config.as_ref(), &ExportArgs::default())?,
    }
    Ok(())
}

fn export(config: Option<&PathBuf>, args: &ExportArgs) -> Result<(), RuntimeError> {
    let settings = build_settings(config, args)?;
    log::info!("exporting {} to {}", settings.model_id, settings.output_path.display());
    let summary = pipeline::run_export(&settings)?;
    println!("Model converted to ONNX and saved as {}", summary.path.display());
    Ok(())
}
