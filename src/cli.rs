use clap::{Parser, ValueEnum};

/// Log output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum TracingFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "aqmirror", about = "Mirrors the OpenAQ sensor network into a local store")]
pub struct Args {
    /// Tracing output format.
    #[arg(long, value_enum, default_value = "pretty")]
    pub tracing: TracingFormat,
}
