use std::str::FromStr;

use tracing_subscriber::{filter::LevelFilter, prelude::*, Registry};

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

pub fn prepare_tracing(conf: &TraceConfig) {
    let level = LevelFilter::from_str(&conf.level).unwrap_or(LevelFilter::INFO);
    let json = conf.format == "json";

    match &conf.file {
        Some(path) => {
            let file = std::fs::File::create(path).expect("failed to create the log file");
            if json {
                Registry::default()
                    .with(tracing_subscriber::fmt::Layer::new().with_writer(file).json())
                    .with(level)
                    .init();
            } else {
                Registry::default()
                    .with(tracing_subscriber::fmt::Layer::new().with_writer(file))
                    .with(level)
                    .init();
            }
        }
        None => {
            if json {
                Registry::default()
                    .with(tracing_subscriber::fmt::Layer::new().with_ansi(true).json())
                    .with(level)
                    .init();
            } else {
                Registry::default()
                    .with(tracing_subscriber::fmt::Layer::new().with_ansi(true))
                    .with(level)
                    .init();
            }
        }
    }
}
