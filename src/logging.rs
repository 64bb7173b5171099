//! Logger setup for the daemons.
use std::path::Path;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

/// Location of the logger configuration relative to the working directory.
pub const LOG_CONFIG_PATH: &str = "resources/log.yml";

const CONSOLE_PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l:<5})} {t} - {m}{n}";

/// Initializes log4rs from `path`, or with a console logger at info level if the file is missing.
pub fn init(path: &str) -> Result<(), String>
{
    if Path::new(path).exists() {
        return log4rs::init_file(path, Default::default()).map_err(|err| err.to_string());
    }

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))
        .map_err(|err| err.to_string())?;

    log4rs::init_config(config).map(|_| ()).map_err(|err| err.to_string())
}
