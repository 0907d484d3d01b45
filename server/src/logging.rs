//! Console logging: colored level tags, millisecond timestamps, one line per
//! record, filtered by the `--log-level` flag.

use colored::{ColoredString, Colorize};
use log::{Level, LevelFilter};

fn format_level(level: Level) -> ColoredString {
    match level {
        Level::Error => format!("[{level:5}]").bright_red().bold(),
        Level::Warn => format!("[{level:5}]").bright_yellow().bold(),
        Level::Info => format!("[{level:5}]").bright_green().bold(),
        Level::Debug => format!("[{level:5}]").bright_blue().bold(),
        Level::Trace => format!("[{level:5}]").bright_magenta().bold(),
    }
}

pub fn init_logging(level: &str) -> anyhow::Result<()> {
    let level_filter: LevelFilter = level
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid log level {level:?}"))?;

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {} {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                format_level(record.level()),
                record.target(),
                message
            ))
        })
        .level(level_filter)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}
