//! Structured, colored logging setup shared by every binary embedding this
//! crate, available as a standalone initializer rather than tied to opening
//! any one particular kind of socket.

use colored::Color;
use fern::colors::ColoredLevelConfig;

/// Installs a `fern` dispatcher that writes leveled, colored, timestamped
/// records to stdout. Safe to call more than once; later calls are no-ops
/// (fern returns an error if a global logger is already set, which we
/// discard).
pub fn init() {
    let colors_line = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::White)
        .debug(Color::Green)
        .trace(Color::Blue);

    let _ = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{}{}[{}][{}] {}",
                format_args!("\x1B[{}m", colors_line.get_color(&record.level()).to_fg_str()),
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Debug)
        .chain(std::io::stdout())
        .apply();
}
