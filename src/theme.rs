//! Color theming for CLI output.
//!
//! Colors can be disabled globally via the `--no-color` flag or the
//! `NO_COLOR` environment variable; every styling method then returns the
//! text unchanged.
//!
//! ```ignore
//! use crate::theme::Themed;
//! println!("{} {}", "Server:".label(), config.server_name.name());
//! ```

use owo_colors::OwoColorize;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

/// Global color enable flag (respects NO_COLOR and --no-color).
static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all colors globally. Call early in main().
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

fn paint<T: Display + ?Sized>(text: &T, style: impl FnOnce(&T) -> String) -> String {
    if colors_enabled() {
        style(text)
    } else {
        text.to_string()
    }
}

/// Semantic styles for terminal output.
pub trait Themed: Display {
    /// Section headers (bold + underline).
    fn section_header(&self) -> String {
        paint(self, |t| t.bold().underline().to_string())
    }

    /// Labels and field names (yellow).
    fn label(&self) -> String {
        paint(self, |t| t.yellow().to_string())
    }

    /// Names of servers, workers, modules and backends (cyan).
    fn name(&self) -> String {
        paint(self, |t| t.cyan().to_string())
    }

    /// Counts and other numbers (cyan).
    fn count(&self) -> String {
        paint(self, |t| t.cyan().to_string())
    }

    /// Success messages (green + bold).
    fn success(&self) -> String {
        paint(self, |t| t.green().bold().to_string())
    }

    /// Secondary text (dimmed).
    fn muted(&self) -> String {
        paint(self, |t| t.dimmed().to_string())
    }
}

impl Themed for String {}
impl Themed for &str {}
impl Themed for u16 {}
impl Themed for u64 {}
impl Themed for usize {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_colors_return_plain_text() {
        disable_colors();
        assert!(!colors_enabled());
        assert_eq!("Server:".label(), "Server:");
        assert_eq!(3usize.count(), "3");
        assert_eq!(String::from("ok").success(), "ok");
    }
}
