pub mod backup;
pub mod license;
pub mod serve;

/// Common utilities for all commands
pub mod utils {
    use console::style;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    pub fn create_spinner(message: &str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .expect("Failed to create spinner template"),
        );
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn success(message: &str) {
        println!("{} {}", style("✓").green().bold(), style(message).green());
    }

    pub fn error(message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), style(message).red());
    }

    pub fn info(message: &str) {
        println!("{} {}", style("ℹ").blue().bold(), message);
    }

    pub fn warning(message: &str) {
        println!("{} {}", style("⚠").yellow().bold(), style(message).yellow());
    }
}
