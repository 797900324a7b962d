use std::io::IsTerminal;

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanBytes, HumanCount, HumanDuration};
use rootpack_installer::{ArtifactOutcome, DaemonNotification, InstallReport};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

impl TerminalRenderer {
    pub(crate) fn current() -> Self {
        Self {
            style: current_output_style(),
        }
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.style, title) {
            println!("{line}");
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }
}

fn current_output_style() -> OutputStyle {
    if std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none() {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => {
            let badge = match status {
                "ok" => "[OK]",
                "warn" => "[WARN]",
                "err" => "[ERR]",
                _ => "[..]",
            };
            format!("{badge} {message}")
        }
    }
}

pub(crate) fn format_install_report(report: &InstallReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::with_capacity(report.artifacts.len() + 2);
    for artifact in &report.artifacts {
        let (status, message) = match artifact.outcome {
            ArtifactOutcome::Installed => ("ok", format!("installed {}", artifact.name)),
            ArtifactOutcome::AlreadyInstalled => {
                ("skip", format!("{} already installed", artifact.name))
            }
            ArtifactOutcome::Deferred => (
                "skip",
                format!("{} installed by a concurrent run", artifact.name),
            ),
        };
        lines.push(render_status_line(style, status, &message));
    }

    if let Some(DaemonNotification::NotRunning) = report.daemon {
        lines.push(render_status_line(
            style,
            "warn",
            "filesystem daemon not running; new packages appear after it starts",
        ));
    }

    let throughput = (report.mib_per_sec() * 1024.0 * 1024.0) as u64;
    lines.push(render_status_line(
        style,
        "ok",
        &format!(
            "{} packages installed, {} in {} ({}/s)",
            HumanCount(report.installed_count() as u64),
            HumanBytes(report.bytes),
            HumanDuration(report.elapsed),
            HumanBytes(throughput)
        ),
    ));
    lines
}
