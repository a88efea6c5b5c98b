// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use console::{style, Term};

pub struct Output {
    term: Term,
}

impl Output {
    pub fn new() -> Self {
        Self {
            term: Term::stderr(),
        }
    }

    pub fn success(&self, msg: &str) {
        let _ = self
            .term
            .write_line(&format!("{} {}", style("✓").green().bold(), msg));
    }

    pub fn error(&self, msg: &str) {
        let _ = self
            .term
            .write_line(&format!("{} {}", style("✗").red().bold(), msg));
    }

    pub fn warn(&self, msg: &str) {
        let _ = self
            .term
            .write_line(&format!("{} {}", style("!").yellow().bold(), msg));
    }

    pub fn info(&self, msg: &str) {
        let _ = self.term.write_line(msg);
    }

    pub fn header(&self, msg: &str) {
        let _ = self.term.write_line(&format!("\n{}", style(msg).bold()));
    }

    pub fn field(&self, label: &str, value: &str) {
        let _ = self
            .term
            .write_line(&format!("  {}: {}", style(label).dim(), value));
    }

    pub fn key_field(&self, label: &str, value: &str) {
        let _ = self.term.write_line(&format!(
            "  {}: {}",
            style(label).dim(),
            style(value).yellow()
        ));
    }

    pub fn table_header(&self, cols: &[(&str, usize)]) {
        let header: String = cols
            .iter()
            .map(|(name, width)| format!("{:<width$}", style(*name).bold(), width = width))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = self.term.write_line(&format!("\n{}", header));
        let _ = self.term.write_line(&"─".repeat(70));
    }

    pub fn table_row(&self, cols: &[(&str, usize, bool)]) {
        let row: String = cols
            .iter()
            .map(|(val, width, highlight)| {
                if *highlight {
                    format!("{:<width$}", style(*val).yellow(), width = width)
                } else {
                    format!("{:<width$}", val, width = width)
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        let _ = self.term.write_line(&row);
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}
