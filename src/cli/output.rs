use serde::Serialize;

use super::OutputFormat;
use crate::index::Suggestion;

/// One missing name with its fix candidates, as reported by `check`.
#[derive(Debug, Serialize)]
pub struct MissingReport {
    pub name: String,
    pub usage: String,
    pub suggestions: Vec<String>,
}

/// Format any serializable value as JSON.
pub fn format_json<T: Serialize>(value: &T, format: &OutputFormat) -> String {
    match format {
        OutputFormat::Json | OutputFormat::Text => {
            serde_json::to_string_pretty(value).unwrap_or_default()
        }
        OutputFormat::Compact => serde_json::to_string(value).unwrap_or_default(),
    }
}

pub fn format_missing(reports: &[MissingReport], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Json | OutputFormat::Compact => format_json(&reports, format),
        OutputFormat::Text => {
            if reports.is_empty() {
                return "No missing symbols".to_string();
            }
            let mut output = String::new();
            for report in reports {
                output.push_str(&format!("{} ({})\n", report.name, report.usage));
                for suggestion in &report.suggestions {
                    output.push_str(&format!("    {}\n", suggestion));
                }
                if report.suggestions.is_empty() {
                    output.push_str("    no candidates in index\n");
                }
            }
            output.trim_end().to_string()
        }
    }
}

pub fn format_suggestions(name: &str, suggestions: &[Suggestion], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Json | OutputFormat::Compact => format_json(&suggestions, format),
        OutputFormat::Text => {
            if suggestions.is_empty() {
                return format!("No candidates for {}", name);
            }
            let mut output = String::new();
            for s in suggestions {
                output.push_str(&format!(
                    "{:<50} {:<10} imported {} time(s)\n",
                    s.import_statement(),
                    s.symbol_type.to_string(),
                    s.import_count,
                ));
            }
            output.trim_end().to_string()
        }
    }
}

pub fn format_completions(entries: &[(String, u64)], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Json | OutputFormat::Compact => format_json(&entries, format),
        OutputFormat::Text => {
            let lines: Vec<String> = entries
                .iter()
                .map(|(name, weight)| format!("{:<40} {}", name, weight))
                .collect();
            lines.join("\n")
        }
    }
}

/// Format an indexing summary.
pub fn format_index_summary(files_updated: usize, format: &OutputFormat) -> String {
    match format {
        OutputFormat::Json | OutputFormat::Compact => {
            let summary = serde_json::json!({ "files_updated": files_updated });
            if matches!(format, OutputFormat::Json) {
                serde_json::to_string_pretty(&summary).unwrap_or_default()
            } else {
                serde_json::to_string(&summary).unwrap_or_default()
            }
        }
        OutputFormat::Text => format!("Updated {} file(s)", files_updated),
    }
}
