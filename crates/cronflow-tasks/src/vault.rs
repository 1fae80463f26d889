//! Markdown daily notes: one file per date, content organized in `## `
//! sections.

use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::info;

use cronflow_config::VaultConfig;

/// Writes sections into date-keyed notes under `<root>/<daily_folder>/`.
#[derive(Debug, Clone)]
pub struct DailyNoteVault {
    root: PathBuf,
    daily_folder: String,
}

impl DailyNoteVault {
    pub fn new(root: impl Into<PathBuf>, daily_folder: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            daily_folder: daily_folder.into(),
        }
    }

    /// `None` when no vault path is configured.
    pub fn from_config(config: &VaultConfig) -> Option<Self> {
        config
            .path
            .as_ref()
            .map(|root| Self::new(root.clone(), config.daily_folder.clone()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn note_path(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join(&self.daily_folder)
            .join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    /// Replace the `## header` section of the day's note, or append it.
    /// A missing note is created from the daily template.
    pub async fn write_section(
        &self,
        date: NaiveDate,
        header: &str,
        content: &str,
    ) -> io::Result<PathBuf> {
        let path = self.note_path(date);
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(doc) => doc,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                daily_template(date)
            }
            Err(e) => return Err(e),
        };

        let updated = upsert_section(&existing, header, content);
        tokio::fs::write(&path, updated).await?;
        info!(path = %path.display(), section = %header, "Daily note section written");
        Ok(path)
    }
}

/// Skeleton of a fresh daily note.
pub fn daily_template(date: NaiveDate) -> String {
    let day = date.format("%Y-%m-%d");
    format!("---\ndate: {day}\ntags: [daily]\n---\n\n# {day}\n")
}

/// Replace the body of the `## header` section up to the next heading of the
/// same or higher level, or append the section at the end.
pub fn upsert_section(doc: &str, header: &str, content: &str) -> String {
    let heading = format!("## {}", header.trim().trim_start_matches('#').trim());
    let section = format!("{heading}\n{}\n", content.trim_end());
    let lines: Vec<&str> = doc.lines().collect();

    let Some(start) = lines.iter().position(|l| l.trim_end() == heading) else {
        let mut out = doc.trim_end().to_string();
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&section);
        return out;
    };

    let end = lines[start + 1..]
        .iter()
        .position(|l| l.starts_with("## ") || l.starts_with("# "))
        .map_or(lines.len(), |i| start + 1 + i);

    let mut out = String::new();
    for line in &lines[..start] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&section);
    if end < lines.len() {
        out.push('\n');
        for line in &lines[end..] {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}
